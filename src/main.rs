use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use notify_rust::Notification;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tabled::{Table, Tabled};

use whr::{config, Appliance, Auth, ChangeCallback};

#[derive(Parser)]
#[command(name = "whr")]
#[command(about = "A CLI for controlling Whirlpool cloud-connected appliances")]
#[command(version)]
struct Cli {
    /// Username for the Whirlpool account
    #[arg(long, env = "WHR_USERNAME")]
    username: Option<String>,

    /// Password for the Whirlpool account (prompted if omitted)
    #[arg(long, env = "WHR_PASSWORD")]
    password: Option<String>,

    /// Save the resulting tokens to ~/.whr.yml
    #[arg(long)]
    save: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all appliances connected to the account
    Appliances,
    /// Read a single attribute value from an appliance
    Get {
        /// Appliance identifier (optional if only one appliance)
        #[arg(long)]
        said: Option<String>,
        attribute: String,
    },
    /// Set an attribute on an appliance
    Set {
        /// Appliance identifier (optional if only one appliance)
        #[arg(long)]
        said: Option<String>,
        attribute: String,
        value: String,
    },
    /// Stream live attribute changes from an appliance
    Watch {
        /// Appliance identifier (optional if only one appliance)
        #[arg(long)]
        said: Option<String>,
        /// Send a desktop notification for each change
        #[arg(long)]
        notify: bool,
    },
    /// Clear stored credentials
    Logout,
}

#[derive(Tabled)]
struct ApplianceRow {
    #[tabled(rename = "SAID")]
    said: String,
    #[tabled(rename = "Name")]
    name: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    if matches!(cli.command, Commands::Logout) {
        config::clear_credentials()?;
        println!("Stored credentials cleared.");
        return Ok(());
    }

    let username = cli.username.ok_or_else(|| {
        anyhow::anyhow!(
            "Username is required. Provide via --username or WHR_USERNAME environment variable."
        )
    })?;

    let auth = Arc::new(login(&username, cli.password, cli.save).await?);

    match cli.command {
        Commands::Appliances => {
            let saids = auth.get_said_list().unwrap_or_default();
            if saids.is_empty() {
                println!("No appliances found for this account.");
                return Ok(());
            }

            let mut rows: Vec<ApplianceRow> = Vec::new();

            for said in &saids {
                let mut appliance = Appliance::new(Arc::clone(&auth), said, None);
                appliance.start_http_session()?;

                let name = appliance.fetch_name().await.unwrap_or(None);
                rows.push(ApplianceRow {
                    said: said.clone(),
                    name: name.unwrap_or_else(|| "Unknown".to_string()),
                });
            }

            let table = Table::new(&rows);
            println!("{}", table);
        }
        Commands::Get { said, attribute } => {
            let said = resolve_said(&auth, said)?;

            let mut appliance = Appliance::new(Arc::clone(&auth), &said, None);
            appliance.start_http_session()?;

            if !appliance.fetch_attributes().await? {
                return Err(anyhow::anyhow!("Failed to fetch attributes for {}", said));
            }

            let value = appliance.get_attribute(&attribute)?;
            println!("{}", value);
        }
        Commands::Set {
            said,
            attribute,
            value,
        } => {
            let said = resolve_said(&auth, said)?;

            let mut appliance = Appliance::new(Arc::clone(&auth), &said, None);
            appliance.start_http_session()?;

            let mut attributes = HashMap::new();
            attributes.insert(attribute.clone(), value);

            info!("Setting {} on {}", attribute, said);
            if appliance.send_attributes(attributes).await? {
                println!("Attribute {} set successfully.", attribute);
            } else {
                return Err(anyhow::anyhow!("Failed to set attribute {}", attribute));
            }
        }
        Commands::Watch { said, notify } => {
            let said = resolve_said(&auth, said)?;

            let spinner = ProgressBar::new_spinner();
            spinner.set_style(
                ProgressStyle::default_spinner()
                    .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ")
                    .template("{spinner:.green} {msg}")
                    .unwrap(),
            );
            spinner.enable_steady_tick(Duration::from_millis(100));
            spinner.set_message(format!("Connecting to {}...", said));

            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            let callback: ChangeCallback = Arc::new(move || {
                let _ = tx.send(());
            });

            let mut appliance = Appliance::new(Arc::clone(&auth), &said, Some(callback));
            appliance.connect().await?;

            spinner.finish_with_message(format!(
                "Connected to {}. Watching for attribute changes (Ctrl-C to stop)...",
                said
            ));

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    changed = rx.recv() => {
                        if changed.is_none() {
                            break;
                        }
                        println!("Attributes updated on {}", said);
                        if notify {
                            if let Err(e) = Notification::new()
                                .summary("Whirlpool appliance update")
                                .body(&format!("Attributes changed on {}", said))
                                .timeout(5000)
                                .show()
                            {
                                warn!("Failed to send notification: {}", e);
                            }
                        }
                    }
                }
            }

            appliance.disconnect().await;
        }
        Commands::Logout => unreachable!(),
    }

    Ok(())
}

/// Authenticate, preferring stored credentials when no password was given.
async fn login(username: &str, password: Option<String>, save: bool) -> Result<Auth> {
    if let Some(password) = password {
        let auth = Auth::new(username, &password);
        info!("Authenticating with Whirlpool...");
        auth.do_auth(save).await?;
        return ensure_valid(auth);
    }

    let stored = Auth::new(username, "");
    if stored.try_restore() {
        info!("Using stored credentials");
        return Ok(stored);
    }

    let password = rpassword::prompt_password("Password: ")?;
    let auth = Auth::new(username, &password);
    info!("Authenticating with Whirlpool...");
    auth.do_auth(save).await?;
    ensure_valid(auth)
}

fn ensure_valid(auth: Auth) -> Result<Auth> {
    if auth.is_access_token_valid() {
        Ok(auth)
    } else {
        Err(anyhow::anyhow!(
            "Authentication failed. Check your username and password."
        ))
    }
}

/// Pick the appliance to operate on, mirroring the account's said list
/// when none was given explicitly.
fn resolve_said(auth: &Auth, said: Option<String>) -> Result<String> {
    match said {
        Some(said) => Ok(said),
        None => {
            let saids = auth
                .get_said_list()
                .ok_or_else(|| anyhow::anyhow!("Not authenticated."))?;
            if saids.is_empty() {
                return Err(anyhow::anyhow!("No appliances found for this account."));
            }
            if saids.len() > 1 {
                return Err(anyhow::anyhow!(
                    "Multiple appliances found. Please specify --said."
                ));
            }
            Ok(saids[0].clone())
        }
    }
}
