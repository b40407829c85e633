use chrono::{DateTime, Duration, Utc};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

use crate::config;
use crate::error::Result;

const DEFAULT_BASE_URL: &str = "https://api.whrcloud.com";

// Deployment constants for the password grant. These identify the mobile
// app to the vendor and are not user input.
const CLIENT_ID: &str = "whirlpool_android";
const CLIENT_SECRET: &str =
    "i-eQ8MD4jK4-9DUCbktfg-t_7gvU-SrRstPRGAYnfBPSrHHt5Mc0MFmYymU2E2qzif5cMaBYwFyFgSU6NTWjZg";

/// Form body of the token request. Field order is the wire order.
#[derive(Serialize)]
struct TokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    grant_type: &'a str,
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub scope: String,
    #[serde(rename = "accountId")]
    pub account_id: i64,
    #[serde(rename = "SAID")]
    pub said_list: Vec<String>,
    pub jti: String,
}

#[derive(Deserialize)]
pub struct ErrorResponse {
    pub error: Option<String>,
    pub error_description: Option<String>,
    pub code: Option<String>,
}

/// Complete token state from one successful authentication.
///
/// Either all of this exists (valid) or none of it does -- the coordinator
/// never holds a partially-filled state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenState {
    pub access_token: String,
    pub token_type: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub scope: String,
    pub account_id: i64,
    pub said_list: Vec<String>,
    pub jti: String,
}

/// Coordinates token acquisition against the vendor OAuth endpoint.
///
/// One instance is shared by every [`Appliance`](crate::Appliance) that
/// belongs to the same user login. Readers always observe a consistent
/// snapshot: the state is swapped whole under a lock, never mutated
/// field by field.
pub struct Auth {
    base_url: String,
    username: String,
    password: String,
    token_state: RwLock<Option<TokenState>>,
    // Serializes authentication: one in-flight token request per coordinator.
    auth_guard: tokio::sync::Mutex<()>,
}

impl Auth {
    pub fn new(username: &str, password: &str) -> Self {
        Self::new_with_base_url(username, password, DEFAULT_BASE_URL.to_string())
    }

    // Test-specific constructor for custom base URLs
    pub fn new_with_base_url(username: &str, password: &str, base_url: String) -> Self {
        Self {
            base_url,
            username: username.to_string(),
            password: password.to_string(),
            token_state: RwLock::new(None),
            auth_guard: tokio::sync::Mutex::new(()),
        }
    }

    /// Request an access token with the password grant.
    ///
    /// A rejected login (non-200 or malformed body) is a normal outcome:
    /// the token state is cleared, the vendor error is logged, and `Ok(())`
    /// is returned -- check [`is_access_token_valid`](Self::is_access_token_valid)
    /// afterwards. Only connection-level transport failures return `Err`.
    /// `store == true` persists the resulting state via the credential store.
    pub async fn do_auth(&self, store: bool) -> Result<()> {
        let _in_flight = self.auth_guard.lock().await;

        // Scoped client for the token request, dropped on every exit path.
        let client = reqwest::Client::new();

        let request = TokenRequest {
            client_id: CLIENT_ID,
            client_secret: CLIENT_SECRET,
            grant_type: "password",
            username: &self.username,
            password: &self.password,
        };

        debug!("Requesting access token for user: {}", self.username);

        let response = client
            .post(format!("{}/oauth/token", self.base_url))
            .header("Brand", "Whirlpool")
            .header("WP-CLIENT-REGION", "EMEA")
            .header("WP-CLIENT-BRAND", "WHIRLPOOL")
            .header("WP-CLIENT-COUNTRY", "EN")
            .form(&request)
            .send()
            .await?;

        let status = response.status();
        let response_text = response.text().await?;

        if status.is_success() {
            match serde_json::from_str::<TokenResponse>(&response_text) {
                Ok(token_response) => {
                    let state = TokenState {
                        access_token: token_response.access_token,
                        token_type: token_response.token_type,
                        refresh_token: token_response.refresh_token,
                        expires_at: Utc::now() + Duration::seconds(token_response.expires_in),
                        scope: token_response.scope,
                        account_id: token_response.account_id,
                        said_list: token_response.said_list,
                        jti: token_response.jti,
                    };

                    debug!("Authentication successful for user: {}", self.username);

                    if store {
                        if let Err(e) = config::save_credentials(&state) {
                            warn!("Failed to save credentials: {}", e);
                        }
                    }

                    *self.token_state.write().unwrap() = Some(state);
                }
                Err(e) => {
                    error!("Failed to parse token response: {}", e);
                    *self.token_state.write().unwrap() = None;
                }
            }
        } else {
            match serde_json::from_str::<ErrorResponse>(&response_text) {
                Ok(err) => error!(
                    "Authentication failed ({}): {} - {} (code {})",
                    status,
                    err.error.as_deref().unwrap_or("unknown"),
                    err.error_description.as_deref().unwrap_or(""),
                    err.code.as_deref().unwrap_or("")
                ),
                Err(_) => error!("Authentication failed ({}): {}", status, response_text),
            }
            *self.token_state.write().unwrap() = None;
        }

        Ok(())
    }

    /// Whether a non-empty access token is currently held.
    ///
    /// Presence check only: `expires_at` is stored but not consulted.
    pub fn is_access_token_valid(&self) -> bool {
        self.token_state
            .read()
            .unwrap()
            .as_ref()
            .map(|state| !state.access_token.is_empty())
            .unwrap_or(false)
    }

    pub fn get_access_token(&self) -> Option<String> {
        self.token_state
            .read()
            .unwrap()
            .as_ref()
            .map(|state| state.access_token.clone())
    }

    /// Device identifiers associated with the account, in response order.
    /// `None` until a successful authentication.
    pub fn get_said_list(&self) -> Option<Vec<String>> {
        self.token_state
            .read()
            .unwrap()
            .as_ref()
            .map(|state| state.said_list.clone())
    }

    pub fn get_account_id(&self) -> Option<i64> {
        self.token_state
            .read()
            .unwrap()
            .as_ref()
            .map(|state| state.account_id)
    }

    /// Seed the token state from the credential store, if one was saved.
    ///
    /// Returns whether a stored state was installed. Load failures are
    /// logged and treated as "nothing stored".
    pub fn try_restore(&self) -> bool {
        match config::load_credentials() {
            Ok(Some(state)) => {
                debug!("Restored stored credentials for account {}", state.account_id);
                *self.token_state.write().unwrap() = Some(state);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Failed to load stored credentials: {}", e);
                false
            }
        }
    }
}
