use dirs::home_dir;
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::auth::TokenState;
use crate::error::{Error, Result};

/// Path to the credential file (~/.whr.yml)
pub fn get_credentials_path() -> Result<PathBuf> {
    let home = home_dir().ok_or_else(|| {
        Error::Config("Failed to determine home directory".to_string())
    })?;
    Ok(home.join(".whr.yml"))
}

/// Load stored credentials from ~/.whr.yml.
///
/// A missing file is not an error: it means nothing was ever stored.
pub fn load_credentials() -> Result<Option<TokenState>> {
    load_credentials_from(&get_credentials_path()?)
}

pub fn load_credentials_from(path: &Path) -> Result<Option<TokenState>> {
    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(path)?;
    let state: TokenState = serde_yaml::from_str(&content)?;

    debug!("Loaded stored credentials from {}", path.display());
    Ok(Some(state))
}

/// Save credentials to ~/.whr.yml.
pub fn save_credentials(state: &TokenState) -> Result<()> {
    save_credentials_to(state, &get_credentials_path()?)
}

pub fn save_credentials_to(state: &TokenState, path: &Path) -> Result<()> {
    let content = serde_yaml::to_string(state)?;
    fs::write(path, content)?;

    debug!("Saved credentials to {}", path.display());
    Ok(())
}

/// Remove the credential file (logout).
pub fn clear_credentials() -> Result<()> {
    let path = get_credentials_path()?;

    if path.exists() {
        fs::remove_file(&path)?;
        debug!("Credential file cleared");
    } else {
        warn!("Credential file does not exist, nothing to clear");
    }

    Ok(())
}
