use crate::error::{AppError, AppResult};
use keyring::Entry;

const SERVICE_NAME: &str = "sshbridge";

/// Store a secret in the OS keychain
pub fn store_secret(key: &str, secret: &str) -> AppResult<()> {
    let entry = Entry::new(SERVICE_NAME, key)?;
    entry.set_password(secret)?;
    tracing::debug!("Stored secret in OS keychain: {}", key);
    Ok(())
}

/// Look up a secret; `None` when no entry exists
pub fn get_secret(key: &str) -> AppResult<Option<String>> {
    let entry = Entry::new(SERVICE_NAME, key)?;
    match entry.get_password() {
        Ok(secret) => Ok(Some(secret)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => Err(AppError::Keychain(format!(
            "Failed to read {} from keychain: {}",
            key, e
        ))),
    }
}

/// Delete a secret; deleting a missing entry is not an error
pub fn delete_secret(key: &str) -> AppResult<()> {
    let entry = Entry::new(SERVICE_NAME, key)?;
    match entry.delete_password() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
