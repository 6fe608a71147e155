use anyhow::{Context, Result};
use keyring::Entry;

use crate::config::APP_NAME;

pub struct CredentialStore;

impl CredentialStore {
    /// Store a member's access token in the OS keychain
    pub fn store_token(user_id: &str, token: &str) -> Result<()> {
        let entry = Entry::new(APP_NAME, user_id)
            .context("Failed to create keyring entry")?;
        entry
            .set_password(token)
            .context("Failed to store access token in keychain")?;
        Ok(())
    }

    /// Retrieve the access token for a member from the OS keychain
    pub fn get_token(user_id: &str) -> Result<String> {
        let entry = Entry::new(APP_NAME, user_id)
            .context("Failed to create keyring entry")?;
        entry
            .get_password()
            .context("Failed to retrieve access token from keychain")
    }

    /// Delete the stored token for a member
    pub fn delete(user_id: &str) -> Result<()> {
        let entry = Entry::new(APP_NAME, user_id)
            .context("Failed to create keyring entry")?;
        entry
            .delete_credential()
            .context("Failed to delete credential from keychain")?;
        Ok(())
    }
}
