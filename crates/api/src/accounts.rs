//! Account credentials supplied over HTTP or in the startup accounts file.
//!
//! Both use the same JSON shape:
//!
//! ```json
//! { "cookies": "unb=2201234567; _m_h5_tk=...", "accountId": null, "deviceId": null }
//! ```
//!
//! When `accountId` is omitted it is read from the `unb` cookie; when
//! `deviceId` is omitted one is generated.

use std::path::Path;

use relay_core::error::CoreError;
use relay_goofish::credential::generate_device_id;
use relay_goofish::AccountCredential;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSpec {
    pub cookies: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
}

impl AccountSpec {
    pub fn into_credential(self) -> Result<AccountCredential, CoreError> {
        let cookies = self.cookies.trim().to_string();
        if cookies.is_empty() {
            return Err(CoreError::Validation("cookies must not be empty".into()));
        }

        let mut credential = match self.account_id.filter(|id| !id.trim().is_empty()) {
            Some(account_id) => {
                let device_id = generate_device_id(&account_id);
                AccountCredential::new(account_id, cookies, device_id)
            }
            None => AccountCredential::from_cookies(cookies)
                .map_err(|e| CoreError::Validation(e.to_string()))?,
        };

        if let Some(device_id) = self.device_id.filter(|d| !d.trim().is_empty()) {
            credential.device_id = device_id;
        }
        Ok(credential)
    }
}

/// Read the accounts file: a JSON array of [`AccountSpec`].
pub fn load_accounts_file(path: &Path) -> Result<Vec<AccountCredential>, AccountsFileError> {
    let raw = std::fs::read_to_string(path).map_err(|e| AccountsFileError::Read {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    parse_accounts(&raw)
}

pub fn parse_accounts(raw: &str) -> Result<Vec<AccountCredential>, AccountsFileError> {
    let specs: Vec<AccountSpec> =
        serde_json::from_str(raw).map_err(|e| AccountsFileError::Parse(e.to_string()))?;

    specs
        .into_iter()
        .enumerate()
        .map(|(index, spec)| {
            spec.into_credential()
                .map_err(|e| AccountsFileError::Entry { index, message: e.to_string() })
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum AccountsFileError {
    #[error("cannot read accounts file {path}: {message}")]
    Read { path: String, message: String },

    #[error("accounts file is not a JSON list of accounts: {0}")]
    Parse(String),

    #[error("accounts file entry {index}: {message}")]
    Entry { index: usize, message: String },
}
