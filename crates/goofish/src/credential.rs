//! Long-lived account credential.
//!
//! The credential is the browser session (cookie string) of a logged-in
//! seller. It is supplied once when the account is registered and never
//! changes for the lifetime of that connection; tokens are derived from
//! it by the [`TokenProvider`](crate::token::TokenProvider).

use std::fmt;

use relay_core::types::AccountId;

/// Cookie carrying the seller's user id.
const ACCOUNT_COOKIE: &str = "unb";

/// Session material for one seller account.
#[derive(Clone)]
pub struct AccountCredential {
    pub account_id: AccountId,
    /// Raw `Cookie` header value.
    pub cookies: String,
    /// Device id presented to the IM gateway. Stable per account.
    pub device_id: String,
}

impl AccountCredential {
    pub fn new(
        account_id: impl Into<AccountId>,
        cookies: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            cookies: cookies.into(),
            device_id: device_id.into(),
        }
    }

    /// Build a credential from a cookie string alone.
    ///
    /// The account id is taken from the `unb` cookie and a device id of
    /// the form `<uuid>-<account_id>` is generated.
    pub fn from_cookies(cookies: impl Into<String>) -> Result<Self, CredentialError> {
        let cookies = cookies.into();
        let account_id = cookie_value(&cookies, ACCOUNT_COOKIE)
            .filter(|v| !v.is_empty())
            .ok_or(CredentialError::MissingCookie(ACCOUNT_COOKIE))?
            .to_string();
        let device_id = generate_device_id(&account_id);
        Ok(Self {
            account_id,
            cookies,
            device_id,
        })
    }

    /// Look up a single cookie by name.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        cookie_value(&self.cookies, name)
    }
}

impl fmt::Debug for AccountCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountCredential")
            .field("account_id", &self.account_id)
            .field("cookies", &"<redacted>")
            .field("device_id", &self.device_id)
            .finish()
    }
}

/// Device id in the shape the web client uses.
pub fn generate_device_id(account_id: &str) -> String {
    format!(
        "{}-{}",
        uuid::Uuid::new_v4().to_string().to_uppercase(),
        account_id
    )
}

fn cookie_value<'a>(cookies: &'a str, name: &str) -> Option<&'a str> {
    cookies
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim())
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("cookie string has no `{0}` cookie")]
    MissingCookie(&'static str),
}
