//! HTTP client for the marketplace login-token endpoint.
//!
//! The IM access token is issued by an mtop API authenticated with the
//! seller's browser cookies. mtop requests are signed with
//! `md5("<token>&<t>&<appKey>&<data>")` where `<token>` is the part of
//! the `_m_h5_tk` cookie before the first underscore.

use async_trait::async_trait;
use md5::{Digest, Md5};
use serde::Deserialize;
use serde_json::json;

use crate::config::ConnectionConfig;
use crate::credential::AccountCredential;
use crate::token::{AuthError, TokenSource};

/// Cookie holding the mtop signing token.
const SIGN_COOKIE: &str = "_m_h5_tk";

const TOKEN_API: &str = "mtop.taobao.idlemessage.pc.login.token";

/// [`TokenSource`] backed by the mtop login-token API.
pub struct HttpTokenSource {
    client: reqwest::Client,
    token_url: String,
    app_key: String,
    sign_app_key: String,
}

#[derive(Debug, Deserialize)]
struct MtopResponse {
    #[serde(default)]
    ret: Vec<String>,
    #[serde(default)]
    data: Option<TokenData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenData {
    access_token: Option<String>,
}

impl HttpTokenSource {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            token_url: config.token_url.clone(),
            app_key: config.app_key.clone(),
            sign_app_key: config.sign_app_key.clone(),
        }
    }

    /// Use a preconfigured client (timeouts, proxy).
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl TokenSource for HttpTokenSource {
    async fn fetch_token(&self, credential: &AccountCredential) -> Result<String, AuthError> {
        let sign_token = credential
            .cookie(SIGN_COOKIE)
            .and_then(|v| v.split('_').next())
            .filter(|v| !v.is_empty())
            .ok_or(AuthError::MissingSessionCookie(SIGN_COOKIE))?;

        let data = json!({ "appKey": self.app_key, "deviceId": credential.device_id }).to_string();
        let t = chrono::Utc::now().timestamp_millis().to_string();
        let sign = mtop_sign(sign_token, &t, &self.sign_app_key, &data);

        let response = self
            .client
            .post(&self.token_url)
            .header(reqwest::header::COOKIE, &credential.cookies)
            .header(reqwest::header::ORIGIN, "https://www.goofish.com")
            .header(reqwest::header::REFERER, "https://www.goofish.com/")
            .query(&[
                ("jsv", "2.7.2"),
                ("appKey", self.sign_app_key.as_str()),
                ("t", t.as_str()),
                ("sign", sign.as_str()),
                ("v", "1.0"),
                ("type", "originaljson"),
                ("accountSite", "xianyu"),
                ("dataType", "json"),
                ("timeout", "20000"),
                ("api", TOKEN_API),
                ("sessionOption", "AutoLoginOnly"),
            ])
            .form(&[("data", data.as_str())])
            .send()
            .await
            .map_err(|e| AuthError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Request(format!("HTTP {status}")));
        }

        let body: MtopResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Request(format!("invalid response body: {e}")))?;

        let token = parse_token_response(body)?;
        tracing::debug!(account_id = %credential.account_id, "Login token issued");
        Ok(token)
    }
}

/// mtop request signature.
pub fn mtop_sign(token: &str, t: &str, app_key: &str, data: &str) -> String {
    let digest = Md5::digest(format!("{token}&{t}&{app_key}&{data}").as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn parse_token_response(body: MtopResponse) -> Result<String, AuthError> {
    let ret = body.ret.first().map(String::as_str).unwrap_or_default();
    if !ret.starts_with("SUCCESS") {
        return Err(AuthError::Rejected(if ret.is_empty() {
            "empty ret".to_string()
        } else {
            ret.to_string()
        }));
    }

    body.data
        .and_then(|d| d.access_token)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AuthError::Rejected("response carries no accessToken".into()))
}
