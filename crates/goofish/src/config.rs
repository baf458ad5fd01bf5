//! Connection tuning parameters.
//!
//! Every timing and retry knob of the lifecycle is a named field here,
//! with the reference defaults in [`Default`] and environment overrides
//! via [`ConnectionConfig::from_env`].

use std::time::Duration;

use crate::reconnect::ReconnectPolicy;

/// Default IM gateway.
pub const DEFAULT_WS_URL: &str = "wss://wss-goofish.dingtalk.com/";

/// Default mtop endpoint issuing IM access tokens.
pub const DEFAULT_TOKEN_URL: &str =
    "https://h5api.m.goofish.com/h5/mtop.taobao.idlemessage.pc.login.token/1.0/";

/// App key sent in the `/reg` login frame and the token request body.
pub const DEFAULT_APP_KEY: &str = "444e9908a51d1cb236a27862abc769c9";

/// App key used when signing mtop requests.
pub const DEFAULT_SIGN_APP_KEY: &str = "34839810";

/// Tunables for every account connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// IM WebSocket endpoint.
    pub ws_url: String,
    /// mtop login-token endpoint.
    pub token_url: String,
    pub app_key: String,
    pub sign_app_key: String,
    /// Period between heartbeat pings on a `Ready` session.
    pub heartbeat_interval: Duration,
    /// An unacknowledged ping older than this declares the session dead.
    pub heartbeat_timeout: Duration,
    /// Proactive token refresh period.
    pub token_refresh_interval: Duration,
    /// Retry period after a failed refresh.
    pub token_retry_interval: Duration,
    /// Nominal token lifetime counted from issue.
    pub token_lifetime: Duration,
    /// Consecutive failed cycles tolerated before the account is marked fatal.
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect attempt.
    pub reconnect_delay: Duration,
    /// Growth factor between reconnect delays. `1.0` is fixed-delay.
    pub reconnect_multiplier: f64,
    /// Cap on the reconnect delay when `reconnect_multiplier > 1.0`.
    pub max_reconnect_delay: Duration,
    pub connect_timeout: Duration,
    /// Deadline for the `/reg` response.
    pub login_timeout: Duration,
    /// Upper bound on a caller waiting for a send to hit the socket.
    pub send_timeout: Duration,
    /// Upper bound on a single socket write; a stalled write is a dead link.
    pub write_timeout: Duration,
    /// Consecutive undecodable frames tolerated before reconnecting.
    pub protocol_error_threshold: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            app_key: DEFAULT_APP_KEY.to_string(),
            sign_app_key: DEFAULT_SIGN_APP_KEY.to_string(),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(30),
            token_refresh_interval: Duration::from_secs(3600),
            token_retry_interval: Duration::from_secs(300),
            token_lifetime: Duration::from_secs(7200),
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(5000),
            reconnect_multiplier: 1.0,
            max_reconnect_delay: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            login_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            protocol_error_threshold: 10,
        }
    }
}

impl ConnectionConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                               | Default |
    /// |---------------------------------------|---------|
    /// | `GOOFISH_WS_URL`                      | [`DEFAULT_WS_URL`] |
    /// | `GOOFISH_TOKEN_URL`                   | [`DEFAULT_TOKEN_URL`] |
    /// | `GOOFISH_APP_KEY`                     | [`DEFAULT_APP_KEY`] |
    /// | `GOOFISH_SIGN_APP_KEY`                | [`DEFAULT_SIGN_APP_KEY`] |
    /// | `GOOFISH_HEARTBEAT_INTERVAL_SECS`     | `15`    |
    /// | `GOOFISH_HEARTBEAT_TIMEOUT_SECS`      | `30`    |
    /// | `GOOFISH_TOKEN_REFRESH_INTERVAL_SECS` | `3600`  |
    /// | `GOOFISH_TOKEN_RETRY_INTERVAL_SECS`   | `300`   |
    /// | `GOOFISH_TOKEN_LIFETIME_SECS`         | `7200`  |
    /// | `GOOFISH_MAX_RECONNECT_ATTEMPTS`      | `5`     |
    /// | `GOOFISH_RECONNECT_DELAY_MS`          | `5000`  |
    /// | `GOOFISH_RECONNECT_MULTIPLIER`        | `1.0`   |
    /// | `GOOFISH_MAX_RECONNECT_DELAY_MS`      | `60000` |
    /// | `GOOFISH_CONNECT_TIMEOUT_SECS`        | `10`    |
    /// | `GOOFISH_LOGIN_TIMEOUT_SECS`          | `10`    |
    /// | `GOOFISH_SEND_TIMEOUT_SECS`           | `10`    |
    /// | `GOOFISH_WRITE_TIMEOUT_SECS`          | `10`    |
    /// | `GOOFISH_PROTOCOL_ERROR_THRESHOLD`    | `10`    |
    ///
    /// Values that fail to parse fall back to the default, as do zero
    /// values for the `_SECS` keys (a zero period would busy-loop).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let secs = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|&v| v > 0)
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        let millis = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        if let Some(v) = lookup("GOOFISH_WS_URL") {
            config.ws_url = v;
        }
        if let Some(v) = lookup("GOOFISH_TOKEN_URL") {
            config.token_url = v;
        }
        if let Some(v) = lookup("GOOFISH_APP_KEY") {
            config.app_key = v;
        }
        if let Some(v) = lookup("GOOFISH_SIGN_APP_KEY") {
            config.sign_app_key = v;
        }

        config.heartbeat_interval = secs("GOOFISH_HEARTBEAT_INTERVAL_SECS", config.heartbeat_interval);
        config.heartbeat_timeout = secs("GOOFISH_HEARTBEAT_TIMEOUT_SECS", config.heartbeat_timeout);
        config.token_refresh_interval =
            secs("GOOFISH_TOKEN_REFRESH_INTERVAL_SECS", config.token_refresh_interval);
        config.token_retry_interval =
            secs("GOOFISH_TOKEN_RETRY_INTERVAL_SECS", config.token_retry_interval);
        config.token_lifetime = secs("GOOFISH_TOKEN_LIFETIME_SECS", config.token_lifetime);
        config.reconnect_delay = millis("GOOFISH_RECONNECT_DELAY_MS", config.reconnect_delay);
        config.max_reconnect_delay =
            millis("GOOFISH_MAX_RECONNECT_DELAY_MS", config.max_reconnect_delay);
        config.connect_timeout = secs("GOOFISH_CONNECT_TIMEOUT_SECS", config.connect_timeout);
        config.login_timeout = secs("GOOFISH_LOGIN_TIMEOUT_SECS", config.login_timeout);
        config.send_timeout = secs("GOOFISH_SEND_TIMEOUT_SECS", config.send_timeout);
        config.write_timeout = secs("GOOFISH_WRITE_TIMEOUT_SECS", config.write_timeout);

        if let Some(v) = lookup("GOOFISH_MAX_RECONNECT_ATTEMPTS").and_then(|v| v.trim().parse().ok()) {
            config.max_reconnect_attempts = v;
        }
        if let Some(v) = lookup("GOOFISH_RECONNECT_MULTIPLIER").and_then(|v| v.trim().parse().ok()) {
            config.reconnect_multiplier = v;
        }
        if let Some(v) =
            lookup("GOOFISH_PROTOCOL_ERROR_THRESHOLD").and_then(|v| v.trim().parse().ok())
        {
            config.protocol_error_threshold = v;
        }

        config
    }

    /// The reconnect policy described by this config.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: self.reconnect_delay,
            max_delay: self.max_reconnect_delay,
            multiplier: self.reconnect_multiplier,
            max_attempts: self.max_reconnect_attempts,
        }
    }
}
