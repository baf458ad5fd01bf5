//! Access-token acquisition and background refresh.
//!
//! [`TokenProvider`] owns the single current [`AuthToken`] of one account.
//! Callers get it through [`TokenProvider::get_token`]; the refresh loop
//! ([`TokenProvider::run_refresh`]) re-acquires it on a fixed period and
//! swaps it in under a write lock, so a reader sees either the old or the
//! new token and never a mix.
//!
//! A failed refresh keeps the current token (it may still be valid),
//! reschedules at the shorter retry period and tells the owning
//! connection through a [`TokenNotice`]. Only a token that is past its
//! lifetime with no successful refresh is reported as
//! [`TokenNotice::Expired`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::status::ConnectionStatus;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;
use crate::credential::AccountCredential;

/// An access token with its issue time and nominal lifetime.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub value: String,
    pub issued_at: Instant,
    pub lifetime: Duration,
}

impl AuthToken {
    pub fn new(value: impl Into<String>, issued_at: Instant, lifetime: Duration) -> Self {
        Self {
            value: value.into(),
            issued_at,
            lifetime,
        }
    }

    pub fn expires_at(&self) -> Instant {
        self.issued_at + self.lifetime
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at()
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.value.chars().take(6).collect();
        f.debug_struct("AuthToken")
            .field("value", &format_args!("{prefix}…"))
            .field("issued_at", &self.issued_at)
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

/// The network call that turns a credential into a fresh token string.
#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    async fn fetch_token(&self, credential: &AccountCredential) -> Result<String, AuthError>;
}

/// Out-of-band messages from the refresh loop to the owning connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenNotice {
    /// A new token was swapped in.
    Refreshed,
    /// Refresh failed; the current token is still within its lifetime.
    RefreshFailed { error: String, retry_in: Duration },
    /// The current token is past its lifetime and could not be replaced.
    Expired,
}

/// Caches and refreshes the token for one account.
pub struct TokenProvider {
    credential: Arc<AccountCredential>,
    source: Arc<dyn TokenSource>,
    lifetime: Duration,
    refresh_interval: Duration,
    retry_interval: Duration,
    current: RwLock<Option<AuthToken>>,
}

impl TokenProvider {
    pub fn new(
        credential: Arc<AccountCredential>,
        source: Arc<dyn TokenSource>,
        config: &ConnectionConfig,
    ) -> Self {
        Self {
            credential,
            source,
            lifetime: config.token_lifetime,
            refresh_interval: config.token_refresh_interval,
            retry_interval: config.token_retry_interval,
            current: RwLock::new(None),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.credential.account_id
    }

    /// Return the current token, acquiring one if none is held or the
    /// held one has expired.
    ///
    /// Fails with [`AuthError::Expired`] when a previously held token has
    /// run out and re-acquisition fails; otherwise the acquisition error
    /// is returned as-is.
    pub async fn get_token(&self) -> Result<AuthToken, AuthError> {
        let had_token = {
            let current = self.current.read().await;
            match current.as_ref() {
                Some(token) if !token.is_expired_at(Instant::now()) => return Ok(token.clone()),
                Some(_) => true,
                None => false,
            }
        };

        match self.acquire().await {
            Ok(token) => Ok(token),
            Err(e) if had_token => {
                tracing::warn!(
                    account_id = %self.credential.account_id,
                    error = %e,
                    "Token expired and re-acquisition failed",
                );
                Err(AuthError::Expired)
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch a new token and swap it in. On failure the current token is
    /// left untouched.
    pub async fn refresh(&self) -> Result<AuthToken, AuthError> {
        self.acquire().await
    }

    /// Drop the held token so the next [`get_token`](Self::get_token)
    /// fetches a fresh one. Used when the service rejects a login.
    pub async fn invalidate(&self) {
        *self.current.write().await = None;
    }

    /// Snapshot of the held token, if any.
    pub async fn current(&self) -> Option<AuthToken> {
        self.current.read().await.clone()
    }

    /// Delay before the next refresh given the outcome of the last one.
    pub fn next_refresh_delay<T, E>(&self, outcome: &Result<T, E>) -> Duration {
        match outcome {
            Ok(_) => self.refresh_interval,
            Err(_) => self.retry_interval,
        }
    }

    /// Background refresh loop.
    ///
    /// Wakes every refresh period (or at token expiry, whichever is
    /// sooner, as long as expiry is still ahead), re-acquires while the connection is `Authenticating` or
    /// `Ready`, and reports the outcome on `notices`. Outside those states
    /// the tick is skipped and rechecked after the retry period. Runs
    /// until `cancel` fires.
    pub async fn run_refresh(
        self: Arc<Self>,
        status: watch::Receiver<ConnectionStatus>,
        notices: mpsc::Sender<TokenNotice>,
        cancel: CancellationToken,
    ) {
        let account_id = self.credential.account_id.clone();
        let mut delay = self.refresh_interval;

        loop {
            let now = Instant::now();
            let mut wake_at = now + delay;
            // Once the token is past its lifetime the plain delay applies.
            if let Some(token) = self.current().await {
                if token.expires_at() > now {
                    wake_at = wake_at.min(token.expires_at());
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep_until(wake_at) => {}
            }

            let state = status.borrow().state;
            if !state.accepts_token_refresh() {
                tracing::debug!(account_id = %account_id, %state, "Skipping token refresh");
                delay = self.retry_interval;
                continue;
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = self.refresh() => outcome,
            };
            delay = self.next_refresh_delay(&outcome);

            let notice = match outcome {
                Ok(token) => {
                    tracing::info!(
                        account_id = %account_id,
                        lifetime_secs = token.lifetime.as_secs(),
                        "Token refreshed",
                    );
                    TokenNotice::Refreshed
                }
                Err(e) => {
                    let expired = self
                        .current()
                        .await
                        .map_or(true, |t| t.is_expired_at(Instant::now()));
                    tracing::warn!(
                        account_id = %account_id,
                        error = %e,
                        expired,
                        retry_in_secs = delay.as_secs(),
                        "Token refresh failed",
                    );
                    if expired {
                        TokenNotice::Expired
                    } else {
                        TokenNotice::RefreshFailed {
                            error: e.to_string(),
                            retry_in: delay,
                        }
                    }
                }
            };

            // The connection drains notices between frames; a full queue
            // means it already has one pending.
            let _ = notices.try_send(notice);
        }
    }

    async fn acquire(&self) -> Result<AuthToken, AuthError> {
        let value = self.source.fetch_token(&self.credential).await?;
        if value.is_empty() {
            return Err(AuthError::Rejected("empty access token".into()));
        }
        let token = AuthToken::new(value, Instant::now(), self.lifetime);
        *self.current.write().await = Some(token.clone());
        tracing::debug!(account_id = %self.credential.account_id, "Access token acquired");
        Ok(token)
    }
}

/// Token acquisition and login failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The auth endpoint could not be reached or answered garbage.
    #[error("token request failed: {0}")]
    Request(String),

    /// The auth endpoint refused to issue a token.
    #[error("token rejected: {0}")]
    Rejected(String),

    /// The held token ran out and could not be refreshed.
    #[error("token expired and could not be refreshed")]
    Expired,

    /// A cookie required to sign the request is absent.
    #[error("session cookie `{0}` missing")]
    MissingSessionCookie(&'static str),

    /// The IM gateway answered `/reg` with a non-200 code.
    #[error("login rejected with code {0}")]
    LoginRejected(i64),

    /// No `/reg` response within the login timeout.
    #[error("login handshake timed out")]
    LoginTimeout,
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use relay_core::status::ConnectionState;

    use super::*;

    /// Token source answering from a script and recording call times.
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<String, AuthError>>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<&str, AuthError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().map(|r| r.map(String::from)).collect()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_offsets(&self, start: Instant) -> Vec<u64> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|t| t.duration_since(start).as_secs())
                .collect()
        }
    }

    #[async_trait]
    impl TokenSource for ScriptedSource {
        async fn fetch_token(&self, _credential: &AccountCredential) -> Result<String, AuthError> {
            self.calls.lock().unwrap().push(Instant::now());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AuthError::Request("script exhausted".into())))
        }
    }

    fn provider(source: Arc<ScriptedSource>, config: &ConnectionConfig) -> Arc<TokenProvider> {
        let credential = Arc::new(AccountCredential::new("acct", "unb=acct", "dev-acct"));
        Arc::new(TokenProvider::new(credential, source, config))
    }

    fn ready_status() -> (watch::Sender<ConnectionStatus>, watch::Receiver<ConnectionStatus>) {
        let mut status = ConnectionStatus::new("acct");
        status.state = ConnectionState::Ready;
        watch::channel(status)
    }

    #[tokio::test(start_paused = true)]
    async fn get_token_is_cached_until_expiry() {
        let config = ConnectionConfig {
            token_lifetime: Duration::from_secs(100),
            ..Default::default()
        };
        let source = ScriptedSource::new(vec![Ok("first"), Ok("second")]);
        let tokens = provider(Arc::clone(&source), &config);

        assert_eq!(tokens.get_token().await.unwrap().value, "first");
        assert_eq!(tokens.get_token().await.unwrap().value, "first");
        assert_eq!(source.calls.lock().unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(tokens.get_token().await.unwrap().value, "second");
    }

    #[tokio::test(start_paused = true)]
    async fn expired_token_with_failed_refetch_reports_expired() {
        let config = ConnectionConfig {
            token_lifetime: Duration::from_secs(10),
            ..Default::default()
        };
        let source = ScriptedSource::new(vec![
            Ok("only"),
            Err(AuthError::Request("timeout".into())),
        ]);
        let tokens = provider(source, &config);

        tokens.get_token().await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(tokens.get_token().await.unwrap_err(), AuthError::Expired);
    }

    #[tokio::test]
    async fn first_acquisition_failure_is_passed_through() {
        let source = ScriptedSource::new(vec![Err(AuthError::Rejected("FAIL_SYS_SESSION_EXPIRED".into()))]);
        let tokens = provider(source, &ConnectionConfig::default());

        assert_eq!(
            tokens.get_token().await.unwrap_err(),
            AuthError::Rejected("FAIL_SYS_SESSION_EXPIRED".into())
        );
        assert!(tokens.current().await.is_none());
    }

    #[tokio::test]
    async fn empty_token_is_rejected() {
        let source = ScriptedSource::new(vec![Ok("")]);
        let tokens = provider(source, &ConnectionConfig::default());
        assert!(matches!(tokens.get_token().await, Err(AuthError::Rejected(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_retries_at_short_interval_and_keeps_token() {
        let start = Instant::now();
        let config = ConnectionConfig::default();
        let source = ScriptedSource::new(vec![
            Ok("t1"),
            Err(AuthError::Request("502".into())),
            Ok("t2"),
        ]);
        let tokens = provider(Arc::clone(&source), &config);
        tokens.get_token().await.unwrap();

        let (_status_tx, status_rx) = ready_status();
        let (notice_tx, mut notice_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&tokens).run_refresh(status_rx, notice_tx, cancel.clone()));

        let notice = notice_rx.recv().await.unwrap();
        assert_eq!(
            notice,
            TokenNotice::RefreshFailed {
                error: "token request failed: 502".into(),
                retry_in: Duration::from_secs(300),
            }
        );
        assert_eq!(tokens.current().await.unwrap().value, "t1");

        assert_eq!(notice_rx.recv().await.unwrap(), TokenNotice::Refreshed);
        assert_eq!(tokens.current().await.unwrap().value, "t2");
        assert_eq!(source.call_offsets(start), vec![0, 3600, 3900]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_failing_past_lifetime_reports_expired() {
        let config = ConnectionConfig {
            token_lifetime: Duration::from_secs(3700),
            ..Default::default()
        };
        let source = ScriptedSource::new(vec![
            Ok("t1"),
            Err(AuthError::Request("down".into())),
            Err(AuthError::Request("still down".into())),
        ]);
        let tokens = provider(source, &config);
        tokens.get_token().await.unwrap();

        let (_status_tx, status_rx) = ready_status();
        let (notice_tx, mut notice_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&tokens).run_refresh(status_rx, notice_tx, cancel.clone()));

        assert!(matches!(
            notice_rx.recv().await.unwrap(),
            TokenNotice::RefreshFailed { .. }
        ));
        assert_eq!(notice_rx.recv().await.unwrap(), TokenNotice::Expired);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn expired_token_is_retried_at_retry_interval() {
        let start = Instant::now();
        let config = ConnectionConfig {
            token_lifetime: Duration::from_secs(10),
            ..Default::default()
        };
        let source = ScriptedSource::new(vec![Ok("t1")]);
        let tokens = provider(Arc::clone(&source), &config);
        tokens.get_token().await.unwrap();

        let (_status_tx, status_rx) = ready_status();
        let (notice_tx, mut notice_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&tokens).run_refresh(status_rx, notice_tx, cancel.clone()));

        for _ in 0..3 {
            assert_eq!(notice_rx.recv().await.unwrap(), TokenNotice::Expired);
        }
        assert_eq!(source.call_offsets(start), vec![0, 10, 310, 610]);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn expired_token_is_rechecked_at_retry_interval_while_reconnecting() {
        let start = Instant::now();
        let config = ConnectionConfig {
            token_lifetime: Duration::from_secs(10),
            ..Default::default()
        };
        let source = ScriptedSource::new(vec![Ok("t1"), Ok("t2")]);
        let tokens = provider(Arc::clone(&source), &config);
        tokens.get_token().await.unwrap();

        let mut status = ConnectionStatus::new("acct");
        status.state = ConnectionState::Reconnecting;
        let (status_tx, status_rx) = watch::channel(status);
        let (notice_tx, mut notice_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&tokens).run_refresh(status_rx, notice_tx, cancel.clone()));

        // Virtual time only advances while the loop is parked on a timer.
        tokio::time::sleep(Duration::from_secs(1000)).await;
        assert_eq!(source.call_offsets(start), vec![0]);

        // Skipped ticks at 10, 310, 610, 910; the next one is at 1210.
        status_tx.send_modify(|s| s.state = ConnectionState::Ready);
        assert_eq!(notice_rx.recv().await.unwrap(), TokenNotice::Refreshed);
        assert_eq!(source.call_offsets(start), vec![0, 1210]);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_is_skipped_outside_auth_and_ready() {
        let start = Instant::now();
        let source = ScriptedSource::new(vec![Ok("t1"), Ok("t2")]);
        let tokens = provider(Arc::clone(&source), &ConnectionConfig::default());
        tokens.get_token().await.unwrap();

        let mut status = ConnectionStatus::new("acct");
        status.state = ConnectionState::Reconnecting;
        let (status_tx, status_rx) = watch::channel(status);
        let (notice_tx, mut notice_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&tokens).run_refresh(status_rx, notice_tx, cancel.clone()));

        // The 3600s tick lands while reconnecting and is skipped.
        tokio::time::sleep(Duration::from_secs(3700)).await;
        assert_eq!(source.call_offsets(start), vec![0]);

        status_tx.send_modify(|s| s.state = ConnectionState::Ready);
        assert_eq!(notice_rx.recv().await.unwrap(), TokenNotice::Refreshed);
        assert_eq!(source.call_offsets(start), vec![0, 3900]);
        cancel.cancel();
    }
}
