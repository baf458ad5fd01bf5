//! Per-account connection state machine.
//!
//! Each registered account runs one [`AccountConnection`] task that owns
//! the socket and walks the states
//!
//! ```text
//! Disconnected -> Connecting -> Authenticating -> Ready
//!                     ^              |              |
//!                     |              v              v
//!                     +-------- Reconnecting <------+
//!                                    |
//!                                    v  (bound exhausted)
//!                              Disconnected (fatal)
//! ```
//!
//! The phase is a tagged enum carrying whatever that phase owns (the
//! socket, the failure that caused a reconnect), and every phase handler
//! returns the next phase. All transitions happen on the connection's own
//! task; the rest of the process sees them through the status `watch`
//! channel and the event bus.
//!
//! Callers interact through a cloneable [`AccountConnectionHandle`]. Sends
//! are only accepted in `Ready`; in every other state they fail fast with
//! [`SendError::NotConnected`]. Shutdown is a cancellation token and is
//! honoured at every suspension point, socket writes included; every
//! write is also bounded by `write_timeout`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relay_core::status::{ConnectionState, ConnectionStatus};
use relay_core::types::AccountId;
use relay_events::{EventBus, RelayEvent};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;
use crate::credential::AccountCredential;
use crate::heartbeat::HeartbeatTimer;
use crate::protocol::{self, Frame, FrameCodec, ProtocolError, CODE_OK};
use crate::reconnect::{ReconnectDecision, ReconnectPolicy};
use crate::token::{AuthError, TokenNotice, TokenProvider, TokenSource};
use crate::transport::{ChatSocket, Connector, TransportError};

/// Pending sends buffered per connection.
const COMMAND_CAPACITY: usize = 64;

/// Pending token notices buffered per connection.
const NOTICE_CAPACITY: usize = 4;

/// Bound on the close handshake when releasing a socket.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

/// A text message to deliver from the account to a buyer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub conversation_id: String,
    pub recipient_id: String,
    pub text: String,
}

impl OutboundRequest {
    pub fn new(
        conversation_id: impl Into<String>,
        recipient_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            recipient_id: recipient_id.into(),
            text: text.into(),
        }
    }
}

/// Why a send was not written.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The connection is not `Ready` (or dropped before the write).
    #[error("account is not connected")]
    NotConnected,

    /// The connection did not get to the write within the send timeout.
    #[error("send timed out")]
    Timeout,
}

enum Command {
    Send {
        request: OutboundRequest,
        reply: oneshot::Sender<Result<(), SendError>>,
    },
}

impl Command {
    fn reject(self) {
        match self {
            Command::Send { reply, .. } => {
                let _ = reply.send(Err(SendError::NotConnected));
            }
        }
    }
}

/// Cheap, cloneable handle to a running connection.
#[derive(Clone)]
pub struct AccountConnectionHandle {
    account_id: AccountId,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    cancel: CancellationToken,
    send_timeout: Duration,
}

impl std::fmt::Debug for AccountConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConnectionHandle")
            .field("account_id", &self.account_id)
            .field("state", &self.state())
            .finish()
    }
}

impl AccountConnectionHandle {
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Latest status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// A receiver that observes every status update.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Write a text message on the account's socket.
    ///
    /// Returns once the frame has been written to the transport (not once
    /// the buyer has received it). Fails immediately when the connection
    /// is not `Ready`.
    pub async fn send(&self, request: OutboundRequest) -> Result<(), SendError> {
        if !self.is_ready() {
            return Err(SendError::NotConnected);
        }

        let (reply, response) = oneshot::channel();
        let exchange = async {
            self.commands
                .send(Command::Send { request, reply })
                .await
                .map_err(|_| SendError::NotConnected)?;
            response.await.map_err(|_| SendError::NotConnected)?
        };

        tokio::time::timeout(self.send_timeout, exchange)
            .await
            .unwrap_or(Err(SendError::Timeout))
    }

    /// Resolve once the status satisfies `predicate`, returning that
    /// status. Returns the final status if the connection task ends
    /// without ever satisfying it.
    pub async fn wait_for<F>(&self, mut predicate: F) -> ConnectionStatus
    where
        F: FnMut(&ConnectionStatus) -> bool,
    {
        let mut rx = self.status.clone();
        let outcome = rx.wait_for(|status| predicate(status)).await.map(|s| s.clone());
        match outcome {
            Ok(status) => status,
            Err(_) => rx.borrow().clone(),
        }
    }

    /// Request shutdown. Idempotent; accepted from any state.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// The driver for one account. Lives on its own task.
pub struct AccountConnection {
    credential: Arc<AccountCredential>,
    config: Arc<ConnectionConfig>,
    connector: Arc<dyn Connector>,
    tokens: Arc<TokenProvider>,
    events: Arc<EventBus>,
    commands: mpsc::Receiver<Command>,
    token_notices: mpsc::Receiver<TokenNotice>,
    status: watch::Sender<ConnectionStatus>,
    cancel: CancellationToken,
    refresh_cancel: CancellationToken,
    policy: ReconnectPolicy,
    codec: FrameCodec,
    attempts: u32,
}

/// Where the machine is, and what that phase owns.
enum Phase {
    Connecting,
    Authenticating(Box<dyn ChatSocket>),
    Ready(Box<dyn ChatSocket>),
    Reconnecting(Failure),
    Disconnected(Stop),
}

enum Stop {
    Shutdown,
    Exhausted,
}

/// What ended a connection cycle.
#[derive(Debug, thiserror::Error)]
enum Failure {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("no heartbeat acknowledgement within {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("too many malformed frames, last: {0}")]
    Protocol(ProtocolError),
}

/// One wake-up of the `Ready` loop.
enum Step {
    Shutdown,
    HeartbeatExpired,
    Ping,
    Frame(Option<Result<String, TransportError>>),
    Command(Command),
    Token(TokenNotice),
}

enum FrameError {
    Protocol(ProtocolError),
    /// Acking the frame failed; the session ends with this phase.
    Interrupted(Phase),
}

impl AccountConnection {
    /// Start the connection task (and its token refresh task) for one
    /// account.
    ///
    /// `cancel` is the account's shutdown token; cancelling it (directly
    /// or through [`AccountConnectionHandle::shutdown`]) stops both tasks.
    pub fn spawn(
        credential: AccountCredential,
        config: Arc<ConnectionConfig>,
        connector: Arc<dyn Connector>,
        token_source: Arc<dyn TokenSource>,
        events: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> (AccountConnectionHandle, JoinHandle<()>) {
        let credential = Arc::new(credential);
        let account_id = credential.account_id.clone();

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (notice_tx, notice_rx) = mpsc::channel(NOTICE_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::new(account_id.clone()));

        let tokens = Arc::new(TokenProvider::new(
            Arc::clone(&credential),
            token_source,
            &config,
        ));
        let refresh_cancel = cancel.child_token();
        let refresh_task = tokio::spawn(Arc::clone(&tokens).run_refresh(
            status_rx.clone(),
            notice_tx,
            refresh_cancel.clone(),
        ));

        let driver = Self {
            credential,
            policy: config.reconnect_policy(),
            config: Arc::clone(&config),
            connector,
            tokens,
            events,
            commands: command_rx,
            token_notices: notice_rx,
            status: status_tx,
            cancel: cancel.clone(),
            refresh_cancel,
            codec: FrameCodec::new(),
            attempts: 0,
        };

        let task = tokio::spawn(async move {
            driver.run().await;
            let _ = refresh_task.await;
        });

        let handle = AccountConnectionHandle {
            account_id,
            commands: command_tx,
            status: status_rx,
            cancel,
            send_timeout: config.send_timeout,
        };
        (handle, task)
    }

    async fn run(mut self) {
        tracing::info!(account_id = %self.credential.account_id, "Starting connection task");

        let mut phase = Phase::Connecting;
        loop {
            phase = match phase {
                Phase::Connecting => self.connect().await,
                Phase::Authenticating(socket) => self.authenticate(socket).await,
                Phase::Ready(socket) => self.serve(socket).await,
                Phase::Reconnecting(failure) => self.reconnect(failure).await,
                Phase::Disconnected(stop) => {
                    self.finish(stop);
                    break;
                }
            };
        }

        tracing::info!(account_id = %self.credential.account_id, "Connection task exited");
    }

    // ---- phases ----

    async fn connect(&mut self) -> Phase {
        self.transition(ConnectionState::Connecting);

        let attempt = tokio::time::timeout(
            self.config.connect_timeout,
            self.connector.connect(&self.credential),
        );
        match guarded(&self.cancel, &mut self.commands, attempt).await {
            None => Phase::Disconnected(Stop::Shutdown),
            Some(Ok(Ok(socket))) => Phase::Authenticating(socket),
            Some(Ok(Err(e))) => Phase::Reconnecting(e.into()),
            Some(Err(_elapsed)) => Phase::Reconnecting(TransportError::Timeout.into()),
        }
    }

    async fn authenticate(&mut self, mut socket: Box<dyn ChatSocket>) -> Phase {
        self.transition(ConnectionState::Authenticating);

        let token = match guarded(&self.cancel, &mut self.commands, self.tokens.get_token()).await {
            None => return close_and(socket, Phase::Disconnected(Stop::Shutdown)).await,
            Some(Err(e)) => return close_and(socket, Phase::Reconnecting(e.into())).await,
            Some(Ok(token)) => token,
        };

        let (mid, frame) = self.codec.register(
            &token.value,
            &self.credential.device_id,
            &self.config.app_key,
        );
        if let Err(next) = self.write(&mut *socket, frame).await {
            return close_and(socket, next).await;
        }

        let login = tokio::time::timeout(
            self.config.login_timeout,
            await_response(&mut *socket, &mid),
        );
        let code = match guarded(&self.cancel, &mut self.commands, login).await {
            None => return close_and(socket, Phase::Disconnected(Stop::Shutdown)).await,
            Some(Err(_elapsed)) => {
                return close_and(socket, Phase::Reconnecting(AuthError::LoginTimeout.into())).await
            }
            Some(Ok(Err(e))) => return close_and(socket, Phase::Reconnecting(e.into())).await,
            Some(Ok(Ok(code))) => code,
        };

        if code != CODE_OK {
            // The gateway refused this token; fetch a fresh one next cycle.
            self.tokens.invalidate().await;
            return close_and(socket, Phase::Reconnecting(AuthError::LoginRejected(code).into()))
                .await;
        }

        let ack_diff = self.codec.ack_diff();
        if let Err(next) = self.write(&mut *socket, ack_diff).await {
            return close_and(socket, next).await;
        }

        Phase::Ready(socket)
    }

    async fn serve(&mut self, mut socket: Box<dyn ChatSocket>) -> Phase {
        self.attempts = 0;
        self.status.send_modify(|s| {
            s.connected_at = Some(Utc::now());
            s.last_error = None;
        });
        self.transition(ConnectionState::Ready);

        // Notices raised before this session belong to a token it no
        // longer uses.
        while self.token_notices.try_recv().is_ok() {}

        let mut heartbeat = HeartbeatTimer::new(
            self.config.heartbeat_interval,
            self.config.heartbeat_timeout,
            Instant::now(),
        );
        let mut protocol_errors = 0u32;

        loop {
            let deadline = heartbeat.deadline();
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Step::Shutdown,
                _ = sleep_until_opt(deadline) => Step::HeartbeatExpired,
                _ = sleep_until(heartbeat.next_ping_at()) => Step::Ping,
                frame = socket.recv_text() => Step::Frame(frame),
                Some(command) = self.commands.recv() => Step::Command(command),
                Some(notice) = self.token_notices.recv() => Step::Token(notice),
            };

            match step {
                Step::Shutdown => return close_and(socket, Phase::Disconnected(Stop::Shutdown)).await,

                Step::HeartbeatExpired => {
                    let failure = Failure::HeartbeatTimeout(self.config.heartbeat_timeout);
                    return close_and(socket, Phase::Reconnecting(failure)).await;
                }

                Step::Ping => {
                    let (mid, frame) = self.codec.heartbeat();
                    if let Err(next) = self.write(&mut *socket, frame).await {
                        return close_and(socket, next).await;
                    }
                    tracing::trace!(account_id = %self.credential.account_id, mid = %mid, "Heartbeat sent");
                    heartbeat.on_ping_sent(mid, Instant::now());
                    self.status
                        .send_modify(|s| s.last_heartbeat_sent = Some(Utc::now()));
                }

                Step::Frame(None) => {
                    return close_and(socket, Phase::Reconnecting(TransportError::Closed.into()))
                        .await;
                }
                Step::Frame(Some(Err(e))) => {
                    return close_and(socket, Phase::Reconnecting(e.into())).await;
                }
                Step::Frame(Some(Ok(text))) => {
                    match self.handle_frame(&mut *socket, &mut heartbeat, &text).await {
                        Ok(()) => protocol_errors = 0,
                        Err(FrameError::Interrupted(next)) => return close_and(socket, next).await,
                        Err(FrameError::Protocol(e)) => {
                            protocol_errors += 1;
                            tracing::warn!(
                                account_id = %self.credential.account_id,
                                error = %e,
                                consecutive = protocol_errors,
                                raw_frame = %text,
                                "Dropping malformed frame",
                            );
                            if protocol_errors >= self.config.protocol_error_threshold {
                                return close_and(socket, Phase::Reconnecting(Failure::Protocol(e)))
                                    .await;
                            }
                        }
                    }
                }

                Step::Command(Command::Send { request, reply }) => {
                    let (mid, frame) = self.codec.send_message(&self.credential.account_id, &request);
                    match self.write(&mut *socket, frame).await {
                        Ok(()) => {
                            tracing::debug!(
                                account_id = %self.credential.account_id,
                                conversation_id = %request.conversation_id,
                                mid = %mid,
                                "Message written",
                            );
                            let _ = reply.send(Ok(()));
                        }
                        Err(next) => {
                            let _ = reply.send(Err(SendError::NotConnected));
                            return close_and(socket, next).await;
                        }
                    }
                }

                Step::Token(TokenNotice::Refreshed) => {
                    tracing::debug!(account_id = %self.credential.account_id, "Token refreshed while ready");
                }
                Step::Token(TokenNotice::RefreshFailed { error, retry_in }) => {
                    tracing::warn!(
                        account_id = %self.credential.account_id,
                        error = %error,
                        retry_in_secs = retry_in.as_secs(),
                        "Token refresh failed, current token still valid",
                    );
                }
                Step::Token(TokenNotice::Expired) => {
                    return close_and(socket, Phase::Reconnecting(AuthError::Expired.into())).await;
                }
            }
        }
    }

    async fn reconnect(&mut self, failure: Failure) -> Phase {
        self.attempts += 1;
        let attempt = self.attempts;
        let reason = failure.to_string();
        self.status.send_modify(|s| s.last_error = Some(reason));
        self.transition(ConnectionState::Reconnecting);

        match self.policy.decide(attempt) {
            ReconnectDecision::GiveUp => {
                tracing::error!(
                    account_id = %self.credential.account_id,
                    attempt,
                    error = %failure,
                    "Reconnect bound exhausted, manual intervention required",
                );
                Phase::Disconnected(Stop::Exhausted)
            }
            ReconnectDecision::RetryAfter(delay) => {
                tracing::warn!(
                    account_id = %self.credential.account_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Connection cycle failed, reconnecting",
                );
                match guarded(&self.cancel, &mut self.commands, tokio::time::sleep(delay)).await {
                    None => Phase::Disconnected(Stop::Shutdown),
                    Some(()) => Phase::Connecting,
                }
            }
        }
    }

    fn finish(&mut self, stop: Stop) {
        let fatal = matches!(stop, Stop::Exhausted);
        self.status.send_modify(|s| s.fatal = fatal);
        self.transition(ConnectionState::Disconnected);

        self.refresh_cancel.cancel();
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            command.reject();
        }

        if fatal {
            tracing::error!(account_id = %self.credential.account_id, "Connection marked fatal");
        } else {
            tracing::info!(account_id = %self.credential.account_id, "Connection shut down");
        }
    }

    // ---- helpers ----

    /// Decode one inbound frame and act on it.
    async fn handle_frame(
        &mut self,
        socket: &mut dyn ChatSocket,
        heartbeat: &mut HeartbeatTimer,
        text: &str,
    ) -> Result<(), FrameError> {
        let frame = protocol::parse_frame(text).map_err(FrameError::Protocol)?;

        match frame {
            Frame::Response { mid, code } => {
                if heartbeat.on_response(&mid, Instant::now()) {
                    self.status
                        .send_modify(|s| s.last_heartbeat_ack = Some(Utc::now()));
                } else if code != CODE_OK {
                    tracing::debug!(
                        account_id = %self.credential.account_id,
                        mid = %mid,
                        code,
                        "Request answered with non-OK code",
                    );
                }
            }
            Frame::Push { lwp, mid, sid, body } => {
                if let Some(mid) = mid.as_deref() {
                    self.write(socket, protocol::push_ack(mid, sid.as_deref()))
                        .await
                        .map_err(FrameError::Interrupted)?;
                }

                if protocol::is_sync_push(&lwp) {
                    let events = protocol::decode_sync_push(&self.credential.account_id, &body)
                        .map_err(FrameError::Protocol)?;
                    for event in events {
                        tracing::debug!(
                            account_id = %self.credential.account_id,
                            kind = ?event.kind,
                            "Inbound event",
                        );
                        self.events.publish(RelayEvent::Inbound(event));
                    }
                } else {
                    tracing::trace!(account_id = %self.credential.account_id, lwp = %lwp, "Ignoring push");
                }
            }
        }
        Ok(())
    }

    /// Write one frame, bounded by the write timeout and abandoned on
    /// shutdown. On failure returns the phase to move to.
    async fn write(&self, socket: &mut dyn ChatSocket, frame: String) -> Result<(), Phase> {
        let write = tokio::time::timeout(self.config.write_timeout, socket.send_text(frame));
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Phase::Disconnected(Stop::Shutdown)),
            outcome = write => match outcome {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(Phase::Reconnecting(e.into())),
                Err(_elapsed) => Err(Phase::Reconnecting(TransportError::WriteTimeout.into())),
            },
        }
    }

    /// Move to `state`, record the attempt count, and publish the new
    /// status on the bus.
    fn transition(&self, state: ConnectionState) {
        let attempts = self.attempts;
        self.status.send_modify(|s| {
            s.state = state;
            s.reconnect_attempts = attempts;
        });
        let snapshot = self.status.borrow().clone();

        tracing::info!(
            account_id = %self.credential.account_id,
            %state,
            attempts,
            "Connection state changed",
        );
        self.events.publish(RelayEvent::Status(snapshot));
    }
}

/// Drive `fut` to completion unless `cancel` fires first. Sends arriving
/// in the meantime are rejected, since no state but `Ready` takes them.
async fn guarded<F: Future>(
    cancel: &CancellationToken,
    commands: &mut mpsc::Receiver<Command>,
    fut: F,
) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            out = &mut fut => return Some(out),
            Some(command) = commands.recv() => command.reject(),
        }
    }
}

/// Wait for the response frame answering `mid`, skipping anything else.
async fn await_response(socket: &mut dyn ChatSocket, mid: &str) -> Result<i64, TransportError> {
    loop {
        let text = match socket.recv_text().await {
            None => return Err(TransportError::Closed),
            Some(Err(e)) => return Err(e),
            Some(Ok(text)) => text,
        };
        match protocol::parse_frame(&text) {
            Ok(Frame::Response { mid: got, code }) if got == mid => return Ok(code),
            Ok(_) => tracing::trace!("Skipping frame while awaiting response"),
            Err(e) => tracing::debug!(error = %e, "Dropping malformed frame while awaiting response"),
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Release the socket, then move on.
async fn close_and(mut socket: Box<dyn ChatSocket>, next: Phase) -> Phase {
    if tokio::time::timeout(CLOSE_TIMEOUT, socket.close()).await.is_err() {
        tracing::debug!("Socket close timed out, dropping it");
    }
    next
}
