//! Shared test infrastructure for connection lifecycle tests.
//!
//! [`MockGateway`] stands in for the IM service: it hands out in-memory
//! sockets, answers `/reg` and `/!` frames according to its toggles, and
//! records every frame the client writes. It can also stall writes the
//! way a full TCP send buffer does. [`MockTokens`] is a token
//! source whose failures can be switched per account.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relay_core::status::{ConnectionState, ConnectionStatus};
use relay_events::EventBus;
use relay_goofish::protocol::{LWP_HEARTBEAT, LWP_REGISTER};
use relay_goofish::token::{AuthError, TokenSource};
use relay_goofish::transport::{ChatSocket, Connector, TransportError};
use relay_goofish::{AccountConnectionHandle, AccountCredential, ClientManager, ConnectionConfig};
use serde_json::{json, Value};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

enum Inbound {
    Frame(String),
    Hangup,
}

#[derive(Default)]
struct GatewayState {
    refuse_connects: AtomicBool,
    mute_login: AtomicBool,
    mute_heartbeats: AtomicBool,
    stall_writes: AtomicBool,
    open_sockets: AtomicU32,
    login_code: AtomicI64,
    connects: AtomicU32,
    frames: Mutex<Vec<Value>>,
    sessions: Mutex<Vec<mpsc::UnboundedSender<Inbound>>>,
}

/// In-memory IM gateway.
#[derive(Clone)]
pub struct MockGateway {
    state: Arc<GatewayState>,
}

impl MockGateway {
    pub fn new() -> Self {
        let state = GatewayState::default();
        state.login_code.store(200, Ordering::SeqCst);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    pub fn refuse_connects(&self, refuse: bool) {
        self.state.refuse_connects.store(refuse, Ordering::SeqCst);
    }

    pub fn mute_heartbeats(&self, mute: bool) {
        self.state.mute_heartbeats.store(mute, Ordering::SeqCst);
    }

    pub fn mute_login(&self, mute: bool) {
        self.state.mute_login.store(mute, Ordering::SeqCst);
    }

    /// While set, every write pends forever.
    pub fn stall_writes(&self, stall: bool) {
        self.state.stall_writes.store(stall, Ordering::SeqCst);
    }

    /// Sockets handed out and not yet dropped by the client.
    pub fn open_sockets(&self) -> u32 {
        self.state.open_sockets.load(Ordering::SeqCst)
    }

    /// Response code for `/reg`. 200 accepts the login.
    pub fn login_code(&self, code: i64) {
        self.state.login_code.store(code, Ordering::SeqCst);
    }

    pub fn connects(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Close every open socket from the server side.
    pub fn hang_up(&self) {
        for session in self.state.sessions.lock().unwrap().drain(..) {
            let _ = session.send(Inbound::Hangup);
        }
    }

    /// Deliver a raw text frame on every open socket.
    pub fn push(&self, frame: impl Into<String>) {
        let frame = frame.into();
        for session in self.state.sessions.lock().unwrap().iter() {
            let _ = session.send(Inbound::Frame(frame.clone()));
        }
    }

    /// Every frame the client wrote, in order.
    pub fn frames(&self) -> Vec<Value> {
        self.state.frames.lock().unwrap().clone()
    }

    pub fn frames_with_lwp(&self, lwp: &str) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|f| f["lwp"] == lwp)
            .collect()
    }

    pub fn heartbeats(&self) -> usize {
        self.frames_with_lwp(LWP_HEARTBEAT).len()
    }
}

#[async_trait]
impl Connector for MockGateway {
    async fn connect(
        &self,
        _credential: &AccountCredential,
    ) -> Result<Box<dyn ChatSocket>, TransportError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if self.state.refuse_connects.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.state.sessions.lock().unwrap().push(tx.clone());
        self.state.open_sockets.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSocket {
            state: Arc::clone(&self.state),
            inbound: rx,
            loopback: tx,
            closed: false,
        }))
    }
}

struct MockSocket {
    state: Arc<GatewayState>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    /// Lets the socket answer requests synchronously.
    loopback: mpsc::UnboundedSender<Inbound>,
    closed: bool,
}

impl MockSocket {
    fn reply(&self, mid: &Value, code: i64) {
        let frame = json!({ "code": code, "headers": { "mid": mid } }).to_string();
        let _ = self.loopback.send(Inbound::Frame(frame));
    }
}

impl Drop for MockSocket {
    fn drop(&mut self) {
        self.state.open_sockets.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChatSocket for MockSocket {
    async fn send_text(&mut self, frame: String) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Send("socket closed".into()));
        }
        if self.state.stall_writes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let value: Value = serde_json::from_str(&frame).unwrap_or(Value::Null);
        let lwp = value["lwp"].as_str().unwrap_or_default().to_string();
        let mid = value["headers"]["mid"].clone();
        self.state.frames.lock().unwrap().push(value);

        if lwp == LWP_REGISTER && !self.state.mute_login.load(Ordering::SeqCst) {
            self.reply(&mid, self.state.login_code.load(Ordering::SeqCst));
        } else if lwp == LWP_HEARTBEAT && !self.state.mute_heartbeats.load(Ordering::SeqCst) {
            self.reply(&mid, 200);
        }
        Ok(())
    }

    async fn recv_text(&mut self) -> Option<Result<String, TransportError>> {
        if self.closed {
            return None;
        }
        match self.inbound.recv().await {
            Some(Inbound::Frame(text)) => Some(Ok(text)),
            Some(Inbound::Hangup) | None => {
                self.closed = true;
                None
            }
        }
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

/// Token source with per-account failure switches.
#[derive(Default)]
pub struct MockTokens {
    failing: Mutex<HashSet<String>>,
    calls: AtomicU32,
}

impl MockTokens {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_for(&self, account_id: &str) {
        self.failing.lock().unwrap().insert(account_id.to_string());
    }

    pub fn recover(&self, account_id: &str) {
        self.failing.lock().unwrap().remove(account_id);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSource for MockTokens {
    async fn fetch_token(&self, credential: &AccountCredential) -> Result<String, AuthError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.lock().unwrap().contains(&credential.account_id) {
            return Err(AuthError::Rejected("FAIL_SYS_SESSION_EXPIRED::Session过期".into()));
        }
        Ok(format!("token-{}-{n}", credential.account_id))
    }
}

// ---------------------------------------------------------------------------
// Builders and helpers
// ---------------------------------------------------------------------------

pub fn credential(account_id: &str) -> AccountCredential {
    AccountCredential::new(
        account_id,
        format!("unb={account_id}; _m_h5_tk=abc_123"),
        format!("DEVICE-{account_id}"),
    )
}

pub fn build_manager(gateway: &MockGateway, tokens: &Arc<MockTokens>) -> Arc<ClientManager> {
    build_manager_with(gateway, tokens, ConnectionConfig::default())
}

pub fn build_manager_with(
    gateway: &MockGateway,
    tokens: &Arc<MockTokens>,
    config: ConnectionConfig,
) -> Arc<ClientManager> {
    ClientManager::new(
        config,
        gateway.connector(),
        Arc::clone(tokens) as Arc<dyn TokenSource>,
        Arc::new(EventBus::default()),
    )
}

/// Bound on how long (virtual time) a test waits for a state.
pub const WAIT_LIMIT: Duration = Duration::from_secs(600);

pub async fn wait_for_state(
    handle: &AccountConnectionHandle,
    state: ConnectionState,
) -> ConnectionStatus {
    tokio::time::timeout(WAIT_LIMIT, handle.wait_for(|s| s.state == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}, last status {:?}", handle.status()))
}

/// A sync push carrying one chat message.
pub fn chat_push(mid: &str, conversation: &str, sender: &str, text: &str) -> String {
    use base64::Engine;

    let payload = json!({
        "1": {
            "2": format!("{conversation}@goofish"),
            "10": { "reminderContent": text, "senderUserId": sender }
        }
    });
    let data = base64::engine::general_purpose::STANDARD.encode(payload.to_string());
    json!({
        "lwp": "/s/para",
        "headers": { "mid": mid, "sid": "sid-1" },
        "body": { "syncPushPackage": { "data": [{ "data": data }] } }
    })
    .to_string()
}
