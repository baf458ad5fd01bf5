//! Registry of account connections.
//!
//! [`ClientManager`] owns one [`AccountConnection`] task per registered
//! seller account, routes outbound sends to the right connection, and
//! fans every inbound event out through a shared [`EventBus`].
//!
//! The registry map is behind a `RwLock`: sends and lookups take the read
//! side concurrently, register/unregister take the write side. An entry
//! is inserted fully built (handle and task together), so readers never
//! observe a half-constructed connection.
//!
//! Register and unregister of one account are serialised by a per-account
//! gate, and a connection is only spawned once the task it replaces has
//! exited (or been aborted). An account never holds two sockets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use relay_core::status::ConnectionStatus;
use relay_core::types::AccountId;
use relay_events::{EventBus, EventSink, RelayEvent, SinkDispatcher};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;
use crate::connection::{AccountConnection, AccountConnectionHandle, OutboundRequest};
use crate::credential::AccountCredential;
use crate::token::TokenSource;
use crate::transport::Connector;

/// How long shutdown waits for each connection task to exit.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Manages the connections of every registered account.
///
/// Created once at startup; the returned `Arc` is cloned into request
/// handlers.
pub struct ClientManager {
    clients: RwLock<HashMap<AccountId, ManagedAccount>>,
    config: Arc<ConnectionConfig>,
    connector: Arc<dyn Connector>,
    token_source: Arc<dyn TokenSource>,
    events: Arc<EventBus>,
    /// Per-account lifecycle locks.
    gates: Mutex<HashMap<AccountId, Arc<Mutex<()>>>>,
    /// Master token; every connection runs on a child of it.
    cancel: CancellationToken,
}

struct ManagedAccount {
    handle: AccountConnectionHandle,
    task: JoinHandle<()>,
}

impl ManagedAccount {
    /// Still worth keeping: running, not shut down and not given up.
    fn is_active(&self) -> bool {
        !self.task.is_finished()
            && !self.handle.is_shutdown()
            && !self.handle.status().is_terminated()
    }
}

impl ClientManager {
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        token_source: Arc<dyn TokenSource>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            config: Arc::new(config),
            connector,
            token_source,
            events,
            gates: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Create and start a connection for the credential's account.
    ///
    /// Fails with [`ManagerError::DuplicateAccount`] if the account is
    /// already registered and active. An entry whose connection has shut
    /// down or been marked fatal is replaced.
    pub async fn register(
        &self,
        credential: AccountCredential,
    ) -> Result<AccountConnectionHandle, ManagerError> {
        if self.cancel.is_cancelled() {
            return Err(ManagerError::ShuttingDown);
        }

        let account_id = credential.account_id.clone();
        let gate = self.gate(&account_id).await;
        let _lifecycle = gate.lock().await;

        let stale = {
            let mut clients = self.clients.write().await;
            match clients.get(&account_id).map(ManagedAccount::is_active) {
                Some(true) => return Err(ManagerError::DuplicateAccount(account_id)),
                Some(false) => clients.remove(&account_id),
                None => None,
            }
        };
        if let Some(stale) = stale {
            tracing::info!(account_id = %account_id, "Replacing terminated connection");
            retire(&account_id, stale).await;
        }

        let (handle, task) = AccountConnection::spawn(
            credential,
            Arc::clone(&self.config),
            Arc::clone(&self.connector),
            Arc::clone(&self.token_source),
            Arc::clone(&self.events),
            self.cancel.child_token(),
        );
        let mut clients = self.clients.write().await;
        clients.insert(
            account_id.clone(),
            ManagedAccount {
                handle: handle.clone(),
                task,
            },
        );

        tracing::info!(account_id = %account_id, accounts = clients.len(), "Account registered");
        Ok(handle)
    }

    /// Stop the account's connection and drop it from the registry.
    /// No-op if the account is not registered.
    ///
    /// Returns once the connection task has exited.
    pub async fn unregister(&self, account_id: &str) {
        let gate = self.gate(account_id).await;
        let _lifecycle = gate.lock().await;

        let removed = self.clients.write().await.remove(account_id);
        let Some(managed) = removed else {
            tracing::debug!(account_id, "Unregister of unknown account ignored");
            return;
        };

        retire(account_id, managed).await;
        tracing::info!(account_id, "Account unregistered");
    }

    /// Non-blocking lookup for send paths.
    pub async fn get_client(&self, account_id: &str) -> Option<AccountConnectionHandle> {
        self.clients
            .read()
            .await
            .get(account_id)
            .map(|managed| managed.handle.clone())
    }

    /// Send a text message from `account_id`.
    ///
    /// Fails with [`ManagerError::AccountNotConnected`] when the account
    /// is unregistered or its connection is not `Ready`; transport detail
    /// is never surfaced.
    pub async fn send(&self, account_id: &str, request: OutboundRequest) -> Result<(), ManagerError> {
        let handle = self
            .get_client(account_id)
            .await
            .ok_or_else(|| ManagerError::AccountNotConnected(account_id.to_string()))?;

        handle.send(request).await.map_err(|e| {
            tracing::debug!(account_id, error = %e, "Send refused");
            ManagerError::AccountNotConnected(account_id.to_string())
        })
    }

    pub async fn status(&self, account_id: &str) -> Option<ConnectionStatus> {
        self.clients
            .read()
            .await
            .get(account_id)
            .map(|managed| managed.handle.status())
    }

    /// Status of every registered account, ordered by account id.
    pub async fn statuses(&self) -> Vec<ConnectionStatus> {
        let mut statuses: Vec<ConnectionStatus> = self
            .clients
            .read()
            .await
            .values()
            .map(|managed| managed.handle.status())
            .collect();
        statuses.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        statuses
    }

    pub async fn account_ids(&self) -> Vec<AccountId> {
        let mut ids: Vec<AccountId> = self.clients.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Subscribe to inbound events and status changes of every account.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Feed every relay event to `sink` on its own task.
    pub fn attach_sink<S: EventSink>(&self, sink: Arc<S>) -> JoinHandle<u64> {
        tracing::info!(sink = sink.name(), "Attaching event sink");
        SinkDispatcher::spawn(sink, self.events.subscribe())
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    async fn gate(&self, account_id: &str) -> Arc<Mutex<()>> {
        let mut gates = self.gates.lock().await;
        Arc::clone(gates.entry(account_id.to_string()).or_default())
    }

    /// Shut every connection down, waiting up to 5 seconds per task.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down client manager");
        self.cancel.cancel();

        let mut clients = self.clients.write().await;
        for (account_id, managed) in clients.drain() {
            tracing::info!(account_id = %account_id, "Stopping connection task");
            retire(&account_id, managed).await;
        }

        tracing::info!("Client manager shut down complete");
    }
}

/// Stop a connection and wait for its task, aborting it if it does not
/// exit within [`TASK_SHUTDOWN_TIMEOUT`].
async fn retire(account_id: &str, managed: ManagedAccount) {
    managed.handle.shutdown();
    let mut task = managed.task;
    if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
        tracing::warn!(account_id, "Connection task did not exit in time, aborting");
        task.abort();
        let _ = task.await;
    }
}

/// Caller usage errors reported by the manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManagerError {
    #[error("Account {0} is already registered")]
    DuplicateAccount(AccountId),

    /// Unregistered, or registered but not `Ready`.
    #[error("Account {0} is not connected")]
    AccountNotConnected(AccountId),

    #[error("Client manager is shutting down")]
    ShuttingDown,
}
