//! Connection manager: the single owner of instance connection state
//!
//! All state lives on one dispatch task; every mutation arrives as a
//! typed command with a reply channel, so no caller ever holds a lock on
//! a `ConnectionInfo`. Reads return defensive copies. Connection
//! attempts, revalidation probes, and liveness ticks feed back through
//! the same command channel, which serializes every transition.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::core::config::ClientConfig;
use crate::core::error::{HubError, HubResult};
use crate::instance::{Instance, InstanceClient};
use crate::net::backoff::ExponentialBackoff;
use crate::net::monitor::{NetworkEvent, NetworkMonitor, SleepWakeEvent};

/// Bounded length of the per-instance transition history
pub const MAX_HISTORY: usize = 100;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered but not yet attempted
    Discovered,
    /// A connection attempt is in flight
    Connecting,
    /// Initialized and usable
    Active,
    /// Between reconnection attempts
    Retrying,
    /// Attempts exhausted; terminal until re-registration
    Dead,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Discovered => "discovered",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Active => "active",
            ConnectionState::Retrying => "retrying",
            ConnectionState::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// One recorded state transition
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Per-instance connection record; snapshots of this are handed to
/// callers, never references into the manager's map.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub instance: Instance,
    pub state: ConnectionState,
    pub client: Option<Arc<InstanceClient>>,
    pub discovered_at: DateTime<Utc>,
    pub state_changed_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub history: VecDeque<StateTransition>,
}

impl ConnectionInfo {
    fn new(instance: Instance) -> Self {
        let now = Utc::now();
        Self {
            discovered_at: instance.discovered_at,
            instance,
            state: ConnectionState::Discovered,
            client: None,
            state_changed_at: now,
            last_activity: now,
            connected_at: None,
            retry_count: 0,
            history: VecDeque::new(),
        }
    }
}

/// Manager tuning knobs
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Connection attempts before an instance is marked Dead
    pub max_retries: u32,
    /// Deadline for client construction + initialize
    pub connect_deadline: Duration,
    /// Interval of the background liveness tick
    pub tick_interval: Duration,
    /// Active connections idle longer than this are marked Retrying
    pub stale_after: Duration,
    /// Backoff between reconnection attempts
    pub backoff: ExponentialBackoff,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            connect_deadline: Duration::from_secs(5),
            tick_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(20),
            backoff: ExponentialBackoff::default(),
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

enum Command {
    Register(Instance, oneshot::Sender<()>),
    Deregister(String, oneshot::Sender<()>),
    ConnectSession {
        session_id: String,
        instance_id: String,
        reply: oneshot::Sender<HubResult<()>>,
    },
    DisconnectSession(String, oneshot::Sender<()>),
    Ensure(String, oneshot::Sender<bool>),
    ChangeState {
        instance_id: String,
        state: ConnectionState,
        reason: String,
        generation: Option<u64>,
        reply: Option<oneshot::Sender<()>>,
    },
    ListInstances(oneshot::Sender<Vec<ConnectionInfo>>),
    GetClient(String, oneshot::Sender<Option<Arc<InstanceClient>>>),
    GetInstanceClient(String, oneshot::Sender<Option<Arc<InstanceClient>>>),
    SetClient {
        instance_id: String,
        client: Arc<InstanceClient>,
        generation: Option<u64>,
        reply: Option<oneshot::Sender<()>>,
    },
    Touch(String),
    SessionCount(String, oneshot::Sender<usize>),
    Shutdown(oneshot::Sender<()>),
}

struct Entry {
    info: ConnectionInfo,
    /// Bumped on every (re-)registration; stale attempt tasks are ignored
    generation: u64,
    attempt_running: bool,
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable handle to the dispatch task
#[derive(Clone)]
pub struct ConnectionManager {
    tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager").finish()
    }
}

impl ConnectionManager {
    /// Start the dispatch task and return a handle to it
    pub fn spawn(client_config: ClientConfig, robust: bool, config: ManagerConfig) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let dispatch = Dispatch {
            entries: HashMap::new(),
            sessions: HashMap::new(),
            instance_sessions: HashMap::new(),
            client_config,
            robust,
            config,
            tx: tx.clone(),
            next_generation: 0,
        };
        tokio::spawn(dispatch.run(rx));
        Self { tx }
    }

    async fn send(&self, command: Command) {
        let _ = self.tx.send(command).await;
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(make(reply_tx)).await;
        reply_rx.await.ok()
    }

    /// Register an instance; idempotent on a live ID, revives a Dead one.
    /// Spawns an asynchronous connection attempt for new registrations.
    pub async fn register(&self, instance: Instance) {
        let _ = self.call(|reply| Command::Register(instance, reply)).await;
    }

    /// Remove an instance entirely (discovery says it is gone)
    pub async fn deregister(&self, instance_id: &str) {
        let _ = self
            .call(|reply| Command::Deregister(instance_id.to_string(), reply))
            .await;
    }

    /// Map a session to an instance. Fails when the session is already
    /// mapped to a different instance or the instance is not Active.
    pub async fn connect_session(&self, session_id: &str, instance_id: &str) -> HubResult<()> {
        self.call(|reply| Command::ConnectSession {
            session_id: session_id.to_string(),
            instance_id: instance_id.to_string(),
            reply,
        })
        .await
        .unwrap_or_else(|| Err(HubError::internal("connection manager stopped")))
    }

    /// Remove a session mapping; idempotent.
    pub async fn disconnect_session(&self, session_id: &str) {
        let _ = self
            .call(|reply| Command::DisconnectSession(session_id.to_string(), reply))
            .await;
    }

    /// Whether the instance is Active; also refreshes its activity clock
    pub async fn ensure(&self, instance_id: &str) -> bool {
        self.call(|reply| Command::Ensure(instance_id.to_string(), reply))
            .await
            .unwrap_or(false)
    }

    /// Apply a state transition with a recorded reason
    pub async fn change_state(&self, instance_id: &str, state: ConnectionState, reason: &str) {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::ChangeState {
            instance_id: instance_id.to_string(),
            state,
            reason: reason.to_string(),
            generation: None,
            reply: Some(reply_tx),
        })
        .await;
        let _ = reply_rx.await;
    }

    /// Snapshot of all non-Dead instances
    pub async fn list_instances(&self) -> Vec<ConnectionInfo> {
        self.call(Command::ListInstances).await.unwrap_or_default()
    }

    /// Client for the instance a session is mapped to, if Active
    pub async fn get_client(&self, session_id: &str) -> Option<Arc<InstanceClient>> {
        self.call(|reply| Command::GetClient(session_id.to_string(), reply))
            .await
            .flatten()
    }

    /// Client for an instance, if Active
    pub async fn client_for_instance(&self, instance_id: &str) -> Option<Arc<InstanceClient>> {
        self.call(|reply| Command::GetInstanceClient(instance_id.to_string(), reply))
            .await
            .flatten()
    }

    /// Publish a freshly initialized client, moving the instance Active
    pub async fn set_client(&self, instance_id: &str, client: Arc<InstanceClient>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::SetClient {
            instance_id: instance_id.to_string(),
            client,
            generation: None,
            reply: Some(reply_tx),
        })
        .await;
        let _ = reply_rx.await;
    }

    /// Refresh an instance's activity clock after a successful forward
    pub async fn touch(&self, instance_id: &str) {
        self.send(Command::Touch(instance_id.to_string())).await;
    }

    /// Number of sessions mapped to an instance
    pub async fn session_count(&self, instance_id: &str) -> usize {
        self.call(|reply| Command::SessionCount(instance_id.to_string(), reply))
            .await
            .unwrap_or(0)
    }

    /// Stop the dispatch task, closing all clients
    pub async fn shutdown(&self) {
        let _ = self.call(Command::Shutdown).await;
    }

    /// Subscribe to monitor hints: connectivity losses trigger
    /// revalidation probes, suspected wakes reset circuit breakers.
    /// Pure hints; the manager stays correct if none ever arrive.
    pub fn attach_monitor(&self, monitor: &NetworkMonitor) {
        let mut network_rx = monitor.subscribe_network();
        let manager = self.clone();
        tokio::spawn(async move {
            while let Ok(event) = network_rx.recv().await {
                match event {
                    NetworkEvent::Disconnected { reason } | NetworkEvent::Suspicious { reason } => {
                        manager.revalidate_all(&reason).await;
                    }
                    NetworkEvent::Connected { .. } => {}
                }
            }
        });

        let mut wake_rx = monitor.subscribe_sleep_wake();
        let manager = self.clone();
        tokio::spawn(async move {
            while let Ok(SleepWakeEvent::SuspectedWake { drift }) = wake_rx.recv().await {
                info!(?drift, "wake hint: resetting breakers and revalidating");
                for info in manager.list_instances().await {
                    if let Some(client) = info.client {
                        client.reset_breaker().await;
                    }
                }
                manager.revalidate_all("suspected wake from sleep").await;
            }
        });
    }

    /// Probe every Active instance; failures mark the connection Retrying
    pub async fn revalidate_all(&self, reason: &str) {
        for info in self.list_instances().await {
            if info.state != ConnectionState::Active {
                continue;
            }
            let Some(client) = info.client else { continue };
            let manager = self.clone();
            let instance_id = info.instance.id.clone();
            let reason = reason.to_string();
            tokio::spawn(async move {
                match client.ping(Some(Duration::from_secs(5))).await {
                    Ok(()) => manager.touch(&instance_id).await,
                    Err(err) => {
                        warn!(instance = %instance_id, %err, %reason, "revalidation failed");
                        manager
                            .change_state(
                                &instance_id,
                                ConnectionState::Retrying,
                                &format!("revalidation failed: {err}"),
                            )
                            .await;
                    }
                }
            });
        }
    }
}

// ============================================================================
// Dispatch task
// ============================================================================

struct Dispatch {
    entries: HashMap<String, Entry>,
    sessions: HashMap<String, String>,
    instance_sessions: HashMap<String, HashSet<String>>,
    client_config: ClientConfig,
    robust: bool,
    config: ManagerConfig,
    tx: mpsc::Sender<Command>,
    next_generation: u64,
}

impl Dispatch {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = rx.recv() => {
                    match command {
                        Some(Command::Shutdown(reply)) => {
                            self.close_all();
                            let _ = reply.send(());
                            return;
                        }
                        Some(command) => self.handle(command),
                        None => return,
                    }
                }
                _ = ticker.tick() => self.liveness_tick(),
            }
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register(instance, reply) => {
                self.register(instance);
                let _ = reply.send(());
            }
            Command::Deregister(instance_id, reply) => {
                if let Some(entry) = self.entries.remove(&instance_id) {
                    if let Some(client) = entry.info.client {
                        client.close();
                    }
                    info!(instance = %instance_id, "instance deregistered");
                }
                if let Some(sessions) = self.instance_sessions.remove(&instance_id) {
                    for session in sessions {
                        self.sessions.remove(&session);
                    }
                }
                let _ = reply.send(());
            }
            Command::ConnectSession {
                session_id,
                instance_id,
                reply,
            } => {
                let _ = reply.send(self.connect_session(session_id, instance_id));
            }
            Command::DisconnectSession(session_id, reply) => {
                if let Some(instance_id) = self.sessions.remove(&session_id)
                    && let Some(set) = self.instance_sessions.get_mut(&instance_id)
                {
                    set.remove(&session_id);
                    if set.is_empty() {
                        self.instance_sessions.remove(&instance_id);
                    }
                }
                let _ = reply.send(());
            }
            Command::Ensure(instance_id, reply) => {
                let active = match self.entries.get_mut(&instance_id) {
                    Some(entry) => {
                        entry.info.last_activity = Utc::now();
                        entry.info.state == ConnectionState::Active
                    }
                    None => false,
                };
                let _ = reply.send(active);
            }
            Command::ChangeState {
                instance_id,
                state,
                reason,
                generation,
                reply,
            } => {
                self.change_state(&instance_id, state, &reason, generation);
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Command::ListInstances(reply) => {
                let snapshot = self
                    .entries
                    .values()
                    .filter(|entry| entry.info.state != ConnectionState::Dead)
                    .map(|entry| entry.info.clone())
                    .collect();
                let _ = reply.send(snapshot);
            }
            Command::GetClient(session_id, reply) => {
                let client = self
                    .sessions
                    .get(&session_id)
                    .and_then(|instance_id| self.entries.get(instance_id))
                    .filter(|entry| entry.info.state == ConnectionState::Active)
                    .and_then(|entry| entry.info.client.clone());
                let _ = reply.send(client);
            }
            Command::GetInstanceClient(instance_id, reply) => {
                let client = self
                    .entries
                    .get(&instance_id)
                    .filter(|entry| entry.info.state == ConnectionState::Active)
                    .and_then(|entry| entry.info.client.clone());
                let _ = reply.send(client);
            }
            Command::SetClient {
                instance_id,
                client,
                generation,
                reply,
            } => {
                self.set_client(&instance_id, client, generation);
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Command::Touch(instance_id) => {
                if let Some(entry) = self.entries.get_mut(&instance_id) {
                    entry.info.last_activity = Utc::now();
                }
            }
            Command::SessionCount(instance_id, reply) => {
                let count = self
                    .instance_sessions
                    .get(&instance_id)
                    .map_or(0, HashSet::len);
                let _ = reply.send(count);
            }
            Command::Shutdown(_) => unreachable!("handled in run"),
        }
    }

    fn register(&mut self, instance: Instance) {
        if let Some(entry) = self.entries.get(&instance.id) {
            if entry.info.state != ConnectionState::Dead {
                debug!(instance = %instance.id, "register is a no-op for a live instance");
                return;
            }
            info!(instance = %instance.id, "re-registering dead instance");
        } else {
            info!(instance = %instance.id, port = instance.port, "instance registered");
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let instance_id = instance.id.clone();
        self.entries.insert(
            instance_id.clone(),
            Entry {
                info: ConnectionInfo::new(instance.clone()),
                generation,
                attempt_running: true,
            },
        );
        self.spawn_attempts(instance, generation);
    }

    fn spawn_attempts(&self, instance: Instance, generation: u64) {
        let tx = self.tx.clone();
        let client_config = self.client_config.clone();
        let robust = self.robust;
        let config = self.config.clone();
        tokio::spawn(run_connection_attempts(
            tx,
            instance,
            generation,
            client_config,
            robust,
            config,
        ));
    }

    fn connect_session(&mut self, session_id: String, instance_id: String) -> HubResult<()> {
        if let Some(existing) = self.sessions.get(&session_id) {
            if *existing == instance_id {
                return Ok(());
            }
            return Err(HubError::validation(format!(
                "session {session_id} is already connected to {existing}"
            )));
        }

        let active = self
            .entries
            .get(&instance_id)
            .is_some_and(|entry| entry.info.state == ConnectionState::Active);
        if !active {
            return Err(HubError::not_connected(instance_id));
        }

        self.sessions.insert(session_id.clone(), instance_id.clone());
        self.instance_sessions
            .entry(instance_id)
            .or_default()
            .insert(session_id);
        Ok(())
    }

    fn change_state(
        &mut self,
        instance_id: &str,
        state: ConnectionState,
        reason: &str,
        generation: Option<u64>,
    ) {
        let respawn = {
            let Some(entry) = self.entries.get_mut(instance_id) else {
                return;
            };
            if generation.is_some_and(|g| g != entry.generation) {
                debug!(instance = %instance_id, "dropping stale transition");
                return;
            }
            if entry.info.state == state {
                return;
            }
            // SetClient is the only path into Active; a bare transition
            // would leave an Active entry with no client.
            if state == ConnectionState::Active && entry.info.client.is_none() {
                warn!(instance = %instance_id, "refusing Active transition without a client");
                return;
            }

            let now = Utc::now();
            let transition = StateTransition {
                from: entry.info.state,
                to: state,
                reason: reason.to_string(),
                at: now,
            };
            info!(
                instance = %instance_id,
                from = %transition.from,
                to = %transition.to,
                reason,
                "state transition"
            );
            entry.info.history.push_back(transition);
            while entry.info.history.len() > MAX_HISTORY {
                entry.info.history.pop_front();
            }

            entry.info.state = state;
            entry.info.state_changed_at = now;
            if state == ConnectionState::Retrying {
                entry.info.retry_count += 1;
            }
            // client present iff Active
            if state != ConnectionState::Active
                && let Some(client) = entry.info.client.take()
            {
                client.close();
            }
            if state == ConnectionState::Dead {
                entry.attempt_running = false;
            }

            // An externally requested Retrying (staleness, failed
            // revalidation) needs a fresh attempt loop.
            state == ConnectionState::Retrying && !entry.attempt_running
        };

        if respawn {
            let spawn_info = self.entries.get_mut(instance_id).map(|entry| {
                entry.attempt_running = true;
                (entry.info.instance.clone(), entry.generation)
            });
            if let Some((instance, generation)) = spawn_info {
                self.spawn_attempts(instance, generation);
            }
        }
    }

    fn set_client(
        &mut self,
        instance_id: &str,
        client: Arc<InstanceClient>,
        generation: Option<u64>,
    ) {
        let Some(entry) = self.entries.get_mut(instance_id) else {
            client.close();
            return;
        };
        if generation.is_some_and(|g| g != entry.generation) {
            client.close();
            return;
        }

        let now = Utc::now();
        if entry.info.state != ConnectionState::Active {
            let transition = StateTransition {
                from: entry.info.state,
                to: ConnectionState::Active,
                reason: "initialize succeeded".to_string(),
                at: now,
            };
            entry.info.history.push_back(transition);
            while entry.info.history.len() > MAX_HISTORY {
                entry.info.history.pop_front();
            }
        }
        // A reconnect replaces the prior client.
        if let Some(previous) = entry.info.client.replace(client) {
            previous.close();
        }
        entry.info.state = ConnectionState::Active;
        entry.info.state_changed_at = now;
        entry.info.connected_at = Some(now);
        entry.info.last_activity = now;
        entry.info.retry_count = 0;
        entry.attempt_running = false;
        info!(instance = %instance_id, "instance active");
    }

    fn liveness_tick(&mut self) {
        let stale_after =
            chrono::Duration::from_std(self.config.stale_after).unwrap_or(chrono::Duration::seconds(20));
        let now = Utc::now();
        let stale: Vec<String> = self
            .entries
            .values()
            .filter(|entry| {
                entry.info.state == ConnectionState::Active
                    && now - entry.info.last_activity > stale_after
            })
            .map(|entry| entry.info.instance.id.clone())
            .collect();

        for instance_id in stale {
            warn!(instance = %instance_id, "no activity past staleness threshold");
            self.change_state(
                &instance_id,
                ConnectionState::Retrying,
                "liveness stale",
                None,
            );
        }
    }

    fn close_all(&mut self) {
        for entry in self.entries.values_mut() {
            if let Some(client) = entry.info.client.take() {
                client.close();
            }
        }
        self.entries.clear();
        self.sessions.clear();
        self.instance_sessions.clear();
    }
}

/// Connection attempt loop for one registration generation.
///
/// Runs outside the dispatch task; every outcome is reported back as a
/// command so transitions stay serialized. Failures never block the
/// request path.
async fn run_connection_attempts(
    tx: mpsc::Sender<Command>,
    instance: Instance,
    generation: u64,
    client_config: ClientConfig,
    robust: bool,
    config: ManagerConfig,
) {
    let mut backoff = config.backoff.clone();

    for attempt in 1..=config.max_retries {
        let reason = format!("connection attempt {attempt}/{}", config.max_retries);
        if tx
            .send(Command::ChangeState {
                instance_id: instance.id.clone(),
                state: ConnectionState::Connecting,
                reason,
                generation: Some(generation),
                reply: None,
            })
            .await
            .is_err()
        {
            return;
        }

        match try_connect(&instance, &client_config, robust, config.connect_deadline).await {
            Ok(client) => {
                let _ = tx
                    .send(Command::SetClient {
                        instance_id: instance.id.clone(),
                        client,
                        generation: Some(generation),
                        reply: None,
                    })
                    .await;
                return;
            }
            Err(err) => {
                let last = attempt == config.max_retries;
                let (state, reason) = if last {
                    (
                        ConnectionState::Dead,
                        format!("max retries exceeded: {err}"),
                    )
                } else {
                    (ConnectionState::Retrying, format!("initialize failed: {err}"))
                };
                if tx
                    .send(Command::ChangeState {
                        instance_id: instance.id.clone(),
                        state,
                        reason,
                        generation: Some(generation),
                        reply: None,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                if last {
                    return;
                }
                tokio::time::sleep(backoff.next_delay()).await;
            }
        }
    }
}

async fn try_connect(
    instance: &Instance,
    client_config: &ClientConfig,
    robust: bool,
    deadline: Duration,
) -> HubResult<Arc<InstanceClient>> {
    let client = Arc::new(InstanceClient::new(
        instance.clone(),
        client_config.clone(),
        robust,
    )?);
    // Client construction + initialize share one deadline.
    match tokio::time::timeout(deadline, client.initialize(Some(deadline))).await {
        Ok(Ok(_)) => Ok(client),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(HubError::timeout(format!(
            "initialize deadline exceeded for {}",
            instance.id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn fast_manager_config() -> ManagerConfig {
        ManagerConfig {
            max_retries: 2,
            connect_deadline: Duration::from_secs(2),
            tick_interval: Duration::from_millis(50),
            stale_after: Duration::from_secs(20),
            backoff: ExponentialBackoff::new(
                Duration::from_millis(10),
                Duration::from_millis(40),
                2.0,
            ),
        }
    }

    fn fast_client_config() -> ClientConfig {
        ClientConfig {
            connect_timeout_ms: 500,
            request_timeout_ms: 2_000,
            max_retries: 1,
            retry_delay_ms: 5,
            ..Default::default()
        }
    }

    async fn mock_instance_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(|req: &Request| {
                let body: Value = serde_json::from_slice(&req.body).unwrap();
                if body.get("id").is_none() {
                    return ResponseTemplate::new(200);
                }
                ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": body["id"],
                    "result": {
                        "protocolVersion": "2024-11-05",
                        "capabilities": {},
                        "serverInfo": {"name": "mock-instance", "version": "1.0.0"}
                    }
                }))
            })
            .mount(&server)
            .await;
        server
    }

    async fn wait_for_state(
        manager: &ConnectionManager,
        instance_id: &str,
        state: ConnectionState,
    ) -> ConnectionInfo {
        for _ in 0..100 {
            if let Some(info) = manager
                .list_instances()
                .await
                .into_iter()
                .find(|info| info.instance.id == instance_id && info.state == state)
            {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("instance {instance_id} never reached {state}");
    }

    #[tokio::test]
    async fn test_register_reaches_active() {
        let server = mock_instance_server().await;
        let manager =
            ConnectionManager::spawn(fast_client_config(), true, fast_manager_config());

        let instance =
            Instance::new("dev-server", "Dev", "/work", server.address().port()).unwrap();
        manager.register(instance).await;

        let info = wait_for_state(&manager, "dev-server", ConnectionState::Active).await;
        assert!(info.client.is_some());
        assert!(info.connected_at.is_some());
        assert_eq!(info.retry_count, 0);
        assert!(manager.ensure("dev-server").await);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_instance_goes_dead() {
        let manager =
            ConnectionManager::spawn(fast_client_config(), true, fast_manager_config());
        let instance = Instance::new("gone", "Gone", "/work", 1).unwrap();
        manager.register(instance).await;

        // Dead instances drop out of ListInstances.
        for _ in 0..200 {
            let listed = manager.list_instances().await;
            if listed.is_empty() {
                manager.shutdown().await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("instance never went dead");
    }

    #[tokio::test]
    async fn test_register_twice_is_noop() {
        let server = mock_instance_server().await;
        let manager =
            ConnectionManager::spawn(fast_client_config(), true, fast_manager_config());
        let instance =
            Instance::new("dev-server", "Dev", "/work", server.address().port()).unwrap();

        manager.register(instance.clone()).await;
        let info = wait_for_state(&manager, "dev-server", ConnectionState::Active).await;
        let connected_at = info.connected_at;

        manager.register(instance).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let info = wait_for_state(&manager, "dev-server", ConnectionState::Active).await;
        assert_eq!(info.connected_at, connected_at, "state was disturbed");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_session_mapping_rules() {
        let server = mock_instance_server().await;
        let manager =
            ConnectionManager::spawn(fast_client_config(), true, fast_manager_config());
        let port = server.address().port();
        manager
            .register(Instance::new("a", "A", "/a", port).unwrap())
            .await;
        manager
            .register(Instance::new("b", "B", "/b", port).unwrap())
            .await;
        wait_for_state(&manager, "a", ConnectionState::Active).await;
        wait_for_state(&manager, "b", ConnectionState::Active).await;

        manager.connect_session("s1", "a").await.unwrap();
        // Same mapping is idempotent.
        manager.connect_session("s1", "a").await.unwrap();
        // A second instance for the same session is rejected.
        assert!(manager.connect_session("s1", "b").await.is_err());
        assert_eq!(manager.session_count("a").await, 1);

        assert!(manager.get_client("s1").await.is_some());
        assert!(manager.get_client("unknown").await.is_none());

        manager.disconnect_session("s1").await;
        manager.disconnect_session("s1").await;
        assert_eq!(manager.session_count("a").await, 0);
        assert!(manager.get_client("s1").await.is_none());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_session_requires_active() {
        let manager =
            ConnectionManager::spawn(fast_client_config(), true, fast_manager_config());
        let err = manager.connect_session("s1", "nope").await.unwrap_err();
        assert!(matches!(err, HubError::InstanceNotConnected(_)));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_snapshots_are_defensive_copies() {
        let server = mock_instance_server().await;
        let manager =
            ConnectionManager::spawn(fast_client_config(), true, fast_manager_config());
        manager
            .register(Instance::new("dev", "Dev", "/work", server.address().port()).unwrap())
            .await;
        wait_for_state(&manager, "dev", ConnectionState::Active).await;

        let mut snapshot = manager.list_instances().await.remove(0);
        snapshot.state = ConnectionState::Dead;
        snapshot.retry_count = 99;

        let fresh = manager.list_instances().await.remove(0);
        assert_eq!(fresh.state, ConnectionState::Active);
        assert_eq!(fresh.retry_count, 0);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_history_stays_bounded() {
        let server = mock_instance_server().await;
        let manager =
            ConnectionManager::spawn(fast_client_config(), true, fast_manager_config());
        manager
            .register(Instance::new("dev", "Dev", "/work", server.address().port()).unwrap())
            .await;
        wait_for_state(&manager, "dev", ConnectionState::Active).await;

        // Alternate states well past the bound; oldest entries drop.
        for n in 0..130 {
            let state = if n % 2 == 0 {
                ConnectionState::Retrying
            } else {
                ConnectionState::Connecting
            };
            manager.change_state("dev", state, "churn").await;
        }

        let info = manager
            .list_instances()
            .await
            .into_iter()
            .find(|i| i.instance.id == "dev")
            .unwrap();
        assert!(info.history.len() <= MAX_HISTORY);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_dead_is_terminal_until_reregistered() {
        let manager =
            ConnectionManager::spawn(fast_client_config(), true, fast_manager_config());
        manager
            .register(Instance::new("lazarus", "Lazarus", "/work", 1).unwrap())
            .await;

        // Exhaust the attempts against a closed port.
        for _ in 0..200 {
            if manager.list_instances().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(manager.list_instances().await.is_empty());
        assert!(!manager.ensure("lazarus").await);

        // Re-registration with a live endpoint revives it.
        let server = mock_instance_server().await;
        manager
            .register(
                Instance::new("lazarus", "Lazarus", "/work", server.address().port()).unwrap(),
            )
            .await;
        wait_for_state(&manager, "lazarus", ConnectionState::Active).await;
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_change_state_records_history() {
        let server = mock_instance_server().await;
        let manager =
            ConnectionManager::spawn(fast_client_config(), true, fast_manager_config());
        manager
            .register(Instance::new("dev", "Dev", "/work", server.address().port()).unwrap())
            .await;
        wait_for_state(&manager, "dev", ConnectionState::Active).await;

        manager
            .change_state("dev", ConnectionState::Connecting, "operator request")
            .await;

        let info = manager
            .list_instances()
            .await
            .into_iter()
            .find(|i| i.instance.id == "dev")
            .unwrap();
        let last = info.history.back().unwrap();
        assert_eq!(last.to, ConnectionState::Connecting);
        assert_eq!(last.reason, "operator request");
        // client present iff Active
        assert!(info.client.is_none());
        manager.shutdown().await;
    }
}
