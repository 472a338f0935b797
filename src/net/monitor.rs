//! Network and liveness monitoring
//!
//! Periodic TCP probes against a short list of well-known endpoints,
//! coalesced into state-change events, plus sleep/wake inference from
//! monotonic drift between ticks. Events are hints only; the monitor
//! owns no connections and consumers must stay correct if no event is
//! ever emitted.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connectivity hint events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// Connectivity restored
    Connected { reason: String },
    /// All probes failing
    Disconnected { reason: String },
    /// Partial failure; connections should be revalidated
    Suspicious { reason: String },
}

/// Sleep/wake hint events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SleepWakeEvent {
    /// Tick arrived far later than scheduled; the host likely slept
    SuspectedWake { drift: Duration },
}

/// Monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Endpoints probed each tick
    pub probe_endpoints: Vec<SocketAddr>,
    /// Interval between probe rounds
    pub probe_interval: Duration,
    /// Per-probe connect timeout
    pub probe_timeout: Duration,
    /// Drift beyond the interval that suggests a sleep/wake cycle
    pub wake_drift_threshold: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_endpoints: vec![
                "1.1.1.1:443".parse().expect("static addr"),
                "8.8.8.8:53".parse().expect("static addr"),
            ],
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            wake_drift_threshold: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connectivity {
    Unknown,
    Up,
    Degraded,
    Down,
}

/// Background connectivity monitor
pub struct NetworkMonitor {
    config: MonitorConfig,
    network_tx: broadcast::Sender<NetworkEvent>,
    sleep_wake_tx: broadcast::Sender<SleepWakeEvent>,
    task: Option<JoinHandle<()>>,
}

impl NetworkMonitor {
    /// Create a monitor; call `start` to begin probing
    pub fn new(config: MonitorConfig) -> Self {
        let (network_tx, _) = broadcast::channel(32);
        let (sleep_wake_tx, _) = broadcast::channel(16);
        Self {
            config,
            network_tx,
            sleep_wake_tx,
            task: None,
        }
    }

    /// Subscribe to connectivity events
    pub fn subscribe_network(&self) -> broadcast::Receiver<NetworkEvent> {
        self.network_tx.subscribe()
    }

    /// Subscribe to sleep/wake events
    pub fn subscribe_sleep_wake(&self) -> broadcast::Receiver<SleepWakeEvent> {
        self.sleep_wake_tx.subscribe()
    }

    /// Start the probe loop
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        let config = self.config.clone();
        let network_tx = self.network_tx.clone();
        let sleep_wake_tx = self.sleep_wake_tx.clone();

        self.task = Some(tokio::spawn(async move {
            let mut state = Connectivity::Unknown;
            let mut last_tick = Instant::now();
            let mut ticker = tokio::time::interval(config.probe_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let now = Instant::now();
                let elapsed = now.duration_since(last_tick);
                last_tick = now;
                let drift = elapsed.saturating_sub(config.probe_interval);
                if drift >= config.wake_drift_threshold {
                    info!(?drift, "suspected wake from sleep");
                    let _ = sleep_wake_tx.send(SleepWakeEvent::SuspectedWake { drift });
                }

                let next = probe_round(&config).await;
                if next != state {
                    emit_transition(&network_tx, state, next);
                    state = next;
                }
            }
        }));
    }

    /// Stop the probe loop
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Whether the probe loop is running
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    #[cfg(test)]
    fn emit_network(&self, event: NetworkEvent) {
        let _ = self.network_tx.send(event);
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn probe_round(config: &MonitorConfig) -> Connectivity {
    if config.probe_endpoints.is_empty() {
        return Connectivity::Unknown;
    }

    let mut reachable = 0usize;
    for addr in &config.probe_endpoints {
        let connect = TcpStream::connect(addr);
        match tokio::time::timeout(config.probe_timeout, connect).await {
            Ok(Ok(_)) => reachable += 1,
            Ok(Err(err)) => debug!(%addr, %err, "probe failed"),
            Err(_) => debug!(%addr, "probe timed out"),
        }
    }

    if reachable == config.probe_endpoints.len() {
        Connectivity::Up
    } else if reachable > 0 {
        Connectivity::Degraded
    } else {
        Connectivity::Down
    }
}

fn emit_transition(tx: &broadcast::Sender<NetworkEvent>, from: Connectivity, to: Connectivity) {
    let event = match to {
        Connectivity::Up => NetworkEvent::Connected {
            reason: "all probes reachable".to_string(),
        },
        Connectivity::Degraded => NetworkEvent::Suspicious {
            reason: "some probes unreachable".to_string(),
        },
        Connectivity::Down => NetworkEvent::Disconnected {
            reason: "no probe reachable".to_string(),
        },
        Connectivity::Unknown => return,
    };
    match &event {
        NetworkEvent::Disconnected { reason } => warn!(?from, %reason, "network down"),
        NetworkEvent::Suspicious { reason } => warn!(?from, %reason, "network degraded"),
        NetworkEvent::Connected { reason } => info!(?from, %reason, "network up"),
    }
    // Send never blocks; lagged receivers drop events.
    let _ = tx.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_probe_round_with_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = MonitorConfig {
            probe_endpoints: vec![addr],
            probe_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        assert_eq!(probe_round(&config).await, Connectivity::Up);
    }

    #[tokio::test]
    async fn test_probe_round_all_unreachable() {
        // Port 1 on localhost is essentially never listening.
        let config = MonitorConfig {
            probe_endpoints: vec!["127.0.0.1:1".parse().unwrap()],
            probe_timeout: Duration::from_millis(300),
            ..Default::default()
        };
        assert_eq!(probe_round(&config).await, Connectivity::Down);
    }

    #[tokio::test]
    async fn test_degraded_when_partially_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let good = listener.local_addr().unwrap();

        let config = MonitorConfig {
            probe_endpoints: vec![good, "127.0.0.1:1".parse().unwrap()],
            probe_timeout: Duration::from_millis(300),
            ..Default::default()
        };
        assert_eq!(probe_round(&config).await, Connectivity::Degraded);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let monitor = NetworkMonitor::new(MonitorConfig::default());
        let mut rx = monitor.subscribe_network();

        monitor.emit_network(NetworkEvent::Disconnected {
            reason: "test".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, NetworkEvent::Disconnected { .. }));
    }

    #[tokio::test]
    async fn test_start_stop() {
        let mut monitor = NetworkMonitor::new(MonitorConfig {
            probe_endpoints: vec![],
            probe_interval: Duration::from_millis(50),
            ..Default::default()
        });
        assert!(!monitor.is_running());

        monitor.start();
        assert!(monitor.is_running());

        monitor.stop();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_emit_transition_coalesces_unknown() {
        let (tx, mut rx) = broadcast::channel(8);
        emit_transition(&tx, Connectivity::Up, Connectivity::Unknown);
        assert!(rx.try_recv().is_err());

        emit_transition(&tx, Connectivity::Unknown, Connectivity::Up);
        assert!(matches!(
            rx.try_recv().unwrap(),
            NetworkEvent::Connected { .. }
        ));
    }
}
