//! Dual-broker coordinator
//!
//! Runs one supervisor per broker and merges their output into a single
//! [`TelemetryDispatcher`]. The brokers are independent: each has its own endpoint,
//! topic set, retry cycle and task. One broker failing never fails the other, and
//! partial connectivity is reported as such instead of as an error.

use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::config::BrokerEndpoint;
use super::pipeline::{MessageCounters, MessagePipeline};
use super::retry::RetryPolicy;
use super::supervisor::{ConnectionState, SupervisorHandle};
use super::topic::TopicRouter;
use super::transport::{RumqttTransport, Transport};
use crate::events::TelemetryDispatcher;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityStatus {
    BothUp,
    OneUp(String),
    NoneUp,
}

impl fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectivityStatus::BothUp => f.write_str("both brokers up"),
            ConnectivityStatus::OneUp(name) => write!(f, "only {} up", name),
            ConnectivityStatus::NoneUp => f.write_str("no broker up"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerStats {
    pub name: String,
    pub client_id: String,
    pub state: ConnectionState,
    pub attempt: u32,
    pub messages: u64,
    pub last_error: Option<String>,
    pub connected_since: Option<DateTime<Local>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorStats {
    pub status: ConnectivityStatus,
    pub brokers: Vec<BrokerStats>,
    pub dropped: u64,
    pub uptime: Duration,
}

impl CoordinatorStats {
    pub fn uptime_hms(&self) -> String {
        let secs = self.uptime.as_secs();
        format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

pub struct DualBrokerCoordinator {
    supervisors: [SupervisorHandle; 2],
    counters: Arc<MessageCounters>,
    dispatcher: Arc<TelemetryDispatcher>,
    pipeline: JoinHandle<()>,
    shutdown: CancellationToken,
    started_at: Instant,
}

impl DualBrokerCoordinator {
    pub fn new(
        endpoints: [BrokerEndpoint; 2],
        id_marker: &str,
        policy: RetryPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self::with_transports(
            endpoints,
            [RumqttTransport::new(), RumqttTransport::new()],
            id_marker,
            policy,
            shutdown,
        )
    }

    /// Builds the coordinator on explicit transports, one per endpoint.
    pub fn with_transports<T: Transport>(
        endpoints: [BrokerEndpoint; 2],
        transports: [T; 2],
        id_marker: &str,
        policy: RetryPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let dispatcher = Arc::new(TelemetryDispatcher::new());
        let counters = Arc::new(MessageCounters::new(
            endpoints.iter().map(|endpoint| endpoint.name.as_str()),
        ));

        let routers: HashMap<String, TopicRouter> = endpoints
            .iter()
            .map(|endpoint| {
                (
                    endpoint.name.clone(),
                    TopicRouter::from_subscriptions(id_marker, &endpoint.subscriptions),
                )
            })
            .collect();
        let pipeline =
            MessagePipeline::new(routers, counters.clone(), dispatcher.clone()).spawn(event_rx);

        let [first, second] = endpoints;
        let [first_transport, second_transport] = transports;
        let supervisors = [
            SupervisorHandle::spawn(
                first,
                policy.clone(),
                first_transport,
                event_tx.clone(),
                shutdown.child_token(),
            ),
            SupervisorHandle::spawn(
                second,
                policy,
                second_transport,
                event_tx,
                shutdown.child_token(),
            ),
        ];

        Self {
            supervisors,
            counters,
            dispatcher,
            pipeline,
            shutdown,
            started_at: Instant::now(),
        }
    }

    /// Dispatcher carrying the merged events of both brokers.
    pub fn dispatcher(&self) -> Arc<TelemetryDispatcher> {
        self.dispatcher.clone()
    }

    /// Dials both brokers concurrently and reports what came up.
    ///
    /// A broker that fails keeps retrying in the background; that is not an error here.
    pub async fn connect_all(&self) -> ConnectivityStatus {
        let [first, second] = &self.supervisors;
        let (first_state, second_state) =
            tokio::join!(first.connect_and_wait(), second.connect_and_wait());

        let status = self.status();
        match &status {
            ConnectivityStatus::BothUp => info!("Both brokers connected"),
            ConnectivityStatus::OneUp(name) => warn!(
                "Partial connectivity, only {} is up ({}: {:?}, {}: {:?})",
                name,
                first.name(),
                first_state,
                second.name(),
                second_state
            ),
            ConnectivityStatus::NoneUp => error!("No broker reachable, retrying in the background"),
        }
        status
    }

    pub fn status(&self) -> ConnectivityStatus {
        let up: Vec<&SupervisorHandle> = self
            .supervisors
            .iter()
            .filter(|handle| handle.state() == ConnectionState::Connected)
            .collect();

        match up.as_slice() {
            [_, _] => ConnectivityStatus::BothUp,
            [one] => ConnectivityStatus::OneUp(one.name().to_string()),
            _ => ConnectivityStatus::NoneUp,
        }
    }

    pub fn broker_state(&self, name: &str) -> Option<ConnectionState> {
        self.supervisor(name).map(SupervisorHandle::state)
    }

    /// Manual reconnect of one broker. Resets its retry counter, also after exhaustion.
    pub async fn reconnect(&self, name: &str) -> Option<ConnectionState> {
        let handle = self.supervisor(name)?;
        info!(broker = %name, "Manual reconnect requested");
        Some(handle.connect_and_wait().await)
    }

    /// Stops both supervisors and cancels their retry timers. Calling it again is harmless.
    pub async fn disconnect_all(&self) {
        let [first, second] = &self.supervisors;
        tokio::join!(first.stop(), second.stop());
        info!("All broker connections closed");
    }

    pub fn stats(&self) -> CoordinatorStats {
        let brokers = self
            .supervisors
            .iter()
            .map(|handle| {
                let status = handle.status();
                BrokerStats {
                    name: handle.name().to_string(),
                    client_id: handle.client_id().to_string(),
                    state: status.state,
                    attempt: status.attempt,
                    messages: self.counters.received(handle.name()),
                    last_error: status.last_error,
                    connected_since: status.connected_since,
                }
            })
            .collect();

        CoordinatorStats {
            status: self.status(),
            brokers,
            dropped: self.counters.dropped(),
            uptime: self.started_at.elapsed(),
        }
    }

    /// Closes both connections, then waits for the supervisor and pipeline tasks.
    pub async fn shutdown(self) {
        self.disconnect_all().await;
        self.shutdown.cancel();

        let Self {
            supervisors,
            pipeline,
            ..
        } = self;
        for handle in supervisors {
            handle.shutdown().await;
        }
        if let Err(e) = pipeline.await {
            error!("Message pipeline failed: {}", e);
        }
    }

    fn supervisor(&self, name: &str) -> Option<&SupervisorHandle> {
        self.supervisors.iter().find(|handle| handle.name() == name)
    }
}
