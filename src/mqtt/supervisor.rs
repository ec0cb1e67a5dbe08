//! Connection supervisor
//!
//! One supervisor owns one broker connection. It is split in two layers:
//!
//! - [`SupervisorMachine`]: the state machine. It takes transport signals and control
//!   requests and answers with [`Directive`]s. It performs no I/O and owns no timer,
//!   so every transition can be checked without a broker or a clock.
//! - [`ConnectionSupervisor`]: the actor task executing those directives against a
//!   [`Transport`], arming the single retry timer and publishing status through a
//!   `watch` channel. [`SupervisorHandle`] is the only way in.
//!
//! # State Machine
//!
//! ```text
//!                 connect()                    connack
//! Disconnected ─────────────► Connecting ───────────────► Connected
//!      ▲                        │    ▲                        │
//!      │ stop()      error /    │    │ retry timer            │ error + close
//!      │             timeout    ▼    │                        ▼
//!      └──────────────────── Reconnecting ◄───────────────────┘
//!                               │
//!                               │ max attempts reached
//!                               ▼
//!                           Exhausted ──── connect() ───► Connecting
//! ```
//!
//! A lost session produces exactly one `Disconnected` event even when the transport
//! reports the loss as an error followed by a close.

use chrono::{DateTime, Local};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::BrokerEndpoint;
use super::message::InboundMessage;
use super::retry::RetryPolicy;
use super::transport::{Transport, TransportError, TransportEvent};

const COMMAND_CAPACITY: usize = 32;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Connected,
    Disconnected { reason: String },
    ReconnectScheduled { delay: Duration, attempt: u32 },
    Exhausted { attempts: u32 },
    Error { error: TransportError },
}

/// Side effects requested by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Dial,
    SubscribeAll,
    ArmRetry(Duration),
    CancelRetry,
    Hangup,
    Emit(LifecycleEvent),
}

#[derive(Debug, Clone)]
pub struct SupervisorMachine {
    state: ConnectionState,
    policy: RetryPolicy,
    auto_retry: bool,
    session_open: bool,
}

impl SupervisorMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy,
            auto_retry: true,
            session_open: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.policy.attempt()
    }

    pub fn auto_retry(&self) -> bool {
        self.auto_retry
    }

    /// Explicit (re)connect request. Resets the retry counter and re-enables auto-retry.
    pub fn connect(&mut self) -> Vec<Directive> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => Vec::new(),
            ConnectionState::Disconnected
            | ConnectionState::Reconnecting
            | ConnectionState::Exhausted => {
                self.policy.reset();
                self.auto_retry = true;
                self.state = ConnectionState::Connecting;
                vec![Directive::CancelRetry, Directive::Dial]
            }
        }
    }

    pub fn on_connected(&mut self) -> Vec<Directive> {
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        self.state = ConnectionState::Connected;
        self.session_open = true;
        self.policy.reset();
        vec![
            Directive::SubscribeAll,
            Directive::Emit(LifecycleEvent::Connected),
        ]
    }

    pub fn on_connect_failed(&mut self, error: TransportError) -> Vec<Directive> {
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        let mut directives = vec![Directive::Emit(LifecycleEvent::Error { error })];
        directives.extend(self.schedule_retry());
        directives
    }

    /// Transport failure. On a live session the retry is deferred to [`Self::on_closed`].
    pub fn on_transport_error(&mut self, error: TransportError) -> Vec<Directive> {
        match self.state {
            ConnectionState::Connected => {
                self.state = ConnectionState::Reconnecting;
                vec![Directive::Emit(LifecycleEvent::Error { error })]
            }
            ConnectionState::Connecting => self.on_connect_failed(error),
            _ => Vec::new(),
        }
    }

    pub fn on_closed(&mut self, reason: String) -> Vec<Directive> {
        if !self.session_open {
            return Vec::new();
        }
        self.session_open = false;

        let mut directives = vec![Directive::Emit(LifecycleEvent::Disconnected { reason })];
        if matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Reconnecting
        ) {
            directives.extend(self.schedule_retry());
        }
        directives
    }

    pub fn on_retry_elapsed(&mut self) -> Vec<Directive> {
        if self.state == ConnectionState::Reconnecting && self.auto_retry {
            self.state = ConnectionState::Connecting;
            vec![Directive::Dial]
        } else {
            Vec::new()
        }
    }

    /// Explicit shutdown. Disables auto-retry so nothing resurrects the connection.
    pub fn stop(&mut self) -> Vec<Directive> {
        self.auto_retry = false;
        let previous = std::mem::replace(&mut self.state, ConnectionState::Disconnected);

        let mut directives = vec![Directive::CancelRetry];
        if previous != ConnectionState::Disconnected {
            directives.push(Directive::Hangup);
        }
        if std::mem::take(&mut self.session_open) {
            directives.push(Directive::Emit(LifecycleEvent::Disconnected {
                reason: "stopped".to_string(),
            }));
        }
        directives
    }

    fn schedule_retry(&mut self) -> Vec<Directive> {
        if !self.auto_retry {
            self.state = ConnectionState::Disconnected;
            return Vec::new();
        }
        match self.policy.next_delay() {
            Some(delay) => {
                self.state = ConnectionState::Reconnecting;
                vec![
                    Directive::Emit(LifecycleEvent::ReconnectScheduled {
                        delay,
                        attempt: self.policy.attempt(),
                    }),
                    Directive::ArmRetry(delay),
                ]
            }
            None => {
                self.state = ConnectionState::Exhausted;
                vec![Directive::Emit(LifecycleEvent::Exhausted {
                    attempts: self.policy.attempt(),
                })]
            }
        }
    }
}

/// Snapshot published by the supervisor after every transition.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SupervisorStatus {
    pub state: ConnectionState,
    pub attempt: u32,
    /// Number of dial attempts that finished or were abandoned
    pub dial_outcomes: u64,
    pub last_error: Option<String>,
    pub connected_since: Option<DateTime<Local>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    Lifecycle {
        broker: String,
        event: LifecycleEvent,
    },
    Message(InboundMessage),
}

#[derive(Debug)]
pub enum SupervisorCommand {
    Connect,
    Stop {
        respond_to: oneshot::Sender<()>,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
        respond_to: oneshot::Sender<Result<(), TransportError>>,
    },
}

enum Flow {
    Continue,
    Exit,
}

enum DialInterrupt {
    Shutdown,
    Command(Option<SupervisorCommand>),
    Finished(Result<(), TransportError>),
}

pub struct ConnectionSupervisor<T: Transport> {
    endpoint: BrokerEndpoint,
    transport: T,
    machine: SupervisorMachine,
    command_rx: mpsc::Receiver<SupervisorCommand>,
    event_tx: mpsc::Sender<SupervisorEvent>,
    status_tx: watch::Sender<SupervisorStatus>,
    retry_deadline: Option<Instant>,
    shutdown: CancellationToken,
}

impl<T: Transport> ConnectionSupervisor<T> {
    pub async fn run(mut self) {
        info!(broker = %self.endpoint.name, "Supervisor started for {}", self.endpoint);

        loop {
            let flow = match self.machine.state() {
                ConnectionState::Connecting => self.step_connecting().await,
                ConnectionState::Connected => self.step_connected().await,
                ConnectionState::Reconnecting => self.step_reconnecting().await,
                ConnectionState::Disconnected | ConnectionState::Exhausted => {
                    self.step_idle().await
                }
            };
            if let Flow::Exit = flow {
                break;
            }
        }

        self.transport.disconnect().await;
        info!(broker = %self.endpoint.name, "Supervisor stopped");
    }

    async fn step_connecting(&mut self) -> Flow {
        let timeout = self.endpoint.connect_timeout;

        let interrupt = {
            let dial = tokio::time::timeout(timeout, self.transport.connect(&self.endpoint));
            tokio::pin!(dial);
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break DialInterrupt::Shutdown,
                    command = self.command_rx.recv() => match command {
                        Some(SupervisorCommand::Connect) => {
                            debug!(broker = %self.endpoint.name, "Already connecting");
                        }
                        Some(SupervisorCommand::Publish { topic, respond_to, .. }) => {
                            debug!(broker = %self.endpoint.name, "Publish to {} while connecting", topic);
                            let _ = respond_to.send(Err(TransportError::NotConnected));
                        }
                        other => break DialInterrupt::Command(other),
                    },
                    result = &mut dial => {
                        break DialInterrupt::Finished(
                            result.unwrap_or(Err(TransportError::Timeout(timeout))),
                        )
                    }
                }
            }
        };

        match interrupt {
            DialInterrupt::Shutdown => Flow::Exit,
            DialInterrupt::Command(command) => {
                let flow = self.handle_command(command).await;
                // The pending dial is dropped, which also ends a connect_and_wait
                self.status_tx.send_modify(|status| status.dial_outcomes += 1);
                flow
            }
            DialInterrupt::Finished(result) => {
                let directives = match result {
                    Ok(()) => self.machine.on_connected(),
                    Err(error) => {
                        warn!(broker = %self.endpoint.name, "Connection attempt failed: {}", error);
                        self.machine.on_connect_failed(error)
                    }
                };
                self.execute(directives).await;
                self.status_tx.send_modify(|status| status.dial_outcomes += 1);
                Flow::Continue
            }
        }
    }

    async fn step_connected(&mut self) -> Flow {
        tokio::select! {
            _ = self.shutdown.cancelled() => Flow::Exit,
            command = self.command_rx.recv() => self.handle_command(command).await,
            event = self.transport.next_event() => {
                self.handle_transport_event(event).await;
                Flow::Continue
            }
        }
    }

    async fn step_reconnecting(&mut self) -> Flow {
        let Some(deadline) = self.retry_deadline else {
            return self.step_idle().await;
        };

        tokio::select! {
            _ = self.shutdown.cancelled() => Flow::Exit,
            command = self.command_rx.recv() => self.handle_command(command).await,
            _ = tokio::time::sleep_until(deadline) => {
                self.retry_deadline = None;
                let directives = self.machine.on_retry_elapsed();
                self.execute(directives).await;
                Flow::Continue
            }
        }
    }

    async fn step_idle(&mut self) -> Flow {
        tokio::select! {
            _ = self.shutdown.cancelled() => Flow::Exit,
            command = self.command_rx.recv() => self.handle_command(command).await,
        }
    }

    async fn handle_command(&mut self, command: Option<SupervisorCommand>) -> Flow {
        match command {
            Some(SupervisorCommand::Connect) => {
                info!(broker = %self.endpoint.name, "Connecting to {}", self.endpoint.address());
                let directives = self.machine.connect();
                self.execute(directives).await;
            }
            Some(SupervisorCommand::Stop { respond_to }) => {
                debug!(broker = %self.endpoint.name, "Stop requested");
                let directives = self.machine.stop();
                self.execute(directives).await;
                let _ = respond_to.send(());
            }
            Some(SupervisorCommand::Publish {
                topic,
                payload,
                respond_to,
            }) => {
                let result = if self.machine.state() == ConnectionState::Connected {
                    self.transport.publish(&topic, payload).await
                } else {
                    Err(TransportError::NotConnected)
                };
                let _ = respond_to.send(result);
            }
            None => {
                debug!(broker = %self.endpoint.name, "All handles dropped");
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    async fn handle_transport_event(&mut self, event: Result<TransportEvent, TransportError>) {
        match event {
            Ok(TransportEvent::Message { topic, payload }) => {
                let message = InboundMessage::new(self.endpoint.name.clone(), topic, payload);
                debug!("Received {}", message);
                if self.event_tx.send(SupervisorEvent::Message(message)).await.is_err() {
                    debug!(broker = %self.endpoint.name, "No consumer for inbound messages");
                }
            }
            Ok(TransportEvent::SubscriptionRejected { packet_id }) => {
                warn!(broker = %self.endpoint.name, "Broker rejected subscription (packet {})", packet_id);
            }
            Ok(TransportEvent::Closed { reason }) => {
                let directives = self.machine.on_closed(reason);
                self.execute(directives).await;
            }
            Err(error) => {
                let reason = error.to_string();
                let mut directives = self.machine.on_transport_error(error);
                directives.extend(self.machine.on_closed(reason));
                self.execute(directives).await;
            }
        }
    }

    async fn execute(&mut self, directives: Vec<Directive>) {
        for directive in directives {
            match directive {
                // Dialing happens in the Connecting step of the run loop
                Directive::Dial => {}
                Directive::SubscribeAll => self.subscribe_all().await,
                Directive::ArmRetry(delay) => {
                    self.retry_deadline = Some(Instant::now() + delay);
                }
                Directive::CancelRetry => self.retry_deadline = None,
                Directive::Hangup => self.transport.disconnect().await,
                Directive::Emit(event) => self.emit(event).await,
            }
        }
        self.publish_status();
    }

    async fn subscribe_all(&mut self) {
        for subscription in &self.endpoint.subscriptions {
            let topic = subscription.pattern.as_str();
            match self.transport.subscribe(topic).await {
                Ok(()) => info!(broker = %self.endpoint.name, "Subscribed to {}", topic),
                // The session stays usable for the other topics
                Err(e) => error!(broker = %self.endpoint.name, "Subscription failed: {}", e),
            }
        }
    }

    async fn emit(&mut self, event: LifecycleEvent) {
        let broker = &self.endpoint.name;
        match &event {
            LifecycleEvent::Connected => {
                info!(broker = %broker, "Connected to {}", self.endpoint.address());
                self.status_tx.send_modify(|status| {
                    status.connected_since = Some(Local::now());
                    status.last_error = None;
                });
            }
            LifecycleEvent::Disconnected { reason } => {
                warn!(broker = %broker, "Disconnected: {}", reason);
                self.status_tx
                    .send_modify(|status| status.connected_since = None);
            }
            LifecycleEvent::ReconnectScheduled { delay, attempt } => {
                info!(
                    broker = %broker,
                    "Reconnect attempt {}/{} in {:.1}s",
                    attempt,
                    self.max_attempts(),
                    delay.as_secs_f64()
                );
            }
            LifecycleEvent::Exhausted { attempts } => {
                error!(
                    broker = %broker,
                    "Giving up after {} reconnect attempts, waiting for a manual reconnect",
                    attempts
                );
            }
            LifecycleEvent::Error { error } => {
                error!(broker = %broker, "Transport error: {}", error);
                let message = error.to_string();
                self.status_tx
                    .send_modify(|status| status.last_error = Some(message));
            }
        }

        let event = SupervisorEvent::Lifecycle {
            broker: broker.clone(),
            event,
        };
        if self.event_tx.send(event).await.is_err() {
            debug!(broker = %self.endpoint.name, "No consumer for lifecycle events");
        }
    }

    fn max_attempts(&self) -> u32 {
        self.machine.policy.max_attempts()
    }

    fn publish_status(&self) {
        let state = self.machine.state();
        let attempt = self.machine.attempt();
        self.status_tx.send_modify(|status| {
            status.state = state;
            status.attempt = attempt;
        });
    }
}

/// Control surface of a spawned [`ConnectionSupervisor`].
pub struct SupervisorHandle {
    name: String,
    client_id: String,
    connect_timeout: Duration,
    command_tx: mpsc::Sender<SupervisorCommand>,
    status_rx: watch::Receiver<SupervisorStatus>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Spawns the supervisor task. The connection is not opened until [`Self::connect`].
    pub fn spawn<T: Transport>(
        endpoint: BrokerEndpoint,
        policy: RetryPolicy,
        transport: T,
        event_tx: mpsc::Sender<SupervisorEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (status_tx, status_rx) = watch::channel(SupervisorStatus::default());

        let name = endpoint.name.clone();
        let client_id = endpoint.client_id.clone();
        let connect_timeout = endpoint.connect_timeout;

        let supervisor = ConnectionSupervisor {
            endpoint,
            transport,
            machine: SupervisorMachine::new(policy),
            command_rx,
            event_tx,
            status_tx,
            retry_deadline: None,
            shutdown,
        };
        let task = tokio::spawn(supervisor.run());

        Self {
            name,
            client_id,
            connect_timeout,
            command_tx,
            status_rx,
            task,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status_rx.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status_rx.borrow().state
    }

    pub fn watch_status(&self) -> watch::Receiver<SupervisorStatus> {
        self.status_rx.clone()
    }

    /// Requests a (re)connect without waiting for its outcome.
    pub async fn connect(&self) {
        if self.command_tx.send(SupervisorCommand::Connect).await.is_err() {
            warn!(broker = %self.name, "Supervisor is gone, connect ignored");
        }
    }

    /// Requests a (re)connect and waits for the outcome of the dial attempt.
    pub async fn connect_and_wait(&self) -> ConnectionState {
        let mut status_rx = self.status_rx.clone();
        let before = status_rx.borrow_and_update().clone();
        if before.state == ConnectionState::Connected {
            return ConnectionState::Connected;
        }

        self.connect().await;

        let limit = self.connect_timeout + Duration::from_secs(1);
        let outcome = tokio::time::timeout(
            limit,
            status_rx.wait_for(|status| status.dial_outcomes > before.dial_outcomes),
        )
        .await;
        if outcome.is_err() {
            warn!(broker = %self.name, "No connection outcome within {:?}", limit);
        }
        self.state()
    }

    /// Stops the connection and cancels any pending retry. Safe to call repeatedly.
    pub async fn stop(&self) {
        let (respond_to, response) = oneshot::channel();
        if self
            .command_tx
            .send(SupervisorCommand::Stop { respond_to })
            .await
            .is_err()
        {
            debug!(broker = %self.name, "Supervisor already gone");
            return;
        }
        let _ = response.await;
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let (respond_to, response) = oneshot::channel();
        self.command_tx
            .send(SupervisorCommand::Publish {
                topic: topic.to_string(),
                payload,
                respond_to,
            })
            .await
            .map_err(|_| TransportError::NotConnected)?;
        response.await.unwrap_or(Err(TransportError::NotConnected))
    }

    /// Stops the connection and waits for the task to finish.
    pub async fn shutdown(self) {
        self.stop().await;
        let Self { command_tx, task, .. } = self;
        drop(command_tx);
        if let Err(e) = task.await {
            error!("Supervisor task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::testing::{endpoint, ConnectBehavior, ScriptedTransport};
    use crate::mqtt::topic::{MessageKind, Subscription, TopicPattern};
    use pretty_assertions::assert_eq;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(3000), 1.5, max_attempts)
    }

    fn emitted(directives: &[Directive]) -> Vec<LifecycleEvent> {
        directives
            .iter()
            .filter_map(|d| match d {
                Directive::Emit(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    fn lifecycle(event_rx: &mut mpsc::Receiver<SupervisorEvent>) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        while let Ok(event) = event_rx.try_recv() {
            if let SupervisorEvent::Lifecycle { event, .. } = event {
                events.push(event);
            }
        }
        events
    }

    fn connected_machine() -> SupervisorMachine {
        let mut machine = SupervisorMachine::new(policy(10));
        machine.connect();
        machine.on_connected();
        machine
    }

    #[test]
    fn connect_then_connack_subscribes_and_emits_once() {
        let mut machine = SupervisorMachine::new(policy(10));

        assert_eq!(
            machine.connect(),
            vec![Directive::CancelRetry, Directive::Dial]
        );
        assert_eq!(machine.state(), ConnectionState::Connecting);

        let directives = machine.on_connected();
        assert_eq!(machine.state(), ConnectionState::Connected);
        assert_eq!(directives[0], Directive::SubscribeAll);
        assert_eq!(emitted(&directives), vec![LifecycleEvent::Connected]);
    }

    #[test]
    fn failed_dial_schedules_backoff() {
        let mut machine = SupervisorMachine::new(policy(10));
        machine.connect();

        let directives = machine.on_connect_failed(TransportError::Connect("refused".into()));

        assert_eq!(machine.state(), ConnectionState::Reconnecting);
        assert_eq!(machine.attempt(), 1);
        assert!(directives.contains(&Directive::ArmRetry(Duration::from_millis(3000))));
        assert!(emitted(&directives).contains(&LifecycleEvent::ReconnectScheduled {
            delay: Duration::from_millis(3000),
            attempt: 1,
        }));
    }

    #[test]
    fn retry_delays_follow_the_policy() {
        let mut machine = SupervisorMachine::new(policy(10));
        machine.connect();

        let mut delays = Vec::new();
        for _ in 0..4 {
            let directives = machine.on_connect_failed(TransportError::Timeout(Duration::ZERO));
            for directive in directives {
                if let Directive::ArmRetry(delay) = directive {
                    delays.push(delay.as_millis());
                }
            }
            assert_eq!(machine.on_retry_elapsed(), vec![Directive::Dial]);
        }

        assert_eq!(delays, vec![3000, 4500, 6750, 10125]);
    }

    #[test]
    fn exhausts_after_max_attempts_and_manual_connect_resets() {
        let mut machine = SupervisorMachine::new(policy(3));
        machine.connect();

        for _ in 0..3 {
            machine.on_connect_failed(TransportError::Connect("down".into()));
            assert_eq!(machine.state(), ConnectionState::Reconnecting);
            machine.on_retry_elapsed();
        }
        let directives = machine.on_connect_failed(TransportError::Connect("down".into()));

        assert_eq!(machine.state(), ConnectionState::Exhausted);
        assert!(!directives.iter().any(|d| matches!(d, Directive::ArmRetry(_))));
        assert_eq!(machine.on_retry_elapsed(), Vec::new());

        assert_eq!(
            machine.connect(),
            vec![Directive::CancelRetry, Directive::Dial]
        );
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(machine.attempt(), 0);
    }

    #[test]
    fn error_then_close_emits_a_single_disconnect() {
        let mut machine = connected_machine();

        let mut directives = machine.on_transport_error(TransportError::ConnectionLost("reset".into()));
        assert_eq!(machine.state(), ConnectionState::Reconnecting);
        assert!(!emitted(&directives)
            .iter()
            .any(|e| matches!(e, LifecycleEvent::Disconnected { .. })));

        directives.extend(machine.on_closed("reset".into()));
        directives.extend(machine.on_closed("reset again".into()));

        let disconnects = emitted(&directives)
            .into_iter()
            .filter(|e| matches!(e, LifecycleEvent::Disconnected { .. }))
            .count();
        assert_eq!(disconnects, 1);
        let retries = directives
            .iter()
            .filter(|d| matches!(d, Directive::ArmRetry(_)))
            .count();
        assert_eq!(retries, 1);
    }

    #[test]
    fn successful_connect_resets_attempts() {
        let mut machine = SupervisorMachine::new(policy(10));
        machine.connect();
        machine.on_connect_failed(TransportError::Connect("down".into()));
        machine.on_retry_elapsed();
        machine.on_connect_failed(TransportError::Connect("down".into()));
        assert_eq!(machine.attempt(), 2);

        machine.on_retry_elapsed();
        machine.on_connected();

        assert_eq!(machine.attempt(), 0);
    }

    #[test]
    fn stop_disables_retry_and_is_idempotent() {
        let mut machine = SupervisorMachine::new(policy(10));
        machine.connect();
        machine.on_connect_failed(TransportError::Connect("down".into()));

        let directives = machine.stop();
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert!(directives.contains(&Directive::CancelRetry));
        assert!(!machine.auto_retry());

        // A timer that slipped through must not revive the connection
        assert_eq!(machine.on_retry_elapsed(), Vec::new());

        assert_eq!(machine.stop(), vec![Directive::CancelRetry]);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn stop_on_live_session_reports_disconnect() {
        let mut machine = connected_machine();

        let directives = machine.stop();

        assert!(directives.contains(&Directive::Hangup));
        assert_eq!(
            emitted(&directives),
            vec![LifecycleEvent::Disconnected {
                reason: "stopped".into()
            }]
        );
        // The transport's late close signal is ignored
        assert_eq!(machine.on_closed("closed".into()), Vec::new());
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_retries_until_broker_accepts() {
        let (transport, controller) = ScriptedTransport::new(vec![
            ConnectBehavior::Refuse("down".into()),
            ConnectBehavior::Refuse("down".into()),
            ConnectBehavior::Accept,
        ]);
        let (event_tx, mut event_rx) = mpsc::channel(64);
        let handle = SupervisorHandle::spawn(
            endpoint("local"),
            policy(10),
            transport,
            event_tx,
            CancellationToken::new(),
        );

        assert_eq!(handle.connect_and_wait().await, ConnectionState::Reconnecting);

        let mut status = handle.watch_status();
        status
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await
            .unwrap();

        assert_eq!(controller.log().connects, 3);
        assert_eq!(controller.log().subscriptions, vec!["GTI700/Data/E2025/+/temperature"]);
        assert_eq!(handle.status().attempt, 0);

        let mut scheduled = Vec::new();
        while let Ok(event) = event_rx.try_recv() {
            if let SupervisorEvent::Lifecycle {
                event: LifecycleEvent::ReconnectScheduled { delay, .. },
                ..
            } = event
            {
                scheduled.push(delay.as_millis());
            }
        }
        assert_eq!(scheduled, vec![3000, 4500]);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_counts_as_failure() {
        let (transport, _controller) = ScriptedTransport::new(vec![ConnectBehavior::Hang]);
        let (event_tx, _event_rx) = mpsc::channel(64);
        let handle = SupervisorHandle::spawn(
            endpoint("remote"),
            policy(10),
            transport,
            event_tx,
            CancellationToken::new(),
        );

        assert_eq!(handle.connect_and_wait().await, ConnectionState::Reconnecting);
        assert_eq!(
            handle.status().last_error.as_deref(),
            Some("Connection attempt timed out after 10s")
        );

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_is_reported_once_and_recovered() {
        let (transport, controller) =
            ScriptedTransport::new(vec![ConnectBehavior::Accept, ConnectBehavior::Accept]);
        let (event_tx, mut event_rx) = mpsc::channel(64);
        let handle = SupervisorHandle::spawn(
            endpoint("local"),
            policy(10),
            transport,
            event_tx,
            CancellationToken::new(),
        );
        assert_eq!(handle.connect_and_wait().await, ConnectionState::Connected);

        controller.fail(TransportError::ConnectionLost("broken pipe".into()));

        let mut status = handle.watch_status();
        status
            .wait_for(|s| s.state == ConnectionState::Connected && s.dial_outcomes == 2)
            .await
            .unwrap();

        let mut disconnects = 0;
        let mut connects = 0;
        while let Ok(event) = event_rx.try_recv() {
            match event {
                SupervisorEvent::Lifecycle {
                    event: LifecycleEvent::Disconnected { .. },
                    ..
                } => disconnects += 1,
                SupervisorEvent::Lifecycle {
                    event: LifecycleEvent::Connected,
                    ..
                } => connects += 1,
                _ => {}
            }
        }
        assert_eq!(disconnects, 1);
        assert_eq!(connects, 2);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_retry() {
        let (transport, controller) = ScriptedTransport::new(vec![ConnectBehavior::Refuse(
            "down".into(),
        )]);
        let (event_tx, _event_rx) = mpsc::channel(64);
        let handle = SupervisorHandle::spawn(
            endpoint("local"),
            policy(10),
            transport,
            event_tx,
            CancellationToken::new(),
        );
        assert_eq!(handle.connect_and_wait().await, ConnectionState::Reconnecting);

        handle.stop().await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert_eq!(controller.log().connects, 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn inbound_messages_are_forwarded_in_order() {
        let (transport, controller) = ScriptedTransport::new(vec![ConnectBehavior::Accept]);
        let (event_tx, mut event_rx) = mpsc::channel(64);
        let handle = SupervisorHandle::spawn(
            endpoint("local"),
            policy(10),
            transport,
            event_tx,
            CancellationToken::new(),
        );
        assert_eq!(handle.connect_and_wait().await, ConnectionState::Connected);

        for value in ["21.00", "21.50", "22.00"] {
            controller.deliver("GTI700/Data/E2025/05/temperature", value);
        }

        let mut payloads = Vec::new();
        while payloads.len() < 3 {
            if let Some(SupervisorEvent::Message(message)) = event_rx.recv().await {
                assert_eq!(message.broker, "local");
                payloads.push(String::from_utf8(message.payload).unwrap());
            }
        }
        assert_eq!(payloads, vec!["21.00", "21.50", "22.00"]);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn publish_requires_a_connection() {
        let (transport, controller) = ScriptedTransport::new(vec![ConnectBehavior::Accept]);
        let (event_tx, _event_rx) = mpsc::channel(64);
        let handle = SupervisorHandle::spawn(
            endpoint("local"),
            policy(10),
            transport,
            event_tx,
            CancellationToken::new(),
        );

        assert_eq!(
            handle.publish("t", b"1".to_vec()).await,
            Err(TransportError::NotConnected)
        );

        handle.connect_and_wait().await;
        assert_eq!(handle.publish("t", b"1".to_vec()).await, Ok(()));
        assert_eq!(controller.log().published, vec![("t".to_string(), b"1".to_vec())]);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn broker_close_is_reported_once_and_recovered() {
        let (transport, controller) =
            ScriptedTransport::new(vec![ConnectBehavior::Accept, ConnectBehavior::Accept]);
        let (event_tx, mut event_rx) = mpsc::channel(64);
        let handle = SupervisorHandle::spawn(
            endpoint("local"),
            policy(10),
            transport,
            event_tx,
            CancellationToken::new(),
        );
        assert_eq!(handle.connect_and_wait().await, ConnectionState::Connected);

        controller.close("bye");

        let mut status = handle.watch_status();
        status
            .wait_for(|s| s.state == ConnectionState::Connected && s.dial_outcomes == 2)
            .await
            .unwrap();

        assert_eq!(
            lifecycle(&mut event_rx),
            vec![
                LifecycleEvent::Connected,
                LifecycleEvent::Disconnected {
                    reason: "bye".into()
                },
                LifecycleEvent::ReconnectScheduled {
                    delay: Duration::from_millis(3000),
                    attempt: 1,
                },
                LifecycleEvent::Connected,
            ]
        );
        assert_eq!(controller.log().connects, 2);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_subscription_keeps_the_connection() {
        let (transport, controller) = ScriptedTransport::new(vec![ConnectBehavior::Accept]);
        let transport = transport.failing_subscription("GTI700/Data/E2025/+/temperature");
        let mut endpoint = endpoint("local");
        endpoint.subscriptions.push(Subscription::new(
            TopicPattern::parse("GTI700/Data/E2025/+/humidite").unwrap(),
            MessageKind::Humidity,
        ));
        let (event_tx, mut event_rx) = mpsc::channel(64);
        let handle =
            SupervisorHandle::spawn(endpoint, policy(10), transport, event_tx, CancellationToken::new());

        assert_eq!(handle.connect_and_wait().await, ConnectionState::Connected);
        assert_eq!(controller.log().subscriptions, vec!["GTI700/Data/E2025/+/humidite"]);

        controller.deliver("GTI700/Data/E2025/05/humidite", "40.00");
        loop {
            if let Some(SupervisorEvent::Message(_)) = event_rx.recv().await {
                break;
            }
        }
        assert_eq!(handle.state(), ConnectionState::Connected);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_subscription_does_not_change_state() {
        let (transport, controller) = ScriptedTransport::new(vec![ConnectBehavior::Accept]);
        let (event_tx, mut event_rx) = mpsc::channel(64);
        let handle = SupervisorHandle::spawn(
            endpoint("local"),
            policy(10),
            transport,
            event_tx,
            CancellationToken::new(),
        );
        assert_eq!(handle.connect_and_wait().await, ConnectionState::Connected);

        controller.reject_subscription(1);
        controller.deliver("GTI700/Data/E2025/05/temperature", "21.00");

        let mut events = Vec::new();
        loop {
            match event_rx.recv().await {
                Some(SupervisorEvent::Message(_)) => break,
                Some(SupervisorEvent::Lifecycle { event, .. }) => events.push(event),
                None => panic!("supervisor stopped"),
            }
        }
        assert_eq!(events, vec![LifecycleEvent::Connected]);
        assert_eq!(handle.state(), ConnectionState::Connected);
        assert_eq!(handle.status().attempt, 0);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_dial_ends_connect_and_wait() {
        let (transport, _controller) = ScriptedTransport::new(vec![ConnectBehavior::Hang]);
        let (event_tx, _event_rx) = mpsc::channel(64);
        let handle = SupervisorHandle::spawn(
            endpoint("remote"),
            policy(10),
            transport,
            event_tx,
            CancellationToken::new(),
        );
        let started = Instant::now();

        let (state, ()) = tokio::join!(handle.connect_and_wait(), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            handle.stop().await;
        });

        assert_eq!(state, ConnectionState::Disconnected);
        assert!(started.elapsed() < Duration::from_secs(10));

        handle.shutdown().await;
    }
}
