//! Sensor publisher
//!
//! Reads `<temperature> <humidity>` samples, one per line, and publishes them to the
//! own sensor topics. A value is published when it differs from the last published one
//! or when the publish interval has passed since then, so a steady sensor still shows
//! up on the dashboard at a fixed rate without flooding the broker.

use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::dashboard::SensorKind;
use crate::mqtt::config::BrokerEndpoint;
use crate::mqtt::payload::{decode_sensor_value, format_sensor_value, DecodeError, Unit};
use crate::mqtt::retry::RetryPolicy;
use crate::mqtt::supervisor::{ConnectionState, SupervisorEvent, SupervisorHandle};
use crate::mqtt::transport::{Transport, TransportError};

/// Change-or-timeout gate for one sensor value.
#[derive(Debug, Clone)]
pub struct PublishGate {
    interval: Duration,
    last: Option<(f64, Instant)>,
}

impl PublishGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn should_publish(&self, value: f64, now: Instant) -> bool {
        match self.last {
            None => true,
            Some((last_value, at)) => last_value != value || now.duration_since(at) > self.interval,
        }
    }

    /// Marks `value` as published at `now`.
    pub fn record(&mut self, value: f64, now: Instant) {
        self.last = Some((value, now));
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub temperature: f64,
    pub humidity: f64,
}

impl Sample {
    /// Parses `"<temperature> <humidity>"`.
    pub fn parse(line: &str) -> Result<Self, DecodeError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [temperature, humidity] = fields.as_slice() else {
            return Err(DecodeError::InvalidFormat(format!(
                "expected '<temperature> <humidity>', got '{}'",
                line.trim()
            )));
        };
        Ok(Self {
            temperature: decode_sensor_value(temperature.as_bytes())?,
            humidity: decode_sensor_value(humidity.as_bytes())?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTopics {
    pub temperature: String,
    pub humidity: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishCounts {
    pub temperature: u64,
    pub humidity: u64,
    /// Values not sent because the broker was unreachable
    pub skipped: u64,
    pub invalid_samples: u64,
}

pub struct SensorPublisher {
    supervisor: SupervisorHandle,
    lifecycle_drain: JoinHandle<()>,
    topics: PublishTopics,
    decimals: usize,
    temperature_gate: PublishGate,
    humidity_gate: PublishGate,
    counts: PublishCounts,
}

impl SensorPublisher {
    pub fn start<T: Transport>(
        endpoint: BrokerEndpoint,
        transport: T,
        policy: RetryPolicy,
        topics: PublishTopics,
        interval: Duration,
        decimals: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let (event_tx, mut event_rx) = mpsc::channel(16);
        // Lifecycle changes are already logged by the supervisor
        let lifecycle_drain = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if let SupervisorEvent::Lifecycle { event, .. } = event {
                    trace!("Publisher connection: {:?}", event);
                }
            }
        });

        let supervisor =
            SupervisorHandle::spawn(endpoint, policy, transport, event_tx, shutdown.child_token());

        Self {
            supervisor,
            lifecycle_drain,
            topics,
            decimals,
            temperature_gate: PublishGate::new(interval),
            humidity_gate: PublishGate::new(interval),
            counts: PublishCounts::default(),
        }
    }

    /// Opens the connection. Failing the first attempt is an error for the caller.
    pub async fn connect(&self) -> Result<(), TransportError> {
        match self.supervisor.connect_and_wait().await {
            ConnectionState::Connected => Ok(()),
            state => {
                let reason = self
                    .supervisor
                    .status()
                    .last_error
                    .unwrap_or_else(|| format!("connection is {:?}", state));
                Err(TransportError::Connect(reason))
            }
        }
    }

    pub fn counts(&self) -> PublishCounts {
        self.counts
    }

    pub async fn handle_sample(&mut self, sample: Sample, now: Instant) {
        self.publish_value(SensorKind::Temperature, sample.temperature, now).await;
        self.publish_value(SensorKind::Humidity, sample.humidity, now).await;
    }

    async fn publish_value(&mut self, kind: SensorKind, value: f64, now: Instant) {
        let (gate, topic, unit) = match kind {
            SensorKind::Temperature => (&mut self.temperature_gate, &self.topics.temperature, Unit::Celsius),
            SensorKind::Humidity => (&mut self.humidity_gate, &self.topics.humidity, Unit::Percent),
        };
        if !gate.should_publish(value, now) {
            trace!("{} unchanged, not publishing", kind);
            return;
        }
        let Some(formatted) = format_sensor_value(value, self.decimals) else {
            return;
        };

        match self.supervisor.publish(topic, formatted.clone().into_bytes()).await {
            Ok(()) => {
                gate.record(value, now);
                let count = match kind {
                    SensorKind::Temperature => &mut self.counts.temperature,
                    SensorKind::Humidity => &mut self.counts.humidity,
                };
                *count += 1;
                info!("Published {} {}{} to {} (#{})", kind, formatted, unit.symbol(), topic, count);
            }
            Err(TransportError::NotConnected) => {
                self.counts.skipped += 1;
                warn!("MQTT not connected, {} not published", kind);
            }
            Err(e) => {
                self.counts.skipped += 1;
                error!("Publishing {} failed: {}", kind, e);
            }
        }
    }

    /// Publishes samples read from `input` until it ends or `shutdown` fires.
    pub async fn run<R>(
        &mut self,
        input: R,
        stats_interval: Duration,
        shutdown: CancellationToken,
    ) -> PublishCounts
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        let mut stats = tokio::time::interval(stats_interval);
        stats.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = stats.tick() => {
                    info!("Publisher stats: {:?}, connection {:?}", self.counts, self.supervisor.state());
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match Sample::parse(&line) {
                        Ok(sample) => self.handle_sample(sample, Instant::now()).await,
                        Err(e) => {
                            self.counts.invalid_samples += 1;
                            warn!("Ignoring sample: {}", e);
                        }
                    },
                    Ok(None) => {
                        debug!("Sample input closed");
                        break;
                    }
                    Err(e) => {
                        error!("Reading samples failed: {}", e);
                        break;
                    }
                }
            }
        }
        self.counts
    }

    pub async fn shutdown(self) {
        let Self {
            supervisor,
            lifecycle_drain,
            counts,
            ..
        } = self;
        supervisor.shutdown().await;
        let _ = lifecycle_drain.await;
        info!(
            "Publisher stopped: {} temperature and {} humidity values published",
            counts.temperature, counts.humidity
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::testing::{endpoint, ConnectBehavior, ScriptedTransport, TransportController};
    use pretty_assertions::assert_eq;

    fn topics() -> PublishTopics {
        PublishTopics {
            temperature: "GTI700/Data/E2025/05/temperature".into(),
            humidity: "GTI700/Data/E2025/05/humidite".into(),
        }
    }

    fn publisher(script: Vec<ConnectBehavior>) -> (SensorPublisher, TransportController) {
        let (transport, controller) = ScriptedTransport::new(script);
        let publisher = SensorPublisher::start(
            endpoint("local"),
            transport,
            RetryPolicy::default(),
            topics(),
            Duration::from_secs(5),
            2,
            CancellationToken::new(),
        );
        (publisher, controller)
    }

    fn published(controller: &TransportController) -> Vec<(String, String)> {
        controller
            .log()
            .published
            .into_iter()
            .map(|(topic, payload)| (topic, String::from_utf8(payload).unwrap()))
            .collect()
    }

    #[test]
    fn gate_publishes_on_change_or_after_interval() {
        let mut gate = PublishGate::new(Duration::from_secs(5));
        let t0 = Instant::now();

        assert!(gate.should_publish(21.0, t0));
        gate.record(21.0, t0);

        assert!(!gate.should_publish(21.0, t0 + Duration::from_secs(3)));
        assert!(!gate.should_publish(21.0, t0 + Duration::from_secs(5)));
        assert!(gate.should_publish(21.0, t0 + Duration::from_secs(6)));
        assert!(gate.should_publish(21.5, t0 + Duration::from_secs(1)));
    }

    #[test]
    fn parses_samples() {
        assert_eq!(
            Sample::parse("21.40 45.10"),
            Ok(Sample {
                temperature: 21.4,
                humidity: 45.1,
            })
        );
        assert!(matches!(Sample::parse("21.40"), Err(DecodeError::InvalidFormat(_))));
        assert!(Sample::parse("warm humid").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn steady_values_are_throttled() {
        let (mut publisher, controller) = publisher(vec![ConnectBehavior::Accept]);
        publisher.connect().await.unwrap();
        let t0 = Instant::now();
        let sample = Sample {
            temperature: 21.0,
            humidity: 40.0,
        };

        publisher.handle_sample(sample, t0).await;
        publisher.handle_sample(sample, t0 + Duration::from_secs(2)).await;
        publisher
            .handle_sample(
                Sample {
                    temperature: 21.25,
                    humidity: 40.0,
                },
                t0 + Duration::from_secs(3),
            )
            .await;

        assert_eq!(
            published(&controller),
            vec![
                ("GTI700/Data/E2025/05/temperature".to_string(), "21.00".to_string()),
                ("GTI700/Data/E2025/05/humidite".to_string(), "40.00".to_string()),
                ("GTI700/Data/E2025/05/temperature".to_string(), "21.25".to_string()),
            ]
        );
        assert_eq!(publisher.counts().temperature, 2);
        assert_eq!(publisher.counts().humidity, 1);

        publisher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn values_are_skipped_while_disconnected() {
        let (mut publisher, controller) = publisher(vec![ConnectBehavior::Refuse("down".into())]);

        assert_eq!(
            publisher.connect().await,
            Err(TransportError::Connect("Connection failed: down".into()))
        );

        publisher
            .handle_sample(
                Sample {
                    temperature: 20.0,
                    humidity: 50.0,
                },
                Instant::now(),
            )
            .await;

        assert_eq!(publisher.counts().skipped, 2);
        assert!(published(&controller).is_empty());

        publisher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn run_reads_lines_until_input_ends() {
        let (mut publisher, controller) = publisher(vec![ConnectBehavior::Accept]);
        publisher.connect().await.unwrap();
        let input: &[u8] = b"21.00 40.00\n\nnot a sample\n22.00 40.00\n";

        let counts = publisher
            .run(input, Duration::from_secs(30), CancellationToken::new())
            .await;

        assert_eq!(
            counts,
            PublishCounts {
                temperature: 2,
                humidity: 1,
                skipped: 0,
                invalid_samples: 1,
            }
        );
        assert_eq!(published(&controller).len(), 3);

        publisher.shutdown().await;
    }
}
