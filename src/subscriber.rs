//! Alert subscriber: one broker connection whose alerts drive the LED.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{EventKind, Subscribe, SubscriptionId, TelemetryDispatcher, TelemetryEvent};
use crate::led::{LedController, Ready};
use crate::mqtt::config::BrokerEndpoint;
use crate::mqtt::payload::Rgb;
use crate::mqtt::pipeline::{MessageCounters, MessagePipeline};
use crate::mqtt::retry::RetryPolicy;
use crate::mqtt::supervisor::{ConnectionState, SupervisorHandle};
use crate::mqtt::topic::TopicRouter;
use crate::mqtt::transport::Transport;

const EVENT_CAPACITY: usize = 64;
const LED_QUEUE: usize = 16;

#[derive(Debug, Default)]
struct AlertCounters {
    received: AtomicU64,
    shown: AtomicU64,
    led_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertStats {
    pub received: u64,
    pub shown: u64,
    pub led_failures: u64,
}

pub struct AlertSubscriber {
    supervisor: SupervisorHandle,
    dispatcher: Arc<TelemetryDispatcher>,
    alert_handler: SubscriptionId,
    pipeline: JoinHandle<()>,
    led_worker: JoinHandle<()>,
    counters: Arc<AlertCounters>,
}

impl AlertSubscriber {
    /// Starts the supervisor, the message pipeline and the LED worker.
    ///
    /// The connection is not opened until [`Self::connect`].
    pub fn start<T: Transport>(
        endpoint: BrokerEndpoint,
        transport: T,
        policy: RetryPolicy,
        id_marker: &str,
        led: LedController<Ready>,
        shutdown: CancellationToken,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let dispatcher = Arc::new(TelemetryDispatcher::new());
        let counters = Arc::new(AlertCounters::default());

        let router = TopicRouter::from_subscriptions(id_marker, &endpoint.subscriptions);
        let pipeline = MessagePipeline::new(
            HashMap::from([(endpoint.name.clone(), router)]),
            Arc::new(MessageCounters::new([endpoint.name.as_str()])),
            dispatcher.clone(),
        )
        .spawn(event_rx);

        let (color_tx, color_rx) = mpsc::channel::<Rgb>(LED_QUEUE);
        let alert_handler = {
            let counters = counters.clone();
            dispatcher.on_fn(EventKind::AlertReceived, move |event: &TelemetryEvent| {
                let TelemetryEvent::AlertReceived(alert) = event else {
                    return Ok(());
                };
                let count = counters.received.fetch_add(1, Ordering::Relaxed) + 1;
                info!(source = %alert.source_id, "Alert #{} received: {}", count, alert.color);
                color_tx
                    .try_send(alert.color)
                    .map_err(|e| format!("LED queue unavailable: {e}").into())
            })
        };
        let led_worker = tokio::spawn(run_led(led, color_rx, counters.clone()));

        let supervisor =
            SupervisorHandle::spawn(endpoint, policy, transport, event_tx, shutdown.child_token());

        Self {
            supervisor,
            dispatcher,
            alert_handler,
            pipeline,
            led_worker,
            counters,
        }
    }

    pub async fn connect(&self) -> ConnectionState {
        self.supervisor.connect_and_wait().await
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn dispatcher(&self) -> Arc<TelemetryDispatcher> {
        self.dispatcher.clone()
    }

    pub fn stats(&self) -> AlertStats {
        AlertStats {
            received: self.counters.received.load(Ordering::Relaxed),
            shown: self.counters.shown.load(Ordering::Relaxed),
            led_failures: self.counters.led_failures.load(Ordering::Relaxed),
        }
    }

    /// Closes the connection, drains pending colors and switches the LED off.
    pub async fn shutdown(self) {
        let Self {
            supervisor,
            dispatcher,
            alert_handler,
            pipeline,
            led_worker,
            ..
        } = self;

        supervisor.shutdown().await;
        if let Err(e) = pipeline.await {
            error!("Alert pipeline failed: {}", e);
        }

        // Dropping the handler drops the last color sender and ends the LED worker
        dispatcher.off(EventKind::AlertReceived, alert_handler);
        if let Err(e) = led_worker.await {
            error!("LED worker failed: {}", e);
        }
        info!("Alert subscriber stopped");
    }
}

async fn run_led(
    mut led: LedController<Ready>,
    mut color_rx: mpsc::Receiver<Rgb>,
    counters: Arc<AlertCounters>,
) {
    debug!("LED worker started with {} driver", led.driver_name());

    while let Some(color) = color_rx.recv().await {
        match led.set_color(color).await {
            Ok(()) => {
                counters.shown.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.led_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Could not show {}: {}", color, e);
            }
        }
    }

    led.cleanup().await;
}
