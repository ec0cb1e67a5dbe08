use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::{DashboardStore, SensorKind};
use crate::events::{EventKind, Subscribe, SubscriptionId, TelemetryDispatcher, TelemetryEvent};

/// Feeds dispatcher events into a shared [`DashboardStore`].
pub struct DashboardConsumer {
    store: Arc<Mutex<DashboardStore>>,
    dispatcher: Arc<TelemetryDispatcher>,
    subscriptions: Vec<(EventKind, SubscriptionId)>,
}

fn lock(store: &Mutex<DashboardStore>) -> MutexGuard<'_, DashboardStore> {
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DashboardConsumer {
    pub fn attach(store: Arc<Mutex<DashboardStore>>, dispatcher: Arc<TelemetryDispatcher>) -> Self {
        let mut subscriptions = Vec::new();

        for (kind, sensor) in [
            (EventKind::TemperatureReading, SensorKind::Temperature),
            (EventKind::HumidityReading, SensorKind::Humidity),
        ] {
            let store = store.clone();
            let id = dispatcher.on_fn(kind, move |event: &TelemetryEvent| {
                if let TelemetryEvent::TemperatureReading(reading)
                | TelemetryEvent::HumidityReading(reading) = event
                {
                    let trend = lock(&store).record_reading(sensor, reading);
                    debug!(source = %reading.source_id, "{} {} {}", sensor, reading.value, trend.arrow());
                }
                Ok(())
            });
            subscriptions.push((kind, id));
        }

        let alert_store = store.clone();
        let id = dispatcher.on_fn(EventKind::AlertReceived, move |event: &TelemetryEvent| {
            if let TelemetryEvent::AlertReceived(alert) = event {
                lock(&alert_store).record_alert(alert);
                info!(source = %alert.source_id, "Alert {} {}", alert.color, alert.color.to_hex());
            }
            Ok(())
        });
        subscriptions.push((EventKind::AlertReceived, id));

        for kind in [EventKind::Connect, EventKind::Disconnect] {
            let id = dispatcher.on_fn(kind, |event: &TelemetryEvent| {
                match event {
                    TelemetryEvent::Connect { broker } => info!(broker = %broker, "Broker online"),
                    TelemetryEvent::Disconnect { broker, reason } => {
                        warn!(broker = %broker, "Broker offline: {}", reason)
                    }
                    _ => {}
                }
                Ok(())
            });
            subscriptions.push((kind, id));
        }

        Self {
            store,
            dispatcher,
            subscriptions,
        }
    }

    pub fn store(&self) -> Arc<Mutex<DashboardStore>> {
        self.store.clone()
    }

    /// Unregisters all handlers. The store keeps its contents.
    pub fn detach(self) {
        for (kind, id) in self.subscriptions {
            self.dispatcher.off(kind, id);
        }
    }
}
