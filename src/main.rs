pub mod config;
pub mod dashboard;
pub mod events;
pub mod led;
pub mod mqtt;
pub mod publisher;
pub mod subscriber;

use crate::config::{AppConfig, LedDriverKind};
use crate::dashboard::consumer::DashboardConsumer;
use crate::dashboard::DashboardStore;
use crate::events::{EventKind, TelemetryEvent};
use crate::led::{LedController, LedDriver, ScriptLedDriver, TEST_STEP};
use crate::mqtt::coordinator::DualBrokerCoordinator;
use crate::mqtt::supervisor::ConnectionState;
use crate::mqtt::transport::RumqttTransport;
use crate::publisher::{PublishTopics, SensorPublisher};
use crate::subscriber::AlertSubscriber;
use chrono::Local;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const ALERT_SWEEP: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(name = "sensorlink")]
#[command(about = "Resilient MQTT client for classroom IoT telemetry", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); falls back to RUST_LOG
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<Level>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Monitor both brokers and keep the dashboard store up to date
    Dashboard,
    /// Show alerts for the own source on the RGB LED
    Alerts {
        /// Run the LED color test before subscribing
        #[arg(long)]
        test_led: bool,
    },
    /// Publish `<temperature> <humidity>` samples read from stdin
    Publish,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup(cli.log_level)?;

    let config = AppConfig::load(cli.config.as_deref()).await?;
    info!(
        "Starting for source {} ({}/{})",
        config.source_id, config.namespace, config.epoch
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("Unable to listen for shutdown signal: {}", e),
        }
        signal_token.cancel();
    });

    match cli.mode {
        Mode::Dashboard => run_dashboard(config, shutdown).await,
        Mode::Alerts { test_led } => run_alerts(config, test_led, shutdown).await,
        Mode::Publish => run_publisher(config, shutdown).await,
    }
}

fn setup(level: Option<Level>) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;

    let level = level
        .or_else(|| std::env::var("RUST_LOG").ok()?.parse().ok())
        .unwrap_or(Level::INFO);
    setup_logging_env(level);
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

/// Awaits `task` unless `shutdown` fires first.
async fn unless_shutdown<F: Future>(shutdown: &CancellationToken, task: F) -> Option<F::Output> {
    tokio::select! {
        _ = shutdown.cancelled() => None,
        output = task => Some(output),
    }
}

async fn run_dashboard(config: AppConfig, shutdown: CancellationToken) -> Result<()> {
    let coordinator = DualBrokerCoordinator::new(
        config.dual_endpoints()?,
        &config.epoch,
        config.retry_policy(),
        shutdown.child_token(),
    );

    let store = Arc::new(Mutex::new(DashboardStore::new(config.dashboard_settings())));
    let consumer = DashboardConsumer::attach(store.clone(), coordinator.dispatcher());
    coordinator
        .dispatcher()
        .on_fn(EventKind::ReconnectExhausted, |event: &TelemetryEvent| {
            if let TelemetryEvent::ReconnectExhausted { broker, .. } = event {
                warn!(broker = %broker, "Broker needs a manual reconnect");
            }
            Ok(())
        });

    match unless_shutdown(&shutdown, coordinator.connect_all()).await {
        Some(status) => info!("Initial connectivity: {}", status),
        None => info!("Shutdown requested while connecting"),
    }

    let mut stats_timer =
        tokio::time::interval(Duration::from_secs(config.dashboard.stats_interval_secs));
    let mut prune_timer =
        tokio::time::interval(Duration::from_secs(config.dashboard.prune_interval_secs));
    let mut sweep_timer = tokio::time::interval(ALERT_SWEEP);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = stats_timer.tick() => {
                let stats = coordinator.stats();
                info!("Connectivity: {}, uptime {}, {} messages dropped", stats.status, stats.uptime_hms(), stats.dropped);
                for broker in &stats.brokers {
                    info!(
                        broker = %broker.name,
                        "{:?}, {} messages, attempt {}, client id {}",
                        broker.state, broker.messages, broker.attempt, broker.client_id
                    );
                }
                let summary = store.lock().map(|store| store.summary(Local::now()));
                if let Ok(summary) = summary {
                    info!("Dashboard: {}", summary);
                }
            }
            _ = sweep_timer.tick() => {
                if let Ok(mut store) = store.lock() {
                    for source in store.alerts_mut().sweep(Local::now()) {
                        info!(source = %source, "Alert expired");
                    }
                }
            }
            _ = prune_timer.tick() => {
                if let Ok(mut store) = store.lock() {
                    let removed = store.alerts_mut().prune_log(Local::now());
                    if removed > 0 {
                        info!("Pruned {} old alerts from the log", removed);
                    }
                }
            }
        }
    }

    consumer.detach();
    coordinator.shutdown().await;
    info!("Dashboard stopped");
    Ok(())
}

fn led_driver(config: &AppConfig) -> Result<Box<dyn LedDriver>> {
    let led = &config.led;
    match led.driver {
        LedDriverKind::Script => Ok(Box::new(ScriptLedDriver::new(
            led.interpreter.clone(),
            led.script.clone(),
        ))),
        #[cfg(feature = "gpio")]
        LedDriverKind::Gpio => Ok(Box::new(crate::led::GpioLedDriver::new(
            led.red_pin,
            led.green_pin,
            led.blue_pin,
            led.common_anode,
        )?)),
        #[cfg(not(feature = "gpio"))]
        LedDriverKind::Gpio => Err(eyre!(
            "GPIO LED driver requested but sensorlink was built without the 'gpio' feature"
        )),
    }
}

async fn run_alerts(config: AppConfig, test_led: bool, shutdown: CancellationToken) -> Result<()> {
    let mut led = LedController::create(led_driver(&config)?).initialize().await?;
    if test_led {
        match unless_shutdown(&shutdown, led.test_sequence(TEST_STEP)).await {
            Some(result) => result?,
            None => info!("LED test interrupted"),
        }
    }

    let subscriber = AlertSubscriber::start(
        config.alerts_endpoint()?,
        RumqttTransport::new(),
        config.retry_policy(),
        &config.epoch,
        led,
        shutdown.child_token(),
    );
    match unless_shutdown(&shutdown, subscriber.connect()).await {
        Some(ConnectionState::Connected) => {
            info!("Listening for alerts on {}", config.topics().alerts)
        }
        Some(state) => warn!("Alert broker not reachable yet ({:?}), retrying", state),
        None => info!("Shutdown requested while connecting"),
    }

    let mut stats_timer =
        tokio::time::interval(Duration::from_secs(config.alerts.stats_interval_secs));
    stats_timer.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = stats_timer.tick() => {
                let stats = subscriber.stats();
                info!(
                    "Alerts: {} received, {} shown, {} LED failures, connection {:?}",
                    stats.received, stats.shown, stats.led_failures, subscriber.state()
                );
            }
        }
    }

    subscriber.shutdown().await;
    Ok(())
}

async fn run_publisher(config: AppConfig, shutdown: CancellationToken) -> Result<()> {
    let topics = config.topics();
    let mut publisher = SensorPublisher::start(
        config.publisher_endpoint()?,
        RumqttTransport::new(),
        config.retry_policy(),
        PublishTopics {
            temperature: topics.temperature,
            humidity: topics.humidity,
        },
        Duration::from_secs(config.publisher.publish_interval_secs),
        config.publisher.decimals,
        shutdown.child_token(),
    );

    match unless_shutdown(&shutdown, publisher.connect()).await {
        Some(Ok(())) => {}
        Some(Err(e)) => {
            publisher.shutdown().await;
            return Err(eyre!(
                "Could not connect to broker '{}': {}",
                config.publisher.broker,
                e
            ));
        }
        None => {
            info!("Shutdown requested while connecting");
            publisher.shutdown().await;
            return Ok(());
        }
    }

    let input = BufReader::new(tokio::io::stdin());
    let stats_interval = Duration::from_secs(config.publisher.stats_interval_secs);
    let counts = publisher.run(input, stats_interval, shutdown).await;
    info!("Publishing finished: {:?}", counts);

    publisher.shutdown().await;
    Ok(())
}
