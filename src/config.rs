//! # Configuration
//!
//! One TOML file, read once at start-up and treated as read-only afterwards. Every
//! field has a default, so an absent file or a partial one still yields a complete
//! configuration: a local broker carrying sensor data and a public broker carrying
//! alerts.
//!
//! Subscription patterns may contain `{namespace}`, `{epoch}` and `{source_id}`
//! placeholders, which are filled in when the broker endpoints are built.
//!
//! ```toml
//! source_id = "05"
//!
//! [[brokers]]
//! name = "local"
//! host = "192.168.2.33"
//! port = 1883
//! client_id_prefix = "dashboard_local"
//!
//! [[brokers.subscriptions]]
//! pattern = "{namespace}/Data/{epoch}/+/temperature"
//! kind = "temperature"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::dashboard::DashboardSettings;
use crate::mqtt::config::BrokerEndpoint;
use crate::mqtt::retry::RetryPolicy;
use crate::mqtt::topic::{MessageKind, Subscription, TopicPattern};

const CONFIG_DIR: &str = "sensorlink";
const CONFIG_FILE: &str = "config.toml";
/// rumqttc rejects keepalive intervals below this
const MIN_KEEPALIVE_SECS: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub source_id: String,
    pub namespace: String,
    pub epoch: String,
    pub retry: RetryConfig,
    pub brokers: Vec<BrokerConfig>,
    pub dashboard: DashboardConfig,
    pub alerts: AlertsConfig,
    pub led: LedConfig,
    pub publisher: PublisherConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_attempts: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct BrokerConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub client_id_prefix: String,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct SubscriptionConfig {
    pub pattern: String,
    pub kind: MessageKind,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DashboardConfig {
    pub history_len: usize,
    pub alert_ttl_secs: u64,
    pub alert_log_len: usize,
    pub alert_log_max_age_secs: u64,
    pub stats_interval_secs: u64,
    pub prune_interval_secs: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AlertsConfig {
    /// Broker carrying the own alerts topic
    pub broker: String,
    pub stats_interval_secs: u64,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LedDriverKind {
    Script,
    Gpio,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LedConfig {
    pub driver: LedDriverKind,
    pub interpreter: String,
    pub script: PathBuf,
    pub red_pin: u8,
    pub green_pin: u8,
    pub blue_pin: u8,
    pub common_anode: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PublisherConfig {
    pub broker: String,
    pub publish_interval_secs: u64,
    pub decimals: usize,
    pub stats_interval_secs: u64,
}

/// Topics owned by this source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTopics {
    pub temperature: String,
    pub humidity: String,
    pub alerts: String,
}

fn default_port() -> u16 {
    1883
}

fn default_keepalive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for AppConfig {
    fn default() -> Self {
        let subscription = |pattern: &str, kind| SubscriptionConfig {
            pattern: pattern.to_string(),
            kind,
        };

        Self {
            source_id: "05".to_string(),
            namespace: "GTI700".to_string(),
            epoch: "E2025".to_string(),
            retry: RetryConfig::default(),
            brokers: vec![
                BrokerConfig {
                    name: "local".to_string(),
                    host: "localhost".to_string(),
                    port: default_port(),
                    client_id_prefix: "sensorlink_local".to_string(),
                    keepalive_secs: default_keepalive(),
                    connect_timeout_secs: 10,
                    subscriptions: vec![
                        subscription(
                            "{namespace}/Data/{epoch}/+/temperature",
                            MessageKind::Temperature,
                        ),
                        subscription("{namespace}/Data/{epoch}/+/humidite", MessageKind::Humidity),
                    ],
                },
                BrokerConfig {
                    name: "remote".to_string(),
                    host: "broker.hivemq.com".to_string(),
                    port: default_port(),
                    client_id_prefix: "sensorlink_remote".to_string(),
                    keepalive_secs: default_keepalive(),
                    connect_timeout_secs: 15,
                    subscriptions: vec![subscription(
                        "{namespace}/Alerts/{epoch}/+",
                        MessageKind::Alert,
                    )],
                },
            ],
            dashboard: DashboardConfig::default(),
            alerts: AlertsConfig::default(),
            led: LedConfig::default(),
            publisher: PublisherConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 3000,
            multiplier: 1.5,
            max_attempts: 10,
        }
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            history_len: 15,
            alert_ttl_secs: 30,
            alert_log_len: 50,
            alert_log_max_age_secs: 300,
            stats_interval_secs: 30,
            prune_interval_secs: 60,
        }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            broker: "remote".to_string(),
            stats_interval_secs: 30,
        }
    }
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            driver: LedDriverKind::Script,
            interpreter: "python3".to_string(),
            script: PathBuf::from("scripts/led-control.py"),
            red_pin: 18,
            green_pin: 19,
            blue_pin: 20,
            common_anode: true,
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            broker: "local".to_string(),
            publish_interval_secs: 5,
            decimals: 2,
            stats_interval_secs: 30,
        }
    }
}

impl AppConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Loads and validates the configuration.
    ///
    /// An explicit path must exist. Without one, the default location is tried and the
    /// built-in defaults are used when no file is there.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::existing_default().await,
        };

        let config = match path {
            Some(path) => {
                let content = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|source| ConfigError::Io {
                        path: path.clone(),
                        source,
                    })?;
                info!("Loaded configuration from {}", path.display());
                Self::from_toml(&content)?
            }
            None => {
                info!("No configuration file found, using defaults");
                let config = Self::default();
                config.validate()?;
                config
            }
        };
        debug!("Configuration: {:?}", config);
        Ok(config)
    }

    async fn existing_default() -> Option<PathBuf> {
        let path = Self::default_path()?;
        let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
        exists.then_some(path)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid(message));

        if self.source_id.is_empty() || !self.source_id.chars().all(|c| c.is_ascii_digit()) {
            return invalid(format!("source_id must be numeric, got '{}'", self.source_id));
        }
        if self.namespace.is_empty() || self.epoch.is_empty() {
            return invalid("namespace and epoch must not be empty".to_string());
        }
        if self.retry.base_delay_ms == 0 {
            return invalid("retry.base_delay_ms must be positive".to_string());
        }
        if !(self.retry.multiplier >= 1.0 && self.retry.multiplier.is_finite()) {
            return invalid(format!(
                "retry.multiplier must be at least 1, got {}",
                self.retry.multiplier
            ));
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be positive".to_string());
        }

        if self.brokers.len() != 2 {
            return invalid(format!(
                "exactly two brokers are required, found {}",
                self.brokers.len()
            ));
        }
        if self.brokers[0].name == self.brokers[1].name {
            return invalid(format!("duplicate broker name '{}'", self.brokers[0].name));
        }
        for broker in &self.brokers {
            self.validate_broker(broker)?;
        }

        self.broker(&self.alerts.broker)?;
        self.broker(&self.publisher.broker)?;
        if self.dashboard.history_len == 0 {
            return invalid("dashboard.history_len must be positive".to_string());
        }
        if self.dashboard.stats_interval_secs == 0
            || self.dashboard.prune_interval_secs == 0
            || self.alerts.stats_interval_secs == 0
            || self.publisher.stats_interval_secs == 0
        {
            return invalid("stats and prune intervals must be positive".to_string());
        }
        Ok(())
    }

    fn validate_broker(&self, broker: &BrokerConfig) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid(message));

        if broker.name.is_empty() {
            return invalid("broker name must not be empty".to_string());
        }
        if broker.host.is_empty() {
            return invalid(format!("broker '{}' has no host", broker.name));
        }
        if broker.port == 0 {
            return invalid(format!("broker '{}' has port 0", broker.name));
        }
        if broker.keepalive_secs < MIN_KEEPALIVE_SECS {
            return invalid(format!(
                "broker '{}' keepalive must be at least {}s",
                broker.name, MIN_KEEPALIVE_SECS
            ));
        }
        if broker.connect_timeout_secs == 0 {
            return invalid(format!("broker '{}' connect timeout must be positive", broker.name));
        }
        for subscription in &broker.subscriptions {
            TopicPattern::parse(&self.expand(&subscription.pattern)).map_err(|e| {
                ConfigError::Invalid(format!("broker '{}': {}", broker.name, e))
            })?;
        }
        Ok(())
    }

    pub fn broker(&self, name: &str) -> Result<&BrokerConfig, ConfigError> {
        self.brokers
            .iter()
            .find(|broker| broker.name == name)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown broker '{}'", name)))
    }

    /// Fills in the `{namespace}`, `{epoch}` and `{source_id}` placeholders.
    pub fn expand(&self, template: &str) -> String {
        template
            .replace("{namespace}", &self.namespace)
            .replace("{epoch}", &self.epoch)
            .replace("{source_id}", &self.source_id)
    }

    pub fn topics(&self) -> SourceTopics {
        SourceTopics {
            temperature: format!("{}/Data/{}/{}/temperature", self.namespace, self.epoch, self.source_id),
            humidity: format!("{}/Data/{}/{}/humidite", self.namespace, self.epoch, self.source_id),
            alerts: format!("{}/Alerts/{}/{}", self.namespace, self.epoch, self.source_id),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry.base_delay_ms),
            self.retry.multiplier,
            self.retry.max_attempts,
        )
    }

    pub fn dashboard_settings(&self) -> DashboardSettings {
        DashboardSettings {
            history_len: self.dashboard.history_len,
            alert_ttl: Duration::from_secs(self.dashboard.alert_ttl_secs),
            alert_log_len: self.dashboard.alert_log_len,
            alert_log_max_age: Duration::from_secs(self.dashboard.alert_log_max_age_secs),
        }
    }

    /// Builds the endpoint for a configured broker with its configured subscriptions.
    pub fn endpoint(&self, name: &str) -> Result<BrokerEndpoint, ConfigError> {
        let broker = self.broker(name)?;
        let subscriptions = broker
            .subscriptions
            .iter()
            .map(|subscription| {
                TopicPattern::parse(&self.expand(&subscription.pattern))
                    .map(|pattern| Subscription::new(pattern, subscription.kind))
                    .map_err(|e| ConfigError::Invalid(format!("broker '{}': {}", name, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(self.endpoint_with(broker, subscriptions))
    }

    /// Endpoint for the alert subscriber: only the own alerts topic.
    pub fn alerts_endpoint(&self) -> Result<BrokerEndpoint, ConfigError> {
        let broker = self.broker(&self.alerts.broker)?;
        let pattern = TopicPattern::parse(&self.topics().alerts)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(self.endpoint_with(broker, vec![Subscription::new(pattern, MessageKind::Alert)]))
    }

    /// Endpoint for the publisher, which subscribes to nothing.
    pub fn publisher_endpoint(&self) -> Result<BrokerEndpoint, ConfigError> {
        let broker = self.broker(&self.publisher.broker)?;
        Ok(self.endpoint_with(broker, Vec::new()))
    }

    pub fn dual_endpoints(&self) -> Result<[BrokerEndpoint; 2], ConfigError> {
        match self.brokers.as_slice() {
            [first, second] => Ok([self.endpoint(&first.name)?, self.endpoint(&second.name)?]),
            _ => Err(ConfigError::Invalid(format!(
                "exactly two brokers are required, found {}",
                self.brokers.len()
            ))),
        }
    }

    fn endpoint_with(&self, broker: &BrokerConfig, subscriptions: Vec<Subscription>) -> BrokerEndpoint {
        BrokerEndpoint {
            name: broker.name.clone(),
            host: broker.host.clone(),
            port: broker.port,
            client_id: client_id(&broker.client_id_prefix),
            subscriptions,
            keepalive: Duration::from_secs(broker.keepalive_secs),
            connect_timeout: Duration::from_secs(broker.connect_timeout_secs),
        }
    }
}

/// `<prefix>_<8 random hex digits>`, fresh for every process start.
fn client_id(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &suffix[..8])
}
