use std::fmt;
use std::time::Duration;

use super::topic::Subscription;

/// Everything a supervisor needs to reach one broker. Built once at start-up.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerEndpoint {
    /// Logical name used in logs, events and statistics ("local", "remote")
    pub name: String,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub subscriptions: Vec<Subscription>,
    pub keepalive: Duration,
    pub connect_timeout: Duration,
}

impl BrokerEndpoint {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({}@{})", self.name, self.client_id, self.address())
    }
}
