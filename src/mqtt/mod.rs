//! # MQTT Integration Module
//!
//! Broker side of sensorlink: resilient connections to one or two MQTT brokers,
//! classification of inbound topics and decoding of sensor and alert payloads.
//!
//! ## Why This Module Exists
//!
//! The classroom deployment runs a local broker for sensor data and a public broker
//! for alerts. Either one may be down, restart, or drop the connection at any time.
//! This module keeps both connections alive on its own and turns whatever arrives into
//! typed events, so consumers never deal with sockets, retries or payload strings.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── topic.rs        - Topic filters and the router (topic -> kind + source id)
//! ├── payload.rs      - Sensor value and RGB alert decoders
//! ├── message.rs      - Inbound and classified message types
//! ├── config.rs       - Broker endpoint description
//! ├── retry.rs        - Exponential backoff policy
//! ├── transport.rs    - Transport trait and the rumqttc implementation
//! ├── supervisor.rs   - Per-broker connection state machine and actor
//! ├── pipeline.rs     - Classify, decode and dispatch
//! └── coordinator.rs  - Two supervisors behind one event surface
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! broker ──► Transport ──► ConnectionSupervisor ──► MessagePipeline ──► TelemetryDispatcher
//!                              │     ▲                 (TopicRouter,
//!                              │     │                  decoders)
//!                      watch status  commands
//!                              ▼     │
//!                          SupervisorHandle ◄── DualBrokerCoordinator
//! ```
//!
//! ## Failure Handling
//!
//! - Transport errors stay inside the supervisor: they become state transitions and
//!   scheduled retries, never errors returned to the coordinator.
//! - Decode errors drop the one message with a warning.
//! - A supervisor that ran out of retries sits in `Exhausted` until someone calls
//!   `connect` again; the rest of the process keeps running.

pub mod config;
pub mod coordinator;
pub mod message;
pub mod payload;
pub mod pipeline;
pub mod retry;
pub mod supervisor;
pub mod topic;
pub mod transport;

#[cfg(test)]
pub mod testing;
