//! Timeseries acquisition through MQTT.
//!
//! Subscribers connect to brokers, decode the payloads received on their
//! topics and store every linked field as a timeseries data point.

pub mod config;
pub mod db;
pub mod decoders;
pub mod logging;
pub mod models;
pub mod mqtt_service;
pub mod service;
pub mod timestamp;
pub mod tls;

#[cfg(test)]
mod test_support;

pub use db::{DatabaseService, DbError};
pub use decoders::{DecodeError, DecoderRegistry, PayloadDecoder};
pub use mqtt_service::{ClientError, SubscriberClient};
pub use service::{Service, ServiceError};
