//! Payload decoders turn raw MQTT payloads into a timestamp plus a set of
//! named numeric values.
//!
//! Each decoder is a strategy object registered by name in a
//! [`DecoderRegistry`]. Topics reference decoders by that name.

mod bemserver;
mod chirpstack;

pub use bemserver::BemServerDecoder;
pub use chirpstack::{ChirpstackDecoder, ValueShape};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;

use crate::db::{DatabaseService, DbError};

/// Field name to decoded value.
pub type DecodedValues = BTreeMap<String, f64>;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("missing timestamp field '{0}'")]
    MissingTimestamp(&'static str),
    #[error("invalid timestamp '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },
    #[error("value of field '{0}' is not numeric")]
    NonNumeric(String),
    #[error("measurement object is not valid JSON: {0}")]
    InvalidMeasurements(#[source] serde_json::Error),
    #[error("{0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
#[error("unknown payload decoder '{0}'")]
pub struct UnknownDecoder(pub String);

pub trait PayloadDecoder: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Ordered list of the fields this decoder can produce.
    fn fields(&self) -> &[&str];

    /// Format-specific decoding. Implementations may return more fields
    /// than declared; [`PayloadDecoder::decode`] filters them.
    fn decode_raw(&self, payload: &[u8]) -> Result<(OffsetDateTime, DecodedValues), DecodeError>;

    /// Decodes a payload, keeping only declared fields.
    fn decode(&self, payload: &[u8]) -> Result<(OffsetDateTime, DecodedValues), DecodeError> {
        let (timestamp, mut values) = self.decode_raw(payload)?;
        let fields = self.fields();
        values.retain(|name, _| fields.iter().any(|field| *field == name.as_str()));
        Ok((timestamp, values))
    }
}

/// Name-keyed set of decoders, shared between the service and its clients.
///
/// Populated at construction (or in test setup); lookups happen from every
/// subscriber worker.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    decoders: Arc<RwLock<HashMap<String, Arc<dyn PayloadDecoder>>>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every decoder shipped with the service.
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(BemServerDecoder));
        registry.register(Arc::new(ChirpstackDecoder::arf8200aa()));
        registry.register(Arc::new(ChirpstackDecoder::em300_th_868()));
        registry.register(Arc::new(ChirpstackDecoder::uc11()));
        registry.register(Arc::new(ChirpstackDecoder::eagle1500()));
        registry
    }

    /// Adds a decoder, replacing any previous one with the same name.
    pub fn register(&self, decoder: Arc<dyn PayloadDecoder>) {
        let name = decoder.name().to_string();
        self.decoders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, decoder);
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn PayloadDecoder>, UnknownDecoder> {
        self.decoders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| UnknownDecoder(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .decoders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Mirrors every registered decoder into the persisted decoder records,
    /// so topics and links can reference them.
    pub fn sync_to_db(&self, db: &DatabaseService) -> Result<(), DbError> {
        let decoders: Vec<Arc<dyn PayloadDecoder>> = self
            .decoders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for decoder in decoders {
            db.register_payload_decoder(decoder.name(), decoder.description(), decoder.fields())?;
        }
        Ok(())
    }
}

/// Parses a payload as a JSON object.
pub(crate) fn parse_object(payload: &[u8]) -> Result<serde_json::Map<String, Value>, DecodeError> {
    match serde_json::from_slice(payload).map_err(DecodeError::InvalidJson)? {
        Value::Object(map) => Ok(map),
        _ => Err(DecodeError::NotAnObject),
    }
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<OffsetDateTime, DecodeError> {
    crate::timestamp::parse_utc(raw).map_err(|err| DecodeError::InvalidTimestamp {
        value: raw.to_string(),
        reason: err.to_string(),
    })
}

/// Lenient numeric coercion: numbers, booleans and numeric strings.
/// `NaN` and infinities are not numbers here.
pub(crate) fn as_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    struct Uptime;

    impl PayloadDecoder for Uptime {
        fn name(&self) -> &str {
            "mosquitto_uptime_test"
        }

        fn fields(&self) -> &[&str] {
            &["uptime"]
        }

        fn decode_raw(
            &self,
            payload: &[u8],
        ) -> Result<(OffsetDateTime, DecodedValues), DecodeError> {
            let text =
                std::str::from_utf8(payload).map_err(|e| DecodeError::Malformed(e.to_string()))?;
            let uptime = text
                .split(' ')
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| DecodeError::NonNumeric("uptime".into()))?;
            let mut values = DecodedValues::new();
            values.insert("uptime".into(), uptime);
            values.insert("noise".into(), 1.0);
            Ok((datetime!(2021-01-01 0:00 UTC), values))
        }
    }

    #[test]
    fn builtin_registry_knows_every_shipped_decoder() {
        let registry = DecoderRegistry::with_builtin();
        assert_eq!(
            registry.names(),
            vec![
                "bemserver",
                "chirpstack_ARF8200AA",
                "chirpstack_EAGLE1500",
                "chirpstack_EM300-TH-868",
                "chirpstack_UC11",
            ]
        );
        let decoder = registry.lookup("chirpstack_UC11").unwrap();
        assert_eq!(decoder.fields(), &["temperature", "humidity"]);
    }

    #[test]
    fn lookup_of_unknown_name_fails() {
        let registry = DecoderRegistry::with_builtin();
        let err = registry.lookup("nope").err().unwrap();
        assert_eq!(err.0, "nope");
    }

    #[test]
    fn register_overwrites_by_name() {
        let registry = DecoderRegistry::new();
        registry.register(Arc::new(Uptime));
        registry.register(Arc::new(Uptime));
        assert_eq!(registry.names(), vec!["mosquitto_uptime_test"]);
    }

    #[test]
    fn custom_decoder_output_is_restricted_to_declared_fields() {
        let registry = DecoderRegistry::new();
        registry.register(Arc::new(Uptime));
        let decoder = registry.lookup("mosquitto_uptime_test").unwrap();
        let (_, values) = decoder.decode(b"4242 seconds").unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values["uptime"], 4242.0);
    }

    #[test]
    fn numeric_coercion() {
        assert_eq!(as_number(&serde_json::json!(3)), Some(3.0));
        assert_eq!(as_number(&serde_json::json!("2.5")), Some(2.5));
        assert_eq!(as_number(&serde_json::json!(true)), Some(1.0));
        assert_eq!(as_number(&serde_json::json!("abc")), None);
        assert_eq!(as_number(&serde_json::json!(null)), None);
        assert_eq!(as_number(&serde_json::json!({"value": 1})), None);
        for text in ["NaN", "nan", "inf", "-Infinity", "1e400"] {
            assert_eq!(as_number(&serde_json::json!(text)), None, "{}", text);
        }
    }
}
