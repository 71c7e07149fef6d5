use serde_json::Value;
use time::OffsetDateTime;

use super::{as_number, parse_object, parse_timestamp, DecodeError, DecodedValues, PayloadDecoder};

/// How a device reports each measurement inside `objectJSON`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueShape {
    /// `"temperature": 21.5`
    Scalar,
    /// `"channelA": {"value": 1.2, "unit": "V"}`
    Nested,
}

/// Chirpstack LoRaWAN gateway envelope.
///
/// The timestamp is `rxInfo[0].time`; measurements live in `objectJSON`,
/// which may itself be a JSON document encoded as a string.
#[derive(Debug, Clone)]
pub struct ChirpstackDecoder {
    name: &'static str,
    description: &'static str,
    fields: &'static [&'static str],
    shape: ValueShape,
}

impl ChirpstackDecoder {
    pub const fn new(
        name: &'static str,
        description: &'static str,
        fields: &'static [&'static str],
        shape: ValueShape,
    ) -> Self {
        Self {
            name,
            description,
            fields,
            shape,
        }
    }

    pub const fn arf8200aa() -> Self {
        Self::new(
            "chirpstack_ARF8200AA",
            "Chirpstack payload decoder for ARF8200AA devices",
            &["channelA", "channelB"],
            ValueShape::Nested,
        )
    }

    pub const fn em300_th_868() -> Self {
        Self::new(
            "chirpstack_EM300-TH-868",
            "Chirpstack payload decoder for EM300-TH-868 devices",
            &["temperature", "humidity"],
            ValueShape::Scalar,
        )
    }

    pub const fn uc11() -> Self {
        Self::new(
            "chirpstack_UC11",
            "Chirpstack payload decoder for UC11 devices",
            &["temperature", "humidity"],
            ValueShape::Scalar,
        )
    }

    pub const fn eagle1500() -> Self {
        Self::new(
            "chirpstack_EAGLE1500",
            "Chirpstack payload decoder for EAGLE 1500(80) devices",
            &[
                "active_power",
                "current",
                "export_active_energy",
                "import_active_energy",
                "power_factor",
                "reactive_energy",
                "relay_state",
                "voltage",
            ],
            ValueShape::Scalar,
        )
    }

    fn extract(&self, data: &serde_json::Map<String, Value>) -> DecodedValues {
        self.fields
            .iter()
            .filter_map(|field| {
                let raw = data.get(*field)?;
                let raw = match self.shape {
                    ValueShape::Scalar => raw,
                    ValueShape::Nested => raw.get("value")?,
                };
                as_number(raw).map(|value| (field.to_string(), value))
            })
            .collect()
    }
}

impl PayloadDecoder for ChirpstackDecoder {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        self.description
    }

    fn fields(&self) -> &[&str] {
        self.fields
    }

    fn decode_raw(&self, payload: &[u8]) -> Result<(OffsetDateTime, DecodedValues), DecodeError> {
        let json = parse_object(payload)?;

        // e.g. 2021-04-16T14:03:13.432986Z
        let raw_time = json
            .get("rxInfo")
            .and_then(|rx| rx.get(0))
            .ok_or_else(|| DecodeError::Malformed("no receive metadata in rxInfo".to_string()))?
            .get("time")
            .ok_or(DecodeError::MissingTimestamp("rxInfo[0].time"))?;
        let timestamp = match raw_time {
            Value::String(raw) => parse_timestamp(raw)?,
            other => {
                return Err(DecodeError::InvalidTimestamp {
                    value: other.to_string(),
                    reason: "expected a string".to_string(),
                })
            }
        };

        let not_an_object = || DecodeError::Malformed("objectJSON is not an object".to_string());
        let data = match json.get("objectJSON") {
            None | Some(Value::Null) => serde_json::Map::new(),
            Some(Value::String(encoded)) => {
                match serde_json::from_str(encoded).map_err(DecodeError::InvalidMeasurements)? {
                    Value::Object(map) => map,
                    _ => return Err(not_an_object()),
                }
            }
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(not_an_object()),
        };

        Ok((timestamp, self.extract(&data)))
    }
}
