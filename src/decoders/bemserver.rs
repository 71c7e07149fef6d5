use serde_json::Value;
use time::OffsetDateTime;

use super::{as_number, parse_object, parse_timestamp, DecodeError, DecodedValues, PayloadDecoder};

/// Generic JSON payload: `{"ts": "<ISO-8601>", "value": <number>}`.
///
/// `value` is optional; a present but non-numeric `value` is an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct BemServerDecoder;

impl PayloadDecoder for BemServerDecoder {
    fn name(&self) -> &str {
        "bemserver"
    }

    fn description(&self) -> &str {
        "Default BEMServer payload decoder"
    }

    fn fields(&self) -> &[&str] {
        &["value"]
    }

    fn decode_raw(&self, payload: &[u8]) -> Result<(OffsetDateTime, DecodedValues), DecodeError> {
        let json = parse_object(payload)?;
        let timestamp = match json.get("ts") {
            Some(Value::String(raw)) => parse_timestamp(raw)?,
            Some(other) => {
                return Err(DecodeError::InvalidTimestamp {
                    value: other.to_string(),
                    reason: "expected a string".to_string(),
                })
            }
            None => return Err(DecodeError::MissingTimestamp("ts")),
        };

        let mut values = DecodedValues::new();
        if let Some(raw) = json.get("value") {
            let value = as_number(raw).ok_or_else(|| DecodeError::NonNumeric("value".to_string()))?;
            values.insert("value".to_string(), value);
        }
        Ok((timestamp, values))
    }
}
