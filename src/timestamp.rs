use time::format_description::well_known::{Iso8601, Rfc3339};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// Parses an ISO-8601 timestamp and normalizes it to UTC.
///
/// Accepts a trailing `Z` or any numeric offset. A timestamp without an
/// offset is taken as already being UTC.
pub fn parse_utc(raw: &str) -> Result<OffsetDateTime, time::error::Parse> {
    let raw = raw.trim();
    let parsed = OffsetDateTime::parse(raw, &Rfc3339)
        .or_else(|_| OffsetDateTime::parse(raw, &Iso8601::DEFAULT))
        .or_else(|err| {
            PrimitiveDateTime::parse(raw, &Iso8601::DEFAULT)
                .map(PrimitiveDateTime::assume_utc)
                .map_err(|_| err)
        })?;
    Ok(parsed.to_offset(UtcOffset::UTC))
}

/// Canonical text form used for storage, so that equal instants always
/// compare equal regardless of the offset they were received with.
pub fn to_canonical(timestamp: OffsetDateTime) -> Result<String, time::error::Format> {
    timestamp.to_offset(UtcOffset::UTC).format(format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
    ))
}

pub fn from_canonical(raw: &str) -> Result<OffsetDateTime, time::error::Parse> {
    OffsetDateTime::parse(raw, &Rfc3339)
}
