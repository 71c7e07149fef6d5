use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

/// Incoming packet limit of a subscriber unless configured otherwise.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 256 * 1024;

#[derive(Debug, Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

/// Network transport used to reach a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    Websockets,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Websockets => "websockets",
        }
    }
}

/// Peer certificate verification strictness for TLS brokers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsVerifyMode {
    /// No verification at all.
    None,
    /// Chain is verified, host name is not.
    Optional,
    #[default]
    Required,
}

impl TlsVerifyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVerifyMode::None => "none",
            TlsVerifyMode::Optional => "optional",
            TlsVerifyMode::Required => "required",
        }
    }
}

macro_rules! text_enum_sql {
    ($ty:ty, $kind:literal, [$($variant:path => $text:literal),+ $(,)?]) => {
        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: ParseEnumError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_enum_sql!(Transport, "transport", [
    Transport::Tcp => "tcp",
    Transport::Websockets => "websockets",
]);

text_enum_sql!(TlsVerifyMode, "TLS verify mode", [
    TlsVerifyMode::None => "none",
    TlsVerifyMode::Optional => "optional",
    TlsVerifyMode::Required => "required",
]);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broker {
    pub id: i64,
    pub host: String,
    pub port: u16,
    pub transport: Transport,
    pub websocket_path: String,
    pub use_tls: bool,
    /// PEM encoded CA certificate used to verify the broker.
    pub tls_certificate: Option<String>,
    pub tls_verifymode: TlsVerifyMode,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Broker {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            host: row.get("host")?,
            port: row.get("port")?,
            transport: row.get("transport")?,
            websocket_path: row.get("websocket_path")?,
            use_tls: row.get("use_tls")?,
            tls_certificate: row.get("tls_certificate")?,
            tls_verifymode: row.get("tls_verifymode")?,
            username: row.get("username")?,
            password: row.get("password")?,
        })
    }
}

/// Broker attributes for create/update operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBroker {
    pub host: String,
    pub port: u16,
    pub transport: Transport,
    pub websocket_path: String,
    pub use_tls: bool,
    pub tls_certificate: Option<String>,
    pub tls_verifymode: TlsVerifyMode,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl NewBroker {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            transport: Transport::Tcp,
            websocket_path: "/mqtt".to_string(),
            use_tls: false,
            tls_certificate: None,
            tls_verifymode: TlsVerifyMode::Required,
            username: None,
            password: None,
        }
    }

    pub fn websockets(mut self) -> Self {
        self.transport = Transport::Websockets;
        self
    }

    pub fn with_tls(mut self, certificate: Option<String>, verify_mode: TlsVerifyMode) -> Self {
        self.use_tls = true;
        self.tls_certificate = certificate;
        self.tls_verifymode = verify_mode;
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: i64,
    pub broker_id: i64,
    pub is_enabled: bool,
    pub is_connected: bool,
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
    pub use_persistent_session: bool,
    /// Largest incoming packet accepted, in bytes. Larger messages are dropped.
    pub max_packet_size: usize,
}

impl Subscriber {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            broker_id: row.get("broker_id")?,
            is_enabled: row.get("is_enabled")?,
            is_connected: row.get("is_connected")?,
            client_id: row.get("client_id")?,
            keep_alive_secs: row.get("keep_alive_secs")?,
            use_persistent_session: row.get("use_persistent_session")?,
            max_packet_size: row.get("max_packet_size")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSubscriber {
    pub broker_id: i64,
    pub is_enabled: bool,
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
    pub use_persistent_session: bool,
    pub max_packet_size: usize,
}

impl NewSubscriber {
    pub fn new(broker_id: i64) -> Self {
        Self {
            broker_id,
            is_enabled: true,
            client_id: None,
            keep_alive_secs: 60,
            use_persistent_session: false,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadField {
    pub id: i64,
    pub decoder_id: i64,
    pub name: String,
}

/// Persisted mirror of a registered decoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadDecoderRecord {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub fields: Vec<PayloadField>,
}

impl PayloadDecoderRecord {
    pub fn field(&self, name: &str) -> Option<&PayloadField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub id: i64,
    /// MQTT topic filter, wildcards allowed.
    pub name: String,
    pub qos: u8,
    pub payload_decoder_id: i64,
    pub is_enabled: bool,
}

impl Topic {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            qos: row.get("qos")?,
            payload_decoder_id: row.get("payload_decoder_id")?,
            is_enabled: row.get("is_enabled")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTopic {
    pub name: String,
    pub qos: u8,
    pub payload_decoder_id: i64,
    pub is_enabled: bool,
}

impl NewTopic {
    pub fn new(name: impl Into<String>, payload_decoder_id: i64) -> Self {
        Self {
            name: name.into(),
            qos: 1,
            payload_decoder_id,
            is_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicBySubscriber {
    pub topic_id: i64,
    pub subscriber_id: i64,
    pub is_subscribed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicLink {
    pub id: i64,
    pub topic_id: i64,
    pub payload_field_id: i64,
    pub timeseries_id: i64,
}

/// A link resolved to the decoder field name it reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLink {
    pub field_name: String,
    pub timeseries_id: i64,
}

/// Everything a subscriber needs to route one of its topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribedTopic {
    pub topic: Topic,
    pub decoder_name: String,
    pub links: Vec<FieldLink>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeseries {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub timeseries_id: i64,
    pub timestamp: OffsetDateTime,
    pub value: f64,
}
