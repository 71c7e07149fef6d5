use std::path::PathBuf;
use std::time::Duration;

use log::{debug, error, info, warn};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{ffi, params, ErrorCode, OptionalExtension};
use thiserror::Error;
use time::OffsetDateTime;

use crate::models::{
    Broker, DataPoint, FieldLink, NewBroker, NewSubscriber, NewTopic, PayloadDecoderRecord,
    PayloadField, SubscribedTopic, Subscriber, Timeseries, Topic, TopicBySubscriber, TopicLink,
};
use crate::timestamp;

const POOL_SIZE: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("Invalid database URL '{0}'")]
    InvalidUrl(String),
    #[error("Invalid record: {0}")]
    Invalid(String),
    #[error("Timestamp error: {0}")]
    Timestamp(String),
}

impl DbError {
    /// Maps UNIQUE and PRIMARY KEY failures to
    /// [`DbError::ConstraintViolation`]. Other constraint failures (foreign
    /// key, NOT NULL, CHECK) stay [`DbError::Sqlite`].
    fn classify(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(code, _) = &err {
            let duplicate = matches!(
                code.extended_code,
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            );
            if code.code == ErrorCode::ConstraintViolation && duplicate {
                return DbError::ConstraintViolation(err.to_string());
            }
        }
        DbError::Sqlite(err)
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, DbError::ConstraintViolation(_))
    }
}

type Result<T> = std::result::Result<T, DbError>;

fn timestamp_error(err: impl std::fmt::Display) -> DbError {
    DbError::Timestamp(err.to_string())
}

/// Resolves `sqlite://path`, `sqlite:///abs/path`, `file:path` or a bare
/// path to the database file location.
pub fn sqlite_path_from_url(url: &str) -> Result<PathBuf> {
    let path = if let Some(rest) = url.strip_prefix("sqlite://") {
        rest
    } else if let Some(rest) = url.strip_prefix("file:") {
        rest.trim_start_matches("//")
    } else if url.contains("://") {
        return Err(DbError::InvalidUrl(url.to_string()));
    } else {
        url
    };
    if path.is_empty() {
        return Err(DbError::InvalidUrl(url.to_string()));
    }
    Ok(PathBuf::from(path))
}

/// Persistence collaborator: routing model records and timeseries data.
///
/// Connections come from a pool, so every subscriber worker writes through
/// its own connection and its own short transaction.
pub struct DatabaseService {
    pool: Pool<SqliteConnectionManager>,
    url: String,
}

impl DatabaseService {
    /// Creates a new `DatabaseService` and ensures the database connection is valid.
    pub fn new(url: &str) -> Result<Self> {
        let path = sqlite_path_from_url(url)?;
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")
        });
        let pool = Pool::builder().max_size(POOL_SIZE).build(manager)?;
        info!("Database connection pool opened for {}", url);
        Ok(Self {
            pool,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Releases every pooled connection.
    pub fn dispose(self) {
        info!("Disposing database connections for {}", self.url);
        drop(self.pool);
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Initializes the database schema.
    pub fn initialize_db(&self) -> Result<()> {
        let conn = self.conn()?;

        info!("Initializing database schema...");

        match conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS brokers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            host TEXT NOT NULL,
            port INTEGER NOT NULL,
            transport TEXT NOT NULL DEFAULT 'tcp',
            websocket_path TEXT NOT NULL DEFAULT '/mqtt',
            use_tls BOOLEAN NOT NULL DEFAULT 0,
            tls_certificate TEXT,
            tls_verifymode TEXT NOT NULL DEFAULT 'required',
            username TEXT,
            password TEXT
        );

        CREATE TABLE IF NOT EXISTS subscribers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            broker_id INTEGER NOT NULL,
            is_enabled BOOLEAN NOT NULL DEFAULT 1,
            is_connected BOOLEAN NOT NULL DEFAULT 0,
            client_id TEXT,
            keep_alive_secs INTEGER NOT NULL DEFAULT 60,
            use_persistent_session BOOLEAN NOT NULL DEFAULT 0,
            max_packet_size INTEGER NOT NULL DEFAULT 262144,
            FOREIGN KEY (broker_id) REFERENCES brokers(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS payload_decoders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS payload_fields (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            decoder_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            position INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (decoder_id) REFERENCES payload_decoders(id) ON DELETE CASCADE,
            UNIQUE (decoder_id, name)
        );

        CREATE TABLE IF NOT EXISTS topics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            qos INTEGER NOT NULL DEFAULT 1,
            payload_decoder_id INTEGER NOT NULL,
            is_enabled BOOLEAN NOT NULL DEFAULT 1,
            FOREIGN KEY (payload_decoder_id) REFERENCES payload_decoders(id)
        );

        CREATE TABLE IF NOT EXISTS topics_by_subscriber (
            topic_id INTEGER NOT NULL,
            subscriber_id INTEGER NOT NULL,
            is_subscribed BOOLEAN NOT NULL DEFAULT 0,
            PRIMARY KEY (topic_id, subscriber_id),
            FOREIGN KEY (topic_id) REFERENCES topics(id) ON DELETE CASCADE,
            FOREIGN KEY (subscriber_id) REFERENCES subscribers(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS timeseries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            description TEXT
        );

        CREATE TABLE IF NOT EXISTS topic_links (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            topic_id INTEGER NOT NULL,
            payload_field_id INTEGER NOT NULL,
            timeseries_id INTEGER NOT NULL,
            FOREIGN KEY (topic_id) REFERENCES topics(id) ON DELETE CASCADE,
            FOREIGN KEY (payload_field_id) REFERENCES payload_fields(id) ON DELETE CASCADE,
            FOREIGN KEY (timeseries_id) REFERENCES timeseries(id) ON DELETE CASCADE,
            UNIQUE (topic_id, payload_field_id)
        );

        CREATE TABLE IF NOT EXISTS timeseries_data (
            timeseries_id INTEGER NOT NULL,
            timestamp TEXT NOT NULL,
            value REAL NOT NULL,
            FOREIGN KEY (timeseries_id) REFERENCES timeseries(id) ON DELETE CASCADE,
            UNIQUE (timeseries_id, timestamp)
        );
        "#,
        ) {
            Ok(_) => {
                info!("Database schema initialized successfully.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize database schema: {:?}", e);
                Err(e.into())
            }
        }
    }

    pub fn create_broker(&self, broker: &NewBroker) -> Result<Broker> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO brokers (host, port, transport, websocket_path, use_tls,
                                 tls_certificate, tls_verifymode, username, password)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                broker.host,
                broker.port,
                broker.transport,
                broker.websocket_path,
                broker.use_tls,
                broker.tls_certificate,
                broker.tls_verifymode,
                broker.username,
                broker.password,
            ],
        )
        .map_err(DbError::classify)?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_broker(id)
    }

    pub fn update_broker(&self, id: i64, broker: &NewBroker) -> Result<Broker> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                r#"
            UPDATE brokers SET host = ?2, port = ?3, transport = ?4, websocket_path = ?5,
                use_tls = ?6, tls_certificate = ?7, tls_verifymode = ?8,
                username = ?9, password = ?10
            WHERE id = ?1
            "#,
                params![
                    id,
                    broker.host,
                    broker.port,
                    broker.transport,
                    broker.websocket_path,
                    broker.use_tls,
                    broker.tls_certificate,
                    broker.tls_verifymode,
                    broker.username,
                    broker.password,
                ],
            )
            .map_err(DbError::classify)?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("broker {}", id)));
        }
        drop(conn);
        self.get_broker(id)
    }

    pub fn get_broker(&self, id: i64) -> Result<Broker> {
        self.conn()?
            .query_row("SELECT * FROM brokers WHERE id = ?1", params![id], Broker::from_row)
            .optional()?
            .ok_or_else(|| DbError::NotFound(format!("broker {}", id)))
    }

    pub fn create_subscriber(&self, subscriber: &NewSubscriber) -> Result<Subscriber> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO subscribers (
                broker_id, is_enabled, client_id, keep_alive_secs, use_persistent_session,
                max_packet_size
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                subscriber.broker_id,
                subscriber.is_enabled,
                subscriber.client_id,
                subscriber.keep_alive_secs,
                subscriber.use_persistent_session,
                subscriber.max_packet_size,
            ],
        )
        .map_err(DbError::classify)?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_subscriber(id)
    }

    pub fn get_subscriber(&self, id: i64) -> Result<Subscriber> {
        self.conn()?
            .query_row("SELECT * FROM subscribers WHERE id = ?1", params![id], Subscriber::from_row)
            .optional()?
            .ok_or_else(|| DbError::NotFound(format!("subscriber {}", id)))
    }

    pub fn enabled_subscribers(&self) -> Result<Vec<Subscriber>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM subscribers WHERE is_enabled = 1 ORDER BY id")?;
        let rows = stmt.query_map([], Subscriber::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn set_subscriber_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        self.update_flag(
            "UPDATE subscribers SET is_enabled = ?2 WHERE id = ?1",
            id,
            enabled,
            "subscriber",
        )
    }

    pub fn set_subscriber_connected(&self, id: i64, connected: bool) -> Result<()> {
        debug!("Subscriber {} is_connected = {}", id, connected);
        self.update_flag(
            "UPDATE subscribers SET is_connected = ?2 WHERE id = ?1",
            id,
            connected,
            "subscriber",
        )
    }

    fn update_flag(&self, sql: &str, id: i64, value: bool, what: &str) -> Result<()> {
        let updated = self.conn()?.execute(sql, params![id, value])?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("{} {}", what, id)));
        }
        Ok(())
    }

    /// Clears every connection/subscription flag held by a subscriber.
    pub fn reset_subscriber_flags(&self, subscriber_id: i64) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE topics_by_subscriber SET is_subscribed = 0 WHERE subscriber_id = ?1",
            params![subscriber_id],
        )?;
        tx.execute(
            "UPDATE subscribers SET is_connected = 0 WHERE id = ?1",
            params![subscriber_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Clears stale flags left over by a process that did not stop cleanly.
    pub fn reset_connection_flags(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "UPDATE topics_by_subscriber SET is_subscribed = 0;
             UPDATE subscribers SET is_connected = 0;",
        )?;
        Ok(())
    }

    /// Adds or updates a decoder record and its declared fields.
    pub fn register_payload_decoder(
        &self,
        name: &str,
        description: &str,
        fields: &[&str],
    ) -> Result<PayloadDecoderRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO payload_decoders (name, description) VALUES (?1, ?2)
            ON CONFLICT(name) DO UPDATE SET description = excluded.description
            "#,
            params![name, description],
        )?;
        let decoder_id: i64 =
            tx.query_row("SELECT id FROM payload_decoders WHERE name = ?1", params![name], |row| {
                row.get(0)
            })?;
        for (position, field) in fields.iter().enumerate() {
            tx.execute(
                r#"
                INSERT INTO payload_fields (decoder_id, name, position) VALUES (?1, ?2, ?3)
                ON CONFLICT(decoder_id, name) DO UPDATE SET position = excluded.position
                "#,
                params![decoder_id, field, position],
            )?;
        }
        tx.commit()?;
        drop(conn);
        debug!("Payload decoder '{}' registered with fields {:?}", name, fields);
        self.get_payload_decoder(decoder_id)
    }

    pub fn get_payload_decoder(&self, id: i64) -> Result<PayloadDecoderRecord> {
        let conn = self.conn()?;
        let (name, description) = conn
            .query_row(
                "SELECT name, description FROM payload_decoders WHERE id = ?1",
                params![id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?
            .ok_or_else(|| DbError::NotFound(format!("payload decoder {}", id)))?;
        let mut stmt = conn.prepare(
            "SELECT id, decoder_id, name FROM payload_fields
             WHERE decoder_id = ?1 ORDER BY position, id",
        )?;
        let fields = stmt
            .query_map(params![id], |row| {
                Ok(PayloadField {
                    id: row.get(0)?,
                    decoder_id: row.get(1)?,
                    name: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(PayloadDecoderRecord {
            id,
            name,
            description,
            fields,
        })
    }

    pub fn get_payload_decoder_by_name(&self, name: &str) -> Result<PayloadDecoderRecord> {
        let id: i64 = self
            .conn()?
            .query_row("SELECT id FROM payload_decoders WHERE name = ?1", params![name], |row| {
                row.get(0)
            })
            .optional()?
            .ok_or_else(|| DbError::NotFound(format!("payload decoder '{}'", name)))?;
        self.get_payload_decoder(id)
    }

    pub fn create_topic(&self, topic: &NewTopic) -> Result<Topic> {
        if !rumqttc::valid_filter(&topic.name) {
            return Err(DbError::Invalid(format!("topic filter '{}'", topic.name)));
        }
        if topic.qos > 2 {
            return Err(DbError::Invalid(format!(
                "QoS {} for topic '{}'",
                topic.qos, topic.name
            )));
        }
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO topics (name, qos, payload_decoder_id, is_enabled)
             VALUES (?1, ?2, ?3, ?4)",
            params![topic.name, topic.qos, topic.payload_decoder_id, topic.is_enabled],
        )
        .map_err(DbError::classify)?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_topic(id)
    }

    pub fn get_topic(&self, id: i64) -> Result<Topic> {
        self.conn()?
            .query_row("SELECT * FROM topics WHERE id = ?1", params![id], Topic::from_row)
            .optional()?
            .ok_or_else(|| DbError::NotFound(format!("topic {}", id)))
    }

    pub fn set_topic_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        self.update_flag("UPDATE topics SET is_enabled = ?2 WHERE id = ?1", id, enabled, "topic")
    }

    pub fn add_topic_subscriber(
        &self,
        topic_id: i64,
        subscriber_id: i64,
    ) -> Result<TopicBySubscriber> {
        self.conn()?
            .execute(
                "INSERT INTO topics_by_subscriber (topic_id, subscriber_id) VALUES (?1, ?2)
                 ON CONFLICT(topic_id, subscriber_id) DO NOTHING",
                params![topic_id, subscriber_id],
            )
            .map_err(DbError::classify)?;
        self.get_topic_by_subscriber(topic_id, subscriber_id)
    }

    pub fn get_topic_by_subscriber(
        &self,
        topic_id: i64,
        subscriber_id: i64,
    ) -> Result<TopicBySubscriber> {
        self.conn()?
            .query_row(
                "SELECT topic_id, subscriber_id, is_subscribed FROM topics_by_subscriber
                 WHERE topic_id = ?1 AND subscriber_id = ?2",
                params![topic_id, subscriber_id],
                |row| {
                    Ok(TopicBySubscriber {
                        topic_id: row.get(0)?,
                        subscriber_id: row.get(1)?,
                        is_subscribed: row.get(2)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| {
                DbError::NotFound(format!(
                    "topic {} for subscriber {}",
                    topic_id, subscriber_id
                ))
            })
    }

    pub fn set_topic_subscribed(
        &self,
        topic_id: i64,
        subscriber_id: i64,
        subscribed: bool,
    ) -> Result<()> {
        debug!(
            "Topic {} for subscriber {} is_subscribed = {}",
            topic_id, subscriber_id, subscribed
        );
        let updated = self.conn()?.execute(
            "UPDATE topics_by_subscriber SET is_subscribed = ?3
             WHERE topic_id = ?1 AND subscriber_id = ?2",
            params![topic_id, subscriber_id, subscribed],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound(format!(
                "topic {} for subscriber {}",
                topic_id, subscriber_id
            )));
        }
        Ok(())
    }

    /// Links a decoder field of a topic to the timeseries it feeds.
    pub fn add_topic_link(
        &self,
        topic_id: i64,
        payload_field_id: i64,
        timeseries_id: i64,
    ) -> Result<TopicLink> {
        let conn = self.conn()?;
        let field_decoder: Option<i64> = conn
            .query_row(
                "SELECT decoder_id FROM payload_fields WHERE id = ?1",
                params![payload_field_id],
                |row| row.get(0),
            )
            .optional()?;
        let topic = self.get_topic(topic_id)?;
        match field_decoder {
            None => return Err(DbError::NotFound(format!("payload field {}", payload_field_id))),
            Some(decoder_id) if decoder_id != topic.payload_decoder_id => {
                return Err(DbError::Invalid(format!(
                    "payload field {} does not belong to the decoder of topic '{}'",
                    payload_field_id, topic.name
                )))
            }
            Some(_) => {}
        }
        conn.execute(
            "INSERT INTO topic_links (topic_id, payload_field_id, timeseries_id)
             VALUES (?1, ?2, ?3)",
            params![topic_id, payload_field_id, timeseries_id],
        )
        .map_err(DbError::classify)?;
        Ok(TopicLink {
            id: conn.last_insert_rowid(),
            topic_id,
            payload_field_id,
            timeseries_id,
        })
    }

    pub fn topic_links(&self, topic_id: i64) -> Result<Vec<FieldLink>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT payload_fields.name, topic_links.timeseries_id
            FROM topic_links
            INNER JOIN payload_fields ON payload_fields.id = topic_links.payload_field_id
            WHERE topic_links.topic_id = ?1
            ORDER BY payload_fields.position, topic_links.id
            "#,
        )?;
        let links = stmt
            .query_map(params![topic_id], |row| {
                Ok(FieldLink {
                    field_name: row.get(0)?,
                    timeseries_id: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(links)
    }

    /// Enabled topics associated with a subscriber, with their decoder name
    /// and field links.
    pub fn subscribed_topics(&self, subscriber_id: i64) -> Result<Vec<SubscribedTopic>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT topics.*, payload_decoders.name AS decoder_name
            FROM topics
            INNER JOIN topics_by_subscriber ON topics_by_subscriber.topic_id = topics.id
            INNER JOIN payload_decoders ON payload_decoders.id = topics.payload_decoder_id
            WHERE topics_by_subscriber.subscriber_id = ?1 AND topics.is_enabled = 1
            ORDER BY topics.id
            "#,
        )?;
        let rows = stmt
            .query_map(params![subscriber_id], |row| {
                Ok((Topic::from_row(row)?, row.get::<_, String>("decoder_name")?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        drop(conn);

        rows.into_iter()
            .map(|(topic, decoder_name)| {
                let links = self.topic_links(topic.id)?;
                Ok(SubscribedTopic {
                    topic,
                    decoder_name,
                    links,
                })
            })
            .collect()
    }

    pub fn create_timeseries(&self, name: &str, description: Option<&str>) -> Result<Timeseries> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO timeseries (name, description) VALUES (?1, ?2)",
            params![name, description],
        )
        .map_err(DbError::classify)?;
        Ok(Timeseries {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            description: description.map(str::to_string),
        })
    }

    /// Inserts one data point in its own transaction.
    ///
    /// A duplicate (timeseries, timestamp) rolls the transaction back and is
    /// reported as [`DbError::ConstraintViolation`].
    pub fn insert_timeseries_data(
        &self,
        timeseries_id: i64,
        timestamp: OffsetDateTime,
        value: f64,
    ) -> Result<()> {
        let ts = timestamp::to_canonical(timestamp).map_err(timestamp_error)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        match tx.execute(
            "INSERT INTO timeseries_data (timeseries_id, timestamp, value) VALUES (?1, ?2, ?3)",
            params![timeseries_id, ts, value],
        ) {
            Ok(_) => {
                tx.commit()?;
                Ok(())
            }
            Err(e) => {
                let err = DbError::classify(e);
                if let Err(rollback) = tx.rollback() {
                    warn!("Rollback failed after insert error: {:?}", rollback);
                }
                Err(err)
            }
        }
    }

    /// Data points of a timeseries, oldest first.
    pub fn timeseries_data(&self, timeseries_id: i64) -> Result<Vec<DataPoint>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, value FROM timeseries_data
             WHERE timeseries_id = ?1 ORDER BY timestamp",
        )?;
        let rows = stmt
            .query_map(params![timeseries_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(ts, value)| {
                Ok(DataPoint {
                    timeseries_id,
                    timestamp: timestamp::from_canonical(&ts).map_err(timestamp_error)?,
                    value,
                })
            })
            .collect()
    }

    pub fn count_timeseries_data(&self, timeseries_id: i64) -> Result<usize> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM timeseries_data WHERE timeseries_id = ?1",
            params![timeseries_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
