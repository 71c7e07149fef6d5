use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::db::{DatabaseService, DbError};
use crate::decoders::DecoderRegistry;
use crate::mqtt_service::{ClientError, SubscriberClient};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("No database connection configured")]
    DatabaseNotConfigured,
    #[error("Database already configured with '{current}', refusing '{requested}' while running")]
    DatabaseAlreadyConfigured { current: String, requested: String },
    #[error("Database error: {0}")]
    Db(#[from] DbError),
}

/// Owns the subscriber clients and their run/stop lifecycle.
pub struct Service {
    working_dir: PathBuf,
    registry: DecoderRegistry,
    db: Option<Arc<DatabaseService>>,
    running: Vec<SubscriberClient>,
    start_failures: BTreeMap<i64, ClientError>,
    is_running: bool,
}

impl Service {
    pub fn new(working_dir: impl Into<PathBuf>, registry: DecoderRegistry) -> Self {
        Self {
            working_dir: working_dir.into(),
            registry,
            db: None,
            running: Vec::new(),
            start_failures: BTreeMap::new(),
            is_running: false,
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn registry(&self) -> &DecoderRegistry {
        &self.registry
    }

    pub fn database(&self) -> Option<Arc<DatabaseService>> {
        self.db.clone()
    }

    /// Points the service at its database.
    ///
    /// Same URL again is a no-op. A different URL replaces the connection
    /// pool when stopped and is rejected while running.
    pub fn set_db_connection(&mut self, url: &str) -> Result<(), ServiceError> {
        if let Some(current) = &self.db {
            if current.url() == url {
                debug!("Database connection already set to {}", url);
                return Ok(());
            }
            if self.is_running {
                return Err(ServiceError::DatabaseAlreadyConfigured {
                    current: current.url().to_string(),
                    requested: url.to_string(),
                });
            }
        }

        let db = DatabaseService::new(url)?;
        db.initialize_db()?;
        self.registry.sync_to_db(&db)?;

        if let Some(previous) = self.db.replace(Arc::new(db)) {
            info!("Database connection moved from {} to {}", previous.url(), url);
            match Arc::try_unwrap(previous) {
                Ok(previous) => previous.dispose(),
                Err(_) => warn!(
                    "Previous database connection still in use, it will close with its last user"
                ),
            }
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.is_running
    }

    /// Ids of the subscribers started by the last `run()`.
    pub fn running_subscribers(&self) -> Vec<i64> {
        self.running.iter().map(SubscriberClient::subscriber_id).collect()
    }

    /// Subscribers that failed to start during the last `run()`.
    pub fn start_failures(&self) -> &BTreeMap<i64, ClientError> {
        &self.start_failures
    }

    /// Starts a client for every enabled subscriber. A subscriber failing to
    /// start does not prevent the others from running.
    pub async fn run(&mut self) -> Result<(), ServiceError> {
        if self.is_running {
            debug!("Service already running");
            return Ok(());
        }
        let db = self.db.clone().ok_or(ServiceError::DatabaseNotConfigured)?;
        info!("Starting MQTT acquisition service...");

        db.reset_connection_flags()?;
        self.start_failures.clear();

        let mut clients = Vec::new();
        for subscriber in db.enabled_subscribers()? {
            match db.get_broker(subscriber.broker_id) {
                Ok(broker) => clients.push(SubscriberClient::new(
                    subscriber,
                    broker,
                    db.clone(),
                    self.registry.clone(),
                    &self.working_dir,
                )),
                Err(e) => {
                    error!("Subscriber {} has no usable broker: {}", subscriber.id, e);
                    self.start_failures.insert(subscriber.id, ClientError::Db(e));
                }
            }
        }

        let results = join_all(clients.iter_mut().map(|client| client.start())).await;
        for (client, result) in clients.into_iter().zip(results) {
            match result {
                Ok(()) => self.running.push(client),
                Err(e) => {
                    error!("Subscriber {} not started: {}", client.subscriber_id(), e);
                    self.start_failures.insert(client.subscriber_id(), e);
                }
            }
        }

        self.is_running = true;
        info!("{}", self.status_summary());
        Ok(())
    }

    /// Stops every running client and waits for their workers.
    pub async fn stop(&mut self) {
        if !self.is_running {
            debug!("Service not running");
            return;
        }
        info!("Stopping MQTT acquisition service...");
        join_all(self.running.iter_mut().map(|client| client.stop())).await;
        self.running.clear();
        self.is_running = false;
        info!("MQTT acquisition service stopped");
    }

    pub fn status_summary(&self) -> String {
        let active = self.running.iter().filter(|c| c.is_active()).count();
        format!(
            "running={} subscribers: {} started, {} active, {} failed",
            self.is_running,
            self.running.len(),
            active,
            self.start_failures.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewBroker, NewSubscriber};
    use crate::test_support::{bemserver_topic, unused_port, wait_until, FakeBroker, TOPIC_NAME};

    fn db_url(dir: &tempfile::TempDir, name: &str) -> String {
        format!("sqlite://{}", dir.path().join(name).display())
    }

    #[test]
    fn set_db_connection_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut svc = Service::new(dir.path(), DecoderRegistry::with_builtin());
        assert!(svc.database().is_none());

        let url = db_url(&dir, "a.db");
        svc.set_db_connection(&url).unwrap();
        let db = svc.database().unwrap();
        assert_eq!(db.url(), url);
        // Built-in decoders are mirrored for topic linking.
        assert!(db.get_payload_decoder_by_name("bemserver").is_ok());

        svc.set_db_connection(&url).unwrap();
        assert!(Arc::ptr_eq(&db, &svc.database().unwrap()));
    }

    #[test]
    fn set_db_connection_repoints_when_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let mut svc = Service::new(dir.path(), DecoderRegistry::with_builtin());
        svc.set_db_connection(&db_url(&dir, "a.db")).unwrap();
        svc.set_db_connection(&db_url(&dir, "b.db")).unwrap();
        assert_eq!(svc.database().unwrap().url(), db_url(&dir, "b.db"));
    }

    #[test]
    fn set_db_connection_rejects_bad_url() {
        let dir = tempfile::tempdir().unwrap();
        let mut svc = Service::new(dir.path(), DecoderRegistry::with_builtin());
        let err = svc.set_db_connection("postgresql://localhost/bemserver").unwrap_err();
        assert!(matches!(err, ServiceError::Db(DbError::InvalidUrl(_))));
        assert!(svc.database().is_none());
    }

    #[tokio::test]
    async fn run_requires_a_database() {
        let dir = tempfile::tempdir().unwrap();
        let mut svc = Service::new(dir.path(), DecoderRegistry::with_builtin());
        assert!(matches!(svc.run().await, Err(ServiceError::DatabaseNotConfigured)));
        assert!(!svc.is_running());
    }

    #[tokio::test]
    async fn run_and_stop() {
        let broker_server = FakeBroker::start().await;
        broker_server.retain(TOPIC_NAME, br#"{"ts": "2021-04-27T16:05:11Z", "value": 42}"#);

        let dir = tempfile::tempdir().unwrap();
        let mut svc = Service::new(dir.path(), DecoderRegistry::with_builtin());
        svc.set_db_connection(&db_url(&dir, "acquisition.db")).unwrap();
        let db = svc.database().unwrap();

        let fixture = bemserver_topic(&db);
        let broker = db.create_broker(&NewBroker::new("127.0.0.1", broker_server.port())).unwrap();
        let subscriber = db.create_subscriber(&NewSubscriber::new(broker.id)).unwrap();
        assert!(subscriber.is_enabled);
        assert!(!subscriber.is_connected);
        let association = db.add_topic_subscriber(fixture.topic.id, subscriber.id).unwrap();
        assert!(!association.is_subscribed);
        assert_eq!(db.count_timeseries_data(fixture.timeseries_id).unwrap(), 0);

        assert!(!svc.is_running());
        assert!(svc.running_subscribers().is_empty());
        svc.run().await.unwrap();
        assert!(svc.is_running());
        assert_eq!(svc.running_subscribers(), vec![subscriber.id]);
        assert!(svc.start_failures().is_empty());
        assert!(db.get_subscriber(subscriber.id).unwrap().is_connected);
        assert!(db.get_topic_by_subscriber(fixture.topic.id, subscriber.id).unwrap().is_subscribed);

        // Running already: no-op, and the database cannot be swapped.
        svc.run().await.unwrap();
        assert_eq!(svc.running_subscribers(), vec![subscriber.id]);
        assert!(matches!(
            svc.set_db_connection(&db_url(&dir, "other.db")),
            Err(ServiceError::DatabaseAlreadyConfigured { .. })
        ));

        let ts_id = fixture.timeseries_id;
        assert!(wait_until(|| db.count_timeseries_data(ts_id).unwrap() >= 1).await);

        svc.stop().await;
        assert!(!svc.is_running());
        assert!(svc.running_subscribers().is_empty());
        assert!(!db.get_subscriber(subscriber.id).unwrap().is_connected);
        assert!(
            !db.get_topic_by_subscriber(fixture.topic.id, subscriber.id)
                .unwrap()
                .is_subscribed
        );

        svc.stop().await;
        assert!(!svc.is_running());
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_block_others() {
        let broker_server = FakeBroker::start().await;
        let dir = tempfile::tempdir().unwrap();
        let mut svc = Service::new(dir.path(), DecoderRegistry::with_builtin());
        svc.set_db_connection(&db_url(&dir, "acquisition.db")).unwrap();
        let db = svc.database().unwrap();
        let fixture = bemserver_topic(&db);

        let good_broker = db
            .create_broker(&NewBroker::new("127.0.0.1", broker_server.port()))
            .unwrap();
        let bad_broker = db.create_broker(&NewBroker::new("127.0.0.1", unused_port())).unwrap();
        let good = db.create_subscriber(&NewSubscriber::new(good_broker.id)).unwrap();
        let bad = db.create_subscriber(&NewSubscriber::new(bad_broker.id)).unwrap();
        let mut disabled = NewSubscriber::new(good_broker.id);
        disabled.is_enabled = false;
        let disabled = db.create_subscriber(&disabled).unwrap();
        for subscriber in [&good, &bad, &disabled] {
            db.add_topic_subscriber(fixture.topic.id, subscriber.id).unwrap();
        }

        svc.run().await.unwrap();
        assert!(svc.is_running());
        assert_eq!(svc.running_subscribers(), vec![good.id]);
        assert_eq!(svc.start_failures().keys().copied().collect::<Vec<_>>(), vec![bad.id]);
        assert!(db.get_subscriber(good.id).unwrap().is_connected);
        assert!(!db.get_subscriber(bad.id).unwrap().is_connected);
        assert!(!db.get_subscriber(disabled.id).unwrap().is_connected);
        assert!(svc.status_summary().contains("1 failed"));

        // Disabling after run does not stop the running subscriber.
        db.set_subscriber_enabled(good.id, false).unwrap();
        assert_eq!(svc.running_subscribers(), vec![good.id]);

        svc.stop().await;
        assert!(!db.get_subscriber(good.id).unwrap().is_connected);
        assert!(!db.get_topic_by_subscriber(fixture.topic.id, good.id).unwrap().is_subscribed);
    }
}
