use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rumqttc::mqttbytes::Error as PacketError;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS,
    StateError, SubscribeReasonCode, Transport as MqttTransport,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{DatabaseService, DbError};
use crate::decoders::{DecoderRegistry, PayloadDecoder, UnknownDecoder};
use crate::models::{Broker, FieldLink, Subscriber, Transport};
use crate::tls;

pub const MQTT_CLIENT_ID: &str = "bemserver-acq-mqtt";

const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);
const REQUEST_CHANNEL_SLACK: usize = 16;
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Oversized packets dropped back to back before the session is given up.
const MAX_OVERSIZED_IN_ROW: u32 = 3;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    UnknownDecoder(#[from] UnknownDecoder),
    #[error("TLS certificate required for broker {0} but none is configured")]
    MissingCertificate(i64),
    #[error("Invalid TLS certificate: {0}")]
    InvalidCertificate(String),
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Packet too large: {0}")]
    PacketTooLarge(String),
    #[error("Subscribe failed: {0}")]
    Subscribe(String),
    #[error("Database error: {0}")]
    Db(#[from] DbError),
}

impl ClientError {
    /// True for setup problems that retrying cannot fix.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ClientError::UnknownDecoder(_)
                | ClientError::MissingCertificate(_)
                | ClientError::InvalidCertificate(_)
                | ClientError::Tls(_)
                | ClientError::Io(_)
        )
    }

    fn from_connection(err: ConnectionError) -> Self {
        if is_oversized(&err) {
            ClientError::PacketTooLarge(err.to_string())
        } else {
            ClientError::Connection(err.to_string())
        }
    }
}

/// An incoming packet above the subscriber's size limit. The event loop
/// drops the connection and reconnects on the next poll.
fn is_oversized(err: &ConnectionError) -> bool {
    matches!(
        err,
        ConnectionError::MqttState(StateError::Deserialization(
            PacketError::PayloadSizeLimitExceeded(_)
        ))
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Subscribing,
    Active,
    Disconnecting,
    Error(String),
}

/// Message counters of one subscriber client.
#[derive(Debug, Default)]
pub struct ClientStats {
    received: AtomicU64,
    decoded: AtomicU64,
    dropped: AtomicU64,
    points_written: AtomicU64,
    duplicates: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub decoded: u64,
    pub dropped: u64,
    pub points_written: u64,
    pub duplicates: u64,
}

impl ClientStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            decoded: self.decoded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            points_written: self.points_written.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received={} decoded={} dropped={} written={} duplicates={}",
            self.received, self.decoded, self.dropped, self.points_written, self.duplicates
        )
    }
}

/// Matches an MQTT topic name against a subscription filter.
pub fn topic_matches(filter: &str, name: &str) -> bool {
    if filter == name {
        return true;
    }
    // Wildcards never match the broker's `$` topics at the first level.
    if name.starts_with('$') && !filter.starts_with('$') {
        return false;
    }
    let mut filter_levels = filter.split('/');
    let mut name_levels = name.split('/');
    loop {
        match (filter_levels.next(), name_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(n)) if f == n => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// A topic resolved for dispatch: filter, decoder and destination links.
#[derive(Clone)]
pub struct TopicRoute {
    pub topic_id: i64,
    pub filter: String,
    pub qos: QoS,
    pub decoder: Arc<dyn PayloadDecoder>,
    pub links: Vec<FieldLink>,
}

impl fmt::Debug for TopicRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicRoute")
            .field("topic_id", &self.topic_id)
            .field("filter", &self.filter)
            .field("qos", &self.qos)
            .field("decoder", &self.decoder.name())
            .field("links", &self.links)
            .finish()
    }
}

/// What happened to one incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Unrouted,
    DecodeFailed,
    Stored { written: usize, duplicates: usize, missing: usize },
}

/// Decode-then-persist stage of one subscriber. Driven by the worker that
/// owns the subscriber's session, one message at a time.
pub struct Dispatcher {
    subscriber_id: i64,
    routes: Vec<TopicRoute>,
    db: Arc<DatabaseService>,
    stats: Arc<ClientStats>,
}

impl Dispatcher {
    pub fn new(
        subscriber_id: i64,
        routes: Vec<TopicRoute>,
        db: Arc<DatabaseService>,
        stats: Arc<ClientStats>,
    ) -> Self {
        Self {
            subscriber_id,
            routes,
            db,
            stats,
        }
    }

    pub fn routes(&self) -> &[TopicRoute] {
        &self.routes
    }

    /// Exact filter first, then the first wildcard filter that matches.
    fn route_for(&self, topic_name: &str) -> Option<&TopicRoute> {
        self.routes
            .iter()
            .find(|route| route.filter == topic_name)
            .or_else(|| {
                self.routes
                    .iter()
                    .find(|route| topic_matches(&route.filter, topic_name))
            })
    }

    /// Blocking: decodes and writes through the database pool.
    pub fn on_message(&self, topic_name: &str, payload: &[u8]) -> MessageOutcome {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let Some(route) = self.route_for(topic_name) else {
            warn!(
                "[Subscriber {}] no topic matches '{}', message dropped",
                self.subscriber_id, topic_name
            );
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return MessageOutcome::Unrouted;
        };

        debug!(
            "[Subscriber {}] decoding {} bytes from '{}' with {}",
            self.subscriber_id,
            payload.len(),
            topic_name,
            route.decoder.name()
        );
        let (timestamp, values) = match route.decoder.decode(payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(
                    "[Subscriber {}] payload from '{}' not decoded by {}: {}",
                    self.subscriber_id,
                    topic_name,
                    route.decoder.name(),
                    e
                );
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return MessageOutcome::DecodeFailed;
            }
        };
        self.stats.decoded.fetch_add(1, Ordering::Relaxed);

        let (mut written, mut duplicates, mut missing) = (0, 0, 0);
        for link in &route.links {
            let Some(value) = values.get(&link.field_name) else {
                debug!(
                    "[Subscriber {}] no {} value to save for topic '{}'",
                    self.subscriber_id, link.field_name, topic_name
                );
                missing += 1;
                continue;
            };
            match self
                .db
                .insert_timeseries_data(link.timeseries_id, timestamp, *value)
            {
                Ok(()) => written += 1,
                Err(e) if e.is_constraint_violation() => {
                    // Retained or replayed message already stored.
                    debug!(
                        "[Subscriber {}] timeseries {} already has a value at {}",
                        self.subscriber_id, link.timeseries_id, timestamp
                    );
                    duplicates += 1;
                }
                Err(e) => {
                    error!(
                        "[Subscriber {}] failed to save {} into timeseries {}: {}",
                        self.subscriber_id, link.field_name, link.timeseries_id, e
                    );
                }
            }
        }
        self.stats
            .points_written
            .fetch_add(written as u64, Ordering::Relaxed);
        self.stats
            .duplicates
            .fetch_add(duplicates as u64, Ordering::Relaxed);

        MessageOutcome::Stored {
            written,
            duplicates,
            missing,
        }
    }

    /// Counts a message the transport refused to read.
    fn drop_oversized(&self, reason: &str) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(
            "[Subscriber {}] message dropped: {}",
            self.subscriber_id, reason
        );
    }

    /// Clears the subscriber's connection and subscription flags.
    fn reset_flags(&self) {
        if let Err(e) = self.db.reset_subscriber_flags(self.subscriber_id) {
            error!(
                "[Subscriber {}] failed to reset connection flags: {}",
                self.subscriber_id, e
            );
        }
    }
}

/// Hands one message to the blocking pool and waits for its outcome.
async fn dispatch(dispatcher: &Arc<Dispatcher>, publish: Publish) -> Option<MessageOutcome> {
    let worker = dispatcher.clone();
    let handled =
        tokio::task::spawn_blocking(move || worker.on_message(&publish.topic, &publish.payload))
            .await;
    match handled {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            error!(
                "[Subscriber {}] message handling failed: {}",
                dispatcher.subscriber_id, e
            );
            None
        }
    }
}

struct Session {
    client: AsyncClient,
    worker: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    /// (topic id, filter) of every subscription acknowledged by the broker.
    subscribed: Vec<(i64, String)>,
}

/// Connection manager of one subscriber: owns its transport session and the
/// worker polling it.
pub struct SubscriberClient {
    subscriber: Subscriber,
    broker: Broker,
    db: Arc<DatabaseService>,
    registry: DecoderRegistry,
    working_dir: PathBuf,
    client_state: Arc<Mutex<ClientState>>,
    stats: Arc<ClientStats>,
    session: Option<Session>,
}

impl SubscriberClient {
    pub fn new(
        subscriber: Subscriber,
        broker: Broker,
        db: Arc<DatabaseService>,
        registry: DecoderRegistry,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            subscriber,
            broker,
            db,
            registry,
            working_dir: working_dir.into(),
            client_state: Arc::new(Mutex::new(ClientState::Disconnected)),
            stats: Arc::new(ClientStats::default()),
            session: None,
        }
    }

    pub fn subscriber_id(&self) -> i64 {
        self.subscriber.id
    }

    pub fn state(&self) -> ClientState {
        self.client_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_active(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.worker.is_finished())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn set_state(&self, state: ClientState) {
        set_state(&self.client_state, state);
    }

    /// Resolves every enabled topic of the subscriber to its decoder.
    pub fn resolve_routes(&self) -> Result<Vec<TopicRoute>, ClientError> {
        self.db
            .subscribed_topics(self.subscriber.id)?
            .into_iter()
            .map(|subscribed| {
                let decoder = self.registry.lookup(&subscribed.decoder_name)?;
                Ok(TopicRoute {
                    topic_id: subscribed.topic.id,
                    filter: subscribed.topic.name,
                    qos: qos_from_u8(subscribed.topic.qos),
                    decoder,
                    links: subscribed.links,
                })
            })
            .collect()
    }

    fn mqtt_options(&self) -> Result<MqttOptions, ClientError> {
        let client_id = self
            .subscriber
            .client_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", MQTT_CLIENT_ID, Uuid::new_v4()));
        let broker = &self.broker;

        let mut mqtt_options = match broker.transport {
            Transport::Tcp => MqttOptions::new(client_id, &broker.host, broker.port),
            Transport::Websockets => {
                let scheme = if broker.use_tls { "wss" } else { "ws" };
                let url = format!(
                    "{}://{}:{}{}",
                    scheme, broker.host, broker.port, broker.websocket_path
                );
                MqttOptions::new(client_id, url, broker.port)
            }
        };
        let keep_alive = Duration::from_secs(self.subscriber.keep_alive_secs);
        mqtt_options.set_keep_alive(keep_alive.max(MIN_KEEP_ALIVE));
        mqtt_options.set_clean_session(!self.subscriber.use_persistent_session);
        let max_packet_size = self.subscriber.max_packet_size;
        mqtt_options.set_max_packet_size(max_packet_size, max_packet_size);

        if let (Some(username), Some(password)) = (&broker.username, &broker.password) {
            mqtt_options.set_credentials(username, password);
        }

        let transport = match (broker.transport, broker.use_tls) {
            (Transport::Tcp, false) => MqttTransport::Tcp,
            (Transport::Websockets, false) => MqttTransport::Ws,
            (Transport::Tcp, true) => {
                MqttTransport::tls_with_config(tls::tls_configuration(broker, &self.working_dir)?)
            }
            (Transport::Websockets, true) => {
                MqttTransport::wss_with_config(tls::tls_configuration(broker, &self.working_dir)?)
            }
        };
        mqtt_options.set_transport(transport);
        Ok(mqtt_options)
    }

    /// Connects, subscribes to every enabled topic and hands the session to
    /// a background worker. Starting an already started client is a no-op.
    pub async fn start(&mut self) -> Result<(), ClientError> {
        if self.session.is_some() {
            debug!("[Subscriber {}] already started", self.subscriber.id);
            return Ok(());
        }
        info!(
            "[Subscriber {}] connecting to {}:{} ({})...",
            self.subscriber.id, self.broker.host, self.broker.port, self.broker.transport
        );
        self.set_state(ClientState::Connecting);

        let prepared = self
            .resolve_routes()
            .and_then(|routes| Ok((routes, self.mqtt_options()?)));
        let (routes, mqtt_options) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                error!("[Subscriber {}] configuration error: {}", self.subscriber.id, e);
                self.set_state(ClientState::Error(e.to_string()));
                return Err(e);
            }
        };

        let (client, mut eventloop) =
            AsyncClient::new(mqtt_options, routes.len() + REQUEST_CHANNEL_SLACK);
        let dispatcher = Arc::new(Dispatcher::new(
            self.subscriber.id,
            routes,
            self.db.clone(),
            self.stats.clone(),
        ));

        let subscribed = match self.handshake(&client, &mut eventloop, &dispatcher).await {
            Ok(subscribed) => subscribed,
            Err(e) => {
                error!("[Subscriber {}] start failed: {}", self.subscriber.id, e);
                dispatcher.reset_flags();
                self.set_state(ClientState::Error(e.to_string()));
                return Err(e);
            }
        };

        let filters = subscribed
            .iter()
            .filter_map(|(topic_id, _)| {
                dispatcher
                    .routes()
                    .iter()
                    .find(|route| route.topic_id == *topic_id)
            })
            .map(|route| (route.filter.clone(), route.qos))
            .collect();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            filters,
            dispatcher,
            shutdown_rx,
            self.client_state.clone(),
        ));
        self.session = Some(Session {
            client,
            worker,
            shutdown_tx,
            subscribed,
        });
        self.set_state(ClientState::Active);
        info!("[Subscriber {}] started", self.subscriber.id);
        Ok(())
    }

    /// Waits for the broker's CONNACK, then subscribes to every route.
    ///
    /// An oversized message during the subscription phase costs the
    /// connection. The event loop reconnects and every route is subscribed
    /// again, at most [`MAX_OVERSIZED_IN_ROW`] times.
    async fn handshake(
        &self,
        client: &AsyncClient,
        eventloop: &mut EventLoop,
        dispatcher: &Arc<Dispatcher>,
    ) -> Result<Vec<(i64, String)>, ClientError> {
        self.wait_for_connack(eventloop).await?;
        self.db.set_subscriber_connected(self.subscriber.id, true)?;
        self.set_state(ClientState::Connected);
        info!("[Subscriber {}] connected", self.subscriber.id);

        if dispatcher.routes().is_empty() {
            warn!("[Subscriber {}] no enabled topic to subscribe to", self.subscriber.id);
            return Ok(Vec::new());
        }

        self.set_state(ClientState::Subscribing);
        let mut oversized = 0;
        loop {
            match self.subscribe_routes(client, eventloop, dispatcher).await {
                Err(ClientError::PacketTooLarge(reason)) if oversized < MAX_OVERSIZED_IN_ROW => {
                    oversized += 1;
                    dispatcher.drop_oversized(&reason);
                    self.wait_for_connack(eventloop).await?;
                }
                subscribed => return subscribed,
            }
        }
    }

    async fn wait_for_connack(&self, eventloop: &mut EventLoop) -> Result<(), ClientError> {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                Ok(event) => debug!(
                    "[Subscriber {}] event before CONNACK: {:?}",
                    self.subscriber.id, event
                ),
                Err(e) => return Err(ClientError::from_connection(e)),
            }
        }
    }

    /// Subscribes to every route and waits for the matching SUBACKs.
    /// Messages arriving meanwhile (retained ones typically) are dispatched.
    async fn subscribe_routes(
        &self,
        client: &AsyncClient,
        eventloop: &mut EventLoop,
        dispatcher: &Arc<Dispatcher>,
    ) -> Result<Vec<(i64, String)>, ClientError> {
        let routes = dispatcher.routes();
        for route in routes {
            client
                .subscribe(route.filter.clone(), route.qos)
                .await
                .map_err(|e| ClientError::Subscribe(e.to_string()))?;
        }

        // Subscribe requests leave in order; SUBACKs come back by packet id.
        let mut pending: VecDeque<usize> = (0..routes.len()).collect();
        let mut by_pkid: HashMap<u16, usize> = HashMap::new();
        let mut acked = 0;
        let mut subscribed = Vec::new();
        while acked < routes.len() {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                    if let Some(index) = pending.pop_front() {
                        by_pkid.insert(pkid, index);
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let Some(index) = by_pkid.remove(&ack.pkid) else {
                        warn!(
                            "[Subscriber {}] unexpected SUBACK {}",
                            self.subscriber.id, ack.pkid
                        );
                        continue;
                    };
                    acked += 1;
                    let route = &routes[index];
                    let granted = ack
                        .return_codes
                        .first()
                        .is_some_and(|code| matches!(code, SubscribeReasonCode::Success(_)));
                    if granted {
                        self.db
                            .set_topic_subscribed(route.topic_id, self.subscriber.id, true)?;
                        info!(
                            "[Subscriber {}] subscribed to '{}'",
                            self.subscriber.id, route.filter
                        );
                        subscribed.push((route.topic_id, route.filter.clone()));
                    } else {
                        warn!(
                            "[Subscriber {}] broker refused subscription to '{}'",
                            self.subscriber.id, route.filter
                        );
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    dispatch(dispatcher, publish).await;
                }
                Ok(_) => {}
                Err(e) => return Err(ClientError::from_connection(e)),
            }
        }
        Ok(subscribed)
    }

    /// Unsubscribes, disconnects and joins the worker. No message is
    /// dispatched once this returns. Stopping a stopped client is a no-op.
    pub async fn stop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let id = self.subscriber.id;
        info!("[Subscriber {}] stopping...", id);
        self.set_state(ClientState::Disconnecting);

        for (topic_id, filter) in &session.subscribed {
            if let Err(e) = session.client.try_unsubscribe(filter.clone()) {
                debug!("[Subscriber {}] unsubscribe from '{}' not sent: {}", id, filter, e);
            }
            if let Err(e) = self.db.set_topic_subscribed(*topic_id, id, false) {
                error!("[Subscriber {}] failed to clear subscription flag: {}", id, e);
            }
        }
        if let Err(e) = session.client.try_disconnect() {
            debug!("[Subscriber {}] disconnect not sent: {}", id, e);
        }

        if timeout(STOP_TIMEOUT, &mut session.worker).await.is_err() {
            warn!(
                "[Subscriber {}] worker did not exit after disconnect, cancelling it",
                id
            );
            let _ = session.shutdown_tx.send(true);
            if let Err(e) = session.worker.await {
                error!("[Subscriber {}] worker failed: {}", id, e);
            }
        }

        if let Err(e) = self.db.reset_subscriber_flags(id) {
            error!("[Subscriber {}] failed to reset connection flags: {}", id, e);
        }
        self.set_state(ClientState::Disconnected);
        info!("[Subscriber {}] stopped ({})", id, self.stats());
    }
}

fn set_state(client_state: &Mutex<ClientState>, state: ClientState) {
    *client_state.lock().unwrap_or_else(PoisonError::into_inner) = state;
}

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Worker body: polls the session until disconnect, shutdown or failure.
///
/// After an oversized message the event loop reconnects by itself; the
/// acknowledged `filters` are then subscribed again.
async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    filters: Vec<(String, QoS)>,
    dispatcher: Arc<Dispatcher>,
    mut shutdown_rx: watch::Receiver<bool>,
    client_state: Arc<Mutex<ClientState>>,
) {
    let subscriber_id = dispatcher.subscriber_id;
    let mut oversized = 0;
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    oversized = 0;
                    dispatch(&dispatcher, publish).await;
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("[Subscriber {}] reconnected", subscriber_id);
                    for (filter, qos) in &filters {
                        if let Err(e) = client.try_subscribe(filter.clone(), *qos) {
                            warn!(
                                "[Subscriber {}] resubscribe to '{}' not sent: {}",
                                subscriber_id, filter, e
                            );
                        }
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("[Subscriber {}] disconnect sent", subscriber_id);
                    break;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("[Subscriber {}] broker closed the session", subscriber_id);
                    dispatcher.reset_flags();
                    set_state(&client_state, ClientState::Disconnected);
                    break;
                }
                Ok(_) => {}
                Err(e) if is_oversized(&e) && oversized < MAX_OVERSIZED_IN_ROW => {
                    oversized += 1;
                    dispatcher.drop_oversized(&e.to_string());
                }
                Err(ConnectionError::RequestsDone) => break,
                Err(e) => {
                    // Reconnection is left to the process supervisor.
                    error!("[Subscriber {}] connection lost: {}", subscriber_id, e);
                    dispatcher.reset_flags();
                    set_state(&client_state, ClientState::Error(e.to_string()));
                    break;
                }
            }
        }
    }
}
