//! Fixtures shared by the unit tests: throwaway databases, routing records,
//! certificates and a minimal MQTT 3.1.1 broker.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509NameBuilder, X509};
use rumqttc::tokio_rustls::rustls::ServerConfig;
use rumqttc::tokio_rustls::TlsAcceptor;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};

use crate::db::DatabaseService;
use crate::decoders::{BemServerDecoder, PayloadDecoder};
use crate::models::{NewTopic, Topic};
use crate::mqtt_service::topic_matches;

pub const TOPIC_NAME: &str = "bemserver/test/1";

pub fn temp_db() -> (TempDir, Arc<DatabaseService>) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("acquisition.db").display());
    let db = DatabaseService::new(&url).unwrap();
    db.initialize_db().unwrap();
    (dir, Arc::new(db))
}

pub struct TopicFixture {
    pub topic: Topic,
    pub timeseries_id: i64,
}

/// `bemserver/test/1` decoded by the generic JSON decoder, its `value`
/// field linked to a fresh timeseries.
pub fn bemserver_topic(db: &DatabaseService) -> TopicFixture {
    let decoder = db
        .register_payload_decoder(
            BemServerDecoder.name(),
            BemServerDecoder.description(),
            BemServerDecoder.fields(),
        )
        .unwrap();
    let topic = db.create_topic(&NewTopic::new(TOPIC_NAME, decoder.id)).unwrap();
    let timeseries = db
        .create_timeseries("Timeseries bemserver test value", None)
        .unwrap();
    let field = decoder.field("value").unwrap();
    db.add_topic_link(topic.id, field.id, timeseries.id).unwrap();
    TopicFixture {
        topic,
        timeseries_id: timeseries.id,
    }
}

/// A local port nothing listens on.
pub fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Polls `cond` for up to five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// Self-signed certificate and its PKCS#8 key, both PEM, valid between the
/// given day offsets from now for `localhost` and `127.0.0.1`.
pub fn self_signed_pair(not_before_days: i64, not_after_days: i64) -> (String, String) {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "localhost").unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::from_unix(now + not_before_days * 86_400).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::from_unix(now + not_after_days * 86_400).unwrap())
        .unwrap();
    let san = SubjectAlternativeName::new()
        .dns("localhost")
        .ip("127.0.0.1")
        .build(&builder.x509v3_context(None, None))
        .unwrap();
    builder.append_extension(san).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();

    let cert = String::from_utf8(builder.build().to_pem().unwrap()).unwrap();
    let key = String::from_utf8(key.private_key_to_pem_pkcs8().unwrap()).unwrap();
    (cert, key)
}

pub fn self_signed_pem(not_before_days: i64, not_after_days: i64) -> String {
    self_signed_pair(not_before_days, not_after_days).0
}

#[derive(Default)]
struct BrokerState {
    retained: HashMap<String, Vec<u8>>,
    denied: HashSet<String>,
    unsubscribed: Vec<String>,
}

/// Just enough of an MQTT broker for lifecycle tests: accepts any CONNECT,
/// acknowledges (or refuses) subscriptions, replays retained messages on
/// exact topic matches and forwards live publishes to matching sessions.
pub struct FakeBroker {
    port: u16,
    state: Arc<Mutex<BrokerState>>,
    publish_tx: broadcast::Sender<(String, Vec<u8>)>,
    shutdown_tx: watch::Sender<bool>,
}

impl FakeBroker {
    pub async fn start() -> Self {
        Self::listen(None).await
    }

    /// Same broker behind TLS, presenting `cert_pem`.
    pub async fn start_tls(cert_pem: &str, key_pem: &str) -> Self {
        let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .unwrap()
            .unwrap();
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .unwrap();
        Self::listen(Some(TlsAcceptor::from(Arc::new(config)))).await
    }

    async fn listen(acceptor: Option<TlsAcceptor>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(BrokerState::default()));
        let (publish_tx, _) = broadcast::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let accept_state = state.clone();
        let accept_publish = publish_tx.clone();
        tokio::spawn(async move {
            let mut shutdown = shutdown_rx.clone();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        let state = accept_state.clone();
                        let publishes = accept_publish.subscribe();
                        let shutdown = shutdown_rx.clone();
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            match acceptor {
                                Some(acceptor) => {
                                    // A client that rejects the certificate
                                    // ends here.
                                    let Ok(stream) = acceptor.accept(stream).await else {
                                        return;
                                    };
                                    serve(stream, state, publishes, shutdown).await
                                }
                                None => serve(stream, state, publishes, shutdown).await,
                            }
                        });
                    }
                }
            }
        });

        Self {
            port,
            state,
            publish_tx,
            shutdown_tx,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn retain(&self, topic: &str, payload: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .retained
            .insert(topic.to_string(), payload.to_vec());
    }

    /// Sends a message to every open session subscribed to `topic`.
    pub fn publish(&self, topic: &str, payload: &[u8]) {
        let _ = self.publish_tx.send((topic.to_string(), payload.to_vec()));
    }

    pub fn deny(&self, filter: &str) {
        self.state.lock().unwrap().denied.insert(filter.to_string());
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        self.state.lock().unwrap().unsubscribed.clone()
    }

    /// Stops accepting and drops every open session.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve<S>(
    stream: S,
    state: Arc<Mutex<BrokerState>>,
    mut publishes: broadcast::Receiver<(String, Vec<u8>)>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (packet_tx, mut packets) = mpsc::channel(16);
    let read_task = tokio::spawn(async move {
        while let Ok(Some(packet)) = read_packet(&mut reader).await {
            if packet_tx.send(packet).await.is_err() {
                break;
            }
        }
    });

    let mut filters = HashSet::new();
    loop {
        let reply = tokio::select! {
            _ = shutdown.changed() => break,
            packet = packets.recv() => {
                let Some((header, body)) = packet else { break };
                // DISCONNECT
                if header >> 4 == 14 {
                    break;
                }
                respond(header, &body, &state, &mut filters)
            }
            published = publishes.recv() => match published {
                Ok((topic, payload)) if filters.iter().any(|f| topic_matches(f, &topic)) => {
                    encode_publish(&topic, &payload, false)
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
        };
        if reply.is_empty() {
            continue;
        }
        if writer.write_all(&reply).await.is_err() || writer.flush().await.is_err() {
            break;
        }
    }
    read_task.abort();
}

fn respond(
    header: u8,
    body: &[u8],
    state: &Mutex<BrokerState>,
    filters: &mut HashSet<String>,
) -> Vec<u8> {
    match header >> 4 {
        // CONNECT -> CONNACK accepted
        1 => vec![0x20, 0x02, 0x00, 0x00],
        // SUBSCRIBE -> SUBACK, then retained messages
        8 => {
            let requested = read_filters(&body[2..], true);
            let state = state.lock().unwrap();
            let codes: Vec<u8> = requested
                .iter()
                .map(|(filter, qos)| if state.denied.contains(filter) { 0x80 } else { *qos })
                .collect();
            let mut reply = vec![0x90];
            reply.extend(encode_length(2 + codes.len()));
            reply.extend_from_slice(&body[..2]);
            reply.extend(&codes);
            for (filter, _) in requested.iter().filter(|(f, _)| !state.denied.contains(f)) {
                filters.insert(filter.clone());
                if let Some(payload) = state.retained.get(filter) {
                    reply.extend(encode_publish(filter, payload, true));
                }
            }
            reply
        }
        // UNSUBSCRIBE -> UNSUBACK
        10 => {
            let requested = read_filters(&body[2..], false);
            for (filter, _) in &requested {
                filters.remove(filter);
            }
            state
                .lock()
                .unwrap()
                .unsubscribed
                .extend(requested.into_iter().map(|(f, _)| f));
            vec![0xB0, 0x02, body[0], body[1]]
        }
        // PINGREQ -> PINGRESP
        12 => vec![0xD0, 0x00],
        _ => Vec::new(),
    }
}

fn read_filters(mut rest: &[u8], with_qos: bool) -> Vec<(String, u8)> {
    let mut filters = Vec::new();
    while rest.len() >= 2 {
        let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        let filter = String::from_utf8_lossy(&rest[2..2 + len]).into_owned();
        rest = &rest[2 + len..];
        let qos = if with_qos {
            let qos = rest[0];
            rest = &rest[1..];
            qos
        } else {
            0
        };
        filters.push((filter, qos));
    }
    filters
}

/// QoS 0 PUBLISH.
fn encode_publish(topic: &str, payload: &[u8], retain: bool) -> Vec<u8> {
    let mut packet = vec![if retain { 0x31 } else { 0x30 }];
    packet.extend(encode_length(2 + topic.len() + payload.len()));
    packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    packet.extend_from_slice(topic.as_bytes());
    packet.extend_from_slice(payload);
    packet
}

fn encode_length(mut len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            return out;
        }
    }
}

async fn read_packet<R>(stream: &mut R) -> io::Result<Option<(u8, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 1];
    if stream.read(&mut header).await? == 0 {
        return Ok(None);
    }
    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await?;
        len |= ((byte[0] & 0x7F) as usize) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Some((header[0], body)))
}
