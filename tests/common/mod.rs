//! A small in-process CA server for exercising the client against.
//!
//! It answers searches for the names it holds, serves reads, writes and
//! subscriptions from an in-memory table, and records what it was sent.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, SystemTime},
};

use ca_client::{
    client::{Context, ContextBuilder},
    config::ContextConfig,
    dbr::{Dbr, DbrCategory, DbrType, DbrValue, Status},
    messages::{
        Access, AccessRights, AsBytes, CreateChannelFailure, CreateChannelResponse, Echo,
        ErrorCondition, EventAddResponse, ReadNotifyResponse, ServerMessage,
        ServerMessageDecoder, Version, WriteNotifyResponse, parse_search_packet,
    },
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream, UdpSocket},
    select,
    sync::mpsc,
};
use tokio_stream::StreamExt;
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use tracing::{debug, level_filters::LevelFilter, warn};
use tracing_subscriber::fmt::TestWriter;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::DEBUG)
        .with_writer(TestWriter::new())
        .try_init();
}

/// What the server has been sent, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    ClientName(String),
    HostName(String),
    Create(String),
    Write(String, DbrValue),
    Subscribe(String),
    CancelSubscription(u32),
    Clear(String),
}

struct Subscriber {
    connection: u64,
    subscription_id: u32,
    pv: String,
    data_type: DbrType,
    writer: mpsc::UnboundedSender<Vec<u8>>,
}

#[derive(Default)]
struct ServerState {
    pvs: HashMap<String, DbrValue>,
    received: Vec<Received>,
    subscribers: Vec<Subscriber>,
    handshake_delay: Duration,
    /// Hang up on every circuit as soon as it is accepted
    refuse_circuits: bool,
    search_datagrams: usize,
    connections: CancellationToken,
    next_connection: u64,
}

/// Encode a value as the DBR a client asked for
fn encode(value: &DbrValue, data_type: DbrType) -> Result<(DbrType, u32, Vec<u8>), ErrorCondition> {
    let value = value.convert_to(data_type.basic_type)?;
    let count = value.get_count() as u32;
    let dbr = match data_type.category {
        DbrCategory::Basic => Dbr::Basic(value),
        DbrCategory::Status => Dbr::Status {
            status: Status::default(),
            value,
        },
        _ => Dbr::Time {
            status: Status::default(),
            timestamp: SystemTime::now(),
            value,
        },
    };
    Ok((dbr.data_type(), count, dbr.to_bytes()))
}

fn update_for(subscription_id: u32, value: &DbrValue, data_type: DbrType) -> Vec<u8> {
    match encode(value, data_type) {
        Ok((data_type, data_count, data)) => EventAddResponse {
            data_type,
            data_count,
            status_code: ErrorCondition::Normal.status_code(),
            subscription_id,
            data,
        },
        Err(condition) => EventAddResponse {
            data_type,
            data_count: 0,
            status_code: condition.status_code(),
            subscription_id,
            data: vec![0u8; 8],
        },
    }
    .as_bytes()
}

pub struct MockServer {
    search_address: SocketAddr,
    circuit_address: SocketAddr,
    state: Arc<Mutex<ServerState>>,
    cancel: CancellationToken,
    thread: Option<thread::JoinHandle<()>>,
}

impl MockServer {
    pub fn start(pvs: &[(&str, DbrValue)]) -> MockServer {
        let state = Arc::new(Mutex::new(ServerState {
            pvs: pvs
                .iter()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect(),
            ..Default::default()
        }));
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (listener, udp) = runtime.block_on(async {
            (
                TcpListener::bind("127.0.0.1:0").await.unwrap(),
                UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            )
        });
        let search_address = udp.local_addr().unwrap();
        let circuit_address = listener.local_addr().unwrap();
        let tcp_port = circuit_address.port();
        let cancel = CancellationToken::new();

        let task_state = state.clone();
        let task_cancel = cancel.clone();
        let thread = thread::Builder::new()
            .name("mock-ioc".to_owned())
            .spawn(move || {
                runtime.block_on(async move {
                    tokio::spawn(answer_searches(
                        udp,
                        tcp_port,
                        task_state.clone(),
                        task_cancel.clone(),
                    ));
                    accept_circuits(listener, task_state, task_cancel).await;
                })
            })
            .unwrap();
        MockServer {
            search_address,
            circuit_address,
            state,
            cancel,
            thread: Some(thread),
        }
    }

    pub fn search_address(&self) -> SocketAddr {
        self.search_address
    }

    /// Where clients open circuits to
    pub fn circuit_address(&self) -> SocketAddr {
        self.circuit_address
    }

    /// Configuration for a client that only talks to this server
    pub fn client_config(&self) -> ContextConfig {
        ContextConfig {
            search_addresses: vec![self.search_address],
            watch_beacons: false,
            min_search_period: Duration::from_millis(10),
            max_search_period: Duration::from_millis(200),
            reconnect_delay: Duration::from_millis(20),
            ..ContextConfig::from_environment()
        }
    }

    pub fn client(&self) -> Context {
        ContextBuilder::from_config(self.client_config())
            .start()
            .unwrap()
    }

    /// Hold back the version reply on new circuits
    pub fn set_handshake_delay(&self, delay: Duration) {
        self.state.lock().unwrap().handshake_delay = delay;
    }

    /// Change a value, sending it to every subscriber
    pub fn set_value(&self, name: &str, value: impl Into<DbrValue>) {
        let mut state = self.state.lock().unwrap();
        publish(&mut state, name, value.into());
    }

    /// Stop hosting a name. Existing circuits are left alone.
    pub fn remove(&self, name: &str) {
        self.state.lock().unwrap().pvs.remove(name);
    }

    /// Keep answering searches, but hang up on every new circuit
    pub fn refuse_circuits(&self, refuse: bool) {
        self.state.lock().unwrap().refuse_circuits = refuse;
    }

    /// Search datagrams received so far, answered or not
    pub fn search_count(&self) -> usize {
        self.state.lock().unwrap().search_datagrams
    }

    pub fn value(&self, name: &str) -> Option<DbrValue> {
        self.state.lock().unwrap().pvs.get(name).cloned()
    }

    pub fn received(&self) -> Vec<Received> {
        self.state.lock().unwrap().received.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().unwrap().subscribers.len()
    }

    /// Close every open circuit. Searches are still answered afterwards.
    pub fn drop_connections(&self) {
        let mut state = self.state.lock().unwrap();
        state.connections.cancel();
        state.connections = CancellationToken::new();
        state.subscribers.clear();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.state.lock().unwrap().connections.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn publish(state: &mut ServerState, name: &str, value: DbrValue) {
    for subscriber in state.subscribers.iter().filter(|s| s.pv == name) {
        let _ = subscriber.writer.send(update_for(
            subscriber.subscription_id,
            &value,
            subscriber.data_type,
        ));
    }
    state.pvs.insert(name.to_owned(), value);
}

async fn answer_searches(
    socket: UdpSocket,
    tcp_port: u16,
    state: Arc<Mutex<ServerState>>,
    cancel: CancellationToken,
) {
    let mut buffer = vec![0u8; 0xFFFF];
    loop {
        let (size, sender) = select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buffer) => match result {
                Ok(received) => received,
                Err(e) => {
                    warn!("Mock search socket error: {e}");
                    continue;
                }
            },
        };
        state.lock().unwrap().search_datagrams += 1;
        let Ok((version, searches)) = parse_search_packet(&buffer[..size]) else {
            warn!("Mock server got a bad search datagram");
            continue;
        };
        let mut reply = Version::with_sequence(version.sequence_number).as_bytes();
        let mut answered = 0;
        {
            let state = state.lock().unwrap();
            for search in searches
                .iter()
                .filter(|s| state.pvs.contains_key(&s.channel_name))
            {
                reply.extend(search.respond(None, tcp_port, true).as_bytes());
                answered += 1;
            }
        }
        if answered > 0 {
            let _ = socket.send_to(&reply, sender).await;
        }
    }
}

async fn accept_circuits(
    listener: TcpListener,
    state: Arc<Mutex<ServerState>>,
    cancel: CancellationToken,
) {
    loop {
        let stream = select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => match result {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!("Mock server accept failed: {e}");
                    continue;
                }
            },
        };
        let (id, closed) = {
            let mut state = state.lock().unwrap();
            if state.refuse_circuits {
                debug!("Mock server hanging up on a new circuit");
                drop(stream);
                continue;
            }
            state.next_connection += 1;
            (state.next_connection, state.connections.child_token())
        };
        tokio::spawn(serve_circuit(id, stream, state.clone(), closed));
    }
}

async fn serve_circuit(
    id: u64,
    stream: TcpStream,
    state: Arc<Mutex<ServerState>>,
    closed: CancellationToken,
) {
    let (rx, mut tx) = stream.into_split();
    let (writer, mut outgoing) = mpsc::unbounded_channel::<Vec<u8>>();
    let write_closed = closed.clone();
    tokio::spawn(async move {
        loop {
            select! {
                _ = write_closed.cancelled() => break,
                data = outgoing.recv() => match data {
                    Some(data) => {
                        if tx.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = tx.shutdown().await;
    });

    // Server ids are indexes into this
    let mut channels: Vec<String> = Vec::new();
    let mut framed = FramedRead::new(rx, ServerMessageDecoder::default());
    loop {
        let message = select! {
            _ = closed.cancelled() => break,
            message = framed.next() => match message {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    warn!("Mock server could not decode: {e}");
                    break;
                }
                None => break,
            },
        };
        match message {
            ServerMessage::Version(_) => {
                let delay = state.lock().unwrap().handshake_delay;
                tokio::time::sleep(delay).await;
                let _ = writer.send(Version::default().as_bytes());
            }
            ServerMessage::ClientName(msg) => {
                state.lock().unwrap().received.push(Received::ClientName(msg.name));
            }
            ServerMessage::HostName(msg) => {
                state.lock().unwrap().received.push(Received::HostName(msg.name));
            }
            ServerMessage::CreateChannel(msg) => {
                let mut state = state.lock().unwrap();
                state
                    .received
                    .push(Received::Create(msg.channel_name.clone()));
                let Some(value) = state.pvs.get(&msg.channel_name) else {
                    let _ = writer.send(
                        CreateChannelFailure {
                            client_id: msg.client_id,
                        }
                        .as_bytes(),
                    );
                    continue;
                };
                let response = CreateChannelResponse {
                    native_type: value.get_type(),
                    native_count: value.get_count() as u32,
                    client_id: msg.client_id,
                    server_id: channels.len() as u32,
                };
                channels.push(msg.channel_name);
                let _ = writer.send(
                    AccessRights {
                        client_id: msg.client_id,
                        access_rights: Access::ReadWrite,
                    }
                    .as_bytes(),
                );
                let _ = writer.send(response.as_bytes());
            }
            ServerMessage::ReadNotify(msg) => {
                let state = state.lock().unwrap();
                let value = channels
                    .get(msg.server_id as usize)
                    .and_then(|name| state.pvs.get(name));
                let reply = match value.map(|v| encode(v, msg.data_type)) {
                    Some(Ok((data_type, data_count, data))) => ReadNotifyResponse {
                        data_type,
                        data_count,
                        status_code: ErrorCondition::Normal.status_code(),
                        client_ioid: msg.client_ioid,
                        data,
                    },
                    Some(Err(condition)) => ReadNotifyResponse {
                        data_type: msg.data_type,
                        data_count: 0,
                        status_code: condition.status_code(),
                        client_ioid: msg.client_ioid,
                        data: vec![0u8; 8],
                    },
                    None => ReadNotifyResponse {
                        data_type: msg.data_type,
                        data_count: 0,
                        status_code: ErrorCondition::BadChId.status_code(),
                        client_ioid: msg.client_ioid,
                        data: vec![0u8; 8],
                    },
                };
                let _ = writer.send(reply.as_bytes());
            }
            ServerMessage::Write(msg) => {
                let Some(name) = channels.get(msg.server_id as usize) else {
                    continue;
                };
                store(&state, name, msg.data_type, msg.data_count, &msg.data);
            }
            ServerMessage::WriteNotify(msg) => {
                let stored = channels
                    .get(msg.server_id as usize)
                    .map(|name| store(&state, name, msg.data_type, msg.data_count, &msg.data));
                let condition = match stored {
                    Some(true) => ErrorCondition::Normal,
                    Some(false) => ErrorCondition::BadType,
                    None => ErrorCondition::BadChId,
                };
                let _ = writer.send(
                    WriteNotifyResponse {
                        data_type: msg.data_type,
                        data_count: msg.data_count,
                        status_code: condition.status_code(),
                        client_ioid: msg.client_ioid,
                    }
                    .as_bytes(),
                );
            }
            ServerMessage::EventAdd(msg) => {
                let Some(name) = channels.get(msg.server_id as usize) else {
                    continue;
                };
                let mut state = state.lock().unwrap();
                state.received.push(Received::Subscribe(name.clone()));
                if let Some(value) = state.pvs.get(name) {
                    let _ = writer.send(update_for(msg.subscription_id, value, msg.data_type));
                }
                state.subscribers.push(Subscriber {
                    connection: id,
                    subscription_id: msg.subscription_id,
                    pv: name.clone(),
                    data_type: msg.data_type,
                    writer: writer.clone(),
                });
            }
            ServerMessage::EventCancel(msg) => {
                let mut state = state.lock().unwrap();
                state
                    .received
                    .push(Received::CancelSubscription(msg.subscription_id));
                state
                    .subscribers
                    .retain(|s| !(s.connection == id && s.subscription_id == msg.subscription_id));
                let _ = writer.send(msg.confirmation().as_bytes());
            }
            ServerMessage::ClearChannel(msg) => {
                if let Some(name) = channels.get(msg.server_id as usize) {
                    state.lock().unwrap().received.push(Received::Clear(name.clone()));
                }
                let _ = writer.send(msg.as_bytes());
            }
            ServerMessage::Echo => {
                let _ = writer.send(Echo.as_bytes());
            }
            ServerMessage::Search(_) => {}
        }
    }
    debug!("Mock circuit {id} closed");
    state
        .lock()
        .unwrap()
        .subscribers
        .retain(|s| s.connection != id);
}

/// Apply a write from a client. Returns false if it could not be decoded.
fn store(
    state: &Mutex<ServerState>,
    name: &str,
    data_type: DbrType,
    data_count: u32,
    data: &[u8],
) -> bool {
    let Ok(dbr) = Dbr::from_bytes(data_type, data_count as usize, data) else {
        return false;
    };
    let value = dbr.take_value();
    let mut state = state.lock().unwrap();
    state
        .received
        .push(Received::Write(name.to_owned(), value.clone()));
    publish(&mut state, name, value);
    true
}

/// Poll until a condition holds, failing the test after a few seconds
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            std::time::Instant::now() < deadline,
            "Timed out waiting for {what}"
        );
        thread::sleep(Duration::from_millis(5));
    }
}
