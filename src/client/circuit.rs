//! TCP virtual circuits to servers.
//!
//! A circuit owns the socket and its send buffer. Everything it receives is
//! handed, in order, to a [`CircuitHandler`] running on the dispatch thread.

use std::{
    future,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpStream, tcp::OwnedWriteHalf},
    select,
    time::timeout,
};
use tokio_stream::StreamExt;
use tokio_util::{codec::FramedRead, io::InspectReader, sync::CancellationToken};
use tracing::{debug, error, trace, warn};

use crate::{
    client::{
        ClientError,
        send_buffer::{PushMode, SendBuffer, Taken},
    },
    config::ContextConfig,
    messages::{AsBytes, CAMessage, ClientMessage, ClientMessageDecoder, ClientName, Echo, HostName, Version},
};

/// Receives everything that happens on a circuit
pub(crate) trait CircuitHandler: Send + Sync + 'static {
    /// Version exchange and identification are done. Called before any
    /// queued requests are sent.
    fn established(&self, circuit: u64);
    fn message(&self, circuit: u64, message: ClientMessage);
    /// The circuit is gone, and will not call the handler again
    fn closed(&self, circuit: u64, reason: ClientError);
}

/// Per-circuit timing and identification, fixed for the life of a context
#[derive(Debug, Clone)]
pub(crate) struct CircuitSettings {
    pub connect_timeout: Duration,
    pub heartbeat_period: Duration,
    pub send_progress_timeout: Duration,
    pub max_payload: usize,
    pub priority: u16,
    pub client_name: String,
    pub host_name: String,
}

impl From<&ContextConfig> for CircuitSettings {
    fn from(config: &ContextConfig) -> Self {
        CircuitSettings {
            connect_timeout: config.connect_timeout,
            heartbeat_period: config.heartbeat_period,
            send_progress_timeout: config.send_progress_timeout,
            max_payload: config.max_array_bytes,
            priority: config.priority,
            client_name: config.client_name.clone(),
            host_name: config.host_name.clone(),
        }
    }
}

pub(crate) struct Circuit {
    pub id: u64,
    pub address: SocketAddr,
    pub send: SendBuffer,
    cancel: CancellationToken,
}

impl Circuit {
    pub fn new(
        id: u64,
        address: SocketAddr,
        send_capacity: usize,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Circuit {
            id,
            address,
            send: SendBuffer::new(send_capacity),
            cancel,
        })
    }

    pub fn push<M: CAMessage>(&self, message: &M, mode: PushMode) -> Result<(), ClientError> {
        self.send.push(&message.as_bytes(), mode)
    }

    pub fn close(&self) {
        self.cancel.cancel();
        self.send.close();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Drive a circuit from connection until it closes, then tell the handler
pub(crate) async fn run_circuit<H: CircuitHandler>(
    circuit: Arc<Circuit>,
    settings: Arc<CircuitSettings>,
    handler: Arc<H>,
) {
    debug!("Connecting new circuit to {}", circuit.address);
    let reason = select! {
        _ = circuit.cancel.cancelled() => ClientError::Disconnected,
        result = lifecycle(&circuit, &settings, handler.as_ref()) => match result {
            Ok(()) => ClientError::Disconnected,
            Err(e) => {
                warn!("Circuit to {} failed: {e}", circuit.address);
                e
            }
        },
    };
    circuit.close();
    debug!(
        "Circuit to {} closed, send buffer peaked at {} bytes",
        circuit.address,
        circuit.send.high_water()
    );
    handler.closed(circuit.id, reason);
}

async fn lifecycle<H: CircuitHandler>(
    circuit: &Circuit,
    settings: &CircuitSettings,
    handler: &H,
) -> Result<(), ClientError> {
    let tcp = timeout(settings.connect_timeout, TcpStream::connect(circuit.address))
        .await
        .map_err(|_| ClientError::Timeout)??;
    tcp.set_nodelay(true)?;
    let (rx, mut tx) = tcp.into_split();

    // Any inbound byte counts as activity for the watchdog
    let last_activity = Arc::new(Mutex::new(Instant::now()));
    let stamp = last_activity.clone();
    let reader = InspectReader::new(rx, move |_: &[u8]| {
        *stamp.lock().unwrap() = Instant::now();
    });
    let mut framed = FramedRead::new(reader, ClientMessageDecoder::new(settings.max_payload));

    let version = Version {
        priority: settings.priority,
        ..Default::default()
    };
    timeout(settings.connect_timeout, tx.write_all(&version.as_bytes()))
        .await
        .map_err(|_| ClientError::Timeout)??;
    match timeout(settings.connect_timeout, framed.next())
        .await
        .map_err(|_| ClientError::Timeout)?
    {
        Some(Ok(ClientMessage::Version(server))) if server.is_compatible() => {
            debug!("Server at {} speaks CA 4.{}", circuit.address, server.protocol_version);
        }
        Some(Ok(ClientMessage::Version(server))) => {
            return Err(ClientError::ServerVersionMismatch(server.protocol_version));
        }
        Some(Ok(other)) => {
            return Err(ClientError::ProtocolViolation(format!(
                "Expected version exchange, got {other:?}"
            )));
        }
        Some(Err(e)) => return Err(e.into()),
        None => return Err(ClientError::Disconnected),
    }

    let mut identification = ClientName::new(&settings.client_name).as_bytes();
    identification.extend(HostName::new(&settings.host_name).as_bytes());
    timeout(settings.send_progress_timeout, tx.write_all(&identification))
        .await
        .map_err(|_| ClientError::Timeout)??;

    handler.established(circuit.id);
    circuit.send.start_draining();

    let writer = write_loop(&circuit.send, tx, settings.send_progress_timeout);
    tokio::pin!(writer);

    let heartbeat = settings.heartbeat_period;
    let mut echo_sent_at: Option<Instant> = None;
    loop {
        let last = *last_activity.lock().unwrap();
        // Activity since our echo means the peer answered
        if echo_sent_at.is_some_and(|sent| last >= sent) {
            echo_sent_at = None;
        }
        let wake = match echo_sent_at {
            None => last + heartbeat,
            Some(_) => last + heartbeat * 2,
        };
        select! {
            result = &mut writer => return result,
            incoming = framed.next() => match incoming {
                Some(Ok(message)) => {
                    trace!("Received message: {message:?}");
                    handler.message(circuit.id, message);
                }
                Some(Err(e)) => {
                    error!("Protocol violation from {}: {e}", circuit.address);
                    return Err(e.into());
                }
                None => {
                    debug!("Server at {} closed the connection", circuit.address);
                    return Err(ClientError::Disconnected);
                }
            },
            _ = sleep_until(wake) => {
                let silence = Instant::now().saturating_duration_since(*last_activity.lock().unwrap());
                if silence >= heartbeat * 2 {
                    warn!("No reply from {} in {silence:?}, assuming connection dead", circuit.address);
                    return Err(ClientError::Disconnected);
                } else if silence >= heartbeat && echo_sent_at.is_none() {
                    trace!("Circuit idle, sending echo");
                    circuit.push(&Echo, PushMode::Internal)?;
                    echo_sent_at = Some(Instant::now());
                }
            },
        }
    }
}

fn sleep_until(instant: Instant) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
    if instant <= Instant::now() {
        Box::pin(future::ready(()))
    } else {
        Box::pin(tokio::time::sleep_until(tokio::time::Instant::from_std(
            instant,
        )))
    }
}

/// Send everything the buffer hands over, until it closes
async fn write_loop(
    send: &SendBuffer,
    mut tx: OwnedWriteHalf,
    progress_timeout: Duration,
) -> Result<(), ClientError> {
    loop {
        match send.take() {
            Taken::Data(data) => {
                trace!("Writing {} bytes", data.len());
                timeout(progress_timeout, tx.write_all(&data))
                    .await
                    .map_err(|_| {
                        warn!("Socket write made no progress in {progress_timeout:?}");
                        ClientError::Timeout
                    })??;
            }
            Taken::Empty => send.wait().await,
            Taken::Closed => {
                let _ = tx.shutdown().await;
                return Ok(());
            }
        }
    }
}
