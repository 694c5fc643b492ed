//! The client context, and the channel, subscription and request handles it
//! gives out.
//!
//! A context owns one dispatch thread running a single-threaded tokio runtime.
//! That thread drives every socket and timer, decodes everything received and
//! runs every callback. Application threads only ever touch the shared state
//! under its mutex, and push encoded requests into circuit send buffers.
//!
//! Callbacks never run with the context lock held, so they may call straight
//! back into the context. Calls that would block (waiting on a get, pend_io)
//! fail with [`ClientError::NotAllowedInCallback`] instead.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    mem,
    net::SocketAddr,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, trace, warn};

use crate::{
    client::{
        ClientError,
        beacons::watch_beacons,
        callbacks::{
            CallbackSlot, ConnectionCallback, ConnectionEvent, GetCallback, Notification,
            PutCallback, UpdateCallback, deliver_all, is_dispatch_thread, mark_dispatch_thread,
        },
        channels::{ChannelRegistry, ChannelState},
        circuit::{Circuit, CircuitHandler, CircuitSettings, run_circuit},
        requests::{Cancelled, RequestKind, RequestTable, RequestType},
        searcher::{SearchCommand, SearchEvent, SearchTimings, Searcher, Resolved},
        send_buffer::PushMode,
    },
    config::ContextConfig,
    dbr::{Dbr, DbrBasicType, DbrCategory, DbrType, DbrValue},
    messages::{
        Access, CA_MINOR_PROTOCOL_REVISION, CAMessage, ClearChannel, ClientMessage, CreateChannel,
        ErrorCondition, EventAdd, EventCancel, MonitorMask, ReadNotify, Write, WriteNotify,
        command,
    },
    utils::{new_reusable_udp_socket, wrapping_inplace_add},
};

#[derive(Default)]
struct IoProgress {
    pending: usize,
    /// Channel connections given up on since the last wait reported them
    not_found: usize,
}

/// Counts the operations [`Context::pend_io`] waits for
#[derive(Default)]
pub(crate) struct IoCounter {
    progress: Mutex<IoProgress>,
    done: Condvar,
}

impl IoCounter {
    fn lock(&self) -> MutexGuard<'_, IoProgress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait(&self, timeout: Duration) -> Result<(), ClientError> {
        let deadline = Instant::now() + timeout;
        let mut progress = self.lock();
        while progress.pending > 0 {
            let now = Instant::now();
            if now >= deadline {
                return Err(ClientError::Timeout);
            }
            progress = self
                .done
                .wait_timeout(progress, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        if progress.not_found > 0 {
            progress.not_found = 0;
            return Err(ClientError::NameNotFound);
        }
        Ok(())
    }
}

/// One outstanding pend_io operation. Released exactly once, when dropped.
pub(crate) struct IoToken(Arc<IoCounter>);

impl IoToken {
    fn new(counter: &Arc<IoCounter>) -> Self {
        counter.lock().pending += 1;
        IoToken(counter.clone())
    }

    /// Release a channel connection that will not happen
    fn not_found(self) {
        self.0.lock().not_found += 1;
    }
}

impl Drop for IoToken {
    fn drop(&mut self) {
        let mut progress = self.0.lock();
        progress.pending = progress.pending.saturating_sub(1);
        if progress.pending == 0 {
            self.0.done.notify_all();
        }
    }
}

struct CircuitEntry {
    circuit: Arc<Circuit>,
    channels: HashSet<u32>,
    /// Minor protocol version the server announced in its search reply
    minor_version: u16,
}

#[derive(Default)]
struct ContextState {
    channels: ChannelRegistry,
    requests: RequestTable,
    circuits: HashMap<u64, CircuitEntry>,
    by_address: HashMap<SocketAddr, u64>,
    next_circuit_id: u64,
    closed: bool,
}

pub(crate) struct Shared {
    state: Mutex<ContextState>,
    io: Arc<IoCounter>,
    searches: mpsc::UnboundedSender<SearchCommand>,
    config: ContextConfig,
    settings: Arc<CircuitSettings>,
    cancel: CancellationToken,
}

/// What a request needs to know about a connected channel
struct Connected {
    circuit: Arc<Circuit>,
    circuit_id: u64,
    server_id: u32,
    native_type: DbrBasicType,
    element_count: u32,
    access: Access,
}

fn denied(condition: ErrorCondition) -> ClientError {
    ClientError::Server(condition, condition.to_string())
}

fn decode(data_type: DbrType, data_count: u32, data: &[u8]) -> Result<Dbr, ClientError> {
    Dbr::from_bytes(data_type, data_count as usize, data).map_err(|e| {
        warn!("Could not decode reply: {e}");
        ClientError::ServerSentInvalidMessage
    })
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap()
    }

    /// The dispatch thread must never wait on a full send buffer, since it is
    /// the thread that empties it
    fn push_mode(&self) -> PushMode {
        if is_dispatch_thread() {
            PushMode::NoWait
        } else {
            PushMode::Block(self.config.send_block_timeout)
        }
    }

    fn flush_io(&self) {
        let circuits: Vec<_> = self
            .lock()
            .circuits
            .values()
            .map(|e| e.circuit.clone())
            .collect();
        for circuit in circuits {
            circuit.send.flush();
        }
    }

    /// Push a request that has already been registered under `id`.
    ///
    /// If it cannot be queued the registration is withdrawn, unless the
    /// request has already been moved or answered by a disconnect.
    fn submit<M: CAMessage>(&self, circuit: &Circuit, id: u32, message: &M) -> Result<(), ClientError> {
        let Err(error) = circuit.push(message, self.push_mode()) else {
            return Ok(());
        };
        let withdrawn = {
            let mut state = self.lock();
            if state
                .requests
                .get(id)
                .is_some_and(|r| r.circuit == Some(circuit.id))
            {
                state.requests.discard(id)
            } else {
                None
            }
        };
        match withdrawn {
            Some(_) => Err(error),
            None => Ok(()),
        }
    }

    fn create_channel(
        self: &Arc<Self>,
        name: &str,
        connection: Option<Arc<CallbackSlot<ConnectionCallback>>>,
        pend_io: bool,
    ) -> Result<Channel, ClientError> {
        let cid = {
            let mut state = self.lock();
            if state.closed {
                return Err(ClientError::ContextClosed);
            }
            let token = pend_io.then(|| IoToken::new(&self.io));
            state.channels.allocate(name, connection, token)?
        };
        let _span = debug_span!("create_channel", cid = cid).entered();
        debug!("Searching for '{name}'");
        let channel = Channel {
            cid,
            name: name.to_owned(),
            shared: self.clone(),
        };
        self.searches
            .send(SearchCommand::Search {
                cid,
                name: name.to_owned(),
            })
            .map_err(|_| ClientError::ContextClosed)?;
        Ok(channel)
    }

    fn on_search_event(self: &Arc<Self>, event: SearchEvent) {
        match event {
            SearchEvent::Resolved(resolved) => self.on_search_resolved(resolved),
            SearchEvent::NotFound(cid) => {
                let (slot, token) = {
                    let mut state = self.lock();
                    match state.channels.mark_not_found(cid) {
                        Some(channel) => {
                            warn!("No server answered the search for '{}'", channel.name);
                            (channel.connection.clone(), channel.pend_io.take())
                        }
                        None => return,
                    }
                };
                if let Some(token) = token {
                    token.not_found();
                }
                if let Some(slot) = slot {
                    Notification::Connection(slot, ConnectionEvent::NotFound).deliver();
                }
            }
        }
    }

    /// Hand a found channel to the circuit for its server, creating it if needed
    fn on_search_resolved(self: &Arc<Self>, resolved: Resolved) {
        let Resolved {
            cid,
            address,
            minor_version,
        } = resolved;
        let _span = debug_span!("create_channel", cid = cid).entered();
        let spawn = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.closed {
                return;
            }
            let Some(channel) = state.channels.lookup(cid) else {
                trace!("Search reply for destroyed channel");
                return;
            };
            if channel.circuit.is_some() {
                return;
            }
            let name = channel.name.clone();

            let existing = state
                .by_address
                .get(&address)
                .copied()
                .filter(|id| state.circuits.get(id).is_some_and(|e| !e.circuit.is_closed()));
            let (circuit_id, spawn) = match existing {
                Some(id) => (id, None),
                None => {
                    let id = wrapping_inplace_add(&mut state.next_circuit_id);
                    let circuit = Circuit::new(
                        id,
                        address,
                        self.config.send_buffer_capacity,
                        self.cancel.child_token(),
                    );
                    state.circuits.insert(
                        id,
                        CircuitEntry {
                            circuit: circuit.clone(),
                            channels: HashSet::new(),
                            minor_version,
                        },
                    );
                    state.by_address.insert(address, id);
                    (id, Some(circuit))
                }
            };
            state.channels.attach(cid, circuit_id);
            let Some(entry) = state.circuits.get_mut(&circuit_id) else {
                return;
            };
            entry.channels.insert(cid);
            debug!("Creating '{name}' on circuit {circuit_id} to {address}");
            let create = CreateChannel {
                client_id: cid,
                channel_name: name,
                protocol_version: CA_MINOR_PROTOCOL_REVISION as u32,
            };
            if let Err(e) = entry.circuit.push(&create, PushMode::Internal) {
                debug!("Circuit closed before channel create could be queued: {e}");
            }
            spawn
        };
        if let Some(circuit) = spawn {
            tokio::spawn(
                run_circuit(circuit, self.settings.clone(), self.clone())
                    .instrument(debug_span!("circuit", address = %address)),
            );
        }
    }

    /// Close a circuit that no longer carries any channels
    fn close_if_idle(&self, state: &mut ContextState, circuit_id: u64) -> Vec<Notification> {
        if !state
            .circuits
            .get(&circuit_id)
            .is_some_and(|e| e.channels.is_empty())
        {
            return Vec::new();
        }
        let Some(entry) = state.circuits.remove(&circuit_id) else {
            return Vec::new();
        };
        if state.by_address.get(&entry.circuit.address) == Some(&circuit_id) {
            state.by_address.remove(&entry.circuit.address);
        }
        debug!("Closing idle circuit to {}", entry.circuit.address);
        entry.circuit.close();
        state
            .requests
            .fail_where(|r| r.circuit == Some(circuit_id), ClientError::Disconnected)
    }

    /// The server dropped one channel; send it back to searching
    fn channel_lost(
        &self,
        state: &mut ContextState,
        circuit_id: u64,
        cid: u32,
        notifications: &mut Vec<Notification>,
    ) {
        let Some(channel) = state.channels.lookup(cid) else {
            return;
        };
        if channel.circuit != Some(circuit_id) {
            return;
        }
        let name = channel.name.clone();
        let connection = channel.connection.clone();
        if state.channels.unbind(cid) == Some(ChannelState::Connected)
            && let Some(slot) = connection
        {
            notifications.push(Notification::Connection(slot, ConnectionEvent::Disconnected));
        }
        notifications.extend(state.requests.fail_where(
            |r| r.cid == cid && r.circuit == Some(circuit_id),
            ClientError::Disconnected,
        ));
        if let Some(entry) = state.circuits.get_mut(&circuit_id) {
            entry.channels.remove(&cid);
        }
        let _ = self.searches.send(SearchCommand::Resume { cid, name });
        notifications.extend(self.close_if_idle(state, circuit_id));
    }

    /// Apply one message from a circuit, returning the callbacks it triggers
    fn dispatch(&self, circuit_id: u64, message: ClientMessage) -> Vec<Notification> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let mut notifications = Vec::new();
        let routed_here = |state: &ContextState, id: u32| {
            state
                .requests
                .get(id)
                .is_some_and(|r| r.circuit == Some(circuit_id))
        };

        match message {
            ClientMessage::CreateChannelResponse(msg) => {
                let _span = debug_span!("handle_message", cid = msg.client_id).entered();
                let Some(circuit) = state.circuits.get(&circuit_id).map(|e| e.circuit.clone())
                else {
                    return notifications;
                };
                let Some(channel) = state.channels.bind(
                    msg.client_id,
                    circuit_id,
                    msg.server_id,
                    msg.native_type,
                    msg.native_count,
                ) else {
                    debug!("Create response for a channel no longer on this circuit");
                    return notifications;
                };
                debug!(
                    "Channel '{}' connected: {} x {}",
                    channel.name, msg.native_count, msg.native_type
                );
                let _released = channel.pend_io.take();
                let _ = self.searches.send(SearchCommand::Connected(msg.client_id));
                if let Some(slot) = &channel.connection {
                    notifications.push(Notification::Connection(
                        slot.clone(),
                        ConnectionEvent::Connected {
                            native_type: msg.native_type,
                            element_count: msg.native_count,
                            server: circuit.address,
                        },
                    ));
                }
                for (id, request, mask) in state.requests.awaiting_reconnection(msg.client_id) {
                    let (data_type, data_count) = request.resolve(msg.native_type, msg.native_count);
                    trace!("Installing subscription {id} as {data_count} x {data_type}");
                    let install = EventAdd {
                        data_type,
                        data_count,
                        server_id: msg.server_id,
                        subscription_id: id,
                        mask,
                    };
                    if circuit.push(&install, PushMode::Internal).is_ok() {
                        state.requests.mark_sent(id, circuit_id, data_type, data_count);
                    }
                }
            }
            ClientMessage::CreateChannelFailure(msg) => {
                warn!("Server refused to create channel {}", msg.client_id);
                self.channel_lost(state, circuit_id, msg.client_id, &mut notifications);
            }
            ClientMessage::ServerDisconnect(msg) => {
                debug!("Server disconnected channel {}", msg.client_id);
                self.channel_lost(state, circuit_id, msg.client_id, &mut notifications);
            }
            ClientMessage::AccessRights(msg) => {
                if let Some(channel) = state
                    .channels
                    .lookup_mut(msg.client_id)
                    .filter(|c| c.circuit == Some(circuit_id))
                {
                    debug!("Access to '{}' is now {}", channel.name, msg.access_rights);
                    channel.access = msg.access_rights;
                }
            }
            ClientMessage::ReadNotifyResponse(msg) => {
                if !routed_here(state, msg.client_ioid) {
                    warn!("Read reply for unknown request {}", msg.client_ioid);
                    return notifications;
                }
                let result = ClientError::check_status(msg.status_code)
                    .and_then(|_| decode(msg.data_type, msg.data_count, &msg.data));
                notifications.extend(state.requests.complete_get(msg.client_ioid, result));
            }
            ClientMessage::WriteNotifyResponse(msg) => {
                if !routed_here(state, msg.client_ioid) {
                    warn!("Write reply for unknown request {}", msg.client_ioid);
                    return notifications;
                }
                let result = ClientError::check_status(msg.status_code);
                notifications.extend(state.requests.complete_put(msg.client_ioid, result));
            }
            ClientMessage::EventAddResponse(msg) => {
                let id = msg.subscription_id;
                if msg.is_cancel_confirmation() && state.requests.confirm_cancel(id) {
                    trace!("Cancel of subscription {id} confirmed");
                } else if !state.requests.is_live_subscription(id) || !routed_here(state, id) {
                    trace!("Discarding update for inactive subscription {id}");
                } else if msg.is_cancel_confirmation() {
                    if let Err(e) = ClientError::check_status(msg.status_code) {
                        notifications.extend(state.requests.deliver_update(id, Err(e)));
                    }
                } else {
                    let result = ClientError::check_status(msg.status_code)
                        .and_then(|_| decode(msg.data_type, msg.data_count, &msg.data));
                    notifications.extend(state.requests.deliver_update(id, result));
                }
            }
            ClientMessage::Error(msg) => {
                warn!(
                    "Server reported error for command {}: {} ({})",
                    msg.original_request.command, msg.condition, msg.message
                );
                if msg.original_request.command == command::CREATE_CHAN {
                    let cid = msg.original_request.parameter_1;
                    self.channel_lost(state, circuit_id, cid, &mut notifications);
                } else if let Some(id) = msg.original_ioid() {
                    notifications.extend(
                        state
                            .requests
                            .fail_request(id, ClientError::Server(msg.condition, msg.message)),
                    );
                }
            }
            ClientMessage::Echo | ClientMessage::ClearChannel(_) => {}
            other => warn!("Ignoring unexpected message on circuit: {other:?}"),
        }
        notifications
    }

    /// Stop accepting requests and close every circuit
    fn shutdown(&self) {
        let (circuits, channels, requests) = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.by_address.clear();
            let circuits: Vec<_> = state.circuits.drain().map(|(_, e)| e.circuit).collect();
            (
                circuits,
                mem::take(&mut state.channels),
                mem::take(&mut state.requests),
            )
        };
        debug!(
            "Shutting down context with {} channels on {} circuits",
            channels.len(),
            circuits.len()
        );
        for circuit in circuits {
            circuit.close();
        }
        self.cancel.cancel();
        // Dropping these may run user destructors, which may call back in
        drop(requests);
        drop(channels);
    }
}

impl CircuitHandler for Shared {
    fn established(&self, circuit: u64) {
        let state = self.lock();
        if let Some(entry) = state.circuits.get(&circuit) {
            debug!(
                "Circuit to {} established (protocol 4.{})",
                entry.circuit.address, entry.minor_version
            );
        }
    }

    fn message(&self, circuit: u64, message: ClientMessage) {
        let notifications = self.dispatch(circuit, message);
        deliver_all(notifications);
    }

    fn closed(&self, circuit: u64, reason: ClientError) {
        let notifications = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let Some(entry) = state.circuits.remove(&circuit) else {
                return;
            };
            if state.by_address.get(&entry.circuit.address) == Some(&circuit) {
                state.by_address.remove(&entry.circuit.address);
            }
            debug!("Lost circuit to {}: {reason}", entry.circuit.address);

            let mut notifications = Vec::new();
            for cid in state.channels.on_circuit(circuit) {
                let Some(channel) = state.channels.lookup(cid) else {
                    continue;
                };
                let name = channel.name.clone();
                let connection = channel.connection.clone();
                if state.channels.unbind(cid) == Some(ChannelState::Connected)
                    && let Some(slot) = connection
                {
                    notifications
                        .push(Notification::Connection(slot, ConnectionEvent::Disconnected));
                }
                if !state.closed {
                    let _ = self.searches.send(SearchCommand::Resume { cid, name });
                }
            }
            notifications.extend(
                state
                    .requests
                    .fail_where(|r| r.circuit == Some(circuit), ClientError::Disconnected),
            );
            notifications
        };
        deliver_all(notifications);
    }
}

/// Builds a [`Context`] from a [`ContextConfig`]
pub struct ContextBuilder {
    config: ContextConfig,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        ContextBuilder {
            config: ContextConfig::from_environment(),
        }
    }
}

impl ContextBuilder {
    pub fn new() -> Self {
        ContextBuilder::default()
    }
    pub fn from_config(config: ContextConfig) -> Self {
        ContextBuilder { config }
    }
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }
    pub fn search_addresses(mut self, addresses: Vec<SocketAddr>) -> Self {
        self.config.search_addresses = addresses;
        self
    }
    pub fn watch_beacons(mut self, watch: bool) -> Self {
        self.config.watch_beacons = watch;
        self
    }
    pub fn beacon_port(mut self, port: u16) -> Self {
        self.config.beacon_port = port;
        self
    }
    pub fn search_period(mut self, min: Duration, max: Duration) -> Self {
        self.config.min_search_period = min;
        self.config.max_search_period = max;
        self
    }
    pub fn max_search_retries(mut self, retries: Option<u32>) -> Self {
        self.config.max_search_retries = retries;
        self
    }
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }
    pub fn heartbeat_period(mut self, period: Duration) -> Self {
        self.config.heartbeat_period = period;
        self
    }
    pub fn send_buffer_capacity(mut self, bytes: usize) -> Self {
        self.config.send_buffer_capacity = bytes;
        self
    }
    pub fn send_block_timeout(mut self, timeout: Duration) -> Self {
        self.config.send_block_timeout = timeout;
        self
    }
    pub fn client_name(mut self, name: &str) -> Self {
        self.config.client_name = name.to_owned();
        self
    }
    pub fn host_name(mut self, name: &str) -> Self {
        self.config.host_name = name.to_owned();
        self
    }

    /// Bind the search socket and start the dispatch thread
    pub fn start(self) -> Result<Context, ClientError> {
        let config = self.config;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let search_socket = std::net::UdpSocket::bind(("0.0.0.0", 0))?;
        search_socket.set_broadcast(true)?;
        search_socket.set_nonblocking(true)?;
        let beacon_socket = if config.watch_beacons {
            match new_reusable_udp_socket(("0.0.0.0", config.beacon_port)) {
                Ok(socket) => Some(socket),
                Err(e) => {
                    warn!("Not watching beacons, could not bind port {}: {e}", config.beacon_port);
                    None
                }
            }
        } else {
            None
        };

        let (searches, search_commands) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let searcher = Searcher::new(
            search_socket,
            config.search_addresses.clone(),
            SearchTimings::from(&config),
        );
        let shared = Arc::new(Shared {
            state: Mutex::new(ContextState::default()),
            io: Arc::new(IoCounter::default()),
            searches: searches.clone(),
            settings: Arc::new(CircuitSettings::from(&config)),
            config,
            cancel: cancel.clone(),
        });

        let weak = Arc::downgrade(&shared);
        let dispatch = thread::Builder::new()
            .name("ca-dispatch".to_owned())
            .spawn(move || {
                mark_dispatch_thread();
                runtime.block_on(async move {
                    if let Some(socket) = beacon_socket {
                        tokio::spawn(watch_beacons(socket, searches, cancel.clone()));
                    }
                    searcher
                        .run(search_commands, cancel, move |event| {
                            if let Some(shared) = weak.upgrade() {
                                shared.on_search_event(event);
                            }
                        })
                        .await;
                });
                debug!("Dispatch thread finished");
            })?;
        Ok(Context {
            shared,
            dispatch: Some(dispatch),
        })
    }
}

/// A Channel Access client context.
///
/// Dropping the context closes every circuit and joins the dispatch thread.
pub struct Context {
    shared: Arc<Shared>,
    dispatch: Option<JoinHandle<()>>,
}

impl Context {
    /// Start a context configured from the EPICS environment
    pub fn new() -> Result<Context, ClientError> {
        ContextBuilder::new().start()
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    pub fn config(&self) -> &ContextConfig {
        &self.shared.config
    }

    /// Create a channel and start searching for it.
    ///
    /// The connection is counted by [`Context::pend_io`].
    pub fn create_channel(&self, name: &str) -> Result<Channel, ClientError> {
        self.shared.create_channel(name, None, true)
    }

    /// Create a channel that reports its connection changes to a callback
    pub fn create_channel_with_callback<F>(
        &self,
        name: &str,
        callback: F,
    ) -> Result<Channel, ClientError>
    where
        F: FnMut(ConnectionEvent) + Send + 'static,
    {
        let slot: Arc<CallbackSlot<ConnectionCallback>> = CallbackSlot::new(Box::new(callback));
        self.shared.create_channel(name, Some(slot), false)
    }

    /// Send every queued request now
    pub fn flush_io(&self) {
        self.shared.flush_io();
    }

    /// Flush, then wait for every pending channel connection and [`Channel::get`]
    pub fn pend_io(&self, timeout: Duration) -> Result<(), ClientError> {
        if is_dispatch_thread() {
            return Err(ClientError::NotAllowedInCallback);
        }
        self.shared.flush_io();
        self.shared.io.wait(timeout)
    }

    /// Flush, then let callbacks run for a while
    pub fn pend_event(&self, duration: Duration) -> Result<(), ClientError> {
        if is_dispatch_thread() {
            return Err(ClientError::NotAllowedInCallback);
        }
        self.shared.flush_io();
        thread::sleep(duration);
        Ok(())
    }

    pub fn circuit_count(&self) -> usize {
        self.shared.lock().circuits.len()
    }

    /// Gets, puts and subscriptions still registered, including cancels
    /// awaiting confirmation
    pub fn outstanding_requests(&self) -> usize {
        self.shared.lock().requests.len()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.shared.shutdown();
        if let Some(dispatch) = self.dispatch.take()
            && !is_dispatch_thread()
            && dispatch.join().is_err()
        {
            warn!("Dispatch thread panicked");
        }
    }
}

/// Result of a [`Channel::get`], to be waited on
pub struct PendingGet {
    waiter: Arc<GetWaiter>,
    shared: Arc<Shared>,
}

impl PendingGet {
    /// Flush, then wait for the reply
    pub fn wait(self, timeout: Duration) -> Result<Dbr, ClientError> {
        if is_dispatch_thread() {
            return Err(ClientError::NotAllowedInCallback);
        }
        self.shared.flush_io();
        self.waiter.wait(timeout)
    }
}

#[derive(Default)]
struct GetWaiter {
    result: Mutex<Option<Result<Dbr, ClientError>>>,
    ready: Condvar,
}

impl GetWaiter {
    fn complete(&self, result: Result<Dbr, ClientError>) {
        let mut slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(result);
            self.ready.notify_all();
        }
    }

    fn wait(&self, timeout: Duration) -> Result<Dbr, ClientError> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ClientError::Timeout);
            }
            slot = self
                .ready
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Fills a [`GetWaiter`] exactly once, even if the request is dropped unanswered
struct GetCompletion {
    waiter: Arc<GetWaiter>,
    _io: IoToken,
}

impl GetCompletion {
    fn finish(self, result: Result<Dbr, ClientError>) {
        self.waiter.complete(result);
    }
}

impl Drop for GetCompletion {
    fn drop(&mut self) {
        self.waiter.complete(Err(ClientError::ChannelDestroyed));
    }
}

/// A named channel. Dropping it destroys the channel.
pub struct Channel {
    cid: u32,
    name: String,
    shared: Arc<Shared>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("cid", &self.cid)
            .field("name", &self.name)
            .finish()
    }
}

impl Channel {
    pub fn id(&self) -> u32 {
        self.cid
    }
    pub fn name(&self) -> &str {
        &self.name
    }

    fn connected(&self, state: &ContextState) -> Result<Connected, ClientError> {
        if state.closed {
            return Err(ClientError::ContextClosed);
        }
        let entry = state
            .channels
            .lookup(self.cid)
            .ok_or(ClientError::ChannelDestroyed)?;
        match (entry.state, entry.circuit, entry.server_id, entry.native_type) {
            (ChannelState::Connected, Some(circuit_id), Some(server_id), Some(native_type)) => {
                let circuit = state
                    .circuits
                    .get(&circuit_id)
                    .ok_or(ClientError::Disconnected)?
                    .circuit
                    .clone();
                Ok(Connected {
                    circuit,
                    circuit_id,
                    server_id,
                    native_type,
                    element_count: entry.element_count,
                    access: entry.access,
                })
            }
            _ if entry.not_found => Err(ClientError::NameNotFound),
            _ => Err(ClientError::Disconnected),
        }
    }

    /// Read the value once. Counted by [`Context::pend_io`].
    pub fn get(&self, request: RequestType) -> Result<PendingGet, ClientError> {
        let waiter = Arc::new(GetWaiter::default());
        let completion = GetCompletion {
            waiter: waiter.clone(),
            _io: IoToken::new(&self.shared.io),
        };
        self.get_with_callback(request, move |result| completion.finish(result))?;
        Ok(PendingGet {
            waiter,
            shared: self.shared.clone(),
        })
    }

    /// Read the value once, delivering it to a callback
    pub fn get_with_callback<F>(&self, request: RequestType, callback: F) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Dbr, ClientError>) + Send + 'static,
    {
        let slot: Arc<CallbackSlot<GetCallback>> = CallbackSlot::new(Box::new(callback));
        let mut state = self.shared.lock();
        let connected = self.connected(&state)?;
        if !connected.access.can_read() {
            return Err(denied(ErrorCondition::NoRdAccess));
        }
        let (data_type, data_count) =
            request.resolve(connected.native_type, connected.element_count);
        let id = state.requests.register(
            self.cid,
            Some(connected.circuit_id),
            Some((data_type, data_count)),
            RequestKind::Get { slot },
        )?;
        drop(state);

        let _span = debug_span!("get", cid = self.cid).entered();
        debug!("Reading {data_count} x {data_type} as request {id}");
        let read = ReadNotify {
            data_type,
            data_count,
            server_id: connected.server_id,
            client_ioid: id,
        };
        self.shared.submit(&connected.circuit, id, &read)
    }

    /// Write a value without asking for confirmation
    pub fn put(&self, value: impl Into<DbrValue>) -> Result<(), ClientError> {
        let value = value.into();
        let connected = self.connected(&self.shared.lock())?;
        if !connected.access.can_write() {
            return Err(denied(ErrorCondition::NoWtAccess));
        }
        let write = Write {
            data_type: DbrType::new(value.get_type(), DbrCategory::Basic),
            data_count: value.get_count() as u32,
            server_id: connected.server_id,
            client_ioid: self.cid,
            data: value.to_bytes(),
        };
        connected.circuit.push(&write, self.shared.push_mode())
    }

    /// Write a value, and have the server confirm completion to a callback
    pub fn put_with_callback<F>(&self, value: impl Into<DbrValue>, callback: F) -> Result<(), ClientError>
    where
        F: FnOnce(Result<(), ClientError>) + Send + 'static,
    {
        let value = value.into();
        let slot: Arc<CallbackSlot<PutCallback>> = CallbackSlot::new(Box::new(callback));
        let mut state = self.shared.lock();
        let connected = self.connected(&state)?;
        if !connected.access.can_write() {
            return Err(denied(ErrorCondition::NoWtAccess));
        }
        let data_type = DbrType::new(value.get_type(), DbrCategory::Basic);
        let data_count = value.get_count() as u32;
        let id = state.requests.register(
            self.cid,
            Some(connected.circuit_id),
            Some((data_type, data_count)),
            RequestKind::Put { slot },
        )?;
        drop(state);

        let write = WriteNotify {
            data_type,
            data_count,
            server_id: connected.server_id,
            client_ioid: id,
            data: value.to_bytes(),
        };
        self.shared.submit(&connected.circuit, id, &write)
    }

    /// Subscribe to value updates.
    ///
    /// May be called before the channel connects; the subscription is
    /// installed when it does, and again after every reconnection.
    pub fn subscribe<F>(
        &self,
        request: RequestType,
        mask: MonitorMask,
        callback: F,
    ) -> Result<Subscription, ClientError>
    where
        F: FnMut(Result<Dbr, ClientError>) + Send + 'static,
    {
        let slot: Arc<CallbackSlot<UpdateCallback>> = CallbackSlot::new(Box::new(callback));
        let mut state = self.shared.lock();
        if state.closed {
            return Err(ClientError::ContextClosed);
        }
        let entry = state
            .channels
            .lookup(self.cid)
            .ok_or(ClientError::ChannelDestroyed)?;
        if entry.not_found {
            return Err(ClientError::NameNotFound);
        }
        let is_connected = entry.is_connected();
        let connected = if is_connected {
            Some(self.connected(&state)?)
        } else {
            None
        };
        if connected.as_ref().is_some_and(|c| !c.access.can_read()) {
            return Err(denied(ErrorCondition::NoRdAccess));
        }
        let wire = connected
            .as_ref()
            .map(|c| request.resolve(c.native_type, c.element_count));
        let id = state.requests.register(
            self.cid,
            connected.as_ref().map(|c| c.circuit_id),
            wire,
            RequestKind::Subscribe {
                slot: slot.clone(),
                request,
                mask,
            },
        )?;
        drop(state);

        let subscription = Subscription {
            id,
            slot,
            shared: self.shared.clone(),
        };
        if let (Some(connected), Some((data_type, data_count))) = (connected, wire) {
            let _span = debug_span!("subscribe", cid = self.cid).entered();
            debug!("Subscribing to {data_count} x {data_type} as {id}");
            let install = EventAdd {
                data_type,
                data_count,
                server_id: connected.server_id,
                subscription_id: id,
                mask,
            };
            self.shared.submit(&connected.circuit, id, &install)?;
        }
        Ok(subscription)
    }

    /// Destroy the channel. Safe to call more than once, and from inside
    /// one of the channel's own callbacks.
    pub fn destroy(&self) {
        let (entry, slots, notifications) = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            let Some(entry) = state.channels.remove(self.cid) else {
                return;
            };
            let slots = state.requests.remove_channel(self.cid);
            let mut notifications = Vec::new();
            if let Some(circuit_id) = entry.circuit {
                if let Some(circuit_entry) = state.circuits.get_mut(&circuit_id) {
                    circuit_entry.channels.remove(&self.cid);
                    if let Some(server_id) = entry.server_id {
                        let clear = ClearChannel {
                            server_id,
                            client_id: self.cid,
                        };
                        let _ = circuit_entry.circuit.push(&clear, PushMode::Internal);
                    }
                }
                notifications = self.shared.close_if_idle(state, circuit_id);
            }
            (entry, slots, notifications)
        };
        let _span = debug_span!("destroy", cid = self.cid).entered();
        debug!("Destroying channel '{}'", self.name);
        let _ = self.shared.searches.send(SearchCommand::Cancel(self.cid));
        for slot in slots {
            slot.retire();
        }
        if let Some(connection) = &entry.connection {
            connection.retire();
        }
        deliver_all(notifications);
    }

    pub fn state(&self) -> ChannelState {
        self.shared
            .lock()
            .channels
            .lookup(self.cid)
            .map(|c| c.state)
            .unwrap_or(ChannelState::Destroyed)
    }

    pub fn native_type(&self) -> Option<DbrBasicType> {
        self.shared
            .lock()
            .channels
            .lookup(self.cid)
            .and_then(|c| c.native_type)
    }

    pub fn element_count(&self) -> Option<u32> {
        self.shared
            .lock()
            .channels
            .lookup(self.cid)
            .filter(|c| c.native_type.is_some())
            .map(|c| c.element_count)
    }

    pub fn access_rights(&self) -> Access {
        self.shared
            .lock()
            .channels
            .lookup(self.cid)
            .map(|c| c.access)
            .unwrap_or_default()
    }

    /// Address of the server, while connected
    pub fn server_address(&self) -> Option<SocketAddr> {
        let state = self.shared.lock();
        let circuit = state
            .channels
            .lookup(self.cid)
            .filter(|c| c.is_connected())?
            .circuit?;
        state.circuits.get(&circuit).map(|e| e.circuit.address)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// A live subscription. Dropping it cancels the subscription.
pub struct Subscription {
    id: u32,
    slot: Arc<CallbackSlot<UpdateCallback>>,
    shared: Arc<Shared>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Subscription {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Stop the subscription.
    ///
    /// Once this returns the callback will not be called again. Called from
    /// inside the callback itself, it only prevents future invocations.
    pub fn cancel(&self) {
        let cancelled = self.shared.lock().requests.cancel(self.id);
        self.slot.retire();
        let Some(Cancelled {
            cid,
            on_server: Some((circuit_id, data_type, data_count)),
        }) = cancelled
        else {
            return;
        };
        let target = {
            let state = self.shared.lock();
            let circuit = state.circuits.get(&circuit_id).map(|e| e.circuit.clone());
            let server_id = state.channels.lookup(cid).and_then(|c| c.server_id);
            circuit.zip(server_id)
        };
        let Some((circuit, server_id)) = target else {
            return;
        };
        trace!("Cancelling subscription {}", self.id);
        let cancel = EventCancel {
            data_type,
            data_count,
            server_id,
            subscription_id: self.id,
        };
        if let Err(e) = circuit.push(&cancel, PushMode::Internal) {
            debug!("Could not send cancel for subscription {}: {e}", self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
