use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    future,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    time::{Duration, Instant},
};
use tokio::{net::UdpSocket, select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    config::ContextConfig,
    messages::{AsBytes, ClientMessage, RawMessage, Search, Version},
    utils::wrapping_inplace_add,
};

/// Requests into the search loop
#[derive(Debug)]
pub(crate) enum SearchCommand {
    Search { cid: u32, name: String },
    /// Search again for a channel whose circuit failed or refused it
    Resume { cid: u32, name: String },
    /// The channel reached its server; forget its search history
    Connected(u32),
    Cancel(u32),
    /// A server has (re)appeared; retry everything promptly
    ResetBackoff,
}

/// A channel name that a server has claimed
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Resolved {
    pub cid: u32,
    pub address: SocketAddr,
    pub minor_version: u16,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SearchEvent {
    Resolved(Resolved),
    /// Gave up after the configured number of attempts
    NotFound(u32),
}

#[derive(Debug, Clone)]
pub(crate) struct SearchTimings {
    pub min_period: Duration,
    pub max_period: Duration,
    pub congestion_threshold: u32,
    pub max_datagram_size: usize,
    pub max_retries: Option<u32>,
    pub reconnect_delay: Duration,
}

impl From<&ContextConfig> for SearchTimings {
    fn from(config: &ContextConfig) -> Self {
        SearchTimings {
            min_period: config.min_search_period,
            max_period: config.max_search_period.max(config.min_search_period),
            congestion_threshold: config.congestion_threshold.max(1),
            max_datagram_size: config.max_datagram_size,
            max_retries: config.max_search_retries,
            reconnect_delay: config.reconnect_delay,
        }
    }
}

#[derive(Debug)]
struct SearchEntry {
    name: String,
    retries: u32,
    next_attempt: Instant,
}

/// Sequence numbers remembered for stale reply detection
const REMEMBERED_ROUNDS: usize = 32;

/// What a timer expiry produced
#[derive(Debug, Default)]
pub(crate) struct SearchRound {
    pub datagrams: Vec<Vec<u8>>,
    pub not_found: Vec<u32>,
}

/// Pending searches and the shared backoff that paces them.
///
/// The search id sent on the wire is the channel's client id.
pub(crate) struct SearchState {
    timings: SearchTimings,
    entries: BTreeMap<u32, SearchEntry>,
    /// Shared base period, moved between the floor and maximum by congestion
    period: Duration,
    next_sequence: u32,
    /// First sequence number of each recent round, oldest first
    round_starts: VecDeque<u32>,
    /// First sequence of the newest round a reply has been accepted from
    accepted_round: Option<u32>,
    /// Attempts it took to find channels that are now on a circuit
    found: HashMap<u32, u32>,
    /// Has anything useful come back since the last round went out
    replied_since_send: bool,
    sent_since_reply: bool,
    replyless_expirations: u32,
}

impl SearchState {
    pub fn new(timings: SearchTimings) -> Self {
        SearchState {
            period: timings.min_period,
            timings,
            entries: BTreeMap::new(),
            next_sequence: 0,
            round_starts: VecDeque::new(),
            accepted_round: None,
            found: HashMap::new(),
            replied_since_send: false,
            sent_since_reply: false,
            replyless_expirations: 0,
        }
    }

    pub fn add(&mut self, cid: u32, name: String, now: Instant) {
        self.found.remove(&cid);
        self.entries.insert(
            cid,
            SearchEntry {
                name,
                retries: 0,
                next_attempt: now,
            },
        );
    }

    /// Search again for a channel that was found but could not be kept.
    ///
    /// The attempt count carries on from the search that found it, so a
    /// server that answers searches but never holds a circuit is retried at
    /// the same growing interval as one that never answers.
    pub fn resume(&mut self, cid: u32, name: String, now: Instant) {
        let retries = self.found.remove(&cid).unwrap_or(0);
        let delay = self
            .retry_delay(retries + 1)
            .max(self.timings.reconnect_delay);
        trace!("Searching for {name} again in {delay:?}");
        self.entries.insert(
            cid,
            SearchEntry {
                name,
                retries,
                next_attempt: now + delay,
            },
        );
    }

    pub fn connected(&mut self, cid: u32) {
        self.found.remove(&cid);
    }

    pub fn remove(&mut self, cid: u32) -> bool {
        self.found.remove(&cid);
        self.entries.remove(&cid).is_some()
    }

    pub fn is_pending(&self, cid: u32) -> bool {
        self.entries.contains_key(&cid)
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.next_attempt).min()
    }

    pub fn reset_backoff(&mut self, now: Instant) {
        self.period = self.timings.min_period;
        self.replyless_expirations = 0;
        self.found.clear();
        for entry in self.entries.values_mut() {
            entry.retries = 0;
            entry.next_attempt = now;
        }
    }

    /// The round a sequence number was sent in, by its first sequence
    fn round_of(&self, sequence: u32) -> u32 {
        self.round_starts
            .iter()
            .rev()
            .copied()
            .find(|start| sequence.wrapping_sub(*start) as i32 >= 0)
            .unwrap_or(sequence)
    }

    fn retry_delay(&self, retries: u32) -> Duration {
        let factor = 2u32.saturating_pow(retries.saturating_sub(1).min(31));
        self.period
            .saturating_mul(factor)
            .min(self.timings.max_period)
    }

    /// Build the datagrams for every search that is due
    pub fn poll(&mut self, now: Instant) -> SearchRound {
        let mut round = SearchRound::default();
        let due: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, e)| e.next_attempt <= now)
            .map(|(cid, _)| *cid)
            .collect();
        if due.is_empty() {
            return round;
        }

        if self.sent_since_reply && !self.replied_since_send {
            self.replyless_expirations += 1;
            if self.replyless_expirations >= self.timings.congestion_threshold {
                self.period = self.period.saturating_mul(2).min(self.timings.max_period);
                self.replyless_expirations = 0;
                debug!("No search replies, period now {:?}", self.period);
            }
        }

        let mut searches = Vec::new();
        for cid in due {
            let exhausted = match (self.entries.get(&cid), self.timings.max_retries) {
                (Some(entry), Some(limit)) => entry.retries >= limit,
                _ => false,
            };
            if exhausted {
                if let Some(entry) = self.entries.remove(&cid) {
                    debug!("Giving up search for {} after {} attempts", entry.name, entry.retries);
                }
                round.not_found.push(cid);
                continue;
            }
            let delay = match self.entries.get(&cid) {
                Some(entry) => self.retry_delay(entry.retries + 1),
                None => continue,
            };
            let Some(entry) = self.entries.get_mut(&cid) else {
                continue;
            };
            entry.retries += 1;
            entry.next_attempt = now + delay;
            trace!("Search attempt {} for {}", entry.retries, entry.name);
            searches.push(
                Search {
                    search_id: cid,
                    channel_name: entry.name.clone(),
                    ..Default::default()
                }
                .as_bytes(),
            );
        }

        if !searches.is_empty() {
            if self.round_starts.len() == REMEMBERED_ROUNDS {
                self.round_starts.pop_front();
            }
            self.round_starts.push_back(self.next_sequence);
        }
        let mut datagram = Vec::new();
        let mut searches_in_datagram = 0;
        for search in searches {
            if searches_in_datagram > 0
                && datagram.len() + search.len() > self.timings.max_datagram_size
            {
                round.datagrams.push(std::mem::take(&mut datagram));
                searches_in_datagram = 0;
            }
            if searches_in_datagram == 0 {
                let sequence = wrapping_inplace_add(&mut self.next_sequence);
                datagram = Version::with_sequence(sequence).as_bytes();
            }
            datagram.extend_from_slice(&search);
            searches_in_datagram += 1;
        }
        if searches_in_datagram > 0 {
            round.datagrams.push(datagram);
            self.sent_since_reply = true;
            self.replied_since_send = false;
        }
        round
    }

    /// Interpret a reply datagram, returning the channels it resolved
    pub fn handle_datagram(&mut self, data: &[u8], sender: SocketAddr) -> Vec<Resolved> {
        let messages = match RawMessage::parse_many(data) {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Received unparseable search reply from {sender}: {e}");
                return Vec::new();
            }
        };
        let mut sequence = None;
        let mut resolved = Vec::new();
        for raw in messages {
            match ClientMessage::try_from(raw) {
                Ok(ClientMessage::Version(version)) => {
                    sequence = version.search_sequence();
                    if let (Some(seq), Some(round)) = (sequence, self.accepted_round)
                        && (round.wrapping_sub(seq) as i32) > 0
                    {
                        debug!("Discarding stale search reply {seq} (current round {round}) from {sender}");
                        return Vec::new();
                    }
                }
                Ok(ClientMessage::SearchResponse(response)) => {
                    let Some(entry) = self.entries.remove(&response.search_id) else {
                        trace!("Ignoring duplicate search reply for {}", response.search_id);
                        continue;
                    };
                    self.found.insert(response.search_id, entry.retries);
                    let ip = match response.server_ip {
                        Some(ip) if !ip.is_unspecified() => IpAddr::V4(ip),
                        _ => sender.ip(),
                    };
                    let address = SocketAddr::new(ip, response.port_number);
                    debug!("Found server for {}: {address}", entry.name);
                    resolved.push(Resolved {
                        cid: response.search_id,
                        address,
                        minor_version: response.protocol_version.unwrap_or_default(),
                    });
                }
                Ok(other) => trace!("Ignoring {other:?} in search reply"),
                Err(e) => warn!("Bad message in search reply from {sender}: {e}"),
            }
        }
        if !resolved.is_empty() {
            if let Some(seq) = sequence {
                let round = self.round_of(seq);
                if self
                    .accepted_round
                    .is_none_or(|accepted| round.wrapping_sub(accepted) as i32 > 0)
                {
                    self.accepted_round = Some(round);
                }
            }
            self.replied_since_send = true;
            self.sent_since_reply = false;
            self.replyless_expirations = 0;
            self.period = (self.period / 2).max(self.timings.min_period);
        }
        resolved
    }
}

/// Runs name resolution for a context on its dispatch runtime
pub(crate) struct Searcher {
    socket: std::net::UdpSocket,
    addresses: Vec<SocketAddr>,
    state: SearchState,
}

impl Searcher {
    pub fn new(
        socket: std::net::UdpSocket,
        addresses: Vec<SocketAddr>,
        timings: SearchTimings,
    ) -> Self {
        Searcher {
            socket,
            addresses,
            state: SearchState::new(timings),
        }
    }

    pub async fn run<F>(
        self,
        mut commands: mpsc::UnboundedReceiver<SearchCommand>,
        cancel: CancellationToken,
        mut report: F,
    ) where
        F: FnMut(SearchEvent),
    {
        let Searcher {
            socket,
            addresses,
            mut state,
        } = self;
        let socket = match UdpSocket::from_std(socket) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Could not start searching: {e}");
                return;
            }
        };
        let mut buffer = vec![0u8; 0xFFFF];
        loop {
            let mut batch = Vec::new();
            select! {
                _ = cancel.cancelled() => break,
                count = commands.recv_many(&mut batch, 64) => {
                    if count == 0 {
                        break;
                    }
                    let now = Instant::now();
                    for command in batch {
                        match command {
                            SearchCommand::Search { cid, name } => {
                                if state.is_pending(cid) {
                                    trace!("Restarting search for {name}");
                                }
                                state.add(cid, name, now);
                            }
                            SearchCommand::Resume { cid, name } => state.resume(cid, name, now),
                            SearchCommand::Connected(cid) => state.connected(cid),
                            SearchCommand::Cancel(cid) => {
                                state.remove(cid);
                            }
                            SearchCommand::ResetBackoff => {
                                debug!("Resetting search backoff from {:?}", state.period());
                                state.reset_backoff(now);
                            }
                        }
                    }
                },
                result = socket.recv_from(&mut buffer) => match result {
                    Ok((size, sender)) => {
                        for resolved in state.handle_datagram(&buffer[..size], sender) {
                            report(SearchEvent::Resolved(resolved));
                        }
                    }
                    Err(e) => warn!("Error waiting for search replies: {e}"),
                },
                _ = next_attempt(&state) => {
                    let round = state.poll(Instant::now());
                    for datagram in &round.datagrams {
                        for addr in &addresses {
                            trace!("Sending search datagram to {addr}");
                            if let Err(e) = socket.send_to(datagram, *addr).await {
                                warn!("Failed to send search to {addr}: {e}");
                            }
                        }
                    }
                    for cid in round.not_found {
                        report(SearchEvent::NotFound(cid));
                    }
                },
            }
        }
        debug!("Search loop finished");
    }
}

/// Wait until it's time for the next search round
fn next_attempt(state: &SearchState) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
    match state.next_deadline() {
        None => Box::pin(future::pending()),
        Some(instant) if instant <= Instant::now() => Box::pin(future::ready(())),
        Some(instant) => Box::pin(tokio::time::sleep_until(tokio::time::Instant::from_std(instant))),
    }
}
