//! Tunables for a client [`Context`](crate::client::Context).
//!
//! Defaults follow the EPICS environment variables where one exists, so a
//! context created with [`ContextConfig::from_environment`] behaves like any
//! other CA client on the same host.

use std::{net::SocketAddr, time::Duration};

use tracing::warn;

use crate::utils::{
    get_default_beacon_port, get_default_connection_timeout, get_default_max_array_bytes,
    get_default_max_search_interval, get_default_server_port, get_target_broadcast_ips,
};

#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Where search datagrams are sent. Every address receives every datagram.
    pub search_addresses: Vec<SocketAddr>,
    /// UDP port beacons are listened for on
    pub beacon_port: u16,
    /// Listen for server beacons to speed up searching when servers appear
    pub watch_beacons: bool,

    /// Shortest interval between search rounds
    pub min_search_period: Duration,
    /// Upper bound on both the shared period and any single channel's retry delay
    pub max_search_period: Duration,
    /// Consecutive replyless search rounds before the shared period doubles
    pub congestion_threshold: u32,
    /// Upper bound on the size of one search datagram
    pub max_datagram_size: usize,
    /// Give up on a name after this many attempts. `None` searches forever.
    pub max_search_retries: Option<u32>,
    /// Least time between losing a channel's circuit and searching for it again
    pub reconnect_delay: Duration,

    /// Timeout for the TCP connect and the version exchange that follows it
    pub connect_timeout: Duration,
    /// Silence on a circuit for this long causes an echo; twice this, a disconnect
    pub heartbeat_period: Duration,
    /// Any single socket write must complete within this
    pub send_progress_timeout: Duration,
    /// Bytes buffered per circuit before application calls block
    pub send_buffer_capacity: usize,
    /// How long an application call will wait for send buffer space
    pub send_block_timeout: Duration,
    /// Largest payload accepted from a server
    pub max_array_bytes: usize,
    /// Circuit priority requested in the version exchange
    pub priority: u16,

    /// Reported to servers with CA_PROTO_CLIENT_NAME
    pub client_name: String,
    /// Reported to servers with CA_PROTO_HOST_NAME
    pub host_name: String,
}

impl ContextConfig {
    pub fn from_environment() -> Self {
        let client_name = whoami::username();
        let host_name = whoami::fallible::hostname().unwrap_or_else(|_| client_name.clone());
        let connection_timeout = seconds_or(
            "EPICS_CA_CONN_TMO",
            get_default_connection_timeout(),
            Duration::from_secs(30),
        );
        ContextConfig {
            search_addresses: get_target_broadcast_ips(get_default_server_port()),
            beacon_port: get_default_beacon_port(),
            watch_beacons: true,
            min_search_period: Duration::from_millis(32),
            max_search_period: seconds_or(
                "EPICS_CA_MAX_SEARCH_PERIOD",
                get_default_max_search_interval(),
                Duration::from_secs(300),
            ),
            congestion_threshold: 4,
            max_datagram_size: 1024,
            max_search_retries: None,
            reconnect_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            heartbeat_period: connection_timeout / 2,
            send_progress_timeout: connection_timeout,
            send_buffer_capacity: 64 * 1024,
            send_block_timeout: Duration::from_secs(5),
            max_array_bytes: get_default_max_array_bytes(),
            priority: 0,
            client_name,
            host_name,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self::from_environment()
    }
}

/// A period in seconds, or the fallback if it is not a usable duration
fn seconds_or(name: &str, seconds: f32, fallback: Duration) -> Duration {
    Duration::try_from_secs_f32(seconds).unwrap_or_else(|e| {
        warn!("Ignoring {name}={seconds}: {e}");
        fallback
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unusable_periods_fall_back() {
        let fallback = Duration::from_secs(30);
        assert_eq!(seconds_or("TEST", 2.5, fallback), Duration::from_millis(2500));
        assert_eq!(seconds_or("TEST", f32::INFINITY, fallback), fallback);
        assert_eq!(seconds_or("TEST", f32::NAN, fallback), fallback);
        assert_eq!(seconds_or("TEST", -1.0, fallback), fallback);
    }
}
