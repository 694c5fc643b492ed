use num::{One, traits::WrappingAdd};
use pnet::datalink;
use socket2::{Domain, Protocol, Type};
use std::{
    env,
    io,
    net::{SocketAddr, ToSocketAddrs},
    str::FromStr,
};
use tracing::{debug, warn};

/// Bind a UDP socket that other processes on this host may also bind.
///
/// Returned as a std socket so that it can be created outside of the runtime
/// that eventually drives it.
pub(crate) fn new_reusable_udp_socket<T: ToSocketAddrs>(
    address: T,
) -> io::Result<std::net::UdpSocket> {
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    let addr = address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "No address to bind"))?;
    socket.bind(&addr.into())?;
    Ok(std::net::UdpSocket::from(socket))
}

/// Increments a mutable reference in place, and returns the original value
pub(crate) fn wrapping_inplace_add<T: WrappingAdd + One + Copy>(value: &mut T) -> T {
    let id = *value;
    *value = value.wrapping_add(&T::one());
    id
}

/// Read and parse an environment variable, ignoring it if malformed
fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let value = env::var(name).ok()?;
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring unparseable {name}='{value}'");
            None
        }
    }
}

/// Get the server listen port, either from environment or default 5064
pub fn get_default_server_port() -> u16 {
    env_parse("EPICS_CA_SERVER_PORT")
        .unwrap_or(5064u16)
        .max(5000u16)
}

/// Get the beacon broadcast port, either from environment or default 5065
pub fn get_default_beacon_port() -> u16 {
    env_parse("EPICS_CA_REPEATER_PORT")
        .unwrap_or(5065u16)
        .max(5000u16)
}

/// Get the target list of broadcast IPs, by reading the environment and interfaces
///
/// Hostnames are resolved if in the environment setting, so this will re-resolve
pub fn get_target_broadcast_ips(default_search_port: u16) -> Vec<SocketAddr> {
    let mut ips = Vec::new();
    // Work out if we want to automatically include all local broadcast
    let use_auto_address = env::var("EPICS_CA_AUTO_ADDR_LIST")
        .map(|v| !v.eq_ignore_ascii_case("no"))
        .unwrap_or(true);
    if use_auto_address {
        ips.extend(
            datalink::interfaces()
                .into_iter()
                .filter(|i| !i.is_loopback())
                .flat_map(|i| i.ips.into_iter())
                .filter(|i| i.is_ipv4())
                .flat_map(|f| (f.broadcast(), default_search_port).to_socket_addrs())
                .flatten(),
        );
    }
    if let Ok(addr_list) = env::var("EPICS_CA_ADDR_LIST") {
        ips.extend(parse_address_list(&addr_list, default_search_port));
    }
    ips
}

/// Resolve a whitespace-separated list of `host[:port]` entries
pub fn parse_address_list(addr_list: &str, default_port: u16) -> Vec<SocketAddr> {
    let mut ips = Vec::new();
    for add in addr_list.split_ascii_whitespace() {
        let resolved = if add.contains(':') {
            add.to_socket_addrs()
        } else {
            (add, default_port).to_socket_addrs()
        };
        match resolved {
            Ok(addr) => {
                let addr: Vec<_> = addr.collect();
                debug!("Adding search IP: {add} => {addr:?}");
                ips.extend(addr);
            }
            Err(e) => {
                warn!("Failed to convert '{add}' to address: {e}");
            }
        }
    }
    ips
}

pub fn get_default_connection_timeout() -> f32 {
    env_parse("EPICS_CA_CONN_TMO")
        .unwrap_or(30.0f32)
        .max(0.1f32)
}

pub fn get_default_max_search_interval() -> f32 {
    env_parse("EPICS_CA_MAX_SEARCH_PERIOD")
        .unwrap_or(300.0f32)
        .max(60f32)
}

pub fn get_default_max_array_bytes() -> usize {
    env_parse("EPICS_CA_MAX_ARRAY_BYTES")
        .unwrap_or(16384usize)
        .max(16384usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapping_add() {
        let mut i = 3u32;
        assert_eq!(wrapping_inplace_add(&mut i), 3);
        assert_eq!(i, 4);
        let mut i = u32::MAX;
        assert_eq!(wrapping_inplace_add(&mut i), u32::MAX);
        assert_eq!(i, 0);
    }

    #[test]
    fn address_list_ports() {
        let addrs = parse_address_list("127.0.0.1 127.0.0.2:6000", 5064);
        assert_eq!(
            addrs,
            vec![
                "127.0.0.1:5064".parse().unwrap(),
                "127.0.0.2:6000".parse().unwrap()
            ]
        );
    }
}
