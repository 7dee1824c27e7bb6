use num::{FromPrimitive, traits::WrappingAdd};
use pnet::datalink;
use socket2::{Domain, Protocol, Type};
use std::{
    env,
    io::{self},
    net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs},
    time::Duration,
};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

pub fn new_reusable_udp_socket<T: ToSocketAddrs>(address: T) -> io::Result<UdpSocket> {
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    let addr = address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "No address to bind"))?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(std::net::UdpSocket::from(socket))
}

/// Bind the single search socket: broadcast capable, ephemeral port
pub(crate) fn new_search_socket(port: u16) -> io::Result<UdpSocket> {
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    UdpSocket::from_std(std::net::UdpSocket::from(socket))
}

/// Increments a mutable reference in place, and returns the original value
pub(crate) fn wrapping_inplace_add<T: WrappingAdd + FromPrimitive + Copy>(value: &mut T) -> T {
    let id = *value;
    if let Some(one) = T::from_u8(1) {
        *value = value.wrapping_add(&one);
    }
    id
}

/// The first IPv4 address of a non-loopback interface, if there is one
pub fn get_local_ipv4() -> Option<Ipv4Addr> {
    datalink::interfaces()
        .into_iter()
        .filter(|i| !i.is_loopback() && i.is_up())
        .flat_map(|i| i.ips.into_iter())
        .find_map(|ip| match ip.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
}

/// Get the server listen port, either from environment or default 5064
pub fn get_default_server_port() -> u16 {
    env::var("EPICS_CA_SERVER_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(5064u16)
        .max(5000u16)
}

/// Get the repeater (beacon) port, either from environment or default 5065
pub fn get_default_repeater_port() -> u16 {
    env::var("EPICS_CA_REPEATER_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(5065u16)
        .max(5000u16)
}

/// Whether interface broadcast addresses join the search list
pub fn get_auto_address_list() -> bool {
    env::var("EPICS_CA_AUTO_ADDR_LIST")
        .map(|v| !v.eq_ignore_ascii_case("no"))
        .unwrap_or(true)
}

/// Broadcast addresses of every non-loopback IPv4 interface
pub fn get_interface_broadcast_ips(default_search_port: u16) -> Vec<SocketAddr> {
    datalink::interfaces()
        .into_iter()
        .filter(|i| !i.is_loopback())
        .flat_map(|i| i.ips.into_iter())
        .filter(|i| i.is_ipv4())
        .map(|f| SocketAddr::new(f.broadcast(), default_search_port))
        .collect()
}

/// Parse an address list of `host` or `host:port` entries
///
/// Hostnames are resolved, so calling this again will re-resolve
pub fn parse_address_list(addr_list: &str, default_search_port: u16) -> Vec<SocketAddr> {
    let mut ips = Vec::new();
    for add in addr_list.split_ascii_whitespace() {
        let resolved = if add.contains(':') {
            add.to_socket_addrs()
        } else {
            (add, default_search_port).to_socket_addrs()
        };
        match resolved {
            Ok(addr) => {
                debug!("Adding search IP: {add} => {addr:?}");
                ips.extend(addr.filter(|a| a.is_ipv4()));
            }
            Err(e) => {
                warn!("Failed to convert '{add}' to address: {e}");
                continue;
            }
        }
    }
    ips
}

/// Get the target list of search IPs, by reading the environment and interfaces
pub fn get_target_broadcast_ips(default_search_port: u16) -> Vec<SocketAddr> {
    let mut ips = Vec::new();
    if get_auto_address_list() {
        ips.extend(get_interface_broadcast_ips(default_search_port));
    }
    // The user might have explicitly requested some
    if let Ok(addr_list) = env::var("EPICS_CA_ADDR_LIST") {
        ips.extend(parse_address_list(&addr_list, default_search_port));
    }
    ips.dedup();
    ips
}

fn env_seconds(name: &str, default: f32, minimum: f32) -> Duration {
    let seconds = env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
        .max(minimum);
    Duration::from_secs_f32(seconds)
}

pub fn get_default_connection_timeout() -> Duration {
    env_seconds("EPICS_CA_CONN_TMO", 30.0, 0.1)
}

pub fn get_default_max_search_interval() -> Duration {
    env_seconds("EPICS_CA_MAX_SEARCH_PERIOD", 300.0, 60.0)
}

/// Largest array payload a peer may send us
pub fn get_default_max_array_bytes() -> usize {
    env::var("EPICS_CA_MAX_ARRAY_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(16384)
        .max(16384)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_add_returns_previous() {
        let mut value = u32::MAX;
        assert_eq!(wrapping_inplace_add(&mut value), u32::MAX);
        assert_eq!(value, 0);
        assert_eq!(wrapping_inplace_add(&mut value), 0);
        assert_eq!(value, 1);
    }

    #[test]
    fn address_list_entries() {
        let ips = parse_address_list("127.0.0.1 10.0.0.255:6000", 5064);
        assert_eq!(
            ips,
            vec![
                "127.0.0.1:5064".parse::<SocketAddr>().unwrap(),
                "10.0.0.255:6000".parse().unwrap()
            ]
        );
    }
}
