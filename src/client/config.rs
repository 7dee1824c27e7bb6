use std::{net::SocketAddr, time::Duration};

use crate::{
    utils::{
        get_default_connection_timeout, get_default_max_array_bytes,
        get_default_max_search_interval, get_default_repeater_port, get_default_server_port,
        get_target_broadcast_ips,
    },
    wire::WIRE_BUFFER_CAPACITY,
};

/// Everything the engine needs to know, read once at startup
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Port servers listen on for searches and circuits
    pub server_port: u16,
    /// Port of the local beacon repeater
    pub repeater_port: u16,
    /// Where search datagrams are sent
    pub search_destinations: Vec<SocketAddr>,
    /// Idle time on a circuit before an echo is sent
    pub connection_timeout: Duration,
    /// Ceiling on the period of the slowest search rung
    pub max_search_period: Duration,
    /// Largest inbound payload accepted on a circuit
    pub max_array_bytes: usize,
    /// How long an echo may go unanswered
    pub echo_timeout: Duration,
    pub max_datagram_size: usize,
    /// Socket reads with more data still waiting before the server is asked to slow down
    pub max_contiguous_frames: u32,
    pub governor_period: Duration,
    /// Channels released from the disconnect governor per tick
    pub governor_batch: usize,
    /// Committed bytes a circuit may hold before callers must flush
    pub send_queue_budget: usize,
    /// Cap on wire buffers across all queues
    pub buffer_pool_limit: Option<usize>,
    pub repeater_period: Duration,
    pub repeater_warn_after: u32,
    pub client_name: String,
    pub host_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let client_name = whoami::username();
        let host_name = whoami::fallible::hostname().unwrap_or_else(|_| client_name.clone());
        EngineConfig {
            server_port: 5064,
            repeater_port: 5065,
            search_destinations: Vec::new(),
            connection_timeout: Duration::from_secs(30),
            max_search_period: Duration::from_secs(300),
            max_array_bytes: 16384,
            echo_timeout: Duration::from_secs(5),
            max_datagram_size: 1024,
            max_contiguous_frames: 10,
            governor_period: Duration::from_secs(1),
            governor_batch: 64,
            send_queue_budget: 64 * WIRE_BUFFER_CAPACITY,
            buffer_pool_limit: None,
            repeater_period: Duration::from_secs(1),
            repeater_warn_after: 50,
            client_name,
            host_name,
        }
    }
}

impl EngineConfig {
    /// Build from the `EPICS_CA_*` environment
    pub fn from_env() -> Self {
        let server_port = get_default_server_port();
        EngineConfig {
            server_port,
            repeater_port: get_default_repeater_port(),
            search_destinations: get_target_broadcast_ips(server_port),
            connection_timeout: get_default_connection_timeout(),
            max_search_period: get_default_max_search_interval(),
            max_array_bytes: get_default_max_array_bytes(),
            ..Default::default()
        }
    }
}
