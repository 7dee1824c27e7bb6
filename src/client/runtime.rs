//! Runs a [`Context`] on tokio sockets.
//!
//! Three tasks serve the whole client: one receiving on the search socket,
//! one carrying out the engine's network requests, and one sleeping until
//! the engine's next deadline. Every circuit gets one more task of its own,
//! reading and writing its stream.

use std::{
    collections::HashMap,
    future,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream, UdpSocket,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{Notify, mpsc},
    task::JoinHandle,
    time,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::{
    ClientError, EngineConfig,
    channel::{ChannelId, ChannelInfo, IoId},
    circuit::{CircuitId, DisconnectCause},
    context::Context,
    engine::IoRequest,
    events::{EventHandler, Notification},
};
use crate::{messages::MonitorMask, utils::new_search_socket, wire::WIRE_BUFFER_CAPACITY};

pub struct ClientBuilder {
    config: EngineConfig,
    handler: Option<Arc<dyn EventHandler>>,
    stop_token: CancellationToken,
    search_bind_port: u16,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        ClientBuilder {
            config: EngineConfig::from_env(),
            handler: None,
            stop_token: CancellationToken::new(),
            search_bind_port: 0,
        }
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        ClientBuilder::default()
    }
    /// Replace the environment-derived configuration wholesale
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }
    pub fn search_destinations(mut self, addresses: Vec<SocketAddr>) -> Self {
        self.config.search_destinations = addresses;
        self
    }
    pub fn server_port(mut self, port: u16) -> Self {
        self.config.server_port = port;
        self
    }
    pub fn repeater_port(mut self, port: u16) -> Self {
        self.config.repeater_port = port;
        self
    }
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }
    pub fn max_search_period(mut self, period: Duration) -> Self {
        self.config.max_search_period = period;
        self
    }
    pub fn identity(mut self, client_name: &str, host_name: &str) -> Self {
        self.config.client_name = client_name.to_owned();
        self.config.host_name = host_name.to_owned();
        self
    }
    /// Deliver notifications here instead of through [`Client::notifications`]
    pub fn handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }
    pub fn stop_token(mut self, token: CancellationToken) -> Self {
        self.stop_token = token.child_token();
        self
    }
    /// Local port for the search socket; 0 picks any
    pub fn search_bind_port(mut self, port: u16) -> Self {
        self.search_bind_port = port;
        self
    }

    pub async fn start(self) -> Result<Client, ClientError> {
        let socket = Arc::new(new_search_socket(self.search_bind_port)?);
        debug!("Search socket bound to {}", socket.local_addr()?);
        let (handler, notifications) = match self.handler {
            Some(handler) => (handler, None),
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Arc::new(tx) as Arc<dyn EventHandler>, Some(rx))
            }
        };
        let connection_timeout = self.config.connection_timeout;
        let (context, requests) = Context::new(self.config, handler);
        let cancel = self.stop_token;

        let tasks = vec![
            tokio::spawn(receive_datagrams(
                context.clone(),
                socket.clone(),
                cancel.clone(),
            )),
            tokio::spawn(
                Driver {
                    context: context.clone(),
                    socket,
                    circuits: HashMap::new(),
                    cancel: cancel.clone(),
                    connection_timeout,
                }
                .run(requests),
            ),
            tokio::spawn(run_timers(context.clone(), cancel.clone())),
        ];
        Ok(Client {
            context,
            cancel,
            tasks,
            notifications,
        })
    }
}

/// A running client.
///
/// Notifications queue up until taken with [`Client::notifications`], unless
/// a handler was given to the [`ClientBuilder`].
pub struct Client {
    context: Context,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    notifications: Option<mpsc::UnboundedReceiver<Notification>>,
}

impl Client {
    /// Start a client configured from the environment
    pub async fn new() -> Result<Client, ClientError> {
        ClientBuilder::new().start().await
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Take the notification stream. Only available once, and only when no
    /// handler was installed.
    pub fn notifications(&mut self) -> Option<UnboundedReceiverStream<Notification>> {
        self.notifications.take().map(UnboundedReceiverStream::new)
    }

    pub fn create_channel(&self, name: &str, priority: u32) -> Result<ChannelId, ClientError> {
        self.context.create_channel(name, priority)
    }
    pub fn destroy_channel(&self, channel: ChannelId) -> Result<(), ClientError> {
        self.context.destroy_channel(channel)
    }
    pub fn channel_info(&self, channel: ChannelId) -> Result<ChannelInfo, ClientError> {
        self.context.channel_info(channel)
    }
    pub fn read(&self, channel: ChannelId, data_type: u16, count: u32) -> Result<IoId, ClientError> {
        self.context.read(channel, data_type, count)
    }
    pub fn write(
        &self,
        channel: ChannelId,
        data_type: u16,
        count: u32,
        data: &[u8],
    ) -> Result<(), ClientError> {
        self.context.write(channel, data_type, count, data)
    }
    pub fn write_notify(
        &self,
        channel: ChannelId,
        data_type: u16,
        count: u32,
        data: &[u8],
    ) -> Result<IoId, ClientError> {
        self.context.write_notify(channel, data_type, count, data)
    }
    pub fn subscribe(
        &self,
        channel: ChannelId,
        data_type: u16,
        count: u32,
        mask: MonitorMask,
    ) -> Result<IoId, ClientError> {
        self.context.subscribe(channel, data_type, count, mask)
    }
    pub fn unsubscribe(&self, io: IoId) -> Result<(), ClientError> {
        self.context.unsubscribe(io)
    }
    pub fn reset_circuit(&self, channel: ChannelId) -> Result<(), ClientError> {
        self.context.reset_circuit(channel)
    }
    pub fn flush(&self) {
        self.context.flush()
    }
    /// Bytes queued for servers that no socket has taken yet
    pub fn pending_bytes(&self) -> usize {
        self.context.pending_bytes()
    }

    /// Close every circuit and stop the background tasks
    pub async fn shutdown(mut self) {
        self.context.shutdown();
        // Let the driver see the close requests before it goes
        tokio::task::yield_now().await;
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!("Client task failed: {e}");
            }
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn receive_datagrams(context: Context, socket: Arc<UdpSocket>, cancel: CancellationToken) {
    let mut buffer = vec![0u8; 0xFFFF];
    loop {
        select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buffer) => match result {
                Ok((size, sender)) => context.datagram_received(&buffer[..size], sender),
                Err(e) => error!("Error waiting for search responses: {e}"),
            },
        }
    }
    trace!("Search receiver stopped");
}

async fn run_timers(context: Context, cancel: CancellationToken) {
    loop {
        let deadline = context.next_deadline();
        select! {
            _ = cancel.cancelled() => break,
            _ = context.timers_changed() => continue,
            _ = sleep_until(deadline) => context.process_timers(),
        }
    }
    trace!("Timer task stopped");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(time::Instant::from_std(deadline)).await,
        None => future::pending().await,
    }
}

struct CircuitHandle {
    wake: Arc<Notify>,
    cancel: CancellationToken,
}

/// Carries out the engine's network requests
struct Driver {
    context: Context,
    socket: Arc<UdpSocket>,
    circuits: HashMap<CircuitId, CircuitHandle>,
    cancel: CancellationToken,
    connection_timeout: Duration,
}

impl Driver {
    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<IoRequest>) {
        loop {
            select! {
                _ = self.cancel.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
            }
        }
        for (_, circuit) in self.circuits.drain() {
            circuit.cancel.cancel();
        }
        trace!("Driver stopped");
    }

    async fn handle(&mut self, request: IoRequest) {
        match request {
            IoRequest::Datagram(bytes, destination) => {
                if let Err(e) = self.socket.send_to(&bytes, destination).await {
                    warn!("Could not send datagram to {destination}: {e}");
                }
            }
            IoRequest::Connect(id, address) => {
                let handle = CircuitHandle {
                    wake: Arc::new(Notify::new()),
                    cancel: self.cancel.child_token(),
                };
                tokio::spawn(
                    CircuitTask {
                        context: self.context.clone(),
                        id,
                        address,
                        wake: handle.wake.clone(),
                        cancel: handle.cancel.clone(),
                        timeout: self.connection_timeout,
                    }
                    .run(),
                );
                self.circuits.insert(id, handle);
            }
            IoRequest::Wake(id) => {
                if let Some(circuit) = self.circuits.get(&id) {
                    circuit.wake.notify_one();
                }
            }
            IoRequest::Close(id) => {
                if let Some(circuit) = self.circuits.remove(&id) {
                    circuit.cancel.cancel();
                }
            }
        }
    }
}

/// Owns one circuit's stream
struct CircuitTask {
    context: Context,
    id: CircuitId,
    address: SocketAddr,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    timeout: Duration,
}

impl CircuitTask {
    async fn run(self) {
        debug!("Connecting circuit to {}", self.address);
        let stream = select! {
            _ = self.cancel.cancelled() => return,
            result = time::timeout(self.timeout, TcpStream::connect(self.address)) => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!("Could not connect to {}: {e}", self.address);
                    self.context.circuit_closed(self.id, DisconnectCause::ConnectFailed);
                    return;
                }
                Err(_) => {
                    warn!("Timed out connecting to {}", self.address);
                    self.context.circuit_closed(self.id, DisconnectCause::ConnectFailed);
                    return;
                }
            },
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle on {}: {e}", self.address);
        }
        self.context.circuit_connected(self.id);
        let (mut reader, mut writer) = stream.into_split();
        let cause = select! {
            _ = self.cancel.cancelled() => None,
            cause = self.read_loop(&mut reader) => Some(cause),
            cause = self.write_loop(&mut writer) => Some(cause),
        };
        if let Some(cause) = cause {
            self.context.circuit_closed(self.id, cause);
        }
        trace!("Circuit task for {} finished", self.address);
    }

    async fn read_loop(&self, reader: &mut OwnedReadHalf) -> DisconnectCause {
        let mut buffer = vec![0u8; WIRE_BUFFER_CAPACITY];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) => return DisconnectCause::PeerClosed,
                // A full buffer means the socket probably has more waiting
                Ok(n) => self
                    .context
                    .circuit_received(self.id, &buffer[..n], n == buffer.len()),
                Err(e) => {
                    debug!("Read from {} failed: {e}", self.address);
                    return DisconnectCause::IoError;
                }
            }
        }
    }

    async fn write_loop(&self, writer: &mut OwnedWriteHalf) -> DisconnectCause {
        loop {
            self.wake.notified().await;
            loop {
                let labor = self.context.send_labor(self.id);
                if !labor.bytes.is_empty() {
                    match time::timeout(self.timeout, writer.write_all(&labor.bytes)).await {
                        Ok(Ok(())) => trace!("Sent {} bytes to {}", labor.bytes.len(), self.address),
                        Ok(Err(e)) => {
                            debug!("Write to {} failed: {e}", self.address);
                            return DisconnectCause::IoError;
                        }
                        Err(_) => {
                            warn!("Send to {} timed out", self.address);
                            return DisconnectCause::SendTimeout;
                        }
                    }
                }
                if labor.shutdown {
                    if let Err(e) = writer.shutdown().await {
                        debug!("Shutdown of {} failed: {e}", self.address);
                    }
                    // The reader finishes the job when the peer closes
                    return future::pending().await;
                }
                if !labor.more {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt;
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::fmt::TestWriter;

    use super::*;
    use crate::messages::parse_search_packet;

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(LevelFilter::TRACE)
            .with_writer(TestWriter::new())
            .try_init();
    }

    fn config(destinations: Vec<SocketAddr>) -> EngineConfig {
        EngineConfig {
            search_destinations: destinations,
            client_name: "tester".to_owned(),
            host_name: "testhost".to_owned(),
            // Keep registration traffic away from anything real
            repeater_port: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn searches_reach_the_destination() {
        init_logging();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = ClientBuilder::new()
            .config(config(vec![server.local_addr().unwrap()]))
            .start()
            .await
            .unwrap();
        client.create_channel("PV:SEARCHED", 0).unwrap();

        let mut buffer = vec![0u8; 0xFFFF];
        let (size, _) = time::timeout(Duration::from_secs(5), server.recv_from(&mut buffer))
            .await
            .expect("no search arrived")
            .unwrap();
        let searches = parse_search_packet(&buffer[..size]).unwrap();
        assert_eq!(searches[0].channel_name, "PV:SEARCHED");
        client.shutdown().await;
    }

    #[tokio::test]
    async fn refused_connection_goes_back_to_searching() {
        init_logging();
        // Find a port with nothing listening on it
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut client = ClientBuilder::new()
            .config(config(vec![server.local_addr().unwrap()]))
            .start()
            .await
            .unwrap();
        let mut notifications = client.notifications().unwrap();
        let channel = client.create_channel("PV:REFUSED", 0).unwrap();
        let cid = client.channel_info(channel).unwrap().cid;

        let mut buffer = vec![0u8; 0xFFFF];
        let (_, source) = server.recv_from(&mut buffer).await.unwrap();
        let reply = crate::messages::AsBytes::as_bytes(&crate::messages::SearchResponse {
            port_number: port,
            search_id: cid,
            server_ip: None,
            protocol_version: Some(13),
        });
        server.send_to(&reply, source).await.unwrap();

        // Never connected, so nothing to announce; the channel lands in the governor
        let deadline = time::Instant::now() + Duration::from_secs(5);
        loop {
            let circuits = client.context().with_state(|state| state.circuit_count());
            let info = client.channel_info(channel).unwrap();
            if circuits == 0 && info.server_address.is_some() {
                break;
            }
            assert!(time::Instant::now() < deadline, "circuit never failed");
            time::sleep(Duration::from_millis(10)).await;
        }
        assert!(
            time::timeout(Duration::from_millis(50), notifications.next())
                .await
                .is_err()
        );
        client.shutdown().await;
    }
}
