//! A virtual circuit: the TCP connection to one server at one priority.
//!
//! The circuit owns its queues and the channels it hosts. Channels move
//! through the claim lists in order:
//!
//! - `create_request_pending`: known to be hosted here, claim not yet sent
//! - `create_response_pending`: claim sent, waiting for the server's id
//! - `subscription_request_pending`: claimed, deferred requests to replay
//! - `connected`
//!
//! The receive watchdog sends an echo once the circuit has been idle for the
//! connection timeout, and gives up on it if the echo goes unanswered.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    time::{Duration, Instant},
};

use slotmap::new_key_type;
use tracing::{debug, trace};

use super::{
    EngineConfig,
    channel::{ChannelId, ChannelTable, CircuitList, Membership},
};
use crate::{
    messages::{
        CA_MINOR_PROTOCOL_REVISION, CAMessage, ClearChannel, ClientName, CreateChannel, Echo,
        EventAdd, EventCancel, EventsOff, EventsOn, HostName, MonitorMask, RawMessage, ReadNotify,
        ReadSync, Version, Write, WriteNotify, is_v41, is_v43, is_v44,
    },
    wire::{BufferPool, FrameAssembler, FrameError, QueueError, ReceiveQueue, SendQueue},
};

new_key_type! {
    /// Handle to a circuit; stale once the circuit has been torn down
    pub struct CircuitId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Connecting,
    Connected,
    /// No channels left; flushing before closing our side
    CleanShutdown,
    Disconnected,
}

/// Why a circuit went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    PeerClosed,
    IoError,
    ProtocolViolation,
    /// An echo went unanswered
    Unresponsive,
    SendTimeout,
    ConnectFailed,
    /// Asked for by the owner; channels skip the disconnect governor
    UserRequest,
    /// The whole client is going away
    Shutdown,
    /// An idle circuit finished closing, or ran out of time to
    CleanShutdown,
}

/// What the receive watchdog wants done when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    SendEcho,
    Teardown,
}

#[derive(Debug)]
pub struct VirtualCircuit {
    pub address: SocketAddr,
    pub priority: u8,
    pub state: CircuitState,
    /// Minor protocol revision of the server
    pub minor_version: u16,
    create_request_pending: VecDeque<ChannelId>,
    create_response_pending: VecDeque<ChannelId>,
    subscription_request_pending: VecDeque<ChannelId>,
    connected: VecDeque<ChannelId>,
    send_queue: SendQueue,
    recv_queue: ReceiveQueue,
    assembler: FrameAssembler,
    // Flow control
    max_contiguous_frames: u32,
    contiguous_reads: u32,
    busy_detected: bool,
    flow_control_active: bool,
    // Receive watchdog
    connection_timeout: Duration,
    echo_timeout: Duration,
    watchdog_deadline: Option<Instant>,
    echo_pending: bool,
    echo_requested: bool,
    echo_sent_at: Option<Instant>,
    suspect: bool,
    pub last_receive: Option<Instant>,
}

impl VirtualCircuit {
    pub fn new(
        address: SocketAddr,
        priority: u8,
        minor_version: u16,
        pool: &BufferPool,
        config: &EngineConfig,
    ) -> Self {
        VirtualCircuit {
            address,
            priority,
            state: CircuitState::Connecting,
            minor_version,
            create_request_pending: VecDeque::new(),
            create_response_pending: VecDeque::new(),
            subscription_request_pending: VecDeque::new(),
            connected: VecDeque::new(),
            send_queue: SendQueue::new(pool.clone(), config.send_queue_budget),
            recv_queue: ReceiveQueue::new(pool.clone()),
            assembler: FrameAssembler::new(config.max_array_bytes),
            max_contiguous_frames: config.max_contiguous_frames.max(1),
            contiguous_reads: 0,
            busy_detected: false,
            flow_control_active: false,
            connection_timeout: config.connection_timeout,
            echo_timeout: config.echo_timeout,
            watchdog_deadline: None,
            echo_pending: false,
            echo_requested: false,
            echo_sent_at: None,
            suspect: false,
            last_receive: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == CircuitState::Connected
    }

    /// Whether requests may still be queued on this circuit
    pub fn is_open(&self) -> bool {
        matches!(self.state, CircuitState::Connecting | CircuitState::Connected)
    }

    fn list(&self, list: CircuitList) -> &VecDeque<ChannelId> {
        match list {
            CircuitList::CreateRequestPending => &self.create_request_pending,
            CircuitList::CreateResponsePending => &self.create_response_pending,
            CircuitList::SubscriptionRequestPending => &self.subscription_request_pending,
            CircuitList::Connected => &self.connected,
        }
    }

    fn list_mut(&mut self, list: CircuitList) -> &mut VecDeque<ChannelId> {
        match list {
            CircuitList::CreateRequestPending => &mut self.create_request_pending,
            CircuitList::CreateResponsePending => &mut self.create_response_pending,
            CircuitList::SubscriptionRequestPending => &mut self.subscription_request_pending,
            CircuitList::Connected => &mut self.connected,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.create_request_pending.len()
            + self.create_response_pending.len()
            + self.subscription_request_pending.len()
            + self.connected.len()
    }

    /// Every hosted channel, with the list it is in
    pub fn members(&self) -> Vec<(ChannelId, CircuitList)> {
        [
            CircuitList::CreateRequestPending,
            CircuitList::CreateResponsePending,
            CircuitList::SubscriptionRequestPending,
            CircuitList::Connected,
        ]
        .into_iter()
        .flat_map(|list| self.list(list).iter().map(move |id| (*id, list)))
        .collect()
    }

    /// Adopt a channel; its claim goes out with the next send labor
    pub fn install_channel(&mut self, id: CircuitId, channels: &mut ChannelTable, channel: ChannelId) {
        self.create_request_pending.push_back(channel);
        channels.set_membership(
            channel,
            Membership::Circuit(id, CircuitList::CreateRequestPending),
        );
    }

    /// Move a channel to another list, at the back
    pub fn move_channel(
        &mut self,
        id: CircuitId,
        channels: &mut ChannelTable,
        channel: ChannelId,
        from: CircuitList,
        to: CircuitList,
    ) {
        if self.remove_channel(channel, from) {
            self.list_mut(to).push_back(channel);
            channels.set_membership(channel, Membership::Circuit(id, to));
        }
    }

    pub fn remove_channel(&mut self, channel: ChannelId, from: CircuitList) -> bool {
        let list = self.list_mut(from);
        let before = list.len();
        list.retain(|c| *c != channel);
        before != list.len()
    }

    /// Take every hosted channel away, for teardown
    pub fn drain_channels(&mut self) -> Vec<ChannelId> {
        let mut all: Vec<_> = self.create_request_pending.drain(..).collect();
        all.extend(self.create_response_pending.drain(..));
        all.extend(self.subscription_request_pending.drain(..));
        all.extend(self.connected.drain(..));
        all
    }

    pub(crate) fn pop_create_request(&mut self) -> Option<ChannelId> {
        self.create_request_pending.pop_front()
    }
    pub(crate) fn unpop_create_request(&mut self, channel: ChannelId) {
        self.create_request_pending.push_front(channel);
    }
    pub(crate) fn pop_subscription_request(&mut self) -> Option<ChannelId> {
        self.subscription_request_pending.pop_front()
    }
    pub(crate) fn unpop_subscription_request(&mut self, channel: ChannelId) {
        self.subscription_request_pending.push_front(channel);
    }
    pub(crate) fn push_list(&mut self, list: CircuitList, channel: ChannelId) {
        self.list_mut(list).push_back(channel);
    }

    /// The socket is up: introduce ourselves and arm the watchdog
    pub fn connected(
        &mut self,
        now: Instant,
        client_name: &str,
        host_name: &str,
    ) -> Result<(), QueueError> {
        self.state = CircuitState::Connected;
        self.watchdog_deadline = Some(now + self.connection_timeout);
        self.push(
            &Version {
                priority: self.priority as u16,
                protocol_version: CA_MINOR_PROTOCOL_REVISION,
            }
            .to_raw(),
        )?;
        if is_v41(self.minor_version) {
            self.push(
                &ClientName {
                    name: client_name.to_owned(),
                }
                .to_raw(),
            )?;
            self.push(
                &HostName {
                    name: host_name.to_owned(),
                }
                .to_raw(),
            )?;
        }
        debug!("Circuit to {} connected", self.address);
        Ok(())
    }

    fn push(&mut self, message: &RawMessage) -> Result<(), QueueError> {
        self.send_queue.push_message(message, self.minor_version)
    }

    pub fn create_channel_request(
        &mut self,
        cid: u32,
        sid: Option<u32>,
        name: &str,
    ) -> Result<(), QueueError> {
        let message = if is_v44(self.minor_version) {
            CreateChannel {
                client_id: cid,
                protocol_version: CA_MINOR_PROTOCOL_REVISION as u32,
                channel_name: name.to_owned(),
            }
        } else {
            // Older servers already assigned an id when answering the search
            CreateChannel {
                client_id: sid.unwrap_or(cid),
                protocol_version: CA_MINOR_PROTOCOL_REVISION as u32,
                channel_name: String::new(),
            }
        };
        self.push(&message.to_raw())
    }

    pub fn clear_channel_request(&mut self, sid: u32, cid: u32) -> Result<(), QueueError> {
        self.push(
            &ClearChannel {
                server_id: sid,
                client_id: cid,
            }
            .to_raw(),
        )
    }

    pub fn read_notify_request(
        &mut self,
        sid: u32,
        ioid: u32,
        data_type: u16,
        count: u32,
    ) -> Result<(), QueueError> {
        self.push(
            &ReadNotify {
                data_type,
                data_count: count,
                server_id: sid,
                client_ioid: ioid,
            }
            .to_raw(),
        )
    }

    pub fn write_request(
        &mut self,
        sid: u32,
        cid: u32,
        data_type: u16,
        count: u32,
        data: &[u8],
    ) -> Result<(), QueueError> {
        self.push(
            &Write {
                data_type,
                data_count: count,
                server_id: sid,
                client_id: cid,
                data: data.to_vec(),
            }
            .to_raw(),
        )
    }

    pub fn write_notify_request(
        &mut self,
        sid: u32,
        ioid: u32,
        data_type: u16,
        count: u32,
        data: &[u8],
    ) -> Result<(), QueueError> {
        self.push(
            &WriteNotify {
                data_type,
                data_count: count,
                server_id: sid,
                client_ioid: ioid,
                data: data.to_vec(),
            }
            .to_raw(),
        )
    }

    pub fn subscription_request(
        &mut self,
        sid: u32,
        ioid: u32,
        data_type: u16,
        count: u32,
        mask: MonitorMask,
    ) -> Result<(), QueueError> {
        self.push(
            &EventAdd {
                data_type,
                data_count: count,
                server_id: sid,
                subscription_id: ioid,
                mask,
            }
            .to_raw(),
        )
    }

    pub fn subscription_cancel_request(
        &mut self,
        sid: u32,
        ioid: u32,
        data_type: u16,
        count: u32,
    ) -> Result<(), QueueError> {
        self.push(
            &EventCancel {
                data_type,
                data_count: count,
                server_id: sid,
                subscription_id: ioid,
            }
            .to_raw(),
        )
    }

    /// Heartbeat; servers before 4.3 only understand the read-sync form
    pub fn echo_request(&mut self) -> Result<(), QueueError> {
        if is_v43(self.minor_version) {
            self.push(&Echo.to_raw())
        } else {
            self.push(&ReadSync.to_raw())
        }
    }

    pub fn pending_bytes(&self) -> usize {
        self.send_queue.pending_bytes()
    }
    pub fn flush_block_threshold(&self) -> bool {
        self.send_queue.flush_block_threshold()
    }
    pub fn drain_send_queue(&mut self) -> Vec<u8> {
        self.send_queue.drain_committed()
    }
    pub fn discard_queues(&mut self) {
        self.send_queue.clear();
        self.recv_queue.clear();
    }

    /// Whether the sender has anything to do
    pub fn labor_pending(&self) -> bool {
        self.busy_detected != self.flow_control_active
            || self.echo_requested
            || !self.create_request_pending.is_empty()
            || !self.subscription_request_pending.is_empty()
            || !self.send_queue.is_empty()
    }

    pub fn push_received(&mut self, bytes: &[u8]) -> Result<(), QueueError> {
        self.recv_queue.push_bytes(bytes)
    }

    pub fn next_frame(&mut self) -> Result<Option<RawMessage>, FrameError> {
        self.assembler.next_frame(&mut self.recv_queue)
    }

    /// Count socket reads that left more data waiting. Returns true when the
    /// server should be told to change pace.
    pub fn record_read(&mut self, more_pending: bool) -> bool {
        if more_pending {
            if !self.busy_detected {
                self.contiguous_reads += 1;
                if self.contiguous_reads >= self.max_contiguous_frames {
                    debug!("Circuit to {} is falling behind", self.address);
                    self.busy_detected = true;
                    return true;
                }
            }
        } else {
            self.contiguous_reads = 0;
            if self.busy_detected {
                self.busy_detected = false;
                return true;
            }
        }
        false
    }

    /// Tell the server to stop or resume subscription updates, once per change
    pub fn flow_control_labor(&mut self) -> Result<(), QueueError> {
        if self.busy_detected != self.flow_control_active {
            if self.busy_detected {
                self.push(&EventsOff.to_raw())?;
            } else {
                self.push(&EventsOn.to_raw())?;
            }
            self.flow_control_active = self.busy_detected;
            trace!(
                "Flow control {} on {}",
                if self.flow_control_active { "on" } else { "off" },
                self.address
            );
        }
        Ok(())
    }

    pub fn flow_control_active(&self) -> bool {
        self.flow_control_active
    }

    /// Queue the echo the watchdog asked for
    pub fn echo_labor(&mut self) -> Result<(), QueueError> {
        if self.echo_requested {
            self.echo_request()?;
            self.echo_requested = false;
        }
        Ok(())
    }

    /// Any frame proves the circuit is alive, unless we are waiting on an echo
    pub fn message_arrived(&mut self, now: Instant) {
        self.last_receive = Some(now);
        if self.is_connected() && !self.echo_pending {
            self.suspect = false;
            self.watchdog_deadline = Some(now + self.connection_timeout);
        }
    }

    /// The echo came back; returns the round trip
    pub fn echo_response(&mut self, now: Instant) -> Option<Duration> {
        if !self.echo_pending {
            return None;
        }
        self.echo_pending = false;
        self.suspect = false;
        if self.is_connected() {
            self.watchdog_deadline = Some(now + self.connection_timeout);
        }
        self.echo_sent_at
            .take()
            .map(|sent| now.saturating_duration_since(sent))
    }

    pub fn watchdog_expire(&mut self, now: Instant) -> WatchdogAction {
        if self.echo_pending {
            self.watchdog_deadline = None;
            return WatchdogAction::Teardown;
        }
        self.echo_pending = true;
        self.echo_requested = true;
        self.echo_sent_at = Some(now);
        self.watchdog_deadline = Some(now + self.echo_timeout);
        WatchdogAction::SendEcho
    }

    /// The server's beacons are on schedule
    pub fn beacon_alive(&mut self, now: Instant) {
        if self.is_connected() && !self.suspect && !self.echo_pending {
            self.watchdog_deadline = Some(now + self.connection_timeout);
        }
    }

    /// The server's beacons changed pace; probe the circuit rather than trust them
    pub fn beacon_suspect(&mut self, now: Instant) {
        self.suspect = true;
        if self.is_connected() && !self.echo_pending {
            self.watchdog_deadline = Some(self.watchdog_deadline.map_or(now, |d| d.min(now)));
        }
    }

    pub fn is_suspect(&self) -> bool {
        self.suspect
    }
    pub fn echo_pending(&self) -> bool {
        self.echo_pending
    }

    /// Stop taking new work and give the close until the connection timeout
    pub fn begin_shutdown(&mut self, now: Instant) {
        self.state = CircuitState::CleanShutdown;
        self.echo_requested = false;
        self.watchdog_deadline = Some(now + self.connection_timeout);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            CircuitState::Connected | CircuitState::CleanShutdown => self.watchdog_deadline,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        messages::{Command, EventsOff, EventsOn},
        wire::WIRE_BUFFER_CAPACITY,
    };
    use slotmap::SlotMap;

    fn config() -> EngineConfig {
        EngineConfig {
            max_contiguous_frames: 2,
            connection_timeout: Duration::from_secs(30),
            echo_timeout: Duration::from_secs(5),
            client_name: "tester".to_owned(),
            host_name: "testhost".to_owned(),
            ..Default::default()
        }
    }

    fn circuit(minor: u16) -> VirtualCircuit {
        let pool = BufferPool::new(WIRE_BUFFER_CAPACITY, None);
        VirtualCircuit::new("127.0.0.1:5064".parse().unwrap(), 0, minor, &pool, &config())
    }

    /// Split drained bytes back into their commands
    fn commands(bytes: &[u8]) -> Vec<u16> {
        let mut rest = bytes;
        let mut found = Vec::new();
        while !rest.is_empty() {
            let (remaining, message) = RawMessage::parse(rest).unwrap();
            found.push(message.command);
            rest = remaining;
        }
        found
    }

    #[test]
    fn shutdown_is_bounded_by_the_connection_timeout() {
        let mut vc = circuit(13);
        let now = Instant::now();
        vc.connected(now, "tester", "testhost").unwrap();
        let later = now + Duration::from_secs(12);
        vc.begin_shutdown(later);
        assert_eq!(vc.state, CircuitState::CleanShutdown);
        assert!(!vc.is_open());
        assert_eq!(vc.next_deadline(), Some(later + Duration::from_secs(30)));
    }

    #[test]
    fn introduces_itself_on_connect() {
        let mut vc = circuit(13);
        assert_eq!(vc.next_deadline(), None);
        let now = Instant::now();
        vc.connected(now, "tester", "testhost").unwrap();
        assert_eq!(vc.next_deadline(), Some(now + Duration::from_secs(30)));
        assert_eq!(
            commands(&vc.drain_send_queue()),
            vec![
                Command::Version as u16,
                Command::ClientName as u16,
                Command::HostName as u16
            ]
        );

        // Servers before 4.1 do not take names
        let mut old = circuit(0);
        old.connected(now, "tester", "testhost").unwrap();
        assert_eq!(commands(&old.drain_send_queue()), vec![Command::Version as u16]);
    }

    #[test]
    fn flow_control_is_sent_once_per_change() {
        let mut vc = circuit(13);
        vc.connected(Instant::now(), "tester", "testhost").unwrap();
        vc.drain_send_queue();

        assert!(!vc.record_read(true));
        assert!(vc.record_read(true));
        vc.flow_control_labor().unwrap();
        assert!(!vc.record_read(true));
        vc.flow_control_labor().unwrap();
        assert_eq!(commands(&vc.drain_send_queue()), vec![EventsOff::COMMAND as u16]);
        assert!(vc.flow_control_active());

        assert!(vc.record_read(false));
        vc.flow_control_labor().unwrap();
        vc.flow_control_labor().unwrap();
        assert_eq!(commands(&vc.drain_send_queue()), vec![EventsOn::COMMAND as u16]);
        assert!(!vc.labor_pending());
    }

    #[test]
    fn heartbeat_depends_on_version() {
        let mut vc = circuit(13);
        vc.echo_request().unwrap();
        let mut old = circuit(2);
        old.echo_request().unwrap();
        assert_eq!(commands(&vc.drain_send_queue()), vec![Command::Echo as u16]);
        assert_eq!(commands(&old.drain_send_queue()), vec![Command::ReadSync as u16]);
    }

    #[test]
    fn claims_depend_on_version() {
        let mut vc = circuit(13);
        vc.create_channel_request(7, None, "NAME").unwrap();
        let bytes = vc.drain_send_queue();
        let (_, claim) = RawMessage::parse(&bytes).unwrap();
        assert_eq!(claim.field_3_parameter_1, 7);
        assert_eq!(claim.field_4_parameter_2, 13);
        assert_eq!(claim.payload_as_string(), "NAME");

        let mut old = circuit(3);
        old.create_channel_request(7, Some(99), "NAME").unwrap();
        let bytes = old.drain_send_queue();
        let (_, claim) = RawMessage::parse(&bytes).unwrap();
        assert_eq!(claim.field_3_parameter_1, 99);
        assert!(claim.payload.is_empty());
    }

    #[test]
    fn watchdog_probes_then_gives_up() {
        let mut vc = circuit(13);
        let start = Instant::now();
        vc.connected(start, "tester", "testhost").unwrap();
        vc.drain_send_queue();

        // Traffic pushes the deadline out
        let later = start + Duration::from_secs(10);
        vc.message_arrived(later);
        let deadline = vc.next_deadline().unwrap();
        assert_eq!(deadline, later + Duration::from_secs(30));

        assert_eq!(vc.watchdog_expire(deadline), WatchdogAction::SendEcho);
        assert!(vc.labor_pending());
        vc.echo_labor().unwrap();
        assert_eq!(commands(&vc.drain_send_queue()), vec![Command::Echo as u16]);
        assert_eq!(vc.next_deadline(), Some(deadline + Duration::from_secs(5)));

        // Other traffic does not count as an answer
        vc.message_arrived(deadline + Duration::from_secs(1));
        assert_eq!(vc.next_deadline(), Some(deadline + Duration::from_secs(5)));

        let rtt = vc.echo_response(deadline + Duration::from_secs(2));
        assert_eq!(rtt, Some(Duration::from_secs(2)));
        assert!(!vc.echo_pending());

        // A second probe that goes unanswered ends the circuit
        let deadline = vc.next_deadline().unwrap();
        assert_eq!(vc.watchdog_expire(deadline), WatchdogAction::SendEcho);
        assert_eq!(
            vc.watchdog_expire(deadline + Duration::from_secs(5)),
            WatchdogAction::Teardown
        );
    }

    #[test]
    fn suspect_circuits_ignore_beacons() {
        let mut vc = circuit(13);
        let start = Instant::now();
        vc.connected(start, "tester", "testhost").unwrap();

        vc.beacon_alive(start + Duration::from_secs(20));
        assert_eq!(vc.next_deadline(), Some(start + Duration::from_secs(50)));

        let anomaly = start + Duration::from_secs(25);
        vc.beacon_suspect(anomaly);
        assert!(vc.is_suspect());
        assert_eq!(vc.next_deadline(), Some(anomaly));
        vc.beacon_alive(anomaly + Duration::from_secs(1));
        assert_eq!(vc.next_deadline(), Some(anomaly));

        // Only the echo round trip clears suspicion
        assert_eq!(vc.watchdog_expire(anomaly), WatchdogAction::SendEcho);
        vc.echo_response(anomaly + Duration::from_millis(10));
        assert!(!vc.is_suspect());
    }

    #[test]
    fn channel_lists() {
        let mut ids: SlotMap<CircuitId, ()> = SlotMap::with_key();
        let id = ids.insert(());
        let mut channels = ChannelTable::default();
        let a = channels.insert("A", 0);
        let b = channels.insert("B", 0);
        let mut vc = circuit(13);
        vc.install_channel(id, &mut channels, a);
        vc.install_channel(id, &mut channels, b);
        assert_eq!(vc.channel_count(), 2);
        assert!(vc.labor_pending());

        vc.move_channel(
            id,
            &mut channels,
            a,
            CircuitList::CreateRequestPending,
            CircuitList::Connected,
        );
        assert_eq!(
            channels.get(a).unwrap().membership,
            Membership::Circuit(id, CircuitList::Connected)
        );
        // Moving from the wrong list is a no-op
        vc.move_channel(
            id,
            &mut channels,
            b,
            CircuitList::Connected,
            CircuitList::CreateResponsePending,
        );
        assert_eq!(
            vc.members(),
            vec![
                (b, CircuitList::CreateRequestPending),
                (a, CircuitList::Connected)
            ]
        );
        assert_eq!(vc.drain_channels(), vec![b, a]);
        assert_eq!(vc.channel_count(), 0);
    }
}
