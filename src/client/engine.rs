//! The engine state: every channel, request, circuit and timer, with the
//! transitions between them.
//!
//! Nothing in here touches a socket or a clock. Callers pass the current
//! time in and collect what has to happen on the network, and what the
//! owner should be told, from [`Effects`].

use std::{
    collections::HashMap,
    net::SocketAddr,
    time::Instant,
};

use slotmap::SlotMap;
use tracing::{debug, error, trace, warn};

use super::{
    ClientError, EngineConfig, MAX_PRIORITY,
    beacon::BeaconTable,
    channel::{
        ChannelId, ChannelInfo, ChannelState, ChannelTable, CircuitList, IoId, IoKind, IoRecord,
        IoTable, Membership,
    },
    circuit::{CircuitId, CircuitState, DisconnectCause, VirtualCircuit, WatchdogAction},
    events::Notification,
    iiu::{Iiu, IoUnit},
    search::SearchDatagram,
    udp::SearchUnit,
};
use crate::{
    dbr::DbrType,
    messages::{Access, ErrorCondition, MessageError, MonitorMask, is_v41, is_v42},
    utils::get_local_ipv4,
    wire::{BufferPool, QueueError, WIRE_BUFFER_CAPACITY},
};

/// Network work the engine wants done
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoRequest {
    /// Send from the search socket
    Datagram(Vec<u8>, SocketAddr),
    /// Open a circuit, and report back when it is up
    Connect(CircuitId, SocketAddr),
    /// The circuit has something to send
    Wake(CircuitId),
    /// The circuit is gone; drop its socket
    Close(CircuitId),
}

/// Everything a state transition wants to happen once the lock is released
#[derive(Debug, Default)]
pub struct Effects {
    pub notifications: Vec<Notification>,
    pub io: Vec<IoRequest>,
}

impl Effects {
    pub fn notify(&mut self, notification: Notification) {
        self.notifications.push(notification);
    }

    pub fn wake(&mut self, circuit: CircuitId) {
        let request = IoRequest::Wake(circuit);
        if !self.io.contains(&request) {
            self.io.push(request);
        }
    }

    pub fn datagrams(&mut self, datagrams: Vec<(Vec<u8>, SocketAddr)>) {
        self.io.extend(
            datagrams
                .into_iter()
                .map(|(bytes, dest)| IoRequest::Datagram(bytes, dest)),
        );
    }
}

/// One round of work for a circuit's sender
#[derive(Debug, Default)]
pub struct SendLabor {
    pub bytes: Vec<u8>,
    /// More is waiting; call again once these bytes are written
    pub more: bool,
    /// Everything is flushed and the circuit is closing: shut down our side
    pub shutdown: bool,
}

#[derive(Debug)]
pub struct EngineState {
    pub(super) config: EngineConfig,
    pub(super) channels: ChannelTable,
    pub(super) io: IoTable,
    pub(super) circuits: SlotMap<CircuitId, VirtualCircuit>,
    circuit_index: HashMap<(SocketAddr, u8), CircuitId>,
    pub(super) udp: SearchUnit,
    pub(super) beacons: BeaconTable,
    pool: BufferPool,
    closed: bool,
}

impl EngineState {
    pub fn new(config: EngineConfig, now: Instant) -> Self {
        let mut udp = SearchUnit::new(&config, get_local_ipv4());
        udp.repeater.start(now);
        debug!(
            "Client engine starting, searching {:?}",
            config.search_destinations
        );
        EngineState {
            pool: BufferPool::new(WIRE_BUFFER_CAPACITY, config.buffer_pool_limit),
            channels: ChannelTable::default(),
            io: IoTable::default(),
            circuits: SlotMap::with_key(),
            circuit_index: HashMap::new(),
            beacons: BeaconTable::new(now),
            udp,
            config,
            closed: false,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(super) fn iiu_mut(&mut self, iiu: Iiu) -> Result<&mut dyn IoUnit, ClientError> {
        match iiu {
            Iiu::SearchUnit => Ok(&mut self.udp),
            Iiu::Circuit(id) => self
                .circuits
                .get_mut(id)
                .map(|vc| vc as &mut dyn IoUnit)
                .ok_or(ClientError::NotConnected),
        }
    }

    pub fn create_channel(
        &mut self,
        name: &str,
        priority: u32,
        now: Instant,
    ) -> Result<ChannelId, ClientError> {
        if self.closed {
            return Err(ClientError::ClientClosed);
        }
        if priority > MAX_PRIORITY as u32 {
            return Err(ClientError::BadPriority(priority));
        }
        if name.is_empty()
            || name.contains('\0')
            || !SearchDatagram::fits(self.config.max_datagram_size, name)
        {
            return Err(ClientError::BadName);
        }
        let id = self.channels.insert(name, priority as u8);
        self.udp.ladder.install(&mut self.channels, id, 0, now);
        debug!("Created channel {name}");
        Ok(id)
    }

    pub fn destroy_channel(
        &mut self,
        id: ChannelId,
        now: Instant,
        effects: &mut Effects,
    ) -> Result<(), ClientError> {
        let channel = self.channels.get(id).ok_or(ClientError::BadChannel)?;
        let (membership, cid, sid) = (channel.membership, channel.cid, channel.sid);
        let claimed = channel.is_connected();
        match membership {
            Membership::Circuit(circuit, list) => {
                if let Some(vc) = self.circuits.get_mut(circuit) {
                    vc.remove_channel(id, list);
                }
                if claimed && let Some(sid) = sid {
                    match self
                        .iiu_mut(Iiu::Circuit(circuit))
                        .and_then(|unit| unit.clear_channel_request(sid, cid))
                    {
                        Ok(()) => effects.wake(circuit),
                        Err(e) => warn!("Unable to release channel {cid}: {e}"),
                    }
                }
                self.release_if_idle(circuit, now, effects);
            }
            other => {
                self.udp.uninstall(id, other);
            }
        }
        for io in self.io.for_channel(id) {
            self.io.remove(io);
        }
        if let Some(channel) = self.channels.remove(id) {
            debug!("Destroyed channel {}", channel.name);
        }
        Ok(())
    }

    fn iiu(&self, iiu: Iiu) -> Option<&dyn IoUnit> {
        match iiu {
            Iiu::SearchUnit => Some(&self.udp),
            Iiu::Circuit(id) => self.circuits.get(id).map(|vc| vc as &dyn IoUnit),
        }
    }

    pub fn channel_info(&self, id: ChannelId) -> Result<ChannelInfo, ClientError> {
        let channel = self.channels.get(id).ok_or(ClientError::BadChannel)?;
        let mut info = ChannelInfo::from(channel);
        if let Some(unit) = self.iiu(channel.iiu()) {
            info.host_name = unit.host_name();
        }
        Ok(info)
    }

    /// Bytes queued on every unit and not yet handed to a socket
    pub fn pending_bytes(&self) -> usize {
        let units = std::iter::once(Iiu::SearchUnit)
            .chain(self.circuits.keys().map(Iiu::Circuit))
            .filter_map(|iiu| self.iiu(iiu));
        units.map(|unit| unit.pending_bytes()).sum()
    }

    /// Check a request's type and count, resolving a zero count to the
    /// channel's native count
    fn check_request(&self, id: ChannelId, data_type: u16, count: u32) -> Result<u32, ClientError> {
        let dbr = DbrType::try_from(data_type).map_err(|_| ClientError::BadType(data_type))?;
        let channel = self.channels.get(id).ok_or(ClientError::BadChannel)?;
        let count = match count {
            _ if !channel.is_connected() => count,
            0 => channel.native_count.max(1),
            n if n > channel.native_count.max(1) => return Err(ClientError::BadCount),
            n => n,
        };
        if count > dbr.max_element_count(self.config.max_array_bytes) {
            return Err(ClientError::BadCount);
        }
        Ok(count)
    }

    pub fn read(
        &mut self,
        id: ChannelId,
        data_type: u16,
        count: u32,
        effects: &mut Effects,
    ) -> Result<IoId, ClientError> {
        let count = self.check_request(id, data_type, count)?;
        if let Some(channel) = self.channels.get(id)
            && channel.is_connected()
            && !channel.access.can_read()
        {
            return Err(ClientError::NoReadAccess);
        }
        self.issue(id, IoKind::Read, data_type, count, Vec::new(), effects)
    }

    pub fn write(
        &mut self,
        id: ChannelId,
        data_type: u16,
        count: u32,
        data: &[u8],
        effects: &mut Effects,
    ) -> Result<(), ClientError> {
        let count = self.check_request(id, data_type, count)?;
        let channel = self.channels.get(id).ok_or(ClientError::BadChannel)?;
        let iiu = channel.iiu();
        if matches!(iiu, Iiu::Circuit(_)) && !channel.is_connected() {
            return Err(ClientError::NotConnected);
        }
        if channel.is_connected() && !channel.access.can_write() {
            return Err(ClientError::NoWriteAccess);
        }
        let (sid, cid) = (channel.sid.unwrap_or_default(), channel.cid);
        self.iiu_mut(iiu)?
            .write_request(sid, cid, data_type, count, data)?;
        if let Iiu::Circuit(circuit) = iiu {
            effects.wake(circuit);
        }
        Ok(())
    }

    pub fn write_notify(
        &mut self,
        id: ChannelId,
        data_type: u16,
        count: u32,
        data: &[u8],
        effects: &mut Effects,
    ) -> Result<IoId, ClientError> {
        let count = self.check_request(id, data_type, count)?;
        if let Some(channel) = self.channels.get(id)
            && channel.is_connected()
            && !channel.access.can_write()
        {
            return Err(ClientError::NoWriteAccess);
        }
        self.issue(id, IoKind::WriteNotify, data_type, count, data.to_vec(), effects)
    }

    /// Subscriptions survive disconnects, and are reissued on every connect
    pub fn subscribe(
        &mut self,
        id: ChannelId,
        data_type: u16,
        count: u32,
        mask: MonitorMask,
        effects: &mut Effects,
    ) -> Result<IoId, ClientError> {
        let count = self.check_request(id, data_type, count)?;
        self.issue(
            id,
            IoKind::Subscription(mask),
            data_type,
            count,
            Vec::new(),
            effects,
        )
    }

    pub fn unsubscribe(&mut self, io: IoId, effects: &mut Effects) -> Result<(), ClientError> {
        let record = self.io.get(io).ok_or(ClientError::BadIo)?;
        if !record.is_subscription() {
            return Err(ClientError::BadIo);
        }
        let Some(record) = self.io.remove(io) else {
            return Err(ClientError::BadIo);
        };
        let Some(circuit) = record.issued_on else {
            return Ok(());
        };
        let Some(sid) = self
            .channels
            .get(record.channel)
            .filter(|c| c.is_connected())
            .and_then(|c| c.sid)
        else {
            return Ok(());
        };
        match self.iiu_mut(Iiu::Circuit(circuit)).and_then(|unit| {
            unit.subscription_cancel_request(sid, io.0, record.data_type, record.count)
        }) {
            Ok(()) => effects.wake(circuit),
            // Updates for it will be ignored when they arrive
            Err(e) => debug!("Could not send cancel for {io}: {e}"),
        }
        Ok(())
    }

    /// Record a request, and send it now if the channel is ready for it
    fn issue(
        &mut self,
        id: ChannelId,
        kind: IoKind,
        data_type: u16,
        count: u32,
        payload: Vec<u8>,
        effects: &mut Effects,
    ) -> Result<IoId, ClientError> {
        if self.closed {
            return Err(ClientError::ClientClosed);
        }
        let channel = self.channels.get(id).ok_or(ClientError::BadChannel)?;
        let membership = channel.membership;
        let iiu = channel.iiu();
        let io = self.io.insert(IoRecord {
            channel: id,
            kind,
            data_type,
            count,
            payload,
            issued_on: None,
        });
        let deferred = match membership {
            Membership::Circuit(_, list) => list != CircuitList::Connected,
            _ => matches!(kind, IoKind::Subscription(_)),
        };
        if deferred {
            trace!("Deferring {io} until channel {id:?} is claimed");
            return Ok(io);
        }
        match self.send_io(iiu, io) {
            Ok(()) => {
                if let Iiu::Circuit(circuit) = iiu {
                    effects.wake(circuit);
                }
                Ok(io)
            }
            Err(e) => {
                self.io.remove(io);
                Err(e)
            }
        }
    }

    /// Put a recorded request on the wire through the channel's unit
    fn send_io(&mut self, iiu: Iiu, io: IoId) -> Result<(), ClientError> {
        let record = self.io.get(io).ok_or(ClientError::BadIo)?;
        let channel = self
            .channels
            .get(record.channel)
            .ok_or(ClientError::BadChannel)?;
        let sid = channel.sid.unwrap_or_default();
        let (kind, data_type, count) = (record.kind, record.data_type, record.count);
        let payload = record.payload.clone();
        let unit = self.iiu_mut(iiu)?;
        match kind {
            IoKind::Read => unit.read_request(sid, io.0, data_type, count),
            IoKind::WriteNotify => unit.write_notify_request(sid, io.0, data_type, count, &payload),
            IoKind::Subscription(mask) => {
                unit.subscription_request(sid, io.0, data_type, count, mask)
            }
        }?;
        if let Some(record) = self.io.get_mut(io) {
            record.issued_on = match iiu {
                Iiu::Circuit(circuit) => Some(circuit),
                Iiu::SearchUnit => None,
            };
            if kind == IoKind::WriteNotify {
                record.payload = Vec::new();
            }
        }
        Ok(())
    }

    /// Drop the circuit hosting a channel; its channels go straight back to
    /// searching
    pub fn reset_circuit(
        &mut self,
        id: ChannelId,
        now: Instant,
        effects: &mut Effects,
    ) -> Result<(), ClientError> {
        let channel = self.channels.get(id).ok_or(ClientError::BadChannel)?;
        let Some(circuit) = channel.circuit() else {
            return Err(ClientError::NotConnected);
        };
        self.teardown(circuit, DisconnectCause::UserRequest, now, effects);
        Ok(())
    }

    /// Push out anything queued, on every unit
    pub fn flush(&mut self, effects: &mut Effects) {
        for (id, vc) in self.circuits.iter_mut() {
            if vc.flush_request() {
                effects.wake(id);
            }
        }
    }

    /// The circuit to a server, opening one if there is none
    pub(super) fn find_or_create_circuit(
        &mut self,
        address: SocketAddr,
        priority: u8,
        minor_version: u16,
        effects: &mut Effects,
    ) -> CircuitId {
        if let Some(id) = self.circuit_index.get(&(address, priority))
            && self.circuits.get(*id).is_some_and(|vc| vc.is_open())
        {
            return *id;
        }
        let vc = VirtualCircuit::new(address, priority, minor_version, &self.pool, &self.config);
        let id = self.circuits.insert(vc);
        self.circuit_index.insert((address, priority), id);
        self.beacons.register_circuit(address, id);
        effects.io.push(IoRequest::Connect(id, address));
        debug!("Opening circuit to {address} at priority {priority}");
        id
    }

    /// The socket for a circuit finished connecting
    pub fn circuit_connected(&mut self, circuit: CircuitId, now: Instant, effects: &mut Effects) {
        let Some(vc) = self.circuits.get_mut(circuit) else {
            return;
        };
        if vc.state != CircuitState::Connecting {
            return;
        }
        if let Err(e) = vc.connected(now, &self.config.client_name, &self.config.host_name) {
            error!("Unable to start circuit to {}: {e}", vc.address);
            self.teardown(circuit, DisconnectCause::IoError, now, effects);
            return;
        }
        effects.wake(circuit);
        self.release_if_idle(circuit, now, effects);
    }

    /// The socket for a circuit failed or was closed by the peer
    pub fn circuit_closed(
        &mut self,
        circuit: CircuitId,
        cause: DisconnectCause,
        now: Instant,
        effects: &mut Effects,
    ) {
        self.teardown(circuit, cause, now, effects);
    }

    /// Once a connected circuit hosts nothing, flush it and close our side
    pub(super) fn release_if_idle(
        &mut self,
        circuit: CircuitId,
        now: Instant,
        effects: &mut Effects,
    ) {
        let Some(vc) = self.circuits.get_mut(circuit) else {
            return;
        };
        if vc.channel_count() > 0 || vc.state != CircuitState::Connected {
            return;
        }
        debug!("Circuit to {} is idle, closing", vc.address);
        vc.begin_shutdown(now);
        if self.circuit_index.get(&(vc.address, vc.priority)) == Some(&circuit) {
            self.circuit_index.remove(&(vc.address, vc.priority));
        }
        effects.wake(circuit);
    }

    /// Take a circuit down and send its channels back to searching.
    ///
    /// Only the first call for a circuit has any effect.
    pub fn teardown(
        &mut self,
        circuit: CircuitId,
        cause: DisconnectCause,
        now: Instant,
        effects: &mut Effects,
    ) {
        let Some(vc) = self.circuits.get_mut(circuit) else {
            trace!("Circuit {circuit:?} already torn down");
            return;
        };
        if vc.state == CircuitState::Disconnected {
            return;
        }
        vc.state = CircuitState::Disconnected;
        vc.discard_queues();
        let (address, priority) = (vc.address, vc.priority);
        let channels = vc.drain_channels();
        match cause {
            DisconnectCause::PeerClosed
            | DisconnectCause::UserRequest
            | DisconnectCause::Shutdown
            | DisconnectCause::CleanShutdown => {
                debug!("Circuit to {address} closed ({cause:?})")
            }
            _ => warn!(
                "Circuit to {address} lost ({cause:?}), {} channels disconnected",
                channels.len()
            ),
        }
        if self.circuit_index.get(&(address, priority)) == Some(&circuit) {
            self.circuit_index.remove(&(address, priority));
        }
        self.beacons.unregister_circuit(address, circuit);
        self.circuits.remove(circuit);
        effects.io.push(IoRequest::Close(circuit));
        for channel in channels {
            self.disconnect_channel(channel, cause, now, effects);
        }
    }

    /// A channel has lost its circuit: fail what was in flight and put it
    /// back in line to be searched for
    pub(super) fn disconnect_channel(
        &mut self,
        id: ChannelId,
        cause: DisconnectCause,
        now: Instant,
        effects: &mut Effects,
    ) {
        let Some(channel) = self.channels.get_mut(id) else {
            return;
        };
        let was_connected = channel.is_connected();
        let had_access = channel.access != Access::None;
        channel.sid = None;
        channel.access = Access::None;
        channel.native_type = 0;
        channel.native_count = 0;
        if was_connected {
            channel.state = ChannelState::Disconnected;
            effects.notify(Notification::ConnectionChanged {
                channel: id,
                connected: false,
            });
        }
        if had_access {
            effects.notify(Notification::AccessRightsChanged {
                channel: id,
                access: Access::None,
            });
        }
        for io in self.io.for_channel(id) {
            let Some(record) = self.io.get_mut(io) else {
                continue;
            };
            if record.is_subscription() {
                record.issued_on = None;
                continue;
            }
            self.io.remove(io);
            effects.notify(Notification::IoFailed {
                io,
                channel: id,
                status: ErrorCondition::Disconn.status(),
                context: format!("{cause:?}"),
            });
        }
        if cause == DisconnectCause::UserRequest {
            self.udp.ladder.install(&mut self.channels, id, 0, now);
        } else {
            self.udp.governor.install(&mut self.channels, id, now);
        }
    }

    /// The server accepted a claim
    pub(super) fn channel_claimed(
        &mut self,
        circuit: CircuitId,
        id: ChannelId,
        native_type: u16,
        native_count: u32,
        sid: u32,
        effects: &mut Effects,
    ) {
        let Some(vc) = self.circuits.get_mut(circuit) else {
            return;
        };
        let minor_version = vc.minor_version;
        vc.move_channel(
            circuit,
            &mut self.channels,
            id,
            CircuitList::CreateResponsePending,
            CircuitList::SubscriptionRequestPending,
        );
        let Some(channel) = self.channels.get_mut(id) else {
            return;
        };
        channel.sid = Some(sid);
        channel.native_type = native_type;
        channel.native_count = native_count;
        channel.state = ChannelState::Connected;
        debug!("Channel {} connected to {}", channel.name, vc.address);
        // Servers before 4.1 have no access control
        if !is_v41(minor_version) && channel.access != Access::ReadWrite {
            channel.access = Access::ReadWrite;
            effects.notify(Notification::AccessRightsChanged {
                channel: id,
                access: Access::ReadWrite,
            });
        }
        effects.notify(Notification::ConnectionChanged {
            channel: id,
            connected: true,
        });
        effects.wake(circuit);
    }

    /// Fill a circuit's send queue, and hand back what is ready to write.
    ///
    /// In order: flow control, a pending echo, claims, then the requests
    /// deferred until each claimed channel was ready. Work that does not fit
    /// under the queue budget stays queued for the next round.
    pub fn send_labor(&mut self, circuit: CircuitId, effects: &mut Effects) -> SendLabor {
        let mut claimed_without_reply = Vec::new();
        let mut failed = Vec::new();
        let labor = {
            let EngineState {
                circuits,
                channels,
                io,
                ..
            } = self;
            let Some(vc) = circuits.get_mut(circuit) else {
                return SendLabor::default();
            };
            if !matches!(vc.state, CircuitState::Connected | CircuitState::CleanShutdown) {
                return SendLabor::default();
            }
            if let Err(e) = vc.flow_control_labor() {
                trace!("Flow control deferred: {e}");
            }
            if let Err(e) = vc.echo_labor() {
                trace!("Echo deferred: {e}");
            }

            while !vc.flush_block_threshold() {
                let Some(id) = vc.pop_create_request() else {
                    break;
                };
                let Some(channel) = channels.get(id) else {
                    continue;
                };
                let claim = <VirtualCircuit as IoUnit>::create_channel_request(
                    vc,
                    channel.cid,
                    channel.sid,
                    &channel.name,
                );
                match claim {
                    Ok(()) => {
                        vc.push_list(CircuitList::CreateResponsePending, id);
                        channels.set_membership(
                            id,
                            Membership::Circuit(circuit, CircuitList::CreateResponsePending),
                        );
                        if !is_v42(vc.minor_version) {
                            claimed_without_reply.push(id);
                        }
                    }
                    Err(e) => {
                        if !matches!(e, ClientError::Queue(QueueError::FlushRequired)) {
                            error!("Unable to claim {}: {e}", channel.name);
                        }
                        vc.unpop_create_request(id);
                        break;
                    }
                }
            }

            while !vc.flush_block_threshold() {
                let Some(id) = vc.pop_subscription_request() else {
                    break;
                };
                let Some(sid) = channels.get(id).and_then(|c| c.sid) else {
                    continue;
                };
                let mut blocked = false;
                for ioid in io.for_channel(id) {
                    let Some(record) = io.get_mut(ioid) else {
                        continue;
                    };
                    if record.issued_on == Some(circuit) {
                        continue;
                    }
                    let result = match record.kind {
                        IoKind::Read => {
                            vc.read_notify_request(sid, ioid.0, record.data_type, record.count)
                        }
                        IoKind::WriteNotify => vc.write_notify_request(
                            sid,
                            ioid.0,
                            record.data_type,
                            record.count,
                            &record.payload,
                        ),
                        IoKind::Subscription(mask) => vc.subscription_request(
                            sid,
                            ioid.0,
                            record.data_type,
                            record.count,
                            mask,
                        ),
                    };
                    match result {
                        Ok(()) => record.issued_on = Some(circuit),
                        Err(QueueError::FlushRequired) => {
                            blocked = true;
                            break;
                        }
                        Err(e) => failed.push((ioid, id, e)),
                    }
                }
                if blocked {
                    vc.unpop_subscription_request(id);
                    break;
                }
                vc.push_list(CircuitList::Connected, id);
                channels.set_membership(id, Membership::Circuit(circuit, CircuitList::Connected));
            }

            let bytes = vc.drain_send_queue();
            let more = vc.labor_pending();
            SendLabor {
                bytes,
                more,
                shutdown: vc.state == CircuitState::CleanShutdown && !more,
            }
        };

        for (io, channel, e) in failed {
            if let Some(record) = self.io.get(io)
                && !record.is_subscription()
            {
                self.io.remove(io);
            }
            let status = match e {
                QueueError::Encode(MessageError::OutOfBounds) => ErrorCondition::TooLarge,
                QueueError::InsufficientResources => ErrorCondition::AllocMem,
                _ => ErrorCondition::Internal,
            };
            effects.notify(Notification::IoFailed {
                io,
                channel,
                status: status.status(),
                context: e.to_string(),
            });
        }
        for id in claimed_without_reply {
            let Some(channel) = self.channels.get(id) else {
                continue;
            };
            let (native_type, native_count, sid) =
                (channel.native_type, channel.native_count, channel.sid);
            self.channel_claimed(circuit, id, native_type, native_count, sid.unwrap_or_default(), effects);
        }
        labor
    }

    /// Run every timer that is due
    pub fn process_timers(&mut self, now: Instant, effects: &mut Effects) {
        if self
            .udp
            .governor
            .next_deadline()
            .is_some_and(|d| d <= now)
        {
            self.udp.expire_governor(&mut self.channels, now);
        }
        let datagrams = self.udp.expire_rungs(&mut self.channels, now);
        effects.datagrams(datagrams);
        if self
            .udp
            .repeater
            .next_deadline()
            .is_some_and(|d| d <= now)
            && let Some((bytes, dest)) = self.udp.repeater.expire(now)
        {
            effects.io.push(IoRequest::Datagram(bytes, dest));
        }

        let due: Vec<CircuitId> = self
            .circuits
            .iter()
            .filter(|(_, vc)| vc.next_deadline().is_some_and(|d| d <= now))
            .map(|(id, _)| id)
            .collect();
        for id in due {
            let Some(vc) = self.circuits.get_mut(id) else {
                continue;
            };
            if vc.state == CircuitState::CleanShutdown {
                debug!("Circuit to {} did not close in time", vc.address);
                self.teardown(id, DisconnectCause::CleanShutdown, now, effects);
                continue;
            }
            match vc.watchdog_expire(now) {
                WatchdogAction::SendEcho => {
                    trace!("Circuit to {} idle, sending echo", vc.address);
                    effects.wake(id);
                }
                WatchdogAction::Teardown => {
                    self.teardown(id, DisconnectCause::Unresponsive, now, effects);
                }
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.circuits
            .values()
            .filter_map(|vc| vc.next_deadline())
            .chain(self.udp.next_deadline())
            .min()
    }

    /// Close every circuit; nothing new is accepted afterwards
    pub fn shutdown(&mut self, now: Instant, effects: &mut Effects) {
        self.closed = true;
        let circuits: Vec<_> = self.circuits.keys().collect();
        for circuit in circuits {
            self.teardown(circuit, DisconnectCause::Shutdown, now, effects);
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
    pub fn circuit_count(&self) -> usize {
        self.circuits.len()
    }
    pub fn circuit_state(&self, circuit: CircuitId) -> Option<CircuitState> {
        self.circuits.get(circuit).map(|vc| vc.state)
    }
    pub fn beacons(&self) -> &BeaconTable {
        &self.beacons
    }
    pub fn search_ladder(&self) -> &super::search::SearchLadder {
        &self.udp.ladder
    }

    /// Check that every channel sits in exactly one structure, and that the
    /// structure agrees
    #[cfg(test)]
    pub(crate) fn check_memberships(&self) {
        let mut seen: HashMap<ChannelId, Membership> = HashMap::new();
        let mut record = |id: ChannelId, membership: Membership| {
            assert!(
                seen.insert(id, membership).is_none(),
                "{id:?} held twice"
            );
        };
        for rung in 0..self.udp.ladder.rung_count() {
            let (request, response) = self.udp.ladder.rung_members(rung);
            for id in request {
                record(id, Membership::SearchRequestPending(rung));
            }
            for id in response {
                record(id, Membership::SearchResponsePending(rung));
            }
        }
        for id in self.udp.governor.members() {
            record(*id, Membership::DisconnectGovernor);
        }
        for (circuit, vc) in self.circuits.iter() {
            for (id, list) in vc.members() {
                record(id, Membership::Circuit(circuit, list));
            }
        }
        for (id, channel) in self.channels.iter() {
            assert_eq!(
                seen.remove(&id),
                Some(channel.membership),
                "channel {} misplaced",
                channel.name
            );
        }
        assert!(seen.is_empty(), "destroyed channels still held: {seen:?}");
    }
}
