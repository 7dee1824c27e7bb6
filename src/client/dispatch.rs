//! Handling for everything that arrives: search datagrams and circuit frames.

use std::{
    net::{IpAddr, SocketAddr},
    time::Instant,
};

use tracing::{debug, debug_span, trace, warn};

use super::{
    beacon::CircuitSignal,
    channel::{ChannelId, CircuitList, IoKind, Membership},
    circuit::{CircuitId, DisconnectCause},
    engine::{Effects, EngineState},
    events::Notification,
    iiu::Iiu,
};
use crate::messages::{
    AccessRights, CA_UNKNOWN_MINOR_VERSION, Command, CreateChannelFailure,
    CreateChannelResponse, DatagramVersion, ECAError, ErrorCondition, EventAddResponse,
    MessageError, RawMessage, ReadNotifyResponse, RepeaterConfirm, RsrvIsUp, SearchResponse,
    ServerDisconnect, Version, WriteNotifyResponse, is_v41, is_v42, is_v44, is_v45, is_v48,
};

impl EngineState {
    /// Handle a datagram that arrived on the search socket
    pub fn datagram_received(
        &mut self,
        bytes: &[u8],
        source: SocketAddr,
        now: Instant,
        effects: &mut Effects,
    ) {
        // A sequence number only applies to the datagram that carried it
        self.udp.reply_sequence = None;
        let mut rest = bytes;
        while !rest.is_empty() {
            let (remaining, message) = match RawMessage::parse(rest) {
                Ok(parsed) => parsed,
                Err(_) => {
                    warn!(
                        "Undecipherable datagram from {source}: {} of {} bytes left",
                        rest.len(),
                        bytes.len()
                    );
                    break;
                }
            };
            rest = remaining;
            if let Err(e) = self.datagram_message(message, source, now, effects) {
                warn!("Bad message in datagram from {source}: {e}");
            }
        }
        self.udp.reply_sequence = None;
    }

    fn datagram_message(
        &mut self,
        message: RawMessage,
        source: SocketAddr,
        now: Instant,
        effects: &mut Effects,
    ) -> Result<(), MessageError> {
        match Command::try_from(message.command) {
            Ok(Command::Version) => {
                let version = DatagramVersion::try_from(message)?;
                self.udp.datagram_version(version.sequence_number);
            }
            Ok(Command::Search) => self.search_reply(message, source, now, effects)?,
            Ok(Command::NotFound) => {
                trace!("{source} does not have cid {}", message.field_4_parameter_2)
            }
            Ok(Command::RsrvIsUp) => self.beacon(RsrvIsUp::try_from(message)?, source, now),
            Ok(Command::RepeaterConfirm) => {
                let confirm = RepeaterConfirm::try_from(message)?;
                self.udp.repeater.confirm(confirm.repeater_ip);
            }
            Ok(Command::Error) => {
                let error = ECAError::try_from(message)?;
                effects.notify(Notification::Exception {
                    channel: None,
                    status: error.status_code,
                    context: format!("host={source} ctx={}", error.error_message),
                });
            }
            _ => warn!(
                "Ignoring unexpected command {} in datagram from {source}",
                message.command
            ),
        }
        Ok(())
    }

    /// A server says it has one of our channels
    fn search_reply(
        &mut self,
        message: RawMessage,
        source: SocketAddr,
        now: Instant,
        effects: &mut Effects,
    ) -> Result<(), MessageError> {
        let (raw_type, raw_count, raw_sid) = (
            message.field_1_data_type,
            message.field_2_data_count,
            message.field_3_parameter_1,
        );
        let reply = SearchResponse::try_from(message)?;
        let Some(id) = self.channels.by_cid(reply.search_id) else {
            trace!("Search reply from {source} for unknown cid {}", reply.search_id);
            return Ok(());
        };
        let minor_version = reply.protocol_version.unwrap_or(CA_UNKNOWN_MINOR_VERSION);
        let ip = match reply.server_ip {
            Some(ip) if is_v48(minor_version) => IpAddr::V4(ip),
            _ => source.ip(),
        };
        let port = if is_v45(minor_version) {
            reply.port_number
        } else {
            self.config.server_port
        };
        let address = SocketAddr::new(ip, port);

        let Some(channel) = self.channels.get(id) else {
            return Ok(());
        };
        let (membership, priority) = (channel.membership, channel.priority);
        match membership {
            Membership::Circuit(circuit, _) => {
                let current = self.circuits.get(circuit).map(|vc| vc.address);
                if current.is_some_and(|current| current != address) {
                    let name = channel.name.clone();
                    warn!("Channel {name} found on both {current:?} and {address}");
                    effects.notify(Notification::Exception {
                        channel: Some(id),
                        status: ErrorCondition::DblChnl.status(),
                        context: format!(
                            "Channel: \"{name}\", Connecting to: {}, Ignored: {address}",
                            current.map_or_else(String::new, |a| a.to_string())
                        ),
                    });
                }
                return Ok(());
            }
            Membership::DisconnectGovernor => {
                trace!("Ignoring reply for {} while it waits in the governor", channel.name);
                return Ok(());
            }
            _ => {}
        }

        self.udp
            .ladder
            .search_response(id, membership, self.udp.reply_sequence, now);
        let circuit = self.find_or_create_circuit(address, priority, minor_version, effects);
        if let Some(channel) = self.channels.get_mut(id) {
            channel.server_address = Some(address);
            if !is_v44(minor_version) {
                channel.sid = Some(raw_sid);
            }
            if !is_v42(minor_version) {
                channel.native_type = raw_type;
                channel.native_count = raw_count;
            }
        }
        if let Some(vc) = self.circuits.get_mut(circuit) {
            vc.install_channel(circuit, &mut self.channels, id);
            if vc.is_connected() {
                effects.wake(circuit);
            }
        }
        Ok(())
    }

    fn beacon(&mut self, beacon: RsrvIsUp, source: SocketAddr, now: Instant) {
        let ip = beacon.server_ip.map_or(source.ip(), IpAddr::V4);
        let port = match beacon.server_port {
            0 => self.config.server_port,
            port => port,
        };
        let address = SocketAddr::new(ip, port);
        let verdict =
            self.beacons
                .beacon_arrived(address, now, beacon.beacon_id, beacon.protocol_version);
        if verdict.anomaly {
            debug!(
                "Beacon anomaly from {address}{}",
                if verdict.network_wide { " (network wide)" } else { "" }
            );
            self.udp
                .ladder
                .beacon_anomaly(&mut self.channels, verdict.network_wide, now);
        }
        if let Some((circuit, signal)) = verdict.circuit
            && let Some(vc) = self.circuits.get_mut(circuit)
        {
            match signal {
                CircuitSignal::Alive => vc.beacon_alive(now),
                CircuitSignal::Suspect => vc.beacon_suspect(now),
            }
        }
    }

    /// Bytes arrived on a circuit. `more_pending` is whether the socket had
    /// more waiting after this read.
    pub fn circuit_received(
        &mut self,
        circuit: CircuitId,
        bytes: &[u8],
        more_pending: bool,
        now: Instant,
        effects: &mut Effects,
    ) {
        let Some(vc) = self.circuits.get_mut(circuit) else {
            return;
        };
        if let Err(e) = vc.push_received(bytes) {
            warn!("Dropping circuit to {}: {e}", vc.address);
            self.teardown(circuit, DisconnectCause::IoError, now, effects);
            return;
        }
        if vc.record_read(more_pending) {
            effects.wake(circuit);
        }
        loop {
            let Some(vc) = self.circuits.get_mut(circuit) else {
                return;
            };
            let frame = match vc.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(e) => {
                    warn!("Protocol violation from {}: {e}", vc.address);
                    self.teardown(circuit, DisconnectCause::ProtocolViolation, now, effects);
                    return;
                }
            };
            vc.message_arrived(now);
            let peer = vc.address;
            let command = frame.command;
            if let Err(e) = self.circuit_frame(circuit, frame, now, effects) {
                warn!("Discarding malformed command {command} from {peer}: {e}");
            }
        }
    }

    fn circuit_frame(
        &mut self,
        circuit: CircuitId,
        message: RawMessage,
        now: Instant,
        effects: &mut Effects,
    ) -> Result<(), MessageError> {
        let Ok(command) = Command::try_from(message.command) else {
            warn!("Ignoring unknown command {}", message.command);
            return Ok(());
        };
        let minor_version = self
            .circuits
            .get(circuit)
            .map_or(CA_UNKNOWN_MINOR_VERSION, |vc| vc.minor_version);
        let _span = debug_span!("handle_message", ?command).entered();
        match command {
            Command::Version => {
                let version = Version::try_from(message)?;
                if let Some(vc) = self.circuits.get_mut(circuit) {
                    trace!("{} speaks minor version {}", vc.address, version.protocol_version);
                    vc.minor_version = version.protocol_version;
                }
            }
            Command::Echo | Command::ReadSync => {
                if let Some(rtt) = self
                    .circuits
                    .get_mut(circuit)
                    .and_then(|vc| vc.echo_response(now))
                {
                    self.udp.ladder.update_round_trip(rtt);
                }
            }
            Command::ReadNotify => {
                let response = ReadNotifyResponse::try_from(message)?;
                let io = super::channel::IoId(response.client_ioid);
                let Some(record) = self.io.remove(io) else {
                    trace!("Read response for unknown {io}");
                    return Ok(());
                };
                if !is_v41(minor_version) || ErrorCondition::is_success(response.status_code) {
                    effects.notify(Notification::ReadCompleted {
                        io,
                        channel: record.channel,
                        data_type: response.data_type,
                        count: response.data_count,
                        data: response.data,
                    });
                } else {
                    effects.notify(Notification::IoFailed {
                        io,
                        channel: record.channel,
                        status: response.status_code,
                        context: "read".to_owned(),
                    });
                }
            }
            Command::WriteNotify => {
                let response = WriteNotifyResponse::try_from(message)?;
                let io = super::channel::IoId(response.client_ioid);
                let Some(record) = self.io.remove(io) else {
                    trace!("Write response for unknown {io}");
                    return Ok(());
                };
                if !is_v41(minor_version) || ErrorCondition::is_success(response.status_code) {
                    effects.notify(Notification::WriteCompleted {
                        io,
                        channel: record.channel,
                    });
                } else {
                    effects.notify(Notification::IoFailed {
                        io,
                        channel: record.channel,
                        status: response.status_code,
                        context: "write".to_owned(),
                    });
                }
            }
            Command::EventAdd => {
                let update = EventAddResponse::try_from(message)?;
                let io = super::channel::IoId(update.subscription_id);
                let Some(record) = self.io.get(io).filter(|r| r.is_subscription()) else {
                    // Cancelled, with updates still in flight
                    trace!("Update for unknown subscription {io}");
                    return Ok(());
                };
                let channel = record.channel;
                if ErrorCondition::is_success(update.status_code) {
                    effects.notify(Notification::SubscriptionUpdate {
                        io,
                        channel,
                        data_type: update.data_type,
                        count: update.data_count,
                        data: update.data,
                    });
                } else {
                    effects.notify(Notification::IoFailed {
                        io,
                        channel,
                        status: update.status_code,
                        context: "subscription update".to_owned(),
                    });
                }
            }
            Command::CreateChannel => {
                let response = CreateChannelResponse::try_from(message)?;
                self.claim_response(circuit, response, minor_version, effects);
            }
            Command::AccessRights => {
                let rights = AccessRights::try_from(message)?;
                let Some(id) = self.channels.by_cid(rights.client_id) else {
                    return Ok(());
                };
                if let Some(channel) = self.channels.get_mut(id)
                    && channel.access != rights.access_rights
                {
                    debug!("{} access now {}", channel.name, rights.access_rights);
                    channel.access = rights.access_rights;
                    effects.notify(Notification::AccessRightsChanged {
                        channel: id,
                        access: rights.access_rights,
                    });
                }
            }
            Command::CreateChannelFailure => {
                let failure = CreateChannelFailure::try_from(message)?;
                self.channel_lost(circuit, failure.client_id, now, effects);
            }
            Command::ServerDisconnect => {
                let disconnect = ServerDisconnect::try_from(message)?;
                self.channel_lost(circuit, disconnect.client_id, now, effects);
            }
            Command::Error => self.exception(circuit, ECAError::try_from(message)?, effects),
            Command::ClearChannel | Command::EventCancel => {
                trace!("Server confirmed {command:?}");
            }
            _ => warn!("Unexpected {command:?} on a circuit"),
        }
        Ok(())
    }

    fn claim_response(
        &mut self,
        circuit: CircuitId,
        response: CreateChannelResponse,
        minor_version: u16,
        effects: &mut Effects,
    ) {
        let claimed = self.channels.by_cid(response.client_id).filter(|id| {
            self.channels.get(*id).is_some_and(|c| {
                c.membership == Membership::Circuit(circuit, CircuitList::CreateResponsePending)
            })
        });
        let Some(id) = claimed else {
            if let Some(channel) = self
                .channels
                .by_cid(response.client_id)
                .and_then(|id| self.channels.get(id))
            {
                warn!("Duplicate claim confirmation for {}", channel.name);
            } else if is_v44(minor_version) {
                // The channel went away while the claim was in flight
                debug!("Releasing orphaned claim for cid {}", response.client_id);
                match self.iiu_mut(Iiu::Circuit(circuit)).and_then(|unit| {
                    unit.clear_channel_request(response.server_id, response.client_id)
                }) {
                    Ok(()) => effects.wake(circuit),
                    Err(e) => warn!("Unable to release orphaned claim: {e}"),
                }
            }
            return;
        };
        let sid = if is_v44(minor_version) {
            response.server_id
        } else {
            self.channels
                .get(id)
                .and_then(|c| c.sid)
                .unwrap_or(response.server_id)
        };
        self.channel_claimed(
            circuit,
            id,
            response.data_type,
            response.data_count,
            sid,
            effects,
        );
    }

    /// The server dropped one channel but kept the circuit
    fn channel_lost(
        &mut self,
        circuit: CircuitId,
        cid: u32,
        now: Instant,
        effects: &mut Effects,
    ) {
        let Some(id) = self.channels.by_cid(cid) else {
            return;
        };
        let Some(Membership::Circuit(on, list)) = self.channels.get(id).map(|c| c.membership)
        else {
            return;
        };
        if on != circuit {
            return;
        }
        if let Some(vc) = self.circuits.get_mut(circuit) {
            vc.remove_channel(id, list);
        }
        self.disconnect_channel(id, DisconnectCause::PeerClosed, now, effects);
        self.release_if_idle(circuit, now, effects);
    }

    /// Route a server-reported failure to whatever caused it
    fn exception(&mut self, circuit: CircuitId, error: ECAError, effects: &mut Effects) {
        let request = error.original_request;
        let peer = self
            .circuits
            .get(circuit)
            .map_or_else(String::new, |vc| vc.address.to_string());
        debug!(
            "Exception from {peer} for command {}: {}",
            request.command, error.error_message
        );
        let io = super::channel::IoId(request.parameter_2);
        match Command::try_from(request.command) {
            Ok(Command::EventAdd) => {
                if let Some(record) = self.io.get(io).filter(|r| r.is_subscription()) {
                    effects.notify(Notification::IoFailed {
                        io,
                        channel: record.channel,
                        status: error.status_code,
                        context: error.error_message,
                    });
                    return;
                }
            }
            Ok(Command::Read | Command::ReadNotify | Command::WriteNotify) => {
                if let Some(record) = self
                    .io
                    .get(io)
                    .filter(|r| !matches!(r.kind, IoKind::Subscription(_)))
                    .map(|r| r.channel)
                {
                    self.io.remove(io);
                    effects.notify(Notification::IoFailed {
                        io,
                        channel: record,
                        status: error.status_code,
                        context: error.error_message,
                    });
                    return;
                }
            }
            Ok(Command::Write) => {
                let channel: Option<ChannelId> = self.channels.by_cid(request.parameter_2);
                effects.notify(Notification::Exception {
                    channel,
                    status: error.status_code,
                    context: error.error_message,
                });
                return;
            }
            _ => {}
        }
        effects.notify(Notification::Exception {
            channel: None,
            status: error.status_code,
            context: format!("host={peer} ctx={}", error.error_message),
        });
    }
}
