//! The channel registry and outstanding request records.

use std::{collections::HashMap, fmt, net::SocketAddr};

use slab::Slab;
use slotmap::{SlotMap, new_key_type};

use super::{circuit::CircuitId, iiu::Iiu};
use crate::{
    messages::{Access, MonitorMask},
    utils::wrapping_inplace_add,
};

new_key_type! {
    /// Handle to a channel, valid until the channel is destroyed
    pub struct ChannelId;
}

/// Connection history of a channel, as seen by its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    NeverConnected,
    Connected,
    /// Was connected once, and is now looking for a server again
    Disconnected,
}

/// Which of the circuit's channel lists a channel sits in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitList {
    /// Waiting for the circuit to send a claim
    CreateRequestPending,
    /// Claim sent, waiting for the server to confirm it
    CreateResponsePending,
    /// Claimed; deferred requests and subscriptions still to be sent
    SubscriptionRequestPending,
    Connected,
}

/// The single structure that currently holds a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    /// Waiting to be included in the rung's next sweep
    SearchRequestPending(usize),
    /// Searched for in the rung's last sweep, awaiting an answer
    SearchResponsePending(usize),
    DisconnectGovernor,
    Circuit(CircuitId, CircuitList),
}

#[derive(Debug)]
pub struct Channel {
    pub name: String,
    /// Our id for the channel; searches and claims carry it
    pub cid: u32,
    /// The server's id for the channel, once claimed
    pub sid: Option<u32>,
    pub priority: u8,
    pub native_type: u16,
    pub native_count: u32,
    pub access: Access,
    pub state: ChannelState,
    pub membership: Membership,
    pub server_address: Option<SocketAddr>,
}

impl Channel {
    pub fn circuit(&self) -> Option<CircuitId> {
        match self.membership {
            Membership::Circuit(circuit, _) => Some(circuit),
            _ => None,
        }
    }
    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }
    /// The unit requests for this channel go through
    pub fn iiu(&self) -> Iiu {
        match self.membership {
            Membership::Circuit(circuit, _) => Iiu::Circuit(circuit),
            _ => Iiu::SearchUnit,
        }
    }
}

/// What a caller can learn about a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub name: String,
    pub cid: u32,
    pub state: ChannelState,
    pub native_type: u16,
    pub native_count: u32,
    pub access: Access,
    pub priority: u8,
    pub server_address: Option<SocketAddr>,
    /// Who is hosting the channel, for diagnostics
    pub host_name: String,
}

impl From<&Channel> for ChannelInfo {
    fn from(channel: &Channel) -> Self {
        ChannelInfo {
            name: channel.name.clone(),
            cid: channel.cid,
            state: channel.state,
            native_type: channel.native_type,
            native_count: channel.native_count,
            access: channel.access,
            priority: channel.priority,
            server_address: channel.server_address,
            host_name: String::new(),
        }
    }
}

/// Every live channel, with a reverse index from the wire id
#[derive(Debug, Default)]
pub struct ChannelTable {
    channels: SlotMap<ChannelId, Channel>,
    by_cid: HashMap<u32, ChannelId>,
    next_cid: u32,
}

impl ChannelTable {
    /// Register a new channel, waiting in the first search rung
    pub fn insert(&mut self, name: &str, priority: u8) -> ChannelId {
        let mut cid = wrapping_inplace_add(&mut self.next_cid);
        while self.by_cid.contains_key(&cid) {
            cid = wrapping_inplace_add(&mut self.next_cid);
        }
        let id = self.channels.insert(Channel {
            name: name.to_owned(),
            cid,
            sid: None,
            priority,
            native_type: 0,
            native_count: 0,
            access: Access::None,
            state: ChannelState::NeverConnected,
            membership: Membership::SearchRequestPending(0),
            server_address: None,
        });
        self.by_cid.insert(cid, id);
        id
    }

    pub fn remove(&mut self, id: ChannelId) -> Option<Channel> {
        let channel = self.channels.remove(id)?;
        self.by_cid.remove(&channel.cid);
        Some(channel)
    }

    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(id)
    }
    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.channels.get_mut(id)
    }

    /// Look up a channel by the id we put on the wire
    pub fn by_cid(&self, cid: u32) -> Option<ChannelId> {
        self.by_cid.get(&cid).copied()
    }

    pub fn set_membership(&mut self, id: ChannelId, membership: Membership) {
        if let Some(channel) = self.channels.get_mut(id) {
            channel.membership = membership;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChannelId, &Channel)> {
        self.channels.iter()
    }
    pub fn ids(&self) -> Vec<ChannelId> {
        self.channels.keys().collect()
    }
    pub fn len(&self) -> usize {
        self.channels.len()
    }
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Identifies an outstanding read, write or subscription.
///
/// The same number is used as the request id on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IoId(pub u32);

impl fmt::Display for IoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "io#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    WriteNotify,
    Subscription(MonitorMask),
}

#[derive(Debug)]
pub struct IoRecord {
    pub channel: ChannelId,
    pub kind: IoKind,
    pub data_type: u16,
    pub count: u32,
    /// Value to write, kept until the request has been sent
    pub payload: Vec<u8>,
    /// The circuit the request went out on; `None` while it waits for one
    pub issued_on: Option<CircuitId>,
}

impl IoRecord {
    pub fn is_subscription(&self) -> bool {
        matches!(self.kind, IoKind::Subscription(_))
    }
}

/// Outstanding requests, keyed by their wire id
#[derive(Debug, Default)]
pub struct IoTable {
    records: Slab<IoRecord>,
}

impl IoTable {
    pub fn insert(&mut self, record: IoRecord) -> IoId {
        IoId(self.records.insert(record) as u32)
    }
    pub fn get(&self, id: IoId) -> Option<&IoRecord> {
        self.records.get(id.0 as usize)
    }
    pub fn get_mut(&mut self, id: IoId) -> Option<&mut IoRecord> {
        self.records.get_mut(id.0 as usize)
    }
    pub fn remove(&mut self, id: IoId) -> Option<IoRecord> {
        self.records.try_remove(id.0 as usize)
    }

    /// Requests belonging to a channel, oldest first
    pub fn for_channel(&self, channel: ChannelId) -> Vec<IoId> {
        self.records
            .iter()
            .filter(|(_, r)| r.channel == channel)
            .map(|(k, _)| IoId(k as u32))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cids_are_unique_and_indexed() {
        let mut table = ChannelTable::default();
        let a = table.insert("A", 0);
        let b = table.insert("B", 0);
        let (cid_a, cid_b) = (table.get(a).unwrap().cid, table.get(b).unwrap().cid);
        assert_ne!(cid_a, cid_b);
        assert_eq!(table.by_cid(cid_b), Some(b));
        assert_eq!(
            table.get(a).unwrap().membership,
            Membership::SearchRequestPending(0)
        );

        table.remove(b);
        assert_eq!(table.by_cid(cid_b), None);
        assert!(table.get(b).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn cid_allocation_skips_ids_in_use() {
        let mut table = ChannelTable::default();
        let first = table.insert("A", 0);
        // Force the counter to wrap around onto the live id
        table.next_cid = table.get(first).unwrap().cid;
        let second = table.insert("B", 0);
        assert_ne!(table.get(first).unwrap().cid, table.get(second).unwrap().cid);
    }

    #[test]
    fn io_records_by_owner() {
        let mut channels = ChannelTable::default();
        let channel = channels.insert("A", 0);
        let other = channels.insert("B", 0);
        let mut io = IoTable::default();
        let record = |channel| IoRecord {
            channel,
            kind: IoKind::Read,
            data_type: 6,
            count: 1,
            payload: Vec::new(),
            issued_on: None,
        };
        let first = io.insert(record(channel));
        io.insert(record(other));
        let third = io.insert(record(channel));
        assert_eq!(io.for_channel(channel), vec![first, third]);
        assert!(io.remove(first).is_some());
        assert!(io.remove(first).is_none());
        assert_eq!(io.len(), 2);
    }
}
