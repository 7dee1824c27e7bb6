//! The datagram side of the engine: searching, and the timers that drive it.

use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Instant,
};

use tracing::{trace, warn};

use super::{
    EngineConfig,
    channel::{ChannelId, ChannelTable, Membership},
    governor::DisconnectGovernor,
    repeater::RepeaterRegistration,
    search::{SearchDatagram, SearchLadder},
};

/// The single UDP unit: owns the search ladder, the disconnect governor and
/// repeater registration, and the channels they hold.
#[derive(Debug)]
pub struct SearchUnit {
    pub ladder: SearchLadder,
    pub governor: DisconnectGovernor,
    pub repeater: RepeaterRegistration,
    datagram: SearchDatagram,
    destinations: Vec<SocketAddr>,
    warned_no_destinations: bool,
    /// Sequence number of the datagram currently being dispatched
    pub reply_sequence: Option<u32>,
}

impl SearchUnit {
    pub fn new(config: &EngineConfig, local_ip: Option<Ipv4Addr>) -> Self {
        SearchUnit {
            ladder: SearchLadder::new(config.max_search_period),
            governor: DisconnectGovernor::new(config.governor_period, config.governor_batch),
            repeater: RepeaterRegistration::new(
                config.repeater_port,
                local_ip,
                config.repeater_period,
                config.repeater_warn_after,
            ),
            datagram: SearchDatagram::new(config.max_datagram_size),
            destinations: config.search_destinations.clone(),
            warned_no_destinations: false,
            reply_sequence: None,
        }
    }

    fn fan_out(&mut self, frames: Vec<Vec<u8>>) -> Vec<(Vec<u8>, SocketAddr)> {
        if frames.is_empty() {
            return Vec::new();
        }
        if self.destinations.is_empty() {
            if !self.warned_no_destinations {
                warn!("Empty PV search address list; channels cannot be found");
                self.warned_no_destinations = true;
            }
            return Vec::new();
        }
        frames
            .into_iter()
            .flat_map(|frame| {
                self.destinations
                    .iter()
                    .map(move |dest| (frame.clone(), *dest))
            })
            .collect()
    }

    /// Run every search rung that is due
    pub fn expire_rungs(
        &mut self,
        channels: &mut ChannelTable,
        now: Instant,
    ) -> Vec<(Vec<u8>, SocketAddr)> {
        let mut frames = Vec::new();
        for index in self.ladder.due(now) {
            frames.extend(self.ladder.expire(index, channels, &mut self.datagram, now));
        }
        self.fan_out(frames)
    }

    /// Release the next governor batch into the first rung
    pub fn expire_governor(&mut self, channels: &mut ChannelTable, now: Instant) -> usize {
        let released = self.governor.expire(now);
        let count = released.len();
        for id in released {
            if channels.get(id).is_some() {
                self.ladder.install(channels, id, 0, now);
            }
        }
        count
    }

    /// Take a channel out of whichever structure here holds it
    pub fn uninstall(&mut self, id: ChannelId, membership: Membership) -> bool {
        match membership {
            Membership::DisconnectGovernor => self.governor.remove(id),
            Membership::Circuit(..) => false,
            searching => self.ladder.remove(id, searching),
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.ladder.next_deadline(),
            self.governor.next_deadline(),
            self.repeater.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Fold the version frame that opens a datagram
    pub fn datagram_version(&mut self, sequence: Option<u32>) {
        trace!("Datagram sequence {sequence:?}");
        self.reply_sequence = sequence;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::messages::{CAMessage, RawMessage, Search};

    fn config(destinations: &[&str]) -> EngineConfig {
        EngineConfig {
            search_destinations: destinations.iter().map(|d| d.parse().unwrap()).collect(),
            client_name: "tester".to_owned(),
            host_name: "testhost".to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn sweeps_go_to_every_destination() {
        let mut unit = SearchUnit::new(&config(&["127.0.0.1:5064", "127.0.0.2:5064"]), None);
        let mut channels = ChannelTable::default();
        let start = Instant::now();
        let id = channels.insert("PV:ONE", 0);
        unit.ladder.install(&mut channels, id, 0, start);

        assert!(unit.expire_rungs(&mut channels, start).is_empty());
        let due = unit.next_deadline().unwrap();
        let sent = unit.expire_rungs(&mut channels, due);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, sent[1].0);
        assert_ne!(sent[0].1, sent[1].1);

        // Version frame first, then the search
        let (rest, _) = RawMessage::parse(&sent[0].0).unwrap();
        let (_, search) = Search::parse(rest).unwrap();
        assert_eq!(search.channel_name, "PV:ONE");
        assert_eq!(
            channels.get(id).unwrap().membership,
            Membership::SearchResponsePending(0)
        );
    }

    #[test]
    fn no_destinations_sends_nothing() {
        let mut unit = SearchUnit::new(&config(&[]), None);
        let mut channels = ChannelTable::default();
        let start = Instant::now();
        let id = channels.insert("PV:ONE", 0);
        unit.ladder.install(&mut channels, id, 0, start);
        let due = unit.next_deadline().unwrap();
        assert!(unit.expire_rungs(&mut channels, due).is_empty());
        assert!(unit.warned_no_destinations);
    }

    #[test]
    fn governor_releases_into_first_rung() {
        let mut unit = SearchUnit::new(&config(&["127.0.0.1:5064"]), None);
        let mut channels = ChannelTable::default();
        let start = Instant::now();
        let id = channels.insert("PV:ONE", 0);
        unit.governor.install(&mut channels, id, start);
        assert_eq!(unit.next_deadline(), Some(start + Duration::from_secs(1)));
        assert_eq!(unit.expire_governor(&mut channels, start + Duration::from_secs(1)), 1);
        assert_eq!(
            channels.get(id).unwrap().membership,
            Membership::SearchRequestPending(0)
        );
        assert!(unit.uninstall(id, Membership::SearchRequestPending(0)));
        assert!(!unit.uninstall(id, Membership::SearchRequestPending(0)));
    }
}
