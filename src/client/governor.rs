//! Throttles how fast disconnected channels go back to searching.
//!
//! When a busy server goes away every one of its channels disconnects at
//! once. Releasing them into the search ladder a batch per tick keeps the
//! resulting broadcast storm bounded.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use tracing::debug;

use super::channel::{ChannelId, ChannelTable, Membership};

#[derive(Debug)]
pub struct DisconnectGovernor {
    waiting: VecDeque<ChannelId>,
    deadline: Option<Instant>,
    period: Duration,
    batch: usize,
}

impl DisconnectGovernor {
    pub fn new(period: Duration, batch: usize) -> Self {
        DisconnectGovernor {
            waiting: VecDeque::new(),
            deadline: None,
            period,
            batch: batch.max(1),
        }
    }

    /// Hold a channel until the next tick
    pub fn install(&mut self, channels: &mut ChannelTable, id: ChannelId, now: Instant) {
        self.waiting.push_back(id);
        self.deadline.get_or_insert(now + self.period);
        channels.set_membership(id, Membership::DisconnectGovernor);
    }

    pub fn remove(&mut self, id: ChannelId) -> bool {
        let before = self.waiting.len();
        self.waiting.retain(|c| *c != id);
        before != self.waiting.len()
    }

    /// Release the next batch, oldest first
    pub fn expire(&mut self, now: Instant) -> Vec<ChannelId> {
        self.deadline = None;
        let count = self.batch.min(self.waiting.len());
        let released: Vec<_> = self.waiting.drain(..count).collect();
        if !self.waiting.is_empty() {
            self.deadline = Some(now + self.period);
        }
        if !released.is_empty() {
            debug!(
                "Governor released {} channels, {} still held",
                released.len(),
                self.waiting.len()
            );
        }
        released
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn members(&self) -> impl Iterator<Item = &ChannelId> {
        self.waiting.iter()
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }
    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn releases_in_batches() {
        let mut channels = ChannelTable::default();
        let mut governor = DisconnectGovernor::new(Duration::from_secs(1), 64);
        let start = Instant::now();
        let ids: Vec<_> = (0..150)
            .map(|i| {
                let id = channels.insert(&format!("PV{i}"), 0);
                governor.install(&mut channels, id, start);
                id
            })
            .collect();
        assert_eq!(
            channels.get(ids[0]).unwrap().membership,
            Membership::DisconnectGovernor
        );

        let tick = governor.next_deadline().unwrap();
        assert_eq!(tick, start + Duration::from_secs(1));
        let first = governor.expire(tick);
        assert_eq!(first, ids[..64]);
        let second = governor.expire(governor.next_deadline().unwrap());
        assert_eq!(second.len(), 64);
        let last = governor.expire(governor.next_deadline().unwrap());
        assert_eq!(last, ids[128..]);
        assert_eq!(governor.next_deadline(), None);
        assert!(governor.is_empty());
    }

    #[test]
    fn removal() {
        let mut channels = ChannelTable::default();
        let mut governor = DisconnectGovernor::new(Duration::from_secs(1), 64);
        let id = channels.insert("PV", 0);
        governor.install(&mut channels, id, Instant::now());
        assert!(governor.remove(id));
        assert!(!governor.remove(id));
        assert_eq!(governor.len(), 0);
    }
}
