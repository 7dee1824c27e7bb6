//! The search ladder: escalating retries for channels nobody has answered.
//!
//! Each rung owns the channels waiting at one retry period. Rung `i` fires
//! every `2^i` round-trip estimates, capped at the maximum search period. A
//! sweep sends every waiting channel it can fit in its allowance of
//! datagrams; channels still unanswered when the rung next fires climb one
//! rung. Answered channels leave the ladder entirely.

use std::{
    collections::VecDeque,
    mem,
    time::{Duration, Instant},
};

use tracing::{debug, trace};

use super::channel::{ChannelId, ChannelTable, Membership};
use crate::messages::{
    AsBytes, CA_MINOR_PROTOCOL_REVISION, DatagramVersion, FrameHeader, Search, pad_string,
};

/// Floor of the round-trip estimate, and the period of the first rung
pub const MIN_ROUND_TRIP: Duration = Duration::from_millis(32);
pub const MAX_ROUND_TRIP: Duration = Duration::from_secs(30);
/// Period of the rung that beacon anomalies pull channels down to
const ANOMALY_SEARCH_PERIOD: Duration = Duration::from_secs(5);
const MAX_FRAMES_PER_TRY: f64 = 64.0;

/// Smoothed round-trip time, mean plus four mean deviations
#[derive(Debug, Clone)]
pub struct RoundTripEstimator {
    mean: f64,
    deviation: f64,
}

impl Default for RoundTripEstimator {
    fn default() -> Self {
        RoundTripEstimator {
            mean: MIN_ROUND_TRIP.as_secs_f64(),
            deviation: 0.0,
        }
    }
}

impl RoundTripEstimator {
    pub fn update(&mut self, measured: Duration) {
        let measured = measured.clamp(MIN_ROUND_TRIP, MAX_ROUND_TRIP).as_secs_f64();
        let error = measured - self.mean;
        self.mean += 0.125 * error;
        self.deviation += 0.25 * (error.abs() - self.deviation);
    }

    pub fn estimate(&self) -> Duration {
        Duration::from_secs_f64(self.mean + 4.0 * self.deviation)
    }
}

/// The search datagram currently being filled.
///
/// Every datagram opens with a version frame carrying its sequence number,
/// so that replies can be matched to the sweep that caused them.
#[derive(Debug)]
pub struct SearchDatagram {
    bytes: Vec<u8>,
    max_size: usize,
    sequence: u32,
    searches: usize,
}

impl SearchDatagram {
    pub fn new(max_size: usize) -> Self {
        let mut datagram = SearchDatagram {
            bytes: Vec::with_capacity(max_size),
            max_size,
            sequence: 0,
            searches: 0,
        };
        datagram.reset();
        datagram
    }

    fn reset(&mut self) {
        self.bytes = DatagramVersion {
            protocol_version: CA_MINOR_PROTOCOL_REVISION,
            sequence_number: Some(self.sequence),
        }
        .as_bytes();
        self.searches = 0;
    }

    /// Whether a search for `name` could ever fit in an empty datagram
    pub fn fits(max_size: usize, name: &str) -> bool {
        2 * FrameHeader::SIZE + pad_string(name).len() <= max_size
    }

    /// Add a search; false when the datagram has no room left for it
    pub fn push_search(&mut self, cid: u32, name: &str) -> bool {
        let message = Search {
            search_id: cid,
            channel_name: name.to_owned(),
            should_reply: false,
            protocol_version: CA_MINOR_PROTOCOL_REVISION,
        }
        .as_bytes();
        if self.bytes.len() + message.len() > self.max_size {
            return false;
        }
        self.bytes.extend_from_slice(&message);
        self.searches += 1;
        true
    }

    pub fn is_empty(&self) -> bool {
        self.searches == 0
    }

    /// Sequence number of the datagram being filled
    pub fn sequence_number(&self) -> u32 {
        self.sequence
    }

    /// Finish the datagram for sending, if it holds any searches
    pub fn take(&mut self) -> Option<Vec<u8>> {
        if self.is_empty() {
            return None;
        }
        let bytes = mem::take(&mut self.bytes);
        self.sequence = self.sequence.wrapping_add(1);
        self.reset();
        Some(bytes)
    }
}

#[derive(Debug)]
struct SearchRung {
    request_pending: VecDeque<ChannelId>,
    response_pending: Vec<ChannelId>,
    /// When the rung next fires; `None` while it is idle
    deadline: Option<Instant>,
    last_send: Option<Instant>,
    /// First and last datagram sequence numbers of the last sweep
    sweep_sequence: Option<(u32, u32)>,
    attempts: u32,
    responses: u32,
    frames_per_try: f64,
    congestion_threshold: f64,
}

impl SearchRung {
    fn new() -> Self {
        SearchRung {
            request_pending: VecDeque::new(),
            response_pending: Vec::new(),
            deadline: None,
            last_send: None,
            sweep_sequence: None,
            attempts: 0,
            responses: 0,
            frames_per_try: 1.0,
            congestion_threshold: f64::MAX,
        }
    }

    fn is_empty(&self) -> bool {
        self.request_pending.is_empty() && self.response_pending.is_empty()
    }

    /// Grow the datagram allowance after a clean sweep, collapse it otherwise
    fn adjust_window(&mut self) {
        if self.attempts == 0 {
            return;
        }
        if self.responses >= self.attempts {
            if self.frames_per_try < MAX_FRAMES_PER_TRY {
                if self.frames_per_try < self.congestion_threshold {
                    self.frames_per_try = (self.frames_per_try * 2.0).min(self.congestion_threshold);
                } else {
                    self.frames_per_try += 1.0 / self.frames_per_try;
                }
                self.frames_per_try = self.frames_per_try.min(MAX_FRAMES_PER_TRY);
            }
        } else {
            self.congestion_threshold = self.frames_per_try / 2.0;
            self.frames_per_try = 1.0;
        }
    }

    fn sequence_in_last_sweep(&self, sequence: u32) -> bool {
        match self.sweep_sequence {
            Some((begin, end)) => sequence.wrapping_sub(begin) <= end.wrapping_sub(begin),
            None => false,
        }
    }
}

/// All search rungs, and the round-trip estimate that paces them
#[derive(Debug)]
pub struct SearchLadder {
    rungs: Vec<SearchRung>,
    round_trip: RoundTripEstimator,
    anomaly_rung: usize,
    max_period: Duration,
}

impl SearchLadder {
    pub fn new(max_period: Duration) -> Self {
        let doublings = |period: Duration| {
            1 + (period.as_secs_f64() / MIN_ROUND_TRIP.as_secs_f64()).log2().max(0.0) as usize
        };
        let count = doublings(max_period).clamp(1, 32);
        let anomaly_rung = doublings(ANOMALY_SEARCH_PERIOD).min(count - 1);
        debug!("Search ladder with {count} rungs, anomaly rung {anomaly_rung}");
        SearchLadder {
            rungs: (0..count).map(|_| SearchRung::new()).collect(),
            round_trip: RoundTripEstimator::default(),
            anomaly_rung,
            max_period,
        }
    }

    pub fn rung_count(&self) -> usize {
        self.rungs.len()
    }
    pub fn anomaly_rung(&self) -> usize {
        self.anomaly_rung
    }
    pub fn round_trip(&self) -> &RoundTripEstimator {
        &self.round_trip
    }
    pub fn update_round_trip(&mut self, measured: Duration) {
        self.round_trip.update(measured);
    }

    /// How often a rung fires
    pub fn period(&self, rung: usize) -> Duration {
        self.round_trip
            .estimate()
            .saturating_mul(1u32 << rung.min(31))
            .min(self.max_period)
    }

    /// Queue a channel for the next sweep of `rung`, starting the rung after
    /// `delay` if it is idle
    fn install_after(
        &mut self,
        channels: &mut ChannelTable,
        id: ChannelId,
        rung: usize,
        now: Instant,
        delay: Duration,
    ) {
        let rung = rung.min(self.rungs.len() - 1);
        let target = &mut self.rungs[rung];
        target.request_pending.push_back(id);
        target.deadline.get_or_insert(now + delay);
        channels.set_membership(id, Membership::SearchRequestPending(rung));
    }

    /// Queue a channel on a rung, starting it one period from now if idle
    pub fn install(&mut self, channels: &mut ChannelTable, id: ChannelId, rung: usize, now: Instant) {
        let delay = self.period(rung);
        self.install_after(channels, id, rung, now, delay);
    }

    /// Take a channel off the ladder, wherever it waits
    pub fn remove(&mut self, id: ChannelId, membership: Membership) -> bool {
        match membership {
            Membership::SearchRequestPending(rung) => self.rungs.get_mut(rung).is_some_and(|r| {
                let before = r.request_pending.len();
                r.request_pending.retain(|c| *c != id);
                before != r.request_pending.len()
            }),
            Membership::SearchResponsePending(rung) => self.rungs.get_mut(rung).is_some_and(|r| {
                let before = r.response_pending.len();
                r.response_pending.retain(|c| *c != id);
                before != r.response_pending.len()
            }),
            _ => false,
        }
    }

    /// A search reply found the channel: take it off the ladder and credit
    /// the rung, if the reply answers that rung's last sweep
    pub fn search_response(
        &mut self,
        id: ChannelId,
        membership: Membership,
        reply_sequence: Option<u32>,
        now: Instant,
    ) {
        if !self.remove(id, membership) {
            return;
        }
        let (Membership::SearchRequestPending(index) | Membership::SearchResponsePending(index)) =
            membership
        else {
            return;
        };
        let rung = &mut self.rungs[index];
        let valid = reply_sequence.is_none_or(|seq| rung.sequence_in_last_sweep(seq));
        if !valid {
            trace!("Reply from an older sweep of rung {index}");
            return;
        }
        let measured = rung.last_send.map(|sent| now.saturating_duration_since(sent));
        rung.responses = rung.responses.saturating_add(1);
        // Everything answered: keep going while there is more to send
        if rung.responses == rung.attempts && !rung.request_pending.is_empty() {
            rung.deadline = Some(now);
        }
        if let Some(measured) = measured {
            self.round_trip.update(measured);
        }
    }

    /// Pull every channel above the anomaly rung down into it. A network-wide
    /// event also sweeps the anomaly rung straight away.
    pub fn beacon_anomaly(
        &mut self,
        channels: &mut ChannelTable,
        network_wide: bool,
        now: Instant,
    ) -> usize {
        let target = self.anomaly_rung;
        let mut moved = Vec::new();
        for rung in self.rungs.iter_mut().skip(target + 1) {
            rung.attempts = rung.attempts.saturating_sub(rung.response_pending.len() as u32);
            moved.extend(rung.response_pending.drain(..));
            moved.extend(rung.request_pending.drain(..));
        }
        let count = moved.len();
        for id in moved {
            self.install(channels, id, target, now);
        }
        if count > 0 {
            debug!("Beacon anomaly: moved {count} channels to rung {target}");
        }
        if network_wide && !self.rungs[target].is_empty() {
            self.rungs[target].deadline = Some(now);
        }
        count
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.rungs.iter().filter_map(|r| r.deadline).min()
    }

    /// Rungs whose timers have expired
    pub fn due(&self, now: Instant) -> Vec<usize> {
        self.rungs
            .iter()
            .enumerate()
            .filter(|(_, r)| r.deadline.is_some_and(|d| d <= now))
            .map(|(i, _)| i)
            .collect()
    }

    /// Run one sweep of a rung, returning the datagrams to send
    pub fn expire(
        &mut self,
        index: usize,
        channels: &mut ChannelTable,
        datagram: &mut SearchDatagram,
        now: Instant,
    ) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let Some(rung) = self.rungs.get_mut(index) else {
            return frames;
        };
        rung.deadline = None;
        if rung.is_empty() {
            return frames;
        }

        // Whoever went unanswered since the last sweep climbs a rung
        let unanswered = mem::take(&mut rung.response_pending);
        let got_responses = rung.responses > 0;
        let top = self.rungs.len() - 1;
        if index < top {
            let delay = self.period(index + 1).saturating_sub(self.period(index));
            for id in unanswered {
                self.install_after(channels, id, index + 1, now, delay);
            }
        } else {
            for id in unanswered {
                self.rungs[index].request_pending.push_back(id);
                channels.set_membership(id, Membership::SearchRequestPending(index));
            }
        }

        // Some success at a slow rung: retry the rest at the anomaly rung
        if got_responses && index > self.anomaly_rung {
            let boosted: Vec<_> = self.rungs[index].request_pending.drain(..).collect();
            for id in boosted {
                self.install(channels, id, self.anomaly_rung, now);
            }
        }

        let rung = &mut self.rungs[index];
        rung.adjust_window();
        rung.last_send = Some(now);
        rung.attempts = 0;
        rung.responses = 0;
        let sweep_begin = datagram.sequence_number();

        let mut frames_sent = 0.0;
        while let Some(id) = rung.request_pending.pop_front() {
            let Some(channel) = channels.get(id) else {
                continue;
            };
            let mut queued = datagram.push_search(channel.cid, &channel.name);
            if !queued {
                if let Some(bytes) = datagram.take() {
                    frames.push(bytes);
                    frames_sent += 1.0;
                    if frames_sent < rung.frames_per_try {
                        queued = datagram.push_search(channel.cid, &channel.name);
                    }
                }
                if !queued {
                    // Out of allowance; first in line next sweep
                    rung.request_pending.push_front(id);
                    break;
                }
            }
            rung.response_pending.push(id);
            channels.set_membership(id, Membership::SearchResponsePending(index));
            rung.attempts = rung.attempts.saturating_add(1);
        }
        if let Some(bytes) = datagram.take() {
            frames.push(bytes);
        }
        if !frames.is_empty() {
            rung.sweep_sequence = Some((sweep_begin, datagram.sequence_number().wrapping_sub(1)));
        }
        trace!(
            "Rung {index} sent {} searches in {} datagrams, {} deferred",
            rung.attempts,
            frames.len(),
            rung.request_pending.len()
        );

        if !rung.is_empty() {
            let period = self.period(index);
            self.rungs[index].deadline = Some(now + period);
        }
        frames
    }

    /// Channels waiting on a rung, as (to send, awaiting reply)
    pub fn rung_members(&self, index: usize) -> (Vec<ChannelId>, Vec<ChannelId>) {
        self.rungs
            .get(index)
            .map(|r| {
                (
                    r.request_pending.iter().copied().collect(),
                    r.response_pending.clone(),
                )
            })
            .unwrap_or_default()
    }

    pub fn frames_per_try(&self, index: usize) -> f64 {
        self.rungs.get(index).map_or(1.0, |r| r.frames_per_try)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::parse_search_packet;

    fn close(a: Duration, b: f64) -> bool {
        (a.as_secs_f64() - b).abs() < 1e-6
    }

    #[test]
    fn round_trip_estimate() {
        let mut estimator = RoundTripEstimator::default();
        assert_eq!(estimator.estimate(), MIN_ROUND_TRIP);
        estimator.update(Duration::from_millis(100));
        assert!(close(estimator.estimate(), 0.0405 + 4.0 * 0.017));
        // Samples are clamped
        let mut estimator = RoundTripEstimator::default();
        estimator.update(Duration::from_micros(1));
        assert_eq!(estimator.estimate(), MIN_ROUND_TRIP);
    }

    #[test]
    fn rung_layout() {
        let ladder = SearchLadder::new(Duration::from_secs(300));
        assert_eq!(ladder.rung_count(), 14);
        assert_eq!(ladder.anomaly_rung(), 8);
        assert_eq!(ladder.period(0), MIN_ROUND_TRIP);
        assert_eq!(ladder.period(3), MIN_ROUND_TRIP * 8);
        assert_eq!(ladder.period(13), Duration::from_secs_f64(0.032 * 8192.0));
        let ladder = SearchLadder::new(Duration::from_secs(60));
        assert_eq!(ladder.rung_count(), 11);
        assert_eq!(ladder.period(20), Duration::from_secs(60));
    }

    #[test]
    fn datagrams_carry_sequence_and_searches() {
        let mut datagram = SearchDatagram::new(1024);
        assert!(datagram.take().is_none());
        assert!(datagram.push_search(4, "FIRST"));
        assert!(datagram.push_search(5, "SECOND"));
        let bytes = datagram.take().unwrap();
        assert_eq!(datagram.sequence_number(), 1);
        let searches = parse_search_packet(&bytes).unwrap();
        assert_eq!(searches.len(), 2);
        assert_eq!(searches[1].channel_name, "SECOND");
        assert_eq!(searches[1].search_id, 5);
        assert!(!searches[0].should_reply);

        let mut small = SearchDatagram::new(48);
        assert!(small.push_search(1, "ABCDEFG"));
        assert!(!small.push_search(2, "ABCDEFG"));
        assert!(SearchDatagram::fits(48, "ABCDEFG"));
        assert!(!SearchDatagram::fits(48, "ABCDEFGHIJKLMNOPQ"));
    }

    /// Drive the ladder with no replies at all and watch one channel climb
    #[test]
    fn unanswered_searches_back_off() {
        let mut channels = ChannelTable::default();
        let mut ladder = SearchLadder::new(Duration::from_secs(300));
        let mut datagram = SearchDatagram::new(1024);
        let start = Instant::now();
        let id = channels.insert("LONELY", 0);
        ladder.install(&mut channels, id, 0, start);

        let mut sends = Vec::new();
        let mut now = start;
        while sends.len() < 20 {
            now = ladder.next_deadline().unwrap();
            for rung in ladder.due(now) {
                if !ladder.expire(rung, &mut channels, &mut datagram, now).is_empty() {
                    let Membership::SearchResponsePending(at) = channels.get(id).unwrap().membership
                    else {
                        panic!("sent channel should await a reply");
                    };
                    sends.push((now, at));
                }
            }
        }
        assert!(now > start);
        for pair in sends.windows(2) {
            assert!(pair[0].1 <= pair[1].1, "rung went down: {pair:?}");
        }
        let intervals: Vec<_> = sends.windows(2).map(|p| p[1].0 - p[0].0).collect();
        for pair in intervals.windows(2) {
            assert!(pair[0] <= pair[1] + Duration::from_millis(1), "{intervals:?}");
        }
        assert_eq!(sends.last().unwrap().1, ladder.rung_count() - 1);
        assert!(intervals.iter().all(|i| *i <= Duration::from_secs(300)));
    }

    #[test]
    fn window_grows_and_defers() {
        let mut channels = ChannelTable::default();
        let mut ladder = SearchLadder::new(Duration::from_secs(300));
        // Room for four short searches per datagram
        let mut datagram = SearchDatagram::new(112);
        let now = Instant::now();
        let ids: Vec<_> = (0..10)
            .map(|i| {
                let id = channels.insert(&format!("CHAN:{i:02}"), 0);
                ladder.install(&mut channels, id, 0, now);
                id
            })
            .collect();

        let frames = ladder.expire(0, &mut channels, &mut datagram, now);
        assert_eq!(frames.len(), 1);
        let (waiting, sent) = ladder.rung_members(0);
        assert_eq!(sent, ids[..4]);
        assert_eq!(waiting, ids[4..]);

        // Every search answered, so the rung goes again straight away
        let reply_at = now + Duration::from_millis(40);
        for id in &ids[..4] {
            let membership = channels.get(*id).unwrap().membership;
            ladder.search_response(*id, membership, Some(0), reply_at);
        }
        assert_eq!(ladder.due(reply_at), vec![0]);

        let frames = ladder.expire(0, &mut channels, &mut datagram, reply_at);
        assert_eq!(ladder.frames_per_try(0), 2.0);
        assert_eq!(frames.len(), 2);
        let (waiting, sent) = ladder.rung_members(0);
        assert!(waiting.is_empty());
        assert_eq!(sent, ids[4..]);

        // Nobody answered: the window collapses and they all climb
        let later = ladder.next_deadline().unwrap();
        ladder.expire(0, &mut channels, &mut datagram, later);
        assert_eq!(ladder.frames_per_try(0), 1.0);
        assert_eq!(ladder.rung_members(1).0, ids[4..]);
    }

    #[test]
    fn replies_from_old_sweeps_are_not_credited() {
        let mut channels = ChannelTable::default();
        let mut ladder = SearchLadder::new(Duration::from_secs(300));
        let mut datagram = SearchDatagram::new(1024);
        let now = Instant::now();
        let a = channels.insert("A", 0);
        ladder.install(&mut channels, a, 0, now);
        ladder.expire(0, &mut channels, &mut datagram, now);
        let b = channels.insert("B", 0);
        ladder.install(&mut channels, b, 0, now);

        let membership = channels.get(a).unwrap().membership;
        ladder.search_response(a, membership, Some(7), now + Duration::from_millis(500));
        // Left the ladder, but no round trip was measured
        assert!(ladder.rung_members(0).1.is_empty());
        assert_eq!(ladder.round_trip().estimate(), MIN_ROUND_TRIP);
    }

    #[test]
    fn anomaly_pulls_slow_channels_down() {
        let mut channels = ChannelTable::default();
        let mut ladder = SearchLadder::new(Duration::from_secs(300));
        let now = Instant::now();
        let slow = channels.insert("SLOW", 0);
        let quick = channels.insert("QUICK", 0);
        ladder.install(&mut channels, slow, 11, now);
        ladder.install(&mut channels, quick, 3, now);

        assert_eq!(ladder.beacon_anomaly(&mut channels, false, now), 1);
        assert_eq!(
            channels.get(slow).unwrap().membership,
            Membership::SearchRequestPending(8)
        );
        assert_eq!(
            channels.get(quick).unwrap().membership,
            Membership::SearchRequestPending(3)
        );
        assert!(ladder.rung_members(11).0.is_empty());
        // The anomaly rung keeps its own pace
        assert!(!ladder.due(now).contains(&8));
    }

    #[test]
    fn network_wide_anomaly_sweeps_at_once() {
        let mut channels = ChannelTable::default();
        let mut ladder = SearchLadder::new(Duration::from_secs(300));
        let now = Instant::now();
        let slow = channels.insert("SLOW", 0);
        ladder.install(&mut channels, slow, 11, now);

        assert_eq!(ladder.beacon_anomaly(&mut channels, true, now), 1);
        assert_eq!(ladder.due(now), vec![8]);

        // Nothing waiting, nothing to sweep
        let mut empty = SearchLadder::new(Duration::from_secs(300));
        assert_eq!(empty.beacon_anomaly(&mut channels, true, now), 0);
        assert_eq!(empty.next_deadline(), None);
    }

    #[test]
    fn removal_from_either_list() {
        let mut channels = ChannelTable::default();
        let mut ladder = SearchLadder::new(Duration::from_secs(300));
        let mut datagram = SearchDatagram::new(1024);
        let now = Instant::now();
        let id = channels.insert("A", 0);
        ladder.install(&mut channels, id, 0, now);
        assert!(ladder.remove(id, Membership::SearchRequestPending(0)));
        assert!(!ladder.remove(id, Membership::SearchRequestPending(0)));

        ladder.install(&mut channels, id, 0, now);
        ladder.expire(0, &mut channels, &mut datagram, now);
        let membership = channels.get(id).unwrap().membership;
        assert_eq!(membership, Membership::SearchResponsePending(0));
        assert!(ladder.remove(id, membership));
        // An empty rung goes idle on its next expiry
        ladder.expire(0, &mut channels, &mut datagram, now + Duration::from_secs(1));
        assert_eq!(ladder.next_deadline(), None);
    }
}
