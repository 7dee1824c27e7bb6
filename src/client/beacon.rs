//! Beacon history, keyed by server address.
//!
//! Servers broadcast a beacon every few seconds. A change in the spacing of
//! those beacons is the cheapest signal we get that something on the network
//! moved: a server came back, a route healed, or an IOC rebooted. Every
//! beacon is folded into a running average, and a sharp deviation from it is
//! reported as an anomaly so the search ladder can retry sooner.

use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use tracing::{debug, trace};

use super::circuit::CircuitId;
use crate::messages::is_v410;

/// Periods this much longer than average suggest a partition healed
const LONG_PERIOD_RATIO: f64 = 1.25;
/// Periods this much longer than average are treated as network-wide
const NETWORK_WIDE_RATIO: f64 = 3.25;
/// Periods this much shorter than average mean the server restarted
const SHORT_PERIOD_RATIO: f64 = 0.80;
/// Weight of the newest period in the running average
const AVERAGE_WEIGHT: f64 = 0.125;

/// What a beacon says about a circuit already open to its server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitSignal {
    /// The beacon arrived on schedule; the circuit watchdog may be refreshed
    Alive,
    /// Beacon timing changed; the circuit should prove itself with an echo
    Suspect,
}

/// The outcome of folding one beacon into the table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BeaconVerdict {
    /// Channels waiting in slow search rungs should be retried promptly
    pub anomaly: bool,
    /// The anomaly looks like a network-wide event rather than one server
    pub network_wide: bool,
    pub circuit: Option<(CircuitId, CircuitSignal)>,
}

#[derive(Debug, Default)]
struct BeaconEntry {
    /// When the last beacon arrived; `None` until one has been seen
    timestamp: Option<Instant>,
    /// Only meaningful once two beacons have been seen
    average_period: Option<Duration>,
    last_beacon_number: Option<u32>,
    circuit: Option<CircuitId>,
    anomaly: bool,
}

impl BeaconEntry {
    fn update_period(
        &mut self,
        program_begin: Instant,
        now: Instant,
        beacon_number: u32,
        protocol_version: u16,
    ) -> BeaconVerdict {
        let mut verdict = BeaconVerdict::default();

        let Some(last_seen) = self.timestamp else {
            // Entry created for a circuit; this is the first beacon we have
            // seen since, so only seed it
            if let Some(circuit) = self.circuit {
                verdict.circuit = Some((circuit, CircuitSignal::Suspect));
            }
            self.timestamp = Some(now);
            self.last_beacon_number = Some(beacon_number);
            return verdict;
        };

        if is_v410(protocol_version) {
            if let Some(last) = self.last_beacon_number {
                let advance = beacon_number.wrapping_sub(last);
                self.last_beacon_number = Some(beacon_number);
                // Duplicated or reordered by a redundant route
                if advance == 0 || advance > u32::MAX - 256 {
                    trace!("Discarding beacon {beacon_number}: not after {last}");
                    return verdict;
                }
                // A short skip is more likely a duplicate path than lost beacons
                if advance > 1 && advance < 4 {
                    trace!("Discarding beacon {beacon_number}: short jump from {last}");
                    return verdict;
                }
            } else {
                self.last_beacon_number = Some(beacon_number);
            }
        }

        let period = now.saturating_duration_since(last_seen);
        match self.average_period {
            None => {
                if let Some(circuit) = self.circuit {
                    verdict.circuit = Some((circuit, CircuitSignal::Suspect));
                }
                // A second beacon arriving sooner than the program has been
                // running means the server is new to us, not to the network
                if period <= last_seen.saturating_duration_since(program_begin) {
                    verdict.anomaly = true;
                    verdict.network_wide = true;
                }
                self.average_period = Some(period);
            }
            Some(average) => {
                let ratio = period.as_secs_f64() / average.as_secs_f64().max(f64::EPSILON);
                if ratio >= LONG_PERIOD_RATIO {
                    verdict.anomaly = true;
                    verdict.network_wide = ratio >= NETWORK_WIDE_RATIO;
                } else if ratio <= SHORT_PERIOD_RATIO {
                    verdict.anomaly = true;
                    verdict.network_wide = true;
                }
                if let Some(circuit) = self.circuit {
                    let signal = if verdict.anomaly {
                        CircuitSignal::Suspect
                    } else {
                        CircuitSignal::Alive
                    };
                    verdict.circuit = Some((circuit, signal));
                }
                self.average_period = Some(Duration::from_secs_f64(
                    period.as_secs_f64() * AVERAGE_WEIGHT
                        + average.as_secs_f64() * (1.0 - AVERAGE_WEIGHT),
                ));
            }
        }
        self.anomaly = verdict.anomaly;
        self.timestamp = Some(now);
        verdict
    }
}

/// History of every server we have heard a beacon from or connected to
#[derive(Debug)]
pub struct BeaconTable {
    program_begin: Instant,
    entries: HashMap<SocketAddr, BeaconEntry>,
    anomaly_count: u64,
}

impl BeaconTable {
    pub fn new(program_begin: Instant) -> Self {
        BeaconTable {
            program_begin,
            entries: HashMap::new(),
            anomaly_count: 0,
        }
    }

    /// Fold a beacon from `address` into the history
    pub fn beacon_arrived(
        &mut self,
        address: SocketAddr,
        now: Instant,
        beacon_number: u32,
        protocol_version: u16,
    ) -> BeaconVerdict {
        let Some(entry) = self.entries.get_mut(&address) else {
            // Wait for a second beacon before deciding whether this is a new
            // server or one we have only just started listening to
            debug!("First beacon from {address}");
            self.entries.insert(
                address,
                BeaconEntry {
                    timestamp: Some(now),
                    last_beacon_number: Some(beacon_number),
                    ..Default::default()
                },
            );
            return BeaconVerdict::default();
        };
        let verdict = entry.update_period(self.program_begin, now, beacon_number, protocol_version);
        if verdict.network_wide {
            self.anomaly_count += 1;
        }
        verdict
    }

    /// Associate a circuit with a server, creating an unseeded entry if needed
    pub fn register_circuit(&mut self, address: SocketAddr, circuit: CircuitId) {
        self.entries.entry(address).or_default().circuit = Some(circuit);
    }

    /// Forget a circuit; the next beacon from its server reseeds the history
    pub fn unregister_circuit(&mut self, address: SocketAddr, circuit: CircuitId) {
        if let Some(entry) = self.entries.get_mut(&address)
            && entry.circuit == Some(circuit)
        {
            entry.circuit = None;
            entry.timestamp = None;
            entry.average_period = None;
        }
    }

    pub fn average_period(&self, address: &SocketAddr) -> Option<Duration> {
        self.entries.get(address).and_then(|e| e.average_period)
    }

    pub fn is_anomalous(&self, address: &SocketAddr) -> bool {
        self.entries.get(address).is_some_and(|e| e.anomaly)
    }

    /// Network-wide anomalies seen since startup
    pub fn anomaly_count(&self) -> u64 {
        self.anomaly_count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn server() -> SocketAddr {
        "10.0.0.1:5064".parse().unwrap()
    }

    /// Beacons every ten seconds, long after startup
    fn steady_table(start: Instant) -> (BeaconTable, Instant, u32) {
        let mut table = BeaconTable::new(start);
        let mut now = start;
        let mut number = 0;
        for _ in 0..4 {
            let verdict = table.beacon_arrived(server(), now, number, 13);
            assert!(!verdict.anomaly);
            now += Duration::from_secs(10);
            number += 1;
        }
        (table, now - Duration::from_secs(10), number)
    }

    #[test]
    fn first_beacon_only_seeds() {
        let start = Instant::now();
        let mut table = BeaconTable::new(start);
        let verdict = table.beacon_arrived(server(), start + Duration::from_secs(3), 7, 13);
        assert_eq!(verdict, BeaconVerdict::default());
        assert_eq!(table.average_period(&server()), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn late_beacon_is_an_anomaly() {
        let start = Instant::now();
        let (mut table, last, number) = steady_table(start);
        assert_eq!(table.average_period(&server()), Some(Duration::from_secs(10)));

        let verdict = table.beacon_arrived(server(), last + Duration::from_secs(13), number, 13);
        assert!(verdict.anomaly);
        assert!(!verdict.network_wide);
        assert!(table.is_anomalous(&server()));
        assert_eq!(table.anomaly_count(), 0);
    }

    #[test]
    fn very_late_beacon_is_network_wide() {
        let start = Instant::now();
        let (mut table, last, number) = steady_table(start);
        let verdict = table.beacon_arrived(server(), last + Duration::from_secs(33), number, 13);
        assert!(verdict.anomaly);
        assert!(verdict.network_wide);
        assert_eq!(table.anomaly_count(), 1);
    }

    #[test]
    fn early_beacon_means_restart() {
        let start = Instant::now();
        let (mut table, last, number) = steady_table(start);
        let verdict = table.beacon_arrived(server(), last + Duration::from_secs(2), number, 13);
        assert!(verdict.anomaly);
        assert!(verdict.network_wide);

        // Back on schedule clears the flag
        let verdict =
            table.beacon_arrived(server(), last + Duration::from_secs(11), number + 1, 13);
        assert!(!verdict.anomaly);
        assert!(!table.is_anomalous(&server()));
    }

    #[test]
    fn duplicate_sequence_numbers_are_ignored() {
        let start = Instant::now();
        let (mut table, last, number) = steady_table(start);
        // Same number again, and a short jump, are both dropped
        let verdict = table.beacon_arrived(server(), last + Duration::from_secs(2), number - 1, 13);
        assert!(!verdict.anomaly);
        let verdict = table.beacon_arrived(server(), last + Duration::from_secs(2), number + 1, 13);
        assert!(!verdict.anomaly);
        // Servers before 4.10 do not number beacons
        let verdict = table.beacon_arrived(server(), last + Duration::from_secs(2), 0, 9);
        assert!(verdict.anomaly);
    }

    #[test]
    fn new_server_appearing_after_startup() {
        let start = Instant::now();
        let mut table = BeaconTable::new(start);
        let first = start + Duration::from_secs(60);
        table.beacon_arrived(server(), first, 0, 13);
        let verdict = table.beacon_arrived(server(), first + Duration::from_secs(15), 1, 13);
        assert!(verdict.anomaly);

        // Whereas one heard right at startup is just the regular cadence
        let other: SocketAddr = "10.0.0.2:5064".parse().unwrap();
        table.beacon_arrived(other, start, 0, 13);
        let verdict = table.beacon_arrived(other, start + Duration::from_secs(15), 1, 13);
        assert!(!verdict.anomaly);
    }

    #[test]
    fn circuit_signals() {
        let start = Instant::now();
        let mut circuits: SlotMap<CircuitId, ()> = SlotMap::with_key();
        let circuit = circuits.insert(());
        let mut table = BeaconTable::new(start);
        table.register_circuit(server(), circuit);

        // Unseeded: the first beacon makes the circuit suspect
        let now = start + Duration::from_secs(100);
        let verdict = table.beacon_arrived(server(), now, 0, 13);
        assert_eq!(verdict.circuit, Some((circuit, CircuitSignal::Suspect)));
        let verdict = table.beacon_arrived(server(), now + Duration::from_secs(10), 1, 13);
        assert_eq!(verdict.circuit, Some((circuit, CircuitSignal::Suspect)));
        let verdict = table.beacon_arrived(server(), now + Duration::from_secs(20), 2, 13);
        assert_eq!(verdict.circuit, Some((circuit, CircuitSignal::Alive)));

        // Stale handles do not clear another circuit's registration
        table.unregister_circuit(server(), CircuitId::default());
        let verdict = table.beacon_arrived(server(), now + Duration::from_secs(30), 3, 13);
        assert!(verdict.circuit.is_some());

        table.unregister_circuit(server(), circuit);
        let verdict = table.beacon_arrived(server(), now + Duration::from_secs(40), 4, 13);
        assert_eq!(verdict, BeaconVerdict::default());
        assert_eq!(table.average_period(&server()), None);
    }
}
