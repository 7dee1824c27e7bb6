//! Registration with the local beacon repeater.
//!
//! Only one process per host can own the beacon port, so servers' beacons
//! reach us through a repeater that fans them out to every registered client.
//! We keep asking until it confirms.

use std::{
    net::{Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::messages::{AsBytes, RepeaterRegister};

#[derive(Debug)]
pub struct RepeaterRegistration {
    port: u16,
    local_ip: Option<Ipv4Addr>,
    period: Duration,
    warn_after: u32,
    attempts: u32,
    warned: bool,
    confirmed: bool,
    deadline: Option<Instant>,
}

impl RepeaterRegistration {
    pub fn new(port: u16, local_ip: Option<Ipv4Addr>, period: Duration, warn_after: u32) -> Self {
        RepeaterRegistration {
            port,
            local_ip,
            period,
            warn_after,
            attempts: 0,
            warned: false,
            confirmed: false,
            deadline: None,
        }
    }

    /// Register on the next timer pass
    pub fn start(&mut self, now: Instant) {
        if !self.confirmed {
            self.deadline = Some(now);
        }
    }

    /// Build the next registration attempt, and the address to send it to
    pub fn expire(&mut self, now: Instant) -> Option<(Vec<u8>, SocketAddr)> {
        self.deadline = None;
        if self.confirmed {
            return None;
        }
        if self.attempts > self.warn_after && !self.warned {
            warn!(
                "Unable to contact a CA repeater on port {} after {} tries; beacons will not be received",
                self.port, self.warn_after
            );
            self.warned = true;
        }
        // Older repeaters only accept one of these, so alternate
        let client_ip = if self.attempts & 1 == 1 {
            self.local_ip.unwrap_or(Ipv4Addr::LOCALHOST)
        } else {
            Ipv4Addr::LOCALHOST
        };
        self.attempts += 1;
        self.deadline = Some(now + self.period);
        Some((
            RepeaterRegister { client_ip }.as_bytes(),
            SocketAddr::from((Ipv4Addr::LOCALHOST, self.port)),
        ))
    }

    pub fn confirm(&mut self, repeater_ip: Ipv4Addr) {
        if !self.confirmed {
            debug!(
                "Registered with repeater at {repeater_ip} after {} attempts",
                self.attempts
            );
        }
        self.confirmed = true;
        self.deadline = None;
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }
    pub fn has_warned(&self) -> bool {
        self.warned
    }
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }
}
