//! The operations every I/O unit offers, whichever transport it sits on.
//!
//! A channel is always hosted by exactly one unit: the search unit while it
//! is being looked for, or the circuit to the server that answered. Requests
//! go through [`IoUnit`] so that asking the wrong unit for something fails
//! loudly instead of silently doing nothing. Searches themselves leave with
//! the search ladder's sweeps, not through this interface.

use super::{
    ClientError,
    circuit::{CircuitId, VirtualCircuit},
    udp::SearchUnit,
};
use crate::messages::MonitorMask;

/// Which unit currently hosts a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iiu {
    SearchUnit,
    Circuit(CircuitId),
}

pub trait IoUnit {
    /// Who is on the other end, for diagnostics
    fn host_name(&self) -> String;

    fn create_channel_request(
        &mut self,
        cid: u32,
        sid: Option<u32>,
        name: &str,
    ) -> Result<(), ClientError>;

    fn clear_channel_request(&mut self, sid: u32, cid: u32) -> Result<(), ClientError>;

    fn read_request(
        &mut self,
        sid: u32,
        ioid: u32,
        data_type: u16,
        count: u32,
    ) -> Result<(), ClientError>;

    fn write_request(
        &mut self,
        sid: u32,
        cid: u32,
        data_type: u16,
        count: u32,
        data: &[u8],
    ) -> Result<(), ClientError>;

    fn write_notify_request(
        &mut self,
        sid: u32,
        ioid: u32,
        data_type: u16,
        count: u32,
        data: &[u8],
    ) -> Result<(), ClientError>;

    fn subscription_request(
        &mut self,
        sid: u32,
        ioid: u32,
        data_type: u16,
        count: u32,
        mask: MonitorMask,
    ) -> Result<(), ClientError>;

    fn subscription_cancel_request(
        &mut self,
        sid: u32,
        ioid: u32,
        data_type: u16,
        count: u32,
    ) -> Result<(), ClientError>;

    /// Make everything queued so far eligible for sending. Returns whether
    /// there is anything to send.
    fn flush_request(&mut self) -> bool;

    fn pending_bytes(&self) -> usize;
}

impl IoUnit for SearchUnit {
    fn host_name(&self) -> String {
        "<disconnected>".to_owned()
    }

    fn create_channel_request(&mut self, _: u32, _: Option<u32>, _: &str) -> Result<(), ClientError> {
        Err(ClientError::NotConnected)
    }
    fn clear_channel_request(&mut self, _: u32, _: u32) -> Result<(), ClientError> {
        Err(ClientError::NotConnected)
    }
    fn read_request(&mut self, _: u32, _: u32, _: u16, _: u32) -> Result<(), ClientError> {
        Err(ClientError::NotConnected)
    }
    fn write_request(&mut self, _: u32, _: u32, _: u16, _: u32, _: &[u8]) -> Result<(), ClientError> {
        Err(ClientError::NotConnected)
    }
    fn write_notify_request(
        &mut self,
        _: u32,
        _: u32,
        _: u16,
        _: u32,
        _: &[u8],
    ) -> Result<(), ClientError> {
        Err(ClientError::NotConnected)
    }
    fn subscription_request(
        &mut self,
        _: u32,
        _: u32,
        _: u16,
        _: u32,
        _: MonitorMask,
    ) -> Result<(), ClientError> {
        Err(ClientError::NotConnected)
    }
    fn subscription_cancel_request(&mut self, _: u32, _: u32, _: u16, _: u32) -> Result<(), ClientError> {
        Err(ClientError::NotConnected)
    }

    fn flush_request(&mut self) -> bool {
        false
    }

    fn pending_bytes(&self) -> usize {
        0
    }
}

impl VirtualCircuit {
    fn ready(&self) -> Result<(), ClientError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }
}

impl IoUnit for VirtualCircuit {
    fn host_name(&self) -> String {
        self.address.to_string()
    }

    fn create_channel_request(
        &mut self,
        cid: u32,
        sid: Option<u32>,
        name: &str,
    ) -> Result<(), ClientError> {
        self.ready()?;
        Ok(VirtualCircuit::create_channel_request(self, cid, sid, name)?)
    }

    fn clear_channel_request(&mut self, sid: u32, cid: u32) -> Result<(), ClientError> {
        self.ready()?;
        Ok(VirtualCircuit::clear_channel_request(self, sid, cid)?)
    }

    fn read_request(
        &mut self,
        sid: u32,
        ioid: u32,
        data_type: u16,
        count: u32,
    ) -> Result<(), ClientError> {
        self.ready()?;
        Ok(self.read_notify_request(sid, ioid, data_type, count)?)
    }

    fn write_request(
        &mut self,
        sid: u32,
        cid: u32,
        data_type: u16,
        count: u32,
        data: &[u8],
    ) -> Result<(), ClientError> {
        self.ready()?;
        Ok(VirtualCircuit::write_request(self, sid, cid, data_type, count, data)?)
    }

    fn write_notify_request(
        &mut self,
        sid: u32,
        ioid: u32,
        data_type: u16,
        count: u32,
        data: &[u8],
    ) -> Result<(), ClientError> {
        self.ready()?;
        Ok(VirtualCircuit::write_notify_request(
            self, sid, ioid, data_type, count, data,
        )?)
    }

    fn subscription_request(
        &mut self,
        sid: u32,
        ioid: u32,
        data_type: u16,
        count: u32,
        mask: MonitorMask,
    ) -> Result<(), ClientError> {
        self.ready()?;
        Ok(VirtualCircuit::subscription_request(
            self, sid, ioid, data_type, count, mask,
        )?)
    }

    fn subscription_cancel_request(
        &mut self,
        sid: u32,
        ioid: u32,
        data_type: u16,
        count: u32,
    ) -> Result<(), ClientError> {
        self.ready()?;
        Ok(VirtualCircuit::subscription_cancel_request(
            self, sid, ioid, data_type, count,
        )?)
    }

    fn flush_request(&mut self) -> bool {
        self.labor_pending()
    }

    fn pending_bytes(&self) -> usize {
        VirtualCircuit::pending_bytes(self)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::{
        client::EngineConfig,
        wire::{BufferPool, QueueError, WIRE_BUFFER_CAPACITY},
    };

    fn config() -> EngineConfig {
        EngineConfig {
            search_destinations: vec!["127.0.0.1:5064".parse().unwrap()],
            client_name: "tester".to_owned(),
            host_name: "testhost".to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn search_unit_carries_no_requests() {
        let mut unit = SearchUnit::new(&config(), None);
        let iiu: &mut dyn IoUnit = &mut unit;
        assert!(matches!(
            iiu.read_request(1, 2, 6, 1),
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            iiu.create_channel_request(1, None, "PV"),
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            iiu.write_request(1, 2, 6, 1, &[0; 8]),
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            iiu.clear_channel_request(1, 2),
            Err(ClientError::NotConnected)
        ));
        assert!(!iiu.flush_request());
        assert_eq!(iiu.pending_bytes(), 0);
        assert_eq!(iiu.host_name(), "<disconnected>");
    }

    #[test]
    fn circuits_only_carry_requests_once_up() {
        let pool = BufferPool::new(WIRE_BUFFER_CAPACITY, None);
        let mut vc = VirtualCircuit::new("127.0.0.1:5064".parse().unwrap(), 0, 13, &pool, &config());
        let iiu: &mut dyn IoUnit = &mut vc;
        // Nothing may be queued before the socket is up
        assert!(matches!(
            iiu.read_request(1, 2, 6, 1),
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            iiu.create_channel_request(1, None, "PV"),
            Err(ClientError::NotConnected)
        ));
        vc.connected(Instant::now(), "tester", "testhost").unwrap();
        let iiu: &mut dyn IoUnit = &mut vc;
        let before = iiu.pending_bytes();
        iiu.read_request(1, 2, 6, 1).unwrap();
        assert_eq!(iiu.pending_bytes(), before + 16);
        iiu.clear_channel_request(1, 2).unwrap();
        assert_eq!(iiu.pending_bytes(), before + 32);
        assert!(iiu.flush_request());
        assert_eq!(iiu.host_name(), "127.0.0.1:5064");
    }

    #[test]
    fn circuit_back_pressure_is_reported() {
        let pool = BufferPool::new(WIRE_BUFFER_CAPACITY, None);
        let config = EngineConfig {
            send_queue_budget: 100,
            ..config()
        };
        let mut vc = VirtualCircuit::new("127.0.0.1:5064".parse().unwrap(), 0, 13, &pool, &config);
        vc.connected(Instant::now(), "tester", "testhost").unwrap();
        let iiu: &mut dyn IoUnit = &mut vc;
        let mut result = Ok(());
        for ioid in 0..16 {
            result = iiu.read_request(1, ioid, 6, 1);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(
            result,
            Err(ClientError::Queue(QueueError::FlushRequired))
        ));
    }
}
