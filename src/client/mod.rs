//! The Channel Access client engine.
//!
//! [`EngineState`] holds every channel, circuit and timer and is driven by
//! plain method calls. [`Context`] puts it behind a lock and delivers
//! [`Notification`]s, and [`Client`] runs a [`Context`] on tokio sockets.

use std::io;

use thiserror::Error;

use crate::{messages::MessageError, wire::QueueError};

mod beacon;
mod channel;
mod circuit;
mod config;
mod context;
mod dispatch;
mod engine;
mod events;
mod governor;
mod iiu;
mod repeater;
mod runtime;
mod search;
mod udp;

pub use beacon::{BeaconTable, BeaconVerdict, CircuitSignal};
pub use channel::{ChannelId, ChannelInfo, ChannelState, IoId};
pub use circuit::{CircuitId, CircuitState, DisconnectCause};
pub use config::EngineConfig;
pub use context::Context;
pub use engine::{Effects, EngineState, IoRequest, SendLabor};
pub use events::{EventHandler, Notification};
pub use iiu::{Iiu, IoUnit};
pub use runtime::{Client, ClientBuilder};
pub use search::{RoundTripEstimator, SearchLadder};

/// Highest channel priority a client may ask for
pub const MAX_PRIORITY: u8 = 99;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("{0}")]
    IO(#[from] io::Error),
    #[error("{0}")]
    Message(#[from] MessageError),
    #[error("{0}")]
    Queue(#[from] QueueError),
    #[error("The channel is not connected")]
    NotConnected,
    #[error("The channel does not exist or is already closed")]
    BadChannel,
    #[error("No such outstanding request")]
    BadIo,
    #[error("Invalid channel name")]
    BadName,
    #[error("Invalid data type {0}")]
    BadType(u16),
    #[error("Invalid element count")]
    BadCount,
    #[error("Invalid channel priority {0}")]
    BadPriority(u32),
    #[error("Read access denied")]
    NoReadAccess,
    #[error("Write access denied")]
    NoWriteAccess,
    #[error("Not supported by this server")]
    Unsupported,
    #[error("The Client is closing or has closed")]
    ClientClosed,
}
