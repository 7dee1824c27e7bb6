//! Client side of the EPICS Channel Access (CA) protocol, in pure rust.
//!
//! This crate finds process variables on the network and holds connections
//! to the servers that host them. It does not depend on the C-based
//! [epics-base] project at all.
//!
//! <div class="warning">This is a very early version of this library. Interfaces or
//! structure may be changed around wildly between versions until a comfortable
//! final design is settled upon.</div>
//!
//! The crate is split into:
//!
//! - Mapping and serialization/deserialization of message types, in module [messages].
//! - Sizes and names of the ["DBR" types] values travel as, in module [dbr].
//! - Framed send and receive queues for virtual circuits, in module [wire].
//! - The [client] engine: channel search with backoff, beacon anomaly
//!   detection, virtual circuits and request bookkeeping. [`client::EngineState`]
//!   holds all of it and never touches a socket, [`client::Context`] puts it
//!   behind a lock, and [`Client`] runs it on tokio.
//!
//! ## Example
//!
//! Read a single value, as raw `DBR_DOUBLE` bytes:
//!
//! ```no_run
//! use epicars_cac::{Client, client::Notification};
//! use tokio_stream::StreamExt;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut client = Client::new().await.unwrap();
//!     let mut notifications = client.notifications().unwrap();
//!     let channel = client.create_channel("NUMERIC_VALUE", 0).unwrap();
//!     while let Some(notification) = notifications.next().await {
//!         match notification {
//!             Notification::ConnectionChanged { connected: true, .. } => {
//!                 client.read(channel, 6, 1).unwrap();
//!                 client.flush();
//!             }
//!             Notification::ReadCompleted { data, .. } => {
//!                 let value = f64::from_be_bytes(data[..8].try_into().unwrap());
//!                 println!("NUMERIC_VALUE = {value}");
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//!     client.shutdown().await;
//! }
//! ```
//!
//! [epics-base]: https://github.com/epics-base/epics-base
//! ["DBR" types]: https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types

pub mod client;
pub mod dbr;
pub mod messages;
pub mod utils;
pub mod wire;

pub use client::{Client, ClientBuilder};
