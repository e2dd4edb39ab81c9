//! Link layer for the sounding-rocket ground station.
//!
//! Modem output is decoded into typed packets by the serial reader, paired by
//! the fusion engine and relayed as newline-delimited JSON to the partner
//! station. Components talk through [`bus::SubscriptionRegistry`] callbacks and
//! receive their dependencies explicitly at construction.

pub mod bus;
pub mod codec;
pub mod diagnostics;
pub mod fusion;
pub mod network;
pub mod packets;
pub mod prelude;
pub mod serial;

pub use fusion::FusionEngine;
pub use network::{ConnectionState, NetworkRelay};
pub use packets::{FusedRecord, OutboundMessage};
pub use prelude::{LinkError, LinkResult};
pub use serial::SerialLinkReader;
