//! # ailoy-broker — message substrate for the ailoy runtime
//!
//! Routes typed packets between [`Runtime`] clients and VM workers over a
//! named transport. The wire protocol is a framed binary packet
//! ([`Packet`]) with a JSON body; the shipped transport is in-process, and
//! the framing is socket-ready for a TCP transport behind the same seam.

#![deny(missing_docs)]

pub mod broker;
pub mod error;
pub mod packet;
pub mod runtime;
pub mod transport;

pub use broker::{BrokerHandle, spawn};
pub use error::BrokerError;
pub use packet::{Packet, PacketType};
pub use runtime::{FrameStream, Runtime};
pub use transport::{Connection, PeerKind};
