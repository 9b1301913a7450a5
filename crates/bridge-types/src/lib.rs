//! Wire and configuration types shared by every bridge crate.
//!
//! Nothing here owns state or I/O: this crate is the vocabulary the
//! session, the protocol engines, and the tool surface all speak.

pub mod config;
pub mod envelope;
pub mod events;
pub mod peer;
pub mod transfer;

pub use config::SessionConfig;
pub use envelope::*;
pub use events::BridgeEvent;
pub use peer::{HandshakeState, PeerRecord};
pub use transfer::{IncomingTransferSummary, OutgoingTransferSummary, TransferDirection, TransferStatus};
