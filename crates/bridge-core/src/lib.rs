//! The bridge's protocol core: session lifecycle, peer admission, chunked
//! file transfer, the replicated key/value store, and the tool-surface
//! operations an MCP server exposes as tools.

pub mod error;
pub mod event_queue;
pub mod file_transfer;
pub mod handshake;
pub mod peer_table;
pub mod protocol_bus;
pub mod registry;
pub mod session;
pub mod state_engine;
pub mod time;
pub mod tool_surface;

pub use error::{BridgeError, BridgeResult};
pub use event_queue::EventQueue;
pub use file_transfer::{FileSendOptions, FileTransferEngine};
pub use handshake::HandshakeEngine;
pub use protocol_bus::ProtocolEventBus;
pub use registry::SessionRegistry;
pub use session::{BridgeSession, SendOutcome, SessionSnapshot, SessionStatus};
pub use state_engine::StateEngine;
pub use tool_surface::{Capabilities, ToolSurface, TransportFactory};
