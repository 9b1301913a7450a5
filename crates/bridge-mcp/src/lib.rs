//! MCP JSON-RPC surface over the bridge's tool operations. Two transports
//! are provided: line/`Content-Length`-framed stdio ([`stdio`]) and a
//! streamable HTTP endpoint ([`http`]) built on `axum`. Both share the same
//! [`rpc::Dispatcher`], which maps `tools/call` onto `bridge_core::ToolSurface`
//! and classifies failures into the JSON-RPC error codes MCP clients expect.

pub mod http;
pub mod profile;
pub mod rpc;
pub mod stdio;
pub mod tools;

pub use profile::ToolProfile;
pub use rpc::Dispatcher;
