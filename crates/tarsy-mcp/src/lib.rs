//! MCP integration: server registry (C4) and client (C5) for driving
//! Model Context Protocol tool servers over a stdio JSON-RPC transport.

pub mod client;
pub mod registry;
pub mod transport;

pub use client::McpClient;
pub use registry::{resolve_env, McpServerRegistry};
pub use transport::StdioTransport;
