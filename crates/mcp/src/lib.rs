//! # OmniBridge MCP
//!
//! Client side of the Model Context Protocol. Each configured tool server
//! gets one [`McpSession`] (stdio child process or streamable HTTP); the
//! [`ToolProtocolClient`] merges their tool lists and routes calls.

pub mod client;
pub mod protocol;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::ToolProtocolClient;
pub use session::{Endpoint, McpSession};
pub use transport::{HttpTransport, StdioTransport, Transport};
