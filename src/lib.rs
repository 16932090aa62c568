//! # Model Context Protocol (MCP) Rust server runtime
//!
//! This crate implements the server side of the Model Context Protocol (MCP): a JSON-RPC 2.0
//! dispatcher with tool, prompt and resource registries, a streamable HTTP transport with
//! sessions and resumable server-sent event streams, and a request bridge that lets a running
//! handler ask the connected client for input (elicitation) or a model completion (sampling).
//!
//! ## Features
//!
//! - Tool/prompt/resource registries with JSON Schema validation and URI templates
//! - Onion-style middleware and hierarchical composition via [`McpServer::group`]
//! - Streamable HTTP transport (POST/GET/DELETE) built on axum
//! - In-memory session and event store with bounded, replayable event logs
//! - Stdio transport and a client for driving MCP servers
//!
//! ## Example
//!
//! ```no_run
//! use mcp_server_rs::server::{McpServer, ServerOptions, ToolDef};
//! use mcp_server_rs::transport::http::{HttpTransportOptions, StreamableHttpTransport};
//! use mcp_server_rs::CallToolResult;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = McpServer::new(ServerOptions::new("demo", "0.1.0"));
//!     server.tool(ToolDef::new("hello"), |_args, _ctx| async move {
//!         Ok(CallToolResult::text("hello"))
//!     });
//!
//!     let transport = StreamableHttpTransport::new(server, HttpTransportOptions::default());
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//!     axum::serve(listener, transport.router()).await?;
//!     Ok(())
//! }
//! ```

/// Bridge for server-to-client requests (elicitation, sampling)
pub mod bridge;
/// Client module provides an MCP client implementation
pub mod client;
/// Configuration file handling
pub mod config;
/// Error types and handling for the crate
pub mod error;
/// Leveled logger interface used by the protocol engine
pub mod logger;
/// JSON-RPC envelope types
pub mod protocol;
/// Dispatcher, registries and middleware
pub mod server;
/// Session metadata and replayable event log
pub mod store;
/// Transport layer implementations (stdio, streamable HTTP)
pub mod transport;
/// Common MCP types used throughout the crate
pub mod types;

// Re-export commonly used types for convenience
pub use error::Error;
pub use protocol::{Notification, Request, RequestId, Response};
pub use server::McpServer;
pub use types::*;

/// The latest supported protocol version of MCP
///
/// Under this version clients must send the protocol-version header on every request after
/// `initialize`, and JSON-RPC batches are rejected.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

/// The oldest supported protocol version, used as the negotiation fallback.
pub const LEGACY_PROTOCOL_VERSION: &str = "2025-03-26";

/// List of all protocol versions supported by this crate, most recent first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[LATEST_PROTOCOL_VERSION, LEGACY_PROTOCOL_VERSION];

/// JSON-RPC version used by the MCP protocol
pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol generations with different transport rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolGeneration {
    /// `2025-03-26`: version header optional, batches accepted.
    Legacy,
    /// `2025-06-18`: version header required, batches rejected.
    Latest,
}

impl ProtocolGeneration {
    pub fn of(version: &str) -> Self {
        if version == LATEST_PROTOCOL_VERSION {
            ProtocolGeneration::Latest
        } else {
            ProtocolGeneration::Legacy
        }
    }
}

/// Returns true if `version` is one of [`SUPPORTED_PROTOCOL_VERSIONS`].
pub fn is_supported_protocol_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

/// Picks the version to answer an `initialize` with.
///
/// A supported request is echoed back; anything else negotiates down to the most
/// backward-compatible version instead of failing.
pub fn negotiate_protocol_version(requested: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .copied()
        .find(|v| *v == requested)
        .unwrap_or(LEGACY_PROTOCOL_VERSION)
}
