//! Model Context Protocol (MCP) client.
//!
//! Connects to remote MCP servers to list and call their tools, read
//! resources and fetch prompts.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────┐
//! │  McpClient  │────▶│  Transport   │────▶│ MCP Server  │
//! │             │◀────│ (HTTP / SSE) │◀────│             │
//! └─────────────┘     └──────────────┘     └─────────────┘
//!                            │
//!                     ┌──────────────┐
//!                     │    OAuth     │
//!                     └──────────────┘
//! ```
//!
//! # Supported Transports
//!
//! - **http**: Streamable HTTP (POST per message, optional inbound SSE stream)
//! - **sse**: Legacy HTTP+SSE (GET stream announcing a POST endpoint)
//! - **mock**: In-process server double for tests
//!
//! # Example
//!
//! ```no_run
//! use mcplink_client::{McpClient, McpClientConfig, ToolSchemas, TransportConfig};
//!
//! # async fn example() -> mcplink_client::McpResult<()> {
//! let config = TransportConfig::http("https://mcp.example.com/mcp");
//! let client = McpClient::connect_with(&config, None, McpClientConfig::default()).await?;
//!
//! for tool in client.tools(&ToolSchemas::Automatic).await? {
//!     println!("{}", tool.name);
//! }
//!
//! let result = client
//!     .call_tool("read_file", serde_json::json!({"path": "/tmp/x"}), None)
//!     .await?;
//! println!("{:?}", result.first_text());
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod http;
pub mod mock;
pub mod oauth;
pub mod protocol;
pub mod sse;
mod sse_transport;
mod transport;

pub use client::{
    ElicitationHandler, McpClient, McpClientConfig, RemoteTool, ToolOutput, ToolSchema,
    ToolSchemas, UncaughtErrorHandler,
};
pub use error::{McpError, McpResult, TransportKind};
pub use http::HttpTransport;
pub use mock::MockTransport;
pub use oauth::{
    auth, AuthOptions, AuthResult, InMemoryOAuthProvider, OAuthClientProvider, OAuthConfig,
    OAuthState, OAuthTokens, OAUTH_CALLBACK_PATH, OAUTH_CALLBACK_PORT,
};
pub use protocol::{CallToolResult, McpTool, ToolContent};
pub use sse_transport::SseTransport;
pub use transport::{
    create_transport, CloseHandler, EndpointConfig, ErrorHandler, MessageHandler, Transport,
    TransportConfig, TransportHandlers,
};
