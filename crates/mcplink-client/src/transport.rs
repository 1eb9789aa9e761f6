//! MCP transport contract.
//!
//! Every transport exposes the same capability set: `start`, `send`,
//! `close`, plus three callbacks for inbound messages, transport errors and
//! closure. The client drives any implementation identically.

use crate::error::{McpError, McpResult};
use crate::http::HttpTransport;
use crate::oauth::OAuthClientProvider;
use crate::protocol::JsonRpcMessage;
use crate::sse_transport::SseTransport;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Callback for inbound JSON-RPC messages.
pub type MessageHandler = Arc<dyn Fn(JsonRpcMessage) + Send + Sync>;
/// Callback for transport and protocol errors that do not belong to one caller.
pub type ErrorHandler = Arc<dyn Fn(McpError) + Send + Sync>;
/// Callback fired once when the transport closes.
pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;

/// The callback set a transport reports through.
#[derive(Clone, Default)]
pub struct TransportHandlers {
    pub on_message: Option<MessageHandler>,
    pub on_error: Option<ErrorHandler>,
    pub on_close: Option<CloseHandler>,
}

impl TransportHandlers {
    pub fn on_message(mut self, f: impl Fn(JsonRpcMessage) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(McpError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_close(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }
}

/// Shared slot holding a transport's callbacks.
///
/// Callbacks are cloned out before they run, so a callback may replace the
/// handlers without deadlocking. `on_close` fires at most once.
#[derive(Default)]
pub(crate) struct HandlerSlot {
    handlers: RwLock<TransportHandlers>,
    close_fired: AtomicBool,
}

impl HandlerSlot {
    pub(crate) fn set(&self, handlers: TransportHandlers) {
        let mut slot = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        *slot = handlers;
    }

    fn snapshot(&self) -> TransportHandlers {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Messages arriving after `on_close` are dropped.
    pub(crate) fn message(&self, message: JsonRpcMessage) {
        if self.close_fired.load(Ordering::SeqCst) {
            return;
        }
        if let Some(f) = self.snapshot().on_message {
            f(message);
        }
    }

    /// Errors arriving after `on_close` are dropped.
    pub(crate) fn error(&self, error: McpError) {
        if self.close_fired.load(Ordering::SeqCst) {
            return;
        }
        if let Some(f) = self.snapshot().on_error {
            f(error);
        }
    }

    pub(crate) fn closed(&self) {
        if self.close_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(f) = self.snapshot().on_close {
            f();
        }
    }
}

/// Transport trait for MCP communication.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Install the callbacks. Call before `start`.
    fn set_handlers(&self, handlers: TransportHandlers);

    /// Open the connection.
    async fn start(&self) -> McpResult<()>;

    /// Send one message. Replies arrive through `on_message`.
    async fn send(&self, message: JsonRpcMessage) -> McpResult<()>;

    /// Tear down the connection. Idempotent; `on_close` fires exactly once.
    async fn close(&self) -> McpResult<()>;
}

fn default_timeout() -> u64 {
    60
}

/// Connection settings shared by the HTTP-based transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    /// Server URL.
    pub url: String,

    /// Static headers sent with every request.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Timeout in seconds for individual POST/DELETE requests.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Which transport to build, selected by the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Streamable HTTP.
    Http(EndpointConfig),
    /// Legacy HTTP+SSE.
    Sse(EndpointConfig),
}

impl TransportConfig {
    /// Create a Streamable HTTP configuration.
    pub fn http(url: impl Into<String>) -> Self {
        Self::Http(EndpointConfig {
            url: url.into(),
            headers: HashMap::new(),
            timeout_secs: default_timeout(),
        })
    }

    /// Create a legacy SSE configuration.
    pub fn sse(url: impl Into<String>) -> Self {
        Self::Sse(EndpointConfig {
            url: url.into(),
            headers: HashMap::new(),
            timeout_secs: default_timeout(),
        })
    }

    /// Add a static header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.endpoint_mut().headers.insert(key.into(), value.into());
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.endpoint_mut().timeout_secs = secs;
        self
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        match self {
            Self::Http(e) | Self::Sse(e) => e,
        }
    }

    fn endpoint_mut(&mut self) -> &mut EndpointConfig {
        match self {
            Self::Http(e) | Self::Sse(e) => e,
        }
    }
}

/// Build the transport a configuration names.
///
/// The auth provider is only used by the Streamable HTTP transport.
pub fn create_transport(
    config: &TransportConfig,
    auth_provider: Option<Arc<dyn OAuthClientProvider>>,
) -> McpResult<Arc<dyn Transport>> {
    match config {
        TransportConfig::Http(endpoint) => {
            let mut transport = HttpTransport::new(endpoint)?;
            if let Some(provider) = auth_provider {
                transport = transport.with_auth_provider(provider);
            }
            Ok(Arc::new(transport))
        }
        TransportConfig::Sse(endpoint) => Ok(Arc::new(SseTransport::new(endpoint)?)),
    }
}

/// `User-Agent` sent by both transports.
pub(crate) fn user_agent() -> String {
    format!("mcplink/{}", env!("CARGO_PKG_VERSION"))
}
