//! MCP client.
//!
//! One client talks to one server over one transport. It assigns request
//! ids, correlates responses back to the awaiting caller and answers
//! server-initiated requests such as elicitation.

use crate::error::{McpError, McpResult};
use crate::oauth::OAuthClientProvider;
use crate::protocol::{
    error_codes, CallToolParams, CallToolResult, ClientCapabilities, ElicitRequestParams,
    ElicitResult, GetPromptParams, GetPromptResult, Implementation, InitializeParams,
    InitializeResult, JsonRpcErrorResponse, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult,
    ListToolsResult, McpTool, PaginatedParams, ReadResourceParams, ReadResourceResult, RequestId,
    ServerCapabilities, LATEST_PROTOCOL_VERSION, METHOD_ELICITATION_CREATE, METHOD_INITIALIZE,
    METHOD_INITIALIZED, METHOD_PROMPTS_GET, METHOD_PROMPTS_LIST, METHOD_RESOURCES_LIST,
    METHOD_RESOURCES_READ, METHOD_RESOURCE_TEMPLATES_LIST, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
    SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::transport::{create_transport, Transport, TransportConfig, TransportHandlers};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Answers `elicitation/create` requests from the server.
#[async_trait]
pub trait ElicitationHandler: Send + Sync {
    async fn elicit(&self, params: ElicitRequestParams) -> McpResult<ElicitResult>;
}

/// Receives errors that no caller is waiting for.
pub type UncaughtErrorHandler = Arc<dyn Fn(McpError) + Send + Sync>;

/// Client settings.
#[derive(Clone)]
pub struct McpClientConfig {
    /// Name reported in `clientInfo`.
    pub name: String,
    /// Version reported in `clientInfo`.
    pub version: String,
    /// How long a request may wait for its response.
    pub request_timeout: Duration,
    pub elicitation_handler: Option<Arc<dyn ElicitationHandler>>,
    pub on_uncaught_error: Option<UncaughtErrorHandler>,
}

impl Default for McpClientConfig {
    fn default() -> Self {
        let info = Implementation::default();
        Self {
            name: info.name,
            version: info.version,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            elicitation_handler: None,
            on_uncaught_error: None,
        }
    }
}

impl McpClientConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Advertise the elicitation capability and route requests to `handler`.
    pub fn with_elicitation_handler(mut self, handler: Arc<dyn ElicitationHandler>) -> Self {
        self.elicitation_handler = Some(handler);
        self
    }

    pub fn on_uncaught_error(mut self, f: impl Fn(McpError) + Send + Sync + 'static) -> Self {
        self.on_uncaught_error = Some(Arc::new(f));
        self
    }
}

type PendingCall = oneshot::Sender<McpResult<Value>>;

struct ClientInner {
    transport: Arc<dyn Transport>,
    config: McpClientConfig,
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, PendingCall>>,
    server: RwLock<Option<InitializeResult>>,
    closed: AtomicBool,
}

/// Connection to a single MCP server.
///
/// Cloning is cheap; clones share the connection.
#[derive(Clone)]
pub struct McpClient {
    inner: Arc<ClientInner>,
}

impl McpClient {
    /// Start `transport` and run the `initialize` handshake.
    ///
    /// On failure the transport is closed again.
    pub async fn connect(transport: Arc<dyn Transport>, config: McpClientConfig) -> McpResult<Self> {
        let inner = Arc::new(ClientInner {
            transport,
            config,
            next_id: AtomicI64::new(0),
            pending: Mutex::new(HashMap::new()),
            server: RwLock::new(None),
            closed: AtomicBool::new(true),
        });
        inner.transport.set_handlers(handlers_for(Arc::downgrade(&inner)));

        let client = Self { inner };
        if let Err(e) = client.initialize().await {
            let _ = client.close().await;
            return Err(e);
        }
        Ok(client)
    }

    /// Build the transport `config` names and connect over it.
    pub async fn connect_with(
        config: &TransportConfig,
        auth_provider: Option<Arc<dyn OAuthClientProvider>>,
        client_config: McpClientConfig,
    ) -> McpResult<Self> {
        let transport = create_transport(config, auth_provider)?;
        Self::connect(transport, client_config).await
    }

    async fn initialize(&self) -> McpResult<()> {
        self.inner.transport.start().await?;
        self.inner.closed.store(false, Ordering::SeqCst);

        let config = &self.inner.config;
        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities {
                elicitation: config.elicitation_handler.as_ref().map(|_| Map::new()),
            },
            client_info: Implementation {
                name: config.name.clone(),
                version: config.version.clone(),
            },
        };
        let result: InitializeResult = self
            .request(METHOD_INITIALIZE, Some(&params), None)
            .await?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&result.protocol_version.as_str()) {
            return Err(McpError::UnsupportedProtocolVersion(result.protocol_version));
        }

        info!(
            server = %result.server_info.name,
            version = %result.server_info.version,
            protocol = %result.protocol_version,
            "Connected to MCP server"
        );
        *self
            .inner
            .server
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(result);

        self.inner
            .transport
            .send(JsonRpcNotification::new(METHOD_INITIALIZED, None).into())
            .await
    }

    /// Result of the `initialize` handshake.
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.inner
            .server
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn server_capabilities(&self) -> ServerCapabilities {
        self.inner.capabilities()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Send a request and decode its result.
    ///
    /// A token that is already cancelled fails with [`McpError::Cancelled`]
    /// before anything is sent.
    pub async fn request<P, T>(
        &self,
        method: &str,
        params: Option<&P>,
        cancel: Option<&CancellationToken>,
    ) -> McpResult<T>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let params = params.map(serde_json::to_value).transpose()?;
        let value = self.inner.request(method, params, cancel).await?;
        serde_json::from_value(value)
            .map_err(|e| McpError::protocol(format!("Failed to parse server response: {e}")))
    }

    /// One page of `tools/list`.
    pub async fn list_tools(&self, cursor: Option<String>) -> McpResult<ListToolsResult> {
        self.request(METHOD_TOOLS_LIST, Some(&PaginatedParams { cursor }), None)
            .await
    }

    /// Every tool, following `nextCursor` until the last page.
    pub async fn list_all_tools(&self) -> McpResult<Vec<McpTool>> {
        let mut tools = Vec::new();
        let mut cursor = None;
        loop {
            let page = self.list_tools(cursor.clone()).await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if cursor.as_ref() != Some(&next) => cursor = Some(next),
                _ => return Ok(tools),
            }
        }
    }

    /// Call a tool by name.
    ///
    /// A JSON-RPC error from the server comes back as [`McpError::Server`]
    /// with its code and data.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        cancel: Option<&CancellationToken>,
    ) -> McpResult<CallToolResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments: Some(arguments),
        };
        self.request(METHOD_TOOLS_CALL, Some(&params), cancel).await
    }

    /// The server's tools as callable handles.
    pub async fn tools(&self, schemas: &ToolSchemas) -> McpResult<Vec<RemoteTool>> {
        let tools = self.list_all_tools().await?;
        Ok(tools
            .into_iter()
            .filter_map(|tool| {
                let (input_schema, output_schema) = match schemas {
                    ToolSchemas::Automatic => (tool.input_schema, tool.output_schema),
                    ToolSchemas::Explicit(explicit) => {
                        let schema = explicit.get(&tool.name)?;
                        (schema.input_schema.clone(), schema.output_schema.clone())
                    }
                };
                Some(RemoteTool {
                    name: tool.name,
                    description: tool.description,
                    input_schema,
                    output_schema,
                    client: self.clone(),
                })
            })
            .collect())
    }

    pub async fn list_resources(&self, cursor: Option<String>) -> McpResult<ListResourcesResult> {
        self.request(METHOD_RESOURCES_LIST, Some(&PaginatedParams { cursor }), None)
            .await
    }

    pub async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult> {
        let params = ReadResourceParams {
            uri: uri.to_string(),
        };
        self.request(METHOD_RESOURCES_READ, Some(&params), None).await
    }

    pub async fn list_resource_templates(
        &self,
        cursor: Option<String>,
    ) -> McpResult<ListResourceTemplatesResult> {
        self.request(
            METHOD_RESOURCE_TEMPLATES_LIST,
            Some(&PaginatedParams { cursor }),
            None,
        )
        .await
    }

    pub async fn list_prompts(&self, cursor: Option<String>) -> McpResult<ListPromptsResult> {
        self.request(METHOD_PROMPTS_LIST, Some(&PaginatedParams { cursor }), None)
            .await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> McpResult<GetPromptResult> {
        let params = GetPromptParams {
            name: name.to_string(),
            arguments,
        };
        self.request(METHOD_PROMPTS_GET, Some(&params), None).await
    }

    /// Close the transport. Requests still waiting fail with
    /// [`McpError::ConnectionClosed`].
    pub async fn close(&self) -> McpResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.inner.transport.close().await;
        self.inner.handle_close();
        result
    }
}

fn handlers_for(inner: Weak<ClientInner>) -> TransportHandlers {
    let on_message = inner.clone();
    let on_error = inner.clone();
    let on_close = inner;
    TransportHandlers::default()
        .on_message(move |message| {
            if let Some(inner) = on_message.upgrade() {
                inner.handle_message(message);
            }
        })
        .on_error(move |error| {
            if let Some(inner) = on_error.upgrade() {
                inner.uncaught(error);
            }
        })
        .on_close(move || {
            if let Some(inner) = on_close.upgrade() {
                inner.handle_close();
            }
        })
}

impl ClientInner {
    fn pending(&self) -> MutexGuard<'_, HashMap<i64, PendingCall>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn capabilities(&self) -> ServerCapabilities {
        self.server
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| s.capabilities.clone())
            .unwrap_or_default()
    }

    fn assert_capability(&self, method: &str) -> McpResult<()> {
        let capabilities = self.capabilities();
        let (name, present) = match method {
            METHOD_TOOLS_LIST | METHOD_TOOLS_CALL => ("tools", capabilities.tools.is_some()),
            METHOD_RESOURCES_LIST | METHOD_RESOURCES_READ | METHOD_RESOURCE_TEMPLATES_LIST => {
                ("resources", capabilities.resources.is_some())
            }
            METHOD_PROMPTS_LIST | METHOD_PROMPTS_GET => ("prompts", capabilities.prompts.is_some()),
            _ => return Ok(()),
        };
        if present {
            Ok(())
        } else {
            Err(McpError::CapabilityNotSupported(name))
        }
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: Option<&CancellationToken>,
    ) -> McpResult<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::ClientClosed);
        }
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(McpError::Cancelled);
        }
        self.assert_capability(method)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            // Checked under the lock so a concurrent close either sees this
            // entry in its drain or this call sees the flag
            let mut pending = self.pending();
            if self.closed.load(Ordering::SeqCst) {
                return Err(McpError::ConnectionClosed);
            }
            pending.insert(id, tx);
        }

        debug!(id, method, "Sending request");
        if let Err(e) = self
            .transport
            .send(JsonRpcRequest::new(id, method, params).into())
            .await
        {
            self.pending().remove(&id);
            return Err(e);
        }

        let response = async {
            match tokio::time::timeout(self.config.request_timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(McpError::ConnectionClosed),
                Err(_) => Err(McpError::Timeout),
            }
        };
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let result = tokio::select! {
            result = response => result,
            _ = cancelled => Err(McpError::Cancelled),
        };
        if result.is_err() {
            self.pending().remove(&id);
        }
        result
    }

    fn uncaught(&self, error: McpError) {
        match &self.config.on_uncaught_error {
            Some(f) => f(error),
            None => warn!(error = %error, "Unhandled MCP error"),
        }
    }

    fn handle_message(self: &Arc<Self>, message: JsonRpcMessage) {
        match message {
            JsonRpcMessage::Response(response) => self.resolve(&response.id, Ok(response.result)),
            JsonRpcMessage::Error(error) => {
                let server_error = McpError::Server {
                    code: error.error.code,
                    message: error.error.message,
                    data: error.error.data,
                };
                match error.id {
                    Some(id) => self.resolve(&id, Err(server_error)),
                    None => self.uncaught(server_error),
                }
            }
            JsonRpcMessage::Request(request) => {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    let reply = inner.answer_server_request(request).await;
                    if let Err(e) = inner.transport.send(reply).await {
                        inner.uncaught(e);
                    }
                });
            }
            JsonRpcMessage::Notification(notification) => {
                debug!(method = %notification.method, "Ignoring server notification");
            }
        }
    }

    fn resolve(&self, id: &RequestId, result: McpResult<Value>) {
        let Some(key) = id.as_i64() else {
            self.uncaught(McpError::protocol(format!(
                "Response ID cannot be converted to integer: {id}"
            )));
            return;
        };
        let Some(tx) = self.pending().remove(&key) else {
            self.uncaught(McpError::protocol(format!(
                "Received a response for an unknown message ID: {id}"
            )));
            return;
        };
        // The caller may have given up already.
        let _ = tx.send(result);
    }

    async fn answer_server_request(&self, request: JsonRpcRequest) -> JsonRpcMessage {
        let id = request.id.clone();
        let error = |code, message: String| {
            JsonRpcMessage::Error(JsonRpcErrorResponse::new(id.clone(), code, message, None))
        };

        match request.method.as_str() {
            METHOD_ELICITATION_CREATE => {
                let Some(handler) = &self.config.elicitation_handler else {
                    return error(
                        error_codes::METHOD_NOT_FOUND,
                        format!("Unsupported request method: {}", request.method),
                    );
                };
                let params = match request
                    .params
                    .map(serde_json::from_value::<ElicitRequestParams>)
                {
                    Some(Ok(params)) => params,
                    Some(Err(e)) => {
                        return error(
                            error_codes::INVALID_PARAMS,
                            format!("Invalid elicitation request: {e}"),
                        )
                    }
                    None => {
                        return error(
                            error_codes::INVALID_PARAMS,
                            "Invalid elicitation request: missing params".to_string(),
                        )
                    }
                };

                debug!(id = %id, "Handling elicitation request");
                match handler.elicit(params).await.and_then(|result| {
                    serde_json::to_value(result).map_err(McpError::from)
                }) {
                    Ok(result) => JsonRpcMessage::Response(JsonRpcResponse::new(id.clone(), result)),
                    Err(e) => error(error_codes::INTERNAL_ERROR, e.to_string()),
                }
            }
            other => {
                debug!(method = %other, "Rejecting unsupported server request");
                error(
                    error_codes::METHOD_NOT_FOUND,
                    format!("Unsupported request method: {other}"),
                )
            }
        }
    }

    fn handle_close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending: Vec<PendingCall> = self.pending().drain().map(|(_, tx)| tx).collect();
        if !pending.is_empty() {
            debug!(count = pending.len(), "Failing pending requests");
        }
        for tx in pending {
            let _ = tx.send(Err(McpError::ConnectionClosed));
        }
        info!("MCP connection closed");
    }
}

/// Input and output schema for one tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSchema {
    pub input_schema: Value,
    /// When set, results are validated and returned as structured data.
    pub output_schema: Option<Value>,
}

/// Where tool schemas come from.
#[derive(Debug, Clone, Default)]
pub enum ToolSchemas {
    /// Use what the server advertises.
    #[default]
    Automatic,
    /// Only expose the named tools, with these schemas.
    Explicit(HashMap<String, ToolSchema>),
}

/// What a tool call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    /// Raw MCP result.
    Content(CallToolResult),
    /// Structured value that passed the output schema.
    Structured(Value),
}

impl ToolOutput {
    /// JSON view of the output.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Content(result) => serde_json::to_value(result).unwrap_or(Value::Null),
            Self::Structured(value) => value.clone(),
        }
    }
}

/// A server tool bound to the client that listed it.
#[derive(Clone)]
pub struct RemoteTool {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
    pub output_schema: Option<Value>,
    client: McpClient,
}

impl std::fmt::Debug for RemoteTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl RemoteTool {
    /// Invoke the tool.
    ///
    /// With an output schema, `structuredContent` (or else the first text
    /// item parsed as JSON) is validated and returned as structured data.
    /// Error results are always returned as content.
    pub async fn call(
        &self,
        arguments: Value,
        cancel: Option<&CancellationToken>,
    ) -> McpResult<ToolOutput> {
        let result = self.client.call_tool(&self.name, arguments, cancel).await?;
        let Some(schema) = &self.output_schema else {
            return Ok(ToolOutput::Content(result));
        };
        if result.is_error {
            return Ok(ToolOutput::Content(result));
        }

        let value = match (&result.structured_content, result.first_text()) {
            (Some(structured), _) => structured.clone(),
            (None, Some(text)) => serde_json::from_str(text).map_err(|e| {
                McpError::SchemaValidation(format!("Tool output is not valid JSON: {e}"))
            })?,
            (None, None) => {
                return Err(McpError::SchemaValidation(
                    "Tool returned neither structured content nor text".to_string(),
                ))
            }
        };
        validate_output(schema, &value)?;
        Ok(ToolOutput::Structured(value))
    }
}

fn validate_output(schema: &Value, value: &Value) -> McpResult<()> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| McpError::SchemaValidation(format!("Invalid output schema: {e}")))?;
    if validator.is_valid(value) {
        return Ok(());
    }
    let message = validator
        .iter_errors(value)
        .take(5)
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    Err(McpError::SchemaValidation(message))
}
