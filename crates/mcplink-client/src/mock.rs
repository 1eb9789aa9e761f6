//! In-process transport that plays an MCP server.
//!
//! Answers `initialize`, the tools, resources and prompts methods from a
//! configurable catalogue, so the client can be exercised without sockets.
//! Unknown methods get no answer at all.

use crate::error::{McpError, McpResult};
use crate::protocol::{
    error_codes, JsonRpcErrorResponse, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, McpTool,
    Prompt, RequestId, Resource, ResourceContents, ResourceTemplate, LATEST_PROTOCOL_VERSION,
    METHOD_ELICITATION_CREATE, METHOD_INITIALIZE, METHOD_PROMPTS_GET, METHOD_PROMPTS_LIST,
    METHOD_RESOURCES_LIST, METHOD_RESOURCES_READ, METHOD_RESOURCE_TEMPLATES_LIST,
    METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
};
use crate::transport::{HandlerSlot, Transport, TransportHandlers};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Mutex;
use std::time::Duration;

const RESPONSE_DELAY: Duration = Duration::from_millis(10);
const ELICITATION_REQUEST_ID: &str = "elicit-1";
const RESOURCE_NOT_FOUND: i64 = -32002;
const METHOD_NOT_SUPPORTED: i64 = -32000;

fn default_tools() -> Vec<McpTool> {
    vec![
        McpTool {
            name: "mock-tool".to_string(),
            title: None,
            description: Some("A mock tool for testing".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {"foo": {"type": "string"}}
            }),
            output_schema: None,
            annotations: None,
        },
        McpTool {
            name: "mock-tool-no-args".to_string(),
            title: None,
            description: Some("A mock tool for testing".to_string()),
            input_schema: json!({"type": "object"}),
            output_schema: None,
            annotations: None,
        },
    ]
}

/// A readable resource in the mock catalogue.
#[derive(Debug, Clone)]
struct MockResource {
    resource: Resource,
    text: String,
}

/// Transport double emulating an MCP server.
pub struct MockTransport {
    tools: Vec<McpTool>,
    resources: Vec<MockResource>,
    resource_templates: Vec<ResourceTemplate>,
    prompts: Vec<Prompt>,
    initialize_result: Option<Value>,
    tool_result: Option<Value>,
    page_size: Option<usize>,
    fail_on_invalid_tool_params: bool,
    start_error: bool,
    elicitation: bool,
    silent_tool_calls: bool,
    handlers: HandlerSlot,
    sent: Mutex<Vec<JsonRpcMessage>>,
    pending_elicitation: Mutex<Option<RequestId>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            tools: default_tools(),
            resources: Vec::new(),
            resource_templates: Vec::new(),
            prompts: Vec::new(),
            initialize_result: None,
            tool_result: None,
            page_size: None,
            fail_on_invalid_tool_params: false,
            start_error: false,
            elicitation: false,
            silent_tool_calls: false,
            handlers: HandlerSlot::default(),
            sent: Mutex::new(Vec::new()),
            pending_elicitation: Mutex::new(None),
        }
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the default tools. An empty list drops the tools capability.
    pub fn with_tools(mut self, tools: Vec<McpTool>) -> Self {
        self.tools = tools;
        self
    }

    /// Add a text resource.
    pub fn with_resource(mut self, resource: Resource, text: impl Into<String>) -> Self {
        self.resources.push(MockResource {
            resource,
            text: text.into(),
        });
        self
    }

    pub fn with_resource_template(mut self, template: ResourceTemplate) -> Self {
        self.resource_templates.push(template);
        self
    }

    pub fn with_prompt(mut self, prompt: Prompt) -> Self {
        self.prompts.push(prompt);
        self
    }

    /// Answer `initialize` with this raw result.
    pub fn with_initialize_result(mut self, result: Value) -> Self {
        self.initialize_result = Some(result);
        self
    }

    /// Answer every successful `tools/call` with this raw result.
    pub fn with_tool_result(mut self, result: Value) -> Self {
        self.tool_result = Some(result);
        self
    }

    /// Split list results into pages of `size` items.
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size.max(1));
        self
    }

    /// Reject every known tool call with `-32602`.
    pub fn fail_on_invalid_tool_params(mut self) -> Self {
        self.fail_on_invalid_tool_params = true;
        self
    }

    /// Report an error through `on_error` when started.
    pub fn with_start_error(mut self) -> Self {
        self.start_error = true;
        self
    }

    /// Ask the client for input before answering a tool call.
    pub fn with_elicitation(mut self) -> Self {
        self.elicitation = true;
        self
    }

    /// Never answer `tools/call`.
    pub fn with_silent_tool_calls(mut self) -> Self {
        self.silent_tool_calls = true;
        self
    }

    /// Every message the client has sent, in order.
    pub fn sent_messages(&self) -> Vec<JsonRpcMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn capabilities(&self) -> Value {
        let mut capabilities = Map::new();
        if !self.tools.is_empty() {
            capabilities.insert("tools".to_string(), json!({}));
        }
        if !self.resources.is_empty() || !self.resource_templates.is_empty() {
            capabilities.insert("resources".to_string(), json!({}));
        }
        if !self.prompts.is_empty() {
            capabilities.insert("prompts".to_string(), json!({}));
        }
        Value::Object(capabilities)
    }

    /// Slice `items` at the request's cursor.
    fn page<T: Serialize>(&self, items: &[T], params: Option<&Value>) -> (Value, Option<String>) {
        let start = params
            .and_then(|p| p.get("cursor"))
            .and_then(Value::as_str)
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0)
            .min(items.len());
        let end = self
            .page_size
            .map_or(items.len(), |size| (start + size).min(items.len()));
        let next_cursor = (end < items.len()).then(|| end.to_string());
        (json!(&items[start..end]), next_cursor)
    }

    fn paged_result(&self, key: &str, page: (Value, Option<String>)) -> Value {
        let (items, next_cursor) = page;
        let mut result = Map::new();
        result.insert(key.to_string(), items);
        if let Some(cursor) = next_cursor {
            result.insert("nextCursor".to_string(), Value::String(cursor));
        }
        Value::Object(result)
    }

    fn respond(&self, id: RequestId, result: Value) {
        self.handlers
            .message(JsonRpcMessage::Response(JsonRpcResponse::new(id, result)));
    }

    fn respond_error(&self, id: RequestId, code: i64, message: impl Into<String>, data: Option<Value>) {
        self.handlers.message(JsonRpcMessage::Error(JsonRpcErrorResponse::new(
            id, code, message, data,
        )));
    }

    async fn handle_request(&self, request: JsonRpcRequest) {
        tokio::time::sleep(RESPONSE_DELAY).await;
        let params = request.params.as_ref();

        match request.method.as_str() {
            METHOD_INITIALIZE => {
                let result = self.initialize_result.clone().unwrap_or_else(|| {
                    json!({
                        "protocolVersion": LATEST_PROTOCOL_VERSION,
                        "serverInfo": {"name": "mock-mcp-server", "version": "1.0.0"},
                        "capabilities": self.capabilities(),
                    })
                });
                self.respond(request.id, result);
            }
            METHOD_TOOLS_LIST => {
                if self.tools.is_empty() {
                    self.respond_error(request.id, METHOD_NOT_SUPPORTED, "Method not supported", None);
                    return;
                }
                let result = self.paged_result("tools", self.page(&self.tools, params));
                self.respond(request.id, result);
            }
            METHOD_TOOLS_CALL => self.handle_tool_call(request),
            METHOD_RESOURCES_LIST => {
                let resources: Vec<&Resource> = self.resources.iter().map(|r| &r.resource).collect();
                let result = self.paged_result("resources", self.page(&resources, params));
                self.respond(request.id, result);
            }
            METHOD_RESOURCE_TEMPLATES_LIST => {
                let result =
                    self.paged_result("resourceTemplates", self.page(&self.resource_templates, params));
                self.respond(request.id, result);
            }
            METHOD_RESOURCES_READ => {
                let uri = params
                    .and_then(|p| p.get("uri"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                match self.resources.iter().find(|r| r.resource.uri == uri) {
                    Some(found) => {
                        let contents = ResourceContents::Text {
                            uri: found.resource.uri.clone(),
                            mime_type: found.resource.mime_type.clone(),
                            text: found.text.clone(),
                        };
                        self.respond(request.id, json!({ "contents": [contents] }));
                    }
                    None => self.respond_error(
                        request.id,
                        RESOURCE_NOT_FOUND,
                        format!("Resource not found: {uri}"),
                        Some(json!({ "uri": uri })),
                    ),
                }
            }
            METHOD_PROMPTS_LIST => {
                let result = self.paged_result("prompts", self.page(&self.prompts, params));
                self.respond(request.id, result);
            }
            METHOD_PROMPTS_GET => {
                let name = params
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let Some(prompt) = self.prompts.iter().find(|p| p.name == name) else {
                    self.respond_error(
                        request.id,
                        error_codes::INVALID_PARAMS,
                        format!("Unknown prompt: {name}"),
                        None,
                    );
                    return;
                };
                let arguments = params
                    .and_then(|p| p.get("arguments"))
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                self.respond(
                    request.id,
                    json!({
                        "description": prompt.description,
                        "messages": [{
                            "role": "user",
                            "content": {"type": "text", "text": format!("{name} {arguments}")}
                        }]
                    }),
                );
            }
            _ => {}
        }
    }

    fn handle_tool_call(&self, request: JsonRpcRequest) {
        if self.silent_tool_calls {
            return;
        }
        let Some(name) = request
            .params
            .as_ref()
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
        else {
            return;
        };
        let arguments = request.params.as_ref().and_then(|p| p.get("arguments")).cloned();

        let Some(tool) = self.tools.iter().find(|t| t.name == name) else {
            let available: Vec<&str> = self.tools.iter().map(|t| t.name.as_str()).collect();
            self.respond_error(
                request.id.clone(),
                error_codes::METHOD_NOT_FOUND,
                format!("Tool {name} not found"),
                Some(json!({"availableTools": available, "requestedTool": name})),
            );
            return;
        };

        if self.fail_on_invalid_tool_params {
            let received = arguments.unwrap_or(Value::Null);
            self.respond_error(
                request.id.clone(),
                error_codes::INVALID_PARAMS,
                format!("Invalid tool inputSchema: {received}"),
                Some(json!({"expectedSchema": tool.input_schema, "receivedArguments": received})),
            );
            return;
        }

        if self.elicitation {
            *self
                .pending_elicitation
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(request.id);
            self.handlers.message(
                JsonRpcRequest::new(
                    ELICITATION_REQUEST_ID,
                    METHOD_ELICITATION_CREATE,
                    Some(json!({
                        "message": "Please provide your name",
                        "requestedSchema": {
                            "type": "object",
                            "properties": {"name": {"type": "string"}},
                            "required": ["name"]
                        }
                    })),
                )
                .into(),
            );
            return;
        }

        let result = self.tool_result.clone().unwrap_or_else(|| {
            json!({"content": [{"type": "text", "text": "Mock tool call result"}]})
        });
        self.respond(request.id, result);
    }

    /// Finish a tool call parked on an elicitation once the client answers.
    fn handle_elicitation_reply(&self, message: &JsonRpcMessage) {
        if message.id() != Some(&RequestId::from(ELICITATION_REQUEST_ID)) {
            return;
        }
        let Some(call_id) = self
            .pending_elicitation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };

        match message {
            JsonRpcMessage::Response(response) => self.respond(
                call_id,
                json!({"content": [{"type": "text", "text": response.result.to_string()}]}),
            ),
            JsonRpcMessage::Error(error) => self.respond(
                call_id,
                json!({
                    "content": [{"type": "text", "text": error.error.message}],
                    "isError": true
                }),
            ),
            _ => {}
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn set_handlers(&self, handlers: TransportHandlers) {
        self.handlers.set(handlers);
    }

    async fn start(&self) -> McpResult<()> {
        if self.start_error {
            self.handlers.error(McpError::protocol("Unknown error"));
        }
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> McpResult<()> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.clone());

        match message {
            JsonRpcMessage::Request(request) => self.handle_request(request).await,
            JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_) => {
                self.handle_elicitation_reply(&message)
            }
            JsonRpcMessage::Notification(_) => {}
        }
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        self.handlers.closed();
        Ok(())
    }
}
