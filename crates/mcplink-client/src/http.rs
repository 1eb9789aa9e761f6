//! Streamable HTTP transport.
//!
//! Every outgoing message is POSTed to the server URL. The server answers
//! with `202 Accepted`, a JSON body (one message or a batch) or an SSE
//! stream. An optional long-lived GET stream carries server-initiated
//! messages and is resumed with `last-event-id` after a failure.

use crate::error::{McpError, McpResult};
use crate::oauth::{auth, extract_resource_metadata_url, AuthOptions, AuthResult, OAuthClientProvider};
use crate::protocol::{JsonRpcMessage, LATEST_PROTOCOL_VERSION};
use crate::sse::{event_stream, DEFAULT_EVENT};
use crate::transport::{user_agent, EndpointConfig, HandlerSlot, Transport, TransportHandlers};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const SESSION_ID_HEADER: &str = "mcp-session-id";
const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";
const LAST_EVENT_ID_HEADER: &str = "last-event-id";

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
const RECONNECT_GROW_FACTOR: f64 = 1.5;
const MAX_RECONNECT_RETRIES: u32 = 2;

/// Backoff before reconnect attempt `attempt` (zero based).
fn reconnect_delay(attempt: u32) -> Duration {
    let delay = INITIAL_RECONNECT_DELAY.mul_f64(RECONNECT_GROW_FACTOR.powi(attempt as i32));
    delay.min(MAX_RECONNECT_DELAY)
}

fn header_value(value: &str) -> McpResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| McpError::http_transport(format!("Invalid header value: {e}")))
}

/// How an inbound stream attempt ended.
enum InboundOutcome {
    /// Ended on purpose or for a reason a retry will not fix.
    Finished,
    /// Dropped mid-flight; worth reconnecting.
    Dropped(McpError),
}

/// Streamable HTTP transport.
pub struct HttpTransport {
    inner: Arc<HttpInner>,
}

struct HttpInner {
    url: Url,
    headers: HeaderMap,
    timeout: Duration,
    client: Client,
    auth_provider: OnceLock<Arc<dyn OAuthClientProvider>>,
    handlers: HandlerSlot,
    session_id: RwLock<Option<String>>,
    last_event_id: Mutex<Option<String>>,
    started: AtomicBool,
    closed: AtomicBool,
    inbound_running: AtomicBool,
    inbound_active: AtomicBool,
    reconnect_attempts: AtomicU32,
    cancel: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl HttpTransport {
    /// Create a transport for the configured endpoint. Nothing is sent until `start`.
    pub fn new(config: &EndpointConfig) -> McpResult<Self> {
        let url = Url::parse(&config.url)?;

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| McpError::http_transport(format!("Invalid header name {key}: {e}")))?;
            headers.insert(name, header_value(value)?);
        }

        // No whole-request timeout: it would cut long-lived SSE streams.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(user_agent())
            .build()?;

        Ok(Self {
            inner: Arc::new(HttpInner {
                url,
                headers,
                timeout: Duration::from_secs(config.timeout_secs),
                client,
                auth_provider: OnceLock::new(),
                handlers: HandlerSlot::default(),
                session_id: RwLock::new(None),
                last_event_id: Mutex::new(None),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                inbound_running: AtomicBool::new(false),
                inbound_active: AtomicBool::new(false),
                reconnect_attempts: AtomicU32::new(0),
                cancel: CancellationToken::new(),
                tasks: tokio::sync::Mutex::new(Vec::new()),
            }),
        })
    }

    /// Attach an OAuth provider. Its tokens are sent as a bearer token and a
    /// 401 runs the authorization flow once before retrying.
    pub fn with_auth_provider(self, provider: Arc<dyn OAuthClientProvider>) -> Self {
        let _ = self.inner.auth_provider.set(provider);
        self
    }

    /// Session id assigned by the server, if any.
    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id()
    }
}

impl HttpInner {
    fn session_id(&self) -> Option<String> {
        self.session_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn capture_session_id(&self, response: &Response) {
        let Some(id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };
        let mut slot = self.session_id.write().unwrap_or_else(|e| e.into_inner());
        if slot.as_deref() != Some(id) {
            info!(session_id = %id, "Session established");
            *slot = Some(id.to_string());
        }
    }

    fn last_event_id(&self) -> Option<String> {
        self.last_event_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_last_event_id(&self, id: &str) {
        *self.last_event_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(id.to_string());
    }

    /// Headers common to every request: user headers, protocol version,
    /// session id and bearer token, plus `extra`.
    async fn request_headers(&self, extra: &[(HeaderName, &str)]) -> McpResult<HeaderMap> {
        let mut headers = self.headers.clone();
        for (name, value) in extra {
            headers.insert(name.clone(), header_value(value)?);
        }
        headers.insert(
            PROTOCOL_VERSION_HEADER,
            HeaderValue::from_static(LATEST_PROTOCOL_VERSION),
        );
        if let Some(session_id) = self.session_id() {
            headers.insert(SESSION_ID_HEADER, header_value(&session_id)?);
        }
        if let Some(provider) = self.auth_provider.get() {
            if let Ok(Some(tokens)) = provider.tokens().await {
                headers.insert(
                    AUTHORIZATION,
                    header_value(&format!("Bearer {}", tokens.access_token))?,
                );
            }
        }
        Ok(headers)
    }

    /// Send with the per-request timeout applied to the response head only.
    async fn send_request(&self, request: RequestBuilder, what: &str) -> McpResult<Response> {
        match tokio::time::timeout(self.timeout, request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(McpError::http_transport(format!("{what} failed: {e}"))),
            Err(_) => Err(McpError::Timeout),
        }
    }

    /// Run the OAuth flow after a 401.
    async fn authorize(
        &self,
        provider: &Arc<dyn OAuthClientProvider>,
        response: &Response,
    ) -> McpResult<()> {
        let resource_metadata_url = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(extract_resource_metadata_url);
        let options = AuthOptions {
            resource_metadata_url,
            ..AuthOptions::default()
        };

        match auth(provider.as_ref(), &self.client, &self.url, &options).await? {
            AuthResult::Authorized => Ok(()),
            AuthResult::Redirect => Err(McpError::Unauthorized),
        }
    }

    async fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Start the inbound GET stream unless one is already running.
    async fn spawn_inbound(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) || self.inbound_running.swap(true, Ordering::SeqCst)
        {
            return;
        }
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            inner.run_inbound().await;
            inner.inbound_running.store(false, Ordering::SeqCst);
            inner.inbound_active.store(false, Ordering::SeqCst);
        });
        self.track(handle).await;
    }

    async fn run_inbound(&self) {
        loop {
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return,
                outcome = self.open_inbound() => outcome,
            };
            self.inbound_active.store(false, Ordering::SeqCst);

            let error = match outcome {
                InboundOutcome::Finished => return,
                InboundOutcome::Dropped(error) => error,
            };
            if self.cancel.is_cancelled() {
                return;
            }
            warn!(error = %error, "Inbound SSE stream dropped");
            self.handlers.error(error);

            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
            if attempt >= MAX_RECONNECT_RETRIES {
                self.handlers.error(McpError::http_transport(format!(
                    "Maximum reconnection attempts ({MAX_RECONNECT_RETRIES}) exceeded."
                )));
                return;
            }

            let delay = reconnect_delay(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting inbound SSE stream");
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn open_inbound(&self) -> InboundOutcome {
        let mut tried_auth = false;
        let response = loop {
            let resume = self.last_event_id();
            let mut extra = vec![(ACCEPT, "text/event-stream")];
            if let Some(id) = resume.as_deref() {
                extra.push((HeaderName::from_static(LAST_EVENT_ID_HEADER), id));
            }
            let headers = match self.request_headers(&extra).await {
                Ok(headers) => headers,
                Err(e) => return InboundOutcome::Dropped(e),
            };

            let response = match self.client.get(self.url.clone()).headers(headers).send().await {
                Ok(response) => response,
                Err(e) => {
                    return InboundOutcome::Dropped(McpError::http_transport(format!(
                        "GET SSE failed: {e}"
                    )))
                }
            };
            self.capture_session_id(&response);

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && !tried_auth {
                if let Some(provider) = self.auth_provider.get() {
                    tried_auth = true;
                    if let Err(e) = self.authorize(provider, &response).await {
                        self.handlers.error(e);
                        return InboundOutcome::Finished;
                    }
                    continue;
                }
            }
            if status == StatusCode::METHOD_NOT_ALLOWED {
                debug!("Server does not offer an inbound SSE stream");
                return InboundOutcome::Finished;
            }
            if !status.is_success() {
                self.handlers
                    .error(McpError::http_transport(format!("GET SSE failed: {status}")));
                return InboundOutcome::Finished;
            }
            break response;
        };

        self.inbound_active.store(true, Ordering::SeqCst);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        debug!("Inbound SSE stream open");

        let events = event_stream(response.bytes_stream());
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => {
                    if let Some(id) = &event.id {
                        self.set_last_event_id(id);
                    }
                    if event.event == DEFAULT_EVENT {
                        self.dispatch_event_data(&event.data);
                    }
                }
                Err(e) => {
                    return InboundOutcome::Dropped(McpError::http_transport(format!(
                        "SSE stream failed: {e}"
                    )))
                }
            }
        }
        InboundOutcome::Finished
    }

    fn dispatch_event_data(&self, data: &str) {
        if data.trim() == crate::sse::DONE_MARKER {
            return;
        }
        match JsonRpcMessage::decode(data.as_bytes()) {
            Ok(message) => self.handlers.message(message),
            Err(e) => {
                warn!(error = %e, "Dropping unparseable SSE message");
                self.handlers
                    .error(McpError::http_transport(format!("Failed to parse message: {e}")));
            }
        }
    }

    /// Read an SSE-typed POST response until it ends.
    async fn pump_post_stream(&self, response: Response) {
        let events = event_stream(response.bytes_stream());
        futures::pin_mut!(events);
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return,
                next = events.next() => next,
            };
            match next {
                Some(Ok(event)) if event.event == DEFAULT_EVENT => {
                    self.dispatch_event_data(&event.data);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.handlers
                        .error(McpError::http_transport(format!("SSE stream failed: {e}")));
                    return;
                }
                None => return,
            }
        }
    }

    async fn post(self: &Arc<Self>, message: &JsonRpcMessage) -> McpResult<()> {
        let body = message.encode()?;
        let mut tried_auth = false;

        loop {
            let headers = self
                .request_headers(&[
                    (CONTENT_TYPE, "application/json"),
                    (ACCEPT, "application/json, text/event-stream"),
                ])
                .await?;
            let request = self
                .client
                .post(self.url.clone())
                .headers(headers)
                .body(body.clone());
            let response = self.send_request(request, "POST").await?;
            self.capture_session_id(&response);

            let status = response.status();
            debug!(method = ?message.method(), status = %status, "POST response");

            if status == StatusCode::UNAUTHORIZED && !tried_auth {
                if let Some(provider) = self.auth_provider.get() {
                    tried_auth = true;
                    self.authorize(provider, &response).await?;
                    continue;
                }
            }

            if status == StatusCode::ACCEPTED {
                if !self.inbound_active.load(Ordering::SeqCst) {
                    self.spawn_inbound().await;
                }
                return Ok(());
            }

            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                let mut error = format!("POSTing to endpoint (HTTP {}): {text}", status.as_u16());
                if status == StatusCode::NOT_FOUND {
                    error.push_str(
                        ". This server does not support HTTP transport. Try using `sse` transport instead",
                    );
                }
                return Err(McpError::http_transport(error));
            }

            if matches!(message, JsonRpcMessage::Notification(_)) {
                return Ok(());
            }

            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();

            if content_type.contains("application/json") {
                let bytes = response.bytes().await?;
                for message in JsonRpcMessage::decode_batch(&bytes)? {
                    self.handlers.message(message);
                }
                return Ok(());
            }

            if content_type.contains("text/event-stream") {
                let inner = Arc::clone(self);
                let handle = tokio::spawn(async move { inner.pump_post_stream(response).await });
                self.track(handle).await;
                return Ok(());
            }

            return Err(McpError::http_transport(format!(
                "Unexpected content type: {content_type}"
            )));
        }
    }

    async fn terminate_session(&self) {
        let Some(session_id) = self.session_id() else {
            return;
        };
        let result = async {
            let headers = self.request_headers(&[]).await?;
            let request = self.client.delete(self.url.clone()).headers(headers);
            self.send_request(request, "DELETE").await
        }
        .await;
        match result {
            Ok(response) => debug!(session_id = %session_id, status = %response.status(), "Session terminated"),
            Err(e) => warn!(session_id = %session_id, error = %e, "Failed to terminate session"),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn set_handlers(&self, handlers: TransportHandlers) {
        self.inner.handlers.set(handlers);
    }

    async fn start(&self) -> McpResult<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(McpError::http_transport(
                "Transport already started. Note: client.connect() calls start() automatically.",
            ));
        }
        self.inner.spawn_inbound().await;
        info!(url = %self.inner.url, "Streamable HTTP transport started");
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> McpResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(McpError::http_transport("Transport is closed"));
        }
        debug!(id = ?message.id(), method = ?message.method(), "Sending message");
        let result = self.inner.post(&message).await;
        if let Err(e) = &result {
            // A send cut short by close reports only to its caller
            if !self.inner.closed.load(Ordering::SeqCst) {
                self.inner.handlers.error(e.duplicate());
            }
        }
        result
    }

    async fn close(&self) -> McpResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.handlers.closed();
            return Ok(());
        }

        self.inner.cancel.cancel();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        self.inner.inbound_active.store(false, Ordering::SeqCst);
        self.inner.terminate_session().await;

        info!(url = %self.inner.url, "Streamable HTTP transport closed");
        self.inner.handlers.closed();
        Ok(())
    }
}
