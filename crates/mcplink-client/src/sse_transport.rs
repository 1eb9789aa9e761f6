//! Legacy HTTP+SSE transport.
//!
//! The client opens a GET stream, waits for the server's `endpoint` event and
//! then POSTs every outgoing message to that endpoint. Replies come back as
//! `message` events on the stream.

use crate::error::{McpError, McpResult};
use crate::protocol::JsonRpcMessage;
use crate::sse::{event_stream, DEFAULT_EVENT};
use crate::transport::{user_agent, EndpointConfig, HandlerSlot, Transport, TransportHandlers};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const ENDPOINT_EVENT: &str = "endpoint";

type ReadySender = oneshot::Sender<McpResult<()>>;

/// SSE transport for servers speaking the 2024-11-05 HTTP+SSE protocol.
pub struct SseTransport {
    inner: Arc<SseInner>,
}

struct SseInner {
    url: Url,
    headers: HeaderMap,
    timeout: Duration,
    client: Client,
    handlers: HandlerSlot,
    endpoint: RwLock<Option<Url>>,
    connected: AtomicBool,
    cancel: CancellationToken,
    stream_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    /// Create a new SSE transport.
    pub fn new(config: &EndpointConfig) -> McpResult<Self> {
        let url = Url::parse(&config.url)?;

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| McpError::sse_transport(format!("Invalid header name {key}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| McpError::sse_transport(format!("Invalid header value: {e}")))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(user_agent())
            .build()?;

        Ok(Self {
            inner: Arc::new(SseInner {
                url,
                headers,
                timeout: Duration::from_secs(config.timeout_secs),
                client,
                handlers: HandlerSlot::default(),
                endpoint: RwLock::new(None),
                connected: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                stream_task: tokio::sync::Mutex::new(None),
            }),
        })
    }

    /// POST endpoint announced by the server, once connected.
    pub fn endpoint(&self) -> Option<Url> {
        self.inner.endpoint()
    }
}

impl SseInner {
    fn endpoint(&self) -> Option<Url> {
        self.endpoint
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Resolve the `endpoint` event against the stream URL.
    fn resolve_endpoint(&self, data: &str) -> McpResult<Url> {
        let endpoint = self
            .url
            .join(data.trim())
            .map_err(|_| McpError::sse_transport(format!("Invalid endpoint URL: {data}")))?;
        if endpoint.origin() != self.url.origin() {
            return Err(McpError::sse_transport(format!(
                "Endpoint origin does not match connection origin: {}",
                endpoint.origin().ascii_serialization()
            )));
        }
        Ok(endpoint)
    }

    async fn run(&self, ready: ReadySender) {
        let mut ready = Some(ready);
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Ok(()),
            result = self.read_stream(&mut ready) => result,
        };
        self.connected.store(false, Ordering::SeqCst);

        if let Err(error) = result {
            warn!(url = %self.url, error = %error, "SSE stream failed");
            match ready.take() {
                Some(tx) => {
                    self.handlers.error(error.duplicate());
                    let _ = tx.send(Err(error));
                }
                None => self.handlers.error(error),
            }
        }
    }

    async fn read_stream(&self, ready: &mut Option<ReadySender>) -> McpResult<()> {
        let mut headers = self.headers.clone();
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));

        let response = self
            .client
            .get(self.url.clone())
            .headers(headers)
            .send()
            .await
            .map_err(|e| McpError::sse_transport(format!("Connection failed: {e}")))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(McpError::sse_transport(status.to_string()));
        }

        let events = event_stream(response.bytes_stream());
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            let event =
                event.map_err(|e| McpError::sse_transport(format!("SSE stream failed: {e}")))?;

            match event.event.as_str() {
                ENDPOINT_EVENT => {
                    let endpoint = self.resolve_endpoint(&event.data)?;
                    info!(endpoint = %endpoint, "SSE endpoint received");
                    *self.endpoint.write().unwrap_or_else(|e| e.into_inner()) = Some(endpoint);
                    self.connected.store(true, Ordering::SeqCst);
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
                DEFAULT_EVENT => match JsonRpcMessage::decode(event.data.as_bytes()) {
                    Ok(message) => self.handlers.message(message),
                    Err(e) => self
                        .handlers
                        .error(McpError::sse_transport(format!("Failed to parse message: {e}"))),
                },
                other => debug!(event = %other, "Ignoring SSE event"),
            }
        }

        if self.connected.swap(false, Ordering::SeqCst) {
            return Err(McpError::sse_transport("Connection closed unexpectedly"));
        }
        if ready.is_some() {
            return Err(McpError::sse_transport(
                "Connection closed before an endpoint was received",
            ));
        }
        Ok(())
    }

    /// POST one message. Failures are reported through `on_error`.
    async fn post(&self, endpoint: Url, message: &JsonRpcMessage) -> McpResult<()> {
        let body = message.encode()?;
        let mut headers = self.headers.clone();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let request = self.client.post(endpoint).headers(headers).body(body);
        let response = match tokio::time::timeout(self.timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(McpError::sse_transport(format!("POSTing to endpoint failed: {e}")))
            }
            Err(_) => return Err(McpError::Timeout),
        };

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            let text = response.text().await.unwrap_or_default();
            return Err(McpError::sse_transport(format!(
                "POSTing to endpoint (HTTP {}): {text}",
                status.as_u16()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn set_handlers(&self, handlers: TransportHandlers) {
        self.inner.handlers.set(handlers);
    }

    async fn start(&self) -> McpResult<()> {
        if self.inner.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run(tx).await });
        *self.inner.stream_task.lock().await = Some(handle);

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(McpError::sse_transport(
                "Connection closed before an endpoint was received",
            )),
        }
    }

    async fn send(&self, message: JsonRpcMessage) -> McpResult<()> {
        let endpoint = match self.inner.endpoint() {
            Some(endpoint) if self.inner.connected.load(Ordering::SeqCst) => endpoint,
            _ => return Err(McpError::sse_transport("Not connected")),
        };

        debug!(id = ?message.id(), method = ?message.method(), "Sending SSE message");
        if let Err(e) = self.inner.post(endpoint, &message).await {
            if !self.inner.cancel.is_cancelled() {
                self.inner.handlers.error(e);
            }
        }
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.cancel.cancel();
        let task = self.inner.stream_task.lock().await.take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.inner.handlers.closed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JsonRpcRequest, RequestId};
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::{mpsc, Mutex};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    type EventQueue = Arc<Mutex<mpsc::UnboundedReceiver<String>>>;

    /// Minimal server that keeps the GET stream open, which a mock HTTP
    /// server cannot do.
    struct StreamingServer {
        url: String,
        events: mpsc::UnboundedSender<String>,
        posts: mpsc::UnboundedReceiver<(String, String)>,
    }

    async fn streaming_server(post_status: u16) -> StreamingServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events, event_rx) = mpsc::unbounded_channel();
        let event_rx: EventQueue = Arc::new(Mutex::new(event_rx));
        let (post_tx, posts) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let event_rx = event_rx.clone();
                let post_tx = post_tx.clone();
                tokio::spawn(serve_connection(socket, event_rx, post_tx, post_status));
            }
        });

        StreamingServer {
            url: format!("http://{addr}/sse"),
            events,
            posts,
        }
    }

    async fn serve_connection(
        socket: TcpStream,
        events: EventQueue,
        posts: mpsc::UnboundedSender<(String, String)>,
        post_status: u16,
    ) {
        let mut reader = BufReader::new(socket);
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
            return;
        }

        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 || line == "\r\n" {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
        }

        if request_line.starts_with("GET") {
            let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\n\r\n";
            if reader.get_mut().write_all(head.as_bytes()).await.is_err() {
                return;
            }
            let mut events = events.lock().await;
            while let Some(chunk) = events.recv().await {
                let socket = reader.get_mut();
                if socket.write_all(chunk.as_bytes()).await.is_err() || socket.flush().await.is_err()
                {
                    return;
                }
            }
        } else {
            let mut body = vec![0u8; content_length];
            let _ = reader.read_exact(&mut body).await;
            let _ = posts.send((
                request_line.trim().to_string(),
                String::from_utf8_lossy(&body).into_owned(),
            ));
            let response = format!(
                "HTTP/1.1 {post_status} Status\r\ncontent-length: 4\r\nconnection: close\r\n\r\nnope"
            );
            let _ = reader.get_mut().write_all(response.as_bytes()).await;
        }
    }

    struct Harness {
        transport: SseTransport,
        messages: mpsc::UnboundedReceiver<JsonRpcMessage>,
        errors: mpsc::UnboundedReceiver<String>,
        closes: Arc<AtomicUsize>,
    }

    fn harness(url: &str) -> Harness {
        let transport = SseTransport::new(&EndpointConfig {
            url: url.to_string(),
            headers: Default::default(),
            timeout_secs: 5,
        })
        .unwrap();
        let (msg_tx, messages) = mpsc::unbounded_channel();
        let (err_tx, errors) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        transport.set_handlers(
            TransportHandlers::default()
                .on_message(move |m| {
                    let _ = msg_tx.send(m);
                })
                .on_error(move |e| {
                    let _ = err_tx.send(e.to_string());
                })
                .on_close(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
        );
        Harness {
            transport,
            messages,
            errors,
            closes,
        }
    }

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("timed out waiting")
            .expect("channel closed")
    }

    fn ping(id: i64) -> JsonRpcMessage {
        JsonRpcRequest::new(id, "ping", None).into()
    }

    #[tokio::test]
    async fn test_start_waits_for_endpoint_and_posts_there() {
        let mut server = streaming_server(200).await;
        server
            .events
            .send("event: endpoint\ndata: /messages?sessionId=abc\n\n".to_string())
            .unwrap();

        let h = harness(&server.url);
        h.transport.start().await.unwrap();
        assert_eq!(
            h.transport.endpoint().unwrap().as_str(),
            format!("{}/messages?sessionId=abc", server.url.trim_end_matches("/sse"))
        );

        h.transport.send(ping(3)).await.unwrap();
        let (request_line, body) = recv(&mut server.posts).await;
        assert!(request_line.starts_with("POST /messages?sessionId=abc "));
        let body: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body, json!({"jsonrpc": "2.0", "id": 3, "method": "ping"}));
    }

    #[tokio::test]
    async fn test_messages_and_parse_failures() {
        let server = streaming_server(200).await;
        server
            .events
            .send("event: endpoint\ndata: /messages\n\n".to_string())
            .unwrap();

        let mut h = harness(&server.url);
        h.transport.start().await.unwrap();

        server
            .events
            .send("event: message\ndata: not json\n\n".to_string())
            .unwrap();
        server
            .events
            .send("event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n".to_string())
            .unwrap();

        assert!(recv(&mut h.errors).await.contains("Failed to parse message"));
        let message = recv(&mut h.messages).await;
        assert_eq!(message.id(), Some(&RequestId::Number(1)));
    }

    #[tokio::test]
    async fn test_post_failure_is_reported_not_returned() {
        let server = streaming_server(500).await;
        server
            .events
            .send("event: endpoint\ndata: /messages\n\n".to_string())
            .unwrap();

        let mut h = harness(&server.url);
        h.transport.start().await.unwrap();
        h.transport.send(ping(1)).await.unwrap();
        assert!(recv(&mut h.errors)
            .await
            .contains("POSTing to endpoint (HTTP 500): nope"));
    }

    #[tokio::test]
    async fn test_close_fires_once_and_disconnects() {
        let server = streaming_server(200).await;
        server
            .events
            .send("event: endpoint\ndata: /messages\n\n".to_string())
            .unwrap();

        let h = harness(&server.url);
        h.transport.start().await.unwrap();
        h.transport.close().await.unwrap();
        h.transport.close().await.unwrap();
        assert_eq!(h.closes.load(Ordering::SeqCst), 1);
        assert!(h.transport.send(ping(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let h = harness("http://127.0.0.1:9/sse");
        let err = h.transport.send(ping(1)).await.unwrap_err();
        assert!(err.to_string().contains("Not connected"));
    }

    #[tokio::test]
    async fn test_endpoint_origin_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "event: endpoint\ndata: https://evil.example.com/messages\n\n",
                "text/event-stream",
            ))
            .mount(&server)
            .await;

        let h = harness(&format!("{}/sse", server.uri()));
        let err = h.transport.start().await.unwrap_err();
        assert!(err
            .to_string()
            .contains("Endpoint origin does not match connection origin: https://evil.example.com"));
    }

    #[tokio::test]
    async fn test_non_200_fails_start() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let h = harness(&format!("{}/sse", server.uri()));
        let err = h.transport.start().await.unwrap_err();
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_stream_end_after_endpoint_is_unexpected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "event: endpoint\ndata: /messages\n\n",
                "text/event-stream",
            ))
            .mount(&server)
            .await;

        let mut h = harness(&format!("{}/sse", server.uri()));
        h.transport.start().await.unwrap();
        assert!(recv(&mut h.errors)
            .await
            .contains("Connection closed unexpectedly"));
        assert!(h.transport.send(ping(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_stream_end_without_endpoint_fails_start() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("", "text/event-stream"))
            .mount(&server)
            .await;

        let h = harness(&format!("{}/sse", server.uri()));
        assert!(h.transport.start().await.is_err());
    }
}
