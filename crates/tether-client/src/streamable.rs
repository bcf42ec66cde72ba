//! Streamable-HTTP client.
//!
//! The first POST doubles as the handshake: the response carries the session
//! id header, which every subsequent request echoes. A background GET stream
//! carries server-initiated traffic, reconnecting with exponential backoff
//! and `Last-Event-ID`. When the server upgrades a POST to SSE, the events on
//! that response body are consumed inline on an independent id counter, so
//! POST-stream ids never disturb GET-stream replay.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use tether_jsonrpc::{Notification, Request, Response, UnauthorizedError};

use crate::base::{ClientCore, ClientHandler, ClientOptions, SendData};
use crate::error::ClientError;
use crate::sse_stream::SseParser;
use crate::{BACKOFF_BASE, BACKOFF_CAP};

/// Configuration of the streamable-HTTP client.
#[derive(Clone)]
pub struct StreamableClientOptions {
    /// Header carrying the session id. Defaults to `Mcp-Session-Id`.
    pub session_header: String,
    /// Extra headers attached to every request (protocol version pins,
    /// auth schemes the server expects, and the like).
    pub default_headers: Vec<(String, String)>,
    pub client: ClientOptions,
}

impl Default for StreamableClientOptions {
    fn default() -> Self {
        Self {
            session_header: "Mcp-Session-Id".to_string(),
            default_headers: Vec::new(),
            client: ClientOptions::default(),
        }
    }
}

struct Shared {
    http: reqwest::Client,
    endpoint: Url,
    session_header: String,
    default_headers: Vec<(String, String)>,
    session_id: parking_lot::Mutex<Option<String>>,
    last_id_get: AtomicU64,
    last_id_post: AtomicU64,
    stream_started: AtomicBool,
    cancel: CancellationToken,
    core: OnceLock<Weak<ClientCore>>,
}

impl Shared {
    fn core(&self) -> Option<Arc<ClientCore>> {
        self.core.get().and_then(Weak::upgrade)
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    /// Starts the background GET stream once a session id exists.
    fn ensure_stream(self: &Arc<Self>) {
        if self.stream_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = Arc::clone(self);
        tokio::spawn(async move { shared.run_stream().await });
    }

    async fn run_stream(self: Arc<Self>) {
        let mut backoff = BACKOFF_BASE;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let Some(session_id) = self.session_id() else {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            };

            let mut builder = self
                .http
                .get(self.endpoint.clone())
                .header(ACCEPT, "text/event-stream")
                .header(self.session_header.as_str(), session_id.as_str());
            for (name, value) in &self.default_headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            let last_id = self.last_id_get.load(Ordering::SeqCst);
            if last_id > 0 {
                builder = builder.header("Last-Event-ID", last_id.to_string());
            }

            match builder.send().await {
                Ok(response) if response.status().as_u16() == 200 => {
                    debug!(last_id, "event stream attached");
                    self.consume_stream(response).await;
                    if self.cancel.is_cancelled() {
                        return;
                    }
                    // graceful end: reconnect promptly
                    backoff = BACKOFF_BASE;
                }
                Ok(response) => {
                    warn!(status = response.status().as_u16(), "stream attach rejected");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
                Err(err) => {
                    debug!(error = %err, "stream open failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
            }
        }
    }

    async fn consume_stream(&self, response: reqwest::Response) {
        let mut parser = SseParser::new();
        let mut stream = response.bytes_stream();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                chunk = stream.next() => {
                    let Some(Ok(chunk)) = chunk else { return };
                    for event in parser.push(&chunk) {
                        if let Some(id) = event.id.as_deref().and_then(|v| v.parse::<u64>().ok()) {
                            self.last_id_get.store(id, Ordering::SeqCst);
                        }
                        if event.event.as_deref() == Some("message") && !event.data.is_empty() {
                            if let Some(core) = self.core() {
                                core.handle_message(event.data.as_bytes()).await;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Consumes an SSE-upgraded POST response inline, on the POST id counter.
    async fn consume_post_stream(&self, response: reqwest::Response) {
        let mut parser = SseParser::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let Ok(chunk) = chunk else { return };
            for event in parser.push(&chunk) {
                if let Some(id) = event.id.as_deref().and_then(|v| v.parse::<u64>().ok()) {
                    self.last_id_post.store(id, Ordering::SeqCst);
                }
                if event.event.as_deref() == Some("message") && !event.data.is_empty() {
                    if let Some(core) = self.core() {
                        core.handle_message(event.data.as_bytes()).await;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl SendData for Arc<Shared> {
    async fn send_data(&self, data: &[u8]) -> Result<(), ClientError> {
        let mut builder = self
            .http
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            // the client must declare both JSON and SSE for POST responses
            .header(ACCEPT, "application/json, text/event-stream")
            .body(data.to_vec());
        if let Some(session_id) = self.session_id() {
            builder = builder.header(self.session_header.as_str(), session_id.as_str());
        }
        for (name, value) in &self.default_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;

        if let Some(session_id) = response
            .headers()
            .get(self.session_header.as_str())
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock() = Some(session_id.to_string());
            self.ensure_stream();
        }
        if self.session_id().is_none() {
            return Err(ClientError::Handshake(self.session_header.clone()));
        }

        let status = response.status().as_u16();
        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"));

        if is_sse {
            self.consume_post_stream(response).await;
            return Ok(());
        }

        let body = response.bytes().await.unwrap_or_default();
        match status {
            200 | 202 => {
                if !body.is_empty() {
                    if let Some(core) = self.core() {
                        core.handle_message(&body).await;
                    }
                }
                Ok(())
            }
            401 => Err(UnauthorizedError::new(
                401,
                String::from_utf8_lossy(&body).to_string(),
            )
            .into()),
            status => Err(ClientError::Status {
                status,
                body: String::from_utf8_lossy(&body).to_string(),
            }),
        }
    }
}

/// Streamable-HTTP JSON-RPC client.
pub struct StreamableClient {
    core: Arc<ClientCore>,
    shared: Arc<Shared>,
}

impl StreamableClient {
    /// Builds the client and its notification receiver. No network traffic
    /// happens until the first send; that first POST performs the handshake.
    pub fn new(
        endpoint: &str,
        handler: Arc<dyn ClientHandler>,
        options: StreamableClientOptions,
    ) -> Result<(Self, mpsc::Receiver<Notification>), ClientError> {
        let endpoint = Url::parse(endpoint)?;
        // the cookie jar carries BFF auth grants across rotations
        let http = reqwest::Client::builder().cookie_store(true).build()?;

        let (core, notifications) = ClientCore::new(handler, options.client);
        let shared = Arc::new(Shared {
            http,
            endpoint,
            session_header: options.session_header,
            default_headers: options.default_headers,
            session_id: parking_lot::Mutex::new(None),
            last_id_get: AtomicU64::new(0),
            last_id_post: AtomicU64::new(0),
            stream_started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            core: OnceLock::new(),
        });
        let _ = shared.core.set(Arc::downgrade(&core));
        core.set_sender(Arc::new(Arc::clone(&shared)) as Arc<dyn SendData>);

        Ok((Self { core, shared }, notifications))
    }

    pub async fn send(&self, request: Request) -> Result<Response, ClientError> {
        self.core.send(request).await
    }

    pub async fn notify(&self, notification: &Notification) -> Result<(), ClientError> {
        self.core.notify(notification).await
    }

    /// The session id captured during the handshake, once known.
    pub fn session_id(&self) -> Option<String> {
        self.shared.session_id()
    }

    /// Largest event id observed on the GET stream.
    pub fn last_event_id(&self) -> u64 {
        self.shared.last_id_get.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.shared.cancel.cancel();
        self.core.set_error("client closed");
    }
}

impl Drop for StreamableClient {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}
