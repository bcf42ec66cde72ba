//! HTTP+SSE client.
//!
//! A GET on the SSE endpoint opens the stream; the server's first frame is an
//! `endpoint` event advertising where to POST (with the session id baked into
//! the query). Sends block until that handshake completes. The stream
//! reconnects with exponential backoff, offering `Last-Event-ID` when the
//! server sequences its frames.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use tether_jsonrpc::{Notification, Request, Response, UnauthorizedError};

use crate::base::{ClientCore, ClientHandler, ClientOptions, SendData};
use crate::error::ClientError;
use crate::sse_stream::SseParser;
use crate::{BACKOFF_BASE, BACKOFF_CAP};

/// Configuration of the SSE client.
#[derive(Clone)]
pub struct SseClientOptions {
    /// How long sends wait for the `endpoint` handshake event.
    pub handshake_timeout: Duration,
    pub client: ClientOptions,
}

impl Default for SseClientOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            client: ClientOptions::default(),
        }
    }
}

struct Shared {
    http: reqwest::Client,
    sse_url: Url,
    handshake_timeout: Duration,
    endpoint_tx: watch::Sender<Option<Url>>,
    endpoint_rx: watch::Receiver<Option<Url>>,
    last_id: AtomicU64,
    cancel: CancellationToken,
    core: OnceLock<Weak<ClientCore>>,
}

impl Shared {
    fn core(&self) -> Option<Arc<ClientCore>> {
        self.core.get().and_then(Weak::upgrade)
    }

    /// Waits for the `endpoint` handshake event, bounded by the handshake
    /// timeout.
    async fn message_endpoint(&self) -> Result<Url, ClientError> {
        let mut rx = self.endpoint_rx.clone();
        let wait = async {
            loop {
                if let Some(url) = rx.borrow().clone() {
                    return Ok(url);
                }
                if rx.changed().await.is_err() {
                    return Err(ClientError::Transport(
                        "sse stream terminated before handshake".to_string(),
                    ));
                }
            }
        };
        match tokio::time::timeout(self.handshake_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Transport(
                "timed out waiting for endpoint event".to_string(),
            )),
        }
    }

    async fn run_stream(self: Arc<Self>) {
        let mut backoff = BACKOFF_BASE;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let mut builder = self
                .http
                .get(self.sse_url.clone())
                .header(ACCEPT, "text/event-stream");
            let last_id = self.last_id.load(Ordering::SeqCst);
            if last_id > 0 {
                builder = builder.header("Last-Event-ID", last_id.to_string());
            }

            match builder.send().await {
                Ok(response) if response.status().as_u16() == 200 => {
                    debug!("sse stream attached");
                    self.consume_stream(response).await;
                    if self.cancel.is_cancelled() {
                        return;
                    }
                    backoff = BACKOFF_BASE;
                }
                Ok(response) => {
                    warn!(status = response.status().as_u16(), "sse attach rejected");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
                Err(err) => {
                    debug!(error = %err, "sse open failed");
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
                        self.process_event(event).await;
                    }
                }
            }
        }
    }

    async fn process_event(&self, event: crate::sse_stream::SseEvent) {
        if let Some(id) = event.id.as_deref().and_then(|v| v.parse::<u64>().ok()) {
            self.last_id.store(id, Ordering::SeqCst);
        }
        match event.event.as_deref() {
            Some("endpoint") => match self.sse_url.join(&event.data) {
                Ok(url) => {
                    debug!(endpoint = %url, "message endpoint advertised");
                    let _ = self.endpoint_tx.send(Some(url));
                }
                Err(err) => warn!(error = %err, data = %event.data, "bad endpoint event"),
            },
            Some("message") if !event.data.is_empty() => {
                if let Some(core) = self.core() {
                    core.handle_message(event.data.as_bytes()).await;
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl SendData for Arc<Shared> {
    async fn send_data(&self, data: &[u8]) -> Result<(), ClientError> {
        let endpoint = self.message_endpoint().await?;
        let response = self
            .http
            .post(endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(data.to_vec())
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.bytes().await.unwrap_or_default();
        match status {
            200 | 202 => {
                // streaming-style endpoints answer synchronously in the body
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

/// SSE-profile JSON-RPC client.
pub struct SseClient {
    core: Arc<ClientCore>,
    shared: Arc<Shared>,
}

impl SseClient {
    /// Builds the client and immediately opens the stream; the first send
    /// waits for the server's `endpoint` event.
    pub fn new(
        sse_url: &str,
        handler: Arc<dyn ClientHandler>,
        options: SseClientOptions,
    ) -> Result<(Self, mpsc::Receiver<Notification>), ClientError> {
        let sse_url = Url::parse(sse_url)?;
        let http = reqwest::Client::builder().cookie_store(true).build()?;
        let (endpoint_tx, endpoint_rx) = watch::channel(None);

        let (core, notifications) = ClientCore::new(handler, options.client);
        let shared = Arc::new(Shared {
            http,
            sse_url,
            handshake_timeout: options.handshake_timeout,
            endpoint_tx,
            endpoint_rx,
            last_id: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            core: OnceLock::new(),
        });
        let _ = shared.core.set(Arc::downgrade(&core));
        core.set_sender(Arc::new(Arc::clone(&shared)) as Arc<dyn SendData>);

        let stream_shared = Arc::clone(&shared);
        tokio::spawn(async move { stream_shared.run_stream().await });

        Ok((Self { core, shared }, notifications))
    }

    pub async fn send(&self, request: Request) -> Result<Response, ClientError> {
        self.core.send(request).await
    }

    pub async fn notify(&self, notification: &Notification) -> Result<(), ClientError> {
        self.core.notify(notification).await
    }

    /// The advertised message endpoint, once the handshake happened.
    pub fn message_endpoint(&self) -> Option<Url> {
        self.shared.endpoint_rx.borrow().clone()
    }

    pub fn close(&self) {
        self.shared.cancel.cancel();
        self.core.set_error("client closed");
    }
}

impl Drop for SseClient {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}
