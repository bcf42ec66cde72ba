//! HTTP+SSE transport: a long-lived GET stream plus a POST message endpoint.
//!
//! The GET handshake mints a session and advertises the message endpoint via
//! a single `endpoint` event whose data is
//! `<message_uri>?<session_param>=<id>`. Subsequent frames are `message`
//! events. POSTs to the message endpoint return 202 for notifications and
//! emit synchronous responses as `message` frames on the stream; POSTs to any
//! other path (the streaming-style endpoint) return the response as the JSON
//! body and echo the session id in the streaming-session header.

use std::sync::Arc;
use std::time::Duration;

use hyper::header::HeaderValue;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use tracing::debug;

use tether_transport::{
    Dispatcher, Framer, Handler, LifecycleConfig, MemorySessionStore, RemovalPolicy, Session,
    SessionStore, Sweeper,
};

use crate::body::{empty_body, full_body, streaming_channel, BoxedBody, StreamHandle};
use crate::cors::CorsConfig;
use crate::locate::SessionLocation;
use crate::streamable::{read_body, sse_headers, status_response, with_headers};
use crate::DEFAULT_SESSION_HEADER;

/// Configuration of the SSE handler.
#[derive(Clone)]
pub struct SseOptions {
    /// Path of the long-lived event stream.
    pub sse_uri: String,
    /// Path of the message endpoint advertised in the `endpoint` event.
    pub message_uri: String,
    /// Where the session id lives on message POSTs (default: `session_id`
    /// query parameter).
    pub session_location: SessionLocation,
    /// Session location for the streaming-style endpoint and DELETE.
    pub streaming_session_location: SessionLocation,
    pub lifecycle: LifecycleConfig,
    pub keep_alive_interval: Option<Duration>,
    pub max_body_size: usize,
    pub cors: CorsConfig,
    pub run_timeout: Option<Duration>,
}

impl Default for SseOptions {
    fn default() -> Self {
        Self {
            sse_uri: "/sse".to_string(),
            message_uri: "/message".to_string(),
            session_location: SessionLocation::query("session_id"),
            streaming_session_location: SessionLocation::header(DEFAULT_SESSION_HEADER),
            lifecycle: LifecycleConfig::default(),
            keep_alive_interval: None,
            max_body_size: 1024 * 1024,
            cors: CorsConfig::default(),
            run_timeout: None,
        }
    }
}

/// The SSE server handler.
pub struct SseHandler {
    options: SseOptions,
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn SessionStore>,
    _sweeper: Sweeper,
}

impl SseHandler {
    pub fn new(handler: Arc<dyn Handler>, options: SseOptions) -> Self {
        Self::with_store(handler, options, Arc::new(MemorySessionStore::new()))
    }

    pub fn with_store(
        handler: Arc<dyn Handler>,
        options: SseOptions,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let mut dispatcher = Dispatcher::new(handler);
        if let Some(timeout) = options.run_timeout {
            dispatcher = dispatcher.with_run_timeout(timeout);
        }
        let sweeper = Sweeper::spawn(Arc::clone(&store), options.lifecycle.clone());
        Self {
            options,
            dispatcher: Arc::new(dispatcher),
            store,
            _sweeper: sweeper,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<BoxedBody>
    where
        B: http_body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let origin = req
            .headers()
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let path = req.uri().path().to_string();
        let mut response = match req.method() {
            // any GET opens a stream; the configured sse_uri is the
            // canonical path
            &Method::GET => self.handle_stream(req).await,
            &Method::POST => self.handle_post(req, &path).await,
            &Method::DELETE => self.handle_delete(req).await,
            &Method::OPTIONS => self.options.cors.preflight(origin.as_deref()),
            _ => status_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        };

        self.options
            .cors
            .apply(origin.as_deref(), response.headers_mut());
        response
    }

    /// GET: mint a session, publish the `endpoint` event, stream until the
    /// client context ends.
    async fn handle_stream<B>(&self, _req: Request<B>) -> Response<BoxedBody> {
        let (writer, handle, stream_body) = streaming_channel();
        let session = Session::builder()
            .writer(Box::new(writer))
            .framer(Framer::Sse)
            .event_buffer(self.options.lifecycle.max_event_buffer)
            .overflow_policy(self.options.lifecycle.overflow_policy)
            .build();

        let endpoint = format!(
            "{}?{}",
            self.options.message_uri,
            self.options.session_location.to_query(session.id())
        );
        session
            .send_raw(format!("event: endpoint\ndata: {endpoint}\n\n").as_bytes())
            .await;

        self.store.put(Arc::clone(&session)).await;
        debug!(session = %session.id(), "sse stream established");

        let generation = session.writer_generation();
        self.spawn_keepalive(Arc::clone(&session), generation);
        self.watch_disconnect(Arc::clone(&session), handle, generation);

        let mut response = Response::new(stream_body);
        sse_headers(response.headers_mut());
        response
    }

    async fn handle_post<B>(&self, req: Request<B>, path: &str) -> Response<BoxedBody>
    where
        B: http_body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        // POSTs outside the message endpoint use the bi-directional
        // streaming-style contract
        let use_streaming = !path.ends_with(self.options.message_uri.as_str());
        let location = if use_streaming {
            &self.options.streaming_session_location
        } else {
            &self.options.session_location
        };

        let session_id = location.locate(&req);
        let ephemeral = session_id.is_none();
        let session = match &session_id {
            Some(id) => match self.store.get(id).await {
                Some(session) => session,
                None => {
                    return status_response(
                        StatusCode::NOT_FOUND,
                        format!("session '{id}' not found"),
                    )
                }
            },
            // no session on the wire: serve the message on an ephemeral
            // in-memory session answering into this response only
            None => Session::builder().build(),
        };

        let body = match read_body(req, self.options.max_body_size).await {
            Ok(body) => body,
            Err(response) => return *response,
        };

        let mut output = Vec::new();
        self.dispatcher
            .handle_message(&session, &body, Some(&mut output))
            .await;

        if output.is_empty() {
            let mut response = Response::new(empty_body());
            *response.status_mut() = StatusCode::ACCEPTED;
            return response;
        }

        if use_streaming {
            let mut response = Response::new(full_body(output));
            response
                .headers_mut()
                .insert("content-type", HeaderValue::from_static("application/json"));
            let mut extra = HeaderMap::new();
            if let (Ok(name), Ok(value)) = (
                hyper::header::HeaderName::from_bytes(
                    self.options.streaming_session_location.name.as_bytes(),
                ),
                HeaderValue::from_str(session.id()),
            ) {
                extra.insert(name, value);
            }
            return with_headers(response, extra);
        }

        if ephemeral {
            // no stream to deliver on: the frame rides in this response body
            let frame = format!(
                "event: message\ndata: {}\n\n",
                String::from_utf8_lossy(&output).trim()
            );
            let mut response = Response::new(full_body(frame));
            *response.status_mut() = StatusCode::ACCEPTED;
            return response;
        }

        // message endpoint: the response travels as a `message` frame on the
        // stream; the POST itself is just accepted
        session.send_data(&output).await;
        let mut response = Response::new(empty_body());
        *response.status_mut() = StatusCode::ACCEPTED;
        response
    }

    async fn handle_delete<B>(&self, req: Request<B>) -> Response<BoxedBody> {
        let Some(session_id) = self
            .options
            .streaming_session_location
            .locate(&req)
            .or_else(|| self.options.session_location.locate(&req))
        else {
            return status_response(StatusCode::BAD_REQUEST, "missing session id");
        };
        if let Some(session) = self.store.remove(&session_id).await {
            session.close().await;
            if let Some(hook) = &self.options.lifecycle.on_session_close {
                hook(&session);
            }
        }
        status_response(StatusCode::OK, "")
    }

    fn spawn_keepalive(&self, session: Arc<Session>, generation: u64) {
        let Some(interval) = self.options.keep_alive_interval else {
            return;
        };
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if session.writer_generation() != generation
                    || session.state().await != tether_transport::SessionState::Active
                {
                    return;
                }
                session.send_keepalive().await;
            }
        });
    }

    fn watch_disconnect(&self, session: Arc<Session>, handle: StreamHandle, generation: u64) {
        let store = Arc::clone(&self.store);
        let policy = self.options.lifecycle.removal_policy;
        let on_close = self.options.lifecycle.on_session_close.clone();
        tokio::spawn(async move {
            handle.closed().await;
            if session.writer_generation() != generation {
                return;
            }
            if policy == RemovalPolicy::OnDisconnect {
                store.remove(session.id()).await;
                session.close().await;
                if let Some(hook) = &on_close {
                    hook(&session);
                }
            } else {
                session.mark_detached().await;
            }
            debug!(session = %session.id(), "sse stream disconnected");
        });
    }
}
