//! NDJSON streaming transport: the streamable-HTTP contract with
//! `{"id":N,"data":…}` envelope framing instead of SSE.

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
use crate::locate::{LocationKind, SessionLocation};
use crate::streamable::{accepts, read_body, status_response, with_headers};
use crate::{DEFAULT_SESSION_HEADER, NDJSON_MIME};

/// Configuration of the NDJSON handler.
#[derive(Clone)]
pub struct StreamingOptions {
    pub uri: String,
    pub session_location: SessionLocation,
    pub lifecycle: LifecycleConfig,
    pub max_body_size: usize,
    pub run_timeout: Option<Duration>,
}

impl Default for StreamingOptions {
    fn default() -> Self {
        Self {
            uri: "/mcp".to_string(),
            session_location: SessionLocation::header(DEFAULT_SESSION_HEADER),
            lifecycle: LifecycleConfig::default(),
            max_body_size: 1024 * 1024,
            run_timeout: None,
        }
    }
}

/// The NDJSON streaming server handler.
pub struct StreamingHandler {
    options: StreamingOptions,
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn SessionStore>,
    _sweeper: Sweeper,
}

impl StreamingHandler {
    pub fn new(handler: Arc<dyn Handler>, options: StreamingOptions) -> Self {
        Self::with_store(handler, options, Arc::new(MemorySessionStore::new()))
    }

    pub fn with_store(
        handler: Arc<dyn Handler>,
        options: StreamingOptions,
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
        if !self.options.uri.is_empty() && !req.uri().path().ends_with(&self.options.uri) {
            return status_response(StatusCode::NOT_FOUND, "not found");
        }
        match req.method() {
            &Method::POST => self.handle_post(req).await,
            &Method::GET => self.handle_get(req).await,
            &Method::DELETE => self.handle_delete(req).await,
            _ => status_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        }
    }

    async fn handle_post<B>(&self, req: Request<B>) -> Response<BoxedBody>
    where
        B: http_body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let session = match self.options.session_location.locate(&req) {
            Some(session_id) => match self.store.get(&session_id).await {
                Some(session) => session,
                None => {
                    return status_response(
                        StatusCode::NOT_FOUND,
                        format!("session '{session_id}' not found"),
                    )
                }
            },
            None => {
                // handshake: mint a session with envelope framing so every
                // buffered frame is replayable by id
                let session = Session::builder()
                    .framer(Framer::NdjsonEnvelope)
                    .event_buffer(self.options.lifecycle.max_event_buffer)
                    .overflow_policy(self.options.lifecycle.overflow_policy)
                    .build();
                self.store.put(Arc::clone(&session)).await;
                debug!(session = %session.id(), "ndjson handshake minted session");
                session
            }
        };

        let body = match read_body(req, self.options.max_body_size).await {
            Ok(body) => body,
            Err(response) => return *response,
        };

        let mut extra = HeaderMap::new();
        self.set_session_header(&mut extra, session.id());

        if body.is_empty() {
            return with_headers(Response::new(empty_body()), extra);
        }

        let mut output = Vec::new();
        self.dispatcher
            .handle_message(&session, &body, Some(&mut output))
            .await;

        if output.is_empty() {
            let mut response = Response::new(empty_body());
            *response.status_mut() = StatusCode::ACCEPTED;
            return with_headers(response, extra);
        }

        let mut response = Response::new(full_body(output));
        response
            .headers_mut()
            .insert("content-type", HeaderValue::from_static("application/json"));
        with_headers(response, extra)
    }

    async fn handle_get<B>(&self, req: Request<B>) -> Response<BoxedBody> {
        if !accepts(req.headers(), NDJSON_MIME) {
            return status_response(
                StatusCode::NOT_ACCEPTABLE,
                "unsupported Accept header, expecting application/x-ndjson",
            );
        }
        let Some(session_id) = self.options.session_location.locate(&req).or_else(|| {
            req.uri()
                .query()
                .and_then(|q| self.options.session_location.locate_in_query(q))
        }) else {
            return status_response(
                StatusCode::BAD_REQUEST,
                format!("missing {}", self.options.session_location.name),
            );
        };
        let Some(session) = self.store.get(&session_id).await else {
            return status_response(
                StatusCode::NOT_FOUND,
                format!("session '{session_id}' not found"),
            );
        };

        let last_event_id = req
            .headers()
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|id| *id > 0);

        let (writer, handle, stream_body) = streaming_channel();
        let generation = session.mark_active_with_writer(Box::new(writer)).await;
        session.set_framer(Framer::NdjsonEnvelope).await;
        session
            .set_event_buffer(self.options.lifecycle.max_event_buffer)
            .await;

        if let Some(last_id) = last_event_id {
            let replayed = session.replay_after(last_id).await;
            debug!(session = %session_id, last_id, replayed, "replayed ndjson events");
        }

        self.watch_disconnect(Arc::clone(&session), handle, generation);

        let mut response = Response::new(stream_body);
        let headers = response.headers_mut();
        headers.insert("content-type", HeaderValue::from_static(NDJSON_MIME));
        headers.insert(
            "cache-control",
            HeaderValue::from_static("no-cache, no-transform"),
        );
        let mut extra = HeaderMap::new();
        self.set_session_header(&mut extra, &session_id);
        with_headers(response, extra)
    }

    async fn handle_delete<B>(&self, req: Request<B>) -> Response<BoxedBody> {
        let Some(session_id) = self.options.session_location.locate(&req) else {
            return status_response(
                StatusCode::BAD_REQUEST,
                format!("missing {}", self.options.session_location.name),
            );
        };
        if let Some(session) = self.store.remove(&session_id).await {
            session.close().await;
            if let Some(hook) = &self.options.lifecycle.on_session_close {
                hook(&session);
            }
        }
        status_response(StatusCode::OK, "")
    }

    fn set_session_header(&self, headers: &mut HeaderMap, session_id: &str) {
        let name = match self.options.session_location.kind {
            LocationKind::Header => self.options.session_location.name.as_str(),
            LocationKind::Query => DEFAULT_SESSION_HEADER,
        };
        if let (Ok(name), Ok(value)) = (
            hyper::header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(session_id),
        ) {
            headers.insert(name, value);
        }
    }

    fn watch_disconnect(&self, session: Arc<Session>, handle: StreamHandle, generation: u64) {
        let store = Arc::clone(&self.store);
        let policy = self.options.lifecycle.removal_policy;
        tokio::spawn(async move {
            handle.closed().await;
            if session.writer_generation() != generation {
                return;
            }
            if policy == RemovalPolicy::OnDisconnect {
                store.remove(session.id()).await;
                session.close().await;
            } else {
                session.mark_detached().await;
            }
        });
    }
}
