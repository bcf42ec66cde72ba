//! Streamable-HTTP transport: one endpoint for handshake, messages and
//! streaming.
//!
//! Operation is distinguished by HTTP method and headers:
//!
//! - `POST` without a session id: handshake. Mints a session, returns its id
//!   in the session header, then processes the body (if any) as a regular
//!   message for the new session. Optionally rehydrates BFF auth from the
//!   cookie first.
//! - `POST` with a session id: dispatches the body. When the client accepts
//!   `text/event-stream` and the payload is an id-bearing request, the
//!   response upgrades to an SSE stream on this connection so the server can
//!   issue follow-up requests during the same turn.
//! - `GET` with a session id and `Accept: text/event-stream`: (re)attaches
//!   the session's stream, replaying buffered events strictly after a
//!   non-zero `Last-Event-ID`.
//! - `DELETE` with a session id: removes the session, regardless of removal
//!   policy (explicit teardown).
//! - `OPTIONS`: CORS preflight.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::header::{HeaderValue, ACCEPT};
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use tracing::{debug, warn};

use tether_jsonrpc::{classify, MessageKind};
use tether_transport::{
    Dispatcher, Framer, Handler, LifecycleConfig, MemorySessionStore, RemovalPolicy, Session,
    SessionStore, Sweeper,
};

use crate::bff::BffAuth;
use crate::body::{empty_body, full_body, streaming_channel, BoxedBody, StreamHandle};
use crate::cors::CorsConfig;
use crate::locate::{LocationKind, SessionLocation};
use crate::{DEFAULT_SESSION_HEADER, SSE_MIME};

/// Configuration of the streamable-HTTP handler.
#[derive(Clone)]
pub struct StreamableOptions {
    /// Endpoint path suffix; empty matches any path the handler is mounted
    /// on.
    pub uri: String,
    /// Where the session id travels. Defaults to the `Mcp-Session-Id`
    /// header. The session id is header/query only, never a cookie.
    pub session_location: SessionLocation,
    pub lifecycle: LifecycleConfig,
    /// Emit `: keepalive` comments on attached streams at this cadence.
    pub keep_alive_interval: Option<Duration>,
    pub max_body_size: usize,
    pub cors: CorsConfig,
    /// Run timeout for server-initiated requests issued from handlers.
    pub run_timeout: Option<Duration>,
}

impl Default for StreamableOptions {
    fn default() -> Self {
        Self {
            uri: String::new(),
            session_location: SessionLocation::header(DEFAULT_SESSION_HEADER),
            lifecycle: LifecycleConfig::default(),
            keep_alive_interval: None,
            max_body_size: 1024 * 1024,
            cors: CorsConfig::default(),
            run_timeout: None,
        }
    }
}

/// The streamable-HTTP server handler.
pub struct StreamableHandler {
    options: StreamableOptions,
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn SessionStore>,
    auth: Option<Arc<BffAuth>>,
    _sweeper: Sweeper,
}

impl StreamableHandler {
    pub fn new(handler: Arc<dyn Handler>, options: StreamableOptions) -> Self {
        Self::with_store(handler, options, Arc::new(MemorySessionStore::new()))
    }

    /// Uses a custom session store instead of the in-memory default.
    pub fn with_store(
        handler: Arc<dyn Handler>,
        options: StreamableOptions,
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
            auth: None,
            _sweeper: sweeper,
        }
    }

    /// Enables server-held BFF auth on this endpoint.
    pub fn with_auth(mut self, auth: BffAuth) -> Self {
        self.auth = Some(Arc::new(auth));
        self
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

        let mut response = self.route(req).await;
        self.options
            .cors
            .apply(origin.as_deref(), response.headers_mut());
        response
    }

    async fn route<B>(&self, req: Request<B>) -> Response<BoxedBody>
    where
        B: http_body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let path = req.uri().path().to_string();

        if let Some(auth) = self.auth.clone() {
            if let Some(logout) = auth.logout_all_path.clone() {
                if req.method() == Method::POST && path.ends_with(logout.as_str()) {
                    return match auth.logout_all(&req).await {
                        Some(clear_cookie) => {
                            let mut response = status_response(StatusCode::OK, "logged out");
                            if let Ok(value) = HeaderValue::from_str(&clear_cookie) {
                                response.headers_mut().insert("set-cookie", value);
                            }
                            response
                        }
                        None => {
                            status_response(StatusCode::UNAUTHORIZED, "no active auth session")
                        }
                    };
                }
            }
        }

        if !self.options.uri.is_empty() && !path.ends_with(&self.options.uri) {
            return status_response(StatusCode::NOT_FOUND, "not found");
        }

        match req.method() {
            &Method::POST => self.handle_post(req).await,
            &Method::GET => self.handle_get(req).await,
            &Method::DELETE => self.handle_delete(req).await,
            &Method::OPTIONS => self.options.cors.preflight(
                req.headers()
                    .get("origin")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .as_deref(),
            ),
            _ => status_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        }
    }

    async fn handle_post<B>(&self, req: Request<B>) -> Response<BoxedBody>
    where
        B: http_body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        match self.locate_session(&req) {
            Some(session_id) => match self.store.get(&session_id).await {
                Some(session) => self.handle_message(req, session, None).await,
                None => status_response(
                    StatusCode::NOT_FOUND,
                    format!("session '{session_id}' not found"),
                ),
            },
            None => self.handshake(req).await,
        }
    }

    /// Handshake: mint a session, return its id in the configured location,
    /// then process the POST body for the new session.
    async fn handshake<B>(&self, req: Request<B>) -> Response<BoxedBody>
    where
        B: http_body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let set_cookie = match &self.auth {
            Some(auth) if auth.rehydrate_on_handshake => auth.rehydrate(&req).await,
            _ => None,
        };

        let session = Session::builder()
            .event_buffer(self.options.lifecycle.max_event_buffer)
            .overflow_policy(self.options.lifecycle.overflow_policy)
            .build();
        self.store.put(Arc::clone(&session)).await;
        debug!(session = %session.id(), "handshake minted session");

        self.handle_message(req, session, set_cookie).await
    }

    async fn handle_message<B>(
        &self,
        req: Request<B>,
        session: Arc<Session>,
        set_cookie: Option<String>,
    ) -> Response<BoxedBody>
    where
        B: http_body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let wants_sse = accepts(req.headers(), SSE_MIME);
        let body = match read_body(req, self.options.max_body_size).await {
            Ok(body) => body,
            Err(response) => return *response,
        };

        let mut extra = HeaderMap::new();
        self.set_session_header(&mut extra, session.id());
        if let Some(cookie) = set_cookie {
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                extra.insert("set-cookie", value);
            }
        }

        if body.is_empty() {
            // bare handshake POST: nothing to dispatch
            return with_headers(Response::new(empty_body()), extra);
        }

        if wants_sse && classify(&body) == MessageKind::Request {
            return self.upgrade_post_to_stream(session, body, extra).await;
        }

        let mut output = Vec::new();
        self.dispatcher
            .handle_message(&session, &body, Some(&mut output))
            .await;

        if output.is_empty() {
            // notification: accepted, no body
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

    /// POST upgrade: attach this connection as the session stream, dispatch
    /// in the background, and let the response (plus any server-initiated
    /// traffic during handling) flow as SSE frames.
    async fn upgrade_post_to_stream(
        &self,
        session: Arc<Session>,
        body: Bytes,
        extra: HeaderMap,
    ) -> Response<BoxedBody> {
        let (writer, handle, stream_body) = streaming_channel();
        let generation = session.mark_active_with_writer(Box::new(writer)).await;
        session.set_framer(Framer::Sse).await;
        session.set_sse(true).await;
        session
            .set_event_buffer(self.options.lifecycle.max_event_buffer)
            .await;

        self.watch_disconnect(Arc::clone(&session), handle, generation);

        let dispatcher = Arc::clone(&self.dispatcher);
        let task_session = Arc::clone(&session);
        tokio::spawn(async move {
            dispatcher.handle_message(&task_session, &body, None).await;
            // this turn is over; closing the stream hands the session back
            // to GET reattachment
            task_session.mark_detached_if_current(generation).await;
        });

        let mut response = Response::new(stream_body);
        sse_headers(response.headers_mut());
        with_headers(response, extra)
    }

    async fn handle_get<B>(&self, req: Request<B>) -> Response<BoxedBody> {
        if !accepts(req.headers(), SSE_MIME) {
            return status_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "SSE not supported on this endpoint",
            );
        }
        let Some(session_id) = self.locate_session(&req) else {
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
        session.set_framer(Framer::Sse).await;
        session.set_sse(true).await;
        session
            .set_event_buffer(self.options.lifecycle.max_event_buffer)
            .await;

        if let Some(last_id) = last_event_id {
            let replayed = session.replay_after(last_id).await;
            debug!(session = %session_id, last_id, replayed, "replayed buffered events");
        }

        self.spawn_keepalive(Arc::clone(&session), generation);
        self.watch_disconnect(Arc::clone(&session), handle, generation);

        let mut response = Response::new(stream_body);
        sse_headers(response.headers_mut());
        let mut extra = HeaderMap::new();
        self.set_session_header(&mut extra, &session_id);
        with_headers(response, extra)
    }

    async fn handle_delete<B>(&self, req: Request<B>) -> Response<BoxedBody> {
        let Some(session_id) = self.locate_session(&req) else {
            return status_response(
                StatusCode::BAD_REQUEST,
                format!("missing {}", self.options.session_location.name),
            );
        };
        // explicit teardown removes the session under every policy
        if let Some(session) = self.store.remove(&session_id).await {
            session.close().await;
            if let Some(hook) = &self.options.lifecycle.on_session_close {
                hook(&session);
            }
            debug!(session = %session_id, "session deleted");
        }
        status_response(StatusCode::OK, "")
    }

    fn locate_session<B>(&self, req: &Request<B>) -> Option<String> {
        self.options.session_location.locate(req).or_else(|| {
            // query fallback for debugging convenience
            req.uri()
                .query()
                .and_then(|q| self.options.session_location.locate_in_query(q))
        })
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

    /// Once the client context ends, the session detaches (or is removed
    /// outright under [`RemovalPolicy::OnDisconnect`]).
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
            debug!(session = %session.id(), "stream disconnected");
        });
    }
}

pub(crate) fn accepts(headers: &HeaderMap, mime: &str) -> bool {
    headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains(mime))
}

pub(crate) fn sse_headers(headers: &mut HeaderMap) {
    headers.insert("content-type", HeaderValue::from_static(SSE_MIME));
    headers.insert(
        "cache-control",
        HeaderValue::from_static("no-cache, no-transform"),
    );
}

pub(crate) fn status_response(
    status: StatusCode,
    message: impl Into<String>,
) -> Response<BoxedBody> {
    let message = message.into();
    if !message.is_empty() && status.is_client_error() {
        warn!(%status, %message, "request rejected");
    }
    let mut response = Response::new(full_body(message));
    *response.status_mut() = status;
    response
}

pub(crate) fn with_headers(
    mut response: Response<BoxedBody>,
    extra: HeaderMap,
) -> Response<BoxedBody> {
    for (name, value) in extra.iter() {
        response.headers_mut().insert(name, value.clone());
    }
    response
}

/// Reads and bounds the request body. The error side is a ready response.
pub(crate) async fn read_body<B>(
    req: Request<B>,
    max_size: usize,
) -> Result<Bytes, Box<Response<BoxedBody>>>
where
    B: http_body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => {
            return Err(Box::new(status_response(
                StatusCode::BAD_REQUEST,
                "failed to read request body",
            )))
        }
    };
    if body.len() > max_size {
        return Err(Box::new(status_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "request body too large",
        )));
    }
    Ok(body)
}
