//! The base dispatcher: classifies an inbound payload and routes it to the
//! user handler or to a pending round trip.
//!
//! The dispatcher never mutates the session state machine; attach, detach and
//! removal belong to the transports.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, warn};

use tether_jsonrpc::{classify, Error, ErrorObject, MessageKind, Notification, Request, Response};

use crate::session::Session;
use crate::transport::ServerTransport;
use crate::DEFAULT_RUN_TIMEOUT;

/// Invocation context handed to user handlers.
#[derive(Clone)]
pub struct Context {
    session: Arc<Session>,
    run_timeout: Duration,
}

impl Context {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    /// A handle for server-initiated traffic on this session: requests with
    /// round-trip correlation and notifications.
    pub fn transport(&self) -> ServerTransport {
        ServerTransport::new(Arc::clone(&self.session), self.run_timeout)
    }
}

/// User-supplied RPC handler. `serve` fills in the prepared response;
/// business failures go into the response's error field, not into panics.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve(&self, cx: &Context, request: &Request, response: &mut Response);

    async fn on_notification(&self, cx: &Context, notification: Notification) {
        let _ = (cx, notification);
    }
}

/// Routes classified messages on behalf of a transport.
pub struct Dispatcher {
    handler: Arc<dyn Handler>,
    run_timeout: Duration,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self {
            handler,
            run_timeout: DEFAULT_RUN_TIMEOUT,
        }
    }

    /// Overrides the run timeout propagated to [`ServerTransport`] handles.
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    /// Classifies and processes one payload for `session`.
    ///
    /// When `output` is supplied (the synchronous HTTP path), the serialised
    /// response for a request lands there instead of going through the
    /// session writer; notifications leave it empty.
    pub async fn handle_message(
        &self,
        session: &Arc<Session>,
        data: &[u8],
        output: Option<&mut Vec<u8>>,
    ) {
        match classify(data) {
            MessageKind::Request => self.handle_request(session, data, output).await,
            MessageKind::Response => self.handle_response(session, data).await,
            MessageKind::Error => self.handle_error(session, data).await,
            MessageKind::Notification => self.handle_notification(session, data).await,
        }
    }

    async fn handle_request(
        &self,
        session: &Arc<Session>,
        data: &[u8],
        output: Option<&mut Vec<u8>>,
    ) {
        let request = match Request::from_slice(data) {
            Ok(request) => request,
            Err(err) => {
                let parse_error = Error::parse_error(None, format!("failed to parse: {err}"));
                if let Err(send_err) = session.send_error(&parse_error).await {
                    error!(session = %session.id(), error = %send_err, "failed to send parse error");
                }
                return;
            }
        };

        session.seed_request_id(&request.id);

        let mut response = Response::new(request.id.clone());
        let cx = Context {
            session: Arc::clone(session),
            run_timeout: self.run_timeout,
        };

        let served = AssertUnwindSafe(self.handler.serve(&cx, &request, &mut response))
            .catch_unwind()
            .await;
        if served.is_err() {
            error!(session = %session.id(), method = %request.method, "handler panicked");
            response.set_error(ErrorObject::internal("internal error", None));
        }

        match output {
            Some(buffer) => match serde_json::to_vec(&response) {
                Ok(bytes) => buffer.extend_from_slice(&bytes),
                Err(err) => error!(session = %session.id(), error = %err, "failed to encode response"),
            },
            None => {
                if let Err(err) = session.send_response(&response).await {
                    error!(session = %session.id(), error = %err, "failed to send response");
                }
            }
        }
    }

    async fn handle_response(&self, session: &Arc<Session>, data: &[u8]) {
        let response = match Response::from_slice(data) {
            Ok(response) => response,
            Err(err) => {
                warn!(session = %session.id(), error = %err, "failed to parse response");
                return;
            }
        };
        self.complete_trip(session, response);
    }

    async fn handle_error(&self, session: &Arc<Session>, data: &[u8]) {
        let envelope = match Error::from_slice(data) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(session = %session.id(), error = %err, "failed to parse error envelope");
                return;
            }
        };
        match envelope.into_response() {
            Some(response) => self.complete_trip(session, response),
            None => debug!(session = %session.id(), "error envelope without id, nothing to complete"),
        }
    }

    fn complete_trip(&self, session: &Arc<Session>, response: Response) {
        match session.trips().match_id(&response.id) {
            Ok(completion) => completion.respond(response),
            Err(err) => {
                // not fatal: the waiter may have timed out and released its slot
                warn!(session = %session.id(), id = %response.id, error = %err, "unmatched response");
            }
        }
    }

    async fn handle_notification(&self, session: &Arc<Session>, data: &[u8]) {
        let notification = match Notification::from_slice(data) {
            Ok(notification) => notification,
            Err(err) => {
                warn!(session = %session.id(), error = %err, "failed to parse notification");
                return;
            }
        };
        let cx = Context {
            session: Arc::clone(session),
            run_timeout: self.run_timeout,
        };
        let served = AssertUnwindSafe(self.handler.on_notification(&cx, notification))
            .catch_unwind()
            .await;
        if served.is_err() {
            error!(session = %session.id(), "notification handler panicked");
        }
    }
}
