//! Client core shared by every transport profile: round-trip correlation,
//! inbound message handling, and the listener/interceptor hooks.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use tether_jsonrpc::{
    classify, Error, ErrorObject, Message, MessageKind, Notification, Request, Response,
};
use tether_transport::{NotificationQueue, RoundTrips, TripError};

use crate::error::ClientError;

/// Default run timeout for outbound client requests.
pub const DEFAULT_CLIENT_RUN_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Capacity of the client round-trip ring.
const CLIENT_TRIP_CAPACITY: usize = 100;

/// Handles server-initiated traffic arriving on the stream.
#[async_trait]
pub trait ClientHandler: Send + Sync {
    async fn serve(&self, request: &Request, response: &mut Response);

    async fn on_notification(&self, notification: &Notification) {
        let _ = notification;
    }
}

/// Default handler: answers every server-initiated request with method not
/// found and ignores notifications.
pub struct DefaultClientHandler;

#[async_trait]
impl ClientHandler for DefaultClientHandler {
    async fn serve(&self, request: &Request, response: &mut Response) {
        response.set_error(ErrorObject::method_not_found(&request.method));
    }
}

/// Observes every message crossing the transport, inbound and outbound.
pub type Listener = Arc<dyn Fn(&Message) + Send + Sync>;

/// Post-response hook. Returning a request sends it as a follow-up whose
/// outcome replaces the original response.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(
        &self,
        request: &Request,
        response: &Response,
    ) -> Result<Option<Request>, ClientError>;
}

/// The raw byte-send seam each transport implements.
#[async_trait]
pub trait SendData: Send + Sync {
    async fn send_data(&self, data: &[u8]) -> Result<(), ClientError>;
}

/// Tuning knobs shared by all client profiles.
#[derive(Clone)]
pub struct ClientOptions {
    pub run_timeout: Duration,
    /// Bound of the notification side-channel; overflow drops and reports.
    pub notification_capacity: usize,
    pub listener: Option<Listener>,
    pub interceptor: Option<Arc<dyn Interceptor>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            run_timeout: DEFAULT_CLIENT_RUN_TIMEOUT,
            notification_capacity: 64,
            listener: None,
            interceptor: None,
        }
    }
}

/// Transport-independent client machinery.
pub struct ClientCore {
    trips: RoundTrips,
    counter: AtomicU64,
    run_timeout: Duration,
    handler: Arc<dyn ClientHandler>,
    listener: Option<Listener>,
    interceptor: Option<Arc<dyn Interceptor>>,
    notifications: NotificationQueue,
    sender: OnceLock<Arc<dyn SendData>>,
    error: parking_lot::Mutex<Option<String>>,
}

impl ClientCore {
    /// Builds the core and the notification receiver handed to consumers.
    pub fn new(
        handler: Arc<dyn ClientHandler>,
        options: ClientOptions,
    ) -> (Arc<Self>, mpsc::Receiver<Notification>) {
        let (queue, receiver) = NotificationQueue::bounded(options.notification_capacity);
        (
            Arc::new(Self {
                trips: RoundTrips::new(CLIENT_TRIP_CAPACITY),
                counter: AtomicU64::new(0),
                run_timeout: options.run_timeout,
                handler,
                listener: options.listener,
                interceptor: options.interceptor,
                notifications: queue,
                sender: OnceLock::new(),
                error: parking_lot::Mutex::new(None),
            }),
            receiver,
        )
    }

    /// Wires the transport seam. Called once during client construction.
    pub fn set_sender(&self, sender: Arc<dyn SendData>) {
        let _ = self.sender.set(sender);
    }

    fn sender(&self) -> Result<&Arc<dyn SendData>, ClientError> {
        self.sender
            .get()
            .ok_or_else(|| ClientError::Transport("transport not initialised".to_string()))
    }

    /// Latches a fatal error: subsequent sends fail fast and pending trips
    /// are woken with the failure.
    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        *self.error.lock() = Some(message.clone());
        self.trips.close_with_error(message);
    }

    pub fn latched_error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    fn emit(&self, message: &Message) {
        if let Some(listener) = &self.listener {
            listener(message);
        }
    }

    /// Sends a request and waits for the correlated response. Ids come from
    /// the client-wide monotonic counter.
    pub async fn send(self: &Arc<Self>, mut request: Request) -> Result<Response, ClientError> {
        if let Some(err) = self.latched_error() {
            return Err(ClientError::Closed(err));
        }
        request.id = tether_jsonrpc::RequestId::Number(
            (self.counter.fetch_add(1, Ordering::SeqCst) + 1) as i64,
        );
        let id = request.id.clone();

        let trip = self.trips.add(request.clone())?;
        self.emit(&Message::Request(request.clone()));

        if let Err(err) = self.write_envelope(&Message::Request(request)).await {
            let _ = self.trips.match_id(&id);
            return Err(err);
        }

        match trip.wait(self.run_timeout).await {
            Ok(response) => Ok(response),
            Err(err) => {
                if matches!(err, TripError::TimedOut(_) | TripError::Cancelled) {
                    let _ = self.trips.match_id(&id);
                }
                Err(err.into())
            }
        }
    }

    /// Sends a notification; no round trip is recorded.
    pub async fn notify(self: &Arc<Self>, notification: &Notification) -> Result<(), ClientError> {
        if let Some(err) = self.latched_error() {
            return Err(ClientError::Closed(err));
        }
        self.write_envelope(&Message::Notification(notification.clone()))
            .await
    }

    async fn write_envelope(&self, message: &Message) -> Result<(), ClientError> {
        let mut data = message.to_vec()?;
        if !data.ends_with(b"\n") {
            data.push(b'\n');
        }
        self.sender()?.send_data(&data).await
    }

    /// Feeds one inbound payload through classification: responses complete
    /// trips, requests are served, notifications fan out.
    pub async fn handle_message(self: &Arc<Self>, data: &[u8]) {
        match classify(data) {
            MessageKind::Response => self.handle_response(data).await,
            MessageKind::Error => self.handle_error(data).await,
            MessageKind::Request => self.handle_request(data).await,
            MessageKind::Notification => self.handle_notification(data).await,
        }
    }

    async fn handle_response(self: &Arc<Self>, data: &[u8]) {
        let response = match Response::from_slice(data) {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "failed to parse response");
                return;
            }
        };
        self.emit(&Message::Response(response.clone()));
        self.complete(response).await;
    }

    async fn handle_error(self: &Arc<Self>, data: &[u8]) {
        let envelope = match Error::from_slice(data) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "failed to parse error envelope");
                return;
            }
        };
        self.emit(&Message::Error(envelope.clone()));
        match envelope.into_response() {
            Some(response) => self.complete(response).await,
            None => debug!("error envelope without id"),
        }
    }

    async fn complete(self: &Arc<Self>, mut response: Response) {
        let completion = match self.trips.match_id(&response.id) {
            Ok(completion) => completion,
            Err(err) => {
                warn!(id = %response.id, error = %err, "unmatched response");
                return;
            }
        };

        let Some(interceptor) = self.interceptor.clone() else {
            completion.respond(response);
            return;
        };

        // run the interceptor off the read loop so a follow-up round trip
        // cannot deadlock against its own response arriving on this stream
        let core = Arc::clone(self);
        tokio::spawn(async move {
            match interceptor.intercept(completion.request(), &response).await {
                Ok(Some(follow_up)) => {
                    // the follow-up's outcome supersedes the original payload
                    match core.send(follow_up).await {
                        Ok(follow_response) => {
                            response.result = follow_response.result;
                            response.error = follow_response.error;
                        }
                        Err(err) => warn!(error = %err, "follow-up request failed"),
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "interceptor failed"),
            }
            completion.respond(response);
        });
    }

    async fn handle_request(self: &Arc<Self>, data: &[u8]) {
        let request = match Request::from_slice(data) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "failed to parse server-initiated request");
                return;
            }
        };
        self.emit(&Message::Request(request.clone()));

        let mut response = Response::new(request.id.clone());
        let served = AssertUnwindSafe(self.handler.serve(&request, &mut response))
            .catch_unwind()
            .await;
        if served.is_err() {
            error!(method = %request.method, "client handler panicked");
            response.set_error(ErrorObject::internal("internal error", None));
        }

        self.emit(&Message::Response(response.clone()));
        if let Err(err) = self.write_envelope(&Message::Response(response)).await {
            warn!(error = %err, "failed to send response to server-initiated request");
        }
    }

    async fn handle_notification(self: &Arc<Self>, data: &[u8]) {
        let notification = match Notification::from_slice(data) {
            Ok(notification) => notification,
            Err(err) => {
                warn!(error = %err, "failed to parse notification");
                return;
            }
        };
        self.emit(&Message::Notification(notification.clone()));
        self.notifications.publish(notification.clone());

        let served = AssertUnwindSafe(self.handler.on_notification(&notification))
            .catch_unwind()
            .await;
        if served.is_err() {
            error!(method = %notification.method, "notification handler panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Captures outbound frames; the test plays the server.
    struct CaptureSender(Arc<Mutex<Vec<Vec<u8>>>>);

    #[async_trait]
    impl SendData for CaptureSender {
        async fn send_data(&self, data: &[u8]) -> Result<(), ClientError> {
            self.0.lock().push(data.to_vec());
            Ok(())
        }
    }

    fn core_with_capture(
        options: ClientOptions,
    ) -> (Arc<ClientCore>, mpsc::Receiver<Notification>, Arc<Mutex<Vec<Vec<u8>>>>) {
        let (core, notifications) = ClientCore::new(Arc::new(DefaultClientHandler), options);
        let outbound = Arc::new(Mutex::new(Vec::new()));
        core.set_sender(Arc::new(CaptureSender(Arc::clone(&outbound))));
        (core, notifications, outbound)
    }

    #[tokio::test]
    async fn send_correlates_by_id() {
        let (core, _notifications, outbound) = core_with_capture(ClientOptions::default());

        let sender = Arc::clone(&core);
        let send_task = tokio::spawn(async move { sender.send(Request::new(0, "ping")).await });

        // wait for the outbound frame, then answer it
        loop {
            if !outbound.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let sent = outbound.lock()[0].clone();
        let request = Request::from_slice(&sent).unwrap();
        assert_eq!(request.id, tether_jsonrpc::RequestId::Number(1));

        core.handle_message(br#"{"jsonrpc":"2.0","id":1,"result":"pong"}"#)
            .await;
        let response = send_task.await.unwrap().unwrap();
        assert_eq!(response.result_as::<String>().unwrap(), "pong");
    }

    #[tokio::test]
    async fn server_initiated_request_is_answered() {
        let (core, _notifications, outbound) = core_with_capture(ClientOptions::default());
        core.handle_message(br#"{"jsonrpc":"2.0","id":7,"method":"roots/list"}"#)
            .await;

        let frames = outbound.lock();
        assert_eq!(frames.len(), 1);
        let response = Response::from_slice(frames[0].trim_ascii_end()).unwrap();
        assert_eq!(response.id, tether_jsonrpc::RequestId::Number(7));
        assert_eq!(response.error.as_ref().map(|e| e.code), Some(-32601));
    }

    #[tokio::test]
    async fn notifications_reach_the_side_channel() {
        let (core, mut notifications, _outbound) = core_with_capture(ClientOptions::default());
        core.handle_message(br#"{"jsonrpc":"2.0","method":"progress","params":{"pct":50}}"#)
            .await;
        let n = notifications.recv().await.unwrap();
        assert_eq!(n.method, "progress");
    }

    #[tokio::test]
    async fn latched_error_fails_fast() {
        let (core, _notifications, _outbound) = core_with_capture(ClientOptions::default());
        core.set_error("stream gone");
        let err = core.send(Request::new(0, "ping")).await.unwrap_err();
        assert!(matches!(err, ClientError::Closed(_)));
    }

    #[tokio::test]
    async fn interceptor_can_issue_follow_up() {
        struct Refresh;

        #[async_trait]
        impl Interceptor for Refresh {
            async fn intercept(
                &self,
                _request: &Request,
                response: &Response,
            ) -> Result<Option<Request>, ClientError> {
                if response.error.as_ref().map(|e| e.code) == Some(-32001) {
                    Ok(Some(Request::new(0, "session/refresh")))
                } else {
                    Ok(None)
                }
            }
        }

        let (core, _notifications, outbound) = core_with_capture(ClientOptions {
            interceptor: Some(Arc::new(Refresh)),
            ..ClientOptions::default()
        });

        let sender = Arc::clone(&core);
        let send_task = tokio::spawn(async move { sender.send(Request::new(0, "work")).await });
        loop {
            if !outbound.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        // reject the first request; the interceptor fires a follow-up (id 2)
        core.handle_message(
            br#"{"jsonrpc":"2.0","id":1,"error":{"code":-32001,"message":"expired"}}"#,
        )
        .await;
        loop {
            if outbound.lock().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        core.handle_message(br#"{"jsonrpc":"2.0","id":2,"result":"refreshed"}"#)
            .await;

        let response = send_task.await.unwrap().unwrap();
        assert_eq!(response.result_as::<String>().unwrap(), "refreshed");
    }
}
