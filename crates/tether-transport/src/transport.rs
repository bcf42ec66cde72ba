//! Server-initiated traffic on a session: requests correlated through the
//! round-trip ring, and fire-and-forget notifications.

use std::sync::Arc;
use std::time::Duration;

use tether_jsonrpc::{Notification, Request, Response};

use crate::session::Session;
use crate::trips::TripError;
use crate::TransportError;

/// A send handle bound to one session. Ids are allocated from the session's
/// monotonic sequence, so they are unique per stream by construction.
#[derive(Clone)]
pub struct ServerTransport {
    session: Arc<Session>,
    run_timeout: Duration,
}

impl ServerTransport {
    pub fn new(session: Arc<Session>, run_timeout: Duration) -> Self {
        Self {
            session,
            run_timeout,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Sends a request to the peer and waits for the matched response,
    /// the run timeout, or cancellation. The id on `request` is replaced by
    /// the next session sequence value.
    pub async fn send(&self, mut request: Request) -> Result<Response, TransportError> {
        request.id = self.session.next_request_id();
        let id = request.id.clone();

        let trip = self.session.trips().add(request.clone())?;
        let data = serde_json::to_vec(&request).map_err(tether_jsonrpc::CodecError::from)?;
        self.session.send_data(&data).await;

        match trip.wait(self.run_timeout).await {
            Ok(response) => Ok(response),
            Err(err) => {
                if matches!(err, TripError::TimedOut(_) | TripError::Cancelled) {
                    // release the abandoned slot; a late completion is discarded
                    let _ = self.session.trips().match_id(&id);
                }
                Err(err.into())
            }
        }
    }

    /// Sends a notification. Surfaces the session's latched write error so a
    /// broken stream is visible to the caller.
    pub async fn notify(&self, notification: &Notification) -> Result<(), TransportError> {
        self.session
            .send_notification(notification)
            .await
            .map_err(TransportError::from)?;
        match self.session.latched_error().await {
            Some(err) => Err(TransportError::Write(err)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::BufferWriter;
    use tether_jsonrpc::RequestId;

    #[tokio::test]
    async fn send_assigns_sequential_ids_and_waits() {
        let (writer, buf) = BufferWriter::pair();
        let session = Session::builder().writer(writer).build();
        let transport = ServerTransport::new(Arc::clone(&session), Duration::from_secs(1));

        let session_for_reply = Arc::clone(&session);
        let reply = tokio::spawn(async move {
            // poll until the request shows up in the ring, then answer it
            loop {
                if let Ok(completion) = session_for_reply.trips().match_id(&RequestId::Number(1)) {
                    completion
                        .respond(Response::with_result(RequestId::Number(1), &"done").unwrap());
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let response = transport.send(Request::new(999, "work")).await.unwrap();
        assert_eq!(response.result_as::<String>().unwrap(), "done");
        assert!(String::from_utf8_lossy(&buf.lock()).contains(r#""id":1"#));
        reply.await.unwrap();
    }

    #[tokio::test]
    async fn timeout_releases_the_slot() {
        let session = Session::builder().trip_capacity(2).build();
        let transport = ServerTransport::new(Arc::clone(&session), Duration::from_millis(50));

        let err = transport.send(Request::new(0, "never")).await.unwrap_err();
        assert!(matches!(err, TransportError::Trip(TripError::TimedOut(_))));
        assert_eq!(session.trips().pending(), 0);
    }

    #[tokio::test]
    async fn notify_reports_latched_write_error() {
        struct Broken;
        #[async_trait::async_trait]
        impl crate::session::SessionWriter for Broken {
            async fn write(&mut self, _data: &[u8]) -> std::io::Result<()> {
                Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer gone"))
            }
        }

        let session = Session::builder().writer(Box::new(Broken)).build();
        let transport = ServerTransport::new(session, Duration::from_secs(1));
        let err = transport
            .notify(&Notification::new("progress"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Write(_)));
    }
}
