//! Reconnect behavior of the streaming clients: the background stream loop
//! must reopen with exponential backoff after failed attaches, reset the
//! backoff after a stream that ended gracefully, and offer `Last-Event-ID`
//! for the largest id it observed.
//!
//! The mock server records every GET attach (timestamp plus `Last-Event-ID`
//! header) and either rejects it or serves a finite SSE body once, so each
//! disconnect/reconnect transition is forced deterministically.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::{Method, Request, Response, StatusCode};
use tokio::net::TcpListener;

use tether_client::{
    ClientOptions, DefaultClientHandler, SseClient, SseClientOptions, StreamableClient,
    StreamableClientOptions,
};
use tether_http::{full_body, BoxedBody, HttpHandler, Server};
use tether_jsonrpc::Request as RpcRequest;
use tether_jsonrpc::Response as RpcResponse;

struct Attach {
    at: Instant,
    last_event_id: Option<String>,
}

/// Answers every POST with a `"pong"` result (plus the session header when
/// configured). GETs are rejected with 503 unless `serve_next` is armed, in
/// which case the canned stream body is served exactly once and the
/// connection ends with it.
struct MockStreamServer {
    session_header: Option<&'static str>,
    stream_body: String,
    serve_next: AtomicBool,
    attaches: Mutex<Vec<Attach>>,
}

impl MockStreamServer {
    fn new(session_header: Option<&'static str>, stream_body: String) -> Self {
        Self {
            session_header,
            stream_body,
            serve_next: AtomicBool::new(false),
            attaches: Mutex::new(Vec::new()),
        }
    }

    fn attach_count(&self) -> usize {
        self.attaches.lock().unwrap().len()
    }

    fn attach_gap(&self, index: usize) -> Duration {
        let attaches = self.attaches.lock().unwrap();
        attaches[index].at.duration_since(attaches[index - 1].at)
    }

    fn resumed_attach_index(&self, last_id: &str) -> Option<usize> {
        self.attaches
            .lock()
            .unwrap()
            .iter()
            .position(|a| a.last_event_id.as_deref() == Some(last_id))
    }
}

#[async_trait]
impl HttpHandler for MockStreamServer {
    async fn handle(&self, req: Request<Incoming>) -> Response<BoxedBody> {
        match req.method() {
            &Method::GET => {
                let last_event_id = req
                    .headers()
                    .get("last-event-id")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                self.attaches.lock().unwrap().push(Attach {
                    at: Instant::now(),
                    last_event_id,
                });

                if self.serve_next.swap(false, Ordering::SeqCst) {
                    let mut response = Response::new(full_body(self.stream_body.clone()));
                    response.headers_mut().insert(
                        "content-type",
                        HeaderValue::from_static("text/event-stream"),
                    );
                    response
                } else {
                    let mut response = Response::new(full_body("unavailable"));
                    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                    response
                }
            }
            &Method::POST => {
                let body = match req.into_body().collect().await {
                    Ok(collected) => collected.to_bytes(),
                    Err(_) => Default::default(),
                };
                let mut response = match RpcRequest::from_slice(&body) {
                    Ok(request) => {
                        let reply = RpcResponse::with_result(request.id, &"pong").unwrap();
                        let mut response =
                            Response::new(full_body(serde_json::to_vec(&reply).unwrap()));
                        response.headers_mut().insert(
                            "content-type",
                            HeaderValue::from_static("application/json"),
                        );
                        response
                    }
                    Err(_) => {
                        let mut response = Response::new(full_body(""));
                        *response.status_mut() = StatusCode::ACCEPTED;
                        response
                    }
                };
                if let Some(name) = self.session_header {
                    response
                        .headers_mut()
                        .insert(name, HeaderValue::from_static("mock-session"));
                }
                response
            }
            _ => {
                let mut response = Response::new(full_body("method not allowed"));
                *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
                response
            }
        }
    }
}

async fn start(mock: MockStreamServer) -> (SocketAddr, Arc<MockStreamServer>) {
    let mock = Arc::new(mock);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(addr, Arc::clone(&mock) as Arc<dyn HttpHandler>);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (addr, mock)
}

fn sse_frame(id: u64) -> String {
    format!(
        "id: {id}\nevent: message\ndata: {{\"jsonrpc\":\"2.0\",\"method\":\"tick\",\"params\":{id}}}\n\n"
    )
}

async fn wait_for(what: &str, timeout: Duration, check: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !check() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn streamable_client_backs_off_and_resumes_with_last_event_id() {
    let frames = format!("{}{}{}", sse_frame(1), sse_frame(2), sse_frame(3));
    let (addr, mock) = start(MockStreamServer::new(Some("Mcp-Session-Id"), frames)).await;

    let (client, _notifications) = StreamableClient::new(
        &format!("http://{addr}/"),
        Arc::new(DefaultClientHandler),
        StreamableClientOptions {
            client: ClientOptions {
                run_timeout: Duration::from_secs(5),
                ..ClientOptions::default()
            },
            ..StreamableClientOptions::default()
        },
    )
    .unwrap();

    // the handshake POST succeeds and starts the background stream
    let response = client.send(RpcRequest::new(0, "ping")).await.unwrap();
    assert_eq!(response.result_as::<String>().unwrap(), "pong");
    assert_eq!(client.session_id().as_deref(), Some("mock-session"));

    // rejected attaches retry with growing backoff
    {
        let mock = Arc::clone(&mock);
        wait_for("three stream attempts", Duration::from_secs(6), move || {
            mock.attach_count() >= 3
        })
        .await;
    }
    let first_gap = mock.attach_gap(1);
    let second_gap = mock.attach_gap(2);
    assert!(
        first_gap >= Duration::from_millis(400),
        "first retry came too eagerly: {first_gap:?}"
    );
    assert!(
        second_gap >= first_gap + Duration::from_millis(250),
        "backoff did not grow: {first_gap:?} then {second_gap:?}"
    );
    assert!(
        mock.attaches
            .lock()
            .unwrap()
            .iter()
            .take(3)
            .all(|a| a.last_event_id.is_none()),
        "no events seen yet, attaches must not offer Last-Event-ID"
    );

    // let the next attach succeed and deliver ids 1..=3, then end the stream
    mock.serve_next.store(true, Ordering::SeqCst);
    {
        let client_ref = &client;
        wait_for("events consumed", Duration::from_secs(10), || {
            client_ref.last_event_id() == 3
        })
        .await;
    }

    // the reconnect after the graceful end resumes strictly after id 3
    {
        let mock = Arc::clone(&mock);
        wait_for("resumed attach", Duration::from_secs(6), move || {
            mock.resumed_attach_index("3").is_some()
        })
        .await;
    }
    let resumed = mock.resumed_attach_index("3").unwrap();
    assert!(resumed >= 1);
    // a gracefully ended stream resets the backoff: the reconnect is prompt
    let reset_gap = mock.attach_gap(resumed);
    assert!(
        reset_gap < Duration::from_millis(450),
        "backoff was not reset after a graceful stream end: {reset_gap:?}"
    );

    client.close();
}

#[tokio::test]
async fn sse_client_backs_off_and_reconnects_with_last_event_id() {
    let stream_body = format!(
        "event: endpoint\ndata: /message?session_id=mock\n\n{}{}",
        sse_frame(1),
        sse_frame(2)
    );
    let (addr, mock) = start(MockStreamServer::new(None, stream_body)).await;

    // the stream opens immediately and keeps retrying against the 503s
    let (client, _notifications) = SseClient::new(
        &format!("http://{addr}/sse"),
        Arc::new(DefaultClientHandler),
        SseClientOptions {
            handshake_timeout: Duration::from_secs(10),
            client: ClientOptions {
                run_timeout: Duration::from_secs(5),
                ..ClientOptions::default()
            },
        },
    )
    .unwrap();

    {
        let mock = Arc::clone(&mock);
        wait_for("three stream attempts", Duration::from_secs(6), move || {
            mock.attach_count() >= 3
        })
        .await;
    }
    let first_gap = mock.attach_gap(1);
    let second_gap = mock.attach_gap(2);
    assert!(
        first_gap >= Duration::from_millis(400),
        "first retry came too eagerly: {first_gap:?}"
    );
    assert!(
        second_gap >= first_gap + Duration::from_millis(250),
        "backoff did not grow: {first_gap:?} then {second_gap:?}"
    );

    // serve one stream: it advertises the endpoint, delivers ids 1..=2 and
    // ends; sends blocked on the handshake proceed once the endpoint arrives
    mock.serve_next.store(true, Ordering::SeqCst);
    let response = client.send(RpcRequest::new(0, "ping")).await.unwrap();
    assert_eq!(response.result_as::<String>().unwrap(), "pong");
    assert!(client
        .message_endpoint()
        .is_some_and(|url| url.path().ends_with("/message")));

    // the reconnect offers the largest observed id
    {
        let mock = Arc::clone(&mock);
        wait_for(
            "reconnect with replay offset",
            Duration::from_secs(6),
            move || mock.resumed_attach_index("2").is_some(),
        )
        .await;
    }

    client.close();
}
