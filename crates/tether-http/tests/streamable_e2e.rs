//! End-to-end coverage of the streamable-HTTP transport over real sockets:
//! handshake, synchronous dispatch, SSE upgrade, detach/reattach lifecycle,
//! Last-Event-ID resumption, deletion, and BFF auth rehydration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;

use tether_client::{
    ClientOptions, DefaultClientHandler, SseParser, StreamableClient, StreamableClientOptions,
};
use tether_http::{
    AuthCookie, BffAuth, HttpHandler, SameSite, Server, StreamableHandler, StreamableOptions,
};
use tether_jsonrpc::{Notification, Request, Response};
use tether_transport::auth::{AuthStore, Grant, MemoryAuthStore};
use tether_transport::{
    Context, Handler, LifecycleConfig, RemovalPolicy, SessionState,
};

struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn serve(&self, _cx: &Context, request: &Request, response: &mut Response) {
        match request.method.as_str() {
            "ping" => response.set_result(&"pong").unwrap(),
            other => response.set_error(tether_jsonrpc::ErrorObject::method_not_found(other)),
        }
    }
}

fn fast_lifecycle() -> LifecycleConfig {
    LifecycleConfig {
        reconnect_grace: Duration::from_millis(300),
        cleanup_interval: Duration::from_millis(50),
        max_event_buffer: 16,
        removal_policy: RemovalPolicy::AfterGrace,
        ..LifecycleConfig::default()
    }
}

async fn start_server(handler: StreamableHandler) -> (SocketAddr, Arc<StreamableHandler>) {
    let handler = Arc::new(handler);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(addr, Arc::clone(&handler) as Arc<dyn HttpHandler>);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (addr, handler)
}

fn endpoint(addr: SocketAddr) -> String {
    format!("http://{addr}/")
}

#[tokio::test]
async fn handshake_returns_session_header_and_sync_response() {
    let (addr, _handler) = start_server(StreamableHandler::new(
        Arc::new(PingHandler),
        StreamableOptions::default(),
    ))
    .await;

    let response = reqwest::Client::new()
        .post(endpoint(addr))
        .header("content-type", "application/json")
        .body(r#"{"jsonrpc":"2.0","method":"ping","id":1}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    let session_id = response
        .headers()
        .get("Mcp-Session-Id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .expect("handshake must mint a session id");
    assert!(!session_id.is_empty());

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["result"], "pong");
    assert_eq!(body["id"], 1);
}

#[tokio::test]
async fn notification_is_accepted_with_202() {
    let (addr, _handler) = start_server(StreamableHandler::new(
        Arc::new(PingHandler),
        StreamableOptions::default(),
    ))
    .await;
    let http = reqwest::Client::new();

    let handshake = http.post(endpoint(addr)).send().await.unwrap();
    let sid = handshake.headers()["Mcp-Session-Id"].to_str().unwrap().to_string();

    let response = http
        .post(endpoint(addr))
        .header("Mcp-Session-Id", &sid)
        .header("content-type", "application/json")
        .body(r#"{"jsonrpc":"2.0","method":"note","params":[1]}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 202);
}

#[tokio::test]
async fn client_round_trip_through_handshake() {
    let (addr, _handler) = start_server(StreamableHandler::new(
        Arc::new(PingHandler),
        StreamableOptions::default(),
    ))
    .await;

    let (client, _notifications) = StreamableClient::new(
        &endpoint(addr),
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

    let response = client.send(Request::new(0, "ping")).await.unwrap();
    assert_eq!(response.result_as::<String>().unwrap(), "pong");
    assert!(client.session_id().is_some());

    client.notify(&Notification::new("progress")).await.unwrap();
    client.close();
}

#[tokio::test]
async fn stream_detaches_and_reattaches_within_grace() {
    let (addr, handler) = start_server(StreamableHandler::new(
        Arc::new(PingHandler),
        StreamableOptions {
            lifecycle: fast_lifecycle(),
            ..StreamableOptions::default()
        },
    ))
    .await;
    let http = reqwest::Client::new();

    let handshake = http.post(endpoint(addr)).send().await.unwrap();
    let sid = handshake.headers()["Mcp-Session-Id"].to_str().unwrap().to_string();

    // attach the stream
    let stream = http
        .get(endpoint(addr))
        .header("accept", "text/event-stream")
        .header("Mcp-Session-Id", &sid)
        .send()
        .await
        .unwrap();
    assert_eq!(stream.status().as_u16(), 200);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let session = handler.store().get(&sid).await.unwrap();
    assert_eq!(session.state().await, SessionState::Active);

    // dropping the response closes the TCP stream; the server should notice
    drop(stream);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.state().await, SessionState::Detached);

    // reattach within grace
    let stream2 = http
        .get(endpoint(addr))
        .header("accept", "text/event-stream")
        .header("Mcp-Session-Id", &sid)
        .send()
        .await
        .unwrap();
    assert_eq!(stream2.status().as_u16(), 200);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.state().await, SessionState::Active);

    // disconnect again and let grace plus the sweeper reclaim it
    drop(stream2);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(handler.store().get(&sid).await.is_none());
}

#[tokio::test]
async fn last_event_id_replays_only_newer_events() {
    let (addr, handler) = start_server(StreamableHandler::new(
        Arc::new(PingHandler),
        StreamableOptions {
            lifecycle: fast_lifecycle(),
            ..StreamableOptions::default()
        },
    ))
    .await;
    let http = reqwest::Client::new();

    let handshake = http.post(endpoint(addr)).send().await.unwrap();
    let sid = handshake.headers()["Mcp-Session-Id"].to_str().unwrap().to_string();

    let stream = http
        .get(endpoint(addr))
        .header("accept", "text/event-stream")
        .header("Mcp-Session-Id", &sid)
        .send()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let session = handler.store().get(&sid).await.unwrap();
    for i in 1..=4 {
        session
            .send_notification(&Notification::with_params("tick", &i).unwrap())
            .await
            .unwrap();
    }

    // disconnect after id 4, then emit two more while detached
    drop(stream);
    tokio::time::sleep(Duration::from_millis(100)).await;
    for i in 5..=6 {
        session
            .send_notification(&Notification::with_params("tick", &i).unwrap())
            .await
            .unwrap();
    }

    let mut resumed = http
        .get(endpoint(addr))
        .header("accept", "text/event-stream")
        .header("Mcp-Session-Id", &sid)
        .header("Last-Event-ID", "4")
        .send()
        .await
        .unwrap();

    let mut parser = SseParser::new();
    let mut events = Vec::new();
    while events.len() < 2 {
        let chunk = tokio::time::timeout(Duration::from_secs(2), resumed.chunk())
            .await
            .expect("replay should arrive promptly")
            .unwrap()
            .expect("stream should stay open");
        events.extend(parser.push(&chunk));
    }

    let ids: Vec<&str> = events.iter().filter_map(|e| e.id.as_deref()).collect();
    assert_eq!(ids, vec!["5", "6"]);
    assert!(events[0].data.contains("5"));
    assert!(events[1].data.contains("6"));
}

#[tokio::test]
async fn post_upgrades_to_sse_when_client_accepts_it() {
    let (addr, _handler) = start_server(StreamableHandler::new(
        Arc::new(PingHandler),
        StreamableOptions::default(),
    ))
    .await;
    let http = reqwest::Client::new();

    let handshake = http.post(endpoint(addr)).send().await.unwrap();
    let sid = handshake.headers()["Mcp-Session-Id"].to_str().unwrap().to_string();

    let response = http
        .post(endpoint(addr))
        .header("Mcp-Session-Id", &sid)
        .header("content-type", "application/json")
        .header("accept", "application/json, text/event-stream")
        .body(r#"{"jsonrpc":"2.0","method":"ping","id":9}"#)
        .send()
        .await
        .unwrap();

    assert!(response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("text/event-stream")));

    let raw = response.bytes().await.unwrap();
    let mut parser = SseParser::new();
    let events = parser.push(&raw);
    let message = events
        .iter()
        .find(|e| e.event.as_deref() == Some("message"))
        .expect("response should arrive as an SSE frame");
    assert!(message.data.contains(r#""result":"pong""#));
    assert!(message.data.contains(r#""id":9"#));
}

#[tokio::test]
async fn delete_removes_the_session_unconditionally() {
    let (addr, handler) = start_server(StreamableHandler::new(
        Arc::new(PingHandler),
        StreamableOptions {
            lifecycle: LifecycleConfig {
                removal_policy: RemovalPolicy::Manual,
                ..LifecycleConfig::default()
            },
            ..StreamableOptions::default()
        },
    ))
    .await;
    let http = reqwest::Client::new();

    let handshake = http.post(endpoint(addr)).send().await.unwrap();
    let sid = handshake.headers()["Mcp-Session-Id"].to_str().unwrap().to_string();
    assert!(handler.store().get(&sid).await.is_some());

    let deleted = http
        .delete(endpoint(addr))
        .header("Mcp-Session-Id", &sid)
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status().as_u16(), 200);
    assert!(handler.store().get(&sid).await.is_none());
}

#[tokio::test]
async fn handshake_rehydrates_and_rotates_the_auth_grant() {
    let store = Arc::new(MemoryAuthStore::new(
        Duration::from_secs(3600),
        Duration::from_secs(86400),
        Duration::from_millis(80),
    ));
    let grant = Grant::new("user-123");
    let old_id = grant.id.clone();
    store.put(grant).await.unwrap();

    let auth = BffAuth {
        store: Arc::clone(&store) as Arc<dyn AuthStore>,
        cookie: AuthCookie {
            name: "BFF-Auth-Session".to_string(),
            secure: false,
            same_site: SameSite::Lax,
            ..AuthCookie::default()
        },
        rehydrate_on_handshake: true,
        logout_all_path: None,
    };

    let (addr, _handler) = start_server(
        StreamableHandler::new(Arc::new(PingHandler), StreamableOptions::default())
            .with_auth(auth),
    )
    .await;

    let response = reqwest::Client::new()
        .post(endpoint(addr))
        .header("cookie", format!("BFF-Auth-Session={old_id}"))
        .send()
        .await
        .unwrap();

    assert!(response.headers().get("Mcp-Session-Id").is_some());
    let set_cookie = response
        .headers()
        .get("set-cookie")
        .and_then(|v| v.to_str().ok())
        .expect("rotation must set a fresh cookie");
    let new_id = set_cookie
        .split(';')
        .next()
        .and_then(|kv| kv.split_once('='))
        .map(|(_, v)| v.to_string())
        .unwrap();
    assert_ne!(new_id, old_id);

    // old id survives the rotate grace window, then disappears
    assert!(store.get(&old_id).await.is_ok());
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(store.get(&old_id).await.is_err());
    assert!(store.get(&new_id).await.is_ok());
}
