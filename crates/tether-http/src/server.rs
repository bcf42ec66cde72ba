//! HTTP server runner: accept loop, per-connection tasks, http1 service.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::body::BoxedBody;
use crate::sse::SseHandler;
use crate::streamable::StreamableHandler;
use crate::streaming::StreamingHandler;

/// A mounted HTTP request handler.
#[async_trait]
pub trait HttpHandler: Send + Sync + 'static {
    async fn handle(&self, req: Request<Incoming>) -> Response<BoxedBody>;
}

#[async_trait]
impl HttpHandler for StreamableHandler {
    async fn handle(&self, req: Request<Incoming>) -> Response<BoxedBody> {
        StreamableHandler::handle(self, req).await
    }
}

#[async_trait]
impl HttpHandler for SseHandler {
    async fn handle(&self, req: Request<Incoming>) -> Response<BoxedBody> {
        SseHandler::handle(self, req).await
    }
}

#[async_trait]
impl HttpHandler for StreamingHandler {
    async fn handle(&self, req: Request<Incoming>) -> Response<BoxedBody> {
        StreamingHandler::handle(self, req).await
    }
}

/// Minimal HTTP/1.1 server around a handler. Each connection runs on its own
/// task; long-lived streaming responses outlive the handler call.
pub struct Server {
    addr: SocketAddr,
    handler: Arc<dyn HttpHandler>,
}

impl Server {
    pub fn new(addr: SocketAddr, handler: Arc<dyn HttpHandler>) -> Self {
        Self { addr, handler }
    }

    /// Binds and serves until the task is cancelled.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "http server listening");
        self.serve(listener).await
    }

    /// Serves connections from an already-bound listener (lets tests bind
    /// port 0 and read the local address first).
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "connection accepted");

            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let handler = Arc::clone(&handler);
                    async move {
                        Ok::<_, std::convert::Infallible>(handler.handle(req).await)
                    }
                });
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    let text = err.to_string();
                    // disconnects mid-stream are routine for SSE clients
                    if text.contains("connection closed") || text.contains("broken pipe") {
                        debug!(error = %text, "client disconnected");
                    } else {
                        error!(error = %text, "connection error");
                    }
                }
            });
        }
    }
}
