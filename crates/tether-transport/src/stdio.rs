//! Line-framed stdio server with a single implicit session.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dispatch::{Dispatcher, Handler};
use crate::framer::Framer;
use crate::session::{IoWriter, Session, SessionWriter};
use crate::TransportError;

/// Well-known key of the stdio transport's implicit session.
pub const STDIO_SESSION_ID: &str = "stdio";

/// A JSON-RPC server reading newline-delimited messages from a reader and
/// writing line-framed replies to a writer (stdout by default).
pub struct StdioServer {
    dispatcher: Arc<Dispatcher>,
    session: Arc<Session>,
    cancel: CancellationToken,
}

impl StdioServer {
    pub fn builder() -> StdioServerBuilder {
        StdioServerBuilder::default()
    }

    /// The implicit session, usable for server-initiated traffic.
    pub fn session(&self) -> Arc<Session> {
        Arc::clone(&self.session)
    }

    /// Cancelling this token makes [`StdioServer::run`] return cleanly.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Reads lines until EOF or cancellation, dispatching each one. EOF
    /// returns cleanly; any other read error terminates with that error.
    pub async fn run<R>(&self, reader: R) -> Result<(), TransportError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        loop {
            line.clear();
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("stdio server cancelled");
                    return Ok(());
                }
                read = reader.read_line(&mut line) => match read {
                    Ok(0) => return Ok(()),
                    Ok(_) => {
                        let payload = line.trim();
                        if payload.is_empty() {
                            continue;
                        }
                        self.dispatcher
                            .handle_message(&self.session, payload.as_bytes(), None)
                            .await;
                    }
                    Err(err) => return Err(err.into()),
                },
            }
        }
    }
}

/// Builder for [`StdioServer`].
#[derive(Default)]
pub struct StdioServerBuilder {
    writer: Option<Box<dyn SessionWriter>>,
    run_timeout: Option<std::time::Duration>,
}

impl StdioServerBuilder {
    /// Replaces the default stdout writer, mainly for tests and pipes.
    pub fn writer(mut self, writer: Box<dyn SessionWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn run_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    pub fn build(self, handler: Arc<dyn Handler>) -> StdioServer {
        let writer = self
            .writer
            .unwrap_or_else(|| Box::new(IoWriter(tokio::io::stdout())));
        let session = Session::builder()
            .id(STDIO_SESSION_ID)
            .writer(writer)
            .framer(Framer::LineJson)
            .build();

        let mut dispatcher = Dispatcher::new(handler);
        if let Some(timeout) = self.run_timeout {
            dispatcher = dispatcher.with_run_timeout(timeout);
        }

        StdioServer {
            dispatcher: Arc::new(dispatcher),
            session,
            cancel: CancellationToken::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Context;
    use crate::session::BufferWriter;
    use async_trait::async_trait;
    use tether_jsonrpc::{Request, Response};

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn serve(&self, _cx: &Context, request: &Request, response: &mut Response) {
            response.set_result(&request.method).unwrap();
        }
    }

    #[tokio::test]
    async fn serves_lines_until_eof() {
        let (writer, buf) = BufferWriter::pair();
        let server = StdioServer::builder()
            .writer(writer)
            .build(Arc::new(EchoHandler));

        let input = concat!(
            r#"{"jsonrpc":"2.0","method":"first","id":1}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"second","id":2}"#,
            "\n",
        );
        server.run(input.as_bytes()).await.unwrap();

        let written = String::from_utf8(buf.lock().clone()).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(r#""result":"first""#));
        assert!(lines[1].contains(r#""result":"second""#));
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let (writer, buf) = BufferWriter::pair();
        let server = StdioServer::builder()
            .writer(writer)
            .build(Arc::new(EchoHandler));

        let input = "\n\n{\"jsonrpc\":\"2.0\",\"method\":\"only\",\"id\":1}\n";
        server.run(input.as_bytes()).await.unwrap();
        assert_eq!(String::from_utf8(buf.lock().clone()).unwrap().lines().count(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let (writer, _buf) = BufferWriter::pair();
        let server = StdioServer::builder()
            .writer(writer)
            .build(Arc::new(EchoHandler));
        let cancel = server.cancellation_token();

        let (_tx, rx) = tokio::io::duplex(64);
        let run = tokio::spawn(async move { server.run(rx).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), run)
            .await
            .expect("run should stop after cancellation")
            .unwrap();
        assert!(result.is_ok());
    }
}
