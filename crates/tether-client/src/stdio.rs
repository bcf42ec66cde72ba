//! Line-framed client over caller-supplied reader/writer halves.
//!
//! Spawning and wiring the peer process is the caller's concern; this client
//! only owns the protocol over the two byte streams it is given.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use tether_jsonrpc::{Notification, Request, Response};

use crate::base::{ClientCore, ClientHandler, ClientOptions, SendData};
use crate::error::ClientError;

struct LineSender<W> {
    writer: Mutex<W>,
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> SendData for LineSender<W> {
    async fn send_data(&self, data: &[u8]) -> Result<(), ClientError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// JSON-RPC client over newline-delimited streams.
pub struct StdioClient {
    core: Arc<ClientCore>,
    reader_task: JoinHandle<()>,
}

impl StdioClient {
    /// Builds the client and its notification receiver. The background task
    /// reads lines until EOF, after which all pending and future operations
    /// fail with the latched error.
    pub fn new<R, W>(
        reader: R,
        writer: W,
        handler: Arc<dyn ClientHandler>,
        options: ClientOptions,
    ) -> (Self, mpsc::Receiver<Notification>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (core, notifications) = ClientCore::new(handler, options);
        core.set_sender(Arc::new(LineSender {
            writer: Mutex::new(writer),
        }));

        let reader_core = Arc::clone(&core);
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(reader);
            let mut line = String::new();
            loop {
                line.clear();
                match lines.read_line(&mut line).await {
                    Ok(0) => {
                        debug!("stdio peer closed the stream");
                        reader_core.set_error("stdio stream ended");
                        return;
                    }
                    Ok(_) => {
                        let payload = line.trim();
                        if !payload.is_empty() {
                            reader_core.handle_message(payload.as_bytes()).await;
                        }
                    }
                    Err(err) => {
                        reader_core.set_error(format!("stdio read failed: {err}"));
                        return;
                    }
                }
            }
        });

        (Self { core, reader_task }, notifications)
    }

    pub async fn send(&self, request: Request) -> Result<Response, ClientError> {
        self.core.send(request).await
    }

    pub async fn notify(&self, notification: &Notification) -> Result<(), ClientError> {
        self.core.notify(notification).await
    }

    pub fn close(&self) {
        self.reader_task.abort();
        self.core.set_error("client closed");
    }
}

impl Drop for StdioClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
