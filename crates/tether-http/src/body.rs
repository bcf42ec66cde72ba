//! Response body plumbing: boxed bodies for uniform handler signatures and
//! the channel-backed streaming body behind long-lived SSE/NDJSON responses.

use async_trait::async_trait;
use bytes::Bytes;
use http_body::Frame;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use tether_transport::SessionWriter;

/// Uniform response body type for every handler in this crate.
pub type BoxedBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// A complete in-memory body.
pub fn full_body(data: impl Into<Bytes>) -> BoxedBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty_body() -> BoxedBody {
    full_body(Bytes::new())
}

/// Session writer pushing each frame into the response channel. Every write
/// reaches the client immediately; hyper flushes chunk by chunk.
pub struct ChannelWriter {
    tx: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl SessionWriter for ChannelWriter {
    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.tx.send(Bytes::copy_from_slice(data)).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stream client disconnected")
        })
    }
}

/// Observer half of a streaming body, used to notice client disconnects.
#[derive(Clone)]
pub struct StreamHandle {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl StreamHandle {
    /// Resolves once the response body has been dropped, i.e. the client
    /// context ended.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }
}

/// Creates the writer, the disconnect handle and the response body of a
/// long-lived stream. Dropping the body (client gone) fails subsequent writes
/// with a broken pipe.
pub fn streaming_channel() -> (ChannelWriter, StreamHandle, BoxedBody) {
    let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
    let stream = UnboundedReceiverStream::new(rx).map(|bytes| Ok(Frame::data(bytes)));
    let body = StreamBody::new(stream).boxed_unsync();
    (
        ChannelWriter { tx: tx.clone() },
        StreamHandle { tx },
        body,
    )
}
