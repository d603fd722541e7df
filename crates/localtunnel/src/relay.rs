//! Byte relay: pumps chunks read from one socket into a channel

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{RelayError, RelayErrorKind, Side};

/// Maximum bytes taken from a socket per read
pub const RELAY_BUFFER_SIZE: usize = 1024;

/// Chunks buffered between a relay and its consumer
const CHUNK_CHANNEL_CAPACITY: usize = 32;

/// A running read task for one socket.
///
/// The task stops after the first read error and is aborted when the relay
/// is dropped, so it never outlives its connection.
pub struct ByteRelay {
    chunks: mpsc::Receiver<Bytes>,
    handle: JoinHandle<()>,
}

impl ByteRelay {
    /// Start reading from `reader`, reporting the first failure on `errors`
    pub fn spawn<R>(
        reader: R,
        side: Side,
        errors: mpsc::Sender<RelayError>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (chunk_tx, chunks) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let handle = tokio::spawn(pump(reader, side, chunk_tx, errors));
        Self { chunks, handle }
    }

    /// Next chunk, or None once the read task has stopped
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.chunks.recv().await
    }

    /// Next chunk already buffered, without waiting.
    ///
    /// Once the relay has reported its error every chunk read before it is
    /// buffered, so this drains the rest of the stream.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.chunks.try_recv().ok()
    }
}

impl Drop for ByteRelay {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn pump<R>(
    mut reader: R,
    side: Side,
    chunks: mpsc::Sender<Bytes>,
    errors: mpsc::Sender<RelayError>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; RELAY_BUFFER_SIZE];

    let kind = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break RelayErrorKind::Eof,
            Ok(n) => {
                if chunks.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    // Consumer is gone, nobody is left to report to
                    return;
                }
            }
            Err(e) => break RelayErrorKind::Read(e),
        }
    };

    tracing::trace!("{} relay stopped: {}", side, kind);
    let _ = errors.send(RelayError::new(side, kind)).await;
}
