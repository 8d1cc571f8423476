//! Bidirectional TCP relay with byte accounting
//!
//! Byte counters live outside the copy future so totals are still known
//! when the copy ends with an error.

use pin_project_lite::pin_project;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Result of a bidirectional copy
#[derive(Debug, Clone, Copy)]
pub struct CopyResult {
    /// Bytes transferred from A to B (client to remote)
    pub a_to_b: u64,
    /// Bytes transferred from B to A (remote to client)
    pub b_to_a: u64,
    /// Whether both directions reached EOF without an IO error
    pub completed: bool,
}

pin_project! {
    /// A stream wrapper counting bytes read from it
    struct CountedStream<S> {
        #[pin]
        inner: S,
        read_bytes: Arc<AtomicU64>,
    }
}

impl<S> CountedStream<S> {
    fn new(inner: S, read_bytes: Arc<AtomicU64>) -> Self {
        Self { inner, read_bytes }
    }
}

impl<S: AsyncRead> AsyncRead for CountedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let before_len = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let bytes_read = buf.filled().len() - before_len;
            if bytes_read > 0 {
                this.read_bytes
                    .fetch_add(bytes_read as u64, Ordering::Relaxed);
            }
        }
        result
    }
}

impl<S: AsyncWrite> AsyncWrite for CountedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Copy data in both directions until both sides have closed.
///
/// - `a`: Client stream
/// - `b`: Remote stream
///
/// IO errors end the relay; they are reported through `completed = false`
/// rather than returned, since nothing can be sent back to the client once
/// relaying has started.
pub async fn copy_bidirectional_counted<A, B>(a: A, b: B) -> CopyResult
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let a_to_b = Arc::new(AtomicU64::new(0));
    let b_to_a = Arc::new(AtomicU64::new(0));

    let mut stream_a = CountedStream::new(a, Arc::clone(&a_to_b));
    let mut stream_b = CountedStream::new(b, Arc::clone(&b_to_a));

    let completed = tokio::io::copy_bidirectional(&mut stream_a, &mut stream_b)
        .await
        .is_ok();

    CopyResult {
        a_to_b: a_to_b.load(Ordering::Relaxed),
        b_to_a: b_to_a.load(Ordering::Relaxed),
        completed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_counted_stream_counts_reads() {
        let cursor = Cursor::new(b"hello world".to_vec());
        let read_bytes = Arc::new(AtomicU64::new(0));
        let mut stream = CountedStream::new(cursor, Arc::clone(&read_bytes));

        let mut buf = [0u8; 5];
        let n = stream.read(&mut buf).await.unwrap();

        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(read_bytes.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn test_copy_bidirectional_counts_both_directions() {
        let (client, mut client_peer) = duplex(1024);
        let (remote, mut remote_peer) = duplex(1024);

        let relay = tokio::spawn(copy_bidirectional_counted(client, remote));

        client_peer.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        remote_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        remote_peer.write_all(b"response!").await.unwrap();
        let mut buf = [0u8; 9];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response!");

        drop(client_peer);
        drop(remote_peer);

        let result = relay.await.unwrap();
        assert_eq!(result.a_to_b, 7);
        assert_eq!(result.b_to_a, 9);
    }
}
