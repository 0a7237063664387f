//! Connection wrapper applying per-operation deadlines and byte accounting.
//!
//! Every proxied stream passes through [`CountedConn`]: accepted client
//! sockets, the backend side of a TCP pair, and upstream HTTP connections.
//! The wrapper owns the timeout behavior so copy loops and the HTTP client
//! never have to.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Sleep};

/// A stream with an optional per-read/write deadline, atomic byte counters,
/// and an optional active-connection gauge.
///
/// The deadline is re-armed by every successful read and write; a pending
/// operation that outlives it fails with `TimedOut`. The gauge is
/// incremented at construction and decremented exactly once on drop.
pub struct CountedConn<S> {
    inner: S,
    timeout: Option<Duration>,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
    sent: Arc<AtomicU64>,
    rcvd: Arc<AtomicU64>,
    active: Option<Arc<AtomicI64>>,
}

impl<S> CountedConn<S> {
    pub fn new(
        inner: S,
        timeout: Option<Duration>,
        sent: Arc<AtomicU64>,
        rcvd: Arc<AtomicU64>,
        active: Option<Arc<AtomicI64>>,
    ) -> Self {
        if let Some(active) = &active {
            active.fetch_add(1, Ordering::SeqCst);
        }
        Self {
            inner,
            timeout,
            read_deadline: None,
            write_deadline: None,
            sent,
            rcvd,
            active,
        }
    }
}

impl<S> Drop for CountedConn<S> {
    fn drop(&mut self) {
        // take() keeps the gauge balanced at exactly one decrement
        if let Some(active) = self.active.take() {
            active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Poll `deadline` (arming it first if needed); Ready means the operation
/// timed out.
fn poll_deadline(
    deadline: &mut Option<Pin<Box<Sleep>>>,
    timeout: Option<Duration>,
    cx: &mut Context<'_>,
) -> bool {
    let Some(timeout) = timeout else {
        return false;
    };
    let sleep = deadline.get_or_insert_with(|| Box::pin(sleep(timeout)));
    if sleep.as_mut().poll(cx).is_ready() {
        *deadline = None;
        return true;
    }
    false
}

impl<S: AsyncRead + Unpin> AsyncRead for CountedConn<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                this.rcvd.fetch_add(n as u64, Ordering::Relaxed);
                this.read_deadline = None;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.read_deadline = None;
                Poll::Ready(Err(e))
            }
            Poll::Pending => {
                if poll_deadline(&mut this.read_deadline, this.timeout, cx) {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "read timed out",
                    )));
                }
                Poll::Pending
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountedConn<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.sent.fetch_add(n as u64, Ordering::Relaxed);
                this.write_deadline = None;
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => {
                this.write_deadline = None;
                Poll::Ready(Err(e))
            }
            Poll::Pending => {
                if poll_deadline(&mut this.write_deadline, this.timeout, cx) {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "write timed out",
                    )));
                }
                Poll::Pending
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn counters() -> (Arc<AtomicU64>, Arc<AtomicU64>, Arc<AtomicI64>) {
        (
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicI64::new(0)),
        )
    }

    #[tokio::test]
    async fn counts_bytes_each_direction() {
        let (sent, rcvd, active) = counters();
        let (near, mut far) = tokio::io::duplex(64);
        let mut conn = CountedConn::new(
            near,
            None,
            sent.clone(),
            rcvd.clone(),
            Some(active.clone()),
        );

        conn.write_all(b"hello").await.expect("write");
        let mut buf = [0u8; 5];
        far.read_exact(&mut buf).await.expect("far read");
        far.write_all(b"ok").await.expect("far write");
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.expect("read");

        assert_eq!(sent.load(Ordering::Relaxed), 5);
        assert_eq!(rcvd.load(Ordering::Relaxed), 2);
        assert_eq!(active.load(Ordering::SeqCst), 1);

        drop(conn);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn read_past_deadline_times_out() {
        let (sent, rcvd, _) = counters();
        let (near, _far) = tokio::io::duplex(64);
        let mut conn = CountedConn::new(
            near,
            Some(Duration::from_millis(100)),
            sent,
            rcvd,
            None,
        );

        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).await.expect_err("read should time out");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_rearms_after_progress() {
        let (sent, rcvd, _) = counters();
        let (near, mut far) = tokio::io::duplex(64);
        let mut conn = CountedConn::new(
            near,
            Some(Duration::from_millis(100)),
            sent,
            rcvd,
            None,
        );

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            for _ in 0..3 {
                conn.read_exact(&mut buf).await.expect("read");
            }
        });

        // each write lands within the deadline, which then re-arms
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            far.write_all(b"x").await.expect("write");
        }

        reader.await.expect("reader task");
    }
}
