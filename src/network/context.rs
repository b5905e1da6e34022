//! Per-scan cancellation and deadline handling
//!
//! A [`ScanContext`] travels with one scan invocation. [`ScanContext::run`]
//! bounds a single future, and [`ScanContext::guard`] wraps a byte stream so
//! every read and write on it fails once the scan is over. Everything layered
//! on a guarded stream (TDS framing, TLS) inherits the deadline for free.

use crate::error::{ScanError, ScanResult};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

#[derive(Debug, Clone)]
pub struct ScanContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for ScanContext {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl ScanContext {
    /// A context that expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// A context with no deadline; only explicit cancellation ends it
    pub fn unbounded() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Tie this context to an outer cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || self.remaining() == Some(Duration::ZERO)
    }

    /// Drive `fut` to completion unless the context ends first
    pub async fn run<F: Future>(&self, fut: F) -> ScanResult<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ScanError::Cancelled),
            _ = sleep_until_deadline(self.deadline) => Err(ScanError::Timeout),
            out = fut => Ok(out),
        }
    }

    /// Wrap `stream` so its reads and writes honor this context
    pub fn guard<S>(&self, stream: S) -> ContextStream<S> {
        ContextStream::new(stream, self)
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// A byte stream bound to a [`ScanContext`].
///
/// Once the context is cancelled every operation fails with
/// `ErrorKind::Interrupted`; once its deadline passes, with
/// `ErrorKind::TimedOut`. Shutdown is always let through so the
/// connection can still be closed.
pub struct ContextStream<S> {
    inner: S,
    deadline: Option<Pin<Box<Sleep>>>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    expired: Option<io::ErrorKind>,
}

impl<S> ContextStream<S> {
    pub fn new(inner: S, ctx: &ScanContext) -> Self {
        Self {
            inner,
            deadline: ctx.deadline.map(|d| Box::pin(tokio::time::sleep_until(d))),
            cancelled: Box::pin(ctx.cancel.clone().cancelled_owned()),
            expired: None,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn poll_expired(&mut self, cx: &mut Context<'_>) -> Option<io::Error> {
        if self.expired.is_none() {
            if self.cancelled.as_mut().poll(cx).is_ready() {
                self.expired = Some(io::ErrorKind::Interrupted);
            } else if let Some(sleep) = self.deadline.as_mut() {
                if sleep.as_mut().poll(cx).is_ready() {
                    self.expired = Some(io::ErrorKind::TimedOut);
                }
            }
        }

        self.expired.map(|kind| match kind {
            io::ErrorKind::Interrupted => io::Error::new(kind, "scan cancelled"),
            _ => io::Error::new(kind, "scan deadline exceeded"),
        })
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ContextStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(err) = this.poll_expired(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ContextStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(err) = this.poll_expired(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(err) = this.poll_expired(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_run_times_out() {
        let ctx = ScanContext::with_timeout(Duration::from_millis(20));
        let result = ctx
            .run(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert!(matches!(result, Err(ScanError::Timeout)));
    }

    #[tokio::test]
    async fn test_run_cancelled() {
        let ctx = ScanContext::unbounded();
        ctx.cancel();
        let result = ctx.run(std::future::pending::<()>()).await;
        assert!(matches!(result, Err(ScanError::Cancelled)));
        assert!(ctx.is_done());
    }

    #[tokio::test]
    async fn test_outer_token_cancels_scan() {
        let batch = CancellationToken::new();
        let ctx = ScanContext::with_timeout(Duration::from_secs(5)).with_cancellation(batch.child_token());
        let (client, _server) = tokio::io::duplex(64);
        let mut guarded = ctx.guard(client);

        batch.cancel();
        assert!(ctx.cancel_token().is_cancelled());
        assert!(ctx.is_done());
        let result = ctx.run(std::future::pending::<()>()).await;
        assert!(matches!(result, Err(ScanError::Cancelled)));

        let mut buf = [0u8; 4];
        let err = guarded.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[tokio::test]
    async fn test_run_completes() {
        let ctx = ScanContext::with_timeout(Duration::from_secs(5));
        assert_eq!(ctx.run(async { 7 }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_guarded_read_hits_deadline() {
        let (client, _server) = tokio::io::duplex(64);
        let ctx = ScanContext::with_timeout(Duration::from_millis(30));
        let mut guarded = ctx.guard(client);

        let mut buf = [0u8; 8];
        let err = guarded.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_guarded_stream_passes_data() {
        let (client, mut server) = tokio::io::duplex(64);
        let ctx = ScanContext::with_timeout(Duration::from_secs(5));
        let mut guarded = ctx.guard(client);

        guarded.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_guarded_write_after_cancel() {
        let (client, _server) = tokio::io::duplex(64);
        let ctx = ScanContext::unbounded();
        let mut guarded = ctx.guard(client);
        ctx.cancel();

        let err = guarded.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }
}
