//! Read-idle timeout for inbound WebSocket frames.
//!
//! A socket that stops delivering frames without closing is indistinguishable from a quiet one,
//! so the stream is terminated once nothing arrived for the configured period and the
//! connection is handed to the reconnect policy.

use futures::Stream;
use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::Instant;

/// Default read-idle timeout (2 minutes).
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Stream wrapper that ends the inner stream if no item is yielded within `timeout`.
///
/// After termination, [`TimeoutStream::timed_out`] distinguishes an idle timeout from the
/// inner stream ending by itself.
#[derive(Debug)]
pub struct TimeoutStream<S> {
    inner: S,
    timeout: Duration,
    deadline: Pin<Box<tokio::time::Sleep>>,
    timed_out: bool,
}

impl<S> TimeoutStream<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: Box::pin(tokio::time::sleep(timeout)),
            timed_out: false,
        }
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl<S> Stream for TimeoutStream<S>
where
    S: Stream + Unpin,
{
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.timed_out {
            return Poll::Ready(None);
        }

        let timeout = self.timeout;

        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(item)) => {
                self.deadline.as_mut().reset(Instant::now() + timeout);
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => match self.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    tracing::warn!(
                        timeout_secs = timeout.as_secs(),
                        "no frame received within read timeout, terminating connection"
                    );
                    self.timed_out = true;
                    Poll::Ready(None)
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<S: Unpin> Unpin for TimeoutStream<S> {}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test(start_paused = true)]
    async fn test_idle_stream_times_out() {
        let mut stream = TimeoutStream::new(futures::stream::pending::<u8>(), Duration::from_secs(5));

        assert_eq!(stream.next().await, None);
        assert!(stream.timed_out());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finite_stream_ends_without_timeout() {
        let mut stream = TimeoutStream::new(futures::stream::iter([1, 2]), Duration::from_secs(5));

        assert_eq!(stream.next().await, Some(1));
        assert_eq!(stream.next().await, Some(2));
        assert_eq!(stream.next().await, None);
        assert!(!stream.timed_out());
    }
}
