//! Observer registrations and cancellation helpers.
//!
//! Every consumer-facing stream in this crate owns a [`Registration`]: the
//! cancel closure runs exactly once, either when the owner calls
//! [`Registration::cancel`] or when it is dropped. Dropping a stream is
//! therefore the way to unsubscribe from the native source behind it.

use futures::stream::{Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Handle for a registered observer.
pub struct Registration {
    id: u64,
    cancel_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Registration {
    /// Create a registration whose `cancel_fn` runs once on cancel or drop.
    pub(crate) fn new(id: u64, cancel_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            cancel_fn: Some(Box::new(cancel_fn)),
        }
    }

    /// Cancel the registration now.
    pub fn cancel(mut self) {
        if let Some(f) = self.cancel_fn.take() {
            f();
        }
    }

    /// Get the registration id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(f) = self.cancel_fn.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("active", &self.cancel_fn.is_some())
            .finish()
    }
}

/// A stream tied to a [`Registration`]; dropping the stream cancels it.
pub struct Observed<S> {
    inner: S,
    registration: Registration,
}

impl<S> Observed<S> {
    pub(crate) fn new(inner: S, registration: Registration) -> Self {
        Self {
            inner,
            registration,
        }
    }
}

impl<S> std::fmt::Debug for Observed<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observed")
            .field("registration", &self.registration)
            .finish_non_exhaustive()
    }
}

impl<S: Stream + Unpin> Stream for Observed<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// Wait for the first item of `stream`, or for `token` to be cancelled.
///
/// The stream is dropped before returning, which runs its stop side effect.
///
/// # Errors
///
/// [`Error::Cancelled`] if the token fired first, [`Error::StreamClosed`] if
/// the stream ended without an item.
pub async fn first_or_cancelled<S>(mut stream: S, token: &CancellationToken) -> Result<S::Item>
where
    S: Stream + Unpin,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        item = stream.next() => item.ok_or(Error::StreamClosed),
    }
}

/// Wait for the first item of `stream` within `timeout`.
///
/// # Errors
///
/// [`Error::Timeout`] if nothing arrived in time, [`Error::StreamClosed`] if
/// the stream ended without an item.
pub async fn first_within<S>(mut stream: S, timeout: Duration) -> Result<S::Item>
where
    S: Stream + Unpin,
{
    match tokio::time::timeout(timeout, stream.next()).await {
        Ok(Some(item)) => Ok(item),
        Ok(None) => Err(Error::StreamClosed),
        Err(_) => Err(Error::Timeout),
    }
}

/// Run `future` unless `token` is cancelled first.
///
/// # Errors
///
/// [`Error::Cancelled`] if the token fired first, otherwise the future's own
/// result.
pub async fn with_cancellation<F, T>(future: F, token: &CancellationToken) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        result = future => result,
    }
}
