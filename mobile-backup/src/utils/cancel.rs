//! Cooperative cancellation for record streams.

use crate::utils::errors::{BackupError, Result};
use tokio_util::sync::CancellationToken;

/// Wraps a record stream and stops it once the token is cancelled.
///
/// The token is checked before each item is pulled. On cancellation a
/// single `Err(BackupError::Cancelled)` is yielded and the stream ends.
pub struct Cancellable<I> {
    inner: I,
    token: CancellationToken,
    done: bool,
}

impl<I> Cancellable<I> {
    pub fn new(inner: I, token: CancellationToken) -> Self {
        Self {
            inner,
            token,
            done: false,
        }
    }
}

impl<I, T> Iterator for Cancellable<I>
where
    I: Iterator<Item = Result<T>>,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.token.is_cancelled() {
            self.done = true;
            return Some(Err(BackupError::Cancelled));
        }
        let item = self.inner.next();
        if item.is_none() {
            self.done = true;
        }
        item
    }
}
