// ── Reactive entity streams ──
//
// Subscription types for consuming entity changes from the EntityStore.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

/// A subscription to the whole entity collection.
///
/// Provides both point-in-time snapshot access and reactive change
/// notification via the `changed()` method or by converting to a `Stream`.
pub struct EntityStream<T: Send + Sync + 'static> {
    current: Arc<Vec<Arc<T>>>,
    receiver: watch::Receiver<Arc<Vec<Arc<T>>>>,
}

impl<T: Send + Sync + 'static> EntityStream<T> {
    pub(crate) fn new(receiver: watch::Receiver<Arc<Vec<Arc<T>>>>) -> Self {
        let current = receiver.borrow().clone();
        Self { current, receiver }
    }

    /// Get the snapshot captured at creation time.
    pub fn current(&self) -> &Arc<Vec<Arc<T>>> {
        &self.current
    }

    /// Get the latest snapshot (may have changed since creation).
    pub fn latest(&self) -> Arc<Vec<Arc<T>>> {
        self.receiver.borrow().clone()
    }

    /// Wait for the next change, returning the new snapshot.
    /// Returns `None` if the store has been dropped.
    pub async fn changed(&mut self) -> Option<Arc<Vec<Arc<T>>>> {
        self.receiver.changed().await.ok()?;
        let snap = self.receiver.borrow_and_update().clone();
        self.current = snap.clone();
        Some(snap)
    }

    /// Convert into a `Stream` for use with `StreamExt` combinators.
    pub fn into_stream(self) -> EntityWatchStream<T> {
        EntityWatchStream {
            inner: WatchStream::new(self.receiver),
        }
    }
}

/// `Stream` adapter backed by a `watch::Receiver`.
///
/// Yields a new snapshot each time the collection is mutated.
pub struct EntityWatchStream<T: Send + Sync + 'static> {
    inner: WatchStream<Arc<Vec<Arc<T>>>>,
}

impl<T: Send + Sync + 'static> Stream for EntityWatchStream<T> {
    type Item = Arc<Vec<Arc<T>>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

// ── Single-entity subscription ──────────────────────────────────────

/// State changes of one entity.
///
/// The first item is the state at subscription time. The stream ends
/// when the entity is removed (device deleted, parameter gone after a
/// reload) or the central shuts down.
pub struct EntitySubscription<T: Send + Sync + 'static> {
    inner: WatchStream<Option<Arc<T>>>,
    done: bool,
}

impl<T: Send + Sync + 'static> EntitySubscription<T> {
    pub(crate) fn new(receiver: watch::Receiver<Option<Arc<T>>>) -> Self {
        Self {
            inner: WatchStream::new(receiver),
            done: false,
        }
    }

    /// Next state, or `None` once the entity is gone.
    pub async fn next(&mut self) -> Option<Arc<T>> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }
}

impl<T: Send + Sync + 'static> Stream for EntitySubscription<T> {
    type Item = Arc<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Some(entity))) => Poll::Ready(Some(entity)),
            Poll::Ready(Some(None) | None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscription_yields_updates_then_ends() {
        let (tx, rx) = watch::channel(Some(Arc::new(1u32)));
        let mut sub = EntitySubscription::new(rx);

        assert_eq!(*sub.next().await.unwrap(), 1);
        tx.send_replace(Some(Arc::new(2)));
        assert_eq!(*sub.next().await.unwrap(), 2);
        tx.send_replace(None);
        assert!(sub.next().await.is_none());
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn entity_stream_tracks_latest() {
        let (tx, rx) = watch::channel(Arc::new(vec![Arc::new("a")]));
        let mut stream = EntityStream::new(rx);
        assert_eq!(stream.current().len(), 1);

        tx.send_replace(Arc::new(vec![Arc::new("a"), Arc::new("b")]));
        let snap = stream.changed().await.unwrap();
        assert_eq!(snap.len(), 2);
        assert_eq!(stream.latest().len(), 2);
    }
}
