//! Composite sink abstraction.
//!
//! The aggregation store decides whether a composite exists; the bus only
//! carries it to downstream stages. Fan-out is best effort and unordered
//! across publishers, so consumers behind an at-least-once transport should
//! de-duplicate on `CompositeEvent::event_id`.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

/// Receiving end handed out by [`EventBus::subscribe`].
///
/// Not shareable between consumer threads.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait up to `timeout`. `Ok(None)` on timeout, `Err` once the bus is gone.
    pub fn next_within(&self, timeout: Duration) -> Result<Option<M>, RecvTimeoutError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Everything already delivered, without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Publish side of a sink, plus subscription for in-process consumers.
///
/// A failed `publish` is reported to the reducer, which leaves the group
/// COMPLETED without a publication timestamp until it is republished.
pub trait EventBus<M>: Send + Sync {
    type Error: std::fmt::Debug + std::fmt::Display + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        B::publish(self, message)
    }

    fn subscribe(&self) -> Subscription<M> {
        B::subscribe(self)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn next_within_distinguishes_timeout_from_disconnect() {
        let (tx, rx) = mpsc::channel();
        let sub = Subscription::new(rx);

        assert_eq!(sub.next_within(Duration::from_millis(5)).unwrap(), None);
        tx.send(3).unwrap();
        assert_eq!(sub.next_within(Duration::from_millis(5)).unwrap(), Some(3));

        drop(tx);
        assert!(sub.next_within(Duration::from_millis(5)).is_err());
    }
}
