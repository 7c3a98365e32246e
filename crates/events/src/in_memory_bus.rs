//! Process-local composite sink.

use std::sync::{Mutex, mpsc};

use thiserror::Error;

use crate::bus::{EventBus, Subscription};

#[derive(Debug, Error)]
pub enum InMemoryBusError {
    #[error("in-memory bus lock poisoned")]
    Poisoned,
}

#[derive(Debug)]
struct Channels<M> {
    senders: Vec<mpsc::Sender<M>>,
    published: u64,
}

/// Fan-out over std channels. Subscribers that hung up are pruned on the next
/// publish.
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    channels: Mutex<Channels<M>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages accepted by `publish` so far.
    pub fn published_count(&self) -> u64 {
        self.channels.lock().map(|c| c.published).unwrap_or(0)
    }

    /// Live subscriptions as of the last publish.
    pub fn subscriber_count(&self) -> usize {
        self.channels.lock().map(|c| c.senders.len()).unwrap_or(0)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            channels: Mutex::new(Channels {
                senders: Vec::new(),
                published: 0,
            }),
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut channels = self.channels.lock().map_err(|_| InMemoryBusError::Poisoned)?;
        channels.senders.retain(|tx| tx.send(message.clone()).is_ok());
        channels.published += 1;
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();
        // On a poisoned lock the subscription stays silent.
        if let Ok(mut channels) = self.channels.lock() {
            channels.senders.push(tx);
        }
        Subscription::new(rx)
    }
}
