//! Global event feed: every engine event, broadcast to any number of
//! independent subscribers.

use std::pin::Pin;

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use crate::types::TransferEvent;

/// Stream of events read from the global feed.
pub type FeedStream = Pin<Box<dyn Stream<Item = TransferEvent> + Send>>;

/// Feed sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Events buffered per subscriber before the slowest one starts lagging.
    pub capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Broadcast channel for engine events.
///
/// Cloning is cheap; all clones publish into the same channel.
#[derive(Debug, Clone)]
pub struct EventFeed {
    tx: broadcast::Sender<TransferEvent>,
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new(&FeedConfig::default())
    }
}

impl EventFeed {
    pub fn new(config: &FeedConfig) -> Self {
        let (tx, _) = broadcast::channel(config.capacity.max(1));
        Self { tx }
    }

    /// Publishes an event to every live subscriber.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, event: TransferEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Subscribes to all events published from now on.
    ///
    /// A subscriber that falls behind skips the overwritten events and logs
    /// how many it lost.
    pub fn subscribe(&self) -> FeedStream {
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(|item| async move {
            match item {
                Ok(event) => Some(event),
                Err(err) => {
                    warn!("transfer feed subscriber lagged: {err}");
                    None
                }
            }
        });
        Box::pin(stream)
    }

    /// Subscribes to the events matching `filter`.
    pub fn subscribe_filtered<F>(&self, filter: F) -> FeedStream
    where
        F: Fn(&TransferEvent) -> bool + Send + 'static,
    {
        Box::pin(
            self.subscribe()
                .filter(move |event| std::future::ready(filter(event))),
        )
    }
}
