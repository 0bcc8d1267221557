use std::sync::atomic::{self, AtomicU64};

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

// back pressure per subscriber, events beyond this are dropped for that subscriber
pub const SUBSCRIBER_BUFFER_COUNT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum LedgerEvent {
    WinningNumber {
        number: i64,
        timestamp: i64,
    },
    TicketPurchased {
        username: String,
        ticket_id: u64,
        numbers: Vec<i64>,
        timestamp: i64,
    },
    TicketCount {
        total: usize,
        timestamp: i64,
    },
    ResultsAnnounced {
        winning_number: i64,
        winners: Vec<String>,
        timestamp: i64,
    },
}

impl LedgerEvent {
    pub fn winning_number(number: i64) -> Self {
        Self::WinningNumber {
            number,
            timestamp: now(),
        }
    }

    pub fn ticket_purchased(username: String, ticket_id: u64, numbers: Vec<i64>) -> Self {
        Self::TicketPurchased {
            username,
            ticket_id,
            numbers,
            timestamp: now(),
        }
    }

    pub fn ticket_count(total: usize) -> Self {
        Self::TicketCount {
            total,
            timestamp: now(),
        }
    }

    pub fn results_announced(winning_number: i64, winners: Vec<String>) -> Self {
        Self::ResultsAnnounced {
            winning_number,
            winners,
            timestamp: now(),
        }
    }
}

fn now() -> i64 {
    Utc::now().timestamp_millis()
}

/// The receiving end of a subscription
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<LedgerEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next event
    ///
    /// returns None once the subscriber was removed from the registry.
    pub async fn recv(&mut self) -> Option<LedgerEvent> {
        self.receiver.recv().await
    }

    /// Takes the next event if one is already queued
    pub fn try_recv(&mut self) -> Option<LedgerEvent> {
        self.receiver.try_recv().ok()
    }
}

/// Registry of viewers interested in ledger events
///
/// delivery is best effort: an event is offered once to every subscriber,
/// a subscriber whose buffer is full misses it, a subscriber that went away is pruned.
#[derive(Debug)]
pub struct Broadcaster {
    subscribers: DashMap<u64, mpsc::Sender<LedgerEvent>>,
    new_subscriber_id: AtomicU64,
    buffer: usize,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(SUBSCRIBER_BUFFER_COUNT)
    }
}

impl Broadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            new_subscriber_id: AtomicU64::new(0),
            buffer: buffer.max(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self
            .new_subscriber_id
            .fetch_add(1, atomic::Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers.insert(id, tx);

        tracing::debug!("viewer {} subscribed", id);
        Subscription { id, receiver: rx }
    }

    /// Removes a subscriber
    ///
    /// returns false if the subscriber was already gone
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    /// Offers the event to every subscriber without waiting on any of them
    ///
    /// returns the number of subscribers the event was delivered to
    pub fn broadcast(&self, event: LedgerEvent) -> usize {
        let mut delivered = 0;

        self.subscribers
            .retain(|id, sender| match sender.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("viewer {} is lagging behind, dropped an event", id);
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!("viewer {} went away, removing it", id);
                    false
                }
            });

        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Drops every subscriber, their subscriptions resolve to None once drained
    pub fn close_all(&self) {
        self.subscribers.clear();
    }
}
