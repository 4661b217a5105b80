// =============================================================================
// Event bus — ordered, per-subscriber delivery of lifecycle events
// =============================================================================
//
// Four topics: `signal` (every tick result), `progress` (backtest frame
// progress), `completion` (orchestrator exit), `error` (recoverable faults).
//
// Each subscriber owns an unbounded queue; publishing pushes into every
// matching queue in registration order, so the order any subscriber observes
// equals emission order. Callback subscribers get one drain task each — a
// callback never runs concurrently with itself. Dead subscribers (dropped
// receivers) are pruned on the next publish.
// =============================================================================

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::outcome::TickResult;
use crate::types::ExecutionContext;

// ---------------------------------------------------------------------------
// Event payloads
// ---------------------------------------------------------------------------

/// Backtest progress, emitted once per frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub exchange_name: String,
    pub strategy_name: String,
    pub symbol: String,
    pub total_frames: usize,
    pub processed_frames: usize,
    /// 0.0 ..= 1.0
    pub progress: f64,
}

/// Orchestrator exit notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub symbol: String,
    pub strategy_name: String,
    pub exchange_name: String,
    pub backtest: bool,
}

/// A recoverable fault, reported at the boundary where it was absorbed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub ctx: ExecutionContext,
    pub strategy_name: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

type Filter<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

struct Subscriber<T> {
    filter: Option<Filter<T>>,
    tx: mpsc::UnboundedSender<T>,
}

/// One ordered publish/subscribe channel.
pub struct Topic<T> {
    subscribers: RwLock<Vec<Subscriber<T>>>,
}

impl<T> Default for Topic<T> {
    fn default() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }
}

impl<T: Clone + Send + 'static> Topic<T> {
    /// Deliver `event` to every live subscriber whose filter accepts it.
    pub fn publish(&self, event: &T) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|sub| {
            if let Some(filter) = &sub.filter {
                if !filter(event) {
                    return !sub.tx.is_closed();
                }
            }
            // A failed send means the receiver is gone; drop the subscriber.
            sub.tx.send(event.clone()).is_ok()
        });
    }

    /// Subscribe with no filter; returns the subscriber's ordered queue.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        self.subscribe_where(None)
    }

    /// Subscribe with a publish-time filter predicate.
    pub fn subscribe_filtered(
        &self,
        filter: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> mpsc::UnboundedReceiver<T> {
        self.subscribe_where(Some(Box::new(filter)))
    }

    fn subscribe_where(&self, filter: Option<Filter<T>>) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(Subscriber { filter, tx });
        rx
    }

    /// Subscribe with a callback. The returned task drains this subscriber's
    /// queue sequentially, so `handler` never overlaps itself.
    pub fn on(
        &self,
        mut handler: impl FnMut(T) + Send + 'static,
    ) -> tokio::task::JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler(event);
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// The four core topics, shared by engines and orchestrators.
#[derive(Default)]
pub struct EventBus {
    pub signal: Topic<TickResult>,
    pub progress: Topic<ProgressEvent>,
    pub completion: Topic<CompletionEvent>,
    pub error: Topic<ErrorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_sees_emission_order() {
        let topic: Topic<u32> = Topic::default();
        let mut rx = topic.subscribe();

        for i in 0..100u32 {
            topic.publish(&i);
        }

        for expected in 0..100u32 {
            assert_eq!(rx.recv().await, Some(expected));
        }
    }

    #[tokio::test]
    async fn filter_is_applied_at_publish() {
        let topic: Topic<u32> = Topic::default();
        let mut evens = topic.subscribe_filtered(|n| n % 2 == 0);
        let mut all = topic.subscribe();

        for i in 0..6u32 {
            topic.publish(&i);
        }

        assert_eq!(evens.recv().await, Some(0));
        assert_eq!(evens.recv().await, Some(2));
        assert_eq!(evens.recv().await, Some(4));
        for expected in 0..6u32 {
            assert_eq!(all.recv().await, Some(expected));
        }
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let topic: Topic<u32> = Topic::default();
        let rx = topic.subscribe();
        drop(rx);
        topic.publish(&1);
        assert_eq!(topic.subscribers.read().len(), 0);
    }

    #[tokio::test]
    async fn callback_drains_sequentially() {
        let topic: Topic<u32> = Topic::default();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let mut seen = Vec::new();
        let handle = topic.on(move |n| {
            seen.push(n);
            if seen.len() == 3 {
                done_tx.send(seen.clone()).unwrap();
            }
        });

        topic.publish(&7);
        topic.publish(&8);
        topic.publish(&9);

        let seen = done_rx.recv().await.unwrap();
        assert_eq!(seen, vec![7, 8, 9]);
        handle.abort();
    }

    #[tokio::test]
    async fn bus_topics_are_independent() {
        let bus = EventBus::new();
        let mut completion = bus.completion.subscribe();

        bus.completion.publish(&CompletionEvent {
            symbol: "BTCUSDT".into(),
            strategy_name: "demo".into(),
            exchange_name: "binance".into(),
            backtest: true,
        });

        let event = completion.recv().await.unwrap();
        assert!(event.backtest);
        assert_eq!(event.symbol, "BTCUSDT");
    }
}
