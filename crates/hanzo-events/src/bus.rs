//! In-process publish/subscribe fan-out of run events, keyed by run id.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::AgentEvent;

#[derive(Debug)]
struct BusSubscriber {
    subscriber_id: u64,
    sender: mpsc::UnboundedSender<AgentEvent>,
}

#[derive(Debug, Default)]
struct AgentEventBusInner {
    next_subscriber_id: u64,
    subscribers: HashMap<String, Vec<BusSubscriber>>,
}

/// Fan-out registry for run events.
///
/// Delivery is at-least-once to live subscribers, FIFO per run id from the
/// single engine producer. Publishing for a run id with no subscribers drops
/// the event. Subscribers whose receiver has gone away are pruned on the
/// next publish for that run id.
#[derive(Debug, Default)]
pub struct AgentEventBus {
    inner: Mutex<AgentEventBusInner>,
}

/// A live subscription handle; the receiver yields events in publish order.
#[derive(Debug)]
pub struct AgentEventSubscription {
    pub subscriber_id: u64,
    pub receiver: mpsc::UnboundedReceiver<AgentEvent>,
}

impl AgentEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in `run_id` and returns the subscription handle.
    pub fn subscribe(&self, run_id: &str) -> AgentEventSubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap_or_else(|poison| poison.into_inner());
        inner.next_subscriber_id = inner.next_subscriber_id.saturating_add(1);
        let subscriber_id = inner.next_subscriber_id;
        inner
            .subscribers
            .entry(run_id.to_string())
            .or_default()
            .push(BusSubscriber {
                subscriber_id,
                sender,
            });
        AgentEventSubscription {
            subscriber_id,
            receiver,
        }
    }

    /// Removes one subscriber from `run_id`. Must be called on terminal
    /// events and on client disconnect; safe to call repeatedly.
    pub fn unsubscribe(&self, run_id: &str, subscriber_id: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|poison| poison.into_inner());
        if let Some(entries) = inner.subscribers.get_mut(run_id) {
            entries.retain(|entry| entry.subscriber_id != subscriber_id);
            if entries.is_empty() {
                inner.subscribers.remove(run_id);
            }
        }
    }

    /// Delivers `event` to every live subscriber of its run id and returns
    /// the delivery count. Closed subscribers are pruned in the same pass.
    pub fn publish(&self, event: AgentEvent) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|poison| poison.into_inner());
        let Some(entries) = inner.subscribers.get_mut(&event.run_id) else {
            return 0;
        };
        let mut delivered = 0usize;
        entries.retain(|entry| match entry.sender.send(event.clone()) {
            Ok(()) => {
                delivered = delivered.saturating_add(1);
                true
            }
            Err(_) => false,
        });
        if entries.is_empty() {
            inner.subscribers.remove(&event.run_id);
        }
        delivered
    }

    /// Number of live subscriptions across all run ids.
    pub fn subscription_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|poison| poison.into_inner());
        inner.subscribers.values().map(Vec::len).sum()
    }
}
