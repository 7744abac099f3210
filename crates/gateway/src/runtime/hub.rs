//! Per-reply fan-out hub.
//!
//! Every downstream event produced for a reply is delivered to every
//! active subscriber without ever blocking the producer. Each subscriber
//! owns a bounded queue; a subscriber that falls behind is detached and
//! observes end-of-stream. Closing the hub publishes the synthetic
//! terminal event(s) and retains them so a late subscriber still sees how
//! the reply ended.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use studio_domain::event::{ReplyEvent, CANCELLED_BY_USER};

/// Why a hub was closed; maps onto the terminal SSE frames.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    Done,
    Cancelled,
    Failed(String),
}

pub struct ReplyHub {
    conversation_id: String,
    buffer: usize,
    inner: Mutex<HubInner>,
}

struct HubInner {
    subscribers: Vec<Subscriber>,
    closed: bool,
    /// Terminal events replayed to subscribers that arrive after close.
    terminal_tail: Vec<ReplyEvent>,
    next_id: u64,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<ReplyEvent>,
}

/// A consumer handle. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::Receiver<ReplyEvent>,
}

impl Subscription {
    /// Next event in publish order; `None` at end-of-stream (hub closed
    /// and drained, or this subscriber was dropped for falling behind).
    pub async fn recv(&mut self) -> Option<ReplyEvent> {
        self.rx.recv().await
    }
}

impl ReplyHub {
    pub fn new(conversation_id: &str, buffer: usize) -> Self {
        Self {
            conversation_id: conversation_id.to_owned(),
            buffer: buffer.max(2),
            inner: Mutex::new(HubInner {
                subscribers: Vec::new(),
                closed: false,
                terminal_tail: Vec::new(),
                next_id: 0,
            }),
        }
    }

    /// Register a new subscriber. After close, the subscription yields
    /// only the terminal tail and then end-of-stream.
    pub fn subscribe(&self) -> Subscription {
        let mut inner = self.inner.lock();
        let (tx, rx) = mpsc::channel(self.buffer.max(inner.terminal_tail.len() + 1));

        if inner.closed {
            for event in &inner.terminal_tail {
                let _ = tx.try_send(event.clone());
            }
            // tx drops here: the subscription drains the tail, then ends.
            return Subscription { rx };
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(Subscriber { id, tx });
        Subscription { rx }
    }

    /// Deliver an event to every subscriber. No-op after close.
    pub fn publish(&self, event: ReplyEvent) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        Self::fan_out(&mut inner, event);
    }

    /// Publish the synthetic terminal frame(s) for `reason`, then mark
    /// the hub closed. Idempotent.
    pub fn close(&self, reason: CloseReason) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }

        let mut tail = Vec::with_capacity(2);
        match reason {
            CloseReason::Done => {}
            CloseReason::Cancelled => tail.push(ReplyEvent::Cancelled {
                message: CANCELLED_BY_USER.into(),
            }),
            CloseReason::Failed(message) => tail.push(ReplyEvent::Error { message }),
        }
        tail.push(ReplyEvent::done_now(&self.conversation_id));

        for event in &tail {
            Self::fan_out(&mut inner, event.clone());
        }

        inner.terminal_tail = tail;
        inner.closed = true;
        // Dropping the senders ends every subscription once drained.
        inner.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    fn fan_out(inner: &mut HubInner, event: ReplyEvent) {
        inner.subscribers.retain(|sub| {
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    // Slowest subscriber loses its subscription, not the
                    // other way around: producers never block.
                    tracing::warn!(subscriber = sub.id, "dropping backpressured subscriber");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str) -> ReplyEvent {
        ReplyEvent::Chunk {
            content: text.into(),
        }
    }

    #[tokio::test]
    async fn subscribers_observe_publish_order() {
        let hub = ReplyHub::new("c1", 16);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        hub.publish(chunk("one"));
        hub.publish(chunk("two"));
        hub.close(CloseReason::Done);

        for sub in [&mut a, &mut b] {
            assert_eq!(sub.recv().await, Some(chunk("one")));
            assert_eq!(sub.recv().await, Some(chunk("two")));
            assert!(matches!(sub.recv().await, Some(ReplyEvent::Done { .. })));
            assert_eq!(sub.recv().await, None);
        }
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_others_unaffected() {
        let hub = ReplyHub::new("c1", 2);
        let slow = hub.subscribe();
        let mut fast = hub.subscribe();

        // Fill both queues, then let only the fast subscriber drain.
        hub.publish(chunk("1"));
        hub.publish(chunk("2"));
        assert_eq!(fast.recv().await, Some(chunk("1")));
        assert_eq!(fast.recv().await, Some(chunk("2")));

        // The slow subscriber's queue is still full: this drops it.
        hub.publish(chunk("3"));
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(fast.recv().await, Some(chunk("3")));

        // The dropped subscriber sees its buffered prefix, then ends.
        let mut slow = slow;
        assert_eq!(slow.recv().await, Some(chunk("1")));
        assert_eq!(slow.recv().await, Some(chunk("2")));
        assert_eq!(slow.recv().await, None);
    }

    #[tokio::test]
    async fn publish_after_close_is_noop() {
        let hub = ReplyHub::new("c1", 16);
        let mut sub = hub.subscribe();

        hub.close(CloseReason::Done);
        hub.publish(chunk("late"));

        assert!(matches!(sub.recv().await, Some(ReplyEvent::Done { .. })));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn close_cancelled_emits_cancelled_then_done() {
        let hub = ReplyHub::new("c1", 16);
        let mut sub = hub.subscribe();

        hub.close(CloseReason::Cancelled);

        match sub.recv().await {
            Some(ReplyEvent::Cancelled { message }) => {
                assert_eq!(message, CANCELLED_BY_USER);
            }
            other => panic!("expected cancelled, got {other:?}"),
        }
        assert!(matches!(sub.recv().await, Some(ReplyEvent::Done { .. })));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn close_failed_emits_error_then_done() {
        let hub = ReplyHub::new("c1", 16);
        let mut sub = hub.subscribe();

        hub.close(CloseReason::Failed("agent exited unexpectedly".into()));

        match sub.recv().await {
            Some(ReplyEvent::Error { message }) => {
                assert_eq!(message, "agent exited unexpectedly");
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert!(matches!(sub.recv().await, Some(ReplyEvent::Done { .. })));
    }

    #[tokio::test]
    async fn late_subscriber_gets_terminal_tail_only() {
        let hub = ReplyHub::new("c1", 16);
        hub.publish(chunk("missed")); // nobody listening, not retained
        hub.close(CloseReason::Cancelled);

        let mut late = hub.subscribe();
        assert!(matches!(late.recv().await, Some(ReplyEvent::Cancelled { .. })));
        assert!(matches!(late.recv().await, Some(ReplyEvent::Done { .. })));
        assert_eq!(late.recv().await, None);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let hub = ReplyHub::new("c1", 16);
        let mut sub = hub.subscribe();

        hub.close(CloseReason::Done);
        hub.close(CloseReason::Failed("ignored".into()));

        assert!(matches!(sub.recv().await, Some(ReplyEvent::Done { .. })));
        assert_eq!(sub.recv().await, None);
        assert!(hub.is_closed());
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned_on_next_publish() {
        let hub = ReplyHub::new("c1", 16);
        let sub = hub.subscribe();
        drop(sub);

        hub.publish(chunk("x"));
        assert_eq!(hub.subscriber_count(), 0);
    }
}
