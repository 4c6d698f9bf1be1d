// 订阅者登记与广播。
use crate::relay::reaper::IdleReaper;
use crate::relay::types::ChatEvent;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

pub type SubscriberId = u64;

type IdleHook = Arc<dyn Fn() + Send + Sync>;

pub struct SubscriberRegistry {
    label: String,
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<ChatEvent>>>,
    next_id: AtomicU64,
    reaper: IdleReaper,
    on_idle: IdleHook,
}

impl SubscriberRegistry {
    pub fn new(label: impl Into<String>, grace: Duration, on_idle: IdleHook) -> Self {
        Self {
            label: label.into(),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            reaper: IdleReaper::new(grace),
            on_idle,
        }
    }

    pub fn register(&self, sender: mpsc::Sender<ChatEvent>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.subscribers.lock();
        guard.insert(id, sender);
        if self.reaper.cancel() {
            debug!("idle teardown canceled: channel={}", self.label);
        }
        id
    }

    pub fn unregister(&self, id: SubscriberId) -> Option<usize> {
        let mut guard = self.subscribers.lock();
        guard.remove(&id)?;
        let remaining = guard.len();
        if remaining == 0 {
            self.arm_idle();
        }
        Some(remaining)
    }

    // 非阻塞广播，队列已满或已关闭的订阅者直接移除。
    pub fn broadcast(&self, event: &ChatEvent) -> usize {
        let mut guard = self.subscribers.lock();
        if guard.is_empty() {
            return 0;
        }
        let mut delivered = 0;
        guard.retain(|id, sender| match sender.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    "subscriber too slow, dropping: channel={}, subscriber={id}",
                    self.label
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
        if guard.is_empty() {
            self.arm_idle();
        }
        delivered
    }

    pub fn close_all(&self) -> usize {
        let mut guard = self.subscribers.lock();
        let closed = guard.len();
        guard.clear();
        self.reaper.cancel();
        closed
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }

    pub fn cancel_idle(&self) -> bool {
        self.reaper.cancel()
    }

    pub fn idle_armed(&self) -> bool {
        self.reaper.is_armed()
    }

    fn arm_idle(&self) {
        let hook = self.on_idle.clone();
        if self.reaper.arm(move || hook()) {
            debug!(
                "idle teardown armed: channel={}, grace={}s",
                self.label,
                self.reaper.grace().as_secs()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn registry(grace_s: u64) -> (SubscriberRegistry, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let hook_count = fired.clone();
        let registry = SubscriberRegistry::new(
            "tiktok:@alice",
            Duration::from_secs(grace_s),
            Arc::new(move || {
                hook_count.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (registry, fired)
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let (registry, _) = registry(60);
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        registry.register(tx_a);
        registry.register(tx_b);
        let event = ChatEvent::new("bob", "hi", 1);
        assert_eq!(registry.broadcast(&event), 2);
        assert_eq!(rx_a.recv().await, Some(event.clone()));
        assert_eq!(rx_b.recv().await, Some(event));
    }

    #[tokio::test]
    async fn closed_subscriber_does_not_stop_fan_out() {
        let (registry, _) = registry(60);
        let (tx_a, rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        registry.register(tx_a);
        registry.register(tx_b);
        drop(rx_a);
        let event = ChatEvent::new("bob", "hi", 1);
        assert_eq!(registry.broadcast(&event), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(rx_b.recv().await, Some(event));
    }

    #[tokio::test]
    async fn full_subscriber_is_dropped() {
        let (registry, _) = registry(60);
        let (tx_slow, mut rx_slow) = mpsc::channel(1);
        let (tx_fast, mut rx_fast) = mpsc::channel(1);
        registry.register(tx_slow);
        registry.register(tx_fast);
        let first = ChatEvent::new("bob", "one", 1);
        let second = ChatEvent::new("bob", "two", 2);
        registry.broadcast(&first);
        assert_eq!(rx_fast.recv().await, Some(first.clone()));
        assert_eq!(registry.broadcast(&second), 1);
        assert_eq!(rx_fast.recv().await, Some(second));
        assert_eq!(rx_slow.recv().await, Some(first));
        assert_eq!(rx_slow.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn last_unregister_arms_idle_hook() {
        let (registry, fired) = registry(60);
        let (tx, _rx) = mpsc::channel(1);
        let id = registry.register(tx);
        assert_eq!(registry.unregister(id), Some(0));
        assert!(registry.idle_armed());
        assert_eq!(registry.unregister(id), None);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn register_cancels_pending_idle_hook() {
        let (registry, fired) = registry(60);
        let (tx, _rx) = mpsc::channel(1);
        let id = registry.register(tx);
        registry.unregister(id);
        tokio::time::sleep(Duration::from_secs(30)).await;
        let (tx, _rx2) = mpsc::channel(1);
        registry.register(tx);
        assert!(!registry.idle_armed());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_all_ends_streams() {
        let (registry, _) = registry(60);
        let (tx, mut rx) = mpsc::channel(1);
        registry.register(tx);
        assert_eq!(registry.close_all(), 1);
        assert!(!registry.idle_armed());
        assert_eq!(rx.recv().await, None);
    }
}
