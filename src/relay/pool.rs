// 连接池：按频道复用上游会话并管理订阅生命周期。
use crate::core::config::Config;
use crate::relay::connector::{ConnectorFactory, SourceConnector};
use crate::relay::dedupe::DEFAULT_DEDUPE_CAPACITY;
use crate::relay::error::RelayError;
use crate::relay::session::{SessionCommand, SessionSettings, UpstreamSession};
use crate::relay::subscribers::{SubscriberId, SubscriberRegistry};
use crate::relay::types::{ChannelKey, ChatEvent, Platform, SessionState};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub idle_grace: Duration,
    pub reconnect_delay: Duration,
    pub connect_cooldown: Duration,
    pub dedupe_capacity: usize,
    pub subscriber_buffer: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            idle_grace: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(15),
            connect_cooldown: Duration::from_secs(5),
            dedupe_capacity: DEFAULT_DEDUPE_CAPACITY,
            subscriber_buffer: 256,
        }
    }
}

impl PoolSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            idle_grace: config.relay.idle_grace(),
            reconnect_delay: config.relay.reconnect_delay(),
            connect_cooldown: config.relay.connect_cooldown(),
            dedupe_capacity: config.relay.dedupe_capacity(),
            subscriber_buffer: config.server.subscriber_buffer.max(1),
        }
    }

    fn session(&self) -> SessionSettings {
        SessionSettings {
            reconnect_delay: self.reconnect_delay,
            connect_cooldown: self.connect_cooldown,
            dedupe_capacity: self.dedupe_capacity,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub platform: Platform,
    pub handle: String,
    pub state: SessionState,
    pub subscribers: usize,
}

struct ChannelEntry {
    id: u64,
    registry: Arc<SubscriberRegistry>,
    state: watch::Receiver<SessionState>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelEntry {
    fn send(&self, command: SessionCommand) {
        let _ = self.commands.send(command);
    }
}

pub(crate) struct PoolInner {
    entries: DashMap<ChannelKey, Arc<ChannelEntry>>,
    factory: Arc<dyn ConnectorFactory>,
    settings: PoolSettings,
    next_entry_id: AtomicU64,
}

impl PoolInner {
    // 仅当条目仍属于本会话且无订阅者时移除。
    pub(crate) fn release_if_idle(&self, key: &ChannelKey, entry_id: u64) -> bool {
        match self
            .entries
            .remove_if(key, |_, entry| entry.id == entry_id && entry.registry.is_empty())
        {
            Some(_) => true,
            None => !self
                .entries
                .get(key)
                .map(|entry| entry.id == entry_id)
                .unwrap_or(false),
        }
    }

    pub(crate) fn release(&self, key: &ChannelKey, entry_id: u64) {
        self.entries.remove_if(key, |_, entry| entry.id == entry_id);
    }

    fn reap(&self, key: &ChannelKey, entry_id: u64) {
        let removed = self
            .entries
            .remove_if(key, |_, entry| entry.id == entry_id && entry.registry.is_empty());
        if let Some((_, entry)) = removed {
            info!(
                "idle grace elapsed, tearing down upstream: channel={key}, grace={}s",
                self.settings.idle_grace.as_secs()
            );
            entry.send(SessionCommand::Shutdown);
        }
    }
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn ConnectorFactory>, settings: PoolSettings) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                entries: DashMap::new(),
                factory,
                settings,
                next_entry_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe(&self, key: ChannelKey) -> Result<Subscription, RelayError> {
        let (sender, receiver) = mpsc::channel(self.inner.settings.subscriber_buffer.max(1));
        let (entry, subscriber_id, total) = match self.inner.entries.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                let entry = occupied.get().clone();
                let subscriber_id = entry.registry.register(sender);
                let total = entry.registry.len();
                (entry, subscriber_id, total)
            }
            Entry::Vacant(vacant) => {
                let connector = self.inner.factory.create(&key)?;
                info!("creating upstream session: channel={key}");
                let entry = self.spawn_entry(&key, connector);
                let subscriber_id = entry.registry.register(sender);
                entry.send(SessionCommand::Connect);
                vacant.insert(entry.clone());
                (entry, subscriber_id, 1)
            }
        };
        info!("client joined: channel={key}, active={total}");
        Ok(Subscription {
            key,
            receiver,
            guard: SubscriptionGuard {
                registry: entry.registry.clone(),
                subscriber_id,
            },
        })
    }

    pub fn unsubscribe(&self, key: &ChannelKey, subscriber_id: SubscriberId) -> bool {
        let registry = match self.inner.entries.get(key) {
            Some(entry) => entry.registry.clone(),
            None => return false,
        };
        match registry.unregister(subscriber_id) {
            Some(remaining) => {
                info!("client left: channel={key}, active={remaining}");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &ChannelKey) -> bool {
        self.inner.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn subscriber_count(&self, key: &ChannelKey) -> usize {
        self.inner
            .entries
            .get(key)
            .map(|entry| entry.registry.len())
            .unwrap_or(0)
    }

    pub fn session_state(&self, key: &ChannelKey) -> Option<SessionState> {
        self.inner
            .entries
            .get(key)
            .map(|entry| *entry.state.borrow())
    }

    pub fn watch_state(&self, key: &ChannelKey) -> Option<watch::Receiver<SessionState>> {
        self.inner.entries.get(key).map(|entry| entry.state.clone())
    }

    pub fn snapshot(&self) -> Vec<ChannelSnapshot> {
        let mut items: Vec<ChannelSnapshot> = self
            .inner
            .entries
            .iter()
            .map(|item| ChannelSnapshot {
                platform: item.key().platform(),
                handle: item.key().handle().to_string(),
                state: *item.value().state.borrow(),
                subscribers: item.value().registry.len(),
            })
            .collect();
        items.sort_by(|a, b| {
            a.platform
                .as_str()
                .cmp(b.platform.as_str())
                .then_with(|| a.handle.cmp(&b.handle))
        });
        items
    }

    pub async fn shutdown(&self) {
        let keys: Vec<ChannelKey> = self
            .inner
            .entries
            .iter()
            .map(|item| item.key().clone())
            .collect();
        let mut tasks = Vec::new();
        for key in keys {
            if let Some((_, entry)) = self.inner.entries.remove(&key) {
                entry.registry.close_all();
                entry.send(SessionCommand::Shutdown);
                if let Some(task) = entry.task.lock().take() {
                    tasks.push(task);
                }
            }
        }
        if tasks.is_empty() {
            return;
        }
        info!("shutting down upstream sessions: count={}", tasks.len());
        let wait = futures::future::join_all(tasks);
        if tokio::time::timeout(SHUTDOWN_WAIT, wait).await.is_err() {
            warn!("upstream sessions did not stop in time");
        }
    }

    fn spawn_entry(
        &self,
        key: &ChannelKey,
        connector: Box<dyn SourceConnector>,
    ) -> Arc<ChannelEntry> {
        let entry_id = self.inner.next_entry_id.fetch_add(1, Ordering::SeqCst);
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let idle_key = key.clone();
        let on_idle = Arc::new(move || {
            if let Some(pool) = weak.upgrade() {
                pool.reap(&idle_key, entry_id);
            }
        });
        let registry = Arc::new(SubscriberRegistry::new(
            key.to_string(),
            self.inner.settings.idle_grace,
            on_idle,
        ));
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let session = UpstreamSession::new(
            key.clone(),
            entry_id,
            Arc::downgrade(&self.inner),
            self.inner.factory.clone(),
            connector,
            registry.clone(),
            state_tx,
            self.inner.settings.session(),
            command_rx,
        );
        let task = tokio::spawn(session.run());
        Arc::new(ChannelEntry {
            id: entry_id,
            registry,
            state: state_rx,
            commands: command_tx,
            task: Mutex::new(Some(task)),
        })
    }
}

struct SubscriptionGuard {
    registry: Arc<SubscriberRegistry>,
    subscriber_id: SubscriberId,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(remaining) = self.registry.unregister(self.subscriber_id) {
            info!(
                "client left: subscriber={}, active={remaining}",
                self.subscriber_id
            );
        }
    }
}

pub struct Subscription {
    key: ChannelKey,
    receiver: mpsc::Receiver<ChatEvent>,
    guard: SubscriptionGuard,
}

impl Subscription {
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn subscriber_id(&self) -> SubscriberId {
        self.guard.subscriber_id
    }

    pub async fn recv(&mut self) -> Option<ChatEvent> {
        self.receiver.recv().await
    }
}

impl Stream for Subscription {
    type Item = ChatEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
