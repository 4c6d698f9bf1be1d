// 上游会话：单任务驱动的连接状态机。
use crate::relay::backoff::Backoff;
use crate::relay::connector::{ConnectorCallbacks, ConnectorEvent, ConnectorFactory, SourceConnector};
use crate::relay::dedupe::Deduplicator;
use crate::relay::error::ConnectError;
use crate::relay::pool::PoolInner;
use crate::relay::subscribers::SubscriberRegistry;
use crate::relay::types::{ChannelKey, SessionState};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionCommand {
    Connect,
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionSettings {
    pub reconnect_delay: Duration,
    pub connect_cooldown: Duration,
    pub dedupe_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

// 每个频道一个任务，独占连接器、退避状态与去重缓存。
pub(crate) struct UpstreamSession {
    key: ChannelKey,
    entry_id: u64,
    pool: Weak<PoolInner>,
    factory: Arc<dyn ConnectorFactory>,
    connector: Option<Box<dyn SourceConnector>>,
    generation: u64,
    registry: Arc<SubscriberRegistry>,
    state: watch::Sender<SessionState>,
    backoff: Backoff,
    dedupe: Deduplicator,
    last_attempt: Option<Instant>,
    retry_at: Option<Instant>,
    settings: SessionSettings,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events_tx: mpsc::UnboundedSender<(u64, ConnectorEvent)>,
    events_rx: mpsc::UnboundedReceiver<(u64, ConnectorEvent)>,
}

impl UpstreamSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: ChannelKey,
        entry_id: u64,
        pool: Weak<PoolInner>,
        factory: Arc<dyn ConnectorFactory>,
        connector: Box<dyn SourceConnector>,
        registry: Arc<SubscriberRegistry>,
        state: watch::Sender<SessionState>,
        settings: SessionSettings,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            key,
            entry_id,
            pool,
            factory,
            connector: Some(connector),
            generation: 0,
            registry,
            state,
            backoff: Backoff::new(),
            dedupe: Deduplicator::new(settings.dedupe_capacity),
            last_attempt: None,
            retry_at: None,
            settings,
            commands,
            events_tx,
            events_rx,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let retry_at = self.retry_at;
            let flow = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Connect) => self.try_connect(false).await,
                    Some(SessionCommand::Shutdown) | None => {
                        self.teardown(true).await;
                        Flow::Stop
                    }
                },
                Some((generation, event)) = self.events_rx.recv() => {
                    self.handle_event(generation, event).await
                }
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    self.try_connect(true).await
                }
            };
            if flow == Flow::Stop {
                return;
            }
        }
    }

    fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(
                "session state: channel={}, {} -> {}",
                self.key,
                previous.as_str(),
                next.as_str()
            );
        }
    }

    async fn try_connect(&mut self, scheduled: bool) -> Flow {
        let state = self.current_state();
        if !scheduled && state != SessionState::Idle {
            debug!(
                "connect skipped, already {}: channel={}",
                state.as_str(),
                self.key
            );
            return Flow::Continue;
        }
        let now = Instant::now();
        if let Some(last) = self.last_attempt {
            let ready_at = last + self.settings.connect_cooldown;
            if now < ready_at {
                debug!("connect skipped, too soon: channel={}", self.key);
                if scheduled {
                    self.retry_at = Some(ready_at);
                }
                return Flow::Continue;
            }
        }

        self.retry_at = None;
        self.last_attempt = Some(now);
        self.set_state(SessionState::Connecting);

        if self.connector.is_none() {
            match self.factory.create(&self.key) {
                Ok(connector) => self.connector = Some(connector),
                Err(err) => {
                    return self
                        .fail_permanently(ConnectError::Fatal(err.to_string()))
                        .await;
                }
            }
        }
        self.generation += 1;
        let callbacks = ConnectorCallbacks::new(self.generation, self.events_tx.clone());
        info!("connecting upstream: channel={}", self.key);

        let Some(connector) = self.connector.as_mut() else {
            return Flow::Continue;
        };
        let outcome = {
            let connect = connector.connect(callbacks);
            tokio::pin!(connect);
            loop {
                tokio::select! {
                    result = &mut connect => break Some(result),
                    command = self.commands.recv() => match command {
                        Some(SessionCommand::Connect) => continue,
                        Some(SessionCommand::Shutdown) | None => break None,
                    }
                }
            }
        };

        match outcome {
            None => {
                self.teardown(true).await;
                Flow::Stop
            }
            Some(Ok(())) => {
                self.backoff.reset();
                self.set_state(SessionState::Connected);
                info!("upstream connected: channel={}", self.key);
                Flow::Continue
            }
            Some(Err(err)) if err.is_fatal() => self.fail_permanently(err).await,
            Some(Err(err)) => {
                let delay = self.backoff.next_delay(&err);
                self.retry_at = Some(Instant::now() + delay);
                self.set_state(SessionState::Backoff);
                warn!(
                    "upstream connect failed: channel={}, attempt={}, retry_in={}s, error={err}",
                    self.key,
                    self.backoff.failures(),
                    delay.as_secs()
                );
                Flow::Continue
            }
        }
    }

    async fn handle_event(&mut self, generation: u64, event: ConnectorEvent) -> Flow {
        if generation != self.generation {
            return Flow::Continue;
        }
        match event {
            ConnectorEvent::Chat(event) => {
                if !self.dedupe.insert(&event.dedupe_key()) {
                    debug!("duplicate chat event dropped: channel={}", self.key);
                    return Flow::Continue;
                }
                self.registry.broadcast(&event);
                Flow::Continue
            }
            ConnectorEvent::Error(cause) => {
                warn!("upstream error: channel={}, error={cause}", self.key);
                Flow::Continue
            }
            ConnectorEvent::Disconnected => self.handle_disconnect().await,
        }
    }

    async fn handle_disconnect(&mut self) -> Flow {
        info!("upstream disconnected: channel={}", self.key);
        self.generation += 1;
        if let Some(mut connector) = self.connector.take() {
            connector.disconnect().await;
        }
        let released = self
            .pool
            .upgrade()
            .map(|pool| pool.release_if_idle(&self.key, self.entry_id))
            .unwrap_or(true);
        if released {
            info!("no subscribers left, upstream released: channel={}", self.key);
            self.teardown(false).await;
            return Flow::Stop;
        }
        let delay = self.settings.reconnect_delay;
        info!(
            "reconnecting upstream: channel={}, delay={}s",
            self.key,
            delay.as_secs()
        );
        self.retry_at = Some(Instant::now() + delay);
        self.set_state(SessionState::Connecting);
        Flow::Continue
    }

    async fn fail_permanently(&mut self, err: ConnectError) -> Flow {
        error!(
            "upstream connect failed permanently: channel={}, error={err}",
            self.key
        );
        if let Some(pool) = self.pool.upgrade() {
            pool.release(&self.key, self.entry_id);
        }
        self.teardown(true).await;
        Flow::Stop
    }

    async fn teardown(&mut self, close_subscribers: bool) {
        self.retry_at = None;
        self.generation += 1;
        if let Some(mut connector) = self.connector.take() {
            connector.disconnect().await;
        }
        self.dedupe.clear();
        self.registry.cancel_idle();
        if close_subscribers {
            self.registry.close_all();
        }
        self.set_state(SessionState::Idle);
        debug!("session finished: channel={}", self.key);
    }
}
