// 单元测试用的脚本化连接器。
use crate::relay::connector::{ConnectorCallbacks, ConnectorFactory, SourceConnector};
use crate::relay::error::{ConnectError, RelayError};
use crate::relay::types::{ChannelKey, ChatEvent, Platform};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Default)]
pub(crate) struct MockUpstream {
    script: Mutex<VecDeque<Result<(), ConnectError>>>,
    connect_calls: Mutex<Vec<Instant>>,
    disconnects: Mutex<usize>,
    live: Mutex<Option<ConnectorCallbacks>>,
}

impl MockUpstream {
    pub(crate) fn script(&self, results: Vec<Result<(), ConnectError>>) {
        self.script.lock().extend(results);
    }

    pub(crate) fn connect_calls(&self) -> Vec<Instant> {
        self.connect_calls.lock().clone()
    }

    pub(crate) fn disconnects(&self) -> usize {
        *self.disconnects.lock()
    }

    pub(crate) fn emit(&self, event: ChatEvent) -> bool {
        match self.live.lock().as_ref() {
            Some(callbacks) => {
                callbacks.on_chat(event);
                true
            }
            None => false,
        }
    }

    pub(crate) fn drop_connection(&self) {
        if let Some(callbacks) = self.live.lock().take() {
            callbacks.on_disconnected();
        }
    }
}

struct MockConnector {
    platform: Platform,
    upstream: Arc<MockUpstream>,
}

#[async_trait]
impl SourceConnector for MockConnector {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn connect(&mut self, callbacks: ConnectorCallbacks) -> Result<(), ConnectError> {
        self.upstream.connect_calls.lock().push(Instant::now());
        let result = self.upstream.script.lock().pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            *self.upstream.live.lock() = Some(callbacks);
        }
        result
    }

    async fn disconnect(&mut self) {
        *self.upstream.disconnects.lock() += 1;
        self.upstream.live.lock().take();
    }
}

#[derive(Default)]
pub(crate) struct MockFactory {
    misconfigured: bool,
    upstreams: Mutex<HashMap<ChannelKey, Arc<MockUpstream>>>,
    created: Mutex<HashMap<ChannelKey, usize>>,
}

impl MockFactory {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn misconfigured() -> Arc<Self> {
        Arc::new(Self {
            misconfigured: true,
            ..Self::default()
        })
    }

    pub(crate) fn upstream(&self, key: &ChannelKey) -> Arc<MockUpstream> {
        self.upstreams
            .lock()
            .entry(key.clone())
            .or_default()
            .clone()
    }

    pub(crate) fn created(&self, key: &ChannelKey) -> usize {
        self.created.lock().get(key).copied().unwrap_or(0)
    }
}

impl ConnectorFactory for MockFactory {
    fn create(&self, key: &ChannelKey) -> Result<Box<dyn SourceConnector>, RelayError> {
        if self.misconfigured {
            return Err(RelayError::Configuration(
                "missing TikTok signing credentials".to_string(),
            ));
        }
        *self.created.lock().entry(key.clone()).or_insert(0) += 1;
        Ok(Box::new(MockConnector {
            platform: key.platform(),
            upstream: self.upstream(key),
        }))
    }
}
