// 连接器抽象：统一推送与轮询两类上游的接入方式。
use crate::core::config::Config;
use crate::relay::error::{ConnectError, RelayError};
use crate::relay::tiktok::{TiktokConnector, TiktokSettings};
use crate::relay::types::{ChannelKey, ChatEvent, Platform};
use crate::relay::youtube::{YoutubeConnector, YoutubeSettings};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorEvent {
    Chat(ChatEvent),
    Disconnected,
    Error(String),
}

// 回调按连接代次打标，会话据此丢弃已替换连接的迟到事件。
#[derive(Clone)]
pub struct ConnectorCallbacks {
    generation: u64,
    sender: mpsc::UnboundedSender<(u64, ConnectorEvent)>,
}

impl ConnectorCallbacks {
    pub fn new(generation: u64, sender: mpsc::UnboundedSender<(u64, ConnectorEvent)>) -> Self {
        Self { generation, sender }
    }

    pub fn on_chat(&self, event: ChatEvent) {
        let _ = self.sender.send((self.generation, ConnectorEvent::Chat(event)));
    }

    pub fn on_disconnected(&self) {
        let _ = self
            .sender
            .send((self.generation, ConnectorEvent::Disconnected));
    }

    pub fn on_error(&self, cause: impl Into<String>) {
        let _ = self
            .sender
            .send((self.generation, ConnectorEvent::Error(cause.into())));
    }
}

#[async_trait]
pub trait SourceConnector: Send {
    fn platform(&self) -> Platform;

    async fn connect(&mut self, callbacks: ConnectorCallbacks) -> Result<(), ConnectError>;

    async fn disconnect(&mut self);
}

pub trait ConnectorFactory: Send + Sync {
    fn create(&self, key: &ChannelKey) -> Result<Box<dyn SourceConnector>, RelayError>;
}

pub enum PlatformConnector {
    Tiktok(TiktokConnector),
    Youtube(YoutubeConnector),
}

#[async_trait]
impl SourceConnector for PlatformConnector {
    fn platform(&self) -> Platform {
        match self {
            Self::Tiktok(_) => Platform::Tiktok,
            Self::Youtube(_) => Platform::Youtube,
        }
    }

    async fn connect(&mut self, callbacks: ConnectorCallbacks) -> Result<(), ConnectError> {
        match self {
            Self::Tiktok(connector) => connector.connect(callbacks).await,
            Self::Youtube(connector) => connector.connect(callbacks).await,
        }
    }

    async fn disconnect(&mut self) {
        match self {
            Self::Tiktok(connector) => connector.disconnect().await,
            Self::Youtube(connector) => connector.disconnect().await,
        }
    }
}

pub struct PlatformConnectorFactory {
    http: Client,
    tiktok: Option<TiktokSettings>,
    youtube: YoutubeSettings,
}

impl PlatformConnectorFactory {
    pub fn from_config(config: &Config) -> Self {
        let connect_timeout = config.relay.connect_timeout();
        let http = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(connect_timeout.max(Duration::from_secs(5)))
            .build()
            .unwrap_or_else(|_| Client::new());
        let tiktok = config
            .tiktok_credentials()
            .map(|credentials| TiktokSettings::new(credentials, &config.tiktok, connect_timeout));
        Self {
            http,
            tiktok,
            youtube: YoutubeSettings::from_config(&config.youtube),
        }
    }
}

impl ConnectorFactory for PlatformConnectorFactory {
    fn create(&self, key: &ChannelKey) -> Result<Box<dyn SourceConnector>, RelayError> {
        match key.platform() {
            Platform::Tiktok => {
                let settings = self.tiktok.clone().ok_or_else(|| {
                    RelayError::Configuration("missing TikTok signing credentials".to_string())
                })?;
                Ok(Box::new(PlatformConnector::Tiktok(TiktokConnector::new(
                    key.handle(),
                    settings,
                ))))
            }
            Platform::Youtube => Ok(Box::new(PlatformConnector::Youtube(
                YoutubeConnector::new(key.handle(), self.http.clone(), self.youtube.clone()),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::TiktokConfig;

    #[tokio::test]
    async fn callbacks_carry_their_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let callbacks = ConnectorCallbacks::new(7, tx);
        callbacks.on_chat(ChatEvent::new("bob", "hi", 1));
        callbacks.on_error("boom");
        callbacks.on_disconnected();
        assert_eq!(
            rx.recv().await,
            Some((7, ConnectorEvent::Chat(ChatEvent::new("bob", "hi", 1))))
        );
        assert_eq!(
            rx.recv().await,
            Some((7, ConnectorEvent::Error("boom".to_string())))
        );
        assert_eq!(rx.recv().await, Some((7, ConnectorEvent::Disconnected)));
    }

    #[test]
    fn tiktok_without_credentials_is_a_configuration_error() {
        let mut config = Config::default();
        config.tiktok = TiktokConfig {
            account_id: Some("acct".to_string()),
            secret: None,
            ws_endpoint: None,
        };
        std::env::remove_var("EULERSTREAM_WEBHOOK_SECRET");
        std::env::remove_var("VITE_EULERSTREAM_WEBHOOK_SECRET");
        let factory = PlatformConnectorFactory::from_config(&config);
        let key = ChannelKey::new(Platform::Tiktok, "alice").expect("key");
        let err = factory.create(&key).err().expect("configuration error");
        assert!(matches!(err, RelayError::Configuration(_)));
    }

    #[test]
    fn youtube_needs_no_credentials() {
        let factory = PlatformConnectorFactory::from_config(&Config::default());
        let key = ChannelKey::new(Platform::Youtube, "abc123").expect("key");
        let connector = factory.create(&key).expect("connector");
        assert_eq!(connector.platform(), Platform::Youtube);
    }
}
