// 全局应用状态：配置、连接池与共享 HTTP 客户端。

use crate::core::config::Config;
use crate::relay::{ConnectionPool, ConnectorFactory, PlatformConnectorFactory, PoolSettings};
use anyhow::{Context, Result};
use reqwest::Client;
use std::sync::Arc;

pub struct AppState {
    pub config: Config,
    pub pool: ConnectionPool,
    pub http: Client,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let factory = Arc::new(PlatformConnectorFactory::from_config(&config));
        Self::with_factory(config, factory)
    }

    /// 测试与嵌入场景可注入自定义连接器工厂。
    pub fn with_factory(config: Config, factory: Arc<dyn ConnectorFactory>) -> Result<Self> {
        let timeout = config.relay.connect_timeout();
        let http = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .context("HTTP 客户端初始化失败")?;
        let pool = ConnectionPool::new(factory, PoolSettings::from_config(&config));
        Ok(Self { config, pool, http })
    }
}
