// 直播聊天中继：每个频道一条上游连接，扇出给多个 SSE 客户端。
pub mod backoff;
pub mod connector;
pub mod dedupe;
pub mod error;
pub mod pool;
pub mod reaper;
pub mod session;
pub mod subscribers;
pub mod tiktok;
pub mod types;
pub mod youtube;

#[cfg(test)]
pub(crate) mod testing;

pub use connector::{
    ConnectorCallbacks, ConnectorEvent, ConnectorFactory, PlatformConnectorFactory,
    SourceConnector,
};
pub use error::{ConnectError, RelayError};
pub use pool::{ChannelSnapshot, ConnectionPool, PoolSettings, Subscription};
pub use types::{ChannelKey, ChatEvent, Platform, SessionState};
