// 库入口：供服务二进制与集成测试复用。
pub mod api;
pub mod core;
pub mod relay;
pub mod services;

pub use api::build_router;
pub use self::core::{config, shutdown, state};
pub use relay::{ChannelKey, ChatEvent, ConnectionPool, Platform, RelayError, SessionState};
