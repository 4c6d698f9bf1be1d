// 面向 HTTP 的辅助服务，不参与连接池生命周期。
pub mod youtube_live;
