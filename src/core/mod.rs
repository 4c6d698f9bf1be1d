// 进程级基础设施：配置、状态与停机信号。
pub mod config;
pub mod shutdown;
pub mod state;
