//! 核心层：请求错误分类与工具扇出限流

pub mod error;
pub mod task_scheduler;

pub use error::GatewayError;
pub use task_scheduler::TaskScheduler;
