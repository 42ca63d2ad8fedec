//! 网关：TCP 接入层（Hub）、连接线程与调度器之间的桥、调度器运行时
//!
//! ## 执行模型
//!
//! - **连接线程**：每个连接一个阻塞 OS 线程，负责读行、解析、提交、等待、写回
//! - **调度器**：唯一的 current_thread runtime，串行处理工作队列；会话存储只在这里读写
//! - **工具扇出**：同一轮内的工具调用在调度器上并发执行，由信号量限流
//!
//! 请求流：连接线程 → `Bridge::submit` → `GatewayRuntime::handle` → `ResultSlot::resolve` → 连接线程写回

mod bridge;
mod hub;
mod intent;
mod message;
mod runtime;
mod session_store;

pub use bridge::{placeholder, Bridge, PendingRequest, ResultSlot, ResultWaiter, WorkItem};
pub use hub::{Hub, HubConfig};
pub use intent::{ContextClassifier, RegexContextClassifier};
pub use message::{parse_request, ChatRequest, Request, RequestError, Response, Status, SystemCommand};
pub use runtime::{spawn_scheduler, GatewayRuntime, ServerStats};
pub use session_store::{ConversationSession, SessionStore};
