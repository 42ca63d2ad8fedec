//! 记忆层：对话消息模型与会话上下文

pub mod context;
pub mod conversation;

pub use context::{Context, ContextKind};
pub use conversation::{prompt_window, Message, Role, ToolCallRef};
