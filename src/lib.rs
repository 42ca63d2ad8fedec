//! Emcee - 基于 TCP 的聊天网关
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 请求级错误分类、工具扇出限流
//! - **gateway**: TCP 接入层、连接线程与调度器之间的桥、调度器运行时
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / 脚本化 Mock）
//! - **memory**: 对话消息与上下文
//! - **observability**: 日志初始化
//! - **react**: Planner、工具顺序约束、编排主循环
//! - **tools**: 工具服务连接（MCP stdio）、注册表、URI 模板与执行器

pub mod config;
pub mod core;
pub mod gateway;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;
