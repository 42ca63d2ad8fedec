//! LLM 客户端抽象
//!
//! 无状态的一次调用：给定消息列表与工具 schema，返回最终回答或一组工具调用请求。

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::memory::Message;

/// 结束原因：stop 为最终回答，tool_calls 为请求执行工具，其余原样保留
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Other(String),
}

impl FinishReason {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "stop" => FinishReason::Stop,
            "tool_calls" => FinishReason::ToolCalls,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

/// 模型请求的一次工具调用；arguments 为未解析的 JSON 文本
#[derive(Debug, Clone, PartialEq)]
pub struct RequestedToolCall {
    pub id: String,
    pub name: String,
    pub arguments_json: String,
}

/// 一次 complete 的结果
#[derive(Debug, Clone)]
pub struct Completion {
    pub finish_reason: FinishReason,
    pub content: Option<String>,
    pub tool_calls: Vec<RequestedToolCall>,
}

impl Completion {
    pub fn stop(content: impl Into<String>) -> Self {
        Self {
            finish_reason: FinishReason::Stop,
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_calls(calls: Vec<RequestedToolCall>) -> Self {
        Self {
            finish_reason: FinishReason::ToolCalls,
            content: None,
            tool_calls: calls,
        }
    }
}

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("LLM API error: {0}")]
    Api(String),

    #[error("LLM returned no choices")]
    EmptyResponse,

    #[error("Malformed LLM response: {0}")]
    Malformed(String),
}

/// LLM 客户端 trait（OpenAI 兼容 / 测试用脚本客户端）
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, messages: &[Message], tools: &[Value]) -> Result<Completion, LlmError>;

    /// 累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
