//! 单次请求的错误分类
//!
//! 编排循环的所有出口都落到 `Result<ChatOutcome, GatewayError>`；桥与 socket 层只依赖 code() / to_string()，
//! 不需要了解具体组件的错误细节。

use thiserror::Error;

/// 一次聊天请求的终止性错误（只影响该请求，不影响网关）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// LLM 或工具服务不可达 / 报错
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("LLM completion timeout after {0}s")]
    CompletionTimeout(u64),

    #[error("Tool call timeout: {tool}")]
    ToolTimeout { tool: String },

    /// 未知工具名等调用层面的逻辑错误
    #[error("Tool invocation failed ({tool}): {message}")]
    ToolInvocation { tool: String, message: String },

    #[error("Malformed arguments for tool {tool}: {message}")]
    MalformedArguments { tool: String, message: String },

    #[error("Iteration limit exceeded ({0} iterations)")]
    IterationLimitExceeded(usize),

    #[error("Unexpected finish state: {0}")]
    UnexpectedFinishState(String),

    /// 调度器不可用、等待超时等桥接层错误
    #[error("Processing failed: {0}")]
    Bridge(String),
}

impl GatewayError {
    /// 稳定的机器可读错误码（随响应一起返回）
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::ProviderUnavailable(_) => "provider_unavailable",
            GatewayError::CompletionTimeout(_) => "completion_timeout",
            GatewayError::ToolTimeout { .. } => "tool_timeout",
            GatewayError::ToolInvocation { .. } => "tool_invocation_error",
            GatewayError::MalformedArguments { .. } => "malformed_arguments",
            GatewayError::IterationLimitExceeded(_) => "iteration_limit_exceeded",
            GatewayError::UnexpectedFinishState(_) => "unexpected_finish_state",
            GatewayError::Bridge(_) => "processing_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let errors = [
            GatewayError::ProviderUnavailable("x".into()),
            GatewayError::CompletionTimeout(30),
            GatewayError::ToolTimeout { tool: "t".into() },
            GatewayError::ToolInvocation { tool: "t".into(), message: "m".into() },
            GatewayError::MalformedArguments { tool: "t".into(), message: "m".into() },
            GatewayError::IterationLimitExceeded(10),
            GatewayError::UnexpectedFinishState("length".into()),
            GatewayError::Bridge("b".into()),
        ];
        let mut codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_tool_errors_carry_tool_name() {
        let err = GatewayError::ToolInvocation {
            tool: "sql_query_db".into(),
            message: "unknown tool".into(),
        };
        assert!(err.to_string().contains("sql_query_db"));
    }
}
