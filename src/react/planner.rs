//! Planner：拼装 system 提示并调用 LLM
//!
//! system 提示 = 基础说明 + 当前上下文段落 + （可选）画图请求的取数顺序说明。
//! 每次调用都有超时；超时与端点错误统一映射为 GatewayError。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::core::GatewayError;
use crate::llm::{Completion, CompletionClient};
use crate::memory::{Context, Message};

pub const BASE_SYSTEM_PROMPT: &str = "You are a helpful assistant. Your job is to assist the user by all means possible.\n\
Format your answers with newlines, lists and tables where they help readability.\n\
Use the available tools to look up real data instead of guessing.\n";

const CHART_SECTION: &str = "## Chart Requests\n\
The user wants a chart. First retrieve the data with a data tool (SQL query, schema lookup or document search), \
then call the chart tool with the retrieved data. Never call the chart tool before the data has been retrieved.\n";

/// Planner：持有 LLM 与单次调用超时
pub struct Planner {
    llm: Arc<dyn CompletionClient>,
    completion_timeout: Duration,
}

impl Planner {
    pub fn new(llm: Arc<dyn CompletionClient>, completion_timeout: Duration) -> Self {
        Self {
            llm,
            completion_timeout,
        }
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    pub fn build_preamble(&self, context: Option<&Context>, chart_intent: bool) -> String {
        let mut s = String::from(BASE_SYSTEM_PROMPT);
        if let Some(ctx) = context {
            s.push('\n');
            s.push_str(&ctx.to_prompt_section());
        }
        if chart_intent {
            s.push('\n');
            s.push_str(CHART_SECTION);
        }
        s
    }

    /// 发送 system + 历史窗口 + 工具 schema
    pub async fn plan(&self, preamble: &str, history: &[Message], tools: &[Value]) -> Result<Completion, GatewayError> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(Message::system(preamble));
        messages.extend_from_slice(history);

        match tokio::time::timeout(self.completion_timeout, self.llm.complete(&messages, tools)).await {
            Ok(Ok(completion)) => Ok(completion),
            Ok(Err(e)) => {
                warn!(error = %e, "LLM completion failed");
                Err(GatewayError::ProviderUnavailable(e.to_string()))
            }
            Err(_) => Err(GatewayError::CompletionTimeout(self.completion_timeout.as_secs())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ScriptStep, ScriptedCompletionClient};

    #[test]
    fn test_preamble_sections() {
        let planner = Planner::new(Arc::new(ScriptedCompletionClient::default()), Duration::from_secs(1));
        let plain = planner.build_preamble(None, false);
        assert!(!plain.contains("Current Context"));
        assert!(!plain.contains("Chart Requests"));

        let full = planner.build_preamble(Some(&Context::database("sales")), true);
        assert!(full.contains("`sales`"));
        assert!(full.contains("Chart Requests"));
    }

    #[tokio::test]
    async fn test_plan_prepends_system_message() {
        let llm = Arc::new(ScriptedCompletionClient::replies([Completion::stop("ok")]));
        let planner = Planner::new(llm.clone(), Duration::from_secs(1));
        planner
            .plan("SYSTEM", &[Message::user("hi")], &[])
            .await
            .unwrap();
        let calls = llm.calls().await;
        assert_eq!(calls[0].messages[0], Message::system("SYSTEM"));
        assert_eq!(calls[0].messages[1], Message::user("hi"));
    }

    #[tokio::test]
    async fn test_plan_timeout() {
        let llm = Arc::new(ScriptedCompletionClient::new([ScriptStep::Hang(Duration::from_secs(5))]));
        let planner = Planner::new(llm, Duration::from_millis(50));
        let err = planner.plan("s", &[], &[]).await.unwrap_err();
        assert_eq!(err, GatewayError::CompletionTimeout(0));
    }

    #[tokio::test]
    async fn test_plan_endpoint_error() {
        let llm = Arc::new(ScriptedCompletionClient::new([ScriptStep::Fail("503".into())]));
        let planner = Planner::new(llm, Duration::from_secs(1));
        let err = planner.plan("s", &[], &[]).await.unwrap_err();
        assert_eq!(err.code(), "provider_unavailable");
    }
}
