//! 脚本化 LLM 客户端（用于测试，无需 API）
//!
//! 按顺序返回预先排好的 Completion，并记录每次调用收到的消息与工具 schema，便于断言。

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::llm::{Completion, CompletionClient, LlmError};
use crate::memory::Message;

/// 一步脚本
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Reply(Completion),
    Fail(String),
    /// 模拟卡住的端点（用于超时测试）
    Hang(Duration),
}

/// 一次调用的快照
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<Message>,
    pub tools: Vec<Value>,
}

/// 脚本耗尽后一律回答 "(script exhausted)"
#[derive(Debug, Default)]
pub struct ScriptedCompletionClient {
    steps: Mutex<VecDeque<ScriptStep>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedCompletionClient {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn replies(replies: impl IntoIterator<Item = Completion>) -> Self {
        Self::new(replies.into_iter().map(ScriptStep::Reply))
    }

    pub async fn push(&self, step: ScriptStep) {
        self.steps.lock().await.push_back(step);
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletionClient {
    async fn complete(&self, messages: &[Message], tools: &[Value]) -> Result<Completion, LlmError> {
        self.calls.lock().await.push(RecordedCall {
            messages: messages.to_vec(),
            tools: tools.to_vec(),
        });

        let step = self.steps.lock().await.pop_front();
        match step {
            Some(ScriptStep::Reply(c)) => Ok(c),
            Some(ScriptStep::Fail(e)) => Err(LlmError::Api(e)),
            Some(ScriptStep::Hang(d)) => {
                tokio::time::sleep(d).await;
                Ok(Completion::stop("(late)"))
            }
            None => Ok(Completion::stop("(script exhausted)")),
        }
    }
}
