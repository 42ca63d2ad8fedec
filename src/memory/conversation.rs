//! 对话消息
//!
//! 与 OpenAI chat 格式一一对应：user / assistant / tool / system；assistant 可携带 tool_calls 引用，
//! tool 消息通过 tool_call_id 回指发起调用。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::System => "system",
        }
    }
}

/// assistant 消息中记录的工具调用（参数保留模型给出的原始 JSON 文本）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRef {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn plain(role: Role, content: String) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content.into())
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content.into())
    }

    /// assistant 占位消息：只引用本轮请求的工具调用
    pub fn assistant_tool_calls(calls: Vec<ToolCallRef>) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            tool_calls: calls,
            tool_call_id: None,
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    /// 转为 chat/completions 请求中的 message 对象
    pub fn to_api_json(&self) -> Value {
        let mut obj = json!({ "role": self.role.as_str() });
        if self.role == Role::Assistant && !self.tool_calls.is_empty() && self.content.is_empty() {
            obj["content"] = Value::Null;
        } else {
            obj["content"] = Value::String(self.content.clone());
        }
        if !self.tool_calls.is_empty() {
            obj["tool_calls"] = Value::Array(
                self.tool_calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": { "name": c.name, "arguments": c.arguments }
                        })
                    })
                    .collect(),
            );
        }
        if let Some(id) = &self.tool_call_id {
            obj["tool_call_id"] = Value::String(id.clone());
        }
        obj
    }
}

/// 送入 LLM 的历史窗口：取最近 max 条，且窗口不以孤立的 tool 消息开头
///
/// 窗口内有 user 消息时从第一条 user 开始；没有时（单轮的工具往返超过上限）从最后一条 user 开始，
/// 即使超出上限，当前问题也必须在窗口内。历史中没有 user 时向前退到发起调用的 assistant。
pub fn prompt_window(history: &[Message], max: usize) -> &[Message] {
    if max == 0 || history.len() <= max {
        return history;
    }
    let start = history.len() - max;
    if let Some(offset) = history[start..].iter().position(|m| m.role == Role::User) {
        return &history[start + offset..];
    }
    if let Some(last_user) = history.iter().rposition(|m| m.role == Role::User) {
        return &history[last_user..];
    }
    let mut begin = start;
    while begin > 0 && history[begin].role == Role::Tool {
        begin -= 1;
    }
    &history[begin..]
}
