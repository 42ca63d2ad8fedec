//! 网关消息协议定义
//!
//! TCP 上按行分隔的 JSON：每行一个请求对象，每个请求对应一行响应。
//! 请求：`{"type":"chat","conversationId","message","username"}` 或 `{"type":"system","command",...}`；
//! 响应：`{"status":"success"|"error", "content"?, "error"?, "code"?, "artifacts"?, ..., "timestamp"}`。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::GatewayError;
use crate::tools::Artifact;

/// 聊天请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub conversation_id: String,
    pub message: String,
    pub username: String,
}

/// 系统命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemCommand {
    Health,
    Stats,
    ClearHistory { conversation_id: Option<String> },
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Chat(ChatRequest),
    System(SystemCommand),
}

/// 解析失败：连接保持打开，返回结构化错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("Invalid JSON format")]
    InvalidJson,

    #[error("Invalid character encoding")]
    InvalidEncoding,

    #[error("Missing conversationId or message")]
    MissingFields,

    #[error("Unknown request type: {0}")]
    UnknownType(String),
}

impl RequestError {
    pub fn code(&self) -> &'static str {
        match self {
            RequestError::InvalidJson => "invalid_json",
            RequestError::InvalidEncoding => "invalid_encoding",
            RequestError::MissingFields => "missing_fields",
            RequestError::UnknownType(_) => "unknown_request_type",
        }
    }
}

fn non_empty_str(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(String::from)
}

/// 解析一行请求
pub fn parse_request(line: &str) -> Result<Request, RequestError> {
    let value: Value = serde_json::from_str(line).map_err(|_| RequestError::InvalidJson)?;
    let obj = value.as_object().ok_or(RequestError::InvalidJson)?;

    match obj.get("type").and_then(Value::as_str) {
        Some("chat") => {
            let conversation_id = non_empty_str(obj, &["conversationId"]);
            let message = obj
                .get("message")
                .and_then(Value::as_str)
                .filter(|m| !m.trim().is_empty());
            match (conversation_id, message) {
                (Some(conversation_id), Some(message)) => Ok(Request::Chat(ChatRequest {
                    conversation_id,
                    message: message.to_string(),
                    username: non_empty_str(obj, &["username"]).unwrap_or_else(|| "User".to_string()),
                })),
                _ => Err(RequestError::MissingFields),
            }
        }
        Some("system") => {
            let command = obj.get("command").and_then(Value::as_str).unwrap_or_default();
            Ok(Request::System(match command {
                "health" => SystemCommand::Health,
                "stats" => SystemCommand::Stats,
                "clear_history" => SystemCommand::ClearHistory {
                    conversation_id: non_empty_str(obj, &["conversation_id", "conversationId"]),
                },
                other => SystemCommand::Unknown(other.to_string()),
            }))
        }
        Some(other) => Err(RequestError::UnknownType(other.to_string())),
        None => Err(RequestError::UnknownType(
            obj.get("type").map(Value::to_string).unwrap_or_else(|| "missing".to_string()),
        )),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// 一行响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
    /// 系统命令附带的字段（health / stats 等）
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    pub timestamp: String,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl Response {
    fn empty(status: Status) -> Self {
        Self {
            status,
            content: None,
            error: None,
            code: None,
            artifacts: Vec::new(),
            extra: Map::new(),
            timestamp: now(),
        }
    }

    pub fn success(content: impl Into<String>) -> Self {
        let mut r = Self::empty(Status::Success);
        r.content = Some(content.into());
        r
    }

    pub fn with_artifacts(mut self, artifacts: Vec<Artifact>) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// 只带附加字段的成功响应（系统命令）
    pub fn fields(extra: Map<String, Value>) -> Self {
        let mut r = Self::empty(Status::Success);
        r.extra = extra;
        r
    }

    pub fn error(message: impl Into<String>, code: impl Into<String>) -> Self {
        let mut r = Self::empty(Status::Error);
        r.error = Some(message.into());
        r.code = Some(code.into());
        r
    }

    pub fn from_gateway_error(e: &GatewayError) -> Self {
        Self::error(e.to_string(), e.code())
    }

    pub fn from_request_error(e: &RequestError) -> Self {
        Self::error(e.to_string(), e.code())
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// 序列化为一行（不含换行符）
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"status":"error","error":"Failed to encode response: {}","code":"processing_failed","timestamp":"{}"}}"#,
                e.to_string().replace('"', "'"),
                now()
            )
        })
    }
}
