//! 工具描述、调用请求与调用结果
//!
//! ToolCallRequest 在分发前已把参数解析为键值映射；ToolCallResult 显式携带 is_error，
//! 大体积附件（图片等）单独放在 artifact 中，不回灌给模型。

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::llm::RequestedToolCall;

/// 调用方式：工具 / 资源 / 资源模板
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationKind {
    Tool,
    Resource,
    ResourceTemplate,
}

impl std::fmt::Display for InvocationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvocationKind::Tool => write!(f, "tool"),
            InvocationKind::Resource => write!(f, "resource"),
            InvocationKind::ResourceTemplate => write!(f, "resource_template"),
        }
    }
}

/// 注册表中的一项
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    /// 暴露给 LLM 的函数名，在合并后的注册表中唯一
    pub name: String,
    /// 实际调用目标：工具名 / 资源 URI / 资源 URI 模板
    pub target: String,
    pub kind: InvocationKind,
    pub argument_schema: Value,
    pub description: String,
}

impl ToolDescriptor {
    /// OpenAI function-calling 格式
    pub fn to_function_schema(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.argument_schema,
            }
        })
    }
}

/// 分发前的工具调用：参数一定是对象
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

impl ToolCallRequest {
    /// 解析模型给出的参数文本；空串视为无参数，非对象视为格式错误
    pub fn from_requested(call: &RequestedToolCall) -> Result<Self, String> {
        let raw = call.arguments_json.trim();
        let arguments = if raw.is_empty() {
            Map::new()
        } else {
            match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => map,
                Ok(Value::Null) => Map::new(),
                Ok(other) => return Err(format!("arguments must be a JSON object, got {}", other)),
                Err(e) => return Err(format!("invalid JSON arguments: {}", e)),
            }
        };
        Ok(Self {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments,
        })
    }
}

/// 从结果中剥离的大体积附件（base64 数据）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub tool_name: String,
    pub mime_type: String,
    pub data: String,
}

impl Artifact {
    /// base64 解码后的近似字节数
    pub fn approx_bytes(&self) -> usize {
        self.data.len() / 4 * 3
    }

    /// 替代附件回灌给模型的简短确认
    pub fn confirmation(&self) -> String {
        format!(
            "[{} artifact attached ({} bytes); it will be delivered to the user with the final answer]",
            self.mime_type,
            self.approx_bytes()
        )
    }
}

/// 一次工具调用的结果
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    pub call_id: String,
    /// 回灌给模型的文本
    pub content: String,
    pub is_error: bool,
    pub artifact: Option<Artifact>,
}

impl ToolCallResult {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
            artifact: None,
        }
    }

    /// 结构化错误载荷：{"error": "..."}
    pub fn error(call_id: impl Into<String>, message: impl AsRef<str>) -> Self {
        Self {
            call_id: call_id.into(),
            content: json!({ "error": message.as_ref() }).to_string(),
            is_error: true,
            artifact: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requested(args: &str) -> RequestedToolCall {
        RequestedToolCall {
            id: "call_1".into(),
            name: "sql_query_db".into(),
            arguments_json: args.into(),
        }
    }

    #[test]
    fn test_empty_arguments_become_empty_map() {
        let req = ToolCallRequest::from_requested(&requested("")).unwrap();
        assert!(req.arguments.is_empty());
    }

    #[test]
    fn test_non_object_arguments_are_rejected() {
        assert!(ToolCallRequest::from_requested(&requested("[1,2]")).is_err());
        assert!(ToolCallRequest::from_requested(&requested("{\"query\":")).is_err());
    }

    #[test]
    fn test_error_result_is_structured() {
        let r = ToolCallResult::error("c", "boom");
        assert!(r.is_error);
        let v: Value = serde_json::from_str(&r.content).unwrap();
        assert_eq!(v["error"], "boom");
    }
}
