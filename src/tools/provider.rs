//! 工具服务抽象：列举能力、按调用方式执行、建连重试
//!
//! ToolProvider 只负责原始的 MCP 语义（tools/list、tools/call、resources/read 等，结果为原始 JSON）；
//! 本模块在其上提供 list_capabilities（空列表轮询）、invoke（错误一律转为 ToolCallResult）、
//! 以及 ProviderHandle（连接失效后下次请求时惰性重连）。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::tools::descriptor::{Artifact, InvocationKind, ToolCallRequest, ToolCallResult, ToolDescriptor};
use crate::tools::template::UriTemplate;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("failed to spawn tool provider: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("tool provider transport error: {0}")]
    Transport(String),

    #[error("tool provider returned invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("tool provider returned JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("tool provider terminated unexpectedly")]
    Terminated,

    #[error("tool provider request timed out: {0}")]
    Timeout(String),

    #[error("tool provider unavailable after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: String },
}

/// 三类能力的原始元数据，逐项反序列化交给注册表
#[derive(Debug, Clone, Default)]
pub struct CapabilityListing {
    pub tools: Vec<Value>,
    pub resources: Vec<Value>,
    pub resource_templates: Vec<Value>,
}

impl CapabilityListing {
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.resources.is_empty() && self.resource_templates.is_empty()
    }
}

/// 一个已建立的工具服务连接
#[async_trait]
pub trait ToolProvider: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<Value>, ProviderError>;

    async fn list_resources(&self) -> Result<Vec<Value>, ProviderError>;

    async fn list_resource_templates(&self) -> Result<Vec<Value>, ProviderError>;

    /// arguments 为 None 时不带参数调用
    async fn call_tool(&self, name: &str, arguments: Option<Map<String, Value>>) -> Result<Value, ProviderError>;

    async fn read_resource(&self, uri: &str) -> Result<Value, ProviderError>;

    /// 连接是否仍可用；失效的连接会在下次请求时被替换
    fn is_alive(&self) -> bool {
        true
    }

    /// 释放连接占用的资源（子进程等）；之后该连接不再可用
    async fn shutdown(&self) {}
}

/// 建立新连接（每次调用得到一个新的 ToolProvider）
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn ToolProvider>, ProviderError>;
}

/// 按 policy 重试建连，耗尽后返回 Unavailable
pub async fn connect_with_retry(
    connector: &dyn ProviderConnector,
    policy: &RetryPolicy,
) -> Result<Arc<dyn ToolProvider>, ProviderError> {
    let attempts = policy.connect_attempts.max(1);
    let mut last = String::new();
    for attempt in 1..=attempts {
        info!(attempt, attempts, "Connecting to tool provider");
        match connector.connect().await {
            Ok(provider) => return Ok(provider),
            Err(e) => {
                warn!(attempt, attempts, error = %e, "Tool provider connection attempt failed");
                last = e.to_string();
                if attempt < attempts {
                    tokio::time::sleep(policy.connect_backoff).await;
                }
            }
        }
    }
    Err(ProviderError::Unavailable { attempts, last })
}

/// 列举三类能力；全为空时按 policy 轮询（服务可能仍在启动）
pub async fn list_capabilities(
    provider: &dyn ToolProvider,
    policy: &RetryPolicy,
) -> Result<CapabilityListing, ProviderError> {
    let mut polls = 0;
    loop {
        let listing = tokio::time::timeout(policy.list_timeout, async {
            Ok::<_, ProviderError>(CapabilityListing {
                tools: provider.list_tools().await?,
                resources: provider.list_resources().await?,
                resource_templates: provider.list_resource_templates().await?,
            })
        })
        .await
        .map_err(|_| ProviderError::Timeout("capability listing".to_string()))??;

        if !listing.is_empty() || polls >= policy.empty_list_polls {
            return Ok(listing);
        }
        polls += 1;
        debug!(poll = polls, "Tool provider returned no capabilities yet, polling again");
        tokio::time::sleep(policy.empty_list_backoff).await;
    }
}

/// 持有当前连接；失效时（或从未连上）在下次 acquire 时重连
pub struct ProviderHandle {
    connector: Arc<dyn ProviderConnector>,
    policy: RetryPolicy,
    current: Mutex<Option<Arc<dyn ToolProvider>>>,
}

impl ProviderHandle {
    pub fn new(connector: Arc<dyn ProviderConnector>, policy: RetryPolicy) -> Self {
        Self {
            connector,
            policy,
            current: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn acquire(&self) -> Result<Arc<dyn ToolProvider>, ProviderError> {
        let mut current = self.current.lock().await;
        if let Some(provider) = current.as_ref() {
            if provider.is_alive() {
                return Ok(Arc::clone(provider));
            }
            warn!("Tool provider connection is dead, reconnecting");
        }
        if let Some(stale) = current.take() {
            stale.shutdown().await;
        }
        let provider = connect_with_retry(self.connector.as_ref(), &self.policy).await?;
        *current = Some(Arc::clone(&provider));
        Ok(provider)
    }

    /// 关闭并丢弃当前连接（列举失败后调用，下次请求重连）
    pub async fn invalidate(&self) {
        let stale = self.current.lock().await.take();
        if let Some(provider) = stale {
            provider.shutdown().await;
        }
    }
}

async fn dispatch(
    provider: &dyn ToolProvider,
    descriptor: &ToolDescriptor,
    call: &ToolCallRequest,
) -> Result<Value, String> {
    match descriptor.kind {
        InvocationKind::Tool => {
            let arguments = if call.arguments.is_empty() {
                None
            } else {
                Some(call.arguments.clone())
            };
            provider
                .call_tool(&descriptor.target, arguments)
                .await
                .map_err(|e| e.to_string())
        }
        InvocationKind::Resource => provider
            .read_resource(&descriptor.target)
            .await
            .map_err(|e| e.to_string()),
        InvocationKind::ResourceTemplate => {
            let template = UriTemplate::parse(&descriptor.target).map_err(|e| e.to_string())?;
            let uri = template.expand(&call.arguments).map_err(|e| e.to_string())?;
            debug!(template = %descriptor.target, uri = %uri, "Expanded resource template");
            provider.read_resource(&uri).await.map_err(|e| e.to_string())
        }
    }
}

/// 按调用方式执行；任何失败都转为带错误载荷的 ToolCallResult，不向上抛
pub async fn invoke(
    provider: &dyn ToolProvider,
    descriptor: &ToolDescriptor,
    call: &ToolCallRequest,
) -> ToolCallResult {
    match dispatch(provider, descriptor, call).await {
        Ok(raw) => into_call_result(&call.id, &descriptor.name, &raw),
        Err(e) => {
            warn!(tool = %descriptor.name, kind = %descriptor.kind, error = %e, "Tool invocation failed");
            ToolCallResult::error(&call.id, e)
        }
    }
}

/// 把 tools/call 或 resources/read 的原始结果转为 ToolCallResult
///
/// 文本拼接后回灌给模型；第一个图片 / blob 被剥离为 artifact，原位置换成简短确认。
pub fn into_call_result(call_id: &str, tool_name: &str, raw: &Value) -> ToolCallResult {
    let items = raw
        .get("content")
        .or_else(|| raw.get("contents"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut texts = Vec::new();
    let mut artifact: Option<Artifact> = None;
    for item in &items {
        collect_item(item, tool_name, &mut texts, &mut artifact);
    }

    if texts.is_empty() {
        if let Some(structured) = raw.get("structuredContent") {
            texts.push(structured.to_string());
        } else if items.is_empty() && !raw.is_null() {
            texts.push(raw.to_string());
        }
    }

    let content = texts.join("\n");
    let is_error = raw.get("isError").and_then(Value::as_bool).unwrap_or(false);
    let mut result = if is_error {
        ToolCallResult::error(call_id, content)
    } else {
        ToolCallResult::ok(call_id, content)
    };
    result.artifact = artifact;
    result
}

fn collect_item(item: &Value, tool_name: &str, texts: &mut Vec<String>, artifact: &mut Option<Artifact>) {
    let mime = item
        .get("mimeType")
        .and_then(Value::as_str)
        .unwrap_or("application/octet-stream");

    if let Some(text) = item.get("text").and_then(Value::as_str) {
        texts.push(detach_embedded_image(text, tool_name, artifact));
        return;
    }

    let binary = match item.get("type").and_then(Value::as_str) {
        Some("image") | Some("audio") => item.get("data").and_then(Value::as_str),
        Some("resource") => {
            if let Some(inner) = item.get("resource") {
                collect_item(inner, tool_name, texts, artifact);
            }
            return;
        }
        _ => item.get("blob").and_then(Value::as_str),
    };

    match binary {
        Some(data) => texts.push(attach(tool_name, mime, data, artifact)),
        None => texts.push(item.to_string()),
    }
}

fn attach(tool_name: &str, mime: &str, data: &str, slot: &mut Option<Artifact>) -> String {
    let candidate = Artifact {
        tool_name: tool_name.to_string(),
        mime_type: mime.to_string(),
        data: data.to_string(),
    };
    let confirmation = candidate.confirmation();
    if slot.is_none() {
        *slot = Some(candidate);
        confirmation
    } else {
        // 每个结果只带一个附件，多余的只保留确认文本
        format!("[additional {} output omitted]", mime)
    }
}

/// 文本本身是带 image_base64 的 JSON 对象时（画图工具的常见返回），同样剥离
fn detach_embedded_image(text: &str, tool_name: &str, slot: &mut Option<Artifact>) -> String {
    let Ok(Value::Object(mut obj)) = serde_json::from_str::<Value>(text) else {
        return text.to_string();
    };
    let Some(Value::String(data)) = obj.remove("image_base64") else {
        return text.to_string();
    };
    let mime = obj
        .get("mime_type")
        .and_then(Value::as_str)
        .unwrap_or("image/png")
        .to_string();
    let confirmation = attach(tool_name, &mime, &data, slot);
    obj.insert("image".to_string(), Value::String(confirmation));
    Value::Object(obj).to_string()
}

/// 测试与本地调试时缩短重试节奏
pub fn fast_retry_policy() -> RetryPolicy {
    RetryPolicy {
        connect_attempts: 3,
        connect_backoff: Duration::from_millis(10),
        empty_list_polls: 2,
        empty_list_backoff: Duration::from_millis(10),
        list_timeout: Duration::from_secs(2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::mock::{MockBehaviour, MockConnector, MockToolProvider};
    use serde_json::json;

    fn descriptor(name: &str, target: &str, kind: InvocationKind) -> ToolDescriptor {
        ToolDescriptor {
            name: name.into(),
            target: target.into(),
            kind,
            argument_schema: json!({"type": "object"}),
            description: String::new(),
        }
    }

    fn call(args: Value) -> ToolCallRequest {
        ToolCallRequest {
            id: "call_1".into(),
            name: "x".into(),
            arguments: args.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_image_content_is_detached() {
        let raw = json!({
            "content": [
                { "type": "text", "text": "Biểu đồ doanh thu" },
                { "type": "image", "data": "aGVsbG8gd29ybGQh", "mimeType": "image/png" }
            ]
        });
        let r = into_call_result("c1", "create_chart", &raw);
        assert!(!r.is_error);
        assert!(!r.content.contains("aGVsbG8gd29ybGQh"));
        assert!(r.content.contains("image/png"));
        let artifact = r.artifact.unwrap();
        assert_eq!(artifact.tool_name, "create_chart");
        assert_eq!(artifact.data, "aGVsbG8gd29ybGQh");
    }

    #[test]
    fn test_embedded_base64_in_text_is_detached() {
        let text = json!({ "title": "Revenue", "image_base64": "QUJDRA==" }).to_string();
        let raw = json!({ "content": [{ "type": "text", "text": text }] });
        let r = into_call_result("c1", "create_chart", &raw);
        assert!(!r.content.contains("QUJDRA=="));
        assert!(r.content.contains("Revenue"));
        assert_eq!(r.artifact.unwrap().mime_type, "image/png");
    }

    #[test]
    fn test_is_error_flag_is_respected() {
        let raw = json!({ "content": [{ "type": "text", "text": "table not found" }], "isError": true });
        let r = into_call_result("c1", "sql_query_db", &raw);
        assert!(r.is_error);
        assert!(r.content.contains("table not found"));
    }

    #[test]
    fn test_resource_blob_is_detached() {
        let raw = json!({ "contents": [{ "uri": "file://a.pdf", "mimeType": "application/pdf", "blob": "JVBERi0=" }] });
        let r = into_call_result("c1", "file_a_pdf", &raw);
        assert_eq!(r.artifact.unwrap().mime_type, "application/pdf");
    }

    #[tokio::test]
    async fn test_invoke_tool_without_arguments_sends_none() {
        let provider = MockToolProvider::new().with_tool("list_databases", "List databases", json!({}));
        let d = descriptor("list_databases", "list_databases", InvocationKind::Tool);
        let r = invoke(&provider, &d, &call(json!({}))).await;
        assert!(!r.is_error);
        let calls = provider.invocations();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].arguments.is_none());
    }

    #[tokio::test]
    async fn test_invoke_template_builds_uri_in_declaration_order() {
        let provider = MockToolProvider::new();
        let d = descriptor("schema_db_table", "schema://{db}/{table}", InvocationKind::ResourceTemplate);
        invoke(&provider, &d, &call(json!({ "table": "orders", "db": "sales" }))).await;
        assert_eq!(provider.invocations()[0].target, "schema://sales/orders");
    }

    #[tokio::test]
    async fn test_invoke_failure_becomes_error_result() {
        let provider = MockToolProvider::new()
            .with_tool("sql_query_db", "Run SQL", json!({}))
            .respond("sql_query_db", MockBehaviour::Fail("connection refused".into()));
        let d = descriptor("sql_query_db", "sql_query_db", InvocationKind::Tool);
        let r = invoke(&provider, &d, &call(json!({ "query": "select 1" }))).await;
        assert!(r.is_error);
        assert!(r.content.contains("connection refused"));
        assert_eq!(r.call_id, "call_1");
    }

    #[tokio::test]
    async fn test_missing_template_argument_becomes_error_result() {
        let provider = MockToolProvider::new();
        let d = descriptor("schema_db", "schema://{db}", InvocationKind::ResourceTemplate);
        let r = invoke(&provider, &d, &call(json!({}))).await;
        assert!(r.is_error);
        assert!(r.content.contains("missing argument 'db'"));
        assert!(provider.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_connect_with_retry_gives_up() {
        let connector = MockConnector::new(Arc::new(MockToolProvider::new()));
        connector.fail_next(5);
        let err = connect_with_retry(&connector, &fast_retry_policy()).await.err().unwrap();
        assert!(matches!(err, ProviderError::Unavailable { attempts: 3, .. }));
        assert_eq!(connector.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_connect_with_retry_recovers() {
        let connector = MockConnector::new(Arc::new(MockToolProvider::new()));
        connector.fail_next(2);
        assert!(connect_with_retry(&connector, &fast_retry_policy()).await.is_ok());
        assert_eq!(connector.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_empty_listing_is_polled() {
        let provider = MockToolProvider::new();
        let listing = list_capabilities(&provider, &fast_retry_policy()).await.unwrap();
        assert!(listing.is_empty());
        // 首次 + 2 次轮询
        assert_eq!(provider.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_handle_reconnects_dead_provider() {
        let provider = Arc::new(MockToolProvider::new().with_tool("t", "", json!({})));
        let connector = Arc::new(MockConnector::new(Arc::clone(&provider)));
        let handle = ProviderHandle::new(connector.clone(), fast_retry_policy());
        handle.acquire().await.unwrap();
        handle.acquire().await.unwrap();
        assert_eq!(connector.connect_attempts(), 1);

        provider.set_alive(false);
        handle.acquire().await.unwrap();
        assert_eq!(connector.connect_attempts(), 2);
        assert_eq!(provider.shutdown_calls(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_shuts_down_connection() {
        let provider = Arc::new(MockToolProvider::new().with_tool("t", "", json!({})));
        let connector = Arc::new(MockConnector::new(Arc::clone(&provider)));
        let handle = ProviderHandle::new(connector.clone(), fast_retry_policy());
        handle.acquire().await.unwrap();

        handle.invalidate().await;
        assert_eq!(provider.shutdown_calls(), 1);
        assert!(!provider.is_alive());

        // 已经没有连接时不会重复关闭
        handle.invalidate().await;
        assert_eq!(provider.shutdown_calls(), 1);
    }
}
