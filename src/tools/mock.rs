//! 进程内工具服务（用于测试，无需真实子进程）
//!
//! 能力列表与每个目标的响应方式都可预设；记录每次调用（目标、参数）与完成顺序，便于断言扇出行为。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::tools::descriptor::InvocationKind;
use crate::tools::provider::{ProviderConnector, ProviderError, ToolProvider};

/// 某个目标（工具名或资源 URI）的响应方式
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// 以文本内容返回
    Text(String),
    /// 原样返回 MCP 结果 JSON
    Raw(Value),
    /// 传输层失败
    Fail(String),
    /// 延迟后返回文本（用于乱序完成）
    Delay(Duration, String),
    /// 卡住（用于超时测试）
    Hang,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MockInvocation {
    pub target: String,
    pub kind: InvocationKind,
    pub arguments: Option<Map<String, Value>>,
}

#[derive(Debug, Default)]
pub struct MockToolProvider {
    tools: Vec<Value>,
    resources: Vec<Value>,
    templates: Vec<Value>,
    behaviours: Mutex<HashMap<String, MockBehaviour>>,
    invocations: Mutex<Vec<MockInvocation>>,
    completions: Mutex<Vec<String>>,
    list_calls: AtomicU32,
    shutdown_calls: AtomicU32,
    unreachable: AtomicBool,
    dead: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockToolProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, name: &str, description: &str, input_schema: Value) -> Self {
        self.tools.push(json!({
            "name": name,
            "description": description,
            "inputSchema": input_schema,
        }));
        self
    }

    pub fn with_resource(mut self, uri: &str, name: &str, description: &str) -> Self {
        self.resources.push(json!({ "uri": uri, "name": name, "description": description }));
        self
    }

    pub fn with_template(mut self, uri_template: &str, name: &str, description: &str) -> Self {
        self.templates.push(json!({
            "uriTemplate": uri_template,
            "name": name,
            "description": description,
        }));
        self
    }

    /// 直接追加一条原始元数据（可用于构造坏条目）
    pub fn with_raw_tool(mut self, raw: Value) -> Self {
        self.tools.push(raw);
        self
    }

    pub fn respond(self, target: &str, behaviour: MockBehaviour) -> Self {
        lock(&self.behaviours).insert(target.to_string(), behaviour);
        self
    }

    pub fn set_behaviour(&self, target: &str, behaviour: MockBehaviour) {
        lock(&self.behaviours).insert(target.to_string(), behaviour);
    }

    /// 列举请求全部失败，模拟服务不可达
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_alive(&self, alive: bool) {
        self.dead.store(!alive, Ordering::SeqCst);
    }

    pub fn invocations(&self) -> Vec<MockInvocation> {
        lock(&self.invocations).clone()
    }

    /// 调用完成的先后顺序（目标名）
    pub fn completion_order(&self) -> Vec<String> {
        lock(&self.completions).clone()
    }

    pub fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn shutdown_calls(&self) -> u32 {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<(), ProviderError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(ProviderError::Transport("mock provider unreachable".to_string()))
        } else {
            Ok(())
        }
    }

    async fn run(
        &self,
        target: &str,
        kind: InvocationKind,
        arguments: Option<Map<String, Value>>,
    ) -> Result<Value, ProviderError> {
        lock(&self.invocations).push(MockInvocation {
            target: target.to_string(),
            kind,
            arguments: arguments.clone(),
        });
        let behaviour = lock(&self.behaviours).get(target).cloned();

        let text = match behaviour {
            None => json!({ "ok": true, "target": target, "arguments": arguments }).to_string(),
            Some(MockBehaviour::Text(t)) => t,
            Some(MockBehaviour::Raw(v)) => {
                lock(&self.completions).push(target.to_string());
                return Ok(v);
            }
            Some(MockBehaviour::Fail(e)) => return Err(ProviderError::Transport(e)),
            Some(MockBehaviour::Delay(d, t)) => {
                tokio::time::sleep(d).await;
                t
            }
            Some(MockBehaviour::Hang) => {
                std::future::pending::<()>().await;
                String::new()
            }
        };
        lock(&self.completions).push(target.to_string());

        Ok(match kind {
            InvocationKind::Tool => json!({ "content": [{ "type": "text", "text": text }], "isError": false }),
            _ => json!({ "contents": [{ "uri": target, "mimeType": "text/plain", "text": text }] }),
        })
    }
}

#[async_trait]
impl ToolProvider for MockToolProvider {
    async fn list_tools(&self) -> Result<Vec<Value>, ProviderError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        Ok(self.tools.clone())
    }

    async fn list_resources(&self) -> Result<Vec<Value>, ProviderError> {
        self.check_reachable()?;
        Ok(self.resources.clone())
    }

    async fn list_resource_templates(&self) -> Result<Vec<Value>, ProviderError> {
        self.check_reachable()?;
        Ok(self.templates.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Option<Map<String, Value>>) -> Result<Value, ProviderError> {
        self.run(name, InvocationKind::Tool, arguments).await
    }

    async fn read_resource(&self, uri: &str) -> Result<Value, ProviderError> {
        self.run(uri, InvocationKind::Resource, None).await
    }

    fn is_alive(&self) -> bool {
        !self.dead.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        self.dead.store(true, Ordering::SeqCst);
    }
}

/// 每次 connect 都交出同一个 MockToolProvider；可预设前 N 次失败
pub struct MockConnector {
    provider: Arc<MockToolProvider>,
    failures_remaining: AtomicU32,
    attempts: AtomicU32,
}

impl MockConnector {
    pub fn new(provider: Arc<MockToolProvider>) -> Self {
        Self {
            provider,
            failures_remaining: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn provider(&self) -> Arc<MockToolProvider> {
        Arc::clone(&self.provider)
    }
}

#[async_trait]
impl ProviderConnector for MockConnector {
    async fn connect(&self) -> Result<Arc<dyn ToolProvider>, ProviderError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::Transport("connection refused".to_string()));
        }
        // 新连接总是存活的
        self.provider.set_alive(true);
        Ok(self.provider.clone() as Arc<dyn ToolProvider>)
    }
}
