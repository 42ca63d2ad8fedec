//! MCP stdio 工具服务客户端
//!
//! 以子进程方式启动工具服务，通过 stdin/stdout 交换按行分隔的 JSON-RPC 2.0 消息：
//! 发送请求时登记 oneshot，后台 reader 任务按 id 分发响应；服务端的 ping 请求直接应答。
//! 进程退出（stdout 关闭）后连接标记为失效，所有在途请求以 Terminated 失败，下次请求由 ProviderHandle 重连。

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::config::ProviderSection;
use crate::tools::provider::{ProviderConnector, ProviderError, ToolProvider};

const PROTOCOL_VERSION: &str = "2025-06-18";

/// 分页列举的最大页数
const MAX_LIST_PAGES: usize = 50;

type PendingMap = HashMap<String, oneshot::Sender<Result<Value, ProviderError>>>;

/// 按 [provider] 配置启动子进程
pub struct McpStdioConnector {
    settings: ProviderSection,
}

impl McpStdioConnector {
    pub fn new(settings: ProviderSection) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl ProviderConnector for McpStdioConnector {
    async fn connect(&self) -> Result<Arc<dyn ToolProvider>, ProviderError> {
        let provider = McpStdioProvider::spawn(&self.settings).await?;
        Ok(Arc::new(provider))
    }
}

/// 一个已初始化的 MCP 子进程连接
pub struct McpStdioProvider {
    inner: Arc<Inner>,
}

struct Inner {
    command: String,
    child: Mutex<Option<Child>>,
    writer: Mutex<Option<BufWriter<ChildStdin>>>,
    pending: Mutex<PendingMap>,
    id_counter: AtomicU64,
    alive: AtomicBool,
    request_timeout: Duration,
}

impl McpStdioProvider {
    pub async fn spawn(settings: &ProviderSection) -> Result<Self, ProviderError> {
        let mut command = Command::new(&settings.command);
        command
            .args(&settings.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &settings.workdir {
            command.current_dir(dir);
        }
        for (key, value) in &settings.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(ProviderError::Spawn)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProviderError::Transport("failed to capture provider stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::Transport("failed to capture provider stdout".to_string()))?;

        let inner = Arc::new(Inner {
            command: settings.command.clone(),
            child: Mutex::new(Some(child)),
            writer: Mutex::new(Some(BufWriter::new(stdin))),
            pending: Mutex::new(HashMap::new()),
            id_counter: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            request_timeout: Duration::from_secs(settings.request_timeout_secs.max(1)),
        });

        // reader 只持有弱引用：连接被丢弃时 Inner 随之释放，kill_on_drop 才会生效
        tokio::spawn(Inner::reader_loop(Arc::downgrade(&inner), stdout));

        if let Err(e) = inner.initialize().await {
            inner.reset().await;
            return Err(e);
        }
        info!(command = %settings.command, "Tool provider process initialized");
        Ok(Self { inner })
    }
}

#[async_trait]
impl ToolProvider for McpStdioProvider {
    async fn list_tools(&self) -> Result<Vec<Value>, ProviderError> {
        self.inner.list_paginated("tools/list", "tools").await
    }

    async fn list_resources(&self) -> Result<Vec<Value>, ProviderError> {
        self.inner.list_paginated("resources/list", "resources").await
    }

    async fn list_resource_templates(&self) -> Result<Vec<Value>, ProviderError> {
        self.inner
            .list_paginated("resources/templates/list", "resourceTemplates")
            .await
    }

    async fn call_tool(&self, name: &str, arguments: Option<Map<String, Value>>) -> Result<Value, ProviderError> {
        let mut params = json!({ "name": name });
        if let Some(args) = arguments {
            params["arguments"] = Value::Object(args);
        }
        self.inner.send_request("tools/call", params).await
    }

    async fn read_resource(&self, uri: &str) -> Result<Value, ProviderError> {
        self.inner
            .send_request("resources/read", json!({ "uri": uri }))
            .await
    }

    fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        info!(command = %self.inner.command, "Shutting down tool provider process");
        self.inner.reset().await;
    }
}

impl Inner {
    async fn initialize(&self) -> Result<(), ProviderError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {}
        });
        let result = self.send_request("initialize", params).await?;
        if let Some(server) = result.get("serverInfo") {
            debug!(server = %server, "Tool provider handshake complete");
        }
        self.send_notification("notifications/initialized", json!({}))
            .await
    }

    async fn list_paginated(&self, method: &str, field: &str) -> Result<Vec<Value>, ProviderError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let result = self.send_request(method, params).await?;
            if let Some(page) = result.get(field).and_then(Value::as_array) {
                items.extend(page.iter().cloned());
            }
            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(String::from);
            if cursor.is_none() {
                break;
            }
        }
        Ok(items)
    }

    async fn reader_loop(inner: Weak<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            let next = lines.next_line().await;
            let Some(this) = inner.upgrade() else {
                return;
            };
            match next {
                Ok(Some(raw)) => {
                    if raw.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(&raw) {
                        Ok(value) => {
                            if let Err(e) = this.process_inbound(value).await {
                                warn!(command = %this.command, error = %e, "Failed to process provider message");
                            }
                        }
                        Err(e) => {
                            warn!(command = %this.command, line = %raw, error = %e, "Provider wrote invalid JSON");
                        }
                    }
                }
                Ok(None) => {
                    warn!(command = %this.command, "Tool provider process exited");
                    this.reset().await;
                    return;
                }
                Err(e) => {
                    warn!(command = %this.command, error = %e, "Provider stdout read failed");
                    this.reset().await;
                    return;
                }
            }
        }
    }

    async fn process_inbound(&self, value: Value) -> Result<(), ProviderError> {
        match (value.get("id").cloned(), value.get("method").and_then(Value::as_str)) {
            (Some(id), Some(method)) => self.handle_server_request(id, method).await,
            (Some(id), None) => {
                self.handle_response(&id, value).await;
                Ok(())
            }
            (None, Some(method)) => {
                debug!(method, "Provider notification");
                Ok(())
            }
            (None, None) => Ok(()),
        }
    }

    async fn handle_response(&self, id: &Value, value: Value) {
        let key = match id {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return,
        };
        let Some(sender) = self.pending.lock().await.remove(&key) else {
            debug!(response_id = %key, "Response for unknown request");
            return;
        };

        let outcome = match value.get("error") {
            Some(err) => Err(ProviderError::Rpc {
                code: err.get("code").and_then(Value::as_i64).unwrap_or(-32000),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            }),
            None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = sender.send(outcome);
    }

    async fn handle_server_request(&self, id: Value, method: &str) -> Result<(), ProviderError> {
        let payload = if method == "ping" {
            json!({ "jsonrpc": "2.0", "id": id, "result": {} })
        } else {
            warn!(method, "Provider sent unsupported request");
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("method '{}' not supported", method) }
            })
        };
        self.write_message(&payload).await
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<Value, ProviderError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(ProviderError::Terminated);
        }
        let id = format!("req-{}", self.id_counter.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(e) = self.write_message(&payload).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ProviderError::Terminated),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ProviderError::Timeout(method.to_string()))
            }
        }
    }

    async fn send_notification(&self, method: &str, params: Value) -> Result<(), ProviderError> {
        let payload = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.write_message(&payload).await
    }

    async fn write_message(&self, message: &Value) -> Result<(), ProviderError> {
        let encoded = serde_json::to_string(message)?;
        let mut writer = self.writer.lock().await;
        let stream = writer
            .as_mut()
            .ok_or_else(|| ProviderError::Transport("provider stdin closed".to_string()))?;
        let io = |e: std::io::Error| ProviderError::Transport(e.to_string());
        stream.write_all(encoded.as_bytes()).await.map_err(io)?;
        stream.write_all(b"\n").await.map_err(io)?;
        stream.flush().await.map_err(io)
    }

    async fn reset(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.writer.lock().await.take();

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "Failed to kill provider process (may have already exited)");
            }
            let _ = child.wait().await;
        }

        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(ProviderError::Terminated));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let settings = ProviderSection {
            command: "/nonexistent/emcee-tool-provider".to_string(),
            ..ProviderSection::default()
        };
        let err = McpStdioProvider::spawn(&settings).await.err().unwrap();
        assert!(matches!(err, ProviderError::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exit_fails_initialize() {
        // `true` 立即退出，不会应答 initialize
        let settings = ProviderSection {
            command: "true".to_string(),
            request_timeout_secs: 5,
            ..ProviderSection::default()
        };
        let err = McpStdioProvider::spawn(&settings).await.err().unwrap();
        assert!(matches!(
            err,
            ProviderError::Terminated | ProviderError::Transport(_) | ProviderError::Timeout(_)
        ));
    }

    /// 只应答 initialize，之后吞掉所有请求
    #[cfg(target_os = "linux")]
    fn silent_server() -> ProviderSection {
        ProviderSection {
            command: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                r#"read l; printf '{"jsonrpc":"2.0","id":"req-1","result":{}}\n'; while read l; do :; done"#.to_string(),
            ],
            request_timeout_secs: 1,
            ..ProviderSection::default()
        }
    }

    #[cfg(target_os = "linux")]
    async fn child_pid(provider: &McpStdioProvider) -> u32 {
        provider.inner.child.lock().await.as_ref().and_then(Child::id).unwrap()
    }

    /// 进程已消失或只剩僵尸
    #[cfg(target_os = "linux")]
    async fn wait_for_exit(pid: u32) -> bool {
        for _ in 0..40 {
            match std::fs::read_to_string(format!("/proc/{}/status", pid)) {
                Err(_) => return true,
                Ok(status) if status.lines().any(|l| l.starts_with("State:") && l.contains('Z')) => return true,
                Ok(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
        false
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropped_connection_kills_unresponsive_server() {
        let provider = McpStdioProvider::spawn(&silent_server()).await.unwrap();
        let err = provider.list_tools().await.err().unwrap();
        assert!(matches!(err, ProviderError::Timeout(_)));

        let pid = child_pid(&provider).await;
        drop(provider);
        assert!(wait_for_exit(pid).await, "provider process {} still running", pid);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_shutdown_kills_server_and_marks_dead() {
        let provider = McpStdioProvider::spawn(&silent_server()).await.unwrap();
        let pid = child_pid(&provider).await;
        assert!(provider.is_alive());

        provider.shutdown().await;
        assert!(!provider.is_alive());
        assert!(wait_for_exit(pid).await, "provider process {} still running", pid);
        assert!(matches!(provider.list_tools().await, Err(ProviderError::Terminated)));
    }
}
