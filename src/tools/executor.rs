//! 工具执行器
//!
//! 对每次调用施加超时与并发许可，并输出结构化审计日志（JSON）。
//! 工具自身的失败已由 provider::invoke 转为错误结果，这里只有超时会变成 GatewayError::ToolTimeout。

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde_json::{Map, Value};
use tokio::time::timeout;

use crate::core::{GatewayError, TaskScheduler};
use crate::tools::descriptor::{ToolCallRequest, ToolCallResult, ToolDescriptor};
use crate::tools::provider::{invoke, ToolProvider};

/// 已校验、待执行的一次调用
#[derive(Debug, Clone)]
pub struct PlannedCall {
    pub descriptor: ToolDescriptor,
    pub request: ToolCallRequest,
}

pub struct ToolExecutor {
    timeout: Duration,
    scheduler: TaskScheduler,
}

impl ToolExecutor {
    pub fn new(timeout_secs: u64, scheduler: TaskScheduler) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
            scheduler,
        }
    }

    pub fn with_timeout(timeout: Duration, scheduler: TaskScheduler) -> Self {
        Self { timeout, scheduler }
    }

    /// 执行一次调用；超时返回 ToolTimeout，其余情况总是得到 ToolCallResult
    pub async fn execute(
        &self,
        provider: &dyn ToolProvider,
        call: &PlannedCall,
    ) -> Result<ToolCallResult, GatewayError> {
        // 许可在整个调用期间持有
        let _permit = self.scheduler.acquire_tool().await;
        let start = Instant::now();
        let result = timeout(self.timeout, invoke(provider, &call.descriptor, &call.request)).await;

        let (ok, outcome) = match &result {
            Ok(r) if !r.is_error => (true, "ok"),
            Ok(_) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.descriptor.name,
            "kind": call.descriptor.kind.to_string(),
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&call.request.arguments),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        result.map_err(|_| GatewayError::ToolTimeout {
            tool: call.descriptor.name.clone(),
        })
    }

    /// 并发执行一批调用，结果顺序与输入顺序一致（与完成先后无关）
    pub async fn execute_all(
        &self,
        provider: Arc<dyn ToolProvider>,
        calls: &[PlannedCall],
    ) -> Vec<Result<ToolCallResult, GatewayError>> {
        join_all(calls.iter().map(|call| self.execute(provider.as_ref(), call))).await
    }
}

fn args_preview(args: &Map<String, Value>) -> String {
    let s = Value::Object(args.clone()).to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
