//! 网关运行时（调度器）
//!
//! 独占会话存储、注册表、工具服务连接、Planner 与执行器；只在调度器线程上运行，
//! 一次只处理一个工作单元。聊天请求开始时刷新注册表（必要时重连工具服务），再进入编排循环。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Map};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::core::{GatewayError, TaskScheduler};
use crate::gateway::bridge::{Bridge, PendingRequest, WorkItem};
use crate::gateway::intent::{ContextClassifier, RegexContextClassifier};
use crate::gateway::message::{Response, SystemCommand};
use crate::gateway::session_store::SessionStore;
use crate::llm::CompletionClient;
use crate::react::{run_turn, ChatOutcome, OrderingPolicy, Planner, ReactSession, TurnLimits};
use crate::tools::{ProviderConnector, ProviderHandle, ToolExecutor, ToolRegistry};

/// 连接层与调度器共享的计数（只含原子量，不含会话状态）
#[derive(Debug)]
pub struct ServerStats {
    active_clients: AtomicUsize,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            active_clients: AtomicUsize::new(0),
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn client_connected(&self) -> usize {
        self.active_clients.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn client_disconnected(&self) {
        self.active_clients.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active_clients(&self) -> usize {
        self.active_clients.load(Ordering::SeqCst)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

pub struct GatewayRuntime {
    store: SessionStore,
    registry: ToolRegistry,
    provider: ProviderHandle,
    planner: Planner,
    executor: ToolExecutor,
    classifier: Box<dyn ContextClassifier>,
    ordering: OrderingPolicy,
    limits: TurnLimits,
    stats: Arc<ServerStats>,
}

impl GatewayRuntime {
    pub fn new(
        config: &AppConfig,
        llm: Arc<dyn CompletionClient>,
        connector: Arc<dyn ProviderConnector>,
        stats: Arc<ServerStats>,
    ) -> Self {
        Self {
            store: SessionStore::new(),
            registry: ToolRegistry::new(),
            provider: ProviderHandle::new(connector, config.provider.retry_policy()),
            planner: Planner::new(llm, Duration::from_secs(config.llm.timeouts.completion_secs)),
            executor: ToolExecutor::new(
                config.tools.call_timeout_secs,
                TaskScheduler::new(config.tools.max_concurrent_calls),
            ),
            classifier: Box::new(RegexContextClassifier::from_config(&config.tools)),
            ordering: OrderingPolicy::from_config(&config.tools),
            limits: TurnLimits {
                max_iterations: config.session.max_iterations,
                max_history_length: config.session.max_history_length,
            },
            stats,
        }
    }

    /// 替换上下文分类器
    pub fn with_classifier(mut self, classifier: Box<dyn ContextClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// 替换工具服务连接（测试用缩短重试节奏）
    pub fn with_provider(mut self, provider: ProviderHandle) -> Self {
        self.provider = provider;
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// 单消费者主循环：取消或队列关闭时退出，剩余项以错误兑现
    pub async fn run(mut self, mut rx: mpsc::Receiver<WorkItem>, shutdown: CancellationToken) {
        info!("Scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => self.handle(item).await,
                    None => break,
                },
            }
        }

        rx.close();
        let shutting_down = GatewayError::Bridge("server is shutting down".to_string());
        while let Ok(item) = rx.try_recv() {
            item.into_slot().fail(&shutting_down);
        }
        info!("Scheduler stopped");
    }

    pub async fn handle(&mut self, item: WorkItem) {
        match item {
            WorkItem::Chat(PendingRequest {
                conversation_id,
                message,
                username,
                slot,
            }) => {
                info!(conversation_id = %conversation_id, username = %username, "Processing chat request");
                let response = match self.chat(&conversation_id, &message).await {
                    Ok(outcome) => Response::success(outcome.content).with_artifacts(outcome.artifacts),
                    Err(e) => Response::from_gateway_error(&e),
                };
                slot.resolve(response);
            }
            WorkItem::System { command, slot } => slot.resolve(self.system(&command)),
        }
    }

    /// 刷新注册表后执行一次编排
    pub async fn chat(&mut self, conversation_id: &str, message: &str) -> Result<ChatOutcome, GatewayError> {
        let provider = self
            .provider
            .acquire()
            .await
            .map_err(|e| GatewayError::ProviderUnavailable(e.to_string()))?;

        let registry = match self.registry.refresh(provider.as_ref(), self.provider.policy()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // 下次请求重新建连
                self.provider.invalidate().await;
                error!(error = %e, "Tool registry refresh failed");
                return Err(GatewayError::ProviderUnavailable(e.to_string()));
            }
        };
        if registry.is_empty() {
            warn!("Tool provider exposes no capabilities");
        }

        let session = ReactSession {
            planner: &self.planner,
            executor: &self.executor,
            classifier: self.classifier.as_ref(),
            ordering: &self.ordering,
            provider,
            registry,
            limits: self.limits,
        };
        let conversation = self.store.get_or_create(conversation_id);
        run_turn(&session, conversation, message).await
    }

    pub fn system(&mut self, command: &SystemCommand) -> Response {
        match command {
            SystemCommand::Health => {
                let mut extra = Map::new();
                extra.insert("health".into(), json!("healthy"));
                extra.insert("uptime_secs".into(), json!(self.stats.uptime().as_secs()));
                extra.insert("active_clients".into(), json!(self.stats.active_clients()));
                extra.insert("active_conversations".into(), json!(self.store.active_count()));
                Response::fields(extra)
            }
            SystemCommand::Stats => {
                let (prompt, completion, total) = self.planner.token_usage();
                let stats = json!({
                    "active_clients": self.stats.active_clients(),
                    "active_conversations": self.store.active_count(),
                    "total_messages": self.store.total_messages(),
                    "server_start_time": self.stats.started_at().to_rfc3339(),
                    "token_usage": {
                        "prompt_tokens": prompt,
                        "completion_tokens": completion,
                        "total_tokens": total,
                    },
                    "configuration": {
                        "max_history_length": self.limits.max_history_length,
                        "max_iterations": self.limits.max_iterations,
                    },
                });
                let mut extra = Map::new();
                extra.insert("stats".into(), stats);
                Response::fields(extra)
            }
            SystemCommand::ClearHistory {
                conversation_id: Some(id),
            } => {
                let existed = self.store.clear(id);
                info!(conversation_id = %id, existed, "Conversation history cleared");
                Response::success(format!("Conversation history cleared for {}", id))
            }
            SystemCommand::ClearHistory { conversation_id: None } => {
                Response::error("Invalid or missing conversation_id", "invalid_conversation_id")
            }
            SystemCommand::Unknown(cmd) => {
                Response::error(format!("Unknown system command: {}", cmd), "unknown_command")
            }
        }
    }
}

/// 在独立线程上启动调度器（current_thread runtime），返回提交端
pub fn spawn_scheduler(
    runtime: GatewayRuntime,
    queue_capacity: usize,
    shutdown: CancellationToken,
) -> std::io::Result<(Bridge, std::thread::JoinHandle<()>)> {
    let (bridge, rx) = Bridge::channel(queue_capacity);
    let handle = std::thread::Builder::new()
        .name("emcee-scheduler".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    // rx 随之丢弃，之后的提交立即以错误兑现
                    error!(error = %e, "Failed to build scheduler runtime");
                    return;
                }
            };
            rt.block_on(runtime.run(rx, shutdown));
        })?;
    Ok((bridge, handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::bridge::placeholder;
    use crate::llm::{Completion, ScriptedCompletionClient};
    use crate::tools::{fast_retry_policy, MockConnector, MockToolProvider};

    fn runtime_with(llm: ScriptedCompletionClient, connector: Arc<MockConnector>) -> GatewayRuntime {
        let config = AppConfig::default();
        GatewayRuntime::new(&config, Arc::new(llm), connector.clone(), Arc::new(ServerStats::new()))
            .with_provider(ProviderHandle::new(connector, fast_retry_policy()))
    }

    fn connector() -> Arc<MockConnector> {
        Arc::new(MockConnector::new(Arc::new(
            MockToolProvider::new().with_tool("sql_query_db", "Run SQL", json!({ "type": "object" })),
        )))
    }

    #[tokio::test]
    async fn test_chat_and_stats() {
        let mut rt = runtime_with(ScriptedCompletionClient::replies([Completion::stop("ok")]), connector());
        let out = rt.chat("c1", "hello").await.unwrap();
        assert_eq!(out.content, "ok");

        let stats = rt.system(&SystemCommand::Stats);
        assert_eq!(stats.extra["stats"]["active_conversations"], 1);
        assert_eq!(stats.extra["stats"]["total_messages"], 2);
        assert_eq!(stats.extra["stats"]["configuration"]["max_iterations"], 10);
    }

    #[tokio::test]
    async fn test_provider_unavailable_then_recovers() {
        let connector = connector();
        connector.fail_next(3);
        let mut rt = runtime_with(
            ScriptedCompletionClient::replies([Completion::stop("back")]),
            connector.clone(),
        );

        let err = rt.chat("c1", "hello").await.unwrap_err();
        assert_eq!(err.code(), "provider_unavailable");
        assert_eq!(connector.connect_attempts(), 3);
        // 失败的请求不写入历史
        assert!(rt.store().get("c1").is_none());

        let out = rt.chat("c1", "hello").await.unwrap();
        assert_eq!(out.content, "back");
    }

    #[tokio::test]
    async fn test_listing_failure_invalidates_connection() {
        let connector = connector();
        let mut rt = runtime_with(ScriptedCompletionClient::default(), connector.clone());
        connector.provider().set_unreachable(true);
        assert!(rt.chat("c1", "hello").await.is_err());
        assert_eq!(connector.provider().shutdown_calls(), 1);
        connector.provider().set_unreachable(false);
        rt.chat("c1", "hello").await.unwrap();
        assert_eq!(connector.connect_attempts(), 2);
        assert_eq!(connector.provider().shutdown_calls(), 1);
    }

    #[tokio::test]
    async fn test_system_commands() {
        let mut rt = runtime_with(ScriptedCompletionClient::default(), connector());
        rt.chat("c1", "hello").await.unwrap();

        let health = rt.system(&SystemCommand::Health);
        assert_eq!(health.extra["health"], "healthy");
        assert_eq!(health.extra["active_conversations"], 1);

        let cleared = rt.system(&SystemCommand::ClearHistory {
            conversation_id: Some("c1".into()),
        });
        assert!(cleared.is_success());
        assert_eq!(rt.store().active_count(), 0);

        let missing = rt.system(&SystemCommand::ClearHistory { conversation_id: None });
        assert_eq!(missing.error.as_deref(), Some("Invalid or missing conversation_id"));

        let unknown = rt.system(&SystemCommand::Unknown("reboot".into()));
        assert_eq!(unknown.error.as_deref(), Some("Unknown system command: reboot"));
    }

    #[test]
    fn test_scheduler_thread_serves_and_drains_on_shutdown() {
        let shutdown = CancellationToken::new();
        let rt = runtime_with(ScriptedCompletionClient::replies([Completion::stop("hi")]), connector());
        let (bridge, handle) = spawn_scheduler(rt, 8, shutdown.clone()).unwrap();

        let (slot, waiter) = placeholder();
        bridge
            .submit(WorkItem::Chat(PendingRequest {
                conversation_id: "c1".into(),
                message: "hello".into(),
                username: "User".into(),
                slot,
            }))
            .unwrap();
        assert_eq!(waiter.wait(Duration::from_secs(5)).content.as_deref(), Some("hi"));

        shutdown.cancel();
        handle.join().unwrap();

        let (slot, waiter) = placeholder();
        assert!(bridge
            .submit(WorkItem::System {
                command: SystemCommand::Health,
                slot,
            })
            .is_err());
        assert!(!waiter.wait(Duration::from_secs(1)).is_success());
    }
}
