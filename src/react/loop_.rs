//! 编排主循环
//!
//! 一次聊天请求：追加用户消息 -> 推断上下文（切换则清空历史）-> 调用 LLM ->
//! stop 则记录回答并返回；tool_calls 则先整体校验，再并发执行，按请求顺序写回 tool 消息，回到 LLM。
//! 迭代次数有上限。任何终止性错误都把该会话回滚到用户消息之后，不留下半截的工具往返。

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::core::GatewayError;
use crate::gateway::ContextClassifier;
use crate::gateway::ConversationSession;
use crate::llm::{Completion, FinishReason};
use crate::memory::{prompt_window, Message, ToolCallRef};
use crate::react::ordering::{OrderingGuard, OrderingPolicy};
use crate::react::planner::Planner;
use crate::tools::{Artifact, PlannedCall, RegistrySnapshot, ToolCallRequest, ToolCallResult, ToolExecutor, ToolProvider};

/// 一次请求的最终结果：回答文本 + 本轮剥离出的附件
#[derive(Debug, Clone, PartialEq)]
pub struct ChatOutcome {
    pub content: String,
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, Copy)]
pub struct TurnLimits {
    pub max_iterations: usize,
    /// 送入 LLM 的历史窗口
    pub max_history_length: usize,
}

impl Default for TurnLimits {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_history_length: 20,
        }
    }
}

/// 一次请求所需的全部依赖
pub struct ReactSession<'a> {
    pub planner: &'a Planner,
    pub executor: &'a ToolExecutor,
    pub classifier: &'a dyn ContextClassifier,
    pub ordering: &'a OrderingPolicy,
    pub provider: Arc<dyn ToolProvider>,
    /// 本次请求使用的注册表快照（请求期间不变）
    pub registry: Arc<RegistrySnapshot>,
    pub limits: TurnLimits,
}

/// 执行一次聊天请求
pub async fn run_turn(
    session: &ReactSession<'_>,
    conversation: &mut ConversationSession,
    user_message: &str,
) -> Result<ChatOutcome, GatewayError> {
    conversation.push(Message::user(user_message));

    if let Some(detected) = session.classifier.classify(user_message) {
        match &conversation.context {
            Some(current) if *current != detected => {
                info!(
                    conversation_id = %conversation.id,
                    from = ?current,
                    to = ?detected,
                    "Context switch, clearing history"
                );
                conversation.reset_history();
                conversation.push(Message::user(user_message));
                conversation.context = Some(detected);
            }
            Some(_) => {}
            None => {
                debug!(conversation_id = %conversation.id, context = ?detected, "Context detected");
                conversation.context = Some(detected);
            }
        }
    }

    let rollback_len = conversation.messages.len();
    let chart_intent = session.classifier.wants_chart(user_message);
    let preamble = session
        .planner
        .build_preamble(conversation.context.as_ref(), chart_intent);

    let result = drive(session, conversation, &preamble).await;
    if let Err(e) = &result {
        warn!(
            conversation_id = %conversation.id,
            code = e.code(),
            error = %e,
            "Chat turn failed, rolling back"
        );
        conversation.rollback_to(rollback_len);
    }
    result
}

async fn drive(
    session: &ReactSession<'_>,
    conversation: &mut ConversationSession,
    preamble: &str,
) -> Result<ChatOutcome, GatewayError> {
    let mut guard = session.ordering.guard();
    let mut artifacts = Vec::new();

    for iteration in 1..=session.limits.max_iterations {
        let window = prompt_window(&conversation.messages, session.limits.max_history_length);
        let completion = session
            .planner
            .plan(preamble, window, session.registry.schemas())
            .await?;

        match completion.finish_reason {
            FinishReason::Stop => {
                let answer = completion.content.unwrap_or_default();
                conversation.push(Message::assistant(answer.clone()));
                info!(conversation_id = %conversation.id, iteration, "Chat turn completed");
                return Ok(ChatOutcome {
                    content: answer,
                    artifacts,
                });
            }
            FinishReason::ToolCalls => {
                if completion.tool_calls.is_empty() {
                    return Err(GatewayError::UnexpectedFinishState(
                        "tool_calls without any tool call".to_string(),
                    ));
                }
                let planned = validate_calls(&session.registry, &completion)?;
                debug!(
                    conversation_id = %conversation.id,
                    iteration,
                    calls = planned.len(),
                    "Executing tool calls"
                );

                conversation.push(assistant_placeholder(&completion));
                let results = execute_batch(session, &mut guard, &planned).await?;
                for mut result in results {
                    if let Some(artifact) = result.artifact.take() {
                        artifacts.push(artifact);
                    }
                    conversation.push(Message::tool(result.call_id, result.content));
                }
            }
            FinishReason::Other(reason) => return Err(GatewayError::UnexpectedFinishState(reason)),
        }
    }

    Err(GatewayError::IterationLimitExceeded(session.limits.max_iterations))
}

/// 执行前整体校验：未知工具与参数格式错误都是终止性错误
fn validate_calls(registry: &RegistrySnapshot, completion: &Completion) -> Result<Vec<PlannedCall>, GatewayError> {
    completion
        .tool_calls
        .iter()
        .map(|call| {
            let descriptor = registry
                .resolve(&call.name)
                .cloned()
                .ok_or_else(|| GatewayError::ToolInvocation {
                    tool: call.name.clone(),
                    message: "unknown tool".to_string(),
                })?;
            let request = ToolCallRequest::from_requested(call).map_err(|message| GatewayError::MalformedArguments {
                tool: call.name.clone(),
                message,
            })?;
            Ok(PlannedCall { descriptor, request })
        })
        .collect()
}

fn assistant_placeholder(completion: &Completion) -> Message {
    let mut msg = Message::assistant_tool_calls(
        completion
            .tool_calls
            .iter()
            .map(|c| ToolCallRef {
                id: c.id.clone(),
                name: c.name.clone(),
                arguments: c.arguments_json.clone(),
            })
            .collect(),
    );
    if let Some(text) = completion.content.as_deref().filter(|t| !t.trim().is_empty()) {
        msg.content = text.to_string();
    }
    msg
}

/// 顺序约束拒绝的调用直接得到错误结果，其余并发执行；返回值与 planned 一一对应
async fn execute_batch(
    session: &ReactSession<'_>,
    guard: &mut OrderingGuard<'_>,
    planned: &[PlannedCall],
) -> Result<Vec<ToolCallResult>, GatewayError> {
    let refusals: Vec<Option<ToolCallResult>> = planned
        .iter()
        .map(|p| {
            guard.check(&p.descriptor.name).err().map(|reason| {
                warn!(tool = %p.descriptor.name, "Tool call refused by ordering guard");
                ToolCallResult::error(&p.request.id, reason)
            })
        })
        .collect();

    let runnable: Vec<PlannedCall> = planned
        .iter()
        .zip(&refusals)
        .filter(|(_, refused)| refused.is_none())
        .map(|(p, _)| p.clone())
        .collect();
    let mut executed = session
        .executor
        .execute_all(Arc::clone(&session.provider), &runnable)
        .await
        .into_iter();

    let mut results = Vec::with_capacity(planned.len());
    for (p, refused) in planned.iter().zip(refusals) {
        let result = match refused {
            Some(r) => r,
            None => executed
                .next()
                .unwrap_or_else(|| Ok(ToolCallResult::error(&p.request.id, "no result produced")))?,
        };
        guard.record(&p.descriptor.name, !result.is_error);
        results.push(result);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use crate::core::TaskScheduler;
    use crate::gateway::RegexContextClassifier;
    use crate::llm::{RequestedToolCall, ScriptStep, ScriptedCompletionClient};
    use crate::memory::{Context, Role};
    use crate::tools::provider::{list_capabilities, fast_retry_policy};
    use crate::tools::{MockBehaviour, MockToolProvider};

    struct Harness {
        llm: Arc<ScriptedCompletionClient>,
        provider: Arc<MockToolProvider>,
        planner: Planner,
        executor: ToolExecutor,
        classifier: RegexContextClassifier,
        ordering: OrderingPolicy,
        registry: Arc<RegistrySnapshot>,
        limits: TurnLimits,
    }

    impl Harness {
        async fn new(steps: Vec<ScriptStep>, provider: MockToolProvider) -> Self {
            let llm = Arc::new(ScriptedCompletionClient::new(steps));
            let provider = Arc::new(provider);
            let listing = list_capabilities(provider.as_ref(), &fast_retry_policy()).await.unwrap();
            Self {
                planner: Planner::new(llm.clone(), Duration::from_secs(2)),
                llm,
                provider,
                executor: ToolExecutor::new(2, TaskScheduler::new(4)),
                classifier: RegexContextClassifier::default(),
                ordering: OrderingPolicy::default(),
                registry: Arc::new(RegistrySnapshot::build(&listing)),
                limits: TurnLimits::default(),
            }
        }

        fn session(&self) -> ReactSession<'_> {
            ReactSession {
                planner: &self.planner,
                executor: &self.executor,
                classifier: &self.classifier,
                ordering: &self.ordering,
                provider: self.provider.clone(),
                registry: self.registry.clone(),
                limits: self.limits,
            }
        }
    }

    fn tools() -> MockToolProvider {
        MockToolProvider::new()
            .with_tool("sql_query_db", "Run SQL", json!({ "type": "object" }))
            .with_tool("rag_search", "Search documents", json!({ "type": "object" }))
            .with_tool("create_chart", "Render a chart", json!({ "type": "object" }))
    }

    fn call(id: &str, name: &str, args: &str) -> RequestedToolCall {
        RequestedToolCall {
            id: id.into(),
            name: name.into(),
            arguments_json: args.into(),
        }
    }

    fn tool_calls(calls: Vec<RequestedToolCall>) -> ScriptStep {
        ScriptStep::Reply(Completion::tool_calls(calls))
    }

    fn stop(text: &str) -> ScriptStep {
        ScriptStep::Reply(Completion::stop(text))
    }

    #[tokio::test]
    async fn test_plain_answer() {
        let h = Harness::new(vec![stop("Xin chào!")], tools()).await;
        let mut conv = ConversationSession::new("c1");
        let out = run_turn(&h.session(), &mut conv, "chào bạn").await.unwrap();
        assert_eq!(out.content, "Xin chào!");
        assert_eq!(conv.messages, vec![Message::user("chào bạn"), Message::assistant("Xin chào!")]);
        // 工具 schema 随请求发送
        assert_eq!(h.llm.calls().await[0].tools.len(), 3);
    }

    #[tokio::test]
    async fn test_fan_out_preserves_request_order() {
        let provider = tools()
            .respond("sql_query_db", MockBehaviour::Delay(Duration::from_millis(120), "rows".into()))
            .respond("rag_search", MockBehaviour::Text("docs".into()));
        let h = Harness::new(
            vec![
                tool_calls(vec![
                    call("a", "sql_query_db", r#"{"query":"select 1"}"#),
                    call("b", "rag_search", r#"{"q":"x"}"#),
                ]),
                stop("done"),
            ],
            provider,
        )
        .await;
        let mut conv = ConversationSession::new("c1");
        run_turn(&h.session(), &mut conv, "hỏi").await.unwrap();

        assert_eq!(h.provider.completion_order(), vec!["rag_search", "sql_query_db"]);
        let tool_ids: Vec<_> = conv
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.tool_call_id.clone().unwrap())
            .collect();
        assert_eq!(tool_ids, vec!["a", "b"]);
        assert_eq!(conv.messages[1].tool_calls.len(), 2);
    }

    #[tokio::test]
    async fn test_tool_error_is_fed_back_and_loop_continues() {
        let provider = tools().respond("sql_query_db", MockBehaviour::Fail("syntax error".into()));
        let h = Harness::new(
            vec![
                tool_calls(vec![call("a", "sql_query_db", r#"{"query":"selec"}"#)]),
                stop("Câu truy vấn bị lỗi"),
            ],
            provider,
        )
        .await;
        let mut conv = ConversationSession::new("c1");
        let out = run_turn(&h.session(), &mut conv, "q").await.unwrap();
        assert_eq!(out.content, "Câu truy vấn bị lỗi");

        let second_call = &h.llm.calls().await[1];
        let tool_msg = second_call.messages.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool_msg.content.contains("syntax error"));
    }

    #[tokio::test]
    async fn test_iteration_limit() {
        let steps = (0..20)
            .map(|i| tool_calls(vec![call(&format!("c{i}"), "rag_search", "{}")]))
            .collect();
        let mut h = Harness::new(steps, tools()).await;
        h.limits.max_iterations = 3;
        let mut conv = ConversationSession::new("c1");
        let err = run_turn(&h.session(), &mut conv, "loop").await.unwrap_err();
        assert_eq!(err, GatewayError::IterationLimitExceeded(3));
        assert_eq!(h.llm.calls().await.len(), 3);
        // 回滚到用户消息之后
        assert_eq!(conv.messages, vec![Message::user("loop")]);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_terminal() {
        let h = Harness::new(vec![tool_calls(vec![call("a", "drop_tables", "{}")])], tools()).await;
        let mut conv = ConversationSession::new("c1");
        let err = run_turn(&h.session(), &mut conv, "q").await.unwrap_err();
        assert_eq!(err.code(), "tool_invocation_error");
        assert!(err.to_string().contains("drop_tables"));
        assert!(h.provider.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_arguments_are_terminal() {
        let h = Harness::new(
            vec![tool_calls(vec![
                call("a", "rag_search", "{}"),
                call("b", "sql_query_db", "{\"query\":"),
            ])],
            tools(),
        )
        .await;
        let mut conv = ConversationSession::new("c1");
        let err = run_turn(&h.session(), &mut conv, "q").await.unwrap_err();
        assert_eq!(err.code(), "malformed_arguments");
        // 校验先于执行：合法的那个也没有执行
        assert!(h.provider.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_tool_timeout_is_terminal() {
        let provider = tools().respond("sql_query_db", MockBehaviour::Hang);
        let mut h = Harness::new(
            vec![tool_calls(vec![call("a", "sql_query_db", "{}")])],
            provider,
        )
        .await;
        h.executor = ToolExecutor::with_timeout(Duration::from_millis(50), TaskScheduler::new(2));
        let mut conv = ConversationSession::new("c1");
        let err = run_turn(&h.session(), &mut conv, "q").await.unwrap_err();
        assert_eq!(err, GatewayError::ToolTimeout { tool: "sql_query_db".into() });
        assert_eq!(conv.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_unexpected_finish_reason() {
        let h = Harness::new(
            vec![ScriptStep::Reply(Completion {
                finish_reason: FinishReason::Other("length".into()),
                content: Some("truncated".into()),
                tool_calls: vec![],
            })],
            tools(),
        )
        .await;
        let mut conv = ConversationSession::new("c1");
        let err = run_turn(&h.session(), &mut conv, "q").await.unwrap_err();
        assert_eq!(err, GatewayError::UnexpectedFinishState("length".into()));
    }

    #[tokio::test]
    async fn test_chart_before_data_is_refused() {
        let h = Harness::new(
            vec![
                tool_calls(vec![call("a", "create_chart", r#"{"type":"bar"}"#)]),
                tool_calls(vec![call("b", "sql_query_db", r#"{"query":"select month, revenue from sales"}"#)]),
                tool_calls(vec![call("c", "create_chart", r#"{"type":"bar"}"#)]),
                stop("Đây là biểu đồ"),
            ],
            tools(),
        )
        .await;
        let mut conv = ConversationSession::new("c1");
        run_turn(&h.session(), &mut conv, "Vẽ biểu đồ doanh thu").await.unwrap();

        let targets: Vec<_> = h.provider.invocations().into_iter().map(|i| i.target).collect();
        assert_eq!(targets, vec!["sql_query_db", "create_chart"]);
        let refused = conv
            .messages
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("a"))
            .unwrap();
        assert!(refused.content.contains("needs data"));
        // 画图意图写入了 system 提示
        assert!(h.llm.calls().await[0].messages[0].content.contains("Chart Requests"));
    }

    #[tokio::test]
    async fn test_context_switch_resets_history() {
        let h = Harness::new(vec![stop("a1"), stop("a2"), stop("a3")], tools()).await;
        let mut conv = ConversationSession::new("c1");
        run_turn(&h.session(), &mut conv, "doanh thu trong database sales").await.unwrap();
        run_turn(&h.session(), &mut conv, "còn tháng trước?").await.unwrap();
        assert_eq!(conv.messages.len(), 4);
        assert_eq!(conv.context, Some(Context::database("sales")));

        run_turn(&h.session(), &mut conv, "chuyển sang database hr").await.unwrap();
        assert_eq!(conv.context, Some(Context::database("hr")));
        assert_eq!(
            conv.messages,
            vec![Message::user("chuyển sang database hr"), Message::assistant("a3")]
        );
    }

    #[tokio::test]
    async fn test_prompt_window_is_capped() {
        let steps = (0..6).map(|i| stop(&format!("a{i}"))).collect();
        let mut h = Harness::new(steps, tools()).await;
        h.limits.max_history_length = 4;
        let mut conv = ConversationSession::new("c1");
        for i in 0..6 {
            run_turn(&h.session(), &mut conv, &format!("q{i}")).await.unwrap();
        }
        // 历史本身不截断
        assert_eq!(conv.messages.len(), 12);
        let last = h.llm.calls().await.pop().unwrap();
        // system + 最多 4 条历史
        assert!(last.messages.len() <= 5);
        assert_eq!(last.messages[1].role, Role::User);
    }

    #[tokio::test]
    async fn test_long_tool_turn_keeps_question_in_prompt() {
        let mut h = Harness::new(
            vec![
                tool_calls(vec![
                    call("a", "rag_search", r#"{"q":"1"}"#),
                    call("b", "rag_search", r#"{"q":"2"}"#),
                    call("c", "rag_search", r#"{"q":"3"}"#),
                    call("d", "rag_search", r#"{"q":"4"}"#),
                ]),
                stop("Tổng hợp xong"),
            ],
            tools(),
        )
        .await;
        h.limits.max_history_length = 4;
        let mut conv = ConversationSession::new("c1");
        run_turn(&h.session(), &mut conv, "tìm quy trình nghỉ phép").await.unwrap();

        let second = &h.llm.calls().await[1];
        let roles: Vec<Role> = second.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::Tool, Role::Tool, Role::Tool, Role::Tool]
        );
        assert_eq!(second.messages[1].content, "tìm quy trình nghỉ phép");
    }

    #[tokio::test]
    async fn test_artifacts_are_detached() {
        let provider = tools().respond(
            "create_chart",
            MockBehaviour::Raw(json!({
                "content": [
                    { "type": "text", "text": "Chart ready" },
                    { "type": "image", "data": "iVBORw0KGgo=", "mimeType": "image/png" }
                ]
            })),
        );
        let h = Harness::new(
            vec![
                tool_calls(vec![call("a", "sql_query_db", "{}")]),
                tool_calls(vec![call("b", "create_chart", "{}")]),
                stop("Xong"),
            ],
            provider,
        )
        .await;
        let mut conv = ConversationSession::new("c1");
        let out = run_turn(&h.session(), &mut conv, "vẽ biểu đồ").await.unwrap();
        assert_eq!(out.artifacts.len(), 1);
        assert_eq!(out.artifacts[0].data, "iVBORw0KGgo=");
        assert!(conv.messages.iter().all(|m| !m.content.contains("iVBORw0KGgo=")));
    }
}
