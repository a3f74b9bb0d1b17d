//! The bounded tool-calling loop.
//!
//! One turn alternates model calls and tool executions until the model
//! answers in plain text or the iteration cap trips. Tool failures are fed
//! back to the model as structured results; only the model call itself and
//! the cap can abort a turn.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::agent::CancelToken;
use crate::config::CoreConfig;
use crate::error::{OrchestratorError, ToolError};
use crate::llm::{ChatMessage, LlmProvider, MessagePart, ToolCall, chat_with_retry};
use crate::memory::MemoryContext;
use crate::tools::{Tool, ToolContext, ToolRegistry};

/// One executed (or skipped) tool call, for logging and diagnostics.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub tool: String,
    pub args: Value,
    pub outcome: String,
}

/// Result of a completed turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub reply: String,
    pub trace: Vec<TraceEntry>,
}

/// Shared components the orchestrator runs against.
pub struct OrchestratorDeps {
    pub llm: Arc<dyn LlmProvider>,
    pub tools: Arc<ToolRegistry>,
}

pub struct Orchestrator {
    config: CoreConfig,
    deps: OrchestratorDeps,
}

/// Everything one turn needs besides the current message.
pub struct TurnInput {
    pub user_id: i64,
    pub memory: MemoryContext,
    /// Prior conversation, oldest first.
    pub history: Vec<ChatMessage>,
    /// The current message as model parts.
    pub parts: Vec<MessagePart>,
    pub cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(config: CoreConfig, deps: OrchestratorDeps) -> Self {
        Self { config, deps }
    }

    /// Run one turn to completion.
    pub async fn run_turn(&self, input: TurnInput) -> Result<TurnOutcome, OrchestratorError> {
        let mut messages = Vec::with_capacity(input.history.len() + 3);
        messages.push(ChatMessage::System(self.config.system_prompt.clone()));
        if let Some(block) = input.memory.as_prompt_block() {
            messages.push(ChatMessage::System(block));
        }
        messages.extend(input.history);
        messages.push(ChatMessage::User(input.parts));

        let definitions = self.deps.tools.tool_definitions().await;
        let ctx = ToolContext {
            user_id: input.user_id,
        };
        let mut trace: Vec<TraceEntry> = Vec::new();
        // Failed calls this turn, keyed by tool + exact arguments. A repeat
        // is answered from here instead of re-executing.
        let mut failed_calls: HashMap<String, String> = HashMap::new();

        for iteration in 0..self.config.max_tool_iterations {
            if input.cancel.is_cancelled() {
                info!(user_id = input.user_id, iteration, "Turn cancelled");
                return Err(OrchestratorError::Cancelled);
            }

            let response = chat_with_retry(
                self.deps.llm.as_ref(),
                &messages,
                &definitions,
                self.config.model_timeout,
            )
            .await
            .map_err(OrchestratorError::ModelUnavailable)?;

            if response.tool_calls.is_empty() {
                let reply = response
                    .text
                    .as_deref()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .unwrap_or("I couldn't come up with a response. Please try again.")
                    .to_string();
                return Ok(TurnOutcome { reply, trace });
            }

            debug!(
                user_id = input.user_id,
                iteration,
                calls = response.tool_calls.len(),
                "Model requested tools"
            );
            messages.push(ChatMessage::Assistant {
                text: response.text.clone(),
                tool_calls: response.tool_calls.clone(),
            });

            for call in &response.tool_calls {
                let result = self
                    .dispatch(call, &ctx, &mut failed_calls, &mut trace)
                    .await;
                messages.push(ChatMessage::ToolResult {
                    name: call.name.clone(),
                    result,
                });
            }
        }

        error!(
            user_id = input.user_id,
            cap = self.config.max_tool_iterations,
            trace = ?trace,
            "Tool loop hit the iteration cap"
        );
        Err(OrchestratorError::MaxToolIterationsExceeded(
            self.config.max_tool_iterations,
        ))
    }

    /// Execute one requested tool call, with per-class retry rules, and
    /// shape the outcome into a result payload for the model.
    async fn dispatch(
        &self,
        call: &ToolCall,
        ctx: &ToolContext,
        failed_calls: &mut HashMap<String, String>,
        trace: &mut Vec<TraceEntry>,
    ) -> Value {
        let key = format!("{}:{}", call.name, call.arguments);
        if let Some(previous) = failed_calls.get(&key) {
            warn!(tool = %call.name, "Identical failed call repeated, short-circuiting");
            trace.push(TraceEntry {
                tool: call.name.clone(),
                args: call.arguments.clone(),
                outcome: "skipped: repeat of failed call".to_string(),
            });
            return json!({
                "error": format!(
                    "This exact call already failed: {previous}. Do not repeat it \
                     with the same arguments; try a different approach or tell \
                     the user what went wrong."
                )
            });
        }

        let Some(tool) = self.deps.tools.get(&call.name).await else {
            trace.push(TraceEntry {
                tool: call.name.clone(),
                args: call.arguments.clone(),
                outcome: "unknown tool".to_string(),
            });
            return json!({ "error": format!("Unknown tool '{}'", call.name) });
        };

        match self.execute_with_retry(tool.as_ref(), call, ctx).await {
            Ok(value) => {
                trace.push(TraceEntry {
                    tool: call.name.clone(),
                    args: call.arguments.clone(),
                    outcome: "ok".to_string(),
                });
                value
            }
            Err(e) => {
                warn!(tool = %call.name, "Tool failed: {e}");
                trace.push(TraceEntry {
                    tool: call.name.clone(),
                    args: call.arguments.clone(),
                    outcome: format!("error: {e}"),
                });
                let payload = error_payload(&call.name, &e, tool.idempotency().retryable());
                failed_calls.insert(key, e.to_string());
                payload
            }
        }
    }

    async fn execute_with_retry(
        &self,
        tool: &dyn Tool,
        call: &ToolCall,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        let retryable = tool.idempotency().retryable();
        let attempts = if retryable {
            1 + self.config.tool_retries
        } else {
            1
        };

        let mut last_err = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                debug!(tool = %call.name, attempt, "Retrying tool");
            }
            let result = tokio::time::timeout(
                self.config.tool_timeout,
                tool.execute(call.arguments.clone(), ctx),
            )
            .await
            .unwrap_or_else(|_| {
                Err(ToolError::Timeout {
                    name: call.name.clone(),
                    timeout: self.config.tool_timeout,
                })
            });

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retryable && attempt + 1 < attempts => {
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        // attempts >= 1, so a fall-through always has an error recorded.
        Err(last_err.unwrap_or_else(|| ToolError::ExecutionFailed {
            name: call.name.clone(),
            reason: "retries exhausted".to_string(),
        }))
    }
}

/// Structured error result fed back to the model. A timed-out non-idempotent
/// write gets an explicit "outcome unknown" note so the model reports it
/// instead of silently redoing the action.
fn error_payload(name: &str, e: &ToolError, retryable: bool) -> Value {
    match e {
        ToolError::Timeout { .. } if !retryable => json!({
            "error": format!(
                "The call to '{name}' timed out and its outcome is unknown: it \
                 may or may not have taken effect. Do not repeat it. Tell the \
                 user what you attempted and ask them to verify."
            )
        }),
        ToolError::AccountNotLinked => json!({
            "error": "No account is linked. Ask the user to link their \
                      workspace account first."
        }),
        ToolError::InsufficientScope(scope) => json!({
            "error": format!(
                "The linked account does not grant the required permission \
                 ({scope}). Ask the user to re-link with broader access."
            )
        }),
        other => json!({ "error": other.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use crate::error::LlmError;
    use crate::llm::{LlmResponse, ToolDefinition};
    use crate::tools::Idempotency;

    /// Plays back a fixed script of responses, one per model call.
    struct ScriptedLlm {
        script: Mutex<Vec<LlmResponse>>,
        calls: AtomicU32,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedLlm {
        fn new(script: Vec<LlmResponse>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        async fn chat(
            &self,
            messages: &[ChatMessage],
            _tools: &[ToolDefinition],
        ) -> Result<LlmResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(messages.to_vec());
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                // An adversarial model that never stops asking for tools.
                return Ok(LlmResponse {
                    text: None,
                    tool_calls: vec![ToolCall {
                        name: "probe".into(),
                        arguments: json!({"n": 1}),
                    }],
                });
            }
            Ok(script.remove(0))
        }
    }

    struct CountingTool {
        name: &'static str,
        idempotency: Idempotency,
        executions: AtomicU32,
        behavior: Behavior,
    }

    enum Behavior {
        Ok(Value),
        FailAlways(fn(&str) -> ToolError),
        Hang,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "test tool"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        fn idempotency(&self) -> Idempotency {
            self.idempotency
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Ok(value) => Ok(value.clone()),
                Behavior::FailAlways(make) => Err(make(self.name)),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(json!({}))
                }
            }
        }
    }

    fn config() -> CoreConfig {
        CoreConfig {
            max_tool_iterations: 5,
            tool_retries: 2,
            model_timeout: Duration::from_secs(5),
            tool_timeout: Duration::from_millis(100),
            ..CoreConfig::default()
        }
    }

    async fn orchestrator_with(
        llm: Arc<ScriptedLlm>,
        tools: Vec<Arc<CountingTool>>,
    ) -> Orchestrator {
        let registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool).await.unwrap();
        }
        Orchestrator::new(
            config(),
            OrchestratorDeps {
                llm,
                tools: Arc::new(registry),
            },
        )
    }

    fn input() -> TurnInput {
        TurnInput {
            user_id: 1,
            memory: MemoryContext::None,
            history: vec![],
            parts: vec![MessagePart::Text("hello".into())],
            cancel: CancelToken::new(),
        }
    }

    fn text_reply(text: &str) -> LlmResponse {
        LlmResponse {
            text: Some(text.into()),
            tool_calls: vec![],
        }
    }

    fn tool_request(name: &str, args: Value) -> LlmResponse {
        LlmResponse {
            text: None,
            tool_calls: vec![ToolCall {
                name: name.into(),
                arguments: args,
            }],
        }
    }

    #[tokio::test]
    async fn plain_text_reply_ends_turn() {
        let llm = Arc::new(ScriptedLlm::new(vec![text_reply("Hi there.")]));
        let orch = orchestrator_with(Arc::clone(&llm), vec![]).await;

        let outcome = orch.run_turn(input()).await.unwrap();
        assert_eq!(outcome.reply, "Hi there.");
        assert!(outcome.trace.is_empty());
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn tool_result_is_fed_back_before_final_reply() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            tool_request("lookup", json!({"q": "x"})),
            text_reply("Found it."),
        ]));
        let tool = Arc::new(CountingTool {
            name: "lookup",
            idempotency: Idempotency::ReadOnly,
            executions: AtomicU32::new(0),
            behavior: Behavior::Ok(json!({"answer": 42})),
        });
        let orch = orchestrator_with(Arc::clone(&llm), vec![Arc::clone(&tool)]).await;

        let outcome = orch.run_turn(input()).await.unwrap();
        assert_eq!(outcome.reply, "Found it.");
        assert_eq!(tool.executions.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.trace.len(), 1);
        assert_eq!(outcome.trace[0].outcome, "ok");

        // The second model call must carry the tool result.
        let seen = llm.seen.lock().unwrap();
        let second = &seen[1];
        assert!(second.iter().any(|m| matches!(
            m,
            ChatMessage::ToolResult { name, result }
                if name == "lookup" && result["answer"] == 42
        )));
    }

    #[tokio::test]
    async fn adversarial_model_hits_iteration_cap() {
        // Empty script: the fake model asks for a tool on every call.
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let tool = Arc::new(CountingTool {
            name: "probe",
            idempotency: Idempotency::ReadOnly,
            executions: AtomicU32::new(0),
            behavior: Behavior::Ok(json!({"ok": true})),
        });
        let orch = orchestrator_with(Arc::clone(&llm), vec![tool]).await;

        let result = orch.run_turn(input()).await;
        assert!(matches!(
            result,
            Err(OrchestratorError::MaxToolIterationsExceeded(5))
        ));
        assert_eq!(llm.call_count(), 5);
    }

    #[tokio::test]
    async fn transient_readonly_failure_is_retried() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            tool_request("flaky", json!({})),
            text_reply("Gave up gracefully."),
        ]));
        let tool = Arc::new(CountingTool {
            name: "flaky",
            idempotency: Idempotency::ReadOnly,
            executions: AtomicU32::new(0),
            behavior: Behavior::FailAlways(|name| ToolError::RateLimited {
                name: name.to_string(),
            }),
        });
        let orch = orchestrator_with(llm, vec![Arc::clone(&tool)]).await;

        let outcome = orch.run_turn(input()).await.unwrap();
        // 1 initial + tool_retries extra attempts.
        assert_eq!(tool.executions.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.reply, "Gave up gracefully.");
    }

    #[tokio::test]
    async fn non_idempotent_timeout_is_never_retried() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            tool_request("send_mail", json!({"to": "a@b.c"})),
            text_reply("I attempted to send but the outcome is unknown."),
        ]));
        let tool = Arc::new(CountingTool {
            name: "send_mail",
            idempotency: Idempotency::NonIdempotentWrite,
            executions: AtomicU32::new(0),
            behavior: Behavior::Hang,
        });
        let orch = orchestrator_with(Arc::clone(&llm), vec![Arc::clone(&tool)]).await;

        let outcome = orch.run_turn(input()).await.unwrap();
        assert_eq!(tool.executions.load(Ordering::SeqCst), 1);
        assert!(outcome.trace[0].outcome.starts_with("error"));

        // The model saw the outcome-unknown note, not a bare timeout.
        let seen = llm.seen.lock().unwrap();
        let second = &seen[1];
        assert!(second.iter().any(|m| matches!(
            m,
            ChatMessage::ToolResult { result, .. }
                if result["error"].as_str().unwrap().contains("outcome is unknown")
        )));
    }

    #[tokio::test]
    async fn repeated_identical_failed_call_short_circuits() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            tool_request("broken", json!({"q": "same"})),
            tool_request("broken", json!({"q": "same"})),
            text_reply("Understood, something else then."),
        ]));
        let tool = Arc::new(CountingTool {
            name: "broken",
            idempotency: Idempotency::NonIdempotentWrite,
            executions: AtomicU32::new(0),
            behavior: Behavior::FailAlways(|name| ToolError::ExecutionFailed {
                name: name.to_string(),
                reason: "boom".to_string(),
            }),
        });
        let orch = orchestrator_with(llm, vec![Arc::clone(&tool)]).await;

        let outcome = orch.run_turn(input()).await.unwrap();
        // Second request with identical args never reaches the tool.
        assert_eq!(tool.executions.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.trace.len(), 2);
        assert!(outcome.trace[1].outcome.contains("skipped"));
    }

    #[tokio::test]
    async fn unknown_tool_reports_and_continues() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            tool_request("no_such_tool", json!({})),
            text_reply("That tool doesn't exist."),
        ]));
        let orch = orchestrator_with(llm, vec![]).await;

        let outcome = orch.run_turn(input()).await.unwrap();
        assert_eq!(outcome.reply, "That tool doesn't exist.");
        assert_eq!(outcome.trace[0].outcome, "unknown tool");
    }

    #[tokio::test]
    async fn cancelled_turn_stops_before_model_call() {
        let llm = Arc::new(ScriptedLlm::new(vec![text_reply("never sent")]));
        let orch = orchestrator_with(Arc::clone(&llm), vec![]).await;

        let mut turn = input();
        turn.cancel.cancel();
        let result = orch.run_turn(turn).await;
        assert!(matches!(result, Err(OrchestratorError::Cancelled)));
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn memory_block_lands_in_system_context() {
        let llm = Arc::new(ScriptedLlm::new(vec![text_reply("ok")]));
        let orch = orchestrator_with(Arc::clone(&llm), vec![]).await;

        let mut turn = input();
        turn.memory = MemoryContext::Found(vec!["User prefers short answers".into()]);
        orch.run_turn(turn).await.unwrap();

        let seen = llm.seen.lock().unwrap();
        assert!(seen[0].iter().any(|m| matches!(
            m,
            ChatMessage::System(text) if text.contains("User prefers short answers")
        )));
    }
}
