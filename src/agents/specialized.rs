//! 专职 Agent：绑定机台与职能，借助白名单工具完成任务
//!
//! 读取任务指定的上下文键 -> 无推理提供方时返回确定性占位结果，否则进入工具调用循环。

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agents::agent::{Agent, AgentProfile, AgentRuntime, TaskResult, TaskSpec};
use crate::llm::ChatMessage;
use crate::react::{tool_loop, ToolLoopSession};

pub struct SpecializedAgent {
    profile: AgentProfile,
    runtime: AgentRuntime,
    system_prompt: String,
}

impl SpecializedAgent {
    pub fn new(profile: AgentProfile, runtime: AgentRuntime) -> Self {
        let system_prompt = build_system_prompt(&profile);
        Self {
            profile,
            runtime,
            system_prompt,
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// 读取上下文键（不存在的键跳过），保持任务给出的顺序
    fn gather_context(&self, task: &TaskSpec) -> Vec<(String, Value)> {
        task.context_keys
            .iter()
            .filter_map(|k| self.runtime.context.read(k).map(|v| (k.clone(), v)))
            .collect()
    }

    fn stub_output(&self, task: &TaskSpec, context: &[(String, Value)]) -> Value {
        json!({
            "message": format!("Task executed by {} (no LLM provider configured)", self.profile.name),
            "instruction": task.instruction,
            "parameters": task.parameters,
            "context_available": context.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
            "tools_available": self.profile.allowed_tools.iter().cloned().collect::<Vec<_>>(),
        })
    }

    fn user_message(&self, task: &TaskSpec, context: &[(String, Value)]) -> String {
        let mut parts = vec![format!("Task: {}", task.instruction)];
        if !task.parameters.is_empty() {
            parts.push(format!("\nParameters: {}", Value::Object(task.parameters.clone())));
        }
        if !context.is_empty() {
            let keys: Vec<String> = context.iter().map(|(k, _)| k.clone()).collect();
            parts.push(format!("\nContext data available: {:?}", keys));
            let digest = self.runtime.context.digest(&keys);
            parts.extend(digest.lines().map(|line| format!("  - {}", line)));
        }
        parts.join("\n")
    }
}

/// 专职系统提示词：身份、能力、可用工具与可选附加说明
pub fn build_system_prompt(profile: &AgentProfile) -> String {
    let tools: Vec<&str> = profile.allowed_tools.iter().map(String::as_str).collect();
    let mut parts = vec![
        format!(
            "You are {}, an AI agent specialized in {} for the {}.",
            profile.name, profile.function, profile.machine_id
        ),
        format!("\nYour capabilities: {}", profile.capabilities.join(", ")),
        format!("\nYou have access to these MCP tools: {}", tools.join(", ")),
        "\nYour role is to use these tools to complete your assigned tasks efficiently.".to_string(),
    ];
    if let Some(instructions) = &profile.instructions {
        parts.push(format!("\nAdditional instructions: {}", instructions));
    }
    parts.push(
        "\nAlways provide clear, concise results and store relevant data in the shared context for other agents."
            .to_string(),
    );
    parts.join("\n")
}

#[async_trait]
impl Agent for SpecializedAgent {
    fn profile(&self) -> &AgentProfile {
        &self.profile
    }

    fn runtime(&self) -> &AgentRuntime {
        &self.runtime
    }

    async fn run_task(&self, task: &TaskSpec) -> TaskResult {
        let context = self.gather_context(task);

        let Some(provider) = self.runtime.provider.clone() else {
            return TaskResult::success(&self.profile.id, self.stub_output(task, &context));
        };

        let messages = vec![
            ChatMessage::system(self.system_prompt.clone()),
            ChatMessage::user(self.user_message(task, &context)),
        ];
        let tools = self.runtime.tool_definitions(&self.profile).await;
        let session = ToolLoopSession::new(provider.as_ref(), self)
            .with_options(self.runtime.completion_options(&self.profile, tools))
            .with_max_iterations(self.runtime.max_iterations);

        match tool_loop(session, messages).await {
            Ok(outcome) => {
                let failures = serde_json::to_value(&outcome.tool_failures).unwrap_or(Value::Null);
                TaskResult::success(&self.profile.id, Value::String(outcome.response))
                    .with_metadata("iterations", json!(outcome.iterations))
                    .with_metadata("hit_iteration_limit", json!(outcome.hit_limit))
                    .with_metadata("tool_failures", failures)
            }
            Err(e) => TaskResult::failure(&self.profile.id, format!("LLM execution failed: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::core::events::{EventBus, EventKind};
    use crate::core::SharedContext;
    use crate::llm::{LlmError, LlmResponse, MockLlmProvider, Role, ToolCall};
    use crate::react::MAX_ITERATIONS_MESSAGE;
    use crate::tools::{FnTool, LocalToolServer, ToolHub};

    fn profile() -> AgentProfile {
        AgentProfile::new("m1_fetch", "M1 Fetcher", "m1", "data_fetching")
            .with_capabilities(["sql", "history"])
            .with_tools(["sql_query"])
    }

    async fn runtime() -> AgentRuntime {
        let hub = Arc::new(ToolHub::default());
        hub.connect(Arc::new(
            LocalToolServer::new("database")
                .with_tool(FnTool::new("sql_query", "Run SQL", |_| Ok(json!({ "rows": 2 }))))
                .with_tool(FnTool::new("drop_tables", "Drop everything", |_| Ok(json!("dropped")))),
        ))
        .await
        .unwrap();
        AgentRuntime::new(Arc::new(SharedContext::new()), Arc::new(EventBus::default())).with_tools(hub)
    }

    #[test]
    fn test_system_prompt_parts() {
        let prompt = build_system_prompt(&profile().with_instructions("Prefer the last hour."));
        assert!(prompt.starts_with(
            "You are M1 Fetcher, an AI agent specialized in data_fetching for the m1."
        ));
        assert!(prompt.contains("Your capabilities: sql, history"));
        assert!(prompt.contains("You have access to these MCP tools: sql_query"));
        assert!(prompt.contains("Additional instructions: Prefer the last hour."));
        assert!(prompt.ends_with("store relevant data in the shared context for other agents."));
    }

    #[tokio::test]
    async fn test_stub_output_without_provider() {
        let rt = runtime().await;
        rt.context.write("m1.data", json!({ "t": 1 }), Some("coordinator"), None);
        let agent = SpecializedAgent::new(profile(), rt);
        let task = TaskSpec::new("Fetch relevant data for: temp?")
            .with_parameter("query", json!("temp?"))
            .with_context_keys(vec!["m1.data".into(), "m1.missing".into()]);

        let result = agent.execute(&task).await;
        let out = result.output.unwrap();
        assert_eq!(out["message"], "Task executed by M1 Fetcher (no LLM provider configured)");
        assert_eq!(out["parameters"]["query"], "temp?");
        assert_eq!(out["context_available"], json!(["m1.data"]));
        assert_eq!(out["tools_available"], json!(["sql_query"]));
    }

    #[tokio::test]
    async fn test_llm_path_with_context_digest() {
        let rt = runtime().await;
        rt.context.write("m1.data", json!({ "t": 1 }), Some("coordinator"), Some("Fetched machine data"));
        let provider = Arc::new(MockLlmProvider::scripted(vec![
            LlmResponse::with_tool_calls(vec![ToolCall {
                id: "c1".into(),
                name: "sql_query".into(),
                arguments: json!({ "sql": "select 1" }),
            }]),
            LlmResponse::text("Temperature is normal"),
        ]));
        let agent = SpecializedAgent::new(profile(), rt.with_provider(provider.clone()));
        let task = TaskSpec::new("Analyze")
            .with_parameter("query", json!("temp?"))
            .with_context_keys(vec!["m1.data".into()]);

        let result = agent.execute(&task).await;
        assert_eq!(result.output, Some(json!("Temperature is normal")));
        assert_eq!(result.metadata["iterations"], 2);

        let first = provider.messages_at(0).unwrap();
        assert_eq!(first[0].role, Role::System);
        let user = &first[1].content;
        assert!(user.starts_with("Task: Analyze"));
        assert!(user.contains("\nParameters: {\"query\":\"temp?\"}"));
        assert!(user.contains("Context data available: [\"m1.data\"]"));
        assert!(user.contains("  - m1.data: Fetched machine data"));
    }

    #[tokio::test]
    async fn test_permission_violation_recorded_but_task_succeeds() {
        let rt = runtime().await;
        let provider = Arc::new(MockLlmProvider::scripted(vec![
            LlmResponse::with_tool_calls(vec![ToolCall {
                id: "c1".into(),
                name: "drop_tables".into(),
                arguments: json!({}),
            }]),
            LlmResponse::text("done"),
        ]));
        let agent = SpecializedAgent::new(profile(), rt.with_provider(provider));
        let result = agent.execute(&TaskSpec::new("cleanup")).await;

        assert!(result.is_success());
        assert_eq!(result.metadata["tool_failures"][0]["kind"], "permission");
        assert_eq!(result.metadata["tool_failures"][0]["tool"], "drop_tables");
        // 被拒绝的工具不会触发 ToolInvoked
        assert!(agent
            .runtime()
            .events
            .history(Some(EventKind::ToolInvoked), None, 10)
            .is_empty());
    }

    #[tokio::test]
    async fn test_max_iterations_sentinel() {
        let rt = runtime().await.with_max_iterations(3);
        let provider = Arc::new(MockLlmProvider::always_tool_call("sql_query"));
        let agent = SpecializedAgent::new(profile(), rt.with_provider(provider.clone()));
        let result = agent.execute(&TaskSpec::new("loop forever")).await;

        assert!(result.is_success());
        assert_eq!(result.output, Some(json!(MAX_ITERATIONS_MESSAGE)));
        assert_eq!(provider.call_count(), 3);
        assert_eq!(result.metadata["hit_iteration_limit"], true);
    }

    #[tokio::test]
    async fn test_provider_error_fails_task() {
        let rt = runtime().await;
        let provider = Arc::new(MockLlmProvider::from_results(vec![Err(LlmError::Request(
            "timeout".into(),
        ))]));
        let agent = SpecializedAgent::new(profile(), rt.with_provider(provider));
        let result = agent.execute(&TaskSpec::new("x")).await;
        assert!(!result.is_success());
        assert!(result.error.unwrap().contains("LLM execution failed"));
    }
}
