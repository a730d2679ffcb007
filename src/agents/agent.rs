//! Agent 执行契约
//!
//! Agent trait 约定身份（profile）、任务执行（execute）、受白名单约束的工具调用（invoke_tool）与事件发布（emit_event）。
//! 共享的上下文、事件总线、工具中枢与推理提供方由 AgentRuntime 持有，各类 Agent 组合使用。

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::{AgentSection, AppConfig};
use crate::core::events::{Event, EventBus, EventKind};
use crate::core::SharedContext;
use crate::llm::{CompletionOptions, LlmProvider, ToolDefinition, DEFAULT_MODEL};
use crate::react::{ToolInvoker, MAX_TOOL_ITERATIONS};
use crate::tools::{ToolError, ToolHub};

/// Agent 身份：启动时由配置构建，生命周期内不变
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    pub machine_id: String,
    /// 职能：data_fetching / analysis / summary ...
    pub function: String,
    pub capabilities: Vec<String>,
    /// 工具白名单（排他）
    pub allowed_tools: BTreeSet<String>,
    pub model: String,
    pub instructions: Option<String>,
}

impl AgentProfile {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        machine_id: impl Into<String>,
        function: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            machine_id: machine_id.into(),
            function: function.into(),
            capabilities: Vec::new(),
            allowed_tools: BTreeSet::new(),
            model: DEFAULT_MODEL.to_string(),
            instructions: None,
        }
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn from_section(section: &AgentSection, default_model: &str) -> Self {
        Self {
            id: section.id.clone(),
            name: section.name.clone(),
            machine_id: section.machine_id.clone(),
            function: section.function.clone(),
            capabilities: section.capabilities.clone(),
            allowed_tools: section.allowed_tools(),
            model: section
                .model
                .clone()
                .unwrap_or_else(|| default_model.to_string()),
            instructions: section.instructions.clone(),
        }
    }

    /// 机台与职能均精确匹配（区分大小写）
    pub fn can_handle(&self, machine_id: &str, function: &str) -> bool {
        self.machine_id == machine_id && self.function == function
    }

    pub fn allows(&self, tool: &str) -> bool {
        self.allowed_tools.contains(tool)
    }
}

/// 任务描述
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub instruction: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// 执行前需读取的共享上下文键
    #[serde(default)]
    pub context_keys: Vec<String>,
}

impl TaskSpec {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            ..Self::default()
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_context_keys(mut self, keys: Vec<String>) -> Self {
        self.context_keys = keys;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Failed,
}

/// 任务结果：成功时带 output，失败时带 error；metadata 含机台、职能、工具失败等
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskResult {
    pub status: TaskStatus,
    pub agent_id: String,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub metadata: Map<String, Value>,
}

impl TaskResult {
    pub fn success(agent_id: impl Into<String>, output: Value) -> Self {
        Self {
            status: TaskStatus::Success,
            agent_id: agent_id.into(),
            output: Some(output),
            error: None,
            metadata: Map::new(),
        }
    }

    pub fn failure(agent_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            agent_id: agent_id.into(),
            output: None,
            error: Some(error.into()),
            metadata: Map::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Agent 共享运行时：上下文、事件总线、可选工具中枢与推理提供方、循环参数
#[derive(Clone)]
pub struct AgentRuntime {
    pub context: Arc<SharedContext>,
    pub events: Arc<EventBus>,
    pub tools: Option<Arc<ToolHub>>,
    pub provider: Option<Arc<dyn LlmProvider>>,
    pub max_iterations: usize,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl AgentRuntime {
    pub fn new(context: Arc<SharedContext>, events: Arc<EventBus>) -> Self {
        Self {
            context,
            events,
            tools: None,
            provider: None,
            max_iterations: MAX_TOOL_ITERATIONS,
            temperature: crate::llm::DEFAULT_TEMPERATURE,
            max_tokens: None,
        }
    }

    pub fn with_tools(mut self, tools: Arc<ToolHub>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// 按配置的 [llm] / [tools] 段设置循环参数
    pub fn configured(mut self, cfg: &AppConfig) -> Self {
        self.max_iterations = cfg.tools.max_iterations;
        self.temperature = cfg.llm.temperature;
        self.max_tokens = cfg.llm.max_tokens;
        self
    }

    pub fn emit(&self, kind: EventKind, agent_id: &str, payload: Value) {
        self.events.publish(Event::new(kind, agent_id, payload));
    }

    /// 白名单检查 -> ToolInvoked -> 工具中枢调用 -> ToolCompleted
    pub async fn invoke_tool(
        &self,
        profile: &AgentProfile,
        tool: &str,
        args: Value,
    ) -> Result<Value, ToolError> {
        if !profile.allows(tool) {
            return Err(ToolError::PermissionDenied {
                agent_id: profile.id.clone(),
                tool: tool.to_string(),
                allowed: profile.allowed_tools.iter().cloned().collect(),
            });
        }
        let hub = self.tools.as_ref().ok_or_else(|| {
            ToolError::Connection(format!("Agent {} has no tool hub configured", profile.id))
        })?;

        self.emit(
            EventKind::ToolInvoked,
            &profile.id,
            json!({ "tool_name": tool, "parameters": args }),
        );
        let result = hub.call_tool(tool, args).await;
        let payload = match &result {
            Ok(v) => json!({ "tool_name": tool, "success": true, "result": v }),
            Err(e) => json!({ "tool_name": tool, "success": false, "error": e.to_string() }),
        };
        self.emit(EventKind::ToolCompleted, &profile.id, payload);
        result
    }

    /// 白名单内工具的 LLM 定义；无工具中枢时为空
    pub async fn tool_definitions(&self, profile: &AgentProfile) -> Vec<ToolDefinition> {
        let Some(hub) = &self.tools else {
            return Vec::new();
        };
        let mut defs = Vec::with_capacity(profile.allowed_tools.len());
        for name in &profile.allowed_tools {
            let info = hub.tool_info(name).await;
            defs.push(ToolDefinition {
                name: info.name,
                description: info.description,
                parameters: info.input_schema,
            });
        }
        defs
    }

    pub fn completion_options(&self, profile: &AgentProfile, tools: Vec<ToolDefinition>) -> CompletionOptions {
        CompletionOptions {
            model: profile.model.clone(),
            tools,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

/// Agent 能力接口
#[async_trait]
pub trait Agent: Send + Sync {
    fn profile(&self) -> &AgentProfile;

    fn runtime(&self) -> &AgentRuntime;

    /// 实际工作；由 execute 包裹事件与元数据
    async fn run_task(&self, task: &TaskSpec) -> TaskResult;

    fn id(&self) -> &str {
        &self.profile().id
    }

    /// 执行任务：TaskStarted -> run_task -> TaskCompleted / TaskFailed
    async fn execute(&self, task: &TaskSpec) -> TaskResult {
        let profile = self.profile();
        self.emit_event(EventKind::TaskStarted, json!({ "task": task }));

        let mut result = self.run_task(task).await;
        result
            .metadata
            .insert("machine_id".to_string(), json!(profile.machine_id));
        result
            .metadata
            .insert("function".to_string(), json!(profile.function));

        if result.is_success() {
            self.emit_event(
                EventKind::TaskCompleted,
                json!({ "task": task, "result": result.output }),
            );
        } else {
            tracing::warn!(agent = %profile.id, "task failed: {}", result.error.as_deref().unwrap_or_default());
            self.emit_event(
                EventKind::TaskFailed,
                json!({ "task": task, "error": result.error }),
            );
        }
        result
    }

    async fn invoke_tool(&self, tool: &str, args: Value) -> Result<Value, ToolError> {
        self.runtime().invoke_tool(self.profile(), tool, args).await
    }

    fn emit_event(&self, kind: EventKind, payload: Value) {
        self.runtime().emit(kind, self.id(), payload);
    }
}

#[async_trait]
impl<T: Agent + ?Sized> ToolInvoker for T {
    async fn invoke(&self, tool: &str, args: Value) -> Result<Value, ToolError> {
        Agent::invoke_tool(self, tool, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{FnTool, LocalToolServer};

    struct Echo {
        profile: AgentProfile,
        runtime: AgentRuntime,
    }

    #[async_trait]
    impl Agent for Echo {
        fn profile(&self) -> &AgentProfile {
            &self.profile
        }
        fn runtime(&self) -> &AgentRuntime {
            &self.runtime
        }
        async fn run_task(&self, task: &TaskSpec) -> TaskResult {
            if task.instruction == "fail" {
                TaskResult::failure(self.id(), "asked to fail")
            } else {
                TaskResult::success(self.id(), json!(task.instruction))
            }
        }
    }

    async fn echo_agent() -> Echo {
        let hub = Arc::new(ToolHub::default());
        hub.connect(Arc::new(
            LocalToolServer::new("database")
                .with_tool(FnTool::new("sql_query", "Run SQL", |_| Ok(json!([1, 2])))),
        ))
        .await
        .unwrap();
        let runtime = AgentRuntime::new(Arc::new(SharedContext::new()), Arc::new(EventBus::default()))
            .with_tools(hub);
        Echo {
            profile: AgentProfile::new("m1_fetch", "Fetcher", "m1", "data_fetching")
                .with_tools(["sql_query"]),
            runtime,
        }
    }

    #[tokio::test]
    async fn test_execute_emits_lifecycle_events_and_metadata() {
        let agent = echo_agent().await;
        let ok = agent.execute(&TaskSpec::new("hello")).await;
        assert!(ok.is_success());
        assert_eq!(ok.metadata["machine_id"], "m1");
        assert_eq!(ok.metadata["function"], "data_fetching");

        let failed = agent.execute(&TaskSpec::new("fail")).await;
        assert_eq!(failed.status, TaskStatus::Failed);

        let bus = &agent.runtime.events;
        assert_eq!(bus.history(Some(EventKind::TaskStarted), None, 10).len(), 2);
        assert_eq!(bus.history(Some(EventKind::TaskCompleted), None, 10).len(), 1);
        assert_eq!(bus.history(Some(EventKind::TaskFailed), Some("m1_fetch"), 10).len(), 1);
    }

    #[tokio::test]
    async fn test_invoke_tool_checks_permission_before_events() {
        let agent = echo_agent().await;
        let err = agent.invoke_tool("drop_tables", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::PermissionDenied { .. }));
        assert!(agent.runtime.events.history(Some(EventKind::ToolInvoked), None, 10).is_empty());

        let out = agent.invoke_tool("sql_query", json!({})).await.unwrap();
        assert_eq!(out, json!([1, 2]));
        let completed = agent.runtime.events.history(Some(EventKind::ToolCompleted), None, 10);
        assert_eq!(completed[0].payload["success"], true);
    }

    #[tokio::test]
    async fn test_tool_definitions_cover_allowed_tools() {
        let agent = echo_agent().await;
        let defs = agent.runtime.tool_definitions(&agent.profile).await;
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].description, "Run SQL");
    }

    #[test]
    fn test_can_handle_is_exact() {
        let p = AgentProfile::new("a", "A", "m1", "analysis");
        assert!(p.can_handle("m1", "analysis"));
        assert!(!p.can_handle("M1", "analysis"));
        assert!(!p.can_handle("m1", "Analysis"));
    }
}
