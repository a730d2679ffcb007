//! 机台级协调器缓存
//!
//! 每个机台一个协调器，各自持有共享上下文、事件总线与注册表；推理提供方、工具中枢与工作流历史全局共享。
//! 首次查询时按配置构建，之后复用，直到显式 clear。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::agents::{build_agent, AgentRegistry, AgentRuntime};
use crate::config::{resolve_env_vars, AppConfig, MachineInfo};
use crate::core::audit::{AuditSink, WorkflowHistory};
use crate::core::context::SharedContext;
use crate::core::coordinator::Coordinator;
use crate::core::error::OrchestratorError;
use crate::core::events::EventBus;
use crate::core::routing::{RoutingExample, RoutingStrategy};
use crate::llm::{create_provider, LlmProvider};
use crate::tools::{HttpToolServer, ToolHub};

/// 一次查询的对外结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    pub success: bool,
    pub response: String,
    /// 本次实际执行的 Agent 数（计划中的步骤数），不是机台上注册的 Agent 总数
    pub agent_count: usize,
    pub execution_time_ms: u64,
    pub error: Option<String>,
}

pub struct CoordinatorCache {
    config: AppConfig,
    provider: Option<Arc<dyn LlmProvider>>,
    tools: Arc<ToolHub>,
    history: Option<Arc<WorkflowHistory>>,
    coordinators: Mutex<HashMap<String, Arc<Coordinator>>>,
}

impl CoordinatorCache {
    /// 直接注入提供方、工具中枢与历史（测试、嵌入使用）
    pub fn new(
        config: AppConfig,
        provider: Option<Arc<dyn LlmProvider>>,
        tools: Arc<ToolHub>,
        history: Option<Arc<WorkflowHistory>>,
    ) -> Self {
        Self {
            config,
            provider,
            tools,
            history,
            coordinators: Mutex::new(HashMap::new()),
        }
    }

    /// 按配置创建提供方、连接工具服务器、打开历史库
    pub async fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let provider = create_provider(&config.llm)?;
        let tools = Arc::new(ToolHub::new(config.tools.tool_timeout_secs));

        for (name, server) in &config.tool_servers {
            if server.transport != "http" {
                warn!(server = %name, transport = %server.transport, "unsupported tool server transport, skipping");
                continue;
            }
            let endpoint = resolve_env_vars(&server.endpoint)?;
            let token = server
                .bearer_token
                .as_deref()
                .map(resolve_env_vars)
                .transpose()?;
            let http = HttpToolServer::new(name, endpoint, token, config.tools.tool_timeout_secs);
            match tools.connect(Arc::new(http)).await {
                Ok(names) => info!(server = %name, tools = names.len(), "tool server connected"),
                Err(e) => warn!(server = %name, "tool server unavailable: {}", e),
            }
        }

        let history = match &config.app.history_db {
            Some(path) => Some(Arc::new(
                WorkflowHistory::open(path)
                    .with_context(|| format!("Failed to open history database {}", path.display()))?,
            )),
            None => None,
        };

        Ok(Self::new(config, provider, tools, history))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn tools(&self) -> &Arc<ToolHub> {
        &self.tools
    }

    pub fn history(&self) -> Option<&Arc<WorkflowHistory>> {
        self.history.as_ref()
    }

    pub fn machine_infos(&self) -> Vec<MachineInfo> {
        self.config.machine_infos()
    }

    pub fn machine_info(&self, machine_id: &str) -> Option<MachineInfo> {
        self.config.machine_info(machine_id)
    }

    fn build(&self, machine_id: &str) -> Result<Coordinator, OrchestratorError> {
        let sections = self.config.agents_for_machine(machine_id);
        if sections.is_empty() {
            return Err(OrchestratorError::MachineNotFound(machine_id.to_string()));
        }

        let context = Arc::new(SharedContext::new());
        let events = Arc::new(EventBus::new(self.config.events.history_capacity));
        let mut runtime = AgentRuntime::new(context.clone(), events.clone())
            .with_tools(self.tools.clone())
            .configured(&self.config);
        if let Some(provider) = &self.provider {
            runtime = runtime.with_provider(provider.clone());
        }

        let mut registry = AgentRegistry::new();
        for section in sections {
            registry.register(build_agent(section, runtime.clone(), &self.config.llm.model));
        }

        let strategy = self
            .config
            .routing
            .strategy
            .parse::<RoutingStrategy>()
            .map_err(OrchestratorError::Config)?;
        let examples = self
            .config
            .routing
            .examples
            .iter()
            .filter(|e| e.machine_id == machine_id)
            .map(RoutingExample::from)
            .collect();

        let mut coordinator = Coordinator::new(Arc::new(registry), context, events)
            .with_strategy(strategy)
            .with_examples(examples);
        if let Some(provider) = &self.provider {
            coordinator = coordinator.with_provider(provider.clone(), self.config.llm.model.clone());
        }
        if let Some(history) = &self.history {
            coordinator = coordinator.with_audit(history.clone() as Arc<dyn AuditSink>);
        }
        Ok(coordinator)
    }

    /// 取缓存中的协调器，不存在时按配置构建
    pub async fn get_or_create(&self, machine_id: &str) -> Result<Arc<Coordinator>, OrchestratorError> {
        let mut coordinators = self.coordinators.lock().await;
        if let Some(existing) = coordinators.get(machine_id) {
            return Ok(existing.clone());
        }
        let coordinator = Arc::new(self.build(machine_id)?);
        info!(
            machine = %machine_id,
            agents = coordinator.registry().len(),
            "coordinator created"
        );
        coordinators.insert(machine_id.to_string(), coordinator.clone());
        Ok(coordinator)
    }

    pub async fn execute_query(&self, machine_id: &str, query: &str) -> QueryResponse {
        let started = Instant::now();
        let coordinator = match self.get_or_create(machine_id).await {
            Ok(c) => c,
            Err(e) => {
                warn!(machine = %machine_id, "query rejected: {}", e);
                return QueryResponse {
                    success: false,
                    response: String::new(),
                    agent_count: 0,
                    execution_time_ms: started.elapsed().as_millis() as u64,
                    error: Some(e.to_string()),
                };
            }
        };

        let outcome = coordinator.execute_workflow(query).await;
        QueryResponse {
            success: outcome.is_completed(),
            response: outcome.final_output.unwrap_or_default(),
            agent_count: outcome.results.len(),
            execution_time_ms: started.elapsed().as_millis() as u64,
            error: outcome.error,
        }
    }

    /// 清除指定机台或全部缓存，返回清除数量
    pub async fn clear(&self, machine_id: Option<&str>) -> usize {
        let mut coordinators = self.coordinators.lock().await;
        let removed = match machine_id {
            Some(m) => usize::from(coordinators.remove(m).is_some()),
            None => {
                let n = coordinators.len();
                coordinators.clear();
                n
            }
        };
        info!(machine = ?machine_id, removed, "coordinator cache cleared");
        removed
    }

    pub async fn cached_machines(&self) -> Vec<String> {
        let mut machines: Vec<String> = self.coordinators.lock().await.keys().cloned().collect();
        machines.sort();
        machines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::config::{AgentSection, RoutingExampleSection};
    use crate::llm::{LlmResponse, MockLlmProvider};

    fn section(id: &str, machine: &str, function: &str) -> AgentSection {
        AgentSection {
            id: id.to_string(),
            name: id.to_string(),
            machine_id: machine.to_string(),
            function: function.to_string(),
            ..AgentSection::default()
        }
    }

    fn config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.agents = vec![
            section("m1_fetch", "m1", "data_fetching"),
            section("m1_summary", "m1", "summary"),
            section("m2_fetch", "m2", "data_fetching"),
        ];
        cfg.routing.examples = vec![RoutingExampleSection {
            keywords: vec!["spindle".to_string()],
            machine_id: "m1".to_string(),
            description: String::new(),
        }];
        cfg
    }

    #[tokio::test]
    async fn test_coordinators_are_reused_and_cleared() {
        let cache = CoordinatorCache::new(config(), None, Arc::new(ToolHub::default()), None);
        let a = cache.get_or_create("m1").await.unwrap();
        let b = cache.get_or_create("m1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.registry().len(), 2);
        assert_eq!(a.routing_examples().len(), 1);

        cache.get_or_create("m2").await.unwrap();
        assert_eq!(cache.cached_machines().await, vec!["m1", "m2"]);
        assert_eq!(cache.clear(Some("m1")).await, 1);
        assert_eq!(cache.clear(Some("m1")).await, 0);

        let c = cache.get_or_create("m1").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.clear(None).await, 2);
        assert!(cache.cached_machines().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_machine() {
        let cache = CoordinatorCache::new(config(), None, Arc::new(ToolHub::default()), None);
        let resp = cache.execute_query("m9", "anything").await;
        assert!(!resp.success);
        assert_eq!(resp.agent_count, 0);
        assert_eq!(resp.error.as_deref(), Some("Machine m9 is not configured"));
    }

    #[tokio::test]
    async fn test_execute_query_with_mock_provider_and_history() {
        let provider = Arc::new(MockLlmProvider::scripted(vec![LlmResponse::text("Spindle is nominal")]));
        let history = Arc::new(WorkflowHistory::in_memory().unwrap());
        let cache = CoordinatorCache::new(
            config(),
            Some(provider.clone()),
            Arc::new(ToolHub::default()),
            Some(history.clone()),
        );

        let resp = cache.execute_query("m1", "how is the spindle?").await;
        assert!(resp.success, "{:?}", resp.error);
        assert_eq!(resp.response, "Spindle is nominal");
        assert_eq!(resp.agent_count, 2);
        assert_eq!(provider.call_count(), 2);

        let recent = history.recent(5).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].query, "how is the spindle?");
        assert_eq!(recent[0].metadata["step_count"], json!(2));
    }

    #[tokio::test]
    async fn test_agent_count_reports_agents_that_ran() {
        let mut cfg = config();
        cfg.agents.push(section("m1_maintenance", "m1", "maintenance"));
        let provider = Arc::new(MockLlmProvider::text("All clear"));
        let cache = CoordinatorCache::new(cfg, Some(provider), Arc::new(ToolHub::default()), None);

        let resp = cache.execute_query("m1", "status").await;
        assert!(resp.success, "{:?}", resp.error);
        assert_eq!(resp.agent_count, 2);
        assert_eq!(cache.get_or_create("m1").await.unwrap().registry().len(), 3);
    }

    #[tokio::test]
    async fn test_bad_routing_strategy_is_reported() {
        let mut cfg = config();
        cfg.routing.strategy = "astrology".to_string();
        let cache = CoordinatorCache::new(cfg, None, Arc::new(ToolHub::default()), None);
        let err = cache.get_or_create("m1").await.unwrap_err();
        assert!(err.to_string().contains("astrology"));
    }
}
