//! 工作流协调器
//!
//! 一次查询的完整生命周期：
//! Routing -> Planning -> Executing(i) -> Aggregating -> Completed / Failed
//!
//! - 路由：关键词示例或 LLM 意图，得到目标机台
//! - 规划：固定三段（data_fetching / analysis / summary），缺少对应 Agent 的阶段直接略过
//! - 执行：严格串行；成功输出写入共享上下文供后续步骤读取；失败记录后继续
//! - 汇总：倒序取第一个成功结果
//!
//! execute_workflow 是单次查询的错误边界：任何错误（包括 Agent panic）都记为 Failed 返回，不向外抛出。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use chrono::Utc;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::{AgentRegistry, TaskResult, TaskSpec};
use crate::core::audit::{AuditRecord, AuditSink};
use crate::core::context::{render_value, SharedContext};
use crate::core::error::OrchestratorError;
use crate::core::events::{Event, EventBus, EventKind};
use crate::core::routing::{keyword_route, llm_route, RoutingExample, RoutingMethod, RoutingStrategy};
use crate::llm::{LlmProvider, DEFAULT_MODEL};

/// 协调器在事件与上下文写入中使用的身份
pub const COORDINATOR_ID: &str = "coordinator";

/// 无任何成功步骤时的汇总结果
pub const NO_RESULTS_MESSAGE: &str = "No results available";

pub const DATA_FETCHING: &str = "data_fetching";
pub const ANALYSIS: &str = "analysis";
pub const SUMMARY: &str = "summary";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowPhase {
    Routing,
    Planning,
    Executing(usize),
    Aggregating,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowStep {
    pub agent_id: String,
    pub task: TaskSpec,
    /// 成功输出写入的上下文键
    pub context_key: String,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowPlan {
    pub machine_id: String,
    pub steps: Vec<WorkflowStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        }
    }
}

/// 一次工作流的结果；失败时保留已完成的部分（路由、计划、步骤结果）
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowOutcome {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub query: String,
    pub method: Option<RoutingMethod>,
    pub machine_id: Option<String>,
    pub plan: Option<WorkflowPlan>,
    pub results: Vec<TaskResult>,
    pub final_output: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl WorkflowOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }
}

/// 执行过程中逐步填充，失败时用于构造部分结果
#[derive(Default)]
struct Progress {
    method: Option<RoutingMethod>,
    machine_id: Option<String>,
    plan: Option<WorkflowPlan>,
    results: Vec<TaskResult>,
}

pub struct Coordinator {
    registry: Arc<AgentRegistry>,
    context: Arc<SharedContext>,
    events: Arc<EventBus>,
    examples: RwLock<Vec<RoutingExample>>,
    strategy: RoutingStrategy,
    provider: Option<Arc<dyn LlmProvider>>,
    routing_model: String,
    audit: Option<Arc<dyn AuditSink>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("registry", &self.registry)
            .field("strategy", &self.strategy)
            .field("has_provider", &self.provider.is_some())
            .field("has_audit", &self.audit.is_some())
            .finish()
    }
}

impl Coordinator {
    pub fn new(registry: Arc<AgentRegistry>, context: Arc<SharedContext>, events: Arc<EventBus>) -> Self {
        Self {
            registry,
            context,
            events,
            examples: RwLock::new(Vec::new()),
            strategy: RoutingStrategy::Keyword,
            provider: None,
            routing_model: DEFAULT_MODEL.to_string(),
            audit: None,
        }
    }

    pub fn with_strategy(mut self, strategy: RoutingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// LLM 意图路由使用的提供方与模型
    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        self.provider = Some(provider);
        self.routing_model = model.into();
        self
    }

    pub fn with_examples(self, examples: Vec<RoutingExample>) -> Self {
        *self.examples.write().unwrap_or_else(PoisonError::into_inner) = examples;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn context(&self) -> &Arc<SharedContext> {
        &self.context
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    pub fn add_routing_example(
        &self,
        keywords: Vec<String>,
        machine_id: impl Into<String>,
        description: impl Into<String>,
    ) {
        self.examples
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RoutingExample {
                keywords,
                machine_id: machine_id.into(),
                description: description.into(),
            });
    }

    pub fn routing_examples(&self) -> Vec<RoutingExample> {
        self.examples
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 路由：LLM 策略失败时回退关键词；关键词未命中取注册表第一个机台
    pub async fn route(&self, query: &str) -> Result<(String, RoutingMethod), OrchestratorError> {
        let examples = self.routing_examples();
        if self.strategy == RoutingStrategy::Llm {
            match &self.provider {
                Some(provider) => {
                    let machines = self.registry.machines();
                    if let Some(machine) =
                        llm_route(provider.as_ref(), &self.routing_model, query, &machines, &examples).await
                    {
                        return Ok((machine, RoutingMethod::LlmIntent));
                    }
                }
                None => debug!("LLM routing configured without provider, using keywords"),
            }
        }

        if let Some(machine) = keyword_route(&examples, query) {
            return Ok((machine, RoutingMethod::KeywordMatching));
        }
        self.registry
            .machines()
            .into_iter()
            .next()
            .map(|m| (m, RoutingMethod::KeywordMatching))
            .ok_or(OrchestratorError::NoAgentsAvailable)
    }

    /// 规划：按 data_fetching -> analysis -> summary 顺序，只保留有 Agent 的阶段
    pub fn plan(&self, machine_id: &str, query: &str) -> WorkflowPlan {
        let data_key = format!("{}.data", machine_id);
        let analysis_key = format!("{}.analysis", machine_id);
        let summary_key = format!("{}.final_summary", machine_id);

        let stages = [
            (
                DATA_FETCHING,
                TaskSpec::new(format!("Fetch relevant data for: {}", query))
                    .with_parameter("query", json!(query)),
                data_key.clone(),
                "Fetched machine data",
            ),
            (
                ANALYSIS,
                TaskSpec::new(format!("Analyze the data to answer: {}", query))
                    .with_parameter("query", json!(query))
                    .with_context_keys(vec![data_key.clone()]),
                analysis_key.clone(),
                "Analysis results",
            ),
            (
                SUMMARY,
                TaskSpec::new(format!("Create a summary answering: {}", query))
                    .with_parameter("query", json!(query))
                    .with_context_keys(vec![data_key, analysis_key]),
                summary_key,
                "Final summary",
            ),
        ];

        let steps = stages
            .into_iter()
            .filter_map(|(function, task, context_key, summary)| {
                let agent = self.registry.find(machine_id, function)?;
                Some(WorkflowStep {
                    agent_id: agent.id().to_string(),
                    task,
                    context_key,
                    summary: summary.to_string(),
                })
            })
            .collect();

        WorkflowPlan {
            machine_id: machine_id.to_string(),
            steps,
        }
    }

    fn enter(&self, workflow_id: &str, phase: WorkflowPhase) {
        debug!(workflow = %workflow_id, ?phase, "workflow phase");
    }

    fn publish(&self, kind: EventKind, payload: Value) {
        self.events.publish(Event::new(kind, COORDINATOR_ID, payload));
    }

    async fn run(&self, workflow_id: &str, query: &str, progress: &mut Progress) -> Result<String, OrchestratorError> {
        self.enter(workflow_id, WorkflowPhase::Routing);
        let (machine_id, method) = self.route(query).await?;
        info!(workflow = %workflow_id, machine = %machine_id, method = method.as_str(), "query routed");
        progress.method = Some(method);
        progress.machine_id = Some(machine_id.clone());

        self.enter(workflow_id, WorkflowPhase::Planning);
        let plan = self.plan(&machine_id, query);
        progress.plan = Some(plan.clone());

        for (i, step) in plan.steps.iter().enumerate() {
            self.enter(workflow_id, WorkflowPhase::Executing(i));
            let agent = self
                .registry
                .get(&step.agent_id)
                .ok_or_else(|| OrchestratorError::AgentNotFound(step.agent_id.clone()))?;

            let result = AssertUnwindSafe(agent.execute(&step.task))
                .catch_unwind()
                .await
                .map_err(|panic| OrchestratorError::AgentPanicked {
                    agent_id: step.agent_id.clone(),
                    message: panic_message(panic.as_ref()),
                })?;

            if result.is_success() {
                if let Some(output) = &result.output {
                    self.context.write(
                        &step.context_key,
                        output.clone(),
                        Some(COORDINATOR_ID),
                        Some(&step.summary),
                    );
                }
            } else {
                warn!(
                    workflow = %workflow_id,
                    agent = %step.agent_id,
                    "step failed, continuing: {}",
                    result.error.as_deref().unwrap_or_default()
                );
            }
            progress.results.push(result);
        }

        self.enter(workflow_id, WorkflowPhase::Aggregating);
        Ok(aggregate(&progress.results))
    }

    /// 执行一次查询；永不返回错误
    pub async fn execute_workflow(&self, query: &str) -> WorkflowOutcome {
        let started = Instant::now();
        let workflow_id = Uuid::new_v4().to_string();
        self.publish(
            EventKind::WorkflowStarted,
            json!({ "query": query, "workflow_id": workflow_id }),
        );

        let mut progress = Progress::default();
        let result = self.run(&workflow_id, query, &mut progress).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (status, final_output, error) = match result {
            Ok(output) => {
                self.enter(&workflow_id, WorkflowPhase::Completed);
                self.publish(
                    EventKind::WorkflowCompleted,
                    json!({
                        "workflow_id": workflow_id,
                        "status": WorkflowStatus::Completed.as_str(),
                        "results": progress.results,
                    }),
                );
                (WorkflowStatus::Completed, Some(output), None)
            }
            Err(e) => {
                self.enter(&workflow_id, WorkflowPhase::Failed);
                warn!(workflow = %workflow_id, kind = ?e.kind(), "workflow failed: {}", e);
                let message = e.to_string();
                self.publish(
                    EventKind::WorkflowCompleted,
                    json!({
                        "workflow_id": workflow_id,
                        "status": WorkflowStatus::Failed.as_str(),
                        "error": message,
                    }),
                );
                (WorkflowStatus::Failed, None, Some(message))
            }
        };

        let outcome = WorkflowOutcome {
            workflow_id,
            status,
            query: query.to_string(),
            method: progress.method,
            machine_id: progress.machine_id,
            plan: progress.plan,
            results: progress.results,
            final_output,
            error,
            duration_ms,
        };
        self.write_audit(&outcome).await;
        outcome
    }

    /// 审计写入可能是同步磁盘 IO，放到阻塞线程池执行；等待其完成以便返回后可查
    async fn write_audit(&self, outcome: &WorkflowOutcome) {
        let Some(sink) = self.audit.clone() else {
            return;
        };
        let mut metadata = Map::new();
        metadata.insert("workflow_id".to_string(), json!(outcome.workflow_id));
        metadata.insert("machine_id".to_string(), json!(outcome.machine_id));
        metadata.insert("step_count".to_string(), json!(outcome.results.len()));
        if let Some(method) = outcome.method {
            metadata.insert("routing_method".to_string(), json!(method.as_str()));
        }
        let record = AuditRecord {
            workflow_id: outcome.workflow_id.clone(),
            timestamp: Utc::now(),
            query: outcome.query.clone(),
            status: outcome.status.as_str().to_string(),
            machine_id: outcome.machine_id.clone(),
            final_output: outcome.final_output.clone(),
            error: outcome.error.clone(),
            duration_ms: outcome.duration_ms,
            step_count: outcome.results.len(),
            metadata,
        };
        match tokio::task::spawn_blocking(move || sink.record(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(workflow = %outcome.workflow_id, "audit sink rejected record: {}", e),
            Err(e) => warn!(workflow = %outcome.workflow_id, "audit write task failed: {}", e),
        }
    }
}

/// 倒序取第一个成功结果：优先其 message 字段，否则整个输出
pub fn aggregate(results: &[TaskResult]) -> String {
    results
        .iter()
        .rev()
        .filter(|r| r.is_success())
        .find_map(|r| r.output.as_ref())
        .map(|output| match output.get("message") {
            Some(message) => render_value(message),
            None => render_value(output),
        })
        .unwrap_or_else(|| NO_RESULTS_MESSAGE.to_string())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
