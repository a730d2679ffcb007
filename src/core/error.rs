//! 编排层错误类型与错误分类
//!
//! 与工作流入口配合：execute_workflow 捕获所有 OrchestratorError，记为 FAILED 并保存错误文本，
//! 不向调用方抛出。ErrorKind 给出错误的处理归属（找不到 / 权限 / 上游失败 / 致命）。

use serde::Serialize;
use thiserror::Error;

use crate::llm::LlmError;
use crate::tools::ToolError;

/// 工作流运行过程中可能出现的错误（路由失败、Agent 缺失、上游 LLM / 工具失败等）
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("No agents available in registry")]
    NoAgentsAvailable,

    #[error("Agent {0} not found in registry")]
    AgentNotFound(String),

    #[error("Machine {0} is not configured")]
    MachineNotFound(String),

    #[error("Agent {agent_id} panicked: {message}")]
    AgentPanicked { agent_id: String, message: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// 错误归属：决定错误是返回给调用方、折叠进对话、记为失败步骤还是终止工作流
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 缺失的 Agent / 工具 / 键，直接返回给调用方，不重试
    NotFound,
    /// 工具不在 Agent 白名单内，折叠进推理对话，可自我修正
    Permission,
    /// LLM 或工具提供方报错，记为失败的任务 / 步骤，工作流继续
    Upstream,
    /// 工作流级错误，终止当前工作流并返回失败状态
    Fatal,
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::NoAgentsAvailable
            | OrchestratorError::AgentNotFound(_)
            | OrchestratorError::AgentPanicked { .. } => ErrorKind::Fatal,
            OrchestratorError::MachineNotFound(_) => ErrorKind::NotFound,
            OrchestratorError::Config(_) => ErrorKind::Fatal,
            OrchestratorError::Llm(_) => ErrorKind::Upstream,
            OrchestratorError::Tool(e) => e.kind(),
        }
    }
}
