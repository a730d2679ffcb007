//! Agent 层：执行契约、专职 / 检索 Agent 与注册表

pub mod agent;
pub mod rag;
pub mod registry;
pub mod specialized;

use std::sync::Arc;

use crate::config::{AgentKind, AgentSection};

pub use agent::{Agent, AgentProfile, AgentRuntime, TaskResult, TaskSpec, TaskStatus};
pub use rag::{RagAgent, QUERY_DOCUMENTS_TOOL};
pub use registry::AgentRegistry;
pub use specialized::{build_system_prompt, SpecializedAgent};

/// 按 [[agents]] 段构建 Agent
pub fn build_agent(section: &AgentSection, runtime: AgentRuntime, default_model: &str) -> Arc<dyn Agent> {
    let profile = AgentProfile::from_section(section, default_model);
    match section.kind {
        AgentKind::Specialized => Arc::new(SpecializedAgent::new(profile, runtime)),
        AgentKind::Rag => Arc::new(RagAgent::new(profile, runtime, section.rag.clone())),
    }
}
