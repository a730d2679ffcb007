//! LLM 层：推理提供方抽象与实现（OpenAI 兼容 / Mock），以及按配置创建提供方

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

use crate::config::{resolve_env_vars, LlmSection};

pub use mock::MockLlmProvider;
pub use openai::{OpenAiProvider, TokenUsage};
pub use traits::{
    ChatMessage, CompletionOptions, FinishReason, LlmError, LlmProvider, LlmResponse, Role,
    ToolCall, ToolDefinition, Usage, DEFAULT_MODEL, DEFAULT_TEMPERATURE,
};

/// 根据 [llm] 段创建提供方；provider 为 none（或空）时返回 None，Agent 走无 LLM 的确定性输出
pub fn create_provider(cfg: &LlmSection) -> anyhow::Result<Option<Arc<dyn LlmProvider>>> {
    match cfg.provider.to_lowercase().as_str() {
        "" | "none" => {
            tracing::warn!("No LLM provider configured, agents will return stub results");
            Ok(None)
        }
        "mock" => {
            tracing::info!("Using Mock LLM");
            Ok(Some(Arc::new(MockLlmProvider::default())))
        }
        "openai" => {
            let api_key = cfg.api_key.as_deref().map(resolve_env_vars).transpose()?;
            let base_url = cfg.base_url.as_deref().map(resolve_env_vars).transpose()?;
            tracing::info!("Using OpenAI-compatible LLM ({})", cfg.model);
            Ok(Some(Arc::new(OpenAiProvider::new(
                base_url.as_deref(),
                api_key.as_deref(),
                cfg.timeout_secs,
            ))))
        }
        other => anyhow::bail!("Unsupported LLM provider type: {}", other),
    }
}
