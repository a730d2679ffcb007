//! Mock 推理提供方（用于测试，无需 API）
//!
//! 按脚本依次返回预设响应；脚本耗尽后重复最后一条（或返回默认文本）。记录调用次数与收到的消息。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::json;

use crate::llm::traits::{ChatMessage, CompletionOptions, LlmError, LlmProvider, LlmResponse, ToolCall};

enum Script {
    Queue(Mutex<VecDeque<Result<LlmResponse, LlmError>>>),
    /// 每次都请求调用同一工具
    AlwaysToolCall { tool: String },
}

/// Mock 提供方
pub struct MockLlmProvider {
    script: Script,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
}

impl Default for MockLlmProvider {
    fn default() -> Self {
        Self::scripted(Vec::new())
    }
}

impl MockLlmProvider {
    pub fn scripted(responses: Vec<LlmResponse>) -> Self {
        Self::from_results(responses.into_iter().map(Ok).collect())
    }

    /// 脚本中可混入错误，用于模拟上游失败
    pub fn from_results(results: Vec<Result<LlmResponse, LlmError>>) -> Self {
        Self {
            script: Script::Queue(Mutex::new(results.into())),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::scripted(vec![LlmResponse::text(content)])
    }

    pub fn always_tool_call(tool: impl Into<String>) -> Self {
        Self {
            script: Script::AlwaysToolCall { tool: tool.into() },
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 第 n 次调用时收到的消息
    pub fn messages_at(&self, n: usize) -> Option<Vec<ChatMessage>> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(n)
            .cloned()
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _options: &CompletionOptions,
    ) -> Result<LlmResponse, LlmError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(messages.to_vec());

        match &self.script {
            Script::AlwaysToolCall { tool } => Ok(LlmResponse::with_tool_calls(vec![ToolCall {
                id: format!("call_{}", n),
                name: tool.clone(),
                arguments: json!({}),
            }])),
            Script::Queue(queue) => {
                let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
                match queue.len() {
                    0 => Ok(LlmResponse::text("Mock response")),
                    1 => queue
                        .front()
                        .cloned()
                        .unwrap_or_else(|| Ok(LlmResponse::text("Mock response"))),
                    _ => queue
                        .pop_front()
                        .unwrap_or_else(|| Ok(LlmResponse::text("Mock response"))),
                }
            }
        }
    }
}
