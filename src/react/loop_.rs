//! 工具调用循环
//!
//! 请求补全 -> 有工具调用则逐个执行并把结果作为 tool 消息回填 -> 下一轮；无工具调用时内容即最终答案。
//! 轮数达到上限时返回固定提示文本（视为成功）；工具错误折叠进对话，LLM 错误直接返回。

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::core::context::render_value;
use crate::core::ErrorKind;
use crate::llm::{ChatMessage, CompletionOptions, LlmError, LlmProvider};
use crate::tools::ToolError;

/// 单次任务内最大推理轮数，防止死循环
pub const MAX_TOOL_ITERATIONS: usize = 10;

/// 达到轮数上限时的最终输出
pub const MAX_ITERATIONS_MESSAGE: &str =
    "Task execution reached maximum iterations. Please review the results.";

/// LLM 返回空内容时的最终输出
pub const EMPTY_ANSWER_MESSAGE: &str = "Task completed successfully.";

/// 循环内的工具调用入口（由 Agent 提供：白名单检查、事件、路由到工具中枢）
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, tool: &str, args: Value) -> Result<Value, ToolError>;
}

/// 一次失败的工具调用，记录在任务元数据中
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolFailure {
    pub call_id: String,
    pub tool: String,
    pub kind: ErrorKind,
    pub error: String,
}

/// 循环结果：最终回复、完整对话、轮数与工具失败
#[derive(Debug)]
pub struct LoopOutcome {
    pub response: String,
    pub messages: Vec<ChatMessage>,
    pub iterations: usize,
    pub tool_failures: Vec<ToolFailure>,
    /// 是否因达到轮数上限而结束
    pub hit_limit: bool,
}

/// 循环会话配置
pub struct ToolLoopSession<'a> {
    pub provider: &'a dyn LlmProvider,
    pub invoker: &'a dyn ToolInvoker,
    /// 模型、温度与可用工具定义
    pub options: CompletionOptions,
    pub max_iterations: usize,
}

impl<'a> ToolLoopSession<'a> {
    pub fn new(provider: &'a dyn LlmProvider, invoker: &'a dyn ToolInvoker) -> Self {
        Self {
            provider,
            invoker,
            options: CompletionOptions::default(),
            max_iterations: MAX_TOOL_ITERATIONS,
        }
    }

    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }
}

/// 工具错误折叠为 tool 消息文本：权限错误原样，其余加前缀
fn fold_tool_error(err: &ToolError) -> String {
    match err {
        ToolError::PermissionDenied { .. } => err.to_string(),
        _ => format!("Error executing tool: {}", err),
    }
}

pub async fn tool_loop(
    session: ToolLoopSession<'_>,
    mut messages: Vec<ChatMessage>,
) -> Result<LoopOutcome, LlmError> {
    let mut tool_failures = Vec::new();

    for iteration in 1..=session.max_iterations {
        tracing::debug!(iteration, messages = messages.len(), "tool loop step");
        let response = session
            .provider
            .complete(&messages, &session.options)
            .await?;

        if !response.has_tool_calls() {
            let answer = if response.content.trim().is_empty() {
                EMPTY_ANSWER_MESSAGE.to_string()
            } else {
                response.content.clone()
            };
            messages.push(ChatMessage::assistant(response.content));
            return Ok(LoopOutcome {
                response: answer,
                messages,
                iterations: iteration,
                tool_failures,
                hit_limit: false,
            });
        }

        let calls = response.tool_calls.clone();
        messages.push(ChatMessage::assistant_with_calls(response.content, response.tool_calls));

        for call in calls {
            let content = match session.invoker.invoke(&call.name, call.arguments.clone()).await {
                Ok(result) => render_value(&result),
                Err(e) => {
                    tracing::warn!(tool = %call.name, "tool call failed: {}", e);
                    let text = fold_tool_error(&e);
                    tool_failures.push(ToolFailure {
                        call_id: call.id.clone(),
                        tool: call.name.clone(),
                        kind: e.kind(),
                        error: e.to_string(),
                    });
                    text
                }
            };
            messages.push(ChatMessage::tool(call.id, content));
        }
    }

    tracing::warn!(max_iterations = session.max_iterations, "tool loop reached max iterations");
    Ok(LoopOutcome {
        response: MAX_ITERATIONS_MESSAGE.to_string(),
        messages,
        iterations: session.max_iterations,
        tool_failures,
        hit_limit: true,
    })
}
