//! 推理层：Agent 的工具调用循环

pub mod loop_;

pub use loop_::{
    tool_loop, LoopOutcome, ToolFailure, ToolInvoker, ToolLoopSession, EMPTY_ANSWER_MESSAGE,
    MAX_ITERATIONS_MESSAGE, MAX_TOOL_ITERATIONS,
};
