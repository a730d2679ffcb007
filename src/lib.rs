//! Hive - Rust 多智能体编排引擎
//!
//! 模块划分：
//! - **agents**: Agent 执行契约、专职 Agent、检索 Agent 与注册表
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 共享上下文、事件总线、路由、工作流协调器、机台缓存、审计历史
//! - **llm**: LLM 提供方抽象与实现（OpenAI 兼容 / Mock）
//! - **observability**: 日志初始化
//! - **react**: 工具调用循环
//! - **tools**: 工具服务端抽象、本地 / HTTP 实现与工具中枢

pub mod agents;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod react;
pub mod tools;

pub use crate::core::{CoordinatorCache, QueryResponse};
