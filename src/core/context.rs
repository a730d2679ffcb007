//! 共享上下文：Agent 之间交换数据的版本化键值存储
//!
//! 每次写入令全局版本号 +1；同一键的值与元数据在同一把锁内写入，不会出现半写状态。
//! compact_summary 输出紧凑摘要供 LLM 使用：优先取写入时附带的 summary，否则截断原值。

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// 未提供 summary 时，原值渲染后的最大字符数
pub const SUMMARY_VALUE_CHARS: usize = 100;

/// 单个键的元数据
#[derive(Debug, Clone, Serialize)]
pub struct EntryMetadata {
    /// 写入者（Agent id 或 "coordinator"）
    pub writer: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// 写入后的全局版本号
    pub version: u64,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct Entry {
    value: Value,
    metadata: EntryMetadata,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    version: u64,
}

/// 导出快照（调试、HTTP 展示）
#[derive(Debug, Clone, Serialize)]
pub struct ContextSnapshot {
    pub data: HashMap<String, Value>,
    pub metadata: HashMap<String, EntryMetadata>,
    pub version: u64,
}

/// 共享上下文：任意 Agent 可写、所有 Agent 可读，同键后写覆盖先写
#[derive(Debug, Default)]
pub struct SharedContext {
    inner: Mutex<Inner>,
}

impl SharedContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 写入键值，返回本次写入后的版本号
    pub fn write(
        &self,
        key: impl Into<String>,
        value: Value,
        writer: Option<&str>,
        summary: Option<&str>,
    ) -> u64 {
        let key = key.into();
        let mut inner = self.lock();
        inner.version += 1;
        let metadata = EntryMetadata {
            writer: writer.map(str::to_string),
            timestamp: Utc::now(),
            version: inner.version,
            summary: summary.map(str::to_string),
        };
        tracing::debug!(key = %key, version = inner.version, "context write");
        inner.entries.insert(key, Entry { value, metadata });
        inner.version
    }

    /// 读取键值；不存在时返回 None
    pub fn read(&self, key: &str) -> Option<Value> {
        self.lock().entries.get(key).map(|e| e.value.clone())
    }

    pub fn summary(&self, key: &str) -> Option<String> {
        self.lock()
            .entries
            .get(key)
            .and_then(|e| e.metadata.summary.clone())
    }

    pub fn metadata(&self, key: &str) -> Option<EntryMetadata> {
        self.lock().entries.get(key).map(|e| e.metadata.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// 当前全局版本号（即累计写入次数）
    pub fn version(&self) -> u64 {
        self.lock().version
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// 清空所有键；版本号保持单调，不归零
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let inner = self.lock();
        ContextSnapshot {
            data: inner
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.value.clone()))
                .collect(),
            metadata: inner
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.metadata.clone()))
                .collect(),
            version: inner.version,
        }
    }

    /// 所有键的紧凑摘要，每行 `key: text`，按键排序
    pub fn compact_summary(&self) -> String {
        let inner = self.lock();
        let mut keys: Vec<&String> = inner.entries.keys().collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|k| inner.entries.get(k).map(|e| summary_line(k, e)))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// 仅针对给定键的紧凑摘要（顺序与 keys 一致，缺失键跳过）
    pub fn digest(&self, keys: &[String]) -> String {
        let inner = self.lock();
        keys.iter()
            .filter_map(|k| inner.entries.get(k).map(|e| summary_line(k, e)))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn summary_line(key: &str, entry: &Entry) -> String {
    match &entry.metadata.summary {
        Some(s) => format!("{}: {}", key, s),
        None => format!("{}: {}", key, truncate_value(&entry.value, SUMMARY_VALUE_CHARS)),
    }
}

/// 渲染 JSON 值（字符串取原文，其余取紧凑 JSON），超过 max_chars 截断并追加 "..."
pub fn truncate_value(value: &Value, max_chars: usize) -> String {
    let rendered = render_value(value);
    if rendered.chars().count() > max_chars {
        format!("{}...", rendered.chars().take(max_chars).collect::<String>())
    } else {
        rendered
    }
}

/// 字符串值取原文，其余取紧凑 JSON
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
