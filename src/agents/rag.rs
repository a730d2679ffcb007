//! 检索增强 Agent：通过 query_documents 工具检索文档，为后续步骤提供上下文
//!
//! 检索结果按距离过滤（distance < 1 - similarity_threshold），取前五条片段拼成上下文。
//! 工具不可用或报错时记日志并按无结果处理，任务仍然成功。

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agents::agent::{Agent, AgentProfile, AgentRuntime, TaskResult, TaskSpec};
use crate::config::RagSection;

/// 检索工具名
pub const QUERY_DOCUMENTS_TOOL: &str = "query_documents";

/// 上下文片段的最大字符数
const SNIPPET_CHARS: usize = 200;
/// 上下文中保留的片段数
const CONTEXT_SNIPPETS: usize = 5;

pub struct RagAgent {
    profile: AgentProfile,
    runtime: AgentRuntime,
    settings: RagSection,
}

impl RagAgent {
    pub fn new(profile: AgentProfile, runtime: AgentRuntime, settings: RagSection) -> Self {
        Self {
            profile,
            runtime,
            settings,
        }
    }

    pub fn settings(&self) -> &RagSection {
        &self.settings
    }

    /// 检索；任何失败都按无结果处理
    async fn search(&self, query: &str, task: &TaskSpec) -> Value {
        if self.runtime.tools.is_none() {
            tracing::debug!(agent = %self.profile.id, "no tool hub configured, skipping document search");
            return json!({ "results": [] });
        }
        let collection = task
            .parameters
            .get("collection")
            .and_then(Value::as_str)
            .unwrap_or(&self.settings.collection);
        let top_k = task
            .parameters
            .get("top_k")
            .and_then(Value::as_u64)
            .unwrap_or(self.settings.top_k as u64);

        let args = json!({
            "query": query,
            "collection_name": collection,
            "top_k": top_k,
        });
        match self.invoke_tool(QUERY_DOCUMENTS_TOOL, args).await {
            Ok(v) => match v.get("result") {
                Some(inner) if inner.is_object() => inner.clone(),
                _ => v,
            },
            Err(e) => {
                tracing::warn!(agent = %self.profile.id, "RAG search error: {}", e);
                json!({ "results": [] })
            }
        }
    }
}

/// 整理检索结果：过滤、截断片段、统计
pub fn format_search_results(search: &Value, similarity_threshold: f64) -> Value {
    let results = search
        .get("results")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if results.is_empty() {
        return json!({
            "message": "No relevant documents found",
            "context": "",
            "documents": [],
        });
    }

    let max_distance = 1.0 - similarity_threshold;
    let mut documents = Vec::new();
    let mut snippets = Vec::new();
    for collection_result in &results {
        let collection = collection_result
            .get("collection")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let docs = array_of(collection_result, "documents");
        let metas = array_of(collection_result, "metadatas");
        let distances = array_of(collection_result, "distances");

        for ((doc, meta), distance) in docs.iter().zip(metas.iter()).zip(distances.iter()) {
            let Some(distance) = distance.as_f64() else {
                continue;
            };
            if distance >= max_distance {
                continue;
            }
            let content = doc.as_str().unwrap_or_default();
            documents.push(json!({
                "collection": collection,
                "content": content,
                "metadata": meta,
                "relevance_score": 1.0 - distance,
            }));
            let snippet: String = content.chars().take(SNIPPET_CHARS).collect();
            snippets.push(format!("[{}] {}...", collection, snippet));
        }
    }

    let context = snippets
        .iter()
        .take(CONTEXT_SNIPPETS)
        .cloned()
        .collect::<Vec<_>>()
        .join("\n\n");
    json!({
        "message": format!("Found {} relevant documents", documents.len()),
        "context": context,
        "documents": documents,
        "query": search.get("query").cloned().unwrap_or_else(|| json!("")),
    })
}

fn array_of(v: &Value, key: &str) -> Vec<Value> {
    v.get(key)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

#[async_trait]
impl Agent for RagAgent {
    fn profile(&self) -> &AgentProfile {
        &self.profile
    }

    fn runtime(&self) -> &AgentRuntime {
        &self.runtime
    }

    async fn run_task(&self, task: &TaskSpec) -> TaskResult {
        let query = task
            .parameters
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or(&task.instruction)
            .to_string();
        let search = self.search(&query, task).await;
        let collections = search
            .get("results")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        let output = format_search_results(&search, self.settings.similarity_threshold);
        let total = output
            .get("documents")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);

        TaskResult::success(&self.profile.id, output)
            .with_metadata("collections_searched", json!(collections))
            .with_metadata("relevant_documents", json!(total))
    }
}
