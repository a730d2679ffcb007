//! HTTP JSON-RPC 工具服务端
//!
//! 通过 reqwest 以 JSON-RPC 2.0 调用远端工具服务（initialize / tools/list / tools/call），
//! 可选 Bearer Token 认证。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::server::{default_input_schema, ToolError, ToolInfo, ToolServer};

pub struct HttpToolServer {
    name: String,
    endpoint: String,
    bearer_token: Option<String>,
    client: reqwest::Client,
    next_id: AtomicU64,
    connected: AtomicBool,
}

impl HttpToolServer {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        bearer_token: Option<String>,
        timeout_secs: u64,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            bearer_token: bearer_token.filter(|t| !t.is_empty()),
            client,
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, ToolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ToolError::Connection(format!("{}: {}", self.name, e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::Connection(format!(
                "{}: HTTP {} for {}",
                self.name, status, method
            )));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("invalid JSON-RPC response: {}", e)))?;
        parse_rpc_response(payload)
    }
}

#[async_trait]
impl ToolServer for HttpToolServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), ToolError> {
        self.rpc(
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "clientInfo": { "name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION") },
                "capabilities": {},
            }),
        )
        .await?;
        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!(server = %self.name, endpoint = %self.endpoint, "http tool server initialized");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ToolError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolInfo>, ToolError> {
        let result = self.rpc("tools/list", json!({})).await?;
        Ok(parse_tool_list(&result, &self.name))
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        let result = self
            .rpc("tools/call", json!({ "name": name, "arguments": args }))
            .await?;
        parse_call_result(result)
    }
}

fn parse_rpc_response(payload: Value) -> Result<Value, ToolError> {
    if let Some(err) = payload.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        // -32601: method not found；-32602: 参数错误（常见于未知工具名）
        return match err.get("code").and_then(Value::as_i64) {
            Some(-32601) | Some(-32602) => Err(ToolError::NotFound(message)),
            _ => Err(ToolError::ExecutionFailed(message)),
        };
    }
    payload
        .get("result")
        .cloned()
        .ok_or_else(|| ToolError::ExecutionFailed("JSON-RPC response missing result".to_string()))
}

fn parse_tool_list(result: &Value, server: &str) -> Vec<ToolInfo> {
    result
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| {
                    let name = t.get("name")?.as_str()?.to_string();
                    let description = t
                        .get("description")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("Execute {} on {}", name, server));
                    let input_schema = t
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or_else(default_input_schema);
                    Some(ToolInfo {
                        name,
                        description,
                        input_schema,
                        server: server.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// tools/call 结果：优先 structuredContent；否则拼接文本内容，能解析为 JSON 则返回解析值
fn parse_call_result(result: Value) -> Result<Value, ToolError> {
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|c| c.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
        return Err(ToolError::ExecutionFailed(text));
    }
    if let Some(structured) = result.get("structuredContent") {
        return Ok(structured.clone());
    }
    if result.get("content").is_none() {
        return Ok(result);
    }
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}
