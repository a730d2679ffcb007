//! 工具中枢
//!
//! 持有已连接的 ToolServer 与 工具名 -> 服务端 映射，call_tool(name, args) 在超时内路由到对应服务端，
//! 超时或失败时转为 ToolError；每次调用输出结构化审计日志（JSON）。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::tools::server::{ToolError, ToolInfo, ToolServer};

/// 默认单次工具调用超时（秒）
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;

#[derive(Default)]
struct Routes {
    servers: HashMap<String, Arc<dyn ToolServer>>,
    /// 连接顺序，后连接者在后
    order: Vec<String>,
    /// 每个服务端自身提供的工具，断开时用于回退被遮蔽的同名工具
    server_tools: HashMap<String, Vec<ToolInfo>>,
    tool_to_server: HashMap<String, String>,
    tool_infos: HashMap<String, ToolInfo>,
}

impl Routes {
    /// 将 tool 指向仍在连接中、最后连接且提供该工具的服务端；没有则移除
    fn reroute(&mut self, tool: &str) {
        let fallback = self.order.iter().rev().find_map(|server| {
            self.server_tools
                .get(server)
                .and_then(|infos| infos.iter().find(|info| info.name == tool))
                .cloned()
        });
        match fallback {
            Some(info) => {
                tracing::info!(tool = %tool, server = %info.server, "tool restored from earlier server");
                self.tool_to_server
                    .insert(tool.to_string(), info.server.clone());
                self.tool_infos.insert(tool.to_string(), info);
            }
            None => {
                self.tool_to_server.remove(tool);
                self.tool_infos.remove(tool);
            }
        }
    }
}

/// 工具中枢：连接多个工具服务端，按工具名调用
pub struct ToolHub {
    routes: RwLock<Routes>,
    timeout: Duration,
}

impl Default for ToolHub {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL_TIMEOUT_SECS)
    }
}

impl ToolHub {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            routes: RwLock::new(Routes::default()),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// 连接服务端并登记其工具，返回登记的工具名；同名工具以后连接者为准
    pub async fn connect(&self, server: Arc<dyn ToolServer>) -> Result<Vec<String>, ToolError> {
        let server_name = server.name().to_string();
        server.connect().await?;
        let tools = match server.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                let _ = server.disconnect().await;
                return Err(e);
            }
        };

        let mut routes = self.routes.write().await;
        let mut names = Vec::with_capacity(tools.len());
        let mut provided = Vec::with_capacity(tools.len());
        for mut info in tools {
            if let Some(prev) = routes.tool_to_server.get(&info.name) {
                if prev != &server_name {
                    tracing::warn!(tool = %info.name, previous = %prev, server = %server_name, "tool name shadowed by later server");
                }
            }
            info.server = server_name.clone();
            routes
                .tool_to_server
                .insert(info.name.clone(), server_name.clone());
            names.push(info.name.clone());
            routes.tool_infos.insert(info.name.clone(), info.clone());
            provided.push(info);
        }
        routes.order.retain(|s| s != &server_name);
        routes.order.push(server_name.clone());
        routes.server_tools.insert(server_name.clone(), provided);
        routes.servers.insert(server_name.clone(), server);
        tracing::info!(server = %server_name, tools = names.len(), "tool server connected");
        Ok(names)
    }

    /// 断开指定服务端并移除其工具；被它遮蔽的同名工具回退到其他仍连接的服务端。
    /// 服务端不存在时返回 false
    pub async fn disconnect(&self, server_name: &str) -> bool {
        let server = {
            let mut routes = self.routes.write().await;
            let server = routes.servers.remove(server_name);
            if server.is_some() {
                routes.order.retain(|s| s != server_name);
                routes.server_tools.remove(server_name);
                let routed: Vec<String> = routes
                    .tool_to_server
                    .iter()
                    .filter(|(_, s)| s.as_str() == server_name)
                    .map(|(tool, _)| tool.clone())
                    .collect();
                for tool in routed {
                    routes.reroute(&tool);
                }
            }
            server
        };
        match server {
            Some(server) => {
                if let Err(e) = server.disconnect().await {
                    tracing::warn!(server = %server_name, "Error disconnecting tool server: {}", e);
                }
                tracing::info!(server = %server_name, "tool server disconnected");
                true
            }
            None => false,
        }
    }

    pub async fn disconnect_all(&self) {
        let names = self.list_servers().await;
        for name in names {
            self.disconnect(&name).await;
        }
    }

    /// 调用工具；未登记返回 NotFound，超时返回 Timeout；输出 JSON 审计日志
    pub async fn call_tool(&self, tool_name: &str, args: Value) -> Result<Value, ToolError> {
        let server = {
            let routes = self.routes.read().await;
            routes
                .tool_to_server
                .get(tool_name)
                .and_then(|s| routes.servers.get(s))
                .cloned()
        };
        let server = server.ok_or_else(|| ToolError::NotFound(tool_name.to_string()))?;

        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = timeout(self.timeout, server.call_tool(tool_name, args)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "server": server.name(),
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(r) => r,
            Err(_) => Err(ToolError::Timeout(tool_name.to_string())),
        }
    }

    /// 所有已登记工具名（排序）
    pub async fn list_tools(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .routes
            .read()
            .await
            .tool_to_server
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub async fn list_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.read().await.servers.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn server_for_tool(&self, tool_name: &str) -> Option<String> {
        self.routes.read().await.tool_to_server.get(tool_name).cloned()
    }

    /// 工具描述；服务端未提供时返回通用定义
    pub async fn tool_info(&self, tool_name: &str) -> ToolInfo {
        let routes = self.routes.read().await;
        if let Some(info) = routes.tool_infos.get(tool_name) {
            return info.clone();
        }
        let server = routes
            .tool_to_server
            .get(tool_name)
            .map(String::as_str)
            .unwrap_or("unknown");
        ToolInfo::generic(tool_name, server)
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
