//! 工具服务端抽象
//!
//! 一个 ToolServer 提供一组具名工具（进程内或远端 HTTP）；ToolHub 按工具名路由到对应服务端。
//! 工具的领域逻辑（SQL、向量检索等）不在本层，本层只约定调用接口与错误类型。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::ErrorKind;

/// 工具调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    Timeout(String),

    #[error("Agent {agent_id} is not permitted to use tool '{tool}'. Allowed tools: {allowed:?}")]
    PermissionDenied {
        agent_id: String,
        tool: String,
        allowed: Vec<String>,
    },

    #[error("Tool server connection failed: {0}")]
    Connection(String),
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolError::NotFound(_) => ErrorKind::NotFound,
            ToolError::PermissionDenied { .. } => ErrorKind::Permission,
            ToolError::ExecutionFailed(_) | ToolError::Timeout(_) | ToolError::Connection(_) => {
                ErrorKind::Upstream
            }
        }
    }
}

/// 工具描述：名称、说明、参数 schema 与所属服务端
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    #[serde(default = "default_input_schema")]
    pub input_schema: Value,
    #[serde(default)]
    pub server: String,
}

impl ToolInfo {
    /// 服务端未提供描述时的通用定义
    pub fn generic(tool: &str, server: &str) -> Self {
        Self {
            name: tool.to_string(),
            description: format!("Execute {} on {}", tool, server),
            input_schema: default_input_schema(),
            server: server.to_string(),
        }
    }
}

pub fn default_input_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {},
        "required": []
    })
}

/// 工具服务端 trait：连接 / 断开、列出工具、按名调用
#[async_trait]
pub trait ToolServer: Send + Sync {
    /// 服务端名称（配置中的 tool_servers 键）
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<(), ToolError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ToolError> {
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolInfo>, ToolError>;

    /// 单个工具的描述；默认从 list_tools 中查找
    async fn tool_info(&self, name: &str) -> Result<Option<ToolInfo>, ToolError> {
        Ok(self
            .list_tools()
            .await?
            .into_iter()
            .find(|t| t.name == name))
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<Value, ToolError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(ToolError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(ToolError::Timeout("x".into()).kind(), ErrorKind::Upstream);
        assert_eq!(ToolError::ExecutionFailed("x".into()).kind(), ErrorKind::Upstream);
    }

    #[test]
    fn test_permission_denied_message_lists_allowed_tools() {
        let err = ToolError::PermissionDenied {
            agent_id: "m1_fetch".into(),
            tool: "delete_all".into(),
            allowed: vec!["sql_query".into()],
        };
        let text = err.to_string();
        assert!(text.contains("m1_fetch"));
        assert!(text.contains("delete_all"));
        assert!(text.contains("sql_query"));
    }

    #[test]
    fn test_generic_tool_info() {
        let info = ToolInfo::generic("sql_query", "database");
        assert_eq!(info.description, "Execute sql_query on database");
        assert_eq!(info.input_schema["type"], "object");
    }
}
