//! 工具层：工具服务端抽象、进程内 / HTTP 实现与按名路由的工具中枢

pub mod http;
pub mod hub;
pub mod registry;
pub mod server;

pub use http::HttpToolServer;
pub use hub::{ToolHub, DEFAULT_TOOL_TIMEOUT_SECS};
pub use registry::{FnTool, LocalToolServer, Tool};
pub use server::{ToolError, ToolInfo, ToolServer};
