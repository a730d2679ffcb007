//! 核心编排层：共享上下文、事件总线、路由、工作流协调器、机台缓存与审计

pub mod audit;
pub mod cache;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod routing;

pub use audit::{AuditRecord, AuditSink, HistoryFilter, HistoryStats, WorkflowHistory};
pub use cache::{CoordinatorCache, QueryResponse};
pub use context::SharedContext;
pub use coordinator::{Coordinator, WorkflowOutcome, WorkflowPlan, WorkflowStatus, WorkflowStep};
pub use error::{ErrorKind, OrchestratorError};
pub use events::{Event, EventBus, EventKind};
pub use routing::{RoutingExample, RoutingMethod, RoutingStrategy};
