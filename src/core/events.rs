//! 事件总线：同步发布 / 订阅 + 有界历史
//!
//! publish 先写入环形历史（满时淘汰最旧），再按订阅顺序同步调用该事件类型的所有处理器，
//! 全部处理器返回后 publish 才返回。处理器返回 Err 或 panic 只记日志，不影响其余处理器与发布方。

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// 默认历史容量
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// 事件类型（固定枚举）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    AgentReady,
    ToolInvoked,
    ToolCompleted,
    WorkflowStarted,
    WorkflowCompleted,
}

/// 事件：发布后不可变
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    /// 发出事件的 Agent（工作流级事件为 "coordinator"）
    pub agent_id: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

impl Event {
    pub fn new(kind: EventKind, agent_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            agent_id: agent_id.into(),
            payload,
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// 订阅句柄，用于退订
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// 事件处理器；返回 Err 表示处理失败（只记录日志）
pub type EventHandler = Arc<dyn Fn(&Event) -> Result<(), String> + Send + Sync>;

struct Inner {
    handlers: HashMap<EventKind, Vec<(SubscriptionId, EventHandler)>>,
    history: VecDeque<Event>,
}

/// 同步事件总线
pub struct EventBus {
    inner: Mutex<Inner>,
    capacity: usize,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handler_count())
            .field("history", &self.lock().history.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                handlers: HashMap::new(),
                history: VecDeque::with_capacity(capacity),
            }),
            capacity,
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<(), String> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock()
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// 退订；句柄不存在时返回 false
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        match inner.handlers.get_mut(&kind) {
            Some(list) => {
                let before = list.len();
                list.retain(|(sid, _)| *sid != id);
                list.len() != before
            }
            None => false,
        }
    }

    pub fn publish(&self, event: Event) {
        // 记录历史并复制处理器列表后释放锁，处理器内部可再次 publish
        let handlers: Vec<EventHandler> = {
            let mut inner = self.lock();
            if inner.history.len() >= self.capacity {
                inner.history.pop_front();
            }
            inner.history.push_back(event.clone());
            inner
                .handlers
                .get(&event.kind)
                .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };

        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(kind = ?event.kind, agent = %event.agent_id, "Error in event handler: {}", e);
                }
                Err(_) => {
                    tracing::warn!(kind = ?event.kind, agent = %event.agent_id, "Event handler panicked");
                }
            }
        }
    }

    /// 按类型 / Agent 过滤的历史，最新在前，最多 limit 条
    pub fn history(
        &self,
        kind: Option<EventKind>,
        agent_id: Option<&str>,
        limit: usize,
    ) -> Vec<Event> {
        self.lock()
            .history
            .iter()
            .rev()
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .filter(|e| agent_id.map_or(true, |a| e.agent_id == a))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn clear_history(&self) {
        self.lock().history.clear();
    }

    pub fn handler_count(&self) -> usize {
        self.lock().handlers.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_history_is_bounded_fifo() {
        let bus = EventBus::new(3);
        for i in 0..4 {
            bus.publish(Event::new(EventKind::TaskStarted, "a", json!({ "n": i })));
        }
        let all = bus.history(None, None, 10);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].payload, json!({ "n": 3 }));
        assert_eq!(all[2].payload, json!({ "n": 1 }));
        assert!(all.iter().all(|e| e.payload != json!({ "n": 0 })));
    }

    #[test]
    fn test_handlers_run_in_order_and_failures_are_isolated() {
        let bus = EventBus::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        bus.subscribe(EventKind::ToolInvoked, move |_| {
            o.lock().unwrap().push(1);
            Err("boom".to_string())
        });
        bus.subscribe(EventKind::ToolInvoked, |_| panic!("handler bug"));
        let o = Arc::clone(&order);
        bus.subscribe(EventKind::ToolInvoked, move |_| {
            o.lock().unwrap().push(3);
            Ok(())
        });

        bus.publish(Event::new(EventKind::ToolInvoked, "a", Value::Null));
        assert_eq!(*order.lock().unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let id = bus.subscribe(EventKind::TaskCompleted, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.publish(Event::new(EventKind::TaskCompleted, "a", Value::Null));
        assert!(bus.unsubscribe(EventKind::TaskCompleted, id));
        assert!(!bus.unsubscribe(EventKind::TaskCompleted, id));
        bus.publish(Event::new(EventKind::TaskCompleted, "a", Value::Null));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_history_filters() {
        let bus = EventBus::default();
        bus.publish(Event::new(EventKind::TaskStarted, "a", Value::Null));
        bus.publish(Event::new(EventKind::TaskStarted, "b", Value::Null));
        bus.publish(Event::new(EventKind::TaskCompleted, "a", Value::Null));

        assert_eq!(bus.history(Some(EventKind::TaskStarted), None, 10).len(), 2);
        assert_eq!(bus.history(None, Some("a"), 10).len(), 2);
        assert_eq!(bus.history(Some(EventKind::TaskStarted), Some("b"), 10)[0].agent_id, "b");
        assert_eq!(bus.history(None, None, 1)[0].kind, EventKind::TaskCompleted);
    }

    #[test]
    fn test_handler_may_publish() {
        let bus = Arc::new(EventBus::default());
        let inner_bus = Arc::clone(&bus);
        bus.subscribe(EventKind::WorkflowStarted, move |e| {
            inner_bus.publish(Event::new(EventKind::AgentReady, e.agent_id.clone(), Value::Null));
            Ok(())
        });
        bus.publish(Event::new(EventKind::WorkflowStarted, "coordinator", Value::Null));
        assert_eq!(bus.history(Some(EventKind::AgentReady), None, 10).len(), 1);
    }

    #[test]
    fn test_event_serializes_kind_snake_case() {
        let e = Event::new(EventKind::WorkflowCompleted, "coordinator", json!({}));
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["kind"], "workflow_completed");
    }
}
