//! Agent 注册表
//!
//! 按 id、机台、职能三路索引。同 id 重复注册以后者为准：旧的机台 / 职能索引先清除再按新值插入，
//! 该 id 在扫描顺序中的位置保持首次注册时的位置。

use std::collections::HashMap;
use std::sync::Arc;

use crate::agents::agent::Agent;

#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
    /// 注册顺序（id）
    order: Vec<String>,
    by_machine: HashMap<String, Vec<String>>,
    by_function: HashMap<String, Vec<String>>,
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.order)
            .finish()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        let id = agent.id().to_string();
        let machine = agent.profile().machine_id.clone();
        let function = agent.profile().function.clone();

        if let Some(previous) = self.agents.get(&id) {
            tracing::warn!(agent = %id, "agent re-registered, replacing previous instance");
            let old_machine = previous.profile().machine_id.clone();
            let old_function = previous.profile().function.clone();
            remove_from_index(&mut self.by_machine, &old_machine, &id);
            remove_from_index(&mut self.by_function, &old_function, &id);
        } else {
            self.order.push(id.clone());
        }

        insert_ordered(&mut self.by_machine, machine, &id, &self.order);
        insert_ordered(&mut self.by_function, function, &id, &self.order);
        self.agents.insert(id, agent);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(id).cloned()
    }

    fn resolve(&self, ids: Option<&Vec<String>>) -> Vec<Arc<dyn Agent>> {
        ids.map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn for_machine(&self, machine_id: &str) -> Vec<Arc<dyn Agent>> {
        self.resolve(self.by_machine.get(machine_id))
    }

    pub fn for_function(&self, function: &str) -> Vec<Arc<dyn Agent>> {
        self.resolve(self.by_function.get(function))
    }

    /// 按注册顺序扫描，返回第一个机台与职能均精确匹配的 Agent
    pub fn find(&self, machine_id: &str, function: &str) -> Option<Arc<dyn Agent>> {
        self.all()
            .into_iter()
            .find(|a| a.profile().can_handle(machine_id, function))
    }

    /// 所有 Agent（注册顺序）
    pub fn all(&self) -> Vec<Arc<dyn Agent>> {
        self.order.iter().filter_map(|id| self.get(id)).collect()
    }

    /// 去重后的机台 id（按首次出现的注册顺序）
    pub fn machines(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for agent in self.all() {
            let m = &agent.profile().machine_id;
            if !out.contains(m) {
                out.push(m.clone());
            }
        }
        out
    }

    pub fn functions(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for agent in self.all() {
            let f = &agent.profile().function;
            if !out.contains(f) {
                out.push(f.clone());
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

fn remove_from_index(index: &mut HashMap<String, Vec<String>>, key: &str, id: &str) {
    if let Some(ids) = index.get_mut(key) {
        ids.retain(|x| x != id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

/// 按注册顺序插入索引，保证索引内顺序与扫描顺序一致
fn insert_ordered(index: &mut HashMap<String, Vec<String>>, key: String, id: &str, order: &[String]) {
    let pos_of = |x: &str| order.iter().position(|o| o == x).unwrap_or(usize::MAX);
    let ids = index.entry(key).or_default();
    let pos = pos_of(id);
    let at = ids.iter().position(|x| pos_of(x) > pos).unwrap_or(ids.len());
    ids.insert(at, id.to_string());
}
