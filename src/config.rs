//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__PROVIDER=openai`）。
//! 字符串中的 `${VAR}` 引用在构建提供方 / 工具服务端时才解析（resolve_env_vars）。

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub routing: RoutingSection,
    pub tools: ToolsSection,
    pub events: EventsSection,
    /// 工具服务端，键为服务端名
    pub tool_servers: BTreeMap<String, ToolServerSection>,
    /// 机台展示信息，键为机台 id（可选）
    pub machines: BTreeMap<String, MachineSection>,
    pub agents: Vec<AgentSection>,
}

/// [app] 段：应用名、工作流历史库路径
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSection {
    #[serde(default = "default_app_name")]
    pub name: String,
    /// 工作流历史 SQLite 文件；未设置时不记录历史
    pub history_db: Option<PathBuf>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            history_db: None,
        }
    }
}

fn default_app_name() -> String {
    "hive".to_string()
}

/// [llm] 段：推理后端选择
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / mock / none
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 支持 `${VAR}` 引用；未设置时读 OPENAI_API_KEY
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key: None,
            temperature: default_temperature(),
            max_tokens: None,
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "none".to_string()
}

fn default_model() -> String {
    crate::llm::DEFAULT_MODEL.to_string()
}

fn default_temperature() -> f32 {
    crate::llm::DEFAULT_TEMPERATURE
}

fn default_llm_timeout_secs() -> u64 {
    60
}

/// [routing] 段：路由策略与关键词示例
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingSection {
    /// keyword / llm
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub examples: Vec<RoutingExampleSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingExampleSection {
    pub keywords: Vec<String>,
    pub machine_id: String,
    #[serde(default)]
    pub description: String,
}

/// [tools] 段：工具调用超时与推理循环上限
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            max_iterations: default_max_iterations(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    crate::tools::DEFAULT_TOOL_TIMEOUT_SECS
}

fn default_max_iterations() -> usize {
    crate::react::MAX_TOOL_ITERATIONS
}

/// [events] 段
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsSection {
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
        }
    }
}

fn default_history_capacity() -> usize {
    crate::core::events::DEFAULT_HISTORY_CAPACITY
}

/// [tool_servers.NAME] 段：远端工具服务端
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerSection {
    /// 目前仅支持 http
    #[serde(default = "default_transport", rename = "type")]
    pub transport: String,
    pub endpoint: String,
    /// 支持 `${VAR}` 引用
    pub bearer_token: Option<String>,
}

fn default_transport() -> String {
    "http".to_string()
}

/// [machines.ID] 段：机台展示名与描述
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineSection {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Agent 类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    #[default]
    Specialized,
    Rag,
}

/// [[agents]] 段：一个 Agent 的身份与工具授权
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSection {
    pub id: String,
    pub name: String,
    pub machine_id: String,
    /// 职能：data_fetching / analysis / summary ...
    pub function: String,
    #[serde(default)]
    pub kind: AgentKind,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// 按服务端分组的工具授权：服务端名 -> 工具名列表
    #[serde(default)]
    pub tools: BTreeMap<String, Vec<String>>,
    pub model: Option<String>,
    pub instructions: Option<String>,
    #[serde(default)]
    pub rag: RagSection,
}

impl AgentSection {
    /// 展开后的工具白名单（去重、排序）
    pub fn allowed_tools(&self) -> BTreeSet<String> {
        self.tools.values().flatten().cloned().collect()
    }
}

/// [agents.rag] 段：检索参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagSection {
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
}

impl Default for RagSection {
    fn default() -> Self {
        Self {
            collection: default_collection(),
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

fn default_collection() -> String {
    "documents".to_string()
}

fn default_top_k() -> usize {
    5
}

fn default_similarity_threshold() -> f64 {
    0.7
}

/// 机台概要（GET /api/machines）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineInfo {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub capabilities: Vec<String>,
    pub agent_count: usize,
}

impl AppConfig {
    /// 出现在 [[agents]] 中的机台 id（首次出现顺序）
    pub fn machine_ids(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.agents
            .iter()
            .filter(|a| seen.insert(a.machine_id.clone()))
            .map(|a| a.machine_id.clone())
            .collect()
    }

    pub fn agents_for_machine(&self, machine_id: &str) -> Vec<&AgentSection> {
        self.agents
            .iter()
            .filter(|a| a.machine_id == machine_id)
            .collect()
    }

    pub fn machine_info(&self, machine_id: &str) -> Option<MachineInfo> {
        let agents = self.agents_for_machine(machine_id);
        if agents.is_empty() {
            return None;
        }
        let capabilities: BTreeSet<String> = agents
            .iter()
            .flat_map(|a| a.capabilities.iter().cloned())
            .collect();
        let section = self.machines.get(machine_id);
        Some(MachineInfo {
            id: machine_id.to_string(),
            name: section
                .and_then(|m| m.name.clone())
                .unwrap_or_else(|| machine_id.to_string()),
            description: section.and_then(|m| m.description.clone()),
            capabilities: capabilities.into_iter().collect(),
            agent_count: agents.len(),
        })
    }

    pub fn machine_infos(&self) -> Vec<MachineInfo> {
        self.machine_ids()
            .iter()
            .filter_map(|id| self.machine_info(id))
            .collect()
    }
}

/// 从默认路径（config/default.toml）与可选路径、环境变量加载配置；显式指定的路径必须存在
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    match config_path {
        Some(path) => {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        None => {
            let default_names = ["config/default", "../config/default", "default"];
            for name in default_names {
                let path = format!("{}.toml", name);
                if Path::new(&path).exists() {
                    builder = builder.add_source(config::File::with_name(name).required(false));
                    break;
                }
            }
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 将配置写回 TOML 文件（目录不存在时创建）
pub fn save_config(cfg: &AppConfig, path: &Path) -> anyhow::Result<()> {
    let text = toml::to_string_pretty(cfg).context("serialize config")?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create config dir {}", parent.display()))?;
        }
    }
    std::fs::write(path, text).with_context(|| format!("write config {}", path.display()))?;
    Ok(())
}

/// 解析字符串中的 `${VAR}` 引用；引用的环境变量不存在时报错
pub fn resolve_env_vars(value: &str) -> anyhow::Result<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").context("env var pattern")?;
    let mut missing = Vec::new();
    let resolved = re.replace_all(value, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match std::env::var(name) {
            Ok(v) => v,
            Err(_) => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });
    if !missing.is_empty() {
        anyhow::bail!(
            "Environment variable '{}' not found. Please set it in your environment.",
            missing.join("', '")
        );
    }
    Ok(resolved.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[app]
name = "plant"

[llm]
provider = "mock"

[routing]
strategy = "keyword"

[[routing.examples]]
keywords = ["temperature", "heat"]
machine_id = "m1"
description = "thermal questions"

[tool_servers.database]
type = "http"
endpoint = "http://localhost:9000/rpc"

[machines.m1]
name = "Press 1"

[[agents]]
id = "m1_fetch"
name = "M1 Fetcher"
machine_id = "m1"
function = "data_fetching"
capabilities = ["sql", "history"]

[agents.tools]
database = ["sql_query", "list_tables"]

[[agents]]
id = "m1_docs"
name = "M1 Docs"
machine_id = "m1"
function = "analysis"
kind = "rag"
capabilities = ["documents"]

[agents.rag]
collection = "manuals"

[[agents]]
id = "m2_fetch"
name = "M2 Fetcher"
machine_id = "m2"
function = "data_fetching"
"#;

    fn write_sample(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("hive.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.name, "hive");
        assert_eq!(cfg.llm.provider, "none");
        assert_eq!(cfg.llm.model, "gpt-4");
        assert_eq!(cfg.tools.max_iterations, 10);
        assert_eq!(cfg.tools.tool_timeout_secs, 30);
        assert_eq!(cfg.events.history_capacity, 100);
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(Some(write_sample(&dir))).unwrap();

        assert_eq!(cfg.app.name, "plant");
        assert_eq!(cfg.llm.provider, "mock");
        assert_eq!(cfg.llm.temperature, 0.7);
        assert_eq!(cfg.routing.examples[0].machine_id, "m1");
        assert_eq!(cfg.tool_servers["database"].transport, "http");
        assert_eq!(cfg.agents.len(), 3);
        assert_eq!(cfg.agents[0].kind, AgentKind::Specialized);
        assert_eq!(cfg.agents[1].kind, AgentKind::Rag);
        assert_eq!(cfg.agents[1].rag.collection, "manuals");
        assert_eq!(cfg.agents[1].rag.top_k, 5);
        assert_eq!(
            cfg.agents[0].allowed_tools().into_iter().collect::<Vec<_>>(),
            vec!["list_tables", "sql_query"]
        );
    }

    #[test]
    fn test_missing_explicit_path_is_error() {
        assert!(load_config(Some(PathBuf::from("/nonexistent/hive.toml"))).is_err());
    }

    #[test]
    fn test_machine_infos() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(Some(write_sample(&dir))).unwrap();
        assert_eq!(cfg.machine_ids(), vec!["m1", "m2"]);

        let infos = cfg.machine_infos();
        assert_eq!(infos[0].name, "Press 1");
        assert_eq!(infos[0].agent_count, 2);
        assert_eq!(infos[0].capabilities, vec!["documents", "history", "sql"]);
        assert_eq!(infos[1].name, "m2");
        assert!(cfg.machine_info("m9").is_none());
    }

    #[test]
    fn test_save_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(Some(write_sample(&dir))).unwrap();
        let out = dir.path().join("nested").join("saved.toml");
        save_config(&cfg, &out).unwrap();
        let back = load_config(Some(out)).unwrap();
        assert_eq!(back.agents.len(), 3);
        assert_eq!(back.agents[1].rag.collection, "manuals");
    }

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("HIVE_TEST_TOKEN", "s3cret");
        assert_eq!(resolve_env_vars("${HIVE_TEST_TOKEN}").unwrap(), "s3cret");
        assert_eq!(
            resolve_env_vars("Bearer ${HIVE_TEST_TOKEN}!").unwrap(),
            "Bearer s3cret!"
        );
        assert_eq!(resolve_env_vars("plain").unwrap(), "plain");
        let err = resolve_env_vars("${HIVE_TEST_DEFINITELY_UNSET}").unwrap_err();
        assert!(err.to_string().contains("HIVE_TEST_DEFINITELY_UNSET"));
    }
}
