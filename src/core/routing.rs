//! 查询路由：把自然语言查询映射到机台
//!
//! 关键词路由按示例声明顺序扫描，首个命中（不区分大小写的子串）的示例胜出；
//! LLM 路由让推理提供方从已知机台中选一个，失败或答非所问时回退到关键词路由。

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::RoutingExampleSection;
use crate::llm::{ChatMessage, CompletionOptions, LlmProvider};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingExample {
    pub keywords: Vec<String>,
    pub machine_id: String,
    #[serde(default)]
    pub description: String,
}

impl From<&RoutingExampleSection> for RoutingExample {
    fn from(s: &RoutingExampleSection) -> Self {
        Self {
            keywords: s.keywords.clone(),
            machine_id: s.machine_id.clone(),
            description: s.description.clone(),
        }
    }
}

impl RoutingExample {
    pub fn matches(&self, query_lower: &str) -> bool {
        self.keywords
            .iter()
            .any(|k| !k.is_empty() && query_lower.contains(&k.to_lowercase()))
    }
}

/// 配置的路由策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RoutingStrategy {
    #[default]
    Keyword,
    Llm,
}

impl FromStr for RoutingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "keyword" | "keywords" | "keyword_matching" => Ok(RoutingStrategy::Keyword),
            "llm" | "llm_intent" => Ok(RoutingStrategy::Llm),
            other => Err(format!("Unknown routing strategy: {}", other)),
        }
    }
}

/// 实际使用的路由方法（写入工作流结果）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMethod {
    KeywordMatching,
    LlmIntent,
}

impl RoutingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingMethod::KeywordMatching => "keyword_matching",
            RoutingMethod::LlmIntent => "llm_intent",
        }
    }
}

/// 关键词路由：首个命中示例的机台
pub fn keyword_route(examples: &[RoutingExample], query: &str) -> Option<String> {
    let query_lower = query.to_lowercase();
    examples
        .iter()
        .find(|e| e.matches(&query_lower))
        .map(|e| e.machine_id.clone())
}

fn routing_prompt(machines: &[String], examples: &[RoutingExample]) -> String {
    let mut prompt = String::from(
        "You route user questions to the machine they are about.\n\
         Answer with exactly one machine id from the list and nothing else.\n\nMachines:\n",
    );
    for m in machines {
        prompt.push_str(&format!("- {}\n", m));
    }
    if !examples.is_empty() {
        prompt.push_str("\nExamples:\n");
        for e in examples {
            let desc = if e.description.is_empty() {
                String::new()
            } else {
                format!(" ({})", e.description)
            };
            prompt.push_str(&format!(
                "- keywords [{}] -> {}{}\n",
                e.keywords.join(", "),
                e.machine_id,
                desc
            ));
        }
    }
    prompt
}

/// 从 LLM 回答中取出已知机台：先整句精确匹配，再按词匹配
pub fn parse_machine_answer(answer: &str, machines: &[String]) -> Option<String> {
    let trimmed = answer
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`' || c == '.');
    if let Some(m) = machines.iter().find(|m| m.as_str() == trimmed) {
        return Some(m.clone());
    }
    let tokens: Vec<&str> = answer
        .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'))
        .filter(|t| !t.is_empty())
        .collect();
    tokens
        .iter()
        .find_map(|t| machines.iter().find(|m| m.as_str() == *t))
        .cloned()
}

/// LLM 意图路由；任何失败返回 None
pub async fn llm_route(
    provider: &dyn LlmProvider,
    model: &str,
    query: &str,
    machines: &[String],
    examples: &[RoutingExample],
) -> Option<String> {
    if machines.is_empty() {
        return None;
    }
    let messages = vec![
        ChatMessage::system(routing_prompt(machines, examples)),
        ChatMessage::user(query),
    ];
    let options = CompletionOptions {
        model: model.to_string(),
        temperature: 0.0,
        ..CompletionOptions::default()
    };
    match provider.complete(&messages, &options).await {
        Ok(resp) => {
            let machine = parse_machine_answer(&resp.content, machines);
            if machine.is_none() {
                tracing::debug!(answer = %resp.content, "LLM routing answer names no known machine");
            }
            machine
        }
        Err(e) => {
            tracing::warn!("LLM routing failed, falling back to keywords: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmProvider};

    fn examples() -> Vec<RoutingExample> {
        vec![
            RoutingExample {
                keywords: vec!["Temperature".into(), "heat".into()],
                machine_id: "m1".into(),
                description: "thermal".into(),
            },
            RoutingExample {
                keywords: vec!["vibration".into(), "temp".into()],
                machine_id: "m2".into(),
                description: String::new(),
            },
        ]
    }

    #[test]
    fn test_keyword_route_first_declared_wins() {
        assert_eq!(keyword_route(&examples(), "What is the TEMPERATURE?").as_deref(), Some("m1"));
        assert_eq!(keyword_route(&examples(), "any vibration today").as_deref(), Some("m2"));
        assert_eq!(keyword_route(&examples(), "hello"), None);
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("LLM".parse::<RoutingStrategy>().unwrap(), RoutingStrategy::Llm);
        assert_eq!("".parse::<RoutingStrategy>().unwrap(), RoutingStrategy::Keyword);
        assert!("random".parse::<RoutingStrategy>().is_err());
    }

    #[test]
    fn test_parse_machine_answer() {
        let machines = vec!["m1".to_string(), "press-2".to_string()];
        assert_eq!(parse_machine_answer(" \"press-2\" ", &machines).as_deref(), Some("press-2"));
        assert_eq!(parse_machine_answer("The answer is m1.", &machines).as_deref(), Some("m1"));
        assert_eq!(parse_machine_answer("m10", &machines), None);
    }

    #[tokio::test]
    async fn test_llm_route() {
        let machines = vec!["m1".to_string(), "m2".to_string()];
        let provider = MockLlmProvider::text("m2");
        assert_eq!(
            llm_route(&provider, "gpt-4", "how hot", &machines, &examples()).await.as_deref(),
            Some("m2")
        );

        let provider = MockLlmProvider::text("no idea");
        assert_eq!(llm_route(&provider, "gpt-4", "q", &machines, &[]).await, None);

        let provider = MockLlmProvider::from_results(vec![Err(LlmError::Request("down".into()))]);
        assert_eq!(llm_route(&provider, "gpt-4", "q", &machines, &[]).await, None);
    }
}
