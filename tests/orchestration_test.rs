//! 编排端到端集成测试：共享上下文、事件总线、注册表、协调器与工具调用循环

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use hive::agents::{Agent, AgentProfile, AgentRegistry, AgentRuntime, SpecializedAgent, TaskSpec};
    use hive::core::{Coordinator, Event, EventBus, EventKind, SharedContext, WorkflowStatus};
    use hive::llm::{LlmResponse, MockLlmProvider, ToolCall};
    use hive::react::MAX_ITERATIONS_MESSAGE;
    use hive::tools::{FnTool, LocalToolServer, ToolHub};
    use serde_json::json;

    struct World {
        context: Arc<SharedContext>,
        events: Arc<EventBus>,
        hub: Arc<ToolHub>,
    }

    impl World {
        async fn new() -> Self {
            let hub = Arc::new(ToolHub::default());
            hub.connect(Arc::new(
                LocalToolServer::new("database")
                    .with_tool(FnTool::new("sql_query", "Run a read-only SQL query", |_| {
                        Ok(json!({ "rows": [{ "temperature": 71.5 }] }))
                    }))
                    .with_tool(FnTool::new("drop_tables", "Drop every table", |_| Ok(json!("dropped")))),
            ))
            .await
            .unwrap();
            Self {
                context: Arc::new(SharedContext::new()),
                events: Arc::new(EventBus::default()),
                hub,
            }
        }

        fn runtime(&self, provider: Option<Arc<MockLlmProvider>>) -> AgentRuntime {
            let rt = AgentRuntime::new(self.context.clone(), self.events.clone()).with_tools(self.hub.clone());
            match provider {
                Some(p) => rt.with_provider(p),
                None => rt,
            }
        }

        fn agent(
            &self,
            id: &str,
            machine: &str,
            function: &str,
            tools: &[&str],
            provider: Option<Arc<MockLlmProvider>>,
        ) -> Arc<dyn Agent> {
            Arc::new(SpecializedAgent::new(
                AgentProfile::new(id, id, machine, function).with_tools(tools.iter().copied()),
                self.runtime(provider),
            ))
        }

        fn coordinator(&self, agents: Vec<Arc<dyn Agent>>) -> Coordinator {
            let mut registry = AgentRegistry::new();
            for a in agents {
                registry.register(a);
            }
            Coordinator::new(Arc::new(registry), self.context.clone(), self.events.clone())
        }
    }

    fn call(id: &str, tool: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: tool.to_string(),
            arguments: json!({ "query": "SELECT 1" }),
        }
    }

    #[test]
    fn test_last_write_wins_and_version_increments() {
        let ctx = SharedContext::new();
        for i in 0..5u64 {
            let before = ctx.version();
            ctx.write("m1.data", json!(i), Some("writer"), None);
            assert_eq!(ctx.version(), before + 1);
        }
        assert_eq!(ctx.read("m1.data"), Some(json!(4)));
        assert_eq!(ctx.metadata("m1.data").unwrap().version, 5);
        assert!(ctx.read("m1.analysis").is_none());
    }

    #[test]
    fn test_event_history_is_bounded() {
        let bus = EventBus::new(3);
        for i in 0..4 {
            bus.publish(Event::new(EventKind::AgentReady, format!("a{}", i), json!(i)));
        }
        let history = bus.history(None, None, 10);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].agent_id, "a3");
        assert!(history.iter().all(|e| e.agent_id != "a0"));
    }

    #[test]
    fn test_failing_handler_does_not_block_others() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventKind::TaskFailed, |_| Err("boom".to_string()));
        bus.subscribe(EventKind::TaskFailed, |_| panic!("handler panicked"));
        let counter = hits.clone();
        bus.subscribe(EventKind::TaskFailed, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.publish(Event::new(EventKind::TaskFailed, "a", json!({})));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_two_step_plan_returns_summary_message() {
        let world = World::new().await;
        let c = world.coordinator(vec![
            world.agent("m1_fetch", "m1", "data_fetching", &["sql_query"], None),
            world.agent("m1_summary", "m1", "summary", &[], None),
            world.agent("m2_fetch", "m2", "data_fetching", &["sql_query"], None),
        ]);
        c.add_routing_example(vec!["temperature".to_string()], "m1", "thermal");

        let outcome = c.execute_workflow("What is the TEMPERATURE trend?").await;

        assert_eq!(outcome.status, WorkflowStatus::Completed);
        assert_eq!(outcome.machine_id.as_deref(), Some("m1"));
        let plan = outcome.plan.unwrap();
        let agents: Vec<&str> = plan.steps.iter().map(|s| s.agent_id.as_str()).collect();
        assert_eq!(agents, vec!["m1_fetch", "m1_summary"]);
        assert!(outcome.results.iter().all(|r| r.is_success()));
        assert_eq!(
            outcome.final_output.as_deref(),
            Some("Task executed by m1_summary (no LLM provider configured)")
        );

        let summary_output = outcome.results[1].output.as_ref().unwrap();
        assert_eq!(summary_output["context_available"], json!(["m1.data"]));
        assert!(world.context.read("m1.final_summary").is_some());
    }

    #[tokio::test]
    async fn test_only_data_step_succeeds() {
        let world = World::new().await;
        let failing = Arc::new(MockLlmProvider::from_results(vec![Err(
            hive::llm::LlmError::Request("connection refused".to_string()),
        )]));
        let c = world.coordinator(vec![
            world.agent("m1_fetch", "m1", "data_fetching", &["sql_query"], None),
            world.agent("m1_analysis", "m1", "analysis", &[], Some(failing.clone())),
            world.agent("m1_summary", "m1", "summary", &[], Some(failing)),
        ]);

        let outcome = c.execute_workflow("anything").await;
        assert_eq!(outcome.status, WorkflowStatus::Completed);
        assert_eq!(outcome.results.len(), 3);
        assert!(!outcome.results[1].is_success());
        assert!(!outcome.results[2].is_success());
        assert_eq!(
            outcome.final_output.as_deref(),
            Some("Task executed by m1_fetch (no LLM provider configured)")
        );
        assert_eq!(world.events.history(Some(EventKind::TaskFailed), None, 10).len(), 2);
    }

    #[tokio::test]
    async fn test_always_tool_calling_provider_hits_iteration_cap() {
        let world = World::new().await;
        let provider = Arc::new(MockLlmProvider::always_tool_call("sql_query"));
        let agent = SpecializedAgent::new(
            AgentProfile::new("m1_fetch", "Fetcher", "m1", "data_fetching").with_tools(["sql_query"]),
            world.runtime(Some(provider.clone())).with_max_iterations(4),
        );

        let result = agent.execute(&TaskSpec::new("loop forever")).await;
        assert!(result.is_success());
        assert_eq!(result.output, Some(json!(MAX_ITERATIONS_MESSAGE)));
        assert_eq!(provider.call_count(), 4);
        assert_eq!(result.metadata["hit_iteration_limit"], true);
        assert_eq!(world.events.history(Some(EventKind::ToolInvoked), None, 100).len(), 4);
    }

    #[tokio::test]
    async fn test_permission_violation_is_recorded_not_fatal() {
        let world = World::new().await;
        let provider = Arc::new(MockLlmProvider::scripted(vec![
            LlmResponse::with_tool_calls(vec![call("call_1", "drop_tables")]),
            LlmResponse::text("I am not allowed to drop tables; temperature is 71.5"),
        ]));
        let c = world.coordinator(vec![world.agent(
            "m1_fetch",
            "m1",
            "data_fetching",
            &["sql_query"],
            Some(provider.clone()),
        )]);

        let outcome = c.execute_workflow("drop everything").await;
        assert_eq!(outcome.status, WorkflowStatus::Completed);
        let step = &outcome.results[0];
        assert!(step.is_success());
        let failures = step.metadata["tool_failures"].as_array().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0]["tool"], "drop_tables");
        assert_eq!(failures[0]["kind"], "permission");

        let second_call = provider.messages_at(1).unwrap();
        let tool_msg = second_call.last().unwrap();
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
        assert!(tool_msg.content.contains("not permitted"));
        assert!(world.events.history(Some(EventKind::ToolInvoked), None, 10).is_empty());
    }

    #[tokio::test]
    async fn test_empty_registry_workflow_fails_gracefully() {
        let world = World::new().await;
        let outcome = world.coordinator(vec![]).execute_workflow("hello").await;
        assert_eq!(outcome.status, WorkflowStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("No agents available in registry"));
        let completed = world.events.history(Some(EventKind::WorkflowCompleted), None, 10);
        assert_eq!(completed[0].payload["status"], "failed");
    }
}
