//! End-to-end runs against a real SQLite store and a scripted agent service.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use stepflow_core::config::AppConfig;
use stepflow_core::definition::WorkflowDefinition;
use stepflow_core::event::WorkflowEvent;
use stepflow_core::types::{CircuitState, ExecutionStatus, StepStatus};
use stepflow_engine::WorkflowEngine;
use stepflow_store::SqliteStore;
use stepflow_test_utils::{Reply, ScriptedInvoker};

fn fast_config() -> AppConfig {
    AppConfig::from_toml(
        r#"
[retry]
base_delay_ms = 1
max_delay_ms = 5
"#,
    )
    .expect("parse config")
}

fn engine_with(agents: ScriptedInvoker) -> (WorkflowEngine, Arc<ScriptedInvoker>) {
    let agents = Arc::new(agents);
    let store = Arc::new(SqliteStore::in_memory().expect("open store"));
    let engine = WorkflowEngine::from_config(store, agents.clone(), &fast_config());
    (engine, agents)
}

#[tokio::test]
async fn test_scenario_a_single_call() {
    let (engine, _) = engine_with(ScriptedInvoker::new().on("a1", "m1", json!({"x": 1})));
    let definition = WorkflowDefinition::from_value(json!({
        "name": "scenario-a",
        "steps": [
            {"id": "s1", "kind": "agent_call", "agentId": "a1", "methodId": "m1", "params": {}}
        ]
    }))
    .unwrap();

    let workflow = engine.create_workflow("a", definition, None).await.unwrap();
    let execution = engine.execute_workflow(&workflow.id, json!({})).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.outputs, Some(json!({"s1": {"x": 1}})));
    assert!(execution.completed_at >= execution.started_at);

    let report = engine.get_execution_status(&execution.id).await.unwrap();
    assert_eq!(report.progress, 100.0);
    assert_eq!(report.steps.len(), 1);
    assert_eq!(report.steps[0].status, StepStatus::Success);
}

#[tokio::test]
async fn test_scenario_b_parallel_partial_failure_under_continue() {
    let (engine, _) = engine_with(
        ScriptedInvoker::new()
            .on("inventory", "check", json!({"in_stock": true}))
            .failing("pricing", "quote", "pricing service unavailable"),
    );
    let definition = WorkflowDefinition::from_value(json!({
        "name": "scenario-b",
        "errorHandling": {"onStepFailure": "continue"},
        "steps": [
            {"id": "stock", "kind": "agent_call", "agentId": "inventory", "methodId": "check"},
            {"id": "price", "kind": "agent_call", "agentId": "pricing", "methodId": "quote"},
            {"id": "gather", "kind": "parallel", "parallelSteps": ["stock", "price"]},
            {
                "id": "priced",
                "kind": "condition",
                "dependsOn": ["gather"],
                "condition": {"operator": "equals", "left": "${price.status}", "right": "success"}
            }
        ]
    }))
    .unwrap();

    let workflow = engine.create_workflow("b", definition, None).await.unwrap();
    let execution = engine.execute_workflow(&workflow.id, json!({})).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Success);
    let outputs = execution.outputs.unwrap();
    assert_eq!(
        outputs["gather"]["parallelResults"],
        json!({"stock": {"in_stock": true}, "price": null})
    );
    // The failure is visible to later steps.
    assert_eq!(outputs["priced"], json!({"conditionResult": false}));

    let records = engine.get_execution_steps(&execution.id).await.unwrap();
    let price = records.iter().find(|r| r.step_id == "price").unwrap();
    assert_eq!(price.status, StepStatus::Error);
    assert!(price
        .error_reason
        .as_deref()
        .unwrap()
        .contains("pricing service unavailable"));
    let stock = records.iter().find(|r| r.step_id == "stock").unwrap();
    assert_eq!(stock.status, StepStatus::Success);
    assert_eq!(records.len(), 4);
}

#[tokio::test]
async fn test_scenario_c_stop_never_dispatches_dependent() {
    let (engine, agents) = engine_with(
        ScriptedInvoker::new()
            .failing("a1", "m1", "boom")
            .on("a2", "m2", json!("unreachable")),
    );
    let definition = WorkflowDefinition::from_value(json!({
        "name": "scenario-c",
        "errorHandling": {"onStepFailure": "stop"},
        "steps": [
            {"id": "first", "kind": "agent_call", "agentId": "a1", "methodId": "m1"},
            {"id": "second", "kind": "agent_call", "agentId": "a2", "methodId": "m2",
             "dependsOn": ["first"]}
        ]
    }))
    .unwrap();

    let workflow = engine.create_workflow("c", definition, None).await.unwrap();
    let execution = engine.execute_workflow(&workflow.id, json!({})).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Error);
    assert!(execution.outputs.unwrap()["error"]
        .as_str()
        .unwrap()
        .contains("first"));
    assert_eq!(agents.calls("a2", "m2"), 0);

    let records = engine.get_execution_steps(&execution.id).await.unwrap();
    let second = records.iter().find(|r| r.step_id == "second").unwrap();
    assert_eq!(second.status, StepStatus::Skipped);
    assert!(records.iter().all(|r| r.status != StepStatus::Running));
}

#[tokio::test]
async fn test_retry_recovers_transient_failure() {
    let (engine, agents) = engine_with(ScriptedInvoker::new().script(
        "a1",
        "m1",
        vec![Reply::Fail("blip".into()), Reply::Ok(json!({"ok": true}))],
    ));
    let workflow = engine
        .create_workflow("retry", stepflow_test_utils::single_call_workflow(), None)
        .await
        .unwrap();

    let execution = engine.execute_workflow(&workflow.id, json!({})).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(agents.calls("a1", "m1"), 2);
}

#[tokio::test]
async fn test_invalid_params_fail_fast() {
    let (engine, agents) = engine_with(ScriptedInvoker::new().script(
        "a1",
        "m1",
        vec![Reply::InvalidParams("missing field 'email'".into())],
    ));
    let workflow = engine
        .create_workflow("fail-fast", stepflow_test_utils::single_call_workflow(), None)
        .await
        .unwrap();

    let execution = engine.execute_workflow(&workflow.id, json!({})).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Error);
    assert_eq!(agents.calls("a1", "m1"), 1);
}

#[tokio::test]
async fn test_events_follow_execution_lifecycle() {
    let (engine, _) = engine_with(
        ScriptedInvoker::new().on("a1", "m1", json!(1)).on("a2", "m2", json!(2)),
    );
    let workflow = engine
        .create_workflow(
            "events",
            stepflow_test_utils::linear_workflow(Default::default()),
            None,
        )
        .await
        .unwrap();

    let mut rx = engine.subscribe();
    let execution = engine.execute_workflow(&workflow.id, json!({})).await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.execution_id(), Some(execution.id.as_str()));
        kinds.push(match event {
            WorkflowEvent::ExecutionStarted { .. } => "execution_started",
            WorkflowEvent::StepStarted { .. } => "step_started",
            WorkflowEvent::StepCompleted { .. } => "step_completed",
            WorkflowEvent::ExecutionFinished { .. } => "execution_finished",
            _ => "other",
        });
    }
    assert_eq!(
        kinds,
        vec![
            "execution_started",
            "step_started",
            "step_completed",
            "step_started",
            "step_completed",
            "execution_finished",
        ]
    );
}

#[tokio::test]
async fn test_execution_persists_across_store_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("stepflow.db");
    let agents: Arc<ScriptedInvoker> =
        Arc::new(ScriptedInvoker::new().on("a1", "m1", json!({"x": 1})));

    let execution_id = {
        let store = Arc::new(SqliteStore::open(&db_path).unwrap());
        let engine = WorkflowEngine::from_config(store, agents.clone(), &fast_config());
        let workflow = engine
            .create_workflow("durable", stepflow_test_utils::single_call_workflow(), None)
            .await
            .unwrap();
        engine
            .execute_workflow(&workflow.id, json!({}))
            .await
            .unwrap()
            .id
    };

    let store = Arc::new(SqliteStore::open(&db_path).unwrap());
    let engine = WorkflowEngine::from_config(store, agents, &fast_config());
    let report = engine.get_execution_status(&execution_id).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Success);
    assert_eq!(report.progress, 100.0);

    // Terminal executions stay as they are.
    let cancelled = engine.cancel_execution(&execution_id).await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_independent_executions_run_concurrently() {
    let (engine, agents) = engine_with(
        ScriptedInvoker::new()
            .on("a1", "m1", json!(1))
            .with_delay("a1", "m1", Duration::from_millis(100)),
    );
    let engine = Arc::new(engine);
    let workflow = engine
        .create_workflow("concurrent", stepflow_test_utils::single_call_workflow(), None)
        .await
        .unwrap();

    let runs: Vec<_> = (0..3)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let id = workflow.id.clone();
            tokio::spawn(async move { engine.execute_workflow(&id, json!({})).await })
        })
        .collect();
    for run in runs {
        let execution = run.await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Success);
    }
    assert_eq!(agents.peak_concurrency(), 3);
    assert_eq!(
        engine.get_execution_history(&workflow.id, 10).await.unwrap().len(),
        3
    );
}

#[tokio::test]
async fn test_cancel_from_second_engine_stops_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("stepflow.db");

    let agents = Arc::new(
        ScriptedInvoker::new()
            .on("a1", "m1", json!(1))
            .on("a2", "m2", json!(2))
            .with_delay("a1", "m1", Duration::from_millis(300)),
    );
    let runner_engine = Arc::new(WorkflowEngine::from_config(
        Arc::new(SqliteStore::open(&db_path).unwrap()),
        agents.clone(),
        &fast_config(),
    ));
    // Same database, separate engine: how `stepflow cancel` reaches a run.
    let other_engine = WorkflowEngine::from_config(
        Arc::new(SqliteStore::open(&db_path).unwrap()),
        Arc::new(ScriptedInvoker::new()),
        &fast_config(),
    );

    let workflow = runner_engine
        .create_workflow(
            "cancel-elsewhere",
            stepflow_test_utils::linear_workflow(Default::default()),
            None,
        )
        .await
        .unwrap();

    let mut events = runner_engine.subscribe();
    let runner = {
        let engine = Arc::clone(&runner_engine);
        let id = workflow.id.clone();
        tokio::spawn(async move { engine.execute_workflow(&id, json!({})).await })
    };
    let execution_id = loop {
        if let WorkflowEvent::StepStarted { execution_id, .. } = events.recv().await.unwrap() {
            break execution_id;
        }
    };

    let cancelled = other_engine.cancel_execution(&execution_id).await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);

    let execution = runner.await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_eq!(agents.calls("a2", "m2"), 0);

    let stored = other_engine.get_execution(&execution_id).await.unwrap();
    assert_eq!(stored.status, ExecutionStatus::Cancelled);

    let records = other_engine.get_execution_steps(&execution_id).await.unwrap();
    let status = |id: &str| records.iter().find(|r| r.step_id == id).unwrap().status;
    assert_eq!(status("s1"), StepStatus::Success);
    assert_eq!(status("s2"), StepStatus::Skipped);

    let mut saw_cancel = false;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, WorkflowEvent::ExecutionFinished { .. }));
        saw_cancel |= matches!(event, WorkflowEvent::ExecutionCancelled { .. });
    }
    assert!(saw_cancel);
}

#[tokio::test]
async fn test_circuit_recovers_through_half_open_probe() {
    let config = AppConfig::from_toml(
        r#"
[retry]
max_retries = 1

[circuit_breaker]
failure_threshold = 1
success_threshold = 1
timeout_secs = 1
"#,
    )
    .unwrap();
    let agents = Arc::new(ScriptedInvoker::new().script(
        "a1",
        "m1",
        vec![Reply::Fail("down".into()), Reply::Ok(json!({"ok": true}))],
    ));
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let engine = WorkflowEngine::from_config(store, agents.clone(), &config);
    let workflow = engine
        .create_workflow("recovery", stepflow_test_utils::single_call_workflow(), None)
        .await
        .unwrap();
    let mut events = engine.subscribe();

    let failed = engine.execute_workflow(&workflow.id, json!({})).await.unwrap();
    assert_eq!(failed.status, ExecutionStatus::Error);
    assert_eq!(engine.circuit_state("a1", "m1").unwrap().state, CircuitState::Open);

    let rejected = engine.execute_workflow(&workflow.id, json!({})).await.unwrap();
    assert_eq!(rejected.status, ExecutionStatus::Error);
    assert!(rejected.outputs.unwrap()["error"].as_str().unwrap().contains("OPEN"));
    assert_eq!(agents.calls("a1", "m1"), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let recovered = engine.execute_workflow(&workflow.id, json!({})).await.unwrap();
    assert_eq!(recovered.status, ExecutionStatus::Success);
    assert_eq!(agents.calls("a1", "m1"), 2);
    assert_eq!(engine.circuit_state("a1", "m1").unwrap().state, CircuitState::Closed);

    let mut transitions = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let WorkflowEvent::CircuitStateChanged { from, to, .. } = event {
            transitions.push((from, to));
        }
    }
    assert_eq!(
        transitions,
        vec![
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Closed),
        ]
    );
    assert_eq!(engine.circuits().len(), 1);
}

#[tokio::test]
async fn test_agent_timeout_override_applies_per_attempt() {
    let config = AppConfig::from_toml(
        r#"
[retry]
max_retries = 2
base_delay_ms = 1
max_delay_ms = 5

[agents.slow]
url = "http://127.0.0.1:9/rpc"
timeout_secs = 1
"#,
    )
    .unwrap();
    let agents = Arc::new(
        ScriptedInvoker::new()
            .on("slow", "m", json!("late"))
            .on("fast", "m", json!("on time"))
            .with_delay("slow", "m", Duration::from_millis(1500))
            .with_delay("fast", "m", Duration::from_millis(1200)),
    );
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let engine = WorkflowEngine::from_config(store, agents.clone(), &config);
    let definition = WorkflowDefinition::from_value(json!({
        "name": "timeouts",
        "errorHandling": {"onStepFailure": "continue"},
        "steps": [
            {"id": "s_slow", "kind": "agent_call", "agentId": "slow", "methodId": "m"},
            {"id": "s_fast", "kind": "agent_call", "agentId": "fast", "methodId": "m"}
        ]
    }))
    .unwrap();
    let workflow = engine.create_workflow("timeouts", definition, None).await.unwrap();

    let execution = engine.execute_workflow(&workflow.id, json!({})).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Success);
    // Each attempt on `slow` hits its 1s override; `fast` keeps the 30s default.
    assert_eq!(agents.calls("slow", "m"), 2);
    assert_eq!(execution.outputs, Some(json!({"s_slow": null, "s_fast": "on time"})));

    let records = engine.get_execution_steps(&execution.id).await.unwrap();
    let slow = records.iter().find(|r| r.step_id == "s_slow").unwrap();
    assert_eq!(slow.status, StepStatus::Error);
    assert!(slow.error_reason.as_deref().unwrap().contains("timed out after 1s"));
    assert_eq!(engine.circuit_state("slow", "m").unwrap().failure_count, 1);
}
