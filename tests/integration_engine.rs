//! Workflow engine scenarios driven through in-memory collaborators.

use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;

use nightshift::config::CapacityConfig;
use nightshift::state::TransitionMeta;
use nightshift::store::TaskStore;
use nightshift::task::{AutonomyLevel, PauseReason, SkipCause, StageOutcome, Status};
use nightshift::test_helpers::{
    ScriptedExecutor, Step, diamond_graph, engine_fixture, engine_fixture_with, graph_of,
    linear_graph, local_at, running_task, stage_def,
};
use nightshift::workflow::loader::parse_workflow;
use nightshift::workflow::{RunOutcome, WorkflowDef, WorkflowError, WorkflowGraph};

fn last_outcome(task: &nightshift::Task, stage: &str) -> Option<StageOutcome> {
    task.last_run(stage).map(|r| r.outcome)
}

#[tokio::test]
async fn test_diamond_failure_skips_join_but_runs_sibling() {
    let executor = ScriptedExecutor::new().with_steps("b", vec![Step::Fail("boom".into())]);
    let fixture = engine_fixture(executor, vec![running_task("t1")]);

    let outcome = fixture.advance("t1", &diamond_graph()).await;

    let task = fixture.task("t1");
    assert_eq!(task.status, Status::Failed);
    assert_eq!(last_outcome(&task, "a"), Some(StageOutcome::Succeeded));
    assert_eq!(last_outcome(&task, "b"), Some(StageOutcome::Failed));
    assert_eq!(last_outcome(&task, "c"), Some(StageOutcome::Succeeded));
    let d = task.last_run("d").unwrap();
    assert_eq!(d.outcome, StageOutcome::Skipped);
    assert_eq!(d.skip_cause, Some(SkipCause::UpstreamFailed));
    assert_eq!(fixture.executor.attempts("d"), 0);

    let failure = task.failure.unwrap();
    assert_eq!(failure.stage.as_deref(), Some("b"));
    assert_eq!(failure.reason, "boom");
    assert_eq!(failure.attempts, 1);
    assert!(matches!(outcome, RunOutcome::Failed(_)));
}

#[tokio::test]
async fn test_diamond_branches_run_concurrently_and_join_waits() {
    let executor = ScriptedExecutor::new()
        .with_steps("b", vec![Step::Delay(Duration::from_millis(50))])
        .with_steps("c", vec![Step::Delay(Duration::from_millis(50))]);
    let fixture = engine_fixture(executor, vec![running_task("t1")]);

    let outcome = fixture.advance("t1", &diamond_graph()).await;
    assert_eq!(outcome, RunOutcome::Completed);

    let executor = &fixture.executor;
    assert!(executor.max_concurrency() >= 2);
    let start_d = executor.position("start:d").unwrap();
    assert!(executor.position("end:b").unwrap() < start_d);
    assert!(executor.position("end:c").unwrap() < start_d);
    assert!(executor.position("end:a").unwrap() < executor.position("start:b").unwrap());
}

#[tokio::test]
async fn test_retry_budget_is_exact() {
    let mut build = stage_def("build", &[]);
    build.retries = 2;
    let graph = graph_of("retry", vec![build]);
    let executor = ScriptedExecutor::new().with_steps(
        "build",
        vec![
            Step::Fail("one".into()),
            Step::Fail("two".into()),
            Step::Fail("three".into()),
            Step::Succeed,
        ],
    );
    let fixture = engine_fixture(executor, vec![running_task("t1")]);

    fixture.advance("t1", &graph).await;

    assert_eq!(fixture.executor.attempts("build"), 3);
    let task = fixture.task("t1");
    assert_eq!(task.status, Status::Failed);
    let failure = task.failure.unwrap();
    assert_eq!(failure.attempts, 3);
    assert_eq!(failure.reason, "three");
}

#[tokio::test]
async fn test_retry_recovers_within_budget() {
    let mut build = stage_def("build", &[]);
    build.retries = 1;
    let graph = graph_of("retry", vec![build]);
    let executor = ScriptedExecutor::new()
        .with_steps("build", vec![Step::Fail("flaky".into()), Step::Succeed]);
    let fixture = engine_fixture(executor, vec![running_task("t1")]);

    assert_eq!(fixture.advance("t1", &graph).await, RunOutcome::Completed);
    let requests = fixture.executor.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].attempt, 2);
    assert_eq!(fixture.task("t1").last_run("build").unwrap().attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_stage_timeout_fails_task() {
    let executor = ScriptedExecutor::new().with_steps("a", vec![Step::Hang]);
    let fixture = engine_fixture(executor, vec![running_task("t1")]);

    let outcome = fixture.advance("t1", &linear_graph(&["a", "b"])).await;

    let task = fixture.task("t1");
    assert!(matches!(outcome, RunOutcome::Failed(_)));
    assert_eq!(last_outcome(&task, "a"), Some(StageOutcome::TimedOut));
    assert_eq!(
        task.last_run("b").unwrap().skip_cause,
        Some(SkipCause::UpstreamFailed)
    );
    let failure = task.failure.unwrap();
    assert_eq!(failure.stage.as_deref(), Some("a"));
    assert!(failure.reason.contains("timed out"));
}

#[test]
fn test_cyclic_workflow_is_rejected_at_load() {
    let def = WorkflowDef {
        name: "loop".to_string(),
        description: None,
        stages: vec![stage_def("a", &["b"]), stage_def("b", &["a"])],
    };
    let err = WorkflowGraph::from_def(def, Duration::from_secs(60)).unwrap_err();
    assert!(matches!(err, WorkflowError::Cycle { .. }));

    let yaml = r#"
name: bad
stages:
  - name: a
    agent: x
    depends_on: [missing]
"#;
    let err = parse_workflow("bad", yaml, Duration::from_secs(60)).unwrap_err();
    assert!(matches!(err, WorkflowError::UnknownDependency { .. }));
}

#[tokio::test]
async fn test_false_condition_skips_stage_but_dependents_run() {
    let yaml = r#"
name: gated
stages:
  - name: test
    agent: tester
  - name: fix
    agent: coder
    depends_on: [test]
    condition: "test.passed == false"
  - name: ship
    agent: shipper
    depends_on: [fix]
"#;
    let graph = parse_workflow("gated", yaml, Duration::from_secs(60)).unwrap();
    let executor = ScriptedExecutor::new().with_outputs("test", json!({"passed": true}));
    let fixture = engine_fixture(executor, vec![running_task("t1")]);

    assert_eq!(fixture.advance("t1", &graph).await, RunOutcome::Completed);
    let task = fixture.task("t1");
    let fix = task.last_run("fix").unwrap();
    assert_eq!(fix.outcome, StageOutcome::Skipped);
    assert_eq!(fix.skip_cause, Some(SkipCause::ConditionFalse));
    assert_eq!(fixture.executor.attempts("fix"), 0);
    assert_eq!(fixture.executor.attempts("ship"), 1);
}

#[tokio::test]
async fn test_approval_gate_holds_then_resumes() {
    let mut review = stage_def("review", &["build"]);
    review.approval = true;
    let graph = graph_of("gated", vec![stage_def("build", &[]), review]);
    let fixture = engine_fixture(ScriptedExecutor::new(), vec![running_task("t1")]);

    let outcome = fixture.advance("t1", &graph).await;
    assert_eq!(outcome, RunOutcome::AwaitingApproval("review".to_string()));
    let task = fixture.task("t1");
    assert_eq!(task.status, Status::WaitingApproval);
    assert_eq!(task.awaiting_stage.as_deref(), Some("review"));
    assert_eq!(fixture.executor.attempts("review"), 0);

    fixture
        .store
        .apply_transition(
            "t1",
            Status::WaitingApproval,
            Status::InProgress,
            TransitionMeta::reason("approved").with_actor(Some("alice".to_string())),
        )
        .unwrap();

    assert_eq!(fixture.advance("t1", &graph).await, RunOutcome::Completed);
    let task = fixture.task("t1");
    assert_eq!(task.approvals.len(), 1);
    assert_eq!(task.approvals[0].stage, "review");
    assert_eq!(task.approvals[0].approver.as_deref(), Some("alice"));
    assert_eq!(fixture.executor.attempts("build"), 1);
    assert_eq!(fixture.executor.attempts("review"), 1);
}

#[tokio::test]
async fn test_autonomous_task_ignores_gates() {
    let mut review = stage_def("review", &[]);
    review.approval = true;
    let graph = graph_of("gated", vec![review]);
    let mut task = running_task("t1");
    task.autonomy = AutonomyLevel::Autonomous;
    let fixture = engine_fixture(ScriptedExecutor::new(), vec![task]);

    assert_eq!(fixture.advance("t1", &graph).await, RunOutcome::Completed);
}

#[tokio::test]
async fn test_rate_limit_pauses_without_consuming_retry() {
    let executor = ScriptedExecutor::new()
        .with_steps("a", vec![Step::RateLimit(Duration::from_secs(30))]);
    let fixture = engine_fixture(executor, vec![running_task("t1")]);
    let graph = linear_graph(&["a", "b"]);

    let before = Utc::now();
    let outcome = fixture.advance("t1", &graph).await;
    assert_eq!(outcome, RunOutcome::Paused(PauseReason::RateLimit));

    let task = fixture.task("t1");
    assert_eq!(task.status, Status::Paused);
    let pause = task.pause.clone().unwrap();
    assert_eq!(pause.paused_from, Status::InProgress);
    let resume_at = pause.resume_at.unwrap();
    assert!(resume_at >= before + chrono::Duration::seconds(29));
    assert!(task.last_run("a").is_none());

    // Not before resume_at
    let early = fixture
        .admission
        .run_cycle_at(&HashSet::new(), local_at(22, 0), Utc::now())
        .unwrap();
    assert!(early.is_empty());

    let started = fixture
        .admission
        .run_cycle_at(&HashSet::new(), local_at(22, 0), resume_at + chrono::Duration::seconds(1))
        .unwrap();
    assert_eq!(started.len(), 1);
    assert_eq!(fixture.task("t1").status, Status::InProgress);

    assert_eq!(fixture.advance("t1", &graph).await, RunOutcome::Completed);
    assert_eq!(fixture.task("t1").last_run("a").unwrap().attempts, 1);
}

#[tokio::test]
async fn test_capacity_pause_at_day_threshold_and_night_resume() {
    // Default config: $10 budget, $0.50 reserve, 80% by day, 95% at night
    let executor = ScriptedExecutor::new().with_steps("a", vec![Step::Cost(7.5)]);
    let fixture = engine_fixture_with(
        executor,
        vec![running_task("t1")],
        CapacityConfig::default(),
        local_at(14, 0),
        4,
    );
    let graph = linear_graph(&["a", "b"]);

    let outcome = fixture.advance("t1", &graph).await;
    assert_eq!(outcome, RunOutcome::Paused(PauseReason::Capacity));
    let task = fixture.task("t1");
    assert_eq!(task.status, Status::Paused);
    assert_eq!(last_outcome(&task, "a"), Some(StageOutcome::Succeeded));
    assert!(task.last_run("b").is_none());
    assert_eq!(task.usage.cost, 7.5);
    assert!(!fixture.admission.check().is_admitted());

    // Still day mode: nothing resumes
    let started = fixture.admission.run_cycle(&HashSet::new()).unwrap();
    assert!(started.is_empty());

    fixture.set_time(local_at(22, 0));
    let started = fixture.admission.run_cycle(&HashSet::new()).unwrap();
    assert_eq!(started.len(), 1);
    assert_eq!(fixture.task("t1").status, Status::InProgress);

    assert_eq!(fixture.advance("t1", &graph).await, RunOutcome::Completed);
    assert_eq!(fixture.executor.attempts("a"), 1);
    assert_eq!(fixture.executor.attempts("b"), 1);
}

#[tokio::test]
async fn test_failed_stage_stays_failed_across_capacity_pause() {
    // x fails with no retries while y spends enough to block z by day
    let graph = graph_of(
        "split",
        vec![stage_def("x", &[]), stage_def("y", &[]), stage_def("z", &["y"])],
    );
    let executor = ScriptedExecutor::new()
        .with_steps("x", vec![Step::Fail("x-1".into()), Step::Fail("x-2".into())])
        .with_steps("y", vec![Step::Cost(8.0)]);
    let fixture = engine_fixture_with(
        executor,
        vec![running_task("t1")],
        CapacityConfig::default(),
        local_at(14, 0),
        4,
    );

    let outcome = fixture.advance("t1", &graph).await;
    assert_eq!(outcome, RunOutcome::Paused(PauseReason::Capacity));
    let task = fixture.task("t1");
    assert_eq!(last_outcome(&task, "x"), Some(StageOutcome::Failed));
    assert!(task.last_run("z").is_none());

    fixture.set_time(local_at(23, 0));
    let started = fixture.admission.run_cycle(&HashSet::new()).unwrap();
    assert_eq!(started.len(), 1);

    let outcome = fixture.advance("t1", &graph).await;
    assert!(matches!(outcome, RunOutcome::Failed(_)), "{:?}", outcome);
    assert_eq!(fixture.executor.attempts("x"), 1);
    assert_eq!(fixture.executor.attempts("z"), 1);

    let task = fixture.task("t1");
    assert_eq!(task.status, Status::Failed);
    let failure = task.failure.unwrap();
    assert_eq!(failure.stage.as_deref(), Some("x"));
    assert_eq!(failure.reason, "x-1");
    assert_eq!(failure.attempts, 1);
    let x_runs = task.stage_runs.iter().filter(|r| r.stage == "x").count();
    assert_eq!(x_runs, 1);
}

#[tokio::test]
async fn test_cancel_signal_aborts_in_flight_stage() {
    let executor = ScriptedExecutor::new().with_steps("a", vec![Step::Hang]);
    let fixture = engine_fixture(executor, vec![running_task("t1")]);
    let graph = linear_graph(&["a", "b"]);

    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    let store = fixture.store.clone();
    let canceller = tokio::spawn(async move {
        loop {
            let task = store.get("t1").unwrap().unwrap();
            if task.current_stage.is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        store
            .apply_transition(
                "t1",
                Status::InProgress,
                Status::Cancelled,
                TransitionMeta::reason("operator"),
            )
            .unwrap();
        cancel_tx.send(true).unwrap();
        cancel_tx
    });

    let outcome = fixture.engine.advance("t1", &graph, cancel_rx).await.unwrap();
    let _cancel_tx = canceller.await.unwrap();

    assert_eq!(outcome, RunOutcome::Cancelled);
    let task = fixture.task("t1");
    assert_eq!(task.status, Status::Cancelled);
    assert!(task.stage_runs.is_empty());
    assert_eq!(fixture.executor.attempts("b"), 0);
}
