//! Workflow engine
//!
//! Drives one task through its [`WorkflowGraph`]. Stages whose dependencies
//! have all settled run concurrently, each attempt bounded by the stage's
//! timeout and retried up to its retry budget. A failed stage poisons its
//! dependents, which are recorded as skipped without running; branches that
//! do not depend on it carry on.
//!
//! Before each dispatch the engine re-reads the task and asks the admission
//! controller whether capacity remains. Whatever stops a run early (capacity,
//! a rate limit, an approval gate, cancellation) lets the stages already in
//! flight finish first, except cancellation which aborts them.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;

use super::condition::StageOutputs;
use super::graph::{Stage, WorkflowGraph};
use crate::capacity::AdmissionController;
use crate::service::events::{Event, EventBus, StageState};
use crate::service::executor::{AgentError, AgentExecutor, StageRequest};
use crate::state::{TransitionError, TransitionMeta};
use crate::store::{StoreError, TaskStore, off_runtime};
use crate::task::{
    AutonomyLevel, FailureInfo, PauseReason, SkipCause, StageOutcome, StageRun, Status, Task, Usage,
};

/// How a call to [`WorkflowEngine::advance`] ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Failed(FailureInfo),
    Paused(PauseReason),
    AwaitingApproval(String),
    Cancelled,
    /// Someone else moved the task; the engine stopped without touching it
    Interrupted(Status),
}

enum Halt {
    Capacity,
    RateLimit(chrono::DateTime<Utc>),
    Cancelled,
    External(Status),
}

enum StageResult {
    Finished(StageRun),
    RateLimited(std::time::Duration),
}

struct StageJob {
    executor: Arc<dyn AgentExecutor>,
    store: Arc<dyn TaskStore>,
    admission: Arc<AdmissionController>,
    events: EventBus,
    task_id: String,
    description: String,
    stage: Stage,
    context: StageOutputs,
}

pub struct WorkflowEngine {
    executor: Arc<dyn AgentExecutor>,
    store: Arc<dyn TaskStore>,
    admission: Arc<AdmissionController>,
    events: EventBus,
}

impl WorkflowEngine {
    pub fn new(
        executor: Arc<dyn AgentExecutor>,
        store: Arc<dyn TaskStore>,
        admission: Arc<AdmissionController>,
        events: EventBus,
    ) -> Self {
        Self {
            executor,
            store,
            admission,
            events,
        }
    }

    /// Run the task's ready stages until the graph finishes or something
    /// stops it. The task must be `in-progress`.
    ///
    /// Stages with a recorded run are not run again. Succeeded outputs are
    /// restored and a stage that already failed keeps failing its
    /// dependents, so a pause never buys extra attempts. Setting `cancel` to
    /// `true` aborts in-flight stages.
    pub async fn advance(
        &self,
        task_id: &str,
        graph: &WorkflowGraph,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<RunOutcome, StoreError> {
        let id = task_id.to_string();
        let task = self.on_store(move |s| s.get_or_err(&id)).await?;
        if task.status != Status::InProgress {
            return Ok(settled_outcome(task.status));
        }

        let mut runs: HashMap<String, StageRun> = task
            .settled_runs()
            .into_iter()
            .filter(|(name, _)| graph.stage(name).is_some())
            .collect();
        let mut outputs: StageOutputs = runs
            .iter()
            .filter(|(_, run)| run.outcome == StageOutcome::Succeeded)
            .map(|(name, run)| (name.clone(), run.outputs.clone()))
            .collect();
        if !runs.is_empty() {
            tracing::debug!(task = %task_id, reused = runs.len(), "restored earlier stage runs");
        }

        let mut in_flight: HashSet<String> = HashSet::new();
        let mut jobs: JoinSet<(String, StageResult)> = JoinSet::new();
        let mut halt: Option<Halt> = None;
        let mut awaiting: Option<String> = None;
        let mut cancel_open = true;

        loop {
            if *cancel.borrow() {
                halt = Some(Halt::Cancelled);
            }

            if halt.is_none() {
                let ready = self.settle(task_id, graph, &mut runs, &outputs, &in_flight)?;
                if !ready.is_empty() {
                    let id = task_id.to_string();
                    let current = self.on_store(move |s| s.get_or_err(&id)).await?;
                    for stage in ready {
                        match current.status {
                            Status::InProgress => {}
                            Status::Cancelled => {
                                halt = Some(Halt::Cancelled);
                                break;
                            }
                            other => {
                                halt = Some(Halt::External(other));
                                break;
                            }
                        }
                        if needs_approval(&current, stage) {
                            if awaiting.is_none() {
                                awaiting = Some(stage.name.clone());
                            }
                            continue;
                        }
                        let admission = self.admission.check();
                        if !admission.is_admitted() {
                            let snapshot = admission.snapshot();
                            tracing::info!(
                                task = %task_id,
                                stage = %stage.name,
                                mode = %snapshot.mode,
                                usage = snapshot.usage_fraction,
                                threshold = snapshot.threshold,
                                "capacity threshold reached; not dispatching"
                            );
                            halt = Some(Halt::Capacity);
                            break;
                        }

                        let (id, name) = (task_id.to_string(), stage.name.clone());
                        self.on_store(move |s| s.set_current_stage(&id, Some(&name)))
                            .await?;
                        in_flight.insert(stage.name.clone());
                        let job = StageJob {
                            executor: Arc::clone(&self.executor),
                            store: Arc::clone(&self.store),
                            admission: Arc::clone(&self.admission),
                            events: self.events.clone(),
                            task_id: task_id.to_string(),
                            description: current.description.clone(),
                            stage: stage.clone(),
                            context: outputs.clone(),
                        };
                        tracing::debug!(task = %task_id, stage = %stage.name, "dispatching stage");
                        jobs.spawn(async move {
                            let name = job.stage.name.clone();
                            (name, run_stage(job).await)
                        });
                    }
                }
            }

            if matches!(halt, Some(Halt::Cancelled)) {
                jobs.abort_all();
                while jobs.join_next().await.is_some() {}
                break;
            }
            if jobs.is_empty() {
                break;
            }

            tokio::select! {
                joined = jobs.join_next() => {
                    match joined {
                        Some(Ok((name, result))) => {
                            in_flight.remove(&name);
                            match result {
                                StageResult::Finished(run) => {
                                    if run.outcome == StageOutcome::Succeeded {
                                        outputs.insert(name.clone(), run.outputs.clone());
                                    }
                                    let (id, record) = (task_id.to_string(), run.clone());
                                    self.on_store(move |s| s.record_stage_run(&id, record))
                                        .await?;
                                    self.events.emit(Event::StageChanged {
                                        task_id: task_id.to_string(),
                                        stage: name.clone(),
                                        state: stage_state(run.outcome),
                                        attempt: run.attempts,
                                    });
                                    runs.insert(name, run);
                                }
                                StageResult::RateLimited(retry_after) => {
                                    let resume_at = Utc::now()
                                        + chrono::Duration::from_std(retry_after)
                                            .unwrap_or_else(|_| chrono::Duration::seconds(60));
                                    tracing::warn!(
                                        task = %task_id,
                                        stage = %name,
                                        retry_after = retry_after.as_secs(),
                                        "agent rate limited"
                                    );
                                    halt = match halt {
                                        Some(Halt::RateLimit(at)) if at >= resume_at => {
                                            Some(Halt::RateLimit(at))
                                        }
                                        Some(Halt::RateLimit(_)) | Some(Halt::Capacity) | None => {
                                            Some(Halt::RateLimit(resume_at))
                                        }
                                        other => other,
                                    };
                                }
                            }
                        }
                        Some(Err(e)) => {
                            tracing::error!(task = %task_id, error = %e, "stage worker panicked");
                        }
                        None => {}
                    }
                }
                changed = cancel.changed(), if cancel_open => {
                    if changed.is_err() {
                        cancel_open = false;
                    }
                }
            }
        }

        match halt {
            Some(Halt::Cancelled) => {
                tracing::info!(task = %task_id, "stage dispatch cancelled");
                return self.current_outcome(task_id);
            }
            Some(Halt::External(status)) => return Ok(settled_outcome(status)),
            Some(Halt::Capacity) => {
                return self.pause(task_id, PauseReason::Capacity, None);
            }
            Some(Halt::RateLimit(at)) => {
                return self.pause(task_id, PauseReason::RateLimit, Some(at));
            }
            None => {}
        }

        if let Some(stage) = awaiting {
            let result = self.store.apply_transition(
                task_id,
                Status::InProgress,
                Status::WaitingApproval,
                TransitionMeta::reason("approval required").with_stage(stage.clone()),
            );
            return match result {
                Ok(_) => {
                    tracing::info!(task = %task_id, stage = %stage, "waiting for approval");
                    Ok(RunOutcome::AwaitingApproval(stage))
                }
                Err(e) if is_race(&e) => self.current_outcome(task_id),
                Err(e) => Err(e),
            };
        }

        self.finish(task_id, graph, &runs)
    }

    /// Record skips for stages that can no longer run and return the ones
    /// ready to dispatch, in topological order
    fn settle<'g>(
        &self,
        task_id: &str,
        graph: &'g WorkflowGraph,
        runs: &mut HashMap<String, StageRun>,
        outputs: &StageOutputs,
        in_flight: &HashSet<String>,
    ) -> Result<Vec<&'g Stage>, StoreError> {
        let mut ready = Vec::new();
        for stage in graph.stages() {
            if runs.contains_key(&stage.name) || in_flight.contains(&stage.name) {
                continue;
            }
            let mut waiting = false;
            let mut poisoned = false;
            for dep in &stage.depends_on {
                match runs.get(dep) {
                    None => waiting = true,
                    Some(run)
                        if run.outcome.is_failure()
                            || run.skip_cause == Some(SkipCause::UpstreamFailed) =>
                    {
                        poisoned = true
                    }
                    Some(_) => {}
                }
            }

            let cause = if poisoned {
                SkipCause::UpstreamFailed
            } else if waiting {
                continue;
            } else if let Some(ref condition) = stage.condition
                && !condition.evaluate(outputs)
            {
                SkipCause::ConditionFalse
            } else {
                ready.push(stage);
                continue;
            };

            let run = StageRun::skipped(&stage.name, &stage.agent, cause, Utc::now());
            self.store.record_stage_run(task_id, run.clone())?;
            tracing::debug!(task = %task_id, stage = %stage.name, ?cause, "stage skipped");
            self.events.emit(Event::StageChanged {
                task_id: task_id.to_string(),
                stage: stage.name.clone(),
                state: StageState::Skipped,
                attempt: 0,
            });
            runs.insert(stage.name.clone(), run);
        }
        Ok(ready)
    }

    fn finish(
        &self,
        task_id: &str,
        graph: &WorkflowGraph,
        runs: &HashMap<String, StageRun>,
    ) -> Result<RunOutcome, StoreError> {
        let failure = graph
            .stages()
            .iter()
            .filter_map(|s| runs.get(&s.name))
            .filter(|run| run.outcome.is_failure())
            .max_by_key(|run| run.ended_at)
            .map(|run| FailureInfo {
                stage: Some(run.stage.clone()),
                reason: run
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("stage {}", run.outcome)),
                attempts: run.attempts,
            })
            .or_else(|| {
                graph
                    .stages()
                    .iter()
                    .find(|s| !runs.contains_key(&s.name))
                    .map(|s| FailureInfo {
                        stage: Some(s.name.clone()),
                        reason: "stage did not finish".to_string(),
                        attempts: 0,
                    })
            });

        let (to, meta) = match failure {
            None => (Status::Completed, TransitionMeta::reason("all stages finished")),
            Some(ref info) => (Status::Failed, TransitionMeta::failed(info.clone())),
        };
        match self
            .store
            .apply_transition(task_id, Status::InProgress, to, meta)
        {
            Ok(_) => {}
            Err(e) if is_race(&e) => return self.current_outcome(task_id),
            Err(e) => return Err(e),
        }

        match failure {
            None => {
                tracing::info!(task = %task_id, "task completed");
                self.events.emit(Event::TaskCompleted {
                    task_id: task_id.to_string(),
                });
                Ok(RunOutcome::Completed)
            }
            Some(info) => {
                tracing::warn!(
                    task = %task_id,
                    stage = info.stage.as_deref().unwrap_or("-"),
                    attempts = info.attempts,
                    reason = %info.reason,
                    "task failed"
                );
                self.events.emit(Event::TaskFailed {
                    task_id: task_id.to_string(),
                    stage: info.stage.clone(),
                    reason: info.reason.clone(),
                    attempts: info.attempts,
                });
                Ok(RunOutcome::Failed(info))
            }
        }
    }

    fn pause(
        &self,
        task_id: &str,
        reason: PauseReason,
        resume_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<RunOutcome, StoreError> {
        match self
            .admission
            .pause(task_id, Status::InProgress, reason, resume_at)
        {
            Ok(_) => Ok(RunOutcome::Paused(reason)),
            Err(e) if is_race(&e) => self.current_outcome(task_id),
            Err(e) => Err(e),
        }
    }

    async fn on_store<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn TaskStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        off_runtime(move || work(store.as_ref())).await
    }

    fn current_outcome(&self, task_id: &str) -> Result<RunOutcome, StoreError> {
        let task = self.store.get_or_err(task_id)?;
        Ok(settled_outcome(task.status))
    }
}

fn settled_outcome(status: Status) -> RunOutcome {
    match status {
        Status::Cancelled => RunOutcome::Cancelled,
        other => RunOutcome::Interrupted(other),
    }
}

fn is_race(e: &StoreError) -> bool {
    matches!(
        e,
        StoreError::Transition(TransitionError::StateMismatch { .. })
            | StoreError::Transition(TransitionError::Terminal { .. })
    )
}

fn needs_approval(task: &Task, stage: &Stage) -> bool {
    let gated = match task.autonomy {
        AutonomyLevel::Manual => true,
        AutonomyLevel::Supervised => stage.approval,
        AutonomyLevel::Autonomous => false,
    };
    gated && !task.is_approved(&stage.name)
}

fn stage_state(outcome: StageOutcome) -> StageState {
    match outcome {
        StageOutcome::Succeeded => StageState::Succeeded,
        StageOutcome::Failed => StageState::Failed,
        StageOutcome::TimedOut => StageState::TimedOut,
        StageOutcome::Skipped => StageState::Skipped,
    }
}

/// Run every attempt of one stage
async fn run_stage(job: StageJob) -> StageResult {
    let stage = &job.stage;
    let started_at = Utc::now();
    let mut usage = Usage::default();
    let mut last = (StageOutcome::Failed, String::new());

    for attempt in 1..=stage.max_attempts() {
        job.events.emit(Event::StageChanged {
            task_id: job.task_id.clone(),
            stage: stage.name.clone(),
            state: StageState::Running,
            attempt,
        });
        let request = StageRequest {
            task_id: job.task_id.clone(),
            description: job.description.clone(),
            stage: stage.name.clone(),
            agent: stage.agent.clone(),
            input: stage.input.clone(),
            context: job.context.clone(),
            attempt,
        };

        match tokio::time::timeout(stage.timeout, job.executor.execute_stage(request)).await {
            Ok(Ok(report)) => {
                account(&job, &report.usage).await;
                usage.add(&report.usage);
                return StageResult::Finished(StageRun {
                    stage: stage.name.clone(),
                    agent: stage.agent.clone(),
                    attempts: attempt,
                    started_at: Some(started_at),
                    ended_at: Some(Utc::now()),
                    outputs: report.outputs,
                    outcome: StageOutcome::Succeeded,
                    skip_cause: None,
                    error: None,
                    usage,
                });
            }
            Ok(Err(AgentError::RateLimited { retry_after })) => {
                return StageResult::RateLimited(retry_after);
            }
            Ok(Err(e)) => {
                let spent = e.usage();
                account(&job, &spent).await;
                usage.add(&spent);
                last = (StageOutcome::Failed, e.to_string());
            }
            Err(_) => {
                last = (
                    StageOutcome::TimedOut,
                    format!("timed out after {}s", stage.timeout.as_secs()),
                );
            }
        }

        if attempt < stage.max_attempts() {
            tracing::warn!(
                task = %job.task_id,
                stage = %stage.name,
                attempt,
                error = %last.1,
                "stage attempt failed; retrying"
            );
        }
    }

    StageResult::Finished(StageRun {
        stage: stage.name.clone(),
        agent: stage.agent.clone(),
        attempts: stage.max_attempts(),
        started_at: Some(started_at),
        ended_at: Some(Utc::now()),
        outputs: Default::default(),
        outcome: last.0,
        skip_cause: None,
        error: Some(last.1),
        usage,
    })
}

async fn account(job: &StageJob, usage: &Usage) {
    if usage.is_zero() {
        return;
    }
    let admission = Arc::clone(&job.admission);
    let store = Arc::clone(&job.store);
    let id = job.task_id.clone();
    let usage = *usage;
    let result = off_runtime(move || {
        admission.record_usage(&id, &usage);
        store.add_usage(&id, &usage)
    })
    .await;
    if let Err(e) = result {
        tracing::warn!(task = %job.task_id, error = %e, "failed to record task usage");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{ScriptedExecutor, Step, engine_fixture, linear_graph, running_task};

    #[tokio::test]
    async fn test_linear_workflow_completes_and_passes_context() {
        let executor = ScriptedExecutor::new()
            .with_outputs("a", serde_json::json!({"plan": "do it"}))
            .with_steps("b", vec![Step::Succeed]);
        let fixture = engine_fixture(executor, vec![running_task("t1")]);
        let graph = linear_graph(&["a", "b"]);

        let outcome = fixture.advance("t1", &graph).await;
        assert_eq!(outcome, RunOutcome::Completed);

        let requests = fixture.executor.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].stage, "b");
        assert_eq!(requests[1].context["a"]["plan"], "do it");

        let task = fixture.store.get("t1").unwrap().unwrap();
        assert_eq!(task.status, Status::Completed);
        assert_eq!(task.stage_runs.len(), 2);
    }

    #[tokio::test]
    async fn test_succeeded_stages_are_not_rerun() {
        let executor = ScriptedExecutor::new();
        let mut task = running_task("t1");
        let mut done = StageRun::skipped("a", "agent-a", SkipCause::ConditionFalse, Utc::now());
        done.outcome = StageOutcome::Succeeded;
        done.skip_cause = None;
        task.stage_runs.push(done);
        let fixture = engine_fixture(executor, vec![task]);

        let outcome = fixture.advance("t1", &linear_graph(&["a", "b"])).await;
        assert_eq!(outcome, RunOutcome::Completed);
        let stages: Vec<String> = fixture
            .executor
            .requests()
            .into_iter()
            .map(|r| r.stage)
            .collect();
        assert_eq!(stages, vec!["b"]);
    }

    #[tokio::test]
    async fn test_not_in_progress_is_left_alone() {
        let mut task = running_task("t1");
        task.status = Status::Queued;
        let fixture = engine_fixture(ScriptedExecutor::new(), vec![task]);
        let outcome = fixture.advance("t1", &linear_graph(&["a"])).await;
        assert_eq!(outcome, RunOutcome::Interrupted(Status::Queued));
        assert!(fixture.executor.requests().is_empty());
    }
}
