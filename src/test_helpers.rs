use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::capacity::{AdmissionController, CapacityModel, Clock};
use crate::config::CapacityConfig;
use crate::service::events::EventBus;
use crate::service::executor::{AgentError, AgentExecutor, StageReport, StageRequest};
use crate::store::MemoryTaskStore;
use crate::task::{PauseInfo, PauseReason, Status, Task, Usage};
use crate::workflow::{RunOutcome, StageDef, WorkflowDef, WorkflowEngine, WorkflowGraph};

/// Create a task in the given status with all other fields defaulted.
pub fn task_with_status(id: &str, status: Status) -> Task {
    let mut task = Task::new(id, &format!("Task {}", id), "default");
    task.status = status;
    task
}

pub fn queued_task(id: &str) -> Task {
    task_with_status(id, Status::Queued)
}

pub fn running_task(id: &str) -> Task {
    task_with_status(id, Status::InProgress)
}

pub fn paused_task(id: &str, reason: PauseReason, from: Status) -> Task {
    let mut task = task_with_status(id, Status::Paused);
    task.pause = Some(PauseInfo::new(reason, from, Utc::now()));
    task
}

/// Local time on a fixed test day
pub fn local_at(hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 3, 14)
        .and_then(|d| d.and_hms_opt(hour, minute, 0))
        .unwrap()
}

/// A clock that reads whatever the returned handle was last set to
pub fn settable_clock(start: NaiveDateTime) -> (Clock, Arc<Mutex<NaiveDateTime>>) {
    let now = Arc::new(Mutex::new(start));
    let handle = Arc::clone(&now);
    let clock: Clock = Arc::new(move || *handle.lock().unwrap());
    (clock, now)
}

/// Capacity config with the default windows and no stage reserve
pub fn exact_capacity() -> CapacityConfig {
    CapacityConfig {
        stage_reserve: 0.0,
        ..CapacityConfig::default()
    }
}

pub fn stage_def(name: &str, depends_on: &[&str]) -> StageDef {
    StageDef {
        name: name.to_string(),
        agent: format!("agent-{}", name),
        depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        condition: None,
        timeout: None,
        retries: 0,
        approval: false,
        input: None,
    }
}

pub fn graph_of(name: &str, stages: Vec<StageDef>) -> WorkflowGraph {
    WorkflowGraph::from_def(
        WorkflowDef {
            name: name.to_string(),
            description: None,
            stages,
        },
        Duration::from_secs(60),
    )
    .unwrap()
}

/// `a -> b -> c ...`
pub fn linear_graph(names: &[&str]) -> WorkflowGraph {
    let stages = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            if i == 0 {
                stage_def(name, &[])
            } else {
                stage_def(name, &[names[i - 1]])
            }
        })
        .collect();
    graph_of("linear", stages)
}

/// `a -> {b, c} -> d`
pub fn diamond_graph() -> WorkflowGraph {
    graph_of(
        "diamond",
        vec![
            stage_def("a", &[]),
            stage_def("b", &["a"]),
            stage_def("c", &["a"]),
            stage_def("d", &["b", "c"]),
        ],
    )
}

/// What the scripted executor does for one attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Succeed,
    /// Succeed after spending `cost`
    Cost(f64),
    Fail(String),
    /// Succeed after sleeping
    Delay(Duration),
    /// Never return
    Hang,
    RateLimit(Duration),
}

/// Executor that plays back per-stage scripts; stages without a script,
/// or whose script ran out, succeed immediately
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    outputs: HashMap<String, BTreeMap<String, Value>>,
    requests: Mutex<Vec<StageRequest>>,
    timeline: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_steps(self, stage: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(stage.to_string(), steps.into());
        self
    }

    /// Outputs reported whenever `stage` succeeds; `outputs` must be an object
    pub fn with_outputs(mut self, stage: &str, outputs: Value) -> Self {
        let map = outputs
            .as_object()
            .map(|o| o.clone().into_iter().collect())
            .unwrap_or_default();
        self.outputs.insert(stage.to_string(), map);
        self
    }

    pub fn requests(&self) -> Vec<StageRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn attempts(&self, stage: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.stage == stage)
            .count()
    }

    /// `start:<stage>` and `end:<stage>` in the order they happened
    pub fn timeline(&self) -> Vec<String> {
        self.timeline.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.timeline().iter().position(|e| e == entry)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn next_step(&self, stage: &str) -> Step {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(stage)
            .and_then(|steps| steps.pop_front())
            .unwrap_or(Step::Succeed)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn execute_stage(&self, request: StageRequest) -> Result<StageReport, AgentError> {
        let stage = request.stage.clone();
        self.requests.lock().unwrap().push(request);
        self.timeline.lock().unwrap().push(format!("start:{}", stage));
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        let outputs = self.outputs.get(&stage).cloned().unwrap_or_default();
        let result = match self.next_step(&stage) {
            Step::Succeed => Ok(StageReport {
                outputs,
                usage: Usage::default(),
            }),
            Step::Cost(cost) => Ok(StageReport {
                outputs,
                usage: Usage {
                    input_tokens: 100,
                    output_tokens: 50,
                    cost,
                },
            }),
            Step::Fail(message) => Err(AgentError::failed(message)),
            Step::Delay(duration) => {
                tokio::time::sleep(duration).await;
                Ok(StageReport {
                    outputs,
                    usage: Usage::default(),
                })
            }
            Step::Hang => {
                std::future::pending::<()>().await;
                Err(AgentError::failed("unreachable"))
            }
            Step::RateLimit(retry_after) => Err(AgentError::RateLimited { retry_after }),
        };
        self.timeline.lock().unwrap().push(format!("end:{}", stage));
        result
    }
}

/// Engine wired to in-memory collaborators
pub struct EngineFixture {
    pub store: Arc<MemoryTaskStore>,
    pub executor: Arc<ScriptedExecutor>,
    pub admission: Arc<AdmissionController>,
    pub events: EventBus,
    pub engine: WorkflowEngine,
    pub now: Arc<Mutex<NaiveDateTime>>,
}

impl EngineFixture {
    pub async fn advance(&self, task_id: &str, graph: &WorkflowGraph) -> RunOutcome {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.engine.advance(task_id, graph, cancel_rx).await.unwrap()
    }

    pub fn set_time(&self, at: NaiveDateTime) {
        *self.now.lock().unwrap() = at;
    }

    pub fn task(&self, id: &str) -> Task {
        use crate::store::TaskStore;
        self.store.get(id).unwrap().unwrap()
    }
}

/// Fixture at 22:00 (night mode) with no stage reserve
pub fn engine_fixture(executor: ScriptedExecutor, tasks: Vec<Task>) -> EngineFixture {
    engine_fixture_with(executor, tasks, exact_capacity(), local_at(22, 0), 4)
}

pub fn engine_fixture_with(
    executor: ScriptedExecutor,
    tasks: Vec<Task>,
    capacity: CapacityConfig,
    start: NaiveDateTime,
    max_concurrent: usize,
) -> EngineFixture {
    let store = Arc::new(MemoryTaskStore::with_tasks(tasks));
    let executor = Arc::new(executor);
    let events = EventBus::new();
    let (clock, now) = settable_clock(start);
    let admission = Arc::new(
        AdmissionController::new(
            Arc::new(CapacityModel::new(&capacity)),
            store.clone(),
            events.clone(),
            max_concurrent,
        )
        .with_clock(clock),
    );
    let engine = WorkflowEngine::new(
        executor.clone(),
        store.clone(),
        admission.clone(),
        events.clone(),
    );
    EngineFixture {
        store,
        executor,
        admission,
        events,
        engine,
        now,
    }
}
