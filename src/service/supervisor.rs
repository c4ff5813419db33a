//! Daemon supervisor
//!
//! One polling loop per daemon. Each cycle reaps finished task runs, passes
//! cancellations recorded in the store on to the runs they concern, and asks
//! the admission controller which tasks to start. Every admitted task gets
//! its own tokio task driving the workflow engine.
//!
//! Alongside the poll the loop writes the heartbeat file the watchdog
//! watches and runs periodic self health checks. The health record is owned
//! by the supervisor and written to disk only by it.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::events::{Event, EventBus, spawn_event_logger};
use super::executor::{AgentExecutor, CommandExecutor};
use super::health::{DaemonHealthRecord, RestartEvent, sample_memory};
use super::pidfile::{
    DaemonLock, Heartbeat, PidFile, PidStatus, pid_file_path, read_pid_file,
    remove_file_if_exists, write_pid_file,
};
use crate::capacity::{AdmissionController, CapacityModel};
use crate::config::Config;
use crate::error::DaemonError;
use crate::state::TransitionMeta;
use crate::store::{FileTaskStore, StoreError, TaskStore, off_runtime};
use crate::task::{FailureInfo, Status, Task};
use crate::workflow::{DirWorkflowLoader, RunOutcome, WorkflowEngine, WorkflowLoader};

/// Store round-trips slower than this fail the health check
const SLOW_STORE: Duration = Duration::from_secs(5);

/// Options given to `daemon run` on the command line
#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    /// Overrides `daemon.poll_interval`
    pub interval: Option<u64>,
    /// Overrides `daemon.max_concurrent_tasks`
    pub max_concurrent: Option<usize>,
    /// Why this daemon was started in place of a previous one
    pub restart: Option<RestartEvent>,
}

struct ActiveRun {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<Result<RunOutcome, String>>,
}

pub struct Supervisor {
    dir: PathBuf,
    store: Arc<dyn TaskStore>,
    loader: Arc<dyn WorkflowLoader>,
    engine: Arc<WorkflowEngine>,
    admission: Arc<AdmissionController>,
    events: EventBus,
    health: DaemonHealthRecord,
    active: HashMap<String, ActiveRun>,
    poll_interval: Duration,
    health_interval: Duration,
    heartbeat_interval: Duration,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dir: &Path,
        config: &Config,
        store: Arc<dyn TaskStore>,
        loader: Arc<dyn WorkflowLoader>,
        executor: Arc<dyn AgentExecutor>,
        admission: Arc<AdmissionController>,
        events: EventBus,
        health: DaemonHealthRecord,
    ) -> Self {
        let engine = Arc::new(WorkflowEngine::new(
            executor,
            Arc::clone(&store),
            Arc::clone(&admission),
            events.clone(),
        ));
        Self {
            dir: dir.to_path_buf(),
            store,
            loader,
            engine,
            admission,
            events,
            health,
            active: HashMap::new(),
            poll_interval: Duration::from_secs(config.daemon.poll_interval.max(1)),
            health_interval: Duration::from_secs(config.daemon.health_check_interval.max(1)),
            heartbeat_interval: Duration::from_secs(config.daemon.heartbeat_interval.max(1)),
        }
    }

    pub fn health(&self) -> &DaemonHealthRecord {
        &self.health
    }

    pub fn active_ids(&self) -> HashSet<String> {
        self.active.keys().cloned().collect()
    }

    /// One poll cycle; returns the number of runs started
    pub async fn poll_once(&mut self) -> Result<usize, StoreError> {
        self.reap().await;
        self.propagate_cancellations()?;

        let admission = Arc::clone(&self.admission);
        let active = self.active_ids();
        let admitted = off_runtime(move || admission.run_cycle(&active)).await?;
        let started = admitted.len();
        for task in admitted {
            self.spawn_run(task);
        }
        if started > 0 {
            tracing::info!(started, active = self.active.len(), "poll cycle admitted tasks");
        }
        self.health.active_tasks = self.active.len();
        Ok(started)
    }

    fn spawn_run(&mut self, task: Task) {
        let (cancel, cancel_rx) = watch::channel(false);
        let id = task.id.clone();
        let store = Arc::clone(&self.store);
        let loader = Arc::clone(&self.loader);
        let engine = Arc::clone(&self.engine);
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            drive_task(store, loader, engine, events, task, cancel_rx)
                .await
                .map_err(|e| e.to_string())
        });
        self.health.tasks.started += 1;
        self.active.insert(id, ActiveRun { cancel, handle });
    }

    /// Collect finished runs and count their outcomes
    async fn reap(&mut self) {
        let finished: Vec<String> = self
            .active
            .iter()
            .filter(|(_, run)| run.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        for id in finished {
            if let Some(run) = self.active.remove(&id) {
                let result = run.handle.await;
                self.count(&id, result);
            }
        }
    }

    fn count(
        &mut self,
        id: &str,
        result: Result<Result<RunOutcome, String>, tokio::task::JoinError>,
    ) {
        match result {
            Ok(Ok(outcome)) => {
                tracing::debug!(task = %id, ?outcome, "task run finished");
                match outcome {
                    RunOutcome::Completed => self.health.tasks.completed += 1,
                    RunOutcome::Failed(_) => self.health.tasks.failed += 1,
                    RunOutcome::Paused(_) => self.health.tasks.paused += 1,
                    RunOutcome::Cancelled => self.health.tasks.cancelled += 1,
                    RunOutcome::AwaitingApproval(_) | RunOutcome::Interrupted(_) => {}
                }
            }
            Ok(Err(e)) => tracing::error!(task = %id, error = %e, "task run errored"),
            Err(e) => tracing::error!(task = %id, error = %e, "task run panicked"),
        }
    }

    fn propagate_cancellations(&mut self) -> Result<(), StoreError> {
        for (id, run) in &self.active {
            if *run.cancel.borrow() {
                continue;
            }
            if let Some(task) = self.store.get(id)?
                && task.status == Status::Cancelled
            {
                tracing::info!(task = %id, "cancelling in-flight stages");
                let _ = run.cancel.send(true);
            }
        }
        Ok(())
    }

    /// Store reachable and answering quickly
    pub fn check_health(&mut self) -> Result<(), String> {
        let started = Instant::now();
        let result = self
            .store
            .ping()
            .map_err(|e| format!("store unreachable: {}", e))
            .and_then(|()| {
                let elapsed = started.elapsed();
                if elapsed > SLOW_STORE {
                    Err(format!("store took {}ms to answer", elapsed.as_millis()))
                } else {
                    Ok(())
                }
            });
        if let Err(ref e) = result {
            tracing::warn!(error = %e, "health check failed");
        }
        self.health.record_check(result.clone(), Utc::now());
        self.health.memory = sample_memory();
        self.save_health();
        result
    }

    pub fn beat(&mut self) {
        if let Err(e) = Heartbeat::write(&self.dir) {
            tracing::warn!(error = %e, "failed to write heartbeat");
            return;
        }
        self.health.last_heartbeat = Some(Utc::now());
    }

    fn save_health(&self) {
        if let Err(e) = self.health.save(&self.dir) {
            tracing::warn!(error = %e, "failed to save health record");
        }
    }

    /// Wait for every active run to end
    pub async fn wait_idle(&mut self) {
        let runs: Vec<(String, ActiveRun)> = self.active.drain().collect();
        for (id, run) in runs {
            let result = run.handle.await;
            self.count(&id, result);
        }
        self.health.active_tasks = 0;
    }

    /// Signal every run to stop dispatching and wait for them
    pub async fn shutdown(&mut self) {
        if !self.active.is_empty() {
            tracing::info!(active = self.active.len(), "stopping in-flight task runs");
        }
        for run in self.active.values() {
            let _ = run.cancel.send(true);
        }
        self.wait_idle().await;
        self.save_health();
    }

    /// Poll until `shutdown` flips to true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut poll = tokio::time::interval(self.poll_interval);
        let mut health = tokio::time::interval(self.health_interval);
        let mut beat = tokio::time::interval(self.heartbeat_interval);
        for timer in [&mut poll, &mut health, &mut beat] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        tracing::info!(
            poll_secs = self.poll_interval.as_secs(),
            max_concurrent = self.admission.max_concurrent(),
            "daemon loop started"
        );
        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::error!(error = %e, "poll cycle failed");
                    }
                }
                _ = health.tick() => {
                    let _ = self.check_health();
                }
                _ = beat.tick() => self.beat(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.shutdown().await;
        tracing::info!("daemon loop stopped");
    }
}

/// Take one admitted task from wherever it is to the end of this run
async fn drive_task(
    store: Arc<dyn TaskStore>,
    loader: Arc<dyn WorkflowLoader>,
    engine: Arc<WorkflowEngine>,
    events: EventBus,
    task: Task,
    cancel: watch::Receiver<bool>,
) -> Result<RunOutcome, StoreError> {
    let id = task.id.clone();
    let mut status = task.status;
    if status == Status::Queued {
        store.apply_transition(
            &id,
            Status::Queued,
            Status::Planning,
            TransitionMeta::reason("admitted"),
        )?;
        status = Status::Planning;
    }

    let graph = match loader.load(&task.workflow) {
        Ok(graph) => graph,
        Err(e) => {
            tracing::error!(task = %id, workflow = %task.workflow, error = %e, "workflow rejected");
            let failure = FailureInfo {
                stage: None,
                reason: e.to_string(),
                attempts: 0,
            };
            store.apply_transition(
                &id,
                status,
                Status::Failed,
                TransitionMeta::failed(failure.clone()),
            )?;
            events.emit(Event::TaskFailed {
                task_id: id.clone(),
                stage: None,
                reason: failure.reason.clone(),
                attempts: 0,
            });
            return Ok(RunOutcome::Failed(failure));
        }
    };

    if status == Status::Planning {
        store.apply_transition(
            &id,
            Status::Planning,
            Status::InProgress,
            TransitionMeta::reason(format!("running workflow {}", graph.name())),
        )?;
    }
    engine.advance(&id, &graph, cancel).await
}

/// Entry point of `daemon run`: hold the lock, run the loop until SIGTERM
/// or SIGINT, clean up.
pub fn run_daemon(dir: &Path, options: DaemonOptions) -> Result<()> {
    let mut config = Config::load(dir)?;
    if let Some(interval) = options.interval {
        config.daemon.poll_interval = interval;
    }
    if let Some(max) = options.max_concurrent {
        config.daemon.max_concurrent_tasks = max;
    }
    config.validate().context("invalid configuration")?;

    let lock = DaemonLock::acquire(dir)?;
    let pid_path = pid_file_path(dir);
    match read_pid_file(&pid_path) {
        PidStatus::Running(existing) if existing.pid != std::process::id() => {
            return Err(DaemonError::AlreadyRunning { pid: existing.pid }.into());
        }
        PidStatus::Corrupted(detail) => {
            return Err(DaemonError::PidFileCorrupted {
                path: pid_path,
                detail,
            }
            .into());
        }
        PidStatus::Stale(stale) => {
            tracing::info!(pid = stale.pid, "replacing stale PID file");
        }
        PidStatus::Running(_) | PidStatus::Missing => {}
    }
    let pid_file = PidFile::current();
    write_pid_file(&pid_path, &pid_file)?;

    let mut health =
        DaemonHealthRecord::begin_lifetime(DaemonHealthRecord::load(dir), pid_file.pid, pid_file.started_at);
    if let Some(event) = options.restart {
        tracing::warn!(
            reason = %event.reason,
            exit_code = ?event.exit_code,
            watchdog = event.triggered_by_watchdog,
            "daemon restarted"
        );
        health.record_restart(event);
    }
    health.save(dir)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let result = runtime.block_on(async {
        let events = EventBus::new();
        let logger = spawn_event_logger(&events);

        let store: Arc<dyn TaskStore> = Arc::new(FileTaskStore::new(dir));
        let capacity = Arc::new(CapacityModel::open(dir, &config.capacity)?);
        let admission = Arc::new(AdmissionController::new(
            capacity,
            Arc::clone(&store),
            events.clone(),
            config.daemon.max_concurrent_tasks,
        ));
        let loader: Arc<dyn WorkflowLoader> = Arc::new(DirWorkflowLoader::new(
            dir,
            Duration::from_secs(config.workflow.default_timeout),
        ));
        let executor: Arc<dyn AgentExecutor> = Arc::new(CommandExecutor::new(dir));
        let supervisor = Supervisor::new(
            dir, &config, store, loader, executor, admission, events, health,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        });

        supervisor.run(shutdown_rx).await;
        logger.abort();
        Ok::<(), anyhow::Error>(())
    });

    // The lock file stays: unlinking it while held lets a new daemon lock a
    // fresh inode next to ours
    remove_file_if_exists(&pid_path)?;
    drop(lock);
    result
}

#[cfg(unix)]
pub(crate) async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable; waiting for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
pub(crate) async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
