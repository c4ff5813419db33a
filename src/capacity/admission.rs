//! Admission controller
//!
//! Decides, once per poll cycle, which tasks may proceed: queued tasks are
//! started, auto-paused tasks are resumed, and when the capacity threshold is
//! reached everything that has not started yet is paused with reason
//! `capacity`. The engine also consults [`AdmissionController::check`]
//! before every stage dispatch.
//!
//! Resumption order is priority descending, then creation time ascending.
//! Tasks paused by a user are never picked up here.

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use super::ledger::{CapacityModel, CapacitySnapshot};
use crate::service::events::{Event, EventBus};
use crate::state::TransitionMeta;
use crate::store::{StoreError, TaskStore};
use crate::task::{PauseInfo, PauseReason, Status, Task, Usage};

/// Result of a capacity check
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted(CapacitySnapshot),
    Blocked(CapacitySnapshot),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }

    pub fn snapshot(&self) -> &CapacitySnapshot {
        match self {
            Admission::Admitted(s) | Admission::Blocked(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PauseDecision {
    pub task_id: String,
    pub from: Status,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartDecision {
    pub task_id: String,
    pub from: Status,
}

/// What one poll cycle should do, computed without touching the store
#[derive(Debug, Clone, PartialEq)]
pub struct CyclePlan {
    pub snapshot: CapacitySnapshot,
    /// Tasks to pause with reason `capacity`
    pub pause: Vec<PauseDecision>,
    /// Tasks to run, in admission order; paused ones are resumed first
    pub start: Vec<StartDecision>,
    /// Eligible tasks left for a later cycle because no slot was free
    pub deferred: Vec<String>,
}

/// Resumption order: priority descending, then oldest first
pub fn resumption_order(a: &Task, b: &Task) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Source of local wall-clock time; capacity windows are evaluated in it
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| Local::now().naive_local())
}

pub struct AdmissionController {
    capacity: Arc<CapacityModel>,
    store: Arc<dyn TaskStore>,
    events: EventBus,
    max_concurrent: usize,
    clock: Clock,
}

impl AdmissionController {
    pub fn new(
        capacity: Arc<CapacityModel>,
        store: Arc<dyn TaskStore>,
        events: EventBus,
        max_concurrent: usize,
    ) -> Self {
        Self {
            capacity,
            store,
            events,
            max_concurrent: max_concurrent.max(1),
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Current local time according to this controller's clock
    pub fn now(&self) -> NaiveDateTime {
        (self.clock)()
    }

    pub fn capacity(&self) -> &Arc<CapacityModel> {
        &self.capacity
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Capacity check at local wall-clock time `now`
    pub fn check_at(&self, now: NaiveDateTime) -> Admission {
        let snapshot = self.capacity.snapshot(now);
        if snapshot.admits() {
            Admission::Admitted(snapshot)
        } else {
            Admission::Blocked(snapshot)
        }
    }

    pub fn check(&self) -> Admission {
        self.check_at(self.now())
    }

    /// Record usage against the shared daily ledger and announce it
    pub fn record_usage(&self, task_id: &str, usage: &Usage) -> CapacitySnapshot {
        let snapshot = self.capacity.record_usage(self.now(), usage);
        self.events.emit(Event::UsageUpdated {
            task_id: task_id.to_string(),
            usage: *usage,
            daily_cost: snapshot.spent,
            usage_fraction: snapshot.usage_fraction,
        });
        snapshot
    }

    /// Decide what a poll cycle does.
    ///
    /// `active` holds ids of tasks already running in this daemon; they are
    /// neither started again nor counted as candidates.
    pub fn plan(
        &self,
        tasks: &[Task],
        active: &HashSet<String>,
        snapshot: CapacitySnapshot,
        now: DateTime<Utc>,
    ) -> CyclePlan {
        let mut candidates: Vec<&Task> = tasks
            .iter()
            .filter(|t| !active.contains(&t.id))
            .filter(|t| is_candidate(t, now))
            .collect();

        let mut plan = CyclePlan {
            snapshot,
            pause: Vec::new(),
            start: Vec::new(),
            deferred: Vec::new(),
        };

        if !plan.snapshot.admits() {
            plan.pause = candidates
                .iter()
                .filter(|t| t.status != Status::Paused)
                .map(|t| PauseDecision {
                    task_id: t.id.clone(),
                    from: t.status,
                })
                .collect();
            return plan;
        }

        candidates.sort_by(|a, b| resumption_order(a, b));
        let slots = self.max_concurrent.saturating_sub(active.len());
        for (i, task) in candidates.into_iter().enumerate() {
            if i < slots {
                plan.start.push(StartDecision {
                    task_id: task.id.clone(),
                    from: task.status,
                });
            } else {
                plan.deferred.push(task.id.clone());
            }
        }
        plan
    }

    /// Run one admission cycle against the store.
    ///
    /// Applies the pauses and resumes of [`plan`](Self::plan) and returns
    /// the tasks the caller should now run. Transitions that lose a race
    /// with another writer are logged and skipped.
    pub fn run_cycle(&self, active: &HashSet<String>) -> Result<Vec<Task>, StoreError> {
        self.run_cycle_at(active, self.now(), Utc::now())
    }

    pub fn run_cycle_at(
        &self,
        active: &HashSet<String>,
        local_now: NaiveDateTime,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, StoreError> {
        let tasks = self.store.list_queued_or_resumable()?;
        let snapshot = self.capacity.snapshot(local_now);
        let plan = self.plan(&tasks, active, snapshot, now);

        for decision in &plan.pause {
            if let Err(e) = self.pause(&decision.task_id, decision.from, PauseReason::Capacity, None)
            {
                tracing::warn!(task = %decision.task_id, error = %e, "capacity pause skipped");
            }
        }

        let mut started = Vec::new();
        for decision in &plan.start {
            let task = if decision.from == Status::Paused {
                match self.resume(&decision.task_id, None, "auto-resume") {
                    Ok(task) => task,
                    Err(e) => {
                        tracing::warn!(task = %decision.task_id, error = %e, "auto-resume skipped");
                        continue;
                    }
                }
            } else {
                match tasks.iter().find(|t| t.id == decision.task_id) {
                    Some(task) => task.clone(),
                    None => continue,
                }
            };
            started.push(task);
        }

        if !plan.deferred.is_empty() {
            tracing::debug!(deferred = plan.deferred.len(), "concurrency ceiling reached");
        }
        Ok(started)
    }

    /// Pause a task, remembering where it was paused from
    pub fn pause(
        &self,
        task_id: &str,
        from: Status,
        reason: PauseReason,
        resume_at: Option<DateTime<Utc>>,
    ) -> Result<Task, StoreError> {
        let mut pause = PauseInfo::new(reason, from, Utc::now());
        if let Some(at) = resume_at {
            pause = pause.with_resume_at(at);
        }
        let task = self
            .store
            .apply_transition(task_id, from, Status::Paused, TransitionMeta::paused(pause))?;
        tracing::info!(task = %task_id, %reason, "task paused");
        self.events.emit(Event::TaskPaused {
            task_id: task_id.to_string(),
            reason,
        });
        Ok(task)
    }

    /// Move a paused task back to where it was paused from
    pub fn resume(
        &self,
        task_id: &str,
        actor: Option<String>,
        reason: &str,
    ) -> Result<Task, StoreError> {
        let current = self.store.get_or_err(task_id)?;
        let target = current
            .pause
            .as_ref()
            .map(|p| p.resume_target())
            .unwrap_or(Status::Queued);
        let task = self.store.apply_transition(
            task_id,
            Status::Paused,
            target,
            TransitionMeta::reason(reason).with_actor(actor),
        )?;
        tracing::info!(task = %task_id, to = %target, "task resumed");
        self.events.emit(Event::TaskResumed {
            task_id: task_id.to_string(),
            to: target,
        });
        Ok(task)
    }
}

fn is_candidate(task: &Task, now: DateTime<Utc>) -> bool {
    match task.status {
        Status::Queued | Status::Planning | Status::InProgress => true,
        Status::Paused => match task.pause {
            Some(ref pause) if pause.reason.auto_resumable() => {
                pause.resume_at.map(|at| at <= now).unwrap_or(true)
            }
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CapacityConfig;
    use crate::store::MemoryTaskStore;
    use crate::task::Priority;
    use chrono::{Duration, NaiveDate};

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 14)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn task(id: &str, status: Status, priority: Priority, age_secs: i64) -> Task {
        let mut task = Task::new(id, id, "default");
        task.status = status;
        task.priority = priority;
        task.created_at = Utc::now() - Duration::seconds(age_secs);
        task
    }

    fn paused(id: &str, reason: PauseReason, priority: Priority, age_secs: i64) -> Task {
        let mut t = task(id, Status::Paused, priority, age_secs);
        t.pause = Some(PauseInfo::new(reason, Status::InProgress, Utc::now()));
        t
    }

    fn controller(store: Arc<dyn TaskStore>, max_concurrent: usize) -> AdmissionController {
        let config = CapacityConfig {
            stage_reserve: 0.0,
            ..CapacityConfig::default()
        };
        AdmissionController::new(
            Arc::new(CapacityModel::new(&config)),
            store,
            EventBus::new(),
            max_concurrent,
        )
    }

    #[test]
    fn test_urgent_resumes_before_older_normal() {
        let tasks = vec![
            paused("older-normal", PauseReason::Capacity, Priority::Normal, 600),
            paused("newer-urgent", PauseReason::Capacity, Priority::Urgent, 10),
        ];
        let ctl = controller(Arc::new(MemoryTaskStore::new()), 1);
        let plan = ctl.plan(&tasks, &HashSet::new(), ctl.capacity().snapshot(at(22)), Utc::now());
        assert_eq!(plan.start.len(), 1);
        assert_eq!(plan.start[0].task_id, "newer-urgent");
        assert_eq!(plan.deferred, vec!["older-normal".to_string()]);
    }

    #[test]
    fn test_equal_priority_oldest_first() {
        let tasks = vec![
            task("new", Status::Queued, Priority::High, 5),
            task("old", Status::Queued, Priority::High, 500),
        ];
        let ctl = controller(Arc::new(MemoryTaskStore::new()), 4);
        let plan = ctl.plan(&tasks, &HashSet::new(), ctl.capacity().snapshot(at(10)), Utc::now());
        let order: Vec<&str> = plan.start.iter().map(|s| s.task_id.as_str()).collect();
        assert_eq!(order, vec!["old", "new"]);
    }

    #[test]
    fn test_user_paused_never_auto_resumed() {
        let tasks = vec![paused("manual", PauseReason::UserRequest, Priority::Urgent, 10)];
        let ctl = controller(Arc::new(MemoryTaskStore::new()), 4);
        let plan = ctl.plan(&tasks, &HashSet::new(), ctl.capacity().snapshot(at(22)), Utc::now());
        assert!(plan.start.is_empty());
        assert!(plan.pause.is_empty());
    }

    #[test]
    fn test_rate_limited_waits_for_resume_at() {
        let mut limited = paused("limited", PauseReason::RateLimit, Priority::Normal, 10);
        let resume_at = Utc::now() + Duration::seconds(60);
        if let Some(ref mut pause) = limited.pause {
            pause.resume_at = Some(resume_at);
        }
        let tasks = vec![limited];
        let ctl = controller(Arc::new(MemoryTaskStore::new()), 4);
        let snapshot = ctl.capacity().snapshot(at(10));

        let plan = ctl.plan(&tasks, &HashSet::new(), snapshot.clone(), Utc::now());
        assert!(plan.start.is_empty());

        let later = resume_at + Duration::seconds(1);
        let plan = ctl.plan(&tasks, &HashSet::new(), snapshot, later);
        assert_eq!(plan.start.len(), 1);
    }

    #[test]
    fn test_blocked_pauses_waiting_work_only() {
        let tasks = vec![
            task("queued", Status::Queued, Priority::Normal, 10),
            paused("already", PauseReason::Capacity, Priority::Normal, 20),
            task("running", Status::InProgress, Priority::Normal, 30),
        ];
        let ctl = controller(Arc::new(MemoryTaskStore::new()), 4);
        ctl.capacity().record_usage(at(14), &Usage {
            cost: 9.0,
            ..Usage::default()
        });
        let active: HashSet<String> = ["running".to_string()].into_iter().collect();
        let plan = ctl.plan(&tasks, &active, ctl.capacity().snapshot(at(14)), Utc::now());
        assert!(plan.start.is_empty());
        assert_eq!(
            plan.pause,
            vec![PauseDecision {
                task_id: "queued".to_string(),
                from: Status::Queued
            }]
        );
    }

    #[test]
    fn test_ceiling_counts_active_tasks() {
        let tasks = vec![
            task("a", Status::Queued, Priority::Normal, 30),
            task("b", Status::Queued, Priority::Normal, 20),
            task("running", Status::InProgress, Priority::Normal, 40),
        ];
        let ctl = controller(Arc::new(MemoryTaskStore::new()), 2);
        let active: HashSet<String> = ["running".to_string()].into_iter().collect();
        let plan = ctl.plan(&tasks, &active, ctl.capacity().snapshot(at(10)), Utc::now());
        assert_eq!(plan.start.len(), 1);
        assert_eq!(plan.start[0].task_id, "a");
        assert_eq!(plan.deferred, vec!["b".to_string()]);
    }

    #[test]
    fn test_run_cycle_applies_pause_and_resume() {
        let store = Arc::new(MemoryTaskStore::with_tasks(vec![
            task("q", Status::Queued, Priority::Normal, 30),
            paused("p", PauseReason::Capacity, Priority::High, 60),
        ]));
        let ctl = controller(store.clone(), 4);

        // Blocked at 14:00 after spending 9 of 10
        ctl.capacity().record_usage(at(14), &Usage {
            cost: 9.0,
            ..Usage::default()
        });
        let started = ctl
            .run_cycle_at(&HashSet::new(), at(14), Utc::now())
            .unwrap();
        assert!(started.is_empty());
        let q = store.get("q").unwrap().unwrap();
        assert_eq!(q.status, Status::Paused);
        assert_eq!(q.pause.as_ref().unwrap().reason, PauseReason::Capacity);

        // Night mode has room: both resume, higher priority first
        let started = ctl
            .run_cycle_at(&HashSet::new(), at(23), Utc::now())
            .unwrap();
        let ids: Vec<&str> = started.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["p", "q"]);
        assert_eq!(store.get("p").unwrap().unwrap().status, Status::InProgress);
        assert_eq!(store.get("q").unwrap().unwrap().status, Status::Queued);
    }

    #[test]
    fn test_usage_updates_emit_events() {
        let ctl = controller(Arc::new(MemoryTaskStore::new()), 1);
        let mut rx = ctl.events.subscribe();
        ctl.record_usage(
            "t1",
            &Usage {
                input_tokens: 10,
                output_tokens: 5,
                cost: 0.25,
            },
        );
        match rx.try_recv().unwrap() {
            Event::UsageUpdated {
                task_id, daily_cost, ..
            } => {
                assert_eq!(task_id, "t1");
                assert!((daily_cost - 0.25).abs() < 1e-9);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
