//! Task store
//!
//! Tasks are persisted one JSON object per line in `tasks.jsonl`. Every
//! mutation takes an advisory `flock` on `tasks.lock`, re-reads the file,
//! applies the change and writes it back through a temp file + rename, so
//! the daemon and CLI commands can mutate the same store concurrently.

use chrono::Utc;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

use crate::state::{self, TransitionError, TransitionMeta};
use crate::task::{StageRun, Status, Task, Usage};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error on line {line}: {source}")]
    Json {
        line: usize,
        source: serde_json::Error,
    },
    #[error("Lock error: {0}")]
    Lock(String),
    #[error("Task '{0}' not found")]
    NotFound(String),
    #[error("Task '{0}' already exists")]
    DuplicateId(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Storage collaborator for tasks.
///
/// Implementors provide whole-task reads and a single atomic `update`
/// primitive; the lifecycle operations are built on top of it so every
/// store applies the state machine the same way.
pub trait TaskStore: Send + Sync {
    fn list(&self) -> Result<Vec<Task>, StoreError>;

    fn get(&self, id: &str) -> Result<Option<Task>, StoreError>;

    fn insert(&self, task: Task) -> Result<(), StoreError>;

    /// Atomically read-modify-write one task. If `f` fails nothing is written.
    fn update(
        &self,
        id: &str,
        f: &mut dyn FnMut(&mut Task) -> Result<(), StoreError>,
    ) -> Result<Task, StoreError>;

    fn get_or_err(&self, id: &str) -> Result<Task, StoreError> {
        self.get(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Tasks the scheduler may want to run: queued, planning or in-progress
    /// ones, plus paused ones eligible for auto-resume.
    fn list_queued_or_resumable(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|t| {
                matches!(
                    t.status,
                    Status::Queued | Status::Planning | Status::InProgress
                ) || t.auto_resumable()
            })
            .collect())
    }

    /// Apply a state machine transition; fails if `from` is not the task's
    /// current status.
    fn apply_transition(
        &self,
        id: &str,
        from: Status,
        to: Status,
        meta: TransitionMeta,
    ) -> Result<Task, StoreError> {
        self.update(id, &mut |task| {
            state::apply_transition(task, from, to, meta.clone(), Utc::now())?;
            Ok(())
        })
    }

    fn record_stage_run(&self, id: &str, run: StageRun) -> Result<(), StoreError> {
        self.update(id, &mut |task| {
            task.stage_runs.push(run.clone());
            task.updated_at = Utc::now();
            Ok(())
        })?;
        Ok(())
    }

    fn add_usage(&self, id: &str, usage: &Usage) -> Result<(), StoreError> {
        self.update(id, &mut |task| {
            task.usage.add(usage);
            Ok(())
        })?;
        Ok(())
    }

    fn set_current_stage(&self, id: &str, stage: Option<&str>) -> Result<(), StoreError> {
        self.update(id, &mut |task| {
            task.current_stage = stage.map(str::to_string);
            Ok(())
        })?;
        Ok(())
    }

    /// Cheap read the daemon health check uses to confirm the store answers
    fn ping(&self) -> Result<(), StoreError> {
        self.list().map(|_| ())
    }
}

/// Run store work on tokio's blocking pool. `FileTaskStore` waits on a
/// `flock` that a CLI command may be holding, which must not stall a
/// runtime worker.
pub async fn off_runtime<T, F>(work: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StoreError::Lock(format!("store worker failed: {}", e)))?
}

/// Pick an id derived from `base` that no existing task uses
pub fn unique_id(existing: &[Task], base: &str) -> String {
    if !existing.iter().any(|t| t.id == base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}-{}", base, n))
        .find(|candidate| !existing.iter().any(|t| &t.id == candidate))
        .unwrap_or_else(|| base.to_string())
}

/// RAII guard for file locks - automatically releases lock on drop
struct FileLock {
    #[cfg(unix)]
    file: File,
}

impl FileLock {
    #[cfg(unix)]
    fn acquire(lock_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if ret != 0 {
            return Err(StoreError::Lock(format!(
                "Failed to acquire lock on {:?}: {}",
                lock_path,
                std::io::Error::last_os_error()
            )));
        }

        Ok(FileLock { file })
    }

    #[cfg(not(unix))]
    fn acquire(_lock_path: &Path) -> Result<Self, StoreError> {
        Ok(FileLock {})
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// JSONL-backed task store living in the project directory
#[derive(Debug, Clone)]
pub struct FileTaskStore {
    path: PathBuf,
}

impl FileTaskStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: tasks_path(dir),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path
            .parent()
            .map(|p| p.join("tasks.lock"))
            .unwrap_or_else(|| PathBuf::from("tasks.lock"))
    }

    fn read_unlocked(&self) -> Result<Vec<Task>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut tasks = Vec::new();
        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let task: Task = serde_json::from_str(trimmed).map_err(|e| StoreError::Json {
                line: line_num + 1,
                source: e,
            })?;
            tasks.push(task);
        }
        Ok(tasks)
    }

    fn write_unlocked(&self, tasks: &[Task]) -> Result<(), StoreError> {
        let parent = self.path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent)?;
        let tmp_path = parent.join(format!(".tasks.tmp.{}", std::process::id()));

        let result = (|| -> Result<(), StoreError> {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            for task in tasks {
                let json = serde_json::to_string(task)
                    .map_err(|e| StoreError::Json { line: 0, source: e })?;
                writeln!(file, "{}", json)?;
            }
            file.flush()?;
            file.sync_all()?;
            Ok(())
        })();

        if result.is_ok() {
            std::fs::rename(&tmp_path, &self.path)?;
        } else {
            let _ = std::fs::remove_file(&tmp_path);
        }
        result
    }

    fn with_lock<R>(
        &self,
        f: impl FnOnce(&mut Vec<Task>) -> Result<(R, bool), StoreError>,
    ) -> Result<R, StoreError> {
        let _lock = FileLock::acquire(&self.lock_path())?;
        let mut tasks = self.read_unlocked()?;
        let (result, dirty) = f(&mut tasks)?;
        if dirty {
            self.write_unlocked(&tasks)?;
        }
        Ok(result)
    }
}

/// Path of the task file inside a project directory
pub fn tasks_path(dir: &Path) -> PathBuf {
    dir.join("tasks.jsonl")
}

impl TaskStore for FileTaskStore {
    fn list(&self) -> Result<Vec<Task>, StoreError> {
        self.with_lock(|tasks| Ok((tasks.clone(), false)))
    }

    fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        self.with_lock(|tasks| Ok((tasks.iter().find(|t| t.id == id).cloned(), false)))
    }

    fn insert(&self, task: Task) -> Result<(), StoreError> {
        self.with_lock(|tasks| {
            if tasks.iter().any(|t| t.id == task.id) {
                return Err(StoreError::DuplicateId(task.id.clone()));
            }
            tasks.push(task);
            Ok(((), true))
        })
    }

    fn update(
        &self,
        id: &str,
        f: &mut dyn FnMut(&mut Task) -> Result<(), StoreError>,
    ) -> Result<Task, StoreError> {
        self.with_lock(|tasks| {
            let task = tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            let mut updated = task.clone();
            f(&mut updated)?;
            *task = updated.clone();
            Ok((updated, true))
        })
    }
}

/// In-process store, used for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<BTreeMap<String, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        let store = Self::new();
        if let Ok(mut map) = store.tasks.lock() {
            for task in tasks {
                map.insert(task.id.clone(), task);
            }
        }
        store
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Task>>, StoreError> {
        self.tasks
            .lock()
            .map_err(|e| StoreError::Lock(format!("task map poisoned: {}", e)))
    }
}

impl TaskStore for MemoryTaskStore {
    fn list(&self) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self.guard()?.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.guard()?.get(id).cloned())
    }

    fn insert(&self, task: Task) -> Result<(), StoreError> {
        let mut map = self.guard()?;
        if map.contains_key(&task.id) {
            return Err(StoreError::DuplicateId(task.id));
        }
        map.insert(task.id.clone(), task);
        Ok(())
    }

    fn update(
        &self,
        id: &str,
        f: &mut dyn FnMut(&mut Task) -> Result<(), StoreError>,
    ) -> Result<Task, StoreError> {
        let mut map = self.guard()?;
        let task = map
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut updated = task.clone();
        f(&mut updated)?;
        *task = updated.clone();
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{PauseInfo, PauseReason};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn queued(id: &str) -> Task {
        let mut task = Task::new(id, "Test", "default");
        task.status = Status::Queued;
        task
    }

    #[test]
    fn test_file_store_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileTaskStore::new(temp_dir.path());
        assert!(store.list().unwrap().is_empty());

        store.insert(queued("t1")).unwrap();
        store.insert(queued("t2")).unwrap();

        let reopened = FileTaskStore::new(temp_dir.path());
        let tasks = reopened.list().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, "t1");
        assert_eq!(reopened.get("t2").unwrap().unwrap().status, Status::Queued);
    }

    #[test]
    fn test_insert_duplicate_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileTaskStore::new(temp_dir.path());
        store.insert(queued("t1")).unwrap();
        assert!(matches!(
            store.insert(queued("t1")),
            Err(StoreError::DuplicateId(_))
        ));
    }

    #[test]
    fn test_apply_transition_checks_from() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileTaskStore::new(temp_dir.path());
        store.insert(queued("t1")).unwrap();

        let err = store
            .apply_transition("t1", Status::InProgress, Status::Completed, TransitionMeta::default())
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Transition(TransitionError::StateMismatch { .. })
        ));
        // Nothing written on failure
        assert_eq!(store.get("t1").unwrap().unwrap().status, Status::Queued);

        let task = store
            .apply_transition("t1", Status::Queued, Status::Planning, TransitionMeta::default())
            .unwrap();
        assert_eq!(task.status, Status::Planning);
    }

    #[test]
    fn test_corrupt_line_reports_line_number() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileTaskStore::new(temp_dir.path());
        store.insert(queued("t1")).unwrap();
        let mut content = std::fs::read_to_string(store.path()).unwrap();
        content.push_str("{not json}\n");
        std::fs::write(store.path(), content).unwrap();

        match store.list() {
            Err(StoreError::Json { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected JSON error, got {:?}", other),
        }
    }

    #[test]
    fn test_list_queued_or_resumable() {
        let now = Utc::now();
        let mut user_paused = queued("user");
        user_paused.status = Status::Paused;
        user_paused.pause = Some(PauseInfo::new(PauseReason::UserRequest, Status::Queued, now));
        let mut cap_paused = queued("cap");
        cap_paused.status = Status::Paused;
        cap_paused.pause = Some(PauseInfo::new(PauseReason::Capacity, Status::Queued, now));
        let mut done = queued("done");
        done.status = Status::Completed;

        let store = MemoryTaskStore::with_tasks(vec![queued("q"), user_paused, cap_paused, done]);
        let mut ids: Vec<String> = store
            .list_queued_or_resumable()
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["cap", "q"]);
    }

    #[test]
    fn test_concurrent_usage_updates_are_not_lost() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(FileTaskStore::new(temp_dir.path()));
        store.insert(queued("t1")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        store
                            .add_usage(
                                "t1",
                                &Usage {
                                    input_tokens: 1,
                                    output_tokens: 1,
                                    cost: 0.5,
                                },
                            )
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let task = store.get("t1").unwrap().unwrap();
        assert_eq!(task.usage.input_tokens, 40);
        assert!((task.usage.cost - 20.0).abs() < 1e-9);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_off_runtime_waits_for_lock_without_blocking_runtime() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(FileTaskStore::new(temp_dir.path()));
        store.insert(queued("t1")).unwrap();

        // Held the way a CLI command holds it mid-update
        let held = FileLock::acquire(&store.lock_path()).unwrap();
        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(off_runtime(move || store.set_current_stage("t1", Some("plan"))))
        };

        // The single runtime thread is still free to run timers
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!writer.is_finished());

        drop(held);
        writer.await.unwrap().unwrap();
        let task = store.get("t1").unwrap().unwrap();
        assert_eq!(task.current_stage.as_deref(), Some("plan"));
    }

    #[test]
    fn test_unique_id() {
        let tasks = vec![queued("fix-bug"), queued("fix-bug-2")];
        assert_eq!(unique_id(&tasks, "fix-bug"), "fix-bug-3");
        assert_eq!(unique_id(&tasks, "other"), "other");
    }
}
