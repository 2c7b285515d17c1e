//! Task storage.
//!
//! `TaskStore` is the single owner of task records. Every mutation runs
//! under the store's write lock (an in-process `RwLock` for
//! `MemoryTaskStore`, an OS file lock for `JsonTaskStore`), so a status
//! change is a compare-and-swap: two workers racing to claim one task see
//! exactly one success and one `InvalidTransition`, even from separate
//! processes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::core::dag::{self, ValidationReport};
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::util::{with_suffix, write_atomic, FileLock};
use crate::{hlog_debug, hlog_error};

/// Current on-disk table version.
pub const TABLE_VERSION: u32 = 1;

/// Mutation applied to one record under the store lock.
pub type Mutation<'m> = &'m mut dyn FnMut(&mut Task) -> Result<()>;

/// Storage abstraction for task records.
///
/// Implementations only provide the primitives; the lifecycle rules live
/// in the provided methods and in [`Task::transition`].
pub trait TaskStore: Send + Sync {
    /// Insert a new record.
    ///
    /// # Errors
    /// `DuplicateId` if the id is taken, `SelfDependency` if the task
    /// lists itself.
    fn create(&self, task: Task) -> Result<()>;

    /// Insert a new record only if the task set stays acyclic with it.
    /// The check and the insert happen under one lock, so two writers can
    /// never each add half of a cycle.
    ///
    /// # Errors
    /// As [`TaskStore::create`], plus `CycleDetected`.
    fn create_checked(&self, task: Task) -> Result<ValidationReport>;

    /// Fetch a copy of one record.
    fn get(&self, id: &TaskId) -> Result<Task>;

    /// Apply `f` to the record atomically. If `f` fails nothing changes.
    fn modify(&self, id: &TaskId, f: Mutation<'_>) -> Result<Task>;

    /// Copy of every record, ascending by id.
    fn snapshot(&self) -> Result<Vec<Task>>;

    /// Move a task to `next`, enforcing the allowed transitions.
    fn update_status(&self, id: &TaskId, next: TaskStatus) -> Result<Task> {
        self.modify(id, &mut |task| task.transition(next))
    }

    /// Move a task from `expected` to `next`, failing with
    /// `InvalidTransition` if another writer got there first.
    fn compare_and_set(&self, id: &TaskId, expected: TaskStatus, next: TaskStatus) -> Result<Task> {
        self.modify(id, &mut |task| {
            if task.status != expected {
                return Err(Error::InvalidTransition {
                    id: task.id.clone(),
                    from: task.status,
                    to: next,
                });
            }
            task.transition(next)
        })
    }

    /// Pending tasks routed to `role` under `prefix` whose dependencies
    /// are all completed, ascending by id.
    fn list_by_role_prefix(&self, prefix: &str, role: &str) -> Result<Vec<Task>> {
        let tasks = self.snapshot()?;
        let status: BTreeMap<&TaskId, TaskStatus> =
            tasks.iter().map(|t| (&t.id, t.status)).collect();

        Ok(tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && t.routes_to(prefix, role))
            .filter(|t| {
                t.depends_on
                    .iter()
                    .all(|dep| status.get(dep) == Some(&TaskStatus::Completed))
            })
            .cloned()
            .collect())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.snapshot()?.len())
    }
}

fn insert_new(table: &mut BTreeMap<TaskId, Task>, task: Task) -> Result<()> {
    task.check_self_dependency()?;
    if table.contains_key(&task.id) {
        return Err(Error::DuplicateId { id: task.id });
    }
    hlog_debug!("task created: {} subject={}", task.id, task.subject);
    table.insert(task.id.clone(), task);
    Ok(())
}

fn insert_checked(table: &mut BTreeMap<TaskId, Task>, task: Task) -> Result<ValidationReport> {
    task.check_self_dependency()?;
    if table.contains_key(&task.id) {
        return Err(Error::DuplicateId { id: task.id });
    }
    let mut tasks: Vec<Task> = table.values().cloned().collect();
    tasks.push(task.clone());
    let report = dag::validate(&tasks)?;
    insert_new(table, task)?;
    Ok(report)
}

fn modify_in(table: &mut BTreeMap<TaskId, Task>, id: &TaskId, f: Mutation<'_>) -> Result<Task> {
    let task = table
        .get_mut(id)
        .ok_or_else(|| Error::NotFound { id: id.clone() })?;
    let mut draft = task.clone();
    f(&mut draft)?;
    if draft.status != task.status {
        hlog_debug!("task {}: {} -> {}", id, task.status, draft.status);
    }
    *task = draft.clone();
    Ok(draft)
}

fn poisoned<T>(_: T) -> Error {
    Error::StorageUnavailable("task table lock poisoned".into())
}

/// In-process task table.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<BTreeMap<TaskId, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<TaskId, Task>>> {
        self.tasks.read().map_err(poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<TaskId, Task>>> {
        self.tasks.write().map_err(poisoned)
    }
}

impl TaskStore for MemoryTaskStore {
    fn create(&self, task: Task) -> Result<()> {
        insert_new(&mut *self.write()?, task)
    }

    fn create_checked(&self, task: Task) -> Result<ValidationReport> {
        insert_checked(&mut *self.write()?, task)
    }

    fn get(&self, id: &TaskId) -> Result<Task> {
        self.read()?
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound { id: id.clone() })
    }

    fn modify(&self, id: &TaskId, f: Mutation<'_>) -> Result<Task> {
        modify_in(&mut *self.write()?, id, f)
    }

    fn snapshot(&self) -> Result<Vec<Task>> {
        Ok(self.read()?.values().cloned().collect())
    }
}

#[derive(Serialize, Deserialize)]
struct TaskTable {
    version: u32,
    tasks: BTreeMap<TaskId, Task>,
}

/// Task table kept in a JSON file shared by every process that opens it.
///
/// Nothing is cached between calls. Each mutation takes an exclusive lock
/// on `<path>.lock`, reloads the table, applies the change and writes it
/// back through a temp file and rename; reads take a shared lock. A claim
/// made by one `hive` process is therefore seen by the next one, and a
/// failed write leaves the previous table in place.
pub struct JsonTaskStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl JsonTaskStore {
    /// Open the table at `path`, starting empty if the file is absent.
    /// An existing file is loaded once to reject a corrupt table early.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let store = Self {
            lock_path: with_suffix(&path, "lock"),
            path,
        };
        let tasks = store.read_table()?;
        hlog_debug!(
            "JsonTaskStore::open path={} tasks={}",
            store.path.display(),
            tasks.len()
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self, exclusive: bool) -> Result<FileLock> {
        let lock = if exclusive {
            FileLock::exclusive(&self.lock_path)
        } else {
            FileLock::shared(&self.lock_path)
        };
        lock.map_err(|e| {
            hlog_error!("task table lock failed: {}: {}", self.lock_path.display(), e);
            Error::storage(e)
        })
    }

    fn read_table(&self) -> Result<BTreeMap<TaskId, Task>> {
        let _lock = self.lock(false)?;
        self.load()
    }

    /// Run `f` against a freshly loaded table and persist the result.
    /// Nothing is written when `f` fails.
    fn with_table<T>(&self, f: impl FnOnce(&mut BTreeMap<TaskId, Task>) -> Result<T>) -> Result<T> {
        let _lock = self.lock(true)?;
        let mut tasks = self.load()?;
        let out = f(&mut tasks)?;
        self.persist(&tasks)?;
        Ok(out)
    }

    fn load(&self) -> Result<BTreeMap<TaskId, Task>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = fs::read_to_string(&self.path).map_err(Error::storage)?;
        let table: TaskTable = serde_json::from_str(&contents)?;
        if table.version > TABLE_VERSION {
            return Err(Error::Validation(format!(
                "task table version {} is newer than supported {}",
                table.version, TABLE_VERSION
            )));
        }
        for (id, task) in &table.tasks {
            if id != &task.id {
                return Err(Error::Validation(format!(
                    "task table key {} does not match record id {}",
                    id, task.id
                )));
            }
            task.check_self_dependency()?;
        }
        Ok(table.tasks)
    }

    fn persist(&self, tasks: &BTreeMap<TaskId, Task>) -> Result<()> {
        #[derive(Serialize)]
        struct TableRef<'a> {
            version: u32,
            tasks: &'a BTreeMap<TaskId, Task>,
        }
        let contents = serde_json::to_string_pretty(&TableRef {
            version: TABLE_VERSION,
            tasks,
        })?;
        write_atomic(&self.path, &contents).map_err(|e| {
            hlog_error!("task table write failed: {}: {}", self.path.display(), e);
            Error::storage(e)
        })
    }
}

impl TaskStore for JsonTaskStore {
    fn create(&self, task: Task) -> Result<()> {
        self.with_table(|tasks| insert_new(tasks, task))
    }

    fn create_checked(&self, task: Task) -> Result<ValidationReport> {
        self.with_table(|tasks| insert_checked(tasks, task))
    }

    fn get(&self, id: &TaskId) -> Result<Task> {
        self.read_table()?
            .remove(id)
            .ok_or_else(|| Error::NotFound { id: id.clone() })
    }

    fn modify(&self, id: &TaskId, f: Mutation<'_>) -> Result<Task> {
        self.with_table(|tasks| modify_in(tasks, id, f))
    }

    fn snapshot(&self) -> Result<Vec<Task>> {
        Ok(self.read_table()?.into_values().collect())
    }
}
