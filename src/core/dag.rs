//! Task dependency graph and wave scheduling.
//!
//! `DependencyGraph` is a read-only view built from a snapshot of tasks.
//! Edges run from a dependency to the task that waits on it, so a task's
//! incoming neighbours are the tasks it depends on. Every cycle check in
//! the crate goes through [`DependencyGraph::waves`].

use crate::core::task::{Role, Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::{hlog_trace, hlog_warn};
use chrono::{DateTime, Utc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap};

/// A dependency that names a task absent from the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DanglingDependency {
    /// The task holding the reference.
    pub task: TaskId,
    /// The id it refers to.
    pub missing: TaskId,
}

impl From<DanglingDependency> for Error {
    fn from(d: DanglingDependency) -> Self {
        Error::DanglingDependency {
            id: d.task,
            missing: d.missing,
        }
    }
}

/// Wave number for every task in a snapshot.
///
/// Wave 1 holds tasks without (known) dependencies; every other task sits
/// one wave after its latest dependency.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaveAssignment {
    waves: BTreeMap<TaskId, u32>,
}

impl WaveAssignment {
    pub fn wave_of(&self, id: &TaskId) -> Option<u32> {
        self.waves.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.waves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }

    /// Highest wave number, 0 for an empty assignment.
    pub fn depth(&self) -> u32 {
        self.waves.values().copied().max().unwrap_or(0)
    }

    /// Ids in `wave`, ascending.
    pub fn tasks_in(&self, wave: u32) -> Vec<&TaskId> {
        self.waves
            .iter()
            .filter(|(_, w)| **w == wave)
            .map(|(id, _)| id)
            .collect()
    }

    /// All waves in order, each listing its ids ascending.
    pub fn layers(&self) -> Vec<Vec<&TaskId>> {
        (1..=self.depth()).map(|w| self.tasks_in(w)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TaskId, u32)> {
        self.waves.iter().map(|(id, w)| (id, *w))
    }
}

/// Outcome of a successful validation.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub waves: WaveAssignment,
    /// References to unknown tasks. These do not fail validation since the
    /// target may still be enqueued later in the session.
    pub dangling: Vec<DanglingDependency>,
}

/// Dependency graph over a task snapshot.
pub struct DependencyGraph<'a> {
    graph: DiGraph<&'a Task, ()>,
    index: HashMap<&'a TaskId, NodeIndex>,
    dangling: Vec<DanglingDependency>,
}

impl<'a> DependencyGraph<'a> {
    /// Build the graph for `tasks`.
    ///
    /// # Errors
    /// - `DuplicateId` if the snapshot holds two records with one id
    /// - `SelfDependency` if a task lists itself
    pub fn build(tasks: &'a [Task]) -> Result<Self> {
        let mut graph = DiGraph::with_capacity(tasks.len(), 0);
        let mut index = HashMap::with_capacity(tasks.len());

        for task in tasks {
            task.check_self_dependency()?;
            if index.contains_key(&task.id) {
                return Err(Error::DuplicateId {
                    id: task.id.clone(),
                });
            }
            index.insert(&task.id, graph.add_node(task));
        }

        let mut dangling = Vec::new();
        for task in tasks {
            let to = index[&task.id];
            for dep in &task.depends_on {
                match index.get(dep) {
                    Some(&from) => {
                        graph.add_edge(from, to, ());
                    }
                    None => dangling.push(DanglingDependency {
                        task: task.id.clone(),
                        missing: dep.clone(),
                    }),
                }
            }
        }
        dangling.sort();

        Ok(Self {
            graph,
            index,
            dangling,
        })
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&'a Task> {
        self.index.get(id).map(|&i| self.graph[i])
    }

    pub fn dangling(&self) -> &[DanglingDependency] {
        &self.dangling
    }

    /// Tasks `id` depends on that are present in the snapshot, ascending by id.
    pub fn get_dependencies(&self, id: &TaskId) -> Vec<&'a Task> {
        self.neighbours(id, Direction::Incoming)
    }

    /// Tasks that depend on `id`, ascending by id.
    pub fn get_dependents(&self, id: &TaskId) -> Vec<&'a Task> {
        self.neighbours(id, Direction::Outgoing)
    }

    fn neighbours(&self, id: &TaskId, dir: Direction) -> Vec<&'a Task> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        let mut out: Vec<&'a Task> = self
            .graph
            .neighbors_directed(node, dir)
            .map(|n| self.graph[n])
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Assign wave numbers by repeated peeling.
    ///
    /// Each round takes every unassigned task whose dependencies already
    /// have a wave. If a round makes no progress the remaining tasks sit
    /// on or behind a cycle and the whole batch fails.
    pub fn waves(&self) -> Result<WaveAssignment> {
        let mut remaining: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| {
                let deps = self.graph.neighbors_directed(n, Direction::Incoming).count();
                (n, deps)
            })
            .collect();

        let mut frontier: Vec<NodeIndex> = remaining
            .iter()
            .filter(|(_, deps)| **deps == 0)
            .map(|(n, _)| *n)
            .collect();

        let mut waves = BTreeMap::new();
        let mut wave = 1;
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for node in frontier {
                waves.insert(self.graph[node].id.clone(), wave);
                remaining.remove(&node);
                for dependent in self.graph.neighbors_directed(node, Direction::Outgoing) {
                    if let Some(deps) = remaining.get_mut(&dependent) {
                        *deps -= 1;
                        if *deps == 0 {
                            next.push(dependent);
                        }
                    }
                }
            }
            frontier = next;
            wave += 1;
        }

        if !remaining.is_empty() {
            let mut ids: Vec<TaskId> = remaining
                .keys()
                .map(|n| self.graph[*n].id.clone())
                .collect();
            ids.sort();
            return Err(Error::CycleDetected { ids });
        }

        hlog_trace!("waves assigned: {} tasks over {} waves", waves.len(), wave - 1);
        Ok(WaveAssignment { waves })
    }

    /// Tasks ordered by wave, then id.
    pub fn topological_order(&self) -> Result<Vec<&'a Task>> {
        let waves = self.waves()?;
        let mut tasks: Vec<&'a Task> = self.graph.node_weights().copied().collect();
        tasks.sort_by(|a, b| {
            let wa = waves.wave_of(&a.id).unwrap_or(0);
            let wb = waves.wave_of(&b.id).unwrap_or(0);
            wa.cmp(&wb).then_with(|| a.id.cmp(&b.id))
        });
        Ok(tasks)
    }

    /// Dependencies of `task` are all present and completed.
    pub fn dependencies_completed(&self, task: &Task) -> bool {
        task.depends_on.iter().all(|dep| {
            self.get_task(dep)
                .map(|t| t.status == TaskStatus::Completed)
                .unwrap_or(false)
        })
    }
}

impl std::fmt::Debug for DependencyGraph<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .field("dangling", &self.dangling.len())
            .finish()
    }
}

/// Check a task set for cycles and unknown references.
///
/// Dangling references are logged as warnings and returned in the report;
/// only cycles (and malformed records) fail.
pub fn validate(tasks: &[Task]) -> Result<ValidationReport> {
    let graph = DependencyGraph::build(tasks)?;
    let waves = graph.waves()?;
    for d in graph.dangling() {
        hlog_warn!("task {} depends on unknown task {}", d.task, d.missing);
    }
    Ok(ValidationReport {
        waves,
        dangling: graph.dangling().to_vec(),
    })
}

/// Like [`validate`] but treats the first dangling reference as an error.
pub fn validate_strict(tasks: &[Task]) -> Result<WaveAssignment> {
    let report = validate(tasks)?;
    match report.dangling.into_iter().next() {
        Some(d) => Err(d.into()),
        None => Ok(report.waves),
    }
}

/// Wave numbers for every task in `tasks`.
pub fn compute_waves(tasks: &[Task]) -> Result<WaveAssignment> {
    DependencyGraph::build(tasks)?.waves()
}

/// Tasks `role` may claim now.
///
/// Candidates are pending, routed to the role, past any retry backoff and
/// have every dependency completed. Only the lowest wave among them is
/// returned, in ascending id order.
pub fn ready<'a>(tasks: &'a [Task], role: &Role, now: DateTime<Utc>) -> Result<Vec<&'a Task>> {
    let graph = DependencyGraph::build(tasks)?;
    let waves = graph.waves()?;

    let candidates: Vec<(&'a Task, u32)> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| t.routes_to(&role.prefix, &role.name))
        .filter(|t| t.retry_due(now))
        .filter(|t| graph.dependencies_completed(t))
        .filter_map(|t| waves.wave_of(&t.id).map(|w| (t, w)))
        .collect();

    let Some(lowest) = candidates.iter().map(|(_, w)| *w).min() else {
        return Ok(Vec::new());
    };

    let mut out: Vec<&'a Task> = candidates
        .into_iter()
        .filter(|(_, w)| *w == lowest)
        .map(|(t, _)| t)
        .collect();
    out.sort_by(|a, b| a.id.cmp(&b.id));
    hlog_trace!("ready for {}: wave {} -> {} tasks", role, lowest, out.len());
    Ok(out)
}
