//! Dependency-aware priority scheduling
//!
//! A [`TaskQueue`] holds [`PrioritizedTask`]s and hands out the best
//! *executable* one: a task whose dependencies have all been marked
//! complete. Among executable tasks, [`rank_cmp`] decides: priority first,
//! then the earliest deadline, then the fewest dependencies.
//!
//! Failures feed back into ranking. [`TaskQueue::fail`] bumps the retry
//! count and, when re-queuing, degrades the priority with [`degrade`] so
//! repeatedly failing work stops crowding out the rest.
//!
//! Dependencies that name a task never added stay unsatisfied until that id
//! is completed explicitly; such tasks show up as `blocked` in
//! [`TaskQueue::stats`].

mod priority;
mod task;

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

pub use priority::{degrade, detect_priority, prioritize_tasks, rank_cmp, Priority};
pub use task::{PrioritizedTask, TaskDraft, TaskId};

/// What [`TaskQueue::fail`] did with a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailOutcome {
    Requeued {
        id: TaskId,
        priority: Priority,
        retry_count: u32,
    },
    Dropped {
        id: TaskId,
        retry_count: u32,
    },
}

/// Per-priority task counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PriorityCounts {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl PriorityCounts {
    pub fn get(&self, priority: Priority) -> usize {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }

    fn bump(&mut self, priority: Priority) {
        match priority {
            Priority::Critical => self.critical += 1,
            Priority::High => self.high += 1,
            Priority::Medium => self.medium += 1,
            Priority::Low => self.low += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub executable: usize,
    pub blocked: usize,
    pub completed: usize,
    pub overdue: usize,
    pub by_priority: PriorityCounts,
}

/// Queue of pending tasks plus the set of completed ids.
#[derive(Debug, Clone)]
pub struct TaskQueue<P = serde_json::Value> {
    tasks: Vec<PrioritizedTask<P>>,
    completed: HashSet<TaskId>,
}

impl<P> Default for TaskQueue<P> {
    fn default() -> Self {
        Self {
            tasks: Vec::new(),
            completed: HashSet::new(),
        }
    }
}

impl<P> TaskQueue<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task. A queued task with the same id is replaced and
    /// returned.
    pub fn add(&mut self, task: PrioritizedTask<P>) -> Option<PrioritizedTask<P>> {
        debug!(task = %task.id, priority = %task.priority, "task queued");
        match self.tasks.iter().position(|t| t.id == task.id) {
            Some(idx) => Some(std::mem::replace(&mut self.tasks[idx], task)),
            None => {
                self.tasks.push(task);
                None
            }
        }
    }

    pub fn add_all<I>(&mut self, tasks: I)
    where
        I: IntoIterator<Item = PrioritizedTask<P>>,
    {
        for task in tasks {
            self.add(task);
        }
    }

    /// Remove and return the best executable task.
    pub fn get_next(&mut self) -> Option<PrioritizedTask<P>> {
        let idx = self.best_index(|id| self.completed.contains(id))?;
        Some(self.tasks.remove(idx))
    }

    /// Like [`get_next`](Self::get_next) but against a caller-supplied
    /// completed set; the queue's own set is ignored.
    pub fn next(&mut self, completed: &HashSet<TaskId>) -> Option<PrioritizedTask<P>> {
        let idx = self.best_index(|id| completed.contains(id))?;
        Some(self.tasks.remove(idx))
    }

    /// Remove and return up to `max_count` executable tasks in serving order.
    ///
    /// Executability is judged once, before anything is removed, so a task
    /// whose dependency is taken in the same batch stays queued.
    pub fn get_all_executable(&mut self, max_count: Option<usize>) -> Vec<PrioritizedTask<P>> {
        let limit = max_count.unwrap_or(usize::MAX);
        if limit == 0 {
            return Vec::new();
        }

        let mut picked: Vec<usize> = (0..self.tasks.len())
            .filter(|&i| self.tasks[i].is_executable(|id| self.completed.contains(id)))
            .collect();
        picked.sort_by(|&a, &b| rank_cmp(&self.tasks[a], &self.tasks[b]));
        picked.truncate(limit);

        let mut chosen = vec![false; self.tasks.len()];
        for &i in &picked {
            chosen[i] = true;
        }
        let mut taken = Vec::with_capacity(picked.len());
        let mut kept = Vec::with_capacity(self.tasks.len() - picked.len());
        for (i, task) in std::mem::take(&mut self.tasks).into_iter().enumerate() {
            if chosen[i] {
                taken.push(task);
            } else {
                kept.push(task);
            }
        }
        self.tasks = kept;
        taken.sort_by(rank_cmp);
        taken
    }

    /// The task [`get_next`](Self::get_next) would return, left in place.
    pub fn peek(&self) -> Option<&PrioritizedTask<P>> {
        self.best_index(|id| self.completed.contains(id))
            .map(|idx| &self.tasks[idx])
    }

    /// Mark an id complete, unblocking its dependents. Returns `false` if it
    /// was already complete.
    pub fn complete(&mut self, id: impl Into<TaskId>) -> bool {
        let id = id.into();
        let fresh = self.completed.insert(id.clone());
        if fresh {
            debug!(task = %id, "task completed");
        }
        fresh
    }

    pub fn is_completed(&self, id: &TaskId) -> bool {
        self.completed.contains(id)
    }

    /// Record a failed attempt. The retry count is bumped either way; with
    /// `requeue` the task goes back with a possibly degraded priority.
    pub fn fail(&mut self, mut task: PrioritizedTask<P>, requeue: bool) -> FailOutcome {
        task.retry_count += 1;
        if !requeue {
            info!(task = %task.id, retries = task.retry_count, "task dropped after failure");
            return FailOutcome::Dropped {
                id: task.id,
                retry_count: task.retry_count,
            };
        }

        let previous = task.priority;
        task.priority = degrade(previous, task.retry_count);
        if task.priority != previous {
            info!(
                task = %task.id,
                from = %previous,
                to = %task.priority,
                retries = task.retry_count,
                "task priority degraded"
            );
        }
        let outcome = FailOutcome::Requeued {
            id: task.id.clone(),
            priority: task.priority,
            retry_count: task.retry_count,
        };
        self.add(task);
        outcome
    }

    /// Drop a queued task by id.
    pub fn remove(&mut self, id: &TaskId) -> Option<PrioritizedTask<P>> {
        let idx = self.tasks.iter().position(|t| t.id == *id)?;
        Some(self.tasks.remove(idx))
    }

    /// Queued tasks, not counting completed ids.
    pub fn size(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Empty both the queue and the completed set.
    pub fn clear(&mut self) {
        self.tasks.clear();
        self.completed.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &PrioritizedTask<P>> {
        self.tasks.iter()
    }

    /// Snapshot counts, with overdue tasks judged against `now`.
    pub fn stats(&self, now: DateTime<Utc>) -> QueueStats {
        let mut by_priority = PriorityCounts::default();
        let mut executable = 0;
        let mut overdue = 0;
        for task in &self.tasks {
            by_priority.bump(task.priority);
            if task.is_executable(|id| self.completed.contains(id)) {
                executable += 1;
            }
            if task.is_overdue(now) {
                overdue += 1;
            }
        }
        QueueStats {
            total: self.tasks.len(),
            executable,
            blocked: self.tasks.len() - executable,
            completed: self.completed.len(),
            overdue,
            by_priority,
        }
    }

    fn best_index<F>(&self, is_done: F) -> Option<usize>
    where
        F: Fn(&TaskId) -> bool,
    {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| task.is_executable(&is_done))
            .min_by(|(_, a), (_, b)| rank_cmp(a, b))
            .map(|(idx, _)| idx)
    }
}

impl<P> Extend<PrioritizedTask<P>> for TaskQueue<P> {
    fn extend<I: IntoIterator<Item = PrioritizedTask<P>>>(&mut self, iter: I) {
        self.add_all(iter);
    }
}

impl<P> FromIterator<PrioritizedTask<P>> for TaskQueue<P> {
    fn from_iter<I: IntoIterator<Item = PrioritizedTask<P>>>(iter: I) -> Self {
        let mut queue = Self::new();
        queue.add_all(iter);
        queue
    }
}
