//! Shared task list with change notification.
//!
//! Every mutation goes through [`TaskStore::modify`], which bumps a revision
//! counter on a `watch` channel so the scheduler can react to queue changes.

use crate::task::{Task, TaskStatus};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use tokio::sync::watch;

/// Task list shared between the scheduler and its callers.
pub struct TaskStore {
    tasks: RwLock<Vec<Task>>,
    revision: watch::Sender<u64>,
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            tasks: RwLock::new(Vec::new()),
            revision,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Task>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` against the task list under the write lock and notifies
    /// subscribers afterwards.
    pub fn modify<R>(&self, f: impl FnOnce(&mut Vec<Task>) -> R) -> R {
        let result = {
            let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut tasks)
        };
        self.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
        result
    }

    /// Appends a task in submission order and returns its id.
    pub fn add_task(&self, task: Task) -> String {
        let id = task.id.clone();
        self.modify(|tasks| tasks.push(task));
        id
    }

    /// Applies `f` to the task with `id`. Returns false when no such task exists.
    pub fn update_task(&self, id: &str, f: impl FnOnce(&mut Task)) -> bool {
        self.modify(|tasks| match tasks.iter_mut().find(|t| t.id == id) {
            Some(task) => {
                f(task);
                true
            }
            None => false,
        })
    }

    pub fn remove_task(&self, id: &str) -> Option<Task> {
        self.modify(|tasks| {
            let pos = tasks.iter().position(|t| t.id == id)?;
            Some(tasks.remove(pos))
        })
    }

    /// Snapshot of all tasks in submission order.
    pub fn list_tasks(&self) -> Vec<Task> {
        self.read().clone()
    }

    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.read().iter().find(|t| t.id == id).cloned()
    }

    /// Drops completed tasks and returns how many were removed. Failed and
    /// cancelled tasks stay listed.
    pub fn clear_completed(&self) -> usize {
        self.modify(|tasks| {
            let before = tasks.len();
            tasks.retain(|t| t.status != TaskStatus::Completed);
            before - tasks.len()
        })
    }

    /// Receiver whose value changes after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}
