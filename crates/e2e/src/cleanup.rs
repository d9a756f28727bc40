//! Cleanup task queue
//!
//! Every entity a scenario creates is registered as a task against its
//! context. A cleanup pass executes tasks in descending priority (children
//! before parents, ties in registration order); failed tasks are retried in
//! later passes until they run out of retries and are reported instead.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use tracing::{debug, warn};

use fieldsvc_common::EntityKind;

use crate::error::E2eResult;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupTaskType {
    Delete,
    Update,
    Restore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupTask {
    pub id: String,
    pub task_type: CleanupTaskType,
    pub entity_type: EntityKind,
    pub entity_ids: Vec<String>,
    /// Higher runs first
    pub priority: u32,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip)]
    seq: u64,
}

impl CleanupTask {
    pub fn new(task_type: CleanupTaskType, entity_type: EntityKind, entity_ids: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_type,
            entity_type,
            entity_ids,
            priority: entity_type.cleanup_priority(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            seq: 0,
        }
    }

    pub fn delete(entity_type: EntityKind, entity_ids: Vec<String>) -> Self {
        Self::new(CleanupTaskType::Delete, entity_type, entity_ids)
    }

    /// Put a mutated shared row back to its canonical values
    pub fn update(entity_type: EntityKind, entity_ids: Vec<String>) -> Self {
        Self::new(CleanupTaskType::Update, entity_type, entity_ids)
    }

    /// Bring mutated rows back from the baseline snapshot
    pub fn restore(entity_type: EntityKind, entity_ids: Vec<String>) -> Self {
        Self::new(CleanupTaskType::Restore, entity_type, entity_ids)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Executes a single cleanup task against a backing store
#[async_trait]
pub trait CleanupExecutor: Send + Sync {
    async fn execute(&self, task: &CleanupTask) -> E2eResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExhaustedTask {
    pub task: CleanupTask,
    pub error: String,
}

/// Outcome of draining a queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Task ids that completed, in execution order
    pub completed: Vec<String>,
    pub exhausted: Vec<ExhaustedTask>,
    pub passes: u32,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.exhausted.is_empty()
    }
}

/// Pending cleanup work for one context
#[derive(Debug, Clone, Default)]
pub struct CleanupQueue {
    tasks: Vec<CleanupTask>,
    next_seq: u64,
}

impl CleanupQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mut task: CleanupTask) {
        task.seq = self.next_seq;
        self.next_seq += 1;
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Pending tasks in execution order
    pub fn ordered(&self) -> Vec<CleanupTask> {
        let mut tasks = self.tasks.clone();
        sort_for_execution(&mut tasks);
        tasks
    }

    /// Remove and return every pending task in execution order
    pub fn drain(&mut self) -> Vec<CleanupTask> {
        let mut tasks = std::mem::take(&mut self.tasks);
        sort_for_execution(&mut tasks);
        tasks
    }
}

fn sort_for_execution(tasks: &mut [CleanupTask]) {
    tasks.sort_by_key(|t| (Reverse(t.priority), t.seq));
}

/// Run tasks to completion or exhaustion
pub async fn execute_tasks(mut pending: Vec<CleanupTask>, executor: &dyn CleanupExecutor) -> CleanupReport {
    let mut report = CleanupReport::default();

    while !pending.is_empty() {
        sort_for_execution(&mut pending);
        report.passes += 1;

        let mut retry = Vec::new();
        for mut task in pending {
            match executor.execute(&task).await {
                Ok(()) => {
                    debug!(task = %task.id, kind = %task.entity_type, "Cleanup task completed");
                    report.completed.push(task.id);
                }
                Err(e) => {
                    task.retry_count += 1;
                    if task.retry_count >= task.max_retries {
                        warn!(
                            task = %task.id,
                            kind = %task.entity_type,
                            "Cleanup task gave up after {} attempts: {}",
                            task.retry_count,
                            e
                        );
                        report.exhausted.push(ExhaustedTask {
                            task,
                            error: e.to_string(),
                        });
                    } else {
                        retry.push(task);
                    }
                }
            }
        }
        pending = retry;
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::E2eError;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Records execution order; fails a task id a fixed number of times
    #[derive(Default)]
    struct ScriptedExecutor {
        order: Mutex<Vec<(EntityKind, Vec<String>)>>,
        failures: Mutex<HashMap<String, u32>>,
    }

    #[async_trait]
    impl CleanupExecutor for ScriptedExecutor {
        async fn execute(&self, task: &CleanupTask) -> E2eResult<()> {
            self.order
                .lock()
                .push((task.entity_type, task.entity_ids.clone()));
            let mut failures = self.failures.lock();
            let key = task.entity_ids.join(",");
            match failures.get_mut(&key) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    Err(E2eError::Timeout {
                        what: key,
                        millis: 10,
                    })
                }
                _ => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn test_tasks_run_in_priority_order() {
        let mut queue = CleanupQueue::new();
        queue.push(CleanupTask::delete(EntityKind::Customer, vec!["c1".into()]));
        queue.push(CleanupTask::delete(EntityKind::Ticket, vec!["t1".into()]));
        queue.push(CleanupTask::delete(EntityKind::Assignment, vec!["a1".into()]));
        queue.push(CleanupTask::delete(EntityKind::Ticket, vec!["t2".into()]));

        let executor = ScriptedExecutor::default();
        let report = execute_tasks(queue.drain(), &executor).await;

        assert!(report.is_clean());
        assert_eq!(report.passes, 1);
        let order: Vec<String> = executor
            .order
            .lock()
            .iter()
            .map(|(_, ids)| ids.join(","))
            .collect();
        assert_eq!(order, vec!["a1", "t1", "t2", "c1"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_failed_task_is_retried_then_reported() {
        let executor = ScriptedExecutor::default();
        executor.failures.lock().insert("flaky".into(), 1);
        executor.failures.lock().insert("broken".into(), 100);

        let tasks = vec![
            CleanupTask::delete(EntityKind::Ticket, vec!["flaky".into()]),
            CleanupTask::delete(EntityKind::Ticket, vec!["broken".into()]).with_max_retries(2),
        ];
        let report = execute_tasks(tasks, &executor).await;

        assert_eq!(report.completed.len(), 1);
        assert_eq!(report.exhausted.len(), 1);
        assert_eq!(report.exhausted[0].task.retry_count, 2);
        assert_eq!(report.passes, 2);
    }
}
