//! Task queue and worker pool
//!
//! Tasks live in the database. Workers claim them one at a time, run the
//! matching orchestrator handler under the hard time limit and record the
//! outcome: done, requeued with backoff, or failed.

use crate::config::QueueConfig;
use crate::db::Database;
use crate::models::{Task, TaskKind, TaskParams, TaskStatus};
use crate::orchestrator::{Orchestrator, TaskContext, TaskOutcome};
use crate::Result;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Producer side of the durable queue
#[derive(Clone)]
pub struct TaskQueue {
    db: Database,
    max_attempts: u32,
}

impl TaskQueue {
    pub fn new(db: Database, max_attempts: u32) -> Self {
        Self { db, max_attempts }
    }

    /// Persist a task for `vm_id` (internal key); workers pick it up later
    pub fn enqueue(&self, kind: TaskKind, vm_id: i64, params: TaskParams) -> Result<Task> {
        let task = Task::new(kind, vm_id, params, self.max_attempts);
        self.db.insert_task(&task)?;
        tracing::info!(task = %task.id, kind = %kind, vm = vm_id, "Enqueued task");
        Ok(task)
    }
}

/// Result of running one task
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task_id: String,
    pub kind: TaskKind,
    pub vm_id: i64,
    pub attempt: u32,
    pub outcome: TaskOutcome,
    /// Queue status after the run
    pub status: TaskStatus,
    pub duration: Duration,
}

/// A task a worker is currently running
#[derive(Debug, Clone)]
pub struct ActiveTask {
    pub task_id: String,
    pub kind: TaskKind,
    pub correlation_id: String,
    pub started_at: Instant,
}

/// Runs queued tasks against the orchestrator
pub struct Scheduler {
    db: Database,
    orchestrator: Orchestrator,
    config: QueueConfig,
    active_tasks: Arc<RwLock<HashMap<String, ActiveTask>>>,
}

impl Scheduler {
    pub fn new(orchestrator: Orchestrator, config: QueueConfig) -> Self {
        Self {
            db: orchestrator.db().clone(),
            orchestrator,
            config,
            active_tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn queue(&self) -> TaskQueue {
        TaskQueue::new(self.db.clone(), self.config.max_attempts)
    }

    /// Claim and run the next due task, if any
    pub async fn run_once(&self) -> Result<Option<TaskReport>> {
        match self.db.claim_next_task(Utc::now())? {
            Some(task) => Ok(Some(self.execute(task).await)),
            None => Ok(None),
        }
    }

    /// Run a claimed task and record its outcome
    pub async fn execute(&self, task: Task) -> TaskReport {
        let start = Instant::now();
        let correlation_id = match self.db.get_vm(task.vm_id) {
            Ok(Some(vm)) => vm.vm_id,
            _ => format!("vm-{}", task.vm_id),
        };
        let ctx = TaskContext::new(&task, correlation_id.clone(), self.config.soft_time_limit);

        self.active_tasks.write().insert(
            task.id.clone(),
            ActiveTask {
                task_id: task.id.clone(),
                kind: task.kind,
                correlation_id: correlation_id.clone(),
                started_at: start,
            },
        );

        let outcome = match tokio::time::timeout(
            self.config.hard_time_limit,
            self.orchestrator.handle(&ctx, &task),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                let reason = format!(
                    "task aborted after hard time limit of {:?}",
                    self.config.hard_time_limit
                );
                tracing::error!(task = %task.id, vm_id = %correlation_id, "{}", reason);
                if let Err(e) = self.orchestrator.recover_aborted(task.kind, task.vm_id, &reason) {
                    tracing::error!(task = %task.id, vm_id = %correlation_id, error = %e, "Recovery after abort failed");
                }
                TaskOutcome::Failed(reason)
            }
        };

        let status = self.record(&task, &outcome);
        self.active_tasks.write().remove(&task.id);

        let duration = start.elapsed();
        tracing::info!(
            task = %task.id,
            vm_id = %correlation_id,
            status = %status,
            duration_ms = duration.as_millis() as u64,
            "Task finished"
        );

        TaskReport {
            task_id: task.id,
            kind: task.kind,
            vm_id: task.vm_id,
            attempt: ctx.attempt,
            outcome,
            status,
            duration,
        }
    }

    fn record(&self, task: &Task, outcome: &TaskOutcome) -> TaskStatus {
        let (status, result) = match outcome {
            TaskOutcome::Done => (TaskStatus::Completed, self.db.complete_task(&task.id, None)),
            TaskOutcome::Skipped(reason) => (
                TaskStatus::Completed,
                self.db.complete_task(&task.id, Some(reason)),
            ),
            TaskOutcome::Failed(error) => (TaskStatus::Failed, self.db.fail_task(&task.id, error)),
            TaskOutcome::Retry(error) if !task.is_final_attempt() => {
                let backoff = self.config.backoff_for(task.attempts);
                let not_before = Utc::now()
                    + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero());
                tracing::info!(task = %task.id, backoff_ms = backoff.as_millis() as u64, "Requeued task");
                (TaskStatus::Pending, self.db.retry_task(&task.id, not_before, error))
            }
            TaskOutcome::Retry(error) => (TaskStatus::Failed, self.db.fail_task(&task.id, error)),
        };
        if let Err(e) = result {
            tracing::error!(task = %task.id, error = %e, "Failed to record task outcome");
        }
        status
    }

    pub fn active_count(&self) -> usize {
        self.active_tasks.read().len()
    }

    pub fn active_tasks(&self) -> Vec<ActiveTask> {
        self.active_tasks.read().values().cloned().collect()
    }

    /// Start `concurrency` workers that run until `shutdown` turns true
    pub fn spawn_workers(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.config.concurrency)
            .map(|id| tokio::spawn(Arc::clone(self).worker(id, shutdown.clone())))
            .collect()
    }

    /// Sweep stale VMs and abandoned tasks every `janitor_interval` until
    /// `shutdown` turns true
    pub fn spawn_janitor(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).janitor(shutdown))
    }

    async fn janitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.janitor_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_ms = self.config.janitor_interval.as_millis() as u64, "Janitor started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
            match self.orchestrator.sweep_stale(self.config.hard_time_limit) {
                Ok(report) if report.vms.is_empty() && report.tasks.is_empty() => {
                    tracing::debug!("Janitor found nothing stale");
                }
                Ok(report) => tracing::warn!(
                    vms = report.vms.len(),
                    tasks = report.tasks.len(),
                    "Janitor resolved stale work"
                ),
                Err(e) => tracing::error!(error = %e, "Janitor sweep failed"),
            }
        }
        tracing::info!("Janitor stopped");
    }

    async fn worker(self: Arc<Self>, id: usize, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker = id, "Worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => tracing::error!(worker = id, error = %e, "Failed to claim task"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!(worker = id, "Worker stopped");
    }
}
