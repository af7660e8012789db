//! Queued lifecycle task model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Which lifecycle transition a task performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Create,
    Delete,
    Start,
    Stop,
    Restart,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Create => "create",
            TaskKind::Delete => "delete",
            TaskKind::Start => "start",
            TaskKind::Stop => "stop",
            TaskKind::Restart => "restart",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "create" => Ok(TaskKind::Create),
            "delete" => Ok(TaskKind::Delete),
            "start" => Ok(TaskKind::Start),
            "stop" => Ok(TaskKind::Stop),
            "restart" => Ok(TaskKind::Restart),
            other => Err(crate::Error::Parse(format!("unknown task kind '{}'", other))),
        }
    }
}

/// Status of a queued task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Waiting for a worker (possibly after a retry backoff)
    Pending,
    /// Claimed by a worker
    Running,
    /// Finished; the VM settled, or the task did not apply to its status
    Completed,
    /// The VM was moved to error, or the handler was aborted
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Running => "Running",
            TaskStatus::Completed => "Completed",
            TaskStatus::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "Pending" => Ok(TaskStatus::Pending),
            "Running" => Ok(TaskStatus::Running),
            "Completed" => Ok(TaskStatus::Completed),
            "Failed" => Ok(TaskStatus::Failed),
            other => Err(crate::Error::Parse(format!("unknown task status '{}'", other))),
        }
    }
}

/// Per-task parameters captured at enqueue time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskParams {
    /// Target hypervisor host (inventory limit)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Pool to draw the address from; the configured default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_path: Option<String>,
}

impl TaskParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: Option<String>) -> Self {
        self.host = host;
        self
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }

    pub fn with_kernel_path(mut self, path: Option<String>) -> Self {
        self.kernel_path = path;
        self
    }
}

/// A unit of background work: one lifecycle transition for one VM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: String,
    pub kind: TaskKind,
    /// Internal key of the target VM
    pub vm_id: i64,
    pub params: TaskParams,
    pub status: TaskStatus,
    /// Attempts started so far
    pub attempts: u32,
    pub max_attempts: u32,
    /// Not eligible for claiming before this time
    pub not_before: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Task {
    pub fn new(kind: TaskKind, vm_id: i64, params: TaskParams, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: format!("task-{}", uuid::Uuid::new_v4()),
            kind,
            vm_id,
            params,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            not_before: now,
            created_at: now,
            started_at: None,
            completed_at: None,
            last_error: None,
        }
    }

    pub fn is_final_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_new() {
        let task = Task::new(TaskKind::Create, 7, TaskParams::new(), 3);
        assert!(task.id.starts_with("task-"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert!(!task.is_final_attempt());
    }

    #[test]
    fn test_task_max_attempts_at_least_one() {
        let mut task = Task::new(TaskKind::Stop, 1, TaskParams::new(), 0);
        assert_eq!(task.max_attempts, 1);
        task.attempts = 1;
        assert!(task.is_final_attempt());
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("restart".parse::<TaskKind>().unwrap(), TaskKind::Restart);
        assert!("reboot".parse::<TaskKind>().is_err());
    }

    #[test]
    fn test_params_json_omits_empty() {
        let params = TaskParams::new().with_host(Some("fc-host-1".into()));
        let json = serde_json::to_string(&params).unwrap();
        assert_eq!(json, r#"{"host":"fc-host-1"}"#);
        let back: TaskParams = serde_json::from_str("{}").unwrap();
        assert_eq!(back, TaskParams::default());
    }
}
