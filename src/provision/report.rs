//! Step-by-step results of a provisioning run

use super::{ProvisionAction, ProvisionError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of a single tool step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Ok,
    Changed,
    Failed,
    Skipped,
    Unreachable,
}

/// One step as emitted by the tool, one JSON object per stdout line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    /// Values the step learned about the VM, e.g. `kernel_path`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub facts: BTreeMap<String, String>,
}

impl StepResult {
    pub fn new(name: impl Into<String>, status: StepStatus) -> Self {
        Self {
            name: name.into(),
            status,
            timestamp: Utc::now(),
            host: None,
            msg: None,
            facts: BTreeMap::new(),
        }
    }

    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = Some(msg.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_fact(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.facts.insert(key.into(), value.into());
        self
    }
}

/// Per-status step counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCounts {
    pub ok: usize,
    pub changed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub unreachable: usize,
}

impl std::fmt::Display for StepCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ok={} changed={} failed={} skipped={} unreachable={}",
            self.ok, self.changed, self.failed, self.skipped, self.unreachable
        )
    }
}

/// Everything a provisioning run produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub action: ProvisionAction,
    pub steps: Vec<StepResult>,
    /// Exit code of the tool, `None` if it died from a signal
    pub exit_code: Option<i32>,
    /// Stdout lines that were not step records
    pub output: Vec<String>,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionReport {
    /// An empty, successful report; used by stubs and as a parse seed
    pub fn new(action: ProvisionAction) -> Self {
        let now = Utc::now();
        Self {
            action,
            steps: Vec::new(),
            exit_code: Some(0),
            output: Vec::new(),
            stderr: String::new(),
            started_at: now,
            finished_at: now,
        }
    }

    pub fn with_step(mut self, step: StepResult) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    /// Build a report from the tool's captured output
    pub fn parse(
        action: ProvisionAction,
        stdout: &str,
        stderr: &str,
        exit_code: Option<i32>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let mut steps = Vec::new();
        let mut output = Vec::new();

        for line in stdout.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('{') {
                if let Ok(step) = serde_json::from_str::<StepResult>(trimmed) {
                    steps.push(step);
                    continue;
                }
            }
            output.push(line.to_string());
        }

        Self {
            action,
            steps,
            exit_code,
            output,
            stderr: stderr.to_string(),
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn counts(&self) -> StepCounts {
        let mut counts = StepCounts::default();
        for step in &self.steps {
            match step.status {
                StepStatus::Ok => counts.ok += 1,
                StepStatus::Changed => counts.changed += 1,
                StepStatus::Failed => counts.failed += 1,
                StepStatus::Skipped => counts.skipped += 1,
                StepStatus::Unreachable => counts.unreachable += 1,
            }
        }
        counts
    }

    /// First step that failed or could not reach its host
    pub fn first_failure(&self) -> Option<&StepResult> {
        self.steps
            .iter()
            .find(|s| matches!(s.status, StepStatus::Failed | StepStatus::Unreachable))
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && self.first_failure().is_none()
    }

    /// Last value reported for a fact, e.g. `rootfs_path`
    pub fn fact(&self, key: &str) -> Option<&str> {
        self.steps
            .iter()
            .rev()
            .find_map(|s| s.facts.get(key))
            .map(String::as_str)
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// One-line description of why the run failed
    pub fn failure_message(&self) -> String {
        let playbook = self.action.playbook();
        match self.first_failure() {
            Some(step) => {
                let detail = step.msg.as_deref().unwrap_or("no error details");
                format!(
                    "{} failed at step '{}': {} ({})",
                    playbook,
                    step.name,
                    detail,
                    self.counts()
                )
            }
            None => {
                let code = self
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                let last_err = self
                    .stderr
                    .lines()
                    .rev()
                    .find(|l| !l.trim().is_empty())
                    .unwrap_or("no error output");
                format!("{} exited with code {}: {}", playbook, code, last_err.trim())
            }
        }
    }

    /// Classify the run: unreachable hosts first, then failures
    pub fn into_result(self) -> Result<ExecutionReport, ProvisionError> {
        if self.succeeded() {
            return Ok(self);
        }
        if let Some(step) = self.steps.iter().find(|s| s.status == StepStatus::Unreachable) {
            let host = step.host.clone().unwrap_or_else(|| "unknown host".to_string());
            let detail = step.msg.clone().unwrap_or_default();
            return Err(ProvisionError::Unreachable(
                format!("{} {}", host, detail).trim().to_string(),
            ));
        }
        Err(ProvisionError::Rejected(self.failure_message()))
    }
}
