//! Remote provisioning client
//!
//! Lifecycle actions are carried out by an external automation tool that
//! talks SSH to the hypervisor host and drives the microVM jail there. This
//! module defines the contract with that tool ([`Provisioner`]), the report it
//! produces ([`ExecutionReport`]) and the production runner
//! ([`AnsibleProvisioner`]).

mod report;
mod runner;

pub use report::{ExecutionReport, StepCounts, StepResult, StepStatus};
pub use runner::AnsibleProvisioner;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Remote action, one playbook each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionAction {
    Create,
    Delete,
    Start,
    Stop,
}

impl ProvisionAction {
    pub const ALL: [ProvisionAction; 4] = [
        ProvisionAction::Create,
        ProvisionAction::Delete,
        ProvisionAction::Start,
        ProvisionAction::Stop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionAction::Create => "create",
            ProvisionAction::Delete => "delete",
            ProvisionAction::Start => "start",
            ProvisionAction::Stop => "stop",
        }
    }

    /// Playbook file in the deploy directory
    pub fn playbook(&self) -> String {
        format!("{}-vm.yml", self.as_str())
    }
}

impl std::fmt::Display for ProvisionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Variables handed to the tool for one VM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub vm_id: String,
    pub vcpu_count: u32,
    pub memory_mb: u32,
    /// Null until an address is allocated
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel_path: Option<String>,
}

impl ProvisionRequest {
    pub fn new(vm_id: impl Into<String>, vcpu_count: u32, memory_mb: u32) -> Self {
        Self {
            vm_id: vm_id.into(),
            vcpu_count,
            memory_mb,
            ip_address: None,
            host: None,
            kernel_path: None,
        }
    }

    pub fn ip_address(mut self, ip: Option<String>) -> Self {
        self.ip_address = ip;
        self
    }

    pub fn host(mut self, host: Option<String>) -> Self {
        self.host = host;
        self
    }

    pub fn kernel_path(mut self, path: Option<String>) -> Self {
        self.kernel_path = path;
        self
    }

    /// The `--extra-vars` payload
    pub fn extra_vars(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Failure of a provisioning run
#[derive(Error, Debug, Clone)]
pub enum ProvisionError {
    /// The tool did not finish within its ceiling and was killed
    #[error("Provisioning timed out after {0:?}")]
    Timeout(Duration),

    /// The remote host could not be reached
    #[error("Host unreachable: {0}")]
    Unreachable(String),

    /// The tool ran and reported a failure
    #[error("Provisioning failed: {0}")]
    Rejected(String),

    /// The tool could not be launched or its environment is broken
    #[error("Provisioner setup error: {0}")]
    Setup(String),
}

impl ProvisionError {
    /// Timeouts and unreachable hosts may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, ProvisionError::Timeout(_) | ProvisionError::Unreachable(_))
    }
}

/// Something that can carry out a lifecycle action on a remote host.
///
/// Implementations block the calling thread and must return within
/// `timeout`; the orchestrator runs them on the blocking pool. A `Delete` for
/// a VM that is already gone must succeed.
#[cfg_attr(test, mockall::automock)]
pub trait Provisioner: Send + Sync {
    fn run(
        &self,
        action: ProvisionAction,
        request: &ProvisionRequest,
        timeout: Duration,
    ) -> Result<ExecutionReport, ProvisionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playbook_names() {
        assert_eq!(ProvisionAction::Create.playbook(), "create-vm.yml");
        assert_eq!(ProvisionAction::Delete.playbook(), "delete-vm.yml");
        assert_eq!(ProvisionAction::Start.playbook(), "start-vm.yml");
        assert_eq!(ProvisionAction::Stop.playbook(), "stop-vm.yml");
    }

    #[test]
    fn test_extra_vars_contract() {
        let req = ProvisionRequest::new("srv-1a2b3c4d", 2, 1024)
            .ip_address(Some("172.16.0.2".into()))
            .host(Some("fc-host-1".into()));
        let vars = req.extra_vars();
        assert_eq!(vars["vm_id"], "srv-1a2b3c4d");
        assert_eq!(vars["vcpu_count"], 2);
        assert_eq!(vars["memory_mb"], 1024);
        assert_eq!(vars["ip_address"], "172.16.0.2");
        assert_eq!(vars["host"], "fc-host-1");
        assert!(vars.get("kernel_path").is_none());
    }

    #[test]
    fn test_extra_vars_without_address() {
        let vars = ProvisionRequest::new("srv-1a2b3c4d", 1, 512).extra_vars();
        assert!(vars["ip_address"].is_null());
        assert!(vars.get("host").is_none());
    }

    #[test]
    fn test_error_transience() {
        assert!(ProvisionError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(ProvisionError::Unreachable("h".into()).is_transient());
        assert!(!ProvisionError::Rejected("x".into()).is_transient());
        assert!(!ProvisionError::Setup("x".into()).is_transient());
    }
}
