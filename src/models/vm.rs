//! VM model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Prefix of every public VM identifier
pub const VM_ID_PREFIX: &str = "srv-";

pub const MIN_VCPUS: u32 = 1;
pub const MAX_VCPUS: u32 = 32;
pub const MIN_MEMORY_MB: u32 = 128;
pub const MAX_MEMORY_MB: u32 = 32768;
pub const MAX_NAME_LEN: usize = 64;
pub const MAX_DESCRIPTION_LEN: usize = 500;

/// Lifecycle status of a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    /// Accepted, waiting for the create task
    Pending,
    /// Address allocation and remote creation in flight
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Starting,
    Restarting,
    /// Remote teardown in flight; the record goes away afterwards
    Deleting,
    /// Something went wrong, see `error_message`. Only delete leaves this state.
    Error,
}

impl VmStatus {
    /// Statuses that only exist while a task is working on the VM
    pub const TRANSIENT: [VmStatus; 5] = [
        VmStatus::Provisioning,
        VmStatus::Stopping,
        VmStatus::Starting,
        VmStatus::Restarting,
        VmStatus::Deleting,
    ];

    /// Statuses a delete may start from
    pub const DELETABLE: [VmStatus; 4] = [
        VmStatus::Pending,
        VmStatus::Running,
        VmStatus::Stopped,
        VmStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Pending => "pending",
            VmStatus::Provisioning => "provisioning",
            VmStatus::Running => "running",
            VmStatus::Stopping => "stopping",
            VmStatus::Stopped => "stopped",
            VmStatus::Starting => "starting",
            VmStatus::Restarting => "restarting",
            VmStatus::Deleting => "deleting",
            VmStatus::Error => "error",
        }
    }

    pub fn is_transient(&self) -> bool {
        Self::TRANSIENT.contains(self)
    }
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(VmStatus::Pending),
            "provisioning" => Ok(VmStatus::Provisioning),
            "running" => Ok(VmStatus::Running),
            "stopping" => Ok(VmStatus::Stopping),
            "stopped" => Ok(VmStatus::Stopped),
            "starting" => Ok(VmStatus::Starting),
            "restarting" => Ok(VmStatus::Restarting),
            "deleting" => Ok(VmStatus::Deleting),
            "error" => Ok(VmStatus::Error),
            other => Err(crate::Error::Parse(format!("unknown VM status '{}'", other))),
        }
    }
}

/// Generate a fresh public VM id, e.g. `srv-1a2b3c4d`
pub fn generate_vm_id() -> String {
    format!("{}{}", VM_ID_PREFIX, &uuid::Uuid::new_v4().simple().to_string()[..8])
}

/// A VM record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
    /// Internal surrogate key
    pub id: i64,
    /// Public identifier used in every external reference and remote path
    pub vm_id: String,
    pub name: String,
    pub description: Option<String>,
    pub vcpu_count: u32,
    pub memory_mb: u32,
    /// Assigned address, set once the allocator hands one out
    pub ip_address: Option<String>,
    /// Hypervisor host running this VM
    pub host: Option<String>,
    pub kernel_path: Option<String>,
    pub rootfs_path: Option<String>,
    pub status: VmStatus,
    pub error_message: Option<String>,
    /// Owning principal
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request for a new VM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewVm {
    pub name: String,
    pub description: Option<String>,
    pub vcpu_count: u32,
    pub memory_mb: u32,
    pub owner: String,
    /// Custom kernel on the host, passed through to the provisioning tool
    pub kernel_path: Option<String>,
}

impl NewVm {
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            vcpu_count: 1,
            memory_mb: 512,
            owner: owner.into(),
            kernel_path: None,
        }
    }

    pub fn vcpu_count(mut self, count: u32) -> Self {
        self.vcpu_count = count;
        self
    }

    pub fn memory_mb(mut self, mb: u32) -> Self {
        self.memory_mb = mb;
        self
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    pub fn kernel_path(mut self, path: impl Into<String>) -> Self {
        self.kernel_path = Some(path.into());
        self
    }

    pub fn validate(&self) -> crate::Result<()> {
        validate_name(&self.name)?;
        if let Some(desc) = &self.description {
            validate_description(desc)?;
        }
        if !(MIN_VCPUS..=MAX_VCPUS).contains(&self.vcpu_count) {
            return Err(crate::Error::Validation(format!(
                "vcpu_count must be between {} and {}",
                MIN_VCPUS, MAX_VCPUS
            )));
        }
        if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&self.memory_mb) {
            return Err(crate::Error::Validation(format!(
                "memory_mb must be between {} and {}",
                MIN_MEMORY_MB, MAX_MEMORY_MB
            )));
        }
        if self.owner.is_empty() {
            return Err(crate::Error::Validation("owner cannot be empty".into()));
        }
        Ok(())
    }
}

/// Name must be 1-64 chars, alphanumerics and hyphens, alphanumeric at both ends
pub fn validate_name(name: &str) -> crate::Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(crate::Error::Validation(format!(
            "name must be 1-{} characters",
            MAX_NAME_LEN
        )));
    }
    let bytes = name.as_bytes();
    let ends_ok = bytes[0].is_ascii_alphanumeric() && bytes[bytes.len() - 1].is_ascii_alphanumeric();
    let chars_ok = bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-');
    if !ends_ok || !chars_ok {
        return Err(crate::Error::Validation(
            "name must start/end with alphanumeric, can contain hyphens in between".into(),
        ));
    }
    Ok(())
}

pub fn validate_description(desc: &str) -> crate::Result<()> {
    if desc.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(crate::Error::Validation(format!(
            "description must be at most {} characters",
            MAX_DESCRIPTION_LEN
        )));
    }
    Ok(())
}

/// Field writes that ride along with a status transition.
///
/// `None` leaves a column untouched, `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VmPatch {
    pub ip_address: Option<Option<String>>,
    pub host: Option<Option<String>>,
    pub kernel_path: Option<Option<String>>,
    pub rootfs_path: Option<Option<String>>,
    pub error_message: Option<Option<String>>,
}

impl VmPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ip_address(mut self, ip: Option<String>) -> Self {
        self.ip_address = Some(ip);
        self
    }

    pub fn host(mut self, host: Option<String>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn kernel_path(mut self, path: Option<String>) -> Self {
        self.kernel_path = Some(path);
        self
    }

    pub fn rootfs_path(mut self, path: Option<String>) -> Self {
        self.rootfs_path = Some(path);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(Some(message.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error_message = Some(None);
        self
    }
}
