//! Request-layer facade
//!
//! Validates requests, writes the VM record and enqueues the lifecycle task.
//! Nothing here waits for remote work; callers poll the VM status.

use crate::db::Database;
use crate::models::{
    generate_vm_id, validate_description, validate_name, NewVm, Task, TaskKind, TaskParams, Vm,
    VmStatus,
};
use crate::scheduler::TaskQueue;
use crate::{Error, Result};

const ID_ATTEMPTS: usize = 3;
pub const MAX_PAGE_SIZE: usize = 100;

/// Placement options of a create request
#[derive(Debug, Clone, Default)]
pub struct Placement {
    pub host: Option<String>,
    pub pool: Option<String>,
}

/// Entry point for VM requests
#[derive(Clone)]
pub struct VmService {
    db: Database,
    queue: TaskQueue,
}

impl VmService {
    pub fn new(db: Database, queue: TaskQueue) -> Self {
        Self { db, queue }
    }

    /// Record a new VM in `pending` and enqueue its create task
    pub fn create_vm(&self, request: NewVm, placement: Placement) -> Result<(Vm, Task)> {
        request.validate()?;

        let vm = self.insert_with_fresh_id(&request)?;
        let mut params = TaskParams::new()
            .with_host(placement.host)
            .with_kernel_path(request.kernel_path.clone());
        if let Some(pool) = placement.pool {
            params = params.with_pool(pool);
        }

        match self.queue.enqueue(TaskKind::Create, vm.id, params) {
            Ok(task) => {
                tracing::info!(vm_id = %vm.vm_id, owner = %vm.owner, "VM accepted");
                Ok((vm, task))
            }
            Err(e) => {
                // Without a task the record would sit in pending forever
                if let Err(cleanup) = self.db.delete_vm(vm.id) {
                    tracing::warn!(vm_id = %vm.vm_id, error = %cleanup, "Could not drop unqueued VM");
                }
                Err(e)
            }
        }
    }

    /// Fetch one of `owner`'s VMs by public id
    pub fn get_vm(&self, vm_id: &str, owner: &str) -> Result<Vm> {
        match self.db.get_vm_by_public_id(vm_id)? {
            Some(vm) if vm.owner == owner => Ok(vm),
            _ => Err(Error::VmNotFound(vm_id.to_string())),
        }
    }

    /// A page of `owner`'s VMs, newest first, and their total count
    pub fn list_vms(&self, owner: &str, offset: usize, limit: usize) -> Result<(Vec<Vm>, usize)> {
        self.db
            .list_vms_by_owner(owner, offset, limit.clamp(1, MAX_PAGE_SIZE))
    }

    /// Change name and/or description
    pub fn update_vm(
        &self,
        vm_id: &str,
        owner: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Vm> {
        if let Some(name) = name {
            validate_name(name)?;
        }
        if let Some(desc) = description {
            validate_description(desc)?;
        }
        let vm = self.get_vm(vm_id, owner)?;
        self.db.update_vm_details(vm.id, name, description)
    }

    pub fn delete_vm(&self, vm_id: &str, owner: &str) -> Result<Task> {
        self.request(vm_id, owner, TaskKind::Delete, &VmStatus::DELETABLE, VmStatus::Deleting)
    }

    pub fn start_vm(&self, vm_id: &str, owner: &str) -> Result<Task> {
        self.request(vm_id, owner, TaskKind::Start, &[VmStatus::Stopped], VmStatus::Starting)
    }

    pub fn stop_vm(&self, vm_id: &str, owner: &str) -> Result<Task> {
        self.request(vm_id, owner, TaskKind::Stop, &[VmStatus::Running], VmStatus::Stopping)
    }

    pub fn restart_vm(&self, vm_id: &str, owner: &str) -> Result<Task> {
        self.request(vm_id, owner, TaskKind::Restart, &[VmStatus::Running], VmStatus::Restarting)
    }

    /// Enqueue `kind` if the VM's status allows it right now. The handler
    /// checks again when it runs.
    fn request(
        &self,
        vm_id: &str,
        owner: &str,
        kind: TaskKind,
        allowed: &[VmStatus],
        next: VmStatus,
    ) -> Result<Task> {
        let vm = self.get_vm(vm_id, owner)?;
        if !allowed.contains(&vm.status) {
            return Err(Error::InvalidTransition {
                vm_id: vm.vm_id,
                current: vm.status,
                next,
            });
        }
        let params = TaskParams::new().with_host(vm.host.clone());
        self.queue.enqueue(kind, vm.id, params)
    }

    fn insert_with_fresh_id(&self, request: &NewVm) -> Result<Vm> {
        let mut last_err = None;
        for _ in 0..ID_ATTEMPTS {
            let vm_id = generate_vm_id();
            match self.db.insert_vm(&vm_id, request) {
                Ok(vm) => return Ok(vm),
                Err(Error::Database(rusqlite::Error::SqliteFailure(e, msg)))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    tracing::debug!(vm_id = %vm_id, "Public id collision, regenerating");
                    last_err = Some(Error::Database(rusqlite::Error::SqliteFailure(e, msg)));
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Validation("could not generate a VM id".into())))
    }
}
