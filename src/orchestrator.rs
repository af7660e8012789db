//! VM lifecycle orchestrator
//!
//! One handler per lifecycle transition. Each handler moves the VM into its
//! transient status, does the remote work and settles the VM in a stable
//! status. Failures are compensated (addresses released) and recorded on the
//! VM, so a task never leaves an address or a transient status behind.

use crate::config::PROVISION_GRACE;
use crate::db::Database;
use crate::models::{Task, TaskKind, Vm, VmPatch, VmStatus};
use crate::pool::AddressAllocator;
use crate::provision::{ExecutionReport, ProvisionAction, ProvisionRequest, Provisioner};
use crate::{Error, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;

/// What a handler run works with
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    /// Public VM id, attached to every log line of the run
    pub correlation_id: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub max_attempts: u32,
    /// Soft limit: remote calls are budgeted to finish before this
    pub deadline: Instant,
}

impl TaskContext {
    pub fn new(task: &Task, correlation_id: impl Into<String>, soft_limit: Duration) -> Self {
        Self {
            task_id: task.id.clone(),
            correlation_id: correlation_id.into(),
            attempt: task.attempts.max(1),
            max_attempts: task.max_attempts,
            deadline: Instant::now() + soft_limit,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// How a handler run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The transition finished
    Done,
    /// The VM was moved to `error`; not retried
    Failed(String),
    /// Transient failure; the VM is back in its starting status
    Retry(String),
    /// The VM was not in a status this task can start from; nothing changed
    Skipped(String),
}

/// VMs and tasks resolved by [`Orchestrator::sweep_stale`]
#[derive(Debug, Default)]
pub struct SweepReport {
    pub vms: Vec<Vm>,
    pub tasks: Vec<Task>,
}

/// Runs lifecycle transitions against the store, the allocator and the
/// provisioning tool
#[derive(Clone)]
pub struct Orchestrator {
    db: Database,
    allocator: AddressAllocator,
    provisioner: Arc<dyn Provisioner>,
    default_pool: String,
    default_host: Option<String>,
    tool_timeout: Duration,
}

impl Orchestrator {
    pub fn new(db: Database, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            allocator: AddressAllocator::new(db.clone()),
            db,
            provisioner,
            default_pool: "default".to_string(),
            default_host: None,
            tool_timeout: Duration::from_secs(120),
        }
    }

    pub fn default_pool(mut self, pool: impl Into<String>) -> Self {
        self.default_pool = pool.into();
        self
    }

    pub fn default_host(mut self, host: Option<String>) -> Self {
        self.default_host = host;
        self
    }

    /// Ceiling for one remote call, regardless of the task deadline
    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn allocator(&self) -> &AddressAllocator {
        &self.allocator
    }

    /// Run the handler for `task`
    pub async fn handle(&self, ctx: &TaskContext, task: &Task) -> TaskOutcome {
        let span = tracing::info_span!(
            "task",
            task = %ctx.task_id,
            vm_id = %ctx.correlation_id,
            kind = %task.kind,
            attempt = ctx.attempt
        );
        async {
            tracing::info!("Handler started");
            let outcome = match task.kind {
                TaskKind::Create => self.create(ctx, task).await,
                TaskKind::Delete => self.delete(ctx, task).await,
                TaskKind::Start => {
                    self.power(ctx, task, VmStatus::Stopped, VmStatus::Starting, &[ProvisionAction::Start])
                        .await
                }
                TaskKind::Stop => {
                    self.power(ctx, task, VmStatus::Running, VmStatus::Stopping, &[ProvisionAction::Stop])
                        .await
                }
                TaskKind::Restart => {
                    self.power(
                        ctx,
                        task,
                        VmStatus::Running,
                        VmStatus::Restarting,
                        &[ProvisionAction::Stop, ProvisionAction::Start],
                    )
                    .await
                }
            };
            match &outcome {
                TaskOutcome::Done => tracing::info!("Handler finished"),
                TaskOutcome::Failed(msg) => tracing::error!(error = %msg, "Handler failed"),
                TaskOutcome::Retry(msg) => tracing::warn!(error = %msg, "Handler will retry"),
                TaskOutcome::Skipped(msg) => tracing::warn!(reason = %msg, "Handler skipped"),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    // ===== Create =====

    async fn create(&self, ctx: &TaskContext, task: &Task) -> TaskOutcome {
        let vm = match self.begin(task.vm_id, &[VmStatus::Pending], VmStatus::Provisioning) {
            Ok(vm) => vm,
            Err(outcome) => return outcome,
        };

        let pool = task.params.pool.as_deref().unwrap_or(&self.default_pool);
        let allocation = match self.allocator.allocate(pool, &vm.vm_id) {
            Ok(allocation) => allocation,
            Err(e) => return self.settle_failure(ctx, &vm, VmStatus::Pending, e),
        };

        let host = task.params.host.clone().or_else(|| self.default_host.clone());
        let kernel_path = task.params.kernel_path.clone().or_else(|| vm.kernel_path.clone());
        let request = ProvisionRequest::new(&vm.vm_id, vm.vcpu_count, vm.memory_mb)
            .ip_address(Some(allocation.ip.clone()))
            .host(host.clone())
            .kernel_path(kernel_path.clone());

        let report = match self.provision(ctx, ProvisionAction::Create, request).await {
            Ok(report) => report,
            Err(e) => {
                self.release_quietly(&vm.vm_id);
                return self.settle_failure(ctx, &vm, VmStatus::Pending, e);
            }
        };

        let patch = VmPatch::new()
            .ip_address(Some(allocation.ip.clone()))
            .host(host)
            .kernel_path(report.fact("kernel_path").map(str::to_string).or(kernel_path))
            .rootfs_path(report.fact("rootfs_path").map(str::to_string))
            .clear_error();
        match self.db.transition_vm(vm.id, &[VmStatus::Provisioning], VmStatus::Running, &patch) {
            Ok(_) => {
                tracing::info!(ip = %allocation.ip, pool = %allocation.pool, "VM running");
                TaskOutcome::Done
            }
            Err(e) => {
                self.release_quietly(&vm.vm_id);
                self.settle_failure(ctx, &vm, VmStatus::Pending, e)
            }
        }
    }

    // ===== Delete =====

    async fn delete(&self, ctx: &TaskContext, task: &Task) -> TaskOutcome {
        let vm = match self.begin(task.vm_id, &VmStatus::DELETABLE, VmStatus::Deleting) {
            Ok(vm) => vm,
            Err(outcome) => return outcome,
        };

        let request = ProvisionRequest::new(&vm.vm_id, vm.vcpu_count, vm.memory_mb)
            .ip_address(vm.ip_address.clone())
            .host(vm.host.clone().or_else(|| task.params.host.clone()))
            .kernel_path(vm.kernel_path.clone());
        if let Err(e) = self.provision(ctx, ProvisionAction::Delete, request).await {
            tracing::warn!(error = %e, "Remote teardown failed, removing record anyway");
        }

        self.release_quietly(&vm.vm_id);

        match self.db.delete_vm(vm.id) {
            Ok(_) => {
                tracing::info!("VM deleted");
                TaskOutcome::Done
            }
            Err(e) => {
                let msg = format!("failed to remove record: {}", e);
                self.mark_error(&vm, VmStatus::Deleting, &msg, false);
                TaskOutcome::Failed(msg)
            }
        }
    }

    // ===== Start / Stop / Restart =====

    async fn power(
        &self,
        ctx: &TaskContext,
        task: &Task,
        from: VmStatus,
        via: VmStatus,
        actions: &[ProvisionAction],
    ) -> TaskOutcome {
        let vm = match self.begin(task.vm_id, &[from], via) {
            Ok(vm) => vm,
            Err(outcome) => return outcome,
        };

        for action in actions {
            let request = ProvisionRequest::new(&vm.vm_id, vm.vcpu_count, vm.memory_mb)
                .ip_address(vm.ip_address.clone())
                .host(vm.host.clone())
                .kernel_path(vm.kernel_path.clone());
            if let Err(e) = self.provision(ctx, *action, request).await {
                return self.settle_failure(ctx, &vm, from, e);
            }
        }

        let to = if via == VmStatus::Stopping {
            VmStatus::Stopped
        } else {
            VmStatus::Running
        };
        match self.db.transition_vm(vm.id, &[via], to, &VmPatch::new().clear_error()) {
            Ok(_) => {
                tracing::info!(status = %to, "VM settled");
                TaskOutcome::Done
            }
            Err(e) => self.settle_failure(ctx, &vm, from, e),
        }
    }

    // ===== Recovery =====

    /// Clean up after a handler that was aborted mid-flight.
    ///
    /// Releases the address of a VM whose create never finished and moves it,
    /// or any VM left in a transient status, to `error`.
    pub fn recover_aborted(&self, kind: TaskKind, vm_id: i64, reason: &str) -> Result<()> {
        let Some(vm) = self.db.get_vm(vm_id)? else {
            return Ok(());
        };
        let unfinished_create = kind == TaskKind::Create && vm.status != VmStatus::Running;
        if unfinished_create {
            self.allocator.release(&vm.vm_id)?;
        }
        if vm.status.is_transient() || (unfinished_create && vm.status == VmStatus::Pending) {
            self.mark_error(&vm, vm.status, reason, unfinished_create);
        }
        tracing::warn!(vm_id = %vm.vm_id, kind = %kind, reason = %reason, "Recovered aborted task");
        Ok(())
    }

    /// Resolve VMs stuck in a transient status and tasks stuck running for
    /// longer than `max_age`
    pub fn sweep_stale(&self, max_age: Duration) -> Result<SweepReport> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).map_err(|e| Error::Validation(e.to_string()))?;

        let mut report = SweepReport::default();
        for vm in self.db.list_vms_by_status(&VmStatus::TRANSIENT)? {
            if vm.updated_at >= cutoff {
                continue;
            }
            let never_ran = vm.status == VmStatus::Provisioning;
            if never_ran {
                if let Err(e) = self.allocator.release(&vm.vm_id) {
                    tracing::warn!(vm_id = %vm.vm_id, error = %e, "Janitor could not release IP");
                }
            }
            let msg = format!("stuck in {} for more than {:?}", vm.status, max_age);
            if let Some(vm) = self.mark_error(&vm, vm.status, &msg, never_ran) {
                tracing::warn!(vm_id = %vm.vm_id, "Janitor moved stale VM to error");
                report.vms.push(vm);
            }
        }

        report.tasks = self.db.fail_abandoned_tasks(cutoff)?;
        for task in &report.tasks {
            tracing::warn!(task = %task.id, kind = %task.kind, "Janitor failed abandoned task");
            let reason = format!("{} task abandoned by its worker", task.kind);
            if let Err(e) = self.recover_aborted(task.kind, task.vm_id, &reason) {
                tracing::warn!(task = %task.id, error = %e, "Janitor could not recover VM of abandoned task");
            }
        }
        Ok(report)
    }

    // ===== Helpers =====

    /// Enter the handler's transient status or explain why not
    fn begin(&self, id: i64, expected: &[VmStatus], via: VmStatus) -> std::result::Result<Vm, TaskOutcome> {
        match self.db.transition_vm(id, expected, via, &VmPatch::new().clear_error()) {
            Ok(vm) => Ok(vm),
            Err(e) if e.is_invalid_transition() || matches!(e, Error::VmNotFound(_)) => {
                Err(TaskOutcome::Skipped(e.to_string()))
            }
            Err(e) if e.is_transient() => Err(TaskOutcome::Retry(e.to_string())),
            Err(e) => Err(TaskOutcome::Failed(e.to_string())),
        }
    }

    /// Call the provisioning tool on the blocking pool within the task budget
    async fn provision(
        &self,
        ctx: &TaskContext,
        action: ProvisionAction,
        request: ProvisionRequest,
    ) -> Result<ExecutionReport> {
        let budget = ctx.remaining().min(self.tool_timeout);
        if budget.is_zero() {
            return Err(Error::Timeout(Duration::ZERO));
        }

        tracing::debug!(action = %action, budget_ms = budget.as_millis() as u64, "Provisioning");
        let provisioner = Arc::clone(&self.provisioner);
        let call = tokio::task::spawn_blocking(move || provisioner.run(action, &request, budget));

        match tokio::time::timeout(budget + PROVISION_GRACE, call).await {
            Ok(Ok(result)) => result.map_err(Error::from),
            Ok(Err(e)) => Err(Error::Worker(format!("provisioner call failed: {}", e))),
            Err(_) => Err(Error::Timeout(budget)),
        }
    }

    /// Record a failed step: back to `revert` for a retry, otherwise `error`
    fn settle_failure(&self, ctx: &TaskContext, vm: &Vm, revert: VmStatus, error: Error) -> TaskOutcome {
        let msg = error.to_string();
        let current = match self.db.get_vm(vm.id) {
            Ok(Some(current)) => current.status,
            _ => vm.status,
        };
        let clear_ip = vm.status == VmStatus::Provisioning;

        if error.is_transient() && !ctx.is_final_attempt() {
            let mut patch = VmPatch::new().error(msg.clone());
            if clear_ip {
                patch = patch.ip_address(None);
            }
            match self.db.transition_vm(vm.id, &[current], revert, &patch) {
                Ok(_) => return TaskOutcome::Retry(msg),
                Err(e) => tracing::warn!(error = %e, "Could not revert status for retry"),
            }
        }

        self.mark_error(vm, current, &msg, clear_ip);
        TaskOutcome::Failed(msg)
    }

    fn mark_error(&self, vm: &Vm, current: VmStatus, msg: &str, clear_ip: bool) -> Option<Vm> {
        let mut patch = VmPatch::new().error(msg);
        if clear_ip {
            patch = patch.ip_address(None);
        }
        match self.db.transition_vm(vm.id, &[current], VmStatus::Error, &patch) {
            Ok(vm) => Some(vm),
            Err(e) => {
                tracing::warn!(vm_id = %vm.vm_id, error = %e, "Could not mark VM as error");
                None
            }
        }
    }

    fn release_quietly(&self, vm_id: &str) {
        if let Err(e) = self.allocator.release(vm_id) {
            tracing::warn!(vm_id = %vm_id, error = %e, "IP release failed during compensation");
        }
    }
}
