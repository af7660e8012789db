//! Lifecycle scenarios through the request layer, the queue and the
//! orchestrator, with a scripted provisioning tool standing in for the
//! remote hosts.

use microvm_kube::models::{TaskStatus, VmPatch, VmStatus};
use microvm_kube::provision::{
    ExecutionReport, ProvisionAction, ProvisionError, ProvisionRequest, Provisioner, StepResult,
    StepStatus,
};
use microvm_kube::service::Placement;
use microvm_kube::{
    AddressAllocator, Database, Error, NewVm, Orchestrator, QueueConfig, Scheduler, VmService,
};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

type Reply = Result<ExecutionReport, ProvisionError>;

/// Replays queued replies in order; succeeds once the script runs out
#[derive(Default)]
struct ScriptedProvisioner {
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<(ProvisionAction, ProvisionRequest)>>,
}

impl ScriptedProvisioner {
    fn with_replies(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn actions(&self) -> Vec<ProvisionAction> {
        self.calls.lock().iter().map(|(a, _)| *a).collect()
    }
}

impl Provisioner for ScriptedProvisioner {
    fn run(&self, action: ProvisionAction, request: &ProvisionRequest, _timeout: Duration) -> Reply {
        self.calls.lock().push((action, request.clone()));
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(ExecutionReport::new(action)))
    }
}

struct Harness {
    db: Database,
    allocator: AddressAllocator,
    scheduler: Arc<Scheduler>,
    service: VmService,
}

fn harness(provisioner: Arc<ScriptedProvisioner>, cidr: &str, gateway: &str, max_attempts: u32) -> Harness {
    let db = Database::in_memory().unwrap();
    let allocator = AddressAllocator::new(db.clone());
    allocator.create_pool("default", cidr, gateway, None).unwrap();

    let orch = Orchestrator::new(db.clone(), provisioner)
        .default_host(Some("fc-host-1".into()))
        .tool_timeout(Duration::from_secs(5));
    let config = QueueConfig::default()
        .concurrency(4)
        .max_attempts(max_attempts)
        .retry_backoff(Duration::ZERO)
        .soft_time_limit(Duration::from_secs(10))
        .hard_time_limit(Duration::from_secs(20))
        .poll_interval(Duration::from_millis(10));
    let scheduler = Arc::new(Scheduler::new(orch, config));
    let service = VmService::new(db.clone(), scheduler.queue());

    Harness {
        db,
        allocator,
        scheduler,
        service,
    }
}

fn request(name: &str) -> NewVm {
    NewVm::new(name, "alice").vcpu_count(1).memory_mb(256)
}

fn created(rootfs: &str) -> Reply {
    Ok(ExecutionReport::new(ProvisionAction::Create)
        .with_step(StepResult::new("Create VM directory", StepStatus::Changed))
        .with_step(StepResult::new("Copy rootfs", StepStatus::Changed).with_fact("rootfs_path", rootfs)))
}

#[tokio::test]
async fn test_create_takes_the_only_free_address() {
    let tool = ScriptedProvisioner::with_replies(vec![created("/srv/vms/rootfs.ext4")]);
    // /30 minus network, broadcast and gateway leaves exactly one address
    let h = harness(tool.clone(), "10.0.0.0/30", "10.0.0.1", 1);

    let (vm, task) = h.service.create_vm(request("t1"), Placement::default()).unwrap();
    assert_eq!(vm.status, VmStatus::Pending);

    let report = h.scheduler.run_once().await.unwrap().unwrap();
    assert_eq!(report.task_id, task.id);
    assert_eq!(report.status, TaskStatus::Completed);

    let vm = h.service.get_vm(&vm.vm_id, "alice").unwrap();
    assert_eq!(vm.status, VmStatus::Running);
    assert_eq!(vm.ip_address.as_deref(), Some("10.0.0.2"));
    assert_eq!(vm.host.as_deref(), Some("fc-host-1"));
    assert_eq!(vm.rootfs_path.as_deref(), Some("/srv/vms/rootfs.ext4"));
    assert!(vm.error_message.is_none());

    let calls = tool.calls.lock().clone();
    assert_eq!(calls.len(), 1);
    let (action, sent) = &calls[0];
    assert_eq!(*action, ProvisionAction::Create);
    assert_eq!(sent.vm_id, vm.vm_id);
    assert_eq!(sent.ip_address.as_deref(), Some("10.0.0.2"));

    let stats = h.allocator.pool_stats("default").unwrap();
    assert_eq!((stats.allocated, stats.available), (1, 0));
}

#[tokio::test]
async fn test_create_on_exhausted_pool_never_provisions() {
    let tool = ScriptedProvisioner::with_replies(vec![]);
    let h = harness(tool.clone(), "10.0.0.0/30", "10.0.0.1", 3);
    h.allocator.allocate("default", "srv-occupant").unwrap();

    let (vm, task) = h.service.create_vm(request("t1"), Placement::default()).unwrap();
    let report = h.scheduler.run_once().await.unwrap().unwrap();
    assert_eq!(report.status, TaskStatus::Failed);

    let vm = h.service.get_vm(&vm.vm_id, "alice").unwrap();
    assert_eq!(vm.status, VmStatus::Error);
    assert!(vm.ip_address.is_none());
    assert!(vm.error_message.unwrap().contains("No available IPs"));
    assert!(tool.actions().is_empty());

    // Exhaustion is permanent; nothing is requeued
    let stored = h.db.get_task(&task.id).unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.attempts, 1);
    assert!(h.scheduler.run_once().await.unwrap().is_none());
}

#[tokio::test]
async fn test_create_timeout_releases_address() {
    let tool = ScriptedProvisioner::with_replies(vec![Err(ProvisionError::Timeout(Duration::from_secs(5)))]);
    let h = harness(tool.clone(), "10.0.0.0/29", "10.0.0.1", 1);

    let (vm, _) = h.service.create_vm(request("t1"), Placement::default()).unwrap();
    let report = h.scheduler.run_once().await.unwrap().unwrap();
    assert_eq!(report.status, TaskStatus::Failed);

    let vm = h.service.get_vm(&vm.vm_id, "alice").unwrap();
    assert_eq!(vm.status, VmStatus::Error);
    assert!(vm.ip_address.is_none());
    assert!(vm.error_message.unwrap().contains("timed out"));
    assert!(h.allocator.get_allocation(&vm.vm_id).unwrap().is_none());
    assert_eq!(h.allocator.pool_stats("default").unwrap().allocated, 0);
}

#[tokio::test]
async fn test_transient_create_failure_retries_to_running() {
    let tool = ScriptedProvisioner::with_replies(vec![
        Err(ProvisionError::Unreachable("fc-host-1: ssh connection refused".into())),
        created("/srv/vms/rootfs.ext4"),
    ]);
    let h = harness(tool.clone(), "10.0.0.0/29", "10.0.0.1", 2);

    let (vm, task) = h.service.create_vm(request("t1"), Placement::default()).unwrap();

    let first = h.scheduler.run_once().await.unwrap().unwrap();
    assert_eq!(first.status, TaskStatus::Pending);
    let between = h.service.get_vm(&vm.vm_id, "alice").unwrap();
    assert_eq!(between.status, VmStatus::Pending);
    assert!(between.ip_address.is_none());
    assert!(between.error_message.unwrap().contains("unreachable"));
    assert_eq!(h.allocator.pool_stats("default").unwrap().allocated, 0);

    let second = h.scheduler.run_once().await.unwrap().unwrap();
    assert_eq!(second.task_id, task.id);
    assert_eq!(second.attempt, 2);
    assert_eq!(second.status, TaskStatus::Completed);

    let vm = h.service.get_vm(&vm.vm_id, "alice").unwrap();
    assert_eq!(vm.status, VmStatus::Running);
    assert!(vm.error_message.is_none());
    assert_eq!(tool.actions(), vec![ProvisionAction::Create, ProvisionAction::Create]);
}

#[tokio::test]
async fn test_delete_with_unreachable_host_still_removes_record() {
    let tool = ScriptedProvisioner::with_replies(vec![
        created("/srv/vms/rootfs.ext4"),
        Err(ProvisionError::Unreachable("fc-host-1: no route to host".into())),
    ]);
    let h = harness(tool.clone(), "10.0.0.0/29", "10.0.0.1", 3);

    let (vm, _) = h.service.create_vm(request("t1"), Placement::default()).unwrap();
    h.scheduler.run_once().await.unwrap().unwrap();
    assert_eq!(h.allocator.pool_stats("default").unwrap().allocated, 1);

    let task = h.service.delete_vm(&vm.vm_id, "alice").unwrap();
    let report = h.scheduler.run_once().await.unwrap().unwrap();
    assert_eq!(report.task_id, task.id);
    assert_eq!(report.status, TaskStatus::Completed);

    assert!(matches!(h.service.get_vm(&vm.vm_id, "alice"), Err(Error::VmNotFound(_))));
    assert!(h.allocator.get_allocation(&vm.vm_id).unwrap().is_none());
    assert_eq!(h.allocator.pool_stats("default").unwrap().allocated, 0);
    assert_eq!(tool.actions(), vec![ProvisionAction::Create, ProvisionAction::Delete]);
}

#[tokio::test]
async fn test_power_cycle() {
    let tool = ScriptedProvisioner::with_replies(vec![]);
    let h = harness(tool.clone(), "10.0.0.0/29", "10.0.0.1", 3);
    let (vm, _) = h.service.create_vm(request("t1"), Placement::default()).unwrap();
    h.scheduler.run_once().await.unwrap().unwrap();

    h.service.stop_vm(&vm.vm_id, "alice").unwrap();
    h.scheduler.run_once().await.unwrap().unwrap();
    assert_eq!(h.service.get_vm(&vm.vm_id, "alice").unwrap().status, VmStatus::Stopped);

    // A stopped VM cannot be stopped or restarted
    assert!(matches!(h.service.stop_vm(&vm.vm_id, "alice"), Err(Error::InvalidTransition { .. })));
    assert!(matches!(h.service.restart_vm(&vm.vm_id, "alice"), Err(Error::InvalidTransition { .. })));

    h.service.start_vm(&vm.vm_id, "alice").unwrap();
    h.scheduler.run_once().await.unwrap().unwrap();
    assert_eq!(h.service.get_vm(&vm.vm_id, "alice").unwrap().status, VmStatus::Running);

    h.service.restart_vm(&vm.vm_id, "alice").unwrap();
    h.scheduler.run_once().await.unwrap().unwrap();
    let vm = h.service.get_vm(&vm.vm_id, "alice").unwrap();
    assert_eq!(vm.status, VmStatus::Running);
    assert_eq!(vm.ip_address.as_deref(), Some("10.0.0.2"));

    assert_eq!(
        tool.actions(),
        vec![
            ProvisionAction::Create,
            ProvisionAction::Stop,
            ProvisionAction::Start,
            ProvisionAction::Stop,
            ProvisionAction::Start,
        ]
    );
}

#[tokio::test]
async fn test_stale_task_after_status_change_is_skipped() {
    let tool = ScriptedProvisioner::with_replies(vec![]);
    let h = harness(tool.clone(), "10.0.0.0/29", "10.0.0.1", 3);
    let (vm, _) = h.service.create_vm(request("t1"), Placement::default()).unwrap();
    h.scheduler.run_once().await.unwrap().unwrap();

    // Two stops queued back to back; the second finds the VM already stopped
    h.service.stop_vm(&vm.vm_id, "alice").unwrap();
    let late = h.service.stop_vm(&vm.vm_id, "alice").unwrap();
    h.scheduler.run_once().await.unwrap().unwrap();
    let report = h.scheduler.run_once().await.unwrap().unwrap();

    assert_eq!(report.task_id, late.id);
    assert_eq!(report.status, TaskStatus::Completed);
    assert_eq!(h.service.get_vm(&vm.vm_id, "alice").unwrap().status, VmStatus::Stopped);
    assert_eq!(tool.actions(), vec![ProvisionAction::Create, ProvisionAction::Stop]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_never_share_an_address() {
    let tool = ScriptedProvisioner::with_replies(vec![]);
    // Five assignable addresses for eight VMs
    let h = harness(tool.clone(), "10.0.0.0/29", "10.0.0.1", 1);
    let vms: Vec<_> = (0..8)
        .map(|i| h.service.create_vm(request(&format!("vm-{}", i)), Placement::default()).unwrap().0)
        .collect();

    let (tx, rx) = tokio::sync::watch::channel(false);
    let workers = h.scheduler.spawn_workers(rx);

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let open = h.db.list_tasks(Some(TaskStatus::Pending), 100).unwrap().len()
            + h.db.list_tasks(Some(TaskStatus::Running), 100).unwrap().len();
        if open == 0 {
            break;
        }
        assert!(Instant::now() < deadline, "tasks did not finish");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tx.send(true).unwrap();
    for worker in workers {
        worker.await.unwrap();
    }

    let settled: Vec<_> = vms.iter().map(|vm| h.db.get_vm(vm.id).unwrap().unwrap()).collect();
    let running: Vec<_> = settled.iter().filter(|v| v.status == VmStatus::Running).collect();
    let failed = settled.iter().filter(|v| v.status == VmStatus::Error).count();
    assert_eq!(running.len(), 5);
    assert_eq!(failed, 3);

    let ips: HashSet<_> = running.iter().map(|v| v.ip_address.clone().unwrap()).collect();
    assert_eq!(ips.len(), 5);
    assert!(!ips.contains("10.0.0.1"));
    assert_eq!(h.allocator.pool_stats("default").unwrap().available, 0);
    assert_eq!(tool.actions().len(), 5);
}

#[tokio::test]
async fn test_janitor_recovers_vm_stuck_in_provisioning() {
    let tool = ScriptedProvisioner::with_replies(vec![]);
    let h = harness(tool, "10.0.0.0/29", "10.0.0.1", 3);
    let (vm, _) = h.service.create_vm(request("t1"), Placement::default()).unwrap();

    // A worker died between allocation and the remote call
    let ip = h.allocator.allocate("default", &vm.vm_id).unwrap().ip;
    h.db.transition_vm(
        vm.id,
        &[VmStatus::Pending],
        VmStatus::Provisioning,
        &VmPatch::new().ip_address(Some(ip)),
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let orch = Orchestrator::new(h.db.clone(), ScriptedProvisioner::with_replies(vec![]));
    let report = orch.sweep_stale(Duration::ZERO).unwrap();
    assert_eq!(report.vms.len(), 1);

    let vm = h.service.get_vm(&vm.vm_id, "alice").unwrap();
    assert_eq!(vm.status, VmStatus::Error);
    assert!(vm.ip_address.is_none());
    assert!(vm.error_message.unwrap().contains("stuck in provisioning"));
    assert_eq!(h.allocator.pool_stats("default").unwrap().allocated, 0);

    // The queued create no longer applies; the error VM can still be deleted
    h.service.delete_vm(&vm.vm_id, "alice").unwrap();
    let skipped = h.scheduler.run_once().await.unwrap().unwrap();
    assert_eq!(skipped.kind, microvm_kube::TaskKind::Create);
    assert_eq!(skipped.status, TaskStatus::Completed);
    h.scheduler.run_once().await.unwrap().unwrap();
    assert!(h.db.get_vm(vm.id).unwrap().is_none());
}
