//! mvkube CLI - microVM lifecycle orchestrator

use clap::{Parser, Subcommand};
use microvm_kube::models::*;
use microvm_kube::provision::AnsibleProvisioner;
use microvm_kube::service::Placement;
use microvm_kube::{AddressAllocator, Config, Database, Orchestrator, Result, Scheduler, VmService};
use std::path::PathBuf;
use std::sync::Arc;
use tabled::{Table, Tabled};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mvkube")]
#[command(about = "Lifecycle orchestrator for microVMs on remote hypervisor hosts")]
#[command(version)]
struct Cli {
    /// JSON config file; MVKUBE_* variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the state database
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Principal owning the VMs this invocation touches
    #[arg(long, global = true, default_value = "admin")]
    owner: String,

    /// Emit JSON log lines (also MVKUBE_LOG_JSON=1)
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// IP pool management
    Pool {
        #[command(subcommand)]
        action: PoolAction,
    },
    /// VM lifecycle requests
    Vm {
        #[command(subcommand)]
        action: VmAction,
    },
    /// List queued tasks
    Tasks {
        /// Filter by status (Pending, Running, Completed, Failed)
        #[arg(short, long)]
        status: Option<String>,
        /// Only tasks of this VM
        #[arg(long)]
        vm: Option<String>,
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Run queue workers until Ctrl-C
    Worker,
    /// Move VMs and tasks stuck past the hard time limit to a terminal state
    Janitor,
}

#[derive(Subcommand)]
enum PoolAction {
    /// Create a pool from a CIDR
    Create {
        /// Pool name
        #[arg(short, long)]
        name: String,
        /// Network, e.g. 172.16.0.0/24
        #[arg(short, long)]
        cidr: String,
        /// Gateway address inside the network
        #[arg(short, long)]
        gateway: String,
        #[arg(short, long)]
        description: Option<String>,
    },
    /// List pools
    List,
    /// Show pool usage and bound addresses
    Stats {
        /// Pool name
        name: String,
    },
    /// Stop handing out addresses from a pool
    Disable {
        name: String,
    },
    /// Resume handing out addresses from a pool
    Enable {
        name: String,
    },
}

#[derive(Subcommand)]
enum VmAction {
    /// Request a new VM
    Create {
        /// VM name
        #[arg(short, long)]
        name: String,
        #[arg(long, default_value = "1")]
        vcpus: u32,
        /// Memory in MB
        #[arg(short, long, default_value = "512")]
        memory: u32,
        #[arg(short, long)]
        description: Option<String>,
        /// Kernel image on the host
        #[arg(long)]
        kernel: Option<String>,
        /// Hypervisor host to place the VM on
        #[arg(long)]
        host: Option<String>,
        /// Pool to draw the address from
        #[arg(short, long)]
        pool: Option<String>,
    },
    /// List VMs, newest first
    List {
        #[arg(long, default_value = "0")]
        offset: usize,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show one VM
    Get {
        vm_id: String,
    },
    /// Change name or description
    Update {
        vm_id: String,
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long)]
        description: Option<String>,
    },
    Start {
        vm_id: String,
    },
    Stop {
        vm_id: String,
    },
    Restart {
        vm_id: String,
    },
    Delete {
        vm_id: String,
    },
}

// Table display structs
#[derive(Tabled)]
struct PoolRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "CIDR")]
    cidr: String,
    #[tabled(rename = "Gateway")]
    gateway: String,
    #[tabled(rename = "Active")]
    active: String,
    #[tabled(rename = "Used")]
    used: String,
}

#[derive(Tabled)]
struct VmRow {
    #[tabled(rename = "ID")]
    vm_id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "IP")]
    ip: String,
    #[tabled(rename = "Host")]
    host: String,
    #[tabled(rename = "Size")]
    size: String,
}

#[derive(Tabled)]
struct TaskRow {
    #[tabled(rename = "Task")]
    id: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "VM")]
    vm: i64,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: String,
    #[tabled(rename = "Last error")]
    last_error: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_json = cli.log_json
        || std::env::var("MVKUBE_LOG_JSON").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    init_logging(log_json);

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::new(),
    }
    .with_env_overrides(|key| std::env::var(key).ok())?;
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }

    let db = Database::open(&config.db_path)?;

    match cli.command {
        Commands::Pool { action } => handle_pool(&AddressAllocator::new(db), action)?,
        Commands::Vm { action } => {
            let service = VmService::new(db.clone(), queue(&db, &config));
            handle_vm(&service, &config, &cli.owner, action)?
        }
        Commands::Tasks { status, vm, limit } => {
            handle_tasks(&db, &cli.owner, status.as_deref(), vm.as_deref(), limit)?
        }
        Commands::Worker => run_worker(db, config).await?,
        Commands::Janitor => {
            config.validate()?;
            let report = orchestrator(db, &config)?.sweep_stale(config.queue.hard_time_limit)?;
            println!(
                "Moved {} VM(s) to error, failed {} abandoned task(s).",
                report.vms.len(),
                report.tasks.len()
            );
        }
    }

    Ok(())
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("microvm_kube=info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn queue(db: &Database, config: &Config) -> microvm_kube::TaskQueue {
    microvm_kube::TaskQueue::new(db.clone(), config.queue.max_attempts)
}

fn orchestrator(db: Database, config: &Config) -> Result<Orchestrator> {
    let provisioner = AnsibleProvisioner::new(&config.provisioner)?;
    Ok(Orchestrator::new(db, Arc::new(provisioner))
        .default_pool(config.default_pool.clone())
        .default_host(config.default_host.clone())
        .tool_timeout(config.provisioner.tool_timeout))
}

async fn run_worker(db: Database, config: Config) -> Result<()> {
    config.validate()?;
    let orch = orchestrator(db, &config)?;

    let scheduler = Arc::new(Scheduler::new(orch, config.queue.clone()));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    // The first sweep runs immediately and picks up work of dead workers
    let janitor = scheduler.spawn_janitor(shutdown_rx.clone());
    let workers = scheduler.spawn_workers(shutdown_rx);
    println!(
        "Running {} worker(s) against {}. Press Ctrl-C to stop.",
        workers.len(),
        config.db_path.display()
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!(active = scheduler.active_count(), "Shutting down workers");
    for task in scheduler.active_tasks() {
        tracing::info!(
            task = %task.task_id,
            kind = %task.kind,
            vm_id = %task.correlation_id,
            running_ms = task.started_at.elapsed().as_millis() as u64,
            "Waiting for in-flight task"
        );
    }
    let _ = shutdown_tx.send(true);
    for handle in workers {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Worker panicked");
        }
    }
    if let Err(e) = janitor.await {
        tracing::error!(error = %e, "Janitor panicked");
    }
    Ok(())
}

fn handle_pool(alloc: &AddressAllocator, action: PoolAction) -> Result<()> {
    match action {
        PoolAction::Create {
            name,
            cidr,
            gateway,
            description,
        } => {
            alloc.create_pool(&name, &cidr, &gateway, description.as_deref())?;
            let stats = alloc.pool_stats(&name)?;
            println!("Pool created: {} ({}, {} addresses)", name, stats.cidr, stats.total);
        }
        PoolAction::List => {
            let pools = alloc.list_pools()?;
            if pools.is_empty() {
                println!("No pools created.");
                return Ok(());
            }

            let mut rows = Vec::with_capacity(pools.len());
            for p in &pools {
                let stats = alloc.pool_stats(&p.name)?;
                rows.push(PoolRow {
                    name: p.name.clone(),
                    cidr: p.cidr.clone(),
                    gateway: p.gateway.clone(),
                    active: if p.is_active { "Yes" } else { "No" }.to_string(),
                    used: format!("{}/{}", stats.allocated, stats.total),
                });
            }

            println!("{}", Table::new(rows));
        }
        PoolAction::Stats { name } => {
            let stats = alloc.pool_stats(&name)?;
            println!("Pool: {}", stats.pool_name);
            println!("  CIDR:        {}", stats.cidr);
            println!("  Gateway:     {}", stats.gateway);
            println!("  Active:      {}", if stats.is_active { "Yes" } else { "No" });
            println!("  Total:       {}", stats.total);
            println!("  Allocated:   {}", stats.allocated);
            println!("  Available:   {}", stats.available);
            println!("  Utilization: {:.2}%", stats.utilization);

            for a in alloc.list_allocations(&name, true)? {
                println!("  - {} -> {}", a.ip_address, a.vm_id.unwrap_or_else(|| "?".into()));
            }
        }
        PoolAction::Disable { name } => {
            alloc.set_pool_active(&name, false)?;
            println!("Pool disabled: {}", name);
        }
        PoolAction::Enable { name } => {
            alloc.set_pool_active(&name, true)?;
            println!("Pool enabled: {}", name);
        }
    }
    Ok(())
}

fn handle_vm(service: &VmService, config: &Config, owner: &str, action: VmAction) -> Result<()> {
    match action {
        VmAction::Create {
            name,
            vcpus,
            memory,
            description,
            kernel,
            host,
            pool,
        } => {
            let mut request = NewVm::new(name, owner).vcpu_count(vcpus).memory_mb(memory);
            if let Some(desc) = description {
                request = request.description(desc);
            }
            if let Some(kernel) = kernel {
                request = request.kernel_path(kernel);
            }
            let placement = Placement {
                host: host.or_else(|| config.default_host.clone()),
                pool,
            };

            let (vm, task) = service.create_vm(request, placement)?;
            println!("VM accepted: {} ({}), task {}", vm.vm_id, vm.status, task.id);
        }
        VmAction::List { offset, limit } => {
            let (vms, total) = service.list_vms(owner, offset, limit)?;
            if vms.is_empty() {
                println!("No VMs found.");
                return Ok(());
            }

            let rows: Vec<VmRow> = vms
                .iter()
                .map(|v| VmRow {
                    vm_id: v.vm_id.clone(),
                    name: v.name.clone(),
                    status: v.status.to_string(),
                    ip: v.ip_address.clone().unwrap_or_else(|| "-".to_string()),
                    host: v.host.clone().unwrap_or_else(|| "-".to_string()),
                    size: format!("{} vCPU / {}MB", v.vcpu_count, v.memory_mb),
                })
                .collect();

            println!("{}", Table::new(rows));
            println!("{}-{} of {}", offset + 1, offset + vms.len(), total);
        }
        VmAction::Get { vm_id } => {
            let vm = service.get_vm(&vm_id, owner)?;

            println!("VM: {}", vm.name);
            println!("  ID:       {}", vm.vm_id);
            println!("  Status:   {}", vm.status);
            println!("  IP:       {}", vm.ip_address.as_deref().unwrap_or("-"));
            println!("  Host:     {}", vm.host.as_deref().unwrap_or("-"));
            println!("  vCPUs:    {}", vm.vcpu_count);
            println!("  Memory:   {}MB", vm.memory_mb);
            if let Some(kernel) = &vm.kernel_path {
                println!("  Kernel:   {}", kernel);
            }
            if let Some(rootfs) = &vm.rootfs_path {
                println!("  Rootfs:   {}", rootfs);
            }
            if let Some(desc) = &vm.description {
                println!("  About:    {}", desc);
            }
            println!("  Created:  {}", vm.created_at);
            println!("  Updated:  {}", vm.updated_at);
            if let Some(err) = &vm.error_message {
                println!("  Error:    {}", err);
            }
        }
        VmAction::Update {
            vm_id,
            name,
            description,
        } => {
            let vm = service.update_vm(&vm_id, owner, name.as_deref(), description.as_deref())?;
            println!("VM updated: {} ({})", vm.vm_id, vm.name);
        }
        VmAction::Start { vm_id } => queued(&vm_id, service.start_vm(&vm_id, owner)?),
        VmAction::Stop { vm_id } => queued(&vm_id, service.stop_vm(&vm_id, owner)?),
        VmAction::Restart { vm_id } => queued(&vm_id, service.restart_vm(&vm_id, owner)?),
        VmAction::Delete { vm_id } => queued(&vm_id, service.delete_vm(&vm_id, owner)?),
    }
    Ok(())
}

fn queued(vm_id: &str, task: Task) {
    println!("Queued {} for {}: task {}", task.kind, vm_id, task.id);
}

fn handle_tasks(
    db: &Database,
    owner: &str,
    status: Option<&str>,
    vm: Option<&str>,
    limit: usize,
) -> Result<()> {
    let tasks = match vm {
        Some(vm_id) => {
            let vm = db
                .get_vm_by_public_id(vm_id)?
                .filter(|v| v.owner == owner)
                .ok_or_else(|| microvm_kube::Error::VmNotFound(vm_id.to_string()))?;
            db.list_tasks_for_vm(vm.id)?
        }
        None => {
            let status = status.map(str::parse::<TaskStatus>).transpose()?;
            db.list_tasks(status, limit)?
        }
    };

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    let rows: Vec<TaskRow> = tasks
        .iter()
        .map(|t| TaskRow {
            id: t.id.clone(),
            kind: t.kind.to_string(),
            vm: t.vm_id,
            status: t.status.to_string(),
            attempts: format!("{}/{}", t.attempts, t.max_attempts),
            last_error: t.last_error.clone().unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    println!("{}", Table::new(rows));
    Ok(())
}
