//! microVM lifecycle orchestrator
//!
//! Drives Firecracker-style microVMs on remote hypervisor hosts through a
//! status-guarded lifecycle. Requests are recorded in SQLite and queued;
//! background workers allocate an address from a named pool, run the
//! provisioning playbook for the transition and settle the VM record.
//!
//! # Key Features
//!
//! - **Exclusive addressing** - one active address per VM, never shared
//! - **Guarded transitions** - every status change is a compare-and-set
//! - **Bounded remote calls** - every playbook run has a deadline
//! - **Retrying queue** - transient failures come back with backoff
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use microvm_kube::provision::AnsibleProvisioner;
//! use microvm_kube::service::Placement;
//! use microvm_kube::{AddressAllocator, Config, Database, NewVm, Orchestrator, Scheduler, VmService};
//!
//! let config = Config::from_env()?;
//! let db = Database::open(&config.db_path)?;
//!
//! AddressAllocator::new(db.clone()).create_pool("default", "172.16.0.0/24", "172.16.0.1", None)?;
//!
//! let provisioner = Arc::new(AnsibleProvisioner::new(&config.provisioner)?);
//! let orchestrator = Orchestrator::new(db.clone(), provisioner);
//! let scheduler = Scheduler::new(orchestrator, config.queue.clone());
//!
//! let service = VmService::new(db, scheduler.queue());
//! let (vm, _task) = service.create_vm(NewVm::new("web-1", "alice"), Placement::default())?;
//! println!("{} is {}", vm.vm_id, vm.status);
//! # Ok::<(), microvm_kube::Error>(())
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod network;
pub mod orchestrator;
pub mod pool;
pub mod provision;
pub mod scheduler;
pub mod service;

pub use config::{Config, ProvisionerConfig, QueueConfig};
pub use db::Database;
pub use error::{Error, Result};
pub use models::{NewVm, Task, TaskKind, TaskStatus, Vm, VmStatus};
pub use orchestrator::Orchestrator;
pub use pool::AddressAllocator;
pub use scheduler::{Scheduler, TaskQueue};
pub use service::VmService;
