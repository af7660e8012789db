//! Error types for the microVM orchestrator

use crate::models::VmStatus;
use crate::provision::ProvisionError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("VM not found: {0}")]
    VmNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid transition: VM {vm_id} is {current}, cannot move to {next}")]
    InvalidTransition {
        vm_id: String,
        current: VmStatus,
        next: VmStatus,
    },

    #[error("IP pool '{0}' not found or not active")]
    UnknownPool(String),

    #[error("No available IPs in pool '{pool}' ({allocated}/{total} allocated)")]
    Exhausted {
        pool: String,
        allocated: usize,
        total: usize,
    },

    #[error("IP pool already exists: {0}")]
    PoolAlreadyExists(String),

    #[error("Invalid network configuration: {0}")]
    InvalidNetwork(String),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a task failing with this error may be retried by the queue.
    ///
    /// Timeouts, unreachable hosts and storage hiccups are transient. An
    /// exhausted pool, a remote rejection or a bad transition are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Provision(e) => e.is_transient(),
            Error::Timeout(_) | Error::Database(_) | Error::Worker(_) => true,
            _ => false,
        }
    }

    /// Whether this is a status-guard rejection (an expected race, not a fault)
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Error::InvalidTransition { .. })
    }
}
