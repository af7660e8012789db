//! IP pool and allocation models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named, CIDR-scoped range of allocatable addresses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpPool {
    pub id: i64,
    /// Unique pool name (e.g. "default")
    pub name: String,
    /// Network CIDR (e.g. "172.16.0.0/24")
    pub cidr: String,
    /// Gateway address, never handed out
    pub gateway: String,
    pub is_active: bool,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One address row of a pool.
///
/// Rows are created when the pool is created and reused across allocations.
/// A row with `is_active == false` is free.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpAllocation {
    pub id: i64,
    pub pool_id: i64,
    pub ip_address: String,
    /// Public id of the VM holding this address
    pub vm_id: Option<String>,
    pub is_active: bool,
    pub allocated_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
}

/// What `allocate` hands back to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub ip: String,
    pub gateway: String,
    pub cidr: String,
    pub pool: String,
}

/// Pool usage summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub pool_name: String,
    pub cidr: String,
    pub gateway: String,
    pub is_active: bool,
    pub total: usize,
    pub allocated: usize,
    pub available: usize,
    /// Percentage of addresses in use, 0-100
    pub utilization: f64,
}

impl PoolStats {
    pub fn new(pool: &IpPool, total: usize, allocated: usize) -> Self {
        let utilization = if total > 0 {
            ((allocated as f64 / total as f64) * 10000.0).round() / 100.0
        } else {
            0.0
        };
        Self {
            pool_name: pool.name.clone(),
            cidr: pool.cidr.clone(),
            gateway: pool.gateway.clone(),
            is_active: pool.is_active,
            total,
            allocated,
            available: total.saturating_sub(allocated),
            utilization,
        }
    }
}
