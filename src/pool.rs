//! IP address pools
//!
//! Hands out one address per VM from a named pool and takes it back on
//! teardown. Each mutation is a single short write transaction, so callers on
//! different connections or processes never receive the same address.

use crate::db::Database;
use crate::models::{Allocation, IpAllocation, IpPool, PoolStats};
use crate::network::NetworkConfig;
use crate::{Error, Result};

/// Allocates and releases VM addresses
#[derive(Clone)]
pub struct AddressAllocator {
    db: Database,
}

impl AddressAllocator {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a pool from a CIDR, seeding every usable host address
    pub fn create_pool(
        &self,
        name: &str,
        cidr: &str,
        gateway: &str,
        description: Option<&str>,
    ) -> Result<IpPool> {
        if name.trim().is_empty() {
            return Err(Error::Validation("pool name cannot be empty".into()));
        }
        let network = NetworkConfig::parse(cidr, gateway)?;
        let hosts = network.assignable_hosts();
        let pool = self.db.insert_pool(
            name,
            &network.cidr.to_string(),
            &network.gateway.to_string(),
            description,
            &hosts,
        )?;
        tracing::info!(pool = %name, cidr = %pool.cidr, addresses = hosts.len(), "Created IP pool");
        Ok(pool)
    }

    /// Bind a free address of `pool` to `vm_id`.
    ///
    /// Calling it again for the same VM returns the address it already holds.
    pub fn allocate(&self, pool: &str, vm_id: &str) -> Result<Allocation> {
        match self.db.allocate_address(pool, vm_id) {
            Ok((pool, row)) => {
                tracing::info!(pool = %pool.name, vm_id = %vm_id, ip = %row.ip_address, "Allocated IP");
                Ok(to_allocation(pool, row))
            }
            Err(e) => {
                tracing::warn!(pool = %pool, vm_id = %vm_id, error = %e, "IP allocation failed");
                Err(e)
            }
        }
    }

    /// Free whatever address `vm_id` holds. Returns false if it held none.
    pub fn release(&self, vm_id: &str) -> Result<bool> {
        let released = self.db.release_addresses(vm_id)?;
        for ip in &released {
            tracing::info!(vm_id = %vm_id, ip = %ip, "Released IP");
        }
        Ok(!released.is_empty())
    }

    pub fn get_allocation(&self, vm_id: &str) -> Result<Option<Allocation>> {
        Ok(self
            .db
            .get_active_allocation(vm_id)?
            .map(|(pool, row)| to_allocation(pool, row)))
    }

    pub fn pool_stats(&self, pool: &str) -> Result<PoolStats> {
        let pool = self
            .db
            .get_pool_by_name(pool)?
            .ok_or_else(|| Error::UnknownPool(pool.to_string()))?;
        let (total, allocated) = self.db.pool_counts(pool.id)?;
        Ok(PoolStats::new(&pool, total, allocated))
    }

    pub fn list_pools(&self) -> Result<Vec<IpPool>> {
        self.db.list_pools()
    }

    /// Addresses of a pool in address order, optionally only the bound ones
    pub fn list_allocations(&self, pool: &str, active_only: bool) -> Result<Vec<IpAllocation>> {
        let pool = self
            .db
            .get_pool_by_name(pool)?
            .ok_or_else(|| Error::UnknownPool(pool.to_string()))?;
        self.db.list_allocations(pool.id, active_only)
    }

    /// Enable or disable a pool. Disabled pools keep existing allocations.
    pub fn set_pool_active(&self, pool: &str, active: bool) -> Result<()> {
        if !self.db.set_pool_active(pool, active)? {
            return Err(Error::UnknownPool(pool.to_string()));
        }
        tracing::info!(pool = %pool, active, "Updated IP pool");
        Ok(())
    }
}

fn to_allocation(pool: IpPool, row: IpAllocation) -> Allocation {
    Allocation {
        ip: row.ip_address,
        gateway: pool.gateway,
        cidr: pool.cidr,
        pool: pool.name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn allocator() -> AddressAllocator {
        AddressAllocator::new(Database::in_memory().unwrap())
    }

    #[test]
    fn test_create_pool_excludes_gateway() {
        let alloc = allocator();
        let pool = alloc.create_pool("default", "172.16.0.0/24", "172.16.0.1", Some("lab")).unwrap();
        assert_eq!(pool.cidr, "172.16.0.0/24");
        assert_eq!(pool.description.as_deref(), Some("lab"));

        let stats = alloc.pool_stats("default").unwrap();
        assert_eq!(stats.total, 253);
        assert_eq!(stats.available, 253);

        let all = alloc.list_allocations("default", false).unwrap();
        assert!(all.iter().all(|a| a.ip_address != "172.16.0.1"));
        assert_eq!(all[0].ip_address, "172.16.0.2");
        assert_eq!(all[8].ip_address, "172.16.0.10");
    }

    #[test]
    fn test_create_pool_validation() {
        let alloc = allocator();
        assert!(matches!(alloc.create_pool("", "10.0.0.0/24", "10.0.0.1", None), Err(Error::Validation(_))));
        assert!(matches!(
            alloc.create_pool("x", "10.0.0.0/24", "192.168.0.1", None),
            Err(Error::InvalidNetwork(_))
        ));
    }

    #[test]
    fn test_allocate_returns_network_details() {
        let alloc = allocator();
        alloc.create_pool("default", "172.16.0.0/24", "172.16.0.1", None).unwrap();

        let a = alloc.allocate("default", "srv-aaaaaaaa").unwrap();
        assert_eq!(
            a,
            Allocation {
                ip: "172.16.0.2".into(),
                gateway: "172.16.0.1".into(),
                cidr: "172.16.0.0/24".into(),
                pool: "default".into(),
            }
        );
        assert_eq!(alloc.allocate("default", "srv-aaaaaaaa").unwrap(), a);
        assert_eq!(alloc.get_allocation("srv-aaaaaaaa").unwrap(), Some(a));
        assert_eq!(alloc.pool_stats("default").unwrap().allocated, 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let alloc = allocator();
        alloc.create_pool("default", "10.0.0.0/29", "10.0.0.1", None).unwrap();
        alloc.allocate("default", "srv-aaaaaaaa").unwrap();

        assert!(alloc.release("srv-aaaaaaaa").unwrap());
        assert!(!alloc.release("srv-aaaaaaaa").unwrap());
        assert!(!alloc.release("srv-neverheld").unwrap());
        assert_eq!(alloc.pool_stats("default").unwrap().allocated, 0);
        assert!(alloc.get_allocation("srv-aaaaaaaa").unwrap().is_none());
    }

    #[test]
    fn test_stale_release_does_not_free_reused_address() {
        let alloc = allocator();
        alloc.create_pool("tiny", "10.0.0.0/30", "10.0.0.1", None).unwrap();

        alloc.allocate("tiny", "srv-aaaaaaaa").unwrap();
        alloc.release("srv-aaaaaaaa").unwrap();
        let b = alloc.allocate("tiny", "srv-bbbbbbbb").unwrap();
        assert_eq!(b.ip, "10.0.0.2");

        assert!(!alloc.release("srv-aaaaaaaa").unwrap());
        assert_eq!(alloc.get_allocation("srv-bbbbbbbb").unwrap(), Some(b));
    }

    #[test]
    fn test_inactive_pool() {
        let alloc = allocator();
        alloc.create_pool("default", "10.0.0.0/29", "10.0.0.1", None).unwrap();
        alloc.set_pool_active("default", false).unwrap();
        assert!(matches!(alloc.allocate("default", "srv-aaaaaaaa"), Err(Error::UnknownPool(_))));
        assert!(!alloc.pool_stats("default").unwrap().is_active);
        assert!(matches!(alloc.set_pool_active("missing", true), Err(Error::UnknownPool(_))));
    }

    #[test]
    fn test_concurrent_allocation_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.db");
        // /29 minus network, broadcast and gateway leaves 5 addresses
        AddressAllocator::new(Database::open(&path).unwrap())
            .create_pool("default", "10.0.0.0/29", "10.0.0.1", None)
            .unwrap();

        let callers = 12;
        let barrier = Arc::new(Barrier::new(callers));
        let handles: Vec<_> = (0..callers)
            .map(|i| {
                let path = path.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let alloc = AddressAllocator::new(Database::open(&path).unwrap());
                    barrier.wait();
                    alloc.allocate("default", &format!("srv-{:08x}", i))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let granted: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        let exhausted = results
            .iter()
            .filter(|r| matches!(r, Err(Error::Exhausted { .. })))
            .count();

        assert_eq!(granted.len(), 5);
        assert_eq!(exhausted, callers - 5);
        let unique: HashSet<_> = granted.iter().map(|a| a.ip.clone()).collect();
        assert_eq!(unique.len(), 5);
    }
}
