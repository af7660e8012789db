//! SQLite state storage

use crate::models::*;
use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const VM_COLUMNS: &str = "id, vm_id, name, description, vcpu_count, memory_mb, ip_address, host, \
     kernel_path, rootfs_path, status, error_message, owner, created_at, updated_at";
const POOL_COLUMNS: &str = "id, name, cidr, gateway, is_active, description, created_at";
const ALLOCATION_COLUMNS: &str =
    "id, pool_id, ip_address, vm_id, is_active, allocated_at, released_at";
const TASK_COLUMNS: &str = "id, kind, vm_id, params, status, attempts, max_attempts, not_before, \
     created_at, started_at, completed_at, last_error";

/// Database for state storage
///
/// Cheap to clone; clones share one connection. Separate `open` calls on the
/// same file get separate connections coordinated by SQLite locking.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "wal", |row| row.get(0))?;
        Self::init(conn)
    }

    /// Create in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS vms (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vm_id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                description TEXT,
                vcpu_count INTEGER NOT NULL,
                memory_mb INTEGER NOT NULL,
                ip_address TEXT,
                host TEXT,
                kernel_path TEXT,
                rootfs_path TEXT,
                status TEXT NOT NULL,
                error_message TEXT,
                owner TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ip_pools (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                cidr TEXT NOT NULL,
                gateway TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                description TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ip_allocations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pool_id INTEGER NOT NULL,
                ip_address TEXT NOT NULL,
                ip_order INTEGER NOT NULL,
                vm_id TEXT,
                is_active INTEGER NOT NULL DEFAULT 0,
                allocated_at TEXT,
                released_at TEXT,
                UNIQUE (pool_id, ip_address),
                FOREIGN KEY (pool_id) REFERENCES ip_pools(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                vm_id INTEGER NOT NULL,
                params TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                max_attempts INTEGER NOT NULL,
                not_before TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                last_error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_vms_owner ON vms(owner, created_at);
            CREATE INDEX IF NOT EXISTS idx_vms_status ON vms(status);
            CREATE INDEX IF NOT EXISTS idx_alloc_free ON ip_allocations(pool_id, is_active, ip_order);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_alloc_active_vm
                ON ip_allocations(vm_id) WHERE is_active = 1;
            CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(status, not_before);
            CREATE INDEX IF NOT EXISTS idx_tasks_vm ON tasks(vm_id);
            "#,
        )?;
        Ok(())
    }

    // ===== VMs =====

    /// Insert a new record in `pending`
    pub fn insert_vm(&self, vm_id: &str, new: &NewVm) -> Result<Vm> {
        let conn = self.conn.lock();
        let now = ts(&Utc::now());
        conn.execute(
            r#"INSERT INTO vms (vm_id, name, description, vcpu_count, memory_mb, kernel_path, status, owner, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)"#,
            params![
                vm_id,
                new.name,
                new.description,
                new.vcpu_count,
                new.memory_mb,
                new.kernel_path,
                VmStatus::Pending.as_str(),
                new.owner,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Self::vm_by_id(&conn, id)?.ok_or_else(|| Error::VmNotFound(vm_id.to_string()))
    }

    pub fn get_vm(&self, id: i64) -> Result<Option<Vm>> {
        let conn = self.conn.lock();
        Self::vm_by_id(&conn, id)
    }

    pub fn get_vm_by_public_id(&self, vm_id: &str) -> Result<Option<Vm>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM vms WHERE vm_id = ?1", VM_COLUMNS),
            params![vm_id],
            Self::row_to_vm,
        )
        .optional()
        .map_err(Into::into)
    }

    /// One page of an owner's VMs, newest first, plus the owner's total
    pub fn list_vms_by_owner(&self, owner: &str, offset: usize, limit: usize) -> Result<(Vec<Vm>, usize)> {
        let conn = self.conn.lock();
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM vms WHERE owner = ?1",
            params![owner],
            |row| row.get(0),
        )?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM vms WHERE owner = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
            VM_COLUMNS
        ))?;
        let vms = stmt
            .query_map(params![owner, limit as i64, offset as i64], Self::row_to_vm)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok((vms, total as usize))
    }

    pub fn list_vms_by_status(&self, statuses: &[VmStatus]) -> Result<Vec<Vm>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM vms WHERE status IN ({}) ORDER BY id",
            VM_COLUMNS,
            placeholders(1, statuses.len())
        ))?;
        let vms = stmt
            .query_map(params_from_iter(statuses.iter().map(|s| s.as_str())), Self::row_to_vm)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(vms)
    }

    pub fn list_vms(&self) -> Result<Vec<Vm>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM vms ORDER BY id", VM_COLUMNS))?;
        let vms = stmt
            .query_map([], Self::row_to_vm)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(vms)
    }

    /// Edit name and/or description. Lifecycle columns are never touched.
    pub fn update_vm_details(&self, id: i64, name: Option<&str>, description: Option<&str>) -> Result<Vm> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            r#"UPDATE vms SET name = COALESCE(?1, name), description = COALESCE(?2, description), updated_at = ?3
               WHERE id = ?4"#,
            params![name, description, ts(&Utc::now()), id],
        )?;
        if rows == 0 {
            return Err(Error::VmNotFound(id.to_string()));
        }
        Self::vm_by_id(&conn, id)?.ok_or_else(|| Error::VmNotFound(id.to_string()))
    }

    /// Compare-and-set status change.
    ///
    /// Moves the VM to `next` only if its current status is one of `expected`,
    /// applying `patch` in the same statement.
    pub fn transition_vm(&self, id: i64, expected: &[VmStatus], next: VmStatus, patch: &VmPatch) -> Result<Vm> {
        let mut sets = vec!["status = ?".to_string(), "updated_at = ?".to_string()];
        let mut values: Vec<Value> = vec![
            Value::Text(next.as_str().to_string()),
            Value::Text(ts(&Utc::now())),
        ];
        let fields = [
            ("ip_address", &patch.ip_address),
            ("host", &patch.host),
            ("kernel_path", &patch.kernel_path),
            ("rootfs_path", &patch.rootfs_path),
            ("error_message", &patch.error_message),
        ];
        for (column, field) in fields {
            if let Some(value) = field {
                sets.push(format!("{} = ?", column));
                values.push(value.clone().map(Value::Text).unwrap_or(Value::Null));
            }
        }
        values.push(Value::Integer(id));
        values.extend(expected.iter().map(|s| Value::Text(s.as_str().to_string())));

        let sql = format!(
            "UPDATE vms SET {} WHERE id = ? AND status IN ({})",
            sets.join(", "),
            vec!["?"; expected.len()].join(", ")
        );

        let conn = self.conn.lock();
        let rows = conn.execute(&sql, params_from_iter(values.iter()))?;
        let vm = Self::vm_by_id(&conn, id)?.ok_or_else(|| Error::VmNotFound(id.to_string()))?;
        if rows == 0 {
            return Err(Error::InvalidTransition {
                vm_id: vm.vm_id,
                current: vm.status,
                next,
            });
        }
        Ok(vm)
    }

    pub fn delete_vm(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM vms WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn vm_by_id(conn: &Connection, id: i64) -> Result<Option<Vm>> {
        conn.query_row(
            &format!("SELECT {} FROM vms WHERE id = ?1", VM_COLUMNS),
            params![id],
            Self::row_to_vm,
        )
        .optional()
        .map_err(Into::into)
    }

    fn row_to_vm(row: &rusqlite::Row) -> rusqlite::Result<Vm> {
        let status: String = row.get(10)?;
        Ok(Vm {
            id: row.get(0)?,
            vm_id: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            vcpu_count: row.get(4)?,
            memory_mb: row.get(5)?,
            ip_address: row.get(6)?,
            host: row.get(7)?,
            kernel_path: row.get(8)?,
            rootfs_path: row.get(9)?,
            status: status.parse().map_err(|e| conversion_err(10, e))?,
            error_message: row.get(11)?,
            owner: row.get(12)?,
            created_at: parse_ts(13, row.get(13)?)?,
            updated_at: parse_ts(14, row.get(14)?)?,
        })
    }

    // ===== IP pools =====

    /// Create a pool and seed one free row per host address
    pub fn insert_pool(
        &self,
        name: &str,
        cidr: &str,
        gateway: &str,
        description: Option<&str>,
        hosts: &[Ipv4Addr],
    ) -> Result<IpPool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: Option<i64> = tx
            .query_row("SELECT id FROM ip_pools WHERE name = ?1", params![name], |row| row.get(0))
            .optional()?;
        if exists.is_some() {
            return Err(Error::PoolAlreadyExists(name.to_string()));
        }

        tx.execute(
            r#"INSERT INTO ip_pools (name, cidr, gateway, is_active, description, created_at)
               VALUES (?1, ?2, ?3, 1, ?4, ?5)"#,
            params![name, cidr, gateway, description, ts(&Utc::now())],
        )?;
        let pool_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO ip_allocations (pool_id, ip_address, ip_order, is_active) VALUES (?1, ?2, ?3, 0)",
            )?;
            for host in hosts {
                stmt.execute(params![pool_id, host.to_string(), u32::from(*host)])?;
            }
        }
        let pool = Self::pool_by_id(&tx, pool_id)?.ok_or_else(|| Error::UnknownPool(name.to_string()))?;
        tx.commit()?;
        Ok(pool)
    }

    pub fn get_pool_by_name(&self, name: &str) -> Result<Option<IpPool>> {
        let conn = self.conn.lock();
        Self::pool_by_name(&conn, name)
    }

    pub fn list_pools(&self) -> Result<Vec<IpPool>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM ip_pools ORDER BY name", POOL_COLUMNS))?;
        let pools = stmt
            .query_map([], Self::row_to_pool)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(pools)
    }

    pub fn set_pool_active(&self, name: &str, active: bool) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE ip_pools SET is_active = ?1 WHERE name = ?2",
            params![active, name],
        )?;
        Ok(rows > 0)
    }

    /// `(total, allocated)` address counts of a pool
    pub fn pool_counts(&self, pool_id: i64) -> Result<(usize, usize)> {
        let conn = self.conn.lock();
        Self::counts(&conn, pool_id)
    }

    pub fn list_allocations(&self, pool_id: i64, active_only: bool) -> Result<Vec<IpAllocation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM ip_allocations WHERE pool_id = ?1 AND (?2 = 0 OR is_active = 1) ORDER BY ip_order",
            ALLOCATION_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![pool_id, active_only], Self::row_to_allocation)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Bind the lowest free address of an active pool to `vm_id`.
    ///
    /// Returns the VM's current allocation instead if it already holds one.
    pub fn allocate_address(&self, pool_name: &str, vm_id: &str) -> Result<(IpPool, IpAllocation)> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let pool = match Self::pool_by_name(&tx, pool_name)? {
            Some(pool) if pool.is_active => pool,
            _ => return Err(Error::UnknownPool(pool_name.to_string())),
        };

        if let Some(existing) = Self::active_allocation(&tx, vm_id)? {
            let owner_pool = Self::pool_by_id(&tx, existing.pool_id)?
                .ok_or_else(|| Error::UnknownPool(existing.pool_id.to_string()))?;
            return Ok((owner_pool, existing));
        }

        let free: Option<i64> = tx
            .query_row(
                "SELECT id FROM ip_allocations WHERE pool_id = ?1 AND is_active = 0 ORDER BY ip_order LIMIT 1",
                params![pool.id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(row_id) = free else {
            let (total, allocated) = Self::counts(&tx, pool.id)?;
            return Err(Error::Exhausted {
                pool: pool.name,
                allocated,
                total,
            });
        };

        tx.execute(
            r#"UPDATE ip_allocations SET is_active = 1, vm_id = ?1, allocated_at = ?2, released_at = NULL
               WHERE id = ?3 AND is_active = 0"#,
            params![vm_id, ts(&Utc::now()), row_id],
        )?;
        let allocation = tx.query_row(
            &format!("SELECT {} FROM ip_allocations WHERE id = ?1", ALLOCATION_COLUMNS),
            params![row_id],
            Self::row_to_allocation,
        )?;
        tx.commit()?;
        Ok((pool, allocation))
    }

    /// Deactivate whatever is bound to `vm_id`; returns the released addresses
    pub fn release_addresses(&self, vm_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"UPDATE ip_allocations SET is_active = 0, released_at = ?1
               WHERE vm_id = ?2 AND is_active = 1
               RETURNING ip_address"#,
        )?;
        let released = stmt
            .query_map(params![ts(&Utc::now()), vm_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(released)
    }

    pub fn get_active_allocation(&self, vm_id: &str) -> Result<Option<(IpPool, IpAllocation)>> {
        let conn = self.conn.lock();
        let Some(allocation) = Self::active_allocation(&conn, vm_id)? else {
            return Ok(None);
        };
        let pool = Self::pool_by_id(&conn, allocation.pool_id)?
            .ok_or_else(|| Error::UnknownPool(allocation.pool_id.to_string()))?;
        Ok(Some((pool, allocation)))
    }

    fn active_allocation(conn: &Connection, vm_id: &str) -> Result<Option<IpAllocation>> {
        conn.query_row(
            &format!(
                "SELECT {} FROM ip_allocations WHERE vm_id = ?1 AND is_active = 1",
                ALLOCATION_COLUMNS
            ),
            params![vm_id],
            Self::row_to_allocation,
        )
        .optional()
        .map_err(Into::into)
    }

    fn counts(conn: &Connection, pool_id: i64) -> Result<(usize, usize)> {
        let (total, allocated): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(is_active), 0) FROM ip_allocations WHERE pool_id = ?1",
            params![pool_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((total as usize, allocated as usize))
    }

    fn pool_by_name(conn: &Connection, name: &str) -> Result<Option<IpPool>> {
        conn.query_row(
            &format!("SELECT {} FROM ip_pools WHERE name = ?1", POOL_COLUMNS),
            params![name],
            Self::row_to_pool,
        )
        .optional()
        .map_err(Into::into)
    }

    fn pool_by_id(conn: &Connection, id: i64) -> Result<Option<IpPool>> {
        conn.query_row(
            &format!("SELECT {} FROM ip_pools WHERE id = ?1", POOL_COLUMNS),
            params![id],
            Self::row_to_pool,
        )
        .optional()
        .map_err(Into::into)
    }

    fn row_to_pool(row: &rusqlite::Row) -> rusqlite::Result<IpPool> {
        Ok(IpPool {
            id: row.get(0)?,
            name: row.get(1)?,
            cidr: row.get(2)?,
            gateway: row.get(3)?,
            is_active: row.get(4)?,
            description: row.get(5)?,
            created_at: parse_ts(6, row.get(6)?)?,
        })
    }

    fn row_to_allocation(row: &rusqlite::Row) -> rusqlite::Result<IpAllocation> {
        Ok(IpAllocation {
            id: row.get(0)?,
            pool_id: row.get(1)?,
            ip_address: row.get(2)?,
            vm_id: row.get(3)?,
            is_active: row.get(4)?,
            allocated_at: parse_opt_ts(5, row.get(5)?)?,
            released_at: parse_opt_ts(6, row.get(6)?)?,
        })
    }

    // ===== Tasks =====

    pub fn insert_task(&self, task: &Task) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT INTO tasks (id, kind, vm_id, params, status, attempts, max_attempts, not_before, created_at, started_at, completed_at, last_error)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"#,
            params![
                task.id,
                task.kind.as_str(),
                task.vm_id,
                serde_json::to_string(&task.params)?,
                task.status.as_str(),
                task.attempts,
                task.max_attempts,
                ts(&task.not_before),
                ts(&task.created_at),
                task.started_at.as_ref().map(ts),
                task.completed_at.as_ref().map(ts),
                task.last_error,
            ],
        )?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.conn.lock();
        Self::task_by_id(&conn, id)
    }

    /// Most recent tasks first, optionally filtered by status
    pub fn list_tasks(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at DESC LIMIT ?2",
            TASK_COLUMNS
        ))?;
        let tasks = stmt
            .query_map(params![status.map(|s| s.as_str()), limit as i64], Self::row_to_task)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    pub fn list_tasks_for_vm(&self, vm_id: i64) -> Result<Vec<Task>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE vm_id = ?1 ORDER BY created_at",
            TASK_COLUMNS
        ))?;
        let tasks = stmt
            .query_map(params![vm_id], Self::row_to_task)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Atomically take the oldest due pending task and mark it running
    pub fn claim_next_task(&self, now: DateTime<Utc>) -> Result<Option<Task>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = ts(&now);

        let next: Option<String> = tx
            .query_row(
                r#"SELECT id FROM tasks WHERE status = 'Pending' AND not_before <= ?1
                   ORDER BY not_before, created_at LIMIT 1"#,
                params![now],
                |row| row.get(0),
            )
            .optional()?;
        let Some(id) = next else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE tasks SET status = 'Running', attempts = attempts + 1, started_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        let task = Self::task_by_id(&tx, &id)?;
        tx.commit()?;
        Ok(task)
    }

    /// Finish a task; `note` records why a completed task did nothing
    pub fn complete_task(&self, id: &str, note: Option<&str>) -> Result<()> {
        self.finish_task(id, TaskStatus::Completed, note)
    }

    pub fn fail_task(&self, id: &str, error: &str) -> Result<()> {
        self.finish_task(id, TaskStatus::Failed, Some(error))
    }

    /// Put a running task back in the queue, due at `not_before`
    pub fn retry_task(&self, id: &str, not_before: DateTime<Utc>, error: &str) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE tasks SET status = 'Pending', not_before = ?1, last_error = ?2 WHERE id = ?3",
            params![ts(&not_before), error, id],
        )?;
        if rows == 0 {
            return Err(Error::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Fail running tasks whose worker went away before `cutoff`
    pub fn fail_abandoned_tasks(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let abandoned = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM tasks WHERE status = 'Running' AND started_at < ?1",
                TASK_COLUMNS
            ))?;
            let tasks = stmt
                .query_map(params![ts(&cutoff)], Self::row_to_task)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            tasks
        };
        tx.execute(
            r#"UPDATE tasks SET status = 'Failed', completed_at = ?1, last_error = 'abandoned by worker'
               WHERE status = 'Running' AND started_at < ?2"#,
            params![ts(&Utc::now()), ts(&cutoff)],
        )?;
        tx.commit()?;
        Ok(abandoned)
    }

    fn finish_task(&self, id: &str, status: TaskStatus, error: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE tasks SET status = ?1, completed_at = ?2, last_error = COALESCE(?3, last_error) WHERE id = ?4",
            params![status.as_str(), ts(&Utc::now()), error, id],
        )?;
        if rows == 0 {
            return Err(Error::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    fn task_by_id(conn: &Connection, id: &str) -> Result<Option<Task>> {
        conn.query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            params![id],
            Self::row_to_task,
        )
        .optional()
        .map_err(Into::into)
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
        let kind: String = row.get(1)?;
        let params_json: String = row.get(3)?;
        let status: String = row.get(4)?;
        Ok(Task {
            id: row.get(0)?,
            kind: kind.parse().map_err(|e| conversion_err(1, e))?,
            vm_id: row.get(2)?,
            params: serde_json::from_str(&params_json).map_err(|e| conversion_err(3, e))?,
            status: status.parse().map_err(|e| conversion_err(4, e))?,
            attempts: row.get(5)?,
            max_attempts: row.get(6)?,
            not_before: parse_ts(7, row.get(7)?)?,
            created_at: parse_ts(8, row.get(8)?)?,
            started_at: parse_opt_ts(9, row.get(9)?)?,
            completed_at: parse_opt_ts(10, row.get(10)?)?,
            last_error: row.get(11)?,
        })
    }
}

/// Fixed-width UTC timestamps so text comparison matches time order
fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn parse_opt_ts(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(idx, s)).transpose()
}

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn placeholders(start: usize, n: usize) -> String {
    (start..start + n)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}
