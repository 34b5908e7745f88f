//! SQLite state store: instance records and the status audit trail.
//!
//! Status is written in exactly one place, [`SqliteStore::apply_transition`],
//! and only on behalf of a task that currently holds its lease.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use hostplane_core::{
    now_millis, Error, Instance, InstancePatch, InstanceStatus, NewInstance, ResourceNames,
    ResourceSizing, Result, TaskRecord, TaskStatus,
};

use crate::schema::{INSTANCE_SCHEMA_SQL, TASK_SCHEMA_SQL};
use crate::types::TransitionRecord;

pub struct SqliteStore {
    pub(crate) conn: Mutex<Connection>,
    db_path: PathBuf,
}

pub(crate) fn db_err(e: rusqlite::Error) -> Error {
    Error::Database(e.to_string())
}

/// Conversion failure for a column holding an unexpected value.
pub(crate) fn bad_column(row: &rusqlite::Row<'_>, name: &str, msg: String) -> rusqlite::Error {
    let idx = row.as_ref().column_index(name).unwrap_or(0);
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

pub(crate) fn status_column(row: &rusqlite::Row<'_>, name: &str) -> rusqlite::Result<InstanceStatus> {
    let raw: String = row.get(name)?;
    InstanceStatus::parse(&raw)
        .ok_or_else(|| bad_column(row, name, format!("unknown instance status {:?}", raw)))
}

impl SqliteStore {
    /// Open or create the store. The file will be `db_dir/hostplane.db`.
    pub fn open(db_dir: impl AsRef<Path>) -> Result<Self> {
        let db_dir = db_dir.as_ref();
        std::fs::create_dir_all(db_dir).map_err(|e| Error::Storage(e.to_string()))?;
        let db_path = db_dir.join("hostplane.db");

        let conn = Self::create_connection(&db_path)?;
        Self::init_schema(&conn)?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path,
        };

        info!(
            instances = store.count_instances()?,
            path = %store.db_path.display(),
            "SqliteStore initialized"
        );
        Ok(store)
    }

    fn create_connection(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path).map_err(db_err)?;
        // The server and worker processes share the file.
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(db_err)?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        let full_schema = format!("{}\n{}", INSTANCE_SCHEMA_SQL, TASK_SCHEMA_SQL);
        conn.execute_batch(&full_schema)
            .map_err(|e| Error::Database(format!("Schema init failed: {}", e)))?;
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Fold the write-ahead log back into the database file.
    pub fn checkpoint(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);").map_err(db_err)
    }

    // ---------------------------------------------------------------
    // Instances
    // ---------------------------------------------------------------

    /// Insert a `pending` instance with names derived from a fresh id.
    pub fn create_instance(&self, req: &NewInstance) -> Result<Instance> {
        req.validate()?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        let names = ResourceNames::for_instance(&id);
        let now = now_millis();

        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO instances (id, tenant_id, name, status, version, cpu_millis, memory_mb,
                storage_gb, created_at, updated_at, deployment_name, service_name, volume_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, ?10, ?11, ?12)",
        )
        .map_err(db_err)?
        .execute(params![
            id,
            req.tenant_id.trim(),
            req.name.trim(),
            InstanceStatus::Pending.as_str(),
            req.version,
            req.sizing.cpu_millis,
            req.sizing.memory_mb,
            req.sizing.storage_gb,
            now,
            names.deployment,
            names.service,
            names.volume,
        ])
        .map_err(db_err)?;

        debug!(instance_id = %id, tenant_id = %req.tenant_id, "Instance recorded");
        Ok(Instance {
            id,
            tenant_id: req.tenant_id.trim().to_string(),
            name: req.name.trim().to_string(),
            status: InstanceStatus::Pending,
            version: req.version.clone(),
            sizing: req.sizing,
            created_at: now,
            updated_at: now,
            last_health_check: None,
            deployment_name: names.deployment,
            service_name: names.service,
            volume_name: names.volume,
        })
    }

    pub fn get_instance(&self, id: &str) -> Result<Option<Instance>> {
        let conn = self.conn.lock();
        Self::load_instance(&conn, id)
    }

    /// Like [`get_instance`](Self::get_instance) but a missing row is `NotFound`.
    pub fn require_instance(&self, id: &str) -> Result<Instance> {
        self.get_instance(id)?
            .ok_or_else(|| Error::NotFound(format!("instance {}", id)))
    }

    fn load_instance(conn: &Connection, id: &str) -> Result<Option<Instance>> {
        conn.prepare_cached("SELECT * FROM instances WHERE id = ?1")
            .map_err(db_err)?
            .query_row(params![id], Self::row_to_instance)
            .optional()
            .map_err(db_err)
    }

    /// Instances, newest first, optionally filtered by tenant and status.
    pub fn list_instances(
        &self,
        tenant_id: Option<&str>,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<Instance>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM instances
                 WHERE (?1 IS NULL OR tenant_id = ?1) AND (?2 IS NULL OR status = ?2)
                 ORDER BY created_at DESC, id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![tenant_id, status.map(|s| s.as_str())], Self::row_to_instance)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn count_instances(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM instances", [], |row| row.get(0))
            .map_err(db_err)
    }

    // ---------------------------------------------------------------
    // Transitions
    // ---------------------------------------------------------------

    /// Record `to` as the outcome of `task` against `instance_id`.
    ///
    /// The task row must be `started`, hold the lease token carried by
    /// `task`, and target `instance_id`. Its kind must permit the move and
    /// the lifecycle table must allow `from -> to`. Anything else is
    /// `InvalidTransition` and leaves the row untouched.
    pub fn apply_transition(
        &self,
        task: &TaskRecord,
        instance_id: &str,
        to: InstanceStatus,
        patch: InstancePatch,
    ) -> Result<Instance> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let stored = crate::queue::load_task(&tx, &task.id)?
            .ok_or_else(|| Error::InvalidTransition(format!("task {} is not recorded", task.id)))?;
        if stored.status != TaskStatus::Started {
            return Err(Error::InvalidTransition(format!(
                "task {} is {}, not started",
                stored.id,
                stored.status.as_str()
            )));
        }
        if task.lease_token.is_none() || stored.lease_token != task.lease_token {
            return Err(Error::InvalidTransition(format!(
                "task {} does not hold its lease",
                stored.id
            )));
        }
        if stored.instance_id.as_deref() != Some(instance_id) {
            return Err(Error::InvalidTransition(format!(
                "task {} does not target instance {}",
                stored.id, instance_id
            )));
        }

        let current = Self::load_instance(&tx, instance_id)?
            .ok_or_else(|| Error::NotFound(format!("instance {}", instance_id)))?;
        if !stored.kind.permits(current.status, to) {
            return Err(Error::InvalidTransition(format!(
                "{} task may not move instance {} from {} to {}",
                stored.kind.name(),
                instance_id,
                current.status,
                to
            )));
        }

        let now = now_millis();
        tx.execute(
            "UPDATE instances SET status = ?2, updated_at = ?3,
                version = COALESCE(?4, version),
                last_health_check = COALESCE(?5, last_health_check)
             WHERE id = ?1",
            params![instance_id, to.as_str(), now, patch.version, patch.last_health_check],
        )
        .map_err(db_err)?;
        tx.execute(
            "INSERT INTO instance_transitions (instance_id, from_status, to_status, task_id, at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![instance_id, current.status.as_str(), to.as_str(), stored.id, now],
        )
        .map_err(db_err)?;

        let updated = Self::load_instance(&tx, instance_id)?
            .ok_or_else(|| Error::NotFound(format!("instance {}", instance_id)))?;
        tx.commit().map_err(db_err)?;

        info!(
            instance_id = %instance_id,
            task_id = %stored.id,
            from = %current.status,
            to = %to,
            "Instance transitioned"
        );
        Ok(updated)
    }

    /// Audit trail for an instance, oldest first.
    pub fn list_transitions(&self, instance_id: &str) -> Result<Vec<TransitionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM instance_transitions WHERE instance_id = ?1 ORDER BY id ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![instance_id], |row| {
                Ok(TransitionRecord {
                    instance_id: row.get("instance_id")?,
                    from: status_column(row, "from_status")?,
                    to: status_column(row, "to_status")?,
                    task_id: row.get("task_id")?,
                    at: row.get("at")?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    // ---------------------------------------------------------------
    // Row Mapping Helpers
    // ---------------------------------------------------------------

    fn row_to_instance(row: &rusqlite::Row<'_>) -> rusqlite::Result<Instance> {
        Ok(Instance {
            id: row.get("id")?,
            tenant_id: row.get("tenant_id")?,
            name: row.get("name")?,
            status: status_column(row, "status")?,
            version: row.get("version")?,
            sizing: ResourceSizing {
                cpu_millis: row.get("cpu_millis")?,
                memory_mb: row.get("memory_mb")?,
                storage_gb: row.get("storage_gb")?,
            },
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            last_health_check: row.get("last_health_check")?,
            deployment_name: row.get("deployment_name")?,
            service_name: row.get("service_name")?,
            volume_name: row.get("volume_name")?,
        })
    }
}
