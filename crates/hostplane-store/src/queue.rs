//! Durable task queue on the `tasks` table.
//!
//! Delivery is at-least-once. A claim leases the row until `locked_until`;
//! the worker acknowledges with [`complete`](SqliteStore::complete) or
//! [`fail`](SqliteStore::fail) only after the task body returns. A lease
//! that runs out makes the row claimable again.
//!
//! Tasks for one instance never run concurrently: a row is not claimable
//! while another row for the same instance holds a live lease.

use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, warn};

use hostplane_core::{now_millis, Error, Result, TaskCategory, TaskKind, TaskRecord, TaskStatus};

use crate::sqlite::{bad_column, db_err, SqliteStore};
use crate::types::QueueDepth;

pub(crate) fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let kind_json: String = row.get("kind_json")?;
    let kind: TaskKind = serde_json::from_str(&kind_json)
        .map_err(|e| bad_column(row, "kind_json", e.to_string()))?;
    let category: String = row.get("category")?;
    let status: String = row.get("status")?;
    let result_json: Option<String> = row.get("result_json")?;

    Ok(TaskRecord {
        id: row.get("id")?,
        category: TaskCategory::parse(&category)
            .ok_or_else(|| bad_column(row, "category", format!("unknown category {:?}", category)))?,
        kind,
        queue: row.get("queue")?,
        instance_id: row.get("instance_id")?,
        status: TaskStatus::parse(&status)
            .ok_or_else(|| bad_column(row, "status", format!("unknown task status {:?}", status)))?,
        attempts: row.get("attempts")?,
        max_retries: row.get("max_retries")?,
        scheduled_at: row.get("scheduled_at")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        result: result_json.and_then(|s| serde_json::from_str(&s).ok()),
        error: row.get("error")?,
        worker_id: row.get("worker_id")?,
        lease_token: row.get("lease_token")?,
    })
}

pub(crate) fn load_task(conn: &Connection, id: &str) -> Result<Option<TaskRecord>> {
    conn.prepare_cached("SELECT * FROM tasks WHERE id = ?1")
        .map_err(db_err)?
        .query_row(params![id], row_to_task)
        .optional()
        .map_err(db_err)
}

impl SqliteStore {
    /// Persist a pending task on `queue`, visible immediately.
    pub fn enqueue(&self, kind: &TaskKind, queue: &str, max_retries: u32) -> Result<TaskRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_millis();
        let kind_json = serde_json::to_string(kind)?;

        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO tasks (id, kind_json, kind_name, category, queue, instance_id, status,
                attempts, max_retries, scheduled_at, visible_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?9)",
        )
        .map_err(db_err)?
        .execute(params![
            id,
            kind_json,
            kind.name(),
            kind.category().as_str(),
            queue,
            kind.instance_id(),
            TaskStatus::Pending.as_str(),
            max_retries,
            now,
        ])
        .map_err(db_err)?;

        debug!(task_id = %id, kind = kind.name(), queue = %queue, "Task enqueued");
        load_task(&conn, &id)?.ok_or_else(|| Error::Internal(format!("task {} vanished", id)))
    }

    /// Lease the oldest deliverable task from `queues` (all queues when empty).
    /// `lease_for` sizes the lease from the claimed task's category.
    pub fn claim_next<F>(
        &self,
        queues: &[String],
        worker_id: &str,
        lease_for: F,
    ) -> Result<Option<TaskRecord>>
    where
        F: Fn(TaskCategory) -> Duration,
    {
        self.claim_next_at(queues, worker_id, lease_for, now_millis())
    }

    fn claim_next_at<F>(
        &self,
        queues: &[String],
        worker_id: &str,
        lease_for: F,
        now: i64,
    ) -> Result<Option<TaskRecord>>
    where
        F: Fn(TaskCategory) -> Duration,
    {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let queue_filter = if queues.is_empty() {
            String::new()
        } else {
            let marks: Vec<String> = (0..queues.len()).map(|i| format!("?{}", i + 2)).collect();
            format!("AND t.queue IN ({})", marks.join(", "))
        };
        let sql = format!(
            "SELECT * FROM tasks t
             WHERE ((t.status = 'pending' AND t.visible_at <= ?1)
                    OR (t.status = 'started' AND t.locked_until < ?1))
               {}
               AND (t.instance_id IS NULL OR NOT EXISTS (
                    SELECT 1 FROM tasks o
                    WHERE o.instance_id = t.instance_id AND o.id != t.id
                      AND o.status = 'started' AND o.locked_until >= ?1))
             ORDER BY t.seq ASC
             LIMIT 1",
            queue_filter
        );
        let mut args: Vec<SqlValue> = vec![SqlValue::Integer(now)];
        args.extend(queues.iter().map(|q| SqlValue::Text(q.clone())));

        let candidate = tx
            .prepare_cached(&sql)
            .map_err(db_err)?
            .query_row(params_from_iter(args.iter()), row_to_task)
            .optional()
            .map_err(db_err)?;
        let Some(candidate) = candidate else {
            return Ok(None);
        };

        if candidate.status == TaskStatus::Started {
            warn!(
                task_id = %candidate.id,
                previous_worker = candidate.worker_id.as_deref().unwrap_or("-"),
                attempts = candidate.attempts,
                "Lease expired, redelivering task"
            );
        }

        let token = uuid::Uuid::new_v4().to_string();
        let lease = lease_for(candidate.category);
        let locked_until = now.saturating_add(lease.as_millis() as i64);
        tx.execute(
            "UPDATE tasks SET status = 'started', attempts = attempts + 1, lease_token = ?2,
                locked_until = ?3, started_at = ?4, worker_id = ?5
             WHERE id = ?1",
            params![candidate.id, token, locked_until, now, worker_id],
        )
        .map_err(db_err)?;

        let claimed = load_task(&tx, &candidate.id)?
            .ok_or_else(|| Error::Internal(format!("task {} vanished", candidate.id)))?;
        tx.commit().map_err(db_err)?;
        Ok(Some(claimed))
    }

    /// Acknowledge success. Fails with `Conflict` if the lease was lost.
    pub fn complete(&self, task: &TaskRecord, result: serde_json::Value) -> Result<()> {
        let result_json = serde_json::to_string(&result)?;
        let conn = self.conn.lock();
        let updated = conn
            .execute(
                "UPDATE tasks SET status = 'succeeded', finished_at = ?3, result_json = ?4,
                    error = NULL, lease_token = NULL, locked_until = NULL
                 WHERE id = ?1 AND lease_token = ?2 AND status = 'started'",
                params![task.id, task.lease_token, now_millis(), result_json],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(Error::Conflict(format!("task {} lease lost", task.id)));
        }
        Ok(())
    }

    /// Acknowledge failure. With `retry_at` the task returns to the queue
    /// and becomes visible at that time; otherwise it is finished as failed.
    pub fn fail(&self, task: &TaskRecord, error: &str, retry_at: Option<i64>) -> Result<()> {
        let conn = self.conn.lock();
        let updated = match retry_at {
            Some(at) => conn.execute(
                "UPDATE tasks SET status = 'pending', visible_at = ?3, error = ?4,
                    lease_token = NULL, locked_until = NULL
                 WHERE id = ?1 AND lease_token = ?2 AND status = 'started'",
                params![task.id, task.lease_token, at, error],
            ),
            None => conn.execute(
                "UPDATE tasks SET status = 'failed', finished_at = ?3, error = ?4,
                    lease_token = NULL, locked_until = NULL
                 WHERE id = ?1 AND lease_token = ?2 AND status = 'started'",
                params![task.id, task.lease_token, now_millis(), error],
            ),
        }
        .map_err(db_err)?;
        if updated == 0 {
            return Err(Error::Conflict(format!("task {} lease lost", task.id)));
        }
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<TaskRecord>> {
        let conn = self.conn.lock();
        load_task(&conn, id)
    }

    /// Most recent tasks for an instance first.
    pub fn list_tasks_for_instance(&self, instance_id: &str, limit: usize) -> Result<Vec<TaskRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM tasks WHERE instance_id = ?1 ORDER BY seq DESC LIMIT ?2")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![instance_id, limit as i64], row_to_task)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Whether a task of `kind_name` is pending or running, for the given
    /// instance or, with `None`, for no instance.
    pub fn has_open_task(&self, instance_id: Option<&str>, kind_name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT EXISTS(SELECT 1 FROM tasks WHERE instance_id IS ?1 AND kind_name = ?2
                    AND status IN ('pending', 'started'))",
            )
            .map_err(db_err)?;
        let exists = stmt
            .query_row(params![instance_id, kind_name], |row| row.get(0))
            .map_err(db_err)?;
        Ok(exists)
    }

    /// Whether a pending or started task of an instance-lifecycle category
    /// (provisioning, lifecycle operation, migration) exists for `instance_id`.
    pub fn has_open_lifecycle_task(&self, instance_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT EXISTS(SELECT 1 FROM tasks WHERE instance_id = ?1
                    AND category IN (?2, ?3, ?4) AND status IN ('pending', 'started'))",
            )
            .map_err(db_err)?;
        let exists = stmt
            .query_row(
                params![
                    instance_id,
                    TaskCategory::Provisioning.as_str(),
                    TaskCategory::LifecycleOperation.as_str(),
                    TaskCategory::Migration.as_str(),
                ],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(exists)
    }

    /// Delete finished task records older than `cutoff` (epoch millis).
    pub fn purge_finished_tasks(&self, cutoff: i64) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM tasks WHERE status IN ('succeeded', 'failed') AND finished_at < ?1",
            params![cutoff],
        )
        .map_err(db_err)
    }

    /// Pending and started counts per queue that has any tasks.
    pub fn queue_depths(&self) -> Result<Vec<QueueDepth>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT queue,
                        SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN status = 'started' THEN 1 ELSE 0 END)
                 FROM tasks GROUP BY queue ORDER BY queue",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(QueueDepth {
                    queue: row.get(0)?,
                    pending: row.get::<_, i64>(1)? as u64,
                    started: row.get::<_, i64>(2)? as u64,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}
