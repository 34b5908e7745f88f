//! Database schema SQL.

/// Instance records and their status audit trail.
pub const INSTANCE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS instances (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    version TEXT NOT NULL,
    cpu_millis INTEGER NOT NULL,
    memory_mb INTEGER NOT NULL,
    storage_gb INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    last_health_check INTEGER,
    deployment_name TEXT NOT NULL UNIQUE,
    service_name TEXT NOT NULL UNIQUE,
    volume_name TEXT NOT NULL UNIQUE
);

CREATE INDEX IF NOT EXISTS idx_instances_tenant ON instances(tenant_id);
CREATE INDEX IF NOT EXISTS idx_instances_status ON instances(status);

CREATE TABLE IF NOT EXISTS instance_transitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    instance_id TEXT NOT NULL REFERENCES instances(id) ON DELETE CASCADE,
    from_status TEXT NOT NULL,
    to_status TEXT NOT NULL,
    task_id TEXT NOT NULL,
    at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transitions_instance ON instance_transitions(instance_id);
"#;

/// Durable task queue. `seq` gives FIFO order within a queue.
pub const TASK_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    kind_json TEXT NOT NULL,
    kind_name TEXT NOT NULL,
    category TEXT NOT NULL,
    queue TEXT NOT NULL,
    instance_id TEXT,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 0,
    scheduled_at INTEGER NOT NULL,
    visible_at INTEGER NOT NULL,
    started_at INTEGER,
    finished_at INTEGER,
    lease_token TEXT,
    locked_until INTEGER,
    worker_id TEXT,
    result_json TEXT,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(queue, status, visible_at);
CREATE INDEX IF NOT EXISTS idx_tasks_instance ON tasks(instance_id, status);
CREATE INDEX IF NOT EXISTS idx_tasks_finished ON tasks(status, finished_at);
"#;
