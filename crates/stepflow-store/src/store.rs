use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use stepflow_core::definition::WorkflowDefinition;
use stepflow_core::error::{Result, StepflowError};
use stepflow_core::traits::WorkflowStore;
use stepflow_core::types::{Execution, StepRecord, Workflow};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS workflows (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        definition TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS executions (
        id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        correlation_id TEXT NOT NULL,
        status TEXT NOT NULL,
        inputs TEXT NOT NULL,
        outputs TEXT,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        total_duration_ms INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_executions_workflow
        ON executions(workflow_id, created_at);

    CREATE TABLE IF NOT EXISTS step_records (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        execution_id TEXT NOT NULL,
        step_id TEXT NOT NULL,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        status TEXT NOT NULL,
        inputs TEXT,
        outputs TEXT,
        error_reason TEXT,
        agent_id TEXT,
        method_id TEXT,
        parent_step_id TEXT,
        started_at TEXT,
        completed_at TEXT,
        duration_ms INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_step_records_execution
        ON step_records(execution_id, seq);
";

/// SQLite-backed persistence for workflows, executions, and step records.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StepflowError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // WAL lets the CLI read status while a run is writing
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        // A second process (`stepflow cancel`) may write while a run is active.
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StepflowError::Database(e.to_string()))
    }
}

fn db_err(e: rusqlite::Error) -> StepflowError {
    StepflowError::Database(e.to_string())
}

// Fixed-width so text ordering matches time ordering.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(ts)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StepflowError::Database(format!("bad timestamp '{}': {}", s, e)))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn to_json(v: &Value) -> String {
    v.to_string()
}

fn parse_opt_json(s: Option<String>) -> Result<Option<Value>> {
    s.as_deref()
        .map(serde_json::from_str::<Value>)
        .transpose()
        .map_err(StepflowError::from)
}

// Raw rows, decoded outside the rusqlite closures so conversion errors
// surface as StepflowError.

struct WorkflowRow {
    id: String,
    name: String,
    description: Option<String>,
    definition: String,
    created_at: String,
    updated_at: String,
}

const WORKFLOW_COLUMNS: &str = "id, name, description, definition, created_at, updated_at";

impl WorkflowRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            definition: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn decode(self) -> Result<Workflow> {
        let definition: WorkflowDefinition = serde_json::from_str(&self.definition)?;
        Ok(Workflow {
            id: self.id,
            name: self.name,
            description: self.description,
            definition,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

struct ExecutionRow {
    id: String,
    workflow_id: String,
    correlation_id: String,
    status: String,
    inputs: String,
    outputs: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    total_duration_ms: Option<i64>,
}

const EXECUTION_COLUMNS: &str = "id, workflow_id, correlation_id, status, inputs, outputs, \
     created_at, started_at, completed_at, total_duration_ms";

impl ExecutionRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            correlation_id: row.get(2)?,
            status: row.get(3)?,
            inputs: row.get(4)?,
            outputs: row.get(5)?,
            created_at: row.get(6)?,
            started_at: row.get(7)?,
            completed_at: row.get(8)?,
            total_duration_ms: row.get(9)?,
        })
    }

    fn decode(self) -> Result<Execution> {
        Ok(Execution {
            id: self.id,
            workflow_id: self.workflow_id,
            correlation_id: self.correlation_id,
            status: self.status.parse()?,
            inputs: serde_json::from_str(&self.inputs)?,
            outputs: parse_opt_json(self.outputs)?,
            created_at: parse_ts(&self.created_at)?,
            started_at: parse_opt_ts(self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            total_duration_ms: self.total_duration_ms.map(|ms| ms.max(0) as u64),
        })
    }
}

struct StepRow {
    id: String,
    execution_id: String,
    step_id: String,
    name: String,
    kind: String,
    status: String,
    inputs: Option<String>,
    outputs: Option<String>,
    error_reason: Option<String>,
    agent_id: Option<String>,
    method_id: Option<String>,
    parent_step_id: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    duration_ms: Option<i64>,
}

impl StepRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            execution_id: row.get(1)?,
            step_id: row.get(2)?,
            name: row.get(3)?,
            kind: row.get(4)?,
            status: row.get(5)?,
            inputs: row.get(6)?,
            outputs: row.get(7)?,
            error_reason: row.get(8)?,
            agent_id: row.get(9)?,
            method_id: row.get(10)?,
            parent_step_id: row.get(11)?,
            started_at: row.get(12)?,
            completed_at: row.get(13)?,
            duration_ms: row.get(14)?,
        })
    }

    fn decode(self) -> Result<StepRecord> {
        Ok(StepRecord {
            id: self.id,
            execution_id: self.execution_id,
            step_id: self.step_id,
            name: self.name,
            kind: self.kind,
            status: self.status.parse()?,
            inputs: parse_opt_json(self.inputs)?,
            outputs: parse_opt_json(self.outputs)?,
            error_reason: self.error_reason,
            agent_id: self.agent_id,
            method_id: self.method_id,
            parent_step_id: self.parent_step_id,
            started_at: parse_opt_ts(self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            duration_ms: self.duration_ms.map(|ms| ms.max(0) as u64),
        })
    }
}

impl WorkflowStore for SqliteStore {
    fn save_workflow(&self, workflow: &Workflow) -> BoxFuture<'_, Result<()>> {
        let workflow = workflow.clone();

        Box::pin(async move {
            let definition = serde_json::to_string(&workflow.definition)?;
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO workflows (id, name, description, definition, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    description = excluded.description,
                    definition = excluded.definition,
                    updated_at = excluded.updated_at",
                params![
                    workflow.id,
                    workflow.name,
                    workflow.description,
                    definition,
                    ts(&workflow.created_at),
                    ts(&workflow.updated_at),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn load_workflow(&self, id: &str) -> BoxFuture<'_, Result<Option<Workflow>>> {
        let id = id.to_string();

        Box::pin(async move {
            let row = {
                let conn = self.conn()?;
                conn.query_row(
                    &format!("SELECT {} FROM workflows WHERE id = ?1", WORKFLOW_COLUMNS),
                    params![id],
                    WorkflowRow::read,
                )
                .optional()
                .map_err(db_err)?
            };
            row.map(WorkflowRow::decode).transpose()
        })
    }

    fn list_workflows(&self, limit: usize) -> BoxFuture<'_, Result<Vec<Workflow>>> {
        Box::pin(async move {
            let rows = {
                let conn = self.conn()?;
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM workflows ORDER BY created_at DESC, rowid DESC LIMIT ?1",
                        WORKFLOW_COLUMNS
                    ))
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![limit as i64], WorkflowRow::read)
                    .map_err(db_err)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(db_err)?;
                rows
            };
            rows.into_iter().map(WorkflowRow::decode).collect()
        })
    }

    fn delete_workflow(&self, id: &str) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();

        Box::pin(async move {
            let conn = self.conn()?;
            let deleted = conn
                .execute("DELETE FROM workflows WHERE id = ?1", params![id])
                .map_err(db_err)?;
            Ok(deleted > 0)
        })
    }

    fn create_execution(&self, execution: &Execution) -> BoxFuture<'_, Result<()>> {
        let e = execution.clone();

        Box::pin(async move {
            let conn = self.conn()?;
            conn.execute(
                &format!(
                    "INSERT INTO executions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    EXECUTION_COLUMNS
                ),
                params![
                    e.id,
                    e.workflow_id,
                    e.correlation_id,
                    e.status.as_str(),
                    to_json(&e.inputs),
                    e.outputs.as_ref().map(to_json),
                    ts(&e.created_at),
                    opt_ts(&e.started_at),
                    opt_ts(&e.completed_at),
                    e.total_duration_ms.map(|ms| ms as i64),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn update_execution(&self, execution: &Execution) -> BoxFuture<'_, Result<bool>> {
        let e = execution.clone();

        Box::pin(async move {
            let conn = self.conn()?;
            // Terminal rows are final, whichever process wrote them.
            let updated = conn
                .execute(
                    "UPDATE executions SET status = ?2, outputs = ?3, started_at = ?4,
                        completed_at = ?5, total_duration_ms = ?6
                     WHERE id = ?1 AND status NOT IN ('success', 'error', 'cancelled')",
                    params![
                        e.id,
                        e.status.as_str(),
                        e.outputs.as_ref().map(to_json),
                        opt_ts(&e.started_at),
                        opt_ts(&e.completed_at),
                        e.total_duration_ms.map(|ms| ms as i64),
                    ],
                )
                .map_err(db_err)?;
            if updated > 0 {
                return Ok(true);
            }
            let exists = conn
                .query_row(
                    "SELECT 1 FROM executions WHERE id = ?1",
                    params![e.id],
                    |_| Ok(()),
                )
                .optional()
                .map_err(db_err)?
                .is_some();
            if !exists {
                return Err(StepflowError::NotFound(format!("execution '{}'", e.id)));
            }
            debug!(execution_id = %e.id, "Execution already terminal, update ignored");
            Ok(false)
        })
    }

    fn load_execution(&self, id: &str) -> BoxFuture<'_, Result<Option<Execution>>> {
        let id = id.to_string();

        Box::pin(async move {
            let row = {
                let conn = self.conn()?;
                conn.query_row(
                    &format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS),
                    params![id],
                    ExecutionRow::read,
                )
                .optional()
                .map_err(db_err)?
            };
            row.map(ExecutionRow::decode).transpose()
        })
    }

    fn list_executions(
        &self,
        workflow_id: &str,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Execution>>> {
        let workflow_id = workflow_id.to_string();

        Box::pin(async move {
            let rows = {
                let conn = self.conn()?;
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM executions WHERE workflow_id = ?1
                         ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                        EXECUTION_COLUMNS
                    ))
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![workflow_id, limit as i64], ExecutionRow::read)
                    .map_err(db_err)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(db_err)?;
                rows
            };
            rows.into_iter().map(ExecutionRow::decode).collect()
        })
    }

    fn create_step(&self, record: &StepRecord) -> BoxFuture<'_, Result<()>> {
        let r = record.clone();

        Box::pin(async move {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO step_records (id, execution_id, step_id, name, kind, status, inputs,
                    outputs, error_reason, agent_id, method_id, parent_step_id, started_at,
                    completed_at, duration_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    r.id,
                    r.execution_id,
                    r.step_id,
                    r.name,
                    r.kind,
                    r.status.as_str(),
                    r.inputs.as_ref().map(to_json),
                    r.outputs.as_ref().map(to_json),
                    r.error_reason,
                    r.agent_id,
                    r.method_id,
                    r.parent_step_id,
                    opt_ts(&r.started_at),
                    opt_ts(&r.completed_at),
                    r.duration_ms.map(|ms| ms as i64),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn update_step(&self, record: &StepRecord) -> BoxFuture<'_, Result<()>> {
        let r = record.clone();

        Box::pin(async move {
            let conn = self.conn()?;
            let updated = conn
                .execute(
                    "UPDATE step_records SET status = ?2, inputs = ?3, outputs = ?4,
                        error_reason = ?5, started_at = ?6, completed_at = ?7, duration_ms = ?8
                     WHERE id = ?1",
                    params![
                        r.id,
                        r.status.as_str(),
                        r.inputs.as_ref().map(to_json),
                        r.outputs.as_ref().map(to_json),
                        r.error_reason,
                        opt_ts(&r.started_at),
                        opt_ts(&r.completed_at),
                        r.duration_ms.map(|ms| ms as i64),
                    ],
                )
                .map_err(db_err)?;
            if updated == 0 {
                return Err(StepflowError::NotFound(format!("step record '{}'", r.id)));
            }
            Ok(())
        })
    }

    fn list_steps(&self, execution_id: &str) -> BoxFuture<'_, Result<Vec<StepRecord>>> {
        let execution_id = execution_id.to_string();

        Box::pin(async move {
            let rows = {
                let conn = self.conn()?;
                let mut stmt = conn
                    .prepare(
                        "SELECT id, execution_id, step_id, name, kind, status, inputs, outputs,
                            error_reason, agent_id, method_id, parent_step_id, started_at,
                            completed_at, duration_ms
                         FROM step_records
                         WHERE execution_id = ?1
                         ORDER BY seq ASC",
                    )
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![execution_id], StepRow::read)
                    .map_err(db_err)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(db_err)?;
                rows
            };
            rows.into_iter().map(StepRow::decode).collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepflow_core::definition::StepDefinition;
    use stepflow_core::types::{ExecutionStatus, StepStatus};

    fn sample_workflow() -> Workflow {
        Workflow::new(WorkflowDefinition::new(
            "wf",
            vec![StepDefinition::agent_call("s1", "a1", "m1")],
        ))
    }

    #[tokio::test]
    async fn test_workflow_roundtrip_and_delete() {
        let store = SqliteStore::in_memory().unwrap();
        let wf = sample_workflow();
        store.save_workflow(&wf).await.unwrap();

        let loaded = store.load_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "wf");
        assert_eq!(loaded.definition, wf.definition);

        assert!(store.delete_workflow(&wf.id).await.unwrap());
        assert!(!store.delete_workflow(&wf.id).await.unwrap());
        assert!(store.load_workflow(&wf.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_workflow_updates_in_place() {
        let store = SqliteStore::in_memory().unwrap();
        let mut wf = sample_workflow();
        store.save_workflow(&wf).await.unwrap();

        wf.name = "renamed".into();
        store.save_workflow(&wf).await.unwrap();

        let all = store.list_workflows(10).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "renamed");
    }

    #[tokio::test]
    async fn test_execution_lifecycle_persisted() {
        let store = SqliteStore::in_memory().unwrap();
        let mut exec = Execution::new("wf-1", json!({"q": 1}), "corr-1");
        store.create_execution(&exec).await.unwrap();

        exec.transition(ExecutionStatus::Running).unwrap();
        exec.outputs = Some(json!({"s1": {"x": 1}}));
        exec.transition(ExecutionStatus::Success).unwrap();
        assert!(store.update_execution(&exec).await.unwrap());

        let loaded = store.load_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Success);
        assert_eq!(loaded.inputs, json!({"q": 1}));
        assert_eq!(loaded.outputs, Some(json!({"s1": {"x": 1}})));
        assert_eq!(loaded.correlation_id, "corr-1");
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_execution_is_not_overwritten() {
        let store = SqliteStore::in_memory().unwrap();
        let mut exec = Execution::new("wf-1", json!({}), "c");
        store.create_execution(&exec).await.unwrap();
        exec.transition(ExecutionStatus::Running).unwrap();
        assert!(store.update_execution(&exec).await.unwrap());

        let mut cancelled = exec.clone();
        cancelled.transition(ExecutionStatus::Cancelled).unwrap();
        assert!(store.update_execution(&cancelled).await.unwrap());

        exec.outputs = Some(json!({"late": true}));
        exec.transition(ExecutionStatus::Success).unwrap();
        assert!(!store.update_execution(&exec).await.unwrap());

        let loaded = store.load_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Cancelled);
        assert_eq!(loaded.outputs, None);
    }

    #[tokio::test]
    async fn test_update_unknown_execution_is_not_found() {
        let store = SqliteStore::in_memory().unwrap();
        let exec = Execution::new("wf-1", json!({}), "c");
        let err = store.update_execution(&exec).await.unwrap_err();
        assert!(matches!(err, StepflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_executions_newest_first() {
        let store = SqliteStore::in_memory().unwrap();
        let first = Execution::new("wf-1", json!({}), "c1");
        let mut second = Execution::new("wf-1", json!({}), "c2");
        second.created_at = first.created_at + chrono::Duration::seconds(1);
        let other = Execution::new("wf-2", json!({}), "c3");
        for e in [&first, &second, &other] {
            store.create_execution(e).await.unwrap();
        }

        let listed = store.list_executions("wf-1", 10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);

        assert_eq!(store.list_executions("wf-1", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_step_records_in_creation_order() {
        let store = SqliteStore::in_memory().unwrap();
        let step_a = StepDefinition::agent_call("a", "x", "y");
        let step_b = StepDefinition::agent_call("b", "x", "y");

        let mut ra = StepRecord::start("exec-1", &step_a);
        let rb = StepRecord::skipped("exec-1", &step_b, "stopped").with_parent("p");
        store.create_step(&ra).await.unwrap();
        store.create_step(&rb).await.unwrap();

        ra.inputs = Some(json!({"k": 1}));
        ra.succeed(json!({"ok": true}));
        store.update_step(&ra).await.unwrap();

        let steps = store.list_steps("exec-1").await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].step_id, "a");
        assert_eq!(steps[0].status, StepStatus::Success);
        assert_eq!(steps[0].outputs, Some(json!({"ok": true})));
        assert_eq!(steps[0].agent_id.as_deref(), Some("x"));
        assert_eq!(steps[1].status, StepStatus::Skipped);
        assert_eq!(steps[1].parent_step_id.as_deref(), Some("p"));
    }

    #[tokio::test]
    async fn test_open_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("stepflow.db");
        let store = SqliteStore::open(&path).unwrap();
        store.save_workflow(&sample_workflow()).await.unwrap();
        assert!(path.exists());
    }
}
