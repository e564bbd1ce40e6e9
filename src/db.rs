use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use rusqlite::{Connection, params};

use crate::errors::RunnerError;
use crate::models::{Client, Page, Task, TaskStatus, is_valid_transition, now_rfc3339};

/// Async-safe handle to the task database.
///
/// Wraps `TaskDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<TaskDb>>,
}

impl DbHandle {
    pub fn new(db: TaskDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, RunnerError>
    where
        F: FnOnce(&TaskDb) -> Result<R, RunnerError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| RunnerError::PersistenceUnavailable(format!("DB lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| RunnerError::Internal(anyhow::anyhow!("DB task panicked: {}", e)))?
    }

    /// Acquire the database mutex synchronously. For startup initialization
    /// and tests only; never call from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, TaskDb>, RunnerError> {
        self.inner
            .lock()
            .map_err(|e| RunnerError::PersistenceUnavailable(format!("DB lock poisoned: {}", e)))
    }
}

/// Fields updated together with a status transition.
#[derive(Debug, Default, Clone)]
pub struct StatusPatch {
    /// `Some(x)` sets the column to `x` (including `Some(None)` to clear).
    pub input_request_id: Option<Option<String>>,
    pub results: Option<serde_json::Value>,
}

fn persist_err(e: rusqlite::Error) -> RunnerError {
    RunnerError::PersistenceUnavailable(e.to_string())
}

pub struct TaskDb {
    conn: Connection,
}

struct TaskRow {
    id: String,
    client_id: String,
    flow_id: String,
    filename: String,
    status: String,
    status_version: i64,
    input_timeout: i64,
    max_duration: i64,
    input_request_id: Option<String>,
    results: Option<String>,
    soft_deleted: i64,
    created_at: String,
    started_at: Option<String>,
    ended_at: Option<String>,
}

impl TaskRow {
    fn into_task(self) -> Result<Task, RunnerError> {
        let status = TaskStatus::from_str(&self.status)
            .map_err(|e| RunnerError::Internal(anyhow::anyhow!(e)))?;
        let results = match self.results {
            Some(raw) => Some(
                serde_json::from_str(&raw)
                    .map_err(|e| RunnerError::Internal(anyhow::anyhow!("Corrupt results JSON: {}", e)))?,
            ),
            None => None,
        };
        Ok(Task {
            id: self.id,
            client_id: self.client_id,
            flow_id: self.flow_id,
            filename: self.filename,
            status,
            status_version: self.status_version,
            input_timeout: self.input_timeout.max(0) as u64,
            max_duration: self.max_duration.max(0) as u64,
            input_request_id: self.input_request_id,
            results,
            soft_deleted: self.soft_deleted != 0,
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
        })
    }
}

const TASK_COLUMNS: &str = "id, client_id, flow_id, filename, status, status_version, \
     input_timeout, max_duration, input_request_id, results, soft_deleted, \
     created_at, started_at, ended_at";

fn map_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?,
        client_id: row.get(1)?,
        flow_id: row.get(2)?,
        filename: row.get(3)?,
        status: row.get(4)?,
        status_version: row.get(5)?,
        input_timeout: row.get(6)?,
        max_duration: row.get(7)?,
        input_request_id: row.get(8)?,
        results: row.get(9)?,
        soft_deleted: row.get(10)?,
        created_at: row.get(11)?,
        started_at: row.get(12)?,
        ended_at: row.get(13)?,
    })
}

impl TaskDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self, RunnerError> {
        let conn = Connection::open(path).map_err(persist_err)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self, RunnerError> {
        let conn = Connection::open_in_memory().map_err(persist_err)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<(), RunnerError> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(persist_err)?;
        self.run_migrations()
    }

    fn run_migrations(&self) -> Result<(), RunnerError> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS clients (
                    client_id TEXT PRIMARY KEY,
                    secret_hash TEXT NOT NULL,
                    audience TEXT NOT NULL DEFAULT 'tasks-api',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    client_id TEXT NOT NULL,
                    flow_id TEXT NOT NULL,
                    filename TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'PENDING',
                    status_version INTEGER NOT NULL DEFAULT 0,
                    input_timeout INTEGER NOT NULL DEFAULT 180,
                    max_duration INTEGER NOT NULL DEFAULT 0,
                    input_request_id TEXT,
                    results TEXT,
                    env_vars TEXT,
                    soft_deleted INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    ended_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_client ON tasks(client_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
                CREATE INDEX IF NOT EXISTS idx_tasks_flow ON tasks(client_id, flow_id);
                CREATE INDEX IF NOT EXISTS idx_clients_secret ON clients(secret_hash);
                ",
            )
            .map_err(persist_err)
    }

    // ── Clients ───────────────────────────────────────────────────────

    pub fn upsert_client(
        &self,
        client_id: &str,
        secret_hash: &str,
        audience: &str,
    ) -> Result<Client, RunnerError> {
        self.conn
            .execute(
                "INSERT INTO clients (client_id, secret_hash, audience, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(client_id) DO UPDATE SET secret_hash = ?2, audience = ?3",
                params![client_id, secret_hash, audience, now_rfc3339()],
            )
            .map_err(persist_err)?;
        self.get_client(client_id)?
            .ok_or_else(|| RunnerError::not_found("Client"))
    }

    pub fn get_client(&self, client_id: &str) -> Result<Option<Client>, RunnerError> {
        self.query_client(
            "SELECT client_id, secret_hash, audience, created_at FROM clients WHERE client_id = ?1",
            params![client_id],
        )
    }

    pub fn get_client_by_secret_hash(&self, hash: &str) -> Result<Option<Client>, RunnerError> {
        self.query_client(
            "SELECT client_id, secret_hash, audience, created_at FROM clients WHERE secret_hash = ?1",
            params![hash],
        )
    }

    fn query_client(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Option<Client>, RunnerError> {
        let mut stmt = self.conn.prepare(sql).map_err(persist_err)?;
        let mut rows = stmt
            .query_map(args, |row| {
                Ok(Client {
                    client_id: row.get(0)?,
                    secret_hash: row.get(1)?,
                    audience: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })
            .map_err(persist_err)?;
        match rows.next() {
            Some(row) => Ok(Some(row.map_err(persist_err)?)),
            None => Ok(None),
        }
    }

    // ── Task CRUD ─────────────────────────────────────────────────────

    pub fn create_task(
        &self,
        task: &Task,
        env_vars: Option<&HashMap<String, String>>,
    ) -> Result<Task, RunnerError> {
        let results = task
            .results
            .as_ref()
            .map(|v| serde_json::to_string(v).expect("results serialize"));
        let env_vars = match env_vars {
            Some(map) if !map.is_empty() => {
                Some(serde_json::to_string(map).expect("env vars serialize"))
            }
            _ => None,
        };
        self.conn
            .execute(
                "INSERT INTO tasks (id, client_id, flow_id, filename, status, status_version,
                                    input_timeout, max_duration, input_request_id, results,
                                    env_vars, soft_deleted, created_at, started_at, ended_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, NULL, ?8, ?9, 0, ?10, NULL, NULL)",
                params![
                    task.id,
                    task.client_id,
                    task.flow_id,
                    task.filename,
                    task.status.as_str(),
                    task.input_timeout as i64,
                    task.max_duration as i64,
                    results,
                    env_vars,
                    task.created_at,
                ],
            )
            .map_err(persist_err)?;
        self.get_task(&task.id)?
            .ok_or_else(|| RunnerError::not_found("Task"))
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>, RunnerError> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
        let mut stmt = self.conn.prepare(&sql).map_err(persist_err)?;
        let mut rows = stmt.query_map(params![id], map_task_row).map_err(persist_err)?;
        match rows.next() {
            Some(row) => Ok(Some(row.map_err(persist_err)?.into_task()?)),
            None => Ok(None),
        }
    }

    /// Paginated listing of a client's tasks, newest first, excluding
    /// soft-deleted records. `page` is 1-based.
    pub fn list_tasks(
        &self,
        client_id: &str,
        page: i64,
        size: i64,
    ) -> Result<Page<Task>, RunnerError> {
        let page = page.max(1);
        let size = size.clamp(1, 100);
        let total: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM tasks WHERE client_id = ?1 AND soft_deleted = 0",
                params![client_id],
                |row| row.get(0),
            )
            .map_err(persist_err)?;

        let sql = format!(
            "SELECT {} FROM tasks WHERE client_id = ?1 AND soft_deleted = 0
             ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
            TASK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).map_err(persist_err)?;
        let rows = stmt
            .query_map(params![client_id, size, (page - 1) * size], map_task_row)
            .map_err(persist_err)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row.map_err(persist_err)?.into_task()?);
        }
        Ok(Page::new(items, total, page, size))
    }

    pub fn count_active_tasks(&self, client_id: &str) -> Result<i64, RunnerError> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM tasks
                 WHERE client_id = ?1 AND soft_deleted = 0
                   AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')",
                params![client_id],
                |row| row.get(0),
            )
            .map_err(persist_err)
    }

    /// Tasks awaiting dispatch; surfaced for observability.
    pub fn count_pending(&self) -> Result<i64, RunnerError> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM tasks WHERE status = 'PENDING' AND soft_deleted = 0",
                [],
                |row| row.get(0),
            )
            .map_err(persist_err)
    }

    /// An active task already running the same flow for this client.
    pub fn find_active_flow_task(
        &self,
        client_id: &str,
        flow_id: &str,
    ) -> Result<Option<Task>, RunnerError> {
        let sql = format!(
            "SELECT {} FROM tasks
             WHERE client_id = ?1 AND flow_id = ?2 AND soft_deleted = 0
               AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')
             LIMIT 1",
            TASK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).map_err(persist_err)?;
        let mut rows = stmt
            .query_map(params![client_id, flow_id], map_task_row)
            .map_err(persist_err)?;
        match rows.next() {
            Some(row) => Ok(Some(row.map_err(persist_err)?.into_task()?)),
            None => Ok(None),
        }
    }

    // ── Status transitions ────────────────────────────────────────────

    /// Compare-and-swap status transition. The row is journaled before any
    /// observer is notified; a failed CAS (someone else transitioned first,
    /// or the transition is not in the state machine) is a `Conflict`.
    pub fn update_task_status(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        patch: StatusPatch,
    ) -> Result<Task, RunnerError> {
        if !is_valid_transition(&from, &to) {
            return Err(RunnerError::Conflict(format!("{} -> {}", from, to)));
        }
        let now = now_rfc3339();
        let tx = self.conn.unchecked_transaction().map_err(persist_err)?;
        let changed = tx
            .execute(
                "UPDATE tasks SET status = ?1, status_version = status_version + 1
                 WHERE id = ?2 AND status = ?3",
                params![to.as_str(), id, from.as_str()],
            )
            .map_err(persist_err)?;
        if changed == 0 {
            return Err(RunnerError::Conflict(format!(
                "Task {} is not in state {}",
                id, from
            )));
        }
        if to == TaskStatus::Running && from == TaskStatus::Pending {
            tx.execute(
                "UPDATE tasks SET started_at = COALESCE(started_at, ?1) WHERE id = ?2",
                params![now, id],
            )
            .map_err(persist_err)?;
        }
        if to.is_terminal() {
            tx.execute(
                "UPDATE tasks SET ended_at = ?1 WHERE id = ?2",
                params![now, id],
            )
            .map_err(persist_err)?;
        }
        if let Some(request_id) = &patch.input_request_id {
            tx.execute(
                "UPDATE tasks SET input_request_id = ?1 WHERE id = ?2",
                params![request_id, id],
            )
            .map_err(persist_err)?;
        }
        if let Some(results) = &patch.results {
            tx.execute(
                "UPDATE tasks SET results = ?1 WHERE id = ?2",
                params![serde_json::to_string(results).expect("results serialize"), id],
            )
            .map_err(persist_err)?;
        }
        tx.commit().map_err(persist_err)?;
        self.get_task(id)?.ok_or_else(|| RunnerError::not_found("Task"))
    }

    /// Transition a still-active task to a terminal state. Returns `None`
    /// when the task is already terminal (another owner won the race).
    pub fn finish_task(
        &self,
        id: &str,
        to: TaskStatus,
        results: Option<serde_json::Value>,
    ) -> Result<Option<Task>, RunnerError> {
        if !to.is_terminal() {
            return Err(RunnerError::Conflict(format!("{} is not terminal", to)));
        }
        let now = now_rfc3339();
        let results_json = results
            .as_ref()
            .map(|v| serde_json::to_string(v).expect("results serialize"));
        let changed = self
            .conn
            .execute(
                "UPDATE tasks
                 SET status = ?1, status_version = status_version + 1, ended_at = ?2,
                     input_request_id = NULL, env_vars = NULL,
                     results = COALESCE(?3, results)
                 WHERE id = ?4 AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')",
                params![to.as_str(), now, results_json, id],
            )
            .map_err(persist_err)?;
        if changed == 0 {
            return Ok(None);
        }
        Ok(self.get_task(id)?)
    }

    /// Claim the oldest dispatchable task: CAS PENDING → RUNNING, stamping
    /// `started_at`. FIFO by creation time, stable by id.
    pub fn claim_next_pending(&self) -> Result<Option<Task>, RunnerError> {
        let candidate: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM tasks WHERE status = 'PENDING' AND soft_deleted = 0
                 ORDER BY created_at ASC, id ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(persist_err(other)),
            })?;
        let Some(id) = candidate else {
            return Ok(None);
        };
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET status = 'RUNNING', status_version = status_version + 1,
                        started_at = COALESCE(started_at, ?1)
                 WHERE id = ?2 AND status = 'PENDING'",
                params![now_rfc3339(), id],
            )
            .map_err(persist_err)?;
        if changed == 0 {
            // Cancelled (or claimed elsewhere) between select and update.
            return Ok(None);
        }
        Ok(self.get_task(&id)?)
    }

    /// Merge one key into the task's results object without touching status.
    pub fn merge_results(
        &self,
        id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), RunnerError> {
        let task = self
            .get_task(id)?
            .ok_or_else(|| RunnerError::not_found("Task"))?;
        let mut results = match task.results {
            Some(serde_json::Value::Object(map)) => serde_json::Value::Object(map),
            Some(other) => serde_json::json!({ "data": other }),
            None => serde_json::json!({}),
        };
        results[key] = value;
        self.conn
            .execute(
                "UPDATE tasks SET results = ?1 WHERE id = ?2",
                params![serde_json::to_string(&results).expect("results serialize"), id],
            )
            .map_err(persist_err)?;
        Ok(())
    }

    pub fn get_env_vars(&self, id: &str) -> Result<HashMap<String, String>, RunnerError> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT env_vars FROM tasks WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(persist_err(other)),
            })?;
        match raw {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| RunnerError::Internal(anyhow::anyhow!("Corrupt env vars: {}", e))),
            None => Ok(HashMap::new()),
        }
    }

    // ── Deletion and reconciliation ───────────────────────────────────

    pub fn soft_delete(&self, id: &str) -> Result<bool, RunnerError> {
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET soft_deleted = 1 WHERE id = ?1 AND soft_deleted = 0",
                params![id],
            )
            .map_err(persist_err)?;
        Ok(changed > 0)
    }

    /// Soft-deleted tasks older than the cutoff: `(id, client_id)` pairs for
    /// the purge pass.
    pub fn old_soft_deleted(&self, cutoff: &str) -> Result<Vec<(String, String)>, RunnerError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, client_id FROM tasks
                 WHERE soft_deleted = 1 AND created_at < ?1 LIMIT 100",
            )
            .map_err(persist_err)?;
        let rows = stmt
            .query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(persist_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(persist_err)?);
        }
        Ok(out)
    }

    /// Terminal tasks that ended before the cutoff; their streams are due
    /// for deletion.
    pub fn tasks_ended_before(&self, cutoff: &str) -> Result<Vec<String>, RunnerError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id FROM tasks
                 WHERE ended_at IS NOT NULL AND ended_at < ?1 LIMIT 100",
            )
            .map_err(persist_err)?;
        let rows = stmt
            .query_map(params![cutoff], |row| row.get(0))
            .map_err(persist_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(persist_err)?);
        }
        Ok(out)
    }

    pub fn hard_delete(&self, ids: &[String]) -> Result<usize, RunnerError> {
        let mut deleted = 0;
        for id in ids {
            deleted += self
                .conn
                .execute("DELETE FROM tasks WHERE id = ?1", params![id])
                .map_err(persist_err)?;
        }
        Ok(deleted)
    }

    /// Tasks marked active that already carry results — a crashed owner
    /// never finished the terminal transition.
    pub fn stuck_tasks(&self) -> Result<Vec<Task>, RunnerError> {
        let sql = format!(
            "SELECT {} FROM tasks
             WHERE soft_deleted = 0 AND results IS NOT NULL
               AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')
             LIMIT 100",
            TASK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).map_err(persist_err)?;
        let rows = stmt.query_map([], map_task_row).map_err(persist_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(persist_err)?.into_task()?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(id: &str, client: &str) -> Task {
        Task {
            id: id.to_string(),
            client_id: client.to_string(),
            flow_id: format!("flow-{}", id),
            filename: "test.flow".to_string(),
            status: TaskStatus::Pending,
            status_version: 0,
            input_timeout: 180,
            max_duration: 0,
            input_request_id: None,
            results: None,
            soft_deleted: false,
            created_at: now_rfc3339(),
            started_at: None,
            ended_at: None,
        }
    }

    #[test]
    fn test_create_and_get_task() {
        let db = TaskDb::new_in_memory().unwrap();
        let created = db.create_task(&sample_task("t1", "c1"), None).unwrap();
        assert_eq!(created.status, TaskStatus::Pending);
        assert_eq!(created.status_version, 0);
        assert!(created.started_at.is_none());
        assert!(db.get_task("missing").unwrap().is_none());
    }

    #[test]
    fn test_status_cas_happy_and_conflict() {
        let db = TaskDb::new_in_memory().unwrap();
        db.create_task(&sample_task("t1", "c1"), None).unwrap();

        let running = db
            .update_task_status("t1", TaskStatus::Pending, TaskStatus::Running, StatusPatch::default())
            .unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert_eq!(running.status_version, 1);
        assert!(running.started_at.is_some());

        // Stale CAS: the task is no longer PENDING.
        let err = db
            .update_task_status("t1", TaskStatus::Pending, TaskStatus::Running, StatusPatch::default())
            .unwrap_err();
        assert!(matches!(err, RunnerError::Conflict(_)));

        // Transition not in the state machine.
        let err = db
            .update_task_status("t1", TaskStatus::Running, TaskStatus::Pending, StatusPatch::default())
            .unwrap_err();
        assert!(matches!(err, RunnerError::Conflict(_)));
    }

    #[test]
    fn test_waiting_flip_sets_and_clears_request_id() {
        let db = TaskDb::new_in_memory().unwrap();
        db.create_task(&sample_task("t1", "c1"), None).unwrap();
        db.update_task_status("t1", TaskStatus::Pending, TaskStatus::Running, StatusPatch::default())
            .unwrap();

        let waiting = db
            .update_task_status(
                "t1",
                TaskStatus::Running,
                TaskStatus::WaitingForInput,
                StatusPatch {
                    input_request_id: Some(Some("req-1".into())),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(waiting.input_request_id.as_deref(), Some("req-1"));

        let running = db
            .update_task_status(
                "t1",
                TaskStatus::WaitingForInput,
                TaskStatus::Running,
                StatusPatch {
                    input_request_id: Some(None),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(running.input_request_id.is_none());
    }

    #[test]
    fn test_terminal_sets_ended_at() {
        let db = TaskDb::new_in_memory().unwrap();
        db.create_task(&sample_task("t1", "c1"), None).unwrap();
        db.update_task_status("t1", TaskStatus::Pending, TaskStatus::Running, StatusPatch::default())
            .unwrap();
        let done = db
            .update_task_status(
                "t1",
                TaskStatus::Running,
                TaskStatus::Completed,
                StatusPatch::default(),
            )
            .unwrap();
        assert!(done.ended_at.is_some());
        assert!(done.status.is_terminal());
    }

    #[test]
    fn test_finish_task_from_any_active_and_idempotent() {
        let db = TaskDb::new_in_memory().unwrap();
        db.create_task(&sample_task("t1", "c1"), None).unwrap();
        db.update_task_status("t1", TaskStatus::Pending, TaskStatus::Running, StatusPatch::default())
            .unwrap();

        let finished = db
            .finish_task("t1", TaskStatus::Failed, Some(serde_json::json!({"error": "boom"})))
            .unwrap()
            .unwrap();
        assert_eq!(finished.status, TaskStatus::Failed);
        assert_eq!(finished.results.unwrap()["error"], "boom");

        // Already terminal: no-op.
        assert!(db.finish_task("t1", TaskStatus::Completed, None).unwrap().is_none());
    }

    #[test]
    fn test_claim_next_pending_fifo() {
        let db = TaskDb::new_in_memory().unwrap();
        let mut first = sample_task("a", "c1");
        first.created_at = "2026-01-01T00:00:00Z".into();
        let mut second = sample_task("b", "c1");
        second.created_at = "2026-01-02T00:00:00Z".into();
        // Insert newest first to prove ordering is by created_at, not rowid.
        db.create_task(&second, None).unwrap();
        db.create_task(&first, None).unwrap();

        assert_eq!(db.claim_next_pending().unwrap().unwrap().id, "a");
        assert_eq!(db.claim_next_pending().unwrap().unwrap().id, "b");
        assert!(db.claim_next_pending().unwrap().is_none());
    }

    #[test]
    fn test_claim_skips_cancelled() {
        let db = TaskDb::new_in_memory().unwrap();
        db.create_task(&sample_task("t1", "c1"), None).unwrap();
        db.update_task_status("t1", TaskStatus::Pending, TaskStatus::Cancelled, StatusPatch::default())
            .unwrap();
        assert!(db.claim_next_pending().unwrap().is_none());
    }

    #[test]
    fn test_count_active_and_quota_view() {
        let db = TaskDb::new_in_memory().unwrap();
        for id in ["a", "b", "c"] {
            db.create_task(&sample_task(id, "c1"), None).unwrap();
        }
        db.create_task(&sample_task("other", "c2"), None).unwrap();
        assert_eq!(db.count_active_tasks("c1").unwrap(), 3);

        db.update_task_status("a", TaskStatus::Pending, TaskStatus::Cancelled, StatusPatch::default())
            .unwrap();
        assert_eq!(db.count_active_tasks("c1").unwrap(), 2);
    }

    #[test]
    fn test_find_active_flow_task() {
        let db = TaskDb::new_in_memory().unwrap();
        let mut task = sample_task("t1", "c1");
        task.flow_id = "hash-1".into();
        db.create_task(&task, None).unwrap();

        assert!(db.find_active_flow_task("c1", "hash-1").unwrap().is_some());
        assert!(db.find_active_flow_task("c1", "hash-2").unwrap().is_none());
        assert!(db.find_active_flow_task("c2", "hash-1").unwrap().is_none());

        db.finish_task("t1", TaskStatus::Completed, None).unwrap();
        assert!(db.find_active_flow_task("c1", "hash-1").unwrap().is_none());
    }

    #[test]
    fn test_list_tasks_pagination_and_soft_delete() {
        let db = TaskDb::new_in_memory().unwrap();
        for i in 0..5 {
            let mut task = sample_task(&format!("t{}", i), "c1");
            task.created_at = format!("2026-01-0{}T00:00:00Z", i + 1);
            db.create_task(&task, None).unwrap();
        }
        let page = db.list_tasks("c1", 1, 2).unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.pages, 3);
        assert_eq!(page.items[0].id, "t4"); // newest first

        db.soft_delete("t4").unwrap();
        let page = db.list_tasks("c1", 1, 2).unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.items[0].id, "t3");
        // Second soft delete is a no-op.
        assert!(!db.soft_delete("t4").unwrap());
    }

    #[test]
    fn test_env_vars_roundtrip_and_cleared_on_finish() {
        let db = TaskDb::new_in_memory().unwrap();
        let mut env = HashMap::new();
        env.insert("API_KEY".to_string(), "abc".to_string());
        db.create_task(&sample_task("t1", "c1"), Some(&env)).unwrap();
        assert_eq!(db.get_env_vars("t1").unwrap().get("API_KEY").unwrap(), "abc");

        db.update_task_status("t1", TaskStatus::Pending, TaskStatus::Running, StatusPatch::default())
            .unwrap();
        db.finish_task("t1", TaskStatus::Completed, None).unwrap();
        assert!(db.get_env_vars("t1").unwrap().is_empty());
    }

    #[test]
    fn test_merge_results() {
        let db = TaskDb::new_in_memory().unwrap();
        db.create_task(&sample_task("t1", "c1"), None).unwrap();
        db.merge_results("t1", "archive", serde_json::json!("results.tar"))
            .unwrap();
        db.merge_results("t1", "summary", serde_json::json!({"lines": 3}))
            .unwrap();
        let task = db.get_task("t1").unwrap().unwrap();
        let results = task.results.unwrap();
        assert_eq!(results["archive"], "results.tar");
        assert_eq!(results["summary"]["lines"], 3);
    }

    #[test]
    fn test_stuck_tasks() {
        let db = TaskDb::new_in_memory().unwrap();
        db.create_task(&sample_task("t1", "c1"), None).unwrap();
        db.update_task_status("t1", TaskStatus::Pending, TaskStatus::Running, StatusPatch::default())
            .unwrap();
        assert!(db.stuck_tasks().unwrap().is_empty());

        db.merge_results("t1", "error", serde_json::json!("crash")).unwrap();
        let stuck = db.stuck_tasks().unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, "t1");
    }

    #[test]
    fn test_purge_queries() {
        let db = TaskDb::new_in_memory().unwrap();
        let mut old = sample_task("old", "c1");
        old.created_at = "2020-01-01T00:00:00Z".into();
        db.create_task(&old, None).unwrap();
        db.soft_delete("old").unwrap();

        let rows = db.old_soft_deleted("2025-01-01T00:00:00Z").unwrap();
        assert_eq!(rows, vec![("old".to_string(), "c1".to_string())]);
        assert_eq!(db.hard_delete(&["old".to_string()]).unwrap(), 1);
        assert!(db.get_task("old").unwrap().is_none());
    }

    #[test]
    fn test_clients() {
        let db = TaskDb::new_in_memory().unwrap();
        db.upsert_client("local", "hash-1", "tasks-api").unwrap();
        let client = db.get_client_by_secret_hash("hash-1").unwrap().unwrap();
        assert_eq!(client.client_id, "local");
        assert_eq!(client.audience, "tasks-api");

        // Rotating the secret replaces the hash.
        db.upsert_client("local", "hash-2", "tasks-api").unwrap();
        assert!(db.get_client_by_secret_hash("hash-1").unwrap().is_none());
        assert!(db.get_client_by_secret_hash("hash-2").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_db_handle_call() {
        let handle = DbHandle::new(TaskDb::new_in_memory().unwrap());
        let task = sample_task("t1", "c1");
        let created = handle
            .call(move |db| db.create_task(&task, None))
            .await
            .unwrap();
        assert_eq!(created.id, "t1");
    }
}
