//! Database Layer
//!
//! SQLite persistence for projects, codebook history, the audit log, and
//! reliability reports:
//! - Connection pooling via r2d2 for concurrent access
//! - Panic-safe transactions with automatic rollback
//! - Version-tracked migrations
//! - WAL mode
//!
//! The project snapshot is stored whole as JSON. Codebook versions are
//! written append-only as the snapshot advances, so any historical version
//! can be inspected after merges and splits have superseded its codes.

use std::path::Path;
use std::sync::Arc;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection};

use crate::stats::ReliabilityReport;
use crate::types::{
    AuditRecord, Codebook, ProjectId, ProjectState, QualError, Result, ResultExt,
};

/// Shared database handle for async contexts.
pub type SharedDatabase = Arc<Database>;

const SCHEMA: &str = include_str!("schema.sql");

/// Current schema version for migration tracking
const SCHEMA_VERSION: u32 = 2;

/// Migration definitions
struct Migration {
    version: u32,
    description: &'static str,
    up: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 2,
    description: "Add band column to reliability_reports",
    up: "ALTER TABLE reliability_reports ADD COLUMN band TEXT NOT NULL DEFAULT 'undefined'",
}];

/// One row of the project listing; enough for `status` output without
/// deserializing the snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProjectSummary {
    pub id: ProjectId,
    pub name: String,
    pub methodology: String,
    pub status: String,
    pub saturated: bool,
    pub updated_at: String,
}

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: u32,
    pub min_idle: u32,
    pub connection_timeout_secs: u64,
}

impl PoolConfig {
    const MIN_POOL_SIZE: u32 = 2;
    const MAX_POOL_SIZE: u32 = 16;

    /// clamp(cores, MIN, MAX); the workload is snapshot-sized writes, not
    /// row-level churn, so a modest pool suffices.
    pub fn optimal_pool_size() -> u32 {
        let cores = std::thread::available_parallelism()
            .map(|p| p.get() as u32)
            .unwrap_or(4);
        cores.clamp(Self::MIN_POOL_SIZE, Self::MAX_POOL_SIZE)
    }

    pub fn auto() -> Self {
        let max_size = Self::optimal_pool_size();
        Self {
            max_size,
            min_idle: (max_size / 2).max(1),
            connection_timeout_secs: 30,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::auto()
    }
}

/// Thread-safe database with connection pooling.
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// Open database with connection pooling at the specified path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, PoolConfig::default())
    }

    /// Open database with custom pool configuration.
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: PoolConfig) -> Result<Self> {
        let manager =
            SqliteConnectionManager::file(path.as_ref()).with_init(Self::configure_connection);

        let pool = Pool::builder()
            .max_size(config.max_size)
            .min_idle(Some(config.min_idle))
            .connection_timeout(std::time::Duration::from_secs(
                config.connection_timeout_secs,
            ))
            .build(manager)
            .map_err(|e| QualError::Storage(format!("Failed to create connection pool: {}", e)))?;

        Ok(Self { pool })
    }

    /// Open an in-memory database for testing or temporary use.
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| QualError::Storage(format!("Failed to create in-memory pool: {}", e)))?;

        Ok(Self { pool })
    }

    fn configure_connection(conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| {
            QualError::Storage(format!("Failed to acquire database connection: {}", e))
        })
    }

    /// Initialize database schema.
    pub fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)
            .with_context("Failed to initialize database schema")?;

        // schema.sql includes all columns; version starts current
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .with_context("Failed to set schema version")?;

        drop(conn);
        self.migrate()?;
        Ok(())
    }

    /// Run version-tracked migrations for databases created by older builds.
    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;

        let current_version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        for migration in MIGRATIONS {
            if migration.version > current_version {
                conn.execute_batch(migration.up).with_context_fn(|| {
                    format!(
                        "Failed to apply migration {}: {}",
                        migration.version, migration.description
                    )
                })?;
                tracing::info!(
                    "Applied migration {}: {}",
                    migration.version,
                    migration.description
                );
            }
        }

        if current_version < SCHEMA_VERSION {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .with_context("Failed to update schema version")?;
        }

        Ok(())
    }

    /// Execute a function within a panic-safe database transaction.
    ///
    /// All operations within the closure are atomic. If the closure panics,
    /// the transaction is rolled back and an error is returned instead of
    /// poisoning the connection pool.
    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + std::panic::UnwindSafe,
    {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .with_context("Failed to start transaction")?;

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&tx)));

        match result {
            Ok(Ok(value)) => {
                tx.commit().with_context("Failed to commit transaction")?;
                Ok(value)
            }
            Ok(Err(e)) => Err(e),
            Err(panic_payload) => {
                let panic_msg = panic_payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic_payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "Unknown panic".to_string());

                tracing::error!("Transaction panicked: {}", panic_msg);
                Err(QualError::Storage(format!(
                    "Transaction panicked: {}",
                    panic_msg
                )))
            }
        }
    }

    // =========================================================================
    // Project Snapshots
    // =========================================================================

    /// Persist a project snapshot, recording every codebook version advanced
    /// since the last save. A review round or multi-stage run may bump the
    /// version several times between saves; each intermediate snapshot is
    /// buffered in `state.version_log` and lands in history here. Upsert and
    /// history inserts commit atomically.
    pub fn save_project(&self, state: &ProjectState) -> Result<()> {
        let state_json =
            serde_json::to_string(state).with_context("Failed to serialize project state")?;
        let status = serde_json::to_string(&state.progress.status)
            .with_context("Failed to serialize pipeline status")?;
        let now = chrono::Utc::now().to_rfc3339();

        let mut versions: Vec<(i64, String)> = Vec::with_capacity(state.version_log.len() + 1);
        for book in state.version_log.iter().chain(std::iter::once(&state.codebook)) {
            versions.push((
                book.version as i64,
                serde_json::to_string(book).with_context("Failed to serialize codebook")?,
            ));
        }

        self.transaction(|conn| {
            conn.execute(
                r#"INSERT INTO projects
                   (id, name, methodology, status, saturated, state_json, created_at, updated_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                   ON CONFLICT(id) DO UPDATE SET
                       name = excluded.name,
                       status = excluded.status,
                       saturated = excluded.saturated,
                       state_json = excluded.state_json,
                       updated_at = excluded.updated_at"#,
                params![
                    state.id.to_string(),
                    state.name,
                    state.methodology.to_string(),
                    status,
                    state.saturated as i32,
                    state_json,
                    state.created_at.to_rfc3339(),
                    now,
                ],
            )
            .with_context("Failed to upsert project")?;

            let mut stmt = conn
                .prepare_cached(
                    "INSERT OR IGNORE INTO codebook_versions
                     (project_id, version, codebook_json, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .with_context("Failed to prepare codebook version insert")?;
            for (version, codebook_json) in &versions {
                stmt.execute(params![state.id.to_string(), version, codebook_json, now])
                    .with_context("Failed to record codebook version")?;
            }

            Ok(())
        })?;

        tracing::debug!(project = %state.id, version = state.codebook.version, "project saved");
        Ok(())
    }

    /// Load a project snapshot.
    pub fn load_project(&self, id: &ProjectId) -> Result<ProjectState> {
        let conn = self.conn()?;
        let result: std::result::Result<String, _> = conn.query_row(
            "SELECT state_json FROM projects WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        );

        match result {
            Ok(state_json) => serde_json::from_str(&state_json)
                .with_context_fn(|| format!("Corrupted project snapshot for {}", id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(QualError::ProjectNotFound(id.to_string()))
            }
            Err(e) => Err(QualError::Storage(format!(
                "Failed to load project: {}",
                e
            ))),
        }
    }

    /// Find a project by name (for CLI lookups).
    pub fn find_project_by_name(&self, name: &str) -> Result<ProjectState> {
        let conn = self.conn()?;
        let result: std::result::Result<String, _> = conn.query_row(
            "SELECT state_json FROM projects WHERE name = ?1 ORDER BY updated_at DESC LIMIT 1",
            params![name],
            |row| row.get(0),
        );

        match result {
            Ok(state_json) => serde_json::from_str(&state_json)
                .with_context_fn(|| format!("Corrupted project snapshot for '{}'", name)),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(QualError::ProjectNotFound(name.to_string()))
            }
            Err(e) => Err(QualError::Storage(format!(
                "Failed to load project: {}",
                e
            ))),
        }
    }

    /// List all projects, most recently updated first.
    pub fn list_projects(&self) -> Result<Vec<ProjectSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, methodology, status, saturated, updated_at
             FROM projects ORDER BY updated_at DESC",
        )?;

        let rows: Vec<_> = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i32>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context("Failed to list projects")?;

        let mut summaries = Vec::with_capacity(rows.len());
        for (id, name, methodology, status, saturated, updated_at) in rows {
            summaries.push(ProjectSummary {
                id: ProjectId::parse(&id)
                    .map_err(|_| QualError::Storage(format!("corrupt project id: {}", id)))?,
                name,
                methodology,
                status,
                saturated: saturated != 0,
                updated_at,
            });
        }
        Ok(summaries)
    }

    // =========================================================================
    // Codebook History
    // =========================================================================

    /// All recorded codebook versions for a project, oldest first.
    pub fn codebook_history(&self, id: &ProjectId) -> Result<Vec<Codebook>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT codebook_json FROM codebook_versions
             WHERE project_id = ?1 ORDER BY version",
        )?;

        let rows: Vec<String> = stmt
            .query_map(params![id.to_string()], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context("Failed to load codebook history")?;

        rows.iter()
            .map(|json| {
                serde_json::from_str(json)
                    .with_context_fn(|| format!("Corrupted codebook version for {}", id))
            })
            .collect()
    }

    // =========================================================================
    // Audit Log
    // =========================================================================

    /// Append audit records (one per review decision).
    pub fn append_audit(&self, id: &ProjectId, records: &[AuditRecord]) -> Result<()> {
        self.transaction(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "INSERT INTO audit_log (id, project_id, version, action, detail, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .with_context("Failed to prepare audit insert")?;
            for record in records {
                stmt.execute(params![
                    uuid::Uuid::new_v4().to_string(),
                    id.to_string(),
                    record.version as i64,
                    record.action,
                    record.detail,
                    record.created_at.to_rfc3339(),
                ])
                .with_context("Failed to append audit record")?;
            }
            Ok(())
        })
    }

    /// Audit trail for a project, version-ordered.
    pub fn audit_log(&self, id: &ProjectId) -> Result<Vec<AuditRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT version, action, detail, created_at FROM audit_log
             WHERE project_id = ?1 ORDER BY version, created_at",
        )?;

        let rows: Vec<(i64, String, String, String)> = stmt
            .query_map(params![id.to_string()], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context("Failed to load audit log")?;

        let mut records = Vec::with_capacity(rows.len());
        for (version, action, detail, created_at) in rows {
            let created_at = chrono::DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .with_context_fn(|| format!("Corrupted audit timestamp for {}", id))?;
            records.push(AuditRecord {
                version: version as u64,
                action,
                detail,
                created_at,
            });
        }
        Ok(records)
    }

    // =========================================================================
    // Reliability Reports
    // =========================================================================

    /// Store a reliability report.
    pub fn store_reliability_report(
        &self,
        id: &ProjectId,
        report: &ReliabilityReport,
    ) -> Result<()> {
        let report_json =
            serde_json::to_string(report).with_context("Failed to serialize report")?;
        let kind = serde_json::to_string(&report.kind)
            .with_context("Failed to serialize report kind")?;

        self.conn()?
            .execute(
                "INSERT INTO reliability_reports
                 (id, project_id, kind, band, report_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    id.to_string(),
                    kind,
                    report.band,
                    report_json,
                    report.generated_at.to_rfc3339(),
                ],
            )
            .with_context("Failed to store reliability report")?;
        Ok(())
    }

    /// All reliability reports for a project, newest first.
    pub fn reliability_reports(&self, id: &ProjectId) -> Result<Vec<ReliabilityReport>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT report_json FROM reliability_reports
             WHERE project_id = ?1 ORDER BY created_at DESC",
        )?;

        let rows: Vec<String> = stmt
            .query_map(params![id.to_string()], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context("Failed to load reliability reports")?;

        rows.iter()
            .map(|json| {
                serde_json::from_str(json)
                    .with_context_fn(|| format!("Corrupted reliability report for {}", id))
            })
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::methodology::Methodology;
    use crate::types::{Code, Document, StateDelta};

    fn db() -> Database {
        let db = Database::open_in_memory().expect("open in-memory database");
        db.initialize().expect("initialize schema");
        db
    }

    fn sample_project() -> ProjectState {
        let mut state = ProjectState::new("study", Methodology::GroundedTheory);
        state.add_document(Document::new("i1", "trust is gone", vec![]));
        state
            .apply_delta(&StateDelta {
                new_codes: vec![Code::discovered("trust issues", "d", 0.8, "r")],
                ..Default::default()
            })
            .unwrap();
        state
    }

    #[test]
    fn test_save_load_roundtrip() {
        let db = db();
        let state = sample_project();
        db.save_project(&state).unwrap();

        let loaded = db.load_project(&state.id).unwrap();
        assert_eq!(loaded.name, state.name);
        assert_eq!(loaded.codebook.version, 1);
        assert_eq!(loaded.documents.len(), 1);
        assert_eq!(loaded.codebook.active_count(), 1);
    }

    #[test]
    fn test_load_missing_project() {
        let db = db();
        let err = db.load_project(&ProjectId::new()).unwrap_err();
        assert!(matches!(err, QualError::ProjectNotFound(_)));
    }

    #[test]
    fn test_codebook_history_accumulates() {
        let db = db();
        let mut state = sample_project();
        db.save_project(&state).unwrap();

        state
            .apply_delta(&StateDelta {
                new_codes: vec![Code::discovered("isolation", "d", 0.7, "r")],
                ..Default::default()
            })
            .unwrap();
        db.save_project(&state).unwrap();

        let history = db.codebook_history(&state.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version, 1);
        assert_eq!(history[1].version, 2);
        assert_eq!(history[0].active_count(), 1);
        assert_eq!(history[1].active_count(), 2);
    }

    #[test]
    fn test_history_retains_versions_between_saves() {
        use crate::review::ReviewManager;
        use crate::types::ReviewDecision;

        let db = db();
        let mut state = sample_project();
        db.save_project(&state).unwrap();

        // Two decisions advance the codebook twice before the next save;
        // every intermediate version must still land in history.
        let code_id = state.codebook.active_codes().next().unwrap().id;
        ReviewManager
            .apply_decision(
                &mut state,
                &ReviewDecision::Modify {
                    code_id,
                    new_definition: "sharper definition".into(),
                },
            )
            .unwrap();
        ReviewManager
            .apply_decision(
                &mut state,
                &ReviewDecision::Approve {
                    code_ids: vec![code_id],
                },
            )
            .unwrap();
        db.save_project(&state).unwrap();

        let versions: Vec<u64> = db
            .codebook_history(&state.id)
            .unwrap()
            .iter()
            .map(|b| b.version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[test]
    fn test_resave_same_version_no_duplicate_history() {
        let db = db();
        let state = sample_project();
        db.save_project(&state).unwrap();
        db.save_project(&state).unwrap();
        assert_eq!(db.codebook_history(&state.id).unwrap().len(), 1);
    }

    #[test]
    fn test_audit_log_roundtrip() {
        let db = db();
        let state = sample_project();
        db.save_project(&state).unwrap();

        let records = vec![
            AuditRecord::new(2, "approve", "approved: trust issues"),
            AuditRecord::new(3, "merge", "merged a, b into 'c'"),
        ];
        db.append_audit(&state.id, &records).unwrap();

        let loaded = db.audit_log(&state.id).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].action, "approve");
        assert_eq!(loaded[1].version, 3);
    }

    #[test]
    fn test_list_projects() {
        let db = db();
        let state = sample_project();
        db.save_project(&state).unwrap();

        let list = db.list_projects().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "study");
        assert_eq!(list[0].methodology, "grounded-theory");
        assert!(!list[0].saturated);
    }

    #[test]
    fn test_find_by_name() {
        let db = db();
        let state = sample_project();
        db.save_project(&state).unwrap();
        let found = db.find_project_by_name("study").unwrap();
        assert_eq!(found.id, state.id);
        assert!(matches!(
            db.find_project_by_name("nope").unwrap_err(),
            QualError::ProjectNotFound(_)
        ));
    }

    #[test]
    fn test_transaction_panic_safety() {
        let db = db();
        let result = db.transaction(|_conn| {
            panic!("Intentional panic for testing");
            #[allow(unreachable_code)]
            Ok(())
        });
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("panicked"));
        // pool must still be usable
        assert!(db.list_projects().is_ok());
    }

    #[test]
    fn test_reliability_report_roundtrip() {
        use crate::stats::{Kappa, ReportKind};

        let db = db();
        let state = sample_project();
        db.save_project(&state).unwrap();

        let report = ReliabilityReport {
            kind: ReportKind::InterRater,
            passes: vec!["pass-1".into(), "pass-2".into()],
            documents: 3,
            pairwise: vec![],
            overall: Kappa::Defined { value: 0.72 },
            band: "substantial".into(),
            generated_at: chrono::Utc::now(),
        };
        db.store_reliability_report(&state.id, &report).unwrap();

        let loaded = db.reliability_reports(&state.id).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].band, "substantial");
        assert_eq!(loaded[0].overall.value(), Some(0.72));
    }
}
