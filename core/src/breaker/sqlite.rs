/// SQLite-backed breaker store
///
/// Breakers survive restarts and can be shared by processes pointing at the
/// same database file. Every mutation runs inside an IMMEDIATE transaction,
/// which takes the write lock up front, so concurrent read-modify-write cycles
/// serialise instead of losing counter updates.
use super::state::{BreakerKey, CircuitBreaker, CircuitState};
use super::store::BreakerStore;
use crate::{GuardianError, GuardianResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use uuid::Uuid;

const IN_MEMORY: &str = ":memory:";

/// How long a writer waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_COLUMNS: &str = r#"
    SELECT id, service, operation, state,
           failure_count, success_count, failure_threshold, success_threshold,
           recovery_timeout, last_failure_at, opened_at, next_attempt_at,
           created_at, updated_at
    FROM api_guardian_circuit_breakers
"#;

/// Durable breaker store
pub struct SqliteBreakerStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteBreakerStore {
    /// Open (creating if needed) the database at `path`; `None` is in-memory
    pub fn open(path: Option<&Path>) -> GuardianResult<Self> {
        let db_path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(IN_MEMORY));
        let in_memory = db_path.to_str() == Some(IN_MEMORY);

        if !in_memory {
            if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    GuardianError::StorageUnavailable(format!(
                        "failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        if !in_memory {
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            tracing::debug!(path = %db_path.display(), journal_mode = %mode, "Opened breaker database");
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path,
        };
        store.initialize_schema()?;

        Ok(store)
    }

    pub fn in_memory() -> GuardianResult<Self> {
        Self::open(None)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn initialize_schema(&self) -> GuardianResult<()> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS api_guardian_circuit_breakers (
                id TEXT PRIMARY KEY NOT NULL,
                service TEXT NOT NULL,
                operation TEXT NOT NULL DEFAULT '',
                state TEXT NOT NULL DEFAULT 'closed',
                failure_count INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                failure_threshold INTEGER NOT NULL,
                success_threshold INTEGER NOT NULL,
                recovery_timeout INTEGER NOT NULL,
                last_failure_at TEXT,
                opened_at TEXT,
                next_attempt_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(service, operation)
            );

            CREATE INDEX IF NOT EXISTS idx_breaker_state
                ON api_guardian_circuit_breakers(state);
            CREATE INDEX IF NOT EXISTS idx_breaker_updated
                ON api_guardian_circuit_breakers(updated_at);
            "#,
        )?;
        Ok(())
    }
}

/// `None` operations are stored as '' so UNIQUE(service, operation) holds
fn operation_column(key: &BreakerKey) -> &str {
    key.operation().unwrap_or("")
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn breaker_from_row(row: &Row<'_>) -> rusqlite::Result<CircuitBreaker> {
    let id: String = row.get(0)?;
    let operation: String = row.get(2)?;
    let state: String = row.get(3)?;

    Ok(CircuitBreaker {
        id: Uuid::parse_str(&id).map_err(|e| conversion_error(0, e))?,
        service: row.get(1)?,
        operation: (!operation.is_empty()).then_some(operation),
        state: state
            .parse::<CircuitState>()
            .map_err(|e| conversion_error(3, e))?,
        failure_count: row.get::<_, i64>(4)? as u32,
        success_count: row.get::<_, i64>(5)? as u32,
        failure_threshold: row.get::<_, i64>(6)? as u32,
        success_threshold: row.get::<_, i64>(7)? as u32,
        recovery_timeout_secs: row.get::<_, i64>(8)? as u64,
        last_failure_at: row.get::<_, Option<DateTime<Utc>>>(9)?,
        opened_at: row.get::<_, Option<DateTime<Utc>>>(10)?,
        next_attempt_at: row.get::<_, Option<DateTime<Utc>>>(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn select_by_key(conn: &Connection, key: &BreakerKey) -> rusqlite::Result<Option<CircuitBreaker>> {
    conn.query_row(
        &format!("{SELECT_COLUMNS} WHERE service = ?1 AND operation = ?2"),
        params![key.service(), operation_column(key)],
        breaker_from_row,
    )
    .optional()
}

fn write_breaker(conn: &Connection, breaker: &CircuitBreaker) -> rusqlite::Result<usize> {
    conn.execute(
        r#"
        INSERT INTO api_guardian_circuit_breakers (
            id, service, operation, state,
            failure_count, success_count, failure_threshold, success_threshold,
            recovery_timeout, last_failure_at, opened_at, next_attempt_at,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        ON CONFLICT(service, operation)
        DO UPDATE SET
            state = excluded.state,
            failure_count = excluded.failure_count,
            success_count = excluded.success_count,
            failure_threshold = excluded.failure_threshold,
            success_threshold = excluded.success_threshold,
            recovery_timeout = excluded.recovery_timeout,
            last_failure_at = excluded.last_failure_at,
            opened_at = excluded.opened_at,
            next_attempt_at = excluded.next_attempt_at,
            updated_at = excluded.updated_at
        "#,
        params![
            breaker.id.to_string(),
            breaker.service,
            breaker.operation.as_deref().unwrap_or(""),
            breaker.state.as_str(),
            breaker.failure_count as i64,
            breaker.success_count as i64,
            breaker.failure_threshold as i64,
            breaker.success_threshold as i64,
            breaker.recovery_timeout_secs as i64,
            breaker.last_failure_at,
            breaker.opened_at,
            breaker.next_attempt_at,
            breaker.created_at,
            breaker.updated_at,
        ],
    )
}

impl BreakerStore for SqliteBreakerStore {
    fn find(&self, key: &BreakerKey) -> GuardianResult<Option<CircuitBreaker>> {
        let conn = self.conn.lock();
        Ok(select_by_key(&conn, key)?)
    }

    fn find_by_id(&self, id: Uuid) -> GuardianResult<Option<CircuitBreaker>> {
        let conn = self.conn.lock();
        let breaker = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id.to_string()],
                breaker_from_row,
            )
            .optional()?;
        Ok(breaker)
    }

    fn get_or_create(
        &self,
        key: &BreakerKey,
        template: CircuitBreaker,
    ) -> GuardianResult<CircuitBreaker> {
        let conn = self.conn.lock();

        let inserted = conn.execute(
            r#"
            INSERT INTO api_guardian_circuit_breakers (
                id, service, operation, state,
                failure_count, success_count, failure_threshold, success_threshold,
                recovery_timeout, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, 0, 0, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(service, operation) DO NOTHING
            "#,
            params![
                template.id.to_string(),
                key.service(),
                operation_column(key),
                CircuitState::Closed.as_str(),
                template.failure_threshold as i64,
                template.success_threshold as i64,
                template.recovery_timeout_secs as i64,
                template.created_at,
                template.updated_at,
            ],
        )?;

        if inserted > 0 {
            tracing::debug!(breaker = %key, id = %template.id, "Created circuit breaker");
        }

        select_by_key(&conn, key)?.ok_or_else(|| GuardianError::BreakerNotFound(key.to_string()))
    }

    fn upsert(&self, breaker: &CircuitBreaker) -> GuardianResult<CircuitBreaker> {
        let key = breaker.key();
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        write_breaker(&tx, breaker)?;
        let stored = select_by_key(&tx, &key)?;

        tx.commit()?;
        stored.ok_or_else(|| GuardianError::BreakerNotFound(key.to_string()))
    }

    fn modify(
        &self,
        key: &BreakerKey,
        f: &mut dyn FnMut(&mut CircuitBreaker),
    ) -> GuardianResult<CircuitBreaker> {
        let start = Instant::now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut breaker = select_by_key(&tx, key)?
            .ok_or_else(|| GuardianError::BreakerNotFound(key.to_string()))?;
        f(&mut breaker);
        write_breaker(&tx, &breaker)?;

        tx.commit()?;

        let elapsed = start.elapsed();
        if elapsed.as_millis() > 100 {
            tracing::warn!(
                breaker = %key,
                elapsed_ms = elapsed.as_millis() as u64,
                "Breaker update exceeded 100ms"
            );
        }

        Ok(breaker)
    }

    fn list(&self) -> GuardianResult<Vec<CircuitBreaker>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY updated_at DESC"))?;
        let breakers = stmt
            .query_map([], breaker_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(breakers)
    }
}
