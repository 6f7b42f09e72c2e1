use super::{NewRawRecord, PayloadEncoding, RawRecord, StoreError, WriteMode, WriteOutcome};
use crate::Result;
use camino::Utf8Path;
use chrono::{DateTime, SecondsFormat, Utc};
use core::fmt::{Debug, Formatter};
use core::str::FromStr;
use ohno::{IntoAppError, app_err};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::sync::{Arc, Mutex, MutexGuard};

const LOG_TARGET: &str = "     store";

/// Increment when the schema changes and add the step to `run_migrations`.
const CURRENT_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS raw_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    raw_table TEXT NOT NULL,
    params TEXT NOT NULL,
    data BLOB NOT NULL,
    encoding TEXT NOT NULL DEFAULT 'json',
    url TEXT NOT NULL,
    input TEXT,
    dedup_key TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (raw_table, params, dedup_key)
);

CREATE INDEX IF NOT EXISTS idx_raw_records_scope ON raw_records (raw_table, params);

CREATE TABLE IF NOT EXISTS tool_rows (
    table_name TEXT NOT NULL,
    params TEXT NOT NULL,
    row_key TEXT NOT NULL,
    data TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (table_name, params, row_key)
);

CREATE TABLE IF NOT EXISTS collector_state (
    raw_table TEXT NOT NULL,
    params TEXT NOT NULL,
    latest_success_start TEXT NOT NULL,
    PRIMARY KEY (raw_table, params)
);
";

/// A row type that can be materialized from a query result.
pub trait FromRow: Sized {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

/// A read query plus its positional parameters.
///
/// The SQL must carry a stable `ORDER BY` and no `LIMIT` clause; batches are cut by
/// appending `LIMIT ? OFFSET ?`.
#[derive(Debug, Clone)]
pub struct RowQuery {
    sql: String,
    params: Vec<Value>,
}

impl RowQuery {
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    #[must_use]
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    fn paged_sql(&self) -> String {
        format!("{} LIMIT ? OFFSET ?", self.sql.trim_end().trim_end_matches(';'))
    }
}

/// Formats a timestamp the way it is stored in this database.
///
/// Fixed precision keeps text comparison consistent with time order.
#[must_use]
pub fn sql_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Formats a timestamp the way the GitHub API renders them, for comparison with payload fields.
#[must_use]
pub fn api_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_timestamp(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// SQLite-backed store.
///
/// A single connection is shared behind a mutex. Every operation takes the lock for the
/// duration of one statement batch and never across an `.await`.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl Debug for SqliteStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SqliteStore").field("conn", &"<Connection>").finish()
    }
}

impl SqliteStore {
    /// Open (or create) the database at `path`, creating parent directories as needed.
    pub fn open(path: &Utf8Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_str().is_empty()
        {
            std::fs::create_dir_all(parent).into_app_err_with(|| format!("creating database directory '{parent}'"))?;
        }

        let conn = Connection::open(path).into_app_err_with(|| format!("opening database '{path}'"))?;
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .into_app_err("setting journal mode")?;

        if !journal_mode.eq_ignore_ascii_case("wal") {
            log::warn!(target: LOG_TARGET, "Database '{path}' is using journal mode '{journal_mode}' instead of WAL");
        }

        Self::from_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().into_app_err("opening in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA synchronous = NORMAL; PRAGMA busy_timeout = 5000;")
            .into_app_err("configuring database")?;

        run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("lock not poisoned")
    }

    /// Write one raw record.
    ///
    /// With [`WriteMode::Replace`] an existing row with the same key gets the new payload.
    /// With [`WriteMode::InsertOnce`] the existing row is kept and the collision is reported as
    /// [`StoreError::ConstraintViolation`].
    pub fn insert_raw(&self, record: &NewRawRecord<'_>, mode: WriteMode) -> Result<WriteOutcome, StoreError> {
        let now = sql_timestamp(Utc::now());
        let conn = self.lock();

        let inserted = conn.execute(
            "INSERT INTO raw_records (raw_table, params, data, encoding, url, input, dedup_key, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                record.raw_table,
                record.params,
                record.payload,
                record.encoding.to_string(),
                record.source_url,
                record.input,
                record.dedup_key,
                now,
            ],
        );

        match inserted.map_err(StoreError::from) {
            Ok(_) => Ok(WriteOutcome::Inserted),
            Err(StoreError::ConstraintViolation { .. }) if mode == WriteMode::Replace => {
                let _ = conn.execute(
                    "UPDATE raw_records SET data = ?1, encoding = ?2, url = ?3, input = ?4, updated_at = ?5
                     WHERE raw_table = ?6 AND params = ?7 AND dedup_key = ?8",
                    params![
                        record.payload,
                        record.encoding.to_string(),
                        record.source_url,
                        record.input,
                        now,
                        record.raw_table,
                        record.params,
                        record.dedup_key,
                    ],
                )?;
                Ok(WriteOutcome::Updated)
            }
            Err(e) => Err(e),
        }
    }

    /// Number of raw records stored for a scope.
    pub fn count_raw(&self, raw_table: &str, params: &str) -> Result<u64> {
        let count: i64 = self
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM raw_records WHERE raw_table = ?1 AND params = ?2",
                params![raw_table, params],
                |row| row.get(0),
            )
            .into_app_err_with(|| format!("counting raw records in '{raw_table}'"))?;

        Ok(count.unsigned_abs())
    }

    /// Number of extracted rows stored for a scope.
    pub fn count_tool_rows(&self, table: &str, params: &str) -> Result<u64> {
        let count: i64 = self
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM tool_rows WHERE table_name = ?1 AND params = ?2",
                params![table, params],
                |row| row.get(0),
            )
            .into_app_err_with(|| format!("counting rows in '{table}'"))?;

        Ok(count.unsigned_abs())
    }

    /// Insert or replace one extracted row.
    pub fn upsert_tool_row(&self, table: &str, params: &str, key: &str, data: &str) -> Result<()> {
        let _ = self
            .lock()
            .execute(
                "INSERT INTO tool_rows (table_name, params, row_key, data, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (table_name, params, row_key) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
                params![table, params, key, data, sql_timestamp(Utc::now())],
            )
            .into_app_err_with(|| format!("writing row '{key}' to '{table}'"))?;

        Ok(())
    }

    /// Look up one extracted row by key.
    pub fn tool_row(&self, table: &str, params: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let data: Option<String> = self
            .lock()
            .query_row(
                "SELECT data FROM tool_rows WHERE table_name = ?1 AND params = ?2 AND row_key = ?3",
                params![table, params, key],
                |row| row.get(0),
            )
            .optional()
            .into_app_err_with(|| format!("reading row '{key}' from '{table}'"))?;

        data.map(|text| serde_json::from_str(&text).into_app_err_with(|| format!("parsing row '{key}' from '{table}'")))
            .transpose()
    }

    /// Start time of the latest successful collection for a scope.
    pub fn latest_state(&self, raw_table: &str, params: &str) -> Result<Option<DateTime<Utc>>> {
        self.lock()
            .query_row(
                "SELECT latest_success_start FROM collector_state WHERE raw_table = ?1 AND params = ?2",
                params![raw_table, params],
                |row| parse_timestamp(0, &row.get::<_, String>(0)?),
            )
            .optional()
            .into_app_err_with(|| format!("reading collector state for '{raw_table}'"))
    }

    /// Record a successful collection that started at `started_at`.
    pub fn save_state(&self, raw_table: &str, params: &str, started_at: DateTime<Utc>) -> Result<()> {
        let _ = self
            .lock()
            .execute(
                "INSERT INTO collector_state (raw_table, params, latest_success_start) VALUES (?1, ?2, ?3)
                 ON CONFLICT (raw_table, params) DO UPDATE SET latest_success_start = excluded.latest_success_start",
                params![raw_table, params, sql_timestamp(started_at)],
            )
            .into_app_err_with(|| format!("saving collector state for '{raw_table}'"))?;

        Ok(())
    }

    /// Check that a query compiles against the current schema.
    pub fn validate_query(&self, query: &RowQuery) -> Result<()> {
        let conn = self.lock();
        let stmt = conn
            .prepare(&query.paged_sql())
            .into_app_err_with(|| format!("preparing query '{}'", query.sql))?;

        let expected = query.params.len() + 2;
        if stmt.parameter_count() != expected {
            return Err(app_err!(
                "query '{}' expects {} parameters but {} were bound",
                query.sql,
                stmt.parameter_count().saturating_sub(2),
                query.params.len()
            ));
        }

        Ok(())
    }

    /// Fetch one batch of rows, starting at `offset`.
    pub fn fetch_batch<T: FromRow>(&self, query: &RowQuery, offset: u64, limit: u32) -> Result<Vec<T>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare_cached(&query.paged_sql())
            .into_app_err_with(|| format!("preparing query '{}'", query.sql))?;

        let offset = i64::try_from(offset).into_app_err("query offset out of range")?;
        let bound = query
            .params
            .iter()
            .cloned()
            .chain([Value::Integer(i64::from(limit)), Value::Integer(offset)]);

        let rows = stmt
            .query_map(params_from_iter(bound), T::from_row)
            .into_app_err_with(|| format!("running query '{}'", query.sql))?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .into_app_err_with(|| format!("reading rows of query '{}'", query.sql))
    }

    /// Query selecting every raw record of a scope, oldest first.
    #[must_use]
    pub fn raw_records_query(raw_table: &str, params: &str) -> RowQuery {
        RowQuery::new(
            "SELECT id, raw_table, params, data, encoding, url, input, dedup_key, created_at, updated_at
             FROM raw_records WHERE raw_table = ? AND params = ? ORDER BY id",
        )
        .bind(raw_table.to_string())
        .bind(params.to_string())
    }
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
        .into_app_err("creating schema version table")?;

    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
        .into_app_err("reading schema version")?;
    let version = version.unwrap_or(0);

    if version > CURRENT_SCHEMA_VERSION {
        return Err(app_err!(
            "database schema version {version} is newer than the supported version {CURRENT_SCHEMA_VERSION}"
        ));
    }

    if version < 1 {
        log::debug!(target: LOG_TARGET, "Creating database schema version 1");
        conn.execute_batch(SCHEMA_V1).into_app_err("creating database schema")?;
        let _ = conn
            .execute("INSERT INTO schema_version (version) VALUES (?1)", params![CURRENT_SCHEMA_VERSION])
            .into_app_err("recording schema version")?;
    }

    Ok(())
}

impl FromRow for RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let encoding: String = row.get("encoding")?;
        let encoding = PayloadEncoding::from_str(&encoding)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;

        Ok(Self {
            id: row.get("id")?,
            raw_table: row.get("raw_table")?,
            params: row.get("params")?,
            payload: row.get("data")?,
            encoding,
            source_url: row.get("url")?,
            input: row.get("input")?,
            dedup_key: row.get("dedup_key")?,
            created_at: parse_timestamp(8, &row.get::<_, String>("created_at")?)?,
            updated_at: parse_timestamp(9, &row.get::<_, String>("updated_at")?)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CollectionParams;

    fn record<'a>(params: &'a str, key: &'a str, payload: &'a [u8]) -> NewRawRecord<'a> {
        NewRawRecord {
            raw_table: "github_api_commit_statuses",
            params,
            payload,
            encoding: PayloadEncoding::Json,
            source_url: "https://api.github.com/repos/o/r/commits/abc/statuses",
            input: Some(r#"{"commit_sha":"abc"}"#),
            dedup_key: key,
        }
    }

    fn params_key() -> String {
        CollectionParams::new(1, "o/r").to_key().unwrap()
    }

    #[test]
    fn replace_mode_updates_existing_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        let params = params_key();

        let first = store.insert_raw(&record(&params, "1", br#"{"id":1,"state":"pending"}"#), WriteMode::Replace);
        let second = store.insert_raw(&record(&params, "1", br#"{"id":1,"state":"success"}"#), WriteMode::Replace);

        assert_eq!(first.unwrap(), WriteOutcome::Inserted);
        assert_eq!(second.unwrap(), WriteOutcome::Updated);
        assert_eq!(store.count_raw("github_api_commit_statuses", &params).unwrap(), 1);

        let rows: Vec<RawRecord> = store
            .fetch_batch(&SqliteStore::raw_records_query("github_api_commit_statuses", &params), 0, 10)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].payload, br#"{"id":1,"state":"success"}"#);
        assert_eq!(rows[0].input.as_deref(), Some(r#"{"commit_sha":"abc"}"#));
    }

    #[test]
    fn insert_once_reports_typed_duplicate() {
        let store = SqliteStore::open_in_memory().unwrap();
        let params = params_key();

        store.insert_raw(&record(&params, "k", b"{}"), WriteMode::InsertOnce).unwrap();
        let err = store.insert_raw(&record(&params, "k", b"{}"), WriteMode::InsertOnce).unwrap_err();

        assert!(err.is_constraint_violation());
        assert_eq!(store.count_raw("github_api_commit_statuses", &params).unwrap(), 1);
    }

    #[test]
    fn same_key_in_other_scope_is_independent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = CollectionParams::new(1, "o/a").to_key().unwrap();
        let b = CollectionParams::new(1, "o/b").to_key().unwrap();

        store.insert_raw(&record(&a, "k", b"{}"), WriteMode::InsertOnce).unwrap();
        store.insert_raw(&record(&b, "k", b"{}"), WriteMode::InsertOnce).unwrap();

        assert_eq!(store.count_raw("github_api_commit_statuses", &a).unwrap(), 1);
        assert_eq!(store.count_raw("github_api_commit_statuses", &b).unwrap(), 1);
    }

    #[test]
    fn collector_state_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        let params = params_key();
        assert!(store.latest_state("t", &params).unwrap().is_none());

        let first = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let second = DateTime::parse_from_rfc3339("2024-02-01T00:00:00.5Z").unwrap().with_timezone(&Utc);
        store.save_state("t", &params, first).unwrap();
        store.save_state("t", &params, second).unwrap();

        assert_eq!(store.latest_state("t", &params).unwrap(), Some(second));
    }

    #[test]
    fn tool_rows_upsert_by_key() {
        let store = SqliteStore::open_in_memory().unwrap();
        let params = params_key();

        store.upsert_tool_row("cicd_statuses", &params, "7", r#"{"state":"pending"}"#).unwrap();
        store.upsert_tool_row("cicd_statuses", &params, "7", r#"{"state":"success"}"#).unwrap();

        assert_eq!(store.count_tool_rows("cicd_statuses", &params).unwrap(), 1);
        let row = store.tool_row("cicd_statuses", &params, "7").unwrap().unwrap();
        assert_eq!(row["state"], "success");
    }

    #[test]
    fn validate_query_rejects_bad_sql_and_parameter_mismatch() {
        let store = SqliteStore::open_in_memory().unwrap();

        assert!(store.validate_query(&RowQuery::new("SELECT nope FROM nowhere")).is_err());
        assert!(store.validate_query(&RowQuery::new("SELECT id FROM raw_records WHERE id = ?")).is_err());
        store
            .validate_query(&RowQuery::new("SELECT id FROM raw_records WHERE id = ? ORDER BY id").bind(1_i64))
            .unwrap();
    }

    #[test]
    fn reopening_file_database_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("nested").join("ghsync.db")).unwrap();
        let params = params_key();

        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_raw(&record(&params, "1", b"{}"), WriteMode::Replace).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.count_raw("github_api_commit_statuses", &params).unwrap(), 1);
    }
}
