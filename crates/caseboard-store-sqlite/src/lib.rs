#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use caseboard_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, Case, CaseFields, CaseId, CreatedCase,
    RecordStore, StoreError,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use time::OffsetDateTime;

const CASES_MIGRATION_VERSION: i64 = 1;
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(1000);

const SCHEMA_CASES_V1: &str = r"
CREATE TABLE IF NOT EXISTS cases (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  case_number TEXT NOT NULL UNIQUE,
  title TEXT NOT NULL,
  description TEXT,
  status TEXT NOT NULL,
  created_datetime TEXT NOT NULL,
  last_modified_datetime TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cases_id ON cases(id);
";

const SELECT_CASE_COLUMNS: &str = "SELECT
    id, case_number, title, description, status, created_datetime, last_modified_datetime
 FROM cases";

/// `SQLite` backed [`RecordStore`].
///
/// A single connection is shared behind a mutex, so every store operation is
/// serialized. The `UNIQUE` constraint on `case_number` is what guarantees
/// that concurrent inserts of one key produce a single row.
pub struct SqliteCaseStore {
    conn: Mutex<Connection>,
}

impl SqliteCaseStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Opens the store with an explicit lock wait. Callers that bound each
    /// operation by a deadline pass a wait shorter than that deadline.
    pub fn open_with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;
        conn.busy_timeout(busy_timeout)
            .context("failed to configure sqlite busy timeout")?;

        tracing::debug!(
            path = %path.display(),
            busy_timeout_ms = %busy_timeout.as_millis(),
            "opened case store"
        );
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    /// Creates the `cases` table when missing. Safe to call on every start.
    pub fn migrate(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("case store connection lock poisoned"))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        conn.execute_batch(SCHEMA_CASES_V1)
            .context("failed to apply cases schema")?;

        let now = format_rfc3339(now_utc()).context("failed to format migration timestamp")?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![CASES_MIGRATION_VERSION, now],
        )
        .context("failed to register cases schema migration")?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("case store connection lock poisoned".to_string()))
    }
}

impl RecordStore for SqliteCaseStore {
    fn create(&self, fields: &CaseFields) -> Result<CreatedCase, StoreError> {
        let now = now_utc();
        let stamp = format_timestamp(now)?;
        let conn = self.lock()?;

        let inserted = conn.execute(
            "INSERT INTO cases(
                case_number, title, description, status,
                created_datetime, last_modified_datetime
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                fields.case_number,
                fields.title,
                fields.description,
                fields.status,
                stamp,
            ],
        );

        match inserted {
            Ok(_) => Ok(CreatedCase {
                id: CaseId(conn.last_insert_rowid()),
                created_date_time: now,
                last_modified_date_time: now,
            }),
            Err(err) if is_unique_violation(&err) => Err(StoreError::UniqueViolation {
                case_number: fields.case_number.clone(),
            }),
            Err(err) => Err(backend("failed to insert case", &err)),
        }
    }

    fn find_by_id(&self, id: CaseId) -> Result<Option<Case>, StoreError> {
        let conn = self.lock()?;
        select_case(&conn, id).map_err(|err| backend("failed to load case", &err))
    }

    fn find_all(&self) -> Result<Vec<Case>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("{SELECT_CASE_COLUMNS} ORDER BY id ASC"))
            .map_err(|err| backend("failed to prepare case listing", &err))?;

        let rows = stmt
            .query_map([], parse_case_row)
            .map_err(|err| backend("failed to list cases", &err))?;

        let mut cases = Vec::new();
        for row in rows {
            cases.push(row.map_err(|err| backend("failed to decode case row", &err))?);
        }
        Ok(cases)
    }

    fn save(&self, case: &Case) -> Result<Case, StoreError> {
        let stamp = format_timestamp(now_utc())?;
        let conn = self.lock()?;

        let changed = conn
            .execute(
                "UPDATE cases
                 SET title = ?1, description = ?2, status = ?3, last_modified_datetime = ?4
                 WHERE id = ?5",
                params![case.title, case.description, case.status, stamp, case.id.0],
            )
            .map_err(|err| backend("failed to update case", &err))?;

        if changed == 0 {
            return Err(StoreError::RecordMissing { id: case.id });
        }

        select_case(&conn, case.id)
            .map_err(|err| backend("failed to reload case", &err))?
            .ok_or(StoreError::RecordMissing { id: case.id })
    }

    fn delete_by_id(&self, id: CaseId) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM cases WHERE id = ?1", params![id.0])
            .map_err(|err| backend("failed to delete case", &err))?;
        Ok(())
    }
}

fn select_case(conn: &Connection, id: CaseId) -> rusqlite::Result<Option<Case>> {
    conn.query_row(
        &format!("{SELECT_CASE_COLUMNS} WHERE id = ?1"),
        params![id.0],
        parse_case_row,
    )
    .optional()
}

fn parse_case_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Case> {
    let created_raw: String = row.get(5)?;
    let modified_raw: String = row.get(6)?;

    Ok(Case {
        id: CaseId(row.get(0)?),
        case_number: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: row.get(4)?,
        created_date_time: parse_timestamp(5, &created_raw)?,
        last_modified_date_time: parse_timestamp(6, &modified_raw)?,
    })
}

fn parse_timestamp(column: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid RFC3339 timestamp {raw}: {err}"),
            )),
        )
    })
}

fn format_timestamp(value: OffsetDateTime) -> Result<String, StoreError> {
    format_rfc3339(value)
        .map_err(|err| StoreError::Backend(format!("failed to format timestamp: {err}")))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation
                && failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn backend(context: &str, err: &rusqlite::Error) -> StoreError {
    tracing::warn!(error = %err, "{context}");
    StoreError::Backend(format!("{context}: {err}"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use caseboard_core::{CaseError, CaseInput, CaseService};
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteCaseStore {
        let store = must(SqliteCaseStore::open_in_memory());
        must(store.migrate());
        store
    }

    fn fixture_fields(case_number: &str) -> CaseFields {
        CaseFields {
            case_number: case_number.to_string(),
            title: "Title 001".to_string(),
            description: Some("Description 001".to_string()),
            status: "Status 001".to_string(),
        }
    }

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("caseboard-store-{}.sqlite3", ulid::Ulid::new()))
    }

    #[test]
    fn insert_once_then_find_by_id() {
        let store = fixture_store();

        let created = must(store.create(&fixture_fields("CASE_001")));
        let found = match must(store.find_by_id(created.id)) {
            Some(value) => value,
            None => panic!("inserted case not found"),
        };

        assert_eq!(found.id, created.id);
        assert_eq!(found.case_number, "CASE_001");
        assert_eq!(found.description.as_deref(), Some("Description 001"));
        assert_eq!(found.created_date_time, created.created_date_time);
        assert_eq!(found.last_modified_date_time, created.last_modified_date_time);
        assert_eq!(found.created_date_time, found.last_modified_date_time);
    }

    #[test]
    fn insert_with_same_case_number_twice_is_unique_violation() {
        let store = fixture_store();
        must(store.create(&fixture_fields("CASE_001")));

        let second = store.create(&fixture_fields("CASE_001"));

        assert_eq!(
            second,
            Err(StoreError::UniqueViolation {
                case_number: "CASE_001".to_string()
            })
        );
        assert_eq!(must(store.find_all()).len(), 1);
    }

    #[test]
    fn missing_description_is_stored_as_null() {
        let store = fixture_store();
        let mut fields = fixture_fields("CASE_001");
        fields.description = None;

        let created = must(store.create(&fields));
        let found = must(store.find_by_id(created.id));

        assert_eq!(found.and_then(|case| case.description), None);
    }

    #[test]
    fn find_all_returns_ascending_ids_and_empty_when_unseeded() {
        let store = fixture_store();
        assert!(must(store.find_all()).is_empty());

        let first = must(store.create(&fixture_fields("CASE_001")));
        let second = must(store.create(&fixture_fields("CASE_002")));

        let ids: Vec<CaseId> = must(store.find_all()).into_iter().map(|case| case.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[test]
    fn save_only_touches_mutable_columns() {
        let store = fixture_store();
        let created = must(store.create(&fixture_fields("CASE_001")));
        let original = match must(store.find_by_id(created.id)) {
            Some(value) => value,
            None => panic!("inserted case not found"),
        };

        let mut mutated = original.clone();
        mutated.case_number = "CASE_HIJACK".to_string();
        mutated.created_date_time = must(parse_rfc3339_utc("2000-01-01T00:00:00Z"));
        mutated.title = "Title 002".to_string();
        mutated.description = None;
        mutated.status = "Status 002".to_string();

        let saved = must(store.save(&mutated));

        assert_eq!(saved.id, original.id);
        assert_eq!(saved.case_number, "CASE_001");
        assert_eq!(saved.created_date_time, original.created_date_time);
        assert!(saved.last_modified_date_time >= original.last_modified_date_time);
        assert_eq!(saved.title, "Title 002");
        assert_eq!(saved.description, None);
        assert_eq!(saved.status, "Status 002");
    }

    #[test]
    fn save_on_missing_row_reports_record_missing() {
        let store = fixture_store();
        let created = must(store.create(&fixture_fields("CASE_001")));
        let case = match must(store.find_by_id(created.id)) {
            Some(value) => value,
            None => panic!("inserted case not found"),
        };
        must(store.delete_by_id(created.id));

        assert_eq!(
            store.save(&case),
            Err(StoreError::RecordMissing { id: created.id })
        );
    }

    #[test]
    fn delete_absent_id_is_noop() {
        let store = fixture_store();
        must(store.delete_by_id(CaseId(999)));

        let created = must(store.create(&fixture_fields("CASE_001")));
        must(store.delete_by_id(created.id));
        must(store.delete_by_id(created.id));

        assert!(must(store.find_by_id(created.id)).is_none());
    }

    #[test]
    fn deleted_case_number_can_be_reused() {
        let store = fixture_store();
        let created = must(store.create(&fixture_fields("CASE_001")));
        must(store.delete_by_id(created.id));

        let recreated = must(store.create(&fixture_fields("CASE_001")));

        assert!(recreated.id > created.id);
    }

    fn configured_busy_timeout_ms(store: &SqliteCaseStore) -> i64 {
        let conn = must(store.lock());
        must(conn.query_row("PRAGMA busy_timeout", [], |row| row.get::<_, i64>(0)))
    }

    #[test]
    fn busy_timeout_follows_open_arguments() {
        assert_eq!(configured_busy_timeout_ms(&fixture_store()), 1000);

        let bounded = must(SqliteCaseStore::open_with_busy_timeout(
            Path::new(":memory:"),
            Duration::from_millis(250),
        ));
        assert_eq!(configured_busy_timeout_ms(&bounded), 250);
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = fixture_store();
        must(store.create(&fixture_fields("CASE_001")));

        must(store.migrate());

        assert_eq!(must(store.find_all()).len(), 1);
    }

    #[test]
    fn file_backed_store_persists_across_reopen() {
        let db_path = unique_temp_db_path();
        let id = {
            let store = must(SqliteCaseStore::open(&db_path));
            must(store.migrate());
            must(store.create(&fixture_fields("CASE_001"))).id
        };

        let reopened = must(SqliteCaseStore::open(&db_path));
        must(reopened.migrate());
        let found = must(reopened.find_by_id(id));
        assert_eq!(found.map(|case| case.case_number), Some("CASE_001".to_string()));

        drop(reopened);
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn service_over_sqlite_runs_full_scenario() {
        let service = CaseService::from_store(fixture_store());

        let id = must(service.insert(&CaseInput::new("CASE001", "T1", "OPEN")));
        must(service.update(id, &CaseInput::new("IGNORED", "T2", "CLOSED")));
        let updated = match must(service.get_by_id(id)) {
            Some(value) => value,
            None => panic!("updated case not found"),
        };
        assert_eq!(updated.case_number, "CASE001");
        assert_eq!(updated.title, "T2");

        assert_eq!(
            service.insert(&CaseInput::new("CASE001", "T3", "OPEN")),
            Err(CaseError::DuplicateCaseNumber {
                case_number: "CASE001".to_string()
            })
        );

        must(service.delete_by_id(id));
        assert!(must(service.get_by_id(id)).is_none());
        assert_eq!(
            service.update(id, &CaseInput::new("CASE001", "T4", "OPEN")),
            Err(CaseError::CaseNotFound { id })
        );
    }

    #[test]
    fn concurrent_duplicate_inserts_create_one_row() {
        let store = Arc::new(fixture_store());

        let outcomes: Vec<Result<CreatedCase, StoreError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let store = Arc::clone(&store);
                    scope.spawn(move || store.create(&fixture_fields("CASE_RACE")))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(outcome) => outcome,
                    Err(_) => panic!("insert thread panicked"),
                })
                .collect()
        });

        assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
        assert_eq!(must(store.find_all()).len(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_one_row_per_distinct_case_number(keys in prop::collection::vec(0u8..6, 1..40)) {
            let store = fixture_store();
            let mut accepted = BTreeSet::new();

            for key in keys {
                let case_number = format!("CASE_{key:03}");
                match store.create(&fixture_fields(&case_number)) {
                    Ok(_) => prop_assert!(accepted.insert(case_number)),
                    Err(StoreError::UniqueViolation { case_number }) => {
                        prop_assert!(accepted.contains(&case_number));
                    }
                    Err(err) => panic!("unexpected store failure: {err}"),
                }
            }

            let stored: BTreeSet<String> = must(store.find_all())
                .into_iter()
                .map(|case| case.case_number)
                .collect();
            prop_assert_eq!(stored, accepted);
        }
    }
}
