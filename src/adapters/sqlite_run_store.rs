//! SQLite run store adapter.
//!
//! Persists [`ForwardTestRun`] records so runs survive daemon restarts.
//! The compare-and-set on `last_execution_date` is a single conditional
//! UPDATE, so the once-per-day guard holds even across processes sharing
//! the database file.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, Row};

use crate::domain::error::AlphaloopError;
use crate::domain::run::{ForwardTestRun, NewRun, RunId};
use crate::ports::config_port::ConfigPort;
use crate::ports::run_store_port::RunStorePort;

pub struct SqliteRunStore {
    conn: Mutex<Connection>,
}

const DATE_FORMAT: &str = "%Y-%m-%d";

fn store_err(e: impl std::fmt::Display) -> AlphaloopError {
    AlphaloopError::Store {
        reason: e.to_string(),
    }
}

impl SqliteRunStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, AlphaloopError> {
        let conn = Connection::open(path).map_err(store_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, AlphaloopError> {
        let path = config
            .get_string("store", "path")
            .ok_or_else(|| AlphaloopError::ConfigMissing {
                section: "store".into(),
                key: "path".into(),
            })?;
        Self::open(path)
    }

    pub fn in_memory() -> Result<Self, AlphaloopError> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), AlphaloopError> {
        self.conn
            .lock()
            .expect("store lock")
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS forward_test_runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    account TEXT NOT NULL,
                    formula TEXT NOT NULL,
                    tickers TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    ended_at TEXT,
                    running INTEGER NOT NULL,
                    last_execution_date TEXT,
                    trade_on_weekends INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_runs_running ON forward_test_runs(running);",
            )
            .map_err(store_err)
    }

    fn query_runs(&self, where_clause: &str) -> Result<Vec<ForwardTestRun>, AlphaloopError> {
        let conn = self.conn.lock().expect("store lock");
        let sql = format!(
            "SELECT id, account, formula, tickers, started_at, ended_at,
                    running, last_execution_date, trade_on_weekends
             FROM forward_test_runs {} ORDER BY id ASC",
            where_clause
        );
        let mut stmt = conn.prepare(&sql).map_err(store_err)?;
        let rows = stmt
            .query_map([], row_to_run)
            .map_err(store_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)?;
        Ok(rows)
    }
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<ForwardTestRun> {
    let parse_error = |i: usize, e: String| {
        rusqlite::Error::FromSqlConversionFailure(i, rusqlite::types::Type::Text, e.into())
    };

    let tickers_json: String = row.get(3)?;
    let tickers: Vec<String> =
        serde_json::from_str(&tickers_json).map_err(|e| parse_error(3, e.to_string()))?;

    let started_at_str: String = row.get(4)?;
    let started_at: DateTime<Utc> = started_at_str
        .parse()
        .map_err(|e: chrono::ParseError| parse_error(4, e.to_string()))?;

    let ended_at: Option<DateTime<Utc>> = match row.get::<_, Option<String>>(5)? {
        Some(s) => Some(
            s.parse()
                .map_err(|e: chrono::ParseError| parse_error(5, e.to_string()))?,
        ),
        None => None,
    };

    let last_execution_date = match row.get::<_, Option<String>>(7)? {
        Some(s) => Some(
            NaiveDate::parse_from_str(&s, DATE_FORMAT)
                .map_err(|e| parse_error(7, e.to_string()))?,
        ),
        None => None,
    };

    Ok(ForwardTestRun {
        id: RunId(row.get(0)?),
        account: crate::ports::broker_port::AccountRef(row.get(1)?),
        formula: row.get(2)?,
        tickers,
        started_at,
        ended_at,
        running: row.get::<_, i64>(6)? != 0,
        last_execution_date,
        trade_on_weekends: row.get::<_, i64>(8)? != 0,
    })
}

impl RunStorePort for SqliteRunStore {
    fn create_run(&self, new_run: NewRun) -> Result<ForwardTestRun, AlphaloopError> {
        let tickers_json = serde_json::to_string(&new_run.tickers).map_err(store_err)?;
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "INSERT INTO forward_test_runs
                (account, formula, tickers, started_at, ended_at, running,
                 last_execution_date, trade_on_weekends)
             VALUES (?1, ?2, ?3, ?4, NULL, 1, NULL, ?5)",
            params![
                new_run.account.0,
                new_run.formula,
                tickers_json,
                new_run.started_at.to_rfc3339(),
                new_run.trade_on_weekends as i64,
            ],
        )
        .map_err(store_err)?;
        let id = conn.last_insert_rowid();

        Ok(ForwardTestRun {
            id: RunId(id),
            account: new_run.account,
            formula: new_run.formula,
            tickers: new_run.tickers,
            started_at: new_run.started_at,
            ended_at: None,
            running: true,
            last_execution_date: None,
            trade_on_weekends: new_run.trade_on_weekends,
        })
    }

    fn get_run(&self, id: RunId) -> Result<Option<ForwardTestRun>, AlphaloopError> {
        Ok(self
            .query_runs(&format!("WHERE id = {}", id.0))?
            .into_iter()
            .next())
    }

    fn list_runs(&self) -> Result<Vec<ForwardTestRun>, AlphaloopError> {
        self.query_runs("")
    }

    fn list_active_runs(&self) -> Result<Vec<ForwardTestRun>, AlphaloopError> {
        self.query_runs("WHERE running = 1")
    }

    fn mark_executed(&self, id: RunId, date: NaiveDate) -> Result<bool, AlphaloopError> {
        let date_str = date.format(DATE_FORMAT).to_string();
        let conn = self.conn.lock().expect("store lock");
        let affected = conn
            .execute(
                "UPDATE forward_test_runs
                 SET last_execution_date = ?2
                 WHERE id = ?1
                   AND (last_execution_date IS NULL OR last_execution_date != ?2)",
                params![id.0, date_str],
            )
            .map_err(store_err)?;
        if affected == 1 {
            return Ok(true);
        }

        // Distinguish "already marked today" from "no such run".
        let exists: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM forward_test_runs WHERE id = ?1",
                params![id.0],
                |row| row.get::<_, i64>(0).map(|n| n > 0),
            )
            .map_err(store_err)?;
        if exists {
            Ok(false)
        } else {
            Err(AlphaloopError::Store {
                reason: format!("no run {}", id),
            })
        }
    }

    fn close_run(&self, id: RunId, ended_at: DateTime<Utc>) -> Result<(), AlphaloopError> {
        let conn = self.conn.lock().expect("store lock");
        let affected = conn
            .execute(
                "UPDATE forward_test_runs SET ended_at = ?2, running = 0 WHERE id = ?1",
                params![id.0, ended_at.to_rfc3339()],
            )
            .map_err(store_err)?;
        if affected == 0 {
            return Err(AlphaloopError::Store {
                reason: format!("no run {}", id),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::broker_port::AccountRef;

    fn new_run(account: &str) -> NewRun {
        NewRun {
            account: AccountRef(account.to_string()),
            formula: "sma(close, 5) - close".to_string(),
            tickers: vec!["SBER".to_string(), "GAZP".to_string()],
            started_at: "2024-03-01T10:00:00Z".parse().unwrap(),
            trade_on_weekends: true,
        }
    }

    #[test]
    fn create_and_fetch_round_trip() {
        let store = SqliteRunStore::in_memory().unwrap();
        let created = store.create_run(new_run("sandbox-1")).unwrap();
        let fetched = store.get_run(created.id).unwrap().unwrap();
        assert_eq!(created, fetched);
        assert_eq!(fetched.tickers, vec!["SBER", "GAZP"]);
        assert!(fetched.trade_on_weekends);
    }

    #[test]
    fn active_listing_excludes_closed() {
        let store = SqliteRunStore::in_memory().unwrap();
        let a = store.create_run(new_run("a")).unwrap();
        let _b = store.create_run(new_run("b")).unwrap();

        store.close_run(a.id, Utc::now()).unwrap();

        assert_eq!(store.list_runs().unwrap().len(), 2);
        let active = store.list_active_runs().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].account, AccountRef("b".to_string()));
    }

    #[test]
    fn mark_executed_cas_semantics() {
        let store = SqliteRunStore::in_memory().unwrap();
        let run = store.create_run(new_run("a")).unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();

        assert!(store.mark_executed(run.id, date).unwrap());
        assert!(!store.mark_executed(run.id, date).unwrap());
        assert_eq!(
            store.get_run(run.id).unwrap().unwrap().last_execution_date,
            Some(date)
        );

        let next_day = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert!(store.mark_executed(run.id, next_day).unwrap());
    }

    #[test]
    fn mark_executed_missing_run_errors() {
        let store = SqliteRunStore::in_memory().unwrap();
        assert!(store
            .mark_executed(RunId(99), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
            .is_err());
    }

    #[test]
    fn close_run_is_atomic_pair() {
        let store = SqliteRunStore::in_memory().unwrap();
        let run = store.create_run(new_run("a")).unwrap();
        let ended: DateTime<Utc> = "2024-03-08T12:00:00Z".parse().unwrap();

        store.close_run(run.id, ended).unwrap();

        let closed = store.get_run(run.id).unwrap().unwrap();
        assert!(!closed.running);
        assert_eq!(closed.ended_at, Some(ended));
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.sqlite");

        let id = {
            let store = SqliteRunStore::open(&path).unwrap();
            let run = store.create_run(new_run("persisted")).unwrap();
            store
                .mark_executed(run.id, NaiveDate::from_ymd_opt(2024, 3, 4).unwrap())
                .unwrap();
            run.id
        };

        let store = SqliteRunStore::open(&path).unwrap();
        let run = store.get_run(id).unwrap().unwrap();
        assert_eq!(run.account, AccountRef("persisted".to_string()));
        assert_eq!(
            run.last_execution_date,
            Some(NaiveDate::from_ymd_opt(2024, 3, 4).unwrap())
        );
    }
}
