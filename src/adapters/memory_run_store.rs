//! In-memory run store, for tests and ephemeral sandboxes.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};

use crate::domain::error::AlphaloopError;
use crate::domain::run::{ForwardTestRun, NewRun, RunId};
use crate::ports::run_store_port::RunStorePort;

#[derive(Default)]
pub struct MemoryRunStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    runs: BTreeMap<RunId, ForwardTestRun>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStorePort for MemoryRunStore {
    fn create_run(&self, new_run: NewRun) -> Result<ForwardTestRun, AlphaloopError> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.next_id += 1;
        let run = ForwardTestRun {
            id: RunId(inner.next_id),
            account: new_run.account,
            formula: new_run.formula,
            tickers: new_run.tickers,
            started_at: new_run.started_at,
            ended_at: None,
            running: true,
            last_execution_date: None,
            trade_on_weekends: new_run.trade_on_weekends,
        };
        inner.runs.insert(run.id, run.clone());
        Ok(run)
    }

    fn get_run(&self, id: RunId) -> Result<Option<ForwardTestRun>, AlphaloopError> {
        Ok(self.inner.lock().expect("store lock").runs.get(&id).cloned())
    }

    fn list_runs(&self) -> Result<Vec<ForwardTestRun>, AlphaloopError> {
        Ok(self
            .inner
            .lock()
            .expect("store lock")
            .runs
            .values()
            .cloned()
            .collect())
    }

    fn list_active_runs(&self) -> Result<Vec<ForwardTestRun>, AlphaloopError> {
        Ok(self
            .inner
            .lock()
            .expect("store lock")
            .runs
            .values()
            .filter(|r| r.running)
            .cloned()
            .collect())
    }

    fn mark_executed(&self, id: RunId, date: NaiveDate) -> Result<bool, AlphaloopError> {
        let mut inner = self.inner.lock().expect("store lock");
        let run = inner.runs.get_mut(&id).ok_or(AlphaloopError::Store {
            reason: format!("no run {}", id),
        })?;
        if run.last_execution_date == Some(date) {
            return Ok(false);
        }
        run.last_execution_date = Some(date);
        Ok(true)
    }

    fn close_run(&self, id: RunId, ended_at: DateTime<Utc>) -> Result<(), AlphaloopError> {
        let mut inner = self.inner.lock().expect("store lock");
        let run = inner.runs.get_mut(&id).ok_or(AlphaloopError::Store {
            reason: format!("no run {}", id),
        })?;
        run.ended_at = Some(ended_at);
        run.running = false;
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
            formula: "close".to_string(),
            tickers: vec!["SBER".to_string()],
            started_at: Utc::now(),
            trade_on_weekends: false,
        }
    }

    #[test]
    fn create_assigns_sequential_ids() {
        let store = MemoryRunStore::new();
        let a = store.create_run(new_run("a")).unwrap();
        let b = store.create_run(new_run("b")).unwrap();
        assert_eq!(a.id, RunId(1));
        assert_eq!(b.id, RunId(2));
        assert!(a.running);
        assert_eq!(a.last_execution_date, None);
    }

    #[test]
    fn mark_executed_is_compare_and_set() {
        let store = MemoryRunStore::new();
        let run = store.create_run(new_run("a")).unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();

        assert!(store.mark_executed(run.id, date).unwrap());
        assert!(!store.mark_executed(run.id, date).unwrap());

        let next = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert!(store.mark_executed(run.id, next).unwrap());
    }

    #[test]
    fn close_run_sets_both_fields() {
        let store = MemoryRunStore::new();
        let run = store.create_run(new_run("a")).unwrap();
        let ended = Utc::now();

        store.close_run(run.id, ended).unwrap();

        let closed = store.get_run(run.id).unwrap().unwrap();
        assert!(!closed.running);
        assert_eq!(closed.ended_at, Some(ended));
        // Closed runs are listed but no longer active.
        assert_eq!(store.list_runs().unwrap().len(), 1);
        assert!(store.list_active_runs().unwrap().is_empty());
    }

    #[test]
    fn missing_run_errors() {
        let store = MemoryRunStore::new();
        assert!(store.get_run(RunId(9)).unwrap().is_none());
        assert!(store
            .mark_executed(RunId(9), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
            .is_err());
    }
}
