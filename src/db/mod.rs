//! Pipelined PostgreSQL side channel
//!
//! One [`DbSession`] per worker pumps a pipelined backend connection;
//! handlers acquire a [`DbHandle`] from the request context and await
//! results. Commands complete in submission order; a stream that dies
//! between dispatch and completion has its result dropped by the worker's
//! liveness check.

mod query;
mod result;
mod session;

pub use query::{Completion, CompletionSink, DbShared, Query, QueryKind, SharedQueue};
pub use result::{DbResult, Rows};
pub use session::DbSession;

use log::warn;
use thiserror::Error;

use crate::task::{Slot, SlotFuture};

/// Errors fatal to the database session. The worker responds by tearing
/// the session down and connecting a fresh one.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Handler-facing query surface, bound to one stream's serial so late
/// results can be discarded after cancellation.
#[derive(Debug, Clone)]
pub struct DbHandle {
    shared: SharedQueue,
    serial: u64,
}

impl DbHandle {
    pub fn new(shared: SharedQueue, serial: u64) -> Self {
        Self { shared, serial }
    }

    fn submit(&self, kind: QueryKind, is_sync_point: bool, sink: CompletionSink) {
        self.shared.borrow_mut().push(Query {
            stream_serial: self.serial,
            is_sync_point,
            kind,
            sink,
        });
    }

    /// Awaits a plain SQL command.
    pub fn query(&self, sql: &str) -> SlotFuture<DbResult> {
        let slot = Slot::new();
        self.submit(
            QueryKind::Query { sql: sql.to_string() },
            true,
            CompletionSink::Slot(slot.clone()),
        );
        slot.wait()
    }

    /// Callback form for blocking handlers.
    pub fn query_cb(&self, sql: &str, cb: impl FnOnce(DbResult) + 'static) {
        self.submit(
            QueryKind::Query { sql: sql.to_string() },
            true,
            CompletionSink::Callback(Box::new(cb)),
        );
    }

    /// Awaits a parameterised command; parameters travel as text.
    pub fn query_params(&self, sql: &str, params: Vec<String>) -> SlotFuture<DbResult> {
        let slot = Slot::new();
        self.submit(
            QueryKind::QueryParams { sql: sql.to_string(), params },
            true,
            CompletionSink::Slot(slot.clone()),
        );
        slot.wait()
    }

    pub fn query_params_cb(
        &self,
        sql: &str,
        params: Vec<String>,
        cb: impl FnOnce(DbResult) + 'static,
    ) {
        self.submit(
            QueryKind::QueryParams { sql: sql.to_string(), params },
            true,
            CompletionSink::Callback(Box::new(cb)),
        );
    }

    /// Awaits a prepared statement, preparing it first when this session
    /// has not seen it yet. The statement's SQL lives in
    /// `{query_dir}/{statement}.sql`. Pipelining keeps the prepare ahead
    /// of the execution without a round-trip.
    pub fn query_prepared(&self, statement: &str, params: Vec<String>) -> SlotFuture<DbResult> {
        let slot: Slot<DbResult> = Slot::new();

        let needs_prepare = !self.shared.borrow().prepared.contains(statement);
        if needs_prepare {
            match self.load_statement(statement) {
                Ok(sql) => {
                    self.shared.borrow_mut().prepared.insert(statement.to_string());
                    self.submit(
                        QueryKind::Prepare {
                            statement: statement.to_string(),
                            sql,
                        },
                        false,
                        CompletionSink::Discard,
                    );
                }
                Err(message) => {
                    warn!("prepared statement {statement}: {message}");
                    slot.put(DbResult::Error(message));
                    return slot.wait();
                }
            }
        }
        self.submit(
            QueryKind::QueryPrepared {
                statement: statement.to_string(),
                params,
            },
            true,
            CompletionSink::Slot(slot.clone()),
        );
        slot.wait()
    }

    fn load_statement(&self, statement: &str) -> Result<String, String> {
        if statement.contains('/') || statement.contains("..") {
            return Err(format!("invalid statement name: {statement}"));
        }
        let dir = self
            .shared
            .borrow()
            .query_dir
            .clone()
            .ok_or_else(|| "no query directory configured".to_string())?;
        let path = dir.join(format!("{statement}.sql"));
        std::fs::read_to_string(&path)
            .map_err(|e| format!("couldn't read {}: {e}", path.display()))
    }
}

#[cfg(test)]
mod test {
    use super::{DbHandle, DbResult, DbShared, QueryKind};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn shared_with_dir(dir: Option<std::path::PathBuf>) -> super::SharedQueue {
        Rc::new(RefCell::new(DbShared {
            query_dir: dir,
            ..DbShared::default()
        }))
    }

    #[test]
    fn query_queues_a_sync_point_command_and_flags_want_write() {
        let shared = shared_with_dir(None);
        let handle = DbHandle::new(Rc::clone(&shared), 7);
        let _fut = handle.query("select 1");

        let mut state = shared.borrow_mut();
        assert!(state.take_want_write());
        assert_eq!(1, state.queued.len());
        let q = state.queued.pop_front().unwrap();
        assert_eq!(7, q.stream_serial);
        assert!(q.is_sync_point);
        assert!(matches!(q.kind, QueryKind::Query { .. }));
    }

    #[test]
    fn query_prepared_emits_prepare_then_execute_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("get_user.sql"), "select * from users where id = $1").unwrap();
        let shared = shared_with_dir(Some(dir.path().to_path_buf()));
        let handle = DbHandle::new(Rc::clone(&shared), 1);

        let _fut = handle.query_prepared("get_user", vec!["42".into()]);
        {
            let state = shared.borrow();
            assert_eq!(2, state.queued.len());
            assert!(matches!(state.queued[0].kind, QueryKind::Prepare { .. }));
            assert!(!state.queued[0].is_sync_point);
            assert!(matches!(state.queued[1].kind, QueryKind::QueryPrepared { .. }));
            assert!(state.queued[1].is_sync_point);
        }

        // second use skips the prepare
        let _fut = handle.query_prepared("get_user", vec!["43".into()]);
        assert_eq!(3, shared.borrow().queued.len());
    }

    #[test]
    fn missing_statement_file_resolves_to_an_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let shared = shared_with_dir(Some(dir.path().to_path_buf()));
        let handle = DbHandle::new(Rc::clone(&shared), 1);

        let fut = handle.query_prepared("nope", vec![]);
        let got = Rc::new(RefCell::new(None));
        let g = Rc::clone(&got);
        let mut task = crate::task::Task::new(async move {
            *g.borrow_mut() = Some(fut.await);
        });
        assert!(task.poll());
        assert!(matches!(*got.borrow(), Some(DbResult::Error(_))));
        assert!(shared.borrow().queued.is_empty());
    }
}
