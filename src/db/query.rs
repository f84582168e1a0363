//! Queued commands and completion plumbing

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::rc::Rc;

use crate::task::Slot;

use super::result::DbResult;

/// The four pipelined command forms.
#[derive(Debug)]
pub enum QueryKind {
    Query { sql: String },
    QueryParams { sql: String, params: Vec<String> },
    Prepare { statement: String, sql: String },
    QueryPrepared { statement: String, params: Vec<String> },
}

/// Where a command's terminal result goes: a suspended handler task's slot
/// or a plain callback.
pub enum CompletionSink {
    Slot(Slot<DbResult>),
    Callback(Box<dyn FnOnce(DbResult)>),
    /// Internal commands (the prepare half of a prepared query).
    Discard,
}

impl CompletionSink {
    pub fn deliver(self, result: DbResult) {
        match self {
            Self::Slot(slot) => slot.put(result),
            Self::Callback(cb) => cb(result),
            Self::Discard => {}
        }
    }
}

impl std::fmt::Debug for CompletionSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Slot(_) => "Slot",
            Self::Callback(_) => "Callback",
            Self::Discard => "Discard",
        })
    }
}

/// One command awaiting write to the backend.
#[derive(Debug)]
pub struct Query {
    pub stream_serial: u64,
    /// A pipeline fence is emitted after this command.
    pub is_sync_point: bool,
    pub kind: QueryKind,
    pub sink: CompletionSink,
}

/// How a dispatched command terminates on the wire: a bare `Parse` ends at
/// ParseComplete, a portal run ends at CommandComplete (or an error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandShape {
    Statement,
    Portal,
}

/// One command whose results are still in flight.
#[derive(Debug)]
pub struct DispatchedQuery {
    pub stream_serial: u64,
    pub is_sync_point: bool,
    pub shape: CommandShape,
    pub sink: Option<CompletionSink>,
}

/// A delivered terminal, handed to the worker which checks stream
/// liveness before firing the sink.
#[derive(Debug)]
pub struct Completion {
    pub stream_serial: u64,
    pub sink: CompletionSink,
    pub result: DbResult,
}

/// Command queue shared between handler-facing handles and the session
/// pump. Single-threaded; the worker drains `want_write` after polling
/// handler tasks.
#[derive(Debug, Default)]
pub struct DbShared {
    pub queued: VecDeque<Query>,
    pub prepared: HashSet<String>,
    pub query_dir: Option<PathBuf>,
    pub want_write: bool,
    pub connected: bool,
}

pub type SharedQueue = Rc<RefCell<DbShared>>;

impl DbShared {
    pub fn push(&mut self, query: Query) {
        self.queued.push_back(query);
        self.want_write = true;
    }

    pub fn take_want_write(&mut self) -> bool {
        std::mem::take(&mut self.want_write)
    }
}
