//! Pipelined database session
//!
//! One backend connection per worker. Commands wait in the shared queue,
//! move to `dispatched` as they are written in batches, and complete in
//! order as results stream back. A sync point appends a pipeline fence;
//! the fence's ReadyForQuery pops the record and surfaces aborted commands
//! that never saw a terminal of their own. Fatal errors tear the session
//! down; the worker builds a fresh one.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::ToSocketAddrs;
use std::rc::Rc;

use bytes::{Buf, BytesMut};
use fallible_iterator::FallibleIterator;
use log::{debug, error, warn};
use mio::net::TcpStream;
use mio::Interest;
use postgres_protocol::authentication::md5_hash;
use postgres_protocol::message::backend::Message;
use postgres_protocol::message::frontend;
use postgres_protocol::IsNull;

use super::query::{
    CommandShape, Completion, DispatchedQuery, Query, QueryKind, SharedQueue,
};
use super::result::{DbResult, Rows};
use super::DbError;

/// Queries are flushed to the backend in batches of this many.
const WRITE_BATCH: usize = 20;

/// Orders results back onto dispatched commands.
#[derive(Debug, Default)]
pub(crate) struct Pipeline {
    pub dispatched: VecDeque<DispatchedQuery>,
    columns: Option<Vec<String>>,
    rows: Vec<Vec<Option<Rc<str>>>>,
    completions: Vec<Completion>,
    notifications: Vec<(String, String)>,
}

impl Pipeline {
    fn fire_head(&mut self, result: DbResult) {
        if let Some(head) = self.dispatched.front_mut() {
            if let Some(sink) = head.sink.take() {
                self.completions.push(Completion {
                    stream_serial: head.stream_serial,
                    sink,
                    result,
                });
            }
        }
    }

    fn pop_if_plain(&mut self) {
        if self.dispatched.front().is_some_and(|h| !h.is_sync_point) {
            self.dispatched.pop_front();
        }
    }

    fn finish_result_set(&mut self) -> DbResult {
        match self.columns.take() {
            Some(columns) => DbResult::from_rows(Rows::new(columns, std::mem::take(&mut self.rows))),
            None => DbResult::Empty,
        }
    }

    pub fn on_message(&mut self, message: Message) -> Result<(), DbError> {
        match message {
            Message::ParseComplete => {
                if self
                    .dispatched
                    .front()
                    .is_some_and(|h| h.shape == CommandShape::Statement)
                {
                    self.fire_head(DbResult::Empty);
                    self.pop_if_plain();
                }
            }
            Message::BindComplete
            | Message::NoData
            | Message::PortalSuspended
            | Message::CloseComplete
            | Message::ParameterStatus(_)
            | Message::BackendKeyData(_) => {}
            Message::RowDescription(body) => {
                let mut names = Vec::new();
                let mut fields = body.fields();
                while let Some(field) = fields.next().map_err(|e| DbError::Protocol(e.to_string()))? {
                    names.push(field.name().to_string());
                }
                self.columns = Some(names);
                self.rows.clear();
            }
            Message::DataRow(body) => {
                let buffer = body.buffer();
                let mut row = Vec::new();
                let mut ranges = body.ranges();
                while let Some(range) = ranges.next().map_err(|e| DbError::Protocol(e.to_string()))? {
                    row.push(range.map(|r| {
                        Rc::from(String::from_utf8_lossy(&buffer[r]).into_owned())
                    }));
                }
                self.rows.push(row);
            }
            Message::CommandComplete(_) => {
                let result = self.finish_result_set();
                self.fire_head(result);
                self.pop_if_plain();
            }
            Message::EmptyQueryResponse => {
                warn!("application sent empty query");
                self.fire_head(DbResult::Error("empty query".into()));
                self.pop_if_plain();
            }
            Message::ErrorResponse(body) => {
                let mut message = String::from("backend error");
                let mut fields = body.fields();
                while let Some(field) = fields.next().map_err(|e| DbError::Protocol(e.to_string()))? {
                    if field.type_() == b'M' {
                        message = field.value().to_string();
                    }
                }
                warn!("backend error: {message}");
                self.columns = None;
                self.rows.clear();
                self.fire_head(DbResult::Error(message));
                self.pop_if_plain();
            }
            Message::ReadyForQuery(_) => {
                // pipeline fence: pop through the sync record, erroring
                // out anything the abort skipped
                while let Some(head) = self.dispatched.front_mut() {
                    let sync = head.is_sync_point;
                    if let Some(sink) = head.sink.take() {
                        self.completions.push(Completion {
                            stream_serial: head.stream_serial,
                            sink,
                            result: DbResult::Error("pipeline aborted".into()),
                        });
                    }
                    self.dispatched.pop_front();
                    if sync {
                        break;
                    }
                }
            }
            Message::NotificationResponse(body) => {
                let channel = body
                    .channel()
                    .map_err(|e| DbError::Protocol(e.to_string()))?
                    .to_string();
                let payload = body
                    .message()
                    .map_err(|e| DbError::Protocol(e.to_string()))?
                    .to_string();
                self.notifications.push((channel, payload));
            }
            Message::NoticeResponse(_) => debug!("backend notice"),
            Message::CopyInResponse(_) | Message::CopyOutResponse(_) => {
                return Err(DbError::Protocol("unexpected copy operation".into()));
            }
            _ => debug!("ignoring unexpected backend message"),
        }
        Ok(())
    }

    fn take_completions(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completions)
    }

    fn take_notifications(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.notifications)
    }
}

#[derive(Debug, Clone)]
struct ConnParams {
    host: String,
    port: u16,
    user: String,
    password: String,
    dbname: String,
}

/// Parses a libpq-style `key=value` connection string.
fn parse_conn_string(s: &str) -> Result<ConnParams, DbError> {
    let mut params = ConnParams {
        host: "127.0.0.1".into(),
        port: 5432,
        user: String::new(),
        password: String::new(),
        dbname: String::new(),
    };
    for pair in s.split_whitespace() {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(DbError::Connect(format!("malformed connection option: {pair}")));
        };
        match key {
            "host" => params.host = value.to_string(),
            "port" => {
                params.port = value
                    .parse()
                    .map_err(|_| DbError::Connect(format!("invalid port: {value}")))?;
            }
            "user" => params.user = value.to_string(),
            "password" => params.password = value.to_string(),
            "dbname" => params.dbname = value.to_string(),
            other => debug!("ignoring connection option {other}"),
        }
    }
    if params.user.is_empty() {
        return Err(DbError::Connect("connection string must set user".into()));
    }
    if params.dbname.is_empty() {
        params.dbname = params.user.clone();
    }
    Ok(params)
}

#[derive(Debug, PartialEq, Eq)]
enum DbState {
    /// TCP connect in flight; startup message not yet sent.
    Opening,
    /// Startup sent; exchanging authentication.
    Authenticating,
    Ready,
    Closed,
}

/// One pipelined backend connection, driven by the worker's poll loop.
pub struct DbSession {
    sock: TcpStream,
    state: DbState,
    params: ConnParams,
    outbuf: BytesMut,
    inbuf: BytesMut,
    pipeline: Pipeline,
    shared: SharedQueue,
}

impl DbSession {
    /// Starts a non-blocking connect. The worker registers the socket and
    /// drives the handshake from readiness events.
    pub fn connect(conn_str: &str, shared: SharedQueue) -> Result<Self, DbError> {
        let params = parse_conn_string(conn_str)?;
        let addr = (params.host.as_str(), params.port)
            .to_socket_addrs()
            .map_err(|e| DbError::Connect(format!("resolve {}: {e}", params.host)))?
            .next()
            .ok_or_else(|| DbError::Connect(format!("no address for {}", params.host)))?;
        let sock = TcpStream::connect(addr).map_err(|e| DbError::Connect(e.to_string()))?;
        shared.borrow_mut().connected = false;
        Ok(Self {
            sock,
            state: DbState::Opening,
            params,
            outbuf: BytesMut::new(),
            inbuf: BytesMut::new(),
            pipeline: Pipeline::default(),
            shared,
        })
    }

    pub fn socket(&mut self) -> &mut TcpStream {
        &mut self.sock
    }

    pub fn connected(&self) -> bool {
        self.state == DbState::Ready
    }

    pub fn interests(&self) -> Interest {
        let queued = !self.shared.borrow().queued.is_empty();
        match self.state {
            DbState::Ready if self.outbuf.is_empty() && !queued => Interest::READABLE,
            DbState::Closed => Interest::READABLE,
            _ => Interest::READABLE | Interest::WRITABLE,
        }
    }

    pub fn on_writable(&mut self) -> Result<(), DbError> {
        match self.state {
            DbState::Opening => {
                if let Ok(Some(e)) | Err(e) = self.sock.take_error() {
                    return Err(DbError::Connect(e.to_string()));
                }
                frontend::startup_message(
                    [
                        ("user", self.params.user.as_str()),
                        ("database", self.params.dbname.as_str()),
                    ],
                    &mut self.outbuf,
                )
                .map_err(|e| DbError::Connect(e.to_string()))?;
                self.state = DbState::Authenticating;
                self.flush_out()?;
                Ok(())
            }
            DbState::Authenticating => {
                self.flush_out()?;
                Ok(())
            }
            DbState::Ready => self.pump_write(),
            DbState::Closed => Ok(()),
        }
    }

    /// Called after handler tasks queued new commands.
    pub fn kick(&mut self) -> Result<(), DbError> {
        if self.state == DbState::Ready {
            self.pump_write()
        } else {
            Ok(())
        }
    }

    pub fn on_readable(&mut self) -> Result<Vec<Completion>, DbError> {
        let mut scratch = [0u8; 8192];
        loop {
            match self.sock.read(&mut scratch) {
                Ok(0) => return Err(DbError::Protocol("backend closed the connection".into())),
                Ok(n) => self.inbuf.extend_from_slice(&scratch[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(DbError::Io(e)),
            }
        }

        while let Some(message) =
            Message::parse(&mut self.inbuf).map_err(|e| DbError::Protocol(e.to_string()))?
        {
            match self.state {
                DbState::Opening | DbState::Authenticating => self.on_auth_message(message)?,
                DbState::Ready => self.pipeline.on_message(message)?,
                DbState::Closed => break,
            }
        }

        // results may have freed room in the pipeline; push what queued up
        if self.state == DbState::Ready {
            self.pump_write()?;
        }
        Ok(self.pipeline.take_completions())
    }

    fn on_auth_message(&mut self, message: Message) -> Result<(), DbError> {
        match message {
            Message::AuthenticationOk => Ok(()),
            Message::AuthenticationCleartextPassword => {
                frontend::password_message(self.params.password.as_bytes(), &mut self.outbuf)
                    .map_err(|e| DbError::Auth(e.to_string()))?;
                self.flush_out()
            }
            Message::AuthenticationMd5Password(body) => {
                let hashed = md5_hash(
                    self.params.user.as_bytes(),
                    self.params.password.as_bytes(),
                    body.salt(),
                );
                frontend::password_message(hashed.as_bytes(), &mut self.outbuf)
                    .map_err(|e| DbError::Auth(e.to_string()))?;
                self.flush_out()
            }
            Message::AuthenticationSasl(_) => {
                Err(DbError::Auth("SASL authentication is not supported".into()))
            }
            Message::ErrorResponse(body) => {
                let mut message = String::from("authentication failed");
                let mut fields = body.fields();
                while let Some(field) =
                    fields.next().map_err(|e| DbError::Protocol(e.to_string()))?
                {
                    if field.type_() == b'M' {
                        message = field.value().to_string();
                    }
                }
                Err(DbError::Connect(message))
            }
            Message::ReadyForQuery(_) => {
                debug!("database session ready, host {}", self.params.host);
                self.state = DbState::Ready;
                self.shared.borrow_mut().connected = true;
                self.pump_write()
            }
            Message::ParameterStatus(_) | Message::BackendKeyData(_) | Message::NoticeResponse(_) => {
                Ok(())
            }
            _ => Err(DbError::Protocol("unexpected message during startup".into())),
        }
    }

    /// Write pending bytes, then encode queued commands in batches of
    /// [`WRITE_BATCH`], fencing each sync point.
    fn pump_write(&mut self) -> Result<(), DbError> {
        loop {
            if !self.flush_fully()? {
                return Ok(());
            }
            let batch: Vec<Query> = {
                let mut shared = self.shared.borrow_mut();
                let take = shared.queued.len().min(WRITE_BATCH);
                shared.queued.drain(..take).collect()
            };
            if batch.is_empty() {
                return Ok(());
            }
            for query in batch {
                self.encode(query)?;
            }
        }
    }

    fn encode(&mut self, query: Query) -> Result<(), DbError> {
        let shape = match &query.kind {
            QueryKind::Prepare { .. } => CommandShape::Statement,
            _ => CommandShape::Portal,
        };
        match &query.kind {
            QueryKind::Query { sql } => {
                self.parse_statement("", sql)?;
                self.bind_portal("", &[])?;
                self.execute_portal()?;
            }
            QueryKind::QueryParams { sql, params } => {
                self.parse_statement("", sql)?;
                self.bind_portal("", params)?;
                self.execute_portal()?;
            }
            QueryKind::Prepare { statement, sql } => {
                self.parse_statement(statement, sql)?;
            }
            QueryKind::QueryPrepared { statement, params } => {
                self.bind_portal(statement, params)?;
                self.execute_portal()?;
            }
        }
        if query.is_sync_point {
            frontend::sync(&mut self.outbuf);
        }
        self.pipeline.dispatched.push_back(DispatchedQuery {
            stream_serial: query.stream_serial,
            is_sync_point: query.is_sync_point,
            shape,
            sink: Some(query.sink),
        });
        Ok(())
    }

    fn parse_statement(&mut self, name: &str, sql: &str) -> Result<(), DbError> {
        frontend::parse(
            name,
            sql,
            std::iter::empty::<postgres_protocol::Oid>(),
            &mut self.outbuf,
        )
        .map_err(|e| DbError::Protocol(format!("parse encoding failed: {e}")))
    }

    fn bind_portal(&mut self, statement: &str, params: &[String]) -> Result<(), DbError> {
        frontend::bind(
            "",
            statement,
            params.iter().map(|_| 0i16),
            params.iter(),
            |param, buf: &mut BytesMut| {
                buf.extend_from_slice(param.as_bytes());
                Ok(IsNull::No)
            },
            std::iter::once(0i16),
            &mut self.outbuf,
        )
        .map_err(|_| DbError::Protocol("bind encoding failed".into()))
    }

    fn execute_portal(&mut self) -> Result<(), DbError> {
        frontend::execute("", 0, &mut self.outbuf)
            .map_err(|e| DbError::Protocol(format!("execute encoding failed: {e}")))
    }

    /// Writes as much of `outbuf` as the socket accepts. Returns whether
    /// everything went out.
    fn flush_fully(&mut self) -> Result<bool, DbError> {
        while !self.outbuf.is_empty() {
            match self.sock.write(&self.outbuf) {
                Ok(0) => return Err(DbError::Protocol("backend closed the connection".into())),
                Ok(n) => self.outbuf.advance(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(DbError::Io(e)),
            }
        }
        Ok(true)
    }

    fn flush_out(&mut self) -> Result<(), DbError> {
        self.flush_fully().map(|_| ())
    }

    /// LISTEN/NOTIFY payloads observed since the last drain.
    pub fn take_notifications(&mut self) -> Vec<(String, String)> {
        self.pipeline.take_notifications()
    }

    /// Teardown: every in-flight command gets an error terminal (the
    /// worker still drops the ones whose stream died).
    pub fn drain_in_flight(&mut self) -> Vec<Completion> {
        self.state = DbState::Closed;
        self.shared.borrow_mut().connected = false;
        self.shared.borrow_mut().prepared.clear();
        let mut out = Vec::new();
        while let Some(mut record) = self.pipeline.dispatched.pop_front() {
            if let Some(sink) = record.sink.take() {
                out.push(Completion {
                    stream_serial: record.stream_serial,
                    sink,
                    result: DbResult::Error("database session restarted".into()),
                });
            }
        }
        out
    }
}

impl Drop for DbSession {
    fn drop(&mut self) {
        if self.state == DbState::Ready {
            frontend::terminate(&mut self.outbuf);
            let _ = self.flush_fully();
        }
    }
}

impl std::fmt::Debug for DbSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbSession")
            .field("state", &self.state)
            .field("dispatched", &self.pipeline.dispatched.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::{parse_conn_string, Pipeline};
    use crate::db::query::{CommandShape, CompletionSink, DispatchedQuery};
    use crate::db::result::DbResult;
    use bytes::{BufMut, BytesMut};
    use postgres_protocol::message::backend::Message;

    fn backend_msg(tag: u8, body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(tag);
        buf.put_i32(body.len() as i32 + 4);
        buf.put_slice(body);
        buf
    }

    fn parse(buf: &mut BytesMut) -> Message {
        Message::parse(buf).unwrap().expect("complete message")
    }

    fn portal_record(serial: u64, sync: bool) -> DispatchedQuery {
        DispatchedQuery {
            stream_serial: serial,
            is_sync_point: sync,
            shape: CommandShape::Portal,
            sink: Some(CompletionSink::Discard),
        }
    }

    fn row_description_one_text_col(name: &str) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_i16(1);
        body.put_slice(name.as_bytes());
        body.put_u8(0);
        body.put_i32(0); // table oid
        body.put_i16(0); // column id
        body.put_i32(25); // text
        body.put_i16(-1);
        body.put_i32(-1);
        body.put_i16(0);
        backend_msg(b'T', &body)
    }

    fn data_row(value: &str) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_i16(1);
        body.put_i32(value.len() as i32);
        body.put_slice(value.as_bytes());
        backend_msg(b'D', &body)
    }

    fn command_complete() -> BytesMut {
        backend_msg(b'C', b"SELECT 1\0")
    }

    fn ready_for_query() -> BytesMut {
        backend_msg(b'Z', b"I")
    }

    fn error_response(msg: &str) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_u8(b'S');
        body.put_slice(b"ERROR\0");
        body.put_u8(b'M');
        body.put_slice(msg.as_bytes());
        body.put_u8(0);
        body.put_u8(0);
        backend_msg(b'E', &body)
    }

    #[test]
    fn completions_fire_in_submission_order_and_sync_pops() {
        let mut pipeline = Pipeline::default();
        pipeline.dispatched.push_back(portal_record(1, true));
        pipeline.dispatched.push_back(portal_record(2, true));

        for mut frame in [
            row_description_one_text_col("x"),
            data_row("first"),
            command_complete(),
            ready_for_query(),
            row_description_one_text_col("x"),
            data_row("second"),
            command_complete(),
            ready_for_query(),
        ] {
            pipeline.on_message(parse(&mut frame)).unwrap();
        }

        let done = pipeline.take_completions();
        assert_eq!(2, done.len());
        assert_eq!(1, done[0].stream_serial);
        assert_eq!(2, done[1].stream_serial);
        assert!(matches!(done[0].result, DbResult::SingleRow(_)));
        assert!(pipeline.dispatched.is_empty());
    }

    #[test]
    fn backend_error_becomes_an_error_terminal() {
        let mut pipeline = Pipeline::default();
        pipeline.dispatched.push_back(portal_record(9, true));

        pipeline.on_message(parse(&mut error_response("boom"))).unwrap();
        pipeline.on_message(parse(&mut ready_for_query())).unwrap();

        let done = pipeline.take_completions();
        assert_eq!(1, done.len());
        assert_eq!(Some("boom"), done[0].result.error_message());
        assert!(pipeline.dispatched.is_empty());
    }

    #[test]
    fn aborted_pipeline_commands_error_out_at_the_fence() {
        let mut pipeline = Pipeline::default();
        // prepare (statement) that fails, then its execute (sync point)
        pipeline.dispatched.push_back(DispatchedQuery {
            stream_serial: 5,
            is_sync_point: false,
            shape: CommandShape::Statement,
            sink: Some(CompletionSink::Discard),
        });
        pipeline.dispatched.push_back(portal_record(5, true));

        pipeline
            .on_message(parse(&mut error_response("syntax error")))
            .unwrap();
        pipeline.on_message(parse(&mut ready_for_query())).unwrap();

        let done = pipeline.take_completions();
        assert_eq!(2, done.len());
        assert_eq!(Some("syntax error"), done[0].result.error_message());
        assert_eq!(Some("pipeline aborted"), done[1].result.error_message());
        assert!(pipeline.dispatched.is_empty());
    }

    #[test]
    fn statement_prepare_terminates_on_parse_complete() {
        let mut pipeline = Pipeline::default();
        pipeline.dispatched.push_back(DispatchedQuery {
            stream_serial: 3,
            is_sync_point: false,
            shape: CommandShape::Statement,
            sink: Some(CompletionSink::Discard),
        });
        pipeline.dispatched.push_back(portal_record(3, true));

        let mut parse_complete = backend_msg(b'1', b"");
        pipeline.on_message(parse(&mut parse_complete)).unwrap();
        assert_eq!(1, pipeline.dispatched.len());

        for mut frame in [
            row_description_one_text_col("v"),
            data_row("val"),
            command_complete(),
            ready_for_query(),
        ] {
            pipeline.on_message(parse(&mut frame)).unwrap();
        }
        let done = pipeline.take_completions();
        assert_eq!(2, done.len());
        assert!(matches!(done[0].result, DbResult::Empty));
        assert!(matches!(done[1].result, DbResult::SingleRow(_)));
    }

    #[test]
    fn notifications_are_collected_for_the_dispatcher() {
        let mut pipeline = Pipeline::default();
        let mut body = BytesMut::new();
        body.put_i32(4242);
        body.put_slice(b"chat/7\0");
        body.put_slice(b"new message\0");
        let mut frame = backend_msg(b'A', &body);
        pipeline.on_message(parse(&mut frame)).unwrap();

        assert_eq!(
            vec![("chat/7".to_string(), "new message".to_string())],
            pipeline.take_notifications()
        );
    }

    #[test]
    fn null_columns_decode_as_none() {
        let mut pipeline = Pipeline::default();
        pipeline.dispatched.push_back(portal_record(1, true));

        let mut body = BytesMut::new();
        body.put_i16(1);
        body.put_i32(-1); // null
        let mut null_row = backend_msg(b'D', &body);

        for frame in [
            &mut row_description_one_text_col("maybe"),
            &mut null_row,
            &mut command_complete(),
            &mut ready_for_query(),
        ] {
            pipeline.on_message(parse(frame)).unwrap();
        }
        let done = pipeline.take_completions();
        let rows = done[0].result.rows().unwrap();
        assert_eq!(None, rows.value_at(0, 0));
    }

    #[test]
    fn conn_string_parses_keyword_pairs_with_defaults() {
        let p = parse_conn_string("host=db.internal port=6432 user=app password=s3cret").unwrap();
        assert_eq!("db.internal", p.host);
        assert_eq!(6432, p.port);
        assert_eq!("app", p.user);
        // dbname defaults to the user
        assert_eq!("app", p.dbname);

        assert!(parse_conn_string("host=x").is_err());
        assert!(parse_conn_string("nonsense").is_err());
    }
}
