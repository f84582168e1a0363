//! Per-stream request state
//!
//! One [`Stream`] per HTTP/2 stream, created by the begin-headers callback
//! and destroyed by stream-close. The session owns it; the pieces the
//! handler needs after suspension live in the shared [`StreamShared`] cell
//! the request/response handles hold on to.

use std::borrow::Cow;
use std::cell::RefCell;
use std::rc::Rc;

use crate::body::{BodyState, SharedBody};
use crate::datastream::{DataStream, StringSource};
use crate::events::EventStream;
use crate::mem::{Chunk, MemBlock};
use crate::task::Task;
use crate::timer::{TimerId, TimerQueue};
use crate::worker::TimerEvent;
use std::time::Duration;

/// Cumulative request-header budget; streams over it are reset.
pub const HEADER_BUDGET: usize = 64 * 1024;

/// Inline header slots before falling back to the overflow list.
const INLINE_HEADERS: usize = 10;

/// Inactivity window for the per-stream read and write timers.
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Request headers: pseudo-headers and two frequently-checked names get
/// distinguished slots, the rest go to fixed inline storage with a heap
/// overflow. Appends preserve order; lookup is a single pass.
#[derive(Debug, Default)]
pub struct RequestHeaders {
    pub method: Option<Box<str>>,
    pub scheme: Option<Box<str>>,
    pub authority: Option<Box<str>>,
    pub host: Option<Box<str>>,
    pub path: Option<Box<str>>,
    pub expect: Option<Box<str>>,
    pub if_modified_since: Option<Box<str>>,
    inline: [Option<(Box<str>, Box<str>)>; INLINE_HEADERS],
    inline_len: usize,
    overflow: Vec<(Box<str>, Box<str>)>,
    /// Cumulative name+value bytes, checked against [`HEADER_BUDGET`].
    pub total_bytes: usize,
}

impl RequestHeaders {
    /// Accounts for and stores one decoded header. Returns `false` once
    /// the budget is exceeded; the caller resets the stream.
    pub fn add(&mut self, name: &[u8], value: &[u8]) -> bool {
        if self.total_bytes + name.len() + value.len() > HEADER_BUDGET {
            return false;
        }
        self.total_bytes += name.len() + value.len();

        let name = String::from_utf8_lossy(name);
        let value: Box<str> = String::from_utf8_lossy(value).into();
        match name.as_ref() {
            ":method" => self.method = Some(value),
            ":scheme" => self.scheme = Some(value),
            ":authority" => self.authority = Some(value),
            ":path" => self.path = Some(value),
            "host" => self.host = Some(value),
            "expect" => self.expect = Some(value),
            "if-modified-since" => self.if_modified_since = Some(value),
            _ => {
                if self.inline_len < INLINE_HEADERS {
                    self.inline[self.inline_len] = Some((name.into(), value));
                    self.inline_len += 1;
                } else {
                    self.overflow.push((name.into(), value));
                }
            }
        }
        true
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        match name {
            ":method" => self.method.as_deref(),
            ":scheme" => self.scheme.as_deref(),
            ":authority" => self.authority.as_deref(),
            ":path" => self.path.as_deref(),
            "host" => self.host.as_deref(),
            "expect" => self.expect.as_deref(),
            "if-modified-since" => self.if_modified_since.as_deref(),
            _ => self
                .inline[..self.inline_len]
                .iter()
                .flatten()
                .chain(self.overflow.iter())
                .find(|(n, _)| n.as_ref().eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_ref()),
        }
    }
}

/// A response header value. `Owned` copies, the other variants carry the
/// no-copy contract of `set_header_nc`: the bytes outlive the submission.
#[derive(Debug, Clone)]
pub enum HeaderValue {
    Owned(String),
    Static(&'static str),
    Shared(Rc<str>),
    /// Stored in the stream's scratch arena.
    Mem(Chunk),
}

impl HeaderValue {
    pub fn resolve<'a>(&'a self, mem: &'a MemBlock<MEM_SIZE>) -> &'a [u8] {
        match self {
            Self::Owned(s) => s.as_bytes(),
            Self::Static(s) => s.as_bytes(),
            Self::Shared(s) => s.as_bytes(),
            Self::Mem(chunk) => mem.get(*chunk),
        }
    }
}

/// What the handler asked the response pipeline to do.
pub enum ResponseAction {
    SendString {
        body: StringSource,
        content_type: Option<&'static str>,
    },
    /// `None` serves the request path from the static cache.
    SendFile { path: Option<String> },
    EventInit { stream: EventStream },
}

impl std::fmt::Debug for ResponseAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::SendString { .. } => "SendString",
            Self::SendFile { .. } => "SendFile",
            Self::EventInit { .. } => "EventInit",
        })
    }
}

/// Response under construction: `:status`, handler-set headers in append
/// order, and the chosen body action. Drained by the session after each
/// handler call or task poll.
#[derive(Debug, Default)]
pub struct PendingResponse {
    pub status: Option<Cow<'static, str>>,
    pub headers: Vec<(Cow<'static, str>, HeaderValue)>,
    pub action: Option<ResponseAction>,
}

impl PendingResponse {
    pub fn set_header(&mut self, name: impl Into<Cow<'static, str>>, value: HeaderValue) {
        self.headers.push((name.into(), value));
    }
}

/// State shared between the session-owned [`Stream`] and the handler's
/// request/response handles.
#[derive(Debug)]
pub struct StreamShared {
    pub id: u32,
    pub serial: u64,
    pub session_token: usize,
    pub headers: RefCell<RequestHeaders>,
    pub path: RefCell<Rc<str>>,
    pub query: RefCell<Rc<str>>,
    pub params: RefCell<Vec<(String, String)>>,
    pub body: SharedBody,
    pub response: RefCell<PendingResponse>,
}

pub const MEM_SIZE: usize = 512;

/// One HTTP/2 request/response exchange.
#[derive(Debug)]
pub struct Stream {
    pub shared: Rc<StreamShared>,
    pub data_stream: Option<DataStream>,
    pub body_length: u64,
    pub body_offset: u64,
    /// The request has been routed; trailers don't route again.
    pub prepared: bool,
    pub task: Option<Task>,
    pub mem: MemBlock<MEM_SIZE>,
    rtimer: Option<TimerId>,
    wtimer: Option<TimerId>,
    pub ping_timer: Option<TimerId>,
}

impl Stream {
    pub fn new(session_token: usize, id: u32, serial: u64) -> Self {
        Self {
            shared: Rc::new(StreamShared {
                id,
                serial,
                session_token,
                headers: RefCell::new(RequestHeaders::default()),
                path: RefCell::new(Rc::from("/")),
                query: RefCell::new(Rc::from("")),
                params: RefCell::new(Vec::new()),
                body: Rc::new(RefCell::new(BodyState::new())),
                response: RefCell::new(PendingResponse::default()),
            }),
            data_stream: None,
            body_length: 0,
            body_offset: 0,
            prepared: false,
            task: None,
            mem: MemBlock::new(),
            rtimer: None,
            wtimer: None,
            ping_timer: None,
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    #[inline]
    pub fn serial(&self) -> u64 {
        self.shared.serial
    }

    /// Installs the response body source and snapshots its length.
    pub fn set_data_stream(&mut self, ds: DataStream) {
        self.body_length = ds.length();
        self.body_offset = 0;
        self.data_stream = Some(ds);
    }

    pub fn event_stream(&self) -> Option<&EventStream> {
        match &self.data_stream {
            Some(DataStream::Event(es)) => Some(es),
            _ => None,
        }
    }

    pub fn reset_read_timeout(&mut self, timers: &mut TimerQueue<TimerEvent>) {
        if let Some(id) = self.rtimer.take() {
            timers.cancel(id);
        }
        self.rtimer = Some(timers.schedule(
            STREAM_TIMEOUT,
            TimerEvent::StreamRead {
                token: self.shared.session_token,
                stream_id: self.shared.id,
            },
        ));
    }

    pub fn reset_write_timeout(&mut self, timers: &mut TimerQueue<TimerEvent>) {
        if let Some(id) = self.wtimer.take() {
            timers.cancel(id);
        }
        self.wtimer = Some(timers.schedule(
            STREAM_TIMEOUT,
            TimerEvent::StreamWrite {
                token: self.shared.session_token,
                stream_id: self.shared.id,
            },
        ));
    }

    /// Resets only when the timer is pending (not stopped, not fired).
    pub fn reset_read_timeout_if_active(&mut self, timers: &mut TimerQueue<TimerEvent>) {
        if self.rtimer.is_some_and(|id| timers.is_scheduled(id)) {
            self.reset_read_timeout(timers);
        }
    }

    pub fn reset_write_timeout_if_active(&mut self, timers: &mut TimerQueue<TimerEvent>) {
        if self.wtimer.is_some_and(|id| timers.is_scheduled(id)) {
            self.reset_write_timeout(timers);
        }
    }

    pub fn stop_read_timeout(&mut self, timers: &mut TimerQueue<TimerEvent>) {
        if let Some(id) = self.rtimer.take() {
            timers.cancel(id);
        }
    }

    pub fn stop_write_timeout(&mut self, timers: &mut TimerQueue<TimerEvent>) {
        if let Some(id) = self.wtimer.take() {
            timers.cancel(id);
        }
    }

    pub fn stop_all_timers(&mut self, timers: &mut TimerQueue<TimerEvent>) {
        self.stop_read_timeout(timers);
        self.stop_write_timeout(timers);
        if let Some(id) = self.ping_timer.take() {
            timers.cancel(id);
        }
    }
}

#[cfg(test)]
mod test {
    use super::{RequestHeaders, HEADER_BUDGET};

    #[test]
    fn pseudo_headers_land_in_their_slots() {
        let mut h = RequestHeaders::default();
        assert!(h.add(b":method", b"GET"));
        assert!(h.add(b":path", b"/x"));
        assert!(h.add(b"expect", b"100-continue"));
        assert!(h.add(b"if-modified-since", b"Sat, 27 Sep 2014 06:31:15 GMT"));
        assert_eq!(Some("GET"), h.method.as_deref());
        assert_eq!(Some("/x"), h.get(":path"));
        assert_eq!(Some("100-continue"), h.expect.as_deref());
        assert!(h.if_modified_since.is_some());
    }

    #[test]
    fn plain_headers_preserve_order_and_spill_to_overflow() {
        let mut h = RequestHeaders::default();
        for i in 0..14 {
            assert!(h.add(format!("x-h{i}").as_bytes(), b"v"));
        }
        assert_eq!(Some("v"), h.get("x-h0"));
        assert_eq!(Some("v"), h.get("x-h13"));
        assert_eq!(None, h.get("x-h14"));
    }

    #[test]
    fn lookup_is_case_insensitive_for_plain_headers() {
        let mut h = RequestHeaders::default();
        h.add(b"X-Custom", b"yes");
        assert_eq!(Some("yes"), h.get("x-custom"));
    }

    #[test]
    fn header_budget_rejects_oversized_header_sets() {
        let mut h = RequestHeaders::default();
        let big = vec![b'v'; 32 * 1024];
        assert!(h.add(b"a", &big));
        assert!(h.add(b"b", &big));
        // next one crosses 64 KiB
        assert!(!h.add(b"c", b"x"));
        assert!(h.total_bytes <= HEADER_BUDGET);
    }
}
