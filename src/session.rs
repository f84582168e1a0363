//! HTTP/2 session over TLS
//!
//! One session per accepted connection: TLS-HANDSHAKING → CONNECTED →
//! CLOSING. The read path drains decrypted bytes into the codec; codec
//! callbacks create streams, populate headers, route requests and feed
//! request bodies. The write path refills the 64 KiB outbound buffer from
//! the codec and pushes it through TLS. Any TLS or codec error is fatal to
//! the session only; per-stream problems reset the stream and keep the
//! connection.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use mio::net::TcpStream;
use mio::Interest;
use rustls::{ServerConfig, ServerConnection};

use crate::buffer::Buffer;
use crate::datastream::DataStream;
use crate::error::SessionError;
use crate::events::EventStream;
use crate::h2::{
    Control, DataPoll, DataSend, ErrorCode, FrameInfo, FrameKind, Http2Codec, CodecSink,
    FRAME_HEADER_LEN, READ_BUF, WRITE_BUF,
};
use crate::request::HttpRequest;
use crate::response::HttpResponse;
use crate::router::{Handler, Method};
use crate::stream::{ResponseAction, Stream};
use crate::task::Task;
use crate::util;
use crate::worker::{TimerEvent, WorkerServices};

/// Advertised SETTINGS_MAX_CONCURRENT_STREAMS.
pub const MAX_CONCURRENT_STREAMS: u32 = 100;

/// The peer must acknowledge our SETTINGS within this window.
const SETTINGS_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// SSE heartbeat cadence.
pub const PING_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Handshaking,
    Connected,
}

/// Codec-facing half of the session: the stream table and everything the
/// callbacks touch. Split from the TLS plumbing so the codec can borrow it
/// as its sink.
pub struct SessionInner {
    token: usize,
    services: Rc<WorkerServices>,
    streams: HashMap<u32, Stream>,
    settings_timer: Option<crate::timer::TimerId>,
    route_scratch: Vec<(usize, usize)>,
}

pub struct Session {
    sock: TcpStream,
    tls: ServerConnection,
    state: SessionState,
    codec: Http2Codec,
    wb: Buffer<WRITE_BUF>,
    rbuf: Box<[u8; READ_BUF]>,
    inner: SessionInner,
}

impl Session {
    pub fn new(
        token: usize,
        sock: TcpStream,
        tls_config: Arc<ServerConfig>,
        services: Rc<WorkerServices>,
    ) -> Result<Self, rustls::Error> {
        let tls = ServerConnection::new(tls_config)?;
        Ok(Self {
            sock,
            tls,
            state: SessionState::Handshaking,
            codec: Http2Codec::new(MAX_CONCURRENT_STREAMS),
            wb: Buffer::new(),
            rbuf: Box::new([0u8; READ_BUF]),
            inner: SessionInner {
                token,
                services,
                streams: HashMap::new(),
                settings_timer: None,
                route_scratch: Vec::new(),
            },
        })
    }

    pub fn socket(&mut self) -> &mut TcpStream {
        &mut self.sock
    }

    pub fn interests(&self) -> Interest {
        let want_write = self.tls.wants_write() || self.wb.rleft() > 0 || self.codec.want_write();
        if want_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// Drives the session from a readiness event.
    pub fn on_event(&mut self, readable: bool) -> Result<(), SessionError> {
        if self.state == SessionState::Handshaking {
            self.handshake()?;
            if self.state == SessionState::Handshaking {
                return Ok(());
            }
        }
        if readable {
            self.read()?;
        }
        self.write()
    }

    fn handshake(&mut self) -> Result<(), SessionError> {
        while self.tls.is_handshaking() {
            let mut progress = false;
            if self.tls.wants_write() {
                match self.tls.write_tls(&mut self.sock) {
                    Ok(0) => return Err(SessionError::Closed),
                    Ok(_) => progress = true,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            if self.tls.is_handshaking() && self.tls.wants_read() {
                match self.tls.read_tls(&mut self.sock) {
                    Ok(0) => return Err(SessionError::Closed),
                    Ok(_) => {
                        self.tls.process_new_packets()?;
                        progress = true;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            if self.tls.is_handshaking() && !progress {
                // wait for the next readiness event
                return Ok(());
            }
        }
        self.connection_made()
    }

    /// Handshake done: the negotiated protocol must be h2, then our
    /// SETTINGS goes out.
    fn connection_made(&mut self) -> Result<(), SessionError> {
        match self.tls.alpn_protocol() {
            Some(proto) if util::h2_is_selected(proto) => {}
            _ => return Err(SessionError::AlpnMismatch),
        }
        self.state = SessionState::Connected;
        self.codec.ctl.submit_settings();
        // plaintext may already sit decrypted behind the handshake
        self.read()?;
        self.write()
    }

    fn read(&mut self) -> Result<(), SessionError> {
        loop {
            // drain decrypted plaintext into the codec first
            loop {
                match self.tls.reader().read(&mut self.rbuf[..]) {
                    Ok(0) => return Err(SessionError::Closed),
                    Ok(n) => {
                        let codec = &mut self.codec;
                        if let Err(e) = codec.receive(&self.rbuf[..n], &mut self.inner) {
                            let code = match &e {
                                crate::h2::CodecError::Connection(code) => *code,
                                crate::h2::CodecError::BadPreface => ErrorCode::ProtocolError,
                                crate::h2::CodecError::Hpack => ErrorCode::CompressionError,
                            };
                            self.codec.ctl.terminate(code);
                            let _ = self.write();
                            return Err(e.into());
                        }
                        codec.reap(&mut self.inner);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e.into()),
                }
            }
            match self.tls.read_tls(&mut self.sock) {
                Ok(0) => return Err(SessionError::Closed),
                Ok(_) => {
                    self.tls.process_new_packets()?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write(&mut self) -> Result<(), SessionError> {
        loop {
            if self.wb.rleft() == 0 && self.codec.want_write() {
                self.wb.reset();
                let codec = &mut self.codec;
                codec.produce(&mut self.wb, &mut self.inner)?;
                codec.reap(&mut self.inner);
            }
            if self.wb.rleft() == 0 && !self.tls.wants_write() {
                break;
            }

            let mut progress = false;
            if self.wb.rleft() > 0 {
                let n = self.tls.writer().write(self.wb.readable()).unwrap_or(0);
                if n > 0 {
                    self.wb.drain(n);
                    progress = true;
                }
            }
            loop {
                if !self.tls.wants_write() {
                    break;
                }
                match self.tls.write_tls(&mut self.sock) {
                    Ok(0) => return Err(SessionError::Closed),
                    Ok(_) => progress = true,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            if !progress {
                // socket is full; the writable interest stays armed
                break;
            }
        }

        if self.codec.ctl.is_terminated()
            && self.codec.outbound_idle()
            && self.wb.rleft() == 0
            && !self.tls.wants_write()
        {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    /// A completion (DB result, body progress) arrived for one of our
    /// streams: poll its task, submit whatever response it produced.
    pub fn resume_task(&mut self, stream_id: u32) -> Result<(), SessionError> {
        self.inner.poll_stream_task(&mut self.codec.ctl, stream_id);
        self.codec.reap(&mut self.inner);
        self.write()
    }

    /// Un-parks a deferred event stream after a submit.
    pub fn resume_stream(&mut self, stream_id: u32) -> Result<(), SessionError> {
        self.codec.ctl.resume(stream_id);
        self.write()
    }

    /// Per-stream inactivity timeout: reset the stream, keep the session.
    pub fn stream_timeout(&mut self, stream_id: u32) -> Result<(), SessionError> {
        warn!("ending stream {stream_id} due to read/write timeout");
        if let Some(stream) = self.inner.streams.get_mut(&stream_id) {
            stream.stop_all_timers(&mut self.inner.services.timers.borrow_mut());
        }
        self.codec.ctl.submit_rst(stream_id, ErrorCode::InternalError);
        self.codec.reap(&mut self.inner);
        self.write()
    }

    /// The peer never acknowledged our SETTINGS.
    pub fn settings_timeout(&mut self) -> Result<(), SessionError> {
        warn!("terminating session due to settings timeout");
        self.codec.ctl.terminate(ErrorCode::SettingsTimeout);
        self.write().and(Err(SessionError::SettingsTimeout))
    }

    /// 2 s heartbeat on an SSE stream.
    pub fn sse_ping(&mut self, stream_id: u32) -> Result<(), SessionError> {
        let services = Rc::clone(&self.inner.services);
        let Some(stream) = self.inner.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        let Some(es) = stream.event_stream() else {
            return Ok(());
        };
        let woke = es.ping().is_some();
        stream.ping_timer = Some(services.timers.borrow_mut().schedule(
            PING_INTERVAL,
            TimerEvent::SsePing {
                token: self.inner.token,
                stream_id,
            },
        ));
        if woke {
            self.codec.ctl.resume(stream_id);
        }
        self.write()
    }

    /// Tears the session down: every stream's timers stop, serials die,
    /// SSE registrations disappear, and TLS gets a best-effort
    /// close-notify before the socket drops.
    pub fn close(&mut self) {
        let services = Rc::clone(&self.inner.services);
        if let Some(id) = self.inner.settings_timer.take() {
            services.timers.borrow_mut().cancel(id);
        }
        let streams: Vec<u32> = self.inner.streams.keys().copied().collect();
        for sid in streams {
            if let Some(mut stream) = self.inner.streams.remove(&sid) {
                stream.stop_all_timers(&mut services.timers.borrow_mut());
                services.deregister_stream(stream.serial());
                if let Some(es) = stream.event_stream() {
                    services.dispatcher.borrow_mut().remove_stream(es);
                }
            }
        }
        self.tls.send_close_notify();
        let _ = self.tls.write_tls(&mut self.sock);
    }
}

impl SessionInner {
    fn stream_shared(&self, stream_id: u32) -> Option<Rc<crate::stream::StreamShared>> {
        self.streams.get(&stream_id).map(|s| Rc::clone(&s.shared))
    }

    /// Routes the request once its headers are complete: parse path and
    /// query, try the router, fall back to static files for GET, then to
    /// an error page.
    fn prepare_response(&mut self, ctl: &mut Control, stream_id: u32) {
        let Some(shared) = self.stream_shared(stream_id) else {
            return;
        };
        match self.streams.get_mut(&stream_id) {
            // trailers must not route the request a second time
            Some(stream) if stream.prepared => return,
            Some(stream) => stream.prepared = true,
            None => return,
        }

        {
            let headers = shared.headers.borrow();
            let reqpath = match headers.path.as_deref() {
                Some(p) if !p.is_empty() => p,
                _ => "/",
            };
            let (raw_path, raw_query) = match reqpath.find('?') {
                Some(at) => (&reqpath[..at], &reqpath[at..]),
                None => (reqpath, ""),
            };
            let path: Rc<str> = if raw_path.contains('%') {
                Rc::from(util::percent_decode(raw_path))
            } else {
                Rc::from(raw_path)
            };
            let query: Rc<str> = if raw_query.contains('%') {
                Rc::from(util::percent_decode(raw_query))
            } else {
                Rc::from(raw_query)
            };
            drop(headers);
            *shared.path.borrow_mut() = path;
            *shared.query.borrow_mut() = query;
        }

        let method = shared
            .headers
            .borrow()
            .method
            .as_deref()
            .and_then(Method::from_str);
        let Some(method) = method else {
            self.send_status_page(ctl, stream_id, "400", "Bad Request");
            return;
        };

        let path = Rc::clone(&shared.path.borrow());
        let router = self.services.router();
        if let Some(index) = router.match_route(method, &path, &mut self.route_scratch) {
            *shared.params.borrow_mut() = router.params(index, &path, &self.route_scratch);

            let req = HttpRequest {
                shared: Rc::clone(&shared),
                services: Rc::clone(&self.services),
            };
            let res = HttpResponse {
                shared: Rc::clone(&shared),
                services: Rc::clone(&self.services),
            };
            match router.handler(index) {
                Handler::Blocking(f) => f(req, res),
                Handler::Suspendable(f) => {
                    let mut task = Task::new(f(req, res));
                    let done = task.poll();
                    if !done {
                        if let Some(stream) = self.streams.get_mut(&stream_id) {
                            stream.task = Some(task);
                        }
                    }
                }
            }
            self.drain_response(ctl, stream_id);
            return;
        }

        if method == Method::Get {
            self.serve_static(ctl, stream_id, None);
        } else {
            self.send_status_page(ctl, stream_id, "400", "Bad Request");
        }
    }

    /// Polls the stream's suspended task (if any) and submits whatever
    /// response it installed.
    fn poll_stream_task(&mut self, ctl: &mut Control, stream_id: u32) {
        let task = self.streams.get_mut(&stream_id).and_then(|s| s.task.take());
        if let Some(mut task) = task {
            let done = task.poll();
            if !done {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.task = Some(task);
                }
            }
        }
        self.drain_response(ctl, stream_id);
    }

    fn drain_response(&mut self, ctl: &mut Control, stream_id: u32) {
        let action = match self.stream_shared(stream_id) {
            Some(shared) => shared.response.borrow_mut().action.take(),
            None => return,
        };
        match action {
            Some(ResponseAction::SendString { body, content_type }) => {
                self.submit_string(ctl, stream_id, body, content_type);
            }
            Some(ResponseAction::SendFile { path }) => {
                self.serve_static(ctl, stream_id, path.as_deref());
            }
            Some(ResponseAction::EventInit { stream }) => {
                self.submit_event_init(ctl, stream_id, stream);
            }
            None => {}
        }
    }

    fn submit_string(
        &mut self,
        ctl: &mut Control,
        stream_id: u32,
        body: crate::datastream::StringSource,
        content_type: Option<&'static str>,
    ) {
        let date = self.services.cached_date();
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        let (status, user_headers) = {
            let mut pending = stream.shared.response.borrow_mut();
            (
                pending.status.take().unwrap_or(std::borrow::Cow::Borrowed("200")),
                std::mem::take(&mut pending.headers),
            )
        };

        stream.set_data_stream(DataStream::string(body));
        let len = stream.body_length;
        let clen = stream.mem.store(len.to_string().as_bytes());

        let mut headers: Vec<(&[u8], &[u8])> = Vec::with_capacity(user_headers.len() + 4);
        headers.push((b":status", status.as_bytes()));
        for (name, value) in &user_headers {
            headers.push((name.as_bytes(), value.resolve(&stream.mem)));
        }
        if let Some(ct) = content_type {
            headers.push((b"content-type", ct.as_bytes()));
        }
        headers.push((b"content-length", stream.mem.get(clen)));
        headers.push((b"date", date.as_bytes()));

        ctl.submit_response(stream_id, &headers, Some(len));
    }

    fn serve_static(&mut self, ctl: &mut Control, stream_id: u32, explicit: Option<&str>) {
        let Some(shared) = self.stream_shared(stream_id) else {
            return;
        };
        let req_path = Rc::clone(&shared.path.borrow());
        let mut relpath = explicit.unwrap_or(&req_path);
        if relpath == "/" {
            relpath = "/index.html";
        }

        let entry = self.services.cache.borrow_mut().get(relpath, true);
        let Some(entry) = entry else {
            self.send_status_page(ctl, stream_id, "404", "Not Found");
            return;
        };
        let meta = entry.info();
        let date = self.services.cached_date();

        let ims = shared
            .headers
            .borrow()
            .if_modified_since
            .as_deref()
            .and_then(util::parse_http_date);
        if let Some(since) = ims {
            if meta.mtime <= since {
                let mut headers: Vec<(&[u8], &[u8])> = Vec::with_capacity(2);
                headers.push((b":status", b"304"));
                headers.push((b"date", date.as_bytes()));
                ctl.submit_response(stream_id, &headers, Some(0));
                return;
            }
        }

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        let clen = stream.mem.store(meta.length.to_string().as_bytes());
        let lastmod = stream.mem.store(util::http_date(meta.mtime).as_bytes());
        stream.set_data_stream(DataStream::file(Rc::clone(&entry)));

        let mut headers: Vec<(&[u8], &[u8])> = Vec::with_capacity(7);
        headers.push((b":status", b"200"));
        headers.push((b"content-type", entry.mime_type().as_bytes()));
        headers.push((b"content-length", stream.mem.get(clen)));
        // files change underneath a dev server
        headers.push((b"cache-control", b"max-age=0"));
        headers.push((b"date", date.as_bytes()));
        headers.push((b"last-modified", stream.mem.get(lastmod)));
        if let Some(encoding) = entry.encoding() {
            headers.push((b"content-encoding", encoding.as_bytes()));
        }

        ctl.submit_response(stream_id, &headers, Some(meta.length));
    }

    fn submit_event_init(&mut self, ctl: &mut Control, stream_id: u32, es: EventStream) {
        let date = self.services.cached_date();
        let token = self.token;
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        let status = stream
            .shared
            .response
            .borrow_mut()
            .status
            .take()
            .unwrap_or(std::borrow::Cow::Borrowed("200"));

        stream.set_data_stream(DataStream::Event(es));
        stream.ping_timer = Some(self.services.timers.borrow_mut().schedule(
            PING_INTERVAL,
            TimerEvent::SsePing {
                token,
                stream_id,
            },
        ));

        let mut headers: Vec<(&[u8], &[u8])> = Vec::with_capacity(4);
        headers.push((b":status", status.as_bytes()));
        headers.push((b"content-type", b"text/event-stream"));
        headers.push((b"cache-control", b"no-store"));
        headers.push((b"date", date.as_bytes()));
        ctl.submit_response(stream_id, &headers, None);
    }

    fn send_status_page(&mut self, ctl: &mut Control, stream_id: u32, status: &'static str, message: &str) {
        if let Some(shared) = self.stream_shared(stream_id) {
            shared.response.borrow_mut().status = Some(std::borrow::Cow::Borrowed(status));
        }
        let body = format!("<html> <h1>{status}</h1> <p>{message}</p> </html>");
        self.submit_string(
            ctl,
            stream_id,
            body.into(),
            Some("text/html; charset=utf-8"),
        );
    }
}

impl CodecSink for SessionInner {
    fn on_begin_headers(&mut self, _ctl: &mut Control, stream_id: u32) {
        let serial = self.services.next_serial();
        let mut stream = Stream::new(self.token, stream_id, serial);
        stream.reset_read_timeout(&mut self.services.timers.borrow_mut());
        self.services.register_stream(serial, self.token, stream_id);
        self.streams.insert(stream_id, stream);
    }

    fn on_header(&mut self, ctl: &mut Control, stream_id: u32, name: &[u8], value: &[u8]) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if !stream.shared.headers.borrow_mut().add(name, value) {
            // header budget exceeded
            ctl.submit_rst(stream_id, ErrorCode::InternalError);
        }
    }

    fn on_frame_recv(&mut self, ctl: &mut Control, frame: FrameInfo) {
        match frame.kind {
            FrameKind::Headers => {
                let Some(shared) = self.stream_shared(frame.stream_id) else {
                    return;
                };
                // 100-continue goes out before the body is read
                if !frame.end_stream {
                    let expects_continue = shared
                        .headers
                        .borrow()
                        .expect
                        .as_deref()
                        .is_some_and(|e| e.eq_ignore_ascii_case("100-continue"));
                    if expects_continue {
                        ctl.submit_non_final(frame.stream_id, &[(b":status", b"100")]);
                    }
                }

                if let Some(stream) = self.streams.get_mut(&frame.stream_id) {
                    let mut timers = self.services.timers.borrow_mut();
                    if frame.end_stream {
                        stream.stop_read_timeout(&mut timers);
                    } else {
                        stream.reset_read_timeout(&mut timers);
                    }
                }
                if frame.end_stream {
                    shared.body.borrow_mut().on_end();
                }
                self.prepare_response(ctl, frame.stream_id);
            }
            FrameKind::Data => {
                if let Some(stream) = self.streams.get_mut(&frame.stream_id) {
                    let mut timers = self.services.timers.borrow_mut();
                    if frame.end_stream {
                        stream.stop_read_timeout(&mut timers);
                    } else {
                        stream.reset_read_timeout(&mut timers);
                    }
                }
                if frame.end_stream {
                    let resumable = match self.stream_shared(frame.stream_id) {
                        Some(shared) => shared.body.borrow_mut().on_end(),
                        None => false,
                    };
                    if resumable {
                        self.poll_stream_task(ctl, frame.stream_id);
                    }
                }
            }
            FrameKind::Settings if frame.ack => {
                if let Some(id) = self.settings_timer.take() {
                    self.services.timers.borrow_mut().cancel(id);
                }
            }
            FrameKind::Goaway => debug!("peer sent GOAWAY"),
            _ => {}
        }
    }

    fn on_data_chunk(&mut self, ctl: &mut Control, stream_id: u32, data: &[u8]) {
        let resumable = match self.stream_shared(stream_id) {
            Some(shared) => shared.body.borrow_mut().on_chunk(data),
            None => return,
        };
        if resumable {
            self.poll_stream_task(ctl, stream_id);
        }
    }

    fn on_stream_close(&mut self, _ctl: &mut Control, stream_id: u32, error: ErrorCode) {
        if let Some(mut stream) = self.streams.remove(&stream_id) {
            if error != ErrorCode::NoError {
                debug!("stream {stream_id} closed with {error:?}");
            }
            stream.stop_all_timers(&mut self.services.timers.borrow_mut());
            self.services.deregister_stream(stream.serial());
            if let Some(es) = stream.event_stream() {
                self.services.dispatcher.borrow_mut().remove_stream(es);
            }
            // dropping the stream drops its suspended task
        }
    }

    fn on_frame_sent(&mut self, _ctl: &mut Control, frame: FrameInfo) {
        match frame.kind {
            FrameKind::Settings if !frame.ack => {
                let token = self.token;
                self.settings_timer = Some(self.services.timers.borrow_mut().schedule(
                    SETTINGS_ACK_TIMEOUT,
                    TimerEvent::Settings { token },
                ));
            }
            FrameKind::Headers | FrameKind::Data => {
                let Some(stream) = self.streams.get_mut(&frame.stream_id) else {
                    return;
                };
                let mut timers = self.services.timers.borrow_mut();
                if frame.end_stream {
                    stream.stop_write_timeout(&mut timers);
                } else if frame.flow_blocked {
                    stream.reset_read_timeout_if_active(&mut timers);
                    stream.reset_write_timeout(&mut timers);
                } else {
                    stream.reset_read_timeout_if_active(&mut timers);
                    stream.stop_write_timeout(&mut timers);
                }
            }
            _ => {}
        }
    }

    fn poll_data(&mut self, stream_id: u32, max: usize) -> DataPoll {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return DataPoll::Error;
        };
        let Some(ds) = &stream.data_stream else {
            return DataPoll::Error;
        };
        let (avail, must_eof) = ds.remaining(stream.body_offset);
        if avail == 0 && !must_eof {
            return DataPoll::Deferred;
        }
        let len = (avail.min(max as u64)) as usize;
        DataPoll::Ready {
            len,
            eof: must_eof && len as u64 == avail,
        }
    }

    fn send_data(
        &mut self,
        wb: &mut Buffer<WRITE_BUF>,
        stream_id: u32,
        frame_header: &[u8; FRAME_HEADER_LEN],
        len: usize,
    ) -> DataSend {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return DataSend::Error;
        };
        let Some(ds) = &stream.data_stream else {
            return DataSend::Error;
        };
        wb.write_full(frame_header);
        match ds.send(wb, stream.body_offset, len) {
            Ok(()) => {
                stream.body_offset += len as u64;
                DataSend::Done
            }
            Err(_) => {
                stream.stop_all_timers(&mut self.services.timers.borrow_mut());
                DataSend::Error
            }
        }
    }
}
