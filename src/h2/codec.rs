//! Codec session object: framing, flow control, stream states
//!
//! Inbound bytes are fed to [`Http2Codec::receive`]; complete frames are
//! dispatched to the [`CodecSink`] callbacks. Outbound frames are drained
//! into the session's write buffer by [`Http2Codec::produce`]: control
//! frames first (serialized eagerly on submission), then DATA frames
//! round-robin over sendable streams, asking the sink for payload through
//! `poll_data`/`send_data`. A frame that does not fit the buffer stays
//! queued until the next call — that is the back-pressure path.

use std::collections::{HashMap, VecDeque};

use log::{debug, warn};

use crate::buffer::Buffer;

use super::frame::{flags, DEFAULT_WINDOW, FRAME_HEADER_LEN, MAX_FRAME_SIZE};
use super::{CodecError, CodecSink, ErrorCode, FrameHeader, FrameInfo, FrameKind, Settings};
use super::{PREFACE, WRITE_BUF};

/// What a stream's body source can deliver right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPoll {
    /// `len` bytes available; `eof` when the body ends after them.
    Ready { len: usize, eof: bool },
    /// Open-ended source with nothing queued; park the stream until
    /// [`Control::resume`].
    Deferred,
    /// The source failed; the stream is reset.
    Error,
}

/// Outcome of a `send_data` delegation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSend {
    Done,
    Error,
}

#[derive(Debug, Default)]
struct StreamState {
    send_window: i32,
    recv_window: i32,
    remote_closed: bool,
    local_closed: bool,
    /// A response body is in flight.
    sending: bool,
    /// Parked: source reported `Deferred`.
    deferred: bool,
    /// Parked: flow-control window exhausted.
    blocked: bool,
}

struct ControlFrame {
    bytes: Vec<u8>,
    /// When set, `on_frame_sent` fires once the frame is fully buffered.
    info: Option<FrameInfo>,
}

struct HeaderAssembly {
    stream_id: u32,
    end_stream: bool,
    new_stream: bool,
    fragment: Vec<u8>,
}

struct RecvHalf {
    inbuf: Vec<u8>,
    preface_done: bool,
    assembly: Option<HeaderAssembly>,
}

/// Submission surface handed back to every sink callback. Everything the
/// session may ask of the codec while a callback runs goes through here.
pub struct Control {
    streams: HashMap<u32, StreamState>,
    sendable: VecDeque<u32>,
    control: VecDeque<ControlFrame>,
    control_off: usize,
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
    send_window: i32,
    recv_window: i32,
    peer_max_frame: usize,
    peer_initial_window: i32,
    max_streams: u32,
    last_recv_stream: u32,
    terminated: bool,
    pending_closes: VecDeque<(u32, ErrorCode)>,
}

impl Control {
    fn new(max_streams: u32) -> Self {
        Self {
            streams: HashMap::new(),
            sendable: VecDeque::new(),
            control: VecDeque::new(),
            control_off: 0,
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
            send_window: DEFAULT_WINDOW,
            recv_window: DEFAULT_WINDOW,
            peer_max_frame: MAX_FRAME_SIZE,
            peer_initial_window: DEFAULT_WINDOW,
            max_streams,
            last_recv_stream: 0,
            terminated: false,
            pending_closes: VecDeque::new(),
        }
    }

    fn queue(&mut self, kind: FrameKind, fl: u8, stream_id: u32, payload: &[u8], info: Option<FrameInfo>) {
        let hd = FrameHeader::new(payload.len() as u32, kind, fl, stream_id);
        let mut bytes = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        bytes.extend_from_slice(&hd.encode());
        bytes.extend_from_slice(payload);
        self.control.push_back(ControlFrame { bytes, info });
    }

    /// Queues the server SETTINGS frame. The sink's `on_frame_sent` starts
    /// the settings-ack timer once it goes out.
    pub fn submit_settings(&mut self) {
        let mut payload = Vec::with_capacity(6);
        payload.extend_from_slice(&Settings::MaxConcurrentStreams.as_u16().to_be_bytes());
        payload.extend_from_slice(&self.max_streams.to_be_bytes());
        let info = FrameInfo::new(FrameKind::Settings, 0);
        self.queue(FrameKind::Settings, 0, 0, &payload, Some(info));
    }

    /// Queues response HEADERS (with CONTINUATION spill) for `stream_id`.
    /// `body_len` of `None` means an open-ended body (event stream);
    /// `Some(0)` closes the stream on the header frame.
    pub fn submit_response(
        &mut self,
        stream_id: u32,
        headers: &[(&[u8], &[u8])],
        body_len: Option<u64>,
    ) {
        let end_stream = body_len == Some(0);
        self.submit_header_block(stream_id, headers, end_stream);

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if end_stream {
            stream.local_closed = true;
            let both_closed = stream.remote_closed;
            if both_closed {
                self.close_stream(stream_id, ErrorCode::NoError);
            }
        } else {
            stream.sending = true;
            self.sendable.push_back(stream_id);
        }
    }

    /// Queues a non-final (1xx) HEADERS frame; the stream stays open.
    pub fn submit_non_final(&mut self, stream_id: u32, headers: &[(&[u8], &[u8])]) {
        self.submit_header_block(stream_id, headers, false);
    }

    fn submit_header_block(&mut self, stream_id: u32, headers: &[(&[u8], &[u8])], end_stream: bool) {
        let block = self.encoder.encode(headers.iter().copied());
        let es = if end_stream { flags::END_STREAM } else { 0 };

        if block.len() <= self.peer_max_frame {
            let mut info = FrameInfo::new(FrameKind::Headers, stream_id);
            info.end_stream = end_stream;
            self.queue(FrameKind::Headers, flags::END_HEADERS | es, stream_id, &block, Some(info));
            return;
        }

        // oversized block: HEADERS + CONTINUATION frames
        let mut chunks = block.chunks(self.peer_max_frame).peekable();
        let first = chunks.next().unwrap();
        self.queue(FrameKind::Headers, es, stream_id, first, None);
        while let Some(chunk) = chunks.next() {
            let last = chunks.peek().is_none();
            let fl = if last { flags::END_HEADERS } else { 0 };
            let info = last.then(|| {
                let mut info = FrameInfo::new(FrameKind::Headers, stream_id);
                info.end_stream = end_stream;
                info
            });
            self.queue(FrameKind::Continuation, fl, stream_id, chunk, info);
        }
    }

    /// Resets `stream_id` and schedules its close callback.
    pub fn submit_rst(&mut self, stream_id: u32, code: ErrorCode) {
        if !self.streams.contains_key(&stream_id) {
            return;
        }
        self.queue(FrameKind::RstStream, 0, stream_id, &code.as_u32().to_be_bytes(), None);
        self.close_stream(stream_id, code);
    }

    /// Queues GOAWAY and stops accepting new streams. The session tears
    /// itself down once the outbound queue drains.
    pub fn terminate(&mut self, code: ErrorCode) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&self.last_recv_stream.to_be_bytes());
        payload.extend_from_slice(&code.as_u32().to_be_bytes());
        self.queue(FrameKind::Goaway, 0, 0, &payload, None);
    }

    /// Un-parks a deferred stream after its source got new data. The
    /// in-flight frame offset is the sink's to reset.
    pub fn resume(&mut self, stream_id: u32) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if stream.sending && stream.deferred {
                stream.deferred = false;
                self.sendable.push_back(stream_id);
            }
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    fn close_stream(&mut self, stream_id: u32, code: ErrorCode) {
        if self.streams.remove(&stream_id).is_some() {
            self.pending_closes.push_back((stream_id, code));
        }
    }

    fn new_stream_state(&self) -> StreamState {
        StreamState {
            send_window: self.peer_initial_window,
            recv_window: DEFAULT_WINDOW,
            ..StreamState::default()
        }
    }
}

/// One HTTP/2 connection's codec state.
pub struct Http2Codec {
    recv: RecvHalf,
    pub ctl: Control,
}

impl Http2Codec {
    /// `max_streams` is advertised as SETTINGS_MAX_CONCURRENT_STREAMS.
    pub fn new(max_streams: u32) -> Self {
        Self {
            recv: RecvHalf {
                inbuf: Vec::new(),
                preface_done: false,
                assembly: None,
            },
            ctl: Control::new(max_streams),
        }
    }

    /// Feeds plaintext bytes and dispatches every complete frame. Returns
    /// a connection error when the peer breaks the protocol; the session
    /// treats that as fatal.
    pub fn receive(&mut self, data: &[u8], sink: &mut impl CodecSink) -> Result<(), CodecError> {
        self.recv.inbuf.extend_from_slice(data);

        if !self.recv.preface_done {
            if self.recv.inbuf.len() < PREFACE.len() {
                return Ok(());
            }
            if &self.recv.inbuf[..PREFACE.len()] != PREFACE {
                return Err(CodecError::BadPreface);
            }
            self.recv.inbuf.drain(..PREFACE.len());
            self.recv.preface_done = true;
        }

        loop {
            if self.recv.inbuf.len() < FRAME_HEADER_LEN {
                break;
            }
            let mut hd_bytes = [0u8; FRAME_HEADER_LEN];
            hd_bytes.copy_from_slice(&self.recv.inbuf[..FRAME_HEADER_LEN]);
            let hd = FrameHeader::parse(&hd_bytes);

            if hd.length as usize > MAX_FRAME_SIZE {
                return Err(CodecError::Connection(ErrorCode::FrameSizeError));
            }
            let total = FRAME_HEADER_LEN + hd.length as usize;
            if self.recv.inbuf.len() < total {
                break;
            }
            let payload: Vec<u8> = self.recv.inbuf.drain(..total).skip(FRAME_HEADER_LEN).collect();

            self.dispatch(hd, payload, sink)?;
            self.reap(sink);
        }
        Ok(())
    }

    /// Delivers scheduled stream-close callbacks. Called from the receive
    /// and produce loops; the session calls it after driving [`Control`]
    /// directly (timer expiry, resumption).
    pub fn reap(&mut self, sink: &mut impl CodecSink) {
        while let Some((stream_id, code)) = self.ctl.pending_closes.pop_front() {
            sink.on_stream_close(&mut self.ctl, stream_id, code);
        }
    }

    pub fn want_write(&self) -> bool {
        !self.ctl.control.is_empty() || !self.ctl.sendable.is_empty()
    }

    /// Nothing queued and nothing sendable.
    pub fn outbound_idle(&self) -> bool {
        !self.want_write()
    }

    fn dispatch(
        &mut self,
        hd: FrameHeader,
        payload: Vec<u8>,
        sink: &mut impl CodecSink,
    ) -> Result<(), CodecError> {
        // a started header block admits only its own CONTINUATION frames
        if let Some(assembly) = &self.recv.assembly {
            if hd.kind != FrameKind::Continuation || hd.stream_id != assembly.stream_id {
                return Err(CodecError::Connection(ErrorCode::ProtocolError));
            }
        }

        match hd.kind {
            FrameKind::Headers => self.on_headers(hd, payload, sink),
            FrameKind::Continuation => self.on_continuation(hd, payload, sink),
            FrameKind::Data => self.on_data(hd, payload, sink),
            FrameKind::Settings => self.on_settings(hd, payload, sink),
            FrameKind::WindowUpdate => self.on_window_update(hd, payload),
            FrameKind::RstStream => self.on_rst_stream(hd, payload),
            FrameKind::Ping => self.on_ping(hd, payload),
            FrameKind::Goaway => {
                let mut info = FrameInfo::new(FrameKind::Goaway, 0);
                info.ack = false;
                sink.on_frame_recv(&mut self.ctl, info);
                Ok(())
            }
            FrameKind::PushPromise => Err(CodecError::Connection(ErrorCode::ProtocolError)),
            FrameKind::Priority | FrameKind::Unknown(_) => Ok(()),
        }
    }

    fn on_headers(
        &mut self,
        hd: FrameHeader,
        payload: Vec<u8>,
        sink: &mut impl CodecSink,
    ) -> Result<(), CodecError> {
        if hd.stream_id == 0 {
            return Err(CodecError::Connection(ErrorCode::ProtocolError));
        }
        let fragment = strip_padding_and_priority(&hd, payload)?;
        let end_stream = hd.has_flag(flags::END_STREAM);
        let new_stream = hd.stream_id % 2 == 1
            && hd.stream_id > self.ctl.last_recv_stream
            && !self.ctl.streams.contains_key(&hd.stream_id);
        if new_stream {
            self.ctl.last_recv_stream = hd.stream_id;
        }

        let assembly = HeaderAssembly {
            stream_id: hd.stream_id,
            end_stream,
            new_stream,
            fragment,
        };
        if hd.has_flag(flags::END_HEADERS) {
            self.complete_headers(assembly, sink)
        } else {
            self.recv.assembly = Some(assembly);
            Ok(())
        }
    }

    fn on_continuation(
        &mut self,
        hd: FrameHeader,
        payload: Vec<u8>,
        sink: &mut impl CodecSink,
    ) -> Result<(), CodecError> {
        let Some(mut assembly) = self.recv.assembly.take() else {
            return Err(CodecError::Connection(ErrorCode::ProtocolError));
        };
        assembly.fragment.extend_from_slice(&payload);
        if hd.has_flag(flags::END_HEADERS) {
            self.complete_headers(assembly, sink)
        } else {
            self.recv.assembly = Some(assembly);
            Ok(())
        }
    }

    fn complete_headers(
        &mut self,
        assembly: HeaderAssembly,
        sink: &mut impl CodecSink,
    ) -> Result<(), CodecError> {
        let headers = self
            .ctl
            .decoder
            .decode(&assembly.fragment)
            .map_err(|_| CodecError::Hpack)?;
        let sid = assembly.stream_id;

        if assembly.new_stream {
            if self.ctl.terminated || self.ctl.streams.len() as u32 >= self.ctl.max_streams {
                // over the advertised concurrency cap (or draining): refuse
                // without creating state
                self.ctl
                    .queue(FrameKind::RstStream, 0, sid, &ErrorCode::RefusedStream.as_u32().to_be_bytes(), None);
                return Ok(());
            }
            let state = self.ctl.new_stream_state();
            self.ctl.streams.insert(sid, state);

            sink.on_begin_headers(&mut self.ctl, sid);
            for (name, value) in &headers {
                sink.on_header(&mut self.ctl, sid, name, value);
            }
        }

        let Some(stream) = self.ctl.streams.get_mut(&sid) else {
            return Ok(());
        };
        if assembly.end_stream {
            stream.remote_closed = true;
        }
        let mut info = FrameInfo::new(FrameKind::Headers, sid);
        info.end_stream = assembly.end_stream;
        sink.on_frame_recv(&mut self.ctl, info);
        self.maybe_close(sid);
        Ok(())
    }

    fn on_data(
        &mut self,
        hd: FrameHeader,
        payload: Vec<u8>,
        sink: &mut impl CodecSink,
    ) -> Result<(), CodecError> {
        if hd.stream_id == 0 {
            return Err(CodecError::Connection(ErrorCode::ProtocolError));
        }
        let frame_len = payload.len() as i32;
        self.ctl.recv_window -= frame_len;
        if self.ctl.recv_window < 0 {
            return Err(CodecError::Connection(ErrorCode::FlowControlError));
        }

        let sid = hd.stream_id;
        let end_stream = hd.has_flag(flags::END_STREAM);
        let known = match self.ctl.streams.get_mut(&sid) {
            Some(stream) => {
                stream.recv_window -= frame_len;
                if stream.recv_window < 0 {
                    return Err(CodecError::Connection(ErrorCode::FlowControlError));
                }
                true
            }
            // DATA for a stream we already reset; count it against the
            // connection window and move on
            None => false,
        };

        // replenish both windows right away
        if frame_len > 0 {
            self.ctl.recv_window += frame_len;
            self.ctl
                .queue(FrameKind::WindowUpdate, 0, 0, &(frame_len as u32).to_be_bytes(), None);
            if known {
                if let Some(stream) = self.ctl.streams.get_mut(&sid) {
                    stream.recv_window += frame_len;
                }
                self.ctl
                    .queue(FrameKind::WindowUpdate, 0, sid, &(frame_len as u32).to_be_bytes(), None);
            }
        }

        if !known {
            return Ok(());
        }

        let data = strip_padding_and_priority(&hd, payload)?;
        if !data.is_empty() {
            sink.on_data_chunk(&mut self.ctl, sid, &data);
        }
        if end_stream {
            if let Some(stream) = self.ctl.streams.get_mut(&sid) {
                stream.remote_closed = true;
            }
        }
        let mut info = FrameInfo::new(FrameKind::Data, sid);
        info.end_stream = end_stream;
        sink.on_frame_recv(&mut self.ctl, info);
        self.maybe_close(sid);
        Ok(())
    }

    fn on_settings(
        &mut self,
        hd: FrameHeader,
        payload: Vec<u8>,
        sink: &mut impl CodecSink,
    ) -> Result<(), CodecError> {
        if hd.stream_id != 0 {
            return Err(CodecError::Connection(ErrorCode::ProtocolError));
        }
        if hd.has_flag(flags::ACK) {
            let mut info = FrameInfo::new(FrameKind::Settings, 0);
            info.ack = true;
            sink.on_frame_recv(&mut self.ctl, info);
            return Ok(());
        }
        if payload.len() % 6 != 0 {
            return Err(CodecError::Connection(ErrorCode::FrameSizeError));
        }

        for entry in payload.chunks_exact(6) {
            let id = u16::from_be_bytes([entry[0], entry[1]]);
            let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
            match Settings::from_u16(id) {
                Some(Settings::InitialWindowSize) => {
                    if value > i32::MAX as u32 {
                        return Err(CodecError::Connection(ErrorCode::FlowControlError));
                    }
                    let delta = value as i32 - self.ctl.peer_initial_window;
                    self.ctl.peer_initial_window = value as i32;
                    for stream in self.ctl.streams.values_mut() {
                        stream.send_window += delta;
                    }
                }
                Some(Settings::MaxFrameSize) => {
                    if !(16_384..=16_777_215).contains(&value) {
                        return Err(CodecError::Connection(ErrorCode::ProtocolError));
                    }
                    self.ctl.peer_max_frame = value as usize;
                }
                Some(Settings::HeaderTableSize) => {
                    // the encoder keeps its default table; peers accept it
                    debug!("peer header table size {value} noted");
                }
                Some(_) => {}
                None => debug!("ignoring unknown setting {id}"),
            }
        }

        self.ctl.queue(FrameKind::Settings, flags::ACK, 0, &[], None);
        let info = FrameInfo::new(FrameKind::Settings, 0);
        sink.on_frame_recv(&mut self.ctl, info);
        Ok(())
    }

    fn on_window_update(&mut self, hd: FrameHeader, payload: Vec<u8>) -> Result<(), CodecError> {
        if payload.len() != 4 {
            return Err(CodecError::Connection(ErrorCode::FrameSizeError));
        }
        let increment =
            (u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7fff_ffff) as i64;
        if increment == 0 {
            return Err(CodecError::Connection(ErrorCode::ProtocolError));
        }

        if hd.stream_id == 0 {
            let next = self.ctl.send_window as i64 + increment;
            if next > i32::MAX as i64 {
                return Err(CodecError::Connection(ErrorCode::FlowControlError));
            }
            self.ctl.send_window = next as i32;
            // connection window growth can unblock every parked stream
            let unblocked: Vec<u32> = self
                .ctl
                .streams
                .iter_mut()
                .filter(|(_, s)| s.blocked && s.sending)
                .map(|(id, s)| {
                    s.blocked = false;
                    *id
                })
                .collect();
            self.ctl.sendable.extend(unblocked);
        } else {
            let mut overflow = false;
            if let Some(stream) = self.ctl.streams.get_mut(&hd.stream_id) {
                let next = stream.send_window as i64 + increment;
                if next > i32::MAX as i64 {
                    overflow = true;
                } else {
                    stream.send_window = next as i32;
                    if stream.blocked && stream.sending {
                        stream.blocked = false;
                        self.ctl.sendable.push_back(hd.stream_id);
                    }
                }
            }
            if overflow {
                self.ctl.submit_rst(hd.stream_id, ErrorCode::FlowControlError);
            }
        }
        Ok(())
    }

    fn on_rst_stream(&mut self, hd: FrameHeader, payload: Vec<u8>) -> Result<(), CodecError> {
        if payload.len() != 4 {
            return Err(CodecError::Connection(ErrorCode::FrameSizeError));
        }
        let code = ErrorCode::from_u32(u32::from_be_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ]));
        self.ctl.close_stream(hd.stream_id, code);
        Ok(())
    }

    fn on_ping(&mut self, hd: FrameHeader, payload: Vec<u8>) -> Result<(), CodecError> {
        if hd.stream_id != 0 || payload.len() != 8 {
            return Err(CodecError::Connection(ErrorCode::ProtocolError));
        }
        if !hd.has_flag(flags::ACK) {
            self.ctl.queue(FrameKind::Ping, flags::ACK, 0, &payload, None);
        }
        Ok(())
    }

    fn maybe_close(&mut self, stream_id: u32) {
        let done = self
            .ctl
            .streams
            .get(&stream_id)
            .is_some_and(|s| s.remote_closed && s.local_closed);
        if done {
            self.ctl.close_stream(stream_id, ErrorCode::NoError);
        }
    }

    /// Refills `wb` from the outbound queues. Control frames drain first,
    /// then DATA frames round-robin over sendable streams. Stops when the
    /// buffer cannot fit the next frame.
    pub fn produce(
        &mut self,
        wb: &mut Buffer<WRITE_BUF>,
        sink: &mut impl CodecSink,
    ) -> Result<(), CodecError> {
        // control frames, partial writes allowed
        loop {
            let Some(front) = self.ctl.control.front() else {
                break;
            };
            let remaining = front.bytes.len() - self.ctl.control_off;
            let n = wb.write(&front.bytes[self.ctl.control_off..]);
            if n < remaining {
                self.ctl.control_off += n;
                return Ok(());
            }
            let done = self.ctl.control.pop_front().expect("front checked above");
            self.ctl.control_off = 0;
            if let Some(info) = done.info {
                sink.on_frame_sent(&mut self.ctl, info);
            }
            self.reap(sink);
        }

        // DATA frames
        loop {
            if wb.wleft() <= FRAME_HEADER_LEN {
                break;
            }
            let Some(sid) = self.ctl.sendable.pop_front() else {
                break;
            };
            let Some(stream) = self.ctl.streams.get_mut(&sid) else {
                continue;
            };
            if !stream.sending {
                continue;
            }

            let window = stream.send_window.min(self.ctl.send_window);
            if window <= 0 {
                stream.blocked = true;
                let mut info = FrameInfo::new(FrameKind::Data, sid);
                info.flow_blocked = true;
                sink.on_frame_sent(&mut self.ctl, info);
                continue;
            }

            let max_chunk = (window as usize)
                .min(self.ctl.peer_max_frame)
                .min(MAX_FRAME_SIZE)
                .min(wb.wleft() - FRAME_HEADER_LEN);

            match sink.poll_data(sid, max_chunk) {
                DataPoll::Deferred => {
                    if let Some(stream) = self.ctl.streams.get_mut(&sid) {
                        stream.deferred = true;
                    }
                }
                DataPoll::Error => {
                    self.ctl.submit_rst(sid, ErrorCode::InternalError);
                    self.reap(sink);
                }
                DataPoll::Ready { len, eof } => {
                    let fl = if eof { flags::END_STREAM } else { 0 };
                    let hd = FrameHeader::new(len as u32, FrameKind::Data, fl, sid).encode();
                    if sink.send_data(wb, sid, &hd, len) == DataSend::Error {
                        self.ctl.submit_rst(sid, ErrorCode::InternalError);
                        self.reap(sink);
                        continue;
                    }
                    self.ctl.send_window -= len as i32;
                    let mut info = FrameInfo::new(FrameKind::Data, sid);
                    info.end_stream = eof;
                    let mut reset_early = false;
                    let mut finished = false;
                    if let Some(stream) = self.ctl.streams.get_mut(&sid) {
                        stream.send_window -= len as i32;
                        if eof {
                            stream.local_closed = true;
                            stream.sending = false;
                            if !stream.remote_closed {
                                reset_early = true;
                            } else {
                                finished = true;
                            }
                        } else if stream.send_window.min(self.ctl.send_window) <= 0 {
                            stream.blocked = true;
                            info.flow_blocked = true;
                        } else {
                            self.ctl.sendable.push_back(sid);
                        }
                    }
                    if reset_early {
                        // we are done but the peer is not: reset
                        warn!("resetting stream {sid}: response complete before request body");
                        self.ctl.queue(
                            FrameKind::RstStream,
                            0,
                            sid,
                            &ErrorCode::NoError.as_u32().to_be_bytes(),
                            None,
                        );
                        self.ctl.close_stream(sid, ErrorCode::NoError);
                    } else if finished {
                        self.maybe_close(sid);
                    }
                    sink.on_frame_sent(&mut self.ctl, info);
                    self.reap(sink);
                }
            }
        }
        Ok(())
    }
}

/// Peels PADDED/PRIORITY decoration off a HEADERS or DATA payload.
fn strip_padding_and_priority(hd: &FrameHeader, payload: Vec<u8>) -> Result<Vec<u8>, CodecError> {
    let mut start = 0;
    let mut end = payload.len();

    if hd.has_flag(flags::PADDED) {
        if payload.is_empty() {
            return Err(CodecError::Connection(ErrorCode::ProtocolError));
        }
        let pad = payload[0] as usize;
        start += 1;
        if start + pad > end {
            return Err(CodecError::Connection(ErrorCode::ProtocolError));
        }
        end -= pad;
    }
    if hd.kind == FrameKind::Headers && hd.has_flag(flags::PRIORITY) {
        if start + 5 > end {
            return Err(CodecError::Connection(ErrorCode::ProtocolError));
        }
        start += 5;
    }
    Ok(payload[start..end].to_vec())
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct TestSink {
        events: Vec<String>,
        headers: Vec<(String, String)>,
        chunks: Vec<Vec<u8>>,
        closes: Vec<(u32, ErrorCode)>,
        // response body source
        body: Vec<u8>,
        offset: usize,
        open_ended: bool,
        queued: usize,
    }

    impl CodecSink for TestSink {
        fn on_begin_headers(&mut self, _ctl: &mut Control, stream_id: u32) {
            self.events.push(format!("begin:{stream_id}"));
        }

        fn on_header(&mut self, _ctl: &mut Control, _sid: u32, name: &[u8], value: &[u8]) {
            self.headers.push((
                String::from_utf8_lossy(name).into_owned(),
                String::from_utf8_lossy(value).into_owned(),
            ));
        }

        fn on_frame_recv(&mut self, _ctl: &mut Control, frame: FrameInfo) {
            self.events
                .push(format!("recv:{:?}:{}:{}", frame.kind, frame.stream_id, frame.end_stream));
        }

        fn on_data_chunk(&mut self, _ctl: &mut Control, _sid: u32, data: &[u8]) {
            self.chunks.push(data.to_vec());
        }

        fn on_stream_close(&mut self, _ctl: &mut Control, stream_id: u32, error: ErrorCode) {
            self.closes.push((stream_id, error));
        }

        fn on_frame_sent(&mut self, _ctl: &mut Control, frame: FrameInfo) {
            self.events
                .push(format!("sent:{:?}:{}:{}", frame.kind, frame.stream_id, frame.end_stream));
        }

        fn poll_data(&mut self, _sid: u32, max: usize) -> DataPoll {
            if self.open_ended {
                if self.queued == 0 {
                    return DataPoll::Deferred;
                }
                let len = self.queued.min(max);
                return DataPoll::Ready { len, eof: false };
            }
            let left = self.body.len() - self.offset;
            let len = left.min(max);
            DataPoll::Ready { len, eof: len == left }
        }

        fn send_data(
            &mut self,
            wb: &mut Buffer<WRITE_BUF>,
            _sid: u32,
            frame_header: &[u8; FRAME_HEADER_LEN],
            len: usize,
        ) -> DataSend {
            wb.write_full(frame_header);
            if self.open_ended {
                wb.fill(b'e', len);
                self.queued -= len;
            } else {
                wb.write_full(&self.body[self.offset..self.offset + len]);
                self.offset += len;
            }
            DataSend::Done
        }
    }

    fn request_headers_frame(stream_id: u32, end_stream: bool) -> Vec<u8> {
        let mut enc = hpack::Encoder::new();
        let block = enc.encode(vec![
            (b":method".as_ref(), b"GET".as_ref()),
            (b":scheme".as_ref(), b"https".as_ref()),
            (b":path".as_ref(), b"/index.html".as_ref()),
            (b":authority".as_ref(), b"localhost".as_ref()),
        ]);
        let fl = flags::END_HEADERS | if end_stream { flags::END_STREAM } else { 0 };
        let mut frame = FrameHeader::new(block.len() as u32, FrameKind::Headers, fl, stream_id)
            .encode()
            .to_vec();
        frame.extend_from_slice(&block);
        frame
    }

    fn connected_codec(sink: &mut TestSink) -> Http2Codec {
        let mut codec = Http2Codec::new(100);
        codec.receive(PREFACE, sink).unwrap();
        let settings = FrameHeader::new(0, FrameKind::Settings, 0, 0).encode();
        codec.receive(&settings, sink).unwrap();
        codec
    }

    #[test]
    fn bad_preface_is_fatal() {
        let mut sink = TestSink::default();
        let mut codec = Http2Codec::new(100);
        assert_eq!(
            Err(CodecError::BadPreface),
            codec.receive(b"GET / HTTP/1.1\r\n\r\n--------", &mut sink)
        );
    }

    #[test]
    fn request_headers_open_a_stream_and_deliver_each_header() {
        let mut sink = TestSink::default();
        let mut codec = connected_codec(&mut sink);
        codec.receive(&request_headers_frame(1, true), &mut sink).unwrap();

        assert!(sink.events.contains(&"begin:1".to_string()));
        assert!(sink.events.contains(&"recv:Headers:1:true".to_string()));
        assert_eq!(
            Some(&(":path".to_string(), "/index.html".to_string())),
            sink.headers.iter().find(|(n, _)| n == ":path")
        );
    }

    #[test]
    fn data_chunks_reach_the_sink_and_replenish_windows() {
        let mut sink = TestSink::default();
        let mut codec = connected_codec(&mut sink);
        codec.receive(&request_headers_frame(1, false), &mut sink).unwrap();

        let mut frame = FrameHeader::new(5, FrameKind::Data, flags::END_STREAM, 1)
            .encode()
            .to_vec();
        frame.extend_from_slice(b"hello");
        codec.receive(&frame, &mut sink).unwrap();

        assert_eq!(vec![b"hello".to_vec()], sink.chunks);
        assert!(sink.events.contains(&"recv:Data:1:true".to_string()));
        // settings ack (from the client settings) + 2 window updates queued
        let updates = codec
            .ctl
            .control
            .iter()
            .filter(|f| f.bytes[3] == FrameKind::WindowUpdate.as_u8())
            .count();
        assert_eq!(2, updates);
    }

    #[test]
    fn response_with_body_produces_headers_then_data_with_end_stream() {
        let mut sink = TestSink::default();
        let mut codec = connected_codec(&mut sink);
        codec.receive(&request_headers_frame(1, true), &mut sink).unwrap();

        sink.body = b"response body".to_vec();
        codec
            .ctl
            .submit_response(1, &[(b":status".as_ref(), b"200".as_ref())], Some(13));

        let mut wb: Buffer<WRITE_BUF> = Buffer::new();
        codec.produce(&mut wb, &mut sink).unwrap();

        let out = wb.readable().to_vec();
        // settings-ack first (control), then response HEADERS, then DATA
        let mut frames = Vec::new();
        let mut at = 0;
        while at + FRAME_HEADER_LEN <= out.len() {
            let mut hd = [0u8; FRAME_HEADER_LEN];
            hd.copy_from_slice(&out[at..at + FRAME_HEADER_LEN]);
            let hd = FrameHeader::parse(&hd);
            frames.push(hd);
            at += FRAME_HEADER_LEN + hd.length as usize;
        }
        let kinds: Vec<FrameKind> = frames.iter().map(|f| f.kind).collect();
        assert!(kinds.contains(&FrameKind::Headers));
        let data = frames.iter().find(|f| f.kind == FrameKind::Data).unwrap();
        assert_eq!(13, data.length);
        assert!(data.has_flag(flags::END_STREAM));
        // stream fully closed exactly once
        assert_eq!(vec![(1, ErrorCode::NoError)], sink.closes);
    }

    #[test]
    fn zero_length_response_closes_on_the_headers_frame() {
        let mut sink = TestSink::default();
        let mut codec = connected_codec(&mut sink);
        codec.receive(&request_headers_frame(1, true), &mut sink).unwrap();

        codec
            .ctl
            .submit_response(1, &[(b":status".as_ref(), b"304".as_ref())], Some(0));
        let mut wb: Buffer<WRITE_BUF> = Buffer::new();
        codec.produce(&mut wb, &mut sink).unwrap();
        codec.reap(&mut sink);

        assert_eq!(vec![(1, ErrorCode::NoError)], sink.closes);
        assert!(codec.outbound_idle());
    }

    #[test]
    fn large_body_back_pressures_and_finishes_over_multiple_produces() {
        let mut sink = TestSink::default();
        let mut codec = connected_codec(&mut sink);
        codec.receive(&request_headers_frame(1, true), &mut sink).unwrap();

        // window update so the whole body is sendable
        let mut wu = FrameHeader::new(4, FrameKind::WindowUpdate, 0, 0).encode().to_vec();
        wu.extend_from_slice(&500_000u32.to_be_bytes());
        codec.receive(&wu, &mut sink).unwrap();
        let mut wu = FrameHeader::new(4, FrameKind::WindowUpdate, 0, 1).encode().to_vec();
        wu.extend_from_slice(&500_000u32.to_be_bytes());
        codec.receive(&wu, &mut sink).unwrap();

        sink.body = vec![b'x'; 200_000];
        codec
            .ctl
            .submit_response(1, &[(b":status".as_ref(), b"200".as_ref())], Some(200_000));

        let mut wb: Buffer<WRITE_BUF> = Buffer::new();
        let mut payload_total = 0usize;
        for _ in 0..32 {
            codec.produce(&mut wb, &mut sink).unwrap();
            let out = wb.readable().to_vec();
            let mut at = 0;
            while at + FRAME_HEADER_LEN <= out.len() {
                let mut hd = [0u8; FRAME_HEADER_LEN];
                hd.copy_from_slice(&out[at..at + FRAME_HEADER_LEN]);
                let hd = FrameHeader::parse(&hd);
                if at + FRAME_HEADER_LEN + hd.length as usize > out.len() {
                    break;
                }
                if hd.kind == FrameKind::Data {
                    payload_total += hd.length as usize;
                }
                at += FRAME_HEADER_LEN + hd.length as usize;
            }
            wb.reset();
            if codec.outbound_idle() {
                break;
            }
        }
        assert_eq!(200_000, payload_total);
        assert_eq!(vec![(1, ErrorCode::NoError)], sink.closes);
    }

    #[test]
    fn deferred_stream_parks_until_resume() {
        let mut sink = TestSink::default();
        let mut codec = connected_codec(&mut sink);
        codec.receive(&request_headers_frame(1, true), &mut sink).unwrap();

        sink.open_ended = true;
        codec
            .ctl
            .submit_response(1, &[(b":status".as_ref(), b"200".as_ref())], None);

        let mut wb: Buffer<WRITE_BUF> = Buffer::new();
        codec.produce(&mut wb, &mut sink).unwrap();
        assert!(codec.outbound_idle());

        sink.queued = 10;
        codec.ctl.resume(1);
        assert!(codec.want_write());
        wb.reset();
        codec.produce(&mut wb, &mut sink).unwrap();
        assert!(wb.rleft() > 0);
        assert_eq!(0, sink.queued);
    }

    #[test]
    fn submit_rst_schedules_exactly_one_close() {
        let mut sink = TestSink::default();
        let mut codec = connected_codec(&mut sink);
        codec.receive(&request_headers_frame(1, false), &mut sink).unwrap();

        codec.ctl.submit_rst(1, ErrorCode::InternalError);
        codec.ctl.submit_rst(1, ErrorCode::InternalError);
        codec.reap(&mut sink);
        assert_eq!(vec![(1, ErrorCode::InternalError)], sink.closes);
    }

    #[test]
    fn peer_rst_closes_the_stream_with_its_code() {
        let mut sink = TestSink::default();
        let mut codec = connected_codec(&mut sink);
        codec.receive(&request_headers_frame(1, false), &mut sink).unwrap();

        let mut frame = FrameHeader::new(4, FrameKind::RstStream, 0, 1).encode().to_vec();
        frame.extend_from_slice(&ErrorCode::Cancel.as_u32().to_be_bytes());
        codec.receive(&frame, &mut sink).unwrap();
        assert_eq!(vec![(1, ErrorCode::Cancel)], sink.closes);
    }

    #[test]
    fn ping_is_acked() {
        let mut sink = TestSink::default();
        let mut codec = connected_codec(&mut sink);
        let mut frame = FrameHeader::new(8, FrameKind::Ping, 0, 0).encode().to_vec();
        frame.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        codec.receive(&frame, &mut sink).unwrap();

        let ack = codec
            .ctl
            .control
            .iter()
            .find(|f| f.bytes[3] == FrameKind::Ping.as_u8())
            .expect("ping ack queued");
        assert_eq!(flags::ACK, ack.bytes[4]);
        assert_eq!(&[1, 2, 3, 4, 5, 6, 7, 8], &ack.bytes[FRAME_HEADER_LEN..]);
    }

    #[test]
    fn client_push_promise_is_a_connection_error() {
        let mut sink = TestSink::default();
        let mut codec = connected_codec(&mut sink);
        let frame = FrameHeader::new(0, FrameKind::PushPromise, 0, 2).encode();
        assert_eq!(
            Err(CodecError::Connection(ErrorCode::ProtocolError)),
            codec.receive(&frame, &mut sink)
        );
    }
}
