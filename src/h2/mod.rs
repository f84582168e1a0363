//! HTTP/2 codec
//!
//! [IETF RFC 7540](https://www.rfc-editor.org/rfc/rfc7540)
//!
//! The codec is an opaque session object: bytes go in through
//! [`Http2Codec::receive`], frames come out through the named callbacks of
//! [`CodecSink`], and outbound frames are produced into the session's write
//! buffer by [`Http2Codec::produce`]. Header compression is delegated to the
//! `hpack` crate; framing, flow control and stream states live here.

mod codec;
mod frame;

pub use codec::{Control, DataPoll, DataSend, Http2Codec};
pub use frame::{flags, ErrorCode, FrameHeader, FrameKind, Settings, FRAME_HEADER_LEN};

use thiserror::Error;

/// Size of the session's outbound buffer the codec writes into.
pub const WRITE_BUF: usize = 64 * 1024;

/// Size of the inbound plaintext scratch fed to the codec.
pub const READ_BUF: usize = 16 * 1024;

/// Client connection preface, RFC 7540 §3.5.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Errors fatal to the HTTP/2 connection. Per-stream problems are reported
/// through `RST_STREAM`, never through this type.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("connection error: {0:?}")]
    Connection(ErrorCode),

    #[error("bad connection preface")]
    BadPreface,

    #[error("header decompression failed")]
    Hpack,
}

/// Details of a frame delivered to [`CodecSink::on_frame_recv`] and
/// [`CodecSink::on_frame_sent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub kind: FrameKind,
    pub stream_id: u32,
    pub end_stream: bool,
    pub ack: bool,
    /// Set on sent DATA frames when the stream is now blocked by flow
    /// control.
    pub flow_blocked: bool,
}

impl FrameInfo {
    pub(crate) fn new(kind: FrameKind, stream_id: u32) -> Self {
        Self {
            kind,
            stream_id,
            end_stream: false,
            ack: false,
            flow_blocked: false,
        }
    }
}

/// Callback surface driven by the codec. One implementor per session.
pub trait CodecSink {
    /// A request HEADERS frame opened a new stream.
    fn on_begin_headers(&mut self, ctl: &mut Control, stream_id: u32);

    /// One decoded request header.
    fn on_header(&mut self, ctl: &mut Control, stream_id: u32, name: &[u8], value: &[u8]);

    /// A complete frame was received.
    fn on_frame_recv(&mut self, ctl: &mut Control, frame: FrameInfo);

    /// A chunk of request body.
    fn on_data_chunk(&mut self, ctl: &mut Control, stream_id: u32, data: &[u8]);

    /// The stream is gone; drop everything attached to it.
    fn on_stream_close(&mut self, ctl: &mut Control, stream_id: u32, error: ErrorCode);

    /// A frame was fully written into the session buffer.
    fn on_frame_sent(&mut self, ctl: &mut Control, frame: FrameInfo);

    /// How many response-body bytes stream `stream_id` can produce right
    /// now, capped at `max`.
    fn poll_data(&mut self, stream_id: u32, max: usize) -> DataPoll;

    /// Write the 9-byte `frame_header` followed by exactly `len` body bytes
    /// into `wb`. The codec has already checked `wb` has room.
    fn send_data(
        &mut self,
        wb: &mut crate::buffer::Buffer<WRITE_BUF>,
        stream_id: u32,
        frame_header: &[u8; FRAME_HEADER_LEN],
        len: usize,
    ) -> DataSend;
}
