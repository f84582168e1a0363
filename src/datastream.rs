//! Response body producers
//!
//! A stream's body source is a three-way sum: an in-memory string, a cached
//! static file, or a never-ending event stream. The per-stream offset lives
//! on the [`Stream`](crate::stream::Stream), so a shared
//! [`FileEntry`](crate::static_files::FileEntry) can serve many responses
//! at once.

use std::io;
use std::os::unix::fs::FileExt;
use std::rc::Rc;

use log::error;

use crate::buffer::Buffer;
use crate::events::EventStream;
use crate::h2::WRITE_BUF;
use crate::static_files::FileEntry;

/// In-memory response body.
#[derive(Debug)]
pub enum StringSource {
    Owned(Vec<u8>),
    Static(&'static [u8]),
}

impl StringSource {
    fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Owned(v) => v,
            Self::Static(s) => s,
        }
    }
}

impl From<String> for StringSource {
    fn from(s: String) -> Self {
        Self::Owned(s.into_bytes())
    }
}

impl From<Vec<u8>> for StringSource {
    fn from(v: Vec<u8>) -> Self {
        Self::Owned(v)
    }
}

impl From<&'static str> for StringSource {
    fn from(s: &'static str) -> Self {
        Self::Static(s.as_bytes())
    }
}

/// Response body producer. `send` must write exactly `n` bytes into the
/// session buffer from the given offset; the caller advances the offset.
#[derive(Debug)]
pub enum DataStream {
    String(StringSource),
    File { entry: Rc<FileEntry>, len: u64 },
    Event(EventStream),
}

impl DataStream {
    pub fn string(src: impl Into<StringSource>) -> Self {
        Self::String(src.into())
    }

    pub fn file(entry: Rc<FileEntry>) -> Self {
        let len = entry.info().length;
        Self::File { entry, len }
    }

    /// Total bytes the body will produce. Zero for an idle event stream.
    pub fn length(&self) -> u64 {
        match self {
            Self::String(s) => s.as_bytes().len() as u64,
            Self::File { len, .. } => *len,
            Self::Event(es) => es.poll_remaining() as u64,
        }
    }

    /// `(bytes_available_now, must_eof_match)`. Fixed-size sources end
    /// exactly at `length`; event streams are open-ended and report zero
    /// when parked.
    pub fn remaining(&self, offset: u64) -> (u64, bool) {
        match self {
            Self::String(s) => ((s.as_bytes().len() as u64).saturating_sub(offset), true),
            Self::File { len, .. } => (len.saturating_sub(offset), true),
            Self::Event(es) => (es.poll_remaining() as u64, false),
        }
    }

    /// Writes exactly `n` body bytes at `offset` into `wb`. The codec has
    /// already reserved the space.
    pub fn send(&self, wb: &mut Buffer<WRITE_BUF>, offset: u64, n: usize) -> io::Result<()> {
        match self {
            Self::String(s) => {
                let bytes = s.as_bytes();
                let at = offset as usize;
                wb.write_full(&bytes[at..at + n]);
                Ok(())
            }
            Self::File { entry, .. } => {
                let mut at = offset;
                let mut left = n;
                while left > 0 {
                    let dst = &mut wb.writable()[..left];
                    let nread = match entry.file().read_at(dst, at) {
                        Ok(0) => {
                            // truncated under us; the advertised length no
                            // longer exists on disk
                            error!("static file {} shrank mid-response", entry.path().display());
                            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "file truncated"));
                        }
                        Ok(nread) => nread,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            error!("read from {} failed: {e}", entry.path().display());
                            return Err(e);
                        }
                    };
                    wb.advance(nread);
                    at += nread as u64;
                    left -= nread;
                }
                Ok(())
            }
            Self::Event(es) => {
                es.send(wb, n);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::DataStream;
    use crate::buffer::Buffer;
    use crate::h2::WRITE_BUF;

    #[test]
    fn string_stream_reports_fixed_size_remaining() {
        let ds = DataStream::string("hello world".to_string());
        assert_eq!(11, ds.length());
        assert_eq!((11, true), ds.remaining(0));
        assert_eq!((4, true), ds.remaining(7));
        assert_eq!((0, true), ds.remaining(11));
    }

    #[test]
    fn string_stream_sends_the_requested_window() {
        let ds = DataStream::string("hello world");
        let mut wb: Buffer<WRITE_BUF> = Buffer::new();
        ds.send(&mut wb, 0, 5).unwrap();
        ds.send(&mut wb, 5, 6).unwrap();
        assert_eq!(b"hello world", wb.readable());
    }

    #[test]
    fn event_stream_is_open_ended() {
        let ds = DataStream::Event(crate::events::EventStream::new(0, 1));
        assert_eq!((0, false), ds.remaining(0));
    }
}
