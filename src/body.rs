//! Request body delivery
//!
//! Two modes, chosen by whichever awaiter the handler creates first.
//! Whole-body mode buffers every DATA chunk and resumes once at
//! END_STREAM. Chunk mode resumes per chunk with an owned view and ends
//! with an explicit `None`. Chunks arriving before a mode is chosen buffer
//! up; a later chunk awaiter gets the buffered prefix as its first value.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Unset,
    Whole,
    Chunk,
}

/// Per-stream body state, shared between the session (producer) and the
/// handler's await futures (consumer).
#[derive(Debug)]
pub struct BodyState {
    mode: Mode,
    buffered: Vec<u8>,
    ended: bool,
    /// Ready value for a whole-body awaiter.
    whole: Option<Bytes>,
    /// Ready values for a chunk awaiter; `None` is the end sentinel.
    chunks: VecDeque<Option<Bytes>>,
}

impl BodyState {
    pub fn new() -> Self {
        Self {
            mode: Mode::Unset,
            buffered: Vec::new(),
            ended: false,
            whole: None,
            chunks: VecDeque::new(),
        }
    }

    /// Feeds one DATA chunk. Returns `true` when a suspended awaiter may
    /// now make progress.
    pub fn on_chunk(&mut self, data: &[u8]) -> bool {
        match self.mode {
            Mode::Unset | Mode::Whole => {
                self.buffered.extend_from_slice(data);
                false
            }
            Mode::Chunk => {
                self.chunks.push_back(Some(Bytes::copy_from_slice(data)));
                true
            }
        }
    }

    /// Feeds END_STREAM. Returns `true` when an awaiter may now resume.
    pub fn on_end(&mut self) -> bool {
        if self.ended {
            return false;
        }
        self.ended = true;
        match self.mode {
            Mode::Unset => false,
            Mode::Whole => {
                self.whole = Some(Bytes::from(std::mem::take(&mut self.buffered)));
                true
            }
            Mode::Chunk => {
                self.chunks.push_back(None);
                true
            }
        }
    }

    fn choose_whole(&mut self) {
        if self.mode != Mode::Unset {
            return;
        }
        self.mode = Mode::Whole;
        if self.ended {
            self.whole = Some(Bytes::from(std::mem::take(&mut self.buffered)));
        }
    }

    fn choose_chunk(&mut self) {
        if self.mode != Mode::Unset {
            return;
        }
        self.mode = Mode::Chunk;
        if !self.buffered.is_empty() {
            let prefix = Bytes::from(std::mem::take(&mut self.buffered));
            self.chunks.push_back(Some(prefix));
        }
        if self.ended {
            self.chunks.push_back(None);
        }
    }
}

impl Default for BodyState {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedBody = Rc<RefCell<BodyState>>;

/// Resolves to the concatenated request body at END_STREAM.
pub struct BodyFuture {
    state: SharedBody,
}

impl BodyFuture {
    pub fn new(state: SharedBody) -> Self {
        state.borrow_mut().choose_whole();
        Self { state }
    }
}

impl Future for BodyFuture {
    type Output = Bytes;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Bytes> {
        match self.state.borrow_mut().whole.take() {
            Some(body) => Poll::Ready(body),
            None => Poll::Pending,
        }
    }
}

/// Resolves to the next DATA chunk, or `None` once the body ended.
pub struct ChunkFuture {
    state: SharedBody,
}

impl ChunkFuture {
    pub fn new(state: SharedBody) -> Self {
        state.borrow_mut().choose_chunk();
        Self { state }
    }
}

impl Future for ChunkFuture {
    type Output = Option<Bytes>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        match self.state.borrow_mut().chunks.pop_front() {
            Some(chunk) => Poll::Ready(chunk),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod test {
    use super::{BodyFuture, BodyState, ChunkFuture};
    use crate::task::Task;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn whole_body_resumes_once_with_the_concatenation() {
        let state = Rc::new(RefCell::new(BodyState::new()));
        let got = Rc::new(RefCell::new(None));
        let (s, g) = (Rc::clone(&state), Rc::clone(&got));
        let mut task = Task::new(async move {
            let body = BodyFuture::new(s).await;
            *g.borrow_mut() = Some(body);
        });
        assert!(!task.poll());

        // three DATA frames then END_STREAM
        assert!(!state.borrow_mut().on_chunk(b"one "));
        assert!(!state.borrow_mut().on_chunk(b"two "));
        assert!(!state.borrow_mut().on_chunk(b"three"));
        assert!(!task.poll());
        assert!(state.borrow_mut().on_end());
        assert!(task.poll());
        assert_eq!(b"one two three".as_ref(), got.borrow().as_ref().unwrap());
    }

    #[test]
    fn chunks_buffered_before_mode_choice_are_delivered_as_a_prefix() {
        let state = Rc::new(RefCell::new(BodyState::new()));
        state.borrow_mut().on_chunk(b"early");

        let got = Rc::new(RefCell::new(Vec::new()));
        let (s, g) = (Rc::clone(&state), Rc::clone(&got));
        let mut task = Task::new(async move {
            loop {
                match ChunkFuture::new(Rc::clone(&s)).await {
                    Some(chunk) => g.borrow_mut().push(chunk.to_vec()),
                    None => break,
                }
            }
        });
        assert!(!task.poll());

        assert!(state.borrow_mut().on_chunk(b" late"));
        task.poll();
        assert!(state.borrow_mut().on_end());
        assert!(task.poll());

        assert_eq!(vec![b"early".to_vec(), b" late".to_vec()], *got.borrow());
    }

    #[test]
    fn end_before_any_await_still_resolves_whole_mode() {
        let state = Rc::new(RefCell::new(BodyState::new()));
        state.borrow_mut().on_chunk(b"all of it");
        state.borrow_mut().on_end();

        let got = Rc::new(RefCell::new(None));
        let (s, g) = (Rc::clone(&state), Rc::clone(&got));
        let mut task = Task::new(async move {
            *g.borrow_mut() = Some(BodyFuture::new(s).await);
        });
        assert!(task.poll());
        assert_eq!(b"all of it".as_ref(), got.borrow().as_ref().unwrap());
    }

    #[test]
    fn empty_body_delivers_the_end_sentinel_only() {
        let state = Rc::new(RefCell::new(BodyState::new()));
        state.borrow_mut().on_end();

        let got = Rc::new(RefCell::new(Vec::new()));
        let (s, g) = (Rc::clone(&state), Rc::clone(&got));
        let mut task = Task::new(async move {
            while let Some(chunk) = ChunkFuture::new(Rc::clone(&s)).await {
                g.borrow_mut().push(chunk.to_vec());
            }
        });
        assert!(task.poll());
        assert!(got.borrow().is_empty());
    }
}
