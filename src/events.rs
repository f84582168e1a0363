//! Per-worker pub/sub and the server-sent-events stream

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::buffer::Buffer;
use crate::h2::WRITE_BUF;

/// Event payload. DB text and notification payloads arrive shared so a
/// single result can fan out to many subscribers without copying.
#[derive(Debug, Clone)]
pub enum Payload {
    Owned(String),
    Static(&'static str),
    Shared(Rc<str>),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Owned(s) => s.as_bytes(),
            Self::Static(s) => s.as_bytes(),
            Self::Shared(s) => s.as_bytes(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self::Owned(s)
    }
}

impl From<&'static str> for Payload {
    fn from(s: &'static str) -> Self {
        Self::Static(s)
    }
}

impl From<Rc<str>> for Payload {
    fn from(s: Rc<str>) -> Self {
        Self::Shared(s)
    }
}

/// `{channel, name, payload}` record delivered to SSE subscribers. The
/// event name is the channel prefix up to `/`, so `chat/42` publishes as
/// `event: chat`.
#[derive(Debug, Clone)]
pub struct Event {
    pub channel: Rc<str>,
    pub name: Rc<str>,
    pub payload: Payload,
}

impl Event {
    pub fn new(channel: impl Into<Rc<str>>, payload: impl Into<Payload>) -> Self {
        let channel: Rc<str> = channel.into();
        let name: Rc<str> = match channel.find('/') {
            Some(at) => Rc::from(&channel[..at]),
            None => Rc::clone(&channel),
        };
        Self {
            channel,
            name,
            payload: payload.into(),
        }
    }

    /// Bytes this event occupies on the wire:
    /// `event: <name>\ndata: <payload>\n\n`.
    pub fn wire_len(&self) -> usize {
        EVENT_PREFIX.len() + self.name.len() + 1 + DATA_PREFIX.len() + self.payload.len() + 2
    }
}

const EVENT_PREFIX: &str = "event: ";
const DATA_PREFIX: &str = "data: ";

/// Identifies the HTTP/2 stream a parked event stream belongs to, so the
/// worker can resume the right codec stream after a submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeTarget {
    pub session_token: usize,
    pub stream_id: u32,
}

#[derive(Debug)]
struct EventStreamInner {
    target: WakeTarget,
    queue: VecDeque<Event>,
    /// Write position inside the front event's wire form.
    pos: usize,
    paused: bool,
}

/// Never-ending response body fed by the dispatcher. Cloneable handle; the
/// stream's DataStream slot and the dispatcher registry share one state.
#[derive(Debug, Clone)]
pub struct EventStream {
    inner: Rc<RefCell<EventStreamInner>>,
}

impl EventStream {
    pub fn new(session_token: usize, stream_id: u32) -> Self {
        Self {
            inner: Rc::new(RefCell::new(EventStreamInner {
                target: WakeTarget {
                    session_token,
                    stream_id,
                },
                queue: VecDeque::new(),
                pos: 0,
                paused: false,
            })),
        }
    }

    pub fn target(&self) -> WakeTarget {
        self.inner.borrow().target
    }

    fn same_as(&self, other: &EventStream) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Queues an event. Returns the wake target when the stream was parked
    /// and the codec must be resumed (resetting the in-flight offset).
    pub fn submit(&self, event: Event) -> Option<WakeTarget> {
        let mut inner = self.inner.borrow_mut();
        inner.queue.push_back(event);
        if inner.paused {
            inner.paused = false;
            inner.pos = 0;
            Some(inner.target)
        } else {
            None
        }
    }

    /// The 2 s heartbeat keeping idle connections warm.
    pub fn ping(&self) -> Option<WakeTarget> {
        self.submit(Event::new("ping", "Hello!"))
    }

    /// Bytes available right now. An empty queue parks the stream and
    /// reports zero; [`submit`](EventStream::submit) un-parks it.
    pub fn poll_remaining(&self) -> usize {
        let mut inner = self.inner.borrow_mut();
        match inner.queue.front() {
            Some(event) => event.wire_len() - inner.pos,
            None => {
                inner.paused = true;
                0
            }
        }
    }

    /// Writes exactly `n` bytes of the front event into `wb`, continuing
    /// from the previous position. If `n` runs past the event's content
    /// the remainder is padded with `\n`.
    pub fn send(&self, wb: &mut Buffer<WRITE_BUF>, n: usize) {
        let mut inner = self.inner.borrow_mut();
        let mut to_write = n;

        let (wire_len, name_len) = match inner.queue.front() {
            Some(event) => (event.wire_len(), event.name.len()),
            None => {
                wb.fill(b'\n', to_write);
                return;
            }
        };

        let pre_len = EVENT_PREFIX.len() + name_len + 1 + DATA_PREFIX.len();
        while to_write > 0 && inner.pos < pre_len {
            let pos = inner.pos;
            let event = inner.queue.front().expect("front checked above");
            let piece: &[u8] = if pos < EVENT_PREFIX.len() {
                &EVENT_PREFIX.as_bytes()[pos..]
            } else if pos < EVENT_PREFIX.len() + name_len {
                &event.name.as_bytes()[pos - EVENT_PREFIX.len()..]
            } else if pos == EVENT_PREFIX.len() + name_len {
                b"\n"
            } else {
                &DATA_PREFIX.as_bytes()[pos - (EVENT_PREFIX.len() + name_len + 1)..]
            };
            let take = piece.len().min(to_write).min(pre_len - pos);
            wb.write_full(&piece[..take]);
            inner.pos += take;
            to_write -= take;
        }

        if to_write > 0 && inner.pos >= pre_len {
            let at = inner.pos - pre_len;
            let event = inner.queue.front().expect("front checked above");
            let payload = event.payload.as_bytes();
            if at < payload.len() {
                let take = (payload.len() - at).min(to_write);
                wb.write_full(&payload[at..at + take]);
                inner.pos += take;
                to_write -= take;
            }
        }

        // trailing "\n\n" plus any padding the codec committed to
        if to_write > 0 {
            wb.fill(b'\n', to_write);
            inner.pos += to_write;
        }

        if inner.pos >= wire_len {
            inner.queue.pop_front();
            inner.pos = 0;
        }
    }
}

/// Per-worker `channel → subscribers` registry. Subscriber slots are
/// nullable so unsubscribing during delivery never invalidates iteration.
#[derive(Debug, Default)]
pub struct EventDispatcher {
    registry: HashMap<String, Vec<Option<EventStream>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `stream` on `channel`, refilling an earlier vacated slot
    /// when one exists.
    pub fn subscribe(&mut self, channel: &str, stream: EventStream) {
        let slots = self.registry.entry(channel.to_string()).or_default();
        match slots.iter_mut().find(|s| s.is_none()) {
            Some(slot) => *slot = Some(stream),
            None => slots.push(Some(stream)),
        }
    }

    /// Delivers `event` to every live subscriber of its channel. Returns
    /// the streams that were parked and now need their codec resumed.
    pub fn publish(&mut self, event: Event) -> Vec<WakeTarget> {
        let mut wake = Vec::new();
        if let Some(slots) = self.registry.get(event.channel.as_ref()) {
            for stream in slots.iter().flatten() {
                if let Some(target) = stream.submit(event.clone()) {
                    wake.push(target);
                }
            }
        }
        wake
    }

    /// Nulls every slot pointing at `stream`.
    pub fn remove_stream(&mut self, stream: &EventStream) {
        for slots in self.registry.values_mut() {
            for slot in slots.iter_mut() {
                if slot.as_ref().is_some_and(|s| s.same_as(stream)) {
                    *slot = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Event, EventDispatcher, EventStream};
    use crate::buffer::Buffer;
    use crate::h2::WRITE_BUF;

    fn drain(stream: &EventStream) -> Vec<u8> {
        let mut wb: Buffer<WRITE_BUF> = Buffer::new();
        let mut out = Vec::new();
        loop {
            let n = stream.poll_remaining();
            if n == 0 {
                break;
            }
            stream.send(&mut wb, n);
            out.extend_from_slice(wb.readable());
            wb.reset();
        }
        out
    }

    #[test]
    fn event_name_is_the_channel_prefix() {
        let ev = Event::new("chat/42", "hi");
        assert_eq!("chat", ev.name.as_ref());
        let ev = Event::new("ping", "Hello!");
        assert_eq!("ping", ev.name.as_ref());
    }

    #[test]
    fn wire_format_is_event_name_data_payload() {
        let stream = EventStream::new(0, 1);
        stream.submit(Event::new("chat/7", "hello there"));
        assert_eq!(b"event: chat\ndata: hello there\n\n".to_vec(), drain(&stream));
    }

    #[test]
    fn heartbeat_produces_the_ping_event() {
        let stream = EventStream::new(0, 1);
        stream.ping();
        assert_eq!(b"event: ping\ndata: Hello!\n\n".to_vec(), drain(&stream));
    }

    #[test]
    fn send_is_incremental_across_tiny_writes() {
        let stream = EventStream::new(0, 1);
        stream.submit(Event::new("a", "xyz"));
        let total = stream.poll_remaining();
        let mut wb: Buffer<WRITE_BUF> = Buffer::new();
        for _ in 0..total {
            stream.send(&mut wb, 1);
        }
        assert_eq!(b"event: a\ndata: xyz\n\n".to_vec(), wb.readable().to_vec());
        assert_eq!(0, stream.poll_remaining());
    }

    #[test]
    fn empty_queue_parks_and_submit_returns_the_wake_target() {
        let stream = EventStream::new(3, 5);
        assert_eq!(0, stream.poll_remaining());
        let target = stream.submit(Event::new("c", "v")).expect("was parked");
        assert_eq!(3, target.session_token);
        assert_eq!(5, target.stream_id);
        // not parked any more: further submits do not wake again
        assert!(stream.submit(Event::new("c", "v2")).is_none());
    }

    #[test]
    fn oversized_commit_pads_with_newlines() {
        let stream = EventStream::new(0, 1);
        stream.submit(Event::new("a", "x"));
        let len = stream.poll_remaining();
        let mut wb: Buffer<WRITE_BUF> = Buffer::new();
        stream.send(&mut wb, len + 3);
        let out = wb.readable();
        assert_eq!(len + 3, out.len());
        assert!(out.ends_with(b"\n\n\n\n\n"));
    }

    #[test]
    fn publish_reaches_every_subscriber_in_order() {
        let mut dispatcher = EventDispatcher::new();
        let a = EventStream::new(0, 1);
        let b = EventStream::new(0, 3);
        dispatcher.subscribe("news", a.clone());
        dispatcher.subscribe("news", b.clone());

        dispatcher.publish(Event::new("news", "one"));
        dispatcher.publish(Event::new("news", "two"));

        let out = drain(&a);
        let first = b"event: news\ndata: one\n\n".to_vec();
        assert!(out.starts_with(&first));
        assert_eq!(out, drain(&b));
    }

    #[test]
    fn remove_stream_nulls_all_slots_and_refills_on_subscribe() {
        let mut dispatcher = EventDispatcher::new();
        let a = EventStream::new(0, 1);
        dispatcher.subscribe("x", a.clone());
        dispatcher.subscribe("y", a.clone());
        dispatcher.remove_stream(&a);

        assert!(dispatcher.publish(Event::new("x", "gone")).is_empty());
        assert_eq!(0, {
            // nothing was delivered
            drain(&a).len()
        });

        let b = EventStream::new(0, 3);
        assert_eq!(0, b.poll_remaining());
        dispatcher.subscribe("x", b.clone());
        // parked stream gets woken through the refilled slot
        assert_eq!(1, dispatcher.publish(Event::new("x", "back")).len());
    }

    #[test]
    fn publish_to_unknown_channel_is_a_no_op() {
        let mut dispatcher = EventDispatcher::new();
        assert!(dispatcher.publish(Event::new("nobody", "home")).is_empty());
    }
}
