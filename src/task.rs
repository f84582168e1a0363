//! Single-threaded cooperative handler tasks
//!
//! A handler task is an ordinary future polled manually by the worker
//! thread. Creation runs it eagerly to its first suspension; a producer
//! (body sink, DB pump, dispatcher) later fills the [`Slot`] the task is
//! waiting on and the owner polls it again. There is no scheduler and no
//! waker plumbing: resumption always happens from an I/O or timer callback
//! on the same thread. Dropping a task cancels it and releases its frame.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

/// An in-flight handler computation.
pub struct Task {
    fut: Pin<Box<dyn Future<Output = ()>>>,
    done: bool,
}

impl Task {
    /// Wraps a future without polling it. Call [`poll`](Task::poll) right
    /// after to get the eager start the runtime guarantees.
    pub fn new(fut: impl Future<Output = ()> + 'static) -> Self {
        Self {
            fut: Box::pin(fut),
            done: false,
        }
    }

    /// Drives the task until it suspends or completes. Returns `true` once
    /// complete; polling a completed task is a no-op.
    pub fn poll(&mut self) -> bool {
        if self.done {
            return true;
        }
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        if self.fut.as_mut().poll(&mut cx).is_ready() {
            self.done = true;
        }
        self.done
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("done", &self.done).finish()
    }
}

fn noop_waker() -> Waker {
    const VTABLE: RawWakerVTable = RawWakerVTable::new(|_| RAW, |_| {}, |_| {}, |_| {});
    const RAW: RawWaker = RawWaker::new(std::ptr::null(), &VTABLE);
    // Safety: the vtable is entirely no-ops over a null pointer.
    unsafe { Waker::from_raw(RAW) }
}

/// Single-shot value cell shared between a suspended task and the producer
/// that will resume it. `put` then `poll` hands the value to exactly one
/// consumer.
pub struct Slot<T> {
    inner: Rc<RefCell<Option<T>>>,
}

impl<T> Slot<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(None)),
        }
    }

    pub fn put(&self, value: T) {
        *self.inner.borrow_mut() = Some(value);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().is_none()
    }

    /// Future resolving once a producer has filled the slot.
    pub fn wait(&self) -> SlotFuture<T> {
        SlotFuture {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot").field("filled", &!self.is_empty()).finish()
    }
}

pub struct SlotFuture<T> {
    inner: Rc<RefCell<Option<T>>>,
}

impl<T> Future for SlotFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<T> {
        match self.inner.borrow_mut().take() {
            Some(value) => Poll::Ready(value),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Slot, Task};
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn task_without_suspension_completes_on_first_poll() {
        let hit = Rc::new(Cell::new(false));
        let h = Rc::clone(&hit);
        let mut task = Task::new(async move {
            h.set(true);
        });
        assert!(task.poll());
        assert!(hit.get());
    }

    #[test]
    fn task_suspends_until_slot_is_filled() {
        let slot: Slot<u32> = Slot::new();
        let got = Rc::new(Cell::new(0));
        let (s, g) = (slot.clone(), Rc::clone(&got));
        let mut task = Task::new(async move {
            let v = s.wait().await;
            g.set(v);
        });
        assert!(!task.poll());
        assert!(!task.poll());
        slot.put(7);
        assert!(task.poll());
        assert_eq!(7, got.get());
    }

    #[test]
    fn dropping_a_suspended_task_never_resumes_it() {
        let slot: Slot<u32> = Slot::new();
        let got = Rc::new(Cell::new(0));
        let (s, g) = (slot.clone(), Rc::clone(&got));
        let mut task = Task::new(async move {
            let v = s.wait().await;
            g.set(v);
        });
        assert!(!task.poll());
        drop(task);
        slot.put(9);
        assert_eq!(0, got.get());
    }

    #[test]
    fn nested_awaits_resume_through_the_outer_task() {
        let first: Slot<u32> = Slot::new();
        let second: Slot<u32> = Slot::new();
        let got = Rc::new(Cell::new(0));
        let (a, b, g) = (first.clone(), second.clone(), Rc::clone(&got));
        let mut task = Task::new(async move {
            let x = a.wait().await;
            let y = b.wait().await;
            g.set(x + y);
        });
        assert!(!task.poll());
        first.put(1);
        assert!(!task.poll());
        second.put(2);
        assert!(task.poll());
        assert_eq!(3, got.get());
    }
}
