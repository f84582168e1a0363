//! Worker threads
//!
//! One OS thread, one poll loop, many sessions. All per-worker state is
//! single-threaded behind `Rc`/`RefCell`; the only cross-thread traffic is
//! the queue of freshly accepted sockets plus its waker (and the file
//! watcher's atomic metadata cells). Handler tasks reach the worker's
//! services — database queue, event dispatcher, static cache, timers —
//! through the shared [`WorkerServices`] handle carried by every request.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crossbeam_queue::ArrayQueue;
use log::{debug, error, info, warn};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;

use crate::config::Config;
use crate::db::{Completion, DbSession, DbShared, SharedQueue};
use crate::events::{Event, EventDispatcher, WakeTarget};
use crate::router::Router;
use crate::session::Session;
use crate::static_files::StaticFileCache;
use crate::timer::TimerQueue;
use crate::util;

const WAKE_TOKEN: Token = Token(usize::MAX);
const DB_TOKEN: Token = Token(usize::MAX - 1);

/// Pending accepted sockets per worker.
const INBOX_CAPACITY: usize = 1024;

const DB_RETRY: std::time::Duration = std::time::Duration::from_secs(1);

/// Timer payloads dispatched by the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    StreamRead { token: usize, stream_id: u32 },
    StreamWrite { token: usize, stream_id: u32 },
    Settings { token: usize },
    SsePing { token: usize, stream_id: u32 },
    DbReconnect,
}

/// Per-worker services shared with sessions and handler tasks.
pub struct WorkerServices {
    config: Arc<Config>,
    router: Arc<Router>,
    pub db: SharedQueue,
    pub dispatcher: RefCell<EventDispatcher>,
    pub cache: RefCell<StaticFileCache>,
    pub timers: RefCell<TimerQueue<TimerEvent>>,
    /// SSE streams whose codec needs resuming after this turn.
    pub wake_list: RefCell<Vec<WakeTarget>>,
    live: RefCell<HashMap<u64, WakeTarget>>,
    serial: Cell<u64>,
    date: RefCell<(i64, Rc<str>)>,
}

impl WorkerServices {
    pub fn new(config: Arc<Config>, router: Arc<Router>) -> Rc<Self> {
        let mut cache = StaticFileCache::new(config.static_root.clone());
        cache.scan();
        let db = Rc::new(RefCell::new(DbShared {
            query_dir: config.query_dir.clone(),
            ..DbShared::default()
        }));
        Rc::new(Self {
            config,
            router,
            db,
            dispatcher: RefCell::new(EventDispatcher::new()),
            cache: RefCell::new(cache),
            timers: RefCell::new(TimerQueue::new()),
            wake_list: RefCell::new(Vec::new()),
            live: RefCell::new(HashMap::new()),
            serial: Cell::new(0),
            date: RefCell::new((-1, Rc::from(""))),
        })
    }

    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Worker-unique monotone stream serial.
    pub fn next_serial(&self) -> u64 {
        let serial = self.serial.get() + 1;
        self.serial.set(serial);
        serial
    }

    pub fn register_stream(&self, serial: u64, token: usize, stream_id: u32) {
        self.live.borrow_mut().insert(
            serial,
            WakeTarget {
                session_token: token,
                stream_id,
            },
        );
    }

    pub fn deregister_stream(&self, serial: u64) {
        self.live.borrow_mut().remove(&serial);
    }

    pub fn is_stream_alive(&self, serial: u64) -> bool {
        self.live.borrow().contains_key(&serial)
    }

    pub fn live_target(&self, serial: u64) -> Option<WakeTarget> {
        self.live.borrow().get(&serial).copied()
    }

    /// RFC 7231 date string, rebuilt once per second and shared after.
    pub fn cached_date(&self) -> Rc<str> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let mut date = self.date.borrow_mut();
        if date.0 != now {
            *date = (now, Rc::from(util::http_date(now)));
        }
        Rc::clone(&date.1)
    }

    /// Publishes on the worker bus and schedules parked SSE streams for
    /// resumption at the end of the turn.
    pub fn publish(&self, event: Event) {
        let woken = self.dispatcher.borrow_mut().publish(event);
        self.wake_list.borrow_mut().extend(woken);
    }

    pub fn new_uuid(&self) -> uuid::Uuid {
        uuid::Uuid::new_v4()
    }
}

impl std::fmt::Debug for WorkerServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerServices")
            .field("serial", &self.serial.get())
            .field("live", &self.live.borrow().len())
            .finish()
    }
}

/// Cross-thread handle the acceptor uses to feed a worker.
pub struct WorkerHandle {
    inbox: Arc<ArrayQueue<TcpStream>>,
    waker: Arc<Waker>,
    cancel: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Hands a freshly accepted socket to the worker and wakes its loop.
    pub fn add_connection(&self, sock: TcpStream) {
        if self.inbox.push(sock).is_err() {
            // full inbox: drop the connection rather than block the acceptor
            warn!("worker inbox full, rejecting connection");
            return;
        }
        if let Err(e) = self.waker.wake() {
            error!("failed to wake worker: {e}");
        }
    }

    pub fn shutdown(mut self) {
        self.signal_shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn signal_shutdown(&self) {
        self.cancel.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.signal_shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub struct Worker {
    poll: Poll,
    sessions: Slab<Session>,
    db: Option<DbSession>,
    services: Rc<WorkerServices>,
    tls_config: Arc<rustls::ServerConfig>,
    inbox: Arc<ArrayQueue<TcpStream>>,
    cancel: Arc<AtomicBool>,
}

impl Worker {
    /// Builds the poll/waker pair on the caller's thread, then moves the
    /// worker onto its own.
    pub fn spawn(
        config: Arc<Config>,
        router: Arc<Router>,
        tls_config: Arc<rustls::ServerConfig>,
    ) -> std::io::Result<WorkerHandle> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let inbox = Arc::new(ArrayQueue::new(INBOX_CAPACITY));
        let cancel = Arc::new(AtomicBool::new(false));

        let thread = {
            let inbox = Arc::clone(&inbox);
            let cancel = Arc::clone(&cancel);
            std::thread::Builder::new()
                .name("hearth-worker".into())
                .spawn(move || {
                    let mut worker = Worker {
                        poll,
                        sessions: Slab::new(),
                        db: None,
                        services: WorkerServices::new(config, router),
                        tls_config,
                        inbox,
                        cancel,
                    };
                    worker.run();
                })?
        };

        Ok(WorkerHandle {
            inbox,
            waker,
            cancel,
            thread: Some(thread),
        })
    }

    fn run(&mut self) {
        self.start_db();
        let mut events = Events::with_capacity(1024);

        loop {
            let timeout = self.services.timers.borrow_mut().next_timeout(Instant::now());
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!("poll failed: {e}");
                return;
            }
            if self.cancel.load(Ordering::Acquire) {
                info!("worker shutting down");
                return;
            }

            let ready: Vec<(Token, bool, bool)> = events
                .iter()
                .map(|e| (e.token(), e.is_readable(), e.is_writable()))
                .collect();
            for (token, readable, writable) in ready {
                match token {
                    WAKE_TOKEN => self.drain_inbox(),
                    DB_TOKEN => self.db_event(readable, writable),
                    Token(index) => self.session_event(index, readable),
                }
            }

            self.fire_timers();
            self.after_turn();
        }
    }

    /// Pulls every queued socket off the inbox and builds sessions.
    fn drain_inbox(&mut self) {
        while let Some(sock) = self.inbox.pop() {
            self.accept_connection(sock);
        }
    }

    fn accept_connection(&mut self, sock: TcpStream) {
        let entry = self.sessions.vacant_entry();
        let token = entry.key();
        match Session::new(token, sock, Arc::clone(&self.tls_config), Rc::clone(&self.services)) {
            Ok(session) => {
                let session = entry.insert(session);
                if let Err(e) = self.poll.registry().register(
                    session.socket(),
                    Token(token),
                    Interest::READABLE | Interest::WRITABLE,
                ) {
                    error!("failed to register session: {e}");
                    self.sessions.remove(token);
                }
            }
            Err(e) => {
                error!("failed to create TLS session, rejecting connection: {e}");
            }
        }
    }

    fn session_event(&mut self, index: usize, readable: bool) {
        let Some(session) = self.sessions.get_mut(index) else {
            return;
        };
        match session.on_event(readable) {
            Ok(()) => self.rearm_session(index),
            Err(e) => {
                debug!("session {index} closed: {e}");
                self.remove_session(index);
            }
        }
    }

    fn rearm_session(&mut self, index: usize) {
        let Some(session) = self.sessions.get_mut(index) else {
            return;
        };
        let interests = session.interests();
        if let Err(e) = self
            .poll
            .registry()
            .reregister(session.socket(), Token(index), interests)
        {
            error!("failed to reregister session: {e}");
            self.remove_session(index);
        }
    }

    fn remove_session(&mut self, index: usize) {
        if !self.sessions.contains(index) {
            return;
        }
        let mut session = self.sessions.remove(index);
        let _ = self.poll.registry().deregister(session.socket());
        session.close();
    }

    fn start_db(&mut self) {
        let Some(conn_str) = self.services.config.db.clone() else {
            return;
        };
        match DbSession::connect(&conn_str, Rc::clone(&self.services.db)) {
            Ok(mut db) => {
                if let Err(e) = self.poll.registry().register(
                    db.socket(),
                    DB_TOKEN,
                    Interest::READABLE | Interest::WRITABLE,
                ) {
                    error!("failed to register database socket: {e}");
                    self.schedule_db_retry();
                    return;
                }
                self.db = Some(db);
            }
            Err(e) => {
                error!("database connection failed: {e}");
                self.schedule_db_retry();
            }
        }
    }

    fn schedule_db_retry(&mut self) {
        self.services
            .timers
            .borrow_mut()
            .schedule(DB_RETRY, TimerEvent::DbReconnect);
    }

    fn db_event(&mut self, readable: bool, writable: bool) {
        let Some(db) = &mut self.db else { return };
        let result = (|| {
            let mut completions = Vec::new();
            if writable {
                db.on_writable()?;
            }
            if readable {
                completions = db.on_readable()?;
            }
            Ok::<_, crate::db::DbError>(completions)
        })();

        match result {
            Ok(completions) => {
                self.deliver_completions(completions);
                self.publish_db_notifications();
                self.rearm_db();
            }
            Err(e) => {
                error!("irrecoverable error in database session: {e}");
                self.restart_db();
            }
        }
    }

    /// Fires completion sinks whose stream is still alive, then polls the
    /// stream's task. Late results for cancelled streams are dropped.
    fn deliver_completions(&mut self, completions: Vec<Completion>) {
        for completion in completions {
            match self.services.live_target(completion.stream_serial) {
                Some(target) => {
                    completion.sink.deliver(completion.result);
                    if let Some(session) = self.sessions.get_mut(target.session_token) {
                        match session.resume_task(target.stream_id) {
                            Ok(()) => self.rearm_session(target.session_token),
                            Err(e) => {
                                debug!("session closed while resuming: {e}");
                                self.remove_session(target.session_token);
                            }
                        }
                    }
                }
                None => {
                    debug!(
                        "dropping result for dead stream serial {}",
                        completion.stream_serial
                    );
                }
            }
        }
    }

    fn publish_db_notifications(&mut self) {
        let notifications = match &mut self.db {
            Some(db) => db.take_notifications(),
            None => return,
        };
        for (channel, payload) in notifications {
            self.services.publish(Event::new(channel, payload));
        }
    }

    fn rearm_db(&mut self) {
        let Some(db) = &mut self.db else { return };
        let interests = db.interests();
        if let Err(e) = self.poll.registry().reregister(db.socket(), DB_TOKEN, interests) {
            error!("failed to reregister database socket: {e}");
            self.restart_db();
        }
    }

    /// Fatal backend error: error out in-flight commands and build a
    /// fresh session after a short delay.
    fn restart_db(&mut self) {
        if let Some(mut db) = self.db.take() {
            let leftovers = db.drain_in_flight();
            let _ = self.poll.registry().deregister(db.socket());
            self.deliver_completions(leftovers);
        }
        self.schedule_db_retry();
    }

    fn fire_timers(&mut self) {
        let expired = self.services.timers.borrow_mut().expired(Instant::now());
        for event in expired {
            match event {
                TimerEvent::StreamRead { token, stream_id }
                | TimerEvent::StreamWrite { token, stream_id } => {
                    if let Some(session) = self.sessions.get_mut(token) {
                        match session.stream_timeout(stream_id) {
                            Ok(()) => self.rearm_session(token),
                            Err(_) => self.remove_session(token),
                        }
                    }
                }
                TimerEvent::Settings { token } => {
                    if let Some(session) = self.sessions.get_mut(token) {
                        let _ = session.settings_timeout();
                        self.remove_session(token);
                    }
                }
                TimerEvent::SsePing { token, stream_id } => {
                    if let Some(session) = self.sessions.get_mut(token) {
                        match session.sse_ping(stream_id) {
                            Ok(()) => self.rearm_session(token),
                            Err(_) => self.remove_session(token),
                        }
                    }
                }
                TimerEvent::DbReconnect => {
                    if self.db.is_none() {
                        self.start_db();
                    }
                }
            }
        }
    }

    /// End-of-turn maintenance: resume SSE streams parked during the turn
    /// and push freshly queued database commands.
    fn after_turn(&mut self) {
        loop {
            let woken: Vec<WakeTarget> = self.services.wake_list.borrow_mut().drain(..).collect();
            if woken.is_empty() {
                break;
            }
            for target in woken {
                if let Some(session) = self.sessions.get_mut(target.session_token) {
                    match session.resume_stream(target.stream_id) {
                        Ok(()) => self.rearm_session(target.session_token),
                        Err(_) => self.remove_session(target.session_token),
                    }
                }
            }
        }

        if self.services.db.borrow_mut().take_want_write() {
            if let Some(db) = &mut self.db {
                if let Err(e) = db.kick() {
                    error!("irrecoverable error in database session: {e}");
                    self.restart_db();
                    return;
                }
            }
            self.rearm_db();
        }
    }
}

#[cfg(test)]
mod test {
    use super::WorkerServices;
    use crate::config::Config;
    use crate::events::{Event, EventStream};
    use crate::router::Router;
    use std::sync::Arc;

    fn services() -> std::rc::Rc<WorkerServices> {
        WorkerServices::new(Arc::new(Config::for_tests()), Arc::new(Router::new()))
    }

    #[test]
    fn serials_are_unique_and_monotone() {
        let services = services();
        let a = services.next_serial();
        let b = services.next_serial();
        assert!(b > a);
    }

    #[test]
    fn liveness_follows_register_and_deregister() {
        let services = services();
        let serial = services.next_serial();
        services.register_stream(serial, 3, 11);
        assert!(services.is_stream_alive(serial));
        let target = services.live_target(serial).unwrap();
        assert_eq!(3, target.session_token);
        assert_eq!(11, target.stream_id);

        services.deregister_stream(serial);
        assert!(!services.is_stream_alive(serial));
        assert!(services.live_target(serial).is_none());
    }

    #[test]
    fn cached_date_is_shared_within_the_same_second() {
        let services = services();
        let a = services.cached_date();
        let b = services.cached_date();
        assert!(std::rc::Rc::ptr_eq(&a, &b));
        assert_eq!(29, a.len());
    }

    #[test]
    fn publish_collects_wake_targets_for_parked_streams() {
        let services = services();
        let stream = EventStream::new(1, 5);
        assert_eq!(0, stream.poll_remaining());
        services.dispatcher.borrow_mut().subscribe("chan", stream);

        services.publish(Event::new("chan", "x"));
        let wakes = services.wake_list.borrow();
        assert_eq!(1, wakes.len());
        assert_eq!(5, wakes[0].stream_id);
    }
}
