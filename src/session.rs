//! Background (async) read sessions and listener dispatch.
//!
//! A session runs two threads. The read loop owns the transport for one
//! cycle at a time, so other commands can go through between cycles. Tags
//! and errors from a cycle are queued to the dispatcher, which calls the
//! registered listeners in registration order. Listeners therefore never
//! run on the read loop and may call back into the reader.
//!
//! The auth listener is the exception: it answers an auth request while the
//! reader waits mid-cycle, so it runs on the read loop with the transport
//! held and must not call the reader.

use log::{debug, error, info, warn};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::error::{ReaderError, Result};
use crate::param::ParamKey;
use crate::reader::{Reader, Shared, lock};
use crate::transport::Transport;
use crate::types::TagReadData;

/// Handle returned when a listener is registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type ReadListener = Arc<dyn Fn(&TagReadData) + Send + Sync>;
pub type ExceptionListener = Arc<dyn Fn(&ReaderError) + Send + Sync>;

/// Returns the access password for the tag, or `None` to refuse
pub type AuthListener = Arc<dyn Fn(&TagReadData) -> Option<u32> + Send + Sync>;

/// Pause after a failed cycle when no off time is configured
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Slice used while sleeping so a stop request is seen quickly
const STOP_POLL: Duration = Duration::from_millis(10);

#[derive(Default)]
pub(crate) struct Listeners {
    next_id: u64,
    read: Vec<(ListenerId, ReadListener)>,
    exception: Vec<(ListenerId, ExceptionListener)>,
    auth: Option<AuthListener>,
}

impl Listeners {
    fn next_id(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId(self.next_id)
    }

    pub(crate) fn auth_listener(&self) -> Option<AuthListener> {
        self.auth.clone()
    }

    fn read_snapshot(&self) -> Vec<ReadListener> {
        self.read.iter().map(|(_, l)| Arc::clone(l)).collect()
    }

    fn exception_snapshot(&self) -> Vec<ExceptionListener> {
        self.exception.iter().map(|(_, l)| Arc::clone(l)).collect()
    }
}

pub(crate) enum Event {
    Tag(TagReadData),
    Exception(ReaderError),
}

pub(crate) struct AsyncSession {
    stop: Arc<AtomicBool>,
    loop_done: Receiver<()>,
    loop_thread: JoinHandle<()>,
    dispatcher: Dispatcher,
}

/// The listener thread of a session, kept until it has been joined
pub(crate) struct Dispatcher {
    done: Receiver<()>,
    thread: JoinHandle<()>,
}

impl Dispatcher {
    fn id(&self) -> ThreadId {
        self.thread.thread().id()
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.id()
    }

    fn has_finished(&self) -> bool {
        !matches!(self.done.try_recv(), Err(TryRecvError::Empty))
    }

    fn join(self) {
        if self.thread.join().is_err() {
            error!("Dispatcher panicked");
        }
    }
}

/// What a stop still has to wait for
enum Pending {
    Session(AsyncSession),
    Listeners(Dispatcher),
}

pub(crate) enum SessionState {
    Idle,
    Sync,
    Async(AsyncSession),
    Stopping,
    /// The read loop has ended but listeners are still being called
    Draining(Dispatcher),
}

impl SessionState {
    /// Join a draining dispatcher that has run out of events
    pub(crate) fn settle(&mut self) {
        if matches!(self, Self::Draining(d) if d.has_finished()) {
            if let Self::Draining(dispatcher) = std::mem::replace(self, Self::Idle) {
                dispatcher.join();
                info!("Async read stopped");
            }
        }
    }
}

impl<T: Transport + Send + 'static> Reader<T> {
    /// Register a listener for tag reads. Listeners are called in
    /// registration order, once per tag.
    pub fn add_read_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&TagReadData) + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.shared.listeners);
        let id = listeners.next_id();
        listeners.read.push((id, Arc::new(listener)));
        id
    }

    /// Register a listener for errors raised by the read loop
    pub fn add_exception_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ReaderError) + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.shared.listeners);
        let id = listeners.next_id();
        listeners.exception.push((id, Arc::new(listener)));
        id
    }

    /// Set the listener that answers auth requests. It runs on the read
    /// thread while the reader waits, so it must return quickly and must not
    /// call back into this reader.
    pub fn set_auth_listener<F>(&self, listener: F)
    where
        F: Fn(&TagReadData) -> Option<u32> + Send + Sync + 'static,
    {
        lock(&self.shared.listeners).auth = Some(Arc::new(listener));
    }

    pub fn clear_auth_listener(&self) {
        lock(&self.shared.listeners).auth = None;
    }

    /// Remove a read or exception listener. Returns false for an unknown id.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.shared.listeners);
        let before = listeners.read.len() + listeners.exception.len();
        listeners.read.retain(|(l, _)| *l != id);
        listeners.exception.retain(|(l, _)| *l != id);
        before != listeners.read.len() + listeners.exception.len()
    }

    /// True from `start_reading` until the session has fully stopped,
    /// including while queued events are still being delivered.
    pub fn is_reading(&self) -> bool {
        let mut state = lock(&self.shared.session);
        state.settle();
        matches!(
            *state,
            SessionState::Async(_) | SessionState::Stopping | SessionState::Draining(_)
        )
    }

    /// Start reading in the background on the committed plan.
    ///
    /// Each cycle lasts `/reader/read/asyncOnTime` and is followed by a
    /// pause of `/reader/read/asyncOffTime`.
    pub fn start_reading(&self) -> Result<()> {
        let mut state = lock(&self.shared.session);
        state.settle();
        if !matches!(*state, SessionState::Idle) {
            return Err(ReaderError::SessionActive);
        }

        let on_time: u32 = self.get(ParamKey::AsyncOnTime)?;
        let off_time: u32 = self.get(ParamKey::AsyncOffTime)?;
        let on_time = on_time.clamp(1, u16::MAX as u32) as u16;
        let off_time = Duration::from_millis(off_time as u64);

        {
            let mut buffer = lock(&self.shared.buffer);
            if !buffer.is_empty() {
                warn!("Discarding {} undrained tags from the previous read", buffer.len());
                buffer.clear();
            }
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (events_tx, events_rx) = mpsc::sync_channel(self.shared.config.event_capacity);
        let (spill_tx, spill_rx) = mpsc::channel();
        let (loop_done_tx, loop_done) = mpsc::channel();
        let (dispatch_done_tx, dispatch_done) = mpsc::channel();

        let dispatch_thread = {
            let shared = Arc::clone(&self.shared);
            thread::Builder::new()
                .name("uhf-dispatch".into())
                .spawn(move || dispatch(&shared, events_rx, spill_rx, dispatch_done_tx))
                .map_err(|e| ReaderError::Transport(format!("Failed to spawn dispatcher: {}", e)))?
        };

        let loop_thread = {
            let shared = Arc::clone(&self.shared);
            let stop = Arc::clone(&stop);
            let queue = EventQueue {
                events: events_tx,
                spill: spill_tx,
                spilling: false,
            };
            thread::Builder::new()
                .name("uhf-read-loop".into())
                .spawn(move || read_loop(&shared, &stop, on_time, off_time, queue, loop_done_tx))
                .map_err(|e| ReaderError::Transport(format!("Failed to spawn read loop: {}", e)))?
        };

        info!("Async read started ({} ms on, {} ms off)", on_time, off_time.as_millis());
        *state = SessionState::Async(AsyncSession {
            stop,
            loop_done,
            loop_thread,
            dispatcher: Dispatcher {
                done: dispatch_done,
                thread: dispatch_thread,
            },
        });
        Ok(())
    }

    /// Stop the background session and wait for queued events to be
    /// delivered.
    ///
    /// Waits at most `stop_grace` in total. If the read loop or the listeners
    /// are still busy then, `Timeout` is returned and the session stays
    /// active: `is_reading` holds and `stop_reading` can be called again.
    /// When called from a read or exception listener the dispatcher is not
    /// waited for; the remaining queued events are delivered after the
    /// listener returns. Every tag seen before the stop is delivered.
    pub fn stop_reading(&self) -> Result<()> {
        let grace = self.shared.config.stop_grace;
        let started = Instant::now();

        let pending = {
            let mut state = lock(&self.shared.session);
            match std::mem::replace(&mut *state, SessionState::Stopping) {
                SessionState::Async(session) => Pending::Session(session),
                SessionState::Draining(dispatcher) => Pending::Listeners(dispatcher),
                other => {
                    *state = other;
                    return Err(ReaderError::NotReading);
                }
            }
        };

        let dispatcher = match pending {
            Pending::Session(session) => {
                session.stop.store(true, Ordering::SeqCst);
                match session.loop_done.recv_timeout(grace) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
                    Err(RecvTimeoutError::Timeout) => {
                        warn!("Read loop still running after {:?}", grace);
                        *lock(&self.shared.session) = SessionState::Async(session);
                        return Err(ReaderError::Timeout(grace.as_millis() as u64));
                    }
                }
                if session.loop_thread.join().is_err() {
                    error!("Read loop panicked");
                }
                session.dispatcher
            }
            Pending::Listeners(dispatcher) => dispatcher,
        };

        if dispatcher.is_current() {
            debug!("Stop requested from a listener; dispatcher drains on its own");
            *lock(&self.shared.session) = SessionState::Draining(dispatcher);
            return Ok(());
        }
        let remaining = grace.saturating_sub(started.elapsed());
        match dispatcher.done.recv_timeout(remaining) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                dispatcher.join();
                *lock(&self.shared.session) = SessionState::Idle;
                info!("Async read stopped");
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("Listeners still running after {:?}", grace);
                *lock(&self.shared.session) = SessionState::Draining(dispatcher);
                Err(ReaderError::Timeout(grace.as_millis() as u64))
            }
        }
    }
}

fn read_loop<T: Transport>(
    shared: &Shared<T>,
    stop: &AtomicBool,
    on_time: u16,
    off_time: Duration,
    mut queue: EventQueue,
    done: Sender<()>,
) {
    let timeout_ms = shared.config.command_timeout_ms();

    while !stop.load(Ordering::SeqCst) {
        let auth = lock(&shared.listeners).auth_listener();
        let mut batch = Vec::new();
        let result = {
            let mut link = lock(&shared.link);
            let mut errors = Vec::new();
            let result = link.read_cycle(
                on_time,
                timeout_ms,
                auth.as_deref(),
                &mut |tag| batch.push(Event::Tag(tag)),
                &mut |e| errors.push(Event::Exception(e)),
            );
            batch.extend(errors);
            result
        };

        let pause = match result {
            Ok(count) => {
                debug!("Async cycle finished, reader counted {} tags", count);
                off_time
            }
            Err(e) => {
                warn!("Async cycle failed: {}", e);
                batch.push(Event::Exception(e));
                off_time.max(ERROR_BACKOFF)
            }
        };

        for event in batch {
            queue.post(event, stop);
        }
        sleep_unless_stopped(pause, stop);
    }

    if queue.spilling {
        debug!("Events after stop went to the spill queue");
    }
    drop(queue);
    let _ = done.send(());
}

/// Events from the read loop to the dispatcher.
///
/// The bounded queue applies back-pressure while reading. Once a stop is
/// requested the loop must not block on a busy dispatcher, so the rest of
/// the session goes to an unbounded spill queue that the dispatcher drains
/// last.
struct EventQueue {
    events: SyncSender<Event>,
    spill: Sender<Event>,
    spilling: bool,
}

impl EventQueue {
    fn post(&mut self, mut event: Event, stop: &AtomicBool) {
        if self.spilling {
            let _ = self.spill.send(event);
            return;
        }
        loop {
            match self.events.try_send(event) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => return,
                Err(TrySendError::Full(back)) => {
                    if stop.load(Ordering::SeqCst) {
                        self.spilling = true;
                        let _ = self.spill.send(back);
                        return;
                    }
                    event = back;
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }
}

fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) {
    let until = Instant::now() + duration;
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        if now >= until {
            return;
        }
        thread::sleep((until - now).min(STOP_POLL));
    }
}

fn dispatch<T: Transport>(shared: &Shared<T>, events: Receiver<Event>, spill: Receiver<Event>, done: Sender<()>) {
    for event in events.into_iter().chain(spill) {
        match event {
            Event::Tag(tag) => {
                let listeners = lock(&shared.listeners).read_snapshot();
                for listener in listeners {
                    if catch_unwind(AssertUnwindSafe(|| listener(&tag))).is_err() {
                        error!("Read listener panicked on tag {}", tag.epc_hex());
                    }
                }
            }
            Event::Exception(e) => {
                let listeners = lock(&shared.listeners).exception_snapshot();
                if listeners.is_empty() {
                    warn!("Unhandled read error: {}", e);
                }
                for listener in listeners {
                    if catch_unwind(AssertUnwindSafe(|| listener(&e))).is_err() {
                        error!("Exception listener panicked");
                    }
                }
            }
        }
    }
    let _ = done.send(());
}
