//! Single-threaded cooperative scheduler: cyclic timers, delayed one-shot
//! callbacks and fd polling in one `run` loop. Event sources (connection
//! managers) register their sockets here and get called back with ready
//! events. Cross-thread interaction is limited to `DelayedSender` and the
//! waker.

use crate::delayed::{DelayedId, DelayedQueue, DelayedSender};
pub use crate::timer::TimerPolicy;
use crate::timer::{Timer, TimerId};
use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::any::Any;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use uabase::logging::{self, Logger};
use uabase::status::StatusCode;
use uabase::time::{self, DateTime};

/// Index of a registered event source.
pub type SourceId = usize;

/// Cyclic timer callback. Receives the loop and its own timer id, so
/// one-shot behavior is a callback that removes itself.
pub type TimerCallback = Box<dyn FnMut(&mut EventLoop, TimerId)>;

/// One-shot callback executed on the loop thread at the next iteration.
pub type DelayedCallback = Box<dyn FnOnce(&mut EventLoop) + Send>;

/// The waker occupies the top of the token space; slab-assigned fd tokens
/// count up from zero and cannot collide.
const WAKE_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 256;

/// Event mask handed to `EventSource::process_event`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FdEvents(u8);

impl FdEvents {
    pub const IN: FdEvents = FdEvents(1);
    pub const OUT: FdEvents = FdEvents(2);
    pub const ERR: FdEvents = FdEvents(4);

    pub fn contains(self, other: FdEvents) -> bool {
        self.0 & other.0 == other.0
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EventLoopState {
    Fresh,
    Started,
    Stopping,
    Stopped,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EventSourceState {
    Fresh,
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// A pluggable module driven by the event loop. Connection managers are
/// event sources. During any callback the source is temporarily removed
/// from the loop's registry, so it receives `&mut EventLoop` without
/// aliasing itself.
pub trait EventSource: Any {
    fn name(&self) -> &str;

    fn state(&self) -> EventSourceState;

    /// Called once at registration with the assigned id. The source moves
    /// from `Fresh` to `Stopped`.
    fn attach(&mut self, id: SourceId, el: &mut EventLoop) -> Result<(), StatusCode>;

    fn start(&mut self, el: &mut EventLoop) -> Result<(), StatusCode>;

    /// Begins an asynchronous shutdown; the source reaches `Stopped` on its
    /// own once all its resources are released.
    fn stop(&mut self, el: &mut EventLoop);

    fn process_event(&mut self, el: &mut EventLoop, token: Token, events: FdEvents);

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl std::fmt::Debug for dyn EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSource").field("name", &self.name()).finish()
    }
}

struct RegisteredFd {
    source: SourceId,
}

/// Cross-thread handle that aborts the current io wait.
#[derive(Clone)]
pub struct Canceller {
    waker: Arc<Waker>,
}

impl Canceller {
    pub fn cancel(&self) {
        let _ = self.waker.wake();
    }
}

pub struct EventLoop {
    state: EventLoopState,
    executing: bool,
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    fds: Slab<RegisteredFd>,
    timer: Timer<TimerCallback>,
    delayed: DelayedQueue<DelayedCallback>,
    sources: Vec<Option<Box<dyn EventSource>>>,
    log: Logger,
}

impl EventLoop {
    pub fn new(log: Logger) -> Result<EventLoop, StatusCode> {
        let poll = Poll::new().map_err(|_| StatusCode::BAD_INTERNAL_ERROR)?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)
            .map_err(|_| StatusCode::BAD_INTERNAL_ERROR)?;
        Ok(EventLoop {
            state: EventLoopState::Fresh,
            executing: false,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            waker: Arc::new(waker),
            fds: Slab::new(),
            timer: Timer::new(),
            delayed: DelayedQueue::new(),
            sources: Vec::new(),
            log,
        })
    }

    pub fn state(&self) -> EventLoopState {
        self.state
    }

    pub fn now(&self) -> DateTime {
        time::now()
    }

    pub fn now_monotonic(&self) -> DateTime {
        time::now_monotonic()
    }

    /// Starts the loop and all registered event sources.
    pub fn start(&mut self) -> Result<(), StatusCode> {
        if self.state != EventLoopState::Fresh && self.state != EventLoopState::Stopped {
            return Err(StatusCode::BAD_INTERNAL_ERROR);
        }

        logging::debug!(self.log, "starting the event loop");

        let mut result = Ok(());
        for id in 0..self.sources.len() {
            let start_result = self.with_source(id, |source, el| source.start(el));
            if let Some(Err(code)) = start_result {
                result = Err(code);
            }
        }

        self.state = EventLoopState::Started;
        result
    }

    /// Transitions to `Stopping` and shuts the event sources down
    /// asynchronously. Repeated calls while stopping are no-ops.
    pub fn stop(&mut self) {
        if self.state != EventLoopState::Started {
            if self.state != EventLoopState::Stopping {
                logging::warn!(self.log, "the event loop is not running, cannot be stopped");
            }
            return;
        }

        logging::debug!(self.log, "stopping the event loop");
        self.state = EventLoopState::Stopping;

        for id in 0..self.sources.len() {
            self.with_source(id, |source, el| {
                if source.state() == EventSourceState::Starting
                    || source.state() == EventSourceState::Started
                {
                    source.stop(el);
                }
            });
        }

        self.check_stopped();
    }

    fn check_stopped(&mut self) {
        let all_stopped = self
            .sources
            .iter()
            .flatten()
            .all(|source| source.state() == EventSourceState::Stopped);

        // not stopped until all delayed callbacks are processed
        if all_stopped && self.delayed.is_empty() {
            self.state = EventLoopState::Stopped;
            logging::debug!(self.log, "the event loop has stopped");
        }
    }

    /// One iteration: due timers, the delayed queue, then an io wait of at
    /// most `timeout_ms` (clamped to the next timer deadline).
    pub fn run(&mut self, timeout_ms: u32) -> Result<(), StatusCode> {
        if self.executing {
            logging::error!(self.log, "cannot run the event loop from the run method itself");
            return Err(StatusCode::BAD_INTERNAL_ERROR);
        }
        if self.state != EventLoopState::Started && self.state != EventLoopState::Stopping {
            logging::warn!(self.log, "cannot run a stopped event loop");
            return Err(StatusCode::BAD_INTERNAL_ERROR);
        }

        self.executing = true;
        let result = self.iterate(timeout_ms);
        self.executing = false;
        result
    }

    fn iterate(&mut self, timeout_ms: u32) -> Result<(), StatusCode> {
        logging::trace!(self.log, "iterate the event loop");

        // process cyclic callbacks
        let now = time::now_monotonic();
        for (id, mut entry) in self.timer.take_due(now) {
            (entry.callback)(self, id);
            self.timer.reschedule(id, entry, time::now_monotonic());
        }

        // process delayed callbacks before polling so closed sockets are
        // removed instead of being polled again
        for callback in self.delayed.drain() {
            callback(self);
        }

        // a delayed callback may have enqueued more delayed work; process
        // queued events but do not sleep
        let mut timeout = timeout_ms as DateTime * time::TICKS_PER_MSEC;
        if !self.delayed.is_empty() {
            timeout = 0;
        }

        // the io wait budget ends at the next timer deadline
        let now = time::now_monotonic();
        let next_timer = self.timer.next_deadline();
        if next_timer != DateTime::MAX {
            timeout = timeout.min(next_timer - now);
        }
        if timeout < 0 {
            timeout = 0;
        }

        let poll_timeout = Duration::from_nanos(timeout as u64 * 100);
        if let Err(err) = self.poll.poll(&mut self.events, Some(poll_timeout)) {
            if err.kind() != io::ErrorKind::Interrupted {
                logging::warn!(self.log, "error during poll"; "error" => %err);
                return Err(StatusCode::BAD_INTERNAL_ERROR);
            }
            self.events.clear();
        }

        let mut ready = Vec::new();
        for event in self.events.iter() {
            // the waker needs no draining, mio re-arms it internally
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let mut mask = FdEvents(0);
            if event.is_readable() || event.is_read_closed() {
                mask = FdEvents::IN;
            } else if event.is_writable() {
                mask = FdEvents::OUT;
            } else if event.is_error() || event.is_write_closed() {
                mask = FdEvents::ERR;
            }
            if mask != FdEvents(0) {
                ready.push((event.token(), mask));
            }
        }

        for (token, mask) in ready {
            // the fd may have deregistered while handling an earlier event
            let source_id = match self.fds.get(token.0) {
                Some(rfd) => rfd.source,
                None => continue,
            };
            logging::trace!(self.log, "processing fd event";
                            "token" => token.0, "source" => source_id);
            self.with_source(source_id, |source, el| source.process_event(el, token, mask));
        }

        if self.state == EventLoopState::Stopping {
            self.check_stopped();
        }
        Ok(())
    }

    /// Registers an event source and starts it right away if the loop is
    /// already running. Returns the source id.
    pub fn register_event_source(
        &mut self,
        source: Box<dyn EventSource>,
    ) -> Result<SourceId, StatusCode> {
        if source.state() != EventSourceState::Fresh {
            logging::error!(self.log, "cannot register an event source twice";
                            "source" => source.name());
            return Err(StatusCode::BAD_INTERNAL_ERROR);
        }

        let id = self.sources.len();
        self.sources.push(Some(source));

        let attach_result = self.with_source(id, |source, el| source.attach(id, el));
        if let Some(Err(code)) = attach_result {
            self.sources[id] = None;
            return Err(code);
        }

        if self.state == EventLoopState::Started {
            if let Some(Err(code)) = self.with_source(id, |source, el| source.start(el)) {
                return Err(code);
            }
        }
        Ok(id)
    }

    /// Removes a stopped event source from the loop and hands it back.
    pub fn deregister_event_source(
        &mut self,
        id: SourceId,
    ) -> Result<Box<dyn EventSource>, StatusCode> {
        let stopped = match self.sources.get(id).and_then(|slot| slot.as_ref()) {
            Some(source) => {
                source.state() == EventSourceState::Stopped
                    || source.state() == EventSourceState::Fresh
            }
            None => return Err(StatusCode::BAD_NOT_FOUND),
        };
        if !stopped {
            logging::warn!(self.log, "event source has to be stopped before deregistering";
                           "id" => id);
            return Err(StatusCode::BAD_INTERNAL_ERROR);
        }
        self.sources
            .get_mut(id)
            .and_then(|slot| slot.take())
            .ok_or(StatusCode::BAD_NOT_FOUND)
    }

    /// Runs a closure against a source with the source temporarily checked
    /// out of the registry. Returns `None` if the id is empty (possible for
    /// reentrant access from the source's own callback).
    pub fn with_source<R>(
        &mut self,
        id: SourceId,
        f: impl FnOnce(&mut dyn EventSource, &mut EventLoop) -> R,
    ) -> Option<R> {
        let mut source = self.sources.get_mut(id)?.take()?;
        let result = f(&mut *source, self);
        if let Some(slot) = self.sources.get_mut(id) {
            *slot = Some(source);
        }
        Some(result)
    }

    /// Registers a socket for polling on behalf of a source. The returned
    /// token identifies the fd in `process_event`.
    pub fn register_fd(
        &mut self,
        source_id: SourceId,
        fd: &mut dyn Source,
        interests: Interest,
    ) -> Result<Token, StatusCode> {
        let entry = self.fds.insert(RegisteredFd { source: source_id });
        let token = Token(entry);
        match self.poll.registry().register(fd, token, interests) {
            Ok(()) => {
                logging::debug!(self.log, "registered fd"; "token" => entry);
                Ok(token)
            }
            Err(err) => {
                logging::warn!(self.log, "could not register fd"; "error" => %err);
                self.fds.remove(entry);
                Err(StatusCode::BAD_INTERNAL_ERROR)
            }
        }
    }

    /// Changes the events an fd listens on.
    pub fn modify_fd(
        &mut self,
        fd: &mut dyn Source,
        token: Token,
        interests: Interest,
    ) -> Result<(), StatusCode> {
        self.poll
            .registry()
            .reregister(fd, token, interests)
            .map_err(|_| StatusCode::BAD_INTERNAL_ERROR)
    }

    /// Deregisters an fd; no further events are delivered. The socket is
    /// not closed.
    pub fn deregister_fd(&mut self, fd: &mut dyn Source, token: Token) {
        logging::debug!(self.log, "deregistering fd"; "token" => token.0);
        if self.fds.contains(token.0) {
            self.fds.remove(token.0);
        }
        let _ = self.poll.registry().deregister(fd);
    }

    pub fn add_timer(
        &mut self,
        callback: TimerCallback,
        interval: DateTime,
        base_time: Option<DateTime>,
        policy: TimerPolicy,
    ) -> Result<TimerId, StatusCode> {
        self.timer
            .add(callback, interval, base_time, policy, time::now_monotonic())
    }

    pub fn modify_timer(
        &mut self,
        id: TimerId,
        interval: DateTime,
        policy: TimerPolicy,
    ) -> Result<(), StatusCode> {
        self.timer
            .modify(id, interval, policy, time::now_monotonic())
    }

    pub fn remove_timer(&mut self, id: TimerId) {
        self.timer.remove(id);
    }

    /// The next timer deadline, `DateTime::MAX` if none.
    pub fn next_timer(&self) -> DateTime {
        self.timer.next_deadline()
    }

    pub fn add_delayed_callback(&self, callback: DelayedCallback) -> DelayedId {
        self.delayed.add(callback)
    }

    pub fn remove_delayed_callback(&mut self, id: DelayedId) {
        self.delayed.remove(id);
    }

    /// Cross-thread enqueue handle for delayed callbacks.
    pub fn delayed_sender(&self) -> DelayedSender<DelayedCallback> {
        self.delayed.sender()
    }

    /// Aborts the current io wait without changing state. Safe from any
    /// thread through `canceller()`.
    pub fn cancel(&self) {
        let _ = self.waker.wake();
    }

    pub fn canceller(&self) -> Canceller {
        Canceller {
            waker: Arc::clone(&self.waker),
        }
    }

    pub fn logger(&self) -> &Logger {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;
    use std::time::Instant;
    use uabase::logging::null_logger;

    struct IdleSource {
        state: EventSourceState,
    }

    impl EventSource for IdleSource {
        fn name(&self) -> &str {
            "idle"
        }

        fn state(&self) -> EventSourceState {
            self.state
        }

        fn attach(&mut self, _id: SourceId, _el: &mut EventLoop) -> Result<(), StatusCode> {
            self.state = EventSourceState::Stopped;
            Ok(())
        }

        fn start(&mut self, _el: &mut EventLoop) -> Result<(), StatusCode> {
            self.state = EventSourceState::Started;
            Ok(())
        }

        fn stop(&mut self, _el: &mut EventLoop) {
            self.state = EventSourceState::Stopped;
        }

        fn process_event(&mut self, _el: &mut EventLoop, _token: Token, _events: FdEvents) {}

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn test_run_fails_when_fresh() {
        let mut el = EventLoop::new(null_logger()).unwrap();
        assert_eq!(el.run(0).unwrap_err(), StatusCode::BAD_INTERNAL_ERROR);
    }

    #[test]
    fn test_lifecycle() {
        let mut el = EventLoop::new(null_logger()).unwrap();
        assert_eq!(el.state(), EventLoopState::Fresh);
        el.start().unwrap();
        assert_eq!(el.state(), EventLoopState::Started);
        // double start fails
        assert_eq!(el.start().unwrap_err(), StatusCode::BAD_INTERNAL_ERROR);
        el.run(0).unwrap();
        el.stop();
        assert_eq!(el.state(), EventLoopState::Stopped);
        // stop after stopped only logs
        el.stop();
        // a stopped loop can be restarted
        el.start().unwrap();
        assert_eq!(el.state(), EventLoopState::Started);
    }

    #[test]
    fn test_event_source_lifecycle() {
        let mut el = EventLoop::new(null_logger()).unwrap();
        let id = el
            .register_event_source(Box::new(IdleSource {
                state: EventSourceState::Fresh,
            }))
            .unwrap();

        el.start().unwrap();
        el.with_source(id, |source, _| {
            assert_eq!(source.state(), EventSourceState::Started);
        })
        .unwrap();

        // cannot deregister while running
        assert_eq!(
            el.deregister_event_source(id).unwrap_err(),
            StatusCode::BAD_INTERNAL_ERROR
        );

        el.stop();
        assert_eq!(el.state(), EventLoopState::Stopped);
    }

    #[test]
    fn test_timer_fires_through_run() {
        let mut el = EventLoop::new(null_logger()).unwrap();
        el.start().unwrap();

        let fired = Arc::new(AtomicU32::new(0));
        let fired_in_cb = Arc::clone(&fired);
        el.add_timer(
            Box::new(move |_el, _id| {
                fired_in_cb.fetch_add(1, Ordering::SeqCst);
            }),
            time::from_ms(5),
            None,
            TimerPolicy::CurrentTime,
        )
        .unwrap();

        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        while fired.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            el.run(20).unwrap();
        }
        assert!(fired.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_one_shot_timer_removes_itself() {
        let mut el = EventLoop::new(null_logger()).unwrap();
        el.start().unwrap();

        let fired = Arc::new(AtomicU32::new(0));
        let fired_in_cb = Arc::clone(&fired);
        el.add_timer(
            Box::new(move |el, id| {
                fired_in_cb.fetch_add(1, Ordering::SeqCst);
                el.remove_timer(id);
            }),
            time::from_ms(2),
            None,
            TimerPolicy::CurrentTime,
        )
        .unwrap();

        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        while el.next_timer() != DateTime::MAX && Instant::now() < deadline {
            el.run(10).unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(el.next_timer(), DateTime::MAX);
    }

    #[test]
    fn test_delayed_callback_runs_once() {
        let mut el = EventLoop::new(null_logger()).unwrap();
        el.start().unwrap();

        let counter = Arc::new(AtomicU32::new(0));
        let counter_in_cb = Arc::clone(&counter);
        el.add_delayed_callback(Box::new(move |_el| {
            counter_in_cb.fetch_add(1, Ordering::SeqCst);
        }));

        el.run(0).unwrap();
        el.run(0).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delayed_callback_chaining_keeps_loop_responsive() {
        let mut el = EventLoop::new(null_logger()).unwrap();
        el.start().unwrap();

        let counter = Arc::new(AtomicU32::new(0));
        let counter_outer = Arc::clone(&counter);
        el.add_delayed_callback(Box::new(move |el| {
            let counter_inner = Arc::clone(&counter_outer);
            el.add_delayed_callback(Box::new(move |_el| {
                counter_inner.fetch_add(1, Ordering::SeqCst);
            }));
        }));

        // the chained callback runs on the following iteration
        el.run(0).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        el.run(0).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_aborts_io_wait() {
        let mut el = EventLoop::new(null_logger()).unwrap();
        el.start().unwrap();

        let canceller = el.canceller();
        let handle = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(50));
            canceller.cancel();
        });

        let before = Instant::now();
        el.run(10_000).unwrap();
        assert!(before.elapsed() < std::time::Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_remove_delayed_callback() {
        let mut el = EventLoop::new(null_logger()).unwrap();
        el.start().unwrap();

        let counter = Arc::new(AtomicU32::new(0));
        let counter_in_cb = Arc::clone(&counter);
        let id = el.add_delayed_callback(Box::new(move |_el| {
            counter_in_cb.fetch_add(1, Ordering::SeqCst);
        }));
        el.remove_delayed_callback(id);

        el.run(0).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
