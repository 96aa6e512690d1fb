//! Readiness reactor and cooperative driver.
//!
//! This is the host-runtime surface the TLS layer consumes: a [`Reactor`]
//! wrapping a mio `Poll` that maps readiness edges to task wakers, an
//! [`IoController`] giving each socket a registration handle, a timer wheel
//! for [`timeout`], and a [`Driver`] combining the reactor with a
//! single-threaded `LocalPool` executor.
//!
//! mio delivers edge-style notifications: an edge fires once per level
//! transition, so consumers must perform I/O until `WouldBlock` on every
//! wake. The awaitables in [`crate::awaitable`] obey that rule; the reactor
//! itself only routes wakes.

use crate::error::{Error, ErrorKind};
use futures::executor::{LocalPool, LocalSpawner};
use futures::task::ArcWake;
use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll as TaskPoll, Waker};
use std::time::{Duration, Instant};
use tracing::trace;

const EVENT_CAPACITY: usize = 256;

#[derive(Default)]
struct IoWakers {
    recv: Option<Waker>,
    send: Option<Waker>,
}

struct TimerEntry {
    deadline: Reverse<Instant>,
    seq: usize,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

struct Inner {
    poll: Poll,
    events: Events,
    wakers: HashMap<usize, IoWakers>,
    timers: BinaryHeap<TimerEntry>,
    timer_wakers: HashMap<usize, Waker>,
    next_token: usize,
    next_timer: usize,
}

/// Single-threaded readiness reactor. Cheap to clone; all clones share one
/// mio `Poll`.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<RefCell<Inner>>,
}

impl Reactor {
    /// Creates a reactor with its own poll instance.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            inner: Rc::new(RefCell::new(Inner {
                poll: Poll::new()?,
                events: Events::with_capacity(EVENT_CAPACITY),
                wakers: HashMap::new(),
                timers: BinaryHeap::new(),
                timer_wakers: HashMap::new(),
                next_token: 0,
                next_timer: 0,
            })),
        })
    }

    /// Registers a socket for readable and writable edges and returns its
    /// controller.
    pub fn attach(&self, source: &mut dyn Source) -> io::Result<IoController> {
        let mut inner = self.inner.borrow_mut();
        let token = inner.next_token;
        inner.next_token += 1;
        inner
            .poll
            .registry()
            .register(source, Token(token), Interest::READABLE | Interest::WRITABLE)?;
        inner.wakers.insert(token, IoWakers::default());
        trace!(token, "attached socket");
        Ok(IoController {
            reactor: self.clone(),
            token,
        })
    }

    fn detach(&self, token: usize, source: &mut dyn Source) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.wakers.remove(&token);
        inner.poll.registry().deregister(source)?;
        trace!(token, "detached socket");
        Ok(())
    }

    fn set_waker(&self, token: usize, write: bool, waker: &Waker) {
        let mut inner = self.inner.borrow_mut();
        if let Some(entry) = inner.wakers.get_mut(&token) {
            let slot = if write { &mut entry.send } else { &mut entry.recv };
            match slot {
                Some(existing) if existing.will_wake(waker) => {}
                _ => *slot = Some(waker.clone()),
            }
        }
    }

    fn clear_wakers(&self, token: usize) {
        let mut inner = self.inner.borrow_mut();
        if let Some(entry) = inner.wakers.get_mut(&token) {
            entry.recv = None;
            entry.send = None;
        }
    }

    fn add_timer(&self, deadline: Instant, waker: &Waker) -> usize {
        let mut inner = self.inner.borrow_mut();
        let seq = inner.next_timer;
        inner.next_timer += 1;
        inner.timers.push(TimerEntry {
            deadline: Reverse(deadline),
            seq,
        });
        inner.timer_wakers.insert(seq, waker.clone());
        seq
    }

    fn update_timer_waker(&self, seq: usize, waker: &Waker) {
        let mut inner = self.inner.borrow_mut();
        if let Some(slot) = inner.timer_wakers.get_mut(&seq) {
            if !slot.will_wake(waker) {
                *slot = waker.clone();
            }
        }
    }

    /// Waits for readiness or timer expiry and dispatches the affected
    /// wakers. Returns the number of wakers dispatched.
    pub fn turn(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut dispatched = 0;
        let mut to_wake: Vec<Waker> = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            let now = Instant::now();
            let until_timer = inner
                .timers
                .peek()
                .map(|t| t.deadline.0.saturating_duration_since(now));
            let effective = match (timeout, until_timer) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (None, b) => b,
                (a, None) => a,
            };

            let inner = &mut *inner;
            match inner.poll.poll(&mut inner.events, effective) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }

            for event in inner.events.iter() {
                let Token(token) = event.token();
                let Some(entry) = inner.wakers.get_mut(&token) else {
                    continue;
                };
                if event.is_readable() || event.is_read_closed() {
                    if let Some(waker) = entry.recv.take() {
                        to_wake.push(waker);
                    }
                }
                if event.is_writable() || event.is_write_closed() {
                    if let Some(waker) = entry.send.take() {
                        to_wake.push(waker);
                    }
                }
            }

            let now = Instant::now();
            while let Some(timer) = inner.timers.peek() {
                if timer.deadline.0 > now {
                    break;
                }
                let seq = timer.seq;
                inner.timers.pop();
                if let Some(waker) = inner.timer_wakers.remove(&seq) {
                    to_wake.push(waker);
                }
            }
        }
        for waker in to_wake {
            dispatched += 1;
            waker.wake();
        }
        trace!(dispatched, "reactor turn");
        Ok(dispatched)
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor").finish_non_exhaustive()
    }
}

/// Per-socket registration handle.
///
/// Awaitables park their task here: the recv slot is woken on readable
/// edges, the send slot on writable edges. At most one waker per direction
/// is held at a time.
pub struct IoController {
    reactor: Reactor,
    token: usize,
}

impl IoController {
    /// Parks the current task until the socket reports readable.
    pub fn register_recv_waker(&self, waker: &Waker) {
        self.reactor.set_waker(self.token, false, waker);
    }

    /// Parks the current task until the socket reports writable.
    pub fn register_send_waker(&self, waker: &Waker) {
        self.reactor.set_waker(self.token, true, waker);
    }

    /// Drops both parked wakers without waking them.
    pub fn clear_wakers(&self) {
        self.reactor.clear_wakers(self.token);
    }

    /// Removes the socket from the reactor.
    pub fn deregister(&self, source: &mut dyn Source) -> io::Result<()> {
        self.reactor.detach(self.token, source)
    }

    /// The reactor this controller registers with.
    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }
}

impl std::fmt::Debug for IoController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoController")
            .field("token", &self.token)
            .finish()
    }
}

// ============================================================================
// Timers
// ============================================================================

/// Future that resolves once the deadline passes.
pub struct Sleep {
    reactor: Reactor,
    deadline: Instant,
    timer: Option<usize>,
}

impl Sleep {
    /// Sleeps until `deadline`.
    pub fn until(reactor: &Reactor, deadline: Instant) -> Self {
        Self {
            reactor: reactor.clone(),
            deadline,
            timer: None,
        }
    }

    /// Sleeps for `duration` from now.
    pub fn after(reactor: &Reactor, duration: Duration) -> Self {
        Self::until(reactor, Instant::now() + duration)
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> TaskPoll<()> {
        if Instant::now() >= self.deadline {
            return TaskPoll::Ready(());
        }
        match self.timer {
            Some(seq) => self.reactor.update_timer_waker(seq, cx.waker()),
            None => {
                let seq = self.reactor.add_timer(self.deadline, cx.waker());
                self.timer = Some(seq);
            }
        }
        TaskPoll::Pending
    }
}

/// Future wrapper that fails with [`ErrorKind::Timeout`] when the inner
/// future does not resolve within the given duration.
pub struct Timeout<F> {
    future: F,
    sleep: Sleep,
}

impl<F> Timeout<F> {
    fn new(reactor: &Reactor, duration: Duration, future: F) -> Self {
        Self {
            future,
            sleep: Sleep::after(reactor, duration),
        }
    }
}

impl<F, T> Future for Timeout<F>
where
    F: Future<Output = Result<T, Error>> + Unpin,
{
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> TaskPoll<Self::Output> {
        let this = &mut *self;
        if let TaskPoll::Ready(out) = Pin::new(&mut this.future).poll(cx) {
            return TaskPoll::Ready(out);
        }
        match Pin::new(&mut this.sleep).poll(cx) {
            TaskPoll::Ready(()) => TaskPoll::Ready(Err(Error::new(ErrorKind::Timeout))),
            TaskPoll::Pending => TaskPoll::Pending,
        }
    }
}

/// Bounds a fallible awaitable by a deadline.
pub fn timeout<F, T>(reactor: &Reactor, duration: Duration, future: F) -> Timeout<F>
where
    F: Future<Output = Result<T, Error>> + Unpin,
{
    Timeout::new(reactor, duration, future)
}

// ============================================================================
// Driver
// ============================================================================

struct MainWake {
    woken: AtomicBool,
}

impl ArcWake for MainWake {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.woken.store(true, Ordering::SeqCst);
    }
}

/// Cooperative single-threaded runtime: a `LocalPool` executor fused with a
/// [`Reactor`].
///
/// Spawned tasks and the `block_on` root future run interleaved on the
/// calling thread; whenever every task is parked, the driver blocks in the
/// reactor until an edge or timer fires.
pub struct Driver {
    reactor: Reactor,
    pool: LocalPool,
}

impl Driver {
    /// Creates a driver with a fresh reactor.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            reactor: Reactor::new()?,
            pool: LocalPool::new(),
        })
    }

    /// A handle to the driver's reactor.
    pub fn reactor(&self) -> Reactor {
        self.reactor.clone()
    }

    /// A spawner for background tasks on this driver.
    pub fn spawner(&self) -> LocalSpawner {
        self.pool.spawner()
    }

    /// Runs `future` to completion, driving spawned tasks and the reactor.
    pub fn block_on<F: Future>(&mut self, future: F) -> F::Output {
        let mut future = std::pin::pin!(future);
        let main = Arc::new(MainWake {
            woken: AtomicBool::new(true),
        });
        let waker = futures::task::waker(main.clone());
        let mut cx = Context::from_waker(&waker);

        loop {
            if main.woken.swap(false, Ordering::SeqCst) {
                if let TaskPoll::Ready(out) = future.as_mut().poll(&mut cx) {
                    return out;
                }
            }
            self.pool.run_until_stalled();
            if main.woken.load(Ordering::SeqCst) {
                continue;
            }
            // Everything is parked on an edge or a timer.
            self.reactor
                .turn(None)
                .expect("reactor poll failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::LocalSpawnExt;

    #[test]
    fn block_on_plain_future() {
        let mut driver = Driver::new().unwrap();
        let out = driver.block_on(async { 7 });
        assert_eq!(out, 7);
    }

    #[test]
    fn sleep_fires_after_deadline() {
        let mut driver = Driver::new().unwrap();
        let reactor = driver.reactor();
        let start = Instant::now();
        driver.block_on(Sleep::after(&reactor, Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn timeout_expires_with_timeout_kind() {
        let mut driver = Driver::new().unwrap();
        let reactor = driver.reactor();
        let never = futures::future::pending::<Result<(), Error>>();
        let result = driver.block_on(timeout(&reactor, Duration::from_millis(10), never));
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
    }

    #[test]
    fn timeout_passes_through_early_completion() {
        let mut driver = Driver::new().unwrap();
        let reactor = driver.reactor();
        let ready = futures::future::ready(Ok::<_, Error>(42));
        let result = driver.block_on(timeout(&reactor, Duration::from_secs(5), ready));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn spawned_tasks_run_alongside_the_root_future() {
        let mut driver = Driver::new().unwrap();
        let reactor = driver.reactor();
        let spawner = driver.spawner();
        let (tx, rx) = futures::channel::oneshot::channel::<u32>();
        spawner
            .spawn_local(async move {
                Sleep::after(&reactor, Duration::from_millis(5)).await;
                tx.send(99).unwrap();
            })
            .unwrap();
        let out = driver.block_on(async move { rx.await.unwrap() });
        assert_eq!(out, 99);
    }
}
