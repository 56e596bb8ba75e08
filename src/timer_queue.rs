//! Ordered timer set integrated with the owning loop.
//!
//! Two sorted views of the same timers: the primary set ordered by
//! `(expiration, address)` drives expiration; the auxiliary set ordered by
//! `(address, sequence)` locates a timer from a [`TimerId`] for
//! cancellation. The two are equal in size at every public boundary.
//!
//! On Linux the queue owns a timerfd whose channel folds timer expiration
//! into the loop's normal readiness dispatch. Elsewhere a waiter thread
//! sleeps on a condvar until the earliest expiration and marshals each
//! expired batch onto the I/O thread, so callbacks run on the I/O thread
//! on every platform.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::trace;

use crate::metrics;
use crate::timer::{Timer, TimerId};

struct Inner {
    timers: BTreeMap<(Instant, usize), Arc<Timer>>,
    active: BTreeMap<(usize, u64), Arc<Timer>>,
    /// Timers canceled from inside their own callback in the batch that is
    /// currently firing; `reschedule` drops these instead of re-inserting.
    canceling: BTreeSet<(usize, u64)>,
    calling_expired: bool,
}

impl Inner {
    fn new() -> Inner {
        Inner {
            timers: BTreeMap::new(),
            active: BTreeMap::new(),
            canceling: BTreeSet::new(),
            calling_expired: false,
        }
    }
}

/// Returns true when the new timer became the earliest expiration.
fn insert_locked(inner: &mut Inner, timer: Arc<Timer>) -> bool {
    let when = timer.expiration();
    let addr = Arc::as_ptr(&timer) as usize;
    let earliest_changed = inner
        .timers
        .keys()
        .next()
        .map_or(true, |(first, _)| when < *first);
    let prev = inner.timers.insert((when, addr), timer.clone());
    debug_assert!(prev.is_none());
    let prev = inner.active.insert((addr, timer.sequence()), timer);
    debug_assert!(prev.is_none());
    debug_assert_eq!(inner.timers.len(), inner.active.len());
    earliest_changed
}

/// Splice out every timer due at or before `now`.
fn extract_expired_locked(inner: &mut Inner, now: Instant) -> Vec<Arc<Timer>> {
    debug_assert_eq!(inner.timers.len(), inner.active.len());
    let sentinel = (now, usize::MAX);
    let later = inner.timers.split_off(&sentinel);
    let expired_map = std::mem::replace(&mut inner.timers, later);
    let mut expired = Vec::with_capacity(expired_map.len());
    for ((_, addr), timer) in expired_map {
        let removed = inner.active.remove(&(addr, timer.sequence()));
        debug_assert!(removed.is_some());
        expired.push(timer);
    }
    debug_assert_eq!(inner.timers.len(), inner.active.len());
    expired
}

fn cancel_locked(inner: &mut Inner, id: TimerId) {
    debug_assert_eq!(inner.timers.len(), inner.active.len());
    if let Some(timer) = inner.active.remove(&(id.addr, id.sequence)) {
        let removed = inner.timers.remove(&(timer.expiration(), id.addr));
        debug_assert!(removed.is_some());
    } else if inner.calling_expired {
        inner.canceling.insert((id.addr, id.sequence));
    }
    // canceling an already-fired one-shot falls through: idempotent no-op
    debug_assert_eq!(inner.timers.len(), inner.active.len());
}

/// Re-insert expired repeaters (unless self-canceled) and report the new
/// earliest expiration, if any.
fn reschedule_locked(inner: &mut Inner, expired: Vec<Arc<Timer>>, now: Instant) -> Option<Instant> {
    for timer in expired {
        let key = (Arc::as_ptr(&timer) as usize, timer.sequence());
        if timer.repeat() && !inner.canceling.contains(&key) {
            timer.restart(now);
            insert_locked(inner, timer);
        }
    }
    inner.timers.keys().next().map(|(when, _)| *when)
}

#[cfg(target_os = "linux")]
pub(crate) use platform::{create_parts, TimerQueue};

#[cfg(target_os = "linux")]
mod platform {
    use super::*;
    use std::io;
    use std::os::unix::io::RawFd;
    use std::sync::Weak;

    use crate::channel::Channel;
    use crate::event_loop::EventLoop;
    use crate::sockets::{self, timerfd};

    /// The fallible piece of queue construction, done before the owning
    /// loop's cyclic allocation.
    pub(crate) fn create_parts() -> io::Result<RawFd> {
        timerfd::create()
    }

    pub(crate) struct TimerQueue {
        timer_fd: RawFd,
        channel: Arc<Channel>,
        inner: Mutex<Inner>,
    }

    impl TimerQueue {
        pub fn new(loop_: Weak<EventLoop>, timer_fd: RawFd) -> TimerQueue {
            let channel = Channel::new(loop_, timer_fd);
            TimerQueue {
                timer_fd,
                channel,
                inner: Mutex::new(Inner::new()),
            }
        }

        /// Subscribe the timerfd channel; called once the owning loop is
        /// fully constructed.
        pub fn start(&self, loop_: &Arc<EventLoop>) {
            let weak = Arc::downgrade(loop_);
            self.channel.set_read_callback(Box::new(move || {
                if let Some(l) = weak.upgrade() {
                    l.timers.handle_read();
                }
            }));
            self.channel.enable_read();
        }

        pub fn add_timer_in_loop(&self, timer: Arc<Timer>) {
            let when = timer.expiration();
            let earliest_changed = insert_locked(&mut *self.inner.lock(), timer);
            if earliest_changed {
                timerfd::arm(self.timer_fd, when);
            }
        }

        pub fn cancel_in_loop(&self, id: TimerId) {
            cancel_locked(&mut *self.inner.lock(), id);
        }

        fn handle_read(&self) {
            let overruns = timerfd::read(self.timer_fd);
            let now = Instant::now();
            let expired = {
                let mut inner = self.inner.lock();
                let expired = extract_expired_locked(&mut inner, now);
                inner.canceling.clear();
                inner.calling_expired = true;
                expired
            };
            trace!(overruns, count = expired.len(), "running expired timers");
            for timer in &expired {
                metrics::TIMERS_FIRED.increment();
                timer.run();
            }
            let next = {
                let mut inner = self.inner.lock();
                inner.calling_expired = false;
                reschedule_locked(&mut inner, expired, now)
            };
            if let Some(when) = next {
                timerfd::arm(self.timer_fd, when);
            }
        }

        #[cfg(test)]
        pub fn counts(&self) -> (usize, usize) {
            let inner = self.inner.lock();
            (inner.timers.len(), inner.active.len())
        }
    }

    impl Drop for TimerQueue {
        fn drop(&mut self) {
            sockets::close(self.timer_fd);
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) use platform::{create_parts, TimerQueue};

#[cfg(not(target_os = "linux"))]
mod platform {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Weak;
    use std::thread;

    use parking_lot::Condvar;

    use crate::event_loop::EventLoop;

    /// No descriptor to create on this platform; the waiter thread carries
    /// the schedule.
    pub(crate) fn create_parts() -> io::Result<()> {
        Ok(())
    }

    struct Shared {
        inner: Mutex<Inner>,
        cond: Condvar,
        shutdown: AtomicBool,
    }

    pub(crate) struct TimerQueue {
        loop_: Weak<EventLoop>,
        shared: Arc<Shared>,
        waiter: Mutex<Option<thread::JoinHandle<()>>>,
    }

    impl TimerQueue {
        pub fn new(loop_: Weak<EventLoop>, _parts: ()) -> TimerQueue {
            TimerQueue {
                loop_,
                shared: Arc::new(Shared {
                    inner: Mutex::new(Inner::new()),
                    cond: Condvar::new(),
                    shutdown: AtomicBool::new(false),
                }),
                waiter: Mutex::new(None),
            }
        }

        pub fn start(&self, _loop: &Arc<EventLoop>) {
            let shared = self.shared.clone();
            let loop_ = self.loop_.clone();
            let handle = thread::Builder::new()
                .name("riptide-timers".to_string())
                .spawn(move || waiter_main(shared, loop_))
                .expect("failed to spawn timer waiter thread");
            *self.waiter.lock() = Some(handle);
        }

        pub fn add_timer_in_loop(&self, timer: Arc<Timer>) {
            let earliest_changed = insert_locked(&mut *self.shared.inner.lock(), timer);
            if earliest_changed {
                self.shared.cond.notify_all();
            }
        }

        pub fn cancel_in_loop(&self, id: TimerId) {
            cancel_locked(&mut *self.shared.inner.lock(), id);
            self.shared.cond.notify_all();
        }

        #[cfg(test)]
        pub fn counts(&self) -> (usize, usize) {
            let inner = self.shared.inner.lock();
            (inner.timers.len(), inner.active.len())
        }
    }

    impl Drop for TimerQueue {
        fn drop(&mut self) {
            self.shared.shutdown.store(true, Ordering::Release);
            self.shared.cond.notify_all();
            if let Some(handle) = self.waiter.lock().take() {
                let _ = handle.join();
            }
        }
    }

    fn waiter_main(shared: Arc<Shared>, loop_: Weak<EventLoop>) {
        loop {
            let mut inner = shared.inner.lock();
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            let next = inner.timers.keys().next().map(|(when, _)| *when);
            let now = Instant::now();
            match next {
                None => {
                    shared.cond.wait(&mut inner);
                }
                Some(when) if when > now => {
                    let _ = shared.cond.wait_until(&mut inner, when);
                }
                Some(_) => {
                    let expired = extract_expired_locked(&mut inner, now);
                    drop(inner);
                    if expired.is_empty() {
                        continue;
                    }
                    let Some(l) = loop_.upgrade() else { break };
                    let batch_shared = shared.clone();
                    l.queue_in_loop(move || run_batch(&batch_shared, expired, now));
                }
            }
        }
    }

    /// Runs on the I/O thread.
    fn run_batch(shared: &Arc<Shared>, expired: Vec<Arc<Timer>>, now: Instant) {
        {
            let mut inner = shared.inner.lock();
            inner.canceling.clear();
            inner.calling_expired = true;
        }
        trace!(count = expired.len(), "running expired timers");
        for timer in &expired {
            metrics::TIMERS_FIRED.increment();
            timer.run();
        }
        let mut inner = shared.inner.lock();
        inner.calling_expired = false;
        reschedule_locked(&mut inner, expired, now);
        drop(inner);
        shared.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn timer(when: Instant, interval: Option<Duration>) -> Arc<Timer> {
        Arc::new(Timer::new(Box::new(|| {}), when, interval))
    }

    #[test]
    fn sets_stay_in_lockstep() {
        let mut inner = Inner::new();
        let now = Instant::now();
        let a = timer(now + Duration::from_millis(10), None);
        let b = timer(now + Duration::from_millis(5), None);

        assert!(insert_locked(&mut inner, a.clone()));
        assert!(insert_locked(&mut inner, b.clone()), "earlier timer changes the head");
        assert_eq!(inner.timers.len(), 2);
        assert_eq!(inner.active.len(), 2);

        cancel_locked(&mut inner, TimerId::of(&a));
        assert_eq!(inner.timers.len(), 1);
        assert_eq!(inner.active.len(), 1);

        // canceling again is a no-op
        cancel_locked(&mut inner, TimerId::of(&a));
        assert_eq!(inner.timers.len(), 1);
    }

    #[test]
    fn extract_takes_due_timers_only() {
        let mut inner = Inner::new();
        let now = Instant::now();
        let due = timer(now - Duration::from_millis(1), None);
        let exactly_now = timer(now, None);
        let later = timer(now + Duration::from_secs(60), None);
        insert_locked(&mut inner, due);
        insert_locked(&mut inner, exactly_now);
        insert_locked(&mut inner, later);

        let expired = extract_expired_locked(&mut inner, now);
        assert_eq!(expired.len(), 2, "due-at-now is expired, later is not");
        assert_eq!(inner.timers.len(), 1);
        assert_eq!(inner.active.len(), 1);
    }

    #[test]
    fn reschedule_reinserts_repeaters() {
        let mut inner = Inner::new();
        let now = Instant::now();
        let once = timer(now, None);
        let repeating = timer(now, Some(Duration::from_millis(20)));
        insert_locked(&mut inner, once);
        insert_locked(&mut inner, repeating.clone());

        let expired = extract_expired_locked(&mut inner, now);
        assert_eq!(expired.len(), 2);
        let next = reschedule_locked(&mut inner, expired, now);
        assert_eq!(inner.timers.len(), 1);
        assert_eq!(next, Some(now + Duration::from_millis(20)));
        assert_eq!(repeating.expiration(), now + Duration::from_millis(20));
    }

    #[test]
    fn self_canceled_repeater_is_not_reinserted() {
        let mut inner = Inner::new();
        let now = Instant::now();
        let repeating = timer(now, Some(Duration::from_millis(20)));
        let id = TimerId::of(&repeating);
        insert_locked(&mut inner, repeating);

        let expired = extract_expired_locked(&mut inner, now);
        inner.canceling.clear();
        inner.calling_expired = true;
        // cancel arrives while the batch is firing: not findable in the
        // auxiliary set, so it lands in the canceling set
        cancel_locked(&mut inner, id);
        assert!(inner.canceling.contains(&(id.addr, id.sequence)));
        inner.calling_expired = false;

        let next = reschedule_locked(&mut inner, expired, now);
        assert_eq!(next, None);
        assert_eq!(inner.timers.len(), 0);
        assert_eq!(inner.active.len(), 0);
    }
}
