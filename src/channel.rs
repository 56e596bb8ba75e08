//! Per-descriptor event subscription and dispatch record.

use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::event_loop::EventLoop;

pub(crate) const EVENT_NONE: u32 = 0;
pub(crate) const EVENT_READ: u32 = 0x1;
pub(crate) const EVENT_WRITE: u32 = 0x2;
pub(crate) const EVENT_ERROR: u32 = 0x4;
pub(crate) const EVENT_CLOSE: u32 = 0x8;

pub(crate) type EventHandler = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct Handlers {
    read: Option<EventHandler>,
    write: Option<EventHandler>,
    error: Option<EventHandler>,
    close: Option<EventHandler>,
}

/// Dispatches readiness for one descriptor to its owner's handlers.
///
/// A Channel never owns the descriptor and belongs to exactly one
/// [`EventLoop`] for its whole life; every subscription change is pushed to
/// the loop's poller immediately so the two can never drift. The optional
/// `tie` is a weak tether to a reference-counted owner: dispatch upgrades
/// it for the duration of one event so handlers cannot run against a
/// freed owner, and skips the event entirely if the owner is gone.
pub(crate) struct Channel {
    weak_self: Weak<Channel>,
    loop_: Weak<EventLoop>,
    fd: RawFd,
    events: AtomicU32,
    revents: AtomicU32,
    /// Poller bookkeeping hint: a slot index for the readiness-poll
    /// variant, a registration state for the ready-list variant. -1 means
    /// never registered.
    index: AtomicI32,
    handlers: Mutex<Handlers>,
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
}

impl Channel {
    pub fn new(loop_: Weak<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|weak| Channel {
            weak_self: weak.clone(),
            loop_,
            fd,
            events: AtomicU32::new(EVENT_NONE),
            revents: AtomicU32::new(EVENT_NONE),
            index: AtomicI32::new(-1),
            handlers: Mutex::new(Handlers::default()),
            tie: Mutex::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn events(&self) -> u32 {
        self.events.load(Ordering::Acquire)
    }

    /// Set by the poller before the channel is handed back as active.
    pub fn set_revents(&self, revents: u32) {
        self.revents.store(revents, Ordering::Release);
    }

    pub fn is_none_event(&self) -> bool {
        self.events() == EVENT_NONE
    }

    pub fn is_reading(&self) -> bool {
        self.events() & EVENT_READ != 0
    }

    pub fn is_writing(&self) -> bool {
        self.events() & EVENT_WRITE != 0
    }

    pub fn index(&self) -> i32 {
        self.index.load(Ordering::Acquire)
    }

    pub fn set_index(&self, index: i32) {
        self.index.store(index, Ordering::Release);
    }

    pub fn set_read_callback(&self, cb: EventHandler) {
        self.handlers.lock().read = Some(cb);
    }

    pub fn set_write_callback(&self, cb: EventHandler) {
        self.handlers.lock().write = Some(cb);
    }

    pub fn set_error_callback(&self, cb: EventHandler) {
        self.handlers.lock().error = Some(cb);
    }

    pub fn set_close_callback(&self, cb: EventHandler) {
        self.handlers.lock().close = Some(cb);
    }

    /// Tether dispatch to a reference-counted owner.
    pub fn tie(&self, owner: Weak<dyn Any + Send + Sync>) {
        *self.tie.lock() = Some(owner);
    }

    pub fn enable_read(&self) {
        self.events.fetch_or(EVENT_READ, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_read(&self) {
        self.events.fetch_and(!EVENT_READ, Ordering::AcqRel);
        self.update();
    }

    pub fn enable_write(&self) {
        self.events.fetch_or(EVENT_WRITE, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_write(&self) {
        self.events.fetch_and(!EVENT_WRITE, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_all(&self) {
        self.events.store(EVENT_NONE, Ordering::Release);
        self.update();
    }

    /// Unregister from the poller. The subscription must already be empty
    /// (`disable_all` first); anything else is a caller bug.
    pub fn remove(&self) {
        assert!(self.is_none_event(), "removing a channel with live subscriptions");
        if self.index() < 0 {
            // never registered with the poller
            return;
        }
        if let (Some(loop_), Some(me)) = (self.loop_.upgrade(), self.weak_self.upgrade()) {
            loop_.remove_channel(&me);
        }
    }

    pub fn owner_loop(&self) -> &Weak<EventLoop> {
        &self.loop_
    }

    /// Run the handlers for the readiness bits set by the poller.
    ///
    /// Order matters: close first, since it may tear the owner down, then
    /// error, read, write.
    pub fn handle_event(&self) {
        let tie = self.tie.lock().clone();
        match tie {
            Some(owner) => {
                if let Some(_guard) = owner.upgrade() {
                    self.handle_event_with_guard();
                }
                // owner already destroyed: skip dispatch
            }
            None => self.handle_event_with_guard(),
        }
    }

    fn handle_event_with_guard(&self) {
        let revents = self.revents.load(Ordering::Acquire);
        let mut handlers = self.handlers.lock();
        if revents & EVENT_CLOSE != 0 {
            if let Some(cb) = handlers.close.as_mut() {
                cb();
            }
        }
        if revents & EVENT_ERROR != 0 {
            if let Some(cb) = handlers.error.as_mut() {
                cb();
            }
        }
        if revents & EVENT_READ != 0 {
            if let Some(cb) = handlers.read.as_mut() {
                cb();
            }
        }
        if revents & EVENT_WRITE != 0 {
            if let Some(cb) = handlers.write.as_mut() {
                cb();
            }
        }
    }

    fn update(&self) {
        if self.index() < 0 && self.is_none_event() {
            // never registered and nothing subscribed: no poller state to sync
            return;
        }
        if let (Some(loop_), Some(me)) = (self.loop_.upgrade(), self.weak_self.upgrade()) {
            loop_.update_channel(&me);
        }
    }
}
