//! Loop-per-thread spawning and the round-robin worker pool.

use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::Error;
use crate::event_loop::EventLoop;

/// Owns a thread running one [`EventLoop`]. The loop is constructed on the
/// spawned thread (affinity binds at construction) and handed back through
/// a condvar handshake. Dropping the handle quits the loop and joins.
pub struct EventLoopThread {
    loop_: Arc<EventLoop>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn start(name: &str) -> Result<EventLoopThread, Error> {
        let slot: Arc<(Mutex<Option<Result<Arc<EventLoop>, Error>>>, Condvar)> =
            Arc::new((Mutex::new(None), Condvar::new()));
        let thread_slot = slot.clone();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let loop_ = match EventLoop::new() {
                    Ok(l) => l,
                    Err(e) => {
                        let (lock, cond) = &*thread_slot;
                        *lock.lock() = Some(Err(e));
                        cond.notify_all();
                        return;
                    }
                };
                {
                    let (lock, cond) = &*thread_slot;
                    *lock.lock() = Some(Ok(loop_.clone()));
                    cond.notify_all();
                }
                loop_.run();
            })
            .map_err(Error::Io)?;

        let (lock, cond) = &*slot;
        let mut guard = lock.lock();
        while guard.is_none() {
            cond.wait(&mut guard);
        }
        let loop_ = guard
            .take()
            .expect("loop handshake returned without a result")?;
        drop(guard);

        Ok(EventLoopThread {
            loop_,
            thread: Some(thread),
        })
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.loop_
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.loop_.quit();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Round-robin assignment of worker loops for a multi-threaded server.
///
/// With zero threads every caller gets the base loop; otherwise workers are
/// handed out in rotation and the base loop keeps only the listener.
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    num_threads: usize,
    next: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<Arc<EventLoop>>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            num_threads: 0,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    pub fn start(&mut self) -> Result<(), Error> {
        self.base_loop.assert_in_loop_thread();
        for i in 0..self.num_threads {
            let t = EventLoopThread::start(&format!("riptide-loop-{i}"))?;
            self.loops.push(t.event_loop().clone());
            self.threads.push(t);
        }
        trace!(threads = self.num_threads, "loop pool started");
        Ok(())
    }

    pub fn next_loop(&mut self) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();
        if self.loops.is_empty() {
            return self.base_loop.clone();
        }
        let loop_ = self.loops[self.next].clone();
        self.next = (self.next + 1) % self.loops.len();
        loop_
    }
}
