//! Readiness multiplexing behind one uniform interface.
//!
//! Two variants with the same external contract: a readiness-poll variant
//! over `poll(2)` and a ready-list variant over epoll. Platform event bits
//! never leave the variant that produced them; each translates at its own
//! boundary.

mod poll;

#[cfg(target_os = "linux")]
mod epoll;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::Channel;

pub(crate) use poll::PollPoller;

#[cfg(target_os = "linux")]
pub(crate) use epoll::EpollPoller;

pub(crate) trait Poller: Send {
    /// Wait up to `timeout` for readiness and push each channel with
    /// pending events (revents already set) onto `active`.
    fn poll(&mut self, timeout: Duration, active: &mut Vec<Arc<Channel>>);

    /// Register a new channel or push its current subscription mask down
    /// to the kernel-facing state.
    fn update_channel(&mut self, channel: &Arc<Channel>);

    /// Forget a channel. Its subscription mask must already be empty.
    fn remove_channel(&mut self, channel: &Arc<Channel>);
}

#[cfg(target_os = "linux")]
pub(crate) fn new_default_poller() -> io::Result<Box<dyn Poller>> {
    match EpollPoller::new() {
        Ok(poller) => Ok(Box::new(poller)),
        Err(e) => {
            tracing::warn!(error = %e, "epoll unavailable, falling back to poll(2)");
            Ok(Box::new(PollPoller::new()))
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn new_default_poller() -> io::Result<Box<dyn Poller>> {
    Ok(Box::new(PollPoller::new()))
}
