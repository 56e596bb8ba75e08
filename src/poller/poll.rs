//! Readiness-poll variant over `poll(2)`.
//!
//! Level-triggered: a readable descriptor that is not drained will surface
//! again on the very next poll.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, trace};

use crate::channel::{Channel, EVENT_CLOSE, EVENT_ERROR, EVENT_NONE, EVENT_READ, EVENT_WRITE};
use crate::poller::Poller;

pub(crate) struct PollPoller {
    pollfds: Vec<libc::pollfd>,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl PollPoller {
    pub fn new() -> PollPoller {
        PollPoller {
            pollfds: Vec::new(),
            channels: HashMap::new(),
        }
    }

    fn fill_active_channels(&self, mut num_events: i32, active: &mut Vec<Arc<Channel>>) {
        for pfd in &self.pollfds {
            if num_events == 0 {
                break;
            }
            if pfd.revents == 0 {
                continue;
            }
            num_events -= 1;
            let channel = &self.channels[&pfd.fd];
            debug_assert_eq!(channel.fd(), pfd.fd);
            channel.set_revents(from_poll_events(pfd.revents));
            active.push(channel.clone());
        }
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout: Duration, active: &mut Vec<Arc<Channel>>) {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let num_events = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if num_events > 0 {
            trace!(num_events, "events happened");
            self.fill_active_channels(num_events, active);
        } else if num_events == 0 {
            trace!("nothing happened");
        } else {
            let e = io::Error::last_os_error();
            if e.kind() != io::ErrorKind::Interrupted {
                error!(error = %e, "poll(2) failed");
            }
        }
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        trace!(fd = channel.fd(), events = channel.events(), "update channel");
        if channel.index() < 0 {
            // new channel: append a slot and remember where it landed
            debug_assert!(!self.channels.contains_key(&channel.fd()));
            self.pollfds.push(libc::pollfd {
                fd: channel.fd(),
                events: to_poll_events(channel.events()),
                revents: 0,
            });
            channel.set_index(self.pollfds.len() as i32 - 1);
            self.channels.insert(channel.fd(), channel.clone());
        } else {
            debug_assert!(self.channels.contains_key(&channel.fd()));
            let idx = channel.index() as usize;
            debug_assert!(idx < self.pollfds.len());
            let pfd = &mut self.pollfds[idx];
            debug_assert!(pfd.fd == channel.fd() || pfd.fd == -channel.fd() - 1);
            pfd.events = to_poll_events(channel.events());
            pfd.revents = 0;
            if channel.is_none_event() {
                // Park the slot without surfacing events. The -1 offset is
                // required because 0 is a valid descriptor.
                pfd.fd = -channel.fd() - 1;
            } else {
                pfd.fd = channel.fd();
            }
        }
    }

    fn remove_channel(&mut self, channel: &Arc<Channel>) {
        trace!(fd = channel.fd(), "remove channel");
        assert!(channel.is_none_event());
        debug_assert!(self.channels.contains_key(&channel.fd()));
        let idx = channel.index() as usize;
        debug_assert!(idx < self.pollfds.len());
        debug_assert_eq!(self.pollfds[idx].fd, -channel.fd() - 1);

        self.channels.remove(&channel.fd());
        if idx == self.pollfds.len() - 1 {
            self.pollfds.pop();
        } else {
            // swap with the last slot and fix the moved channel's hint
            let mut swapped_fd = self.pollfds[self.pollfds.len() - 1].fd;
            self.pollfds.swap_remove(idx);
            if swapped_fd < 0 {
                swapped_fd = -swapped_fd - 1;
            }
            self.channels[&swapped_fd].set_index(idx as i32);
        }
        channel.set_index(-1);
    }
}

fn to_poll_events(events: u32) -> libc::c_short {
    let mut ret = 0;
    if events == EVENT_NONE {
        return ret;
    }
    if events & EVENT_READ != 0 {
        ret |= libc::POLLIN | libc::POLLPRI;
    }
    if events & EVENT_WRITE != 0 {
        ret |= libc::POLLOUT;
    }
    ret
}

fn from_poll_events(revents: libc::c_short) -> u32 {
    let mut ret = EVENT_NONE;
    if revents & libc::POLLHUP != 0 && revents & libc::POLLIN == 0 {
        ret |= EVENT_CLOSE;
    }
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        ret |= EVENT_ERROR;
    }
    #[allow(unused_mut)]
    let mut read_mask = libc::POLLIN | libc::POLLPRI;
    #[cfg(target_os = "linux")]
    {
        read_mask |= libc::POLLRDHUP;
    }
    if revents & read_mask != 0 {
        ret |= EVENT_READ;
    }
    if revents & libc::POLLOUT != 0 {
        ret |= EVENT_WRITE;
    }
    ret
}
