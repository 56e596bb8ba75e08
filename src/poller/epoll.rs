//! Ready-list variant over epoll(7).
//!
//! Same external contract as the readiness-poll variant, but the kernel
//! hands back only the descriptors that are ready, so scan cost tracks the
//! active set instead of the registered set.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, trace, warn};

use crate::channel::{Channel, EVENT_CLOSE, EVENT_ERROR, EVENT_NONE, EVENT_READ, EVENT_WRITE};
use crate::poller::Poller;

const INIT_EVENT_LIST_SIZE: usize = 16;

// Registration states stored in the channel's index hint.
const INDEX_NEW: i32 = -1;
const INDEX_ADDED: i32 = 1;
const INDEX_DETACHED: i32 = 2;

pub(crate) struct EpollPoller {
    epollfd: RawFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl EpollPoller {
    pub fn new() -> io::Result<EpollPoller> {
        let epollfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epollfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollPoller {
            epollfd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INIT_EVENT_LIST_SIZE],
            channels: HashMap::new(),
        })
    }

    fn fill_active_channels(&self, num_events: usize, active: &mut Vec<Arc<Channel>>) {
        debug_assert!(num_events <= self.events.len());
        for event in &self.events[..num_events] {
            let fd = event.u64 as RawFd;
            let channel = &self.channels[&fd];
            debug_assert_eq!(channel.fd(), fd);
            channel.set_revents(from_epoll_events(event.events));
            active.push(channel.clone());
        }
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel) {
        let mut event = libc::epoll_event {
            events: to_epoll_events(channel.events()),
            u64: channel.fd() as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epollfd, op, channel.fd(), &mut event) };
        if ret < 0 {
            let e = io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                warn!(fd = channel.fd(), error = %e, "epoll_ctl(DEL) failed");
            } else {
                error!(fd = channel.fd(), op, error = %e, "epoll_ctl failed");
            }
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout: Duration, active: &mut Vec<Arc<Channel>>) {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let num_events = unsafe {
            libc::epoll_wait(
                self.epollfd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if num_events > 0 {
            trace!(num_events, "events happened");
            self.fill_active_channels(num_events as usize, active);
            if num_events as usize == self.events.len() {
                // ready list filled up; give the next wait more room
                self.events
                    .resize(self.events.len() * 2, libc::epoll_event { events: 0, u64: 0 });
            }
        } else if num_events == 0 {
            trace!("nothing happened");
        } else {
            let e = io::Error::last_os_error();
            if e.kind() != io::ErrorKind::Interrupted {
                error!(error = %e, "epoll_wait failed");
            }
        }
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let index = channel.index();
        trace!(fd = channel.fd(), events = channel.events(), index, "update channel");
        if index == INDEX_NEW || index == INDEX_DETACHED {
            if index == INDEX_NEW {
                debug_assert!(!self.channels.contains_key(&channel.fd()));
                self.channels.insert(channel.fd(), channel.clone());
            } else {
                debug_assert!(self.channels.contains_key(&channel.fd()));
            }
            channel.set_index(INDEX_ADDED);
            self.ctl(libc::EPOLL_CTL_ADD, channel);
        } else {
            debug_assert_eq!(index, INDEX_ADDED);
            debug_assert!(self.channels.contains_key(&channel.fd()));
            if channel.is_none_event() {
                // keep the bookkeeping entry, drop the kernel registration
                self.ctl(libc::EPOLL_CTL_DEL, channel);
                channel.set_index(INDEX_DETACHED);
            } else {
                self.ctl(libc::EPOLL_CTL_MOD, channel);
            }
        }
    }

    fn remove_channel(&mut self, channel: &Arc<Channel>) {
        trace!(fd = channel.fd(), "remove channel");
        assert!(channel.is_none_event());
        debug_assert!(self.channels.contains_key(&channel.fd()));
        let index = channel.index();
        debug_assert!(index == INDEX_ADDED || index == INDEX_DETACHED);
        self.channels.remove(&channel.fd());
        if index == INDEX_ADDED {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(INDEX_NEW);
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        crate::sockets::close(self.epollfd);
    }
}

fn to_epoll_events(events: u32) -> u32 {
    let mut ret = 0;
    if events == EVENT_NONE {
        return ret;
    }
    if events & EVENT_READ != 0 {
        ret |= (libc::EPOLLIN | libc::EPOLLPRI) as u32;
    }
    if events & EVENT_WRITE != 0 {
        ret |= libc::EPOLLOUT as u32;
    }
    ret
}

fn from_epoll_events(revents: u32) -> u32 {
    let mut ret = EVENT_NONE;
    if revents & libc::EPOLLHUP as u32 != 0 && revents & libc::EPOLLIN as u32 == 0 {
        ret |= EVENT_CLOSE;
    }
    if revents & libc::EPOLLERR as u32 != 0 {
        ret |= EVENT_ERROR;
    }
    if revents & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32 != 0 {
        ret |= EVENT_READ;
    }
    if revents & libc::EPOLLOUT as u32 != 0 {
        ret |= EVENT_WRITE;
    }
    ret
}
