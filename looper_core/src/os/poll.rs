//! Portable `poll(2)` backend. Works on every Unix and is the fallback where
//! neither epoll nor kqueue is available.

use super::interest::{Event, Interest, Token};
use super::poller::{clamp_timeout, Poller};
use std::collections::HashMap;
use std::io::{Error, ErrorKind, Result};
use std::os::unix::io::RawFd;

#[derive(Default)]
pub struct PollSet {
    fds: Vec<libc::pollfd>,
    tokens: Vec<Token>,
    index: HashMap<RawFd, usize>,
}

fn poll_bits(interest: Interest) -> libc::c_short {
    let mut bits = 0;
    if interest.is_readable() {
        bits |= libc::POLLIN;
    }
    if interest.is_writable() {
        bits |= libc::POLLOUT;
    }
    bits
}

impl PollSet {
    pub fn new() -> Result<Self> {
        Ok(PollSet::default())
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }
}

impl Poller for PollSet {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn add(&mut self, fd: RawFd, token: Token, interest: Interest) -> Result<()> {
        if self.index.contains_key(&fd) {
            return Err(Error::from_raw_os_error(libc::EEXIST));
        }
        self.index.insert(fd, self.fds.len());
        self.fds.push(libc::pollfd { fd, events: poll_bits(interest), revents: 0 });
        self.tokens.push(token);
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, token: Token, interest: Interest) -> Result<()> {
        let idx = match self.index.get(&fd) {
            Some(idx) => *idx,
            None => return Err(Error::from_raw_os_error(libc::ENOENT)),
        };
        self.fds[idx].events = poll_bits(interest);
        self.tokens[idx] = token;
        Ok(())
    }

    fn delete(&mut self, fd: RawFd) -> Result<()> {
        let idx = match self.index.remove(&fd) {
            Some(idx) => idx,
            None => return Err(Error::from_raw_os_error(libc::ENOENT)),
        };
        self.fds.swap_remove(idx);
        self.tokens.swap_remove(idx);
        if let Some(moved) = self.fds.get(idx) {
            self.index.insert(moved.fd, idx);
        }
        Ok(())
    }

    fn wait(&mut self, events: &mut [Event], timeout_ms: isize) -> Result<usize> {
        let n = unsafe {
            libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, clamp_timeout(timeout_ms))
        };
        if n < 0 {
            let err = Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        let hangup = libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
        let mut filled = 0;
        for (pfd, token) in self.fds.iter().zip(&self.tokens) {
            if filled == events.len() {
                break;
            }
            let rev = pfd.revents;
            if rev == 0 {
                continue;
            }
            events[filled] = Event {
                token: *token,
                readable: rev & libc::POLLIN != 0 || rev & hangup != 0,
                writable: rev & libc::POLLOUT != 0 || rev & (libc::POLLERR | libc::POLLNVAL) != 0,
            };
            filled += 1;
        }
        Ok(filled)
    }
}
