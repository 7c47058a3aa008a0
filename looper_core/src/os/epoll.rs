#![cfg(target_os = "linux")]

use super::interest::{Event, Interest, Token};
use super::poller::{clamp_timeout, Poller};
use std::io::{Error, ErrorKind, Result};
use std::os::unix::io::RawFd;

pub struct Epoll {
    fd: RawFd,
    raw: Vec<libc::epoll_event>,
}

impl Epoll {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(Error::last_os_error());
        }
        Ok(Epoll { fd, raw: Vec::new() })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: Token, interest: Interest) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: epoll_bits(interest),
            u64: token as u64,
        };
        let res = unsafe { libc::epoll_ctl(self.fd, op, fd, &mut ev) };
        if res < 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

fn epoll_bits(interest: Interest) -> u32 {
    let mut bits = 0u32;
    if interest.is_readable() {
        bits |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    }
    if interest.is_writable() {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

impl Poller for Epoll {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn add(&mut self, fd: RawFd, token: Token, interest: Interest) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
    }

    fn modify(&mut self, fd: RawFd, token: Token, interest: Interest) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    fn delete(&mut self, fd: RawFd) -> Result<()> {
        // Pre-2.6.9 kernels require a non-null event pointer for DEL.
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        let res = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, &mut ev) };
        if res < 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    fn wait(&mut self, events: &mut [Event], timeout_ms: isize) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        // Raw kernel records live in their own buffer so the portable Event
        // layout never has to match libc's (packed on x86_64) struct.
        if self.raw.len() < events.len() {
            self.raw.resize(events.len(), libc::epoll_event { events: 0, u64: 0 });
        }
        let n = unsafe {
            libc::epoll_wait(
                self.fd,
                self.raw.as_mut_ptr(),
                events.len().min(libc::c_int::MAX as usize) as libc::c_int,
                clamp_timeout(timeout_ms),
            )
        };
        if n < 0 {
            let err = Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        let hangup = (libc::EPOLLHUP | libc::EPOLLRDHUP | libc::EPOLLERR) as u32;
        for (dst, src) in events.iter_mut().zip(self.raw.iter().take(n as usize)) {
            let ev = src.events;
            dst.token = src.u64 as Token;
            dst.readable = ev & (libc::EPOLLIN as u32) != 0 || ev & hangup != 0;
            dst.writable = ev & (libc::EPOLLOUT as u32) != 0 || ev & (libc::EPOLLERR as u32) != 0;
        }
        Ok(n as usize)
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
