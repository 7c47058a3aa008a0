#![cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]

use super::interest::{Event, Interest, Token};
use super::poller::Poller;
use std::collections::HashMap;
use std::io::{Error, ErrorKind, Result};
use std::os::unix::io::RawFd;
use std::{mem, ptr};

pub struct Kqueue {
    kq: RawFd,
    /// Filters currently installed per fd, needed to undo them on modify/delete.
    installed: HashMap<RawFd, Interest>,
    raw: Vec<libc::kevent>,
}

fn change(fd: RawFd, filter: i16, flags: u16, token: Token) -> libc::kevent {
    // Zeroed first: the struct carries platform-specific extra fields.
    let mut kev: libc::kevent = unsafe { mem::zeroed() };
    kev.ident = fd as _;
    kev.filter = filter as _;
    kev.flags = flags as _;
    kev.udata = token as _;
    kev
}

impl Kqueue {
    pub fn new() -> Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(Error::last_os_error());
        }
        unsafe { libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC) };
        Ok(Kqueue { kq, installed: HashMap::new(), raw: Vec::new() })
    }

    fn apply(&self, changes: &[libc::kevent]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let res = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as libc::c_int,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if res < 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    fn install(&mut self, fd: RawFd, token: Token, old: Interest, new: Interest) -> Result<()> {
        let mut changes = Vec::with_capacity(2);
        let filters = [(Interest::READ, libc::EVFILT_READ), (Interest::WRITE, libc::EVFILT_WRITE)];
        for (bit, filter) in filters {
            if new.contains(bit) {
                // EV_ADD on an existing filter updates its udata.
                changes.push(change(fd, filter as i16, (libc::EV_ADD | libc::EV_ENABLE) as u16, token));
            } else if old.contains(bit) {
                changes.push(change(fd, filter as i16, libc::EV_DELETE as u16, token));
            }
        }
        self.apply(&changes)?;
        self.installed.insert(fd, new);
        Ok(())
    }
}

impl Poller for Kqueue {
    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn add(&mut self, fd: RawFd, token: Token, interest: Interest) -> Result<()> {
        if self.installed.contains_key(&fd) {
            return Err(Error::from_raw_os_error(libc::EEXIST));
        }
        self.install(fd, token, Interest::NONE, interest)
    }

    fn modify(&mut self, fd: RawFd, token: Token, interest: Interest) -> Result<()> {
        let old = match self.installed.get(&fd) {
            Some(old) => *old,
            None => return Err(Error::from_raw_os_error(libc::ENOENT)),
        };
        self.install(fd, token, old, interest)
    }

    fn delete(&mut self, fd: RawFd) -> Result<()> {
        let old = match self.installed.remove(&fd) {
            Some(old) => old,
            None => return Err(Error::from_raw_os_error(libc::ENOENT)),
        };
        let mut changes = Vec::with_capacity(2);
        if old.is_readable() {
            changes.push(change(fd, libc::EVFILT_READ as i16, libc::EV_DELETE as u16, 0));
        }
        if old.is_writable() {
            changes.push(change(fd, libc::EVFILT_WRITE as i16, libc::EV_DELETE as u16, 0));
        }
        self.apply(&changes)
    }

    fn wait(&mut self, events: &mut [Event], timeout_ms: isize) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        if self.raw.len() < events.len() {
            self.raw.resize(events.len(), unsafe { mem::zeroed() });
        }
        let ts = libc::timespec {
            tv_sec: (timeout_ms.max(0) / 1000) as _,
            tv_nsec: ((timeout_ms.max(0) % 1000) * 1_000_000) as _,
        };
        let n = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                self.raw.as_mut_ptr(),
                events.len().min(libc::c_int::MAX as usize) as libc::c_int,
                if timeout_ms >= 0 { &ts } else { ptr::null() },
            )
        };
        if n < 0 {
            let err = Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for (dst, src) in events.iter_mut().zip(self.raw.iter().take(n as usize)) {
            let failed = src.flags & (libc::EV_ERROR as u16) != 0;
            let eof = src.flags & (libc::EV_EOF as u16) != 0;
            dst.token = src.udata as Token;
            dst.readable = src.filter == libc::EVFILT_READ as _ || eof || failed;
            dst.writable = src.filter == libc::EVFILT_WRITE as _ || failed;
        }
        Ok(n as usize)
    }
}

impl Drop for Kqueue {
    fn drop(&mut self) {
        unsafe { libc::close(self.kq) };
    }
}
