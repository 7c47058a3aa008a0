//! POSIX signals delivered through a self-pipe, so a looper can watch them
//! like any other fd.
use std::fmt;
use std::io::{self, Error, ErrorKind};
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use log::debug;

/// Write end of the live pipe, -1 when none is installed.
static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

#[cfg(any(target_os = "linux", target_os = "dragonfly"))]
unsafe fn errno_ptr() -> *mut libc::c_int {
    libc::__errno_location()
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
unsafe fn errno_ptr() -> *mut libc::c_int {
    libc::__error()
}

#[cfg(any(target_os = "android", target_os = "openbsd", target_os = "netbsd"))]
unsafe fn errno_ptr() -> *mut libc::c_int {
    libc::__errno()
}

extern "C" fn handle_sig(sig: libc::c_int) {
    let fd = WRITE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = sig as u8;
        // write(2) is async-signal-safe; a full pipe just drops the byte.
        // The interrupted code must see its own errno afterwards.
        unsafe {
            let saved = *errno_ptr();
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
            *errno_ptr() = saved;
        }
    }
}

fn set_flags(fd: RawFd) -> io::Result<()> {
    unsafe {
        let fl = libc::fcntl(fd, libc::F_GETFL);
        if fl < 0 || libc::fcntl(fd, libc::F_SETFL, fl | libc::O_NONBLOCK) < 0 {
            return Err(Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(Error::last_os_error());
        }
    }
    Ok(())
}

/// Installs `handler` for `sig` and returns the disposition it replaced.
unsafe fn set_handler(sig: libc::c_int, handler: libc::sighandler_t) -> io::Result<libc::sigaction> {
    let mut action: libc::sigaction = mem::zeroed();
    action.sa_sigaction = handler;
    action.sa_flags = libc::SA_RESTART;
    libc::sigemptyset(&mut action.sa_mask);
    let mut old: libc::sigaction = mem::zeroed();
    if libc::sigaction(sig, &action, &mut old) < 0 {
        return Err(Error::last_os_error());
    }
    Ok(old)
}

/// Self-pipe receiving the numbers of the installed signals. Only one may
/// exist per process; a second `install` fails with `AlreadyExists` until
/// the first is dropped. Dropping it restores the dispositions it replaced.
pub struct SignalPipe {
    read: OwnedFd,
    write: OwnedFd,
    /// Signals whose handler was replaced, with the previous disposition.
    previous: Vec<(libc::c_int, libc::sigaction)>,
}

impl fmt::Debug for SignalPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalPipe")
            .field("read", &self.read)
            .field("signals", &self.signals())
            .finish()
    }
}

impl SignalPipe {
    pub fn install(signals: &[libc::c_int]) -> io::Result<SignalPipe> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(Error::last_os_error());
        }
        // SAFETY: pipe(2) just returned two fresh descriptors we own.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        set_flags(read.as_raw_fd())?;
        set_flags(write.as_raw_fd())?;

        if WRITE_FD
            .compare_exchange(-1, write.as_raw_fd(), Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::new(ErrorKind::AlreadyExists, "a signal pipe is already installed"));
        }
        let mut pipe = SignalPipe { read, write, previous: Vec::with_capacity(signals.len()) };
        for &sig in signals {
            // On failure `pipe` is dropped, which undoes the handlers set so far.
            let old = unsafe { set_handler(sig, handle_sig as libc::sighandler_t)? };
            pipe.previous.push((sig, old));
        }
        debug!("signal pipe installed for {:?}", signals);
        Ok(pipe)
    }

    pub fn signals(&self) -> Vec<libc::c_int> {
        self.previous.iter().map(|(sig, _)| *sig).collect()
    }

    /// Drains the pipe and returns the signals received since the last call.
    pub fn read_pending(&self) -> io::Result<Vec<libc::c_int>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.read.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n > 0 {
                out.extend(buf[..n as usize].iter().map(|&b| b as libc::c_int));
                continue;
            }
            if n == 0 {
                return Ok(out);
            }
            let err = Error::last_os_error();
            match err.kind() {
                ErrorKind::WouldBlock => return Ok(out),
                ErrorKind::Interrupted => continue,
                _ => return Err(err),
            }
        }
    }
}

impl AsRawFd for SignalPipe {
    fn as_raw_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        for (sig, old) in self.previous.iter().rev() {
            unsafe { libc::sigaction(*sig, old, std::ptr::null_mut()) };
        }
        let _ = WRITE_FD.compare_exchange(self.write.as_raw_fd(), -1, Ordering::SeqCst, Ordering::SeqCst);
    }
}
