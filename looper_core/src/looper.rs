//! The `Looper` abstraction: a single-threaded event loop dispatching timer
//! expirations, fd readiness and queued tasks to callbacks.

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::clock::{self, ClockType};
use crate::error::Result;
use crate::os::Interest;

macro_rules! handle_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u64);

        impl $name {
            pub fn as_u64(self) -> u64 {
                self.0
            }
        }
    };
}

handle_id!(
    /// Timer handle. Never reused within a looper.
    TimerId
);
handle_id!(
    /// Fd watch handle. Never reused within a looper.
    WatchId
);
handle_id!(
    /// Task handle. Never reused within a looper.
    TaskId
);

pub type TimerCallback = Box<dyn FnMut(&mut dyn Looper, TimerId)>;
pub type FdCallback = Box<dyn FnMut(&mut dyn Looper, WatchId, RawFd, Interest)>;
pub type TaskCallback = Box<dyn FnMut(&mut dyn Looper, TaskId)>;

/// Why a `run*` call returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    /// `force_quit` was called.
    Quit,
    /// The deadline passed.
    TimedOut,
    /// Nothing is left that could wake the loop up.
    WouldBlock,
}

impl RunStatus {
    /// Return code of `looper_runWithDeadline`.
    pub fn errno(self) -> i32 {
        match self {
            RunStatus::Quit => 0,
            RunStatus::TimedOut => libc::ETIMEDOUT,
            RunStatus::WouldBlock => libc::EWOULDBLOCK,
        }
    }
}

/// Event loop interface. Callbacks get the looper back as `&mut dyn Looper`
/// and may call any method on it except the `run*` family.
pub trait Looper {
    fn name(&self) -> &str;

    fn now_ms(&self, clock: ClockType) -> u64 {
        clock::now_ms(clock)
    }

    fn now_ns(&self, clock: ClockType) -> u64 {
        clock::now_ns(clock)
    }

    // ---- timers ----

    fn create_timer(&mut self, clock: ClockType, callback: TimerCallback) -> TimerId;

    /// Arms the timer for `deadline_ms` on the timer's clock.
    fn start_timer_absolute(&mut self, timer: TimerId, deadline_ms: u64) -> Result<()>;

    /// Arms the timer `timeout` from now; `None` stops it.
    fn start_timer_relative(&mut self, timer: TimerId, timeout: Option<Duration>) -> Result<()> {
        match timeout {
            None => self.stop_timer(timer),
            Some(_) => {
                let clock = self.timer_clock(timer)?;
                let now = self.now_ms(clock);
                let deadline = clock::deadline_after(now, timeout).unwrap_or(u64::MAX);
                self.start_timer_absolute(timer, deadline)
            }
        }
    }

    fn stop_timer(&mut self, timer: TimerId) -> Result<()>;
    fn is_timer_active(&self, timer: TimerId) -> bool;
    fn timer_clock(&self, timer: TimerId) -> Result<ClockType>;
    fn destroy_timer(&mut self, timer: TimerId) -> Result<()>;

    // ---- fd watches ----

    fn create_fd_watch(&mut self, fd: RawFd, callback: FdCallback) -> Result<WatchId>;
    fn add_interest(&mut self, watch: WatchId, interest: Interest) -> Result<()>;
    fn remove_interest(&mut self, watch: WatchId, interest: Interest) -> Result<()>;
    fn interest(&self, watch: WatchId) -> Result<Interest>;
    fn watched_fd(&self, watch: WatchId) -> Result<RawFd>;

    /// Events recorded for the watch that have not been delivered yet.
    fn poll_fd_watch(&self, watch: WatchId) -> Result<Interest>;
    fn destroy_fd_watch(&mut self, watch: WatchId) -> Result<()>;

    fn want_read(&mut self, watch: WatchId) -> Result<()> {
        self.add_interest(watch, Interest::READ)
    }

    fn want_write(&mut self, watch: WatchId) -> Result<()> {
        self.add_interest(watch, Interest::WRITE)
    }

    fn dont_want_read(&mut self, watch: WatchId) -> Result<()> {
        self.remove_interest(watch, Interest::READ)
    }

    fn dont_want_write(&mut self, watch: WatchId) -> Result<()> {
        self.remove_interest(watch, Interest::WRITE)
    }

    // ---- tasks ----

    fn create_task(&mut self, callback: TaskCallback) -> TaskId;
    fn schedule_task(&mut self, task: TaskId) -> Result<()>;
    fn cancel_task(&mut self, task: TaskId) -> Result<()>;
    fn is_task_scheduled(&self, task: TaskId) -> bool;
    fn destroy_task(&mut self, task: TaskId) -> Result<()>;

    // ---- running ----

    /// Runs until `force_quit`, until the host clock reaches `deadline_ms`
    /// (`None` never), or until there is nothing left to wait for.
    fn run_with_deadline(&mut self, deadline_ms: Option<u64>) -> Result<RunStatus>;

    fn run_with_timeout(&mut self, timeout: Option<Duration>) -> Result<RunStatus> {
        let deadline = clock::deadline_after(self.now_ms(ClockType::Host), timeout);
        self.run_with_deadline(deadline)
    }

    fn run(&mut self) -> Result<RunStatus> {
        self.run_with_deadline(None)
    }

    /// Makes the current `run*` call return `Quit` once the iteration in
    /// progress has been dispatched.
    fn force_quit(&mut self);
}
