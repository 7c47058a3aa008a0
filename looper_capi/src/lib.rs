//! C ABI bindings to `looper_core`, declared in `include/looper.h`.
//!
//! `looper_newGeneric` hands out a `GLooper` wrapping the looper produced by
//! `looper_core::create()`; C sees it as the opaque `Looper`. Timer, I/O and
//! task handles are heap objects that remember their owner and core id, and
//! must be freed before the looper. Null handles are ignored.

#![allow(non_snake_case)]
#![allow(clippy::missing_safety_doc)]

use std::cell::Cell;
use std::ffi::{c_char, c_int, c_uint, c_void, CString};
use std::mem;
use std::ptr::{self, NonNull};
use std::time::Duration as StdDuration;

use log::{error, warn};
use looper_core::{ClockType, Interest, Looper, TaskId, TimerId, WatchId};

/// Milliseconds, as in the C header.
pub type Duration = i64;
pub const DURATION_INFINITE: Duration = i64::MAX;

pub const LOOPER_CLOCK_REALTIME: c_int = 0;
pub const LOOPER_CLOCK_VIRTUAL: c_int = 1;
pub const LOOPER_CLOCK_HOST: c_int = 2;

pub const LOOP_IO_READ: c_uint = 1;
pub const LOOP_IO_WRITE: c_uint = 2;

pub type LoopTimerFunc = Option<unsafe extern "C" fn(opaque: *mut c_void, timer: *mut LoopTimer)>;
pub type LoopIoFunc = Option<unsafe extern "C" fn(opaque: *mut c_void, fd: c_int, events: c_uint)>;
pub type LoopTaskFunc = Option<unsafe extern "C" fn(opaque: *mut c_void, task: *mut LoopTask)>;

/// The object behind a C `Looper*`.
pub struct GLooper {
    looper: Box<dyn Looper>,
    name: CString,
    /// The running looper while a C callback executes, so that calls made
    /// from the callback go through the borrow `run` handed out.
    dispatch: Cell<Option<NonNull<dyn Looper>>>,
}

impl GLooper {
    pub fn new(looper: Box<dyn Looper>) -> GLooper {
        let name = CString::new(looper.name().replace('\0', ""))
            .unwrap_or_else(|_| CString::default());
        GLooper { looper, name, dispatch: Cell::new(None) }
    }

    /// The looper C calls on `this` should act on.
    unsafe fn looper<'a>(this: *mut GLooper) -> &'a mut dyn Looper {
        match (*this).dispatch.get() {
            Some(mut running) => running.as_mut(),
            None => &mut *(*this).looper,
        }
    }

    /// Calls `f` with `running` published in the dispatch slot of `owner`.
    unsafe fn dispatch(owner: *const GLooper, running: &mut dyn Looper, f: impl FnOnce()) {
        let running = NonNull::from(running);
        // The slot is cleared before `running`'s borrow ends.
        let running = mem::transmute::<NonNull<dyn Looper + '_>, NonNull<dyn Looper + 'static>>(running);
        let prev = (*owner).dispatch.replace(Some(running));
        f();
        (*owner).dispatch.set(prev);
    }
}

pub struct LoopTimer {
    owner: *mut GLooper,
    id: Option<TimerId>,
}

pub struct LoopIo {
    owner: *mut GLooper,
    fd: c_int,
    id: Option<WatchId>,
}

pub struct LoopTask {
    owner: *mut GLooper,
    id: Option<TaskId>,
}

fn deadline_from_c(deadline: Duration) -> Option<u64> {
    if deadline == DURATION_INFINITE {
        None
    } else {
        Some(deadline.max(0) as u64)
    }
}

fn timeout_from_c(timeout: Duration) -> Option<StdDuration> {
    if timeout == DURATION_INFINITE {
        None
    } else {
        Some(StdDuration::from_millis(timeout.max(0) as u64))
    }
}

fn to_c(ms: u64) -> Duration {
    ms.min(i64::MAX as u64) as Duration
}

fn report(op: &str, result: looper_core::Result<()>) {
    if let Err(e) = result {
        warn!("{}: {}", op, e);
    }
}

// ---------------------------------------------------------------------------
// Looper
// ---------------------------------------------------------------------------

/// Creates a looper backed by the generic event loop. Returns null if the
/// OS poller cannot be created.
#[no_mangle]
pub extern "C" fn looper_newGeneric() -> *mut GLooper {
    match looper_core::create() {
        Ok(looper) => Box::into_raw(Box::new(GLooper::new(looper))),
        Err(e) => {
            error!("looper_newGeneric: {}", e);
            ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn looper_free(looper: *mut GLooper) {
    if !looper.is_null() {
        drop(Box::from_raw(looper));
    }
}

#[no_mangle]
pub unsafe extern "C" fn looper_name(looper: *mut GLooper) -> *const c_char {
    match looper.as_ref() {
        Some(g) => g.name.as_ptr(),
        None => ptr::null(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn looper_nowWithClock(looper: *mut GLooper, clock: c_int) -> Duration {
    if looper.is_null() {
        return 0;
    }
    to_c(GLooper::looper(looper).now_ms(ClockType::from_raw(clock)))
}

#[no_mangle]
pub unsafe extern "C" fn looper_now(looper: *mut GLooper) -> Duration {
    looper_nowWithClock(looper, LOOPER_CLOCK_HOST)
}

#[no_mangle]
pub unsafe extern "C" fn looper_nowNsWithClock(looper: *mut GLooper, clock: c_int) -> i64 {
    if looper.is_null() {
        return 0;
    }
    to_c(GLooper::looper(looper).now_ns(ClockType::from_raw(clock)))
}

/// Returns 0 after `looper_forceQuit`, `ETIMEDOUT` when the deadline passed
/// and `EWOULDBLOCK` when nothing is left to wait for.
#[no_mangle]
pub unsafe extern "C" fn looper_runWithDeadline(looper: *mut GLooper, deadline: Duration) -> c_int {
    if looper.is_null() {
        return libc::EINVAL;
    }
    match GLooper::looper(looper).run_with_deadline(deadline_from_c(deadline)) {
        Ok(status) => status.errno(),
        Err(e) => {
            warn!("looper_runWithDeadline: {}", e);
            e.errno()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn looper_runWithTimeout(looper: *mut GLooper, timeout: Duration) -> c_int {
    if looper.is_null() {
        return libc::EINVAL;
    }
    match GLooper::looper(looper).run_with_timeout(timeout_from_c(timeout)) {
        Ok(status) => status.errno(),
        Err(e) => {
            warn!("looper_runWithTimeout: {}", e);
            e.errno()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn looper_run(looper: *mut GLooper) {
    looper_runWithDeadline(looper, DURATION_INFINITE);
}

#[no_mangle]
pub unsafe extern "C" fn looper_forceQuit(looper: *mut GLooper) {
    if !looper.is_null() {
        GLooper::looper(looper).force_quit();
    }
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

unsafe fn timer_parts<'a>(timer: *mut LoopTimer) -> Option<(&'a mut dyn Looper, TimerId)> {
    let t = timer.as_ref()?;
    Some((GLooper::looper(t.owner), t.id?))
}

#[no_mangle]
pub unsafe extern "C" fn loopTimer_newWithClock(
    looper: *mut GLooper,
    callback: LoopTimerFunc,
    opaque: *mut c_void,
    clock: c_int,
) -> *mut LoopTimer {
    let Some(func) = callback else { return ptr::null_mut() };
    if looper.is_null() {
        return ptr::null_mut();
    }
    let handle = Box::into_raw(Box::new(LoopTimer { owner: looper, id: None }));
    let owner = looper as *const GLooper;
    let id = GLooper::looper(looper).create_timer(
        ClockType::from_raw(clock),
        Box::new(move |running, _| GLooper::dispatch(owner, running, || func(opaque, handle))),
    );
    (*handle).id = Some(id);
    handle
}

#[no_mangle]
pub unsafe extern "C" fn loopTimer_new(
    looper: *mut GLooper,
    callback: LoopTimerFunc,
    opaque: *mut c_void,
) -> *mut LoopTimer {
    loopTimer_newWithClock(looper, callback, opaque, LOOPER_CLOCK_HOST)
}

#[no_mangle]
pub unsafe extern "C" fn loopTimer_startRelative(timer: *mut LoopTimer, timeout: Duration) {
    if let Some((looper, id)) = timer_parts(timer) {
        report("loopTimer_startRelative", looper.start_timer_relative(id, timeout_from_c(timeout)));
    }
}

#[no_mangle]
pub unsafe extern "C" fn loopTimer_startAbsolute(timer: *mut LoopTimer, deadline: Duration) {
    if let Some((looper, id)) = timer_parts(timer) {
        let result = match deadline_from_c(deadline) {
            Some(at) => looper.start_timer_absolute(id, at),
            None => looper.stop_timer(id),
        };
        report("loopTimer_startAbsolute", result);
    }
}

#[no_mangle]
pub unsafe extern "C" fn loopTimer_stop(timer: *mut LoopTimer) {
    if let Some((looper, id)) = timer_parts(timer) {
        report("loopTimer_stop", looper.stop_timer(id));
    }
}

#[no_mangle]
pub unsafe extern "C" fn loopTimer_isActive(timer: *mut LoopTimer) -> c_int {
    match timer_parts(timer) {
        Some((looper, id)) => looper.is_timer_active(id) as c_int,
        None => 0,
    }
}

#[no_mangle]
pub unsafe extern "C" fn loopTimer_free(timer: *mut LoopTimer) {
    if let Some((looper, id)) = timer_parts(timer) {
        report("loopTimer_free", looper.destroy_timer(id));
    }
    if !timer.is_null() {
        drop(Box::from_raw(timer));
    }
}

// ---------------------------------------------------------------------------
// I/O watches
// ---------------------------------------------------------------------------

unsafe fn io_parts<'a>(io: *mut LoopIo) -> Option<(&'a mut dyn Looper, WatchId)> {
    let w = io.as_ref()?;
    Some((GLooper::looper(w.owner), w.id?))
}

/// Watches `fd`, initially with no interest. Returns null if the fd is
/// already watched by this looper.
#[no_mangle]
pub unsafe extern "C" fn loopIo_new(
    looper: *mut GLooper,
    fd: c_int,
    callback: LoopIoFunc,
    opaque: *mut c_void,
) -> *mut LoopIo {
    let Some(func) = callback else { return ptr::null_mut() };
    if looper.is_null() {
        return ptr::null_mut();
    }
    let owner = looper as *const GLooper;
    let created = GLooper::looper(looper).create_fd_watch(
        fd,
        Box::new(move |running, _, fd, events| {
            GLooper::dispatch(owner, running, || func(opaque, fd, events.bits()))
        }),
    );
    match created {
        Ok(id) => Box::into_raw(Box::new(LoopIo { owner: looper, fd, id: Some(id) })),
        Err(e) => {
            warn!("loopIo_new: {}", e);
            ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn loopIo_wantRead(io: *mut LoopIo) {
    if let Some((looper, id)) = io_parts(io) {
        report("loopIo_wantRead", looper.want_read(id));
    }
}

#[no_mangle]
pub unsafe extern "C" fn loopIo_wantWrite(io: *mut LoopIo) {
    if let Some((looper, id)) = io_parts(io) {
        report("loopIo_wantWrite", looper.want_write(id));
    }
}

#[no_mangle]
pub unsafe extern "C" fn loopIo_dontWantRead(io: *mut LoopIo) {
    if let Some((looper, id)) = io_parts(io) {
        report("loopIo_dontWantRead", looper.dont_want_read(id));
    }
}

#[no_mangle]
pub unsafe extern "C" fn loopIo_dontWantWrite(io: *mut LoopIo) {
    if let Some((looper, id)) = io_parts(io) {
        report("loopIo_dontWantWrite", looper.dont_want_write(id));
    }
}

/// Pending (not yet delivered) `LOOP_IO_*` events.
#[no_mangle]
pub unsafe extern "C" fn loopIo_poll(io: *mut LoopIo) -> c_uint {
    match io_parts(io) {
        Some((looper, id)) => looper.poll_fd_watch(id).map(Interest::bits).unwrap_or(0),
        None => 0,
    }
}

#[no_mangle]
pub unsafe extern "C" fn loopIo_fd(io: *mut LoopIo) -> c_int {
    io.as_ref().map_or(-1, |w| w.fd)
}

/// Stops watching; the fd itself is left open.
#[no_mangle]
pub unsafe extern "C" fn loopIo_free(io: *mut LoopIo) {
    if let Some((looper, id)) = io_parts(io) {
        report("loopIo_free", looper.destroy_fd_watch(id));
    }
    if !io.is_null() {
        drop(Box::from_raw(io));
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

unsafe fn task_parts<'a>(task: *mut LoopTask) -> Option<(&'a mut dyn Looper, TaskId)> {
    let t = task.as_ref()?;
    Some((GLooper::looper(t.owner), t.id?))
}

#[no_mangle]
pub unsafe extern "C" fn loopTask_new(
    looper: *mut GLooper,
    callback: LoopTaskFunc,
    opaque: *mut c_void,
) -> *mut LoopTask {
    let Some(func) = callback else { return ptr::null_mut() };
    if looper.is_null() {
        return ptr::null_mut();
    }
    let handle = Box::into_raw(Box::new(LoopTask { owner: looper, id: None }));
    let owner = looper as *const GLooper;
    let id = GLooper::looper(looper).create_task(Box::new(move |running, _| {
        GLooper::dispatch(owner, running, || func(opaque, handle))
    }));
    (*handle).id = Some(id);
    handle
}

#[no_mangle]
pub unsafe extern "C" fn loopTask_schedule(task: *mut LoopTask) {
    if let Some((looper, id)) = task_parts(task) {
        report("loopTask_schedule", looper.schedule_task(id));
    }
}

#[no_mangle]
pub unsafe extern "C" fn loopTask_cancel(task: *mut LoopTask) {
    if let Some((looper, id)) = task_parts(task) {
        report("loopTask_cancel", looper.cancel_task(id));
    }
}

#[no_mangle]
pub unsafe extern "C" fn loopTask_isScheduled(task: *mut LoopTask) -> c_int {
    match task_parts(task) {
        Some((looper, id)) => looper.is_task_scheduled(id) as c_int,
        None => 0,
    }
}

#[no_mangle]
pub unsafe extern "C" fn loopTask_free(task: *mut LoopTask) {
    if let Some((looper, id)) = task_parts(task) {
        report("loopTask_free", looper.destroy_task(id));
    }
    if !task.is_null() {
        drop(Box::from_raw(task));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_conversions() {
        assert_eq!(deadline_from_c(DURATION_INFINITE), None);
        assert_eq!(deadline_from_c(-5), Some(0));
        assert_eq!(deadline_from_c(42), Some(42));
        assert_eq!(timeout_from_c(DURATION_INFINITE), None);
        assert_eq!(timeout_from_c(-1), Some(StdDuration::ZERO));
        assert_eq!(to_c(u64::MAX), i64::MAX);
    }

    #[test]
    fn interest_bits_match_header() {
        assert_eq!(Interest::READ.bits(), LOOP_IO_READ);
        assert_eq!(Interest::WRITE.bits(), LOOP_IO_WRITE);
        assert_eq!(ClockType::from_raw(LOOPER_CLOCK_REALTIME), ClockType::Realtime);
        assert_eq!(ClockType::from_raw(LOOPER_CLOCK_VIRTUAL), ClockType::Virtual);
        assert_eq!(ClockType::from_raw(LOOPER_CLOCK_HOST), ClockType::Host);
    }

    #[test]
    fn null_handles_are_ignored() {
        unsafe {
            looper_free(ptr::null_mut());
            looper_forceQuit(ptr::null_mut());
            assert!(looper_name(ptr::null_mut()).is_null());
            assert_eq!(looper_runWithTimeout(ptr::null_mut(), 0), libc::EINVAL);
            assert!(loopTimer_new(ptr::null_mut(), None, ptr::null_mut()).is_null());
            loopTimer_stop(ptr::null_mut());
            assert_eq!(loopTimer_isActive(ptr::null_mut()), 0);
            loopTimer_free(ptr::null_mut());
            assert_eq!(loopIo_fd(ptr::null_mut()), -1);
            assert_eq!(loopIo_poll(ptr::null_mut()), 0);
            loopIo_free(ptr::null_mut());
            loopTask_schedule(ptr::null_mut());
            loopTask_free(ptr::null_mut());
        }
    }
}
