//! Platform-agnostic looper built on any [`Poller`].
//!
//! Armed timers are kept in a set ordered by host deadline, so the next
//! poll timeout is the distance to the first entry. Fd watches are only
//! registered with the poller while their interest set is non-empty.
//! Callbacks are taken out of their entry while they run, which lets them
//! destroy their own handle; ids are never reused, so a callback is only
//! put back into the entry it came from.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::mem;
use std::os::unix::io::RawFd;

use log::{debug, error, trace};

use crate::clock::{self, ClockType};
use crate::config::LooperConfig;
use crate::error::{LooperError, Result};
use crate::looper::{
    FdCallback, Looper, RunStatus, TaskCallback, TaskId, TimerCallback, TimerId, WatchId,
};
use crate::os::{DefaultPoller, Event, Interest, Poller, Token};

pub const DEFAULT_NAME: &str = "Generic";
pub const DEFAULT_MAX_EVENTS: usize = 1024;

struct TimerEntry {
    clock: ClockType,
    /// `(host deadline, arm sequence)` while armed; also the key in `active`.
    armed: Option<(u64, u64)>,
    /// Expired in the current iteration and not yet dispatched.
    pending: bool,
    callback: Option<TimerCallback>,
}

struct WatchEntry {
    fd: RawFd,
    interest: Interest,
    registered: bool,
    pending: Interest,
    callback: Option<FdCallback>,
}

struct TaskEntry {
    /// Sequence of the live queue entry; stale entries left in a drained
    /// batch by cancel/reschedule carry an older one and are skipped.
    queued: Option<u64>,
    callback: Option<TaskCallback>,
}

pub struct GenericLooper<P: Poller = DefaultPoller> {
    name: String,
    poller: P,
    events: Vec<Event>,
    timers: HashMap<TimerId, TimerEntry>,
    active: BTreeSet<(u64, u64, TimerId)>,
    watches: HashMap<WatchId, WatchEntry>,
    fds: HashMap<RawFd, WatchId>,
    tasks: HashMap<TaskId, TaskEntry>,
    scheduled: VecDeque<(TaskId, u64)>,
    next_id: u64,
    next_seq: u64,
    quit: bool,
    running: bool,
}

impl GenericLooper<DefaultPoller> {
    /// Looper on the platform default poller.
    pub fn new() -> Result<Self> {
        Ok(Self::with_poller(crate::os::default_poller()?))
    }
}

impl<P: Poller> GenericLooper<P> {
    pub fn with_poller(poller: P) -> Self {
        Self::build(poller, DEFAULT_NAME.to_string(), DEFAULT_MAX_EVENTS)
    }

    pub fn with_config(poller: P, config: &LooperConfig) -> Self {
        Self::build(poller, config.name.clone(), config.max_events)
    }

    fn build(poller: P, name: String, max_events: usize) -> Self {
        debug!("creating looper {:?} on {} ({} events)", name, poller.name(), max_events);
        GenericLooper {
            name,
            poller,
            events: vec![Event::default(); max_events.max(1)],
            timers: HashMap::new(),
            active: BTreeSet::new(),
            watches: HashMap::new(),
            fds: HashMap::new(),
            tasks: HashMap::new(),
            scheduled: VecDeque::new(),
            next_id: 1, // 0 is reserved
            next_seq: 0,
            quit: false,
            running: false,
        }
    }

    /// Name of the poller backend.
    pub fn backend(&self) -> &'static str {
        self.poller.name()
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn has_work(&self) -> bool {
        !self.active.is_empty()
            || !self.scheduled.is_empty()
            || self.watches.values().any(|w| !w.interest.is_empty())
    }

    fn set_interest(&mut self, id: WatchId, interest: Interest) -> Result<()> {
        let w = self.watches.get_mut(&id).ok_or(LooperError::UnknownWatch(id))?;
        if w.interest == interest {
            return Ok(());
        }
        let token = id.0 as Token;
        match (w.registered, interest.is_empty()) {
            (false, false) => {
                self.poller.add(w.fd, token, interest)?;
                w.registered = true;
            }
            (true, false) => self.poller.modify(w.fd, token, interest)?,
            (true, true) => {
                self.poller.delete(w.fd)?;
                w.registered = false;
            }
            (false, true) => {}
        }
        debug!("watch {:?} (fd {}) interest {:?} -> {:?}", id, w.fd, w.interest, interest);
        w.interest = interest;
        w.pending = w.pending & interest;
        Ok(())
    }

    fn run_loop(&mut self, deadline_ms: Option<u64>) -> Result<RunStatus> {
        loop {
            if self.quit {
                return Ok(RunStatus::Quit);
            }
            if !self.has_work() {
                return Ok(RunStatus::WouldBlock);
            }
            self.run_once(deadline_ms)?;
            if let Some(deadline) = deadline_ms {
                if self.quit {
                    return Ok(RunStatus::Quit);
                }
                if clock::now_ms(ClockType::Host) >= deadline {
                    return Ok(RunStatus::TimedOut);
                }
            }
        }
    }

    fn poll_timeout(&self, now: u64, deadline_ms: Option<u64>) -> isize {
        if !self.scheduled.is_empty() {
            return 0;
        }
        let next_timer = self.active.first().map(|key| key.0);
        match next_timer.into_iter().chain(deadline_ms).min() {
            None => -1,
            Some(at) => at.saturating_sub(now).min(isize::MAX as u64) as isize,
        }
    }

    fn run_once(&mut self, deadline_ms: Option<u64>) -> Result<()> {
        let timeout_ms = self.poll_timeout(clock::now_ms(ClockType::Host), deadline_ms);
        let n = match self.poller.wait(&mut self.events, timeout_ms) {
            Ok(n) => n,
            Err(e) => {
                error!("looper {:?}: {} wait failed: {}", self.name, self.poller.name(), e);
                return Err(e.into());
            }
        };

        let mut ready = Vec::new();
        for ev in &self.events[..n] {
            let id = WatchId(ev.token as u64);
            if let Some(w) = self.watches.get_mut(&id) {
                let got = ev.interest() & w.interest;
                if got.is_empty() {
                    continue;
                }
                if w.pending.is_empty() {
                    ready.push(id);
                }
                w.pending |= got;
            }
        }

        let now = clock::now_ms(ClockType::Host);
        let mut expired = Vec::new();
        while self.active.first().map_or(false, |key| key.0 <= now) {
            let Some((_, _, id)) = self.active.pop_first() else { break };
            if let Some(t) = self.timers.get_mut(&id) {
                t.armed = None;
                t.pending = true;
                expired.push(id);
            }
        }

        for id in ready {
            self.fire_watch(id);
        }
        for id in expired {
            self.fire_timer(id);
        }
        let batch: Vec<(TaskId, u64)> = self.scheduled.drain(..).collect();
        for (id, seq) in batch {
            self.fire_task(id, seq);
        }
        Ok(())
    }

    fn fire_watch(&mut self, id: WatchId) {
        let (fd, events, mut callback) = match self.watches.get_mut(&id) {
            Some(w) => {
                let events = mem::take(&mut w.pending) & w.interest;
                match w.callback.take() {
                    Some(cb) if !events.is_empty() => (w.fd, events, cb),
                    Some(cb) => {
                        w.callback = Some(cb);
                        return;
                    }
                    None => return,
                }
            }
            None => return,
        };
        trace!("dispatch watch {:?} fd {} {:?}", id, fd, events);
        let looper: &mut dyn Looper = &mut *self;
        callback(looper, id, fd, events);
        if let Some(w) = self.watches.get_mut(&id) {
            w.callback.get_or_insert(callback);
        }
    }

    fn fire_timer(&mut self, id: TimerId) {
        let mut callback = match self.timers.get_mut(&id) {
            Some(t) if t.pending => {
                t.pending = false;
                match t.callback.take() {
                    Some(cb) => cb,
                    None => return,
                }
            }
            _ => return,
        };
        trace!("dispatch timer {:?}", id);
        let looper: &mut dyn Looper = &mut *self;
        callback(looper, id);
        if let Some(t) = self.timers.get_mut(&id) {
            t.callback.get_or_insert(callback);
        }
    }

    fn fire_task(&mut self, id: TaskId, seq: u64) {
        let mut callback = match self.tasks.get_mut(&id) {
            Some(t) if t.queued == Some(seq) => {
                t.queued = None;
                match t.callback.take() {
                    Some(cb) => cb,
                    None => return,
                }
            }
            _ => return,
        };
        trace!("dispatch task {:?}", id);
        let looper: &mut dyn Looper = &mut *self;
        callback(looper, id);
        if let Some(t) = self.tasks.get_mut(&id) {
            t.callback.get_or_insert(callback);
        }
    }
}

impl<P: Poller> Looper for GenericLooper<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_timer(&mut self, clock: ClockType, callback: TimerCallback) -> TimerId {
        let id = TimerId(self.alloc_id());
        self.timers.insert(id, TimerEntry { clock, armed: None, pending: false, callback: Some(callback) });
        debug!("created timer {:?} on {:?} clock", id, clock);
        id
    }

    fn start_timer_absolute(&mut self, timer: TimerId, deadline_ms: u64) -> Result<()> {
        let t = self.timers.get_mut(&timer).ok_or(LooperError::UnknownTimer(timer))?;
        let host_deadline = match t.clock {
            ClockType::Realtime => {
                let remaining = deadline_ms.saturating_sub(clock::now_ms(ClockType::Realtime));
                clock::now_ms(ClockType::Host).saturating_add(remaining)
            }
            ClockType::Virtual | ClockType::Host => deadline_ms,
        };
        if let Some((at, seq)) = t.armed.take() {
            self.active.remove(&(at, seq, timer));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        t.armed = Some((host_deadline, seq));
        t.pending = false;
        self.active.insert((host_deadline, seq, timer));
        trace!("timer {:?} armed for {}", timer, host_deadline);
        Ok(())
    }

    fn stop_timer(&mut self, timer: TimerId) -> Result<()> {
        let t = self.timers.get_mut(&timer).ok_or(LooperError::UnknownTimer(timer))?;
        if let Some((at, seq)) = t.armed.take() {
            self.active.remove(&(at, seq, timer));
        }
        t.pending = false;
        Ok(())
    }

    fn is_timer_active(&self, timer: TimerId) -> bool {
        self.timers.get(&timer).map_or(false, |t| t.armed.is_some())
    }

    fn timer_clock(&self, timer: TimerId) -> Result<ClockType> {
        self.timers.get(&timer).map(|t| t.clock).ok_or(LooperError::UnknownTimer(timer))
    }

    fn destroy_timer(&mut self, timer: TimerId) -> Result<()> {
        let t = self.timers.remove(&timer).ok_or(LooperError::UnknownTimer(timer))?;
        if let Some((at, seq)) = t.armed {
            self.active.remove(&(at, seq, timer));
        }
        debug!("destroyed timer {:?}", timer);
        Ok(())
    }

    fn create_fd_watch(&mut self, fd: RawFd, callback: FdCallback) -> Result<WatchId> {
        if self.fds.contains_key(&fd) {
            return Err(LooperError::FdAlreadyWatched(fd));
        }
        let id = WatchId(self.alloc_id());
        self.watches.insert(
            id,
            WatchEntry {
                fd,
                interest: Interest::NONE,
                registered: false,
                pending: Interest::NONE,
                callback: Some(callback),
            },
        );
        self.fds.insert(fd, id);
        debug!("created watch {:?} for fd {}", id, fd);
        Ok(id)
    }

    fn add_interest(&mut self, watch: WatchId, interest: Interest) -> Result<()> {
        let current = self.interest(watch)?;
        self.set_interest(watch, current | interest)
    }

    fn remove_interest(&mut self, watch: WatchId, interest: Interest) -> Result<()> {
        let current = self.interest(watch)?;
        self.set_interest(watch, current & !interest)
    }

    fn interest(&self, watch: WatchId) -> Result<Interest> {
        self.watches.get(&watch).map(|w| w.interest).ok_or(LooperError::UnknownWatch(watch))
    }

    fn watched_fd(&self, watch: WatchId) -> Result<RawFd> {
        self.watches.get(&watch).map(|w| w.fd).ok_or(LooperError::UnknownWatch(watch))
    }

    fn poll_fd_watch(&self, watch: WatchId) -> Result<Interest> {
        self.watches.get(&watch).map(|w| w.pending).ok_or(LooperError::UnknownWatch(watch))
    }

    fn destroy_fd_watch(&mut self, watch: WatchId) -> Result<()> {
        let w = self.watches.remove(&watch).ok_or(LooperError::UnknownWatch(watch))?;
        self.fds.remove(&w.fd);
        if w.registered {
            // The fd may already be closed, in which case the kernel dropped it.
            if let Err(e) = self.poller.delete(w.fd) {
                debug!("deregistering fd {} of watch {:?}: {}", w.fd, watch, e);
            }
        }
        debug!("destroyed watch {:?} for fd {}", watch, w.fd);
        Ok(())
    }

    fn create_task(&mut self, callback: TaskCallback) -> TaskId {
        let id = TaskId(self.alloc_id());
        self.tasks.insert(id, TaskEntry { queued: None, callback: Some(callback) });
        id
    }

    fn schedule_task(&mut self, task: TaskId) -> Result<()> {
        let t = self.tasks.get_mut(&task).ok_or(LooperError::UnknownTask(task))?;
        if t.queued.is_none() {
            let seq = self.next_seq;
            self.next_seq += 1;
            t.queued = Some(seq);
            self.scheduled.push_back((task, seq));
        }
        Ok(())
    }

    fn cancel_task(&mut self, task: TaskId) -> Result<()> {
        let t = self.tasks.get_mut(&task).ok_or(LooperError::UnknownTask(task))?;
        if t.queued.take().is_some() {
            self.scheduled.retain(|(id, _)| *id != task);
        }
        Ok(())
    }

    fn is_task_scheduled(&self, task: TaskId) -> bool {
        self.tasks.get(&task).map_or(false, |t| t.queued.is_some())
    }

    fn destroy_task(&mut self, task: TaskId) -> Result<()> {
        let t = self.tasks.remove(&task).ok_or(LooperError::UnknownTask(task))?;
        if t.queued.is_some() {
            self.scheduled.retain(|(id, _)| *id != task);
        }
        Ok(())
    }

    fn run_with_deadline(&mut self, deadline_ms: Option<u64>) -> Result<RunStatus> {
        if self.running {
            return Err(LooperError::AlreadyRunning);
        }
        self.running = true;
        self.quit = false;
        let status = self.run_loop(deadline_ms);
        self.running = false;
        debug!("looper {:?} run finished: {:?}", self.name, status);
        status
    }

    fn force_quit(&mut self) {
        self.quit = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::PollSet;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    fn looper() -> GenericLooper<PollSet> {
        GenericLooper::with_poller(PollSet::new().unwrap())
    }

    #[test]
    fn empty_looper_would_block() {
        let mut l = looper();
        assert_eq!(l.name(), DEFAULT_NAME);
        assert_eq!(l.run().unwrap(), RunStatus::WouldBlock);
    }

    #[test]
    fn poll_timeout_prefers_earliest() {
        let mut l = looper();
        assert_eq!(l.poll_timeout(100, None), -1);
        assert_eq!(l.poll_timeout(100, Some(150)), 50);
        assert_eq!(l.poll_timeout(100, Some(50)), 0);

        let t = l.create_timer(ClockType::Host, Box::new(|_, _| {}));
        l.start_timer_absolute(t, 120).unwrap();
        assert_eq!(l.poll_timeout(100, Some(150)), 20);

        let task = l.create_task(Box::new(|_, _| {}));
        l.schedule_task(task).unwrap();
        assert_eq!(l.poll_timeout(100, Some(150)), 0);
    }

    #[test]
    fn ids_are_not_reused() {
        let mut l = looper();
        let a = l.create_timer(ClockType::Host, Box::new(|_, _| {}));
        l.destroy_timer(a).unwrap();
        let b = l.create_timer(ClockType::Host, Box::new(|_, _| {}));
        assert_ne!(a, b);
        assert!(matches!(l.stop_timer(a), Err(LooperError::UnknownTimer(_))));
    }

    #[test]
    fn restart_replaces_previous_deadline() {
        let mut l = looper();
        let t = l.create_timer(ClockType::Host, Box::new(|_, _| {}));
        l.start_timer_absolute(t, u64::MAX - 1).unwrap();
        l.start_timer_relative(t, Some(Duration::from_millis(1))).unwrap();
        assert_eq!(l.active.len(), 1);
        l.start_timer_relative(t, None).unwrap();
        assert!(!l.is_timer_active(t));
        assert!(l.active.is_empty());
    }

    #[test]
    fn callback_survives_self_restart() {
        let mut l = looper();
        let hits = Rc::new(RefCell::new(0));
        let h = hits.clone();
        let t = l.create_timer(
            ClockType::Host,
            Box::new(move |looper, id| {
                *h.borrow_mut() += 1;
                if *h.borrow() < 3 {
                    looper.start_timer_relative(id, Some(Duration::ZERO)).unwrap();
                }
            }),
        );
        l.start_timer_relative(t, Some(Duration::ZERO)).unwrap();
        assert_eq!(l.run().unwrap(), RunStatus::WouldBlock);
        assert_eq!(*hits.borrow(), 3);
    }
}
