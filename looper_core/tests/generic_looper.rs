use std::cell::RefCell;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

use looper_core::{
    create_with_config, Backend, ClockType, Interest, Looper, LooperConfig, LooperError, RunStatus,
};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One looper per backend available on this platform.
fn loopers() -> Vec<Box<dyn Looper>> {
    init_logs();
    [Backend::Auto, Backend::Poll]
        .into_iter()
        .map(|backend| create_with_config(&LooperConfig { backend, ..LooperConfig::default() }).unwrap())
        .collect()
}

type Log = Rc<RefCell<Vec<String>>>;

fn log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

#[test]
fn timers_fire_in_deadline_order() {
    for mut looper in loopers() {
        let seen = log();
        let now = looper.now_ms(ClockType::Host);
        for (label, offset) in [("c", 30), ("a", 10), ("b", 20), ("a2", 10)] {
            let seen = seen.clone();
            let t = looper.create_timer(
                ClockType::Host,
                Box::new(move |_, _| seen.borrow_mut().push(label.to_string())),
            );
            looper.start_timer_absolute(t, now + offset).unwrap();
        }
        assert_eq!(looper.run().unwrap(), RunStatus::WouldBlock);
        assert_eq!(*seen.borrow(), vec!["a", "a2", "b", "c"]);
    }
}

#[test]
fn timer_is_inactive_inside_its_callback() {
    for mut looper in loopers() {
        let observed = Rc::new(RefCell::new(None));
        let o = observed.clone();
        let t = looper.create_timer(
            ClockType::Host,
            Box::new(move |l, id| *o.borrow_mut() = Some(l.is_timer_active(id))),
        );
        looper.start_timer_relative(t, Some(Duration::from_millis(1))).unwrap();
        assert!(looper.is_timer_active(t));
        looper.run().unwrap();
        assert_eq!(*observed.borrow(), Some(false));
        assert!(!looper.is_timer_active(t));
    }
}

#[test]
fn sibling_stop_cancels_pending_expiry() {
    for mut looper in loopers() {
        let seen = log();
        let now = looper.now_ms(ClockType::Host);

        let s = seen.clone();
        let victim = looper.create_timer(ClockType::Host, Box::new(move |_, _| s.borrow_mut().push("victim".into())));
        let s = seen.clone();
        let killer = looper.create_timer(
            ClockType::Host,
            Box::new(move |l, _| {
                s.borrow_mut().push("killer".into());
                l.stop_timer(victim).unwrap();
            }),
        );
        // Both already expired; the killer was armed first so it runs first.
        looper.start_timer_absolute(killer, now.saturating_sub(5)).unwrap();
        looper.start_timer_absolute(victim, now.saturating_sub(5)).unwrap();

        looper.run().unwrap();
        assert_eq!(*seen.borrow(), vec!["killer"]);
    }
}

#[test]
fn timer_can_destroy_itself() {
    for mut looper in loopers() {
        let hits = Rc::new(RefCell::new(0));
        let h = hits.clone();
        let t = looper.create_timer(
            ClockType::Host,
            Box::new(move |l, id| {
                *h.borrow_mut() += 1;
                l.destroy_timer(id).unwrap();
            }),
        );
        looper.start_timer_relative(t, Some(Duration::ZERO)).unwrap();
        looper.run().unwrap();
        assert_eq!(*hits.borrow(), 1);
        assert!(matches!(looper.destroy_timer(t), Err(LooperError::UnknownTimer(_))));
    }
}

#[test]
fn realtime_timer_fires() {
    for mut looper in loopers() {
        let fired = Rc::new(RefCell::new(false));
        let f = fired.clone();
        let t = looper.create_timer(ClockType::Realtime, Box::new(move |_, _| *f.borrow_mut() = true));
        assert_eq!(looper.timer_clock(t).unwrap(), ClockType::Realtime);
        let deadline = looper.now_ms(ClockType::Realtime) + 5;
        looper.start_timer_absolute(t, deadline).unwrap();
        looper.run().unwrap();
        assert!(*fired.borrow());
    }
}

#[test]
fn run_with_timeout_times_out() {
    for mut looper in loopers() {
        let t = looper.create_timer(ClockType::Host, Box::new(|_, _| {}));
        looper.start_timer_relative(t, Some(Duration::from_secs(60))).unwrap();

        let start = Instant::now();
        let status = looper.run_with_timeout(Some(Duration::from_millis(20))).unwrap();
        assert_eq!(status, RunStatus::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(15));
        assert!(start.elapsed() < Duration::from_secs(30));
        assert!(looper.is_timer_active(t));
    }
}

#[test]
fn zero_timeout_polls_once() {
    for mut looper in loopers() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let got = Rc::new(RefCell::new(Interest::NONE));
        let g = got.clone();
        let w = looper
            .create_fd_watch(a.as_raw_fd(), Box::new(move |_, _, _, ev| *g.borrow_mut() = ev))
            .unwrap();
        looper.want_read(w).unwrap();
        b.write_all(b"!").unwrap();

        assert_eq!(looper.run_with_timeout(Some(Duration::ZERO)).unwrap(), RunStatus::TimedOut);
        assert_eq!(*got.borrow(), Interest::READ);
    }
}

#[test]
fn force_quit_from_callback() {
    for mut looper in loopers() {
        let forever = looper.create_timer(ClockType::Host, Box::new(|_, _| {}));
        looper.start_timer_relative(forever, Some(Duration::from_secs(3600))).unwrap();
        let quitter = looper.create_timer(ClockType::Host, Box::new(|l, _| l.force_quit()));
        looper.start_timer_relative(quitter, Some(Duration::from_millis(2))).unwrap();

        assert_eq!(looper.run().unwrap(), RunStatus::Quit);
        // The flag is reset by the next run.
        assert_eq!(looper.run_with_timeout(Some(Duration::ZERO)).unwrap(), RunStatus::TimedOut);
    }
}

#[test]
fn nested_run_is_rejected() {
    for mut looper in loopers() {
        let nested = Rc::new(RefCell::new(None));
        let n = nested.clone();
        let t = looper.create_timer(
            ClockType::Host,
            Box::new(move |l, _| {
                *n.borrow_mut() = Some(matches!(l.run_with_timeout(Some(Duration::ZERO)), Err(LooperError::AlreadyRunning)));
            }),
        );
        looper.start_timer_relative(t, Some(Duration::ZERO)).unwrap();
        looper.run().unwrap();
        assert_eq!(*nested.borrow(), Some(true));
    }
}

#[test]
fn fd_watch_echoes_between_peers() {
    for mut looper in loopers() {
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let a = Rc::new(RefCell::new(a));
        let buffer = Rc::new(RefCell::new(Vec::new()));

        let (sock, buf) = (a.clone(), buffer.clone());
        let fd = a.borrow().as_raw_fd();
        let w = looper
            .create_fd_watch(
                fd,
                Box::new(move |l, id, _, events| {
                    if events.is_readable() {
                        let mut chunk = [0u8; 64];
                        let n = sock.borrow_mut().read(&mut chunk).unwrap();
                        buf.borrow_mut().extend_from_slice(&chunk[..n]);
                        l.dont_want_read(id).unwrap();
                        l.want_write(id).unwrap();
                    }
                    if events.is_writable() {
                        let data = std::mem::take(&mut *buf.borrow_mut());
                        sock.borrow_mut().write_all(&data).unwrap();
                        l.destroy_fd_watch(id).unwrap();
                    }
                }),
            )
            .unwrap();
        assert_eq!(looper.watched_fd(w).unwrap(), fd);
        looper.want_read(w).unwrap();
        assert_eq!(looper.interest(w).unwrap(), Interest::READ);

        b.write_all(b"hello").unwrap();
        assert_eq!(looper.run().unwrap(), RunStatus::WouldBlock);

        let mut reply = [0u8; 5];
        b.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"hello");
    }
}

#[test]
fn peer_close_is_delivered_as_read() {
    for mut looper in loopers() {
        let (a, b) = UnixStream::pair().unwrap();
        let events = Rc::new(RefCell::new(Vec::new()));
        let e = events.clone();
        let w = looper
            .create_fd_watch(
                a.as_raw_fd(),
                Box::new(move |l, id, _, ev| {
                    e.borrow_mut().push(ev);
                    l.destroy_fd_watch(id).unwrap();
                }),
            )
            .unwrap();
        looper.want_read(w).unwrap();
        drop(b);
        looper.run().unwrap();
        assert_eq!(*events.borrow(), vec![Interest::READ]);
    }
}

#[test]
fn only_interested_events_are_delivered() {
    for mut looper in loopers() {
        // A fresh socket is writable but has nothing to read.
        let (a, _b) = UnixStream::pair().unwrap();
        let fired = Rc::new(RefCell::new(false));
        let f = fired.clone();
        let w = looper
            .create_fd_watch(a.as_raw_fd(), Box::new(move |_, _, _, _| *f.borrow_mut() = true))
            .unwrap();
        looper.want_read(w).unwrap();
        assert_eq!(looper.run_with_timeout(Some(Duration::from_millis(10))).unwrap(), RunStatus::TimedOut);
        assert!(!*fired.borrow());
        assert_eq!(looper.poll_fd_watch(w).unwrap(), Interest::NONE);

        looper.dont_want_read(w).unwrap();
        assert_eq!(looper.run().unwrap(), RunStatus::WouldBlock);
    }
}

#[test]
fn one_watch_per_fd() {
    for mut looper in loopers() {
        let (a, _b) = UnixStream::pair().unwrap();
        let w = looper.create_fd_watch(a.as_raw_fd(), Box::new(|_, _, _, _| {})).unwrap();
        assert!(matches!(
            looper.create_fd_watch(a.as_raw_fd(), Box::new(|_, _, _, _| {})),
            Err(LooperError::FdAlreadyWatched(_))
        ));
        looper.want_write(w).unwrap();
        looper.destroy_fd_watch(w).unwrap();
        assert!(looper.create_fd_watch(a.as_raw_fd(), Box::new(|_, _, _, _| {})).is_ok());
        assert!(matches!(looper.want_read(w), Err(LooperError::UnknownWatch(_))));
    }
}

#[test]
fn tasks_run_fifo_once_per_schedule() {
    for mut looper in loopers() {
        let seen = log();
        let mut ids = Vec::new();
        for label in ["first", "second", "third"] {
            let s = seen.clone();
            ids.push(looper.create_task(Box::new(move |_, _| s.borrow_mut().push(label.into()))));
        }
        looper.schedule_task(ids[1]).unwrap();
        looper.schedule_task(ids[0]).unwrap();
        looper.schedule_task(ids[1]).unwrap();
        looper.schedule_task(ids[2]).unwrap();
        looper.cancel_task(ids[2]).unwrap();
        assert!(looper.is_task_scheduled(ids[0]));
        assert!(!looper.is_task_scheduled(ids[2]));

        assert_eq!(looper.run().unwrap(), RunStatus::WouldBlock);
        assert_eq!(*seen.borrow(), vec!["second", "first"]);
        assert!(!looper.is_task_scheduled(ids[0]));
    }
}

#[test]
fn task_rescheduling_defers_to_next_iteration() {
    for mut looper in loopers() {
        let count = Rc::new(RefCell::new(0));
        let c = count.clone();
        let task = looper.create_task(Box::new(move |l, id| {
            *c.borrow_mut() += 1;
            if *c.borrow() < 5 {
                l.schedule_task(id).unwrap();
            } else {
                l.destroy_task(id).unwrap();
            }
        }));
        looper.schedule_task(task).unwrap();

        // One iteration dispatches exactly one run of the task.
        looper.run_with_timeout(Some(Duration::ZERO)).unwrap();
        assert_eq!(*count.borrow(), 1);
        assert_eq!(looper.run().unwrap(), RunStatus::WouldBlock);
        assert_eq!(*count.borrow(), 5);
        assert!(matches!(looper.schedule_task(task), Err(LooperError::UnknownTask(_))));
    }
}

#[test]
fn cancelled_task_is_skipped_even_if_rescheduled() {
    for mut looper in loopers() {
        let seen = log();
        let s = seen.clone();
        let b = looper.create_task(Box::new(move |_, _| s.borrow_mut().push("B".into())));
        let s = seen.clone();
        let a = looper.create_task(Box::new(move |l, _| {
            s.borrow_mut().push("A".into());
            l.cancel_task(b).unwrap();
            l.schedule_task(b).unwrap();
        }));
        looper.schedule_task(a).unwrap();
        looper.schedule_task(b).unwrap();

        looper.run_with_timeout(Some(Duration::ZERO)).unwrap();
        assert_eq!(*seen.borrow(), vec!["A"]);
        assert!(looper.is_task_scheduled(b));

        looper.run_with_timeout(Some(Duration::ZERO)).unwrap();
        assert_eq!(*seen.borrow(), vec!["A", "B"]);
        assert_eq!(looper.run().unwrap(), RunStatus::WouldBlock);
        assert_eq!(*seen.borrow(), vec!["A", "B"]);
    }
}

#[test]
fn requeued_tasks_keep_schedule_order() {
    for mut looper in loopers() {
        let seen = log();
        let s = seen.clone();
        let b = looper.create_task(Box::new(move |_, _| s.borrow_mut().push("B".into())));
        let s = seen.clone();
        let c = looper.create_task(Box::new(move |_, _| s.borrow_mut().push("C".into())));
        let s = seen.clone();
        let a = looper.create_task(Box::new(move |l, _| {
            s.borrow_mut().push("A".into());
            l.cancel_task(b).unwrap();
            l.schedule_task(b).unwrap();
        }));
        let s = seen.clone();
        let d = looper.create_task(Box::new(move |l, _| {
            s.borrow_mut().push("D".into());
            l.cancel_task(b).unwrap();
            l.schedule_task(c).unwrap();
            l.schedule_task(b).unwrap();
        }));
        for id in [a, b, d] {
            looper.schedule_task(id).unwrap();
        }

        looper.run_with_timeout(Some(Duration::ZERO)).unwrap();
        assert_eq!(*seen.borrow(), vec!["A", "D"]);

        seen.borrow_mut().clear();
        assert_eq!(looper.run().unwrap(), RunStatus::WouldBlock);
        assert_eq!(*seen.borrow(), vec!["C", "B"]);
    }
}

#[test]
fn sibling_destroy_cancels_pending_expiry() {
    for mut looper in loopers() {
        let seen = log();
        let now = looper.now_ms(ClockType::Host);

        let s = seen.clone();
        let victim = looper.create_timer(ClockType::Host, Box::new(move |_, _| s.borrow_mut().push("victim".into())));
        let s = seen.clone();
        let killer = looper.create_timer(
            ClockType::Host,
            Box::new(move |l, _| {
                s.borrow_mut().push("killer".into());
                l.destroy_timer(victim).unwrap();
            }),
        );
        looper.start_timer_absolute(killer, now.saturating_sub(5)).unwrap();
        looper.start_timer_absolute(victim, now.saturating_sub(5)).unwrap();

        assert_eq!(looper.run().unwrap(), RunStatus::WouldBlock);
        assert_eq!(*seen.borrow(), vec!["killer"]);
        assert!(matches!(looper.stop_timer(victim), Err(LooperError::UnknownTimer(_))));
    }
}

#[test]
fn watch_destroyed_by_sibling_is_skipped() {
    for mut looper in loopers() {
        // Two writable sockets are ready in the same iteration; whichever
        // fires first destroys the other.
        let (a, _a_peer) = UnixStream::pair().unwrap();
        let (b, _b_peer) = UnixStream::pair().unwrap();
        let fired = log();
        let other = Rc::new(RefCell::new(Vec::new()));

        let mut ids = Vec::new();
        for (label, sock) in [("a", &a), ("b", &b)] {
            let (f, o) = (fired.clone(), other.clone());
            let id = looper
                .create_fd_watch(
                    sock.as_raw_fd(),
                    Box::new(move |l, id, _, _| {
                        f.borrow_mut().push(label.to_string());
                        for victim in o.borrow().iter().filter(|w| **w != id) {
                            l.destroy_fd_watch(*victim).unwrap();
                        }
                        l.destroy_fd_watch(id).unwrap();
                    }),
                )
                .unwrap();
            looper.want_write(id).unwrap();
            ids.push(id);
        }
        *other.borrow_mut() = ids;

        assert_eq!(looper.run().unwrap(), RunStatus::WouldBlock);
        assert_eq!(fired.borrow().len(), 1);
    }
}
