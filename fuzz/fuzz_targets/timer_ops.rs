#![no_main]
use std::time::Duration;

use libfuzzer_sys::fuzz_target;
use looper_core::os::PollSet;
use looper_core::{ClockType, GenericLooper, Looper, RunStatus, TimerId};

// Each byte pair is one operation on a small pool of timers; deadlines stay
// within a few milliseconds so every input finishes quickly.
fuzz_target!(|data: &[u8]| {
    let Ok(poller) = PollSet::new() else { return };
    let mut looper = GenericLooper::with_poller(poller);
    let mut timers: Vec<TimerId> = Vec::new();

    for op in data.chunks(2).take(256) {
        let arg = op.get(1).copied().unwrap_or(0);
        let pick = |timers: &[TimerId]| timers.get(arg as usize % timers.len().max(1)).copied();
        match op[0] % 6 {
            0 => timers.push(looper.create_timer(
                ClockType::Host,
                Box::new(move |l, id| {
                    if arg % 3 == 0 {
                        let _ = l.start_timer_relative(id, Some(Duration::ZERO));
                        let _ = l.destroy_timer(id);
                    }
                }),
            )),
            1 => if let Some(t) = pick(&timers) {
                let _ = looper.start_timer_relative(t, Some(Duration::from_millis((arg % 4) as u64)));
            },
            2 => if let Some(t) = pick(&timers) {
                let _ = looper.stop_timer(t);
            },
            3 => if let Some(t) = pick(&timers) {
                let _ = looper.destroy_timer(t);
            },
            4 => {
                let status = looper.run_with_timeout(Some(Duration::ZERO)).unwrap();
                assert_ne!(status, RunStatus::Quit);
            }
            _ => {
                let status = looper.run_with_timeout(Some(Duration::from_millis(5))).unwrap();
                assert_ne!(status, RunStatus::Quit);
            }
        }
    }
});
