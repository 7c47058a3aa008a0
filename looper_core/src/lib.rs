//! Single-threaded event loop with timers, fd watches and a task queue.
//!
//! [`create`] returns the generic looper over the platform default poller,
//! configured from the environment.

#[cfg(not(unix))]
compile_error!("looper_core only supports Unix targets");

pub mod clock;
pub mod config;
pub mod error;
pub mod generic;
pub mod logger;
pub mod looper;
pub mod os;
pub mod signals;

pub use clock::ClockType;
pub use config::{Backend, ConfigError, LooperConfig};
pub use error::{LooperError, Result};
pub use generic::GenericLooper;
pub use looper::{
    FdCallback, Looper, RunStatus, TaskCallback, TaskId, TimerCallback, TimerId, WatchId,
};
pub use os::Interest;

/// Creates a generic looper configured from the environment (see
/// [`LooperConfig::from_env`]). An unusable configuration falls back to the
/// defaults with a warning.
pub fn create() -> Result<Box<dyn Looper>> {
    let config = LooperConfig::from_env().unwrap_or_else(|e| {
        log::warn!("ignoring looper configuration: {}", e);
        LooperConfig::default()
    });
    create_with_config(&config)
}

pub fn create_with_config(config: &LooperConfig) -> Result<Box<dyn Looper>> {
    let looper: Box<dyn Looper> = match config.backend {
        Backend::Auto => Box::new(GenericLooper::with_config(os::default_poller()?, config)),
        Backend::Poll => Box::new(GenericLooper::with_config(os::PollSet::new()?, config)),
        #[cfg(target_os = "linux")]
        Backend::Epoll => Box::new(GenericLooper::with_config(os::Epoll::new()?, config)),
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        ))]
        Backend::Kqueue => Box::new(GenericLooper::with_config(os::Kqueue::new()?, config)),
        #[allow(unreachable_patterns)]
        other => return Err(LooperError::UnsupportedBackend(other.to_string())),
    };
    Ok(looper)
}
