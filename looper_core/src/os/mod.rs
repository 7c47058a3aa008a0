//! OS I/O multiplexing layer (epoll / kqueue / poll).
//!
//! Each backend implements [`Poller`]. [`DefaultPoller`] is selected per
//! platform at compile time: Linux → epoll, BSD/macOS → kqueue, any other
//! Unix → poll(2). `PollSet` is available everywhere and can be chosen at
//! runtime through the configuration.

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
pub use epoll::Epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub use kqueue::Kqueue;

mod poll;
pub use poll::PollSet;

pub mod interest;
pub use interest::{Event, Interest, Token};
pub mod poller;
pub use poller::Poller;

#[cfg(target_os = "linux")]
pub type DefaultPoller = Epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub type DefaultPoller = Kqueue;

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
pub type DefaultPoller = PollSet;

/// Creates the platform default poller.
pub fn default_poller() -> std::io::Result<DefaultPoller> {
    DefaultPoller::new()
}
