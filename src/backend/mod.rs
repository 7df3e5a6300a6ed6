//! Platform backends behind the portable surface.
//!
//! Exactly one backend compiles per target: readiness-based epoll on Linux,
//! completion-based I/O completion ports on Windows. Both expose the same
//! `Server` and `Socket` types so everything above this module is
//! platform-neutral.

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
pub use self::epoll::{Server, Socket};

#[cfg(windows)]
mod iocp;
#[cfg(windows)]
pub use self::iocp::{Server, Socket};

#[cfg(not(any(target_os = "linux", windows)))]
compile_error!("mooring requires epoll (Linux) or I/O completion ports (Windows)");

/// Outcome of one event-loop turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// The batch was dispatched; call [`Server::tick`] again.
    Continue,
    /// A callback asked the loop to stop.
    Stopped,
}
