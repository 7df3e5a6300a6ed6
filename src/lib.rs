//! A minimal asynchronous TCP server runtime that unifies the two native
//! async I/O models, completion-based Windows I/O completion ports and
//! readiness-based Linux epoll, behind one portable API.
//!
//! The [`Server`] owns the OS completion primitive and drives everything from
//! a single-threaded, blocking [`Server::tick`] loop. A listening [`Socket`]
//! is bound to an accept handler through [`Server::create_acceptor`]; each
//! accepted connection is handed to the handler, which may claim it and dock
//! it with [`Server::create_dock`] to queue asynchronous reads and writes.
//!
//! Native error codes never reach user callbacks directly: every failure is
//! first run through [`ErrorCode::classify`]. Codes in the curated set are
//! delivered to the relevant callback; anything else is fatal and stops the
//! loop with a [`FatalError`].
//!
//! ```no_run
//! use mooring::{Accepted, ErrorCode, Ipv4Address, Server};
//!
//! fn main() -> Result<(), mooring::FatalError> {
//!     let mut server = Server::create()?;
//!     server.bind_sockets(64);
//!     let listener = server.create_socket(4070)?;
//!     server.create_acceptor(
//!         listener,
//!         |_server: &mut Server, error: ErrorCode, _conn: &mut Accepted, address: Ipv4Address| {
//!             if error == ErrorCode::Ok {
//!                 println!("connection from {address}");
//!             }
//!             // The connection was not claimed, so the runtime closes it.
//!             true
//!         },
//!     )?;
//!     server.run()
//! }
//! ```

mod addr;
mod backend;
mod error;
mod handler;
mod operation;
mod registry;

pub use self::addr::Ipv4Address;
pub use self::backend::{Server, Socket, Tick};
#[cfg(target_os = "linux")]
pub use self::error::errno;
pub use self::error::{DestroyError, ErrorCode, FatalError, QueueError};
pub use self::handler::{AcceptHandler, Accepted};
pub use self::operation::{AcceptorHandle, Direction, DockHandle, Operation};
