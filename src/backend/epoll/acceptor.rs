use std::mem;

use crate::addr::Ipv4Address;
use crate::backend::Tick;
use crate::error::{ErrorCode, FatalError, errno};
use crate::handler::{AcceptHandler, Accepted};
use crate::registry::RawHandle;

use super::socket::{Socket, address_from_raw};
use super::{Entry, Server, ev};

/// How the listening socket is registered with epoll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArmMode {
    /// Exclusive wakeup, level-triggered; the kernel re-notifies while
    /// connections are pending, so no explicit re-arm is needed.
    Exclusive,
    /// Edge-triggered one-shot; every dispatch re-arms before handling the
    /// accept outcome.
    OneShot,
}

/// The self-re-arming accept loop for one listening socket.
pub(crate) struct Acceptor {
    socket: Socket,
    handler: Option<Box<dyn AcceptHandler>>,
    pub(crate) mode: ArmMode,
}

impl Acceptor {
    pub(crate) fn new(socket: Socket, handler: Box<dyn AcceptHandler>) -> Self {
        Self {
            socket,
            handler: Some(handler),
            mode: ArmMode::OneShot,
        }
    }

    pub(crate) fn into_socket(self) -> Socket {
        self.socket
    }
}

/// What one accept attempt produced.
enum Outcome {
    Connection(Socket, Ipv4Address),
    Transient(ErrorCode),
}

/// Splits an accept failure into the two tiers: classified codes go to the
/// handler, everything else aborts the loop.
fn classify_accept_failure(native: i32) -> Result<ErrorCode, FatalError> {
    match ErrorCode::classify(native) {
        Some(code) => Ok(code),
        None => Err(FatalError::os("accept4", native)),
    }
}

impl Server {
    /// Handles one readiness notification on a listening socket.
    ///
    /// A single bad connection never stops the acceptor: classified failures
    /// are delivered to the handler and the listener is re-armed on every
    /// continue path. Only unclassified failures, or the handler returning
    /// `false`, end the loop.
    pub(crate) fn dispatch_accept(&mut self, token: RawHandle) -> Result<Tick, FatalError> {
        let (fd, mode) = match self.entries.get(token) {
            Some(Entry::Acceptor(acceptor)) => (acceptor.socket.as_raw_fd(), acceptor.mode),
            _ => return Ok(Tick::Continue),
        };

        let mut storage: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut length = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let incoming = unsafe {
            libc::accept4(
                fd,
                &mut storage as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut length,
                libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            )
        };

        let outcome = if incoming == -1 {
            let code = classify_accept_failure(errno()).inspect_err(|error| {
                log::error!("{error}");
            })?;
            Outcome::Transient(code)
        } else {
            Outcome::Connection(Socket::io(incoming), address_from_raw(&storage))
        };

        if mode == ArmMode::OneShot {
            self.epoll
                .modify(fd, token.to_bits(), ev::IN | ev::ET | ev::ONESHOT)?;
        }

        let (code, mut accepted, address) = match outcome {
            Outcome::Connection(socket, address) => (ErrorCode::Ok, Accepted::new(socket), address),
            Outcome::Transient(code) => (code, Accepted::empty(), Ipv4Address::UNSPECIFIED),
        };

        let mut handler = match self.entries.get_mut(token) {
            Some(Entry::Acceptor(acceptor)) => acceptor
                .handler
                .take()
                .expect("accept handler is installed outside dispatch"),
            _ => return Ok(Tick::Continue),
        };
        let keep_going = handler.on_accept(self, code, &mut accepted, address);

        // The handler left the connection behind, so it gets closed here.
        if let Some(mut socket) = accepted.take_unclaimed() {
            if let Err(error) = socket.destroy() {
                log::warn!("failed to close an unclaimed connection: {error}");
            }
        }
        if let Some(Entry::Acceptor(acceptor)) = self.entries.get_mut(token) {
            acceptor.handler = Some(handler);
        }

        Ok(if keep_going {
            Tick::Continue
        } else {
            Tick::Stopped
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classified_failures_reach_the_handler() {
        assert_eq!(
            classify_accept_failure(libc::ECONNRESET).unwrap(),
            ErrorCode::ConnectionReset
        );
        assert_eq!(
            classify_accept_failure(libc::EAGAIN).unwrap(),
            ErrorCode::WouldBlock
        );
    }

    #[test]
    fn unclassified_failures_abort_the_loop() {
        let error = classify_accept_failure(libc::EIO).unwrap_err();
        assert!(matches!(
            error,
            FatalError::Os {
                function: "accept4",
                code: libc::EIO,
            }
        ));
    }
}
