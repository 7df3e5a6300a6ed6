use crate::addr::Ipv4Address;
use crate::backend::{Server, Socket};
use crate::error::ErrorCode;
use crate::operation::Operation;

/// Receives the stream of outcomes from an acceptor.
///
/// Bound once at [`Server::create_acceptor`] and invoked from inside
/// [`Server::tick`] for every accepted connection and every classified accept
/// failure. Implementations carry their own typed state; closures with the
/// matching signature implement this trait automatically.
///
/// # Contract
///
/// - On success `error` is [`ErrorCode::Ok`] and `socket` holds the
///   connection; call [`Accepted::claim`] to keep it, otherwise the runtime
///   closes it when the handler returns.
/// - On a classified failure `error` carries the code, `socket` is empty and
///   `address` is [`Ipv4Address::UNSPECIFIED`].
/// - Return `false` to stop the event loop; the tick that dispatched the
///   notification returns [`Tick::Stopped`](crate::Tick::Stopped).
pub trait AcceptHandler {
    fn on_accept(
        &mut self,
        server: &mut Server,
        error: ErrorCode,
        socket: &mut Accepted,
        address: Ipv4Address,
    ) -> bool;
}

impl<F> AcceptHandler for F
where
    F: FnMut(&mut Server, ErrorCode, &mut Accepted, Ipv4Address) -> bool,
{
    fn on_accept(
        &mut self,
        server: &mut Server,
        error: ErrorCode,
        socket: &mut Accepted,
        address: Ipv4Address,
    ) -> bool {
        self(server, error, socket, address)
    }
}

/// Completion callback for a queued read or write.
///
/// Fires exactly once per queued operation, from inside
/// [`Server::tick`]. The slot is already free when it runs, so the callback
/// may immediately queue the next operation on the same dock.
pub(crate) type IoComplete = Box<dyn FnOnce(&mut Server, ErrorCode, Operation, u32) -> bool>;

/// A freshly accepted connection, owned by the runtime until claimed.
///
/// Ownership is "at most one live owner": either the handler takes the
/// socket with [`Accepted::claim`], or the runtime destroys it after the
/// handler returns.
pub struct Accepted {
    slot: Option<Socket>,
}

impl Accepted {
    pub(crate) fn new(socket: Socket) -> Self {
        Self { slot: Some(socket) }
    }

    /// The placeholder passed along with accept error notifications.
    pub(crate) fn empty() -> Self {
        Self { slot: None }
    }

    /// Takes ownership of the accepted socket.
    ///
    /// Single-use: the second and every later call return `None`.
    pub fn claim(&mut self) -> Option<Socket> {
        self.slot.take()
    }

    /// Whatever the handler left behind, for the runtime to dispose of.
    pub(crate) fn take_unclaimed(&mut self) -> Option<Socket> {
        self.slot.take()
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn claim_is_single_use() {
        // The sentinel descriptor keeps teardown from touching the OS.
        let mut accepted = Accepted::new(Socket::invalid_for_tests());
        assert!(accepted.claim().is_some());
        assert!(accepted.claim().is_none());
        assert!(accepted.take_unclaimed().is_none());
    }

    #[test]
    fn error_notifications_carry_no_socket() {
        let mut accepted = Accepted::empty();
        assert!(accepted.claim().is_none());
    }
}
