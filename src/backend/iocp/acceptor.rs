use std::mem;
use std::ptr;

use windows_sys::Win32::Networking::WinSock::{
    AcceptEx, GetAcceptExSockaddrs, SOCKADDR, SOCKADDR_IN, WSA_IO_PENDING,
};
use windows_sys::Win32::System::IO::PostQueuedCompletionStatus;

use crate::addr::Ipv4Address;
use crate::backend::Tick;
use crate::error::{ErrorCode, FatalError};
use crate::handler::{AcceptHandler, Accepted};
use crate::operation::AcceptorHandle;
use crate::registry::RawHandle;

use super::socket::{Socket, address_from_raw, create_unbound};
use super::{
    Entry, OpKind, OverlappedBlock, PendingOp, Server, last_error, last_socket_error, map_native,
};

/// `AcceptEx` wants room for the address pair plus 16 bytes of slack each.
const ADDRESS_LENGTH: u32 = (mem::size_of::<SOCKADDR_IN>() + 16) as u32;
const OUTPUT_LENGTH: usize = ADDRESS_LENGTH as usize * 2;

/// Where the acceptor is in its submission cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptState {
    /// Nothing outstanding.
    Idle,
    /// A retry of the submission itself was queued through the port after a
    /// classified submission failure; the completion re-runs the submission.
    Submitting,
    /// An `AcceptEx` is outstanding; the completion carries a connection.
    Pending,
}

/// The self-re-arming accept loop for one listening socket.
///
/// A spare unbound socket is pre-created for every `AcceptEx` submission and
/// becomes the connection when the completion arrives.
pub(crate) struct Acceptor {
    listening: Socket,
    spare: Option<Socket>,
    handler: Option<Box<dyn AcceptHandler>>,
    state: AcceptState,
    overlapped: Box<OverlappedBlock>,
    output: Box<[u8; OUTPUT_LENGTH]>,
}

impl Acceptor {
    pub(crate) fn into_sockets(self) -> (Socket, Option<Socket>) {
        (self.listening, self.spare)
    }
}

impl Server {
    /// Registers an acceptor for `socket` and submits the first accept.
    pub fn create_acceptor<H>(
        &mut self,
        socket: Socket,
        handler: H,
    ) -> Result<AcceptorHandle, FatalError>
    where
        H: AcceptHandler + 'static,
    {
        self.ensure_capacity()?;
        let token = self.entries.insert(Entry::Acceptor(Acceptor {
            listening: socket,
            spare: None,
            handler: Some(Box::new(handler)),
            state: AcceptState::Idle,
            overlapped: OverlappedBlock::boxed(),
            output: Box::new([0; OUTPUT_LENGTH]),
        }));
        if let Tick::Stopped = self.submit_accept(token)? {
            self.stop_pending = true;
        }
        log::debug!("acceptor armed");
        Ok(AcceptorHandle::new(token))
    }

    /// Issues the next `AcceptEx` on a freshly created spare socket.
    ///
    /// Classified failures are delivered to the handler and the submission is
    /// re-queued through the completion port, so a persistently failing
    /// submission cannot spin without passing through the event loop.
    pub(crate) fn submit_accept(&mut self, token: RawHandle) -> Result<Tick, FatalError> {
        let spare = match create_unbound() {
            Ok(spare) => spare,
            Err(FatalError::Os { code, .. }) if ErrorCode::classify(code).is_some() => {
                let code = ErrorCode::classify(code).expect("checked above");
                if !self.deliver_accept_error(token, code) {
                    return Ok(Tick::Stopped);
                }
                return self.queue_submission_retry(token);
            }
            Err(error) => {
                log::error!("{error}");
                return Err(error);
            }
        };

        let (listening, accepting, output, overlapped) = match self.entries.get_mut(token) {
            Some(Entry::Acceptor(acceptor)) => {
                acceptor.spare = Some(spare);
                acceptor.overlapped.clear();
                (
                    acceptor.listening.as_raw(),
                    acceptor.spare.as_ref().expect("spare was just stored").as_raw(),
                    acceptor.output.as_mut_ptr(),
                    acceptor.overlapped.as_mut_ptr(),
                )
            }
            _ => return Ok(Tick::Continue),
        };

        let mut received = 0u32;
        let submitted = unsafe {
            AcceptEx(
                listening,
                accepting,
                output.cast(),
                0,
                ADDRESS_LENGTH,
                ADDRESS_LENGTH,
                &mut received,
                overlapped,
            )
        };
        if submitted == 0 {
            let code = map_native(last_socket_error());
            if code != WSA_IO_PENDING {
                return match ErrorCode::classify(code) {
                    Some(classified) => {
                        self.destroy_spare(token);
                        if !self.deliver_accept_error(token, classified) {
                            return Ok(Tick::Stopped);
                        }
                        self.queue_submission_retry(token)
                    }
                    None => {
                        let error = FatalError::os("AcceptEx", code);
                        log::error!("{error}");
                        self.destroy_spare(token);
                        Err(error)
                    }
                };
            }
        }

        // Submitted, or completed synchronously; either way the completion
        // record arrives through the port.
        self.set_accept_state(token, AcceptState::Pending);
        self.in_flight.insert(
            self.overlapped_address(token),
            PendingOp {
                token,
                kind: OpKind::Accept,
            },
        );
        Ok(Tick::Continue)
    }

    /// Handles the completion of an accept submission.
    pub(crate) fn complete_accept(
        &mut self,
        token: RawHandle,
        failure: i32,
    ) -> Result<Tick, FatalError> {
        let state = match self.entries.get_mut(token) {
            Some(Entry::Acceptor(acceptor)) => {
                let state = acceptor.state;
                acceptor.state = AcceptState::Idle;
                state
            }
            _ => return Ok(Tick::Continue),
        };

        match state {
            AcceptState::Submitting => self.submit_accept(token),
            AcceptState::Idle => {
                log::warn!("spurious accept completion, dropped");
                Ok(Tick::Continue)
            }
            AcceptState::Pending => {
                if failure != 0 {
                    self.destroy_spare(token);
                    let code =
                        ErrorCode::classify(failure).expect("tick pre-classifies failures");
                    if !self.deliver_accept_error(token, code) {
                        return Ok(Tick::Stopped);
                    }
                    return self.submit_accept(token);
                }
                self.deliver_connection(token)
            }
        }
    }

    /// Completes a successful accept: associates the new socket with the
    /// port, recovers the peer address and runs the handler.
    fn deliver_connection(&mut self, token: RawHandle) -> Result<Tick, FatalError> {
        let spare = match self.entries.get_mut(token) {
            Some(Entry::Acceptor(acceptor)) => match acceptor.spare.take() {
                Some(spare) => spare,
                None => return Ok(Tick::Continue),
            },
            _ => return Ok(Tick::Continue),
        };

        match self.register_socket(&spare) {
            Ok(()) => {}
            Err(error) => {
                let mut spare = spare;
                if let Err(close_error) = spare.destroy() {
                    log::warn!("failed to close a rejected connection: {close_error}");
                }
                let classified = match &error {
                    FatalError::Os { code, .. } => ErrorCode::classify(map_native(*code)),
                    _ => None,
                };
                let Some(classified) = classified else {
                    log::error!("{error}");
                    return Err(error);
                };
                if !self.deliver_accept_error(token, classified) {
                    return Ok(Tick::Stopped);
                }
                return self.submit_accept(token);
            }
        }

        let address = match self.entries.get_mut(token) {
            Some(Entry::Acceptor(acceptor)) => remote_address(&acceptor.output),
            _ => return Ok(Tick::Continue),
        };

        let mut accepted = Accepted::new(spare);
        let mut handler = self.take_handler(token);
        let keep_going = handler.on_accept(self, ErrorCode::Ok, &mut accepted, address);

        // The handler left the connection behind, so it gets closed here.
        if let Some(mut socket) = accepted.take_unclaimed() {
            if let Err(error) = socket.destroy() {
                log::warn!("failed to close an unclaimed connection: {error}");
            }
        }
        self.restore_handler(token, handler);

        if !keep_going {
            return Ok(Tick::Stopped);
        }
        self.submit_accept(token)
    }

    /// Delivers a classified accept failure to the handler.
    fn deliver_accept_error(&mut self, token: RawHandle, code: ErrorCode) -> bool {
        let mut handler = self.take_handler(token);
        let mut empty = Accepted::empty();
        let keep_going = handler.on_accept(self, code, &mut empty, Ipv4Address::UNSPECIFIED);
        self.restore_handler(token, handler);
        keep_going
    }

    /// Re-queues the accept submission through the completion port.
    fn queue_submission_retry(&mut self, token: RawHandle) -> Result<Tick, FatalError> {
        let overlapped = match self.entries.get_mut(token) {
            Some(Entry::Acceptor(acceptor)) => {
                acceptor.overlapped.clear();
                acceptor.overlapped.as_mut_ptr()
            }
            _ => return Ok(Tick::Continue),
        };
        if unsafe { PostQueuedCompletionStatus(self.port, 0, 0, overlapped) } == 0 {
            let error = FatalError::os("PostQueuedCompletionStatus", last_error());
            log::error!("{error}");
            return Err(error);
        }
        self.set_accept_state(token, AcceptState::Submitting);
        self.in_flight.insert(
            self.overlapped_address(token),
            PendingOp {
                token,
                kind: OpKind::Accept,
            },
        );
        Ok(Tick::Continue)
    }

    fn take_handler(&mut self, token: RawHandle) -> Box<dyn AcceptHandler> {
        match self.entries.get_mut(token) {
            Some(Entry::Acceptor(acceptor)) => acceptor
                .handler
                .take()
                .expect("accept handler is installed outside dispatch"),
            _ => unreachable!("acceptors are never removed while the server lives"),
        }
    }

    fn restore_handler(&mut self, token: RawHandle, handler: Box<dyn AcceptHandler>) {
        if let Some(Entry::Acceptor(acceptor)) = self.entries.get_mut(token) {
            acceptor.handler = Some(handler);
        }
    }

    fn set_accept_state(&mut self, token: RawHandle, state: AcceptState) {
        if let Some(Entry::Acceptor(acceptor)) = self.entries.get_mut(token) {
            acceptor.state = state;
        }
    }

    fn overlapped_address(&self, token: RawHandle) -> usize {
        match self.entries.get(token) {
            Some(Entry::Acceptor(acceptor)) => acceptor.overlapped.address(),
            _ => 0,
        }
    }

    fn destroy_spare(&mut self, token: RawHandle) {
        if let Some(Entry::Acceptor(acceptor)) = self.entries.get_mut(token) {
            if let Some(mut spare) = acceptor.spare.take() {
                if let Err(error) = spare.destroy() {
                    log::warn!("failed to close a spare accept socket: {error}");
                }
            }
        }
    }
}

/// Pulls the remote peer address out of the `AcceptEx` output buffer.
fn remote_address(output: &[u8; OUTPUT_LENGTH]) -> Ipv4Address {
    let mut local: *mut SOCKADDR = ptr::null_mut();
    let mut local_length = 0i32;
    let mut remote: *mut SOCKADDR = ptr::null_mut();
    let mut remote_length = 0i32;
    unsafe {
        GetAcceptExSockaddrs(
            output.as_ptr().cast(),
            0,
            ADDRESS_LENGTH,
            ADDRESS_LENGTH,
            &mut local,
            &mut local_length,
            &mut remote,
            &mut remote_length,
        );
    }
    if remote.is_null() || (remote_length as usize) < mem::size_of::<SOCKADDR_IN>() {
        return Ipv4Address::UNSPECIFIED;
    }
    address_from_raw(unsafe { &*(remote as *const SOCKADDR_IN) })
}
