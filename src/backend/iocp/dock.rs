use std::ptr;

use windows_sys::Win32::Networking::WinSock::{
    SOCKET_ERROR, WSABUF, WSA_IO_PENDING, WSARecv, WSASend,
};

use crate::backend::Tick;
use crate::error::{DestroyError, ErrorCode, FatalError, QueueError};
use crate::handler::IoComplete;
use crate::operation::{Direction, DockHandle, Operation};
use crate::registry::RawHandle;

use super::socket::Socket;
use super::{Entry, OpKind, OverlappedBlock, PendingOp, Server, last_socket_error, map_native};

/// Per-connection container of one read slot and one write slot.
///
/// Each slot owns a pinned overlapped block; the block's address is what the
/// completion record is matched against when the OS reports the result.
pub(crate) struct Dock {
    socket: Socket,
    read: Port,
    write: Port,
}

impl Dock {
    fn port(&self, direction: Direction) -> &Port {
        match direction {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        }
    }

    fn port_mut(&mut self, direction: Direction) -> &mut Port {
        match direction {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }

    pub(crate) fn into_socket(self) -> Socket {
        self.socket
    }
}

/// One operation slot. Armed from queue time until its completion callback
/// has been taken for delivery.
struct Port {
    armed: Option<Armed>,
    overlapped: Box<OverlappedBlock>,
}

struct Armed {
    buffer: Vec<u8>,
    on_complete: IoComplete,
}

impl Port {
    fn idle() -> Self {
        Self {
            armed: None,
            overlapped: OverlappedBlock::boxed(),
        }
    }

    fn is_active(&self) -> bool {
        self.armed.is_some()
    }
}

fn syscall_name(direction: Direction) -> &'static str {
    match direction {
        Direction::Read => "WSARecv",
        Direction::Write => "WSASend",
    }
}

impl Server {
    /// Moves an accepted socket into the runtime and sets up its two idle
    /// operation slots.
    pub fn create_dock(&mut self, socket: Socket) -> Result<DockHandle, FatalError> {
        self.ensure_capacity()?;
        let token = self.entries.insert(Entry::Dock(Dock {
            socket,
            read: Port::idle(),
            write: Port::idle(),
        }));
        Ok(DockHandle::new(token))
    }

    /// Queues an asynchronous read into `buffer`.
    ///
    /// Rejected without contacting the OS when the buffer exceeds the
    /// operation size limit or the read slot is already armed; the rejection
    /// carries the buffer back. The callback fires exactly once, from inside
    /// [`Server::tick`], with the transferred byte count; a classified
    /// synchronous submission failure consumes the operation and fires the
    /// callback immediately with zero bytes.
    pub fn queue_read<F>(
        &mut self,
        dock: DockHandle,
        buffer: Vec<u8>,
        on_complete: F,
    ) -> Result<(), QueueError>
    where
        F: FnOnce(&mut Server, ErrorCode, Operation, u32) -> bool + 'static,
    {
        self.queue(dock, Direction::Read, buffer, Box::new(on_complete))
    }

    /// Queues an asynchronous write of `buffer`.
    ///
    /// Independent of the read slot; a read may be in flight while a write
    /// is queued and vice versa. Same rejection and delivery contract as
    /// [`Server::queue_read`].
    pub fn queue_write<F>(
        &mut self,
        dock: DockHandle,
        buffer: Vec<u8>,
        on_complete: F,
    ) -> Result<(), QueueError>
    where
        F: FnOnce(&mut Server, ErrorCode, Operation, u32) -> bool + 'static,
    {
        self.queue(dock, Direction::Write, buffer, Box::new(on_complete))
    }

    fn queue(
        &mut self,
        dock: DockHandle,
        direction: Direction,
        buffer: Vec<u8>,
        on_complete: IoComplete,
    ) -> Result<(), QueueError> {
        if buffer.len() > i32::MAX as usize {
            return Err(QueueError::BufferTooLarge {
                len: buffer.len(),
                buffer,
            });
        }
        let token = dock.token();
        let Some(Entry::Dock(entry)) = self.entries.get_mut(token) else {
            return Err(QueueError::StaleDock { buffer });
        };
        if entry.port(direction).is_active() {
            return Err(QueueError::SlotBusy { direction, buffer });
        }

        let socket = entry.socket.as_raw();
        let port = entry.port_mut(direction);
        port.overlapped.clear();
        let overlapped = port.overlapped.as_mut_ptr();
        port.armed = Some(Armed {
            buffer,
            on_complete,
        });
        let armed = port.armed.as_mut().expect("slot was just armed");
        let mut wsa_buffer = WSABUF {
            len: armed.buffer.len() as u32,
            buf: armed.buffer.as_mut_ptr(),
        };

        let result = match direction {
            Direction::Read => {
                let mut flags = 0u32;
                unsafe {
                    WSARecv(socket, &mut wsa_buffer, 1, ptr::null_mut(), &mut flags, overlapped, None)
                }
            }
            Direction::Write => unsafe {
                WSASend(socket, &wsa_buffer, 1, ptr::null_mut(), 0, overlapped, None)
            },
        };

        if result == SOCKET_ERROR {
            let code = map_native(last_socket_error());
            if code != WSA_IO_PENDING {
                let Some(Entry::Dock(entry)) = self.entries.get_mut(token) else {
                    unreachable!("dock vanished while queueing");
                };
                let armed = entry
                    .port_mut(direction)
                    .armed
                    .take()
                    .expect("slot was just armed");
                return match ErrorCode::classify(code) {
                    // The operation is consumed; the failure is its result.
                    Some(classified) => {
                        let operation = Operation::new(dock, direction, armed.buffer);
                        if !(armed.on_complete)(self, classified, operation, 0) {
                            self.stop_pending = true;
                        }
                        Ok(())
                    }
                    None => Err(QueueError::Arm {
                        source: FatalError::os(syscall_name(direction), code),
                        buffer: armed.buffer,
                    }),
                };
            }
        }

        // Submitted, or completed synchronously; either way the completion
        // record arrives through the port.
        let address = match self.entries.get(token) {
            Some(Entry::Dock(entry)) => entry.port(direction).overlapped.address(),
            _ => unreachable!("dock vanished while queueing"),
        };
        self.in_flight.insert(
            address,
            PendingOp {
                token,
                kind: OpKind::Io(direction),
            },
        );
        Ok(())
    }

    /// Whether `direction`'s slot on `dock` currently has an operation in
    /// flight.
    pub fn operation_active(&self, dock: DockHandle, direction: Direction) -> bool {
        matches!(
            self.entries.get(dock.token()),
            Some(Entry::Dock(entry)) if entry.port(direction).is_active()
        )
    }

    /// Destroys a dock and closes its socket.
    ///
    /// Refused while either slot still has an operation in flight; there is
    /// no cancellation, so teardown has to wait for the completion. Calling
    /// this with a stale handle is a no-op.
    pub fn destroy_dock(&mut self, dock: DockHandle) -> Result<(), DestroyError> {
        let token = dock.token();
        match self.entries.get(token) {
            Some(Entry::Dock(entry)) => {
                for direction in [Direction::Read, Direction::Write] {
                    if entry.port(direction).is_active() {
                        return Err(DestroyError::OperationPending(direction));
                    }
                }
            }
            _ => return Ok(()),
        }
        let Some(Entry::Dock(mut entry)) = self.entries.remove(token) else {
            unreachable!("dock entry was just inspected");
        };
        entry.socket.destroy()?;
        Ok(())
    }

    /// Delivers the completion of an overlapped read or write.
    pub(crate) fn complete_io(
        &mut self,
        token: RawHandle,
        direction: Direction,
        failure: i32,
        bytes: u32,
    ) -> Result<Tick, FatalError> {
        let armed = match self.entries.get_mut(token) {
            Some(Entry::Dock(entry)) => {
                // A spurious completion for an idle slot is not an error.
                let Some(armed) = entry.port_mut(direction).armed.take() else {
                    return Ok(Tick::Continue);
                };
                armed
            }
            _ => return Ok(Tick::Continue),
        };

        let code = if failure == 0 {
            ErrorCode::Ok
        } else {
            ErrorCode::classify(failure).expect("tick pre-classifies failures")
        };
        let operation = Operation::new(DockHandle::new(token), direction, armed.buffer);
        let keep_going = (armed.on_complete)(self, code, operation, bytes);
        Ok(if keep_going {
            Tick::Continue
        } else {
            Tick::Stopped
        })
    }
}
