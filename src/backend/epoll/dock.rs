use crate::backend::Tick;
use crate::error::{DestroyError, ErrorCode, FatalError, QueueError, errno};
use crate::handler::IoComplete;
use crate::operation::{Direction, DockHandle, Operation};
use crate::registry::RawHandle;

use super::socket::{Role, Socket};
use super::{Entry, Server, ev};

/// Per-connection container of one read slot and one write slot.
///
/// The socket keeps a single epoll registration; its interest mask always
/// reflects exactly the slots that are currently armed.
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
}

struct Armed {
    buffer: Vec<u8>,
    on_complete: IoComplete,
}

impl Port {
    const fn idle() -> Self {
        Self { armed: None }
    }

    fn is_active(&self) -> bool {
        self.armed.is_some()
    }
}

fn syscall_name(direction: Direction) -> &'static str {
    match direction {
        Direction::Read => "recv",
        Direction::Write => "send",
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
    /// [`Server::tick`], with the transferred byte count.
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
        entry.port_mut(direction).armed = Some(Armed {
            buffer,
            on_complete,
        });

        if let Err(source) = self.arm_dock(token) {
            let Some(Entry::Dock(entry)) = self.entries.get_mut(token) else {
                unreachable!("dock vanished while queueing");
            };
            let armed = entry
                .port_mut(direction)
                .armed
                .take()
                .expect("slot was just armed");
            return Err(QueueError::Arm {
                source,
                buffer: armed.buffer,
            });
        }
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
        if entry.socket.role() == Role::IoRearmed {
            self.epoll.remove(entry.socket.as_raw_fd())?;
        }
        entry.socket.destroy()?;
        Ok(())
    }

    /// Synchronizes the socket's epoll registration with its armed slots.
    ///
    /// First arm adds the descriptor, later arms modify it; edge-triggered
    /// one-shot in both cases, so each readiness event has to be re-armed
    /// explicitly.
    pub(crate) fn arm_dock(&mut self, token: RawHandle) -> Result<(), FatalError> {
        let (fd, rearm, interest) = match self.entries.get(token) {
            Some(Entry::Dock(entry)) => {
                let mut interest = 0;
                if entry.read.is_active() {
                    interest |= ev::IN;
                }
                if entry.write.is_active() {
                    interest |= ev::OUT;
                }
                if interest == 0 {
                    return Ok(());
                }
                interest |= ev::ET | ev::ONESHOT;
                (
                    entry.socket.as_raw_fd(),
                    entry.socket.role() == Role::IoRearmed,
                    interest,
                )
            }
            _ => return Ok(()),
        };

        if rearm {
            self.epoll.modify(fd, token.to_bits(), interest)
        } else {
            self.epoll.add(fd, token.to_bits(), interest)?;
            if let Some(Entry::Dock(entry)) = self.entries.get_mut(token) {
                entry.socket.set_role(Role::IoRearmed);
            }
            Ok(())
        }
    }

    /// Handles one readiness notification on a docked socket.
    ///
    /// Error and hang-up conditions run both slots so their callbacks
    /// observe the failure through the syscall result. After delivery any
    /// slot that is still armed (including ones re-queued by the callbacks)
    /// gets the registration re-armed.
    pub(crate) fn dispatch_io(&mut self, token: RawHandle, readiness: u32) -> Result<Tick, FatalError> {
        let mut readiness = readiness;
        if readiness & (ev::ERR | ev::HUP) != 0 {
            readiness |= ev::IN | ev::OUT;
        }
        if readiness & ev::IN != 0 {
            if let Tick::Stopped = self.complete(token, Direction::Read)? {
                return Ok(Tick::Stopped);
            }
        }
        if readiness & ev::OUT != 0 {
            if let Tick::Stopped = self.complete(token, Direction::Write)? {
                return Ok(Tick::Stopped);
            }
        }
        self.arm_dock(token)?;
        Ok(Tick::Continue)
    }

    /// Performs the actual transfer for one armed slot and delivers the
    /// completion.
    fn complete(&mut self, token: RawHandle, direction: Direction) -> Result<Tick, FatalError> {
        let (fd, armed) = match self.entries.get_mut(token) {
            Some(Entry::Dock(entry)) => {
                // A spurious wake for an idle slot is not an error.
                let Some(armed) = entry.port_mut(direction).armed.take() else {
                    return Ok(Tick::Continue);
                };
                (entry.socket.as_raw_fd(), armed)
            }
            _ => return Ok(Tick::Continue),
        };
        let Armed {
            mut buffer,
            on_complete,
        } = armed;

        let transferred = match direction {
            Direction::Read => unsafe {
                libc::recv(
                    fd,
                    buffer.as_mut_ptr() as *mut libc::c_void,
                    buffer.len(),
                    0,
                )
            },
            Direction::Write => unsafe {
                libc::send(
                    fd,
                    buffer.as_ptr() as *const libc::c_void,
                    buffer.len(),
                    libc::MSG_NOSIGNAL,
                )
            },
        };

        let (code, bytes) = if transferred == -1 {
            let native = errno();
            let Some(code) = ErrorCode::classify(native) else {
                let error = FatalError::os(syscall_name(direction), native);
                log::error!("{error}");
                return Err(error);
            };
            (code, 0)
        } else {
            (ErrorCode::Ok, transferred as u32)
        };

        let operation = Operation::new(DockHandle::new(token), direction, buffer);
        let keep_going = on_complete(self, code, operation, bytes);
        Ok(if keep_going {
            Tick::Continue
        } else {
            Tick::Stopped
        })
    }
}
