//! Completion-based backend over Windows I/O completion ports.
//!
//! The OS performs the I/O and queues a completion record once it is done;
//! the dispatch here only resolves which operation finished and delivers the
//! result. Completions identify their operation by the address of the
//! overlapped block they were submitted with; an in-flight table owned by the
//! server maps that address back to a registry handle, so no layout tricks
//! are involved in the reverse lookup.

mod acceptor;
mod dock;
mod socket;

use std::collections::HashMap;
use std::mem;
use std::ptr;

use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_NETNAME_DELETED, ERROR_PORT_UNREACHABLE, GetLastError, HANDLE,
    INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Networking::WinSock::{
    SOCKET_ERROR, WSACleanup, WSADATA, WSAECONNREFUSED, WSAECONNRESET, WSAGetLastError,
    WSAStartup, WSAVERNOTSUPPORTED,
};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED,
};

use crate::backend::Tick;
use crate::error::{ErrorCode, FatalError};
use crate::operation::Direction;
use crate::registry::{RawHandle, Registry};

use self::acceptor::Acceptor;
use self::dock::Dock;
pub use self::socket::Socket;

pub(crate) enum Entry {
    Acceptor(Acceptor),
    Dock(Dock),
}

/// Identity of one submitted overlapped operation.
pub(crate) struct PendingOp {
    pub(crate) token: RawHandle,
    pub(crate) kind: OpKind,
}

pub(crate) enum OpKind {
    Accept,
    Io(Direction),
}

/// The event-loop context: owns the completion port, the Winsock runtime
/// and every acceptor and dock registered with it.
///
/// Single-threaded by design; the only blocking point is [`Server::tick`].
/// User callbacks run inside `tick` and receive `&mut Server`, so they can
/// re-enter `queue_read`/`queue_write`/`create_dock`/`destroy_dock` freely.
/// `tick` itself must not be called re-entrantly from a callback.
pub struct Server {
    started: bool,
    port: HANDLE,
    entries: Registry<Entry>,
    in_flight: HashMap<usize, PendingOp>,
    capacity: Option<usize>,
    // Set when a callback requests a stop outside tick (a synchronous
    // submission failure); the next tick honors it before waiting.
    stop_pending: bool,
}

impl Server {
    /// Creates the completion context: the Winsock 2.2 startup handshake
    /// followed by the completion-port creation.
    ///
    /// Fails fatally on any setup error; there is no degraded mode.
    pub fn create() -> Result<Self, FatalError> {
        let mut server = Self {
            started: false,
            port: INVALID_HANDLE_VALUE,
            entries: Registry::new(),
            in_flight: HashMap::new(),
            capacity: None,
            stop_pending: false,
        };
        server.startup()?;
        server.open_port()?;
        log::debug!("server created on completion port {:?}", server.port);
        Ok(server)
    }

    fn startup(&mut self) -> Result<(), FatalError> {
        let mut data: WSADATA = unsafe { mem::zeroed() };
        let result = unsafe { WSAStartup(0x0202, &mut data) };
        if result != 0 {
            return Err(FatalError::os("WSAStartup", result));
        }
        self.started = true;
        let major = data.wVersion & 0xFF;
        let minor = data.wVersion >> 8;
        if (major, minor) != (2, 2) {
            log::error!("unusable Winsock version {major}.{minor}, expected 2.2");
            return Err(FatalError::os("WSAStartup", WSAVERNOTSUPPORTED));
        }
        Ok(())
    }

    fn open_port(&mut self) -> Result<(), FatalError> {
        let port = unsafe {
            CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 0)
        };
        if port.is_null() {
            return Err(FatalError::os("CreateIoCompletionPort", last_error()));
        }
        self.port = port;
        Ok(())
    }

    /// Fixes how many sockets (acceptors plus docks) this server will hold.
    ///
    /// Set once at startup, before the first registration.
    ///
    /// # Panics
    ///
    /// Panics if the capacity has already been set.
    pub fn bind_sockets(&mut self, capacity: usize) {
        assert!(
            self.capacity.is_none(),
            "socket capacity is set once at startup"
        );
        self.capacity = Some(capacity);
        self.entries.reserve(capacity);
    }

    /// Blocks for the next completion record and dispatches it.
    ///
    /// A failed record whose error classifies is routed to the owning
    /// operation's handler; an unclassified failure, or a failure of the wait
    /// itself, is fatal. Returns [`Tick::Stopped`] as soon as a callback asks
    /// the loop to stop.
    pub fn tick(&mut self) -> Result<Tick, FatalError> {
        if mem::take(&mut self.stop_pending) {
            return Ok(Tick::Stopped);
        }

        let mut bytes = 0u32;
        let mut key = 0usize;
        let mut overlapped: *mut OVERLAPPED = ptr::null_mut();
        let ok = unsafe {
            GetQueuedCompletionStatus(self.port, &mut bytes, &mut key, &mut overlapped, u32::MAX)
        };

        let mut failure = 0;
        if ok == 0 {
            let code = map_native(last_error());
            if overlapped.is_null() || ErrorCode::classify(code).is_none() {
                let error = FatalError::os("GetQueuedCompletionStatus", code);
                log::error!("{error}");
                return Err(error);
            }
            failure = code;
        }

        let Some(pending) = self.in_flight.remove(&(overlapped as usize)) else {
            log::warn!("completion for an unknown operation, dropped");
            return Ok(Tick::Continue);
        };
        match pending.kind {
            OpKind::Accept => self.complete_accept(pending.token, failure),
            OpKind::Io(direction) => {
                self.complete_io(pending.token, direction, failure, bytes)
            }
        }
    }

    /// Runs the loop until a callback requests a stop.
    pub fn run(&mut self) -> Result<(), FatalError> {
        loop {
            if let Tick::Stopped = self.tick()? {
                return Ok(());
            }
        }
    }

    /// Tears the server down: closes every registered socket, the completion
    /// port and the Winsock runtime.
    ///
    /// Idempotent. Partial failures are logged and accumulated so every
    /// resource gets a closing attempt; the first failure is returned.
    pub fn destroy(&mut self) -> Result<(), FatalError> {
        let mut first_failure = None;
        let mut record = |result: Result<(), FatalError>| {
            if let Err(error) = result {
                log::error!("failed to release a resource during shutdown: {error}");
                first_failure.get_or_insert(error);
            }
        };

        for entry in self.entries.drain() {
            match entry {
                Entry::Acceptor(acceptor) => {
                    let (mut listening, spare) = acceptor.into_sockets();
                    if let Some(mut spare) = spare {
                        record(spare.destroy());
                    }
                    record(listening.destroy());
                }
                Entry::Dock(dock) => {
                    let mut socket = dock.into_socket();
                    record(socket.destroy());
                }
            }
        }
        self.in_flight.clear();

        if self.port != INVALID_HANDLE_VALUE {
            if unsafe { CloseHandle(self.port) } == 0 {
                record(Err(FatalError::os("CloseHandle", last_error())));
            }
            self.port = INVALID_HANDLE_VALUE;
        }
        if self.started {
            if unsafe { WSACleanup() } == SOCKET_ERROR {
                record(Err(FatalError::os("WSACleanup", last_socket_error())));
            }
            self.started = false;
        }

        drop(record);
        match first_failure {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    /// Storage size of the server, for embedders allocating it externally.
    pub const fn size() -> usize {
        mem::size_of::<Self>()
    }

    /// Storage alignment of the server.
    pub const fn alignment() -> usize {
        mem::align_of::<Self>()
    }

    /// Storage size of one acceptor record.
    pub const fn acceptor_size() -> usize {
        mem::size_of::<Acceptor>()
    }

    /// Storage size of one dock record.
    pub const fn dock_size() -> usize {
        mem::size_of::<Dock>()
    }

    fn ensure_capacity(&self) -> Result<(), FatalError> {
        let capacity = self.capacity.unwrap_or(0);
        if self.entries.len() >= capacity {
            return Err(FatalError::Capacity { capacity });
        }
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Err(error) = self.destroy() {
            log::warn!("server teardown left resources behind: {error}");
        }
    }
}

/// A pinned overlapped block; its address identifies the operation when the
/// completion record comes back.
#[repr(C)]
pub(crate) struct OverlappedBlock {
    raw: OVERLAPPED,
}

impl OverlappedBlock {
    pub(crate) fn boxed() -> Box<Self> {
        Box::new(Self {
            raw: unsafe { mem::zeroed() },
        })
    }

    /// Resets the block before a new submission.
    pub(crate) fn clear(&mut self) {
        self.raw = unsafe { mem::zeroed() };
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut OVERLAPPED {
        &mut self.raw
    }

    pub(crate) fn address(&self) -> usize {
        &self.raw as *const OVERLAPPED as usize
    }
}

/// Folds the Win32 spellings of connection failures into their Winsock
/// equivalents before classification.
pub(crate) fn map_native(code: i32) -> i32 {
    const NETNAME_DELETED: i32 = ERROR_NETNAME_DELETED as i32;
    const PORT_UNREACHABLE: i32 = ERROR_PORT_UNREACHABLE as i32;
    match code {
        NETNAME_DELETED => WSAECONNRESET,
        PORT_UNREACHABLE => WSAECONNREFUSED,
        _ => code,
    }
}

pub(crate) fn last_error() -> i32 {
    unsafe { GetLastError() as i32 }
}

pub(crate) fn last_socket_error() -> i32 {
    unsafe { WSAGetLastError() }
}
