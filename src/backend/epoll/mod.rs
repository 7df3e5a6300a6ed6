//! Readiness-based backend over Linux epoll.
//!
//! The kernel only reports that a socket can make progress; the actual
//! `accept4`/`recv`/`send` calls happen here, inside the dispatch that the
//! readiness notification triggers. Registrations carry the packed registry
//! handle in `data.u64`, which the dispatch unpacks to find the acceptor or
//! dock the event belongs to.

mod acceptor;
mod dock;
mod socket;

use std::mem;
use std::os::fd::RawFd;

use crate::backend::Tick;
use crate::error::{FatalError, errno};
use crate::handler::AcceptHandler;
use crate::operation::AcceptorHandle;
use crate::registry::{RawHandle, Registry};

use self::acceptor::Acceptor;
use self::dock::Dock;
pub use self::socket::Socket;
use self::socket::Role;

/// Upper bound on ready descriptors fetched by one wait.
const MAX_EVENTS: usize = 128;

/// Interest bits, widened once to the width the kernel reports them in.
pub(crate) mod ev {
    pub const IN: u32 = libc::EPOLLIN as u32;
    pub const OUT: u32 = libc::EPOLLOUT as u32;
    pub const ERR: u32 = libc::EPOLLERR as u32;
    pub const HUP: u32 = libc::EPOLLHUP as u32;
    pub const ET: u32 = libc::EPOLLET as u32;
    pub const ONESHOT: u32 = libc::EPOLLONESHOT as u32;
    pub const EXCLUSIVE: u32 = libc::EPOLLEXCLUSIVE as u32;
}

pub(crate) enum Entry {
    Acceptor(Acceptor),
    Dock(Dock),
}

/// The event-loop context: owns the epoll instance, the event batch buffer
/// and every acceptor and dock registered with it.
///
/// Single-threaded by design; the only blocking point is [`Server::tick`].
/// User callbacks run inside `tick` and receive `&mut Server`, so they can
/// re-enter `queue_read`/`queue_write`/`create_dock`/`destroy_dock` freely.
/// `tick` itself must not be called re-entrantly from a callback.
pub struct Server {
    epoll: Epoll,
    events: Box<[libc::epoll_event]>,
    entries: Registry<Entry>,
    capacity: Option<usize>,
}

impl Server {
    /// Creates the completion context.
    ///
    /// Fails fatally on any setup error; there is no degraded mode.
    pub fn create() -> Result<Self, FatalError> {
        let epoll = Epoll::create()?;
        log::debug!("server created on epoll descriptor {}", epoll.fd);
        Ok(Self {
            epoll,
            events: vec![
                libc::epoll_event {
                    events: 0,
                    data: libc::epoll_data { u64: 0 }
                };
                MAX_EVENTS
            ]
            .into_boxed_slice(),
            entries: Registry::new(),
            capacity: None,
        })
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

    /// Registers an acceptor for `socket` and arms the first accept.
    ///
    /// Prefers an exclusive-wake registration; older kernels that reject it
    /// fall back to an edge-triggered one-shot registration that every
    /// dispatch re-arms explicitly.
    pub fn create_acceptor<H>(
        &mut self,
        socket: Socket,
        handler: H,
    ) -> Result<AcceptorHandle, FatalError>
    where
        H: AcceptHandler + 'static,
    {
        self.ensure_capacity()?;
        let mut socket = socket;
        socket.set_role(Role::AcceptPending);
        let fd = socket.as_raw_fd();
        let token = self
            .entries
            .insert(Entry::Acceptor(Acceptor::new(socket, Box::new(handler))));

        let exclusive = ev::IN | ev::EXCLUSIVE;
        let mode = match self.epoll.add(fd, token.to_bits(), exclusive) {
            Ok(()) => acceptor::ArmMode::Exclusive,
            Err(FatalError::Os {
                code: libc::EINVAL, ..
            }) => {
                let one_shot = ev::IN | ev::ET | ev::ONESHOT;
                if let Err(error) = self.epoll.add(fd, token.to_bits(), one_shot) {
                    self.entries.remove(token);
                    return Err(error);
                }
                acceptor::ArmMode::OneShot
            }
            Err(error) => {
                self.entries.remove(token);
                return Err(error);
            }
        };
        if let Some(Entry::Acceptor(acceptor)) = self.entries.get_mut(token) {
            acceptor.mode = mode;
        }
        log::debug!("acceptor armed on descriptor {fd}");
        Ok(AcceptorHandle::new(token))
    }

    /// Blocks for one batch of readiness events and dispatches each of them.
    ///
    /// An interrupted wait is retried; any other wait failure, and any
    /// unclassified error met during dispatch, is fatal. Returns
    /// [`Tick::Stopped`] as soon as a callback asks the loop to stop.
    pub fn tick(&mut self) -> Result<Tick, FatalError> {
        let mut events = mem::take(&mut self.events);
        let result = self.tick_batch(&mut events);
        self.events = events;
        result
    }

    fn tick_batch(&mut self, events: &mut [libc::epoll_event]) -> Result<Tick, FatalError> {
        let count = self.epoll.wait(events)?;
        log::trace!("dispatching {count} events");
        for event in &events[..count] {
            let token = RawHandle::from_bits(unsafe { event.data.u64 });
            match self.dispatch(token, event.events)? {
                Tick::Continue => {}
                Tick::Stopped => return Ok(Tick::Stopped),
            }
        }
        Ok(Tick::Continue)
    }

    fn dispatch(&mut self, token: RawHandle, readiness: u32) -> Result<Tick, FatalError> {
        match self.entries.get(token) {
            Some(Entry::Acceptor(_)) => self.dispatch_accept(token),
            Some(Entry::Dock(_)) => self.dispatch_io(token, readiness),
            // The entry was destroyed by an earlier event in this batch.
            None => Ok(Tick::Continue),
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

    /// Tears the server down: closes every registered socket, then the epoll
    /// descriptor.
    ///
    /// Idempotent. Partial failures are logged and accumulated so every
    /// resource gets a closing attempt; the first failure is returned.
    pub fn destroy(&mut self) -> Result<(), FatalError> {
        let mut first_failure = None;
        for entry in self.entries.drain() {
            let mut socket = match entry {
                Entry::Acceptor(acceptor) => acceptor.into_socket(),
                Entry::Dock(dock) => dock.into_socket(),
            };
            if let Err(error) = socket.destroy() {
                log::error!("failed to close a socket during shutdown: {error}");
                first_failure.get_or_insert(error);
            }
        }
        if let Err(error) = self.epoll.close() {
            log::error!("failed to close the epoll descriptor: {error}");
            first_failure.get_or_insert(error);
        }
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

/// Thin wrapper over the epoll control and wait calls.
struct Epoll {
    fd: RawFd,
}

impl Epoll {
    fn create() -> Result<Self, FatalError> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd == -1 {
            return Err(FatalError::os("epoll_create1", errno()));
        }
        Ok(Self { fd })
    }

    fn add(&self, fd: RawFd, token: u64, interest: u32) -> Result<(), FatalError> {
        self.control(libc::EPOLL_CTL_ADD, fd, token, interest)
    }

    fn modify(&self, fd: RawFd, token: u64, interest: u32) -> Result<(), FatalError> {
        self.control(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    /// Deregisters a descriptor, tolerating one that was never registered.
    fn remove(&self, fd: RawFd) -> Result<(), FatalError> {
        let mut event = libc::epoll_event { events: 0, data: libc::epoll_data { u64: 0 } };
        let result = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, &mut event) };
        if result == -1 && errno() != libc::ENOENT {
            return Err(FatalError::os("epoll_ctl", errno()));
        }
        Ok(())
    }

    fn control(&self, operation: i32, fd: RawFd, token: u64, interest: u32) -> Result<(), FatalError> {
        let mut event = libc::epoll_event {
            events: interest,
            data: libc::epoll_data { u64: token },
        };
        if unsafe { libc::epoll_ctl(self.fd, operation, fd, &mut event) } == -1 {
            return Err(FatalError::os("epoll_ctl", errno()));
        }
        Ok(())
    }

    /// Blocks without a timeout for the next batch of ready descriptors.
    fn wait(&self, events: &mut [libc::epoll_event]) -> Result<usize, FatalError> {
        loop {
            let count = unsafe {
                libc::epoll_wait(self.fd, events.as_mut_ptr(), events.len() as i32, -1)
            };
            if count >= 0 {
                return Ok(count as usize);
            }
            let code = errno();
            if code != libc::EINTR {
                log::error!(
                    "epoll_wait: {}",
                    std::io::Error::from_raw_os_error(code)
                );
                return Err(FatalError::os("epoll_wait", code));
            }
        }
    }

    fn close(&mut self) -> Result<(), FatalError> {
        if self.fd == -1 {
            return Ok(());
        }
        if unsafe { libc::close(self.fd) } == -1 {
            return Err(FatalError::os("close", errno()));
        }
        self.fd = -1;
        Ok(())
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
