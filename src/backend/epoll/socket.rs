use std::mem;
use std::os::fd::RawFd;

use crate::addr::Ipv4Address;
use crate::error::{ErrorCode, FatalError, errno};

use super::Server;

/// How a socket participates in the event loop.
///
/// The role steers registration bookkeeping: an accepted socket joins the
/// epoll set on its first queued operation (`Io`) and is re-armed with a
/// modify thereafter (`IoRearmed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Listening,
    AcceptPending,
    Io,
    IoRearmed,
}

/// A TCP socket owned either by the runtime or by the embedding application.
///
/// Move-only: ownership changes hands explicitly (`Accepted::claim`,
/// `Server::create_dock`) and the descriptor is closed exactly once, by
/// [`Socket::destroy`] or by the drop at the end of the last owner's life.
pub struct Socket {
    fd: RawFd,
    role: Role,
}

impl Server {
    /// Creates a socket bound to `0.0.0.0:port` and listening with the OS
    /// backlog maximum.
    ///
    /// Each step of the pipeline short-circuits on failure and reports the
    /// failing call. Setup errors are always fatal.
    pub fn create_socket(&mut self, port: u16) -> Result<Socket, FatalError> {
        let socket = create_unbound()?;
        socket.set_nonblocking(true)?;
        socket.enable_address_reuse()?;
        socket.bind(port)?;
        socket.listen()?;
        log::debug!("listening socket bound to port {port}");
        Ok(socket)
    }
}

fn create_unbound() -> Result<Socket, FatalError> {
    let fd = unsafe {
        libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0)
    };
    if fd == -1 {
        return Err(FatalError::os("socket", errno()));
    }
    Ok(Socket {
        fd,
        role: Role::Listening,
    })
}

impl Socket {
    /// Wraps a descriptor fresh out of `accept4`.
    pub(crate) fn io(fd: RawFd) -> Self {
        Self { fd, role: Role::Io }
    }

    /// Returns the raw file descriptor without transferring ownership.
    #[inline]
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn set_role(&mut self, role: Role) {
        self.role = role;
    }

    /// Sets or clears `O_NONBLOCK` on the descriptor.
    pub(crate) fn set_nonblocking(&self, nonblocking: bool) -> Result<(), FatalError> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags == -1 {
            return Err(FatalError::os("fcntl", errno()));
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags) } == -1 {
            return Err(FatalError::os("fcntl", errno()));
        }
        Ok(())
    }

    fn enable_address_reuse(&self) -> Result<(), FatalError> {
        let enable: libc::c_int = 1;
        let result = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &enable as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if result == -1 {
            return Err(FatalError::os("setsockopt", errno()));
        }
        Ok(())
    }

    fn bind(&self, port: u16) -> Result<(), FatalError> {
        let address = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: libc::INADDR_ANY.to_be(),
            },
            sin_zero: [0; 8],
        };
        let result = unsafe {
            libc::bind(
                self.fd,
                &address as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if result == -1 {
            return Err(FatalError::os("bind", errno()));
        }
        Ok(())
    }

    fn listen(&self) -> Result<(), FatalError> {
        if unsafe { libc::listen(self.fd, libc::SOMAXCONN) } == -1 {
            return Err(FatalError::os("listen", errno()));
        }
        Ok(())
    }

    /// Returns the locally bound address.
    ///
    /// The main use is recovering the port after binding port 0.
    pub fn local_addr(&self) -> Result<Ipv4Address, FatalError> {
        let mut storage: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut length = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let result = unsafe {
            libc::getsockname(
                self.fd,
                &mut storage as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut length,
            )
        };
        if result == -1 {
            return Err(FatalError::os("getsockname", errno()));
        }
        Ok(address_from_raw(&storage))
    }

    /// Closes the descriptor.
    ///
    /// Safe to call on an already-destroyed socket. A close that fails with a
    /// would-block class code is retried once after forcing the descriptor
    /// back to blocking mode; the kernel can refuse the first close while
    /// queued data is still draining.
    pub fn destroy(&mut self) -> Result<(), FatalError> {
        if self.fd == -1 {
            return Ok(());
        }
        if unsafe { libc::close(self.fd) } != 0 {
            let code = errno();
            let can_retry = matches!(
                ErrorCode::classify(code),
                Some(ErrorCode::WouldBlock | ErrorCode::TryAgain)
            );
            if !can_retry {
                return Err(FatalError::os("close", code));
            }
            self.set_nonblocking(false)?;
            if unsafe { libc::close(self.fd) } != 0 {
                return Err(FatalError::os("close", errno()));
            }
        }
        self.fd = -1;
        Ok(())
    }

    /// Storage size of a socket, for embedders allocating it externally.
    pub const fn size() -> usize {
        mem::size_of::<Self>()
    }

    /// Storage alignment of a socket.
    pub const fn alignment() -> usize {
        mem::align_of::<Self>()
    }

    #[cfg(test)]
    pub(crate) fn invalid_for_tests() -> Self {
        Self {
            fd: -1,
            role: Role::Io,
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if self.fd != -1 {
            if let Err(error) = self.destroy() {
                log::warn!("leaking descriptor after a failed close: {error}");
            }
        }
    }
}

impl std::os::fd::AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

/// Converts a wire-format `sockaddr_in` into the host-readable form.
pub(crate) fn address_from_raw(raw: &libc::sockaddr_in) -> Ipv4Address {
    Ipv4Address::new(raw.sin_addr.s_addr.to_ne_bytes(), u16::from_be(raw.sin_port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reported_layout_matches_storage() {
        assert_eq!(Socket::size(), mem::size_of::<Socket>());
        assert_eq!(Socket::alignment(), mem::align_of::<Socket>());
        assert!(Socket::alignment().is_power_of_two());
    }

    #[test]
    fn destroy_is_idempotent_on_an_invalid_descriptor() {
        let mut socket = Socket::invalid_for_tests();
        assert!(socket.destroy().is_ok());
        assert!(socket.destroy().is_ok());
    }

    #[test]
    fn wire_address_converts_to_host_form() {
        let raw = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 4070u16.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_be_bytes([127, 0, 0, 1]).to_be(),
            },
            sin_zero: [0; 8],
        };
        let address = address_from_raw(&raw);
        assert_eq!(address.octets(), [127, 0, 0, 1]);
        assert_eq!(address.port(), 4070);
    }
}
