use std::mem;

use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::Networking::WinSock::{
    AF_INET, IN_ADDR, IN_ADDR_0, INVALID_SOCKET, IPPROTO_TCP, SOCK_STREAM, SOCKADDR, SOCKADDR_IN,
    SO_REUSEADDR, SOCKET, SOCKET_ERROR, SOL_SOCKET, SOMAXCONN, WSA_FLAG_OVERLAPPED, WSASocketW,
    bind, closesocket, getsockname, listen, setsockopt,
};
use windows_sys::Win32::System::IO::CreateIoCompletionPort;

use crate::addr::Ipv4Address;
use crate::error::FatalError;

use super::{Server, last_error, last_socket_error};

/// A TCP socket owned either by the runtime or by the embedding application.
///
/// Move-only: ownership changes hands explicitly (`Accepted::claim`,
/// `Server::create_dock`) and the handle is closed exactly once, by
/// [`Socket::destroy`] or by the drop at the end of the last owner's life.
pub struct Socket {
    raw: SOCKET,
}

impl Server {
    /// Creates a socket bound to `0.0.0.0:port` and listening with the OS
    /// backlog maximum.
    ///
    /// The listener is created in overlapped mode and associated with the
    /// completion port before it is bound. Each step of the pipeline
    /// short-circuits on failure and reports the failing call. Setup errors
    /// are always fatal.
    pub fn create_socket(&mut self, port: u16) -> Result<Socket, FatalError> {
        let socket = create_unbound()?;
        self.register_socket(&socket)?;
        socket.enable_address_reuse()?;
        socket.bind(port)?;
        socket.listen()?;
        log::debug!("listening socket bound to port {port}");
        Ok(socket)
    }

    /// Associates a socket with the completion port.
    pub(crate) fn register_socket(&self, socket: &Socket) -> Result<(), FatalError> {
        let result = unsafe {
            CreateIoCompletionPort(socket.raw as HANDLE, self.port, 0, 0)
        };
        if result.is_null() {
            return Err(FatalError::os("CreateIoCompletionPort", last_error()));
        }
        Ok(())
    }
}

/// Creates an unbound overlapped-mode socket.
pub(crate) fn create_unbound() -> Result<Socket, FatalError> {
    let raw = unsafe {
        WSASocketW(
            AF_INET as i32,
            SOCK_STREAM as i32,
            IPPROTO_TCP as i32,
            std::ptr::null(),
            0,
            WSA_FLAG_OVERLAPPED,
        )
    };
    if raw == INVALID_SOCKET {
        return Err(FatalError::os("WSASocket", last_socket_error()));
    }
    Ok(Socket { raw })
}

impl Socket {
    /// Returns the raw socket handle without transferring ownership.
    #[inline]
    pub fn as_raw(&self) -> SOCKET {
        self.raw
    }

    fn enable_address_reuse(&self) -> Result<(), FatalError> {
        let enable: i32 = 1;
        let result = unsafe {
            setsockopt(
                self.raw,
                SOL_SOCKET as i32,
                SO_REUSEADDR as i32,
                &enable as *const i32 as *const u8,
                mem::size_of::<i32>() as i32,
            )
        };
        if result == SOCKET_ERROR {
            return Err(FatalError::os("setsockopt", last_socket_error()));
        }
        Ok(())
    }

    fn bind(&self, port: u16) -> Result<(), FatalError> {
        let address = SOCKADDR_IN {
            sin_family: AF_INET,
            sin_port: port.to_be(),
            sin_addr: IN_ADDR {
                S_un: IN_ADDR_0 { S_addr: 0 },
            },
            sin_zero: [0; 8],
        };
        let result = unsafe {
            bind(
                self.raw,
                &address as *const SOCKADDR_IN as *const SOCKADDR,
                mem::size_of::<SOCKADDR_IN>() as i32,
            )
        };
        if result == SOCKET_ERROR {
            return Err(FatalError::os("bind", last_socket_error()));
        }
        Ok(())
    }

    fn listen(&self) -> Result<(), FatalError> {
        if unsafe { listen(self.raw, SOMAXCONN as i32) } == SOCKET_ERROR {
            return Err(FatalError::os("listen", last_socket_error()));
        }
        Ok(())
    }

    /// Returns the locally bound address.
    ///
    /// The main use is recovering the port after binding port 0.
    pub fn local_addr(&self) -> Result<Ipv4Address, FatalError> {
        let mut storage: SOCKADDR_IN = unsafe { mem::zeroed() };
        let mut length = mem::size_of::<SOCKADDR_IN>() as i32;
        let result = unsafe {
            getsockname(
                self.raw,
                &mut storage as *mut SOCKADDR_IN as *mut SOCKADDR,
                &mut length,
            )
        };
        if result == SOCKET_ERROR {
            return Err(FatalError::os("getsockname", last_socket_error()));
        }
        Ok(address_from_raw(&storage))
    }

    /// Closes the socket handle.
    ///
    /// Safe to call on an already-destroyed socket.
    pub fn destroy(&mut self) -> Result<(), FatalError> {
        if self.raw == INVALID_SOCKET {
            return Ok(());
        }
        if unsafe { closesocket(self.raw) } == SOCKET_ERROR {
            return Err(FatalError::os("closesocket", last_socket_error()));
        }
        self.raw = INVALID_SOCKET;
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
}

impl Drop for Socket {
    fn drop(&mut self) {
        if self.raw != INVALID_SOCKET {
            if let Err(error) = self.destroy() {
                log::warn!("leaking socket after a failed close: {error}");
            }
        }
    }
}

/// Converts a wire-format `SOCKADDR_IN` into the host-readable form.
pub(crate) fn address_from_raw(raw: &SOCKADDR_IN) -> Ipv4Address {
    let octets = unsafe { raw.sin_addr.S_un.S_addr }.to_ne_bytes();
    Ipv4Address::new(octets, u16::from_be(raw.sin_port))
}
