use std::fmt;
use std::io;

use crate::operation::Direction;

/// Portable classification of the socket failures a correct server must
/// expect during normal operation.
///
/// Every native error surfaced to a user callback is first mapped through
/// [`ErrorCode::classify`]. The curated set intentionally covers peer-driven
/// and load-driven conditions (resets, refusals, would-block, address in use)
/// and not OS configuration errors; anything outside it is treated as fatal
/// by the runtime and never handed to user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ErrorCode {
    #[error("success")]
    Ok,
    #[error("permission denied")]
    AccessDenied,
    #[error("address family not supported")]
    AddressFamilyNotSupported,
    #[error("address already in use")]
    AddressInUse,
    #[error("socket is already connected")]
    AlreadyConnected,
    #[error("operation already in progress")]
    AlreadyStarted,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("bad descriptor")]
    BadDescriptor,
    #[error("bad address in arguments")]
    Fault,
    #[error("host unreachable")]
    HostUnreachable,
    #[error("operation in progress")]
    InProgress,
    #[error("interrupted by signal")]
    Interrupted,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("message too long")]
    MessageSize,
    #[error("name too long")]
    NameTooLong,
    #[error("network is down")]
    NetworkDown,
    #[error("connection dropped by network reset")]
    NetworkReset,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("too many open descriptors")]
    NoDescriptors,
    #[error("no buffer space available")]
    NoBufferSpace,
    #[error("out of memory")]
    NoMemory,
    #[error("operation not permitted")]
    NoPermission,
    #[error("protocol option not available")]
    NoProtocolOption,
    #[error("no such device")]
    NoSuchDevice,
    #[error("socket is not connected")]
    NotConnected,
    #[error("descriptor is not a socket")]
    NotSocket,
    #[error("operation aborted")]
    OperationAborted,
    #[error("operation not supported")]
    OperationNotSupported,
    #[error("endpoint has been shut down")]
    ShutDown,
    #[error("connection timed out")]
    TimedOut,
    #[error("resource temporarily unavailable")]
    TryAgain,
    #[error("operation would block")]
    WouldBlock,
}

impl ErrorCode {
    /// Returns `true` when `native` belongs to the curated recoverable set.
    pub fn is_recoverable(native: i32) -> bool {
        Self::classify(native).is_some()
    }
}

#[cfg(unix)]
impl ErrorCode {
    /// Maps a native errno value onto the portable taxonomy.
    ///
    /// Returns `None` for codes outside the curated set; callers must treat
    /// those as fatal. `EAGAIN` aliases `EWOULDBLOCK` on Linux, so the shared
    /// value classifies as [`ErrorCode::WouldBlock`].
    pub fn classify(native: i32) -> Option<Self> {
        let code = match native {
            0 => Self::Ok,
            libc::EACCES => Self::AccessDenied,
            libc::EAFNOSUPPORT => Self::AddressFamilyNotSupported,
            libc::EADDRINUSE => Self::AddressInUse,
            libc::EISCONN => Self::AlreadyConnected,
            libc::EALREADY => Self::AlreadyStarted,
            libc::EPIPE => Self::BrokenPipe,
            libc::ECONNABORTED => Self::ConnectionAborted,
            libc::ECONNREFUSED => Self::ConnectionRefused,
            libc::ECONNRESET => Self::ConnectionReset,
            libc::EBADF => Self::BadDescriptor,
            libc::EFAULT => Self::Fault,
            libc::EHOSTUNREACH => Self::HostUnreachable,
            libc::EINPROGRESS => Self::InProgress,
            libc::EINTR => Self::Interrupted,
            libc::EINVAL => Self::InvalidArgument,
            libc::EMSGSIZE => Self::MessageSize,
            libc::ENAMETOOLONG => Self::NameTooLong,
            libc::ENETDOWN => Self::NetworkDown,
            libc::ENETRESET => Self::NetworkReset,
            libc::ENETUNREACH => Self::NetworkUnreachable,
            libc::EMFILE => Self::NoDescriptors,
            libc::ENOBUFS => Self::NoBufferSpace,
            libc::ENOMEM => Self::NoMemory,
            libc::EPERM => Self::NoPermission,
            libc::ENOPROTOOPT => Self::NoProtocolOption,
            libc::ENODEV => Self::NoSuchDevice,
            libc::ENOTCONN => Self::NotConnected,
            libc::ENOTSOCK => Self::NotSocket,
            libc::ECANCELED => Self::OperationAborted,
            libc::EOPNOTSUPP => Self::OperationNotSupported,
            libc::ESHUTDOWN => Self::ShutDown,
            libc::ETIMEDOUT => Self::TimedOut,
            libc::EWOULDBLOCK => Self::WouldBlock,
            _ => return None,
        };
        Some(code)
    }
}

#[cfg(windows)]
impl ErrorCode {
    /// Maps a native Winsock or Win32 error value onto the portable taxonomy.
    ///
    /// Returns `None` for codes outside the curated set; callers must treat
    /// those as fatal.
    pub fn classify(native: i32) -> Option<Self> {
        use windows_sys::Win32::Foundation::{
            ERROR_ACCESS_DENIED, ERROR_BAD_UNIT, ERROR_BROKEN_PIPE, ERROR_OPERATION_ABORTED,
            ERROR_OUTOFMEMORY, ERROR_RETRY,
        };
        use windows_sys::Win32::Networking::WinSock::{
            WSAEACCES, WSAEADDRINUSE, WSAEAFNOSUPPORT, WSAEALREADY, WSAEBADF, WSAECONNABORTED,
            WSAECONNREFUSED, WSAECONNRESET, WSAEFAULT, WSAEHOSTUNREACH, WSAEINPROGRESS, WSAEINTR,
            WSAEINVAL, WSAEISCONN, WSAEMFILE, WSAEMSGSIZE, WSAENAMETOOLONG, WSAENETDOWN,
            WSAENETRESET, WSAENETUNREACH, WSAENOBUFS, WSAENOPROTOOPT, WSAENOTCONN, WSAENOTSOCK,
            WSAEOPNOTSUPP, WSAESHUTDOWN, WSAETIMEDOUT, WSAEWOULDBLOCK,
        };

        const BROKEN_PIPE: i32 = ERROR_BROKEN_PIPE as i32;
        const OUT_OF_MEMORY: i32 = ERROR_OUTOFMEMORY as i32;
        const NO_PERMISSION: i32 = ERROR_ACCESS_DENIED as i32;
        const BAD_UNIT: i32 = ERROR_BAD_UNIT as i32;
        const ABORTED: i32 = ERROR_OPERATION_ABORTED as i32;
        const RETRY: i32 = ERROR_RETRY as i32;

        let code = match native {
            0 => Self::Ok,
            WSAEACCES => Self::AccessDenied,
            WSAEAFNOSUPPORT => Self::AddressFamilyNotSupported,
            WSAEADDRINUSE => Self::AddressInUse,
            WSAEISCONN => Self::AlreadyConnected,
            WSAEALREADY => Self::AlreadyStarted,
            BROKEN_PIPE => Self::BrokenPipe,
            WSAECONNABORTED => Self::ConnectionAborted,
            WSAECONNREFUSED => Self::ConnectionRefused,
            WSAECONNRESET => Self::ConnectionReset,
            WSAEBADF => Self::BadDescriptor,
            WSAEFAULT => Self::Fault,
            WSAEHOSTUNREACH => Self::HostUnreachable,
            WSAEINPROGRESS => Self::InProgress,
            WSAEINTR => Self::Interrupted,
            WSAEINVAL => Self::InvalidArgument,
            WSAEMSGSIZE => Self::MessageSize,
            WSAENAMETOOLONG => Self::NameTooLong,
            WSAENETDOWN => Self::NetworkDown,
            WSAENETRESET => Self::NetworkReset,
            WSAENETUNREACH => Self::NetworkUnreachable,
            WSAEMFILE => Self::NoDescriptors,
            WSAENOBUFS => Self::NoBufferSpace,
            OUT_OF_MEMORY => Self::NoMemory,
            NO_PERMISSION => Self::NoPermission,
            WSAENOPROTOOPT => Self::NoProtocolOption,
            BAD_UNIT => Self::NoSuchDevice,
            WSAENOTCONN => Self::NotConnected,
            WSAENOTSOCK => Self::NotSocket,
            ABORTED => Self::OperationAborted,
            WSAEOPNOTSUPP => Self::OperationNotSupported,
            WSAESHUTDOWN => Self::ShutDown,
            WSAETIMEDOUT => Self::TimedOut,
            RETRY => Self::TryAgain,
            WSAEWOULDBLOCK => Self::WouldBlock,
            _ => return None,
        };
        Some(code)
    }
}

/// Returns the current errno value.
#[cfg(target_os = "linux")]
#[inline]
pub fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

/// An unrecoverable runtime failure.
///
/// Setup failures (socket or completion-primitive creation, bind, listen)
/// and any native error outside the curated set end up here. The failing
/// native call is named so diagnostics read like the OS reported them.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("{function} failed: {}", io::Error::from_raw_os_error(*.code))]
    Os { function: &'static str, code: i32 },

    #[error("socket capacity of {capacity} exhausted")]
    Capacity { capacity: usize },
}

impl FatalError {
    pub(crate) fn os(function: &'static str, code: i32) -> Self {
        Self::Os { function, code }
    }
}

/// Rejection of a `queue_read`/`queue_write` request.
///
/// Every variant hands the caller's buffer back through
/// [`QueueError::into_buffer`] so a rejected operation can be retried or
/// queued by the application itself.
#[derive(thiserror::Error)]
pub enum QueueError {
    #[error("buffer of {len} bytes exceeds the operation size limit")]
    BufferTooLarge { len: usize, buffer: Vec<u8> },

    #[error("a {direction} operation is already in flight")]
    SlotBusy {
        direction: Direction,
        buffer: Vec<u8>,
    },

    #[error("the dock no longer exists")]
    StaleDock { buffer: Vec<u8> },

    #[error("failed to arm the socket: {source}")]
    Arm {
        source: FatalError,
        buffer: Vec<u8>,
    },
}

impl QueueError {
    /// Recovers the buffer from a rejected operation.
    pub fn into_buffer(self) -> Vec<u8> {
        match self {
            Self::BufferTooLarge { buffer, .. }
            | Self::SlotBusy { buffer, .. }
            | Self::StaleDock { buffer }
            | Self::Arm { buffer, .. } => buffer,
        }
    }
}

// The buffers can be arbitrarily large; render their lengths instead.
impl fmt::Debug for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooLarge { len, .. } => {
                f.debug_struct("BufferTooLarge").field("len", len).finish()
            }
            Self::SlotBusy { direction, buffer } => f
                .debug_struct("SlotBusy")
                .field("direction", direction)
                .field("buffer_len", &buffer.len())
                .finish(),
            Self::StaleDock { buffer } => f
                .debug_struct("StaleDock")
                .field("buffer_len", &buffer.len())
                .finish(),
            Self::Arm { source, buffer } => f
                .debug_struct("Arm")
                .field("source", source)
                .field("buffer_len", &buffer.len())
                .finish(),
        }
    }
}

/// Rejection of a dock teardown request.
#[derive(Debug, thiserror::Error)]
pub enum DestroyError {
    #[error("a {0} operation is still in flight")]
    OperationPending(Direction),

    #[error(transparent)]
    Fatal(#[from] FatalError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn curated_codes_classify() {
        let table = [
            (0, ErrorCode::Ok),
            (libc::EACCES, ErrorCode::AccessDenied),
            (libc::EAFNOSUPPORT, ErrorCode::AddressFamilyNotSupported),
            (libc::EADDRINUSE, ErrorCode::AddressInUse),
            (libc::EISCONN, ErrorCode::AlreadyConnected),
            (libc::EALREADY, ErrorCode::AlreadyStarted),
            (libc::EPIPE, ErrorCode::BrokenPipe),
            (libc::ECONNABORTED, ErrorCode::ConnectionAborted),
            (libc::ECONNREFUSED, ErrorCode::ConnectionRefused),
            (libc::ECONNRESET, ErrorCode::ConnectionReset),
            (libc::EBADF, ErrorCode::BadDescriptor),
            (libc::EFAULT, ErrorCode::Fault),
            (libc::EHOSTUNREACH, ErrorCode::HostUnreachable),
            (libc::EINPROGRESS, ErrorCode::InProgress),
            (libc::EINTR, ErrorCode::Interrupted),
            (libc::EINVAL, ErrorCode::InvalidArgument),
            (libc::EMSGSIZE, ErrorCode::MessageSize),
            (libc::ENAMETOOLONG, ErrorCode::NameTooLong),
            (libc::ENETDOWN, ErrorCode::NetworkDown),
            (libc::ENETRESET, ErrorCode::NetworkReset),
            (libc::ENETUNREACH, ErrorCode::NetworkUnreachable),
            (libc::EMFILE, ErrorCode::NoDescriptors),
            (libc::ENOBUFS, ErrorCode::NoBufferSpace),
            (libc::ENOMEM, ErrorCode::NoMemory),
            (libc::EPERM, ErrorCode::NoPermission),
            (libc::ENOPROTOOPT, ErrorCode::NoProtocolOption),
            (libc::ENODEV, ErrorCode::NoSuchDevice),
            (libc::ENOTCONN, ErrorCode::NotConnected),
            (libc::ENOTSOCK, ErrorCode::NotSocket),
            (libc::ECANCELED, ErrorCode::OperationAborted),
            (libc::EOPNOTSUPP, ErrorCode::OperationNotSupported),
            (libc::ESHUTDOWN, ErrorCode::ShutDown),
            (libc::ETIMEDOUT, ErrorCode::TimedOut),
            (libc::EWOULDBLOCK, ErrorCode::WouldBlock),
        ];
        for (native, expected) in table {
            assert_eq!(ErrorCode::classify(native), Some(expected), "errno {native}");
            assert!(ErrorCode::is_recoverable(native));
        }
    }

    #[cfg(unix)]
    #[test]
    fn aliased_would_block_values_share_a_code() {
        assert_eq!(
            ErrorCode::classify(libc::EAGAIN),
            Some(ErrorCode::WouldBlock)
        );
    }

    #[cfg(unix)]
    #[test]
    fn uncurated_codes_are_fatal() {
        for native in [libc::ENOENT, libc::EIO, libc::ENOSPC, libc::EEXIST, -1] {
            assert_eq!(ErrorCode::classify(native), None, "errno {native}");
            assert!(!ErrorCode::is_recoverable(native));
        }
    }

    #[test]
    fn fatal_error_names_the_failing_call() {
        let error = FatalError::os("socket", 1);
        assert!(error.to_string().starts_with("socket failed: "));
    }

    #[test]
    fn queue_error_returns_the_buffer() {
        let error = QueueError::SlotBusy {
            direction: Direction::Read,
            buffer: vec![7; 16],
        };
        assert_eq!(error.into_buffer(), vec![7; 16]);
    }
}
