use std::fmt;

use crate::registry::RawHandle;

/// Which of a dock's two slots an operation occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
        })
    }
}

/// Identifies a dock registered with a [`Server`](crate::Server).
///
/// Handles are generation-checked: after the dock is destroyed the handle
/// goes stale and stops resolving instead of aliasing a recycled slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DockHandle(RawHandle);

impl DockHandle {
    pub(crate) fn new(token: RawHandle) -> Self {
        Self(token)
    }

    pub(crate) fn token(self) -> RawHandle {
        self.0
    }
}

/// Identifies an acceptor registered with a [`Server`](crate::Server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptorHandle(RawHandle);

impl AcceptorHandle {
    pub(crate) fn new(token: RawHandle) -> Self {
        Self(token)
    }
}

/// A completed read or write operation, as delivered to its callback.
///
/// Carries everything needed to resume a protocol from inside the callback:
/// the dock it ran on, its direction, and the buffer that was queued. For a
/// read the transferred prefix of the buffer holds the received bytes; for a
/// write the buffer is returned unchanged.
pub struct Operation {
    dock: DockHandle,
    direction: Direction,
    buffer: Vec<u8>,
}

impl Operation {
    pub(crate) fn new(dock: DockHandle, direction: Direction, buffer: Vec<u8>) -> Self {
        Self {
            dock,
            direction,
            buffer,
        }
    }

    /// The dock this operation belongs to.
    pub fn dock(&self) -> DockHandle {
        self.dock
    }

    /// Whether this was the read or the write slot.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The queued buffer.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Consumes the operation, handing the buffer back for reuse.
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    #[test]
    fn operation_reports_its_origin() {
        let mut registry = Registry::new();
        let dock = DockHandle::new(registry.insert(()));
        let operation = Operation::new(dock, Direction::Write, b"reply".to_vec());
        assert_eq!(operation.dock(), dock);
        assert_eq!(operation.direction(), Direction::Write);
        assert_eq!(operation.buffer(), b"reply");
        assert_eq!(operation.into_buffer(), b"reply".to_vec());
    }
}
