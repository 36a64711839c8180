// nodedb credential database firmware and supporting software libraries
//
// Copyright (C) 2024 Alekos Filini
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use core::fmt;

use crate::address::NodeAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No free slot left for the requested node
    NoSpace,
    /// A credential parent with the same service name already exists
    DuplicateKey,

    /// Address bytes received from the host have the wrong length
    MalformedAddress,
    InvalidAddress(NodeAddress),
    InvalidUser(u8),
    InvalidIndex,

    /// A link led to a node owned by another user or to a corrupted node header.
    ///
    /// This is never recoverable: the firmware must stop instead of continuing.
    IntegrityViolation(NodeAddress),

    Flash(FlashError),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::IntegrityViolation(_))
    }
}

impl From<FlashError> for Error {
    fn from(e: FlashError) -> Self {
        Error::Flash(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoSpace => write!(f, "no free node left"),
            Error::DuplicateKey => write!(f, "duplicate key"),
            Error::MalformedAddress => write!(f, "malformed node address"),
            Error::InvalidAddress(addr) => write!(f, "invalid node address {}", addr),
            Error::InvalidUser(uid) => write!(f, "invalid user id {}", uid),
            Error::InvalidIndex => write!(f, "index out of range"),
            Error::IntegrityViolation(addr) => write!(f, "integrity violation at {}", addr),
            Error::Flash(e) => write!(f, "flash error: {:?}", e),
        }
    }
}

#[cfg(not(feature = "device"))]
impl std::error::Error for Error {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    /// Access outside of the chip or across a page boundary
    OutOfBounds { page: u16, offset: usize, len: usize },
    Busy,
    Io,
}
