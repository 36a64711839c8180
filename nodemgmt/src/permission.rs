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

//! Ownership checks.
//!
//! The `*_fatal` variants are used wherever a failed check means the database or a link in it
//! is corrupted. They return [`Error::IntegrityViolation`], which callers must never try to
//! recover from.

use crate::address::NodeAddress;
use crate::error::Error;
use crate::flags::NodeFlags;
use crate::geometry::Geometry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Allowed,
    Denied,
}

/// Check the flags found at the start of a node
pub fn check(flags: NodeFlags, user: u8) -> Permission {
    if flags.is_free() || (flags.owner() == user && flags.is_integrity_ok()) {
        Permission::Allowed
    } else {
        Permission::Denied
    }
}

/// Check the mirrored flags found at the start of a child's second half
pub fn check_mirror(flags: NodeFlags, user: u8) -> Permission {
    if flags.is_free() || (flags.owner() == user && !flags.is_integrity_ok()) {
        Permission::Allowed
    } else {
        Permission::Denied
    }
}

pub fn check_fatal(addr: NodeAddress, flags: NodeFlags, user: u8) -> Result<(), Error> {
    match check(flags, user) {
        Permission::Allowed => Ok(()),
        Permission::Denied => {
            log::error!(
                "User {} denied access to {:?} owned by {} (flags {:#06x})",
                user,
                addr,
                flags.owner(),
                flags.to_raw()
            );
            Err(Error::IntegrityViolation(addr))
        }
    }
}

pub fn check_mirror_fatal(addr: NodeAddress, flags: NodeFlags, user: u8) -> Result<(), Error> {
    match check_mirror(flags, user) {
        Permission::Allowed => Ok(()),
        Permission::Denied => {
            log::error!(
                "User {} denied access to second half at {:?} (flags {:#06x})",
                user,
                addr,
                flags.to_raw()
            );
            Err(Error::IntegrityViolation(addr))
        }
    }
}

pub fn check_address(addr: NodeAddress, geometry: &Geometry) -> Result<(), Error> {
    if addr.is_valid(geometry) {
        Ok(())
    } else {
        Err(Error::InvalidAddress(addr))
    }
}

/// Address validity check for links read from flash
pub fn check_address_fatal(addr: NodeAddress, geometry: &Geometry) -> Result<(), Error> {
    if addr.is_valid(geometry) {
        Ok(())
    } else {
        log::error!("Followed a link to invalid address {:?}", addr);
        Err(Error::IntegrityViolation(addr))
    }
}
