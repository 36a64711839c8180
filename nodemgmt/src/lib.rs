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

#![cfg_attr(feature = "device", no_std)]

//! Flash-resident credential and data database.
//!
//! Nodes live directly on raw NOR flash pages: parents form per-user alphabetical lists keyed by
//! service name, credential children form per-parent lists keyed by login and data children form
//! plain chains. Every node header carries the owner's user id, and following a link into a node
//! that belongs to somebody else is reported as [`Error::IntegrityViolation`], which the firmware
//! must treat as fatal.

extern crate alloc;

pub mod address;
pub mod error;
pub mod flags;
pub mod flash;
pub mod free;
pub mod geometry;
#[cfg(feature = "emulator")]
pub mod image;
pub mod list;
pub mod node;
pub mod permission;
pub mod profile;
pub mod session;

pub use address::NodeAddress;
pub use error::{Error, FlashError};
pub use flags::{NodeFlags, NodeType};
pub use flash::FlashDriver;
#[cfg(any(test, feature = "emulator"))]
pub use flash::RamFlash;
pub use geometry::Geometry;
pub use session::Session;

/// Highest number of user profiles a chip can hold
pub const MAX_USERS: u8 = 112;

/// Size of a parent node, half of a child node
pub const BASE_NODE_SIZE: usize = 264;

/// Number of credential types, each with its own parent list
pub const NB_CRED_ROOTS: usize = 10;
/// Number of data types, each with its own data parent list
pub const NB_DATA_ROOTS: usize = 7;

/// Favorite categories, including the "no category" one at index 0
pub const NB_CATEGORIES: usize = 5;
/// Favorite slots per category
pub const NB_FAVORITES: usize = 10;

/// Unicode code unit used for every on-flash string
pub type CustChar = u16;
