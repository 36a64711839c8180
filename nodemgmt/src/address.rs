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

use crate::error::Error;
use crate::geometry::Geometry;
use crate::BASE_NODE_SIZE;

/// Logical node address: `page << 1 | slot`
///
/// `0` is the null address and terminates every list.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(
    feature = "emulator",
    derive(serde::Serialize, serde::Deserialize),
    serde(transparent)
)]
pub struct NodeAddress(u16);

impl NodeAddress {
    pub const NULL: NodeAddress = NodeAddress(0);

    pub const fn from_raw(raw: u16) -> Self {
        NodeAddress(raw)
    }

    pub const fn raw(&self) -> u16 {
        self.0
    }

    pub const fn encode(page: u16, slot: u8) -> Self {
        NodeAddress((page << 1) | (slot as u16 & 1))
    }

    pub const fn decode(&self) -> (u16, u8) {
        (self.page(), self.slot())
    }

    pub const fn page(&self) -> u16 {
        self.0 >> 1
    }

    pub const fn slot(&self) -> u8 {
        (self.0 & 1) as u8
    }

    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Byte offset of the slot within its page
    pub const fn offset(&self) -> usize {
        self.slot() as usize * BASE_NODE_SIZE
    }

    /// Address of the slot following this one, which holds the second half of a child node
    pub fn increment(&self, geometry: &Geometry) -> Self {
        if geometry.nodes_per_page() == 1 {
            NodeAddress(self.0.wrapping_add(2))
        } else {
            NodeAddress(self.0.wrapping_add(1))
        }
    }

    /// Whether the address points into the node area of the chip
    pub fn is_valid(&self, geometry: &Geometry) -> bool {
        let (page, slot) = self.decode();

        page >= geometry.first_node_page()
            && page < geometry.page_count
            && (slot as u16) < geometry.nodes_per_page()
    }

    /// Parse an address received from the host, stored as two little-endian bytes
    pub fn from_le_slice(bytes: &[u8]) -> Result<Self, Error> {
        let bytes: [u8; 2] = bytes.try_into().map_err(|_| Error::MalformedAddress)?;
        Ok(NodeAddress(u16::from_le_bytes(bytes)))
    }

    pub const fn to_le_bytes(&self) -> [u8; 2] {
        self.0.to_le_bytes()
    }
}

impl From<u16> for NodeAddress {
    fn from(raw: u16) -> Self {
        NodeAddress(raw)
    }
}

impl From<NodeAddress> for u16 {
    fn from(addr: NodeAddress) -> Self {
        addr.0
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "NodeAddress(NULL)")
        } else {
            write!(f, "NodeAddress({}:{})", self.page(), self.slot())
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}
