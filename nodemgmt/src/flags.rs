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

//! Node header flags.
//!
//! On flash the flags are a little-endian `u16`:
//!
//! | bits  | field                                   |
//! |-------|-----------------------------------------|
//! | 0-3   | category, one-hot                       |
//! | 4     | previous generation data (data parents) |
//! | 5     | mirror marker, set only on `fakeFlags`  |
//! | 6-12  | owner user id                           |
//! | 13    | free (erased) when set                  |
//! | 14-15 | node type                               |

use modular_bitfield::prelude::*;

#[derive(Debug, PartialEq, Eq, Clone, Copy, BitfieldSpecifier)]
#[cfg_attr(feature = "emulator", derive(serde::Serialize, serde::Deserialize))]
#[bits = 2]
pub enum NodeType {
    CredParent,
    CredChild,
    DataParent,
    DataChild,
}

impl NodeType {
    pub fn is_parent(&self) -> bool {
        matches!(self, NodeType::CredParent | NodeType::DataParent)
    }

    /// Number of base node slots taken by a node of this type
    pub fn slots(&self) -> usize {
        if self.is_parent() {
            1
        } else {
            2
        }
    }
}

#[bitfield]
#[derive(Clone, Copy)]
struct RawFlags {
    category: B4,
    prev_gen: bool,
    mirror: bool,
    owner: B7,
    free: bool,
    node_type: NodeType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "emulator", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeFlags {
    pub node_type: NodeType,
    pub free: bool,
    pub owner: u8,
    /// Clear mirror marker: the word is a genuine node header
    pub integrity_ok: bool,
    pub prev_gen: bool,
    pub category: u8,
}

impl NodeFlags {
    /// Flags of a freshly allocated, in-use node
    pub fn new(node_type: NodeType, owner: u8) -> Self {
        NodeFlags {
            node_type,
            free: false,
            owner: owner & 0x7F,
            integrity_ok: true,
            prev_gen: false,
            category: 0,
        }
    }

    pub fn from_raw(raw: u16) -> Self {
        let bits = RawFlags::from_bytes(raw.to_le_bytes());
        NodeFlags {
            node_type: bits.node_type(),
            free: bits.free(),
            owner: bits.owner(),
            integrity_ok: !bits.mirror(),
            prev_gen: bits.prev_gen(),
            category: bits.category(),
        }
    }

    pub fn to_raw(&self) -> u16 {
        let bits = RawFlags::new()
            .with_node_type(self.node_type)
            .with_free(self.free)
            .with_owner(self.owner & 0x7F)
            .with_mirror(!self.integrity_ok)
            .with_prev_gen(self.prev_gen)
            .with_category(self.category & 0x0F);
        u16::from_le_bytes(bits.into_bytes())
    }

    /// Copy stored at the start of a child's second half
    pub fn mirrored(&self) -> Self {
        NodeFlags {
            integrity_ok: false,
            ..*self
        }
    }

    pub fn with_owner(self, owner: u8) -> Self {
        NodeFlags {
            owner: owner & 0x7F,
            ..self
        }
    }

    pub fn with_category(self, category: u8) -> Self {
        NodeFlags {
            category: category & 0x0F,
            ..self
        }
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn is_free(&self) -> bool {
        self.free
    }

    pub fn owner(&self) -> u8 {
        self.owner
    }

    pub fn is_integrity_ok(&self) -> bool {
        self.integrity_ok
    }
}

/// Category id to the one-hot representation stored in the flags
pub fn category_flags(category_id: u8) -> u8 {
    match category_id {
        0 => 0,
        id => 1 << (id - 1),
    }
}
