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

//! Flash chip geometries.
//!
//! Node addresses and on-flash layouts depend on the page size and on the size of the reserved
//! profile sector, so a database written for one chip must never be read with another geometry.

use core::fmt;
use core::str::FromStr;

use crate::{BASE_NODE_SIZE, MAX_USERS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "emulator", derive(serde::Serialize, serde::Deserialize))]
pub enum Chip {
    Flash1M,
    Flash2M,
    Flash4M,
    Flash8M,
    Flash16M,
    Flash32M,
}

impl Chip {
    pub fn name(&self) -> &'static str {
        match self {
            Chip::Flash1M => "1m",
            Chip::Flash2M => "2m",
            Chip::Flash4M => "4m",
            Chip::Flash8M => "8m",
            Chip::Flash16M => "16m",
            Chip::Flash32M => "32m",
        }
    }

    pub fn id(&self) -> u8 {
        *self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Geometry::ALL
            .iter()
            .map(|g| g.chip)
            .find(|chip| chip.id() == id)
    }

    pub fn geometry(&self) -> Geometry {
        match self {
            Chip::Flash1M => Geometry::FLASH_1M,
            Chip::Flash2M => Geometry::FLASH_2M,
            Chip::Flash4M => Geometry::FLASH_4M,
            Chip::Flash8M => Geometry::FLASH_8M,
            Chip::Flash16M => Geometry::FLASH_16M,
            Chip::Flash32M => Geometry::FLASH_32M,
        }
    }
}

impl fmt::Display for Chip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Chip {
    type Err = GeometryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Geometry::ALL
            .iter()
            .map(|g| g.chip)
            .find(|chip| chip.name().eq_ignore_ascii_case(s))
            .ok_or(GeometryError::UnknownChip)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "emulator", derive(serde::Serialize, serde::Deserialize))]
pub struct Geometry {
    pub chip: Chip,
    pub page_count: u16,
    pub bytes_per_page: u16,
    /// Pages at the start of the chip reserved for user profiles
    pub pages_per_sector: u16,
}

impl Geometry {
    pub const FLASH_1M: Geometry = Geometry {
        chip: Chip::Flash1M,
        page_count: 512,
        bytes_per_page: 264,
        pages_per_sector: 128,
    };
    pub const FLASH_2M: Geometry = Geometry {
        chip: Chip::Flash2M,
        page_count: 1024,
        bytes_per_page: 264,
        pages_per_sector: 128,
    };
    pub const FLASH_4M: Geometry = Geometry {
        chip: Chip::Flash4M,
        page_count: 2048,
        bytes_per_page: 264,
        pages_per_sector: 256,
    };
    pub const FLASH_8M: Geometry = Geometry {
        chip: Chip::Flash8M,
        page_count: 4096,
        bytes_per_page: 264,
        pages_per_sector: 256,
    };
    pub const FLASH_16M: Geometry = Geometry {
        chip: Chip::Flash16M,
        page_count: 4096,
        bytes_per_page: 528,
        pages_per_sector: 256,
    };
    pub const FLASH_32M: Geometry = Geometry {
        chip: Chip::Flash32M,
        page_count: 8192,
        bytes_per_page: 528,
        pages_per_sector: 128,
    };

    pub const ALL: [Geometry; 6] = [
        Self::FLASH_1M,
        Self::FLASH_2M,
        Self::FLASH_4M,
        Self::FLASH_8M,
        Self::FLASH_16M,
        Self::FLASH_32M,
    ];

    /// Geometry of the chip selected at build time
    pub const DEFAULT: Geometry = if cfg!(feature = "flash-1m") {
        Self::FLASH_1M
    } else if cfg!(feature = "flash-2m") {
        Self::FLASH_2M
    } else if cfg!(feature = "flash-4m") {
        Self::FLASH_4M
    } else if cfg!(feature = "flash-8m") {
        Self::FLASH_8M
    } else if cfg!(feature = "flash-32m") {
        Self::FLASH_32M
    } else {
        Self::FLASH_16M
    };

    pub const fn nodes_per_page(&self) -> u16 {
        self.bytes_per_page / BASE_NODE_SIZE as u16
    }

    /// First page that may hold nodes
    pub const fn first_node_page(&self) -> u16 {
        self.pages_per_sector
    }

    /// Total number of base node slots available for nodes
    pub const fn node_slots(&self) -> usize {
        (self.page_count - self.pages_per_sector) as usize * self.nodes_per_page() as usize
    }

    pub const fn size(&self) -> usize {
        self.page_count as usize * self.bytes_per_page as usize
    }

    /// Pages used by a user profile and its category strings
    const fn pages_per_user(&self) -> u16 {
        if self.nodes_per_page() == 1 {
            2
        } else {
            1
        }
    }

    /// Number of user profiles that fit in the reserved sector
    pub fn max_users(&self) -> u8 {
        let fit = self.pages_per_sector / self.pages_per_user();
        core::cmp::min(fit, MAX_USERS as u16) as u8
    }

    pub fn validate(&self) -> Result<(), GeometryError> {
        if self.bytes_per_page as usize != BASE_NODE_SIZE
            && self.bytes_per_page as usize != 2 * BASE_NODE_SIZE
        {
            return Err(GeometryError::UnsupportedPageSize(self.bytes_per_page));
        }
        if self.pages_per_sector == 0 || self.pages_per_sector >= self.page_count {
            return Err(GeometryError::NoNodeSpace);
        }
        // Addresses store the page shifted left by one
        if self.page_count > 0x8000 {
            return Err(GeometryError::TooManyPages(self.page_count));
        }
        if self.max_users() == 0 {
            return Err(GeometryError::NoProfileSpace);
        }

        Ok(())
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryError {
    UnknownChip,
    UnsupportedPageSize(u16),
    TooManyPages(u16),
    NoNodeSpace,
    NoProfileSpace,
}
