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

//! Per-user profile records.
//!
//! Profiles live in the pages below the first node page. With 264-byte pages a user takes two
//! pages (profile, then category names), with 528-byte pages both records share one page.

use crate::address::NodeAddress;
use crate::error::Error;
use crate::flash::FlashDriver;
use crate::geometry::Geometry;
use crate::node::CTR_LEN;
use crate::{CustChar, BASE_NODE_SIZE, NB_CATEGORIES, NB_CRED_ROOTS, NB_DATA_ROOTS, NB_FAVORITES};

pub const PROFILE_SIZE: usize = BASE_NODE_SIZE;

/// Number of user defined category names, category 0 has none
pub const NB_CATEGORY_NAMES: usize = NB_CATEGORIES - 1;
pub const CATEGORY_NAME_LEN: usize = 33;

pub const NB_ROOTS: usize = NB_CRED_ROOTS + NB_DATA_ROOTS;
pub const NB_FAVORITE_SLOTS: usize = NB_CATEGORIES * NB_FAVORITES;

const CRED_ROOTS_OFFSET: usize = 0;
const DATA_ROOTS_OFFSET: usize = CRED_ROOTS_OFFSET + 2 * NB_CRED_ROOTS;
const SEC_PREFERENCES_OFFSET: usize = 34;
const LANGUAGE_OFFSET: usize = 36;
const LAYOUT_OFFSET: usize = 38;
const BLE_LAYOUT_OFFSET: usize = 40;
const NB_LANGUAGES_OFFSET: usize = 42;
const NB_LAYOUTS_OFFSET: usize = 44;
const CTR_OFFSET: usize = 53;
const CRED_CHANGE_OFFSET: usize = 56;
const DATA_CHANGE_OFFSET: usize = 60;
const FAVORITES_OFFSET: usize = 64;
const FAVORITE_SIZE: usize = 4;

pub type CategoryName = [CustChar; CATEGORY_NAME_LEN];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub page: u16,
    pub offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "emulator", derive(serde::Serialize, serde::Deserialize))]
pub struct UserPreferences {
    pub sec_preferences: u16,
    pub language: u16,
    pub layout: u16,
    pub ble_layout: u16,
    /// Languages known to the device when the profile was written
    pub nb_languages: u16,
    pub nb_layouts: u16,
}

/// A credential pinned by the user: parent and child address, both NULL when unused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "emulator", derive(serde::Serialize, serde::Deserialize))]
pub struct Favorite {
    pub parent: NodeAddress,
    pub child: NodeAddress,
}

impl Favorite {
    pub const EMPTY: Favorite = Favorite {
        parent: NodeAddress::NULL,
        child: NodeAddress::NULL,
    };

    pub fn new(parent: NodeAddress, child: NodeAddress) -> Self {
        Favorite { parent, child }
    }

    pub fn is_set(&self) -> bool {
        !self.parent.is_null() && !self.child.is_null()
    }

    fn decode(bytes: &[u8]) -> Self {
        Favorite {
            parent: NodeAddress::from_raw(u16::from_le_bytes([bytes[0], bytes[1]])),
            child: NodeAddress::from_raw(u16::from_le_bytes([bytes[2], bytes[3]])),
        }
    }

    fn encode(&self, bytes: &mut [u8]) {
        bytes[..2].copy_from_slice(&self.parent.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.child.to_le_bytes());
    }
}

/// Index of a favorite: slot within the category and category id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FavoriteIndex {
    pub slot: usize,
    pub category: usize,
}

/// Where the records of one user are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Profile {
    pub profile: Location,
    pub category_names: Location,
}

impl Profile {
    pub fn locate(geometry: &Geometry, uid: u8) -> Result<Self, Error> {
        if uid >= geometry.max_users() {
            return Err(Error::InvalidUser(uid));
        }

        let uid = uid as u16;
        let profile = if geometry.bytes_per_page as usize == BASE_NODE_SIZE {
            Profile {
                profile: Location {
                    page: 2 * uid,
                    offset: 0,
                },
                category_names: Location {
                    page: 2 * uid + 1,
                    offset: 0,
                },
            }
        } else {
            Profile {
                profile: Location {
                    page: uid,
                    offset: 0,
                },
                category_names: Location {
                    page: uid,
                    offset: BASE_NODE_SIZE,
                },
            }
        };
        Ok(profile)
    }

    fn read<F: FlashDriver>(&self, flash: &mut F, offset: usize, buf: &mut [u8]) -> Result<(), Error> {
        flash.read_block(self.profile.page, self.profile.offset + offset, buf)?;
        Ok(())
    }

    fn write<F: FlashDriver>(&self, flash: &mut F, offset: usize, data: &[u8]) -> Result<(), Error> {
        flash.write_block(self.profile.page, self.profile.offset + offset, data)?;
        Ok(())
    }

    fn read_u16<F: FlashDriver>(&self, flash: &mut F, offset: usize) -> Result<u16, Error> {
        let mut buf = [0u8; 2];
        self.read(flash, offset, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn write_u16<F: FlashDriver>(&self, flash: &mut F, offset: usize, v: u16) -> Result<(), Error> {
        self.write(flash, offset, &v.to_le_bytes())
    }

    fn read_u32<F: FlashDriver>(&self, flash: &mut F, offset: usize) -> Result<u32, Error> {
        let mut buf = [0u8; 4];
        self.read(flash, offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u32<F: FlashDriver>(&self, flash: &mut F, offset: usize, v: u32) -> Result<(), Error> {
        self.write(flash, offset, &v.to_le_bytes())
    }

    /// Write a blank profile with the given preferences, and reset the category names
    pub fn format<F: FlashDriver>(&self, flash: &mut F, prefs: &UserPreferences) -> Result<(), Error> {
        flash.write_pattern(self.profile.page, self.profile.offset, PROFILE_SIZE, 0x00)?;
        self.write_u16(flash, NB_LAYOUTS_OFFSET, prefs.nb_layouts)?;
        self.write_u16(flash, NB_LANGUAGES_OFFSET, prefs.nb_languages)?;
        self.write_u16(flash, SEC_PREFERENCES_OFFSET, prefs.sec_preferences)?;
        self.write_u16(flash, BLE_LAYOUT_OFFSET, prefs.ble_layout)?;
        self.write_u16(flash, LANGUAGE_OFFSET, prefs.language)?;
        self.write_u16(flash, LAYOUT_OFFSET, prefs.layout)?;
        self.reset_category_names(flash)?;

        log::debug!("Profile formatted at page {}", self.profile.page);
        Ok(())
    }

    /// Zero the profile, dropping every root, and reset the category names
    pub fn erase<F: FlashDriver>(&self, flash: &mut F) -> Result<(), Error> {
        flash.write_pattern(self.profile.page, self.profile.offset, PROFILE_SIZE, 0x00)?;
        self.reset_category_names(flash)
    }

    fn reset_category_names<F: FlashDriver>(&self, flash: &mut F) -> Result<(), Error> {
        flash.write_pattern(
            self.category_names.page,
            self.category_names.offset,
            NB_CATEGORY_NAMES * CATEGORY_NAME_LEN * 2,
            0xFF,
        )?;
        Ok(())
    }

    pub fn cred_root<F: FlashDriver>(&self, flash: &mut F, type_id: usize) -> Result<NodeAddress, Error> {
        if type_id >= NB_CRED_ROOTS {
            return Err(Error::InvalidIndex);
        }
        Ok(NodeAddress::from_raw(
            self.read_u16(flash, CRED_ROOTS_OFFSET + 2 * type_id)?,
        ))
    }

    pub fn set_cred_root<F: FlashDriver>(
        &self,
        flash: &mut F,
        type_id: usize,
        addr: NodeAddress,
    ) -> Result<(), Error> {
        if type_id >= NB_CRED_ROOTS {
            return Err(Error::InvalidIndex);
        }
        self.write_u16(flash, CRED_ROOTS_OFFSET + 2 * type_id, addr.raw())
    }

    pub fn data_root<F: FlashDriver>(&self, flash: &mut F, type_id: usize) -> Result<NodeAddress, Error> {
        if type_id >= NB_DATA_ROOTS {
            return Err(Error::InvalidIndex);
        }
        Ok(NodeAddress::from_raw(
            self.read_u16(flash, DATA_ROOTS_OFFSET + 2 * type_id)?,
        ))
    }

    pub fn set_data_root<F: FlashDriver>(
        &self,
        flash: &mut F,
        type_id: usize,
        addr: NodeAddress,
    ) -> Result<(), Error> {
        if type_id >= NB_DATA_ROOTS {
            return Err(Error::InvalidIndex);
        }
        self.write_u16(flash, DATA_ROOTS_OFFSET + 2 * type_id, addr.raw())
    }

    /// Credential roots followed by data roots
    pub fn roots<F: FlashDriver>(&self, flash: &mut F) -> Result<[NodeAddress; NB_ROOTS], Error> {
        let mut buf = [0u8; 2 * NB_ROOTS];
        self.read(flash, CRED_ROOTS_OFFSET, &mut buf)?;

        let mut roots = [NodeAddress::NULL; NB_ROOTS];
        for (root, bytes) in roots.iter_mut().zip(buf.chunks_exact(2)) {
            *root = NodeAddress::from_le_slice(bytes)?;
        }
        Ok(roots)
    }

    pub fn set_roots<F: FlashDriver>(&self, flash: &mut F, roots: &[NodeAddress; NB_ROOTS]) -> Result<(), Error> {
        let mut buf = [0u8; 2 * NB_ROOTS];
        for (bytes, root) in buf.chunks_exact_mut(2).zip(roots.iter()) {
            bytes.copy_from_slice(&root.to_le_bytes());
        }
        self.write(flash, CRED_ROOTS_OFFSET, &buf)
    }

    pub fn preferences<F: FlashDriver>(&self, flash: &mut F) -> Result<UserPreferences, Error> {
        Ok(UserPreferences {
            sec_preferences: self.read_u16(flash, SEC_PREFERENCES_OFFSET)?,
            language: self.read_u16(flash, LANGUAGE_OFFSET)?,
            layout: self.read_u16(flash, LAYOUT_OFFSET)?,
            ble_layout: self.read_u16(flash, BLE_LAYOUT_OFFSET)?,
            nb_languages: self.read_u16(flash, NB_LANGUAGES_OFFSET)?,
            nb_layouts: self.read_u16(flash, NB_LAYOUTS_OFFSET)?,
        })
    }

    pub fn set_sec_preferences<F: FlashDriver>(&self, flash: &mut F, v: u16) -> Result<(), Error> {
        self.write_u16(flash, SEC_PREFERENCES_OFFSET, v)
    }

    pub fn set_language<F: FlashDriver>(&self, flash: &mut F, v: u16) -> Result<(), Error> {
        self.write_u16(flash, LANGUAGE_OFFSET, v)
    }

    pub fn set_layout<F: FlashDriver>(&self, flash: &mut F, v: u16) -> Result<(), Error> {
        self.write_u16(flash, LAYOUT_OFFSET, v)
    }

    pub fn set_ble_layout<F: FlashDriver>(&self, flash: &mut F, v: u16) -> Result<(), Error> {
        self.write_u16(flash, BLE_LAYOUT_OFFSET, v)
    }

    pub fn ctr<F: FlashDriver>(&self, flash: &mut F) -> Result<[u8; CTR_LEN], Error> {
        let mut ctr = [0u8; CTR_LEN];
        self.read(flash, CTR_OFFSET, &mut ctr)?;
        Ok(ctr)
    }

    pub fn set_ctr<F: FlashDriver>(&self, flash: &mut F, ctr: &[u8; CTR_LEN]) -> Result<(), Error> {
        self.write(flash, CTR_OFFSET, ctr)
    }

    pub fn cred_change_number<F: FlashDriver>(&self, flash: &mut F) -> Result<u32, Error> {
        self.read_u32(flash, CRED_CHANGE_OFFSET)
    }

    pub fn set_cred_change_number<F: FlashDriver>(&self, flash: &mut F, v: u32) -> Result<(), Error> {
        self.write_u32(flash, CRED_CHANGE_OFFSET, v)
    }

    pub fn data_change_number<F: FlashDriver>(&self, flash: &mut F) -> Result<u32, Error> {
        self.read_u32(flash, DATA_CHANGE_OFFSET)
    }

    pub fn set_data_change_number<F: FlashDriver>(&self, flash: &mut F, v: u32) -> Result<(), Error> {
        self.write_u32(flash, DATA_CHANGE_OFFSET, v)
    }

    fn favorite_offset(category: usize, slot: usize) -> Result<usize, Error> {
        if category >= NB_CATEGORIES || slot >= NB_FAVORITES {
            return Err(Error::InvalidIndex);
        }
        Ok(FAVORITES_OFFSET + (category * NB_FAVORITES + slot) * FAVORITE_SIZE)
    }

    pub fn favorite<F: FlashDriver>(&self, flash: &mut F, category: usize, slot: usize) -> Result<Favorite, Error> {
        let mut buf = [0u8; FAVORITE_SIZE];
        self.read(flash, Self::favorite_offset(category, slot)?, &mut buf)?;
        Ok(Favorite::decode(&buf))
    }

    pub fn set_favorite<F: FlashDriver>(
        &self,
        flash: &mut F,
        category: usize,
        slot: usize,
        favorite: Favorite,
    ) -> Result<(), Error> {
        let offset = Self::favorite_offset(category, slot)?;
        let mut buf = [0u8; FAVORITE_SIZE];
        favorite.encode(&mut buf);
        self.write(flash, offset, &buf)
    }

    /// Every favorite, category after category
    pub fn favorites<F: FlashDriver>(&self, flash: &mut F) -> Result<[Favorite; NB_FAVORITE_SLOTS], Error> {
        let mut buf = [0u8; NB_FAVORITE_SLOTS * FAVORITE_SIZE];
        self.read(flash, FAVORITES_OFFSET, &mut buf)?;

        let mut favorites = [Favorite::EMPTY; NB_FAVORITE_SLOTS];
        for (favorite, bytes) in favorites.iter_mut().zip(buf.chunks_exact(FAVORITE_SIZE)) {
            *favorite = Favorite::decode(bytes);
        }
        Ok(favorites)
    }

    pub fn set_favorites<F: FlashDriver>(
        &self,
        flash: &mut F,
        favorites: &[Favorite; NB_FAVORITE_SLOTS],
    ) -> Result<(), Error> {
        let mut buf = [0u8; NB_FAVORITE_SLOTS * FAVORITE_SIZE];
        for (bytes, favorite) in buf.chunks_exact_mut(FAVORITE_SIZE).zip(favorites.iter()) {
            favorite.encode(bytes);
        }
        self.write(flash, FAVORITES_OFFSET, &buf)
    }

    /// First set favorite at `slot` or after it.
    ///
    /// Slots are scanned in order; when `across_categories` is set every category is tried for
    /// each slot, starting from `category` on the first one.
    pub fn next_favorite<F: FlashDriver>(
        &self,
        flash: &mut F,
        slot: usize,
        category: usize,
        across_categories: bool,
    ) -> Result<Option<FavoriteIndex>, Error> {
        if slot >= NB_FAVORITES || category >= NB_CATEGORIES {
            return Ok(None);
        }

        let favorites = self.favorites(flash)?;
        let end = if across_categories {
            NB_CATEGORIES
        } else {
            category + 1
        };
        let mut start = category;
        for slot in slot..NB_FAVORITES {
            for category in start..end {
                if favorites[category * NB_FAVORITES + slot].is_set() {
                    return Ok(Some(FavoriteIndex { slot, category }));
                }
            }
            if across_categories {
                start = 0;
            }
        }

        Ok(None)
    }

    /// Last set favorite at `slot` or before it, scanning categories downwards
    pub fn prev_favorite<F: FlashDriver>(
        &self,
        flash: &mut F,
        slot: usize,
        category: usize,
        across_categories: bool,
    ) -> Result<Option<FavoriteIndex>, Error> {
        if slot >= NB_FAVORITES || category >= NB_CATEGORIES {
            return Ok(None);
        }

        let favorites = self.favorites(flash)?;
        let end = if across_categories { 0 } else { category };
        let mut start = category;
        for slot in (0..=slot).rev() {
            for category in (end..=start).rev() {
                if favorites[category * NB_FAVORITES + slot].is_set() {
                    return Ok(Some(FavoriteIndex { slot, category }));
                }
            }
            if across_categories {
                start = NB_CATEGORIES - 1;
            }
        }

        Ok(None)
    }

    fn category_name_offset(&self, id: usize) -> Result<usize, Error> {
        if id >= NB_CATEGORY_NAMES {
            return Err(Error::InvalidIndex);
        }
        Ok(self.category_names.offset + id * CATEGORY_NAME_LEN * 2)
    }

    pub fn category_name<F: FlashDriver>(&self, flash: &mut F, id: usize) -> Result<CategoryName, Error> {
        let offset = self.category_name_offset(id)?;
        let mut buf = [0u8; CATEGORY_NAME_LEN * 2];
        flash.read_block(self.category_names.page, offset, &mut buf)?;
        Ok(decode_name(&buf))
    }

    pub fn set_category_name<F: FlashDriver>(
        &self,
        flash: &mut F,
        id: usize,
        name: &CategoryName,
    ) -> Result<(), Error> {
        let offset = self.category_name_offset(id)?;
        let mut buf = [0u8; CATEGORY_NAME_LEN * 2];
        encode_name(name, &mut buf);
        flash.write_block(self.category_names.page, offset, &buf)?;
        Ok(())
    }

    pub fn category_names<F: FlashDriver>(
        &self,
        flash: &mut F,
    ) -> Result<[CategoryName; NB_CATEGORY_NAMES], Error> {
        let mut buf = [0u8; NB_CATEGORY_NAMES * CATEGORY_NAME_LEN * 2];
        flash.read_block(self.category_names.page, self.category_names.offset, &mut buf)?;

        let mut names = [[0u16; CATEGORY_NAME_LEN]; NB_CATEGORY_NAMES];
        for (name, bytes) in names.iter_mut().zip(buf.chunks_exact(CATEGORY_NAME_LEN * 2)) {
            *name = decode_name(bytes);
        }
        Ok(names)
    }

    pub fn set_category_names<F: FlashDriver>(
        &self,
        flash: &mut F,
        names: &[CategoryName; NB_CATEGORY_NAMES],
    ) -> Result<(), Error> {
        let mut buf = [0u8; NB_CATEGORY_NAMES * CATEGORY_NAME_LEN * 2];
        for (bytes, name) in buf.chunks_exact_mut(CATEGORY_NAME_LEN * 2).zip(names.iter()) {
            encode_name(name, bytes);
        }
        flash.write_block(self.category_names.page, self.category_names.offset, &buf)?;
        Ok(())
    }
}

/// Decode a stored name, forcing the terminator on the last character
fn decode_name(bytes: &[u8]) -> CategoryName {
    let mut name = [0u16; CATEGORY_NAME_LEN];
    for (c, b) in name.iter_mut().zip(bytes.chunks_exact(2)) {
        *c = u16::from_le_bytes([b[0], b[1]]);
    }
    name[CATEGORY_NAME_LEN - 1] = 0;
    name
}

fn encode_name(name: &CategoryName, bytes: &mut [u8]) {
    for (b, c) in bytes.chunks_exact_mut(2).zip(name.iter()) {
        b.copy_from_slice(&c.to_le_bytes());
    }
}

pub fn format_profile<F: FlashDriver>(flash: &mut F, uid: u8, prefs: &UserPreferences) -> Result<(), Error> {
    let geometry = *flash.geometry();
    Profile::locate(&geometry, uid)?.format(flash, prefs)
}
