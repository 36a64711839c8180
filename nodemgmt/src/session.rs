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

//! Logged-in user context.
//!
//! A [`Session`] owns the flash driver for as long as one user is logged in. It caches the list
//! roots and tails of that user, the next free slots and the UI state (current date and
//! category), and every node access goes through the ownership checks of [`crate::permission`].

use alloc::vec::Vec;

use crate::address::NodeAddress;
use crate::error::Error;
use crate::flags::{category_flags, NodeFlags, NodeType};
use crate::flash::{fill_node, read_flags, read_node, write_node, FlashDriver};
use crate::free::{count_free_slots, find_free_nodes};
use crate::geometry::Geometry;
use crate::list::{self, read_checked_head, DuplicatePolicy};
use crate::node::{
    CredChildNode, DataChildNode, ListNode, NodeDate, NodeHeader, ParentNode, CHILD_SIZE, CTR_LEN,
    DATA_NEXT_OFFSET, DATA_PAYLOAD_LEN,
};
use crate::permission::{self, check_address_fatal, check_fatal, check_mirror_fatal, Permission};
use crate::profile::{
    CategoryName, Favorite, FavoriteIndex, Profile, UserPreferences, NB_CATEGORY_NAMES,
    NB_FAVORITE_SLOTS, NB_ROOTS,
};
use crate::{BASE_NODE_SIZE, NB_CATEGORIES, NB_CRED_ROOTS, NB_DATA_ROOTS};

/// Which family of parent lists an operation works on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "emulator", derive(serde::Serialize, serde::Deserialize))]
pub enum ParentKind {
    Credential,
    Data,
}

impl ParentKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            ParentKind::Credential => NodeType::CredParent,
            ParentKind::Data => NodeType::DataParent,
        }
    }

    pub fn nb_types(&self) -> usize {
        match self {
            ParentKind::Credential => NB_CRED_ROOTS,
            ParentKind::Data => NB_DATA_ROOTS,
        }
    }
}

pub struct Session<F: FlashDriver> {
    flash: F,
    geometry: Geometry,
    user: u8,
    profile: Profile,
    preferences: UserPreferences,

    cred_roots: [NodeAddress; NB_CRED_ROOTS],
    data_roots: [NodeAddress; NB_DATA_ROOTS],
    last_cred_parents: [NodeAddress; NB_CRED_ROOTS],
    last_data_parents: [NodeAddress; NB_DATA_ROOTS],

    next_free_parent: NodeAddress,
    next_free_child: NodeAddress,

    /// Packed [`NodeDate`], zero when unknown
    current_date: u16,
    current_category: u8,
    current_category_flags: u8,

    cred_db_changed: bool,
    data_db_changed: bool,
}

impl<F: FlashDriver> Session<F> {
    /// Log `uid` in: load its roots, find the list tails and the first free slots
    pub fn open(flash: F, uid: u8) -> Result<Self, Error> {
        let geometry = *flash.geometry();
        let profile = Profile::locate(&geometry, uid)?;

        let mut session = Session {
            flash,
            geometry,
            user: uid,
            profile,
            preferences: UserPreferences::default(),
            cred_roots: [NodeAddress::NULL; NB_CRED_ROOTS],
            data_roots: [NodeAddress::NULL; NB_DATA_ROOTS],
            last_cred_parents: [NodeAddress::NULL; NB_CRED_ROOTS],
            last_data_parents: [NodeAddress::NULL; NB_DATA_ROOTS],
            next_free_parent: NodeAddress::NULL,
            next_free_child: NodeAddress::NULL,
            current_date: 0,
            current_category: 0,
            current_category_flags: 0,
            cred_db_changed: false,
            data_db_changed: false,
        };

        session.load_roots()?;
        session.scan_for_last_parent_nodes()?;
        session.refresh_cache()?;
        session.preferences = session.profile.preferences(&mut session.flash)?;

        log::debug!(
            "Session opened for user {}, next free parent {:?} child {:?}",
            uid,
            session.next_free_parent,
            session.next_free_child
        );
        Ok(session)
    }

    /// End the session, giving the driver back
    pub fn close(self) -> F {
        log::debug!("Session closed for user {}", self.user);
        self.flash
    }

    pub fn user_id(&self) -> u8 {
        self.user
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn preferences(&self) -> UserPreferences {
        self.preferences
    }

    pub fn next_free_parent(&self) -> NodeAddress {
        self.next_free_parent
    }

    pub fn next_free_child(&self) -> NodeAddress {
        self.next_free_child
    }

    fn max_steps(&self) -> usize {
        self.geometry.node_slots()
    }

    fn load_roots(&mut self) -> Result<(), Error> {
        let roots = self.profile.roots(&mut self.flash)?;
        self.cred_roots.copy_from_slice(&roots[..NB_CRED_ROOTS]);
        self.data_roots.copy_from_slice(&roots[NB_CRED_ROOTS..]);
        Ok(())
    }

    /// Look for the next free parent and child, starting from the cached free parent
    pub fn refresh_cache(&mut self) -> Result<(), Error> {
        self.refresh_cache_from(self.next_free_parent)
    }

    fn refresh_cache_from(&mut self, start: NodeAddress) -> Result<(), Error> {
        let mut parent = [NodeAddress::NULL; 1];
        let mut child = [NodeAddress::NULL; 1];
        let (page, slot) = if start.is_null() {
            (self.geometry.first_node_page(), 0)
        } else {
            start.decode()
        };

        let (nb_parents, nb_children) =
            find_free_nodes(&mut self.flash, page, slot, &mut parent, &mut child)?;
        self.next_free_parent = if nb_parents == 1 { parent[0] } else { NodeAddress::NULL };
        self.next_free_child = if nb_children == 1 { child[0] } else { NodeAddress::NULL };

        log::trace!(
            "Free cache: parent {:?} child {:?}",
            self.next_free_parent,
            self.next_free_child
        );
        Ok(())
    }

    /// Refresh the free cache after `freed` was released, so the slot can be reused right away
    fn refresh_cache_after_free(&mut self, freed: NodeAddress) -> Result<(), Error> {
        let start = if self.next_free_parent.is_null() || freed < self.next_free_parent {
            freed
        } else {
            self.next_free_parent
        };
        self.refresh_cache_from(start)
    }

    /// Number of free slots in the whole node area
    pub fn free_slots(&mut self) -> Result<usize, Error> {
        count_free_slots(&mut self.flash)
    }

    /// Non-fatal permission check for addresses received from the host.
    ///
    /// Returns the node type, or `None` for a free slot. Addresses outside of the node area and
    /// nodes the user may not touch are both reported as [`Error::InvalidAddress`].
    pub fn check_user_permission(&mut self, addr: NodeAddress) -> Result<Option<NodeType>, Error> {
        permission::check_address(addr, &self.geometry)?;

        let flags = read_flags(&mut self.flash, addr)?;
        match permission::check(flags, self.user) {
            Permission::Denied => Err(Error::InvalidAddress(addr)),
            Permission::Allowed if flags.is_free() => Ok(None),
            Permission::Allowed => Ok(Some(flags.node_type())),
        }
    }

    // Roots

    fn root_index(kind: ParentKind, type_id: usize) -> Result<usize, Error> {
        if type_id >= kind.nb_types() {
            return Err(Error::InvalidIndex);
        }
        Ok(type_id)
    }

    pub fn root(&self, kind: ParentKind, type_id: usize) -> Result<NodeAddress, Error> {
        let i = Self::root_index(kind, type_id)?;
        Ok(match kind {
            ParentKind::Credential => self.cred_roots[i],
            ParentKind::Data => self.data_roots[i],
        })
    }

    pub fn cred_root(&self, type_id: usize) -> Result<NodeAddress, Error> {
        self.root(ParentKind::Credential, type_id)
    }

    pub fn data_root(&self, type_id: usize) -> Result<NodeAddress, Error> {
        self.root(ParentKind::Data, type_id)
    }

    pub fn cred_roots(&self) -> [NodeAddress; NB_CRED_ROOTS] {
        self.cred_roots
    }

    pub fn set_root(&mut self, kind: ParentKind, type_id: usize, addr: NodeAddress) -> Result<(), Error> {
        let i = Self::root_index(kind, type_id)?;
        match kind {
            ParentKind::Credential => {
                self.profile.set_cred_root(&mut self.flash, i, addr)?;
                self.cred_roots[i] = addr;
            }
            ParentKind::Data => {
                self.profile.set_data_root(&mut self.flash, i, addr)?;
                self.data_roots[i] = addr;
            }
        }
        Ok(())
    }

    /// Every root as stored in the profile, credential roots first
    pub fn roots(&mut self) -> Result<[NodeAddress; NB_ROOTS], Error> {
        self.profile.roots(&mut self.flash)
    }

    /// Replace every root at once, used when the host rewrites the database
    pub fn set_roots(&mut self, roots: &[NodeAddress; NB_ROOTS]) -> Result<(), Error> {
        self.profile.set_roots(&mut self.flash, roots)?;
        self.load_roots()?;
        self.scan_for_last_parent_nodes()
    }

    /// Cached tail of a parent list
    pub fn last_parent(&self, kind: ParentKind, type_id: usize) -> Result<NodeAddress, Error> {
        let i = Self::root_index(kind, type_id)?;
        Ok(match kind {
            ParentKind::Credential => self.last_cred_parents[i],
            ParentKind::Data => self.last_data_parents[i],
        })
    }

    fn set_last_parent(&mut self, kind: ParentKind, type_id: usize, addr: NodeAddress) {
        match kind {
            ParentKind::Credential => self.last_cred_parents[type_id] = addr,
            ParentKind::Data => self.last_data_parents[type_id] = addr,
        }
    }

    // Profile fields

    pub fn ctr(&mut self) -> Result<[u8; CTR_LEN], Error> {
        self.profile.ctr(&mut self.flash)
    }

    pub fn set_ctr(&mut self, ctr: &[u8; CTR_LEN]) -> Result<(), Error> {
        self.profile.set_ctr(&mut self.flash, ctr)
    }

    pub fn cred_change_number(&mut self) -> Result<u32, Error> {
        self.profile.cred_change_number(&mut self.flash)
    }

    pub fn set_cred_change_number(&mut self, v: u32) -> Result<(), Error> {
        self.profile.set_cred_change_number(&mut self.flash, v)
    }

    pub fn data_change_number(&mut self) -> Result<u32, Error> {
        self.profile.data_change_number(&mut self.flash)
    }

    pub fn set_data_change_number(&mut self, v: u32) -> Result<(), Error> {
        self.profile.set_data_change_number(&mut self.flash, v)
    }

    /// Bump the credential or data change number, at most once per session each
    pub fn db_changed(&mut self, data: bool) -> Result<(), Error> {
        if !data && !self.cred_db_changed {
            let v = self.cred_change_number()?.wrapping_add(1);
            self.set_cred_change_number(v)?;
            self.cred_db_changed = true;
            log::debug!("Credential change number now {}", v);
        }
        if data && !self.data_db_changed {
            let v = self.data_change_number()?.wrapping_add(1);
            self.set_data_change_number(v)?;
            self.data_db_changed = true;
            log::debug!("Data change number now {}", v);
        }
        Ok(())
    }

    pub fn set_sec_preferences(&mut self, v: u16) -> Result<(), Error> {
        self.profile.set_sec_preferences(&mut self.flash, v)?;
        self.preferences.sec_preferences = v;
        Ok(())
    }

    pub fn set_language(&mut self, v: u16) -> Result<(), Error> {
        self.profile.set_language(&mut self.flash, v)?;
        self.preferences.language = v;
        Ok(())
    }

    pub fn set_layout(&mut self, v: u16) -> Result<(), Error> {
        self.profile.set_layout(&mut self.flash, v)?;
        self.preferences.layout = v;
        Ok(())
    }

    pub fn set_ble_layout(&mut self, v: u16) -> Result<(), Error> {
        self.profile.set_ble_layout(&mut self.flash, v)?;
        self.preferences.ble_layout = v;
        Ok(())
    }

    pub fn favorite(&mut self, category: usize, slot: usize) -> Result<Favorite, Error> {
        self.profile.favorite(&mut self.flash, category, slot)
    }

    pub fn set_favorite(&mut self, category: usize, slot: usize, favorite: Favorite) -> Result<(), Error> {
        self.profile.set_favorite(&mut self.flash, category, slot, favorite)
    }

    pub fn favorite_for_current_category(&mut self, slot: usize) -> Result<Favorite, Error> {
        self.profile
            .favorite(&mut self.flash, self.current_category as usize, slot)
    }

    pub fn favorites(&mut self) -> Result<[Favorite; NB_FAVORITE_SLOTS], Error> {
        self.profile.favorites(&mut self.flash)
    }

    pub fn set_favorites(&mut self, favorites: &[Favorite; NB_FAVORITE_SLOTS]) -> Result<(), Error> {
        self.profile.set_favorites(&mut self.flash, favorites)
    }

    pub fn next_favorite(
        &mut self,
        slot: usize,
        category: usize,
        across_categories: bool,
    ) -> Result<Option<FavoriteIndex>, Error> {
        self.profile
            .next_favorite(&mut self.flash, slot, category, across_categories)
    }

    pub fn prev_favorite(
        &mut self,
        slot: usize,
        category: usize,
        across_categories: bool,
    ) -> Result<Option<FavoriteIndex>, Error> {
        self.profile
            .prev_favorite(&mut self.flash, slot, category, across_categories)
    }

    pub fn category_name(&mut self, id: usize) -> Result<CategoryName, Error> {
        self.profile.category_name(&mut self.flash, id)
    }

    pub fn set_category_name(&mut self, id: usize, name: &CategoryName) -> Result<(), Error> {
        self.profile.set_category_name(&mut self.flash, id, name)
    }

    pub fn category_names(&mut self) -> Result<[CategoryName; NB_CATEGORY_NAMES], Error> {
        self.profile.category_names(&mut self.flash)
    }

    pub fn set_category_names(&mut self, names: &[CategoryName; NB_CATEGORY_NAMES]) -> Result<(), Error> {
        self.profile.set_category_names(&mut self.flash, names)
    }

    // UI state

    pub fn set_current_date(&mut self, date: NodeDate) {
        self.current_date = date.pack();
    }

    pub fn current_date(&self) -> Option<NodeDate> {
        NodeDate::unpack(self.current_date)
    }

    /// Select the category used to filter navigation and to tag new nodes
    pub fn set_current_category(&mut self, id: u8) -> Result<(), Error> {
        if id as usize >= NB_CATEGORIES {
            return Err(Error::InvalidIndex);
        }

        self.current_category = id;
        self.current_category_flags = category_flags(id);
        Ok(())
    }

    pub fn current_category(&self) -> u8 {
        self.current_category
    }

    pub fn current_category_flags(&self) -> u8 {
        self.current_category_flags
    }

    // Node access

    fn read_head(&mut self, addr: NodeAddress) -> Result<[u8; BASE_NODE_SIZE], Error> {
        read_checked_head(&mut self.flash, self.user, addr)
    }

    fn read_parent_raw(&mut self, addr: NodeAddress) -> Result<ParentNode, Error> {
        let head = self.read_head(addr)?;
        Ok(ParentNode::decode_from(&head))
    }

    pub fn read_parent_node(&mut self, addr: NodeAddress) -> Result<ParentNode, Error> {
        let mut node = self.read_parent_raw(addr)?;
        node.clean_strings();
        Ok(node)
    }

    /// Write a parent back in place. The owner is always forced to the session user.
    pub fn write_parent_node(&mut self, addr: NodeAddress, node: &mut ParentNode) -> Result<(), Error> {
        check_address_fatal(addr, &self.geometry)?;
        check_fatal(addr, read_flags(&mut self.flash, addr)?, self.user)?;

        node.header.flags = node.header.flags.with_owner(self.user);
        write_node(&mut self.flash, addr, &node.to_bytes())?;
        Ok(())
    }

    /// Write a credential child back in place, keeping both copies of its flags in sync
    pub fn write_child_node(
        &mut self,
        addr: NodeAddress,
        node: &mut CredChildNode,
        write_category: bool,
    ) -> Result<(), Error> {
        check_address_fatal(addr, &self.geometry)?;
        check_fatal(addr, read_flags(&mut self.flash, addr)?, self.user)?;

        let mut flags = node.flags().with_owner(self.user);
        if write_category {
            flags = flags.with_category(self.current_category_flags);
        }
        node.set_flags(flags);
        write_node(&mut self.flash, addr, &node.to_bytes())?;
        Ok(())
    }

    fn read_child_raw(&mut self, addr: NodeAddress) -> Result<[u8; CHILD_SIZE], Error> {
        check_address_fatal(addr, &self.geometry)?;

        let mut buf = [0u8; CHILD_SIZE];
        read_node(&mut self.flash, addr, &mut buf)?;
        check_fatal(addr, NodeHeader::decode(&buf).flags, self.user)?;

        let second = addr.increment(&self.geometry);
        let mirror = NodeFlags::from_raw(u16::from_le_bytes([
            buf[BASE_NODE_SIZE],
            buf[BASE_NODE_SIZE + 1],
        ]));
        check_mirror_fatal(second, mirror, self.user)?;

        Ok(buf)
    }

    /// Read a whole credential, stamping its last used date with the current date
    pub fn read_cred_child_node(&mut self, addr: NodeAddress) -> Result<CredChildNode, Error> {
        let buf = self.read_child_raw(addr)?;
        let mut node = CredChildNode::decode_from(&buf);

        if self.current_date != 0 && node.date_last_used != self.current_date {
            node.date_last_used = self.current_date;
            self.write_child_node(addr, &mut node, false)?;
        }

        node.clean_strings();
        Ok(node)
    }

    /// Read the first half of a credential only, the secret fields come back zeroed
    pub fn read_cred_child_node_except_pwd(&mut self, addr: NodeAddress) -> Result<CredChildNode, Error> {
        let head = self.read_head(addr)?;
        let mut buf = [0u8; CHILD_SIZE];
        buf[..BASE_NODE_SIZE].copy_from_slice(&head);

        let mut node = CredChildNode::decode_from(&buf);
        node.clean_strings();
        Ok(node)
    }

    pub fn first_child_address(&mut self, parent: NodeAddress) -> Result<NodeAddress, Error> {
        Ok(self.read_parent_raw(parent)?.first_child)
    }

    pub fn set_last_used_child_node(&mut self, parent: NodeAddress, child: NodeAddress) -> Result<(), Error> {
        let mut node = self.read_parent_raw(parent)?;
        node.set_last_child_used(child);
        self.write_parent_node(parent, &mut node)
    }

    /// Insert a new parent in its sorted list and return where it was stored.
    ///
    /// Credential parents must have a unique service name within their list.
    pub fn create_parent_node(
        &mut self,
        kind: ParentKind,
        type_id: usize,
        node: &mut ParentNode,
    ) -> Result<NodeAddress, Error> {
        let root = self.root(kind, type_id)?;

        let mut flags = NodeFlags::new(kind.node_type(), self.user);
        if kind == ParentKind::Data {
            flags = flags.with_category(self.current_category_flags);
        }
        node.header.flags = flags;
        node.first_child = NodeAddress::NULL;

        let policy = match kind {
            ParentKind::Credential => DuplicatePolicy::Reject,
            ParentKind::Data => DuplicatePolicy::Allow,
        };
        let inserted = list::insert_sorted(
            &mut self.flash,
            self.user,
            root,
            self.next_free_parent,
            node,
            policy,
        )?;

        if inserted.root != root {
            self.set_root(kind, type_id, inserted.root)?;
        }
        if inserted.is_tail {
            self.set_last_parent(kind, type_id, inserted.stored);
        }
        self.refresh_cache()?;

        log::debug!("Created {:?} parent at {:?}", kind, inserted.stored);
        Ok(inserted.stored)
    }

    /// Insert a new credential under `parent`, tagged with the current category and date
    pub fn create_child_node(
        &mut self,
        parent: NodeAddress,
        node: &mut CredChildNode,
    ) -> Result<NodeAddress, Error> {
        node.date_created = self.current_date;
        node.date_last_used = self.current_date;
        node.set_flags(
            NodeFlags::new(NodeType::CredChild, self.user).with_category(self.current_category_flags),
        );

        let parent_node = self.read_parent_raw(parent)?;
        if parent_node.flags().node_type() != NodeType::CredParent {
            log::warn!("{:?} is not a credential parent", parent);
            return Err(Error::InvalidAddress(parent));
        }

        let first_child = parent_node.first_child;
        let inserted = list::insert_sorted(
            &mut self.flash,
            self.user,
            first_child,
            self.next_free_child,
            node,
            DuplicatePolicy::Allow,
        )?;

        if inserted.root != first_child {
            let mut parent_node = self.read_parent_raw(parent)?;
            parent_node.first_child = inserted.root;
            self.write_parent_node(parent, &mut parent_node)?;
        }
        self.refresh_cache()?;

        log::debug!("Created child at {:?} under {:?}", inserted.stored, parent);
        Ok(inserted.stored)
    }

    // Data chains

    /// Write a data child in the next free child slot. Linking it is up to the caller.
    pub fn store_data_node(&mut self, node: &mut DataChildNode) -> Result<NodeAddress, Error> {
        let addr = self.next_free_child;
        if addr.is_null() {
            log::warn!("No free slot left for a data node");
            return Err(Error::NoSpace);
        }

        check_address_fatal(addr, &self.geometry)?;
        node.set_flags(NodeFlags::new(NodeType::DataChild, self.user));
        write_node(&mut self.flash, addr, &node.to_bytes())?;
        self.refresh_cache()?;

        log::debug!("Stored {} data bytes at {:?}", node.data_length, addr);
        Ok(addr)
    }

    pub fn update_data_node_next(&mut self, addr: NodeAddress, next: NodeAddress) -> Result<(), Error> {
        let mut head = self.read_head(addr)?;
        head[DATA_NEXT_OFFSET..DATA_NEXT_OFFSET + 2].copy_from_slice(&next.to_le_bytes());
        write_node(&mut self.flash, addr, &head)?;
        Ok(())
    }

    /// Copy the payload of a data child into `out`.
    ///
    /// Returns the address of the next link and the number of valid bytes.
    pub fn read_data_node(
        &mut self,
        addr: NodeAddress,
        out: &mut [u8; DATA_PAYLOAD_LEN],
    ) -> Result<(NodeAddress, usize), Error> {
        let buf = self.read_child_raw(addr)?;
        let node = DataChildNode::from_bytes(&buf);

        out.copy_from_slice(&node.data);
        let len = core::cmp::min(node.data_length as usize, DATA_PAYLOAD_LEN);
        Ok((node.next, len))
    }

    /// First link of a data chain, the counter it starts from and its previous generation flag
    pub fn data_parent_ctr_and_first_child(
        &mut self,
        parent: NodeAddress,
    ) -> Result<(NodeAddress, [u8; CTR_LEN], bool), Error> {
        let node = self.read_parent_raw(parent)?;
        Ok((node.first_child, node.data_ctr(), node.flags().prev_gen))
    }

    pub fn update_data_parent_ctr_and_first_child(
        &mut self,
        parent: NodeAddress,
        ctr: [u8; CTR_LEN],
        first_child: NodeAddress,
    ) -> Result<(), Error> {
        let mut node = self.read_parent_raw(parent)?;
        node.set_data_ctr(ctr);
        node.first_child = first_child;
        self.write_parent_node(parent, &mut node)
    }

    // Listing

    /// Parents of one list, in order
    pub fn parents(&mut self, kind: ParentKind, type_id: usize) -> Result<Vec<NodeAddress>, Error> {
        let root = self.root(kind, type_id)?;
        list::iter(&mut self.flash, self.user, root)
            .map(|item| item.map(|(addr, _)| addr))
            .collect()
    }

    /// Credential children of a parent, in order
    pub fn children(&mut self, parent: NodeAddress) -> Result<Vec<NodeAddress>, Error> {
        let first = self.read_parent_raw(parent)?.first_child;
        list::iter(&mut self.flash, self.user, first)
            .map(|item| item.map(|(addr, _)| addr))
            .collect()
    }

    /// Links of a data parent's chain
    pub fn data_chain(&mut self, parent: NodeAddress) -> Result<Vec<NodeAddress>, Error> {
        let mut chain = Vec::new();
        let mut next = self.read_parent_raw(parent)?.first_child;
        while !next.is_null() {
            if chain.len() >= self.max_steps() {
                log::error!("Data chain of {:?} does not terminate", parent);
                return Err(Error::IntegrityViolation(next));
            }
            chain.push(next);
            let head = self.read_head(next)?;
            next = NodeAddress::from_le_slice(&head[DATA_NEXT_OFFSET..DATA_NEXT_OFFSET + 2])?;
        }
        Ok(chain)
    }

    // Navigation

    /// Walk a parent list to its tail.
    ///
    /// Invalid addresses, foreign nodes and lists that are not sorted on their first character
    /// stop the walk with a null address instead of an error, so a damaged list never prevents
    /// a user from logging in.
    pub fn last_parent_address(&mut self, kind: ParentKind, type_id: usize) -> Result<NodeAddress, Error> {
        let mut addr = self.root(kind, type_id)?;
        let mut last_first_char = 0u16;

        for _ in 0..self.max_steps() {
            if addr.is_null() {
                return Ok(NodeAddress::NULL);
            }
            if !addr.is_valid(&self.geometry) {
                log::warn!("Parent list {:?}/{} links to {:?}", kind, type_id, addr);
                return Ok(NodeAddress::NULL);
            }

            let mut head = [0u8; BASE_NODE_SIZE];
            read_node(&mut self.flash, addr, &mut head)?;
            let node = ParentNode::decode_from(&head);
            if permission::check(node.flags(), self.user) == Permission::Denied {
                return Ok(NodeAddress::NULL);
            }
            if node.service[0] < last_first_char {
                log::warn!("Parent list {:?}/{} is not sorted at {:?}", kind, type_id, addr);
                return Ok(NodeAddress::NULL);
            }
            last_first_char = node.service[0];

            if node.header.next.is_null() {
                return Ok(addr);
            }
            addr = node.header.next;
        }

        Ok(NodeAddress::NULL)
    }

    pub fn scan_for_last_parent_nodes(&mut self) -> Result<(), Error> {
        for i in 0..NB_CRED_ROOTS {
            self.last_cred_parents[i] = self.last_parent_address(ParentKind::Credential, i)?;
        }
        for i in 0..NB_DATA_ROOTS {
            self.last_data_parents[i] = self.last_parent_address(ParentKind::Data, i)?;
        }
        Ok(())
    }

    /// The database was modified from outside of this session
    pub fn db_ext_changed(&mut self) -> Result<(), Error> {
        self.scan_for_last_parent_nodes()
    }

    fn matches_category(flags: NodeFlags, category_flags: u8) -> bool {
        category_flags == 0 || flags.category == category_flags
    }

    /// First credential at or after `start` tagged with `category_flags`, 0 matching any
    pub fn first_child_with_category(
        &mut self,
        start: NodeAddress,
        category_flags: u8,
    ) -> Result<NodeAddress, Error> {
        let mut addr = start;
        for _ in 0..self.max_steps() {
            if addr.is_null() {
                return Ok(NodeAddress::NULL);
            }
            let header = NodeHeader::decode(&self.read_head(addr)?);
            if Self::matches_category(header.flags, category_flags) {
                return Ok(addr);
            }
            addr = header.next;
        }

        Err(Error::IntegrityViolation(addr))
    }

    pub fn next_child_for_category(&mut self, child: NodeAddress) -> Result<NodeAddress, Error> {
        let next = NodeHeader::decode(&self.read_head(child)?).next;
        self.first_child_with_category(next, self.current_category_flags)
    }

    pub fn prev_child_for_category(&mut self, child: NodeAddress) -> Result<NodeAddress, Error> {
        if child.is_null() {
            return Ok(NodeAddress::NULL);
        }

        let mut addr = NodeHeader::decode(&self.read_head(child)?).prev;
        for _ in 0..self.max_steps() {
            if addr.is_null() {
                return Ok(NodeAddress::NULL);
            }
            let header = NodeHeader::decode(&self.read_head(addr)?);
            if Self::matches_category(header.flags, self.current_category_flags) {
                return Ok(addr);
            }
            addr = header.prev;
        }

        Err(Error::IntegrityViolation(addr))
    }

    fn parent_has_category(&mut self, parent: &ParentNode) -> Result<bool, Error> {
        let found = self.first_child_with_category(parent.first_child, self.current_category_flags)?;
        Ok(!found.is_null())
    }

    /// Next credential parent holding a login of the current category, wrapping around.
    ///
    /// A null `start` looks from the head of the list. Returns a null address when nothing
    /// matches, when `start` itself has no matching login, or when `start` is the only match.
    pub fn next_parent_for_category(&mut self, start: NodeAddress, type_id: usize) -> Result<NodeAddress, Error> {
        let first = self.cred_root(type_id)?;

        let mut addr = first;
        if !start.is_null() {
            let node = self.read_parent_raw(start)?;
            if !self.parent_has_category(&node)? {
                return Ok(NodeAddress::NULL);
            }
            addr = if node.header.next.is_null() {
                first
            } else {
                node.header.next
            };
        }

        for _ in 0..self.max_steps() {
            if addr.is_null() {
                return Ok(NodeAddress::NULL);
            }

            let node = self.read_parent_raw(addr)?;
            if self.parent_has_category(&node)? {
                return Ok(if addr == start { NodeAddress::NULL } else { addr });
            }

            addr = node.header.next;
            if addr.is_null() {
                if start.is_null() {
                    return Ok(NodeAddress::NULL);
                }
                addr = first;
            }
        }

        Err(Error::IntegrityViolation(addr))
    }

    pub fn first_parent_for_category(&mut self, type_id: usize) -> Result<NodeAddress, Error> {
        self.next_parent_for_category(NodeAddress::NULL, type_id)
    }

    /// Walk backwards from `addr` included, returning the first parent with a matching login
    fn prev_matching_parent(&mut self, mut addr: NodeAddress) -> Result<NodeAddress, Error> {
        for _ in 0..self.max_steps() {
            if addr.is_null() {
                return Ok(NodeAddress::NULL);
            }

            let node = self.read_parent_raw(addr)?;
            if self.parent_has_category(&node)? {
                return Ok(addr);
            }
            addr = node.header.prev;
        }

        Err(Error::IntegrityViolation(addr))
    }

    /// Previous credential parent holding a login of the current category, wrapping around.
    ///
    /// A null `start` looks from the tail of the list.
    pub fn prev_parent_for_category(&mut self, start: NodeAddress, type_id: usize) -> Result<NodeAddress, Error> {
        let last = self.last_parent(ParentKind::Credential, type_id)?;
        if start.is_null() {
            return self.prev_matching_parent(last);
        }

        let prev = self.read_parent_raw(start)?.header.prev;
        let found = self.prev_matching_parent(prev)?;
        if !found.is_null() {
            return Ok(found);
        }

        let looped = self.prev_matching_parent(last)?;
        Ok(if looped == start { NodeAddress::NULL } else { looped })
    }

    // Deletion

    fn erase_child(&mut self, addr: NodeAddress) -> Result<(), Error> {
        fill_node(&mut self.flash, addr, NodeType::CredChild.slots(), 0xFF)?;
        Ok(())
    }

    /// Erase every child hanging from a parent, following either the login list or the data chain
    fn erase_children(&mut self, kind: ParentKind, first_child: NodeAddress) -> Result<usize, Error> {
        let mut next = first_child;
        let mut count = 0;
        while !next.is_null() {
            if count >= self.max_steps() {
                log::error!("Child list starting at {:?} does not terminate", first_child);
                return Err(Error::IntegrityViolation(next));
            }

            let head = self.read_head(next)?;
            let following = match kind {
                ParentKind::Credential => NodeHeader::decode(&head).next,
                ParentKind::Data => NodeAddress::from_le_slice(
                    &head[DATA_NEXT_OFFSET..DATA_NEXT_OFFSET + 2],
                )?,
            };
            self.erase_child(next)?;
            count += 1;
            next = following;
        }

        Ok(count)
    }

    /// Remove a credential from its parent.
    ///
    /// `child` must be part of the children of `parent`, otherwise nothing is written.
    pub fn delete_child(&mut self, parent: NodeAddress, child: NodeAddress) -> Result<(), Error> {
        let first_child = self.read_parent_raw(parent)?.first_child;
        let new_first = list::unlink(&mut self.flash, self.user, first_child, child)?;

        let mut parent_node = self.read_parent_raw(parent)?;
        if new_first != first_child || parent_node.last_child_used() == child {
            parent_node.first_child = new_first;
            if parent_node.last_child_used() == child {
                parent_node.set_last_child_used(NodeAddress::NULL);
            }
            self.write_parent_node(parent, &mut parent_node)?;
        }

        self.erase_child(child)?;
        self.refresh_cache_after_free(child)?;

        log::debug!("Deleted child {:?} of {:?}", child, parent);
        Ok(())
    }

    fn delete_parent_of(&mut self, kind: ParentKind, type_id: usize, parent: NodeAddress) -> Result<(), Error> {
        let root = self.root(kind, type_id)?;
        let node = self.read_parent_raw(parent)?;
        if node.flags().node_type() != kind.node_type() {
            log::warn!("{:?} is not a {:?} parent", parent, kind);
            return Err(Error::InvalidAddress(parent));
        }

        let erased = self.erase_children(kind, node.first_child)?;
        let new_root = list::unlink(&mut self.flash, self.user, root, parent)?;
        if new_root != root {
            self.set_root(kind, type_id, new_root)?;
        }
        fill_node(&mut self.flash, parent, 1, 0xFF)?;

        let last = self.last_parent_address(kind, type_id)?;
        self.set_last_parent(kind, type_id, last);
        self.refresh_cache_after_free(parent)?;

        log::debug!(
            "Deleted {:?} parent {:?} with {} child(ren)",
            kind,
            parent,
            erased
        );
        Ok(())
    }

    /// Remove a credential parent and every login under it
    pub fn delete_parent(&mut self, type_id: usize, parent: NodeAddress) -> Result<(), Error> {
        self.delete_parent_of(ParentKind::Credential, type_id, parent)
    }

    /// Remove a data parent and its whole chain
    pub fn delete_data_parent(&mut self, type_id: usize, parent: NodeAddress) -> Result<(), Error> {
        self.delete_parent_of(ParentKind::Data, type_id, parent)
    }

    /// Erase every node of the user, then its profile.
    ///
    /// The session stays open on an empty database.
    pub fn delete_current_user(&mut self) -> Result<(), Error> {
        let roots = self.profile.roots(&mut self.flash)?;
        let mut erased = 0;

        for (i, root) in roots.iter().enumerate() {
            let kind = if i < NB_CRED_ROOTS {
                ParentKind::Credential
            } else {
                ParentKind::Data
            };

            let mut next = *root;
            while !next.is_null() {
                if erased >= self.max_steps() {
                    log::error!("Parent lists of user {} do not terminate", self.user);
                    return Err(Error::IntegrityViolation(next));
                }

                let node = self.read_parent_raw(next)?;
                erased += self.erase_children(kind, node.first_child)?;
                fill_node(&mut self.flash, next, 1, 0xFF)?;
                erased += 1;
                next = node.header.next;
            }
        }

        self.profile.erase(&mut self.flash)?;
        self.load_roots()?;
        self.last_cred_parents = [NodeAddress::NULL; NB_CRED_ROOTS];
        self.last_data_parents = [NodeAddress::NULL; NB_DATA_ROOTS];
        self.preferences = self.profile.preferences(&mut self.flash)?;
        self.refresh_cache_from(NodeAddress::NULL)?;

        log::info!("Deleted user {} ({} nodes)", self.user, erased);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    use super::*;
    use crate::flash::RamFlash;
    use crate::profile::format_profile;
    use crate::test_utils::{init_log, key, key_to_string};
    use crate::node::SERVICE_LEN;

    const ALICE: u8 = 1;
    const BOB: u8 = 2;

    fn formatted(geometry: Geometry) -> RamFlash {
        let mut flash = RamFlash::new(geometry);
        for uid in [ALICE, BOB] {
            format_profile(&mut flash, uid, &UserPreferences::default()).unwrap();
        }
        flash
    }

    fn service(name: &str) -> ParentNode {
        ParentNode::new(NodeType::CredParent, &key::<SERVICE_LEN>(name))
    }

    fn login(name: &str) -> CredChildNode {
        CredChildNode::new(&key::<8>(name))
    }

    fn service_names<F: FlashDriver>(session: &mut Session<F>, kind: ParentKind) -> Vec<String> {
        session
            .parents(kind, 0)
            .unwrap()
            .into_iter()
            .map(|addr| key_to_string(&session.read_parent_node(addr).unwrap().service))
            .collect()
    }

    #[test]
    fn test_open_checks_user() {
        let flash = formatted(Geometry::FLASH_1M);
        let max = Geometry::FLASH_1M.max_users();
        assert!(matches!(
            Session::open(flash, max),
            Err(Error::InvalidUser(uid)) if uid == max
        ));
    }

    #[test]
    fn test_open_empty() {
        init_log();
        let geometry = Geometry::FLASH_16M;
        let mut flash = formatted(geometry);
        let writes = flash.write_count();
        let session = Session::open(&mut flash, ALICE).unwrap();

        let first = NodeAddress::encode(geometry.first_node_page(), 0);
        assert_eq!(session.next_free_parent(), first);
        assert_eq!(session.next_free_child(), first.increment(&geometry));
        assert_eq!(session.cred_roots(), [NodeAddress::NULL; NB_CRED_ROOTS]);
        assert_eq!(session.preferences(), UserPreferences::default());

        // Opening a session does not write anything
        session.close();
        assert_eq!(flash.write_count(), writes);
    }

    #[test]
    fn test_service_ordering() {
        init_log();
        let mut session = Session::open(formatted(Geometry::FLASH_1M), ALICE).unwrap();
        for name in ["amazon.com", "github.com", "bbc.co.uk"] {
            session
                .create_parent_node(ParentKind::Credential, 0, &mut service(name))
                .unwrap();
        }

        assert_eq!(
            service_names(&mut session, ParentKind::Credential),
            vec!["amazon.com", "bbc.co.uk", "github.com"]
        );

        let github = session.parents(ParentKind::Credential, 0).unwrap()[2];
        assert_eq!(
            session.last_parent(ParentKind::Credential, 0).unwrap(),
            github
        );
        assert_eq!(
            session.last_parent_address(ParentKind::Credential, 0).unwrap(),
            github
        );
    }

    #[test]
    fn test_root_persisted_in_profile() {
        let mut session = Session::open(formatted(Geometry::FLASH_2M), ALICE).unwrap();
        let b = session
            .create_parent_node(ParentKind::Credential, 3, &mut service("b"))
            .unwrap();
        let a = session
            .create_parent_node(ParentKind::Credential, 3, &mut service("a"))
            .unwrap();
        assert_eq!(session.cred_root(3).unwrap(), a);
        assert_eq!(session.last_parent(ParentKind::Credential, 3).unwrap(), b);

        let flash = session.close();
        let mut session = Session::open(flash, ALICE).unwrap();
        assert_eq!(session.cred_root(3).unwrap(), a);
        assert_eq!(session.last_parent(ParentKind::Credential, 3).unwrap(), b);
        assert_eq!(session.roots().unwrap()[3], a);
        assert_eq!(
            session.create_parent_node(ParentKind::Credential, 10, &mut service("x")),
            Err(Error::InvalidIndex)
        );
    }

    #[test]
    fn test_sort_invariant_random_order() {
        init_log();
        let mut names: Vec<String> = (0..40).map(|i| format!("service{:02}.example", i)).collect();
        let mut rng = StdRng::seed_from_u64(0x5EED);
        names.shuffle(&mut rng);

        let mut session = Session::open(formatted(Geometry::FLASH_1M), ALICE).unwrap();
        for name in &names {
            session
                .create_parent_node(ParentKind::Credential, 0, &mut service(name))
                .unwrap();
        }

        let stored = service_names(&mut session, ParentKind::Credential);
        names.sort();
        assert_eq!(stored, names);

        // The list is doubly linked with null ends
        let addrs = session.parents(ParentKind::Credential, 0).unwrap();
        let first = session.read_parent_node(addrs[0]).unwrap();
        let last = session.read_parent_node(*addrs.last().unwrap()).unwrap();
        assert!(first.header.prev.is_null());
        assert!(last.header.next.is_null());
        for pair in addrs.windows(2) {
            assert_eq!(session.read_parent_node(pair[1]).unwrap().header.prev, pair[0]);
        }
    }

    #[test]
    fn test_duplicate_service_rejected() {
        let mut session = Session::open(formatted(Geometry::FLASH_1M), ALICE).unwrap();
        session
            .create_parent_node(ParentKind::Credential, 0, &mut service("github.com"))
            .unwrap();
        let free = session.free_slots().unwrap();

        assert_eq!(
            session.create_parent_node(ParentKind::Credential, 0, &mut service("github.com")),
            Err(Error::DuplicateKey)
        );
        assert_eq!(session.free_slots().unwrap(), free);

        // Another credential type has its own list
        session
            .create_parent_node(ParentKind::Credential, 1, &mut service("github.com"))
            .unwrap();
        // Data parents accept duplicates
        for _ in 0..2 {
            session
                .create_parent_node(ParentKind::Data, 0, &mut service("github.com"))
                .unwrap();
        }
        assert_eq!(session.parents(ParentKind::Data, 0).unwrap().len(), 2);
    }

    #[test]
    fn test_first_child_linkage() {
        let mut session = Session::open(formatted(Geometry::FLASH_16M), ALICE).unwrap();
        session.set_current_date(NodeDate::new(2024, 5, 1));

        let parent = session
            .create_parent_node(ParentKind::Credential, 0, &mut service("github.com"))
            .unwrap();
        let bob = session.create_child_node(parent, &mut login("bob")).unwrap();
        assert_eq!(session.first_child_address(parent).unwrap(), bob);

        let alice = session.create_child_node(parent, &mut login("alice")).unwrap();
        assert_eq!(session.first_child_address(parent).unwrap(), alice);
        let carol = session.create_child_node(parent, &mut login("carol")).unwrap();
        assert_eq!(session.first_child_address(parent).unwrap(), alice);
        assert_eq!(session.children(parent).unwrap(), vec![alice, bob, carol]);

        // Children are two adjacent slots, the parent a single one
        assert_eq!(session.check_user_permission(parent), Ok(Some(NodeType::CredParent)));
        assert_eq!(session.check_user_permission(bob), Ok(Some(NodeType::CredChild)));
        let second_half = bob.increment(session.geometry());
        assert_eq!(
            session.check_user_permission(second_half),
            Err(Error::InvalidAddress(second_half))
        );

        let node = session.read_cred_child_node(bob).unwrap();
        assert_eq!(NodeDate::unpack(node.date_created), Some(NodeDate::new(2024, 5, 1)));
        assert_eq!(node.flags().owner(), ALICE);
        assert_eq!(node.fake_flags, node.flags().mirrored());
    }

    #[test]
    fn test_read_updates_last_used_date() {
        let mut session = Session::open(formatted(Geometry::FLASH_1M), ALICE).unwrap();
        let parent = session
            .create_parent_node(ParentKind::Credential, 0, &mut service("example.org"))
            .unwrap();
        let mut child = login("me");
        child.password[..4].copy_from_slice(b"pwd!");
        let addr = session.create_child_node(parent, &mut child).unwrap();
        assert_eq!(session.read_cred_child_node(addr).unwrap().date_last_used, 0);

        session.set_current_date(NodeDate::new(2025, 1, 2));
        session.read_cred_child_node(addr).unwrap();
        let node = session.read_cred_child_node_except_pwd(addr).unwrap();
        assert_eq!(NodeDate::unpack(node.date_last_used), Some(NodeDate::new(2025, 1, 2)));
        assert_eq!(node.date_created, 0);
        assert_eq!(node.password, [0u8; crate::node::PASSWORD_LEN]);

        let node = session.read_cred_child_node(addr).unwrap();
        assert_eq!(&node.password[..4], b"pwd!");
    }

    #[test]
    fn test_ownership_isolation() {
        init_log();
        let mut flash = formatted(Geometry::FLASH_1M);

        let mut alice = Session::open(&mut flash, ALICE).unwrap();
        let parent = alice
            .create_parent_node(ParentKind::Credential, 0, &mut service("shared.com"))
            .unwrap();
        let child = alice.create_child_node(parent, &mut login("alice")).unwrap();
        alice.close();

        let mut bob = Session::open(&mut flash, BOB).unwrap();
        assert_eq!(
            bob.check_user_permission(parent),
            Err(Error::InvalidAddress(parent))
        );
        assert_eq!(
            bob.read_parent_node(parent),
            Err(Error::IntegrityViolation(parent))
        );
        assert_eq!(
            bob.read_cred_child_node(child),
            Err(Error::IntegrityViolation(child))
        );
        assert!(bob
            .create_child_node(parent, &mut login("bob"))
            .unwrap_err()
            .is_fatal());

        // Bob's own nodes never land on Alice's slots
        let own = bob
            .create_parent_node(ParentKind::Credential, 0, &mut service("shared.com"))
            .unwrap();
        assert_ne!(own, parent);
        assert_eq!(bob.parents(ParentKind::Credential, 0).unwrap(), vec![own]);
    }

    #[test]
    fn test_pointing_root_at_foreign_node() {
        let mut flash = formatted(Geometry::FLASH_1M);
        let mut alice = Session::open(&mut flash, ALICE).unwrap();
        let parent = alice
            .create_parent_node(ParentKind::Credential, 0, &mut service("a.com"))
            .unwrap();
        alice.close();

        let mut bob = Session::open(&mut flash, BOB).unwrap();
        let mut roots = [NodeAddress::NULL; NB_ROOTS];
        roots[0] = parent;
        bob.set_roots(&roots).unwrap();
        // The tail scan gives up quietly, the insert walk does not
        assert_eq!(bob.last_parent(ParentKind::Credential, 0).unwrap(), NodeAddress::NULL);
        assert_eq!(
            bob.create_parent_node(ParentKind::Credential, 0, &mut service("b.com")),
            Err(Error::IntegrityViolation(parent))
        );
    }

    #[test]
    fn test_free_alloc_balance() {
        let geometry = Geometry::FLASH_16M;
        let mut session = Session::open(formatted(geometry), ALICE).unwrap();
        let total = session.free_slots().unwrap();
        assert_eq!(total, geometry.node_slots());

        let mut parents = Vec::new();
        for i in 0..5 {
            let parent = session
                .create_parent_node(ParentKind::Credential, 0, &mut service(&format!("s{}", i)))
                .unwrap();
            for j in 0..i {
                session
                    .create_child_node(parent, &mut login(&format!("l{}", j)))
                    .unwrap();
            }
            parents.push(parent);
        }

        // 5 parents and 0+1+2+3+4 children of two slots each
        assert_eq!(session.free_slots().unwrap(), total - 5 - 2 * 10);

        for parent in parents {
            session.delete_parent(0, parent).unwrap();
        }
        assert_eq!(session.free_slots().unwrap(), total);
        assert_eq!(session.cred_root(0).unwrap(), NodeAddress::NULL);
        assert_eq!(session.last_parent(ParentKind::Credential, 0).unwrap(), NodeAddress::NULL);
    }

    #[test]
    fn test_delete_child_relinks() {
        let mut session = Session::open(formatted(Geometry::FLASH_1M), ALICE).unwrap();
        let parent = session
            .create_parent_node(ParentKind::Credential, 0, &mut service("mail"))
            .unwrap();
        let a = session.create_child_node(parent, &mut login("a")).unwrap();
        let b = session.create_child_node(parent, &mut login("b")).unwrap();
        let c = session.create_child_node(parent, &mut login("c")).unwrap();
        session.set_last_used_child_node(parent, a).unwrap();

        session.delete_child(parent, b).unwrap();
        assert_eq!(session.children(parent).unwrap(), vec![a, c]);
        assert_eq!(session.check_user_permission(b), Ok(None));

        session.delete_child(parent, a).unwrap();
        let node = session.read_parent_node(parent).unwrap();
        assert_eq!(node.first_child, c);
        assert_eq!(node.last_child_used(), NodeAddress::NULL);

        // The freed pair is handed out again right away
        assert!(session.next_free_child() <= b);
    }

    #[test]
    fn test_delete_child_of_other_parent() {
        let mut session = Session::open(formatted(Geometry::FLASH_1M), ALICE).unwrap();
        let mail = session
            .create_parent_node(ParentKind::Credential, 0, &mut service("mail"))
            .unwrap();
        let bank = session
            .create_parent_node(ParentKind::Credential, 0, &mut service("bank"))
            .unwrap();
        let x = session.create_child_node(mail, &mut login("x")).unwrap();
        let b1 = session.create_child_node(bank, &mut login("b1")).unwrap();
        let b2 = session.create_child_node(bank, &mut login("b2")).unwrap();
        let free = session.free_slots().unwrap();

        assert_eq!(session.delete_child(mail, b1), Err(Error::InvalidAddress(b1)));
        assert_eq!(session.delete_child(mail, bank), Err(Error::InvalidAddress(bank)));

        assert_eq!(session.children(mail).unwrap(), vec![x]);
        assert_eq!(session.children(bank).unwrap(), vec![b1, b2]);
        assert_eq!(session.read_parent_node(bank).unwrap().first_child, b1);
        assert_eq!(session.check_user_permission(b1), Ok(Some(NodeType::CredChild)));
        assert_eq!(session.free_slots().unwrap(), free);

        session.delete_child(bank, b1).unwrap();
        assert_eq!(session.children(bank).unwrap(), vec![b2]);
        assert_eq!(session.children(mail).unwrap(), vec![x]);
    }

    #[test]
    fn test_child_needs_credential_parent() {
        let mut session = Session::open(formatted(Geometry::FLASH_1M), ALICE).unwrap();
        let data = session
            .create_parent_node(ParentKind::Data, 0, &mut service("notes.txt"))
            .unwrap();
        let cred = session
            .create_parent_node(ParentKind::Credential, 0, &mut service("mail"))
            .unwrap();
        let child = session.create_child_node(cred, &mut login("me")).unwrap();
        let free = session.free_slots().unwrap();

        assert_eq!(
            session.create_child_node(data, &mut login("me")),
            Err(Error::InvalidAddress(data))
        );
        assert_eq!(
            session.create_child_node(child, &mut login("me")),
            Err(Error::InvalidAddress(child))
        );
        assert_eq!(session.free_slots().unwrap(), free);
        assert!(session.data_chain(data).unwrap().is_empty());
    }

    #[test]
    fn test_data_chain() {
        let mut session = Session::open(formatted(Geometry::FLASH_16M), ALICE).unwrap();
        let parent = session
            .create_parent_node(ParentKind::Data, 2, &mut service("notes.txt"))
            .unwrap();

        let first = session.store_data_node(&mut DataChildNode::new(&[1u8; 512])).unwrap();
        let second = session.store_data_node(&mut DataChildNode::new(&[2u8; 10])).unwrap();
        session.update_data_node_next(first, second).unwrap();
        session
            .update_data_parent_ctr_and_first_child(parent, [0, 0, 7], first)
            .unwrap();

        let (start, ctr, prev_gen) = session.data_parent_ctr_and_first_child(parent).unwrap();
        assert_eq!((start, ctr, prev_gen), (first, [0, 0, 7], false));

        let mut out = [0u8; DATA_PAYLOAD_LEN];
        assert_eq!(session.read_data_node(first, &mut out).unwrap(), (second, 512));
        assert!(out.iter().all(|b| *b == 1));
        assert_eq!(session.read_data_node(second, &mut out).unwrap(), (NodeAddress::NULL, 10));
        assert_eq!(&out[..10], &[2u8; 10]);
        assert_eq!(session.check_user_permission(first), Ok(Some(NodeType::DataChild)));

        assert_eq!(session.data_chain(parent).unwrap(), vec![first, second]);

        let free = session.free_slots().unwrap();
        session.delete_data_parent(2, parent).unwrap();
        assert_eq!(session.free_slots().unwrap(), free + 5);
        assert_eq!(session.data_root(2).unwrap(), NodeAddress::NULL);
    }

    #[test]
    fn test_data_length_is_clamped() {
        let mut session = Session::open(formatted(Geometry::FLASH_1M), ALICE).unwrap();
        let mut node = DataChildNode::new(&[3u8; 16]);
        node.data_length = 0xFFFF;
        let addr = session.store_data_node(&mut node).unwrap();

        let mut out = [0u8; DATA_PAYLOAD_LEN];
        let (_, len) = session.read_data_node(addr, &mut out).unwrap();
        assert_eq!(len, DATA_PAYLOAD_LEN);
    }

    #[test]
    fn test_delete_user_completeness() {
        init_log();
        let geometry = Geometry::FLASH_1M;
        let mut flash = formatted(geometry);

        let mut bob = Session::open(&mut flash, BOB).unwrap();
        let bobs = bob
            .create_parent_node(ParentKind::Credential, 0, &mut service("bob.net"))
            .unwrap();
        bob.create_child_node(bobs, &mut login("bob")).unwrap();
        bob.close();
        let bob_free = count_free_slots(&mut flash).unwrap();

        let mut alice = Session::open(&mut flash, ALICE).unwrap();
        // Slots used by alice, with both halves of every child
        let mut used = Vec::new();
        for (type_id, name) in [(0, "a.com"), (4, "b.com"), (9, "c.com")] {
            let parent = alice
                .create_parent_node(ParentKind::Credential, type_id, &mut service(name))
                .unwrap();
            used.push(parent);
            for name in ["x", "y"] {
                let child = alice.create_child_node(parent, &mut login(name)).unwrap();
                used.extend([child, child.increment(&geometry)]);
            }
        }
        let data = alice
            .create_parent_node(ParentKind::Data, 6, &mut service("blob"))
            .unwrap();
        let first = alice.store_data_node(&mut DataChildNode::new(&[9; 4])).unwrap();
        let second = alice.store_data_node(&mut DataChildNode::new(&[8; 4])).unwrap();
        alice.update_data_node_next(first, second).unwrap();
        alice
            .update_data_parent_ctr_and_first_child(data, [0; 3], first)
            .unwrap();
        used.extend([
            data,
            first,
            first.increment(&geometry),
            second,
            second.increment(&geometry),
        ]);

        alice.set_ctr(&[1, 2, 3]).unwrap();
        alice.set_cred_change_number(5).unwrap();
        alice
            .set_favorite(2, 3, crate::profile::Favorite::new(used[0], used[1]))
            .unwrap();
        alice
            .set_category_name(0, &key::<{ crate::profile::CATEGORY_NAME_LEN }>("Work"))
            .unwrap();
        for addr in &used {
            assert_ne!(alice.check_user_permission(*addr), Ok(None));
        }

        alice.delete_current_user().unwrap();
        assert_eq!(alice.roots().unwrap(), [NodeAddress::NULL; NB_ROOTS]);
        assert_eq!(alice.ctr().unwrap(), [0; 3]);
        for addr in &used {
            assert_eq!(alice.check_user_permission(*addr), Ok(None), "{:?}", addr);
        }
        alice.close();

        assert_eq!(count_free_slots(&mut flash).unwrap(), bob_free);

        // Profile record zeroed, favorites included, and category names erased
        let profile = Profile::locate(&geometry, ALICE).unwrap();
        let page_size = geometry.bytes_per_page as usize;
        let start = profile.profile.page as usize * page_size + profile.profile.offset;
        assert!(flash.as_bytes()[start..start + crate::profile::PROFILE_SIZE]
            .iter()
            .all(|b| *b == 0x00));
        let start = profile.category_names.page as usize * page_size + profile.category_names.offset;
        assert!(flash.as_bytes()[start..start + 264].iter().all(|b| *b == 0xFF));

        // Bob is untouched
        let mut bob = Session::open(&mut flash, BOB).unwrap();
        assert_eq!(bob.parents(ParentKind::Credential, 0).unwrap(), vec![bobs]);
        assert_eq!(bob.children(bobs).unwrap().len(), 1);
    }

    #[test]
    fn test_no_space() {
        let geometry = Geometry::FLASH_1M;
        let mut flash = formatted(geometry);
        // Leave a single free slot in the node area
        for page in geometry.first_node_page()..geometry.page_count - 1 {
            let flags = NodeFlags::new(NodeType::CredParent, BOB).to_raw();
            flash.write_block(page, 0, &flags.to_le_bytes()).unwrap();
        }

        let mut session = Session::open(flash, ALICE).unwrap();
        assert!(session.next_free_child().is_null());
        let parent = session
            .create_parent_node(ParentKind::Credential, 0, &mut service("last"))
            .unwrap();
        assert!(session.next_free_parent().is_null());

        assert_eq!(
            session.create_child_node(parent, &mut login("x")),
            Err(Error::NoSpace)
        );
        assert_eq!(
            session.store_data_node(&mut DataChildNode::new(&[0; 1])),
            Err(Error::NoSpace)
        );
        assert_eq!(
            session.create_parent_node(ParentKind::Credential, 0, &mut service("more")),
            Err(Error::NoSpace)
        );
    }

    #[test]
    fn test_db_changed_once_per_session() {
        let mut flash = formatted(Geometry::FLASH_1M);
        let mut session = Session::open(&mut flash, ALICE).unwrap();
        session.db_changed(false).unwrap();
        session.db_changed(false).unwrap();
        session.db_changed(true).unwrap();
        assert_eq!(session.cred_change_number().unwrap(), 1);
        assert_eq!(session.data_change_number().unwrap(), 1);
        session.close();

        let mut session = Session::open(&mut flash, ALICE).unwrap();
        session.db_changed(false).unwrap();
        assert_eq!(session.cred_change_number().unwrap(), 2);
        assert_eq!(session.data_change_number().unwrap(), 1);
    }

    #[test]
    fn test_category_navigation() {
        init_log();
        let mut session = Session::open(formatted(Geometry::FLASH_16M), ALICE).unwrap();
        assert_eq!(session.set_current_category(5), Err(Error::InvalidIndex));

        let mut parents = Vec::new();
        for name in ["a", "b", "c", "d"] {
            parents.push(
                session
                    .create_parent_node(ParentKind::Credential, 0, &mut service(name))
                    .unwrap(),
            );
        }
        let (a, b, c, d) = (parents[0], parents[1], parents[2], parents[3]);

        // Work logins under a and c, personal ones under b
        session.set_current_category(1).unwrap();
        let a1 = session.create_child_node(a, &mut login("a1")).unwrap();
        session.create_child_node(c, &mut login("c1")).unwrap();
        session.set_current_category(2).unwrap();
        session.create_child_node(b, &mut login("b2")).unwrap();
        let a2 = session.create_child_node(a, &mut login("a2")).unwrap();
        assert_eq!(session.current_category_flags(), 0b10);

        session.set_current_category(1).unwrap();
        assert_eq!(session.first_parent_for_category(0).unwrap(), a);
        assert_eq!(session.next_parent_for_category(a, 0).unwrap(), c);
        assert_eq!(session.next_parent_for_category(c, 0).unwrap(), a);
        assert_eq!(session.next_parent_for_category(b, 0).unwrap(), NodeAddress::NULL);
        assert_eq!(session.prev_parent_for_category(NodeAddress::NULL, 0).unwrap(), c);
        assert_eq!(session.prev_parent_for_category(c, 0).unwrap(), a);
        assert_eq!(session.prev_parent_for_category(a, 0).unwrap(), c);

        session.set_current_category(2).unwrap();
        // A single match wraps onto itself
        assert_eq!(session.next_parent_for_category(b, 0).unwrap(), a);
        assert_eq!(session.first_parent_for_category(0).unwrap(), a);
        assert_eq!(session.next_child_for_category(a1).unwrap(), a2);
        assert_eq!(session.prev_child_for_category(a2).unwrap(), NodeAddress::NULL);

        session.set_current_category(3).unwrap();
        assert_eq!(session.first_parent_for_category(0).unwrap(), NodeAddress::NULL);
        assert_eq!(session.prev_parent_for_category(NodeAddress::NULL, 0).unwrap(), NodeAddress::NULL);

        session.set_current_category(0).unwrap();
        assert_eq!(session.first_child_with_category(a1, 0).unwrap(), a1);
        assert_eq!(session.first_child_with_category(a1, 0b10).unwrap(), a2);
        assert_eq!(session.next_parent_for_category(c, 0).unwrap(), a);
        assert_eq!(session.next_parent_for_category(d, 0).unwrap(), NodeAddress::NULL);
    }

    #[test]
    fn test_single_parent_has_no_next() {
        let mut session = Session::open(formatted(Geometry::FLASH_1M), ALICE).unwrap();
        let only = session
            .create_parent_node(ParentKind::Credential, 0, &mut service("only"))
            .unwrap();
        session.create_child_node(only, &mut login("me")).unwrap();

        assert_eq!(session.next_parent_for_category(only, 0).unwrap(), NodeAddress::NULL);
        assert_eq!(session.prev_parent_for_category(only, 0).unwrap(), NodeAddress::NULL);
    }

    #[test]
    fn test_write_nodes_force_owner() {
        let mut session = Session::open(formatted(Geometry::FLASH_1M), ALICE).unwrap();
        let parent = session
            .create_parent_node(ParentKind::Credential, 0, &mut service("site"))
            .unwrap();
        let child = session.create_child_node(parent, &mut login("me")).unwrap();

        let mut node = session.read_parent_node(parent).unwrap();
        node.header.flags = node.header.flags.with_owner(BOB);
        session.write_parent_node(parent, &mut node).unwrap();
        assert_eq!(session.read_parent_node(parent).unwrap().flags().owner(), ALICE);

        session.set_current_category(4).unwrap();
        let mut node = session.read_cred_child_node(child).unwrap();
        node.description[0] = 'x' as u16;
        session.write_child_node(child, &mut node, true).unwrap();
        let node = session.read_cred_child_node(child).unwrap();
        assert_eq!(node.flags().category, 0b1000);
        assert_eq!(node.fake_flags, node.flags().mirrored());
        assert_eq!(node.description[0], 'x' as u16);
    }

    #[test]
    fn test_profile_accessors() {
        let mut session = Session::open(formatted(Geometry::FLASH_16M), ALICE).unwrap();
        session.set_language(3).unwrap();
        session.set_ble_layout(9).unwrap();
        assert_eq!(session.preferences().language, 3);

        let parent = session
            .create_parent_node(ParentKind::Credential, 0, &mut service("fav"))
            .unwrap();
        let child = session.create_child_node(parent, &mut login("me")).unwrap();
        session.set_favorite(2, 4, Favorite::new(parent, child)).unwrap();
        session.set_current_category(2).unwrap();
        assert_eq!(
            session.favorite_for_current_category(4).unwrap(),
            Favorite::new(parent, child)
        );
        assert_eq!(
            session.next_favorite(0, 0, true).unwrap(),
            Some(FavoriteIndex { slot: 4, category: 2 })
        );

        let flash = session.close();
        let session = Session::open(flash, ALICE).unwrap();
        assert_eq!(session.preferences().language, 3);
        assert_eq!(session.preferences().ble_layout, 9);
    }
}
