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

//! Sorted, doubly linked lists stored out of place on flash.

use core::cmp::Ordering;

use crate::address::NodeAddress;
use crate::error::Error;
use crate::flash::{read_node, write_node, FlashDriver};
use crate::node::{compare_with_stored, ListNode, NodeHeader, CHILD_SIZE, HEADER_SIZE};
use crate::permission::{check_address_fatal, check_fatal};
use crate::BASE_NODE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    Reject,
    /// Equal keys are kept, the new node goes after the existing ones
    Allow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inserted {
    pub root: NodeAddress,
    pub stored: NodeAddress,
    /// The node was appended at the end of the list
    pub is_tail: bool,
}

/// Read the first slot of a node reached through a link, checking address and ownership
pub fn read_checked_head<F: FlashDriver>(
    flash: &mut F,
    user: u8,
    addr: NodeAddress,
) -> Result<[u8; BASE_NODE_SIZE], Error> {
    check_address_fatal(addr, flash.geometry())?;

    let mut head = [0u8; BASE_NODE_SIZE];
    read_node(flash, addr, &mut head)?;
    check_fatal(addr, NodeHeader::decode(&head).flags, user)?;

    Ok(head)
}

fn relink<F: FlashDriver>(
    flash: &mut F,
    addr: NodeAddress,
    head: &mut [u8; BASE_NODE_SIZE],
    update: impl FnOnce(&mut NodeHeader),
) -> Result<(), Error> {
    let mut header = NodeHeader::decode(&head[..]);
    update(&mut header);
    header.encode(&mut head[..HEADER_SIZE]);

    // Only the first slot is rewritten, whatever the node kind
    write_node(flash, addr, &head[..])?;
    Ok(())
}

fn store<F: FlashDriver, N: ListNode>(
    flash: &mut F,
    addr: NodeAddress,
    node: &N,
) -> Result<(), Error> {
    let mut buf = [0u8; CHILD_SIZE];
    node.encode_into(&mut buf[..N::SIZE]);
    write_node(flash, addr, &buf[..N::SIZE])?;
    Ok(())
}

/// Insert `node` at `addr` into the list starting at `root`, keeping it sorted by key.
///
/// `addr` must be a free slot (or slot pair) obtained from the allocator. At most the new node
/// and two neighbours are written. Nothing is written when the key is rejected.
pub fn insert_sorted<F: FlashDriver, N: ListNode>(
    flash: &mut F,
    user: u8,
    root: NodeAddress,
    addr: NodeAddress,
    node: &mut N,
    policy: DuplicatePolicy,
) -> Result<Inserted, Error> {
    if addr.is_null() {
        log::warn!("No free slot left to insert a node");
        return Err(Error::NoSpace);
    }

    node.header_mut().prev = NodeAddress::NULL;
    node.header_mut().next = NodeAddress::NULL;

    if root.is_null() {
        store(flash, addr, node)?;
        log::debug!("Node {:?} is the first of a new list", addr);
        return Ok(Inserted {
            root: addr,
            stored: addr,
            is_tail: true,
        });
    }

    let max_steps = flash.geometry().node_slots();
    let mut current = root;
    for _ in 0..max_steps {
        let mut head = read_checked_head(flash, user, current)?;
        let header = NodeHeader::decode(&head);

        match compare_with_stored::<N>(node.key(), &head) {
            Ordering::Equal if policy == DuplicatePolicy::Reject => {
                log::warn!("Key already present at {:?}", current);
                return Err(Error::DuplicateKey);
            }
            Ordering::Less => {
                node.header_mut().prev = header.prev;
                node.header_mut().next = current;
                store(flash, addr, node)?;

                relink(flash, current, &mut head, |h| h.prev = addr)?;

                let root = if header.prev.is_null() {
                    addr
                } else {
                    let mut prev_head = read_checked_head(flash, user, header.prev)?;
                    relink(flash, header.prev, &mut prev_head, |h| h.next = addr)?;
                    root
                };

                log::debug!("Node {:?} inserted before {:?}", addr, current);
                return Ok(Inserted {
                    root,
                    stored: addr,
                    is_tail: false,
                });
            }
            _ if header.next.is_null() => {
                node.header_mut().prev = current;
                store(flash, addr, node)?;

                relink(flash, current, &mut head, |h| h.next = addr)?;

                log::debug!("Node {:?} appended after {:?}", addr, current);
                return Ok(Inserted {
                    root,
                    stored: addr,
                    is_tail: true,
                });
            }
            _ => current = header.next,
        }
    }

    log::error!("List starting at {:?} does not terminate", root);
    Err(Error::IntegrityViolation(current))
}

/// Whether `addr` is one of the nodes of the list starting at `root`
pub fn contains<F: FlashDriver>(
    flash: &mut F,
    user: u8,
    root: NodeAddress,
    addr: NodeAddress,
) -> Result<bool, Error> {
    for item in iter(flash, user, root) {
        if item?.0 == addr {
            return Ok(true);
        }
    }

    Ok(false)
}

/// Unlink the node at `addr` from the list starting at `root`, returning the new root.
///
/// Fails with `InvalidAddress` and writes nothing when `addr` is not part of that list. The
/// node itself is left untouched.
pub fn unlink<F: FlashDriver>(
    flash: &mut F,
    user: u8,
    root: NodeAddress,
    addr: NodeAddress,
) -> Result<NodeAddress, Error> {
    if !contains(flash, user, root, addr)? {
        log::warn!("{:?} is not in the list starting at {:?}", addr, root);
        return Err(Error::InvalidAddress(addr));
    }

    let head = read_checked_head(flash, user, addr)?;
    let header = NodeHeader::decode(&head);

    let root = if header.prev.is_null() {
        header.next
    } else {
        let mut prev_head = read_checked_head(flash, user, header.prev)?;
        relink(flash, header.prev, &mut prev_head, |h| h.next = header.next)?;
        root
    };

    if !header.next.is_null() {
        let mut next_head = read_checked_head(flash, user, header.next)?;
        relink(flash, header.next, &mut next_head, |h| h.prev = header.prev)?;
    }

    log::debug!("Node {:?} unlinked", addr);
    Ok(root)
}

/// Walk a list from its root, yielding every node address with its header
pub fn iter<F: FlashDriver>(flash: &mut F, user: u8, root: NodeAddress) -> ListIter<'_, F> {
    let remaining = flash.geometry().node_slots();
    ListIter {
        flash,
        user,
        next: root,
        remaining,
    }
}

pub struct ListIter<'f, F> {
    flash: &'f mut F,
    user: u8,
    next: NodeAddress,
    remaining: usize,
}

impl<'f, F: FlashDriver> Iterator for ListIter<'f, F> {
    type Item = Result<(NodeAddress, NodeHeader), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next.is_null() {
            return None;
        }
        if self.remaining == 0 {
            let addr = self.next;
            self.next = NodeAddress::NULL;
            return Some(Err(Error::IntegrityViolation(addr)));
        }
        self.remaining -= 1;

        let addr = self.next;
        match read_checked_head(self.flash, self.user, addr) {
            Ok(head) => {
                let header = NodeHeader::decode(&head);
                self.next = header.next;
                Some(Ok((addr, header)))
            }
            Err(e) => {
                self.next = NodeAddress::NULL;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{NodeFlags, NodeType};
    use crate::flash::RamFlash;
    use crate::geometry::Geometry;
    use crate::node::{CredChildNode, ParentNode};
    use crate::test_utils::{init_log, key, key_to_string};

    const USER: u8 = 4;

    fn parent(name: &str) -> ParentNode {
        let mut node = ParentNode::new(NodeType::CredParent, &key::<32>(name));
        node.header.flags = NodeFlags::new(NodeType::CredParent, USER);
        node
    }

    fn slot(geometry: &Geometry, n: u16) -> NodeAddress {
        NodeAddress::encode(geometry.first_node_page() + n, 0)
    }

    fn services(flash: &mut RamFlash, root: NodeAddress) -> Vec<String> {
        let addrs: Vec<_> = iter(flash, USER, root).map(|i| i.unwrap().0).collect();
        addrs
            .into_iter()
            .map(|addr| {
                let mut buf = [0u8; BASE_NODE_SIZE];
                read_node(flash, addr, &mut buf).unwrap();
                key_to_string(&ParentNode::decode_from(&buf).service)
            })
            .collect()
    }

    #[test]
    fn test_insert_keeps_order() {
        init_log();
        let geometry = Geometry::FLASH_1M;
        let mut flash = RamFlash::new(geometry);

        let mut root = NodeAddress::NULL;
        for (i, name) in ["amazon.com", "github.com", "bbc.co.uk"].iter().enumerate() {
            let inserted = insert_sorted(
                &mut flash,
                USER,
                root,
                slot(&geometry, i as u16),
                &mut parent(name),
                DuplicatePolicy::Reject,
            )
            .unwrap();
            root = inserted.root;
        }

        assert_eq!(root, slot(&geometry, 0));
        assert_eq!(
            services(&mut flash, root),
            vec!["amazon.com", "bbc.co.uk", "github.com"]
        );
    }

    #[test]
    fn test_insert_before_head_updates_root() {
        let geometry = Geometry::FLASH_16M;
        let mut flash = RamFlash::new(geometry);
        let first = insert_sorted(
            &mut flash,
            USER,
            NodeAddress::NULL,
            slot(&geometry, 0),
            &mut parent("m"),
            DuplicatePolicy::Reject,
        )
        .unwrap();
        let second = insert_sorted(
            &mut flash,
            USER,
            first.root,
            slot(&geometry, 1),
            &mut parent("a"),
            DuplicatePolicy::Reject,
        )
        .unwrap();

        assert_eq!(second.root, slot(&geometry, 1));
        assert!(!second.is_tail);

        let headers: Vec<_> = iter(&mut flash, USER, second.root)
            .map(|i| i.unwrap())
            .collect();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].1.prev, NodeAddress::NULL);
        assert_eq!(headers[0].1.next, slot(&geometry, 0));
        assert_eq!(headers[1].1.prev, slot(&geometry, 1));
        assert_eq!(headers[1].1.next, NodeAddress::NULL);
    }

    #[test]
    fn test_duplicate_rejected_without_writes() {
        let geometry = Geometry::FLASH_1M;
        let mut flash = RamFlash::new(geometry);
        let inserted = insert_sorted(
            &mut flash,
            USER,
            NodeAddress::NULL,
            slot(&geometry, 0),
            &mut parent("github.com"),
            DuplicatePolicy::Reject,
        )
        .unwrap();

        let writes = flash.write_count();
        let result = insert_sorted(
            &mut flash,
            USER,
            inserted.root,
            slot(&geometry, 1),
            &mut parent("github.com"),
            DuplicatePolicy::Reject,
        );
        assert_eq!(result, Err(Error::DuplicateKey));
        assert_eq!(flash.write_count(), writes);
        assert_eq!(services(&mut flash, inserted.root), vec!["github.com"]);
    }

    #[test]
    fn test_duplicates_allowed_go_last() {
        let geometry = Geometry::FLASH_1M;
        let mut flash = RamFlash::new(geometry);
        let mut root = NodeAddress::NULL;
        for i in 0..3 {
            let mut node = CredChildNode::new(&key::<8>("same"));
            node.set_flags(NodeFlags::new(NodeType::CredChild, USER));
            node.key_after_login = i;
            root = insert_sorted(
                &mut flash,
                USER,
                root,
                slot(&geometry, 2 * i),
                &mut node,
                DuplicatePolicy::Allow,
            )
            .unwrap()
            .root;
        }

        let order: Vec<_> = iter(&mut flash, USER, root)
            .map(|i| i.unwrap().0)
            .collect();
        assert_eq!(
            order,
            vec![slot(&geometry, 0), slot(&geometry, 2), slot(&geometry, 4)]
        );
    }

    #[test]
    fn test_neighbours_only_rewrite_first_slot() {
        let geometry = Geometry::FLASH_1M;
        let mut flash = RamFlash::new(geometry);

        let mut a = CredChildNode::new(&key::<8>("a"));
        a.set_flags(NodeFlags::new(NodeType::CredChild, USER));
        a.password[0] = 0x11;
        let root = insert_sorted(
            &mut flash,
            USER,
            NodeAddress::NULL,
            slot(&geometry, 0),
            &mut a,
            DuplicatePolicy::Allow,
        )
        .unwrap()
        .root;

        let writes = flash.write_count();
        let mut b = CredChildNode::new(&key::<8>("b"));
        b.set_flags(NodeFlags::new(NodeType::CredChild, USER));
        insert_sorted(
            &mut flash,
            USER,
            root,
            slot(&geometry, 2),
            &mut b,
            DuplicatePolicy::Allow,
        )
        .unwrap();

        // Two slots for the new node and one for its neighbour
        assert_eq!(flash.write_count(), writes + 3);

        let mut buf = [0u8; CHILD_SIZE];
        read_node(&mut flash, slot(&geometry, 0), &mut buf).unwrap();
        let a = CredChildNode::decode_from(&buf);
        assert_eq!(a.header.next, slot(&geometry, 2));
        assert_eq!(a.password[0], 0x11);
    }

    #[test]
    fn test_foreign_node_is_fatal() {
        let geometry = Geometry::FLASH_1M;
        let mut flash = RamFlash::new(geometry);
        let root = insert_sorted(
            &mut flash,
            USER,
            NodeAddress::NULL,
            slot(&geometry, 0),
            &mut parent("mine"),
            DuplicatePolicy::Reject,
        )
        .unwrap()
        .root;

        let result = insert_sorted(
            &mut flash,
            USER + 1,
            root,
            slot(&geometry, 1),
            &mut parent("theirs"),
            DuplicatePolicy::Reject,
        );
        assert_eq!(result, Err(Error::IntegrityViolation(root)));
    }

    #[test]
    fn test_no_space() {
        let geometry = Geometry::FLASH_1M;
        let mut flash = RamFlash::new(geometry);
        let result = insert_sorted(
            &mut flash,
            USER,
            NodeAddress::NULL,
            NodeAddress::NULL,
            &mut parent("x"),
            DuplicatePolicy::Reject,
        );
        assert_eq!(result, Err(Error::NoSpace));
        assert_eq!(flash.write_count(), 0);
    }

    #[test]
    fn test_unlink() {
        let geometry = Geometry::FLASH_1M;
        let mut flash = RamFlash::new(geometry);
        let mut root = NodeAddress::NULL;
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            root = insert_sorted(
                &mut flash,
                USER,
                root,
                slot(&geometry, i as u16),
                &mut parent(name),
                DuplicatePolicy::Reject,
            )
            .unwrap()
            .root;
        }

        let root = unlink(&mut flash, USER, root, slot(&geometry, 1)).unwrap();
        assert_eq!(services(&mut flash, root), vec!["a", "c"]);

        let root = unlink(&mut flash, USER, root, slot(&geometry, 0)).unwrap();
        assert_eq!(root, slot(&geometry, 2));
        assert_eq!(services(&mut flash, root), vec!["c"]);

        let headers: Vec<_> = iter(&mut flash, USER, root).map(|i| i.unwrap()).collect();
        assert_eq!(headers[0].1.prev, NodeAddress::NULL);

        let root = unlink(&mut flash, USER, root, slot(&geometry, 2)).unwrap();
        assert!(root.is_null());
    }

    #[test]
    fn test_unlink_from_other_list() {
        let geometry = Geometry::FLASH_1M;
        let mut flash = RamFlash::new(geometry);
        let mut first = NodeAddress::NULL;
        let mut second = NodeAddress::NULL;
        for (i, name) in ["a", "b"].iter().enumerate() {
            first = insert_sorted(
                &mut flash,
                USER,
                first,
                slot(&geometry, i as u16),
                &mut parent(name),
                DuplicatePolicy::Reject,
            )
            .unwrap()
            .root;
            second = insert_sorted(
                &mut flash,
                USER,
                second,
                slot(&geometry, 2 + i as u16),
                &mut parent(name),
                DuplicatePolicy::Reject,
            )
            .unwrap()
            .root;
        }

        let writes = flash.write_count();
        assert_eq!(
            unlink(&mut flash, USER, first, second),
            Err(Error::InvalidAddress(second))
        );
        assert_eq!(flash.write_count(), writes);
        assert!(contains(&mut flash, USER, second, second).unwrap());
        assert!(!contains(&mut flash, USER, NodeAddress::NULL, second).unwrap());
        assert_eq!(services(&mut flash, first), vec!["a", "b"]);
        assert_eq!(services(&mut flash, second), vec!["a", "b"]);
    }
}
