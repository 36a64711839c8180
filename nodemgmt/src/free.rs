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

//! Free slot discovery.

use crate::address::NodeAddress;
use crate::error::Error;
use crate::flash::{read_flags, FlashDriver};

/// Scan the node area for free slots, filling `parents` first and then `children`.
///
/// Only the flags word of every slot is read. A child needs two free slots where the second is
/// the partner of the first (`increment`), so any used slot in between restarts the pairing.
/// Returns the number of parent and child addresses found.
pub fn find_free_nodes<F: FlashDriver>(
    flash: &mut F,
    start_page: u16,
    start_slot: u8,
    parents: &mut [NodeAddress],
    children: &mut [NodeAddress],
) -> Result<(usize, usize), Error> {
    let geometry = *flash.geometry();
    let mut nb_parents = 0;
    let mut nb_children = 0;
    let mut pending: Option<NodeAddress> = None;

    let (first_page, mut first_slot) = if start_page < geometry.first_node_page() {
        (geometry.first_node_page(), 0)
    } else {
        (start_page, start_slot as u16)
    };

    if parents.is_empty() && children.is_empty() {
        return Ok((0, 0));
    }

    for page in first_page..geometry.page_count {
        for slot in first_slot..geometry.nodes_per_page() {
            let addr = NodeAddress::encode(page, slot as u8);
            if !read_flags(flash, addr)?.is_free() {
                pending = None;
                continue;
            }

            if nb_parents < parents.len() {
                parents[nb_parents] = addr;
                nb_parents += 1;
            } else if nb_children < children.len() {
                match pending {
                    Some(first) if first.increment(&geometry) == addr => {
                        children[nb_children] = first;
                        nb_children += 1;
                        pending = None;
                    }
                    _ => pending = Some(addr),
                }
            }

            if nb_parents == parents.len() && nb_children == children.len() {
                log::trace!(
                    "Found {} parent(s) and {} child(ren) before {:?}",
                    nb_parents,
                    nb_children,
                    addr
                );
                return Ok((nb_parents, nb_children));
            }
        }
        first_slot = 0;
    }

    log::debug!(
        "Flash exhausted with {} parent(s) and {} child(ren) found",
        nb_parents,
        nb_children
    );
    Ok((nb_parents, nb_children))
}

/// Count every free slot of the node area
pub fn count_free_slots<F: FlashDriver>(flash: &mut F) -> Result<usize, Error> {
    let geometry = *flash.geometry();
    let mut count = 0;
    for page in geometry.first_node_page()..geometry.page_count {
        for slot in 0..geometry.nodes_per_page() {
            if read_flags(flash, NodeAddress::encode(page, slot as u8))?.is_free() {
                count += 1;
            }
        }
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{NodeFlags, NodeType};
    use crate::flash::RamFlash;
    use crate::geometry::Geometry;

    fn mark_used(flash: &mut RamFlash, addr: NodeAddress) {
        let flags = NodeFlags::new(NodeType::CredParent, 1).to_raw();
        flash
            .write_block(addr.page(), addr.offset(), &flags.to_le_bytes())
            .unwrap();
    }

    #[test]
    fn test_empty_flash_first_two_slots() {
        for geometry in Geometry::ALL {
            let mut flash = RamFlash::new(geometry);
            let mut parent = [NodeAddress::NULL; 1];
            let mut child = [NodeAddress::NULL; 1];
            let found = find_free_nodes(
                &mut flash,
                geometry.first_node_page(),
                0,
                &mut parent,
                &mut child,
            )
            .unwrap();

            let first = NodeAddress::encode(geometry.first_node_page(), 0);
            assert_eq!(found, (1, 1));
            assert_eq!(parent[0], first);
            assert_eq!(child[0], first.increment(&geometry));
            assert!(parent[0] < child[0]);
        }
    }

    #[test]
    fn test_start_in_reserved_area_is_clamped() {
        let geometry = Geometry::FLASH_16M;
        let mut flash = RamFlash::new(geometry);
        let mut parent = [NodeAddress::NULL; 1];
        find_free_nodes(&mut flash, 0, 1, &mut parent, &mut []).unwrap();
        assert_eq!(parent[0], NodeAddress::encode(256, 0));
    }

    #[test]
    fn test_start_slot_only_applies_to_first_page() {
        let geometry = Geometry::FLASH_16M;
        let mut flash = RamFlash::new(geometry);
        let mut parents = [NodeAddress::NULL; 2];
        find_free_nodes(&mut flash, 300, 1, &mut parents, &mut []).unwrap();
        assert_eq!(
            parents,
            [NodeAddress::encode(300, 1), NodeAddress::encode(301, 0)]
        );
    }

    #[test]
    fn test_used_slot_breaks_pairing() {
        let geometry = Geometry::FLASH_1M;
        let mut flash = RamFlash::new(geometry);
        let base = geometry.first_node_page();
        mark_used(&mut flash, NodeAddress::encode(base, 0));
        mark_used(&mut flash, NodeAddress::encode(base + 2, 0));

        let mut child = [NodeAddress::NULL; 1];
        let found = find_free_nodes(&mut flash, base, 0, &mut [], &mut child).unwrap();
        assert_eq!(found, (0, 1));
        assert_eq!(child[0], NodeAddress::encode(base + 3, 0));
    }

    #[test]
    fn test_pair_across_page_boundary() {
        let geometry = Geometry::FLASH_16M;
        let mut flash = RamFlash::new(geometry);
        let base = geometry.first_node_page();
        // Only the last slot of the first page and the first slot of the next one are free
        mark_used(&mut flash, NodeAddress::encode(base, 0));
        mark_used(&mut flash, NodeAddress::encode(base + 1, 1));

        let mut child = [NodeAddress::NULL; 1];
        find_free_nodes(&mut flash, base, 0, &mut [], &mut child).unwrap();
        let child = child[0];
        assert_eq!(child, NodeAddress::encode(base, 1));
        assert_eq!(child.increment(&geometry), NodeAddress::encode(base + 1, 0));
    }

    #[test]
    fn test_no_pair_at_end_of_flash() {
        let geometry = Geometry::FLASH_1M;
        let mut flash = RamFlash::new(geometry);
        for page in geometry.first_node_page()..geometry.page_count - 1 {
            mark_used(&mut flash, NodeAddress::encode(page, 0));
        }

        let mut parent = [NodeAddress::NULL; 1];
        let mut child = [NodeAddress::NULL; 1];
        let found =
            find_free_nodes(&mut flash, 0, 0, &mut parent, &mut child).unwrap();
        assert_eq!(found, (1, 0));
        assert_eq!(parent[0], NodeAddress::encode(geometry.page_count - 1, 0));

        let found = find_free_nodes(&mut flash, 0, 0, &mut [], &mut child).unwrap();
        assert_eq!(found, (0, 0));
    }

    #[test]
    fn test_count_free_slots() {
        let geometry = Geometry::FLASH_2M;
        let mut flash = RamFlash::new(geometry);
        assert_eq!(count_free_slots(&mut flash).unwrap(), geometry.node_slots());

        mark_used(&mut flash, NodeAddress::encode(500, 0));
        assert_eq!(
            count_free_slots(&mut flash).unwrap(),
            geometry.node_slots() - 1
        );
    }
}
