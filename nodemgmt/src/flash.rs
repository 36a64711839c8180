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

//! Access to the external database flash.

#[cfg(any(test, feature = "emulator"))]
use alloc::vec::Vec;

use crate::address::NodeAddress;
use crate::error::FlashError;
use crate::flags::NodeFlags;
use crate::geometry::Geometry;
use crate::BASE_NODE_SIZE;

/// Block driver for the database flash chip.
///
/// Accesses never cross a page boundary: `offset + len` must stay within `bytes_per_page`.
pub trait FlashDriver {
    fn geometry(&self) -> &Geometry;

    fn read_block(&mut self, page: u16, offset: usize, buf: &mut [u8]) -> Result<(), FlashError>;

    fn write_block(&mut self, page: u16, offset: usize, data: &[u8]) -> Result<(), FlashError>;

    fn write_pattern(
        &mut self,
        page: u16,
        offset: usize,
        len: usize,
        value: u8,
    ) -> Result<(), FlashError>;
}

impl<T: FlashDriver + ?Sized> FlashDriver for &mut T {
    fn geometry(&self) -> &Geometry {
        (**self).geometry()
    }

    fn read_block(&mut self, page: u16, offset: usize, buf: &mut [u8]) -> Result<(), FlashError> {
        (**self).read_block(page, offset, buf)
    }

    fn write_block(&mut self, page: u16, offset: usize, data: &[u8]) -> Result<(), FlashError> {
        (**self).write_block(page, offset, data)
    }

    fn write_pattern(
        &mut self,
        page: u16,
        offset: usize,
        len: usize,
        value: u8,
    ) -> Result<(), FlashError> {
        (**self).write_pattern(page, offset, len, value)
    }
}

/// Read the flags word at the start of a slot
pub fn read_flags<F: FlashDriver>(flash: &mut F, addr: NodeAddress) -> Result<NodeFlags, FlashError> {
    let mut buf = [0u8; 2];
    flash.read_block(addr.page(), addr.offset(), &mut buf)?;
    Ok(NodeFlags::from_raw(u16::from_le_bytes(buf)))
}

/// Read a whole node, one slot after the other. `buf` is one or two slots long.
pub fn read_node<F: FlashDriver>(
    flash: &mut F,
    addr: NodeAddress,
    buf: &mut [u8],
) -> Result<(), FlashError> {
    let geometry = *flash.geometry();
    let mut slot = addr;
    for chunk in buf.chunks_mut(BASE_NODE_SIZE) {
        flash.read_block(slot.page(), slot.offset(), chunk)?;
        slot = slot.increment(&geometry);
    }

    log::trace!("Read {} bytes at {:?}", buf.len(), addr);
    Ok(())
}

pub fn write_node<F: FlashDriver>(
    flash: &mut F,
    addr: NodeAddress,
    data: &[u8],
) -> Result<(), FlashError> {
    let geometry = *flash.geometry();
    let mut slot = addr;
    for chunk in data.chunks(BASE_NODE_SIZE) {
        flash.write_block(slot.page(), slot.offset(), chunk)?;
        slot = slot.increment(&geometry);
    }

    log::trace!("Wrote {} bytes at {:?}", data.len(), addr);
    Ok(())
}

/// Pattern-fill `slots` consecutive slots starting at `addr`
pub fn fill_node<F: FlashDriver>(
    flash: &mut F,
    addr: NodeAddress,
    slots: usize,
    value: u8,
) -> Result<(), FlashError> {
    let geometry = *flash.geometry();
    let mut slot = addr;
    for _ in 0..slots {
        flash.write_pattern(slot.page(), slot.offset(), BASE_NODE_SIZE, value)?;
        slot = slot.increment(&geometry);
    }

    log::trace!("Filled {} slot(s) at {:?} with {:#04x}", slots, addr, value);
    Ok(())
}

/// Flash kept entirely in memory, starting fully erased
#[cfg(any(test, feature = "emulator"))]
pub struct RamFlash {
    geometry: Geometry,
    data: Vec<u8>,
    writes: usize,
}

#[cfg(any(test, feature = "emulator"))]
impl RamFlash {
    pub fn new(geometry: Geometry) -> Self {
        RamFlash {
            geometry,
            data: alloc::vec![0xFF; geometry.size()],
            writes: 0,
        }
    }

    pub fn from_bytes(geometry: Geometry, data: Vec<u8>) -> Result<Self, FlashError> {
        if data.len() != geometry.size() {
            return Err(FlashError::OutOfBounds {
                page: 0,
                offset: 0,
                len: data.len(),
            });
        }

        Ok(RamFlash {
            geometry,
            data,
            writes: 0,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Number of write and pattern operations performed so far
    pub fn write_count(&self) -> usize {
        self.writes
    }

    fn range(&self, page: u16, offset: usize, len: usize) -> Result<core::ops::Range<usize>, FlashError> {
        let bytes_per_page = self.geometry.bytes_per_page as usize;
        if page >= self.geometry.page_count || offset + len > bytes_per_page {
            return Err(FlashError::OutOfBounds { page, offset, len });
        }

        let start = page as usize * bytes_per_page + offset;
        Ok(start..start + len)
    }
}

#[cfg(any(test, feature = "emulator"))]
impl FlashDriver for RamFlash {
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn read_block(&mut self, page: u16, offset: usize, buf: &mut [u8]) -> Result<(), FlashError> {
        let range = self.range(page, offset, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_block(&mut self, page: u16, offset: usize, data: &[u8]) -> Result<(), FlashError> {
        let range = self.range(page, offset, data.len())?;
        self.data[range].copy_from_slice(data);
        self.writes += 1;
        Ok(())
    }

    fn write_pattern(
        &mut self,
        page: u16,
        offset: usize,
        len: usize,
        value: u8,
    ) -> Result<(), FlashError> {
        let range = self.range(page, offset, len)?;
        self.data[range].fill(value);
        self.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_erased() {
        let mut flash = RamFlash::new(Geometry::FLASH_1M);
        let addr = NodeAddress::encode(200, 0);
        assert!(read_flags(&mut flash, addr).unwrap().is_free());
    }

    #[test]
    fn test_page_bounds() {
        let mut flash = RamFlash::new(Geometry::FLASH_1M);
        let mut buf = [0u8; 8];
        assert!(flash.read_block(0, 260, &mut buf).is_err());
        assert!(flash.read_block(512, 0, &mut buf).is_err());
        assert!(flash.read_block(511, 256, &mut buf).is_ok());
    }

    #[test]
    fn test_node_spanning_pages() {
        let geometry = Geometry::FLASH_16M;
        let mut flash = RamFlash::new(geometry);

        // A child starting on the second slot continues on the next page
        let addr = NodeAddress::encode(300, 1);
        let data: Vec<u8> = (0..2 * BASE_NODE_SIZE).map(|i| i as u8).collect();
        write_node(&mut flash, addr, &data).unwrap();

        let mut first_of_next = [0u8; BASE_NODE_SIZE];
        flash.read_block(301, 0, &mut first_of_next).unwrap();
        assert_eq!(&first_of_next[..], &data[BASE_NODE_SIZE..]);

        let mut back = alloc::vec![0u8; 2 * BASE_NODE_SIZE];
        read_node(&mut flash, addr, &mut back).unwrap();
        assert_eq!(back, data);

        fill_node(&mut flash, addr, 2, 0xFF).unwrap();
        read_node(&mut flash, addr, &mut back).unwrap();
        assert!(back.iter().all(|b| *b == 0xFF));
    }
}
