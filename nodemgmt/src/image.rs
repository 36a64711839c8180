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

//! Serialized flash images for host tools.
//!
//! An image is a little-endian `u16` header length, a CBOR [`ImageHeader`] and the raw flash
//! contents, page after page.

use core::fmt;

use alloc::vec::Vec;

use minicbor::{Decode, Encode};

use crate::flash::RamFlash;
use crate::geometry::{Chip, Geometry};

pub const IMAGE_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct ImageHeader {
    #[cbor(n(0))]
    pub version: u8,
    #[cbor(n(1))]
    pub chip: u8,
    #[cbor(n(2))]
    pub page_count: u16,
    #[cbor(n(3))]
    pub bytes_per_page: u16,
    #[cbor(n(4))]
    pub pages_per_sector: u16,
}

impl ImageHeader {
    pub fn new(geometry: &Geometry) -> Self {
        ImageHeader {
            version: IMAGE_VERSION,
            chip: geometry.chip.id(),
            page_count: geometry.page_count,
            bytes_per_page: geometry.bytes_per_page,
            pages_per_sector: geometry.pages_per_sector,
        }
    }

    /// The geometry described by the header, if it is one of the known chips
    pub fn geometry(&self) -> Result<Geometry, ImageError> {
        if self.version != IMAGE_VERSION {
            return Err(ImageError::BadHeader);
        }

        let geometry = Chip::from_id(self.chip)
            .ok_or(ImageError::BadHeader)?
            .geometry();
        if geometry.page_count != self.page_count
            || geometry.bytes_per_page != self.bytes_per_page
            || geometry.pages_per_sector != self.pages_per_sector
        {
            return Err(ImageError::BadHeader);
        }

        Ok(geometry)
    }
}

#[derive(Debug)]
pub enum ImageError {
    Encode,
    Decode(minicbor::decode::Error),
    BadHeader,
    Truncated { expected: usize, found: usize },
    GeometryMismatch { expected: Geometry, found: Geometry },
}

impl From<minicbor::decode::Error> for ImageError {
    fn from(e: minicbor::decode::Error) -> Self {
        ImageError::Decode(e)
    }
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageError::Encode => write!(f, "unable to encode the image header"),
            ImageError::Decode(e) => write!(f, "invalid image header: {}", e),
            ImageError::BadHeader => write!(f, "unsupported image header"),
            ImageError::Truncated { expected, found } => {
                write!(f, "image holds {} bytes, expected {}", found, expected)
            }
            ImageError::GeometryMismatch { expected, found } => write!(
                f,
                "image was written for chip {}, expected {}",
                found.chip, expected.chip
            ),
        }
    }
}

#[cfg(not(feature = "device"))]
impl std::error::Error for ImageError {}

pub fn encode_image(flash: &RamFlash) -> Result<Vec<u8>, ImageError> {
    let header = ImageHeader::new(crate::flash::FlashDriver::geometry(flash));
    let header = minicbor::to_vec(&header).map_err(|_| ImageError::Encode)?;
    let header_len = u16::try_from(header.len()).map_err(|_| ImageError::Encode)?;

    let data = flash.as_bytes();
    let mut image = Vec::with_capacity(2 + header.len() + data.len());
    image.extend_from_slice(&header_len.to_le_bytes());
    image.extend_from_slice(&header);
    image.extend_from_slice(data);
    Ok(image)
}

/// Split an image into its header and its flash contents
pub fn read_header(image: &[u8]) -> Result<(ImageHeader, &[u8]), ImageError> {
    if image.len() < 2 {
        return Err(ImageError::Truncated {
            expected: 2,
            found: image.len(),
        });
    }

    let header_len = u16::from_le_bytes([image[0], image[1]]) as usize;
    let rest = &image[2..];
    if rest.len() < header_len {
        return Err(ImageError::Truncated {
            expected: 2 + header_len,
            found: image.len(),
        });
    }

    let header: ImageHeader = minicbor::decode(&rest[..header_len])?;
    Ok((header, &rest[header_len..]))
}

/// Load an image, checking it was written for `expected` when given
pub fn decode_image(image: &[u8], expected: Option<&Geometry>) -> Result<RamFlash, ImageError> {
    let (header, data) = read_header(image)?;
    let geometry = header.geometry()?;

    if let Some(expected) = expected {
        if *expected != geometry {
            log::warn!(
                "Refusing image for chip {} on chip {}",
                geometry.chip,
                expected.chip
            );
            return Err(ImageError::GeometryMismatch {
                expected: *expected,
                found: geometry,
            });
        }
    }

    if data.len() != geometry.size() {
        return Err(ImageError::Truncated {
            expected: geometry.size(),
            found: data.len(),
        });
    }

    RamFlash::from_bytes(geometry, data.to_vec()).map_err(|_| ImageError::Truncated {
        expected: geometry.size(),
        found: data.len(),
    })
}
