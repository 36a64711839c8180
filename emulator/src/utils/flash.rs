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

use std::path::{Path, PathBuf};

use tempdir::TempDir;
use tokio::{fs, io};

use nodemgmt::image::{decode_image, encode_image};
use nodemgmt::{Geometry, RamFlash};

/// A flash image on disk.
///
/// Unless changes are allowed the image is copied into a temporary directory first, so the
/// original file is never modified.
pub struct Flash {
    path: PathBuf,
    _tmpdir: Option<TempDir>,
}

impl Flash {
    fn get_tempdir() -> io::Result<TempDir> {
        TempDir::new("nodedb-flash")
    }

    fn get_temp_file() -> io::Result<(PathBuf, TempDir)> {
        let tempdir = Self::get_tempdir()?;
        Ok((tempdir.path().join("flash.bin"), tempdir))
    }

    pub async fn load_from_file(path: &Path, allow_changes: bool) -> io::Result<Self> {
        if allow_changes {
            Ok(Flash {
                path: path.into(),
                _tmpdir: None,
            })
        } else {
            let (temp_path, tmpdir) = Self::get_temp_file()?;
            fs::copy(path, &temp_path).await?;
            log::debug!(
                "Working on a copy of {} at {}",
                path.display(),
                temp_path.display()
            );

            Ok(Flash {
                path: temp_path,
                _tmpdir: Some(tmpdir),
            })
        }
    }

    /// Write a fully erased image at `path`
    pub async fn create(path: &Path, geometry: Geometry) -> Result<Self, crate::Error> {
        let flash = Flash {
            path: path.into(),
            _tmpdir: None,
        };
        flash.store(&RamFlash::new(geometry)).await?;

        log::info!("Created empty {} flash at {}", geometry.chip, path.display());
        Ok(flash)
    }

    pub async fn empty_temp_flash(geometry: Geometry) -> Result<Self, crate::Error> {
        let (path, tempdir) = Self::get_temp_file()?;
        let mut flash = Self::create(&path, geometry).await?;
        flash._tmpdir = Some(tempdir);

        Ok(flash)
    }

    /// Read the whole image, checking its geometry when `expected` is given
    pub async fn load(&self, expected: Option<&Geometry>) -> Result<RamFlash, crate::Error> {
        let image = fs::read(&self.path).await?;
        let flash = decode_image(&image, expected)?;

        log::debug!("Loaded {} bytes from {}", image.len(), self.path.display());
        Ok(flash)
    }

    pub async fn store(&self, flash: &RamFlash) -> Result<(), crate::Error> {
        let image = encode_image(flash)?;
        fs::write(&self.path, &image).await?;

        log::debug!("Stored {} bytes to {}", image.len(), self.path.display());
        Ok(())
    }

    pub fn is_temporary(&self) -> bool {
        self._tmpdir.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodemgmt::FlashDriver;

    #[tokio::test]
    async fn test_original_is_untouched() -> Result<(), crate::Error> {
        let dir = TempDir::new("nodedb-flash-test")?;
        let path = dir.path().join("original.bin");
        let original = Flash::create(&path, Geometry::FLASH_1M).await?;

        let copy = Flash::load_from_file(original.path(), false).await?;
        assert!(copy.is_temporary());
        assert_ne!(copy.path(), original.path());

        let mut ram = copy.load(Some(&Geometry::FLASH_1M)).await?;
        ram.write_block(200, 0, &[0x00; 4]).map_err(nodemgmt::Error::from)?;
        copy.store(&ram).await?;

        let reloaded = copy.load(None).await?;
        assert_eq!(&reloaded.as_bytes()[200 * 264..200 * 264 + 4], &[0x00; 4]);
        let untouched = original.load(None).await?;
        assert!(untouched.as_bytes().iter().all(|b| *b == 0xFF));

        Ok(())
    }

    #[tokio::test]
    async fn test_wrong_chip() -> Result<(), crate::Error> {
        let flash = Flash::empty_temp_flash(Geometry::FLASH_2M).await?;
        assert!(matches!(
            flash.load(Some(&Geometry::FLASH_1M)).await,
            Err(crate::Error::Image(
                nodemgmt::image::ImageError::GeometryMismatch { .. }
            ))
        ));

        Ok(())
    }
}
