//! Persistence for the settings blob: atomic replace of one flash sector.
//!
//! The store is generic over [`FlashOps`] so the erase/program/verify
//! sequence can be tested on the host against a fake flash; the hardware
//! implementation is [`crate::board::FlashController`].

use crate::flash_layout::{FlashRange, PAGE_SIZE};
use crate::settings::blob;
use crate::{Error, Result};

/// The three flash primitives the store needs. Implementations must make
/// each call safe with respect to concurrent execution from flash (the
/// embassy-rp blocking driver quiesces the other core and interrupts).
pub trait FlashOps {
    fn erase(&mut self, range: FlashRange) -> Result<()>;
    fn program(&mut self, offset: u32, data: &[u8]) -> Result<()>;
    fn read(&mut self, offset: u32, out: &mut [u8]) -> Result<()>;
}

/// Owns the settings region and replaces its content as a unit.
pub struct SettingsStore<F> {
    flash: F,
    region: FlashRange,
}

impl<F: FlashOps> SettingsStore<F> {
    #[must_use]
    pub fn new(flash: F, region: FlashRange) -> Self {
        debug_assert!(region.is_sector_aligned());
        Self { flash, region }
    }

    #[must_use]
    pub const fn region(&self) -> FlashRange {
        self.region
    }

    /// Replace the settings region with `data`.
    ///
    /// Erases the whole region, programs page by page (the final short page
    /// is padded with `0xFF`), then verifies by readback. When `data` is
    /// shorter than the region, the byte just past it must read back `0xFF`
    /// so the file terminator is in place. Any mismatch is [`Error::InvalidData`];
    /// an oversized `data` is [`Error::InvalidArg`] and nothing is erased.
    pub fn save(&mut self, data: &[u8]) -> Result<()> {
        let region_size = self.region.size as usize;
        if data.len() > region_size {
            return Err(Error::InvalidArg);
        }

        self.flash.erase(self.region)?;

        let page_size = PAGE_SIZE as usize;
        let mut page = [0xFFu8; PAGE_SIZE as usize];
        for (index, chunk) in data.chunks(page_size).enumerate() {
            page[..chunk.len()].copy_from_slice(chunk);
            page[chunk.len()..].fill(0xFF);
            let offset = self.region.start_offset + (index * page_size) as u32;
            self.flash.program(offset, &page)?;
        }

        let mut readback = [0u8; PAGE_SIZE as usize];
        for (index, chunk) in data.chunks(page_size).enumerate() {
            let offset = self.region.start_offset + (index * page_size) as u32;
            self.flash.read(offset, &mut readback[..chunk.len()])?;
            if readback[..chunk.len()] != *chunk {
                return Err(Error::InvalidData);
            }
        }

        if data.len() < region_size {
            let mut tail = [0u8; 1];
            self.flash
                .read(self.region.start_offset + data.len() as u32, &mut tail)?;
            if tail[0] != 0xFF {
                return Err(Error::InvalidData);
            }
        }

        Ok(())
    }

    /// Copy the stored blob into `out` and return its text length (clipped
    /// by the file-terminator rule). `out` shorter than the region clips the
    /// copy.
    pub fn read_blob(&mut self, out: &mut [u8]) -> Result<usize> {
        let len = out.len().min(self.region.size as usize);
        self.flash.read(self.region.start_offset, &mut out[..len])?;
        Ok(blob::file_size(&out[..len]))
    }
}
