//! The built-in remote handlers: diagnostics, settings update, reboot,
//! and (behind the `memory-access` feature) raw memory read, flash write
//! and staged firmware replacement.
//!
//! Request parsing and range validation are plain functions so they can be
//! tested on the host; the handler objects themselves live with the service
//! because they touch flash and the reset machinery.

use core::fmt;

use sha2::{Digest, Sha256};

use crate::flash_layout::{ERASE_SIZE, FlashLayout, FlashRange, LogicalRange};
use crate::remote::crypto::ct_eq;
use crate::{Error, Result};

/// Payload of a read-memory request: start pointer then size, both LE.
pub const READ_REQUEST_LEN: usize = 8;

/// Payload of an OTA request: source offset, target offset, size (all LE),
/// then the expected SHA-256 of the staged image.
pub const OTA_REQUEST_LEN: usize = 44;

/// A validated read-memory request.
#[must_use]
pub fn parse_read_request(payload: &[u8]) -> Option<LogicalRange> {
    if payload.len() != READ_REQUEST_LEN {
        return None;
    }
    let start_ptr = u32::from_le_bytes(payload[0..4].try_into().unwrap());
    let size = u32::from_le_bytes(payload[4..8].try_into().unwrap());
    Some(LogicalRange::new(start_ptr, size))
}

/// True when the requested range lies entirely inside `[ram_base,
/// ram_base + ram_size)`.
#[must_use]
pub fn ram_range_ok(range: LogicalRange, ram_base: u32, ram_size: u32) -> bool {
    range.start_ptr >= ram_base
        && range
            .start_ptr
            .checked_add(range.size)
            .is_some_and(|end| end <= ram_base + ram_size)
}

/// Firmware-replacement request, offsets relative to the start of flash.
#[derive(Clone, Copy, Debug)]
pub struct OtaRequest {
    pub source: FlashRange,
    pub target: FlashRange,
    pub digest: [u8; 32],
}

#[must_use]
pub fn parse_ota_request(payload: &[u8]) -> Option<OtaRequest> {
    if payload.len() != OTA_REQUEST_LEN {
        return None;
    }
    let source_offset = u32::from_le_bytes(payload[0..4].try_into().unwrap());
    let target_offset = u32::from_le_bytes(payload[4..8].try_into().unwrap());
    let size = u32::from_le_bytes(payload[8..12].try_into().unwrap());
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&payload[12..44]);
    Some(OtaRequest {
        source: FlashRange::new(source_offset, size),
        target: FlashRange::new(target_offset, size),
        digest,
    })
}

/// Range rules for a firmware replacement: the staged image must sit in the
/// reusable region, the target anywhere in flash, and the target must
/// overlap neither the staged image nor the settings sector. Both ranges
/// must be whole sectors.
pub fn validate_ota_request(layout: &FlashLayout, request: &OtaRequest) -> Result<()> {
    if request.source.is_empty() {
        return Err(Error::InvalidArg);
    }
    if !request.source.is_sector_aligned() || !request.target.is_sector_aligned() {
        return Err(Error::BadAlignment);
    }
    if !layout.reusable_range().contains(&request.source) {
        return Err(Error::InvalidAddress);
    }
    if !layout.whole_range().contains(&request.target) {
        return Err(Error::InvalidAddress);
    }
    if request.target.overlaps(&request.source)
        || request.target.overlaps(&layout.settings_range())
    {
        return Err(Error::InvalidArg);
    }
    Ok(())
}

/// Compare the staged image against the digest supplied with the request.
#[must_use]
pub fn staged_digest_matches(staged: &[u8], digest: &[u8; 32]) -> bool {
    let computed = Sha256::digest(staged);
    ct_eq(&computed, digest)
}

/// Range rules for a raw flash write: sector-aligned whole sectors inside
/// the reusable region.
pub fn validate_flash_write(layout: &FlashLayout, offset: u32, len: usize) -> Result<()> {
    let range = FlashRange::new(offset, len as u32);
    if range.is_empty() {
        return Err(Error::InvalidArg);
    }
    if offset % ERASE_SIZE != 0 || len as u32 % ERASE_SIZE != 0 {
        return Err(Error::BadAlignment);
    }
    if !layout.reusable_range().contains(&range) {
        return Err(Error::InvalidAddress);
    }
    Ok(())
}

/// `fmt::Write` adapter over a byte slice; writes past the end fail, which
/// callers treat as "reply buffer full".
pub struct SliceWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> SliceWriter<'a> {
    #[must_use]
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Write for SliceWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        if self.len + bytes.len() > self.buf.len() {
            return Err(fmt::Error);
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }
}

#[cfg(not(feature = "host"))]
mod device {
    use core::fmt::Write as _;

    use defmt::{info, warn};

    use super::SliceWriter;
    #[cfg(feature = "memory-access")]
    use super::{
        parse_ota_request, parse_read_request, ram_range_ok, staged_digest_matches,
        validate_ota_request,
    };
    use crate::Error;
    use crate::board;
    use crate::remote::ServiceShared;
    use crate::remote::handlers::{Exchange, OneShotHandler, TwoStageHandler};
    #[cfg(feature = "memory-access")]
    use crate::remote::wire::MAX_DATA_SIZE;

    /// Diagnostic `key=value` text; rejects any payload or parameter.
    pub struct InfoHandler {
        pub(crate) shared: &'static ServiceShared,
    }

    impl OneShotHandler for InfoHandler {
        fn handle(&self, exchange: &mut Exchange<'_>) -> i32 {
            if exchange.in_size != 0 || exchange.in_param != 0 {
                exchange.out_size = 0;
                return Error::InvalidArg.code();
            }
            let shared = self.shared;
            let mut out = SliceWriter::new(exchange.data);
            let program = shared.layout.program_range();
            let reusable = shared.layout.reusable_range();
            let settings = shared.layout.logical(shared.layout.settings_range());
            let written = (|| {
                writeln!(out, "board={}", shared.board_id_str())?;
                writeln!(out, "version={}", shared.version)?;
                writeln!(
                    out,
                    "program=0x{:08x}+0x{:x}",
                    program.start_offset, program.size
                )?;
                writeln!(
                    out,
                    "reusable=0x{:08x}+0x{:x}",
                    reusable.start_offset, reusable.size
                )?;
                writeln!(out, "settings=0x{:08x}+0x{:x}", settings.start_ptr, settings.size)?;
                shared.hostname.lock(|cell| {
                    writeln!(out, "name={}", cell.borrow().as_str())
                })?;
                match shared.stack.config_v4() {
                    Some(config) => writeln!(out, "ipv4={}", config.address.address()),
                    None => writeln!(out, "ipv4=none"),
                }
            })();
            match written {
                Ok(()) => {
                    exchange.out_size = out.len();
                    exchange.out_size as i32
                }
                Err(_) => {
                    exchange.out_size = 0;
                    Error::InsufficientResources.code()
                }
            }
        }
    }

    /// Rewrite the settings sector; refreshes the hashed secret and the
    /// advertised hostname on success.
    pub struct UpdateSettingsHandler {
        pub(crate) shared: &'static ServiceShared,
    }

    impl OneShotHandler for UpdateSettingsHandler {
        fn handle(&self, exchange: &mut Exchange<'_>) -> i32 {
            exchange.out_size = 0;
            let written = self.shared.store.lock(|cell| {
                cell.borrow_mut().save(&exchange.data[..exchange.in_size])
            });
            match written {
                Ok(()) => {
                    info!("Settings updated ({} bytes)", exchange.in_size);
                    self.shared.refresh_from_settings();
                    exchange.in_size as i32
                }
                Err(err) => {
                    warn!("Settings update failed: {}", defmt::Debug2Format(&err));
                    err.code()
                }
            }
        }
    }

    /// Optionally rewrite settings, then reboot. Two-stage: the reset runs
    /// only after the reply header has been flushed.
    pub struct UpdateRebootHandler {
        pub(crate) shared: &'static ServiceShared,
    }

    impl TwoStageHandler for UpdateRebootHandler {
        fn verify(&self, exchange: &mut Exchange<'_>) -> i32 {
            exchange.out_size = 0;
            let region = self.shared.store.lock(|cell| cell.borrow().region());
            if exchange.in_size > region.size as usize {
                return Error::InvalidArg.code();
            }
            #[cfg(not(feature = "memory-access"))]
            if exchange.in_param == 1 {
                return Error::NotPermitted.code();
            }
            exchange.in_size as i32
        }

        fn commit(&self, exchange: &mut Exchange<'_>) {
            if exchange.in_size > 0 {
                let result = self.shared.store.lock(|cell| {
                    cell.borrow_mut().save(&exchange.data[..exchange.in_size])
                });
                if let Err(err) = result {
                    warn!("Settings rewrite before reboot failed: {}", defmt::Debug2Format(&err));
                }
            }
            #[cfg(feature = "memory-access")]
            if exchange.in_param == 1 {
                board::reboot_to_bootloader();
            }
            board::reboot();
        }
    }

    /// Copy flash (via the XIP window) or SRAM into the reply.
    #[cfg(feature = "memory-access")]
    pub struct ReadMemoryHandler {
        pub(crate) shared: &'static ServiceShared,
    }

    #[cfg(feature = "memory-access")]
    impl OneShotHandler for ReadMemoryHandler {
        fn handle(&self, exchange: &mut Exchange<'_>) -> i32 {
            exchange.out_size = 0;
            let Some(range) = parse_read_request(&exchange.data[..exchange.in_size]) else {
                return Error::InvalidArg.code();
            };
            let in_flash = self.shared.layout.from_logical(range).is_some();
            let in_ram = ram_range_ok(range, board::RAM_BASE, board::RAM_SIZE);
            if !in_flash && !in_ram {
                return Error::InvalidAddress.code();
            }
            let size = (range.size as usize).min(MAX_DATA_SIZE);
            let source = board::memory_slice(range.start_ptr, size);
            exchange.data[..size].copy_from_slice(source);
            exchange.out_size = size;
            size as i32
        }
    }

    /// Erase and program whole sectors in the reusable region; verifies by
    /// readback.
    #[cfg(feature = "memory-access")]
    pub struct WriteFlashHandler {
        pub(crate) shared: &'static ServiceShared,
    }

    #[cfg(feature = "memory-access")]
    impl OneShotHandler for WriteFlashHandler {
        fn handle(&self, exchange: &mut Exchange<'_>) -> i32 {
            exchange.out_size = 0;
            let offset = exchange.in_param as u32;
            if let Err(err) =
                super::validate_flash_write(&self.shared.layout, offset, exchange.in_size)
            {
                return err.code();
            }
            let data = &exchange.data[..exchange.in_size];
            match self.shared.flash.rewrite_verified(offset, data) {
                Ok(()) => exchange.in_size as i32,
                Err(err) => {
                    warn!("Flash write failed: {}", defmt::Debug2Format(&err));
                    err.code()
                }
            }
        }
    }

    /// Replace the firmware from an image staged in the reusable region.
    #[cfg(feature = "memory-access")]
    pub struct OtaUpdateHandler {
        pub(crate) shared: &'static ServiceShared,
    }

    #[cfg(feature = "memory-access")]
    impl TwoStageHandler for OtaUpdateHandler {
        fn verify(&self, exchange: &mut Exchange<'_>) -> i32 {
            exchange.out_size = 0;
            let Some(request) = parse_ota_request(&exchange.data[..exchange.in_size]) else {
                return Error::InvalidArg.code();
            };
            if let Err(err) = validate_ota_request(&self.shared.layout, &request) {
                return err.code();
            }
            let staged = board::memory_slice(
                self.shared.layout.logical(request.source).start_ptr,
                request.source.size as usize,
            );
            if !staged_digest_matches(staged, &request.digest) {
                return Error::ModifiedData.code();
            }
            0
        }

        fn commit(&self, exchange: &mut Exchange<'_>) {
            // Re-parse: validated during verify, and the buffer has not been
            // touched since.
            let Some(request) = parse_ota_request(&exchange.data[..exchange.in_size]) else {
                return;
            };
            info!(
                "Replacing firmware: 0x{:08x} -> 0x{:08x} ({} bytes)",
                request.source.start_offset, request.target.start_offset, request.target.size
            );
            board::replace_firmware(request.source, request.target);
        }
    }

}

#[cfg(not(feature = "host"))]
pub use device::{InfoHandler, UpdateRebootHandler, UpdateSettingsHandler};

#[cfg(all(not(feature = "host"), feature = "memory-access"))]
pub use device::{OtaUpdateHandler, ReadMemoryHandler, WriteFlashHandler};
