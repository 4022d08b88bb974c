//! Board bindings: the shared flash controller, chip identity, flash
//! geometry detection, and the reset paths.
//!
//! Everything that must touch raw pointers or the boot ROM lives here so
//! the rest of the crate stays free of `unsafe`.

#![allow(
    unsafe_code,
    reason = "XIP window reads, linker-symbol arithmetic and the ROM-driven \
              firmware copy cannot be expressed safely"
)]

use core::cell::RefCell;

use embassy_rp::Peri;
use embassy_rp::flash::{Blocking, Flash as EmbassyFlash};
use embassy_rp::peripherals::FLASH;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use static_cell::StaticCell;

use crate::flash_layout::{FlashLayout, FlashRange, PAGE_SIZE, XIP_BASE};
use crate::remote::wire::BOARD_ID_LEN;
use crate::{Error, Result};

// Internal flash size for Raspberry Pi Pico 2 W (4 MB).
#[cfg(feature = "pico2")]
pub const INTERNAL_FLASH_SIZE: usize = 4 * 1024 * 1024;

// Internal flash size for Raspberry Pi Pico 1 W (2 MB).
#[cfg(not(feature = "pico2"))]
pub const INTERNAL_FLASH_SIZE: usize = 2 * 1024 * 1024;

/// Start of on-chip SRAM.
pub const RAM_BASE: u32 = 0x2000_0000;

/// SRAM size including the striped and direct-mapped banks.
#[cfg(feature = "pico2")]
pub const RAM_SIZE: u32 = 0x0008_2000;

#[cfg(not(feature = "pico2"))]
pub const RAM_SIZE: u32 = 0x0004_2000;

/// Static resources for [`FlashController`].
pub struct FlashControllerStatic {
    controller_cell: StaticCell<FlashController>,
}

impl FlashControllerStatic {
    #[must_use]
    pub const fn new_static() -> Self {
        Self {
            controller_cell: StaticCell::new(),
        }
    }
}

/// Owns the flash driver; every flash access in the crate funnels through
/// here. The embassy-rp blocking driver pauses the other core and
/// interrupts around each erase/program, which is what makes writes safe
/// while code executes from flash.
pub struct FlashController {
    flash: Mutex<
        CriticalSectionRawMutex,
        RefCell<EmbassyFlash<'static, FLASH, Blocking, INTERNAL_FLASH_SIZE>>,
    >,
}

impl FlashController {
    #[must_use]
    pub const fn new_static() -> FlashControllerStatic {
        FlashControllerStatic::new_static()
    }

    pub fn new(
        controller_static: &'static FlashControllerStatic,
        peripheral: Peri<'static, FLASH>,
    ) -> &'static Self {
        controller_static.controller_cell.init(Self {
            flash: Mutex::new(RefCell::new(EmbassyFlash::new_blocking(peripheral))),
        })
    }

    fn with_flash<R>(
        &self,
        f: impl FnOnce(
            &mut EmbassyFlash<'static, FLASH, Blocking, INTERNAL_FLASH_SIZE>,
        ) -> Result<R>,
    ) -> Result<R> {
        self.flash.lock(|flash| f(&mut flash.borrow_mut()))
    }

    pub fn erase(&self, range: FlashRange) -> Result<()> {
        self.with_flash(|flash| {
            flash
                .blocking_erase(range.start_offset, range.end())
                .map_err(Error::Flash)
        })
    }

    pub fn program(&self, offset: u32, data: &[u8]) -> Result<()> {
        self.with_flash(|flash| flash.blocking_write(offset, data).map_err(Error::Flash))
    }

    pub fn read(&self, offset: u32, out: &mut [u8]) -> Result<()> {
        self.with_flash(|flash| flash.blocking_read(offset, out).map_err(Error::Flash))
    }

    /// Erase the sectors covering `data` and program it, then verify by
    /// readback. `offset` and `data.len()` must be sector-aligned.
    pub fn rewrite_verified(&self, offset: u32, data: &[u8]) -> Result<()> {
        self.erase(FlashRange::new(offset, data.len() as u32))?;
        let page = PAGE_SIZE as usize;
        for (index, chunk) in data.chunks(page).enumerate() {
            self.program(offset + (index * page) as u32, chunk)?;
        }
        let mut readback = [0u8; PAGE_SIZE as usize];
        for (index, chunk) in data.chunks(page).enumerate() {
            self.read(offset + (index * page) as u32, &mut readback[..chunk.len()])?;
            if readback[..chunk.len()] != *chunk {
                return Err(Error::InvalidData);
            }
        }
        Ok(())
    }

    /// The chip's 8-byte unique id.
    pub fn unique_id(&self) -> Result<[u8; 8]> {
        let mut id = [0u8; 8];
        self.with_flash(|flash| flash.blocking_unique_id(&mut id).map_err(Error::Flash))?;
        Ok(id)
    }

    /// The board identity used on the wire: 16 uppercase hex characters.
    pub fn board_id(&self) -> Result<[u8; BOARD_ID_LEN]> {
        let id = self.unique_id()?;
        let mut text = [0u8; BOARD_ID_LEN];
        for (pair, byte) in text.chunks_exact_mut(2).zip(id.iter()) {
            pair[0] = hex_upper(byte >> 4);
            pair[1] = hex_upper(byte & 0x0F);
        }
        Ok(text)
    }
}

impl crate::settings::FlashOps for &'static FlashController {
    fn erase(&mut self, range: FlashRange) -> Result<()> {
        FlashController::erase(*self, range)
    }

    fn program(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        FlashController::program(*self, offset, data)
    }

    fn read(&mut self, offset: u32, out: &mut [u8]) -> Result<()> {
        FlashController::read(*self, offset, out)
    }
}

const fn hex_upper(nibble: u8) -> u8 {
    match nibble {
        0..=9 => b'0' + nibble,
        _ => b'A' + nibble - 10,
    }
}

// Linker symbols bounding the program image: the flash copy of `.data`
// follows `.text`/`.rodata`, so its end is the end of the image.
unsafe extern "C" {
    static __sdata: u8;
    static __edata: u8;
    static __sidata: u8;
}

/// Flash geometry for this board, with the program bound taken from the
/// linker.
#[must_use]
pub fn flash_layout() -> FlashLayout {
    // SAFETY: only the addresses of the linker symbols are taken.
    let (sidata, sdata, edata) = unsafe {
        (
            (&raw const __sidata) as u32,
            (&raw const __sdata) as u32,
            (&raw const __edata) as u32,
        )
    };
    FlashLayout::new(INTERNAL_FLASH_SIZE as u32, sidata + (edata - sdata) - XIP_BASE)
}

/// Read-only view of arbitrary memory (XIP window or SRAM). Callers must
/// have validated the range first.
#[must_use]
pub fn memory_slice(start_ptr: u32, len: usize) -> &'static [u8] {
    // SAFETY: the caller validated the range against the flash layout or
    // the SRAM bounds; both windows are always readable.
    unsafe { core::slice::from_raw_parts(start_ptr as *const u8, len) }
}

/// CPU-readable view of the settings sector.
#[must_use]
pub fn settings_text(layout: &FlashLayout) -> &'static [u8] {
    let logical = layout.logical(layout.settings_range());
    memory_slice(logical.start_ptr, logical.size as usize)
}

/// Reset the whole system.
pub fn reboot() -> ! {
    cortex_m::peripheral::SCB::sys_reset();
}

/// Reboot into the USB bootloader (BOOTSEL), for reflashing over USB.
#[cfg(all(feature = "memory-access", feature = "pico1"))]
pub fn reboot_to_bootloader() -> ! {
    embassy_rp::rom_data::reset_to_usb_boot(0, 0);
    loop {
        cortex_m::asm::nop();
    }
}

/// Bootloader entry is a RP2040 ROM service; on other parts fall back to a
/// plain reset.
#[cfg(all(feature = "memory-access", not(feature = "pico1")))]
pub fn reboot_to_bootloader() -> ! {
    reboot();
}

#[cfg(all(feature = "memory-access", feature = "pico1"))]
mod firmware_copy {
    use embassy_rp::{pac, rom_data};

    use crate::flash_layout::{ERASE_SIZE, FlashRange, XIP_BASE};

    /// Boot-ROM entry points gathered before XIP is disturbed.
    struct RomFuncs {
        connect_internal_flash: unsafe extern "C" fn(),
        flash_exit_xip: unsafe extern "C" fn(),
        flash_range_erase: unsafe extern "C" fn(u32, usize, u32, u8),
        flash_range_program: unsafe extern "C" fn(u32, *const u8, usize),
        flash_flush_cache: unsafe extern "C" fn(),
        flash_enter_cmd_xip: unsafe extern "C" fn(),
    }

    const WATCHDOG_LOAD: *mut u32 = 0x4005_8004 as *mut u32;
    const BLOCK_ERASE_CMD: u8 = 0xD8;

    /// Replace `target` with the image staged at `source`, then reset.
    ///
    /// Interrupts and the second core are stopped, a long watchdog guards
    /// the whole operation (refreshed each sector by a direct register
    /// write), and the copy loop runs from RAM because the target may
    /// include the running program.
    pub fn replace_firmware(source: FlashRange, target: FlashRange) -> ! {
        cortex_m::interrupt::disable();
        pac::PSM.frce_off().modify(|reg| reg.set_proc1(true));

        pac::WATCHDOG.load().write(|reg| reg.set_time(0x7F_FFFF));
        pac::WATCHDOG.ctrl().modify(|reg| reg.set_enable(true));

        let funcs = RomFuncs {
            connect_internal_flash: rom_data::connect_internal_flash::ptr(),
            flash_exit_xip: rom_data::flash_exit_xip::ptr(),
            flash_range_erase: rom_data::flash_range_erase::ptr(),
            flash_range_program: rom_data::flash_range_program::ptr(),
            flash_flush_cache: rom_data::flash_flush_cache::ptr(),
            flash_enter_cmd_xip: rom_data::flash_enter_cmd_xip::ptr(),
        };

        // SAFETY: ranges were validated by the OTA handler; nothing else
        // runs from here on.
        unsafe {
            copy_image(
                &funcs,
                (XIP_BASE + source.start_offset) as *const u8,
                target.start_offset,
                target.size,
            )
        }
    }

    /// The copy loop itself. `.data` placement keeps it in RAM; no flash
    /// execution happens between `flash_exit_xip` and `flash_enter_cmd_xip`.
    #[link_section = ".data"]
    #[inline(never)]
    unsafe fn copy_image(funcs: &RomFuncs, source: *const u8, target: u32, size: u32) -> ! {
        let sector = ERASE_SIZE as usize;
        let mut buffer = [0u8; ERASE_SIZE as usize];
        let mut done: u32 = 0;
        while done < size {
            unsafe {
                WATCHDOG_LOAD.write_volatile(0x7F_FFFF);
                // Stage one source sector in RAM while the XIP window is
                // still readable.
                let mut index = 0;
                while index < sector {
                    buffer[index] = source.add(done as usize + index).read_volatile();
                    index += 1;
                }
                (funcs.connect_internal_flash)();
                (funcs.flash_exit_xip)();
                (funcs.flash_range_erase)(target + done, sector, ERASE_SIZE, BLOCK_ERASE_CMD);
                (funcs.flash_range_program)(target + done, buffer.as_ptr(), sector);
                (funcs.flash_flush_cache)();
                (funcs.flash_enter_cmd_xip)();
            }
            done += ERASE_SIZE;
        }
        // Short fuse: let the watchdog reset into the new image.
        unsafe {
            WATCHDOG_LOAD.write_volatile(100);
        }
        loop {
            cortex_m::asm::nop();
        }
    }
}

#[cfg(all(feature = "memory-access", feature = "pico1"))]
pub use firmware_copy::replace_firmware;

/// Firmware replacement relies on RP2040 boot-ROM helpers; without them the
/// request is refused at validation time, so this stub is unreachable in
/// practice.
#[cfg(all(feature = "memory-access", not(feature = "pico1")))]
pub fn replace_firmware(_source: FlashRange, _target: FlashRange) -> ! {
    reboot();
}
