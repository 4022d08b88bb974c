//! Registry of message handlers keyed by the request's `msg_type` byte.
//!
//! Ids 120..=127 are reserved for the built-in handlers, 128..=143 for
//! application handlers. A handler is either one-shot (produce a reply,
//! session continues) or two-stage: `verify` runs like a one-shot, then
//! `commit` runs only after the reply header has been flushed to the
//! transport — the shape needed by operations that cannot return, such as
//! reboot and firmware replacement.

use crate::{Error, Result};

/// First valid handler id (start of the built-in range).
pub const HANDLER_ID_FIRST: u8 = 120;

/// First id available to applications.
pub const USER_HANDLER_ID_FIRST: u8 = 128;

/// Last valid handler id.
pub const HANDLER_ID_LAST: u8 = 143;

const HANDLER_SLOTS: usize = (HANDLER_ID_LAST - HANDLER_ID_FIRST + 1) as usize;

/// Ids of the built-in handlers.
pub mod handler_id {
    /// Diagnostic `key=value` text.
    pub const INFO: u8 = 120;
    /// Rewrite the settings blob.
    pub const UPDATE_SETTINGS: u8 = 121;
    /// Rewrite the settings blob (optional) and reboot.
    pub const UPDATE_REBOOT: u8 = 122;
    /// Read flash or SRAM.
    pub const READ_MEMORY: u8 = 123;
    /// Erase and program flash sectors in the reusable region.
    pub const WRITE_FLASH: u8 = 124;
    /// Replace the firmware from a staged image.
    pub const OTA_UPDATE: u8 = 125;
}

/// One request/reply cycle as seen by a handler.
///
/// `data` is the full session buffer: the request payload occupies
/// `data[..in_size]` on entry and the handler leaves its reply in
/// `data[..out_size]`. `out_size` starts at the buffer capacity and may
/// only shrink; the session clamps it regardless.
pub struct Exchange<'a> {
    pub msg_type: u8,
    pub data: &'a mut [u8],
    pub in_size: usize,
    pub in_param: i32,
    pub out_size: usize,
}

/// A handler whose work completes within the request cycle.
pub trait OneShotHandler: Sync {
    /// Returns the reply's `parameter_or_result` (negative = error code).
    fn handle(&self, exchange: &mut Exchange<'_>) -> i32;
}

/// A handler whose destructive half must wait until the reply header has
/// left the device.
pub trait TwoStageHandler: Sync {
    /// Validate the request and stage the work; runs like a one-shot.
    fn verify(&self, exchange: &mut Exchange<'_>) -> i32;

    /// Execute the staged work. Runs only after the reply header was fully
    /// transmitted, and only when `verify` returned a non-negative result.
    /// The session closes afterwards; implementations typically reset the
    /// device and never actually return.
    fn commit(&self, exchange: &mut Exchange<'_>);
}

#[derive(Clone, Copy)]
pub enum Handler {
    OneShot(&'static dyn OneShotHandler),
    TwoStage(&'static dyn TwoStageHandler),
}

/// Table of installed handlers. Registration replaces any previous entry.
pub struct Registry {
    entries: [Option<Handler>; HANDLER_SLOTS],
}

impl Registry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [None; HANDLER_SLOTS],
        }
    }

    pub fn register(&mut self, id: u8, handler: Handler) -> Result<()> {
        let slot = Self::slot(id)?;
        self.entries[slot] = Some(handler);
        Ok(())
    }

    pub fn unregister(&mut self, id: u8) -> Result<()> {
        let slot = Self::slot(id)?;
        self.entries[slot] = None;
        Ok(())
    }

    #[must_use]
    pub fn get(&self, id: u8) -> Option<Handler> {
        Self::slot(id).ok().and_then(|slot| self.entries[slot])
    }

    fn slot(id: u8) -> Result<usize> {
        if (HANDLER_ID_FIRST..=HANDLER_ID_LAST).contains(&id) {
            Ok(usize::from(id - HANDLER_ID_FIRST))
        } else {
            Err(Error::InvalidArg)
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
