//! Flash geometry: ranges, sector alignment, and the regions the rest of the
//! crate cares about (program image, reusable space, settings sector).
//!
//! Everything here is pure arithmetic so it can be exercised on the host; the
//! hardware constructor lives in [`crate::board`].

/// Start of the CPU-addressable (execute-in-place) flash window.
pub const XIP_BASE: u32 = 0x1000_0000;

/// Erase granularity of the on-board flash.
pub const ERASE_SIZE: u32 = 4096;

/// Program-page granularity of the on-board flash.
pub const PAGE_SIZE: u32 = 256;

/// Size of the settings region (one erase sector at the end of flash).
pub const SETTINGS_SIZE: u32 = ERASE_SIZE;

/// A region of flash expressed as offsets from the start of the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlashRange {
    pub start_offset: u32,
    pub size: u32,
}

impl FlashRange {
    #[must_use]
    pub const fn new(start_offset: u32, size: u32) -> Self {
        Self { start_offset, size }
    }

    /// One past the last offset covered by this range.
    #[must_use]
    pub const fn end(&self) -> u32 {
        self.start_offset + self.size
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Round the start down and the size up to whole erase sectors.
    #[must_use]
    pub const fn align_to_sectors(&self) -> Self {
        let start = self.start_offset - (self.start_offset % ERASE_SIZE);
        let end = self.end();
        let end = if end % ERASE_SIZE == 0 {
            end
        } else {
            end + (ERASE_SIZE - end % ERASE_SIZE)
        };
        Self {
            start_offset: start,
            size: end - start,
        }
    }

    #[must_use]
    pub const fn is_sector_aligned(&self) -> bool {
        self.start_offset % ERASE_SIZE == 0 && self.size % ERASE_SIZE == 0
    }

    /// True if `other` lies entirely within this range. Empty ranges are
    /// contained wherever their start is.
    #[must_use]
    pub const fn contains(&self, other: &Self) -> bool {
        other.start_offset >= self.start_offset && other.end() <= self.end()
    }

    #[must_use]
    pub const fn contains_offset(&self, offset: u32) -> bool {
        offset >= self.start_offset && offset < self.end()
    }

    /// True if the two ranges share at least one byte.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.start_offset < other.end()
            && other.start_offset < self.end()
    }
}

/// The CPU-readable view of a [`FlashRange`] through the XIP window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogicalRange {
    pub start_ptr: u32,
    pub size: u32,
}

impl LogicalRange {
    #[must_use]
    pub const fn new(start_ptr: u32, size: u32) -> Self {
        Self { start_ptr, size }
    }

    #[must_use]
    pub const fn end(&self) -> u32 {
        self.start_ptr + self.size
    }
}

/// Flash geometry for one board: total capacity and where the program image
/// ends. All region queries derive from these two numbers.
#[derive(Clone, Copy, Debug)]
pub struct FlashLayout {
    capacity: u32,
    program_limit: u32,
}

impl FlashLayout {
    /// `program_limit` is the first offset past the program image; it is
    /// rounded up to a sector boundary so the reusable region never overlaps
    /// code.
    #[must_use]
    pub const fn new(capacity: u32, program_limit: u32) -> Self {
        debug_assert!(capacity % ERASE_SIZE == 0);
        debug_assert!(program_limit <= capacity - SETTINGS_SIZE);
        let aligned = FlashRange::new(0, program_limit).align_to_sectors();
        Self {
            capacity,
            program_limit: aligned.end(),
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// The sectors occupied by the running program.
    #[must_use]
    pub const fn program_range(&self) -> FlashRange {
        FlashRange::new(0, self.program_limit)
    }

    /// Everything between the program image and the settings sector; safe
    /// for dynamic writes such as staged firmware images.
    #[must_use]
    pub const fn reusable_range(&self) -> FlashRange {
        FlashRange::new(
            self.program_limit,
            self.capacity - SETTINGS_SIZE - self.program_limit,
        )
    }

    /// The settings sector (the last erase sector of the device).
    #[must_use]
    pub const fn settings_range(&self) -> FlashRange {
        FlashRange::new(self.capacity - SETTINGS_SIZE, SETTINGS_SIZE)
    }

    #[must_use]
    pub const fn whole_range(&self) -> FlashRange {
        FlashRange::new(0, self.capacity)
    }

    /// CPU-addressable view of a flash range.
    #[must_use]
    pub const fn logical(&self, range: FlashRange) -> LogicalRange {
        LogicalRange::new(XIP_BASE + range.start_offset, range.size)
    }

    /// Translate a CPU-addressable range back to flash offsets; `None` if it
    /// does not fall inside the XIP window for this device.
    #[must_use]
    pub fn from_logical(&self, range: LogicalRange) -> Option<FlashRange> {
        let start = range.start_ptr.checked_sub(XIP_BASE)?;
        let flash = FlashRange::new(start, range.size);
        self.whole_range().contains(&flash).then_some(flash)
    }
}
