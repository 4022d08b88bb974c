//! Host-level tests for flash range arithmetic and region queries.

use wifi_kit::flash_layout::{
    ERASE_SIZE, FlashLayout, FlashRange, LogicalRange, SETTINGS_SIZE, XIP_BASE,
};

const CAPACITY: u32 = 2 * 1024 * 1024;

fn layout() -> FlashLayout {
    FlashLayout::new(CAPACITY, 0x0004_0123)
}

#[test]
fn alignment_rounds_start_down_and_size_up() {
    let aligned = FlashRange::new(4097, 1).align_to_sectors();
    assert_eq!(aligned, FlashRange::new(4096, ERASE_SIZE));

    let already = FlashRange::new(8192, 2 * ERASE_SIZE).align_to_sectors();
    assert_eq!(already, FlashRange::new(8192, 2 * ERASE_SIZE));

    let spanning = FlashRange::new(ERASE_SIZE - 1, 2).align_to_sectors();
    assert_eq!(spanning, FlashRange::new(0, 2 * ERASE_SIZE));
}

#[test]
fn containment_and_overlap() {
    let outer = FlashRange::new(0x1000, 0x4000);
    assert!(outer.contains(&FlashRange::new(0x1000, 0x4000)));
    assert!(outer.contains(&FlashRange::new(0x2000, 0x1000)));
    assert!(!outer.contains(&FlashRange::new(0x0FFF, 0x10)));
    assert!(!outer.contains(&FlashRange::new(0x4000, 0x2000)));

    assert!(outer.overlaps(&FlashRange::new(0x4FFF, 0x10)));
    assert!(!outer.overlaps(&FlashRange::new(0x5000, 0x10)));
    assert!(!outer.overlaps(&FlashRange::new(0, 0x1000)));
    // Empty ranges never overlap anything.
    assert!(!outer.overlaps(&FlashRange::new(0x2000, 0)));

    assert!(outer.contains_offset(0x1000));
    assert!(outer.contains_offset(0x4FFF));
    assert!(!outer.contains_offset(0x5000));
}

#[test]
fn regions_partition_the_device() {
    let layout = layout();
    let program = layout.program_range();
    let reusable = layout.reusable_range();
    let settings = layout.settings_range();

    // The program bound rounds up to a whole sector.
    assert_eq!(program.start_offset, 0);
    assert_eq!(program.size, 0x0004_1000);

    assert_eq!(reusable.start_offset, program.end());
    assert_eq!(reusable.end(), settings.start_offset);
    assert_eq!(settings.size, SETTINGS_SIZE);
    assert_eq!(settings.end(), CAPACITY);
    assert_eq!(layout.whole_range(), FlashRange::new(0, CAPACITY));

    assert!(!program.overlaps(&reusable));
    assert!(!reusable.overlaps(&settings));
}

#[test]
fn logical_translation_round_trips() {
    let layout = layout();
    let settings = layout.settings_range();
    let logical = layout.logical(settings);
    assert_eq!(logical.start_ptr, XIP_BASE + settings.start_offset);
    assert_eq!(logical.size, settings.size);
    assert_eq!(layout.from_logical(logical), Some(settings));
}

#[test]
fn from_logical_rejects_foreign_ranges() {
    let layout = layout();
    // Below the XIP window.
    assert_eq!(layout.from_logical(LogicalRange::new(0x0000_1000, 16)), None);
    // Runs past the end of the device.
    assert_eq!(
        layout.from_logical(LogicalRange::new(XIP_BASE + CAPACITY - 8, 16)),
        None
    );
    // SRAM is not flash.
    assert_eq!(layout.from_logical(LogicalRange::new(0x2000_0000, 16)), None);
}
