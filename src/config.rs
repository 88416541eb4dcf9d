// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compile-time geometry and table sizing.
//!
//! The original C implementation selects narrow integer types and array
//! sizes through preprocessor macros evaluated against the target flash
//! geometry (`pifs_config.h`, `flash_config.h`). Rust's const generics are
//! the natural replacement: a type implementing [`Config`] pins every
//! fixed-size table the core needs, and [`Geometry`] carries the runtime
//! (but still fixed-at-format-time) description of the physical device.

/// Byte value a freshly erased NOR cell reads back as. `0xFF` on every
/// device this design targets; kept as a constant rather than a
/// configuration knob because the polarity assumptions run throughout the
/// cache and delta logic.
pub const ERASED_BYTE: u8 = 0xFF;

/// Describes the physical and logical shape of one flash device.
///
/// "Logical pages" may be a power-of-two multiple of the physical flash
/// page; this crate always operates in units of logical pages and leaves
/// splitting a logical page into physical pages to the [`crate::driver::FlashDriver`]
/// implementation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Geometry {
    /// Total number of erase blocks on the device, including reserved ones.
    pub block_count: u32,
    /// Number of blocks, at the start of the device, that the file system
    /// never touches (e.g. bootloader images).
    pub reserved_blocks: u32,
    /// Number of logical pages per erase block.
    pub pages_per_block: u32,
    /// Size of one logical page, in bytes.
    pub page_size: u32,
    /// Number of blocks occupied by *one* management generation (header,
    /// entry list, FSBM, delta map, wear-level list). The device always
    /// carries two generations back to back (primary plus secondary), so
    /// the management area as a whole spans `management_blocks * 2`
    /// blocks. Small page sizes or a large `Config::MAX_ENTRIES` may need
    /// more than one block per generation to fit the five regions.
    pub management_blocks: u32,
}

impl Geometry {
    /// Number of blocks actually usable by the file system (total minus
    /// reserved).
    pub const fn fs_block_count(&self) -> u32 {
        self.block_count - self.reserved_blocks
    }

    /// Number of logical pages in the file-system area.
    pub const fn fs_page_count(&self) -> u32 {
        self.fs_block_count() * self.pages_per_block
    }

    /// Number of data blocks: fs blocks minus the management blocks (there
    /// are two management blocks on flash at all times, primary and
    /// secondary, even though `management_blocks` counts only one
    /// generation's worth).
    pub const fn data_block_count(&self) -> u32 {
        self.fs_block_count() - self.management_blocks * 2
    }

    /// Total bytes addressable in the data area.
    pub const fn data_capacity_bytes(&self) -> u64 {
        self.data_block_count() as u64
            * self.pages_per_block as u64
            * self.page_size as u64
    }
}

/// Compile-time bounds on every fixed-size in-memory and on-flash table.
///
/// All tables the core needs are sized from these associated constants;
/// there is no dynamic allocation anywhere in the core. Implementors
/// typically define a zero-sized marker type per target device.
pub trait Config {
    /// Maximum number of simultaneously open files.
    const MAX_OPEN_FILES: usize;
    /// Maximum number of simultaneously open directory iterators.
    const MAX_OPEN_DIRS: usize;
    /// Maximum number of entries (files + directories) in one entry list.
    const MAX_ENTRIES: usize;
    /// Maximum file/directory name length, in bytes, not including any
    /// NUL terminator.
    const MAX_FILENAME_LEN: usize;
    /// Number of logical pages reserved for the delta map.
    const MAX_DELTA_PAGES: usize;
    /// Size of the least-worn block cache kept in the header.
    const LEAST_WORN_COUNT: usize;
    /// Size of the most-worn block cache kept in the header.
    const MOST_WORN_COUNT: usize;
    /// Maximum number of concurrent tasks whose current working directory
    /// is tracked (only meaningful with the `directories` feature).
    const MAX_TASKS: usize;
    /// Below this many free data pages, `FileSystem::write` proactively
    /// triggers a merge before attempting to grow a file.
    const MERGE_DATA_PAGE_THRESHOLD: usize;
    /// A data block whose wear gap to the current maximum exceeds this
    /// many erase cycles is a static wear-leveling candidate regardless of
    /// the percentage-based threshold.
    const STATIC_WEAR_LIMIT: u32;
    /// Percentage (0-100) of the maximum observed wear used as the other
    /// static wear-leveling threshold; the larger of the two thresholds
    /// applies.
    const STATIC_WEAR_PERCENT: u32;
}
