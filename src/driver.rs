// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The flash driver contract this crate consumes.
//!
//! Three operations, matching the original's `pifs_flash_read`/
//! `pifs_flash_write`/`pifs_flash_erase`: writes may only transition bits
//! from the erased polarity toward the programmed polarity; violating
//! that is undefined behavior at the driver level. Block erase is the only
//! way to restore a block to the erased polarity.

use crate::address::Address;
use crate::result::Result;

/// A raw flash device, addressed in logical (block, page) units.
pub trait FlashDriver {
    /// Reads `buf.len()` bytes starting at byte `offset` within the given
    /// logical page into `buf`.
    fn read(&mut self, addr: Address, offset: u32, buf: &mut [u8]) -> Result<()>;

    /// Programs `buf` at byte `offset` within the given logical page. The
    /// caller guarantees the write is programmable (see
    /// [`crate::cache::is_programmable`]); a conforming driver need not
    /// re-check this, though it may.
    fn write(&mut self, addr: Address, offset: u32, buf: &[u8]) -> Result<()>;

    /// Erases the entire block, returning every page in it to the erased
    /// polarity.
    fn erase(&mut self, block: u32) -> Result<()>;
}
