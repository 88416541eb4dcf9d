// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Block/page address arithmetic.
//!
//! An [`Address`] names one logical page. Addresses step page-within-block
//! first, carrying into the block index on overflow; stepping past the
//! last filesystem block is a range error rather than a silent wraparound.

use crate::config::Geometry;
use crate::result::{Error, Result};

/// A (block, page) pair naming one logical page.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address {
    pub block: u32,
    pub page: u32,
}

impl Address {
    pub const fn new(block: u32, page: u32) -> Address {
        Address { block, page }
    }

    /// The address used in on-flash records to mean "no address" /
    /// "unset". Matches the original's convention of reserving the
    /// maximum representable value as an "invalid" sentinel.
    pub const INVALID: Address = Address { block: u32::MAX, page: u32::MAX };

    pub const fn is_valid(&self) -> bool {
        self.block != u32::MAX && self.page != u32::MAX
    }

    /// Returns the address stepped forward by `pages` logical pages,
    /// carrying page overflow into the block index.
    pub fn advance(&self, geometry: &Geometry, pages: u32) -> Result<Address> {
        let mut block = self.block;
        let mut page = self.page + pages;
        while page >= geometry.pages_per_block {
            page -= geometry.pages_per_block;
            block += 1;
        }
        if block >= geometry.block_count {
            return Err(Error::InternalRange);
        }
        Ok(Address { block, page })
    }

    /// Returns the next logical page after this one.
    pub fn next(&self, geometry: &Geometry) -> Result<Address> {
        self.advance(geometry, 1)
    }

    /// Returns this address's zero-based linear position among all
    /// logical pages on the device (reserved blocks included).
    pub fn to_linear(&self, geometry: &Geometry) -> u64 {
        self.block as u64 * geometry.pages_per_block as u64 + self.page as u64
    }

    /// Reconstructs an [`Address`] from a linear page position.
    pub fn from_linear(geometry: &Geometry, linear: u64) -> Result<Address> {
        let pages_per_block = geometry.pages_per_block as u64;
        let block = linear / pages_per_block;
        let page = linear % pages_per_block;
        if block >= geometry.block_count as u64 {
            return Err(Error::InternalRange);
        }
        Ok(Address { block: block as u32, page: page as u32 })
    }

    /// True if this address falls within the file-system area (excludes
    /// reserved blocks).
    pub fn in_fs_area(&self, geometry: &Geometry) -> bool {
        self.block >= geometry.reserved_blocks && self.block < geometry.block_count
    }
}
