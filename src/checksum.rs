// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Checksum wrapper.
//!
//! The original treats its checksum as an opaque, swappable function
//! ("the CRC polynomial choice" is explicitly out of scope). This module
//! mirrors that: a [`Checksum`] trait computes a fixed-width digest over a
//! record's bytes, and [`Additive`] is the one default implementation this
//! crate ships.

/// Computes a checksum over record bytes. Implementations must be
/// deterministic and must not read the bytes reserved for the checksum
/// field itself (callers always pass only the preceding bytes).
pub trait Checksum {
    /// Returns the checksum of `bytes`.
    fn compute(bytes: &[u8]) -> u32;

    /// The value used to mean "never written" — every byte of the
    /// checksum field in the erased polarity decodes to this.
    const ERASED: u32 = u32::MAX;
}

/// A simple additive/rotate checksum. Not cryptographically meaningful,
/// but adequate for detecting torn or partially programmed records, which
/// is the only property this design depends on.
pub struct Additive;

impl Checksum for Additive {
    fn compute(bytes: &[u8]) -> u32 {
        let mut acc: u32 = 0x811c_9dc5;
        for &b in bytes {
            acc = acc.rotate_left(5) ^ (b as u32);
            acc = acc.wrapping_add(0x0100_0193);
        }
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let a = Additive::compute(b"hello");
        let b = Additive::compute(b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn sensitive_to_content() {
        assert_ne!(Additive::compute(b"hello"), Additive::compute(b"hellp"));
    }

    #[test]
    fn sensitive_to_length() {
        assert_ne!(Additive::compute(b"a"), Additive::compute(b"aa"));
    }
}
