// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: MAC address model and the two-bank fuse word mapping.
// Author: Lukas Bower

//! MAC addresses and their hardware fuse representation.
//!
//! The target stores its MAC across two one-time-programmable fuse words:
//! a 16-bit high word holding octets 0-1 and a 32-bit low word holding
//! octets 2-5. The split mirrors the fuse bank layout, not numeric byte
//! order, so the conversion is hex concatenation in octet order.

use std::fmt;
use std::str::FromStr;

/// A 6-octet hardware address, rendered as lowercase colon-separated hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

/// The fuse-bank encoding of a [`MacAddr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuseWords {
    /// Octets 0-1 as one 16-bit word.
    pub high: u16,
    /// Octets 2-5 as one 32-bit word.
    pub low: u32,
}

/// Parse failure for a MAC address string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacParseError(String);

impl fmt::Display for MacParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid MAC address {:?}", self.0)
    }
}

impl std::error::Error for MacParseError {}

impl MacAddr {
    /// Construct from raw octets.
    #[must_use]
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Return the raw octets.
    #[must_use]
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Split into the two fuse words the bootloader programs.
    #[must_use]
    pub fn fuse_words(&self) -> FuseWords {
        let [a, b, c, d, e, f] = self.0;
        FuseWords {
            high: u16::from_be_bytes([a, b]),
            low: u32::from_be_bytes([c, d, e, f]),
        }
    }

    /// Rebuild the address from its fuse words.
    #[must_use]
    pub fn from_fuse_words(words: FuseWords) -> Self {
        let [a, b] = words.high.to_be_bytes();
        let [c, d, e, f] = words.low.to_be_bytes();
        Self([a, b, c, d, e, f])
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, f_] = self.0;
        write!(
            f,
            "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{f_:02x}"
        )
    }
}

impl FromStr for MacAddr {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut count = 0;
        for part in s.split(':') {
            // from_str_radix tolerates a leading sign, so the characters are
            // checked as hex digits first.
            if count == 6 || part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(MacParseError(s.to_owned()));
            }
            octets[count] =
                u8::from_str_radix(part, 16).map_err(|_| MacParseError(s.to_owned()))?;
            count += 1;
        }
        if count != 6 {
            return Err(MacParseError(s.to_owned()));
        }
        Ok(Self(octets))
    }
}
