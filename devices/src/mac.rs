// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Hardware addresses for the devices we create.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// A [MAC Address].
///
/// [MAC Address]: https://en.wikipedia.org/wiki/MAC_address
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Mac(pub [u8; 6]);

impl From<[u8; 6]> for Mac {
    fn from(value: [u8; 6]) -> Self {
        Mac(value)
    }
}

impl AsRef<[u8; 6]> for Mac {
    fn as_ref(&self) -> &[u8; 6] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Mac {
    type Error = MacError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        <[u8; 6]>::try_from(value)
            .map(Mac)
            .map_err(|_| MacError::Length(value.len()))
    }
}

impl Mac {
    /// The zero `Mac`.
    pub const ZERO: Mac = Mac([0; 6]);

    /// Returns true iff the least significant bit of the first octet is one.
    #[must_use]
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 == 0x01
    }

    /// Returns true iff the locally administered bit is set.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.0[0] & 0x02 != 0
    }
}

impl Display for Mac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Errors which may occur producing a [`Mac`].
#[derive(Debug, thiserror::Error)]
pub enum MacError {
    /// The kernel reported an address which is not 6 bytes long.
    #[error("hardware address has length {0}, expected 6")]
    Length(usize),
    /// No address could be produced.
    #[error("unable to generate hardware address: {0}")]
    Random(String),
}

/// Source of hardware addresses for newly created devices.
pub trait MacGenerator {
    /// Produce a fresh unicast, locally administered address.
    ///
    /// # Errors
    ///
    /// Fails if no address could be produced; the caller must not create the device.
    fn generate(&self) -> Result<Mac, MacError>;
}

/// Generates addresses from the thread local random number generator.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomMac;

impl MacGenerator for RandomMac {
    fn generate(&self) -> Result<Mac, MacError> {
        let mut octets = [0u8; 6];
        rand::rng().fill_bytes(&mut octets);
        // unicast, locally administered
        octets[0] = (octets[0] & 0xfe) | 0x02;
        Ok(Mac(octets))
    }
}
