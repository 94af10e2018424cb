// Copyright © 2025 The VM Address Allocator Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};

/// Highest function number on a PCI slot.
pub const PCI_FUNCTION_LAST: u8 = 7;
/// Highest slot number on a full-size PCI bus.
pub const PCI_SLOT_LAST: u8 = 31;

/// A PCI device address. The domain is carried for display and validation
/// purposes but only domain 0 is ever usable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
    /// Tri-state multifunction hint: `None` means unspecified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multifunction: Option<bool>,
}

impl PciAddress {
    pub fn new(bus: u8, slot: u8, function: u8) -> Self {
        PciAddress {
            domain: 0,
            bus,
            slot,
            function,
            multifunction: None,
        }
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_format() {
        let addr = PciAddress::new(0, 0x1f, 2);
        assert_eq!(addr.to_string(), "0000:00:1f.2");

        let addr = PciAddress::new(2, 31, 7);
        assert_eq!(addr.to_string(), "0000:02:1f.7");
    }
}
