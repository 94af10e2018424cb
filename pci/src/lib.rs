// Copyright © 2025 The VM Address Allocator Authors
//
// SPDX-License-Identifier: Apache-2.0

//! PCI/PCIe bus topology model and slot/function address allocator.
//!
//! The model is deliberately minimal: a flat list of buses (domain fixed to
//! 0), each bus carrying the connection-type flags and slot bounds implied
//! by the controller model that realizes it, and a per-slot bitmask of the
//! eight possible functions. The allocator on top of it never performs I/O
//! and never retries; a failed reservation leaves the set untouched apart
//! from dry-run bus growth.

mod address;
mod allocator;
mod bus;

pub use crate::address::{PciAddress, PCI_FUNCTION_LAST, PCI_SLOT_LAST};
pub use crate::allocator::{AddressError, Error, PciAddressSet, Result};
pub use crate::bus::{ConnectFlags, PciBus, PciControllerModel};
