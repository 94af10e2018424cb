// Copyright © 2025 The VM Address Allocator Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeSet;
use std::fmt;

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Highest device number in one subchannel set.
const CCW_MAX_DEVNO: u16 = 0xffff;

/// Channel subsystem image id used for virtual devices.
const CCW_VIRTUAL_CSSID: u8 = 0xfe;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CcwError {
    #[error("The CCW devno '{0}' is already in use")]
    AddressInUse(CcwAddress),
    #[error("There are no more free CCW devnos")]
    NoFreeDevno,
}

/// A channel subsystem device address: channel subsystem image, subchannel
/// set and device number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CcwAddress {
    pub cssid: u8,
    pub ssid: u8,
    pub devno: u16,
}

impl CcwAddress {
    pub fn new(cssid: u8, ssid: u8, devno: u16) -> Self {
        CcwAddress { cssid, ssid, devno }
    }
}

impl fmt::Display for CcwAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}.{:x}.{:04x}", self.cssid, self.ssid, self.devno)
    }
}

/// The set of CCW addresses in use, plus the cursor from which device
/// numbers are handed out to devices without an explicit address.
#[derive(Debug, Default)]
pub struct CcwAddressSet {
    defined: BTreeSet<CcwAddress>,
    next: CcwAddress,
}

impl CcwAddressSet {
    pub fn new() -> Self {
        CcwAddressSet {
            defined: BTreeSet::new(),
            next: CcwAddress::new(CCW_VIRTUAL_CSSID, 0, 0),
        }
    }

    pub fn contains(&self, addr: CcwAddress) -> bool {
        self.defined.contains(&addr)
    }

    /// Claim an explicitly configured address.
    pub fn reserve(&mut self, addr: CcwAddress) -> Result<(), CcwError> {
        if !self.defined.insert(addr) {
            return Err(CcwError::AddressInUse(addr));
        }
        debug!("reserving CCW address {addr}");
        Ok(())
    }

    /// Hand out the next unused device number on the virtual channel
    /// subsystem, skipping numbers claimed by explicit addresses.
    pub fn assign_next(&mut self) -> Result<CcwAddress, CcwError> {
        while self.defined.contains(&self.next) {
            if self.next.devno == CCW_MAX_DEVNO {
                return Err(CcwError::NoFreeDevno);
            }
            self.next.devno += 1;
        }
        let addr = self.next;
        self.defined.insert(addr);
        if self.next.devno < CCW_MAX_DEVNO {
            self.next.devno += 1;
        }
        debug!("assigned CCW address {addr}");
        Ok(addr)
    }

    /// Drop an address and, when it sits below the cursor in the same
    /// subchannel set, rewind the cursor so the number can be reused.
    pub fn release(&mut self, addr: CcwAddress) {
        if !self.defined.remove(&addr) {
            return;
        }
        if addr.cssid == self.next.cssid && addr.ssid == self.next.ssid && addr.devno < self.next.devno
        {
            self.next.devno = addr.devno;
        }
        debug!("released CCW address {addr}");
    }
}
