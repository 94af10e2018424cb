// Copyright © 2025 The VM Address Allocator Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeSet;

use log::debug;
use thiserror::Error;

/// Default register bases per device class on the sPAPR-VIO bus.
pub const VIO_ADDR_NET: u64 = 0x1000;
pub const VIO_ADDR_SCSI: u64 = 0x2000;
pub const VIO_ADDR_NVRAM: u64 = 0x3000;
pub const VIO_ADDR_SERIAL: u64 = 0x3000_0000;

/// Distance between probed register addresses.
const VIO_ADDR_STRIDE: u64 = 0x1000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SpaprVioError {
    #[error("sPAPR-VIO reg {0:#x} is already in use")]
    RegInUse(u64),
    #[error("no free sPAPR-VIO reg available from base {0:#x}")]
    NoFreeReg(u64),
}

/// Register addresses in use on the sPAPR-VIO bus.
#[derive(Debug, Default)]
pub struct SpaprVioAddressSet {
    used: BTreeSet<u64>,
}

impl SpaprVioAddressSet {
    pub fn new() -> Self {
        SpaprVioAddressSet {
            used: BTreeSet::new(),
        }
    }

    /// Claim an explicitly configured register address. A collision with
    /// an already-claimed reg is a hard error since the user asked for
    /// this exact address.
    pub fn reserve(&mut self, reg: u64) -> Result<(), SpaprVioError> {
        if !self.used.insert(reg) {
            return Err(SpaprVioError::RegInUse(reg));
        }
        debug!("reserving sPAPR-VIO reg {reg:#x}");
        Ok(())
    }

    /// Probe upwards from the class base in fixed strides until a free
    /// register address is found.
    pub fn assign_next(&mut self, base: u64) -> Result<u64, SpaprVioError> {
        let mut reg = base;
        while self.used.contains(&reg) {
            reg = reg
                .checked_add(VIO_ADDR_STRIDE)
                .ok_or(SpaprVioError::NoFreeReg(base))?;
        }
        self.used.insert(reg);
        debug!("assigned sPAPR-VIO reg {reg:#x}");
        Ok(reg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probes_by_stride_from_class_base() {
        let mut set = SpaprVioAddressSet::new();
        assert_eq!(set.assign_next(VIO_ADDR_NET).unwrap(), 0x1000);
        assert_eq!(set.assign_next(VIO_ADDR_NET).unwrap(), 0x2000);
        // The second net device probed into the SCSI base; a SCSI device
        // keeps probing past both.
        assert_eq!(set.assign_next(VIO_ADDR_SCSI).unwrap(), 0x3000);
    }

    #[test]
    fn explicit_collision_is_an_error() {
        let mut set = SpaprVioAddressSet::new();
        set.reserve(0x1000).unwrap();
        assert_eq!(set.reserve(0x1000), Err(SpaprVioError::RegInUse(0x1000)));
    }

    #[test]
    fn auto_assignment_skips_explicit_reg() {
        let mut set = SpaprVioAddressSet::new();
        set.reserve(VIO_ADDR_SERIAL).unwrap();
        assert_eq!(
            set.assign_next(VIO_ADDR_SERIAL).unwrap(),
            VIO_ADDR_SERIAL + VIO_ADDR_STRIDE
        );
    }
}
