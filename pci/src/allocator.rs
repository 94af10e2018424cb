// Copyright © 2025 The VM Address Allocator Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::result;

use log::debug;
use thiserror::Error;

use crate::address::{PciAddress, PCI_FUNCTION_LAST};
use crate::bus::{function_bit, ConnectFlags, PciBus, PciControllerModel, SLOT_ALL_FUNCTIONS};

/// What went wrong, independent of who supplied the offending address.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AddressError {
    #[error("No PCI buses available")]
    NoBuses,
    #[error("Invalid PCI address {0}. Only PCI domain 0 is available")]
    InvalidDomain(PciAddress),
    #[error("Invalid PCI address {addr}. Only PCI buses up to {max} are available")]
    BusOutOfRange { addr: PciAddress, max: usize },
    #[error("Invalid PCI address {addr}. slot must be >= {min}")]
    SlotBelowMinimum { addr: PciAddress, min: u8 },
    #[error("Invalid PCI address {addr}. slot must be <= {max}")]
    SlotAboveMaximum { addr: PciAddress, max: u8 },
    #[error("Invalid PCI address {0}. function must be <= 7")]
    FunctionOutOfRange(PciAddress),
    #[error(
        "PCI bus is not compatible with the device at {0}. Device requires a standard PCI slot"
    )]
    RequiresPciSlot(PciAddress),
    #[error(
        "PCI bus is not compatible with the device at {0}. Device requires a PCI Express slot"
    )]
    RequiresPcieSlot(PciAddress),
    #[error("The device information for {0} has no PCI connection types listed")]
    NoConnectTypes(PciAddress),
    #[error(
        "PCI bus is not compatible with the device at {0}. Device requires hot-plug capability"
    )]
    RequiresHotplug(PciAddress),
    #[error(
        "Attempted double use of PCI slot {0} (may need multifunction='on' for device on function 0)"
    )]
    SlotInUse(PciAddress),
    #[error("Attempted double use of PCI address {0}")]
    FunctionInUse(PciAddress),
    #[error(
        "Attempted double use of PCI address {0} (may need multifunction='on' for device on function 0)"
    )]
    FunctionInUseNeedsMultifunction(PciAddress),
    #[error("PCI controller index {index} not found in the address set of {nbuses} buses")]
    ControllerIndexOutOfRange { index: usize, nbuses: usize },
    #[error("Cannot automatically add a new PCI bus for a device requiring a slot other than standard PCI")]
    GrowthRequiresPci,
    #[error("No more available PCI slots")]
    NoFreeSlots,
}

impl AddressError {
    /// One shared classification point: the same structural check is a
    /// configuration error when the address came from explicit user
    /// config, and an internal error when the allocator generated it.
    pub fn classify(self, from_config: bool) -> Error {
        if from_config {
            Error::Config(self)
        } else {
            Error::Internal(self)
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(AddressError),
    #[error("internal error: {0}")]
    Internal(AddressError),
}

impl Error {
    pub fn kind(&self) -> &AddressError {
        match self {
            Error::Config(e) | Error::Internal(e) => e,
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Admission test: can a device with `dev_flags` requirements be placed on
/// a bus offering `bus_flags`? When the address was manually specified in
/// config, a PCI device may connect to a PCIe slot (or vice versa), and an
/// explicit hotplug requirement overrides the bus default.
fn flags_compatible(
    addr: PciAddress,
    mut bus_flags: ConnectFlags,
    dev_flags: ConnectFlags,
    from_config: bool,
) -> result::Result<(), AddressError> {
    if from_config {
        if bus_flags.intersects(ConnectFlags::ENDPOINT) {
            bus_flags |= ConnectFlags::ENDPOINT;
        }
        if dev_flags.contains(ConnectFlags::HOTPLUGGABLE) {
            bus_flags |= ConnectFlags::HOTPLUGGABLE;
        }
    }

    if (dev_flags & bus_flags & ConnectFlags::TYPES_MASK).is_empty() {
        if dev_flags.contains(ConnectFlags::PCI_DEVICE) {
            return Err(AddressError::RequiresPciSlot(addr));
        } else if dev_flags.contains(ConnectFlags::PCIE_DEVICE) {
            return Err(AddressError::RequiresPcieSlot(addr));
        }
        // A device whose flags carry no connection type at all means the
        // flag computation for that device class is broken.
        return Err(AddressError::NoConnectTypes(addr));
    }
    if dev_flags.contains(ConnectFlags::HOTPLUGGABLE)
        && !bus_flags.contains(ConnectFlags::HOTPLUGGABLE)
    {
        return Err(AddressError::RequiresHotplug(addr));
    }
    Ok(())
}

/// The PCI address space of one machine: an ordered collection of buses
/// plus the resume cursor of the linear slot search.
///
/// `last_address`/`last_flags` record the previous successful allocation.
/// A search for the same flags resumes right after it, which is what gives
/// repeated allocations for one device class stable, densely packed,
/// increasing addresses across runs. A search for different flags restarts
/// from bus 0.
#[derive(Debug)]
pub struct PciAddressSet {
    buses: Vec<PciBus>,
    last_address: PciAddress,
    last_flags: ConnectFlags,
    dry_run: bool,
}

impl PciAddressSet {
    /// Create a set of `nbuses` buses. Bus 0 defaults to pci-root and the
    /// rest to pci-bridge; callers overwrite the models of buses that have
    /// an explicit controller in the configuration.
    pub fn new(nbuses: usize, dry_run: bool) -> Self {
        let mut buses = Vec::with_capacity(nbuses);
        if nbuses > 0 {
            buses.push(PciBus::new(PciControllerModel::PciRoot));
        }
        for _ in 1..nbuses {
            buses.push(PciBus::new(PciControllerModel::PciBridge));
        }
        PciAddressSet {
            buses,
            last_address: PciAddress::default(),
            last_flags: ConnectFlags::empty(),
            dry_run,
        }
    }

    pub fn nbuses(&self) -> usize {
        self.buses.len()
    }

    pub fn bus(&self, index: usize) -> Option<&PciBus> {
        self.buses.get(index)
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Replace the model (and therefore flags and slot bounds) of one bus.
    pub fn set_bus_model(&mut self, index: usize, model: PciControllerModel) -> Result<()> {
        let nbuses = self.buses.len();
        let bus = self
            .buses
            .get_mut(index)
            .ok_or(Error::Internal(AddressError::ControllerIndexOutOfRange {
                index,
                nbuses,
            }))?;
        *bus = PciBus::new(model);
        Ok(())
    }

    /// Check the address against the bus bounds and the connection-type
    /// compatibility rules. `from_config` selects the error category.
    pub fn validate(&self, addr: PciAddress, flags: ConnectFlags, from_config: bool) -> Result<()> {
        self.validate_inner(addr, flags, from_config)
            .map_err(|e| e.classify(from_config))
    }

    fn validate_inner(
        &self,
        addr: PciAddress,
        flags: ConnectFlags,
        from_config: bool,
    ) -> result::Result<(), AddressError> {
        if self.buses.is_empty() {
            return Err(AddressError::NoBuses);
        }
        if addr.domain != 0 {
            return Err(AddressError::InvalidDomain(addr));
        }
        let bus = self
            .buses
            .get(addr.bus as usize)
            .ok_or(AddressError::BusOutOfRange {
                addr,
                max: self.buses.len() - 1,
            })?;

        flags_compatible(addr, bus.flags(), flags, from_config)?;

        // Some "buses" are really just a single port.
        if bus.min_slot() > 0 && addr.slot < bus.min_slot() {
            return Err(AddressError::SlotBelowMinimum {
                addr,
                min: bus.min_slot(),
            });
        }
        if addr.slot > bus.max_slot() {
            return Err(AddressError::SlotAboveMaximum {
                addr,
                max: bus.max_slot(),
            });
        }
        if addr.function > PCI_FUNCTION_LAST {
            return Err(AddressError::FunctionOutOfRange(addr));
        }
        Ok(())
    }

    /// True when any function of the slot is reserved.
    pub fn slot_in_use(&self, addr: PciAddress) -> bool {
        self.buses
            .get(addr.bus as usize)
            .is_some_and(|bus| bus.functions(addr.slot) != 0)
    }

    /// Ensure `addr.bus` fits in the set by appending buses. Growth is only
    /// permitted for devices needing a plain hotpluggable PCI slot; every
    /// appended bus is a generic pci-bridge. Returns the number of buses
    /// added.
    pub fn grow(&mut self, addr: PciAddress, flags: ConnectFlags) -> Result<usize> {
        let needed = addr.bus as usize + 1;
        if needed <= self.buses.len() {
            return Ok(0);
        }
        if !flags.contains(ConnectFlags::PCI_DEVICE) {
            return Err(Error::Internal(AddressError::GrowthRequiresPci));
        }
        let add = needed - self.buses.len();
        for _ in 0..add {
            self.buses.push(PciBus::new(PciControllerModel::PciBridge));
        }
        debug!("grew PCI address set by {} bus(es) to {}", add, needed);
        Ok(add)
    }

    /// Reserve a whole slot or a single function for a device. In dry-run
    /// mode the bus count is grown first when the address lies beyond it.
    pub fn reserve(
        &mut self,
        addr: PciAddress,
        flags: ConnectFlags,
        whole_slot: bool,
        from_config: bool,
    ) -> Result<()> {
        if self.dry_run {
            self.grow(addr, flags)?;
        }
        self.validate(addr, flags, from_config)?;

        let mask = self.buses[addr.bus as usize].functions_mut(addr.slot);
        if whole_slot {
            if *mask != 0 {
                return Err(AddressError::SlotInUse(addr).classify(from_config));
            }
            *mask = SLOT_ALL_FUNCTIONS;
            debug!("reserving PCI slot {addr} (multifunction='off')");
        } else {
            if *mask & function_bit(addr.function) != 0 {
                let kind = if addr.function == 0 {
                    AddressError::FunctionInUse(addr)
                } else {
                    AddressError::FunctionInUseNeedsMultifunction(addr)
                };
                return Err(kind.classify(from_config));
            }
            *mask |= function_bit(addr.function);
            debug!("reserving PCI address {addr}");
        }
        Ok(())
    }

    /// Reserve all eight functions of the slot for an allocator-generated
    /// address.
    pub fn reserve_slot(&mut self, addr: PciAddress, flags: ConnectFlags) -> Result<()> {
        self.reserve(addr, flags, true, false)
    }

    /// Give back a single function. Function-granular release never fails;
    /// releasing an address that was never reserved is a no-op.
    pub fn release(&mut self, addr: PciAddress) {
        if let Some(bus) = self.buses.get_mut(addr.bus as usize) {
            *bus.functions_mut(addr.slot) &= !function_bit(addr.function);
        }
    }

    /// Give back an entire slot. Validation accepts any connection type
    /// since the address was known good when it was handed out.
    pub fn release_slot(&mut self, addr: PciAddress) -> Result<()> {
        self.validate(addr, ConnectFlags::TYPES_MASK, false)?;
        *self.buses[addr.bus as usize].functions_mut(addr.slot) = 0;
        Ok(())
    }

    /// Linear search for the next free slot acceptable to `flags`.
    ///
    /// If `flags` match the previous successful allocation the search
    /// resumes right after `last_address` (wrapping to the next bus's
    /// minimum slot); otherwise it restarts from bus 0. When the forward
    /// scan exhausts the buses: in dry-run mode one bus is appended and
    /// its first slot used; otherwise, for a resumed search, the buses
    /// below the resume point are re-scanned once (addresses there may
    /// have been freed by released devices) before giving up.
    pub fn next_free_slot(&mut self, flags: ConnectFlags) -> Result<PciAddress> {
        if self.buses.is_empty() {
            return Err(Error::Config(AddressError::NoBuses));
        }

        let mut bus: usize;
        let mut slot: u8;
        if flags == self.last_flags {
            bus = self.last_address.bus as usize;
            slot = self.last_address.slot + 1;
            if slot > self.buses[bus].max_slot() {
                bus += 1;
                if bus < self.buses.len() {
                    slot = self.buses[bus].min_slot();
                }
            }
        } else {
            bus = 0;
            slot = self.buses[0].min_slot();
        }

        while bus < self.buses.len() {
            if let Some(addr) = self.scan_bus(bus, slot, flags) {
                return Ok(addr);
            }
            bus += 1;
            if bus < self.buses.len() {
                slot = self.buses[bus].min_slot();
            }
        }

        // There were no free slots after the last used one.
        if self.dry_run {
            if bus <= u8::MAX as usize {
                let grow_addr = PciAddress::new(bus as u8, 0, 0);
                self.grow(grow_addr, flags)?;
                let slot = self.buses[bus].min_slot();
                let addr = PciAddress::new(bus as u8, slot, 0);
                debug!("found free PCI slot {addr} on grown bus");
                return Ok(addr);
            }
        } else if flags == self.last_flags {
            // Re-check the buses from 0 up to the last used one.
            for bus in 0..=self.last_address.bus as usize {
                let slot = self.buses[bus].min_slot();
                if let Some(addr) = self.scan_bus(bus, slot, flags) {
                    return Ok(addr);
                }
            }
        }

        Err(Error::Internal(AddressError::NoFreeSlots))
    }

    fn scan_bus(&self, bus: usize, start_slot: u8, flags: ConnectFlags) -> Option<PciAddress> {
        let probe = PciAddress::new(bus as u8, start_slot, 0);
        if flags_compatible(probe, self.buses[bus].flags(), flags, false).is_err() {
            debug!("PCI bus 0000:{:02x} is not compatible with the device", bus);
            return None;
        }
        let mut slot = start_slot;
        while slot <= self.buses[bus].max_slot() {
            let addr = PciAddress::new(bus as u8, slot, 0);
            if !self.slot_in_use(addr) {
                debug!("found free PCI slot {addr}");
                return Some(addr);
            }
            debug!("PCI slot {addr} already in use");
            slot += 1;
        }
        None
    }

    /// Search for the next free slot, reserve all of it, and move the
    /// resume cursor past it.
    pub fn reserve_next(&mut self, flags: ConnectFlags) -> Result<PciAddress> {
        let addr = self.next_free_slot(flags)?;
        self.reserve_slot(addr, flags)?;
        self.last_address = addr;
        self.last_flags = flags;
        Ok(addr)
    }

    /// Point the resume cursor at `addr` without reserving anything. Used
    /// when several functions of one slot are packed by hand and later
    /// same-flag searches should continue after that slot.
    pub fn set_last_address(&mut self, addr: PciAddress) {
        self.last_address = PciAddress::new(addr.bus, addr.slot, 0);
    }
}
