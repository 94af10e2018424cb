// Copyright © 2025 The VM Address Allocator Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Chipset-specific slot conventions.
//!
//! The PIIX3 (i440FX) and ICH9 (Q35) southbridges hardwire some functions
//! at well-known addresses. These passes pin the corresponding controllers
//! there, or validate user-supplied addresses against the convention,
//! before the generic placement loop runs.

use pci::{ConnectFlags, PciAddress, PciAddressSet, PciControllerModel};

use crate::capabilities::Capabilities;
use crate::vm_config::{
    ControllerKind, DeviceAddress, UsbControllerModel, VmConfig,
};
use crate::{Error, Result};

fn at(addr: PciAddress, bus: u8, slot: u8, function: u8) -> bool {
    addr.domain == 0 && addr.bus == bus && addr.slot == slot && addr.function == function
}

/// Apply the slot conventions of whichever chipset the machine type
/// implies. Machines without chipset conventions pass through untouched.
pub(crate) fn validate_slots(
    config: &mut VmConfig,
    caps: &Capabilities,
    addrs: &mut PciAddressSet,
) -> Result<()> {
    if config.machine_is_i440fx() {
        validate_piix3_slots(config, caps, addrs)
    } else if config.machine_is_q35() {
        validate_q35_slots(config, caps, addrs)
    } else {
        Ok(())
    }
}

/// PIIX3 conventions: the southbridge occupies slot 1 (ISA bridge at 1.0,
/// IDE at 1.1, USB at 1.2) and the primary VGA sits at slot 2.
fn validate_piix3_slots(
    config: &mut VmConfig,
    caps: &Capabilities,
    addrs: &mut PciAddressSet,
) -> Result<()> {
    let flags = ConnectFlags::HOTPLUGGABLE | ConnectFlags::PCI_DEVICE;

    for cont in &mut config.controllers {
        match cont.kind {
            ControllerKind::Ide if cont.index == 0 => match cont.address {
                DeviceAddress::Pci(addr) => {
                    if !at(addr, 0, 1, 1) {
                        return Err(Error::PrimaryIdeAddress(addr));
                    }
                }
                DeviceAddress::None => {
                    cont.address = DeviceAddress::Pci(PciAddress::new(0, 1, 1));
                }
                _ => {}
            },
            ControllerKind::Usb
                if cont.index == 0
                    && matches!(cont.usb_model, None | Some(UsbControllerModel::Piix3Uhci)) =>
            {
                match cont.address {
                    DeviceAddress::Pci(addr) => {
                        if !at(addr, 0, 1, 2) {
                            return Err(Error::Piix3UsbAddress(addr));
                        }
                    }
                    DeviceAddress::None => {
                        cont.address = DeviceAddress::Pci(PciAddress::new(0, 1, 2));
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    // The whole southbridge slot, integrated functions included.
    addrs.reserve_slot(PciAddress::new(0, 1, 0), flags)?;

    if let Some(video) = config.videos.first_mut() {
        if video.address.wanted() {
            let addr = PciAddress::new(0, 2, 0);
            if caps.device_video_primary {
                if addrs.slot_in_use(addr) {
                    // The legacy slot is taken; place the video on the
                    // next free slot right now, ahead of every other
                    // auto-assigned device.
                    let next = addrs.reserve_next(flags)?;
                    if !addrs.is_dry_run() {
                        video.address = DeviceAddress::Pci(next);
                    }
                } else {
                    addrs.reserve_slot(addr, flags)?;
                    video.address = DeviceAddress::Pci(addr);
                }
            } else {
                if addrs.slot_in_use(addr) {
                    return Err(Error::PrimaryVideoAddressInUse(addr));
                }
                addrs.reserve_slot(addr, flags)?;
                video.address = DeviceAddress::Pci(addr);
            }
        } else if !caps.device_video_primary {
            if let Some(addr) = video.address.pci() {
                if !at(addr, 0, 2, 0) {
                    return Err(Error::PrimaryVideoAddress(addr));
                }
            }
        }
    } else if !caps.device_video_primary {
        // No video now; keep the slot open for one hotplugged later. It
        // not being free is not a problem.
        let _ = addrs.reserve_slot(PciAddress::new(0, 2, 0), flags);
    }

    Ok(())
}

/// ICH9 (Q35) conventions: SATA at 1f.2, ISA bridge at 1f.0 and SMBus at
/// 1f.3, USB2 controllers at slots 1d/1a, the dmi-to-pci-bridge at slot
/// 1e and the primary VGA at slot 1.
fn validate_q35_slots(
    config: &mut VmConfig,
    caps: &Capabilities,
    addrs: &mut PciAddressSet,
) -> Result<()> {
    let flags = ConnectFlags::PCIE_DEVICE;

    // The machine always has the integrated AHCI; give it a controller so
    // SATA disks have a bus to land on.
    config.maybe_add_sata_controller();

    for cont in &mut config.controllers {
        match cont.kind {
            ControllerKind::Sata if cont.index == 0 => match cont.address {
                DeviceAddress::Pci(addr) => {
                    if !at(addr, 0, 0x1f, 2) {
                        return Err(Error::PrimarySataAddress(addr));
                    }
                }
                DeviceAddress::None => {
                    let addr = PciAddress::new(0, 0x1f, 2);
                    addrs.reserve(addr, ConnectFlags::ENDPOINT, false, false)?;
                    cont.address = DeviceAddress::Pci(addr);
                }
                _ => {}
            },
            ControllerKind::Usb
                if cont.usb_model == Some(UsbControllerModel::Ich9Uhci1)
                    && cont.address.wanted() =>
            {
                // Try the standard ICH9 USB2 slots; fall back to generic
                // placement if both are taken.
                let mut addr = PciAddress::new(0, 0x1d, 0);
                if addrs.slot_in_use(addr) {
                    addr.slot = 0x1a;
                }
                if !addrs.slot_in_use(addr) {
                    addr.multifunction = Some(true);
                    addrs.reserve(addr, flags, false, true)?;
                    cont.address = DeviceAddress::Pci(addr);
                }
            }
            ControllerKind::Pci
                if cont.pci_model == Some(PciControllerModel::DmiToPciBridge)
                    && cont.address.wanted() =>
            {
                let addr = PciAddress::new(0, 0x1e, 0);
                if !addrs.slot_in_use(addr) {
                    addrs.reserve_slot(addr, flags)?;
                    cont.address = DeviceAddress::Pci(addr);
                }
            }
            _ => {}
        }
    }

    // Integrated ISA bridge and SMBus functions.
    let mut isa = PciAddress::new(0, 0x1f, 0);
    isa.multifunction = Some(true);
    addrs.reserve(isa, flags, false, false)?;
    addrs.reserve(PciAddress::new(0, 0x1f, 3), flags, false, false)?;

    if let Some(video) = config.videos.first_mut() {
        if video.address.wanted() {
            let addr = PciAddress::new(0, 1, 0);
            if caps.device_video_primary {
                if addrs.slot_in_use(addr) {
                    let next = addrs.reserve_next(ConnectFlags::ENDPOINT)?;
                    if !addrs.is_dry_run() {
                        video.address = DeviceAddress::Pci(next);
                    }
                } else {
                    addrs.reserve_slot(addr, ConnectFlags::ENDPOINT)?;
                    video.address = DeviceAddress::Pci(addr);
                }
            } else {
                if addrs.slot_in_use(addr) {
                    return Err(Error::PrimaryVideoAddressInUse(addr));
                }
                addrs.reserve_slot(addr, ConnectFlags::ENDPOINT)?;
                video.address = DeviceAddress::Pci(addr);
            }
        } else if !caps.device_video_primary {
            if let Some(addr) = video.address.pci() {
                if !at(addr, 0, 1, 0) {
                    return Err(Error::PrimaryVideoAddress(addr));
                }
            }
        }
    } else if !caps.device_video_primary {
        let _ = addrs.reserve_slot(PciAddress::new(0, 1, 0), ConnectFlags::ENDPOINT);
    }

    Ok(())
}
