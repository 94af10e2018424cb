// Copyright © 2025 The VM Address Allocator Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Device address assignment for a virtual machine configuration.
//!
//! [`DeviceManager::assign_addresses`] walks a [`vm_config::VmConfig`] and
//! gives every device a stable bus address: PCI slots and functions,
//! virtio-serial ports, s390 CCW device numbers or sPAPR-VIO registers,
//! depending on the machine type and the hypervisor capabilities. The
//! occupancy sets are kept afterwards so devices can be hotplugged and
//! released against the same state.

use thiserror::Error;

use pci::PciAddress;
use vm_allocator::{CcwError, SpaprVioError, VirtioSerialError};

pub mod capabilities;
mod chipset;
pub mod device_manager;
pub mod vm_config;

pub use crate::capabilities::Capabilities;
pub use crate::device_manager::DeviceManager;

use crate::vm_config::ScsiControllerModel;

#[derive(Error, Debug)]
pub enum Error {
    #[error("PCI address error")]
    PciAddress(#[from] pci::Error),
    #[error("CCW address error")]
    Ccw(#[from] CcwError),
    #[error("virtio serial address error")]
    VirtioSerial(#[from] VirtioSerialError),
    #[error("sPAPR-VIO address error")]
    SpaprVio(#[from] SpaprVioError),
    #[error("Primary IDE controller must have PCI address 0:0:1.1, not {0}")]
    PrimaryIdeAddress(PciAddress),
    #[error("PIIX3 USB controller must have PCI address 0:0:1.2, not {0}")]
    Piix3UsbAddress(PciAddress),
    #[error("Primary SATA controller must have PCI address 0:0:1f.2, not {0}")]
    PrimarySataAddress(PciAddress),
    #[error("this hypervisor only supports the primary video device at its default PCI address, not {0}")]
    PrimaryVideoAddress(PciAddress),
    #[error("PCI address {0} is in use but the hypervisor needs it for the primary video device")]
    PrimaryVideoAddressInUse(PciAddress),
    #[error("Bus 0 must be PCI for integrated PIIX3 USB or IDE controllers")]
    IntegratedControllerBus,
    #[error("PCI bridges are not supported by this hypervisor binary")]
    PciBridgeUnsupported,
    #[error("PCI controller at index {index} has its own bus number {bus}; the index must be larger than the bus it connects to")]
    BridgeIndexBelowBus { index: u32, bus: u8 },
    #[error("No free bus number available for a new PCI expander bus")]
    NoFreeBusNr,
    #[error("a virtio disk cannot have an address of type '{0}'")]
    VirtioDiskAddressType(&'static str),
    #[error("non-primary video devices must be of type qxl")]
    SecondaryVideoModel,
    #[error("the SCSI controller model {0:?} is not supported by this hypervisor binary")]
    UnsupportedScsiModel(ScsiControllerModel),
    #[error("Unable to determine a model for the SCSI controller")]
    ScsiModelUndeterminable,
}

impl Error {
    /// True when the error is the user's fault (an invalid or conflicting
    /// configuration) rather than an allocator malfunction.
    pub fn is_config(&self) -> bool {
        match self {
            Error::PciAddress(e) => e.is_config(),
            Error::Ccw(e) => matches!(e, CcwError::AddressInUse(_)),
            Error::VirtioSerial(e) => !matches!(e, VirtioSerialError::DuplicateController(_)),
            Error::SpaprVio(e) => matches!(e, SpaprVioError::RegInUse(_)),
            Error::ScsiModelUndeterminable => false,
            _ => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
