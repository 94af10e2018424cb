// Copyright © 2025 The VM Address Allocator Authors
//
// SPDX-License-Identifier: Apache-2.0

//! The machine configuration consumed by the address assignment passes.
//!
//! Every device carries a [`DeviceAddress`]; assignment fills the
//! `None`/unpinned ones in and validates the explicit ones. The passes may
//! also extend the configuration itself, e.g. by synthesizing bridge or
//! virtio-serial controllers when the existing ones run out of room.

use serde::{Deserialize, Serialize};

use pci::{PciAddress, PciControllerModel};
use vm_allocator::{CcwAddress, VirtioSerialAddress};

use crate::capabilities::Capabilities;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    #[default]
    X86_64,
    I686,
    Aarch64,
    Armv7l,
    Ppc64,
    S390x,
}

/// Where a device sits, on whichever bus type it ended up on.
///
/// `None` means the device still wants an address. For CCW and sPAPR-VIO
/// the inner `Option` distinguishes a pinned, user-supplied address from a
/// mere bus-type selection whose concrete address is still to be assigned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceAddress {
    #[default]
    None,
    Pci(PciAddress),
    Ccw(Option<CcwAddress>),
    VirtioSerial(VirtioSerialAddress),
    SpaprVio { reg: Option<u64> },
    VirtioMmio,
    VirtioS390,
}

impl DeviceAddress {
    /// True when no address (and no bus type) has been decided yet.
    pub fn wanted(&self) -> bool {
        matches!(self, DeviceAddress::None)
    }

    pub fn pci(&self) -> Option<PciAddress> {
        match self {
            DeviceAddress::Pci(addr) => Some(*addr),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            DeviceAddress::None => "none",
            DeviceAddress::Pci(_) => "pci",
            DeviceAddress::Ccw(_) => "ccw",
            DeviceAddress::VirtioSerial(_) => "virtio-serial",
            DeviceAddress::SpaprVio { .. } => "spapr-vio",
            DeviceAddress::VirtioMmio => "virtio-mmio",
            DeviceAddress::VirtioS390 => "virtio-s390",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControllerKind {
    Pci,
    Ide,
    Fdc,
    Scsi,
    Sata,
    Usb,
    Ccid,
    VirtioSerial,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UsbControllerModel {
    Piix3Uhci,
    Piix4Uhci,
    Ehci,
    Ich9Ehci1,
    Ich9Uhci1,
    Ich9Uhci2,
    Ich9Uhci3,
    Vt82c686bUhci,
    PciOhci,
    NecXhci,
    /// Explicitly no USB controller.
    None,
}

impl UsbControllerModel {
    /// The ICH9 EHCI controller and its three UHCI companions share one
    /// slot, one function each.
    pub fn is_ich9_companion(self) -> bool {
        matches!(
            self,
            UsbControllerModel::Ich9Ehci1
                | UsbControllerModel::Ich9Uhci1
                | UsbControllerModel::Ich9Uhci2
                | UsbControllerModel::Ich9Uhci3
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScsiControllerModel {
    Lsilogic,
    VirtioScsi,
    Ibmvscsi,
    Lsisas1068,
    Lsisas1078,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub kind: ControllerKind,
    pub index: u32,
    /// For `kind == Pci`: which bridge or root complex realizes the bus.
    pub pci_model: Option<PciControllerModel>,
    /// Device name handed to the hypervisor, filled in during option
    /// normalization when left unset.
    pub model_name: Option<String>,
    pub usb_model: Option<UsbControllerModel>,
    pub scsi_model: Option<ScsiControllerModel>,
    /// For virtio-serial: number of ports offered.
    pub ports: Option<u32>,
    /// pci-bridge option.
    pub chassis_nr: Option<u32>,
    /// pcie-root-port options.
    pub chassis: Option<u32>,
    pub port: Option<u32>,
    /// Expander bus option: the bus number range claimed downstream.
    pub bus_nr: Option<u32>,
    pub address: DeviceAddress,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            kind: ControllerKind::Usb,
            index: 0,
            pci_model: None,
            model_name: None,
            usb_model: None,
            scsi_model: None,
            ports: None,
            chassis_nr: None,
            chassis: None,
            port: None,
            bus_nr: None,
            address: DeviceAddress::None,
        }
    }
}

impl ControllerConfig {
    pub fn pci(index: u32, model: PciControllerModel) -> Self {
        ControllerConfig {
            kind: ControllerKind::Pci,
            index,
            pci_model: Some(model),
            ..Default::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiskBus {
    Virtio,
    Ide,
    Scsi,
    Sata,
    Floppy,
    Usb,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiskConfig {
    pub bus: DiskBus,
    #[serde(default)]
    pub address: DeviceAddress,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetConfig {
    /// Device model, e.g. "virtio", "e1000" or "spapr-vlan".
    pub model: Option<String>,
    /// Backed by a PCI hostdev; placed through the hostdev path instead.
    #[serde(default)]
    pub hostdev_backed: bool,
    #[serde(default)]
    pub address: DeviceAddress,
}

impl NetConfig {
    pub fn model_is(&self, name: &str) -> bool {
        self.model.as_deref() == Some(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SoundModel {
    Sb16,
    PcSpk,
    Es1370,
    Ac97,
    Ich6,
    Ich9,
    Usb,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SoundConfig {
    pub model: SoundModel,
    #[serde(default)]
    pub address: DeviceAddress,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VideoModel {
    Vga,
    Cirrus,
    Vmvga,
    Qxl,
    Virtio,
}

/// The first video device in the list is the primary one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VideoConfig {
    pub model: VideoModel,
    #[serde(default)]
    pub address: DeviceAddress,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostdevConfig {
    /// Only PCI passthrough devices take part in address assignment.
    pub pci: bool,
    #[serde(default)]
    pub address: DeviceAddress,
}

/// A virtio filesystem share.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FsConfig {
    #[serde(default)]
    pub address: DeviceAddress,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SerialTarget {
    Isa,
    Usb,
    Pci,
    SpaprVio,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SerialConfig {
    pub target: SerialTarget,
    #[serde(default)]
    pub address: DeviceAddress,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelTarget {
    VirtioSerial,
    Guestfwd,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub target: ChannelTarget,
    #[serde(default)]
    pub address: DeviceAddress,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsoleTarget {
    Serial,
    Virtio,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsoleConfig {
    pub target: ConsoleTarget,
    #[serde(default)]
    pub address: DeviceAddress,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputBus {
    Ps2,
    Usb,
    Virtio,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputConfig {
    pub bus: InputBus,
    #[serde(default)]
    pub address: DeviceAddress,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatchdogModel {
    I6300esb,
    Ib700,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchdogConfig {
    pub model: WatchdogModel,
    #[serde(default)]
    pub address: DeviceAddress,
}

/// A virtio RNG device.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RngConfig {
    #[serde(default)]
    pub address: DeviceAddress,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalloonModel {
    Virtio,
    None,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BalloonConfig {
    pub model: BalloonModel,
    #[serde(default)]
    pub address: DeviceAddress,
}

/// A shared-memory device (ivshmem).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ShmemConfig {
    #[serde(default)]
    pub address: DeviceAddress,
}

/// Machine NVRAM; a sPAPR-VIO device on pseries machines.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NvramConfig {
    #[serde(default)]
    pub address: DeviceAddress,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Machine type name, e.g. "pc-i440fx-2.5", "pc-q35-2.5" or "pseries".
    pub machine: String,
    pub arch: Arch,
    pub controllers: Vec<ControllerConfig>,
    pub disks: Vec<DiskConfig>,
    pub fss: Vec<FsConfig>,
    pub nets: Vec<NetConfig>,
    pub sounds: Vec<SoundConfig>,
    pub videos: Vec<VideoConfig>,
    pub hostdevs: Vec<HostdevConfig>,
    pub serials: Vec<SerialConfig>,
    pub channels: Vec<ChannelConfig>,
    pub consoles: Vec<ConsoleConfig>,
    pub inputs: Vec<InputConfig>,
    pub watchdogs: Vec<WatchdogConfig>,
    pub rngs: Vec<RngConfig>,
    pub shmems: Vec<ShmemConfig>,
    pub balloon: Option<BalloonConfig>,
    pub nvram: Option<NvramConfig>,
}

impl VmConfig {
    pub fn machine_is_i440fx(&self) -> bool {
        self.machine == "pc"
            || self.machine.starts_with("pc-0.")
            || self.machine.starts_with("pc-1.")
            || self.machine.starts_with("pc-i440")
            || self.machine.starts_with("rhel")
    }

    pub fn machine_is_q35(&self) -> bool {
        self.machine == "q35" || self.machine.starts_with("pc-q35")
    }

    pub fn machine_is_s390_ccw(&self) -> bool {
        self.machine.starts_with("s390-ccw")
    }

    pub fn machine_is_virt(&self) -> bool {
        self.machine == "virt" || self.machine.starts_with("virt-")
    }

    pub fn machine_is_pseries(&self) -> bool {
        self.machine.starts_with("pseries")
    }

    /// Whether the machine has a PCI bus at all. Non-ARM machines always
    /// do; on ARM only versatilepb and (given a generic PCIe host bridge)
    /// the virt machine expose one.
    pub fn supports_pci(&self, caps: &Capabilities) -> bool {
        if !matches!(self.arch, Arch::Armv7l | Arch::Aarch64) {
            return true;
        }
        if self.machine == "versatilepb" {
            return true;
        }
        self.machine_is_virt() && caps.object_gpex
    }

    pub fn pci_controllers(&self) -> impl Iterator<Item = &ControllerConfig> {
        self.controllers
            .iter()
            .filter(|c| c.kind == ControllerKind::Pci)
    }

    /// Add a PCI controller for `index` with the given model, unless one
    /// already exists. Returns whether a controller was added.
    pub fn maybe_add_pci_controller(&mut self, index: u32, model: PciControllerModel) -> bool {
        if self
            .pci_controllers()
            .any(|c| c.index == index)
        {
            return false;
        }
        self.controllers.push(ControllerConfig::pci(index, model));
        true
    }

    /// Add a virtio-serial controller at the lowest unused index and
    /// return that index.
    pub fn add_virtio_serial_controller(&mut self) -> u32 {
        let mut index = 0;
        while self
            .controllers
            .iter()
            .any(|c| c.kind == ControllerKind::VirtioSerial && c.index == index)
        {
            index += 1;
        }
        self.controllers.push(ControllerConfig {
            kind: ControllerKind::VirtioSerial,
            index,
            ..Default::default()
        });
        index
    }

    /// Add a SATA controller with index 0 unless one exists. Returns
    /// whether a controller was added.
    pub fn maybe_add_sata_controller(&mut self) -> bool {
        if self
            .controllers
            .iter()
            .any(|c| c.kind == ControllerKind::Sata)
        {
            return false;
        }
        self.controllers.push(ControllerConfig {
            kind: ControllerKind::Sata,
            index: 0,
            ..Default::default()
        });
        true
    }

    /// Pick a bus number for a new expander bus: two below the lowest one
    /// claimed so far (each expander needs its own number plus room for
    /// the bus behind it), starting just under the 0xff ceiling. Returns
    /// `None` when the space between the root bus and the lowest expander
    /// has run out.
    pub fn find_new_bus_nr(&self) -> Option<u32> {
        let lowest = self
            .pci_controllers()
            .filter_map(|c| c.bus_nr)
            .min()
            .unwrap_or(0x100);
        // Bus number 0 belongs to the root and an expander needs two
        // numbers, so anything below 3 leaves no room.
        if lowest <= 2 {
            return None;
        }
        Some(lowest - 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_machine(machine: &str) -> VmConfig {
        VmConfig {
            machine: machine.to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn machine_type_predicates() {
        assert!(config_with_machine("pc").machine_is_i440fx());
        assert!(config_with_machine("pc-i440fx-2.5").machine_is_i440fx());
        assert!(config_with_machine("pc-1.0").machine_is_i440fx());
        assert!(!config_with_machine("pc-q35-2.5").machine_is_i440fx());

        assert!(config_with_machine("q35").machine_is_q35());
        assert!(config_with_machine("pc-q35-2.5").machine_is_q35());

        assert!(config_with_machine("s390-ccw-virtio").machine_is_s390_ccw());
        assert!(config_with_machine("pseries-2.5").machine_is_pseries());
        assert!(config_with_machine("virt-2.5").machine_is_virt());
    }

    #[test]
    fn pci_support_depends_on_arch_and_machine() {
        let caps = Capabilities::default();

        let config = config_with_machine("pc");
        assert!(config.supports_pci(&caps));

        let mut config = config_with_machine("virt");
        config.arch = Arch::Aarch64;
        assert!(!config.supports_pci(&caps));
        let caps = Capabilities {
            object_gpex: true,
            ..Default::default()
        };
        assert!(config.supports_pci(&caps));

        let mut config = config_with_machine("versatilepb");
        config.arch = Arch::Armv7l;
        assert!(config.supports_pci(&Capabilities::default()));
    }

    #[test]
    fn virtio_serial_controller_gets_lowest_free_index() {
        let mut config = VmConfig::default();
        config.controllers.push(ControllerConfig {
            kind: ControllerKind::VirtioSerial,
            index: 0,
            ..Default::default()
        });
        config.controllers.push(ControllerConfig {
            kind: ControllerKind::VirtioSerial,
            index: 2,
            ..Default::default()
        });
        assert_eq!(config.add_virtio_serial_controller(), 1);
        assert_eq!(config.add_virtio_serial_controller(), 3);
    }

    #[test]
    fn new_bus_numbers_descend_from_the_ceiling() {
        let mut config = VmConfig::default();
        assert_eq!(config.find_new_bus_nr(), Some(0xfe));

        let mut pxb = ControllerConfig::pci(1, pci::PciControllerModel::PciExpanderBus);
        pxb.bus_nr = Some(0xfe);
        config.controllers.push(pxb);
        assert_eq!(config.find_new_bus_nr(), Some(0xfc));

        // A lowest of 3 still leaves room for exactly one more expander.
        let mut pxb = ControllerConfig::pci(2, pci::PciControllerModel::PciExpanderBus);
        pxb.bus_nr = Some(3);
        config.controllers.push(pxb);
        assert_eq!(config.find_new_bus_nr(), Some(1));

        let mut pxb = ControllerConfig::pci(3, pci::PciControllerModel::PciExpanderBus);
        pxb.bus_nr = Some(1);
        config.controllers.push(pxb);
        assert_eq!(config.find_new_bus_nr(), None);
    }
}
