// Copyright © 2025 The VM Address Allocator Authors
//
// SPDX-License-Identifier: Apache-2.0

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::address::{PCI_FUNCTION_LAST, PCI_SLOT_LAST};

bitflags! {
    /// Connection types, describing both what a bus offers downstream and
    /// what a device requires upstream.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ConnectFlags: u32 {
        const PCI_DEVICE = 1 << 0;
        const PCIE_DEVICE = 1 << 1;
        const PCIE_ROOT_PORT = 1 << 2;
        const PCIE_SWITCH_UPSTREAM_PORT = 1 << 3;
        const PCIE_SWITCH_DOWNSTREAM_PORT = 1 << 4;
        const HOTPLUGGABLE = 1 << 5;

        /// All bits that describe the type of connection (excluding
        /// hotplug capability).
        const TYPES_MASK = Self::PCI_DEVICE.bits()
            | Self::PCIE_DEVICE.bits()
            | Self::PCIE_ROOT_PORT.bits()
            | Self::PCIE_SWITCH_UPSTREAM_PORT.bits()
            | Self::PCIE_SWITCH_DOWNSTREAM_PORT.bits();

        /// Bits usable by a normal endpoint device.
        const ENDPOINT = Self::PCI_DEVICE.bits() | Self::PCIE_DEVICE.bits();
    }
}

/// The kind of bridge or root complex realizing a PCI bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PciControllerModel {
    PciRoot,
    PcieRoot,
    PciBridge,
    DmiToPciBridge,
    PciExpanderBus,
    PcieExpanderBus,
    PcieRootPort,
    PcieSwitchUpstreamPort,
    PcieSwitchDownstreamPort,
}

impl PciControllerModel {
    /// Flags needed for the upstream connection of a controller of this
    /// model, i.e. what kind of slot the controller itself plugs into.
    /// Roots are implicit in the machine and have no upstream, so they map
    /// to the empty set.
    pub fn connect_type(self) -> ConnectFlags {
        match self {
            PciControllerModel::PciRoot | PciControllerModel::PcieRoot => ConnectFlags::empty(),
            // A bridge or expander bus plugs into any standard PCI slot.
            PciControllerModel::PciBridge | PciControllerModel::PciExpanderBus => {
                ConnectFlags::PCI_DEVICE
            }
            // The pluggable part of a pcie-expander-bus is a companion
            // device that behaves like a PCIe endpoint, same as the
            // dmi-to-pci bridge.
            PciControllerModel::DmiToPciBridge | PciControllerModel::PcieExpanderBus => {
                ConnectFlags::PCIE_DEVICE
            }
            PciControllerModel::PcieRootPort => ConnectFlags::PCIE_ROOT_PORT,
            PciControllerModel::PcieSwitchUpstreamPort => ConnectFlags::PCIE_SWITCH_UPSTREAM_PORT,
            PciControllerModel::PcieSwitchDownstreamPort => {
                ConnectFlags::PCIE_SWITCH_DOWNSTREAM_PORT
            }
        }
    }
}

/// One PCI bus segment: what can be connected downstream from it, the
/// valid slot range and the per-slot function occupancy.
#[derive(Clone, Debug)]
pub struct PciBus {
    model: PciControllerModel,
    flags: ConnectFlags,
    min_slot: u8,
    max_slot: u8,
    // One entry per slot; a bit per function, 0xff when the entire slot
    // has been reserved.
    slots: [u8; PCI_SLOT_LAST as usize + 1],
}

impl PciBus {
    /// Build a bus with the downstream capabilities implied by `model`.
    pub fn new(model: PciControllerModel) -> Self {
        let (flags, min_slot, max_slot) = match model {
            // Slots 1-31, standard hotpluggable PCI slots.
            PciControllerModel::PciRoot | PciControllerModel::PciBridge => (
                ConnectFlags::HOTPLUGGABLE | ConnectFlags::PCI_DEVICE,
                1,
                PCI_SLOT_LAST,
            ),
            PciControllerModel::PciExpanderBus => (
                ConnectFlags::HOTPLUGGABLE | ConnectFlags::PCI_DEVICE,
                0,
                PCI_SLOT_LAST,
            ),
            // Slots 1-31, no hotplug, PCIe endpoint or pcie-root-port
            // only, unless the address came from explicit config and the
            // device allows it.
            PciControllerModel::PcieRoot => (
                ConnectFlags::PCIE_DEVICE | ConnectFlags::PCIE_ROOT_PORT,
                1,
                PCI_SLOT_LAST,
            ),
            // Slots 0-31, standard PCI slots, not hotpluggable.
            PciControllerModel::DmiToPciBridge => (ConnectFlags::PCI_DEVICE, 0, PCI_SLOT_LAST),
            // A single hotpluggable PCIe slot, usable by endpoint devices
            // and switch upstream ports.
            PciControllerModel::PcieRootPort | PciControllerModel::PcieSwitchDownstreamPort => (
                ConnectFlags::PCIE_DEVICE
                    | ConnectFlags::PCIE_SWITCH_UPSTREAM_PORT
                    | ConnectFlags::HOTPLUGGABLE,
                0,
                0,
            ),
            // 32 slots, only accepts switch downstream ports, no hotplug.
            PciControllerModel::PcieSwitchUpstreamPort => {
                (ConnectFlags::PCIE_SWITCH_DOWNSTREAM_PORT, 0, PCI_SLOT_LAST)
            }
            // Single slot, only accepts a root port or a switch upstream
            // port.
            PciControllerModel::PcieExpanderBus => (
                ConnectFlags::PCIE_ROOT_PORT | ConnectFlags::PCIE_SWITCH_UPSTREAM_PORT,
                0,
                0,
            ),
        };

        PciBus {
            model,
            flags,
            min_slot,
            max_slot,
            slots: [0; PCI_SLOT_LAST as usize + 1],
        }
    }

    pub fn model(&self) -> PciControllerModel {
        self.model
    }

    pub fn flags(&self) -> ConnectFlags {
        self.flags
    }

    pub fn min_slot(&self) -> u8 {
        self.min_slot
    }

    pub fn max_slot(&self) -> u8 {
        self.max_slot
    }

    pub(crate) fn functions(&self, slot: u8) -> u8 {
        self.slots[slot as usize]
    }

    pub(crate) fn functions_mut(&mut self, slot: u8) -> &mut u8 {
        &mut self.slots[slot as usize]
    }

    /// True when every slot within the bus bounds has at least one
    /// function reserved.
    pub fn fully_reserved(&self) -> bool {
        (self.min_slot..=self.max_slot).all(|slot| self.slots[slot as usize] != 0)
    }
}

pub(crate) const SLOT_ALL_FUNCTIONS: u8 = 0xff;

pub(crate) fn function_bit(function: u8) -> u8 {
    debug_assert!(function <= PCI_FUNCTION_LAST);
    1 << function
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_table() {
        let bus = PciBus::new(PciControllerModel::PciRoot);
        assert_eq!(
            bus.flags(),
            ConnectFlags::HOTPLUGGABLE | ConnectFlags::PCI_DEVICE
        );
        assert_eq!(bus.min_slot(), 1);
        assert_eq!(bus.max_slot(), 31);

        let bus = PciBus::new(PciControllerModel::PcieRoot);
        assert_eq!(
            bus.flags(),
            ConnectFlags::PCIE_DEVICE | ConnectFlags::PCIE_ROOT_PORT
        );
        assert!(!bus.flags().contains(ConnectFlags::HOTPLUGGABLE));

        let bus = PciBus::new(PciControllerModel::PcieRootPort);
        assert_eq!(bus.min_slot(), 0);
        assert_eq!(bus.max_slot(), 0);
        assert!(bus.flags().contains(ConnectFlags::HOTPLUGGABLE));

        let bus = PciBus::new(PciControllerModel::PcieSwitchUpstreamPort);
        assert_eq!(bus.flags(), ConnectFlags::PCIE_SWITCH_DOWNSTREAM_PORT);
        assert_eq!(bus.max_slot(), 31);
    }

    #[test]
    fn connect_type_mapping() {
        assert_eq!(
            PciControllerModel::PciRoot.connect_type(),
            ConnectFlags::empty()
        );
        assert_eq!(
            PciControllerModel::PcieRoot.connect_type(),
            ConnectFlags::empty()
        );
        assert_eq!(
            PciControllerModel::PciBridge.connect_type(),
            ConnectFlags::PCI_DEVICE
        );
        assert_eq!(
            PciControllerModel::DmiToPciBridge.connect_type(),
            ConnectFlags::PCIE_DEVICE
        );
        assert_eq!(
            PciControllerModel::PcieRootPort.connect_type(),
            ConnectFlags::PCIE_ROOT_PORT
        );
    }

    #[test]
    fn fully_reserved() {
        let mut bus = PciBus::new(PciControllerModel::PcieRootPort);
        assert!(!bus.fully_reserved());
        *bus.functions_mut(0) = SLOT_ALL_FUNCTIONS;
        assert!(bus.fully_reserved());
    }
}
