// Copyright © 2025 The VM Address Allocator Authors
//
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Capabilities of the hypervisor binary that drive address assignment
/// decisions. Probed once per binary and handed in alongside the machine
/// configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// The binary can create pci-bridge devices, making buses past 0
    /// usable.
    pub device_pci_bridge: bool,
    /// Primary video devices may live at an arbitrary PCI address rather
    /// than the legacy chipset slot.
    pub device_video_primary: bool,
    /// Transitional virtio devices over MMIO (ARM virt machines).
    pub virtio_mmio: bool,
    /// Generic PCIe host bridge, giving ARM virt machines a PCI bus.
    pub object_gpex: bool,
    /// virtio over the s390 channel subsystem.
    pub virtio_ccw: bool,
    /// Legacy virtio-s390 bus.
    pub virtio_s390: bool,
    /// lsilogic SCSI controller.
    pub scsi_lsi: bool,
    /// virtio-scsi controller.
    pub virtio_scsi: bool,
    /// mptsas1068 SCSI controller.
    pub scsi_mptsas1068: bool,
    /// megasas SCSI controller.
    pub scsi_megasas: bool,
}
