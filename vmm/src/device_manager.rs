// Copyright © 2025 The VM Address Allocator Authors
//
// SPDX-License-Identifier: Apache-2.0

//! The device placement sequencer.
//!
//! Assignment runs once over a complete configuration, in a fixed order
//! so that the resulting addresses are reproducible: virtio-serial ports,
//! SCSI model defaulting, sPAPR-VIO registers, s390 CCW device numbers,
//! ARM virtio-mmio priming and finally PCI. PCI itself runs twice: a
//! dry-run pass that discovers how many buses the configuration needs
//! (growing the set and synthesizing bridge controllers on demand), then
//! the real pass against the final bus count.

use log::warn;

use pci::{ConnectFlags, PciAddress, PciAddressSet, PciControllerModel};
use vm_allocator::{
    CcwAddressSet, SpaprVioAddressSet, VirtioSerialAddressSet, VirtioSerialError,
    VIO_ADDR_NET, VIO_ADDR_NVRAM, VIO_ADDR_SCSI, VIO_ADDR_SERIAL,
    VIRTIO_SERIAL_DEFAULT_PORTS,
};

use crate::capabilities::Capabilities;
use crate::chipset;
use crate::vm_config::{
    Arch, BalloonModel, ChannelTarget, ConsoleTarget, ControllerConfig, ControllerKind,
    DeviceAddress, DiskBus, InputBus, ScsiControllerModel, SerialTarget, SoundModel,
    UsbControllerModel, VideoModel, VmConfig, WatchdogModel,
};
use crate::{Error, Result};

/// Owns the machine configuration plus the occupancy state of every
/// address space the machine has.
pub struct DeviceManager {
    config: VmConfig,
    caps: Capabilities,
    pci_addrs: Option<PciAddressSet>,
    ccw_addrs: Option<CcwAddressSet>,
    virtio_serial_addrs: Option<VirtioSerialAddressSet>,
}

fn default_flags() -> ConnectFlags {
    ConnectFlags::HOTPLUGGABLE | ConnectFlags::PCI_DEVICE
}

/// What kind of slot a controller with an explicit PCI address needs.
fn controller_connect_flags(cont: &ControllerConfig) -> ConnectFlags {
    match cont.kind {
        ControllerKind::Pci => cont
            .pci_model
            .map(|m| m.connect_type())
            .unwrap_or_else(default_flags),
        ControllerKind::Sata => ConnectFlags::ENDPOINT,
        ControllerKind::Usb => match cont.usb_model {
            Some(UsbControllerModel::Ehci)
            | Some(UsbControllerModel::Ich9Ehci1)
            | Some(UsbControllerModel::Ich9Uhci1)
            | Some(UsbControllerModel::Ich9Uhci2)
            | Some(UsbControllerModel::Ich9Uhci3)
            | Some(UsbControllerModel::Vt82c686bUhci) => ConnectFlags::PCI_DEVICE,
            Some(UsbControllerModel::NecXhci) => ConnectFlags::ENDPOINT,
            _ => default_flags(),
        },
        _ => default_flags(),
    }
}

fn sound_connect_flags(model: SoundModel) -> ConnectFlags {
    match model {
        SoundModel::Ich6 | SoundModel::Ich9 => ConnectFlags::PCI_DEVICE,
        _ => default_flags(),
    }
}

/// Reserve an address found in the configuration. Function 0 without an
/// explicit multifunction request claims the whole slot.
fn reserve_collected(set: &mut PciAddressSet, addr: PciAddress, flags: ConnectFlags) -> Result<()> {
    let entire_slot = addr.function == 0 && addr.multifunction != Some(true);
    set.reserve(addr, flags, entire_slot, true)?;
    Ok(())
}

/// Allocate the next free slot and, outside dry runs, store it on the
/// device.
fn assign_next(
    addrs: &mut PciAddressSet,
    address: &mut DeviceAddress,
    flags: ConnectFlags,
) -> Result<()> {
    let addr = addrs.reserve_next(flags)?;
    if !addrs.is_dry_run() {
        *address = DeviceAddress::Pci(addr);
    }
    Ok(())
}

fn ich9_companion_function(model: UsbControllerModel) -> u8 {
    match model {
        UsbControllerModel::Ich9Ehci1 => 7,
        UsbControllerModel::Ich9Uhci1 => 0,
        UsbControllerModel::Ich9Uhci2 => 1,
        _ => 2,
    }
}

impl DeviceManager {
    pub fn new(config: VmConfig, caps: Capabilities) -> Self {
        DeviceManager {
            config,
            caps,
            pci_addrs: None,
            ccw_addrs: None,
            virtio_serial_addrs: None,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn pci_addresses(&self) -> Option<&PciAddressSet> {
        self.pci_addrs.as_ref()
    }

    /// Assign an address to every device that wants one, in a fixed
    /// order across all address spaces.
    pub fn assign_addresses(&mut self) -> Result<()> {
        self.assign_virtio_serial_addresses()?;
        self.set_scsi_controller_models()?;
        self.assign_spapr_vio_addresses()?;
        self.assign_s390_addresses()?;
        self.assign_arm_virtio_mmio_addresses();
        self.add_implicit_pci_controllers();
        self.assign_pci_addresses()?;
        Ok(())
    }

    /// Give a device's address back to whichever space it came from.
    /// Release failures are logged and swallowed; by this point the device
    /// is going away regardless.
    pub fn release_device_address(&mut self, address: &DeviceAddress) {
        match *address {
            DeviceAddress::Ccw(Some(addr))
                if self.config.machine_is_s390_ccw() && self.caps.virtio_ccw =>
            {
                if let Some(set) = &mut self.ccw_addrs {
                    set.release(addr);
                }
            }
            DeviceAddress::Pci(addr) => {
                if let Some(set) = &mut self.pci_addrs {
                    if let Err(e) = set.release_slot(addr) {
                        warn!("unable to release PCI address {addr}: {e}");
                    }
                }
            }
            DeviceAddress::VirtioSerial(addr) => {
                if let Some(set) = &mut self.virtio_serial_addrs {
                    set.release(addr);
                }
            }
            _ => {}
        }
    }

    // ---- virtio-serial -------------------------------------------------

    fn assign_virtio_serial_addresses(&mut self) -> Result<()> {
        let mut set = VirtioSerialAddressSet::new();
        for cont in &self.config.controllers {
            if cont.kind == ControllerKind::VirtioSerial {
                set.add_controller(cont.index, cont.ports.unwrap_or(VIRTIO_SERIAL_DEFAULT_PORTS))?;
            }
        }

        // Explicit ports first so auto-assignment steers around them. A
        // port of 0 only selects the controller, not a concrete port.
        for channel in &self.config.channels {
            if let DeviceAddress::VirtioSerial(addr) = channel.address {
                if addr.port != 0 {
                    set.reserve(addr)?;
                }
            }
        }
        for console in &self.config.consoles {
            if console.target != ConsoleTarget::Virtio {
                continue;
            }
            if let DeviceAddress::VirtioSerial(addr) = console.address {
                if addr.port != 0 {
                    set.reserve(addr)?;
                }
            }
        }

        // Consoles go first and may take port 0; they keep their implicit
        // address, the port is only marked occupied so no channel grabs it.
        for i in 0..self.config.consoles.len() {
            if self.config.consoles[i].target != ConsoleTarget::Virtio {
                continue;
            }
            match self.config.consoles[i].address {
                DeviceAddress::None => {
                    Self::reserve_next_port(&mut self.config, &mut set, true)?;
                }
                DeviceAddress::VirtioSerial(partial) if partial.port == 0 => {
                    set.reserve_next_on_controller(partial.controller)?;
                }
                _ => {}
            }
        }

        for i in 0..self.config.channels.len() {
            if self.config.channels[i].target != ChannelTarget::VirtioSerial {
                continue;
            }
            match self.config.channels[i].address {
                DeviceAddress::None => {
                    let addr = Self::reserve_next_port(&mut self.config, &mut set, false)?;
                    self.config.channels[i].address = DeviceAddress::VirtioSerial(addr);
                }
                DeviceAddress::VirtioSerial(partial) if partial.port == 0 => {
                    let addr = set.reserve_next_on_controller(partial.controller)?;
                    self.config.channels[i].address = DeviceAddress::VirtioSerial(addr);
                }
                _ => {}
            }
        }

        self.virtio_serial_addrs = Some(set);
        Ok(())
    }

    /// Find a free port anywhere; when all controllers are full, extend
    /// the configuration with another virtio-serial controller.
    fn reserve_next_port(
        config: &mut VmConfig,
        set: &mut VirtioSerialAddressSet,
        allow_zero: bool,
    ) -> Result<vm_allocator::VirtioSerialAddress> {
        match set.reserve_next(allow_zero) {
            Ok(addr) => Ok(addr),
            Err(VirtioSerialError::NoFreePort) => {
                let index = config.add_virtio_serial_controller();
                set.add_controller(index, VIRTIO_SERIAL_DEFAULT_PORTS)?;
                Ok(set.reserve_next(allow_zero)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    // ---- SCSI model defaulting -----------------------------------------

    fn set_scsi_controller_models(&mut self) -> Result<()> {
        let vio_default =
            self.config.machine_is_pseries() && self.config.arch == Arch::Ppc64;
        let caps = self.caps;
        for cont in &mut self.config.controllers {
            if cont.kind != ControllerKind::Scsi {
                continue;
            }
            if let Some(model) = cont.scsi_model {
                let supported = match model {
                    ScsiControllerModel::Lsilogic => caps.scsi_lsi,
                    ScsiControllerModel::VirtioScsi => caps.virtio_scsi,
                    ScsiControllerModel::Lsisas1068 => caps.scsi_mptsas1068,
                    ScsiControllerModel::Lsisas1078 => caps.scsi_megasas,
                    ScsiControllerModel::Ibmvscsi => true,
                };
                if !supported {
                    return Err(Error::UnsupportedScsiModel(model));
                }
            } else if vio_default {
                cont.scsi_model = Some(ScsiControllerModel::Ibmvscsi);
            } else if caps.scsi_lsi {
                cont.scsi_model = Some(ScsiControllerModel::Lsilogic);
            } else if caps.virtio_scsi {
                cont.scsi_model = Some(ScsiControllerModel::VirtioScsi);
            } else {
                return Err(Error::ScsiModelUndeterminable);
            }
        }
        Ok(())
    }

    // ---- sPAPR-VIO -----------------------------------------------------

    fn assign_spapr_vio_addresses(&mut self) -> Result<()> {
        // A spapr-vlan NIC or an ibmvscsi controller implies the VIO bus
        // on its own; serial consoles and NVRAM move there only on a
        // ppc64 pseries machine.
        let vio_machine =
            self.config.machine_is_pseries() && self.config.arch == Arch::Ppc64;

        for net in &mut self.config.nets {
            if net.model_is("spapr-vlan") && net.address.wanted() {
                net.address = DeviceAddress::SpaprVio { reg: None };
            }
        }
        for cont in &mut self.config.controllers {
            if cont.kind == ControllerKind::Scsi
                && cont.scsi_model == Some(ScsiControllerModel::Ibmvscsi)
                && cont.address.wanted()
            {
                cont.address = DeviceAddress::SpaprVio { reg: None };
            }
        }
        for serial in &mut self.config.serials {
            if vio_machine && serial.target == SerialTarget::SpaprVio && serial.address.wanted()
            {
                serial.address = DeviceAddress::SpaprVio { reg: None };
            }
        }
        if let Some(nvram) = &mut self.config.nvram {
            if vio_machine && nvram.address.wanted() {
                nvram.address = DeviceAddress::SpaprVio { reg: None };
            }
        }

        let mut set = SpaprVioAddressSet::new();

        // Pinned registers first; a collision between them is fatal.
        let mut pinned = |address: &DeviceAddress| -> Result<()> {
            if let DeviceAddress::SpaprVio { reg: Some(reg) } = address {
                set.reserve(*reg)?;
            }
            Ok(())
        };
        for net in &self.config.nets {
            pinned(&net.address)?;
        }
        for cont in &self.config.controllers {
            pinned(&cont.address)?;
        }
        for serial in &self.config.serials {
            pinned(&serial.address)?;
        }
        if let Some(nvram) = &self.config.nvram {
            pinned(&nvram.address)?;
        }

        let mut auto = |address: &mut DeviceAddress, base: u64| -> Result<()> {
            if let DeviceAddress::SpaprVio { reg: reg @ None } = address {
                *reg = Some(set.assign_next(base)?);
            }
            Ok(())
        };
        for net in &mut self.config.nets {
            auto(&mut net.address, VIO_ADDR_NET)?;
        }
        for cont in &mut self.config.controllers {
            auto(&mut cont.address, VIO_ADDR_SCSI)?;
        }
        for serial in &mut self.config.serials {
            auto(&mut serial.address, VIO_ADDR_SERIAL)?;
        }
        if let Some(nvram) = &mut self.config.nvram {
            auto(&mut nvram.address, VIO_ADDR_NVRAM)?;
        }
        Ok(())
    }

    // ---- s390 ----------------------------------------------------------

    /// Devices eligible for a virtio bus-type change: everything that is
    /// (or can be) a virtio device. Filesystem devices only exist as
    /// virtio-ccw, so they join the walk for CCW callers only.
    fn for_each_virtio_address<F>(config: &mut VmConfig, ccw: bool, mut f: F) -> Result<()>
    where
        F: FnMut(&mut DeviceAddress) -> Result<()>,
    {
        for disk in &mut config.disks {
            if disk.bus == DiskBus::Virtio {
                f(&mut disk.address)?;
            }
        }
        for net in &mut config.nets {
            if net.model_is("virtio") {
                f(&mut net.address)?;
            }
        }
        for input in &mut config.inputs {
            if input.bus == InputBus::Virtio {
                f(&mut input.address)?;
            }
        }
        for cont in &mut config.controllers {
            if cont.kind == ControllerKind::VirtioSerial || cont.kind == ControllerKind::Scsi {
                f(&mut cont.address)?;
            }
        }
        if let Some(balloon) = &mut config.balloon {
            if balloon.model == BalloonModel::Virtio {
                f(&mut balloon.address)?;
            }
        }
        for rng in &mut config.rngs {
            f(&mut rng.address)?;
        }
        if ccw {
            for fs in &mut config.fss {
                f(&mut fs.address)?;
            }
        }
        Ok(())
    }

    fn prime_virtio_device_addresses(config: &mut VmConfig, target: DeviceAddress) {
        let ccw = matches!(target, DeviceAddress::Ccw(_));
        // Infallible walk, the closure never errors.
        let _ = Self::for_each_virtio_address(config, ccw, |address| {
            if address.wanted() {
                *address = target;
            }
            Ok(())
        });
    }

    fn assign_s390_addresses(&mut self) -> Result<()> {
        if self.config.machine_is_s390_ccw() && self.caps.virtio_ccw {
            Self::prime_virtio_device_addresses(&mut self.config, DeviceAddress::Ccw(None));

            let mut set = CcwAddressSet::new();
            // Validate the pinned addresses before assigning any.
            Self::for_each_virtio_address(&mut self.config, true, |address| {
                if let DeviceAddress::Ccw(Some(addr)) = address {
                    set.reserve(*addr)?;
                }
                Ok(())
            })?;
            Self::for_each_virtio_address(&mut self.config, true, |address| {
                if let DeviceAddress::Ccw(slot @ None) = address {
                    *slot = Some(set.assign_next()?);
                }
                Ok(())
            })?;
            self.ccw_addrs = Some(set);
        } else if self.caps.virtio_s390 {
            Self::prime_virtio_device_addresses(&mut self.config, DeviceAddress::VirtioS390);
        }
        Ok(())
    }

    // ---- ARM virtio-mmio -----------------------------------------------

    fn assign_arm_virtio_mmio_addresses(&mut self) {
        if !matches!(self.config.arch, Arch::Armv7l | Arch::Aarch64) {
            return;
        }
        if !(self.config.machine.starts_with("vexpress-") || self.config.machine_is_virt()) {
            return;
        }
        if self.caps.virtio_mmio {
            Self::prime_virtio_device_addresses(&mut self.config, DeviceAddress::VirtioMmio);
        }
    }

    // ---- PCI -----------------------------------------------------------

    /// Machines that support PCI always have a root even when the
    /// configuration does not spell it out. On Q35 the default topology
    /// also includes a route to hotpluggable PCI slots.
    fn add_implicit_pci_controllers(&mut self) {
        if !self.config.supports_pci(&self.caps)
            || self.config.machine_is_s390_ccw()
            || self.config.arch == Arch::S390x
            || self.config.pci_controllers().next().is_some()
        {
            return;
        }
        if self.config.machine_is_q35() {
            self.config
                .maybe_add_pci_controller(0, PciControllerModel::PcieRoot);
            if self.caps.device_pci_bridge {
                self.config
                    .maybe_add_pci_controller(1, PciControllerModel::DmiToPciBridge);
                self.config
                    .maybe_add_pci_controller(2, PciControllerModel::PciBridge);
            }
        } else {
            self.config
                .maybe_add_pci_controller(0, PciControllerModel::PciRoot);
        }
    }

    /// Build a bus set sized for the configuration and fill in every
    /// address the configuration already pins down.
    fn address_set_create(config: &VmConfig, nbuses: usize, dry_run: bool) -> Result<PciAddressSet> {
        let mut set = PciAddressSet::new(nbuses, dry_run);
        for cont in config.pci_controllers() {
            if let Some(model) = cont.pci_model {
                set.set_bus_model(cont.index as usize, model)?;
            }
        }
        Self::collect_pci_addresses(config, &mut set)?;
        Ok(set)
    }

    fn collect_pci_addresses(config: &VmConfig, set: &mut PciAddressSet) -> Result<()> {
        for cont in &config.controllers {
            let Some(addr) = cont.address.pci() else {
                continue;
            };

            // The integrated PIIX3 functions keep their implicit address;
            // the chipset pass reserves the whole southbridge slot.
            let integrated_ide = cont.kind == ControllerKind::Ide
                && cont.index == 0
                && addr.domain == 0
                && addr.bus == 0
                && addr.slot == 1
                && addr.function == 1;
            let integrated_usb = cont.kind == ControllerKind::Usb
                && cont.index == 0
                && matches!(cont.usb_model, None | Some(UsbControllerModel::Piix3Uhci))
                && addr.domain == 0
                && addr.bus == 0
                && addr.slot == 1
                && addr.function == 2;
            if integrated_ide || integrated_usb {
                if set.nbuses() > 0
                    && !set
                        .bus(0)
                        .is_some_and(|b| b.flags().contains(ConnectFlags::PCI_DEVICE))
                {
                    return Err(Error::IntegratedControllerBus);
                }
                continue;
            }

            let flags = controller_connect_flags(cont);
            if flags.is_empty() {
                // A root; not connected anywhere.
                continue;
            }
            reserve_collected(set, addr, flags)?;
        }

        for disk in &config.disks {
            if let Some(addr) = disk.address.pci() {
                reserve_collected(set, addr, default_flags())?;
            }
        }
        for fs in &config.fss {
            if let Some(addr) = fs.address.pci() {
                reserve_collected(set, addr, default_flags())?;
            }
        }
        for net in &config.nets {
            if let Some(addr) = net.address.pci() {
                reserve_collected(set, addr, default_flags())?;
            }
        }
        for sound in &config.sounds {
            if let Some(addr) = sound.address.pci() {
                reserve_collected(set, addr, sound_connect_flags(sound.model))?;
            }
        }
        for video in &config.videos {
            if let Some(addr) = video.address.pci() {
                reserve_collected(set, addr, ConnectFlags::ENDPOINT)?;
            }
        }
        for hostdev in &config.hostdevs {
            if let Some(addr) = hostdev.address.pci() {
                reserve_collected(set, addr, default_flags())?;
            }
        }
        for serial in &config.serials {
            if let Some(addr) = serial.address.pci() {
                reserve_collected(set, addr, default_flags())?;
            }
        }
        for channel in &config.channels {
            if let Some(addr) = channel.address.pci() {
                reserve_collected(set, addr, default_flags())?;
            }
        }
        for input in &config.inputs {
            if let Some(addr) = input.address.pci() {
                reserve_collected(set, addr, default_flags())?;
            }
        }
        for watchdog in &config.watchdogs {
            if let Some(addr) = watchdog.address.pci() {
                reserve_collected(set, addr, default_flags())?;
            }
        }
        for rng in &config.rngs {
            if let Some(addr) = rng.address.pci() {
                reserve_collected(set, addr, default_flags())?;
            }
        }
        for shmem in &config.shmems {
            if let Some(addr) = shmem.address.pci() {
                reserve_collected(set, addr, default_flags())?;
            }
        }
        if let Some(balloon) = &config.balloon {
            if let Some(addr) = balloon.address.pci() {
                reserve_collected(set, addr, default_flags())?;
            }
        }
        Ok(())
    }

    fn assign_pci_addresses(&mut self) -> Result<()> {
        let mut nbuses = 0;
        for cont in self.config.pci_controllers() {
            nbuses = nbuses.max(cont.index as usize + 1);
        }

        if nbuses > 0 && self.caps.device_pci_bridge {
            let mut addrs = Self::address_set_create(&self.config, nbuses, true)?;
            if self.config.supports_pci(&self.caps) {
                chipset::validate_slots(&mut self.config, &self.caps, &mut addrs)?;

                // Unless every bus is already packed solid, keep one slot
                // free so a device hotplugged later has somewhere to go.
                let buses_reserved = (0..addrs.nbuses())
                    .all(|i| addrs.bus(i).is_some_and(|b| b.fully_reserved()));
                if !buses_reserved {
                    addrs.reserve_next(ConnectFlags::PCI_DEVICE)?;
                }

                Self::assign_device_pci_slots(&mut self.config, &self.caps, &mut addrs)?;

                // Any bus the dry run grew needs a real bridge controller
                // in the configuration, and that bridge eats a slot too.
                for i in 1..addrs.nbuses() {
                    let model = addrs
                        .bus(i)
                        .map(|b| b.model())
                        .unwrap_or(PciControllerModel::PciBridge);
                    if self.config.maybe_add_pci_controller(i as u32, model) {
                        addrs.reserve_next(ConnectFlags::PCI_DEVICE)?;
                    }
                }
                nbuses = addrs.nbuses();
            }
        } else if nbuses > 1 {
            return Err(Error::PciBridgeUnsupported);
        }

        let mut addrs = Self::address_set_create(&self.config, nbuses, false)?;
        if self.config.supports_pci(&self.caps) {
            chipset::validate_slots(&mut self.config, &self.caps, &mut addrs)?;
            Self::assign_device_pci_slots(&mut self.config, &self.caps, &mut addrs)?;
            self.normalize_pci_controller_options()?;
        }
        self.pci_addrs = Some(addrs);
        Ok(())
    }

    /// The generic placement loop, in a fixed device-class order.
    fn assign_device_pci_slots(
        config: &mut VmConfig,
        caps: &Capabilities,
        addrs: &mut PciAddressSet,
    ) -> Result<()> {
        let flags = default_flags();

        // PCI controllers first; everything else may land behind them.
        for cont in &mut config.controllers {
            if cont.kind != ControllerKind::Pci || !cont.address.wanted() {
                continue;
            }
            let Some(model) = cont.pci_model else { continue };
            let cflags = model.connect_type();
            if cflags.is_empty() {
                // Roots are part of the machine.
                continue;
            }
            assign_next(addrs, &mut cont.address, cflags)?;
        }

        for fs in &mut config.fss {
            if fs.address.wanted() {
                assign_next(addrs, &mut fs.address, flags)?;
            }
        }

        for net in &mut config.nets {
            // Hostdev-backed networks are placed through the hostdev path.
            if !net.hostdev_backed && net.address.wanted() {
                assign_next(addrs, &mut net.address, flags)?;
            }
        }

        for sound in &mut config.sounds {
            if matches!(
                sound.model,
                SoundModel::Sb16 | SoundModel::PcSpk | SoundModel::Usb
            ) {
                continue;
            }
            if sound.address.wanted() {
                assign_next(addrs, &mut sound.address, flags)?;
            }
        }

        for i in 0..config.controllers.len() {
            let cont = &config.controllers[i];
            if !cont.address.wanted() {
                continue;
            }
            match cont.kind {
                // Handled above, or not PCI devices at all.
                ControllerKind::Pci | ControllerKind::Fdc | ControllerKind::Ccid => continue,
                // The first IDE controller is integrated into the chipset.
                ControllerKind::Ide if cont.index == 0 => continue,
                ControllerKind::Usb if cont.usb_model == Some(UsbControllerModel::None) => {
                    continue
                }
                ControllerKind::Usb
                    if cont.usb_model.is_some_and(|m| m.is_ich9_companion()) =>
                {
                    let model = cont.usb_model.unwrap_or(UsbControllerModel::Ich9Uhci1);
                    let index = cont.index;

                    // Companions with the same index share one slot; pick
                    // it up from whichever one was placed first.
                    let mut slot_addr = None;
                    for other in &config.controllers {
                        if other.kind == ControllerKind::Usb
                            && other.index == index
                            && other.usb_model.is_some_and(|m| m.is_ich9_companion())
                        {
                            if let Some(a) = other.address.pci() {
                                slot_addr = Some(a);
                                break;
                            }
                        }
                    }
                    let found = slot_addr.is_some();
                    let mut addr = match slot_addr {
                        Some(a) => a,
                        None => {
                            let a = addrs.next_free_slot(flags)?;
                            addrs.set_last_address(a);
                            a
                        }
                    };
                    addr.function = ich9_companion_function(model);
                    addr.multifunction = if model == UsbControllerModel::Ich9Uhci1 {
                        Some(true)
                    } else {
                        None
                    };
                    addrs.reserve(addr, flags, false, found)?;
                    config.controllers[i].address = DeviceAddress::Pci(addr);
                }
                _ => {
                    let address = &mut config.controllers[i].address;
                    assign_next(addrs, address, flags)?;
                }
            }
        }

        for disk in &mut config.disks {
            if disk.bus != DiskBus::Virtio {
                continue;
            }
            match disk.address {
                DeviceAddress::None => assign_next(addrs, &mut disk.address, flags)?,
                DeviceAddress::Pci(_)
                | DeviceAddress::Ccw(_)
                | DeviceAddress::VirtioS390 => {}
                DeviceAddress::VirtioMmio if caps.virtio_mmio => {}
                ref other => {
                    return Err(Error::VirtioDiskAddressType(other.type_name()));
                }
            }
        }

        for hostdev in &mut config.hostdevs {
            if hostdev.pci && hostdev.address.wanted() {
                assign_next(addrs, &mut hostdev.address, flags)?;
            }
        }

        if let Some(balloon) = &mut config.balloon {
            if balloon.model == BalloonModel::Virtio && balloon.address.wanted() {
                assign_next(addrs, &mut balloon.address, flags)?;
            }
        }

        for rng in &mut config.rngs {
            if rng.address.wanted() {
                assign_next(addrs, &mut rng.address, flags)?;
            }
        }

        for watchdog in &mut config.watchdogs {
            if watchdog.model == WatchdogModel::I6300esb && watchdog.address.wanted() {
                assign_next(addrs, &mut watchdog.address, flags)?;
            }
        }

        // The primary video only reaches this point on hypervisors that
        // can place it anywhere; otherwise the chipset pass pinned it.
        let mut videos = config.videos.iter_mut();
        if let Some(primary) = videos.next() {
            if primary.address.wanted() {
                assign_next(addrs, &mut primary.address, flags)?;
            }
        }
        for video in videos {
            if video.model != VideoModel::Qxl {
                return Err(Error::SecondaryVideoModel);
            }
            if video.address.wanted() {
                assign_next(addrs, &mut video.address, flags)?;
            }
        }

        for shmem in &mut config.shmems {
            if shmem.address.wanted() {
                assign_next(addrs, &mut shmem.address, flags)?;
            }
        }

        for input in &mut config.inputs {
            if input.bus == InputBus::Virtio && input.address.wanted() {
                assign_next(addrs, &mut input.address, flags)?;
            }
        }

        for serial in &mut config.serials {
            if serial.target == SerialTarget::Pci && serial.address.wanted() {
                assign_next(addrs, &mut serial.address, flags)?;
            }
        }

        Ok(())
    }

    /// Fill in the hypervisor-facing options every placed PCI controller
    /// needs: the device model name and per-model numbering.
    fn normalize_pci_controller_options(&mut self) -> Result<()> {
        // Expander buses claim their bus number range first since each
        // pick depends on the numbers already taken.
        let expanders: Vec<usize> = self
            .config
            .controllers
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                c.kind == ControllerKind::Pci
                    && matches!(
                        c.pci_model,
                        Some(PciControllerModel::PciExpanderBus)
                            | Some(PciControllerModel::PcieExpanderBus)
                    )
                    && c.bus_nr.is_none()
            })
            .map(|(i, _)| i)
            .collect();
        for i in expanders {
            let nr = self.config.find_new_bus_nr().ok_or(Error::NoFreeBusNr)?;
            self.config.controllers[i].bus_nr = Some(nr);
        }

        for cont in &mut self.config.controllers {
            if cont.kind != ControllerKind::Pci {
                continue;
            }
            let Some(model) = cont.pci_model else { continue };
            let addr = cont.address.pci();
            match model {
                PciControllerModel::PciRoot | PciControllerModel::PcieRoot => {}
                PciControllerModel::PciBridge => {
                    if let Some(addr) = addr {
                        if cont.index <= addr.bus as u32 {
                            return Err(Error::BridgeIndexBelowBus {
                                index: cont.index,
                                bus: addr.bus,
                            });
                        }
                    }
                    cont.model_name.get_or_insert_with(|| "pci-bridge".into());
                    if cont.chassis_nr.is_none() {
                        cont.chassis_nr = Some(cont.index);
                    }
                }
                PciControllerModel::DmiToPciBridge => {
                    cont.model_name
                        .get_or_insert_with(|| "i82801b11-bridge".into());
                }
                PciControllerModel::PcieRootPort => {
                    cont.model_name.get_or_insert_with(|| "ioh3420".into());
                    if cont.chassis.is_none() && cont.port.is_none() {
                        cont.chassis = Some(cont.index);
                        if let Some(addr) = addr {
                            cont.port =
                                Some(((addr.slot as u32) << 3) + addr.function as u32);
                        }
                    }
                }
                PciControllerModel::PcieSwitchUpstreamPort => {
                    cont.model_name
                        .get_or_insert_with(|| "x3130-upstream".into());
                }
                PciControllerModel::PcieSwitchDownstreamPort => {
                    cont.model_name
                        .get_or_insert_with(|| "xio3130-downstream".into());
                    if cont.chassis.is_none() && cont.port.is_none() {
                        cont.chassis = Some(cont.index);
                        if let Some(addr) = addr {
                            cont.port = Some(addr.slot as u32);
                        }
                    }
                }
                PciControllerModel::PciExpanderBus => {
                    cont.model_name.get_or_insert_with(|| "pxb".into());
                }
                PciControllerModel::PcieExpanderBus => {
                    cont.model_name.get_or_insert_with(|| "pxb-pcie".into());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use vm_allocator::{CcwAddress, VirtioSerialAddress};

    use super::*;
    use crate::vm_config::{
        BalloonConfig, ChannelConfig, ConsoleConfig, DiskConfig, FsConfig, InputConfig,
        NetConfig, NvramConfig, SerialConfig, VideoConfig,
    };

    fn pc_caps() -> Capabilities {
        Capabilities {
            device_pci_bridge: true,
            device_video_primary: true,
            ..Default::default()
        }
    }

    fn config(machine: &str) -> VmConfig {
        VmConfig {
            machine: machine.to_owned(),
            ..Default::default()
        }
    }

    fn virtio_disk() -> DiskConfig {
        DiskConfig {
            bus: DiskBus::Virtio,
            address: DeviceAddress::None,
        }
    }

    fn pci_of(address: &DeviceAddress) -> PciAddress {
        address.pci().expect("device should have a PCI address")
    }

    #[test]
    fn i440fx_basic_layout() {
        let mut cfg = config("pc-i440fx-2.5");
        cfg.controllers.push(ControllerConfig {
            kind: ControllerKind::Ide,
            index: 0,
            ..Default::default()
        });
        cfg.controllers.push(ControllerConfig {
            kind: ControllerKind::Usb,
            index: 0,
            ..Default::default()
        });
        cfg.videos.push(VideoConfig {
            model: VideoModel::Cirrus,
            address: DeviceAddress::None,
        });
        cfg.nets.push(NetConfig {
            model: Some("virtio".into()),
            hostdev_backed: false,
            address: DeviceAddress::None,
        });
        cfg.disks.push(virtio_disk());
        cfg.disks.push(virtio_disk());

        let mut mgr = DeviceManager::new(cfg, pc_caps());
        mgr.assign_addresses().unwrap();
        let cfg = mgr.config();

        assert_eq!(pci_of(&cfg.controllers[0].address), PciAddress::new(0, 1, 1));
        assert_eq!(pci_of(&cfg.controllers[1].address), PciAddress::new(0, 1, 2));
        assert_eq!(pci_of(&cfg.videos[0].address), PciAddress::new(0, 2, 0));
        // Nets are placed before disks, right after the chipset slots.
        assert_eq!(pci_of(&cfg.nets[0].address), PciAddress::new(0, 3, 0));
        assert_eq!(pci_of(&cfg.disks[0].address), PciAddress::new(0, 4, 0));
        assert_eq!(pci_of(&cfg.disks[1].address), PciAddress::new(0, 5, 0));
    }

    #[test]
    fn i440fx_rejects_misplaced_primary_ide() {
        let mut cfg = config("pc");
        cfg.controllers.push(ControllerConfig {
            kind: ControllerKind::Ide,
            index: 0,
            address: DeviceAddress::Pci(PciAddress::new(0, 3, 0)),
            ..Default::default()
        });
        let mut mgr = DeviceManager::new(cfg, pc_caps());
        assert!(matches!(
            mgr.assign_addresses().unwrap_err(),
            Error::PrimaryIdeAddress(_)
        ));
    }

    #[test]
    fn q35_basic_layout() {
        let mut cfg = config("pc-q35-2.5");
        cfg.disks.push(virtio_disk());

        let mut mgr = DeviceManager::new(cfg, pc_caps());
        mgr.assign_addresses().unwrap();
        let cfg = mgr.config();

        // The implicit topology: pcie-root, dmi-to-pci-bridge, pci-bridge.
        let models: Vec<_> = cfg
            .pci_controllers()
            .map(|c| (c.index, c.pci_model.unwrap()))
            .collect();
        assert_eq!(
            models,
            vec![
                (0, PciControllerModel::PcieRoot),
                (1, PciControllerModel::DmiToPciBridge),
                (2, PciControllerModel::PciBridge),
            ]
        );

        // The integrated AHCI was synthesized and pinned at 1f.2.
        let sata = cfg
            .controllers
            .iter()
            .find(|c| c.kind == ControllerKind::Sata)
            .unwrap();
        let addr = pci_of(&sata.address);
        assert_eq!((addr.bus, addr.slot, addr.function), (0, 0x1f, 2));

        // The dmi-to-pci-bridge sits at its conventional slot and the
        // pci-bridge hangs off it.
        let dmi = cfg.pci_controllers().find(|c| c.index == 1).unwrap();
        assert_eq!(pci_of(&dmi.address), PciAddress::new(0, 0x1e, 0));
        assert_eq!(dmi.model_name.as_deref(), Some("i82801b11-bridge"));

        let bridge = cfg.pci_controllers().find(|c| c.index == 2).unwrap();
        let addr = pci_of(&bridge.address);
        assert_eq!(addr.bus, 1);
        assert_eq!(bridge.model_name.as_deref(), Some("pci-bridge"));
        assert_eq!(bridge.chassis_nr, Some(2));

        // A hotpluggable virtio disk cannot live on pcie-root or the
        // dmi-to-pci-bridge, only on the pci-bridge.
        assert_eq!(pci_of(&cfg.disks[0].address).bus, 2);
    }

    #[test]
    fn ich9_usb_companions_share_one_slot() {
        let mut cfg = config("pc-i440fx-2.5");
        for model in [
            UsbControllerModel::Ich9Ehci1,
            UsbControllerModel::Ich9Uhci1,
            UsbControllerModel::Ich9Uhci2,
            UsbControllerModel::Ich9Uhci3,
        ] {
            cfg.controllers.push(ControllerConfig {
                kind: ControllerKind::Usb,
                index: 0,
                usb_model: Some(model),
                ..Default::default()
            });
        }

        let mut mgr = DeviceManager::new(cfg, pc_caps());
        mgr.assign_addresses().unwrap();
        let cfg = mgr.config();

        let addrs: Vec<_> = cfg
            .controllers
            .iter()
            .filter(|c| c.kind == ControllerKind::Usb)
            .map(|c| pci_of(&c.address))
            .collect();
        let slot = addrs[0].slot;
        assert!(addrs.iter().all(|a| a.bus == 0 && a.slot == slot));
        assert_eq!(
            addrs.iter().map(|a| a.function).collect::<Vec<_>>(),
            vec![7, 0, 1, 2]
        );
        // The UHCI1 function carries the multifunction marker.
        assert_eq!(addrs[1].multifunction, Some(true));
    }

    #[test]
    fn bus_growth_synthesizes_bridge_controllers() {
        let mut cfg = config("pc");
        for _ in 0..35 {
            cfg.disks.push(virtio_disk());
        }

        let mut mgr = DeviceManager::new(cfg, pc_caps());
        mgr.assign_addresses().unwrap();
        let cfg = mgr.config();

        let bridge = cfg.pci_controllers().find(|c| c.index == 1).unwrap();
        assert_eq!(bridge.pci_model, Some(PciControllerModel::PciBridge));
        assert_eq!(bridge.model_name.as_deref(), Some("pci-bridge"));
        // The bridge itself lives on bus 0.
        assert_eq!(pci_of(&bridge.address).bus, 0);

        assert!(cfg.disks.iter().all(|d| d.address.pci().is_some()));
        assert!(cfg.disks.iter().any(|d| pci_of(&d.address).bus == 1));
    }

    #[test]
    fn bridges_need_hypervisor_support() {
        let mut cfg = config("pc");
        cfg.controllers
            .push(ControllerConfig::pci(0, PciControllerModel::PciRoot));
        cfg.controllers
            .push(ControllerConfig::pci(1, PciControllerModel::PciBridge));

        let caps = Capabilities::default();
        let mut mgr = DeviceManager::new(cfg, caps);
        assert!(matches!(
            mgr.assign_addresses().unwrap_err(),
            Error::PciBridgeUnsupported
        ));
    }

    #[test]
    fn virtio_serial_ports_and_controller_synthesis() {
        let mut cfg = config("pc");
        cfg.controllers.push(ControllerConfig {
            kind: ControllerKind::VirtioSerial,
            index: 0,
            ports: Some(2),
            ..Default::default()
        });
        for _ in 0..3 {
            cfg.channels.push(ChannelConfig {
                target: ChannelTarget::VirtioSerial,
                address: DeviceAddress::None,
            });
        }
        cfg.consoles.push(ConsoleConfig {
            target: ConsoleTarget::Virtio,
            address: DeviceAddress::None,
        });

        let mut mgr = DeviceManager::new(cfg, pc_caps());
        mgr.assign_addresses().unwrap();
        let cfg = mgr.config();

        assert_eq!(
            cfg.channels[0].address,
            DeviceAddress::VirtioSerial(VirtioSerialAddress::new(0, 1))
        );
        assert_eq!(
            cfg.channels[1].address,
            DeviceAddress::VirtioSerial(VirtioSerialAddress::new(0, 2))
        );
        // The third channel overflowed onto a synthesized controller.
        assert_eq!(
            cfg.channels[2].address,
            DeviceAddress::VirtioSerial(VirtioSerialAddress::new(1, 1))
        );
        assert_eq!(
            cfg.controllers
                .iter()
                .filter(|c| c.kind == ControllerKind::VirtioSerial)
                .count(),
            2
        );
        // The console keeps its implicit address.
        assert!(cfg.consoles[0].address.wanted());
    }

    #[test]
    fn s390_ccw_assignment_two_phase() {
        let mut cfg = config("s390-ccw-virtio");
        cfg.arch = Arch::S390x;
        cfg.disks.push(virtio_disk());
        cfg.disks.push(DiskConfig {
            bus: DiskBus::Virtio,
            address: DeviceAddress::Ccw(Some(CcwAddress::new(0xfe, 0, 1))),
        });
        cfg.disks.push(virtio_disk());

        let caps = Capabilities {
            virtio_ccw: true,
            ..Default::default()
        };
        let mut mgr = DeviceManager::new(cfg, caps);
        mgr.assign_addresses().unwrap();
        let cfg = mgr.config();

        // The pinned devno is skipped by the auto-assigned ones.
        assert_eq!(
            cfg.disks[0].address,
            DeviceAddress::Ccw(Some(CcwAddress::new(0xfe, 0, 0)))
        );
        assert_eq!(
            cfg.disks[2].address,
            DeviceAddress::Ccw(Some(CcwAddress::new(0xfe, 0, 2)))
        );
    }

    #[test]
    fn legacy_s390_priming() {
        let mut cfg = config("s390-virtio");
        cfg.arch = Arch::S390x;
        cfg.disks.push(virtio_disk());

        let caps = Capabilities {
            virtio_s390: true,
            ..Default::default()
        };
        let mut mgr = DeviceManager::new(cfg, caps);
        mgr.assign_addresses().unwrap();
        assert_eq!(mgr.config().disks[0].address, DeviceAddress::VirtioS390);
    }

    #[test]
    fn pseries_vio_register_layout() {
        let mut cfg = config("pseries");
        cfg.arch = Arch::Ppc64;
        cfg.nets.push(NetConfig {
            model: Some("spapr-vlan".into()),
            hostdev_backed: false,
            address: DeviceAddress::None,
        });
        cfg.controllers.push(ControllerConfig {
            kind: ControllerKind::Scsi,
            index: 0,
            ..Default::default()
        });
        cfg.serials.push(SerialConfig {
            target: SerialTarget::SpaprVio,
            address: DeviceAddress::None,
        });
        cfg.nvram = Some(NvramConfig::default());

        let mut mgr = DeviceManager::new(cfg, Capabilities::default());
        mgr.assign_addresses().unwrap();
        let cfg = mgr.config();

        // The SCSI controller defaulted to the paravirtual model and
        // moved onto the VIO bus along with the rest.
        assert_eq!(
            cfg.controllers[0].scsi_model,
            Some(ScsiControllerModel::Ibmvscsi)
        );
        assert_eq!(
            cfg.nets[0].address,
            DeviceAddress::SpaprVio { reg: Some(0x1000) }
        );
        assert_eq!(
            cfg.controllers[0].address,
            DeviceAddress::SpaprVio { reg: Some(0x2000) }
        );
        assert_eq!(
            cfg.serials[0].address,
            DeviceAddress::SpaprVio {
                reg: Some(0x3000_0000)
            }
        );
        assert_eq!(
            cfg.nvram.as_ref().unwrap().address,
            DeviceAddress::SpaprVio { reg: Some(0x3000) }
        );
    }

    #[test]
    fn scsi_model_defaulting_follows_capabilities() {
        let mut cfg = config("pc");
        cfg.controllers.push(ControllerConfig {
            kind: ControllerKind::Scsi,
            index: 0,
            ..Default::default()
        });

        let caps = Capabilities {
            device_pci_bridge: true,
            device_video_primary: true,
            virtio_scsi: true,
            ..Default::default()
        };
        let mut mgr = DeviceManager::new(cfg.clone(), caps);
        mgr.assign_addresses().unwrap();
        assert_eq!(
            mgr.config().controllers[0].scsi_model,
            Some(ScsiControllerModel::VirtioScsi)
        );

        // With no SCSI controller capability at all the model cannot be
        // picked.
        let mut mgr = DeviceManager::new(cfg, pc_caps());
        assert!(matches!(
            mgr.assign_addresses().unwrap_err(),
            Error::ScsiModelUndeterminable
        ));
    }

    #[test]
    fn arm_virt_primes_virtio_mmio() {
        let mut cfg = config("virt");
        cfg.arch = Arch::Aarch64;
        cfg.disks.push(virtio_disk());
        cfg.balloon = Some(BalloonConfig {
            model: BalloonModel::Virtio,
            address: DeviceAddress::None,
        });

        let caps = Capabilities {
            virtio_mmio: true,
            ..Default::default()
        };
        let mut mgr = DeviceManager::new(cfg, caps);
        mgr.assign_addresses().unwrap();
        let cfg = mgr.config();
        assert_eq!(cfg.disks[0].address, DeviceAddress::VirtioMmio);
        assert_eq!(
            cfg.balloon.as_ref().unwrap().address,
            DeviceAddress::VirtioMmio
        );
    }

    #[test]
    fn released_pci_slot_is_reusable() {
        let mut cfg = config("pc");
        cfg.disks.push(virtio_disk());

        let mut mgr = DeviceManager::new(cfg, pc_caps());
        mgr.assign_addresses().unwrap();
        let address = mgr.config().disks[0].address;
        let pci = pci_of(&address);
        assert!(mgr.pci_addresses().unwrap().slot_in_use(pci));

        mgr.release_device_address(&address);
        assert!(!mgr.pci_addresses().unwrap().slot_in_use(pci));
    }

    #[test]
    fn secondary_video_must_be_qxl() {
        let mut cfg = config("pc");
        cfg.videos.push(VideoConfig {
            model: VideoModel::Qxl,
            address: DeviceAddress::None,
        });
        cfg.videos.push(VideoConfig {
            model: VideoModel::Cirrus,
            address: DeviceAddress::None,
        });

        let mut mgr = DeviceManager::new(cfg, pc_caps());
        assert!(matches!(
            mgr.assign_addresses().unwrap_err(),
            Error::SecondaryVideoModel
        ));
    }

    #[test]
    fn s390_ccw_covers_inputs_scsi_and_filesystems() {
        let mut cfg = config("s390-ccw-virtio");
        cfg.arch = Arch::S390x;
        cfg.inputs.push(InputConfig {
            bus: InputBus::Virtio,
            address: DeviceAddress::None,
        });
        cfg.controllers.push(ControllerConfig {
            kind: ControllerKind::Scsi,
            index: 0,
            ..Default::default()
        });
        cfg.fss.push(FsConfig {
            address: DeviceAddress::None,
        });

        let caps = Capabilities {
            virtio_ccw: true,
            scsi_lsi: true,
            ..Default::default()
        };
        let mut mgr = DeviceManager::new(cfg, caps);
        mgr.assign_addresses().unwrap();
        let cfg = mgr.config();

        // A non-virtio SCSI controller model still rides the CCW bus.
        assert_eq!(
            cfg.controllers[0].scsi_model,
            Some(ScsiControllerModel::Lsilogic)
        );
        assert_eq!(
            cfg.inputs[0].address,
            DeviceAddress::Ccw(Some(CcwAddress::new(0xfe, 0, 0)))
        );
        assert_eq!(
            cfg.controllers[0].address,
            DeviceAddress::Ccw(Some(CcwAddress::new(0xfe, 0, 1)))
        );
        assert_eq!(
            cfg.fss[0].address,
            DeviceAddress::Ccw(Some(CcwAddress::new(0xfe, 0, 2)))
        );
    }

    #[test]
    fn virtio_mmio_priming_leaves_filesystems_alone() {
        let mut cfg = config("virt");
        cfg.arch = Arch::Aarch64;
        cfg.disks.push(virtio_disk());
        cfg.fss.push(FsConfig {
            address: DeviceAddress::None,
        });

        let caps = Capabilities {
            virtio_mmio: true,
            ..Default::default()
        };
        let mut mgr = DeviceManager::new(cfg, caps);
        mgr.assign_addresses().unwrap();
        let cfg = mgr.config();
        assert_eq!(cfg.disks[0].address, DeviceAddress::VirtioMmio);
        assert!(cfg.fss[0].address.wanted());
    }

    #[test]
    fn primary_video_falls_back_at_chipset_time() {
        let mut cfg = config("pc");
        cfg.disks.push(DiskConfig {
            bus: DiskBus::Virtio,
            address: DeviceAddress::Pci(PciAddress::new(0, 2, 0)),
        });
        cfg.nets.push(NetConfig {
            model: Some("e1000".into()),
            hostdev_backed: false,
            address: DeviceAddress::None,
        });
        cfg.videos.push(VideoConfig {
            model: VideoModel::Cirrus,
            address: DeviceAddress::None,
        });

        let mut mgr = DeviceManager::new(cfg, pc_caps());
        mgr.assign_addresses().unwrap();
        let cfg = mgr.config();

        // With the legacy slot occupied, the video is moved to the next
        // free slot before any other auto-placed device gets one.
        assert_eq!(pci_of(&cfg.videos[0].address), PciAddress::new(0, 3, 0));
        assert_eq!(pci_of(&cfg.nets[0].address), PciAddress::new(0, 4, 0));
    }

    #[test]
    fn consoles_take_ports_before_channels() {
        let mut cfg = config("pc");
        cfg.controllers.push(ControllerConfig {
            kind: ControllerKind::VirtioSerial,
            index: 0,
            ports: Some(2),
            ..Default::default()
        });
        for _ in 0..2 {
            cfg.consoles.push(ConsoleConfig {
                target: ConsoleTarget::Virtio,
                address: DeviceAddress::None,
            });
        }
        for _ in 0..2 {
            cfg.channels.push(ChannelConfig {
                target: ChannelTarget::VirtioSerial,
                address: DeviceAddress::None,
            });
        }

        let mut mgr = DeviceManager::new(cfg, pc_caps());
        mgr.assign_addresses().unwrap();
        let cfg = mgr.config();

        // Both consoles grabbed ports 0 and 1 first, so the channels got
        // port 2 and overflowed onto a synthesized controller.
        assert_eq!(
            cfg.channels[0].address,
            DeviceAddress::VirtioSerial(VirtioSerialAddress::new(0, 2))
        );
        assert_eq!(
            cfg.channels[1].address,
            DeviceAddress::VirtioSerial(VirtioSerialAddress::new(1, 1))
        );
        assert!(cfg.consoles.iter().all(|c| c.address.wanted()));
    }

    #[test]
    fn spapr_vlan_implies_vio_on_any_machine() {
        let mut cfg = config("pc");
        cfg.nets.push(NetConfig {
            model: Some("spapr-vlan".into()),
            hostdev_backed: false,
            address: DeviceAddress::None,
        });
        cfg.serials.push(SerialConfig {
            target: SerialTarget::SpaprVio,
            address: DeviceAddress::None,
        });

        let mut mgr = DeviceManager::new(cfg, pc_caps());
        mgr.assign_addresses().unwrap();
        let cfg = mgr.config();

        // The NIC model alone puts it on the VIO bus; serial consoles
        // only move there on ppc64 pseries machines.
        assert_eq!(
            cfg.nets[0].address,
            DeviceAddress::SpaprVio { reg: Some(0x1000) }
        );
        assert!(cfg.serials[0].address.wanted());
    }

    #[test]
    fn q35_uhci1_prefers_its_hardware_slot() {
        let mut cfg = config("pc-q35-2.5");
        cfg.controllers.push(ControllerConfig {
            kind: ControllerKind::Usb,
            index: 0,
            usb_model: Some(UsbControllerModel::Ich9Uhci1),
            ..Default::default()
        });

        let mut mgr = DeviceManager::new(cfg, pc_caps());
        mgr.assign_addresses().unwrap();
        let addr = pci_of(&mgr.config().controllers[0].address);
        assert_eq!((addr.bus, addr.slot, addr.function), (0, 0x1d, 0));
        assert_eq!(addr.multifunction, Some(true));
    }

    #[test]
    fn explicit_addresses_survive_and_conflict() {
        let mut cfg = config("pc");
        cfg.disks.push(DiskConfig {
            bus: DiskBus::Virtio,
            address: DeviceAddress::Pci(PciAddress::new(0, 5, 0)),
        });
        cfg.disks.push(virtio_disk());

        let mut mgr = DeviceManager::new(cfg.clone(), pc_caps());
        mgr.assign_addresses().unwrap();
        assert_eq!(
            pci_of(&mgr.config().disks[0].address),
            PciAddress::new(0, 5, 0)
        );
        assert_ne!(pci_of(&mgr.config().disks[1].address).slot, 5);

        // Two devices pinned to the same slot is a configuration error.
        cfg.disks[1].address = DeviceAddress::Pci(PciAddress::new(0, 5, 0));
        let mut mgr = DeviceManager::new(cfg, pc_caps());
        let err = mgr.assign_addresses().unwrap_err();
        assert!(err.is_config());
    }
}
