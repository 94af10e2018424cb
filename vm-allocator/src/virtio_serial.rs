// Copyright © 2025 The VM Address Allocator Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ports offered by a virtio-serial controller that does not specify its
/// own count.
pub const VIRTIO_SERIAL_DEFAULT_PORTS: u32 = 31;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum VirtioSerialError {
    #[error("virtio serial controller with index {0} already exists in the address set")]
    DuplicateController(u32),
    #[error("virtio serial controller {0} not registered in the address set")]
    ControllerNotFound(u32),
    #[error("virtio serial controller {controller} does not have port {port}")]
    PortOutOfRange { controller: u32, port: u32 },
    #[error("virtio serial port {port} on controller {controller} is already occupied")]
    PortInUse { controller: u32, port: u32 },
    #[error("no free ports on any virtio serial controller")]
    NoFreePort,
}

/// Position of a device on a virtio-serial bus. `bus` is carried for
/// completeness but only bus 0 exists on each controller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtioSerialAddress {
    pub controller: u32,
    pub bus: u32,
    pub port: u32,
}

impl VirtioSerialAddress {
    pub fn new(controller: u32, port: u32) -> Self {
        VirtioSerialAddress {
            controller,
            bus: 0,
            port,
        }
    }
}

impl fmt::Display for VirtioSerialAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}.{}", self.controller, self.bus, self.port)
    }
}

#[derive(Debug)]
struct ControllerPorts {
    index: u32,
    // One entry per port, port 0 included.
    ports: Vec<bool>,
}

/// Port occupancy of every virtio-serial controller in a machine,
/// ordered by controller index.
#[derive(Debug, Default)]
pub struct VirtioSerialAddressSet {
    controllers: Vec<ControllerPorts>,
}

impl VirtioSerialAddressSet {
    pub fn new() -> Self {
        VirtioSerialAddressSet {
            controllers: Vec::new(),
        }
    }

    /// Register a controller offering ports 0 through `max_ports`.
    /// Controllers may be added in any order; the set keeps them sorted by
    /// index so port searches walk them in index order.
    pub fn add_controller(&mut self, index: u32, max_ports: u32) -> Result<(), VirtioSerialError> {
        let pos = match self
            .controllers
            .binary_search_by_key(&index, |c| c.index)
        {
            Ok(_) => return Err(VirtioSerialError::DuplicateController(index)),
            Err(pos) => pos,
        };
        self.controllers.insert(
            pos,
            ControllerPorts {
                index,
                ports: vec![false; max_ports as usize + 1],
            },
        );
        Ok(())
    }

    fn controller_mut(&mut self, index: u32) -> Result<&mut ControllerPorts, VirtioSerialError> {
        self.controllers
            .iter_mut()
            .find(|c| c.index == index)
            .ok_or(VirtioSerialError::ControllerNotFound(index))
    }

    /// Claim a specific port.
    pub fn reserve(&mut self, addr: VirtioSerialAddress) -> Result<(), VirtioSerialError> {
        let controller = self.controller_mut(addr.controller)?;
        let occupied =
            controller
                .ports
                .get_mut(addr.port as usize)
                .ok_or(VirtioSerialError::PortOutOfRange {
                    controller: addr.controller,
                    port: addr.port,
                })?;
        if *occupied {
            return Err(VirtioSerialError::PortInUse {
                controller: addr.controller,
                port: addr.port,
            });
        }
        *occupied = true;
        debug!("reserving virtio serial address {addr}");
        Ok(())
    }

    /// Find and claim the first free port across all controllers. Port 0
    /// is special (it is where a console ends up by default) and is only
    /// considered when `allow_zero` is set.
    pub fn reserve_next(
        &mut self,
        allow_zero: bool,
    ) -> Result<VirtioSerialAddress, VirtioSerialError> {
        let start = if allow_zero { 0 } else { 1 };
        for controller in &mut self.controllers {
            for (port, occupied) in controller.ports.iter_mut().enumerate().skip(start) {
                if !*occupied {
                    *occupied = true;
                    let addr = VirtioSerialAddress::new(controller.index, port as u32);
                    debug!("reserving virtio serial address {addr}");
                    return Ok(addr);
                }
            }
        }
        Err(VirtioSerialError::NoFreePort)
    }

    /// Find and claim a free port on one specific controller. Never hands
    /// out port 0.
    pub fn reserve_next_on_controller(
        &mut self,
        index: u32,
    ) -> Result<VirtioSerialAddress, VirtioSerialError> {
        let controller = self.controller_mut(index)?;
        for (port, occupied) in controller.ports.iter_mut().enumerate().skip(1) {
            if !*occupied {
                *occupied = true;
                let addr = VirtioSerialAddress::new(index, port as u32);
                debug!("reserving virtio serial address {addr}");
                return Ok(addr);
            }
        }
        Err(VirtioSerialError::NoFreePort)
    }

    /// Give a port back. Unknown controllers and out-of-range ports are
    /// ignored.
    pub fn release(&mut self, addr: VirtioSerialAddress) {
        if let Ok(controller) = self.controller_mut(addr.controller) {
            if let Some(occupied) = controller.ports.get_mut(addr.port as usize) {
                *occupied = false;
                debug!("released virtio serial address {addr}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_controller_index_rejected() {
        let mut set = VirtioSerialAddressSet::new();
        set.add_controller(0, VIRTIO_SERIAL_DEFAULT_PORTS).unwrap();
        assert_eq!(
            set.add_controller(0, VIRTIO_SERIAL_DEFAULT_PORTS),
            Err(VirtioSerialError::DuplicateController(0))
        );
    }

    #[test]
    fn port_zero_only_for_allow_zero() {
        let mut set = VirtioSerialAddressSet::new();
        set.add_controller(0, VIRTIO_SERIAL_DEFAULT_PORTS).unwrap();

        let addr = set.reserve_next(false).unwrap();
        assert_eq!(addr, VirtioSerialAddress::new(0, 1));

        let addr = set.reserve_next(true).unwrap();
        assert_eq!(addr, VirtioSerialAddress::new(0, 0));
    }

    #[test]
    fn search_walks_controllers_in_index_order() {
        let mut set = VirtioSerialAddressSet::new();
        set.add_controller(2, 1).unwrap();
        set.add_controller(0, 1).unwrap();

        // Controller 0 has ports 0 and 1; exhaust port 1, then the search
        // moves on to controller 2.
        assert_eq!(set.reserve_next(false).unwrap(), VirtioSerialAddress::new(0, 1));
        assert_eq!(set.reserve_next(false).unwrap(), VirtioSerialAddress::new(2, 1));
        assert_eq!(set.reserve_next(false), Err(VirtioSerialError::NoFreePort));
    }

    #[test]
    fn explicit_reservation_checks_range_and_occupancy() {
        let mut set = VirtioSerialAddressSet::new();
        set.add_controller(0, 2).unwrap();

        assert_eq!(
            set.reserve(VirtioSerialAddress::new(1, 1)),
            Err(VirtioSerialError::ControllerNotFound(1))
        );
        assert_eq!(
            set.reserve(VirtioSerialAddress::new(0, 3)),
            Err(VirtioSerialError::PortOutOfRange {
                controller: 0,
                port: 3
            })
        );

        set.reserve(VirtioSerialAddress::new(0, 2)).unwrap();
        assert_eq!(
            set.reserve(VirtioSerialAddress::new(0, 2)),
            Err(VirtioSerialError::PortInUse {
                controller: 0,
                port: 2
            })
        );
    }

    #[test]
    fn release_frees_the_port() {
        let mut set = VirtioSerialAddressSet::new();
        set.add_controller(0, 1).unwrap();
        let addr = set.reserve_next(false).unwrap();
        assert_eq!(set.reserve_next(false), Err(VirtioSerialError::NoFreePort));
        set.release(addr);
        assert_eq!(set.reserve_next(false).unwrap(), addr);
    }

    #[test]
    fn per_controller_search_skips_port_zero() {
        let mut set = VirtioSerialAddressSet::new();
        set.add_controller(1, 2).unwrap();
        let addr = set.reserve_next_on_controller(1).unwrap();
        assert_eq!(addr, VirtioSerialAddress::new(1, 1));
    }
}
