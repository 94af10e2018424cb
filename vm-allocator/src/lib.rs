// Copyright © 2025 The VM Address Allocator Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Address spaces for non-PCI device buses: s390 channel subsystem (CCW)
//! device numbers, virtio-serial controller ports and sPAPR-VIO register
//! addresses.

mod ccw;
mod spapr_vio;
mod virtio_serial;

pub use crate::ccw::{CcwAddress, CcwAddressSet, CcwError};
pub use crate::spapr_vio::{
    SpaprVioAddressSet, SpaprVioError, VIO_ADDR_NET, VIO_ADDR_NVRAM, VIO_ADDR_SCSI,
    VIO_ADDR_SERIAL,
};
pub use crate::virtio_serial::{
    VirtioSerialAddress, VirtioSerialAddressSet, VirtioSerialError, VIRTIO_SERIAL_DEFAULT_PORTS,
};
