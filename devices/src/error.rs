// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Errors of device reconciliation.
//!
//! Every variant names the device and the step which failed so the caller can decide whether to
//! retry the whole pass.

use crate::kernel::KernelError;
use crate::mac::MacError;
use ipnet::IpNet;
use sysctl::SysctlError;

/// Errors which may occur while reconciling datapath devices.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Creating the device failed.
    #[error("unable to create {device}: {source}")]
    Create {
        /// The device we tried to create.
        device: String,
        /// Kernel error.
        source: KernelError,
    },
    /// The kernel does not support the requested device type.
    #[error("unable to create {device} ({hint}): {source}")]
    Unsupported {
        /// The device we tried to create.
        device: String,
        /// Operator facing hint naming the kernel module which may be missing.
        hint: String,
        /// Kernel error.
        source: KernelError,
    },
    /// Looking up the device failed.
    #[error("unable to retrieve {device}: {source}")]
    Retrieve {
        /// Device name.
        device: String,
        /// Kernel error.
        source: KernelError,
    },
    /// Setting the device up failed.
    #[error("unable to set {device} up: {source}")]
    SetUp {
        /// Device name.
        device: String,
        /// Kernel error.
        source: KernelError,
    },
    /// Applying the forwarding sysctls failed.
    #[error("unable to enable forwarding on {device}: {source}")]
    Forwarding {
        /// Device name.
        device: String,
        /// Sysctl error.
        source: SysctlError,
    },
    /// Setting the MTU failed.
    #[error("unable to set mtu {mtu} on {device}: {source}")]
    SetMtu {
        /// Device name.
        device: String,
        /// Desired MTU.
        mtu: u32,
        /// Kernel error.
        source: KernelError,
    },
    /// Disabling ARP failed.
    #[error("unable to disable arp on {device}: {source}")]
    SetArpOff {
        /// Device name.
        device: String,
        /// Kernel error.
        source: KernelError,
    },
    /// Deleting the device failed.
    #[error("unable to delete {device}: {source}")]
    Delete {
        /// Device name.
        device: String,
        /// Kernel error.
        source: KernelError,
    },
    /// Renaming the device failed.
    #[error("unable to rename {from} to {to}: {source}")]
    Rename {
        /// Current name.
        from: String,
        /// Desired name.
        to: String,
        /// Kernel error.
        source: KernelError,
    },
    /// Replacing an address failed.
    #[error("unable to replace address {address} on {device}: {source}")]
    ReplaceAddress {
        /// Device name.
        device: String,
        /// The address.
        address: IpNet,
        /// Kernel error.
        source: KernelError,
    },
    /// No hardware address could be generated for a new device.
    #[error("unable to generate hardware address for {device}: {source}")]
    Mac {
        /// Device name.
        device: String,
        /// Generator error.
        source: MacError,
    },
    /// Querying the programs attached to the device failed.
    #[error("unable to inspect programs attached to {device}: {source}")]
    Inspect {
        /// Device name.
        device: String,
        /// Kernel error.
        source: KernelError,
    },
    /// A device name was not a legal interface name.
    #[error(transparent)]
    Name(#[from] crate::name::IllegalInterfaceName),
    /// Setting up the geneve device failed.
    #[error("failed to set up geneve device: {0}")]
    SetupGeneve(#[source] Box<DeviceError>),
    /// Setting up the vxlan device failed.
    #[error("failed to set up vxlan device: {0}")]
    SetupVxlan(#[source] Box<DeviceError>),
    /// Setting up an ipip device failed.
    #[error("failed to set up {device}: {source}")]
    SetupIpip {
        /// Device name.
        device: String,
        /// Underlying failure.
        source: Box<DeviceError>,
    },
    /// Removing the device of a mode which is no longer selected failed.
    #[error("failed to remove stale {device}: {source}")]
    RemoveStale {
        /// Device name.
        device: String,
        /// Underlying failure.
        source: Box<DeviceError>,
    },
    /// Renaming a kernel created fallback device failed.
    #[error("failed to rename fallback device {from} to {to}: {source}")]
    RenameFallback {
        /// Name given by the kernel.
        from: String,
        /// Name we wanted.
        to: String,
        /// Underlying failure.
        source: Box<DeviceError>,
    },
}

impl DeviceError {
    /// True iff this error, or the error it wraps, is a device lookup which found nothing.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            DeviceError::Retrieve { source, .. } | DeviceError::Inspect { source, .. } => {
                source.is_not_found()
            }
            DeviceError::SetupGeneve(inner) | DeviceError::SetupVxlan(inner) => {
                inner.is_not_found()
            }
            DeviceError::SetupIpip { source, .. }
            | DeviceError::RemoveStale { source, .. }
            | DeviceError::RenameFallback { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// The kernel module hint, if this error carries one.
    #[must_use]
    pub fn hint(&self) -> Option<&str> {
        match self {
            DeviceError::Unsupported { hint, .. } => Some(hint),
            DeviceError::SetupGeneve(inner) | DeviceError::SetupVxlan(inner) => inner.hint(),
            DeviceError::SetupIpip { source, .. }
            | DeviceError::RemoveStale { source, .. }
            | DeviceError::RenameFallback { source, .. } => source.hint(),
            _ => None,
        }
    }
}
