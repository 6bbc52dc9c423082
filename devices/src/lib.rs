// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Reconcile the network devices the datapath needs with the state of the kernel.
//!
//! The datapath needs a veth pair towards its virtual router and, depending on the configured
//! encapsulation, a geneve, vxlan or ipip tunnel device.
//! Every operation here re-reads the kernel before acting, so all of them are safe to call again
//! after a partial failure: the next pass picks up where the last one stopped.
//!
//! Operations are not atomic with respect to one another.
//! Run at most one [`Manager`] per network namespace.

#![deny(
    unsafe_code,
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

pub mod attach;
pub mod base;
pub mod config;
pub mod defaults;
pub mod device;
pub mod error;
pub mod kernel;
pub mod mac;
pub mod name;
pub mod reconcile;
pub mod tunnel;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{DatapathConfig, DatapathConfigBuilder, IpFamilies};
pub use error::DeviceError;
pub use name::InterfaceName;
pub use tunnel::TunnelMode;

use crate::kernel::Kernel;
use crate::mac::{MacGenerator, RandomMac};
use sysctl::{ProcSysctl, SysctlApplier};

/// `Manager` is the primary entry point to device reconciliation logic.
///
/// It bundles the three capabilities reconciliation consumes: the kernel link inventory `K`, a
/// sysctl applier `S` and a source of hardware addresses `M`.
/// It holds no state about devices; the kernel is the only source of truth.
#[derive(Clone, Debug)]
pub struct Manager<K, S = ProcSysctl, M = RandomMac> {
    kernel: K,
    sysctl: S,
    mac: M,
    families: IpFamilies,
}

impl<K: Kernel, S: SysctlApplier> Manager<K, S, RandomMac> {
    /// Create a new `Manager` which generates random hardware addresses.
    #[must_use]
    pub fn new(kernel: K, sysctl: S, families: IpFamilies) -> Self {
        Self::with_mac_generator(kernel, sysctl, RandomMac, families)
    }
}

impl<K: Kernel, S: SysctlApplier, M: MacGenerator> Manager<K, S, M> {
    /// Create a new `Manager` with an explicit source of hardware addresses.
    #[must_use]
    pub fn with_mac_generator(kernel: K, sysctl: S, mac: M, families: IpFamilies) -> Self {
        Manager {
            kernel,
            sysctl,
            mac,
            families,
        }
    }

    /// The kernel this manager operates on.
    #[must_use]
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// The sysctl applier this manager uses.
    #[must_use]
    pub fn sysctl(&self) -> &S {
        &self.sysctl
    }
}
