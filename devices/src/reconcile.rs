// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Top level dispatch on the desired tunnel mode.
//!
//! A pass either converges or fails; it is never rolled back.
//! A pass which fails after removing the device of the old mode but before creating the device of
//! the new one leaves the namespace without a tunnel until the next pass, which starts over from
//! whatever the kernel reports.

use crate::Manager;
use crate::error::DeviceError;
use crate::kernel::Kernel;
use crate::mac::MacGenerator;
use crate::tunnel::TunnelMode;
use sysctl::SysctlApplier;
use tracing::info;

/// Parameters of the tunnel device.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TunnelParams {
    /// UDP destination port.
    pub port: u16,
    /// Lowest UDP source port; `(0, 0)` lets the kernel pick.
    pub src_port_low: u16,
    /// Highest UDP source port.
    pub src_port_high: u16,
    /// Device MTU.
    pub mtu: u32,
}

impl<K: Kernel, S: SysctlApplier, M: MacGenerator> Manager<K, S, M> {
    /// Bring the tunnel devices in line with `mode`.
    ///
    /// The mode is passed in for every pass rather than held by the manager, so a restart with a
    /// different mode converges to it on the first pass.
    ///
    /// # Errors
    ///
    /// Returns the [`DeviceError`] of the first failing step.
    #[tracing::instrument(level = "info", skip_all, fields(%mode))]
    pub async fn reconcile(
        &self,
        mode: TunnelMode,
        params: &TunnelParams,
    ) -> Result<(), DeviceError> {
        self.setup_tunnel(mode, params).await?;
        info!(%mode, port = params.port, mtu = params.mtu, "tunnel devices reconciled");
        Ok(())
    }
}
