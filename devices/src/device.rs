// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Device descriptors and the idempotent "ensure" primitive.
//!
//! [`Manager::ensure_device`] creates a device if it is absent, adopts it if it is present, and
//! converges its up state, forwarding sysctls and MTU.
//! It never deletes anything: structural mismatches (a wrong tunnel port, say) are detected and
//! handled by the mode specific managers in [`crate::tunnel`] and [`crate::base`].

use crate::Manager;
use crate::error::DeviceError;
use crate::kernel::{Kernel, KernelError, Link};
use crate::mac::{Mac, MacGenerator};
use crate::name::InterfaceName;
use sysctl::{Sysctl, SysctlApplier};
use tracing::{debug, warn};

/// Parameters of a UDP based overlay device.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct UdpTunnel {
    /// UDP destination port.
    pub port: u16,
    /// Lowest UDP source port (0 together with `src_port_high` = 0 means kernel default).
    pub src_port_low: u16,
    /// Highest UDP source port.
    pub src_port_high: u16,
    /// Collect metadata (`external`) mode.
    pub flow_based: bool,
}

impl UdpTunnel {
    /// The source port range, or `None` if the kernel should pick.
    #[must_use]
    pub fn src_port_range(&self) -> Option<(u16, u16)> {
        match (self.src_port_low, self.src_port_high) {
            (0, 0) => None,
            range => Some(range),
        }
    }
}

/// The kind specific part of a [`DeviceSpec`].
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum DeviceKind {
    /// A veth pair; the descriptor names the first end.
    Veth {
        /// Name of the other end.
        peer: InterfaceName,
        /// Hardware address of the other end.
        peer_mac: Option<Mac>,
    },
    /// A geneve device.
    Geneve(UdpTunnel),
    /// A vxlan device.
    Vxlan(UdpTunnel),
    /// An IPv4-in-IP device.
    Ipip4 {
        /// Collect metadata (`external`) mode.
        flow_based: bool,
    },
    /// An IP-in-IPv6 device.
    Ipip6 {
        /// Collect metadata (`external`) mode.
        flow_based: bool,
    },
}

impl DeviceKind {
    /// The kernel's `IFLA_INFO_KIND` for this device.
    #[must_use]
    pub const fn kernel_kind(&self) -> &'static str {
        match self {
            DeviceKind::Veth { .. } => "veth",
            DeviceKind::Geneve(_) => "geneve",
            DeviceKind::Vxlan(_) => "vxlan",
            DeviceKind::Ipip4 { .. } => "ipip",
            DeviceKind::Ipip6 { .. } => "ip6tnl",
        }
    }

    /// The kernel module which provides this kind of device.
    #[must_use]
    pub const fn module(&self) -> &'static str {
        match self {
            DeviceKind::Ipip6 { .. } => "ip6_tunnel",
            kind => kind.kernel_kind(),
        }
    }
}

/// The desired state of a network device.
///
/// Descriptors are short lived values built for a single call.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct DeviceSpec {
    /// Canonical name.
    pub name: InterfaceName,
    /// Desired MTU; zero leaves the live MTU untouched.
    pub mtu: u32,
    /// Hardware address to create the device with.
    pub mac: Option<Mac>,
    /// Transmit queue length to create the device with.
    pub tx_queue_len: Option<u32>,
    /// What to create.
    pub kind: DeviceKind,
}

impl DeviceSpec {
    /// A descriptor with no MTU, address or queue length preference.
    #[must_use]
    pub fn new(name: InterfaceName, kind: DeviceKind) -> Self {
        Self {
            name,
            mtu: 0,
            mac: None,
            tx_queue_len: None,
            kind,
        }
    }

    /// Set the desired MTU.
    #[must_use]
    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set the hardware address used on creation.
    #[must_use]
    pub fn with_mac(mut self, mac: Mac) -> Self {
        self.mac = Some(mac);
        self
    }

    /// Set the transmit queue length used on creation.
    #[must_use]
    pub fn with_tx_queue_len(mut self, tx_queue_len: u32) -> Self {
        self.tx_queue_len = Some(tx_queue_len);
        self
    }
}

impl<K: Kernel, S: SysctlApplier, M: MacGenerator> Manager<K, S, M> {
    /// The sysctls applied to every datapath facing device.
    pub(crate) fn forwarding_settings(&self, device: &str) -> Vec<Sysctl> {
        let mut settings = Vec::with_capacity(5);
        if self.families.ipv6 {
            settings.push(Sysctl::new(["net", "ipv6", "conf", device, "forwarding"], "1"));
        }
        if self.families.ipv4 {
            settings.extend([
                Sysctl::new(["net", "ipv4", "conf", device, "forwarding"], "1"),
                Sysctl::new(["net", "ipv4", "conf", device, "rp_filter"], "0"),
                Sysctl::new(["net", "ipv4", "conf", device, "accept_local"], "1"),
                Sysctl::new(["net", "ipv4", "conf", device, "send_redirects"], "0"),
            ]);
        }
        settings
    }

    /// Set `link` up and enable forwarding on it.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::SetUp`] or [`DeviceError::Forwarding`].
    #[tracing::instrument(level = "debug", skip(self, link), fields(device = %link.name))]
    pub async fn enable_forwarding(&self, link: &Link) -> Result<(), DeviceError> {
        if let Err(source) = self.kernel.set_up(link).await {
            warn!(device = %link.name, "could not set up the link: {source}");
            return Err(DeviceError::SetUp {
                device: link.name.clone(),
                source,
            });
        }
        self.sysctl
            .apply_settings(&self.forwarding_settings(&link.name))
            .map_err(|source| DeviceError::Forwarding {
                device: link.name.clone(),
                source,
            })
    }

    /// Look up a link which must exist.
    pub(crate) async fn lookup(&self, name: &InterfaceName) -> Result<Link, DeviceError> {
        self.kernel
            .link_by_name(name)
            .await
            .map_err(|source| DeviceError::Retrieve {
                device: name.to_string(),
                source,
            })
    }

    /// Look up a link which may legitimately be absent.
    pub(crate) async fn find(&self, name: &InterfaceName) -> Result<Option<Link>, DeviceError> {
        match self.kernel.link_by_name(name).await {
            Ok(link) => Ok(Some(link)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(source) => Err(DeviceError::Retrieve {
                device: name.to_string(),
                source,
            }),
        }
    }

    pub(crate) async fn create(&self, spec: &DeviceSpec) -> Result<(), DeviceError> {
        debug!(device = %spec.name, kind = spec.kind.kernel_kind(), "creating device");
        self.kernel
            .add_link(spec)
            .await
            .map_err(|source| match source {
                KernelError::Unsupported(_) => DeviceError::Unsupported {
                    device: spec.name.to_string(),
                    hint: format!(
                        "maybe kernel module for {} is not available?",
                        spec.kind.module()
                    ),
                    source,
                },
                source => DeviceError::Create {
                    device: spec.name.to_string(),
                    source,
                },
            })
    }

    /// Make sure a device matching `spec` by name exists, is up, forwards, and has the MTU of
    /// `spec`.
    ///
    /// An existing device is adopted as is; it is never deleted and recreated here.
    /// Returns the link as observed by the kernel, with the converged MTU.
    ///
    /// # Errors
    ///
    /// Returns a [`DeviceError`] naming the device and the step which failed.
    #[tracing::instrument(level = "debug", skip(self, spec), fields(device = %spec.name))]
    pub async fn ensure_device(&self, spec: &DeviceSpec) -> Result<Link, DeviceError> {
        if self.find(&spec.name).await?.is_none() {
            self.create(spec).await?;
        }
        // creation does not hand back the device, and an adopted device may have changed since
        let link = self.lookup(&spec.name).await?;
        self.enable_forwarding(&link).await?;
        if spec.mtu != 0 && spec.mtu != link.mtu {
            debug!(device = %spec.name, from = link.mtu, to = spec.mtu, "setting mtu");
            self.kernel
                .set_mtu(&link, spec.mtu)
                .await
                .map_err(|source| DeviceError::SetMtu {
                    device: spec.name.to_string(),
                    mtu: spec.mtu,
                    source,
                })?;
        }
        // report the device as it now is, not as it was before being set up
        self.lookup(&spec.name).await
    }

    /// Delete the device called `name`.
    ///
    /// A device which does not exist is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Retrieve`] or [`DeviceError::Delete`].
    pub async fn remove_device(&self, name: &InterfaceName) -> Result<(), DeviceError> {
        let Some(link) = self.find(name).await? else {
            return Ok(());
        };
        self.delete(&link).await
    }

    pub(crate) async fn delete(&self, link: &Link) -> Result<(), DeviceError> {
        debug!(device = %link.name, "deleting device");
        match self.kernel.del_link(link).await {
            Err(err) if err.is_not_found() => Ok(()),
            Err(source) => Err(DeviceError::Delete {
                device: link.name.clone(),
                source,
            }),
            Ok(()) => Ok(()),
        }
    }

    /// Rename the device called `from` to `to`.
    ///
    /// A device which does not exist is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Retrieve`] or [`DeviceError::Rename`].
    pub async fn rename_device(
        &self,
        from: &InterfaceName,
        to: &InterfaceName,
    ) -> Result<(), DeviceError> {
        let Some(link) = self.find(from).await? else {
            return Ok(());
        };
        debug!(device = %from, to = %to, "renaming device");
        match self.kernel.set_name(&link, to).await {
            Err(err) if err.is_not_found() => Ok(()),
            Err(source) => Err(DeviceError::Rename {
                from: from.to_string(),
                to: to.to_string(),
                source,
            }),
            Ok(()) => Ok(()),
        }
    }

    pub(crate) fn generate_mac(&self, device: &InterfaceName) -> Result<Mac, DeviceError> {
        self.mac.generate().map_err(|source| DeviceError::Mac {
            device: device.to_string(),
            source,
        })
    }
}
