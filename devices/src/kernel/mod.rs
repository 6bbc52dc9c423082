// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The narrow view of the kernel which device reconciliation needs.
//!
//! [`Kernel`] is implemented by [`NetlinkKernel`] for real network namespaces and by
//! `testing::FakeKernel` for unit tests.

mod bpf;
mod netlink;

pub use netlink::NetlinkKernel;

use crate::device::DeviceSpec;
use crate::mac::Mac;
use crate::name::InterfaceName;
use ipnet::IpNet;
use nix::errno::Errno;
use std::fmt::{Display, Formatter};
use std::future::Future;

/// Errors reported by a [`Kernel`].
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// No link with the given name exists.
    #[error("link {0} not found")]
    NotFound(String),
    /// The kernel does not support the requested operation (`EOPNOTSUPP`).
    ///
    /// For device creation this usually means a kernel module is missing.
    #[error("operation not supported: {0}")]
    Unsupported(Errno),
    /// Any other errno.
    #[error("{0}")]
    Errno(Errno),
    /// The netlink transport itself failed.
    #[error("netlink error: {0}")]
    Netlink(String),
    /// The kernel answered with something we could not interpret.
    #[error("malformed kernel response: {0}")]
    Malformed(String),
}

impl KernelError {
    /// Classify a raw errno value.
    #[must_use]
    pub fn from_errno(errno: Errno, name: &str) -> Self {
        match errno {
            Errno::ENODEV => KernelError::NotFound(name.to_string()),
            Errno::EOPNOTSUPP => KernelError::Unsupported(errno),
            _ => KernelError::Errno(errno),
        }
    }

    /// True iff this error means the link does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, KernelError::NotFound(_))
    }
}

/// Source and destination UDP ports of an observed geneve or vxlan device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UdpTunnelInfo {
    /// Destination port.
    pub port: u16,
    /// Source port range, if the kernel reports one.
    pub src_port_range: Option<(u16, u16)>,
}

/// The type of an observed link.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LinkKind {
    /// One end of a veth pair.
    Veth,
    /// A geneve device.
    Geneve(UdpTunnelInfo),
    /// A vxlan device.
    Vxlan(UdpTunnelInfo),
    /// An `ipip` device.
    Ipip4,
    /// An `ip6tnl` device.
    Ipip6,
    /// Anything else, by kernel kind name if known.
    Other(Option<String>),
}

/// A link as observed in the kernel.
///
/// Observations are never cached; every reconciliation pass asks the kernel again.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Link {
    /// The kernel assigned interface index.
    pub index: u32,
    /// The interface name.
    pub name: String,
    /// Current MTU.
    pub mtu: u32,
    /// Hardware address, if the device has one.
    pub mac: Option<Mac>,
    /// Administratively up.
    pub up: bool,
    /// ARP enabled (i.e. `IFF_NOARP` not set).
    pub arp: bool,
    /// What sort of device this is.
    pub kind: LinkKind,
}

/// The parent handle of the clsact hook a tc filter hangs from.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub enum TcParent {
    /// `ffff:fff2`
    Ingress,
    /// `ffff:fff3`
    Egress,
}

impl TcParent {
    /// The raw 32 bit handle.
    #[must_use]
    pub const fn handle(self) -> u32 {
        match self {
            TcParent::Ingress => 0xFFFF_FFF2,
            TcParent::Egress => 0xFFFF_FFF3,
        }
    }
}

/// A tc filter as reported by the kernel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TcFilter {
    /// The classifier kind, e.g. `bpf` or `flower`.
    pub kind: String,
    /// For `bpf` filters, the name of the attached program.
    pub name: Option<String>,
}

/// Link based attach points for programs which don't go through tc filters.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub enum AttachPoint {
    /// tcx ingress.
    TcxIngress,
    /// tcx egress.
    TcxEgress,
    /// The primary (host side) end of a netkit pair.
    NetkitPrimary,
    /// The peer end of a netkit pair.
    NetkitPeer,
}

impl AttachPoint {
    /// The kernel's `enum bpf_attach_type` value.
    #[must_use]
    pub const fn bpf_attach_type(self) -> u32 {
        match self {
            AttachPoint::TcxIngress => 46,
            AttachPoint::TcxEgress => 47,
            AttachPoint::NetkitPrimary => 54,
            AttachPoint::NetkitPeer => 55,
        }
    }
}

impl Display for AttachPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AttachPoint::TcxIngress => "tcx-ingress",
            AttachPoint::TcxEgress => "tcx-egress",
            AttachPoint::NetkitPrimary => "netkit-primary",
            AttachPoint::NetkitPeer => "netkit-peer",
        })
    }
}

/// A program attached to a link based attach point.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttachedProgram {
    /// Kernel program id.
    pub id: u32,
    /// Program name (at most 15 bytes, as truncated by the kernel).
    pub name: String,
}

/// Kernel link inventory.
///
/// Every method is a single blocking round trip to the kernel with no retry and no timeout;
/// callers own that policy.
pub trait Kernel {
    /// Look up a link by name.
    ///
    /// Returns [`KernelError::NotFound`] if no such link exists.
    fn link_by_name(
        &self,
        name: &InterfaceName,
    ) -> impl Future<Output = Result<Link, KernelError>> + Send;

    /// Create the link described by `spec`.
    ///
    /// Does not return the created link; look it up again by name.
    fn add_link(&self, spec: &DeviceSpec) -> impl Future<Output = Result<(), KernelError>> + Send;

    /// Delete a link.
    fn del_link(&self, link: &Link) -> impl Future<Output = Result<(), KernelError>> + Send;

    /// Rename a link.
    fn set_name(
        &self,
        link: &Link,
        name: &InterfaceName,
    ) -> impl Future<Output = Result<(), KernelError>> + Send;

    /// Set a link administratively up.
    fn set_up(&self, link: &Link) -> impl Future<Output = Result<(), KernelError>> + Send;

    /// Set the MTU of a link.
    fn set_mtu(&self, link: &Link, mtu: u32)
    -> impl Future<Output = Result<(), KernelError>> + Send;

    /// Disable ARP on a link.
    fn set_arp_off(&self, link: &Link) -> impl Future<Output = Result<(), KernelError>> + Send;

    /// Add `address` to a link, replacing an existing entry for the same prefix.
    fn replace_address(
        &self,
        link: &Link,
        address: IpNet,
    ) -> impl Future<Output = Result<(), KernelError>> + Send;

    /// List the tc filters hanging from `parent` on a link.
    fn filters(
        &self,
        link: &Link,
        parent: TcParent,
    ) -> impl Future<Output = Result<Vec<TcFilter>, KernelError>> + Send;

    /// List the programs attached to a link through `attach`.
    ///
    /// Kernels without support for `attach` report no programs rather than an error.
    fn attached_programs(
        &self,
        link: &Link,
        attach: AttachPoint,
    ) -> impl Future<Output = Result<Vec<AttachedProgram>, KernelError>> + Send;
}
