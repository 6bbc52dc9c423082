// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Fixed names and constants shared with the rest of the datapath.

/// Host facing end of the veth pair.
pub const HOST_DEVICE: &str = "cilium_host";
/// Second (internal) end of the veth pair.
pub const SECOND_HOST_DEVICE: &str = "cilium_net";
/// Geneve overlay device.
pub const GENEVE_DEVICE: &str = "cilium_geneve";
/// VXLAN overlay device.
pub const VXLAN_DEVICE: &str = "cilium_vxlan";
/// IPv4-in-IP tunnel device.
pub const IPIP4_DEVICE: &str = "cilium_ipip4";
/// IP-in-IPv6 tunnel device.
pub const IPIP6_DEVICE: &str = "cilium_ipip6";

/// Fallback device created by the kernel when the `ipip` module loads.
pub const IPIP4_FALLBACK: &str = "tunl0";
/// Name we move [`IPIP4_FALLBACK`] to.
pub const IPIP4_FALLBACK_RENAMED: &str = "cilium_tunl";
/// Fallback device created by the kernel when the `ip6_tunnel` module loads.
pub const IPIP6_FALLBACK: &str = "ip6tnl0";
/// Name we move [`IPIP6_FALLBACK`] to.
pub const IPIP6_FALLBACK_RENAMED: &str = "cilium_ip6tnl";

/// Encapsulation overhead of an IPv4 header.
pub const IPIP4_OVERHEAD: u32 = 20;
/// Encapsulation overhead of an IPv6 header.
pub const IPIP6_OVERHEAD: u32 = 40;

/// Lowest source port the geneve driver uses when no range is configured.
pub const GENEVE_SRC_PORT_LOW: u16 = 1;
/// Highest source port the geneve driver uses when no range is configured.
pub const GENEVE_SRC_PORT_HIGH: u16 = u16::MAX;

/// IANA assigned geneve port.
pub const GENEVE_PORT: u16 = 6081;
/// Linux' historical VXLAN port.
pub const VXLAN_PORT: u16 = 8472;

/// Transmit queue length of the veth pair.
pub const VETH_TX_QUEUE_LEN: u32 = 1000;

/// Default device MTU.
pub const MTU: u32 = 1500;

/// Substring identifying one of our programs in a tc `bpf` filter name.
pub const TC_PROGRAM_MARKER: &str = "cil";
/// Prefix identifying one of our programs attached through tcx or netkit.
pub const LINK_PROGRAM_PREFIX: &str = "cil_";
