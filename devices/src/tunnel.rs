// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Overlay tunnel devices.
//!
//! At most one of `cilium_geneve` and `cilium_vxlan` exists at a time.
//! Neither driver allows changing the destination port of an existing device, so a port mismatch
//! is repaired by deleting and recreating the device.
//! The source port range is only a hint at creation time; a mismatch is logged and left alone.

use crate::Manager;
use crate::defaults;
use crate::device::{DeviceKind, DeviceSpec, UdpTunnel};
use crate::error::DeviceError;
use crate::kernel::{Kernel, Link, LinkKind, UdpTunnelInfo};
use crate::mac::MacGenerator;
use crate::name::InterfaceName;
use crate::reconcile::TunnelParams;
use serde::{Deserialize, Serialize};
use sysctl::SysctlApplier;
use tracing::{debug, info};

/// Overlay encapsulation.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    PartialEq,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TunnelMode {
    /// Native routing; no tunnel device.
    #[default]
    None,
    /// Geneve.
    Geneve,
    /// VXLAN.
    Vxlan,
}

impl TunnelMode {
    /// The destination port used when none is configured.
    ///
    /// Zero for [`TunnelMode::None`].
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            TunnelMode::None => 0,
            TunnelMode::Geneve => defaults::GENEVE_PORT,
            TunnelMode::Vxlan => defaults::VXLAN_PORT,
        }
    }
}

/// The source port range the geneve driver uses for `(low, high)`.
///
/// The driver treats an unset range as the full `[1, 65535]`; normalizing up front makes the
/// desired range comparable to what the kernel reports.
#[must_use]
pub const fn geneve_source_range(low: u16, high: u16) -> (u16, u16) {
    match (low, high) {
        (0, 0) => (defaults::GENEVE_SRC_PORT_LOW, defaults::GENEVE_SRC_PORT_HIGH),
        range => range,
    }
}

fn format_range((low, high): (u16, u16)) -> String {
    format!("({low}-{high})")
}

/// The fixed names and overhead of one IP family's ipip device.
struct IpipFamily {
    device: &'static str,
    overhead: u32,
    fallback: &'static str,
    renamed: &'static str,
}

const IPIP4: IpipFamily = IpipFamily {
    device: defaults::IPIP4_DEVICE,
    overhead: defaults::IPIP4_OVERHEAD,
    fallback: defaults::IPIP4_FALLBACK,
    renamed: defaults::IPIP4_FALLBACK_RENAMED,
};

const IPIP6: IpipFamily = IpipFamily {
    device: defaults::IPIP6_DEVICE,
    overhead: defaults::IPIP6_OVERHEAD,
    fallback: defaults::IPIP6_FALLBACK,
    renamed: defaults::IPIP6_FALLBACK_RENAMED,
};

impl<K: Kernel, S: SysctlApplier, M: MacGenerator> Manager<K, S, M> {
    /// Make sure the device of `mode` exists with the given parameters and that the device of any
    /// other mode is gone.
    ///
    /// # Errors
    ///
    /// Returns the first failing step; devices handled before it stay as they are.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn setup_tunnel(
        &self,
        mode: TunnelMode,
        params: &TunnelParams,
    ) -> Result<(), DeviceError> {
        match mode {
            TunnelMode::Geneve => {
                self.setup_geneve(params)
                    .await
                    .map_err(|err| DeviceError::SetupGeneve(Box::new(err)))?;
                self.remove_stale(defaults::VXLAN_DEVICE).await
            }
            TunnelMode::Vxlan => {
                self.setup_vxlan(params)
                    .await
                    .map_err(|err| DeviceError::SetupVxlan(Box::new(err)))?;
                self.remove_stale(defaults::GENEVE_DEVICE).await
            }
            TunnelMode::None => {
                self.remove_stale(defaults::VXLAN_DEVICE).await?;
                self.remove_stale(defaults::GENEVE_DEVICE).await
            }
        }
    }

    async fn remove_stale(&self, device: &'static str) -> Result<(), DeviceError> {
        self.remove_device(&InterfaceName::fixed(device))
            .await
            .map_err(|err| DeviceError::RemoveStale {
                device: device.to_string(),
                source: Box::new(err),
            })
    }

    /// Delete a device which has the canonical name but is not of the expected kind, or, if
    /// `port` is given, has a different destination port.
    async fn evict(
        &self,
        name: &InterfaceName,
        expected: fn(&LinkKind) -> Option<UdpTunnelInfo>,
        port: Option<u16>,
    ) -> Result<(), DeviceError> {
        let Some(link) = self.find(name).await? else {
            return Ok(());
        };
        match (expected(&link.kind), port) {
            (Some(info), Some(port)) if info.port != port => {
                debug!(device = %name, have = info.port, want = port, "deleting outdated device");
                self.delete(&link).await
            }
            (Some(_), _) => Ok(()),
            (None, _) => {
                debug!(device = %name, kind = ?link.kind, "deleting device of unexpected kind");
                self.delete(&link).await
            }
        }
    }

    fn tunnel_spec(
        &self,
        name: &InterfaceName,
        kind: fn(UdpTunnel) -> DeviceKind,
        tunnel: UdpTunnel,
        mtu: u32,
    ) -> Result<DeviceSpec, DeviceError> {
        Ok(DeviceSpec::new(name.clone(), kind(tunnel))
            .with_mtu(mtu)
            .with_mac(self.generate_mac(name)?))
    }

    /// Changing the destination port recreates the device; changing the MTU does not.
    async fn setup_geneve(&self, params: &TunnelParams) -> Result<(), DeviceError> {
        let name = InterfaceName::fixed(defaults::GENEVE_DEVICE);
        let (src_port_low, src_port_high) =
            geneve_source_range(params.src_port_low, params.src_port_high);
        let tunnel = UdpTunnel {
            port: params.port,
            src_port_low,
            src_port_high,
            flow_based: true,
        };
        let spec = self.tunnel_spec(&name, DeviceKind::Geneve, tunnel, params.mtu)?;

        // something else squatting on our name can't be adopted
        self.evict(&name, geneve_info, None).await?;
        let mut link = self.ensure_device(&spec).await?;
        if geneve_info(&link.kind).is_some_and(|info| info.port != params.port) {
            self.delete(&link).await?;
            link = self.ensure_device(&spec).await?;
        }
        log_ignored_range(&link, geneve_info, (src_port_low, src_port_high));
        Ok(())
    }

    /// Changing the port recreates the device; changing the MTU does not.
    ///
    /// Several vxlan devices may share a destination port as long as only one is up, so an
    /// outdated device is deleted before ensuring lest it be adopted.
    async fn setup_vxlan(&self, params: &TunnelParams) -> Result<(), DeviceError> {
        let name = InterfaceName::fixed(defaults::VXLAN_DEVICE);
        let tunnel = UdpTunnel {
            port: params.port,
            src_port_low: params.src_port_low,
            src_port_high: params.src_port_high,
            flow_based: true,
        };
        let spec = self.tunnel_spec(&name, DeviceKind::Vxlan, tunnel, params.mtu)?;
        self.evict(&name, vxlan_info, Some(params.port)).await?;
        let link = self.ensure_device(&spec).await?;
        log_ignored_range(
            &link,
            vxlan_info,
            (params.src_port_low, params.src_port_high),
        );
        Ok(())
    }

    /// Make sure `cilium_ipip4` and `cilium_ipip6` exist in flow based mode if their family is
    /// enabled, and are absent otherwise.
    ///
    /// Creating the first ipip (ip6tnl) device may load the `ipip` (`ip6_tunnel`) module, which
    /// makes the kernel create its catch-all `tunl0` (`ip6tnl0`) device.
    /// We rename those to `cilium_tunl` (`cilium_ip6tnl`) to signal that we own the
    /// encapsulation stack of this host, but never use them for traffic.
    ///
    /// # Errors
    ///
    /// Returns the first failing step, including a failure to rename a fallback device.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn setup_ipip(&self, ipv4: bool, ipv6: bool, mtu: u32) -> Result<(), DeviceError> {
        self.setup_ipip_family(&IPIP4, ipv4, DeviceKind::Ipip4 { flow_based: true }, mtu)
            .await?;
        self.setup_ipip_family(&IPIP6, ipv6, DeviceKind::Ipip6 { flow_based: true }, mtu)
            .await
    }

    async fn setup_ipip_family(
        &self,
        family: &IpipFamily,
        enabled: bool,
        kind: DeviceKind,
        mtu: u32,
    ) -> Result<(), DeviceError> {
        if !enabled {
            return self.remove_stale(family.device).await;
        }
        let name = InterfaceName::fixed(family.device);
        let spec = DeviceSpec::new(name, kind).with_mtu(mtu.saturating_sub(family.overhead));
        self.ensure_device(&spec)
            .await
            .map_err(|err| DeviceError::SetupIpip {
                device: family.device.to_string(),
                source: Box::new(err),
            })?;

        let fallback = InterfaceName::fixed(family.fallback);
        let renamed = InterfaceName::fixed(family.renamed);
        self.rename_device(&fallback, &renamed)
            .await
            .map_err(|err| DeviceError::RenameFallback {
                from: family.fallback.to_string(),
                to: family.renamed.to_string(),
                source: Box::new(err),
            })
    }
}

fn geneve_info(kind: &LinkKind) -> Option<UdpTunnelInfo> {
    match kind {
        LinkKind::Geneve(info) => Some(*info),
        _ => None,
    }
}

fn vxlan_info(kind: &LinkKind) -> Option<UdpTunnelInfo> {
    match kind {
        LinkKind::Vxlan(info) => Some(*info),
        _ => None,
    }
}

fn log_ignored_range(
    link: &Link,
    info: fn(&LinkKind) -> Option<UdpTunnelInfo>,
    wanted: (u16, u16),
) {
    let Some(range) = info(&link.kind).and_then(|info| info.src_port_range) else {
        return;
    };
    if range != wanted {
        info!(
            device = %link.name,
            hint = %format_range(wanted),
            range = %format_range(range),
            "source port range hint ignored given device already exists"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::{TunnelMode, geneve_source_range};
    use crate::defaults;
    use crate::device::{DeviceKind, UdpTunnel};
    use crate::error::DeviceError;
    use crate::kernel::{LinkKind, UdpTunnelInfo};
    use crate::reconcile::TunnelParams;
    use crate::testing::{FakeKernel, Op, manager};
    use nix::errno::Errno;
    use pretty_assertions::assert_eq;
    use std::str::FromStr;
    use tracing_test::traced_test;

    fn params(port: u16) -> TunnelParams {
        TunnelParams {
            port,
            src_port_low: 0,
            src_port_high: 0,
            mtu: 1450,
        }
    }

    fn port_of(kernel: &FakeKernel, name: &str) -> Option<u16> {
        match kernel.link(name)?.kind {
            LinkKind::Geneve(info) | LinkKind::Vxlan(info) => Some(info.port),
            _ => None,
        }
    }

    #[test]
    fn zero_range_means_full_range() {
        assert_eq!(geneve_source_range(0, 0), (1, 65535));
        assert_eq!(geneve_source_range(0, 10), (0, 10));
        assert_eq!(geneve_source_range(2000, 3000), (2000, 3000));
    }

    #[test]
    fn normalized_range_is_never_unset() {
        bolero::check!()
            .with_type::<(u16, u16)>()
            .for_each(|&(low, high)| {
                let range = geneve_source_range(low, high);
                assert_ne!(range, (0, 0));
                if (low, high) != (0, 0) {
                    assert_eq!(range, (low, high));
                }
            });
    }

    #[test]
    fn mode_names() {
        assert_eq!(TunnelMode::from_str("vxlan").unwrap(), TunnelMode::Vxlan);
        assert_eq!(TunnelMode::Geneve.to_string(), "geneve");
        assert_eq!(TunnelMode::default(), TunnelMode::None);
        assert!(TunnelMode::from_str("gre").is_err());
    }

    #[tokio::test]
    async fn geneve_is_created_flow_based_with_full_source_range() {
        let manager = manager(FakeKernel::default());
        manager
            .setup_tunnel(TunnelMode::Geneve, &params(6081))
            .await
            .unwrap();
        let created = manager.kernel().created();
        assert_eq!(created.len(), 1);
        assert_eq!(
            created[0].kind,
            DeviceKind::Geneve(UdpTunnel {
                port: 6081,
                src_port_low: 1,
                src_port_high: 65535,
                flow_based: true,
            })
        );
        let link = manager.kernel().link(defaults::GENEVE_DEVICE).unwrap();
        assert_eq!(link.mtu, 1450);
        assert!(link.up);
    }

    #[tokio::test]
    async fn geneve_port_change_recreates_device() {
        let manager = manager(FakeKernel::default());
        manager
            .setup_tunnel(TunnelMode::Geneve, &params(6081))
            .await
            .unwrap();
        let before = manager.kernel().link(defaults::GENEVE_DEVICE).unwrap();
        manager
            .setup_tunnel(TunnelMode::Geneve, &params(6082))
            .await
            .unwrap();
        let after = manager.kernel().link(defaults::GENEVE_DEVICE).unwrap();
        assert_eq!(port_of(manager.kernel(), defaults::GENEVE_DEVICE), Some(6082));
        assert_ne!(before.mac, after.mac);
        assert_ne!(before.index, after.index);
        assert_eq!(manager.kernel().count(Op::Del), 1);
        assert_eq!(manager.kernel().names(), vec![defaults::GENEVE_DEVICE]);
    }

    #[tokio::test]
    async fn geneve_mtu_change_keeps_device() {
        let manager = manager(FakeKernel::default());
        manager
            .setup_tunnel(TunnelMode::Geneve, &params(6081))
            .await
            .unwrap();
        let params = TunnelParams {
            mtu: 9000,
            ..params(6081)
        };
        manager
            .setup_tunnel(TunnelMode::Geneve, &params)
            .await
            .unwrap();
        assert_eq!(manager.kernel().count(Op::Add), 1);
        assert_eq!(
            manager.kernel().link(defaults::GENEVE_DEVICE).unwrap().mtu,
            9000
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn geneve_source_range_mismatch_is_only_logged() {
        let manager = manager(FakeKernel::default());
        manager
            .setup_tunnel(TunnelMode::Geneve, &params(6081))
            .await
            .unwrap();
        let params = TunnelParams {
            src_port_low: 1000,
            src_port_high: 2000,
            ..params(6081)
        };
        manager
            .setup_tunnel(TunnelMode::Geneve, &params)
            .await
            .unwrap();
        assert_eq!(manager.kernel().count(Op::Add), 1);
        assert!(logs_contain("source port range hint ignored"));
        assert!(logs_contain("(1000-2000)"));
        assert!(logs_contain("(1-65535)"));
    }

    #[tokio::test]
    async fn vxlan_with_other_port_is_deleted_before_ensuring() {
        let kernel = FakeKernel::default();
        let stale = kernel.seed(
            defaults::VXLAN_DEVICE,
            1500,
            LinkKind::Vxlan(UdpTunnelInfo {
                port: 4789,
                src_port_range: Some((0, 0)),
            }),
        );
        let manager = manager(kernel);
        manager
            .setup_tunnel(TunnelMode::Vxlan, &params(8472))
            .await
            .unwrap();
        let live = manager.kernel().link(defaults::VXLAN_DEVICE).unwrap();
        assert_ne!(live.index, stale.index);
        assert_eq!(port_of(manager.kernel(), defaults::VXLAN_DEVICE), Some(8472));
        assert_eq!(manager.kernel().count(Op::Del), 1);
        assert_eq!(manager.kernel().count(Op::Add), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn vxlan_source_range_mismatch_keeps_device_and_range() {
        let manager = manager(FakeKernel::default());
        let first = TunnelParams {
            src_port_low: 30000,
            src_port_high: 40000,
            ..params(8472)
        };
        manager
            .setup_tunnel(TunnelMode::Vxlan, &first)
            .await
            .unwrap();
        assert!(!logs_contain("source port range hint ignored"));
        let second = TunnelParams {
            src_port_low: 50000,
            src_port_high: 60000,
            ..first
        };
        manager
            .setup_tunnel(TunnelMode::Vxlan, &second)
            .await
            .unwrap();
        assert_eq!(manager.kernel().count(Op::Add), 1);
        assert_eq!(manager.kernel().count(Op::Del), 0);
        let live = manager.kernel().link(defaults::VXLAN_DEVICE).unwrap();
        assert_eq!(
            live.kind,
            LinkKind::Vxlan(UdpTunnelInfo {
                port: 8472,
                src_port_range: Some((30000, 40000)),
            })
        );
        assert!(logs_contain("source port range hint ignored"));
    }

    #[tokio::test]
    async fn foreign_device_under_tunnel_name_is_replaced() {
        let kernel = FakeKernel::default();
        kernel.seed(
            defaults::GENEVE_DEVICE,
            1500,
            LinkKind::Other(Some("dummy".to_string())),
        );
        let manager = manager(kernel);
        manager
            .setup_tunnel(TunnelMode::Geneve, &params(6081))
            .await
            .unwrap();
        assert_eq!(port_of(manager.kernel(), defaults::GENEVE_DEVICE), Some(6081));
    }

    #[tokio::test]
    async fn modes_are_mutually_exclusive() {
        let manager = manager(FakeKernel::default());
        manager
            .setup_tunnel(TunnelMode::Geneve, &params(6081))
            .await
            .unwrap();
        manager
            .setup_tunnel(TunnelMode::Vxlan, &params(8472))
            .await
            .unwrap();
        assert_eq!(manager.kernel().names(), vec![defaults::VXLAN_DEVICE]);
        manager
            .setup_tunnel(TunnelMode::Geneve, &params(6081))
            .await
            .unwrap();
        assert_eq!(manager.kernel().names(), vec![defaults::GENEVE_DEVICE]);
        manager
            .setup_tunnel(TunnelMode::None, &params(0))
            .await
            .unwrap();
        assert!(manager.kernel().names().is_empty());
        // and again, with nothing left to remove
        manager
            .setup_tunnel(TunnelMode::None, &params(0))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn geneve_failure_is_attributed() {
        let kernel = FakeKernel::default();
        kernel.unsupported("geneve");
        let manager = manager(kernel);
        let err = manager
            .setup_tunnel(TunnelMode::Geneve, &params(6081))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::SetupGeneve(_)));
        assert_eq!(
            err.hint(),
            Some("maybe kernel module for geneve is not available?")
        );
    }

    #[tokio::test]
    async fn ipip_mtu_accounts_for_overhead() {
        let manager = manager(FakeKernel::default());
        manager.setup_ipip(true, true, 1500).await.unwrap();
        let v4 = manager.kernel().link(defaults::IPIP4_DEVICE).unwrap();
        let v6 = manager.kernel().link(defaults::IPIP6_DEVICE).unwrap();
        assert_eq!(v4.mtu, 1500 - defaults::IPIP4_OVERHEAD);
        assert_eq!(v6.mtu, 1500 - defaults::IPIP6_OVERHEAD);
        assert!(v4.up && v6.up);
        assert!(manager.kernel().created().iter().all(|spec| matches!(
            spec.kind,
            DeviceKind::Ipip4 { flow_based: true } | DeviceKind::Ipip6 { flow_based: true }
        )));
    }

    #[tokio::test]
    async fn ipip_fallback_devices_are_renamed() {
        let manager = manager(FakeKernel::default());
        manager.setup_ipip(true, true, 1500).await.unwrap();
        assert_eq!(
            manager.kernel().names(),
            vec![
                defaults::IPIP6_FALLBACK_RENAMED,
                defaults::IPIP4_DEVICE,
                defaults::IPIP6_DEVICE,
                defaults::IPIP4_FALLBACK_RENAMED,
            ]
        );
        // idempotent: nothing left to rename, nothing to create
        manager.setup_ipip(true, true, 1500).await.unwrap();
        assert_eq!(manager.kernel().count(Op::Add), 2);
        assert_eq!(manager.kernel().count(Op::SetName), 2);
    }

    #[tokio::test]
    async fn missing_fallback_device_is_fine() {
        let manager = manager(FakeKernel::default().without_fallback_devices());
        manager.setup_ipip(true, false, 1500).await.unwrap();
        assert_eq!(manager.kernel().names(), vec![defaults::IPIP4_DEVICE]);
    }

    #[tokio::test]
    async fn fallback_rename_failure_is_fatal() {
        let kernel = FakeKernel::default();
        kernel.fail(Op::SetName, defaults::IPIP4_FALLBACK, Errno::EBUSY);
        let manager = manager(kernel);
        let err = manager.setup_ipip(true, true, 1500).await.unwrap_err();
        assert!(matches!(err, DeviceError::RenameFallback { ref from, .. } if from == "tunl0"));
        // the ipv6 device was never attempted
        assert!(manager.kernel().link(defaults::IPIP6_DEVICE).is_none());
    }

    #[tokio::test]
    async fn disabled_family_removes_its_device() {
        let manager = manager(FakeKernel::default());
        manager.setup_ipip(true, true, 1500).await.unwrap();
        manager.setup_ipip(false, true, 1500).await.unwrap();
        assert!(manager.kernel().link(defaults::IPIP4_DEVICE).is_none());
        assert!(manager.kernel().link(defaults::IPIP6_DEVICE).is_some());
        // fallback devices belong to the kernel and stay
        assert!(
            manager
                .kernel()
                .link(defaults::IPIP4_FALLBACK_RENAMED)
                .is_some()
        );
    }
}
