// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The `cilium_host` / `cilium_net` veth pair.

use crate::Manager;
use crate::defaults;
use crate::device::{DeviceKind, DeviceSpec};
use crate::error::DeviceError;
use crate::kernel::{Kernel, Link};
use crate::mac::MacGenerator;
use crate::name::InterfaceName;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{Ipv4Addr, Ipv6Addr};
use sysctl::SysctlApplier;
use tracing::debug;

impl<K: Kernel, S: SysctlApplier, M: MacGenerator> Manager<K, S, M> {
    /// Make sure the veth pair `host` <-> `peer` exists and forwards.
    ///
    /// A missing pair is created with fresh hardware addresses on both ends.
    async fn setup_veth_pair(
        &self,
        host: &InterfaceName,
        peer: &InterfaceName,
    ) -> Result<(), DeviceError> {
        if self.find(host).await?.is_none() {
            let spec = DeviceSpec::new(
                host.clone(),
                DeviceKind::Veth {
                    peer: peer.clone(),
                    peer_mac: Some(self.generate_mac(peer)?),
                },
            )
            .with_mac(self.generate_mac(host)?)
            .with_tx_queue_len(defaults::VETH_TX_QUEUE_LEN);
            self.create(&spec).await?;
        }
        let host = self.lookup(host).await?;
        self.enable_forwarding(&host).await?;
        let peer = self.lookup(peer).await?;
        self.enable_forwarding(&peer).await
    }

    /// Bring up the veth pair the datapath starts from: `cilium_host` and `cilium_net`.
    ///
    /// Both ends carry only programmatically routed traffic, so ARP is disabled on them, and both
    /// are set to `mtu`.
    /// Returns the host and peer ends as observed after configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`DeviceError`] naming the end and the step which failed.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn setup_base(&self, mtu: u32) -> Result<(Link, Link), DeviceError> {
        let host = InterfaceName::fixed(defaults::HOST_DEVICE);
        let peer = InterfaceName::fixed(defaults::SECOND_HOST_DEVICE);
        self.setup_veth_pair(&host, &peer).await?;

        for name in [&host, &peer] {
            let link = self.lookup(name).await?;
            self.kernel
                .set_arp_off(&link)
                .await
                .map_err(|source| DeviceError::SetArpOff {
                    device: link.name.clone(),
                    source,
                })?;
        }
        for name in [&host, &peer] {
            let link = self.lookup(name).await?;
            self.kernel
                .set_mtu(&link, mtu)
                .await
                .map_err(|source| DeviceError::SetMtu {
                    device: link.name.clone(),
                    mtu,
                    source,
                })?;
        }

        Ok((self.lookup(&host).await?, self.lookup(&peer).await?))
    }

    /// Install `ipv4/32` and `ipv6/128` on the host device.
    ///
    /// Addresses are replaced rather than added so restarts never accumulate duplicates.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::ReplaceAddress`] for the first address which could not be installed.
    pub async fn add_host_device_addr(
        &self,
        host: &Link,
        ipv4: Option<Ipv4Addr>,
        ipv6: Option<Ipv6Addr>,
    ) -> Result<(), DeviceError> {
        let addresses = ipv4
            .map(|ip| IpNet::V4(Ipv4Net::from(ip)))
            .into_iter()
            .chain(ipv6.map(|ip| IpNet::V6(Ipv6Net::from(ip))));
        for address in addresses {
            debug!(device = %host.name, %address, "replacing address");
            self.kernel
                .replace_address(host, address)
                .await
                .map_err(|source| DeviceError::ReplaceAddress {
                    device: host.name.clone(),
                    address,
                    source,
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::defaults;
    use crate::device::DeviceKind;
    use crate::error::DeviceError;
    use crate::kernel::LinkKind;
    use crate::testing::{FakeKernel, Op, manager};
    use ipnet::IpNet;
    use nix::errno::Errno;
    use pretty_assertions::assert_eq;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[tokio::test]
    async fn creates_configured_veth_pair() {
        let manager = manager(FakeKernel::default());
        let (host, peer) = manager.setup_base(1450).await.unwrap();
        assert_eq!(host.name, defaults::HOST_DEVICE);
        assert_eq!(peer.name, defaults::SECOND_HOST_DEVICE);
        for link in [&host, &peer] {
            assert_eq!(link.kind, LinkKind::Veth);
            assert_eq!(link.mtu, 1450);
            assert!(link.up);
            assert!(!link.arp);
        }
        assert_ne!(host.mac, peer.mac);

        let created = manager.kernel().created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].tx_queue_len, Some(defaults::VETH_TX_QUEUE_LEN));
        assert!(matches!(
            &created[0].kind,
            DeviceKind::Veth { peer, peer_mac: Some(_) } if peer == "cilium_net"
        ));

        let written = manager.sysctl().written();
        assert_eq!(written.len(), 10);
        assert!(written.contains(&"net.ipv4.conf.cilium_host.rp_filter=0".to_string()));
        assert!(written.contains(&"net.ipv6.conf.cilium_net.forwarding=1".to_string()));
    }

    #[tokio::test]
    async fn setup_base_is_idempotent() {
        let manager = manager(FakeKernel::default());
        let first = manager.setup_base(1500).await.unwrap();
        let second = manager.setup_base(1500).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(manager.kernel().count(Op::Add), 1);
        assert_eq!(manager.kernel().count(Op::Del), 0);
    }

    #[tokio::test]
    async fn setup_base_converges_mtu_of_existing_pair() {
        let manager = manager(FakeKernel::default());
        manager.setup_base(1500).await.unwrap();
        let (host, peer) = manager.setup_base(9000).await.unwrap();
        assert_eq!((host.mtu, peer.mtu), (9000, 9000));
        assert_eq!(manager.kernel().count(Op::Add), 1);
    }

    #[tokio::test]
    async fn arp_failure_names_the_end() {
        let kernel = FakeKernel::default();
        kernel.fail(Op::SetArpOff, defaults::SECOND_HOST_DEVICE, Errno::EPERM);
        let manager = manager(kernel);
        let err = manager.setup_base(1500).await.unwrap_err();
        assert!(matches!(err, DeviceError::SetArpOff { ref device, .. } if device == "cilium_net"));
    }

    #[tokio::test]
    async fn host_addresses_are_replaced_not_accumulated() {
        let manager = manager(FakeKernel::default());
        let (host, _) = manager.setup_base(1500).await.unwrap();
        let v4 = Ipv4Addr::new(10, 0, 0, 1);
        let v6 = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1);
        for _ in 0..3 {
            manager
                .add_host_device_addr(&host, Some(v4), Some(v6))
                .await
                .unwrap();
        }
        let expected: Vec<IpNet> = vec![
            "10.0.0.1/32".parse().unwrap(),
            "fd00::1/128".parse().unwrap(),
        ];
        assert_eq!(manager.kernel().addresses(defaults::HOST_DEVICE), expected);
    }

    #[tokio::test]
    async fn host_address_families_are_optional() {
        let manager = manager(FakeKernel::default());
        let (host, _) = manager.setup_base(1500).await.unwrap();
        manager.add_host_device_addr(&host, None, None).await.unwrap();
        assert_eq!(manager.kernel().count(Op::ReplaceAddress), 0);
        manager
            .add_host_device_addr(&host, Some(Ipv4Addr::new(192, 168, 0, 1)), None)
            .await
            .unwrap();
        assert_eq!(
            manager.kernel().addresses(defaults::HOST_DEVICE),
            vec!["192.168.0.1/32".parse::<IpNet>().unwrap()]
        );
    }
}
