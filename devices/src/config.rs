// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Desired datapath device configuration.

use crate::defaults;
use crate::reconcile::TunnelParams;
use crate::tunnel::TunnelMode;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Which IP families the datapath forwards.
///
/// Controls which per-device forwarding sysctls are applied.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(default)]
pub struct IpFamilies {
    /// Forward IPv4.
    pub ipv4: bool,
    /// Forward IPv6.
    pub ipv6: bool,
}

impl Default for IpFamilies {
    fn default() -> Self {
        Self {
            ipv4: true,
            ipv6: true,
        }
    }
}

/// Desired state of the datapath devices, as chosen by the control plane.
///
/// Changes to the tunnel mode take effect at the next reconciliation pass; nothing here is
/// re-read during a pass.
#[derive(Builder, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatapathConfig {
    /// Overlay encapsulation.
    #[builder(default)]
    pub tunnel_mode: TunnelMode,
    /// UDP destination port of the overlay; the mode's well known port if unset.
    #[builder(default)]
    pub tunnel_port: Option<u16>,
    /// Lower bound of the overlay source port range (0 together with `tunnel_src_port_high` = 0
    /// lets the kernel pick).
    #[builder(default)]
    pub tunnel_src_port_low: u16,
    /// Upper bound of the overlay source port range.
    #[builder(default)]
    pub tunnel_src_port_high: u16,
    /// Device MTU.
    #[builder(default = "defaults::MTU")]
    pub mtu: u32,
    /// IP families to forward.
    #[builder(default)]
    pub families: IpFamilies,
    /// Create `cilium_ipip4`.
    #[builder(default)]
    pub ipip4: bool,
    /// Create `cilium_ipip6`.
    #[builder(default)]
    pub ipip6: bool,
    /// IPv4 address of the host device (installed as a /32).
    #[builder(default)]
    pub host_ipv4: Option<Ipv4Addr>,
    /// IPv6 address of the host device (installed as a /128).
    #[builder(default)]
    pub host_ipv6: Option<Ipv6Addr>,
}

impl Default for DatapathConfig {
    fn default() -> Self {
        Self {
            tunnel_mode: TunnelMode::default(),
            tunnel_port: None,
            tunnel_src_port_low: 0,
            tunnel_src_port_high: 0,
            mtu: defaults::MTU,
            families: IpFamilies::default(),
            ipip4: false,
            ipip6: false,
            host_ipv4: None,
            host_ipv6: None,
        }
    }
}

impl DatapathConfig {
    /// Parse a YAML document.
    ///
    /// # Errors
    ///
    /// Returns the parse error for malformed documents or unknown keys.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml_ng::Error> {
        serde_yaml_ng::from_str(yaml)
    }

    /// The destination port for the configured tunnel mode.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.tunnel_port
            .unwrap_or_else(|| self.tunnel_mode.default_port())
    }

    /// Parameters for [`Manager::reconcile`](crate::Manager::reconcile).
    #[must_use]
    pub fn tunnel_params(&self) -> TunnelParams {
        TunnelParams {
            port: self.port(),
            src_port_low: self.tunnel_src_port_low,
            src_port_high: self.tunnel_src_port_high,
            mtu: self.mtu,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DatapathConfig, DatapathConfigBuilder, IpFamilies};
    use crate::tunnel::TunnelMode;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    #[test]
    fn empty_yaml_is_default() {
        assert_eq!(DatapathConfig::from_yaml("{}").unwrap(), DatapathConfig::default());
    }

    #[test]
    fn yaml_round_trip_of_partial_document() {
        let config = DatapathConfig::from_yaml(
            "tunnel_mode: geneve\nmtu: 9000\nfamilies:\n  ipv6: false\nhost_ipv4: 10.0.0.1\n",
        )
        .unwrap();
        assert_eq!(
            config,
            DatapathConfigBuilder::default()
                .tunnel_mode(TunnelMode::Geneve)
                .mtu(9000)
                .families(IpFamilies {
                    ipv4: true,
                    ipv6: false
                })
                .host_ipv4(Some(Ipv4Addr::new(10, 0, 0, 1)))
                .build()
                .unwrap()
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(DatapathConfig::from_yaml("tunnel: vxlan\n").is_err());
    }

    #[test]
    fn port_defaults_follow_mode() {
        let mut config = DatapathConfig {
            tunnel_mode: TunnelMode::Vxlan,
            ..DatapathConfig::default()
        };
        assert_eq!(config.tunnel_params().port, 8472);
        config.tunnel_mode = TunnelMode::Geneve;
        assert_eq!(config.tunnel_params().port, 6081);
        config.tunnel_port = Some(4789);
        assert_eq!(config.tunnel_params().port, 4789);
    }
}
