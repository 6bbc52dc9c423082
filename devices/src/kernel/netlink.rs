// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! [`Kernel`] over rtnetlink.

use super::{
    AttachPoint, AttachedProgram, Kernel, KernelError, Link, LinkKind, TcFilter, TcParent,
    UdpTunnelInfo, bpf,
};
use crate::device::{DeviceKind, DeviceSpec, UdpTunnel};
use crate::mac::Mac;
use crate::name::InterfaceName;
use futures::{StreamExt, TryStreamExt};
use ipnet::IpNet;
use nix::errno::Errno;
use rtnetlink::Handle;
use rtnetlink::LinkUnspec;
use rtnetlink::packet_core::{NLM_F_DUMP, NLM_F_REQUEST, NetlinkMessage, NetlinkPayload};
use rtnetlink::packet_route::RouteNetlinkMessage;
use rtnetlink::packet_route::link::{
    InfoData, InfoGeneve, InfoKind, InfoVeth, InfoVxlan, LinkAttribute, LinkFlags, LinkInfo,
    LinkMessage,
};
use rtnetlink::packet_route::tc::{TcAttribute, TcHandle, TcMessage, TcOption};
use rtnetlink::packet_utils::nla::{DefaultNla, Nla};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use tracing::{debug, trace};

/// `IFLA_IPTUN_COLLECT_METADATA` as an empty flag attribute.
const IPTUN_COLLECT_METADATA: [u8; 4] = [4, 0, 19, 0];

/// `IFLA_GENEVE_PORT_RANGE`, a pair of big endian ports.
const IFLA_GENEVE_PORT_RANGE: u16 = 15;

/// `TCA_BPF_NAME`
const TCA_BPF_NAME: u16 = 7;

/// A [`Kernel`] speaking rtnetlink in the namespace of its connection.
#[derive(Clone)]
pub struct NetlinkKernel {
    handle: Arc<Handle>,
}

impl Debug for NetlinkKernel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetlinkKernel").finish_non_exhaustive()
    }
}

impl NetlinkKernel {
    /// Wrap the handle of an established rtnetlink connection.
    #[must_use]
    pub fn new(handle: Arc<Handle>) -> Self {
        Self { handle }
    }
}

fn classify(err: rtnetlink::Error, name: &str) -> KernelError {
    match err {
        rtnetlink::Error::NetlinkError(message) => {
            KernelError::from_errno(Errno::from_raw(-message.raw_code()), name)
        }
        err => KernelError::Netlink(err.to_string()),
    }
}

fn kind_name(kind: &InfoKind) -> String {
    let mut buf = vec![0; kind.value_len()];
    kind.emit_value(&mut buf);
    String::from_utf8_lossy(&buf)
        .trim_end_matches('\0')
        .to_string()
}

fn link_kind(message: &LinkMessage) -> LinkKind {
    let mut kind = None;
    let mut data = None;
    for attr in &message.attributes {
        if let LinkAttribute::LinkInfo(infos) = attr {
            for info in infos {
                match info {
                    LinkInfo::Kind(k) => kind = Some(kind_name(k)),
                    LinkInfo::Data(d) => data = Some(d),
                    _ => {}
                }
            }
        }
    }
    match (kind.as_deref(), data) {
        (Some("veth"), _) => LinkKind::Veth,
        (Some("geneve"), Some(InfoData::Geneve(infos))) => LinkKind::Geneve(UdpTunnelInfo {
            port: infos
                .iter()
                .find_map(|info| match info {
                    InfoGeneve::Port(port) => Some(*port),
                    _ => None,
                })
                .unwrap_or_default(),
            src_port_range: infos.iter().find_map(|info| match info {
                InfoGeneve::Other(nla) => geneve_port_range(nla),
                _ => None,
            }),
        }),
        (Some("vxlan"), Some(InfoData::Vxlan(infos))) => LinkKind::Vxlan(UdpTunnelInfo {
            port: infos
                .iter()
                .find_map(|info| match info {
                    InfoVxlan::Port(port) => Some(*port),
                    _ => None,
                })
                .unwrap_or_default(),
            src_port_range: infos.iter().find_map(|info| match info {
                InfoVxlan::PortRange(range) => Some(*range),
                _ => None,
            }),
        }),
        (Some("ipip"), _) => LinkKind::Ipip4,
        (Some("ip6tnl"), _) => LinkKind::Ipip6,
        (kind, _) => LinkKind::Other(kind.map(ToString::to_string)),
    }
}

fn parse_link(message: &LinkMessage) -> Result<Link, KernelError> {
    let mut name = None;
    let mut mtu = 0;
    let mut mac = None;
    for attr in &message.attributes {
        match attr {
            LinkAttribute::IfName(n) => name = Some(n.clone()),
            LinkAttribute::Mtu(m) => mtu = *m,
            LinkAttribute::Address(bytes) => mac = Mac::try_from(bytes.as_slice()).ok(),
            _ => {}
        }
    }
    let name = name.ok_or_else(|| {
        KernelError::Malformed(format!("link {} without a name", message.header.index))
    })?;
    Ok(Link {
        index: message.header.index,
        name,
        mtu,
        mac,
        up: message.header.flags.contains(LinkFlags::Up),
        arp: !message.header.flags.contains(LinkFlags::Noarp),
        kind: link_kind(message),
    })
}

fn vxlan_data(tunnel: &UdpTunnel) -> InfoData {
    let mut infos = vec![
        InfoVxlan::Port(tunnel.port),
        InfoVxlan::CollectMetadata(tunnel.flow_based),
    ];
    if let Some(range) = tunnel.src_port_range() {
        infos.push(InfoVxlan::PortRange(range));
    }
    InfoData::Vxlan(infos)
}

fn geneve_port_range(nla: &DefaultNla) -> Option<(u16, u16)> {
    if nla.kind() != IFLA_GENEVE_PORT_RANGE || nla.value_len() != 4 {
        return None;
    }
    let mut buf = [0; 4];
    nla.emit_value(&mut buf);
    Some((
        u16::from_be_bytes([buf[0], buf[1]]),
        u16::from_be_bytes([buf[2], buf[3]]),
    ))
}

fn geneve_data(tunnel: &UdpTunnel) -> InfoData {
    let mut infos = vec![InfoGeneve::Port(tunnel.port)];
    if tunnel.flow_based {
        infos.push(InfoGeneve::CollectMetadata);
    }
    if let Some((low, high)) = tunnel.src_port_range() {
        let mut value = low.to_be_bytes().to_vec();
        value.extend_from_slice(&high.to_be_bytes());
        infos.push(InfoGeneve::Other(DefaultNla::new(
            IFLA_GENEVE_PORT_RANGE,
            value,
        )));
    }
    InfoData::Geneve(infos)
}

fn link_info(spec: &DeviceSpec) -> Vec<LinkInfo> {
    let kind = &spec.kind;
    match kind {
        DeviceKind::Veth { peer, peer_mac } => {
            let mut peer_message = LinkMessage::default();
            peer_message
                .attributes
                .push(LinkAttribute::IfName(peer.to_string()));
            if let Some(mac) = peer_mac {
                peer_message
                    .attributes
                    .push(LinkAttribute::Address(mac.0.to_vec()));
            }
            if let Some(len) = spec.tx_queue_len {
                peer_message
                    .attributes
                    .push(LinkAttribute::TxQueueLen(len));
            }
            vec![
                LinkInfo::Kind(InfoKind::Veth),
                LinkInfo::Data(InfoData::Veth(InfoVeth::Peer(peer_message))),
            ]
        }
        DeviceKind::Geneve(tunnel) => vec![
            LinkInfo::Kind(InfoKind::Geneve),
            LinkInfo::Data(geneve_data(tunnel)),
        ],
        DeviceKind::Vxlan(tunnel) => vec![
            LinkInfo::Kind(InfoKind::Vxlan),
            LinkInfo::Data(vxlan_data(tunnel)),
        ],
        DeviceKind::Ipip4 { flow_based } | DeviceKind::Ipip6 { flow_based } => {
            let mut infos = vec![LinkInfo::Kind(InfoKind::Other(
                kind.kernel_kind().to_string(),
            ))];
            if *flow_based {
                infos.push(LinkInfo::Data(InfoData::Other(
                    IPTUN_COLLECT_METADATA.to_vec(),
                )));
            }
            infos
        }
    }
}

fn link_message(spec: &DeviceSpec) -> LinkMessage {
    let mut message = LinkMessage::default();
    message
        .attributes
        .push(LinkAttribute::IfName(spec.name.to_string()));
    if spec.mtu != 0 {
        message.attributes.push(LinkAttribute::Mtu(spec.mtu));
    }
    if let Some(mac) = spec.mac {
        message
            .attributes
            .push(LinkAttribute::Address(mac.0.to_vec()));
    }
    if let Some(len) = spec.tx_queue_len {
        message.attributes.push(LinkAttribute::TxQueueLen(len));
    }
    message
        .attributes
        .push(LinkAttribute::LinkInfo(link_info(spec)));
    message
}

fn filter_name(message: &TcMessage) -> Option<String> {
    message.attributes.iter().find_map(|attr| match attr {
        TcAttribute::Options(options) => options.iter().find_map(|option| match option {
            TcOption::Other(nla) if nla.kind() == TCA_BPF_NAME => {
                let mut buf = vec![0; nla.value_len()];
                nla.emit_value(&mut buf);
                Some(
                    String::from_utf8_lossy(&buf)
                        .trim_end_matches('\0')
                        .to_string(),
                )
            }
            _ => None,
        }),
        _ => None,
    })
}

fn parse_filter(message: &TcMessage) -> Option<TcFilter> {
    let kind = message.attributes.iter().find_map(|attr| match attr {
        TcAttribute::Kind(kind) => Some(kind.clone()),
        _ => None,
    })?;
    Some(TcFilter {
        kind,
        name: filter_name(message),
    })
}

impl Kernel for NetlinkKernel {
    async fn link_by_name(&self, name: &InterfaceName) -> Result<Link, KernelError> {
        let mut resp = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match resp.try_next().await {
            Ok(Some(message)) => parse_link(&message),
            Ok(None) => Err(KernelError::NotFound(name.to_string())),
            Err(err) => Err(classify(err, name.as_str())),
        }
    }

    async fn add_link(&self, spec: &DeviceSpec) -> Result<(), KernelError> {
        debug!(device = %spec.name, kind = spec.kind.kernel_kind(), "adding link");
        self.handle
            .link()
            .add(link_message(spec))
            .execute()
            .await
            .map_err(|err| classify(err, spec.name.as_str()))
    }

    async fn del_link(&self, link: &Link) -> Result<(), KernelError> {
        self.handle
            .link()
            .del(link.index)
            .execute()
            .await
            .map_err(|err| classify(err, &link.name))
    }

    async fn set_name(&self, link: &Link, name: &InterfaceName) -> Result<(), KernelError> {
        self.handle
            .link()
            .set(
                LinkUnspec::new_with_index(link.index)
                    .name(name.to_string())
                    .build(),
            )
            .execute()
            .await
            .map_err(|err| classify(err, &link.name))
    }

    async fn set_up(&self, link: &Link) -> Result<(), KernelError> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(link.index).up().build())
            .execute()
            .await
            .map_err(|err| classify(err, &link.name))
    }

    async fn set_mtu(&self, link: &Link, mtu: u32) -> Result<(), KernelError> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(link.index).mtu(mtu).build())
            .execute()
            .await
            .map_err(|err| classify(err, &link.name))
    }

    async fn set_arp_off(&self, link: &Link) -> Result<(), KernelError> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(link.index).arp(false).build())
            .execute()
            .await
            .map_err(|err| classify(err, &link.name))
    }

    async fn replace_address(&self, link: &Link, address: IpNet) -> Result<(), KernelError> {
        self.handle
            .address()
            .add(link.index, address.addr(), address.prefix_len())
            .replace()
            .execute()
            .await
            .map_err(|err| classify(err, &link.name))
    }

    async fn filters(&self, link: &Link, parent: TcParent) -> Result<Vec<TcFilter>, KernelError> {
        #[allow(clippy::cast_possible_wrap)] // interface indices fit in i32
        let mut message = TcMessage::with_index(link.index as i32);
        message.header.parent = TcHandle::from(parent.handle());
        let mut request = NetlinkMessage::from(RouteNetlinkMessage::GetTrafficFilter(message));
        request.header.flags = NLM_F_REQUEST | NLM_F_DUMP;

        let mut handle = (*self.handle).clone();
        let mut resp = handle
            .request(request)
            .map_err(|err| classify(err, &link.name))?;
        let mut filters = Vec::new();
        while let Some(message) = resp.next().await {
            match message.payload {
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewTrafficFilter(filter)) => {
                    if let Some(filter) = parse_filter(&filter) {
                        filters.push(filter);
                    }
                }
                NetlinkPayload::Error(err) if err.code.is_some() => {
                    return Err(KernelError::from_errno(
                        Errno::from_raw(-err.raw_code()),
                        &link.name,
                    ));
                }
                _ => {}
            }
        }
        trace!(device = %link.name, ?parent, count = filters.len(), "listed tc filters");
        Ok(filters)
    }

    async fn attached_programs(
        &self,
        link: &Link,
        attach: AttachPoint,
    ) -> Result<Vec<AttachedProgram>, KernelError> {
        bpf::attached_programs(link.index, attach).map_err(|err| match err {
            KernelError::NotFound(_) => KernelError::NotFound(link.name.clone()),
            err => err,
        })
    }
}
