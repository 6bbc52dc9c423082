// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! In-memory stand-ins for the capabilities a [`Manager`] consumes.
//!
//! [`FakeKernel`] behaves like a single network namespace: creating a veth creates both ends,
//! deleting one end deletes the other, and the first ipip or ip6tnl device loads a "module" which
//! materializes the kernel's fallback device next to it.

#![allow(clippy::missing_panics_doc)]

use crate::Manager;
use crate::config::IpFamilies;
use crate::defaults;
use crate::device::{DeviceKind, DeviceSpec};
use crate::kernel::{
    AttachPoint, AttachedProgram, Kernel, KernelError, Link, LinkKind, TcFilter, TcParent,
    UdpTunnelInfo,
};
use crate::mac::{Mac, MacError, MacGenerator};
use crate::name::InterfaceName;
use ipnet::IpNet;
use nix::errno::Errno;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use sysctl::{Sysctl, SysctlApplier, SysctlError};

/// Kernel operations which can be counted or made to fail.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Op {
    /// [`Kernel::add_link`]
    Add,
    /// [`Kernel::del_link`]
    Del,
    /// [`Kernel::set_name`]
    SetName,
    /// [`Kernel::set_up`]
    SetUp,
    /// [`Kernel::set_mtu`]
    SetMtu,
    /// [`Kernel::set_arp_off`]
    SetArpOff,
    /// [`Kernel::replace_address`]
    ReplaceAddress,
    /// [`Kernel::filters`] and [`Kernel::attached_programs`]
    Inspect,
}

#[derive(Debug)]
struct State {
    links: BTreeMap<String, Link>,
    peers: BTreeMap<String, String>,
    next_index: u32,
    next_program: u32,
    addresses: BTreeMap<u32, Vec<IpNet>>,
    filters: BTreeMap<(u32, TcParent), Vec<TcFilter>>,
    programs: BTreeMap<(u32, AttachPoint), Vec<AttachedProgram>>,
    unsupported: BTreeSet<String>,
    failures: BTreeMap<(Op, String), Errno>,
    counts: BTreeMap<Op, usize>,
    modules: BTreeSet<&'static str>,
    fallback_devices: bool,
    created: Vec<DeviceSpec>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            links: BTreeMap::new(),
            peers: BTreeMap::new(),
            next_index: 1,
            next_program: 1,
            addresses: BTreeMap::new(),
            filters: BTreeMap::new(),
            programs: BTreeMap::new(),
            unsupported: BTreeSet::new(),
            failures: BTreeMap::new(),
            counts: BTreeMap::new(),
            modules: BTreeSet::new(),
            fallback_devices: true,
            created: Vec::new(),
        }
    }
}

impl State {
    fn record(&mut self, op: Op, device: &str) -> Result<(), KernelError> {
        if let Some(errno) = self.failures.get(&(op, device.to_string())) {
            return Err(KernelError::from_errno(*errno, device));
        }
        *self.counts.entry(op).or_default() += 1;
        Ok(())
    }

    fn insert(&mut self, name: &str, mtu: u32, mac: Option<Mac>, kind: LinkKind) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        self.links.insert(
            name.to_string(),
            Link {
                index,
                name: name.to_string(),
                mtu,
                mac,
                up: false,
                arp: true,
                kind,
            },
        );
        index
    }

    fn live(&mut self, link: &Link) -> Result<&mut Link, KernelError> {
        self.links
            .values_mut()
            .find(|live| live.index == link.index)
            .ok_or_else(|| KernelError::NotFound(link.name.clone()))
    }

    fn load_module(&mut self, module: &'static str) {
        if !self.modules.insert(module) || !self.fallback_devices {
            return;
        }
        match module {
            "ipip" => {
                self.insert(defaults::IPIP4_FALLBACK, 1480, None, LinkKind::Ipip4);
            }
            "ip6_tunnel" => {
                self.insert(defaults::IPIP6_FALLBACK, 1452, None, LinkKind::Ipip6);
            }
            _ => {}
        }
    }

    fn remove(&mut self, name: &str) {
        if let Some(link) = self.links.remove(name) {
            self.addresses.remove(&link.index);
            self.filters.retain(|(index, _), _| *index != link.index);
            self.programs.retain(|(index, _), _| *index != link.index);
        }
    }
}

/// A network namespace held in memory.
#[derive(Debug, Default)]
pub struct FakeKernel {
    state: Mutex<State>,
}

impl FakeKernel {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Don't create `tunl0` / `ip6tnl0` when the ipip modules load, as if
    /// `net.core.fb_tunnels_only_for_init_net` were set.
    #[must_use]
    pub fn without_fallback_devices(self) -> Self {
        self.state().fallback_devices = false;
        self
    }

    /// Refuse to create devices of kernel kind `kind` with `EOPNOTSUPP`.
    pub fn unsupported(&self, kind: &str) {
        self.state().unsupported.insert(kind.to_string());
    }

    /// Make `op` on `device` fail with `errno`.
    pub fn fail(&self, op: Op, device: &str, errno: Errno) {
        self.state().failures.insert((op, device.to_string()), errno);
    }

    /// Forget every failure set up with [`FakeKernel::fail`].
    pub fn recover(&self) {
        self.state().failures.clear();
    }

    /// How many times `op` succeeded.
    #[must_use]
    pub fn count(&self, op: Op) -> usize {
        self.state().counts.get(&op).copied().unwrap_or_default()
    }

    /// Every descriptor a device was created from, in order.
    #[must_use]
    pub fn created(&self) -> Vec<DeviceSpec> {
        self.state().created.clone()
    }

    /// A snapshot of the link called `name`.
    #[must_use]
    pub fn link(&self, name: &str) -> Option<Link> {
        self.state().links.get(name).cloned()
    }

    /// The names of all links, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.state().links.keys().cloned().collect()
    }

    /// Addresses configured on the link called `name`.
    #[must_use]
    pub fn addresses(&self, name: &str) -> Vec<IpNet> {
        let state = self.state();
        state
            .links
            .get(name)
            .and_then(|link| state.addresses.get(&link.index))
            .cloned()
            .unwrap_or_default()
    }

    /// Put a link into the namespace as if some other tool had created it.
    pub fn seed(&self, name: &str, mtu: u32, kind: LinkKind) -> Link {
        let mut state = self.state();
        state.insert(name, mtu, Some(Mac([0x02, 0xee, 0, 0, 0, 0])), kind);
        state.links[name].clone()
    }

    /// Hang a tc filter from `parent` on the link called `device`.
    pub fn add_filter(&self, device: &str, parent: TcParent, kind: &str, name: Option<&str>) {
        let mut state = self.state();
        let index = state.links[device].index;
        state
            .filters
            .entry((index, parent))
            .or_default()
            .push(TcFilter {
                kind: kind.to_string(),
                name: name.map(ToString::to_string),
            });
    }

    /// Attach a program called `name` to the link called `device`.
    pub fn attach_program(&self, device: &str, attach: AttachPoint, name: &str) {
        let mut state = self.state();
        let index = state.links[device].index;
        let id = state.next_program;
        state.next_program += 1;
        state
            .programs
            .entry((index, attach))
            .or_default()
            .push(AttachedProgram {
                id,
                name: name.to_string(),
            });
    }
}

impl Kernel for FakeKernel {
    async fn link_by_name(&self, name: &InterfaceName) -> Result<Link, KernelError> {
        self.state()
            .links
            .get(name.as_str())
            .cloned()
            .ok_or_else(|| KernelError::NotFound(name.to_string()))
    }

    async fn add_link(&self, spec: &DeviceSpec) -> Result<(), KernelError> {
        let mut state = self.state();
        let name = spec.name.as_str();
        if state.unsupported.contains(spec.kind.kernel_kind()) {
            return Err(KernelError::Unsupported(Errno::EOPNOTSUPP));
        }
        state.record(Op::Add, name)?;
        if state.links.contains_key(name) {
            return Err(KernelError::Errno(Errno::EEXIST));
        }
        let mtu = match spec.mtu {
            0 => defaults::MTU,
            mtu => mtu,
        };
        match &spec.kind {
            DeviceKind::Veth { peer, peer_mac } => {
                if state.links.contains_key(peer.as_str()) {
                    return Err(KernelError::Errno(Errno::EEXIST));
                }
                state.insert(name, mtu, spec.mac, LinkKind::Veth);
                state.insert(peer.as_str(), mtu, *peer_mac, LinkKind::Veth);
                state.peers.insert(name.to_string(), peer.to_string());
                state.peers.insert(peer.to_string(), name.to_string());
            }
            DeviceKind::Geneve(tunnel) => {
                let info = UdpTunnelInfo {
                    port: tunnel.port,
                    src_port_range: tunnel.src_port_range(),
                };
                state.insert(name, mtu, spec.mac, LinkKind::Geneve(info));
            }
            DeviceKind::Vxlan(tunnel) => {
                let info = UdpTunnelInfo {
                    port: tunnel.port,
                    src_port_range: Some((tunnel.src_port_low, tunnel.src_port_high)),
                };
                state.insert(name, mtu, spec.mac, LinkKind::Vxlan(info));
            }
            DeviceKind::Ipip4 { .. } => {
                state.load_module("ipip");
                state.insert(name, mtu, None, LinkKind::Ipip4);
            }
            DeviceKind::Ipip6 { .. } => {
                state.load_module("ip6_tunnel");
                state.insert(name, mtu, None, LinkKind::Ipip6);
            }
        }
        state.created.push(spec.clone());
        Ok(())
    }

    async fn del_link(&self, link: &Link) -> Result<(), KernelError> {
        let mut state = self.state();
        state.record(Op::Del, &link.name)?;
        let name = state.live(link)?.name.clone();
        state.remove(&name);
        if let Some(peer) = state.peers.remove(&name) {
            state.peers.remove(&peer);
            state.remove(&peer);
        }
        Ok(())
    }

    async fn set_name(&self, link: &Link, name: &InterfaceName) -> Result<(), KernelError> {
        let mut state = self.state();
        state.record(Op::SetName, &link.name)?;
        if state.links.contains_key(name.as_str()) {
            return Err(KernelError::Errno(Errno::EEXIST));
        }
        let old = state.live(link)?.name.clone();
        if let Some(mut live) = state.links.remove(&old) {
            live.name = name.to_string();
            state.links.insert(name.to_string(), live);
        }
        if let Some(peer) = state.peers.remove(&old) {
            state.peers.insert(peer.clone(), name.to_string());
            state.peers.insert(name.to_string(), peer);
        }
        Ok(())
    }

    async fn set_up(&self, link: &Link) -> Result<(), KernelError> {
        let mut state = self.state();
        state.record(Op::SetUp, &link.name)?;
        state.live(link)?.up = true;
        Ok(())
    }

    async fn set_mtu(&self, link: &Link, mtu: u32) -> Result<(), KernelError> {
        let mut state = self.state();
        state.record(Op::SetMtu, &link.name)?;
        state.live(link)?.mtu = mtu;
        Ok(())
    }

    async fn set_arp_off(&self, link: &Link) -> Result<(), KernelError> {
        let mut state = self.state();
        state.record(Op::SetArpOff, &link.name)?;
        state.live(link)?.arp = false;
        Ok(())
    }

    async fn replace_address(&self, link: &Link, address: IpNet) -> Result<(), KernelError> {
        let mut state = self.state();
        state.record(Op::ReplaceAddress, &link.name)?;
        let index = state.live(link)?.index;
        let addresses = state.addresses.entry(index).or_default();
        addresses.retain(|existing| *existing != address);
        addresses.push(address);
        Ok(())
    }

    async fn filters(&self, link: &Link, parent: TcParent) -> Result<Vec<TcFilter>, KernelError> {
        let mut state = self.state();
        state.record(Op::Inspect, &link.name)?;
        let index = state.live(link)?.index;
        Ok(state
            .filters
            .get(&(index, parent))
            .cloned()
            .unwrap_or_default())
    }

    async fn attached_programs(
        &self,
        link: &Link,
        attach: AttachPoint,
    ) -> Result<Vec<AttachedProgram>, KernelError> {
        let mut state = self.state();
        state.record(Op::Inspect, &link.name)?;
        let index = state.live(link)?.index;
        Ok(state
            .programs
            .get(&(index, attach))
            .cloned()
            .unwrap_or_default())
    }
}

/// A sysctl applier which records what it was asked to write.
#[derive(Debug, Default)]
pub struct RecordingSysctl {
    written: Mutex<Vec<String>>,
    failing: Mutex<BTreeSet<String>>,
}

impl RecordingSysctl {
    /// Every successful write as `name=value`, in order.
    #[must_use]
    pub fn written(&self) -> Vec<String> {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make writes to the dotted sysctl `name` fail.
    pub fn fail_on(&self, name: &str) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string());
    }
}

impl SysctlApplier for RecordingSysctl {
    fn write(&self, setting: &Sysctl) -> Result<(), SysctlError> {
        let name = setting.to_string();
        if self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&name)
        {
            return Err(SysctlError::Write {
                name,
                value: setting.value.clone(),
                source: std::io::ErrorKind::PermissionDenied.into(),
            });
        }
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("{name}={}", setting.value));
        Ok(())
    }
}

/// Hands out `02:00:00:00:00:01`, `02:00:00:00:00:02`, ...
#[derive(Debug, Default)]
pub struct SequentialMac {
    next: AtomicU8,
}

impl MacGenerator for SequentialMac {
    fn generate(&self) -> Result<Mac, MacError> {
        let last = self.next.fetch_add(1, Ordering::Relaxed);
        match last.checked_add(1) {
            Some(n) => Ok(Mac([0x02, 0, 0, 0, 0, n])),
            None => Err(MacError::Random("sequence exhausted".to_string())),
        }
    }
}

/// A [`Manager`] over a [`FakeKernel`] forwarding both IP families.
#[must_use]
pub fn manager(kernel: FakeKernel) -> Manager<FakeKernel, RecordingSysctl, SequentialMac> {
    manager_with_families(kernel, IpFamilies::default())
}

/// A [`Manager`] over a [`FakeKernel`] forwarding `families`.
#[must_use]
pub fn manager_with_families(
    kernel: FakeKernel,
    families: IpFamilies,
) -> Manager<FakeKernel, RecordingSysctl, SequentialMac> {
    Manager::with_mac_generator(
        kernel,
        RecordingSysctl::default(),
        SequentialMac::default(),
        families,
    )
}
