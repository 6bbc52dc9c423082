// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Is one of our packet programs attached to a device?
//!
//! A program may be attached as a tc `bpf` filter under the clsact qdisc, through a tcx link,
//! or through a netkit link.
//! Which of those is in use depends on the kernel and on how the device was set up, and nothing
//! prevents them from coexisting, so presence is the union over all three.

use crate::Manager;
use crate::defaults;
use crate::error::DeviceError;
use crate::kernel::{AttachPoint, AttachedProgram, Kernel, KernelError, Link, TcFilter, TcParent};
use crate::mac::MacGenerator;
use crate::name::InterfaceName;
use sysctl::SysctlApplier;

/// Where our programs were found on a device.
///
/// Computed fresh for every query.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[allow(clippy::struct_excessive_bools)]
pub struct AttachmentState {
    /// tc filter under the ingress clsact hook.
    pub tc_ingress: bool,
    /// tc filter under the egress clsact hook.
    pub tc_egress: bool,
    /// tcx ingress link.
    pub tcx_ingress: bool,
    /// tcx egress link.
    pub tcx_egress: bool,
    /// Link on the peer side of a netkit device (the device's ingress).
    pub netkit_peer: bool,
    /// Link on the primary side of a netkit device (the device's egress).
    pub netkit_primary: bool,
}

impl AttachmentState {
    /// Some mechanism carries an ingress program.
    #[must_use]
    pub const fn ingress(&self) -> bool {
        self.tc_ingress || self.tcx_ingress || self.netkit_peer
    }

    /// Some mechanism carries an egress program.
    #[must_use]
    pub const fn egress(&self) -> bool {
        self.tc_egress || self.tcx_egress || self.netkit_primary
    }
}

/// One of ours if it is a `bpf` classifier whose program name contains `cil`.
#[must_use]
pub fn is_owned_filter(filter: &TcFilter) -> bool {
    filter.kind == "bpf"
        && filter
            .name
            .as_deref()
            .is_some_and(|name| name.contains(defaults::TC_PROGRAM_MARKER))
}

/// One of ours if its name starts with `cil_`.
#[must_use]
pub fn is_owned_program(program: &AttachedProgram) -> bool {
    program.name.starts_with(defaults::LINK_PROGRAM_PREFIX)
}

impl<K: Kernel, S: SysctlApplier, M: MacGenerator> Manager<K, S, M> {
    async fn has_owned_filter(&self, link: &Link, parent: TcParent) -> Result<bool, DeviceError> {
        let filters = self
            .kernel
            .filters(link, parent)
            .await
            .map_err(|source| inspect_error(link, source))?;
        Ok(filters.iter().any(is_owned_filter))
    }

    async fn has_owned_program(
        &self,
        link: &Link,
        attach: AttachPoint,
    ) -> Result<bool, DeviceError> {
        let programs = self
            .kernel
            .attached_programs(link, attach)
            .await
            .map_err(|source| inspect_error(link, source))?;
        Ok(programs.iter().any(is_owned_program))
    }

    async fn ingress_state(&self, link: &Link) -> Result<AttachmentState, DeviceError> {
        Ok(AttachmentState {
            tcx_ingress: self.has_owned_program(link, AttachPoint::TcxIngress).await?,
            tc_ingress: self.has_owned_filter(link, TcParent::Ingress).await?,
            netkit_peer: self.has_owned_program(link, AttachPoint::NetkitPeer).await?,
            ..AttachmentState::default()
        })
    }

    async fn with_egress_state(
        &self,
        link: &Link,
        state: AttachmentState,
    ) -> Result<AttachmentState, DeviceError> {
        Ok(AttachmentState {
            tcx_egress: self.has_owned_program(link, AttachPoint::TcxEgress).await?,
            tc_egress: self.has_owned_filter(link, TcParent::Egress).await?,
            netkit_primary: self
                .has_owned_program(link, AttachPoint::NetkitPrimary)
                .await?,
            ..state
        })
    }

    /// Whether `device` carries one of our programs on ingress and, if `check_egress`, on egress
    /// as well.
    ///
    /// Ingress is the minimum: without an ingress program egress is not even looked at.
    ///
    /// # Errors
    ///
    /// Fails if the device does not exist or a mechanism could not be queried.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn has_packet_program(
        &self,
        device: &InterfaceName,
        check_egress: bool,
    ) -> Result<bool, DeviceError> {
        let link = self.lookup(device).await?;
        let state = self.ingress_state(&link).await?;
        if !state.ingress() {
            return Ok(false);
        }
        if !check_egress {
            return Ok(true);
        }
        Ok(self.with_egress_state(&link, state).await?.egress())
    }

    /// Every mechanism's answer for `device`, for diagnostics.
    ///
    /// # Errors
    ///
    /// Fails if the device does not exist or a mechanism could not be queried.
    pub async fn attachment_state(
        &self,
        device: &InterfaceName,
    ) -> Result<AttachmentState, DeviceError> {
        let link = self.lookup(device).await?;
        let state = self.ingress_state(&link).await?;
        self.with_egress_state(&link, state).await
    }
}

fn inspect_error(link: &Link, source: KernelError) -> DeviceError {
    DeviceError::Inspect {
        device: link.name.clone(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::{AttachmentState, is_owned_filter, is_owned_program};
    use crate::error::DeviceError;
    use crate::kernel::{AttachPoint, AttachedProgram, LinkKind, TcFilter, TcParent};
    use crate::name::InterfaceName;
    use crate::testing::{FakeKernel, Op, manager};
    use nix::errno::Errno;
    use pretty_assertions::assert_eq;

    const DEV: &str = "lxc0";

    fn dev() -> InterfaceName {
        InterfaceName::try_from(DEV).unwrap()
    }

    fn kernel() -> FakeKernel {
        let kernel = FakeKernel::default();
        kernel.seed(DEV, 1500, LinkKind::Veth);
        kernel
    }

    async fn answers(kernel: FakeKernel) -> (bool, bool) {
        let manager = manager(kernel);
        (
            manager.has_packet_program(&dev(), false).await.unwrap(),
            manager.has_packet_program(&dev(), true).await.unwrap(),
        )
    }

    #[test]
    fn ownership() {
        let filter = |kind: &str, name: Option<&str>| TcFilter {
            kind: kind.to_string(),
            name: name.map(ToString::to_string),
        };
        assert!(is_owned_filter(&filter("bpf", Some("cil_from_container"))));
        assert!(is_owned_filter(&filter("bpf", Some("bpf_lxc.o:[from-container]cil"))));
        assert!(!is_owned_filter(&filter("bpf", Some("other"))));
        assert!(!is_owned_filter(&filter("bpf", None)));
        assert!(!is_owned_filter(&filter("flower", Some("cil_from_container"))));

        let program = |name: &str| AttachedProgram {
            id: 1,
            name: name.to_string(),
        };
        assert!(is_owned_program(&program("cil_to_netdev")));
        assert!(!is_owned_program(&program("cilium")));
        assert!(!is_owned_program(&program("xcil_")));
    }

    #[tokio::test]
    async fn nothing_attached() {
        assert_eq!(answers(kernel()).await, (false, false));
    }

    #[tokio::test]
    async fn ingress_filter_only() {
        let kernel = kernel();
        kernel.add_filter(DEV, TcParent::Ingress, "bpf", Some("cil_from_container"));
        assert_eq!(answers(kernel).await, (true, false));
    }

    #[tokio::test]
    async fn ingress_and_egress_filters() {
        let kernel = kernel();
        kernel.add_filter(DEV, TcParent::Ingress, "bpf", Some("cil_from_container"));
        kernel.add_filter(DEV, TcParent::Egress, "bpf", Some("cil_to_container"));
        assert_eq!(answers(kernel).await, (true, true));
    }

    #[tokio::test]
    async fn egress_alone_is_not_enough() {
        let kernel = kernel();
        kernel.add_filter(DEV, TcParent::Egress, "bpf", Some("cil_to_container"));
        kernel.attach_program(DEV, AttachPoint::TcxEgress, "cil_to_container");
        assert_eq!(answers(kernel).await, (false, false));
    }

    #[tokio::test]
    async fn mechanisms_mix() {
        let kernel = kernel();
        kernel.add_filter(DEV, TcParent::Ingress, "bpf", Some("cil_from_netdev"));
        kernel.attach_program(DEV, AttachPoint::TcxEgress, "cil_to_netdev");
        assert_eq!(answers(kernel).await, (true, true));

        let kernel = self::kernel();
        kernel.attach_program(DEV, AttachPoint::TcxIngress, "cil_from_netdev");
        kernel.attach_program(DEV, AttachPoint::NetkitPrimary, "cil_to_container");
        assert_eq!(answers(kernel).await, (true, true));
    }

    #[tokio::test]
    async fn netkit_only() {
        let kernel = kernel();
        kernel.attach_program(DEV, AttachPoint::NetkitPeer, "cil_from_container");
        kernel.attach_program(DEV, AttachPoint::NetkitPrimary, "cil_to_container");
        assert_eq!(answers(kernel).await, (true, true));
    }

    #[tokio::test]
    async fn foreign_programs_do_not_count() {
        let kernel = kernel();
        kernel.add_filter(DEV, TcParent::Ingress, "bpf", Some("someone_else"));
        kernel.add_filter(DEV, TcParent::Ingress, "u32", None);
        kernel.attach_program(DEV, AttachPoint::TcxIngress, "not_ours");
        assert_eq!(answers(kernel).await, (false, false));
    }

    #[tokio::test]
    async fn ingress_only_check_stops_early() {
        let manager = manager(kernel());
        manager
            .kernel()
            .add_filter(DEV, TcParent::Ingress, "bpf", Some("cil_from_container"));
        assert!(manager.has_packet_program(&dev(), false).await.unwrap());
        assert_eq!(manager.kernel().count(Op::Inspect), 3);
        manager.has_packet_program(&dev(), true).await.unwrap();
        assert_eq!(manager.kernel().count(Op::Inspect), 9);
    }

    #[tokio::test]
    async fn full_state_reports_every_mechanism() {
        let manager = manager(kernel());
        manager
            .kernel()
            .add_filter(DEV, TcParent::Egress, "bpf", Some("cil_to_container"));
        manager
            .kernel()
            .attach_program(DEV, AttachPoint::NetkitPeer, "cil_from_container");
        assert_eq!(
            manager.attachment_state(&dev()).await.unwrap(),
            AttachmentState {
                tc_egress: true,
                netkit_peer: true,
                ..AttachmentState::default()
            }
        );
    }

    #[tokio::test]
    async fn missing_device_is_an_error() {
        let manager = manager(FakeKernel::default());
        let err = manager.has_packet_program(&dev(), false).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn query_failures_are_attributed() {
        let kernel = kernel();
        kernel.fail(Op::Inspect, DEV, Errno::EPERM);
        let manager = manager(kernel);
        let err = manager.has_packet_program(&dev(), true).await.unwrap_err();
        assert!(matches!(err, DeviceError::Inspect { ref device, .. } if device == DEV));
    }
}
