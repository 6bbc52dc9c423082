// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Fixtures for tests which touch a real kernel.
//!
//! Device tests need `CAP_NET_ADMIN` and `CAP_SYS_ADMIN` and must never run in the namespace of
//! the host.
//! [`in_scoped_netns`] creates a throwaway network namespace, runs a test in it with a fresh
//! rtnetlink connection, and removes the namespace again whether or not the test panicked.

use caps::{CapSet, Capability};
use nix::fcntl::OFlag;
use nix::sched::CloneFlags;
use nix::sys::stat::Mode;
use rtnetlink::{Handle, NetworkNamespace};
use std::future::Future;
use std::panic::{UnwindSafe, catch_unwind, resume_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error};

/// Capabilities needed to create namespaces and manage devices in them.
pub const NETNS_CAPS: [Capability; 2] = [Capability::CAP_SYS_ADMIN, Capability::CAP_NET_ADMIN];

/// Errors which may occur while entering a network namespace.
#[derive(Debug, thiserror::Error)]
pub enum NetnsError {
    /// `unshare(CLONE_NEWNET)` failed.
    #[error("unshare failed: {0}")]
    Unshare(nix::Error),
    /// The namespace file could not be opened.
    #[error("failed to open {path}: {source}")]
    Open {
        /// The namespace file.
        path: PathBuf,
        /// Reason.
        source: nix::Error,
    },
    /// `setns` failed.
    #[error("setns failed: {0}")]
    Setns(nix::Error),
}

/// True iff the permitted set of this process holds every capability in `caps`.
///
/// Privileged tests use this to bail out early with a clear message.
#[must_use]
pub fn permitted(caps: impl IntoIterator<Item = Capability>) -> bool {
    match caps::read(None, CapSet::Permitted) {
        Ok(held) => caps.into_iter().all(|cap| held.contains(&cap)),
        Err(err) => {
            error!("caps error: {err}");
            false
        }
    }
}

/// Fixture which runs the supplied function with _additional_ effective capabilities.
///
/// Capabilities which were raised are dropped again afterwards.
///
/// # Panics
///
/// If a capability can't be raised or dropped, or if `f` panics.
pub fn with_caps<F: UnwindSafe + FnOnce() -> T, T>(
    caps: impl IntoIterator<Item = Capability>,
) -> impl FnOnce(F) -> T {
    move |f: F| {
        let current = caps::read(None, CapSet::Effective)
            .unwrap_or_else(|err| panic!("caps error: {err}"));
        let raised: Vec<_> = caps
            .into_iter()
            .filter(|cap| !current.contains(cap))
            .collect();
        for cap in &raised {
            caps::raise(None, CapSet::Effective, *cap)
                .unwrap_or_else(|err| panic!("unable to raise capability {cap}: {err}"));
        }
        let ret = catch_unwind(f);
        for cap in &raised {
            caps::drop(None, CapSet::Effective, *cap)
                .unwrap_or_else(|err| panic!("unable to drop capability {cap}: {err}"));
        }
        ret.unwrap_or_else(|panic| resume_unwind(panic))
    }
}

fn runtime() -> tokio::runtime::Runtime {
    #[allow(clippy::expect_used)] // the inability to start tokio is fatal to the test
    tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("failed to build tokio runtime")
}

/// Move the current thread into the network namespace at `path`.
///
/// # Safety
///
/// Sockets the thread already holds stay in the old namespace; call this before opening any.
#[allow(unsafe_code)] // documented rationale
unsafe fn enter_netns(path: &Path) -> Result<(), NetnsError> {
    nix::sched::unshare(CloneFlags::CLONE_NEWNET).map_err(NetnsError::Unshare)?;
    let fd = nix::fcntl::open(path, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty()).map_err(
        |source| NetnsError::Open {
            path: path.to_path_buf(),
            source,
        },
    )?;
    nix::sched::setns(&fd, CloneFlags::CLONE_NEWNET).map_err(NetnsError::Setns)
}

/// Run `exec` in the existing network namespace at `path` with an rtnetlink handle bound to it.
///
/// A dedicated thread with its own current thread tokio runtime is used, so the caller's thread
/// never changes namespace.
///
/// # Panics
///
/// If the namespace can't be entered, the netlink connection can't be set up, or `exec` panics.
pub fn in_netns<Exec, Fut, Out>(path: PathBuf, exec: Exec) -> Out
where
    Exec: FnOnce(Arc<Handle>) -> Fut + Send + 'static,
    Fut: Future<Output = Out>,
    Out: Send + 'static,
{
    let name = format!("netns-{}", path.display());
    #[allow(clippy::expect_used)]
    let thread = std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            with_caps(NETNS_CAPS)(|| {
                #[allow(unsafe_code)] // fresh thread, no sockets yet
                unsafe { enter_netns(&path) }
                    .unwrap_or_else(|err| panic!("failed to enter {}: {err}", path.display()));
            });
            let runtime = runtime();
            runtime.block_on(async move {
                let (connection, handle, _) = rtnetlink::new_connection()
                    .unwrap_or_else(|err| panic!("failed to open netlink socket: {err}"));
                tokio::spawn(connection);
                exec(Arc::new(handle)).await
            })
        })
        .expect("failed to spawn netns thread");
    thread
        .join()
        .unwrap_or_else(|panic| resume_unwind(panic))
}

/// Fixture which creates the network namespace `name`, runs `exec` in it and removes it again.
///
/// The namespace is removed even if `exec` panics; the panic is then re-raised.
///
/// # Panics
///
/// If the namespace can't be created or removed, or `exec` panics.
pub fn in_scoped_netns<Exec, Fut, Out>(name: &str, exec: Exec) -> Out
where
    Exec: FnOnce(Arc<Handle>) -> Fut + Send + UnwindSafe + 'static,
    Fut: Future<Output = Out>,
    Out: Send + 'static,
{
    let runtime = runtime();
    let owned = name.to_string();
    with_caps(NETNS_CAPS)(|| {
        runtime.block_on(async {
            NetworkNamespace::add(owned)
                .await
                .unwrap_or_else(|err| panic!("failed to create network namespace {name}: {err}"));
        });
    });
    debug!(name, "created network namespace");

    let path = PathBuf::from(format!("/run/netns/{name}"));
    let ret = catch_unwind(move || in_netns(path, exec));

    let owned = name.to_string();
    with_caps(NETNS_CAPS)(|| {
        runtime.block_on(async {
            NetworkNamespace::del(owned)
                .await
                .unwrap_or_else(|err| panic!("failed to remove network namespace {name}: {err}"));
        });
    });
    debug!(name, "removed network namespace");
    ret.unwrap_or_else(|panic| resume_unwind(panic))
}
