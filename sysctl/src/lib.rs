// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Kernel tunables ([sysctl]) addressed by hierarchical key paths.
//!
//! The datapath needs a handful of per-device settings (forwarding, reverse path filtering, ...)
//! applied every time a device is brought up.
//! This crate describes those settings as plain values ([`Sysctl`]) and applies them in ordered
//! batches through the [`SysctlApplier`] trait.
//! [`ProcSysctl`] is the implementation which writes to a mounted procfs.
//!
//! [sysctl]: https://docs.kernel.org/admin-guide/sysctl/index.html

#![deny(
    unsafe_code,
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

use std::fmt::{Display, Formatter};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Errors which might occur when applying sysctl settings.
#[derive(Debug, thiserror::Error)]
pub enum SysctlError {
    /// A key segment is empty, contains a path separator, or is a relative path component.
    ///
    /// Such a segment would allow a sysctl name to escape the sysctl tree.
    #[error("illegal sysctl key segment {0:?}")]
    IllegalSegment(String),
    /// The sysctl key has no segments at all.
    #[error("sysctl key must not be empty")]
    EmptyName,
    /// procfs could not be found where we expected it.
    #[error("procfs is not mounted at {0:?}")]
    NotProcfs(PathBuf),
    /// Writing the value failed.
    #[error("unable to set {name} to {value}: {source}")]
    Write {
        /// The dotted name of the setting.
        name: String,
        /// The value we attempted to write.
        value: String,
        /// The underlying io error.
        #[source]
        source: std::io::Error,
    },
    /// Some other [`std::io::Error`] occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single kernel tunable setting.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Sysctl {
    /// The key segments, e.g. `["net", "ipv4", "conf", "eth0", "forwarding"]`.
    pub name: Vec<String>,
    /// The value to write.
    pub value: String,
    /// If true, failure to write this setting does not abort the batch it is part of.
    pub ignore_err: bool,
}

impl Sysctl {
    /// Build a setting whose failure aborts the batch.
    #[must_use]
    pub fn new<S: Into<String>>(
        name: impl IntoIterator<Item = S>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into_iter().map(Into::into).collect(),
            value: value.into(),
            ignore_err: false,
        }
    }

    /// Mark this setting as best effort.
    #[must_use]
    pub fn ignore_err(mut self) -> Self {
        self.ignore_err = true;
        self
    }

    /// Check that every key segment is a legal single path component.
    ///
    /// # Errors
    ///
    /// Returns [`SysctlError::EmptyName`] or [`SysctlError::IllegalSegment`].
    pub fn validate(&self) -> Result<(), SysctlError> {
        if self.name.is_empty() {
            return Err(SysctlError::EmptyName);
        }
        for segment in &self.name {
            if segment.is_empty()
                || segment == "."
                || segment == ".."
                || segment.contains('/')
                || segment.contains('\0')
            {
                return Err(SysctlError::IllegalSegment(segment.clone()));
            }
        }
        Ok(())
    }

    /// The path of this setting relative to `root` (normally `/proc/sys`).
    ///
    /// # Errors
    ///
    /// Fails if the key does not [`validate`](Self::validate).
    pub fn path_under(&self, root: &Path) -> Result<PathBuf, SysctlError> {
        self.validate()?;
        let mut path = root.to_path_buf();
        path.extend(&self.name);
        Ok(path)
    }
}

/// Renders the conventional dotted form, e.g. `net.ipv4.conf.eth0.forwarding`.
impl Display for Sysctl {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name.join("."))
    }
}

/// Something able to write kernel tunables.
pub trait SysctlApplier {
    /// Write a single setting.
    ///
    /// # Errors
    ///
    /// Implementation specific; the value was not written.
    fn write(&self, setting: &Sysctl) -> Result<(), SysctlError>;

    /// Apply `settings` in order.
    ///
    /// A failing setting marked [`Sysctl::ignore_err`] is logged and skipped.
    /// Any other failure stops the batch: later settings are not attempted.
    ///
    /// # Errors
    ///
    /// Returns the first failure of a setting which is not marked `ignore_err`.
    fn apply_settings(&self, settings: &[Sysctl]) -> Result<(), SysctlError> {
        for setting in settings {
            match self.write(setting) {
                Ok(()) => {
                    debug!(sysctl = %setting, value = %setting.value, "applied sysctl");
                }
                Err(err) if setting.ignore_err => {
                    warn!(sysctl = %setting, "ignoring failure to apply sysctl: {err}");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

impl<T: SysctlApplier + ?Sized> SysctlApplier for &T {
    fn write(&self, setting: &Sysctl) -> Result<(), SysctlError> {
        (**self).write(setting)
    }
}

/// Writes sysctl settings under a mounted procfs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcSysctl {
    root: PathBuf,
}

impl ProcSysctl {
    const DEFAULT_ROOT: &'static str = "/proc/sys";

    /// Locate procfs and check that `/proc/sys` really lives on it.
    ///
    /// # Errors
    ///
    /// Returns [`SysctlError::NotProcfs`] if `/proc/sys` is not on a procfs mount, or an io
    /// error if it can't be inspected.
    pub fn new() -> Result<Self, SysctlError> {
        let root = PathBuf::from(Self::DEFAULT_ROOT);
        match nix::sys::statfs::statfs(&root) {
            Ok(stats) if stats.filesystem_type() == nix::sys::statfs::PROC_SUPER_MAGIC => {}
            Ok(_) => return Err(SysctlError::NotProcfs(root)),
            Err(errno) => return Err(SysctlError::Io(errno.into())),
        }
        if let Ok(mounts) = procfs::mounts() {
            let count = mounts
                .iter()
                .filter(|mount| mount.fs_vfstype == "proc")
                .count();
            if count > 1 {
                info!("procfs is mounted {count} times; using {}", Self::DEFAULT_ROOT);
            }
        }
        Ok(Self { root })
    }

    /// Write settings relative to `root` instead of `/proc/sys`.
    ///
    /// No check is made that `root` is on a procfs; this exists for relocated or bind mounted
    /// sysctl trees.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory settings are written under.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl SysctlApplier for ProcSysctl {
    fn write(&self, setting: &Sysctl) -> Result<(), SysctlError> {
        let path = setting.path_under(&self.root)?;
        let to_err = |source| SysctlError::Write {
            name: setting.to_string(),
            value: setting.value.clone(),
            source,
        };
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(to_err)?;
        file.write_all(setting.value.as_bytes()).map_err(to_err)
    }
}

#[cfg(test)]
mod tests {
    use super::{ProcSysctl, Sysctl, SysctlApplier, SysctlError};
    use std::cell::RefCell;
    use std::path::Path;
    use tracing_test::traced_test;

    /// Records every write and fails the ones whose name ends with a given segment.
    struct Flaky {
        fail_on: &'static str,
        written: RefCell<Vec<String>>,
    }

    impl SysctlApplier for Flaky {
        fn write(&self, setting: &Sysctl) -> Result<(), SysctlError> {
            if setting.name.last().is_some_and(|last| last == self.fail_on) {
                return Err(SysctlError::Io(std::io::Error::other("nope")));
            }
            self.written.borrow_mut().push(setting.to_string());
            Ok(())
        }
    }

    fn batch(middle: Sysctl) -> Vec<Sysctl> {
        vec![
            Sysctl::new(["net", "ipv4", "conf", "eth0", "forwarding"], "1"),
            middle,
            Sysctl::new(["net", "ipv4", "conf", "eth0", "accept_local"], "1"),
        ]
    }

    #[test]
    fn dotted_display() {
        let setting = Sysctl::new(["net", "ipv6", "conf", "eth0.100", "forwarding"], "1");
        assert_eq!(setting.to_string(), "net.ipv6.conf.eth0.100.forwarding");
    }

    #[test]
    fn path_keeps_dots_inside_segments() {
        let setting = Sysctl::new(["net", "ipv4", "conf", "eth0.100", "rp_filter"], "0");
        assert_eq!(
            setting.path_under(Path::new("/proc/sys")).unwrap(),
            Path::new("/proc/sys/net/ipv4/conf/eth0.100/rp_filter")
        );
    }

    #[test]
    fn escaping_segments_are_rejected() {
        for bad in ["", ".", "..", "a/b"] {
            let setting = Sysctl::new(["net", bad, "x"], "1");
            assert!(matches!(
                setting.validate(),
                Err(SysctlError::IllegalSegment(_))
            ));
        }
        let empty = Sysctl::new(Vec::<String>::new(), "1");
        assert!(matches!(empty.validate(), Err(SysctlError::EmptyName)));
    }

    #[test]
    fn legal_segments_always_stay_under_root() {
        bolero::check!()
            .with_type()
            .for_each(|segments: &Vec<String>| {
                let setting = Sysctl::new(segments.clone(), "1");
                if let Ok(path) = setting.path_under(Path::new("/proc/sys")) {
                    assert!(path.starts_with("/proc/sys"));
                    assert_eq!(path.components().count(), 3 + segments.len());
                }
            });
    }

    #[test]
    #[traced_test]
    fn ignorable_failure_does_not_abort_batch() {
        let applier = Flaky {
            fail_on: "rp_filter",
            written: RefCell::default(),
        };
        let settings = batch(Sysctl::new(["net", "ipv4", "conf", "eth0", "rp_filter"], "0").ignore_err());
        applier.apply_settings(&settings).unwrap();
        assert_eq!(
            *applier.written.borrow(),
            vec![
                "net.ipv4.conf.eth0.forwarding".to_string(),
                "net.ipv4.conf.eth0.accept_local".to_string(),
            ]
        );
        assert!(logs_contain("ignoring failure to apply sysctl"));
    }

    #[test]
    fn fatal_failure_aborts_batch() {
        let applier = Flaky {
            fail_on: "rp_filter",
            written: RefCell::default(),
        };
        let settings = batch(Sysctl::new(["net", "ipv4", "conf", "eth0", "rp_filter"], "0"));
        assert!(applier.apply_settings(&settings).is_err());
        assert_eq!(
            *applier.written.borrow(),
            vec!["net.ipv4.conf.eth0.forwarding".to_string()]
        );
    }

    #[test]
    fn proc_sysctl_writes_under_root() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("net/ipv4/conf/cilium_host");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("forwarding"), "0").unwrap();

        let applier = ProcSysctl::with_root(root.path());
        applier
            .apply_settings(&[Sysctl::new(
                ["net", "ipv4", "conf", "cilium_host", "forwarding"],
                "1",
            )])
            .unwrap();
        assert_eq!(std::fs::read_to_string(dir.join("forwarding")).unwrap(), "1");
    }

    #[test]
    fn proc_sysctl_missing_key_names_the_setting() {
        let root = tempfile::tempdir().unwrap();
        let applier = ProcSysctl::with_root(root.path());
        let err = applier
            .write(&Sysctl::new(["net", "ipv4", "conf", "nope", "forwarding"], "1"))
            .unwrap_err();
        assert!(matches!(err, SysctlError::Write { ref name, .. } if name == "net.ipv4.conf.nope.forwarding"));
    }
}
