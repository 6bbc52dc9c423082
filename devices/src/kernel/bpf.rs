// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Programs attached to a device through tcx or netkit, via the `bpf(2)` syscall.
//!
//! Only three commands are needed: `BPF_PROG_QUERY` to list the program ids at an attach point,
//! `BPF_PROG_GET_FD_BY_ID` to open each program, and `BPF_OBJ_GET_INFO_BY_FD` to read its name.

use super::{AttachPoint, AttachedProgram, KernelError};
use nix::errno::Errno;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tracing::trace;

const BPF_PROG_GET_FD_BY_ID: libc::c_long = 13;
const BPF_OBJ_GET_INFO_BY_FD: libc::c_long = 15;
const BPF_PROG_QUERY: libc::c_long = 16;

/// Initial capacity of the program id buffer; grown if the kernel reports more.
const INITIAL_PROG_IDS: usize = 16;

/// Offset and length of `name` in `struct bpf_prog_info`.
const PROG_NAME_OFFSET: usize = 64;
const PROG_NAME_LEN: usize = 16;

/// The `BPF_PROG_QUERY` member of `union bpf_attr`.
#[repr(C)]
#[derive(Default)]
struct ProgQueryAttr {
    target_ifindex: u32,
    attach_type: u32,
    query_flags: u32,
    attach_flags: u32,
    prog_ids: u64,
    prog_cnt: u32,
    _pad: u32,
    prog_attach_flags: u64,
    link_ids: u64,
    link_attach_flags: u64,
    revision: u64,
}

/// The `BPF_PROG_GET_FD_BY_ID` member of `union bpf_attr`.
#[repr(C)]
#[derive(Default)]
struct GetFdByIdAttr {
    prog_id: u32,
    next_id: u32,
    open_flags: u32,
}

/// The `BPF_OBJ_GET_INFO_BY_FD` member of `union bpf_attr`.
#[repr(C)]
#[derive(Default)]
struct InfoByFdAttr {
    bpf_fd: u32,
    info_len: u32,
    info: u64,
}

/// Enough of `struct bpf_prog_info` to reach `name`.
#[repr(C, align(8))]
struct ProgInfo([u8; PROG_NAME_OFFSET + PROG_NAME_LEN]);

/// Issue one `bpf(2)` command.
///
/// # Safety
///
/// `attr` must be the member of `union bpf_attr` which `cmd` expects, and every pointer stored
/// in it must be valid for the access the kernel makes through it.
#[allow(unsafe_code)]
unsafe fn bpf<T>(cmd: libc::c_long, attr: &mut T) -> Result<libc::c_long, Errno> {
    // SAFETY: upheld by the caller
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            std::ptr::from_mut(attr),
            std::mem::size_of::<T>(),
        )
    };
    if ret < 0 { Err(Errno::last()) } else { Ok(ret) }
}

/// The ids of the programs attached to `ifindex` at `attach`.
///
/// Kernels which don't know `attach`, and devices which can't carry it (netkit attach points on a
/// non-netkit device), have no programs.
fn prog_ids(ifindex: u32, attach: AttachPoint) -> Result<Vec<u32>, KernelError> {
    let mut ids = vec![0u32; INITIAL_PROG_IDS];
    loop {
        let mut attr = ProgQueryAttr {
            target_ifindex: ifindex,
            attach_type: attach.bpf_attach_type(),
            prog_ids: ids.as_mut_ptr() as u64,
            prog_cnt: u32::try_from(ids.len()).unwrap_or(u32::MAX),
            ..ProgQueryAttr::default()
        };
        #[allow(unsafe_code)]
        // SAFETY: `prog_ids` points at `prog_cnt` writable u32s which outlive the call
        let result = unsafe { bpf(BPF_PROG_QUERY, &mut attr) };
        match result {
            Ok(_) => {
                ids.truncate(attr.prog_cnt as usize);
                return Ok(ids);
            }
            Err(Errno::ENOSPC) if attr.prog_cnt as usize > ids.len() => {
                ids.resize(attr.prog_cnt as usize, 0);
            }
            Err(Errno::EINVAL | Errno::EOPNOTSUPP | Errno::ENXIO) => {
                trace!(ifindex, %attach, "attach point not supported here");
                return Ok(vec![]);
            }
            Err(Errno::ENODEV) => return Err(KernelError::NotFound(ifindex.to_string())),
            Err(errno) => return Err(KernelError::Errno(errno)),
        }
    }
}

/// The name of program `id`, or `None` if it was unloaded in the meantime.
fn prog_name(id: u32) -> Result<Option<String>, KernelError> {
    let mut attr = GetFdByIdAttr {
        prog_id: id,
        ..GetFdByIdAttr::default()
    };
    #[allow(unsafe_code)]
    // SAFETY: the attr holds no pointers
    let fd = match unsafe { bpf(BPF_PROG_GET_FD_BY_ID, &mut attr) } {
        Ok(fd) => fd,
        Err(Errno::ENOENT) => return Ok(None),
        Err(errno) => return Err(KernelError::Errno(errno)),
    };
    let fd = i32::try_from(fd).map_err(|_| KernelError::Malformed(format!("fd {fd}")))?;
    #[allow(unsafe_code)]
    // SAFETY: the kernel just handed us this descriptor and nothing else owns it
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut info = ProgInfo([0; PROG_NAME_OFFSET + PROG_NAME_LEN]);
    let mut attr = InfoByFdAttr {
        bpf_fd: u32::try_from(fd.as_raw_fd()).unwrap_or_default(),
        info_len: u32::try_from(info.0.len()).unwrap_or_default(),
        info: info.0.as_mut_ptr() as u64,
    };
    #[allow(unsafe_code)]
    // SAFETY: `info` points at `info_len` writable bytes which outlive the call
    let result = unsafe { bpf(BPF_OBJ_GET_INFO_BY_FD, &mut attr) };
    result.map_err(KernelError::Errno)?;

    let name = &info.0[PROG_NAME_OFFSET..];
    let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    Ok(Some(String::from_utf8_lossy(&name[..len]).into_owned()))
}

/// Programs attached to `ifindex` at `attach`, with their names.
pub(super) fn attached_programs(
    ifindex: u32,
    attach: AttachPoint,
) -> Result<Vec<AttachedProgram>, KernelError> {
    let mut programs = Vec::new();
    for id in prog_ids(ifindex, attach)? {
        if let Some(name) = prog_name(id)? {
            programs.push(AttachedProgram { id, name });
        }
    }
    Ok(programs)
}
