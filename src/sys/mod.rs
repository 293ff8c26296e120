//! The kernel interface boundary.
//!
//! Everything privileged the loader does goes through the [`Kernel`] trait:
//! map and program syscalls, link creation and perf event channels. The
//! loader and every handle it produces carry an `Arc<dyn Kernel>`, so an
//! alternative implementation can be substituted wholesale — the test suite
//! runs against an in-memory one.
mod bpf;
#[cfg(test)]
pub(crate) mod fake;

use std::{ffi::CStr, fmt, io};

use bytes::BytesMut;

use crate::{MapSpec, RawFd};

pub use bpf::SysKernel;

/// Raw result of a kernel call: the return value, or the failing return
/// value paired with the `errno` it set.
pub type SysResult = Result<i64, (i64, io::Error)>;

/// The privileged kernel surface consumed by the loader.
///
/// Methods mirror the underlying syscalls and report errors verbatim;
/// classification (not-found, capacity, permissions) happens in the layers
/// above.
pub trait Kernel: fmt::Debug + Send + Sync {
    /// Number of possible CPUs; the fan-out factor for per-CPU maps and the
    /// default capacity of perf event arrays.
    fn nr_cpus(&self) -> usize;

    /// `BPF_MAP_CREATE`. Returns the new map fd.
    fn map_create(&self, spec: &MapSpec) -> SysResult;

    /// `BPF_MAP_LOOKUP_ELEM`. `value` must be sized for the map's full
    /// value (times the CPU count for per-CPU maps).
    fn map_lookup_elem(&self, fd: RawFd, key: &[u8], value: &mut [u8]) -> SysResult;

    /// `BPF_MAP_UPDATE_ELEM`.
    fn map_update_elem(&self, fd: RawFd, key: &[u8], value: &[u8], flags: u64) -> SysResult;

    /// `BPF_MAP_DELETE_ELEM`.
    fn map_delete_elem(&self, fd: RawFd, key: &[u8]) -> SysResult;

    /// `BPF_MAP_GET_NEXT_KEY`. `key: None` asks for the first key.
    fn map_get_next_key(&self, fd: RawFd, key: Option<&[u8]>, next_key: &mut [u8]) -> SysResult;

    /// `BPF_PROG_LOAD`. `instructions` is the raw stream, 8 bytes per
    /// instruction. The verifier writes its diagnostic into `log_buf` when
    /// one is supplied.
    fn prog_load(
        &self,
        prog_type: u32,
        instructions: &[u8],
        license: &CStr,
        kernel_version: u32,
        log_buf: &mut [u8],
    ) -> SysResult;

    /// `BPF_LINK_CREATE`: attach a loaded program to a target (for XDP, a
    /// network interface index). Returns the link fd; closing it detaches.
    fn link_create(&self, prog_fd: RawFd, target: u32, attach_type: u32, flags: u32) -> SysResult;

    /// Open (and enable) one per-CPU perf event channel for
    /// `PERF_COUNT_SW_BPF_OUTPUT` samples. Returns the event fd.
    fn perf_event_open(&self, cpu: u32) -> SysResult;

    /// Drain pending samples from a perf event channel into `buffers`, one
    /// sample per buffer.
    fn perf_event_read(
        &self,
        fd: RawFd,
        buffers: &mut [BytesMut],
    ) -> Result<Events, (i64, io::Error)>;

    /// Release a map, program, link or perf event fd.
    fn close(&self, fd: RawFd) -> SysResult;
}

/// Outcome of draining a perf event channel.
#[derive(Debug, PartialEq, Eq)]
pub struct Events {
    /// Samples copied out.
    pub read: usize,
    /// Samples the kernel dropped because the channel was full.
    pub lost: usize,
}
