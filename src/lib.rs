//! A user-space eBPF loader.
//!
//! `bpfload` takes a compiled eBPF object file, creates the kernel maps it
//! declares, rewrites the program bytecode to reference those maps and loads
//! the programs through the kernel verifier. Everything produced by one load
//! is owned by a single [`Bpf`] collection.
//!
//! ```no_run
//! use bpfload::Bpf;
//!
//! let mut bpf = Bpf::load_file("filter.o")?;
//! let mut counters = bpfload::maps::HashMap::<_, u32, u64>::try_from(
//!     bpf.map_mut("counters").unwrap(),
//! )?;
//! counters.insert(1234, 0, 0)?;
//! # Ok::<(), bpfload::BpfError>(())
//! ```
#![deny(clippy::all)]

mod abi;
mod bpf;
pub mod maps;
mod obj;
pub mod programs;
pub mod sys;
mod util;

pub use abi::{BPF_ANY, BPF_EXIST, BPF_NOEXIST};
pub use bpf::{Bpf, BpfError, BpfLoader, CloseError};
pub use obj::{MapSpec, MapSpecError, MapType, ParseError, ProgramKind, RelocationError};

pub(crate) use std::os::fd::RawFd;

/// A marker trait for types that can be passed to and returned from map
/// operations as raw bytes.
///
/// # Safety
///
/// Implementors must be `repr(C)` (or a primitive) with no padding and no
/// invalid bit patterns, since values are copied to and from kernel memory
/// byte for byte.
pub unsafe trait Pod: Copy + 'static {}

macro_rules! unsafe_impl_pod {
    ($($struct_name:ident),+ $(,)?) => {
        $(
            unsafe impl Pod for $struct_name { }
        )+
    }
}

unsafe_impl_pod!(i8, u8, i16, u16, i32, u32, i64, u64);

pub(crate) fn bytes_of<T: Pod>(val: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts(val as *const T as *const u8, std::mem::size_of::<T>()) }
}

pub(crate) fn pod_from_bytes<T: Pod>(bytes: &[u8]) -> T {
    assert!(bytes.len() >= std::mem::size_of::<T>());
    unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) }
}
