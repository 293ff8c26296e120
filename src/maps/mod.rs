//! Handles for the kernel maps owned by a [`Bpf`](crate::Bpf) collection,
//! and typed views over them.
//!
//! [`Map`] owns the kernel resource. The typed wrappers ([`HashMap`],
//! [`Array`], [`PerCpuHashMap`], [`PerCpuArray`], [`ProgramArray`],
//! [`DevMap`], [`PerfEventArray`]) check key/value sizes against the map's
//! declaration once, then expose the operations that make sense for the
//! type.
use std::{io, marker::PhantomData, mem, ops::Deref, sync::Arc};

use log::{debug, warn};
use thiserror::Error;

use crate::{
    bytes_of, pod_from_bytes,
    obj::MapSpec,
    sys::Kernel,
    util::percpu_slot_size,
    Pod, RawFd,
};

mod array;
mod dev_map;
mod hash_map;
mod per_cpu;
mod perf_map;
mod prog_array;

pub use array::Array;
pub use dev_map::DevMap;
pub use hash_map::HashMap;
pub use per_cpu::{PerCpuArray, PerCpuHashMap};
pub use perf_map::{PerfEventArray, PerfEventArrayBuffer, PerfMapError};
pub use prog_array::ProgramArray;

pub use crate::sys::Events;

#[derive(Error, Debug)]
pub enum MapError {
    #[error("the map `{name}` cannot be accessed through this view")]
    InvalidMapType { name: String },

    #[error("invalid key size {size}, expected {expected}")]
    InvalidKeySize { size: usize, expected: usize },

    #[error("invalid value size {size}, expected {expected}")]
    InvalidValueSize { size: usize, expected: usize },

    #[error("failed to create map `{name}`: {io_error}")]
    CreateFailed {
        name: String,
        code: i64,
        #[source]
        io_error: io::Error,
    },

    #[error("the map `{name}` is closed")]
    Closed { name: String },

    #[error("key not found")]
    KeyNotFound,

    #[error("the map `{name}` is full")]
    OutOfCapacity { name: String },

    #[error("the map `{name}` does not support element deletion")]
    DeleteNotSupported { name: String },

    #[error("index {index} is out of bounds, max_entries is {max_entries}")]
    OutOfBounds { index: u32, max_entries: u32 },

    #[error("expected one value per CPU ({expected}), got {got}")]
    InvalidPerCpuValueCount { expected: usize, got: usize },

    #[error("the program is not loaded")]
    ProgramNotLoaded,

    #[error("the `{call}` syscall failed with code {code}: {io_error}")]
    SyscallFailed {
        call: &'static str,
        code: i64,
        #[source]
        io_error: io::Error,
    },
}

/// One live kernel map. Exclusive owner of the underlying fd: closing (or
/// dropping) the handle releases the kernel resource.
#[derive(Debug)]
pub struct Map {
    pub(crate) spec: MapSpec,
    pub(crate) fd: Option<RawFd>,
    pub(crate) kernel: Arc<dyn Kernel>,
}

impl Map {
    /// Issue the creation request for a validated spec. Kernel failures
    /// (privilege, resource limits, type rejection) are surfaced verbatim.
    pub(crate) fn create(spec: MapSpec, kernel: Arc<dyn Kernel>) -> Result<Map, MapError> {
        let fd = kernel.map_create(&spec).map_err(|(code, io_error)| {
            MapError::CreateFailed {
                name: spec.name().to_string(),
                code,
                io_error,
            }
        })? as RawFd;
        debug!("created map `{}` with fd {}", spec.name(), fd);

        Ok(Map {
            spec,
            fd: Some(fd),
            kernel,
        })
    }

    /// The declaration this map was created from.
    pub fn spec(&self) -> &MapSpec {
        &self.spec
    }

    /// Release the kernel resource. Every subsequent operation on this
    /// handle fails with [`MapError::Closed`].
    pub fn close(&mut self) -> Result<(), MapError> {
        let fd = self.fd.take().ok_or(MapError::Closed {
            name: self.spec.name().to_string(),
        })?;
        self.kernel
            .close(fd)
            .map(|_| ())
            .map_err(|(code, io_error)| MapError::SyscallFailed {
                call: "close",
                code,
                io_error,
            })
    }

    pub(crate) fn fd_or_closed(&self) -> Result<RawFd, MapError> {
        self.fd.ok_or(MapError::Closed {
            name: self.spec.name().to_string(),
        })
    }

    /// The size of the buffer one value occupies on the kernel boundary;
    /// per-CPU maps fan out to one aligned slot per possible CPU.
    pub(crate) fn kernel_value_size(&self) -> usize {
        let declared = self.spec.value_size() as usize;
        if self.spec.map_type().is_per_cpu() {
            self.kernel.nr_cpus() * percpu_slot_size(declared)
        } else {
            declared
        }
    }

    pub(crate) fn lookup_bytes(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MapError> {
        let fd = self.fd_or_closed()?;
        let mut value = vec![0u8; self.kernel_value_size()];
        match self.kernel.map_lookup_elem(fd, key, &mut value) {
            Ok(_) => Ok(Some(value)),
            Err((_, io_error)) if io_error.raw_os_error() == Some(libc::ENOENT) => Ok(None),
            Err((code, io_error)) => Err(MapError::SyscallFailed {
                call: "bpf_map_lookup_elem",
                code,
                io_error,
            }),
        }
    }

    pub(crate) fn update_bytes(&self, key: &[u8], value: &[u8], flags: u64) -> Result<(), MapError> {
        let fd = self.fd_or_closed()?;
        match self.kernel.map_update_elem(fd, key, value, flags) {
            Ok(_) => Ok(()),
            // a full non-LRU map rejects the insert; LRU maps evict instead
            // and never report this
            Err((_, io_error))
                if matches!(io_error.raw_os_error(), Some(libc::E2BIG) | Some(libc::ENOSPC)) =>
            {
                Err(MapError::OutOfCapacity {
                    name: self.spec.name().to_string(),
                })
            }
            Err((code, io_error)) => Err(MapError::SyscallFailed {
                call: "bpf_map_update_elem",
                code,
                io_error,
            }),
        }
    }

    pub(crate) fn delete_bytes(&self, key: &[u8]) -> Result<(), MapError> {
        // array-backed types never support deletes, save the syscall
        if self.spec.map_type().is_array_family() {
            return Err(MapError::DeleteNotSupported {
                name: self.spec.name().to_string(),
            });
        }
        let fd = self.fd_or_closed()?;
        match self.kernel.map_delete_elem(fd, key) {
            Ok(_) => Ok(()),
            Err((_, io_error)) if io_error.raw_os_error() == Some(libc::ENOENT) => {
                Err(MapError::KeyNotFound)
            }
            Err((code, io_error)) => Err(MapError::SyscallFailed {
                call: "bpf_map_delete_elem",
                code,
                io_error,
            }),
        }
    }

    pub(crate) fn next_key_bytes(&self, key: Option<&[u8]>) -> Result<Option<Vec<u8>>, MapError> {
        let fd = self.fd_or_closed()?;
        let mut next_key = vec![0u8; self.spec.key_size() as usize];
        match self.kernel.map_get_next_key(fd, key, &mut next_key) {
            Ok(_) => Ok(Some(next_key)),
            Err((_, io_error)) if io_error.raw_os_error() == Some(libc::ENOENT) => Ok(None),
            Err((code, io_error)) => Err(MapError::SyscallFailed {
                call: "bpf_map_get_next_key",
                code,
                io_error,
            }),
        }
    }
}

impl Drop for Map {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take() {
            if self.kernel.close(fd).is_err() {
                warn!("failed to release map `{}`", self.spec.name());
            }
        }
    }
}

impl AsRef<Map> for &Map {
    fn as_ref(&self) -> &Map {
        self
    }
}

impl AsRef<Map> for &mut Map {
    fn as_ref(&self) -> &Map {
        self
    }
}

impl AsMut<Map> for &mut Map {
    fn as_mut(&mut self) -> &mut Map {
        self
    }
}

pub(crate) fn check_kv_size<K: Pod, V: Pod>(map: &Map) -> Result<(), MapError> {
    let size = mem::size_of::<K>();
    let expected = map.spec.key_size() as usize;
    if size != expected {
        return Err(MapError::InvalidKeySize { size, expected });
    }

    let size = mem::size_of::<V>();
    let expected = map.spec.value_size() as usize;
    if size != expected {
        return Err(MapError::InvalidValueSize { size, expected });
    }

    Ok(())
}

/// One value per possible CPU, indexed by CPU id, as read from or written
/// to a per-CPU map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerCpuValues<T: Pod> {
    values: Box<[T]>,
}

impl<T: Pod> From<Vec<T>> for PerCpuValues<T> {
    fn from(values: Vec<T>) -> Self {
        PerCpuValues {
            values: values.into_boxed_slice(),
        }
    }
}

impl<T: Pod> Deref for PerCpuValues<T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        &self.values
    }
}

impl<T: Pod> PerCpuValues<T> {
    pub(crate) fn from_kernel_bytes(bytes: &[u8], nr_cpus: usize) -> PerCpuValues<T> {
        let slot = percpu_slot_size(mem::size_of::<T>());
        let values = (0..nr_cpus)
            .map(|cpu| pod_from_bytes(&bytes[cpu * slot..]))
            .collect::<Vec<_>>();
        values.into()
    }

    pub(crate) fn to_kernel_bytes(&self) -> Vec<u8> {
        let slot = percpu_slot_size(mem::size_of::<T>());
        let mut out = vec![0u8; self.values.len() * slot];
        for (cpu, value) in self.values.iter().enumerate() {
            out[cpu * slot..cpu * slot + mem::size_of::<T>()].copy_from_slice(bytes_of(value));
        }
        out
    }
}

/// Implemented by typed map views that can be walked with [`MapIter`].
pub trait IterableMap<K: Pod, V> {
    fn map(&self) -> &Map;
    fn get(&self, key: &K) -> Result<Option<V>, MapError>;
}

/// Lazily yields every key in a map. Restarts from the beginning each time
/// it is created; the order is whatever the kernel exposes and must only be
/// relied on for completeness.
pub struct MapKeys<'coll, K: Pod> {
    map: &'coll Map,
    err: bool,
    key: Option<K>,
}

impl<'coll, K: Pod> MapKeys<'coll, K> {
    pub(crate) fn new(map: &'coll Map) -> MapKeys<'coll, K> {
        MapKeys {
            map,
            err: false,
            key: None,
        }
    }
}

impl<K: Pod> Iterator for MapKeys<'_, K> {
    type Item = Result<K, MapError>;

    fn next(&mut self) -> Option<Result<K, MapError>> {
        if self.err {
            return None;
        }

        let key_bytes = self.key.as_ref().map(bytes_of);
        match self.map.next_key_bytes(key_bytes) {
            Ok(Some(bytes)) => {
                let key = pod_from_bytes(&bytes);
                self.key = Some(key);
                Some(Ok(key))
            }
            Ok(None) => {
                self.key = None;
                None
            }
            Err(e) => {
                self.err = true;
                Some(Err(e))
            }
        }
    }
}

/// Lazily yields every (key, value) pair in a map. Keys deleted between the
/// key walk and the value lookup are skipped.
pub struct MapIter<'coll, K: Pod, V, I: IterableMap<K, V>> {
    keys: MapKeys<'coll, K>,
    map: &'coll I,
    _v: PhantomData<V>,
}

impl<'coll, K: Pod, V, I: IterableMap<K, V>> MapIter<'coll, K, V, I> {
    pub(crate) fn new(map: &'coll I) -> MapIter<'coll, K, V, I> {
        MapIter {
            keys: MapKeys::new(map.map()),
            map,
            _v: PhantomData,
        }
    }
}

impl<K: Pod, V, I: IterableMap<K, V>> Iterator for MapIter<'_, K, V, I> {
    type Item = Result<(K, V), MapError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.keys.next() {
                Some(Ok(key)) => match self.map.get(&key) {
                    Ok(None) => continue,
                    Ok(Some(value)) => return Some(Ok((key, value))),
                    Err(e) => return Some(Err(e)),
                },
                Some(Err(e)) => return Some(Err(e)),
                None => return None,
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::sync::Arc;

    use super::Map;
    use crate::{
        obj::{fixture::map_def, MapSpec},
        sys::fake::FakeKernel,
    };

    pub(crate) const NR_CPUS: usize = 4;

    pub(crate) fn new_kernel() -> Arc<FakeKernel> {
        Arc::new(FakeKernel::new(NR_CPUS))
    }

    pub(crate) fn new_map(
        kernel: &Arc<FakeKernel>,
        name: &str,
        map_type: u32,
        key_size: u32,
        value_size: u32,
        max_entries: u32,
    ) -> Map {
        let spec = MapSpec::new(
            name,
            &map_def(map_type, key_size, value_size, max_entries),
            NR_CPUS as u32,
        )
        .unwrap();
        Map::create(spec, kernel.clone()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::test_utils::*;
    use super::*;
    use crate::abi::{BPF_MAP_TYPE_ARRAY, BPF_MAP_TYPE_HASH};

    #[test]
    fn test_create_then_close() {
        let kernel = new_kernel();
        let mut map = new_map(&kernel, "m", BPF_MAP_TYPE_HASH, 4, 4, 8);
        assert_eq!(kernel.resource_count(), 1);

        map.close().unwrap();
        assert_eq!(kernel.resource_count(), 0);

        // the handle is now dead
        assert_matches!(map.close(), Err(MapError::Closed { .. }));
        assert_matches!(map.lookup_bytes(&[0; 4]), Err(MapError::Closed { .. }));
        assert_matches!(
            map.update_bytes(&[0; 4], &[0; 4], 0),
            Err(MapError::Closed { .. })
        );
    }

    #[test]
    fn test_drop_releases_fd() {
        let kernel = new_kernel();
        {
            let _map = new_map(&kernel, "m", BPF_MAP_TYPE_HASH, 4, 4, 8);
            assert_eq!(kernel.resource_count(), 1);
        }
        assert_eq!(kernel.resource_count(), 0);
    }

    #[test]
    fn test_create_failed() {
        let kernel = new_kernel();
        kernel.fail_map_creates_after(0);
        let spec = MapSpec::new(
            "m",
            &crate::obj::fixture::map_def(BPF_MAP_TYPE_HASH, 4, 4, 8),
            NR_CPUS as u32,
        )
        .unwrap();
        let kernel_dyn: std::sync::Arc<dyn crate::sys::Kernel> = kernel.clone();
        let res = Map::create(spec, kernel_dyn);
        assert_matches!(
            res,
            Err(MapError::CreateFailed { name, io_error, .. })
                if name == "m" && io_error.raw_os_error() == Some(libc::EPERM)
        );
        assert_eq!(kernel.resource_count(), 0);
    }

    #[test]
    fn test_delete_not_supported_on_arrays() {
        let kernel = new_kernel();
        let map = new_map(&kernel, "a", BPF_MAP_TYPE_ARRAY, 4, 4, 8);
        assert_matches!(
            map.delete_bytes(&0u32.to_ne_bytes()),
            Err(MapError::DeleteNotSupported { .. })
        );
    }

    #[test]
    fn test_per_cpu_values_round_trip() {
        let values: PerCpuValues<u32> = vec![1u32, 2, 3, 4].into();
        let bytes = values.to_kernel_bytes();
        assert_eq!(bytes.len(), 4 * 8);
        let back = PerCpuValues::<u32>::from_kernel_bytes(&bytes, 4);
        assert_eq!(&*back, &[1, 2, 3, 4]);
    }
}
