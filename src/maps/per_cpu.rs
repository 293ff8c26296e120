//! Per-CPU map views.
//!
//! One logical key maps to one independent value slot per possible CPU.
//! Reads return a [`PerCpuValues`] indexed by CPU id; writes either
//! replicate a single value into every slot or take an already expanded
//! sequence whose length must match the CPU count exactly.
use std::marker::PhantomData;

use super::{IterableMap, Map, MapError, MapIter, MapKeys, PerCpuValues};
use crate::{bytes_of, obj::MapType, Pod};

fn check_per_cpu_kv<K: Pod, V: Pod>(map: &Map) -> Result<(), MapError> {
    let size = std::mem::size_of::<K>();
    let expected = map.spec.key_size() as usize;
    if size != expected {
        return Err(MapError::InvalidKeySize { size, expected });
    }

    // the declared value size is the size of one CPU's slot
    let size = std::mem::size_of::<V>();
    let expected = map.spec.value_size() as usize;
    if size != expected {
        return Err(MapError::InvalidValueSize { size, expected });
    }

    Ok(())
}

fn get_per_cpu<V: Pod>(map: &Map, key: &[u8]) -> Result<Option<PerCpuValues<V>>, MapError> {
    let value = map.lookup_bytes(key)?;
    let nr_cpus = map.kernel.nr_cpus();
    Ok(value.map(|bytes| PerCpuValues::from_kernel_bytes(&bytes, nr_cpus)))
}

fn insert_per_cpu<V: Pod>(
    map: &Map,
    key: &[u8],
    values: &PerCpuValues<V>,
    flags: u64,
) -> Result<(), MapError> {
    let nr_cpus = map.kernel.nr_cpus();
    if values.len() != nr_cpus {
        return Err(MapError::InvalidPerCpuValueCount {
            expected: nr_cpus,
            got: values.len(),
        });
    }
    map.update_bytes(key, &values.to_kernel_bytes(), flags)
}

fn replicate<V: Pod>(map: &Map, value: V) -> PerCpuValues<V> {
    vec![value; map.kernel.nr_cpus()].into()
}

/// A typed view over a `PERCPU_HASH` or `LRU_PERCPU_HASH` map.
pub struct PerCpuHashMap<T: AsRef<Map>, K, V> {
    inner: T,
    _k: PhantomData<K>,
    _v: PhantomData<V>,
}

impl<T: AsRef<Map>, K: Pod, V: Pod> PerCpuHashMap<T, K, V> {
    pub fn new(map: T) -> Result<PerCpuHashMap<T, K, V>, MapError> {
        let inner = map.as_ref();
        if !matches!(
            inner.spec.map_type(),
            MapType::PerCpuHash | MapType::LruPerCpuHash
        ) {
            return Err(MapError::InvalidMapType {
                name: inner.spec.name().to_string(),
            });
        }
        check_per_cpu_kv::<K, V>(inner)?;

        Ok(PerCpuHashMap {
            inner: map,
            _k: PhantomData,
            _v: PhantomData,
        })
    }

    /// One value per possible CPU, indexed by CPU id.
    pub fn get(&self, key: &K) -> Result<Option<PerCpuValues<V>>, MapError> {
        get_per_cpu(self.inner.as_ref(), bytes_of(key))
    }

    pub fn iter(&self) -> MapIter<'_, K, PerCpuValues<V>, Self> {
        MapIter::new(self)
    }

    pub fn keys(&self) -> MapKeys<'_, K> {
        MapKeys::new(self.inner.as_ref())
    }
}

impl<T: AsRef<Map> + AsMut<Map>, K: Pod, V: Pod> PerCpuHashMap<T, K, V> {
    /// Write one slot per CPU; `values` must hold exactly one value per
    /// possible CPU.
    pub fn insert(&mut self, key: K, values: PerCpuValues<V>, flags: u64) -> Result<(), MapError> {
        insert_per_cpu(self.inner.as_ref(), bytes_of(&key), &values, flags)
    }

    /// Write the same value into every CPU's slot.
    pub fn insert_all(&mut self, key: K, value: V, flags: u64) -> Result<(), MapError> {
        let values = replicate(self.inner.as_ref(), value);
        insert_per_cpu(self.inner.as_ref(), bytes_of(&key), &values, flags)
    }

    pub fn remove(&mut self, key: &K) -> Result<(), MapError> {
        self.inner.as_ref().delete_bytes(bytes_of(key))
    }
}

impl<'a, K: Pod, V: Pod> TryFrom<&'a Map> for PerCpuHashMap<&'a Map, K, V> {
    type Error = MapError;

    fn try_from(map: &'a Map) -> Result<PerCpuHashMap<&'a Map, K, V>, MapError> {
        PerCpuHashMap::new(map)
    }
}

impl<'a, K: Pod, V: Pod> TryFrom<&'a mut Map> for PerCpuHashMap<&'a mut Map, K, V> {
    type Error = MapError;

    fn try_from(map: &'a mut Map) -> Result<PerCpuHashMap<&'a mut Map, K, V>, MapError> {
        PerCpuHashMap::new(map)
    }
}

impl<T: AsRef<Map>, K: Pod, V: Pod> IterableMap<K, PerCpuValues<V>> for PerCpuHashMap<T, K, V> {
    fn map(&self) -> &Map {
        self.inner.as_ref()
    }

    fn get(&self, key: &K) -> Result<Option<PerCpuValues<V>>, MapError> {
        PerCpuHashMap::get(self, key)
    }
}

/// A typed view over a `PERCPU_ARRAY` map.
pub struct PerCpuArray<T: AsRef<Map>, V> {
    inner: T,
    _v: PhantomData<V>,
}

impl<T: AsRef<Map>, V: Pod> PerCpuArray<T, V> {
    pub fn new(map: T) -> Result<PerCpuArray<T, V>, MapError> {
        let inner = map.as_ref();
        if inner.spec.map_type() != MapType::PerCpuArray {
            return Err(MapError::InvalidMapType {
                name: inner.spec.name().to_string(),
            });
        }
        check_per_cpu_kv::<u32, V>(inner)?;

        Ok(PerCpuArray {
            inner: map,
            _v: PhantomData,
        })
    }

    pub fn len(&self) -> u32 {
        self.inner.as_ref().spec.max_entries()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One value per possible CPU for the given slot.
    pub fn get(&self, index: u32) -> Result<PerCpuValues<V>, MapError> {
        self.check_bounds(index)?;
        get_per_cpu(self.inner.as_ref(), bytes_of(&index))?.ok_or(MapError::KeyNotFound)
    }

    fn check_bounds(&self, index: u32) -> Result<(), MapError> {
        let max_entries = self.inner.as_ref().spec.max_entries();
        if index >= max_entries {
            return Err(MapError::OutOfBounds { index, max_entries });
        }
        Ok(())
    }
}

impl<T: AsRef<Map> + AsMut<Map>, V: Pod> PerCpuArray<T, V> {
    pub fn set(&mut self, index: u32, values: PerCpuValues<V>, flags: u64) -> Result<(), MapError> {
        self.check_bounds(index)?;
        insert_per_cpu(self.inner.as_ref(), bytes_of(&index), &values, flags)
    }

    /// Write the same value into every CPU's slot at `index`.
    pub fn set_all(&mut self, index: u32, value: V, flags: u64) -> Result<(), MapError> {
        self.check_bounds(index)?;
        let values = replicate(self.inner.as_ref(), value);
        insert_per_cpu(self.inner.as_ref(), bytes_of(&index), &values, flags)
    }
}

impl<'a, V: Pod> TryFrom<&'a Map> for PerCpuArray<&'a Map, V> {
    type Error = MapError;

    fn try_from(map: &'a Map) -> Result<PerCpuArray<&'a Map, V>, MapError> {
        PerCpuArray::new(map)
    }
}

impl<'a, V: Pod> TryFrom<&'a mut Map> for PerCpuArray<&'a mut Map, V> {
    type Error = MapError;

    fn try_from(map: &'a mut Map) -> Result<PerCpuArray<&'a mut Map, V>, MapError> {
        PerCpuArray::new(map)
    }
}
