use std::marker::PhantomData;

use super::{check_kv_size, IterableMap, Map, MapError, MapIter, MapKeys};
use crate::{bytes_of, obj::MapType, pod_from_bytes, Pod};

/// A typed view over a hash map.
///
/// Works with `HASH` and `LRU_HASH` maps. The two share every operation;
/// they differ when full: a plain hash map rejects further inserts with
/// [`MapError::OutOfCapacity`], an LRU map evicts its least recently used
/// entry and accepts the insert.
#[derive(Debug)]
pub struct HashMap<T: AsRef<Map>, K, V> {
    inner: T,
    _k: PhantomData<K>,
    _v: PhantomData<V>,
}

impl<T: AsRef<Map>, K: Pod, V: Pod> HashMap<T, K, V> {
    pub fn new(map: T) -> Result<HashMap<T, K, V>, MapError> {
        let inner = map.as_ref();
        if !matches!(inner.spec.map_type(), MapType::Hash | MapType::LruHash) {
            return Err(MapError::InvalidMapType {
                name: inner.spec.name().to_string(),
            });
        }
        check_kv_size::<K, V>(inner)?;

        Ok(HashMap {
            inner: map,
            _k: PhantomData,
            _v: PhantomData,
        })
    }

    /// Look a key up; `Ok(None)` means the key is not in the map.
    pub fn get(&self, key: &K) -> Result<Option<V>, MapError> {
        let value = self.inner.as_ref().lookup_bytes(bytes_of(key))?;
        Ok(value.map(|bytes| pod_from_bytes(&bytes)))
    }

    /// An iterator over every (key, value) pair, in the order the kernel
    /// exposes keys. Restarts from the first key every time it is created.
    pub fn iter(&self) -> MapIter<'_, K, V, Self> {
        MapIter::new(self)
    }

    /// An iterator over every key.
    pub fn keys(&self) -> MapKeys<'_, K> {
        MapKeys::new(self.inner.as_ref())
    }
}

impl<T: AsRef<Map> + AsMut<Map>, K: Pod, V: Pod> HashMap<T, K, V> {
    /// Insert or update an entry. `flags` selects the update policy
    /// ([`BPF_ANY`](crate::BPF_ANY), [`BPF_NOEXIST`](crate::BPF_NOEXIST),
    /// [`BPF_EXIST`](crate::BPF_EXIST)).
    pub fn insert(&mut self, key: K, value: V, flags: u64) -> Result<(), MapError> {
        self.inner
            .as_ref()
            .update_bytes(bytes_of(&key), bytes_of(&value), flags)
    }

    /// Remove an entry; a missing key is [`MapError::KeyNotFound`].
    pub fn remove(&mut self, key: &K) -> Result<(), MapError> {
        self.inner.as_ref().delete_bytes(bytes_of(key))
    }
}

impl<'a, K: Pod, V: Pod> TryFrom<&'a Map> for HashMap<&'a Map, K, V> {
    type Error = MapError;

    fn try_from(map: &'a Map) -> Result<HashMap<&'a Map, K, V>, MapError> {
        HashMap::new(map)
    }
}

impl<'a, K: Pod, V: Pod> TryFrom<&'a mut Map> for HashMap<&'a mut Map, K, V> {
    type Error = MapError;

    fn try_from(map: &'a mut Map) -> Result<HashMap<&'a mut Map, K, V>, MapError> {
        HashMap::new(map)
    }
}

impl<T: AsRef<Map>, K: Pod, V: Pod> IterableMap<K, V> for HashMap<T, K, V> {
    fn map(&self) -> &Map {
        self.inner.as_ref()
    }

    fn get(&self, key: &K) -> Result<Option<V>, MapError> {
        HashMap::get(self, key)
    }
}
