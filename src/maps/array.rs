use std::marker::PhantomData;

use super::{check_kv_size, IterableMap, Map, MapError, MapIter};
use crate::{bytes_of, obj::MapType, pod_from_bytes, Pod};

/// A typed view over an `ARRAY` map: a fixed number of pre-allocated,
/// zero-initialized slots indexed by a `u32`.
#[derive(Debug)]
pub struct Array<T: AsRef<Map>, V> {
    inner: T,
    _v: PhantomData<V>,
}

impl<T: AsRef<Map>, V: Pod> Array<T, V> {
    pub fn new(map: T) -> Result<Array<T, V>, MapError> {
        let inner = map.as_ref();
        if inner.spec.map_type() != MapType::Array {
            return Err(MapError::InvalidMapType {
                name: inner.spec.name().to_string(),
            });
        }
        check_kv_size::<u32, V>(inner)?;

        Ok(Array {
            inner: map,
            _v: PhantomData,
        })
    }

    /// The number of slots.
    pub fn len(&self) -> u32 {
        self.inner.as_ref().spec.max_entries()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: u32) -> Result<V, MapError> {
        let inner = self.inner.as_ref();
        self.check_bounds(index)?;
        let value = inner.lookup_bytes(bytes_of(&index))?;
        // in-range array slots always exist
        value
            .map(|bytes| pod_from_bytes(&bytes))
            .ok_or(MapError::KeyNotFound)
    }

    /// An iterator over every slot, in index order.
    pub fn iter(&self) -> MapIter<'_, u32, V, Self> {
        MapIter::new(self)
    }

    fn check_bounds(&self, index: u32) -> Result<(), MapError> {
        let max_entries = self.inner.as_ref().spec.max_entries();
        if index >= max_entries {
            return Err(MapError::OutOfBounds { index, max_entries });
        }
        Ok(())
    }
}

impl<T: AsRef<Map> + AsMut<Map>, V: Pod> Array<T, V> {
    pub fn set(&mut self, index: u32, value: V, flags: u64) -> Result<(), MapError> {
        self.check_bounds(index)?;
        self.inner
            .as_ref()
            .update_bytes(bytes_of(&index), bytes_of(&value), flags)
    }
}

impl<'a, V: Pod> TryFrom<&'a Map> for Array<&'a Map, V> {
    type Error = MapError;

    fn try_from(map: &'a Map) -> Result<Array<&'a Map, V>, MapError> {
        Array::new(map)
    }
}

impl<'a, V: Pod> TryFrom<&'a mut Map> for Array<&'a mut Map, V> {
    type Error = MapError;

    fn try_from(map: &'a mut Map) -> Result<Array<&'a mut Map, V>, MapError> {
        Array::new(map)
    }
}

impl<T: AsRef<Map>, V: Pod> IterableMap<u32, V> for Array<T, V> {
    fn map(&self) -> &Map {
        self.inner.as_ref()
    }

    fn get(&self, index: &u32) -> Result<Option<V>, MapError> {
        Array::get(self, *index).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{abi::BPF_MAP_TYPE_ARRAY, maps::test_utils::*};

    #[test]
    fn test_round_trip_and_zero_fill() {
        let kernel = new_kernel();
        let mut map = new_map(&kernel, "a", BPF_MAP_TYPE_ARRAY, 4, 8, 5);
        let mut array = Array::<_, u64>::new(&mut map).unwrap();

        // unset slots read back as zero
        assert_eq!(array.get(0).unwrap(), 0);

        array.set(2, 42, 0).unwrap();
        assert_eq!(array.get(2).unwrap(), 42);
    }

    #[test]
    fn test_out_of_bounds() {
        let kernel = new_kernel();
        let mut map = new_map(&kernel, "a", BPF_MAP_TYPE_ARRAY, 4, 8, 5);
        let mut array = Array::<_, u64>::new(&mut map).unwrap();

        assert_matches!(
            array.get(5),
            Err(MapError::OutOfBounds {
                index: 5,
                max_entries: 5
            })
        );
        assert_matches!(array.set(9, 1, 0), Err(MapError::OutOfBounds { index: 9, .. }));
    }

    #[test]
    fn test_iter_visits_every_slot() {
        let kernel = new_kernel();
        let mut map = new_map(&kernel, "a", BPF_MAP_TYPE_ARRAY, 4, 4, 3);
        let mut array = Array::<_, u32>::new(&mut map).unwrap();
        array.set(1, 11, 0).unwrap();

        let items = array.iter().collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(items, &[(0, 0), (1, 11), (2, 0)]);
    }

    #[test]
    fn test_wrong_value_size() {
        let kernel = new_kernel();
        let map = new_map(&kernel, "a", BPF_MAP_TYPE_ARRAY, 4, 8, 5);
        assert_matches!(
            Array::<_, u32>::new(&map),
            Err(MapError::InvalidValueSize { .. })
        );
    }
}
