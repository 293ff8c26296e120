use super::{Map, MapError};
use crate::{bytes_of, obj::MapType, pod_from_bytes};

/// A typed view over a `DEVMAP`: slots hold network device indices used by
/// XDP redirection.
#[derive(Debug)]
pub struct DevMap<T: AsRef<Map>> {
    inner: T,
}

impl<T: AsRef<Map>> DevMap<T> {
    pub fn new(map: T) -> Result<DevMap<T>, MapError> {
        let inner = map.as_ref();
        if inner.spec.map_type() != MapType::DevMap {
            return Err(MapError::InvalidMapType {
                name: inner.spec.name().to_string(),
            });
        }
        Ok(DevMap { inner: map })
    }

    /// The device index stored at `index`, if any.
    pub fn get(&self, index: u32) -> Result<Option<u32>, MapError> {
        self.check_bounds(index)?;
        let value = self.inner.as_ref().lookup_bytes(bytes_of(&index))?;
        Ok(value.map(|bytes| pod_from_bytes(&bytes)))
    }

    fn check_bounds(&self, index: u32) -> Result<(), MapError> {
        let max_entries = self.inner.as_ref().spec.max_entries();
        if index >= max_entries {
            return Err(MapError::OutOfBounds { index, max_entries });
        }
        Ok(())
    }
}

impl<T: AsRef<Map> + AsMut<Map>> DevMap<T> {
    /// Point `index` at the network interface `if_index`.
    pub fn set(&mut self, index: u32, if_index: u32, flags: u64) -> Result<(), MapError> {
        self.check_bounds(index)?;
        self.inner
            .as_ref()
            .update_bytes(bytes_of(&index), bytes_of(&if_index), flags)
    }
}

impl<'a> TryFrom<&'a Map> for DevMap<&'a Map> {
    type Error = MapError;

    fn try_from(map: &'a Map) -> Result<DevMap<&'a Map>, MapError> {
        DevMap::new(map)
    }
}

impl<'a> TryFrom<&'a mut Map> for DevMap<&'a mut Map> {
    type Error = MapError;

    fn try_from(map: &'a mut Map) -> Result<DevMap<&'a mut Map>, MapError> {
        DevMap::new(map)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{abi::BPF_MAP_TYPE_DEVMAP, maps::test_utils::*};

    #[test]
    fn test_device_index_round_trip() {
        let kernel = new_kernel();
        let mut map = new_map(&kernel, "dm", BPF_MAP_TYPE_DEVMAP, 4, 4, 8);
        let mut devs = DevMap::new(&mut map).unwrap();

        assert_eq!(devs.get(3).unwrap(), None);
        devs.set(3, 7, 0).unwrap();
        assert_eq!(devs.get(3).unwrap(), Some(7));
    }

    #[test]
    fn test_wrong_map_type() {
        let kernel = new_kernel();
        let map = new_map(&kernel, "h", crate::abi::BPF_MAP_TYPE_HASH, 4, 4, 8);
        assert_matches!(DevMap::try_from(&map), Err(MapError::InvalidMapType { .. }));
    }
}
