use super::{Map, MapError};
use crate::{bytes_of, obj::MapType, pod_from_bytes, programs::ProgramFd, RawFd};

/// A typed view over a `PROG_ARRAY` map: a jump table of loaded programs
/// used for in-kernel tail-call dispatch.
///
/// Slots hold program handles, not data; reading a slot back yields the
/// same handle index that was stored.
pub struct ProgramArray<T: AsRef<Map>> {
    inner: T,
}

impl<T: AsRef<Map>> ProgramArray<T> {
    pub fn new(map: T) -> Result<ProgramArray<T>, MapError> {
        let inner = map.as_ref();
        if inner.spec.map_type() != MapType::ProgArray {
            return Err(MapError::InvalidMapType {
                name: inner.spec.name().to_string(),
            });
        }
        Ok(ProgramArray { inner: map })
    }

    /// The handle index stored at `index`, if any.
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

impl<T: AsRef<Map> + AsMut<Map>> ProgramArray<T> {
    /// Make `index` tail-call into `program`, which must be loaded.
    pub fn set(&mut self, index: u32, program: &impl ProgramFd, flags: u64) -> Result<(), MapError> {
        self.check_bounds(index)?;
        let fd = program.fd().ok_or(MapError::ProgramNotLoaded)? as u32;
        self.inner
            .as_ref()
            .update_bytes(bytes_of(&index), bytes_of(&fd), flags)
    }

    /// Store a raw program fd.
    pub(crate) fn set_fd(&mut self, index: u32, fd: RawFd, flags: u64) -> Result<(), MapError> {
        self.check_bounds(index)?;
        let fd = fd as u32;
        self.inner
            .as_ref()
            .update_bytes(bytes_of(&index), bytes_of(&fd), flags)
    }
}

impl<'a> TryFrom<&'a Map> for ProgramArray<&'a Map> {
    type Error = MapError;

    fn try_from(map: &'a Map) -> Result<ProgramArray<&'a Map>, MapError> {
        ProgramArray::new(map)
    }
}

impl<'a> TryFrom<&'a mut Map> for ProgramArray<&'a mut Map> {
    type Error = MapError;

    fn try_from(map: &'a mut Map) -> Result<ProgramArray<&'a mut Map>, MapError> {
        ProgramArray::new(map)
    }
}
