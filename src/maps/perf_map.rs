//! Perf event array: the channel XDP and tracing programs report events
//! through.
//!
//! Each slot of the map holds one per-CPU event channel. [`PerfEventArray::open`]
//! opens the channel for a CPU, stores it in the map so in-kernel programs
//! can write to it, and returns a reader that drains the samples.
use std::{io, sync::Arc};

use bytes::BytesMut;
use thiserror::Error;

use super::{Map, MapError};
use crate::{abi::BPF_ANY, bytes_of, obj::MapType, sys::{Events, Kernel}, RawFd};

#[derive(Error, Debug)]
pub enum PerfMapError {
    #[error("invalid cpu {cpu_id}")]
    InvalidCpu { cpu_id: u32 },

    #[error("map error: {0}")]
    MapError(#[from] MapError),

    #[error("perf_event_open failed: {io_error}")]
    OpenFailed {
        #[source]
        io_error: io::Error,
    },

    #[error("error reading events: {io_error}")]
    ReadFailed {
        #[source]
        io_error: io::Error,
    },
}

/// A typed view over a `PERF_EVENT_ARRAY` map.
pub struct PerfEventArray<T: AsRef<Map>> {
    inner: T,
}

impl<T: AsRef<Map>> PerfEventArray<T> {
    pub fn new(map: T) -> Result<PerfEventArray<T>, MapError> {
        let inner = map.as_ref();
        if inner.spec.map_type() != MapType::PerfEventArray {
            return Err(MapError::InvalidMapType {
                name: inner.spec.name().to_string(),
            });
        }
        Ok(PerfEventArray { inner: map })
    }
}

impl<T: AsRef<Map> + AsMut<Map>> PerfEventArray<T> {
    /// Open the event channel for `cpu_id` and store it in that CPU's slot.
    /// Samples written by programs on that CPU become readable on the
    /// returned buffer.
    pub fn open(&mut self, cpu_id: u32) -> Result<PerfEventArrayBuffer, PerfMapError> {
        let map = self.inner.as_ref();
        let kernel = map.kernel.clone();
        if cpu_id as usize >= kernel.nr_cpus() {
            return Err(PerfMapError::InvalidCpu { cpu_id });
        }

        let fd = kernel
            .perf_event_open(cpu_id)
            .map_err(|(_, io_error)| PerfMapError::OpenFailed { io_error })?
            as RawFd;

        let event_fd = fd as u32;
        if let Err(e) = map.update_bytes(bytes_of(&cpu_id), bytes_of(&event_fd), BPF_ANY) {
            let _ = kernel.close(fd);
            return Err(e.into());
        }

        Ok(PerfEventArrayBuffer {
            kernel,
            fd,
            cpu_id,
        })
    }
}

impl<'a> TryFrom<&'a mut Map> for PerfEventArray<&'a mut Map> {
    type Error = MapError;

    fn try_from(map: &'a mut Map) -> Result<PerfEventArray<&'a mut Map>, MapError> {
        PerfEventArray::new(map)
    }
}

/// Reads the samples of one CPU's event channel. Dropping it closes the
/// channel.
#[derive(Debug)]
pub struct PerfEventArrayBuffer {
    kernel: Arc<dyn Kernel>,
    fd: RawFd,
    cpu_id: u32,
}

impl PerfEventArrayBuffer {
    pub fn cpu_id(&self) -> u32 {
        self.cpu_id
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    /// Drain pending samples, one per output buffer. Returns how many were
    /// read and how many the kernel dropped.
    pub fn read_events(&mut self, buffers: &mut [BytesMut]) -> Result<Events, PerfMapError> {
        self.kernel
            .perf_event_read(self.fd, buffers)
            .map_err(|(_, io_error)| PerfMapError::ReadFailed { io_error })
    }
}

impl Drop for PerfEventArrayBuffer {
    fn drop(&mut self) {
        let _ = self.kernel.close(self.fd);
    }
}
