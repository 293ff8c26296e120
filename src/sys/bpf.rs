use std::{
    cmp,
    collections::HashMap,
    ffi::{c_void, CStr},
    io, mem, ptr, slice,
    sync::{
        atomic::{self, AtomicPtr, Ordering},
        Mutex,
    },
};

use bytes::BytesMut;
use once_cell::sync::OnceCell;

use super::{Events, Kernel, SysResult};
use crate::{
    abi::{
        bpf_attr_link_create, bpf_attr_map_create, bpf_attr_map_elem, bpf_attr_prog_load,
        perf_event_attr, perf_event_header, perf_event_mmap_page, BPF_LINK_CREATE, BPF_MAP_CREATE,
        BPF_MAP_DELETE_ELEM, BPF_MAP_GET_NEXT_KEY, BPF_MAP_LOOKUP_ELEM, BPF_MAP_UPDATE_ELEM,
        BPF_OBJ_NAME_LEN, BPF_PROG_LOAD, INSN_SIZE, PERF_COUNT_SW_BPF_OUTPUT,
        PERF_EVENT_IOC_DISABLE, PERF_EVENT_IOC_ENABLE, PERF_FLAG_FD_CLOEXEC, PERF_RECORD_LOST,
        PERF_RECORD_SAMPLE, PERF_SAMPLE_RAW, PERF_TYPE_SOFTWARE,
    },
    util, MapSpec, RawFd,
};

static NR_CPUS: OnceCell<usize> = OnceCell::new();

const PERF_PAGE_COUNT: usize = 2;

/// [`Kernel`] implemented with the real `bpf(2)` and `perf_event_open(2)`
/// syscalls. This is the only type in the crate that touches privileged
/// kernel functionality.
#[derive(Debug)]
pub struct SysKernel {
    nr_cpus: usize,
    rings: Mutex<HashMap<RawFd, PerfRing>>,
}

impl SysKernel {
    pub fn new() -> Result<SysKernel, io::Error> {
        let nr_cpus = NR_CPUS
            .get_or_try_init(|| util::possible_cpus().map(|cpus| cpus.len()))
            .copied()?;
        Ok(SysKernel {
            nr_cpus,
            rings: Mutex::new(HashMap::new()),
        })
    }
}

fn sys_bpf<T>(cmd: u32, attr: &T) -> SysResult {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *const T as *const c_void,
            mem::size_of::<T>(),
        )
    };
    if ret < 0 {
        return Err((ret, io::Error::last_os_error()));
    }
    Ok(ret)
}

impl Kernel for SysKernel {
    fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    fn map_create(&self, spec: &MapSpec) -> SysResult {
        let mut attr = bpf_attr_map_create {
            map_type: spec.map_type().to_raw(),
            key_size: spec.key_size(),
            value_size: spec.value_size(),
            max_entries: spec.max_entries(),
            map_flags: spec.flags(),
            ..Default::default()
        };

        // map_name is BPF_OBJ_NAME_LEN bytes max and must be NULL terminated
        let name = spec.name().as_bytes();
        let name_len = cmp::min(name.len(), BPF_OBJ_NAME_LEN - 1);
        attr.map_name[..name_len].copy_from_slice(&name[..name_len]);

        sys_bpf(BPF_MAP_CREATE, &attr)
    }

    fn map_lookup_elem(&self, fd: RawFd, key: &[u8], value: &mut [u8]) -> SysResult {
        let attr = bpf_attr_map_elem {
            map_fd: fd as u32,
            key: key.as_ptr() as u64,
            value: value.as_mut_ptr() as u64,
            flags: 0,
        };
        sys_bpf(BPF_MAP_LOOKUP_ELEM, &attr)
    }

    fn map_update_elem(&self, fd: RawFd, key: &[u8], value: &[u8], flags: u64) -> SysResult {
        let attr = bpf_attr_map_elem {
            map_fd: fd as u32,
            key: key.as_ptr() as u64,
            value: value.as_ptr() as u64,
            flags,
        };
        sys_bpf(BPF_MAP_UPDATE_ELEM, &attr)
    }

    fn map_delete_elem(&self, fd: RawFd, key: &[u8]) -> SysResult {
        let attr = bpf_attr_map_elem {
            map_fd: fd as u32,
            key: key.as_ptr() as u64,
            value: 0,
            flags: 0,
        };
        sys_bpf(BPF_MAP_DELETE_ELEM, &attr)
    }

    fn map_get_next_key(&self, fd: RawFd, key: Option<&[u8]>, next_key: &mut [u8]) -> SysResult {
        let attr = bpf_attr_map_elem {
            map_fd: fd as u32,
            key: key.map(|k| k.as_ptr() as u64).unwrap_or(0),
            value: next_key.as_mut_ptr() as u64,
            flags: 0,
        };
        sys_bpf(BPF_MAP_GET_NEXT_KEY, &attr)
    }

    fn prog_load(
        &self,
        prog_type: u32,
        instructions: &[u8],
        license: &CStr,
        kernel_version: u32,
        log_buf: &mut [u8],
    ) -> SysResult {
        let mut attr = bpf_attr_prog_load {
            prog_type,
            insn_cnt: (instructions.len() / INSN_SIZE) as u32,
            insns: instructions.as_ptr() as u64,
            license: license.as_ptr() as u64,
            kern_version: kernel_version,
            ..Default::default()
        };
        if !log_buf.is_empty() {
            attr.log_level = 7;
            attr.log_buf = log_buf.as_mut_ptr() as u64;
            attr.log_size = log_buf.len() as u32;
        }
        sys_bpf(BPF_PROG_LOAD, &attr)
    }

    fn link_create(&self, prog_fd: RawFd, target: u32, attach_type: u32, flags: u32) -> SysResult {
        let attr = bpf_attr_link_create {
            prog_fd: prog_fd as u32,
            target_fd: target,
            attach_type,
            flags,
        };
        sys_bpf(BPF_LINK_CREATE, &attr)
    }

    fn perf_event_open(&self, cpu: u32) -> SysResult {
        let attr = perf_event_attr {
            type_: PERF_TYPE_SOFTWARE,
            size: mem::size_of::<perf_event_attr>() as u32,
            config: PERF_COUNT_SW_BPF_OUTPUT,
            sample_period: 1,
            sample_type: PERF_SAMPLE_RAW,
            wakeup_events: 1,
            ..Default::default()
        };

        let ret = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                &attr as *const _,
                -1 as libc::pid_t,
                cpu as i32,
                -1,
                PERF_FLAG_FD_CLOEXEC,
            )
        };
        if ret < 0 {
            return Err((ret, io::Error::last_os_error()));
        }
        let fd = ret as RawFd;

        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let ring = match PerfRing::mmap(fd, page_size, PERF_PAGE_COUNT) {
            Ok(ring) => ring,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        let enable = unsafe { libc::ioctl(fd, PERF_EVENT_IOC_ENABLE, 0) };
        if enable < 0 {
            let err = io::Error::last_os_error();
            drop(ring);
            unsafe { libc::close(fd) };
            return Err((enable as i64, err));
        }

        self.rings.lock().unwrap().insert(fd, ring);
        Ok(fd as i64)
    }

    fn perf_event_read(
        &self,
        fd: RawFd,
        buffers: &mut [BytesMut],
    ) -> Result<Events, (i64, io::Error)> {
        let mut rings = self.rings.lock().unwrap();
        let ring = rings
            .get_mut(&fd)
            .ok_or_else(|| (-1, io::Error::from_raw_os_error(libc::EBADF)))?;
        ring.read_events(buffers)
    }

    fn close(&self, fd: RawFd) -> SysResult {
        if let Some(ring) = self.rings.lock().unwrap().remove(&fd) {
            unsafe { libc::ioctl(fd, PERF_EVENT_IOC_DISABLE, 0) };
            drop(ring);
        }
        let ret = unsafe { libc::close(fd) };
        if ret < 0 {
            return Err((ret as i64, io::Error::last_os_error()));
        }
        Ok(0)
    }
}

/// One mmap'd perf ring: a control page followed by `size` bytes of sample
/// data written by the kernel.
#[derive(Debug)]
struct PerfRing {
    buf: AtomicPtr<perf_event_mmap_page>,
    size: usize,
    page_size: usize,
}

impl PerfRing {
    fn mmap(fd: RawFd, page_size: usize, page_count: usize) -> Result<PerfRing, (i64, io::Error)> {
        let size = page_size * page_count;
        let buf = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size + page_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if buf == libc::MAP_FAILED {
            return Err((-1, io::Error::last_os_error()));
        }

        Ok(PerfRing {
            buf: AtomicPtr::new(buf as *mut perf_event_mmap_page),
            size,
            page_size,
        })
    }

    fn read_events(&mut self, buffers: &mut [BytesMut]) -> Result<Events, (i64, io::Error)> {
        let header = self.buf.load(Ordering::SeqCst);
        let base = header as usize + self.page_size;
        let mmap_size = self.size;

        // the ring is circular: a record may wrap past the end of the
        // mapping back to its start
        let fill_buf = |start_off: usize, out_buf: &mut [u8]| {
            let len = out_buf.len();
            let start = start_off % mmap_size;
            let end = (start_off + len) % mmap_size;

            if start < end {
                out_buf.copy_from_slice(unsafe {
                    slice::from_raw_parts((base + start) as *const u8, len)
                });
            } else {
                let size = mmap_size - start;
                unsafe {
                    out_buf[..size]
                        .copy_from_slice(slice::from_raw_parts((base + start) as *const u8, size));
                    out_buf[size..]
                        .copy_from_slice(slice::from_raw_parts(base as *const u8, len - size));
                }
            }
        };

        let mut events = Events { read: 0, lost: 0 };
        let mut buf_n = 0;

        let head = unsafe { (*header).data_head } as usize;
        let mut tail = unsafe { (*header).data_tail } as usize;
        while head != tail && buf_n < buffers.len() {
            let event_start = tail % mmap_size;
            let event =
                unsafe { ptr::read_unaligned((base + event_start) as *const perf_event_header) };

            match event.type_ {
                PERF_RECORD_SAMPLE => {
                    let mut size = [0u8; mem::size_of::<u32>()];
                    fill_buf(event_start + mem::size_of::<perf_event_header>(), &mut size);
                    let sample_size = u32::from_ne_bytes(size) as usize;
                    let sample_start =
                        event_start + mem::size_of::<perf_event_header>() + mem::size_of::<u32>();

                    let buf = &mut buffers[buf_n];
                    buf.clear();
                    buf.resize(sample_size, 0);
                    fill_buf(sample_start, buf);
                    buf_n += 1;
                    events.read += 1;
                }
                PERF_RECORD_LOST => {
                    // perf_event_lost: header, id, count
                    let mut count = [0u8; mem::size_of::<u64>()];
                    fill_buf(
                        event_start + mem::size_of::<perf_event_header>() + mem::size_of::<u64>(),
                        &mut count,
                    );
                    events.lost += u64::from_ne_bytes(count) as usize;
                }
                _ => { /* skip unknown event type */ }
            }

            tail += event.size as usize;
        }

        atomic::fence(Ordering::SeqCst);
        unsafe { (*header).data_tail = tail as u64 };

        Ok(events)
    }
}

impl Drop for PerfRing {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(
                self.buf.load(Ordering::SeqCst) as *mut c_void,
                self.size + self.page_size,
            );
        }
    }
}
