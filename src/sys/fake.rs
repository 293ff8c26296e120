//! An in-memory [`Kernel`] used by the test suite.
//!
//! Implements enough of the kernel's map and program semantics to observe
//! loader behavior without privileges: per-type capacity handling, LRU
//! eviction, per-CPU value fan-out, fd lifetimes, perf channels and a
//! minimal executor for attached programs.
use std::{
    collections::{HashMap, VecDeque},
    ffi::CStr,
    io,
    sync::Mutex,
};

use bytes::BytesMut;

use super::{Events, Kernel, SysResult};
use crate::{
    abi::{
        bpf_insn, BPF_CALL, BPF_EXIST, BPF_EXIT_INSN, BPF_LD_IMM64, BPF_MOV64_IMM, BPF_MOV64_REG,
        BPF_NOEXIST, BPF_PSEUDO_MAP_FD, INSN_SIZE,
    },
    obj::MapType,
    util::percpu_slot_size,
    MapSpec, RawFd,
};

#[derive(Debug)]
pub(crate) struct FakeKernel {
    nr_cpus: usize,
    state: Mutex<State>,
    /// when set, allow this many more map creations, then fail with EPERM
    creates_left: Mutex<Option<usize>>,
}

#[derive(Debug, Default)]
struct State {
    next_fd: RawFd,
    resources: HashMap<RawFd, Resource>,
}

#[derive(Debug)]
enum Resource {
    Map(FakeMap),
    Program(FakeProgram),
    Link { prog_fd: RawFd },
    PerfChannel(VecDeque<Vec<u8>>),
}

#[derive(Debug)]
struct FakeMap {
    map_type: MapType,
    key_size: usize,
    /// full kernel-side value buffer size, CPU fan-out included
    value_size: usize,
    max_entries: usize,
    storage: Storage,
    /// access order for LRU maps, least recently used first
    lru: Vec<Vec<u8>>,
}

#[derive(Debug)]
enum Storage {
    /// insertion-ordered key/value pairs
    Hash(Vec<(Vec<u8>, Vec<u8>)>),
    /// pre-allocated slots indexed by a 32 bit key
    Array(Vec<Option<Vec<u8>>>),
}

#[derive(Debug)]
struct FakeProgram {
    prog_type: u32,
    instructions: Vec<bpf_insn>,
}

fn fail(errno: i32) -> SysResult {
    Err((-1, io::Error::from_raw_os_error(errno)))
}

fn write_log(log_buf: &mut [u8], msg: &str) {
    if log_buf.is_empty() {
        return;
    }
    let n = msg.len().min(log_buf.len() - 1);
    log_buf[..n].copy_from_slice(&msg.as_bytes()[..n]);
    log_buf[n] = 0;
}

impl FakeKernel {
    pub(crate) fn new(nr_cpus: usize) -> FakeKernel {
        FakeKernel {
            nr_cpus,
            state: Mutex::new(State {
                next_fd: 100,
                resources: HashMap::new(),
            }),
            creates_left: Mutex::new(None),
        }
    }

    /// Let `n` more map creations succeed, then reject them with EPERM.
    pub(crate) fn fail_map_creates_after(&self, n: usize) {
        *self.creates_left.lock().unwrap() = Some(n);
    }

    /// Number of live fds of any kind.
    pub(crate) fn resource_count(&self) -> usize {
        self.state.lock().unwrap().resources.len()
    }

    /// Simulate an in-kernel program emitting one sample on a perf channel.
    pub(crate) fn perf_push(&self, fd: RawFd, sample: &[u8]) {
        let mut state = self.state.lock().unwrap();
        match state.resources.get_mut(&fd) {
            Some(Resource::PerfChannel(queue)) => queue.push_back(sample.to_vec()),
            other => panic!("perf_push on non-channel fd {fd}: {other:?}"),
        }
    }

    /// Run the program behind an attach link and return its verdict.
    pub(crate) fn run_attached(&self, link_fd: RawFd) -> i64 {
        let state = self.state.lock().unwrap();
        let prog_fd = match state.resources.get(&link_fd) {
            Some(Resource::Link { prog_fd }) => *prog_fd,
            other => panic!("run_attached on non-link fd {link_fd}: {other:?}"),
        };
        let program = match state.resources.get(&prog_fd) {
            Some(Resource::Program(p)) => p,
            other => panic!("link {link_fd} points at non-program: {other:?}"),
        };
        execute(&program.instructions)
    }

    fn alloc(&self, state: &mut State, resource: Resource) -> RawFd {
        let fd = state.next_fd;
        state.next_fd += 1;
        state.resources.insert(fd, resource);
        fd
    }
}

/// Interpret the handful of instructions the fixture programs use. Anything
/// unknown is a no-op; the verdict is r0 at exit.
fn execute(instructions: &[bpf_insn]) -> i64 {
    let mut regs = [0i64; 11];
    let mut pc = 0;
    while pc < instructions.len() {
        let insn = &instructions[pc];
        match insn.code {
            BPF_MOV64_IMM => regs[insn.dst_reg() as usize] = insn.imm as i64,
            BPF_MOV64_REG => regs[insn.dst_reg() as usize] = regs[insn.src_reg() as usize],
            BPF_LD_IMM64 => {
                let hi = instructions.get(pc + 1).map(|i| i.imm).unwrap_or(0);
                regs[insn.dst_reg() as usize] = (insn.imm as u32 as i64) | ((hi as i64) << 32);
                pc += 1;
            }
            BPF_CALL => regs[0] = 0,
            BPF_EXIT_INSN => return regs[0],
            _ => {}
        }
        pc += 1;
    }
    regs[0]
}

impl FakeMap {
    fn new(spec: &MapSpec, nr_cpus: usize) -> FakeMap {
        let declared = spec.value_size() as usize;
        let value_size = if spec.map_type().is_per_cpu() {
            nr_cpus * percpu_slot_size(declared)
        } else {
            declared
        };
        let max_entries = spec.max_entries() as usize;
        let storage = if spec.map_type().is_array_family() {
            Storage::Array(vec![None; max_entries])
        } else {
            Storage::Hash(Vec::new())
        };
        FakeMap {
            map_type: spec.map_type(),
            key_size: spec.key_size() as usize,
            value_size,
            max_entries,
            storage,
            lru: Vec::new(),
        }
    }

    fn lookup(&mut self, key: &[u8], value: &mut [u8]) -> SysResult {
        if key.len() != self.key_size || value.len() != self.value_size {
            return fail(libc::EINVAL);
        }
        let FakeMap {
            map_type,
            max_entries,
            storage,
            lru,
            ..
        } = self;
        match storage {
            Storage::Hash(entries) => match entries.iter().find(|(k, _)| k == key) {
                Some((_, v)) => {
                    value.copy_from_slice(v);
                    touch(map_type.is_lru(), lru, key);
                    Ok(0)
                }
                None => fail(libc::ENOENT),
            },
            Storage::Array(slots) => {
                let index = match slot_index(key, *max_entries) {
                    Some(index) => index,
                    None => return fail(libc::ENOENT),
                };
                match &slots[index] {
                    Some(v) => {
                        value.copy_from_slice(v);
                        Ok(0)
                    }
                    // plain arrays are pre-allocated and zero-filled;
                    // fd-holding slots read as empty until set
                    None if map_type.holds_fd_values() => fail(libc::ENOENT),
                    None => {
                        value.fill(0);
                        Ok(0)
                    }
                }
            }
        }
    }

    fn update(&mut self, key: &[u8], value: &[u8], flags: u64) -> SysResult {
        if key.len() != self.key_size || value.len() != self.value_size {
            return fail(libc::EINVAL);
        }
        let FakeMap {
            map_type,
            max_entries,
            storage,
            lru,
            ..
        } = self;
        match storage {
            Storage::Hash(entries) => {
                let existing = entries.iter_mut().find(|(k, _)| k == key);
                match (existing, flags) {
                    (Some(_), BPF_NOEXIST) => fail(libc::EEXIST),
                    (Some((_, v)), _) => {
                        *v = value.to_vec();
                        touch(map_type.is_lru(), lru, key);
                        Ok(0)
                    }
                    (None, BPF_EXIST) => fail(libc::ENOENT),
                    (None, _) => {
                        if entries.len() >= *max_entries {
                            if !map_type.is_lru() {
                                return fail(libc::E2BIG);
                            }
                            // full LRU map: evict the least recently used
                            // entry instead of failing
                            if let Some(victim) = lru.first().cloned() {
                                lru.remove(0);
                                entries.retain(|(k, _)| *k != victim);
                            } else if !entries.is_empty() {
                                entries.remove(0);
                            }
                        }
                        entries.push((key.to_vec(), value.to_vec()));
                        touch(map_type.is_lru(), lru, key);
                        Ok(0)
                    }
                }
            }
            Storage::Array(slots) => {
                if flags == BPF_NOEXIST {
                    // array elements always exist
                    return fail(libc::EEXIST);
                }
                let index = match slot_index(key, *max_entries) {
                    Some(index) => index,
                    None => return fail(libc::E2BIG),
                };
                slots[index] = Some(value.to_vec());
                Ok(0)
            }
        }
    }

    fn delete(&mut self, key: &[u8]) -> SysResult {
        if key.len() != self.key_size {
            return fail(libc::EINVAL);
        }
        match &mut self.storage {
            Storage::Hash(entries) => {
                let before = entries.len();
                entries.retain(|(k, _)| k != key);
                self.lru.retain(|k| k != key);
                if entries.len() == before {
                    fail(libc::ENOENT)
                } else {
                    Ok(0)
                }
            }
            // array-backed types do not support element deletion
            Storage::Array(_) => fail(libc::EINVAL),
        }
    }

    fn next_key(&self, key: Option<&[u8]>, next_key: &mut [u8]) -> SysResult {
        if next_key.len() != self.key_size {
            return fail(libc::EINVAL);
        }
        match &self.storage {
            Storage::Hash(entries) => {
                if entries.is_empty() {
                    return fail(libc::ENOENT);
                }
                let position = key.and_then(|key| entries.iter().position(|(k, _)| k == key));
                let next = match position {
                    Some(i) => entries.get(i + 1),
                    // no key or a deleted key restarts from the beginning
                    None => entries.first(),
                };
                match next {
                    Some((k, _)) => {
                        next_key.copy_from_slice(k);
                        Ok(0)
                    }
                    None => fail(libc::ENOENT),
                }
            }
            Storage::Array(_) => {
                let next = match key.and_then(|key| slot_index(key, self.max_entries)) {
                    Some(index) => index + 1,
                    None => 0,
                };
                if next >= self.max_entries {
                    return fail(libc::ENOENT);
                }
                next_key.copy_from_slice(&(next as u32).to_ne_bytes());
                Ok(0)
            }
        }
    }
}

fn touch(is_lru: bool, lru: &mut Vec<Vec<u8>>, key: &[u8]) {
    if !is_lru {
        return;
    }
    lru.retain(|k| k != key);
    lru.push(key.to_vec());
}

fn slot_index(key: &[u8], max_entries: usize) -> Option<usize> {
    let index = u32::from_ne_bytes(key.try_into().ok()?) as usize;
    (index < max_entries).then_some(index)
}

impl Kernel for FakeKernel {
    fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    fn map_create(&self, spec: &MapSpec) -> SysResult {
        if spec.key_size() == 0 || spec.max_entries() == 0 {
            return fail(libc::EINVAL);
        }
        if let Some(left) = self.creates_left.lock().unwrap().as_mut() {
            if *left == 0 {
                return fail(libc::EPERM);
            }
            *left -= 1;
        }
        let mut state = self.state.lock().unwrap();
        let map = FakeMap::new(spec, self.nr_cpus);
        Ok(self.alloc(&mut state, Resource::Map(map)) as i64)
    }

    fn map_lookup_elem(&self, fd: RawFd, key: &[u8], value: &mut [u8]) -> SysResult {
        let mut state = self.state.lock().unwrap();
        match state.resources.get_mut(&fd) {
            Some(Resource::Map(map)) => map.lookup(key, value),
            _ => fail(libc::EBADF),
        }
    }

    fn map_update_elem(&self, fd: RawFd, key: &[u8], value: &[u8], flags: u64) -> SysResult {
        let mut state = self.state.lock().unwrap();
        match state.resources.get_mut(&fd) {
            Some(Resource::Map(map)) => map.update(key, value, flags),
            _ => fail(libc::EBADF),
        }
    }

    fn map_delete_elem(&self, fd: RawFd, key: &[u8]) -> SysResult {
        let mut state = self.state.lock().unwrap();
        match state.resources.get_mut(&fd) {
            Some(Resource::Map(map)) => map.delete(key),
            _ => fail(libc::EBADF),
        }
    }

    fn map_get_next_key(&self, fd: RawFd, key: Option<&[u8]>, next_key: &mut [u8]) -> SysResult {
        let state = self.state.lock().unwrap();
        match state.resources.get(&fd) {
            Some(Resource::Map(map)) => map.next_key(key, next_key),
            _ => fail(libc::EBADF),
        }
    }

    fn prog_load(
        &self,
        prog_type: u32,
        instructions: &[u8],
        license: &CStr,
        _kernel_version: u32,
        log_buf: &mut [u8],
    ) -> SysResult {
        let mut state = self.state.lock().unwrap();

        if instructions.is_empty() || instructions.len() % INSN_SIZE != 0 {
            write_log(log_buf, "invalid program length");
            return fail(libc::EINVAL);
        }
        let insns: Vec<bpf_insn> = instructions
            .chunks_exact(INSN_SIZE)
            .map(|chunk| unsafe { std::ptr::read_unaligned(chunk.as_ptr() as *const bpf_insn) })
            .collect();

        if insns.last().map(|i| i.code) != Some(BPF_EXIT_INSN) {
            write_log(log_buf, "last insn is not an exit or jmp");
            return fail(libc::EACCES);
        }
        if license.to_bytes().is_empty() {
            write_log(log_buf, "invalid license");
            return fail(libc::EINVAL);
        }
        for insn in &insns {
            if insn.code == BPF_LD_IMM64 && insn.src_reg() == BPF_PSEUDO_MAP_FD {
                let fd = insn.imm as RawFd;
                if !matches!(state.resources.get(&fd), Some(Resource::Map(_))) {
                    write_log(log_buf, &format!("fd {fd} is not pointing to valid bpf_map"));
                    return fail(libc::EBADF);
                }
            }
        }

        let program = FakeProgram {
            prog_type,
            instructions: insns,
        };
        Ok(self.alloc(&mut state, Resource::Program(program)) as i64)
    }

    fn link_create(&self, prog_fd: RawFd, _target: u32, attach_type: u32, _flags: u32) -> SysResult {
        let mut state = self.state.lock().unwrap();
        match state.resources.get(&prog_fd) {
            Some(Resource::Program(program)) => {
                // the attach type must match the program type
                if attach_type == crate::abi::BPF_XDP
                    && program.prog_type != crate::abi::BPF_PROG_TYPE_XDP
                {
                    return fail(libc::EINVAL);
                }
            }
            _ => return fail(libc::EBADF),
        }
        Ok(self.alloc(&mut state, Resource::Link { prog_fd }) as i64)
    }

    fn perf_event_open(&self, cpu: u32) -> SysResult {
        if cpu as usize >= self.nr_cpus {
            return fail(libc::EINVAL);
        }
        let mut state = self.state.lock().unwrap();
        Ok(self.alloc(&mut state, Resource::PerfChannel(VecDeque::new())) as i64)
    }

    fn perf_event_read(
        &self,
        fd: RawFd,
        buffers: &mut [BytesMut],
    ) -> Result<Events, (i64, io::Error)> {
        let mut state = self.state.lock().unwrap();
        let queue = match state.resources.get_mut(&fd) {
            Some(Resource::PerfChannel(queue)) => queue,
            _ => return Err((-1, io::Error::from_raw_os_error(libc::EBADF))),
        };

        let mut events = Events { read: 0, lost: 0 };
        for buf in buffers.iter_mut() {
            match queue.pop_front() {
                Some(sample) => {
                    buf.clear();
                    buf.extend_from_slice(&sample);
                    events.read += 1;
                }
                None => break,
            }
        }
        Ok(events)
    }

    fn close(&self, fd: RawFd) -> SysResult {
        let mut state = self.state.lock().unwrap();
        match state.resources.remove(&fd) {
            Some(_) => Ok(0),
            None => fail(libc::EBADF),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::fixture::{exit, mov64_imm};

    fn spec(map_type: u32, key: u32, value: u32, entries: u32) -> MapSpec {
        MapSpec::new(
            "test",
            &crate::obj::fixture::map_def(map_type, key, value, entries),
            4,
        )
        .unwrap()
    }

    #[test]
    fn test_fd_lifecycle() {
        let kernel = FakeKernel::new(4);
        let fd = kernel
            .map_create(&spec(crate::abi::BPF_MAP_TYPE_HASH, 4, 4, 4))
            .unwrap() as RawFd;
        assert_eq!(kernel.resource_count(), 1);
        kernel.close(fd).unwrap();
        assert_eq!(kernel.resource_count(), 0);
        assert!(kernel.close(fd).is_err());
    }

    #[test]
    fn test_executor() {
        let pass = crate::obj::fixture::insns_to_bytes(&[mov64_imm(0, 2), exit()]);
        let kernel = FakeKernel::new(4);
        let prog_fd = kernel
            .prog_load(6, &pass, c"GPL", 0, &mut [])
            .unwrap() as RawFd;
        let link_fd = kernel.link_create(prog_fd, 1, 37, 0).unwrap() as RawFd;
        assert_eq!(kernel.run_attached(link_fd), 2);
    }

    #[test]
    fn test_prog_load_rejects_missing_exit() {
        let broken = crate::obj::fixture::insns_to_bytes(&[mov64_imm(0, 2)]);
        let kernel = FakeKernel::new(4);
        let mut log = vec![0u8; 64];
        let res = kernel.prog_load(6, &broken, c"GPL", 0, &mut log);
        assert!(res.is_err());
        assert!(log.starts_with(b"last insn is not an exit"));
    }
}
