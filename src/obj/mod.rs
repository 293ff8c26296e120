mod relocation;

use std::{
    collections::HashMap,
    ffi::{CStr, CString},
    mem,
    str::FromStr,
};

use object::{
    read::{Object as ElfObject, ObjectSection, ObjectSymbol, Section},
    Endianness, RelocationTarget, SymbolKind,
};
use thiserror::Error;

pub use self::relocation::{relocate, RelocationError};
pub(crate) use self::relocation::MapRelocation;

use crate::abi::{
    bpf_insn, BPF_MAP_TYPE_ARRAY, BPF_MAP_TYPE_DEVMAP, BPF_MAP_TYPE_HASH, BPF_MAP_TYPE_LRU_HASH,
    BPF_MAP_TYPE_LRU_PERCPU_HASH, BPF_MAP_TYPE_PERCPU_ARRAY, BPF_MAP_TYPE_PERCPU_HASH,
    BPF_MAP_TYPE_PERF_EVENT_ARRAY, BPF_MAP_TYPE_PROG_ARRAY, INSN_SIZE,
};

const KERNEL_VERSION_ANY: u32 = 0xFFFF_FFFE;

/// A parsed object file: the license, the raw map declarations and the
/// programs found in its sections, in declaration order.
#[derive(Debug, Clone)]
pub(crate) struct Object {
    pub(crate) license: CString,
    pub(crate) kernel_version: KernelVersion,
    pub(crate) maps: Vec<MapDecl>,
    pub(crate) programs: Vec<Program>,
}

/// One record out of a `maps` section, named by its defining symbol.
#[derive(Debug, Clone)]
pub(crate) struct MapDecl {
    pub(crate) name: String,
    pub(crate) def: bpf_map_def,
}

/// The fixed-stride map declaration record emitted by the compiler.
#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct bpf_map_def {
    pub(crate) map_type: u32,
    pub(crate) key_size: u32,
    pub(crate) value_size: u32,
    pub(crate) max_entries: u32,
    pub(crate) map_flags: u32,
}

const MAP_DEF_SIZE: usize = mem::size_of::<bpf_map_def>();

#[derive(Debug, Clone)]
pub(crate) struct Program {
    pub(crate) name: String,
    pub(crate) kind: ProgramKind,
    pub(crate) instructions: Vec<bpf_insn>,
    pub(crate) license: CString,
    pub(crate) kernel_version: KernelVersion,
    pub(crate) relocations: Vec<MapRelocation>,
}

/// The attach-point family a program section name encodes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProgramKind {
    KProbe,
    UProbe,
    TracePoint,
    SocketFilter,
    Xdp,
}

impl ProgramKind {
    const PREFIXES: &'static [(&'static str, ProgramKind)] = &[
        ("kprobe", ProgramKind::KProbe),
        ("uprobe", ProgramKind::UProbe),
        ("trace_point", ProgramKind::TracePoint),
        ("socket", ProgramKind::SocketFilter),
        ("xdp", ProgramKind::Xdp),
    ];

    /// Match a section name against the recognized attach-point prefixes.
    /// Returns the kind and the program name (the part after `prefix/`, or
    /// the whole section name). Sections with no recognized prefix are
    /// non-loadable auxiliary code and parse to `None`.
    fn from_section_name(section_name: &str) -> Option<(ProgramKind, String)> {
        for (prefix, kind) in Self::PREFIXES {
            if section_name == *prefix || section_name.starts_with(&format!("{prefix}_")) {
                return Some((*kind, section_name.to_string()));
            }
            if let Some(rest) = section_name.strip_prefix(&format!("{prefix}/")) {
                if !rest.is_empty() {
                    return Some((*kind, rest.to_string()));
                }
            }
        }
        None
    }
}

impl FromStr for ProgramKind {
    type Err = ParseError;

    fn from_str(kind: &str) -> Result<ProgramKind, ParseError> {
        use ProgramKind::*;
        Ok(match kind {
            "kprobe" => KProbe,
            "uprobe" => UProbe,
            "trace_point" => TracePoint,
            "socket" => SocketFilter,
            "xdp" => Xdp,
            _ => {
                return Err(ParseError::InvalidProgramKind {
                    kind: kind.to_string(),
                })
            }
        })
    }
}

impl Object {
    pub(crate) fn parse(data: &[u8]) -> Result<Object, ParseError> {
        let elf = object::read::File::parse(data).map_err(|source| ParseError::Error { source })?;
        let endianness = elf.endianness();

        let section = elf
            .section_by_name("license")
            .ok_or(ParseError::MissingLicense)?;
        let license = parse_license(section_data(&section)?)?;

        let kernel_version = match elf.section_by_name("version") {
            Some(section) => parse_version(section_data(&section)?, endianness)?,
            None => KernelVersion::Any,
        };

        let mut obj = Object {
            license,
            kernel_version,
            maps: Vec::new(),
            programs: Vec::new(),
        };

        for section in elf.sections() {
            let name = section
                .name()
                .map_err(|source| ParseError::SectionError {
                    index: section.index().0,
                    source,
                })?
                .to_string();

            if name == "maps" {
                parse_maps_section(&mut obj, &elf, &section)?;
            } else if let Some(map_name) = name.strip_prefix("maps/") {
                let symbol_name = section_symbol_name(&elf, &section);
                let map_name = symbol_name.as_deref().unwrap_or(map_name);
                let def = parse_map_def(map_name, section_data(&section)?)?;
                push_map(&mut obj, map_name.to_string(), def)?;
            } else if let Some((kind, prog_name)) = ProgramKind::from_section_name(&name) {
                let program = parse_program(&obj, &elf, &section, kind, prog_name)?;
                if obj.programs.iter().any(|p| p.name == program.name) {
                    return Err(ParseError::DuplicateProgramName { name: program.name });
                }
                obj.programs.push(program);
            }
        }

        Ok(obj)
    }
}

fn push_map(obj: &mut Object, name: String, def: bpf_map_def) -> Result<(), ParseError> {
    if obj.maps.iter().any(|m| m.name == name) {
        return Err(ParseError::DuplicateMapName { name });
    }
    obj.maps.push(MapDecl { name, def });
    Ok(())
}

fn section_data<'s>(section: &'s Section<'_, '_>) -> Result<&'s [u8], ParseError> {
    section.data().map_err(|source| ParseError::SectionError {
        index: section.index().0,
        source,
    })
}

/// The name of the first named data symbol defined in `section`, if any.
fn section_symbol_name(elf: &object::read::File<'_>, section: &Section<'_, '_>) -> Option<String> {
    elf.symbols()
        .filter(|sym| sym.section_index() == Some(section.index()))
        .filter(|sym| sym.kind() != SymbolKind::Section)
        .find_map(|sym| match sym.name() {
            Ok(name) if !name.is_empty() => Some(name.to_string()),
            _ => None,
        })
}

/// A `maps` section holds consecutive fixed-stride declaration records, one
/// per symbol defined in the section.
fn parse_maps_section(
    obj: &mut Object,
    elf: &object::read::File<'_>,
    section: &Section<'_, '_>,
) -> Result<(), ParseError> {
    let data = section_data(section)?;
    if data.is_empty() || data.len() % MAP_DEF_SIZE != 0 {
        return Err(ParseError::InvalidMapsSectionSize { size: data.len() });
    }

    let mut names_by_record = HashMap::new();
    for sym in elf.symbols() {
        if sym.section_index() != Some(section.index()) || sym.kind() == SymbolKind::Section {
            continue;
        }
        let name = match sym.name() {
            Ok(name) if !name.is_empty() => name.to_string(),
            _ => continue,
        };
        let address = sym.address() as usize;
        if address % MAP_DEF_SIZE != 0 || address >= data.len() {
            return Err(ParseError::InvalidMapDefinition { name });
        }
        names_by_record.insert(address / MAP_DEF_SIZE, name);
    }

    for index in 0..data.len() / MAP_DEF_SIZE {
        let name = names_by_record
            .remove(&index)
            .ok_or(ParseError::MapRecordWithoutSymbol { index })?;
        let def = parse_map_def(&name, &data[index * MAP_DEF_SIZE..(index + 1) * MAP_DEF_SIZE])?;
        push_map(obj, name, def)?;
    }

    Ok(())
}

fn parse_map_def(name: &str, data: &[u8]) -> Result<bpf_map_def, ParseError> {
    if data.len() != MAP_DEF_SIZE {
        return Err(ParseError::InvalidMapDefinition {
            name: name.to_string(),
        });
    }
    Ok(unsafe { std::ptr::read_unaligned(data.as_ptr() as *const bpf_map_def) })
}

fn parse_program(
    obj: &Object,
    elf: &object::read::File<'_>,
    section: &Section<'_, '_>,
    kind: ProgramKind,
    name: String,
) -> Result<Program, ParseError> {
    let data = section_data(section)?;
    if data.is_empty() || data.len() % INSN_SIZE != 0 {
        return Err(ParseError::InvalidProgramCode { name });
    }

    let instructions = data
        .chunks_exact(INSN_SIZE)
        .map(|chunk| unsafe { std::ptr::read_unaligned(chunk.as_ptr() as *const bpf_insn) })
        .collect();

    let mut relocations = Vec::new();
    for (offset, relocation) in section.relocations() {
        let symbol = match relocation.target() {
            RelocationTarget::Symbol(index) => elf
                .symbol_by_index(index)
                .ok()
                .and_then(|sym| sym.name().ok().map(String::from))
                .filter(|name| !name.is_empty()),
            _ => None,
        };
        let symbol = symbol.ok_or(ParseError::UnknownRelocationSymbol {
            section: name.clone(),
            offset,
        })?;
        relocations.push(MapRelocation { offset, symbol });
    }

    Ok(Program {
        name,
        kind,
        instructions,
        license: obj.license.clone(),
        kernel_version: obj.kernel_version,
        relocations,
    })
}

fn parse_license(data: &[u8]) -> Result<CString, ParseError> {
    if data.len() < 2 {
        return Err(ParseError::InvalidLicense {
            data: data.to_vec(),
        });
    }
    if data[data.len() - 1] != 0 {
        return Err(ParseError::MissingLicenseNullTerminator {
            data: data.to_vec(),
        });
    }

    Ok(CStr::from_bytes_with_nul(data)
        .map_err(|_| ParseError::InvalidLicense {
            data: data.to_vec(),
        })?
        .to_owned())
}

fn parse_version(data: &[u8], endianness: Endianness) -> Result<KernelVersion, ParseError> {
    let data = match data.len() {
        4 => data.try_into().unwrap(),
        _ => {
            return Err(ParseError::InvalidKernelVersion {
                data: data.to_vec(),
            })
        }
    };

    let v = match endianness {
        Endianness::Big => u32::from_be_bytes(data),
        Endianness::Little => u32::from_le_bytes(data),
    };

    Ok(match v {
        KERNEL_VERSION_ANY => KernelVersion::Any,
        v => KernelVersion::Version(v),
    })
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum KernelVersion {
    Version(u32),
    Any,
}

impl From<KernelVersion> for u32 {
    fn from(version: KernelVersion) -> u32 {
        match version {
            KernelVersion::Any => KERNEL_VERSION_ANY,
            KernelVersion::Version(v) => v,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ParseError {
    #[error("error parsing ELF data")]
    Error {
        #[source]
        source: object::read::Error,
    },

    #[error("no license specified")]
    MissingLicense,

    #[error("invalid license `{data:?}`: missing NULL terminator")]
    MissingLicenseNullTerminator { data: Vec<u8> },

    #[error("invalid license `{data:?}`")]
    InvalidLicense { data: Vec<u8> },

    #[error("invalid kernel version `{data:?}`")]
    InvalidKernelVersion { data: Vec<u8> },

    #[error("error parsing section with index {index}")]
    SectionError {
        index: usize,
        #[source]
        source: object::read::Error,
    },

    #[error("maps section size {size} is not a multiple of the declaration record size")]
    InvalidMapsSectionSize { size: usize },

    #[error("maps section record {index} has no defining symbol")]
    MapRecordWithoutSymbol { index: usize },

    #[error("error parsing map `{name}`")]
    InvalidMapDefinition { name: String },

    #[error("duplicate map name `{name}`")]
    DuplicateMapName { name: String },

    #[error("duplicate program name `{name}`")]
    DuplicateProgramName { name: String },

    #[error("invalid program kind `{kind}`")]
    InvalidProgramKind { kind: String },

    #[error("error parsing program `{name}`")]
    InvalidProgramCode { name: String },

    #[error("cannot resolve the relocation at offset {offset} in section `{section}`")]
    UnknownRelocationSymbol { section: String, offset: u64 },
}

/// The kernel map types the loader knows how to create and operate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MapType {
    Hash,
    Array,
    ProgArray,
    PerfEventArray,
    PerCpuHash,
    PerCpuArray,
    LruHash,
    LruPerCpuHash,
    DevMap,
}

impl MapType {
    pub(crate) fn to_raw(self) -> u32 {
        use MapType::*;
        match self {
            Hash => BPF_MAP_TYPE_HASH,
            Array => BPF_MAP_TYPE_ARRAY,
            ProgArray => BPF_MAP_TYPE_PROG_ARRAY,
            PerfEventArray => BPF_MAP_TYPE_PERF_EVENT_ARRAY,
            PerCpuHash => BPF_MAP_TYPE_PERCPU_HASH,
            PerCpuArray => BPF_MAP_TYPE_PERCPU_ARRAY,
            LruHash => BPF_MAP_TYPE_LRU_HASH,
            LruPerCpuHash => BPF_MAP_TYPE_LRU_PERCPU_HASH,
            DevMap => BPF_MAP_TYPE_DEVMAP,
        }
    }

    pub(crate) fn from_raw(map_type: u32) -> Option<MapType> {
        use MapType::*;
        Some(match map_type {
            BPF_MAP_TYPE_HASH => Hash,
            BPF_MAP_TYPE_ARRAY => Array,
            BPF_MAP_TYPE_PROG_ARRAY => ProgArray,
            BPF_MAP_TYPE_PERF_EVENT_ARRAY => PerfEventArray,
            BPF_MAP_TYPE_PERCPU_HASH => PerCpuHash,
            BPF_MAP_TYPE_PERCPU_ARRAY => PerCpuArray,
            BPF_MAP_TYPE_LRU_HASH => LruHash,
            BPF_MAP_TYPE_LRU_PERCPU_HASH => LruPerCpuHash,
            BPF_MAP_TYPE_DEVMAP => DevMap,
            _ => return None,
        })
    }

    /// Index-keyed types: the key is a 32 bit slot number.
    pub(crate) fn is_index_keyed(self) -> bool {
        use MapType::*;
        matches!(
            self,
            Array | PerCpuArray | ProgArray | DevMap | PerfEventArray
        )
    }

    /// Types whose values hold one independent slot per possible CPU.
    pub(crate) fn is_per_cpu(self) -> bool {
        use MapType::*;
        matches!(self, PerCpuHash | PerCpuArray | LruPerCpuHash)
    }

    /// Types whose values are resource handles (program fds, device
    /// indices, perf event fds) rather than arbitrary data.
    pub(crate) fn holds_fd_values(self) -> bool {
        use MapType::*;
        matches!(self, ProgArray | DevMap | PerfEventArray)
    }

    pub(crate) fn is_lru(self) -> bool {
        use MapType::*;
        matches!(self, LruHash | LruPerCpuHash)
    }

    /// Array-backed types never support element deletion.
    pub(crate) fn is_array_family(self) -> bool {
        use MapType::*;
        matches!(
            self,
            Array | PerCpuArray | ProgArray | DevMap | PerfEventArray
        )
    }
}

/// The width of the 32 bit index key and of handle-index values.
const INDEX_WIDTH: u32 = mem::size_of::<u32>() as u32;

/// A validated map declaration. Immutable once constructed; the creation
/// request sent to the kernel uses exactly these values.
#[derive(Debug, Clone)]
pub struct MapSpec {
    name: String,
    map_type: MapType,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    flags: u32,
}

impl MapSpec {
    /// Validate one raw declaration record. `nr_cpus` supplies the default
    /// capacity for perf event arrays declared without `max_entries`.
    pub(crate) fn new(
        name: &str,
        def: &bpf_map_def,
        nr_cpus: u32,
    ) -> Result<MapSpec, MapSpecError> {
        let map_type = MapType::from_raw(def.map_type).ok_or(MapSpecError::UnsupportedMapType {
            map: name.to_string(),
            map_type: def.map_type,
        })?;

        if map_type.is_index_keyed() {
            if def.key_size != INDEX_WIDTH {
                return Err(MapSpecError::InvalidKeySize {
                    map: name.to_string(),
                    key_size: def.key_size,
                });
            }
        } else if def.key_size == 0 {
            return Err(MapSpecError::InvalidKeySize {
                map: name.to_string(),
                key_size: def.key_size,
            });
        }

        // Handle-index values have a fixed width no matter what the
        // declaration says.
        let value_size = if map_type.holds_fd_values() {
            INDEX_WIDTH
        } else if def.value_size == 0 {
            return Err(MapSpecError::InvalidValueSize {
                map: name.to_string(),
                value_size: def.value_size,
            });
        } else {
            def.value_size
        };

        let max_entries = match (def.max_entries, map_type) {
            // A perf event array declared without a capacity gets one slot
            // per possible CPU.
            (0, MapType::PerfEventArray) => nr_cpus,
            (0, _) => {
                return Err(MapSpecError::InvalidMaxEntries {
                    map: name.to_string(),
                    max_entries: 0,
                })
            }
            (n, _) => n,
        };

        Ok(MapSpec {
            name: name.to_string(),
            map_type,
            key_size: def.key_size,
            value_size,
            max_entries,
            flags: def.map_flags,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn map_type(&self) -> MapType {
        self.map_type
    }

    pub fn key_size(&self) -> u32 {
        self.key_size
    }

    pub fn value_size(&self) -> u32 {
        self.value_size
    }

    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }
}

#[derive(Debug, Clone, Error)]
pub enum MapSpecError {
    #[error("map `{map}`: unsupported map type {map_type}")]
    UnsupportedMapType { map: String, map_type: u32 },

    #[error("map `{map}`: invalid key_size {key_size}")]
    InvalidKeySize { map: String, key_size: u32 },

    #[error("map `{map}`: invalid value_size {value_size}")]
    InvalidValueSize { map: String, value_size: u32 },

    #[error("map `{map}`: invalid max_entries {max_entries}")]
    InvalidMaxEntries { map: String, max_entries: u32 },
}
