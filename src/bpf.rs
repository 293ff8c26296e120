use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use hashbrown::HashMap;
use log::{debug, warn};
use thiserror::Error;

use crate::{
    maps::{Map, MapError},
    obj::{relocate, MapSpec, MapSpecError, Object, ParseError, RelocationError},
    programs::{Program, ProgramError},
    sys::{Kernel, SysKernel},
};

/// Drives the load pipeline: parse, validate, create maps, relocate, load
/// programs. The kernel interface is injected so the whole pipeline can run
/// against a substitute.
pub struct BpfLoader {
    kernel: Arc<dyn Kernel>,
    deadline: Option<Instant>,
    cancel: Option<Arc<AtomicBool>>,
}

impl BpfLoader {
    pub fn new(kernel: Arc<dyn Kernel>) -> BpfLoader {
        BpfLoader {
            kernel,
            deadline: None,
            cancel: None,
        }
    }

    /// Abort the load if it is still running at `deadline`. Checked between
    /// pipeline stages, never mid-syscall.
    pub fn with_deadline(mut self, deadline: Instant) -> BpfLoader {
        self.deadline = Some(deadline);
        self
    }

    /// Abort the load when `flag` becomes true. Checked between pipeline
    /// stages, never mid-syscall.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> BpfLoader {
        self.cancel = Some(flag);
        self
    }

    /// Run the full pipeline over a compiled object. On any failure every
    /// map and program created during this attempt is released before the
    /// error is returned.
    pub fn load(&self, data: &[u8]) -> Result<Bpf, BpfError> {
        self.load_pipeline(data).map_err(|e| {
            warn!("load failed, rolling back: {e}");
            e
        })
    }

    /// Like [`load`](BpfLoader::load), reading the object from a file.
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<Bpf, BpfError> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|error| BpfError::FileError {
            path: path.to_owned(),
            error,
        })?;
        self.load(&data)
    }

    fn load_pipeline(&self, data: &[u8]) -> Result<Bpf, BpfError> {
        let mut obj = Object::parse(data)?;
        debug!(
            "parsed object: {} map declarations, {} programs",
            obj.maps.len(),
            obj.programs.len()
        );
        self.check_cancelled()?;

        let nr_cpus = self.kernel.nr_cpus() as u32;
        let mut specs = Vec::with_capacity(obj.maps.len());
        for decl in &obj.maps {
            specs.push(MapSpec::new(&decl.name, &decl.def, nr_cpus)?);
        }
        self.check_cancelled()?;

        // from here on, dropping `maps` / `programs` on the error path
        // releases everything created during this attempt
        let mut maps = Vec::with_capacity(specs.len());
        for spec in specs {
            maps.push(Map::create(spec, self.kernel.clone())?);
        }
        self.check_cancelled()?;

        relocate(&mut obj, &maps)?;
        self.check_cancelled()?;

        let mut programs = Vec::with_capacity(obj.programs.len());
        for prog_obj in std::mem::take(&mut obj.programs) {
            let mut program = Program::new(prog_obj, self.kernel.clone());
            program.load()?;
            programs.push(program);
        }

        Ok(Bpf {
            programs: programs
                .into_iter()
                .map(|program| (program.name().to_string(), program))
                .collect(),
            maps: maps
                .into_iter()
                .map(|map| (map.spec().name().to_string(), map))
                .collect(),
        })
    }

    fn check_cancelled(&self) -> Result<(), BpfError> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(BpfError::Cancelled);
            }
        }
        if let Some(flag) = &self.cancel {
            if flag.load(Ordering::Relaxed) {
                return Err(BpfError::Cancelled);
            }
        }
        Ok(())
    }
}

/// Everything produced by loading one object file: the created maps and the
/// loaded programs, looked up by their declared names.
///
/// The collection is the exclusive owner of its kernel resources. Dropping
/// it releases them; [`close`](Bpf::close) does the same but reports what
/// failed to release.
#[derive(Debug)]
pub struct Bpf {
    // programs are declared (and therefore dropped) before the maps their
    // instructions reference
    programs: HashMap<String, Program>,
    maps: HashMap<String, Map>,
}

impl Bpf {
    /// Load a compiled object using the real kernel interface.
    pub fn load(data: &[u8]) -> Result<Bpf, BpfError> {
        let kernel = SysKernel::new().map_err(BpfError::SystemError)?;
        BpfLoader::new(Arc::new(kernel)).load(data)
    }

    /// Read and load a compiled object file.
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Bpf, BpfError> {
        let kernel = SysKernel::new().map_err(BpfError::SystemError)?;
        BpfLoader::new(Arc::new(kernel)).load_file(path)
    }

    pub fn map(&self, name: &str) -> Option<&Map> {
        self.maps.get(name)
    }

    pub fn map_mut(&mut self, name: &str) -> Option<&mut Map> {
        self.maps.get_mut(name)
    }

    /// The created maps and their names, in no particular order.
    pub fn maps(&self) -> impl Iterator<Item = (&str, &Map)> {
        self.maps.iter().map(|(name, map)| (name.as_str(), map))
    }

    pub fn program(&self, name: &str) -> Option<&Program> {
        self.programs.get(name)
    }

    pub fn program_mut(&mut self, name: &str) -> Option<&mut Program> {
        self.programs.get_mut(name)
    }

    /// The loaded programs and their names, in no particular order.
    pub fn programs(&self) -> impl Iterator<Item = (&str, &Program)> {
        self.programs
            .iter()
            .map(|(name, program)| (name.as_str(), program))
    }

    /// Release every program, then every map. One stuck resource does not
    /// stop the others from being released; all failures are reported
    /// together.
    pub fn close(mut self) -> Result<(), CloseError> {
        let mut failures = Vec::new();
        for (name, mut program) in self.programs.drain() {
            if let Err(e) = program.close() {
                failures.push(format!("program `{name}`: {e}"));
            }
        }
        for (name, mut map) in self.maps.drain() {
            if let Err(e) = map.close() {
                failures.push(format!("map `{name}`: {e}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(CloseError { failures })
        }
    }
}

#[derive(Debug, Error)]
pub enum BpfError {
    #[error("error parsing object: {0}")]
    ParseError(#[from] ParseError),

    #[error("invalid map declaration: {0}")]
    MapSpecError(#[from] MapSpecError),

    #[error("error relocating program: {0}")]
    RelocationError(#[from] RelocationError),

    #[error("map error: {0}")]
    MapError(#[from] MapError),

    #[error("program error: {0}")]
    ProgramError(#[from] ProgramError),

    #[error("error reading `{path}`: {error}")]
    FileError {
        path: PathBuf,
        #[source]
        error: io::Error,
    },

    #[error("error querying the system: {0}")]
    SystemError(#[source] io::Error),

    #[error("the load was cancelled")]
    Cancelled,
}

/// The resources a [`Bpf::close`] could not release.
#[derive(Debug, Error)]
#[error("failed to release: {}", failures.join("; "))]
pub struct CloseError {
    pub failures: Vec<String>,
}
