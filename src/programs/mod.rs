//! Loaded program handles.
//!
//! Programs come out of [`Bpf::load`](crate::Bpf::load) already verified by
//! the kernel; the handles here expose the fd, the captured verifier log
//! and the attach call for the kinds that support one.
mod xdp;

use std::{cmp, ffi::CStr, io, slice, sync::Arc};

use log::debug;
use thiserror::Error;

use crate::{
    abi::{
        bpf_insn, BPF_PROG_TYPE_KPROBE, BPF_PROG_TYPE_SOCKET_FILTER, BPF_PROG_TYPE_TRACEPOINT,
        BPF_PROG_TYPE_XDP, INSN_SIZE,
    },
    obj,
    obj::ProgramKind,
    sys::Kernel,
    RawFd,
};

pub use xdp::{LinkId, Xdp, XdpFlags};

#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("the program `{program}` is already loaded")]
    AlreadyLoaded { program: String },

    #[error("the program `{program}` is not loaded")]
    NotLoaded { program: String },

    #[error("the kernel verifier rejected `{program}`: {io_error}\nVerifier output:\n{verifier_log}")]
    VerifierRejected {
        program: String,
        #[source]
        io_error: io::Error,
        verifier_log: String,
    },

    #[error("the program `{program}` requires a GPL compatible license, got `{license}`")]
    IncompatibleLicense { program: String, license: String },

    #[error("error attaching `{program}`: {io_error}")]
    LinkFailed {
        program: String,
        #[source]
        io_error: io::Error,
    },

    #[error("the link was already detached")]
    AlreadyDetached,

    #[error("unknown network interface `{name}`")]
    UnknownInterface { name: String },

    #[error("failed to release `{program}`: {io_error}")]
    CloseFailed {
        program: String,
        #[source]
        io_error: io::Error,
    },

    #[error("unexpected program type")]
    UnexpectedProgramType,
}

/// Access to the raw fd of a loaded program.
pub trait ProgramFd {
    fn fd(&self) -> Option<RawFd>;
}

/// One loaded (or loadable) program, by attach-point kind.
#[derive(Debug)]
pub enum Program {
    KProbe(KProbe),
    UProbe(UProbe),
    TracePoint(TracePoint),
    SocketFilter(SocketFilter),
    Xdp(Xdp),
}

impl Program {
    pub(crate) fn new(obj: obj::Program, kernel: Arc<dyn Kernel>) -> Program {
        let data = ProgramData {
            name: obj.name.clone(),
            obj,
            fd: None,
            kernel,
            links: Vec::new(),
            verifier_log: String::new(),
        };
        match data.obj.kind {
            ProgramKind::KProbe => Program::KProbe(KProbe { data }),
            ProgramKind::UProbe => Program::UProbe(UProbe { data }),
            ProgramKind::TracePoint => Program::TracePoint(TracePoint { data }),
            ProgramKind::SocketFilter => Program::SocketFilter(SocketFilter { data }),
            ProgramKind::Xdp => Program::Xdp(Xdp { data }),
        }
    }

    pub(crate) fn load(&mut self) -> Result<(), ProgramError> {
        load_program(self.prog_type(), self.data_mut())
    }

    pub fn name(&self) -> &str {
        &self.data().name
    }

    pub fn kind(&self) -> ProgramKind {
        self.data().obj.kind
    }

    /// The verifier log captured when this program was loaded; empty on a
    /// clean accept.
    pub fn verifier_log(&self) -> &str {
        &self.data().verifier_log
    }

    fn prog_type(&self) -> u32 {
        match self {
            Program::KProbe(_) | Program::UProbe(_) => BPF_PROG_TYPE_KPROBE,
            Program::TracePoint(_) => BPF_PROG_TYPE_TRACEPOINT,
            Program::SocketFilter(_) => BPF_PROG_TYPE_SOCKET_FILTER,
            Program::Xdp(_) => BPF_PROG_TYPE_XDP,
        }
    }

    pub(crate) fn data(&self) -> &ProgramData {
        match self {
            Program::KProbe(p) => &p.data,
            Program::UProbe(p) => &p.data,
            Program::TracePoint(p) => &p.data,
            Program::SocketFilter(p) => &p.data,
            Program::Xdp(p) => &p.data,
        }
    }

    pub(crate) fn data_mut(&mut self) -> &mut ProgramData {
        match self {
            Program::KProbe(p) => &mut p.data,
            Program::UProbe(p) => &mut p.data,
            Program::TracePoint(p) => &mut p.data,
            Program::SocketFilter(p) => &mut p.data,
            Program::Xdp(p) => &mut p.data,
        }
    }

    /// Detach and release the program. The links it created go first so no
    /// kernel object is left referencing the program fd.
    pub(crate) fn close(&mut self) -> Result<(), ProgramError> {
        self.data_mut().close()
    }
}

#[derive(Debug)]
pub(crate) struct ProgramData {
    pub(crate) name: String,
    pub(crate) obj: obj::Program,
    pub(crate) fd: Option<RawFd>,
    pub(crate) kernel: Arc<dyn Kernel>,
    pub(crate) links: Vec<RawFd>,
    pub(crate) verifier_log: String,
}

impl ProgramData {
    fn fd_or_err(&self) -> Result<RawFd, ProgramError> {
        self.fd.ok_or(ProgramError::NotLoaded {
            program: self.name.clone(),
        })
    }

    fn close(&mut self) -> Result<(), ProgramError> {
        let mut result = Ok(());
        for link in self.links.drain(..) {
            if let Err((_, io_error)) = self.kernel.close(link) {
                if result.is_ok() {
                    result = Err(ProgramError::CloseFailed {
                        program: self.name.clone(),
                        io_error,
                    });
                }
            }
        }
        if let Some(fd) = self.fd.take() {
            if let Err((_, io_error)) = self.kernel.close(fd) {
                if result.is_ok() {
                    result = Err(ProgramError::CloseFailed {
                        program: self.name.clone(),
                        io_error,
                    });
                }
            }
        }
        result
    }
}

impl Drop for ProgramData {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

const MAX_LOG_BUF_SIZE: usize = (u32::MAX >> 8) as usize;

/// Buffer the kernel verifier writes its diagnostic into. Starts empty and
/// grows until the full log fits.
pub(crate) struct VerifierLog {
    buf: Vec<u8>,
}

impl VerifierLog {
    fn new() -> VerifierLog {
        VerifierLog { buf: Vec::new() }
    }

    pub(crate) fn buf(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    fn grow(&mut self) {
        self.buf.reserve(cmp::max(
            1024 * 4,
            cmp::min(MAX_LOG_BUF_SIZE, self.buf.capacity() * 2),
        ));
        self.buf.resize(self.buf.capacity(), 0);
    }

    fn reset(&mut self) {
        if !self.buf.is_empty() {
            self.buf[0] = 0;
        }
    }

    fn as_string(&self) -> String {
        if self.buf.is_empty() {
            return String::new();
        }
        let end = self
            .buf
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.buf.len());
        String::from_utf8_lossy(&self.buf[..end]).into_owned()
    }
}

/// The kernel only lets GPL compatible programs call GPL-only helpers;
/// tracing program kinds cannot do anything useful without them, so an
/// incompatible license is rejected before the verifier is ever invoked.
fn requires_gpl_compatible(kind: ProgramKind) -> bool {
    matches!(
        kind,
        ProgramKind::KProbe | ProgramKind::UProbe | ProgramKind::TracePoint
    )
}

/// The license strings the kernel treats as GPL compatible.
fn license_is_gpl_compatible(license: &CStr) -> bool {
    matches!(
        license.to_str(),
        Ok("GPL")
            | Ok("GPL v2")
            | Ok("GPL and additional rights")
            | Ok("Dual BSD/GPL")
            | Ok("Dual MIT/GPL")
            | Ok("Dual MPL/GPL")
    )
}

fn instructions_as_bytes(instructions: &[bpf_insn]) -> &[u8] {
    unsafe {
        slice::from_raw_parts(
            instructions.as_ptr() as *const u8,
            instructions.len() * INSN_SIZE,
        )
    }
}

fn load_program(prog_type: u32, data: &mut ProgramData) -> Result<(), ProgramError> {
    if data.fd.is_some() {
        return Err(ProgramError::AlreadyLoaded {
            program: data.name.clone(),
        });
    }

    let obj::Program {
        instructions,
        license,
        kernel_version,
        kind,
        ..
    } = &data.obj;

    if requires_gpl_compatible(*kind) && !license_is_gpl_compatible(license) {
        return Err(ProgramError::IncompatibleLicense {
            program: data.name.clone(),
            license: license.to_string_lossy().into_owned(),
        });
    }

    let insn_bytes = instructions_as_bytes(instructions);
    let mut log_buf = VerifierLog::new();
    let mut ret = Ok(0);
    for attempt in 0..3 {
        log_buf.reset();

        ret = data.kernel.prog_load(
            prog_type,
            insn_bytes,
            license,
            u32::from(*kernel_version),
            log_buf.buf(),
        );

        match &ret {
            Ok(prog_fd) => {
                data.fd = Some(*prog_fd as RawFd);
                data.verifier_log = log_buf.as_string();
                debug!("loaded program `{}` with fd {}", data.name, prog_fd);
                return Ok(());
            }
            // grow the log buffer and retry to capture the full diagnostic
            Err((_, io_error))
                if attempt == 0 || io_error.raw_os_error() == Some(libc::ENOSPC) =>
            {
                log_buf.grow();
            }
            Err(_) => break,
        }
    }

    if let Err((_, io_error)) = ret {
        return Err(ProgramError::VerifierRejected {
            program: data.name.clone(),
            io_error,
            verifier_log: log_buf.as_string(),
        });
    }

    Ok(())
}

macro_rules! define_program {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name {
            pub(crate) data: ProgramData,
        }

        impl $name {
            pub fn name(&self) -> &str {
                &self.data.name
            }
        }
    };
}

define_program!(
    /// A program attached to a kernel function entry point.
    KProbe
);
define_program!(
    /// A program attached to a user-space function entry point.
    UProbe
);
define_program!(
    /// A program attached to a static kernel tracepoint.
    TracePoint
);
define_program!(
    /// A classic socket filter.
    SocketFilter
);

macro_rules! impl_program_fd {
    ($($struct_name:ident),+ $(,)?) => {
        $(
            impl ProgramFd for $struct_name {
                fn fd(&self) -> Option<RawFd> {
                    self.data.fd
                }
            }
        )+
    }
}

impl_program_fd!(KProbe, UProbe, TracePoint, SocketFilter, Xdp);

impl ProgramFd for Program {
    fn fd(&self) -> Option<RawFd> {
        self.data().fd
    }
}

macro_rules! impl_try_from_program {
    ($($ty:ident),+ $(,)?) => {
        $(
            impl<'a> TryFrom<&'a Program> for &'a $ty {
                type Error = ProgramError;

                fn try_from(program: &'a Program) -> Result<&'a $ty, ProgramError> {
                    match program {
                        Program::$ty(p) => Ok(p),
                        _ => Err(ProgramError::UnexpectedProgramType),
                    }
                }
            }

            impl<'a> TryFrom<&'a mut Program> for &'a mut $ty {
                type Error = ProgramError;

                fn try_from(program: &'a mut Program) -> Result<&'a mut $ty, ProgramError> {
                    match program {
                        Program::$ty(p) => Ok(p),
                        _ => Err(ProgramError::UnexpectedProgramType),
                    }
                }
            }
        )+
    }
}

impl_try_from_program!(KProbe, UProbe, TracePoint, SocketFilter, Xdp);
