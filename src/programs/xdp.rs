use std::ffi::CString;

use bitflags::bitflags;

use crate::{
    abi::BPF_XDP,
    programs::{ProgramData, ProgramError},
    RawFd,
};

bitflags! {
    /// Flags controlling how an XDP program is attached to an interface.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct XdpFlags: u32 {
        const UPDATE_IF_NOEXIST = 1;
        const SKB_MODE = 1 << 1;
        const DRV_MODE = 1 << 2;
        const HW_MODE = 1 << 3;
        const REPLACE = 1 << 4;
    }
}

/// Identifies one attachment of a program; pass it back to
/// [`Xdp::detach`].
#[derive(Debug, PartialEq, Eq)]
pub struct LinkId(pub(crate) RawFd);

/// A program attached to the packet-receive path of a network interface,
/// returning a verdict (pass, drop, redirect) per packet.
#[derive(Debug)]
pub struct Xdp {
    pub(crate) data: ProgramData,
}

impl Xdp {
    pub fn name(&self) -> &str {
        &self.data.name
    }

    /// Attach to the interface with the given index. The returned link
    /// keeps the attachment alive until [`detach`](Xdp::detach) or until
    /// the program is closed.
    pub fn attach(&mut self, if_index: u32, flags: XdpFlags) -> Result<LinkId, ProgramError> {
        let prog_fd = self.data.fd_or_err()?;
        let link_fd = self
            .data
            .kernel
            .link_create(prog_fd, if_index, BPF_XDP, flags.bits())
            .map_err(|(_, io_error)| ProgramError::LinkFailed {
                program: self.data.name.clone(),
                io_error,
            })? as RawFd;
        self.data.links.push(link_fd);
        Ok(LinkId(link_fd))
    }

    /// Attach to an interface by name.
    pub fn attach_to_interface(
        &mut self,
        interface: &str,
        flags: XdpFlags,
    ) -> Result<LinkId, ProgramError> {
        let c_interface =
            CString::new(interface).map_err(|_| ProgramError::UnknownInterface {
                name: interface.to_string(),
            })?;
        let if_index = unsafe { libc::if_nametoindex(c_interface.as_ptr()) };
        if if_index == 0 {
            return Err(ProgramError::UnknownInterface {
                name: interface.to_string(),
            });
        }
        self.attach(if_index, flags)
    }

    /// Undo one attachment.
    pub fn detach(&mut self, link: LinkId) -> Result<(), ProgramError> {
        let LinkId(link_fd) = link;
        let position = self
            .data
            .links
            .iter()
            .position(|fd| *fd == link_fd)
            .ok_or(ProgramError::AlreadyDetached)?;
        self.data.links.remove(position);
        self.data
            .kernel
            .close(link_fd)
            .map(|_| ())
            .map_err(|(_, io_error)| ProgramError::CloseFailed {
                program: self.data.name.clone(),
                io_error,
            })
    }
}
