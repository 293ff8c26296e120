use std::collections::HashMap;

use thiserror::Error;

use super::Object;
use crate::{
    abi::{BPF_PSEUDO_MAP_FD, INSN_SIZE},
    maps::Map,
};

#[derive(Debug, Clone, Error)]
pub enum RelocationError {
    #[error("program `{program}` references the map `{symbol}` which does not exist")]
    UnresolvedMapReference { program: String, symbol: String },

    #[error("the map `{name}` has not been created")]
    MapNotCreated { name: String },

    #[error("program `{program}`: invalid relocation offset {offset}")]
    InvalidRelocationOffset { program: String, offset: u64 },
}

/// One patch site inside a program: the instruction at `offset` must be
/// rewritten to carry the fd of the map declared by `symbol`.
#[derive(Debug, Clone)]
pub(crate) struct MapRelocation {
    pub(crate) offset: u64,
    pub(crate) symbol: String,
}

/// Rewrite every map reference in every program to point at the created
/// maps. All referenced maps must exist before this runs; the patched
/// instruction stream is the only link kept afterwards.
pub fn relocate(obj: &mut Object, maps: &[Map]) -> Result<(), RelocationError> {
    let maps_by_name = maps
        .iter()
        .map(|map| (map.spec().name(), map))
        .collect::<HashMap<_, _>>();

    for program in obj.programs.iter_mut() {
        for rel in std::mem::take(&mut program.relocations) {
            let map = maps_by_name.get(rel.symbol.as_str()).ok_or_else(|| {
                RelocationError::UnresolvedMapReference {
                    program: program.name.clone(),
                    symbol: rel.symbol.clone(),
                }
            })?;
            let fd = map.fd.ok_or_else(|| RelocationError::MapNotCreated {
                name: rel.symbol.clone(),
            })?;

            let ins_index = (rel.offset / INSN_SIZE as u64) as usize;
            if rel.offset % INSN_SIZE as u64 != 0 || ins_index >= program.instructions.len() {
                return Err(RelocationError::InvalidRelocationOffset {
                    program: program.name.clone(),
                    offset: rel.offset,
                });
            }

            let insn = &mut program.instructions[ins_index];
            insn.set_src_reg(BPF_PSEUDO_MAP_FD);
            insn.imm = fd;
        }
    }

    Ok(())
}
