//! SSA control-flow graphs for the μVM and the PHI-elimination pass
//! that lowers them into a φ-free forked-block form.

use std::fmt;

mod cfg;
mod inst;
mod reducer;
mod value;

pub use cfg::{BasicBlock, BlockRef, Cfg, CfgBuilder, Transition};
pub use inst::{AtomicRmwOptr, BinOptr, CallConv, CmpOptr, ConvOptr, Inst, MemoryOrder};
pub use reducer::reduce;
pub use value::{FuncId, IFuncId, SigId, TypeId, ValueId, ValueInfo, ValueKind, ValueTable};

/// Failures surfaced by the reducer, each naming the offending function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReduceError {
    /// The entry block contains a φ-instruction.
    IllegalEntryPhi { func: String },
    /// The CFG is malformed.
    InvalidIr { func: String, reason: &'static str },
}

impl fmt::Display for ReduceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalEntryPhi { func } => {
                write!(f, "cannot reduce {func}: phi instruction in the entry block")
            }
            Self::InvalidIr { func, reason } => {
                write!(f, "cannot reduce {func}: {reason}")
            }
        }
    }
}

impl std::error::Error for ReduceError {}
