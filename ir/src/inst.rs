//! The μVM instruction set as one tagged enum.
//!
//! Operand slots hold [`ValueId`]s; control-transfer instructions carry
//! their successors as [`BlockRef`]s. The uniform accessors at the
//! bottom are what the reducer builds on: operand remapping applies to
//! every value operand, successor rewriting to every carried label.

use core::fmt;

use crate::cfg::BlockRef;
use crate::value::{IFuncId, SigId, TypeId, ValueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOptr {
    Add,
    Sub,
    Mul,
    Sdiv,
    Srem,
    Udiv,
    Urem,
    Shl,
    Lshr,
    Ashr,
    And,
    Or,
    Xor,
    Fadd,
    Fsub,
    Fmul,
    Fdiv,
    Frem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOptr {
    Eq,
    Ne,
    Sge,
    Sgt,
    Sle,
    Slt,
    Uge,
    Ugt,
    Ule,
    Ult,
    Ffalse,
    Ftrue,
    Funo,
    Fueq,
    Fune,
    Fugt,
    Fuge,
    Fult,
    Fule,
    Ford,
    Foeq,
    Fone,
    Fogt,
    Foge,
    Folt,
    Fole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvOptr {
    Trunc,
    Zext,
    Sext,
    Fptrunc,
    Fpext,
    Fptoui,
    Fptosi,
    Uitofp,
    Sitofp,
    Bitcast,
    Refcast,
    Irefcast,
    Funccast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOrder {
    NotAtomic,
    Relaxed,
    Consume,
    Acquire,
    Release,
    AcqRel,
    SeqCst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicRmwOptr {
    Xchg,
    Add,
    Sub,
    And,
    Nand,
    Or,
    Xor,
    Max,
    Min,
    Umax,
    Umin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConv {
    Default,
}

/// One μVM instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inst {
    New {
        ty: TypeId,
        result: ValueId,
    },
    NewHybrid {
        ty: TypeId,
        len: ValueId,
        result: ValueId,
    },
    Alloca {
        ty: TypeId,
        result: ValueId,
    },
    AllocaHybrid {
        ty: TypeId,
        len: ValueId,
        result: ValueId,
    },
    BinOp {
        op: BinOptr,
        ty: TypeId,
        lhs: ValueId,
        rhs: ValueId,
        result: ValueId,
    },
    Cmp {
        op: CmpOptr,
        ty: TypeId,
        lhs: ValueId,
        rhs: ValueId,
        result: ValueId,
    },
    Conversion {
        op: ConvOptr,
        from_ty: TypeId,
        to_ty: TypeId,
        operand: ValueId,
        result: ValueId,
    },
    Select {
        ty: TypeId,
        cond: ValueId,
        if_true: ValueId,
        if_false: ValueId,
        result: ValueId,
    },
    ExtractValue {
        ty: TypeId,
        index: u32,
        operand: ValueId,
        result: ValueId,
    },
    GetIRef {
        ty: TypeId,
        operand: ValueId,
        result: ValueId,
    },
    GetFieldIRef {
        ty: TypeId,
        index: u32,
        operand: ValueId,
        result: ValueId,
    },
    GetElemIRef {
        ty: TypeId,
        index: ValueId,
        operand: ValueId,
        result: ValueId,
    },
    ShiftIRef {
        ty: TypeId,
        offset: ValueId,
        operand: ValueId,
        result: ValueId,
    },
    GetFixedPartIRef {
        ty: TypeId,
        operand: ValueId,
        result: ValueId,
    },
    GetVarPartIRef {
        ty: TypeId,
        operand: ValueId,
        result: ValueId,
    },
    Load {
        ord: MemoryOrder,
        ty: TypeId,
        location: ValueId,
        result: ValueId,
    },
    Store {
        ord: MemoryOrder,
        ty: TypeId,
        location: ValueId,
        value: ValueId,
    },
    CmpXchg {
        ord_succ: MemoryOrder,
        ord_fail: MemoryOrder,
        ty: TypeId,
        location: ValueId,
        expected: ValueId,
        desired: ValueId,
        result: ValueId,
    },
    AtomicRmw {
        ord: MemoryOrder,
        op: AtomicRmwOptr,
        ty: TypeId,
        location: ValueId,
        operand: ValueId,
        result: ValueId,
    },
    Fence {
        ord: MemoryOrder,
    },
    Call {
        sig: SigId,
        callee: ValueId,
        args: Vec<ValueId>,
        keepalives: Vec<ValueId>,
        result: ValueId,
    },
    CCall {
        conv: CallConv,
        sig: SigId,
        callee: ValueId,
        args: Vec<ValueId>,
        result: ValueId,
    },
    ICall {
        ifunc: IFuncId,
        args: Vec<ValueId>,
        keepalives: Vec<ValueId>,
        result: ValueId,
    },
    TailCall {
        sig: SigId,
        callee: ValueId,
        args: Vec<ValueId>,
    },
    NewStack {
        sig: SigId,
        callee: ValueId,
        args: Vec<ValueId>,
        result: ValueId,
    },
    Branch {
        dest: BlockRef,
    },
    Branch2 {
        cond: ValueId,
        if_true: BlockRef,
        if_false: BlockRef,
    },
    Switch {
        ty: TypeId,
        operand: ValueId,
        default: BlockRef,
        cases: Vec<(ValueId, BlockRef)>,
    },
    Invoke {
        sig: SigId,
        callee: ValueId,
        args: Vec<ValueId>,
        keepalives: Vec<ValueId>,
        nor: BlockRef,
        exc: BlockRef,
        result: ValueId,
    },
    IInvoke {
        ifunc: IFuncId,
        args: Vec<ValueId>,
        keepalives: Vec<ValueId>,
        nor: BlockRef,
        exc: BlockRef,
        result: ValueId,
    },
    WatchPoint {
        wpid: u64,
        ty: TypeId,
        disabled: BlockRef,
        nor: BlockRef,
        exc: BlockRef,
        keepalives: Vec<ValueId>,
        result: ValueId,
    },
    Ret {
        ty: TypeId,
        value: ValueId,
    },
    RetVoid,
    Throw {
        exception: ValueId,
    },
    Phi {
        ty: TypeId,
        incoming: Vec<(BlockRef, ValueId)>,
        result: ValueId,
    },
}

impl Inst {
    pub fn is_phi(&self) -> bool {
        matches!(self, Inst::Phi { .. })
    }

    /// The value this instruction defines, if any.
    pub fn result(&self) -> Option<ValueId> {
        match self {
            Inst::New { result, .. }
            | Inst::NewHybrid { result, .. }
            | Inst::Alloca { result, .. }
            | Inst::AllocaHybrid { result, .. }
            | Inst::BinOp { result, .. }
            | Inst::Cmp { result, .. }
            | Inst::Conversion { result, .. }
            | Inst::Select { result, .. }
            | Inst::ExtractValue { result, .. }
            | Inst::GetIRef { result, .. }
            | Inst::GetFieldIRef { result, .. }
            | Inst::GetElemIRef { result, .. }
            | Inst::ShiftIRef { result, .. }
            | Inst::GetFixedPartIRef { result, .. }
            | Inst::GetVarPartIRef { result, .. }
            | Inst::Load { result, .. }
            | Inst::CmpXchg { result, .. }
            | Inst::AtomicRmw { result, .. }
            | Inst::Call { result, .. }
            | Inst::CCall { result, .. }
            | Inst::ICall { result, .. }
            | Inst::NewStack { result, .. }
            | Inst::Invoke { result, .. }
            | Inst::IInvoke { result, .. }
            | Inst::WatchPoint { result, .. }
            | Inst::Phi { result, .. } => Some(*result),
            Inst::Store { .. }
            | Inst::Fence { .. }
            | Inst::TailCall { .. }
            | Inst::Branch { .. }
            | Inst::Branch2 { .. }
            | Inst::Switch { .. }
            | Inst::Ret { .. }
            | Inst::RetVoid
            | Inst::Throw { .. } => None,
        }
    }

    /// Applies `f` to every value operand.
    ///
    /// Successor labels and switch case labels are not operands and are
    /// untouched; φ incoming values are routed by control-edge
    /// provenance rather than remapped, so they are untouched as well.
    pub fn remap_operands(&mut self, f: &mut dyn FnMut(ValueId) -> ValueId) {
        match self {
            Inst::New { .. }
            | Inst::Alloca { .. }
            | Inst::Fence { .. }
            | Inst::Branch { .. }
            | Inst::RetVoid
            | Inst::Phi { .. } => {}
            Inst::NewHybrid { len, .. } | Inst::AllocaHybrid { len, .. } => *len = f(*len),
            Inst::BinOp { lhs, rhs, .. } | Inst::Cmp { lhs, rhs, .. } => {
                *lhs = f(*lhs);
                *rhs = f(*rhs);
            }
            Inst::Conversion { operand, .. }
            | Inst::ExtractValue { operand, .. }
            | Inst::GetIRef { operand, .. }
            | Inst::GetFieldIRef { operand, .. }
            | Inst::GetFixedPartIRef { operand, .. }
            | Inst::GetVarPartIRef { operand, .. } => *operand = f(*operand),
            Inst::Select {
                cond,
                if_true,
                if_false,
                ..
            } => {
                *cond = f(*cond);
                *if_true = f(*if_true);
                *if_false = f(*if_false);
            }
            Inst::GetElemIRef { index, operand, .. } => {
                *index = f(*index);
                *operand = f(*operand);
            }
            Inst::ShiftIRef {
                offset, operand, ..
            } => {
                *offset = f(*offset);
                *operand = f(*operand);
            }
            Inst::Load { location, .. } => *location = f(*location),
            Inst::Store {
                location, value, ..
            } => {
                *location = f(*location);
                *value = f(*value);
            }
            Inst::CmpXchg {
                location,
                expected,
                desired,
                ..
            } => {
                *location = f(*location);
                *expected = f(*expected);
                *desired = f(*desired);
            }
            Inst::AtomicRmw {
                location, operand, ..
            } => {
                *location = f(*location);
                *operand = f(*operand);
            }
            Inst::Call {
                callee,
                args,
                keepalives,
                ..
            }
            | Inst::Invoke {
                callee,
                args,
                keepalives,
                ..
            } => {
                *callee = f(*callee);
                remap_list(args, f);
                remap_list(keepalives, f);
            }
            Inst::CCall { callee, args, .. }
            | Inst::TailCall { callee, args, .. }
            | Inst::NewStack { callee, args, .. } => {
                *callee = f(*callee);
                remap_list(args, f);
            }
            Inst::ICall {
                args, keepalives, ..
            }
            | Inst::IInvoke {
                args, keepalives, ..
            } => {
                remap_list(args, f);
                remap_list(keepalives, f);
            }
            Inst::WatchPoint { keepalives, .. } => remap_list(keepalives, f),
            Inst::Branch2 { cond, .. } => *cond = f(*cond),
            Inst::Switch { operand, .. } => *operand = f(*operand),
            Inst::Ret { value, .. } => *value = f(*value),
            Inst::Throw { exception } => *exception = f(*exception),
        }
    }

    /// Applies `f` to every successor label this instruction carries.
    pub fn successors_mut(&mut self, f: &mut dyn FnMut(&mut BlockRef)) {
        match self {
            Inst::Branch { dest } => f(dest),
            Inst::Branch2 {
                if_true, if_false, ..
            } => {
                f(if_true);
                f(if_false);
            }
            Inst::Switch { default, cases, .. } => {
                for (_, dest) in cases.iter_mut() {
                    f(dest);
                }
                f(default);
            }
            Inst::Invoke { nor, exc, .. } | Inst::IInvoke { nor, exc, .. } => {
                f(nor);
                f(exc);
            }
            Inst::WatchPoint {
                disabled, nor, exc, ..
            } => {
                f(nor);
                f(exc);
                f(disabled);
            }
            _ => {}
        }
    }

    /// The successor labels this instruction carries, in carrier order.
    pub fn successors(&self) -> Vec<&BlockRef> {
        let mut refs = Vec::new();
        match self {
            Inst::Branch { dest } => refs.push(dest),
            Inst::Branch2 {
                if_true, if_false, ..
            } => {
                refs.push(if_true);
                refs.push(if_false);
            }
            Inst::Switch { default, cases, .. } => {
                for (_, dest) in cases {
                    refs.push(dest);
                }
                refs.push(default);
            }
            Inst::Invoke { nor, exc, .. } | Inst::IInvoke { nor, exc, .. } => {
                refs.push(nor);
                refs.push(exc);
            }
            Inst::WatchPoint {
                disabled, nor, exc, ..
            } => {
                refs.push(nor);
                refs.push(exc);
                refs.push(disabled);
            }
            _ => {}
        }
        refs
    }
}

fn remap_list(values: &mut [ValueId], f: &mut dyn FnMut(ValueId) -> ValueId) {
    for value in values {
        *value = f(*value);
    }
}

fn fmt_list(f: &mut fmt::Formatter<'_>, values: &[ValueId]) -> fmt::Result {
    write!(f, "(")?;
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        write!(f, "{value}")?;
    }
    write!(f, ")")
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inst::New { ty, result } => write!(f, "{result} = NEW t{}", ty.0),
            Inst::NewHybrid { ty, len, result } => {
                write!(f, "{result} = NEWHYBRID t{} {len}", ty.0)
            }
            Inst::Alloca { ty, result } => write!(f, "{result} = ALLOCA t{}", ty.0),
            Inst::AllocaHybrid { ty, len, result } => {
                write!(f, "{result} = ALLOCAHYBRID t{} {len}", ty.0)
            }
            Inst::BinOp {
                op,
                lhs,
                rhs,
                result,
                ..
            } => write!(f, "{result} = {} {lhs} {rhs}", fmt_upper(op)),
            Inst::Cmp {
                op,
                lhs,
                rhs,
                result,
                ..
            } => write!(f, "{result} = {} {lhs} {rhs}", fmt_upper(op)),
            Inst::Conversion {
                op,
                operand,
                result,
                ..
            } => write!(f, "{result} = {} {operand}", fmt_upper(op)),
            Inst::Select {
                cond,
                if_true,
                if_false,
                result,
                ..
            } => write!(f, "{result} = SELECT {cond} {if_true} {if_false}"),
            Inst::ExtractValue {
                index,
                operand,
                result,
                ..
            } => write!(f, "{result} = EXTRACTVALUE {index} {operand}"),
            Inst::GetIRef {
                operand, result, ..
            } => write!(f, "{result} = GETIREF {operand}"),
            Inst::GetFieldIRef {
                index,
                operand,
                result,
                ..
            } => write!(f, "{result} = GETFIELDIREF {index} {operand}"),
            Inst::GetElemIRef {
                index,
                operand,
                result,
                ..
            } => write!(f, "{result} = GETELEMIREF {index} {operand}"),
            Inst::ShiftIRef {
                offset,
                operand,
                result,
                ..
            } => write!(f, "{result} = SHIFTIREF {offset} {operand}"),
            Inst::GetFixedPartIRef {
                operand, result, ..
            } => write!(f, "{result} = GETFIXEDPARTIREF {operand}"),
            Inst::GetVarPartIRef {
                operand, result, ..
            } => write!(f, "{result} = GETVARPARTIREF {operand}"),
            Inst::Load {
                location, result, ..
            } => write!(f, "{result} = LOAD {location}"),
            Inst::Store {
                location, value, ..
            } => write!(f, "STORE {location} {value}"),
            Inst::CmpXchg {
                location,
                expected,
                desired,
                result,
                ..
            } => write!(f, "{result} = CMPXCHG {location} {expected} {desired}"),
            Inst::AtomicRmw {
                op,
                location,
                operand,
                result,
                ..
            } => write!(f, "{result} = ATOMICRMW {} {location} {operand}", fmt_upper(op)),
            Inst::Fence { .. } => write!(f, "FENCE"),
            Inst::Call {
                callee,
                args,
                result,
                ..
            } => {
                write!(f, "{result} = CALL {callee} ")?;
                fmt_list(f, args)
            }
            Inst::CCall {
                callee,
                args,
                result,
                ..
            } => {
                write!(f, "{result} = CCALL {callee} ")?;
                fmt_list(f, args)
            }
            Inst::ICall {
                ifunc,
                args,
                result,
                ..
            } => {
                write!(f, "{result} = ICALL @{} ", ifunc.0)?;
                fmt_list(f, args)
            }
            Inst::TailCall { callee, args, .. } => {
                write!(f, "TAILCALL {callee} ")?;
                fmt_list(f, args)
            }
            Inst::NewStack {
                callee,
                args,
                result,
                ..
            } => {
                write!(f, "{result} = NEWSTACK {callee} ")?;
                fmt_list(f, args)
            }
            Inst::Branch { dest } => write!(f, "BRANCH {dest}"),
            Inst::Branch2 {
                cond,
                if_true,
                if_false,
            } => write!(f, "BRANCH2 {cond} {if_true} {if_false}"),
            Inst::Switch {
                operand,
                default,
                cases,
                ..
            } => {
                write!(f, "SWITCH {operand} {default}")?;
                for (value, dest) in cases {
                    write!(f, " [{value}: {dest}]")?;
                }
                Ok(())
            }
            Inst::Invoke {
                callee,
                args,
                nor,
                exc,
                result,
                ..
            } => {
                write!(f, "{result} = INVOKE {callee} ")?;
                fmt_list(f, args)?;
                write!(f, " nor={nor} exc={exc}")
            }
            Inst::IInvoke {
                ifunc,
                args,
                nor,
                exc,
                result,
                ..
            } => {
                write!(f, "{result} = IINVOKE @{} ", ifunc.0)?;
                fmt_list(f, args)?;
                write!(f, " nor={nor} exc={exc}")
            }
            Inst::WatchPoint {
                wpid,
                disabled,
                nor,
                exc,
                result,
                ..
            } => write!(
                f,
                "{result} = WATCHPOINT {wpid} dis={disabled} nor={nor} exc={exc}"
            ),
            Inst::Ret { value, .. } => write!(f, "RET {value}"),
            Inst::RetVoid => write!(f, "RETVOID"),
            Inst::Throw { exception } => write!(f, "THROW {exception}"),
            Inst::Phi { incoming, result, .. } => {
                write!(f, "{result} = PHI")?;
                for (pred, value) in incoming {
                    write!(f, " [{pred}: {value}]")?;
                }
                Ok(())
            }
        }
    }
}

fn fmt_upper(op: &dyn fmt::Debug) -> String {
    format!("{op:?}").to_uppercase()
}
