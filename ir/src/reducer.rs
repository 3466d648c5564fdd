//! PHI elimination: lowers an SSA CFG into a φ-free "forked-block"
//! form.
//!
//! Every block with φ-instructions is split into one fork per incoming
//! edge that appears in a φ value-map. A fork clones the block's non-φ
//! instructions with each φ-defined operand substituted by the value
//! the edge's predecessor supplies, and every predecessor's
//! control-transfer instruction is redirected to the fork for its edge.
//! The output is deliberately not SSA: the same value id may be
//! assigned in several forks.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::debug;

use crate::cfg::{BasicBlock, BlockRef, Cfg, Transition};
use crate::inst::Inst;
use crate::value::ValueId;
use crate::ReduceError;

/// Pairs of (φ-defined value, value supplied by the edge's predecessor).
type Transfers = SmallVec<[(ValueId, ValueId); 4]>;

/// Rewrites `original` into an equivalent CFG without φ-instructions.
///
/// Pure function: the input is untouched, distinct inputs may be
/// reduced from different threads.
pub fn reduce(original: &Cfg) -> Result<Cfg, ReduceError> {
    validate(original)?;
    for inst in &original.entry().insts {
        if inst.is_phi() {
            return Err(ReduceError::IllegalEntryPhi {
                func: original.name.clone(),
            });
        }
    }
    debug!(func = %original.name, "eliminating phi instructions");

    let mut result = Cfg::new(original.name.clone(), original.func);
    result.params = original.params.clone();
    result.values = original.values.clone();

    // Ids are reassigned from a monotone counter seeded with the entry
    // block's id; copies and forks alike draw from it.
    let mut next_id = original.entry().id;
    let entry_ref = original.entry().block_ref();

    // (new block, origin block in the input) pairs, the fork for each
    // φ-carrying edge, and the renumbered identity of each copy.
    let mut new_blocks: Vec<(BasicBlock, BlockRef)> = Vec::new();
    let mut jump_map: FxHashMap<Transition, BlockRef> = FxHashMap::default();
    let mut copy_map: FxHashMap<BlockRef, BlockRef> = FxHashMap::default();

    for block in original.blocks() {
        let phis = extract_phis(original, block);
        if phis.is_empty() {
            // φ-free blocks are copied (dropping any φ that had no
            // incoming edges, which is a no-op instruction).
            let copy = BasicBlock {
                id: next_id,
                name: block.name.clone(),
                insts: block
                    .insts
                    .iter()
                    .filter(|inst| !inst.is_phi())
                    .cloned()
                    .collect(),
            };
            next_id += 1;
            copy_map.insert(block.block_ref(), copy.block_ref());
            new_blocks.push((copy, block.block_ref()));
        } else {
            for (i, (transition, transfers)) in phis.iter().enumerate() {
                let fork = create_fork(block, next_id, i, transfers);
                next_id += 1;
                jump_map.insert(transition.clone(), fork.block_ref());
                new_blocks.push((fork, block.block_ref()));
            }
        }
    }

    // Redirect every successor reference: through its edge's fork when
    // one exists, otherwise to the target's renumbered copy. Then find
    // the entry block's copy.
    let mut entry_index = None;
    for (idx, (mut block, origin)) in new_blocks.into_iter().enumerate() {
        for inst in &mut block.insts {
            inst.successors_mut(&mut |target| {
                let edge = Transition::new(origin.clone(), target.clone());
                if let Some(fork) = jump_map.get(&edge) {
                    *target = fork.clone();
                } else if let Some(copy) = copy_map.get(target) {
                    *target = copy.clone();
                }
            });
        }
        if origin == entry_ref {
            entry_index = Some(idx);
        }
        result.add_block(block);
    }

    match entry_index {
        Some(idx) => result.set_entry(idx),
        // Unreachable: the entry is φ-free, so it has exactly one copy.
        None => {
            return Err(ReduceError::InvalidIr {
                func: original.name.clone(),
                reason: "entry block was not carried into the output",
            })
        }
    }
    Ok(result)
}

fn validate(cfg: &Cfg) -> Result<(), ReduceError> {
    if cfg.blocks().is_empty() {
        return Err(ReduceError::InvalidIr {
            func: cfg.name.clone(),
            reason: "function has no blocks",
        });
    }
    let mut seen = FxHashMap::default();
    for block in cfg.blocks() {
        if block.name.is_empty() {
            return Err(ReduceError::InvalidIr {
                func: cfg.name.clone(),
                reason: "block without a name cannot key a transition",
            });
        }
        if seen.insert((block.id, block.name.clone()), ()).is_some() {
            return Err(ReduceError::InvalidIr {
                func: cfg.name.clone(),
                reason: "duplicate block identity",
            });
        }
    }
    Ok(())
}

/// Groups `block`'s φ value-maps by incoming edge, in first-appearance
/// order so fork indices are deterministic. Entries naming a
/// predecessor that does not exist in the CFG are dropped.
fn extract_phis(cfg: &Cfg, block: &BasicBlock) -> Vec<(Transition, Transfers)> {
    let mut phis: Vec<(Transition, Transfers)> = Vec::new();
    for inst in &block.insts {
        let Inst::Phi {
            incoming, result, ..
        } = inst
        else {
            continue;
        };
        for (pred, value) in incoming {
            if cfg.block_by_ref(pred).is_none() {
                continue;
            }
            let transition = Transition::new(pred.clone(), block.block_ref());
            match phis.iter_mut().find(|(t, _)| *t == transition) {
                Some((_, transfers)) => transfers.push((*result, *value)),
                None => {
                    let mut transfers = Transfers::new();
                    transfers.push((*result, *value));
                    phis.push((transition, transfers));
                }
            }
        }
    }
    phis
}

/// Clones `block` for one incoming edge: φ-instructions are dropped and
/// every operand defined by one of them is substituted with the value
/// the edge supplies. Successor labels are left verbatim; the caller
/// remaps them once all forks exist.
fn create_fork(block: &BasicBlock, id: u32, index: usize, transfers: &Transfers) -> BasicBlock {
    let mut insts = Vec::with_capacity(block.insts.len());
    for inst in &block.insts {
        if inst.is_phi() {
            continue;
        }
        let mut clone = inst.clone();
        clone.remap_operands(&mut |value| {
            transfers
                .iter()
                .find(|(phi, _)| *phi == value)
                .map(|&(_, source)| source)
                .unwrap_or(value)
        });
        insts.push(clone);
    }
    BasicBlock {
        id,
        name: format!("{}__phi__{}", block.name, index),
        insts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::CfgBuilder;
    use crate::inst::{BinOptr, Inst};
    use crate::value::{FuncId, SigId, TypeId};

    const I64: TypeId = TypeId(0);

    fn assert_phi_free(cfg: &Cfg) {
        for block in cfg.blocks() {
            assert!(
                !block.has_phi(),
                "block %{} still contains a phi",
                block.name
            );
        }
    }

    /// entry -> a | b; a -> m; b -> m; m: x = phi [a: 1, b: 2]; ret x.
    fn diamond() -> Cfg {
        let mut b = CfgBuilder::new("@diamond", FuncId(0));
        let cond = b.param("cond");
        let one = b.const_int(1);
        let two = b.const_int(2);
        let x = b.value("x");

        let entry = b.block("entry");
        let left = b.block("a");
        let right = b.block("b");
        let merge = b.block("m");

        b.push(
            &entry,
            Inst::Branch2 {
                cond,
                if_true: left.clone(),
                if_false: right.clone(),
            },
        );
        b.push(&left, Inst::Branch { dest: merge.clone() });
        b.push(&right, Inst::Branch { dest: merge.clone() });
        b.push(
            &merge,
            Inst::Phi {
                ty: I64,
                incoming: vec![(left.clone(), one), (right.clone(), two)],
                result: x,
            },
        );
        b.push(&merge, Inst::Ret { ty: I64, value: x });
        b.build()
    }

    #[test]
    fn diamond_splits_the_merge_block() {
        let cfg = diamond();
        let one = ValueId(1);
        let two = ValueId(2);

        let reduced = reduce(&cfg).expect("diamond reduces");
        assert_phi_free(&reduced);

        let names: Vec<&str> = reduced
            .blocks()
            .iter()
            .map(|b| b.name.as_str())
            .collect();
        assert_eq!(names, ["entry", "a", "b", "m__phi__0", "m__phi__1"]);

        // Fork ids continue the monotone numbering after the copies.
        let ids: Vec<u32> = reduced.blocks().iter().map(|b| b.id).collect();
        assert_eq!(ids, [0, 1, 2, 3, 4]);
        assert_eq!(reduced.entry().name, "entry");

        // a branches to m__phi__0, b to m__phi__1.
        let dest_of = |name: &str| -> String {
            match &reduced.block_by_name(name).expect("block").insts[0] {
                Inst::Branch { dest } => dest.name.clone(),
                other => panic!("expected branch, got {other}"),
            }
        };
        assert_eq!(dest_of("a"), "m__phi__0");
        assert_eq!(dest_of("b"), "m__phi__1");

        // Each fork returns the value its predecessor supplied.
        let ret_of = |name: &str| -> ValueId {
            match reduced.block_by_name(name).expect("block").insts[..] {
                [Inst::Ret { value, .. }] => value,
                ref other => panic!("expected a lone ret, got {other:?}"),
            }
        };
        assert_eq!(ret_of("m__phi__0"), one);
        assert_eq!(ret_of("m__phi__1"), two);

        // The entry's own edges lead to φ-free blocks and are intact.
        match &reduced.entry().insts[0] {
            Inst::Branch2 {
                if_true, if_false, ..
            } => {
                assert_eq!(if_true.name, "a");
                assert_eq!(if_false.name, "b");
            }
            other => panic!("expected branch2, got {other}"),
        }
    }

    #[test]
    fn entry_phi_is_rejected() {
        let mut b = CfgBuilder::new("@bad", FuncId(1));
        let one = b.const_int(1);
        let x = b.value("x");
        let entry = b.block("entry");
        b.push(
            &entry,
            Inst::Phi {
                ty: I64,
                incoming: vec![(entry.clone(), one)],
                result: x,
            },
        );
        b.push(&entry, Inst::RetVoid);

        let err = reduce(&b.build()).expect_err("entry phi must be rejected");
        assert_eq!(
            err,
            ReduceError::IllegalEntryPhi {
                func: "@bad".into()
            }
        );
    }

    #[test]
    fn phi_free_input_passes_through() {
        let mut b = CfgBuilder::new("@loop", FuncId(2));
        let cond = b.param("cond");
        let entry = b.block("entry");
        let body = b.block("body");
        let exit = b.block("exit");
        b.push(&entry, Inst::Branch { dest: body.clone() });
        b.push(
            &body,
            Inst::Branch2 {
                cond,
                if_true: body.clone(),
                if_false: exit.clone(),
            },
        );
        b.push(&exit, Inst::RetVoid);
        let cfg = b.build();

        let reduced = reduce(&cfg).expect("phi-free input reduces");
        assert_eq!(reduced.blocks(), cfg.blocks(), "structure is preserved");
        assert_eq!(reduced.entry().name, "entry");

        // Reducing again changes nothing.
        let again = reduce(&reduced).expect("idempotent");
        assert_eq!(again.blocks(), reduced.blocks());
    }

    #[test]
    fn operands_of_cloned_instructions_are_substituted() {
        // m uses its φ-defined values in a non-terminal instruction.
        let mut b = CfgBuilder::new("@sum", FuncId(3));
        let p = b.param("p");
        let q = b.param("q");
        let one = b.const_int(1);
        let two = b.const_int(2);
        let x = b.value("x");
        let y = b.value("y");
        let z = b.value("z");

        let entry = b.block("entry");
        let left = b.block("a");
        let right = b.block("b");
        let merge = b.block("m");
        b.push(
            &entry,
            Inst::Branch2 {
                cond: p,
                if_true: left.clone(),
                if_false: right.clone(),
            },
        );
        b.push(&left, Inst::Branch { dest: merge.clone() });
        b.push(&right, Inst::Branch { dest: merge.clone() });
        b.push(
            &merge,
            Inst::Phi {
                ty: I64,
                incoming: vec![(left.clone(), one), (right.clone(), two)],
                result: x,
            },
        );
        b.push(
            &merge,
            Inst::Phi {
                ty: I64,
                incoming: vec![(left.clone(), p), (right.clone(), q)],
                result: y,
            },
        );
        b.push(
            &merge,
            Inst::BinOp {
                op: BinOptr::Add,
                ty: I64,
                lhs: x,
                rhs: y,
                result: z,
            },
        );
        b.push(&merge, Inst::Ret { ty: I64, value: z });

        let reduced = reduce(&b.build()).expect("reduces");
        assert_phi_free(&reduced);

        let fork_insts = |name: &str| &reduced.block_by_name(name).expect("fork").insts;
        // Fork for the a-edge computes 1 + p; for the b-edge, 2 + q.
        match fork_insts("m__phi__0")[..] {
            [Inst::BinOp { lhs, rhs, result, .. }, Inst::Ret { value, .. }] => {
                assert_eq!((lhs, rhs), (one, p));
                assert_eq!(value, result, "uses of non-phi results are untouched");
                assert_eq!(result, z, "both forks assign the same name");
            }
            ref other => panic!("unexpected fork body {other:?}"),
        }
        match fork_insts("m__phi__1")[..] {
            [Inst::BinOp { lhs, rhs, result, .. }, _] => {
                assert_eq!((lhs, rhs), (two, q));
                assert_eq!(result, z);
            }
            ref other => panic!("unexpected fork body {other:?}"),
        }
    }

    #[test]
    fn switch_and_invoke_edges_are_remapped_per_predecessor() {
        // p switches to m (φ-carrying) twice and to exit; the copy of p
        // must redirect exactly the m-edges to p's fork of m.
        let mut b = CfgBuilder::new("@dispatch", FuncId(4));
        let sel = b.param("sel");
        let fun = b.param("fun");
        let zero = b.const_int(0);
        let one = b.const_int(1);
        let x = b.value("x");
        let r = b.value("r");

        let entry = b.block("entry");
        let merge = b.block("m");
        let exit = b.block("exit");
        b.push(
            &entry,
            Inst::Switch {
                ty: I64,
                operand: sel,
                default: exit.clone(),
                cases: vec![(zero, merge.clone()), (one, merge.clone())],
            },
        );
        b.push(
            &merge,
            Inst::Phi {
                ty: I64,
                incoming: vec![(entry.clone(), one)],
                result: x,
            },
        );
        b.push(
            &merge,
            Inst::Invoke {
                sig: SigId(0),
                callee: fun,
                args: vec![x],
                keepalives: vec![],
                nor: exit.clone(),
                exc: exit.clone(),
                result: r,
            },
        );
        b.push(&exit, Inst::RetVoid);

        let reduced = reduce(&b.build()).expect("reduces");
        assert_phi_free(&reduced);

        match &reduced.entry().insts[0] {
            Inst::Switch { default, cases, .. } => {
                assert_eq!(default.name, "exit");
                assert_eq!(cases[0].1.name, "m__phi__0");
                assert_eq!(cases[1].1.name, "m__phi__0");
                assert_eq!(cases[0].0, zero, "case labels are untouched");
            }
            other => panic!("expected switch, got {other}"),
        }

        // The fork's invoke had its argument substituted and both of
        // its successor labels follow the exit copy.
        match &reduced.block_by_name("m__phi__0").expect("fork").insts[0] {
            Inst::Invoke { args, nor, exc, .. } => {
                assert_eq!(args[0], one);
                assert_eq!(nor.name, "exit");
                assert_eq!(exc.name, "exit");
            }
            other => panic!("expected invoke, got {other}"),
        }
    }

    #[test]
    fn unreachable_predecessors_are_dropped() {
        let mut b = CfgBuilder::new("@ghostly", FuncId(5));
        let one = b.const_int(1);
        let two = b.const_int(2);
        let x = b.value("x");
        let entry = b.block("entry");
        let merge = b.block("m");
        b.push(&entry, Inst::Branch { dest: merge.clone() });
        let ghost = BlockRef {
            id: 99,
            name: "ghost".into(),
        };
        b.push(
            &merge,
            Inst::Phi {
                ty: I64,
                incoming: vec![(entry.clone(), one), (ghost, two)],
                result: x,
            },
        );
        b.push(&merge, Inst::Ret { ty: I64, value: x });

        let reduced = reduce(&b.build()).expect("reduces");
        let names: Vec<&str> = reduced
            .blocks()
            .iter()
            .map(|b| b.name.as_str())
            .collect();
        assert_eq!(
            names,
            ["entry", "m__phi__0"],
            "no fork is created for the nonexistent predecessor"
        );
    }

    #[test]
    fn empty_phi_is_removed_as_a_no_op() {
        let mut b = CfgBuilder::new("@empty", FuncId(6));
        let x = b.value("x");
        let entry = b.block("entry");
        let tail = b.block("tail");
        b.push(&entry, Inst::Branch { dest: tail.clone() });
        b.push(
            &tail,
            Inst::Phi {
                ty: I64,
                incoming: vec![],
                result: x,
            },
        );
        b.push(&tail, Inst::RetVoid);

        let reduced = reduce(&b.build()).expect("reduces");
        let tail_out = reduced.block_by_name("tail").expect("tail is copied");
        assert_eq!(tail_out.insts, vec![Inst::RetVoid]);
    }

    #[test]
    fn empty_cfg_is_invalid() {
        let cfg = Cfg::new("@void", FuncId(7));
        let err = reduce(&cfg).expect_err("no blocks");
        assert_eq!(
            err,
            ReduceError::InvalidIr {
                func: "@void".into(),
                reason: "function has no blocks",
            }
        );
    }

    #[test]
    fn params_and_values_survive_reduction() {
        let cfg = diamond();
        let reduced = reduce(&cfg).expect("reduces");
        assert_eq!(reduced.params, cfg.params);
        assert_eq!(reduced.values, cfg.values);
        assert_eq!(reduced.name, "@diamond");
        assert_eq!(reduced.func, cfg.func);
    }
}
