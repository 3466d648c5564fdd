//! Function-level control-flow graphs: blocks, the labels that
//! reference them, and the transition key used to route control edges.

use core::fmt;

use rustc_hash::FxHashMap;

use crate::inst::Inst;
use crate::value::{FuncId, ValueId, ValueInfo, ValueKind, ValueTable};

/// The identity a successor label or φ predecessor key carries: block
/// id plus block name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockRef {
    pub id: u32,
    pub name: String,
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.name)
    }
}

/// A control-flow edge, used as a map key to route edges through forks.
///
/// Two transitions are equal exactly when both endpoint ids and both
/// endpoint names agree; the derived `Hash` agrees with that equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Transition {
    pub from: BlockRef,
    pub to: BlockRef,
}

impl Transition {
    pub fn new(from: BlockRef, to: BlockRef) -> Self {
        Self { from, to }
    }
}

/// A basic block owning its ordered instruction list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    pub id: u32,
    pub name: String,
    pub insts: Vec<Inst>,
}

impl BasicBlock {
    pub fn block_ref(&self) -> BlockRef {
        BlockRef {
            id: self.id,
            name: self.name.clone(),
        }
    }

    pub fn has_phi(&self) -> bool {
        self.insts.iter().any(Inst::is_phi)
    }
}

/// A function body: parameter list, value table, and blocks with a
/// distinguished entry, indexed by block id and name.
#[derive(Debug, Clone)]
pub struct Cfg {
    pub name: String,
    pub func: FuncId,
    pub params: Vec<ValueId>,
    pub values: ValueTable,
    blocks: Vec<BasicBlock>,
    by_id: FxHashMap<u32, usize>,
    by_name: FxHashMap<String, usize>,
    entry: usize,
}

impl Cfg {
    pub fn new(name: impl Into<String>, func: FuncId) -> Self {
        Self {
            name: name.into(),
            func,
            params: Vec::new(),
            values: ValueTable::new(),
            blocks: Vec::new(),
            by_id: FxHashMap::default(),
            by_name: FxHashMap::default(),
            entry: 0,
        }
    }

    /// Appends a block and indexes it by id and name. The first block
    /// added becomes the entry until [`Cfg::set_entry`] says otherwise.
    pub fn add_block(&mut self, block: BasicBlock) {
        let idx = self.blocks.len();
        self.by_id.insert(block.id, idx);
        self.by_name.insert(block.name.clone(), idx);
        self.blocks.push(block);
    }

    pub fn set_entry(&mut self, idx: usize) {
        assert!(idx < self.blocks.len(), "entry index out of bounds");
        self.entry = idx;
    }

    pub fn entry(&self) -> &BasicBlock {
        &self.blocks[self.entry]
    }

    pub fn entry_index(&self) -> usize {
        self.entry
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn block_by_id(&self, id: u32) -> Option<&BasicBlock> {
        self.by_id.get(&id).map(|&idx| &self.blocks[idx])
    }

    pub fn block_by_name(&self, name: &str) -> Option<&BasicBlock> {
        self.by_name.get(name).map(|&idx| &self.blocks[idx])
    }

    /// Looks a block up by full identity (id and name must both match).
    pub fn block_by_ref(&self, block: &BlockRef) -> Option<&BasicBlock> {
        self.block_by_id(block.id)
            .filter(|found| found.name == block.name)
    }
}

impl fmt::Display for Cfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, ".funcdef {} {{", self.name)?;
        for block in &self.blocks {
            writeln!(f, "  %{}:", block.name)?;
            for inst in &block.insts {
                writeln!(f, "    {inst}")?;
            }
        }
        write!(f, "}}")
    }
}

/// Incremental construction of a [`Cfg`]: declare blocks up front so
/// branches can reference them, then push instructions.
pub struct CfgBuilder {
    cfg: Cfg,
    next_block_id: u32,
}

impl CfgBuilder {
    pub fn new(name: impl Into<String>, func: FuncId) -> Self {
        Self {
            cfg: Cfg::new(name, func),
            next_block_id: 0,
        }
    }

    pub fn param(&mut self, name: &str) -> ValueId {
        let index = self.cfg.params.len() as u32;
        let id = self.cfg.values.add(ValueInfo {
            name: Some(name.into()),
            kind: ValueKind::Param { index },
        });
        self.cfg.params.push(id);
        id
    }

    pub fn const_int(&mut self, value: i64) -> ValueId {
        self.cfg.values.add(ValueInfo {
            name: None,
            kind: ValueKind::Const { value },
        })
    }

    /// A fresh instruction-result value.
    pub fn value(&mut self, name: &str) -> ValueId {
        self.cfg.values.add(ValueInfo {
            name: Some(name.into()),
            kind: ValueKind::InstResult,
        })
    }

    /// Declares an empty block and returns its label.
    pub fn block(&mut self, name: &str) -> BlockRef {
        let id = self.next_block_id;
        self.next_block_id += 1;
        self.cfg.add_block(BasicBlock {
            id,
            name: name.into(),
            insts: Vec::new(),
        });
        BlockRef {
            id,
            name: name.into(),
        }
    }

    /// Appends an instruction to a declared block.
    ///
    /// # Panics
    ///
    /// Panics if `block` was not declared by this builder.
    pub fn push(&mut self, block: &BlockRef, inst: Inst) {
        let idx = *self
            .cfg
            .by_id
            .get(&block.id)
            .expect("push to undeclared block");
        self.cfg.blocks[idx].insts.push(inst);
    }

    pub fn build(self) -> Cfg {
        self.cfg
    }
}
