//! RTL basic blocks and the graph the slicer walks.

use std::fmt;

use indexmap::IndexMap;

use crate::Stmt;

/// Unique identifier for a basic block within a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// A basic block of RTL statements.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RtlBlock {
    pub id: BlockId,
    /// Address of the first instruction.
    pub address: u64,
    /// Statements in program order.
    pub stmts: Vec<Stmt>,
}

impl RtlBlock {
    pub fn new(id: BlockId, address: u64) -> Self {
        Self {
            id,
            address,
            stmts: Vec::new(),
        }
    }

    pub fn push(&mut self, stmt: Stmt) {
        self.stmts.push(stmt);
    }

    pub fn len(&self) -> usize {
        self.stmts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }
}

/// A control flow graph over RTL blocks.
///
/// Backed by insertion-ordered maps so predecessor enumeration is
/// deterministic, which keeps slices reproducible run to run.
#[derive(Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RtlGraph {
    blocks: IndexMap<BlockId, RtlBlock>,
    successors: IndexMap<BlockId, Vec<BlockId>>,
    predecessors: IndexMap<BlockId, Vec<BlockId>>,
}

impl RtlGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a block to the graph.
    pub fn add_block(&mut self, block: RtlBlock) {
        let id = block.id;
        self.blocks.insert(id, block);
        self.successors.entry(id).or_default();
        self.predecessors.entry(id).or_default();
    }

    /// Adds a control flow edge.
    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        self.successors.entry(from).or_default().push(to);
        self.predecessors.entry(to).or_default().push(from);
    }

    pub fn block(&self, id: BlockId) -> Option<&RtlBlock> {
        self.blocks.get(&id)
    }

    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut RtlBlock> {
        self.blocks.get_mut(&id)
    }

    pub fn successors(&self, id: BlockId) -> &[BlockId] {
        self.successors.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn predecessors(&self, id: BlockId) -> &[BlockId] {
        self.predecessors
            .get(&id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &RtlBlock> {
        self.blocks.values()
    }
}
