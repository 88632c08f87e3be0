// Basic blocks and edges, stored as dense arenas inside the Program and addressed by
// handle. A block owns its instruction list (first/last handles into the instruction
// arena) and at most two outgoing edges: taken (branch target) and fallthru
// (sequential/false target), plus the set of incoming edges used when redirecting
// control flow. Edge surgery goes through the Program so the incoming-set invariant
// (a block's prevs equals exactly the edges whose target it is) is maintained in one
// place.

//! Basic blocks and edges of the CFG.

use super::InsnId;

/// Handle of a block within its Program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub(crate) u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle of an edge within its Program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(pub(crate) u32);

impl EdgeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Directed link between exactly two blocks.
#[derive(Debug, Clone)]
pub struct Edge {
    pub from: BlockId,
    pub to: BlockId,
}

/// A straight-line run of instructions with at most two successors.
#[derive(Debug, Clone)]
pub struct Block {
    /// Ordinal within the program; establishes emission order.
    pub id: usize,
    /// First instruction, None for forwarder blocks.
    pub first: Option<InsnId>,
    /// Last instruction.
    pub last: Option<InsnId>,
    /// Branch-taken successor edge.
    pub taken: Option<EdgeId>,
    /// Sequential (or branch-not-taken) successor edge.
    pub fallthru: Option<EdgeId>,
    /// Incoming edges.
    pub prevs: Vec<EdgeId>,
}

impl Block {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            first: None,
            last: None,
            taken: None,
            fallthru: None,
            prevs: Vec::new(),
        }
    }

    /// A block with no instructions forwards control through its taken edge.
    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}
