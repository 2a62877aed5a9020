use crate::dfg::def::{Block, Graph, NodeId, NodeOp};

/// Buffers nodes to be spliced into a block, so the per-node walk never
/// invalidates its own indices. All inserts are "before the node currently at
/// this block-local index"; an index past the end appends. The buffer is
/// replayed once per block by [`InsertionSet::commit`].
#[derive(Debug, Default)]
pub struct InsertionSet {
    pending: Vec<(usize, NodeId)>,
}

impl InsertionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn insert(&mut self, index: usize, node: NodeId) {
        self.pending.push((index, node));
    }

    /// Allocates `op` in the graph's arena and schedules it before `index`.
    pub fn insert_op(&mut self, graph: &mut Graph, index: usize, op: NodeOp) -> NodeId {
        let id = graph.add_node(op);
        self.insert(index, id);
        id
    }

    /// Splices all buffered nodes into `block` and drains the buffer.
    pub fn commit(&mut self, block: &mut Block) {
        if self.pending.is_empty() {
            return;
        }
        // Stable sort: multiple inserts at one index keep recording order.
        self.pending.sort_by_key(|(index, _)| *index);

        let old = std::mem::take(&mut block.nodes);
        let mut out = Vec::with_capacity(old.len() + self.pending.len());
        let mut p = 0;
        for (i, id) in old.into_iter().enumerate() {
            while p < self.pending.len() && self.pending[p].0 <= i {
                out.push(self.pending[p].1);
                p += 1;
            }
            out.push(id);
        }
        for &(_, id) in &self.pending[p..] {
            out.push(id);
        }
        block.nodes = out;
        self.pending.clear();
    }
}
