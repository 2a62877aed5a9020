use crate::dfg::def::*;
use rustc_hash::FxHashSet;
use std::fmt;

#[derive(Debug)]
pub enum VerifyError {
    BadNode(NodeId),
    BadBlock(BlockId),
    BadEdgeTarget { node: NodeId, target: NodeId },
    DanglingEdge { node: NodeId, target: NodeId },
    NodePlacedTwice(NodeId),
    BadTerminator(BlockId),
    UnreachableNotEmpty(BlockId),
    FormViolation { node: NodeId, form: GraphForm },
    EmptyDispatch(NodeId),
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::BadNode(n) => write!(f, "Invalid NodeId: {}", n),
            VerifyError::BadBlock(b) => write!(f, "Invalid BlockId: {}", b),
            VerifyError::BadEdgeTarget { node, target } => {
                write!(f, "Node {} has edge to out-of-range node {}", node, target)
            }
            VerifyError::DanglingEdge { node, target } => {
                write!(f, "Node {} references unplaced node {}", node, target)
            }
            VerifyError::NodePlacedTwice(n) => write!(f, "Node {} placed in two positions", n),
            VerifyError::BadTerminator(b) => write!(f, "Invalid terminator in block {}", b),
            VerifyError::UnreachableNotEmpty(b) => {
                write!(f, "Unreachable block {} still has contents", b)
            }
            VerifyError::FormViolation { node, form } => {
                write!(f, "Node {} is not allowed in {:?} form", node, form)
            }
            VerifyError::EmptyDispatch(n) => {
                write!(f, "Dispatch node {} has no cases", n)
            }
        }
    }
}

pub fn verify_graph(graph: &Graph) -> Result<(), VerifyError> {
    check_blk(graph, graph.entry)?;

    // 1. Arena integrity.
    for (nid, node) in graph.nodes.iter().enumerate() {
        if node.id != nid {
            return Err(VerifyError::BadNode(nid));
        }
    }
    for (bid, blk) in graph.blocks.iter().enumerate() {
        if blk.id != bid {
            return Err(VerifyError::BadBlock(bid));
        }
    }

    // 2. Placement: a node lives in at most one position.
    let mut placed: FxHashSet<NodeId> = FxHashSet::default();
    for blk in &graph.blocks {
        for &id in &blk.nodes {
            if id >= graph.nodes.len() {
                return Err(VerifyError::BadNode(id));
            }
            if !placed.insert(id) {
                return Err(VerifyError::NodePlacedTwice(id));
            }
        }
    }

    // 3. Edges of placed nodes must point at placed nodes; form-specific
    // opcodes must match the graph's form.
    for blk in &graph.blocks {
        for &id in &blk.nodes {
            let node = &graph.nodes[id];
            let mut bad: Option<VerifyError> = None;
            node.op.for_each_edge(|e| {
                if bad.is_some() {
                    return;
                }
                if e.node >= graph.nodes.len() {
                    bad = Some(VerifyError::BadEdgeTarget {
                        node: id,
                        target: e.node,
                    });
                } else if !placed.contains(&e.node) {
                    bad = Some(VerifyError::DanglingEdge {
                        node: id,
                        target: e.node,
                    });
                }
            });
            if let Some(err) = bad {
                return Err(err);
            }

            match &node.op {
                NodeOp::GetLocal { .. } | NodeOp::SetLocal { .. } | NodeOp::PhantomLocal { .. } => {
                    if graph.form != GraphForm::Threaded {
                        return Err(VerifyError::FormViolation {
                            node: id,
                            form: graph.form,
                        });
                    }
                }
                NodeOp::LoopCarry { .. } => {
                    if graph.form != GraphForm::Flat {
                        return Err(VerifyError::FormViolation {
                            node: id,
                            form: graph.form,
                        });
                    }
                }
                NodeOp::MultiGetByOffset { variants, .. }
                | NodeOp::MultiPutByOffset { variants, .. } => {
                    if variants.is_empty() {
                        return Err(VerifyError::EmptyDispatch(id));
                    }
                }
                _ => {}
            }
        }
    }

    // 4. Terminators reference valid blocks and placed nodes.
    for (bid, blk) in graph.blocks.iter().enumerate() {
        match &blk.term {
            Terminator::Goto(t) => check_blk(graph, *t)?,
            Terminator::Branch {
                cond,
                taken,
                not_taken,
            } => {
                if !placed.contains(&cond.node) {
                    return Err(VerifyError::BadTerminator(bid));
                }
                check_blk(graph, *taken)?;
                check_blk(graph, *not_taken)?;
            }
            Terminator::Return(Some(v)) => {
                if !placed.contains(&v.node) {
                    return Err(VerifyError::BadTerminator(bid));
                }
            }
            Terminator::Return(None) | Terminator::Unreachable => {}
        }
    }

    // 5. Blocks cut off from the entry must have been emptied.
    let reachable = graph.reachable_blocks();
    for (bid, blk) in graph.blocks.iter().enumerate() {
        if reachable[bid] {
            continue;
        }
        if !blk.nodes.is_empty() || !matches!(blk.term, Terminator::Unreachable) {
            return Err(VerifyError::UnreachableNotEmpty(bid));
        }
    }

    Ok(())
}

fn check_blk(graph: &Graph, bid: BlockId) -> Result<(), VerifyError> {
    if bid >= graph.blocks.len() {
        Err(VerifyError::BadBlock(bid))
    } else {
        Ok(())
    }
}
