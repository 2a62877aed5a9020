use crate::dfg::abstract_value::{AbstractValue, SpecType, StructureSet};
use crate::dfg::def::*;
use crate::dfg::insertion::InsertionSet;
use crate::dfg::interpreter::InterpreterState;
use crate::dfg::status::{
    AccessStatus, AccessVariant, Assumption, BuiltinShape, StatusProvider, StructureRegistry,
    TierPolicy,
};
use log::trace;

/// What one run of the phase did to the graph, plus everything the caller
/// must act on: assumptions to install watchpoints for, and node slots that
/// were unlinked from their blocks.
#[derive(Debug, Default)]
pub struct FoldOutcome {
    pub changed: bool,
    pub assumptions: Vec<Assumption>,
    pub detached: Vec<NodeId>,
}

/// Runs constant folding and strength reduction over `graph`.
///
/// Walks blocks once in natural order, interpreting forward. Each node is
/// offered to a specialized rule first; unhandled nodes take the generic
/// step (interpret, then literal-replace if proven). Rules that consume the
/// pre-state interpret the node themselves and report it handled. All block
/// edits are buffered and committed after the block's walk.
pub fn optimize(
    graph: &mut Graph,
    registry: &dyn StructureRegistry,
    provider: &dyn StatusProvider,
    policy: TierPolicy,
) -> FoldOutcome {
    FoldingPhase {
        graph,
        registry,
        provider,
        policy,
        state: InterpreterState::new(),
        insertions: InsertionSet::new(),
        assumptions: Vec::new(),
        detached: Vec::new(),
        changed: false,
    }
    .run()
}

struct FoldingPhase<'a> {
    graph: &'a mut Graph,
    registry: &'a dyn StructureRegistry,
    provider: &'a dyn StatusProvider,
    policy: TierPolicy,
    state: InterpreterState,
    insertions: InsertionSet,
    assumptions: Vec<Assumption>,
    detached: Vec<NodeId>,
    changed: bool,
}

impl<'a> FoldingPhase<'a> {
    fn run(mut self) -> FoldOutcome {
        let order = self.graph.natural_order();
        let preds = self.graph.predecessors();

        for &bid in &order {
            self.state.begin_block(self.graph, bid, &preds[bid]);
            let len = self.graph.blocks[bid].nodes.len();
            for index in 0..len {
                let id = self.graph.blocks[bid].nodes[index];
                if !self.fold_node(index, id) {
                    self.state.execute(self.graph, id);
                    self.try_literal_replace(index, id);
                }
            }
            self.insertions.commit(&mut self.graph.blocks[bid]);
            self.state.end_block(bid);
        }

        if self.changed {
            if self.graph.form == GraphForm::Flat {
                self.repair_loop_carries();
            }
            self.truncate_invalid_suffixes(&order, &preds);
            self.remove_unreachable_blocks();
        }

        FoldOutcome {
            changed: self.changed,
            assumptions: self.assumptions,
            detached: self.detached,
        }
    }

    /// Specialized per-opcode rules. Returns true when the node was fully
    /// handled, including its interpretation.
    fn fold_node(&mut self, index: usize, id: NodeId) -> bool {
        if !self.state.is_valid() {
            // Dead program point; the cleanup walk deals with it.
            return false;
        }
        match self.graph.nodes[id].op.clone() {
            NodeOp::Check { value } => self.fold_check(id, value),
            NodeOp::CheckStructure { base, set } => self.fold_check_structure(id, base, set),
            NodeOp::Binary { op, lhs, rhs } => self.fold_binary(index, id, op, lhs, rhs),
            NodeOp::StrCat { lhs, rhs } => self.fold_str_cat(index, id, lhs, rhs),
            NodeOp::GetById { base, prop } => self.fold_get_by_id(index, id, base, prop),
            NodeOp::PutById { base, value, prop } => {
                self.fold_put_by_id(index, id, base, value, prop)
            }
            NodeOp::MultiGetByOffset { base, variants } => {
                self.fold_multi_get(index, id, base, variants)
            }
            NodeOp::MultiPutByOffset {
                base,
                value,
                variants,
            } => self.fold_multi_put(index, id, base, value, variants),
            NodeOp::CreateThis { callee } => self.fold_create_this(id, callee),
            _ => false,
        }
    }

    fn retag(&mut self, id: NodeId, op: NodeOp) {
        self.graph.nodes[id].op = op;
        self.changed = true;
    }

    /// A type check the pre-state already discharges is interpreted (so its
    /// narrowing survives) and then degraded to a liveness placeholder.
    fn fold_check(&mut self, id: NodeId, value: Edge) -> bool {
        let proven = !value.needs_check()
            || self
                .state
                .for_node(value.node)
                .spec
                .is_subset_of(value.kind.spec());
        if !proven {
            return false;
        }
        self.state.execute(self.graph, id);
        self.retag(
            id,
            NodeOp::Phantom {
                value: Some(Edge::proved(value.node, value.kind)),
            },
        );
        trace!("check on node {} discharged statically", value.node);
        true
    }

    fn fold_check_structure(&mut self, id: NodeId, base: Edge, set: StructureSet) -> bool {
        let pre = self.state.for_node(base.node);
        let proven = pre.structures.is_subset_of(&set) || self.builtin_shape_proves(&pre, &set);
        if !proven {
            return false;
        }
        self.state.execute(self.graph, id);
        self.retag(
            id,
            NodeOp::Phantom {
                value: Some(Edge::proved(base.node, base.kind)),
            },
        );
        trace!("structure check on node {} discharged statically", base.node);
        true
    }

    // Primitive cells share engine-wide shapes: a value proven to be, say, a
    // string passes any structure check whose set covers the string shape.
    fn builtin_shape_proves(&self, pre: &AbstractValue, set: &StructureSet) -> bool {
        let shape = if pre.spec.is_subset_of(SpecType::STRING) {
            BuiltinShape::String
        } else if pre.spec.is_subset_of(SpecType::SYMBOL) {
            BuiltinShape::Symbol
        } else if pre.spec.is_subset_of(SpecType::BIGINT) {
            BuiltinShape::BigInt
        } else {
            return false;
        };
        match self.registry.builtin_shape(shape) {
            Some(s) => set.contains(s),
            None => false,
        }
    }

    fn fold_binary(
        &mut self,
        index: usize,
        id: NodeId,
        op: BinOp,
        mut lhs: Edge,
        mut rhs: Edge,
    ) -> bool {
        let mut strengthened = false;

        // Both sides drop to int32 together; a mixed int/double operation
        // keeps its numeric kinds.
        let l_int = self
            .state
            .for_node(lhs.node)
            .spec
            .is_subset_of(SpecType::INT32);
        let r_int = self
            .state
            .for_node(rhs.node)
            .spec
            .is_subset_of(SpecType::INT32);
        if l_int && r_int {
            for e in [&mut lhs, &mut rhs] {
                if matches!(e.kind, UseKind::Number | UseKind::Untyped) {
                    e.kind = UseKind::Int32;
                    e.proof = ProofStatus::Proved;
                    strengthened = true;
                }
            }
        }
        // Discharge any edge whose kind the pre-state already satisfies.
        for e in [&mut lhs, &mut rhs] {
            if e.needs_check()
                && self
                    .state
                    .for_node(e.node)
                    .spec
                    .is_subset_of(e.kind.spec())
            {
                e.proof = ProofStatus::Proved;
                strengthened = true;
            }
        }
        if strengthened {
            self.graph.nodes[id].op = NodeOp::Binary { op, lhs, rhs };
            self.changed = true;
        }

        // Algebraic identities. Only under proven int32 inputs: the double
        // versions are wrong around -0.0 (e.g. -0.0 + 0 is +0.0).
        if lhs.kind != UseKind::Int32 || rhs.kind != UseKind::Int32 {
            return false;
        }
        let lc = self
            .state
            .for_node(lhs.node)
            .constant
            .and_then(|c| c.as_int32());
        let rc = self
            .state
            .for_node(rhs.node)
            .constant
            .and_then(|c| c.as_int32());

        enum Rewrite {
            Pass(Edge),
            Literal(i32),
        }
        let rewrite = match op {
            BinOp::Add => match (lc, rc) {
                (_, Some(0)) => Some(Rewrite::Pass(lhs)),
                (Some(0), _) => Some(Rewrite::Pass(rhs)),
                _ => None,
            },
            BinOp::Sub => match rc {
                Some(0) => Some(Rewrite::Pass(lhs)),
                _ => None,
            },
            BinOp::Mul => match (lc, rc) {
                (_, Some(1)) => Some(Rewrite::Pass(lhs)),
                (Some(1), _) => Some(Rewrite::Pass(rhs)),
                _ => None,
            },
            BinOp::BitAnd => match (lc, rc) {
                (_, Some(-1)) => Some(Rewrite::Pass(lhs)),
                (Some(-1), _) => Some(Rewrite::Pass(rhs)),
                (_, Some(0)) | (Some(0), _) => Some(Rewrite::Literal(0)),
                _ => None,
            },
            BinOp::BitOr => match (lc, rc) {
                (_, Some(0)) => Some(Rewrite::Pass(lhs)),
                (Some(0), _) => Some(Rewrite::Pass(rhs)),
                (_, Some(-1)) | (Some(-1), _) => Some(Rewrite::Literal(-1)),
                _ => None,
            },
            BinOp::BitXor => match (lc, rc) {
                (_, Some(0)) => Some(Rewrite::Pass(lhs)),
                (Some(0), _) => Some(Rewrite::Pass(rhs)),
                _ => None,
            },
            BinOp::Shl | BinOp::Shr => match rc {
                Some(0) => Some(Rewrite::Pass(lhs)),
                _ => None,
            },
            _ => None,
        };

        match rewrite {
            Some(Rewrite::Pass(keep)) => {
                self.reduce_to_pass_through(index, id, keep);
                true
            }
            Some(Rewrite::Literal(v)) => {
                self.state.execute(self.graph, id);
                self.replace_with_literal(index, id, Const::Int32(v));
                true
            }
            None => false,
        }
    }

    /// Interprets the node, then rewrites it to forward `keep` — or straight
    /// to a literal when the forwarded value is itself proven constant, so a
    /// second run has nothing left to do.
    fn reduce_to_pass_through(&mut self, index: usize, id: NodeId, keep: Edge) {
        self.state.execute(self.graph, id);
        if let Some(c) = self.state.for_node(id).constant {
            self.replace_with_literal(index, id, c);
        } else {
            self.retag(id, NodeOp::Identity { value: keep });
            trace!("node {id} reduced to a pass-through of node {}", keep.node);
        }
    }

    /// Concatenation with a known-empty string forwards the other rope.
    fn fold_str_cat(&mut self, index: usize, id: NodeId, lhs: Edge, rhs: Edge) -> bool {
        let is_empty_str = |v: &AbstractValue| match v.proven_constant() {
            Some(Const::Str(s)) => s.is_empty(),
            _ => false,
        };
        let l_empty = is_empty_str(&self.state.for_node(lhs.node));
        let r_empty = is_empty_str(&self.state.for_node(rhs.node));
        let keep = if r_empty {
            lhs
        } else if l_empty {
            rhs
        } else {
            return false;
        };
        // The surviving side must itself be a string for the no-op to hold.
        if keep.kind != UseKind::StringUse
            && !self
                .state
                .for_node(keep.node)
                .spec
                .is_subset_of(SpecType::STRING)
        {
            return false;
        }
        trace!("node {id} concatenation with empty string removed");
        self.reduce_to_pass_through(index, id, keep);
        true
    }

    fn fold_get_by_id(&mut self, index: usize, id: NodeId, base: Edge, prop: PropertyId) -> bool {
        if !self.policy.access_inlining {
            return false;
        }
        let base_val = self.state.for_node(base.node);
        let status = self.provider.query(&base_val, prop);
        let Some(variants) = status.variants() else {
            return false;
        };
        let Some(applicable) = self.applicable_variants(&base_val, variants) else {
            return false;
        };

        if applicable.len() == 1 {
            let v = applicable.into_iter().next().unwrap();
            self.record_access(index, base, &status, std::slice::from_ref(&v), prop);
            if !base_val.structures.is_subset_of(&v.structures) {
                self.insertions.insert_op(
                    self.graph,
                    index,
                    NodeOp::CheckStructure {
                        base,
                        set: v.structures.clone(),
                    },
                );
            }
            self.state.assert_structures(base.node, &v.structures);
            self.retag(
                id,
                NodeOp::GetByOffset {
                    base: Edge::proved(base.node, UseKind::Object),
                    offset: v.offset,
                },
            );
            self.state.execute(self.graph, id);
            trace!("get node {id} rewritten to a direct offset load");
            return true;
        }

        if self.policy.supports_multi_dispatch {
            self.record_access(index, base, &status, &applicable, prop);
            self.retag(
                id,
                NodeOp::MultiGetByOffset {
                    base: Edge::proved(base.node, UseKind::Object),
                    variants: applicable,
                },
            );
            self.state.execute(self.graph, id);
            trace!("get node {id} rewritten to a closed dispatch table");
            return true;
        }

        false
    }

    fn fold_put_by_id(
        &mut self,
        index: usize,
        id: NodeId,
        base: Edge,
        value: Edge,
        prop: PropertyId,
    ) -> bool {
        if !self.policy.access_inlining {
            return false;
        }
        let base_val = self.state.for_node(base.node);
        let status = self.provider.query(&base_val, prop);
        let Some(variants) = status.variants() else {
            return false;
        };
        let Some(applicable) = self.applicable_variants(&base_val, variants) else {
            return false;
        };

        if applicable.len() == 1 {
            let v = applicable.into_iter().next().unwrap();
            self.record_access(index, base, &status, std::slice::from_ref(&v), prop);
            if !base_val.structures.is_subset_of(&v.structures) {
                self.insertions.insert_op(
                    self.graph,
                    index,
                    NodeOp::CheckStructure {
                        base,
                        set: v.structures.clone(),
                    },
                );
            }
            self.state.assert_structures(base.node, &v.structures);
            self.retag(
                id,
                NodeOp::PutByOffset {
                    base: Edge::proved(base.node, UseKind::Object),
                    value,
                    offset: v.offset,
                },
            );
            self.state.execute(self.graph, id);
            trace!("put node {id} rewritten to a direct offset store");
            return true;
        }

        if self.policy.supports_multi_dispatch {
            self.record_access(index, base, &status, &applicable, prop);
            self.retag(
                id,
                NodeOp::MultiPutByOffset {
                    base: Edge::proved(base.node, UseKind::Object),
                    value,
                    variants: applicable,
                },
            );
            self.state.execute(self.graph, id);
            trace!("put node {id} rewritten to a closed dispatch table");
            return true;
        }

        false
    }

    /// Filters profiling variants against the proven structure knowledge of
    /// the base. Returns None when the access cannot be inlined at all:
    /// nothing survives, or a surviving variant rests on a prototype
    /// condition the registry cannot watch.
    fn applicable_variants(
        &self,
        base: &AbstractValue,
        variants: &[AccessVariant],
    ) -> Option<Vec<AccessVariant>> {
        if variants.is_empty() {
            return None;
        }
        let mut out = Vec::with_capacity(variants.len());
        for v in variants {
            let filtered = match base.structures.as_set() {
                Some(known) => {
                    let inter = v.structures.intersect(known);
                    if inter.is_empty() {
                        continue;
                    }
                    let mut nv = v.clone();
                    nv.structures = inter;
                    nv
                }
                None => v.clone(),
            };
            if !filtered
                .conditions
                .iter()
                .all(|&s| self.registry.is_watchable(s))
            {
                return None;
            }
            out.push(filtered);
        }
        if out.is_empty() { None } else { Some(out) }
    }

    /// Pins the consumed profiling on the graph and registers the prototype
    /// conditions the surviving variants depend on.
    fn record_access(
        &mut self,
        index: usize,
        base: Edge,
        status: &AccessStatus,
        used: &[AccessVariant],
        prop: PropertyId,
    ) {
        self.insertions.insert_op(
            self.graph,
            index,
            NodeOp::RecordStatus {
                base,
                status: Box::new(status.clone()),
            },
        );
        for v in used {
            for &s in &v.conditions {
                self.assumptions.push(Assumption::PropertyCondition {
                    structure: s,
                    property: prop,
                });
            }
        }
    }

    /// Prunes a dispatch table against proven structure knowledge.
    fn fold_multi_get(
        &mut self,
        index: usize,
        id: NodeId,
        base: Edge,
        variants: Vec<AccessVariant>,
    ) -> bool {
        let known = self.state.for_node(base.node);
        let Some(filtered) = prune_variants(&known, &variants) else {
            return false;
        };

        if filtered.is_empty() {
            // No case can match; interpreting the node proves the point
            // unreachable and cleanup truncates from here.
            self.state.execute(self.graph, id);
            return true;
        }
        if filtered.len() == 1 {
            let v = filtered.into_iter().next().unwrap();
            if !known.structures.is_subset_of(&v.structures) {
                self.insertions.insert_op(
                    self.graph,
                    index,
                    NodeOp::CheckStructure {
                        base,
                        set: v.structures.clone(),
                    },
                );
            }
            self.state.assert_structures(base.node, &v.structures);
            self.retag(
                id,
                NodeOp::GetByOffset {
                    base: Edge::proved(base.node, UseKind::Object),
                    offset: v.offset,
                },
            );
            self.state.execute(self.graph, id);
            trace!("dispatch node {id} collapsed to its single live case");
            return true;
        }
        if !self.policy.supports_multi_dispatch {
            // This tier cannot emit the pruned table; leave the node alone.
            return false;
        }
        if filtered.len() < variants.len() {
            self.retag(
                id,
                NodeOp::MultiGetByOffset {
                    base,
                    variants: filtered,
                },
            );
            self.state.execute(self.graph, id);
            return true;
        }
        false
    }

    fn fold_multi_put(
        &mut self,
        index: usize,
        id: NodeId,
        base: Edge,
        value: Edge,
        variants: Vec<AccessVariant>,
    ) -> bool {
        let known = self.state.for_node(base.node);
        let Some(filtered) = prune_variants(&known, &variants) else {
            return false;
        };

        if filtered.is_empty() {
            self.state.execute(self.graph, id);
            return true;
        }
        if filtered.len() == 1 {
            let v = filtered.into_iter().next().unwrap();
            if !known.structures.is_subset_of(&v.structures) {
                self.insertions.insert_op(
                    self.graph,
                    index,
                    NodeOp::CheckStructure {
                        base,
                        set: v.structures.clone(),
                    },
                );
            }
            self.state.assert_structures(base.node, &v.structures);
            self.retag(
                id,
                NodeOp::PutByOffset {
                    base: Edge::proved(base.node, UseKind::Object),
                    value,
                    offset: v.offset,
                },
            );
            self.state.execute(self.graph, id);
            trace!("dispatch node {id} collapsed to its single live case");
            return true;
        }
        if !self.policy.supports_multi_dispatch {
            return false;
        }
        if filtered.len() < variants.len() {
            self.retag(
                id,
                NodeOp::MultiPutByOffset {
                    base,
                    value,
                    variants: filtered,
                },
            );
            self.state.execute(self.graph, id);
            return true;
        }
        false
    }

    /// `new F()` with a proven callee whose allocation shape is watched
    /// becomes a direct allocation of that shape.
    fn fold_create_this(&mut self, id: NodeId, callee: Edge) -> bool {
        if self.policy.tainted {
            return false;
        }
        let Some(function) = self
            .state
            .for_node(callee.node)
            .constant
            .as_ref()
            .and_then(Const::as_function)
        else {
            return false;
        };
        let Some(structure) = self.registry.allocation_structure(function) else {
            return false;
        };
        self.assumptions.push(Assumption::AllocationShape {
            function,
            structure,
        });
        self.retag(id, NodeOp::NewObject { structure });
        self.state.execute(self.graph, id);
        trace!("construction node {id} folded to allocation of structure {structure}");
        true
    }

    /// Generic fallback: a pure node whose post-state is a single proven
    /// literal becomes that literal.
    fn try_literal_replace(&mut self, index: usize, id: NodeId) {
        if !self.state.is_valid() {
            return;
        }
        let op = &self.graph.nodes[id].op;
        if !op.has_result() || op.has_side_effects() || matches!(op, NodeOp::Const(_)) {
            return;
        }
        if self.policy.tainted && op.reads_heap() {
            return;
        }
        let Some(c) = self.state.for_node(id).constant else {
            return;
        };
        self.replace_with_literal(index, id, c);
    }

    fn replace_with_literal(&mut self, index: usize, id: NodeId, c: Const) {
        let op = self.graph.nodes[id].op.clone();
        match &op {
            NodeOp::GetLocal { var } => match self.graph.form {
                GraphForm::Threaded => {
                    // The variable must stay observable for OSR even though
                    // the read itself is gone.
                    self.insertions
                        .insert_op(self.graph, index, NodeOp::PhantomLocal { var: *var });
                    self.graph.needs_rethreading = true;
                }
                GraphForm::Flat => unreachable!("local reads do not exist in flat form"),
            },
            _ => {
                // The guards the replaced node would have performed survive
                // as explicit checks.
                op.for_each_edge(|e| {
                    if e.needs_check() {
                        self.insertions
                            .insert_op(self.graph, index, NodeOp::Check { value: *e });
                    }
                });
            }
        }
        self.graph.freeze(c.clone());
        trace!("node {id} proven to be {c:?}");
        self.retag(id, NodeOp::Const(c));
    }

    /// Flat-form repair: a loop-carried placeholder whose source collapsed
    /// to a literal no longer needs to write the carried slot.
    fn repair_loop_carries(&mut self) {
        for bid in 0..self.graph.blocks.len() {
            let nodes = std::mem::take(&mut self.graph.blocks[bid].nodes);
            let mut kept = Vec::with_capacity(nodes.len());
            for id in nodes {
                let dead = match self.graph.nodes[id].op {
                    NodeOp::LoopCarry { source, .. } => {
                        matches!(self.graph.nodes[source.node].op, NodeOp::Const(_))
                    }
                    _ => false,
                };
                if dead {
                    trace!("loop-carried placeholder {id} removed");
                    self.detached.push(id);
                    self.changed = true;
                } else {
                    kept.push(id);
                }
            }
            self.graph.blocks[bid].nodes = kept;
        }
    }

    /// Re-interprets every block; the first node that proves the state
    /// invalid ends the block, and everything after it is deleted.
    fn truncate_invalid_suffixes(&mut self, order: &[BlockId], preds: &[Vec<BlockId>]) {
        self.state.reset();
        for &bid in order {
            self.state.begin_block(self.graph, bid, &preds[bid]);
            let nodes = self.graph.blocks[bid].nodes.clone();
            let mut cut = None;
            for (i, &id) in nodes.iter().enumerate() {
                self.state.execute(self.graph, id);
                if !self.state.is_valid() {
                    cut = Some(i);
                    break;
                }
            }
            if let Some(i) = cut {
                let block = &mut self.graph.blocks[bid];
                let dropped: Vec<NodeId> = block.nodes.drain(i + 1..).collect();
                if !dropped.is_empty() || !matches!(block.term, Terminator::Unreachable) {
                    trace!("block {bid} truncated at a proven-unreachable point");
                    self.detached.extend(dropped);
                    block.term = Terminator::Unreachable;
                    self.changed = true;
                }
            }
            self.state.end_block(bid);
        }
    }

    fn remove_unreachable_blocks(&mut self) {
        let reachable = self.graph.reachable_blocks();
        for bid in 0..self.graph.blocks.len() {
            if reachable[bid] {
                continue;
            }
            let block = &mut self.graph.blocks[bid];
            if block.nodes.is_empty() && matches!(block.term, Terminator::Unreachable) {
                continue;
            }
            trace!("block {bid} is no longer reachable and was deleted");
            let dropped = std::mem::take(&mut block.nodes);
            self.detached.extend(dropped);
            block.term = Terminator::Unreachable;
            self.changed = true;
        }
    }
}

fn prune_variants(base: &AbstractValue, variants: &[AccessVariant]) -> Option<Vec<AccessVariant>> {
    let known = base.structures.as_set()?;
    let mut out = Vec::with_capacity(variants.len());
    for v in variants {
        let inter = v.structures.intersect(known);
        if inter.is_empty() {
            continue;
        }
        let mut nv = v.clone();
        nv.structures = inter;
        out.push(nv);
    }
    Some(out)
}
