use rustc_hash::{FxHashMap, FxHashSet};

use helion::dfg::abstract_value::{AbstractValue, StructureSet};
use helion::dfg::def::*;
use helion::dfg::fold;
use helion::dfg::status::{
    AccessStatus, AccessVariant, Assumption, BuiltinShape, PropertyOffset, StatusProvider,
    StructureRegistry, TierPolicy,
};
use helion::dfg::verify::verify_graph;

#[derive(Default)]
struct MockRegistry {
    watchable: FxHashSet<StructureId>,
    builtins: FxHashMap<u8, StructureId>,
    allocations: FxHashMap<FunctionId, StructureId>,
}

impl MockRegistry {
    fn with_allocation(function: FunctionId, structure: StructureId) -> Self {
        let mut r = Self::default();
        r.allocations.insert(function, structure);
        r
    }

    fn with_watchable(structures: &[StructureId]) -> Self {
        let mut r = Self::default();
        r.watchable.extend(structures.iter().copied());
        r
    }
}

impl StructureRegistry for MockRegistry {
    fn is_watchable(&self, s: StructureId) -> bool {
        self.watchable.contains(&s)
    }

    fn builtin_shape(&self, shape: BuiltinShape) -> Option<StructureId> {
        let key = match shape {
            BuiltinShape::String => 0,
            BuiltinShape::Symbol => 1,
            BuiltinShape::BigInt => 2,
        };
        self.builtins.get(&key).copied()
    }

    fn allocation_structure(&self, function: FunctionId) -> Option<StructureId> {
        self.allocations.get(&function).copied()
    }
}

#[derive(Default)]
struct MockProfile {
    statuses: FxHashMap<PropertyId, AccessStatus>,
}

impl MockProfile {
    fn with_status(prop: PropertyId, status: AccessStatus) -> Self {
        let mut p = Self::default();
        p.statuses.insert(prop, status);
        p
    }
}

impl StatusProvider for MockProfile {
    fn query(&self, _base: &AbstractValue, prop: PropertyId) -> AccessStatus {
        self.statuses
            .get(&prop)
            .cloned()
            .unwrap_or(AccessStatus::NoInformation)
    }
}

fn simple_status(cases: &[(&[StructureId], PropertyOffset)]) -> AccessStatus {
    AccessStatus::Simple(
        cases
            .iter()
            .map(|(structures, offset)| {
                AccessVariant::new(StructureSet::from_slice(structures), *offset)
            })
            .collect(),
    )
}

fn op_of(graph: &Graph, id: NodeId) -> &NodeOp {
    &graph.nodes[id].op
}

fn ops_in_block(graph: &Graph, block: BlockId) -> Vec<&NodeOp> {
    graph.blocks[block]
        .nodes
        .iter()
        .map(|&id| op_of(graph, id))
        .collect()
}

#[test]
fn monomorphic_access_with_unknown_base_gets_a_structure_check() {
    let mut graph = Graph::new(GraphForm::Threaded);
    let b = graph.add_block();
    let base = graph.append(b, NodeOp::GetLocal { var: 0 });
    let get = graph.append(
        b,
        NodeOp::GetById {
            base: Edge::new(base, UseKind::Object),
            prop: 4,
        },
    );
    graph.blocks[b].term = Terminator::Return(Some(Edge::new(get, UseKind::Untyped)));

    let profile = MockProfile::with_status(4, simple_status(&[(&[5], PropertyOffset::inline(2))]));
    let outcome = fold::optimize(
        &mut graph,
        &MockRegistry::default(),
        &profile,
        TierPolicy::default(),
    );

    assert!(outcome.changed);
    match op_of(&graph, get) {
        NodeOp::GetByOffset { offset, .. } => assert_eq!(*offset, PropertyOffset::inline(2)),
        other => panic!("expected a direct offset load, got {other:?}"),
    }
    let ops = ops_in_block(&graph, b);
    let record_at = ops
        .iter()
        .position(|op| matches!(op, NodeOp::RecordStatus { .. }))
        .expect("profiling basis must be pinned");
    let check_at = ops
        .iter()
        .position(|op| matches!(op, NodeOp::CheckStructure { .. }))
        .expect("unproven base needs a structure check");
    let access_at = ops
        .iter()
        .position(|op| matches!(op, NodeOp::GetByOffset { .. }))
        .unwrap();
    assert!(record_at < access_at);
    assert!(check_at < access_at);
    verify_graph(&graph).unwrap();
}

#[test]
fn monomorphic_access_with_proven_base_needs_no_check() {
    let mut graph = Graph::new(GraphForm::Flat);
    let b = graph.add_block();
    let base = graph.append(b, NodeOp::NewObject { structure: 5 });
    let get = graph.append(
        b,
        NodeOp::GetById {
            base: Edge::new(base, UseKind::Object),
            prop: 4,
        },
    );
    graph.blocks[b].term = Terminator::Return(Some(Edge::new(get, UseKind::Untyped)));

    let profile = MockProfile::with_status(4, simple_status(&[(&[5], PropertyOffset::inline(2))]));
    let outcome = fold::optimize(
        &mut graph,
        &MockRegistry::default(),
        &profile,
        TierPolicy::default(),
    );

    assert!(outcome.changed);
    assert!(matches!(op_of(&graph, get), NodeOp::GetByOffset { .. }));
    assert!(
        !ops_in_block(&graph, b)
            .iter()
            .any(|op| matches!(op, NodeOp::CheckStructure { .. }))
    );
    verify_graph(&graph).unwrap();
}

#[test]
fn polymorphic_access_becomes_dispatch_table_when_tier_allows() {
    let mut graph = Graph::new(GraphForm::Threaded);
    let b = graph.add_block();
    let base = graph.append(b, NodeOp::GetLocal { var: 0 });
    let get = graph.append(
        b,
        NodeOp::GetById {
            base: Edge::new(base, UseKind::Object),
            prop: 9,
        },
    );
    graph.blocks[b].term = Terminator::Return(Some(Edge::new(get, UseKind::Untyped)));

    let status = simple_status(&[
        (&[5], PropertyOffset::inline(0)),
        (&[6], PropertyOffset::out_of_line(1)),
    ]);
    let profile = MockProfile::with_status(9, status);

    let mut dispatching = graph.clone();
    let outcome = fold::optimize(
        &mut dispatching,
        &MockRegistry::default(),
        &profile,
        TierPolicy::default(),
    );
    assert!(outcome.changed);
    match op_of(&dispatching, get) {
        NodeOp::MultiGetByOffset { variants, .. } => assert_eq!(variants.len(), 2),
        other => panic!("expected a dispatch table, got {other:?}"),
    }
    verify_graph(&dispatching).unwrap();

    // A tier without multi-case dispatch must leave the access alone rather
    // than emit a table.
    let policy = TierPolicy {
        supports_multi_dispatch: false,
        ..TierPolicy::default()
    };
    let outcome = fold::optimize(&mut graph, &MockRegistry::default(), &profile, policy);
    assert!(!outcome.changed);
    assert!(matches!(op_of(&graph, get), NodeOp::GetById { .. }));
}

#[test]
fn pruned_dispatch_table_keeps_the_surviving_offset() {
    let mut graph = Graph::new(GraphForm::Flat);
    let b = graph.add_block();
    let base = graph.append(b, NodeOp::NewObject { structure: 6 });
    let get = graph.append(
        b,
        NodeOp::MultiGetByOffset {
            base: Edge::new(base, UseKind::Object),
            variants: vec![
                AccessVariant::new(StructureSet::single(5), PropertyOffset::inline(3)),
                AccessVariant::new(StructureSet::single(6), PropertyOffset::inline(9)),
            ],
        },
    );
    graph.blocks[b].term = Terminator::Return(Some(Edge::new(get, UseKind::Untyped)));

    let outcome = fold::optimize(
        &mut graph,
        &MockRegistry::default(),
        &MockProfile::default(),
        TierPolicy::default(),
    );

    assert!(outcome.changed);
    match op_of(&graph, get) {
        NodeOp::GetByOffset { offset, .. } => assert_eq!(*offset, PropertyOffset::inline(9)),
        other => panic!("expected the surviving case, got {other:?}"),
    }
    verify_graph(&graph).unwrap();
}

#[test]
fn put_access_narrows_to_offset_store() {
    let mut graph = Graph::new(GraphForm::Flat);
    let b = graph.add_block();
    let base = graph.append(b, NodeOp::NewObject { structure: 5 });
    let val = graph.append(b, NodeOp::Const(Const::Int32(1)));
    let put = graph.append(
        b,
        NodeOp::PutById {
            base: Edge::new(base, UseKind::Object),
            value: Edge::new(val, UseKind::Untyped),
            prop: 2,
        },
    );
    graph.blocks[b].term = Terminator::Return(None);

    let profile =
        MockProfile::with_status(2, simple_status(&[(&[5], PropertyOffset::out_of_line(7))]));
    let outcome = fold::optimize(
        &mut graph,
        &MockRegistry::default(),
        &profile,
        TierPolicy::default(),
    );

    assert!(outcome.changed);
    match op_of(&graph, put) {
        NodeOp::PutByOffset { offset, .. } => assert_eq!(*offset, PropertyOffset::out_of_line(7)),
        other => panic!("expected a direct offset store, got {other:?}"),
    }
    verify_graph(&graph).unwrap();
}

#[test]
fn prototype_conditions_turn_into_assumptions_or_block_the_fold() {
    let build = || {
        let mut graph = Graph::new(GraphForm::Flat);
        let b = graph.add_block();
        let base = graph.append(b, NodeOp::NewObject { structure: 5 });
        let get = graph.append(
            b,
            NodeOp::GetById {
                base: Edge::new(base, UseKind::Object),
                prop: 4,
            },
        );
        graph.blocks[b].term = Terminator::Return(Some(Edge::new(get, UseKind::Untyped)));
        (graph, get)
    };
    let status = AccessStatus::Simple(vec![
        AccessVariant::new(StructureSet::single(5), PropertyOffset::inline(0))
            .with_conditions(&[20]),
    ]);
    let profile = MockProfile::with_status(4, status);

    // Watchable prototype chain: fold and report the dependency.
    let (mut graph, get) = build();
    let outcome = fold::optimize(
        &mut graph,
        &MockRegistry::with_watchable(&[20]),
        &profile,
        TierPolicy::default(),
    );
    assert!(outcome.changed);
    assert!(matches!(op_of(&graph, get), NodeOp::GetByOffset { .. }));
    assert!(outcome.assumptions.contains(&Assumption::PropertyCondition {
        structure: 20,
        property: 4,
    }));

    // Unwatchable chain: the rewrite must not happen.
    let (mut graph, get) = build();
    let outcome = fold::optimize(
        &mut graph,
        &MockRegistry::default(),
        &profile,
        TierPolicy::default(),
    );
    assert!(!outcome.changed);
    assert!(matches!(op_of(&graph, get), NodeOp::GetById { .. }));
}

#[test]
fn construction_folds_to_direct_allocation_under_watchpoint() {
    let mut graph = Graph::new(GraphForm::Flat);
    let b = graph.add_block();
    let callee = graph.append(b, NodeOp::Const(Const::Function(7)));
    let this = graph.append(
        b,
        NodeOp::CreateThis {
            callee: Edge::new(callee, UseKind::Object),
        },
    );
    graph.blocks[b].term = Terminator::Return(Some(Edge::new(this, UseKind::Untyped)));

    let registry = MockRegistry::with_allocation(7, 11);
    let outcome = fold::optimize(
        &mut graph,
        &registry,
        &MockProfile::default(),
        TierPolicy::default(),
    );

    assert!(outcome.changed);
    assert_eq!(*op_of(&graph, this), NodeOp::NewObject { structure: 11 });
    assert!(outcome.assumptions.contains(&Assumption::AllocationShape {
        function: 7,
        structure: 11,
    }));
    verify_graph(&graph).unwrap();

    // Without a valid allocation watchpoint nothing happens.
    let mut cold = Graph::new(GraphForm::Flat);
    let b = cold.add_block();
    let callee = cold.append(b, NodeOp::Const(Const::Function(7)));
    let this = cold.append(
        b,
        NodeOp::CreateThis {
            callee: Edge::new(callee, UseKind::Object),
        },
    );
    cold.blocks[b].term = Terminator::Return(Some(Edge::new(this, UseKind::Untyped)));
    let outcome = fold::optimize(
        &mut cold,
        &MockRegistry::default(),
        &MockProfile::default(),
        TierPolicy::default(),
    );
    assert!(!outcome.changed);
    assert!(matches!(op_of(&cold, this), NodeOp::CreateThis { .. }));
}

#[test]
fn tainted_unit_refuses_allocation_fold() {
    let mut graph = Graph::new(GraphForm::Flat);
    let b = graph.add_block();
    let callee = graph.append(b, NodeOp::Const(Const::Function(7)));
    let this = graph.append(
        b,
        NodeOp::CreateThis {
            callee: Edge::new(callee, UseKind::Object),
        },
    );
    graph.blocks[b].term = Terminator::Return(Some(Edge::new(this, UseKind::Untyped)));

    let registry = MockRegistry::with_allocation(7, 11);
    let policy = TierPolicy {
        tainted: true,
        ..TierPolicy::default()
    };
    let outcome = fold::optimize(&mut graph, &registry, &MockProfile::default(), policy);
    assert!(!outcome.changed);
    assert!(matches!(op_of(&graph, this), NodeOp::CreateThis { .. }));
}

#[test]
fn impossible_branch_side_is_cut_and_its_blocks_deleted() {
    // entry: sum of constants (a rewrite), branch on an unknown condition.
    // The taken side checks a string as int32, which can never pass; its
    // whole chain must collapse after cleanup.
    let mut graph = Graph::new(GraphForm::Threaded);
    let entry = graph.add_block();
    let bad = graph.add_block();
    let bad_tail = graph.add_block();
    let good = graph.add_block();

    let one = graph.append(entry, NodeOp::Const(Const::Int32(1)));
    let two = graph.append(entry, NodeOp::Const(Const::Int32(2)));
    let sum = graph.append(
        entry,
        NodeOp::Binary {
            op: BinOp::Add,
            lhs: Edge::new(one, UseKind::Int32),
            rhs: Edge::new(two, UseKind::Int32),
        },
    );
    let cond = graph.append(entry, NodeOp::GetLocal { var: 0 });
    graph.blocks[entry].term = Terminator::Branch {
        cond: Edge::new(cond, UseKind::Boolean),
        taken: bad,
        not_taken: good,
    };

    let s = graph.append(bad, NodeOp::Const(Const::Str("nope".into())));
    let chk = graph.append(
        bad,
        NodeOp::Check {
            value: Edge::new(s, UseKind::Int32),
        },
    );
    let after = graph.append(
        bad,
        NodeOp::Binary {
            op: BinOp::Add,
            lhs: Edge::new(s, UseKind::Int32),
            rhs: Edge::new(s, UseKind::Int32),
        },
    );
    graph.blocks[bad].term = Terminator::Goto(bad_tail);

    let dead = graph.append(bad_tail, NodeOp::Const(Const::Int32(0)));
    graph.blocks[bad_tail].term = Terminator::Return(Some(Edge::new(dead, UseKind::Untyped)));
    graph.blocks[good].term = Terminator::Return(Some(Edge::new(sum, UseKind::Untyped)));

    let outcome = fold::optimize(
        &mut graph,
        &MockRegistry::default(),
        &MockProfile::default(),
        TierPolicy::default(),
    );

    assert!(outcome.changed);
    assert_eq!(*op_of(&graph, sum), NodeOp::Const(Const::Int32(3)));
    // The failing check survives as the last thing the bad block does.
    assert_eq!(graph.blocks[bad].nodes, vec![s, chk]);
    assert!(matches!(graph.blocks[bad].term, Terminator::Unreachable));
    assert!(outcome.detached.contains(&after));
    // The block only reachable through the impossible path is gone.
    assert!(graph.blocks[bad_tail].nodes.is_empty());
    assert!(matches!(
        graph.blocks[bad_tail].term,
        Terminator::Unreachable
    ));
    assert!(outcome.detached.contains(&dead));
    verify_graph(&graph).unwrap();

    // A second run over the cleaned graph is a no-op.
    let snapshot = graph.clone();
    let second = fold::optimize(
        &mut graph,
        &MockRegistry::default(),
        &MockProfile::default(),
        TierPolicy::default(),
    );
    assert!(!second.changed);
    assert_eq!(graph.blocks, snapshot.blocks);
    assert_eq!(graph.nodes, snapshot.nodes);
}

#[test]
fn loop_carried_placeholder_for_a_folded_value_is_removed() {
    // head receives a carried slot; the carried value folds to a literal,
    // so the placeholder write disappears in the repair step.
    let mut graph = Graph::new(GraphForm::Flat);
    let entry = graph.add_block();
    let head = graph.add_block();

    let one = graph.append(entry, NodeOp::Const(Const::Int32(1)));
    let two = graph.append(entry, NodeOp::Const(Const::Int32(2)));
    let next = graph.append(
        entry,
        NodeOp::Binary {
            op: BinOp::Add,
            lhs: Edge::new(one, UseKind::Int32),
            rhs: Edge::new(two, UseKind::Int32),
        },
    );
    let carry = graph.append(
        entry,
        NodeOp::LoopCarry {
            slot: 0,
            source: Edge::new(next, UseKind::Untyped),
        },
    );
    graph.blocks[entry].term = Terminator::Goto(head);
    graph.blocks[head].term = Terminator::Return(Some(Edge::new(next, UseKind::Untyped)));

    let outcome = fold::optimize(
        &mut graph,
        &MockRegistry::default(),
        &MockProfile::default(),
        TierPolicy::default(),
    );

    assert!(outcome.changed);
    assert_eq!(*op_of(&graph, next), NodeOp::Const(Const::Int32(3)));
    assert!(!graph.blocks[entry].nodes.contains(&carry));
    assert!(outcome.detached.contains(&carry));
    verify_graph(&graph).unwrap();
}

#[test]
fn builtin_shape_knowledge_discharges_structure_checks() {
    let mut graph = Graph::new(GraphForm::Flat);
    let b = graph.add_block();
    let s = graph.append(b, NodeOp::Const(Const::Str("hi".into())));
    let chk = graph.append(
        b,
        NodeOp::CheckStructure {
            base: Edge::new(s, UseKind::Untyped),
            set: StructureSet::from_slice(&[40, 41]),
        },
    );
    graph.blocks[b].term = Terminator::Return(Some(Edge::new(s, UseKind::Untyped)));

    let mut registry = MockRegistry::default();
    registry.builtins.insert(0, 40); // string shape

    let outcome = fold::optimize(
        &mut graph,
        &registry,
        &MockProfile::default(),
        TierPolicy::default(),
    );
    assert!(outcome.changed);
    assert!(matches!(op_of(&graph, chk), NodeOp::Phantom { .. }));
    verify_graph(&graph).unwrap();
}

#[test]
fn string_concat_with_empty_side_is_removed() {
    let mut graph = Graph::new(GraphForm::Threaded);
    let b = graph.add_block();
    let x = graph.append(b, NodeOp::GetLocal { var: 0 });
    let empty = graph.append(b, NodeOp::Const(Const::Str("".into())));
    let cat = graph.append(
        b,
        NodeOp::StrCat {
            lhs: Edge::new(x, UseKind::StringUse),
            rhs: Edge::new(empty, UseKind::StringUse),
        },
    );
    graph.blocks[b].term = Terminator::Return(Some(Edge::new(cat, UseKind::Untyped)));

    let outcome = fold::optimize(
        &mut graph,
        &MockRegistry::default(),
        &MockProfile::default(),
        TierPolicy::default(),
    );
    assert!(outcome.changed);
    match op_of(&graph, cat) {
        NodeOp::Identity { value } => assert_eq!(value.node, x),
        other => panic!("expected a pass-through, got {other:?}"),
    }
    verify_graph(&graph).unwrap();
}
