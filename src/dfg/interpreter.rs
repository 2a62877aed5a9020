use crate::dfg::abstract_value::{AbstractValue, SpecType, StructureAbstract, StructureSet};
use crate::dfg::def::*;
use rustc_hash::{FxHashMap, FxHashSet};

/// Facts at one program point: per-node values plus, in threaded form, the
/// current value of each local variable.
#[derive(Debug, Clone, Default)]
struct FactMap {
    values: FxHashMap<NodeId, AbstractValue>,
    variables: FxHashMap<VarId, AbstractValue>,
}

impl FactMap {
    // A key absent from either side is top, and top absorbs under join, so
    // the joined map keeps only keys known on both sides.
    fn join_with(&self, other: &FactMap) -> FactMap {
        let mut out = FactMap::default();
        for (id, v) in &self.values {
            if let Some(o) = other.values.get(id) {
                out.values.insert(*id, v.join(o));
            }
        }
        for (var, v) in &self.variables {
            if let Some(o) = other.variables.get(var) {
                out.variables.insert(*var, v.join(o));
            }
        }
        out
    }
}

/// Forward abstract interpreter over one graph. Processes blocks in natural
/// order exactly once; block-entry facts are the join of already-processed
/// predecessors' exits, and a block reached by a back edge starts from top.
/// Transfer functions may be conservative but never assert more than the
/// node's semantics guarantee.
pub struct InterpreterState {
    map: FactMap,
    valid: bool,
    processed: FxHashSet<BlockId>,
    // Exit facts of processed blocks whose end was still reachable.
    exits: FxHashMap<BlockId, FactMap>,
}

impl InterpreterState {
    pub fn new() -> Self {
        Self {
            map: FactMap::default(),
            valid: true,
            processed: FxHashSet::default(),
            exits: FxHashMap::default(),
        }
    }

    /// Forgets everything, including processed-block bookkeeping.
    pub fn reset(&mut self) {
        self.map = FactMap::default();
        self.valid = true;
        self.processed.clear();
        self.exits.clear();
    }

    /// Loads entry facts for `block` from its processed predecessors.
    pub fn begin_block(&mut self, graph: &Graph, block: BlockId, preds: &[BlockId]) {
        self.valid = true;
        self.map = FactMap::default();
        if block == graph.entry {
            return;
        }
        // A predecessor we have not seen yet means a back edge: start from
        // top rather than iterating to a fixpoint.
        if preds.iter().any(|p| !self.processed.contains(p)) {
            return;
        }
        let mut acc: Option<FactMap> = None;
        for p in preds {
            // Predecessors whose exit was proven unreachable contribute nothing.
            let Some(exit) = self.exits.get(p) else {
                continue;
            };
            acc = Some(match acc {
                None => exit.clone(),
                Some(a) => a.join_with(exit),
            });
        }
        self.map = acc.unwrap_or_default();
    }

    /// Snapshots exit facts and marks the block processed.
    pub fn end_block(&mut self, block: BlockId) {
        self.processed.insert(block);
        if self.valid {
            self.exits.insert(block, self.map.clone());
        } else {
            self.exits.remove(&block);
        }
    }

    /// Whether control can actually reach the current point under everything
    /// proven so far.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Read-only view of the facts for one node at the current point.
    pub fn for_node(&self, node: NodeId) -> AbstractValue {
        self.map
            .values
            .get(&node)
            .cloned()
            .unwrap_or_else(AbstractValue::top)
    }

    pub fn for_variable(&self, var: VarId) -> AbstractValue {
        self.map
            .variables
            .get(&var)
            .cloned()
            .unwrap_or_else(AbstractValue::top)
    }

    /// Applies a structure check's narrowing without executing any node.
    /// Used when a rule schedules a check that will only exist after the
    /// block's insertions commit.
    pub fn assert_structures(&mut self, node: NodeId, set: &StructureSet) {
        let entry = self
            .map
            .values
            .entry(node)
            .or_insert_with(AbstractValue::top);
        if !entry.filter_structures(set) {
            self.valid = false;
        }
    }

    /// Advances the state past `node`: narrows each operand by its edge's
    /// use-kind, applies the opcode's transfer function, and invalidates the
    /// state when a guard can never pass.
    pub fn execute(&mut self, graph: &Graph, node: NodeId) {
        if !self.valid {
            return;
        }
        let op = graph.nodes[node].op.clone();

        op.for_each_edge(|e| self.filter_edge(e));
        if !self.valid {
            return;
        }

        match &op {
            NodeOp::Const(c) => self.set(node, AbstractValue::for_const(c)),
            NodeOp::GetLocal { var } => {
                let v = self.for_variable(*var);
                self.set(node, v);
            }
            NodeOp::SetLocal { var, value } => {
                let v = self.for_node(value.node);
                self.map.variables.insert(*var, v);
            }
            NodeOp::PhantomLocal { .. } | NodeOp::Phantom { .. } | NodeOp::RecordStatus { .. } => {}
            NodeOp::LoopCarry { slot, source } => {
                let v = self.for_node(source.node);
                self.map.variables.insert(*slot, v);
            }
            NodeOp::Identity { value } => {
                let v = self.for_node(value.node);
                self.set(node, v);
            }
            NodeOp::Binary { op, lhs, rhs } => {
                let v = self.transfer_binary(*op, *lhs, *rhs);
                self.set(node, v);
            }
            NodeOp::Unary { op, value } => {
                let v = self.transfer_unary(*op, *value);
                self.set(node, v);
            }
            NodeOp::StrCat { lhs, rhs } => {
                let v = self.transfer_str_cat(*lhs, *rhs);
                self.set(node, v);
            }
            NodeOp::Check { .. } => {
                // The edge filter above is the entire effect.
            }
            NodeOp::CheckStructure { base, set } => {
                self.assert_structures(base.node, set);
            }
            NodeOp::GetById { .. } => {
                // May invoke an arbitrary getter.
                self.clobber_structures();
                self.set(node, AbstractValue::top());
            }
            NodeOp::PutById { .. } => {
                self.clobber_structures();
            }
            NodeOp::GetByOffset { .. } => self.set(node, AbstractValue::top()),
            NodeOp::PutByOffset { .. } => {}
            NodeOp::MultiGetByOffset { base, variants } => {
                self.assert_structures(base.node, &variant_union(variants));
                self.set(node, AbstractValue::top());
            }
            NodeOp::MultiPutByOffset { base, variants, .. } => {
                self.assert_structures(base.node, &variant_union(variants));
            }
            NodeOp::CreateThis { .. } => {
                // Runs user code (prototype lookup on the callee).
                self.clobber_structures();
                self.set(node, AbstractValue::for_spec(SpecType::OBJECT));
            }
            NodeOp::NewObject { structure } => {
                self.set(node, AbstractValue::for_structure(*structure));
            }
        }
    }

    fn set(&mut self, node: NodeId, value: AbstractValue) {
        self.map.values.insert(node, value);
    }

    fn filter_edge(&mut self, edge: &Edge) {
        if edge.kind == UseKind::Untyped {
            return;
        }
        let entry = self
            .map
            .values
            .entry(edge.node)
            .or_insert_with(AbstractValue::top);
        if !entry.filter_spec(edge.kind.spec()) {
            self.valid = false;
        }
    }

    // A call boundary can transition any object's structure, but it cannot
    // change what type a value already has, nor which literal it is.
    fn clobber_structures(&mut self) {
        for v in self.map.values.values_mut() {
            v.structures = StructureAbstract::Top;
        }
        for v in self.map.variables.values_mut() {
            v.structures = StructureAbstract::Top;
        }
    }

    fn transfer_binary(&self, op: BinOp, lhs: Edge, rhs: Edge) -> AbstractValue {
        let l = self.for_node(lhs.node);
        let r = self.for_node(rhs.node);
        let lc = l.proven_constant();
        let rc = r.proven_constant();

        if op.is_comparison() {
            let constant = eval_compare(op, lc, rc);
            let mut out = AbstractValue::for_spec(SpecType::BOOL);
            out.constant = constant;
            return out;
        }
        if op.is_bitwise() {
            let constant = eval_bitwise(op, lc, rc);
            let mut out = AbstractValue::for_spec(SpecType::INT32);
            out.constant = constant;
            return out;
        }

        // Add/Sub/Mul. Under int32 speculation on both inputs the node
        // produces an int32 or exits; otherwise it may go double.
        let int_speculated = lhs.kind == UseKind::Int32 && rhs.kind == UseKind::Int32;
        let constant = eval_arith(op, lc, rc, int_speculated);
        let mut out = AbstractValue::for_spec(if int_speculated {
            SpecType::INT32
        } else {
            SpecType::NUMBER
        });
        out.constant = constant;
        out
    }

    fn transfer_unary(&self, op: UnaryOp, value: Edge) -> AbstractValue {
        let v = self.for_node(value.node);
        match op {
            UnaryOp::Not => {
                let constant = match v.proven_constant() {
                    Some(Const::Bool(b)) => Some(Const::Bool(!b)),
                    _ => None,
                };
                let mut out = AbstractValue::for_spec(SpecType::BOOL);
                out.constant = constant;
                out
            }
            UnaryOp::Neg => {
                let int_speculated = value.kind == UseKind::Int32;
                let constant = match v.proven_constant() {
                    // -0 and -i32::MIN leave the int32 range.
                    Some(Const::Int32(i)) if *i != 0 && *i != i32::MIN => Some(Const::Int32(-i)),
                    Some(Const::Int32(i)) if !int_speculated => Some(Const::Double(-(*i as f64))),
                    Some(Const::Double(d)) if !int_speculated => Some(Const::Double(-d)),
                    _ => None,
                };
                let mut out = AbstractValue::for_spec(if int_speculated {
                    SpecType::INT32
                } else {
                    SpecType::NUMBER
                });
                out.constant = constant;
                out
            }
        }
    }

    fn transfer_str_cat(&self, lhs: Edge, rhs: Edge) -> AbstractValue {
        let l = self.for_node(lhs.node);
        let r = self.for_node(rhs.node);
        let constant = match (l.proven_constant(), r.proven_constant()) {
            (Some(Const::Str(a)), Some(Const::Str(b))) => {
                let mut s = String::with_capacity(a.len() + b.len());
                s.push_str(a);
                s.push_str(b);
                Some(Const::Str(s.into()))
            }
            _ => None,
        };
        let mut out = AbstractValue::for_spec(SpecType::STRING);
        out.constant = constant;
        out
    }
}

impl Default for InterpreterState {
    fn default() -> Self {
        Self::new()
    }
}

fn variant_union(variants: &[AccessVariant]) -> StructureSet {
    let mut union = StructureSet::new();
    for v in variants {
        union.merge(&v.structures);
    }
    union
}

fn eval_arith(
    op: BinOp,
    l: Option<&Const>,
    r: Option<&Const>,
    int_speculated: bool,
) -> Option<Const> {
    let (l, r) = (l?, r?);
    if let (Some(a), Some(b)) = (l.as_int32(), r.as_int32()) {
        let wide = match op {
            BinOp::Add => a as i64 + b as i64,
            BinOp::Sub => a as i64 - b as i64,
            BinOp::Mul => a as i64 * b as i64,
            _ => unreachable!("non-arithmetic op in eval_arith"),
        };
        if let Ok(v) = i32::try_from(wide) {
            return Some(Const::Int32(v));
        }
        // Overflow exits under int32 speculation instead of producing a value.
        if int_speculated {
            return None;
        }
    }
    if int_speculated {
        return None;
    }
    let (a, b) = (l.as_number()?, r.as_number()?);
    let v = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        _ => unreachable!("non-arithmetic op in eval_arith"),
    };
    Some(Const::Double(v))
}

fn eval_bitwise(op: BinOp, l: Option<&Const>, r: Option<&Const>) -> Option<Const> {
    let a = l?.as_int32()?;
    let b = r?.as_int32()?;
    let v = match op {
        BinOp::BitAnd => a & b,
        BinOp::BitOr => a | b,
        BinOp::BitXor => a ^ b,
        BinOp::Shl => a.wrapping_shl(b as u32 & 31),
        BinOp::Shr => a >> (b as u32 & 31),
        _ => unreachable!("non-bitwise op in eval_bitwise"),
    };
    Some(Const::Int32(v))
}

fn eval_compare(op: BinOp, l: Option<&Const>, r: Option<&Const>) -> Option<Const> {
    let (l, r) = (l?, r?);
    if let (Some(a), Some(b)) = (l.as_number(), r.as_number()) {
        let v = match op {
            BinOp::Lt => a < b,
            BinOp::Le => a <= b,
            BinOp::Gt => a > b,
            BinOp::Ge => a >= b,
            BinOp::Eq => a == b,
            BinOp::Ne => a != b,
            _ => unreachable!("non-comparison op in eval_compare"),
        };
        return Some(Const::Bool(v));
    }
    match op {
        BinOp::Eq => eval_non_numeric_eq(l, r).map(Const::Bool),
        BinOp::Ne => eval_non_numeric_eq(l, r).map(|e| Const::Bool(!e)),
        _ => None,
    }
}

fn eval_non_numeric_eq(l: &Const, r: &Const) -> Option<bool> {
    match (l, r) {
        (Const::Bool(a), Const::Bool(b)) => Some(a == b),
        (Const::Str(a), Const::Str(b)) => Some(a == b),
        (Const::Undefined, Const::Undefined) | (Const::Null, Const::Null) => Some(true),
        _ => None,
    }
}
