pub use crate::dfg::abstract_value::{AbstractValue, SpecType, StructureAbstract, StructureSet};
pub use crate::dfg::status::{AccessStatus, AccessVariant, PropertyOffset};

use smallvec::SmallVec;
use std::rc::Rc;

pub type NodeId = usize;
pub type BlockId = usize;
pub type VarId = usize;
pub type StructureId = usize;
pub type PropertyId = usize;
pub type FunctionId = usize;

/// A compile-time literal. `Double` compares bit-exactly so that `-0.0` and
/// `0.0` (and distinct NaN payloads) never alias during folding.
#[derive(Debug, Clone)]
pub enum Const {
    Undefined,
    Null,
    Bool(bool),
    Int32(i32),
    Double(f64),
    Str(Rc<str>),
    Function(FunctionId),
}

impl PartialEq for Const {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Const::Undefined, Const::Undefined) => true,
            (Const::Null, Const::Null) => true,
            (Const::Bool(a), Const::Bool(b)) => a == b,
            (Const::Int32(a), Const::Int32(b)) => a == b,
            (Const::Double(a), Const::Double(b)) => a.to_bits() == b.to_bits(),
            (Const::Str(a), Const::Str(b)) => a == b,
            (Const::Function(a), Const::Function(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Const {}

impl std::hash::Hash for Const {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        core::mem::discriminant(self).hash(state);
        match self {
            Const::Undefined | Const::Null => {}
            Const::Bool(b) => b.hash(state),
            Const::Int32(i) => i.hash(state),
            Const::Double(d) => d.to_bits().hash(state),
            Const::Str(s) => s.hash(state),
            Const::Function(f) => f.hash(state),
        }
    }
}

impl Const {
    pub fn spec_type(&self) -> SpecType {
        match self {
            Const::Undefined | Const::Null => SpecType::NULLISH,
            Const::Bool(_) => SpecType::BOOL,
            Const::Int32(_) => SpecType::INT32,
            Const::Double(_) => SpecType::DOUBLE,
            Const::Str(_) => SpecType::STRING,
            Const::Function(_) => SpecType::OBJECT,
        }
    }

    pub fn as_int32(&self) -> Option<i32> {
        match self {
            Const::Int32(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Const::Int32(i) => Some(*i as f64),
            Const::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<FunctionId> {
        match self {
            Const::Function(f) => Some(*f),
            _ => None,
        }
    }
}

/// The type assumption under which a consumer reads an input edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UseKind {
    Untyped,
    Int32,
    Number,
    Boolean,
    StringUse,
    Object,
}

impl UseKind {
    pub fn spec(self) -> SpecType {
        match self {
            UseKind::Untyped => SpecType::TOP,
            UseKind::Int32 => SpecType::INT32,
            UseKind::Number => SpecType::NUMBER,
            UseKind::Boolean => SpecType::BOOL,
            UseKind::StringUse => SpecType::STRING,
            UseKind::Object => SpecType::OBJECT,
        }
    }
}

/// Whether the type test implied by an edge's use-kind still has to be
/// emitted. `Proved` means the analysis discharged it; `NoCheckByPolicy`
/// means the tier decided no check is wanted regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofStatus {
    NeedsCheck,
    Proved,
    NoCheckByPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub node: NodeId,
    pub kind: UseKind,
    pub proof: ProofStatus,
}

impl Edge {
    pub fn new(node: NodeId, kind: UseKind) -> Self {
        Self {
            node,
            kind,
            proof: ProofStatus::NeedsCheck,
        }
    }

    pub fn proved(node: NodeId, kind: UseKind) -> Self {
        Self {
            node,
            kind,
            proof: ProofStatus::Proved,
        }
    }

    pub fn needs_check(&self) -> bool {
        self.proof == ProofStatus::NeedsCheck && self.kind != UseKind::Untyped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne
        )
    }

    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeOp {
    Const(Const),

    // Variable traffic (threaded form only).
    GetLocal {
        var: VarId,
    },
    SetLocal {
        var: VarId,
        value: Edge,
    },
    // Keeps a replaced local read alive for OSR without reading anything.
    PhantomLocal {
        var: VarId,
    },

    // Loop-carried merge placeholder (flat form only): writes `source` into
    // the carried slot the loop-head merge reads.
    LoopCarry {
        slot: VarId,
        source: Edge,
    },

    // Liveness-only placeholder; also what an eliminated check degrades to.
    Phantom {
        value: Option<Edge>,
    },
    // Pass-through produced by strength reduction. Lowers to a move.
    Identity {
        value: Edge,
    },

    Binary {
        op: BinOp,
        lhs: Edge,
        rhs: Edge,
    },
    Unary {
        op: UnaryOp,
        value: Edge,
    },
    StrCat {
        lhs: Edge,
        rhs: Edge,
    },

    // Speculation guards.
    Check {
        value: Edge,
    },
    CheckStructure {
        base: Edge,
        set: StructureSet,
    },

    // Property access.
    GetById {
        base: Edge,
        prop: PropertyId,
    },
    PutById {
        base: Edge,
        value: Edge,
        prop: PropertyId,
    },
    GetByOffset {
        base: Edge,
        offset: PropertyOffset,
    },
    PutByOffset {
        base: Edge,
        value: Edge,
        offset: PropertyOffset,
    },
    MultiGetByOffset {
        base: Edge,
        variants: Vec<AccessVariant>,
    },
    MultiPutByOffset {
        base: Edge,
        value: Edge,
        variants: Vec<AccessVariant>,
    },

    // Allocation.
    CreateThis {
        callee: Edge,
    },
    NewObject {
        structure: StructureId,
    },

    // Pins the profiling basis an access rewrite relied on, so a later
    // recompilation can tell which inline-cache state was consumed.
    RecordStatus {
        base: Edge,
        status: Box<AccessStatus>,
    },
}

impl NodeOp {
    /// Whether the node produces a value other nodes can consume.
    pub fn has_result(&self) -> bool {
        match self {
            NodeOp::Const(_)
            | NodeOp::GetLocal { .. }
            | NodeOp::Identity { .. }
            | NodeOp::Binary { .. }
            | NodeOp::Unary { .. }
            | NodeOp::StrCat { .. }
            | NodeOp::GetById { .. }
            | NodeOp::GetByOffset { .. }
            | NodeOp::MultiGetByOffset { .. }
            | NodeOp::CreateThis { .. }
            | NodeOp::NewObject { .. } => true,
            NodeOp::SetLocal { .. }
            | NodeOp::PhantomLocal { .. }
            | NodeOp::LoopCarry { .. }
            | NodeOp::Phantom { .. }
            | NodeOp::Check { .. }
            | NodeOp::CheckStructure { .. }
            | NodeOp::PutById { .. }
            | NodeOp::PutByOffset { .. }
            | NodeOp::MultiPutByOffset { .. }
            | NodeOp::RecordStatus { .. } => false,
        }
    }

    /// Whether the node has effects beyond its declared result, which makes
    /// it ineligible for replacement by a literal.
    pub fn has_side_effects(&self) -> bool {
        match self {
            NodeOp::SetLocal { .. }
            | NodeOp::LoopCarry { .. }
            | NodeOp::GetById { .. }
            | NodeOp::PutById { .. }
            | NodeOp::PutByOffset { .. }
            | NodeOp::MultiPutByOffset { .. }
            | NodeOp::CreateThis { .. }
            | NodeOp::NewObject { .. }
            | NodeOp::RecordStatus { .. } => true,
            NodeOp::Const(_)
            | NodeOp::GetLocal { .. }
            | NodeOp::PhantomLocal { .. }
            | NodeOp::Phantom { .. }
            | NodeOp::Identity { .. }
            | NodeOp::Binary { .. }
            | NodeOp::Unary { .. }
            | NodeOp::StrCat { .. }
            | NodeOp::Check { .. }
            | NodeOp::CheckStructure { .. }
            | NodeOp::GetByOffset { .. }
            | NodeOp::MultiGetByOffset { .. } => false,
        }
    }

    /// Whether the node's result is read out of the heap. Tainted
    /// compilation units refuse to literal-fold these.
    pub fn reads_heap(&self) -> bool {
        matches!(
            self,
            NodeOp::GetById { .. } | NodeOp::GetByOffset { .. } | NodeOp::MultiGetByOffset { .. }
        )
    }

    pub fn for_each_edge(&self, mut f: impl FnMut(&Edge)) {
        match self {
            NodeOp::Const(_)
            | NodeOp::GetLocal { .. }
            | NodeOp::PhantomLocal { .. }
            | NodeOp::NewObject { .. } => {}
            NodeOp::SetLocal { value, .. } => f(value),
            NodeOp::LoopCarry { source, .. } => f(source),
            NodeOp::Phantom { value } => {
                if let Some(v) = value {
                    f(v);
                }
            }
            NodeOp::Identity { value } => f(value),
            NodeOp::Binary { lhs, rhs, .. } | NodeOp::StrCat { lhs, rhs } => {
                f(lhs);
                f(rhs);
            }
            NodeOp::Unary { value, .. } => f(value),
            NodeOp::Check { value } => f(value),
            NodeOp::CheckStructure { base, .. } => f(base),
            NodeOp::GetById { base, .. }
            | NodeOp::GetByOffset { base, .. }
            | NodeOp::MultiGetByOffset { base, .. }
            | NodeOp::RecordStatus { base, .. } => f(base),
            NodeOp::PutById { base, value, .. }
            | NodeOp::PutByOffset { base, value, .. }
            | NodeOp::MultiPutByOffset { base, value, .. } => {
                f(base);
                f(value);
            }
            NodeOp::CreateThis { callee } => f(callee),
        }
    }

    pub fn for_each_edge_mut(&mut self, mut f: impl FnMut(&mut Edge)) {
        match self {
            NodeOp::Const(_)
            | NodeOp::GetLocal { .. }
            | NodeOp::PhantomLocal { .. }
            | NodeOp::NewObject { .. } => {}
            NodeOp::SetLocal { value, .. } => f(value),
            NodeOp::LoopCarry { source, .. } => f(source),
            NodeOp::Phantom { value } => {
                if let Some(v) = value {
                    f(v);
                }
            }
            NodeOp::Identity { value } => f(value),
            NodeOp::Binary { lhs, rhs, .. } | NodeOp::StrCat { lhs, rhs } => {
                f(lhs);
                f(rhs);
            }
            NodeOp::Unary { value, .. } => f(value),
            NodeOp::Check { value } => f(value),
            NodeOp::CheckStructure { base, .. } => f(base),
            NodeOp::GetById { base, .. }
            | NodeOp::GetByOffset { base, .. }
            | NodeOp::MultiGetByOffset { base, .. }
            | NodeOp::RecordStatus { base, .. } => f(base),
            NodeOp::PutById { base, value, .. }
            | NodeOp::PutByOffset { base, value, .. }
            | NodeOp::MultiPutByOffset { base, value, .. } => {
                f(base);
                f(value);
            }
            NodeOp::CreateThis { callee } => f(callee),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub op: NodeOp,
    // Bytecode offset this node originated from, for OSR bookkeeping.
    pub origin: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Goto(BlockId),
    Branch {
        cond: Edge,
        taken: BlockId,
        not_taken: BlockId,
    },
    Return(Option<Edge>),
    Unreachable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub id: BlockId,
    pub nodes: Vec<NodeId>,
    pub term: Terminator,
}

/// Threaded form still routes values through named locals; flat form is the
/// single-assignment shape where loop merges are explicit `LoopCarry` nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphForm {
    Threaded,
    Flat,
}

#[derive(Debug, Clone)]
pub struct Graph {
    pub form: GraphForm,
    pub blocks: Vec<Block>, // indices are BlockIds
    pub nodes: Vec<Node>,   // indices are NodeIds; slots are stable
    pub entry: BlockId,
    // Set when a local read was folded away and the variable threading
    // must be rebuilt before the next threaded-form pass.
    pub needs_rethreading: bool,
    // Literals materialized by optimization; the embedder keeps these
    // alive for the garbage collector.
    pub frozen: Vec<Const>,
}

impl Graph {
    pub fn new(form: GraphForm) -> Self {
        Self {
            form,
            blocks: Vec::new(),
            nodes: Vec::new(),
            entry: 0,
            needs_rethreading: false,
            frozen: Vec::new(),
        }
    }

    pub fn add_block(&mut self) -> BlockId {
        let id = self.blocks.len();
        self.blocks.push(Block {
            id,
            nodes: Vec::new(),
            // Set to a real terminator when the block is finalized.
            term: Terminator::Unreachable,
        });
        id
    }

    pub fn add_node(&mut self, op: NodeOp) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node { id, op, origin: 0 });
        id
    }

    /// Allocates a node and appends it to `block`.
    pub fn append(&mut self, block: BlockId, op: NodeOp) -> NodeId {
        let id = self.add_node(op);
        self.blocks[block].nodes.push(id);
        id
    }

    pub fn freeze(&mut self, c: Const) {
        self.frozen.push(c);
    }

    pub fn successors(&self, block: BlockId) -> SmallVec<[BlockId; 2]> {
        let mut out = SmallVec::new();
        match &self.blocks[block].term {
            Terminator::Goto(t) => out.push(*t),
            Terminator::Branch {
                taken, not_taken, ..
            } => {
                out.push(*taken);
                if not_taken != taken {
                    out.push(*not_taken);
                }
            }
            Terminator::Return(_) | Terminator::Unreachable => {}
        }
        out
    }

    pub fn predecessors(&self) -> Vec<Vec<BlockId>> {
        let mut preds: Vec<Vec<BlockId>> = vec![Vec::new(); self.blocks.len()];
        for bid in 0..self.blocks.len() {
            for succ in self.successors(bid) {
                preds[succ].push(bid);
            }
        }
        preds
    }

    /// Reverse postorder from the entry block. Single-pass forward analysis
    /// visits every block after all of its forward predecessors.
    pub fn natural_order(&self) -> Vec<BlockId> {
        let mut post = Vec::with_capacity(self.blocks.len());
        let mut visited = vec![false; self.blocks.len()];
        // (block, next successor index to try)
        let mut stack: Vec<(BlockId, usize)> = vec![(self.entry, 0)];
        visited[self.entry] = true;

        while let Some((bid, next)) = stack.pop() {
            let succs = self.successors(bid);
            if next < succs.len() {
                stack.push((bid, next + 1));
                let s = succs[next];
                if !visited[s] {
                    visited[s] = true;
                    stack.push((s, 0));
                }
            } else {
                post.push(bid);
            }
        }

        post.reverse();
        post
    }

    pub fn reachable_blocks(&self) -> Vec<bool> {
        let mut reachable = vec![false; self.blocks.len()];
        reachable[self.entry] = true;
        let mut queue = vec![self.entry];
        let mut head = 0;
        while head < queue.len() {
            let bid = queue[head];
            head += 1;
            for succ in self.successors(bid) {
                if !reachable[succ] {
                    reachable[succ] = true;
                    queue.push(succ);
                }
            }
        }
        reachable
    }
}
