use crate::dfg::def::{Const, StructureId};
use smallvec::SmallVec;

/// Type-speculation bitset. Narrower ⊑ wider; `TOP` is "any value".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecType {
    pub bits: u32,
}

impl SpecType {
    pub const NONE: SpecType = SpecType { bits: 0 };

    pub const BOOL: SpecType = SpecType { bits: 1 << 0 };
    pub const INT32: SpecType = SpecType { bits: 1 << 1 };
    pub const DOUBLE: SpecType = SpecType { bits: 1 << 2 };
    pub const STRING: SpecType = SpecType { bits: 1 << 3 };
    pub const SYMBOL: SpecType = SpecType { bits: 1 << 4 };
    pub const BIGINT: SpecType = SpecType { bits: 1 << 5 };
    pub const OBJECT: SpecType = SpecType { bits: 1 << 6 };
    pub const NULLISH: SpecType = SpecType { bits: 1 << 7 };

    pub const NUMBER: SpecType = SpecType {
        bits: Self::INT32.bits | Self::DOUBLE.bits,
    };
    // Heap-allocated values that carry a structure.
    pub const CELL: SpecType = SpecType {
        bits: Self::STRING.bits | Self::SYMBOL.bits | Self::BIGINT.bits | Self::OBJECT.bits,
    };
    pub const TOP: SpecType = SpecType {
        bits: Self::BOOL.bits | Self::NUMBER.bits | Self::CELL.bits | Self::NULLISH.bits,
    };

    pub fn is_none(self) -> bool {
        self.bits == 0
    }

    pub fn union(self, other: SpecType) -> SpecType {
        SpecType {
            bits: self.bits | other.bits,
        }
    }

    pub fn intersect(self, other: SpecType) -> SpecType {
        SpecType {
            bits: self.bits & other.bits,
        }
    }

    pub fn intersects(self, other: SpecType) -> bool {
        self.bits & other.bits != 0
    }

    pub fn is_subset_of(self, other: SpecType) -> bool {
        self.bits & !other.bits == 0
    }
}

/// A finite set of object structures, kept sorted and deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StructureSet {
    ids: SmallVec<[StructureId; 4]>,
}

impl StructureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(s: StructureId) -> Self {
        let mut ids = SmallVec::new();
        ids.push(s);
        Self { ids }
    }

    pub fn from_slice(slice: &[StructureId]) -> Self {
        let mut set = Self::new();
        for &s in slice {
            set.insert(s);
        }
        set
    }

    pub fn insert(&mut self, s: StructureId) {
        if let Err(pos) = self.ids.binary_search(&s) {
            self.ids.insert(pos, s);
        }
    }

    pub fn contains(&self, s: StructureId) -> bool {
        self.ids.binary_search(&s).is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = StructureId> + '_ {
        self.ids.iter().copied()
    }

    pub fn only(&self) -> Option<StructureId> {
        if self.ids.len() == 1 {
            Some(self.ids[0])
        } else {
            None
        }
    }

    pub fn is_subset_of(&self, other: &StructureSet) -> bool {
        self.ids.iter().all(|s| other.contains(*s))
    }

    pub fn intersect(&self, other: &StructureSet) -> StructureSet {
        StructureSet {
            ids: self
                .ids
                .iter()
                .copied()
                .filter(|s| other.contains(*s))
                .collect(),
        }
    }

    pub fn merge(&mut self, other: &StructureSet) {
        for s in other.iter() {
            self.insert(s);
        }
    }
}

/// Structure knowledge for a value's cell case. Empty ⊑ finite set ⊑ Top;
/// an empty set means "cannot be a cell of any known structure".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StructureAbstract {
    #[default]
    Top,
    Set(StructureSet),
}

impl StructureAbstract {
    pub fn is_top(&self) -> bool {
        matches!(self, StructureAbstract::Top)
    }

    pub fn as_set(&self) -> Option<&StructureSet> {
        match self {
            StructureAbstract::Top => None,
            StructureAbstract::Set(s) => Some(s),
        }
    }

    pub fn only(&self) -> Option<StructureId> {
        self.as_set().and_then(StructureSet::only)
    }

    pub fn is_subset_of(&self, set: &StructureSet) -> bool {
        match self {
            StructureAbstract::Top => false,
            StructureAbstract::Set(s) => s.is_subset_of(set),
        }
    }

    pub fn join(&self, other: &StructureAbstract) -> StructureAbstract {
        match (self, other) {
            (StructureAbstract::Top, _) | (_, StructureAbstract::Top) => StructureAbstract::Top,
            (StructureAbstract::Set(a), StructureAbstract::Set(b)) => {
                let mut merged = a.clone();
                merged.merge(b);
                StructureAbstract::Set(merged)
            }
        }
    }

    /// Narrows to `set`. Returns false if the result is the empty set.
    pub fn filter(&mut self, set: &StructureSet) -> bool {
        let narrowed = match self {
            StructureAbstract::Top => set.clone(),
            StructureAbstract::Set(s) => s.intersect(set),
        };
        let ok = !narrowed.is_empty();
        *self = StructureAbstract::Set(narrowed);
        ok
    }
}

/// Everything the analysis has proven about one value at one program point.
#[derive(Debug, Clone, PartialEq)]
pub struct AbstractValue {
    pub spec: SpecType,
    pub constant: Option<Const>,
    pub structures: StructureAbstract,
}

impl AbstractValue {
    pub fn top() -> Self {
        Self {
            spec: SpecType::TOP,
            constant: None,
            structures: StructureAbstract::Top,
        }
    }

    pub fn for_const(c: &Const) -> Self {
        Self {
            spec: c.spec_type(),
            constant: Some(c.clone()),
            structures: StructureAbstract::Top,
        }
    }

    pub fn for_spec(spec: SpecType) -> Self {
        Self {
            spec,
            constant: None,
            structures: StructureAbstract::Top,
        }
    }

    pub fn for_structure(structure: StructureId) -> Self {
        Self {
            spec: SpecType::OBJECT,
            constant: None,
            structures: StructureAbstract::Set(StructureSet::single(structure)),
        }
    }

    /// No value satisfies the proven facts: the program point is unreachable.
    pub fn is_clear(&self) -> bool {
        self.spec.is_none()
    }

    fn clear(&mut self) {
        self.spec = SpecType::NONE;
        self.constant = None;
        self.structures = StructureAbstract::Set(StructureSet::new());
    }

    pub fn proven_constant(&self) -> Option<&Const> {
        self.constant.as_ref()
    }

    pub fn join(&self, other: &AbstractValue) -> AbstractValue {
        if self.is_clear() {
            return other.clone();
        }
        if other.is_clear() {
            return self.clone();
        }
        let constant = match (&self.constant, &other.constant) {
            (Some(a), Some(b)) if a == b => Some(a.clone()),
            _ => None,
        };
        AbstractValue {
            spec: self.spec.union(other.spec),
            constant,
            structures: self.structures.join(&other.structures),
        }
    }

    /// Narrows the type bits. Returns false when nothing can satisfy the
    /// filter, in which case the value is cleared.
    pub fn filter_spec(&mut self, t: SpecType) -> bool {
        let narrowed = self.spec.intersect(t);
        if narrowed.is_none() {
            self.clear();
            return false;
        }
        if let Some(c) = &self.constant {
            if !c.spec_type().is_subset_of(narrowed) {
                // The proven literal contradicts the filter.
                self.clear();
                return false;
            }
        }
        self.spec = narrowed;
        true
    }

    /// Asserts a structure check: the value is a cell whose structure is in
    /// `set`. Returns false when that is impossible.
    pub fn filter_structures(&mut self, set: &StructureSet) -> bool {
        if !self.filter_spec(SpecType::CELL) {
            return false;
        }
        if !self.structures.filter(set) {
            self.clear();
            return false;
        }
        true
    }
}
