//! Postfix-encoded invariant expressions and the quantifier-to-slot mapping.
//!
//! An invariant is a fixed-length postfix expression over constants,
//! attribute references and operators. Invariants are installed at startup
//! and never travel on the radio; dynamic installation is out of scope.

use crate::types::{ConfigError, LV_CONJS, MAX_INV_NODES, MAX_QUANTIFIERS};

/// Operator codes in their encoding order.
///
/// The order is significant twice over:
/// - every code below [`Operator::CompDifferent`] is a boolean connective;
///   applying one advances the math context (see the evaluator),
/// - every code below [`Operator::MathDiv`] produces a BOOL, the rest
///   produce an INT.
///
/// Do not insert a boolean or comparison operator after `CompLower`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Operator {
    BoolAnd = 0,
    BoolImply = 1,
    BoolOr = 2,
    CompDifferent = 3,
    CompEqual = 4,
    CompGreater = 5,
    CompLower = 6,
    MathDiv = 7,
    MathMinus = 8,
    MathMod = 9,
    MathMul = 10,
    MathPlus = 11,
}

impl Operator {
    /// Boolean connectives: operand negation flags do not apply to them.
    pub fn is_connective(self) -> bool {
        matches!(self, Operator::BoolAnd | Operator::BoolImply | Operator::BoolOr)
    }

    /// Applying one of these opens a fresh math context.
    pub fn advances_math_context(self) -> bool {
        self < Operator::CompDifferent
    }

    /// Result type: BOOL for connectives and comparisons, INT for arithmetic.
    pub fn yields_bool(self) -> bool {
        self < Operator::MathDiv
    }
}

/// Attribute reference inside an invariant: an opaque attribute id plus the
/// quantifier position it is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeRef {
    pub hash: u16,
    pub quantifier: u8,
}

/// What a postfix node holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Bool(bool),
    Int(i32),
    Attribute(AttributeRef),
    Op(Operator),
}

/// One node of the postfix expression. `negated` asks the evaluator to
/// negate the resolved integer value, except under a boolean connective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvNode {
    pub negated: bool,
    pub kind: NodeKind,
}

impl InvNode {
    pub fn boolean(value: bool) -> Self {
        Self { negated: false, kind: NodeKind::Bool(value) }
    }

    pub fn int(value: i32) -> Self {
        Self { negated: false, kind: NodeKind::Int(value) }
    }

    pub fn attr(hash: u16, quantifier: u8) -> Self {
        Self { negated: false, kind: NodeKind::Attribute(AttributeRef { hash, quantifier }) }
    }

    pub fn op(op: Operator) -> Self {
        Self { negated: false, kind: NodeKind::Op(op) }
    }

    pub fn negated(mut self) -> Self {
        self.negated = true;
        self
    }
}

/// Quantifier kind, one per quantifier position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantifier {
    Universal,
    Existential,
}

/// A postfix-encoded predicate, bounded by [`MAX_INV_NODES`].
#[derive(Debug, Clone)]
pub struct Invariant {
    pub quantifiers: Vec<Quantifier>,
    pub nodes: Vec<InvNode>,
}

impl Invariant {
    pub fn new(quantifiers: Vec<Quantifier>, nodes: Vec<InvNode>) -> Result<Self, ConfigError> {
        if nodes.len() > MAX_INV_NODES {
            return Err(ConfigError::InvariantTooLarge(nodes.len()));
        }
        Ok(Self { quantifiers, nodes })
    }
}

/// One row of the attribute-to-slot mapping: within math context `math_id`,
/// attribute `attribute` at quantifier position `quantifier` reads view
/// slot `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingEntry {
    pub attribute: u16,
    pub math_id: u8,
    pub quantifier: u8,
    pub index: usize,
}

/// The full mapping table, bounded by quantifiers times attributes.
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    entries: Vec<MappingEntry>,
}

impl Mapping {
    pub fn new(entries: Vec<MappingEntry>) -> Self {
        debug_assert!(entries.len() <= MAX_QUANTIFIERS * crate::types::MAX_ATTRIBUTES);
        Self { entries }
    }

    /// Resolve an attribute reference to a view slot for the given math
    /// context. `None` means the invariant cannot currently be decided.
    pub fn slot(&self, math_id: u8, attribute: u16, quantifier: u8) -> Option<usize> {
        self.entries
            .iter()
            .find(|m| {
                m.math_id == math_id && m.attribute == attribute && m.quantifier == quantifier
            })
            .map(|m| m.index)
    }
}

/// Everything installed at startup: the quantified invariant with its slot
/// mapping, and the disjunctive form evaluated locally per conjunct.
#[derive(Debug, Clone)]
pub struct InvariantSet {
    pub invariant: Invariant,
    pub mapping: Mapping,
    pub disjunctions: Vec<Invariant>,
}

impl InvariantSet {
    pub fn new(
        invariant: Invariant,
        mapping: Mapping,
        disjunctions: Vec<Invariant>,
    ) -> Result<Self, ConfigError> {
        if disjunctions.len() > LV_CONJS {
            return Err(ConfigError::TooManyDisjunctions(disjunctions.len()));
        }
        Ok(Self { invariant, mapping, disjunctions })
    }

    pub fn disjunction_count(&self) -> usize {
        self.disjunctions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_classes() {
        assert!(Operator::BoolAnd.advances_math_context());
        assert!(Operator::BoolOr.advances_math_context());
        assert!(!Operator::CompDifferent.advances_math_context());
        assert!(!Operator::CompLower.advances_math_context());
        assert!(Operator::CompLower.yields_bool());
        assert!(!Operator::MathDiv.yields_bool());
        assert!(Operator::BoolImply.is_connective());
        assert!(!Operator::CompEqual.is_connective());
    }

    #[test]
    fn mapping_resolution() {
        let mapping = Mapping::new(vec![
            MappingEntry { attribute: 1, math_id: 0, quantifier: 0, index: 0 },
            MappingEntry { attribute: 1, math_id: 0, quantifier: 1, index: 1 },
        ]);
        assert_eq!(mapping.slot(0, 1, 0), Some(0));
        assert_eq!(mapping.slot(0, 1, 1), Some(1));
        assert_eq!(mapping.slot(1, 1, 0), None);
        assert_eq!(mapping.slot(0, 2, 0), None);
    }

    #[test]
    fn invariant_size_bound() {
        let nodes = vec![InvNode::int(0); MAX_INV_NODES + 1];
        assert!(Invariant::new(vec![], nodes).is_err());
    }
}
