//! Invariant evaluation: a stack machine over the postfix encoding, plus the
//! node-local evaluation of the disjunctive (T1) form.
//!
//! Evaluation never panics on malformed input or missing data; it aborts with
//! an [`EvalError`] and the caller reports the verdict as *undecided*.

use crate::attributes::AttributeReader;
use crate::invariant::{InvNode, Invariant, Mapping, NodeKind, Operator};
use crate::types::{
    LV_CONJS, LV_ENTRIES, MAX_QUANTIFIERS, MAX_STACK_SIZE, NodeAddr, Timestamp, ViewConj,
    ViewEntry,
};
use tracing::trace;

/// Why an evaluation could not produce a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    #[error("evaluation stack overflow")]
    StackOverflow,
    #[error("evaluation stack underflow")]
    StackUnderflow,
    #[error("attribute {attribute} quantifier {quantifier} unmapped in math context {math_id}")]
    UnmappedAttribute { math_id: u8, attribute: u16, quantifier: u8 },
    #[error("view slot {0} is empty")]
    EmptySlot(usize),
    #[error("division by zero")]
    DivisionByZero,
    #[error("malformed invariant expression")]
    Malformed,
    #[error("attribute {0} not available at this node")]
    UnknownAttribute(u16),
}

/// Resolve an operand to an integer in the given math context.
fn resolve(
    entries: &[ViewEntry; LV_ENTRIES],
    mapping: &Mapping,
    node: &InvNode,
    math_id: u8,
) -> Result<i32, EvalError> {
    match node.kind {
        NodeKind::Bool(b) => Ok(i32::from(b)),
        NodeKind::Int(v) => Ok(v),
        NodeKind::Attribute(a) => {
            let idx = mapping.slot(math_id, a.hash, a.quantifier).ok_or(
                EvalError::UnmappedAttribute {
                    math_id,
                    attribute: a.hash,
                    quantifier: a.quantifier,
                },
            )?;
            if idx >= LV_ENTRIES {
                return Err(EvalError::UnmappedAttribute {
                    math_id,
                    attribute: a.hash,
                    quantifier: a.quantifier,
                });
            }
            let entry = &entries[idx];
            if entry.is_empty() {
                return Err(EvalError::EmptySlot(idx));
            }
            Ok(i32::from(entry.val))
        }
        NodeKind::Op(_) => Err(EvalError::Malformed),
    }
}

/// Apply one operator to two resolved operands.
///
/// Negation flags apply to the integer values, but never under a boolean
/// connective. Comparisons and connectives yield BOOL, arithmetic yields INT.
fn apply(op: Operator, n1: &InvNode, mut v1: i32, n2: &InvNode, mut v2: i32) -> Result<InvNode, EvalError> {
    if !op.is_connective() {
        if n1.negated {
            v1 = -v1;
        }
        if n2.negated {
            v2 = -v2;
        }
    }

    let kind = match op {
        Operator::BoolAnd => NodeKind::Bool(v1 != 0 && v2 != 0),
        Operator::BoolImply => NodeKind::Bool(v1 == 0 || v2 != 0),
        Operator::BoolOr => NodeKind::Bool(v1 != 0 || v2 != 0),
        Operator::CompDifferent => NodeKind::Bool(v1 != v2),
        Operator::CompEqual => NodeKind::Bool(v1 == v2),
        Operator::CompGreater => NodeKind::Bool(v1 > v2),
        Operator::CompLower => NodeKind::Bool(v1 < v2),
        Operator::MathDiv => {
            if v2 == 0 {
                return Err(EvalError::DivisionByZero);
            }
            NodeKind::Int(v1.wrapping_div(v2))
        }
        Operator::MathMinus => NodeKind::Int(v1.wrapping_sub(v2)),
        Operator::MathMod => {
            if v2 == 0 {
                return Err(EvalError::DivisionByZero);
            }
            NodeKind::Int(v1.wrapping_rem(v2))
        }
        Operator::MathMul => NodeKind::Int(v1.wrapping_mul(v2)),
        Operator::MathPlus => NodeKind::Int(v1.wrapping_add(v2)),
    };
    trace!(?op, v1, v2, ?kind, "apply");
    Ok(InvNode { negated: false, kind })
}

/// Evaluate the installed invariant against a view's entry slots.
///
/// Constants and attribute references are pushed; each operator pops two
/// operands, resolves attribute references through the mapping table in the
/// current math context, and pushes its result. Applying a connective (any
/// operator below `CompDifferent`) opens the next math context, so the
/// quantifier-to-slot binding may differ on either side of it.
///
/// Returns the boolean verdict, or an error when the invariant cannot be
/// decided against this view.
pub fn evaluate(
    invariant: &Invariant,
    mapping: &Mapping,
    entries: &[ViewEntry; LV_ENTRIES],
) -> Result<bool, EvalError> {
    let mut stack: Vec<InvNode> = Vec::with_capacity(MAX_STACK_SIZE);
    let mut math_id: u8 = 0;

    for node in &invariant.nodes {
        let op = match node.kind {
            NodeKind::Op(op) => op,
            _ => {
                if stack.len() == MAX_STACK_SIZE {
                    return Err(EvalError::StackOverflow);
                }
                stack.push(*node);
                continue;
            }
        };

        let n2 = stack.pop().ok_or(EvalError::StackUnderflow)?;
        let n1 = stack.pop().ok_or(EvalError::StackUnderflow)?;

        if op.advances_math_context() {
            math_id = math_id.wrapping_add(1);
        }

        let v1 = resolve(entries, mapping, &n1, math_id)?;
        let v2 = resolve(entries, mapping, &n2, math_id)?;
        stack.push(apply(op, &n1, v1, &n2, v2)?);
    }

    match stack.pop().map(|n| n.kind) {
        Some(NodeKind::Bool(b)) => Ok(b),
        Some(NodeKind::Int(v)) => Ok(v != 0),
        _ => Err(EvalError::Malformed),
    }
}

/// Evaluate one disjunct locally against the attribute sensor.
///
/// The disjunct is a flat list of `(attribute, operator, constant)` triples.
/// Every triple that evaluates to false marks the attribute's quantifier
/// position as violated. The conjunction descriptor is then updated for the
/// self-owned positions: a flag owned by another node is never touched here.
fn evaluate_local_conj(
    disjunction: &Invariant,
    attrs: &dyn AttributeReader,
    self_addr: NodeAddr,
    now: Timestamp,
    conj: &mut ViewConj,
) -> Result<(), EvalError> {
    let mut violated = [false; MAX_QUANTIFIERS];

    let mut chunks = disjunction.nodes.chunks_exact(3);
    for triple in &mut chunks {
        let (n1, opn, n2) = (&triple[0], &triple[1], &triple[2]);
        let op = match opn.kind {
            NodeKind::Op(op) => op,
            _ => return Err(EvalError::Malformed),
        };
        let attribute = match n1.kind {
            NodeKind::Attribute(a) => a,
            _ => return Err(EvalError::Malformed),
        };
        let value = attrs
            .get_attribute(attribute.hash)
            .ok_or(EvalError::UnknownAttribute(attribute.hash))?;
        let v2 = match n2.kind {
            NodeKind::Bool(b) => i32::from(b),
            NodeKind::Int(v) => v,
            _ => return Err(EvalError::Malformed),
        };

        let result = apply(op, n1, i32::from(value), n2, v2)?;
        let holds = match result.kind {
            NodeKind::Bool(b) => b,
            NodeKind::Int(v) => v != 0,
            _ => return Err(EvalError::Malformed),
        };
        if !holds {
            trace!(quantifier = attribute.quantifier, "local conjunct violated");
            violated[usize::from(attribute.quantifier)] = true;
        }
    }
    if !chunks.remainder().is_empty() {
        return Err(EvalError::Malformed);
    }

    for q in 0..MAX_QUANTIFIERS {
        if conj.flagged[q] && conj.src[q] != self_addr {
            continue;
        }
        if conj.flagged[q] == violated[q] {
            continue;
        }
        conj.flagged[q] = violated[q];
        conj.src[q] = self_addr;
        conj.ts[q] = now;
    }
    Ok(())
}

/// Refresh every conjunction descriptor from the local attribute readings.
/// A disjunct whose attributes cannot be resolved is left untouched.
pub fn evaluate_local_disjunctions(
    disjunctions: &[Invariant],
    attrs: &dyn AttributeReader,
    self_addr: NodeAddr,
    now: Timestamp,
    conjs: &mut [ViewConj; LV_CONJS],
) {
    for (disjunction, conj) in disjunctions.iter().zip(conjs.iter_mut()) {
        if let Err(err) = evaluate_local_conj(disjunction, attrs, self_addr, now, conj) {
            trace!(%err, "local disjunct skipped");
        }
    }
}

/// Global T1 verdict: a disjunct is complied with iff no quantifier position
/// is both flagged and carries a live timestamp; the predicate holds iff any
/// disjunct complies.
pub fn evaluate_disjunctions(conjs: &[ViewConj], count: usize) -> bool {
    conjs.iter().take(count).any(|conj| {
        !(0..MAX_QUANTIFIERS).any(|q| conj.flagged[q] && !conj.ts[q].is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invariant::InvNode;

    fn entries_with(values: &[(usize, u16)]) -> [ViewEntry; LV_ENTRIES] {
        let mut entries = [ViewEntry::default(); LV_ENTRIES];
        for &(idx, val) in values {
            entries[idx] =
                ViewEntry { val, attr: 1, ts: Timestamp(10), src: NodeAddr(idx as u16 + 1) };
        }
        entries
    }

    fn mapping_two_slots() -> Mapping {
        Mapping::new(vec![
            crate::invariant::MappingEntry { attribute: 1, math_id: 0, quantifier: 0, index: 0 },
            crate::invariant::MappingEntry { attribute: 1, math_id: 0, quantifier: 1, index: 1 },
        ])
    }

    #[test]
    fn arithmetic_then_comparison() {
        // val@0 + 100 - val@1 < 0 with slots 40 and 150: -10 < 0 holds.
        let inv = Invariant::new(
            vec![],
            vec![
                InvNode::attr(1, 0),
                InvNode::int(100),
                InvNode::op(Operator::MathPlus),
                InvNode::attr(1, 1),
                InvNode::op(Operator::MathMinus),
                InvNode::int(0),
                InvNode::op(Operator::CompLower),
            ],
        )
        .unwrap();
        let verdict = evaluate(&inv, &mapping_two_slots(), &entries_with(&[(0, 40), (1, 150)]));
        assert_eq!(verdict, Ok(true));
    }

    #[test]
    fn empty_slot_is_undecided() {
        let inv = Invariant::new(
            vec![],
            vec![InvNode::attr(1, 0), InvNode::int(5), InvNode::op(Operator::CompGreater)],
        )
        .unwrap();
        let verdict = evaluate(&inv, &mapping_two_slots(), &entries_with(&[]));
        assert_eq!(verdict, Err(EvalError::EmptySlot(0)));
    }

    #[test]
    fn unmapped_attribute_is_undecided() {
        let inv = Invariant::new(
            vec![],
            vec![InvNode::attr(7, 0), InvNode::int(5), InvNode::op(Operator::CompGreater)],
        )
        .unwrap();
        let verdict = evaluate(&inv, &mapping_two_slots(), &entries_with(&[(0, 9)]));
        assert!(matches!(verdict, Err(EvalError::UnmappedAttribute { .. })));
    }

    #[test]
    fn underflow_is_malformed() {
        let inv = Invariant::new(vec![], vec![InvNode::op(Operator::BoolAnd)]).unwrap();
        let verdict = evaluate(&inv, &Mapping::default(), &entries_with(&[]));
        assert_eq!(verdict, Err(EvalError::StackUnderflow));
    }

    #[test]
    fn division_by_zero_is_undecided() {
        let inv = Invariant::new(
            vec![],
            vec![InvNode::int(4), InvNode::int(0), InvNode::op(Operator::MathDiv)],
        )
        .unwrap();
        let verdict = evaluate(&inv, &Mapping::default(), &entries_with(&[]));
        assert_eq!(verdict, Err(EvalError::DivisionByZero));
    }

    #[test]
    fn negation_skipped_under_connective() {
        // true AND true, with a negated operand: connectives ignore negation.
        let inv = Invariant::new(
            vec![],
            vec![
                InvNode::boolean(true).negated(),
                InvNode::boolean(true),
                InvNode::op(Operator::BoolAnd),
            ],
        )
        .unwrap();
        assert_eq!(evaluate(&inv, &Mapping::default(), &entries_with(&[])), Ok(true));
    }

    #[test]
    fn negation_applied_to_comparison_operand() {
        // (-5) < 0 via a negated constant.
        let inv = Invariant::new(
            vec![],
            vec![
                InvNode::int(5).negated(),
                InvNode::int(0),
                InvNode::op(Operator::CompLower),
            ],
        )
        .unwrap();
        assert_eq!(evaluate(&inv, &Mapping::default(), &entries_with(&[])), Ok(true));
    }

    #[test]
    fn connective_advances_math_context() {
        // (a@q0 > 5) AND (a@q0 > 7): both comparisons resolve before the AND
        // is applied, so both read math context 0. A mapping that only binds
        // context 0 must satisfy the whole expression.
        let inv = Invariant::new(
            vec![],
            vec![
                InvNode::attr(1, 0),
                InvNode::int(5),
                InvNode::op(Operator::CompGreater),
                InvNode::attr(1, 0),
                InvNode::int(7),
                InvNode::op(Operator::CompGreater),
                InvNode::op(Operator::BoolAnd),
            ],
        )
        .unwrap();
        let mapping = Mapping::new(vec![crate::invariant::MappingEntry {
            attribute: 1,
            math_id: 0,
            quantifier: 0,
            index: 0,
        }]);
        assert_eq!(evaluate(&inv, &mapping, &entries_with(&[(0, 9)])), Ok(true));

        // After the AND is applied the context is 1: a comparison that comes
        // later in postfix order resolves there and needs its own binding.
        let tail = Invariant::new(
            vec![],
            vec![
                InvNode::boolean(true),
                InvNode::boolean(true),
                InvNode::op(Operator::BoolAnd),
                InvNode::attr(1, 0),
                InvNode::int(5),
                InvNode::op(Operator::CompGreater),
                InvNode::op(Operator::BoolAnd),
            ],
        )
        .unwrap();
        let unbound = Mapping::new(vec![crate::invariant::MappingEntry {
            attribute: 1,
            math_id: 0,
            quantifier: 0,
            index: 0,
        }]);
        assert!(matches!(
            evaluate(&tail, &unbound, &entries_with(&[(0, 9)])),
            Err(EvalError::UnmappedAttribute { math_id: 1, .. })
        ));
        let bound = Mapping::new(vec![crate::invariant::MappingEntry {
            attribute: 1,
            math_id: 1,
            quantifier: 0,
            index: 0,
        }]);
        assert_eq!(evaluate(&tail, &bound, &entries_with(&[(0, 9)])), Ok(true));
    }

    #[test]
    fn disjunction_verdict() {
        let mut conjs = [ViewConj::default(); LV_CONJS];
        // One live violation in disjunct 0, disjunct 1 clean: predicate holds.
        conjs[0].flagged[2] = true;
        conjs[0].ts[2] = Timestamp(9);
        assert!(evaluate_disjunctions(&conjs, 2));
        // Every disjunct violated: predicate fails.
        conjs[1].flagged[0] = true;
        conjs[1].ts[0] = Timestamp(11);
        assert!(!evaluate_disjunctions(&conjs, 2));
        // A flag without a live timestamp does not count.
        let mut stale = [ViewConj::default(); LV_CONJS];
        stale[0].flagged[1] = true;
        assert!(evaluate_disjunctions(&stale, 1));
    }
}
