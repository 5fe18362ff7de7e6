//! Negation push-down.
//!
//! After normalization `Not` nodes are gone: negations are pushed to the
//! leaves by De Morgan's laws, join markers flip between exists and
//! not-exists, and negated field tests are rewritten to their complement
//! where one exists. A field test without a complement stays as
//! `Nor([leaf])`, which is the only place `Nor` survives.

use ormdoc_proto::{CompareOp, FieldOp, FilterNode, JoinSpec};

use crate::error::Error;

/// Normalize a filter tree.
pub fn normalize(node: FilterNode) -> Result<FilterNode, Error> {
    push(node, false)
}

fn push(node: FilterNode, negated: bool) -> Result<FilterNode, Error> {
    Ok(match node {
        FilterNode::And(children) if !negated => conjunction(push_all(children, false)?),
        FilterNode::And(children) => disjunction(push_all(children, true)?),
        FilterNode::Or(children) if !negated => disjunction(push_all(children, false)?),
        FilterNode::Or(children) => conjunction(push_all(children, true)?),
        FilterNode::Nor(children) if !negated => conjunction(push_all(children, true)?),
        FilterNode::Nor(children) => disjunction(push_all(children, false)?),
        FilterNode::Not(inner) => push(*inner, !negated)?,
        FilterNode::Field { path, ops } if negated => negate_field(path, ops),
        field @ FilterNode::Field { .. } => field,
        FilterNode::JoinExists(join) => {
            let join = normalize_join(join)?;
            if negated {
                FilterNode::JoinNotExists(join)
            } else {
                FilterNode::JoinExists(join)
            }
        }
        FilterNode::JoinNotExists(join) => {
            let join = normalize_join(join)?;
            if negated {
                FilterNode::JoinExists(join)
            } else {
                FilterNode::JoinNotExists(join)
            }
        }
        FilterNode::Text { .. } if negated => {
            return Err(Error::malformed("$text", "full-text search cannot be negated"));
        }
        text @ FilterNode::Text { .. } => text,
        FilterNode::Const(value) => FilterNode::Const(value != negated),
    })
}

fn push_all(children: Vec<FilterNode>, negated: bool) -> Result<Vec<FilterNode>, Error> {
    children.into_iter().map(|c| push(c, negated)).collect()
}

fn normalize_join(join: JoinSpec) -> Result<JoinSpec, Error> {
    let filter = match join.filter {
        Some(filter) => Some(Box::new(normalize(*filter)?)),
        None => None,
    };
    let nested = join
        .join
        .into_iter()
        .map(normalize_join)
        .collect::<Result<_, _>>()?;
    Ok(JoinSpec {
        filter,
        join: nested,
        ..join
    })
}

fn conjunction(children: Vec<FilterNode>) -> FilterNode {
    let mut flat = Vec::with_capacity(children.len());
    for child in children {
        match child {
            FilterNode::Const(true) => {}
            FilterNode::Const(false) => return FilterNode::Const(false),
            FilterNode::And(inner) => flat.extend(inner),
            other => flat.push(other),
        }
    }
    FilterNode::and(flat)
}

fn disjunction(children: Vec<FilterNode>) -> FilterNode {
    let mut flat = Vec::with_capacity(children.len());
    for child in children {
        match child {
            FilterNode::Const(false) => {}
            FilterNode::Const(true) => return FilterNode::Const(true),
            FilterNode::Or(inner) => flat.extend(inner),
            other => flat.push(other),
        }
    }
    match flat.len() {
        0 => FilterNode::Const(false),
        1 => flat.remove(0),
        _ => FilterNode::Or(flat),
    }
}

/// Negation of a conjunction of ops on one path.
fn negate_field(path: String, ops: Vec<FieldOp>) -> FilterNode {
    let mut negated: Vec<FilterNode> = ops
        .into_iter()
        .map(|op| negate_op(&path, op))
        .collect();
    match negated.len() {
        0 => FilterNode::Const(false),
        1 => negated.remove(0),
        _ => FilterNode::Or(negated),
    }
}

fn negate_op(path: &str, op: FieldOp) -> FilterNode {
    let complement = match op {
        FieldOp::Compare(CompareOp::Eq, operand) => FieldOp::Compare(CompareOp::Ne, operand),
        FieldOp::Compare(CompareOp::Ne, operand) => FieldOp::Compare(CompareOp::Eq, operand),
        FieldOp::In(values) => FieldOp::Nin(values),
        FieldOp::Nin(values) => FieldOp::In(values),
        FieldOp::Exists(flag) => FieldOp::Exists(!flag),
        FieldOp::Not(inner) => {
            return FilterNode::Field {
                path: path.to_string(),
                ops: inner,
            }
        }
        other => return FilterNode::Nor(vec![FilterNode::field(path, other)]),
    };
    FilterNode::field(path, complement)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormdoc_proto::Operand;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn lt(path: &str, v: i64) -> FilterNode {
        FilterNode::field(path, FieldOp::Compare(CompareOp::Lt, Operand::Value(json!(v))))
    }

    #[test]
    fn test_de_morgan() {
        let node = FilterNode::Not(Box::new(FilterNode::And(vec![
            FilterNode::eq("a", 1),
            FilterNode::field("b", FieldOp::In(vec![json!(2)])),
        ])));
        assert_eq!(
            normalize(node).unwrap(),
            FilterNode::Or(vec![
                FilterNode::field("a", FieldOp::Compare(CompareOp::Ne, Operand::Value(json!(1)))),
                FilterNode::field("b", FieldOp::Nin(vec![json!(2)])),
            ])
        );
    }

    #[test]
    fn test_nor_becomes_conjunction() {
        let node = FilterNode::Nor(vec![FilterNode::eq("a", 1), FilterNode::eq("b", 2)]);
        match normalize(node).unwrap() {
            FilterNode::And(children) => assert_eq!(children.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_range_without_complement_stays_nor() {
        let node = FilterNode::Not(Box::new(lt("a", 3)));
        assert_eq!(normalize(node).unwrap(), FilterNode::Nor(vec![lt("a", 3)]));
    }

    #[test]
    fn test_double_negation() {
        let node = FilterNode::Not(Box::new(FilterNode::Not(Box::new(lt("a", 3)))));
        assert_eq!(normalize(node).unwrap(), lt("a", 3));

        let node = FilterNode::Not(Box::new(FilterNode::field(
            "a",
            FieldOp::Not(vec![FieldOp::Exists(true)]),
        )));
        assert_eq!(normalize(node).unwrap(), FilterNode::field("a", FieldOp::Exists(true)));
    }

    #[test]
    fn test_join_markers_flip() {
        let join = JoinSpec::new("t", "a", "b", true)
            .with_filter(FilterNode::Not(Box::new(FilterNode::eq("x", 1))));
        let node = normalize(FilterNode::Not(Box::new(FilterNode::JoinExists(join)))).unwrap();
        let FilterNode::JoinNotExists(join) = node else {
            panic!("expected not-exists");
        };
        assert_eq!(
            join.filter.as_deref(),
            Some(&FilterNode::field(
                "x",
                FieldOp::Compare(CompareOp::Ne, Operand::Value(json!(1)))
            ))
        );
    }

    #[test]
    fn test_constants() {
        assert_eq!(
            normalize(FilterNode::Not(Box::new(FilterNode::Const(true)))).unwrap(),
            FilterNode::Const(false)
        );
        assert_eq!(normalize(FilterNode::Or(vec![])).unwrap(), FilterNode::Const(false));
        assert_eq!(
            normalize(FilterNode::And(vec![FilterNode::Const(true), FilterNode::eq("a", 1)])).unwrap(),
            FilterNode::eq("a", 1)
        );
    }

    #[test]
    fn test_negated_text_rejected() {
        let node = FilterNode::Not(Box::new(FilterNode::Text {
            search: "x".into(),
            language: None,
        }));
        assert!(matches!(normalize(node), Err(Error::MalformedFilter { .. })));
    }
}
