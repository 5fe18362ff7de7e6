//! Filter partitioning.
//!
//! A single visitor classifies every node of a normalized filter as one of
//! [`Piece::Kept`] (evaluable before any lookup), [`Piece::Deferred`]
//! (reads a join alias or a size probe) or [`Piece::Dropped`] (no
//! constraint). Each fragment carries both its query-language form and its
//! expression form, so the pre-match, post-match and redact outputs are
//! built from the same classification.

use ormdoc_proto::filter::{field_expr, field_query, text_query};
use ormdoc_proto::{Document, FilterNode, JoinSpec};
use serde_json::{json, Value};
use tracing::debug;

use super::registry::JoinRegistry;
use crate::error::Error;

/// Output of the partitioner.
#[derive(Debug, Clone)]
pub struct Partition {
    /// Conditions evaluable on the source collection.
    pub pre_match: Option<Document>,
    /// Conditions on unwound join aliases.
    pub post_match: Option<Document>,
    /// Conditions on size probes, as a boolean expression.
    pub redact: Option<Value>,
    /// Joins the remaining conditions need.
    pub registry: JoinRegistry,
}

/// Classification of a filter node.
#[derive(Debug, Clone, PartialEq)]
pub enum Piece {
    Kept(Fragment),
    Dropped,
    Deferred(Fragment),
}

/// A rendered condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    /// Query-language form.
    pub query: Document,
    /// Expression form; `None` when the condition has none (geo, full text).
    pub expr: Option<Value>,
    /// Reads a size probe.
    pub probe: bool,
    /// Contains a full-text clause.
    pub text: bool,
}

impl Fragment {
    fn new(query: Document, expr: Option<Value>) -> Self {
        Self {
            query,
            expr,
            probe: false,
            text: false,
        }
    }

    fn constant(value: bool) -> Self {
        let mut query = Document::new();
        query.insert("$expr".into(), Value::Bool(value));
        Self::new(query, Some(Value::Bool(value)))
    }

    fn probe(field: &str, empty: bool) -> Self {
        let (query, expr) = if empty {
            (json!({ field: 0 }), json!({"$eq": [format!("${}", field), 0]}))
        } else {
            (json!({ field: {"$ne": 0} }), json!({"$ne": [format!("${}", field), 0]}))
        };
        Self {
            query: into_document(query),
            expr: Some(expr),
            probe: true,
            text: false,
        }
    }

    fn combine(op: &str, parts: Vec<Fragment>) -> Fragment {
        let probe = parts.iter().any(|p| p.probe);
        let text = parts.iter().any(|p| p.text);
        let expr = parts
            .iter()
            .map(|p| p.expr.clone())
            .collect::<Option<Vec<_>>>()
            .map(|exprs| json!({ op: exprs }));
        let queries: Vec<Document> = parts.into_iter().map(|p| p.query).collect();
        let query = if op == "$and" {
            conjoin(queries)
        } else {
            into_document(json!({ op: queries }))
        };
        Fragment {
            query,
            expr,
            probe,
            text,
        }
    }

    fn negate(self) -> Fragment {
        Fragment {
            query: into_document(json!({"$nor": [self.query]})),
            expr: self.expr.map(|e| json!({"$not": [e]})),
            probe: self.probe,
            text: self.text,
        }
    }
}

/// Where a condition is evaluated.
#[derive(Debug, Clone, Copy)]
enum Scope<'s> {
    Root,
    Join(&'s str),
}

impl Scope<'_> {
    fn qualify(&self, path: &str) -> String {
        match self {
            Scope::Root => path.to_string(),
            Scope::Join(alias) => format!("{}.{}", alias, path),
        }
    }

    fn alias(&self) -> Option<&str> {
        match self {
            Scope::Root => None,
            Scope::Join(alias) => Some(alias),
        }
    }
}

/// Splits a normalized filter around the lookups it needs.
pub struct Partitioner {
    registry: JoinRegistry,
}

impl Partitioner {
    /// Create a partitioner registering joins into `registry`.
    pub fn new(registry: JoinRegistry) -> Self {
        Self { registry }
    }

    /// Partition a normalized filter.
    pub fn partition(mut self, node: &FilterNode) -> Result<Partition, Error> {
        self.register_all(node, None);

        let conjuncts: Vec<&FilterNode> = match node {
            FilterNode::And(children) => children.iter().collect(),
            other => vec![other],
        };

        let mut kept = Vec::new();
        let mut post = Vec::new();
        let mut redact = Vec::new();
        for piece in self.classify_conjuncts(conjuncts, Scope::Root)? {
            match piece {
                Piece::Kept(fragment) => kept.push(fragment.query),
                Piece::Dropped => {}
                Piece::Deferred(fragment) => {
                    if fragment.text {
                        return Err(Error::malformed(
                            "$text",
                            "full-text search cannot be combined with a join condition",
                        ));
                    }
                    if fragment.probe {
                        let expr = fragment.expr.ok_or_else(|| {
                            Error::malformed("$redact", "condition has no expression form")
                        })?;
                        redact.push(expr);
                    } else {
                        post.push(fragment.query);
                    }
                }
            }
        }

        let redact = match redact.len() {
            0 => None,
            1 => redact.pop(),
            _ => Some(json!({ "$and": redact })),
        };
        let partition = Partition {
            pre_match: non_empty(conjoin(kept)),
            post_match: non_empty(conjoin(post)),
            redact,
            registry: self.registry,
        };
        debug!(
            joins = partition.registry.joins().len(),
            pre_match = partition.pre_match.is_some(),
            post_match = partition.post_match.is_some(),
            redact = partition.redact.is_some(),
            "Partitioned filter"
        );
        Ok(partition)
    }

    /// Register joins up front so alias references are recognised wherever they appear.
    fn register_all(&mut self, node: &FilterNode, parent: Option<&str>) {
        match node {
            FilterNode::And(children) | FilterNode::Or(children) | FilterNode::Nor(children) => {
                for child in children {
                    self.register_all(child, parent);
                }
            }
            FilterNode::Not(inner) => self.register_all(inner, parent),
            FilterNode::JoinExists(join) => self.register_exists(join, parent),
            FilterNode::JoinNotExists(join) => {
                self.registry.register(join, parent, false);
            }
            _ => {}
        }
    }

    fn register_exists(&mut self, join: &JoinSpec, parent: Option<&str>) {
        let alias = self
            .registry
            .register(join, parent, !join.is_existence_only());
        if let Some(filter) = &join.filter {
            self.register_all(filter, Some(&alias));
        }
        for nested in &join.join {
            self.register_exists(nested, Some(&alias));
        }
    }

    fn classify(&mut self, node: &FilterNode, scope: Scope<'_>) -> Result<Piece, Error> {
        match node {
            FilterNode::Const(true) => Ok(Piece::Dropped),
            FilterNode::Const(false) => Ok(self.place(Fragment::constant(false), scope, None)),
            FilterNode::Field { path, ops } => {
                let qualified = scope.qualify(path);
                let reference = |p: &str| format!("${}", scope.qualify(p));
                let query = field_query(&qualified, ops, &reference)?;
                let expr = field_expr(&Value::String(format!("${}", qualified)), ops, &reference)?;
                Ok(self.place(Fragment::new(query, expr), scope, Some(path)))
            }
            FilterNode::Text { search, language } => {
                if scope.alias().is_some() {
                    return Err(Error::malformed(
                        "$text",
                        "full-text search applies to the queried class only",
                    ));
                }
                let mut fragment = Fragment::new(text_query(search, language.as_deref()), None);
                fragment.text = true;
                Ok(Piece::Kept(fragment))
            }
            FilterNode::And(children) => {
                let mut deferred = false;
                let mut parts = Vec::with_capacity(children.len());
                for piece in self.classify_conjuncts(children, scope)? {
                    match piece {
                        Piece::Kept(f) => parts.push(f),
                        Piece::Deferred(f) => {
                            deferred = true;
                            parts.push(f);
                        }
                        Piece::Dropped => {}
                    }
                }
                Ok(match parts.len() {
                    0 => Piece::Dropped,
                    _ => wrap(Fragment::combine("$and", parts), deferred),
                })
            }
            FilterNode::Or(children) => {
                let mut deferred = false;
                let mut parts = Vec::with_capacity(children.len());
                for child in children {
                    match self.classify(child, scope)? {
                        Piece::Kept(f) => parts.push(f),
                        Piece::Deferred(f) => {
                            deferred = true;
                            parts.push(f);
                        }
                        Piece::Dropped => return Ok(Piece::Dropped),
                    }
                }
                if parts.is_empty() {
                    return Ok(self.place(Fragment::constant(false), scope, None));
                }
                Ok(wrap(Fragment::combine("$or", parts), deferred))
            }
            FilterNode::Nor(children) => {
                let mut deferred = false;
                let mut parts = Vec::with_capacity(children.len());
                for child in children {
                    match self.classify(child, scope)? {
                        Piece::Kept(f) => parts.push(f),
                        Piece::Deferred(f) => {
                            deferred = true;
                            parts.push(f);
                        }
                        Piece::Dropped => {
                            return Ok(self.place(Fragment::constant(false), scope, None))
                        }
                    }
                }
                let inner = match parts.len() {
                    0 => return Ok(Piece::Dropped),
                    1 => parts.remove(0),
                    _ => Fragment::combine("$or", parts),
                };
                Ok(wrap(inner.negate(), deferred))
            }
            FilterNode::Not(inner) => Ok(match self.classify(inner, scope)? {
                Piece::Kept(f) => Piece::Kept(f.negate()),
                Piece::Deferred(f) => Piece::Deferred(f.negate()),
                Piece::Dropped => self.place(Fragment::constant(false), scope, None),
            }),
            FilterNode::JoinExists(join) => self.join_exists(join, scope),
            FilterNode::JoinNotExists(join) => self.join_not_exists(join, scope),
        }
    }

    /// Classify the members of a conjunction.
    ///
    /// Once a conjunct reads the rows of an unwound join, a further conjunct
    /// with a different condition on the same join is tested through a
    /// filtered size probe instead, so the two may hold on different related
    /// documents.
    fn classify_conjuncts<'n>(
        &mut self,
        nodes: impl IntoIterator<Item = &'n FilterNode>,
        scope: Scope<'_>,
    ) -> Result<Vec<Piece>, Error> {
        let mut claimed: Vec<(String, &'n JoinSpec)> = Vec::new();
        let mut pieces = Vec::new();
        for node in nodes {
            if let FilterNode::JoinExists(join) = node {
                if !join.is_existence_only() {
                    let alias = self.registry.register(join, scope.alias(), true);
                    let conflicts = claimed.iter().any(|(a, other)| {
                        *a == alias && (other.filter != join.filter || other.join != join.join)
                    });
                    if conflicts && is_countable(join) {
                        pieces.push(self.join_counted(join, &alias)?);
                        continue;
                    }
                    claimed.push((alias, join));
                }
            }
            pieces.push(self.classify(node, scope)?);
        }
        Ok(pieces)
    }

    /// Kept at the root unless the path starts with a join alias.
    fn place(&self, fragment: Fragment, scope: Scope<'_>, path: Option<&str>) -> Piece {
        let crosses_alias = path
            .and_then(|p| p.split('.').next())
            .is_some_and(|head| self.registry.is_alias(head));
        if scope.alias().is_some() || crosses_alias {
            Piece::Deferred(fragment)
        } else {
            Piece::Kept(fragment)
        }
    }

    fn join_exists(&mut self, join: &JoinSpec, scope: Scope<'_>) -> Result<Piece, Error> {
        if join.is_existence_only() {
            let alias = self.registry.register(join, scope.alias(), false);
            let probe = self.probe(&alias, None)?;
            return Ok(Piece::Deferred(Fragment::probe(&probe, false)));
        }

        let alias = self.registry.register(join, scope.alias(), true);
        let inner = Scope::Join(&alias);
        let mut parts = vec![Fragment::new(
            into_document(json!({ alias.as_str(): {"$exists": true} })),
            Some(json!({"$ne": [{"$type": format!("${}", alias)}, "missing"]})),
        )];
        if let Some(filter) = &join.filter {
            match self.classify(filter, inner)? {
                Piece::Kept(f) | Piece::Deferred(f) => parts.push(f),
                Piece::Dropped => {}
            }
        }
        for nested in &join.join {
            match self.join_exists(nested, inner)? {
                Piece::Kept(f) | Piece::Deferred(f) => parts.push(f),
                Piece::Dropped => {}
            }
        }
        Ok(Piece::Deferred(Fragment::combine("$and", parts)))
    }

    fn join_not_exists(&mut self, join: &JoinSpec, scope: Scope<'_>) -> Result<Piece, Error> {
        let nested = !join.join.is_empty() || join.filter.as_ref().is_some_and(|f| f.has_join());
        if nested {
            return Err(Error::unsupported_join(
                &join.table,
                &join.left,
                "a negated join cannot contain further joins",
            ));
        }

        let alias = self.registry.register(join, scope.alias(), false);
        let condition = match &join.filter {
            Some(filter) => Some(row_expr(filter)?),
            None => None,
        };
        let probe = self.probe(&alias, condition)?;
        Ok(Piece::Deferred(Fragment::probe(&probe, true)))
    }

    fn join_counted(&mut self, join: &JoinSpec, alias: &str) -> Result<Piece, Error> {
        let condition = match &join.filter {
            Some(filter) => Some(row_expr(filter)?),
            None => None,
        };
        let probe = self.probe(alias, condition)?;
        debug!(alias, probe = %probe, "Testing repeated join through size probe");
        Ok(Piece::Deferred(Fragment::probe(&probe, false)))
    }

    fn probe(&mut self, alias: &str, condition: Option<Value>) -> Result<String, Error> {
        self.registry
            .probe(alias, condition)
            .ok_or_else(|| Error::malformed("$joinExists", format!("unknown join alias {}", alias)))
    }
}

/// Render a join-free filter as a per-row expression over `$$r`.
fn row_expr(node: &FilterNode) -> Result<Value, Error> {
    let all = |children: &[FilterNode]| children.iter().map(row_expr).collect::<Result<Vec<_>, _>>();
    Ok(match node {
        FilterNode::And(children) => json!({"$and": all(children)?}),
        FilterNode::Or(children) => json!({"$or": all(children)?}),
        FilterNode::Nor(children) => json!({"$not": [{"$or": all(children)?}]}),
        FilterNode::Not(inner) => json!({"$not": [row_expr(inner)?]}),
        FilterNode::Field { path, ops } => {
            let reference = |p: &str| format!("$$r.{}", p);
            let field = Value::String(reference(path));
            field_expr(&field, ops, &reference)?.ok_or_else(|| {
                Error::malformed(path, "condition has no expression form")
            })?
        }
        FilterNode::Const(value) => Value::Bool(*value),
        FilterNode::Text { .. } => {
            return Err(Error::malformed(
                "$text",
                "full-text search applies to the queried class only",
            ))
        }
        FilterNode::JoinExists(join) | FilterNode::JoinNotExists(join) => {
            return Err(Error::unsupported_join(
                &join.table,
                &join.left,
                "a negated join cannot contain further joins",
            ))
        }
    })
}

/// Render a join-free normalized filter as a query document.
pub fn render_query(node: &FilterNode) -> Result<Document, Error> {
    if let Some(join) = find_join(node) {
        return Err(Error::unsupported_join(
            &join.table,
            &join.left,
            "joins are not allowed here",
        ));
    }
    let partitioner = Partitioner::new(JoinRegistry::new(Vec::new(), ""));
    let partition = partitioner.partition(node)?;
    Ok(partition.pre_match.unwrap_or_default())
}

fn find_join(node: &FilterNode) -> Option<&JoinSpec> {
    match node {
        FilterNode::JoinExists(join) | FilterNode::JoinNotExists(join) => Some(join),
        FilterNode::And(children) | FilterNode::Or(children) | FilterNode::Nor(children) => {
            children.iter().find_map(find_join)
        }
        FilterNode::Not(inner) => find_join(inner),
        _ => None,
    }
}

/// A join whose condition can be counted over the lookup result before unwinding.
///
/// Arrays of stored keys are unwound before their lookup, so their probes
/// only see one related document per row.
fn is_countable(join: &JoinSpec) -> bool {
    !join.many && join.join.is_empty() && !join.filter.as_ref().is_some_and(|f| f.has_join())
}

fn wrap(fragment: Fragment, deferred: bool) -> Piece {
    if deferred {
        Piece::Deferred(fragment)
    } else {
        Piece::Kept(fragment)
    }
}

/// Conjunction of query documents, merging them when their keys are disjoint.
pub(crate) fn conjoin(mut queries: Vec<Document>) -> Document {
    queries.retain(|q| !q.is_empty());
    if queries.len() == 1 {
        return queries.remove(0);
    }
    let mut merged = Document::new();
    for query in &queries {
        if query.keys().any(|k| merged.contains_key(k)) {
            return into_document(json!({ "$and": queries }));
        }
        merged.extend(query.clone());
    }
    merged
}

fn non_empty(doc: Document) -> Option<Document> {
    if doc.is_empty() {
        None
    } else {
        Some(doc)
    }
}

fn into_document(value: Value) -> Document {
    match value {
        Value::Object(doc) => doc,
        _ => Document::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormdoc_proto::{CompareOp, FieldOp, Operand};
    use pretty_assertions::assert_eq;

    fn registry() -> JoinRegistry {
        JoinRegistry::new(vec!["_id".to_string(), "status".to_string()], "_size")
    }

    fn items() -> JoinSpec {
        JoinSpec::new("OrderLine", "_id", "orderId", false).with_alias("items")
    }

    fn qty_gt(n: i64) -> FilterNode {
        FilterNode::field("qty", FieldOp::Compare(CompareOp::Gt, Operand::Value(json!(n))))
    }

    #[test]
    fn test_plain_filter_is_kept() {
        let node = FilterNode::And(vec![FilterNode::eq("status", "open"), qty_gt(1)]);
        let p = Partitioner::new(registry()).partition(&node).unwrap();
        assert_eq!(Value::Object(p.pre_match.unwrap()), json!({"status": "open", "qty": {"$gt": 1}}));
        assert!(p.post_match.is_none());
        assert!(p.redact.is_none());
        assert!(p.registry.is_empty());
    }

    #[test]
    fn test_contains_is_deferred() {
        let node = FilterNode::And(vec![
            FilterNode::eq("status", "open"),
            FilterNode::JoinExists(items().with_filter(qty_gt(5))),
        ]);
        let p = Partitioner::new(registry()).partition(&node).unwrap();
        assert_eq!(Value::Object(p.pre_match.unwrap()), json!({"status": "open"}));
        assert_eq!(
            Value::Object(p.post_match.unwrap()),
            json!({"items": {"$exists": true}, "items.qty": {"$gt": 5}})
        );
        assert!(!p.registry.joins()[0].exists_only);
    }

    #[test]
    fn test_or_with_empty_collection() {
        let node = FilterNode::Or(vec![
            FilterNode::eq("status", "open"),
            FilterNode::JoinNotExists(items()),
        ]);
        let p = Partitioner::new(registry()).partition(&node).unwrap();
        assert!(p.pre_match.is_none());
        assert!(p.post_match.is_none());
        assert_eq!(
            p.redact.unwrap(),
            json!({"$or": [
                {"$eq": ["$status", "open"]},
                {"$eq": ["$items_size", 0]}
            ]})
        );
        let join = &p.registry.joins()[0];
        assert!(join.exists_only);
        assert_eq!(join.probes[0].field, "items_size");
    }

    #[test]
    fn test_unconstrained_or_branch_is_dropped() {
        let node = FilterNode::And(vec![
            FilterNode::Or(vec![FilterNode::Const(true), FilterNode::JoinExists(items())]),
            FilterNode::eq("status", "open"),
        ]);
        let p = Partitioner::new(registry()).partition(&node).unwrap();
        assert_eq!(Value::Object(p.pre_match.unwrap()), json!({"status": "open"}));
        assert!(p.redact.is_none());
    }

    #[test]
    fn test_second_contains_on_same_join_is_counted() {
        let node = FilterNode::And(vec![
            FilterNode::JoinExists(items().with_filter(FilterNode::eq("qty", 2))),
            FilterNode::JoinExists(items().with_filter(FilterNode::eq("qty", 9))),
        ]);
        let p = Partitioner::new(registry()).partition(&node).unwrap();
        assert_eq!(p.registry.joins().len(), 1);
        assert_eq!(
            Value::Object(p.post_match.unwrap()),
            json!({"items": {"$exists": true}, "items.qty": 2})
        );
        assert_eq!(p.redact.unwrap(), json!({"$ne": ["$items_size1", 0]}));
        let join = &p.registry.joins()[0];
        assert!(!join.exists_only);
        assert_eq!(join.probes[0].filter, Some(json!({"$eq": ["$$r.qty", 9]})));
    }

    #[test]
    fn test_repeated_identical_contains_shares_rows() {
        let clause = FilterNode::JoinExists(items().with_filter(qty_gt(5)));
        let node = FilterNode::And(vec![clause.clone(), clause]);
        let p = Partitioner::new(registry()).partition(&node).unwrap();
        assert!(p.redact.is_none());
        assert!(p.registry.joins()[0].probes.is_empty());
    }

    #[test]
    fn test_filtered_not_exists_probe() {
        let node = FilterNode::JoinNotExists(items().with_filter(qty_gt(5)));
        let p = Partitioner::new(registry()).partition(&node).unwrap();
        assert_eq!(p.redact.unwrap(), json!({"$eq": ["$items_size1", 0]}));
        assert_eq!(
            p.registry.joins()[0].probes[0].filter,
            Some(json!({"$gt": ["$$r.qty", 5]}))
        );
    }

    #[test]
    fn test_nested_not_exists_rejected() {
        let node = FilterNode::JoinNotExists(items().with_filter(FilterNode::JoinExists(
            JoinSpec::new("Product", "product", "_id", false),
        )));
        let err = Partitioner::new(registry()).partition(&node).unwrap_err();
        assert!(matches!(err, Error::UnsupportedJoin { .. }));
    }

    #[test]
    fn test_text_next_to_join_rejected() {
        let node = FilterNode::Or(vec![
            FilterNode::Text {
                search: "bolt".into(),
                language: None,
            },
            FilterNode::JoinExists(items().with_filter(qty_gt(5))),
        ]);
        let err = Partitioner::new(registry()).partition(&node).unwrap_err();
        assert!(matches!(err, Error::MalformedFilter { .. }));
    }

    #[test]
    fn test_negated_leaf() {
        let node = FilterNode::Nor(vec![qty_gt(3)]);
        let p = Partitioner::new(registry()).partition(&node).unwrap();
        assert_eq!(
            Value::Object(p.pre_match.unwrap()),
            json!({"$nor": [{"qty": {"$gt": 3}}]})
        );
    }

    #[test]
    fn test_render_query_rejects_joins() {
        assert!(render_query(&FilterNode::JoinExists(items())).is_err());
        assert_eq!(
            Value::Object(render_query(&FilterNode::eq("a", 1)).unwrap()),
            json!({"a": 1})
        );
    }
}
