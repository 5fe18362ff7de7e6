//! Free-text search expansion.
//!
//! A search term becomes a domain filter: an `$or` of pattern matches on
//! indexed text attributes, exact matches on numbers and dates the term
//! parses as, selection-list memberships, and searches through references
//! and collections up to a depth.

use ormdoc_proto::value::date_value;
use ormdoc_proto::SearchRequest;
use regex::{Regex, RegexBuilder};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::dates::parse_localized_date;
use crate::catalog::{ClassMeta, ClassMetaProvider, PropertyMeta, PropertyType, SelectionItem, SelectionProvider};
use crate::config::CompilerConfig;
use crate::error::Error;

/// Pattern matching the words of a term in order, separated by any whitespace.
pub fn term_pattern(term: &str) -> String {
    term.split_whitespace()
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"\s+")
}

struct Term<'t> {
    text: &'t str,
    language: Option<&'t str>,
    pattern: String,
    matcher: Regex,
}

#[derive(Default)]
struct Branches {
    items: Vec<Value>,
    cross_table: bool,
    full_text: bool,
}

/// Expands search requests into domain filters.
pub struct SearchBuilder<'a> {
    provider: &'a dyn ClassMetaProvider,
    config: &'a CompilerConfig,
}

impl<'a> SearchBuilder<'a> {
    /// Create a builder.
    pub fn new(provider: &'a dyn ClassMetaProvider, config: &'a CompilerConfig) -> Self {
        Self { provider, config }
    }

    /// Build the domain filter of a search over `cm`.
    ///
    /// A term matching nothing yields an empty `$or`, which selects no rows.
    pub fn build(&self, cm: &ClassMeta, request: &SearchRequest) -> Result<Value, Error> {
        let text = request.term.trim();
        let pattern = term_pattern(text);
        let matcher = RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::malformed("$search", e.to_string()))?;
        let term = Term {
            text,
            language: request.language.as_deref(),
            pattern,
            matcher,
        };

        let attributes = if request.attributes.is_empty() {
            cm.search_attributes()
        } else {
            request.attributes.clone()
        };
        let depth = request.depth.unwrap_or(self.config.search_depth);

        let mut branches = Branches::default();
        if !text.is_empty() {
            self.collect(cm, &attributes, &term, "", depth, &mut branches)?;
        }

        if self.config.full_text && branches.full_text && !text.is_empty() {
            if branches.cross_table {
                debug!(
                    class = %cm.canonical_name(),
                    "Full-text clause dropped next to cross-table search branches"
                );
            } else {
                let mut clause = Map::new();
                clause.insert("$search".into(), Value::String(text.to_string()));
                if let Some(language) = term.language {
                    clause.insert("$language".into(), Value::String(language.to_string()));
                }
                branches.items.push(json!({"$text": clause}));
            }
        }

        debug!(
            class = %cm.canonical_name(),
            branches = branches.items.len(),
            "Expanded search"
        );
        Ok(json!({"$or": branches.items}))
    }

    fn collect(
        &self,
        cm: &ClassMeta,
        attributes: &[String],
        term: &Term<'_>,
        prefix: &str,
        depth: usize,
        out: &mut Branches,
    ) -> Result<(), Error> {
        for name in attributes {
            let pm = cm.property_meta(name).ok_or_else(|| Error::UnknownProperty {
                class: cm.canonical_name(),
                property: name.clone(),
            })?;
            let key = format!("{}{}", prefix, pm.name);
            if prefix.is_empty() && pm.index_search {
                out.full_text = true;
            }

            if let Some(selection) = &pm.selection {
                self.selection(&key, prefix, selection, term, out);
                continue;
            }

            match pm.property_type {
                PropertyType::Int | PropertyType::Real | PropertyType::Decimal => {
                    if let Some(number) = exact_number(term.text) {
                        out.items.push(json!({ key: number }));
                    }
                }
                PropertyType::DateTime => {
                    if let Some(dt) = parse_localized_date(term.text, term.language) {
                        out.items.push(json!({ key: date_value(dt) }));
                    }
                }
                PropertyType::Reference if depth > 0 => {
                    if let Some(target) = self.joinable_target(cm, pm) {
                        let nested = format!("{}.", key);
                        let before = out.items.len();
                        self.collect(&target, &target.search_attributes(), term, &nested, depth - 1, out)?;
                        if out.items.len() > before {
                            out.cross_table = true;
                        }
                    }
                }
                PropertyType::Collection if depth > 0 => {
                    if let Some(target) = self.joinable_target(cm, pm) {
                        let mut inner = Branches::default();
                        self.collect(&target, &target.search_attributes(), term, "", depth - 1, &mut inner)?;
                        if !inner.items.is_empty() {
                            out.items.push(json!({ key: {"$contains": {"$or": inner.items}} }));
                            out.cross_table = true;
                        }
                    }
                }
                _ if searchable_text(pm) => {
                    out.items.push(json!({ key: {"$regex": term.pattern, "$options": "i"} }));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn selection(&self, key: &str, prefix: &str, selection: &SelectionProvider, term: &Term<'_>, out: &mut Branches) {
        match selection {
            SelectionProvider::Simple { items } => {
                let keys = matching_keys(items, &term.matcher);
                if !keys.is_empty() {
                    out.items.push(json!({ key: {"$in": keys} }));
                }
            }
            SelectionProvider::Matrix { entries } => {
                for entry in entries {
                    let keys = matching_keys(&entry.items, &term.matcher);
                    if keys.is_empty() {
                        continue;
                    }
                    let mut conditions = Map::new();
                    if let Value::Object(given) = &entry.conditions {
                        for (attr, value) in given {
                            conditions.insert(format!("{}{}", prefix, attr), value.clone());
                        }
                    }
                    out.items.push(json!({"$and": [conditions, { key: {"$in": keys} }]}));
                }
            }
        }
    }

    /// Target class of a relation the translator can join through.
    fn joinable_target(&self, cm: &ClassMeta, pm: &PropertyMeta) -> Option<std::sync::Arc<ClassMeta>> {
        let target = self.provider.ref_class(cm, pm)?;
        if pm.back_ref.is_none() && target.key_properties().len() > 1 {
            return None;
        }
        Some(target)
    }
}

fn searchable_text(pm: &PropertyMeta) -> bool {
    pm.property_type.is_string_like()
        && (pm.indexed || pm.unique || pm.index_search)
        && !pm.autoassigned
        && !pm.is_formula()
}

/// The term as a number, when it is written exactly as the number prints.
fn exact_number(term: &str) -> Option<Value> {
    let number: f64 = term.parse().ok()?;
    if !number.is_finite() || number.to_string() != term {
        return None;
    }
    if number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
        Some(json!(number as i64))
    } else {
        Some(json!(number))
    }
}

fn matching_keys(items: &[SelectionItem], matcher: &Regex) -> Vec<Value> {
    items
        .iter()
        .filter(|item| matcher.is_match(&item.value))
        .map(|item| item.key.clone())
        .collect()
}
