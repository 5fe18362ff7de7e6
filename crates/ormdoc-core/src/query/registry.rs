//! Join registry.
//!
//! Every join marker of a filter resolves to exactly one registered join.
//! Markers with the same identity (table, local field, foreign field,
//! cardinality and enclosing join) share a lookup and its alias.

use std::collections::HashSet;

use ormdoc_proto::JoinSpec;
use serde_json::Value;
use tracing::trace;

/// A computed array size projected right after a lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct SizeProbe {
    /// Output field.
    pub field: String,
    /// Row condition over `$$r`; `None` counts every related document.
    pub filter: Option<Value>,
}

/// A join as it will appear in the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredJoin {
    /// Related collection.
    pub table: String,
    /// Local field, qualified with the parent alias for nested joins.
    pub left: String,
    /// Foreign field.
    pub right: String,
    /// Whether the local field holds an array of foreign keys.
    pub many: bool,
    /// Field the lookup result is stored under.
    pub alias: String,
    /// Alias of the enclosing join.
    pub parent: Option<String>,
    /// Only the size of the lookup result is read; the alias is not unwound.
    pub exists_only: bool,
    /// Other joins start from this one.
    pub has_nested: bool,
    /// Size probes to project after the lookup.
    pub probes: Vec<SizeProbe>,
    local: String,
}

impl RegisteredJoin {
    fn same_identity(&self, join: &JoinSpec, parent: Option<&str>) -> bool {
        self.table == join.table
            && self.local == join.left
            && self.right == join.right
            && self.many == join.many
            && self.parent.as_deref() == parent
    }
}

/// Registry of the joins of one query.
///
/// Each compilation gets its own registry; aliases are only unique within it.
#[derive(Debug, Clone)]
pub struct JoinRegistry {
    joins: Vec<RegisteredJoin>,
    reserved: HashSet<String>,
    size_suffix: String,
}

impl JoinRegistry {
    /// Create a registry. `reserved` names (stored attributes) are never used as aliases.
    pub fn new(reserved: impl IntoIterator<Item = String>, size_suffix: impl Into<String>) -> Self {
        Self {
            joins: Vec::new(),
            reserved: reserved.into_iter().collect(),
            size_suffix: size_suffix.into(),
        }
    }

    /// Resolve a join marker to its registered join, registering it if new.
    ///
    /// Returns the alias. `needs_values` marks that fields of related documents
    /// are read, which makes the join unwound.
    pub fn register(&mut self, join: &JoinSpec, parent: Option<&str>, needs_values: bool) -> String {
        if let Some(existing) = self
            .joins
            .iter_mut()
            .find(|j| j.same_identity(join, parent))
        {
            if needs_values {
                existing.exists_only = false;
            }
            return existing.alias.clone();
        }

        let hint = join.alias.as_deref().unwrap_or(&join.table).to_string();
        let alias = self.unique_name(&hint);
        let left = match parent {
            Some(parent) => format!("{}.{}", parent, join.left),
            None => join.left.clone(),
        };
        trace!(alias = %alias, table = %join.table, left = %left, "Registered join");
        self.joins.push(RegisteredJoin {
            table: join.table.clone(),
            left,
            right: join.right.clone(),
            many: join.many,
            alias: alias.clone(),
            parent: parent.map(str::to_string),
            exists_only: !needs_values,
            has_nested: false,
            probes: Vec::new(),
            local: join.left.clone(),
        });

        if let Some(parent) = parent {
            if let Some(p) = self.joins.iter_mut().find(|j| j.alias == parent) {
                p.has_nested = true;
                p.exists_only = false;
            }
        }
        alias
    }

    /// Request a size probe on a registered join and return its field name.
    ///
    /// Probes with the same condition are shared.
    pub fn probe(&mut self, alias: &str, filter: Option<Value>) -> Option<String> {
        let index = self.joins.iter().position(|j| j.alias == alias)?;
        if let Some(existing) = self.joins[index].probes.iter().find(|p| p.filter == filter) {
            return Some(existing.field.clone());
        }

        let base = format!("{}{}", alias, self.size_suffix);
        let field = match filter {
            None => self.unique_name(&base),
            Some(_) => {
                let n = self.joins[index]
                    .probes
                    .iter()
                    .filter(|p| p.filter.is_some())
                    .count();
                self.unique_name(&format!("{}{}", base, n + 1))
            }
        };
        self.joins[index].probes.push(SizeProbe {
            field: field.clone(),
            filter,
        });
        Some(field)
    }

    /// Registered joins in pipeline order.
    pub fn joins(&self) -> &[RegisteredJoin] {
        &self.joins
    }

    /// Check whether no join was registered.
    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Check whether a name is the alias of a registered join.
    pub fn is_alias(&self, name: &str) -> bool {
        self.joins.iter().any(|j| j.alias == name)
    }

    /// Check whether any registered join is unwound.
    pub fn unwinds(&self) -> bool {
        self.joins.iter().any(|j| !j.exists_only)
    }

    fn is_taken(&self, name: &str) -> bool {
        self.reserved.contains(name)
            || self
                .joins
                .iter()
                .any(|j| j.alias == name || j.probes.iter().any(|p| p.field == name))
    }

    fn unique_name(&self, hint: &str) -> String {
        if !self.is_taken(hint) {
            return hint.to_string();
        }
        (1..)
            .map(|n| format!("{}_{}", hint, n))
            .find(|candidate| !self.is_taken(candidate))
            .unwrap_or_else(|| hint.to_string())
    }
}
