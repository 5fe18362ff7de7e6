//! Aggregation pipeline stages.
//!
//! Stages serialize to the document store's native form, one single-key
//! object per stage (`{"$match": {...}}`, `{"$lookup": {...}}`, ...).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::value::Document;

/// A `$lookup` stage body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lookup {
    /// Related collection.
    pub from: String,
    /// Field of the input document.
    pub local_field: String,
    /// Field of the related document.
    pub foreign_field: String,
    /// Output array field.
    #[serde(rename = "as")]
    pub as_field: String,
}

/// An `$unwind` stage body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unwind {
    /// `$`-prefixed path of the array to unwind.
    pub path: String,
    /// Keep documents whose array is missing, null or empty.
    #[serde(default)]
    pub preserve_null_and_empty_arrays: bool,
}

/// A `$group` stage body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Grouping key expression.
    #[serde(rename = "_id")]
    pub id: Value,
    /// Output field name to accumulator expression.
    #[serde(flatten)]
    pub accumulators: Document,
}

/// One stage of an aggregation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineStage {
    #[serde(rename = "$match")]
    Match(Document),
    #[serde(rename = "$lookup")]
    Lookup(Lookup),
    #[serde(rename = "$unwind")]
    Unwind(Unwind),
    #[serde(rename = "$redact")]
    Redact(Value),
    #[serde(rename = "$project")]
    Project(Document),
    #[serde(rename = "$group")]
    Group(Group),
    #[serde(rename = "$sort")]
    Sort(Document),
    #[serde(rename = "$skip")]
    Skip(u64),
    #[serde(rename = "$limit")]
    Limit(u64),
    #[serde(rename = "$out")]
    Out(String),
}

impl PipelineStage {
    /// Operator name of the stage.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineStage::Match(_) => "$match",
            PipelineStage::Lookup(_) => "$lookup",
            PipelineStage::Unwind(_) => "$unwind",
            PipelineStage::Redact(_) => "$redact",
            PipelineStage::Project(_) => "$project",
            PipelineStage::Group(_) => "$group",
            PipelineStage::Sort(_) => "$sort",
            PipelineStage::Skip(_) => "$skip",
            PipelineStage::Limit(_) => "$limit",
            PipelineStage::Out(_) => "$out",
        }
    }

    /// `$lookup` stage.
    pub fn lookup(
        from: impl Into<String>,
        local_field: impl Into<String>,
        foreign_field: impl Into<String>,
        as_field: impl Into<String>,
    ) -> Self {
        PipelineStage::Lookup(Lookup {
            from: from.into(),
            local_field: local_field.into(),
            foreign_field: foreign_field.into(),
            as_field: as_field.into(),
        })
    }

    /// `$unwind` stage over a field, keeping documents with nothing to unwind.
    pub fn unwind_preserving(field: &str) -> Self {
        PipelineStage::Unwind(Unwind {
            path: format!("${}", field),
            preserve_null_and_empty_arrays: true,
        })
    }

    /// `$redact` stage keeping documents for which `condition` holds.
    pub fn keep_if(condition: Value) -> Self {
        PipelineStage::Redact(json!({
            "$cond": {"if": condition, "then": "$$KEEP", "else": "$$PRUNE"}
        }))
    }

    /// `$group` stage.
    pub fn group(id: Value, accumulators: Document) -> Self {
        PipelineStage::Group(Group { id, accumulators })
    }
}

/// Render a pipeline as a JSON array.
pub fn pipeline_to_value(stages: &[PipelineStage]) -> Result<Value, serde_json::Error> {
    serde_json::to_value(stages)
}
