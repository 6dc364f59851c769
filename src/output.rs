//! Public output types for annotation results.
//!
//! The shapes mirror what thin web/CLI layers consume: a map from
//! document-unique entity id to a flat record of the resolution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A meta-annotation attached by an addon (negation, temporality, …).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaAnnotation {
    /// Predicted value.
    pub value: String,
    /// Prediction confidence.
    pub confidence: f32,
    /// Name of the meta-annotation task.
    pub name: String,
}

/// One resolved entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Display name of the linked concept.
    pub pretty_name: String,
    /// Linked concept identifier.
    pub cui: String,
    /// Semantic type ids of the concept.
    pub type_ids: Vec<String>,
    /// The exact text of the span.
    pub source_value: String,
    /// The prepared name that matched.
    pub detected_name: String,
    /// Accuracy — alias of `context_similarity`, kept for consumers of
    /// the original API.
    pub acc: f32,
    /// Final context similarity (−1 means accepted without evidence).
    pub context_similarity: f32,
    /// Byte offset of the span start in the input text.
    pub start: usize,
    /// Byte offset one past the span end.
    pub end: usize,
    /// Document-unique entity id.
    pub id: usize,
    /// Meta-annotations from addons.
    pub meta_anns: BTreeMap<String, MetaAnnotation>,
    /// Left context tokens (empty unless configured).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_left: Vec<String>,
    /// The span's own tokens (empty unless configured).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_center: Vec<String>,
    /// Right context tokens (empty unless configured).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_right: Vec<String>,
}

/// Full annotation output for one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entities {
    /// Entity id → record.
    pub entities: BTreeMap<usize, EntityRecord>,
    /// The input text, when `annotation_output.include_text_in_output`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Reduced output: entity id → CUI only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnlyCuiEntities {
    /// Entity id → CUI.
    pub entities: BTreeMap<usize, String>,
    /// The input text, when configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}
