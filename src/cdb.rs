//! Concept Database: names, concepts, and their trained context vectors.
//!
//! The CDB is the model's long-lived state. It maps prepared name strings
//! to the concepts (CUIs) they can refer to, and carries per-concept
//! training state: multi-scale context vectors, training counts and the
//! running confidence average.
//!
//! Referential integrity invariant: every name in a concept's `names`
//! appears in the name table with that CUI in its ambiguity set, and vice
//! versa. All mutating operations preserve this; [`Cdb::integrity_violations`]
//! exists so tests can prove it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use ndarray::Array1;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{Config, ContextScale};
use crate::tokenize::Tokenizer;

static PUNCT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^a-z0-9]+$").expect("valid regex"));

// =============================================================================
// Status
// =============================================================================

/// Per (name, CUI) linking status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NameStatus {
    /// The name is this concept's primary name; no disambiguation needed.
    #[serde(rename = "P")]
    Primary,
    /// Primary name, but the name is ambiguous so disambiguation still runs.
    #[serde(rename = "PD")]
    PrimaryWithDisambiguation,
    /// The name always requires disambiguation.
    #[serde(rename = "N")]
    MustDisambiguate,
    /// Unclassified; treated like `MustDisambiguate` for scoring but
    /// upgradeable when better information arrives.
    #[default]
    #[serde(rename = "A")]
    Automatic,
}

impl NameStatus {
    /// Parse the original single-letter form; unknown letters map to
    /// `Automatic`.
    #[must_use]
    pub fn from_letter(letter: &str) -> Self {
        match letter {
            "P" => NameStatus::Primary,
            "PD" => NameStatus::PrimaryWithDisambiguation,
            "N" => NameStatus::MustDisambiguate,
            _ => NameStatus::Automatic,
        }
    }

    /// Does this status mark the name as the concept's primary name?
    #[must_use]
    pub fn is_primary(self) -> bool {
        matches!(
            self,
            NameStatus::Primary | NameStatus::PrimaryWithDisambiguation
        )
    }
}

// =============================================================================
// Per-concept / per-name info
// =============================================================================

/// Everything known about one concept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CuiInfo {
    /// Concept unique identifier.
    pub cui: String,
    /// Canonical display name; empty until a primary name is added.
    pub preferred_name: String,
    /// All prepared name-forms mapping to this concept.
    pub names: BTreeSet<String>,
    /// All separator-joined name prefixes, driving greedy NER matching.
    pub subnames: BTreeSet<String>,
    /// Semantic type identifiers.
    pub type_ids: BTreeSet<String>,
    /// Ontologies this concept appears in.
    pub ontologies: BTreeSet<String>,
    /// Optional description.
    pub description: Option<String>,
    /// Raw (unprepared) names, kept only on full builds.
    pub original_names: Option<BTreeSet<String>>,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Concept group.
    pub group: Option<String>,
    /// Cross-references into other ontologies.
    pub in_other_ontology: BTreeMap<String, String>,
    /// Number of positive training events seen.
    pub count_train: u64,
    /// Learned context vectors, one per scale; empty until trained.
    pub context_vectors: BTreeMap<ContextScale, Array1<f32>>,
    /// Running mean of training confidences.
    pub average_confidence: f32,
}

impl CuiInfo {
    /// Clear all trained state, leaving the name/CUI graph untouched.
    pub fn reset_training(&mut self) {
        self.context_vectors.clear();
        self.count_train = 0;
        self.average_confidence = 0.0;
    }
}

/// Everything known about one prepared name string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NameInfo {
    /// The prepared (separator-joined) name.
    pub name: String,
    /// Concepts this name can refer to.
    pub cuis: BTreeSet<String>,
    /// Per-CUI status; missing entries mean [`NameStatus::Automatic`].
    pub per_cui_status: BTreeMap<String, NameStatus>,
    /// Whether the name's canonical source form was uppercase.
    pub is_upper: bool,
    /// Training occurrences of this name.
    pub count_train: u64,
}

impl NameInfo {
    /// Status of this name for a given CUI.
    #[must_use]
    pub fn status_for(&self, cui: &str) -> NameStatus {
        self.per_cui_status.get(cui).copied().unwrap_or_default()
    }
}

// =============================================================================
// Name preparation
// =============================================================================

/// A raw name turned into its in-CDB form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedName {
    /// Separator-joined prepared name.
    pub name: String,
    /// Whether the raw source form was uppercase.
    pub is_upper: bool,
}

/// Prepare a raw name the same way document tokens are prepared, so text
/// matches line up with CDB entries.
///
/// Tokens that are pure punctuation (outside `keep_punct`) or in the
/// skip-word list are dropped; remaining tokens contribute their
/// lowercase form (tokens at or above `min_len_normalize` use the
/// normalized form) joined by the configured separator. Names with fewer
/// letters than `cdb_maker.min_letters_required` are rejected.
pub fn prepare_name(
    raw: &str,
    tokenizer: &dyn Tokenizer,
    config: &Config,
) -> Option<PreparedName> {
    let doc = tokenizer.tokenize(raw);
    let sep = &config.general.separator;
    let mut parts: Vec<String> = Vec::new();
    for token in &doc.tokens {
        if PUNCT_RE.is_match(&token.lower) && !config.preprocessing.keep_punct.contains(&token.text)
        {
            continue;
        }
        if config.preprocessing.words_to_skip.contains(&token.lower) {
            continue;
        }
        let part = if token.lower.chars().count() < config.preprocessing.min_len_normalize {
            token.lower.clone()
        } else {
            token.norm.clone()
        };
        parts.push(part);
    }
    if parts.is_empty() {
        return None;
    }
    let name = parts.join(sep);
    let letters = name.chars().filter(|c| c.is_alphabetic()).count();
    if letters < config.cdb_maker.min_letters_required {
        return None;
    }
    Some(PreparedName {
        name,
        is_upper: !raw.is_empty() && raw == raw.to_uppercase() && raw != raw.to_lowercase(),
    })
}

// =============================================================================
// Training schedule
// =============================================================================

/// Annealed update weight: `max(0.1, 1 − count² × weight_decay)`.
///
/// Monotonically non-increasing in `count_train`, floored at 0.1 so a
/// heavily-trained concept keeps adapting slowly instead of freezing.
#[must_use]
pub fn train_weight(count_train: u64, weight_decay: f64) -> f64 {
    let count = count_train as f64;
    (1.0 - count * count * weight_decay).max(0.1)
}

// =============================================================================
// The CDB
// =============================================================================

/// In-memory concept database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cdb {
    /// CUI → concept info.
    pub cui2info: HashMap<String, CuiInfo>,
    /// Prepared name → name info.
    pub name2info: HashMap<String, NameInfo>,
    /// Global subname set; union over all concepts' subnames.
    subnames: HashSet<String>,
    /// Word → frequency over all concept names; feeds the spell checker.
    pub token_counts: HashMap<String, u64>,
}

impl Cdb {
    /// Empty CDB.
    #[must_use]
    pub fn new() -> Self {
        Cdb::default()
    }

    /// O(1) membership test for name fragments; drives greedy NER
    /// extension.
    #[must_use]
    pub fn has_subname(&self, fragment: &str) -> bool {
        self.subnames.contains(fragment)
    }

    /// Display name for a CUI.
    ///
    /// Falls back to the first name (humanized) and then to the CUI
    /// itself — annotation output must never crash on an unknown CUI.
    #[must_use]
    pub fn get_name(&self, cui: &str, separator: &str) -> String {
        match self.cui2info.get(cui) {
            Some(info) if !info.preferred_name.is_empty() => info.preferred_name.clone(),
            Some(info) => info
                .names
                .iter()
                .next()
                .map(|name| name.replace(separator, " "))
                .unwrap_or_else(|| cui.to_string()),
            None => {
                log::debug!("get_name on unknown CUI '{cui}', falling back to the CUI itself");
                cui.to_string()
            }
        }
    }

    /// Insert or extend a concept.
    ///
    /// Re-adding an existing name under a different CUI extends that
    /// name's ambiguity set rather than overwriting it. A `Primary`
    /// status upgrades the concept's preferred name.
    #[allow(clippy::too_many_arguments)]
    pub fn add_concept(
        &mut self,
        cui: &str,
        names: &[PreparedName],
        name_status: NameStatus,
        type_ids: BTreeSet<String>,
        ontologies: BTreeSet<String>,
        description: Option<&str>,
        full_build: bool,
        separator: &str,
    ) {
        let info = self
            .cui2info
            .entry(cui.to_string())
            .or_insert_with(|| CuiInfo {
                cui: cui.to_string(),
                ..CuiInfo::default()
            });
        info.type_ids.extend(type_ids);
        info.ontologies.extend(ontologies);
        if let Some(desc) = description {
            if !desc.is_empty() {
                info.description = Some(desc.to_string());
            }
        }
        if name_status.is_primary() {
            if let Some(first) = names.first() {
                let pretty = first.name.replace(separator, " ");
                if info.preferred_name.is_empty() {
                    info.preferred_name = pretty;
                } else if info.preferred_name != pretty {
                    log::debug!(
                        "CUI '{cui}' preferred name changing '{}' -> '{pretty}'",
                        info.preferred_name
                    );
                    info.preferred_name = pretty;
                }
            }
        }

        for prepared in names {
            let newly_added = info.names.insert(prepared.name.clone());
            if full_build {
                info.original_names
                    .get_or_insert_with(BTreeSet::new)
                    .insert(prepared.name.clone());
            }

            // Subnames: every separator-joined prefix of the name.
            let words: Vec<&str> = prepared.name.split(separator).collect();
            let mut running = String::new();
            for word in &words {
                if !running.is_empty() {
                    running.push_str(separator);
                }
                running.push_str(word);
                info.subnames.insert(running.clone());
                self.subnames.insert(running.clone());
            }

            if newly_added {
                for word in &words {
                    *self.token_counts.entry((*word).to_string()).or_insert(0) += 1;
                }
            }

            let name_info = self
                .name2info
                .entry(prepared.name.clone())
                .or_insert_with(|| NameInfo {
                    name: prepared.name.clone(),
                    is_upper: prepared.is_upper,
                    ..NameInfo::default()
                });
            name_info.cuis.insert(cui.to_string());
            let entry = name_info
                .per_cui_status
                .entry(cui.to_string())
                .or_insert(name_status);
            // A definite status may upgrade an automatic one, never the
            // other way around.
            if *entry == NameStatus::Automatic && name_status != NameStatus::Automatic {
                *entry = name_status;
            }
        }
    }

    /// Remove the CUI from each given name's ambiguity set.
    ///
    /// Policy: a name whose ambiguity set becomes empty is dropped from
    /// the name table entirely; subnames no longer generated by any
    /// surviving name are retired from the global set.
    pub fn remove_names<'a>(
        &mut self,
        cui: &str,
        names: impl IntoIterator<Item = &'a str>,
        separator: &str,
    ) {
        for name in names {
            let Some(name_info) = self.name2info.get_mut(name) else {
                continue;
            };
            name_info.cuis.remove(cui);
            name_info.per_cui_status.remove(cui);
            if name_info.cuis.is_empty() {
                self.name2info.remove(name);
            }
            if let Some(cui_info) = self.cui2info.get_mut(cui) {
                cui_info.names.remove(name);
                // Recompute this concept's subnames from its survivors.
                let mut remaining = BTreeSet::new();
                for kept in &cui_info.names {
                    let words: Vec<&str> = kept.split(separator).collect();
                    let mut running = String::new();
                    for word in words {
                        if !running.is_empty() {
                            running.push_str(separator);
                        }
                        running.push_str(word);
                        remaining.insert(running.clone());
                    }
                }
                cui_info.subnames = remaining;
            }
        }
        self.rebuild_global_subnames();
    }

    /// Destructively restrict the CDB to the given CUIs.
    ///
    /// Names with no remaining CUI are dropped; irreversible in place.
    pub fn filter_by_cui(&mut self, keep: &HashSet<String>) {
        self.cui2info.retain(|cui, _| keep.contains(cui));
        self.name2info.retain(|_, name_info| {
            name_info.cuis.retain(|cui| keep.contains(cui));
            name_info
                .per_cui_status
                .retain(|cui, _| keep.contains(cui));
            !name_info.cuis.is_empty()
        });
        self.rebuild_global_subnames();
    }

    fn rebuild_global_subnames(&mut self) {
        self.subnames = self
            .cui2info
            .values()
            .flat_map(|info| info.subnames.iter().cloned())
            .collect();
    }

    /// Clear all trained state on every concept and name, leaving the
    /// name/CUI graph intact. Idempotent.
    pub fn reset_training(&mut self) {
        for info in self.cui2info.values_mut() {
            info.reset_training();
        }
        for name_info in self.name2info.values_mut() {
            name_info.count_train = 0;
        }
    }

    /// Apply one observed context to a concept's stored vectors.
    ///
    /// Each scale moves toward (away from, when `negative`) the observed
    /// vector with the annealed weight from [`train_weight`]; scales with
    /// no prior vector adopt the observation (or its negation) directly.
    /// Counters are not touched here — positive examples advance them via
    /// [`Cdb::record_positive_training`].
    pub fn update_context_vectors(
        &mut self,
        cui: &str,
        observed: &BTreeMap<ContextScale, Array1<f32>>,
        negative: bool,
        weight_decay: f64,
    ) {
        let Some(info) = self.cui2info.get_mut(cui) else {
            log::warn!("update_context_vectors on unknown CUI '{cui}'");
            return;
        };
        let weight = train_weight(info.count_train, weight_decay) as f32;
        let sign: f32 = if negative { -1.0 } else { 1.0 };
        for (scale, vector) in observed {
            match info.context_vectors.get_mut(scale) {
                Some(stored) => {
                    *stored = &*stored * (1.0 - weight) + &(vector * (sign * weight));
                }
                None => {
                    info.context_vectors.insert(*scale, vector * sign);
                }
            }
        }
    }

    /// Advance training counters after a positive example.
    pub fn record_positive_training(&mut self, cui: &str, name: Option<&str>, confidence: f32) {
        if let Some(info) = self.cui2info.get_mut(cui) {
            info.count_train += 1;
            let n = info.count_train as f32;
            info.average_confidence += (confidence - info.average_confidence) / n;
        }
        if let Some(name) = name {
            if let Some(name_info) = self.name2info.get_mut(name) {
                name_info.count_train += 1;
            }
        }
    }

    /// Violations of the name↔CUI referential invariant; empty when
    /// consistent.
    #[must_use]
    pub fn integrity_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        for (cui, info) in &self.cui2info {
            for name in &info.names {
                match self.name2info.get(name) {
                    Some(name_info) if name_info.cuis.contains(cui) => {}
                    Some(_) => violations.push(format!(
                        "name '{name}' of CUI '{cui}' lacks the back-reference"
                    )),
                    None => violations.push(format!(
                        "name '{name}' of CUI '{cui}' missing from the name table"
                    )),
                }
            }
        }
        for (name, name_info) in &self.name2info {
            for cui in &name_info.cuis {
                match self.cui2info.get(cui) {
                    Some(info) if info.names.contains(name) => {}
                    Some(_) => violations.push(format!(
                        "CUI '{cui}' of name '{name}' lacks the forward reference"
                    )),
                    None => violations.push(format!(
                        "CUI '{cui}' of name '{name}' missing from the concept table"
                    )),
                }
            }
        }
        violations
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenize::RegexTokenizer;
    use ndarray::arr1;

    fn prep(raw: &str) -> Vec<PreparedName> {
        let config = Config::default();
        prepare_name(raw, &RegexTokenizer::new(None), &config)
            .into_iter()
            .collect()
    }

    fn small_cdb() -> Cdb {
        let mut cdb = Cdb::new();
        cdb.add_concept(
            "C001",
            &prep("kidney failure"),
            NameStatus::Primary,
            BTreeSet::from(["T047".to_string()]),
            BTreeSet::new(),
            Some("Renal failure"),
            false,
            "~",
        );
        cdb.add_concept(
            "C002",
            &prep("cold"),
            NameStatus::Automatic,
            BTreeSet::new(),
            BTreeSet::new(),
            None,
            false,
            "~",
        );
        // Same name, second concept: ambiguity.
        cdb.add_concept(
            "C003",
            &prep("cold"),
            NameStatus::Automatic,
            BTreeSet::new(),
            BTreeSet::new(),
            None,
            false,
            "~",
        );
        cdb
    }

    #[test]
    fn prepare_name_joins_with_separator() {
        let names = prep("Kidney Failure");
        assert_eq!(names[0].name, "kidney~failure");
        assert!(!names[0].is_upper);
    }

    #[test]
    fn prepare_name_detects_upper() {
        let names = prep("HTN");
        assert!(names[0].is_upper);
    }

    #[test]
    fn prepare_name_drops_punct_and_skip_words() {
        // "nos" is in the default skip list; comma is punctuation.
        let names = prep("failure, nos");
        assert_eq!(names[0].name, "failure");
    }

    #[test]
    fn prepare_name_rejects_too_few_letters() {
        assert!(prep("1").is_empty());
        assert!(prep("!!").is_empty());
    }

    #[test]
    fn subnames_are_prefixes() {
        let cdb = small_cdb();
        assert!(cdb.has_subname("kidney"));
        assert!(cdb.has_subname("kidney~failure"));
        assert!(!cdb.has_subname("failure"));
    }

    #[test]
    fn ambiguous_name_accumulates_cuis() {
        let cdb = small_cdb();
        let info = &cdb.name2info["cold"];
        assert_eq!(info.cuis.len(), 2);
        assert!(info.cuis.contains("C002") && info.cuis.contains("C003"));
    }

    #[test]
    fn get_name_prefers_preferred_then_name_then_cui() {
        let cdb = small_cdb();
        assert_eq!(cdb.get_name("C001", "~"), "kidney failure");
        assert_eq!(cdb.get_name("C002", "~"), "cold");
        assert_eq!(cdb.get_name("C999", "~"), "C999");
    }

    #[test]
    fn integrity_holds_after_build() {
        let cdb = small_cdb();
        assert!(cdb.integrity_violations().is_empty());
    }

    #[test]
    fn remove_names_drops_empty_names_and_keeps_integrity() {
        let mut cdb = small_cdb();
        cdb.remove_names("C002", ["cold"], "~");
        // Name still exists for C003.
        assert!(cdb.name2info.contains_key("cold"));
        cdb.remove_names("C003", ["cold"], "~");
        assert!(!cdb.name2info.contains_key("cold"));
        assert!(!cdb.has_subname("cold"));
        assert!(cdb.integrity_violations().is_empty());
    }

    #[test]
    fn filter_by_cui_restricts_in_place() {
        let mut cdb = small_cdb();
        cdb.filter_by_cui(&HashSet::from(["C001".to_string()]));
        assert!(cdb.cui2info.contains_key("C001"));
        assert!(!cdb.cui2info.contains_key("C002"));
        assert!(!cdb.name2info.contains_key("cold"));
        assert!(!cdb.has_subname("cold"));
        assert!(cdb.has_subname("kidney~failure"));
        assert!(cdb.integrity_violations().is_empty());
    }

    #[test]
    fn reset_training_is_idempotent() {
        let mut cdb = small_cdb();
        let observed = BTreeMap::from([(ContextScale::Short, arr1(&[1.0f32, 0.0]))]);
        cdb.update_context_vectors("C001", &observed, false, 0.0004);
        cdb.record_positive_training("C001", Some("kidney~failure"), 0.8);
        assert_eq!(cdb.cui2info["C001"].count_train, 1);

        cdb.reset_training();
        let snapshot = cdb.clone();
        cdb.reset_training();

        for (cui, info) in &cdb.cui2info {
            assert_eq!(info.count_train, 0);
            assert!(info.context_vectors.is_empty());
            assert_eq!(info.average_confidence, 0.0);
            assert_eq!(info, &snapshot.cui2info[cui]);
        }
        assert_eq!(cdb.name2info["kidney~failure"].count_train, 0);
    }

    #[test]
    fn first_update_adopts_observed_vector() {
        let mut cdb = small_cdb();
        let observed = BTreeMap::from([(ContextScale::Short, arr1(&[0.5f32, -0.5]))]);
        cdb.update_context_vectors("C001", &observed, false, 0.0004);
        let stored = &cdb.cui2info["C001"].context_vectors[&ContextScale::Short];
        assert_eq!(stored, &arr1(&[0.5f32, -0.5]));
    }

    #[test]
    fn negative_update_moves_away() {
        let mut cdb = small_cdb();
        let observed = BTreeMap::from([(ContextScale::Short, arr1(&[1.0f32, 0.0]))]);
        cdb.update_context_vectors("C001", &observed, false, 0.0004);
        cdb.record_positive_training("C001", None, 1.0);
        cdb.update_context_vectors("C001", &observed, true, 0.0004);
        let stored = &cdb.cui2info["C001"].context_vectors[&ContextScale::Short];
        // Pushed back toward (and past) zero along the observed direction.
        assert!(stored[0] < 1.0);
    }

    #[test]
    fn average_confidence_is_running_mean() {
        let mut cdb = small_cdb();
        cdb.record_positive_training("C001", None, 1.0);
        cdb.record_positive_training("C001", None, 0.0);
        let info = &cdb.cui2info["C001"];
        assert_eq!(info.count_train, 2);
        assert!((info.average_confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn train_weight_anneals_and_floors() {
        let factor = 0.0004;
        let mut prev = train_weight(0, factor);
        assert!((prev - 1.0).abs() < 1e-12);
        for count in 1..200 {
            let w = train_weight(count, factor);
            assert!(w <= prev, "weight must be non-increasing");
            assert!(w >= 0.1, "weight floors at 0.1");
            prev = w;
        }
        assert!((train_weight(10_000, factor) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn status_upgrade_only_from_automatic() {
        let mut cdb = small_cdb();
        cdb.add_concept(
            "C002",
            &prep("cold"),
            NameStatus::Primary,
            BTreeSet::new(),
            BTreeSet::new(),
            None,
            false,
            "~",
        );
        assert_eq!(
            cdb.name2info["cold"].status_for("C002"),
            NameStatus::Primary
        );
        // A later Automatic must not downgrade.
        cdb.add_concept(
            "C002",
            &prep("cold"),
            NameStatus::Automatic,
            BTreeSet::new(),
            BTreeSet::new(),
            None,
            false,
            "~",
        );
        assert_eq!(
            cdb.name2info["cold"].status_for("C002"),
            NameStatus::Primary
        );
    }

    #[test]
    fn serde_roundtrip() {
        let cdb = small_cdb();
        let json = serde_json::to_string(&cdb).unwrap();
        let back: Cdb = serde_json::from_str(&json).unwrap();
        assert!(back.has_subname("kidney~failure"));
        assert_eq!(back.cui2info.len(), cdb.cui2info.len());
        assert!(back.integrity_violations().is_empty());
    }
}
