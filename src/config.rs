//! Configuration for the annotation pipeline and its components.
//!
//! The config tree is shared (`Arc<RwLock<Config>>`) between the pipeline,
//! its components, the trainer and the annotator. Temporary changes (e.g.
//! forcing training mode for the duration of a training run) go through
//! RAII scope guards ([`ScopedTrain`], [`ScopedFilters`]) so restoration is
//! guaranteed on every exit path, including errors.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};

use crate::components::ComponentKind;

/// Shared, concurrently-readable configuration handle.
pub type SharedConfig = Arc<RwLock<Config>>;

/// Wrap a config into the shared handle used across the pipeline.
pub fn shared(config: Config) -> SharedConfig {
    Arc::new(RwLock::new(config))
}

// =============================================================================
// Context scales
// =============================================================================

/// Context window scale used for multi-scale context vectors.
///
/// Each scale has its own window size (tokens each side of a candidate
/// span) and its own weight in the final similarity score.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ContextScale {
    /// Immediate context (default 3 tokens each side).
    Short,
    /// Sentence-ish context (default 9).
    Medium,
    /// Paragraph-ish context (default 18).
    Long,
    /// Document-ish context (default 27).
    XLong,
}

impl ContextScale {
    /// All scales, smallest window first.
    pub const ALL: [ContextScale; 4] = [
        ContextScale::Short,
        ContextScale::Medium,
        ContextScale::Long,
        ContextScale::XLong,
    ];
}

impl std::fmt::Display for ContextScale {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ContextScale::Short => "short",
            ContextScale::Medium => "medium",
            ContextScale::Long => "long",
            ContextScale::XLong => "xlong",
        };
        write!(f, "{name}")
    }
}

// =============================================================================
// Linking filters
// =============================================================================

/// CUI inclusion/exclusion filters applied before disambiguation.
///
/// An empty `cuis` set means "all CUIs allowed"; `cuis_exclude` always
/// removes. Narrower filters (per-project or extra filters during
/// supervised training) only have real effect when they are subsets of
/// the broader model filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkingFilters {
    /// Allowed CUIs; empty means everything is allowed.
    #[serde(deserialize_with = "de_cui_set", default)]
    pub cuis: HashSet<String>,
    /// CUIs that are never linked.
    #[serde(default)]
    pub cuis_exclude: HashSet<String>,
}

impl LinkingFilters {
    /// Is this CUI allowed through the filters?
    #[must_use]
    pub fn check(&self, cui: &str) -> bool {
        if self.cuis.is_empty() || self.cuis.contains(cui) {
            !self.cuis_exclude.contains(cui)
        } else {
            false
        }
    }

    /// A filter allowing exactly the given CUIs.
    #[must_use]
    pub fn allowing<I, S>(cuis: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        LinkingFilters {
            cuis: cuis.into_iter().map(Into::into).collect(),
            cuis_exclude: HashSet::new(),
        }
    }
}

/// Older persisted configs stored the allowed-CUI set as a mapping.
/// Accept both and coerce the mapping to its key set.
fn de_cui_set<'de, D>(deserializer: D) -> Result<HashSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SetOrMap {
        Set(HashSet<String>),
        Map(HashMap<String, serde_json::Value>),
    }
    match SetOrMap::deserialize(deserializer)? {
        SetOrMap::Set(set) => Ok(set),
        SetOrMap::Map(map) => {
            log::warn!(
                "Loading a legacy model where linking filter CUIs were persisted \
                 as a mapping; coercing {} keys to a set. Consider re-saving the model.",
                map.len()
            );
            Ok(map.into_keys().collect())
        }
    }
}

// =============================================================================
// Component configs
// =============================================================================

/// Construction config common to all core components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreComponentConfig {
    /// Registered name of the implementation to construct.
    ///
    /// Only `"default"` is registered out of the box; custom components
    /// must be registered on the pipeline's registry first.
    pub comp_name: String,
}

impl Default for CoreComponentConfig {
    fn default() -> Self {
        CoreComponentConfig {
            comp_name: "default".into(),
        }
    }
}

/// NER (candidate detection) configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NerConfig {
    /// Registered implementation name.
    pub comp_name: String,
    /// Detected names shorter than this (in characters) are skipped.
    pub min_name_len: usize,
    /// Maximum number of consecutive skipped tokens allowed inside a
    /// multi-token name, measured on the raw token index.
    pub max_skip_tokens: usize,
    /// Require exact-uppercase matches for names the CDB knows as upper.
    pub check_upper_case_names: bool,
    /// Names shorter than this must appear uppercased in the text.
    pub upper_case_limit_len: usize,
    /// Also try the reversed two-word join when extending a candidate.
    pub try_reverse_word_order: bool,
}

impl Default for NerConfig {
    fn default() -> Self {
        NerConfig {
            comp_name: "default".into(),
            min_name_len: 3,
            max_skip_tokens: 2,
            check_upper_case_names: false,
            upper_case_limit_len: 4,
            try_reverse_word_order: false,
        }
    }
}

/// Threshold interpretation for accepting a linked candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdType {
    /// Compare against `similarity_threshold` directly.
    Static,
    /// Compare against `average_confidence × similarity_threshold` per CUI.
    Dynamic,
}

/// Online-learning schedule for context-vector updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimConfig {
    /// Annealing factor: update weight is
    /// `max(0.1, 1 − count_train² × weight_decay)`.
    pub weight_decay: f64,
}

impl Default for OptimConfig {
    fn default() -> Self {
        OptimConfig {
            weight_decay: 0.0004,
        }
    }
}

/// Linking component configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkingConfig {
    /// Registered implementation name.
    pub comp_name: String,
    /// Annealed update schedule.
    pub optim: OptimConfig,
    /// Window size (tokens each side) per context scale.
    pub context_vector_sizes: BTreeMap<ContextScale, usize>,
    /// Per-scale weight in the final similarity; should sum to 1.
    pub context_vector_weights: BTreeMap<ContextScale, f32>,
    /// CUI filters.
    pub filters: LinkingFilters,
    /// Training mode. Set via scope guards, not manually: the annotator
    /// forces this off for inference and the trainer forces it on.
    pub train: bool,
    /// During unsupervised training, keep the detected name with this
    /// probability; otherwise attribute the example to a random synonym.
    pub random_replacement_unsupervised: f64,
    /// Names at or below this character length are always disambiguated.
    pub disamb_length_limit: usize,
    /// Apply filters before disambiguation and skip disambiguation for
    /// singleton candidate lists (used by the trainer).
    pub filter_before_disamb: bool,
    /// Concepts trained fewer times than this are never similarity-scored
    /// and report a similarity of −1.
    pub train_count_threshold: u64,
    /// Compute similarity even on the unambiguous fast path.
    pub always_calculate_similarity: bool,
    /// How `similarity_threshold` is applied.
    pub similarity_threshold_type: ThresholdType,
    /// Candidates scoring below the threshold are dropped.
    pub similarity_threshold: f32,
    /// Probability of adding a sampled negative context per positive
    /// unsupervised example.
    pub negative_probability: f64,
    /// Exclude punctuation/numeric words from negative sampling.
    pub negative_ignore_punct_and_num: bool,
    /// Additive score bonus when the detected name is the candidate's
    /// primary name.
    pub prefer_primary_name: f32,
    /// Additive score bonus scaled by relative training frequency.
    pub prefer_frequent_concepts: f32,
    /// A positive example also issues negative updates to every other CUI
    /// sharing the trained name.
    pub devalue_linked_concepts: bool,
    /// Exclude the candidate span's own tokens from its context window.
    pub context_ignore_center_tokens: bool,
}

impl Default for LinkingConfig {
    fn default() -> Self {
        LinkingConfig {
            comp_name: "default".into(),
            optim: OptimConfig::default(),
            context_vector_sizes: BTreeMap::from([
                (ContextScale::Short, 3),
                (ContextScale::Medium, 9),
                (ContextScale::Long, 18),
                (ContextScale::XLong, 27),
            ]),
            context_vector_weights: BTreeMap::from([
                (ContextScale::Short, 0.1),
                (ContextScale::Medium, 0.4),
                (ContextScale::Long, 0.4),
                (ContextScale::XLong, 0.1),
            ]),
            filters: LinkingFilters::default(),
            train: true,
            random_replacement_unsupervised: 0.80,
            disamb_length_limit: 3,
            filter_before_disamb: false,
            train_count_threshold: 1,
            always_calculate_similarity: false,
            similarity_threshold_type: ThresholdType::Static,
            similarity_threshold: 0.25,
            negative_probability: 0.5,
            negative_ignore_punct_and_num: true,
            prefer_primary_name: 0.35,
            prefer_frequent_concepts: 0.35,
            devalue_linked_concepts: false,
            context_ignore_center_tokens: false,
        }
    }
}

// =============================================================================
// General / preprocessing / output
// =============================================================================

/// General engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Registered tokenizer provider.
    pub tokenizer: String,
    /// Separator joining the word-tokens of a prepared name. Must stay
    /// stable once a CDB has been built.
    pub separator: String,
    /// Enable spell checking during normalization.
    pub spell_check: bool,
    /// Extend the spell-check alphabet with diacritics.
    pub diacritics: bool,
    /// Also explore two-edit corrections (much slower).
    pub spell_check_deep: bool,
    /// Words shorter than this are never spell-checked.
    pub spell_check_len_limit: usize,
    /// Unlinking a name removes it from all CUIs, not just the given one.
    pub full_unlink: bool,
    /// Worker threads for batch inference; 0 uses the rayon default.
    pub workers: usize,
    /// Seed for all pseudo-random decisions (negative sampling, synonym
    /// replacement). Fixed seed ⇒ reproducible training.
    pub seed: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            tokenizer: "regex".into(),
            separator: "~".into(),
            spell_check: true,
            diacritics: false,
            spell_check_deep: false,
            spell_check_len_limit: 7,
            full_unlink: false,
            workers: 0,
            seed: 42,
        }
    }
}

/// Token preprocessing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingConfig {
    /// Words ignored entirely, in concept names and in text.
    pub words_to_skip: BTreeSet<String>,
    /// Punctuation tokens exempt from the skip rule.
    pub keep_punct: BTreeSet<String>,
    /// Part-of-speech tags whose tokens are never normalized.
    pub do_not_normalize: BTreeSet<String>,
    /// Skip stopwords when processing input.
    pub skip_stopwords: bool,
    /// Tokens shorter than this are never normalized (lemmatized).
    pub min_len_normalize: usize,
    /// Stopword list; `None` leaves stopword detection to the tokenizer.
    pub stopwords: Option<BTreeSet<String>>,
    /// Documents longer than this (chars) are trimmed before processing.
    pub max_document_length: usize,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        PreprocessingConfig {
            words_to_skip: BTreeSet::from(["nos".to_string()]),
            keep_punct: BTreeSet::from([".".to_string(), ":".to_string()]),
            do_not_normalize: ["VBD", "VBG", "VBN", "VBP", "JJS", "JJR"]
                .into_iter()
                .map(String::from)
                .collect(),
            skip_stopwords: false,
            min_len_normalize: 5,
            stopwords: None,
            max_document_length: 1_000_000,
        }
    }
}

/// CDB construction configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdbMakerConfig {
    /// Minimum number of letters required in a prepared name.
    pub min_letters_required: usize,
}

impl Default for CdbMakerConfig {
    fn default() -> Self {
        CdbMakerConfig {
            min_letters_required: 2,
        }
    }
}

/// Shape of the `get_entities` output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationOutputConfig {
    /// Tokens of left context included per entity; 0 disables.
    pub context_left: usize,
    /// Tokens of right context included per entity; 0 disables.
    pub context_right: usize,
    /// Lowercase the context tokens.
    pub lowercase_context: bool,
    /// Echo the input text back in the output.
    pub include_text_in_output: bool,
}

impl Default for AnnotationOutputConfig {
    fn default() -> Self {
        AnnotationOutputConfig {
            context_left: 0,
            context_right: 0,
            lowercase_context: true,
            include_text_in_output: false,
        }
    }
}

// =============================================================================
// Components / meta / root
// =============================================================================

/// Per-component configs plus the component execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentsConfig {
    /// Tagging component.
    pub tagging: CoreComponentConfig,
    /// Normalizing component.
    pub normalizing: CoreComponentConfig,
    /// NER component.
    pub ner: NerConfig,
    /// Linking component.
    pub linking: LinkingConfig,
    /// Core component order; every kind must appear exactly once.
    pub comp_order: Vec<ComponentKind>,
}

impl Default for ComponentsConfig {
    fn default() -> Self {
        ComponentsConfig {
            tagging: CoreComponentConfig::default(),
            normalizing: CoreComponentConfig::default(),
            ner: NerConfig::default(),
            linking: LinkingConfig::default(),
            comp_order: vec![
                ComponentKind::Tagging,
                ComponentKind::Normalizing,
                ComponentKind::Ner,
                ComponentKind::Linking,
            ],
        }
    }
}

/// One recorded training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingDescriptor {
    /// Project name for supervised runs.
    pub project_name: Option<String>,
    /// Number of documents/lines fed through the pipeline.
    pub num_docs: usize,
    /// Number of epochs.
    pub num_epochs: usize,
}

/// Model-level metadata carried with the pack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMeta {
    /// Free-form model description.
    pub description: String,
    /// Source ontologies (e.g. SNOMED-CT, UMLS).
    pub ontology: Vec<String>,
    /// Unsupervised training runs, oldest first.
    pub unsup_trained: Vec<TrainingDescriptor>,
    /// Supervised training runs, oldest first.
    pub sup_trained: Vec<TrainingDescriptor>,
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General engine settings.
    pub general: GeneralConfig,
    /// Component settings and ordering.
    pub components: ComponentsConfig,
    /// Token preprocessing settings.
    pub preprocessing: PreprocessingConfig,
    /// CDB construction settings.
    pub cdb_maker: CdbMakerConfig,
    /// Output shaping.
    pub annotation_output: AnnotationOutputConfig,
    /// Model metadata.
    pub meta: ModelMeta,
}

// =============================================================================
// Scoped overrides
// =============================================================================

/// RAII guard forcing `components.linking.train` for the guard's lifetime.
///
/// The previous value is restored on drop, on every exit path.
#[must_use = "the override is reverted as soon as the guard is dropped"]
pub struct ScopedTrain {
    config: SharedConfig,
    prev: bool,
}

impl ScopedTrain {
    /// Set the train flag, remembering the previous value.
    pub fn set(config: &SharedConfig, value: bool) -> Self {
        let prev = {
            let mut cfg = config.write();
            let prev = cfg.components.linking.train;
            cfg.components.linking.train = value;
            prev
        };
        ScopedTrain {
            config: Arc::clone(config),
            prev,
        }
    }
}

impl Drop for ScopedTrain {
    fn drop(&mut self) {
        self.config.write().components.linking.train = self.prev;
    }
}

/// RAII guard replacing `components.linking.filters` for the guard's
/// lifetime; the previous filters are restored on drop.
#[must_use = "the override is reverted as soon as the guard is dropped"]
pub struct ScopedFilters {
    config: SharedConfig,
    prev: LinkingFilters,
}

impl ScopedFilters {
    /// Replace the active filters, remembering the previous ones.
    pub fn set(config: &SharedConfig, filters: LinkingFilters) -> Self {
        let prev = {
            let mut cfg = config.write();
            std::mem::replace(&mut cfg.components.linking.filters, filters)
        };
        ScopedFilters {
            config: Arc::clone(config),
            prev,
        }
    }
}

impl Drop for ScopedFilters {
    fn drop(&mut self) {
        let mut cfg = self.config.write();
        cfg.components.linking.filters = std::mem::take(&mut self.prev);
    }
}

// =============================================================================
// Tests
// =============================================================================
