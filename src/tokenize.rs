//! Tokenizer abstraction and the mutable document model.
//!
//! Components communicate exclusively through the [`Document`]: the
//! tokenizer produces it, every pipeline stage mutates it in place, and
//! the annotator reads the final spans back out. The bundled
//! [`RegexTokenizer`] is deliberately simple (no lemmas, no POS tags, no
//! stopword model unless configured); richer NLP tokenizers plug in
//! through the [`Tokenizer`] trait.
//!
//! Char offsets are byte offsets into the original text, consistent
//! across tokens, spans and output records.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::config::Config;
use crate::error::{Error, Result};

/// Python-style `isupper`: at least one cased character, all cased
/// characters uppercase.
fn is_upper_str(text: &str) -> bool {
    let mut any_cased = false;
    for c in text.chars() {
        if c.is_lowercase() {
            return false;
        }
        if c.is_uppercase() {
            any_cased = true;
        }
    }
    any_cased
}

// =============================================================================
// Tokens
// =============================================================================

/// One token of a document, mutable by pipeline components.
#[derive(Debug, Clone)]
pub struct Token {
    /// Raw text.
    pub text: String,
    /// Raw text plus trailing whitespace, for output reconstruction.
    pub text_with_ws: String,
    /// Lowercased raw text.
    pub lower: String,
    /// Normalized form, written by the normalizing component. Starts as
    /// the lowercase form.
    pub norm: String,
    /// Lemma as provided by the tokenizer; the regex tokenizer has no
    /// lemmatizer so this starts equal to `lower`.
    pub lemma: String,
    /// Part-of-speech tag when the tokenizer provides one.
    pub tag: Option<String>,
    /// Position in the document's token sequence.
    pub index: usize,
    /// Byte offset of the first char in the original text.
    pub char_start: usize,
    /// Byte offset one past the last char.
    pub char_end: usize,
    /// Stopword flag from the tokenizer.
    pub is_stop: bool,
    /// Set by the tagging component.
    pub is_punctuation: bool,
    /// Set by tagging/normalizing; skipped tokens are invisible to NER.
    pub to_skip: bool,
}

impl Token {
    fn new(
        text: &str,
        text_with_ws: &str,
        index: usize,
        char_start: usize,
        is_stop: bool,
    ) -> Self {
        let lower = text.to_lowercase();
        Token {
            text: text.to_string(),
            text_with_ws: text_with_ws.to_string(),
            norm: lower.clone(),
            lemma: lower.clone(),
            lower,
            tag: None,
            index,
            char_start,
            char_end: char_start + text.len(),
            is_stop,
            is_punctuation: false,
            to_skip: false,
        }
    }

    /// Candidate text forms tried by NER, most-normalized first.
    #[must_use]
    pub fn text_versions(&self) -> Vec<&str> {
        if self.norm == self.lower {
            vec![self.norm.as_str()]
        } else {
            vec![self.norm.as_str(), self.lower.as_str()]
        }
    }

    /// Is the raw text uppercase (Python `str.isupper` semantics)?
    #[must_use]
    pub fn is_upper(&self) -> bool {
        is_upper_str(&self.text)
    }

    /// Is the raw text purely numeric?
    #[must_use]
    pub fn is_digit(&self) -> bool {
        !self.text.is_empty() && self.text.chars().all(|c| c.is_ascii_digit())
    }

    /// Should this token feed context-vector windows?
    #[must_use]
    pub fn should_include(&self) -> bool {
        !self.to_skip && !self.is_stop && !self.is_digit() && !self.is_punctuation
    }
}

// =============================================================================
// Addon data
// =============================================================================

/// Registered addon-data slot names, shared by a pipeline and every
/// document it produces.
pub type AddonSlots = Arc<parking_lot::RwLock<HashSet<String>>>;

/// Typed side-table for cross-component extensibility.
///
/// Slots must be registered (on the pipeline) before use; reading or
/// writing an unregistered slot is a programmer error and fails loudly
/// rather than returning a silent `None`.
#[derive(Debug, Clone, Default)]
pub struct AddonData {
    slots: Option<AddonSlots>,
    values: HashMap<String, Value>,
}

impl AddonData {
    fn check(&self, slot: &str) -> Result<()> {
        let registered = self
            .slots
            .as_ref()
            .is_some_and(|slots| slots.read().contains(slot));
        if registered {
            Ok(())
        } else {
            Err(Error::UnregisteredAddonSlot(slot.to_string()))
        }
    }

    /// Store a value under a registered slot.
    pub fn set(&mut self, slot: &str, value: Value) -> Result<()> {
        self.check(slot)?;
        self.values.insert(slot.to_string(), value);
        Ok(())
    }

    /// Read a value from a registered slot; `None` if nothing was stored.
    pub fn get(&self, slot: &str) -> Result<Option<&Value>> {
        self.check(slot)?;
        Ok(self.values.get(slot))
    }
}

// =============================================================================
// Annotated spans
// =============================================================================

/// A candidate (or finalized) entity: a token span with link candidates.
///
/// Created by the NER component, consumed and finalized by the linker;
/// does not outlive its document except as an output record.
#[derive(Debug, Clone)]
pub struct AnnotatedSpan {
    /// Unique within the document.
    pub id: usize,
    /// First token index, inclusive.
    pub token_start: usize,
    /// Last token index, exclusive.
    pub token_end: usize,
    /// Byte offset of the span start.
    pub char_start: usize,
    /// Byte offset one past the span end.
    pub char_end: usize,
    /// Raw text covered by the span.
    pub text: String,
    /// The prepared name that matched.
    pub detected_name: String,
    /// CUIs this name may refer to, pre-disambiguation.
    pub link_candidates: Vec<String>,
    /// Resolved CUI, set by the linker.
    pub cui: Option<String>,
    /// Final context similarity; −1.0 means untrained/below-threshold.
    pub context_similarity: f32,
    /// Confidence of the resolution.
    pub confidence: f32,
    /// Addon side-table.
    pub addon: AddonData,
}

// =============================================================================
// Documents
// =============================================================================

/// A tokenized text, mutated in place by pipeline components.
#[derive(Debug, Clone, Default)]
pub struct Document {
    /// The original input text.
    pub text: String,
    /// Token sequence.
    pub tokens: Vec<Token>,
    /// Candidate spans accumulated by NER.
    pub spans: Vec<AnnotatedSpan>,
    /// Spans surviving linking, in document order.
    pub final_spans: Vec<AnnotatedSpan>,
    /// Addon side-table.
    pub addon: AddonData,
    next_span_id: usize,
}

impl Document {
    /// New document over a text with the given tokens.
    #[must_use]
    pub fn new(text: String, tokens: Vec<Token>) -> Self {
        Document {
            text,
            tokens,
            ..Document::default()
        }
    }

    /// Attach the pipeline's registered addon slots so components can use
    /// the side-table on this document and its spans.
    pub fn attach_addon_slots(&mut self, slots: AddonSlots) {
        self.addon.slots = Some(slots);
    }

    /// Carve a span from a token range (`end` exclusive).
    ///
    /// The span gets a document-unique id and inherits the addon slots.
    pub fn carve_span(&mut self, token_start: usize, token_end: usize) -> Result<AnnotatedSpan> {
        if token_start >= token_end || token_end > self.tokens.len() {
            return Err(Error::invalid_span(format!(
                "token range {token_start}..{token_end} out of 0..{}",
                self.tokens.len()
            )));
        }
        let first = &self.tokens[token_start];
        let last = &self.tokens[token_end - 1];
        let id = self.next_span_id;
        self.next_span_id += 1;
        Ok(AnnotatedSpan {
            id,
            token_start,
            token_end,
            char_start: first.char_start,
            char_end: last.char_end,
            text: self.text[first.char_start..last.char_end].to_string(),
            detected_name: String::new(),
            link_candidates: Vec::new(),
            cui: None,
            context_similarity: 0.0,
            confidence: 0.0,
            addon: AddonData {
                slots: self.addon.slots.clone(),
                values: HashMap::new(),
            },
        })
    }

    /// Tokens whose char range falls inside `[char_start, char_end)`,
    /// for mapping supervised annotations back onto the document.
    #[must_use]
    pub fn token_range_for_chars(&self, char_start: usize, char_end: usize) -> Option<(usize, usize)> {
        let mut start = None;
        let mut end = None;
        for token in &self.tokens {
            if token.char_start >= char_end {
                break;
            }
            if token.char_end > char_start {
                if start.is_none() {
                    start = Some(token.index);
                }
                end = Some(token.index + 1);
            }
        }
        start.zip(end)
    }
}

// =============================================================================
// Tokenizer trait + registry
// =============================================================================

/// Turns raw text into a mutable document.
pub trait Tokenizer: Send + Sync {
    /// Registered provider name.
    fn name(&self) -> &'static str;

    /// Tokenize a text.
    fn tokenize(&self, text: &str) -> Document;
}

impl std::fmt::Debug for dyn Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer").field("name", &self.name()).finish()
    }
}

/// Factory signature for tokenizer construction.
pub type TokenizerFactory = fn(&Config) -> Result<Arc<dyn Tokenizer>>;

/// Named tokenizer factories.
///
/// `"regex"` is registered by default; richer providers register
/// explicitly before pipeline construction.
#[derive(Default)]
pub struct TokenizerRegistry {
    factories: HashMap<String, TokenizerFactory>,
}

impl TokenizerRegistry {
    /// Registry with the default `regex` provider.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = TokenizerRegistry::default();
        registry.register("regex", |config| {
            Ok(Arc::new(RegexTokenizer::new(
                config.preprocessing.stopwords.clone(),
            )) as Arc<dyn Tokenizer>)
        });
        registry
    }

    /// Register a named factory. Re-registering a name replaces it.
    pub fn register(&mut self, name: &str, factory: TokenizerFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Construct the tokenizer configured under `general.tokenizer`.
    pub fn create(&self, config: &Config) -> Result<Arc<dyn Tokenizer>> {
        let provider = &config.general.tokenizer;
        let factory = self.factories.get(provider).ok_or_else(|| {
            Error::tokenizer_init(provider.clone(), "no such provider registered")
        })?;
        factory(config)
            .map_err(|e| Error::tokenizer_init(provider.clone(), e.to_string()))
    }
}

// =============================================================================
// Regex tokenizer
// =============================================================================

// group 1: token plus trailing whitespace (if present)
// group 2: the token itself
static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"((\b\w+\b|\S+)\s?)").expect("token regex is valid"));

/// Minimal whitespace/word-boundary tokenizer.
///
/// No lemmas, no POS tags; stopwords only when an explicit list is
/// configured. Sufficient for vocab-based NER and linking, and the
/// fallback when no NLP-library tokenizer is plugged in.
pub struct RegexTokenizer {
    stopwords: Option<BTreeSet<String>>,
}

impl RegexTokenizer {
    /// New tokenizer with an optional stopword list.
    #[must_use]
    pub fn new(stopwords: Option<BTreeSet<String>>) -> Self {
        RegexTokenizer { stopwords }
    }
}

impl Tokenizer for RegexTokenizer {
    fn name(&self) -> &'static str {
        "regex"
    }

    fn tokenize(&self, text: &str) -> Document {
        let mut tokens = Vec::new();
        for (index, caps) in TOKEN_RE.captures_iter(text).enumerate() {
            let with_ws = caps.get(1).expect("group 1 always present");
            let word = caps.get(2).expect("group 2 always present");
            let is_stop = self
                .stopwords
                .as_ref()
                .is_some_and(|set| set.contains(&word.as_str().to_lowercase()));
            tokens.push(Token::new(
                word.as_str(),
                with_ws.as_str(),
                index,
                word.start(),
                is_stop,
            ));
        }
        Document::new(text.to_string(), tokens)
    }
}

// =============================================================================
// Tests
// =============================================================================


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn tokenizer_never_panics(text in ".*") {
            let _ = RegexTokenizer::new(None).tokenize(&text);
        }

        #[test]
        fn offsets_in_bounds(text in ".{0,200}") {
            let d = RegexTokenizer::new(None).tokenize(&text);
            for token in &d.tokens {
                prop_assert!(token.char_start <= token.char_end);
                prop_assert!(token.char_end <= text.len());
            }
        }

        #[test]
        fn token_indices_sequential(text in ".{0,200}") {
            let d = RegexTokenizer::new(None).tokenize(&text);
            for (i, token) in d.tokens.iter().enumerate() {
                prop_assert_eq!(token.index, i);
            }
        }
    }
}
