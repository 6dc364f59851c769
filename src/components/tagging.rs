//! Tagging: flag tokens to skip before any downstream stage sees them.
//!
//! A pure per-token classifier: punctuation (outside the configured keep
//! set), skip-listed words, and optionally stopwords get `to_skip`. No
//! other state is touched, and the outcome for a token depends only on
//! that token's text.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::Config;
use crate::error::Result;
use crate::tokenize::Document;

use super::{Component, ComponentKind};

// Aggressive: anything with no lowercase letter or digit counts as punct.
static PUNCT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^a-z0-9]+$").expect("valid regex"));

/// The default tagging component.
pub struct TagAndSkip {
    word_skipper: Option<Regex>,
    keep_punct: std::collections::BTreeSet<String>,
    skip_stopwords: bool,
}

impl TagAndSkip {
    /// Build from the preprocessing config.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let prep = &config.preprocessing;
        let word_skipper = if prep.words_to_skip.is_empty() {
            None
        } else {
            let alternation: Vec<String> = prep
                .words_to_skip
                .iter()
                .map(|w| regex::escape(w))
                .collect();
            Some(
                Regex::new(&format!("^({})$", alternation.join("|")))
                    .expect("escaped alternation is a valid regex"),
            )
        };
        TagAndSkip {
            word_skipper,
            keep_punct: prep.keep_punct.clone(),
            skip_stopwords: prep.skip_stopwords,
        }
    }
}

impl Component for TagAndSkip {
    fn name(&self) -> &'static str {
        "tag-and-skip"
    }

    fn kind(&self) -> ComponentKind {
        ComponentKind::Tagging
    }

    fn process(&self, doc: &mut Document) -> Result<()> {
        for token in &mut doc.tokens {
            if PUNCT_RE.is_match(&token.lower) && !self.keep_punct.contains(&token.text) {
                token.is_punctuation = true;
                token.to_skip = true;
            } else if self
                .word_skipper
                .as_ref()
                .is_some_and(|re| re.is_match(&token.lower))
            {
                token.to_skip = true;
            } else if self.skip_stopwords && token.is_stop {
                token.to_skip = true;
            }
        }
        Ok(())
    }
}
