//! Normalization: per-token normal forms plus optional spell correction.
//!
//! Short tokens are left as their lowercase raw form (too short to
//! lemmatize reliably), tokens with protected part-of-speech tags keep
//! their raw form, pronoun placeholders are skipped, everything else uses
//! the lowercased lemma. The spell checker is the classic
//! frequency-ranked 1-edit (2-edit in deep mode) candidate search over
//! the words seen in concept names.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::SharedConfig;
use crate::error::Result;
use crate::tokenize::{Document, Tokenizer};
use crate::vocab::Vocab;

use super::{Component, ComponentKind};

static CONTAINS_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new("[0-9]").expect("valid regex"));

/// Lemma placeholder some tokenizers emit for pronouns.
pub const PRONOUN_SENTINEL: &str = "-PRON-";

// =============================================================================
// Spell checker
// =============================================================================

/// Frequency-ranked edit-distance spell correction.
///
/// The dictionary is the word-frequency table accumulated from concept
/// names; ranking uses −1/count as the probability proxy, so any known
/// candidate beats an unknown one and more frequent words rank higher
/// under a max comparator.
pub struct SpellChecker {
    dictionary: HashMap<String, u64>,
    letters: Vec<char>,
    deep: bool,
}

impl SpellChecker {
    /// Build from a word-frequency dictionary.
    #[must_use]
    pub fn new(dictionary: HashMap<String, u64>, diacritics: bool, deep: bool) -> Self {
        let mut letters: Vec<char> = ('a'..='z').collect();
        if diacritics {
            letters.extend("àáâãäåæçèéêëìíîïðñòóôõöøùúûüýþÿ".chars());
        }
        SpellChecker {
            dictionary,
            letters,
            deep,
        }
    }

    /// Probability proxy: −1/count for known words, 0 for unknown.
    fn probability(&self, word: &str) -> f64 {
        match self.dictionary.get(word) {
            Some(&count) if count > 0 => -1.0 / count as f64,
            _ => 0.0,
        }
    }

    /// Is the word in the dictionary?
    #[must_use]
    pub fn contains(&self, word: &str) -> bool {
        self.dictionary.contains_key(word)
    }

    /// Most probable correction, or `None` if the best candidate is the
    /// word itself.
    #[must_use]
    pub fn fix(&self, word: &str) -> Option<String> {
        let best = self
            .candidates(word)
            .into_iter()
            .max_by(|a, b| {
                self.probability(a)
                    .partial_cmp(&self.probability(b))
                    .expect("probabilities are finite")
            })?;
        if best == word {
            None
        } else {
            Some(best)
        }
    }

    fn candidates(&self, word: &str) -> Vec<String> {
        let direct = self.known(std::iter::once(word.to_string()));
        if !direct.is_empty() {
            return direct;
        }
        let one_away = self.known(self.edits1(word));
        if !one_away.is_empty() {
            return one_away;
        }
        if self.deep {
            let two_away = self.known(self.edits2(word));
            if !two_away.is_empty() {
                return two_away;
            }
        }
        vec![word.to_string()]
    }

    fn known(&self, words: impl IntoIterator<Item = String>) -> Vec<String> {
        let mut found: Vec<String> = words
            .into_iter()
            .filter(|w| self.dictionary.contains_key(w))
            .collect();
        found.sort_unstable();
        found.dedup();
        found
    }

    /// All single-edit variants (deletes, transposes, replaces, inserts).
    fn edits1(&self, word: &str) -> Vec<String> {
        let chars: Vec<char> = word.chars().collect();
        let n = chars.len();
        let mut edits = Vec::with_capacity((n + 1) * (2 * self.letters.len() + 2));
        for i in 0..=n {
            let (left, right) = chars.split_at(i);
            if !right.is_empty() {
                // delete
                edits.push(collect(left, &right[1..], None));
                // replace
                for &c in &self.letters {
                    edits.push(collect(left, &right[1..], Some(c)));
                }
            }
            if right.len() > 1 {
                // transpose
                let mut t: Vec<char> = left.to_vec();
                t.push(right[1]);
                t.push(right[0]);
                t.extend_from_slice(&right[2..]);
                edits.push(t.into_iter().collect());
            }
            // insert
            for &c in &self.letters {
                edits.push(collect(left, right, Some(c)));
            }
        }
        edits
    }

    fn edits2(&self, word: &str) -> Vec<String> {
        self.edits1(word)
            .into_iter()
            .flat_map(|e1| self.edits1(&e1))
            .collect()
    }
}

fn collect(left: &[char], right: &[char], insert: Option<char>) -> String {
    let mut s = String::with_capacity(left.len() + right.len() + 1);
    s.extend(left.iter());
    if let Some(c) = insert {
        s.push(c);
    }
    s.extend(right.iter());
    s
}

// =============================================================================
// Normalizer component
// =============================================================================

/// The default normalizing component.
pub struct TokenNormalizer {
    tokenizer: Arc<dyn Tokenizer>,
    config: SharedConfig,
    spell_checker: SpellChecker,
    vocab: Arc<Vocab>,
}

impl TokenNormalizer {
    /// Build from the tokenizer (for re-deriving fixed words), the shared
    /// config, the CDB's concept-name word frequencies and the word
    /// vocabulary.
    #[must_use]
    pub fn new(
        tokenizer: Arc<dyn Tokenizer>,
        config: SharedConfig,
        token_counts: HashMap<String, u64>,
        vocab: Arc<Vocab>,
    ) -> Self {
        let (diacritics, deep) = {
            let cfg = config.read();
            (cfg.general.diacritics, cfg.general.spell_check_deep)
        };
        TokenNormalizer {
            tokenizer,
            config,
            spell_checker: SpellChecker::new(token_counts, diacritics, deep),
            vocab,
        }
    }
}

impl Component for TokenNormalizer {
    fn name(&self) -> &'static str {
        "token-normalizer"
    }

    fn kind(&self) -> ComponentKind {
        ComponentKind::Normalizing
    }

    fn process(&self, doc: &mut Document) -> Result<()> {
        let (min_len_normalize, do_not_normalize, spell_check, spell_check_limit) = {
            let cfg = self.config.read();
            (
                cfg.preprocessing.min_len_normalize,
                cfg.preprocessing.do_not_normalize.clone(),
                cfg.general.spell_check,
                cfg.general.spell_check_len_limit,
            )
        };

        for token in &mut doc.tokens {
            if token.lower.chars().count() < min_len_normalize {
                token.norm = token.lower.clone();
            } else if token
                .tag
                .as_ref()
                .is_some_and(|tag| do_not_normalize.contains(tag))
            {
                token.norm = token.lower.clone();
            } else if token.lemma == PRONOUN_SENTINEL {
                token.norm = PRONOUN_SENTINEL.to_string();
                token.to_skip = true;
            } else {
                token.norm = token.lemma.to_lowercase();
            }

            if spell_check
                && token.text.chars().count() >= spell_check_limit
                && !token.is_punctuation
                && !self.spell_checker.contains(&token.lower)
                && !self.vocab.contains(&token.lower)
                && !CONTAINS_NUMBER.is_match(&token.lower)
            {
                if let Some(fixed) = self.spell_checker.fix(&token.lower) {
                    let fixed_doc = self.tokenizer.tokenize(&fixed);
                    if let Some(tmp) = fixed_doc.tokens.first() {
                        token.norm = if fixed.chars().count() < min_len_normalize {
                            tmp.lower.clone()
                        } else {
                            tmp.lemma.to_lowercase()
                        };
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{shared, Config};
    use crate::tokenize::RegexTokenizer;

    fn checker(words: &[(&str, u64)]) -> SpellChecker {
        let dict = words.iter().map(|(w, c)| (w.to_string(), *c)).collect();
        SpellChecker::new(dict, false, false)
    }

    #[test]
    fn known_word_is_not_fixed() {
        let sc = checker(&[("failure", 10)]);
        assert_eq!(sc.fix("failure"), None);
    }

    #[test]
    fn one_edit_typo_is_fixed() {
        let sc = checker(&[("failure", 10)]);
        assert_eq!(sc.fix("failrue").as_deref(), Some("failure")); // transpose
        assert_eq!(sc.fix("failur").as_deref(), Some("failure")); // delete
        assert_eq!(sc.fix("failuree").as_deref(), Some("failure")); // insert
        assert_eq!(sc.fix("fajlure").as_deref(), Some("failure")); // replace
    }

    #[test]
    fn more_frequent_candidate_wins() {
        // "cold" (frequent) and "bold" (rare) are both 1 edit from "gold".
        let sc = checker(&[("cold", 100), ("bold", 1)]);
        assert_eq!(sc.fix("gold").as_deref(), Some("cold"));
    }

    #[test]
    fn two_edit_fix_needs_deep_mode() {
        let shallow = checker(&[("failure", 10)]);
        assert_eq!(shallow.fix("fialrue"), None);

        let dict: HashMap<String, u64> = [("failure".to_string(), 10)].into();
        let deep = SpellChecker::new(dict, false, true);
        assert_eq!(deep.fix("fialrue").as_deref(), Some("failure"));
    }

    fn normalize(text: &str, config: Config, counts: &[(&str, u64)]) -> Document {
        let tokenizer = Arc::new(RegexTokenizer::new(None));
        let mut doc = tokenizer.tokenize(text);
        let counts: HashMap<String, u64> =
            counts.iter().map(|(w, c)| (w.to_string(), *c)).collect();
        let normalizer = TokenNormalizer::new(
            tokenizer,
            shared(config),
            counts,
            Arc::new(Vocab::new()),
        );
        normalizer.process(&mut doc).unwrap();
        doc
    }

    #[test]
    fn short_tokens_keep_lowercase_raw() {
        let doc = normalize("HTN", Config::default(), &[]);
        assert_eq!(doc.tokens[0].norm, "htn");
    }

    #[test]
    fn protected_tags_are_not_normalized() {
        let tokenizer = Arc::new(RegexTokenizer::new(None));
        let mut doc = tokenizer.tokenize("Running");
        doc.tokens[0].tag = Some("VBG".into());
        doc.tokens[0].lemma = "run".into();
        let normalizer = TokenNormalizer::new(
            tokenizer,
            shared(Config::default()),
            HashMap::new(),
            Arc::new(Vocab::new()),
        );
        normalizer.process(&mut doc).unwrap();
        assert_eq!(doc.tokens[0].norm, "running");
    }

    #[test]
    fn pronoun_sentinel_skips_token() {
        let tokenizer = Arc::new(RegexTokenizer::new(None));
        let mut doc = tokenizer.tokenize("himself");
        doc.tokens[0].lemma = PRONOUN_SENTINEL.into();
        let normalizer = TokenNormalizer::new(
            tokenizer,
            shared(Config::default()),
            HashMap::new(),
            Arc::new(Vocab::new()),
        );
        normalizer.process(&mut doc).unwrap();
        assert_eq!(doc.tokens[0].norm, PRONOUN_SENTINEL);
        assert!(doc.tokens[0].to_skip);
    }

    #[test]
    fn long_misspelled_token_gets_fixed_norm() {
        // "failuree" (8 chars, >= default limit 7) fixes to "failure".
        let doc = normalize("failuree", Config::default(), &[("failure", 10)]);
        assert_eq!(doc.tokens[0].norm, "failure");
    }

    #[test]
    fn numeric_tokens_are_never_spellchecked() {
        let doc = normalize("failure2x", Config::default(), &[("failure", 10)]);
        assert_eq!(doc.tokens[0].norm, "failure2x");
    }

    #[test]
    fn spell_check_disabled_leaves_norm() {
        let mut config = Config::default();
        config.general.spell_check = false;
        let doc = normalize("failuree", config, &[("failure", 10)]);
        assert_eq!(doc.tokens[0].norm, "failuree");
    }
}
