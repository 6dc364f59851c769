//! Word vocabulary: frequencies, static word vectors, negative sampling.
//!
//! The vocabulary serves three consumers:
//!
//! 1. the normalizer's spell checker (word frequencies),
//! 2. the context model (per-word static vectors feeding context vectors),
//! 3. unsupervised training (frequency-proportional negative sampling).
//!
//! Negative sampling uses a unigram table over `count^0.75`, the standard
//! word2vec-style flattening. [`Vocab::init_cumsums`] must be called before
//! any sampling; it is skipped during (de)serialization and rebuilt on
//! demand after load.

use std::collections::HashMap;

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rng::SplitMix64;

/// Frequency-flattening power for the unigram sampling table.
const UNIGRAM_POWER: f64 = 0.75;

/// One vocabulary entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordInfo {
    /// Corpus frequency.
    pub count: u64,
    /// Static embedding; words without vectors still count for spell
    /// checking but never contribute to context vectors.
    pub vector: Option<Array1<f32>>,
}

/// Word → (frequency, static vector) store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Vocab {
    words: HashMap<String, WordInfo>,
    /// Words eligible for negative sampling, aligned with `cum_probs`.
    #[serde(skip)]
    sample_words: Vec<String>,
    /// Cumulative `count^0.75` probabilities over `sample_words`.
    #[serde(skip)]
    cum_probs: Vec<f64>,
}

impl Vocab {
    /// Empty vocabulary.
    #[must_use]
    pub fn new() -> Self {
        Vocab::default()
    }

    /// Number of known words.
    #[must_use]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Is the vocabulary empty?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Is the word known?
    #[must_use]
    pub fn contains(&self, word: &str) -> bool {
        self.words.contains_key(word)
    }

    /// Add a word, or update it.
    ///
    /// When the word already exists and `replace` is false, the existing
    /// entry is kept untouched; with `replace` true the count and vector
    /// are overwritten.
    pub fn add_word(&mut self, word: &str, count: u64, vector: Option<Array1<f32>>, replace: bool) {
        if self.words.contains_key(word) && !replace {
            return;
        }
        self.words
            .insert(word.to_string(), WordInfo { count, vector });
        // Any previously-built sampling table is now stale.
        self.sample_words.clear();
        self.cum_probs.clear();
    }

    /// Corpus frequency of a word; 0 if unknown.
    #[must_use]
    pub fn count(&self, word: &str) -> u64 {
        self.words.get(word).map_or(0, |info| info.count)
    }

    /// Static vector of a word, if it has one.
    #[must_use]
    pub fn vector(&self, word: &str) -> Option<&Array1<f32>> {
        self.words.get(word).and_then(|info| info.vector.as_ref())
    }

    /// Iterate over all words.
    pub fn words(&self) -> impl Iterator<Item = (&str, &WordInfo)> {
        self.words.iter().map(|(w, info)| (w.as_str(), info))
    }

    /// Build the cumulative unigram table used by negative sampling.
    ///
    /// Only words carrying a vector participate; sampling a vector-less
    /// word would contribute nothing to a context update. Call this once
    /// after the vocabulary is populated (and again after a load).
    pub fn init_cumsums(&mut self) {
        let mut words: Vec<&String> = self
            .words
            .iter()
            .filter(|(_, info)| info.vector.is_some())
            .map(|(w, _)| w)
            .collect();
        // Stable order keeps sampling reproducible across runs.
        words.sort();

        self.sample_words = words.iter().map(|w| (*w).clone()).collect();
        self.cum_probs.clear();
        let mut total = 0.0;
        for word in &self.sample_words {
            total += (self.words[word].count as f64).powf(UNIGRAM_POWER);
            self.cum_probs.push(total);
        }
        if total > 0.0 {
            for p in &mut self.cum_probs {
                *p /= total;
            }
        }
    }

    /// Has [`Vocab::init_cumsums`] been run since the last mutation?
    #[must_use]
    pub fn cumsums_ready(&self) -> bool {
        !self.cum_probs.is_empty()
    }

    /// Draw up to `n` words proportional to `count^0.75`.
    ///
    /// With `ignore_punct_and_num` set, sampled words that are not purely
    /// alphabetic are discarded, so fewer than `n` words may be returned.
    pub fn get_negative_samples(
        &self,
        n: usize,
        ignore_punct_and_num: bool,
        rng: &mut SplitMix64,
    ) -> Result<Vec<String>> {
        if self.cum_probs.is_empty() {
            return Err(Error::CumsumsNotInitialised);
        }
        let mut samples = Vec::with_capacity(n);
        for _ in 0..n {
            let draw = rng.next_f64();
            let idx = match self
                .cum_probs
                .binary_search_by(|p| p.partial_cmp(&draw).expect("cumsum is finite"))
            {
                Ok(i) | Err(i) => i.min(self.sample_words.len() - 1),
            };
            let word = &self.sample_words[idx];
            if ignore_punct_and_num && !word.chars().all(char::is_alphabetic) {
                continue;
            }
            samples.push(word.clone());
        }
        Ok(samples)
    }
}
