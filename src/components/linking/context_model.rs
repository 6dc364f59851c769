//! Context-vector model: the learned state behind linking.
//!
//! A concept's meaning is represented as one dense vector per context
//! scale, accumulated online from the word vectors surrounding its
//! mentions. Scoring a candidate against a document compares the
//! document's multi-scale context vectors with the concept's stored ones
//! via weighted cosine similarity.
//!
//! Degenerate cases are defined, never NaN: a scale the concept has no
//! vector for contributes the −1 sentinel; a scale whose document window
//! resolves zero vocabulary words contributes 0; cosine against a zero
//! vector is 0.

use std::collections::BTreeMap;

use ndarray::Array1;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::cdb::Cdb;
use crate::config::{ContextScale, SharedConfig, ThresholdType};
use crate::error::Result;
use crate::rng::SplitMix64;
use crate::tokenize::{AnnotatedSpan, Document};
use crate::vocab::Vocab;

use super::super::SharedCdb;

/// Similarity reported for candidates that cannot be judged (untrained
/// concept, or everything below threshold).
pub const UNTRAINED_SIMILARITY: f32 = -1.0;

/// Cosine similarity with a defined zero for zero-norm or
/// dimension-mismatched vectors.
fn cosine(a: &Array1<f32>, b: &Array1<f32>) -> f32 {
    if a.len() != b.len() {
        log::warn!(
            "context vector dimension mismatch ({} vs {}), treating as orthogonal",
            a.len(),
            b.len()
        );
        return 0.0;
    }
    let norm_a = a.dot(a).sqrt();
    let norm_b = b.dot(b).sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        a.dot(b) / (norm_a * norm_b)
    }
}

/// The context model: computes document context vectors, scores
/// candidates, and applies online training updates to the CDB.
pub struct ContextModel {
    cdb: SharedCdb,
    vocab: Arc<Vocab>,
    config: SharedConfig,
    rng: Mutex<SplitMix64>,
}

impl ContextModel {
    /// Build over the shared CDB, vocabulary and config.
    #[must_use]
    pub fn new(cdb: SharedCdb, vocab: Arc<Vocab>, config: SharedConfig) -> Self {
        let seed = config.read().general.seed;
        ContextModel {
            cdb,
            vocab,
            config,
            rng: Mutex::new(SplitMix64::new(seed)),
        }
    }

    /// Draw from the model's deterministic generator.
    pub fn next_f64(&self) -> f64 {
        self.rng.lock().next_f64()
    }

    /// Pick a random element index.
    pub fn next_index(&self, bound: usize) -> usize {
        self.rng.lock().next_index(bound)
    }

    /// The document's context vector per scale.
    ///
    /// For each configured scale, the window is the `size` includable
    /// tokens each side of the span (plus the span's own tokens unless
    /// `context_ignore_center_tokens`); each token contributes its
    /// vocabulary vector and the window average is the context vector.
    /// Scales resolving zero vocabulary words get no entry.
    #[must_use]
    pub fn context_vectors(
        &self,
        doc: &Document,
        span: &AnnotatedSpan,
    ) -> BTreeMap<ContextScale, Array1<f32>> {
        let (sizes, ignore_center) = {
            let cfg = self.config.read();
            (
                cfg.components.linking.context_vector_sizes.clone(),
                cfg.components.linking.context_ignore_center_tokens,
            )
        };
        let mut vectors = BTreeMap::new();
        for (scale, size) in sizes {
            let words = self.window_words(doc, span, size, ignore_center);
            if let Some(average) = self.average_vector(words.iter().map(String::as_str)) {
                vectors.insert(scale, average);
            }
        }
        vectors
    }

    /// Normalized words of the window: up to `size` includable tokens on
    /// each side, in document order.
    fn window_words(
        &self,
        doc: &Document,
        span: &AnnotatedSpan,
        size: usize,
        ignore_center: bool,
    ) -> Vec<String> {
        let left: Vec<String> = doc.tokens[..span.token_start.min(doc.tokens.len())]
            .iter()
            .rev()
            .filter(|t| t.should_include())
            .take(size)
            .map(|t| t.norm.clone())
            .collect();
        let mut words: Vec<String> = left.into_iter().rev().collect();
        if !ignore_center {
            words.extend(
                doc.tokens[span.token_start..span.token_end.min(doc.tokens.len())]
                    .iter()
                    .filter(|t| t.should_include())
                    .map(|t| t.norm.clone()),
            );
        }
        words.extend(
            doc.tokens[span.token_end.min(doc.tokens.len())..]
                .iter()
                .filter(|t| t.should_include())
                .take(size)
                .map(|t| t.norm.clone()),
        );
        words
    }

    /// Average vocabulary vector over the words that have one.
    fn average_vector<'a>(&self, words: impl Iterator<Item = &'a str>) -> Option<Array1<f32>> {
        let mut sum: Option<Array1<f32>> = None;
        let mut count = 0usize;
        for word in words {
            if let Some(vector) = self.vocab.vector(word) {
                match &mut sum {
                    Some(total) if total.len() == vector.len() => *total += vector,
                    Some(_) => continue,
                    None => sum = Some(vector.clone()),
                }
                count += 1;
            }
        }
        sum.map(|total| total / count as f32)
    }

    /// Weighted multi-scale similarity between the document context and a
    /// concept's stored vectors.
    ///
    /// Concepts trained fewer than `train_count_threshold` times are
    /// never scored and report [`UNTRAINED_SIMILARITY`].
    #[must_use]
    pub fn similarity(
        &self,
        cui: &str,
        doc_vectors: &BTreeMap<ContextScale, Array1<f32>>,
        cdb: &Cdb,
    ) -> f32 {
        let (weights, threshold) = {
            let cfg = self.config.read();
            (
                cfg.components.linking.context_vector_weights.clone(),
                cfg.components.linking.train_count_threshold,
            )
        };
        let Some(info) = cdb.cui2info.get(cui) else {
            return UNTRAINED_SIMILARITY;
        };
        if info.count_train < threshold {
            return UNTRAINED_SIMILARITY;
        }
        let mut total = 0.0f32;
        for (scale, weight) in &weights {
            match info.context_vectors.get(scale) {
                None => total += UNTRAINED_SIMILARITY * weight,
                Some(stored) => match doc_vectors.get(scale) {
                    // Empty document window: defined low-similarity fallback.
                    None => {}
                    Some(observed) => total += cosine(observed, stored) * weight,
                },
            }
        }
        total
    }

    /// Pick the best candidate by boosted similarity.
    ///
    /// Two independent additive bonuses apply to positive similarities:
    /// the primary-name bonus when the detected name is the candidate's
    /// primary name, then a frequency bonus proportional to the
    /// candidate's share of the maximum training count among candidates.
    /// The boosted score is capped at 1.0. Returns the winning CUI and
    /// its boosted score.
    #[must_use]
    pub fn disambiguate(
        &self,
        candidates: &[String],
        detected_name: &str,
        doc_vectors: &BTreeMap<ContextScale, Array1<f32>>,
        cdb: &Cdb,
    ) -> Option<(String, f32)> {
        let (prefer_primary, prefer_frequent) = {
            let cfg = self.config.read();
            (
                cfg.components.linking.prefer_primary_name,
                cfg.components.linking.prefer_frequent_concepts,
            )
        };
        let max_count = candidates
            .iter()
            .filter_map(|cui| cdb.cui2info.get(cui))
            .map(|info| info.count_train)
            .max()
            .unwrap_or(0);

        let mut best: Option<(String, f32)> = None;
        for cui in candidates {
            let mut score = self.similarity(cui, doc_vectors, cdb);
            if score > 0.0 {
                if prefer_primary > 0.0 {
                    let is_primary = cdb
                        .name2info
                        .get(detected_name)
                        .map(|info| info.status_for(cui).is_primary())
                        .unwrap_or(false);
                    if is_primary {
                        score += prefer_primary;
                    }
                }
                if prefer_frequent > 0.0 && max_count > 0 {
                    let count = cdb.cui2info.get(cui).map_or(0, |info| info.count_train);
                    score += prefer_frequent * (count as f32 / max_count as f32);
                }
                score = score.min(1.0);
            }
            let better = match &best {
                None => true,
                Some((_, best_score)) => score > *best_score,
            };
            if better {
                best = Some((cui.clone(), score));
            }
        }
        best
    }

    /// Does this similarity pass the configured acceptance threshold?
    /// The boundary is inclusive.
    #[must_use]
    pub fn passes_threshold(&self, cui: &str, similarity: f32, cdb: &Cdb) -> bool {
        let (threshold, threshold_type) = {
            let cfg = self.config.read();
            (
                cfg.components.linking.similarity_threshold,
                cfg.components.linking.similarity_threshold_type,
            )
        };
        match threshold_type {
            ThresholdType::Static => similarity >= threshold,
            ThresholdType::Dynamic => {
                let average = cdb
                    .cui2info
                    .get(cui)
                    .map_or(0.0, |info| info.average_confidence);
                similarity >= average * threshold
            }
        }
    }

    /// Apply one training example for `cui` from this span's context.
    ///
    /// Positive examples move the concept's vectors toward the observed
    /// context, advance `count_train`, update the confidence average and
    /// credit the given name-forms; negative examples only push the
    /// vectors away. Returns the post-update similarity (the confidence
    /// recorded for positive examples).
    pub fn train(
        &self,
        cui: &str,
        span: &AnnotatedSpan,
        doc: &Document,
        negative: bool,
        names: &[String],
    ) -> Result<f32> {
        let observed = self.context_vectors(doc, span);
        let weight_decay = self.config.read().components.linking.optim.weight_decay;
        let mut cdb = self.cdb.write();
        if observed.is_empty() {
            log::debug!("no resolvable context for '{}', vectors unchanged", span.text);
        } else {
            cdb.update_context_vectors(cui, &observed, negative, weight_decay);
        }
        if negative {
            return Ok(UNTRAINED_SIMILARITY);
        }
        // A positive example counts even when its window resolved no
        // vectors; only the vectors stay untouched.
        let similarity = if observed.is_empty() {
            0.0
        } else {
            self.similarity(cui, &observed, &cdb).max(0.0)
        };
        cdb.record_positive_training(cui, None, similarity);
        for name in names {
            if let Some(name_info) = cdb.name2info.get_mut(name) {
                name_info.count_train += 1;
            }
        }
        Ok(similarity)
    }

    /// Apply one negative example built from vocabulary negative
    /// sampling: per scale, `size` words drawn proportional to
    /// frequency^0.75, averaged and pushed away from.
    pub fn train_using_negative_sampling(&self, cui: &str) -> Result<()> {
        let (sizes, ignore_punct_and_num, weight_decay) = {
            let cfg = self.config.read();
            (
                cfg.components.linking.context_vector_sizes.clone(),
                cfg.components.linking.negative_ignore_punct_and_num,
                cfg.components.linking.optim.weight_decay,
            )
        };
        let mut vectors = BTreeMap::new();
        {
            let mut rng = self.rng.lock();
            for (scale, size) in sizes {
                let words =
                    self.vocab
                        .get_negative_samples(size, ignore_punct_and_num, &mut rng)?;
                if let Some(average) =
                    self.average_vector(words.iter().map(String::as_str))
                {
                    vectors.insert(scale, average);
                }
            }
        }
        if vectors.is_empty() {
            return Ok(());
        }
        self.cdb
            .write()
            .update_context_vectors(cui, &vectors, true, weight_decay);
        Ok(())
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use ndarray::arr1;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn cosine_bounded(
            a in proptest::collection::vec(-100.0f32..100.0, 3),
            b in proptest::collection::vec(-100.0f32..100.0, 3),
        ) {
            let sim = cosine(&arr1(&a), &arr1(&b));
            prop_assert!(sim.is_finite());
            prop_assert!((-1.0001..=1.0001).contains(&sim));
        }
    }
}
