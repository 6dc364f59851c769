//! Linking: resolve candidate spans to concepts using context similarity.
//!
//! For every candidate span the linker either *infers* (filter →
//! fast-path or disambiguate → threshold → accept/drop) or *trains*
//! (unambiguous candidates update their concept's context vectors),
//! depending on the `linking.train` flag. The flag is controlled by scope
//! guards: the annotator forces it off for inference, the trainer forces
//! it on — leaving it on would silently mutate the model during what
//! looks like read-only inference.

pub mod context_model;

pub use context_model::{ContextModel, UNTRAINED_SIMILARITY};

use std::sync::Arc;

use crate::cdb::NameStatus;
use crate::config::SharedConfig;
use crate::error::{Error, Result};
use crate::tokenize::{AnnotatedSpan, Document};
use crate::vocab::Vocab;

use super::{Component, ComponentKind, SharedCdb, TrainableComponent};

/// The default context-based linking component.
pub struct Linker {
    model: ContextModel,
    cdb: SharedCdb,
    config: SharedConfig,
}

impl Linker {
    /// Build over the shared CDB, vocabulary and config.
    #[must_use]
    pub fn new(cdb: SharedCdb, vocab: Arc<Vocab>, config: SharedConfig) -> Self {
        Linker {
            model: ContextModel::new(Arc::clone(&cdb), vocab, Arc::clone(&config)),
            cdb,
            config,
        }
    }

    /// The underlying context model.
    #[must_use]
    pub fn model(&self) -> &ContextModel {
        &self.model
    }

    /// Inference for one span. Returns true when the span was resolved
    /// and should be kept.
    fn link_span(&self, span: &mut AnnotatedSpan, doc: &Document) -> Result<bool> {
        let (filters, filter_before_disamb, disamb_length_limit, always_calculate) = {
            let cfg = self.config.read();
            let linking = &cfg.components.linking;
            (
                linking.filters.clone(),
                linking.filter_before_disamb,
                linking.disamb_length_limit,
                linking.always_calculate_similarity,
            )
        };

        let filtered: Vec<String> = span
            .link_candidates
            .iter()
            .filter(|cui| filters.check(cui))
            .cloned()
            .collect();
        if filtered.is_empty() {
            return Ok(false);
        }

        if filtered.len() == 1 {
            let cui = &filtered[0];
            // Trainer-driven evaluation: singleton candidates skip
            // disambiguation entirely.
            if filter_before_disamb {
                accept(span, cui.clone(), 1.0);
                return Ok(true);
            }
            // Fast path: a long name that is this concept's primary name
            // needs no similarity evidence.
            let status = self
                .cdb
                .read()
                .name2info
                .get(&span.detected_name)
                .map(|info| info.status_for(cui))
                .unwrap_or_default();
            if span.detected_name.chars().count() > disamb_length_limit
                && status == NameStatus::Primary
                && !always_calculate
            {
                accept(span, cui.clone(), 1.0);
                return Ok(true);
            }
        }

        let doc_vectors = self.model.context_vectors(doc, span);
        let cdb = self.cdb.read();
        if let Some((cui, score)) =
            self.model
                .disambiguate(&filtered, &span.detected_name, &doc_vectors, &cdb)
        {
            if self.model.passes_threshold(&cui, score, &cdb) {
                accept(span, cui, score);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Unsupervised training for one span. Only unambiguous (post-filter)
    /// candidates are trusted as positive examples.
    fn train_on_span(&self, span: &mut AnnotatedSpan, doc: &Document) -> Result<bool> {
        let (filters, replacement_keep, negative_probability, devalue) = {
            let cfg = self.config.read();
            let linking = &cfg.components.linking;
            (
                linking.filters.clone(),
                linking.random_replacement_unsupervised,
                linking.negative_probability,
                linking.devalue_linked_concepts,
            )
        };

        let candidates: Vec<String> = span
            .link_candidates
            .iter()
            .filter(|cui| filters.check(cui))
            .cloned()
            .collect();
        if candidates.len() != 1 {
            return Ok(false);
        }
        let cui = candidates.into_iter().next().expect("len checked");

        // Regularization: sometimes credit a random synonym of the
        // concept instead of the detected name.
        let mut names = vec![span.detected_name.clone()];
        if replacement_keep < 1.0 && self.model.next_f64() >= replacement_keep {
            let cdb = self.cdb.read();
            if let Some(info) = cdb.cui2info.get(&cui) {
                if !info.names.is_empty() {
                    let pick = self.model.next_index(info.names.len());
                    if let Some(synonym) = info.names.iter().nth(pick) {
                        names = vec![synonym.clone()];
                    }
                }
            }
        }

        let confidence = self.model.train(&cui, span, doc, false, &names)?;

        if self.model.next_f64() < negative_probability {
            match self.model.train_using_negative_sampling(&cui) {
                Err(Error::CumsumsNotInitialised) => {
                    log::warn!(
                        "negative sampling skipped: vocab cumulative sums not initialised"
                    );
                }
                other => other?,
            }
        }

        if devalue {
            let others: Vec<String> = {
                let cdb = self.cdb.read();
                cdb.name2info
                    .get(&span.detected_name)
                    .map(|info| {
                        info.cuis
                            .iter()
                            .filter(|other| *other != &cui)
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default()
            };
            for other in others {
                self.model.train(&other, span, doc, true, &[])?;
            }
        }

        span.cui = Some(cui);
        span.context_similarity = 1.0;
        span.confidence = confidence;
        Ok(true)
    }
}

fn accept(span: &mut AnnotatedSpan, cui: String, similarity: f32) {
    span.cui = Some(cui);
    span.context_similarity = similarity;
    span.confidence = similarity;
}

impl Component for Linker {
    fn name(&self) -> &'static str {
        "context-linker"
    }

    fn kind(&self) -> ComponentKind {
        ComponentKind::Linking
    }

    fn process(&self, doc: &mut Document) -> Result<()> {
        let train = self.config.read().components.linking.train;
        let spans = std::mem::take(&mut doc.spans);
        for mut span in spans {
            let keep = if train {
                self.train_on_span(&mut span, doc)?
            } else {
                self.link_span(&mut span, doc)?
            };
            if keep {
                doc.final_spans.push(span);
            }
        }
        doc.final_spans.sort_by_key(|s| s.char_start);
        Ok(())
    }

    fn as_trainable(&self) -> Option<&dyn TrainableComponent> {
        Some(self)
    }
}

impl TrainableComponent for Linker {
    fn train(
        &self,
        cui: &str,
        span: &AnnotatedSpan,
        doc: &Document,
        negative: bool,
        names: &[String],
    ) -> Result<()> {
        self.model.train(cui, span, doc, negative, names)?;
        Ok(())
    }
}
