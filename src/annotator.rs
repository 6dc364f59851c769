//! The top-level annotation engine.
//!
//! An [`Annotator`] bundles the CDB, vocabulary, config and the assembled
//! pipeline, and exposes the public surface: inference
//! ([`Annotator::get_entities`], [`Annotator::get_entities_multi`]),
//! vocabulary surgery ([`Annotator::unlink_concept_name`],
//! [`Annotator::add_and_train_concept`]) and model-pack persistence.
//!
//! Inference always forces `linking.train` off for its duration via a
//! scope guard — a leftover training flag must never mutate the model
//! during what looks like a read-only call. Training (which flips the
//! flag on) is single-process by contract; do not run it concurrently
//! with inference.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use rayon::prelude::*;

use crate::cdb::{prepare_name, Cdb, NameStatus};
use crate::components::{ComponentKind, ComponentRegistry, SharedCdb};
use crate::config::{shared, Config, ScopedTrain, SharedConfig};
use crate::error::Result;
use crate::output::{Entities, EntityRecord, OnlyCuiEntities};
use crate::pipeline::Pipeline;
use crate::storage::{self, LoadOptions};
use crate::tokenize::{AnnotatedSpan, Document, TokenizerRegistry};
use crate::trainer::{Trainer, TrainerBackend};
use crate::vocab::Vocab;

/// The assembled model: CDB + vocabulary + config + pipeline.
pub struct Annotator {
    cdb: SharedCdb,
    vocab: Arc<Vocab>,
    config: SharedConfig,
    pipeline: Pipeline,
}

impl Annotator {
    /// Build an annotator with the default registries.
    ///
    /// The vocabulary's sampling table is initialised here so negative
    /// sampling is ready for any subsequent training run.
    pub fn new(cdb: Cdb, mut vocab: Vocab, config: Config) -> Result<Self> {
        vocab.init_cumsums();
        let cdb = Arc::new(RwLock::new(cdb));
        let vocab = Arc::new(vocab);
        let config = shared(config);
        let pipeline = Pipeline::new(Arc::clone(&cdb), Arc::clone(&vocab), Arc::clone(&config))?;
        Ok(Annotator {
            cdb,
            vocab,
            config,
            pipeline,
        })
    }

    /// Build with custom tokenizer/component registries.
    pub fn with_registries(
        cdb: Cdb,
        mut vocab: Vocab,
        config: Config,
        tokenizers: &TokenizerRegistry,
        components: &ComponentRegistry,
    ) -> Result<Self> {
        vocab.init_cumsums();
        let cdb = Arc::new(RwLock::new(cdb));
        let vocab = Arc::new(vocab);
        let config = shared(config);
        let pipeline = Pipeline::with_registries(
            Arc::clone(&cdb),
            Arc::clone(&vocab),
            Arc::clone(&config),
            tokenizers,
            components,
        )?;
        Ok(Annotator {
            cdb,
            vocab,
            config,
            pipeline,
        })
    }

    /// The shared CDB handle.
    #[must_use]
    pub fn cdb(&self) -> &SharedCdb {
        &self.cdb
    }

    /// The shared config handle.
    #[must_use]
    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// The pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// A trainer over this annotator.
    #[must_use]
    pub fn trainer(&self) -> Trainer<'_, Annotator> {
        Trainer::new(Arc::clone(&self.cdb), Arc::clone(&self.config), self)
    }

    /// Run the pipeline with training forced off and return the document.
    pub fn annotate(&self, text: &str) -> Result<Document> {
        let _inference = ScopedTrain::set(&self.config, false);
        self.pipeline.get_doc(text)
    }

    /// Annotate and shape the output records.
    pub fn get_entities(&self, text: &str) -> Result<Entities> {
        let doc = self.annotate(text)?;
        Ok(self.doc_to_entities(&doc))
    }

    /// Annotate, returning only entity-id → CUI.
    pub fn get_cuis(&self, text: &str) -> Result<OnlyCuiEntities> {
        let doc = self.annotate(text)?;
        let mut out = OnlyCuiEntities::default();
        for span in &doc.final_spans {
            if let Some(cui) = &span.cui {
                out.entities.insert(span.id, cui.clone());
            }
        }
        if self.config.read().annotation_output.include_text_in_output {
            out.text = Some(doc.text.clone());
        }
        Ok(out)
    }

    /// Batch inference over many independent documents.
    ///
    /// Input is partitioned into per-worker shards by cumulative
    /// character count (documents vary wildly in size; raw counts balance
    /// poorly), mapped in parallel, and reassembled in input order. A
    /// failing document yields an `Err` at its own index and never
    /// disturbs its neighbours.
    pub fn get_entities_multi(&self, texts: &[&str]) -> Vec<Result<Entities>> {
        // One guard around the whole batch: per-call guards would race on
        // the shared flag across worker threads.
        let _inference = ScopedTrain::set(&self.config, false);

        let workers = match self.config.read().general.workers {
            0 => rayon::current_num_threads(),
            n => n,
        };
        let shards = shard_by_chars(texts, workers);

        let mut results: Vec<Option<Result<Entities>>> = Vec::new();
        results.resize_with(texts.len(), || None);

        let processed: Vec<(usize, Result<Entities>)> = shards
            .par_iter()
            .flat_map_iter(|shard| {
                shard.iter().map(|&index| {
                    let outcome = self
                        .pipeline
                        .get_doc(texts[index])
                        .map(|doc| self.doc_to_entities(&doc));
                    if let Err(e) = &outcome {
                        log::warn!("document {index} failed during batch inference: {e}");
                    }
                    (index, outcome)
                })
            })
            .collect();

        for (index, outcome) in processed {
            results[index] = Some(outcome);
        }
        results
            .into_iter()
            .map(|slot| slot.expect("every index is processed exactly once"))
            .collect()
    }

    fn doc_to_entities(&self, doc: &Document) -> Entities {
        let cfg = self.config.read();
        let out_cfg = &cfg.annotation_output;
        let separator = cfg.general.separator.clone();
        let with_context = out_cfg.context_left > 0 && out_cfg.context_right > 0;
        let doc_tokens: Vec<String> = if with_context {
            doc.tokens
                .iter()
                .map(|t| {
                    if out_cfg.lowercase_context {
                        t.text_with_ws.to_lowercase()
                    } else {
                        t.text_with_ws.clone()
                    }
                })
                .collect()
        } else {
            Vec::new()
        };

        let cdb = self.cdb.read();
        let mut out = Entities::default();
        for span in &doc.final_spans {
            let Some(cui) = &span.cui else { continue };
            let (context_left, context_center, context_right) = if with_context {
                let left_start = span.token_start.saturating_sub(out_cfg.context_left);
                let right_end = (span.token_end + out_cfg.context_right).min(doc_tokens.len());
                (
                    doc_tokens[left_start..span.token_start].to_vec(),
                    doc_tokens[span.token_start..span.token_end].to_vec(),
                    doc_tokens[span.token_end..right_end].to_vec(),
                )
            } else {
                (Vec::new(), Vec::new(), Vec::new())
            };
            out.entities.insert(
                span.id,
                EntityRecord {
                    pretty_name: cdb.get_name(cui, &separator),
                    cui: cui.clone(),
                    type_ids: cdb
                        .cui2info
                        .get(cui)
                        .map(|info| info.type_ids.iter().cloned().collect())
                        .unwrap_or_default(),
                    source_value: span.text.clone(),
                    detected_name: span.detected_name.clone(),
                    acc: span.context_similarity,
                    context_similarity: span.context_similarity,
                    start: span.char_start,
                    end: span.char_end,
                    id: span.id,
                    meta_anns: Default::default(),
                    context_left,
                    context_center,
                    context_right,
                },
            );
        }
        if out_cfg.include_text_in_output {
            out.text = Some(doc.text.clone());
        }
        out
    }

    /// Unlink a name from a CUI (or, with `general.full_unlink`, from
    /// every CUI carrying it). The name will no longer be detected for
    /// the affected concepts.
    pub fn unlink_concept_name(&self, cui: &str, name: &str, preprocessed: bool) -> Result<()> {
        let (separator, full_unlink) = {
            let cfg = self.config.read();
            (cfg.general.separator.clone(), cfg.general.full_unlink)
        };
        let names: Vec<String> = if preprocessed {
            vec![name.to_string()]
        } else {
            prepare_name(name, self.pipeline.tokenizer().as_ref(), &self.config.read())
                .map(|p| p.name)
                .into_iter()
                .collect()
        };
        if names.is_empty() {
            log::warn!("unlink_concept_name: nothing to unlink for '{name}'");
            return Ok(());
        }

        let mut cuis = vec![cui.to_string()];
        if full_unlink {
            log::warn!(
                "full_unlink is set; removing every CUI linked to '{name}', not just '{cui}'"
            );
            let cdb = self.cdb.read();
            for n in &names {
                if let Some(info) = cdb.name2info.get(n) {
                    cuis.extend(info.cuis.iter().cloned());
                }
            }
        }

        let mut cdb = self.cdb.write();
        for c in &cuis {
            cdb.remove_names(c, names.iter().map(String::as_str), &separator);
        }
        Ok(())
    }

    /// Add a name to a concept (creating the concept if needed) and, when
    /// a document span is supplied, train the linker on it.
    ///
    /// `negative` marks the example as a counter-example (and suppresses
    /// the vocabulary insertion); `devalue_others` additionally issues
    /// negative updates to every other concept ambiguous with the name.
    #[allow(clippy::too_many_arguments)]
    pub fn add_and_train_concept(
        &self,
        cui: &str,
        name: &str,
        doc: Option<&Document>,
        span: Option<&AnnotatedSpan>,
        name_status: NameStatus,
        type_ids: BTreeSet<String>,
        negative: bool,
        devalue_others: bool,
    ) -> Result<()> {
        let separator = self.config.read().general.separator.clone();
        let prepared: Vec<_> =
            prepare_name(name, self.pipeline.tokenizer().as_ref(), &self.config.read())
                .into_iter()
                .collect();
        if prepared.is_empty() && name_status == NameStatus::Primary {
            log::warn!(
                "no names could be prepared for CUI '{cui}' from '{name}'; \
                 no preferred name can be set"
            );
        }
        if !negative {
            self.cdb.write().add_concept(
                cui,
                &prepared,
                name_status,
                type_ids,
                BTreeSet::new(),
                None,
                true,
                &separator,
            );
        }

        let (Some(doc), Some(span)) = (doc, span) else {
            return Ok(());
        };
        let linker = self.pipeline.get_component(ComponentKind::Linking)?;
        let Some(trainable) = linker.as_trainable() else {
            log::warn!("linking component cannot be trained; skipping example");
            return Ok(());
        };
        let names: Vec<String> = prepared.iter().map(|p| p.name.clone()).collect();
        trainable.train(cui, span, doc, negative, &names)?;

        if !negative && devalue_others {
            let others: Vec<String> = {
                let cdb = self.cdb.read();
                names
                    .iter()
                    .filter_map(|n| cdb.name2info.get(n))
                    .flat_map(|info| info.cuis.iter().cloned())
                    .filter(|other| other != cui)
                    .collect()
            };
            for other in others {
                trainable.train(&other, span, doc, true, &[])?;
            }
        }
        Ok(())
    }

    /// Persist the model (config + CDB + vocabulary + addon manifest) to
    /// a directory.
    pub fn save_model_pack(&self, dir: &Path) -> Result<()> {
        let addon_names: Vec<String> = self
            .pipeline
            .addons()
            .map(|a| a.addon_name().to_string())
            .collect();
        storage::save_model_pack(
            dir,
            &self.config.read(),
            &self.cdb.read(),
            &self.vocab,
            &addon_names,
        )
    }

    /// Load a model pack saved by [`Annotator::save_model_pack`].
    pub fn load_model_pack(dir: &Path, options: LoadOptions) -> Result<Self> {
        let (config, cdb, vocab) = storage::load_model_pack(dir, options)?;
        Annotator::new(cdb, vocab, config)
    }
}

impl TrainerBackend for Annotator {
    fn run_pipeline(&self, text: &str) -> Result<Document> {
        // Deliberately does NOT scope the train flag: the trainer owns it.
        self.pipeline.get_doc(text)
    }

    fn unlink_concept_name(&self, cui: &str, name: &str, preprocessed: bool) -> Result<()> {
        Annotator::unlink_concept_name(self, cui, name, preprocessed)
    }

    fn add_and_train(
        &self,
        cui: &str,
        name: &str,
        doc: &Document,
        span: &AnnotatedSpan,
        negative: bool,
    ) -> Result<()> {
        self.add_and_train_concept(
            cui,
            name,
            Some(doc),
            Some(span),
            NameStatus::Automatic,
            BTreeSet::new(),
            negative,
            false,
        )
    }
}

/// Partition indices into `workers` shards balanced by cumulative
/// character count.
fn shard_by_chars(texts: &[&str], workers: usize) -> Vec<Vec<usize>> {
    let workers = workers.max(1);
    let total: usize = texts.iter().map(|t| t.len()).sum();
    let budget = (total / workers).max(1);
    let mut shards: Vec<Vec<usize>> = vec![Vec::new()];
    let mut current = 0usize;
    for (index, text) in texts.iter().enumerate() {
        let shard_full = current >= budget
            && shards.len() < workers
            && shards.last().is_some_and(|shard| !shard.is_empty());
        if shard_full {
            shards.push(vec![index]);
            current = text.len();
        } else {
            shards
                .last_mut()
                .expect("at least one shard")
                .push(index);
            current += text.len();
        }
    }
    shards
}
