//! Training loops: unsupervised corpus feeding and supervised exports.
//!
//! The trainer drives the pipeline through a [`TrainerBackend`] — a small
//! seam (run the pipeline, unlink a name, add/train a concept) that
//! decouples it from the concrete annotator and keeps it testable with
//! fakes. Training mode and filter scoping are applied through RAII
//! guards, so the previous configuration is restored on every exit path.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Deserializer, Serialize};

use crate::components::SharedCdb;
use crate::config::{
    LinkingFilters, ScopedFilters, ScopedTrain, SharedConfig, TrainingDescriptor,
};
use crate::error::Result;
use crate::tokenize::{AnnotatedSpan, Document};

// =============================================================================
// Export data model
// =============================================================================

/// A supervised training export: projects → documents → annotations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerExport {
    /// The annotated projects.
    pub projects: Vec<TrainerProject>,
}

impl TrainerExport {
    /// Parse from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// One annotation project with an optional CUI scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerProject {
    /// Project name.
    #[serde(default)]
    pub name: String,
    /// Project CUI filter; accepts both a list and the legacy
    /// comma-separated string form. Empty means no project scoping.
    #[serde(default, deserialize_with = "de_cui_list")]
    pub cuis: Vec<String>,
    /// The project's documents.
    #[serde(default)]
    pub documents: Vec<TrainerDocument>,
}

/// One annotated document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerDocument {
    /// Optional document name.
    #[serde(default)]
    pub name: Option<String>,
    /// The raw text.
    pub text: String,
    /// Manual annotations.
    #[serde(default)]
    pub annotations: Vec<TrainerAnnotation>,
}

/// One manual annotation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerAnnotation {
    /// Annotated concept.
    pub cui: String,
    /// Span start (byte offset).
    pub start: usize,
    /// Span end (byte offset, exclusive).
    pub end: usize,
    /// The annotated text.
    pub value: String,
    /// Terminated: the name must be unlinked from the CUI.
    #[serde(default)]
    pub killed: bool,
    /// Marked incorrect: train as a negative example.
    #[serde(default)]
    pub deleted: bool,
}

fn de_cui_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrString {
        List(Vec<String>),
        Joined(String),
    }
    Ok(match ListOrString::deserialize(deserializer)? {
        ListOrString::List(list) => list,
        ListOrString::Joined(joined) => joined
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
    })
}

// =============================================================================
// Backend seam
// =============================================================================

/// What the trainer needs from the surrounding engine.
pub trait TrainerBackend {
    /// Run the pipeline over a text, respecting the current train flag.
    fn run_pipeline(&self, text: &str) -> Result<Document>;

    /// Unlink a (raw) name from a CUI.
    fn unlink_concept_name(&self, cui: &str, name: &str, preprocessed: bool) -> Result<()>;

    /// Add/reinforce a concept with the given span as context.
    fn add_and_train(
        &self,
        cui: &str,
        name: &str,
        doc: &Document,
        span: &AnnotatedSpan,
        negative: bool,
    ) -> Result<()>;
}

// =============================================================================
// Options & stats
// =============================================================================

/// Options for supervised training.
#[derive(Debug, Clone, Default)]
pub struct SupervisedOptions {
    /// Defer `killed` unlinking to the end of the whole export instead of
    /// applying it per annotation.
    pub terminate_last: bool,
    /// Train spans the pipeline produced but the export does not cover as
    /// explicit negatives.
    pub train_from_false_positives: bool,
    /// Extra CUI filter intersected with each project's own filter.
    pub extra_cui_filter: Option<HashSet<String>>,
}

/// Counters from a supervised run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisedStats {
    /// Documents fed through the pipeline.
    pub docs_trained: usize,
    /// Positive examples applied.
    pub positives: usize,
    /// Negative (`deleted`) examples applied.
    pub negatives: usize,
    /// `killed` annotations unlinked.
    pub terminated: usize,
    /// False positives trained as negatives.
    pub false_positives: usize,
    /// Annotations skipped by filters or span mapping.
    pub skipped: usize,
}

// =============================================================================
// Trainer
// =============================================================================

/// Drives unsupervised and supervised training over a backend.
pub struct Trainer<'a, B: TrainerBackend> {
    cdb: SharedCdb,
    config: SharedConfig,
    backend: &'a B,
}

impl<'a, B: TrainerBackend> Trainer<'a, B> {
    /// Build over the shared state and a backend.
    #[must_use]
    pub fn new(cdb: SharedCdb, config: SharedConfig, backend: &'a B) -> Self {
        Trainer {
            cdb,
            config,
            backend,
        }
    }

    /// Unsupervised training: feed every line of the corpus through the
    /// pipeline with training forced on.
    ///
    /// Blank lines are skipped with a warning; a line that errors is
    /// logged with a snippet and skipped — noisy corpora are the expected
    /// failure mode and must never abort the run. With `fine_tune` false,
    /// all previous training state is cleared first.
    pub fn train_unsupervised<I, S>(
        &self,
        data: I,
        nepochs: usize,
        fine_tune: bool,
        progress_print: usize,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S> + Clone,
        S: AsRef<str>,
    {
        if !fine_tune {
            log::info!("removing old training data");
            self.cdb.write().reset_training();
        }
        let _training = ScopedTrain::set(&self.config, true);

        let mut num_docs = 0usize;
        let mut step = 0usize;
        for epoch in 0..nepochs {
            for line in data.clone() {
                let line = line.as_ref().trim();
                if line.is_empty() {
                    log::warn!("empty line detected and skipped");
                } else if let Err(e) = self.backend.run_pipeline(line) {
                    let snippet: String = line.chars().take(100).collect();
                    log::warn!("LINE '{snippet}…' WAS SKIPPED");
                    log::warn!("BECAUSE OF: {e}");
                }
                if epoch == 0 {
                    num_docs += 1;
                }
                step += 1;
                if progress_print > 0 && step % progress_print == 0 {
                    log::info!("DONE: {step}");
                }
            }
        }

        self.config.write().meta.unsup_trained.push(TrainingDescriptor {
            project_name: None,
            num_docs,
            num_epochs: nepochs,
        });
        Ok(())
    }

    /// Supervised training from a structured export.
    ///
    /// Per project, the active linking filters are scoped to the
    /// project's CUI set (intersected with any extra filter) and restored
    /// afterwards. `killed` annotations unlink the name from the CUI
    /// (immediately, or at the very end with
    /// [`SupervisedOptions::terminate_last`]); `deleted` annotations
    /// train as negatives; everything else trains as positives when it
    /// passes the active filters.
    pub fn train_supervised_raw(
        &self,
        export: &TrainerExport,
        options: &SupervisedOptions,
    ) -> Result<SupervisedStats> {
        // The pipeline pass runs in inference mode: only the explicit
        // adder calls may move counters, so N positive annotations move a
        // concept's count by exactly N.
        let _training = ScopedTrain::set(&self.config, false);
        let mut stats = SupervisedStats::default();
        let mut terminated: Vec<(String, String)> = Vec::new();

        for project in &export.projects {
            let _scoped_filters = self.project_filters(project, options);

            for document in &project.documents {
                let mut doc = match self.backend.run_pipeline(&document.text) {
                    Ok(doc) => doc,
                    Err(e) => {
                        log::warn!(
                            "document '{}' in project '{}' skipped: {e}",
                            document.name.as_deref().unwrap_or("?"),
                            project.name
                        );
                        continue;
                    }
                };
                stats.docs_trained += 1;

                for ann in &document.annotations {
                    if ann.killed {
                        if options.terminate_last {
                            terminated.push((ann.cui.clone(), ann.value.clone()));
                        } else {
                            self.backend.unlink_concept_name(&ann.cui, &ann.value, false)?;
                        }
                        stats.terminated += 1;
                        continue;
                    }
                    if !self
                        .config
                        .read()
                        .components
                        .linking
                        .filters
                        .check(&ann.cui)
                    {
                        stats.skipped += 1;
                        continue;
                    }
                    let Some((start, end)) = doc.token_range_for_chars(ann.start, ann.end)
                    else {
                        log::warn!(
                            "annotation '{}' [{}, {}) maps to no tokens; skipped",
                            ann.value,
                            ann.start,
                            ann.end
                        );
                        stats.skipped += 1;
                        continue;
                    };
                    let span = doc.carve_span(start, end)?;
                    self.backend
                        .add_and_train(&ann.cui, &ann.value, &doc, &span, ann.deleted)?;
                    if ann.deleted {
                        stats.negatives += 1;
                    } else {
                        stats.positives += 1;
                    }
                }

                if options.train_from_false_positives {
                    stats.false_positives +=
                        self.train_false_positives(&doc, &document.annotations)?;
                }
            }

            self.config.write().meta.sup_trained.push(TrainingDescriptor {
                project_name: Some(project.name.clone()),
                num_docs: project.documents.len(),
                num_epochs: 1,
            });
        }

        for (cui, name) in terminated {
            self.backend.unlink_concept_name(&cui, &name, false)?;
        }
        Ok(stats)
    }

    /// Pipeline spans the export does not cover become explicit
    /// negatives for the CUI they resolved to.
    fn train_false_positives(
        &self,
        doc: &Document,
        annotations: &[TrainerAnnotation],
    ) -> Result<usize> {
        let covered: HashMap<(usize, usize), &TrainerAnnotation> = annotations
            .iter()
            .map(|ann| ((ann.start, ann.end), ann))
            .collect();
        let mut trained = 0usize;
        for span in &doc.final_spans {
            let Some(cui) = &span.cui else { continue };
            let overlaps_gold = covered.keys().any(|&(start, end)| {
                span.char_start < end && start < span.char_end
            });
            if overlaps_gold {
                continue;
            }
            self.backend
                .add_and_train(cui, &span.text, doc, span, true)?;
            trained += 1;
        }
        Ok(trained)
    }

    fn project_filters(
        &self,
        project: &TrainerProject,
        options: &SupervisedOptions,
    ) -> Option<ScopedFilters> {
        let project_cuis: HashSet<String> = project.cuis.iter().cloned().collect();
        let scoped = match (&options.extra_cui_filter, project_cuis.is_empty()) {
            (Some(extra), false) => Some(project_cuis.intersection(extra).cloned().collect()),
            (Some(extra), true) => Some(extra.clone()),
            (None, false) => Some(project_cuis),
            (None, true) => None,
        };
        scoped.map(|cuis: HashSet<String>| {
            ScopedFilters::set(
                &self.config,
                LinkingFilters {
                    cuis,
                    cuis_exclude: HashSet::new(),
                },
            )
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
