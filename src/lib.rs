//! # medanno
//!
//! Clinical-text concept annotation for Rust.
//!
//! Given free text, medanno detects spans referring to concepts in a
//! controlled medical vocabulary (the concept database, CDB),
//! disambiguates ambiguous names with online-learned context vectors, and
//! can train those vectors from raw corpora or annotated exports.
//!
//! - **Pipeline**: tagging → normalization → candidate NER → linking,
//!   each stage a pluggable [`components::Component`] over a mutable
//!   [`tokenize::Document`]
//! - **Linking**: multi-scale context vectors, weighted cosine
//!   similarity, primary-name/frequency tie-breaks, static or dynamic
//!   thresholds
//! - **Training**: online updates with annealed learning rates, negative
//!   sampling, supervised exports with per-project filter scoping
//!
//! ## Quick Start
//!
//! ```rust
//! use medanno::{Annotator, Cdb, Config, NameStatus, Vocab};
//! use medanno::cdb::prepare_name;
//! use medanno::tokenize::RegexTokenizer;
//!
//! let config = Config::default();
//! let tokenizer = RegexTokenizer::new(None);
//! let mut cdb = Cdb::new();
//! let names: Vec<_> = prepare_name("kidney failure", &tokenizer, &config)
//!     .into_iter()
//!     .collect();
//! cdb.add_concept(
//!     "C001", &names, NameStatus::Primary,
//!     Default::default(), Default::default(), None, false, "~",
//! );
//!
//! let annotator = Annotator::new(cdb, Vocab::new(), config).unwrap();
//! let out = annotator.get_entities("Admitted with kidney failure.").unwrap();
//! assert_eq!(out.entities.len(), 1);
//! ```
//!
//! ## Training
//!
//! ```rust,ignore
//! // Unsupervised: any iterable of text lines.
//! let trainer = annotator.trainer();
//! trainer.train_unsupervised(corpus_lines, 1, true, 1000)?;
//!
//! // Supervised: a trainer export (projects → documents → annotations).
//! let export = TrainerExport::from_json(&json)?;
//! trainer.train_supervised_raw(&export, &SupervisedOptions::default())?;
//! ```
//!
//! ## Design
//!
//! - **Explicit registries**: tokenizers and components are constructed
//!   through typed factory maps; unknown names fail loudly with the
//!   config field to fix.
//! - **Scoped overrides**: training mode and filters are flipped through
//!   RAII guards, restored on every exit path.
//! - **Defined degenerate cases**: empty context windows, zero vectors
//!   and unknown CUIs produce defined low-similarity results, never NaN
//!   and never a crash in output shaping.

#![warn(missing_docs)]

pub mod annotator;
pub mod cdb;
pub mod components;
pub mod config;
mod error;
pub mod output;
pub mod pipeline;
pub mod rng;
pub mod storage;
pub mod tokenize;
pub mod trainer;
pub mod vocab;

pub use annotator::Annotator;
pub use cdb::{Cdb, CuiInfo, NameInfo, NameStatus};
pub use config::{Config, ContextScale, LinkingFilters, ScopedFilters, ScopedTrain};
pub use error::{Error, Result};
pub use output::{Entities, EntityRecord, OnlyCuiEntities};
pub use pipeline::Pipeline;
pub use storage::LoadOptions;
pub use trainer::{SupervisedOptions, SupervisedStats, Trainer, TrainerExport};
pub use vocab::Vocab;

pub mod prelude {
    //! Commonly used items, re-exported for convenience.
    //!
    //! ```rust
    //! use medanno::prelude::*;
    //!
    //! let annotator = Annotator::new(Cdb::new(), Vocab::new(), Config::default()).unwrap();
    //! let out = annotator.get_entities("no concepts here").unwrap();
    //! assert!(out.entities.is_empty());
    //! ```
    pub use crate::annotator::Annotator;
    pub use crate::cdb::{Cdb, NameStatus};
    pub use crate::components::{Component, ComponentKind, ComponentRegistry};
    pub use crate::config::{Config, ContextScale, LinkingFilters};
    pub use crate::error::{Error, Result};
    pub use crate::output::{Entities, EntityRecord};
    pub use crate::tokenize::{Document, RegexTokenizer, Tokenizer};
    pub use crate::trainer::{SupervisedOptions, Trainer, TrainerExport};
    pub use crate::vocab::Vocab;
}
