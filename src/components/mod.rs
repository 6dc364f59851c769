//! Pipeline components and their registry.
//!
//! Every core stage (tagging → normalizing → NER → linking) implements
//! [`Component`]: take the mutable document, transform it, hand it on.
//! Concrete implementations are constructed through a typed
//! [`ComponentRegistry`] keyed by `(kind, name)` — explicit registration,
//! lookup by name, loud failure on unknown names. Addons run after the
//! core stages and implement [`AddonComponent`].

pub mod linking;
pub mod ner;
pub mod normalizing;
pub mod tagging;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::cdb::Cdb;
use crate::config::SharedConfig;
use crate::error::{Error, Result};
use crate::tokenize::{AnnotatedSpan, Document, Tokenizer};
use crate::vocab::Vocab;

/// Shared concept-database handle.
pub type SharedCdb = Arc<RwLock<Cdb>>;

/// The four core pipeline stages, in conceptual order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    /// Token flagging (punctuation, skip-list, stopwords).
    Tagging,
    /// Token normalization and spell correction.
    Normalizing,
    /// Candidate-name detection.
    Ner,
    /// Context-based linking and disambiguation.
    Linking,
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ComponentKind::Tagging => "tagging",
            ComponentKind::Normalizing => "normalizing",
            ComponentKind::Ner => "ner",
            ComponentKind::Linking => "linking",
        };
        write!(f, "{name}")
    }
}

/// Everything a component factory may need.
#[derive(Clone)]
pub struct ComponentContext {
    /// The raw tokenizer (used e.g. by spell-fix re-tokenization).
    pub tokenizer: Arc<dyn Tokenizer>,
    /// The concept database.
    pub cdb: SharedCdb,
    /// The word vocabulary.
    pub vocab: Arc<Vocab>,
    /// The shared configuration.
    pub config: SharedConfig,
}

/// A pipeline stage operating on a mutable document.
pub trait Component: Send + Sync {
    /// Registered implementation name.
    fn name(&self) -> &'static str;

    /// Which stage this component fills.
    fn kind(&self) -> ComponentKind;

    /// Transform the document in place.
    fn process(&self, doc: &mut Document) -> Result<()>;

    /// Downcast to the trainable interface, if this component learns.
    fn as_trainable(&self) -> Option<&dyn TrainableComponent> {
        None
    }
}

impl std::fmt::Debug for dyn Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}

/// A component that can learn from a single labeled example.
pub trait TrainableComponent: Component {
    /// Apply one training example: the span in `doc` refers (or, when
    /// `negative`, does not refer) to `cui`. `names` are the prepared
    /// name-forms credited with the example.
    fn train(
        &self,
        cui: &str,
        span: &AnnotatedSpan,
        doc: &Document,
        negative: bool,
        names: &[String],
    ) -> Result<()>;
}

/// Post-core annotation enrichment (meta-annotations and the like).
///
/// Addons see the document after linking and may attach additional
/// information through the addon-data side-table; they never change the
/// core resolution.
pub trait AddonComponent: Send + Sync {
    /// Addon name, also used for its model-pack folder.
    fn addon_name(&self) -> &str;

    /// Enrich the finished document.
    fn process(&self, doc: &mut Document) -> Result<()>;
}

/// Factory signature for component construction.
pub type ComponentFactory = fn(&ComponentContext) -> Result<Box<dyn Component>>;

/// Typed map from `(kind, name)` to a component factory.
pub struct ComponentRegistry {
    factories: HashMap<(ComponentKind, String), ComponentFactory>,
}

impl ComponentRegistry {
    /// Registry with the `"default"` implementation of every stage.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = ComponentRegistry {
            factories: HashMap::new(),
        };
        registry.register(ComponentKind::Tagging, "default", |ctx| {
            Ok(Box::new(tagging::TagAndSkip::new(&ctx.config.read())))
        });
        registry.register(ComponentKind::Normalizing, "default", |ctx| {
            Ok(Box::new(normalizing::TokenNormalizer::new(
                Arc::clone(&ctx.tokenizer),
                Arc::clone(&ctx.config),
                ctx.cdb.read().token_counts.clone(),
                Arc::clone(&ctx.vocab),
            )))
        });
        registry.register(ComponentKind::Ner, "default", |ctx| {
            Ok(Box::new(ner::VocabBasedNer::new(
                Arc::clone(&ctx.cdb),
                Arc::clone(&ctx.config),
            )))
        });
        registry.register(ComponentKind::Linking, "default", |ctx| {
            Ok(Box::new(linking::Linker::new(
                Arc::clone(&ctx.cdb),
                Arc::clone(&ctx.vocab),
                Arc::clone(&ctx.config),
            )))
        });
        registry
    }

    /// Register a factory under `(kind, name)`. Re-registering replaces.
    pub fn register(&mut self, kind: ComponentKind, name: &str, factory: ComponentFactory) {
        self.factories.insert((kind, name.to_string()), factory);
    }

    /// Construct the component registered under `(kind, name)`.
    ///
    /// Unknown names and factory failures both surface as
    /// [`Error::ComponentInit`] naming the component and the config field
    /// to check.
    pub fn create(
        &self,
        kind: ComponentKind,
        name: &str,
        ctx: &ComponentContext,
    ) -> Result<Box<dyn Component>> {
        let factory = self.factories.get(&(kind, name.to_string())).ok_or_else(|| {
            Error::component_init(kind.to_string(), name, "no such component registered")
        })?;
        factory(ctx).map_err(|e| match e {
            err @ Error::ComponentInit { .. } => err,
            other => Error::component_init(kind.to_string(), name, other.to_string()),
        })
    }

    /// Registered names for a component kind.
    #[must_use]
    pub fn registered(&self, kind: ComponentKind) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .factories
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }
}
