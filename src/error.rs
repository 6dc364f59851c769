//! Error types for medanno.

use thiserror::Error;

/// Result type for medanno operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for medanno operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A pipeline component could not be constructed.
    ///
    /// Carries the component kind and configured name so the failure is
    /// attributable to a concrete config field rather than a generic
    /// type error.
    #[error(
        "Failed to construct {kind} component '{name}': {reason}. \
         Check `components.{kind}.comp_name` and the registered factories."
    )]
    ComponentInit {
        /// Component kind (tagging/normalizing/ner/linking/addon).
        kind: String,
        /// The configured component name.
        name: String,
        /// What went wrong.
        reason: String,
    },

    /// Tokenizer construction failed.
    #[error(
        "Failed to construct tokenizer '{provider}': {reason}. \
         Check `general.tokenizer` and the registered tokenizers."
    )]
    TokenizerInit {
        /// The configured tokenizer provider name.
        provider: String,
        /// What went wrong.
        reason: String,
    },

    /// No component of the requested kind exists in the pipeline.
    #[error("No component of kind {0} in the pipeline")]
    NoSuchComponent(String),

    /// Addon-data slot accessed without prior registration.
    #[error("Addon data slot '{0}' was never registered on this pipeline")]
    UnregisteredAddonSlot(String),

    /// Training export could not be interpreted.
    #[error("Invalid training export: {0}")]
    InvalidExport(String),

    /// Entity span could not be carved from the document.
    #[error("Invalid span: {0}")]
    InvalidSpan(String),

    /// Negative sampling requested before `init_cumsums`.
    #[error("Vocab cumulative sums not initialised: call init_cumsums() before negative sampling")]
    CumsumsNotInitialised,

    /// Model pack directory missing or malformed.
    #[error("Model pack error: {0}")]
    ModelPack(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a component construction error.
    pub fn component_init(
        kind: impl Into<String>,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::ComponentInit {
            kind: kind.into(),
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a tokenizer construction error.
    pub fn tokenizer_init(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::TokenizerInit {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid-export error.
    pub fn invalid_export(msg: impl Into<String>) -> Self {
        Error::InvalidExport(msg.into())
    }

    /// Create an invalid-span error.
    pub fn invalid_span(msg: impl Into<String>) -> Self {
        Error::InvalidSpan(msg.into())
    }

    /// Create a model pack error.
    pub fn model_pack(msg: impl Into<String>) -> Self {
        Error::ModelPack(msg.into())
    }
}
