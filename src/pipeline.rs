//! Pipeline orchestration: tokenizer → ordered core components → addons.
//!
//! Construction is registry-driven: the configured `comp_name` of every
//! stage is looked up in the [`ComponentRegistry`], so any stage can be
//! swapped for a custom implementation without touching the orchestrator.
//! Construction failures are attributable — they name the component kind,
//! the configured name and the config field to check.

use std::collections::HashSet;
use std::sync::Arc;

use crate::components::{
    AddonComponent, Component, ComponentContext, ComponentKind, ComponentRegistry, SharedCdb,
};
use crate::config::SharedConfig;
use crate::error::{Error, Result};
use crate::tokenize::{AddonSlots, Document, Tokenizer, TokenizerRegistry};
use crate::vocab::Vocab;

/// The assembled processing pipeline.
pub struct Pipeline {
    tokenizer: Arc<dyn Tokenizer>,
    components: Vec<Box<dyn Component>>,
    addons: Vec<Box<dyn AddonComponent>>,
    addon_slots: AddonSlots,
    config: SharedConfig,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("tokenizer", &self.tokenizer)
            .field("components", &self.components)
            .field("addons", &self.addons.len())
            .finish()
    }
}

impl Pipeline {
    /// Build the pipeline from the shared model state and the default
    /// registries.
    pub fn new(cdb: SharedCdb, vocab: Arc<Vocab>, config: SharedConfig) -> Result<Self> {
        Pipeline::with_registries(
            cdb,
            vocab,
            config,
            &TokenizerRegistry::with_defaults(),
            &ComponentRegistry::with_defaults(),
        )
    }

    /// Build with explicit registries, for custom tokenizers/components.
    pub fn with_registries(
        cdb: SharedCdb,
        vocab: Arc<Vocab>,
        config: SharedConfig,
        tokenizers: &TokenizerRegistry,
        components: &ComponentRegistry,
    ) -> Result<Self> {
        let tokenizer = tokenizers.create(&config.read())?;
        let ctx = ComponentContext {
            tokenizer: Arc::clone(&tokenizer),
            cdb,
            vocab,
            config: Arc::clone(&config),
        };

        let comp_order = config.read().components.comp_order.clone();
        let mut seen = HashSet::new();
        let mut built: Vec<Box<dyn Component>> = Vec::with_capacity(comp_order.len());
        for kind in comp_order {
            if !seen.insert(kind) {
                return Err(Error::component_init(
                    kind.to_string(),
                    "-",
                    "kind appears more than once in components.comp_order",
                ));
            }
            let name = {
                let cfg = config.read();
                match kind {
                    ComponentKind::Tagging => cfg.components.tagging.comp_name.clone(),
                    ComponentKind::Normalizing => cfg.components.normalizing.comp_name.clone(),
                    ComponentKind::Ner => cfg.components.ner.comp_name.clone(),
                    ComponentKind::Linking => cfg.components.linking.comp_name.clone(),
                }
            };
            log::debug!("constructing {kind} component '{name}'");
            built.push(components.create(kind, &name, &ctx)?);
        }

        Ok(Pipeline {
            tokenizer,
            components: built,
            addons: Vec::new(),
            addon_slots: Arc::new(parking_lot::RwLock::new(HashSet::new())),
            config,
        })
    }

    /// The raw tokenizer (no components applied).
    #[must_use]
    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    /// Run the full pipeline over a text.
    ///
    /// Documents longer than `preprocessing.max_document_length` chars
    /// are trimmed first.
    pub fn get_doc(&self, text: &str) -> Result<Document> {
        let max_len = self.config.read().preprocessing.max_document_length;
        let text = trim_chars(text, max_len);
        let mut doc = self.tokenizer.tokenize(text);
        doc.attach_addon_slots(Arc::clone(&self.addon_slots));
        for component in &self.components {
            component.process(&mut doc)?;
        }
        for addon in &self.addons {
            addon.process(&mut doc)?;
        }
        Ok(doc)
    }

    /// The core component of the given kind.
    pub fn get_component(&self, kind: ComponentKind) -> Result<&dyn Component> {
        self.components
            .iter()
            .find(|c| c.kind() == kind)
            .map(AsRef::as_ref)
            .ok_or_else(|| Error::NoSuchComponent(kind.to_string()))
    }

    /// Register an addon-data slot usable on documents and spans.
    pub fn register_addon_slot(&self, name: &str) {
        self.addon_slots.write().insert(name.to_string());
    }

    /// Append an addon, run after the core components.
    pub fn add_addon(&mut self, addon: Box<dyn AddonComponent>) {
        self.addons.push(addon);
    }

    /// The addons, in execution order.
    pub fn addons(&self) -> impl Iterator<Item = &dyn AddonComponent> {
        self.addons.iter().map(AsRef::as_ref)
    }
}

/// Trim to at most `max_chars` characters, on a char boundary.
fn trim_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => {
            log::warn!(
                "document of {} chars trimmed to {max_chars}",
                text.chars().count()
            );
            &text[..byte_idx]
        }
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdb::{prepare_name, Cdb, NameStatus, PreparedName};
    use crate::config::{shared, Config, ScopedTrain};
    use crate::tokenize::RegexTokenizer;
    use parking_lot::RwLock;

    fn prep(raw: &str) -> Vec<PreparedName> {
        prepare_name(raw, &RegexTokenizer::new(None), &Config::default())
            .into_iter()
            .collect()
    }

    fn pipeline_with(concepts: &[(&str, &str, NameStatus)]) -> (Pipeline, SharedConfig) {
        let mut cdb = Cdb::new();
        for (cui, raw, status) in concepts {
            cdb.add_concept(
                cui,
                &prep(raw),
                *status,
                Default::default(),
                Default::default(),
                None,
                false,
                "~",
            );
        }
        let config = shared(Config::default());
        let pipeline = Pipeline::new(
            Arc::new(RwLock::new(cdb)),
            Arc::new(Vocab::new()),
            Arc::clone(&config),
        )
        .unwrap();
        (pipeline, config)
    }

    #[test]
    fn full_chain_annotates_primary_names() {
        let (pipeline, config) = pipeline_with(&[("C1", "kidney failure", NameStatus::Primary)]);
        let _off = ScopedTrain::set(&config, false);
        let doc = pipeline
            .get_doc("Patient presents with kidney failure.")
            .unwrap();
        assert_eq!(doc.final_spans.len(), 1);
        assert_eq!(doc.final_spans[0].cui.as_deref(), Some("C1"));
        assert_eq!(doc.final_spans[0].text, "kidney failure");
    }

    #[test]
    fn component_order_is_respected() {
        let (pipeline, _config) = pipeline_with(&[]);
        let kinds: Vec<ComponentKind> =
            pipeline.components.iter().map(|c| c.kind()).collect();
        assert_eq!(
            kinds,
            [
                ComponentKind::Tagging,
                ComponentKind::Normalizing,
                ComponentKind::Ner,
                ComponentKind::Linking,
            ]
        );
    }

    #[test]
    fn unknown_component_name_is_attributable() {
        let config = shared(Config::default());
        config.write().components.ner.comp_name = "transformer".into();
        let err = Pipeline::new(
            Arc::new(RwLock::new(Cdb::new())),
            Arc::new(Vocab::new()),
            config,
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("ner") && msg.contains("transformer"), "{msg}");
    }

    #[test]
    fn duplicate_comp_order_rejected() {
        let config = shared(Config::default());
        config.write().components.comp_order = vec![
            ComponentKind::Tagging,
            ComponentKind::Tagging,
            ComponentKind::Ner,
            ComponentKind::Linking,
        ];
        let err = Pipeline::new(
            Arc::new(RwLock::new(Cdb::new())),
            Arc::new(Vocab::new()),
            config,
        )
        .unwrap_err();
        assert!(err.to_string().contains("comp_order"));
    }

    #[test]
    fn get_component_finds_linker() {
        let (pipeline, _config) = pipeline_with(&[]);
        let linker = pipeline.get_component(ComponentKind::Linking).unwrap();
        assert!(linker.as_trainable().is_some());
    }

    #[test]
    fn long_documents_are_trimmed() {
        let (pipeline, config) = pipeline_with(&[]);
        config.write().preprocessing.max_document_length = 10;
        let doc = pipeline.get_doc("one two three four five six").unwrap();
        assert!(doc.text.chars().count() <= 10);
    }

    #[test]
    fn addon_runs_after_core() {
        struct MarkerAddon;
        impl AddonComponent for MarkerAddon {
            fn addon_name(&self) -> &str {
                "marker"
            }
            fn process(&self, doc: &mut Document) -> Result<()> {
                doc.addon.set("marker", serde_json::Value::Bool(true))?;
                Ok(())
            }
        }
        let (mut pipeline, _config) = pipeline_with(&[]);
        pipeline.register_addon_slot("marker");
        pipeline.add_addon(Box::new(MarkerAddon));
        let doc = pipeline.get_doc("some text").unwrap();
        assert_eq!(
            doc.addon.get("marker").unwrap(),
            Some(&serde_json::Value::Bool(true))
        );
    }

    #[test]
    fn unregistered_addon_slot_fails_loudly() {
        struct BadAddon;
        impl AddonComponent for BadAddon {
            fn addon_name(&self) -> &str {
                "bad"
            }
            fn process(&self, doc: &mut Document) -> Result<()> {
                doc.addon.set("never-registered", serde_json::Value::Null)?;
                Ok(())
            }
        }
        let (mut pipeline, _config) = pipeline_with(&[]);
        pipeline.add_addon(Box::new(BadAddon));
        let err = pipeline.get_doc("text").unwrap_err();
        assert!(matches!(err, Error::UnregisteredAddonSlot(_)));
    }
}
