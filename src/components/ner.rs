//! Candidate detection: greedy, left-to-right, multi-token name matching
//! against the CDB's subname set.
//!
//! The walker runs over the non-skipped token stream. A span starts when
//! some text version of a token is a known subname; it extends forward as
//! long as the growing separator-joined string stays a known subname,
//! tolerating up to `max_skip_tokens` skipped tokens between used ones
//! (measured on the raw token index, so whitespace/punct gaps count).
//! Every time the running string is an exact known full name, a candidate
//! span with that name's CUI set is attached to the document. The linker
//! resolves the rest; the CDB is never mutated here.

use std::sync::Arc;

use crate::config::SharedConfig;
use crate::error::Result;
use crate::tokenize::Document;

use super::{Component, ComponentKind, SharedCdb};

/// The default vocab-based NER component.
pub struct VocabBasedNer {
    cdb: SharedCdb,
    config: SharedConfig,
}

/// Owned view of one usable token, so candidate emission can mutate the
/// document without fighting token borrows.
struct TokenView {
    /// Raw index into `doc.tokens`.
    index: usize,
    /// Candidate text forms, most-normalized first.
    versions: Vec<String>,
    is_stop: bool,
    is_upper: bool,
}

impl VocabBasedNer {
    /// Build over the shared CDB and config.
    #[must_use]
    pub fn new(cdb: SharedCdb, config: SharedConfig) -> Self {
        VocabBasedNer { cdb, config }
    }

    /// Attach a candidate span for `name` covering `token_indices`, if the
    /// name survives the length/uppercase gates.
    ///
    /// An existing candidate starting at the same token is widened instead
    /// of duplicated.
    fn maybe_annotate(
        &self,
        name: &str,
        token_indices: &[usize],
        doc: &mut Document,
        views: &[TokenView],
        view_range: (usize, usize),
    ) -> Result<()> {
        let cdb = self.cdb.read();
        let Some(name_info) = cdb.name2info.get(name) else {
            return Ok(());
        };
        let (min_name_len, check_upper, upper_limit) = {
            let cfg = self.config.read();
            (
                cfg.components.ner.min_name_len,
                cfg.components.ner.check_upper_case_names,
                cfg.components.ner.upper_case_limit_len,
            )
        };
        if name.chars().count() < min_name_len {
            return Ok(());
        }
        if check_upper {
            let needs_upper =
                name_info.is_upper || name.chars().count() < upper_limit;
            if needs_upper {
                let all_upper = views[view_range.0..=view_range.1]
                    .iter()
                    .all(|view| view.is_upper);
                if !all_upper {
                    return Ok(());
                }
            }
        }

        let candidates: Vec<String> = name_info.cuis.iter().cloned().collect();
        drop(cdb);

        let start = token_indices[0];
        let end = token_indices[token_indices.len() - 1] + 1;

        if let Some(existing) = doc.spans.iter_mut().find(|s| s.token_start == start) {
            if end > existing.token_end {
                let last = &doc.tokens[end - 1];
                existing.token_end = end;
                existing.char_end = last.char_end;
                existing.text = doc.text[existing.char_start..existing.char_end].to_string();
                existing.detected_name = name.to_string();
                existing.link_candidates = candidates;
            }
            return Ok(());
        }

        let mut span = doc.carve_span(start, end)?;
        span.detected_name = name.to_string();
        span.link_candidates = candidates;
        doc.spans.push(span);
        Ok(())
    }
}

impl Component for VocabBasedNer {
    fn name(&self) -> &'static str {
        "vocab-based-ner"
    }

    fn kind(&self) -> ComponentKind {
        ComponentKind::Ner
    }

    fn process(&self, doc: &mut Document) -> Result<()> {
        let (max_skip_tokens, sep, try_reverse) = {
            let cfg = self.config.read();
            (
                cfg.components.ner.max_skip_tokens,
                cfg.general.separator.clone(),
                cfg.components.ner.try_reverse_word_order,
            )
        };

        let views: Vec<TokenView> = doc
            .tokens
            .iter()
            .filter(|t| !t.to_skip)
            .map(|t| TokenView {
                index: t.index,
                versions: t.text_versions().iter().map(|v| (*v).to_string()).collect(),
                is_stop: t.is_stop,
                is_upper: t.is_upper(),
            })
            .collect();

        for i in 0..views.len() {
            let view = &views[i];
            let mut token_indices = vec![view.index];
            let mut name = String::new();

            for version in &view.versions {
                if self.cdb.read().has_subname(version) {
                    name = version.clone();
                    break;
                }
            }
            if !name.is_empty() && !view.is_stop && self.cdb.read().name2info.contains_key(&name)
            {
                self.maybe_annotate(&name.clone(), &token_indices, doc, &views, (i, i))?;
            }
            if name.is_empty() {
                // Nothing matched at this position; a span cannot start here.
                continue;
            }

            for j in (i + 1)..views.len() {
                let gap = views[j].index - views[j - 1].index - 1;
                if gap > max_skip_tokens {
                    break;
                }
                token_indices.push(views[j].index);

                let mut name_changed = false;
                let mut name_reverse: Option<String> = None;
                for version in &views[j].versions {
                    let extended = format!("{name}{sep}{version}");
                    if self.cdb.read().has_subname(&extended) {
                        name = extended;
                        name_changed = true;
                        break;
                    }
                    if try_reverse {
                        let reversed = format!("{version}{sep}{name}");
                        if self.cdb.read().has_subname(&reversed) {
                            name_reverse = Some(reversed);
                        }
                    }
                }

                if name_changed {
                    if self.cdb.read().name2info.contains_key(&name) {
                        self.maybe_annotate(&name.clone(), &token_indices, doc, &views, (i, j))?;
                    }
                } else if let Some(reversed) = name_reverse {
                    if self.cdb.read().name2info.contains_key(&reversed) {
                        self.maybe_annotate(&reversed, &token_indices, doc, &views, (i, j))?;
                    }
                } else {
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdb::{prepare_name, Cdb, NameStatus, PreparedName};
    use crate::components::tagging::TagAndSkip;
    use crate::config::{shared, Config};
    use crate::tokenize::{RegexTokenizer, Tokenizer};
    use parking_lot::RwLock;

    fn build_cdb(names: &[(&str, &str)]) -> Cdb {
        let config = Config::default();
        let tokenizer = RegexTokenizer::new(None);
        let mut cdb = Cdb::new();
        for (cui, raw) in names {
            let prepared: Vec<PreparedName> = prepare_name(raw, &tokenizer, &config)
                .into_iter()
                .collect();
            cdb.add_concept(
                cui,
                &prepared,
                NameStatus::Automatic,
                Default::default(),
                Default::default(),
                None,
                false,
                "~",
            );
        }
        cdb
    }

    fn detect_with(config: Config, cdb: Cdb, text: &str) -> Document {
        let config = shared(config);
        let cdb = Arc::new(RwLock::new(cdb));
        let mut doc = RegexTokenizer::new(None).tokenize(text);
        TagAndSkip::new(&config.read()).process(&mut doc).unwrap();
        VocabBasedNer::new(cdb, config).process(&mut doc).unwrap();
        doc
    }

    fn detect(names: &[(&str, &str)], text: &str) -> Document {
        detect_with(Config::default(), build_cdb(names), text)
    }

    #[test]
    fn single_token_name_detected() {
        let doc = detect(&[("C1", "fracture")], "a fracture was seen");
        assert_eq!(doc.spans.len(), 1);
        assert_eq!(doc.spans[0].detected_name, "fracture");
        assert_eq!(doc.spans[0].link_candidates, ["C1"]);
    }

    #[test]
    fn multi_token_name_detected_with_full_span() {
        let doc = detect(&[("C1", "kidney failure")], "signs of kidney failure today");
        assert_eq!(doc.spans.len(), 1);
        let span = &doc.spans[0];
        assert_eq!(span.detected_name, "kidney~failure");
        assert_eq!(span.text, "kidney failure");
    }

    #[test]
    fn skip_tolerance_allows_gap() {
        let mut config = Config::default();
        config.components.ner.max_skip_tokens = 1;
        // "acute" is not in any name; make it skippable.
        config
            .preprocessing
            .words_to_skip
            .insert("acute".to_string());
        let cdb = build_cdb(&[("C1", "kidney failure")]);
        let doc = detect_with(config, cdb, "kidney acute failure");
        assert_eq!(doc.spans.len(), 1);
        assert_eq!(doc.spans[0].detected_name, "kidney~failure");
        // The span covers the gap.
        assert_eq!(doc.spans[0].text, "kidney acute failure");
    }

    #[test]
    fn skip_budget_zero_blocks_gap() {
        let mut config = Config::default();
        config.components.ner.max_skip_tokens = 0;
        config
            .preprocessing
            .words_to_skip
            .insert("acute".to_string());
        let cdb = build_cdb(&[("C1", "kidney failure")]);
        let doc = detect_with(config, cdb, "kidney acute failure");
        assert!(doc.spans.is_empty());
    }

    #[test]
    fn ambiguous_name_lists_all_candidates() {
        let doc = detect(&[("C1", "cold"), ("C2", "cold")], "patient has a cold");
        assert_eq!(doc.spans.len(), 1);
        assert_eq!(doc.spans[0].link_candidates, ["C1", "C2"]);
    }

    #[test]
    fn nested_name_extends_existing_span() {
        let doc = detect(
            &[("C1", "kidney"), ("C2", "kidney failure")],
            "chronic kidney failure",
        );
        // One span, widened to the longer match.
        assert_eq!(doc.spans.len(), 1);
        assert_eq!(doc.spans[0].detected_name, "kidney~failure");
        assert_eq!(doc.spans[0].link_candidates, ["C2"]);
    }

    #[test]
    fn min_name_len_blocks_short_names() {
        // "mg" (2 chars) is below the default min_name_len of 3.
        let doc = detect(&[("C1", "mgx")], "mgx");
        assert_eq!(doc.spans.len(), 1);
        let doc = detect(&[("C1", "mg")], "mg dose");
        assert!(doc.spans.is_empty());
    }

    #[test]
    fn short_name_requires_uppercase_when_checked() {
        let mut config = Config::default();
        config.components.ner.check_upper_case_names = true;
        config.components.ner.min_name_len = 3;
        // "htn" is 3 chars, below upper_case_limit_len of 4.
        let cdb = build_cdb(&[("C1", "HTN")]);
        let doc = detect_with(config.clone(), cdb, "history of htn today");
        assert!(doc.spans.is_empty(), "lowercase mention must not match");

        let cdb = build_cdb(&[("C1", "HTN")]);
        let doc = detect_with(config, cdb, "history of HTN today");
        assert_eq!(doc.spans.len(), 1);
    }

    #[test]
    fn uppercase_not_required_by_default() {
        let doc = detect(&[("C1", "HTN")], "history of htn today");
        assert_eq!(doc.spans.len(), 1);
    }

    #[test]
    fn reverse_word_order_when_enabled() {
        let mut config = Config::default();
        config.components.ner.try_reverse_word_order = true;
        let cdb = build_cdb(&[("C1", "heart disease")]);
        let doc = detect_with(config, cdb, "disease heart");
        assert_eq!(doc.spans.len(), 1);
        assert_eq!(doc.spans[0].detected_name, "heart~disease");
    }

    #[test]
    fn no_cdb_mutation() {
        let cdb = build_cdb(&[("C1", "fracture")]);
        let before = serde_json::to_string(&cdb).unwrap();
        let config = shared(Config::default());
        let cdb = Arc::new(RwLock::new(cdb));
        let mut doc = RegexTokenizer::new(None).tokenize("a fracture");
        VocabBasedNer::new(Arc::clone(&cdb), config)
            .process(&mut doc)
            .unwrap();
        let after = serde_json::to_string(&*cdb.read()).unwrap();
        assert_eq!(before, after);
    }
}
