//! Model-pack persistence.
//!
//! A model pack is a directory: `config.json`, `cdb.json`, `vocab.json`
//! and an `addons.json` manifest naming the addons that were attached
//! (addon state itself lives with the addon implementations; the manifest
//! lets a loader know what to re-register). Loading is selective —
//! [`LoadOptions::skip_addons`] ignores the manifest entirely.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cdb::Cdb;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::vocab::Vocab;

/// File names inside a model pack.
const CONFIG_FILE: &str = "config.json";
const CDB_FILE: &str = "cdb.json";
const VOCAB_FILE: &str = "vocab.json";
const ADDONS_FILE: &str = "addons.json";

/// Selective-load options.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Ignore the addon manifest when loading.
    pub skip_addons: bool,
}

#[derive(Serialize, Deserialize, Default)]
struct AddonManifest {
    addons: Vec<String>,
}

/// Write a model pack to `dir`, creating it if needed.
pub fn save_model_pack(
    dir: &Path,
    config: &Config,
    cdb: &Cdb,
    vocab: &Vocab,
    addon_names: &[String],
) -> Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(config)?)?;
    fs::write(dir.join(CDB_FILE), serde_json::to_string(cdb)?)?;
    fs::write(dir.join(VOCAB_FILE), serde_json::to_string(vocab)?)?;
    let manifest = AddonManifest {
        addons: addon_names.to_vec(),
    };
    fs::write(dir.join(ADDONS_FILE), serde_json::to_string_pretty(&manifest)?)?;
    log::info!("model pack saved to {}", dir.display());
    Ok(())
}

/// Read a model pack from `dir`.
pub fn load_model_pack(dir: &Path, options: LoadOptions) -> Result<(Config, Cdb, Vocab)> {
    if !dir.is_dir() {
        return Err(Error::model_pack(format!(
            "'{}' is not a model pack directory",
            dir.display()
        )));
    }
    let config: Config = serde_json::from_str(&read(dir, CONFIG_FILE)?)?;
    let cdb: Cdb = serde_json::from_str(&read(dir, CDB_FILE)?)?;
    let vocab: Vocab = serde_json::from_str(&read(dir, VOCAB_FILE)?)?;

    if !options.skip_addons {
        match fs::read_to_string(dir.join(ADDONS_FILE)) {
            Ok(raw) => {
                let manifest: AddonManifest = serde_json::from_str(&raw)?;
                for name in &manifest.addons {
                    log::info!(
                        "model pack lists addon '{name}'; re-register it on the pipeline \
                         to restore its behavior"
                    );
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok((config, cdb, vocab))
}

fn read(dir: &Path, file: &str) -> Result<String> {
    fs::read_to_string(dir.join(file)).map_err(|e| {
        Error::model_pack(format!(
            "missing or unreadable '{file}' in '{}': {e}",
            dir.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdb::{prepare_name, NameStatus, PreparedName};
    use crate::tokenize::RegexTokenizer;

    fn sample() -> (Config, Cdb, Vocab) {
        let config = Config::default();
        let mut cdb = Cdb::new();
        let prepared: Vec<PreparedName> =
            prepare_name("kidney failure", &RegexTokenizer::new(None), &config)
                .into_iter()
                .collect();
        cdb.add_concept(
            "C1",
            &prepared,
            NameStatus::Primary,
            Default::default(),
            Default::default(),
            None,
            false,
            "~",
        );
        let mut vocab = Vocab::new();
        vocab.add_word("kidney", 10, Some(ndarray::arr1(&[1.0, 0.0])), false);
        (config, cdb, vocab)
    }

    #[test]
    fn save_then_load_roundtrips() {
        let (config, cdb, vocab) = sample();
        let dir = tempfile::tempdir().unwrap();
        save_model_pack(dir.path(), &config, &cdb, &vocab, &["meta".to_string()]).unwrap();

        let (config2, cdb2, vocab2) =
            load_model_pack(dir.path(), LoadOptions::default()).unwrap();
        assert_eq!(config, config2);
        assert!(cdb2.has_subname("kidney~failure"));
        assert_eq!(vocab2.count("kidney"), 10);
    }

    #[test]
    fn skip_addons_ignores_manifest() {
        let (config, cdb, vocab) = sample();
        let dir = tempfile::tempdir().unwrap();
        save_model_pack(dir.path(), &config, &cdb, &vocab, &["meta".to_string()]).unwrap();
        let loaded = load_model_pack(dir.path(), LoadOptions { skip_addons: true });
        assert!(loaded.is_ok());
    }

    #[test]
    fn missing_pack_is_attributable() {
        let err =
            load_model_pack(Path::new("/nonexistent/pack"), LoadOptions::default()).unwrap_err();
        assert!(matches!(err, Error::ModelPack(_)));
    }

    #[test]
    fn missing_file_is_attributable() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_model_pack(dir.path(), LoadOptions::default()).unwrap_err();
        assert!(err.to_string().contains(CONFIG_FILE));
    }
}
