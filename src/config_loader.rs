use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::keywords::{AliasedKeywords, KeywordIndex};
use crate::output::IndexingParams;
use crate::whitelist::{Whitelist, WhitelistSource, WhitelistStore};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration source not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Configuration source is not a mapping: {0}")]
    NotAMapping(PathBuf),
    #[error("Invalid content in {path}: {reason}")]
    InvalidContent { path: PathBuf, reason: String },
    #[error("Keyword sources must be exactly \"generic\" and \"custom\", got {0:?}")]
    Roles(Vec<String>),
}

/// Raw YAML loader used by every other configuration reader.
pub struct ConfigStore;

impl ConfigStore {
    /// Load a source that must parse into a mapping.
    pub fn load(path: &Path) -> Result<Mapping, ConfigError> {
        match Self::load_value(path)? {
            Value::Mapping(mapping) => Ok(mapping),
            _ => Err(ConfigError::NotAMapping(path.to_path_buf())),
        }
    }

    /// Load a source of any YAML shape.
    pub fn load_value(path: &Path) -> Result<Value, ConfigError> {
        let content = Self::read(path)?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load and deserialize a typed configuration.
    pub fn load_typed<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
        let mapping = Self::load(path)?;
        serde_yaml::from_value(Value::Mapping(mapping)).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn read(path: &Path) -> Result<String, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct KeywordSettings {
    #[serde(default)]
    pub subjects: HashMap<String, PathBuf>,
    #[serde(default)]
    pub targets: HashMap<String, PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub keywords: KeywordSettings,
    #[serde(default)]
    pub whitelists: HashMap<String, WhitelistSource>,
    pub elasticsearch: Option<IndexingParams>,
    #[serde(default = "default_deadline_seconds")]
    pub deadline_seconds: f64,
    #[serde(default = "default_max_archive_depth")]
    pub max_archive_depth: usize,
}

fn default_deadline_seconds() -> f64 {
    30.0
}

fn default_max_archive_depth() -> usize {
    3
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            keywords: KeywordSettings::default(),
            whitelists: HashMap::new(),
            elasticsearch: None,
            deadline_seconds: default_deadline_seconds(),
            max_archive_depth: default_max_archive_depth(),
        }
    }
}

impl Settings {
    /// Load settings and resolve every relative source path against the
    /// directory holding the settings file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut settings: Settings = ConfigStore::load_typed(path)?;
        if let Some(base) = path.parent() {
            settings.rebase(base);
        }
        log::info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    fn rebase(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        self.keywords.subjects.values_mut().for_each(resolve);
        self.keywords.targets.values_mut().for_each(resolve);
        for source in self.whitelists.values_mut() {
            resolve(&mut source.path);
        }
    }
}

/// Load-once lookup data shared by reference across workers.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub subjects: HashSet<String>,
    pub targets: AliasedKeywords,
    pub whitelist: Whitelist,
}

impl Catalog {
    pub fn load(settings: &Settings) -> Result<Self, ConfigError> {
        let subjects = if settings.keywords.subjects.is_empty() {
            HashSet::new()
        } else {
            KeywordIndex::load_flat(&settings.keywords.subjects)?
        };
        let targets = if settings.keywords.targets.is_empty() {
            AliasedKeywords::new()
        } else {
            KeywordIndex::load_aliased(&settings.keywords.targets)?
        };
        let whitelist = WhitelistStore::load(&settings.whitelists)?;

        log::info!(
            "Catalog loaded: {} subject keywords, {} targets, {} whitelisted domains",
            subjects.len(),
            targets.len(),
            whitelist.len()
        );

        Ok(Self {
            subjects,
            targets,
            whitelist,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_mapping() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "conf.yml", "deadline_seconds: 5\nname: test\n");

        let conf = ConfigStore::load(&path).unwrap();
        assert_eq!(conf.get("name").and_then(|v| v.as_str()), Some("test"));
    }

    #[test]
    fn test_load_missing_source() {
        let result = ConfigStore::load(Path::new("conf/fake.yml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_rejects_non_mapping() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "list.yml", "- one\n- two\n");

        assert!(matches!(
            ConfigStore::load(&path),
            Err(ConfigError::NotAMapping(_))
        ));
        assert!(ConfigStore::load_value(&path).unwrap().is_sequence());
    }

    #[test]
    fn test_load_malformed_yaml() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "bad.yml", "key: [unclosed\n");

        assert!(matches!(
            ConfigStore::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_settings_and_catalog() {
        let dir = TempDir::new().unwrap();
        write(&dir, "subjects.yml", "- Fattura\n- 123456\n");
        write(&dir, "subjects_custom.yml", "- conferma\n");
        write(&dir, "targets.yml", "Banca Tizio:\n  - Tizio\n");
        write(&dir, "targets_custom.yml", "Banca Tizio:\n  - 12345\n");
        write(&dir, "generic.yml", "- google.com\n- amazon.com\n");
        let settings_path = write(
            &dir,
            "settings.yml",
            r#"
keywords:
  subjects:
    generic: subjects.yml
    custom: subjects_custom.yml
  targets:
    generic: targets.yml
    custom: targets_custom.yml
whitelists:
  generic:
    path: generic.yml
elasticsearch:
  index_mail: "mails-"
  type_mail: "analysis"
  index_attach: "attachments-"
  type_attach: "analysis"
deadline_seconds: 2.5
"#,
        );

        let settings = Settings::from_file(&settings_path).unwrap();
        assert_eq!(settings.deadline_seconds, 2.5);
        assert_eq!(settings.max_archive_depth, 3);
        assert!(settings.whitelists["generic"].path.is_absolute());

        let catalog = Catalog::load(&settings).unwrap();
        assert!(catalog.subjects.contains("fattura"));
        assert!(catalog.subjects.contains("123456"));
        assert!(catalog.targets["Banca Tizio"].contains("12345"));
        assert!(catalog.whitelist.contains("google.com"));
    }
}
