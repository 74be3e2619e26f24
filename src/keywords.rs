use serde_yaml::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::config_loader::{ConfigError, ConfigStore};

/// Label (verbatim case) to lowercased aliases.
pub type AliasedKeywords = HashMap<String, HashSet<String>>;

const REQUIRED_ROLES: [&str; 2] = ["generic", "custom"];

/// Merges the shipped ("generic") and site-specific ("custom") keyword lists.
pub struct KeywordIndex;

impl KeywordIndex {
    /// Load flat keyword lists and return the lowercased union.
    pub fn load_flat(sources: &HashMap<String, PathBuf>) -> Result<HashSet<String>, ConfigError> {
        Self::check_roles(sources)?;

        let mut keywords = HashSet::new();
        for role in REQUIRED_ROLES {
            let path = &sources[role];
            let items = match ConfigStore::load_value(path)? {
                Value::Sequence(items) => items,
                _ => return Err(invalid(path, "expected a flat sequence of keywords")),
            };
            for item in &items {
                keywords.insert(Self::token(item, path)?);
            }
            log::debug!("Loaded {} {} keywords from {}", items.len(), role, path.display());
        }

        Ok(keywords)
    }

    /// Load label-to-aliases mappings; aliases are merged per label across
    /// both sources. Labels keep their original case.
    pub fn load_aliased(
        sources: &HashMap<String, PathBuf>,
    ) -> Result<AliasedKeywords, ConfigError> {
        Self::check_roles(sources)?;

        let mut keywords = AliasedKeywords::new();
        for role in REQUIRED_ROLES {
            let path = &sources[role];
            let mapping = match ConfigStore::load_value(path)? {
                Value::Mapping(mapping) => mapping,
                _ => return Err(invalid(path, "expected a mapping of label to aliases")),
            };
            for (label, aliases) in &mapping {
                let label = Self::label(label, path)?;
                let aliases = aliases.as_sequence().ok_or_else(|| {
                    invalid(path, &format!("aliases of {label} must be a sequence"))
                })?;
                let entry = keywords.entry(label).or_default();
                for alias in aliases {
                    entry.insert(Self::token(alias, path)?);
                }
            }
        }

        Ok(keywords)
    }

    fn check_roles(sources: &HashMap<String, PathBuf>) -> Result<(), ConfigError> {
        let valid = sources.len() == REQUIRED_ROLES.len()
            && REQUIRED_ROLES.iter().all(|role| sources.contains_key(*role));
        if valid {
            Ok(())
        } else {
            let mut found: Vec<String> = sources.keys().cloned().collect();
            found.sort();
            Err(ConfigError::Roles(found))
        }
    }

    fn token(value: &Value, path: &Path) -> Result<String, ConfigError> {
        match value {
            Value::String(s) => Ok(s.to_lowercase()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            _ => Err(invalid(path, "keywords must be strings or numbers")),
        }
    }

    fn label(value: &Value, path: &Path) -> Result<String, ConfigError> {
        match value {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            _ => Err(invalid(path, "labels must be strings or numbers")),
        }
    }
}

fn invalid(path: &Path, reason: &str) -> ConfigError {
    ConfigError::InvalidContent {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// True when every word of at least one keyword phrase appears in `text`,
/// case-insensitively.
pub fn search_words_in_text<I, S>(text: &str, keywords: I) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let text = text.to_lowercase();
    keywords.into_iter().any(|keyword| {
        let keyword = keyword.as_ref().to_lowercase();
        let mut words = keyword.split_whitespace().peekable();
        words.peek().is_some() && words.all(|word| text.contains(word))
    })
}
