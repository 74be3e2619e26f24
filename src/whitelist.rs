use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use crate::config_loader::{ConfigError, ConfigStore};
use crate::output::parse_timestamp;

/// One named domain list with an optional expiry instant.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WhitelistSource {
    pub path: PathBuf,
    #[serde(default, deserialize_with = "deserialize_expiry")]
    pub expiry: Option<DateTime<Utc>>,
}

fn deserialize_expiry<'de, D>(d: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<String>::deserialize(d)?
        .map(|raw| {
            parse_timestamp(&raw).ok_or_else(|| {
                serde::de::Error::custom(format!("invalid expiry timestamp: {raw}"))
            })
        })
        .transpose()
}

impl WhitelistSource {
    /// Expired strictly before `now`; a source expiring exactly now is still live.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|expiry| expiry < now)
    }
}

/// Merged, read-only set of trusted domains.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Whitelist {
    domains: HashSet<String>,
}

impl Whitelist {
    pub fn contains(&self, domain: &str) -> bool {
        self.domains.contains(domain)
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.domains.iter()
    }
}

impl FromIterator<String> for Whitelist {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        Self {
            domains: iter.into_iter().collect(),
        }
    }
}

pub struct WhitelistStore;

impl WhitelistStore {
    pub fn load(sources: &HashMap<String, WhitelistSource>) -> Result<Whitelist, ConfigError> {
        Self::load_at(sources, Utc::now())
    }

    /// Union of every source not expired at `now`.
    pub fn load_at(
        sources: &HashMap<String, WhitelistSource>,
        now: DateTime<Utc>,
    ) -> Result<Whitelist, ConfigError> {
        let mut domains = HashSet::new();

        for (name, source) in sources {
            if source.is_expired_at(now) {
                log::warn!(
                    "Whitelist {} expired at {:?}, ignoring its domains",
                    name,
                    source.expiry
                );
                continue;
            }

            let entries = match ConfigStore::load_value(&source.path)? {
                Value::Sequence(entries) => entries,
                Value::Null => Vec::new(),
                _ => {
                    return Err(ConfigError::InvalidContent {
                        path: source.path.clone(),
                        reason: "expected a sequence of domains".to_string(),
                    })
                }
            };

            let before = domains.len();
            for entry in &entries {
                match entry {
                    Value::String(domain) => {
                        domains.insert(domain.trim().to_lowercase());
                    }
                    other => {
                        return Err(ConfigError::InvalidContent {
                            path: source.path.clone(),
                            reason: format!("whitelist entry is not a domain: {other:?}"),
                        })
                    }
                }
            }
            log::debug!(
                "Whitelist {} contributed {} domains",
                name,
                domains.len() - before
            );
        }

        Ok(Whitelist { domains })
    }
}
