use regex::Regex;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::sync::LazyLock;

use crate::domain_utils::DomainResolver;
use crate::whitelist::Whitelist;

// Matches stop at whitespace and at angle brackets, so `<https://x>` and a
// trailing `>` never end up inside a URL.
static URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s<>]+").expect("valid URL regex"));

#[derive(Debug, thiserror::Error)]
pub enum UrlError {
    #[error("URL group must map domains to lists of URLs, got {0}")]
    NotAMapping(String),
}

/// URLs found in a text, grouped by registrable domain. Domains and the URLs
/// under each keep first-seen order; serializes as a domain-keyed map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlGroup {
    domains: Vec<(String, Vec<String>)>,
}

impl Serialize for UrlGroup {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.domains.len()))?;
        for (domain, urls) in &self.domains {
            map.serialize_entry(domain, urls)?;
        }
        map.end()
    }
}

/// Flattened form of one domain group, as stored by sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlEntry {
    pub domain: String,
    pub url: Vec<String>,
}

impl UrlGroup {
    pub fn get(&self, domain: &str) -> Option<&Vec<String>> {
        self.domains
            .iter()
            .find(|(name, _)| name == domain)
            .map(|(_, urls)| urls)
    }

    pub fn contains_domain(&self, domain: &str) -> bool {
        self.get(domain).is_some()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn domains(&self) -> impl Iterator<Item = &String> {
        self.domains.iter().map(|(domain, _)| domain)
    }

    /// Record `url` under `domain` unless the same string is already there.
    fn insert(&mut self, domain: String, url: &str) {
        match self.domains.iter_mut().find(|(name, _)| *name == domain) {
            Some((_, urls)) => {
                if !urls.iter().any(|u| u == url) {
                    urls.push(url.to_string());
                }
            }
            None => self.domains.push((domain, vec![url.to_string()])),
        }
    }

    pub fn reformat(&self) -> Vec<UrlEntry> {
        self.domains
            .iter()
            .map(|(domain, urls)| UrlEntry {
                domain: domain.clone(),
                url: urls.clone(),
            })
            .collect()
    }
}

pub struct UrlExtractor;

impl UrlExtractor {
    pub fn extract(text: &str, resolver: &dyn DomainResolver) -> UrlGroup {
        Self::extract_filtered(text, resolver, |_| true)
    }

    /// Lossy entry point for bodies that are not valid UTF-8.
    pub fn extract_bytes(bytes: &[u8], resolver: &dyn DomainResolver) -> UrlGroup {
        Self::extract(&String::from_utf8_lossy(bytes), resolver)
    }

    /// Like [`UrlExtractor::extract`], dropping every whitelisted domain.
    pub fn extract_whitelisted(
        text: &str,
        whitelist: &Whitelist,
        resolver: &dyn DomainResolver,
    ) -> UrlGroup {
        Self::extract_filtered(text, resolver, |domain| !whitelist.contains(domain))
    }

    fn extract_filtered<F>(text: &str, resolver: &dyn DomainResolver, keep: F) -> UrlGroup
    where
        F: Fn(&str) -> bool,
    {
        let mut group = UrlGroup::default();

        for found in URL_REGEX.find_iter(text) {
            let url = found.as_str();
            match resolver.registrable_domain(url) {
                Some(domain) if keep(&domain) => group.insert(domain, url),
                Some(domain) => log::debug!("Skipping whitelisted domain {}", domain),
                None => log::debug!("Could not resolve a domain for {}", url),
            }
        }

        group
    }
}

/// Flatten a dynamically typed URL group (for example one read back from a
/// sink document).
pub fn reformat_urls(value: &Value) -> Result<Vec<UrlEntry>, UrlError> {
    let map = value
        .as_object()
        .ok_or_else(|| UrlError::NotAMapping(type_name(value).to_string()))?;

    map.iter()
        .map(|(domain, urls)| {
            let urls = urls.as_array().ok_or_else(|| {
                UrlError::NotAMapping(format!("{} for {domain}", type_name(urls)))
            })?;
            let url = urls
                .iter()
                .map(|u| {
                    u.as_str().map(str::to_string).ok_or_else(|| {
                        UrlError::NotAMapping(format!("{} in {domain}", type_name(u)))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(UrlEntry {
                domain: domain.clone(),
                url,
            })
        })
        .collect()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
