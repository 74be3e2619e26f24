//! Shapes a processed mail record into documents for downstream sinks.
//!
//! Attachments are split out of the mail document, one document each.
//! Container attachments are flattened: every extracted child becomes its
//! own document (emitted before its container) and the container keeps a
//! payload-free summary of its children in `files`. Indexing sinks also get
//! envelope fields (`@timestamp`, `_index`, `_type`, `type`) on every
//! document; queueing sinks get the documents as they are.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

pub type Document = Map<String, Value>;

/// Field holding the time the mail was analysed.
pub const ANALYSIS_DATE_FIELD: &str = "analysis_date";

pub const INDEXING_SINK: &str = "output-elasticsearch";
pub const QUEUEING_SINK: &str = "output-redis";

const MAIL_KIND: &str = "mail";
const ATTACHMENT_KIND: &str = "attachment";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("Mail record has no {0} field")]
    MissingTimestamp(&'static str),
    #[error("Invalid analysis timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("Missing sink parameter: {0}")]
    MissingParameter(String),
    #[error("Unknown sink: {0}")]
    UnknownSink(String),
}

/// Index and document type names for the indexing sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexingParams {
    pub index_mail: String,
    pub type_mail: String,
    pub index_attach: String,
    pub type_attach: String,
}

impl IndexingParams {
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, FormatError> {
        let get = |key: &str| {
            params
                .get(key)
                .cloned()
                .ok_or_else(|| FormatError::MissingParameter(key.to_string()))
        };

        Ok(Self {
            index_mail: get("index_mail")?,
            type_mail: get("type_mail")?,
            index_attach: get("index_attach")?,
            type_attach: get("type_attach")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sink {
    Indexing(IndexingParams),
    Queueing,
}

impl Sink {
    /// Validate a sink identifier and its parameters at the call boundary.
    pub fn from_identifier(
        identifier: &str,
        params: &HashMap<String, String>,
    ) -> Result<Self, FormatError> {
        match identifier {
            INDEXING_SINK => Ok(Sink::Indexing(IndexingParams::from_params(params)?)),
            QUEUEING_SINK => Ok(Sink::Queueing),
            other => Err(FormatError::UnknownSink(other.to_string())),
        }
    }

    /// Same as [`Sink::from_identifier`], with indexing names coming from
    /// settings.
    pub fn from_settings(
        identifier: &str,
        indexing: Option<&IndexingParams>,
    ) -> Result<Self, FormatError> {
        match identifier {
            INDEXING_SINK => indexing
                .cloned()
                .map(Sink::Indexing)
                .ok_or_else(|| FormatError::MissingParameter("elasticsearch".to_string())),
            QUEUEING_SINK => Ok(Sink::Queueing),
            other => Err(FormatError::UnknownSink(other.to_string())),
        }
    }

    pub fn identifier(&self) -> &'static str {
        match self {
            Sink::Indexing(_) => INDEXING_SINK,
            Sink::Queueing => QUEUEING_SINK,
        }
    }
}

pub struct OutputFormatter;

impl OutputFormatter {
    /// Split `mail` into a mail document and attachment documents for `sink`.
    /// `mail` itself is left untouched.
    pub fn reformat(
        mail: &Document,
        sink: &Sink,
    ) -> Result<(Document, Vec<Document>), FormatError> {
        let analysis_date = mail
            .get(ANALYSIS_DATE_FIELD)
            .ok_or(FormatError::MissingTimestamp(ANALYSIS_DATE_FIELD))?;

        let mut mail_doc = mail.clone();
        let attachments = match mail_doc.remove("attachments") {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                log::warn!("Ignoring non-list attachments field: {}", other);
                Vec::new()
            }
        };

        let mut attachment_docs = Vec::new();
        for attachment in attachments {
            match attachment {
                Value::Object(doc) => flatten(doc, false, &mut attachment_docs),
                other => log::warn!("Skipping malformed attachment entry: {}", other),
            }
        }

        if let Sink::Indexing(params) = sink {
            let date = parse_analysis_date(analysis_date)?;
            let timestamp = date.to_rfc3339_opts(SecondsFormat::Millis, true);
            let suffix = date.format("%Y.%m.%d").to_string();

            add_envelope(
                &mut mail_doc,
                &timestamp,
                format!("{}{}", params.index_mail, suffix),
                &params.type_mail,
                MAIL_KIND,
            );
            for doc in &mut attachment_docs {
                add_envelope(
                    doc,
                    &timestamp,
                    format!("{}{}", params.index_attach, suffix),
                    &params.type_attach,
                    ATTACHMENT_KIND,
                );
            }
        }

        log::debug!(
            "Formatted mail for {} with {} attachment documents",
            sink.identifier(),
            attachment_docs.len()
        );

        Ok((mail_doc, attachment_docs))
    }
}

fn flatten(mut doc: Document, extracted: bool, out: &mut Vec<Document>) {
    let is_archive = doc
        .get("is_archive")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if is_archive {
        let children = match doc.remove("files") {
            Some(Value::Array(children)) => children,
            _ => Vec::new(),
        };

        let mut summaries = Vec::with_capacity(children.len());
        for child in children {
            if let Value::Object(child) = child {
                summaries.push(Value::Object(summary(&child)));
                flatten(child, true, out);
            }
        }

        doc.insert("files".to_string(), Value::Array(summaries));
        doc.insert("is_archive".to_string(), Value::Bool(true));
        doc.insert("is_archived".to_string(), Value::Bool(false));
    } else {
        doc.insert("is_archive".to_string(), Value::Bool(false));
        if extracted {
            doc.insert("is_archived".to_string(), Value::Bool(true));
        } else {
            doc.entry("is_archived").or_insert(Value::Bool(false));
        }
    }

    out.push(doc);
}

fn summary(doc: &Document) -> Document {
    let mut summary = doc.clone();
    summary.remove("payload");
    if let Some(Value::Array(files)) = summary.get_mut("files") {
        for file in files.iter_mut() {
            if let Value::Object(child) = file {
                *child = self::summary(child);
            }
        }
    }
    summary
}

fn add_envelope(doc: &mut Document, timestamp: &str, index: String, doc_type: &str, kind: &str) {
    doc.insert("@timestamp".to_string(), Value::String(timestamp.to_string()));
    doc.insert("_index".to_string(), Value::String(index));
    doc.insert("_type".to_string(), Value::String(doc_type.to_string()));
    doc.insert("type".to_string(), Value::String(kind.to_string()));
}

/// Accepts RFC 3339, naive ISO-8601 date-times and bare dates. Naive values
/// are UTC; a bare date is its midnight.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(date) = DateTime::parse_from_rfc3339(raw) {
        return Some(date.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn parse_analysis_date(value: &Value) -> Result<DateTime<Utc>, FormatError> {
    let raw = value
        .as_str()
        .ok_or_else(|| FormatError::InvalidTimestamp(value.to_string()))?;
    parse_timestamp(raw).ok_or_else(|| FormatError::InvalidTimestamp(raw.to_string()))
}
