use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::sync::Arc;

use crate::attachments::{MailAttachments, MailPart, RawAttachment};
use crate::config_loader::{Catalog, Settings};
use crate::deadline::{CancelToken, DeadlineGuard};
use crate::domain_utils::{DomainResolver, DomainUtils};
use crate::output::{Document, OutputFormatter, Sink, ANALYSIS_DATE_FIELD};
use crate::url_extractor::UrlExtractor;

/// Per-message processing: fingerprint attachments, collect body URLs and
/// shape the result for a sink, all under one deadline.
#[derive(Clone)]
pub struct MailProcessor {
    catalog: Arc<Catalog>,
    resolver: Arc<dyn DomainResolver>,
    guard: DeadlineGuard,
    max_archive_depth: usize,
}

impl MailProcessor {
    pub fn new(catalog: Arc<Catalog>, settings: &Settings) -> Self {
        Self {
            catalog,
            resolver: Arc::new(DomainUtils),
            guard: DeadlineGuard::from_secs_f64(settings.deadline_seconds),
            max_archive_depth: settings.max_archive_depth,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn DomainResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn process(&self, mail: Document, sink: &Sink) -> Result<(Document, Vec<Document>)> {
        let this = self.clone();
        let sink = sink.clone();

        self.guard
            .run(move |token| this.process_inner(mail, &sink, &token))
            .context("Mail processing timed out")?
    }

    fn process_inner(
        &self,
        mut mail: Document,
        sink: &Sink,
        token: &CancelToken,
    ) -> Result<(Document, Vec<Document>)> {
        mail.entry(ANALYSIS_DATE_FIELD).or_insert_with(|| {
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
        });

        if let Some(Value::Array(parts)) = mail.get_mut("attachments") {
            let raw = std::mem::take(parts)
                .into_iter()
                .map(|part| {
                    serde_json::from_value::<MailPart>(part)
                        .context("Malformed attachment")?
                        .into_raw()
                        .context("Attachment payload is not valid base64")
                })
                .collect::<Result<Vec<RawAttachment>>>()?;

            let mut attachments =
                MailAttachments::with_hashes(raw).with_max_depth(self.max_archive_depth);
            attachments.run_cancellable(token);
            mail.insert(
                "attachments".to_string(),
                serde_json::to_value(attachments.records())?,
            );
        }

        if let Some(body) = mail.get("body").and_then(Value::as_str) {
            let urls = UrlExtractor::extract_whitelisted(
                body,
                &self.catalog.whitelist,
                self.resolver.as_ref(),
            );
            if !urls.is_empty() {
                let entries = serde_json::to_value(urls.reformat())?;
                mail.insert("urls_body".to_string(), entries);
            }
        }

        Ok(OutputFormatter::reformat(&mail, sink)?)
    }
}
