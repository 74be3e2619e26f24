pub mod attachments;
pub mod config_loader;
pub mod deadline;
pub mod domain_utils;
pub mod keywords;
pub mod output;
pub mod pipeline;
pub mod staging;
pub mod url_extractor;
pub mod whitelist;
pub mod work_item;

pub use attachments::{fingerprints, AttachmentRecord, Fingerprints, MailAttachments, RawAttachment};
pub use config_loader::{Catalog, ConfigError, ConfigStore, Settings};
pub use deadline::{CancelToken, DeadlineError, DeadlineGuard};
pub use domain_utils::{DomainResolver, DomainUtils};
pub use keywords::{search_words_in_text, KeywordIndex};
pub use output::{Document, FormatError, IndexingParams, OutputFormatter, Sink};
pub use pipeline::MailProcessor;
pub use staging::{stage, stage_base64};
pub use url_extractor::{reformat_urls, UrlEntry, UrlExtractor, UrlGroup};
pub use whitelist::{Whitelist, WhitelistStore};
pub use work_item::WorkItem;
