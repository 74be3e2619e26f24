use base64::prelude::*;
use md5::Md5;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read};

use crate::deadline::CancelToken;

pub const DEFAULT_MAX_ARCHIVE_DEPTH: usize = 3;

// Entries larger than this are skipped rather than inflated in memory.
const MAX_ENTRY_SIZE: u64 = 64 * 1024 * 1024;

/// Lowercase hex digests of a payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprints {
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
}

pub fn fingerprints(payload: &[u8]) -> Fingerprints {
    Fingerprints {
        md5: hex::encode(Md5::digest(payload)),
        sha1: hex::encode(Sha1::digest(payload)),
        sha256: hex::encode(Sha256::digest(payload)),
    }
}

/// An attachment as handed over by the MIME parser, payload already decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttachment {
    pub filename: String,
    pub content_type: String,
    pub payload: Vec<u8>,
}

/// Attachment object in the shape the mail parser emits it.
#[derive(Debug, Clone, Deserialize)]
pub struct MailPart {
    #[serde(default)]
    pub filename: String,
    #[serde(default, alias = "content_type")]
    pub mail_content_type: String,
    pub payload: String,
    #[serde(default)]
    pub binary: bool,
    #[serde(default)]
    pub content_transfer_encoding: String,
}

impl MailPart {
    pub fn is_base64(&self) -> bool {
        self.binary || self.content_transfer_encoding.eq_ignore_ascii_case("base64")
    }

    pub fn into_raw(self) -> Result<RawAttachment, base64::DecodeError> {
        let payload = if self.is_base64() {
            decode_base64(&self.payload)?
        } else {
            self.payload.into_bytes()
        };
        Ok(RawAttachment {
            filename: self.filename,
            content_type: self.mail_content_type,
            payload,
        })
    }
}

/// Decode base64 that may be wrapped over several lines.
pub fn decode_base64(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    BASE64_STANDARD.decode(compact)
}

fn deserialize_payload<'de, D>(d: D) -> Result<Option<Vec<u8>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<String>::deserialize(d)?
        .map(|encoded| decode_base64(&encoded).map_err(serde::de::Error::custom))
        .transpose()
}

/// A fingerprinted attachment. Containers carry their extracted children in
/// `files`; the key is serialized for containers only, even when empty.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AttachmentRecord {
    pub filename: String,
    #[serde(default)]
    pub mail_content_type: String,
    #[serde(default)]
    pub content_type: Option<String>,
    pub size: usize,
    #[serde(default, deserialize_with = "deserialize_payload")]
    pub payload: Option<Vec<u8>>,
    #[serde(flatten)]
    pub fingerprints: Fingerprints,
    #[serde(default)]
    pub is_archive: bool,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub files: Vec<AttachmentRecord>,
}

impl Serialize for AttachmentRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("filename", &self.filename)?;
        map.serialize_entry("mail_content_type", &self.mail_content_type)?;
        if let Some(content_type) = &self.content_type {
            map.serialize_entry("content_type", content_type)?;
        }
        map.serialize_entry("size", &self.size)?;
        if let Some(payload) = &self.payload {
            map.serialize_entry("payload", &BASE64_STANDARD.encode(payload))?;
        }
        map.serialize_entry("md5", &self.fingerprints.md5)?;
        map.serialize_entry("sha1", &self.fingerprints.sha1)?;
        map.serialize_entry("sha256", &self.fingerprints.sha256)?;
        map.serialize_entry("is_archive", &self.is_archive)?;
        map.serialize_entry("is_archived", &self.is_archived)?;
        if self.is_archive {
            map.serialize_entry("files", &self.files)?;
        }
        map.end()
    }
}

impl AttachmentRecord {
    pub fn new(filename: &str, mail_content_type: &str, payload: Vec<u8>) -> Self {
        Self {
            filename: filename.to_string(),
            mail_content_type: mail_content_type.to_string(),
            content_type: None,
            size: payload.len(),
            fingerprints: fingerprints(&payload),
            payload: Some(payload),
            is_archive: false,
            is_archived: false,
            files: Vec::new(),
        }
    }

    /// Copy without payloads, at any depth; the shape used inside a
    /// container's `files`.
    pub fn summary(&self) -> Self {
        Self {
            payload: None,
            files: self.files.iter().map(Self::summary).collect(),
            ..self.clone()
        }
    }
}

/// Content type sniffing.
pub trait ContentInspector: Send + Sync {
    fn content_type(&self, filename: &str, payload: &[u8]) -> String;
    fn is_archive(&self, content_type: &str) -> bool;
}

/// Decompression of container payloads.
pub trait ArchiveExtractor: Send + Sync {
    /// Entries that fail to decompress are skipped; an error means the
    /// container could not be read at all.
    fn extract(&self, payload: &[u8]) -> Result<Vec<ArchiveEntry>, ArchiveError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Unsupported archive format")]
    Unsupported,
    #[error("Corrupt archive: {0}")]
    Corrupt(String),
}

const ARCHIVE_TYPES: &[&str] = &[
    "application/zip",
    "application/gzip",
    "application/x-rar-compressed",
    "application/x-7z-compressed",
];

/// Magic-byte detection, falling back to the filename extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct MagicInspector;

impl MagicInspector {
    fn sniff(payload: &[u8]) -> Option<&'static str> {
        match payload {
            [0x50, 0x4B, 0x03, 0x04, ..] | [0x50, 0x4B, 0x05, 0x06, ..] => Some("application/zip"),
            [0x1F, 0x8B, ..] => Some("application/gzip"),
            [0x52, 0x61, 0x72, 0x21, 0x1A, 0x07, ..] => Some("application/x-rar-compressed"),
            [0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C, ..] => Some("application/x-7z-compressed"),
            [0x25, 0x50, 0x44, 0x46, ..] => Some("application/pdf"), // %PDF
            [0x4D, 0x5A, ..] => Some("application/x-dosexec"),      // MZ (PE)
            _ => None,
        }
    }

    // Office and Java formats are zip files too, but are documents here.
    fn is_zip_based_document(guess: &str) -> bool {
        guess.starts_with("application/vnd.openxmlformats")
            || guess.starts_with("application/vnd.oasis.opendocument")
            || guess == "application/java-archive"
    }
}

impl ContentInspector for MagicInspector {
    fn content_type(&self, filename: &str, payload: &[u8]) -> String {
        let guess = mime_guess::from_path(filename)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        match Self::sniff(payload) {
            Some("application/zip") if Self::is_zip_based_document(&guess) => guess,
            Some(sniffed) => sniffed.to_string(),
            None => guess,
        }
    }

    fn is_archive(&self, content_type: &str) -> bool {
        ARCHIVE_TYPES.contains(&content_type)
    }
}

/// Zip decompression through the `zip` crate; other container formats are
/// reported as unsupported.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipExtractor;

impl ArchiveExtractor for ZipExtractor {
    fn extract(&self, payload: &[u8]) -> Result<Vec<ArchiveEntry>, ArchiveError> {
        if MagicInspector::sniff(payload) != Some("application/zip") {
            return Err(ArchiveError::Unsupported);
        }

        let mut archive = zip::ZipArchive::new(Cursor::new(payload))
            .map_err(|e| ArchiveError::Corrupt(e.to_string()))?;
        let mut entries = Vec::new();

        for index in 0..archive.len() {
            let mut file = match archive.by_index(index) {
                Ok(file) => file,
                Err(e) => {
                    log::warn!("Skipping unreadable archive entry {}: {}", index, e);
                    continue;
                }
            };
            if file.is_dir() {
                continue;
            }
            if file.size() > MAX_ENTRY_SIZE {
                log::warn!(
                    "Skipping archive entry {} ({} bytes exceeds limit)",
                    file.name(),
                    file.size()
                );
                continue;
            }

            let name = file.name().to_string();
            let mut content = Vec::new();
            match file.read_to_end(&mut content) {
                Ok(_) => entries.push(ArchiveEntry {
                    name,
                    payload: content,
                }),
                Err(e) => log::warn!("Skipping corrupt archive entry {}: {}", name, e),
            }
        }

        Ok(entries)
    }
}

/// Fingerprints a message's attachments and flattens container contents.
pub struct MailAttachments {
    records: Vec<AttachmentRecord>,
    inspector: Box<dyn ContentInspector>,
    extractor: Box<dyn ArchiveExtractor>,
    max_depth: usize,
    processed: bool,
}

impl MailAttachments {
    /// Fingerprint every attachment up front; detection and extraction
    /// happen in [`MailAttachments::run`].
    pub fn with_hashes(raw: Vec<RawAttachment>) -> Self {
        let records = raw
            .into_iter()
            .map(|a| AttachmentRecord::new(&a.filename, &a.content_type, a.payload))
            .collect();

        Self {
            records,
            inspector: Box::new(MagicInspector),
            extractor: Box::new(ZipExtractor),
            max_depth: DEFAULT_MAX_ARCHIVE_DEPTH,
            processed: false,
        }
    }

    pub fn with_collaborators(
        mut self,
        inspector: Box<dyn ContentInspector>,
        extractor: Box<dyn ArchiveExtractor>,
    ) -> Self {
        self.inspector = inspector;
        self.extractor = extractor;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Fingerprint, detect and flatten in one go.
    pub fn build(raw: Vec<RawAttachment>) -> Vec<AttachmentRecord> {
        let mut attachments = Self::with_hashes(raw);
        attachments.run();
        attachments.into_records()
    }

    pub fn run(&mut self) {
        self.run_cancellable(&CancelToken::new());
    }

    /// Detect containers and extract their children. Runs once; later calls
    /// are no-ops. Stops between attachments when `token` is cancelled, and a
    /// later call resumes with the attachments not yet inspected.
    pub fn run_cancellable(&mut self, token: &CancelToken) {
        if self.processed {
            return;
        }

        for record in &mut self.records {
            if record.content_type.is_some() {
                continue;
            }
            if token.is_cancelled() {
                log::warn!("Attachment processing cancelled before {}", record.filename);
                return;
            }
            let payload = record.payload.take().unwrap_or_default();
            Self::inspect(
                self.inspector.as_ref(),
                self.extractor.as_ref(),
                record,
                &payload,
                self.max_depth,
            );
            record.payload = Some(payload);
        }

        self.processed = true;
    }

    fn inspect(
        inspector: &dyn ContentInspector,
        extractor: &dyn ArchiveExtractor,
        record: &mut AttachmentRecord,
        payload: &[u8],
        depth_left: usize,
    ) {
        record.files.clear();
        let content_type = inspector.content_type(&record.filename, payload);
        record.is_archive = inspector.is_archive(&content_type);
        record.content_type = Some(content_type);

        if !record.is_archive {
            return;
        }
        record.is_archived = false;

        if depth_left == 0 {
            log::warn!(
                "Archive nesting limit reached at {}, not extracting",
                record.filename
            );
            return;
        }

        let entries = match extractor.extract(payload) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Failed to extract {}: {}", record.filename, e);
                return;
            }
        };

        log::debug!(
            "Extracted {} entries from {}",
            entries.len(),
            record.filename
        );

        for entry in entries {
            let mut child = AttachmentRecord::new(&entry.name, "", entry.payload);
            child.is_archived = true;
            let child_payload = child.payload.take().unwrap_or_default();
            Self::inspect(inspector, extractor, &mut child, &child_payload, depth_left - 1);
            child.payload = Some(child_payload);
            record.files.push(child);
        }
    }

    pub fn records(&self) -> &[AttachmentRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<AttachmentRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<'a> IntoIterator for &'a MailAttachments {
    type Item = &'a AttachmentRecord;
    type IntoIter = std::slice::Iter<'a, AttachmentRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    pub(crate) fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options: FileOptions<'_, ()> = FileOptions::default();
        for (name, content) in files {
            zip.start_file(*name, options).unwrap();
            zip.write_all(content).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn test_fingerprints() {
        let f = fingerprints(b"abc");
        assert_eq!(f.md5, "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(f.sha1, "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(
            f.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(fingerprints(b"abc"), f);
    }

    #[test]
    fn test_plain_attachment() {
        let records = MailAttachments::build(vec![RawAttachment {
            filename: "notes.txt".to_string(),
            content_type: "text/plain".to_string(),
            payload: b"hello".to_vec(),
        }]);

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert!(!record.is_archive);
        assert!(!record.is_archived);
        assert!(record.files.is_empty());
        assert_eq!(record.content_type.as_deref(), Some("text/plain"));
        assert_eq!(record.payload.as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn test_archive_is_flattened() {
        let archive = zip_bytes(&[("a.txt", b"first"), ("b.exe", b"MZ\x90\x00")]);
        let records = MailAttachments::build(vec![RawAttachment {
            filename: "bundle.zip".to_string(),
            content_type: "application/octet-stream".to_string(),
            payload: archive.clone(),
        }]);

        let container = &records[0];
        assert!(container.is_archive);
        assert!(!container.is_archived);
        assert_eq!(container.payload.as_deref(), Some(&archive[..]));
        assert_eq!(container.files.len(), 2);

        let child = &container.files[0];
        assert_eq!(child.filename, "a.txt");
        assert!(child.is_archived);
        assert!(!child.is_archive);
        assert_eq!(child.fingerprints, fingerprints(b"first"));
        assert_eq!(child.payload.as_deref(), Some(&b"first"[..]));
        assert_eq!(
            container.files[1].content_type.as_deref(),
            Some("application/x-dosexec")
        );

        let summary = container.summary();
        assert!(summary.payload.is_none());
        assert!(summary.files.iter().all(|f| f.payload.is_none()));
    }

    #[test]
    fn test_nested_archive_respects_depth() {
        let inner = zip_bytes(&[("deep.txt", b"deep")]);
        let outer = zip_bytes(&[("inner.zip", inner.as_slice())]);
        let raw = vec![RawAttachment {
            filename: "outer.zip".to_string(),
            content_type: String::new(),
            payload: outer,
        }];

        let records = MailAttachments::build(raw.clone());
        let nested = &records[0].files[0];
        assert!(nested.is_archive);
        assert!(!nested.is_archived);
        assert_eq!(nested.files.len(), 1);
        assert!(nested.files[0].is_archived);

        let mut shallow = MailAttachments::with_hashes(raw).with_max_depth(1);
        shallow.run();
        let nested = &shallow.records()[0].files[0];
        assert!(nested.is_archive);
        assert!(nested.files.is_empty());
    }

    #[test]
    fn test_corrupt_archive_is_contained() {
        let mut broken = b"PK\x03\x04".to_vec();
        broken.extend_from_slice(&[0u8; 32]);
        let records = MailAttachments::build(vec![
            RawAttachment {
                filename: "broken.zip".to_string(),
                content_type: String::new(),
                payload: broken,
            },
            RawAttachment {
                filename: "ok.zip".to_string(),
                content_type: String::new(),
                payload: zip_bytes(&[("x.txt", b"x")]),
            },
        ]);

        assert!(records[0].is_archive);
        assert!(records[0].files.is_empty());
        assert_eq!(records[1].files.len(), 1);
    }

    #[test]
    fn test_run_is_idempotent() {
        let mut attachments = MailAttachments::with_hashes(vec![RawAttachment {
            filename: "bundle.zip".to_string(),
            content_type: String::new(),
            payload: zip_bytes(&[("a.txt", b"a")]),
        }]);
        attachments.run();
        attachments.run();

        assert_eq!(attachments.records()[0].files.len(), 1);
    }

    #[test]
    fn test_cancelled_run_stops() {
        let token = CancelToken::new();
        token.cancel();
        let mut attachments = MailAttachments::with_hashes(vec![RawAttachment {
            filename: "bundle.zip".to_string(),
            content_type: String::new(),
            payload: zip_bytes(&[("a.txt", b"a")]),
        }]);
        attachments.run_cancellable(&token);

        assert!(attachments.records()[0].files.is_empty());
        assert!(attachments.records()[0].content_type.is_none());
    }

    struct CancellingInspector {
        token: CancelToken,
        on: &'static str,
    }

    impl ContentInspector for CancellingInspector {
        fn content_type(&self, filename: &str, payload: &[u8]) -> String {
            if filename == self.on {
                self.token.cancel();
            }
            MagicInspector.content_type(filename, payload)
        }

        fn is_archive(&self, content_type: &str) -> bool {
            MagicInspector.is_archive(content_type)
        }
    }

    #[test]
    fn test_rerun_after_cancel_resumes() {
        let token = CancelToken::new();
        let inspector = CancellingInspector {
            token: token.clone(),
            on: "first.zip",
        };
        let bundle = |name: &str| RawAttachment {
            filename: name.to_string(),
            content_type: String::new(),
            payload: zip_bytes(&[("a.txt", b"a")]),
        };
        let raw = vec![bundle("first.zip"), bundle("second.zip")];
        let mut attachments = MailAttachments::with_hashes(raw)
            .with_collaborators(Box::new(inspector), Box::new(ZipExtractor));

        attachments.run_cancellable(&token);
        assert_eq!(attachments.records()[0].files.len(), 1);
        assert!(attachments.records()[1].content_type.is_none());

        attachments.run();
        assert_eq!(attachments.records()[0].files.len(), 1);
        assert_eq!(attachments.records()[1].files.len(), 1);
        attachments.run();
        assert_eq!(attachments.records()[1].files.len(), 1);
    }

    #[test]
    fn test_office_document_is_not_archive() {
        let inspector = MagicInspector;
        let docx = zip_bytes(&[("word/document.xml", b"<w:document/>")]);
        let content_type = inspector.content_type("report.docx", &docx);
        assert!(content_type.starts_with("application/vnd.openxmlformats"));
        assert!(!inspector.is_archive(&content_type));
    }

    #[test]
    fn test_mail_part_decoding() {
        let part: MailPart = serde_json::from_value(serde_json::json!({
            "filename": "a.bin",
            "mail_content_type": "application/octet-stream",
            "payload": "aGVs\nbG8=",
            "binary": true
        }))
        .unwrap();
        let raw = part.into_raw().unwrap();
        assert_eq!(raw.payload, b"hello");

        let text: MailPart = serde_json::from_value(serde_json::json!({
            "filename": "a.txt",
            "payload": "plain",
            "content_transfer_encoding": "7bit"
        }))
        .unwrap();
        assert_eq!(text.into_raw().unwrap().payload, b"plain");
    }

    #[test]
    fn test_record_serialization() {
        let records = MailAttachments::build(vec![RawAttachment {
            filename: "bundle.zip".to_string(),
            content_type: String::new(),
            payload: zip_bytes(&[("a.txt", b"a")]),
        }]);
        let value = serde_json::to_value(&records[0]).unwrap();

        assert_eq!(value["is_archive"], true);
        assert_eq!(value["md5"], records[0].fingerprints.md5.as_str());
        assert_eq!(value["files"][0]["payload"], BASE64_STANDARD.encode(b"a"));

        let back: AttachmentRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, records[0]);
    }

    #[test]
    fn test_files_key_follows_is_archive() {
        let mut broken = b"PK\x03\x04".to_vec();
        broken.extend_from_slice(&[0u8; 32]);
        let records = MailAttachments::build(vec![
            RawAttachment {
                filename: "broken.zip".to_string(),
                content_type: String::new(),
                payload: broken,
            },
            RawAttachment {
                filename: "notes.txt".to_string(),
                content_type: "text/plain".to_string(),
                payload: b"hello".to_vec(),
            },
        ]);

        let container = serde_json::to_value(&records[0]).unwrap();
        assert_eq!(container["is_archive"], true);
        assert_eq!(container["files"], serde_json::json!([]));

        let plain = serde_json::to_value(&records[1]).unwrap();
        assert!(plain.get("files").is_none());
    }
}
