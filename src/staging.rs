use anyhow::{Context, Result};
use std::io::Write;
use std::path::PathBuf;

use crate::attachments::decode_base64;

/// Write `payload` to a new uniquely named file ending in `extension` and
/// return its path. The caller owns the file and must remove it.
pub fn stage(payload: &[u8], extension: &str) -> Result<PathBuf> {
    let suffix = if extension.is_empty() || extension.starts_with('.') {
        extension.to_string()
    } else {
        format!(".{extension}")
    };

    let mut file = tempfile::Builder::new()
        .prefix("payload-")
        .suffix(&suffix)
        .tempfile()
        .context("Failed to create staging file")?;
    file.write_all(payload)
        .with_context(|| format!("Failed to write payload to {}", file.path().display()))?;
    file.flush()?;

    let (_, path) = file.keep().context("Failed to persist staging file")?;
    log::debug!("Staged {} bytes at {}", payload.len(), path.display());
    Ok(path)
}

/// Stage a base64 encoded payload, as attachments travel on the wire.
pub fn stage_base64(encoded: &str, extension: &str) -> Result<PathBuf> {
    let payload = decode_base64(encoded).context("Payload is not valid base64")?;
    stage(&payload, extension)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::fingerprints;
    use base64::prelude::*;
    use std::fs;

    const LOREM: &str = "Lorem ipsum dolor sit amet, theophrastus rationibus.\n";

    #[test]
    fn test_stage_round_trip() {
        let payload = LOREM.as_bytes();
        let path = stage(payload, ".txt").unwrap();

        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("txt"));
        assert!(path.exists());
        let clone = fs::read(&path).unwrap();
        assert_eq!(fingerprints(&clone).sha1, fingerprints(payload).sha1);

        fs::remove_file(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_stage_base64() {
        let encoded = BASE64_STANDARD.encode(LOREM);
        let path = stage_base64(&encoded, "txt").unwrap();

        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("txt"));
        assert_eq!(fs::read(&path).unwrap(), LOREM.as_bytes());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_unique_paths() {
        let a = stage(b"same", ".bin").unwrap();
        let b = stage(b"same", ".bin").unwrap();
        assert_ne!(a, b);
        fs::remove_file(a).unwrap();
        fs::remove_file(b).unwrap();
    }

    #[test]
    fn test_stage_rejects_bad_base64() {
        assert!(stage_base64("not base64!!", ".txt").is_err());
    }
}
