//! Metadata fingerprints and the `checksums.txt` format.
//!
//! A fingerprint is a CRC-32 over the file's name, modification time, size,
//! mode and directory flag. File contents are never read, so the check costs
//! one `stat` no matter how large the body is. It catches truncation and
//! rewrites of the body, but not corruption that leaves those attributes
//! untouched; a content hash would have to be computed during the staging
//! write to close that gap.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// A fingerprint value such as `3af3aaad`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Checksum(String);

impl Checksum {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes the fingerprint of the file at `path` from its metadata.
///
/// # Errors
///
/// Returns the `stat` failure.
pub async fn for_file(path: &Path) -> io::Result<Checksum> {
    let meta = tokio::fs::metadata(path).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mtime_nanos = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(name.as_bytes());
    hasher.update(mtime_nanos.to_string().as_bytes());
    hasher.update(meta.len().to_string().as_bytes());
    hasher.update(mode(&meta).to_string().as_bytes());
    hasher.update(meta.is_dir().to_string().as_bytes());
    Ok(Checksum(format!("{:x}", hasher.finalize())))
}

#[cfg(unix)]
fn mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn mode(meta: &std::fs::Metadata) -> u32 {
    u32::from(meta.permissions().readonly())
}

/// Formats one checksum line: `<sum>  <name>\n`.
#[must_use]
pub fn format_line(sum: &Checksum, name: &str) -> String {
    format!("{sum}  {name}\n")
}

/// Writes a single `{sum, name}` entry to `path`, replacing previous contents.
///
/// # Errors
///
/// Returns the write failure.
pub async fn write_file(path: &Path, sum: &Checksum, name: &str) -> io::Result<()> {
    tokio::fs::write(path, format_line(sum, name)).await
}

/// Parses checksum lines into a map keyed by name. Blank lines and lines
/// starting with `#` are skipped.
///
/// # Errors
///
/// Returns [`io::ErrorKind::InvalidData`] for a line without the two-space separator.
pub fn parse(contents: &str) -> io::Result<HashMap<String, Checksum>> {
    let mut sums = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (sum, name) = line.split_once("  ").ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid checksum line: {line:?}"),
            )
        })?;
        sums.insert(name.to_string(), Checksum(sum.to_string()));
    }
    Ok(sums)
}

/// Reads and parses the checksum file at `path`.
///
/// # Errors
///
/// Returns the read failure or the parse failure from [`parse`].
pub async fn read_file(path: &Path) -> io::Result<HashMap<String, Checksum>> {
    let contents = tokio::fs::read_to_string(path).await?;
    parse(&contents)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_for_file_is_stable_for_unchanged_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("body");
        tokio::fs::write(&path, b"Hello World!").await.unwrap();

        let a = for_file(&path).await.unwrap();
        let b = for_file(&path).await.unwrap();
        assert_eq!(a, b);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_for_file_changes_with_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("body");
        tokio::fs::write(&path, b"Hello World!").await.unwrap();
        let before = for_file(&path).await.unwrap();

        tokio::fs::write(&path, b"Hello").await.unwrap();
        let after = for_file(&path).await.unwrap();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_for_file_missing_file_errors() {
        let dir = TempDir::new().unwrap();
        let err = for_file(&dir.path().join("nope")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_write_file_then_read_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checksums.txt");
        write_file(&path, &Checksum::new("3610a686"), "body")
            .await
            .unwrap();

        assert_eq!(
            tokio::fs::read_to_string(&path).await.unwrap(),
            "3610a686  body\n"
        );
        let sums = read_file(&path).await.unwrap();
        assert_eq!(sums.len(), 1);
        assert_eq!(sums["body"], Checksum::new("3610a686"));
    }

    #[test]
    fn test_parse_skips_comments_and_blank_lines() {
        let sums = parse("# header\n\n  abc  body  \n").unwrap();
        assert_eq!(sums.len(), 1);
        assert_eq!(sums["body"].as_str(), "abc");
    }

    #[test]
    fn test_parse_rejects_single_space_separator() {
        let err = parse("abc body\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
