use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::circuit::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::ErrorCode;

mod file;
mod mock;
mod s3;

pub use file::FileBackend;
pub use mock::MockStorage;
pub use s3::S3Backend;

/// A parsed input/output locator. Only `file://` and `s3://` (plus
/// S3-compatible endpoints via configuration) are supported; other schemes
/// are future backends behind the same trait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    File(PathBuf),
    S3 { bucket: String, key: String },
}

impl Locator {
    pub fn parse(raw: &str) -> Result<Locator, StorageError> {
        if let Some(rest) = raw.strip_prefix("file://") {
            if rest.is_empty() {
                return Err(StorageError::InvalidLocator("empty file path".to_owned()));
            }
            return Ok(Locator::File(PathBuf::from(rest)));
        }

        if let Some(rest) = raw.strip_prefix("s3://") {
            let (bucket, key) = rest
                .split_once('/')
                .ok_or_else(|| StorageError::InvalidLocator("s3 locator needs a key".to_owned()))?;
            if bucket.is_empty() || key.is_empty() {
                return Err(StorageError::InvalidLocator(
                    "s3 locator needs a bucket and a key".to_owned(),
                ));
            }
            return Ok(Locator::S3 {
                bucket: bucket.to_owned(),
                // Object keys always use forward slashes, whatever the client sent.
                key: key.replace('\\', "/"),
            });
        }

        Err(StorageError::InvalidLocator(format!(
            "unsupported scheme in locator (expected file:// or s3://): {}",
            raw.chars().take(16).collect::<String>()
        )))
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Locator::File(_) => "file",
            Locator::S3 { .. } => "s3",
        }
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Locator::File(path) => write!(f, "file://{}", path.display()),
            Locator::S3 { bucket, key } => write!(f, "s3://{bucket}/{key}"),
        }
    }
}

/// Lexically canonicalize a path: collapse `.` and `..` without touching the
/// filesystem, so the answer does not depend on whether the target exists.
/// Returns None when `..` would climb above the root.
pub fn normalize_path(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    let mut depth: usize = 0;

    for component in path.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(Component::RootDir),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                normalized.pop();
                depth -= 1;
            }
            Component::Normal(part) => {
                normalized.push(part);
                depth += 1;
            }
        }
    }

    Some(normalized)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStat {
    pub size: u64,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("object already exists: {0}")]
    Conflict(String),
    #[error("invalid locator: {0}")]
    InvalidLocator(String),
    #[error("storage operation failed: {0}")]
    Unavailable(String),
}

impl StorageError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StorageError::NotFound(_) => ErrorCode::StorageNotFound,
            StorageError::Conflict(_) => ErrorCode::StorageConflict,
            StorageError::InvalidLocator(_) => ErrorCode::InvalidPath,
            StorageError::Unavailable(_) => ErrorCode::StorageUnavailable,
        }
    }

    /// Only backend unavailability counts against the circuit breaker;
    /// missing objects and conflicts are answers, not outages.
    fn is_outage(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

/// The storage collaborator. `exists` is advisory only and never used as a
/// TOCTOU gate: writers attempt the write and surface `Conflict` as a
/// first-class error.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn stat(&self, locator: &Locator) -> Result<ObjectStat, StorageError>;
    async fn exists(&self, locator: &Locator) -> Result<bool, StorageError>;
    async fn download_to(&self, locator: &Locator, dest: &Path) -> Result<u64, StorageError>;
    async fn upload_file(&self, src: &Path, locator: &Locator) -> Result<(), StorageError>;
}

/// Routes locators to the backend for their scheme, with an independent
/// circuit breaker per backend instance.
pub struct StorageRouter {
    file: Guarded<FileBackend>,
    s3: Option<Guarded<S3Backend>>,
}

impl StorageRouter {
    pub fn new(file: FileBackend, s3: Option<S3Backend>) -> Self {
        Self {
            file: Guarded::new("storage_file", file),
            s3: s3.map(|backend| Guarded::new("storage_s3", backend)),
        }
    }

    fn backend_for(&self, locator: &Locator) -> Result<&dyn StorageBackend, StorageError> {
        match locator {
            Locator::File(_) => Ok(&self.file),
            Locator::S3 { .. } => match &self.s3 {
                Some(backend) => Ok(backend),
                None => Err(StorageError::InvalidLocator(
                    "s3 backend is not enabled".to_owned(),
                )),
            },
        }
    }
}

#[async_trait]
impl StorageBackend for StorageRouter {
    async fn stat(&self, locator: &Locator) -> Result<ObjectStat, StorageError> {
        self.backend_for(locator)?.stat(locator).await
    }

    async fn exists(&self, locator: &Locator) -> Result<bool, StorageError> {
        self.backend_for(locator)?.exists(locator).await
    }

    async fn download_to(&self, locator: &Locator, dest: &Path) -> Result<u64, StorageError> {
        self.backend_for(locator)?.download_to(locator, dest).await
    }

    async fn upload_file(&self, src: &Path, locator: &Locator) -> Result<(), StorageError> {
        self.backend_for(locator)?.upload_file(src, locator).await
    }
}

/// Circuit-breaker wrapper applied around each backend client instance.
struct Guarded<B> {
    inner: B,
    breaker: Arc<CircuitBreaker>,
}

impl<B> Guarded<B> {
    fn new(name: &str, inner: B) -> Self {
        Self {
            inner,
            breaker: Arc::new(CircuitBreaker::new(name, CircuitBreakerConfig::default())),
        }
    }

    fn gate(&self) -> Result<(), StorageError> {
        if self.breaker.can_execute() {
            Ok(())
        } else {
            Err(StorageError::Unavailable(
                "storage circuit breaker is open".to_owned(),
            ))
        }
    }

    fn observe<T>(&self, result: Result<T, StorageError>) -> Result<T, StorageError> {
        match &result {
            Err(err) if err.is_outage() => self.breaker.record_failure(),
            _ => self.breaker.record_success(),
        }
        result
    }
}

#[async_trait]
impl<B: StorageBackend> StorageBackend for Guarded<B> {
    async fn stat(&self, locator: &Locator) -> Result<ObjectStat, StorageError> {
        self.gate()?;
        let result = self.inner.stat(locator).await;
        self.observe(result)
    }

    async fn exists(&self, locator: &Locator) -> Result<bool, StorageError> {
        self.gate()?;
        let result = self.inner.exists(locator).await;
        self.observe(result)
    }

    async fn download_to(&self, locator: &Locator, dest: &Path) -> Result<u64, StorageError> {
        self.gate()?;
        let result = self.inner.download_to(locator, dest).await;
        self.observe(result)
    }

    async fn upload_file(&self, src: &Path, locator: &Locator) -> Result<(), StorageError> {
        self.gate()?;
        let result = self.inner.upload_file(src, locator).await;
        self.observe(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_locators() {
        let locator = Locator::parse("file:///storage/in/clip.mov").unwrap();
        assert_eq!(locator, Locator::File(PathBuf::from("/storage/in/clip.mov")));
        assert_eq!(locator.scheme(), "file");
    }

    #[test]
    fn parses_s3_locators() {
        let locator = Locator::parse("s3://media-in/customer/clip.mp4").unwrap();
        assert_eq!(
            locator,
            Locator::S3 {
                bucket: "media-in".to_owned(),
                key: "customer/clip.mp4".to_owned(),
            }
        );
    }

    #[test]
    fn s3_keys_get_forward_slashes() {
        let locator = Locator::parse(r"s3://media-in/folder\clip.mp4").unwrap();
        assert_eq!(
            locator,
            Locator::S3 {
                bucket: "media-in".to_owned(),
                key: "folder/clip.mp4".to_owned(),
            }
        );
    }

    #[test]
    fn rejects_unknown_schemes_and_empty_locators() {
        assert!(Locator::parse("gs://bucket/key").is_err());
        assert!(Locator::parse("file://").is_err());
        assert!(Locator::parse("s3://bucket-only").is_err());
        assert!(Locator::parse("s3://bucket/").is_err());
    }

    #[test]
    fn normalize_collapses_dot_segments() {
        assert_eq!(
            normalize_path(Path::new("/storage/./in/../out/clip.mp4")),
            Some(PathBuf::from("/storage/out/clip.mp4"))
        );
    }

    #[test]
    fn normalize_resolves_traversal_out_of_a_directory() {
        // The scope check catches this afterwards; normalization itself just
        // tells the truth about where the path lands.
        assert_eq!(
            normalize_path(Path::new("/storage/../etc/passwd")),
            Some(PathBuf::from("/etc/passwd"))
        );
    }

    #[test]
    fn normalize_rejects_escapes_past_the_root() {
        assert_eq!(normalize_path(Path::new("/../x")), None);
        assert_eq!(normalize_path(Path::new("../x")), None);
    }

    #[test]
    fn normalize_is_lexical() {
        // The decision must not depend on whether the target exists.
        assert_eq!(
            normalize_path(Path::new("/definitely/not/a/real/path/../file")),
            Some(PathBuf::from("/definitely/not/a/real/file"))
        );
    }
}
