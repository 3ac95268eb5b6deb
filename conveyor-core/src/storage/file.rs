use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};

use super::{normalize_path, Locator, ObjectStat, StorageBackend, StorageError};

const COPY_BUFFER: usize = 1 << 20;

/// Local filesystem backend. Every path is lexically normalized and must
/// fall under one of the configured roots before any filesystem call runs.
pub struct FileBackend {
    roots: Vec<PathBuf>,
}

impl FileBackend {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    fn resolve(&self, locator: &Locator) -> Result<PathBuf, StorageError> {
        let Locator::File(path) = locator else {
            return Err(StorageError::InvalidLocator(
                "file backend received a non-file locator".to_owned(),
            ));
        };

        let normalized = normalize_path(path).ok_or_else(|| {
            StorageError::InvalidLocator("path climbs above the filesystem root".to_owned())
        })?;

        if !self.roots.iter().any(|root| normalized.starts_with(root)) {
            return Err(StorageError::InvalidLocator(
                "path is outside the configured roots".to_owned(),
            ));
        }

        Ok(normalized)
    }

    fn map_io(err: std::io::Error, path: &Path) -> StorageError {
        match err.kind() {
            ErrorKind::NotFound => StorageError::NotFound(path.display().to_string()),
            ErrorKind::AlreadyExists => StorageError::Conflict(path.display().to_string()),
            _ => StorageError::Unavailable(err.to_string()),
        }
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn stat(&self, locator: &Locator) -> Result<ObjectStat, StorageError> {
        let path = self.resolve(locator)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| Self::map_io(e, &path))?;
        if !meta.is_file() {
            return Err(StorageError::NotFound(path.display().to_string()));
        }
        Ok(ObjectStat { size: meta.len() })
    }

    async fn exists(&self, locator: &Locator) -> Result<bool, StorageError> {
        let path = self.resolve(locator)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(Self::map_io(err, &path)),
        }
    }

    async fn download_to(&self, locator: &Locator, dest: &Path) -> Result<u64, StorageError> {
        let path = self.resolve(locator)?;
        let source = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Self::map_io(e, &path))?;
        let sink = tokio::fs::File::create(dest)
            .await
            .map_err(|e| Self::map_io(e, dest))?;

        let mut reader = BufReader::with_capacity(COPY_BUFFER, source);
        let mut writer = BufWriter::with_capacity(COPY_BUFFER, sink);
        let copied = tokio::io::copy(&mut reader, &mut writer)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        Ok(copied)
    }

    async fn upload_file(&self, src: &Path, locator: &Locator) -> Result<(), StorageError> {
        let path = self.resolve(locator)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::map_io(e, parent))?;
        }

        // create_new makes "already exists" a first-class error instead of a
        // pre-check that could race.
        let sink = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| Self::map_io(e, &path))?;

        let source = tokio::fs::File::open(src)
            .await
            .map_err(|e| Self::map_io(e, src))?;

        let mut reader = BufReader::with_capacity(COPY_BUFFER, source);
        let mut writer = BufWriter::with_capacity(COPY_BUFFER, sink);
        tokio::io::copy(&mut reader, &mut writer)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(root: &Path) -> FileBackend {
        FileBackend::new(vec![root.to_path_buf()])
    }

    #[tokio::test]
    async fn stat_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mov");
        tokio::fs::write(&path, b"not really a movie").await.unwrap();

        let backend = backend(dir.path());
        let stat = backend
            .stat(&Locator::File(path.clone()))
            .await
            .unwrap();
        assert_eq!(stat.size, 18);
    }

    #[tokio::test]
    async fn stat_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let err = backend
            .stat(&Locator::File(dir.path().join("nope.mov")))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn paths_outside_roots_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());

        let escape = dir.path().join("..").join("etc").join("passwd");
        let err = backend.stat(&Locator::File(escape)).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidLocator(_)));

        let foreign = Locator::File(PathBuf::from("/etc/passwd"));
        let err = backend.stat(&foreign).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidLocator(_)));
    }

    #[tokio::test]
    async fn download_then_upload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());

        let source = dir.path().join("in.bin");
        tokio::fs::write(&source, vec![7u8; 4096]).await.unwrap();

        let local = scratch.path().join("working.bin");
        let copied = backend
            .download_to(&Locator::File(source), &local)
            .await
            .unwrap();
        assert_eq!(copied, 4096);

        let out = Locator::File(dir.path().join("out/result.bin"));
        backend.upload_file(&local, &out).await.unwrap();
        assert!(backend.exists(&out).await.unwrap());
    }

    #[tokio::test]
    async fn upload_over_existing_object_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());

        let src = dir.path().join("src.bin");
        tokio::fs::write(&src, b"payload").await.unwrap();

        let target = Locator::File(dir.path().join("occupied.bin"));
        tokio::fs::write(dir.path().join("occupied.bin"), b"already here")
            .await
            .unwrap();

        let err = backend.upload_file(&src, &target).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }
}
