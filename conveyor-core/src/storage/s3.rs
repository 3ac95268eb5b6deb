use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as AwsS3Client;
use tokio::io::AsyncWriteExt;

use super::{Locator, ObjectStat, StorageBackend, StorageError};

/// S3 backend; also speaks to S3-compatible endpoints when the config
/// supplies an endpoint URL.
pub struct S3Backend {
    client: AwsS3Client,
}

impl S3Backend {
    pub fn new(client: AwsS3Client) -> Self {
        Self { client }
    }

    /// Build a backend from ambient AWS configuration, optionally pointed at
    /// an S3-compatible endpoint (MinIO and friends need path-style access).
    pub async fn from_env(endpoint_url: Option<&str>) -> Self {
        let base = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let mut builder = aws_sdk_s3::config::Builder::from(&base);
        if let Some(endpoint) = endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self::new(AwsS3Client::from_conf(builder.build()))
    }

    fn parts(locator: &Locator) -> Result<(&str, &str), StorageError> {
        match locator {
            Locator::S3 { bucket, key } => Ok((bucket, key)),
            Locator::File(_) => Err(StorageError::InvalidLocator(
                "s3 backend received a non-s3 locator".to_owned(),
            )),
        }
    }
}

fn map_sdk_err<E, R>(err: SdkError<E, R>, locator: &Locator, not_found: bool) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    if not_found {
        StorageError::NotFound(locator.to_string())
    } else {
        StorageError::Unavailable(err.to_string())
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    async fn stat(&self, locator: &Locator) -> Result<ObjectStat, StorageError> {
        let (bucket, key) = Self::parts(locator)?;
        let head = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                let not_found = matches!(&err, SdkError::ServiceError(se) if se.err().is_not_found());
                map_sdk_err(err, locator, not_found)
            })?;

        let size = head.content_length().unwrap_or(0).max(0) as u64;
        Ok(ObjectStat { size })
    }

    async fn exists(&self, locator: &Locator) -> Result<bool, StorageError> {
        match self.stat(locator).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn download_to(&self, locator: &Locator, dest: &Path) -> Result<u64, StorageError> {
        let (bucket, key) = Self::parts(locator)?;
        let object = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                let not_found = matches!(
                    &err,
                    SdkError::ServiceError(se)
                        if matches!(se.err(), aws_sdk_s3::operation::get_object::GetObjectError::NoSuchKey(_))
                );
                map_sdk_err(err, locator, not_found)
            })?;

        let mut sink = tokio::fs::File::create(dest)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        // Stream body chunks straight to disk; the object never sits in
        // memory as a whole.
        let mut body = object.body;
        let mut copied: u64 = 0;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?
        {
            copied += chunk.len() as u64;
            sink.write_all(&chunk)
                .await
                .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        }
        sink.flush()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        Ok(copied)
    }

    async fn upload_file(&self, src: &Path, locator: &Locator) -> Result<(), StorageError> {
        let (bucket, key) = Self::parts(locator)?;
        let body = ByteStream::from_path(src)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        // if_none_match("*") makes overwrite a conditional failure we can
        // classify, instead of a pre-flight exists() race.
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .if_none_match("*")
            .body(body)
            .send()
            .await
            .map_err(|err| {
                let precondition = matches!(
                    &err,
                    SdkError::ServiceError(se) if se.raw().status().as_u16() == 412
                );
                if precondition {
                    StorageError::Conflict(locator.to_string())
                } else {
                    StorageError::Unavailable(err.to_string())
                }
            })?;

        Ok(())
    }
}
