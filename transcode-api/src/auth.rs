use async_trait::async_trait;
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use thiserror::Error;

use conveyor_core::ApiKeyRecord;

#[derive(Error, Debug)]
pub enum KeyStoreError {
    #[error("key store unavailable: {0}")]
    Unavailable(String),
}

/// The auth collaborator: resolves api-key material to the owning record.
/// The hashing policy behind the stored digest is out of scope here; the
/// core only requires that lookup plus comparison leak no timing signal
/// about the material.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn resolve(&self, material: &str) -> Result<Option<ApiKeyRecord>, KeyStoreError>;
}

/// Constant-time byte equality: the scan never exits early, so comparison
/// time is independent of where the first mismatch sits.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

pub fn digest_key(material: &str) -> Vec<u8> {
    Sha256::digest(material.as_bytes()).to_vec()
}

pub struct PgKeyStore {
    pool: PgPool,
}

impl PgKeyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct KeyRow {
    key_id: String,
    key_digest: Vec<u8>,
    owner_id: String,
    quota: i32,
    secret: String,
}

#[async_trait]
impl KeyStore for PgKeyStore {
    async fn resolve(&self, material: &str) -> Result<Option<ApiKeyRecord>, KeyStoreError> {
        let digest = digest_key(material);

        let row: Option<KeyRow> = sqlx::query_as(
            "SELECT key_id, key_digest, owner_id, quota, secret FROM conveyor_api_keys WHERE key_digest = $1",
        )
        .bind(&digest)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| KeyStoreError::Unavailable(e.to_string()))?;

        Ok(row.and_then(|row| {
            // The index lookup already matched; re-check in constant time so
            // the comparison itself carries no timing signal.
            if constant_time_eq(&digest, &row.key_digest) {
                Some(ApiKeyRecord {
                    key_id: row.key_id,
                    owner_id: row.owner_id,
                    quota: row.quota,
                    secret: row.secret,
                })
            } else {
                None
            }
        }))
    }
}

/// Pull api-key material out of `X-API-Key` or `Authorization: Bearer ...`.
pub fn extract_key_material(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-api-key") {
        if let Ok(material) = value.to_str() {
            if !material.is_empty() {
                return Some(material.to_owned());
            }
        }
    }

    let auth = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let material = auth.strip_prefix("Bearer ")?;
    if material.is_empty() {
        None
    } else {
        Some(material.to_owned())
    }
}

/// In-memory key store for tests.
#[cfg(test)]
#[derive(Default, Clone)]
pub struct MockKeyStore {
    keys: std::collections::HashMap<String, ApiKeyRecord>,
}

#[cfg(test)]
impl MockKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, material: &str, record: ApiKeyRecord) -> Self {
        self.keys.insert(material.to_owned(), record);
        self
    }
}

#[cfg(test)]
#[async_trait]
impl KeyStore for MockKeyStore {
    async fn resolve(&self, material: &str) -> Result<Option<ApiKeyRecord>, KeyStoreError> {
        Ok(self.keys.get(material).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    #[test]
    fn constant_time_eq_behaves_like_eq() {
        assert!(constant_time_eq(b"same-bytes", b"same-bytes"));
        assert!(!constant_time_eq(b"same-bytes", b"Same-bytes"));
        assert!(!constant_time_eq(b"short", b"longer-bytes"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn extracts_x_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "ck_live_abc".parse().unwrap());
        assert_eq!(extract_key_material(&headers).as_deref(), Some("ck_live_abc"));
    }

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer ck_live_abc".parse().unwrap());
        assert_eq!(extract_key_material(&headers).as_deref(), Some("ck_live_abc"));
    }

    #[test]
    fn x_api_key_wins_over_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "first".parse().unwrap());
        headers.insert(AUTHORIZATION, "Bearer second".parse().unwrap());
        assert_eq!(extract_key_material(&headers).as_deref(), Some("first"));
    }

    #[test]
    fn missing_or_malformed_headers_yield_none() {
        let headers = HeaderMap::new();
        assert_eq!(extract_key_material(&headers), None);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Basic dXNlcjpwYXNz".parse().unwrap());
        assert_eq!(extract_key_material(&headers), None);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer ".parse().unwrap());
        assert_eq!(extract_key_material(&headers), None);
    }
}
