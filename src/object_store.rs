//! Object storage for binary assets.
//!
//! [`ObjectStore`] is the seam the asset worker uploads through. The
//! production implementation, [`S3ObjectStore`], issues a SigV4-signed
//! `PutObject` with `reqwest`, so any S3-compatible service (AWS, Tigris,
//! MinIO, LocalStack) works without an SDK.
//!
//! # Configuration
//!
//! ```toml
//! [storage]
//! provider = "s3"
//! bucket = "content"
//! region = "auto"
//! endpoint_url = "https://fly.storage.tigris.dev"   # optional
//! ```
//!
//! Credentials come from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and
//! optionally `AWS_SESSION_TOKEN`.
//!
//! Uploads are keyed by the asset's relative path and overwrite, so
//! re-uploading is harmless.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::StorageConfig;

type HmacSha256 = Hmac<Sha256>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<()>;
}

/// Accepts and discards every upload. Used when `storage.provider = "disabled"`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledObjectStore;

#[async_trait]
impl ObjectStore for DisabledObjectStore {
    async fn put(&self, path: &str, _bytes: &[u8], _content_type: &str) -> Result<()> {
        tracing::debug!(path, "storage disabled; skipping upload");
        Ok(())
    }
}

/// Build the object store named by `config.provider`.
pub fn create_object_store(config: &StorageConfig) -> Result<Box<dyn ObjectStore>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledObjectStore)),
        "s3" => Ok(Box::new(S3ObjectStore::from_env(config)?)),
        other => bail!("Unknown storage provider: {}", other),
    }
}

// ============ AWS Credentials ============

#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl AwsCredentials {
    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

// ============ S3 PutObject ============

pub struct S3ObjectStore {
    config: StorageConfig,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3ObjectStore {
    pub fn new(config: &StorageConfig, creds: AwsCredentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config: config.clone(),
            creds,
            client,
        })
    }

    pub fn from_env(config: &StorageConfig) -> Result<Self> {
        Self::new(config, AwsCredentials::from_env()?)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        let target = s3_target(&self.config, path);
        let payload_hash = hex_sha256(bytes);
        let signed = sign_put(
            &self.creds,
            &self.config.region,
            &target,
            content_type,
            &payload_hash,
            Utc::now(),
        );

        let mut req = self
            .client
            .put(&target.url)
            .header("Authorization", &signed.authorization)
            .header("Content-Type", content_type)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &signed.amz_date)
            .body(bytes.to_vec());
        if let Some(ref token) = self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }

        let resp = req.send().await.map_err(|e| {
            anyhow::anyhow!("Failed to put s3://{}/{}: {}", self.config.bucket, path, e)
        })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("S3 PutObject failed (HTTP {}) for key '{}': {}", status, path, body);
        }

        tracing::debug!(path, bytes = bytes.len(), "uploaded to object storage");
        Ok(())
    }
}

/// Where a `PutObject` request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Target {
    pub url: String,
    pub host: String,
    pub canonical_uri: String,
}

/// Virtual-hosted style on AWS; path style on a custom endpoint.
pub fn s3_target(config: &StorageConfig, key: &str) -> S3Target {
    let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
    match config.endpoint_url {
        Some(ref endpoint) => {
            let scheme = if endpoint.starts_with("http://") {
                "http"
            } else {
                "https"
            };
            let host = endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string();
            let canonical_uri = format!("/{}/{}", uri_encode(&config.bucket), encoded_key);
            S3Target {
                url: format!("{}://{}{}", scheme, host, canonical_uri),
                host,
                canonical_uri,
            }
        }
        None => {
            let host = format!("{}.s3.{}.amazonaws.com", config.bucket, config.region);
            let canonical_uri = format!("/{}", encoded_key);
            S3Target {
                url: format!("https://{}{}", host, canonical_uri),
                host,
                canonical_uri,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub authorization: String,
    pub amz_date: String,
}

/// Compute the SigV4 `Authorization` header for a `PutObject`.
pub fn sign_put(
    creds: &AwsCredentials,
    region: &str,
    target: &S3Target,
    content_type: &str,
    payload_hash: &str,
    now: DateTime<Utc>,
) -> SignedRequest {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

    let mut headers = vec![
        ("content-type".to_string(), content_type.to_string()),
        ("host".to_string(), target.host.clone()),
        ("x-amz-content-sha256".to_string(), payload_hash.to_string()),
        ("x-amz-date".to_string(), amz_date.clone()),
    ];
    if let Some(ref token) = creds.session_token {
        headers.push(("x-amz-security-token".to_string(), token.clone()));
    }
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let signed_headers: String = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();

    let canonical_request = format!(
        "PUT\n{}\n\n{}\n{}\n{}",
        target.canonical_uri, canonical_headers, signed_headers, payload_hash
    );

    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(&creds.secret_access_key, &date_stamp, region, "s3");
    let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

    SignedRequest {
        authorization: format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key_id, credential_scope, signed_headers, signature
        ),
        amz_date,
    }
}

// ============ AWS SigV4 Helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding of everything but `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn storage(endpoint: Option<&str>) -> StorageConfig {
        StorageConfig {
            provider: "s3".into(),
            bucket: "content".into(),
            region: "us-east-1".into(),
            endpoint_url: endpoint.map(str::to_string),
            timeout_secs: 20,
        }
    }

    fn creds() -> AwsCredentials {
        AwsCredentials {
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
            session_token: None,
        }
    }

    #[test]
    fn signing_key_matches_aws_reference() {
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn aws_target_is_virtual_hosted() {
        let t = s3_target(&storage(None), "assets/my file.png");
        assert_eq!(t.host, "content.s3.us-east-1.amazonaws.com");
        assert_eq!(t.canonical_uri, "/assets/my%20file.png");
        assert_eq!(
            t.url,
            "https://content.s3.us-east-1.amazonaws.com/assets/my%20file.png"
        );
    }

    #[test]
    fn custom_endpoint_is_path_style() {
        let t = s3_target(&storage(Some("http://localhost:9000/")), "assets/a.png");
        assert_eq!(t.host, "localhost:9000");
        assert_eq!(t.url, "http://localhost:9000/content/assets/a.png");
    }

    #[test]
    fn signature_is_deterministic_and_scoped() {
        let target = s3_target(&storage(None), "assets/a.png");
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let hash = hex_sha256(b"png bytes");
        let a = sign_put(&creds(), "us-east-1", &target, "image/png", &hash, now);
        let b = sign_put(&creds(), "us-east-1", &target, "image/png", &hash, now);

        assert_eq!(a.authorization, b.authorization);
        assert_eq!(a.amz_date, "20240501T120000Z");
        assert!(a
            .authorization
            .starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240501/us-east-1/s3/aws4_request"));
        assert!(a
            .authorization
            .contains("SignedHeaders=content-type;host;x-amz-content-sha256;x-amz-date"));

        let other = sign_put(&creds(), "us-east-1", &target, "image/jpeg", &hash, now);
        assert_ne!(a.authorization, other.authorization);
    }

    #[tokio::test]
    async fn disabled_store_accepts_everything() {
        assert!(DisabledObjectStore
            .put("assets/a.png", b"x", "image/png")
            .await
            .is_ok());
    }
}
