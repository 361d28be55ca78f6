//! The bucket that parks relay fallback bundles
//!
//! A bundle is written once by the sender and fetched once by the receiver,
//! both inside a transfer deadline, so retries are few and short. Bundles
//! are ciphertext; a plaintext endpoint exposes the bucket credentials only.

use std::time::Duration;

use anyhow::{Context, Result};
use opendal::Operator;
use secrecy::{ExposeSecret, SecretString};

use ss_core::config::StorageConfig;

/// Longest pause between retries of one bundle request
const MAX_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Keys for the fallback bucket. `Debug` never shows the secret.
#[derive(Debug)]
pub struct BucketCredentials {
    pub access_key_id: String,
    pub secret_access_key: SecretString,
}

impl BucketCredentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: SecretString::from(secret_access_key.into()),
        }
    }

    /// `AWS_ACCESS_KEY_ID` and `AWS_SECRET_ACCESS_KEY`.
    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("fallback bucket credentials not set: export AWS_ACCESS_KEY_ID")?;
        let secret_access_key =
            std::env::var("AWS_SECRET_ACCESS_KEY").context("AWS_SECRET_ACCESS_KEY not set")?;
        Ok(Self::new(access_key_id, secret_access_key))
    }
}

/// Operator over the `[storage]` bucket.
///
/// With `enforce_tls`, a plain `http://` endpoint is an error; without it,
/// a warning.
pub fn fallback_operator(storage: &StorageConfig, credentials: &BucketCredentials) -> Result<Operator> {
    if storage.endpoint.starts_with("http://") {
        if storage.enforce_tls {
            anyhow::bail!(
                "fallback bucket endpoint {} is plaintext HTTP and enforce_tls is set",
                storage.endpoint
            );
        }
        tracing::warn!(
            endpoint = %storage.endpoint,
            "fallback bucket over plaintext HTTP exposes its credentials"
        );
    }

    // opendal addresses path-style by default, so self-hosted S3 works as is
    let builder = opendal::services::S3::default()
        .endpoint(&storage.endpoint)
        .region(&storage.region)
        .bucket(&storage.bucket)
        .access_key_id(&credentials.access_key_id)
        .secret_access_key(credentials.secret_access_key.expose_secret());

    Ok(Operator::new(builder)
        .with_context(|| format!("fallback bucket '{}'", storage.bucket))?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(2)
                .with_max_delay(MAX_RETRY_DELAY)
                .with_jitter(),
        )
        .finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(endpoint: &str, enforce_tls: bool) -> StorageConfig {
        StorageConfig {
            endpoint: endpoint.into(),
            bucket: "securesend".into(),
            enforce_tls,
            ..Default::default()
        }
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let credentials = BucketCredentials::new("AKIDEXAMPLE", "wJalrXUtnFEMI");
        let shown = format!("{credentials:?}");
        assert!(shown.contains("AKIDEXAMPLE"));
        assert!(!shown.contains("wJalrXUtnFEMI"));
    }

    #[test]
    fn test_plain_http_needs_tls_off() {
        let credentials = BucketCredentials::new("key", "secret");
        assert!(fallback_operator(&bucket("http://localhost:8333", false), &credentials).is_ok());
        let err = fallback_operator(&bucket("http://insecure:8333", true), &credentials).unwrap_err();
        assert!(err.to_string().contains("enforce_tls"));
        assert!(fallback_operator(&bucket("https://s3.example.com", true), &credentials).is_ok());
    }
}
