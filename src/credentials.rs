//! Database credential resolution.
//!
//! Credentials come from an external secret store, never from the settings
//! file. Two sources are provided:
//!
//! - **[`SecretsManagerSource`]** — fetches the secret from AWS Secrets
//!   Manager over its JSON 1.1 HTTP API, signed with AWS Signature V4.
//!   Pure-Rust signing (`hmac` + `sha2`), no AWS SDK. Supports a custom
//!   endpoint for S3-compatible local stacks (LocalStack).
//! - **[`StaticSource`]** — reads `DB_USERNAME` / `DB_PASSWORD` from the
//!   environment, for local runs and tests.
//!
//! The secret string must decode to a JSON object with exactly the fields
//! `username` and `password`; host, port, and database name are supplied
//! separately in the settings file, never embedded in the secret.
//!
//! # Environment Variables
//!
//! The secrets-manager source signs requests with:
//! - `AWS_ACCESS_KEY_ID` — required
//! - `AWS_SECRET_ACCESS_KEY` — required
//! - `AWS_SESSION_TOKEN` — optional (temporary credentials / IAM roles)

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::CredentialSettings;
use crate::error::CredentialError;

type HmacSha256 = Hmac<Sha256>;

/// Username/password pair used to open the database connection.
#[derive(Debug, Clone)]
pub struct DbCredentials {
    pub username: String,
    pub password: String,
}

/// A source of database credentials. Resolved once per invocation.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn resolve(&self) -> Result<DbCredentials, CredentialError>;
}

/// Build the credential source configured in settings.
///
/// The provider name was already validated at settings load time.
pub fn from_settings(settings: &CredentialSettings) -> Box<dyn CredentialSource> {
    match settings.provider.as_str() {
        "secrets-manager" => Box::new(SecretsManagerSource {
            secret_id: settings.secret_id.clone().unwrap_or_default(),
            region: settings.region.clone().unwrap_or_default(),
            endpoint_url: settings.endpoint_url.clone(),
        }),
        _ => Box::new(StaticSource),
    }
}

// ============ Static Provider ============

/// Credentials from `DB_USERNAME` / `DB_PASSWORD` environment variables.
pub struct StaticSource;

#[async_trait]
impl CredentialSource for StaticSource {
    async fn resolve(&self) -> Result<DbCredentials, CredentialError> {
        let username =
            std::env::var("DB_USERNAME").map_err(|_| CredentialError::MissingEnv("DB_USERNAME"))?;
        let password =
            std::env::var("DB_PASSWORD").map_err(|_| CredentialError::MissingEnv("DB_PASSWORD"))?;
        Ok(DbCredentials { username, password })
    }
}

// ============ AWS Secrets Manager Provider ============

/// AWS signing credentials loaded from environment variables.
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self, CredentialError> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| CredentialError::MissingEnv("AWS_ACCESS_KEY_ID"))?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| CredentialError::MissingEnv("AWS_SECRET_ACCESS_KEY"))?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

/// Fetches the database secret from AWS Secrets Manager.
pub struct SecretsManagerSource {
    /// Secret name or full ARN passed as `SecretId`.
    pub secret_id: String,
    pub region: String,
    /// Custom endpoint (LocalStack etc.); standard regional endpoint otherwise.
    pub endpoint_url: Option<String>,
}

#[async_trait]
impl CredentialSource for SecretsManagerSource {
    async fn resolve(&self) -> Result<DbCredentials, CredentialError> {
        let creds = AwsCredentials::from_env()?;
        let host = self.host();
        let url = format!("https://{}/", host);

        let body = serde_json::json!({ "SecretId": self.secret_id }).to_string();
        let payload_hash = hex_sha256(body.as_bytes());

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers = vec![
            (
                "content-type".to_string(),
                "application/x-amz-json-1.1".to_string(),
            ),
            ("host".to_string(), host.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
            (
                "x-amz-target".to_string(),
                "secretsmanager.GetSecretValue".to_string(),
            ),
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
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "POST\n/\n\n{}\n{}\n{}",
            canonical_headers, signed_headers, payload_hash
        );

        let credential_scope = format!(
            "{}/{}/secretsmanager/aws4_request",
            date_stamp, self.region
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &creds.secret_access_key,
            &date_stamp,
            &self.region,
            "secretsmanager",
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key_id, credential_scope, signed_headers, signature
        );

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        let mut req_builder = client
            .post(&url)
            .header("Authorization", &authorization)
            .header("Content-Type", "application/x-amz-json-1.1")
            .header("X-Amz-Date", &amz_date)
            .header("X-Amz-Target", "secretsmanager.GetSecretValue")
            .body(body);

        if let Some(ref token) = creds.session_token {
            req_builder = req_builder.header("X-Amz-Security-Token", token);
        }

        let resp = req_builder.send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(CredentialError::Fetch(format!(
                "GetSecretValue failed (HTTP {}): {}",
                status,
                body.chars().take(500).collect::<String>()
            )));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CredentialError::Fetch(format!("invalid response body: {}", e)))?;

        let secret_string = json
            .get("SecretString")
            .and_then(|s| s.as_str())
            .ok_or_else(|| CredentialError::Malformed("missing SecretString".to_string()))?;

        parse_secret(secret_string)
    }
}

impl SecretsManagerSource {
    fn host(&self) -> String {
        if let Some(ref endpoint) = self.endpoint_url {
            endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string()
        } else {
            format!("secretsmanager.{}.amazonaws.com", self.region)
        }
    }
}

/// Decode the secret string into credentials.
///
/// The secret must be a JSON object with string `username` and `password`
/// fields; extra fields are ignored.
fn parse_secret(secret: &str) -> Result<DbCredentials, CredentialError> {
    let json: serde_json::Value = serde_json::from_str(secret)
        .map_err(|e| CredentialError::Malformed(format!("secret is not JSON: {}", e)))?;

    let username = json
        .get("username")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CredentialError::Malformed("missing 'username'".to_string()))?;
    let password = json
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CredentialError::Malformed("missing 'password'".to_string()))?;

    Ok(DbCredentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

// ============ AWS SigV4 Helpers ============

/// Compute the hex-encoded SHA-256 hash of data.
fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute HMAC-SHA256 of data with the given key.
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Compute hex-encoded HMAC-SHA256.
fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
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
