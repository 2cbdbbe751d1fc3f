//! Credential resolution for agent identities and sub-agent tokens.
//!
//! Configuration references secrets by name only; the selected provider
//! resolves names to values at startup (and on sub-agent creation).
//! Resolved values never appear in logs.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

/// A resolved secret value. `Debug` redacts the contents.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the underlying value. Callers must not log it.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

/// Errors from credential resolution.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("vault error: {0}")]
    Vault(String),
}

/// Pluggable resolver of secret values.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Secret, SecretError>;
}

/// Resolves secrets from the process environment.
pub struct EnvProvider;

#[async_trait]
impl CredentialProvider for EnvProvider {
    async fn resolve(&self, name: &str) -> Result<Secret, SecretError> {
        std::env::var(name)
            .map(Secret::new)
            .map_err(|_| SecretError::NotFound(name.to_string()))
    }
}

/// On-disk secret file format.
#[derive(Debug, Serialize, Deserialize)]
struct SecretFile {
    version: u32,
    secrets: HashMap<String, String>,
}

/// Resolves secrets from a local JSON file with restricted permissions.
///
/// The file is re-read on every resolve so rotations are picked up
/// without a restart.
pub struct FileProvider {
    path: PathBuf,
}

impl FileProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Write a secret file with 0600 permissions, atomically.
    ///
    /// Operator tooling; the bridge itself only reads.
    pub async fn write_file(
        path: &std::path::Path,
        secrets: &HashMap<String, String>,
    ) -> Result<(), SecretError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(&SecretFile {
            version: 1,
            secrets: secrets.clone(),
        })?;

        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &content).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&temp_path).await?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&temp_path, perms).await?;
        }

        fs::rename(&temp_path, path).await?;
        Ok(())
    }
}

#[async_trait]
impl CredentialProvider for FileProvider {
    async fn resolve(&self, name: &str) -> Result<Secret, SecretError> {
        let content = fs::read_to_string(&self.path).await?;
        let file: SecretFile = serde_json::from_str(&content)?;
        file.secrets
            .get(name)
            .map(Secret::new)
            .ok_or_else(|| SecretError::NotFound(name.to_string()))
    }
}

/// Resolves secrets from a Vault-style KV store over HTTP.
pub struct VaultProvider {
    http: reqwest::Client,
    base_url: String,
    mount: String,
    token: Secret,
}

#[derive(Deserialize)]
struct VaultResponse {
    data: VaultData,
}

#[derive(Deserialize)]
struct VaultData {
    data: HashMap<String, String>,
}

impl VaultProvider {
    pub fn new(
        base_url: impl Into<String>,
        mount: impl Into<String>,
        token: Secret,
    ) -> Result<Self, SecretError> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| SecretError::Vault(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            mount: mount.into(),
            token,
        })
    }
}

#[async_trait]
impl CredentialProvider for VaultProvider {
    async fn resolve(&self, name: &str) -> Result<Secret, SecretError> {
        let url = format!("{}/v1/{}/data/{}", self.base_url, self.mount, name);

        let response = self
            .http
            .get(&url)
            .header("X-Vault-Token", self.token.expose())
            .send()
            .await
            .map_err(|e| SecretError::Vault(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SecretError::NotFound(name.to_string()));
        }
        if !response.status().is_success() {
            return Err(SecretError::Vault(format!(
                "read failed ({})",
                response.status()
            )));
        }

        let body: VaultResponse = response
            .json()
            .await
            .map_err(|e| SecretError::Vault(e.to_string()))?;

        body.data
            .data
            .get("value")
            .map(Secret::new)
            .ok_or_else(|| SecretError::NotFound(name.to_string()))
    }
}
