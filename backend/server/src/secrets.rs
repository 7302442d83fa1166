//! # Secrets
//!
//! Startup-time lookup of the store connection string.
//!
//! The vault location decides where the secret lives:
//! - `http(s)://` locations are Azure Key Vault instances, read through the REST API with a
//!   bearer token obtained from ambient credentials (environment client secret, App Service
//!   managed identity, or the instance metadata service).
//! - Anything else is a directory of secret files, `/run/secrets` by default, one file per
//!   secret as docker mounts them.
//!
//! Values are never cached and never logged, only their name and length.
use std::{env, fmt, io::ErrorKind, path::Path, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::SecretError;

const SECRETS_API_VERSION: &str = "7.4";
const VAULT_RESOURCE: &str = "https://vault.azure.net";
const VAULT_SCOPE: &str = "https://vault.azure.net/.default";
const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const EMULATOR_TOKEN: &str = "emulator";
const DEFAULT_TIMEOUT_SECS: u64 = 15;

pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(<{} bytes redacted>)", self.0.len())
    }
}

#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Fetch `name` from `vault`, failing if it is absent or empty.
    async fn resolve(&self, name: &str, vault: &str) -> Result<Secret, SecretError>;
}

pub fn resolver_for(vault: &str) -> Result<Box<dyn SecretResolver>, SecretError> {
    if is_http(vault) {
        let credential = Credential::from_vars(vault, |key| env::var(key).ok());
        info!("Reading secrets from key vault {vault} ({})", credential.kind());

        Ok(Box::new(KeyVaultResolver::new(credential)?))
    } else {
        info!("Reading secrets from directory {vault}");

        Ok(Box::new(FileSecretResolver))
    }
}

fn is_http(location: &str) -> bool {
    let lower = location.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn is_loopback(location: &str) -> bool {
    Url::parse(location).is_ok_and(|url| {
        matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"))
    })
}

fn validate_name(name: &str) -> Result<(), SecretError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(SecretError::NotFound {
            name: name.to_string(),
        })
    }
}

fn non_empty(name: &str, value: Option<String>) -> Result<Secret, SecretError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(Secret(v)),
        _ => Err(SecretError::Empty {
            name: name.to_string(),
        }),
    }
}

/// Secret files mounted into a directory, `/run/secrets/<name>`.
pub struct FileSecretResolver;

#[async_trait]
impl SecretResolver for FileSecretResolver {
    async fn resolve(&self, name: &str, vault: &str) -> Result<Secret, SecretError> {
        validate_name(name)?;

        let path = Path::new(vault).join(name);

        let value = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => SecretError::NotFound {
                    name: name.to_string(),
                },
                _ => SecretError::Vault(format!("{}: {e}", path.display())),
            })?;

        non_empty(name, Some(value))
    }
}

/// Ambient credentials for Key Vault, never embedded in config.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credential {
    Static(String),
    ClientSecret {
        authority_host: String,
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    AppService {
        endpoint: String,
        header: String,
    },
    Imds {
        client_id: Option<String>,
    },
}

impl Credential {
    pub fn from_vars<F>(vault: &str, var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| var(key).filter(|value| !value.trim().is_empty());

        if let Some(token) = var("AZURE_KEYVAULT_BEARER_TOKEN") {
            return Credential::Static(token);
        }

        if let (Some(tenant_id), Some(client_id), Some(client_secret)) = (
            var("AZURE_TENANT_ID"),
            var("AZURE_CLIENT_ID"),
            var("AZURE_CLIENT_SECRET"),
        ) {
            return Credential::ClientSecret {
                authority_host: var("AZURE_AUTHORITY_HOST")
                    .unwrap_or_else(|| DEFAULT_AUTHORITY_HOST.to_string()),
                tenant_id,
                client_id,
                client_secret,
            };
        }

        if let (Some(endpoint), Some(header)) = (var("IDENTITY_ENDPOINT"), var("IDENTITY_HEADER")) {
            return Credential::AppService { endpoint, header };
        }

        if is_loopback(vault) {
            return Credential::Static(EMULATOR_TOKEN.to_string());
        }

        Credential::Imds {
            client_id: var("AZURE_CLIENT_ID"),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Credential::Static(_) => "static token",
            Credential::ClientSecret { .. } => "client secret",
            Credential::AppService { .. } => "app service identity",
            Credential::Imds { .. } => "managed identity",
        }
    }

    async fn token(&self, client: &Client) -> Result<String, SecretError> {
        let request = match self {
            Credential::Static(token) => return Ok(token.clone()),
            Credential::ClientSecret {
                authority_host,
                tenant_id,
                client_id,
                client_secret,
            } => {
                let url = format!(
                    "{}/{tenant_id}/oauth2/v2.0/token",
                    authority_host.trim_end_matches('/')
                );
                client.post(url).form(&[
                    ("client_id", client_id.as_str()),
                    ("client_secret", client_secret.as_str()),
                    ("scope", VAULT_SCOPE),
                    ("grant_type", "client_credentials"),
                ])
            }
            Credential::AppService { endpoint, header } => client
                .get(endpoint)
                .header("X-IDENTITY-HEADER", header)
                .query(&[("api-version", "2019-08-01"), ("resource", VAULT_RESOURCE)]),
            Credential::Imds { client_id } => {
                let mut request = client
                    .get(IMDS_ENDPOINT)
                    .header("Metadata", "true")
                    .query(&[("api-version", "2018-02-01"), ("resource", VAULT_RESOURCE)]);
                if let Some(id) = client_id {
                    request = request.query(&[("client_id", id)]);
                }
                request
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| SecretError::Credential(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SecretError::Credential(format!(
                "token endpoint rejected the request: {status} {body}"
            )));
        }

        let payload: TokenResponse = response
            .json()
            .await
            .map_err(|e| SecretError::Credential(format!("invalid token response: {e}")))?;

        Ok(payload.access_token)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct SecretBundle {
    #[serde(default)]
    value: Option<String>,
}

pub struct KeyVaultResolver {
    client: Client,
    credential: Credential,
}

impl KeyVaultResolver {
    pub fn new(credential: Credential) -> Result<Self, SecretError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| SecretError::Vault(format!("failed to build http client: {e}")))?;

        Ok(Self { client, credential })
    }
}

#[async_trait]
impl SecretResolver for KeyVaultResolver {
    async fn resolve(&self, name: &str, vault: &str) -> Result<Secret, SecretError> {
        validate_name(name)?;

        let token = self.credential.token(&self.client).await?;

        let url = format!(
            "{}/secrets/{name}?api-version={SECRETS_API_VERSION}",
            vault.trim_end_matches('/')
        );
        debug!("Fetching secret {name} from {url}");

        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| SecretError::Vault(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(SecretError::NotFound {
                name: name.to_string(),
            }),
            status if status.is_success() => {
                let bundle: SecretBundle = response
                    .json()
                    .await
                    .map_err(|e| SecretError::Vault(format!("invalid secret bundle: {e}")))?;

                non_empty(name, bundle.value)
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(SecretError::Vault(format!("get secret failed: {status} {body}")))
            }
        }
    }
}
