//! Credential resolution
//!
//! Either an explicit storage URL + token pair, or Keystone v2 password
//! auth driven by the `OS_*` environment variables.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SloError};

pub const ENV_AUTH_URL: &str = "OS_AUTH_URL";
pub const ENV_USERNAME: &str = "OS_USERNAME";
pub const ENV_PASSWORD: &str = "OS_PASSWORD";
pub const ENV_TENANT_NAME: &str = "OS_TENANT_NAME";

/// Endpoint and token used for every storage request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub storage_url: String,
    pub auth_token: String,
}

/// Password credentials for the Keystone v2 token endpoint
#[derive(Debug, Clone)]
pub struct KeystoneCredentials {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub tenant_name: String,
}

impl KeystoneCredentials {
    /// Read credentials through `lookup`, reporting every missing variable
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).filter(|v| !v.is_empty());
        let auth_url = read(ENV_AUTH_URL);
        let username = read(ENV_USERNAME);
        let password = read(ENV_PASSWORD);
        let tenant_name = read(ENV_TENANT_NAME);

        match (auth_url, username, password, tenant_name) {
            (Some(auth_url), Some(username), Some(password), Some(tenant_name)) => Ok(Self {
                auth_url,
                username,
                password,
                tenant_name,
            }),
            (auth_url, username, password, tenant_name) => {
                let missing: Vec<String> = [
                    (ENV_AUTH_URL, auth_url.is_none()),
                    (ENV_USERNAME, username.is_none()),
                    (ENV_PASSWORD, password.is_none()),
                    (ENV_TENANT_NAME, tenant_name.is_none()),
                ]
                .into_iter()
                .filter(|(_, absent)| *absent)
                .map(|(name, _)| format!("${}", name))
                .collect();
                Err(SloError::MissingCredentials {
                    missing: missing.join(", "),
                })
            }
        }
    }

    /// Exchange the password for a token and the object-store endpoint
    pub async fn authenticate(&self, client: &Client) -> Result<Credentials> {
        let url = format!("{}/tokens", self.auth_url.trim_end_matches('/'));
        let request = TokenRequest {
            auth: TokenRequestAuth {
                tenant_name: &self.tenant_name,
                password_credentials: PasswordCredentials {
                    username: &self.username,
                    password: &self.password,
                },
            },
        };

        debug!("Requesting token from {}", url);
        let resp = client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| SloError::AuthFailed {
                reason: format!("token request to {} failed: {}", url, e),
            })?;

        if !resp.status().is_success() {
            return Err(SloError::AuthFailed {
                reason: format!("token request to {} failed: status {}", url, resp.status()),
            });
        }

        let body: TokenResponse = resp.json().await.map_err(|e| SloError::AuthFailed {
            reason: format!("unreadable token response: {}", e),
        })?;

        let storage_url = body
            .access
            .service_catalog
            .into_iter()
            .find(|service| service.kind == "object-store")
            .and_then(|service| service.endpoints.into_iter().next())
            .map(|endpoint| endpoint.public_url)
            .ok_or_else(|| SloError::AuthFailed {
                reason: "service catalog has no object-store endpoint".into(),
            })?;

        info!("Authenticated {} against {}", self.username, self.auth_url);
        Ok(Credentials {
            storage_url,
            auth_token: body.access.token.id,
        })
    }
}

/// Resolve credentials from explicit values, falling back to the environment
///
/// Both explicit values must be given together; when neither is given the
/// Keystone variables are read through `lookup`.
pub async fn resolve<F>(
    storage_url: Option<String>,
    auth_token: Option<String>,
    lookup: F,
    client: &Client,
) -> Result<Credentials>
where
    F: Fn(&str) -> Option<String>,
{
    match (storage_url, auth_token) {
        (Some(storage_url), Some(auth_token)) => Ok(Credentials {
            storage_url,
            auth_token,
        }),
        (Some(_), None) => Err(SloError::MissingCredentials {
            missing: "--auth-token".into(),
        }),
        (None, Some(_)) => Err(SloError::MissingCredentials {
            missing: "--storage-url".into(),
        }),
        (None, None) => KeystoneCredentials::from_lookup(lookup)?.authenticate(client).await,
    }
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    auth: TokenRequestAuth<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequestAuth<'a> {
    tenant_name: &'a str,
    password_credentials: PasswordCredentials<'a>,
}

#[derive(Serialize)]
struct PasswordCredentials<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access: Access,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Access {
    token: Token,
    #[serde(default)]
    service_catalog: Vec<CatalogEntry>,
}

#[derive(Deserialize)]
struct Token {
    id: String,
}

#[derive(Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

#[derive(Deserialize)]
struct Endpoint {
    #[serde(rename = "publicURL")]
    public_url: String,
}
