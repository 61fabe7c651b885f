// SharePoint add-in only authentication (ACS client credentials)

use async_trait::async_trait;
use chrono::Duration;
use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::credentials;
use super::refresh;
use super::types::{cache_key, AuthScheme, AuthToken};
use super::{AuthContext, CredentialStrategy, StrategyKind};
use crate::error::{AuthError, Result};
use crate::secret::SecretCrypter;

/// SharePoint service principal id
const SHAREPOINT_PRINCIPAL: &str = "00000003-0000-0ff1-ce00-000000000000";
const DEFAULT_ACS_URL: &str = "https://accounts.accesscontrol.windows.net";

/// How long discovered realms and token endpoints are reused
const DISCOVERY_TTL_MINUTES: i64 = 60;

/// Add-in only strategy config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AddinConfig {
    pub site_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Tenant id; discovered from the site when empty
    #[serde(skip_serializing_if = "String::is_empty")]
    pub realm: String,
    /// Access control service base URL
    #[serde(skip_serializing_if = "String::is_empty")]
    pub acs_url: String,
}

#[derive(Debug, Deserialize)]
struct AcsMetadata {
    #[serde(default)]
    endpoints: Vec<AcsEndpoint>,
}

#[derive(Debug, Deserialize)]
struct AcsEndpoint {
    #[serde(default)]
    protocol: String,
    #[serde(default)]
    location: String,
}

/// Realm announced by a `WWW-Authenticate: Bearer realm="...",client_id="..."` challenge
pub fn parse_bearer_realm(header: &str) -> Option<String> {
    let rest = header.trim().strip_prefix("Bearer")?;
    rest.split(',')
        .filter_map(|part| part.trim().split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("realm"))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|realm| !realm.is_empty())
}

pub struct AddinStrategy {
    ctx: AuthContext,
    config: AddinConfig,
    crypter: SecretCrypter,
}

impl AddinStrategy {
    pub fn new(ctx: AuthContext) -> Self {
        Self {
            ctx,
            config: AddinConfig::default(),
            crypter: SecretCrypter::new(None),
        }
    }

    pub fn with_config(ctx: AuthContext, config: AddinConfig) -> Self {
        let mut strategy = Self::new(ctx);
        strategy.config = config;
        strategy
    }

    pub fn config(&self) -> &AddinConfig {
        &self.config
    }

    fn acs_url(&self) -> &str {
        if self.config.acs_url.is_empty() {
            DEFAULT_ACS_URL
        } else {
            self.config.acs_url.trim_end_matches('/')
        }
    }

    async fn realm(&self, host: &str) -> Result<String> {
        if !self.config.realm.is_empty() {
            return Ok(self.config.realm.clone());
        }

        let key = format!("{}@realm", host);
        if let Some(realm) = self.ctx.cache().get(&key) {
            return Ok(realm);
        }

        let endpoint = format!("{}/_vti_bin/client.svc", self.config.site_url.trim_end_matches('/'));
        let response = self
            .ctx
            .client()
            .post(&endpoint)
            .header(AUTHORIZATION, "Bearer ")
            .send()
            .await?;

        let realm = response
            .headers()
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(parse_bearer_realm)
            .ok_or_else(|| {
                AuthError::Protocol(format!("Unable to discover realm from {}", endpoint))
            })?;

        tracing::debug!("Discovered realm {} for {}", realm, host);
        self.ctx
            .cache()
            .set(&key, realm.clone(), Duration::minutes(DISCOVERY_TTL_MINUTES));
        Ok(realm)
    }

    async fn token_endpoint(&self, realm: &str) -> Result<String> {
        let metadata_url = format!("{}/metadata/json/1?realm={}", self.acs_url(), realm);
        if let Some(url) = self.ctx.cache().get(&metadata_url) {
            return Ok(url);
        }

        let response = self.ctx.client().get(&metadata_url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AuthError::http(status.as_u16(), &body));
        }

        let metadata: AcsMetadata = serde_json::from_str(&body)
            .map_err(|e| AuthError::Protocol(format!("Invalid ACS metadata: {}", e)))?;
        let location = metadata
            .endpoints
            .into_iter()
            .find(|e| e.protocol == "OAuth2")
            .map(|e| e.location)
            .ok_or_else(|| AuthError::Protocol("No OAuth2 protocol location found".to_string()))?;

        self.ctx.cache().set(
            &metadata_url,
            location.clone(),
            Duration::minutes(DISCOVERY_TTL_MINUTES),
        );
        Ok(location)
    }

    async fn fetch(&self, host: &str) -> Result<AuthToken> {
        let realm = self.realm(host).await?;
        let token_url = self.token_endpoint(&realm).await?;

        let client_id = format!("{}@{}", self.config.client_id, realm);
        let resource = format!("{}/{}@{}", SHAREPOINT_PRINCIPAL, host, realm);
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("resource", resource.as_str()),
        ];

        let data = refresh::token_request(self.ctx.client(), &token_url, &form).await?;
        let expires_at = refresh::expires_at(&data);
        Ok(AuthToken::new(data.access_token, expires_at))
    }
}

#[async_trait]
impl CredentialStrategy for AddinStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Addin
    }

    fn site_url(&self) -> &str {
        &self.config.site_url
    }

    fn context(&self) -> &AuthContext {
        &self.ctx
    }

    fn set_master_key(&mut self, key: &str) {
        self.crypter = SecretCrypter::new(Some(key));
    }

    fn parse_config(&mut self, bytes: &[u8]) -> Result<()> {
        let mut config: AddinConfig = serde_json::from_slice(bytes)?;
        config.client_secret = credentials::decode_secret(&self.crypter, &config.client_secret);
        self.config = config;
        Ok(())
    }

    fn write_config(&self, path: &Path) -> Result<()> {
        let mut config = self.config.clone();
        config.client_secret = credentials::encode_secret(&self.crypter, &config.client_secret)?;
        credentials::write_config_file(path, self.kind(), &config)
    }

    fn cache_key(&self) -> Result<String> {
        let site = credentials::parse_site_url(&self.config.site_url)?;
        Ok(cache_key(
            &credentials::host_key(&site),
            self.strategy(),
            &[&self.config.client_id, &self.config.client_secret],
        ))
    }

    fn scheme(&self) -> AuthScheme {
        AuthScheme::Bearer
    }

    async fn get_auth(&self) -> Result<AuthToken> {
        let site = credentials::parse_site_url(&self.config.site_url)?;
        credentials::require("clientId", &self.config.client_id)?;
        credentials::require("clientSecret", &self.config.client_secret)?;

        let host = credentials::host_key(&site);
        let key = self.cache_key()?;
        self.ctx.cached(&key, || self.fetch(&host)).await
    }
}
