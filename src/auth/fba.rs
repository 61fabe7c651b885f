// Forms-based authentication through the SharePoint authentication web service

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::credentials;
use super::types::{cache_key, first_set_cookie, AuthScheme, AuthToken};
use super::{AuthContext, CredentialStrategy, StrategyKind};
use crate::error::{AuthError, Result};
use crate::secret::SecretCrypter;
use crate::templates;

/// FBA strategy config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FbaConfig {
    pub site_url: String,
    pub username: String,
    pub password: String,
}

pub struct FbaStrategy {
    ctx: AuthContext,
    config: FbaConfig,
    crypter: SecretCrypter,
}

impl FbaStrategy {
    pub fn new(ctx: AuthContext) -> Self {
        Self {
            ctx,
            config: FbaConfig::default(),
            crypter: SecretCrypter::new(None),
        }
    }

    pub fn with_config(ctx: AuthContext, config: FbaConfig) -> Self {
        let mut strategy = Self::new(ctx);
        strategy.config = config;
        strategy
    }

    pub fn config(&self) -> &FbaConfig {
        &self.config
    }

    async fn login(&self, endpoint: &str) -> Result<AuthToken> {
        tracing::debug!("FBA login at {}", endpoint);

        let response = self
            .ctx
            .no_redirect()
            .post(endpoint)
            .header(CONTENT_TYPE, "text/xml;charset=utf-8")
            .body(templates::fba::login(&self.config.username, &self.config.password))
            .send()
            .await?;

        let status = response.status();
        let cookie = first_set_cookie(response.headers());
        let body = response.text().await?;

        if let Some(fault) = templates::soap_fault(&body).ok().flatten() {
            return Err(AuthError::Protocol(fault));
        }
        if !status.is_success() {
            return Err(AuthError::http(status.as_u16(), &body));
        }

        let result = templates::fba::parse_response(&body)?;
        let cookie = cookie.ok_or_else(|| {
            AuthError::Protocol(format!("No {} cookie in FBA response", result.cookie_name))
        })?;

        Ok(AuthToken::new(
            cookie,
            Utc::now() + Duration::seconds(result.timeout_seconds),
        ))
    }
}

#[async_trait]
impl CredentialStrategy for FbaStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Fba
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
        let mut config: FbaConfig = serde_json::from_slice(bytes)?;
        config.password = credentials::decode_secret(&self.crypter, &config.password);
        self.config = config;
        Ok(())
    }

    fn write_config(&self, path: &Path) -> Result<()> {
        let mut config = self.config.clone();
        config.password = credentials::encode_secret(&self.crypter, &config.password)?;
        credentials::write_config_file(path, self.kind(), &config)
    }

    fn cache_key(&self) -> Result<String> {
        let site = credentials::parse_site_url(&self.config.site_url)?;
        Ok(cache_key(
            &credentials::host_key(&site),
            self.strategy(),
            &[&self.config.username, &self.config.password],
        ))
    }

    fn scheme(&self) -> AuthScheme {
        AuthScheme::Cookie
    }

    async fn get_auth(&self) -> Result<AuthToken> {
        let site = credentials::parse_site_url(&self.config.site_url)?;
        credentials::require("username", &self.config.username)?;
        credentials::require("password", &self.config.password)?;

        let endpoint = format!("{}/_vti_bin/authentication.asmx", credentials::origin(&site));
        let key = self.cache_key()?;
        self.ctx.cached(&key, || self.login(&endpoint)).await
    }
}
