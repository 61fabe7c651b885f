// Azure AD authentication configured through AZURE_* variables
//
// Variables come from the config's `env` map first and the process
// environment second. The process environment is only read, never written.

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::azure::{
    self, Authorizer, ClientCertificateAuthorizer, ClientSecretAuthorizer,
    UsernamePasswordAuthorizer,
};
use super::credentials;
use super::types::{cache_key, jwt_expiry, AuthScheme, AuthToken};
use super::{AuthContext, CredentialStrategy, StrategyKind};
use crate::error::{AuthError, Result};
use crate::secret::SecretCrypter;

pub const AZURE_TENANT_ID: &str = "AZURE_TENANT_ID";
pub const AZURE_CLIENT_ID: &str = "AZURE_CLIENT_ID";
pub const AZURE_CLIENT_SECRET: &str = "AZURE_CLIENT_SECRET";
pub const AZURE_CERTIFICATE_PATH: &str = "AZURE_CERTIFICATE_PATH";
pub const AZURE_CERTIFICATE_PASSWORD: &str = "AZURE_CERTIFICATE_PASSWORD";
pub const AZURE_USERNAME: &str = "AZURE_USERNAME";
pub const AZURE_PASSWORD: &str = "AZURE_PASSWORD";
pub const AZURE_AUTHORITY_HOST: &str = "AZURE_AUTHORITY_HOST";

const PATH_KEYS: [&str; 2] = [AZURE_CERTIFICATE_PATH, "AZURE_AUTH_LOCATION"];

fn is_secret_key(key: &str) -> bool {
    let key = key.to_lowercase();
    key.contains("_password") || key.contains("_secret")
}

/// Azure environment strategy config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AzureEnvConfig {
    pub site_url: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

pub struct AzureEnvStrategy {
    ctx: AuthContext,
    config: AzureEnvConfig,
    crypter: SecretCrypter,
    config_dir: Option<PathBuf>,
    authorizer: OnceCell<Box<dyn Authorizer>>,
}

impl AzureEnvStrategy {
    pub fn new(ctx: AuthContext) -> Self {
        Self {
            ctx,
            config: AzureEnvConfig::default(),
            crypter: SecretCrypter::new(None),
            config_dir: None,
            authorizer: OnceCell::new(),
        }
    }

    pub fn with_config(ctx: AuthContext, config: AzureEnvConfig) -> Self {
        let mut strategy = Self::new(ctx);
        strategy.config = config;
        strategy
    }

    pub fn config(&self) -> &AzureEnvConfig {
        &self.config
    }

    /// Variable from the config, falling back to the process environment
    fn var(&self, key: &str) -> Option<String> {
        self.config
            .env
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
            .filter(|v| !v.is_empty())
    }

    /// Pick an authorizer from the available variables: client secret,
    /// then certificate, then username and password.
    fn build_authorizer(&self, resource: &str) -> Result<Box<dyn Authorizer>> {
        let tenant_id = self
            .var(AZURE_TENANT_ID)
            .ok_or_else(|| AuthError::Validation(format!("{} is required", AZURE_TENANT_ID)))?;
        let client_id = self
            .var(AZURE_CLIENT_ID)
            .ok_or_else(|| AuthError::Validation(format!("{} is required", AZURE_CLIENT_ID)))?;
        let authority = self.var(AZURE_AUTHORITY_HOST);
        let token_url = azure::token_url(authority.as_deref(), &tenant_id);
        let client = self.ctx.client().clone();

        if let Some(secret) = self.var(AZURE_CLIENT_SECRET) {
            tracing::debug!("Using client secret credentials");
            return Ok(Box::new(ClientSecretAuthorizer::new(
                client, token_url, client_id, secret, resource,
            )));
        }

        if let Some(path) = self.var(AZURE_CERTIFICATE_PATH) {
            tracing::debug!("Using client certificate credentials");
            let path = credentials::resolve_relative(self.config_dir.as_deref(), &path);
            let password = self.var(AZURE_CERTIFICATE_PASSWORD);
            return Ok(Box::new(ClientCertificateAuthorizer::from_file(
                client,
                token_url,
                client_id,
                &path,
                password.as_deref(),
                resource,
            )?));
        }

        if let (Some(username), Some(password)) = (self.var(AZURE_USERNAME), self.var(AZURE_PASSWORD)) {
            tracing::debug!("Using username/password credentials");
            return Ok(Box::new(UsernamePasswordAuthorizer::new(
                client, token_url, client_id, username, password, resource,
            )));
        }

        Err(AuthError::Validation(format!(
            "No Azure credentials: set {}, {} or {}/{}",
            AZURE_CLIENT_SECRET, AZURE_CERTIFICATE_PATH, AZURE_USERNAME, AZURE_PASSWORD
        )))
    }

    fn authorizer(&self, resource: &str) -> Result<&dyn Authorizer> {
        self.authorizer
            .get_or_try_init(|| self.build_authorizer(resource))
            .map(|a| a.as_ref())
    }
}

#[async_trait]
impl CredentialStrategy for AzureEnvStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::AzureEnv
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

    fn set_config_path(&mut self, path: &Path) {
        self.config_dir = Some(credentials::config_dir(path));
    }

    fn parse_config(&mut self, bytes: &[u8]) -> Result<()> {
        let mut config: AzureEnvConfig = serde_json::from_slice(bytes)?;
        let crypter = &self.crypter;
        for (key, value) in config.env.iter_mut() {
            if is_secret_key(key) {
                *value = credentials::decode_secret(crypter, value);
            }
        }
        self.config = config;
        self.authorizer = OnceCell::new();
        Ok(())
    }

    fn write_config(&self, path: &Path) -> Result<()> {
        let mut config = self.config.clone();
        let crypter = &self.crypter;
        for (key, value) in config.env.iter_mut() {
            if is_secret_key(key) {
                *value = credentials::encode_secret(crypter, value)?;
            }
        }
        credentials::write_config_file(path, self.kind(), &config)
    }

    fn cache_key(&self) -> Result<String> {
        let site = credentials::parse_site_url(&self.config.site_url)?;
        let tenant = self.var(AZURE_TENANT_ID).unwrap_or_default();
        let client = self.var(AZURE_CLIENT_ID).unwrap_or_default();
        Ok(cache_key(
            &credentials::host_key(&site),
            self.strategy(),
            &[&tenant, &client],
        ))
    }

    fn scheme(&self) -> AuthScheme {
        AuthScheme::Bearer
    }

    async fn get_auth(&self) -> Result<AuthToken> {
        let site = credentials::parse_site_url(&self.config.site_url)?;
        let authorizer = self.authorizer(&credentials::origin(&site))?;
        let key = self.cache_key()?;

        self.ctx
            .cached(&key, || async {
                let token = azure::capture_token(authorizer, &self.config.site_url).await?;
                let expires_at = jwt_expiry(&token)?;
                Ok(AuthToken::new(token, expires_at))
            })
            .await
    }
}
