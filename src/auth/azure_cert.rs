// Azure AD app-only authentication with a client certificate

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::azure::{self, Authorizer, ClientCertificateAuthorizer};
use super::credentials;
use super::types::{cache_key, jwt_expiry, AuthScheme, AuthToken};
use super::{AuthContext, CredentialStrategy, StrategyKind};
use crate::error::{AuthError, Result};
use crate::secret::SecretCrypter;

/// Azure certificate strategy config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AzureCertConfig {
    pub site_url: String,
    pub tenant_id: String,
    pub client_id: String,
    /// `.pfx`/`.p12` bundle or PEM file, relative to the config file or absolute
    pub cert_path: String,
    /// Password of the PKCS#12 bundle or of an encrypted PEM key
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cert_pass: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub authority_url: String,
}

pub struct AzureCertStrategy {
    ctx: AuthContext,
    config: AzureCertConfig,
    crypter: SecretCrypter,
    config_dir: Option<PathBuf>,
    authorizer: OnceCell<ClientCertificateAuthorizer>,
}

impl AzureCertStrategy {
    pub fn new(ctx: AuthContext) -> Self {
        Self {
            ctx,
            config: AzureCertConfig::default(),
            crypter: SecretCrypter::new(None),
            config_dir: None,
            authorizer: OnceCell::new(),
        }
    }

    pub fn with_config(ctx: AuthContext, config: AzureCertConfig) -> Self {
        let mut strategy = Self::new(ctx);
        strategy.config = config;
        strategy
    }

    pub fn config(&self) -> &AzureCertConfig {
        &self.config
    }

    /// Certificate location with relative paths anchored at the config file
    pub fn cert_path(&self) -> PathBuf {
        credentials::resolve_relative(self.config_dir.as_deref(), &self.config.cert_path)
    }

    fn authorizer(&self, resource: &str) -> Result<&ClientCertificateAuthorizer> {
        self.authorizer.get_or_try_init(|| {
            let authority = Some(self.config.authority_url.as_str());
            ClientCertificateAuthorizer::from_file(
                self.ctx.client().clone(),
                azure::token_url(authority, &self.config.tenant_id),
                self.config.client_id.clone(),
                &self.cert_path(),
                Some(self.config.cert_pass.as_str()).filter(|p| !p.is_empty()),
                resource,
            )
        })
    }
}

#[async_trait]
impl CredentialStrategy for AzureCertStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::AzureCert
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
        let mut config: AzureCertConfig = serde_json::from_slice(bytes)?;
        config.cert_pass = credentials::decode_secret(&self.crypter, &config.cert_pass);
        self.config = config;
        self.authorizer = OnceCell::new();
        Ok(())
    }

    fn write_config(&self, path: &Path) -> Result<()> {
        let mut config = self.config.clone();
        config.cert_pass = credentials::encode_secret(&self.crypter, &config.cert_pass)?;
        credentials::write_config_file(path, self.kind(), &config)
    }

    fn cache_key(&self) -> Result<String> {
        let site = credentials::parse_site_url(&self.config.site_url)?;
        Ok(cache_key(
            &credentials::host_key(&site),
            self.strategy(),
            &[&self.config.tenant_id, &self.config.client_id],
        ))
    }

    fn scheme(&self) -> AuthScheme {
        AuthScheme::Bearer
    }

    async fn get_auth(&self) -> Result<AuthToken> {
        let site = credentials::parse_site_url(&self.config.site_url)?;
        credentials::require("tenantId", &self.config.tenant_id)?;
        credentials::require("clientId", &self.config.client_id)?;
        credentials::require("certPath", &self.config.cert_path)?;

        let resource = credentials::origin(&site);
        let authorizer: &dyn Authorizer = self.authorizer(&resource)?;
        let key = self.cache_key()?;

        self.ctx
            .cached(&key, || async {
                let token = azure::capture_token(authorizer, &self.config.site_url).await?;
                let expires_at = jwt_expiry(&token).map_err(|e| {
                    AuthError::Protocol(format!("Azure AD returned an unreadable token: {}", e))
                })?;
                Ok(AuthToken::new(token, expires_at))
            })
            .await
    }
}
