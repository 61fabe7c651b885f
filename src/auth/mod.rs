// Authentication module
// Credential strategies, their registry and the shared context they run in

mod adfs;
mod addin;
mod anon;
mod azure;
mod azure_cert;
mod azure_env;
mod cdp;
pub mod credentials;
mod device;
mod fba;
mod manager;
mod ntlm;
mod ondemand;
mod refresh;
mod saml;
mod tmg;
pub mod types;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, COOKIE};
use reqwest::Request;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

pub use adfs::{AdfsConfig, AdfsStrategy};
pub use addin::{AddinConfig, AddinStrategy};
pub use anon::{AnonymousConfig, AnonymousStrategy};
pub use azure::{Authorizer, ClientCertificateAuthorizer, ClientSecretAuthorizer, UsernamePasswordAuthorizer};
pub use azure_cert::{AzureCertConfig, AzureCertStrategy};
pub use azure_env::{AzureEnvConfig, AzureEnvStrategy};
pub use device::{DeviceConfig, DeviceStrategy};
pub use fba::{FbaConfig, FbaStrategy};
pub use manager::AuthContext;
pub use ntlm::{NtlmConfig, NtlmCredentials, NtlmStrategy};
pub use ondemand::{OnDemandConfig, OnDemandStrategy};
pub use saml::{SamlConfig, SamlStrategy};
pub use tmg::{TmgConfig, TmgStrategy};
pub use types::{AuthScheme, AuthToken};

use crate::error::{AuthError, Result};

/// Closed set of supported strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    Adfs,
    Saml,
    Ntlm,
    Fba,
    Tmg,
    Addin,
    AzureCert,
    AzureEnv,
    Device,
    Anonymous,
    OnDemand,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 11] = [
        StrategyKind::Adfs,
        StrategyKind::Saml,
        StrategyKind::Ntlm,
        StrategyKind::Fba,
        StrategyKind::Tmg,
        StrategyKind::Addin,
        StrategyKind::AzureCert,
        StrategyKind::AzureEnv,
        StrategyKind::Device,
        StrategyKind::Anonymous,
        StrategyKind::OnDemand,
    ];

    /// Constant strategy name used in configs and cache keys
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Adfs => "adfs",
            StrategyKind::Saml => "saml",
            StrategyKind::Ntlm => "ntlm",
            StrategyKind::Fba => "fba",
            StrategyKind::Tmg => "tmg",
            StrategyKind::Addin => "addin",
            StrategyKind::AzureCert => "azurecert",
            StrategyKind::AzureEnv => "azureenv",
            StrategyKind::Device => "device",
            StrategyKind::Anonymous => "anonymous",
            StrategyKind::OnDemand => "ondemand",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase();
        if normalized == "anon" {
            return Ok(StrategyKind::Anonymous);
        }
        StrategyKind::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| AuthError::Config(format!("Unknown strategy: {}", s)))
    }
}

/// Transport used for a request; NTLM swaps in a negotiating one
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Transport {
    #[default]
    Direct,
    Ntlm(NtlmCredentials),
}

/// A pluggable authentication protocol
#[async_trait]
pub trait CredentialStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Strategy name
    fn strategy(&self) -> &'static str {
        self.kind().as_str()
    }

    fn site_url(&self) -> &str;

    fn context(&self) -> &AuthContext;

    /// Key used to decrypt secret fields; must be set before reading a config
    fn set_master_key(&mut self, key: &str);

    /// Load config from JSON bytes, decrypting secrets and defaulting fields
    fn parse_config(&mut self, bytes: &[u8]) -> Result<()>;

    /// Remember the config location for resolving relative paths
    fn set_config_path(&mut self, _path: &Path) {}

    fn read_config(&mut self, path: &Path) -> Result<()> {
        let bytes = credentials::read_config_file(path)?;
        self.set_config_path(path);
        self.parse_config(&bytes)
    }

    /// Persist config with secrets encrypted
    fn write_config(&self, path: &Path) -> Result<()>;

    /// In-memory cache key: host, strategy and an identity fingerprint
    fn cache_key(&self) -> Result<String>;

    /// How `set_auth` decorates requests
    fn scheme(&self) -> AuthScheme;

    /// Credential for the site, from cache or a fresh protocol exchange
    async fn get_auth(&self) -> Result<AuthToken>;

    /// Decorate an outgoing request
    async fn set_auth(&self, request: &mut Request, _transport: &mut Transport) -> Result<()> {
        match self.scheme() {
            AuthScheme::None => Ok(()),
            scheme => {
                let token = self.get_auth().await?;
                apply_token(request, scheme, &token.value)
            }
        }
    }

    /// Forget cached credentials
    async fn invalidate(&self) -> Result<()> {
        let key = self.cache_key()?;
        self.context().cache().invalidate(&key);
        Ok(())
    }
}

/// Set the `Authorization` or `Cookie` header for a token
pub fn apply_token(request: &mut Request, scheme: AuthScheme, value: &str) -> Result<()> {
    let (name, header) = match scheme {
        AuthScheme::Bearer => (AUTHORIZATION, format!("Bearer {}", value)),
        AuthScheme::Cookie => (COOKIE, value.to_string()),
        AuthScheme::None => return Ok(()),
    };
    let header = HeaderValue::from_str(&header)
        .map_err(|e| AuthError::Protocol(format!("Credential is not a valid header value: {}", e)))?;
    request.headers_mut().insert(name, header);
    Ok(())
}

/// Construct an unconfigured strategy by kind
pub fn new_by_strategy(kind: StrategyKind, ctx: AuthContext) -> Box<dyn CredentialStrategy> {
    match kind {
        StrategyKind::Adfs => Box::new(AdfsStrategy::new(ctx)),
        StrategyKind::Saml => Box::new(SamlStrategy::new(ctx)),
        StrategyKind::Ntlm => Box::new(NtlmStrategy::new(ctx)),
        StrategyKind::Fba => Box::new(FbaStrategy::new(ctx)),
        StrategyKind::Tmg => Box::new(TmgStrategy::new(ctx)),
        StrategyKind::Addin => Box::new(AddinStrategy::new(ctx)),
        StrategyKind::AzureCert => Box::new(AzureCertStrategy::new(ctx)),
        StrategyKind::AzureEnv => Box::new(AzureEnvStrategy::new(ctx)),
        StrategyKind::Device => Box::new(DeviceStrategy::new(ctx)),
        StrategyKind::Anonymous => Box::new(AnonymousStrategy::new(ctx)),
        StrategyKind::OnDemand => Box::new(OnDemandStrategy::new(ctx)),
    }
}

/// Build a strategy from a config file carrying a `strategy` property
pub fn from_file(
    path: &Path,
    ctx: AuthContext,
    master_key: Option<&str>,
) -> Result<Box<dyn CredentialStrategy>> {
    let bytes = credentials::read_config_file(path)?;
    let kind = credentials::detect_strategy(&bytes)?;
    tracing::debug!("Loading {} strategy from {}", kind, path.display());

    let mut strategy = new_by_strategy(kind, ctx);
    if let Some(key) = master_key {
        strategy.set_master_key(key);
    }
    strategy.set_config_path(path);
    strategy.parse_config(&bytes)?;
    Ok(strategy)
}
