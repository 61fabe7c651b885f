// Interactive sign-in through a browser window
//
// Cookies harvested from the browser are kept encrypted on disk per host and
// replayed into the next browser session so an unexpired sign-in is reused.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::cdp::{self, BrowserCookie, LaunchOptions};
use super::credentials;
use super::types::{cache_key, AuthScheme, AuthToken};
use super::{AuthContext, CredentialStrategy, StrategyKind};
use crate::error::Result;
use crate::secret::SecretCrypter;

/// Session cookies whose expiry decides whether a sign-in is still usable
const AUTH_COOKIES: [&str; 2] = ["FedAuth", "EdgeAccessCookie"];
const DEFAULT_TTL_MINUTES: i64 = 60;

/// On-demand strategy config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OnDemandConfig {
    pub site_url: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub chrome_args: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub chrome_path: String,
}

/// Cookies of one browser sign-in
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CookieJar(pub Vec<BrowserCookie>);

impl CookieJar {
    /// `Cookie` header value
    pub fn to_header(&self) -> String {
        self.0
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn auth_expiries(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        self.0
            .iter()
            .filter(|c| AUTH_COOKIES.contains(&c.name.as_str()) && c.expires != -1.0)
            .filter_map(|c| Utc.timestamp_opt(c.expires as i64, 0).single())
    }

    /// Empty jars and jars whose auth cookies expire within `margin` are stale
    pub fn is_expired(&self, margin: Duration) -> bool {
        if self.0.is_empty() {
            return true;
        }
        let limit = Utc::now() + margin;
        self.auth_expiries().any(|at| at <= limit)
    }

    /// Earliest auth cookie expiry; session cookies get a default lifetime
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.auth_expiries()
            .min()
            .unwrap_or_else(|| Utc::now() + Duration::minutes(DEFAULT_TTL_MINUTES))
    }
}

pub struct OnDemandStrategy {
    ctx: AuthContext,
    config: OnDemandConfig,
    crypter: SecretCrypter,
}

impl OnDemandStrategy {
    pub fn new(ctx: AuthContext) -> Self {
        Self {
            ctx,
            config: OnDemandConfig::default(),
            crypter: SecretCrypter::new(None),
        }
    }

    pub fn with_config(ctx: AuthContext, config: OnDemandConfig) -> Self {
        let mut strategy = Self::new(ctx);
        strategy.config = config;
        strategy
    }

    pub fn config(&self) -> &OnDemandConfig {
        &self.config
    }

    fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            chrome_path: Some(self.config.chrome_path.as_str())
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
            args: self.config.chrome_args.clone(),
        }
    }

    fn load_jar(&self, host: &str) -> Option<CookieJar> {
        self.ctx.store().load(self.strategy(), host, &self.crypter)
    }

    fn save_jar(&self, host: &str, jar: &CookieJar) {
        if let Err(e) = self.ctx.store().save(self.strategy(), host, jar, &self.crypter) {
            tracing::warn!("Failed to persist browser cookies: {}", e);
        }
    }

    /// Disk jar when still valid, otherwise a browser sign-in seeded with it
    async fn acquire(&self, host: &str) -> Result<AuthToken> {
        let cached = self.load_jar(host);
        if let Some(jar) = cached.as_ref().filter(|j| !j.is_expired(self.ctx.margin())) {
            tracing::debug!("Using browser cookies from disk cache");
            return Ok(AuthToken::new(jar.to_header(), jar.expires_at()));
        }

        let seed = cached.map(|j| j.0).unwrap_or_default();
        let jar = match self.browser_sign_in(&seed).await {
            Ok(jar) => jar,
            Err(e) if !seed.is_empty() => {
                tracing::warn!("Seeded sign-in failed, retrying with a clean profile: {}", e);
                self.browser_sign_in(&[]).await?
            }
            Err(e) => return Err(e),
        };

        self.save_jar(host, &jar);
        Ok(AuthToken::new(jar.to_header(), jar.expires_at()))
    }

    async fn browser_sign_in(&self, seed: &[BrowserCookie]) -> Result<CookieJar> {
        let timeout = std::time::Duration::from_secs(self.ctx.settings().interactive_timeout);
        let cookies = cdp::interactive_sign_in(
            self.ctx.client(),
            &self.launch_options(),
            &self.config.site_url,
            seed,
            timeout,
        )
        .await?;
        Ok(CookieJar(cookies))
    }
}

#[async_trait]
impl CredentialStrategy for OnDemandStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::OnDemand
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
        self.config = serde_json::from_slice(bytes)?;
        Ok(())
    }

    fn write_config(&self, path: &Path) -> Result<()> {
        credentials::write_config_file(path, self.kind(), &self.config)
    }

    fn cache_key(&self) -> Result<String> {
        let site = credentials::parse_site_url(&self.config.site_url)?;
        Ok(cache_key(&credentials::host_key(&site), self.strategy(), &[]))
    }

    fn scheme(&self) -> AuthScheme {
        AuthScheme::Cookie
    }

    async fn get_auth(&self) -> Result<AuthToken> {
        let site = credentials::parse_site_url(&self.config.site_url)?;
        let host = credentials::host_key(&site);
        let key = self.cache_key()?;
        self.ctx.cached(&key, || self.acquire(&host)).await
    }

    async fn invalidate(&self) -> Result<()> {
        let site = credentials::parse_site_url(&self.config.site_url)?;
        self.ctx.cache().invalidate(&self.cache_key()?);
        self.ctx
            .store()
            .invalidate(self.strategy(), &credentials::host_key(&site))
    }
}
