// Forms authentication behind a TMG/UAG gateway (CookieAuth.dll)

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::header::USER_AGENT;
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

use super::adfs::{redirect_target, BROWSER_USER_AGENT};
use super::credentials;
use super::types::{cache_key, collect_cookies, AuthScheme, AuthToken};
use super::{AuthContext, CredentialStrategy, StrategyKind};
use crate::error::{AuthError, Result};
use crate::secret::SecretCrypter;

/// TMG strategy config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TmgConfig {
    pub site_url: String,
    pub username: String,
    pub password: String,
}

/// Logon form fields carried by the gateway redirect (`GetLogon?curl=...&flags=...`)
fn logon_params(redirect: &Url) -> Vec<(String, String)> {
    let query = redirect.query().unwrap_or_default().replacen("GetLogon?", "", 1);
    query
        .split('&')
        .filter_map(|part| {
            let mut kv = part.split('=');
            match (kv.next(), kv.next(), kv.next()) {
                (Some(k), Some(v), None) if !k.is_empty() => Some((k.to_string(), v.to_string())),
                _ => None,
            }
        })
        .collect()
}

pub struct TmgStrategy {
    ctx: AuthContext,
    config: TmgConfig,
    crypter: SecretCrypter,
}

impl TmgStrategy {
    pub fn new(ctx: AuthContext) -> Self {
        Self {
            ctx,
            config: TmgConfig::default(),
            crypter: SecretCrypter::new(None),
        }
    }

    pub fn with_config(ctx: AuthContext, config: TmgConfig) -> Self {
        let mut strategy = Self::new(ctx);
        strategy.config = config;
        strategy
    }

    pub fn config(&self) -> &TmgConfig {
        &self.config
    }

    async fn logon(&self, site: &Url) -> Result<AuthToken> {
        let client = self.ctx.no_redirect();

        let response = client
            .get(site.as_str())
            .header(USER_AGENT, BROWSER_USER_AGENT)
            .send()
            .await?;
        let redirect = redirect_target(&response)?;
        tracing::debug!("Gateway logon redirect: {}", redirect);

        let mut form = logon_params(&redirect);
        form.retain(|(k, _)| k != "username" && k != "password");
        form.push(("username".to_string(), self.config.username.clone()));
        form.push(("password".to_string(), self.config.password.clone()));

        let endpoint = format!("{}/CookieAuth.dll?Logon", credentials::origin(site));
        let response = client.post(&endpoint).form(&form).send().await?;

        let cookie = collect_cookies(response.headers(), None);
        if cookie.is_empty() {
            return Err(AuthError::Protocol(format!(
                "Gateway returned no auth cookie (status {}), check username and password",
                response.status()
            )));
        }

        let ttl = Duration::seconds(self.ctx.settings().gateway_cookie_ttl_secs);
        Ok(AuthToken::new(cookie, Utc::now() + ttl))
    }
}

#[async_trait]
impl CredentialStrategy for TmgStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Tmg
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
        let mut config: TmgConfig = serde_json::from_slice(bytes)?;
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

        let key = self.cache_key()?;
        self.ctx.cached(&key, || self.logon(&site)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logon_params() {
        let url = Url::parse(
            "https://gw.contoso.com/CookieAuth.dll?GetLogon?curl=Z2F&reason=0&formdir=3",
        )
        .unwrap();
        assert_eq!(
            logon_params(&url),
            vec![
                ("curl".to_string(), "Z2F".to_string()),
                ("reason".to_string(), "0".to_string()),
                ("formdir".to_string(), "3".to_string()),
            ]
        );

        let url = Url::parse("https://gw.contoso.com/CookieAuth.dll").unwrap();
        assert!(logon_params(&url).is_empty());
    }
}
