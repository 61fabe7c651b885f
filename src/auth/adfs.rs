// ADFS (WS-Trust 1.3) authentication, including ADFS published through WAP

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::header::{CONTENT_TYPE, COOKIE, LOCATION, USER_AGENT};
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

use super::credentials;
use super::types::{cache_key, collect_cookies, first_set_cookie, parse_expiry, AuthScheme, AuthToken};
use super::{AuthContext, CredentialStrategy, StrategyKind};
use crate::error::{AuthError, Result};
use crate::secret::SecretCrypter;
use crate::templates;

pub(crate) const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const DEFAULT_ADFS_COOKIE: &str = "FedAuth";
const WAP_COOKIE: &str = "EdgeAccessCookie";

/// Lifetime assumed when the identity provider reports none
const FALLBACK_LIFETIME_MINUTES: i64 = 30;

/// ADFS strategy config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdfsConfig {
    pub site_url: String,
    pub username: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub relying_party: String,
    pub adfs_url: String,
    /// Session cookie issued by the site; `EdgeAccessCookie` selects the WAP flow
    pub adfs_cookie: String,
}

pub struct AdfsStrategy {
    ctx: AuthContext,
    config: AdfsConfig,
    crypter: SecretCrypter,
}

impl AdfsStrategy {
    pub fn new(ctx: AuthContext) -> Self {
        Self {
            ctx,
            config: AdfsConfig::default(),
            crypter: SecretCrypter::new(None),
        }
    }

    /// Strategy from an in-memory config holding plaintext secrets
    pub fn with_config(ctx: AuthContext, config: AdfsConfig) -> Self {
        let mut strategy = Self::new(ctx);
        strategy.config = config;
        strategy.normalize();
        strategy
    }

    pub fn config(&self) -> &AdfsConfig {
        &self.config
    }

    fn normalize(&mut self) {
        self.config.username =
            credentials::qualify_username(&self.config.username, self.config.domain.as_deref());
        if self.config.adfs_cookie.is_empty() {
            self.config.adfs_cookie = DEFAULT_ADFS_COOKIE.to_string();
        }
    }

    fn is_wap(&self) -> bool {
        self.config.adfs_cookie == WAP_COOKIE
    }

    fn validate(&self) -> Result<Url> {
        let site = credentials::parse_site_url(&self.config.site_url)?;
        credentials::require("username", &self.config.username)?;
        credentials::require("password", &self.config.password)?;
        if !self.is_wap() {
            credentials::require("adfsUrl", &self.config.adfs_url)?;
            credentials::require("relyingParty", &self.config.relying_party)?;
        }
        Ok(site)
    }

    /// WS-Trust exchange against ADFS, then WS-Fed sign-in to the site's `/_trust/`
    async fn adfs_flow(
        &self,
        site: &Url,
        relying_party: &str,
        edge_cookie: Option<&str>,
    ) -> Result<(String, String)> {
        let adfs = Url::parse(&self.config.adfs_url)
            .map_err(|e| AuthError::Validation(format!("Invalid adfsUrl: {}", e)))?;
        let mixed_url = format!(
            "{}/adfs/services/trust/13/usernamemixed",
            credentials::origin(&adfs)
        );
        tracing::debug!("Requesting SAML token from {}", mixed_url);

        let envelope = templates::adfs::saml_wsfed(
            &mixed_url,
            &self.config.username,
            &self.config.password,
            relying_party,
        );

        let mut request = self
            .ctx
            .client()
            .post(&mixed_url)
            .header(CONTENT_TYPE, "application/soap+xml;charset=utf-8")
            .body(envelope);
        if let Some(edge) = edge_cookie {
            request = request.header(COOKIE, edge);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if let Some(fault) = templates::soap_fault(&body).ok().flatten() {
            return Err(AuthError::Protocol(fault));
        }
        if !status.is_success() {
            return Err(AuthError::http(status.as_u16(), &body));
        }
        let assertion = templates::adfs::parse_response(&body)?;

        let wresult = templates::adfs::saml_token(
            &assertion.token,
            &assertion.not_before,
            &assertion.not_on_or_after,
            relying_party,
        );

        let root = credentials::origin(site);
        let wctx = format!("{}/_layouts/Authenticate.aspx?Source=%2F", root);
        let form = [
            ("wa", "wsignin1.0"),
            ("wctx", wctx.as_str()),
            ("wresult", wresult.as_str()),
        ];

        let mut request = self
            .ctx
            .no_redirect()
            .post(format!("{}/_trust/", root))
            .form(&form);
        if let Some(edge) = edge_cookie {
            request = request.header(COOKIE, edge);
        }
        let response = request.send().await?;

        let cookie_name = if edge_cookie.is_some() {
            DEFAULT_ADFS_COOKIE
        } else {
            self.config.adfs_cookie.as_str()
        };
        let named = collect_cookies(response.headers(), Some(&[cookie_name]));
        let cookie = if named.is_empty() {
            first_set_cookie(response.headers())
        } else {
            Some(named)
        }
        .ok_or_else(|| {
            AuthError::Protocol(format!(
                "No auth cookie returned by {}/_trust/ (status {})",
                root,
                response.status()
            ))
        })?;

        Ok((cookie, assertion.not_on_or_after))
    }

    /// Forms sign-in through Web Application Proxy, yielding `EdgeAccessCookie`
    /// and, when the site itself is ADFS protected, `FedAuth`.
    async fn wap_flow(&self, site: &Url) -> Result<(String, Option<String>)> {
        let client = self.ctx.no_redirect();

        let response = client
            .get(site.as_str())
            .header(USER_AGENT, BROWSER_USER_AGENT)
            .send()
            .await?;
        let login_url = redirect_target(&response)?;
        tracing::debug!("WAP login endpoint: {}", login_url);

        let form = [
            ("UserName", self.config.username.as_str()),
            ("Password", self.config.password.as_str()),
            ("AuthMethod", "FormsAuthentication"),
        ];
        let response = client.post(login_url.as_str()).form(&form).send().await?;
        let msis_cookie = collect_cookies(response.headers(), None);
        if msis_cookie.is_empty() {
            return Err(AuthError::Protocol(
                "MSISAuth cookie is empty, that might be the result of incorrect username and password"
                    .to_string(),
            ));
        }

        let response = client
            .get(login_url.as_str())
            .header(USER_AGENT, BROWSER_USER_AGENT)
            .header(COOKIE, &msis_cookie)
            .send()
            .await?;
        let token_url = redirect_target(&response)?;

        let response = client
            .get(token_url.as_str())
            .header(USER_AGENT, BROWSER_USER_AGENT)
            .send()
            .await?;
        let edge_cookie = first_set_cookie(response.headers()).ok_or_else(|| {
            AuthError::Protocol(format!("No {} returned by the proxy", WAP_COOKIE))
        })?;

        let next = redirect_target(&response).ok();
        match next {
            Some(next) if next.path().contains("/_layouts/15/Authenticate.aspx") => {
                let response = self
                    .ctx
                    .client()
                    .get(next.as_str())
                    .header(USER_AGENT, BROWSER_USER_AGENT)
                    .header(COOKIE, &edge_cookie)
                    .send()
                    .await?;
                let realm = response
                    .url()
                    .query_pairs()
                    .find(|(k, _)| k == "wtrealm")
                    .map(|(_, v)| v.into_owned())
                    .ok_or_else(|| {
                        AuthError::Protocol("ADFS redirect carries no wtrealm".to_string())
                    })?;

                let (fed_auth, expires) = self.adfs_flow(site, &realm, Some(&edge_cookie)).await?;
                Ok((format!("{}; {}", edge_cookie, fed_auth), Some(expires)))
            }
            _ => Ok((edge_cookie, None)),
        }
    }
}

/// Absolute `Location` of a redirect response
pub(crate) fn redirect_target(response: &reqwest::Response) -> Result<Url> {
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            AuthError::Protocol(format!(
                "Expected a redirect from {} but got status {}",
                response.url(),
                response.status()
            ))
        })?;
    response
        .url()
        .join(location)
        .map_err(|e| AuthError::Protocol(format!("Invalid redirect location {}: {}", location, e)))
}

#[async_trait]
impl CredentialStrategy for AdfsStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Adfs
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
        let mut config: AdfsConfig = serde_json::from_slice(bytes)?;
        config.password = credentials::decode_secret(&self.crypter, &config.password);
        self.config = config;
        self.normalize();
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
            &[&self.config.username, &self.config.password, &self.config.relying_party],
        ))
    }

    fn scheme(&self) -> AuthScheme {
        AuthScheme::Cookie
    }

    async fn get_auth(&self) -> Result<AuthToken> {
        let site = self.validate()?;
        let key = self.cache_key()?;

        self.ctx
            .cached(&key, || async {
                let (cookie, expires) = if self.is_wap() {
                    self.wap_flow(&site).await?
                } else {
                    let (cookie, expires) =
                        self.adfs_flow(&site, &self.config.relying_party, None).await?;
                    (cookie, Some(expires))
                };

                let expires_at = match expires.as_deref().and_then(parse_expiry) {
                    Some(at) => at,
                    None => {
                        tracing::warn!(
                            "No token lifetime reported, assuming {} minutes",
                            FALLBACK_LIFETIME_MINUTES
                        );
                        Utc::now() + Duration::minutes(FALLBACK_LIFETIME_MINUTES)
                    }
                };
                Ok(AuthToken::new(cookie, expires_at))
            })
            .await
    }
}
