// SharePoint Online user credentials (SAML) authentication

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

use super::adfs::BROWSER_USER_AGENT;
use super::credentials;
use super::types::{cache_key, collect_cookies, parse_expiry, AuthScheme, AuthToken};
use super::{AuthContext, CredentialStrategy, StrategyKind};
use crate::error::{AuthError, Result};
use crate::secret::SecretCrypter;
use crate::templates;

const SESSION_COOKIES: [&str; 2] = ["FedAuth", "rtFa"];

/// Online SAML strategy config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SamlConfig {
    pub site_url: String,
    pub username: String,
    pub password: String,
    /// Identity platform host or base URL; derived from the site host when empty
    #[serde(skip_serializing_if = "String::is_empty")]
    pub login_url: String,
}

/// Account classification returned by realm discovery
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UserRealm {
    #[serde(default)]
    name_space_type: String,
    #[serde(default, rename = "AuthURL")]
    auth_url: String,
}

/// Identity platform host serving a SharePoint Online site
pub fn login_host(site: &Url) -> &'static str {
    let host = site.host_str().unwrap_or_default().to_lowercase();
    if host.ends_with(".sharepoint.de") {
        "login.microsoftonline.de"
    } else if host.ends_with(".sharepoint.cn") {
        "login.chinacloudapi.cn"
    } else if host.ends_with("-mil.us") || host.ends_with(".sharepoint.us") {
        "login-us.microsoftonline.com"
    } else {
        "login.microsoftonline.com"
    }
}

pub struct SamlStrategy {
    ctx: AuthContext,
    config: SamlConfig,
    crypter: SecretCrypter,
}

impl SamlStrategy {
    pub fn new(ctx: AuthContext) -> Self {
        Self {
            ctx,
            config: SamlConfig::default(),
            crypter: SecretCrypter::new(None),
        }
    }

    pub fn with_config(ctx: AuthContext, config: SamlConfig) -> Self {
        let mut strategy = Self::new(ctx);
        strategy.config = config;
        strategy
    }

    pub fn config(&self) -> &SamlConfig {
        &self.config
    }

    fn login_base(&self, site: &Url) -> String {
        let login = self.config.login_url.trim().trim_end_matches('/');
        if login.is_empty() {
            format!("https://{}", login_host(site))
        } else if login.contains("://") {
            login.to_string()
        } else {
            format!("https://{}", login)
        }
    }

    async fn user_realm(&self, login_base: &str) -> Result<UserRealm> {
        let response = self
            .ctx
            .no_redirect()
            .post(format!("{}/GetUserRealm.srf", login_base))
            .form(&[("login", self.config.username.as_str())])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AuthError::http(status.as_u16(), &body));
        }
        serde_json::from_str(&body)
            .map_err(|e| AuthError::Protocol(format!("Invalid user realm response: {}", e)))
    }

    async fn security_token(&self, site: &Url) -> Result<(String, String)> {
        let login_base = self.login_base(site);
        let realm = self.user_realm(&login_base).await?;
        tracing::debug!("Namespace type for {}: {}", self.config.username, realm.name_space_type);

        match realm.name_space_type.as_str() {
            "" => Err(AuthError::Protocol(
                "Unable to define namespace type for Online authentication".to_string(),
            )),
            "Managed" => self.managed_token(site, &login_base).await,
            "Federated" => Err(AuthError::Protocol(format!(
                "Federated accounts are not supported by the saml strategy; identity provider: {}",
                realm.auth_url
            ))),
            other => Err(AuthError::Protocol(format!(
                "Unable to resolve namespace authentication type: {}",
                other
            ))),
        }
    }

    async fn managed_token(&self, site: &Url, login_base: &str) -> Result<(String, String)> {
        let forms_url = format!("{}/_forms/default.aspx?wa=wsignin1.0", credentials::origin(site));
        let sts_url = format!("{}/extSTS.srf", login_base);

        let envelope = templates::saml::online_saml_wsfed(
            &sts_url,
            &forms_url,
            &self.config.username,
            &self.config.password,
        );

        let response = self
            .ctx
            .no_redirect()
            .post(&sts_url)
            .header(CONTENT_TYPE, "application/soap+xml;charset=utf-8")
            .body(envelope)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if let Some(fault) = templates::soap_fault(&body).ok().flatten() {
            return Err(AuthError::Protocol(fault));
        }
        if !status.is_success() {
            return Err(AuthError::http(status.as_u16(), &body));
        }
        let token = templates::saml::parse_response(&body)?;

        let response = self
            .ctx
            .no_redirect()
            .post(&forms_url)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(USER_AGENT, BROWSER_USER_AGENT)
            .body(token.token)
            .send()
            .await?;

        let cookie = collect_cookies(response.headers(), Some(&SESSION_COOKIES));
        if cookie.is_empty() {
            return Err(AuthError::Protocol(format!(
                "No FedAuth cookie returned by {} (status {})",
                forms_url,
                response.status()
            )));
        }

        Ok((cookie, token.expires))
    }
}

#[async_trait]
impl CredentialStrategy for SamlStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Saml
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
        let mut config: SamlConfig = serde_json::from_slice(bytes)?;
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

        self.ctx
            .cached(&key, || async {
                let (cookie, expires) = self.security_token(&site).await?;
                let expires_at = parse_expiry(&expires).unwrap_or_else(|| {
                    tracing::warn!("STS reported no token lifetime, assuming 30 minutes");
                    Utc::now() + Duration::minutes(30)
                });
                Ok(AuthToken::new(cookie, expires_at))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_host() {
        let cases = [
            ("https://contoso.sharepoint.com", "login.microsoftonline.com"),
            ("https://contoso.sharepoint.de", "login.microsoftonline.de"),
            ("https://contoso.sharepoint.cn", "login.chinacloudapi.cn"),
            ("https://contoso.sharepoint-mil.us", "login-us.microsoftonline.com"),
            ("https://contoso.sharepoint.us", "login-us.microsoftonline.com"),
        ];
        for (site, expected) in cases {
            assert_eq!(login_host(&Url::parse(site).unwrap()), expected, "{}", site);
        }
    }

    #[test]
    fn test_login_base_override() {
        let ctx = AuthContext::new(crate::config::AuthSettings::for_testing(
            std::env::temp_dir().join("spauth-saml-tests"),
        ))
        .unwrap();
        let site = Url::parse("https://contoso.sharepoint.com").unwrap();

        let mut strategy = SamlStrategy::new(ctx);
        assert_eq!(strategy.login_base(&site), "https://login.microsoftonline.com");

        strategy.config.login_url = "login.example.org".to_string();
        assert_eq!(strategy.login_base(&site), "https://login.example.org");

        strategy.config.login_url = "http://127.0.0.1:9999/".to_string();
        assert_eq!(strategy.login_base(&site), "http://127.0.0.1:9999");
    }

    #[test]
    fn test_user_realm_deserialize() {
        let realm: UserRealm = serde_json::from_str(
            r#"{"State":3,"NameSpaceType":"Federated","AuthURL":"https://adfs.contoso.com/adfs/ls"}"#,
        )
        .unwrap();
        assert_eq!(realm.name_space_type, "Federated");
        assert_eq!(realm.auth_url, "https://adfs.contoso.com/adfs/ls");
    }
}
