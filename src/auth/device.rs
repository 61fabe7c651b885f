// Azure AD device code authentication with an encrypted disk cache

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::azure::{self, format_scope};
use super::credentials;
use super::refresh;
use super::types::{cache_key, DeviceCodeResponse, OAuthError, StoredToken, TokenResponse};
use super::types::{AuthScheme, AuthToken};
use super::{AuthContext, CredentialStrategy, StrategyKind};
use crate::error::{AuthError, Result};
use crate::secret::SecretCrypter;

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const SLOW_DOWN_STEP_SECS: u64 = 5;

/// Device code strategy config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceConfig {
    pub site_url: String,
    pub client_id: String,
    pub tenant_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub authority_url: String,
}

pub struct DeviceStrategy {
    ctx: AuthContext,
    config: DeviceConfig,
    crypter: SecretCrypter,
}

impl DeviceStrategy {
    pub fn new(ctx: AuthContext) -> Self {
        Self {
            ctx,
            config: DeviceConfig::default(),
            crypter: SecretCrypter::new(None),
        }
    }

    pub fn with_config(ctx: AuthContext, config: DeviceConfig) -> Self {
        let mut strategy = Self::new(ctx);
        strategy.config = config;
        strategy
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn authority(&self) -> Option<&str> {
        Some(self.config.authority_url.as_str()).filter(|a| !a.is_empty())
    }

    fn token_url(&self) -> String {
        azure::token_url(self.authority(), &self.config.tenant_id)
    }

    fn device_code_url(&self) -> String {
        self.token_url().replace("/oauth2/v2.0/token", "/oauth2/v2.0/devicecode")
    }

    fn scope(&self, resource: &str) -> String {
        format!("{} offline_access", format_scope(resource))
    }

    /// Disk record id: one record per site host, app and tenant
    fn record_id(&self) -> Result<String> {
        let site = credentials::parse_site_url(&self.config.site_url)?;
        Ok(format!(
            "{}_{}_{}",
            credentials::host_key(&site),
            self.config.client_id,
            self.config.tenant_id
        ))
    }

    fn save(&self, resource: &str, mut token: StoredToken) -> Result<AuthToken> {
        token.resource = resource.to_string();
        let result = self.ctx.store().save(
            self.strategy(),
            &self.record_id()?,
            &token,
            &self.crypter,
        );
        if let Err(e) = result {
            tracing::warn!("Failed to persist device token: {}", e);
        }
        Ok(AuthToken::new(token.access_token, token.expires_at))
    }

    /// Disk record, refresh grant, then a new device flow
    async fn acquire(&self, resource: &str) -> Result<AuthToken> {
        let scope = self.scope(resource);
        let stored: Option<StoredToken> = self
            .ctx
            .store()
            .load::<StoredToken>(self.strategy(), &self.record_id()?, &self.crypter)
            .filter(|t| t.resource == resource);

        if let Some(stored) = stored {
            if stored.expires_at - self.ctx.margin() > Utc::now() {
                tracing::debug!("Using device token from disk cache");
                return Ok(AuthToken::new(stored.access_token, stored.expires_at));
            }

            if let Some(refresh_token) = stored.refresh_token.as_deref() {
                match refresh::refresh_token_grant(
                    self.ctx.client(),
                    &self.token_url(),
                    &self.config.client_id,
                    refresh_token,
                    &scope,
                )
                .await
                {
                    Ok(token) => return self.save(resource, token),
                    Err(e) => tracing::warn!("Silent refresh failed, starting device flow: {}", e),
                }
            }
        }

        let timeout = Duration::from_secs(self.ctx.settings().interactive_timeout);
        let token = tokio::time::timeout(timeout, self.device_flow(&scope))
            .await
            .map_err(|_| {
                AuthError::Protocol(format!(
                    "Device code was not confirmed within {}s",
                    timeout.as_secs()
                ))
            })??;

        self.save(resource, token)
    }

    async fn device_flow(&self, scope: &str) -> Result<StoredToken> {
        let response = self
            .ctx
            .client()
            .post(self.device_code_url())
            .form(&[("client_id", self.config.client_id.as_str()), ("scope", scope)])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if let Ok(err) = serde_json::from_str::<OAuthError>(&body) {
            if !err.error.is_empty() {
                return Err(AuthError::Protocol(err.message()));
            }
        }
        if !status.is_success() {
            return Err(AuthError::http(status.as_u16(), &body));
        }
        let code: DeviceCodeResponse = serde_json::from_str(&body)
            .map_err(|e| AuthError::Protocol(format!("Invalid device code response: {}", e)))?;

        match code.message.as_deref() {
            Some(message) => eprintln!("\n{}\n", message),
            None => eprintln!(
                "\nTo sign in, open {} and enter the code {}\n",
                code.verification_uri, code.user_code
            ),
        }

        self.poll(&code).await
    }

    async fn poll(&self, code: &DeviceCodeResponse) -> Result<StoredToken> {
        let token_url = self.token_url();
        let mut interval = code.interval.unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(code.expires_in);

        loop {
            tokio::time::sleep(Duration::from_secs(interval)).await;
            if tokio::time::Instant::now() > deadline {
                return Err(AuthError::Protocol("Device code expired".to_string()));
            }

            let form = [
                ("grant_type", DEVICE_CODE_GRANT),
                ("client_id", self.config.client_id.as_str()),
                ("device_code", code.device_code.as_str()),
            ];
            let response = self.ctx.client().post(&token_url).form(&form).send().await?;
            let status = response.status();
            let body = response.text().await?;

            if status.is_success() {
                let data: TokenResponse = serde_json::from_str(&body)
                    .map_err(|e| AuthError::Protocol(format!("Invalid token response: {}", e)))?;
                let expires_at = refresh::expires_at(&data);
                tracing::info!("Device code confirmed, expires: {}", expires_at.to_rfc3339());
                return Ok(StoredToken {
                    access_token: data.access_token,
                    refresh_token: data.refresh_token,
                    expires_at,
                    resource: String::new(),
                });
            }

            let err: OAuthError = serde_json::from_str(&body)
                .map_err(|_| AuthError::http(status.as_u16(), &body))?;
            match err.error.as_str() {
                "authorization_pending" => continue,
                "slow_down" => interval += SLOW_DOWN_STEP_SECS,
                "expired_token" => {
                    return Err(AuthError::Protocol("Device code expired".to_string()))
                }
                "access_denied" => {
                    return Err(AuthError::Protocol("User denied authorization".to_string()))
                }
                _ => return Err(AuthError::Protocol(err.message())),
            }
        }
    }
}

#[async_trait]
impl CredentialStrategy for DeviceStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Device
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
        Ok(cache_key(
            &credentials::host_key(&site),
            self.strategy(),
            &[&self.config.client_id, &self.config.tenant_id],
        ))
    }

    fn scheme(&self) -> AuthScheme {
        AuthScheme::Bearer
    }

    async fn get_auth(&self) -> Result<AuthToken> {
        let site = credentials::parse_site_url(&self.config.site_url)?;
        credentials::require("clientId", &self.config.client_id)?;
        credentials::require("tenantId", &self.config.tenant_id)?;

        let resource = credentials::origin(&site);
        let key = self.cache_key()?;
        self.ctx.cached(&key, || self.acquire(&resource)).await
    }

    async fn invalidate(&self) -> Result<()> {
        self.ctx.cache().invalidate(&self.cache_key()?);
        self.ctx.store().invalidate(self.strategy(), &self.record_id()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthSettings;
    use chrono::Duration as ChronoDuration;

    const CONTOSO: &str = "https://contoso.sharepoint.com";

    fn strategy_for(dir: &Path, site_url: &str, authority: String) -> DeviceStrategy {
        let ctx = AuthContext::new(AuthSettings::for_testing(dir.into())).unwrap();
        DeviceStrategy::with_config(
            ctx,
            DeviceConfig {
                site_url: site_url.to_string(),
                client_id: "client".to_string(),
                tenant_id: "tenant".to_string(),
                authority_url: authority,
            },
        )
    }

    fn strategy(dir: &Path, authority: String) -> DeviceStrategy {
        strategy_for(dir, "https://contoso.sharepoint.com/sites/dev", authority)
    }

    fn stored(access_token: &str, refresh_token: Option<&str>, expires_in: ChronoDuration) -> StoredToken {
        StoredToken {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.map(str::to_string),
            expires_at: Utc::now() + expires_in,
            resource: String::new(),
        }
    }

    #[test]
    fn test_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let device = strategy(dir.path(), String::new());
        assert_eq!(
            device.device_code_url(),
            "https://login.microsoftonline.com/tenant/oauth2/v2.0/devicecode"
        );
        assert_eq!(
            device.scope(CONTOSO),
            "https://contoso.sharepoint.com/.default offline_access"
        );
        assert_eq!(device.record_id().unwrap(), "contoso.sharepoint.com_client_tenant");
    }

    #[tokio::test]
    async fn test_valid_disk_token_skips_network() {
        let dir = tempfile::tempdir().unwrap();
        let device = strategy(dir.path(), "http://127.0.0.1:1".to_string());
        device
            .save(CONTOSO, stored("cached", None, ChronoDuration::hours(1)))
            .unwrap();

        let token = device.get_auth().await.unwrap();
        assert_eq!(token.value, "cached");
    }

    #[tokio::test]
    async fn test_disk_token_is_not_shared_across_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let contoso = strategy(dir.path(), "http://127.0.0.1:1".to_string());
        contoso
            .save(CONTOSO, stored("token-for-contoso", None, ChronoDuration::hours(1)))
            .unwrap();

        // Same client id and cache dir, different host: must not reuse the record
        let fabrikam = strategy_for(
            dir.path(),
            "https://fabrikam.sharepoint.com/sites/dev",
            "http://127.0.0.1:1".to_string(),
        );
        assert!(matches!(fabrikam.get_auth().await, Err(AuthError::Transport { .. })));

        // Cleaning one host leaves the other record in place
        fabrikam.invalidate().await.unwrap();
        assert_eq!(contoso.get_auth().await.unwrap().value, "token-for-contoso");
    }

    #[tokio::test]
    async fn test_record_for_other_resource_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let device = strategy(dir.path(), "http://127.0.0.1:1".to_string());
        device
            .save(
                "https://fabrikam.sharepoint.com",
                stored("wrong-resource", None, ChronoDuration::hours(1)),
            )
            .unwrap();

        assert!(device.get_auth().await.is_err());
    }

    #[tokio::test]
    async fn test_expired_disk_token_is_refreshed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/tenant/oauth2/v2.0/token")
            .match_body(mockito::Matcher::UrlEncoded("refresh_token".into(), "r1".into()))
            .with_status(200)
            .with_body(r#"{"access_token":"fresh","refresh_token":"r2","expires_in":3600}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let device = strategy(dir.path(), server.url());
        device
            .save(CONTOSO, stored("old", Some("r1"), ChronoDuration::minutes(-5)))
            .unwrap();

        assert_eq!(device.get_auth().await.unwrap().value, "fresh");
        let saved: StoredToken = device
            .ctx
            .store()
            .try_load("device", &device.record_id().unwrap(), &device.crypter)
            .unwrap();
        assert_eq!(saved.refresh_token.as_deref(), Some("r2"));
        assert_eq!(saved.resource, CONTOSO);
    }

    #[tokio::test]
    async fn test_device_flow_polls_until_confirmed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/tenant/oauth2/v2.0/devicecode")
            .with_status(200)
            .with_body(r#"{"device_code":"dc","user_code":"ABCD","verification_uri":"https://microsoft.com/devicelogin","expires_in":900,"interval":0}"#)
            .create_async()
            .await;
        let pending = server
            .mock("POST", "/tenant/oauth2/v2.0/token")
            .with_status(400)
            .with_body(r#"{"error":"authorization_pending"}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let device = strategy(dir.path(), server.url());
        let scope = device.scope(CONTOSO);

        let task = tokio::spawn(async move { device.device_flow(&scope).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        pending.remove_async().await;
        server
            .mock("POST", "/tenant/oauth2/v2.0/token")
            .with_status(200)
            .with_body(r#"{"access_token":"dev","expires_in":3600}"#)
            .create_async()
            .await;

        let token = task.await.unwrap().unwrap();
        assert_eq!(token.access_token, "dev");
    }

    #[tokio::test]
    async fn test_invalidate_removes_disk_record() {
        let dir = tempfile::tempdir().unwrap();
        let device = strategy(dir.path(), String::new());
        device
            .save(CONTOSO, stored("t", None, ChronoDuration::hours(1)))
            .unwrap();
        let path = device
            .ctx
            .store()
            .path_for("device", &device.record_id().unwrap());
        assert!(path.exists());

        device.invalidate().await.unwrap();
        assert!(!path.exists());
    }
}
