// Anonymous access, no credentials attached

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::credentials;
use super::types::{cache_key, AuthScheme, AuthToken};
use super::{AuthContext, CredentialStrategy, StrategyKind};
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AnonymousConfig {
    pub site_url: String,
}

pub struct AnonymousStrategy {
    ctx: AuthContext,
    config: AnonymousConfig,
}

impl AnonymousStrategy {
    pub fn new(ctx: AuthContext) -> Self {
        Self {
            ctx,
            config: AnonymousConfig::default(),
        }
    }

    pub fn with_config(ctx: AuthContext, config: AnonymousConfig) -> Self {
        Self { ctx, config }
    }
}

#[async_trait]
impl CredentialStrategy for AnonymousStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Anonymous
    }

    fn site_url(&self) -> &str {
        &self.config.site_url
    }

    fn context(&self) -> &AuthContext {
        &self.ctx
    }

    fn set_master_key(&mut self, _key: &str) {}

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
        AuthScheme::None
    }

    async fn get_auth(&self) -> Result<AuthToken> {
        Ok(AuthToken::new(String::new(), Utc::now() + Duration::hours(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::Transport;

    #[tokio::test]
    async fn test_set_auth_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AuthContext::new(crate::config::AuthSettings::for_testing(dir.path().into())).unwrap();
        let mut strategy = AnonymousStrategy::new(ctx);
        strategy
            .parse_config(br#"{"strategy":"anonymous","siteUrl":"https://public.contoso.com"}"#)
            .unwrap();
        assert_eq!(strategy.site_url(), "https://public.contoso.com");

        let mut request = reqwest::Request::new(
            reqwest::Method::GET,
            "https://public.contoso.com/_api/web".parse().unwrap(),
        );
        let mut transport = Transport::Direct;
        strategy.set_auth(&mut request, &mut transport).await.unwrap();
        assert!(request.headers().is_empty());
        assert_eq!(transport, Transport::Direct);
        assert!(strategy.get_auth().await.unwrap().value.is_empty());
    }
}
