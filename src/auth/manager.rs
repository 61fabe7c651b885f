use chrono::Duration;
use reqwest::redirect::Policy;
use reqwest::Client;
use std::future::Future;
use std::sync::Arc;

use super::types::AuthToken;
use crate::cache::ExpiringCache;
use crate::config::AuthSettings;
use crate::error::{AuthError, Result};
use crate::store::DiskCredentialStore;

/// Shared dependencies injected into every strategy
/// Cheap to clone; all clones share the same caches and connection pools
#[derive(Clone)]
pub struct AuthContext {
    inner: Arc<Inner>,
}

struct Inner {
    /// HTTP client following redirects
    client: Client,

    /// HTTP client returning 3xx responses as is (cookie harvesting)
    no_redirect: Client,

    /// In-memory credential cache
    cache: ExpiringCache,

    /// Encrypted on-disk cache for offline-capable strategies
    store: DiskCredentialStore,

    settings: AuthSettings,
}

impl AuthContext {
    /// Create a context from settings
    pub fn new(settings: AuthSettings) -> Result<Self> {
        let client = Self::builder(&settings)
            .build()
            .map_err(|e| AuthError::Internal(anyhow::anyhow!("Failed to create HTTP client: {}", e)))?;

        let no_redirect = Self::builder(&settings)
            .redirect(Policy::none())
            .build()
            .map_err(|e| AuthError::Internal(anyhow::anyhow!("Failed to create HTTP client: {}", e)))?;

        let store = DiskCredentialStore::new(settings.cache_dir.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                no_redirect,
                cache: ExpiringCache::new(),
                store,
                settings,
            }),
        })
    }

    fn builder(settings: &AuthSettings) -> reqwest::ClientBuilder {
        Client::builder()
            .connect_timeout(std::time::Duration::from_secs(settings.connect_timeout))
            .timeout(std::time::Duration::from_secs(settings.request_timeout))
    }

    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    pub fn no_redirect(&self) -> &Client {
        &self.inner.no_redirect
    }

    pub fn cache(&self) -> &ExpiringCache {
        &self.inner.cache
    }

    pub fn store(&self) -> &DiskCredentialStore {
        &self.inner.store
    }

    pub fn settings(&self) -> &AuthSettings {
        &self.inner.settings
    }

    /// Safety margin subtracted from protocol-reported expiries
    pub fn margin(&self) -> Duration {
        Duration::seconds(self.inner.settings.expiry_margin_secs)
    }

    /// Cached credential for `key`, or the result of a single-flight `fetch`.
    ///
    /// `fetch` reports the protocol expiry; the margin is subtracted before the
    /// entry is written.
    pub async fn cached<F, Fut>(&self, key: &str, fetch: F) -> Result<AuthToken>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AuthToken>>,
    {
        let margin = self.margin();
        let (value, expires_at) = self
            .inner
            .cache
            .get_or_try_insert_with(key, || async move {
                let token = fetch().await?;
                let expires_at = token.expires_at - margin;
                tracing::info!(
                    "Credential acquired for {}, cached until {}",
                    key.split('@').take(2).collect::<Vec<_>>().join("@"),
                    expires_at.to_rfc3339()
                );
                Ok((token.value, expires_at))
            })
            .await?;

        Ok(AuthToken { value, expires_at })
    }
}
