// Form digest cache
// Anti-forgery tokens for state-changing calls, cached per site and credential
// identity apart from the credentials themselves

use chrono::{Duration, Utc};
use reqwest::header::{HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Method;
use serde::Deserialize;

use crate::cache::ExpiringCache;
use crate::error::{AuthError, Result};
use crate::http_client::SiteClient;

const ODATA_VERBOSE: &str = "application/json;odata=verbose";

#[derive(Debug, Deserialize)]
struct ContextInfoEnvelope {
    d: ContextInfoBody,
}

#[derive(Debug, Deserialize)]
struct ContextInfoBody {
    #[serde(rename = "GetContextWebInformation")]
    info: ContextWebInformation,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContextWebInformation {
    form_digest_value: String,
    form_digest_timeout_seconds: i64,
}

/// Form digests per site and identity, with their own expiry
#[derive(Default)]
pub struct DigestCache {
    cache: ExpiringCache<String>,
}

impl DigestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live digest for the client's site, requested through the client when missing
    pub async fn get(&self, client: &SiteClient) -> Result<String> {
        let site_url = client.site_url().trim_end_matches('/').to_string();
        let margin = client.strategy().context().margin();
        let key = digest_key(client)?;

        let (digest, _) = self
            .cache
            .get_or_try_insert_with(&key, || async {
                let (value, ttl) = fetch_digest(client, &site_url).await?;
                let expires_at = Utc::now() + ttl - margin;
                tracing::debug!("Form digest for {} valid until {}", site_url, expires_at.to_rfc3339());
                Ok((value, expires_at))
            })
            .await?;

        Ok(digest)
    }

    /// Drop the client's digest, e.g. after the server rejected it
    pub fn invalidate(&self, client: &SiteClient) -> Result<()> {
        self.cache.invalidate(&digest_key(client)?);
        Ok(())
    }
}

/// Site URL plus the strategy's credential cache key
fn digest_key(client: &SiteClient) -> Result<String> {
    Ok(format!(
        "{}#{}",
        client.site_url().trim_end_matches('/'),
        client.strategy().cache_key()?
    ))
}

async fn fetch_digest(client: &SiteClient, site_url: &str) -> Result<(String, Duration)> {
    let mut request = client
        .request(Method::POST, &format!("{}/_api/contextinfo", site_url))
        .body("")
        .build()?;
    let headers = request.headers_mut();
    headers.insert(ACCEPT, HeaderValue::from_static(ODATA_VERBOSE));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(ODATA_VERBOSE));

    let response = client.execute(request).await?;
    let envelope: ContextInfoEnvelope = serde_json::from_slice(&response.body)
        .map_err(|e| AuthError::Protocol(format!("Invalid context info response: {}", e)))?;

    let info = envelope.d.info;
    if info.form_digest_value.is_empty() {
        return Err(AuthError::Protocol("Context info has no form digest".to_string()));
    }
    Ok((info.form_digest_value, Duration::seconds(info.form_digest_timeout_seconds)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_info_deserialize() {
        let body = r#"{"d":{"GetContextWebInformation":{"__metadata":{"type":"SP.ContextWebInformation"},
            "FormDigestTimeoutSeconds":1800,"FormDigestValue":"0x1234,19 Oct 2026 10:00:00 -0000",
            "LibraryVersion":"16.0","SiteFullUrl":"https://contoso.sharepoint.com"}}}"#;
        let envelope: ContextInfoEnvelope = serde_json::from_str(body).unwrap();
        assert_eq!(envelope.d.info.form_digest_timeout_seconds, 1800);
        assert!(envelope.d.info.form_digest_value.starts_with("0x1234"));
    }
}
