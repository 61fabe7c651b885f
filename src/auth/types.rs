// Authentication types

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, SET_COOKIE};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AuthError, Result};

/// Credential produced by a strategy and its validity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthToken {
    /// Bearer token or assembled cookie header
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthToken {
    pub fn new(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    /// Expiry as unix seconds
    pub fn expires_unix(&self) -> i64 {
        self.expires_at.timestamp()
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// How a strategy decorates outgoing requests
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AuthScheme {
    /// `Authorization: Bearer <token>`
    Bearer,
    /// `Cookie: <cookies>`
    Cookie,
    /// Nothing is added
    None,
}

/// OAuth2 token endpoint response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Seconds; some endpoints send it as a string
    #[serde(default)]
    pub expires_in: Option<serde_json::Value>,
}

impl TokenResponse {
    pub fn expires_in_secs(&self) -> Option<i64> {
        match self.expires_in.as_ref()? {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// OAuth2 error body
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthError {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl OAuthError {
    pub fn message(&self) -> String {
        match &self.error_description {
            Some(desc) if !desc.is_empty() => desc.clone(),
            _ => self.error.clone(),
        }
    }
}

/// Device authorization response
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCodeResponse {
    pub device_code: String,
    pub user_code: String,
    #[serde(alias = "verification_url")]
    pub verification_uri: String,
    pub expires_in: u64,
    #[serde(default)]
    pub interval: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Token persisted by disk-backed OAuth strategies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    /// Resource the access token was issued for
    #[serde(default)]
    pub resource: String,
}

/// Cache key that does not keep raw secrets in memory: `host@strategy@sha256(parts)`
pub fn cache_key(host: &str, strategy: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0u8]);
        }
        hasher.update(part.as_bytes());
    }
    format!("{}@{}@{}", host, strategy, hex::encode(hasher.finalize()))
}

/// First `Set-Cookie` header trimmed to its `name=value` pair
pub fn first_set_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(cookie_pair)
        .filter(|c| !c.is_empty())
}

/// Join the `name=value` pairs of every `Set-Cookie`, optionally keeping only `names`
pub fn collect_cookies(headers: &HeaderMap, names: Option<&[&str]>) -> String {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(cookie_pair)
        .filter(|pair| match names {
            Some(names) => pair
                .split_once('=')
                .map(|(name, _)| names.contains(&name.trim()))
                .unwrap_or(false),
            None => !pair.is_empty(),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn cookie_pair(set_cookie: &str) -> String {
    set_cookie
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Parse an RFC 3339 timestamp reported by an identity provider
pub fn parse_expiry(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Read the `exp` claim of a JWT without verifying its signature
pub fn jwt_expiry(token: &str) -> Result<DateTime<Utc>> {
    let token = token.strip_prefix("Bearer ").unwrap_or(token);
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| AuthError::Protocol("Access token is not a JWT".to_string()))?;

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| AuthError::Protocol(format!("Invalid JWT payload encoding: {}", e)))?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::Protocol(format!("Invalid JWT payload: {}", e)))?;

    let exp = claims
        .get("exp")
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        .ok_or_else(|| AuthError::Protocol("JWT has no exp claim".to_string()))?;

    Utc.timestamp_opt(exp, 0)
        .single()
        .ok_or_else(|| AuthError::Protocol(format!("JWT exp out of range: {}", exp)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(cookies: &[&str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for c in cookies {
            headers.append(SET_COOKIE, HeaderValue::from_str(c).unwrap());
        }
        headers
    }

    #[test]
    fn test_cache_key_hides_secrets() {
        let key = cache_key("contoso.sharepoint.com", "saml", &["john", "secret"]);
        assert!(key.starts_with("contoso.sharepoint.com@saml@"));
        assert!(!key.contains("secret"));
        assert_ne!(key, cache_key("contoso.sharepoint.com", "saml", &["johns", "ecret"]));
    }

    #[test]
    fn test_first_set_cookie() {
        let h = headers(&["FedAuth=77u/PD94; path=/; secure; HttpOnly", "rtFa=abc; path=/"]);
        assert_eq!(first_set_cookie(&h).as_deref(), Some("FedAuth=77u/PD94"));
        assert!(first_set_cookie(&HeaderMap::new()).is_none());
    }

    #[test]
    fn test_collect_cookies_filters_names() {
        let h = headers(&[
            "rtFa=r1; domain=sharepoint.com",
            "FedAuth=f1; path=/",
            "SPOIDCRL=x; path=/",
        ]);
        assert_eq!(
            collect_cookies(&h, Some(&["FedAuth", "rtFa"])),
            "rtFa=r1; FedAuth=f1"
        );
        assert_eq!(collect_cookies(&h, None), "rtFa=r1; FedAuth=f1; SPOIDCRL=x");
    }

    #[test]
    fn test_parse_expiry() {
        let dt = parse_expiry("2024-05-01T18:00:01.123Z").unwrap();
        assert_eq!(dt.timestamp(), 1714586401);
        assert!(parse_expiry("").is_none());
        assert!(parse_expiry("tomorrow").is_none());
    }

    #[test]
    fn test_jwt_expiry() {
        let payload = URL_SAFE_NO_PAD.encode(r#"{"aud":"x","exp":1714586401}"#);
        let token = format!("eyJhbGciOiJSUzI1NiJ9.{}.sig", payload);
        assert_eq!(jwt_expiry(&token).unwrap().timestamp(), 1714586401);
        assert_eq!(
            jwt_expiry(&format!("Bearer {}", token)).unwrap().timestamp(),
            1714586401
        );
    }

    #[test]
    fn test_jwt_expiry_errors() {
        assert!(jwt_expiry("opaque-token").is_err());
        let payload = URL_SAFE_NO_PAD.encode(r#"{"aud":"x"}"#);
        assert!(jwt_expiry(&format!("h.{}.s", payload)).is_err());
    }

    #[test]
    fn test_token_response_expires_in_string() {
        let parsed: TokenResponse = serde_json::from_str(
            r#"{"token_type":"Bearer","access_token":"abc","expires_in":"3599"}"#,
        )
        .unwrap();
        assert_eq!(parsed.expires_in_secs(), Some(3599));

        let parsed: TokenResponse =
            serde_json::from_str(r#"{"access_token":"abc","expires_in":3600}"#).unwrap();
        assert_eq!(parsed.expires_in_secs(), Some(3600));
    }

    #[test]
    fn test_oauth_error_message() {
        let err: OAuthError = serde_json::from_str(
            r#"{"error":"invalid_client","error_description":"AADSTS7000215: Invalid client secret"}"#,
        )
        .unwrap();
        assert_eq!(err.message(), "AADSTS7000215: Invalid client secret");
    }
}
