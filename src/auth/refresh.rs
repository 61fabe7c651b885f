// OAuth2 token endpoint helpers

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;

use super::types::{OAuthError, StoredToken, TokenResponse};
use crate::error::{AuthError, Result};

/// Default lifetime assumed when the endpoint omits `expires_in`
const DEFAULT_EXPIRES_IN: i64 = 3600;

/// POST a form to a token endpoint and decode the token response.
///
/// OAuth error bodies become protocol errors carrying `error_description`.
pub async fn token_request(
    client: &Client,
    url: &str,
    form: &[(&str, &str)],
) -> Result<TokenResponse> {
    let grant = form
        .iter()
        .find(|(k, _)| *k == "grant_type")
        .map(|(_, v)| *v)
        .unwrap_or("unknown");
    tracing::debug!("Token request: url={}, grant_type={}", url, grant);

    let response = client
        .post(url)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .form(form)
        .send()
        .await?;

    let status = response.status();
    let body = response.text().await?;

    if let Ok(err) = serde_json::from_str::<OAuthError>(&body) {
        if !err.error.is_empty() {
            tracing::error!(
                "Token endpoint error: status={}, error={}, description={}",
                status,
                err.error,
                err.error_description.as_deref().unwrap_or("")
            );
            return Err(AuthError::Protocol(err.message()));
        }
    }

    if !status.is_success() {
        return Err(AuthError::http(status.as_u16(), &body));
    }

    let data: TokenResponse = serde_json::from_str(&body)
        .map_err(|e| AuthError::Protocol(format!("Failed to parse token response: {}", e)))?;

    if data.access_token.is_empty() {
        return Err(AuthError::Protocol(
            "Token response does not contain access_token".to_string(),
        ));
    }

    Ok(data)
}

/// Absolute expiry of a token response
pub fn expires_at(data: &TokenResponse) -> DateTime<Utc> {
    let expires_in = data.expires_in_secs().unwrap_or(DEFAULT_EXPIRES_IN);
    Utc::now() + Duration::seconds(expires_in)
}

/// Exchange a refresh token for a new access token
pub async fn refresh_token_grant(
    client: &Client,
    token_url: &str,
    client_id: &str,
    refresh_token: &str,
    scope: &str,
) -> Result<StoredToken> {
    tracing::info!("Refreshing access token via refresh_token grant...");

    let form = [
        ("grant_type", "refresh_token"),
        ("client_id", client_id),
        ("refresh_token", refresh_token),
        ("scope", scope),
    ];
    let data = token_request(client, token_url, &form).await?;
    let expires_at = expires_at(&data);

    tracing::info!("Token refreshed, expires: {}", expires_at.to_rfc3339());

    Ok(StoredToken {
        access_token: data.access_token,
        // Endpoints may omit a rotated refresh token; keep the current one then
        refresh_token: data
            .refresh_token
            .or_else(|| Some(refresh_token.to_string())),
        expires_at,
        resource: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_request_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::UrlEncoded(
                "grant_type".into(),
                "client_credentials".into(),
            ))
            .with_status(200)
            .with_body(r#"{"token_type":"Bearer","access_token":"tok","expires_in":"3599"}"#)
            .create_async()
            .await;

        let data = token_request(
            &Client::new(),
            &format!("{}/token", server.url()),
            &[("grant_type", "client_credentials")],
        )
        .await
        .unwrap();

        mock.assert_async().await;
        assert_eq!(data.access_token, "tok");
        assert_eq!(data.expires_in_secs(), Some(3599));
    }

    #[tokio::test]
    async fn test_token_request_oauth_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant","error_description":"AADSTS70000: expired"}"#)
            .create_async()
            .await;

        let err = token_request(
            &Client::new(),
            &format!("{}/token", server.url()),
            &[("grant_type", "refresh_token")],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AuthError::Protocol(m) if m == "AADSTS70000: expired"));
    }

    #[tokio::test]
    async fn test_token_request_plain_http_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(502)
            .with_body("bad gateway")
            .create_async()
            .await;

        let err = token_request(&Client::new(), &format!("{}/token", server.url()), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Http { status: 502, .. }));
    }

    #[tokio::test]
    async fn test_refresh_keeps_refresh_token_when_not_rotated() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"new","expires_in":600}"#)
            .create_async()
            .await;

        let token = refresh_token_grant(
            &Client::new(),
            &format!("{}/token", server.url()),
            "client",
            "old-refresh",
            "https://contoso.sharepoint.com/.default",
        )
        .await
        .unwrap();
        assert_eq!(token.access_token, "new");
        assert_eq!(token.refresh_token.as_deref(), Some("old-refresh"));
        assert!(token.expires_at > Utc::now() + Duration::seconds(500));
    }
}
