use bytes::Bytes;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::auth::{CredentialStrategy, NtlmCredentials, Transport};
use crate::config::AuthSettings;
use crate::digest::DigestCache;
use crate::error::{AuthError, Result};

/// Request header that disables retries for a single call; stripped before sending
pub const NO_RETRY_HEADER: &str = "x-spauth-noretry";

/// Successful 2xx GETs with an empty body are retried this many times
const EMPTY_BODY_RETRIES: u32 = 2;

/// Snapshot passed to executor hooks
#[derive(Debug, Clone)]
pub struct HookEvent {
    pub method: Method,
    pub url: Url,
    pub started_at: DateTime<Utc>,
    pub status: Option<u16>,
    pub error: Option<String>,
    pub attempt: u32,
}

pub type Hook = Arc<dyn Fn(&HookEvent) + Send + Sync>;

/// Optional observers of the request lifecycle
#[derive(Clone, Default)]
pub struct Hooks {
    pub on_request: Option<Hook>,
    pub on_response: Option<Hook>,
    pub on_retry: Option<Hook>,
    pub on_error: Option<Hook>,
}

/// Buffered response of a protected-resource call
#[derive(Debug, Clone)]
pub struct SiteResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub url: Url,
    pub body: Bytes,
}

impl SiteResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| AuthError::Protocol(format!("Invalid JSON from {}: {}", self.url, e)))
    }
}

/// Why the retry loop goes around again
enum Retry {
    Transport,
    Status(u16),
    Unauthorized,
    EmptyBody,
}

/// HTTP executor for a site: decorates every attempt through the active
/// strategy, negotiates NTLM when asked to and retries transient failures
pub struct SiteClient {
    /// Strategy consulted before every attempt
    strategy: Arc<dyn CredentialStrategy>,

    /// Shared HTTP client with connection pooling
    client: Client,

    settings: AuthSettings,

    hooks: Hooks,

    /// Form digests for state-changing calls
    digests: Arc<DigestCache>,
}

impl SiteClient {
    /// Create an executor around a configured strategy
    pub fn new(strategy: Arc<dyn CredentialStrategy>) -> Self {
        let ctx = strategy.context();
        let client = ctx.client().clone();
        let settings = ctx.settings().clone();

        Self {
            strategy,
            client,
            settings,
            hooks: Hooks::default(),
            digests: Arc::new(DigestCache::new()),
        }
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Share a digest cache between executors of the same process
    pub fn with_digest_cache(mut self, digests: Arc<DigestCache>) -> Self {
        self.digests = digests;
        self
    }

    pub fn strategy(&self) -> &dyn CredentialStrategy {
        self.strategy.as_ref()
    }

    pub fn site_url(&self) -> &str {
        self.strategy.site_url()
    }

    /// Start a request; send it with [`SiteClient::execute`]
    pub fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        self.client.request(method, url)
    }

    /// Request digest for the site, fetched through this executor when missing
    pub async fn form_digest(&self) -> Result<String> {
        self.digests.get(self).await
    }

    /// Execute a request with retry logic.
    ///
    /// Automatically handles:
    /// - transport failures: exponential backoff up to `max_retries`
    /// - statuses from the retry policy: backoff, honouring `Retry-After` on 429/503
    /// - 401/403: invalidates cached credentials and retries once
    /// - empty 2xx GET bodies: retried up to twice
    pub async fn execute(&self, request: Request) -> Result<SiteResponse> {
        self.execute_internal(request, true).await
    }

    /// Execute a request once; failures are returned as they happen
    pub async fn execute_no_retry(&self, request: Request) -> Result<SiteResponse> {
        self.execute_internal(request, false).await
    }

    async fn execute_internal(&self, mut request: Request, enable_retry: bool) -> Result<SiteResponse> {
        let opt_out = request.headers_mut().remove(NO_RETRY_HEADER).is_some();
        let retry = enable_retry && !opt_out;

        let method = request.method().clone();
        let url = request.url().clone();
        let started_at = Utc::now();
        tracing::debug!(method = %method, url = %url, "Sending HTTP request");

        let event = |attempt: u32, status: Option<u16>, error: Option<String>| HookEvent {
            method: method.clone(),
            url: url.clone(),
            started_at,
            status,
            error,
            attempt,
        };

        let mut attempt: u32 = 0;
        let mut transport_retries: u32 = 0;
        let mut status_retries: u32 = 0;
        let mut empty_retries: u32 = 0;
        let mut reauthenticated = false;

        loop {
            attempt += 1;
            let mut req = clone_request(&request)?;

            // Credential failures are never retried
            let mut transport = Transport::Direct;
            if let Err(e) = self.strategy.set_auth(&mut req, &mut transport).await {
                tracing::error!(url = %url, error = %e, "Failed to apply credentials");
                fire(&self.hooks.on_error, &event(attempt, None, Some(e.to_string())));
                return Err(e);
            }

            fire(&self.hooks.on_request, &event(attempt, None, None));

            let outcome = match self.dispatch(req, &transport).await {
                Ok(response) => read_response(response).await,
                Err(e) => Err(e),
            };

            let (next, delay, last_error) = match outcome {
                Ok(response) => {
                    let status = response.status;
                    fire(&self.hooks.on_response, &event(attempt, Some(status.as_u16()), None));

                    if status.is_success() {
                        let empty = method == Method::GET
                            && status != StatusCode::NO_CONTENT
                            && response.body.is_empty();
                        if !(retry && empty && empty_retries < EMPTY_BODY_RETRIES) {
                            return Ok(response);
                        }
                        empty_retries += 1;
                        tracing::warn!(url = %url, "Empty response body, retrying");
                        let delay = self.backoff_delay(empty_retries - 1);
                        (Retry::EmptyBody, delay, AuthError::http(status.as_u16(), ""))
                    } else {
                        let code = status.as_u16();
                        let error = AuthError::http(code, &response.text());
                        tracing::warn!(status = %status, url = %url, attempt, "Received error response");

                        if retry
                            && matches!(code, 401 | 403)
                            && !reauthenticated
                            && !matches!(transport, Transport::Ntlm(_))
                        {
                            reauthenticated = true;
                            if let Err(e) = self.strategy.invalidate().await {
                                tracing::warn!("Failed to clear cached credentials: {}", e);
                            }
                            (Retry::Unauthorized, Duration::ZERO, error)
                        } else if retry && status_retries < self.settings.retry_policy.retries_for(code) {
                            let mut delay = self.backoff_delay(status_retries);
                            if matches!(code, 429 | 503) {
                                if let Some(after) = retry_after(&response.headers) {
                                    delay = after.min(self.max_delay());
                                }
                            }
                            status_retries += 1;
                            (Retry::Status(code), delay, error)
                        } else {
                            tracing::error!(
                                status = code,
                                url = %url,
                                attempt,
                                "HTTP request failed with error response"
                            );
                            fire(&self.hooks.on_error, &event(attempt, Some(code), Some(error.to_string())));
                            return Err(error);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, url = %url, attempt, "HTTP request error");
                    if retry && e.is_retryable() && transport_retries < self.settings.max_retries {
                        let delay = self.backoff_delay(transport_retries);
                        transport_retries += 1;
                        (Retry::Transport, delay, e)
                    } else {
                        tracing::error!(
                            error = %e,
                            url = %url,
                            total_attempts = attempt,
                            "HTTP request failed after all retries"
                        );
                        fire(&self.hooks.on_error, &event(attempt, None, Some(e.to_string())));
                        return Err(e);
                    }
                }
            };

            let reason = match next {
                Retry::Transport => "transport error".to_string(),
                Retry::Status(code) => format!("status {}", code),
                Retry::Unauthorized => "credentials rejected".to_string(),
                Retry::EmptyBody => "empty body".to_string(),
            };
            tracing::warn!(
                "Retrying {} {} after {}ms ({}, attempt {})",
                method,
                url,
                delay.as_millis(),
                reason,
                attempt
            );
            fire(&self.hooks.on_retry, &event(attempt, None, Some(last_error.to_string())));
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Send one decorated request over the selected transport
    async fn dispatch(&self, request: Request, transport: &Transport) -> Result<Response> {
        match transport {
            Transport::Direct => Ok(self.client.execute(request).await?),
            Transport::Ntlm(credentials) => self.ntlm_handshake(request, credentials).await,
        }
    }

    /// Negotiate, answer the challenge, send the real request
    async fn ntlm_handshake(&self, request: Request, credentials: &NtlmCredentials) -> Result<Response> {
        let mut negotiate = clone_request(&request)?;
        negotiate
            .headers_mut()
            .insert(AUTHORIZATION, credentials.negotiate_header()?);
        let challenge = self.client.execute(negotiate).await?;

        if challenge.status() != StatusCode::UNAUTHORIZED {
            return Ok(challenge);
        }

        let authenticate = credentials.authenticate_header(challenge.headers())?;
        // Drain so the connection goes back to the pool for the final leg
        let _ = challenge.bytes().await;

        let mut request = request;
        request.headers_mut().insert(AUTHORIZATION, authenticate);
        tracing::debug!("Sending NTLM authenticate message");
        Ok(self.client.execute(request).await?)
    }

    /// Exponential backoff with 10% jitter, capped at the maximum delay
    fn backoff_delay(&self, retry: u32) -> Duration {
        let base = self.settings.retry_base_delay_ms;
        let delay = base.saturating_mul(2_u64.saturating_pow(retry));
        let jitter = (delay as f64 * 0.1 * rand::thread_rng().gen::<f64>()) as u64;
        Duration::from_millis(delay.saturating_add(jitter)).min(self.max_delay())
    }

    fn max_delay(&self) -> Duration {
        Duration::from_millis(self.settings.retry_max_delay_ms)
    }
}

fn clone_request(request: &Request) -> Result<Request> {
    request
        .try_clone()
        .ok_or_else(|| AuthError::Internal(anyhow::anyhow!("Request body is not cloneable")))
}

async fn read_response(response: Response) -> Result<SiteResponse> {
    let status = response.status();
    let headers = response.headers().clone();
    let url = response.url().clone();
    let body = response.bytes().await?;
    Ok(SiteResponse {
        status,
        headers,
        url,
        body,
    })
}

fn fire(hook: &Option<Hook>, event: &HookEvent) {
    if let Some(hook) = hook {
        hook(event);
    }
}

/// `Retry-After` as delta seconds or an HTTP date
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    (at - Utc::now()).to_std().ok()
}

/// Mark a request so the executor sends it exactly once
pub fn no_retry(request: &mut Request) {
    request.headers_mut().insert(
        HeaderName::from_static(NO_RETRY_HEADER),
        HeaderValue::from_static("true"),
    );
}
