//! Shared HTTP plumbing for provider adapters

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use super::{Credential, ProviderError};
use crate::config::OAuthClient;
use crate::error::{Error, Result};
use crate::models::Connection;
use crate::rate_limit::RateLimiter;
use crate::util::compact_text;

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(10);
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3_600;

/// A provider response that the caller wants to inspect before classifying
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl RawResponse {
    /// JSON body; empty bodies (204) decode as `null`
    pub fn json(&self) -> std::result::Result<Value, ProviderError> {
        if self.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&self.body).map_err(|error| {
            ProviderError::Transient(format!("unparseable provider response: {error}"))
        })
    }

    pub fn into_error(self) -> ProviderError {
        classify_status(self.status, &self.headers, &self.body)
    }
}

/// HTTP client shared by all adapters; every request passes the rate limiter
#[derive(Clone)]
pub struct ProviderHttp {
    client: Client,
    limiter: Arc<RateLimiter>,
}

impl ProviderHttp {
    pub fn new(timeout: Duration, limiter: Arc<RateLimiter>) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("crmsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|error| Error::InvalidInput(format!("failed to build HTTP client: {error}")))?;
        Ok(Self { client, limiter })
    }

    pub const fn client(&self) -> &Client {
        &self.client
    }

    /// Send a request and return the response whatever its status.
    ///
    /// Rate-limit responses still penalize the connection's bucket.
    pub async fn send_raw(
        &self,
        connection: &Connection,
        request: RequestBuilder,
    ) -> std::result::Result<RawResponse, ProviderError> {
        self.limiter.acquire(connection).await?;

        let response = request.send().await.map_err(|error| {
            ProviderError::Transient(format!("request failed: {}", sanitize(&error)))
        })?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(|error| {
            ProviderError::Transient(format!("failed to read response: {}", sanitize(&error)))
        })?;

        let raw = RawResponse {
            status,
            headers,
            body,
        };
        if !status.is_success() {
            if let ProviderError::RateLimited { retry_after } =
                classify_status(raw.status, &raw.headers, &raw.body)
            {
                self.limiter.penalize(connection, retry_after).await;
            }
        }
        Ok(raw)
    }

    /// Send a request and decode a successful JSON body
    pub async fn send_json(
        &self,
        connection: &Connection,
        request: RequestBuilder,
    ) -> std::result::Result<Value, ProviderError> {
        let raw = self.send_raw(connection, request).await?;
        if raw.status.is_success() {
            raw.json()
        } else {
            Err(raw.into_error())
        }
    }

    /// OAuth2 refresh-token grant
    pub async fn refresh_oauth(
        &self,
        connection: &Connection,
        token_url: &str,
        client: &OAuthClient,
        previous: &Credential,
    ) -> std::result::Result<Credential, ProviderError> {
        let refresh_token = previous
            .refresh_token
            .as_deref()
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| ProviderError::Auth("credential expired and has no refresh token".into()))?;

        let request = self.client.post(token_url).form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client.client_id.as_str()),
            ("client_secret", client.client_secret.as_str()),
        ]);
        let raw = self.send_raw(connection, request).await?;
        if !raw.status.is_success() {
            // invalid_grant and friends come back as 400
            return Err(match raw.into_error() {
                ProviderError::Validation(message) | ProviderError::NotFound(message) => {
                    ProviderError::Auth(message)
                }
                other => other,
            });
        }

        let token: TokenResponse = serde_json::from_str(&raw.body)
            .map_err(|error| ProviderError::Auth(format!("token response unparseable: {error}")))?;
        let now = chrono::Utc::now().timestamp();
        Ok(Credential {
            access_token: token.access_token,
            refresh_token: token.refresh_token.or_else(|| previous.refresh_token.clone()),
            expires_at: Some(now + token.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS)),
            instance_url: token.instance_url.or_else(|| previous.instance_url.clone()),
        })
    }
}

impl std::fmt::Debug for ProviderHttp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHttp")
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    instance_url: Option<String>,
}

/// Map a non-success provider response onto the error taxonomy
pub fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> ProviderError {
    let detail = format!("HTTP {}: {}", status.as_u16(), compact_text(body));
    match status.as_u16() {
        401 => ProviderError::Auth(detail),
        403 if body.contains("REQUEST_LIMIT_EXCEEDED") => ProviderError::RateLimited {
            retry_after: retry_after(headers),
        },
        403 => ProviderError::Auth(detail),
        404 => ProviderError::NotFound(detail),
        400 | 409 | 422 => ProviderError::Validation(detail),
        429 => ProviderError::RateLimited {
            retry_after: retry_after(headers),
        },
        _ => ProviderError::Transient(detail),
    }
}

fn retry_after(headers: &HeaderMap) -> Duration {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
    };

    header("retry-after")
        .map(Duration::from_secs)
        .or_else(|| header("x-hubspot-ratelimit-interval-milliseconds").map(Duration::from_millis))
        .or_else(|| header("x-ratelimit-reset").map(Duration::from_secs))
        .filter(|delay| !delay.is_zero())
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

fn sanitize(error: &impl std::fmt::Display) -> String {
    error.to_string().replace('\n', " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn status_codes_map_to_taxonomy() {
        let empty = HeaderMap::new();
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, &empty, "INVALID_SESSION_ID"),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, &empty, "[{\"errorCode\":\"REQUEST_LIMIT_EXCEEDED\"}]"),
            ProviderError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, &empty, "scope missing"),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, &empty, ""),
            ProviderError::NotFound(_)
        ));
        for status in [StatusCode::BAD_REQUEST, StatusCode::CONFLICT, StatusCode::UNPROCESSABLE_ENTITY] {
            assert!(matches!(
                classify_status(status, &empty, "bad"),
                ProviderError::Validation(_)
            ));
        }
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, &empty, ""),
            ProviderError::Transient(_)
        ));
    }

    #[test]
    fn rate_limit_delay_comes_from_provider_headers() {
        let cases = [
            (headers(&[("retry-after", "7")]), Duration::from_secs(7)),
            (
                headers(&[("x-hubspot-ratelimit-interval-milliseconds", "10000")]),
                Duration::from_secs(10),
            ),
            (headers(&[("x-ratelimit-reset", "2")]), Duration::from_secs(2)),
            (HeaderMap::new(), DEFAULT_RETRY_AFTER),
        ];
        for (headers, expected) in cases {
            assert_eq!(
                classify_status(StatusCode::TOO_MANY_REQUESTS, &headers, ""),
                ProviderError::RateLimited {
                    retry_after: expected
                }
            );
        }
    }

    #[test]
    fn empty_body_decodes_as_null() {
        let raw = RawResponse {
            status: StatusCode::NO_CONTENT,
            headers: HeaderMap::new(),
            body: String::new(),
        };
        assert_eq!(raw.json().unwrap(), Value::Null);
    }
}
