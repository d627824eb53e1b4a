use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

use crate::error::AppError;

pub const WEBHOOK_SECRET_HEADER: &str = "x-crmsync-webhook-secret";

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let header = headers
        .get("authorization")
        .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("Authorization header is not valid UTF-8"))?;

    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| AppError::unauthorized("Authorization header must be `Bearer <token>`"))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::unauthorized(
            "Authorization scheme must be `Bearer`",
        ));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::unauthorized("Bearer token is empty"));
    }

    Ok(token)
}

/// Compare secrets in constant time
pub fn secrets_match(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

pub fn verify_bearer(headers: &HeaderMap, expected: &str) -> Result<(), AppError> {
    let token = extract_bearer_token(headers)?;
    if secrets_match(token, expected) {
        Ok(())
    } else {
        Err(AppError::unauthorized("Invalid API token"))
    }
}

/// Webhook senders cannot set our bearer token, so they present the shared
/// secret in a header or a `secret` query parameter.
pub fn verify_webhook_secret(
    headers: &HeaderMap,
    query_secret: Option<&str>,
    expected: Option<&str>,
) -> Result<(), AppError> {
    let expected = expected
        .ok_or_else(|| AppError::Unavailable("webhooks are not configured".to_string()))?;
    let provided = headers
        .get(WEBHOOK_SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .or(query_secret)
        .ok_or_else(|| AppError::unauthorized("Missing webhook secret"))?;

    if secrets_match(provided.trim(), expected) {
        Ok(())
    } else {
        Err(AppError::unauthorized("Invalid webhook secret"))
    }
}
