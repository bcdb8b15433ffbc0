//! Shared-token authentication extractor.
//!
//! Every protected route requires HTTP basic auth whose password equals the
//! configured `auth_token`; the username is ignored. The comparison is
//! constant-time.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use subtle::ConstantTimeEq;

use crate::error::ApiError;
use crate::state::AppState;

/// Proof that the request carried the shared token.
///
/// Use as an extractor parameter in any handler that requires auth:
///
/// ```ignore
/// async fn handler(_auth: Authenticated) -> ApiResult<Json<()>> { ... }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Authenticated;

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("Missing Authorization header".into()))?;

        let password = basic_auth_password(header)
            .ok_or_else(|| ApiError::Unauthorized("Expected basic authentication".into()))?;

        let matches: bool = password
            .as_bytes()
            .ct_eq(state.options.auth_token.as_bytes())
            .into();
        if matches {
            Ok(Authenticated)
        } else {
            Err(ApiError::Unauthorized("Bad credentials".into()))
        }
    }
}

/// Decode the password of a `Basic` Authorization header value. The
/// username, if any, is discarded.
fn basic_auth_password(header: &str) -> Option<String> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (_user, password) = decoded.split_once(':')?;
    Some(password.to_string())
}
