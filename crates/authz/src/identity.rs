use axum::extract::{FromRef, FromRequestParts};
use axum::http::{header, request::Parts, HeaderMap};
use axum_extra::extract::CookieJar;

use folio_http::AppError;

use crate::token::{AuthError, Claims, TokenService};

/// Authenticated caller.
///
/// The token is read from the auth cookie, then from
/// `Authorization: Bearer`. Requests without a valid token are rejected with
/// `401` before the handler runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub username: String,
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Self {
            id: claims.id,
            username: claims.username,
        }
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn token_from(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let jar = CookieJar::from_headers(headers);
    jar.get(cookie_name)
        .map(|cookie| cookie.value().to_string())
        .filter(|token| !token.is_empty())
        .or_else(|| bearer(headers).map(str::to_string))
}

impl<S> FromRequestParts<S> for Identity
where
    TokenService: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let tokens = TokenService::from_ref(state);

        let result = token_from(&parts.headers, tokens.cookie_name())
            .ok_or(AuthError::Missing)
            .and_then(|token| tokens.verify(&token));

        match result {
            Ok(claims) => Ok(claims.into()),
            Err(e) => {
                tracing::debug!(error = %e, path = %parts.uri.path(), "rejecting unauthenticated request");
                Err(AppError::unauthorized("Unauthorized"))
            }
        }
    }
}
