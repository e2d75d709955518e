use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, StatusCode},
    Json,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use shared::error::{ApiError, ErrorCode};
use tracing::debug;

use crate::app_state::AppState;

/// Claims minted by the external auth service. Only the subject phone
/// number and expiry are consulted here.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Claims {
    pub(crate) phone_number: String,
    pub(crate) exp: i64,
}

/// Bearer-token gate in front of every data route.
pub(crate) struct AuthenticatedUser(pub(crate) Claims);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthenticatedUser {
    type Rejection = (StatusCode, Json<ApiError>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| unauthorized("missing bearer token"))?;

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(state.auth_secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| unauthorized("invalid or expired token"))?;

        debug!(phone_number = %data.claims.phone_number, "authenticated request");
        Ok(AuthenticatedUser(data.claims))
    }
}

fn unauthorized(message: &str) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiError::new(ErrorCode::Unauthorized, message)),
    )
}
