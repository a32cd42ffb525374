//! Bearer-token middleware for the admin API.
//!
//! Tokens are HS256 JWTs signed with `RC_ADMIN_JWT_SECRET`. The `role`
//! claim must be `admin`.

use crate::errors::RcError;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::IntoResponse,
};
use common::secret::{ExposeSecret, SecretString};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Role required for every admin route.
pub const ADMIN_ROLE: &str = "admin";

/// Claims carried by an admin bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminClaims {
    pub sub: String,
    pub role: String,
    pub exp: i64,
    pub iat: i64,
}

/// State for the admin authentication middleware.
#[derive(Clone)]
pub struct AdminAuthState {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl AdminAuthState {
    #[must_use]
    pub fn new(secret: &SecretString) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            decoding_key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation,
        }
    }

    /// Verify signature and expiry, returning the claims.
    ///
    /// # Errors
    ///
    /// `RcError::InvalidToken` for any decoding or validation failure.
    pub fn verify(&self, token: &str) -> Result<AdminClaims, RcError> {
        decode::<AdminClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!(target: "rc.admin", error = %e, "Admin token rejected");
                RcError::InvalidToken(e.to_string())
            })
    }
}

fn extract_bearer_token(req: &Request) -> Result<&str, RcError> {
    let auth_header = req
        .headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            debug!(target: "rc.admin", "Missing Authorization header");
            RcError::InvalidToken("Missing Authorization header".to_string())
        })?;

    auth_header.strip_prefix("Bearer ").ok_or_else(|| {
        debug!(target: "rc.admin", "Invalid Authorization header format");
        RcError::InvalidToken("Invalid Authorization header format".to_string())
    })
}

/// Admin authentication middleware.
///
/// # Response
///
/// - 401 Unauthorized if the token is missing or invalid
/// - 403 Forbidden if the token is valid but the role is not `admin`
/// - Otherwise continues with `AdminClaims` in the request extensions
#[instrument(skip_all, name = "rc.admin.auth")]
pub async fn require_admin(
    State(state): State<Arc<AdminAuthState>>,
    mut req: Request,
    next: Next,
) -> Result<impl IntoResponse, RcError> {
    let token = extract_bearer_token(&req)?;
    let claims = state.verify(token)?;

    if claims.role != ADMIN_ROLE {
        debug!(
            target: "rc.admin",
            sub = %claims.sub,
            role = %claims.role,
            "Non-admin role rejected"
        );
        return Err(RcError::Forbidden(format!(
            "role '{}' may not use the admin API",
            claims.role
        )));
    }

    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use rc_test_utils::tokens::AdminTokenBuilder;

    fn state() -> AdminAuthState {
        AdminAuthState::new(&SecretString::from("admin-test-secret"))
    }

    #[test]
    fn test_valid_token_yields_claims() {
        let token = AdminTokenBuilder::new("admin-test-secret")
            .for_subject("ops@example.com")
            .build();
        let claims = state().verify(&token).unwrap();
        assert_eq!(claims.sub, "ops@example.com");
        assert_eq!(claims.role, ADMIN_ROLE);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = AdminTokenBuilder::new("admin-test-secret")
            .signed_with("some-other-secret")
            .build();
        assert!(matches!(
            state().verify(&token),
            Err(RcError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = AdminTokenBuilder::new("admin-test-secret")
            .expires_in(-3600)
            .build();
        assert!(matches!(
            state().verify(&token),
            Err(RcError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(state().verify("not-a-jwt").is_err());
    }
}
