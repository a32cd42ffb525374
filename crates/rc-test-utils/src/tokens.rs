//! Admin bearer token builder.

use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;

#[derive(Serialize)]
struct Claims {
    sub: String,
    role: String,
    exp: i64,
    iat: i64,
}

/// Builder for HS256 admin tokens.
///
/// # Example
/// ```rust,ignore
/// let token = AdminTokenBuilder::new("secret")
///     .for_subject("ops")
///     .with_role("viewer")
///     .build();
/// ```
pub struct AdminTokenBuilder {
    secret: String,
    sub: String,
    role: String,
    exp: i64,
    iat: i64,
}

impl AdminTokenBuilder {
    /// Admin token valid for one hour, signed with `secret`.
    pub fn new(secret: &str) -> Self {
        let now = Utc::now();
        Self {
            secret: secret.to_string(),
            sub: "test-admin".to_string(),
            role: "admin".to_string(),
            exp: (now + Duration::seconds(3600)).timestamp(),
            iat: now.timestamp(),
        }
    }

    pub fn for_subject(mut self, subject: &str) -> Self {
        self.sub = subject.to_string();
        self
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.role = role.to_string();
        self
    }

    /// Set expiration in seconds from now (negative for an expired token).
    pub fn expires_in(mut self, seconds: i64) -> Self {
        self.exp = (Utc::now() + Duration::seconds(seconds)).timestamp();
        self
    }

    /// Sign with a different secret than the server expects.
    pub fn signed_with(mut self, secret: &str) -> Self {
        self.secret = secret.to_string();
        self
    }

    /// Encoded token, without the `Bearer ` prefix.
    pub fn build(self) -> String {
        let claims = Claims {
            sub: self.sub,
            role: self.role,
            exp: self.exp,
            iat: self.iat,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .expect("HS256 encoding cannot fail")
    }

    /// `Authorization` header value.
    pub fn bearer(self) -> String {
        format!("Bearer {}", self.build())
    }
}
