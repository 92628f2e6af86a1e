//! Request authentication.
//!
//! Every channel path sits behind an [`AccessGate`]. The default gate is
//! [`BasicAuth`]: HTTP Basic credentials where the user must match exactly
//! and the password is compared by SHA-256 digest.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use sha2::{Digest, Sha256};

/// Realm announced in `WWW-Authenticate` challenges.
pub const REALM: &str = "node-agent";

/// Decides whether a request may open a channel.
pub trait AccessGate: Send + Sync {
    /// Returns true if the request headers carry acceptable credentials.
    fn permits(&self, headers: &HeaderMap) -> bool;
}

/// HTTP Basic authentication against a single configured account.
#[derive(Clone)]
pub struct BasicAuth {
    user: String,
    password_digest: [u8; 32],
}

impl BasicAuth {
    /// Create a gate accepting `user` with `password`.
    pub fn new(user: impl Into<String>, password: &str) -> Self {
        Self {
            user: user.into(),
            password_digest: digest(password),
        }
    }

    /// Check a user/password pair.
    pub fn verify(&self, user: &str, password: &str) -> bool {
        user == self.user && digest(password) == self.password_digest
    }
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth").field("user", &self.user).finish()
    }
}

impl AccessGate for BasicAuth {
    fn permits(&self, headers: &HeaderMap) -> bool {
        match basic_credentials(headers) {
            Some((user, password)) => self.verify(&user, &password),
            None => false,
        }
    }
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

/// Extract the user and password of a Basic `Authorization` header.
pub fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;

    Some((user.to_string(), password.to_string()))
}

/// Build the value of an `Authorization` header for `user` and `password`.
pub fn basic_header(user: &str, password: &str) -> String {
    let encoded =
        base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, password));
    format!("Basic {}", encoded)
}

/// Middleware rejecting requests the gate does not permit.
pub async fn require_access(
    State(gate): State<Arc<dyn AccessGate>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if gate.permits(req.headers()) {
        return next.run(req).await;
    }

    tracing::warn!(path = %req.uri().path(), "Rejected unauthenticated request");
    unauthorized()
}

fn unauthorized() -> Response {
    let challenge = format!("Basic realm=\"{}\"", REALM);
    let mut response = (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    if let Ok(value) = HeaderValue::from_str(&challenge) {
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, value);
    }
    response
}
