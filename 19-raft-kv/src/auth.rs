//! Bearer-token gate for mutating endpoints.
//!
//! With no token configured every request passes. Reads and status are never
//! gated; the router only layers [`require_bearer`] onto mutating routes.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Authorization header required")]
    Missing,
    #[error("Invalid authorization format. Use: Bearer <token>")]
    Malformed,
    #[error("Invalid token")]
    Invalid,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, self.to_string()).into_response()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuthGate {
    token: Option<Arc<str>>,
}

impl AuthGate {
    /// An empty token disables the gate.
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()).map(Arc::from),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    /// Checks an `Authorization` header value of the form `Bearer <token>`.
    pub fn check(&self, authorization: Option<&str>) -> Result<(), AuthError> {
        let Some(expected) = self.token.as_deref() else {
            return Ok(());
        };
        let header = authorization.ok_or(AuthError::Missing)?;
        if header.is_empty() {
            return Err(AuthError::Missing);
        }
        let mut parts = header.split(' ');
        let (Some("Bearer"), Some(token), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(AuthError::Malformed);
        };
        if token != expected {
            return Err(AuthError::Invalid);
        }
        Ok(())
    }
}

/// Middleware rejecting requests that fail [`AuthGate::check`] with 401.
pub async fn require_bearer(
    State(gate): State<AuthGate>,
    request: Request,
    next: Next,
) -> Response {
    let authorization = match request.headers().get(header::AUTHORIZATION) {
        None => None,
        Some(value) => match value.to_str() {
            Ok(value) => Some(value),
            Err(_) => return AuthError::Malformed.into_response(),
        },
    };
    if let Err(err) = gate.check(authorization) {
        debug!(method = %request.method(), uri = %request.uri(), error = %err, "rejected request");
        return err.into_response();
    }
    next.run(request).await
}
