// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Session Authentication
//!
//! A single shared access token gates every client. Identity claims
//! (`user_id`, `nickname`) are taken at face value once the token matches:
//! any authenticated client may claim any user id.

use std::fmt;

use crate::connection_registry::ConnectionRegistry;
use crate::protocol::AuthClaims;

/// Result of an authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    pub ok: bool,
    pub reason: Option<String>,
}

impl AuthResult {
    fn accepted() -> Self {
        AuthResult {
            ok: true,
            reason: None,
        }
    }

    fn rejected(reason: &str) -> Self {
        AuthResult {
            ok: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Constant-time string comparison (prevents timing attacks).
fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let diff = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

/// Checks `auth` claims against the configured access token.
pub struct Authenticator {
    access_token: String,
}

impl Authenticator {
    pub fn new(access_token: impl Into<String>) -> Self {
        Authenticator {
            access_token: access_token.into(),
        }
    }

    /// Checks a presented token without touching any session.
    pub fn verify(&self, token: Option<&str>) -> AuthResult {
        if self.access_token.is_empty() {
            return AuthResult::rejected("Authentication is not configured");
        }
        let Some(given) = token else {
            return AuthResult::rejected("Missing token");
        };
        if !safe_equal(given, &self.access_token) {
            return AuthResult::rejected("Invalid token");
        }
        AuthResult::accepted()
    }

    /// Authenticates a registered session.
    ///
    /// On success the session is marked authenticated with the claimed
    /// identity. On failure the session is left as it was: an already
    /// authenticated session stays authenticated, and nothing is closed.
    pub fn authenticate(
        &self,
        registry: &ConnectionRegistry,
        session_id: &str,
        claims: &AuthClaims,
    ) -> AuthResult {
        let result = self.verify(claims.token.as_deref());
        if !result.ok {
            return result;
        }

        match registry.mark_authenticated(
            session_id,
            claims.user_id.clone(),
            claims.nickname.clone(),
        ) {
            Some(session) => {
                tracing::info!(
                    "[{}] Authenticated as {}",
                    session_id,
                    session.effective_nickname()
                );
                result
            }
            None => AuthResult::rejected("Session not found"),
        }
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("access_token", &"<redacted>")
            .finish()
    }
}
