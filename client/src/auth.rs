//! Credential storage shared by the REST layer and the connection manager.
//!
//! A single bearer token lives in a process-wide slot. Reads are synchronous
//! so both the HTTP wrapper and the socket handshake can grab it without
//! awaiting. Session changes are published on a `watch` channel; the UI layer
//! listens for [`SessionStatus::Expired`] to route back to the login screen.

use std::sync::{Arc, RwLock};

use base64::Engine;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No token stored.
    Anonymous,
    /// Token stored (validity is the server's call).
    Authenticated,
    /// A REST call was rejected and the refresh failed. Token cleared.
    Expired,
}

/// Cloneable handle onto the token slot.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<CredentialInner>,
}

struct CredentialInner {
    token: RwLock<Option<String>>,
    status: watch::Sender<SessionStatus>,
}

impl CredentialStore {
    pub fn new() -> Self {
        let (status, _) = watch::channel(SessionStatus::Anonymous);
        Self {
            inner: Arc::new(CredentialInner {
                token: RwLock::new(None),
                status,
            }),
        }
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let store = Self::new();
        store.set(token);
        store
    }

    /// Current token, if any.
    pub fn token(&self) -> Option<String> {
        match self.inner.token.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Store a token (login or refresh).
    pub fn set(&self, token: impl Into<String>) {
        self.write(Some(token.into()));
        self.inner.status.send_replace(SessionStatus::Authenticated);
        debug!("credential stored");
    }

    /// Remove the token (logout).
    pub fn clear(&self) {
        self.write(None);
        self.inner.status.send_replace(SessionStatus::Anonymous);
        info!("credential cleared");
    }

    /// Remove the token after an unrecoverable auth failure.
    pub fn expire(&self) {
        self.write(None);
        self.inner.status.send_replace(SessionStatus::Expired);
        warn!("session expired, credential cleared");
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    fn write(&self, value: Option<String>) {
        match self.inner.token.write() {
            Ok(mut guard) => *guard = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Claims this client reads from a JWT payload.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct TokenClaims {
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Decode the payload segment of a JWT. The signature is not checked.
pub(crate) fn decode_claims(token: &str) -> Option<TokenClaims> {
    let payload = token.split('.').nth(1)?;
    let bytes = match base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')) {
        Ok(b) => b,
        Err(e) => {
            debug!("token payload decode failed: {e}");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(claims) => Some(claims),
        Err(e) => {
            debug!("token claims decode failed: {e}");
            None
        }
    }
}

/// Whether a JWT's `exp` claim lies in the past. Tokens that cannot be
/// decoded, or carry no `exp`, count as expired.
pub fn token_expired(token: &str) -> bool {
    match decode_claims(token).and_then(|c| c.exp) {
        Some(exp) => exp < chrono::Utc::now().timestamp(),
        None => true,
    }
}

#[cfg(test)]
pub(crate) fn make_jwt(exp: i64) -> String {
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let header = engine.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = engine.encode(format!(r#"{{"sub":"u1","exp":{exp}}}"#));
    format!("{header}.{claims}.sig")
}
