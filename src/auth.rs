//! Offline credential validation.
//!
//! Authentication is decided without contacting the server, in order of
//! precedence:
//! 1. a structurally valid, unexpired bearer token plus a cached identity
//! 2. a cached identity on its own (token missing, malformed or expired)
//! 3. nothing: not authenticated

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::store::DurableStore;

/// Cache key holding the last authenticated user.
pub const USER_KEY: &str = "auth_user_data";
/// Cache key holding the bearer token that authenticated [`USER_KEY`].
pub const TOKEN_KEY: &str = "auth_token_cache";

/// Synchronous carrier of the current bearer credential.
pub trait CredentialSource: Send + Sync {
  fn token(&self) -> Option<String>;
}

/// A fixed credential.
#[derive(Debug, Clone, Default)]
pub struct StaticCredential {
  token: Option<String>,
}

impl StaticCredential {
  pub fn new(token: Option<String>) -> Self {
    Self { token }
  }
}

impl CredentialSource for StaticCredential {
  fn token(&self) -> Option<String> {
    self.token.clone()
  }
}

/// Credential read from an environment variable on every call.
#[derive(Debug, Clone)]
pub struct EnvCredential {
  var: String,
}

impl EnvCredential {
  pub fn new(var: impl Into<String>) -> Self {
    Self { var: var.into() }
  }
}

impl CredentialSource for EnvCredential {
  fn token(&self) -> Option<String> {
    std::env::var(&self.var)
      .ok()
      .map(|v| v.trim().to_string())
      .filter(|v| !v.is_empty())
  }
}

/// Credential read from a cookie jar file (`name=value; other=value`).
#[derive(Debug, Clone)]
pub struct CookieFileCredential {
  path: PathBuf,
  name: String,
}

impl CookieFileCredential {
  pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      name: name.into(),
    }
  }
}

impl CredentialSource for CookieFileCredential {
  fn token(&self) -> Option<String> {
    let contents = std::fs::read_to_string(&self.path).ok()?;
    find_cookie(&contents, &self.name)
  }
}

/// Find cookie `name` in a `;`- or newline-separated list of pairs.
fn find_cookie(contents: &str, name: &str) -> Option<String> {
  contents
    .split(|c: char| c == ';' || c == '\n')
    .filter_map(|pair| pair.trim().split_once('='))
    .find(|(key, _)| key.trim() == name)
    .map(|(_, value)| value.trim().to_string())
    .filter(|value| !value.is_empty())
}

#[derive(Error, Debug)]
pub enum CredentialError {
  #[error("token must have three dot-separated segments")]
  Malformed,
  #[error("claims segment is not base64url: {0}")]
  Encoding(#[from] base64::DecodeError),
  #[error("claims segment is not valid JSON: {0}")]
  Claims(#[from] serde_json::Error),
}

/// Claims decoded from the middle segment of a token.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
  /// Expiry, seconds since the Unix epoch. NumericDate may be fractional.
  pub exp: f64,
  #[serde(flatten)]
  pub extra: serde_json::Map<String, Value>,
}

/// Decode a token's claims locally. The signature is not checked.
pub fn decode_claims(token: &str) -> Result<Claims, CredentialError> {
  let segments: Vec<&str> = token.split('.').collect();
  if segments.len() != 3 || segments.iter().any(|s| s.is_empty()) {
    return Err(CredentialError::Malformed);
  }

  // Some issuers pad the segment; the no-pad engine rejects that.
  let payload = URL_SAFE_NO_PAD.decode(segments[1].trim_end_matches('='))?;
  Ok(serde_json::from_slice(&payload)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
  Token,
  Cache,
  None,
}

/// Outcome of [`OfflineValidator::is_authenticated`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthStatus {
  pub authenticated: bool,
  pub identity: Option<Value>,
  pub method: AuthMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenCheck {
  Missing,
  Invalid,
  Expired,
  Valid,
}

/// Decides whether the caller is authenticated without network access.
#[derive(Clone)]
pub struct OfflineValidator {
  store: Arc<DurableStore>,
  credential: Arc<dyn CredentialSource>,
}

impl OfflineValidator {
  pub fn new(store: Arc<DurableStore>, credential: Arc<dyn CredentialSource>) -> Self {
    Self { store, credential }
  }

  pub fn credential(&self) -> Arc<dyn CredentialSource> {
    Arc::clone(&self.credential)
  }

  fn check_token(&self) -> TokenCheck {
    let Some(token) = self.credential.token() else {
      return TokenCheck::Missing;
    };

    match decode_claims(&token) {
      Ok(claims) if claims.exp > now_seconds() => TokenCheck::Valid,
      Ok(claims) => {
        debug!(exp = claims.exp, "credential expired");
        TokenCheck::Expired
      }
      Err(e) => {
        debug!(error = %e, "credential could not be decoded");
        TokenCheck::Invalid
      }
    }
  }

  /// The cached identity, if any. Storage failures count as absent.
  pub fn cached_identity(&self) -> Option<Value> {
    match self.store.get(USER_KEY) {
      Ok(entry) => entry.map(|e| e.value).filter(|v| !v.is_null()),
      Err(e) => {
        warn!(error = %e, "failed to read cached identity");
        None
      }
    }
  }

  /// The token stored alongside the cached identity.
  pub fn cached_token(&self) -> Option<String> {
    self.store.get_value::<String>(TOKEN_KEY).ok().flatten()
  }

  pub fn is_authenticated(&self) -> AuthStatus {
    let token = self.check_token();
    let identity = self.cached_identity();

    let method = match (token, &identity) {
      (TokenCheck::Valid, Some(_)) => AuthMethod::Token,
      (_, Some(_)) => AuthMethod::Cache,
      (_, None) => AuthMethod::None,
    };

    AuthStatus {
      authenticated: method != AuthMethod::None,
      identity,
      method,
    }
  }

  /// Like [`is_authenticated`](Self::is_authenticated), but as a `Result`.
  ///
  /// Fails with [`SyncError::CredentialExpired`] when an expired token was
  /// the only evidence of a session.
  pub fn require(&self) -> Result<Value> {
    let status = self.is_authenticated();
    if let Some(identity) = status.identity {
      return Ok(identity);
    }

    match self.check_token() {
      TokenCheck::Expired => Err(SyncError::CredentialExpired),
      _ => Err(SyncError::Unauthenticated),
    }
  }

  /// Cache the identity from a successful online sign-in or user fetch.
  ///
  /// Both slots are replaced together; a missing token clears the old one.
  /// If the token slot cannot be written the new identity is removed again,
  /// so it never sits next to the previous session's token.
  pub fn remember<T: Serialize + ?Sized>(&self, user: &T, token: Option<&str>) -> Result<()> {
    let user = serde_json::to_value(user)?;
    self.store.put(USER_KEY, &user, None)?;

    let token_slot = match token {
      Some(token) => self.store.put(TOKEN_KEY, token, None),
      None => self.store.delete(TOKEN_KEY),
    };
    if let Err(e) = token_slot {
      warn!(error = %e, "failed to store token, discarding cached identity");
      if let Err(rollback) = self.store.delete(USER_KEY) {
        warn!(error = %rollback, "failed to discard cached identity");
      }
      return Err(e);
    }

    debug!("cached identity refreshed");
    Ok(())
  }

  /// Erase the cached identity and token.
  pub fn sign_out(&self) -> Result<()> {
    self.store.delete(USER_KEY)?;
    self.store.delete(TOKEN_KEY)?;
    Ok(())
  }
}

fn now_seconds() -> f64 {
  Utc::now().timestamp_millis() as f64 / 1000.0
}
