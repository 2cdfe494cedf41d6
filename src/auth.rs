//! Bearer-token access guard.
//!
//! [`TokenVerifier`] turns a bearer token into [`Claims`]. Two verifiers are
//! provided:
//!
//! | Provider | Verifier | Keys |
//! |----------|----------|------|
//! | `firebase` | [`FirebaseVerifier`] | Google secure-token JWKS (RS256), cached for an hour |
//! | `hs256` | [`SharedSecretVerifier`] | shared secret from config |
//!
//! Every verification failure (expired, malformed, wrong audience, key fetch
//! error) becomes [`AuthError::Unauthenticated`]. [`require_role`] checks the
//! `role` claim and fails with [`AuthError::Forbidden`].
//!
//! Whether routes actually require a token is decided by `auth.enforce`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::AuthConfig;

const FIREBASE_JWKS_URL: &str =
    "https://www.googleapis.com/service_accounts/v1/jwk/securetoken@system.gserviceaccount.com";
const JWKS_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    #[error("Invalid authentication token: {0}")]
    Unauthenticated(String),
    #[error("Access denied. Only users with role '{0}' can perform this action.")]
    Forbidden(String),
}

/// Decoded identity claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError>;
}

/// Fail with [`AuthError::Forbidden`] unless `claims.role == role`.
pub fn require_role(claims: &Claims, role: &str) -> Result<(), AuthError> {
    match claims.role.as_deref() {
        Some(r) if r == role => Ok(()),
        _ => Err(AuthError::Forbidden(role.to_string())),
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    let value = header.ok_or_else(|| AuthError::Unauthenticated("missing bearer token".into()))?;
    let (scheme, token) = value
        .split_once(' ')
        .ok_or_else(|| AuthError::Unauthenticated("malformed authorization header".into()))?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return Err(AuthError::Unauthenticated(
            "malformed authorization header".into(),
        ));
    }
    Ok(token.trim())
}

// ============ HS256 ============

pub struct SharedSecretVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl SharedSecretVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl TokenVerifier for SharedSecretVerifier {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| AuthError::Unauthenticated(e.to_string()))
    }
}

// ============ Firebase ============

struct CachedKeys {
    set: JwkSet,
    fetched_at: Instant,
}

/// Verifies Firebase ID tokens against Google's published signing keys.
pub struct FirebaseVerifier {
    project_id: String,
    jwks_url: String,
    client: reqwest::Client,
    keys: RwLock<Option<CachedKeys>>,
}

impl FirebaseVerifier {
    pub fn new(project_id: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            project_id: project_id.to_string(),
            jwks_url: FIREBASE_JWKS_URL.to_string(),
            client,
            keys: RwLock::new(None),
        })
    }

    async fn fetch_keys(&self) -> Result<JwkSet, AuthError> {
        let set = self
            .client
            .get(&self.jwks_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AuthError::Unauthenticated(format!("key fetch failed: {}", e)))?
            .json::<JwkSet>()
            .await
            .map_err(|e| AuthError::Unauthenticated(format!("key set unreadable: {}", e)))?;
        tracing::debug!(keys = set.keys.len(), "refreshed identity provider keys");
        Ok(set)
    }

    async fn decoding_key(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        {
            let cached = self.keys.read().await;
            if let Some(cached) = cached.as_ref() {
                if cached.fetched_at.elapsed() < JWKS_TTL {
                    if let Some(jwk) = cached.set.find(kid) {
                        return DecodingKey::from_jwk(jwk)
                            .map_err(|e| AuthError::Unauthenticated(e.to_string()));
                    }
                }
            }
        }

        // Stale cache or unknown kid (keys rotate): refetch once.
        let set = self.fetch_keys().await?;
        let key = set
            .find(kid)
            .ok_or_else(|| AuthError::Unauthenticated(format!("unknown signing key '{}'", kid)))
            .and_then(|jwk| {
                DecodingKey::from_jwk(jwk).map_err(|e| AuthError::Unauthenticated(e.to_string()))
            });
        *self.keys.write().await = Some(CachedKeys {
            set,
            fetched_at: Instant::now(),
        });
        key
    }
}

#[async_trait]
impl TokenVerifier for FirebaseVerifier {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let header =
            decode_header(token).map_err(|e| AuthError::Unauthenticated(e.to_string()))?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::Unauthenticated(format!(
                "unexpected signing algorithm {:?}",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| AuthError::Unauthenticated("token has no key id".into()))?;
        let key = self.decoding_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&self.project_id]);
        validation.set_issuer(&[format!("https://securetoken.google.com/{}", self.project_id)]);

        let claims = decode::<Claims>(token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|e| AuthError::Unauthenticated(e.to_string()))?;
        if claims.sub.is_empty() {
            return Err(AuthError::Unauthenticated("empty subject".into()));
        }
        Ok(claims)
    }
}

// ============ Guard ============

/// Verifier plus the enforcement policy from `[auth]`.
pub struct AccessGuard {
    verifier: Arc<dyn TokenVerifier>,
    enforce: bool,
    upload_role: String,
}

impl AccessGuard {
    pub fn new(verifier: Arc<dyn TokenVerifier>, enforce: bool, upload_role: &str) -> Self {
        Self {
            verifier,
            enforce,
            upload_role: upload_role.to_string(),
        }
    }

    /// Build the guard described by `config`.
    ///
    /// Returns `Ok(None)` when the provider is not configured and enforcement
    /// is off.
    pub fn from_config(config: &AuthConfig) -> Result<Option<Self>> {
        let verifier: Arc<dyn TokenVerifier> = match config.provider.as_str() {
            "firebase" => match config.project_id.as_deref() {
                Some(project_id) => {
                    Arc::new(FirebaseVerifier::new(project_id)?) as Arc<dyn TokenVerifier>
                }
                None if config.enforce => bail!("auth.project_id is required for firebase"),
                None => return Ok(None),
            },
            "hs256" => match config.secret.as_deref().filter(|s| !s.is_empty()) {
                Some(secret) => Arc::new(SharedSecretVerifier::new(secret)) as Arc<dyn TokenVerifier>,
                None if config.enforce => bail!("auth.secret is required for hs256"),
                None => return Ok(None),
            },
            other => bail!("Unknown auth provider: {}", other),
        };
        Ok(Some(Self::new(verifier, config.enforce, &config.upload_role)))
    }

    pub fn enforce(&self) -> bool {
        self.enforce
    }

    pub fn upload_role(&self) -> &str {
        &self.upload_role
    }

    /// Verify the bearer token in an `Authorization` header value.
    pub async fn authenticate(&self, header: Option<&str>) -> Result<Claims, AuthError> {
        let token = bearer_token(header)?;
        self.verifier.verify(token).await
    }
}
