//! Authentication and permission collaborators.
//!
//! The core consumes two narrow contracts: a token verifier
//! (`verify(token) → subject + audience`) and an optional permission oracle
//! (`may_run(user) → allow | deny{reason}`). The local verifier checks
//! bearer tokens against sha256-hashed client secrets; the HTTP oracle
//! mirrors the external permission service contract (deny surfaces as
//! HTTP 429 with the reason).

use async_trait::async_trait;
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::db::DbHandle;
use crate::errors::RunnerError;

pub const TASK_API_AUDIENCE: &str = "tasks-api";

/// The identity attached to a verified request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub client_id: String,
    pub audience: String,
}

#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<AuthContext, RunnerError>;
}

pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Verifier backed by the clients table: the bearer token is the client
/// secret, matched by hash.
pub struct LocalAuth {
    db: DbHandle,
}

impl LocalAuth {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Register (or rotate) a client credential.
    pub async fn seed_client(&self, client_id: &str, secret: &str) -> Result<(), RunnerError> {
        let client_id = client_id.to_string();
        let hash = hash_secret(secret);
        self.db
            .call(move |db| db.upsert_client(&client_id, &hash, TASK_API_AUDIENCE))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AuthVerifier for LocalAuth {
    async fn verify(&self, token: &str) -> Result<AuthContext, RunnerError> {
        if token.is_empty() {
            return Err(RunnerError::AuthInvalid);
        }
        let hash = hash_secret(token);
        let client = self
            .db
            .call(move |db| db.get_client_by_secret_hash(&hash))
            .await?
            .ok_or(RunnerError::AuthInvalid)?;
        Ok(AuthContext {
            client_id: client.client_id,
            audience: client.audience,
        })
    }
}

/// The permission oracle's verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionDecision {
    Allow,
    Deny { reason: String },
}

#[async_trait]
pub trait PermissionOracle: Send + Sync {
    async fn may_run(&self, user_id: &str) -> Result<PermissionDecision, RunnerError>;
}

/// The default oracle: absence of a configured verifier means allow.
pub struct AllowAll;

#[async_trait]
impl PermissionOracle for AllowAll {
    async fn may_run(&self, _user_id: &str) -> Result<PermissionDecision, RunnerError> {
        Ok(PermissionDecision::Allow)
    }
}

/// Oracle backed by an external HTTP service. The server returns 200 when
/// the user may run tasks and 429 with an optional `{reason}` body when not.
pub struct HttpPermissionOracle {
    client: reqwest::Client,
    verify_url: String,
    secret: String,
}

impl HttpPermissionOracle {
    pub fn new(verify_url: String, secret: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            verify_url,
            secret,
        }
    }
}

#[async_trait]
impl PermissionOracle for HttpPermissionOracle {
    async fn may_run(&self, user_id: &str) -> Result<PermissionDecision, RunnerError> {
        let resp = self
            .client
            .get(&self.verify_url)
            .query(&[("user_id", user_id)])
            .header("X-Runner-Secret-Key", &self.secret)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| RunnerError::Internal(anyhow::anyhow!("Permission check failed: {}", e)))?;

        match resp.status().as_u16() {
            200 => Ok(PermissionDecision::Allow),
            429 => {
                let reason = resp
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|v| v.get("reason").and_then(|r| r.as_str()).map(String::from))
                    .unwrap_or_else(|| "Too many requests".to_string());
                Ok(PermissionDecision::Deny { reason })
            }
            status => Err(RunnerError::Internal(anyhow::anyhow!(
                "Permission check returned status {}",
                status
            ))),
        }
    }
}

// ── Token extraction ──────────────────────────────────────────────────

/// `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// `access_token` cookie.
pub fn token_from_cookie(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == "access_token" && !value.is_empty()).then(|| value.to_string())
    })
}

/// Subprotocol pair: `Sec-WebSocket-Protocol: tasks-api, <token>`.
pub fn token_from_subprotocol(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("sec-websocket-protocol")?.to_str().ok()?;
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    if parts.len() >= 2 && parts[0] == TASK_API_AUDIENCE && !parts[1].is_empty() {
        Some(parts[1].to_string())
    } else {
        None
    }
}
