//! Authentication interface (§6): `authenticate_endpoint` / `authenticate_technician`.
//!
//! Grounded in this codebase's `haven-api::auth` login flow — Argon2id
//! hash-and-verify via `PasswordHash`/`PasswordVerifier` — generalized
//! from a single HTTP login endpoint into the broker's two-sided,
//! non-HTTP credential check. Both calls are blocking (spawned onto
//! `spawn_blocking`, matching the teacher's treatment of Argon2 work),
//! and the broker never caches a result beyond the current session.

use std::sync::Arc;

use argon2::password_hash::{SaltString, rand_core::OsRng};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use broker_db::Database;

use crate::error::AuthError;

/// Opaque wire payload carried in `RegisterBody::endpoint_auth`, decoded
/// here rather than at the codec boundary — the codec doesn't know or
/// care how auth bytes are structured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EndpointCredentials {
    /// A durable, password-derived secret checked against `broker-db`'s
    /// `unattended_endpoints` table (§4.2's unattended mode).
    Unattended { endpoint_id: String, password: String },
    /// A short-lived code presented by a normal (attended) support
    /// session. Verifying the code itself is the job of whatever issued
    /// it (e.g. the support widget); the broker only requires it be
    /// present and non-empty, and uses `fingerprint` as the session's
    /// endpoint identity.
    Adhoc { fingerprint: String, code: String },
}

/// Opaque wire payload carried in `PairRequestBody::technician_auth`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicianCredentials {
    pub username: String,
    pub password: String,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate_endpoint(&self, credentials: &[u8]) -> Result<String, AuthError>;
    async fn authenticate_technician(&self, credentials: &[u8]) -> Result<String, AuthError>;
}

/// The shipped `AuthProvider`: Argon2id against `broker-db`-backed
/// tables for both technician passwords and unattended-endpoint
/// verifiers.
pub struct DefaultAuthProvider {
    db: Arc<Database>,
}

impl DefaultAuthProvider {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Provisions (or re-provisions) a technician account. Not part of
    /// the `AuthProvider` trait — this is an operator-facing setup call,
    /// not something the wire protocol exercises.
    pub fn provision_technician(&self, id: &str, username: &str, password: &str) -> Result<(), AuthError> {
        let hash = hash_password(password)?;
        self.db
            .create_technician(id, username, &hash)
            .map_err(AuthError::Storage)
    }

    /// Provisions (or rotates) an unattended endpoint's durable verifier.
    pub fn provision_unattended_endpoint(&self, endpoint_id: &str, password: &str) -> Result<(), AuthError> {
        let hash = hash_password(password)?;
        self.db
            .upsert_unattended_endpoint(endpoint_id, &hash)
            .map_err(AuthError::Storage)
    }
}

fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|_| AuthError::MalformedCredentials)
}

fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[async_trait]
impl AuthProvider for DefaultAuthProvider {
    async fn authenticate_endpoint(&self, credentials: &[u8]) -> Result<String, AuthError> {
        let creds: EndpointCredentials =
            serde_json::from_slice(credentials).map_err(|_| AuthError::MalformedCredentials)?;

        match creds {
            EndpointCredentials::Adhoc { fingerprint, code } => {
                if fingerprint.is_empty() || code.is_empty() {
                    return Err(AuthError::EndpointRejected);
                }
                Ok(fingerprint)
            }
            EndpointCredentials::Unattended { endpoint_id, password } => {
                let db = self.db.clone();
                let id_for_lookup = endpoint_id.clone();
                let row = tokio::task::spawn_blocking(move || db.get_unattended_endpoint(&id_for_lookup))
                    .await
                    .map_err(|e| AuthError::Storage(e.into()))?
                    .map_err(AuthError::Storage)?;

                let Some(row) = row else {
                    return Err(AuthError::EndpointRejected);
                };
                if verify_password(&password, &row.verifier_hash) {
                    Ok(endpoint_id)
                } else {
                    Err(AuthError::EndpointRejected)
                }
            }
        }
    }

    async fn authenticate_technician(&self, credentials: &[u8]) -> Result<String, AuthError> {
        let creds: TechnicianCredentials =
            serde_json::from_slice(credentials).map_err(|_| AuthError::MalformedCredentials)?;

        let db = self.db.clone();
        let username = creds.username.clone();
        let row = tokio::task::spawn_blocking(move || db.get_technician_by_username(&username))
            .await
            .map_err(|e| AuthError::Storage(e.into()))?
            .map_err(AuthError::Storage)?;

        let Some(row) = row else {
            return Err(AuthError::TechnicianRejected);
        };
        if verify_password(&creds.password, &row.password_hash) {
            Ok(row.username)
        } else {
            Err(AuthError::TechnicianRejected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> (tempfile::TempDir, DefaultAuthProvider) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("broker.sqlite3")).unwrap());
        (dir, DefaultAuthProvider::new(db))
    }

    #[tokio::test]
    async fn technician_login_succeeds_with_correct_password() {
        let (_dir, provider) = provider();
        provider.provision_technician("t1", "alice", "hunter2-hunter2").unwrap();

        let creds = serde_json::to_vec(&TechnicianCredentials {
            username: "alice".into(),
            password: "hunter2-hunter2".into(),
        })
        .unwrap();
        let identity = provider.authenticate_technician(&creds).await.unwrap();
        assert_eq!(identity, "alice");
    }

    #[tokio::test]
    async fn technician_login_rejects_wrong_password() {
        let (_dir, provider) = provider();
        provider.provision_technician("t1", "alice", "correct-horse").unwrap();

        let creds = serde_json::to_vec(&TechnicianCredentials {
            username: "alice".into(),
            password: "wrong".into(),
        })
        .unwrap();
        let err = provider.authenticate_technician(&creds).await.unwrap_err();
        assert!(matches!(err, AuthError::TechnicianRejected));
    }

    #[tokio::test]
    async fn unattended_endpoint_verifies_durable_secret() {
        let (_dir, provider) = provider();
        provider
            .provision_unattended_endpoint("ep-1", "device-secret")
            .unwrap();

        let creds = serde_json::to_vec(&EndpointCredentials::Unattended {
            endpoint_id: "ep-1".into(),
            password: "device-secret".into(),
        })
        .unwrap();
        let identity = provider.authenticate_endpoint(&creds).await.unwrap();
        assert_eq!(identity, "ep-1");
    }

    #[tokio::test]
    async fn adhoc_endpoint_requires_a_non_empty_code() {
        let (_dir, provider) = provider();
        let creds = serde_json::to_vec(&EndpointCredentials::Adhoc {
            fingerprint: "laptop-123".into(),
            code: "".into(),
        })
        .unwrap();
        let err = provider.authenticate_endpoint(&creds).await.unwrap_err();
        assert!(matches!(err, AuthError::EndpointRejected));
    }
}
