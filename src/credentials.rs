//! Credential fixtures for virtual users.
//!
//! Two modes, mirroring how test credentials are supplied in practice: a
//! fixed pool loaded from a JSON file (`{"users": [{"username": ...,
//! "password": ...}]}`, one entry per VU), or per-run generated credentials
//! drawn from a seedable RNG.

use std::path::Path;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

/// A username/password pair, immutable once assigned to a VU.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize)]
struct CredentialFile {
    users: Vec<Credential>,
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("failed to read credential file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse credential file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("credential pool is empty")]
    EmptyPool,

    #[error("credential pool has {available} entries but VU {vu_id} was requested; pool size must cover the VU count")]
    PoolExhausted { vu_id: usize, available: usize },
}

/// Where VU credentials come from.
pub enum CredentialSource {
    /// Fixed pool: VU `i` deterministically gets entry `i`.
    Pool(Vec<Credential>),
    /// Fresh random credential per VU, reproducible when the RNG is seeded.
    Generated,
}

impl CredentialSource {
    /// Load a pool from a JSON file in the `{"users": [...]}` shape.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, CredentialError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let file: CredentialFile = serde_json::from_str(&raw)?;
        if file.users.is_empty() {
            return Err(CredentialError::EmptyPool);
        }
        info!(
            path = %path.as_ref().display(),
            entries = file.users.len(),
            "loaded credential pool"
        );
        Ok(CredentialSource::Pool(file.users))
    }

    /// Pool size, if this source is a pool.
    pub fn pool_size(&self) -> Option<usize> {
        match self {
            CredentialSource::Pool(pool) => Some(pool.len()),
            CredentialSource::Generated => None,
        }
    }

    /// Credential for a given VU. Pool mode indexes by `vu_id` so every VU
    /// gets its own entry; generated mode draws from `rng`.
    pub fn credential_for<R: Rng>(
        &self,
        vu_id: usize,
        rng: &mut R,
    ) -> Result<Credential, CredentialError> {
        match self {
            CredentialSource::Pool(pool) => pool
                .get(vu_id)
                .cloned()
                .ok_or(CredentialError::PoolExhausted {
                    vu_id,
                    available: pool.len(),
                }),
            CredentialSource::Generated => {
                let suffix: String = (0..8).map(|_| char::from(rng.sample(Alphanumeric))).collect();
                let password: String =
                    (0..16).map(|_| char::from(rng.sample(Alphanumeric))).collect();
                Ok(Credential {
                    username: format!("vu-{}", suffix),
                    password,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::io::Write;

    const POOL_JSON: &str = r#"{
        "users": [
            {"username": "default", "password": "12345678"},
            {"username": "alice", "password": "hunter2xx"}
        ]
    }"#;

    #[test]
    fn pool_assigns_by_vu_id() {
        let source = CredentialSource::Pool(
            serde_json::from_str::<CredentialFile>(POOL_JSON).unwrap().users,
        );
        let mut rng = StdRng::seed_from_u64(0);

        let first = source.credential_for(0, &mut rng).unwrap();
        let second = source.credential_for(1, &mut rng).unwrap();
        assert_eq!(first.username, "default");
        assert_eq!(second.username, "alice");
    }

    #[test]
    fn pool_too_small_is_an_error() {
        let source = CredentialSource::Pool(vec![Credential {
            username: "only".to_string(),
            password: "one".to_string(),
        }]);
        let mut rng = StdRng::seed_from_u64(0);

        let error = source.credential_for(1, &mut rng).unwrap_err();
        assert!(matches!(
            error,
            CredentialError::PoolExhausted {
                vu_id: 1,
                available: 1
            }
        ));
    }

    #[test]
    fn generated_credentials_are_seeded() {
        let source = CredentialSource::Generated;

        let a = source
            .credential_for(0, &mut StdRng::seed_from_u64(9))
            .unwrap();
        let b = source
            .credential_for(0, &mut StdRng::seed_from_u64(9))
            .unwrap();
        let c = source
            .credential_for(0, &mut StdRng::seed_from_u64(10))
            .unwrap();

        assert_eq!(a, b, "same seed must generate the same credential");
        assert_ne!(a, c, "different seeds should diverge");
        assert!(a.username.starts_with("vu-"));
        assert_eq!(a.password.len(), 16);
    }

    #[test]
    fn load_pool_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(POOL_JSON.as_bytes()).unwrap();

        let source = CredentialSource::from_json_file(file.path()).unwrap();
        assert_eq!(source.pool_size(), Some(2));
    }

    #[test]
    fn empty_pool_file_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"users": []}"#).unwrap();

        assert!(matches!(
            CredentialSource::from_json_file(file.path()),
            Err(CredentialError::EmptyPool)
        ));
    }

    #[test]
    fn malformed_pool_file_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not json").unwrap();

        assert!(matches!(
            CredentialSource::from_json_file(file.path()),
            Err(CredentialError::Parse(_))
        ));
    }
}
