//! Credential hashing
//!
//! Extension passwords are stored as Argon2id PHC strings. SIP digest
//! authentication cannot verify against Argon2, so the HA1 values
//! (`H(user:realm:password)` for MD5 and SHA-256) are computed here at
//! password-set time and stored alongside the Argon2id digest.

use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version};
use sha2::{Digest, Sha256};

use crate::{DomainError, Result};

const MEMORY_KIB: u32 = 64 * 1024;
const TIME_COST: u32 = 3;
const PARALLELISM: u32 = 4;
const TAG_LEN: usize = 32;

fn hasher() -> Result<Argon2<'static>> {
    let params = Params::new(MEMORY_KIB, TIME_COST, PARALLELISM, Some(TAG_LEN))
        .map_err(|e| DomainError::Internal(format!("argon2 params: {}", e)))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Hash a password with Argon2id; returns the PHC string
/// (`$argon2id$v=19$m=65536,t=3,p=4$...$...`).
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = hasher()?
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| DomainError::Internal(format!("argon2 hash: {}", e)))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored PHC string.
pub fn check_password(password: &str, stored: &str) -> bool {
    let parsed = match PasswordHash::new(stored) {
        Ok(p) => p,
        Err(_) => return false,
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// MD5 HA1 for SIP digest: md5(user:realm:password), lowercase hex.
pub fn ha1_md5(username: &str, realm: &str, password: &str) -> String {
    let digest = md5::compute(format!("{}:{}:{}", username, realm, password));
    format!("{:x}", digest)
}

/// SHA-256 HA1 for SIP digest (RFC 7616).
pub fn ha1_sha256(username: &str, realm: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}:{}", username, realm, password));
    hex::encode(hasher.finalize())
}

/// Everything written to the store when a password is set.
#[derive(Debug, Clone)]
pub struct StoredCredentials {
    pub password_hash: String,
    pub ha1_md5: String,
    pub ha1_sha256: String,
}

pub fn derive_credentials(username: &str, realm: &str, password: &str) -> Result<StoredCredentials> {
    Ok(StoredCredentials {
        password_hash: hash_password(password)?,
        ha1_md5: ha1_md5(username, realm, password),
        ha1_sha256: ha1_sha256(username, realm, password),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_check_roundtrip() {
        let hash = hash_password("hunter2").unwrap();
        assert!(hash.starts_with("$argon2id$v=19$"));
        assert!(hash.contains("m=65536,t=3,p=4"));
        assert!(check_password("hunter2", &hash));
        assert!(!check_password("hunter3", &hash));
    }

    #[test]
    fn test_check_rejects_garbage_hash() {
        assert!(!check_password("x", "not-a-phc-string"));
    }

    #[test]
    fn test_ha1_md5_known_vector() {
        // RFC 2617 example: md5("Mufasa:testrealm@host.com:Circle Of Life")
        let ha1 = ha1_md5("Mufasa", "testrealm@host.com", "Circle Of Life");
        assert_eq!(ha1, "939e7578ed9e3c518a452acee763bce9");
    }

    #[test]
    fn test_ha1_sha256_shape() {
        let ha1 = ha1_sha256("alice", "skylark", "secret");
        assert_eq!(ha1.len(), 64);
        assert!(ha1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_derive_credentials_consistent() {
        let creds = derive_credentials("alice", "skylark", "secret").unwrap();
        assert_eq!(creds.ha1_md5, ha1_md5("alice", "skylark", "secret"));
        assert!(check_password("secret", &creds.password_hash));
    }
}
