//! SIP digest authentication (RFC 7616; SHA-256 preferred, MD5 accepted)
//!
//! Verification never sees a plaintext password: it works from the HA1
//! values precomputed when the extension password was set.

use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::message::SipError;

/// Nonce validity, matching the REGISTER challenge idempotency window.
const NONCE_TTL: Duration = Duration::from_secs(32);

/// Failed attempts from one address within the window before it is blocked.
const FAILURE_LIMIT: u32 = 10;
const FAILURE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Sha256 => "SHA-256",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MD5" => Some(DigestAlgorithm::Md5),
            "SHA-256" => Some(DigestAlgorithm::Sha256),
            _ => None,
        }
    }

    fn hash(&self, input: &str) -> String {
        match self {
            DigestAlgorithm::Md5 => format!("{:x}", md5::compute(input)),
            DigestAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(input);
                hex::encode(hasher.finalize())
            }
        }
    }
}

/// Compute the digest response from a precomputed HA1.
#[allow(clippy::too_many_arguments)]
pub fn compute_response(
    algorithm: DigestAlgorithm,
    ha1: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<&str>,
    nc: Option<&str>,
    cnonce: Option<&str>,
) -> String {
    let ha2 = algorithm.hash(&format!("{}:{}", method, uri));
    match qop {
        Some(qop) => {
            let nc = nc.unwrap_or("00000001");
            let cnonce = cnonce.unwrap_or("");
            algorithm.hash(&format!(
                "{}:{}:{}:{}:{}:{}",
                ha1, nonce, nc, cnonce, qop, ha2
            ))
        }
        None => algorithm.hash(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

/// Parsed Authorization header parameters
#[derive(Debug, Clone)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub algorithm: DigestAlgorithm,
    pub qop: Option<String>,
    pub nc: Option<String>,
    pub cnonce: Option<String>,
}

/// Parse `key="value"` pairs after a "Digest " prefix.
pub fn parse_digest_params(value: &str) -> HashMap<String, String> {
    let digest = value.strip_prefix("Digest ").unwrap_or(value).trim();
    let mut params = HashMap::new();
    for part in split_outside_quotes(digest) {
        if let Some((key, value)) = part.split_once('=') {
            params.insert(
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    params
}

/// Split on commas that are not inside quoted values.
fn split_outside_quotes(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(input[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(input[start..].trim());
    parts
}

impl DigestCredentials {
    pub fn parse(value: &str) -> Result<Self, SipError> {
        let params = parse_digest_params(value);
        let field = |key: &str| {
            params
                .get(key)
                .cloned()
                .ok_or_else(|| SipError::Authentication(format!("missing {} in Authorization", key)))
        };
        Ok(Self {
            username: field("username")?,
            realm: field("realm")?,
            nonce: field("nonce")?,
            uri: field("uri")?,
            response: field("response")?,
            algorithm: params
                .get("algorithm")
                .and_then(|a| DigestAlgorithm::from_str(a))
                .unwrap_or(DigestAlgorithm::Md5),
            qop: params.get("qop").cloned(),
            nc: params.get("nc").cloned(),
            cnonce: params.get("cnonce").cloned(),
        })
    }
}

/// Server-side digest verifier with a nonce store and per-source failure
/// rate limiting.
pub struct DigestVerifier {
    realm: String,
    nonces: Mutex<HashMap<String, Instant>>,
    failures: Mutex<HashMap<IpAddr, (u32, Instant)>>,
}

impl DigestVerifier {
    pub fn new(realm: &str) -> Self {
        Self {
            realm: realm.to_string(),
            nonces: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// New 16-byte random nonce, remembered for the idempotency window.
    pub fn create_nonce(&self) -> String {
        let mut rng = rand::thread_rng();
        let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
        let nonce = hex::encode(bytes);
        let mut nonces = self.nonces.lock().unwrap();
        nonces.retain(|_, created| created.elapsed() < NONCE_TTL);
        nonces.insert(nonce.clone(), Instant::now());
        nonce
    }

    /// Challenge values for WWW-Authenticate, SHA-256 first per RFC 7616.
    pub fn challenges(&self) -> Vec<String> {
        let nonce = self.create_nonce();
        [DigestAlgorithm::Sha256, DigestAlgorithm::Md5]
            .iter()
            .map(|alg| {
                format!(
                    r#"Digest realm="{}", nonce="{}", algorithm={}, qop="auth""#,
                    self.realm,
                    nonce,
                    alg.as_str()
                )
            })
            .collect()
    }

    /// Verify a response against the stored HA1 for the claimed algorithm.
    pub fn verify(
        &self,
        credentials: &DigestCredentials,
        method: &str,
        ha1_md5: &str,
        ha1_sha256: &str,
    ) -> Result<(), SipError> {
        {
            let nonces = self.nonces.lock().unwrap();
            let created = nonces
                .get(&credentials.nonce)
                .ok_or_else(|| SipError::Authentication("unknown or expired nonce".into()))?;
            if created.elapsed() >= NONCE_TTL {
                return Err(SipError::Authentication("nonce expired".into()));
            }
        }

        if credentials.realm != self.realm {
            return Err(SipError::Authentication(format!(
                "realm mismatch: {}",
                credentials.realm
            )));
        }

        let ha1 = match credentials.algorithm {
            DigestAlgorithm::Md5 => ha1_md5,
            DigestAlgorithm::Sha256 => ha1_sha256,
        };
        let expected = compute_response(
            credentials.algorithm,
            ha1,
            &credentials.nonce,
            method,
            &credentials.uri,
            credentials.qop.as_deref(),
            credentials.nc.as_deref(),
            credentials.cnonce.as_deref(),
        );

        if expected != credentials.response {
            debug!(user = %credentials.username, "digest response mismatch");
            return Err(SipError::Authentication("invalid credentials".into()));
        }
        Ok(())
    }

    /// Whether a source address has exceeded the failure budget.
    pub fn is_blocked(&self, source: IpAddr) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures.get(&source) {
            Some((count, since)) => {
                if since.elapsed() > FAILURE_WINDOW {
                    failures.remove(&source);
                    false
                } else {
                    *count >= FAILURE_LIMIT
                }
            }
            None => false,
        }
    }

    pub fn record_failure(&self, source: IpAddr) {
        let mut failures = self.failures.lock().unwrap();
        let entry = failures.entry(source).or_insert((0, Instant::now()));
        if entry.1.elapsed() > FAILURE_WINDOW {
            *entry = (0, Instant::now());
        }
        entry.0 += 1;
        if entry.0 == FAILURE_LIMIT {
            warn!(%source, "authentication failure limit reached, blocking source");
        }
        metrics::counter!("pbx_sip_auth_failures_total").increment(1);
    }
}

/// Client side: answer a challenge from a trunk provider. Returns the
/// Authorization header value.
pub fn answer_challenge(
    challenge: &str,
    method: &str,
    uri: &str,
    username: &str,
    password: &str,
) -> Result<String, SipError> {
    let params = parse_digest_params(challenge);
    let realm = params
        .get("realm")
        .ok_or_else(|| SipError::Authentication("challenge has no realm".into()))?;
    let nonce = params
        .get("nonce")
        .ok_or_else(|| SipError::Authentication("challenge has no nonce".into()))?;
    let algorithm = params
        .get("algorithm")
        .and_then(|a| DigestAlgorithm::from_str(a))
        .unwrap_or(DigestAlgorithm::Md5);
    // providers advertise qop="auth[,auth-int]"; we only do auth
    let qop = params
        .get("qop")
        .map(|q| q.split(',').any(|v| v.trim() == "auth"))
        .unwrap_or(false);

    let ha1 = algorithm.hash(&format!("{}:{}:{}", username, realm, password));
    let (qop_str, nc, cnonce) = if qop {
        let mut rng = rand::thread_rng();
        let cnonce: Vec<u8> = (0..8).map(|_| rng.gen()).collect();
        (
            Some("auth".to_string()),
            Some("00000001".to_string()),
            Some(hex::encode(cnonce)),
        )
    } else {
        (None, None, None)
    };

    let response = compute_response(
        algorithm,
        &ha1,
        nonce,
        method,
        uri,
        qop_str.as_deref(),
        nc.as_deref(),
        cnonce.as_deref(),
    );

    let mut value = format!(
        r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm={}"#,
        username,
        realm,
        nonce,
        uri,
        response,
        algorithm.as_str()
    );
    if let (Some(qop), Some(nc), Some(cnonce)) = (qop_str, nc, cnonce) {
        value.push_str(&format!(r#", qop={}, nc={}, cnonce="{}""#, qop, nc, cnonce));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::password::{ha1_md5, ha1_sha256};

    #[test]
    fn test_known_md5_vector() {
        // RFC 2617 §3.5 example
        let ha1 = ha1_md5("Mufasa", "testrealm@host.com", "Circle Of Life");
        let response = compute_response(
            DigestAlgorithm::Md5,
            &ha1,
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "GET",
            "/dir/index.html",
            Some("auth"),
            Some("00000001"),
            Some("0a4f113b"),
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_verify_roundtrip_both_algorithms() {
        let verifier = DigestVerifier::new("skylark");
        let md5_ha1 = ha1_md5("alice", "skylark", "secret");
        let sha_ha1 = ha1_sha256("alice", "skylark", "secret");

        for algorithm in [DigestAlgorithm::Md5, DigestAlgorithm::Sha256] {
            let nonce = verifier.create_nonce();
            let ha1 = match algorithm {
                DigestAlgorithm::Md5 => &md5_ha1,
                DigestAlgorithm::Sha256 => &sha_ha1,
            };
            let response = compute_response(
                algorithm,
                ha1,
                &nonce,
                "REGISTER",
                "sip:skylark",
                Some("auth"),
                Some("00000001"),
                Some("abcd"),
            );
            let credentials = DigestCredentials {
                username: "alice".into(),
                realm: "skylark".into(),
                nonce,
                uri: "sip:skylark".into(),
                response,
                algorithm,
                qop: Some("auth".into()),
                nc: Some("00000001".into()),
                cnonce: Some("abcd".into()),
            };
            verifier
                .verify(&credentials, "REGISTER", &md5_ha1, &sha_ha1)
                .unwrap();
        }
    }

    #[test]
    fn test_wrong_password_rejected() {
        let verifier = DigestVerifier::new("skylark");
        let nonce = verifier.create_nonce();
        let wrong_ha1 = ha1_md5("alice", "skylark", "wrong");
        let response = compute_response(
            DigestAlgorithm::Md5,
            &wrong_ha1,
            &nonce,
            "REGISTER",
            "sip:skylark",
            None,
            None,
            None,
        );
        let credentials = DigestCredentials {
            username: "alice".into(),
            realm: "skylark".into(),
            nonce,
            uri: "sip:skylark".into(),
            response,
            algorithm: DigestAlgorithm::Md5,
            qop: None,
            nc: None,
            cnonce: None,
        };
        let result = verifier.verify(
            &credentials,
            "REGISTER",
            &ha1_md5("alice", "skylark", "secret"),
            &ha1_sha256("alice", "skylark", "secret"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_nonce_rejected() {
        let verifier = DigestVerifier::new("skylark");
        let credentials = DigestCredentials {
            username: "alice".into(),
            realm: "skylark".into(),
            nonce: "deadbeef".into(),
            uri: "sip:skylark".into(),
            response: "whatever".into(),
            algorithm: DigestAlgorithm::Md5,
            qop: None,
            nc: None,
            cnonce: None,
        };
        assert!(verifier.verify(&credentials, "REGISTER", "x", "y").is_err());
    }

    #[test]
    fn test_parse_params_with_quoted_commas() {
        let value = r#"Digest username="alice", realm="a, b", nonce="n1", uri="sip:x", response="r1""#;
        let params = parse_digest_params(value);
        assert_eq!(params.get("realm").unwrap(), "a, b");
        assert_eq!(params.get("username").unwrap(), "alice");
    }

    #[test]
    fn test_challenges_prefer_sha256() {
        let verifier = DigestVerifier::new("skylark");
        let challenges = verifier.challenges();
        assert_eq!(challenges.len(), 2);
        assert!(challenges[0].contains("SHA-256"));
        assert!(challenges[1].contains("MD5"));
        assert!(challenges[0].contains(r#"realm="skylark""#));
    }

    #[test]
    fn test_rate_limit_blocks_after_failures() {
        let verifier = DigestVerifier::new("skylark");
        let source: IpAddr = "203.0.113.9".parse().unwrap();
        assert!(!verifier.is_blocked(source));
        for _ in 0..FAILURE_LIMIT {
            verifier.record_failure(source);
        }
        assert!(verifier.is_blocked(source));
        // other sources are unaffected
        assert!(!verifier.is_blocked("203.0.113.10".parse().unwrap()));
    }

    #[test]
    fn test_answer_challenge_verifies() {
        let verifier = DigestVerifier::new("carrier.example");
        let challenge = verifier.challenges().remove(1); // MD5 variant
        let value =
            answer_challenge(&challenge, "REGISTER", "sip:carrier.example", "trunkuser", "pw")
                .unwrap();
        let credentials = DigestCredentials::parse(&value).unwrap();
        let md5 = ha1_md5("trunkuser", "carrier.example", "pw");
        let sha = ha1_sha256("trunkuser", "carrier.example", "pw");
        let check = DigestVerifier::new("carrier.example");
        // move the nonce into the checking verifier's store
        check
            .nonces
            .lock()
            .unwrap()
            .insert(credentials.nonce.clone(), Instant::now());
        check
            .verify(&credentials, "REGISTER", &md5, &sha)
            .unwrap();
    }
}
