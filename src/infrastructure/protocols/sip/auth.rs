//! SIP Digest Authentication (RFC 2617), client side
//!
//! Intermediate and final hashes are base64 encoded rather than hex,
//! which is what the registrars this client talks to expect.

use crate::domain::shared::error::SipError;
use crate::domain::shared::result::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use tracing::trace;

/// The only quality of protection this client offers
pub const QOP_AUTH: &str = "auth";

/// Challenge taken from a `WWW-Authenticate` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationChallenge {
    pub algorithm: String,
    pub realm: String,
    pub nonce: String,
    pub qop: String,
}

impl AuthenticationChallenge {
    /// Parse a `WWW-Authenticate` value such as
    /// `Digest realm="r", nonce="n", algorithm=MD5, qop="auth"`.
    /// All four parameters are required.
    pub fn parse(header_value: &str) -> Result<Self> {
        let params = parse_digest_params(header_value);

        let required = |name: &str| -> Result<String> {
            params
                .get(name)
                .filter(|value| !value.is_empty())
                .cloned()
                .ok_or_else(|| {
                    SipError::MalformedMessage(format!("no match for {}: {}", name, header_value))
                })
        };

        Ok(Self {
            algorithm: required("algorithm")?,
            realm: required("realm")?,
            nonce: required("nonce")?,
            qop: required("qop")?,
        })
    }
}

/// Split `key=value` pairs on commas outside quotes; keys are lowercased, quotes trimmed
fn parse_digest_params(header_value: &str) -> HashMap<String, String> {
    let value = header_value.trim();
    let value = match value.get(..7) {
        Some(scheme) if scheme.eq_ignore_ascii_case("digest ") => &value[7..],
        _ => value,
    };

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in value.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);

    parts
        .iter()
        .filter_map(|part| part.trim().split_once('='))
        .map(|(key, value)| {
            (
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            )
        })
        .collect()
}

/// Hash function named by the challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    /// Case-insensitive lookup; unknown names are a fatal configuration error
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "MD5" => Ok(DigestAlgorithm::Md5),
            "SHA-256" | "SHA256" => Ok(DigestAlgorithm::Sha256),
            _ => Err(SipError::UnsupportedAlgorithm(name.to_string())),
        }
    }

    /// base64(hash(data))
    pub fn digest_base64(&self, data: &str) -> String {
        match self {
            DigestAlgorithm::Md5 => STANDARD.encode(md5::compute(data.as_bytes()).0),
            DigestAlgorithm::Sha256 => STANDARD.encode(Sha256::digest(data.as_bytes())),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestAlgorithm::Md5 => write!(f, "MD5"),
            DigestAlgorithm::Sha256 => write!(f, "SHA-256"),
        }
    }
}

/// Digest response plus the client nonce it was computed with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationResponse {
    pub response: String,
    pub client_nonce: String,
}

/// Nonce count as six lowercase hex digits
pub fn nonce_count_hex(nonce_count: u32) -> String {
    format!("{:06x}", nonce_count)
}

/// Fresh client nonce: 12 random bytes, base64 encoded
pub fn generate_client_nonce() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

pub struct DigestAuthenticator;

impl DigestAuthenticator {
    /// Compute the challenge response
    ///
    /// ```text
    /// H1       = H(username ":" realm ":" password)
    /// H2       = H(method ":" uri)
    /// response = H(H1 ":" nonce ":" nc ":" cnonce ":" qop ":" H2)
    /// ```
    /// with `qop` fixed to `auth`.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_response(
        challenge: &AuthenticationChallenge,
        method: &str,
        uri: &str,
        username: &str,
        password: &str,
        nonce_count: u32,
        client_nonce: &str,
    ) -> Result<AuthorizationResponse> {
        let algorithm = DigestAlgorithm::from_name(&challenge.algorithm)?;

        let hash1 = algorithm.digest_base64(&format!("{}:{}:{}", username, challenge.realm, password));
        let hash2 = algorithm.digest_base64(&format!("{}:{}", method, uri));
        let response = algorithm.digest_base64(&format!(
            "{}:{}:{}:{}:{}:{}",
            hash1,
            challenge.nonce,
            nonce_count_hex(nonce_count),
            client_nonce,
            QOP_AUTH,
            hash2
        ));

        trace!("Calculated {} response for user {}: {}", algorithm, username, response);

        Ok(AuthorizationResponse {
            response,
            client_nonce: client_nonce.to_string(),
        })
    }

    /// Same as `compute_response` with a freshly generated client nonce
    pub fn respond(
        challenge: &AuthenticationChallenge,
        method: &str,
        uri: &str,
        username: &str,
        password: &str,
        nonce_count: u32,
    ) -> Result<AuthorizationResponse> {
        Self::compute_response(
            challenge,
            method,
            uri,
            username,
            password,
            nonce_count,
            &generate_client_nonce(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge() -> AuthenticationChallenge {
        AuthenticationChallenge::parse(
            r#"Digest realm="sip.example.com", nonce="abcd1234", algorithm=MD5, qop="auth""#,
        )
        .unwrap()
    }

    fn md5_b64(data: &str) -> String {
        STANDARD.encode(md5::compute(data).0)
    }

    #[test]
    fn test_parse_challenge() {
        let challenge = challenge();
        assert_eq!(challenge.realm, "sip.example.com");
        assert_eq!(challenge.nonce, "abcd1234");
        assert_eq!(challenge.algorithm, "MD5");
        assert_eq!(challenge.qop, "auth");
    }

    #[test]
    fn test_parse_challenge_with_quoted_commas() {
        let challenge = AuthenticationChallenge::parse(
            r#"Digest realm="tel.example.com",nonce="Xy1",qop="auth,auth-int",algorithm=md5,opaque="o""#,
        )
        .unwrap();

        assert_eq!(challenge.qop, "auth,auth-int");
        assert_eq!(challenge.algorithm, "md5");
    }

    #[test]
    fn test_missing_field_is_malformed() {
        let err = AuthenticationChallenge::parse(r#"Digest realm="r", nonce="n", algorithm=MD5"#)
            .unwrap_err();
        assert!(matches!(err, SipError::MalformedMessage(ref m) if m.contains("qop")));

        let err =
            AuthenticationChallenge::parse(r#"Digest realm="r", qop="auth", algorithm=MD5"#).unwrap_err();
        assert!(matches!(err, SipError::MalformedMessage(ref m) if m.contains("nonce")));
    }

    #[test]
    fn test_response_matches_independent_recomputation() {
        let result = DigestAuthenticator::compute_response(
            &challenge(),
            "REGISTER",
            "sip:sip.example.com",
            "alice",
            "secret",
            1,
            "c2xpZW50bm9uY2U=",
        )
        .unwrap();

        let h1 = md5_b64("alice:sip.example.com:secret");
        let h2 = md5_b64("REGISTER:sip:sip.example.com");
        let expected = md5_b64(&format!("{}:abcd1234:000001:c2xpZW50bm9uY2U=:auth:{}", h1, h2));

        assert_eq!(result.response, expected);
        assert_eq!(result.response.len(), 24);
        assert_ne!(result.response, h1);
        assert_ne!(result.response, h2);
        assert_eq!(result.client_nonce, "c2xpZW50bm9uY2U=");
    }

    #[test]
    fn test_response_is_deterministic_for_fixed_nonce() {
        let compute = || {
            DigestAuthenticator::compute_response(
                &challenge(),
                "REGISTER",
                "sip:sip.example.com",
                "alice",
                "secret",
                1,
                "fixed",
            )
            .unwrap()
        };

        assert_eq!(compute(), compute());
    }

    #[test]
    fn test_fresh_client_nonces_change_response() {
        let respond = || {
            DigestAuthenticator::respond(&challenge(), "REGISTER", "sip:sip.example.com", "alice", "secret", 1)
                .unwrap()
        };

        let first = respond();
        let second = respond();
        assert_ne!(first.client_nonce, second.client_nonce);
        assert_ne!(first.response, second.response);
        assert_eq!(first.client_nonce.len(), 16);
    }

    #[test]
    fn test_algorithm_is_case_insensitive() {
        assert_eq!(DigestAlgorithm::from_name("md5").unwrap(), DigestAlgorithm::Md5);
        assert_eq!(DigestAlgorithm::from_name("sha-256").unwrap(), DigestAlgorithm::Sha256);
    }

    #[test]
    fn test_unsupported_algorithm_is_fatal() {
        let mut challenge = challenge();
        challenge.algorithm = "AKAv1-MD5".to_string();

        let err = DigestAuthenticator::compute_response(
            &challenge,
            "REGISTER",
            "sip:sip.example.com",
            "alice",
            "secret",
            1,
            "cnonce",
        )
        .unwrap_err();

        assert!(matches!(err, SipError::UnsupportedAlgorithm(ref name) if name == "AKAv1-MD5"));
    }

    #[test]
    fn test_nonce_count_hex() {
        assert_eq!(nonce_count_hex(1), "000001");
        assert_eq!(nonce_count_hex(255), "0000ff");
    }
}
