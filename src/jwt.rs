use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

const ALGORITHM_RS256: &str = "RS256";

/// Token validation failures. The auth stage maps every kind to a uniform
/// 401 so token-failure reasons never leak to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    /// Malformed token, wrong algorithm, or issuer mismatch
    Invalid,
    /// Signature does not verify against the configured public key
    InvalidSignature,
    /// Token expiry is in the past
    Expired,
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid => write!(f, "invalid token"),
            Self::InvalidSignature => write!(f, "invalid signature"),
            Self::Expired => write!(f, "token expired"),
        }
    }
}

impl std::error::Error for TokenError {}

#[derive(Debug, Deserialize)]
struct Header {
    alg: String,
}

/// Claims carried by a validated token. Derived solely from validated
/// tokens and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// User identity
    #[serde(default)]
    pub sub: String,
    /// Client identifier used as the rate-limit key when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Unix expiry in seconds; 0 disables the expiry check
    #[serde(default)]
    pub exp: i64,
    /// Token issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// Validates RS256 tokens against a PEM-encoded RSA public key.
pub struct TokenValidator {
    public_key: RsaPublicKey,
    issuer: Option<String>,
}

impl TokenValidator {
    /// Load the public key from a PEM (SPKI) file. Fails if the file is
    /// missing, malformed, or not an RSA key.
    pub fn from_pem_file(path: impl AsRef<Path>, issuer: Option<String>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let pem = std::fs::read_to_string(path).map_err(|err| {
            anyhow::anyhow!("failed to read public key {}: {}", path.display(), err)
        })?;
        Self::from_pem(&pem, issuer)
    }

    pub fn from_pem(pem: &str, issuer: Option<String>) -> anyhow::Result<Self> {
        let public_key = RsaPublicKey::from_public_key_pem(pem)
            .map_err(|err| anyhow::anyhow!("failed to parse RSA public key: {}", err))?;
        Ok(Self { public_key, issuer })
    }

    /// Verify a token and return its claims. Steps in order: split into
    /// three segments, check the header algorithm, decode the claims,
    /// verify the RS256 signature over `header.payload`, then check expiry
    /// and (if configured) issuer.
    pub fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        let mut parts = token.split('.');
        let (header_b64, payload_b64, signature_b64) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(h), Some(p), Some(s), None) => (h, p, s),
                _ => return Err(TokenError::Invalid),
            };

        let header_bytes = decode_segment(header_b64).map_err(|_| TokenError::Invalid)?;
        let header: Header =
            serde_json::from_slice(&header_bytes).map_err(|_| TokenError::Invalid)?;
        if header.alg != ALGORITHM_RS256 {
            return Err(TokenError::Invalid);
        }

        let payload = decode_segment(payload_b64).map_err(|_| TokenError::Invalid)?;
        let claims: Claims = serde_json::from_slice(&payload).map_err(|_| TokenError::Invalid)?;

        let signature = decode_segment(signature_b64).map_err(|_| TokenError::Invalid)?;
        let signed_content = format!("{}.{}", header_b64, payload_b64);
        let hashed = Sha256::digest(signed_content.as_bytes());
        self.public_key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &hashed, &signature)
            .map_err(|_| TokenError::InvalidSignature)?;

        if claims.exp > 0 && unix_now() > claims.exp {
            return Err(TokenError::Expired);
        }

        if let Some(expected) = &self.issuer {
            if claims.iss.as_deref() != Some(expected.as_str()) {
                return Err(TokenError::Invalid);
            }
        }

        Ok(claims)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Base64url-decode a segment, restoring stripped `=` padding first.
fn decode_segment(segment: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let mut padded = segment.to_string();
    match segment.len() % 4 {
        2 => padded.push_str("=="),
        3 => padded.push('='),
        _ => {}
    }
    URL_SAFE.decode(padded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use rsa::pkcs8::DecodePrivateKey;
    use rsa::RsaPrivateKey;

    const PUBLIC_PEM: &str = include_str!("../tests/fixtures/jwt_test_public.pem");
    const PRIVATE_PEM: &str = include_str!("../tests/fixtures/jwt_test_private.pem");

    fn sign_token(claims: &serde_json::Value) -> String {
        sign_token_with_header(&serde_json::json!({"alg": "RS256", "typ": "JWT"}), claims)
    }

    fn sign_token_with_header(header: &serde_json::Value, claims: &serde_json::Value) -> String {
        let key = RsaPrivateKey::from_pkcs8_pem(PRIVATE_PEM).unwrap();
        let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header).unwrap());
        let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
        let signed_content = format!("{}.{}", header_b64, payload_b64);
        let hashed = Sha256::digest(signed_content.as_bytes());
        let signature = key.sign(Pkcs1v15Sign::new::<Sha256>(), &hashed).unwrap();
        format!("{}.{}", signed_content, URL_SAFE_NO_PAD.encode(signature))
    }

    fn validator() -> TokenValidator {
        TokenValidator::from_pem(PUBLIC_PEM, None).unwrap()
    }

    fn future_exp() -> i64 {
        unix_now() + 3600
    }

    #[test]
    fn test_valid_token_round_trips_claims() {
        let token = sign_token(&serde_json::json!({
            "sub": "user-1",
            "client_id": "c1",
            "exp": future_exp(),
            "iss": "gateway-test",
        }));

        let claims = validator().validate(&token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.client_id.as_deref(), Some("c1"));
        assert_eq!(claims.iss.as_deref(), Some("gateway-test"));
    }

    #[test]
    fn test_expired_token() {
        let token = sign_token(&serde_json::json!({
            "sub": "user-1",
            "exp": unix_now() - 60,
        }));
        assert_eq!(validator().validate(&token), Err(TokenError::Expired));
    }

    #[test]
    fn test_zero_exp_disables_expiry_check() {
        let token = sign_token(&serde_json::json!({"sub": "user-1", "exp": 0}));
        assert!(validator().validate(&token).is_ok());
    }

    #[test]
    fn test_missing_segment() {
        assert_eq!(
            validator().validate("onlyheader.payload"),
            Err(TokenError::Invalid)
        );
        assert_eq!(validator().validate("a.b.c.d"), Err(TokenError::Invalid));
    }

    #[test]
    fn test_wrong_algorithm_rejected() {
        let token = sign_token_with_header(
            &serde_json::json!({"alg": "HS256", "typ": "JWT"}),
            &serde_json::json!({"sub": "user-1", "exp": future_exp()}),
        );
        assert_eq!(validator().validate(&token), Err(TokenError::Invalid));
    }

    #[test]
    fn test_signature_bit_flip_rejected() {
        let token = sign_token(&serde_json::json!({"sub": "user-1", "exp": future_exp()}));
        let (content, sig_b64) = token.rsplit_once('.').unwrap();
        let mut sig = decode_segment(sig_b64).unwrap();
        sig[0] ^= 0x01;
        let tampered = format!("{}.{}", content, URL_SAFE_NO_PAD.encode(sig));
        assert_eq!(
            validator().validate(&tampered),
            Err(TokenError::InvalidSignature)
        );
    }

    #[test]
    fn test_payload_tampering_rejected() {
        let token = sign_token(&serde_json::json!({"sub": "user-1", "exp": future_exp()}));
        let parts: Vec<&str> = token.split('.').collect();
        let forged_payload = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&serde_json::json!({"sub": "admin", "exp": future_exp()})).unwrap(),
        );
        let tampered = format!("{}.{}.{}", parts[0], forged_payload, parts[2]);
        assert_eq!(
            validator().validate(&tampered),
            Err(TokenError::InvalidSignature)
        );
    }

    #[test]
    fn test_issuer_mismatch() {
        let strict = TokenValidator::from_pem(PUBLIC_PEM, Some("expected".to_string())).unwrap();
        let token = sign_token(&serde_json::json!({
            "sub": "user-1",
            "exp": future_exp(),
            "iss": "other",
        }));
        assert_eq!(strict.validate(&token), Err(TokenError::Invalid));

        let matching = sign_token(&serde_json::json!({
            "sub": "user-1",
            "exp": future_exp(),
            "iss": "expected",
        }));
        assert!(strict.validate(&matching).is_ok());
    }

    #[test]
    fn test_missing_key_file() {
        assert!(TokenValidator::from_pem_file("/nonexistent/public.pem", None).is_err());
    }

    #[test]
    fn test_malformed_pem() {
        assert!(TokenValidator::from_pem("not a pem", None).is_err());
    }
}
