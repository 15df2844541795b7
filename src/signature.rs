//! Envelope signing and verification
//!
//! Envelopes cross the broker as RS256-signed bearer tokens. The issuer is
//! always the agent's logical name; the verifier locates the issuer's public
//! key in a configured directory, so key distribution stays a deploy-time
//! concern with no rotation protocol.

use crate::error::{Result, SignatureError};
use crate::protocol::Envelope;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Token lifetime: `exp = iat + 5 min`
pub const TOKEN_TTL_SECS: i64 = 300;

/// Claims carried by a signed envelope token
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub env: Option<Envelope>,
}

/// Signs envelopes into bearer tokens with a private RSA key
pub struct EnvelopeSigner {
    audience: String,
    key: EncodingKey,
}

impl EnvelopeSigner {
    /// Load the signing key from a PEM file. A missing key is a startup-fatal
    /// condition for any agent.
    pub fn from_pem_file<P: AsRef<Path>>(path: P, audience: &str) -> Result<Self> {
        let path = path.as_ref();
        let pem = std::fs::read(path)
            .map_err(|_| SignatureError::MissingKey(path.display().to_string()))?;
        let key = EncodingKey::from_rsa_pem(&pem)
            .map_err(|e| SignatureError::BadKey(e.to_string()))?;
        Ok(Self {
            audience: audience.to_string(),
            key,
        })
    }

    /// Sign an envelope on behalf of `issuer` (the agent's logical name).
    /// Each call stamps a fresh `iat`/`exp`, so retransmitted envelopes carry
    /// fresh expirations.
    pub fn sign(&self, envelope: &Envelope, issuer: &str) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: issuer.to_string(),
            aud: self.audience.clone(),
            iat: now,
            exp: now + TOKEN_TTL_SECS,
            env: Some(envelope.clone()),
        };
        let token = encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| SignatureError::Encoding(e.to_string()))?;
        Ok(token)
    }
}

/// Verifies bearer tokens against per-issuer public keys
pub struct TokenVerifier {
    public_keys_dir: PathBuf,
    audience: Option<String>,
}

impl TokenVerifier {
    /// `audience = None` disables the `aud` check (agents accept tokens
    /// addressed to the broker on their inboxes, since routing passes the
    /// original token through).
    pub fn new<P: AsRef<Path>>(public_keys_dir: P, audience: Option<&str>) -> Self {
        Self {
            public_keys_dir: public_keys_dir.as_ref().to_path_buf(),
            audience: audience.map(String::from),
        }
    }

    /// Verify a token and return its envelope claim.
    pub fn verify(&self, token: &str) -> Result<Envelope> {
        let issuer = peek_issuer(token)?;
        let key_path = self
            .candidate_paths(&issuer)
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| SignatureError::UnknownIssuer(issuer.clone()))?;
        let pem = std::fs::read(&key_path)
            .map_err(|e| SignatureError::BadKey(e.to_string()))?;
        let key = DecodingKey::from_rsa_pem(&pem)
            .map_err(|e| SignatureError::BadKey(e.to_string()))?;

        let mut validation = Validation::new(Algorithm::RS256);
        match &self.audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }

        let data = decode::<Claims>(token, &key, &validation)
            .map_err(|e| SignatureError::Rejected(e.to_string()))?;
        let envelope = data.claims.env.ok_or(SignatureError::MissingEnvelope)?;
        Ok(envelope)
    }

    /// Candidate public key filenames in priority order, first match wins
    fn candidate_paths(&self, issuer: &str) -> [PathBuf; 3] {
        [
            self.public_keys_dir.join(format!("{}_public.pem", issuer)),
            self.public_keys_dir.join(format!("{}.pub.pem", issuer)),
            self.public_keys_dir.join(format!("{}.pem", issuer)),
        ]
    }
}

/// Read `iss` from the token payload without verifying the signature; the
/// issuer determines which public key to verify against.
fn peek_issuer(token: &str) -> Result<String> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return Err(SignatureError::Malformed.into()),
    };
    let raw = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| SignatureError::Malformed)?;
    let claims: serde_json::Value =
        serde_json::from_slice(&raw).map_err(|_| SignatureError::Malformed)?;
    claims
        .get("iss")
        .and_then(serde_json::Value::as_str)
        .map(String::from)
        .ok_or_else(|| SignatureError::Rejected("missing 'iss' claim".to_string()).into())
}
