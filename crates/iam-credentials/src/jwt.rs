//! Encode, sign, and decode NATS JWTs.
//!
//! Wire format: `base64url(header).base64url(claims).base64url(sig)` with the
//! fixed `ed25519-nkey` header. The `jti` is the base32hex-encoded SHA-256 of
//! the claim body serialized with an empty `jti`, computed before the final
//! serialization, matching the substrate's canonical encoding.

use std::time::{SystemTime, UNIX_EPOCH};

use data_encoding::{BASE32HEX_NOPAD, BASE64URL_NOPAD};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use crate::claims::{AuthRequestClaims, GenericClaims, parse_claims};
use crate::errors::{CredentialError, CredentialResult};
use crate::keys::SigningKey;

const JWT_HEADER: &str = r#"{"typ":"JWT","alg":"ed25519-nkey"}"#;

#[derive(Debug, serde::Deserialize)]
struct JwtHeader {
    #[serde(default)]
    typ: String,
    alg: String,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Sign `claims` with `key`, filling in `iss`, `iat`, and `jti`.
pub fn sign_claims<T: Serialize + Clone>(
    claims: &GenericClaims<T>,
    key: &SigningKey,
) -> CredentialResult<String> {
    let mut claims = claims.clone();
    claims.iss = key.public_key();
    claims.iat = now_unix();
    claims.jti = String::new();

    let unhashed = serde_json::to_string(&claims)?;
    let mut hasher = Sha256::new();
    hasher.update(unhashed.as_bytes());
    claims.jti = BASE32HEX_NOPAD.encode(&hasher.finalize());

    let body = serde_json::to_string(&claims)?;
    let signing_input = format!(
        "{}.{}",
        BASE64URL_NOPAD.encode(JWT_HEADER.as_bytes()),
        BASE64URL_NOPAD.encode(body.as_bytes())
    );
    let signature = key.sign(signing_input.as_bytes())?;
    Ok(format!(
        "{}.{}",
        signing_input,
        BASE64URL_NOPAD.encode(&signature)
    ))
}

/// Decode a NATS JWT, verifying its signature against the embedded issuer.
pub fn decode_claims<T: DeserializeOwned>(token: &str) -> CredentialResult<GenericClaims<T>> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(CredentialError::MalformedJwt(format!(
            "expected 3 segments, found {}",
            parts.len()
        )));
    }

    let header_bytes = BASE64URL_NOPAD
        .decode(parts[0].as_bytes())
        .map_err(|err| CredentialError::MalformedJwt(format!("header: {err}")))?;
    let header: JwtHeader = serde_json::from_slice(&header_bytes)?;
    if header.alg != "ed25519-nkey" {
        return Err(CredentialError::UnsupportedAlgorithm(header.alg));
    }
    if !header.typ.is_empty() && !header.typ.eq_ignore_ascii_case("jwt") {
        return Err(CredentialError::MalformedJwt(format!(
            "unexpected typ '{}'",
            header.typ
        )));
    }

    let body_bytes = BASE64URL_NOPAD
        .decode(parts[1].as_bytes())
        .map_err(|err| CredentialError::MalformedJwt(format!("claims: {err}")))?;
    let claims: GenericClaims<T> = parse_claims(&body_bytes)?;

    let signature = BASE64URL_NOPAD
        .decode(parts[2].as_bytes())
        .map_err(|err| CredentialError::MalformedJwt(format!("signature: {err}")))?;
    let issuer = SigningKey::from_public_key(&claims.iss)?;
    let signing_input = format!("{}.{}", parts[0], parts[1]);
    issuer.verify(signing_input.as_bytes(), &signature)?;

    Ok(claims)
}

/// Decode and verify an inbound authorization request.
pub fn decode_auth_request(token: &str) -> CredentialResult<AuthRequestClaims> {
    decode_claims(token)
}
