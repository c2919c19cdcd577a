//! OIDC token verification against the configured identity providers.
//!
//! One verifier exists per IdP, built at startup from the issuer's discovery
//! document. Verification checks the token signature against the IdP's JWKS
//! (cached with a TTL, refreshed once on an unknown `kid`), then applies the
//! broker's own time-window and per-IdP validation rules. Dispatch walks the
//! verifiers in configuration order and the first full success wins.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::auth::claims::IdpClaims;
use crate::config::{Config, DurationBounds, IdpConfig};

const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 3600);
const CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);
const JWKS_TTL: Duration = Duration::from_secs(3600);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

const SUPPORTED_ALGS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::ES256,
    Algorithm::ES384,
];

#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("oidc discovery failed for idp '{description}' ({issuer}): {detail}")]
    Setup {
        description: String,
        issuer: String,
        detail: String,
    },
    #[error("token used too late. check clock skew?")]
    Expired,
    #[error("token used too early. check clock skew?")]
    NotYetValid,
    #[error("missing 'issued at' time in token")]
    MissingIssuedAt,
    #[error("missing 'expiry' time in token")]
    MissingExpiry,
    #[error("expiry too far in future")]
    LifetimeTooLong,
    #[error("jwt algorithm not supported: {0}")]
    UnsupportedAlgorithm(String),
    #[error("no jwks key matches the token")]
    JwksKeyNotFound,
    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Validation(String),
    #[error("user info fetch failed: {0}")]
    UserInfo(String),
    #[error("no idp verifier accepted the token")]
    NoVerifierMatched,
}

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    issuer: String,
    jwks_uri: String,
    #[serde(default)]
    userinfo_endpoint: Option<String>,
}

#[derive(Clone, Debug)]
struct CachedJwks {
    jwks: JwkSet,
    expires_at: Instant,
}

/// A verifier for one configured IdP plus the configuration it was built
/// from. Shared read-only across request handlers.
#[derive(Debug)]
pub struct IdpEntry {
    pub verifier: IdpVerifier,
    pub config: IdpConfig,
}

#[derive(Debug)]
pub struct IdpVerifier {
    issuer_url: String,
    client_id: String,
    jwks_url: String,
    userinfo_endpoint: Option<String>,
    client: reqwest::Client,
    jwks_cache: Arc<DashMap<String, CachedJwks>>,
    max_token_lifetime: Duration,
    clock_skew: Duration,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

pub fn http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()
}

/// Build a verifier per configured IdP.
///
/// A provider whose discovery fails is fatal unless it opted into
/// `ignore_setup_error`, in which case it is skipped with a warning.
pub async fn build_verifiers(
    client: &reqwest::Client,
    config: &Config,
) -> Result<Vec<IdpEntry>, VerifierError> {
    let mut entries = Vec::with_capacity(config.idp.len());
    for idp in &config.idp {
        match IdpVerifier::discover(client.clone(), idp).await {
            Ok(verifier) => entries.push(IdpEntry {
                verifier,
                config: idp.clone(),
            }),
            Err(err) if idp.ignore_setup_error => {
                warn!(
                    idp = idp.description.as_str(),
                    issuer = idp.issuer_url.as_str(),
                    error = %err,
                    "skipping idp, discovery failed"
                );
            }
            Err(err) => return Err(err),
        }
    }
    if entries.is_empty() {
        warn!("no idp verifiers available; every authorization request will be rejected");
    }
    Ok(entries)
}

/// Try each verifier in configuration order; the first one whose signature
/// check and per-IdP validation both pass wins.
pub async fn run_verification<'a>(
    token: &str,
    verifiers: &'a [IdpEntry],
) -> Result<(IdpClaims, &'a IdpEntry), VerifierError> {
    for entry in verifiers {
        let claims = match entry.verifier.verify(token, &entry.config).await {
            Ok(claims) => claims,
            Err(VerifierError::Expired) => {
                debug!(
                    idp = entry.config.description.as_str(),
                    "idp token expired"
                );
                continue;
            }
            Err(err) => {
                trace!(
                    idp = entry.config.description.as_str(),
                    error = %err,
                    "idp verification failed"
                );
                continue;
            }
        };

        match validate_against_spec(&claims, &entry.config) {
            Ok(()) => return Ok((claims, entry)),
            Err(err) => {
                trace!(
                    idp = entry.config.description.as_str(),
                    error = %err,
                    "idp validation spec failed"
                );
                continue;
            }
        }
    }
    Err(VerifierError::NoVerifierMatched)
}

impl IdpVerifier {
    pub async fn discover(
        client: reqwest::Client,
        idp: &IdpConfig,
    ) -> Result<Self, VerifierError> {
        let setup_err = |detail: String| VerifierError::Setup {
            description: idp.description.clone(),
            issuer: idp.issuer_url.clone(),
            detail,
        };

        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            idp.issuer_url.trim_end_matches('/')
        );
        let response = client
            .get(&discovery_url)
            .send()
            .await
            .map_err(|err| setup_err(err.to_string()))?;
        if !response.status().is_success() {
            return Err(setup_err(format!(
                "discovery returned status {}",
                response.status()
            )));
        }
        let doc: DiscoveryDocument = response
            .json()
            .await
            .map_err(|err| setup_err(err.to_string()))?;

        if doc.issuer.trim_end_matches('/') != idp.issuer_url.trim_end_matches('/') {
            return Err(setup_err(format!(
                "issuer mismatch: discovery document names '{}'",
                doc.issuer
            )));
        }

        Ok(Self {
            issuer_url: idp.issuer_url.clone(),
            client_id: idp.client_id.clone(),
            jwks_url: doc.jwks_uri,
            userinfo_endpoint: doc.userinfo_endpoint,
            client,
            jwks_cache: Arc::new(DashMap::new()),
            max_token_lifetime: MAX_TOKEN_LIFETIME,
            clock_skew: CLOCK_SKEW,
        })
    }

    /// Verify one token: signature, issuer, audience-vs-client-id, and the
    /// broker's time windows. Returns the normalized claim set.
    pub async fn verify(&self, token: &str, idp: &IdpConfig) -> Result<IdpClaims, VerifierError> {
        let header = decode_header(token)?;
        if !SUPPORTED_ALGS.contains(&header.alg) {
            return Err(VerifierError::UnsupportedAlgorithm(format!(
                "{:?}",
                header.alg
            )));
        }

        let decoding_key = self.decoding_key_for(header.kid.as_deref()).await?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[self.issuer_url.as_str()]);
        // The broker applies its own expiry and audience rules below.
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        let data = decode::<Value>(token, &decoding_key, &validation)?;
        let raw = data
            .claims
            .as_object()
            .cloned()
            .unwrap_or_else(Map::new);

        let claims = IdpClaims::from_raw(&raw, &idp.effective_custom_mapping());

        // The id token must be addressed to the client this verifier was
        // configured for.
        if !claims.audience.iter().any(|aud| aud == &self.client_id) {
            return Err(VerifierError::Validation(format!(
                "token audience {:?} does not include client id '{}'",
                claims.audience, self.client_id
            )));
        }

        self.validate_times(claims.issued_at, claims.expiry, now_unix())?;
        Ok(claims)
    }

    async fn decoding_key_for(&self, kid: Option<&str>) -> Result<DecodingKey, VerifierError> {
        let jwks = self.cached_jwks().await?;
        if let Some(jwk) = find_jwk(&jwks, kid) {
            return Ok(DecodingKey::from_jwk(jwk)?);
        }
        // Unknown kid: the provider may have rotated keys; refresh once.
        let jwks = self.refresh_jwks().await?;
        let jwk = find_jwk(&jwks, kid).ok_or(VerifierError::JwksKeyNotFound)?;
        Ok(DecodingKey::from_jwk(jwk)?)
    }

    async fn cached_jwks(&self) -> Result<JwkSet, VerifierError> {
        if let Some(entry) = self.jwks_cache.get(&self.jwks_url)
            && entry.expires_at > Instant::now()
        {
            return Ok(entry.jwks.clone());
        }
        self.refresh_jwks().await
    }

    async fn refresh_jwks(&self) -> Result<JwkSet, VerifierError> {
        let jwks: JwkSet = self
            .client
            .get(&self.jwks_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        self.jwks_cache.insert(
            self.jwks_url.clone(),
            CachedJwks {
                jwks: jwks.clone(),
                expires_at: Instant::now() + JWKS_TTL,
            },
        );
        Ok(jwks)
    }

    fn validate_times(&self, issued_at: i64, expiry: i64, now: i64) -> Result<(), VerifierError> {
        if issued_at < 1 {
            return Err(VerifierError::MissingIssuedAt);
        }
        if expiry < 1 {
            return Err(VerifierError::MissingExpiry);
        }
        if expiry > now + self.max_token_lifetime.as_secs() as i64 {
            return Err(VerifierError::LifetimeTooLong);
        }

        let skew = self.clock_skew.as_secs() as i64;
        if now < issued_at - skew {
            return Err(VerifierError::NotYetValid);
        }
        if now > expiry + skew {
            return Err(VerifierError::Expired);
        }
        Ok(())
    }

    /// Fetch the userinfo endpoint after checking the access token against
    /// the id token's `at_hash` (left half of its SHA-256, base64url).
    pub async fn fetch_user_info(
        &self,
        access_token: &str,
        claims: &IdpClaims,
    ) -> Result<Map<String, Value>, VerifierError> {
        let endpoint = self
            .userinfo_endpoint
            .as_deref()
            .ok_or_else(|| VerifierError::UserInfo("idp advertises no userinfo endpoint".into()))?;

        if claims.access_token_hash.is_empty() {
            return Err(VerifierError::UserInfo(
                "id token carries no at_hash to bind the access token".into(),
            ));
        }
        let digest = Sha256::digest(access_token.as_bytes());
        let expected = URL_SAFE_NO_PAD.encode(&digest[..digest.len() / 2]);
        if expected != claims.access_token_hash {
            return Err(VerifierError::UserInfo(
                "access token does not match the id token's at_hash".into(),
            ));
        }

        let response = self
            .client
            .get(endpoint)
            .bearer_auth(access_token)
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        body.as_object()
            .cloned()
            .ok_or_else(|| VerifierError::UserInfo("userinfo response is not an object".into()))
    }
}

fn find_jwk<'a>(jwks: &'a JwkSet, kid: Option<&str>) -> Option<&'a jsonwebtoken::jwk::Jwk> {
    match kid {
        Some(kid) => jwks
            .keys
            .iter()
            .find(|key| key.common.key_id.as_deref() == Some(kid)),
        None => jwks.keys.first(),
    }
}

/// Apply the per-IdP validation spec to an already-verified claim set.
pub fn validate_against_spec(claims: &IdpClaims, idp: &IdpConfig) -> Result<(), VerifierError> {
    let spec = &idp.validation;

    if let Some(missing) = claims.missing_claim(&spec.required_claims) {
        return Err(VerifierError::Validation(format!(
            "missing or empty claim '{missing}' in idp token"
        )));
    }

    if !spec.skip_audience_validation
        && !spec.audience.is_empty()
        && !claims.audience_intersects(&spec.audience)
    {
        return Err(VerifierError::Validation(format!(
            "idp 'aud' {:?} does not intersect expected {:?}",
            claims.audience, spec.audience
        )));
    }

    validate_expiry_bounds(claims, &spec.token_bounds)?;
    Ok(())
}

fn validate_expiry_bounds(
    claims: &IdpClaims,
    bounds: &DurationBounds,
) -> Result<(), VerifierError> {
    let min = bounds.min.or_zero();
    let max = bounds.max.or_zero();
    if min.is_zero() && max.is_zero() {
        return Ok(());
    }

    let remaining = claims.expiry - now_unix();
    if !min.is_zero() && remaining < min.as_secs() as i64 {
        return Err(VerifierError::Validation(format!(
            "idp 'exp' too short: must have at least {}s remaining, found {remaining}s",
            min.as_secs()
        )));
    }
    if !max.is_zero() && remaining > max.as_secs() as i64 {
        return Err(VerifierError::Validation(format!(
            "idp 'exp' too long: must expire within {}s, found {remaining}s",
            max.as_secs()
        )));
    }
    Ok(())
}
