//! The authorization request pipeline.
//!
//! One inbound message travels: open sealed envelope (when the server
//! presents its xkey) → decode the authorization-request JWT → extract the
//! IdP bearer token from the connect options → multi-IdP verification →
//! optional user-info enrichment → per-request config render → role-binding
//! resolution → credential mint and signing → signed (and possibly
//! re-sealed) response. Every failure after decode still produces a signed
//! response carrying an `error` field; the request is then considered
//! handled.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context as _, anyhow, bail};
use async_trait::async_trait;
use iam_credentials::{
    AuthRequestClaims, AuthResponseClaims, SigningKey, UserClaims, decode_auth_request,
    redact_key, sign_claims,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, error, trace, warn};

use crate::auth::claims::IdpClaims;
use crate::auth::expiry::calculate_expiration;
use crate::auth::rbac::{PolicyError, resolve_access};
use crate::auth::verifier::{IdpEntry, run_verification};
use crate::config::{Config, ConfigManager, UserAccountInfo};

/// Header carrying the server's public exchange key on sealed requests.
pub const XKEY_HEADER: &str = "Nats-Server-Xkey";

#[derive(Debug, Clone, Copy, Default)]
pub struct BrokerOptions {
    /// Log raw tokens and claim maps. Off outside debugging sessions.
    pub log_sensitive: bool,
}

/// Outbound port for audit events so tests can intercept them.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn publish(&self, subject: String, payload: Vec<u8>) -> anyhow::Result<()>;
}

/// What the transport adapter should send back.
#[derive(Debug)]
pub enum Reply {
    Payload(Vec<u8>),
    /// Protocol-level failure before a response could be constructed.
    Error { code: u16, message: String },
}

/// OAuth2 token response shape optionally carried in the connect options.
#[derive(Debug, Default, Deserialize)]
struct TokenEnvelope {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    id_token: String,
}

/// Which of the account's keys signed the credential.
#[derive(Debug, Clone)]
pub struct SigningKeyInfo {
    pub key_type: &'static str,
    pub public_key: String,
}

pub struct AuthService {
    config_manager: Arc<ConfigManager>,
    base_config: Arc<Config>,
    verifiers: Arc<Vec<IdpEntry>>,
    response_signing_key: SigningKey,
    encryption_key: Option<iam_credentials::ExchangeKey>,
    audit: Arc<dyn AuditSink>,
    options: BrokerOptions,
}

struct MintOutcome {
    user_jwt: String,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Pull the IdP bearer token (and any OAuth2 access token) out of the
/// connect options. Both the `token` and `password` fields may carry either
/// a JSON token-response envelope or a raw JWT.
fn extract_bearer(token: &str, password: &str) -> (String, String) {
    let candidate = if !token.is_empty() { token } else { password };
    match serde_json::from_str::<TokenEnvelope>(candidate) {
        Ok(envelope) if !envelope.id_token.is_empty() => {
            (envelope.id_token, envelope.access_token)
        }
        _ => (candidate.to_string(), String::new()),
    }
}

/// Decide whether `signing_key` is the account's own key or its authorized
/// signing key; any other key is rejected.
pub fn determine_signing_key(
    claims: &UserClaims,
    signing_key: &SigningKey,
    account: &UserAccountInfo,
) -> anyhow::Result<SigningKeyInfo> {
    let signing_pub = signing_key.public_key();

    if claims.nats.issuer_account == signing_pub {
        trace!("signing key matches account public key directly");
        return Ok(SigningKeyInfo {
            key_type: "pub_key",
            public_key: signing_pub,
        });
    }

    match account.signing_nkey.get() {
        Some(authorized) => {
            let authorized_pub = authorized.public_key();
            if authorized_pub == signing_pub {
                trace!("signing key matches account signing key");
                Ok(SigningKeyInfo {
                    key_type: "signing_key",
                    public_key: authorized_pub,
                })
            } else {
                bail!("signing key does not match account public key or signing key")
            }
        }
        None => bail!("account signing key not available and key does not match account public key"),
    }
}

impl AuthService {
    pub fn new(
        config_manager: Arc<ConfigManager>,
        base_config: Config,
        verifiers: Vec<IdpEntry>,
        audit: Arc<dyn AuditSink>,
        options: BrokerOptions,
    ) -> anyhow::Result<Self> {
        let response_signing_key = base_config
            .service_signing_key()
            .cloned()
            .context("service account signing nkey is not available")?;
        let encryption_key = base_config.service_encryption_xkey().cloned();

        Ok(Self {
            config_manager,
            base_config: Arc::new(base_config),
            verifiers: Arc::new(verifiers),
            response_signing_key,
            encryption_key,
            audit,
            options,
        })
    }

    pub fn base_config(&self) -> &Config {
        &self.base_config
    }

    /// Handle one authorization request. `server_xkey` is the value of the
    /// `Nats-Server-Xkey` header when present.
    pub async fn handle(&self, server_xkey: Option<&str>, payload: &[u8]) -> Reply {
        if let Some(xkey) = server_xkey {
            trace!(server_xkey = %redact_key(xkey), "handling sealed request");
        }

        let plaintext = match server_xkey {
            Some(xkey) => {
                let Some(encryption_key) = &self.encryption_key else {
                    return Reply::Error {
                        code: 500,
                        message: "xkey not supported".to_string(),
                    };
                };
                match encryption_key.open(payload, xkey) {
                    Ok(opened) => opened,
                    Err(err) => {
                        return Reply::Error {
                            code: 500,
                            message: format!("error decrypting message: {err}"),
                        };
                    }
                }
            }
            None => payload.to_vec(),
        };

        let token = match std::str::from_utf8(&plaintext) {
            Ok(token) => token,
            Err(err) => {
                return Reply::Error {
                    code: 500,
                    message: format!("request payload is not utf-8: {err}"),
                };
            }
        };
        let request = match decode_auth_request(token) {
            Ok(request) => request,
            Err(err) => {
                error!(error = %err, "could not decode authorization request");
                return Reply::Error {
                    code: 500,
                    message: err.to_string(),
                };
            }
        };

        let user_nkey = request.nats.user_nkey.clone();
        let server_id = request.nats.server_id.id.clone();

        match self.mint_credential(&request).await {
            Ok(outcome) => {
                self.respond(server_xkey, &user_nkey, &server_id, outcome.user_jwt, None)
            }
            Err(err) => {
                debug!(error = %err, "authorization request rejected");
                self.respond(
                    server_xkey,
                    &user_nkey,
                    &server_id,
                    String::new(),
                    Some(err.to_string()),
                )
            }
        }
    }

    async fn mint_credential(&self, request: &AuthRequestClaims) -> anyhow::Result<MintOutcome> {
        if self.options.log_sensitive {
            trace!(request = ?request, "authorization request claims");
        }

        let (idp_jwt, access_token) = extract_bearer(
            &request.nats.connect_opts.auth_token,
            &request.nats.connect_opts.pass,
        );
        if idp_jwt.is_empty() {
            bail!("no valid JWT token found in request");
        }

        let (mut claims, matched) = run_verification(&idp_jwt, &self.verifiers).await?;
        let custom_mapping = matched.config.effective_custom_mapping();

        // User info only enriches; it never fails the request.
        if matched.config.user_info.enabled {
            if access_token.is_empty() {
                debug!("skipping user info fetch, no access token available");
            } else {
                match matched
                    .verifier
                    .fetch_user_info(&access_token, &claims)
                    .await
                {
                    Ok(user_info) => claims.apply_raw(&user_info, &custom_mapping),
                    Err(err) => warn!(error = %err, "failed to fetch user info"),
                }
            }
        }

        // Client identity from the request joins the claim context.
        let mut synthetic = serde_json::Map::new();
        synthetic.insert(
            "client_id".to_string(),
            Value::String(request.nats.client_info.user.clone()),
        );
        synthetic.insert(
            "also_known_as".to_string(),
            Value::String(request.nats.client_info.name_tag.clone()),
        );
        claims.apply_raw(&synthetic, &custom_mapping);

        let claim_map = claims.flatten();
        if self.options.log_sensitive {
            debug!(claims = ?claim_map, "verified claim map");
        }

        let config = self
            .config_manager
            .render(&claim_map)
            .map_err(|err| {
                error!(error = %err, "error rendering config against idp token");
                anyhow!(err)
            })?;

        let access = resolve_access(&config, &claim_map)?;
        let account = config
            .lookup_account(&access.account)
            .ok_or_else(|| PolicyError::UnknownAccount(access.account.clone()))?;

        let mut user_claims = UserClaims::new_user(&request.nats.user_nkey);
        user_claims.aud = Some(access.account.clone());
        user_claims.name = request.nats.connect_opts.user.clone();
        user_claims.nats.issuer_account = account.public_key.clone();
        user_claims.exp = Some(calculate_expiration(
            &config,
            now_unix(),
            claims.expiry,
            &matched.config.validation.token_bounds,
            &access.binding_max_expiry,
        ));
        user_claims.nats.permissions = access.permissions.clone();
        user_claims.nats.limits = access.limits.clone();

        let expires_at = user_claims
            .exp
            .and_then(|exp| chrono::DateTime::from_timestamp(exp, 0))
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();
        user_claims.nats.tags.push(format!(
            "email: {}, name: {}, idp: {}, expires: {}",
            claims.email, claims.name, matched.config.description, expires_at
        ));

        user_claims.validate()?;

        let signing_key = account
            .signing_nkey
            .get()
            .context("account signing key not available")?;
        let signing_key_info = determine_signing_key(&user_claims, signing_key, account)?;

        let user_jwt = sign_claims(&user_claims, signing_key)?;
        if self.options.log_sensitive {
            debug!(jwt = user_jwt.as_str(), "minted user credential");
        }

        self.publish_audit_event(request, &claims, &matched.config.description, &access.account, account, &user_claims, &signing_key_info, &expires_at);

        Ok(MintOutcome { user_jwt })
    }

    /// Fire-and-forget audit event; the reply never waits on it.
    #[allow(clippy::too_many_arguments)]
    fn publish_audit_event(
        &self,
        request: &AuthRequestClaims,
        idp_claims: &IdpClaims,
        idp_description: &str,
        account_name: &str,
        account: &UserAccountInfo,
        user_claims: &UserClaims,
        signing_key_info: &SigningKeyInfo,
        expires_at: &str,
    ) {
        let subject = format!(
            "{}.evt.audit.account.{}.user.{}.created",
            self.base_config.service.name, account_name, request.nats.user_nkey
        );
        let event = json!({
            "account": account_name,
            "account_pub_nkey": account.public_key,
            "user_pub_nkey": request.nats.user_nkey,
            "username": request.nats.connect_opts.user,
            "email": idp_claims.email,
            "name": idp_claims.name,
            "idp": idp_description,
            "created_at": chrono::Utc::now().to_rfc3339(),
            "expires_at": expires_at,
            "permissions": user_claims.nats.permissions,
            "limits": user_claims.nats.limits,
            "signing_account": self.base_config.service.account.name,
            "signing_key_type": signing_key_info.key_type,
            "signing_key_pub_nkey": signing_key_info.public_key,
        });

        let audit = Arc::clone(&self.audit);
        let payload = serde_json::to_vec(&event).unwrap_or_default();
        tokio::spawn(async move {
            if let Err(err) = audit.publish(subject, payload).await {
                warn!(error = %err, "failed to publish audit event");
            }
        });
    }

    /// Build, sign, and (when the request was sealed) re-seal the response.
    fn respond(
        &self,
        server_xkey: Option<&str>,
        user_nkey: &str,
        server_id: &str,
        user_jwt: String,
        error_message: Option<String>,
    ) -> Reply {
        let mut response = AuthResponseClaims::new(user_nkey, server_id);
        response.nats.jwt = user_jwt;
        response.nats.error = error_message.unwrap_or_default();

        trace!("signing response with service account key");
        let token = match sign_claims(&response, &self.response_signing_key) {
            Ok(token) => token,
            Err(err) => {
                error!(error = %err, "couldn't sign response");
                return Reply::Error {
                    code: 500,
                    message: "couldn't sign response".to_string(),
                };
            }
        };

        let mut data = token.into_bytes();
        if let Some(xkey) = server_xkey {
            trace!("sealing response for server xkey");
            let Some(encryption_key) = &self.encryption_key else {
                // Unreachable past the inbound check; refuse to leak plaintext.
                return Reply::Error {
                    code: 500,
                    message: "xkey not supported".to_string(),
                };
            };
            data = match encryption_key.seal(&data, xkey) {
                Ok(sealed) => sealed,
                Err(err) => {
                    error!(error = %err, "couldn't seal response payload");
                    return Reply::Error {
                        code: 500,
                        message: "couldn't encrypt response".to_string(),
                    };
                }
            };
        }

        Reply::Payload(data)
    }
}
