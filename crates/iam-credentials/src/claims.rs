//! NATS JWT v2 claim shapes used by the auth-callout protocol.
//!
//! Three claim bodies travel over the wire: the authorization request the
//! server sends, the user credential the broker mints, and the authorization
//! response wrapping that credential. All share the same outer envelope
//! (`GenericClaims`) and differ only in the `nats` section.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::{CredentialError, CredentialResult};

/// Outer claim envelope common to every NATS JWT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericClaims<T> {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub jti: String,
    pub iat: i64,
    pub iss: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    pub nats: T,
}

/// Subject patterns a user may or may not use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,
}

impl Permission {
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

/// Reply permission attached to request/reply subjects.
///
/// `ttl` is in nanoseconds, matching the substrate's duration encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePermission {
    #[serde(rename = "max", default)]
    pub max_msgs: i64,
    #[serde(rename = "ttl", default)]
    pub expires_ns: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(rename = "pub", default, skip_serializing_if = "Permission::is_empty")]
    pub publish: Permission,
    #[serde(rename = "sub", default, skip_serializing_if = "Permission::is_empty")]
    pub subscribe: Permission,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resp: Option<ResponsePermission>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub src: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub times: Vec<TimeRange>,
    #[serde(
        rename = "times_location",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub locale: String,
    pub subs: i64,
    pub data: i64,
    pub payload: i64,
}

impl Default for Limits {
    fn default() -> Self {
        // -1 is the substrate's "no limit" sentinel.
        Self {
            src: Vec::new(),
            times: Vec::new(),
            locale: String::new(),
            subs: -1,
            data: -1,
            payload: -1,
        }
    }
}

/// `nats` section of a minted user credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserNats {
    #[serde(flatten)]
    pub permissions: Permissions,
    #[serde(flatten)]
    pub limits: Limits,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bearer_token: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub issuer_account: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(rename = "type")]
    pub claim_type: String,
    pub version: i64,
}

impl Default for UserNats {
    fn default() -> Self {
        Self {
            permissions: Permissions::default(),
            limits: Limits::default(),
            bearer_token: false,
            issuer_account: String::new(),
            tags: Vec::new(),
            claim_type: "user".to_string(),
            version: 2,
        }
    }
}

pub type UserClaims = GenericClaims<UserNats>;

impl UserClaims {
    pub fn new_user(user_nkey: impl Into<String>) -> Self {
        Self {
            jti: String::new(),
            iat: 0,
            iss: String::new(),
            name: String::new(),
            sub: user_nkey.into(),
            aud: None,
            exp: None,
            nats: UserNats::default(),
        }
    }

    /// Structural checks a credential must pass before signing.
    pub fn validate(&self) -> CredentialResult<()> {
        if !self.sub.starts_with('U') {
            return Err(CredentialError::InvalidClaims(format!(
                "subject '{}' is not a user public key",
                self.sub
            )));
        }
        if !self.nats.issuer_account.is_empty() && !self.nats.issuer_account.starts_with('A') {
            return Err(CredentialError::InvalidClaims(format!(
                "issuer_account '{}' is not an account public key",
                self.nats.issuer_account
            )));
        }
        if let Some(exp) = self.exp
            && exp <= 0
        {
            return Err(CredentialError::InvalidClaims(
                "expiration must be a positive unix timestamp".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerId {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub host: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub xkey: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name_tag: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub client_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectOptions {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub jwt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nkey: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sig: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pass: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lang: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<i64>,
}

/// `nats` section of an authorization request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequestNats {
    pub server_id: ServerId,
    pub user_nkey: String,
    #[serde(default)]
    pub client_info: ClientInfo,
    #[serde(default)]
    pub connect_opts: ConnectOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_tls: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_nonce: String,
    #[serde(rename = "type")]
    pub claim_type: String,
    pub version: i64,
}

impl Default for AuthRequestNats {
    fn default() -> Self {
        Self {
            server_id: ServerId::default(),
            user_nkey: String::new(),
            client_info: ClientInfo::default(),
            connect_opts: ConnectOptions::default(),
            client_tls: None,
            request_nonce: String::new(),
            claim_type: "authorization_request".to_string(),
            version: 2,
        }
    }
}

pub type AuthRequestClaims = GenericClaims<AuthRequestNats>;

/// `nats` section of an authorization response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponseNats {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub jwt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub issuer_account: String,
    #[serde(rename = "type")]
    pub claim_type: String,
    pub version: i64,
}

impl Default for AuthResponseNats {
    fn default() -> Self {
        Self {
            jwt: String::new(),
            error: String::new(),
            issuer_account: String::new(),
            claim_type: "authorization_response".to_string(),
            version: 2,
        }
    }
}

pub type AuthResponseClaims = GenericClaims<AuthResponseNats>;

impl AuthResponseClaims {
    /// A response is addressed to the requesting user key and scoped to the
    /// server that asked, via the audience.
    pub fn new(user_nkey: impl Into<String>, server_id: impl Into<String>) -> Self {
        Self {
            jti: String::new(),
            iat: 0,
            iss: String::new(),
            name: String::new(),
            sub: user_nkey.into(),
            aud: Some(server_id.into()),
            exp: None,
            nats: AuthResponseNats::default(),
        }
    }
}

impl AuthRequestClaims {
    pub fn new(user_nkey: impl Into<String>, server: ServerId) -> Self {
        let user_nkey = user_nkey.into();
        Self {
            jti: String::new(),
            iat: 0,
            iss: String::new(),
            name: String::new(),
            sub: user_nkey.clone(),
            aud: None,
            exp: None,
            nats: AuthRequestNats {
                server_id: server,
                user_nkey,
                ..AuthRequestNats::default()
            },
        }
    }
}

// Keep the generic deserialize bound usable from helper functions.
pub(crate) fn parse_claims<T: DeserializeOwned>(body: &[u8]) -> CredentialResult<GenericClaims<T>> {
    Ok(serde_json::from_slice(body)?)
}
