//! Shared fixtures for the handler pipeline tests: a mock OIDC provider
//! backed by a freshly generated RSA key, YAML config assembly, and a
//! recording audit sink.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use iam_broker::auth::service::{AuditSink, AuthService, BrokerOptions};
use iam_broker::auth::verifier::{build_verifiers, http_client};
use iam_broker::config::ConfigManager;
use iam_credentials::{AuthRequestClaims, ServerId, SigningKey, sign_claims};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const IDP_KID: &str = "test-key";

/// A mock OIDC provider: discovery document, JWKS, and the RSA key tokens
/// are signed with.
pub struct IdpFixture {
    pub server: MockServer,
    pub private_key_pem: String,
}

impl IdpFixture {
    pub fn issuer(&self) -> String {
        self.server.uri()
    }

    /// Sign an RS256 id token carrying `extra` on top of the registered
    /// claims.
    pub fn mint_token(&self, aud: &str, iat: i64, exp: i64, extra: Value) -> String {
        let mut header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
        header.kid = Some(IDP_KID.to_string());

        let mut claims = json!({
            "iss": self.issuer(),
            "sub": "user-1",
            "aud": aud,
            "iat": iat,
            "exp": exp,
        });
        if let (Some(base), Some(extra)) = (claims.as_object_mut(), extra.as_object()) {
            for (key, value) in extra {
                base.insert(key.clone(), value.clone());
            }
        }

        jsonwebtoken::encode(
            &header,
            &claims,
            &jsonwebtoken::EncodingKey::from_rsa_pem(self.private_key_pem.as_bytes())
                .expect("encoding key"),
        )
        .expect("token")
    }
}

/// Spin up a mock IdP with discovery and JWKS endpoints; `user_info`
/// optionally adds a userinfo endpoint returning the given claims.
pub async fn start_idp(user_info: Option<Value>) -> IdpFixture {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("rsa key");
    let public_key = RsaPublicKey::from(&key);
    let private_key_pem = key
        .to_pkcs1_pem(Default::default())
        .expect("pem")
        .to_string();

    let jwk_n = URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be());
    let jwk_e = URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be());

    let server = MockServer::start().await;
    let issuer = server.uri();

    let mut discovery = json!({
        "issuer": issuer,
        "jwks_uri": format!("{issuer}/jwks"),
    });
    if user_info.is_some() {
        discovery["userinfo_endpoint"] = json!(format!("{issuer}/userinfo"));
    }

    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(discovery))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "keys": [{
                "kty": "RSA",
                "kid": IDP_KID,
                "alg": "RS256",
                "use": "sig",
                "n": jwk_n,
                "e": jwk_e,
            }]
        })))
        .mount(&server)
        .await;

    if let Some(claims) = user_info {
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(claims))
            .mount(&server)
            .await;
    }

    IdpFixture {
        server,
        private_key_pem,
    }
}

/// Audit sink that records published events for assertions.
#[derive(Default)]
pub struct RecordingAuditSink {
    events: tokio::sync::Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn publish(&self, subject: String, payload: Vec<u8>) -> anyhow::Result<()> {
        let value: Value = serde_json::from_slice(&payload)?;
        self.events.lock().await.push((subject, value));
        Ok(())
    }
}

impl RecordingAuditSink {
    /// Poll until an event arrives; audit publishes are fire-and-forget so
    /// the reply can outrun them.
    pub async fn wait_for_event(&self) -> (String, Value) {
        for _ in 0..100 {
            if let Some(event) = self.events.lock().await.first().cloned() {
                return event;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no audit event arrived");
    }

    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }
}

/// Keys the assembled broker plus its fixtures hang on to.
pub struct TestBroker {
    pub service: AuthService,
    pub audit: Arc<RecordingAuditSink>,
    pub service_key: SigningKey,
    pub server_key: SigningKey,
}

/// Assemble the broker's YAML from an issuer plus caller-supplied idp and
/// rbac fragments (indented to match their insertion points).
pub fn broker_yaml(
    issuer: &str,
    service_seed: &str,
    encryption_seed: Option<&str>,
    idp_extra: &str,
    rbac_block: &str,
) -> String {
    let encryption = match encryption_seed {
        Some(seed) => format!(
            "    encryption:\n      enabled: true\n      xkey_secret: \"{seed}\"\n"
        ),
        None => String::new(),
    };
    format!(
        r#"nats:
  url: nats://127.0.0.1:4222
service:
  name: test-broker
  description: test callout broker
  version: 0.1.0
  creds_file: /tmp/unused.creds
  account:
    name: AUTH
    signing_nkey: "{service_seed}"
{encryption}idp:
- description: test idp
  issuer_url: {issuer}
  client_id: app1
{idp_extra}{rbac_block}"#
    )
}

/// Build a ready `AuthService` over `yaml`, discovering verifiers against
/// the live mock IdP.
pub async fn build_broker(yaml: &str, service_key: SigningKey) -> TestBroker {
    let manager = Arc::new(
        ConfigManager::from_documents(&[("test".to_string(), yaml.to_string())])
            .expect("config manager"),
    );
    let base_config = manager.render(&serde_json::Map::new()).expect("base config");

    let http = http_client().expect("http client");
    let verifiers = build_verifiers(&http, &base_config)
        .await
        .expect("verifiers");

    let audit = Arc::new(RecordingAuditSink::default());
    let service = AuthService::new(
        manager,
        base_config,
        verifiers,
        audit.clone(),
        BrokerOptions::default(),
    )
    .expect("auth service");

    TestBroker {
        service,
        audit,
        service_key,
        server_key: SigningKey::generate_server(),
    }
}

/// Sign an authorization request the way a NATS server would.
pub fn auth_request(
    server_key: &SigningKey,
    user_pub: &str,
    username: &str,
    password: &str,
) -> String {
    let mut request = AuthRequestClaims::new(
        user_pub,
        ServerId {
            id: server_key.public_key(),
            name: "test-server".to_string(),
            ..ServerId::default()
        },
    );
    request.nats.connect_opts.user = username.to_string();
    request.nats.connect_opts.pass = password.to_string();
    request.nats.client_info.user = "client-user".to_string();
    request.nats.client_info.name_tag = "Client Name".to_string();
    sign_claims(&request, server_key).expect("signed request")
}

pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
