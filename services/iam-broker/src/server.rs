//! NATS client adapter and process supervision.
//!
//! Connects with the service credentials, registers the auth handler as a
//! micro-service endpoint on the callout subject, and drains the connection
//! when the process receives an interrupt. Requests are handled
//! concurrently; each one is spawned onto the runtime so a slow IdP never
//! blocks the endpoint stream.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_nats::service::ServiceExt;
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{info, warn};

use crate::auth::service::{AuditSink, AuthService, BrokerOptions, Reply, XKEY_HEADER};
use crate::auth::verifier::{build_verifiers, http_client};
use crate::config::{Config, ConfigManager};

/// The well-known auth-callout subject servers send requests on.
pub const AUTH_CALLOUT_SUBJECT: &str = "$SYS.REQ.USER.AUTH";

struct NatsAuditSink {
    client: async_nats::Client,
}

#[async_trait]
impl AuditSink for NatsAuditSink {
    async fn publish(&self, subject: String, payload: Vec<u8>) -> anyhow::Result<()> {
        self.client.publish(subject, payload.into()).await?;
        Ok(())
    }
}

async fn connect(config: &Config) -> anyhow::Result<async_nats::Client> {
    let mut options = async_nats::ConnectOptions::new().name(&config.service.name);
    if !config.service.creds_file.is_empty() {
        options = options
            .credentials_file(&config.service.creds_file)
            .await
            .with_context(|| format!("loading credentials {}", config.service.creds_file))?;
    }
    options
        .connect(&config.nats.url)
        .await
        .with_context(|| format!("connecting to {}", config.nats.url))
}

/// Load configuration, connect, serve until interrupted, then drain.
pub async fn run(config_files: Vec<PathBuf>, options: BrokerOptions) -> anyhow::Result<()> {
    let config_manager =
        Arc::new(ConfigManager::from_files(&config_files).context("loading configuration")?);
    let base_config = config_manager
        .render(&serde_json::Map::new())
        .context("bad configuration")?;

    info!(url = base_config.nats.url.as_str(), "connecting");
    let client = connect(&base_config).await?;

    let http = http_client().context("building http client")?;
    let verifiers = build_verifiers(&http, &base_config).await?;

    info!(
        subject = format!(
            "{}.evt.audit.account.*.user.*.created",
            base_config.service.name
        ),
        "audit events will be published"
    );

    let audit: Arc<dyn AuditSink> = Arc::new(NatsAuditSink {
        client: client.clone(),
    });
    let service_name = base_config.service.name.clone();
    let service_version = base_config.service.version.clone();
    let service_description = base_config.service.description.clone();
    let auth = Arc::new(AuthService::new(
        config_manager,
        base_config,
        verifiers,
        audit,
        options,
    )?);

    info!(version = service_version.as_str(), "starting service");
    let nats_service = client
        .service_builder()
        .description(service_description)
        .start(service_name, service_version)
        .await
        .map_err(|err| anyhow!("registering service: {err}"))?;
    let mut endpoint = nats_service
        .endpoint(AUTH_CALLOUT_SUBJECT)
        .await
        .map_err(|err| anyhow!("registering endpoint: {err}"))?;

    info!(subject = AUTH_CALLOUT_SUBJECT, "listening");
    let accept_loop = tokio::spawn(async move {
        while let Some(request) = endpoint.next().await {
            let auth = Arc::clone(&auth);
            tokio::spawn(async move {
                let server_xkey = request
                    .message
                    .headers
                    .as_ref()
                    .and_then(|headers| headers.get(XKEY_HEADER))
                    .map(|value| value.as_str().to_string());
                let reply = auth
                    .handle(server_xkey.as_deref(), &request.message.payload)
                    .await;
                let result = match reply {
                    Reply::Payload(data) => request.respond(Ok(data.into())).await,
                    Reply::Error { code, message } => {
                        request
                            .respond(Err(async_nats::service::error::Error {
                                code: code as usize,
                                status: message,
                            }))
                            .await
                    }
                };
                if let Err(err) = result {
                    warn!(error = %err, "failed to send authorization reply");
                }
            });
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    info!("exiting");

    accept_loop.abort();
    if let Err(err) = client.drain().await {
        warn!(error = %err, "error draining connection");
    }
    Ok(())
}
