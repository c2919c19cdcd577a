//! Broker configuration: schema, merge, templating, and validation.
//!
//! Configuration is loaded once at startup from an ordered list of YAML
//! documents which are deep-merged into a single canonical string. That
//! string is the template source: every request re-renders it against the
//! verified claim map and parses a fresh `Config`, so the request path never
//! mutates shared state.

mod merge;
mod scalars;
mod template;

pub use merge::deep_merge;
pub use scalars::{MaybeDuration, MaybeSeed, MaybeXKey, parse_duration};
pub use template::{expand_env, render_all};

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use iam_credentials::{ExchangeKey, SigningKey};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_TOKEN_BOUNDS_MIN: Duration = Duration::from_secs(60);
pub const DEFAULT_TOKEN_BOUNDS_MAX: Duration = Duration::from_secs(3600);
const DEFAULT_LEFT_DELIM: &str = "{{";
const DEFAULT_RIGHT_DELIM: &str = "}}";

// Characters NATS subjects cannot contain.
const SUBJECT_ILLEGAL_CHARS: &[char] = &[' ', '\t', '\r', '\n', '.', '*', '>', '/'];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("yaml error in {location}: {detail}")]
    Parse { location: String, detail: String },
    #[error("type mismatch merging key '{path}': cannot merge {base_kind} with {overlay_kind}")]
    MergeConflict {
        path: String,
        base_kind: &'static str,
        overlay_kind: &'static str,
    },
    #[error("missing configuration value {0}")]
    MissingField(&'static str),
    #[error("service.version '{0}' is not a semantic version")]
    InvalidVersion(String),
    #[error("invalid duration for {field}: '{raw}'")]
    InvalidDuration { field: String, raw: String },
    #[error("invalid nkey for {field}")]
    InvalidKey { field: String },
    #[error("role binding {binding}: {detail}")]
    InvalidMatchRule { binding: usize, detail: String },
    #[error("role binding {binding} references unknown user-account '{account}'")]
    UnknownAccount { binding: usize, account: String },
    #[error("role binding {binding} references unknown role '{role}'")]
    UnknownRole { binding: usize, role: String },
    #[error("at least one idp must be configured")]
    EmptyIdpList,
}

/// Template delimiter configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TemplateParams {
    pub left_delim: String,
    pub right_delim: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DurationBounds {
    pub min: MaybeDuration,
    pub max: MaybeDuration,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    pub url: String,
    pub token_bounds: DurationBounds,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    pub xkey_secret: MaybeXKey,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceAccount {
    pub name: String,
    pub signing_nkey: MaybeSeed,
    pub encryption: EncryptionConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub description: String,
    pub version: String,
    pub creds_file: String,
    pub account: ServiceAccount,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UserInfoConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IdpValidationSpec {
    #[serde(rename = "claims")]
    pub required_claims: Vec<String>,
    #[serde(rename = "aud")]
    pub audience: Vec<String>,
    pub skip_audience_validation: bool,
    pub token_bounds: DurationBounds,
    pub custom_claims_mapping: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IdpConfig {
    pub description: String,
    pub issuer_url: String,
    pub client_id: String,
    #[serde(rename = "validation")]
    pub validation: IdpValidationSpec,
    pub user_info: UserInfoConfig,
    pub token_bounds: DurationBounds,
    pub custom_mapping: HashMap<String, String>,
    pub ignore_setup_error: bool,
}

impl IdpConfig {
    /// Claim renames applied when flattening: entries on the idp win over
    /// entries on its validation spec.
    pub fn effective_custom_mapping(&self) -> HashMap<String, String> {
        let mut mapping = self.validation.custom_claims_mapping.clone();
        mapping.extend(self.custom_mapping.clone());
        mapping
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchingStrategy {
    #[default]
    BestMatch,
    Strict,
}

impl<'de> Deserialize<'de> for MatchingStrategy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        match text.to_lowercase().as_str() {
            "strict" => Ok(MatchingStrategy::Strict),
            "best_match" => Ok(MatchingStrategy::BestMatch),
            "" => {
                warn!("role_binding_matching_strategy is empty, defaulting to best_match");
                Ok(MatchingStrategy::BestMatch)
            }
            other => {
                warn!(value = other, "unrecognized role_binding_matching_strategy, defaulting to best_match");
                Ok(MatchingStrategy::BestMatch)
            }
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UserAccountInfo {
    pub name: String,
    pub public_key: String,
    pub signing_nkey: MaybeSeed,
}

/// One match criterion: either a claim/value pair or a permission name.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MatchRule {
    pub claim: Option<String>,
    pub value: Option<String>,
    pub permission: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RoleBinding {
    #[serde(rename = "user_account")]
    pub user_account: String,
    pub roles: Vec<String>,
    #[serde(rename = "token_max_expiration")]
    pub token_max_expiration: MaybeDuration,
    #[serde(rename = "match")]
    pub matches: Vec<MatchRule>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PermissionSpec {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResponseSpec {
    pub max_msgs: i64,
    #[serde(rename = "exp")]
    pub expires: MaybeDuration,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RolePermissions {
    #[serde(rename = "pub")]
    pub publish: PermissionSpec,
    #[serde(rename = "sub")]
    pub subscribe: PermissionSpec,
    pub resp: ResponseSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimeRangeSpec {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RoleLimits {
    pub src: Vec<String>,
    pub times: Vec<TimeRangeSpec>,
    pub locale: String,
    pub subs: Option<i64>,
    pub data: Option<i64>,
    pub payload: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Role {
    pub name: String,
    pub permissions: RolePermissions,
    pub limits: RoleLimits,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RbacConfig {
    #[serde(rename = "user_accounts")]
    pub user_accounts: Vec<UserAccountInfo>,
    #[serde(rename = "role_binding")]
    pub role_bindings: Vec<RoleBinding>,
    pub roles: Vec<Role>,
    #[serde(rename = "token_max_expiration")]
    pub token_max_expiration: MaybeDuration,
    #[serde(rename = "role_binding_matching_strategy")]
    pub matching_strategy: MatchingStrategy,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub params: TemplateParams,
    pub nats: NatsConfig,
    pub service: ServiceConfig,
    pub idp: Vec<IdpConfig>,
    pub rbac: RbacConfig,
}

impl Config {
    pub fn lookup_account(&self, name: &str) -> Option<&UserAccountInfo> {
        self.rbac
            .user_accounts
            .iter()
            .find(|account| account.name == name)
    }

    pub fn lookup_role(&self, name: &str) -> Option<&Role> {
        self.rbac.roles.iter().find(|role| role.name == name)
    }

    pub fn service_signing_key(&self) -> Option<&SigningKey> {
        self.service.account.signing_nkey.get()
    }

    /// The exchange key, when envelope encryption is enabled.
    pub fn service_encryption_xkey(&self) -> Option<&ExchangeKey> {
        if self.service.account.encryption.enabled {
            self.service.account.encryption.xkey_secret.get()
        } else {
            None
        }
    }

    pub fn token_bounds_min(&self) -> Duration {
        self.nats
            .token_bounds
            .min
            .get()
            .unwrap_or(DEFAULT_TOKEN_BOUNDS_MIN)
    }

    pub fn token_bounds_max(&self) -> Duration {
        self.nats
            .token_bounds
            .max
            .get()
            .unwrap_or(DEFAULT_TOKEN_BOUNDS_MAX)
    }
}

/// Replace characters a NATS subject cannot carry, trimming any left at the
/// edges.
pub fn sanitize_service_name(name: &str) -> String {
    if !name.contains(SUBJECT_ILLEGAL_CHARS) {
        return name.to_string();
    }

    let replaced: String = name
        .chars()
        .map(|c| {
            if SUBJECT_ILLEGAL_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();
    let sanitized = replaced.trim_matches('_').to_string();
    warn!(
        original = name,
        sanitized = sanitized.as_str(),
        "service name contained characters illegal in subjects, sanitized"
    );
    sanitized
}

fn is_semver(version: &str) -> bool {
    let pattern = regex::Regex::new(r"^v?(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)$")
        .expect("static regex");
    pattern.is_match(version)
}

/// Manager over the merged configuration: holds the canonical YAML and the
/// bootstrap parse, and renders a fresh validated `Config` per context.
#[derive(Debug)]
pub struct ConfigManager {
    merged_yaml: String,
    params: TemplateParams,
    base: Config,
}

impl ConfigManager {
    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self, ConfigError> {
        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
            documents.push((path.display().to_string(), text));
        }
        Self::from_documents(&documents)
    }

    /// Build from already-loaded documents; each entry is `(label, yaml)`.
    pub fn from_documents(documents: &[(String, String)]) -> Result<Self, ConfigError> {
        if documents.is_empty() {
            return Err(ConfigError::Parse {
                location: "configuration".to_string(),
                detail: "no configuration documents given".to_string(),
            });
        }
        let mut merged: Option<serde_yaml::Value> = None;
        for (label, text) in documents {
            tracing::debug!(document = label.as_str(), "merging config");
            let tree: serde_yaml::Value =
                serde_yaml::from_str(text).map_err(|err| improve_yaml_error(label, &err))?;
            merged = Some(match merged {
                None => tree,
                Some(base) => deep_merge(base, tree)?,
            });
        }
        let merged = merged.unwrap_or(serde_yaml::Value::Null);
        let merged_yaml = serde_yaml::to_string(&merged).map_err(|err| ConfigError::Parse {
            location: "merged configuration".to_string(),
            detail: err.to_string(),
        })?;

        // Bootstrap parse: tolerant of templated scalars, but the service
        // must already be nameable.
        let base: Config = serde_yaml::from_str(&merged_yaml)
            .map_err(|err| improve_yaml_error("merged configuration", &err))?;
        if base.service.name.is_empty() {
            return Err(ConfigError::MissingField("service.name"));
        }

        let mut params = base.params.clone();
        if params.left_delim.is_empty() {
            params.left_delim = DEFAULT_LEFT_DELIM.to_string();
        }
        if params.right_delim.is_empty() {
            params.right_delim = DEFAULT_RIGHT_DELIM.to_string();
        }

        Ok(Self {
            merged_yaml,
            params,
            base,
        })
    }

    pub fn merged_yaml(&self) -> &str {
        &self.merged_yaml
    }

    pub fn params(&self) -> &TemplateParams {
        &self.params
    }

    /// Render the canonical YAML against `ctx` and return a validated
    /// `Config`. Each call produces an independent value.
    pub fn render(
        &self,
        ctx: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Config, ConfigError> {
        let rendered = render_all(&self.merged_yaml, ctx, &self.params);
        let mut config: Config = serde_yaml::from_str(&rendered)
            .map_err(|err| improve_yaml_error("rendered configuration", &err))?;

        config.params = self.params.clone();
        config.service.name = sanitize_service_name(&config.service.name);

        // Key material that only resolves under a later context falls back
        // to whatever the bootstrap parse already holds.
        if config.service.account.signing_nkey.get().is_none()
            && let Some(key) = self.base.service.account.signing_nkey.get()
        {
            config.service.account.signing_nkey = MaybeSeed::Parsed(key.clone());
        }
        if config.service.account.encryption.xkey_secret.get().is_none()
            && let Some(key) = self.base.service.account.encryption.xkey_secret.get()
        {
            config.service.account.encryption.xkey_secret = MaybeXKey::Parsed(key.clone());
        }

        validate(&config, &self.params)?;
        Ok(config)
    }
}

/// Attach location/shape hints to YAML parse failures; the raw serde message
/// rarely points at the offending file pattern.
fn improve_yaml_error(location: &str, err: &serde_yaml::Error) -> ConfigError {
    let message = err.to_string();
    let detail = if message.contains("invalid type: map") && message.contains("expected a sequence")
    {
        format!(
            "{message}\nhint: a single object was found where a list was expected; \
             prefix the entry with '-' to make it a list element"
        )
    } else if message.contains("invalid type: sequence") {
        format!(
            "{message}\nhint: a list was found where a single object was expected; \
             remove the '-' prefix from the entry"
        )
    } else {
        message
    };
    ConfigError::Parse {
        location: location.to_string(),
        detail,
    }
}

fn validate(config: &Config, params: &TemplateParams) -> Result<(), ConfigError> {
    if config.nats.url.is_empty() {
        return Err(ConfigError::MissingField("nats.url"));
    }
    if config.service.name.is_empty() {
        return Err(ConfigError::MissingField("service.name"));
    }
    if config.service.description.is_empty() {
        return Err(ConfigError::MissingField("service.description"));
    }
    if config.service.version.is_empty() {
        return Err(ConfigError::MissingField("service.version"));
    }
    if !is_semver(&config.service.version) {
        return Err(ConfigError::InvalidVersion(config.service.version.clone()));
    }
    if config.service.creds_file.is_empty() {
        return Err(ConfigError::MissingField("service.creds_file"));
    }

    // Required key material: raw text that is not an unrendered template is
    // a bad key, absence is a missing field.
    let looks_templated = |raw: &str| raw.contains(params.left_delim.as_str());
    match &config.service.account.signing_nkey {
        MaybeSeed::Parsed(_) => {}
        MaybeSeed::Unparsed(raw) if !looks_templated(raw) => {
            return Err(ConfigError::InvalidKey {
                field: "service.account.signing_nkey".to_string(),
            });
        }
        _ => return Err(ConfigError::MissingField("service.account.signing_nkey")),
    }
    if config.service.account.encryption.enabled {
        match &config.service.account.encryption.xkey_secret {
            MaybeXKey::Parsed(_) => {}
            MaybeXKey::Unparsed(raw) if !looks_templated(raw) => {
                return Err(ConfigError::InvalidKey {
                    field: "service.account.encryption.xkey_secret".to_string(),
                });
            }
            _ => {
                return Err(ConfigError::MissingField(
                    "service.account.encryption.xkey_secret",
                ));
            }
        }
    }

    if config.idp.is_empty() {
        return Err(ConfigError::EmptyIdpList);
    }
    for idp in &config.idp {
        if idp.issuer_url.is_empty() {
            return Err(ConfigError::MissingField("idp.issuer_url"));
        }
        if idp.client_id.is_empty() {
            return Err(ConfigError::MissingField("idp.client_id"));
        }
    }

    validate_durations(config, params)?;

    for (index, binding) in config.rbac.role_bindings.iter().enumerate() {
        if config.lookup_account(&binding.user_account).is_none() {
            return Err(ConfigError::UnknownAccount {
                binding: index,
                account: binding.user_account.clone(),
            });
        }
        for role in &binding.roles {
            if config.lookup_role(role).is_none() {
                return Err(ConfigError::UnknownRole {
                    binding: index,
                    role: role.clone(),
                });
            }
        }
        for rule in &binding.matches {
            let has_claim = rule.claim.as_deref().is_some_and(|c| !c.is_empty());
            let has_permission = rule.permission.as_deref().is_some_and(|p| !p.is_empty());
            match (has_claim, has_permission) {
                (true, true) => {
                    return Err(ConfigError::InvalidMatchRule {
                        binding: index,
                        detail: "a match names either a claim or a permission, not both"
                            .to_string(),
                    });
                }
                (false, false) => {
                    return Err(ConfigError::InvalidMatchRule {
                        binding: index,
                        detail: "a match must name a claim or a permission".to_string(),
                    });
                }
                (true, false) if rule.value.is_none() => {
                    return Err(ConfigError::InvalidMatchRule {
                        binding: index,
                        detail: format!(
                            "claim match '{}' is missing a value",
                            rule.claim.as_deref().unwrap_or_default()
                        ),
                    });
                }
                _ => {}
            }
        }
    }

    Ok(())
}

/// A duration that still holds raw text after rendering is only acceptable
/// when that text is an unrendered template token; plain garbage is fatal.
fn validate_durations(config: &Config, params: &TemplateParams) -> Result<(), ConfigError> {
    let looks_templated = |raw: &str| raw.contains(params.left_delim.as_str());
    let mut check = |field: String, value: &MaybeDuration| -> Result<(), ConfigError> {
        if let Some(raw) = value.raw_text()
            && !looks_templated(raw)
        {
            return Err(ConfigError::InvalidDuration {
                field,
                raw: raw.to_string(),
            });
        }
        Ok(())
    };

    check("nats.token_bounds.min".into(), &config.nats.token_bounds.min)?;
    check("nats.token_bounds.max".into(), &config.nats.token_bounds.max)?;
    check(
        "rbac.token_max_expiration".into(),
        &config.rbac.token_max_expiration,
    )?;
    for (i, idp) in config.idp.iter().enumerate() {
        check(format!("idp[{i}].token_bounds.min"), &idp.token_bounds.min)?;
        check(format!("idp[{i}].token_bounds.max"), &idp.token_bounds.max)?;
        check(
            format!("idp[{i}].validation.token_bounds.min"),
            &idp.validation.token_bounds.min,
        )?;
        check(
            format!("idp[{i}].validation.token_bounds.max"),
            &idp.validation.token_bounds.max,
        )?;
    }
    for (i, binding) in config.rbac.role_bindings.iter().enumerate() {
        check(
            format!("rbac.role_binding[{i}].token_max_expiration"),
            &binding.token_max_expiration,
        )?;
    }
    for (i, role) in config.rbac.roles.iter().enumerate() {
        check(
            format!("rbac.roles[{i}].permissions.resp.exp"),
            &role.permissions.resp.expires,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_yaml(extra: &str) -> String {
        format!(
            r#"
nats:
  url: nats://127.0.0.1:4222
service:
  name: auth-broker
  description: callout broker
  version: 1.2.3
  creds_file: /etc/broker/service.creds
  account:
    name: AUTH
    signing_nkey: "{seed}"
idp:
- description: test idp
  issuer_url: https://idp.example.com
  client_id: app1
{extra}"#,
            seed = SigningKey::generate_account().seed().expect("seed"),
            extra = extra,
        )
    }

    fn manager(yaml: &str) -> ConfigManager {
        ConfigManager::from_documents(&[("test".to_string(), yaml.to_string())]).expect("manager")
    }

    #[test]
    fn bootstrap_and_render_happy_path() {
        let cm = manager(&minimal_yaml(""));
        let config = cm.render(&serde_json::Map::new()).expect("render");

        assert_eq!(config.service.name, "auth-broker");
        assert_eq!(config.token_bounds_min(), DEFAULT_TOKEN_BOUNDS_MIN);
        assert_eq!(config.token_bounds_max(), DEFAULT_TOKEN_BOUNDS_MAX);
        assert!(config.service_signing_key().is_some());
        assert!(config.service_encryption_xkey().is_none());
    }

    #[test]
    fn missing_service_name_fails_bootstrap() {
        let yaml = "nats:\n  url: nats://x\nservice:\n  description: d\n";
        let err = ConfigManager::from_documents(&[("t".into(), yaml.into())]).expect_err("bootstrap");
        assert!(matches!(err, ConfigError::MissingField("service.name")));
    }

    #[test]
    fn empty_idp_list_fails_validation() {
        let yaml = minimal_yaml("").replace(
            "idp:\n- description: test idp\n  issuer_url: https://idp.example.com\n  client_id: app1\n",
            "",
        );
        let cm = manager(&yaml);
        let err = cm.render(&serde_json::Map::new()).expect_err("validate");
        assert!(matches!(err, ConfigError::EmptyIdpList));
    }

    #[test]
    fn invalid_semver_fails_validation() {
        let yaml = minimal_yaml("").replace("version: 1.2.3", "version: not-a-version");
        let cm = manager(&yaml);
        let err = cm.render(&serde_json::Map::new()).expect_err("validate");
        assert!(matches!(err, ConfigError::InvalidVersion(_)));
    }

    #[test]
    fn semver_accepts_v_prefix() {
        assert!(is_semver("v1.0.0"));
        assert!(is_semver("0.9.17"));
        assert!(!is_semver("1.0"));
        assert!(!is_semver("1.0.0-beta"));
    }

    #[test]
    fn garbage_signing_seed_is_an_invalid_key() {
        let yaml = minimal_yaml("");
        let seed_line_start = yaml.find("signing_nkey:").expect("seed line");
        let seed_line_end = yaml[seed_line_start..].find('\n').expect("newline") + seed_line_start;
        let yaml = format!(
            "{}signing_nkey: not-a-seed{}",
            &yaml[..seed_line_start],
            &yaml[seed_line_end..]
        );

        let cm = manager(&yaml);
        let err = cm.render(&serde_json::Map::new()).expect_err("validate");
        assert!(matches!(err, ConfigError::InvalidKey { .. }));
    }

    #[test]
    fn service_name_sanitization() {
        assert_eq!(sanitize_service_name("auth broker"), "auth_broker");
        assert_eq!(sanitize_service_name("a.b*c>d/e"), "a_b_c_d_e");
        assert_eq!(sanitize_service_name(".edge."), "edge");
        assert_eq!(sanitize_service_name("clean-name"), "clean-name");
    }

    #[test]
    fn unknown_account_reference_fails() {
        let extra = r#"rbac:
  role_binding:
  - user_account: GHOST
    roles: []
    match:
    - claim: email
      value: a@b.c
"#;
        let cm = manager(&minimal_yaml(extra));
        let err = cm.render(&serde_json::Map::new()).expect_err("validate");
        assert!(matches!(err, ConfigError::UnknownAccount { .. }));
    }

    #[test]
    fn unknown_role_reference_fails() {
        let extra = r#"rbac:
  user_accounts:
  - name: TEAM_A
    public_key: AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA
  role_binding:
  - user_account: TEAM_A
    roles: [missing-role]
    match:
    - claim: email
      value: a@b.c
"#;
        let cm = manager(&minimal_yaml(extra));
        let err = cm.render(&serde_json::Map::new()).expect_err("validate");
        assert!(matches!(err, ConfigError::UnknownRole { .. }));
    }

    #[test]
    fn match_rule_must_name_claim_or_permission() {
        let extra = r#"rbac:
  user_accounts:
  - name: TEAM_A
    public_key: AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA
  role_binding:
  - user_account: TEAM_A
    roles: []
    match:
    - value: dangling
"#;
        let cm = manager(&minimal_yaml(extra));
        let err = cm.render(&serde_json::Map::new()).expect_err("validate");
        assert!(matches!(err, ConfigError::InvalidMatchRule { .. }));
    }

    #[test]
    fn templated_account_renders_per_request() {
        let extra = r#"rbac:
  user_accounts:
  - name: "{{ team }}"
    public_key: AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA
  role_binding:
  - user_account: "{{ team }}"
    roles: []
    match:
    - claim: team
      value: payments
"#;
        let cm = manager(&minimal_yaml(extra));

        let mut ctx = serde_json::Map::new();
        ctx.insert("team".to_string(), json!("payments"));
        let config = cm.render(&ctx).expect("render");
        assert_eq!(config.rbac.user_accounts[0].name, "payments");
        assert_eq!(config.rbac.role_bindings[0].user_account, "payments");

        // A second render with a different context is independent.
        let mut ctx2 = serde_json::Map::new();
        ctx2.insert("team".to_string(), json!("ops"));
        let config2 = cm.render(&ctx2).expect("render");
        assert_eq!(config2.rbac.user_accounts[0].name, "ops");
        assert_eq!(config.rbac.user_accounts[0].name, "payments");
    }

    #[test]
    fn garbage_duration_fails_after_render() {
        let yaml = minimal_yaml("") + "rbac:\n  token_max_expiration: banana\n";
        let cm = manager(&yaml);
        let err = cm.render(&serde_json::Map::new()).expect_err("validate");
        assert!(matches!(err, ConfigError::InvalidDuration { .. }));
    }

    #[test]
    fn templated_duration_is_tolerated_until_context_arrives() {
        let yaml = minimal_yaml("") + "rbac:\n  token_max_expiration: \"{{ ttl }}\"\n";
        let cm = manager(&yaml);

        // Bootstrap render: token unresolved, still a template, tolerated.
        let config = cm.render(&serde_json::Map::new()).expect("render");
        assert_eq!(config.rbac.token_max_expiration.get(), None);

        let mut ctx = serde_json::Map::new();
        ctx.insert("ttl".to_string(), json!("15m"));
        let config = cm.render(&ctx).expect("render");
        assert_eq!(
            config.rbac.token_max_expiration.get(),
            Some(Duration::from_secs(900))
        );
    }

    #[test]
    fn merged_documents_overlay_in_order() {
        let base = minimal_yaml("");
        let overlay = "service:\n  description: overridden\n".to_string();
        let cm = ConfigManager::from_documents(&[
            ("base".to_string(), base),
            ("overlay".to_string(), overlay),
        ])
        .expect("manager");
        let config = cm.render(&serde_json::Map::new()).expect("render");
        assert_eq!(config.service.description, "overridden");
    }

    #[test]
    fn custom_delimiters_flow_from_params() {
        let yaml = minimal_yaml("params:\n  left_delim: \"<%\"\n  right_delim: \"%>\"\n")
            + "rbac:\n  token_max_expiration: \"<% ttl %>\"\n";
        let cm = manager(&yaml);
        assert_eq!(cm.params().left_delim, "<%");

        let mut ctx = serde_json::Map::new();
        ctx.insert("ttl".to_string(), json!("5m"));
        let config = cm.render(&ctx).expect("render");
        assert_eq!(
            config.rbac.token_max_expiration.get(),
            Some(Duration::from_secs(300))
        );
    }
}
