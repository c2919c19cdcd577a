//! Role-binding selection and role collation.
//!
//! Given the flattened claim map of a verified token, the resolver picks one
//! role binding under the configured strategy and folds the bound roles into
//! a single set of permissions and limits for the minted credential.

use iam_credentials::{Limits, Permissions, ResponsePermission, TimeRange};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::{Config, MatchRule, MatchingStrategy, MaybeDuration};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("no role-binding matched the token claims")]
    NoBindingMatched,
    #[error("unknown user-account: {0}")]
    UnknownAccount(String),
}

/// Outcome of a successful resolution.
#[derive(Debug, Clone)]
pub struct ResolvedAccess {
    pub account: String,
    pub permissions: Permissions,
    pub limits: Limits,
    pub binding_max_expiry: MaybeDuration,
}

/// Check one criterion against the claim map.
///
/// Claim values match a string directly or by membership in a string list;
/// other value shapes skip the criterion rather than failing the binding.
fn criterion_matches(rule: &MatchRule, context: &Map<String, Value>, binding_index: usize) -> bool {
    if let Some(permission) = rule.permission.as_deref().filter(|p| !p.is_empty()) {
        let matched = match context.get("permissions") {
            Some(Value::String(value)) => value == permission,
            Some(Value::Array(values)) => values
                .iter()
                .any(|v| v.as_str().is_some_and(|s| s == permission)),
            _ => false,
        };
        if matched {
            debug!(permission, binding_index, "match-pass[permission]");
        } else {
            debug!(permission, binding_index, "match-fail[permission]");
        }
        return matched;
    }

    let Some(claim) = rule.claim.as_deref().filter(|c| !c.is_empty()) else {
        return false;
    };
    let expected = rule.value.as_deref().unwrap_or_default();

    let Some(value) = context.get(claim) else {
        trace!(claim, binding_index, "match-skip: claim not in context");
        return false;
    };

    let matched = match value {
        Value::String(actual) => actual == expected,
        Value::Array(values) => values
            .iter()
            .any(|v| v.as_str().is_some_and(|s| s == expected)),
        _ => {
            trace!(claim, binding_index, "match-skip: unsupported value shape");
            false
        }
    };
    if matched {
        debug!(claim, value = expected, binding_index, "match-pass");
    } else {
        debug!(claim, value = expected, binding_index, "match-fail");
    }
    matched
}

/// Select a role binding for `context` and collate its roles.
pub fn resolve_access(
    config: &Config,
    context: &Map<String, Value>,
) -> Result<ResolvedAccess, PolicyError> {
    let strategy = config.rbac.matching_strategy;
    debug!(?strategy, "selecting role binding");

    struct Best {
        hits: usize,
        criteria: usize,
        index: usize,
    }
    let mut best: Option<Best> = None;

    for (index, binding) in config.rbac.role_bindings.iter().enumerate() {
        let criteria = binding.matches.len();
        if criteria == 0 {
            trace!(index, "skipping role binding with no match criteria");
            continue;
        }

        let hits = binding
            .matches
            .iter()
            .filter(|rule| criterion_matches(rule, context, index))
            .count();

        match strategy {
            MatchingStrategy::Strict => {
                if hits == criteria {
                    debug!(index, hits, criteria, account = binding.user_account.as_str(),
                        "selected first strictly matching role binding");
                    return collate(config, index);
                }
            }
            MatchingStrategy::BestMatch => {
                if hits == 0 {
                    continue;
                }
                let better = match &best {
                    None => true,
                    Some(current) => {
                        hits > current.hits
                            || (hits == current.hits && criteria > current.criteria)
                    }
                };
                if better {
                    debug!(index, hits, criteria, "new best role binding candidate");
                    best = Some(Best {
                        hits,
                        criteria,
                        index,
                    });
                }
            }
        }
    }

    match (strategy, best) {
        (MatchingStrategy::BestMatch, Some(best)) => {
            let binding = &config.rbac.role_bindings[best.index];
            debug!(
                index = best.index,
                hits = best.hits,
                criteria = best.criteria,
                account = binding.user_account.as_str(),
                "selected role binding using best_match strategy"
            );
            collate(config, best.index)
        }
        _ => Err(PolicyError::NoBindingMatched),
    }
}

fn collate(config: &Config, binding_index: usize) -> Result<ResolvedAccess, PolicyError> {
    let binding = &config.rbac.role_bindings[binding_index];
    let mut permissions = Permissions::default();
    let mut limits = Limits::default();
    let mut resp = ResponsePermission::default();

    for role_name in &binding.roles {
        let Some(role) = config.lookup_role(role_name) else {
            // Validation keeps this from happening on loaded configs.
            debug!(role = role_name.as_str(), "skipping unknown role");
            continue;
        };
        trace!(role = role_name.as_str(), "assigning role");

        permissions
            .publish
            .allow
            .extend(role.permissions.publish.allow.iter().cloned());
        permissions
            .publish
            .deny
            .extend(role.permissions.publish.deny.iter().cloned());
        permissions
            .subscribe
            .allow
            .extend(role.permissions.subscribe.allow.iter().cloned());
        permissions
            .subscribe
            .deny
            .extend(role.permissions.subscribe.deny.iter().cloned());

        if role.permissions.resp.max_msgs > 0 {
            resp.max_msgs = role.permissions.resp.max_msgs;
        }
        if let Some(expires) = role.permissions.resp.expires.get()
            && !expires.is_zero()
        {
            resp.expires_ns = expires.as_nanos() as i64;
        }

        limits.src.extend(role.limits.src.iter().cloned());
        if !role.limits.times.is_empty() {
            limits.times = role
                .limits
                .times
                .iter()
                .map(|range| TimeRange {
                    start: range.start.clone(),
                    end: range.end.clone(),
                })
                .collect();
        }
        if !role.limits.locale.is_empty() {
            limits.locale = role.limits.locale.clone();
        }
        if let Some(subs) = role.limits.subs {
            limits.subs = subs;
        }
        if let Some(data) = role.limits.data {
            limits.data = data;
        }
        if let Some(payload) = role.limits.payload {
            limits.payload = payload;
        }
    }

    if resp != ResponsePermission::default() {
        permissions.resp = Some(resp);
    }

    Ok(ResolvedAccess {
        account: binding.user_account.clone(),
        permissions,
        limits,
        binding_max_expiry: binding.token_max_expiration.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        MatchRule, PermissionSpec, RbacConfig, Role, RoleBinding, RoleLimits, RolePermissions,
        ResponseSpec, UserAccountInfo,
    };
    use serde_json::json;
    use std::time::Duration;

    fn claim_match(claim: &str, value: &str) -> MatchRule {
        MatchRule {
            claim: Some(claim.to_string()),
            value: Some(value.to_string()),
            permission: None,
        }
    }

    fn permission_match(permission: &str) -> MatchRule {
        MatchRule {
            claim: None,
            value: None,
            permission: Some(permission.to_string()),
        }
    }

    fn role(name: &str, pub_allow: &[&str]) -> Role {
        Role {
            name: name.to_string(),
            permissions: RolePermissions {
                publish: PermissionSpec {
                    allow: pub_allow.iter().map(|s| s.to_string()).collect(),
                    deny: Vec::new(),
                },
                ..RolePermissions::default()
            },
            limits: RoleLimits::default(),
        }
    }

    fn binding(account: &str, roles: &[&str], matches: Vec<MatchRule>) -> RoleBinding {
        RoleBinding {
            user_account: account.to_string(),
            roles: roles.iter().map(|s| s.to_string()).collect(),
            token_max_expiration: MaybeDuration::Unset,
            matches,
        }
    }

    fn config_with(rbac: RbacConfig) -> Config {
        Config {
            rbac,
            ..Config::default()
        }
    }

    fn context(value: serde_json::Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn best_match_prefers_more_hits() {
        let cfg = config_with(RbacConfig {
            user_accounts: vec![
                UserAccountInfo {
                    name: "A".into(),
                    ..UserAccountInfo::default()
                },
                UserAccountInfo {
                    name: "B".into(),
                    ..UserAccountInfo::default()
                },
            ],
            role_bindings: vec![
                binding("A", &[], vec![claim_match("email", "a@x.y")]),
                binding(
                    "B",
                    &[],
                    vec![claim_match("email", "a@x.y"), claim_match("team", "ops")],
                ),
            ],
            ..RbacConfig::default()
        });

        let access = resolve_access(&cfg, &context(json!({"email": "a@x.y", "team": "ops"})))
            .expect("resolve");
        assert_eq!(access.account, "B");
    }

    #[test]
    fn best_match_tie_breaks_on_criteria_then_declaration_order() {
        let cfg = config_with(RbacConfig {
            role_bindings: vec![
                // One hit out of one criterion.
                binding("FIRST", &[], vec![claim_match("email", "a@x.y")]),
                // One hit out of two criteria: more specific, same hits.
                binding(
                    "SECOND",
                    &[],
                    vec![claim_match("email", "a@x.y"), claim_match("team", "absent")],
                ),
                // Identical shape to SECOND, declared later.
                binding(
                    "THIRD",
                    &[],
                    vec![claim_match("email", "a@x.y"), claim_match("team", "absent")],
                ),
            ],
            ..RbacConfig::default()
        });

        let access =
            resolve_access(&cfg, &context(json!({"email": "a@x.y"}))).expect("resolve");
        assert_eq!(access.account, "SECOND");
    }

    #[test]
    fn strict_requires_every_criterion() {
        let cfg = config_with(RbacConfig {
            matching_strategy: MatchingStrategy::Strict,
            role_bindings: vec![
                binding(
                    "PARTIAL",
                    &[],
                    vec![claim_match("email", "a@x.y"), claim_match("team", "absent")],
                ),
                binding("FULL", &[], vec![claim_match("email", "a@x.y")]),
            ],
            ..RbacConfig::default()
        });

        let access =
            resolve_access(&cfg, &context(json!({"email": "a@x.y"}))).expect("resolve");
        assert_eq!(access.account, "FULL");
    }

    #[test]
    fn zero_criteria_bindings_are_skipped_under_both_strategies() {
        for strategy in [MatchingStrategy::BestMatch, MatchingStrategy::Strict] {
            let cfg = config_with(RbacConfig {
                matching_strategy: strategy,
                role_bindings: vec![binding("OPEN", &[], Vec::new())],
                ..RbacConfig::default()
            });
            assert!(matches!(
                resolve_access(&cfg, &context(json!({"email": "a@x.y"}))),
                Err(PolicyError::NoBindingMatched)
            ));
        }
    }

    #[test]
    fn no_binding_matched_error() {
        let cfg = config_with(RbacConfig {
            role_bindings: vec![binding("A", &[], vec![claim_match("email", "x@y.z")])],
            ..RbacConfig::default()
        });
        assert!(matches!(
            resolve_access(&cfg, &context(json!({"email": "other@y.z"}))),
            Err(PolicyError::NoBindingMatched)
        ));
    }

    #[test]
    fn claim_list_membership_matches() {
        let cfg = config_with(RbacConfig {
            role_bindings: vec![binding("A", &[], vec![claim_match("groups", "admins")])],
            ..RbacConfig::default()
        });
        let access = resolve_access(&cfg, &context(json!({"groups": ["users", "admins"]})))
            .expect("resolve");
        assert_eq!(access.account, "A");
    }

    #[test]
    fn unsupported_claim_shapes_skip_not_fail() {
        let cfg = config_with(RbacConfig {
            role_bindings: vec![binding(
                "A",
                &[],
                vec![claim_match("count", "3"), claim_match("email", "a@x.y")],
            )],
            ..RbacConfig::default()
        });
        // `count` is a number: that criterion is skipped, the email hit
        // still selects the binding under best_match.
        let access = resolve_access(&cfg, &context(json!({"count": 3, "email": "a@x.y"})))
            .expect("resolve");
        assert_eq!(access.account, "A");
    }

    #[test]
    fn permission_criterion_matches_string_and_list() {
        let cfg = config_with(RbacConfig {
            role_bindings: vec![binding("A", &[], vec![permission_match("deploy")])],
            ..RbacConfig::default()
        });
        assert!(resolve_access(&cfg, &context(json!({"permissions": "deploy"}))).is_ok());
        assert!(
            resolve_access(&cfg, &context(json!({"permissions": ["read", "deploy"]}))).is_ok()
        );
        assert!(resolve_access(&cfg, &context(json!({"permissions": ["read"]}))).is_err());
    }

    #[test]
    fn collation_unions_permissions_and_takes_last_limits() {
        let mut reader = role("reader", &["data.read.>"]);
        reader.permissions.subscribe.allow.push("events.>".into());
        reader.limits.subs = Some(10);
        reader.limits.src = vec!["10.0.0.0/8".into()];
        reader.permissions.resp = ResponseSpec {
            max_msgs: 5,
            expires: MaybeDuration::Parsed(Duration::from_secs(60)),
        };

        let mut writer = role("writer", &["data.write.>"]);
        writer.limits.subs = Some(50);
        writer.limits.payload = Some(1024);
        writer.limits.src = vec!["192.168.0.0/16".into()];
        writer.limits.locale = "Europe/London".into();

        let cfg = config_with(RbacConfig {
            roles: vec![reader, writer],
            role_bindings: vec![binding(
                "A",
                &["reader", "writer"],
                vec![claim_match("email", "a@x.y")],
            )],
            ..RbacConfig::default()
        });

        let access =
            resolve_access(&cfg, &context(json!({"email": "a@x.y"}))).expect("resolve");
        assert_eq!(
            access.permissions.publish.allow,
            vec!["data.read.>", "data.write.>"]
        );
        assert_eq!(access.permissions.subscribe.allow, vec!["events.>"]);
        let resp = access.permissions.resp.expect("resp");
        assert_eq!(resp.max_msgs, 5);
        assert_eq!(resp.expires_ns, 60_000_000_000);
        // Last value across roles for scalar limits; union for sources.
        assert_eq!(access.limits.subs, 50);
        assert_eq!(access.limits.payload, 1024);
        assert_eq!(access.limits.data, -1);
        assert_eq!(access.limits.locale, "Europe/London");
        assert_eq!(access.limits.src, vec!["10.0.0.0/8", "192.168.0.0/16"]);
    }

    #[test]
    fn resolution_is_deterministic() {
        let cfg = config_with(RbacConfig {
            roles: vec![role("r", &["a.>"])],
            role_bindings: vec![binding("A", &["r"], vec![claim_match("email", "a@x.y")])],
            ..RbacConfig::default()
        });
        let ctx = context(json!({"email": "a@x.y"}));
        let first = resolve_access(&cfg, &ctx).expect("resolve");
        let second = resolve_access(&cfg, &ctx).expect("resolve");
        assert_eq!(first.account, second.account);
        assert_eq!(first.permissions, second.permissions);
        assert_eq!(first.limits, second.limits);
    }
}
