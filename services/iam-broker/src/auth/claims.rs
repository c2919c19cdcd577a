//! Normalized view of a verified IdP token's claims.
//!
//! The verifier produces two things from one token: a typed record of the
//! registered claims the broker cares about, and a flattened map of every
//! claim for template rendering and role-binding matching. Custom claims can
//! be renamed through a per-IdP mapping; a rename may fill a registered name
//! the token left empty but never displaces a populated one.

use std::collections::HashMap;

use serde_json::{Map, Value};

/// Claims carried by a verified IdP token.
///
/// See <https://www.iana.org/assignments/jwt/jwt.xhtml#claims> for the
/// registered names.
#[derive(Debug, Clone, Default)]
pub struct IdpClaims {
    pub subject: String,
    pub audience: Vec<String>,
    pub expiry: i64,
    pub issued_at: i64,
    pub not_before: i64,
    pub jwt_id: String,
    pub name: String,
    pub given_name: String,
    pub family_name: String,
    pub preferred_username: String,
    pub nickname: String,
    pub gender: String,
    pub zoneinfo: String,
    pub locale: String,
    pub client_id: String,
    pub groups: Value,
    pub roles: Value,
    pub email: String,
    pub email_verified: bool,
    pub picture: String,
    pub access_token_hash: String,
    pub also_known_as: String,
    /// Everything else, after custom-mapping renames.
    pub custom: Map<String, Value>,
}

fn as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn as_i64(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n.as_i64().unwrap_or_else(|| {
            n.as_f64().map(|f| f as i64).unwrap_or_default()
        }),
        _ => 0,
    }
}

/// `aud` is a string or an array of strings; canonicalize to an array.
fn as_audience(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items.iter().map(as_string).collect(),
        _ => Vec::new(),
    }
}

impl IdpClaims {
    /// Build the typed record plus custom map from raw token claims.
    ///
    /// `custom_mapping` renames non-registered keys as they land in the
    /// custom map.
    pub fn from_raw(raw: &Map<String, Value>, custom_mapping: &HashMap<String, String>) -> Self {
        let mut claims = IdpClaims::default();
        claims.apply_raw(raw, custom_mapping);
        claims
    }

    /// Merge `raw` into this record in place; used both at construction and
    /// when user-info claims arrive later.
    pub fn apply_raw(&mut self, raw: &Map<String, Value>, custom_mapping: &HashMap<String, String>) {
        for (key, value) in raw {
            match key.as_str() {
                "sub" => self.subject = as_string(value),
                "aud" => self.audience = as_audience(value),
                "exp" => self.expiry = as_i64(value),
                "iat" => self.issued_at = as_i64(value),
                "nbf" => self.not_before = as_i64(value),
                "jti" => self.jwt_id = as_string(value),
                "name" => self.name = as_string(value),
                "given_name" => self.given_name = as_string(value),
                "family_name" => self.family_name = as_string(value),
                "preferred_username" => self.preferred_username = as_string(value),
                "nickname" => self.nickname = as_string(value),
                "gender" => self.gender = as_string(value),
                "zoneinfo" => self.zoneinfo = as_string(value),
                "locale" => self.locale = as_string(value),
                "client_id" => self.client_id = as_string(value),
                "groups" => self.groups = value.clone(),
                "roles" => self.roles = value.clone(),
                "email" => self.email = as_string(value),
                "email_verified" => self.email_verified = value.as_bool().unwrap_or_default(),
                "picture" => self.picture = as_string(value),
                "at_hash" => self.access_token_hash = as_string(value),
                "also_known_as" => self.also_known_as = as_string(value),
                other => {
                    let target = custom_mapping
                        .get(other)
                        .cloned()
                        .unwrap_or_else(|| other.to_string());
                    self.custom.insert(target, value.clone());
                }
            }
        }
    }

    /// Flatten into a single map: registered claims under their standard
    /// names, custom claims under their (possibly renamed) keys. A custom
    /// entry may fill a registered name the token left empty, but never
    /// overwrites a populated one.
    pub fn flatten(&self) -> Map<String, Value> {
        let mut out = Map::new();

        let mut put_str = |key: &str, value: &str| {
            if !value.is_empty() {
                out.insert(key.to_string(), Value::String(value.to_string()));
            }
        };
        put_str("sub", &self.subject);
        put_str("jti", &self.jwt_id);
        put_str("name", &self.name);
        put_str("given_name", &self.given_name);
        put_str("family_name", &self.family_name);
        put_str("preferred_username", &self.preferred_username);
        put_str("nickname", &self.nickname);
        put_str("gender", &self.gender);
        put_str("zoneinfo", &self.zoneinfo);
        put_str("locale", &self.locale);
        put_str("client_id", &self.client_id);
        put_str("email", &self.email);
        put_str("picture", &self.picture);
        put_str("at_hash", &self.access_token_hash);
        put_str("also_known_as", &self.also_known_as);

        if !self.audience.is_empty() {
            out.insert(
                "aud".to_string(),
                Value::Array(
                    self.audience
                        .iter()
                        .map(|a| Value::String(a.clone()))
                        .collect(),
                ),
            );
        }
        if self.expiry != 0 {
            out.insert("exp".to_string(), Value::from(self.expiry));
        }
        if self.issued_at != 0 {
            out.insert("iat".to_string(), Value::from(self.issued_at));
        }
        if self.not_before != 0 {
            out.insert("nbf".to_string(), Value::from(self.not_before));
        }
        if self.email_verified {
            out.insert("email_verified".to_string(), Value::Bool(true));
        }
        if !self.groups.is_null() {
            out.insert("groups".to_string(), self.groups.clone());
        }
        if !self.roles.is_null() {
            out.insert("roles".to_string(), self.roles.clone());
        }

        for (key, value) in &self.custom {
            out.entry(key.clone()).or_insert_with(|| value.clone());
        }

        out
    }

    /// True when every named claim exists in the flattened map.
    pub fn missing_claim(&self, required: &[String]) -> Option<String> {
        let flat = self.flatten();
        required
            .iter()
            .find(|claim| !flat.contains_key(claim.as_str()))
            .cloned()
    }

    pub fn audience_intersects(&self, expected: &[String]) -> bool {
        self.audience.iter().any(|aud| expected.contains(aud))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn registered_claims_land_in_typed_fields() {
        let claims = IdpClaims::from_raw(
            &raw(json!({
                "sub": "user-1",
                "aud": "app1",
                "exp": 1_900_000_000i64,
                "iat": 1_899_999_000i64,
                "email": "alice@example.com",
                "email_verified": true,
                "name": "Alice",
            })),
            &HashMap::new(),
        );

        assert_eq!(claims.subject, "user-1");
        assert_eq!(claims.audience, vec!["app1"]);
        assert_eq!(claims.expiry, 1_900_000_000);
        assert_eq!(claims.email, "alice@example.com");
        assert!(claims.email_verified);
    }

    #[test]
    fn audience_array_is_canonicalized() {
        let single = IdpClaims::from_raw(&raw(json!({"aud": "one"})), &HashMap::new());
        let multi = IdpClaims::from_raw(&raw(json!({"aud": ["one", "two"]})), &HashMap::new());
        assert_eq!(single.audience, vec!["one"]);
        assert_eq!(multi.audience, vec!["one", "two"]);
    }

    #[test]
    fn custom_mapping_renames_custom_claims() {
        let mut mapping = HashMap::new();
        mapping.insert("https://example/roles".to_string(), "app_roles".to_string());

        let claims = IdpClaims::from_raw(
            &raw(json!({
                "sub": "u",
                "https://example/roles": ["admin"],
            })),
            &mapping,
        );

        let flat = claims.flatten();
        assert_eq!(flat["app_roles"], json!(["admin"]));
        assert!(!flat.contains_key("https://example/roles"));
    }

    #[test]
    fn custom_mapping_cannot_shadow_registered_claims() {
        let mut mapping = HashMap::new();
        mapping.insert("tenant_email".to_string(), "email".to_string());

        let claims = IdpClaims::from_raw(
            &raw(json!({
                "email": "real@example.com",
                "tenant_email": "spoof@example.com",
            })),
            &mapping,
        );

        let flat = claims.flatten();
        // The registered claim keeps its value; the renamed entry loses out
        // and its original key is gone because the mapping renamed it.
        assert_eq!(flat["email"], json!("real@example.com"));
        assert!(!flat.contains_key("tenant_email"));
    }

    #[test]
    fn custom_mapping_fills_empty_registered_claims() {
        let mut mapping = HashMap::new();
        mapping.insert("https://example/roles".to_string(), "roles".to_string());

        let claims = IdpClaims::from_raw(
            &raw(json!({
                "sub": "u",
                "https://example/roles": ["admin"],
            })),
            &mapping,
        );

        // The token carried no standard `roles` claim, so the mapped entry
        // is visible under the standard name.
        let flat = claims.flatten();
        assert_eq!(flat["roles"], json!(["admin"]));
        assert!(!flat.contains_key("https://example/roles"));
    }

    #[test]
    fn custom_claims_never_overwrite_registered_in_flatten() {
        let mut claims = IdpClaims::from_raw(
            &raw(json!({"email": "real@example.com"})),
            &HashMap::new(),
        );
        // Simulate a hostile custom entry that aliases a registered key.
        claims
            .custom
            .insert("email".to_string(), json!("spoof@example.com"));

        let flat = claims.flatten();
        assert_eq!(flat["email"], json!("real@example.com"));
    }

    #[test]
    fn missing_claim_reports_first_absent() {
        let claims = IdpClaims::from_raw(
            &raw(json!({"sub": "u", "email": "a@b.c"})),
            &HashMap::new(),
        );
        assert_eq!(claims.missing_claim(&["email".to_string()]), None);
        assert_eq!(
            claims.missing_claim(&["email".to_string(), "department".to_string()]),
            Some("department".to_string())
        );
    }

    #[test]
    fn user_info_merge_overwrites_existing() {
        let mut claims = IdpClaims::from_raw(
            &raw(json!({"sub": "u", "name": "Old Name"})),
            &HashMap::new(),
        );
        claims.apply_raw(
            &raw(json!({"name": "New Name", "department": "eng"})),
            &HashMap::new(),
        );
        let flat = claims.flatten();
        assert_eq!(flat["name"], json!("New Name"));
        assert_eq!(flat["department"], json!("eng"));
    }
}
