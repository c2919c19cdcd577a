//! Possibly-templated scalar fields.
//!
//! Durations and nkey seeds in the configuration may be template tokens that
//! only resolve once a request's claim map is available. Deserialization
//! therefore never fails outright: a value parses now, stays around as raw
//! text for a later render, or is absent. Validation decides which of those
//! states is acceptable after each render pass.

use std::fmt;
use std::time::Duration;

use iam_credentials::{ExchangeKey, SigningKey, redact_key};
use serde::{Deserialize, Deserializer};
use tracing::debug;

/// Accept any YAML scalar where a templated string may appear; `None` for
/// null or whitespace-only values.
fn scalar_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Str(String),
        Int(i64),
        Float(f64),
        Bool(bool),
        Null,
    }

    let text = match Scalar::deserialize(deserializer)? {
        Scalar::Str(s) => s,
        Scalar::Int(i) => i.to_string(),
        Scalar::Float(f) => f.to_string(),
        Scalar::Bool(b) => b.to_string(),
        Scalar::Null => return Ok(None),
    };
    if text.trim().is_empty() {
        Ok(None)
    } else {
        Ok(Some(text))
    }
}

/// Parse durations of the form `90s`, `5m`, `1h30m`, `2d`, `1w`, `250ms`.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut unit = String::new();
    let mut saw_component = false;

    let mut flush = |number: &mut String, unit: &mut String| -> Result<(), String> {
        if number.is_empty() {
            return Err(format!("missing value before unit '{unit}'"));
        }
        let value: u64 = number
            .parse()
            .map_err(|_| format!("invalid number '{number}'"))?;
        let component = match unit.as_str() {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            "d" => Duration::from_secs(value * 86_400),
            "w" => Duration::from_secs(value * 604_800),
            other => return Err(format!("unknown unit '{other}'")),
        };
        total += component;
        number.clear();
        unit.clear();
        Ok(())
    };

    for c in text.chars() {
        if c.is_ascii_digit() {
            if !unit.is_empty() {
                flush(&mut number, &mut unit)?;
                saw_component = true;
            }
            number.push(c);
        } else if c.is_ascii_alphabetic() {
            unit.push(c);
        } else {
            return Err(format!("unexpected character '{c}'"));
        }
    }
    if !unit.is_empty() {
        flush(&mut number, &mut unit)?;
        saw_component = true;
    } else if !number.is_empty() {
        return Err(format!("missing unit after '{number}'"));
    }

    if !saw_component {
        return Err("empty duration".to_string());
    }
    Ok(total)
}

/// A duration field that may still be a template token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MaybeDuration {
    #[default]
    Unset,
    Parsed(Duration),
    Unparsed(String),
}

impl MaybeDuration {
    pub fn get(&self) -> Option<Duration> {
        match self {
            MaybeDuration::Parsed(d) => Some(*d),
            _ => None,
        }
    }

    /// Duration if parsed, zero otherwise.
    pub fn or_zero(&self) -> Duration {
        self.get().unwrap_or(Duration::ZERO)
    }

    pub fn is_positive(&self) -> bool {
        self.get().is_some_and(|d| d > Duration::ZERO)
    }

    pub fn raw_text(&self) -> Option<&str> {
        match self {
            MaybeDuration::Unparsed(raw) => Some(raw),
            _ => None,
        }
    }
}

impl fmt::Display for MaybeDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaybeDuration::Unset => write!(f, "unset"),
            MaybeDuration::Parsed(d) => write!(f, "{}s", d.as_secs()),
            MaybeDuration::Unparsed(raw) => write!(f, "unparsed({raw})"),
        }
    }
}

impl<'de> Deserialize<'de> for MaybeDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let Some(text) = scalar_text(deserializer)? else {
            return Ok(MaybeDuration::Unset);
        };
        match parse_duration(&text) {
            Ok(duration) => Ok(MaybeDuration::Parsed(duration)),
            Err(err) => {
                debug!(value = %text, error = %err, "duration did not parse, keeping raw text");
                Ok(MaybeDuration::Unparsed(text))
            }
        }
    }
}

/// An Ed25519 signing seed that may still be a template token.
#[derive(Clone, Default)]
pub enum MaybeSeed {
    #[default]
    Unset,
    Parsed(SigningKey),
    Unparsed(String),
}

impl MaybeSeed {
    pub fn get(&self) -> Option<&SigningKey> {
        match self {
            MaybeSeed::Parsed(key) => Some(key),
            _ => None,
        }
    }

    pub fn raw_text(&self) -> Option<&str> {
        match self {
            MaybeSeed::Unparsed(raw) => Some(raw),
            _ => None,
        }
    }
}

impl fmt::Debug for MaybeSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaybeSeed::Unset => write!(f, "MaybeSeed::Unset"),
            MaybeSeed::Parsed(key) => write!(f, "MaybeSeed::Parsed({})", key.public_key()),
            MaybeSeed::Unparsed(raw) => write!(f, "MaybeSeed::Unparsed({})", redact_key(raw)),
        }
    }
}

impl<'de> Deserialize<'de> for MaybeSeed {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let Some(text) = scalar_text(deserializer)? else {
            return Ok(MaybeSeed::Unset);
        };
        let trimmed = text.trim();
        match SigningKey::from_seed(trimmed) {
            Ok(key) => Ok(MaybeSeed::Parsed(key)),
            Err(err) => {
                debug!(value = %redact_key(trimmed), error = %err, "nkey seed did not parse, keeping raw text");
                Ok(MaybeSeed::Unparsed(text))
            }
        }
    }
}

/// A Curve25519 exchange seed that may still be a template token.
#[derive(Clone, Default)]
pub enum MaybeXKey {
    #[default]
    Unset,
    Parsed(ExchangeKey),
    Unparsed(String),
}

impl MaybeXKey {
    pub fn get(&self) -> Option<&ExchangeKey> {
        match self {
            MaybeXKey::Parsed(key) => Some(key),
            _ => None,
        }
    }

    pub fn raw_text(&self) -> Option<&str> {
        match self {
            MaybeXKey::Unparsed(raw) => Some(raw),
            _ => None,
        }
    }
}

impl fmt::Debug for MaybeXKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaybeXKey::Unset => write!(f, "MaybeXKey::Unset"),
            MaybeXKey::Parsed(key) => write!(f, "MaybeXKey::Parsed({})", key.public_key()),
            MaybeXKey::Unparsed(raw) => write!(f, "MaybeXKey::Unparsed({})", redact_key(raw)),
        }
    }
}

impl<'de> Deserialize<'de> for MaybeXKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let Some(text) = scalar_text(deserializer)? else {
            return Ok(MaybeXKey::Unset);
        };
        let trimmed = text.trim();
        match ExchangeKey::from_seed(trimmed) {
            Ok(key) => Ok(MaybeXKey::Parsed(key)),
            Err(err) => {
                debug!(value = %redact_key(trimmed), error = %err, "xkey seed did not parse, keeping raw text");
                Ok(MaybeXKey::Unparsed(text))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_and_compound_durations() {
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172_800));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration(" 1w ").unwrap(), Duration::from_secs(604_800));
    }

    #[test]
    fn rejects_bare_numbers_and_garbage() {
        assert!(parse_duration("300").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("{{ exp }}").is_err());
    }

    #[test]
    fn maybe_duration_keeps_template_text() {
        let parsed: MaybeDuration = serde_yaml::from_str("\"10m\"").expect("yaml");
        assert_eq!(parsed.get(), Some(Duration::from_secs(600)));

        let templated: MaybeDuration =
            serde_yaml::from_str("\"{{ custom_ttl }}\"").expect("yaml");
        assert_eq!(templated.raw_text(), Some("{{ custom_ttl }}"));
        assert_eq!(templated.or_zero(), Duration::ZERO);

        let empty: MaybeDuration = serde_yaml::from_str("\"\"").expect("yaml");
        assert_eq!(empty, MaybeDuration::Unset);
    }

    #[test]
    fn maybe_seed_two_phase() {
        let key = SigningKey::generate_account();
        let seed = key.seed().expect("seed");

        let parsed: MaybeSeed = serde_yaml::from_str(&format!("\"{seed}\"")).expect("yaml");
        let restored = parsed.get().expect("parsed");
        assert_eq!(restored.public_key(), key.public_key());

        let templated: MaybeSeed =
            serde_yaml::from_str("\"{{ readFile \\\"/secrets/seed\\\" }}\"").expect("yaml");
        assert!(templated.get().is_none());
        assert!(templated.raw_text().is_some());
    }

    #[test]
    fn maybe_xkey_two_phase() {
        let key = ExchangeKey::generate();
        let seed = key.seed().expect("seed");

        let parsed: MaybeXKey = serde_yaml::from_str(&format!("\"{seed}\"")).expect("yaml");
        assert_eq!(parsed.get().expect("parsed").public_key(), key.public_key());

        let garbage: MaybeXKey = serde_yaml::from_str("\"not-an-xkey\"").expect("yaml");
        assert!(garbage.get().is_none());
        assert_eq!(garbage.raw_text(), Some("not-an-xkey"));
    }
}
