//! Key redaction for log output.
//!
//! NKey strings classify by their first character: `S` seeds and `P` private
//! keys are sensitive, the public prefixes (`N`, `A`, `C`, `O`, `U`, `X`)
//! are not. Anything else that looks base32-encoded is masked as a
//! precaution; arbitrary strings pass through untouched.

const VISIBLE_PREFIX_LEN: usize = 2;
const BASE32_ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Returns a masked rendition of `key` safe to include in log output.
pub fn redact_key(key: &str) -> String {
    if key.is_empty() || !key.is_ascii() {
        return key.to_string();
    }

    let first = key.as_bytes()[0] as char;

    if key.len() > 1 {
        // Private keys show only the prefix character.
        if first == 'P' {
            return format!("P{}", "*".repeat(key.len() - 1));
        }

        // Seeds keep two characters: the second encodes the key class.
        if first == 'S' {
            if key.len() <= VISIBLE_PREFIX_LEN {
                return key.to_string();
            }
            return format!(
                "{}{}",
                &key[..VISIBLE_PREFIX_LEN],
                "*".repeat(key.len() - VISIBLE_PREFIX_LEN)
            );
        }

        if matches!(first, 'N' | 'A' | 'C' | 'O' | 'U' | 'X') {
            return key.to_string();
        }
    }

    if key.len() <= VISIBLE_PREFIX_LEN {
        return key.to_string();
    }

    // Mask anything else that could plausibly be key material.
    if key.chars().all(|c| BASE32_ALPHABET.contains(c)) {
        return format!(
            "{}{}",
            &key[..VISIBLE_PREFIX_LEN],
            "*".repeat(key.len() - VISIBLE_PREFIX_LEN)
        );
    }

    key.to_string()
}
