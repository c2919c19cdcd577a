//! Expiration of a minted credential.
//!
//! Sources, in order of application: the IdP token's own `exp`, the per-IdP
//! validation bounds (a floor and a ceiling), the role binding's maximum (an
//! override, not a cap), the RBAC-global maximum (a cap), and finally the
//! broker-global bounds which always have the last word.

use std::time::Duration;

use crate::config::{Config, DurationBounds, MaybeDuration};

pub fn calculate_expiration(
    config: &Config,
    now: i64,
    idp_provided_expiry: i64,
    idp_validation_bounds: &DurationBounds,
    binding_max_expiry: &MaybeDuration,
) -> i64 {
    let mut expiry = idp_provided_expiry;

    let at = |offset: Duration| now + offset.as_secs() as i64;

    if let Some(min) = idp_validation_bounds.min.get()
        && min > Duration::ZERO
        && expiry < at(min)
    {
        expiry = at(min);
    }
    if let Some(max) = idp_validation_bounds.max.get()
        && max > Duration::ZERO
        && expiry > at(max)
    {
        expiry = at(max);
    }

    if let Some(binding_max) = binding_max_expiry.get().filter(|d| *d > Duration::ZERO) {
        // A binding's maximum replaces the expiry outright, in both
        // directions, bounded only by the broker-global clamp below.
        expiry = at(binding_max);
    } else if let Some(rbac_max) = config
        .rbac
        .token_max_expiration
        .get()
        .filter(|d| *d > Duration::ZERO)
        && expiry > at(rbac_max)
    {
        expiry = at(rbac_max);
    }

    // Floor then ceiling; when a config sets min above max, max wins.
    let floor = at(config.token_bounds_min());
    let ceiling = at(config.token_bounds_max());
    if expiry < floor {
        expiry = floor;
    }
    if expiry > ceiling {
        expiry = ceiling;
    }
    expiry
}
