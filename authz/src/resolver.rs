//! Binding policy resolution.
//!
//! Derives the bind keys a user's pending permissions may have been
//! addressed to, from the user's identity and the active binding mode.

use authz_core::{BindKey, BindMode, Identity};
use std::collections::HashSet;

/// Candidate bind keys for `identity` under `mode`, in identity order with
/// duplicates removed.
///
/// An identity that cannot satisfy the mode (no verified email, no username,
/// no linked account) yields no candidates. Modes never fall back to one
/// another.
pub fn resolve_bind_keys(identity: &Identity, mode: BindMode) -> Vec<BindKey> {
    let keys: Vec<BindKey> = match mode {
        BindMode::Email => identity.verified_emails().map(BindKey::internal).collect(),
        BindMode::Username => identity
            .username
            .iter()
            .filter(|name| !name.is_empty())
            .map(BindKey::internal)
            .collect(),
        BindMode::Unset => identity
            .external_accounts
            .iter()
            .map(|account| account.spec.bind_key())
            .collect()
    };

    let mut seen = HashSet::new();
    keys.into_iter()
        .filter(|key| seen.insert(key.clone()))
        .collect()
}
