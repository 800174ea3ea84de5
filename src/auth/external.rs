//! EXTERNAL (client-certificate) support: the local fingerprint cache consulted
//! before any IdP lookup, and the negative cache that keeps a missing binding from
//! hammering the IdP.

use std::time::Duration;

use crate::{
    error::Result,
    store::{accounts::Accounts, keys, KvStore},
};

#[derive(Debug, PartialEq)]
pub(crate) enum FingerprintDecision {
    /// A live local binding names this account.
    Bound(String),
    /// A recent lookup came back empty; fail without asking again.
    NegativeCached,
    /// Nothing known locally; ask the IdP.
    Unknown,
}

/// Consults the `fp:` cache (refreshing the binding on use) and then the negative
/// cache.
pub(crate) fn check_local(
    accounts: &Accounts,
    store: &KvStore,
    fingerprint: &str,
    binding_ttl: Duration,
) -> Result<FingerprintDecision> {
    if let Some(binding) = accounts.touch_fingerprint(fingerprint, binding_ttl)? {
        return Ok(FingerprintDecision::Bound(binding.account));
    }
    if store.get(&keys::auth_fail_fingerprint(fingerprint))?.is_some() {
        return Ok(FingerprintDecision::NegativeCached);
    }
    Ok(FingerprintDecision::Unknown)
}

/// Remembers that the IdP has no binding for this fingerprint.
pub(crate) fn record_miss(store: &KvStore, fingerprint: &str, ttl: Duration) -> Result<()> {
    let row = crate::store::unix_now().to_string();
    store.set(
        &keys::auth_fail_fingerprint(fingerprint),
        row.as_bytes(),
        Some(ttl),
    )
}
