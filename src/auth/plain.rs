//! PLAIN payload parsing and the positive/negative credential caches.

use std::time::Duration;

use md5::{Digest, Md5};

use crate::{
    error::{Error, Result},
    store::{keys, unix_now, KvStore},
};

/// Decoded `\0<authzid>\0<authcid>\0<password>` payload.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PlainCredentials {
    pub(crate) authzid: Option<String>,
    pub(crate) authcid: String,
    pub(crate) password: String,
}

pub(crate) fn parse_payload(bytes: &[u8]) -> Result<PlainCredentials> {
    let malformed = || Error::invalid_authentication_payload("PLAIN");
    let mut parts = bytes.split(|&b| b == 0);
    let authzid = parts.next().ok_or_else(malformed)?;
    let authcid = parts.next().ok_or_else(malformed)?;
    let password = parts.next().ok_or_else(malformed)?;
    if parts.next().is_some() {
        return Err(malformed());
    }

    let authcid = String::from_utf8(authcid.to_vec()).map_err(|_| malformed())?;
    let password = String::from_utf8(password.to_vec()).map_err(|_| malformed())?;
    if authcid.is_empty() || password.is_empty() {
        return Err(malformed());
    }
    let authzid = match authzid {
        [] => None,
        raw => Some(String::from_utf8(raw.to_vec()).map_err(|_| malformed())?),
    };
    Ok(PlainCredentials {
        authzid,
        authcid,
        password,
    })
}

/// The digest stored in cache rows. Never the plaintext.
pub(crate) fn credential_hash(authcid: &str, password: &str) -> String {
    hex::encode(Md5::digest(format!("{}:{}", authcid, password)))
}

#[derive(Debug, PartialEq)]
pub(crate) enum CacheDecision {
    /// The positive cache vouches for these exact credentials.
    Hit,
    /// The negative cache remembers these exact credentials failing recently.
    FailFast,
    /// Nothing cached; consult the verifier chain.
    Miss,
}

/// Consults `authsuccess:` then `authfail:`. A positive row is honored only when the
/// stored digest matches the presented credentials and its timestamp is within TTL.
pub(crate) fn check_caches(
    store: &KvStore,
    authcid: &str,
    cred_hash: &str,
    success_ttl: Duration,
) -> Result<CacheDecision> {
    if let Some(row) = store.get_str(&keys::auth_success(authcid))? {
        if let Some((ts, stored_hash)) = row.split_once(':') {
            let fresh = ts
                .parse::<u64>()
                .is_ok_and(|ts| unix_now().saturating_sub(ts) < success_ttl.as_secs());
            if fresh && stored_hash == cred_hash {
                return Ok(CacheDecision::Hit);
            }
        }
    }
    if store.get(&keys::auth_fail(cred_hash))?.is_some() {
        return Ok(CacheDecision::FailFast);
    }
    Ok(CacheDecision::Miss)
}

pub(crate) fn record_success(
    store: &KvStore,
    authcid: &str,
    cred_hash: &str,
    ttl: Duration,
) -> Result<()> {
    let row = format!("{}:{}", unix_now(), cred_hash);
    store.set(&keys::auth_success(authcid), row.as_bytes(), Some(ttl))?;
    // A success also clears any lingering negative entry for the same credentials.
    store.delete(&keys::auth_fail(cred_hash))
}

pub(crate) fn record_failure(store: &KvStore, cred_hash: &str, ttl: Duration) -> Result<()> {
    let now = unix_now();
    let row = format!("{}:{}", now, now + ttl.as_secs());
    store.set(&keys::auth_fail(cred_hash), row.as_bytes(), Some(ttl))
}
