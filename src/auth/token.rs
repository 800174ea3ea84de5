//! Server-minted session tokens.
//!
//! A token lets a reconnecting client skip the IdP round trip. It is stored in two
//! forms: a password-form row consulted when the client presents `x3tok:<id>` as a
//! PLAIN password, and SCRAM-form rows so the same secret works as username
//! `x3scram:<id>` over SCRAM without ever being retransmitted.
//!
//! Tokens record the account's version counter at mint time; bulk revocation bumps
//! `sessver:<account>`, which invalidates every earlier token in both forms without
//! enumeration.

use std::time::Duration;

use rand::RngCore;

use crate::{
    error::{Error, Result},
    scram::{ScramVerifier, ScramVersion, HASH_NAMES},
    store::{keys, unix_now, KvStore},
};

/// Prefix a PLAIN password carries when it is really a session token.
pub const PASSWORD_PREFIX: &str = "x3tok:";
/// Prefix a SCRAM username carries when it authenticates a session token.
pub const SCRAM_USER_PREFIX: &str = "x3scram:";

/// A freshly minted token, as advertised to the client.
#[derive(Clone, Debug)]
pub struct MintedToken {
    pub id: String,
    pub expires: u64,
}

/// Mints a token for `account`: writes the password-form row and one SCRAM verifier
/// row per supported hash, all expiring together.
pub(crate) async fn mint(store: &KvStore, account: &str, ttl: Duration) -> Result<MintedToken> {
    let mut raw = [0u8; 16];
    rand::rng().fill_bytes(&mut raw);
    let id = hex::encode(raw);

    let expires = unix_now() + ttl.as_secs();
    let version = store.get_counter(&keys::sessver(account))?;
    let row = format!("{}:{}:{}", expires, version, keys::casefold(account));
    store.set(&keys::session(&id), row.as_bytes(), Some(ttl))?;

    // The token id is the secret the SCRAM verifiers are derived from.
    let account_owned = account.to_string();
    let secret = id.clone();
    let verifiers = tokio::task::spawn_blocking(move || -> Result<Vec<ScramVerifier>> {
        HASH_NAMES
            .iter()
            .filter_map(|name| ScramVersion::from_hash_name(name))
            .map(|version| ScramVerifier::derive(version, &secret, &account_owned))
            .collect()
    })
    .await
    .map_err(|_| Error::internal("verifier derivation task aborted"))??;

    for verifier in verifiers {
        store.set(
            &keys::scram_token(verifier.version.hash_name(), &id),
            verifier.encode_token_row(expires).as_bytes(),
            Some(ttl),
        )?;
    }

    Ok(MintedToken { id, expires })
}

/// Verifies a password-form token presentation. `authcid` must match the account the
/// token was minted for.
pub(crate) fn verify_password_form(
    store: &KvStore,
    authcid: &str,
    presented: &str,
) -> Result<String> {
    let denied = || Error::authentication_error("PLAIN", "invalid session token");
    let id = presented.strip_prefix(PASSWORD_PREFIX).ok_or_else(denied)?;
    let row = store.get_str(&keys::session(id))?.ok_or_else(denied)?;
    let (expires, version, account) = parse_session_row(&row).ok_or_else(denied)?;

    if expires <= unix_now() {
        return Err(denied());
    }
    if version < store.get_counter(&keys::sessver(&account))? {
        return Err(denied());
    }
    if keys::casefold(authcid) != account {
        return Err(denied());
    }
    Ok(account)
}

/// Loads the SCRAM verifier for a token and cross-checks the password-form row's
/// version so a bulk revocation invalidates the SCRAM form too.
pub(crate) fn load_scram_verifier(
    store: &KvStore,
    version: ScramVersion,
    token_id: &str,
) -> Result<Option<ScramVerifier>> {
    let Some(raw) = store.get_str(&keys::scram_token(version.hash_name(), token_id))? else {
        return Ok(None);
    };
    let (expires, verifier) = ScramVerifier::decode_row(&raw)?;
    if expires <= unix_now() {
        return Ok(None);
    }
    let Some(session_row) = store.get_str(&keys::session(token_id))? else {
        return Ok(None);
    };
    let Some((_, token_version, account)) = parse_session_row(&session_row) else {
        return Ok(None);
    };
    if account != verifier.account {
        return Ok(None);
    }
    if token_version < store.get_counter(&keys::sessver(&account))? {
        return Ok(None);
    }
    Ok(Some(verifier))
}

/// Invalidates every outstanding token for `account` by bumping its version counter.
pub(crate) fn revoke_all(store: &KvStore, account: &str) -> Result<u64> {
    store.incr_counter(&keys::sessver(account))
}

fn parse_session_row(row: &str) -> Option<(u64, u64, String)> {
    let mut parts = row.splitn(3, ':');
    Some((
        parts.next()?.parse().ok()?,
        parts.next()?.parse().ok()?,
        parts.next()?.to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mint_and_verify_password_form() {
        let store = KvStore::temporary();
        let token = mint(&store, "Alice", Duration::from_secs(3600)).await.unwrap();
        assert_eq!(token.id.len(), 32);

        let account = verify_password_form(
            &store,
            "alice",
            &format!("{}{}", PASSWORD_PREFIX, token.id),
        )
        .unwrap();
        assert_eq!(account, "alice");

        // Wrong authcid is refused.
        assert!(verify_password_form(
            &store,
            "bob",
            &format!("{}{}", PASSWORD_PREFIX, token.id)
        )
        .is_err());
        // A made-up token is refused.
        assert!(verify_password_form(&store, "alice", "x3tok:ffffffff").is_err());
        // A non-token password is refused outright.
        assert!(verify_password_form(&store, "alice", "p@ssw0rd").is_err());
    }

    #[tokio::test]
    async fn revocation_invalidates_both_forms() {
        let store = KvStore::temporary();
        let token = mint(&store, "alice", Duration::from_secs(3600)).await.unwrap();

        assert!(load_scram_verifier(&store, ScramVersion::Sha256, &token.id)
            .unwrap()
            .is_some());

        revoke_all(&store, "alice").unwrap();

        assert!(verify_password_form(
            &store,
            "alice",
            &format!("{}{}", PASSWORD_PREFIX, token.id)
        )
        .is_err());
        assert!(load_scram_verifier(&store, ScramVersion::Sha256, &token.id)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn tokens_minted_after_revocation_are_valid() {
        let store = KvStore::temporary();
        let old = mint(&store, "alice", Duration::from_secs(3600)).await.unwrap();
        revoke_all(&store, "alice").unwrap();
        let new = mint(&store, "alice", Duration::from_secs(3600)).await.unwrap();

        assert!(verify_password_form(
            &store,
            "alice",
            &format!("{}{}", PASSWORD_PREFIX, old.id)
        )
        .is_err());
        assert!(verify_password_form(
            &store,
            "alice",
            &format!("{}{}", PASSWORD_PREFIX, new.id)
        )
        .is_ok());
    }

    #[tokio::test]
    async fn scram_rows_cover_every_hash() {
        let store = KvStore::temporary();
        let token = mint(&store, "alice", Duration::from_secs(3600)).await.unwrap();
        for version in [ScramVersion::Sha1, ScramVersion::Sha256, ScramVersion::Sha512] {
            let verifier = load_scram_verifier(&store, version, &token.id)
                .unwrap()
                .expect("verifier row present");
            assert_eq!(verifier.account, "alice");
            assert_eq!(verifier.version, version);
        }
    }
}
