//! SCRAM mechanism glue: verifier lookup by SASL username and account-verifier
//! provisioning after password events.

use crate::{
    auth::token,
    error::{Error, Result},
    scram::{ScramVerifier, ScramVersion, HASH_NAMES},
    store::{keys, KvStore},
};

/// Loads the verifier a SCRAM username refers to: `x3scram:<token-id>` selects the
/// session-token row, a bare account name selects the account row.
pub(crate) fn load_verifier(
    store: &KvStore,
    version: ScramVersion,
    username: &str,
) -> Result<Option<ScramVerifier>> {
    if let Some(token_id) = username.strip_prefix(token::SCRAM_USER_PREFIX) {
        return token::load_scram_verifier(store, version, token_id);
    }
    let Some(raw) = store.get_str(&keys::scram_account(version.hash_name(), username))? else {
        return Ok(None);
    };
    let (_, verifier) = ScramVerifier::decode_row(&raw)?;
    Ok(Some(verifier))
}

/// Derives and stores account verifiers for every supported hash. Called at
/// password-set time and lazily after the first successful PLAIN for accounts that do
/// not have one yet (activation-pending registrations never do).
pub(crate) async fn store_account_verifiers(
    store: &KvStore,
    account: &str,
    password: &str,
) -> Result<()> {
    let account_owned = keys::casefold(account);
    let password = password.to_string();
    let verifiers = tokio::task::spawn_blocking(move || -> Result<Vec<ScramVerifier>> {
        HASH_NAMES
            .iter()
            .filter_map(|name| ScramVersion::from_hash_name(name))
            .map(|version| ScramVerifier::derive(version, &password, &account_owned))
            .collect()
    })
    .await
    .map_err(|_| Error::internal("verifier derivation task aborted"))??;

    for verifier in verifiers {
        store.set(
            &keys::scram_account(verifier.version.hash_name(), &verifier.account),
            verifier.encode_account_row().as_bytes(),
            None,
        )?;
    }
    Ok(())
}

/// Whether the account already has a full verifier set.
pub(crate) fn has_account_verifiers(store: &KvStore, account: &str) -> Result<bool> {
    for name in HASH_NAMES {
        if store.get(&keys::scram_account(name, account))?.is_none() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Removes every account verifier, ahead of re-derivation on password change.
pub(crate) fn delete_account_verifiers(store: &KvStore, account: &str) -> Result<()> {
    for name in HASH_NAMES {
        store.delete(&keys::scram_account(name, account))?;
    }
    Ok(())
}
