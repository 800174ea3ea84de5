//! Key construction for the colon-prefixed KV namespace.
//!
//! Account-derived keys are case-folded with rfc1459 semantics so that `Alice`,
//! `alice`, and `ALICE` share one row, and `[x]^` equals `{x}~` the way IRC nicks do.

/// Folds a handle or nick under rfc1459 casemapping.
pub(crate) fn casefold(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'A'..='Z' => c.to_ascii_lowercase(),
            '[' => '{',
            ']' => '}',
            '\\' => '|',
            '~' => '^',
            _ => c,
        })
        .collect()
}

pub(crate) fn handle(account: &str) -> String {
    format!("handle:{}", casefold(account))
}

pub(crate) fn nick(nick: &str) -> String {
    format!("nick:{}", casefold(nick))
}

pub(crate) fn mask(account: &str, index: u32) -> String {
    format!("mask:{}:{}", casefold(account), index)
}

pub(crate) fn session(token_id: &str) -> String {
    format!("session:{}", token_id)
}

pub(crate) fn sessver(account: &str) -> String {
    format!("sessver:{}", casefold(account))
}

pub(crate) fn scram_token(hash_name: &str, token_id: &str) -> String {
    format!("scram:{}:{}", hash_name, token_id)
}

pub(crate) fn scram_account(hash_name: &str, account: &str) -> String {
    format!("scram_acct:{}:{}", hash_name, casefold(account))
}

pub(crate) fn auth_success(account: &str) -> String {
    format!("authsuccess:{}", casefold(account))
}

pub(crate) fn auth_fail(credential_hash: &str) -> String {
    format!("authfail:{}", credential_hash)
}

pub(crate) fn auth_fail_fingerprint(fingerprint: &str) -> String {
    format!("authfail:fp:{}", fingerprint.to_ascii_lowercase())
}

pub(crate) fn fingerprint(fingerprint: &str) -> String {
    format!("fp:{}", fingerprint.to_ascii_lowercase())
}

pub(crate) fn activity(account: &str) -> String {
    format!("activity:{}", casefold(account))
}

pub(crate) fn metadata(account: &str) -> String {
    format!("meta:{}", casefold(account))
}

pub(crate) fn admin_token() -> &'static str {
    "kc_token:client"
}

pub(crate) fn jwks(kid: &str) -> String {
    format!("kc_jwks:{}", kid)
}
