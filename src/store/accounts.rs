//! Account documents and their lifecycle operations.
//!
//! The account is the registered identity behind a SASL login. The handle is unique
//! under rfc1459 case folding, as are the nick links pointing at it. The IdP stays
//! authoritative for OIDC users; these rows are the local fallback and the cache of
//! record for everything the authentication pipeline needs synchronously.

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, ErrorKind, Result},
    store::{keys, unix_now, KvStore, WriteBatch},
};

/// A registered identity.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Account {
    /// Case-folded unique name.
    pub handle: String,
    /// Hashed password, in one of the prefix-discriminated shapes `crypt` understands.
    /// Never plaintext.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Unix timestamp of registration.
    pub registered: u64,
    /// Unix timestamp of the last successful authentication.
    pub lastseen: u64,
    #[serde(default)]
    pub suspended: bool,
    /// Set until the email activation round-trip completes. Activation-pending
    /// accounts cannot authenticate and carry no SCRAM verifier yet.
    #[serde(default)]
    pub activation_pending: bool,
    /// Operator level mirrored from the IdP's `x3_opserv_level` attribute.
    #[serde(default)]
    pub opserv_level: u32,
    /// User-visible preferences.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub prefs: BTreeMap<String, String>,
}

/// A cached (fingerprint, account) binding. The authoritative binding lives on the IdP
/// as a multi-valued user attribute; this row is refreshed on use.
#[derive(Clone, Debug, PartialEq)]
pub struct FingerprintBinding {
    pub account: String,
    pub registered: u64,
    pub last_used: u64,
    pub expiry: u64,
}

impl FingerprintBinding {
    fn encode(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.account, self.registered, self.last_used, self.expiry
        )
    }

    fn decode(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(4, ':');
        Some(Self {
            account: parts.next()?.to_string(),
            registered: parts.next()?.parse().ok()?,
            last_used: parts.next()?.parse().ok()?,
            expiry: parts.next()?.parse().ok()?,
        })
    }
}

/// Typed access to account state in the KV store.
#[derive(Clone)]
pub struct Accounts {
    store: KvStore,
}

impl Accounts {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    /// Registers a new account. Fails with an `InvalidArgument` error when the handle
    /// is already taken under case folding.
    pub fn register(
        &self,
        handle: &str,
        password_hash: Option<String>,
        email: Option<String>,
    ) -> Result<Account> {
        let key = keys::handle(handle);
        if self.store.get(&key)?.is_some() {
            return Err(Error::invalid_argument(format!(
                "handle {} is already registered",
                handle
            )));
        }
        let now = unix_now();
        let account = Account {
            handle: keys::casefold(handle),
            passwd: password_hash,
            email,
            registered: now,
            lastseen: now,
            activation_pending: false,
            ..Default::default()
        };
        self.save(&account)?;
        self.link_nick(handle, &account.handle)?;
        Ok(account)
    }

    pub fn get(&self, handle: &str) -> Result<Option<Account>> {
        match self.store.get_str(&keys::handle(handle))? {
            Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
            None => Ok(None),
        }
    }

    pub fn save(&self, account: &Account) -> Result<()> {
        let doc = serde_json::to_string(account)?;
        self.store
            .set(&keys::handle(&account.handle), doc.as_bytes(), None)
    }

    /// Links a nick to an account. Fails when the nick is held by a different account.
    pub fn link_nick(&self, nick: &str, account: &str) -> Result<()> {
        let key = keys::nick(nick);
        let folded = keys::casefold(account);
        if let Some(owner) = self.store.get_str(&key)? {
            if owner != folded {
                return Err(Error::invalid_argument(format!(
                    "nick {} is owned by another account",
                    nick
                )));
            }
            return Ok(());
        }
        self.store.set(&key, folded.as_bytes(), None)
    }

    pub fn nick_owner(&self, nick: &str) -> Result<Option<String>> {
        self.store.get_str(&keys::nick(nick))
    }

    pub fn unlink_nick(&self, nick: &str) -> Result<()> {
        self.store.delete(&keys::nick(nick))
    }

    /// Replaces the stored password hash. The caller is responsible for rotating SCRAM
    /// verifiers and bumping the session-token version in the same logical operation.
    pub fn set_password_hash(&self, handle: &str, new_hash: &str) -> Result<()> {
        let mut account = self
            .get(handle)?
            .ok_or_else(|| Error::invalid_argument(format!("no such account: {}", handle)))?;
        account.passwd = Some(new_hash.to_string());
        self.save(&account)
    }

    /// Refreshes `lastseen` and the TTL'd `activity:` row after a successful
    /// authentication.
    pub fn record_login(&self, handle: &str, activity_ttl: Duration) -> Result<()> {
        let now = unix_now();
        if let Some(mut account) = self.get(handle)? {
            account.lastseen = now;
            self.save(&account)?;
        }
        let expiry = now + activity_ttl.as_secs();
        let row = format!("{}:{}:{}", now, now, expiry);
        self.store
            .set(&keys::activity(handle), row.as_bytes(), Some(activity_ttl))
    }

    /// Destroys the account and every dependent row: nick links, masks, session tokens,
    /// SCRAM verifiers, caches, and fingerprint bindings.
    pub fn unregister(&self, handle: &str) -> Result<()> {
        let folded = keys::casefold(handle);
        let mut batch = WriteBatch::default();
        batch.delete(&keys::handle(handle));
        batch.delete(&keys::auth_success(handle));
        batch.delete(&keys::sessver(handle));
        batch.delete(&keys::activity(handle));
        batch.delete(&keys::metadata(handle));
        for hash in crate::scram::HASH_NAMES {
            batch.delete(&keys::scram_account(hash, handle));
        }

        self.store.prefix_iterate("nick:", |key, value| {
            if value == folded.as_bytes() {
                batch.delete(key);
            }
        })?;
        self.store.prefix_iterate(&format!("mask:{}:", folded), |key, _| {
            batch.delete(key);
        })?;
        self.store.prefix_iterate("fp:", |key, value| {
            let owned = std::str::from_utf8(value)
                .ok()
                .and_then(FingerprintBinding::decode)
                .is_some_and(|b| b.account == folded);
            if owned {
                batch.delete(key);
            }
        })?;
        self.store.prefix_iterate("session:", |key, value| {
            let owned = std::str::from_utf8(value)
                .is_ok_and(|row| row.rsplit(':').next() == Some(folded.as_str()));
            if owned {
                batch.delete(key);
            }
        })?;
        self.store.prefix_iterate("scram:", |key, value| {
            let owned = std::str::from_utf8(value)
                .is_ok_and(|row| row.rsplit(':').next() == Some(folded.as_str()));
            if owned {
                batch.delete(key);
            }
        })?;
        self.store.apply(batch)
    }

    /// Installs a fingerprint binding. A fingerprint maps to at most one account;
    /// binding it to a second account is rejected.
    pub fn bind_fingerprint(
        &self,
        fingerprint: &str,
        account: &str,
        ttl: Duration,
    ) -> Result<FingerprintBinding> {
        let folded = keys::casefold(account);
        if let Some(existing) = self.lookup_fingerprint(fingerprint)? {
            if existing.account != folded {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "fingerprint {} is bound to another account",
                        fingerprint
                    ),
                }
                .into());
            }
        }
        let now = unix_now();
        let binding = FingerprintBinding {
            account: folded,
            registered: now,
            last_used: now,
            expiry: now + ttl.as_secs(),
        };
        self.store.set(
            &keys::fingerprint(fingerprint),
            binding.encode().as_bytes(),
            Some(ttl),
        )?;
        Ok(binding)
    }

    /// Looks up a cached fingerprint binding without refreshing it.
    pub fn lookup_fingerprint(&self, fingerprint: &str) -> Result<Option<FingerprintBinding>> {
        Ok(self
            .store
            .get_str(&keys::fingerprint(fingerprint))?
            .as_deref()
            .and_then(FingerprintBinding::decode))
    }

    /// Looks up a binding and refreshes its `last_used` timestamp and TTL.
    pub fn touch_fingerprint(
        &self,
        fingerprint: &str,
        ttl: Duration,
    ) -> Result<Option<FingerprintBinding>> {
        let Some(mut binding) = self.lookup_fingerprint(fingerprint)? else {
            return Ok(None);
        };
        let now = unix_now();
        binding.last_used = now;
        binding.expiry = now + ttl.as_secs();
        self.store.set(
            &keys::fingerprint(fingerprint),
            binding.encode().as_bytes(),
            Some(ttl),
        )?;
        Ok(Some(binding))
    }

    pub fn delete_fingerprint(&self, fingerprint: &str) -> Result<()> {
        self.store.delete(&keys::fingerprint(fingerprint))
    }

    /// Appends a hostmask to the account's numbered mask rows.
    pub fn add_mask(&self, account: &str, mask: &str) -> Result<u32> {
        let existing = self.masks(account)?;
        if existing.iter().any(|m| m == mask) {
            return Err(Error::invalid_argument(format!(
                "mask {} is already present",
                mask
            )));
        }
        let index = existing.len() as u32;
        self.store
            .set(&keys::mask(account, index), mask.as_bytes(), None)?;
        Ok(index)
    }

    /// All hostmasks attached to the account, in index order.
    pub fn masks(&self, account: &str) -> Result<Vec<String>> {
        let prefix = format!("mask:{}:", keys::casefold(account));
        let mut rows = Vec::new();
        self.store.prefix_iterate(&prefix, |key, value| {
            let index: Option<u32> = key[prefix.len()..].parse().ok();
            if let (Some(index), Ok(mask)) = (index, std::str::from_utf8(value)) {
                rows.push((index, mask.to_string()));
            }
        })?;
        rows.sort_by_key(|(index, _)| *index);
        Ok(rows.into_iter().map(|(_, mask)| mask).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accounts() -> Accounts {
        Accounts::new(KvStore::temporary())
    }

    #[test]
    fn register_rejects_casefolded_duplicate() {
        let accounts = accounts();
        accounts.register("Alice", None, None).unwrap();
        let err = accounts.register("ALICE", None, None).unwrap_err();
        assert!(matches!(
            err.kind.as_ref(),
            ErrorKind::InvalidArgument { .. }
        ));
        // The stored handle is the folded form.
        assert_eq!(accounts.get("alice").unwrap().unwrap().handle, "alice");
    }

    #[test]
    fn nick_links_follow_casefolding() {
        let accounts = accounts();
        accounts.register("alice", None, None).unwrap();
        accounts.link_nick("[Ali]", "alice").unwrap();
        assert_eq!(
            accounts.nick_owner("{ali}").unwrap().as_deref(),
            Some("alice")
        );

        accounts.register("bob", None, None).unwrap();
        assert!(accounts.link_nick("{Ali}", "bob").is_err());
    }

    #[test]
    fn fingerprint_collision_rejected() {
        let accounts = accounts();
        let ttl = Duration::from_secs(60);
        accounts.bind_fingerprint("AABB01", "alice", ttl).unwrap();
        // Re-binding to the same account refreshes instead of failing.
        accounts.bind_fingerprint("aabb01", "Alice", ttl).unwrap();
        assert!(accounts.bind_fingerprint("aabb01", "bob", ttl).is_err());
    }

    #[test]
    fn touch_fingerprint_refreshes_last_used() {
        let accounts = accounts();
        let ttl = Duration::from_secs(60);
        let bound = accounts.bind_fingerprint("cc01", "alice", ttl).unwrap();
        let touched = accounts
            .touch_fingerprint("CC01", ttl)
            .unwrap()
            .expect("binding present");
        assert_eq!(touched.account, "alice");
        assert!(touched.last_used >= bound.last_used);
        assert!(accounts.touch_fingerprint("dd02", ttl).unwrap().is_none());
    }

    #[test]
    fn unregister_purges_dependents() {
        let accounts = accounts();
        let store = accounts.store.clone();
        accounts.register("alice", None, None).unwrap();
        accounts.link_nick("ali", "alice").unwrap();
        accounts
            .bind_fingerprint("ee03", "alice", Duration::from_secs(60))
            .unwrap();
        store
            .set("session:tok1", b"999:1:alice", None)
            .unwrap();
        store
            .set("scram:sha256:tok1", b"999:sha256:4096:s:k:v:alice", None)
            .unwrap();
        store
            .set("scram_acct:sha256:alice", b"0:sha256:4096:s:k:v:alice", None)
            .unwrap();
        store.set("authsuccess:alice", b"1:abcd", None).unwrap();

        accounts.unregister("alice").unwrap();

        assert!(accounts.get("alice").unwrap().is_none());
        assert!(accounts.nick_owner("ali").unwrap().is_none());
        assert!(accounts.lookup_fingerprint("ee03").unwrap().is_none());
        assert_eq!(store.get("session:tok1").unwrap(), None);
        assert_eq!(store.get("scram:sha256:tok1").unwrap(), None);
        assert_eq!(store.get("scram_acct:sha256:alice").unwrap(), None);
        assert_eq!(store.get("authsuccess:alice").unwrap(), None);
    }

    #[test]
    fn mask_rows_are_numbered_and_ordered() {
        let accounts = accounts();
        accounts.register("alice", None, None).unwrap();
        assert_eq!(accounts.add_mask("alice", "*!*@home.example.net").unwrap(), 0);
        assert_eq!(accounts.add_mask("Alice", "*!*@work.example.net").unwrap(), 1);
        assert!(accounts.add_mask("alice", "*!*@home.example.net").is_err());
        assert_eq!(
            accounts.masks("alice").unwrap(),
            vec![
                "*!*@home.example.net".to_string(),
                "*!*@work.example.net".to_string(),
            ]
        );
    }

    #[test]
    fn account_document_roundtrip() {
        let accounts = accounts();
        let mut account = accounts
            .register("alice", Some("$pbkdf2-sha256$i=1$a$b".into()), None)
            .unwrap();
        account.email = Some("alice@example.net".into());
        account.opserv_level = 600;
        account.prefs.insert("style".into(), "def".into());
        accounts.save(&account).unwrap();

        let loaded = accounts.get("alice").unwrap().unwrap();
        assert_eq!(loaded, account);
    }
}
