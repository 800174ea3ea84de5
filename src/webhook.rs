//! The IdP webhook receiver.
//!
//! The IdP pushes admin events (user deletions, credential changes, group
//! membership churn) to `POST /webhook`, authenticated by a shared-secret header.
//! Each event is translated into targeted cache invalidations applied as a single
//! atomic batch. Errors are logged and swallowed; the IdP cannot be told the IRC
//! user's fate.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    options::WebhookOptions,
    scram::{ScramVerifier, HASH_NAMES},
    store::{accounts::Accounts, keys, KvStore, WriteBatch},
};

const SECRET_HEADER: &str = "x-webhook-secret";

/// Callback invoked for `GROUP_MEMBERSHIP.*` events with the affected group's
/// resource path; channel synchronization lives with the channel subsystem.
pub type GroupSyncHook = Arc<dyn Fn(&str) + Send + Sync>;

/// One push event from the IdP.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub resource_type: String,
    pub operation_type: String,
    #[serde(default)]
    pub resource_path: String,
    #[serde(default)]
    pub representation: Value,
}

impl WebhookEvent {
    fn username(&self) -> Option<&str> {
        self.representation
            .get("username")
            .or_else(|| self.representation.get("userName"))
            .and_then(Value::as_str)
    }

    fn credential_type(&self) -> Option<&str> {
        self.representation.get("type").and_then(Value::as_str)
    }

    fn fingerprint(&self) -> Option<&str> {
        self.representation.get("fingerprint").and_then(Value::as_str)
    }
}

/// Shared state behind the listener.
pub struct WebhookState {
    store: KvStore,
    accounts: Accounts,
    secret: String,
    group_sync: Option<GroupSyncHook>,
}

impl WebhookState {
    pub fn new(store: KvStore, secret: impl Into<String>) -> Self {
        Self {
            accounts: Accounts::new(store.clone()),
            store,
            secret: secret.into(),
            group_sync: None,
        }
    }

    pub fn with_group_sync(mut self, hook: GroupSyncHook) -> Self {
        self.group_sync = Some(hook);
        self
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|presented| {
                presented.len() == self.secret.len()
                    && bool::from(presented.as_bytes().ct_eq(self.secret.as_bytes()))
            })
    }

    /// Applies one event's invalidations.
    pub fn apply(&self, event: &WebhookEvent) -> Result<()> {
        match (
            event.resource_type.as_str(),
            event.operation_type.as_str(),
        ) {
            ("USER", "DELETE") => self.user_deleted(event),
            ("USER", "UPDATE") => self.user_updated(event),
            ("CREDENTIAL", "UPDATE") | ("CREDENTIAL", "CREATE")
                if event.credential_type() == Some("password") =>
            {
                self.password_changed(event)
            }
            ("CREDENTIAL", "DELETE") if event.credential_type() == Some("x509") => {
                let fingerprint = event
                    .fingerprint()
                    .ok_or_else(|| Error::invalid_argument("x509 event without fingerprint"))?;
                info!(fingerprint, "dropping revoked certificate binding");
                self.accounts.delete_fingerprint(fingerprint)
            }
            ("CREDENTIAL", "CREATE") if event.credential_type() == Some("x509") => {
                let fingerprint = event
                    .fingerprint()
                    .ok_or_else(|| Error::invalid_argument("x509 event without fingerprint"))?;
                let username = event
                    .username()
                    .ok_or_else(|| Error::invalid_argument("x509 event without username"))?;
                info!(fingerprint, username, "pre-warming certificate binding");
                self.accounts
                    .bind_fingerprint(fingerprint, username, std::time::Duration::from_secs(
                        30 * 24 * 60 * 60,
                    ))
                    .map(|_| ())
            }
            ("GROUP_MEMBERSHIP", _) => {
                if let Some(ref hook) = self.group_sync {
                    hook(&event.resource_path);
                }
                Ok(())
            }
            (resource, operation) => {
                debug!(resource, operation, "ignoring webhook event");
                Ok(())
            }
        }
    }

    fn user_deleted(&self, event: &WebhookEvent) -> Result<()> {
        let username = event
            .username()
            .ok_or_else(|| Error::invalid_argument("USER.DELETE without username"))?;
        let folded = keys::casefold(username);
        info!(account = %folded, "invalidating all state for deleted user");

        let mut batch = WriteBatch::default();
        batch.delete(&keys::auth_success(&folded));
        batch.delete(&keys::activity(&folded));
        batch.delete(&keys::metadata(&folded));
        for hash in HASH_NAMES {
            batch.delete(&keys::scram_account(hash, &folded));
        }
        self.store.prefix_iterate("authfail:", |key, _| {
            batch.delete(key);
        })?;
        self.store.prefix_iterate("fp:", |key, value| {
            let owned = std::str::from_utf8(value)
                .is_ok_and(|row| row.split(':').next() == Some(folded.as_str()));
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
        let version = self.store.get_counter(&keys::sessver(&folded))?;
        batch.set(&keys::sessver(&folded), (version + 1).to_string().as_bytes(), None);
        self.store.apply(batch)
    }

    fn user_updated(&self, event: &WebhookEvent) -> Result<()> {
        let username = event
            .username()
            .ok_or_else(|| Error::invalid_argument("USER.UPDATE without username"))?;
        let attributes = event
            .representation
            .get("attributes")
            .and_then(Value::as_object);
        let Some(attributes) = attributes else {
            return Ok(());
        };

        if let Some(level_value) = attributes.get("x3_opserv_level") {
            let level = crate::idp::parse_opserv_level(Some(flatten_attribute(level_value)));
            if let (Some(level), Some(mut account)) = (level, self.accounts.get(username)?) {
                if account.opserv_level != level {
                    info!(account = %account.handle, level, "refreshing operator level");
                    account.opserv_level = level;
                    self.accounts.save(&account)?;
                }
            }
        }

        if attributes.keys().any(|k| k.starts_with("x3_metadata")) {
            debug!(username, "invalidating metadata cache");
            self.store.delete(&keys::metadata(username))?;
        }
        Ok(())
    }

    fn password_changed(&self, event: &WebhookEvent) -> Result<()> {
        let username = event
            .username()
            .ok_or_else(|| Error::invalid_argument("credential event without username"))?;
        let folded = keys::casefold(username);
        info!(account = %folded, "password changed at IdP, invalidating credentials");

        let mut batch = WriteBatch::default();
        batch.delete(&keys::auth_success(&folded));
        for hash in HASH_NAMES {
            batch.delete(&keys::scram_account(hash, &folded));
        }
        let version = self.store.get_counter(&keys::sessver(&folded))?;
        batch.set(&keys::sessver(&folded), (version + 1).to_string().as_bytes(), None);

        // The credential SPI may push pre-derived verifiers alongside the event so
        // SCRAM keeps working without waiting for the next PLAIN.
        if let Some(rows) = event
            .representation
            .get("x3_scram_verifiers")
            .and_then(Value::as_array)
        {
            for row in rows.iter().filter_map(Value::as_str) {
                match ScramVerifier::decode_row(row) {
                    Ok((_, verifier)) if keys::casefold(&verifier.account) == folded => {
                        batch.set(
                            &keys::scram_account(verifier.version.hash_name(), &folded),
                            verifier.encode_account_row().as_bytes(),
                            None,
                        );
                    }
                    Ok(_) => warn!(account = %folded, "ignoring verifier for mismatched account"),
                    Err(err) => warn!(error = %err, "ignoring undecodable pushed verifier"),
                }
            }
        }
        self.store.apply(batch)
    }
}

async fn receive(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    Json(event): Json<WebhookEvent>,
) -> StatusCode {
    if !state.authorized(&headers) {
        warn!("webhook request with missing or wrong secret");
        return StatusCode::UNAUTHORIZED;
    }
    if let Err(err) = state.apply(&event) {
        // Swallowed: the IdP is not the party to tell about our internal failures.
        warn!(error = %err, resource = %event.resource_type, "webhook invalidation failed");
    }
    StatusCode::NO_CONTENT
}

/// Builds the webhook router; exposed separately so embedders can mount it.
pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new().route("/webhook", post(receive)).with_state(state)
}

/// Binds the configured address and serves the receiver until the task is aborted.
pub async fn serve(options: &WebhookOptions, state: Arc<WebhookState>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&options.bind).await?;
    info!(bind = %options.bind, "webhook receiver listening");
    axum::serve(listener, router(state))
        .await
        .map_err(|e| Error::internal(format!("webhook server: {}", e)))
}

/// Keycloak attribute values arrive as one-element arrays; tolerate both shapes.
fn flatten_attribute(value: &Value) -> &Value {
    match value {
        Value::Array(items) => items.first().unwrap_or(value),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{auth::token, scram::ScramVersion};

    fn state() -> (WebhookState, KvStore) {
        let store = KvStore::temporary();
        (WebhookState::new(store.clone(), "s3cret"), store)
    }

    fn event(resource: &str, operation: &str, representation: Value) -> WebhookEvent {
        WebhookEvent {
            resource_type: resource.into(),
            operation_type: operation.into(),
            resource_path: String::new(),
            representation,
        }
    }

    #[test]
    fn secret_check_is_exact() {
        let (state, _) = state();
        let mut headers = HeaderMap::new();
        assert!(!state.authorized(&headers));
        headers.insert(SECRET_HEADER, "wrong".parse().unwrap());
        assert!(!state.authorized(&headers));
        headers.insert(SECRET_HEADER, "s3cretX".parse().unwrap());
        assert!(!state.authorized(&headers));
        headers.insert(SECRET_HEADER, "s3cret".parse().unwrap());
        assert!(state.authorized(&headers));
    }

    #[tokio::test]
    async fn user_delete_purges_caches_and_bumps_version() {
        let (state, store) = state();
        let accounts = Accounts::new(store.clone());
        accounts.register("alice", None, None).unwrap();
        accounts
            .bind_fingerprint("ab01", "alice", Duration::from_secs(60))
            .unwrap();
        store.set("authsuccess:alice", b"1:hash", None).unwrap();
        store.set("authfail:deadbeef", b"1:2", None).unwrap();
        store
            .set("scram_acct:sha256:alice", b"0:sha256:4096:s:k:v:alice", None)
            .unwrap();
        let minted = token::mint(&store, "alice", Duration::from_secs(3600))
            .await
            .unwrap();

        state
            .apply(&event("USER", "DELETE", json!({ "username": "Alice" })))
            .unwrap();

        assert!(store.get("authsuccess:alice").unwrap().is_none());
        assert!(store.get("authfail:deadbeef").unwrap().is_none());
        assert!(store.get("fp:ab01").unwrap().is_none());
        assert!(store.get("scram_acct:sha256:alice").unwrap().is_none());
        assert_eq!(store.get_counter("sessver:alice").unwrap(), 1);
        // The outstanding token fails version validation in both forms.
        assert!(token::verify_password_form(
            &store,
            "alice",
            &format!("{}{}", token::PASSWORD_PREFIX, minted.id)
        )
        .is_err());
        assert!(
            token::load_scram_verifier(&store, ScramVersion::Sha256, &minted.id)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn password_change_invalidates_and_installs_pushed_verifiers() {
        let (state, store) = state();
        store.set("authsuccess:alice", b"1:hash", None).unwrap();
        store
            .set("scram_acct:sha1:alice", b"0:sha1:4096:s:k:v:alice", None)
            .unwrap();

        let pushed = ScramVerifier::derive(ScramVersion::Sha256, "newpass", "alice")
            .unwrap()
            .encode_account_row();
        state
            .apply(&event(
                "CREDENTIAL",
                "UPDATE",
                json!({
                    "type": "password",
                    "username": "alice",
                    "x3_scram_verifiers": [pushed],
                }),
            ))
            .unwrap();

        assert!(store.get("authsuccess:alice").unwrap().is_none());
        assert!(store.get("scram_acct:sha1:alice").unwrap().is_none());
        assert_eq!(store.get_counter("sessver:alice").unwrap(), 1);
        // The pushed SHA-256 verifier was installed.
        assert!(store.get("scram_acct:sha256:alice").unwrap().is_some());
    }

    #[test]
    fn x509_events_manage_fingerprint_bindings() {
        let (state, store) = state();

        state
            .apply(&event(
                "CREDENTIAL",
                "CREATE",
                json!({ "type": "x509", "username": "alice", "fingerprint": "ab01cd" }),
            ))
            .unwrap();
        let accounts = Accounts::new(store.clone());
        assert_eq!(
            accounts.lookup_fingerprint("ab01cd").unwrap().unwrap().account,
            "alice"
        );

        state
            .apply(&event(
                "CREDENTIAL",
                "DELETE",
                json!({ "type": "x509", "fingerprint": "AB01CD" }),
            ))
            .unwrap();
        assert!(accounts.lookup_fingerprint("ab01cd").unwrap().is_none());
    }

    #[test]
    fn user_update_refreshes_oper_level_and_metadata() {
        let (state, store) = state();
        let accounts = Accounts::new(store.clone());
        accounts.register("alice", None, None).unwrap();
        store.set("meta:alice", b"{\"style\":\"old\"}", None).unwrap();

        state
            .apply(&event(
                "USER",
                "UPDATE",
                json!({
                    "username": "alice",
                    "attributes": {
                        "x3_opserv_level": ["800"],
                        "x3_metadata_style": ["new"],
                    },
                }),
            ))
            .unwrap();

        assert_eq!(accounts.get("alice").unwrap().unwrap().opserv_level, 800);
        assert!(store.get("meta:alice").unwrap().is_none());
    }

    #[test]
    fn group_membership_triggers_sync_hook() {
        let (state, _store) = state();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let state = state.with_group_sync(Arc::new(move |path: &str| {
            seen_clone.lock().unwrap().push(path.to_string());
        }));

        let mut ev = event("GROUP_MEMBERSHIP", "CREATE", json!({}));
        ev.resource_path = "users/u1/groups/g1".into();
        state.apply(&ev).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["users/u1/groups/g1".to_string()]);
    }

    #[test]
    fn unrelated_events_are_ignored() {
        let (state, _) = state();
        state
            .apply(&event("CLIENT", "UPDATE", json!({})))
            .unwrap();
    }
}
