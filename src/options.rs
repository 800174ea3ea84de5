//! Contains the options structs used to configure the authentication core.
//!
//! Parsing a configuration file into these structs is the embedding daemon's concern;
//! everything here derives `Deserialize` so any serde front-end can produce them.

use std::time::Duration;

use serde::Deserialize;
use typed_builder::TypedBuilder;

use crate::auth::Mechanism;

fn default_mechanisms() -> Vec<Mechanism> {
    vec![
        Mechanism::Plain,
        Mechanism::External,
        Mechanism::OauthBearer,
        Mechanism::ScramSha256,
        Mechanism::ScramSha512,
    ]
}

fn default_sasl_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_payload_limit() -> usize {
    8 * 1024
}

fn default_auth_success_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_auth_fail_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_session_token_ttl() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60)
}

fn default_activity_ttl() -> Duration {
    Duration::from_secs(90 * 24 * 60 * 60)
}

fn default_fingerprint_ttl() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60)
}

/// Options for the SASL orchestrator and its caches.
#[derive(Clone, Debug, Deserialize, TypedBuilder)]
#[builder(field_defaults(default))]
#[non_exhaustive]
pub struct AuthOptions {
    /// The mechanisms advertised to clients and accepted by the orchestrator.
    #[serde(default = "default_mechanisms")]
    #[builder(default = default_mechanisms())]
    pub mechanisms: Vec<Mechanism>,

    /// How long a session may remain in a non-terminal state before it is failed with
    /// `ERR_SASLFAIL`.
    #[serde(default = "default_sasl_timeout", with = "crate::serde_util::duration_secs")]
    #[builder(default = default_sasl_timeout())]
    pub sasl_timeout: Duration,

    /// Upper bound on the reassembled `AUTHENTICATE` payload. Exceeding it produces
    /// `ERR_SASLTOOLONG`.
    #[serde(default = "default_payload_limit")]
    #[builder(default = default_payload_limit())]
    pub payload_limit: usize,

    /// TTL for positive auth-cache rows (`authsuccess:`).
    #[serde(
        default = "default_auth_success_ttl",
        with = "crate::serde_util::duration_secs"
    )]
    #[builder(default = default_auth_success_ttl())]
    pub auth_success_ttl: Duration,

    /// TTL for negative auth-cache rows (`authfail:`).
    #[serde(default = "default_auth_fail_ttl", with = "crate::serde_util::duration_secs")]
    #[builder(default = default_auth_fail_ttl())]
    pub auth_fail_ttl: Duration,

    /// Lifetime of server-minted session tokens.
    #[serde(
        default = "default_session_token_ttl",
        with = "crate::serde_util::duration_secs"
    )]
    #[builder(default = default_session_token_ttl())]
    pub session_token_ttl: Duration,

    /// TTL refreshed on each authentication for `activity:` rows.
    #[serde(default = "default_activity_ttl", with = "crate::serde_util::duration_secs")]
    #[builder(default = default_activity_ttl())]
    pub activity_ttl: Duration,

    /// TTL for locally cached certificate-fingerprint bindings.
    #[serde(
        default = "default_fingerprint_ttl",
        with = "crate::serde_util::duration_secs"
    )]
    #[builder(default = default_fingerprint_ttl())]
    pub fingerprint_ttl: Duration,

    /// When true, OAUTHBEARER always consults the IdP's introspection endpoint even if a
    /// token verifies locally.
    #[serde(default)]
    pub force_introspection: bool,
}

impl Default for AuthOptions {
    fn default() -> Self {
        AuthOptions::builder().build()
    }
}

fn default_pool_size() -> usize {
    8
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown() -> Duration {
    Duration::from_secs(30)
}

fn default_token_refresh_margin() -> Duration {
    Duration::from_secs(60)
}

/// Options for the asynchronous IdP client.
#[derive(Clone, Debug, Deserialize, TypedBuilder)]
#[non_exhaustive]
pub struct IdpOptions {
    /// Base URL of the identity provider, e.g. `https://idp.example.net`.
    #[builder(setter(into))]
    pub base_url: String,

    /// The realm under which users and clients live.
    #[builder(setter(into))]
    pub realm: String,

    /// OAuth client id used for both password grants and admin operations.
    #[builder(setter(into))]
    pub client_id: String,

    /// OAuth client secret.
    #[builder(setter(into))]
    pub client_secret: String,

    /// Maximum number of concurrently pooled HTTP connections to the IdP host.
    #[serde(default = "default_pool_size")]
    #[builder(default = default_pool_size())]
    pub pool_size: usize,

    /// Per-request timeout.
    #[serde(
        default = "default_request_timeout",
        with = "crate::serde_util::duration_secs"
    )]
    #[builder(default = default_request_timeout())]
    pub request_timeout: Duration,

    /// Consecutive failures after which the circuit breaker opens.
    #[serde(default = "default_failure_threshold")]
    #[builder(default = default_failure_threshold())]
    pub failure_threshold: u32,

    /// How long the circuit stays open before a trial request is permitted.
    #[serde(default = "default_cooldown", with = "crate::serde_util::duration_secs")]
    #[builder(default = default_cooldown())]
    pub cooldown: Duration,

    /// The admin token is refreshed this long before its advertised expiry.
    #[serde(
        default = "default_token_refresh_margin",
        with = "crate::serde_util::duration_secs"
    )]
    #[builder(default = default_token_refresh_margin())]
    pub token_refresh_margin: Duration,
}

fn default_jwks_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}

/// Options for local JWT verification.
#[derive(Clone, Debug, Deserialize, TypedBuilder)]
#[non_exhaustive]
pub struct JwtOptions {
    /// Expected `iss` claim.
    #[builder(setter(into))]
    pub issuer: String,

    /// Expected `aud` claim.
    #[builder(setter(into))]
    pub audience: String,

    /// TTL of cached JWKS keys.
    #[serde(default = "default_jwks_ttl", with = "crate::serde_util::duration_secs")]
    #[builder(default = default_jwks_ttl())]
    pub jwks_ttl: Duration,
}

fn default_webhook_bind() -> String {
    "127.0.0.1:8443".to_string()
}

/// Options for the webhook receiver.
#[derive(Clone, Debug, Deserialize, TypedBuilder)]
#[non_exhaustive]
pub struct WebhookOptions {
    /// Address the listener binds to.
    #[serde(default = "default_webhook_bind")]
    #[builder(default = default_webhook_bind(), setter(into))]
    pub bind: String,

    /// Shared secret expected in the `X-Webhook-Secret` header.
    #[builder(setter(into))]
    pub secret: String,
}

fn default_snapshot_retention() -> usize {
    7
}

fn default_snapshot_interval() -> Duration {
    Duration::from_secs(6 * 60 * 60)
}

/// Options for the embedded KV store.
#[derive(Clone, Debug, Deserialize, TypedBuilder)]
#[non_exhaustive]
pub struct StoreOptions {
    /// Filesystem path of the database directory.
    #[builder(setter(into))]
    pub path: std::path::PathBuf,

    /// How many timestamped snapshot directories to retain.
    #[serde(default = "default_snapshot_retention")]
    #[builder(default = default_snapshot_retention())]
    pub snapshot_retention: usize,

    /// Where the periodic snapshot task writes. No task runs when unset.
    #[serde(default)]
    #[builder(default, setter(strip_option, into))]
    pub snapshot_dir: Option<std::path::PathBuf>,

    /// Cadence of the periodic snapshot task.
    #[serde(
        default = "default_snapshot_interval",
        with = "crate::serde_util::duration_secs"
    )]
    #[builder(default = default_snapshot_interval())]
    pub snapshot_interval: Duration,
}
