//! The asynchronous client for the external OIDC identity provider.
//!
//! Every request is typed by kind; admin-side kinds acquire a bearer token through the
//! waiter-queue cache first. A circuit breaker wraps the transport so a failing IdP
//! degrades into fast local failures instead of a stalled authentication pipeline.

mod breaker;
mod token;

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    options::IdpOptions,
    store::{keys, unix_now, KvStore},
};

use self::{
    breaker::CircuitBreaker,
    token::{AdminTokenCache, CachedToken},
};

/// Outcome of a password grant on behalf of a user.
#[derive(Clone, Debug, PartialEq)]
pub enum PasswordGrant {
    /// The IdP issued a token; the credentials are good.
    Granted,
    /// The IdP answered definitively that the credentials are bad or the user may not
    /// log in.
    Forbidden,
}

/// Parsed introspection result.
#[derive(Clone, Debug, Default)]
pub struct Introspection {
    pub active: bool,
    pub username: Option<String>,
    pub subject: Option<String>,
    pub opserv_level: Option<u32>,
}

/// One key from the IdP's JWKS document.
#[derive(Clone, Debug, Deserialize)]
pub struct Jwk {
    pub kid: String,
    pub kty: String,
    #[serde(default)]
    pub alg: Option<String>,
    #[serde(default)]
    pub n: Option<String>,
    #[serde(default)]
    pub e: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct JwkDocument {
    pub keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct IdpClientInner {
    http: reqwest::Client,
    options: IdpOptions,
    breaker: CircuitBreaker,
    admin_token: AdminTokenCache,
    store: KvStore,
}

/// Handle to the IdP. Cheap to clone; all clones share the connection pool, the admin
/// token cache, and the circuit breaker.
#[derive(Clone)]
pub struct IdpClient {
    inner: Arc<IdpClientInner>,
}

impl IdpClient {
    pub fn new(options: IdpOptions, store: KvStore) -> Result<Self> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(options.pool_size)
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| Error::internal(format!("HTTP client construction: {}", e)))?;
        let seed = load_persisted_token(&store);
        Ok(Self {
            inner: Arc::new(IdpClientInner {
                breaker: CircuitBreaker::new(options.failure_threshold, options.cooldown),
                admin_token: AdminTokenCache::new(options.token_refresh_margin, seed),
                http,
                options,
                store,
            }),
        })
    }

    fn realm_url(&self, path: &str) -> String {
        format!(
            "{}/realms/{}/{}",
            self.inner.options.base_url, self.inner.options.realm, path
        )
    }

    fn admin_url(&self, path: &str) -> String {
        format!(
            "{}/admin/realms/{}/{}",
            self.inner.options.base_url, self.inner.options.realm, path
        )
    }

    /// Runs one transport attempt under the circuit breaker. A transport error or a
    /// 5xx answer counts against the breaker; any definitive answer (including 4xx)
    /// counts as the IdP being alive.
    async fn guarded(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        self.inner.breaker.check()?;
        match request.send().await {
            Ok(response) if response.status().is_server_error() => {
                self.inner.breaker.record_failure();
                Err(Error::idp_unavailable(format!(
                    "IdP answered {}",
                    response.status()
                )))
            }
            Ok(response) => {
                self.inner.breaker.record_success();
                Ok(response)
            }
            Err(err) => {
                self.inner.breaker.record_failure();
                Err(err.into())
            }
        }
    }

    /// Requests a client-credentials token for the service's own client.
    async fn client_token(&self) -> Result<CachedToken> {
        let response = self
            .guarded(
                self.inner
                    .http
                    .post(self.realm_url("protocol/openid-connect/token"))
                    .form(&[
                        ("grant_type", "client_credentials"),
                        ("client_id", self.inner.options.client_id.as_str()),
                        ("client_secret", self.inner.options.client_secret.as_str()),
                    ]),
            )
            .await?;
        if !response.status().is_success() {
            return Err(Error::idp_unavailable(format!(
                "client token grant answered {}",
                response.status()
            )));
        }
        let parsed: TokenResponse = response.json().await.map_err(Error::from)?;
        Ok(CachedToken {
            expires_at: unix_now() + parsed.expires_in,
            access_token: parsed.access_token,
        })
    }

    /// Returns a valid admin bearer token, refreshing through the waiter queue when
    /// needed and mirroring the result to `kc_token:client`.
    pub(crate) async fn ensure_token(&self) -> Result<String> {
        let this = self.clone();
        let token = self
            .inner
            .admin_token
            .ensure_token(move || async move {
                let token = this.client_token().await?;
                let row = format!("{}:{}", token.expires_at, token.access_token);
                if let Err(err) = this.inner.store.set(keys::admin_token(), row.as_bytes(), None) {
                    warn!(error = %err, "failed to persist admin token");
                }
                Ok(token)
            })
            .await?;
        Ok(token)
    }

    /// Verifies a user's password via the resource-owner password grant.
    pub async fn user_token(&self, username: &str, password: &str) -> Result<PasswordGrant> {
        let response = self
            .guarded(
                self.inner
                    .http
                    .post(self.realm_url("protocol/openid-connect/token"))
                    .form(&[
                        ("grant_type", "password"),
                        ("client_id", self.inner.options.client_id.as_str()),
                        ("client_secret", self.inner.options.client_secret.as_str()),
                        ("username", username),
                        ("password", password),
                    ]),
            )
            .await?;
        let status = response.status();
        if status.is_success() {
            debug!(username, "password grant succeeded");
            return Ok(PasswordGrant::Granted);
        }
        if status.is_client_error() {
            debug!(username, %status, "password grant refused");
            return Ok(PasswordGrant::Forbidden);
        }
        Err(Error::idp_unavailable(format!(
            "password grant answered {}",
            status
        )))
    }

    /// Introspects an access token.
    pub async fn introspect(&self, bearer: &str) -> Result<Introspection> {
        let response = self
            .guarded(
                self.inner
                    .http
                    .post(self.realm_url("protocol/openid-connect/token/introspect"))
                    .basic_auth(
                        &self.inner.options.client_id,
                        Some(&self.inner.options.client_secret),
                    )
                    .form(&[("token", bearer)]),
            )
            .await?;
        if !response.status().is_success() {
            return Err(Error::idp_unavailable(format!(
                "introspection answered {}",
                response.status()
            )));
        }
        let body: Value = response.json().await.map_err(Error::from)?;
        Ok(parse_introspection(&body))
    }

    /// Resolves a client-certificate fingerprint to an account name via the IdP's
    /// `x509_fingerprints` user attribute.
    pub async fn fingerprint_lookup(&self, fingerprint: &str) -> Result<Option<String>> {
        let token = self.ensure_token().await?;
        let response = self
            .guarded(
                self.inner
                    .http
                    .get(self.admin_url("users"))
                    .query(&[("q", format!("x509_fingerprints:{}", fingerprint))])
                    .bearer_auth(token),
            )
            .await?;
        if !response.status().is_success() {
            return Err(Error::idp_unavailable(format!(
                "fingerprint lookup answered {}",
                response.status()
            )));
        }
        let body: Value = response.json().await.map_err(Error::from)?;
        Ok(parse_single_username(&body))
    }

    /// Replaces one attribute on a user.
    pub async fn set_user_attribute(&self, user_id: &str, key: &str, value: &str) -> Result<()> {
        let token = self.ensure_token().await?;
        let body = json!({ "attributes": { key: [value] } });
        let response = self
            .guarded(
                self.inner
                    .http
                    .put(self.admin_url(&format!("users/{}", user_id)))
                    .bearer_auth(token)
                    .json(&body),
            )
            .await?;
        expect_no_content("attribute update", response)
    }

    pub async fn group_membership_add(&self, user_id: &str, group_id: &str) -> Result<()> {
        let token = self.ensure_token().await?;
        let response = self
            .guarded(
                self.inner
                    .http
                    .put(self.admin_url(&format!("users/{}/groups/{}", user_id, group_id)))
                    .bearer_auth(token),
            )
            .await?;
        expect_no_content("group add", response)
    }

    pub async fn group_membership_remove(&self, user_id: &str, group_id: &str) -> Result<()> {
        let token = self.ensure_token().await?;
        let response = self
            .guarded(
                self.inner
                    .http
                    .delete(self.admin_url(&format!("users/{}/groups/{}", user_id, group_id)))
                    .bearer_auth(token),
            )
            .await?;
        expect_no_content("group remove", response)
    }

    pub async fn group_info(&self, group_id: &str) -> Result<Value> {
        self.admin_get_json(&format!("groups/{}", group_id)).await
    }

    pub async fn group_members(&self, group_id: &str) -> Result<Value> {
        self.admin_get_json(&format!("groups/{}/members", group_id))
            .await
    }

    /// Reads one user representation.
    pub async fn user_info(&self, user_id: &str) -> Result<Value> {
        self.admin_get_json(&format!("users/{}", user_id)).await
    }

    async fn admin_get_json(&self, path: &str) -> Result<Value> {
        let token = self.ensure_token().await?;
        let response = self
            .guarded(self.inner.http.get(self.admin_url(path)).bearer_auth(token))
            .await?;
        if !response.status().is_success() {
            return Err(Error::idp_unavailable(format!(
                "admin read answered {}",
                response.status()
            )));
        }
        response.json().await.map_err(Error::from)
    }

    /// Creates a user from a full representation and returns the new user id (taken
    /// from the `Location` header).
    pub async fn create_user(&self, representation: Value) -> Result<String> {
        let token = self.ensure_token().await?;
        let response = self
            .guarded(
                self.inner
                    .http
                    .post(self.admin_url("users"))
                    .bearer_auth(token)
                    .json(&representation),
            )
            .await?;
        if !response.status().is_success() {
            return Err(Error::idp_unavailable(format!(
                "user creation answered {}",
                response.status()
            )));
        }
        response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|loc| loc.to_str().ok())
            .and_then(|loc| loc.rsplit('/').next())
            .map(str::to_string)
            .ok_or_else(|| Error::internal("user creation response missing Location"))
    }

    /// Creates a user carrying an imported credential derived from a locally stored
    /// hash, so the migrated user keeps their password.
    pub async fn create_user_with_hash(
        &self,
        username: &str,
        email: Option<&str>,
        stored_hash: &str,
    ) -> Result<String> {
        let (credential_data, secret_data) = crate::crypt::export_for_idp(stored_hash)?;
        let representation = json!({
            "username": username,
            "email": email,
            "enabled": true,
            "credentials": [{
                "type": "password",
                "credentialData": credential_data.to_string(),
                "secretData": secret_data.to_string(),
            }],
        });
        self.create_user(representation).await
    }

    /// Delivers a web-push payload to an endpoint, returning the HTTP status.
    pub async fn webpush_deliver(&self, endpoint: &str, payload: &[u8]) -> Result<u16> {
        let response = self
            .guarded(self.inner.http.post(endpoint).body(payload.to_vec()))
            .await?;
        Ok(response.status().as_u16())
    }

    /// Fetches the realm's JWKS document.
    pub async fn fetch_jwks(&self) -> Result<JwkDocument> {
        let response = self
            .guarded(
                self.inner
                    .http
                    .get(self.realm_url("protocol/openid-connect/certs")),
            )
            .await?;
        if !response.status().is_success() {
            return Err(Error::idp_unavailable(format!(
                "JWKS fetch answered {}",
                response.status()
            )));
        }
        response.json().await.map_err(Error::from)
    }
}

fn expect_no_content(what: &str, response: reqwest::Response) -> Result<()> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(Error::idp_unavailable(format!(
            "{} answered {}",
            what,
            response.status()
        )))
    }
}

fn load_persisted_token(store: &KvStore) -> Option<CachedToken> {
    let row = store.get_str(keys::admin_token()).ok()??;
    let (expires, token) = row.split_once(':')?;
    Some(CachedToken {
        expires_at: expires.parse().ok()?,
        access_token: token.to_string(),
    })
}

fn parse_introspection(body: &Value) -> Introspection {
    Introspection {
        active: body.get("active").and_then(Value::as_bool).unwrap_or(false),
        username: body
            .get("preferred_username")
            .or_else(|| body.get("username"))
            .and_then(Value::as_str)
            .map(str::to_string),
        subject: body.get("sub").and_then(Value::as_str).map(str::to_string),
        opserv_level: parse_opserv_level(body.get("x3_opserv_level")),
    }
}

/// The oper level arrives as a number or as a stringly-typed attribute depending on
/// the mapper configuration.
pub(crate) fn parse_opserv_level(value: Option<&Value>) -> Option<u32> {
    match value? {
        Value::Number(n) => n.as_u64().map(|n| n as u32),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn parse_single_username(body: &Value) -> Option<String> {
    body.as_array()?
        .first()?
        .get("username")?
        .as_str()
        .map(str::to_string)
}
