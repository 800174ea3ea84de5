//! The authentication and identity core of an OIDC-backed IRC services daemon.
//!
//! This crate implements the pipeline between the network's `AUTHENTICATE` message
//! boundary and the external identity provider: the SASL engine (`PLAIN`,
//! `EXTERNAL`, `OAUTHBEARER`, `SCRAM-SHA-1/256/512`), credential verification with
//! positive/negative caching, session-token lifecycle with bulk revocation, an
//! asynchronous IdP client with an admin-token waiter queue and circuit breaker,
//! local JWT verification over a cached JWKS, the webhook receiver that keeps the
//! caches honest, and the embedded KV layer underneath all of it.
//!
//! The IRC line framer, channel subsystem, and operator commands are external
//! collaborators: the framer feeds [`Authenticator::handle_authenticate`] (or the
//! [`auth::relay`] codec, for S2S traffic) and delivers the [`SaslReply`] values that
//! come back.
//!
//! ```no_run
//! use tokio::sync::mpsc;
//! use x3svc::{options, Services};
//!
//! # async fn run() -> x3svc::Result<()> {
//! let (tx, mut rx) = mpsc::unbounded_channel();
//! let services = Services::initialize(
//!     &options::StoreOptions::builder().path("/var/lib/x3svc/db").build(),
//!     options::IdpOptions::builder()
//!         .base_url("https://idp.example.net")
//!         .realm("testnet")
//!         .client_id("x3")
//!         .client_secret("…")
//!         .build(),
//!     options::JwtOptions::builder()
//!         .issuer("https://idp.example.net/realms/testnet")
//!         .audience("account")
//!         .build(),
//!     options::AuthOptions::default(),
//!     tx,
//! )?;
//!
//! services
//!     .authenticator
//!     .handle_authenticate(1, "PLAIN", &Default::default())
//!     .await;
//! while let Some((conn, reply)) = rx.recv().await {
//!     // deliver to the connection's framer
//!     # let _ = (conn, reply);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]

pub mod auth;
pub mod crypt;
pub mod error;
pub mod idp;
pub mod jwt;
pub mod options;
pub mod scram;
mod serde_util;
pub mod store;
pub mod webhook;

pub use crate::{
    auth::{Authenticator, ConnectionInfo, Mechanism, SaslReply},
    error::{Error, ErrorKind, Result},
    idp::IdpClient,
    jwt::JwksCache,
    store::KvStore,
};

/// The wired-together subsystems, constructed from one set of options.
pub struct Services {
    pub store: KvStore,
    pub idp: IdpClient,
    pub jwks: JwksCache,
    pub authenticator: Authenticator,
}

impl Services {
    /// Opens the store and builds the IdP client, JWKS cache, and orchestrator on top
    /// of it. Replies are delivered through `outbound` as `(connection, reply)`
    /// pairs.
    pub fn initialize(
        store_options: &options::StoreOptions,
        idp_options: options::IdpOptions,
        jwt_options: options::JwtOptions,
        auth_options: options::AuthOptions,
        outbound: tokio::sync::mpsc::UnboundedSender<(u64, SaslReply)>,
    ) -> Result<Self> {
        let store = KvStore::open(store_options)?;
        let idp = IdpClient::new(idp_options, store.clone())?;
        let jwks = JwksCache::new(jwt_options, idp.clone(), store.clone());
        let authenticator = Authenticator::new(
            store.clone(),
            idp.clone(),
            jwks.clone(),
            auth_options,
            outbound,
        );
        Ok(Self {
            store,
            idp,
            jwks,
            authenticator,
        })
    }
}
