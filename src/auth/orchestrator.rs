//! The per-connection authentication driver.
//!
//! One instance serves every connection. The framer feeds it `AUTHENTICATE` arguments
//! and connection lifecycle events; replies flow back through an unbounded channel so
//! that asynchronous completions (IdP answers, timeouts) can emit replies without the
//! framer polling. Exactly one terminal numeric is produced per attempt.

use std::{
    collections::HashMap,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use base64::{engine::general_purpose::STANDARD, Engine};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    auth::{
        external::{self, FingerprintDecision},
        oauthbearer,
        plain::{self, CacheDecision, PlainCredentials},
        scram as scram_mech,
        session::{ChunkOutcome, MechScratch, SaslSession, SessionState},
        token, ConnectionInfo, Mechanism, SaslReply,
    },
    crypt,
    error::{Error, ErrorKind, Result},
    idp::{IdpClient, PasswordGrant},
    jwt::JwksCache,
    options::AuthOptions,
    scram::{ClientFirst, ServerExchange},
    store::{accounts::Account, accounts::Accounts, keys, unix_now, KvStore},
};

/// Minimum operator level allowed to impersonate via a PLAIN authzid.
const IMPERSONATION_MIN_LEVEL: u32 = 900;

/// Failures from one IP within this window count toward the connection throttle.
const THROTTLE_WINDOW_SECS: u64 = 60;
const THROTTLE_MAX_FAILURES: usize = 3;

struct AuthenticatorInner {
    store: KvStore,
    accounts: Accounts,
    idp: IdpClient,
    jwks: JwksCache,
    options: AuthOptions,
    sessions: Mutex<HashMap<u64, SaslSession>>,
    seq: AtomicU64,
    outbound: mpsc::UnboundedSender<(u64, SaslReply)>,
    failures: Mutex<HashMap<String, Vec<u64>>>,
}

/// The SASL orchestrator. Cheap to clone; all clones share the session table.
#[derive(Clone)]
pub struct Authenticator {
    inner: Arc<AuthenticatorInner>,
}

enum Step {
    Begin { over_completed: bool },
    Chunk(ChunkOutcome, u64, Mechanism),
    DiscardOverlap,
}

impl Authenticator {
    pub fn new(
        store: KvStore,
        idp: IdpClient,
        jwks: JwksCache,
        options: AuthOptions,
        outbound: mpsc::UnboundedSender<(u64, SaslReply)>,
    ) -> Self {
        Self {
            inner: Arc::new(AuthenticatorInner {
                accounts: Accounts::new(store.clone()),
                store,
                idp,
                jwks,
                options,
                sessions: Mutex::new(HashMap::new()),
                seq: AtomicU64::new(0),
                outbound,
                failures: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The comma-joined mechanism list, for the `sasl` capability value and the 908
    /// reply.
    pub fn mechanism_list(&self) -> String {
        self.inner
            .options
            .mechanisms
            .iter()
            .map(Mechanism::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Emits `RPL_SASLMECHS` on demand.
    pub fn send_mechanisms(&self, conn: u64) {
        self.send(conn, SaslReply::Mechs(self.mechanism_list()));
    }

    /// Whether this remote IP has failed enough recently that the framer should
    /// throttle the connection.
    pub fn is_throttled(&self, ip: &str) -> bool {
        let now = unix_now();
        self.inner
            .failures
            .lock()
            .unwrap()
            .get(ip)
            .map(|stamps| {
                stamps
                    .iter()
                    .filter(|t| now.saturating_sub(**t) < THROTTLE_WINDOW_SECS)
                    .count()
                    >= THROTTLE_MAX_FAILURES
            })
            .unwrap_or(false)
    }

    /// Entry point for every `AUTHENTICATE` argument from a connection.
    pub async fn handle_authenticate(&self, conn: u64, arg: &str, info: &ConnectionInfo) {
        let arg = arg.trim();
        if arg == "*" {
            self.abort(conn);
            return;
        }

        let step = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            match sessions.get_mut(&conn) {
                None => Step::Begin {
                    over_completed: false,
                },
                Some(session) => match session.state {
                    SessionState::Completed { ref account } => {
                        debug!(conn, account = %account, "AUTHENTICATE on a completed session");
                        Step::Begin {
                            over_completed: true,
                        }
                    }
                    SessionState::Cancelled => {
                        sessions.remove(&conn);
                        Step::Begin {
                            over_completed: false,
                        }
                    }
                    SessionState::AwaitingIdp => Step::DiscardOverlap,
                    SessionState::Negotiating => {
                        let outcome =
                            session.push_chunk(arg, self.inner.options.payload_limit);
                        Step::Chunk(outcome, session.seq, session.mechanism)
                    }
                },
            }
        };

        match step {
            Step::Begin { over_completed } => self.begin(conn, arg, info, over_completed),
            Step::DiscardOverlap => {
                debug!(conn, "discarding AUTHENTICATE while a verification is in flight");
            }
            Step::Chunk(ChunkOutcome::More, _, _) => {}
            Step::Chunk(ChunkOutcome::TooLong, seq, _) => {
                self.remove_session(conn, seq);
                self.send(conn, SaslReply::TooLong);
            }
            Step::Chunk(ChunkOutcome::Malformed, seq, _) => {
                self.fail_attempt(conn, seq, &Error::protocol("undecodable payload"));
            }
            Step::Chunk(ChunkOutcome::Done(bytes), seq, mechanism) => {
                self.dispatch_payload(conn, seq, mechanism, bytes).await;
            }
        }
    }

    /// `AUTHENTICATE *`.
    fn abort(&self, conn: u64) {
        let reply = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            match sessions.get(&conn) {
                Some(session) if matches!(session.state, SessionState::Completed { .. }) => {
                    SaslReply::Already
                }
                Some(_) => {
                    sessions.remove(&conn);
                    SaslReply::Aborted
                }
                None => SaslReply::Aborted,
            }
        };
        self.send(conn, reply);
    }

    /// Marks the session cancelled on disconnect. If no verification is in flight the
    /// entry is dropped immediately; otherwise the completion path reaps it.
    pub fn connection_closed(&self, conn: u64) {
        let mut sessions = self.inner.sessions.lock().unwrap();
        if let Some(session) = sessions.get_mut(&conn) {
            if matches!(session.state, SessionState::AwaitingIdp) {
                session.state = SessionState::Cancelled;
            } else {
                sessions.remove(&conn);
            }
        }
    }

    fn begin(&self, conn: u64, arg: &str, info: &ConnectionInfo, over_completed: bool) {
        let mechanism = match Mechanism::from_str(arg) {
            Ok(m) if self.inner.options.mechanisms.contains(&m) => m,
            _ if over_completed => {
                // Anything that is not a fresh refreshable selection is a policy
                // violation once a session has completed.
                self.send(conn, SaslReply::Already);
                return;
            }
            _ => {
                debug!(conn, mechanism = arg, "unknown or disabled mechanism");
                self.send_mechanisms(conn);
                self.send(conn, SaslReply::Fail);
                return;
            }
        };
        if over_completed && !mechanism.is_refreshable() {
            self.send(conn, SaslReply::Already);
            return;
        }

        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let deadline = Instant::now() + self.inner.options.sasl_timeout;
        self.inner
            .sessions
            .lock()
            .unwrap()
            .insert(conn, SaslSession::new(mechanism, info.clone(), seq));
        self.spawn_watchdog(conn, seq, deadline);
        self.send(conn, SaslReply::Continue("+".into()));
    }

    fn spawn_watchdog(&self, conn: u64, seq: u64, deadline: Instant) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            let expired_ip = {
                let mut sessions = this.inner.sessions.lock().unwrap();
                match sessions.get(&conn) {
                    Some(session) if session.seq == seq && !session.is_terminal() => {
                        let ip = session.info.remote_ip.clone();
                        sessions.remove(&conn);
                        Some(ip)
                    }
                    _ => None,
                }
            };
            if let Some(ip) = expired_ip {
                info!(conn, "authentication timed out");
                this.record_ip_failure(ip);
                this.send(conn, SaslReply::Fail);
            }
        });
    }

    async fn dispatch_payload(&self, conn: u64, seq: u64, mechanism: Mechanism, bytes: Vec<u8>) {
        match mechanism {
            Mechanism::Plain => self.plain_flow(conn, seq, bytes).await,
            Mechanism::External => self.external_flow(conn, seq).await,
            Mechanism::OauthBearer => self.oauth_flow(conn, seq, bytes).await,
            Mechanism::ScramSha1 | Mechanism::ScramSha256 | Mechanism::ScramSha512 => {
                self.scram_flow(conn, seq, mechanism, bytes).await
            }
        }
    }

    async fn plain_flow(&self, conn: u64, seq: u64, bytes: Vec<u8>) {
        let creds = match plain::parse_payload(&bytes) {
            Ok(creds) => creds,
            Err(err) => return self.fail_attempt(conn, seq, &err),
        };

        // Session-token presentation short-circuits every other verifier.
        if creds.password.starts_with(token::PASSWORD_PREFIX) {
            match token::verify_password_form(&self.inner.store, &creds.authcid, &creds.password) {
                Ok(account) => {
                    self.complete_success(conn, seq, account, SuccessContext::default())
                        .await
                }
                Err(err) => self.fail_attempt(conn, seq, &err),
            }
            return;
        }

        let impersonating = creds
            .authzid
            .as_ref()
            .is_some_and(|z| keys::casefold(z) != keys::casefold(&creds.authcid));
        let cred_hash = plain::credential_hash(&creds.authcid, &creds.password);

        match plain::check_caches(
            &self.inner.store,
            &creds.authcid,
            &cred_hash,
            self.inner.options.auth_success_ttl,
        ) {
            Ok(CacheDecision::Hit) => {
                debug!(conn, authcid = %creds.authcid, "positive auth-cache hit");
                let context = match self.resolve_attachment(&creds, impersonating) {
                    Ok(context) => context,
                    Err(err) => return self.fail_attempt(conn, seq, &err),
                };
                self.complete_success(conn, seq, context.0, context.1).await;
                return;
            }
            Ok(CacheDecision::FailFast) => {
                debug!(conn, authcid = %creds.authcid, "negative auth-cache hit");
                return self.fail_attempt(
                    conn,
                    seq,
                    &Error::authentication_error("PLAIN", "recently rejected credentials"),
                );
            }
            Ok(CacheDecision::Miss) => {}
            Err(err) => return self.fail_attempt(conn, seq, &err),
        }

        if !self.set_awaiting(conn, seq) {
            return;
        }
        let verified = self.verify_plain_credentials(&creds).await;
        match verified {
            Ok(()) => {
                if let Err(err) = plain::record_success(
                    &self.inner.store,
                    &creds.authcid,
                    &cred_hash,
                    self.inner.options.auth_success_ttl,
                ) {
                    warn!(conn, error = %err, "failed to populate auth cache");
                }
                let (account, mut context) = match self.resolve_attachment(&creds, impersonating) {
                    Ok(pair) => pair,
                    Err(err) => return self.fail_attempt(conn, seq, &err),
                };
                if !impersonating {
                    context.plain_password = Some(creds.password.clone());
                    context.mint_token = true;
                }
                self.complete_success(conn, seq, account, context).await;
            }
            Err(err) => {
                if err.is_auth_denied() {
                    if let Err(cache_err) = plain::record_failure(
                        &self.inner.store,
                        &cred_hash,
                        self.inner.options.auth_fail_ttl,
                    ) {
                        warn!(conn, error = %cache_err, "failed to populate negative cache");
                    }
                }
                self.fail_attempt(conn, seq, &err);
            }
        }
    }

    /// Verifies PLAIN credentials: the IdP first, the local hash as fallback.
    async fn verify_plain_credentials(&self, creds: &PlainCredentials) -> Result<()> {
        match self
            .inner
            .idp
            .user_token(&creds.authcid, &creds.password)
            .await
        {
            Ok(PasswordGrant::Granted) => Ok(()),
            Ok(PasswordGrant::Forbidden) => {
                // A definitive refusal still falls through to a local-only account.
                match self.verify_local_password(creds).await? {
                    Some(true) => Ok(()),
                    _ => Err(Error::authentication_error("PLAIN", "credentials rejected")),
                }
            }
            Err(err) if err.is_idp_unavailable() => {
                debug!(error = %err, "IdP unreachable, trying local verifier");
                match self.verify_local_password(creds).await? {
                    Some(true) => Ok(()),
                    // The local store is the authority when the IdP cannot answer.
                    Some(false) => {
                        Err(Error::authentication_error("PLAIN", "credentials rejected"))
                    }
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Verifies against the account's stored hash, applying lazy migration on
    /// success. `None` means there is no local account or no local hash to check.
    async fn verify_local_password(&self, creds: &PlainCredentials) -> Result<Option<bool>> {
        let Some(account) = self.inner.accounts.get(&creds.authcid)? else {
            return Ok(None);
        };
        let Some(stored) = account.passwd.clone() else {
            return Ok(None);
        };
        if !crypt::verify_async(creds.password.clone(), stored.clone()).await? {
            return Ok(Some(false));
        }
        if crypt::needs_rehash(&stored) {
            let upgraded = crypt::hash_async(creds.password.clone()).await?;
            self.inner
                .accounts
                .set_password_hash(&account.handle, &upgraded)?;
            info!(account = %account.handle, "migrated password hash to current algorithm");
        }
        Ok(Some(true))
    }

    /// Determines the attached account for a PLAIN attempt, enforcing the
    /// impersonation policy.
    fn resolve_attachment(
        &self,
        creds: &PlainCredentials,
        impersonating: bool,
    ) -> Result<(String, SuccessContext)> {
        if !impersonating {
            return Ok((keys::casefold(&creds.authcid), SuccessContext::default()));
        }
        let authzid = creds.authzid.as_deref().unwrap_or_default();
        let actor = self
            .inner
            .accounts
            .get(&creds.authcid)?
            .ok_or_else(|| Error::authentication_error("PLAIN", "unknown account"))?;
        if actor.opserv_level < IMPERSONATION_MIN_LEVEL {
            return Err(Error::policy_reject("impersonation requires operator access"));
        }
        if self.inner.accounts.get(authzid)?.is_none() {
            return Err(Error::authentication_error("PLAIN", "unknown authzid"));
        }
        info!(actor = %actor.handle, target = %authzid, "operator impersonation");
        Ok((keys::casefold(authzid), SuccessContext::default()))
    }

    async fn external_flow(&self, conn: u64, seq: u64) {
        let fingerprint = {
            let sessions = self.inner.sessions.lock().unwrap();
            match sessions.get(&conn) {
                Some(session) if session.seq == seq => session.info.certfp.clone(),
                _ => return,
            }
        };
        let Some(fingerprint) = fingerprint.map(|fp| fp.to_ascii_lowercase()) else {
            return self.fail_attempt(
                conn,
                seq,
                &Error::authentication_error("EXTERNAL", "no verified client certificate"),
            );
        };

        match external::check_local(
            &self.inner.accounts,
            &self.inner.store,
            &fingerprint,
            self.inner.options.fingerprint_ttl,
        ) {
            Ok(FingerprintDecision::Bound(account)) => {
                self.complete_success(conn, seq, account, SuccessContext::default())
                    .await;
                return;
            }
            Ok(FingerprintDecision::NegativeCached) => {
                return self.fail_attempt(
                    conn,
                    seq,
                    &Error::authentication_error("EXTERNAL", "fingerprint recently unknown"),
                );
            }
            Ok(FingerprintDecision::Unknown) => {}
            Err(err) => return self.fail_attempt(conn, seq, &err),
        }

        if !self.set_awaiting(conn, seq) {
            return;
        }
        match self.inner.idp.fingerprint_lookup(&fingerprint).await {
            Ok(Some(username)) => {
                if let Err(err) = self.inner.accounts.bind_fingerprint(
                    &fingerprint,
                    &username,
                    self.inner.options.fingerprint_ttl,
                ) {
                    return self.fail_attempt(conn, seq, &err);
                }
                self.complete_success(conn, seq, keys::casefold(&username), SuccessContext::default())
                    .await;
            }
            Ok(None) => {
                if let Err(err) = external::record_miss(
                    &self.inner.store,
                    &fingerprint,
                    self.inner.options.auth_fail_ttl,
                ) {
                    warn!(conn, error = %err, "failed to negative-cache fingerprint miss");
                }
                self.fail_attempt(
                    conn,
                    seq,
                    &Error::authentication_error("EXTERNAL", "no account bound to fingerprint"),
                );
            }
            Err(err) => self.fail_attempt(conn, seq, &err),
        }
    }

    async fn oauth_flow(&self, conn: u64, seq: u64, bytes: Vec<u8>) {
        let bearer = match oauthbearer::parse_payload(&bytes) {
            Ok(token) => token,
            Err(err) => return self.fail_attempt(conn, seq, &err),
        };
        if !self.set_awaiting(conn, seq) {
            return;
        }

        if !self.inner.options.force_introspection {
            match self.inner.jwks.verify(&bearer).await {
                Ok(claims) => {
                    let handle = claims
                        .preferred_username
                        .clone()
                        .unwrap_or_else(|| claims.subject.clone());
                    let context = SuccessContext {
                        opserv_level: claims.opserv_level,
                        ..Default::default()
                    };
                    self.complete_success(conn, seq, keys::casefold(&handle), context)
                        .await;
                    return;
                }
                Err(err) => {
                    debug!(conn, error = %err, "local JWT verification failed, introspecting");
                }
            }
        }

        match self.inner.idp.introspect(&bearer).await {
            Ok(result) if result.active => {
                let Some(handle) = result.username.or(result.subject) else {
                    return self.fail_attempt(
                        conn,
                        seq,
                        &Error::authentication_error("OAUTHBEARER", "token has no identity"),
                    );
                };
                let context = SuccessContext {
                    opserv_level: result.opserv_level,
                    ..Default::default()
                };
                self.complete_success(conn, seq, keys::casefold(&handle), context)
                    .await;
            }
            Ok(_) => self.fail_attempt(
                conn,
                seq,
                &Error::authentication_error("OAUTHBEARER", "token not active"),
            ),
            Err(err) => self.fail_attempt(conn, seq, &err),
        }
    }

    async fn scram_flow(&self, conn: u64, seq: u64, mechanism: Mechanism, bytes: Vec<u8>) {
        let Ok(text) = String::from_utf8(bytes) else {
            return self.fail_attempt(
                conn,
                seq,
                &Error::invalid_authentication_payload(mechanism.as_str()),
            );
        };
        let Some(version) = mechanism.scram_version() else {
            return;
        };

        let pending = {
            let sessions = self.inner.sessions.lock().unwrap();
            match sessions.get(&conn) {
                Some(session) if session.seq == seq => match &session.scratch {
                    MechScratch::None => None,
                    MechScratch::ScramExchange(exchange) => Some((**exchange).clone()),
                },
                _ => return,
            }
        };

        match pending {
            None => {
                let client_first = match ClientFirst::parse(&text) {
                    Ok(parsed) => parsed,
                    Err(err) => return self.fail_attempt(conn, seq, &err),
                };
                if client_first
                    .authzid
                    .as_ref()
                    .is_some_and(|z| keys::casefold(z) != keys::casefold(&client_first.username))
                {
                    return self.fail_attempt(
                        conn,
                        seq,
                        &Error::authentication_error("SCRAM", "authzid must match authcid"),
                    );
                }
                let verifier = match scram_mech::load_verifier(
                    &self.inner.store,
                    version,
                    &client_first.username,
                ) {
                    Ok(Some(verifier)) => verifier,
                    Ok(None) => {
                        return self.fail_attempt(
                            conn,
                            seq,
                            &Error::authentication_error("SCRAM", "no verifier for user"),
                        )
                    }
                    Err(err) => return self.fail_attempt(conn, seq, &err),
                };
                let (exchange, server_first) = match ServerExchange::start(client_first, verifier) {
                    Ok(pair) => pair,
                    Err(err) => return self.fail_attempt(conn, seq, &err),
                };
                let stored = {
                    let mut sessions = self.inner.sessions.lock().unwrap();
                    match sessions.get_mut(&conn) {
                        Some(session) if session.seq == seq => {
                            session.scratch = MechScratch::ScramExchange(Box::new(exchange));
                            true
                        }
                        _ => false,
                    }
                };
                if stored {
                    self.send(
                        conn,
                        SaslReply::Continue(STANDARD.encode(server_first.as_bytes())),
                    );
                }
            }
            Some(exchange) => match exchange.finish(&text) {
                Ok(server_final) => {
                    let context = SuccessContext {
                        prefix_reply: Some(SaslReply::Continue(
                            STANDARD.encode(server_final.as_bytes()),
                        )),
                        ..Default::default()
                    };
                    self.complete_success(conn, seq, exchange.account().to_string(), context)
                        .await;
                }
                Err(err) => self.fail_attempt(conn, seq, &err),
            },
        }
    }

    /// Post-success bookkeeping and the terminal replies. The liveness commit happens
    /// before any KV write so a cancelled session produces neither output nor state.
    async fn complete_success(
        &self,
        conn: u64,
        seq: u64,
        account_handle: String,
        context: SuccessContext,
    ) {
        // Commit liveness before any KV write: a cancelled session must produce
        // neither output nor state.
        if !self.commit_completed(conn, seq, &account_handle) {
            debug!(conn, "authentication completed for a dead session, skipping");
            return;
        }

        let account = match self.ensure_account(&account_handle, context.opserv_level) {
            Ok(account) => account,
            Err(err) => return self.fail_attempt(conn, seq, &err),
        };
        if account.suspended {
            return self.fail_attempt(
                conn,
                seq,
                &Error::authentication_error("SASL", "account suspended"),
            );
        }
        if account.activation_pending {
            return self.fail_attempt(
                conn,
                seq,
                &Error::authentication_error("SASL", "account pending activation"),
            );
        }

        if let Err(err) = self
            .inner
            .accounts
            .record_login(&account.handle, self.inner.options.activity_ttl)
        {
            warn!(conn, error = %err, "failed to record login activity");
        }

        if let Some(ref password) = context.plain_password {
            let has_verifiers =
                scram_mech::has_account_verifiers(&self.inner.store, &account.handle)
                    .unwrap_or(true);
            if !has_verifiers {
                if let Err(err) =
                    scram_mech::store_account_verifiers(&self.inner.store, &account.handle, password)
                        .await
                {
                    warn!(conn, error = %err, "failed to provision SCRAM verifiers");
                }
            }
        }

        let mut minted = None;
        if context.mint_token {
            match token::mint(
                &self.inner.store,
                &account.handle,
                self.inner.options.session_token_ttl,
            )
            .await
            {
                Ok(token) => minted = Some(token),
                Err(err) => warn!(conn, error = %err, "failed to mint session token"),
            }
        }

        if let Some(reply) = context.prefix_reply {
            self.send(conn, reply);
        }
        if let Some(token) = minted {
            self.send(
                conn,
                SaslReply::TokenAdvert {
                    token: token.id,
                    expires: token.expires,
                },
            );
        }
        info!(conn, account = %account.handle, "authentication succeeded");
        self.send(
            conn,
            SaslReply::LoggedIn {
                account: account.handle,
            },
        );
        self.send(conn, SaslReply::Success);
    }

    /// Resolves the account row, creating a shadow registration for identities the
    /// IdP has vouched for that have never connected before.
    fn ensure_account(&self, handle: &str, opserv_level: Option<u32>) -> Result<Account> {
        let mut account = match self.inner.accounts.get(handle)? {
            Some(account) => account,
            None => self.inner.accounts.register(handle, None, None)?,
        };
        if let Some(level) = opserv_level {
            if account.opserv_level != level {
                account.opserv_level = level;
                self.inner.accounts.save(&account)?;
            }
        }
        Ok(account)
    }

    fn fail_attempt(&self, conn: u64, seq: u64, err: &Error) {
        let removed_ip = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            match sessions.get(&conn) {
                Some(session) if session.seq == seq => {
                    let ip = session.info.remote_ip.clone();
                    let cancelled = matches!(session.state, SessionState::Cancelled);
                    sessions.remove(&conn);
                    if cancelled {
                        None
                    } else {
                        Some(ip)
                    }
                }
                _ => None,
            }
        };
        let Some(ip) = removed_ip else {
            return;
        };
        info!(conn, error = %err, "authentication failed");
        self.record_ip_failure(ip);
        let reply = match err.kind.as_ref() {
            ErrorKind::NickLocked { .. } => SaslReply::NickLocked,
            ErrorKind::Protocol { .. } => SaslReply::TooLong,
            _ => SaslReply::Fail,
        };
        self.send(conn, reply);
    }

    fn set_awaiting(&self, conn: u64, seq: u64) -> bool {
        let mut sessions = self.inner.sessions.lock().unwrap();
        match sessions.get_mut(&conn) {
            Some(session)
                if session.seq == seq && matches!(session.state, SessionState::Negotiating) =>
            {
                session.state = SessionState::AwaitingIdp;
                true
            }
            _ => false,
        }
    }

    /// Flips the live session to `Completed`. Returns false (and reaps) when the
    /// session was cancelled or superseded, in which case the caller must produce no
    /// output and no KV writes.
    fn commit_completed(&self, conn: u64, seq: u64, account: &str) -> bool {
        let mut sessions = self.inner.sessions.lock().unwrap();
        match sessions.get_mut(&conn) {
            Some(session) if session.seq == seq => {
                if matches!(session.state, SessionState::Cancelled) {
                    sessions.remove(&conn);
                    false
                } else {
                    session.state = SessionState::Completed {
                        account: account.to_string(),
                    };
                    session.scratch = MechScratch::None;
                    true
                }
            }
            _ => false,
        }
    }

    fn remove_session(&self, conn: u64, seq: u64) {
        let mut sessions = self.inner.sessions.lock().unwrap();
        if sessions.get(&conn).is_some_and(|s| s.seq == seq) {
            sessions.remove(&conn);
        }
    }

    fn record_ip_failure(&self, ip: Option<String>) {
        let Some(ip) = ip else { return };
        let now = unix_now();
        let mut failures = self.inner.failures.lock().unwrap();
        let stamps = failures.entry(ip).or_default();
        stamps.retain(|t| now.saturating_sub(*t) < THROTTLE_WINDOW_SECS);
        stamps.push(now);
    }

    fn send(&self, conn: u64, reply: SaslReply) {
        let _ = self.inner.outbound.send((conn, reply));
    }

    /// Shared access to the account layer for collaborating subsystems.
    pub fn accounts(&self) -> &Accounts {
        &self.inner.accounts
    }
}

/// Optional extras carried into [`Authenticator::complete_success`].
#[derive(Default)]
struct SuccessContext {
    /// Verified plaintext from a non-impersonating PLAIN, used for lazy SCRAM
    /// verifier provisioning. Dropped at the end of the attempt, never stored.
    plain_password: Option<String>,
    /// Mint and advertise a fresh session token.
    mint_token: bool,
    /// Emitted before the numerics (the SCRAM server-final payload).
    prefix_reply: Option<SaslReply>,
    /// Operator level asserted by the IdP for this identity.
    opserv_level: Option<u32>,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        jwt::testing as jwt_testing,
        options::{IdpOptions, JwtOptions},
    };

    struct Fixture {
        auth: Authenticator,
        store: KvStore,
        jwks: JwksCache,
        rx: mpsc::UnboundedReceiver<(u64, SaslReply)>,
    }

    fn fixture() -> Fixture {
        // Nothing listens on the IdP address, so every IdP call fails fast with a
        // connection error and the local fallback paths carry the tests.
        let store = KvStore::temporary();
        let idp = IdpClient::new(
            IdpOptions::builder()
                .base_url("http://127.0.0.1:9")
                .realm("testnet")
                .client_id("x3")
                .client_secret("hunter2")
                .request_timeout(Duration::from_secs(1))
                .failure_threshold(10_000)
                .build(),
            store.clone(),
        )
        .unwrap();
        let jwks = JwksCache::new(
            JwtOptions::builder()
                .issuer(jwt_testing::ISSUER)
                .audience(jwt_testing::AUDIENCE)
                .build(),
            idp.clone(),
            store.clone(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let auth = Authenticator::new(
            store.clone(),
            idp,
            jwks.clone(),
            AuthOptions::default(),
            tx,
        );
        Fixture {
            auth,
            store,
            jwks,
            rx,
        }
    }

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            certfp: None,
            host: Some("alice@host.example.net".into()),
            remote_ip: Some("198.51.100.7".into()),
        }
    }

    fn info_with_cert(fp: &str) -> ConnectionInfo {
        ConnectionInfo {
            certfp: Some(fp.to_string()),
            ..info()
        }
    }

    fn b64(data: &[u8]) -> String {
        STANDARD.encode(data)
    }

    fn drain(fx: &mut Fixture) -> Vec<SaslReply> {
        let mut replies = Vec::new();
        while let Ok((_, reply)) = fx.rx.try_recv() {
            replies.push(reply);
        }
        replies
    }

    fn terminal_count(replies: &[SaslReply]) -> usize {
        replies.iter().filter(|r| r.is_terminal()).count()
    }

    async fn plain_login(fx: &mut Fixture, conn: u64, user: &str, password: &str) -> Vec<SaslReply> {
        fx.auth.handle_authenticate(conn, "PLAIN", &info()).await;
        let payload = b64(format!("\0{}\0{}", user, password).as_bytes());
        fx.auth.handle_authenticate(conn, &payload, &info()).await;
        drain(fx)
    }

    fn register_with_password(fx: &Fixture, handle: &str, password: &str) {
        let hash = crypt::hash(password).unwrap();
        fx.auth
            .accounts()
            .register(handle, Some(hash), None)
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn plain_cold_then_warm() {
        let mut fx = fixture();
        register_with_password(&fx, "alice", "p@ssw0rd");

        let replies = plain_login(&mut fx, 1, "alice", "p@ssw0rd").await;
        assert_eq!(replies[0], SaslReply::Continue("+".into()));
        assert!(matches!(replies[1], SaslReply::TokenAdvert { .. }));
        assert_eq!(
            replies[2],
            SaslReply::LoggedIn {
                account: "alice".into()
            }
        );
        assert_eq!(replies[3], SaslReply::Success);
        assert_eq!(terminal_count(&replies), 1);

        // The positive cache row holds a digest, never the plaintext.
        let row = fx.store.get_str("authsuccess:alice").unwrap().unwrap();
        assert!(!row.contains("p@ssw0rd"));

        // SCRAM verifiers were provisioned lazily from the verified plaintext.
        assert!(scram_mech::has_account_verifiers(&fx.store, "alice").unwrap());

        // Warm reconnect rides the positive cache: no token mint, straight to 900/903.
        let replies = plain_login(&mut fx, 2, "alice", "p@ssw0rd").await;
        assert_eq!(
            replies,
            vec![
                SaslReply::Continue("+".into()),
                SaslReply::LoggedIn {
                    account: "alice".into()
                },
                SaslReply::Success,
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn plain_wrong_password_populates_negative_cache() {
        let mut fx = fixture();
        register_with_password(&fx, "alice", "p@ssw0rd");

        let replies = plain_login(&mut fx, 1, "alice", "wrong").await;
        assert_eq!(
            replies,
            vec![SaslReply::Continue("+".into()), SaslReply::Fail]
        );

        let cred_hash = plain::credential_hash("alice", "wrong");
        assert!(fx
            .store
            .get(&keys::auth_fail(&cred_hash))
            .unwrap()
            .is_some());
        assert!(fx.store.get("authsuccess:alice").unwrap().is_none());

        // The retry fails fast off the negative cache.
        let replies = plain_login(&mut fx, 2, "alice", "wrong").await;
        assert_eq!(
            replies,
            vec![SaslReply::Continue("+".into()), SaslReply::Fail]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn session_token_reconnect_and_revocation() {
        let mut fx = fixture();
        register_with_password(&fx, "alice", "p@ssw0rd");

        let replies = plain_login(&mut fx, 1, "alice", "p@ssw0rd").await;
        let token_id = replies
            .iter()
            .find_map(|r| match r {
                SaslReply::TokenAdvert { token, .. } => Some(token.clone()),
                _ => None,
            })
            .expect("token advertised");

        // The token id works as a PLAIN password with the x3tok: prefix.
        let presented = format!("{}{}", token::PASSWORD_PREFIX, token_id);
        let replies = plain_login(&mut fx, 2, "alice", &presented).await;
        assert!(replies.contains(&SaslReply::Success));
        // Token reconnects do not rotate the token.
        assert!(!replies
            .iter()
            .any(|r| matches!(r, SaslReply::TokenAdvert { .. })));

        token::revoke_all(&fx.store, "alice").unwrap();
        let replies = plain_login(&mut fx, 3, "alice", &presented).await;
        assert_eq!(
            replies,
            vec![SaslReply::Continue("+".into()), SaslReply::Fail]
        );
    }

    /// Runs the client half of a SCRAM exchange against the orchestrator.
    async fn scram_roundtrip(
        fx: &mut Fixture,
        conn: u64,
        mechanism: &str,
        username: &str,
        password: &str,
    ) -> Vec<SaslReply> {
        let version = mechanism
            .parse::<Mechanism>()
            .unwrap()
            .scram_version()
            .unwrap();

        fx.auth.handle_authenticate(conn, mechanism, &info()).await;
        let client_nonce = "testclientnonce";
        let bare = format!("n={},r={}", username, client_nonce);
        let client_first = format!("n,,{}", bare);
        fx.auth
            .handle_authenticate(conn, &b64(client_first.as_bytes()), &info())
            .await;

        let mut replies = drain(fx);
        let server_first = match replies.pop() {
            Some(SaslReply::Continue(payload)) => {
                String::from_utf8(STANDARD.decode(payload).unwrap()).unwrap()
            }
            other => panic!("expected server-first, got {:?}", other),
        };

        // Parse r=, s=, i= out of the server-first-message.
        let mut fields = server_first.split(',');
        let full_nonce = fields.next().unwrap()[2..].to_string();
        let salt = STANDARD.decode(&fields.next().unwrap()[2..]).unwrap();
        let iterations: u32 = fields.next().unwrap()[2..].parse().unwrap();
        assert!(full_nonce.starts_with(client_nonce));

        let salted = version.h_i(password, &salt, iterations).unwrap();
        let client_key = version.hmac(&salted, b"Client Key").unwrap();
        let stored_key = version.h(&client_key);
        let without_proof = format!("c=biws,r={}", full_nonce);
        let auth_message = format!("{},{},{}", bare, server_first, without_proof);
        let signature = version.hmac(&stored_key, auth_message.as_bytes()).unwrap();
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();
        let client_final = format!("{},p={}", without_proof, STANDARD.encode(proof));
        fx.auth
            .handle_authenticate(conn, &b64(client_final.as_bytes()), &info())
            .await;
        drain(fx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scram_account_exchange() {
        let mut fx = fixture();
        register_with_password(&fx, "bob", "correct horse");
        scram_mech::store_account_verifiers(&fx.store, "bob", "correct horse")
            .await
            .unwrap();

        let replies = scram_roundtrip(&mut fx, 1, "SCRAM-SHA-256", "bob", "correct horse").await;
        assert!(matches!(replies[0], SaslReply::Continue(_)));
        assert!(replies.contains(&SaslReply::LoggedIn {
            account: "bob".into()
        }));
        assert!(replies.contains(&SaslReply::Success));
        assert_eq!(terminal_count(&replies), 1);

        // A wrong password fails the proof.
        let replies = scram_roundtrip(&mut fx, 2, "SCRAM-SHA-256", "bob", "wrong horse").await;
        assert_eq!(replies, vec![SaslReply::Fail]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scram_session_token_reconnect() {
        let mut fx = fixture();
        register_with_password(&fx, "alice", "p@ssw0rd");

        let replies = plain_login(&mut fx, 1, "alice", "p@ssw0rd").await;
        let token_id = replies
            .iter()
            .find_map(|r| match r {
                SaslReply::TokenAdvert { token, .. } => Some(token.clone()),
                _ => None,
            })
            .expect("token advertised");

        let username = format!("{}{}", token::SCRAM_USER_PREFIX, token_id);
        let replies =
            scram_roundtrip(&mut fx, 2, "SCRAM-SHA-512", &username, &token_id).await;
        assert!(replies.contains(&SaslReply::LoggedIn {
            account: "alice".into()
        }));
        assert!(replies.contains(&SaslReply::Success));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn external_with_cached_binding() {
        let mut fx = fixture();
        fx.auth.accounts().register("carol", None, None).unwrap();
        fx.auth
            .accounts()
            .bind_fingerprint("a1b2c3", "carol", Duration::from_secs(3600))
            .unwrap();

        fx.auth
            .handle_authenticate(1, "EXTERNAL", &info_with_cert("A1B2C3"))
            .await;
        fx.auth
            .handle_authenticate(1, "+", &info_with_cert("A1B2C3"))
            .await;
        let replies = drain(&mut fx);
        assert_eq!(
            replies,
            vec![
                SaslReply::Continue("+".into()),
                SaslReply::LoggedIn {
                    account: "carol".into()
                },
                SaslReply::Success,
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn external_negative_cache_fails_fast() {
        let mut fx = fixture();
        external::record_miss(&fx.store, "dead01", Duration::from_secs(60)).unwrap();

        fx.auth
            .handle_authenticate(1, "EXTERNAL", &info_with_cert("DEAD01"))
            .await;
        fx.auth
            .handle_authenticate(1, "+", &info_with_cert("DEAD01"))
            .await;
        assert_eq!(
            drain(&mut fx),
            vec![SaslReply::Continue("+".into()), SaslReply::Fail]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn external_without_certificate_fails() {
        let mut fx = fixture();
        fx.auth.handle_authenticate(1, "EXTERNAL", &info()).await;
        fx.auth.handle_authenticate(1, "+", &info()).await;
        assert_eq!(
            drain(&mut fx),
            vec![SaslReply::Continue("+".into()), SaslReply::Fail]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oauthbearer_with_local_jwt() {
        let mut fx = fixture();
        let key = jsonwebtoken::DecodingKey::from_rsa_pem(
            jwt_testing::TEST_RSA_PUBLIC_PEM.as_bytes(),
        )
        .unwrap();
        fx.jwks
            .insert_key("test-key", key, unix_now() + 3600)
            .await;

        let jwt = jwt_testing::sign("test-key", &jwt_testing::good_claims());
        fx.auth.handle_authenticate(1, "OAUTHBEARER", &info()).await;
        let payload = format!("n,,\x01auth=Bearer {}\x01\x01", jwt);
        fx.auth
            .handle_authenticate(1, &b64(payload.as_bytes()), &info())
            .await;

        let replies = drain(&mut fx);
        assert!(replies.contains(&SaslReply::LoggedIn {
            account: "alice".into()
        }));
        assert!(replies.contains(&SaslReply::Success));

        // The IdP-asserted operator level landed on the shadow-registered account.
        let account = fx.auth.accounts().get("alice").unwrap().unwrap();
        assert_eq!(account.opserv_level, 600);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abort_then_retry() {
        let mut fx = fixture();
        register_with_password(&fx, "alice", "p@ssw0rd");
        let cred_hash = plain::credential_hash("alice", "p@ssw0rd");
        plain::record_success(&fx.store, "alice", &cred_hash, Duration::from_secs(3600)).unwrap();

        fx.auth.handle_authenticate(1, "PLAIN", &info()).await;
        fx.auth.handle_authenticate(1, "*", &info()).await;
        assert_eq!(
            drain(&mut fx),
            vec![SaslReply::Continue("+".into()), SaslReply::Aborted]
        );

        // The session is reusable after the abort.
        let replies = plain_login(&mut fx, 1, "alice", "p@ssw0rd").await;
        assert!(replies.contains(&SaslReply::Success));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reauthentication_policy() {
        let mut fx = fixture();
        register_with_password(&fx, "alice", "p@ssw0rd");
        let cred_hash = plain::credential_hash("alice", "p@ssw0rd");
        plain::record_success(&fx.store, "alice", &cred_hash, Duration::from_secs(3600)).unwrap();

        let replies = plain_login(&mut fx, 1, "alice", "p@ssw0rd").await;
        assert!(replies.contains(&SaslReply::Success));

        // Completed sessions refuse a second PLAIN.
        fx.auth.handle_authenticate(1, "PLAIN", &info()).await;
        assert_eq!(drain(&mut fx), vec![SaslReply::Already]);

        // But OAUTHBEARER may refresh in place.
        fx.auth.handle_authenticate(1, "OAUTHBEARER", &info()).await;
        assert_eq!(drain(&mut fx), vec![SaslReply::Continue("+".into())]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_mechanism_lists_and_fails() {
        let mut fx = fixture();
        fx.auth.handle_authenticate(1, "ANONYMOUS", &info()).await;
        let replies = drain(&mut fx);
        assert!(matches!(replies[0], SaslReply::Mechs(_)));
        assert_eq!(replies[1], SaslReply::Fail);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversize_payload_is_rejected() {
        let mut fx = fixture();
        fx.auth.handle_authenticate(1, "PLAIN", &info()).await;
        assert_eq!(drain(&mut fx), vec![SaslReply::Continue("+".into())]);

        // Feed full-size chunks until the reassembly bound trips.
        let chunk = "A".repeat(400);
        let mut replies = Vec::new();
        for _ in 0..40 {
            fx.auth.handle_authenticate(1, &chunk, &info()).await;
            replies.extend(drain(&mut fx));
            if replies.iter().any(SaslReply::is_terminal) {
                break;
            }
        }
        assert_eq!(replies, vec![SaslReply::TooLong]);
    }

    #[tokio::test(start_paused = true)]
    async fn negotiation_timeout() {
        let mut fx = fixture();
        fx.auth.handle_authenticate(1, "PLAIN", &info()).await;
        tokio::time::sleep(Duration::from_secs(31)).await;
        let replies = drain(&mut fx);
        assert_eq!(
            replies,
            vec![SaslReply::Continue("+".into()), SaslReply::Fail]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_session_produces_no_output_and_no_writes() {
        let mut fx = fixture();
        fx.auth.handle_authenticate(1, "PLAIN", &info()).await;
        let seq = {
            let sessions = fx.auth.inner.sessions.lock().unwrap();
            sessions.get(&1).unwrap().seq
        };
        assert!(fx.auth.set_awaiting(1, seq));
        fx.auth.connection_closed(1);

        fx.auth
            .complete_success(1, seq, "alice".into(), SuccessContext::default())
            .await;

        // Only the initial challenge was ever emitted.
        assert_eq!(drain(&mut fx), vec![SaslReply::Continue("+".into())]);
        // No account was shadow-registered, no activity recorded.
        assert!(fx.auth.accounts().get("alice").unwrap().is_none());
        assert!(fx.store.get("activity:alice").unwrap().is_none());
        // The session table was reaped.
        assert!(fx.auth.inner.sessions.lock().unwrap().get(&1).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn no_plaintext_ever_reaches_the_store() {
        let mut fx = fixture();
        register_with_password(&fx, "alice", "p@ssw0rd");
        let replies = plain_login(&mut fx, 1, "alice", "p@ssw0rd").await;
        assert!(replies.contains(&SaslReply::Success));
        // A failed attempt writes negative-cache state; include it in the sweep.
        let _ = plain_login(&mut fx, 2, "alice", "tr0ub4dor&3").await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("export.json");
        fx.store.export_json(&dest).unwrap();
        let exported = std::fs::read_to_string(&dest).unwrap();
        assert!(!exported.contains("p@ssw0rd"));
        assert!(!exported.contains("tr0ub4dor&3"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn password_change_webhook_invalidates_cached_login() {
        let mut fx = fixture();
        // An IdP-backed account: no local hash, warmed purely through the cache.
        fx.auth.accounts().register("alice", None, None).unwrap();
        let cred_hash = plain::credential_hash("alice", "oldpass");
        plain::record_success(&fx.store, "alice", &cred_hash, Duration::from_secs(3600)).unwrap();

        let replies = plain_login(&mut fx, 1, "alice", "oldpass").await;
        assert!(replies.contains(&SaslReply::Success));

        let webhook = crate::webhook::WebhookState::new(fx.store.clone(), "s3cret");
        webhook
            .apply(&serde_json::from_value(serde_json::json!({
                "resourceType": "CREDENTIAL",
                "operationType": "UPDATE",
                "resourcePath": "users/u1",
                "representation": { "type": "password", "username": "alice" },
            })).unwrap())
            .unwrap();

        assert!(fx.store.get("authsuccess:alice").unwrap().is_none());
        let replies = plain_login(&mut fx, 2, "alice", "oldpass").await;
        assert_eq!(
            replies,
            vec![SaslReply::Continue("+".into()), SaslReply::Fail]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn suspended_account_is_refused() {
        let mut fx = fixture();
        register_with_password(&fx, "mallory", "p@ssw0rd");
        let mut account = fx.auth.accounts().get("mallory").unwrap().unwrap();
        account.suspended = true;
        fx.auth.accounts().save(&account).unwrap();

        let replies = plain_login(&mut fx, 1, "mallory", "p@ssw0rd").await;
        assert!(replies.contains(&SaslReply::Fail));
        assert!(!replies.contains(&SaslReply::Success));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn throttle_counts_recent_failures() {
        let mut fx = fixture();
        register_with_password(&fx, "alice", "p@ssw0rd");

        for conn in 1..=3 {
            let _ = plain_login(&mut fx, conn, "alice", &format!("wrong{}", conn)).await;
        }
        assert!(fx.auth.is_throttled("198.51.100.7"));
        assert!(!fx.auth.is_throttled("203.0.113.1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scram_version_mismatch_has_no_verifier() {
        let mut fx = fixture();
        // No verifiers at all for this user.
        fx.auth.handle_authenticate(1, "SCRAM-SHA-256", &info()).await;
        let client_first = b64(b"n,,n=ghost,r=abcdef");
        fx.auth.handle_authenticate(1, &client_first, &info()).await;
        assert_eq!(
            drain(&mut fx),
            vec![SaslReply::Continue("+".into()), SaslReply::Fail]
        );
    }
}
