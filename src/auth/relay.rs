//! The server-to-server SASL relay.
//!
//! The IRCd forwards each client's SASL traffic to services as single-line bundles;
//! replies travel back the same way. A bundle carries the target server, the origin
//! (`server!fd.cookie`, which also keys the session), a one-letter subcommand, the
//! data field, and an optional extension field.
//!
//! Subcommands: `S` start (mechanism name), `H` host info (`user@host:ip`), `C`
//! continue (base64 payload), `D` done (`S`/`F`/`A`), `L` login (account +
//! registration timestamp), `M` mechanism list, `I` impersonation (ignored by peers
//! that do not implement it).

use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use tracing::{debug, warn};

use crate::{
    auth::{Authenticator, ConnectionInfo, SaslReply},
    error::{Error, Result},
};

/// Relay connection ids live above this bit so they never collide with the framer's.
const RELAY_CONN_BASE: u64 = 1 << 63;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Subcommand {
    Start,
    HostInfo,
    Continue,
    Done,
    Login,
    MechList,
    Impersonate,
}

impl Subcommand {
    fn code(&self) -> char {
        match self {
            Subcommand::Start => 'S',
            Subcommand::HostInfo => 'H',
            Subcommand::Continue => 'C',
            Subcommand::Done => 'D',
            Subcommand::Login => 'L',
            Subcommand::MechList => 'M',
            Subcommand::Impersonate => 'I',
        }
    }
}

impl FromStr for Subcommand {
    type Err = Error;

    fn from_str(str: &str) -> Result<Self> {
        match str {
            "S" => Ok(Subcommand::Start),
            "H" => Ok(Subcommand::HostInfo),
            "C" => Ok(Subcommand::Continue),
            "D" => Ok(Subcommand::Done),
            "L" => Ok(Subcommand::Login),
            "M" => Ok(Subcommand::MechList),
            "I" => Ok(Subcommand::Impersonate),
            _ => Err(Error::protocol(format!("unknown relay subcommand: {}", str))),
        }
    }
}

/// One parsed relay line.
#[derive(Clone, Debug, PartialEq)]
pub struct RelayBundle {
    pub target: String,
    /// `server!fd.cookie`; also the session key.
    pub origin: String,
    pub subcommand: Subcommand,
    pub data: String,
    pub ext: Option<String>,
}

impl RelayBundle {
    pub fn parse(line: &str) -> Result<Self> {
        let mut fields = line.split(' ');
        let malformed = || Error::protocol("malformed relay bundle");
        let target = fields.next().filter(|f| !f.is_empty()).ok_or_else(malformed)?;
        let origin = fields.next().filter(|f| !f.is_empty()).ok_or_else(malformed)?;
        let subcommand = fields.next().ok_or_else(malformed)?.parse()?;
        let data = fields.next().ok_or_else(malformed)?;
        let ext = fields.next().map(str::to_string);
        if fields.next().is_some() {
            return Err(malformed());
        }
        Ok(Self {
            target: target.to_string(),
            origin: origin.to_string(),
            subcommand,
            data: data.to_string(),
            ext,
        })
    }

    /// The server half of the origin field.
    pub fn origin_server(&self) -> &str {
        self.origin.split('!').next().unwrap_or(&self.origin)
    }
}

impl Display for RelayBundle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.target,
            self.origin,
            self.subcommand.code(),
            self.data
        )?;
        if let Some(ref ext) = self.ext {
            write!(f, " {}", ext)?;
        }
        Ok(())
    }
}

struct RelaySession {
    conn: u64,
    info: ConnectionInfo,
}

/// Maps relay bundles onto the orchestrator and orchestrator replies back onto
/// bundles.
pub struct RelayHandler {
    auth: Authenticator,
    server_name: String,
    sessions: Mutex<HashMap<String, RelaySession>>,
    conn_origins: Mutex<HashMap<u64, String>>,
    next_conn: AtomicU64,
}

impl RelayHandler {
    pub fn new(auth: Authenticator, server_name: impl Into<String>) -> Self {
        Self {
            auth,
            server_name: server_name.into(),
            sessions: Mutex::new(HashMap::new()),
            conn_origins: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(RELAY_CONN_BASE),
        }
    }

    /// Feeds one inbound bundle into the orchestrator.
    pub async fn handle_bundle(&self, bundle: &RelayBundle) {
        match bundle.subcommand {
            Subcommand::Start => {
                let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
                let stale = self.sessions.lock().unwrap().insert(
                    bundle.origin.clone(),
                    RelaySession {
                        conn,
                        info: ConnectionInfo::default(),
                    },
                );
                if let Some(stale) = stale {
                    self.auth.connection_closed(stale.conn);
                    self.conn_origins.lock().unwrap().remove(&stale.conn);
                }
                self.conn_origins
                    .lock()
                    .unwrap()
                    .insert(conn, bundle.origin.clone());
                let info = ConnectionInfo::default();
                self.auth.handle_authenticate(conn, &bundle.data, &info).await;
            }
            Subcommand::HostInfo => {
                let mut sessions = self.sessions.lock().unwrap();
                if let Some(session) = sessions.get_mut(&bundle.origin) {
                    session.info = parse_host_info(&bundle.data);
                } else {
                    debug!(origin = %bundle.origin, "host info for unknown relay session");
                }
            }
            Subcommand::Continue => {
                let entry = {
                    let sessions = self.sessions.lock().unwrap();
                    sessions
                        .get(&bundle.origin)
                        .map(|s| (s.conn, s.info.clone()))
                };
                match entry {
                    Some((conn, info)) => {
                        self.auth.handle_authenticate(conn, &bundle.data, &info).await
                    }
                    None => warn!(origin = %bundle.origin, "continue for unknown relay session"),
                }
            }
            Subcommand::Done => {
                // Only an abort travels in this direction.
                let entry = {
                    let mut sessions = self.sessions.lock().unwrap();
                    sessions.remove(&bundle.origin)
                };
                if let Some(session) = entry {
                    self.conn_origins.lock().unwrap().remove(&session.conn);
                    if bundle.data == "A" {
                        self.auth.connection_closed(session.conn);
                    }
                }
            }
            Subcommand::Login | Subcommand::MechList | Subcommand::Impersonate => {
                // L is only ever sent by us; M is answered by mechanism_bundle; I is informational.
            }
        }
    }

    /// Builds the `M` answer for a mechanism-list query.
    pub fn mechanism_bundle(&self, query: &RelayBundle) -> RelayBundle {
        RelayBundle {
            target: query.origin_server().to_string(),
            origin: format!("{}!0.0", self.server_name),
            subcommand: Subcommand::MechList,
            data: self.auth.mechanism_list(),
            ext: None,
        }
    }

    /// Translates one orchestrator reply into outbound bundles. Terminal replies also
    /// retire the relay session.
    pub fn translate_reply(&self, conn: u64, reply: &SaslReply) -> Vec<RelayBundle> {
        let Some(origin) = self.conn_origins.lock().unwrap().get(&conn).cloned() else {
            return Vec::new();
        };
        let target = origin
            .split('!')
            .next()
            .unwrap_or(origin.as_str())
            .to_string();
        let from = format!("{}!0.0", self.server_name);
        let bundle = |subcommand, data: String, ext: Option<String>| RelayBundle {
            target: target.clone(),
            origin: from.clone(),
            subcommand,
            data,
            ext,
        };

        let out = match reply {
            SaslReply::Continue(payload) => {
                vec![bundle(Subcommand::Continue, payload.clone(), None)]
            }
            SaslReply::LoggedIn { account } => {
                let registered = self
                    .auth
                    .accounts()
                    .get(account)
                    .ok()
                    .flatten()
                    .map(|a| a.registered)
                    .unwrap_or(0);
                vec![bundle(
                    Subcommand::Login,
                    account.clone(),
                    Some(registered.to_string()),
                )]
            }
            SaslReply::Success => vec![bundle(Subcommand::Done, "S".into(), None)],
            SaslReply::Aborted => vec![bundle(Subcommand::Done, "A".into(), None)],
            SaslReply::Fail
            | SaslReply::TooLong
            | SaslReply::Already
            | SaslReply::NickLocked => vec![bundle(Subcommand::Done, "F".into(), None)],
            SaslReply::Mechs(list) => vec![bundle(Subcommand::MechList, list.clone(), None)],
            SaslReply::TokenAdvert { .. } => Vec::new(),
        };

        if reply.is_terminal() {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.retain(|_, s| s.conn != conn);
            self.conn_origins.lock().unwrap().remove(&conn);
        }
        out
    }
}

/// Parses the `H` data field, `user@host:ip`.
fn parse_host_info(data: &str) -> ConnectionInfo {
    let (host_part, ip) = match data.rsplit_once(':') {
        Some((host, ip)) => (host, Some(ip.to_string())),
        None => (data, None),
    };
    ConnectionInfo {
        certfp: None,
        host: Some(host_part.to_string()),
        remote_ip: ip,
    }
}
