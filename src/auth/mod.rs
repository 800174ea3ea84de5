//! The SASL engine: mechanism registry, per-connection sessions, and the orchestrator
//! that drives authentication end-to-end.
//!
//! The orchestrator is the single point that translates internal errors into IRC
//! numerics. Every other subsystem returns typed errors to it.

mod external;
mod oauthbearer;
mod orchestrator;
mod plain;
pub mod relay;
mod scram;
mod session;
pub(crate) mod token;

use std::str::FromStr;

use serde::Deserialize;

use crate::{
    error::{Error, ErrorKind, Result},
    scram::ScramVersion,
};

pub use orchestrator::Authenticator;

const PLAIN_STR: &str = "PLAIN";
const EXTERNAL_STR: &str = "EXTERNAL";
const OAUTHBEARER_STR: &str = "OAUTHBEARER";
const SCRAM_SHA_1_STR: &str = "SCRAM-SHA-1";
const SCRAM_SHA_256_STR: &str = "SCRAM-SHA-256";
const SCRAM_SHA_512_STR: &str = "SCRAM-SHA-512";

/// The SASL mechanisms the orchestrator can drive.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[non_exhaustive]
pub enum Mechanism {
    /// `\0<authzid>\0<authcid>\0<password>`, verified locally, against the caches, or
    /// against the IdP's password grant.
    Plain,

    /// TLS client-certificate authentication; the fingerprint is resolved through the
    /// local binding cache or the IdP.
    External,

    /// RFC 7628 bearer authentication, verified locally against the JWKS when
    /// possible and via token introspection otherwise.
    OauthBearer,

    /// The SCRAM-SHA-1 mechanism as defined in [RFC 5802](https://tools.ietf.org/html/rfc5802).
    ScramSha1,

    /// The SCRAM-SHA-256 mechanism which extends RFC 5802 and is formally defined in
    /// [RFC 7677](https://tools.ietf.org/html/rfc7677).
    ScramSha256,

    /// SCRAM over SHA-512, same construction as the other SCRAM family members.
    ScramSha512,
}

impl Mechanism {
    /// Returns this `Mechanism` as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mechanism::Plain => PLAIN_STR,
            Mechanism::External => EXTERNAL_STR,
            Mechanism::OauthBearer => OAUTHBEARER_STR,
            Mechanism::ScramSha1 => SCRAM_SHA_1_STR,
            Mechanism::ScramSha256 => SCRAM_SHA_256_STR,
            Mechanism::ScramSha512 => SCRAM_SHA_512_STR,
        }
    }

    /// Whether a completed session may re-authenticate with this mechanism without a
    /// disconnect. Only bearer refresh is allowed by policy.
    pub(crate) fn is_refreshable(&self) -> bool {
        matches!(self, Mechanism::OauthBearer)
    }

    pub(crate) fn scram_version(&self) -> Option<ScramVersion> {
        match self {
            Mechanism::ScramSha1 => Some(ScramVersion::Sha1),
            Mechanism::ScramSha256 => Some(ScramVersion::Sha256),
            Mechanism::ScramSha512 => Some(ScramVersion::Sha512),
            _ => None,
        }
    }
}

impl FromStr for Mechanism {
    type Err = Error;

    fn from_str(str: &str) -> Result<Self> {
        match str.to_ascii_uppercase().as_str() {
            PLAIN_STR => Ok(Mechanism::Plain),
            EXTERNAL_STR => Ok(Mechanism::External),
            OAUTHBEARER_STR => Ok(Mechanism::OauthBearer),
            SCRAM_SHA_1_STR => Ok(Mechanism::ScramSha1),
            SCRAM_SHA_256_STR => Ok(Mechanism::ScramSha256),
            SCRAM_SHA_512_STR => Ok(Mechanism::ScramSha512),
            _ => Err(ErrorKind::InvalidArgument {
                message: format!("invalid mechanism string: {}", str),
            }
            .into()),
        }
    }
}

/// Connection-scoped facts the framer knows and the orchestrator needs.
#[derive(Clone, Debug, Default)]
pub struct ConnectionInfo {
    /// Hex fingerprint of a verified TLS peer certificate, if any.
    pub certfp: Option<String>,
    /// `user@host` of the connection, used in the 900 reply.
    pub host: Option<String>,
    /// Remote IP, used for failure throttling.
    pub remote_ip: Option<String>,
}

/// A reply the framer must deliver to the client. Numeric codes are bit-exact where
/// visible to users.
#[derive(Clone, Debug, PartialEq)]
pub enum SaslReply {
    /// `AUTHENTICATE <payload>` continuation line (`+` for an empty challenge).
    Continue(String),
    /// 900: the connection is now logged in as `account`.
    LoggedIn { account: String },
    /// 902: the account prohibits the nick in use.
    NickLocked,
    /// 903: terminal success.
    Success,
    /// 904: terminal failure, including timeout and internal error.
    Fail,
    /// 905: chunked payload exceeded the bound.
    TooLong,
    /// 906: aborted with `AUTHENTICATE *`.
    Aborted,
    /// 907: re-authentication attempted with a non-refreshable mechanism.
    Already,
    /// 908: the mechanism list.
    Mechs(String),
    /// Standards-extension advertisement of a freshly minted session token.
    TokenAdvert { token: String, expires: u64 },
}

impl SaslReply {
    /// The IRC numeric for this reply, if it is one.
    pub fn numeric(&self) -> Option<u16> {
        match self {
            SaslReply::Continue(_) | SaslReply::TokenAdvert { .. } => None,
            SaslReply::LoggedIn { .. } => Some(900),
            SaslReply::NickLocked => Some(902),
            SaslReply::Success => Some(903),
            SaslReply::Fail => Some(904),
            SaslReply::TooLong => Some(905),
            SaslReply::Aborted => Some(906),
            SaslReply::Already => Some(907),
            SaslReply::Mechs(_) => Some(908),
        }
    }

    /// Whether this reply terminates the attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SaslReply::Success
                | SaslReply::Fail
                | SaslReply::TooLong
                | SaslReply::Aborted
                | SaslReply::Already
        )
    }
}
