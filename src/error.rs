//! Contains the `Error` and `Result` types that `x3svc` uses.

use std::sync::Arc;

use thiserror::Error;

/// The result type for all methods that can return an error in the `x3svc` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `x3svc` crate. The inner [`ErrorKind`] is boxed to keep
/// the type cheap to move through the authentication pipeline.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
    #[source]
    pub(crate) source: Option<Box<Error>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
            source: None,
        }
    }

    /// Creates an `AuthDenied` error for the given mechanism with the provided reason.
    pub(crate) fn authentication_error(mechanism_name: &str, reason: &str) -> Self {
        ErrorKind::AuthDenied {
            message: format!("{} failure: {}", mechanism_name, reason),
        }
        .into()
    }

    /// Creates an `AuthDenied` error for the given mechanism when the client payload is
    /// malformed.
    pub(crate) fn invalid_authentication_payload(mechanism_name: &str) -> Error {
        Error::authentication_error(mechanism_name, "invalid client payload")
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Error {
        ErrorKind::Protocol {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn idp_unavailable(message: impl Into<String>) -> Error {
        ErrorKind::IdpUnavailable {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn policy_reject(message: impl Into<String>) -> Error {
        ErrorKind::PolicyReject {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn is_auth_denied(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::AuthDenied { .. } | ErrorKind::NickLocked { .. }
        )
    }

    pub(crate) fn is_idp_unavailable(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::IdpUnavailable { .. } | ErrorKind::CircuitOpen
        )
    }

    #[allow(unused)]
    pub(crate) fn is_circuit_open(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::CircuitOpen)
    }

    /// Whether the store should be considered unusable after this error. Corruption is not
    /// recoverable in-process; the daemon is expected to exit and be restored from the most
    /// recent snapshot.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::StoreCorruption { .. })
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Self::new(err.into())
    }
}

impl From<sled::Error> for ErrorKind {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::Corruption { .. } => ErrorKind::StoreCorruption {
                message: err.to_string(),
            },
            _ => ErrorKind::Store {
                message: err.to_string(),
            },
        }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        ErrorKind::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for ErrorKind {
    fn from(err: serde_json::Error) -> Self {
        ErrorKind::Internal {
            message: format!("JSON serialization failure: {}", err),
        }
    }
}

impl From<reqwest::Error> for ErrorKind {
    fn from(err: reqwest::Error) -> Self {
        ErrorKind::IdpUnavailable {
            message: err.to_string(),
        }
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The client violated the authentication protocol, e.g. an oversize or malformed
    /// `AUTHENTICATE` payload.
    #[error("Protocol error: {message}")]
    #[non_exhaustive]
    Protocol { message: String },

    /// The presented credentials were rejected.
    #[error("{message}")]
    #[non_exhaustive]
    AuthDenied { message: String },

    /// The account prohibits the nick in use.
    #[error("account {account} prohibits this nick")]
    #[non_exhaustive]
    NickLocked { account: String },

    /// The identity provider could not be reached or answered with a server error.
    #[error("identity provider unavailable: {message}")]
    #[non_exhaustive]
    IdpUnavailable { message: String },

    /// The circuit breaker is open; the identity provider has been failing repeatedly.
    #[error("identity provider circuit open")]
    CircuitOpen,

    /// An error from the embedded KV store.
    #[error("store error: {message}")]
    #[non_exhaustive]
    Store { message: String },

    /// The embedded KV store reported corruption.
    #[error("store corruption: {message}")]
    #[non_exhaustive]
    StoreCorruption { message: String },

    /// Wrapper around [`std::io::Error`].
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// An unexpected failure inside the daemon. Never surfaced to clients in detail.
    #[error("internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// The operation is forbidden by policy, e.g. re-authentication with a
    /// non-refreshable mechanism.
    #[error("policy reject: {message}")]
    #[non_exhaustive]
    PolicyReject { message: String },

    /// An invalid argument was provided by the caller.
    #[error("invalid argument: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_denied_predicate() {
        let err = Error::authentication_error("PLAIN", "bad password");
        assert!(err.is_auth_denied());
        assert!(!err.is_idp_unavailable());

        let err: Error = ErrorKind::NickLocked {
            account: "alice".to_string(),
        }
        .into();
        assert!(err.is_auth_denied());
    }

    #[test]
    fn circuit_open_is_idp_unavailable() {
        let err: Error = ErrorKind::CircuitOpen.into();
        assert!(err.is_idp_unavailable());
        assert!(err.is_circuit_open());
        assert!(!err.is_fatal());
    }
}
