//! OAUTHBEARER (RFC 7628) payload parsing.
//!
//! The payload is a gs2 header followed by `\x01`-separated key/value pairs and a
//! double `\x01` terminator; the only pair this engine needs is
//! `auth=Bearer <token>`.

use crate::error::{Error, Result};

const KV_SEPARATOR: u8 = 0x01;

/// Extracts the bearer token from an OAUTHBEARER client payload.
pub(crate) fn parse_payload(bytes: &[u8]) -> Result<String> {
    let malformed = || Error::invalid_authentication_payload("OAUTHBEARER");

    let text = std::str::from_utf8(bytes).map_err(|_| malformed())?;
    // gs2 header up to the first ^A, e.g. "n,a=user," or "n,,".
    let mut fields = text.split(KV_SEPARATOR as char);
    let gs2 = fields.next().ok_or_else(malformed)?;
    if !(gs2.starts_with("n,") || gs2.starts_with("y,") || gs2.starts_with("p=")) {
        return Err(malformed());
    }

    for field in fields {
        if field.is_empty() {
            continue;
        }
        if let Some(value) = field.strip_prefix("auth=") {
            let token = value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
                .ok_or_else(malformed)?;
            if token.is_empty() {
                return Err(malformed());
            }
            return Ok(token.to_string());
        }
    }
    Err(malformed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bearer_token() {
        let payload = b"n,a=alice,\x01host=irc.example.net\x01auth=Bearer eyJhbGciOi.abc.def\x01\x01";
        assert_eq!(parse_payload(payload).unwrap(), "eyJhbGciOi.abc.def");
    }

    #[test]
    fn minimal_payload() {
        let payload = b"n,,\x01auth=Bearer tok\x01\x01";
        assert_eq!(parse_payload(payload).unwrap(), "tok");
    }

    #[test]
    fn rejects_missing_auth() {
        assert!(parse_payload(b"n,,\x01host=x\x01\x01").is_err());
        assert!(parse_payload(b"n,,\x01auth=Basic abc\x01\x01").is_err());
        assert!(parse_payload(b"n,,\x01auth=Bearer \x01\x01").is_err());
        assert!(parse_payload(b"garbage").is_err());
        assert!(parse_payload(&[0xff, 0xfe]).is_err());
    }
}
