//! Server-side SCRAM (RFC 5802) for SHA-1, SHA-256, and SHA-512.
//!
//! The engine serves two purposes: account authentication against a stored verifier
//! derived at password-set time, and session-token authentication against a verifier
//! minted alongside the token. In both cases the server holds
//! `(salt, iterations, StoredKey, ServerKey)` and never the plaintext.

use std::fmt::{self, Display, Formatter};

use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

// The single letter attribute keys in SCRAM messages.
const PROOF_KEY: char = 'p';
const VERIFIER_KEY: char = 'v';
const NONCE_KEY: char = 'r';
const SALT_KEY: char = 's';
const ITERATION_COUNT_KEY: char = 'i';
const CHANNEL_BINDING_KEY: char = 'c';
const USERNAME_KEY: char = 'n';
const AUTHZID_KEY: char = 'a';

/// Iteration count used when deriving new verifiers.
pub(crate) const VERIFIER_ITERATIONS: u32 = 4096;

/// Server nonce length in bytes, before base64.
const SERVER_NONCE_LEN: usize = 24;

/// The lowercase hash names used in `scram:`/`scram_acct:` row keys, in preference
/// order.
pub(crate) const HASH_NAMES: [&str; 3] = ["sha1", "sha256", "sha512"];

/// The hash families SCRAM is offered over.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum ScramVersion {
    Sha1,
    Sha256,
    Sha512,
}

impl ScramVersion {
    /// The lowercase name used in KV row keys.
    pub(crate) fn hash_name(&self) -> &'static str {
        match self {
            ScramVersion::Sha1 => "sha1",
            ScramVersion::Sha256 => "sha256",
            ScramVersion::Sha512 => "sha512",
        }
    }

    pub(crate) fn from_hash_name(name: &str) -> Option<Self> {
        match name {
            "sha1" => Some(ScramVersion::Sha1),
            "sha256" => Some(ScramVersion::Sha256),
            "sha512" => Some(ScramVersion::Sha512),
            _ => None,
        }
    }

    /// HMAC function used as part of SCRAM authentication.
    pub(crate) fn hmac(&self, key: &[u8], input: &[u8]) -> Result<Vec<u8>> {
        match self {
            ScramVersion::Sha1 => mac::<Hmac<Sha1>>(key, input),
            ScramVersion::Sha256 => mac::<Hmac<Sha256>>(key, input),
            ScramVersion::Sha512 => mac::<Hmac<Sha512>>(key, input),
        }
    }

    /// The "H" function defined in the SCRAM RFC.
    pub(crate) fn h(&self, data: &[u8]) -> Vec<u8> {
        match self {
            ScramVersion::Sha1 => Sha1::digest(data).to_vec(),
            ScramVersion::Sha256 => Sha256::digest(data).to_vec(),
            ScramVersion::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    /// The "Hi" function as defined in the SCRAM RFC (PBKDF2 over the normalized
    /// password).
    pub(crate) fn h_i(&self, normalized: &str, salt: &[u8], iterations: u32) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.digest_len()];
        let result = match self {
            ScramVersion::Sha1 => pbkdf2::pbkdf2::<Hmac<Sha1>>(
                normalized.as_bytes(),
                salt,
                iterations,
                &mut out,
            ),
            ScramVersion::Sha256 => pbkdf2::pbkdf2::<Hmac<Sha256>>(
                normalized.as_bytes(),
                salt,
                iterations,
                &mut out,
            ),
            ScramVersion::Sha512 => pbkdf2::pbkdf2::<Hmac<Sha512>>(
                normalized.as_bytes(),
                salt,
                iterations,
                &mut out,
            ),
        };
        result.map_err(|_| Error::internal("PBKDF2 output length"))?;
        Ok(out)
    }

    fn digest_len(&self) -> usize {
        match self {
            ScramVersion::Sha1 => 20,
            ScramVersion::Sha256 => 32,
            ScramVersion::Sha512 => 64,
        }
    }
}

impl Display for ScramVersion {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            ScramVersion::Sha1 => write!(f, "SCRAM-SHA-1"),
            ScramVersion::Sha256 => write!(f, "SCRAM-SHA-256"),
            ScramVersion::Sha512 => write!(f, "SCRAM-SHA-512"),
        }
    }
}

fn mac<M: Mac + hmac::digest::KeyInit>(key: &[u8], input: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        <M as hmac::digest::KeyInit>::new_from_slice(key).map_err(|_| Error::internal("HMAC key"))?;
    mac.update(input);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn xor(lhs: &[u8], rhs: &[u8]) -> Result<Vec<u8>> {
    if lhs.len() != rhs.len() {
        return Err(Error::invalid_authentication_payload("SCRAM"));
    }
    Ok(lhs.iter().zip(rhs.iter()).map(|(l, r)| l ^ r).collect())
}

/// Parses a string slice of the form `<expected_key>=<body>` into `<body>`.
fn parse_kvp(str: &str, expected_key: char) -> Result<&str> {
    let mut chars = str.chars();
    if chars.next() != Some(expected_key) || chars.next() != Some('=') {
        Err(Error::invalid_authentication_payload("SCRAM"))
    } else {
        Ok(&str[2..])
    }
}

/// Undoes SCRAM's `=2C`/`=3D` username escaping.
fn unescape_username(name: &str) -> Result<String> {
    if !name.contains('=') {
        return Ok(name.to_string());
    }
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(idx) = rest.find('=') {
        out.push_str(&rest[..idx]);
        match rest.get(idx + 1..idx + 3) {
            Some("2C") => out.push(','),
            Some("3D") => out.push('='),
            _ => return Err(Error::invalid_authentication_payload("SCRAM")),
        }
        rest = &rest[idx + 3..];
    }
    out.push_str(rest);
    Ok(out)
}

/// A stored SCRAM verifier: everything the server needs to run the exchange without
/// the plaintext.
#[derive(Clone, Debug, PartialEq)]
pub struct ScramVerifier {
    pub version: ScramVersion,
    pub iterations: u32,
    pub salt: Vec<u8>,
    pub stored_key: Vec<u8>,
    pub server_key: Vec<u8>,
    /// The account the verifier authenticates.
    pub account: String,
}

impl ScramVerifier {
    /// Derives a verifier from a plaintext password with a fresh random salt. Runs
    /// SASLprep on the password first.
    pub fn derive(version: ScramVersion, password: &str, account: &str) -> Result<Self> {
        let mut salt = [0u8; 16];
        rand::rng().fill_bytes(&mut salt);
        Self::derive_with_salt(version, password, &salt, VERIFIER_ITERATIONS, account)
    }

    pub(crate) fn derive_with_salt(
        version: ScramVersion,
        password: &str,
        salt: &[u8],
        iterations: u32,
        account: &str,
    ) -> Result<Self> {
        let normalized = stringprep::saslprep(password)
            .map_err(|_| Error::authentication_error("SCRAM", "saslprep failure"))?;
        let salted_password = version.h_i(normalized.as_ref(), salt, iterations)?;
        let client_key = version.hmac(&salted_password, b"Client Key")?;
        let server_key = version.hmac(&salted_password, b"Server Key")?;
        Ok(Self {
            version,
            iterations,
            salt: salt.to_vec(),
            stored_key: version.h(&client_key),
            server_key,
            account: account.to_string(),
        })
    }

    /// Encodes the account-verifier row value:
    /// `0:<hash>:<iter>:<b64-salt>:<b64-stored>:<b64-server>:<account>`.
    pub(crate) fn encode_account_row(&self) -> String {
        self.encode_row(0)
    }

    /// Encodes the session-token row value, which carries the token expiry in place of
    /// the leading zero.
    pub(crate) fn encode_token_row(&self, expires: u64) -> String {
        self.encode_row(expires)
    }

    fn encode_row(&self, first_field: u64) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}",
            first_field,
            self.version.hash_name(),
            self.iterations,
            STANDARD.encode(&self.salt),
            STANDARD.encode(&self.stored_key),
            STANDARD.encode(&self.server_key),
            self.account,
        )
    }

    /// Decodes a row in either form, returning the leading field (0 for account rows,
    /// token expiry otherwise) alongside the verifier.
    pub(crate) fn decode_row(raw: &str) -> Result<(u64, Self)> {
        let malformed = || Error::internal("malformed SCRAM verifier row");
        let mut parts = raw.splitn(7, ':');
        let first_field = parts.next().and_then(|p| p.parse().ok()).ok_or_else(malformed)?;
        let version = parts
            .next()
            .and_then(ScramVersion::from_hash_name)
            .ok_or_else(malformed)?;
        let iterations = parts.next().and_then(|p| p.parse().ok()).ok_or_else(malformed)?;
        let salt = parts
            .next()
            .and_then(|p| STANDARD.decode(p).ok())
            .ok_or_else(malformed)?;
        let stored_key = parts
            .next()
            .and_then(|p| STANDARD.decode(p).ok())
            .ok_or_else(malformed)?;
        let server_key = parts
            .next()
            .and_then(|p| STANDARD.decode(p).ok())
            .ok_or_else(malformed)?;
        let account = parts.next().ok_or_else(malformed)?.to_string();
        Ok((
            first_field,
            Self {
                version,
                iterations,
                salt,
                stored_key,
                server_key,
                account,
            },
        ))
    }
}

/// The parsed `client-first-message`: enough to pick a verifier and start the
/// exchange.
#[derive(Clone, Debug)]
pub(crate) struct ClientFirst {
    gs2_header: String,
    bare: String,
    pub(crate) username: String,
    pub(crate) authzid: Option<String>,
    client_nonce: String,
}

impl ClientFirst {
    pub(crate) fn parse(message: &str) -> Result<Self> {
        let malformed = || Error::invalid_authentication_payload("SCRAM");

        // gs2-cbind-flag "," [authzid] "," client-first-message-bare
        let mut rest = message;
        let flag_end = rest.find(',').ok_or_else(malformed)?;
        let flag = &rest[..flag_end];
        match flag {
            "n" | "y" => {}
            _ => {
                // Channel binding ("p=...") is not offered.
                return Err(Error::authentication_error(
                    "SCRAM",
                    "channel binding not supported",
                ));
            }
        }
        rest = &rest[flag_end + 1..];
        let authzid_end = rest.find(',').ok_or_else(malformed)?;
        let authzid = match &rest[..authzid_end] {
            "" => None,
            raw => Some(unescape_username(parse_kvp(raw, AUTHZID_KEY)?)?),
        };
        let gs2_header = &message[..flag_end + 1 + authzid_end + 1];
        let bare = &rest[authzid_end + 1..];

        let mut attrs = bare.split(',');
        let username = unescape_username(parse_kvp(attrs.next().ok_or_else(malformed)?, USERNAME_KEY)?)?;
        let client_nonce = parse_kvp(attrs.next().ok_or_else(malformed)?, NONCE_KEY)?.to_string();
        if username.is_empty() || client_nonce.is_empty() {
            return Err(malformed());
        }

        Ok(Self {
            gs2_header: gs2_header.to_string(),
            bare: bare.to_string(),
            username,
            authzid,
            client_nonce,
        })
    }
}

/// Server state between the two SCRAM round trips.
#[derive(Clone, Debug)]
pub(crate) struct ServerExchange {
    verifier: ScramVerifier,
    client_first: ClientFirst,
    server_first: String,
    combined_nonce: String,
}

impl ServerExchange {
    /// Starts the exchange: generates the server nonce and builds the
    /// `server-first-message`.
    pub(crate) fn start(client_first: ClientFirst, verifier: ScramVerifier) -> Result<(Self, String)> {
        let mut nonce = [0u8; SERVER_NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        Self::start_with_nonce(client_first, verifier, &STANDARD.encode(nonce))
    }

    pub(crate) fn start_with_nonce(
        client_first: ClientFirst,
        verifier: ScramVerifier,
        server_nonce: &str,
    ) -> Result<(Self, String)> {
        let combined_nonce = format!("{}{}", client_first.client_nonce, server_nonce);
        let server_first = format!(
            "{}={},{}={},{}={}",
            NONCE_KEY,
            combined_nonce,
            SALT_KEY,
            STANDARD.encode(&verifier.salt),
            ITERATION_COUNT_KEY,
            verifier.iterations,
        );
        let exchange = Self {
            verifier,
            client_first,
            server_first: server_first.clone(),
            combined_nonce,
        };
        Ok((exchange, server_first))
    }

    /// The account this exchange will authenticate on success.
    pub(crate) fn account(&self) -> &str {
        &self.verifier.account
    }

    /// Verifies the `client-final-message` and, on success, returns the
    /// `server-final-message` carrying the server signature.
    pub(crate) fn finish(&self, client_final: &str) -> Result<String> {
        let malformed = || Error::invalid_authentication_payload("SCRAM");

        let proof_marker = format!(",{}=", PROOF_KEY);
        let without_proof = client_final
            .rfind(&proof_marker)
            .map(|idx| &client_final[..idx])
            .ok_or_else(malformed)?;
        let proof_b64 = &client_final[without_proof.len() + 3..];

        let mut attrs = without_proof.split(',');
        let channel_binding = parse_kvp(attrs.next().ok_or_else(malformed)?, CHANNEL_BINDING_KEY)?;
        let nonce = parse_kvp(attrs.next().ok_or_else(malformed)?, NONCE_KEY)?;

        let expected_binding = STANDARD.encode(&self.client_first.gs2_header);
        if channel_binding != expected_binding {
            return Err(Error::authentication_error(
                "SCRAM",
                "mismatched channel binding data",
            ));
        }
        if nonce != self.combined_nonce {
            return Err(Error::authentication_error("SCRAM", "mismatched nonce"));
        }

        let auth_message = format!(
            "{},{},{}",
            self.client_first.bare, self.server_first, without_proof
        );

        let proof = STANDARD.decode(proof_b64).map_err(|_| malformed())?;
        let client_signature = self
            .verifier
            .version
            .hmac(&self.verifier.stored_key, auth_message.as_bytes())?;
        let client_key = xor(&proof, &client_signature)?;
        let recovered_stored_key = self.verifier.version.h(&client_key);
        if !bool::from(recovered_stored_key.ct_eq(&self.verifier.stored_key)) {
            return Err(Error::authentication_error("SCRAM", "invalid proof"));
        }

        let server_signature = self
            .verifier
            .version
            .hmac(&self.verifier.server_key, auth_message.as_bytes())?;
        Ok(format!(
            "{}={}",
            VERIFIER_KEY,
            STANDARD.encode(server_signature)
        ))
    }
}
