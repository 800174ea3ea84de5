//! Algorithm-agile password hashing and verification.
//!
//! Stored hashes are discriminated by their leading marker. New hashes are always
//! produced in the primary shape; everything else is verify-only, and
//! [`needs_rehash`] drives lazy migration on the next successful verify.
//!
//! Supported shapes:
//!
//! - `$pbkdf2-sha256$i=<iters>$<b64-salt>$<b64-hash>` (primary)
//! - `$pbkdf2-sha512$i=<iters>$<b64-salt>$<b64-hash>`
//! - `$2a$` / `$2b$` / `$2y$` bcrypt
//! - `$argon2id$…` reserved; verification is refused with a typed error
//! - `$<8-hex-seed>$<md5-hex>` legacy seeded MD5
//! - bare 32-hex plain MD5

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use hmac::Hmac;
use md5::{Digest, Md5};
use rand::RngCore;
use serde_json::{json, Value};
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

/// Iteration count for newly produced hashes.
pub(crate) const DEFAULT_ITERATIONS: u32 = 100_000;
/// Rows below this iteration count are migrated on next verify.
const MIN_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

const PBKDF2_SHA256_PREFIX: &str = "$pbkdf2-sha256$";
const PBKDF2_SHA512_PREFIX: &str = "$pbkdf2-sha512$";

/// Hashes a password in the primary shape.
pub fn hash(password: &str) -> Result<String> {
    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut salt);
    let mut out = [0u8; HASH_LEN];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(password.as_bytes(), &salt, DEFAULT_ITERATIONS, &mut out)
        .map_err(|_| Error::internal("PBKDF2 output length"))?;
    Ok(format!(
        "{}i={}${}${}",
        PBKDF2_SHA256_PREFIX,
        DEFAULT_ITERATIONS,
        STANDARD_NO_PAD.encode(salt),
        STANDARD_NO_PAD.encode(out)
    ))
}

/// Verifies a password against a stored hash, dispatching on its marker. All byte
/// comparisons are constant-time.
pub fn verify(password: &str, stored: &str) -> Result<bool> {
    if let Some(rest) = stored.strip_prefix(PBKDF2_SHA256_PREFIX) {
        return verify_pbkdf2(Pbkdf2Digest::Sha256, password, rest);
    }
    if let Some(rest) = stored.strip_prefix(PBKDF2_SHA512_PREFIX) {
        return verify_pbkdf2(Pbkdf2Digest::Sha512, password, rest);
    }
    if stored.starts_with("$2a$") || stored.starts_with("$2b$") || stored.starts_with("$2y$") {
        return bcrypt::verify(password, stored)
            .map_err(|e| Error::internal(format!("bcrypt verify: {}", e)));
    }
    if stored.starts_with("$argon2id$") {
        return Err(Error::invalid_argument(
            "argon2id verification is not supported",
        ));
    }
    if let Some((seed, digest)) = parse_seeded_md5(stored) {
        let computed = hex::encode(Md5::digest(format!("{}{}", seed, password)));
        return Ok(ct_str_eq(&computed, digest));
    }
    if stored.len() == 32 && stored.bytes().all(|b| b.is_ascii_hexdigit()) {
        let computed = hex::encode(Md5::digest(password));
        return Ok(ct_str_eq(&computed, stored));
    }
    Err(Error::invalid_argument("unrecognized password hash format"))
}

/// Whether a stored hash should be upgraded on the next successful verify: any
/// non-primary algorithm, or a primary row below the iteration floor.
pub fn needs_rehash(stored: &str) -> bool {
    match stored.strip_prefix(PBKDF2_SHA256_PREFIX) {
        Some(rest) => match parse_pbkdf2_fields(rest) {
            Ok((iterations, _, _)) => iterations < MIN_ITERATIONS,
            Err(_) => true,
        },
        None => true,
    }
}

/// Produces the credential-import pair the IdP expects: a credential-data document
/// (algorithm and parameters) and a secret-data document (salt and value), separated
/// the way the admin API's `credentials` representation wants them.
pub fn export_for_idp(stored: &str) -> Result<(Value, Value)> {
    let (algorithm, rest) = if let Some(rest) = stored.strip_prefix(PBKDF2_SHA256_PREFIX) {
        ("pbkdf2-sha256", rest)
    } else if let Some(rest) = stored.strip_prefix(PBKDF2_SHA512_PREFIX) {
        ("pbkdf2-sha512", rest)
    } else {
        return Err(Error::invalid_argument(
            "only PBKDF2 hashes can be exported for credential import",
        ));
    };
    let (iterations, salt, digest) = parse_pbkdf2_fields(rest)?;
    let credential_data = json!({
        "algorithm": algorithm,
        "hashIterations": iterations,
    });
    let secret_data = json!({
        "salt": base64::engine::general_purpose::STANDARD.encode(&salt),
        "value": base64::engine::general_purpose::STANDARD.encode(&digest),
    });
    Ok((credential_data, secret_data))
}

/// [`hash`] on the blocking pool; PBKDF2 at the configured iteration count takes long
/// enough to stall the reactor.
pub async fn hash_async(password: String) -> Result<String> {
    tokio::task::spawn_blocking(move || hash(&password))
        .await
        .map_err(|_| Error::internal("hashing task aborted"))?
}

/// [`verify`] on the blocking pool.
pub async fn verify_async(password: String, stored: String) -> Result<bool> {
    tokio::task::spawn_blocking(move || verify(&password, &stored))
        .await
        .map_err(|_| Error::internal("verification task aborted"))?
}

fn ct_str_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

fn parse_pbkdf2_fields(rest: &str) -> Result<(u32, Vec<u8>, Vec<u8>)> {
    let malformed = || Error::invalid_argument("malformed PBKDF2 hash row");
    let mut parts = rest.split('$');
    let iterations = parts
        .next()
        .and_then(|p| p.strip_prefix("i="))
        .and_then(|p| p.parse().ok())
        .ok_or_else(malformed)?;
    let salt = parts
        .next()
        .and_then(|p| STANDARD_NO_PAD.decode(p).ok())
        .ok_or_else(malformed)?;
    let digest = parts
        .next()
        .and_then(|p| STANDARD_NO_PAD.decode(p).ok())
        .ok_or_else(malformed)?;
    if parts.next().is_some() {
        return Err(malformed());
    }
    Ok((iterations, salt, digest))
}

#[derive(Clone, Copy)]
enum Pbkdf2Digest {
    Sha256,
    Sha512,
}

fn verify_pbkdf2(digest: Pbkdf2Digest, password: &str, rest: &str) -> Result<bool> {
    let (iterations, salt, expected) = parse_pbkdf2_fields(rest)?;
    let mut out = vec![0u8; expected.len()];
    match digest {
        Pbkdf2Digest::Sha256 => {
            pbkdf2::pbkdf2::<Hmac<Sha256>>(password.as_bytes(), &salt, iterations, &mut out)
        }
        Pbkdf2Digest::Sha512 => {
            pbkdf2::pbkdf2::<Hmac<Sha512>>(password.as_bytes(), &salt, iterations, &mut out)
        }
    }
    .map_err(|_| Error::internal("PBKDF2 output length"))?;
    Ok(bool::from(out.ct_eq(&expected)))
}

/// Parses `$<8-hex>$<32-hex>` into `(seed, digest)`.
fn parse_seeded_md5(stored: &str) -> Option<(&str, &str)> {
    let rest = stored.strip_prefix('$')?;
    let (seed, digest) = rest.split_once('$')?;
    let is_hex = |s: &str| s.bytes().all(|b| b.is_ascii_hexdigit());
    (seed.len() == 8 && digest.len() == 32 && is_hex(seed) && is_hex(digest))
        .then_some((seed, digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_hash_roundtrip() {
        let stored = hash("p@ssw0rd").unwrap();
        assert!(stored.starts_with(PBKDF2_SHA256_PREFIX));
        assert!(verify("p@ssw0rd", &stored).unwrap());
        assert!(!verify("password", &stored).unwrap());
        assert!(!needs_rehash(&stored));
    }

    #[test]
    fn low_iteration_row_needs_rehash() {
        let stored = format!(
            "{}i=1000${}${}",
            PBKDF2_SHA256_PREFIX,
            STANDARD_NO_PAD.encode(b"0123456789abcdef"),
            STANDARD_NO_PAD.encode([0u8; 32])
        );
        assert!(needs_rehash(&stored));
    }

    #[test]
    fn legacy_md5_verifies_and_migrates() {
        let stored = hex::encode(Md5::digest("hunter2"));
        assert!(verify("hunter2", &stored).unwrap());
        assert!(!verify("hunter3", &stored).unwrap());
        assert!(needs_rehash(&stored));
    }

    #[test]
    fn seeded_md5_verifies() {
        let seed = "a1b2c3d4";
        let stored = format!("${}${}", seed, hex::encode(Md5::digest(format!("{}{}", seed, "pw"))));
        assert!(verify("pw", &stored).unwrap());
        assert!(!verify("pw2", &stored).unwrap());
        assert!(needs_rehash(&stored));
    }

    #[test]
    fn bcrypt_verifies() {
        let stored = bcrypt::hash("secret", 4).unwrap();
        assert!(verify("secret", &stored).unwrap());
        assert!(!verify("public", &stored).unwrap());
        assert!(needs_rehash(&stored));
    }

    #[test]
    fn argon2id_is_refused() {
        assert!(verify("x", "$argon2id$v=19$m=65536,t=3,p=4$c2FsdA$aGFzaA").is_err());
    }

    #[test]
    fn unknown_format_is_an_error() {
        assert!(verify("x", "not-a-hash").is_err());
    }

    #[test]
    fn export_for_idp_shape() {
        let stored = hash("p@ssw0rd").unwrap();
        let (credential_data, secret_data) = export_for_idp(&stored).unwrap();
        assert_eq!(credential_data["algorithm"], "pbkdf2-sha256");
        assert_eq!(credential_data["hashIterations"], DEFAULT_ITERATIONS);
        assert!(secret_data["salt"].is_string());
        assert!(secret_data["value"].is_string());

        assert!(export_for_idp("32ed87bdb5fdc5e9cba88547376818d4").is_err());
    }

    #[tokio::test]
    async fn async_wrappers() {
        let stored = hash_async("p@ssw0rd".to_string()).await.unwrap();
        assert!(verify_async("p@ssw0rd".to_string(), stored).await.unwrap());
    }
}
