//! The embedded KV layer backing every cache and every piece of account state the
//! authentication pipeline persists.
//!
//! Keys are ASCII with a colon-separated prefix convention (see [`keys`]). Values are
//! raw strings, JSON documents, or TTL-prefixed payloads of the form
//! `T<unix-expiry>:<payload>`. TTL handling is transparent: [`KvStore::get`] deletes and
//! misses on an expired row in the same logical operation.

pub mod accounts;
pub(crate) mod keys;

use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde_json::{json, Map, Value};

use crate::{
    error::{ErrorKind, Result},
    options::StoreOptions,
};

/// Seconds since the unix epoch.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Encodes a value with its TTL header.
fn encode_ttl(value: &[u8], expires_at: u64) -> Vec<u8> {
    let mut out = format!("T{}:", expires_at).into_bytes();
    out.extend_from_slice(value);
    out
}

/// Splits a stored value into `(expiry, payload)`. Values without a TTL header are
/// returned as `(None, value)`.
fn decode_ttl(raw: &[u8]) -> (Option<u64>, &[u8]) {
    if raw.first() != Some(&b'T') {
        return (None, raw);
    }
    let Some(colon) = raw.iter().position(|&b| b == b':') else {
        return (None, raw);
    };
    match std::str::from_utf8(&raw[1..colon]).ok().and_then(|s| s.parse().ok()) {
        Some(expiry) => (Some(expiry), &raw[colon + 1..]),
        None => (None, raw),
    }
}

/// A set of writes applied atomically. Used by the webhook receiver so that a run of
/// invalidations for a single event is one transaction.
#[derive(Default)]
pub struct WriteBatch {
    inner: sled::Batch,
}

impl WriteBatch {
    pub(crate) fn set(&mut self, key: &str, value: &[u8], ttl: Option<Duration>) {
        match ttl {
            Some(ttl) => self
                .inner
                .insert(key.as_bytes(), encode_ttl(value, unix_now() + ttl.as_secs())),
            None => self.inner.insert(key.as_bytes(), value),
        }
    }

    pub(crate) fn delete(&mut self, key: &str) {
        self.inner.remove(key.as_bytes());
    }
}

/// Single-process embedded store supplying all persistent state.
#[derive(Clone)]
pub struct KvStore {
    db: sled::Db,
    retention: usize,
}

impl KvStore {
    /// Opens (creating if necessary) the database at the configured path.
    pub fn open(options: &StoreOptions) -> Result<Self> {
        let db = sled::open(&options.path)?;
        Ok(Self {
            db,
            retention: options.snapshot_retention,
        })
    }

    /// Opens a throwaway in-memory store. Used by tests throughout the crate.
    #[cfg(test)]
    pub(crate) fn temporary() -> Self {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .expect("temporary store");
        Self { db, retention: 2 }
    }

    /// Fetches a value, honoring the TTL header. An expired row is deleted and reported
    /// as missing.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(raw) = self.db.get(key.as_bytes())? else {
            return Ok(None);
        };
        let (expiry, payload) = decode_ttl(&raw);
        if let Some(expiry) = expiry {
            if expiry <= unix_now() {
                self.db.remove(key.as_bytes())?;
                return Ok(None);
            }
        }
        Ok(Some(payload.to_vec()))
    }

    /// Fetches a value as UTF-8. Non-UTF-8 rows are reported as a store error.
    pub fn get_str(&self, key: &str) -> Result<Option<String>> {
        match self.get(key)? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| {
                    ErrorKind::Store {
                        message: format!("non-UTF-8 value under key {}", key),
                    }
                    .into()
                }),
            None => Ok(None),
        }
    }

    /// Stores a value, with a TTL header when `ttl` is given.
    pub fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        match ttl {
            Some(ttl) => self
                .db
                .insert(key.as_bytes(), encode_ttl(value, unix_now() + ttl.as_secs()))?,
            None => self.db.insert(key.as_bytes(), value)?,
        };
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.db.remove(key.as_bytes())?;
        Ok(())
    }

    /// Applies a batch of writes atomically.
    pub fn apply(&self, batch: WriteBatch) -> Result<()> {
        self.db.apply_batch(batch.inner)?;
        self.db.flush()?;
        Ok(())
    }

    /// Lexicographic scan over all live keys starting with `prefix`. The callback must
    /// not write back into the store; mutations discovered during iteration are
    /// accumulated and applied afterwards, which is also how expired rows encountered
    /// mid-scan are reaped.
    pub fn prefix_iterate<F>(&self, prefix: &str, mut f: F) -> Result<()>
    where
        F: FnMut(&str, &[u8]),
    {
        let now = unix_now();
        let mut expired = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, raw) = entry?;
            let Ok(key_str) = std::str::from_utf8(&key) else {
                continue;
            };
            let (expiry, payload) = decode_ttl(&raw);
            if expiry.is_some_and(|e| e <= now) {
                expired.push(key.to_vec());
                continue;
            }
            f(key_str, payload);
        }
        for key in expired {
            self.db.remove(key)?;
        }
        Ok(())
    }

    /// Atomically increments an integer row and returns the new value. Missing or
    /// unparsable rows count as zero.
    pub fn incr_counter(&self, key: &str) -> Result<u64> {
        let updated = self.db.update_and_fetch(key.as_bytes(), |old| {
            let current = old
                .and_then(|raw| std::str::from_utf8(raw).ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            Some(sled::IVec::from((current + 1).to_string().as_bytes()))
        })?;
        Ok(updated
            .as_deref()
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(1))
    }

    /// Reads an integer row, defaulting to zero.
    pub fn get_counter(&self, key: &str) -> Result<u64> {
        Ok(self
            .get(key)?
            .and_then(|raw| String::from_utf8(raw).ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0))
    }

    /// Produces a consistent point-in-time copy of the store under
    /// `<dest_dir>/snapshot-<unix-ts>` and trims old snapshots past the retention
    /// count. The copy is rebuilt through the store's export primitive, which also
    /// reclaims freed pages; `compact` is accepted for interface parity and forces an
    /// extra flush of the source first.
    pub fn snapshot(&self, dest_dir: &Path, compact: bool) -> Result<PathBuf> {
        if compact {
            self.db.flush()?;
        }
        let target = dest_dir.join(format!("snapshot-{}", unix_now()));
        std::fs::create_dir_all(&target)?;
        let copy = sled::open(&target)?;
        let export = self.db.export();
        copy.import(export);
        copy.flush()?;
        drop(copy);
        self.trim_snapshots(dest_dir)?;
        Ok(target)
    }

    fn trim_snapshots(&self, dest_dir: &Path) -> Result<()> {
        let mut dirs: Vec<PathBuf> = std::fs::read_dir(dest_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("snapshot-"))
            })
            .collect();
        dirs.sort();
        while dirs.len() > self.retention {
            let victim = dirs.remove(0);
            std::fs::remove_dir_all(victim)?;
        }
        Ok(())
    }

    /// Writes every live row to `dest` as a single JSON document, for debugging and
    /// cross-environment portability. Binary values are base64-wrapped.
    pub fn export_json(&self, dest: &Path) -> Result<()> {
        use base64::{engine::general_purpose::STANDARD, Engine};

        let now = unix_now();
        let mut doc = Map::new();
        for entry in self.db.iter() {
            let (key, raw) = entry?;
            let Ok(key_str) = std::str::from_utf8(&key) else {
                continue;
            };
            let (expiry, payload) = decode_ttl(&raw);
            if expiry.is_some_and(|e| e <= now) {
                continue;
            }
            let value = match std::str::from_utf8(payload) {
                Ok(text) => match serde_json::from_str::<Value>(text) {
                    Ok(parsed @ (Value::Object(_) | Value::Array(_))) => parsed,
                    _ => Value::String(text.to_string()),
                },
                Err(_) => json!({ "b64": STANDARD.encode(payload) }),
            };
            let value = match expiry {
                Some(e) => json!({ "expires": e, "value": value }),
                None => value,
            };
            doc.insert(key_str.to_string(), value);
        }
        let mut file = std::fs::File::create(dest)?;
        serde_json::to_writer_pretty(&mut file, &Value::Object(doc))?;
        Ok(())
    }

    /// Flushes all dirty pages to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Spawns the periodic snapshot task if a snapshot directory is configured. The
/// snapshot itself runs on the blocking pool; failures are logged and the task keeps
/// going.
pub fn spawn_snapshot_scheduler(
    store: KvStore,
    options: &StoreOptions,
) -> Option<tokio::task::JoinHandle<()>> {
    let dest = options.snapshot_dir.clone()?;
    let interval = options.snapshot_interval;
    Some(tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let store = store.clone();
            let dest = dest.clone();
            let result =
                tokio::task::spawn_blocking(move || store.snapshot(&dest, false)).await;
            match result {
                Ok(Ok(path)) => tracing::debug!(path = %path.display(), "snapshot written"),
                Ok(Err(err)) => tracing::warn!(error = %err, "scheduled snapshot failed"),
                Err(_) => {
                    tracing::warn!("snapshot task aborted");
                    return;
                }
            }
        }
    }))
}
