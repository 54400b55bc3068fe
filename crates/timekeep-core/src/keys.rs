//! Key store: keyfile parsing, keyed-hash packet authentication, and key
//! generation.
//!
//! Grounded on `keys.c`'s `KEY_Initialise`/`lookup_key`/`KEY_GenerateAuthToken`/
//! `KEY_CheckAuthToken`/`generate_key`. The original's `bsearch` over a
//! sorted array plus a one-entry "last looked up" cache becomes a sorted
//! `Vec` with the same cache field; the original's silent
//! first-match-wins on a duplicate identifier becomes a hard rejection
//! (see the resolved duplicate-identifier question), since silently
//! shadowing a key is a worse failure mode for a from-scratch store with
//! no legacy keyfiles to stay compatible with.

use std::fmt;
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use hmac::{Hmac, Mac};
use md5::Md5;
use rand::RngCore;
use sha1::Sha1;
use subtle::ConstantTimeEq;

use crate::error::DaemonError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
}

impl HashAlgorithm {
    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "MD5" => Some(Self::Md5),
            "SHA1" => Some(Self::Sha1),
            _ => None,
        }
    }

    /// Computes a keyed hash of `data`, truncated/padded to `out_len` bytes
    /// as the wire format calls for.
    fn keyed_hash(self, secret: &[u8], data: &[u8], out_len: usize) -> Vec<u8> {
        let full = match self {
            Self::Md5 => {
                let mut mac = Hmac::<Md5>::new_from_slice(secret).expect("HMAC accepts any key length");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            Self::Sha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(secret).expect("HMAC accepts any key length");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        };
        full.into_iter().take(out_len).collect()
    }
}

pub struct Key {
    pub id: u32,
    pub hash_algorithm: HashAlgorithm,
    secret: Vec<u8>,
    /// Microseconds of one-way auth delay this key's hash is expected to
    /// add, per `determine_hash_delay`; used to size the NTS/NTP
    /// retransmission window. `None` until measured.
    pub auth_delay_us: Option<u64>,
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("id", &self.id)
            .field("hash_algorithm", &self.hash_algorithm)
            .field("secret", &"<redacted>")
            .field("auth_delay_us", &self.auth_delay_us)
            .finish()
    }
}

pub struct KeyStore {
    keys: Vec<Key>,
    last_lookup: Option<usize>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self {
            keys: Vec::new(),
            last_lookup: None,
        }
    }

    /// Parses a keyfile: one `id algorithm password` line per key, `#`
    /// comments and blank lines skipped. `password` is either `ASCII:...`
    /// (the literal bytes that follow) or a bare hex string. Duplicate
    /// identifiers are rejected with a logged warning rather than silently
    /// shadowed, then the survivors are sorted by id for binary search.
    pub fn load_file(path: &Path) -> Result<Self, DaemonError> {
        let text = std::fs::read_to_string(path).map_err(DaemonError::Kernel)?;
        let mut store = Self::new();

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let id: u32 = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| DaemonError::Config {
                    line: lineno + 1,
                    msg: "missing or malformed key id".into(),
                })?;
            let algo_field = fields.next().ok_or_else(|| DaemonError::Config {
                line: lineno + 1,
                msg: "missing hash algorithm".into(),
            })?;
            let algorithm = HashAlgorithm::parse(algo_field).ok_or_else(|| DaemonError::Config {
                line: lineno + 1,
                msg: format!("unknown hash algorithm {algo_field}"),
            })?;
            let password_field = fields.next().ok_or_else(|| DaemonError::Config {
                line: lineno + 1,
                msg: "missing password".into(),
            })?;
            let secret = decode_password(password_field).ok_or_else(|| DaemonError::Config {
                line: lineno + 1,
                msg: "malformed password encoding".into(),
            })?;

            if store.keys.iter().any(|k| k.id == id) {
                tracing::warn!(id, line = lineno + 1, "rejecting duplicate key identifier");
                continue;
            }

            store.keys.push(Key {
                id,
                hash_algorithm: algorithm,
                secret,
                auth_delay_us: None,
            });
        }

        store.keys.sort_by_key(|k| k.id);
        Ok(store)
    }

    fn find(&mut self, id: u32) -> Option<usize> {
        if let Some(idx) = self.last_lookup {
            if self.keys.get(idx).map(|k| k.id) == Some(id) {
                return Some(idx);
            }
        }
        let idx = self.keys.binary_search_by_key(&id, |k| k.id).ok()?;
        self.last_lookup = Some(idx);
        Some(idx)
    }

    pub fn contains(&mut self, id: u32) -> bool {
        self.find(id).is_some()
    }

    /// Produces the authentication token (keyed hash) for `data` under
    /// key `id`, truncated to `out_len` bytes.
    pub fn generate(&mut self, id: u32, data: &[u8], out_len: usize) -> Option<Vec<u8>> {
        let idx = self.find(id)?;
        let key = &self.keys[idx];
        Some(key.hash_algorithm.keyed_hash(&key.secret, data, out_len))
    }

    /// Verifies `token` against `data` under key `id` in constant time.
    pub fn verify(&mut self, id: u32, data: &[u8], token: &[u8]) -> bool {
        let Some(idx) = self.find(id) else {
            return false;
        };
        let key = &self.keys[idx];
        let expected = key.hash_algorithm.keyed_hash(&key.secret, data, token.len());
        if expected.len() != token.len() {
            return false;
        }
        expected.ct_eq(token).into()
    }

    /// Measures the one-way hashing delay for `id` by timing
    /// `determine_hash_delay`'s repeated-hash probe and caches it on the
    /// key; see `determine_hash_delay` for the method.
    pub fn measure_auth_delay(&mut self, id: u32, out_len: usize) -> Option<u64> {
        let idx = self.find(id)?;
        let key = &self.keys[idx];
        let delay = determine_hash_delay(key.hash_algorithm, &key.secret, out_len);
        self.keys[idx].auth_delay_us = Some(delay);
        Some(delay)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_password(field: &str) -> Option<Vec<u8>> {
    if let Some(ascii) = field.strip_prefix("ASCII:") {
        return Some(ascii.as_bytes().to_vec());
    }
    if field.len() % 2 != 0 {
        return None;
    }
    (0..field.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&field[i..i + 2], 16).ok())
        .collect()
}

/// Hashes a fixed-size probe buffer ten times and takes the minimum
/// wall-clock cost, padded by 1/16th, as the key's expected one-way
/// authentication delay in microseconds.
fn determine_hash_delay(algorithm: HashAlgorithm, secret: &[u8], out_len: usize) -> u64 {
    const PROBE_LEN: usize = 256;
    let probe = [0u8; PROBE_LEN];
    let mut min_elapsed = std::time::Duration::MAX;
    for _ in 0..10 {
        let start = std::time::Instant::now();
        let _ = algorithm.keyed_hash(secret, &probe, out_len);
        min_elapsed = min_elapsed.min(start.elapsed());
    }
    let micros = min_elapsed.as_micros() as u64;
    micros + micros / 16
}

/// Generates a fresh key of `len` bytes (16 or 20, per the original's
/// MD5/SHA1 native digest sizes) and appends it to the keyfile at `path`
/// as `id SHA1 <hex>`, creating the file with owner-only permissions if
/// it doesn't already exist.
pub fn generate_key(path: &Path, id: u32, len: usize) -> Result<(), DaemonError> {
    let mut secret = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    let hex: String = secret.iter().map(|b| format!("{b:02x}")).collect();

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
        .map_err(DaemonError::Kernel)?;
    writeln!(file, "{id} SHA1 {hex}").map_err(DaemonError::Kernel)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tempfile_with(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_ascii_and_hex_secrets() {
        let f = tempfile_with("1 SHA1 ASCII:hunter2\n2 MD5 deadbeef\n");
        let store = KeyStore::load_file(f.path()).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn rejects_duplicate_identifiers() {
        let f = tempfile_with("5 SHA1 ASCII:first\n5 SHA1 ASCII:second\n");
        let store = KeyStore::load_file(f.path()).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn generate_and_verify_round_trip() {
        let f = tempfile_with("9 SHA1 ASCII:shared-secret\n");
        let mut store = KeyStore::load_file(f.path()).unwrap();
        let token = store.generate(9, b"packet body", 20).unwrap();
        assert!(store.verify(9, b"packet body", &token));
        assert!(!store.verify(9, b"tampered body", &token));
    }

    #[test]
    fn verify_fails_for_unknown_key() {
        let mut store = KeyStore::new();
        assert!(!store.verify(1, b"data", &[0u8; 20]));
    }

    #[test]
    fn malformed_line_is_reported_with_line_number() {
        let f = tempfile_with("1 SHA1 ASCII:ok\nnot-a-number SHA1 ASCII:bad\n");
        let err = KeyStore::load_file(f.path()).unwrap_err();
        match err {
            DaemonError::Config { line, .. } => assert_eq!(line, 2),
            other => panic!("expected Config error, got {other:?}"),
        }
    }
}
