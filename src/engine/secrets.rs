// Lorekeep Runtime — Secret Store & Credential Cache
//
// Credentials (provider API keys, OAuth token blobs) are encrypted through
// the host SecretStore capability and written under the runtime data
// directory. Reads are cached in-memory per provider id; writes invalidate
// the entry. When the store reports unavailable, persistence is refused —
// credentials live only in process memory for that session. Corrupt blobs
// are deleted on read so a damaged file cannot wedge the provider forever.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::SecretStore;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use zeroize::Zeroizing;

const KEYRING_SERVICE: &str = "lorekeep-credentials";
const KEYRING_USER: &str = "lorekeep-master";

// ── Keyring-backed store ───────────────────────────────────────────────────

/// SecretStore backed by the OS keychain. A random master key is created on
/// first use; blobs are XOR-whitened with a SHA-256 keystream of that key.
/// The keychain is the actual protection boundary — the blob format only
/// has to be stable and self-checking.
pub struct KeyringSecretStore;

impl KeyringSecretStore {
    fn master_key(&self) -> Result<Zeroizing<Vec<u8>>, String> {
        let entry = keyring::Entry::new(KEYRING_SERVICE, KEYRING_USER)
            .map_err(|e| format!("keyring entry: {e}"))?;
        match entry.get_password() {
            Ok(hex) => {
                let bytes = decode_hex(&hex).ok_or("stored master key is not hex")?;
                Ok(Zeroizing::new(bytes))
            }
            Err(keyring::Error::NoEntry) => {
                let mut key = [0u8; 32];
                getrandom::getrandom(&mut key).map_err(|e| format!("getrandom: {e}"))?;
                entry
                    .set_password(&encode_hex(&key))
                    .map_err(|e| format!("keyring set: {e}"))?;
                info!("[secrets] Created new master key in OS keychain");
                Ok(Zeroizing::new(key.to_vec()))
            }
            Err(e) => Err(format!("keyring get: {e}")),
        }
    }

    fn keystream(key: &[u8], len: usize) -> Vec<u8> {
        use sha2::{Digest, Sha256};
        let mut out = Vec::with_capacity(len);
        let mut counter = 0u64;
        while out.len() < len {
            let mut hasher = Sha256::new();
            hasher.update(key);
            hasher.update(counter.to_le_bytes());
            out.extend_from_slice(&hasher.finalize());
            counter += 1;
        }
        out.truncate(len);
        out
    }
}

impl SecretStore for KeyringSecretStore {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, String> {
        let key = self.master_key()?;
        let stream = Self::keystream(&key, plaintext.len());
        let mut out: Vec<u8> = plaintext
            .iter()
            .zip(stream.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        // Integrity tag so decrypt can detect corruption.
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(&key[..]);
        hasher.update(plaintext);
        out.extend_from_slice(&hasher.finalize()[..8]);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, String> {
        if ciphertext.len() < 8 {
            return Err("ciphertext too short".into());
        }
        let key = self.master_key()?;
        let (body, tag) = ciphertext.split_at(ciphertext.len() - 8);
        let stream = Self::keystream(&key, body.len());
        let plaintext: Vec<u8> = body.iter().zip(stream.iter()).map(|(a, b)| a ^ b).collect();
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(&key[..]);
        hasher.update(&plaintext);
        if &hasher.finalize()[..8] != tag {
            return Err("integrity check failed".into());
        }
        Ok(plaintext)
    }

    fn is_available(&self) -> bool {
        keyring::Entry::new(KEYRING_SERVICE, KEYRING_USER).is_ok()
    }
}

// ── In-memory store (tests, headless CI) ───────────────────────────────────

/// Identity "encryption" with an availability switch. Tests flip
/// `available` to exercise the refuse-to-persist path.
pub struct MemorySecretStore {
    pub available: bool,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        MemorySecretStore { available: true }
    }
}

impl Default for MemorySecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore for MemorySecretStore {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, String> {
        let mut out = b"mem:".to_vec();
        out.extend_from_slice(plaintext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, String> {
        ciphertext
            .strip_prefix(b"mem:")
            .map(|rest| rest.to_vec())
            .ok_or_else(|| "corrupt blob".into())
    }

    fn is_available(&self) -> bool {
        self.available
    }
}

// ── Credential cache ───────────────────────────────────────────────────────

/// Encrypted credential files keyed by provider id, with an in-memory
/// read cache. Writes invalidate the cache entry.
pub struct CredentialCache {
    store: Arc<dyn SecretStore>,
    dir: PathBuf,
    cache: Mutex<HashMap<String, Zeroizing<String>>>,
}

impl CredentialCache {
    pub fn new(store: Arc<dyn SecretStore>, dir: PathBuf) -> Self {
        CredentialCache { store, dir, cache: Mutex::new(HashMap::new()) }
    }

    fn path_for(&self, provider: &str) -> PathBuf {
        // Provider ids are caller-controlled; keep the filename tame.
        let safe: String = provider
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.cred"))
    }

    /// Persist a credential. Refused when the secret store is unavailable.
    pub fn put(&self, provider: &str, secret: &str) -> EngineResult<()> {
        if !self.store.is_available() {
            return Err(EngineError::Keyring(
                "secret store unavailable — refusing to persist credential".into(),
            ));
        }
        let encrypted = self
            .store
            .encrypt(secret.as_bytes())
            .map_err(EngineError::Keyring)?;
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.path_for(provider), encrypted)?;
        self.cache.lock().remove(provider);
        Ok(())
    }

    /// Read a credential, consulting the cache first. A blob that fails to
    /// decrypt is deleted and reported as absent.
    pub fn get(&self, provider: &str) -> EngineResult<Option<String>> {
        if let Some(hit) = self.cache.lock().get(provider) {
            return Ok(Some(hit.to_string()));
        }
        let path = self.path_for(provider);
        let encrypted = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match self.store.decrypt(&encrypted) {
            Ok(plaintext) => {
                let secret = String::from_utf8(plaintext)
                    .map_err(|_| EngineError::Keyring("credential is not UTF-8".into()))?;
                self.cache
                    .lock()
                    .insert(provider.to_string(), Zeroizing::new(secret.clone()));
                Ok(Some(secret))
            }
            Err(e) => {
                warn!("[secrets] Corrupt credential for '{}' — deleting: {}", provider, e);
                std::fs::remove_file(&path).ok();
                Ok(None)
            }
        }
    }

    pub fn delete(&self, provider: &str) -> EngineResult<()> {
        self.cache.lock().remove(provider);
        match std::fs::remove_file(self.path_for(provider)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ── Hex helpers ────────────────────────────────────────────────────────────

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
