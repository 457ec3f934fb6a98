use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::core::error::{DecryptionError, StoreError, VaultError};
use crate::core::store::CredentialStore;
use crate::platform::{NativePlatform, Platform};

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// A 256-bit AES-GCM key.
#[derive(Clone, PartialEq, Eq)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    pub fn generate() -> Self {
        Key(rand::random())
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; KEY_LEN] = bytes.try_into().ok()?;
        Some(Key(arr))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(&self.0.into())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Key(..)")
    }
}

/// base64(nonce || ciphertext || tag), safe to store as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope(String);

impl Envelope {
    pub fn from_stored(text: impl Into<String>) -> Self {
        Envelope(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    Loaded,
    Created,
}

/// Read the key at `path`, generating and persisting a new one if the file
/// does not exist yet.
pub fn load_or_create_key(path: &Path) -> Result<(Key, KeyOrigin), VaultError> {
    match std::fs::read(path) {
        Ok(bytes) => Key::from_bytes(&bytes)
            .map(|key| (key, KeyOrigin::Loaded))
            .ok_or_else(|| VaultError::InvalidKey(path.display().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let key = Key::generate();
            write_key_file(path, &key, true)?;
            info!("Generated new encryption key at {}", path.display());
            Ok((key, KeyOrigin::Created))
        }
        Err(e) => Err(io_error(path, e)),
    }
}

fn write_key_file(path: &Path, key: &Key, create_new: bool) -> Result<(), VaultError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true);
    if create_new {
        // Never clobber a key another process wrote in the meantime.
        options.create_new(true);
    } else {
        options.create(true).truncate(true);
    }

    let mut file = options.open(path).map_err(|e| io_error(path, e))?;
    file.write_all(&key.0).map_err(|e| io_error(path, e))?;
    file.sync_all().map_err(|e| io_error(path, e))?;
    NativePlatform::restrict_file_permissions(path);
    Ok(())
}

fn io_error(path: &Path, source: std::io::Error) -> VaultError {
    VaultError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Encrypt with a fresh random nonce.
pub fn encrypt(plaintext: &[u8], key: &Key) -> Result<Envelope, VaultError> {
    let nonce_bytes: [u8; NONCE_LEN] = rand::random();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = key
        .cipher()
        .encrypt(nonce, plaintext)
        .map_err(|_| VaultError::Encrypt)?;

    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);

    Ok(Envelope(
        base64::engine::general_purpose::STANDARD.encode(&combined),
    ))
}

/// Verify and decrypt an envelope produced by [`encrypt`].
pub fn decrypt(envelope: &Envelope, key: &Key) -> Result<Vec<u8>, DecryptionError> {
    let combined = base64::engine::general_purpose::STANDARD
        .decode(envelope.as_str())
        .map_err(|e| DecryptionError::Malformed(format!("base64: {}", e)))?;

    if combined.len() < NONCE_LEN + TAG_LEN {
        return Err(DecryptionError::Malformed(format!(
            "envelope is {} bytes, need at least {}",
            combined.len(),
            NONCE_LEN + TAG_LEN
        )));
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    key.cipher()
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| DecryptionError::Verification)
}

/// Owns the key file. The key is read (or created) on first use and cached
/// for the lifetime of the vault.
pub struct CipherVault {
    key_path: PathBuf,
    key: OnceLock<Key>,
}

impl CipherVault {
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
            key: OnceLock::new(),
        }
    }

    pub fn with_key(key_path: impl Into<PathBuf>, key: Key) -> Self {
        Self {
            key_path: key_path.into(),
            key: OnceLock::from(key),
        }
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn key_present(&self) -> bool {
        self.key.get().is_some() || self.key_path.exists()
    }

    pub fn key(&self) -> Result<&Key, VaultError> {
        if let Some(key) = self.key.get() {
            return Ok(key);
        }
        let (key, _) = load_or_create_key(&self.key_path)?;
        Ok(self.key.get_or_init(|| key))
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Envelope, VaultError> {
        encrypt(plaintext, self.key()?)
    }

    pub fn open(&self, envelope: &Envelope) -> Result<Result<Vec<u8>, DecryptionError>, VaultError> {
        Ok(decrypt(envelope, self.key()?))
    }

    /// Replace the key and re-encrypt every stored credential with it.
    ///
    /// The new key is staged next to the current one, records are rewritten
    /// in a single transaction, and only then is the key file swapped. The
    /// previous key is kept as `<key>.prev`. Records that no longer decrypt
    /// with the current key are cleared so the account re-authenticates.
    pub async fn rotate(&mut self, store: &CredentialStore) -> Result<usize, RotateError> {
        let old = self.key()?.clone();
        let new = Key::generate();

        let staged = sibling(&self.key_path, "next");
        write_key_file(&staged, &new, false)?;

        let rewritten = store
            .reencrypt_all(|email, stored| {
                match decrypt(&Envelope::from_stored(stored), &old) {
                    Ok(plaintext) => encrypt(&plaintext, &new)
                        .map(|env| Some(env.into_string()))
                        .map_err(|e| e.to_string()),
                    Err(e) => {
                        warn!(account = %email, "Dropping undecryptable credential during rotation: {}", e);
                        Ok(None)
                    }
                }
            })
            .await;

        let rewritten = match rewritten {
            Ok(n) => n,
            Err(e) => {
                let _ = std::fs::remove_file(&staged);
                return Err(e.into());
            }
        };

        let previous = self.swap_in_staged(&staged)?;

        self.key = OnceLock::from(new);
        info!(
            "Rotated encryption key, re-encrypted {} credential(s); previous key kept at {}",
            rewritten,
            previous.display()
        );
        Ok(rewritten)
    }

    /// Current key becomes `<key>.prev`, the staged key becomes current.
    fn swap_in_staged(&self, staged: &Path) -> Result<PathBuf, VaultError> {
        let previous = sibling(&self.key_path, "prev");
        if self.key_path.exists() {
            std::fs::rename(&self.key_path, &previous)
                .map_err(|e| io_error(&self.key_path, e))?;
        }
        std::fs::rename(staged, &self.key_path).map_err(|e| io_error(staged, e))?;
        Ok(previous)
    }

    /// Settle a rotation that stopped before its key swap. If any stored
    /// credential opens under the staged `<key>.next`, the re-encryption was
    /// committed and the swap is finished; otherwise the staged key is
    /// discarded. Only safe while holding the data directory lock and before
    /// the key is first used.
    pub async fn recover_rotation(
        &self,
        store: &CredentialStore,
    ) -> Result<Option<RotationRecovery>, RotateError> {
        let staged = sibling(&self.key_path, "next");
        let bytes = match std::fs::read(&staged) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&staged, e).into()),
        };

        let committed = match Key::from_bytes(&bytes) {
            None => false,
            Some(_) if !self.key_path.exists() => true,
            Some(staged_key) => store.list_all().await?.iter().any(|record| {
                record.has_credential()
                    && decrypt(
                        &Envelope::from_stored(record.encrypted_credential.as_str()),
                        &staged_key,
                    )
                    .is_ok()
            }),
        };

        if committed {
            self.swap_in_staged(&staged)?;
            warn!(
                "Finished an interrupted key rotation; {} is the active key",
                self.key_path.display()
            );
            Ok(Some(RotationRecovery::Completed))
        } else {
            std::fs::remove_file(&staged).map_err(|e| io_error(&staged, e))?;
            warn!(
                "Discarded staged key {} from a rotation that never committed",
                staged.display()
            );
            Ok(Some(RotationRecovery::Discarded))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationRecovery {
    Completed,
    Discarded,
}

#[derive(Debug, thiserror::Error)]
pub enum RotateError {
    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
