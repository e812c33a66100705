//! Encryption subsystem.
//!
//! - Keys: PBKDF2-HMAC-SHA256 (600,000 rounds) over the user's password and a
//!   per-sync-group salt, producing an AES-256-GCM key.
//! - Content: `nonce (12 bytes) || ciphertext+tag`, fresh random nonce per call.
//! - Filenames: encrypted path bytes, base64url without padding, `.enc` suffix.
//! - Hashes: SHA-256 of plaintext, lowercase hex. Independent of the password.
//!
//! Keys are owned by a [`KeyRing`] scoped to one profile; nothing here holds
//! global state.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

pub const PBKDF2_ROUNDS: u32 = 600_000;
pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
pub const ENCRYPTED_NAME_SUFFIX: &str = ".enc";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Decryption failed: wrong password or corrupted data")]
    Decryption,

    #[error("Encryption failed")]
    Encryption,

    #[error("Ciphertext too short: {0} bytes")]
    Truncated(usize),

    #[error("Invalid salt: {0}")]
    InvalidSalt(String),

    #[error("Invalid encrypted filename: {0}")]
    InvalidFilename(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Key-derivation salt shared by every replica of a sync group.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Salt([u8; SALT_LEN]);

impl Salt {
    /// Generate a fresh random salt.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SALT_LEN];
        rand::rng().fill(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; SALT_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidSalt(format!("expected {} bytes, got {}", SALT_LEN, bytes.len())))?;
        Ok(Self(bytes))
    }

    pub fn from_hex(value: &str) -> Result<Self> {
        let bytes = hex::decode(value).map_err(|e| CryptoError::InvalidSalt(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; SALT_LEN] {
        &self.0
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Salt").field(&self.to_hex()).finish()
    }
}

/// AES-256-GCM key derived from a password and salt.
pub struct EncryptionKey {
    key: Zeroizing<[u8; KEY_LEN]>,
    salt: Salt,
}

impl EncryptionKey {
    /// Salt this key was derived with.
    pub fn salt(&self) -> Salt {
        self.salt
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(self.key.as_slice().into())
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("key", &"<redacted>")
            .field("salt", &self.salt)
            .finish()
    }
}

/// Derive the sync key for `(password, salt)`. Deterministic.
pub fn derive_key(password: &str, salt: &Salt) -> EncryptionKey {
    derive_key_with_rounds(password, salt, PBKDF2_ROUNDS)
}

/// Same as [`derive_key`] with an explicit round count.
pub fn derive_key_with_rounds(password: &str, salt: &Salt, rounds: u32) -> EncryptionKey {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt.as_bytes(), rounds, key.as_mut_slice());
    EncryptionKey { key, salt: *salt }
}

/// Encrypt with a fresh random nonce; output is `nonce || ciphertext`.
pub fn encrypt_content(plaintext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill(&mut nonce);

    let ciphertext = key
        .cipher()
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`encrypt_content`]. Fails on wrong key or tampered data.
pub fn decrypt_content(data: &[u8], key: &EncryptionKey) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::Truncated(data.len()));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    key.cipher()
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decryption)
}

/// Non-identifying remote object name for a meta-path.
pub fn encrypt_filename(path: &str, key: &EncryptionKey) -> Result<String> {
    let encrypted = encrypt_content(path.as_bytes(), key)?;
    Ok(format!("{}{}", URL_SAFE_NO_PAD.encode(encrypted), ENCRYPTED_NAME_SUFFIX))
}

pub fn decrypt_filename(name: &str, key: &EncryptionKey) -> Result<String> {
    let encoded = name
        .strip_suffix(ENCRYPTED_NAME_SUFFIX)
        .ok_or_else(|| CryptoError::InvalidFilename(name.to_string()))?;
    let encrypted = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| CryptoError::InvalidFilename(e.to_string()))?;
    let plaintext = decrypt_content(&encrypted, key)?;
    String::from_utf8(plaintext).map_err(|e| CryptoError::InvalidFilename(e.to_string()))
}

/// Hash used for every "has this content changed" comparison.
pub fn compute_content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Profile-scoped key state: the password and the key for the current salt.
///
/// Re-derives on salt adoption so callers never hold a key for a stale salt.
pub struct KeyRing {
    password: Zeroizing<String>,
    rounds: u32,
    key: EncryptionKey,
}

impl KeyRing {
    pub fn new(password: &str, salt: Salt) -> Self {
        Self::with_rounds(password, salt, PBKDF2_ROUNDS)
    }

    pub fn with_rounds(password: &str, salt: Salt, rounds: u32) -> Self {
        let key = derive_key_with_rounds(password, &salt, rounds);
        Self {
            password: Zeroizing::new(password.to_string()),
            rounds,
            key,
        }
    }

    pub fn key(&self) -> &EncryptionKey {
        &self.key
    }

    pub fn salt(&self) -> Salt {
        self.key.salt
    }

    /// Switch to `salt` if it differs from the current one.
    ///
    /// Returns true when the key was re-derived.
    pub fn adopt_salt(&mut self, salt: Salt) -> bool {
        if salt == self.key.salt {
            return false;
        }
        self.key = derive_key_with_rounds(&self.password, &salt, self.rounds);
        true
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRing")
            .field("password", &"<redacted>")
            .field("rounds", &self.rounds)
            .field("key", &self.key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_ROUNDS: u32 = 1_000;

    fn test_key(password: &str) -> EncryptionKey {
        let salt = Salt::from_bytes(&[7u8; SALT_LEN]).unwrap();
        derive_key_with_rounds(password, &salt, TEST_ROUNDS)
    }

    #[test]
    fn test_content_round_trip() {
        let key = test_key("hunter2");
        let large = vec![42u8; 10_000];
        for plaintext in [&b""[..], &b"hello"[..], &[0u8, 255, 1, 2][..], &large[..]] {
            let encrypted = encrypt_content(plaintext, &key).unwrap();
            assert_eq!(encrypted.len(), NONCE_LEN + plaintext.len() + 16);
            assert_eq!(decrypt_content(&encrypted, &key).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let key = test_key("hunter2");
        let a = encrypt_content(b"same", &key).unwrap();
        let b = encrypt_content(b"same", &key).unwrap();
        assert_ne!(a, b);
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn test_wrong_password_fails_with_decryption_error() {
        let encrypted = encrypt_content(b"secret notes", &test_key("right")).unwrap();
        let result = decrypt_content(&encrypted, &test_key("wrong"));
        assert!(matches!(result, Err(CryptoError::Decryption)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = test_key("hunter2");
        let mut encrypted = encrypt_content(b"secret notes", &key).unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0x01;
        assert!(matches!(decrypt_content(&encrypted, &key), Err(CryptoError::Decryption)));
        assert!(matches!(decrypt_content(&[1, 2, 3], &key), Err(CryptoError::Truncated(3))));
    }

    #[test]
    fn test_key_derivation_is_deterministic() {
        let encrypted = encrypt_content(b"data", &test_key("pw")).unwrap();
        // A separately derived key for the same (password, salt) decrypts it
        assert_eq!(decrypt_content(&encrypted, &test_key("pw")).unwrap(), b"data");
    }

    #[test]
    fn test_filename_round_trip() {
        let key = test_key("hunter2");
        let name = encrypt_filename("notes/ünïcode file.md", &key).unwrap();
        assert!(name.ends_with(ENCRYPTED_NAME_SUFFIX));
        assert!(!name.contains("notes"));
        assert!(!name.contains('='));
        assert!(!name.contains('/'));
        assert_eq!(decrypt_filename(&name, &key).unwrap(), "notes/ünïcode file.md");

        assert!(matches!(
            decrypt_filename("plain.md", &key),
            Err(CryptoError::InvalidFilename(_))
        ));
    }

    #[test]
    fn test_content_hash_is_password_independent() {
        let hash = compute_content_hash(b"hello");
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_ne!(hash, compute_content_hash(b"hello!"));
    }

    #[test]
    fn test_salt_hex_round_trip() {
        let salt = Salt::generate();
        assert_eq!(Salt::from_hex(&salt.to_hex()).unwrap(), salt);
        assert!(Salt::from_hex("abcd").is_err());
        assert!(Salt::from_hex("zz").is_err());
    }

    #[test]
    fn test_keyring_adopts_new_salt() {
        let first = Salt::from_bytes(&[1u8; SALT_LEN]).unwrap();
        let second = Salt::from_bytes(&[2u8; SALT_LEN]).unwrap();
        let mut ring = KeyRing::with_rounds("pw", first, TEST_ROUNDS);

        assert!(!ring.adopt_salt(first));
        assert!(ring.adopt_salt(second));
        assert_eq!(ring.salt(), second);

        let expected = derive_key_with_rounds("pw", &second, TEST_ROUNDS);
        let encrypted = encrypt_content(b"x", &expected).unwrap();
        assert_eq!(decrypt_content(&encrypted, ring.key()).unwrap(), b"x");
    }

    #[test]
    fn test_debug_output_redacts_secrets() {
        let ring = KeyRing::with_rounds("super-secret", Salt::generate(), TEST_ROUNDS);
        let debug = format!("{:?}", ring);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }
}
