//! Password-based authenticated encryption for sync payloads

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::errors::{CodecError, CodecResult};

/// AES-256-GCM with a 128-bit nonce
type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// Nonce size in bytes
pub const NONCE_SIZE: usize = 16;

/// GCM authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Fixed application salt. Every device must derive the same key from the
/// same password, so the salt cannot be random.
const APPLICATION_SALT: &[u8] = b"convsync/webdav-sync/v1";

/// 256-bit payload key, wiped from memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    key: [u8; 32],
}

impl EncryptionKey {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Argon2id parameters for key derivation
#[derive(Debug, Clone)]
pub struct Argon2Params {
    /// Memory cost in KiB
    pub memory_cost: u32,
    /// Number of iterations
    pub time_cost: u32,
    /// Parallelism factor
    pub parallelism: u32,
}

impl Default for Argon2Params {
    fn default() -> Self {
        Self {
            memory_cost: 19456, // 19 MB
            time_cost: 2,
            parallelism: 1,
        }
    }
}

/// Derive the payload key from a password using Argon2id and the application salt
pub fn derive_key(password: &str, params: &Argon2Params) -> CodecResult<EncryptionKey> {
    let argon2_params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| CodecError::KeyDerivationFailed(e.to_string()))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(password.as_bytes(), APPLICATION_SALT, &mut key)
        .map_err(|e| CodecError::KeyDerivationFailed(e.to_string()))?;

    let derived = EncryptionKey::new(key);
    key.zeroize();
    Ok(derived)
}

/// Generate a random nonce
fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Encrypt with an already derived key.
///
/// Output layout is `nonce(16) || tag(16) || ciphertext`.
pub fn encrypt_with_key(plaintext: &[u8], key: &EncryptionKey) -> CodecResult<Vec<u8>> {
    let cipher = Aes256Gcm16::new_from_slice(key.as_bytes())
        .map_err(|e| CodecError::EncryptionFailed(e.to_string()))?;

    let nonce_bytes = generate_nonce();
    let nonce = GenericArray::from_slice(&nonce_bytes);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(nonce, b"", &mut buffer)
        .map_err(|e| CodecError::EncryptionFailed(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + TAG_SIZE + buffer.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(tag.as_slice());
    out.extend_from_slice(&buffer);
    Ok(out)
}

/// Decrypt a `nonce || tag || ciphertext` payload with an already derived key
pub fn decrypt_with_key(payload: &[u8], key: &EncryptionKey) -> CodecResult<Vec<u8>> {
    if payload.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CodecError::InvalidFormat(format!(
            "payload is {} bytes, shorter than nonce and tag",
            payload.len()
        )));
    }

    let cipher = Aes256Gcm16::new_from_slice(key.as_bytes())
        .map_err(|e| CodecError::EncryptionFailed(e.to_string()))?;

    let (nonce_bytes, rest) = payload.split_at(NONCE_SIZE);
    let (tag_bytes, ciphertext) = rest.split_at(TAG_SIZE);

    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce_bytes),
            b"",
            &mut buffer,
            GenericArray::from_slice(tag_bytes),
        )
        .map_err(|_| CodecError::AuthenticationFailed)?;

    Ok(buffer)
}

/// Encrypt bytes under a password
pub fn encrypt(plaintext: &[u8], password: &str) -> CodecResult<Vec<u8>> {
    let key = derive_key(password, &Argon2Params::default())?;
    encrypt_with_key(plaintext, &key)
}

/// Decrypt bytes under a password
pub fn decrypt(payload: &[u8], password: &str) -> CodecResult<Vec<u8>> {
    let key = derive_key(password, &Argon2Params::default())?;
    decrypt_with_key(payload, &key)
}
