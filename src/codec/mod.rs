//! Payload codec for sync uploads and downloads
//!
//! This module provides:
//! - Gzip compression
//! - AES-256-GCM authenticated encryption with an Argon2id password key
//! - `PayloadCodec`, which applies compress-then-encrypt on the way out and
//!   decrypt-then-decompress on the way in

pub mod compress;
pub mod crypto;
pub mod errors;

pub use compress::{compress, decompress, is_gzip};
pub use crypto::{decrypt, derive_key, encrypt, Argon2Params, EncryptionKey};
pub use errors::{CodecError, CodecResult};

/// Transforms applied to (or detected on) a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transforms {
    pub compressed: bool,
    pub encrypted: bool,
}

/// Encoder/decoder for sync payloads.
///
/// The key is derived once at construction so a batch of uploads pays the
/// KDF cost a single time.
#[derive(Debug, Clone)]
pub struct PayloadCodec {
    compress: bool,
    encrypt: bool,
    key: Option<EncryptionKey>,
}

impl PayloadCodec {
    /// Codec that passes bytes through untouched
    pub fn plain() -> Self {
        Self {
            compress: false,
            encrypt: false,
            key: None,
        }
    }

    /// Build a codec. A password is required when `encrypt` is set; it is
    /// also used to decrypt downloads even when outgoing encryption is off.
    pub fn new(compress: bool, encrypt: bool, password: Option<&str>) -> CodecResult<Self> {
        Self::with_params(compress, encrypt, password, &Argon2Params::default())
    }

    pub fn with_params(
        compress: bool,
        encrypt: bool,
        password: Option<&str>,
        params: &Argon2Params,
    ) -> CodecResult<Self> {
        let key = match password {
            Some(pw) if !pw.is_empty() => Some(derive_key(pw, params)?),
            _ => None,
        };
        if encrypt && key.is_none() {
            return Err(CodecError::PasswordRequired);
        }
        Ok(Self {
            compress,
            encrypt,
            key,
        })
    }

    /// Transforms `encode` applies
    pub fn transforms(&self) -> Transforms {
        Transforms {
            compressed: self.compress,
            encrypted: self.encrypt,
        }
    }

    /// Compress (if enabled), then encrypt (if enabled)
    pub fn encode(&self, data: &[u8]) -> CodecResult<Vec<u8>> {
        let data = if self.compress {
            compress(data)?
        } else {
            data.to_vec()
        };
        if self.encrypt {
            let key = self.key.as_ref().ok_or(CodecError::PasswordRequired)?;
            crypto::encrypt_with_key(&data, key)
        } else {
            Ok(data)
        }
    }

    /// Reverse the given transforms: decrypt first, then decompress
    pub fn decode(&self, data: &[u8], transforms: Transforms) -> CodecResult<Vec<u8>> {
        let data = if transforms.encrypted {
            let key = self.key.as_ref().ok_or(CodecError::PasswordRequired)?;
            crypto::decrypt_with_key(data, key)?
        } else {
            data.to_vec()
        };
        if transforms.compressed {
            decompress(&data)
        } else {
            Ok(data)
        }
    }

    /// Decode a payload whose transforms are unknown, returning the plain
    /// bytes and what was reversed.
    ///
    /// JSON text is plain, the gzip header means compressed only, anything
    /// else is treated as encrypted (and decompressed afterwards if the
    /// plaintext carries the gzip header). With a key at hand, ciphertext
    /// that happens to start like JSON or gzip is still recognized, and a
    /// payload that is neither valid JSON nor gzip reports the decryption
    /// failure.
    pub fn decode_auto(&self, data: &[u8]) -> CodecResult<(Vec<u8>, Transforms)> {
        if looks_like_json(data) {
            let Some(key) = self.key.as_ref() else {
                return Ok((data.to_vec(), Transforms::default()));
            };
            return match crypto::decrypt_with_key(data, key) {
                Ok(plain) => unwrap_decrypted(plain),
                Err(_) if is_json(data) => Ok((data.to_vec(), Transforms::default())),
                Err(e) => Err(e),
            };
        }
        if is_gzip(data) {
            return match decompress(data) {
                Ok(plain) => Ok((
                    plain,
                    Transforms {
                        compressed: true,
                        encrypted: false,
                    },
                )),
                Err(e) => match self.key.as_ref() {
                    Some(key) => crypto::decrypt_with_key(data, key).and_then(unwrap_decrypted),
                    None => Err(e),
                },
            };
        }

        let key = self.key.as_ref().ok_or(CodecError::PasswordRequired)?;
        let plain = crypto::decrypt_with_key(data, key)?;
        unwrap_decrypted(plain)
    }
}

fn unwrap_decrypted(plain: Vec<u8>) -> CodecResult<(Vec<u8>, Transforms)> {
    if is_gzip(&plain) {
        let transforms = Transforms {
            compressed: true,
            encrypted: true,
        };
        Ok((decompress(&plain)?, transforms))
    } else {
        let transforms = Transforms {
            compressed: false,
            encrypted: true,
        };
        Ok((plain, transforms))
    }
}

fn is_json(data: &[u8]) -> bool {
    serde_json::from_slice::<serde::de::IgnoredAny>(data).is_ok()
}

fn looks_like_json(data: &[u8]) -> bool {
    matches!(
        data.iter().find(|b| !b.is_ascii_whitespace()),
        Some(b'{') | Some(b'[')
    )
}
