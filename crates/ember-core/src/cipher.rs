//! At-rest field cipher.
//!
//! Message bodies and attachment storage paths are stored as
//! `iv_hex:cipher_hex`, where `cipher` is AEAD ciphertext with the tag
//! appended. A fresh random IV is drawn for every call.
//!
//! Supported algorithms:
//!   - `aes-256-gcm`         (12-byte IV, default)
//!   - `xchacha20-poly1305`  (24-byte IV)

use std::str::FromStr;

use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::XChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{ConfigError, CryptoError};

pub const KEY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    Aes256Gcm,
    XChaCha20Poly1305,
}

impl CipherAlgorithm {
    pub fn iv_len(&self) -> usize {
        match self {
            CipherAlgorithm::Aes256Gcm => 12,
            CipherAlgorithm::XChaCha20Poly1305 => 24,
        }
    }

    pub fn key_len(&self) -> usize {
        KEY_LEN
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CipherAlgorithm::Aes256Gcm => "aes-256-gcm",
            CipherAlgorithm::XChaCha20Poly1305 => "xchacha20-poly1305",
        }
    }
}

impl FromStr for CipherAlgorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aes-256-gcm" => Ok(CipherAlgorithm::Aes256Gcm),
            "xchacha20-poly1305" => Ok(CipherAlgorithm::XChaCha20Poly1305),
            other => Err(ConfigError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Process-wide content cipher. Built once at startup; the key is zeroized
/// when the cipher is dropped.
pub struct ContentCipher {
    algorithm: CipherAlgorithm,
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl ContentCipher {
    /// Build from raw key text. The first 32 bytes of the UTF-8 encoding are
    /// the key; anything shorter is rejected.
    pub fn new(algorithm: CipherAlgorithm, key_text: &str) -> Result<Self, ConfigError> {
        let bytes = key_text.as_bytes();
        if bytes.is_empty() {
            return Err(ConfigError::MissingKey("encryption key".into()));
        }
        if bytes.len() < algorithm.key_len() {
            return Err(ConfigError::KeyTooShort {
                len: bytes.len(),
                required: algorithm.key_len(),
            });
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&bytes[..KEY_LEN]);
        Ok(Self { algorithm, key })
    }

    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let mut iv = vec![0u8; self.algorithm.iv_len()];
        OsRng.fill_bytes(&mut iv);

        let ciphertext = match self.algorithm {
            CipherAlgorithm::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(&self.key[..])
                    .map_err(|_| CryptoError::Encrypt)?;
                cipher
                    .encrypt(GenericArray::from_slice(&iv), plaintext)
                    .map_err(|_| CryptoError::Encrypt)?
            }
            CipherAlgorithm::XChaCha20Poly1305 => {
                let cipher = XChaCha20Poly1305::new_from_slice(&self.key[..])
                    .map_err(|_| CryptoError::Encrypt)?;
                cipher
                    .encrypt(chacha20poly1305::XNonce::from_slice(&iv), plaintext)
                    .map_err(|_| CryptoError::Encrypt)?
            }
        };

        Ok(format!("{}:{}", hex::encode(iv), hex::encode(ciphertext)))
    }

    pub fn decrypt(&self, blob: &str) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let (iv_hex, ct_hex) = blob
            .split_once(':')
            .ok_or(CryptoError::MalformedBlob("missing ':' separator"))?;
        if ct_hex.is_empty() {
            return Err(CryptoError::MalformedBlob("empty ciphertext"));
        }
        let iv = hex::decode(iv_hex)?;
        if iv.len() != self.algorithm.iv_len() {
            return Err(CryptoError::InvalidIvLength {
                expected: self.algorithm.iv_len(),
                actual: iv.len(),
            });
        }
        let ciphertext = hex::decode(ct_hex)?;

        let plaintext = match self.algorithm {
            CipherAlgorithm::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(&self.key[..])
                    .map_err(|_| CryptoError::Decrypt)?;
                cipher
                    .decrypt(GenericArray::from_slice(&iv), ciphertext.as_slice())
                    .map_err(|_| CryptoError::Decrypt)?
            }
            CipherAlgorithm::XChaCha20Poly1305 => {
                let cipher = XChaCha20Poly1305::new_from_slice(&self.key[..])
                    .map_err(|_| CryptoError::Decrypt)?;
                cipher
                    .decrypt(chacha20poly1305::XNonce::from_slice(&iv), ciphertext.as_slice())
                    .map_err(|_| CryptoError::Decrypt)?
            }
        };
        Ok(Zeroizing::new(plaintext))
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<String, CryptoError> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_str(&self, blob: &str) -> Result<String, CryptoError> {
        let bytes = self.decrypt(blob)?;
        std::str::from_utf8(&bytes)
            .map(str::to_owned)
            .map_err(|_| CryptoError::Utf8)
    }
}

impl std::fmt::Debug for ContentCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCipher")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}
