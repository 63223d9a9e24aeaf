//! Password key derivation and the plaintext crypto header.
//!
//! Encrypted files start with a 32-byte plaintext header preceding page 0:
//!   magic(u32) | kdf_id(u32) | salt(16) | iterations(u32) | page_size(u32)
//!
//! The derived key is validated by decrypting page 0 and checking the
//! database magic: there is no separate password hash on disk.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

use crate::crypto::aead::MasterKey;
use crate::error::{GaldrError, Result};

/// "GLDK" little-endian.
pub const CRYPTO_MAGIC: u32 = 0x4B_44_4C_47;
pub const CRYPTO_HEADER_SIZE: usize = 32;
pub const KDF_PBKDF2_HMAC_SHA256: u32 = 1;
pub const SALT_SIZE: usize = 16;

/// Derive a 256-bit master key from a passphrase using PBKDF2-HMAC-SHA256.
pub fn derive_key(passphrase: &[u8], salt: &[u8; SALT_SIZE], iterations: u32) -> MasterKey {
    let mut output = [0u8; 32];
    pbkdf2_hmac::<Sha256>(passphrase, salt, iterations, &mut output);
    MasterKey::new(output)
}

/// Generate a random 16-byte salt.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut salt);
    salt
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoHeader {
    pub kdf_id: u32,
    pub salt: [u8; SALT_SIZE],
    pub iterations: u32,
    pub page_size: u32,
}

impl CryptoHeader {
    pub fn new(salt: [u8; SALT_SIZE], iterations: u32, page_size: u32) -> Self {
        CryptoHeader {
            kdf_id: KDF_PBKDF2_HMAC_SHA256,
            salt,
            iterations,
            page_size,
        }
    }

    pub fn serialize(&self) -> [u8; CRYPTO_HEADER_SIZE] {
        let mut buf = [0u8; CRYPTO_HEADER_SIZE];
        buf[0..4].copy_from_slice(&CRYPTO_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.kdf_id.to_le_bytes());
        buf[8..24].copy_from_slice(&self.salt);
        buf[24..28].copy_from_slice(&self.iterations.to_le_bytes());
        buf[28..32].copy_from_slice(&self.page_size.to_le_bytes());
        buf
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < CRYPTO_HEADER_SIZE {
            return Err(GaldrError::Corruption("crypto header truncated".into()));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != CRYPTO_MAGIC {
            return Err(GaldrError::Corruption("bad crypto header magic".into()));
        }
        let kdf_id = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if kdf_id != KDF_PBKDF2_HMAC_SHA256 {
            return Err(GaldrError::Corruption(format!("unsupported kdf id {}", kdf_id)));
        }
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&buf[8..24]);
        let iterations = u32::from_le_bytes(buf[24..28].try_into().unwrap());
        let page_size = u32::from_le_bytes(buf[28..32].try_into().unwrap());
        Ok(CryptoHeader {
            kdf_id,
            salt,
            iterations,
            page_size,
        })
    }
}
