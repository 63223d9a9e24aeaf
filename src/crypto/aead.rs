use aes_gcm::aead::{Aead, AeadInPlace, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{GaldrError, Result};

pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

/// 256-bit master key for AES-256-GCM.
/// Key material is zeroed on drop to prevent leaking secrets in memory.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; 32],
}

impl MasterKey {
    pub fn new(key: [u8; 32]) -> Self {
        MasterKey { key }
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != 32 {
            return Err(GaldrError::Encryption("master key must be 32 bytes".into()));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(slice);
        Ok(MasterKey { key })
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

/// Page-level AEAD encryption/decryption.
///
/// A fresh random 12-byte nonce is generated for every write; the nonce and
/// tag are stored in the page trailer (or inline for WAL frames).
/// AAD = page_id (4 bytes LE) || context (4 bytes LE).
pub struct PageCrypto {
    cipher: Aes256Gcm,
}

impl PageCrypto {
    pub fn new(master_key: &MasterKey) -> Self {
        let cipher = Aes256Gcm::new_from_slice(master_key.as_bytes()).expect("valid key size");
        PageCrypto { cipher }
    }

    fn build_aad(id: u32, context: u32) -> [u8; 8] {
        let mut aad = [0u8; 8];
        aad[0..4].copy_from_slice(&id.to_le_bytes());
        aad[4..8].copy_from_slice(&context.to_le_bytes());
        aad
    }

    fn fresh_nonce() -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        nonce
    }

    /// Encrypt `plaintext` in place (ciphertext has the same length).
    /// Returns the nonce and authentication tag for the page trailer.
    pub fn encrypt_detached(
        &self,
        id: u32,
        context: u32,
        buf: &mut [u8],
    ) -> Result<([u8; NONCE_SIZE], [u8; TAG_SIZE])> {
        let aad = Self::build_aad(id, context);
        let nonce_bytes = Self::fresh_nonce();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let tag = self
            .cipher
            .encrypt_in_place_detached(nonce, &aad, buf)
            .map_err(|e| GaldrError::Encryption(e.to_string()))?;

        let mut tag_bytes = [0u8; TAG_SIZE];
        tag_bytes.copy_from_slice(tag.as_slice());
        Ok((nonce_bytes, tag_bytes))
    }

    /// Decrypt a detached ciphertext in place; fails on tag mismatch.
    pub fn decrypt_detached(
        &self,
        id: u32,
        context: u32,
        nonce: &[u8; NONCE_SIZE],
        tag: &[u8; TAG_SIZE],
        buf: &mut [u8],
    ) -> Result<()> {
        let aad = Self::build_aad(id, context);
        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                &aad,
                buf,
                aes_gcm::Tag::from_slice(tag),
            )
            .map_err(|_| GaldrError::Encryption("authentication failed".into()))
    }

    /// Encrypt into a self-contained blob: nonce || ciphertext+tag.
    /// Used for WAL frames, where length framing is external.
    pub fn seal(&self, id: u32, context: u32, plaintext: &[u8]) -> Result<Vec<u8>> {
        let aad = Self::build_aad(id, context);
        let nonce_bytes = Self::fresh_nonce();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, Payload { msg: plaintext, aad: &aad })
            .map_err(|e| GaldrError::Encryption(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a blob produced by `seal`.
    pub fn open(&self, id: u32, context: u32, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < NONCE_SIZE + TAG_SIZE {
            return Err(GaldrError::Encryption("sealed blob too short".into()));
        }
        let aad = Self::build_aad(id, context);
        let nonce = Nonce::from_slice(&blob[..NONCE_SIZE]);
        self.cipher
            .decrypt(nonce, Payload { msg: &blob[NONCE_SIZE..], aad: &aad })
            .map_err(|_| GaldrError::Encryption("authentication failed".into()))
    }

    pub const fn overhead() -> usize {
        NONCE_SIZE + TAG_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> MasterKey {
        MasterKey::new([0x42u8; 32])
    }

    #[test]
    fn test_detached_roundtrip() {
        let crypto = PageCrypto::new(&test_key());
        let mut buf = b"page contents".to_vec();
        let original = buf.clone();

        let (nonce, tag) = crypto.encrypt_detached(7, 1, &mut buf).unwrap();
        assert_ne!(buf, original);
        crypto.decrypt_detached(7, 1, &nonce, &tag, &mut buf).unwrap();
        assert_eq!(buf, original);
    }

    #[test]
    fn test_tamper_detection() {
        let crypto = PageCrypto::new(&test_key());
        let mut buf = vec![0xABu8; 64];
        let (nonce, tag) = crypto.encrypt_detached(1, 0, &mut buf).unwrap();
        buf[0] ^= 0x01;
        assert!(crypto.decrypt_detached(1, 0, &nonce, &tag, &mut buf).is_err());
    }

    #[test]
    fn test_wrong_page_id_fails() {
        let crypto = PageCrypto::new(&test_key());
        let mut buf = b"data".to_vec();
        let (nonce, tag) = crypto.encrypt_detached(1, 0, &mut buf).unwrap();
        assert!(crypto.decrypt_detached(2, 0, &nonce, &tag, &mut buf).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let crypto1 = PageCrypto::new(&MasterKey::new([0x01u8; 32]));
        let crypto2 = PageCrypto::new(&MasterKey::new([0x02u8; 32]));
        let blob = crypto1.seal(1, 0, b"secret").unwrap();
        assert!(crypto2.open(1, 0, &blob).is_err());
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let crypto = PageCrypto::new(&test_key());
        let blob = crypto.seal(9, 3, b"wal frame payload").unwrap();
        assert_eq!(blob.len(), b"wal frame payload".len() + PageCrypto::overhead());
        let opened = crypto.open(9, 3, &blob).unwrap();
        assert_eq!(opened, b"wal frame payload");
    }
}
