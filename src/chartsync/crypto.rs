//! Credential envelope for object-store access keys
//!
//! `ackId`/`ackSecret` may be stored encrypted in the resource:
//! `base64url-no-pad(AES-128-CBC-PKCS7(plaintext))` with the IV equal to the
//! key. The key ships with a well-known default for compatibility with
//! existing resources and can be overridden through configuration.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::crd::OssSource;
use crate::Error;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Key used when no override is configured. Kept for compatibility with
/// credentials encrypted by existing tooling.
pub const DEFAULT_ACK_KEY: &str = "2367943245267894";

/// Symmetric cipher for the credential envelope
pub struct AckCipher {
    key: [u8; 16],
}

impl AckCipher {
    /// Create a cipher from a 16-byte key
    pub fn new(key: &str) -> Result<Self, Error> {
        let bytes = key.as_bytes();
        if bytes.len() != 16 {
            return Err(Error::decode(format!(
                "credential key must be 16 bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    /// Cipher with the built-in default key
    pub fn with_default_key() -> Self {
        Self::new(DEFAULT_ACK_KEY).expect("default key is 16 bytes")
    }

    /// Decrypt a URL-safe-unpadded base64 ciphertext
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, Error> {
        let raw = URL_SAFE_NO_PAD
            .decode(ciphertext)
            .map_err(|e| Error::decode(format!("invalid base64 ciphertext: {e}")))?;
        if raw.is_empty() || raw.len() % 16 != 0 {
            return Err(Error::decode(format!(
                "ciphertext length {} is not a multiple of the block size",
                raw.len()
            )));
        }
        let cipher = Aes128CbcDec::new_from_slices(&self.key, &self.key)
            .map_err(|e| Error::decode(format!("invalid key/iv: {e}")))?;
        let plain = cipher
            .decrypt_padded_vec_mut::<Pkcs7>(&raw)
            .map_err(|_| Error::decode("bad PKCS#7 padding"))?;
        String::from_utf8(plain).map_err(|e| Error::decode(format!("plaintext is not UTF-8: {e}")))
    }

    /// Encrypt a plaintext into the envelope encoding
    pub fn encrypt(&self, plaintext: &str) -> String {
        let cipher = Aes128CbcEnc::new_from_slices(&self.key, &self.key)
            .expect("key and iv are 16 bytes");
        let raw = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Return the usable (ackId, ackSecret) pair of an object store source,
    /// decrypting when the source marks them as encrypted
    pub fn decode_credentials(&self, oss: &OssSource) -> Result<(String, String), Error> {
        if !oss.ack_encrypted {
            return Ok((oss.ack_id.clone(), oss.ack_secret.clone()));
        }
        let id = self.decrypt(&oss.ack_id)?;
        let secret = self.decrypt(&oss.ack_secret)?;
        Ok((id, secret))
    }
}
