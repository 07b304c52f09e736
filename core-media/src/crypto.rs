//! # Block Decryption
//!
//! Sealed blocks are base64 text of an AES-CBC/PKCS#7 ciphertext whose
//! plaintext is itself base64 text of the raw media bytes. Opening a block is
//! therefore: base64-decode, AES-CBC-decrypt, base64-decode.

use aes::{Aes128, Aes192, Aes256};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use cbc::Decryptor;
use std::fmt;
use thiserror::Error;

use crate::error::{MediaError, Result};

/// CBC block and IV size.
pub const IV_LEN: usize = 16;

/// Why a single block could not be opened.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("block body is not valid base64")]
    InvalidCiphertext,

    #[error("block IV must be {IV_LEN} hex-encoded bytes")]
    InvalidIv,

    #[error("ciphertext did not decrypt to valid padding")]
    BadPadding,

    #[error("decrypted payload is not valid base64")]
    InvalidPlaintext,

    #[error("decryptor panicked: {0}")]
    Panicked(String),
}

/// Symmetric content key of an asset.
///
/// Never serialized and never printed; `Debug` shows only the key length.
#[derive(Clone, PartialEq, Eq)]
pub struct ContentKey(Bytes);

impl ContentKey {
    /// Parse a hex-encoded AES-128, AES-192 or AES-256 key.
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let raw = hex::decode(hex_key.trim())
            .map_err(|_| MediaError::InvalidKey("content key is not valid hex".to_string()))?;
        Self::from_bytes(raw)
    }

    pub fn from_bytes(raw: impl Into<Bytes>) -> Result<Self> {
        let raw = raw.into();
        match raw.len() {
            16 | 24 | 32 => Ok(Self(raw)),
            len => Err(MediaError::InvalidKey(format!(
                "content key must be 16, 24 or 32 bytes, got {}",
                len
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey(AES-{}, [REDACTED])", self.0.len() * 8)
    }
}

/// One sealed block waiting to be opened.
#[derive(Debug, Clone)]
pub struct EncryptedBlock {
    /// Body exactly as fetched.
    pub data: Bytes,
    /// Hex-encoded IV from the manifest.
    pub iv: String,
}

impl EncryptedBlock {
    pub fn new(data: impl Into<Bytes>, iv: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            iv: iv.into(),
        }
    }
}

/// Opens one sealed block.
///
/// Implementations run on decrypt worker threads and must be pure: no I/O,
/// no shared mutable state.
pub trait BlockDecryptor: Send + Sync {
    fn decrypt_block(
        &self,
        block: &EncryptedBlock,
        key: &ContentKey,
    ) -> std::result::Result<Bytes, CryptoError>;
}

/// The messaging service's sealing format.
#[derive(Debug, Clone, Copy, Default)]
pub struct AesCbcDecryptor;

impl AesCbcDecryptor {
    fn decode_base64(text: &[u8]) -> Option<Vec<u8>> {
        let compact: Vec<u8> = text
            .iter()
            .copied()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        STANDARD.decode(compact).ok()
    }

    fn parse_iv(iv_hex: &str) -> std::result::Result<[u8; IV_LEN], CryptoError> {
        let raw = hex::decode(iv_hex.trim()).map_err(|_| CryptoError::InvalidIv)?;
        raw.try_into().map_err(|_| CryptoError::InvalidIv)
    }

    fn cbc_decrypt<'a>(
        key: &[u8],
        iv: &[u8; IV_LEN],
        buf: &'a mut [u8],
    ) -> std::result::Result<&'a [u8], CryptoError> {
        let plaintext = match key.len() {
            16 => Decryptor::<Aes128>::new(key.into(), iv.into()).decrypt_padded_mut::<Pkcs7>(buf),
            24 => Decryptor::<Aes192>::new(key.into(), iv.into()).decrypt_padded_mut::<Pkcs7>(buf),
            32 => Decryptor::<Aes256>::new(key.into(), iv.into()).decrypt_padded_mut::<Pkcs7>(buf),
            // ContentKey construction rejects every other length
            _ => return Err(CryptoError::BadPadding),
        };
        plaintext.map_err(|_| CryptoError::BadPadding)
    }
}

impl BlockDecryptor for AesCbcDecryptor {
    fn decrypt_block(
        &self,
        block: &EncryptedBlock,
        key: &ContentKey,
    ) -> std::result::Result<Bytes, CryptoError> {
        let iv = Self::parse_iv(&block.iv)?;
        let mut ciphertext =
            Self::decode_base64(&block.data).ok_or(CryptoError::InvalidCiphertext)?;
        if ciphertext.is_empty() || ciphertext.len() % IV_LEN != 0 {
            return Err(CryptoError::InvalidCiphertext);
        }

        let plaintext = Self::cbc_decrypt(key.as_bytes(), &iv, &mut ciphertext)?;
        let media = Self::decode_base64(plaintext).ok_or(CryptoError::InvalidPlaintext)?;
        Ok(Bytes::from(media))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use cbc::cipher::BlockEncryptMut;
    use cbc::Encryptor;

    pub const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f";

    pub fn key() -> ContentKey {
        ContentKey::from_hex(KEY_HEX).unwrap()
    }

    pub fn iv_hex(seed: u8) -> String {
        hex::encode([seed; IV_LEN])
    }

    /// Seal `media` the way the messaging service does.
    pub fn seal(media: &[u8], key: &ContentKey, iv_hex: &str) -> Bytes {
        let iv: [u8; IV_LEN] = hex::decode(iv_hex).unwrap().try_into().unwrap();
        let inner = STANDARD.encode(media).into_bytes();
        let len = inner.len();
        let mut buf = inner;
        buf.resize(len + IV_LEN, 0);
        let sealed = Encryptor::<Aes128>::new(key.as_bytes().into(), (&iv).into())
            .encrypt_padded_mut::<Pkcs7>(&mut buf, len)
            .unwrap();
        Bytes::from(STANDARD.encode(sealed))
    }

    pub fn sealed_block(media: &[u8], seed: u8) -> EncryptedBlock {
        let iv = iv_hex(seed);
        EncryptedBlock::new(seal(media, &key(), &iv), iv)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_open_sealed_block() {
        let block = sealed_block(b"\x89PNG\r\n\x1a\nrest-of-image", 7);
        let media = AesCbcDecryptor.decrypt_block(&block, &key()).unwrap();
        assert_eq!(&media[..], b"\x89PNG\r\n\x1a\nrest-of-image");
    }

    #[test]
    fn test_whitespace_around_body_is_ignored() {
        let block = sealed_block(b"frame", 1);
        let mut body = b"  \n".to_vec();
        body.extend_from_slice(&block.data);
        body.extend_from_slice(b"\r\n");
        let block = EncryptedBlock::new(body, format!(" {} ", block.iv));

        let media = AesCbcDecryptor.decrypt_block(&block, &key()).unwrap();
        assert_eq!(&media[..], b"frame");
    }

    #[test]
    fn test_wrong_key_fails() {
        let block = sealed_block(b"secret media bytes", 3);
        let other = ContentKey::from_hex("ffeeddccbbaa99887766554433221100").unwrap();
        let result = AesCbcDecryptor.decrypt_block(&block, &other);
        assert!(matches!(
            result,
            Err(CryptoError::BadPadding) | Err(CryptoError::InvalidPlaintext)
        ));
    }

    #[test]
    fn test_malformed_inputs() {
        let block = EncryptedBlock::new(Bytes::from_static(b"!!not base64!!"), iv_hex(0));
        assert_eq!(
            AesCbcDecryptor.decrypt_block(&block, &key()),
            Err(CryptoError::InvalidCiphertext)
        );

        let block = EncryptedBlock::new(Bytes::from_static(b"AAAA"), "abc");
        assert_eq!(
            AesCbcDecryptor.decrypt_block(&block, &key()),
            Err(CryptoError::InvalidIv)
        );

        // 3 bytes of ciphertext is not a whole AES block
        let block = EncryptedBlock::new(Bytes::from_static(b"AAAA"), iv_hex(0));
        assert_eq!(
            AesCbcDecryptor.decrypt_block(&block, &key()),
            Err(CryptoError::InvalidCiphertext)
        );
    }

    #[test]
    fn test_content_key_lengths() {
        assert_eq!(ContentKey::from_hex(&"ab".repeat(16)).unwrap().len(), 16);
        assert_eq!(ContentKey::from_hex(&"ab".repeat(24)).unwrap().len(), 24);
        assert_eq!(ContentKey::from_hex(&"ab".repeat(32)).unwrap().len(), 32);
        assert!(matches!(
            ContentKey::from_hex(&"ab".repeat(20)),
            Err(MediaError::InvalidKey(_))
        ));
        assert!(matches!(
            ContentKey::from_hex("not-hex"),
            Err(MediaError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_content_key_debug_is_redacted() {
        let debug = format!("{:?}", key());
        assert_eq!(debug, "ContentKey(AES-128, [REDACTED])");
        assert!(!debug.contains("0001"));
    }
}
