//! Wire format of envelopes stored in the backing store.
//!
//! ```text
//! [version: u8][flags: u8][payload ...]
//! ```
//!
//! The payload is the MessagePack encoding of a [`CacheEntry`], optionally
//! gzip-compressed (flag bit 0) and then AES-256-GCM encrypted (flag bit 1,
//! 96-bit nonce prepended to the ciphertext). Decoding is driven by the
//! frame's own flags, so entries written before a strategy changed its
//! compression or encryption settings stay readable.

use std::io::{Read, Write};

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use rand::RngCore;
use serde::{Serialize, de::DeserializeOwned};
use tiercache_core::{CacheEntry, CacheError, Result};

const FORMAT_VERSION: u8 = 1;
const FLAG_COMPRESSED: u8 = 0b01;
const FLAG_ENCRYPTED: u8 = 0b10;
const HEADER_SIZE: usize = 2;

/// Nonce size for AES-256-GCM (96 bits)
const NONCE_SIZE: usize = 12;

/// Key size for AES-256 (256 bits)
pub const KEY_SIZE: usize = 32;

#[derive(Clone, Default)]
pub struct EnvelopeCodec {
    key: Option<[u8; KEY_SIZE]>,
}

impl std::fmt::Debug for EnvelopeCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCodec")
            .field("encryption", &self.key.is_some())
            .finish()
    }
}

impl EnvelopeCodec {
    pub fn new(key: Option<[u8; KEY_SIZE]>) -> Self {
        Self { key }
    }

    /// Build a codec from an optional hex or base64 key string.
    pub fn from_key_str(key: Option<&str>) -> Result<Self> {
        key.map(parse_key).transpose().map(Self::new)
    }

    pub fn can_encrypt(&self) -> bool {
        self.key.is_some()
    }

    pub fn encode<T: Serialize>(
        &self,
        entry: &CacheEntry<T>,
        compress: bool,
        encrypt: bool,
    ) -> Result<Vec<u8>> {
        let mut payload = rmp_serde::to_vec_named(entry)
            .map_err(|e| CacheError::serialization(format!("failed to encode entry: {e}")))?;
        let mut flags = 0u8;

        if compress {
            payload = gzip(&payload)
                .map_err(|e| CacheError::serialization(format!("compression failed: {e}")))?;
            flags |= FLAG_COMPRESSED;
        }

        if encrypt {
            payload = self.seal(&payload)?;
            flags |= FLAG_ENCRYPTED;
        }

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.push(FORMAT_VERSION);
        frame.push(flags);
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    pub fn decode<T: DeserializeOwned>(&self, frame: &[u8]) -> Result<CacheEntry<T>> {
        if frame.len() < HEADER_SIZE {
            return Err(CacheError::serialization("envelope too short"));
        }
        if frame[0] != FORMAT_VERSION {
            return Err(CacheError::serialization(format!(
                "unsupported envelope version {}",
                frame[0]
            )));
        }
        let flags = frame[1];
        let mut payload = frame[HEADER_SIZE..].to_vec();

        if flags & FLAG_ENCRYPTED != 0 {
            payload = self.open(&payload)?;
        }

        if flags & FLAG_COMPRESSED != 0 {
            let mut decoded = Vec::new();
            GzDecoder::new(payload.as_slice())
                .read_to_end(&mut decoded)
                .map_err(|e| CacheError::serialization(format!("decompression failed: {e}")))?;
            payload = decoded;
        }

        rmp_serde::from_slice(&payload)
            .map_err(|e| CacheError::serialization(format!("failed to decode entry: {e}")))
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| CacheError::encryption("Encryption key required but not configured"))?;
        Aes256Gcm::new_from_slice(key)
            .map_err(|e| CacheError::encryption(format!("Failed to create cipher: {e}")))
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher()?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CacheError::encryption(format!("Encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_SIZE {
            return Err(CacheError::encryption("Invalid nonce size"));
        }
        let cipher = self.cipher()?;
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| CacheError::encryption(format!("Decryption failed: {e}")))
    }
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// Parse a key from a hex or base64 string
pub fn parse_key(key_str: &str) -> Result<[u8; KEY_SIZE]> {
    let key_str = key_str.trim();

    // Try hex first
    if key_str.len() == KEY_SIZE * 2
        && let Ok(bytes) = hex::decode(key_str)
    {
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes);
        return Ok(key);
    }

    let bytes = BASE64
        .decode(key_str)
        .map_err(|e| CacheError::encryption(format!("Invalid base64 key: {e}")))?;

    if bytes.len() != KEY_SIZE {
        return Err(CacheError::encryption(format!(
            "Key must be {} bytes, got {}",
            KEY_SIZE,
            bytes.len()
        )));
    }

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        name: String,
        roles: Vec<String>,
    }

    fn user_entry() -> CacheEntry<User> {
        CacheEntry::new(
            User {
                name: "Ann".into(),
                roles: vec!["admin".into()],
            },
            Duration::from_secs(60),
        )
        .with_strategy("user")
    }

    fn test_codec() -> EnvelopeCodec {
        EnvelopeCodec::new(Some([7u8; KEY_SIZE]))
    }

    #[test]
    fn test_plain_frame_header() {
        let frame = EnvelopeCodec::default()
            .encode(&user_entry(), false, false)
            .unwrap();
        assert_eq!(frame[0], FORMAT_VERSION);
        assert_eq!(frame[1], 0);

        let decoded: CacheEntry<User> = EnvelopeCodec::default().decode(&frame).unwrap();
        assert_eq!(decoded, user_entry_with_time(&decoded));
    }

    fn user_entry_with_time(reference: &CacheEntry<User>) -> CacheEntry<User> {
        let mut entry = user_entry();
        entry.written_at_ms = reference.written_at_ms;
        entry
    }

    #[test]
    fn test_compressed_and_encrypted_frame() {
        let codec = test_codec();
        let entry = user_entry();
        let frame = codec.encode(&entry, true, true).unwrap();
        assert_eq!(frame[1], FLAG_COMPRESSED | FLAG_ENCRYPTED);

        let decoded: CacheEntry<User> = codec.decode(&frame).unwrap();
        assert_eq!(decoded.data, entry.data);
        assert_eq!(decoded.strategy.as_deref(), Some("user"));
    }

    #[test]
    fn test_decode_as_json_value() {
        let frame = EnvelopeCodec::default()
            .encode(&user_entry(), true, false)
            .unwrap();
        let decoded: CacheEntry<serde_json::Value> =
            EnvelopeCodec::default().decode(&frame).unwrap();
        assert_eq!(decoded.data["name"], "Ann");
        assert_eq!(decoded.data["roles"][0], "admin");
    }

    #[test]
    fn test_encrypt_without_key_fails() {
        let err = EnvelopeCodec::default()
            .encode(&user_entry(), false, true)
            .unwrap_err();
        assert!(matches!(err, CacheError::Encryption(_)));
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let frame = test_codec().encode(&user_entry(), false, true).unwrap();
        let other = EnvelopeCodec::new(Some([9u8; KEY_SIZE]));
        assert!(other.decode::<User>(&frame).is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        let codec = EnvelopeCodec::default();
        assert!(codec.decode::<User>(&[]).is_err());
        assert!(codec.decode::<User>(&[42, 0, 1, 2]).is_err());
        assert!(codec.decode::<User>(&[FORMAT_VERSION, 0, 0xc1]).is_err());
    }

    #[test]
    fn test_parse_key_hex_and_base64() {
        let hex_key = "ab".repeat(KEY_SIZE);
        assert_eq!(parse_key(&hex_key).unwrap(), [0xab; KEY_SIZE]);

        let b64 = BASE64.encode([1u8; KEY_SIZE]);
        assert_eq!(parse_key(&b64).unwrap(), [1u8; KEY_SIZE]);

        assert!(parse_key("too-short").is_err());
        assert!(EnvelopeCodec::from_key_str(None).unwrap().key.is_none());
    }
}
