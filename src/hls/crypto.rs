//! In-place AES-128-CBC encryption of finished HLS segments.

use std::fs;
use std::path::Path;

use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

/// Segment encryption settings advertised in the playlist's
/// `#EXT-X-KEY` line.
#[derive(Debug, Clone)]
pub struct SegmentEncryption {
    pub key: [u8; 16],
    pub iv: [u8; 16],
    pub key_uri: String,
}

/// Replace the file's contents with their AES-128-CBC ciphertext
/// (PKCS#7 padding, so the result grows by up to one block).
pub fn encrypt_in_place(path: &Path, key: &[u8; 16], iv: &[u8; 16]) -> Result<(), String> {
    let plain = fs::read(path)
        .map_err(|e| format!("failed to read segment {}: {e}", path.display()))?;
    let cipher =
        Aes128CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(&plain);
    fs::write(path, cipher)
        .map_err(|e| format!("failed to write encrypted segment {}: {e}", path.display()))
}
