//! At-rest sealing helpers (XChaCha20-Poly1305) for local stores.

use anyhow::{anyhow, Result};
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use zeroize::Zeroizing;

pub const NONCE_LEN: usize = 24;
pub const AT_REST_KEY_LEN: usize = 32;

pub fn encrypt(key: &[u8], nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    if key.len() != AT_REST_KEY_LEN {
        return Err(anyhow!("at-rest key must be {AT_REST_KEY_LEN} bytes"));
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = XNonce::from_slice(nonce);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| anyhow!("encrypt: {e}"))?;
    Ok(ciphertext)
}

pub fn decrypt(key: &[u8], nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if key.len() != AT_REST_KEY_LEN {
        return Err(anyhow!("at-rest key must be {AT_REST_KEY_LEN} bytes"));
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = XNonce::from_slice(nonce);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| anyhow!("decrypt: {e}"))?;
    Ok(Zeroizing::new(plaintext))
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn generate_key() -> Zeroizing<[u8; AT_REST_KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; AT_REST_KEY_LEN]);
    OsRng.fill_bytes(key.as_mut());
    key
}
