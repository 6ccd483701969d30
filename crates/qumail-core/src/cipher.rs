//! The four packet protocols.
//!
//! Every function borrows key material for the duration of one call; any
//! working copy (AES key schedule, decrypted buffers) is zeroized before it
//! returns, on success and on error.

use aes::{Aes128, Aes192, Aes256};
use base64::{engine::general_purpose, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, InvalidLength, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::warn;
use zeroize::Zeroizing;

use crate::key::SymmetricKey;
use crate::packet::{Packet, ProtocolLevel};

pub const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    #[error("invalid protocol format: {0}")]
    InvalidProtocolFormat(&'static str),
    #[error("integrity violation: packet signature does not match payload")]
    IntegrityViolation,
    #[error("decryption failed (wrong key or corrupt ciphertext)")]
    DecryptionFailure,
    #[error("malformed {0} packet encoding")]
    MalformedEncoding(&'static str),
    #[error("key length {0} is not usable at this level")]
    InvalidKeyLength(usize),
}

/// Encode `text` at `level`. The plaintext level ignores the key.
pub fn encode(level: ProtocolLevel, text: &str, key: &SymmetricKey) -> Result<String, CipherError> {
    match level {
        ProtocolLevel::Otp => encrypt_otp(text, key.expose()),
        ProtocolLevel::Aes => encrypt_aes(text, key.expose()),
        ProtocolLevel::PqcHybrid => encrypt_pqc_hybrid(text, key.expose()),
        ProtocolLevel::Plaintext => Ok(encode_plaintext(text)),
    }
}

/// Decode a wire string produced at `level`.
pub fn decode(level: ProtocolLevel, wire: &str, key: &SymmetricKey) -> Result<String, CipherError> {
    match Packet::parse(level, wire)? {
        Packet::Otp(body) => otp_open(body, key.expose()),
        Packet::Aes(body) => aes_open(body, key.expose()),
        Packet::Pqc { signature, payload } => pqc_open(signature, payload, key.expose()),
        Packet::Plain(body) => plain_open(body),
    }
}

// ── Level 1: repeating-key XOR ──────────────────────────────────────────────

pub fn encrypt_otp(text: &str, key: &[u8]) -> Result<String, CipherError> {
    if key.is_empty() {
        return Err(CipherError::InvalidKeyLength(0));
    }
    let sealed = xor_keystream(text.as_bytes(), key);
    Ok(general_purpose::STANDARD.encode(sealed))
}

pub fn decrypt_otp(wire: &str, key: &[u8]) -> Result<String, CipherError> {
    match Packet::parse(ProtocolLevel::Otp, wire)? {
        Packet::Otp(body) => otp_open(body, key),
        _ => Err(CipherError::InvalidProtocolFormat("expected OTP packet")),
    }
}

fn otp_open(body: &str, key: &[u8]) -> Result<String, CipherError> {
    if key.is_empty() {
        return Err(CipherError::InvalidKeyLength(0));
    }
    let sealed = general_purpose::STANDARD
        .decode(body)
        .map_err(|_| CipherError::MalformedEncoding("otp"))?;
    let opened = Zeroizing::new(xor_keystream(&sealed, key));
    // No integrity at this level: a wrong key yields garbage, not an error.
    Ok(String::from_utf8_lossy(&opened).into_owned())
}

fn xor_keystream(data: &[u8], key: &[u8]) -> Vec<u8> {
    data.iter()
        .zip(key.iter().cycle())
        .map(|(byte, k)| byte ^ k)
        .collect()
}

// ── Level 2: AES-CBC ────────────────────────────────────────────────────────

pub fn encrypt_aes(text: &str, key: &[u8]) -> Result<String, CipherError> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    let sealed = cbc_seal(key, &iv, text.as_bytes())?;
    let mut combined = Vec::with_capacity(IV_LEN + sealed.len());
    combined.extend_from_slice(&iv);
    combined.extend_from_slice(&sealed);
    Ok(general_purpose::STANDARD.encode(combined))
}

pub fn decrypt_aes(wire: &str, key: &[u8]) -> Result<String, CipherError> {
    match Packet::parse(ProtocolLevel::Aes, wire)? {
        Packet::Aes(body) => aes_open(body, key),
        _ => Err(CipherError::InvalidProtocolFormat("expected AES packet")),
    }
}

fn aes_open(body: &str, key: &[u8]) -> Result<String, CipherError> {
    check_aes_key(key)?;
    let combined = general_purpose::STANDARD
        .decode(body)
        .map_err(|_| CipherError::DecryptionFailure)?;
    if combined.len() < IV_LEN + BLOCK_LEN || (combined.len() - IV_LEN) % BLOCK_LEN != 0 {
        return Err(CipherError::DecryptionFailure);
    }
    let (iv, sealed) = combined.split_at(IV_LEN);
    let opened = cbc_open(key, iv, sealed)?;
    let text = std::str::from_utf8(&opened).map_err(|_| CipherError::DecryptionFailure)?;
    Ok(text.to_owned())
}

fn check_aes_key(key: &[u8]) -> Result<(), CipherError> {
    match key.len() {
        16 | 24 | 32 => Ok(()),
        other => Err(CipherError::InvalidKeyLength(other)),
    }
}

fn cbc_seal(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    let invalid = |_: InvalidLength| CipherError::InvalidKeyLength(key.len());
    let sealed = match key.len() {
        16 => cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        24 => cbc::Encryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        32 => cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        other => return Err(CipherError::InvalidKeyLength(other)),
    };
    Ok(sealed)
}

fn cbc_open(key: &[u8], iv: &[u8], sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    let invalid = |_: InvalidLength| CipherError::InvalidKeyLength(key.len());
    let opened = match key.len() {
        16 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<Pkcs7>(sealed),
        24 => cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<Pkcs7>(sealed),
        32 => cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<Pkcs7>(sealed),
        other => return Err(CipherError::InvalidKeyLength(other)),
    };
    opened
        .map(Zeroizing::new)
        .map_err(|_| CipherError::DecryptionFailure)
}

// ── Level 3: AES-CBC wrapped in an HMAC-SHA256 tag ──────────────────────────

pub fn encrypt_pqc_hybrid(text: &str, key: &[u8]) -> Result<String, CipherError> {
    let payload = encrypt_aes(text, key)?;
    let signature = general_purpose::STANDARD.encode(packet_tag(key, &payload)?);
    Ok(Packet::Pqc {
        signature: &signature,
        payload: &payload,
    }
    .to_string())
}

pub fn decrypt_pqc_hybrid(wire: &str, key: &[u8]) -> Result<String, CipherError> {
    match Packet::parse(ProtocolLevel::PqcHybrid, wire)? {
        Packet::Pqc { signature, payload } => pqc_open(signature, payload, key),
        _ => Err(CipherError::InvalidProtocolFormat("expected PQC packet")),
    }
}

fn pqc_open(signature: &str, payload: &str, key: &[u8]) -> Result<String, CipherError> {
    check_aes_key(key)?;
    let expected = general_purpose::STANDARD.encode(packet_tag(key, payload)?);
    if !bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
        warn!("pqc packet failed integrity check");
        return Err(CipherError::IntegrityViolation);
    }
    aes_open(payload, key)
}

fn packet_tag(key: &[u8], payload: &str) -> Result<Zeroizing<[u8; 32]>, CipherError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
    mac.update(payload.as_bytes());
    Ok(Zeroizing::new(mac.finalize().into_bytes().into()))
}

// ── Level 4: no confidentiality ─────────────────────────────────────────────

pub fn encode_plaintext(text: &str) -> String {
    let body = general_purpose::STANDARD.encode(text.as_bytes());
    Packet::Plain(&body).to_string()
}

pub fn decode_plaintext(wire: &str) -> Result<String, CipherError> {
    match Packet::parse(ProtocolLevel::Plaintext, wire)? {
        Packet::Plain(body) => plain_open(body),
        _ => Err(CipherError::InvalidProtocolFormat("expected plaintext packet")),
    }
}

fn plain_open(body: &str) -> Result<String, CipherError> {
    let bytes = general_purpose::STANDARD
        .decode(body)
        .map_err(|_| CipherError::MalformedEncoding("plaintext"))?;
    String::from_utf8(bytes).map_err(|_| CipherError::MalformedEncoding("plaintext"))
}
