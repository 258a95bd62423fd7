//! ECDH key agreement and the `iv:ciphertext` message envelope.

use crate::error::{ChatError, Result};
use crate::keys;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{Scalar, Secp256k1, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LEN: usize = 16;
const SEPARATOR: char = ':';

/// 32-byte key shared between `secret` and the holder of `their_pubkey_hex`.
///
/// The product point is serialized in the same form as the counterparty key
/// (33 or 65 bytes) and SHA-256 is taken over its lowercase hex text.
pub fn shared_secret(secret: &SecretKey, their_pubkey_hex: &str) -> Result<Zeroizing<[u8; 32]>> {
    let trimmed = their_pubkey_hex.trim();
    let raw = hex::decode(trimmed).map_err(|_| ChatError::KeyAgreement)?;
    let compressed = raw.len() == 33;
    let point = bitcoin::secp256k1::PublicKey::from_slice(&raw).map_err(|_| ChatError::KeyAgreement)?;

    let secp = Secp256k1::verification_only();
    let product = point
        .mul_tweak(&secp, &Scalar::from(*secret))
        .map_err(|_| ChatError::KeyAgreement)?;

    let encoded = Zeroizing::new(if compressed {
        hex::encode(product.serialize())
    } else {
        hex::encode(product.serialize_uncompressed())
    });
    Ok(Zeroizing::new(sha256::Hash::hash(encoded.as_bytes()).to_byte_array()))
}

/// AES-256-CBC under the shared key. Returns `hex(iv):base64(ciphertext)`.
pub fn encrypt(plaintext: &str, their_pubkey_hex: &str, secret: &SecretKey) -> Result<String> {
    let key = shared_secret(secret, their_pubkey_hex)?;
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new_from_slices(&key[..], &iv)
        .map_err(|e| ChatError::Decryption(format!("cipher init: {e}")))?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    Ok(format!("{}{}{}", hex::encode(iv), SEPARATOR, STANDARD.encode(ciphertext)))
}

/// Strict decryption of an `iv:ciphertext` payload.
pub fn try_decrypt(payload: &str, their_pubkey_hex: &str, secret: &SecretKey) -> Result<String> {
    let (iv_hex, ct_b64) = payload
        .split_once(SEPARATOR)
        .ok_or_else(|| ChatError::Decryption("missing separator".into()))?;

    let iv = hex::decode(iv_hex).map_err(|e| ChatError::Decryption(format!("iv: {e}")))?;
    if iv.len() != IV_LEN {
        return Err(ChatError::Decryption(format!("iv must be {IV_LEN} bytes, got {}", iv.len())));
    }
    let ciphertext = STANDARD
        .decode(ct_b64.trim())
        .map_err(|e| ChatError::Decryption(format!("base64: {e}")))?;

    let key = shared_secret(secret, their_pubkey_hex)?;
    let plain = Aes256CbcDec::new_from_slices(&key[..], &iv)
        .map_err(|e| ChatError::Decryption(format!("cipher init: {e}")))?
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| ChatError::Decryption("bad padding".into()))?;
    String::from_utf8(plain).map_err(|_| ChatError::Decryption("plaintext is not utf-8".into()))
}

/// Lenient decryption used by the scanner: anything that fails comes back as-is.
pub fn decrypt_or_raw(payload: &str, their_pubkey_hex: &str, secret: &SecretKey) -> String {
    if !payload.contains(SEPARATOR) {
        return payload.to_string();
    }
    match try_decrypt(payload, their_pubkey_hex, secret) {
        Ok(text) => text,
        Err(e) => {
            tracing::debug!("🔓 payload left undecrypted: {e}");
            payload.to_string()
        }
    }
}

/// OP_RETURN body: tag followed by the UTF-8 envelope text.
pub fn encode_envelope(tag: &[u8; 4], envelope: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(tag.len() + envelope.len());
    out.extend_from_slice(tag);
    out.extend_from_slice(envelope.as_bytes());
    out
}

/// Inverse of [`encode_envelope`]. Untagged data is read whole as plaintext.
pub fn parse_envelope(tag: &[u8; 4], data: &[u8]) -> String {
    let body = if data.len() > tag.len() && data.starts_with(tag) {
        &data[tag.len()..]
    } else {
        data
    };
    String::from_utf8_lossy(body).into_owned()
}

/// Validate a recipient key string before any funds move.
pub fn validate_recipient(pubkey_hex: &str) -> Result<()> {
    keys::parse_public_key(pubkey_hex).map(|_| ())
}
