//! Session keys, address derivation and the local-storage key.

use crate::error::{ChatError, Result};
use bitcoin::bech32::{self, Fe32, Hrp};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{base58, Script, ScriptBuf};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

const STORAGE_KEY_CONTEXT: &str = "chainchat local storage v1";
const WIF_COMPRESSED_FLAG: u8 = 0x01;

/// Network constants for address and key encodings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainParams {
    pub name: String,
    pub bech32_hrp: String,
    pub pubkey_hash: u8,
    pub script_hash: u8,
    pub wif: u8,
    /// 4-byte ASCII tag prefixed to every OP_RETURN chat payload.
    pub message_tag: [u8; 4],
}

impl ChainParams {
    pub fn palladium() -> Self {
        Self {
            name: "palladium".into(),
            bech32_hrp: "plm".into(),
            pubkey_hash: 55,
            script_hash: 5,
            wif: 128,
            message_tag: *b"PLMC",
        }
    }

    pub fn bitcoin() -> Self {
        Self {
            name: "bitcoin".into(),
            bech32_hrp: "bc".into(),
            pubkey_hash: 0,
            script_hash: 5,
            wif: 128,
            message_tag: *b"PLMC",
        }
    }

    pub fn testnet() -> Self {
        Self {
            name: "testnet".into(),
            bech32_hrp: "tb".into(),
            pubkey_hash: 111,
            script_hash: 196,
            wif: 239,
            message_tag: *b"PLMC",
        }
    }

    pub fn regtest() -> Self {
        Self { name: "regtest".into(), bech32_hrp: "bcrt".into(), ..Self::testnet() }
    }

    /// Parse from the config string. Unknown names fall back to palladium.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "bitcoin" | "mainnet" | "main" => Self::bitcoin(),
            "testnet" | "test" => Self::testnet(),
            "regtest" | "reg" => Self::regtest(),
            _ => Self::palladium(),
        }
    }

    /// WIF version bytes tried on import, in order.
    pub fn wif_candidates(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3);
        for v in [self.wif, 128, 239] {
            if !out.contains(&v) {
                out.push(v);
            }
        }
        out
    }
}

/// secp256k1 keypair owned by one wallet session.
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    fn from_secret(secret: SecretKey) -> Self {
        let secp = Secp256k1::signing_only();
        let public = PublicKey::from_secret_key(&secp, &secret);
        Self { secret, public }
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Lowercase hex of the compressed public key; this is the contact id others use for us.
    pub fn public_hex(&self) -> String {
        hex::encode(self.public.serialize())
    }

    /// Compressed WIF under the given chain's version byte.
    pub fn to_wif(&self, params: &ChainParams) -> Zeroizing<String> {
        let mut payload = Zeroizing::new(Vec::with_capacity(34));
        payload.push(params.wif);
        payload.extend_from_slice(&self.secret.secret_bytes());
        payload.push(WIF_COMPRESSED_FLAG);
        Zeroizing::new(base58::encode_check(&payload))
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        self.secret.non_secure_erase();
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair").field("public", &self.public_hex()).finish_non_exhaustive()
    }
}

/// Fresh random keypair.
pub fn generate() -> KeyPair {
    loop {
        let mut bytes = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut bytes[..]);
        // Out-of-range scalars are astronomically rare; just draw again.
        if let Ok(secret) = SecretKey::from_slice(&bytes[..]) {
            return KeyPair::from_secret(secret);
        }
    }
}

/// Import a WIF, trying each of the chain's candidate version bytes in turn.
pub fn import(wif: &str, params: &ChainParams) -> Result<KeyPair> {
    let decoded = Zeroizing::new(
        base58::decode_check(wif.trim())
            .map_err(|e| ChatError::InvalidKeyFormat(format!("base58: {e}")))?,
    );

    let mut last_error = String::from("no candidate version bytes");
    for version in params.wif_candidates() {
        match decode_wif_payload(&decoded, version) {
            Ok(secret) => return Ok(KeyPair::from_secret(secret)),
            Err(e) => last_error = e,
        }
    }
    Err(ChatError::InvalidKeyFormat(last_error))
}

fn decode_wif_payload(payload: &[u8], version: u8) -> std::result::Result<SecretKey, String> {
    let key_bytes = match payload.len() {
        33 => &payload[1..33],
        34 if payload[33] == WIF_COMPRESSED_FLAG => &payload[1..33],
        34 => return Err(format!("bad compression flag 0x{:02x}", payload[33])),
        n => return Err(format!("unexpected payload length {n}")),
    };
    if payload[0] != version {
        return Err(format!("version byte {} does not match {}", payload[0], version));
    }
    SecretKey::from_slice(key_bytes).map_err(|e| e.to_string())
}

/// Parse a 33- or 65-byte hex public key.
pub fn parse_public_key(hex_str: &str) -> Result<PublicKey> {
    let trimmed = hex_str.trim();
    if trimmed.len() != 66 && trimmed.len() != 130 {
        return Err(ChatError::InvalidPublicKey(
            "must be 66 or 130 hex characters".into(),
        ));
    }
    let bytes = hex::decode(trimmed).map_err(|e| ChatError::InvalidPublicKey(e.to_string()))?;
    PublicKey::from_slice(&bytes).map_err(|e| ChatError::InvalidPublicKey(e.to_string()))
}

/// True if the bytes encode a point on the curve.
pub fn is_valid_point(bytes: &[u8]) -> bool {
    PublicKey::from_slice(bytes).is_ok()
}

/// P2WPKH output script for a public key (always the compressed form).
pub fn p2wpkh_script(pubkey: &PublicKey) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&CompressedPublicKey(*pubkey).wpubkey_hash())
}

/// Address of the single fixed script template (P2WPKH).
pub fn derive_address(pubkey: &PublicKey, params: &ChainParams) -> String {
    // P2WPKH scripts always encode as a witness program.
    address_from_script(&p2wpkh_script(pubkey), params).unwrap_or_default()
}

/// Render an output script as an address, if it is a standard template.
pub fn address_from_script(script: &Script, params: &ChainParams) -> Option<String> {
    let bytes = script.as_bytes();
    if script.is_witness_program() {
        let version = match bytes[0] {
            0x00 => 0u8,
            op @ 0x51..=0x60 => op - 0x50,
            _ => return None,
        };
        let hrp = Hrp::parse(&params.bech32_hrp).ok()?;
        let fe = Fe32::try_from(version).ok()?;
        return bech32::segwit::encode(hrp, fe, &bytes[2..]).ok();
    }
    if script.is_p2pkh() {
        let mut data = Vec::with_capacity(21);
        data.push(params.pubkey_hash);
        data.extend_from_slice(&bytes[3..23]);
        return Some(base58::encode_check(&data));
    }
    if script.is_p2sh() {
        let mut data = Vec::with_capacity(21);
        data.push(params.script_hash);
        data.extend_from_slice(&bytes[2..22]);
        return Some(base58::encode_check(&data));
    }
    None
}

/// Electrum scripthash: sha256 of the output script, byte-reversed, hex.
pub fn scripthash(script: &Script) -> String {
    let mut hash = sha256::Hash::hash(script.as_bytes()).to_byte_array();
    hash.reverse();
    hex::encode(hash)
}

/// Symmetric key for sealing locally persisted state. Never leaves the device.
pub fn derive_storage_key(secret: &SecretKey) -> Zeroizing<[u8; 32]> {
    let raw = Zeroizing::new(secret.secret_bytes());
    Zeroizing::new(blake3::derive_key(STORAGE_KEY_CONTEXT, &raw[..]))
}
