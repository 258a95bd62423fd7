use crate::error::{ChatError, Result};
use anyhow::bail;
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, NewAead};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use once_cell::sync::OnceCell;
use rand::rngs::OsRng;
use rand::RngCore;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use zeroize::Zeroizing;

const SEAL_VERSION: u8 = 1;
const KEYSTORE_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;

/// Argon2id cost for the passphrase keystore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub mem_kib: u32,
    pub time_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self { mem_kib: 256 * 1024, time_cost: 3 }
    }
}

// -----------------------------------------------------------------------------
// Unified passphrase handling (cached once per process)
// -----------------------------------------------------------------------------
static UNIFIED_PASSPHRASE: OnceCell<Zeroizing<String>> = OnceCell::new();

/// Obtain the keystore pass-phrase.
/// Source order:
///   1) CHAINCHAT_PASSPHRASE env var
///   2) Interactive prompt (only once per process)
/// Non-interactive without env returns an error.
pub fn unified_passphrase(prompt: Option<&str>) -> anyhow::Result<Zeroizing<String>> {
    if let Some(existing) = UNIFIED_PASSPHRASE.get() {
        return Ok(existing.clone());
    }
    if let Ok(val) = std::env::var("CHAINCHAT_PASSPHRASE") {
        let z = Zeroizing::new(val);
        let _ = UNIFIED_PASSPHRASE.set(z.clone());
        return Ok(z);
    }
    if atty::is(atty::Stream::Stdin) {
        let text = prompt.unwrap_or("Enter keystore pass-phrase: ");
        let pw = rpassword::prompt_password(text)?;
        let z = Zeroizing::new(pw);
        let _ = UNIFIED_PASSPHRASE.set(z.clone());
        return Ok(z);
    }
    bail!("CHAINCHAT_PASSPHRASE is required in non-interactive mode")
}

fn cipher(key: &[u8; 32]) -> XChaCha20Poly1305 {
    XChaCha20Poly1305::new(Key::from_slice(key))
}

/// Encrypt local state under the 32-byte storage key: `version || nonce || ciphertext`.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher(key)
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| ChatError::Storage("sealing failed".into()))?;

    let mut out = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
    out.push(SEAL_VERSION);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if sealed.len() < 1 + NONCE_LEN || sealed[0] != SEAL_VERSION {
        return Err(ChatError::Storage("unrecognised sealed record".into()));
    }
    let (nonce, ciphertext) = sealed[1..].split_at(NONCE_LEN);
    cipher(key)
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| ChatError::Storage("sealed record failed authentication".into()))
}

fn derive_passphrase_key(passphrase: &str, salt: &[u8], params: KdfParams) -> Result<Zeroizing<[u8; 32]>> {
    let argon = Params::new(params.mem_kib, params.time_cost, 1, None)
        .map_err(|e| ChatError::Storage(format!("Invalid Argon2id params: {e}")))?;
    let mut key = Zeroizing::new([0u8; 32]);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, argon)
        .hash_password_into(passphrase.as_bytes(), salt, &mut key[..])
        .map_err(|e| ChatError::Storage(format!("Argon2id key derivation failed: {e}")))?;
    Ok(key)
}

/// Seal a secret under a pass-phrase.
/// Layout: `version || mem_kib (le) || time_cost (le) || salt || nonce || ciphertext`.
pub fn seal_with_passphrase(passphrase: &str, secret: &[u8], params: KdfParams) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let key = derive_passphrase_key(passphrase, &salt, params)?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher(&key)
        .encrypt(XNonce::from_slice(&nonce), secret)
        .map_err(|_| ChatError::Storage("Failed to encrypt keystore".into()))?;

    let mut out = Vec::with_capacity(9 + SALT_LEN + NONCE_LEN + ciphertext.len());
    out.push(KEYSTORE_VERSION);
    out.extend_from_slice(&params.mem_kib.to_le_bytes());
    out.extend_from_slice(&params.time_cost.to_le_bytes());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn open_with_passphrase(passphrase: &str, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let header = 9 + SALT_LEN + NONCE_LEN;
    if sealed.len() < header {
        return Err(ChatError::Storage("keystore record is truncated".into()));
    }
    if sealed[0] != KEYSTORE_VERSION {
        return Err(ChatError::Storage(format!("Unsupported keystore version: {}", sealed[0])));
    }
    let mut word = [0u8; 4];
    word.copy_from_slice(&sealed[1..5]);
    let mem_kib = u32::from_le_bytes(word);
    word.copy_from_slice(&sealed[5..9]);
    let time_cost = u32::from_le_bytes(word);

    let salt = &sealed[9..9 + SALT_LEN];
    let nonce = &sealed[9 + SALT_LEN..header];
    let key = derive_passphrase_key(passphrase, salt, KdfParams { mem_kib, time_cost })?;
    cipher(&key)
        .decrypt(XNonce::from_slice(nonce), &sealed[header..])
        .map(Zeroizing::new)
        .map_err(|_| ChatError::Storage("Invalid pass-phrase".into()))
}

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Rustls client configuration for the Electrum connection.
pub fn tls_client_config(accept_invalid_certs: bool) -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ChatError::Connection(format!("TLS setup: {e}")))?;

    let config = if accept_invalid_certs {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
            .with_no_client_auth()
    } else {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(root_store).with_no_client_auth()
    };
    Ok(Arc::new(config))
}
