//! Session crypto (spec §4.2): authenticated encryption of every identifier
//! that crosses the client boundary (composite session ids, event ids).
//!
//! Layout of the base64 payload: `salt(16) || nonce(12) || ciphertext+tag`.
//! The key is derived per-operation from a seed with PBKDF2-HMAC-SHA256 at
//! 100_000 iterations and a fresh random salt, then used once with AES-256-GCM
//! under a fresh random nonce. Encryption always uses the primary seed;
//! decryption tries the primary seed, then an optional fallback seed, so a
//! seed can be rotated without invalidating sessions minted under the old one.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, Nonce, OsRng};
use aes_gcm::{Aes256Gcm, Key};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use pbkdf2::pbkdf2_hmac_array;
use sha2::Sha256;

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
	#[error("ciphertext too short to contain salt and nonce")]
	Truncated,
	#[error("invalid base64 payload")]
	InvalidBase64,
	#[error("decryption failed (bad key, tampered payload, or rotated seed)")]
	DecryptionFailed,
	#[error("invalid utf-8 plaintext")]
	InvalidUtf8,
	#[error("encryption failed")]
	EncryptionFailed,
}

#[derive(Clone)]
pub struct SessionCrypto {
	primary: String,
	fallback: Option<String>,
}

impl SessionCrypto {
	pub fn new(primary: impl Into<String>, fallback: Option<String>) -> Self {
		Self {
			primary: primary.into(),
			fallback,
		}
	}

	fn derive_key(seed: &str, salt: &[u8; SALT_LEN]) -> Key<Aes256Gcm> {
		let bytes = pbkdf2_hmac_array::<Sha256, 32>(seed.as_bytes(), salt, PBKDF2_ITERATIONS);
		Key::<Aes256Gcm>::from(bytes)
	}

	/// Encrypts `plaintext` under the primary seed, returning a standard
	/// base64-padded string safe to hand to the client.
	pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
		let salt: [u8; SALT_LEN] = rand::random();
		let key = Self::derive_key(&self.primary, &salt);
		let cipher = Aes256Gcm::new(&key);
		let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
		// A fresh random nonce per encryption is required for AES-GCM's
		// confidentiality guarantees; reuse under the same key is catastrophic.
		let ciphertext = cipher
			.encrypt(&nonce, plaintext.as_bytes())
			.map_err(|_| CryptoError::EncryptionFailed)?;

		let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
		out.extend_from_slice(&salt);
		out.extend_from_slice(nonce.as_slice());
		out.extend_from_slice(&ciphertext);
		Ok(STANDARD.encode(out))
	}

	/// Decrypts `payload`, trying the primary seed and then the fallback seed
	/// (if configured) before giving up.
	pub fn decrypt(&self, payload: &str) -> Result<String, CryptoError> {
		let raw = STANDARD
			.decode(payload)
			.map_err(|_| CryptoError::InvalidBase64)?;
		if raw.len() < SALT_LEN + NONCE_LEN {
			return Err(CryptoError::Truncated);
		}
		let salt: [u8; SALT_LEN] = raw[..SALT_LEN].try_into().expect("checked length");
		let nonce = Nonce::<Aes256Gcm>::from_slice(&raw[SALT_LEN..SALT_LEN + NONCE_LEN]);
		let ciphertext = &raw[SALT_LEN + NONCE_LEN..];

		for seed in std::iter::once(&self.primary).chain(self.fallback.iter()) {
			let key = Self::derive_key(seed, &salt);
			let cipher = Aes256Gcm::new(&key);
			if let Ok(plaintext) = cipher.decrypt(nonce, ciphertext) {
				return String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidUtf8);
			}
		}
		Err(CryptoError::DecryptionFailed)
	}
}
