use crate::error::{CredentialError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::digest::{digest, SHA256};
use ring::rand::{SecureRandom, SystemRandom};
use std::fmt;

/// Marks the stored form so a future key scheme can be told apart.
const STORED_PREFIX: &str = "v1:";

/// Seals connection passwords before they reach the store.
///
/// Stored form is `v1:` followed by base64 of `nonce || ciphertext || tag`.
/// The AES-256-GCM key is the SHA-256 digest of the configured secret.
pub struct CredentialCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

impl CredentialCipher {
    pub fn new(secret: &str) -> Result<Self> {
        let key_bytes = digest(&SHA256, secret.as_bytes());
        let unbound =
            UnboundKey::new(&AES_256_GCM, key_bytes.as_ref()).map_err(|_| CredentialError::InvalidKey)?;

        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CredentialError::EncryptFailed)?;

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| CredentialError::EncryptFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);
        Ok(format!("{}{}", STORED_PREFIX, STANDARD.encode(sealed)))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String> {
        let encoded = stored
            .strip_prefix(STORED_PREFIX)
            .ok_or_else(|| CredentialError::Malformed("missing version prefix".to_string()))?;
        let mut sealed = STANDARD
            .decode(encoded)
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;
        if sealed.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(CredentialError::Malformed("value is too short".to_string()).into());
        }

        let mut ciphertext = sealed.split_off(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(&sealed)
            .map_err(|_| CredentialError::Malformed("bad nonce".to_string()))?;
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut ciphertext)
            .map_err(|_| CredentialError::DecryptFailed)?;

        String::from_utf8(plaintext.to_vec())
            .map_err(|e| CredentialError::Malformed(e.to_string()).into())
    }

    /// Encrypts an optional password, keeping `None` as "leave unchanged".
    pub fn seal_optional(&self, password: Option<&str>) -> Result<Option<String>> {
        password.map(|p| self.encrypt(p)).transpose()
    }
}
