//! AES-256 entry encryption (WinZip AE-2).
//!
//! - AES-256-CTR keystream over the compressed entry payload
//! - PBKDF2-HMAC-SHA1 key derivation, 1000 iterations, 16-byte random salt
//! - 2-byte password verifier written after the salt
//! - 10-byte authentication code (truncated HMAC-SHA1) trailing the data
//!
//! AE-2 stores no CRC for encrypted entries; integrity comes from the
//! authentication code.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;

use crate::error::{Result, ZipError};

type HmacSha1 = Hmac<Sha1>;
type Aes256Ctr = Ctr128BE<Aes256>;

/// Salt length for AES-256 per the WinZip spec.
pub const SALT_LEN: usize = 16;
/// Password-verifier length.
pub const VERIFY_LEN: usize = 2;
/// Truncated HMAC-SHA1 authentication code length.
pub const AUTH_CODE_LEN: usize = 10;
/// WinZip strength code for AES-256.
pub const WINZIP_AES256: u8 = 0x03;

const KEY_LEN: usize = 32;
const PBKDF2_ROUNDS: u32 = 1000;

struct DerivedKeys {
    cipher: Aes256Ctr,
    hmac: HmacSha1,
    verifier: [u8; VERIFY_LEN],
}

fn derive_keys(password: &str, salt: &[u8]) -> Result<DerivedKeys> {
    let mut material = [0u8; KEY_LEN * 2 + VERIFY_LEN];
    pbkdf2_hmac::<Sha1>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut material);

    let enc_key = &material[..KEY_LEN];
    let auth_key = &material[KEY_LEN..KEY_LEN * 2];
    let verifier = [material[KEY_LEN * 2], material[KEY_LEN * 2 + 1]];

    let iv = [0u8; 16];
    let cipher = Aes256Ctr::new(enc_key.into(), (&iv).into());
    let hmac = HmacSha1::new_from_slice(auth_key)
        .map_err(|e| ZipError::EncryptionError(format!("HMAC init failed: {}", e)))?;

    Ok(DerivedKeys {
        cipher,
        hmac,
        verifier,
    })
}

/// Streaming encryptor for one entry's payload.
pub struct EntryEncryptor {
    salt: [u8; SALT_LEN],
    keys: DerivedKeys,
}

impl EntryEncryptor {
    pub fn new(password: &str) -> Result<Self> {
        let mut salt = [0u8; SALT_LEN];
        getrandom::getrandom(&mut salt)
            .map_err(|e| ZipError::EncryptionError(format!("salt generation failed: {}", e)))?;
        let keys = derive_keys(password, &salt)?;
        Ok(EntryEncryptor { salt, keys })
    }

    /// Salt to write before the ciphertext.
    pub fn salt(&self) -> &[u8; SALT_LEN] {
        &self.salt
    }

    /// Verifier bytes to write after the salt.
    pub fn password_verifier(&self) -> [u8; VERIFY_LEN] {
        self.keys.verifier
    }

    /// Encrypt the next chunk in place. Chunks must be fed in stream order.
    pub fn encrypt(&mut self, data: &mut [u8]) {
        self.keys.hmac.update(data);
        self.keys.cipher.apply_keystream(data);
    }

    /// Final authentication code, written after the ciphertext.
    pub fn finalize(self) -> [u8; AUTH_CODE_LEN] {
        let mac = self.keys.hmac.finalize().into_bytes();
        let mut code = [0u8; AUTH_CODE_LEN];
        code.copy_from_slice(&mac[..AUTH_CODE_LEN]);
        code
    }
}

/// Streaming decryptor for one entry's payload.
pub struct EntryDecryptor {
    keys: DerivedKeys,
}

impl EntryDecryptor {
    /// Derive keys and check the stored password verifier; a mismatch is
    /// reported as an incorrect password before any payload is touched.
    pub fn new(password: &str, salt: &[u8], stored_verifier: &[u8; VERIFY_LEN]) -> Result<Self> {
        if salt.len() != SALT_LEN {
            return Err(ZipError::EncryptionError(format!(
                "invalid salt size: expected {}, got {}",
                SALT_LEN,
                salt.len()
            )));
        }
        let keys = derive_keys(password, salt)?;
        if keys.verifier != *stored_verifier {
            return Err(ZipError::IncorrectPassword);
        }
        Ok(EntryDecryptor { keys })
    }

    /// Decrypt the next chunk in place. Chunks must be fed in stream order.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        self.keys.cipher.apply_keystream(data);
        self.keys.hmac.update(data);
    }

    /// Check the trailing authentication code after the whole payload has
    /// been decrypted.
    pub fn verify_auth_code(self, stored: &[u8]) -> Result<()> {
        let mac = self.keys.hmac.finalize().into_bytes();
        if &mac[..AUTH_CODE_LEN] != stored {
            return Err(ZipError::EncryptionError(
                "authentication failed: data corrupted or wrong password".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let password = "p@ss";
        let plaintext = b"Hello, encrypted world!".repeat(100);

        let mut enc = EntryEncryptor::new(password).unwrap();
        let salt = *enc.salt();
        let verifier = enc.password_verifier();

        let mut data = plaintext.clone();
        // feed in two chunks to exercise keystream continuity
        let split = data.len() / 2;
        let (a, b) = data.split_at_mut(split);
        enc.encrypt(a);
        enc.encrypt(b);
        let auth = enc.finalize();

        assert_ne!(data, plaintext);

        let mut dec = EntryDecryptor::new(password, &salt, &verifier).unwrap();
        dec.decrypt(&mut data);
        dec.verify_auth_code(&auth).unwrap();
        assert_eq!(data, plaintext);
    }

    #[test]
    fn wrong_password_is_detected_by_verifier() {
        let mut enc = EntryEncryptor::new("correct").unwrap();
        let salt = *enc.salt();
        let verifier = enc.password_verifier();
        let mut data = b"secret".to_vec();
        enc.encrypt(&mut data);

        let err = EntryDecryptor::new("wrong", &salt, &verifier);
        assert!(matches!(err, Err(ZipError::IncorrectPassword)));
    }

    #[test]
    fn corrupted_payload_fails_authentication() {
        let mut enc = EntryEncryptor::new("pw").unwrap();
        let salt = *enc.salt();
        let verifier = enc.password_verifier();
        let mut data = b"payload bytes".to_vec();
        enc.encrypt(&mut data);
        let auth = enc.finalize();

        data[0] ^= 0xFF;
        let mut dec = EntryDecryptor::new("pw", &salt, &verifier).unwrap();
        dec.decrypt(&mut data);
        assert!(dec.verify_auth_code(&auth).is_err());
    }

    #[test]
    fn salts_are_unique_per_entry() {
        let a = EntryEncryptor::new("pw").unwrap();
        let b = EntryEncryptor::new("pw").unwrap();
        assert_ne!(a.salt(), b.salt());
    }
}
