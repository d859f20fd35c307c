//! Authenticated encryption with NaCl secretbox (XSalsa20Poly1305)
//!
//! Sealing appends a 16-byte Poly1305 tag. Opening verifies the tag before
//! any plaintext is produced, so a wrong key and a tampered ciphertext fail
//! the same way and no partial plaintext is ever returned.

use crypto_secretbox::aead::generic_array::GenericArray;
use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Nonce, XSalsa20Poly1305};

use crate::error::{ChestError, ErrorCategory, ErrorKind, Result};
use crate::kdf::DerivedKey;
use crate::secure_buffer::SecureBuffer;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 24;

/// Length of the Poly1305 tag appended to every sealed box
pub const TAG_LEN: usize = 16;

fn cipher(key: &DerivedKey) -> XSalsa20Poly1305 {
    XSalsa20Poly1305::new(GenericArray::from_slice(key.as_bytes()))
}

/// Encrypt `plaintext`, returning `plaintext.len() + TAG_LEN` bytes.
pub fn seal(plaintext: &[u8], key: &DerivedKey, nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>> {
    cipher(key)
        .encrypt(&Nonce::from(*nonce), plaintext)
        .map_err(|e| {
            ChestError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::SecretboxFailure,
                format!("encryption failed: {}", e),
            )
        })
}

/// Verify and decrypt a sealed box.
pub fn open(ciphertext: &[u8], key: &DerivedKey, nonce: &[u8; NONCE_LEN]) -> Result<SecureBuffer> {
    if ciphertext.len() < TAG_LEN {
        return Err(ChestError::with_kind(
            ErrorCategory::User,
            ErrorKind::MalformedEnvelope,
            "sealed box shorter than its authentication tag",
        ));
    }

    let plaintext = cipher(key)
        .decrypt(&Nonce::from(*nonce), ciphertext)
        .map_err(|_| {
            ChestError::with_kind(
                ErrorCategory::User,
                ErrorKind::AuthenticationFailed,
                "corrupt input, tampered-with data, or bad password",
            )
        })?;

    Ok(SecureBuffer::from_vec(plaintext))
}
