//! Envelope encoding: inner header, key derivation, sealing and the on-disk layout
//!
//! The inner plaintext that gets sealed is:
//! - metadata tag: 1 byte (1 = file, 2 = message)
//! - body length: 8 bytes (little-endian u64)
//! - body: variable length
//!
//! The serialized envelope is:
//! - salt length: 8 bytes (little-endian u64, always 16)
//! - salt: 16 bytes
//! - nonce length: 8 bytes (little-endian u64, always 24)
//! - nonce: 24 bytes
//! - ciphertext length: 8 bytes (little-endian u64)
//! - ciphertext: variable length (includes 16-byte Poly1305 MAC)
//!
//! There is no magic number or version byte. Readers insist on the exact
//! salt and nonce lengths above, which is where a future format can diverge.

use rand::TryRngCore;
use rand::rngs::OsRng;
use tracing::debug;

use crate::error::{ChestError, ErrorCategory, ErrorKind, Result};
use crate::kdf::{self, KdfParams, SALT_LEN};
use crate::secretcrypt::{self, NONCE_LEN, TAG_LEN};
use crate::secure_buffer::SecureBuffer;

/// Width of every length field, inner and outer.
const LEN_FIELD: usize = size_of::<u64>();

/// Inner header: metadata tag followed by the body length.
pub const HEADER_LEN: usize = 1 + LEN_FIELD;

/// Smallest valid ciphertext: an empty body still carries header and tag.
const MIN_CIPHERTEXT_LEN: usize = HEADER_LEN + TAG_LEN;

/// What kind of payload an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Metadata {
    File = 1,
    Message = 2,
}

impl Metadata {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Metadata::File),
            2 => Some(Metadata::Message),
            _ => None,
        }
    }
}

/// One sealed unit: salt, nonce and ciphertext. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    salt: [u8; SALT_LEN],
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

/// The result of opening an envelope.
#[derive(Debug)]
pub struct Opened {
    pub metadata: Metadata,
    pub body: SecureBuffer,
}

impl Envelope {
    pub fn salt(&self) -> &[u8; SALT_LEN] {
        &self.salt
    }

    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Length of [`Envelope::to_bytes`] output.
    pub fn serialized_len(&self) -> usize {
        3 * LEN_FIELD + SALT_LEN + NONCE_LEN + self.ciphertext.len()
    }

    /// Serialize in the fixed field order described in the module docs.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut output = Vec::with_capacity(self.serialized_len());
        write_field(&mut output, &self.salt);
        write_field(&mut output, &self.nonce);
        write_field(&mut output, &self.ciphertext);
        output
    }

    /// Parse a serialized envelope, validating every declared length
    /// against the bytes actually present before copying anything.
    pub fn from_bytes(input: &[u8]) -> Result<Self> {
        let mut reader = FieldReader { input, pos: 0 };

        let salt_len = reader.read_len("salt")?;
        if salt_len != SALT_LEN as u64 {
            return Err(malformed(format!(
                "unsupported salt length {} (expected {})",
                salt_len, SALT_LEN
            )));
        }
        let salt: [u8; SALT_LEN] = reader.read_array("salt")?;

        let nonce_len = reader.read_len("nonce")?;
        if nonce_len != NONCE_LEN as u64 {
            return Err(malformed(format!(
                "unsupported nonce length {} (expected {})",
                nonce_len, NONCE_LEN
            )));
        }
        let nonce: [u8; NONCE_LEN] = reader.read_array("nonce")?;

        let ciphertext_len = reader.read_len("ciphertext")?;
        if ciphertext_len > reader.remaining() as u64 {
            return Err(malformed(
                "truncated or corrupt input; claimed ciphertext length greater than available input",
            ));
        }
        let ciphertext_len = ciphertext_len as usize;
        if ciphertext_len < MIN_CIPHERTEXT_LEN {
            return Err(malformed(format!(
                "ciphertext of {} bytes cannot hold a header and tag",
                ciphertext_len
            )));
        }
        let ciphertext = reader.take(ciphertext_len, "ciphertext")?.to_vec();

        if reader.remaining() > 0 {
            return Err(malformed("invalid input: unexpected data after ciphertext"));
        }

        Ok(Self {
            salt,
            nonce,
            ciphertext,
        })
    }
}

/// Seal `body` under `password` with a fresh random salt and nonce.
pub fn encode(body: &[u8], metadata: Metadata, password: &[u8]) -> Result<Envelope> {
    let mut salt = [0u8; SALT_LEN];
    fill_random(&mut salt, "salt")?;

    let mut nonce = [0u8; NONCE_LEN];
    fill_random(&mut nonce, "nonce")?;

    encode_deterministic(body, metadata, password, &salt, &nonce)
}

/// Seal `body` with a caller-chosen salt and nonce.
///
/// This function is ONLY for testing purposes to generate deterministic output.
/// NEVER use this in production - always use `encode()` which generates random salt/nonce.
pub fn encode_deterministic(
    body: &[u8],
    metadata: Metadata,
    password: &[u8],
    salt: &[u8; SALT_LEN],
    nonce: &[u8; NONCE_LEN],
) -> Result<Envelope> {
    seal_with(body, metadata, password, salt, nonce, &KdfParams::INTERACTIVE)
}

pub(crate) fn seal_with(
    body: &[u8],
    metadata: Metadata,
    password: &[u8],
    salt: &[u8; SALT_LEN],
    nonce: &[u8; NONCE_LEN],
    params: &KdfParams,
) -> Result<Envelope> {
    let inner = build_inner(body, metadata);
    let key = kdf::derive_key_with(password, salt, params)?;
    let ciphertext = secretcrypt::seal(&inner, &key, nonce)?;

    debug!(
        metadata = ?metadata,
        body_len = body.len(),
        ciphertext_len = ciphertext.len(),
        "envelope sealed"
    );

    Ok(Envelope {
        salt: *salt,
        nonce: *nonce,
        ciphertext,
    })
}

/// Open an envelope, authenticating it and splitting off the inner header.
pub fn decode(envelope: &Envelope, password: &[u8]) -> Result<Opened> {
    open_with(envelope, password, &KdfParams::INTERACTIVE)
}

pub(crate) fn open_with(envelope: &Envelope, password: &[u8], params: &KdfParams) -> Result<Opened> {
    let key = kdf::derive_key_with(password, &envelope.salt, params)?;
    let inner = secretcrypt::open(&envelope.ciphertext, &key, &envelope.nonce)?;
    let opened = parse_inner(&inner)?;

    debug!(
        metadata = ?opened.metadata,
        body_len = opened.body.len(),
        "envelope opened"
    );
    Ok(opened)
}

fn build_inner(body: &[u8], metadata: Metadata) -> SecureBuffer {
    let mut inner = SecureBuffer::with_capacity(HEADER_LEN + body.len());
    inner.extend_from_slice(&[metadata.as_byte()]);
    inner.extend_from_slice(&(body.len() as u64).to_le_bytes());
    inner.extend_from_slice(body);
    inner
}

fn parse_inner(inner: &[u8]) -> Result<Opened> {
    if inner.len() < HEADER_LEN {
        return Err(malformed("decrypted payload shorter than its header"));
    }
    let metadata = Metadata::from_byte(inner[0])
        .ok_or_else(|| malformed(format!("unknown metadata tag {}", inner[0])))?;

    let mut len_bytes = [0u8; LEN_FIELD];
    len_bytes.copy_from_slice(&inner[1..HEADER_LEN]);
    let declared = u64::from_le_bytes(len_bytes);

    let body = &inner[HEADER_LEN..];
    if declared != body.len() as u64 {
        return Err(malformed(format!(
            "declared body length {} does not match the {} bytes present",
            declared,
            body.len()
        )));
    }

    Ok(Opened {
        metadata,
        body: SecureBuffer::from_slice(body),
    })
}

fn fill_random(buf: &mut [u8], what: &str) -> Result<()> {
    OsRng.try_fill_bytes(buf).map_err(|e| {
        ChestError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::RandomnessUnavailable,
            format!("failed to generate random {}", what),
            e,
        )
    })
}

fn write_field(output: &mut Vec<u8>, field: &[u8]) {
    output.extend_from_slice(&(field.len() as u64).to_le_bytes());
    output.extend_from_slice(field);
}

fn malformed(msg: impl Into<String>) -> ChestError {
    ChestError::with_kind(ErrorCategory::User, ErrorKind::MalformedEnvelope, msg)
}

struct FieldReader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn remaining(&self) -> usize {
        self.input.len() - self.pos
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(malformed(format!(
                "input likely truncated while reading {}",
                what
            )));
        }
        let input = self.input;
        let slice = &input[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_len(&mut self, what: &str) -> Result<u64> {
        let bytes = self.read_array::<LEN_FIELD>(what)?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn read_array<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT_OFFSET: usize = LEN_FIELD;
    const NONCE_OFFSET: usize = SALT_OFFSET + SALT_LEN + LEN_FIELD;
    const CT_LEN_OFFSET: usize = NONCE_OFFSET + NONCE_LEN;
    const CT_OFFSET: usize = CT_LEN_OFFSET + LEN_FIELD;

    fn fixed(body: &[u8], metadata: Metadata, password: &[u8]) -> Envelope {
        encode_deterministic(body, metadata, password, &[0x42; SALT_LEN], &[0x24; NONCE_LEN])
            .unwrap()
    }

    #[test]
    fn test_scenario_message_roundtrip_through_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("hello.chest");

        let envelope = encode(b"hello", Metadata::Message, b"correct-horse").unwrap();
        std::fs::write(&path, envelope.to_bytes()).unwrap();

        let stored = Envelope::from_bytes(&std::fs::read(&path).unwrap()).unwrap();
        let opened = decode(&stored, b"correct-horse").unwrap();
        assert_eq!(opened.metadata, Metadata::Message);
        assert_eq!(opened.body.as_slice(), b"hello");

        let err = decode(&stored, b"wrong-password").expect_err("expected authentication failure");
        assert_eq!(err.kind, Some(ErrorKind::AuthenticationFailed));
    }

    #[test]
    fn test_empty_body() {
        let envelope = encode(b"", Metadata::File, b"test").unwrap();
        assert_eq!(envelope.ciphertext().len(), HEADER_LEN + TAG_LEN);

        let parsed = Envelope::from_bytes(&envelope.to_bytes()).unwrap();
        let opened = decode(&parsed, b"test").unwrap();
        assert_eq!(opened.metadata, Metadata::File);
        assert!(opened.body.is_empty());
    }

    #[test]
    fn test_body_with_embedded_terminators() {
        let body = b"line one\n\0line two\0\n";
        let opened = decode(&fixed(body, Metadata::Message, b"pw"), b"pw").unwrap();
        assert_eq!(opened.body.as_slice(), body);
    }

    #[test]
    fn test_fresh_salt_and_nonce_per_encryption() {
        let a = encode(b"same body", Metadata::Message, b"same password").unwrap();
        let b = encode(b"same body", Metadata::Message, b"same password").unwrap();

        assert_ne!(a.salt(), b.salt());
        assert_ne!(a.nonce(), b.nonce());
        assert_ne!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn test_deterministic_layout() {
        let envelope = fixed(b"test payload", Metadata::File, b"test");
        let bytes = envelope.to_bytes();

        assert_eq!(bytes.len(), envelope.serialized_len());
        assert_eq!(&bytes[..SALT_OFFSET], &16u64.to_le_bytes());
        assert_eq!(&bytes[SALT_OFFSET..SALT_OFFSET + SALT_LEN], &[0x42; SALT_LEN]);
        assert_eq!(&bytes[SALT_OFFSET + SALT_LEN..NONCE_OFFSET], &24u64.to_le_bytes());
        assert_eq!(&bytes[NONCE_OFFSET..CT_LEN_OFFSET], &[0x24; NONCE_LEN]);

        let expected_ct_len = (HEADER_LEN + b"test payload".len() + TAG_LEN) as u64;
        assert_eq!(&bytes[CT_LEN_OFFSET..CT_OFFSET], &expected_ct_len.to_le_bytes());
        assert_eq!(bytes.len(), CT_OFFSET + expected_ct_len as usize);

        // Same inputs, same bytes.
        assert_eq!(bytes, fixed(b"test payload", Metadata::File, b"test").to_bytes());
    }

    #[test]
    fn test_ciphertext_bit_flip_fails_authentication() {
        let bytes = fixed(b"hello", Metadata::Message, b"pw").to_bytes();
        for offset in [CT_OFFSET, CT_OFFSET + HEADER_LEN, bytes.len() - 1] {
            let mut tampered = bytes.clone();
            tampered[offset] ^= 0x01;
            let envelope = Envelope::from_bytes(&tampered).unwrap();
            let err = decode(&envelope, b"pw").expect_err("tampered ciphertext must not open");
            assert_eq!(err.kind, Some(ErrorKind::AuthenticationFailed));
        }
    }

    #[test]
    fn test_salt_and_nonce_bit_flip_fails_authentication() {
        let bytes = fixed(b"hello", Metadata::Message, b"pw").to_bytes();
        for offset in [SALT_OFFSET, NONCE_OFFSET + NONCE_LEN - 1] {
            let mut tampered = bytes.clone();
            tampered[offset] ^= 0x80;
            let envelope = Envelope::from_bytes(&tampered).unwrap();
            let err = decode(&envelope, b"pw").expect_err("tampered envelope must not open");
            assert_eq!(err.kind, Some(ErrorKind::AuthenticationFailed));
        }
    }

    #[test]
    fn test_truncated_inputs() {
        let bytes = fixed(b"hello", Metadata::Message, b"pw").to_bytes();
        for cut in [0, 3, SALT_OFFSET + 2, NONCE_OFFSET - 1, CT_LEN_OFFSET + 4, bytes.len() - 1] {
            let err = Envelope::from_bytes(&bytes[..cut]).expect_err("expected truncation error");
            assert_eq!(err.kind, Some(ErrorKind::MalformedEnvelope), "cut at {}", cut);
        }
    }

    #[test]
    fn test_declared_length_exceeds_available() {
        let mut bytes = fixed(b"hello", Metadata::Message, b"pw").to_bytes();
        bytes[CT_LEN_OFFSET..CT_OFFSET].copy_from_slice(&u64::MAX.to_le_bytes());

        let err = Envelope::from_bytes(&bytes).expect_err("expected bound check failure");
        assert_eq!(err.kind, Some(ErrorKind::MalformedEnvelope));
        assert!(err.message().contains("claimed ciphertext length greater than available input"));
    }

    #[test]
    fn test_unexpected_salt_length() {
        let mut bytes = fixed(b"hello", Metadata::Message, b"pw").to_bytes();
        bytes[..SALT_OFFSET].copy_from_slice(&(1u64 << 40).to_le_bytes());

        let err = Envelope::from_bytes(&bytes).expect_err("expected salt length rejection");
        assert_eq!(err.kind, Some(ErrorKind::MalformedEnvelope));
    }

    #[test]
    fn test_unexpected_nonce_length() {
        let mut bytes = fixed(b"hello", Metadata::Message, b"pw").to_bytes();
        bytes[SALT_OFFSET + SALT_LEN..NONCE_OFFSET].copy_from_slice(&12u64.to_le_bytes());

        let err = Envelope::from_bytes(&bytes).expect_err("expected nonce length rejection");
        assert_eq!(err.kind, Some(ErrorKind::MalformedEnvelope));
    }

    #[test]
    fn test_ciphertext_too_short_for_header() {
        let mut bytes = fixed(b"", Metadata::Message, b"pw").to_bytes();
        let short = (TAG_LEN as u64).to_le_bytes();
        bytes[CT_LEN_OFFSET..CT_OFFSET].copy_from_slice(&short);
        bytes.truncate(CT_OFFSET + TAG_LEN);

        let err = Envelope::from_bytes(&bytes).expect_err("expected rejection");
        assert_eq!(err.kind, Some(ErrorKind::MalformedEnvelope));
    }

    #[test]
    fn test_trailing_data() {
        let mut bytes = fixed(b"hello", Metadata::Message, b"pw").to_bytes();
        bytes.push(0xFF);

        let err = Envelope::from_bytes(&bytes).expect_err("expected trailing data error");
        assert_eq!(err.kind, Some(ErrorKind::MalformedEnvelope));
        assert!(err.message().contains("unexpected data after ciphertext"));
    }

    #[test]
    fn test_inner_header_validation() {
        let mut inner = build_inner(b"abc", Metadata::File).as_slice().to_vec();
        assert!(parse_inner(&inner).is_ok());

        inner[0] = 7;
        let err = parse_inner(&inner).expect_err("expected unknown tag");
        assert_eq!(err.kind, Some(ErrorKind::MalformedEnvelope));

        let mut inner = build_inner(b"abc", Metadata::File).as_slice().to_vec();
        inner[1..HEADER_LEN].copy_from_slice(&4u64.to_le_bytes());
        let err = parse_inner(&inner).expect_err("expected length mismatch");
        assert_eq!(err.kind, Some(ErrorKind::MalformedEnvelope));

        let err = parse_inner(&[Metadata::File.as_byte(), 0, 0]).expect_err("expected short");
        assert_eq!(err.kind, Some(ErrorKind::MalformedEnvelope));
    }

    #[test]
    fn test_key_derivation_failure_is_propagated() {
        // Argon2id rejects a memory cost below 8 KiB per lane.
        let broken = KdfParams {
            mem_cost_kib: 1,
            time_cost: 1,
            parallelism: 1,
        };

        let err = seal_with(b"hello", Metadata::Message, b"pw", &[1; SALT_LEN], &[2; NONCE_LEN], &broken)
            .expect_err("sealing must fail");
        assert_eq!(err.kind, Some(ErrorKind::KeyDerivationFailed));

        let envelope = fixed(b"hello", Metadata::Message, b"pw");
        let err = open_with(&envelope, b"pw", &broken).expect_err("opening must fail");
        assert_eq!(err.kind, Some(ErrorKind::KeyDerivationFailed));
    }

    #[test]
    fn test_metadata_bytes() {
        assert_eq!(Metadata::File.as_byte(), 1);
        assert_eq!(Metadata::Message.as_byte(), 2);
        assert_eq!(Metadata::from_byte(1), Some(Metadata::File));
        assert_eq!(Metadata::from_byte(2), Some(Metadata::Message));
        assert_eq!(Metadata::from_byte(0), None);
        assert_eq!(Metadata::from_byte(3), None);
    }
}
