//! Key derivation: password + salt -> 32-byte secretbox key via Argon2id

use std::fmt;
use std::time::Instant;

use argon2::{Algorithm, Argon2, Block, Params, Version};
use tracing::debug;
use zeroize::Zeroize;

use crate::error::{ChestError, ErrorCategory, ErrorKind, Result};

/// Length of the per-envelope salt in bytes
pub const SALT_LEN: usize = 16;

/// Length of derived key in bytes
pub const KEY_LEN: usize = 32;

/// Argon2id work factors.
///
/// These are not recorded in the envelope, so changing [`KdfParams::INTERACTIVE`]
/// makes every existing file undecryptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub mem_cost_kib: u32,
    /// Number of passes over memory
    pub time_cost: u32,
    /// Lanes
    pub parallelism: u32,
}

impl KdfParams {
    /// "Interactive" limits: 64 MiB, two passes, one lane.
    pub const INTERACTIVE: KdfParams = KdfParams {
        mem_cost_kib: 64 * 1024,
        time_cost: 2,
        parallelism: 1,
    };
}

/// Symmetric key material owned by a single encrypt or decrypt call.
///
/// Zeroized on drop.
pub struct DerivedKey {
    bytes: [u8; KEY_LEN],
}

impl DerivedKey {
    pub(crate) fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Derive the envelope key for `password` and `salt` using the interactive work factors.
///
/// Identical inputs always produce the identical key.
pub fn derive_key(password: &[u8], salt: &[u8; SALT_LEN]) -> Result<DerivedKey> {
    derive_key_with(password, salt, &KdfParams::INTERACTIVE)
}

pub(crate) fn derive_key_with(
    password: &[u8],
    salt: &[u8; SALT_LEN],
    params: &KdfParams,
) -> Result<DerivedKey> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| {
        ChestError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::KeyDerivationFailed,
            format!("invalid Argon2id parameters: {}", e),
        )
    })?;

    // Reserve the working set ourselves so an allocation failure surfaces as
    // an error instead of aborting the process.
    let block_count = argon2_params.block_count();
    let mut memory: Vec<Block> = Vec::new();
    memory.try_reserve_exact(block_count).map_err(|e| {
        ChestError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::KeyDerivationFailed,
            format!(
                "cannot allocate {} KiB of Argon2id working memory",
                params.mem_cost_kib
            ),
            e,
        )
    })?;
    memory.resize(block_count, Block::default());

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    debug!(
        mem_cost_kib = params.mem_cost_kib,
        time_cost = params.time_cost,
        "deriving key"
    );
    let started = Instant::now();

    // The output is written straight into the key that is returned, so the
    // only copy is the one wiped by `DerivedKey::drop`, on either path.
    // With the `zeroize` feature, argon2 wipes `memory` before returning.
    let mut key = DerivedKey::from_bytes([0u8; KEY_LEN]);
    argon2
        .hash_password_into_with_memory(password, salt, &mut key.bytes, &mut memory)
        .map_err(|e| {
            ChestError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::KeyDerivationFailed,
                format!("Argon2id key derivation failed: {}", e),
            )
        })?;

    debug!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        "key derived"
    );
    Ok(key)
}
