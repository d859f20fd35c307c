//! File encryption/decryption operations
//!
//! This module provides the high-level operations on envelope files:
//! encrypting a message or a file, decrypting to a writer or a file, and
//! updating an existing envelope in place.
//!
//! Every envelope is fully built in memory before the destination is
//! touched, and destinations are replaced atomically, so a failed operation
//! never leaves a partially written file behind.

use crate::envelope::{self, Envelope, Metadata, Opened};
use crate::error::{ChestError, ErrorCategory, ErrorKind, Result};
use crate::passphrase::{CachingPassphraseReader, PassphraseReader};
use crate::secure_buffer::SecureBuffer;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use tracing::{debug, info};

/// Encrypt `message` and write it to `output_path` as a message envelope.
pub fn encrypt_message(
    message: &[u8],
    output_path: &Path,
    passphrase_reader: &mut dyn PassphraseReader,
) -> Result<()> {
    seal_to_file(message, Metadata::Message, output_path, passphrase_reader)
}

/// Encrypt a file with a password
///
/// Reads the whole of `input_path` into memory, encrypts it using a password
/// from `passphrase_reader`, and writes the envelope to `output_path`.
///
/// The output file is created with mode 0o600 (read/write for owner only) on Unix systems.
pub fn encrypt_file(
    input_path: &Path,
    output_path: &Path,
    passphrase_reader: &mut dyn PassphraseReader,
) -> Result<()> {
    let plaintext = read_secret_file(input_path)?;
    seal_to_file(&plaintext, Metadata::File, output_path, passphrase_reader)
}

/// Read and open the envelope stored at `input_path`.
pub fn open_file(input_path: &Path, passphrase_reader: &mut dyn PassphraseReader) -> Result<Opened> {
    let stored = fs::read(input_path).map_err(|e| read_error(input_path, e))?;
    let envelope = Envelope::from_bytes(&stored).map_err(|e| {
        e.with_context(format!("{} is not a valid envelope", input_path.display()))
    })?;
    let passphrase = passphrase_reader.read_passphrase()?;
    envelope::decode(&envelope, &passphrase).map_err(|e| e.with_context("failed to decrypt"))
}

/// Decrypt the envelope at `input_path` and write the body to `output`.
///
/// Nothing is written unless authentication succeeds. Returns the metadata
/// tag so the caller can tell a message from a file.
pub fn decrypt(
    input_path: &Path,
    output: &mut dyn Write,
    passphrase_reader: &mut dyn PassphraseReader,
) -> Result<Metadata> {
    let opened = open_file(input_path, passphrase_reader)?;
    output
        .write_all(&opened.body)
        .and_then(|()| output.flush())
        .map_err(|e| {
            ChestError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                "failed to write decrypted output",
                e,
            )
        })?;
    Ok(opened.metadata)
}

/// Decrypt a file with a password
///
/// Reads the envelope from `input_path`, decrypts it using a password from
/// `passphrase_reader`, and writes the body to `output_path`.
///
/// The output file is created with mode 0o600 (read/write for owner only) on Unix systems.
pub fn decrypt_to_file(
    input_path: &Path,
    output_path: &Path,
    passphrase_reader: &mut dyn PassphraseReader,
) -> Result<Metadata> {
    let opened = open_file(input_path, passphrase_reader)?;
    write_file_atomic(output_path, &opened.body)
        .map_err(|e| e.with_context(format!("failed to write to {}", output_path.display())))?;
    info!(path = %output_path.display(), "wrote decrypted file");
    Ok(opened.metadata)
}

/// Update an encrypted file with new plaintext using the same password
///
/// This function:
/// 1. Decrypts the existing file at `crypt_path` to validate the password
/// 2. Reads new plaintext from `plain_path`
/// 3. Encrypts the new plaintext with the validated password
/// 4. Atomically writes to `crypt_path` (tempfile + fsync + rename)
///
/// The password validation prevents accidental password changes.
pub fn update_file(
    plain_path: &Path,
    crypt_path: &Path,
    passphrase_reader: &mut dyn PassphraseReader,
) -> Result<()> {
    let mut caching = CachingPassphraseReader::new(passphrase_reader);

    // Validate password by decrypting existing file (discard plaintext)
    open_file(crypt_path, &mut caching)?;

    encrypt_file(plain_path, crypt_path, &mut caching)
}

fn seal_to_file(
    body: &[u8],
    metadata: Metadata,
    output_path: &Path,
    passphrase_reader: &mut dyn PassphraseReader,
) -> Result<()> {
    let passphrase = passphrase_reader.read_passphrase()?;
    let envelope = envelope::encode(body, metadata, &passphrase)
        .map_err(|e| e.with_context("encryption failed"))?;
    write_file_atomic(output_path, &envelope.to_bytes())
        .map_err(|e| e.with_context(format!("failed to write to {}", output_path.display())))?;
    info!(
        path = %output_path.display(),
        metadata = ?metadata,
        bytes = envelope.serialized_len(),
        "wrote envelope"
    );
    Ok(())
}

/// Load a whole file into a wiped-on-drop buffer sized from its metadata.
fn read_secret_file(path: &Path) -> Result<SecureBuffer> {
    let mut file = File::open(path).map_err(|e| read_error(path, e))?;
    let len = file.metadata().map_err(|e| read_error(path, e))?.len();
    let len = usize::try_from(len).map_err(|_| {
        ChestError::with_kind(
            ErrorCategory::User,
            ErrorKind::Io,
            format!("{} is too large to load into memory", path.display()),
        )
    })?;

    let mut buf = SecureBuffer::with_capacity(len);
    buf.read_to_end(&mut file).map_err(|e| read_error(path, e))?;
    debug!(path = %path.display(), bytes = buf.len(), "read input file");
    Ok(buf)
}

/// Replace `path` with `contents` via tempfile, fsync and rename, with
/// 0o600 permissions on Unix.
fn write_file_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp_file = tempfile::Builder::new()
        .prefix(".chest-tmp")
        .tempfile_in(dir)
        .map_err(|e| {
            ChestError::with_kind_and_source(
                ErrorCategory::User,
                ErrorKind::Io,
                format!("failed to create tempfile in {}", dir.display()),
                e,
            )
        })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp_file
            .as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(|e| {
                ChestError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::Io,
                    "failed to set tempfile permissions",
                    e,
                )
            })?;
    }

    temp_file.write_all(contents).map_err(|e| {
        ChestError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "failed to write to tempfile",
            e,
        )
    })?;
    // Flush and fsync() such that the rename later, if it succeeds, will
    // always point to a valid file.
    temp_file.flush().map_err(|e| {
        ChestError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "failed to flush tempfile",
            e,
        )
    })?;
    temp_file.as_file().sync_all().map_err(|e| {
        ChestError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "failed to sync file prior to rename",
            e,
        )
    })?;

    temp_file.persist(path).map_err(|e| {
        ChestError::with_kind_and_source(
            ErrorCategory::User,
            ErrorKind::Io,
            format!("failed to rename to target file {}", path.display()),
            e,
        )
    })?;
    Ok(())
}

fn read_error(path: &Path, err: io::Error) -> ChestError {
    let category = if err.kind() == io::ErrorKind::NotFound {
        ErrorCategory::User
    } else {
        ErrorCategory::Internal
    };
    ChestError::with_kind_and_source(
        category,
        ErrorKind::Io,
        format!("failed to read from {}", path.display()),
        err,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::passphrase::ConstantPassphraseReader;
    use std::fs;
    use tempfile::TempDir;

    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;

    fn reader(pw: &[u8]) -> ConstantPassphraseReader {
        ConstantPassphraseReader::new(pw.to_vec())
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("plain.txt");
        let crypt_path = temp_dir.path().join("plain.txt.chest");
        let decrypted_path = temp_dir.path().join("decrypted.txt");

        let plaintext = b"Hello, chest!";
        fs::write(&plain_path, plaintext).unwrap();

        encrypt_file(&plain_path, &crypt_path, &mut reader(b"test password")).unwrap();
        assert!(crypt_path.exists());
        assert_ne!(fs::read(&crypt_path).unwrap(), plaintext);

        let metadata =
            decrypt_to_file(&crypt_path, &decrypted_path, &mut reader(b"test password")).unwrap();
        assert_eq!(metadata, Metadata::File);
        assert_eq!(fs::read(&decrypted_path).unwrap(), plaintext);
    }

    #[test]
    fn test_encrypt_message_decrypt_to_writer() {
        let temp_dir = TempDir::new().unwrap();
        let crypt_path = temp_dir.path().join("note.chest");

        encrypt_message(b"hello", &crypt_path, &mut reader(b"correct-horse")).unwrap();

        let mut out = Vec::new();
        let metadata = decrypt(&crypt_path, &mut out, &mut reader(b"correct-horse")).unwrap();
        assert_eq!(metadata, Metadata::Message);
        assert_eq!(out, b"hello");
    }

    #[test]
    fn test_decrypt_wrong_password_writes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let crypt_path = temp_dir.path().join("note.chest");
        let decrypted_path = temp_dir.path().join("decrypted.txt");

        encrypt_message(b"secret", &crypt_path, &mut reader(b"correct")).unwrap();

        let mut out = Vec::new();
        let err = decrypt(&crypt_path, &mut out, &mut reader(b"wrong"))
            .expect_err("expected authentication failure");
        assert_eq!(err.kind, Some(ErrorKind::AuthenticationFailed));
        assert!(out.is_empty());

        let err = decrypt_to_file(&crypt_path, &decrypted_path, &mut reader(b"wrong"))
            .expect_err("expected authentication failure");
        assert_eq!(err.kind, Some(ErrorKind::AuthenticationFailed));
        assert!(!decrypted_path.exists());
    }

    #[test]
    fn test_update_file() {
        let temp_dir = TempDir::new().unwrap();
        let plain1_path = temp_dir.path().join("plain1.txt");
        let plain2_path = temp_dir.path().join("plain2.txt");
        let crypt_path = temp_dir.path().join("crypt.chest");

        fs::write(&plain1_path, b"Initial content").unwrap();
        encrypt_file(&plain1_path, &crypt_path, &mut reader(b"test password")).unwrap();

        fs::write(&plain2_path, b"Updated content").unwrap();
        update_file(&plain2_path, &crypt_path, &mut reader(b"test password")).unwrap();

        let opened = open_file(&crypt_path, &mut reader(b"test password")).unwrap();
        assert_eq!(opened.body.as_slice(), b"Updated content");
    }

    #[test]
    fn test_update_with_wrong_password_fails() {
        let temp_dir = TempDir::new().unwrap();
        let plain1_path = temp_dir.path().join("plain1.txt");
        let plain2_path = temp_dir.path().join("plain2.txt");
        let crypt_path = temp_dir.path().join("crypt.chest");

        fs::write(&plain1_path, b"Initial").unwrap();
        encrypt_file(&plain1_path, &crypt_path, &mut reader(b"correct password")).unwrap();
        let before = fs::read(&crypt_path).unwrap();

        fs::write(&plain2_path, b"Updated").unwrap();
        let err = update_file(&plain2_path, &crypt_path, &mut reader(b"wrong password"))
            .expect_err("expected authentication failure");
        assert_eq!(err.kind, Some(ErrorKind::AuthenticationFailed));
        assert_eq!(fs::read(&crypt_path).unwrap(), before);
    }

    #[test]
    #[cfg(unix)]
    fn test_file_permissions() {
        let temp_dir = TempDir::new().unwrap();
        let crypt_path = temp_dir.path().join("note.chest");

        encrypt_message(b"test", &crypt_path, &mut reader(b"test")).unwrap();

        let permissions = fs::metadata(&crypt_path).unwrap().permissions();
        assert_eq!(permissions.mode() & 0o777, 0o600);
    }

    #[test]
    fn test_empty_file() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("empty.txt");
        let crypt_path = temp_dir.path().join("empty.txt.chest");
        let decrypted_path = temp_dir.path().join("decrypted.txt");

        fs::write(&plain_path, b"").unwrap();
        encrypt_file(&plain_path, &crypt_path, &mut reader(b"test")).unwrap();
        decrypt_to_file(&crypt_path, &decrypted_path, &mut reader(b"test")).unwrap();

        assert_eq!(fs::read(&decrypted_path).unwrap(), b"");
    }

    #[test]
    fn test_large_file() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("large.bin");
        let crypt_path = temp_dir.path().join("large.bin.chest");

        let content: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&plain_path, &content).unwrap();
        encrypt_file(&plain_path, &crypt_path, &mut reader(b"test")).unwrap();

        let opened = open_file(&crypt_path, &mut reader(b"test")).unwrap();
        assert_eq!(opened.body.as_slice(), &content[..]);
    }

    #[test]
    fn test_missing_input_is_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing.txt");
        let crypt_path = temp_dir.path().join("out.chest");

        let err = encrypt_file(&missing, &crypt_path, &mut reader(b"test"))
            .expect_err("expected read failure");
        assert_eq!(err.kind, Some(ErrorKind::Io));
        assert_eq!(err.category, ErrorCategory::User);
        assert!(!crypt_path.exists());

        let err = open_file(&missing, &mut reader(b"test")).expect_err("expected read failure");
        assert_eq!(err.kind, Some(ErrorKind::Io));
    }

    #[test]
    fn test_truncated_envelope_file_is_malformed() {
        let temp_dir = TempDir::new().unwrap();
        let crypt_path = temp_dir.path().join("note.chest");

        encrypt_message(b"hello there", &crypt_path, &mut reader(b"pw")).unwrap();
        let bytes = fs::read(&crypt_path).unwrap();
        fs::write(&crypt_path, &bytes[..bytes.len() - 4]).unwrap();

        let err = open_file(&crypt_path, &mut reader(b"pw")).expect_err("expected rejection");
        assert_eq!(err.kind, Some(ErrorKind::MalformedEnvelope));
    }

    #[test]
    fn test_failed_write_leaves_no_file() {
        let temp_dir = TempDir::new().unwrap();
        let out_path = temp_dir.path().join("no-such-dir").join("out.chest");

        let err = encrypt_message(b"hello", &out_path, &mut reader(b"pw"))
            .expect_err("expected write failure");
        assert_eq!(err.kind, Some(ErrorKind::Io));
        assert!(!out_path.exists());
    }

    #[test]
    fn test_overwrites_existing_destination() {
        let temp_dir = TempDir::new().unwrap();
        let crypt_path = temp_dir.path().join("note.chest");
        fs::write(&crypt_path, b"previous contents").unwrap();

        encrypt_message(b"new", &crypt_path, &mut reader(b"pw")).unwrap();
        let opened = open_file(&crypt_path, &mut reader(b"pw")).unwrap();
        assert_eq!(opened.body.as_slice(), b"new");
    }
}
