//! chest - password-protected message and file containers
//!
//! A password and a fresh random salt are stretched with Argon2id into a
//! one-off key, and the payload is sealed with NaCl secretbox
//! (XSalsa20Poly1305). See [`envelope`] for the on-disk layout.

#![forbid(unsafe_code)]

pub mod commands;
pub mod envelope;
pub mod error;
pub mod file_ops;
pub mod kdf;
pub mod passphrase;
pub mod secretcrypt;
pub mod secure_buffer;
