//! Heap buffers for secret bytes that are wiped on every exit path
//!
//! A [`SecureBuffer`] owns a `Vec<u8>` wrapped in [`Zeroizing`], so the
//! contents are overwritten with zeros when the buffer is dropped, whether
//! the owning scope returns normally, returns early through `?`, or unwinds.
//!
//! Capacity is reserved up front wherever the final size is known. A `Vec`
//! that reallocates leaves its old allocation behind unwiped, so callers
//! should size buffers with [`SecureBuffer::with_capacity`] before filling
//! them. When [`SecureBuffer::extend_from_slice`] does need more room it
//! never lets `Vec` reallocate: it copies into a fresh buffer by hand and
//! wipes the old one.
//!
//! The memory is ordinary heap memory. It is not locked against swapping.

use std::fmt;
use std::io::{self, BufRead, Read};
use std::ops::Deref;

use zeroize::{Zeroize, Zeroizing};

/// Owned secret bytes, zeroed on drop.
pub struct SecureBuffer {
    bytes: Zeroizing<Vec<u8>>,
}

impl SecureBuffer {
    /// Allocates an empty buffer able to hold `capacity` bytes without reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Zeroizing::new(Vec::with_capacity(capacity)),
        }
    }

    /// Copies `data` into a new buffer of exactly the right capacity.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut buf = Self::with_capacity(data.len());
        buf.extend_from_slice(data);
        buf
    }

    /// Takes ownership of an existing vector. Its contents are wiped when the
    /// buffer drops, but earlier reallocations of `data` are out of reach.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            bytes: Zeroizing::new(data),
        }
    }

    /// Appends bytes, moving to a larger allocation by hand (and wiping the
    /// old one) when the reserved capacity is exhausted.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        let needed = self.bytes.len() + data.len();
        if needed > self.bytes.capacity() {
            let mut grown = Zeroizing::new(Vec::with_capacity(needed.max(self.bytes.capacity() * 2)));
            grown.extend_from_slice(&self.bytes);
            // The old allocation is wiped when `self.bytes` is replaced and dropped.
            self.bytes = grown;
        }
        self.bytes.extend_from_slice(data);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Reads `reader` to EOF, appending through [`SecureBuffer::extend_from_slice`]
    /// so growth never leaves an unwiped copy behind. Returns the bytes read.
    pub fn read_to_end(&mut self, reader: &mut dyn Read) -> io::Result<usize> {
        let mut chunk = Zeroizing::new([0u8; 8192]);
        let mut total = 0;
        loop {
            let n = match reader.read(&mut chunk[..]) {
                Ok(0) => return Ok(total),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            self.extend_from_slice(&chunk[..n]);
            total += n;
        }
    }

    /// Appends bytes up to and including the next `\n`, or to EOF. Returns
    /// the bytes read; 0 means EOF.
    pub fn read_line(&mut self, reader: &mut dyn BufRead) -> io::Result<usize> {
        let mut total = 0;
        loop {
            let (done, used) = {
                let available = match reader.fill_buf() {
                    Ok(available) => available,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                };
                match available.iter().position(|&b| b == b'\n') {
                    Some(i) => {
                        self.extend_from_slice(&available[..=i]);
                        (true, i + 1)
                    }
                    None => {
                        self.extend_from_slice(available);
                        (available.is_empty(), available.len())
                    }
                }
            };
            reader.consume(used);
            total += used;
            if done {
                return Ok(total);
            }
        }
    }

    /// Hands the allocation over without copying it.
    pub fn into_zeroizing(self) -> Zeroizing<Vec<u8>> {
        self.bytes
    }

    /// Overwrites the contents with zeros and empties the buffer, keeping
    /// the allocation for reuse.
    pub fn wipe(&mut self) {
        self.bytes.zeroize();
    }
}

impl Deref for SecureBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl AsRef<[u8]> for SecureBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl PartialEq for SecureBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for SecureBuffer {}

impl fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureBuffer")
            .field("len", &self.bytes.len())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}
