//! Packet buffers.
//!
//! The engine is generic over anything implementing [`Packet`]. [`Buf`] is the
//! plain heap variant: one allocation per buffer, freed on drop. For the pool
//! variant, see [`Pool`][crate::Pool] whose handles also implement [`Packet`].

use std::fmt;

use crate::Error;

/// Default size of a freshly allocated buffer. Fits an Ethernet frame.
pub const DEFAULT_BUF_LEN: usize = 2048;

/// A packet buffer with transfer-of-ownership semantics.
///
/// A buffer has a fixed capacity (`buf_len`) and a current data length. Data
/// beyond the data length is scratch space handlers may grow into with
/// [`Packet::set_data_len`].
pub trait Packet: Send {
    /// The valid bytes of the packet.
    fn data(&self) -> &[u8];

    /// Mutable access to the valid bytes.
    fn data_mut(&mut self) -> &mut [u8];

    /// Set the number of valid bytes.
    ///
    /// Fails with [`Error::BufferTooSmall`] if `len` exceeds [`Packet::buf_len`].
    fn set_data_len(&mut self, len: usize) -> Result<(), Error>;

    /// Total capacity of the underlying buffer.
    fn buf_len(&self) -> usize;

    /// Number of valid bytes.
    fn data_len(&self) -> usize {
        self.data().len()
    }
}

/// Heap allocated packet buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Buf {
    bytes: Vec<u8>,
    len: usize,
}

impl Buf {
    /// Create an empty buffer with room for `buf_len` bytes.
    pub fn new(buf_len: usize) -> Self {
        Buf {
            bytes: vec![0; buf_len],
            len: 0,
        }
    }

    /// Create a buffer holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut buf = Buf::new(DEFAULT_BUF_LEN.max(data.len()));
        buf.bytes[..data.len()].copy_from_slice(data);
        buf.len = data.len();
        buf
    }

    /// Forget the contents, keeping the allocation.
    pub fn clear(&mut self) {
        self.bytes.fill(0);
        self.len = 0;
    }

    /// Copy the valid bytes out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes[..self.len].to_vec()
    }
}

impl Default for Buf {
    fn default() -> Self {
        Buf::new(DEFAULT_BUF_LEN)
    }
}

impl Packet for Buf {
    fn data(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[..self.len]
    }

    fn set_data_len(&mut self, len: usize) -> Result<(), Error> {
        if len > self.bytes.len() {
            return Err(Error::BufferTooSmall {
                need: len,
                have: self.bytes.len(),
            });
        }
        self.len = len;
        Ok(())
    }

    fn buf_len(&self) -> usize {
        self.bytes.len()
    }
}

impl AsRef<[u8]> for Buf {
    fn as_ref(&self) -> &[u8] {
        self.data()
    }
}

impl fmt::Debug for Buf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buf")
            .field("len", &self.len)
            .field("buf_len", &self.bytes.len())
            .finish()
    }
}
