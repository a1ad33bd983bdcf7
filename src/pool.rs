//! Memory strategies.
//!
//! Protocol contexts and packet buffers come either from the general heap
//! ([`Heap`]) or from a pre-sized [`Pool`]. Both implement [`Strategy`], which
//! lets a protocol module take the allocator as a construction parameter
//! instead of hard coding one.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

use crate::buffer::{Buf, Packet};
use crate::Error;

/// Allocation policy for values of type `T`.
pub trait Strategy<T>: Send + Sync {
    /// Owning handle. Dropping it releases the memory.
    type Handle: DerefMut<Target = T> + Send;

    /// Place `value` in memory obtained from this strategy.
    ///
    /// Only the pool strategy can fail, with [`Error::PoolExhausted`].
    fn acquire(&self, value: T) -> Result<Self::Handle, Error>;
}

/// One heap allocation per value.
#[derive(Debug, Default, Clone, Copy)]
pub struct Heap;

impl<T: Send> Strategy<T> for Heap {
    type Handle = Box<T>;

    fn acquire(&self, value: T) -> Result<Box<T>, Error> {
        Ok(Box::new(value))
    }
}

/// Fixed capacity pool.
///
/// All slots are allocated up front. Acquire and release are O(1) pops and
/// pushes on a free list and never allocate. A [`Pooled`] handle goes back to
/// the free list when dropped, on whichever thread drops it.
pub struct Pool<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    free: Mutex<Vec<Box<T>>>,
    capacity: usize,
}

impl<T: Default> Pool<T> {
    /// Create a pool with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        let mut free = Vec::with_capacity(capacity);
        free.extend((0..capacity).map(|_| Box::<T>::default()));

        Pool {
            inner: Arc::new(Inner {
                free: Mutex::new(free),
                capacity,
            }),
        }
    }
}

impl<T> Pool<T> {
    /// Take a slot as it was left by its previous user.
    pub fn take(&self) -> Result<Pooled<T>, Error> {
        let mut free = self.inner.free.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(value) = free.pop() else {
            debug!("Pool exhausted, capacity: {}", self.inner.capacity);
            return Err(Error::PoolExhausted {
                capacity: self.inner.capacity,
            });
        };

        Ok(Pooled {
            value: Some(value),
            home: Arc::clone(&self.inner),
        })
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of slots currently free.
    pub fn available(&self) -> usize {
        self.inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Pool<Buf> {
    /// Take a cleared packet buffer.
    pub fn get_pkt(&self) -> Result<Pooled<Buf>, Error> {
        let mut buf = self.take()?;
        buf.clear();
        Ok(buf)
    }
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Pool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send> Strategy<T> for Pool<T> {
    type Handle = Pooled<T>;

    fn acquire(&self, value: T) -> Result<Pooled<T>, Error> {
        let mut slot = self.take()?;
        *slot = value;
        Ok(slot)
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

/// A slot on loan from a [`Pool`].
pub struct Pooled<T> {
    // Only None while being dropped.
    value: Option<Box<T>>,
    home: Arc<Inner<T>>,
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.value {
            Some(v) => v,
            None => unreachable!("pooled value accessed after release"),
        }
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(v) => v,
            None => unreachable!("pooled value accessed after release"),
        }
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.home
                .free
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(value);
        }
    }
}

impl<T: Packet> Packet for Pooled<T> {
    fn data(&self) -> &[u8] {
        (**self).data()
    }

    fn data_mut(&mut self) -> &mut [u8] {
        (**self).data_mut()
    }

    fn set_data_len(&mut self, len: usize) -> Result<(), Error> {
        (**self).set_data_len(len)
    }

    fn buf_len(&self) -> usize {
        (**self).buf_len()
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&**self).finish()
    }
}
