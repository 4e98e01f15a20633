//! Host scratch buffer pool.

use {
    super::{Bucket, BucketRef, Lease},
    log::debug,
    std::{
        ops::{Deref, DerefMut},
        sync::Arc,
    },
};

/// A reusable host staging buffer.
///
/// Dereferences to its bytes; a pooled buffer may be longer than the size it
/// was leased for.
#[derive(Debug)]
pub struct ScratchBuf {
    bytes: Box<[u8]>,
}

impl Deref for ScratchBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl DerefMut for ScratchBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.bytes
    }
}

/// Pool of host staging buffers keyed by minimum length.
#[derive(Debug, Default)]
pub struct ScratchPool {
    bucket: Bucket<ScratchBuf>,
}

impl ScratchPool {
    /// Constructs a new `ScratchPool`.
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket_ref(&self) -> BucketRef<ScratchBuf> {
        Arc::downgrade(&self.bucket)
    }

    /// Leases the first free buffer at least `size` bytes long, allocating
    /// on a miss.
    #[profiling::function]
    pub fn lease(&self, size: usize) -> Lease<ScratchBuf> {
        {
            let mut bucket = self.bucket.lock();

            if let Some(at) = bucket.iter().position(|buf| buf.len() >= size) {
                if let Some(item) = bucket.remove(at) {
                    return Lease::new(self.bucket_ref(), item);
                }
            }
        }

        debug!("new scratch buffer: {} bytes", size);

        Lease::new(
            self.bucket_ref(),
            ScratchBuf {
                bytes: vec![0u8; size].into_boxed_slice(),
            },
        )
    }

    /// Number of buffers currently sitting in the pool.
    pub fn free_count(&self) -> usize {
        self.bucket.lock().len()
    }

    /// Drops every pooled buffer.
    pub fn clear(&self) {
        self.bucket.lock().clear();
    }
}
