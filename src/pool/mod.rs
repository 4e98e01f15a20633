//! Resource leasing and pooling types.
//!
//! The engine keeps two process-wide pools: reusable host staging buffers and
//! reusable device images. Leased items are found first-fit among the free
//! entries (a buffer at least as large as requested, an image at least as
//! wide and tall in the exact format) and new items are allocated on a
//! miss. Dropping a [`Lease`] returns the item to its pool; the pools never
//! shrink while alive, so steady-state iteration allocates nothing.

mod image;
mod scratch;

pub use self::{image::ImagePool, scratch::{ScratchBuf, ScratchPool}};

use {
    parking_lot::Mutex,
    std::{
        collections::VecDeque,
        mem::ManuallyDrop,
        ops::{Deref, DerefMut},
        sync::{Arc, Weak},
        thread::panicking,
    },
};

type Bucket<T> = Arc<Mutex<VecDeque<T>>>;
type BucketRef<T> = Weak<Mutex<VecDeque<T>>>;

/// Holds a leased resource and implements `Drop` in order to return it.
///
/// This simple wrapper type implements only the `AsRef`, `AsMut`, `Deref`
/// and `DerefMut` traits and provides no other functionality. A freshly
/// leased resource is guaranteed to have no other owners and may be mutably
/// accessed.
#[derive(Debug)]
pub struct Lease<T> {
    bucket: BucketRef<T>,
    item: ManuallyDrop<T>,
}

impl<T> Lease<T> {
    #[inline(always)]
    fn new(bucket: BucketRef<T>, item: T) -> Self {
        Self {
            bucket,
            item: ManuallyDrop::new(item),
        }
    }
}

impl<T> AsRef<T> for Lease<T> {
    fn as_ref(&self) -> &T {
        &self.item
    }
}

impl<T> AsMut<T> for Lease<T> {
    fn as_mut(&mut self) -> &mut T {
        &mut self.item
    }
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.item
    }
}

impl<T> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.item
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        // If the pool has been dropped we must manually drop the item,
        // otherwise it goes back into the pool.
        if let Some(bucket) = self.bucket.upgrade() {
            bucket
                .lock()
                .push_back(unsafe { ManuallyDrop::take(&mut self.item) });
        } else {
            unsafe {
                ManuallyDrop::drop(&mut self.item);
            }
        }
    }
}
