//! Device image pool.

use {
    super::{Bucket, BucketRef, Lease},
    crate::driver::{Device, DeviceImage, DriverError, ImageInfo},
    log::debug,
    std::sync::Arc,
};

/// Pool of device images keyed by minimum extent and exact format.
///
/// A pooled image may be wider or taller than the lease asked for; callers
/// address it through explicit regions rather than its stored extent.
#[derive(Debug, Default)]
pub struct ImagePool {
    bucket: Bucket<DeviceImage>,
}

impl ImagePool {
    /// Constructs a new `ImagePool`.
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket_ref(&self) -> BucketRef<DeviceImage> {
        Arc::downgrade(&self.bucket)
    }

    /// Leases the first free image covering `info`, allocating on a miss.
    #[profiling::function]
    pub fn lease(
        &self,
        device: &Arc<dyn Device>,
        info: impl Into<ImageInfo>,
    ) -> Result<Lease<DeviceImage>, DriverError> {
        let info = info.into();

        {
            let mut bucket = self.bucket.lock();

            if let Some(at) = bucket.iter().position(|image| {
                image.info.width >= info.width
                    && image.info.height >= info.height
                    && image.info.fmt == info.fmt
            }) {
                if let Some(item) = bucket.remove(at) {
                    return Ok(Lease::new(self.bucket_ref(), item));
                }
            }
        }

        debug!("new pooled image: {:?}", info);

        Ok(Lease::new(
            self.bucket_ref(),
            DeviceImage::create(device, info)?,
        ))
    }

    /// Number of images currently sitting in the pool.
    pub fn free_count(&self) -> usize {
        self.bucket.lock().len()
    }

    /// Drops every pooled image, releasing the device allocations.
    pub fn clear(&self) {
        self.bucket.lock().clear();
    }
}
