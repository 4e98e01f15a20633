//! Image resource types

use {
    super::{Device, DriverError},
    crate::color::PixelFormat,
    bitflags::bitflags,
    derive_builder::{Builder, UninitializedFieldError},
    log::trace,
    std::{sync::Arc, thread::panicking},
};

bitflags! {
    /// Device access intent for an image allocation.
    pub struct MemAccess: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const READ_WRITE = Self::READ.bits | Self::WRITE.bits;
    }
}

/// Opaque device-side identifier of an image allocation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ImageHandle(pub u64);

/// Smart pointer handle to a device image object.
///
/// Also contains information about the object. The underlying allocation is
/// released back to the device when the last clone drops.
#[derive(Debug)]
pub struct DeviceImage {
    device: Arc<dyn Device>,
    handle: ImageHandle,

    /// Information used to create this object.
    pub info: ImageInfo,
}

impl DeviceImage {
    /// Creates a new image on the given device.
    #[profiling::function]
    pub fn create(
        device: &Arc<dyn Device>,
        info: impl Into<ImageInfo>,
    ) -> Result<Self, DriverError> {
        let info = info.into();

        trace!("create: {:?}", info);

        debug_assert!(info.width > 0, "width must be non-zero");
        debug_assert!(info.height > 0, "height must be non-zero");

        let handle = device.create_image(info)?;
        let device = Arc::clone(device);

        Ok(Self {
            device,
            handle,
            info,
        })
    }

    /// The device this image lives on.
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// The device-side identifier of this image.
    pub fn handle(&self) -> ImageHandle {
        self.handle
    }
}

impl Drop for DeviceImage {
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        self.device.destroy_image(self.handle);
    }
}

/// Information used to create a [`DeviceImage`] instance.
#[derive(Builder, Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[builder(
    build_fn(private, name = "fallible_build", error = "ImageInfoBuilderError"),
    derive(Clone, Copy, Debug),
    pattern = "owned"
)]
#[non_exhaustive]
pub struct ImageInfo {
    /// How the device is allowed to touch the allocation.
    #[builder(default = "MemAccess::READ_WRITE", setter(strip_option))]
    pub access: MemAccess,

    /// The format of the texels that will be contained in the image.
    #[builder(setter(strip_option))]
    pub fmt: PixelFormat,

    /// Image extent of the Y axis.
    #[builder(setter(strip_option))]
    pub height: i32,

    /// Image extent of the X axis.
    #[builder(setter(strip_option))]
    pub width: i32,
}

impl ImageInfo {
    /// Specifies a two-dimensional image.
    pub const fn new_2d(fmt: PixelFormat, width: i32, height: i32) -> ImageInfoBuilder {
        ImageInfoBuilder {
            access: None,
            fmt: Some(fmt),
            height: Some(height),
            width: Some(width),
        }
    }

    /// Storage size of one row, in bytes.
    pub const fn row_bytes(&self) -> usize {
        self.width as usize * self.fmt.bytes_per_pixel()
    }

    /// Storage size of the whole image, in bytes.
    pub const fn size_bytes(&self) -> usize {
        self.row_bytes() * self.height as usize
    }
}

impl ImageInfoBuilder {
    /// Builds a new `ImageInfo`.
    pub fn build(self) -> ImageInfo {
        self.fallible_build()
            .expect("All required fields set at initialization")
    }
}

impl From<ImageInfoBuilder> for ImageInfo {
    fn from(info: ImageInfoBuilder) -> Self {
        info.build()
    }
}

#[derive(Debug)]
struct ImageInfoBuilderError;

impl From<UninitializedFieldError> for ImageInfoBuilderError {
    fn from(_: UninitializedFieldError) -> Self {
        Self
    }
}
