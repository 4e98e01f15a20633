//! Device gateway types.
//!
//! The engine talks to the device through the [`Device`] trait: a thin
//! façade over a context and an in-order command queue with image create and
//! destroy, host transfers, image copies, compiled colour conversion passes
//! and the two ordering primitives `barrier` and `finish`. Enqueue-style
//! calls are asynchronous by default; ordering is enforced only by barriers
//! and by `finish`.
//!
//! [`SoftDevice`] implements the contract against host memory and is used by
//! the test suite and for headless runs.

mod image;
mod soft;

pub use self::{
    image::{DeviceImage, ImageHandle, ImageInfo, ImageInfoBuilder, MemAccess},
    soft::SoftDevice,
};

use {
    crate::color::ConvKernel,
    std::{
        error::Error,
        fmt::{Debug, Display, Formatter},
    },
};

/// Thin façade over the device API.
///
/// All transfer and copy calls take an `(x, y)` origin and a `(width,
/// height)` region in image coordinates. A `rowstride` of zero means tightly
/// packed host rows.
///
/// Implementations must be safe to call from the worker threads; ordering
/// across calls follows the queue contract described in the module
/// documentation.
pub trait Device: Debug + Send + Sync {
    /// Allocates a device image.
    fn create_image(&self, info: ImageInfo) -> Result<ImageHandle, DriverError>;

    /// Releases a device image.
    fn destroy_image(&self, image: ImageHandle);

    /// Blocking read of a sub-region into host memory.
    fn read_image(
        &self,
        image: &DeviceImage,
        origin: (i32, i32),
        region: (i32, i32),
        rowstride: usize,
        dst: &mut [u8],
    ) -> Result<(), DriverError>;

    /// Write of a sub-region from host memory.
    fn write_image(
        &self,
        image: &DeviceImage,
        origin: (i32, i32),
        region: (i32, i32),
        rowstride: usize,
        src: &[u8],
    ) -> Result<(), DriverError>;

    /// Device-side copy between two images of the same format.
    fn copy_image(
        &self,
        src: &DeviceImage,
        src_origin: (i32, i32),
        dst: &DeviceImage,
        dst_origin: (i32, i32),
        region: (i32, i32),
    ) -> Result<(), DriverError>;

    /// Blocking map of the leading `region` of an image.
    ///
    /// The callback receives the mapped bytes and their pitch; the mapping is
    /// released on return from the callback on every path.
    fn map_image(
        &self,
        image: &DeviceImage,
        region: (i32, i32),
        f: &mut dyn FnMut(&[u8], usize),
    ) -> Result<(), DriverError>;

    /// Enqueues one compiled colour conversion pass over `region`.
    fn convert_image(
        &self,
        kernel: ConvKernel,
        src: &DeviceImage,
        dst: &DeviceImage,
        region: (i32, i32),
    ) -> Result<(), DriverError>;

    /// Orders previously enqueued commands before subsequently enqueued ones.
    fn barrier(&self) -> Result<(), DriverError>;

    /// Blocks the host until the queue drains.
    fn finish(&self) -> Result<(), DriverError>;
}

/// Describes the general category of all device failure cases.
#[derive(Debug)]
pub enum DriverError {
    /// The input data, or referenced data, is not valid for the current state.
    InvalidData,

    /// The requested feature, or input configuration, is not supported for
    /// the current state.
    Unsupported,

    /// The device has run out of physical memory.
    ///
    /// Many drivers return this value for generic or unhandled error
    /// conditions.
    OutOfMemory,

    /// A map, read, write or copy against the device failed.
    TransferFailed,
}

impl Display for DriverError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error for DriverError {}
