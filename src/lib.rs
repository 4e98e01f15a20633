//! GPU-resident tile cache and scan iteration engine for tiled raster buffers.
//!
//! _Tilestream_ sits between a tiled, typed image buffer (the CPU-side
//! canonical store) and a device command queue. It keeps recently used
//! rectangular sub-regions of buffers mirrored as device images, serves
//! read and write requests against those regions without unnecessary
//! host/device transfers, writes dirty device regions back to the tile store
//! on demand, and drives per-operation scan iterators that hand operations
//! aligned device memory in a well-defined order.
//!
//! The engine is a write-back cache with write allocation: regions produced
//! on the device stay there until a read miss, an invalidation or memory
//! pressure forces them home.
//!
//! # Examples
//!
//! Running a point operation over two buffers on the host:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use tilestream::{Gpu, Rect, PixelFormat};
//! # use tilestream::buffer::{BufferInfo, RasterBuffer};
//! # use tilestream::driver::SoftDevice;
//! # use tilestream::iter::{Access, HostIterator};
//! let gpu = Gpu::new(Arc::new(SoftDevice::new()));
//! let extent = Rect::new(0, 0, 256, 256);
//! let src = RasterBuffer::new(BufferInfo::new(extent, PixelFormat::RgbaF32));
//! let dst = RasterBuffer::new(BufferInfo::new(extent, PixelFormat::RgbaF32));
//!
//! let mut iter = HostIterator::new(&gpu, &dst, None, None, Access::WRITE);
//! let read = iter.add(&src, None, None, Access::READ);
//! while iter.next() {
//!     let (input, output) = iter.data_pair(read, 0);
//!     output.copy_from_slice(input);
//! }
//! ```

pub mod buffer;
pub mod cache;
pub mod color;
pub mod driver;
pub mod iter;
pub mod math;
pub mod pool;

mod gpu;
mod worker;

pub use self::{
    cache::CacheMode,
    color::PixelFormat,
    gpu::{Gpu, GpuInfo, GpuInfoBuilder, BATCH_TILES, MAX_STREAMS, SMALL_READ, WORKER_THREADS},
    math::Rect,
};
