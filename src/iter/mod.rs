//! Scan-aligned iteration over tiled buffers.
//!
//! Iterators multiplex up to [`MAX_STREAMS`](crate::MAX_STREAMS) streams
//! over a shared geometry fixed by the first stream. A stream whose buffer
//! is scan-compatible with stream 0 (same tile grid, shift difference a
//! multiple of the tile extent) walks its own tiles in lockstep; anything
//! else is shuttled through the staging pools.

mod gpu;
mod host;
mod tile;

pub use self::{gpu::GpuIterator, host::HostIterator, tile::TileIterator};

use {crate::buffer::RasterBuffer, bitflags::bitflags};

bitflags! {
    /// Per-stream access flags.
    ///
    /// `SCAN_COMPATIBLE` and `FORMAT_COMPATIBLE` are computed when a stream
    /// is added and can be read back from the iterator, not requested.
    pub struct Access: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const GPU_READ = 1 << 2;
        const GPU_WRITE = 1 << 3;
        /// Device scratch stream: neither pre-read nor written back.
        const AUX = 1 << 4;
        const SCAN_COMPATIBLE = 128;
        const FORMAT_COMPATIBLE = 256;
    }
}

/// Whether iterations over two buffers starting at the given coordinates
/// with a shared width and height can run in parallel on the tile grid.
pub fn scan_compatible(
    a: &RasterBuffer,
    xa: i32,
    ya: i32,
    b: &RasterBuffer,
    xb: i32,
    yb: i32,
) -> bool {
    if a.tile_width() != b.tile_width() {
        return false;
    }

    if a.tile_height() != b.tile_height() {
        return false;
    }

    if ((a.shift_x() + xa) - (b.shift_x() + xb)).abs() % a.tile_width() != 0 {
        return false;
    }

    if ((a.shift_y() + ya) - (b.shift_y() + yb)).abs() % a.tile_height() != 0 {
        return false;
    }

    true
}
