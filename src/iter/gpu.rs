//! Multi-stream device iteration with batched sub-tile dispatch.

use {
    super::{scan_compatible, Access},
    crate::{
        buffer::{BufferGuard, LockMode, RasterBuffer, Tile},
        cache::transfer,
        color::PixelFormat,
        driver::{Device, DeviceImage, DriverError, ImageInfo},
        gpu::Gpu,
        iter::tile::TileIterator,
        math::Rect,
        pool::Lease,
    },
    log::{trace, warn},
    std::{sync::Arc, thread::panicking},
};

enum StepTex {
    Mirror(Arc<DeviceImage>),
    Pooled(Lease<DeviceImage>),
}

struct GpuStream {
    buffer: Option<Arc<RasterBuffer>>,
    direct: Vec<bool>,
    flags: Access,
    format: PixelFormat,
    rect: Rect,
    roi: Vec<Rect>,
    tex: Vec<Option<StepTex>>,
    tiles: Option<TileIterator>,
}

/// Multiplexes tile iterators over several buffers, handing device images to
/// the operation in batches of up to [`BATCH_TILES`](crate::BATCH_TILES)
/// sub-tiles per stream.
///
/// Reads are uploaded before the batch is exposed and writes are collected
/// as `Dirty` cache entries (or the tile's own mirror, for full-tile steps)
/// when the next batch begins. A barrier separates prior kernel work from
/// the write-back and another one orders the uploads before the batch is
/// returned, so within one step a kernel sees every earlier submission plus
/// the current uploads.
///
/// The iterator cannot be cancelled mid-flight: consume it to completion, or
/// call [`end`] (also run on drop), which behaves as if the iteration
/// completed with all buffered writes finalised.
///
/// [`end`]: Self::end
pub struct GpuIterator<'a> {
    batch: usize,
    ended: bool,
    finished: bool,
    gpu: &'a Gpu,
    iteration_no: usize,
    locks: Vec<(u64, BufferGuard)>,
    n: usize,
    streams: Vec<GpuStream>,
    tiles: Vec<(Tile, bool)>,
}

impl<'a> GpuIterator<'a> {
    /// Creates an iterator with one stream.
    ///
    /// A missing `roi` defaults to the buffer's extent, a missing `format`
    /// to the buffer's native format.
    pub fn new(
        gpu: &'a Gpu,
        buffer: &Arc<RasterBuffer>,
        roi: Option<Rect>,
        format: Option<PixelFormat>,
        flags: Access,
    ) -> Self {
        let mut res = Self {
            batch: gpu.info().batch_tiles,
            ended: false,
            finished: false,
            gpu,
            iteration_no: 0,
            locks: Vec::new(),
            n: 0,
            streams: Vec::new(),
            tiles: Vec::new(),
        };

        res.add_stream(Some(buffer), roi, format, flags);
        res
    }

    /// Adds a stream; a missing `roi` is taken from stream 0.
    pub fn add(
        &mut self,
        buffer: &Arc<RasterBuffer>,
        roi: Option<Rect>,
        format: Option<PixelFormat>,
        flags: Access,
    ) -> usize {
        self.add_stream(Some(buffer), roi, format, flags)
    }

    /// Adds a device scratch stream sized like stream 0, neither pre-read
    /// nor written back.
    pub fn add_aux(&mut self, format: PixelFormat) -> usize {
        self.add_stream(None, None, Some(format), Access::AUX)
    }

    fn add_stream(
        &mut self,
        buffer: Option<&Arc<RasterBuffer>>,
        roi: Option<Rect>,
        format: Option<PixelFormat>,
        mut flags: Access,
    ) -> usize {
        assert!(
            self.streams.len() < self.gpu.info().max_streams,
            "too many iterator streams ({})",
            self.streams.len() + 1
        );
        assert_eq!(self.iteration_no, 0, "streams must be added before iterating");

        let this = self.streams.len();
        let mut rect = roi
            .or_else(|| {
                if this == 0 {
                    buffer.map(|buffer| buffer.extent())
                } else {
                    Some(self.streams[0].rect)
                }
            })
            .expect("stream 0 requires a rectangle or a buffer");

        if this > 0 {
            rect.width = self.streams[0].rect.width;
            rect.height = self.streams[0].rect.height;
        }

        let format = format
            .or_else(|| buffer.map(|buffer| buffer.format()))
            .expect("auxiliary streams require a format");
        let scan = match buffer {
            Some(buffer) => {
                this == 0
                    || scan_compatible(
                        self.streams[0].buffer.as_ref().expect("stream 0 buffer"),
                        self.streams[0].rect.x,
                        self.streams[0].rect.y,
                        buffer,
                        rect.x,
                        rect.y,
                    )
            }
            None => false,
        };

        if scan {
            flags |= Access::SCAN_COMPATIBLE;
        }

        if let Some(buffer) = buffer {
            if format == buffer.format() {
                flags |= Access::FORMAT_COMPATIBLE;
            }
        }

        // geometry only; mirrors are managed per batch
        let tiles = scan.then(|| {
            TileIterator::new(buffer.expect("scan stream buffer"), rect, LockMode::empty())
        });

        self.streams.push(GpuStream {
            buffer: buffer.map(Arc::clone),
            direct: vec![false; self.batch],
            flags,
            format,
            rect,
            roi: vec![Rect::ZERO; self.batch],
            tex: (0..self.batch).map(|_| None).collect(),
            tiles,
        });

        this
    }

    fn lock_buffers(&mut self) {
        for stream in &self.streams {
            let Some(buffer) = &stream.buffer else {
                continue;
            };
            let id = buffer.id();

            if !self.locks.iter().any(|(locked, _)| *locked == id) {
                self.locks.push((id, buffer.lock_arc()));
            }
        }
    }

    /// Write-back of the previous batch: barrier, collect non-direct WRITE
    /// textures into the cache, barrier.
    fn flush_batch(&mut self) -> Result<(), DriverError> {
        let gpu = self.gpu;
        let device = gpu.device();

        // wait for processing
        device.barrier()?;

        for stream in &mut self.streams {
            let write = stream.flags.contains(Access::GPU_WRITE)
                && !stream.flags.contains(Access::AUX);

            for k in 0..self.n {
                if write && !stream.direct[k] {
                    if let Some(StepTex::Pooled(lease)) = &stream.tex[k] {
                        let buffer = stream.buffer.as_ref().expect("write stream buffer");

                        transfer::gpu_set(gpu, buffer, stream.roi[k], stream.format, lease)?;
                    }
                }

                // pooled textures become reusable for the next batch
                stream.tex[k] = None;
            }
        }

        // wait for writing
        device.barrier()?;

        Ok(())
    }

    /// Advances every stream by up to one batch of sub-tiles.
    ///
    /// Returns `Ok(false)` once the geometry is exhausted; call [`end`] (or
    /// drop the iterator) afterwards to flush the queue and release the
    /// buffers.
    ///
    /// [`end`]: Self::end
    #[profiling::function]
    pub fn next(&mut self) -> Result<bool, DriverError> {
        assert!(!self.finished, "next called on a finished device iterator");

        if self.iteration_no == 0 {
            self.lock_buffers();
        } else {
            self.flush_batch()?;
        }

        let gpu = self.gpu;

        self.n = 0;

        let n = advance_gpu_stream(gpu, self.batch, None, &mut self.streams[0], &mut self.tiles)?;
        let result = n > 0;

        self.n = n;

        let rect0 = self.streams[0].rect;
        let roi0: Vec<Rect> = self.streams[0].roi[..n].to_vec();

        for no in 1..self.streams.len() {
            let stream = &mut self.streams[no];

            if stream.tiles.is_some() {
                advance_gpu_stream(gpu, self.batch, Some(n), stream, &mut self.tiles)?;
            } else if result {
                stage_gpu_stream(gpu, n, &roi0, rect0, stream)?;
            }
        }

        gpu.device().barrier()?;

        self.iteration_no += 1;

        if !result {
            self.finished = true;
        }

        Ok(result)
    }

    /// Sub-tiles in the current batch.
    pub fn n(&self) -> usize {
        self.n
    }

    /// The device image of `stream` for sub-tile `k`.
    ///
    /// Pooled images may be larger than the sub-tile; dispatch against
    /// [`size`](Self::size).
    pub fn tex(&self, stream: usize, k: usize) -> &DeviceImage {
        assert!(k < self.n, "sub-tile out of batch");

        match self.streams[stream].tex[k].as_ref().expect("step texture") {
            StepTex::Mirror(tex) => tex,
            StepTex::Pooled(lease) => lease,
        }
    }

    /// The sub-tile rectangle of `stream` in buffer coordinates.
    pub fn roi(&self, stream: usize, k: usize) -> Rect {
        assert!(k < self.n, "sub-tile out of batch");

        self.streams[stream].roi[k]
    }

    /// Width and height of sub-tile `k`.
    pub fn size(&self, stream: usize, k: usize) -> (i32, i32) {
        let roi = self.roi(stream, k);

        (roi.width, roi.height)
    }

    /// The flags of `stream`, including the computed compatibility bits.
    pub fn flags(&self, stream: usize) -> Access {
        self.streams[stream].flags
    }

    /// Flushes the queue and releases every resource.
    ///
    /// Called on an unfinished iterator this behaves as if the iteration
    /// completed naturally with all buffered writes finalised. Runs
    /// automatically on drop.
    pub fn end(&mut self) -> Result<(), DriverError> {
        if self.ended {
            return Ok(());
        }

        self.ended = true;

        let flushed = if self.finished {
            Ok(())
        } else {
            let res = self.flush_batch();

            self.finished = true;
            res
        };
        let finished = self.gpu.device().finish();

        for stream in &mut self.streams {
            for tex in &mut stream.tex {
                *tex = None;
            }
        }

        self.locks.clear();

        for (tile, device_written) in self.tiles.drain(..) {
            if device_written {
                tile.state().lock().device_written();
            }
        }

        trace!("device iteration ended after {} batches", self.iteration_no);

        flushed.and(finished)
    }
}

impl Drop for GpuIterator<'_> {
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        if let Err(err) = self.end() {
            warn!("device iterator cleanup failed: {err}");
        }
    }
}

/// Walks up to one batch of a scan-compatible stream.
///
/// `limit` is `None` for stream 0, which drives the batch size, and the
/// driven size for every other stream.
fn advance_gpu_stream(
    gpu: &Gpu,
    batch: usize,
    limit: Option<usize>,
    stream: &mut GpuStream,
    tiles: &mut Vec<(Tile, bool)>,
) -> Result<usize, DriverError> {
    let GpuStream {
        buffer,
        direct,
        flags,
        format,
        roi,
        tex,
        tiles: stream_tiles,
        ..
    } = stream;
    let buffer = buffer.as_ref().expect("scan stream buffer");
    let walker = stream_tiles.as_mut().expect("scan stream tile iterator");
    let write = flags.contains(Access::GPU_WRITE);

    for k in 0..batch {
        let res = walker.next();

        match limit {
            None => {
                if !res {
                    return Ok(k);
                }
            }
            Some(n) => {
                if k >= n {
                    assert!(!res, "scan-compatible streams disagree on end of iteration");

                    return Ok(n);
                }

                assert!(res, "scan-compatible streams disagree on end of iteration");
            }
        }

        let roi2 = walker.roi2();
        let tile = walker.tile().expect("current tile").clone();
        let full_tile = flags.contains(Access::FORMAT_COMPATIBLE)
            && roi2.width == buffer.tile_width()
            && roi2.height == buffer.tile_height();

        roi[k] = roi2;
        direct[k] = full_tile;

        if full_tile {
            // hand out the tile's own device storage
            let mirror = gpu.tile_mirror(buffer, &tile, flags.contains(Access::GPU_READ))?;

            tex[k] = Some(StepTex::Mirror(mirror));
        } else {
            let lease =
                gpu.lease_image(ImageInfo::new_2d(*format, roi2.width, roi2.height).build())?;

            if flags.contains(Access::GPU_READ) {
                transfer::gpu_get(gpu, buffer, roi2, *format, &lease)?;
            }

            tex[k] = Some(StepTex::Pooled(lease));
        }

        // keep the tile alive until the iteration ends
        tiles.push((tile, write && full_tile));
    }

    Ok(limit.unwrap_or(batch).min(batch))
}

/// Stages one batch of a scan-incompatible or auxiliary stream with the
/// geometry of stream 0.
fn stage_gpu_stream(
    gpu: &Gpu,
    n: usize,
    roi0: &[Rect],
    rect0: Rect,
    stream: &mut GpuStream,
) -> Result<(), DriverError> {
    for k in 0..n {
        let roi = roi0[k].translate(stream.rect.x - rect0.x, stream.rect.y - rect0.y);

        stream.roi[k] = roi;
        stream.direct[k] = false;

        let lease =
            gpu.lease_image(ImageInfo::new_2d(stream.format, roi.width, roi.height).build())?;

        if stream.flags.contains(Access::GPU_READ) && !stream.flags.contains(Access::AUX) {
            let buffer = stream.buffer.as_ref().expect("stream buffer");

            transfer::gpu_get(gpu, buffer, roi, stream.format, &lease)?;
        }

        stream.tex[k] = Some(StepTex::Pooled(lease));
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{buffer::BufferInfo, color, driver::SoftDevice},
    };

    fn pair() -> (Arc<SoftDevice>, Gpu) {
        let device = Arc::new(SoftDevice::new());
        let gpu = Gpu::new(device.clone());

        (device, gpu)
    }

    fn seeded_buffer(extent: Rect) -> (Arc<RasterBuffer>, Vec<u8>) {
        let buffer = RasterBuffer::new(BufferInfo::new(extent, PixelFormat::RgbaF32));
        let seed: Vec<u8> = {
            let mut px = [0u8; 16];

            color::encode_px(PixelFormat::RgbaF32, [0.25, 0.5, 0.75, 1.0], &mut px);

            px.iter()
                .copied()
                .cycle()
                .take(extent.area() as usize * 16)
                .collect()
        };

        buffer.set(extent, PixelFormat::RgbaF32, &seed, None);

        (buffer, seed)
    }

    fn run_copy(gpu: &Gpu, src: &Arc<RasterBuffer>, dst: &Arc<RasterBuffer>, roi: Rect) -> usize {
        let mut iter = GpuIterator::new(gpu, dst, Some(roi), None, Access::GPU_WRITE);
        let read = iter.add(src, Some(roi), None, Access::GPU_READ);
        let mut batches = 0;

        while iter.next().unwrap() {
            batches += 1;

            for k in 0..iter.n() {
                let size = iter.size(0, k);

                gpu.device()
                    .copy_image(iter.tex(read, k), (0, 0), iter.tex(0, k), (0, 0), size)
                    .unwrap();
            }
        }

        iter.end().unwrap();
        batches
    }

    #[test]
    fn aligned_copy_runs_direct() {
        let (device, gpu) = pair();
        let extent = Rect::new(0, 0, 512, 512);
        let (src, seed) = seeded_buffer(extent);
        let dst = RasterBuffer::new(BufferInfo::new(extent, PixelFormat::RgbaF32));

        // 16 tiles in batches of 4
        assert_eq!(run_copy(&gpu, &src, &dst, extent), 4);
        assert!(device.barrier_count() > 0);
        assert!(device.finish_count() >= 1);

        let mut copied = vec![0u8; seed.len()];

        gpu.read(&dst, extent, PixelFormat::RgbaF32, &mut copied);

        assert_eq!(seed, copied);
    }

    #[test]
    fn unaligned_copy_write_allocates() {
        let (_, gpu) = pair();
        let extent = Rect::new(0, 0, 512, 512);
        let roi = Rect::new(0, 0, 300, 300);
        let (src, _seed) = seeded_buffer(extent);
        let dst = RasterBuffer::new(BufferInfo::new(extent, PixelFormat::RgbaF32));

        // 3x3 sub-tiles in batches of 4
        assert_eq!(run_copy(&gpu, &src, &dst, roi), 3);

        // the edge strips live in the cache as dirty entries
        assert!(gpu.with_cache(|cache| cache.len()) > 0);

        let mut copied = vec![0u8; roi.area() as usize * 16];

        gpu.read(&dst, roi, PixelFormat::RgbaF32, &mut copied);

        let expect: Vec<u8> = {
            let mut data = vec![0u8; roi.area() as usize * 16];

            src.get(roi, PixelFormat::RgbaF32, &mut data, None);
            data
        };

        assert_eq!(expect, copied);
    }

    #[test]
    fn aux_streams_are_bare_scratch() {
        let (_, gpu) = pair();
        let extent = Rect::new(0, 0, 256, 256);
        let (src, _) = seeded_buffer(extent);
        let dst = RasterBuffer::new(BufferInfo::new(extent, PixelFormat::RgbaF32));
        let mut iter = GpuIterator::new(&gpu, &dst, None, None, Access::GPU_WRITE);
        let read = iter.add(&src, None, None, Access::GPU_READ);
        let aux = iter.add_aux(PixelFormat::YF32);

        assert!(!iter.flags(aux).contains(Access::SCAN_COMPATIBLE));

        while iter.next().unwrap() {
            for k in 0..iter.n() {
                assert_eq!(iter.roi(aux, k), iter.roi(0, k));
                assert_eq!(iter.tex(aux, k).info.fmt, PixelFormat::YF32);

                let size = iter.size(0, k);

                gpu.device()
                    .copy_image(iter.tex(read, k), (0, 0), iter.tex(0, k), (0, 0), size)
                    .unwrap();
            }
        }
    }

    #[test]
    fn drop_finalizes_buffered_writes() {
        let (device, gpu) = pair();
        let extent = Rect::new(0, 0, 256, 256);
        let (src, seed) = seeded_buffer(extent);
        let dst = RasterBuffer::new(BufferInfo::new(extent, PixelFormat::RgbaF32));

        {
            let mut iter = GpuIterator::new(&gpu, &dst, None, None, Access::GPU_WRITE);
            let read = iter.add(&src, None, None, Access::GPU_READ);

            // stop after the first batch without calling end
            assert!(iter.next().unwrap());

            for k in 0..iter.n() {
                let size = iter.size(0, k);

                gpu.device()
                    .copy_image(iter.tex(read, k), (0, 0), iter.tex(0, k), (0, 0), size)
                    .unwrap();
            }
        }

        assert!(device.finish_count() >= 1);

        // the one processed batch landed in the destination
        let mut copied = vec![0u8; 128 * 128 * 16];

        gpu.read(&dst, Rect::new(0, 0, 128, 128), PixelFormat::RgbaF32, &mut copied);

        assert_eq!(&seed[..copied.len()], &copied[..]);
    }

    #[test]
    fn tile_references_survive_the_iteration() {
        let (_, gpu) = pair();
        let extent = Rect::new(0, 0, 256, 256);
        let (src, _) = seeded_buffer(extent);
        let dst = RasterBuffer::new(BufferInfo::new(extent, PixelFormat::RgbaF32));
        let mut iter = GpuIterator::new(&gpu, &dst, None, None, Access::GPU_WRITE);

        iter.add(&src, None, None, Access::GPU_READ);

        while iter.next().unwrap() {}

        // 4 destination tiles + 4 source tiles referenced
        assert_eq!(iter.tiles.len(), 8);

        iter.end().unwrap();

        assert!(iter.tiles.is_empty());
    }
}
