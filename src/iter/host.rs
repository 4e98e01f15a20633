//! Multi-stream host iteration.

use {
    super::{scan_compatible, Access},
    crate::{
        buffer::{BufferGuard, LockMode, RasterBuffer},
        color::PixelFormat,
        gpu::Gpu,
        iter::tile::TileIterator,
        math::Rect,
        pool::{Lease, ScratchBuf},
    },
    log::trace,
    std::sync::Arc,
};

struct Stream {
    buffer: Arc<RasterBuffer>,
    direct: bool,
    flags: Access,
    format: PixelFormat,
    rect: Rect,
    roi: Rect,
    scratch: Option<Lease<ScratchBuf>>,
    tiles: Option<TileIterator>,
}

/// Multiplexes tile iterators over several buffers, handing host memory to
/// the operation step by step.
///
/// The first stream fixes the iteration geometry. Scan-compatible streams
/// walk their own tiles and, when the step covers a full tile width in the
/// buffer's native format, expose the tile storage directly; every other
/// stream is staged through the scratch pool. The iterator owns the buffer
/// locks from the first [`next`] until the step that returns `false`, which
/// also releases all pooled resources.
///
/// [`next`]: Self::next
pub struct HostIterator<'a> {
    finished: bool,
    gpu: &'a Gpu,
    iteration_no: usize,
    length: usize,
    locks: Vec<(u64, BufferGuard)>,
    streams: Vec<Stream>,
}

impl<'a> HostIterator<'a> {
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
            finished: false,
            gpu,
            iteration_no: 0,
            length: 0,
            locks: Vec::new(),
            streams: Vec::new(),
        };

        res.add_stream(buffer, roi, format, flags);
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
        self.add_stream(buffer, roi, format, flags)
    }

    fn add_stream(
        &mut self,
        buffer: &Arc<RasterBuffer>,
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
        let mut rect = roi.unwrap_or_else(|| {
            if this == 0 {
                buffer.extent()
            } else {
                self.streams[0].rect
            }
        });

        if this > 0 {
            // all streams share the width and height of the first one
            rect.width = self.streams[0].rect.width;
            rect.height = self.streams[0].rect.height;
        }

        let format = format.unwrap_or_else(|| buffer.format());
        let scan = this == 0
            || scan_compatible(
                &self.streams[0].buffer,
                self.streams[0].rect.x,
                self.streams[0].rect.y,
                buffer,
                rect.x,
                rect.y,
            );

        if scan {
            flags |= Access::SCAN_COMPATIBLE;
        }

        if format == buffer.format() {
            flags |= Access::FORMAT_COMPATIBLE;
        }

        let lock_mode = if flags.contains(Access::WRITE) {
            LockMode::WRITE
        } else {
            LockMode::READ
        };
        let tiles = scan.then(|| TileIterator::new(buffer, rect, lock_mode));

        self.streams.push(Stream {
            buffer: Arc::clone(buffer),
            direct: false,
            flags,
            format,
            rect,
            roi: Rect::ZERO,
            scratch: None,
            tiles,
        });

        this
    }

    fn lock_buffers(&mut self) {
        for stream in &self.streams {
            let id = stream.buffer.id();

            if !self.locks.iter().any(|(locked, _)| *locked == id) {
                self.locks.push((id, stream.buffer.lock_arc()));
            }
        }
    }

    fn flush_writes(&mut self) {
        for stream in &mut self.streams {
            if stream.flags.contains(Access::WRITE) && !stream.direct {
                // direct writes are already in place
                if let Some(scratch) = &stream.scratch {
                    let len = stream.roi.area() as usize * stream.format.bytes_per_pixel();

                    stream.buffer.set(stream.roi, stream.format, &scratch[..len], None);
                }
            }
        }
    }

    /// Advances every stream in lockstep.
    ///
    /// Returns `false` once the geometry is exhausted; that call flushes
    /// pending writes, unlocks the buffers and releases the staging buffers,
    /// after which the per-stream accessors must not be used.
    #[profiling::function]
    pub fn next(&mut self) -> bool {
        assert!(!self.finished, "next called on a finished iterator");

        if self.iteration_no == 0 {
            self.lock_buffers();
        } else {
            // complete pending write work first
            self.flush_writes();
        }

        let gpu = self.gpu;
        let result = advance_scan_stream(gpu, &mut self.streams[0]);
        let rect0 = self.streams[0].rect;
        let roi0 = self.streams[0].roi;

        for no in 1..self.streams.len() {
            let stream = &mut self.streams[no];

            if stream.tiles.is_some() {
                let res = advance_scan_stream(gpu, stream);

                // the tile grids agree, so this cannot diverge
                assert_eq!(res, result, "scan-compatible streams disagree on end of iteration");
            } else if result {
                // geometry copied from stream 0
                stream.roi = roi0.translate(stream.rect.x - rect0.x, stream.rect.y - rect0.y);
                stream.direct = false;

                stage_stream(gpu, stream);
            }
        }

        if result {
            self.length = roi0.area() as usize;
        }

        self.iteration_no += 1;

        if !result {
            self.finish_up();
        }

        result
    }

    fn finish_up(&mut self) {
        for stream in &mut self.streams {
            stream.scratch = None;
        }

        self.locks.clear();
        self.finished = true;

        trace!("host iteration finished after {} steps", self.iteration_no);
    }

    /// Pixels in the current step.
    pub fn length(&self) -> usize {
        self.length
    }

    /// The current step of `stream` in buffer coordinates.
    pub fn roi(&self, stream: usize) -> Rect {
        self.streams[stream].roi
    }

    /// The flags of `stream`, including the computed compatibility bits.
    pub fn flags(&self, stream: usize) -> Access {
        self.streams[stream].flags
    }

    /// Data of `stream` for the current step.
    pub fn data(&mut self, stream: usize) -> &mut [u8] {
        assert!(!self.finished, "data access on a finished iterator");

        stream_data(&mut self.streams[stream])
    }

    /// Data of two distinct streams at once, the common read/write pairing.
    pub fn data_pair(&mut self, read: usize, write: usize) -> (&[u8], &mut [u8]) {
        assert!(!self.finished, "data access on a finished iterator");
        assert_ne!(
            read, write,
            "in-place access uses a single READ | WRITE stream"
        );

        if read < write {
            let (head, tail) = self.streams.split_at_mut(write);

            (stream_data(&mut head[read]), stream_data(&mut tail[0]))
        } else {
            let (head, tail) = self.streams.split_at_mut(read);
            let write_data = stream_data(&mut head[write]);
            let read_data = stream_data(&mut tail[0]);

            (read_data, write_data)
        }
    }
}

fn advance_scan_stream(gpu: &Gpu, stream: &mut Stream) -> bool {
    let Some(tiles) = stream.tiles.as_mut() else {
        return false;
    };

    if !tiles.next() {
        return false;
    }

    stream.roi = tiles.roi2();
    stream.direct = stream.flags.contains(Access::FORMAT_COMPATIBLE)
        && stream.roi.width == stream.buffer.tile_width();

    if !stream.direct {
        stage_stream(gpu, stream);
    }

    true
}

fn stage_stream(gpu: &Gpu, stream: &mut Stream) {
    let bpp = stream.format.bytes_per_pixel();
    let max_size = (stream.buffer.tile_width() * stream.buffer.tile_height()) as usize;

    if stream.scratch.is_none() {
        stream.scratch = Some(gpu.lease_scratch(max_size * bpp));
    }

    if stream.flags.contains(Access::READ) {
        let len = stream.roi.area() as usize * bpp;
        let scratch = stream.scratch.as_mut().expect("staged stream");

        stream
            .buffer
            .get(stream.roi, stream.format, &mut scratch[..len], None);
    }
}

fn stream_data(stream: &mut Stream) -> &mut [u8] {
    if stream.direct {
        stream
            .tiles
            .as_mut()
            .expect("direct access stream")
            .sub_data()
    } else {
        let len = stream.roi.area() as usize * stream.format.bytes_per_pixel();
        let scratch = stream.scratch.as_mut().expect("staged stream");

        &mut scratch[..len]
    }
}
