//! The engine object tying the device gateway, cache, pools and workers
//! together.

use {
    crate::{
        buffer::{RasterBuffer, Tile, TileSync},
        cache::{transfer, CacheMode, TexCache},
        color::PixelFormat,
        driver::{Device, DeviceImage, DriverError, ImageInfo, MemAccess},
        math::Rect,
        pool::{ImagePool, Lease, ScratchBuf, ScratchPool},
        worker::WorkerPool,
    },
    derive_builder::{Builder, UninitializedFieldError},
    log::debug,
    parking_lot::Mutex,
    std::sync::{Arc, OnceLock},
};

/// Default cap on streams in one iterator.
pub const MAX_STREAMS: usize = 6;

/// Default sub-tiles handed to the operation per device batch.
pub const BATCH_TILES: usize = 4;

/// Default CPU threads staging tile data for transfers.
pub const WORKER_THREADS: usize = 4;

/// Default edge length below which reads skip the device path.
pub const SMALL_READ: i32 = 256;

/// Engine tuning knobs.
#[derive(Builder, Clone, Copy, Debug)]
#[builder(
    build_fn(private, name = "fallible_build", error = "GpuInfoBuilderError"),
    derive(Clone, Copy, Debug),
    pattern = "owned"
)]
#[non_exhaustive]
pub struct GpuInfo {
    /// Sub-tiles handed to the operation per device batch.
    #[builder(default = "BATCH_TILES", setter(strip_option))]
    pub batch_tiles: usize,

    /// Maximum streams an iterator may multiplex.
    #[builder(default = "MAX_STREAMS", setter(strip_option))]
    pub max_streams: usize,

    /// Reads with either dimension below this skip the device path; the
    /// round-trip loses to tile reassembly for small rectangles.
    #[builder(default = "SMALL_READ", setter(strip_option))]
    pub small_read: i32,

    /// CPU threads staging tile data for transfers.
    #[builder(default = "WORKER_THREADS", setter(strip_option))]
    pub workers: usize,
}

impl Default for GpuInfo {
    fn default() -> Self {
        GpuInfoBuilder::default().build()
    }
}

impl GpuInfoBuilder {
    /// Builds a new `GpuInfo`.
    pub fn build(self) -> GpuInfo {
        self.fallible_build()
            .expect("All required fields set at initialization")
    }
}

impl From<GpuInfoBuilder> for GpuInfo {
    fn from(info: GpuInfoBuilder) -> Self {
        info.build()
    }
}

#[derive(Debug)]
struct GpuInfoBuilderError;

impl From<UninitializedFieldError> for GpuInfoBuilderError {
    fn from(_: UninitializedFieldError) -> Self {
        Self
    }
}

/// A device, its texture cache, the staging pools and the worker threads.
///
/// One `Gpu` replaces the process-wide state of a typical device runtime;
/// create one per device and share it by reference. The cache surface is
/// internally synchronised, but iteration over a single buffer from several
/// threads at once is the caller's contract to avoid; iterators hold the
/// buffer lock for exactly this reason.
#[derive(Debug)]
pub struct Gpu {
    cache: Mutex<TexCache>,
    device: Arc<dyn Device>,
    images: ImagePool,
    info: GpuInfo,
    scratch: ScratchPool,
    workers: OnceLock<WorkerPool>,
}

impl Gpu {
    /// Constructs a new `Gpu` over a device.
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self::with_info(device, GpuInfo::default())
    }

    /// Constructs a new `Gpu` with the given tuning knobs.
    pub fn with_info(device: Arc<dyn Device>, info: impl Into<GpuInfo>) -> Self {
        let info = info.into();

        debug!("new engine: {:?}", info);

        Self {
            cache: Mutex::new(TexCache::new(Arc::clone(&device))),
            device,
            images: ImagePool::new(),
            info,
            scratch: ScratchPool::new(),
            workers: OnceLock::new(),
        }
    }

    /// The device gateway.
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// The tuning knobs this engine runs with.
    pub fn info(&self) -> GpuInfo {
        self.info
    }

    pub(crate) fn with_cache<R>(&self, f: impl FnOnce(&mut TexCache) -> R) -> R {
        f(&mut self.cache.lock())
    }

    pub(crate) fn workers(&self) -> &WorkerPool {
        self.workers
            .get_or_init(|| WorkerPool::new(self.info.workers))
    }

    pub(crate) fn lease_scratch(&self, size: usize) -> Lease<ScratchBuf> {
        self.scratch.lease(size)
    }

    /// Leases a pooled device image, evicting cache entries under memory
    /// pressure.
    ///
    /// The pools themselves never touch the cache, so an eviction triggered
    /// here cannot re-enter the pool it came from.
    pub(crate) fn lease_image(
        &self,
        info: impl Into<ImageInfo>,
    ) -> Result<Lease<DeviceImage>, DriverError> {
        let info = info.into();

        loop {
            match self.images.lease(&self.device, info) {
                Ok(lease) => return Ok(lease),
                Err(DriverError::OutOfMemory) => {
                    if !self.with_cache(|cache| cache.evict_tail()) {
                        return Err(DriverError::OutOfMemory);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// The device mirror of a tile, created and optionally uploaded on
    /// demand.
    pub(crate) fn tile_mirror(
        &self,
        buffer: &RasterBuffer,
        tile: &Tile,
        upload: bool,
    ) -> Result<Arc<DeviceImage>, DriverError> {
        fn upload_mirror(
            mirror: &Arc<DeviceImage>,
            state: &mut crate::buffer::TileState,
        ) -> Result<(), DriverError> {
            if state.sync == TileSync::Host {
                let region = (mirror.info.width, mirror.info.height);

                mirror
                    .device()
                    .write_image(mirror, (0, 0), region, 0, &state.bytes)?;

                state.sync = TileSync::Both;
            }

            Ok(())
        }

        {
            let mut state = tile.state().lock();

            if let Some(mirror) = state.mirror.clone() {
                if upload {
                    upload_mirror(&mirror, &mut state)?;
                }

                return Ok(mirror);
            }
        }

        // allocate outside the tile lock; an eviction write-back may need to
        // touch this very tile
        let info = ImageInfo::new_2d(buffer.format(), buffer.tile_width(), buffer.tile_height())
            .build();
        let image = Arc::new(self.with_cache(|cache| cache.create_evicting(info))?);

        let mut state = tile.state().lock();
        let mirror = state.mirror.get_or_insert_with(|| image).clone();

        if upload {
            upload_mirror(&mirror, &mut state)?;
        }

        Ok(mirror)
    }

    /// Exact-rectangle cache lookup.
    pub fn cache_get(&self, buffer: &Arc<RasterBuffer>, roi: Rect) -> Option<Arc<DeviceImage>> {
        self.with_cache(|cache| cache.get(buffer.id(), roi))
    }

    /// Installs a texture as the cache entry for `roi`.
    pub fn cache_set(
        &self,
        buffer: &Arc<RasterBuffer>,
        tex: Arc<DeviceImage>,
        roi: Rect,
        mode: CacheMode,
    ) {
        self.with_cache(|cache| cache.set(buffer, tex, roi, mode));
    }

    /// Allocates and installs a cache texture for `roi`, evicting under
    /// memory pressure. Fails only once the cache has nothing left to give
    /// back.
    pub fn cache_request(
        &self,
        buffer: &Arc<RasterBuffer>,
        access: MemAccess,
        fmt: PixelFormat,
        roi: Rect,
        mode: CacheMode,
    ) -> Result<Arc<DeviceImage>, DriverError> {
        self.with_cache(|cache| cache.request(buffer, access, fmt, roi, mode))
    }

    /// Merges (if dirty) and destroys the cache entry owning `tex`.
    pub fn cache_dispose(&self, tex: &Arc<DeviceImage>) -> bool {
        self.with_cache(|cache| cache.dispose(tex))
    }

    /// Merges every entry of `buffer` intersecting `roi` back to the tile
    /// store.
    pub fn cache_invalidate(&self, buffer: &Arc<RasterBuffer>, roi: Rect) {
        self.with_cache(|cache| cache.invalidate(buffer.id(), roi));
    }

    /// Disposes entries contained by `roi`; merge-disposes entries
    /// intersecting it.
    pub fn cache_clear(&self, buffer: &Arc<RasterBuffer>, roi: Rect) {
        self.with_cache(|cache| cache.clear(buffer.id(), roi));
    }

    /// Disposes every entry of `buffer`.
    pub fn cache_remove(&self, buffer: &Arc<RasterBuffer>) {
        self.with_cache(|cache| cache.remove_buffer(buffer.id()));
    }

    /// Tries to satisfy a host read of `roi` in `fmt` straight from the
    /// cache; see the transfer path for the policy.
    ///
    /// Returns `true` iff served from the cache. On `false` the intersecting
    /// entries have been merged home, so a tile store read observes current
    /// data.
    #[profiling::function]
    pub fn cache_from(
        &self,
        buffer: &Arc<RasterBuffer>,
        roi: Rect,
        dest: &mut [u8],
        fmt: PixelFormat,
        rowstride: Option<usize>,
    ) -> bool {
        transfer::cache_from(self, buffer, roi, dest, fmt, rowstride)
    }

    /// Coherent read: the device cache first, the tile store otherwise.
    pub fn read(&self, buffer: &Arc<RasterBuffer>, roi: Rect, fmt: PixelFormat, dest: &mut [u8]) {
        if !self.cache_from(buffer, roi, dest, fmt, None) {
            buffer.get(roi, fmt, dest, None);
        }
    }

    /// Disposes every cache entry, stops the worker threads and drops the
    /// pooled resources.
    pub fn teardown(&mut self) {
        self.with_cache(|cache| cache.teardown());
        self.workers.take();
        self.images.clear();
        self.scratch.clear();
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{buffer::BufferInfo, driver::SoftDevice},
    };

    #[test]
    fn info_defaults() {
        let info = GpuInfo::default();

        assert_eq!(info.batch_tiles, BATCH_TILES);
        assert_eq!(info.max_streams, MAX_STREAMS);
        assert_eq!(info.small_read, SMALL_READ);
        assert_eq!(info.workers, WORKER_THREADS);

        let info = GpuInfoBuilder::default().small_read(64).build();

        assert_eq!(info.small_read, 64);
        assert_eq!(info.workers, WORKER_THREADS);
    }

    #[test]
    fn lease_image_evicts_under_pressure() {
        // one 128x128 float image fits at a time
        let device = Arc::new(SoftDevice::with_mem_limit(128 * 128 * 16 + 1024));
        let gpu = Gpu::new(device.clone());
        let buffer = RasterBuffer::new(BufferInfo::new(
            Rect::new(0, 0, 512, 512),
            PixelFormat::RgbaF32,
        ));

        gpu.cache_request(
            &buffer,
            MemAccess::READ_WRITE,
            PixelFormat::RgbaF32,
            Rect::new(0, 0, 128, 128),
            CacheMode::Dirty,
        )
        .unwrap();

        // the pool lease can only succeed by evicting the cache entry
        let lease = gpu
            .lease_image(ImageInfo::new_2d(PixelFormat::RgbaF32, 128, 128))
            .unwrap();

        assert_eq!(gpu.with_cache(|cache| cache.len()), 0);
        assert!(device.finish_count() > 0);

        drop(lease);
    }

    #[test]
    fn teardown_releases_everything() {
        let device = Arc::new(SoftDevice::new());
        let mut gpu = Gpu::new(device.clone());
        let buffer = RasterBuffer::new(BufferInfo::new(
            Rect::new(0, 0, 256, 256),
            PixelFormat::RgbaF32,
        ));

        gpu.cache_request(
            &buffer,
            MemAccess::READ_WRITE,
            PixelFormat::RgbaF32,
            Rect::new(0, 0, 128, 128),
            CacheMode::Clean,
        )
        .unwrap();
        drop(gpu.lease_image(ImageInfo::new_2d(PixelFormat::RgbaF32, 64, 64)).unwrap());

        assert!(device.image_count() > 0);

        gpu.teardown();

        assert_eq!(device.image_count(), 0);
    }

    #[test]
    fn mirrors_are_created_once() {
        let device = Arc::new(SoftDevice::new());
        let gpu = Gpu::new(device.clone());
        let buffer = RasterBuffer::new(BufferInfo::new(
            Rect::new(0, 0, 256, 256),
            PixelFormat::RgbaF32,
        ));
        let tile = buffer.tile(0, 0);

        let first = gpu.tile_mirror(&buffer, &tile, true).unwrap();
        let again = gpu.tile_mirror(&buffer, &tile, true).unwrap();

        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(device.image_count(), 1);
    }
}
