//! Transfer and conversion paths between cache textures, host memory and the
//! tile store.

use {
    super::CacheMode,
    crate::{
        buffer::RasterBuffer,
        color::{self, ColorOp, PixelFormat},
        driver::{Device, DeviceImage, DriverError, ImageInfo, MemAccess},
        gpu::Gpu,
        math::Rect,
    },
    log::{debug, warn},
    std::sync::Arc,
};

/// A `NoCache` temporary, disposed on every exit path.
struct TempTex<'a> {
    gpu: &'a Gpu,
    tex: Option<Arc<DeviceImage>>,
}

impl<'a> TempTex<'a> {
    fn request(
        gpu: &'a Gpu,
        buffer: &Arc<RasterBuffer>,
        fmt: PixelFormat,
        roi: Rect,
    ) -> Result<Self, DriverError> {
        let tex = gpu.cache_request(buffer, MemAccess::READ_WRITE, fmt, roi, CacheMode::NoCache)?;

        Ok(Self {
            gpu,
            tex: Some(tex),
        })
    }

    fn tex(&self) -> &Arc<DeviceImage> {
        self.tex.as_ref().expect("live temporary")
    }
}

impl Drop for TempTex<'_> {
    fn drop(&mut self) {
        if let Some(tex) = self.tex.take() {
            self.gpu.cache_dispose(&tex);
        }
    }
}

/// Tries to satisfy a host read of `roi` in `fmt` straight from the cache.
///
/// Returns `true` iff served; on `false` the intersecting entries have been
/// merged home so the caller can fall back to the tile store.
#[profiling::function]
pub(crate) fn cache_from(
    gpu: &Gpu,
    buffer: &Arc<RasterBuffer>,
    roi: Rect,
    dest: &mut [u8],
    fmt: PixelFormat,
    rowstride: Option<usize>,
) -> bool {
    let small = gpu.info().small_read;

    // no point in using the device for small reads
    if roi.width >= small && roi.height >= small {
        // why bring data from the device if it is already there
        let hit = gpu.with_cache(|cache| cache.find_dirty_containing(buffer.id(), roi));

        if let Some((tex, entry_roi)) = hit {
            match read_hit(gpu, buffer, &tex, entry_roi, roi, dest, fmt, rowstride) {
                Ok(true) => {
                    gpu.with_cache(|cache| cache.bump_tex(&tex));
                    debug!("cache hit buffer {} {}", buffer.id(), roi);

                    return true;
                }
                Ok(false) => {}
                Err(err) => warn!("device read path failed: {err}"),
            }
        }
    }

    // merge entries that intersect the request so the tile store is current
    gpu.cache_invalidate(buffer, roi);

    false
}

#[allow(clippy::too_many_arguments)]
fn read_hit(
    gpu: &Gpu,
    buffer: &Arc<RasterBuffer>,
    tex: &Arc<DeviceImage>,
    entry_roi: Rect,
    roi: Rect,
    dest: &mut [u8],
    fmt: PixelFormat,
    rowstride: Option<usize>,
) -> Result<bool, DriverError> {
    let device = gpu.device();
    let origin = (roi.x - entry_roi.x, roi.y - entry_roi.y);
    let region = (roi.width, roi.height);
    let stride = rowstride.unwrap_or(0);

    match color::conversion(buffer.format(), fmt) {
        ColorOp::Unsupported => Ok(false),
        ColorOp::Equal => {
            device.read_image(tex, origin, region, stride, dest)?;

            Ok(true)
        }
        ColorOp::Convert(..) => {
            let aux = TempTex::request(gpu, buffer, fmt, roi)?;

            if entry_roi.width == roi.width && entry_roi.height == roi.height {
                convert_image(gpu, tex, aux.tex(), region, buffer.format(), fmt)?;
            } else {
                let staged = TempTex::request(gpu, buffer, buffer.format(), roi)?;

                device.copy_image(tex, origin, staged.tex(), (0, 0), region)?;
                device.barrier()?;
                convert_image(gpu, staged.tex(), aux.tex(), region, buffer.format(), fmt)?;
            }

            device.read_image(aux.tex(), (0, 0), region, stride, dest)?;

            Ok(true)
        }
    }
}

/// Runs the conversion between two registry formats over `region`, staging
/// two-pass conversions through a pooled linear image.
pub(crate) fn convert_image(
    gpu: &Gpu,
    src: &DeviceImage,
    dst: &DeviceImage,
    region: (i32, i32),
    from: PixelFormat,
    to: PixelFormat,
) -> Result<(), DriverError> {
    let device = gpu.device();

    match color::conversion(from, to) {
        ColorOp::Unsupported => Err(DriverError::Unsupported),
        ColorOp::Equal => device.copy_image(src, (0, 0), dst, (0, 0), region),
        ColorOp::Convert(kernel, None) => device.convert_image(kernel, src, dst, region),
        ColorOp::Convert(first, Some(second)) => {
            let staged = gpu.lease_image(
                ImageInfo::new_2d(PixelFormat::RgbaF32, region.0, region.1).build(),
            )?;

            device.convert_image(first, src, &staged, region)?;
            device.barrier()?;
            device.convert_image(second, &staged, dst, region)
        }
    }
}

/// Fills a device image from `roi` of the tile store; the device-side read
/// path of the iterator.
#[profiling::function]
pub(crate) fn gpu_get(
    gpu: &Gpu,
    buffer: &Arc<RasterBuffer>,
    roi: Rect,
    fmt: PixelFormat,
    tex: &DeviceImage,
) -> Result<(), DriverError> {
    // device-resident dirty regions must land home before we re-read them
    gpu.cache_invalidate(buffer, roi);

    let bpp = fmt.bytes_per_pixel();
    let len = roi.area() as usize * bpp;
    let mut staged = gpu.lease_scratch(len);

    gpu.workers()
        .transfer(buffer, &mut staged[..len], bpp, roi, fmt, false);

    gpu.device()
        .write_image(tex, (0, 0), (roi.width, roi.height), 0, &staged[..len])
}

/// Installs a device-produced image as the cached copy of `roi`.
///
/// This is the write-allocate half of the cache: the data stays on the
/// device as a `Dirty` entry. When the conversion to the buffer's native
/// format is not compiled, the data takes the staging pool and the worker
/// threads home instead.
#[profiling::function]
pub(crate) fn gpu_set(
    gpu: &Gpu,
    buffer: &Arc<RasterBuffer>,
    roi: Rect,
    fmt: PixelFormat,
    tex: &DeviceImage,
) -> Result<(), DriverError> {
    if color::conversion(fmt, buffer.format()) == ColorOp::Unsupported {
        let bpp = fmt.bytes_per_pixel();
        let len = roi.area() as usize * bpp;
        let mut staged = gpu.lease_scratch(len);

        gpu.device()
            .read_image(tex, (0, 0), (roi.width, roi.height), 0, &mut staged[..len])?;
        gpu.workers()
            .transfer(buffer, &mut staged[..len], bpp, roi, fmt, true);

        return Ok(());
    }

    let entry =
        gpu.cache_request(buffer, MemAccess::READ_WRITE, buffer.format(), roi, CacheMode::NoCache)?;

    match convert_image(gpu, tex, &entry, (roi.width, roi.height), fmt, buffer.format()) {
        Ok(()) => {
            gpu.with_cache(|cache| cache.promote(&entry, CacheMode::Dirty));

            Ok(())
        }
        Err(err) => {
            gpu.cache_dispose(&entry);

            Err(err)
        }
    }
}
