//! Tiled raster buffers and their tile storage.
//!
//! A [`RasterBuffer`] is the CPU-side canonical store: a sparse grid of
//! fixed-size tiles created lazily and zero-filled. Tiles may carry a device
//! mirror; a per-tile sync state records which side holds the current bytes
//! so host reads transparently pull device-produced data home.
//!
//! Buffers are not internally synchronised beyond short per-tile critical
//! sections; callers serialise whole-buffer iteration through the buffer
//! lock, as the iterators do.

use {
    crate::{
        color::{self, PixelFormat},
        driver::{Device, DeviceImage},
        math::{tile_index, tile_offset, Rect},
    },
    bitflags::bitflags,
    derive_builder::{Builder, UninitializedFieldError},
    log::warn,
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        fmt::{Debug, Formatter},
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
    },
};

pub(crate) type TileGuard = parking_lot::lock_api::ArcMutexGuard<parking_lot::RawMutex, TileState>;
pub(crate) type BufferGuard = parking_lot::lock_api::ArcMutexGuard<parking_lot::RawMutex, ()>;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

bitflags! {
    /// How an iteration step intends to touch a tile's host storage.
    ///
    /// Device access is not a tile lock mode: the device iterator walks the
    /// grid with an empty mode and manages tile mirrors itself.
    pub struct LockMode: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// Which side of a tile holds the current bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum TileSync {
    /// Host bytes are current; the mirror, if any, is stale.
    Host,

    /// The device mirror is current; host bytes are stale.
    Device,

    /// Both copies agree.
    Both,
}

/// Storage of one tile.
pub(crate) struct TileState {
    pub bytes: Box<[u8]>,
    pub mirror: Option<Arc<DeviceImage>>,
    pub sync: TileSync,
}

impl TileState {
    /// Makes the host bytes current, pulling from the mirror if needed.
    pub fn sync_host(&mut self) {
        if self.sync == TileSync::Device {
            if let Some(mirror) = &self.mirror {
                let region = (mirror.info.width, mirror.info.height);

                if let Err(err) =
                    mirror
                        .device()
                        .read_image(mirror, (0, 0), region, 0, &mut self.bytes)
                {
                    warn!("tile download failed: {err}");
                }
            }

            self.sync = TileSync::Both;
        }
    }

    /// Records a host-side write; the mirror is stale from here on.
    pub fn host_written(&mut self) {
        self.sync = TileSync::Host;
    }

    /// Records a device-side write; host bytes are stale from here on.
    pub fn device_written(&mut self) {
        self.sync = TileSync::Device;
    }
}

/// One fixed-size block of pixels, shared between the host store and its
/// optional device mirror.
#[derive(Clone)]
pub struct Tile {
    state: Arc<Mutex<TileState>>,
}

impl Tile {
    fn new(size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(TileState {
                bytes: vec![0u8; size].into_boxed_slice(),
                mirror: None,
                sync: TileSync::Host,
            })),
        }
    }

    pub(crate) fn state(&self) -> &Arc<Mutex<TileState>> {
        &self.state
    }
}

impl Debug for Tile {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tile").finish_non_exhaustive()
    }
}

/// Information used to create a [`RasterBuffer`] instance.
#[derive(Builder, Clone, Copy, Debug)]
#[builder(
    build_fn(private, name = "fallible_build", error = "BufferInfoBuilderError"),
    derive(Clone, Copy, Debug),
    pattern = "owned"
)]
#[non_exhaustive]
pub struct BufferInfo {
    /// The rectangle of interest this buffer covers; tiles outside it are
    /// still addressable.
    #[builder(setter(strip_option))]
    pub extent: Rect,

    /// The native format of the stored pixels.
    #[builder(setter(strip_option))]
    pub fmt: PixelFormat,

    /// Offset of the tile grid relative to buffer coordinates, X axis.
    #[builder(default, setter(strip_option))]
    pub shift_x: i32,

    /// Offset of the tile grid relative to buffer coordinates, Y axis.
    #[builder(default, setter(strip_option))]
    pub shift_y: i32,

    /// Vertical tile extent.
    #[builder(default = "128", setter(strip_option))]
    pub tile_height: i32,

    /// Horizontal tile extent.
    #[builder(default = "128", setter(strip_option))]
    pub tile_width: i32,
}

impl BufferInfo {
    /// Specifies a buffer with the default 128x128 tile grid.
    pub const fn new(extent: Rect, fmt: PixelFormat) -> BufferInfoBuilder {
        BufferInfoBuilder {
            extent: Some(extent),
            fmt: Some(fmt),
            shift_x: None,
            shift_y: None,
            tile_height: None,
            tile_width: None,
        }
    }
}

impl BufferInfoBuilder {
    /// Builds a new `BufferInfo`.
    pub fn build(self) -> BufferInfo {
        self.fallible_build()
            .expect("All required fields set at initialization")
    }
}

impl From<BufferInfoBuilder> for BufferInfo {
    fn from(info: BufferInfoBuilder) -> Self {
        info.build()
    }
}

#[derive(Debug)]
struct BufferInfoBuilderError;

impl From<UninitializedFieldError> for BufferInfoBuilderError {
    fn from(_: UninitializedFieldError) -> Self {
        Self
    }
}

/// A tiled, typed image buffer.
///
/// `get` and `set` accept arbitrary rectangles in any supported format and
/// convert through the CPU reference path when the format differs from the
/// native one.
pub struct RasterBuffer {
    id: u64,

    /// Information used to create this object.
    pub info: BufferInfo,

    iter_lock: Arc<Mutex<()>>,
    tiles: Mutex<HashMap<(i32, i32), Tile>>,
}

impl RasterBuffer {
    /// Creates a new buffer with every tile zero-filled on first touch.
    pub fn new(info: impl Into<BufferInfo>) -> Arc<Self> {
        let info = info.into();

        assert!(info.tile_width > 0 && info.tile_height > 0);

        Arc::new(Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            info,
            iter_lock: Arc::new(Mutex::new(())),
            tiles: Mutex::new(HashMap::new()),
        })
    }

    /// Stable identity of this buffer.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The rectangle of interest.
    pub fn extent(&self) -> Rect {
        self.info.extent
    }

    /// The native pixel format.
    pub fn format(&self) -> PixelFormat {
        self.info.fmt
    }

    /// Horizontal tile extent.
    pub fn tile_width(&self) -> i32 {
        self.info.tile_width
    }

    /// Vertical tile extent.
    pub fn tile_height(&self) -> i32 {
        self.info.tile_height
    }

    /// Tile grid offset, X axis.
    pub fn shift_x(&self) -> i32 {
        self.info.shift_x
    }

    /// Tile grid offset, Y axis.
    pub fn shift_y(&self) -> i32 {
        self.info.shift_y
    }

    /// Serialises whole-buffer iteration; held for an iterator's lifetime.
    pub(crate) fn lock_arc(&self) -> BufferGuard {
        self.iter_lock.lock_arc()
    }

    fn tile_size_bytes(&self) -> usize {
        (self.info.tile_width * self.info.tile_height) as usize
            * self.info.fmt.bytes_per_pixel()
    }

    /// The tile at grid position `(col, row)`, created on first touch.
    pub(crate) fn tile(&self, col: i32, row: i32) -> Tile {
        let mut tiles = self.tiles.lock();

        tiles
            .entry((col, row))
            .or_insert_with(|| Tile::new(self.tile_size_bytes()))
            .clone()
    }

    /// Number of tiles created so far.
    pub fn tile_count(&self) -> usize {
        self.tiles.lock().len()
    }

    fn each_intersection(&self, roi: Rect, mut f: impl FnMut(&Tile, Rect, Rect)) {
        let tw = self.info.tile_width;
        let th = self.info.tile_height;
        let col0 = tile_index(roi.x + self.info.shift_x, tw);
        let col1 = tile_index(roi.x + self.info.shift_x + roi.width - 1, tw);
        let row0 = tile_index(roi.y + self.info.shift_y, th);
        let row1 = tile_index(roi.y + self.info.shift_y + roi.height - 1, th);

        for row in row0..=row1 {
            for col in col0..=col1 {
                let tile_rect =
                    Rect::new(col * tw - self.info.shift_x, row * th - self.info.shift_y, tw, th);

                if let Some(isect) = tile_rect.intersect(roi) {
                    let tile = self.tile(col, row);

                    f(&tile, tile_rect, isect);
                }
            }
        }
    }

    /// Reads `roi` in `fmt` into `dst`.
    ///
    /// `rowstride` is the byte distance between destination rows; `None`
    /// means tightly packed.
    #[profiling::function]
    pub fn get(&self, roi: Rect, fmt: PixelFormat, dst: &mut [u8], rowstride: Option<usize>) {
        if roi.is_empty() {
            return;
        }

        let src_fmt = self.info.fmt;
        let src_bpp = src_fmt.bytes_per_pixel();
        let dst_bpp = fmt.bytes_per_pixel();
        let dst_stride = rowstride.unwrap_or(roi.width as usize * dst_bpp);
        let tw = self.info.tile_width as usize;

        self.each_intersection(roi, |tile, tile_rect, isect| {
            let mut state = tile.state().lock();

            state.sync_host();

            for y in isect.y..isect.bottom() {
                let src_at = ((y - tile_rect.y) as usize * tw
                    + (isect.x - tile_rect.x) as usize)
                    * src_bpp;
                let dst_at = (y - roi.y) as usize * dst_stride
                    + (isect.x - roi.x) as usize * dst_bpp;

                color::convert_span(
                    src_fmt,
                    fmt,
                    &state.bytes[src_at..],
                    &mut dst[dst_at..],
                    isect.width as usize,
                );
            }
        });
    }

    /// Writes `roi` from `src` given in `fmt`.
    ///
    /// `rowstride` is the byte distance between source rows; `None` means
    /// tightly packed.
    #[profiling::function]
    pub fn set(&self, roi: Rect, fmt: PixelFormat, src: &[u8], rowstride: Option<usize>) {
        if roi.is_empty() {
            return;
        }

        let dst_fmt = self.info.fmt;
        let dst_bpp = dst_fmt.bytes_per_pixel();
        let src_bpp = fmt.bytes_per_pixel();
        let src_stride = rowstride.unwrap_or(roi.width as usize * src_bpp);
        let tw = self.info.tile_width as usize;

        self.each_intersection(roi, |tile, tile_rect, isect| {
            let mut state = tile.state().lock();

            // partial tile writes still need the stale rows pulled home
            if !isect.contains(tile_rect) {
                state.sync_host();
            }

            for y in isect.y..isect.bottom() {
                let src_at = (y - roi.y) as usize * src_stride
                    + (isect.x - roi.x) as usize * src_bpp;
                let dst_at = ((y - tile_rect.y) as usize * tw
                    + (isect.x - tile_rect.x) as usize)
                    * dst_bpp;

                color::convert_span(
                    fmt,
                    dst_fmt,
                    &src[src_at..],
                    &mut state.bytes[dst_at..],
                    isect.width as usize,
                );
            }

            state.host_written();
        });
    }
}

impl Debug for RasterBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RasterBuffer")
            .field("id", &self.id)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}
