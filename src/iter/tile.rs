//! Single-buffer tile walk.

use {
    crate::{
        buffer::{LockMode, RasterBuffer, Tile, TileGuard},
        math::{tile_index, tile_offset, Rect},
    },
    std::sync::Arc,
};

/// Walks the tile grid under a rectangle in row-major order.
///
/// Each step exposes the intersection of the iteration rectangle with one
/// tile, both tile-local (`subrect`) and in buffer coordinates (`roi2`).
/// When the step covers a full tile width and the lock mode requests read or
/// write access, the tile itself is locked for direct access and its storage
/// handed out; otherwise downstream code goes through a staging buffer and
/// no tile lock is taken. The device iterator walks with an empty lock mode
/// and gates its own full-tile direct access per batch instead.
pub struct TileIterator {
    buffer: Arc<RasterBuffer>,
    col: i32,
    lock_mode: LockMode,
    max_size: usize,
    next_col: i32,
    next_row: i32,
    roi: Rect,
    roi2: Rect,
    row: i32,
    rowstride: usize,
    step: Option<Step>,
    subrect: Rect,
}

struct Step {
    guard: Option<TileGuard>,
    tile: Tile,
}

impl TileIterator {
    /// Begins a walk over `roi`; the first step is taken by [`next`].
    ///
    /// [`next`]: Self::next
    pub fn new(buffer: &Arc<RasterBuffer>, roi: Rect, lock_mode: LockMode) -> Self {
        assert!(!roi.is_empty(), "empty iteration rectangle");

        let max_size = (buffer.tile_width() * buffer.tile_height()) as usize;

        Self {
            buffer: Arc::clone(buffer),
            col: 0,
            lock_mode,
            max_size,
            next_col: 0,
            next_row: 0,
            roi,
            roi2: Rect::ZERO,
            row: 0,
            rowstride: 0,
            step: None,
            subrect: Rect::ZERO,
        }
    }

    fn direct_access(&self, subrect: Rect) -> bool {
        self.lock_mode.intersects(LockMode::READ | LockMode::WRITE)
            && subrect.width == self.buffer.tile_width()
    }

    fn release_step(&mut self) {
        if let Some(step) = self.step.take() {
            if self.lock_mode.contains(LockMode::WRITE) {
                if let Some(mut guard) = step.guard {
                    guard.host_written();
                }
            }
        }
    }

    /// Advances to the next tile; `false` once the walk is complete.
    pub fn next(&mut self) -> bool {
        let tile_width = self.buffer.tile_width();
        let tile_height = self.buffer.tile_height();
        let buffer_x = self.roi.x + self.buffer.shift_x();
        let buffer_y = self.roi.y + self.buffer.shift_y();

        // unlock the previously held tile
        self.release_step();

        loop {
            if self.next_col < self.roi.width {
                // return a tile on this row
                let tiled_x = buffer_x + self.next_col;
                let tiled_y = buffer_y + self.next_row;
                let offset_x = tile_offset(tiled_x, tile_width);
                let offset_y = tile_offset(tiled_y, tile_height);
                let subrect = Rect::new(
                    offset_x,
                    offset_y,
                    (self.roi.width - self.next_col).min(tile_width - offset_x),
                    (self.roi.height - self.next_row).min(tile_height - offset_y),
                );
                let tile = self.buffer.tile(
                    tile_index(tiled_x, tile_width),
                    tile_index(tiled_y, tile_height),
                );
                let guard = if self.direct_access(subrect) {
                    Some(lock_tile(&tile))
                } else {
                    None
                };

                self.col = self.next_col;
                self.row = self.next_row;
                self.next_col += tile_width - offset_x;
                self.subrect = subrect;
                self.rowstride = tile_width as usize * self.buffer.format().bytes_per_pixel();
                self.roi2 = Rect::new(
                    self.roi.x + self.col,
                    self.roi.y + self.row,
                    subrect.width,
                    subrect.height,
                );
                self.step = Some(Step { guard, tile });

                return true;
            }

            // move down to the next row
            let tiled_y = buffer_y + self.next_row;
            let offset_y = tile_offset(tiled_y, tile_height);

            self.next_row += tile_height - offset_y;
            self.next_col = 0;

            if self.next_row >= self.roi.height {
                return false;
            }
        }
    }

    /// The tile-local intersection of the current step.
    pub fn subrect(&self) -> Rect {
        self.subrect
    }

    /// The current step in buffer coordinates.
    pub fn roi2(&self) -> Rect {
        self.roi2
    }

    /// Top-left of the current tile in iteration-local coordinates.
    pub fn col(&self) -> i32 {
        self.col
    }

    /// See [`col`](Self::col).
    pub fn row(&self) -> i32 {
        self.row
    }

    /// Bytes per tile row.
    pub fn rowstride(&self) -> usize {
        self.rowstride
    }

    /// Pixels in a full tile; the staging size scan streams share.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// The tile of the current step.
    pub fn tile(&self) -> Option<&Tile> {
        self.step.as_ref().map(|step| &step.tile)
    }

    /// `true` when the current step holds a direct-access tile lock.
    pub fn locked(&self) -> bool {
        self.step
            .as_ref()
            .map(|step| step.guard.is_some())
            .unwrap_or_default()
    }

    /// Bytes of the current step's sub-rectangle, starting at its first
    /// pixel.
    ///
    /// Only available under a direct-access lock.
    pub fn sub_data(&mut self) -> &mut [u8] {
        let subrect = self.subrect;
        let rowstride = self.rowstride;
        let bpp = self.buffer.format().bytes_per_pixel();
        let guard = self
            .step
            .as_mut()
            .and_then(|step| step.guard.as_mut())
            .expect("tile not locked for direct access");
        let start = subrect.y as usize * rowstride + subrect.x as usize * bpp;
        let end = start
            + (subrect.height as usize - 1) * rowstride
            + subrect.width as usize * bpp;

        &mut guard.bytes[start..end]
    }
}

impl Drop for TileIterator {
    fn drop(&mut self) {
        self.release_step();
    }
}

fn lock_tile(tile: &Tile) -> TileGuard {
    let Some(mut guard) = tile.state().try_lock_arc() else {
        panic!("tile already locked by this iteration; use a single READ | WRITE stream for in-place access");
    };

    guard.sync_host();
    guard
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{buffer::BufferInfo, color::PixelFormat},
    };

    fn buffer(tile: i32) -> Arc<RasterBuffer> {
        RasterBuffer::new(
            BufferInfo::new(Rect::new(0, 0, 512, 512), PixelFormat::RgbaU8)
                .tile_width(tile)
                .tile_height(tile),
        )
    }

    fn collect_steps(buffer: &Arc<RasterBuffer>, roi: Rect) -> Vec<Rect> {
        let mut iter = TileIterator::new(buffer, roi, LockMode::empty());
        let mut steps = Vec::new();

        while iter.next() {
            steps.push(iter.roi2());
        }

        steps
    }

    #[test]
    fn aligned_walk_is_row_major() {
        let buffer = buffer(128);
        let steps = collect_steps(&buffer, Rect::new(0, 0, 256, 256));

        assert_eq!(
            steps,
            vec![
                Rect::new(0, 0, 128, 128),
                Rect::new(128, 0, 128, 128),
                Rect::new(0, 128, 128, 128),
                Rect::new(128, 128, 128, 128),
            ]
        );
    }

    #[test]
    fn coverage_is_disjoint_and_complete() {
        let buffer = buffer(128);

        for roi in [
            Rect::new(0, 0, 512, 512),
            Rect::new(65, 33, 300, 200),
            Rect::new(127, 127, 2, 2),
            Rect::new(0, 0, 1, 512),
        ] {
            let steps = collect_steps(&buffer, roi);
            let bound = ((roi.width + 127) / 128 + 1) as usize
                * (((roi.height + 127) / 128 + 1) as usize);

            assert!(steps.len() <= bound);

            let mut covered = 0;

            for (at, step) in steps.iter().enumerate() {
                assert!(roi.contains(*step));

                covered += step.area();

                for other in &steps[at + 1..] {
                    assert!(step.intersect(*other).is_none());
                }
            }

            assert_eq!(covered, roi.area());
        }
    }

    #[test]
    fn direct_access_requires_full_tile_width() {
        let buffer = buffer(128);

        // full width from an aligned origin
        let mut iter = TileIterator::new(&buffer, Rect::new(0, 0, 128, 64), LockMode::WRITE);

        assert!(iter.next());
        assert!(iter.locked());
        assert_eq!(iter.sub_data().len(), 128 * 64 * 4);

        // an unaligned origin never spans a full tile
        let mut iter = TileIterator::new(&buffer, Rect::new(64, 0, 128, 64), LockMode::WRITE);

        while iter.next() {
            assert!(!iter.locked());
        }

        // no lock requested, no lock taken
        let mut iter = TileIterator::new(&buffer, Rect::new(0, 0, 128, 64), LockMode::empty());

        assert!(iter.next());
        assert!(!iter.locked());
    }

    #[test]
    fn sub_data_addresses_the_intersection() {
        let buffer = buffer(64);
        let mut seed = vec![0u8; 64 * 64 * 4];

        for (at, byte) in seed.iter_mut().enumerate() {
            *byte = (at % 251) as u8;
        }

        buffer.set(Rect::new(0, 0, 64, 64), PixelFormat::RgbaU8, &seed, None);

        // rows 16.. of the first tile
        let mut iter = TileIterator::new(&buffer, Rect::new(0, 16, 64, 48), LockMode::READ);

        assert!(iter.next());
        assert_eq!(iter.subrect(), Rect::new(0, 16, 64, 48));
        assert_eq!(iter.roi2(), Rect::new(0, 16, 64, 48));

        let stride = iter.rowstride();

        assert_eq!(stride, 64 * 4);
        assert_eq!(iter.sub_data()[..stride], seed[16 * stride..17 * stride]);
    }
}
