//! Write-back texture cache with write allocation.
//!
//! Recently used rectangles of each buffer stay resident as device images.
//! A `Dirty` entry is the authoritative copy of its rectangle; the buffer's
//! tile store may be stale underneath it until the entry is merged home.
//! Entries sit in two most-recently-used lists at once, one global and one
//! per buffer, and allocation failures evict the global tail until the
//! device yields.

pub(crate) mod transfer;

use {
    crate::{
        buffer::RasterBuffer,
        color::PixelFormat,
        driver::{Device, DeviceImage, DriverError, ImageInfo, MemAccess},
        math::Rect,
    },
    log::{debug, trace, warn},
    std::{
        collections::HashMap,
        sync::{Arc, Weak},
    },
};

/// Relative change in shadowed device memory below which repeated pressure
/// logs are suppressed.
pub const MEM_LOG_EPSILON: f64 = 2.3e-5;

/// Cache entry residency state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheMode {
    /// Exempt from lookup and merge-back; used for scratch textures that
    /// still count against device memory.
    NoCache = 0,

    /// The tile store holds the same bytes.
    Clean = 1,

    /// The device image is the authoritative copy of its rectangle.
    Dirty = 2,
}

pub(crate) type EntryId = usize;

#[derive(Debug)]
pub(crate) struct CacheEntry {
    pub buffer: Weak<RasterBuffer>,
    pub buffer_id: u64,
    pub locked: bool,
    pub mode: CacheMode,
    pub roi: Rect,
    pub tex: Arc<DeviceImage>,
}

/// The entry store. Shared behind the engine's cache mutex.
#[derive(Debug)]
pub(crate) struct TexCache {
    device: Arc<dyn Device>,
    entries: Vec<Option<CacheEntry>>,
    free: Vec<EntryId>,
    /// Most recently used first.
    lru: Vec<EntryId>,
    mem_logged: f64,
    /// Same order as `lru`, restricted to one buffer.
    per_buffer: HashMap<u64, Vec<EntryId>>,
    shadow_mem: usize,
}

fn move_to_front(list: &mut Vec<EntryId>, id: EntryId) {
    if let Some(at) = list.iter().position(|&entry| entry == id) {
        list.remove(at);
        list.insert(0, id);
    }
}

impl TexCache {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            entries: Vec::new(),
            free: Vec::new(),
            lru: Vec::new(),
            mem_logged: 0.0,
            per_buffer: HashMap::new(),
            shadow_mem: 0,
        }
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    fn entry(&self, id: EntryId) -> &CacheEntry {
        self.entries[id].as_ref().expect("live cache entry")
    }

    fn bump(&mut self, id: EntryId) {
        move_to_front(&mut self.lru, id);

        let buffer_id = self.entry(id).buffer_id;

        if let Some(list) = self.per_buffer.get_mut(&buffer_id) {
            move_to_front(list, id);
        }
    }

    fn find_by_tex(&self, tex: &Arc<DeviceImage>) -> Option<EntryId> {
        self.lru
            .iter()
            .copied()
            .find(|&id| Arc::ptr_eq(&self.entry(id).tex, tex))
    }

    /// Exact-rectangle lookup; bumps on a hit. Scratch (`NoCache`) entries
    /// never match.
    pub fn get(&mut self, buffer_id: u64, roi: Rect) -> Option<Arc<DeviceImage>> {
        let list = self.per_buffer.get(&buffer_id)?;
        let id = list.iter().copied().find(|&id| {
            let entry = self.entry(id);

            entry.mode != CacheMode::NoCache && entry.roi == roi
        })?;

        self.bump(id);

        Some(self.entry(id).tex.clone())
    }

    /// Installs an entry at the head of both lists.
    pub fn set(
        &mut self,
        buffer: &Arc<RasterBuffer>,
        tex: Arc<DeviceImage>,
        roi: Rect,
        mode: CacheMode,
    ) {
        debug!("cache set buffer {} {} mode {:?}", buffer.id(), roi, mode);

        self.shadow_mem += tex.info.size_bytes();

        let entry = CacheEntry {
            buffer: Arc::downgrade(buffer),
            buffer_id: buffer.id(),
            locked: false,
            mode,
            roi,
            tex,
        };
        let id = if let Some(id) = self.free.pop() {
            self.entries[id] = Some(entry);
            id
        } else {
            self.entries.push(Some(entry));
            self.entries.len() - 1
        };

        self.lru.insert(0, id);
        self.per_buffer
            .entry(buffer.id())
            .or_default()
            .insert(0, id);
    }

    /// Allocates a device image for `roi` and installs it, evicting the
    /// least recently used entries while the device refuses.
    pub fn request(
        &mut self,
        buffer: &Arc<RasterBuffer>,
        access: MemAccess,
        fmt: PixelFormat,
        roi: Rect,
        mode: CacheMode,
    ) -> Result<Arc<DeviceImage>, DriverError> {
        let info = ImageInfo::new_2d(fmt, roi.width, roi.height)
            .access(access)
            .build();
        let tex = Arc::new(self.create_evicting(info)?);

        self.set(buffer, Arc::clone(&tex), roi, mode);

        Ok(tex)
    }

    /// Creates an image, evicting cache entries under memory pressure.
    pub fn create_evicting(&mut self, info: ImageInfo) -> Result<DeviceImage, DriverError> {
        loop {
            match DeviceImage::create(&self.device, info) {
                Ok(image) => return Ok(image),
                Err(DriverError::OutOfMemory) if !self.lru.is_empty() => {
                    self.evict_tail();
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Merges and disposes the least recently used entry. Returns `false`
    /// when the cache is empty.
    pub fn evict_tail(&mut self) -> bool {
        let Some(&id) = self.lru.last() else {
            return false;
        };

        self.log_pressure();

        let tex = self.entry(id).tex.clone();

        self.merge(id);
        let _ = self.device.finish();
        self.dispose(&tex);

        true
    }

    fn log_pressure(&mut self) {
        let used = self.shadow_mem as f64;

        if self.mem_logged == 0.0 || (used - self.mem_logged).abs() / used.max(1.0) > MEM_LOG_EPSILON
        {
            debug!(
                "memory pressure: {} bytes shadowed in {} entries",
                self.shadow_mem,
                self.lru.len()
            );

            self.mem_logged = used;
        }
    }

    /// Writes a `Dirty` entry back to its buffer's tile store.
    ///
    /// The entry is locked for the duration and `Clean` afterwards; `Clean`
    /// and `NoCache` entries are left alone.
    #[profiling::function]
    pub(crate) fn merge(&mut self, id: EntryId) -> bool {
        let (buffer, tex, roi) = {
            let Some(entry) = self.entries[id].as_mut() else {
                return false;
            };

            if entry.mode != CacheMode::Dirty {
                return true;
            }

            let Some(buffer) = entry.buffer.upgrade() else {
                warn!("merge: buffer {} already dropped", entry.buffer_id);

                entry.mode = CacheMode::Clean;

                return false;
            };

            entry.locked = true;

            (buffer, entry.tex.clone(), entry.roi)
        };

        debug!("merge texture buffer {} {}", buffer.id(), roi);

        let fmt = buffer.format();
        let res = tex
            .device()
            .map_image(&tex, (roi.width, roi.height), &mut |data, pitch| {
                // tile-ize
                buffer.set(roi, fmt, data, Some(pitch));
            });

        let Some(entry) = self.entries[id].as_mut() else {
            return false;
        };

        entry.locked = false;

        match res {
            Ok(()) => {
                entry.mode = CacheMode::Clean;

                true
            }
            Err(err) => {
                warn!("merge failed: {err}");

                false
            }
        }
    }

    fn unlink(&mut self, id: EntryId) {
        if let Some(entry) = self.entries[id].take() {
            self.shadow_mem = self
                .shadow_mem
                .saturating_sub(entry.tex.info.size_bytes());

            if let Some(at) = self.lru.iter().position(|&other| other == id) {
                self.lru.remove(at);
            }

            if let Some(list) = self.per_buffer.get_mut(&entry.buffer_id) {
                if let Some(at) = list.iter().position(|&other| other == id) {
                    list.remove(at);
                }
            }

            self.free.push(id);
        }
    }

    /// Merges a `Dirty` entry, destroys the image and removes the entry from
    /// both lists. Fails on locked entries and on textures the cache does
    /// not know.
    pub fn dispose(&mut self, tex: &Arc<DeviceImage>) -> bool {
        let Some(id) = self.find_by_tex(tex) else {
            warn!("tried to dispose a texture not present in the cache");

            return false;
        };

        trace!("dispose entry {}", id);

        if self.entry(id).locked {
            warn!("trying to release a locked texture");

            return false;
        }

        let merged = self.merge(id);

        if !merged {
            warn!("releasing an unmerged texture");
        }

        self.unlink(id);

        merged
    }

    /// Merges every entry of `buffer_id` intersecting `roi`, oldest first,
    /// and drains the queue once if anything was touched.
    pub fn invalidate(&mut self, buffer_id: u64, roi: Rect) {
        let snapshot: Vec<EntryId> = match self.per_buffer.get(&buffer_id) {
            Some(list) if !list.is_empty() => list.iter().rev().copied().collect(),
            _ => return,
        };

        debug!("invalidate buffer {} {}", buffer_id, roi);

        let mut found = false;

        for id in snapshot {
            if self.entries[id].is_none() {
                continue;
            }

            if self.entry(id).roi.intersect(roi).is_some() {
                self.merge(id);

                found = true;
            }
        }

        if found {
            let _ = self.device.finish();
        }
    }

    /// Disposes entries contained by `roi` and merge-disposes entries merely
    /// intersecting it, repeating until a full pass changes nothing. Locked
    /// entries are skipped.
    pub fn clear(&mut self, buffer_id: u64, roi: Rect) {
        debug!("clear buffer {} {}", buffer_id, roi);

        loop {
            let mut changed = false;
            let snapshot: Vec<EntryId> = self
                .per_buffer
                .get(&buffer_id)
                .map(|list| list.iter().rev().copied().collect())
                .unwrap_or_default();

            for id in snapshot {
                if self.entries[id].is_none() {
                    continue;
                }

                let (locked, entry_roi, tex) = {
                    let entry = self.entry(id);

                    (entry.locked, entry.roi, entry.tex.clone())
                };

                if locked {
                    continue;
                }

                if roi.contains(entry_roi) {
                    self.dispose(&tex);

                    changed = true;
                } else if entry_roi.intersect(roi).is_some() {
                    self.merge(id);
                    let _ = self.device.finish();
                    self.dispose(&tex);

                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }
    }

    /// Disposes every entry of a buffer, ignoring containment.
    pub fn remove_buffer(&mut self, buffer_id: u64) {
        debug!("remove buffer {}", buffer_id);

        loop {
            // oldest first; the list head is re-read after every dispose
            let Some(&id) = self
                .per_buffer
                .get(&buffer_id)
                .and_then(|list| list.last())
            else {
                break;
            };

            let tex = self.entry(id).tex.clone();

            // locks are scoped to merge, which runs under the same borrow,
            // so dispose always unlinks here and the list strictly shrinks
            self.dispose(&tex);
        }

        self.per_buffer.remove(&buffer_id);
    }

    /// Disposes every entry of every buffer.
    pub fn teardown(&mut self) {
        let buffers: Vec<u64> = self.per_buffer.keys().copied().collect();

        for buffer_id in buffers {
            self.remove_buffer(buffer_id);
        }
    }

    /// Newest `Dirty` entry of `buffer_id` whose rectangle contains `roi`.
    pub(crate) fn find_dirty_containing(
        &self,
        buffer_id: u64,
        roi: Rect,
    ) -> Option<(Arc<DeviceImage>, Rect)> {
        let list = self.per_buffer.get(&buffer_id)?;

        list.iter().copied().find_map(|id| {
            let entry = self.entry(id);

            (entry.mode == CacheMode::Dirty && entry.roi.contains(roi))
                .then(|| (entry.tex.clone(), entry.roi))
        })
    }

    pub(crate) fn bump_tex(&mut self, tex: &Arc<DeviceImage>) {
        if let Some(id) = self.find_by_tex(tex) {
            self.bump(id);
        }
    }

    /// Changes the mode of the entry owning `tex`.
    pub(crate) fn promote(&mut self, tex: &Arc<DeviceImage>, mode: CacheMode) -> bool {
        if let Some(id) = self.find_by_tex(tex) {
            if let Some(entry) = self.entries[id].as_mut() {
                entry.mode = mode;

                return true;
            }
        }

        false
    }

    #[cfg(test)]
    pub(crate) fn lock_for_test(&mut self, tex: &Arc<DeviceImage>, locked: bool) {
        let id = self.find_by_tex(tex).expect("entry");

        self.entries[id].as_mut().expect("entry").locked = locked;
    }

    #[cfg(test)]
    pub(crate) fn modes_for(&self, buffer_id: u64) -> Vec<(Rect, CacheMode)> {
        self.per_buffer
            .get(&buffer_id)
            .map(|list| {
                list.iter()
                    .map(|&id| {
                        let entry = self.entry(id);

                        (entry.roi, entry.mode)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lru.len()
    }

    /// Asserts the dual-list bookkeeping: every entry sits in exactly one
    /// position of each list and the per-buffer order matches the global
    /// order.
    #[cfg(test)]
    pub(crate) fn validate(&self) {
        use std::collections::HashSet;

        let global: Vec<EntryId> = self.lru.clone();
        let unique: HashSet<EntryId> = global.iter().copied().collect();

        assert_eq!(global.len(), unique.len());

        let mut from_buffers = 0;

        for (buffer_id, list) in &self.per_buffer {
            from_buffers += list.len();

            let order: Vec<EntryId> = global
                .iter()
                .copied()
                .filter(|id| self.entry(*id).buffer_id == *buffer_id)
                .collect();

            assert_eq!(&order, list);
        }

        assert_eq!(from_buffers, global.len());
    }
}
