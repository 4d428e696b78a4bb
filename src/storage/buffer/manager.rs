use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use parking_lot::{Mutex, RwLock};
use log::debug;

use crate::common::types::{Page, PageId, PagePtr, FrameId, INVALID_PAGE_ID};
use crate::storage::disk::DiskManager;
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::replacer::LRUReplacer;

/// Bookkeeping for one frame. The page contents themselves live
/// behind the frame's page latch; this metadata is guarded by the
/// pool latch.
#[derive(Debug, Clone, Copy)]
struct FrameMeta {
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
}

impl FrameMeta {
    fn empty() -> Self {
        Self {
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
        }
    }
}

/// State guarded by the pool latch: the page table, the free list and
/// the per-frame metadata.
struct PoolState {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    metas: Vec<FrameMeta>,
}

/// Buffer pool manager: mediates all page access. Every resident page
/// occupies exactly one frame; a frame with a non-zero pin count is
/// never evicted. The free list, the replacer and the pinned frames
/// partition the frame array.
pub struct BufferPoolManager {
    pool_size: usize,
    frames: Vec<PagePtr>,
    latch: Mutex<PoolState>,
    replacer: LRUReplacer,
    disk_manager: Arc<DiskManager>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, db_path: impl AsRef<Path>) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        Ok(Self::with_disk_manager(pool_size, disk_manager))
    }

    pub fn with_disk_manager(pool_size: usize, disk_manager: Arc<DiskManager>) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        for frame_id in 0..pool_size {
            frames.push(Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))));
            free_list.push_back(frame_id);
        }

        Self {
            pool_size,
            frames,
            latch: Mutex::new(PoolState {
                page_table: HashMap::new(),
                free_list,
                metas: vec![FrameMeta::empty(); pool_size],
            }),
            replacer: LRUReplacer::new(pool_size),
            disk_manager,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Fetch a page, pinning its frame. If the page is not resident a
    /// frame is taken from the free list or the replacer, writing the
    /// victim back first when dirty.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidOperation(
                "cannot fetch the invalid page id".to_string(),
            ));
        }

        let mut state = self.latch.lock();

        if let Some(&frame_id) = state.page_table.get(&page_id) {
            if state.metas[frame_id].pin_count == 0 {
                self.replacer.pin(frame_id);
            }
            state.metas[frame_id].pin_count += 1;
            return Ok(self.frames[frame_id].clone());
        }

        let frame_id = self.allocate_frame(&mut state)?;

        // Read the requested page into the frame. The frame is free or
        // was an unpinned victim, so its latch is uncontended.
        {
            let mut page = self.frames[frame_id].write();
            if let Err(e) = self.disk_manager.read_page(page_id, &mut page) {
                state.free_list.push_back(frame_id);
                return Err(e.into());
            }
        }

        state.metas[frame_id] = FrameMeta {
            page_id,
            pin_count: 1,
            is_dirty: false,
        };
        state.page_table.insert(page_id, frame_id);

        Ok(self.frames[frame_id].clone())
    }

    /// Allocate a fresh page on disk and pin it in a frame, zeroed.
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let mut state = self.latch.lock();

        let frame_id = self.allocate_frame(&mut state)?;

        let page_id = match self.disk_manager.allocate_page() {
            Ok(page_id) => page_id,
            Err(e) => {
                state.free_list.push_back(frame_id);
                return Err(e.into());
            }
        };

        {
            let mut page = self.frames[frame_id].write();
            page.reset();
            page.page_id = page_id;
        }

        state.metas[frame_id] = FrameMeta {
            page_id,
            pin_count: 1,
            is_dirty: true,
        };
        state.page_table.insert(page_id, frame_id);

        Ok((self.frames[frame_id].clone(), page_id))
    }

    /// Drop one pin on a page, or-folding the caller's dirty flag into
    /// the frame. The frame becomes evictable when the count hits zero.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let mut state = self.latch.lock();

        let frame_id = *state
            .page_table
            .get(&page_id)
            .ok_or(BufferPoolError::PageNotFound(page_id))?;

        let meta = &mut state.metas[frame_id];
        if meta.pin_count == 0 {
            return Err(BufferPoolError::PageNotPinned(page_id));
        }
        meta.pin_count -= 1;
        meta.is_dirty |= is_dirty;

        if meta.pin_count == 0 {
            self.replacer.unpin(frame_id);
        }

        Ok(())
    }

    /// Write a page through to disk regardless of its dirty bit
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let mut state = self.latch.lock();

        let frame_id = *state
            .page_table
            .get(&page_id)
            .ok_or(BufferPoolError::PageNotFound(page_id))?;

        {
            let page = self.frames[frame_id].read();
            self.disk_manager.write_page(&page)?;
        }
        state.metas[frame_id].is_dirty = false;

        Ok(())
    }

    /// Write every mapped page to disk
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let mut state = self.latch.lock();

        let mapped: Vec<FrameId> = state.page_table.values().copied().collect();
        for frame_id in mapped {
            {
                let page = self.frames[frame_id].read();
                self.disk_manager.write_page(&page)?;
            }
            state.metas[frame_id].is_dirty = false;
        }

        Ok(())
    }

    /// Delete a page. Returns Ok(true) if the page is gone (or was
    /// never resident), Ok(false) if it is pinned and cannot be freed.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool, BufferPoolError> {
        let mut state = self.latch.lock();

        let frame_id = match state.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Ok(true),
        };

        if state.metas[frame_id].pin_count > 0 {
            return Ok(false);
        }

        state.metas[frame_id] = FrameMeta::empty();
        state.page_table.remove(&page_id);
        // The frame was unpinned, so it sits in the replacer; pull it
        // out before handing it to the free list.
        self.replacer.pin(frame_id);
        state.free_list.push_back(frame_id);

        self.disk_manager.deallocate_page(page_id);

        Ok(true)
    }

    /// Take a frame from the free list, or evict a victim from the
    /// replacer (writing it back first when dirty).
    fn allocate_frame(&self, state: &mut PoolState) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = self.replacer.victim().ok_or(BufferPoolError::BufferPoolFull)?;
        let meta = state.metas[frame_id];

        if meta.is_dirty {
            debug!("writing back dirty victim page {} from frame {}", meta.page_id, frame_id);
            let page = self.frames[frame_id].read();
            if let Err(e) = self.disk_manager.write_page(&page) {
                drop(page);
                self.replacer.unpin(frame_id);
                return Err(e.into());
            }
        }

        state.page_table.remove(&meta.page_id);
        state.metas[frame_id] = FrameMeta::empty();

        Ok(frame_id)
    }
}
