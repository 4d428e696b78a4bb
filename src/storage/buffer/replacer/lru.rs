use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;

use crate::common::types::FrameId;

/// LRU replacement policy over unpinned frames.
///
/// The map is ordered by recency: front = least recently unpinned,
/// back = most recently unpinned. Pinned frames are never tracked
/// here; the buffer pool removes a frame on pin and re-adds it when
/// its pin count drops to zero.
pub struct LRUReplacer {
    capacity: usize,
    frames: Mutex<LinkedHashMap<FrameId, ()>>,
}

impl LRUReplacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            frames: Mutex::new(LinkedHashMap::with_capacity(capacity)),
        }
    }

    /// Evict the least recently unpinned frame, removing it from the
    /// replacer. Returns None if no frame is evictable.
    pub fn victim(&self) -> Option<FrameId> {
        self.frames.lock().pop_front().map(|(frame_id, ())| frame_id)
    }

    /// A frame was pinned: remove it from consideration. Idempotent.
    pub fn pin(&self, frame_id: FrameId) {
        self.frames.lock().remove(&frame_id);
    }

    /// A frame's pin count reached zero: add it as most recently
    /// used. Idempotent; a no-op at capacity.
    pub fn unpin(&self, frame_id: FrameId) {
        let mut frames = self.frames.lock();
        if frames.len() < self.capacity && !frames.contains_key(&frame_id) {
            frames.insert(frame_id, ());
        }
    }

    /// Number of frames currently evictable
    pub fn size(&self) -> usize {
        self.frames.lock().len()
    }
}
