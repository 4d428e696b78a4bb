use std::sync::Arc;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::common::types::{PageId, PageReadGuard, Rid, INVALID_PAGE_ID};
use crate::storage::buffer::BufferPoolManager;
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::deserialize_node;
use super::base::BTreeIndex;

/// The leaf an iterator currently sits on: pinned, read-latched, and
/// decoded once.
struct LeafCursor<K> {
    page_id: PageId,
    _guard: PageReadGuard,
    node: BTreeNode<K>,
    index: usize,
}

/// Forward iterator over the leaf chain, yielding entries in
/// ascending key order. Holds a pin and a read latch on the current
/// leaf, released when it advances past it or is dropped.
///
/// Not safe under concurrent mutation of the iterated range.
pub struct BTreeIterator<K> {
    buffer_pool: Arc<BufferPoolManager>,
    leaf: Option<LeafCursor<K>>,
}

impl<K> BTreeIterator<K>
where
    K: Clone + Ord + Default + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn new(
        buffer_pool: Arc<BufferPoolManager>,
        leaf: Option<(PageId, PageReadGuard)>,
        index: usize,
    ) -> Result<Self, BTreeError> {
        let leaf = match leaf {
            Some((page_id, guard)) => {
                let node: BTreeNode<K> = deserialize_node(&guard)?;
                Some(LeafCursor {
                    page_id,
                    _guard: guard,
                    node,
                    index,
                })
            }
            None => None,
        };
        Ok(Self { buffer_pool, leaf })
    }

    /// True once the iterator has no further entries: no current
    /// leaf, or past the last slot of the last leaf.
    pub fn is_end(&self) -> bool {
        match &self.leaf {
            None => true,
            Some(cursor) => {
                cursor.index >= cursor.node.size() && cursor.node.next_page_id == INVALID_PAGE_ID
            }
        }
    }

    fn release(&mut self) {
        if let Some(cursor) = self.leaf.take() {
            drop(cursor._guard);
            let _ = self.buffer_pool.unpin_page(cursor.page_id, false);
        }
    }
}

impl<K> Iterator for BTreeIterator<K>
where
    K: Clone + Ord + Default + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Item = (K, Rid);

    fn next(&mut self) -> Option<(K, Rid)> {
        loop {
            let cursor = self.leaf.as_mut()?;

            if cursor.index < cursor.node.size() {
                let item = (
                    cursor.node.keys[cursor.index].clone(),
                    cursor.node.values[cursor.index],
                );
                cursor.index += 1;
                return Some(item);
            }

            let next_id = cursor.node.next_page_id;
            if next_id == INVALID_PAGE_ID {
                self.release();
                return None;
            }

            // Latch the right sibling before letting go of the
            // current leaf, then hop over.
            let next_page = match self.buffer_pool.fetch_page(next_id) {
                Ok(page) => page,
                Err(_) => {
                    self.release();
                    return None;
                }
            };
            let next_guard = next_page.read_arc();
            let node: BTreeNode<K> = match deserialize_node(&next_guard) {
                Ok(node) => node,
                Err(_) => {
                    drop(next_guard);
                    let _ = self.buffer_pool.unpin_page(next_id, false);
                    self.release();
                    return None;
                }
            };

            self.release();
            self.leaf = Some(LeafCursor {
                page_id: next_id,
                _guard: next_guard,
                node,
                index: 0,
            });
        }
    }
}

impl<K> Drop for BTreeIterator<K> {
    fn drop(&mut self) {
        if let Some(cursor) = self.leaf.take() {
            drop(cursor._guard);
            let _ = self.buffer_pool.unpin_page(cursor.page_id, false);
        }
    }
}

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Default + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Iterator positioned at the first key of the tree
    pub fn begin(&self) -> Result<BTreeIterator<K>, BTreeError> {
        let leaf = self.find_leaf_read(None)?;
        BTreeIterator::new(self.buffer_pool.clone(), leaf, 0)
    }

    /// Iterator positioned at `key`, or at the next larger key when
    /// `key` is absent
    pub fn begin_at(&self, key: &K) -> Result<BTreeIterator<K>, BTreeError> {
        let leaf = self.find_leaf_read(Some(key))?;
        match leaf {
            Some((page_id, guard)) => {
                let node: BTreeNode<K> = deserialize_node(&guard)?;
                let index = node.key_index(key);
                BTreeIterator::new(self.buffer_pool.clone(), Some((page_id, guard)), index)
            }
            None => BTreeIterator::new(self.buffer_pool.clone(), None, 0),
        }
    }

    /// The exhausted iterator
    pub fn end(&self) -> BTreeIterator<K> {
        BTreeIterator {
            buffer_pool: self.buffer_pool.clone(),
            leaf: None,
        }
    }
}
