use std::marker::PhantomData;
use std::sync::Arc;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::common::types::{PageId, PageReadGuard, PageWriteGuard, Rid, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::HeaderPage;
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::{deserialize_node, serialize_node};

/// Which structural change a write descent must guard against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TreeOperation {
    Insert,
    Remove,
}

/// Write latches held along a root-to-leaf descent, root end first
pub(crate) type LatchPath = Vec<(PageId, PageWriteGuard)>;

/// Concurrent B+Tree index over buffer pool pages. Unique keys map to
/// record ids; descents use latch crabbing, so readers and writers
/// only collide on the subtrees a structural change can actually
/// touch. The root page id is persisted in the header page under the
/// index name.
pub struct BTreeIndex<K> {
    pub(crate) name: String,
    pub(crate) buffer_pool: Arc<BufferPoolManager>,
    pub(crate) root_page_id: Mutex<PageId>,
    pub(crate) leaf_max_size: usize,
    pub(crate) internal_max_size: usize,
    pub(crate) _phantom: PhantomData<K>,
}

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Default + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Open the named index, re-attaching to a root persisted in the
    /// header page or registering the name with no root yet. Both
    /// max sizes must be at least 3.
    pub fn open(
        name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        assert!(leaf_max_size >= 3, "leaf max_size must be >= 3");
        assert!(internal_max_size >= 3, "internal max_size must be >= 3");

        let name = name.into();
        let header = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        let root_page_id;
        let mut dirtied = false;
        {
            let mut page = header.write();
            match HeaderPage::get_record_value(&page, &name) {
                Some(root) => root_page_id = root,
                None => {
                    HeaderPage::insert_record(&mut page, &name, INVALID_PAGE_ID);
                    root_page_id = INVALID_PAGE_ID;
                    dirtied = true;
                }
            }
        }
        buffer_pool.unpin_page(HEADER_PAGE_ID, dirtied)?;

        Ok(Self {
            name,
            buffer_pool,
            root_page_id: Mutex::new(root_page_id),
            leaf_max_size,
            internal_max_size,
            _phantom: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.lock()
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id() == INVALID_PAGE_ID
    }

    /// Point lookup
    pub fn get_value(&self, key: &K) -> Result<Option<Rid>, BTreeError> {
        let (page_id, guard) = match self.find_leaf_read(Some(key))? {
            Some(leaf) => leaf,
            None => return Ok(None),
        };
        let node: BTreeNode<K> = deserialize_node(&guard)?;
        let result = node.leaf_lookup(key);
        drop(guard);
        self.buffer_pool.unpin_page(page_id, false)?;
        Ok(result)
    }

    /// Read-latch crab from the root to the leaf for `key` (or the
    /// leftmost leaf when `key` is None). The parent's latch is
    /// dropped as soon as the child's is held. Returns the leaf still
    /// pinned and read-latched, or None for an empty tree.
    pub(crate) fn find_leaf_read(
        &self,
        key: Option<&K>,
    ) -> Result<Option<(PageId, PageReadGuard)>, BTreeError> {
        loop {
            let root_id = *self.root_page_id.lock();
            if root_id == INVALID_PAGE_ID {
                return Ok(None);
            }
            let root_page = self.buffer_pool.fetch_page(root_id)?;
            let root_guard = root_page.read_arc();
            // The root may have moved between reading the id and
            // latching the page; restart from the new root if so.
            if *self.root_page_id.lock() != root_id {
                drop(root_guard);
                self.buffer_pool.unpin_page(root_id, false)?;
                continue;
            }

            let mut current = (root_id, root_guard);
            loop {
                let node: BTreeNode<K> = deserialize_node(&current.1)?;
                if node.is_leaf() {
                    return Ok(Some(current));
                }
                let child_id = match key {
                    Some(key) => node.internal_lookup(key),
                    None => node.children[0],
                };
                let child_page = self.buffer_pool.fetch_page(child_id)?;
                let child_guard = child_page.read_arc();
                let (parent_id, parent_guard) = current;
                drop(parent_guard);
                self.buffer_pool.unpin_page(parent_id, false)?;
                current = (child_id, child_guard);
            }
        }
    }

    /// Write-latch crab from the root to the leaf for `key`. Every
    /// node on the way down is write-latched and kept; when a node is
    /// safe for the operation (cannot propagate a split or merge
    /// upward), all latches above it are released. Returns the kept
    /// path, or an empty one if the tree emptied out underneath us.
    pub(crate) fn find_leaf_write(
        &self,
        key: &K,
        operation: TreeOperation,
    ) -> Result<LatchPath, BTreeError> {
        loop {
            let root_id = *self.root_page_id.lock();
            if root_id == INVALID_PAGE_ID {
                return Ok(Vec::new());
            }
            let root_page = self.buffer_pool.fetch_page(root_id)?;
            let root_guard = root_page.write_arc();
            if *self.root_page_id.lock() != root_id {
                drop(root_guard);
                self.buffer_pool.unpin_page(root_id, false)?;
                continue;
            }

            let mut path: LatchPath = vec![(root_id, root_guard)];
            loop {
                let node: BTreeNode<K> = deserialize_node(&path[path.len() - 1].1)?;
                if Self::is_safe(&node, operation) {
                    let keep_from = path.len() - 1;
                    for (page_id, guard) in path.drain(..keep_from) {
                        drop(guard);
                        self.buffer_pool.unpin_page(page_id, false)?;
                    }
                }
                if node.is_leaf() {
                    return Ok(path);
                }
                let child_id = node.internal_lookup(key);
                let child_page = self.buffer_pool.fetch_page(child_id)?;
                let child_guard = child_page.write_arc();
                path.push((child_id, child_guard));
            }
        }
    }

    /// A node is safe when the operation below it cannot change its
    /// slot count past a structural bound.
    fn is_safe(node: &BTreeNode<K>, operation: TreeOperation) -> bool {
        match operation {
            TreeOperation::Insert => node.size() < node.max_size - 1,
            TreeOperation::Remove => node.size() > node.min_size(),
        }
    }

    /// Release every latch in the path and unpin the pages
    pub(crate) fn release_path(&self, path: LatchPath, is_dirty: bool) -> Result<(), BTreeError> {
        for (page_id, guard) in path {
            drop(guard);
            self.buffer_pool.unpin_page(page_id, is_dirty)?;
        }
        Ok(())
    }

    /// Persist the current root page id into the header page. Called
    /// with the root mutex held, on every root change.
    pub(crate) fn update_root_record(&self, root_page_id: PageId) -> Result<(), BTreeError> {
        let header = self.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut page = header.write();
            if !HeaderPage::update_record(&mut page, &self.name, root_page_id) {
                HeaderPage::insert_record(&mut page, &self.name, root_page_id);
            }
        }
        self.buffer_pool.unpin_page(HEADER_PAGE_ID, true)?;
        Ok(())
    }

    /// Rewrite the parent pointer of each child page to `parent_id`.
    /// Used after moves between internal nodes; the children are
    /// reachable only through nodes this descent has latched.
    pub(crate) fn adopt_children(
        &self,
        children: &[PageId],
        parent_id: PageId,
    ) -> Result<(), BTreeError> {
        for &child_id in children {
            let child_page = self.buffer_pool.fetch_page(child_id)?;
            {
                let mut guard = child_page.write();
                let mut child: BTreeNode<K> = deserialize_node(&guard)?;
                child.parent_page_id = parent_id;
                serialize_node(&child, &mut guard)?;
            }
            self.buffer_pool.unpin_page(child_id, true)?;
        }
        Ok(())
    }
}
