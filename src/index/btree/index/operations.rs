use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::common::types::{PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::{deserialize_node, serialize_node};
use super::base::{BTreeIndex, LatchPath, TreeOperation};

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Default + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Insert a key/value pair. Returns false (tree unchanged) if the
    /// key already exists.
    pub fn insert(&self, key: K, value: Rid) -> Result<bool, BTreeError> {
        loop {
            {
                let mut root = self.root_page_id.lock();
                if *root == INVALID_PAGE_ID {
                    self.start_new_tree(&mut root, key, value)?;
                    return Ok(true);
                }
            }

            let mut path = self.find_leaf_write(&key, TreeOperation::Insert)?;
            if path.is_empty() {
                // A concurrent remove emptied the tree; start over
                continue;
            }

            let leaf_slot = path.len() - 1;
            let mut leaf: BTreeNode<K> = deserialize_node(&path[leaf_slot].1)?;

            if !leaf.leaf_insert(key, value) {
                self.release_path(path, false)?;
                return Ok(false);
            }

            serialize_node(&leaf, &mut path[leaf_slot].1)?;
            self.propagate_splits(&mut path)?;

            self.release_path(path, true)?;
            return Ok(true);
        }
    }

    /// Build a single-leaf tree holding the first entry. Called with
    /// the root mutex held.
    fn start_new_tree(&self, root: &mut PageId, key: K, value: Rid) -> Result<(), BTreeError> {
        let (page, page_id) = self.buffer_pool.new_page()?;

        let mut leaf = BTreeNode::new_leaf(page_id, INVALID_PAGE_ID, self.leaf_max_size);
        leaf.leaf_insert(key, value);
        {
            let mut guard = page.write();
            serialize_node(&leaf, &mut guard)?;
        }
        self.buffer_pool.unpin_page(page_id, true)?;

        *root = page_id;
        self.update_root_record(page_id)
    }

    /// Split overflowing nodes from the tail of the latch path upward:
    /// move the upper half of each into a fresh right sibling and
    /// register the separator in the parent. Each finished level is
    /// released before its parent splits, so child adoptions never run
    /// into a latch this descent still holds.
    fn propagate_splits(&self, path: &mut LatchPath) -> Result<(), BTreeError> {
        loop {
            let slot = path.len() - 1;
            let mut node: BTreeNode<K> = deserialize_node(&path[slot].1)?;
            if node.size() < node.max_size {
                return Ok(());
            }

            let (right_page, right_id) = self.buffer_pool.new_page()?;
            let mut right_guard = right_page.write_arc();
            let mut right = if node.is_leaf() {
                BTreeNode::new_leaf(right_id, node.parent_page_id, self.leaf_max_size)
            } else {
                BTreeNode::new_internal(right_id, node.parent_page_id, self.internal_max_size)
            };

            let separator = if node.is_leaf() {
                node.leaf_move_half_to(&mut right)
            } else {
                let separator = node.internal_move_half_to(&mut right);
                // Everything below this level has been released, so
                // the moved subtrees are free to re-parent
                self.adopt_children(&right.children, right_id)?;
                separator
            };

            if node.is_root() {
                // The root itself overflowed: raise a new root over
                // the split pair and re-point the persisted root
                let mut root = self.root_page_id.lock();

                let (root_page, new_root_id) = self.buffer_pool.new_page()?;
                let mut new_root =
                    BTreeNode::new_internal(new_root_id, INVALID_PAGE_ID, self.internal_max_size);
                new_root.populate_new_root(node.page_id, separator, right_id);
                {
                    let mut guard = root_page.write();
                    serialize_node(&new_root, &mut guard)?;
                }
                self.buffer_pool.unpin_page(new_root_id, true)?;

                node.parent_page_id = new_root_id;
                right.parent_page_id = new_root_id;
                serialize_node(&node, &mut path[slot].1)?;
                serialize_node(&right, &mut right_guard)?;
                drop(right_guard);
                self.buffer_pool.unpin_page(right_id, true)?;

                *root = new_root_id;
                return self.update_root_record(new_root_id);
            }

            serialize_node(&node, &mut path[slot].1)?;
            serialize_node(&right, &mut right_guard)?;
            drop(right_guard);
            self.buffer_pool.unpin_page(right_id, true)?;

            // Register the new sibling in the parent, which crabbing
            // kept latched because this node was not insert-safe
            let parent_slot = slot - 1;
            let mut parent: BTreeNode<K> = deserialize_node(&path[parent_slot].1)?;
            parent
                .internal_insert_after(node.page_id, separator, right_id)
                .ok_or(BTreeError::InvalidPageFormat)?;
            serialize_node(&parent, &mut path[parent_slot].1)?;

            // This level is finished; let go of it before the parent
            // splits in turn
            let (node_id, node_guard) = path.pop().ok_or(BTreeError::InvalidPageFormat)?;
            drop(node_guard);
            self.buffer_pool.unpin_page(node_id, true)?;
        }
    }
}
