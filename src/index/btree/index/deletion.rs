use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::common::types::INVALID_PAGE_ID;
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::{deserialize_node, serialize_node};
use super::base::{BTreeIndex, LatchPath, TreeOperation};

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Default + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Remove a key. A missing key is a no-op.
    pub fn remove(&self, key: &K) -> Result<(), BTreeError> {
        if *self.root_page_id.lock() == INVALID_PAGE_ID {
            return Ok(());
        }

        let mut path = self.find_leaf_write(key, TreeOperation::Remove)?;
        if path.is_empty() {
            return Ok(());
        }

        self.delete_entry(&mut path, key.clone())?;
        self.release_path(path, true)
    }

    /// Remove `key` from the node at the tail of the latch path and
    /// restore the occupancy invariant: adjust the root, or coalesce
    /// with / borrow from a sibling and recurse into the parent.
    fn delete_entry(&self, path: &mut LatchPath, key: K) -> Result<(), BTreeError> {
        let slot = path.len() - 1;
        let mut node: BTreeNode<K> = deserialize_node(&path[slot].1)?;

        if node.is_leaf() {
            if !node.leaf_remove(&key) {
                return Ok(());
            }
        } else {
            // Drop the slot whose subtree was merged away
            let child = node.internal_lookup(&key);
            let child_slot = node
                .child_index_of(child)
                .ok_or(BTreeError::InvalidPageFormat)?;
            node.internal_remove(child_slot);
        }

        if node.is_root() {
            return self.adjust_root(path, node);
        }

        if node.size() >= node.min_size() {
            serialize_node(&node, &mut path[slot].1)?;
            return Ok(());
        }

        // Underflow. The parent is still latched above us: this node
        // was not remove-safe on the way down.
        let parent_slot = slot - 1;
        let mut parent: BTreeNode<K> = deserialize_node(&path[parent_slot].1)?;
        let node_slot = parent
            .child_index_of(node.page_id)
            .ok_or(BTreeError::InvalidPageFormat)?;

        // Prefer the previous sibling; only the leftmost child pairs
        // with its next. The separator between the pair sits over the
        // right-hand member.
        let (sibling_slot, middle_slot) = if node_slot == 0 {
            (1, 1)
        } else {
            (node_slot - 1, node_slot)
        };
        let middle_key = parent.key_at(middle_slot).clone();
        let sibling_id = parent.children[sibling_slot];

        let sibling_page = self.buffer_pool.fetch_page(sibling_id)?;
        let mut sibling_guard = sibling_page.write_arc();
        let mut sibling: BTreeNode<K> = deserialize_node(&sibling_guard)?;

        if node.size() + sibling.size() < node.max_size {
            // Coalesce, always folding the right node of the pair
            // into the left one.
            if sibling_slot < node_slot {
                // sibling | node
                if node.is_leaf() {
                    node.leaf_move_all_to(&mut sibling);
                } else {
                    let adopt_from = sibling.size();
                    node.internal_move_all_to(&mut sibling, middle_key.clone());
                    self.adopt_children(&sibling.children[adopt_from..], sibling_id)?;
                }
                serialize_node(&sibling, &mut sibling_guard)?;
                drop(sibling_guard);
                self.buffer_pool.unpin_page(sibling_id, true)?;

                let (node_id, node_guard) = path.pop().ok_or(BTreeError::InvalidPageFormat)?;
                drop(node_guard);
                self.buffer_pool.unpin_page(node_id, true)?;
                self.buffer_pool.delete_page(node_id)?;
            } else {
                // node | sibling
                if node.is_leaf() {
                    sibling.leaf_move_all_to(&mut node);
                } else {
                    let adopt_from = node.size();
                    sibling.internal_move_all_to(&mut node, middle_key.clone());
                    self.adopt_children(&node.children[adopt_from..], node.page_id)?;
                }
                serialize_node(&node, &mut path[slot].1)?;
                drop(sibling_guard);
                self.buffer_pool.unpin_page(sibling_id, true)?;
                self.buffer_pool.delete_page(sibling_id)?;

                let (node_id, node_guard) = path.pop().ok_or(BTreeError::InvalidPageFormat)?;
                drop(node_guard);
                self.buffer_pool.unpin_page(node_id, true)?;
            }

            // The separator between the merged pair comes out of the
            // parent.
            return self.delete_entry(path, middle_key);
        }

        // Redistribute a single entry from the sibling and refresh
        // the separator in the parent.
        let new_separator = if sibling_slot < node_slot {
            if node.is_leaf() {
                sibling.leaf_move_last_to_front_of(&mut node)
            } else {
                let separator = sibling.internal_move_last_to_front_of(&mut node, middle_key);
                self.adopt_children(&node.children[..1], node.page_id)?;
                separator
            }
        } else if node.is_leaf() {
            sibling.leaf_move_first_to_end_of(&mut node)
        } else {
            let separator = sibling.internal_move_first_to_end_of(&mut node, middle_key);
            let moved = node.children.len() - 1;
            self.adopt_children(&node.children[moved..], node.page_id)?;
            separator
        };
        parent.set_key_at(middle_slot, new_separator);

        serialize_node(&node, &mut path[slot].1)?;
        serialize_node(&sibling, &mut sibling_guard)?;
        serialize_node(&parent, &mut path[parent_slot].1)?;
        drop(sibling_guard);
        self.buffer_pool.unpin_page(sibling_id, true)?;

        Ok(())
    }

    /// The root shrank: collapse it if possible. An internal root
    /// down to one child hands the tree to that child; an empty leaf
    /// root empties the tree.
    fn adjust_root(&self, path: &mut LatchPath, node: BTreeNode<K>) -> Result<(), BTreeError> {
        if !node.is_leaf() && node.size() == 1 {
            let child_id = node.children[0];
            let mut root = self.root_page_id.lock();

            let child_page = self.buffer_pool.fetch_page(child_id)?;
            {
                let mut guard = child_page.write();
                let mut child: BTreeNode<K> = deserialize_node(&guard)?;
                child.parent_page_id = INVALID_PAGE_ID;
                serialize_node(&child, &mut guard)?;
            }
            self.buffer_pool.unpin_page(child_id, true)?;

            *root = child_id;
            self.update_root_record(child_id)?;
            drop(root);

            let (old_root_id, guard) = path.pop().ok_or(BTreeError::InvalidPageFormat)?;
            drop(guard);
            self.buffer_pool.unpin_page(old_root_id, true)?;
            self.buffer_pool.delete_page(old_root_id)?;
        } else if node.is_leaf() && node.size() == 0 {
            let mut root = self.root_page_id.lock();
            *root = INVALID_PAGE_ID;
            self.update_root_record(INVALID_PAGE_ID)?;
            drop(root);

            let (old_root_id, guard) = path.pop().ok_or(BTreeError::InvalidPageFormat)?;
            drop(guard);
            self.buffer_pool.unpin_page(old_root_id, true)?;
            self.buffer_pool.delete_page(old_root_id)?;
        } else {
            let slot = path.len() - 1;
            serialize_node(&node, &mut path[slot].1)?;
        }
        Ok(())
    }
}
