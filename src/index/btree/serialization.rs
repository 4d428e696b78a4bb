use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::common::types::{Page, PAGE_SIZE};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::BTreeNode;

const LEN_PREFIX_SIZE: usize = 4;

/// Serialize a node into its page, behind a length prefix
pub fn serialize_node<K: Serialize>(node: &BTreeNode<K>, page: &mut Page) -> Result<(), BTreeError> {
    let bytes = bincode::serialize(node)
        .map_err(|e| BTreeError::SerializationError(e.to_string()))?;

    if LEN_PREFIX_SIZE + bytes.len() > PAGE_SIZE {
        return Err(BTreeError::NodeTooLarge);
    }

    LittleEndian::write_u32(&mut page.data[0..LEN_PREFIX_SIZE], bytes.len() as u32);
    page.data[LEN_PREFIX_SIZE..LEN_PREFIX_SIZE + bytes.len()].copy_from_slice(&bytes);

    Ok(())
}

/// Deserialize the node stored in a page
pub fn deserialize_node<K: DeserializeOwned>(page: &Page) -> Result<BTreeNode<K>, BTreeError> {
    let len = LittleEndian::read_u32(&page.data[0..LEN_PREFIX_SIZE]) as usize;
    if len == 0 || LEN_PREFIX_SIZE + len > PAGE_SIZE {
        return Err(BTreeError::InvalidPageFormat);
    }

    bincode::deserialize(&page.data[LEN_PREFIX_SIZE..LEN_PREFIX_SIZE + len])
        .map_err(|e| BTreeError::DeserializationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{Rid, INVALID_PAGE_ID};

    #[test]
    fn test_leaf_roundtrip() {
        let mut node = BTreeNode::<i64>::new_leaf(3, 1, 16);
        node.leaf_insert(42, Rid::new(3, 0));
        node.leaf_insert(7, Rid::new(3, 1));
        node.next_page_id = 9;

        let mut page = Page::new(3);
        serialize_node(&node, &mut page).unwrap();
        let back: BTreeNode<i64> = deserialize_node(&page).unwrap();

        assert!(back.is_leaf());
        assert_eq!(back.page_id, 3);
        assert_eq!(back.parent_page_id, 1);
        assert_eq!(back.max_size, 16);
        assert_eq!(back.next_page_id, 9);
        assert_eq!(back.keys, vec![7, 42]);
        assert_eq!(back.values, vec![Rid::new(3, 1), Rid::new(3, 0)]);
    }

    #[test]
    fn test_internal_roundtrip() {
        let mut node = BTreeNode::<i64>::new_internal(5, INVALID_PAGE_ID, 8);
        node.populate_new_root(1, 100, 2);

        let mut page = Page::new(5);
        serialize_node(&node, &mut page).unwrap();
        let back: BTreeNode<i64> = deserialize_node(&page).unwrap();

        assert!(!back.is_leaf());
        assert!(back.is_root());
        assert_eq!(back.children, vec![1, 2]);
        assert_eq!(back.keys[1], 100);
    }

    #[test]
    fn test_empty_page_rejected() {
        let page = Page::new(1);
        assert!(deserialize_node::<i64>(&page).is_err());
    }
}
