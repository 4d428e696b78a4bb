pub mod error;
pub mod node;
pub mod index;
pub mod serialization;

pub use error::BTreeError;
pub use index::{BTreeIndex, BTreeIterator};
pub use node::{BTreeNode, BTreePageType};
pub use serialization::{serialize_node, deserialize_node};
