pub mod transaction;
pub mod transaction_manager;
pub mod lock_manager;

pub use transaction::{
    AbortReason, IsolationLevel, IndexWriteRecord, Transaction, TransactionError,
    TransactionState, WType,
};
pub use transaction_manager::TransactionManager;
pub use lock_manager::LockManager;
