//! Transactions and the registry of running and failed transactions.
//!
//! A write transaction locks its collections exclusively, writes every
//! operation to the log as it happens and applies it immediately. Multi
//! operation transactions are framed by begin and commit markers; an abort
//! writes an abort marker and reverts the applied operations newest first.
//!
//! Markers of aborted transactions stay in the log. Their ids are kept in
//! the failed set so the collector and recovery skip them.

mod manager;
mod state;

pub use manager::{RunningTransaction, TransactionManager};
pub use state::{DocumentOperation, Transaction, TransactionHints, TransactionStatus};
