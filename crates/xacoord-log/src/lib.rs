//! xacoord Log - Durable recovery log
//!
//! Stores resource registrations, forced commit decisions and completion
//! markers so that in-doubt transactions can be resolved after a crash.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod file;
pub mod memory;
pub mod record;
pub mod store;
pub mod tranlog;

pub use file::FileLogStore;
pub use memory::MemoryLogStore;
pub use record::{BranchRecord, CompletedRecord, LogRecord, LoggedState, PartnerRecord, TransactionRecord};
pub use store::LogStore;
pub use tranlog::{PruneStats, TransactionLog};
