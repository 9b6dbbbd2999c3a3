//! XA transaction coordination
//!
//! Provides:
//! - Transaction demarcation and resource enlistment
//! - Two-phase commit with priorities, one-phase and last-participant paths
//! - Heuristic outcome reporting
//! - Crash recovery with presumed abort

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod coordinator;
pub mod enlistment;
pub mod factory;
pub mod fatal;
pub mod journal;
pub mod manager;
pub mod recovery;
pub mod registry;
pub mod service;
pub mod transaction;
pub mod xa;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use coordinator::TwoPhaseCoordinator;
pub use factory::{DestroyError, FactoryError, FactoryRegistry, XaResourceFactory};
pub use fatal::{AbortProcess, FatalErrorHandler};
pub use journal::{HeuristicJournal, HeuristicReport};
pub use manager::{SuspendedTransaction, TransactionManager, TxContext};
pub use recovery::{RecoveryManager, RecoveryReport};
pub use registry::ResourceRegistry;
pub use service::TransactionService;
pub use transaction::{Status, Transaction, TxState};
pub use xa::{CommitMode, EndFlag, StartFlag, Vote, XaError, XaErrorCode, XaResource, XaResult};
