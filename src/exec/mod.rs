//! Guarded execution against the warehouse.
//!
//! The [`WarehouseDriver`] trait is the contract with the database
//! collaborator. The [`ExecutionGuard`] wraps it with preflight policy
//! checks, a per-statement timeout, bounded retries, a circuit breaker,
//! a bounded result cache, and a classifier-driven repair loop.

pub mod classify;
pub mod driver;
pub mod guard;
pub mod repair;

pub use classify::{classify, ErrorClass};
pub use driver::{ColumnInfo, DriverError, DriverResult, QueryOutput, WarehouseDriver};
pub use guard::{ExecError, ExecutionGuard, ExecutionResult, GuardConfig};
pub use repair::{attempt_repair, Repair, RepairContext};
