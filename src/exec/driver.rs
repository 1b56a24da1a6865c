//! Warehouse driver contract.
//!
//! The driver executes one statement at a time against the warehouse and
//! exposes column metadata. Statement timeouts are enforced by the guard,
//! which calls [`WarehouseDriver::cancel`] when the deadline expires. A
//! connection is acquired and released per statement on every exit path.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors surfaced by the warehouse driver.
///
/// The `Query` message text is the classifier's input; drivers conforming
/// to the `invalid identifier 'X'` / `column X not found` / `ambiguous`
/// / `timeout` message shapes trigger the matching repair path.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("{0}")]
    Query(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("statement cancelled")]
    Cancelled,
}

/// Column metadata of a result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

/// One executed statement's output.
#[derive(Debug, Clone)]
pub struct QueryOutput {
    pub rows: Vec<Vec<Value>>,
    pub columns: Vec<ColumnInfo>,
    pub query_id: Option<String>,
    pub elapsed: Duration,
}

/// Contract with the warehouse.
#[async_trait]
pub trait WarehouseDriver: Send + Sync {
    /// Execute a single read statement.
    async fn execute(&self, sql: &str) -> DriverResult<QueryOutput>;

    /// Return the textual EXPLAIN plan for a statement.
    async fn explain(&self, sql: &str) -> DriverResult<String>;

    /// Cancel the in-flight statement for this session, if any.
    async fn cancel(&self) -> DriverResult<()>;

    /// Tag the session for attribution in the warehouse's query history.
    async fn set_session_tag(&self, _tag: &str) -> DriverResult<()> {
        Ok(())
    }
}
