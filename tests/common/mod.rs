//! Shared fixtures for integration tests: an on-disk semantic model and
//! a scriptable in-memory warehouse driver.
#![allow(dead_code)]

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use augur::exec::{ColumnInfo, DriverError, DriverResult, QueryOutput, WarehouseDriver};

/// Write the demo semantic model: accounts, companies, opportunities,
/// plus the catalog document.
pub fn write_model_dir() -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");

    let accounts = json!({
        "name": "accounts",
        "table": "dwh_prod.analytics.accounts",
        "grain": "one row per product account",
        "dimensions": [
            {"name": "ID", "sql": "{CUBE}.ID", "type": "string", "primary_key": true},
            {"name": "ACCOUNT_TIER", "sql": "{CUBE}.ACCOUNT_TIER", "type": "string",
             "aliases": ["tier"]},
            {"name": "COMPANY_ID", "sql": "{CUBE}.COMPANY_ID", "type": "string"}
        ],
        "time_dimensions": [
            {"name": "CREATED_AT", "sql": "{CUBE}.CREATED_AT", "type": "time"}
        ],
        "measures": [
            {"name": "count", "agg": "count"}
        ],
        "joins": [
            {"target_entity": "companies", "relationship": "many_to_one",
             "from_field": "COMPANY_ID", "to_field": "ID"}
        ]
    });

    let companies = json!({
        "name": "companies",
        "table": "dwh_prod.crm.companies",
        "grain": "one row per company",
        "dimensions": [
            {"name": "ID", "sql": "{CUBE}.ID", "type": "string", "primary_key": true},
            {"name": "NAME", "sql": "{CUBE}.NAME", "type": "string"},
            {"name": "SEGMENT", "sql": "{CUBE}.SEGMENT", "type": "string"}
        ],
        "time_dimensions": [
            {"name": "SIGNED_AT", "sql": "{CUBE}.SIGNED_AT", "type": "time"}
        ],
        "measures": [
            {"name": "count", "agg": "count"}
        ]
    });

    let opportunities = json!({
        "name": "opportunities",
        "table": "dwh_prod.analytics.opportunities",
        "grain": "one row per sales opportunity",
        "dimensions": [
            {"name": "OPPORTUNITY_TYPE", "sql": "{CUBE}.OPPORTUNITY_TYPE", "type": "string"},
            {"name": "NEW_BUSINESS_ANNUAL_RECURRING_REVENUE",
             "sql": "{CUBE}.NEW_BUSINESS_ANNUAL_RECURRING_REVENUE", "type": "number"}
        ],
        "time_dimensions": [
            {"name": "CLOSE_DATE", "sql": "{CUBE}.CLOSE_DATE", "type": "time"}
        ],
        "measures": [
            {"name": "count", "agg": "count"},
            {"name": "new_arr_sum", "agg": "sum",
             "sql": "{CUBE}.NEW_BUSINESS_ANNUAL_RECURRING_REVENUE"}
        ],
        "metrics": [
            {"name": "NEW_ARR", "type": "atomic", "measure": "new_arr_sum",
             "anchor_date": "CLOSE_DATE"}
        ]
    });

    let catalog = json!({
        "version": 1,
        "entities": [
            {"name": "accounts", "grain": "one row per product account",
             "description": "Product accounts with tier and owning company",
             "example_questions": ["How many accounts per tier?"],
             "tags": ["product"]},
            {"name": "companies", "grain": "one row per company",
             "description": "CRM companies", "tags": ["crm"]},
            {"name": "opportunities", "grain": "one row per sales opportunity",
             "description": "Sales pipeline with ARR amounts",
             "example_questions": ["What is new ARR this quarter?"],
             "tags": ["sales"]}
        ]
    });

    for (name, doc) in [
        ("accounts", &accounts),
        ("companies", &companies),
        ("opportunities", &opportunities),
    ] {
        fs::write(
            dir.path().join(format!("{name}.json")),
            serde_json::to_string_pretty(doc).unwrap(),
        )
        .unwrap();
    }
    fs::write(
        dir.path().join("_catalog.json"),
        serde_json::to_string_pretty(&catalog).unwrap(),
    )
    .unwrap();

    dir
}

/// A driver that pops scripted responses; once the script is exhausted it
/// keeps returning the last configured default.
pub struct FakeDriver {
    scripted: Mutex<Vec<DriverResult<QueryOutput>>>,
    calls: AtomicUsize,
    executed: Mutex<Vec<String>>,
}

impl FakeDriver {
    /// Always returns `rows` with `columns`.
    pub fn with_rows(columns: Vec<&str>, rows: Vec<Vec<serde_json::Value>>) -> Self {
        Self {
            scripted: Mutex::new(vec![Ok(output(columns, rows))]),
            calls: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Fails with `message` for the first `failures` calls, then returns
    /// the given rows.
    pub fn failing_then(
        failures: usize,
        message: &str,
        columns: Vec<&str>,
        rows: Vec<Vec<serde_json::Value>>,
    ) -> Self {
        let mut scripted: Vec<DriverResult<QueryOutput>> = Vec::new();
        for _ in 0..failures {
            scripted.push(Err(DriverError::Query(message.to_string())));
        }
        scripted.push(Ok(output(columns, rows)));
        scripted.reverse();
        Self {
            scripted: Mutex::new(scripted),
            calls: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every statement this driver saw, in order.
    pub fn executed_sql(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

fn output(columns: Vec<&str>, rows: Vec<Vec<serde_json::Value>>) -> QueryOutput {
    QueryOutput {
        rows,
        columns: columns
            .into_iter()
            .map(|name| ColumnInfo {
                name: name.to_string(),
                data_type: "text".to_string(),
            })
            .collect(),
        query_id: Some("q-test".to_string()),
        elapsed: Duration::from_millis(3),
    }
}

#[async_trait]
impl WarehouseDriver for FakeDriver {
    async fn execute(&self, sql: &str) -> DriverResult<QueryOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.executed.lock().unwrap().push(sql.to_string());

        let mut scripted = self.scripted.lock().unwrap();
        if scripted.len() > 1 {
            return scripted.pop().unwrap();
        }
        // Keep replaying the final response.
        match scripted.last().unwrap() {
            Ok(out) => Ok(out.clone()),
            Err(DriverError::Query(m)) => Err(DriverError::Query(m.clone())),
            Err(DriverError::Connection(m)) => Err(DriverError::Connection(m.clone())),
            Err(DriverError::Cancelled) => Err(DriverError::Cancelled),
        }
    }

    async fn explain(&self, _sql: &str) -> DriverResult<String> {
        Ok("Filter -> TableScan accounts rows=1200".to_string())
    }

    async fn cancel(&self) -> DriverResult<()> {
        Ok(())
    }
}
