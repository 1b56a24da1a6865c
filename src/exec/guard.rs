//! The execution guard: policy preflight, statement timeout, bounded
//! retries, circuit breaker, result cache, and the auto-repair loop.
//!
//! Shared state (breaker counters and the result cache) is owned by the
//! guard and serialized behind mutexes; one guard instance is shared
//! process-wide via `Arc`. [`ExecutionGuard::reset`] clears both so state
//! never leaks across tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::classify::classify;
use super::driver::{ColumnInfo, WarehouseDriver};
use super::repair::{attempt_repair, RepairContext};
use crate::config::GuardSettings;
use crate::sql::render::ROW_LIMIT;
use crate::sql::validate::syntax_scan;

/// Maximum repair attempts per request.
const MAX_REPAIRS: u32 = 2;

/// Guard tunables. See [`GuardSettings`] for the configuration surface.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub statement_timeout: Duration,
    pub explain_timeout: Duration,
    pub max_attempts: u32,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            statement_timeout: Duration::from_secs(20),
            explain_timeout: Duration::from_secs(10),
            max_attempts: 3,
            breaker_threshold: 3,
            breaker_cooldown: Duration::from_secs(60),
            cache_capacity: 100,
            cache_ttl: Duration::from_secs(300),
        }
    }
}

impl From<&GuardSettings> for GuardConfig {
    fn from(settings: &GuardSettings) -> Self {
        Self {
            statement_timeout: settings.statement_timeout(),
            explain_timeout: settings.explain_timeout(),
            max_attempts: settings.effective_attempts(),
            breaker_threshold: settings.breaker_threshold,
            breaker_cooldown: settings.breaker_cooldown(),
            cache_capacity: settings.cache_capacity,
            cache_ttl: settings.cache_ttl(),
        }
    }
}

/// Errors surfaced by guarded execution.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecError {
    /// Statement violates execution policy. Never retried.
    #[error("policy violation: {0}")]
    Policy(String),

    /// Circuit breaker is open; the warehouse was not contacted.
    #[error("circuit breaker open, retry in {retry_in_ms} ms")]
    BreakerOpen { retry_in_ms: u64 },

    /// Execution failed after retries and up to two repairs.
    #[error("{message}")]
    Failed {
        message: String,
        attempted_sql: String,
        repaired: bool,
        repair_reason: Option<String>,
    },
}

/// One guarded execution's outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub rows: Vec<Vec<Value>>,
    pub columns: Vec<ColumnInfo>,
    pub last_query_id: Option<String>,
    pub execution_time_ms: u64,
    pub truncated: bool,
    pub from_cache: bool,
    /// The statement that actually ran (post-repair when repaired).
    pub attempted_sql: String,
    pub repaired: bool,
    pub repair_reason: Option<String>,
}

struct BreakerState {
    consecutive_failures: u32,
    tripped_until: Option<Instant>,
}

struct CacheEntry {
    rows: Vec<Vec<Value>>,
    columns: Vec<ColumnInfo>,
    cached_at: Instant,
}

struct ResultCache {
    entries: HashMap<String, CacheEntry>,
    insertion_order: VecDeque<String>,
}

impl ResultCache {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
        }
    }

    fn lookup(&mut self, sql: &str, ttl: Duration) -> Option<(Vec<Vec<Value>>, Vec<ColumnInfo>)> {
        let expired = match self.entries.get(sql) {
            Some(entry) => entry.cached_at.elapsed() > ttl,
            None => return None,
        };
        if expired {
            self.entries.remove(sql);
            self.insertion_order.retain(|k| k != sql);
            return None;
        }
        let entry = self.entries.get(sql)?;
        Some((entry.rows.clone(), entry.columns.clone()))
    }

    fn insert(&mut self, sql: &str, rows: Vec<Vec<Value>>, columns: Vec<ColumnInfo>, cap: usize) {
        if !self.entries.contains_key(sql) {
            while self.entries.len() >= cap.max(1) {
                match self.insertion_order.pop_front() {
                    Some(oldest) => {
                        self.entries.remove(&oldest);
                    }
                    None => break,
                }
            }
            self.insertion_order.push_back(sql.to_string());
        }
        self.entries.insert(
            sql.to_string(),
            CacheEntry {
                rows,
                columns,
                cached_at: Instant::now(),
            },
        );
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.insertion_order.clear();
    }
}

/// Guarded executor over a warehouse driver.
pub struct ExecutionGuard {
    driver: Arc<dyn WarehouseDriver>,
    config: GuardConfig,
    breaker: Mutex<BreakerState>,
    cache: Mutex<ResultCache>,
}

impl ExecutionGuard {
    pub fn new(driver: Arc<dyn WarehouseDriver>, config: GuardConfig) -> Self {
        Self {
            driver,
            config,
            breaker: Mutex::new(BreakerState {
                consecutive_failures: 0,
                tripped_until: None,
            }),
            cache: Mutex::new(ResultCache::new()),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Clear breaker and cache state. Test hook and operational reset.
    pub fn reset(&self) {
        let mut breaker = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
        breaker.consecutive_failures = 0;
        breaker.tripped_until = None;
        drop(breaker);
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Execute a statement with the full guard stack.
    ///
    /// The cache key is always the original SQL, and cache writes happen
    /// after success regardless of whether a repair produced the final
    /// statement.
    pub async fn execute_with_repair(
        &self,
        sql: &str,
        repair_ctx: RepairContext<'_>,
    ) -> Result<ExecutionResult, ExecError> {
        // Preflight: the syntax-scan policy, re-enforced at execution time.
        let scan = syntax_scan(sql);
        if !scan.ok {
            let detail: Vec<String> = scan.issues.into_iter().map(|i| i.message).collect();
            return Err(ExecError::Policy(detail.join("; ")));
        }

        // Cache hit short-circuits everything.
        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((rows, columns)) = cache.lookup(sql, self.config.cache_ttl) {
                debug!("result cache hit");
                let truncated = rows.len() >= ROW_LIMIT;
                return Ok(ExecutionResult {
                    rows,
                    columns,
                    last_query_id: None,
                    execution_time_ms: 0,
                    truncated,
                    from_cache: true,
                    attempted_sql: sql.to_string(),
                    repaired: false,
                    repair_reason: None,
                });
            }
        }

        let mut current = sql.to_string();
        let mut repaired = false;
        let mut repair_reason: Option<String> = None;

        for round in 0..=MAX_REPAIRS {
            match self.run_with_retries(&current).await {
                Ok(output) => {
                    {
                        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
                        cache.insert(
                            sql,
                            output.rows.clone(),
                            output.columns.clone(),
                            self.config.cache_capacity,
                        );
                    }
                    let truncated = output.rows.len() >= ROW_LIMIT;
                    return Ok(ExecutionResult {
                        rows: output.rows,
                        columns: output.columns,
                        last_query_id: output.query_id,
                        execution_time_ms: output.elapsed.as_millis() as u64,
                        truncated,
                        from_cache: false,
                        attempted_sql: current,
                        repaired,
                        repair_reason,
                    });
                }
                Err(RunError::BreakerOpen { retry_in_ms }) => {
                    return Err(ExecError::BreakerOpen { retry_in_ms });
                }
                Err(RunError::Execution(message)) => {
                    if round == MAX_REPAIRS {
                        return Err(ExecError::Failed {
                            message,
                            attempted_sql: current,
                            repaired,
                            repair_reason,
                        });
                    }
                    let class = classify(&message);
                    match attempt_repair(&class, &current, &repair_ctx) {
                        Some(repair) => {
                            info!(reason = %repair.reason, "applying SQL repair");
                            current = repair.sql;
                            repaired = true;
                            repair_reason = Some(repair.reason);
                        }
                        None => {
                            return Err(ExecError::Failed {
                                message,
                                attempted_sql: current,
                                repaired,
                                repair_reason,
                            });
                        }
                    }
                }
            }
        }

        unreachable!("repair loop always returns within MAX_REPAIRS rounds");
    }

    /// Explain a statement under the explain timeout. No retries, no
    /// cache; breaker state is untouched.
    pub async fn explain(&self, sql: &str) -> Result<String, ExecError> {
        let scan = syntax_scan(sql);
        if !scan.ok {
            let detail: Vec<String> = scan.issues.into_iter().map(|i| i.message).collect();
            return Err(ExecError::Policy(detail.join("; ")));
        }

        match timeout(self.config.explain_timeout, self.driver.explain(sql)).await {
            Ok(Ok(plan)) => Ok(plan),
            Ok(Err(e)) => Err(ExecError::Failed {
                message: e.to_string(),
                attempted_sql: sql.to_string(),
                repaired: false,
                repair_reason: None,
            }),
            Err(_) => {
                let _ = self.driver.cancel().await;
                Err(ExecError::Failed {
                    message: format!(
                        "Statement timeout after {}s",
                        self.config.explain_timeout.as_secs()
                    ),
                    attempted_sql: sql.to_string(),
                    repaired: false,
                    repair_reason: None,
                })
            }
        }
    }

    /// One execution cycle: breaker gate, then bounded attempts with
    /// exponential backoff. The breaker counts whole cycles, not
    /// individual attempts.
    async fn run_with_retries(
        &self,
        sql: &str,
    ) -> Result<super::driver::QueryOutput, RunError> {
        self.check_breaker()?;

        let attempts = self.config.max_attempts.clamp(1, 5);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = Duration::from_millis(250u64 << (attempt - 2));
                debug!(attempt, ?delay, "retrying after backoff");
                sleep(delay).await;
            }

            match timeout(self.config.statement_timeout, self.driver.execute(sql)).await {
                Ok(Ok(output)) => {
                    self.record_success();
                    return Ok(output);
                }
                Ok(Err(e)) => {
                    warn!(attempt, error = %e, "execution attempt failed");
                    last_error = e.to_string();
                }
                Err(_) => {
                    // Cancel best-effort; the deadline stands either way.
                    let _ = self.driver.cancel().await;
                    last_error = format!(
                        "Statement timeout after {}s",
                        self.config.statement_timeout.as_secs()
                    );
                    warn!(attempt, "execution attempt timed out");
                }
            }
        }

        self.record_failure();
        Err(RunError::Execution(last_error))
    }

    fn check_breaker(&self) -> Result<(), RunError> {
        let mut breaker = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(until) = breaker.tripped_until {
            let now = Instant::now();
            if now < until {
                return Err(RunError::BreakerOpen {
                    retry_in_ms: (until - now).as_millis() as u64,
                });
            }
            // Cool-down elapsed: half-open, allow the next execution.
            breaker.tripped_until = None;
            breaker.consecutive_failures = 0;
        }
        Ok(())
    }

    fn record_success(&self) {
        let mut breaker = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
        breaker.consecutive_failures = 0;
        breaker.tripped_until = None;
    }

    fn record_failure(&self) {
        let mut breaker = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
        breaker.consecutive_failures += 1;
        if breaker.consecutive_failures >= self.config.breaker_threshold {
            breaker.tripped_until = Some(Instant::now() + self.config.breaker_cooldown);
            warn!(
                failures = breaker.consecutive_failures,
                "circuit breaker opened"
            );
        }
    }
}

enum RunError {
    BreakerOpen { retry_in_ms: u64 },
    Execution(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::driver::{DriverError, DriverResult, QueryOutput};
    use crate::semantic::entity::fixtures;
    use crate::semantic::Registry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Driver that fails a fixed number of times before succeeding, or
    /// always fails with a given message.
    struct ScriptedDriver {
        calls: AtomicUsize,
        failures_before_success: usize,
        error_message: String,
    }

    impl ScriptedDriver {
        fn failing_times(n: usize, message: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures_before_success: n,
                error_message: message.to_string(),
            }
        }

        fn always_ok() -> Self {
            Self::failing_times(0, "")
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WarehouseDriver for ScriptedDriver {
        async fn execute(&self, _sql: &str) -> DriverResult<QueryOutput> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                return Err(DriverError::Query(self.error_message.clone()));
            }
            Ok(QueryOutput {
                rows: vec![vec![serde_json::json!("enterprise"), serde_json::json!(42)]],
                columns: vec![
                    ColumnInfo {
                        name: "ACCOUNT_TIER".to_string(),
                        data_type: "text".to_string(),
                    },
                    ColumnInfo {
                        name: "count".to_string(),
                        data_type: "number".to_string(),
                    },
                ],
                query_id: Some("q-1".to_string()),
                elapsed: Duration::from_millis(5),
            })
        }

        async fn explain(&self, _sql: &str) -> DriverResult<String> {
            Ok("TableScan accounts".to_string())
        }

        async fn cancel(&self) -> DriverResult<()> {
            Ok(())
        }
    }

    fn fast_config() -> GuardConfig {
        GuardConfig {
            statement_timeout: Duration::from_millis(200),
            explain_timeout: Duration::from_millis(200),
            max_attempts: 1,
            breaker_threshold: 3,
            breaker_cooldown: Duration::from_secs(60),
            cache_capacity: 2,
            cache_ttl: Duration::from_secs(300),
        }
    }

    fn repair_registry() -> Registry {
        fixtures::registry()
    }

    #[tokio::test]
    async fn test_successful_execution() {
        let driver = Arc::new(ScriptedDriver::always_ok());
        let guard = ExecutionGuard::new(driver.clone(), fast_config());
        let registry = repair_registry();
        let ctx = RepairContext {
            registry: &registry,
            join_path: None,
        };

        let result = guard
            .execute_with_repair("SELECT 1 FROM analytics.t LIMIT 1001", ctx)
            .await
            .unwrap();
        assert_eq!(result.rows.len(), 1);
        assert!(!result.from_cache);
        assert!(!result.repaired);
        assert_eq!(driver.call_count(), 1);
    }

    #[tokio::test]
    async fn test_policy_preflight_blocks_writes() {
        let driver = Arc::new(ScriptedDriver::always_ok());
        let guard = ExecutionGuard::new(driver.clone(), fast_config());
        let registry = repair_registry();
        let ctx = RepairContext {
            registry: &registry,
            join_path: None,
        };

        let err = guard
            .execute_with_repair("DROP TABLE analytics.t", ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Policy(_)));
        assert_eq!(driver.call_count(), 0, "driver must not be contacted");
    }

    #[tokio::test]
    async fn test_cache_hit_skips_driver() {
        let driver = Arc::new(ScriptedDriver::always_ok());
        let guard = ExecutionGuard::new(driver.clone(), fast_config());
        let registry = repair_registry();
        let ctx = RepairContext {
            registry: &registry,
            join_path: None,
        };

        let sql = "SELECT 1 FROM analytics.t LIMIT 1001";
        let first = guard.execute_with_repair(sql, ctx).await.unwrap();
        assert!(!first.from_cache);

        let second = guard.execute_with_repair(sql, ctx).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.rows, first.rows);
        assert_eq!(second.columns, first.columns);
        assert_eq!(driver.call_count(), 1);
    }

    #[tokio::test]
    async fn test_cache_capacity_evicts_oldest() {
        let driver = Arc::new(ScriptedDriver::always_ok());
        let guard = ExecutionGuard::new(driver.clone(), fast_config());
        let registry = repair_registry();
        let ctx = RepairContext {
            registry: &registry,
            join_path: None,
        };

        // Capacity 2: the third distinct statement evicts the first.
        guard.execute_with_repair("SELECT 1", ctx).await.unwrap();
        guard.execute_with_repair("SELECT 2", ctx).await.unwrap();
        guard.execute_with_repair("SELECT 3", ctx).await.unwrap();
        assert_eq!(driver.call_count(), 3);

        let again = guard.execute_with_repair("SELECT 1", ctx).await.unwrap();
        assert!(!again.from_cache, "oldest entry was evicted");
        assert_eq!(driver.call_count(), 4);

        let cached = guard.execute_with_repair("SELECT 3", ctx).await.unwrap();
        assert!(cached.from_cache);
        assert_eq!(driver.call_count(), 4);
    }

    #[tokio::test]
    async fn test_repair_after_column_not_found() {
        let driver = Arc::new(ScriptedDriver::failing_times(
            1,
            "SQL compilation error: invalid identifier 'ACCOUNT_TIRE'",
        ));
        let guard = ExecutionGuard::new(driver.clone(), fast_config());
        let registry = repair_registry();
        let ctx = RepairContext {
            registry: &registry,
            join_path: None,
        };

        let result = guard
            .execute_with_repair("SELECT ACCOUNT_TIRE FROM analytics.t LIMIT 1001", ctx)
            .await
            .unwrap();
        assert!(result.repaired);
        assert!(result.attempted_sql.contains("ACCOUNT_TIER"));
        assert!(result.repair_reason.unwrap().contains("ACCOUNT_TIRE"));
        assert_eq!(driver.call_count(), 2);
    }

    #[tokio::test]
    async fn test_repair_cap_is_two() {
        let driver = Arc::new(ScriptedDriver::failing_times(
            10,
            "invalid identifier 'ACCOUNT_TIRE'",
        ));
        let guard = ExecutionGuard::new(driver.clone(), fast_config());
        let registry = repair_registry();
        let ctx = RepairContext {
            registry: &registry,
            join_path: None,
        };

        let err = guard
            .execute_with_repair("SELECT ACCOUNT_TIRE FROM analytics.t LIMIT 1001", ctx)
            .await
            .unwrap_err();
        match err {
            ExecError::Failed { repaired, .. } => assert!(repaired),
            other => panic!("unexpected error: {other:?}"),
        }
        // Initial run plus two repaired runs.
        assert_eq!(driver.call_count(), 3);
    }

    #[tokio::test]
    async fn test_opaque_error_not_repaired() {
        let driver = Arc::new(ScriptedDriver::failing_times(10, "out of memory"));
        let guard = ExecutionGuard::new(driver.clone(), fast_config());
        let registry = repair_registry();
        let ctx = RepairContext {
            registry: &registry,
            join_path: None,
        };

        let err = guard
            .execute_with_repair("SELECT 1", ctx)
            .await
            .unwrap_err();
        match err {
            ExecError::Failed {
                repaired, message, ..
            } => {
                assert!(!repaired);
                assert!(message.contains("out of memory"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(driver.call_count(), 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_after_three_failures() {
        let driver = Arc::new(ScriptedDriver::failing_times(100, "out of memory"));
        let guard = ExecutionGuard::new(driver.clone(), fast_config());
        let registry = repair_registry();
        let ctx = RepairContext {
            registry: &registry,
            join_path: None,
        };

        for _ in 0..3 {
            let _ = guard.execute_with_repair("SELECT 1", ctx).await;
        }
        let err = guard.execute_with_repair("SELECT 1", ctx).await.unwrap_err();
        assert!(matches!(err, ExecError::BreakerOpen { .. }));
        assert_eq!(driver.call_count(), 3, "open breaker skips the driver");

        guard.reset();
        assert!(guard.execute_with_repair("SELECT 2", ctx).await.is_err());
        assert_eq!(driver.call_count(), 4, "reset closes the breaker");
    }

    #[tokio::test]
    async fn test_success_resets_breaker_counter() {
        let driver = Arc::new(ScriptedDriver::failing_times(2, "out of memory"));
        let guard = ExecutionGuard::new(driver.clone(), fast_config());
        let registry = repair_registry();
        let ctx = RepairContext {
            registry: &registry,
            join_path: None,
        };

        // Two failures, then a success: counter back to zero.
        let _ = guard.execute_with_repair("SELECT 1", ctx).await;
        let _ = guard.execute_with_repair("SELECT 2", ctx).await;
        guard.execute_with_repair("SELECT 3", ctx).await.unwrap();

        let breaker = guard.breaker.lock().unwrap();
        assert_eq!(breaker.consecutive_failures, 0);
        assert!(breaker.tripped_until.is_none());
    }

    #[tokio::test]
    async fn test_retries_with_backoff() {
        tokio::time::pause();

        let driver = Arc::new(ScriptedDriver::failing_times(2, "flaky connection"));
        let config = GuardConfig {
            max_attempts: 3,
            ..fast_config()
        };
        let guard = ExecutionGuard::new(driver.clone(), config);
        let registry = repair_registry();
        let ctx = RepairContext {
            registry: &registry,
            join_path: None,
        };

        let result = guard.execute_with_repair("SELECT 1", ctx).await.unwrap();
        assert!(!result.repaired, "retries succeeded without repair");
        assert_eq!(driver.call_count(), 3);
    }

    #[tokio::test]
    async fn test_cache_ttl_expiry() {
        let driver = Arc::new(ScriptedDriver::always_ok());
        let config = GuardConfig {
            cache_ttl: Duration::from_millis(0),
            ..fast_config()
        };
        let guard = ExecutionGuard::new(driver.clone(), config);
        let registry = repair_registry();
        let ctx = RepairContext {
            registry: &registry,
            join_path: None,
        };

        guard.execute_with_repair("SELECT 1", ctx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = guard.execute_with_repair("SELECT 1", ctx).await.unwrap();
        assert!(!second.from_cache, "zero TTL expires immediately");
        assert_eq!(driver.call_count(), 2);
    }
}
