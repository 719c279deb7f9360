//! Asynchronous connection logger
//!
//! The request path builds a [`ConnectionLog`] with [`LogRecordBuilder`] and
//! hands it to [`RequestLogger::submit`], which never waits: records go onto a
//! bounded queue drained by a fixed pool of worker tasks. Each worker emits
//! the record as one JSON line on the `connection_log` tracing target and then
//! persists it. Nothing a worker does can fail the MCP response.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::masking::Masker;
use crate::Result;
use crate::config::LoggingConfig;
use crate::model::ConnectionLog;
use crate::store::Store;

/// Builder for a connection log record, started when the request arrives.
#[derive(Debug)]
pub struct LogRecordBuilder {
    started: Instant,
    record: ConnectionLog,
}

impl LogRecordBuilder {
    /// Start a record for a service and JSON-RPC method.
    pub fn new(service_identifier: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            started: Instant::now(),
            record: ConnectionLog {
                id: Uuid::new_v4(),
                created_at: Utc::now(),
                account_name: None,
                service_identifier: service_identifier.into(),
                app_name: None,
                capability_name: None,
                method: method.into(),
                request_body: String::new(),
                response_body: String::new(),
                status_code: 200,
                duration_ms: 0,
                is_success: true,
                error_code: None,
                error_message: None,
                client_ip: None,
            },
        }
    }

    /// Set the JSON-RPC method (known only after parsing).
    #[must_use]
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.record.method = method.into();
        self
    }

    /// Snapshot the caller's account name.
    #[must_use]
    pub fn account(mut self, name: Option<&str>) -> Self {
        self.record.account_name = name.map(String::from);
        self
    }

    /// Snapshot the app name.
    #[must_use]
    pub fn app(mut self, name: Option<&str>) -> Self {
        self.record.app_name = name.map(String::from);
        self
    }

    /// Snapshot the capability name.
    #[must_use]
    pub fn capability(mut self, name: Option<&str>) -> Self {
        self.record.capability_name = name.map(String::from);
        self
    }

    /// Raw request body (masked on submit).
    #[must_use]
    pub fn request_body(mut self, body: impl Into<String>) -> Self {
        self.record.request_body = body.into();
        self
    }

    /// Raw response body (masked on submit).
    #[must_use]
    pub fn response_body(mut self, body: impl Into<String>) -> Self {
        self.record.response_body = body.into();
        self
    }

    /// HTTP status returned to the caller.
    #[must_use]
    pub fn status(mut self, status: u16) -> Self {
        self.record.status_code = status;
        self
    }

    /// Mark the exchange as failed.
    #[must_use]
    pub fn error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.record.is_success = false;
        self.record.error_code = Some(code.into());
        self.record.error_message = Some(message.into());
        self
    }

    /// Caller address.
    #[must_use]
    pub fn client_ip(mut self, ip: Option<String>) -> Self {
        self.record.client_ip = ip;
        self
    }

    /// Finish the record, stamping the elapsed time.
    #[must_use]
    pub fn build(mut self) -> ConnectionLog {
        self.record.duration_ms =
            u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.record
    }
}

/// Bounded, non-blocking connection log writer.
pub struct RequestLogger {
    tx: Mutex<Option<mpsc::Sender<ConnectionLog>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    masker: Masker,
    max_body_bytes: usize,
}

impl RequestLogger {
    /// Spawn the worker pool. Must be called inside a Tokio runtime.
    pub fn start(config: &LoggingConfig, store: Arc<dyn Store>) -> Result<Self> {
        let masker = Masker::new(&config.masking)?;
        if !config.enabled {
            debug!("Connection logging disabled");
            return Ok(Self {
                tx: Mutex::new(None),
                workers: Mutex::new(Vec::new()),
                masker,
                max_body_bytes: config.max_body_bytes,
            });
        }

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = (0..config.workers.max(1))
            .map(|n| tokio::spawn(worker(n, Arc::clone(&rx), Arc::clone(&store))))
            .collect();

        info!(
            workers = config.workers.max(1),
            queue = config.queue_capacity,
            "Connection logger started"
        );
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            masker,
            max_body_bytes: config.max_body_bytes,
        })
    }

    /// Mask, truncate, and enqueue a record. Drops it if the queue is full or
    /// the logger is shut down.
    pub fn submit(&self, mut record: ConnectionLog) {
        record.request_body = self
            .masker
            .mask_truncated(&record.request_body, self.max_body_bytes);
        record.response_body = self
            .masker
            .mask_truncated(&record.response_body, self.max_body_bytes);

        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return;
        };
        if let Err(e) = tx.try_send(record) {
            telemetry_metrics::counter!("accelmcp_logs_dropped_total").increment(1);
            match e {
                mpsc::error::TrySendError::Full(r) => {
                    warn!(log_id = %r.id, method = %r.method, "Connection log queue full, dropping record");
                }
                mpsc::error::TrySendError::Closed(r) => {
                    warn!(log_id = %r.id, "Connection logger closed, dropping record");
                }
            }
        }
    }

    /// Stop accepting records and wait for the queue to drain.
    pub async fn shutdown(&self) {
        drop(self.tx.lock().take());
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "Connection log worker panicked");
            }
        }
        debug!("Connection logger drained");
    }
}

async fn worker(
    n: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ConnectionLog>>>,
    store: Arc<dyn Store>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(record) = next else {
            break;
        };
        match serde_json::to_string(&record) {
            Ok(json) => info!(target: "connection_log", record = %json, "connection"),
            Err(e) => warn!(error = %e, "Failed to serialize connection log"),
        }
        if let Err(e) = store.insert_connection_log(record).await {
            warn!(worker = n, error = %e, "Failed to persist connection log");
        }
    }
    debug!(worker = n, "Connection log worker stopped");
}

/// Periodically delete connection logs older than `retention`.
pub fn spawn_retention_task(
    store: Arc<dyn Store>,
    retention: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        loop {
            ticker.tick().await;
            let cutoff = Utc::now()
                - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::days(30));
            match store.prune_connection_logs(cutoff).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "Pruned old connection logs"),
                Err(e) => warn!(error = %e, "Connection log pruning failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MaskingConfig;
    use crate::model::{
        AccountPermission, App, Capability, ConnectionAccount, EntityId, McpService,
        PermissionTarget, Variable,
    };
    use crate::store::{Catalog, MemoryStore};
    use crate::{Error, Result};
    use async_trait::async_trait;
    use chrono::DateTime;
    use pretty_assertions::assert_eq;

    fn config() -> LoggingConfig {
        LoggingConfig {
            max_body_bytes: 64,
            ..LoggingConfig::default()
        }
    }

    fn memory_store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(Catalog::default()).unwrap())
    }

    #[test]
    fn builder_sets_failure_fields() {
        let record = LogRecordBuilder::new("acme", "tools/call")
            .account(Some("alice"))
            .app(Some("Weather"))
            .capability(Some("get_forecast"))
            .status(200)
            .error("HTTP_500", "Internal Server Error")
            .build();
        assert!(!record.is_success);
        assert_eq!(record.error_code.as_deref(), Some("HTTP_500"));
        assert_eq!(record.account_name.as_deref(), Some("alice"));
        assert_eq!(record.service_identifier, "acme");
    }

    #[tokio::test]
    async fn records_are_masked_truncated_and_persisted() {
        let store = memory_store();
        let logger = RequestLogger::start(&config(), store.clone()).unwrap();

        let record = LogRecordBuilder::new("acme", "tools/call")
            .request_body(format!(r#"{{"card":"4111111111111111","pad":"{}"}}"#, "x".repeat(200)))
            .response_body("ok")
            .build();
        logger.submit(record);
        logger.shutdown().await;

        let logs = store.connection_logs(10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(!logs[0].request_body.contains("4111111111111111"));
        assert!(logs[0].request_body.contains("[CARD]"));
        assert!(logs[0].request_body.ends_with("...[truncated]"));
        assert_eq!(logs[0].response_body, "ok");
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_dropped() {
        let store = memory_store();
        let logger = RequestLogger::start(&config(), store.clone()).unwrap();
        logger.shutdown().await;
        logger.submit(LogRecordBuilder::new("acme", "ping").build());
        assert!(store.connection_logs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_logger_persists_nothing() {
        let store = memory_store();
        let cfg = LoggingConfig {
            enabled: false,
            ..config()
        };
        let logger = RequestLogger::start(&cfg, store.clone()).unwrap();
        logger.submit(LogRecordBuilder::new("acme", "ping").build());
        logger.shutdown().await;
        assert!(store.connection_logs(10).await.unwrap().is_empty());
    }

    #[test]
    fn invalid_mask_pattern_fails_start() {
        let cfg = LoggingConfig {
            masking: MaskingConfig {
                custom_patterns: vec!["[".to_string()],
                ..MaskingConfig::default()
            },
            ..config()
        };
        // Pattern compilation happens before any task is spawned
        assert!(RequestLogger::start(&cfg, memory_store()).is_err());
    }

    struct FailingStore;

    #[async_trait]
    impl Store for FailingStore {
        async fn service_by_identifier(&self, _: &str) -> Result<Option<McpService>> {
            Ok(None)
        }
        async fn apps_for_service(&self, _: EntityId) -> Result<Vec<App>> {
            Ok(Vec::new())
        }
        async fn app_by_name(&self, _: EntityId, _: &str) -> Result<Option<App>> {
            Ok(None)
        }
        async fn capabilities_for_app(&self, _: EntityId) -> Result<Vec<Capability>> {
            Ok(Vec::new())
        }
        async fn account_by_token(&self, _: &str) -> Result<Option<ConnectionAccount>> {
            Ok(None)
        }
        async fn has_grant(&self, _: EntityId, _: PermissionTarget) -> Result<bool> {
            Ok(false)
        }
        async fn grant(&self, _: EntityId, _: PermissionTarget) -> Result<AccountPermission> {
            Err(Error::Store("read-only".into()))
        }
        async fn revoke(&self, _: EntityId, _: PermissionTarget) -> Result<bool> {
            Err(Error::Store("read-only".into()))
        }
        async fn variables(&self) -> Result<Vec<Variable>> {
            Ok(Vec::new())
        }
        async fn insert_connection_log(&self, _: ConnectionLog) -> Result<()> {
            Err(Error::Store("disk full".into()))
        }
        async fn connection_logs(&self, _: usize) -> Result<Vec<ConnectionLog>> {
            Ok(Vec::new())
        }
        async fn prune_connection_logs(&self, _: DateTime<Utc>) -> Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn persist_failures_are_swallowed() {
        let logger = RequestLogger::start(&config(), Arc::new(FailingStore)).unwrap();
        for _ in 0..5 {
            logger.submit(LogRecordBuilder::new("acme", "ping").build());
        }
        // Completes without panicking or surfacing the store error
        logger.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let store = memory_store();
        let cfg = LoggingConfig {
            queue_capacity: 1,
            workers: 1,
            ..config()
        };
        let logger = RequestLogger::start(&cfg, store.clone()).unwrap();
        for _ in 0..100 {
            logger.submit(LogRecordBuilder::new("acme", "ping").build());
        }
        logger.shutdown().await;
        let persisted = store.connection_logs(1000).await.unwrap().len();
        assert!((1..=100).contains(&persisted));
    }

    #[tokio::test]
    async fn retention_task_prunes_on_first_tick() {
        let store = memory_store();
        let mut old = LogRecordBuilder::new("acme", "ping").build();
        old.created_at = Utc::now() - chrono::Duration::days(60);
        store.insert_connection_log(old).await.unwrap();
        store
            .insert_connection_log(LogRecordBuilder::new("acme", "ping").build())
            .await
            .unwrap();

        let handle = spawn_retention_task(
            store.clone(),
            Duration::from_secs(30 * 86_400),
            Duration::from_secs(3600),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        assert_eq!(store.connection_logs(10).await.unwrap().len(), 1);
    }
}
