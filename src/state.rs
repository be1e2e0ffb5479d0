//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every sensor session.
//!
//! ## What is shared:
//! - **Configuration**: Read-only after startup (`Arc<AppConfig>`)
//! - **Analyzer**: Immutable; owns the `Arc` to the process-wide reference signal
//! - **Publisher**: Wraps the sink client, which does its own locking
//! - **Worker pool**: A semaphore bounding how many sessions run at once
//! - **Metrics**: Pipeline counters behind `Arc<RwLock<T>>`, updated per chunk
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: Many sessions and handlers hold a reference to the same counters
//! - **RwLock**: Many concurrent readers (metrics endpoint) or one writer (a worker)

use crate::analysis::orchestrator::Analyzer;
use crate::config::AppConfig;
use crate::publish::publisher::Publisher;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tokio::sync::Semaphore;

/// Counters shared between all sessions.
pub type SharedMetrics = Arc<RwLock<AppMetrics>>;

/// Everything the HTTP layer and the session workers need.
#[derive(Clone)]
pub struct AppState {
    /// Effective configuration, fixed for the process lifetime
    pub config: Arc<AppConfig>,

    /// Pipeline counters
    pub metrics: SharedMetrics,

    /// Per-chunk analysis against the shared reference
    pub analyzer: Arc<Analyzer>,

    /// Delivery to the durable sink
    pub publisher: Arc<Publisher>,

    /// Bounded pool of session workers
    pub workers: Arc<Semaphore>,

    /// When the server started
    pub start_time: Instant,
}

/// Pipeline counters collected across all sessions since startup.
///
/// ## Why these metrics matter:
/// - **chunks_skipped**: Malformed or mismatched chunks; only visible here and in logs
/// - **chunks_dropped**: Sensors sending faster than their worker can analyze
/// - **events_failed**: Sink trouble; failed events are not retried
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct AppMetrics {
    /// Sessions currently holding a worker
    pub active_sessions: u32,

    /// Sessions that ran to completion (end of stream or cancellation)
    pub sessions_completed: u64,

    /// Chunks taken off a session queue for analysis
    pub chunks_received: u64,

    /// Chunks discarded because a session queue was full
    pub chunks_dropped: u64,

    /// Chunks that produced an analysis event
    pub chunks_analyzed: u64,

    /// Chunks that failed decoding or the rate check
    pub chunks_skipped: u64,

    /// Events accepted by the sink
    pub events_delivered: u64,

    /// Events the sink did not accept
    pub events_failed: u64,
}

impl AppMetrics {
    /// Share of analyzed chunks whose event reached the sink (0.0 to 1.0).
    pub fn delivery_rate(&self) -> f64 {
        let attempts = self.events_delivered + self.events_failed;
        if attempts > 0 {
            self.events_delivered as f64 / attempts as f64
        } else {
            0.0
        }
    }

    /// Share of received chunks that were skipped (0.0 to 1.0).
    pub fn skip_rate(&self) -> f64 {
        if self.chunks_received > 0 {
            self.chunks_skipped as f64 / self.chunks_received as f64
        } else {
            0.0
        }
    }
}

impl AppState {
    pub fn new(config: AppConfig, analyzer: Analyzer, publisher: Publisher) -> Self {
        let workers = Arc::new(Semaphore::new(config.performance.max_concurrent_sessions));
        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            analyzer: Arc::new(analyzer),
            publisher: Arc::new(publisher),
            workers,
            start_time: Instant::now(),
        }
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    /// Copy of the current counters; the lock is released before returning.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Count a chunk the transport had to discard.
    pub fn record_dropped_chunk(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.chunks_dropped += 1;
    }

    /// Workers not currently running a session.
    pub fn idle_workers(&self) -> usize {
        self.workers.available_permits()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
