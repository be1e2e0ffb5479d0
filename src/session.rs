//! # Streaming Session Controller
//!
//! Drives one long-lived analysis session: one inbound connection carrying an
//! ordered sequence of chunks, possibly from several sensors.
//!
//! ## Session Lifecycle:
//! 1. **Open**: Created when the connection is accepted; no resources beyond the
//!    shared sink are acquired
//! 2. **Per-chunk loop**: analyze → publish → log, strictly in arrival order
//! 3. **Closed**: End of stream or cancellation; an acknowledgment is returned
//!
//! ## Never fail the session:
//! A malformed chunk or a failed publish is logged and counted, then the loop
//! continues with the next chunk. The caller always receives a `SessionAck`;
//! partial failure is only visible through logs and metrics.
//!
//! ## Scheduling:
//! Each session runs synchronously on its own blocking worker, admitted through a
//! bounded semaphore. The only blocking points are waiting for the next chunk and
//! the sink publish call.

use crate::analysis::orchestrator::{Analyzer, SampleBuffer};
use crate::error::AnalysisError;
use crate::publish::publisher::{PublishOutcome, Publisher};
use crate::state::{AppMetrics, SharedMetrics};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &str {
        match self {
            SessionState::Open => "open",
            SessionState::Closed => "closed",
        }
    }
}

/// Empty acknowledgment returned when a session closes.
///
/// Carries no success/failure information; the id and close time are only
/// for correlating with logs. On the wire this is the `ack` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionAck {
    pub session_id: Uuid,
    pub closed_at: DateTime<Utc>,
}

impl SessionAck {
    fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            closed_at: Utc::now(),
        }
    }
}

/// Per-session counters, logged when the session closes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub chunks_received: u64,
    pub chunks_analyzed: u64,
    pub chunks_skipped: u64,
    pub events_delivered: u64,
    pub events_failed: u64,
}

/// What happened to one chunk.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// Analysis failed; no event was produced
    Skipped(AnalysisError),
    /// An event was produced and a publish was attempted
    Published {
        coefficient: f64,
        lag: i64,
        outcome: PublishOutcome,
    },
}

/// Cancellation signal shared between the transport and the session worker.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Blocking iterator over chunks arriving on a session channel.
///
/// Ends when every sender is dropped (end of stream) or the flag is cancelled.
/// A chunk received after cancellation is abandoned rather than analyzed.
pub struct ChannelChunks {
    receiver: mpsc::Receiver<SampleBuffer>,
    cancel: CancelFlag,
}

impl ChannelChunks {
    pub fn new(receiver: mpsc::Receiver<SampleBuffer>, cancel: CancelFlag) -> Self {
        Self { receiver, cancel }
    }
}

impl Iterator for ChannelChunks {
    type Item = SampleBuffer;

    fn next(&mut self) -> Option<SampleBuffer> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let chunk = self.receiver.blocking_recv()?;
        if self.cancel.is_cancelled() {
            debug!(sensor_id = %chunk.sensor_id, "Chunk abandoned after cancellation");
            return None;
        }
        Some(chunk)
    }
}

/// Runs the per-chunk loop of one session.
pub struct SessionController {
    session_id: Uuid,
    analyzer: Arc<Analyzer>,
    publisher: Arc<Publisher>,
    metrics: SharedMetrics,
    state: SessionState,
    stats: SessionStats,
}

impl SessionController {
    pub fn new(analyzer: Arc<Analyzer>, publisher: Arc<Publisher>, metrics: SharedMetrics) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            analyzer,
            publisher,
            metrics,
            state: SessionState::Open,
            stats: SessionStats::default(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Consume chunks in arrival order until the sequence ends, then close.
    ///
    /// Always returns an acknowledgment, whatever happened to individual chunks.
    /// A controller runs once; calling `run` again after close consumes nothing
    /// and returns a fresh acknowledgment without touching the metrics.
    pub fn run<I>(&mut self, chunks: I) -> SessionAck
    where
        I: IntoIterator<Item = SampleBuffer>,
    {
        let span = info_span!("session", session_id = %self.session_id);
        let _enter = span.enter();

        if self.state == SessionState::Closed {
            warn!("Session already closed, ignoring chunks");
            return SessionAck::new(self.session_id);
        }

        info!("Session opened");
        self.update_metrics(|m| m.active_sessions += 1);

        for chunk in chunks {
            self.process_chunk(chunk);
        }

        self.close()
    }

    /// Analyze and publish one chunk, catching every failure at this boundary.
    pub fn process_chunk(&mut self, buffer: SampleBuffer) -> ChunkOutcome {
        let sensor_id = buffer.sensor_id.clone();
        self.stats.chunks_received += 1;
        self.update_metrics(|m| m.chunks_received += 1);

        let outcome = match self.analyzer.analyze(buffer) {
            Ok(event) => ChunkOutcome::Published {
                coefficient: event.coefficient,
                lag: event.lag,
                outcome: self.publisher.publish(event),
            },
            Err(err) => ChunkOutcome::Skipped(err),
        };

        self.record(&sensor_id, &outcome);
        outcome
    }

    /// Log one chunk outcome and fold it into the counters.
    fn record(&mut self, sensor_id: &str, outcome: &ChunkOutcome) {
        match outcome {
            ChunkOutcome::Skipped(err) => {
                match err {
                    AnalysisError::RateMismatch { .. } => {
                        error!(sensor_id = %sensor_id, kind = err.kind(), reason = %err, "Chunk skipped: pipeline misconfiguration");
                    }
                    _ => {
                        warn!(sensor_id = %sensor_id, kind = err.kind(), reason = %err, "Chunk skipped");
                    }
                }
                self.stats.chunks_skipped += 1;
                self.update_metrics(|m| m.chunks_skipped += 1);
            }
            ChunkOutcome::Published { coefficient, lag, outcome } => {
                self.stats.chunks_analyzed += 1;
                self.update_metrics(|m| m.chunks_analyzed += 1);

                match outcome {
                    PublishOutcome::Delivered => {
                        debug!(sensor_id = %sensor_id, coefficient, lag, queue = %self.publisher.queue(), "Event delivered");
                        self.stats.events_delivered += 1;
                        self.update_metrics(|m| m.events_delivered += 1);
                    }
                    PublishOutcome::Failed(err) => {
                        warn!(sensor_id = %sensor_id, coefficient, lag, reason = %err, "Event publish failed");
                        self.stats.events_failed += 1;
                        self.update_metrics(|m| m.events_failed += 1);
                    }
                }
            }
        }
    }

    fn close(&mut self) -> SessionAck {
        if self.state == SessionState::Open {
            self.state = SessionState::Closed;
            self.update_metrics(|m| {
                m.active_sessions = m.active_sessions.saturating_sub(1);
                m.sessions_completed += 1;
            });
        }

        info!(
            received = self.stats.chunks_received,
            analyzed = self.stats.chunks_analyzed,
            skipped = self.stats.chunks_skipped,
            delivered = self.stats.events_delivered,
            failed = self.stats.events_failed,
            state = self.state.as_str(),
            "Session closed"
        );

        SessionAck::new(self.session_id)
    }

    fn update_metrics(&self, update: impl FnOnce(&mut AppMetrics)) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut metrics);
    }
}

/// Run a session on a worker from the bounded pool.
///
/// Waits for a free worker, then runs the whole session on a blocking thread.
/// The permit is held until the session closes.
pub async fn run_on_worker(
    workers: Arc<Semaphore>,
    mut controller: SessionController,
    chunks: ChannelChunks,
) -> SessionAck {
    let session_id = controller.session_id();

    let permit = match workers.acquire_owned().await {
        Ok(permit) => Some(permit),
        Err(err) => {
            warn!(session_id = %session_id, error = %err, "Worker pool closed, running session unbounded");
            None
        }
    };

    let worker = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        controller.run(chunks)
    });

    match worker.await {
        Ok(ack) => ack,
        Err(err) => {
            error!(session_id = %session_id, error = %err, "Session worker terminated abnormally");
            SessionAck::new(session_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::waveform::Waveform;
    use crate::audio::format::AudioFormat;
    use crate::audio::reference::ReferenceSignal;
    use crate::publish::event::AnalysisEvent;
    use crate::publish::sink::testing::RecordingSink;
    use crate::publish::sink::DeliveryMode;
    use std::sync::RwLock;

    fn reference_samples() -> Vec<i16> {
        (0..400)
            .map(|i| (((i * 37) % 101) as i16 - 50) * 300)
            .collect()
    }

    fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn controller_with(sink: Arc<RecordingSink>) -> (SessionController, SharedMetrics) {
        let format = AudioFormat::PIPELINE;
        let reference = ReferenceSignal::from_waveform(Waveform::from_pcm(&reference_samples(), &format), 16000);
        let analyzer = Arc::new(Analyzer::new(format, Arc::new(reference)));
        let publisher = Arc::new(Publisher::new(sink, "analysis_queue", DeliveryMode::Persistent));
        let metrics: SharedMetrics = Arc::new(RwLock::new(AppMetrics::default()));
        (SessionController::new(analyzer, publisher, metrics.clone()), metrics)
    }

    #[test]
    fn test_bad_chunks_do_not_abort_session() {
        // Publish calls: chunk 1 succeeds, chunk 3 hits an unavailable sink
        let sink = Arc::new(RecordingSink::scripted(&[false, true]));
        let (mut controller, metrics) = controller_with(sink.clone());

        let chunks = vec![
            SampleBuffer::new("s1", pcm_bytes(&reference_samples())),
            SampleBuffer::new("s1", vec![0x01, 0x02, 0x03]),
            SampleBuffer::new("s1", pcm_bytes(&reference_samples()[..200])),
        ];

        let ack = controller.run(chunks);

        assert_eq!(ack.session_id, controller.session_id());
        assert_eq!(controller.state(), SessionState::Closed);
        assert_eq!(
            controller.stats(),
            &SessionStats {
                chunks_received: 3,
                chunks_analyzed: 2,
                chunks_skipped: 1,
                events_delivered: 1,
                events_failed: 1,
            }
        );

        // Only chunk 1 reached the sink
        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 1);
        let event: AnalysisEvent = serde_json::from_slice(&payloads[0]).unwrap();
        assert_eq!(event.sensor_id, "s1");
        assert_eq!(event.lag, 0);
        assert!((event.coefficient - 1.0).abs() < 1e-6);

        let metrics = metrics.read().unwrap();
        assert_eq!(metrics.sessions_completed, 1);
        assert_eq!(metrics.active_sessions, 0);
        assert_eq!(metrics.chunks_skipped, 1);
        assert_eq!(metrics.events_failed, 1);
    }

    #[test]
    fn test_process_chunk_outcomes() {
        let sink = Arc::new(RecordingSink::scripted(&[true]));
        let (mut controller, _) = controller_with(sink);

        let skipped = controller.process_chunk(SampleBuffer::new("s2", Vec::new()));
        assert!(matches!(skipped, ChunkOutcome::Skipped(AnalysisError::Decode(_))));

        let failed = controller.process_chunk(SampleBuffer::new("s2", pcm_bytes(&reference_samples())));
        assert!(matches!(
            failed,
            ChunkOutcome::Published { outcome: PublishOutcome::Failed(_), lag: 0, .. }
        ));

        let delivered = controller.process_chunk(SampleBuffer::new("s3", pcm_bytes(&reference_samples())));
        match delivered {
            ChunkOutcome::Published { coefficient, outcome, .. } => {
                assert!(outcome.is_delivered());
                assert!((coefficient - 1.0).abs() < 1e-6);
            }
            other => panic!("expected a published chunk, got {:?}", other),
        }
        assert_eq!(controller.stats().chunks_skipped, 1);
        assert_eq!(controller.stats().events_failed, 1);
        assert_eq!(controller.stats().events_delivered, 1);
    }

    #[test]
    fn test_run_after_close_leaves_metrics_balanced() {
        let sink = Arc::new(RecordingSink::default());
        let (mut controller, metrics) = controller_with(sink.clone());

        let first = controller.run(vec![SampleBuffer::new("s1", pcm_bytes(&reference_samples()))]);
        let second = controller.run(vec![SampleBuffer::new("s1", pcm_bytes(&reference_samples()))]);

        assert_eq!(first.session_id, second.session_id);
        assert_eq!(controller.stats().chunks_received, 1);
        assert_eq!(sink.payloads().len(), 1);

        let metrics = metrics.read().unwrap();
        assert_eq!(metrics.active_sessions, 0);
        assert_eq!(metrics.sessions_completed, 1);
        assert_eq!(metrics.chunks_received, 1);
    }

    #[test]
    fn test_chunks_published_in_arrival_order() {
        let sink = Arc::new(RecordingSink::default());
        let (mut controller, _) = controller_with(sink.clone());

        let chunks = ["a", "b", "c", "d"]
            .iter()
            .map(|id| SampleBuffer::new(*id, pcm_bytes(&reference_samples())));
        controller.run(chunks);

        let order: Vec<String> = sink
            .payloads()
            .iter()
            .map(|p| serde_json::from_slice::<AnalysisEvent>(p).unwrap().sensor_id)
            .collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_channel_chunks_end_of_stream_and_cancel() {
        let (sender, receiver) = mpsc::channel(4);
        sender.try_send(SampleBuffer::new("s1", vec![0, 0])).unwrap();
        sender.try_send(SampleBuffer::new("s1", vec![0, 0])).unwrap();
        drop(sender);

        let chunks: Vec<_> = ChannelChunks::new(receiver, CancelFlag::default()).collect();
        assert_eq!(chunks.len(), 2);

        let (sender, receiver) = mpsc::channel(4);
        sender.try_send(SampleBuffer::new("s1", vec![0, 0])).unwrap();
        let cancel = CancelFlag::default();
        cancel.cancel();
        let mut cancelled = ChannelChunks::new(receiver, cancel);
        assert!(cancelled.next().is_none());
    }

    #[tokio::test]
    async fn test_run_on_worker_releases_permit() {
        let sink = Arc::new(RecordingSink::default());
        let (controller, metrics) = controller_with(sink.clone());
        let workers = Arc::new(Semaphore::new(1));

        let (sender, receiver) = mpsc::channel(4);
        sender
            .send(SampleBuffer::new("s1", pcm_bytes(&reference_samples())))
            .await
            .unwrap();
        drop(sender);

        let chunks = ChannelChunks::new(receiver, CancelFlag::default());
        let ack = run_on_worker(workers.clone(), controller, chunks).await;

        assert_eq!(workers.available_permits(), 1);
        assert_eq!(sink.payloads().len(), 1);
        assert_eq!(metrics.read().unwrap().sessions_completed, 1);
        assert!(ack.closed_at <= Utc::now());
    }
}
