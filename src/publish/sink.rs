//! # Durable Sink
//!
//! The downstream queue that persists published events across its own restarts.
//!
//! ## Key Components:
//! - **DurableSink**: The client contract the publisher talks to
//! - **MessageProperties / DeliveryMode**: Per-message delivery options
//! - **JournalSink**: File-backed durable queue, one append-only journal per queue
//!
//! ## Thread Safety:
//! Implementations must be `Send + Sync`; the publisher shares one sink between all
//! session workers and relies on the sink's own locking, adding none of its own.

use crate::error::SinkError;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::info;

/// Whether the sink must keep a message across its own restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Kept in memory / OS buffers only
    Transient,
    /// Written to stable storage before the publish call returns
    Persistent,
}

/// Options attached to every published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    pub delivery_mode: DeliveryMode,
    pub content_type: &'static str,
}

impl MessageProperties {
    pub fn json(delivery_mode: DeliveryMode) -> Self {
        Self {
            delivery_mode,
            content_type: "application/json",
        }
    }
}

/// Client side of a durable message queue.
///
/// Publishing is fire-and-forget: `Ok(())` means the sink accepted the message,
/// and no further acknowledgment is awaited.
pub trait DurableSink: Send + Sync {
    fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), SinkError>;
}

/// Append-only journal files acting as durable queues.
///
/// ## Layout:
/// Queue `name` lives in `<dir>/<name>.jsonl`, one message per line. Consumers
/// tail the file; the journal survives process restarts.
///
/// ## Thread Safety:
/// - **RwLock** around the queue table: declarations are rare, lookups constant
/// - **Mutex** per queue: concurrent publishers never interleave partial lines
pub struct JournalSink {
    dir: PathBuf,
    queues: RwLock<HashMap<String, Mutex<File>>>,
}

impl JournalSink {
    /// Open (creating if needed) the journal directory.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, SinkError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            queues: RwLock::new(HashMap::new()),
        })
    }

    /// Declare a durable queue. Declaring an existing queue is a no-op.
    pub fn declare_queue(&self, name: &str) -> Result<(), SinkError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(SinkError::Rejected(format!("invalid queue name '{}'", name)));
        }

        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        if queues.contains_key(name) {
            return Ok(());
        }

        let path = self.queue_path(name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        queues.insert(name.to_string(), Mutex::new(file));

        info!(queue = %name, path = %path.display(), "Durable queue declared");
        Ok(())
    }

    /// Journal file backing `queue`.
    pub fn queue_path(&self, queue: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", queue))
    }
}

impl DurableSink for JournalSink {
    fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), SinkError> {
        if payload.contains(&b'\n') {
            return Err(SinkError::Rejected("payload contains a line break".to_string()));
        }

        let queues = self.queues.read().unwrap_or_else(|e| e.into_inner());
        let file = queues
            .get(queue)
            .ok_or_else(|| SinkError::Rejected(format!("queue '{}' is not declared", queue)))?;

        let mut file = file.lock().unwrap_or_else(|e| e.into_inner());

        // Consumers tail the path; appending to an unlinked journal would lose the message
        let path = self.queue_path(queue);
        if !path.exists() {
            return Err(SinkError::Unavailable(format!(
                "journal {} is no longer present",
                path.display()
            )));
        }

        let mut line = Vec::with_capacity(payload.len() + 1);
        line.extend_from_slice(payload);
        line.push(b'\n');
        file.write_all(&line)?;

        if properties.delivery_mode == DeliveryMode::Persistent {
            file.sync_data()?;
        }

        Ok(())
    }
}

/// Test doubles shared by the publisher and session tests.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// Records accepted messages; can be scripted to be unavailable per call.
    #[derive(Default)]
    pub struct RecordingSink {
        pub delivered: Mutex<Vec<(String, Vec<u8>, MessageProperties)>>,
        failures: Mutex<VecDeque<bool>>,
    }

    impl RecordingSink {
        /// `script[n]` true means the n-th publish call fails; calls past the end succeed.
        pub fn scripted(script: &[bool]) -> Self {
            Self {
                delivered: Mutex::new(Vec::new()),
                failures: Mutex::new(script.iter().copied().collect()),
            }
        }

        pub fn payloads(&self) -> Vec<Vec<u8>> {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .map(|(_, payload, _)| payload.clone())
                .collect()
        }
    }

    impl DurableSink for RecordingSink {
        fn publish(
            &self,
            queue: &str,
            payload: &[u8],
            properties: &MessageProperties,
        ) -> Result<(), SinkError> {
            if self.failures.lock().unwrap().pop_front().unwrap_or(false) {
                return Err(SinkError::Unavailable("connection refused".to_string()));
            }
            self.delivered
                .lock()
                .unwrap()
                .push((queue.to_string(), payload.to_vec(), properties.clone()));
            Ok(())
        }
    }
}
