//! # Result Publisher
//!
//! Serializes each `AnalysisEvent` and hands it to the durable sink.
//!
//! ## Failure Isolation:
//! Any sink-level error (connection loss, rejection, timeout) is caught here and
//! reported as `PublishOutcome::Failed`. Nothing is raised that could end the
//! enclosing session, and nothing is retried; a caller that wants retries
//! composes them around `publish`.

use crate::error::PublishError;
use crate::publish::event::AnalysisEvent;
use crate::publish::sink::{DeliveryMode, DurableSink, MessageProperties};
use std::sync::Arc;

/// Result of one publish attempt.
#[derive(Debug)]
pub enum PublishOutcome {
    Delivered,
    Failed(PublishError),
}

impl PublishOutcome {
    #[cfg(test)]
    pub fn is_delivered(&self) -> bool {
        matches!(self, PublishOutcome::Delivered)
    }
}

/// Publishes events to one fixed queue.
pub struct Publisher {
    sink: Arc<dyn DurableSink>,
    queue: String,
    properties: MessageProperties,
}

impl Publisher {
    /// ## Parameters:
    /// - **sink**: Shared sink client (already connected, queue already declared)
    /// - **queue**: Destination queue name
    /// - **delivery_mode**: `Persistent` in production so messages survive a sink restart
    pub fn new(sink: Arc<dyn DurableSink>, queue: impl Into<String>, delivery_mode: DeliveryMode) -> Self {
        Self {
            sink,
            queue: queue.into(),
            properties: MessageProperties::json(delivery_mode),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Publish one event, consuming it.
    pub fn publish(&self, event: AnalysisEvent) -> PublishOutcome {
        match self.try_publish(&event) {
            Ok(()) => PublishOutcome::Delivered,
            Err(err) => PublishOutcome::Failed(err),
        }
    }

    fn try_publish(&self, event: &AnalysisEvent) -> Result<(), PublishError> {
        let payload = event.to_json_bytes()?;
        self.sink.publish(&self.queue, &payload, &self.properties)?;
        Ok(())
    }
}
