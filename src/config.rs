//! # Configuration Management
//!
//! This module handles loading application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (APP_SERVER__PORT, APP_SINK__QUEUE_NAME, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Nested keys are separated by a double underscore so that field names which
//! themselves contain underscores (`max_concurrent_sessions`) stay intact.
//!
//! ## Not configurable:
//! The audio format (16 kHz, mono, 16-bit) is a pipeline constant, see
//! `audio::format::AudioFormat::PIPELINE`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Default frame limit: 4 MiB, room for two minutes of pipeline audio per chunk.
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 4 * 1024 * 1024;

/// Smallest accepted frame limit, the WebSocket library's own default.
const MIN_CHUNK_BYTES: usize = 64 * 1024;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub pipeline: PipelineConfig,
    pub sink: SinkConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Analysis pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// WAV file every chunk is correlated against, loaded once at startup
    pub reference_path: String,
}

/// Durable sink settings.
///
/// ## Fields:
/// - `journal_dir`: Directory holding the queue journals
/// - `queue_name`: Destination queue, declared durable before the first publish
/// - `persistent`: Ask the sink to keep messages across its own restarts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    pub journal_dir: String,
    pub queue_name: String,
    pub persistent: bool,
}

/// Performance tuning configuration.
///
/// ## Fields:
/// - `max_concurrent_sessions`: Size of the bounded worker pool; each sensor
///   connection occupies one worker for its whole lifetime
/// - `session_buffer_chunks`: Chunks queued per session before new ones are dropped
/// - `max_chunk_bytes`: Largest WebSocket frame a sensor may send; a 10 s chunk
///   of 16 kHz 16-bit PCM is 320 000 bytes
///
/// ## Tuning guidelines:
/// - More workers: more sensors in parallel, more CPU spent correlating
/// - Deeper buffers: fewer dropped chunks during bursts, more memory per session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub session_buffer_chunks: usize,
    pub max_chunk_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            pipeline: PipelineConfig {
                reference_path: "ref.wav".to_string(),
            },
            sink: SinkConfig {
                journal_dir: "queue".to_string(),
                queue_name: "analysis_queue".to_string(),
                persistent: true,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
                session_buffer_chunks: 10,
                max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_PIPELINE__REFERENCE_PATH=/assets/ref.wav`: Override the reference file
    /// - `APP_PERFORMANCE__MAX_CONCURRENT_SESSIONS=32`: Override the worker pool size
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - The worker pool and the per-session buffer are not empty
    /// - The frame limit is at least 64 KiB
    /// - Queue name and reference path are present
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.session_buffer_chunks == 0 {
            return Err(anyhow::anyhow!("Session buffer must hold at least one chunk"));
        }

        if self.performance.max_chunk_bytes < MIN_CHUNK_BYTES {
            return Err(anyhow::anyhow!(
                "Max chunk bytes must be at least {} (got {})",
                MIN_CHUNK_BYTES,
                self.performance.max_chunk_bytes
            ));
        }

        if self.sink.queue_name.trim().is_empty() {
            return Err(anyhow::anyhow!("Sink queue name cannot be empty"));
        }

        if self.pipeline.reference_path.trim().is_empty() {
            return Err(anyhow::anyhow!("Reference path cannot be empty"));
        }

        Ok(())
    }
}
