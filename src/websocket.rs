//! # WebSocket Sensor Streaming Handler
//!
//! Inbound transport for the analysis pipeline. Sensors connect to `/ws/sensors`
//! and stream audio chunks; each connection is one analysis session.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: Accepting the socket opens a session and queues it for a worker
//! 2. **Chunks**: Text or binary frames, analyzed strictly in arrival order
//! 3. **End of stream**: `{"type":"end_stream"}`; queued chunks are still analyzed
//! 4. **Acknowledgment**: The server sends one `ack` frame, then closes
//!
//! The `ack` frame reports nothing about how the chunks fared. Its `session_id`
//! and `closed_at` only let an operator find the session in the logs; success
//! and failure of individual chunks are visible in logs and metrics alone.
//!
//! ## Message Format:
//! - **Client → Server (text)**: `{"type":"chunk","sensor_id":"s1","pcm":"<base64>"}`
//! - **Client → Server (binary)**: `[id_len: u8][sensor_id: utf8][pcm: 16-bit LE]`
//! - **Server → Client**: `ack` at session end, `error` for frames that cannot be read
//!
//! Errors inside a chunk (odd byte count, empty audio) are not reported back; the
//! session logs and skips them. Only frames the transport itself cannot turn into
//! a chunk get an `error` frame.
//!
//! ## Frame limit:
//! Frames larger than `performance.max_chunk_bytes` are discarded unread and
//! answered with a `chunk_too_large` error. Like any other bad chunk they never
//! end the session; the next frame is read normally.

use crate::analysis::orchestrator::SampleBuffer;
use crate::config::AppConfig;
use crate::session::{run_on_worker, CancelFlag, ChannelChunks, SessionAck, SessionController};
use crate::state::AppState;

use actix::prelude::*;
use actix_http::ws::Codec;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often the server pings the sensor.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Silence after which the connection is considered dead.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// WebSocket message types for sensor-server communication.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SensorMessage {
    /// Audio chunk from a sensor
    Chunk {
        sensor_id: String,
        /// Base64 of raw 16-bit little-endian PCM
        pcm: String,
    },

    /// No more chunks will follow on this connection
    EndStream,

    /// Session closed; sent once by the server. Carries no outcome, the
    /// fields only correlate the connection with the session's log lines
    Ack {
        session_id: String,
        closed_at: String,
    },

    /// A frame could not be turned into a chunk
    Error {
        code: String,
        message: String,
    },
}

impl From<&SessionAck> for SensorMessage {
    fn from(ack: &SessionAck) -> Self {
        SensorMessage::Ack {
            session_id: ack.session_id.to_string(),
            closed_at: ack.closed_at.to_rfc3339(),
        }
    }
}

/// Split a binary frame into sensor id and PCM payload.
///
/// ## Frame layout:
/// - byte 0: length of the sensor id in bytes (1 to 255)
/// - next `id_len` bytes: sensor id, UTF-8
/// - remainder: PCM bytes, passed through unchecked
pub fn parse_binary_chunk(data: &[u8]) -> Result<SampleBuffer, String> {
    let (&id_len, rest) = data
        .split_first()
        .ok_or_else(|| "empty binary frame".to_string())?;
    let id_len = id_len as usize;

    if id_len == 0 {
        return Err("sensor id must not be empty".to_string());
    }
    if rest.len() < id_len {
        return Err(format!(
            "frame declares a {} byte sensor id but carries only {} bytes",
            id_len,
            rest.len()
        ));
    }

    let (id, pcm) = rest.split_at(id_len);
    let sensor_id = std::str::from_utf8(id).map_err(|e| format!("sensor id is not UTF-8: {}", e))?;

    Ok(SampleBuffer::new(sensor_id, pcm.to_vec()))
}

/// Frame codec for sensor connections, sized to the configured chunk limit.
pub fn frame_codec(config: &AppConfig) -> Codec {
    Codec::new().max_size(config.performance.max_chunk_bytes)
}

/// Sent to the actor by the worker once the session has closed.
#[derive(Message)]
#[rtype(result = "()")]
struct SessionClosed(SessionAck);

/// WebSocket actor feeding one analysis session.
///
/// ## Actor Model:
/// The actor only frames and enqueues. Analysis and publishing run on a blocking
/// worker that pulls from a bounded channel, so a slow sink never stalls the
/// socket; when the channel is full new chunks are dropped and counted.
pub struct SensorWebSocket {
    state: AppState,

    /// Session id, fixed when the session is created
    session_id: Uuid,

    /// Queue into the session worker; `None` after end of stream
    sender: Option<mpsc::Sender<SampleBuffer>>,

    /// Receiving half, handed to the worker when the actor starts
    chunks: Option<ChannelChunks>,

    /// Controller, handed to the worker when the actor starts
    controller: Option<SessionController>,

    cancel: CancelFlag,

    last_heartbeat: Instant,
}

impl SensorWebSocket {
    pub fn new(state: AppState) -> Self {
        let (sender, receiver) = mpsc::channel(state.config.performance.session_buffer_chunks);
        let cancel = CancelFlag::default();
        let controller = SessionController::new(
            state.analyzer.clone(),
            state.publisher.clone(),
            state.metrics.clone(),
        );

        Self {
            session_id: controller.session_id(),
            sender: Some(sender),
            chunks: Some(ChannelChunks::new(receiver, cancel.clone())),
            controller: Some(controller),
            cancel,
            state,
            last_heartbeat: Instant::now(),
        }
    }

    /// Hand a chunk to the session worker without waiting.
    fn enqueue(&mut self, buffer: SampleBuffer, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(sender) = &self.sender else {
            self.send_error(ctx, "stream_ended", "chunk received after end_stream");
            return;
        };

        match sender.try_send(buffer) {
            Ok(()) => {}
            Err(TrySendError::Full(buffer)) => {
                warn!(
                    session_id = %self.session_id,
                    sensor_id = %buffer.sensor_id,
                    bytes = buffer.pcm.len(),
                    "Session queue full, dropping chunk"
                );
                self.state.record_dropped_chunk();
            }
            Err(TrySendError::Closed(_)) => {
                self.send_error(ctx, "session_closed", "session is no longer accepting chunks");
            }
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::from_str::<SensorMessage>(text) {
            Ok(SensorMessage::Chunk { sensor_id, pcm }) => match STANDARD.decode(pcm.as_bytes()) {
                Ok(pcm) => self.enqueue(SampleBuffer::new(sensor_id, pcm), ctx),
                Err(err) => {
                    self.send_error(ctx, "invalid_pcm_encoding", &format!("pcm is not base64: {}", err))
                }
            },
            Ok(SensorMessage::EndStream) => {
                debug!(session_id = %self.session_id, "End of stream");
                // Dropping the sender lets the worker drain the queue and close
                self.sender = None;
            }
            Ok(_) => {
                self.send_error(ctx, "unexpected_message", "only chunk and end_stream are accepted");
            }
            Err(err) => {
                self.send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err));
            }
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        let error_msg = SensorMessage::Error {
            code: code.to_string(),
            message: message.to_string(),
        };

        if let Ok(json) = serde_json::to_string(&error_msg) {
            ctx.text(json);
        }
        warn!(session_id = %self.session_id, "WebSocket error {}: {}", code, message);
    }
}

impl Actor for SensorWebSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Queue the session for a worker and start the heartbeat.
    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "Sensor connection started");

        if let (Some(controller), Some(chunks)) = (self.controller.take(), self.chunks.take()) {
            let workers = self.state.workers.clone();
            let addr = ctx.address();
            tokio::spawn(async move {
                let ack = run_on_worker(workers, controller, chunks).await;
                addr.do_send(SessionClosed(ack));
            });
        }

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session_id = %act.session_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    /// Cancel the session; the worker finishes its current chunk and stops.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.cancel.cancel();
        self.sender = None;
        info!(session_id = %self.session_id, "Sensor connection stopped");
    }
}

impl Handler<SessionClosed> for SensorWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SessionClosed, ctx: &mut Self::Context) {
        match serde_json::to_string(&SensorMessage::from(&msg.0)) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(session_id = %self.session_id, "Failed to encode ack: {}", err),
        }
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

/// Handle incoming WebSocket messages.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SensorWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_text(&text, ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                match parse_binary_chunk(&data) {
                    Ok(buffer) => self.enqueue(buffer, ctx),
                    Err(err) => self.send_error(ctx, "invalid_frame", &err),
                }
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, "WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                self.send_error(ctx, "invalid_frame", "fragmented frames are not supported");
            }
            Ok(ws::Message::Nop) => {}
            Err(ws::ProtocolError::Overflow) => {
                let limit = self.state.config.performance.max_chunk_bytes;
                self.send_error(
                    ctx,
                    "chunk_too_large",
                    &format!("frame discarded, frames are limited to {} bytes", limit),
                );
            }
            Err(err) => {
                error!(session_id = %self.session_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }

    /// Input ended. Without a prior end of stream this is a disconnect and the
    /// session is cancelled; otherwise the worker is left to drain and ack.
    fn finished(&mut self, ctx: &mut Self::Context) {
        if self.sender.is_some() {
            ctx.stop();
        } else {
            debug!(session_id = %self.session_id, "Input closed, waiting for session to drain");
        }
    }
}

/// WebSocket endpoint handler for `/ws/sensors`.
pub async fn sensor_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New sensor connection from: {:?}", req.connection_info().peer_addr());

    let state = app_state.get_ref().clone();
    let codec = frame_codec(state.get_config());
    ws::WsResponseBuilder::new(SensorWebSocket::new(state), &req, stream)
        .codec(codec)
        .start()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::sink::testing::RecordingSink;
    use crate::state::testing::{test_state, test_state_from};
    use crate::state::AppMetrics;
    use actix_web::error::PayloadError;
    use actix_web::web::Bytes;
    use actix_web::{http::StatusCode, test as actix_test, App};
    use futures_util::StreamExt;
    use std::sync::Arc;
    use tokio::sync::Semaphore;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    const OP_TEXT: u8 = 0x1;
    const OP_BINARY: u8 = 0x2;
    const OP_CLOSE: u8 = 0x8;

    /// Masked client frame. A zero mask key leaves the payload as-is.
    fn client_frame(opcode: u8, payload: &[u8]) -> Bytes {
        let mut frame = vec![0x80 | opcode];
        match payload.len() {
            n if n < 126 => frame.push(0x80 | n as u8),
            n if n <= u16::MAX as usize => {
                frame.push(0x80 | 126);
                frame.extend_from_slice(&(n as u16).to_be_bytes());
            }
            n => {
                frame.push(0x80 | 127);
                frame.extend_from_slice(&(n as u64).to_be_bytes());
            }
        }
        frame.extend_from_slice(&[0; 4]);
        frame.extend_from_slice(payload);
        Bytes::from(frame)
    }

    fn chunk_frame(sensor_id: &str, samples: usize) -> Bytes {
        let mut payload = vec![sensor_id.len() as u8];
        payload.extend_from_slice(sensor_id.as_bytes());
        for i in 0..samples {
            let sample = (((i * 53) % 97) as i16) * 250 - 12000;
            payload.extend_from_slice(&sample.to_le_bytes());
        }
        client_frame(OP_BINARY, &payload)
    }

    fn end_stream_frame() -> Bytes {
        client_frame(OP_TEXT, br#"{"type":"end_stream"}"#)
    }

    fn close_frame() -> Bytes {
        client_frame(OP_CLOSE, &1000u16.to_be_bytes())
    }

    /// Split unmasked server output into (opcode, payload) pairs.
    fn server_frames(mut data: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut frames = Vec::new();
        while data.len() >= 2 {
            let opcode = data[0] & 0x0F;
            let (len, header) = match data[1] & 0x7F {
                126 => (u16::from_be_bytes([data[2], data[3]]) as usize, 4),
                127 => (u64::from_be_bytes(data[2..10].try_into().unwrap()) as usize, 10),
                n => (n as usize, 2),
            };
            frames.push((opcode, data[header..header + len].to_vec()));
            data = &data[header + len..];
        }
        frames
    }

    fn text_messages(frames: &[(u8, Vec<u8>)]) -> Vec<SensorMessage> {
        frames
            .iter()
            .filter(|(opcode, _)| *opcode == OP_TEXT)
            .map(|(_, payload)| serde_json::from_slice(payload).unwrap())
            .collect()
    }

    /// Feed `input` to a sensor actor and collect everything it writes until it stops.
    async fn run_connection(state: &AppState, input: Vec<Bytes>) -> Vec<(u8, Vec<u8>)> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<Bytes, PayloadError>>();
        for frame in input {
            tx.send(Ok(frame)).unwrap();
        }

        let mut output = Box::pin(ws::WebsocketContext::with_codec(
            SensorWebSocket::new(state.clone()),
            UnboundedReceiverStream::new(rx),
            frame_codec(state.get_config()),
        ));

        let mut written = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(chunk) = output.next().await {
                written.extend_from_slice(&chunk.unwrap());
            }
        })
        .await
        .expect("connection never closed");
        drop(tx);

        server_frames(&written)
    }

    async fn wait_for_metrics(state: &AppState, settled: impl Fn(&AppMetrics) -> bool) -> AppMetrics {
        for _ in 0..500 {
            let metrics = state.get_metrics_snapshot();
            if settled(&metrics) {
                return metrics;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("metrics never settled: {:?}", state.get_metrics_snapshot());
    }

    #[test]
    fn test_chunk_message_parsing() {
        let json = r#"{"type":"chunk","sensor_id":"mic-7","pcm":"AAEAAg=="}"#;
        match serde_json::from_str::<SensorMessage>(json).unwrap() {
            SensorMessage::Chunk { sensor_id, pcm } => {
                assert_eq!(sensor_id, "mic-7");
                assert_eq!(STANDARD.decode(pcm).unwrap(), vec![0, 1, 0, 2]);
            }
            other => panic!("Wrong message type: {:?}", other),
        }

        let end: SensorMessage = serde_json::from_str(r#"{"type":"end_stream"}"#).unwrap();
        assert!(matches!(end, SensorMessage::EndStream));
    }

    #[test]
    fn test_ack_message_wire_format() {
        let ack = SessionAck {
            session_id: Uuid::nil(),
            closed_at: chrono::DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&chrono::Utc),
        };

        let json = serde_json::to_string(&SensorMessage::from(&ack)).unwrap();
        assert_eq!(
            json,
            r#"{"type":"ack","session_id":"00000000-0000-0000-0000-000000000000","closed_at":"2024-01-01T00:00:00+00:00"}"#
        );
    }

    #[test]
    fn test_parse_binary_chunk() {
        let mut frame = vec![2u8];
        frame.extend_from_slice(b"s1");
        frame.extend_from_slice(&[0x10, 0x00, 0xF0, 0xFF]);

        let buffer = parse_binary_chunk(&frame).unwrap();
        assert_eq!(buffer.sensor_id, "s1");
        assert_eq!(buffer.pcm, vec![0x10, 0x00, 0xF0, 0xFF]);

        // Header only: empty PCM is left to the analyzer to reject
        let buffer = parse_binary_chunk(&[1, b'x']).unwrap();
        assert!(buffer.pcm.is_empty());
    }

    #[test]
    fn test_parse_binary_chunk_rejects_bad_frames() {
        assert!(parse_binary_chunk(&[]).is_err());
        assert!(parse_binary_chunk(&[0, 1, 2]).is_err());
        assert!(parse_binary_chunk(&[5, b'a', b'b']).is_err());
        assert!(parse_binary_chunk(&[2, 0xFF, 0xFE, 0, 0]).is_err());
    }

    #[actix_web::test]
    async fn test_websocket_handshake() {
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(test_state()))
                .route("/ws/sensors", web::get().to(sensor_websocket)),
        )
        .await;

        let req = actix_test::TestRequest::get()
            .uri("/ws/sensors")
            .insert_header(("upgrade", "websocket"))
            .insert_header(("connection", "upgrade"))
            .insert_header(("sec-websocket-version", "13"))
            .insert_header(("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);

        let req = actix_test::TestRequest::get().uri("/ws/sensors").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_end_stream_sends_one_ack_then_closes() {
        let state = test_state();
        let frames = run_connection(
            &state,
            vec![chunk_frame("s1", 256), chunk_frame("s2", 128), end_stream_frame()],
        )
        .await;

        let messages = text_messages(&frames);
        assert_eq!(messages.len(), 1, "{:?}", messages);
        assert!(matches!(messages[0], SensorMessage::Ack { .. }));
        assert_eq!(frames.last().map(|(opcode, _)| *opcode), Some(OP_CLOSE));

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.chunks_analyzed, 2);
        assert_eq!(metrics.events_delivered, 2);
        assert_eq!(metrics.sessions_completed, 1);
        assert_eq!(metrics.active_sessions, 0);
    }

    #[actix_web::test]
    async fn test_chunk_larger_than_default_frame_limit_is_analyzed() {
        let state = test_state();
        // 48000 samples: a 96 003 byte frame, above the library's 64 KiB default
        let frames = run_connection(&state, vec![chunk_frame("s1", 48000), end_stream_frame()]).await;

        let messages = text_messages(&frames);
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], SensorMessage::Ack { .. }));

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.chunks_received, 1);
        assert_eq!(metrics.chunks_analyzed, 1);
    }

    #[actix_web::test]
    async fn test_oversized_frame_is_skipped_without_ending_session() {
        let mut config = AppConfig::default();
        config.performance.max_chunk_bytes = 64 * 1024;
        let state = test_state_from(config, Arc::new(RecordingSink::default()));

        let frames = run_connection(
            &state,
            vec![
                chunk_frame("s1", 256),
                chunk_frame("s1", 48000),
                chunk_frame("s1", 256),
                end_stream_frame(),
            ],
        )
        .await;

        let messages = text_messages(&frames);
        assert_eq!(messages.len(), 2, "{:?}", messages);
        match &messages[0] {
            SensorMessage::Error { code, .. } => assert_eq!(code, "chunk_too_large"),
            other => panic!("expected an error frame, got {:?}", other),
        }
        assert!(matches!(messages[1], SensorMessage::Ack { .. }));
        assert_eq!(frames.last().map(|(opcode, _)| *opcode), Some(OP_CLOSE));

        // Chunks on both sides of the oversized frame went through
        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.chunks_analyzed, 2);
        assert_eq!(metrics.sessions_completed, 1);
    }

    #[actix_web::test]
    async fn test_full_queue_drops_and_close_cancels_session() {
        let mut config = AppConfig::default();
        config.performance.session_buffer_chunks = 1;
        let mut state = test_state_from(config, Arc::new(RecordingSink::default()));
        // No free worker: nothing leaves the queue while the socket is open
        state.workers = Arc::new(Semaphore::new(0));

        let frames = run_connection(
            &state,
            vec![
                chunk_frame("s1", 256),
                chunk_frame("s1", 256),
                chunk_frame("s1", 256),
                close_frame(),
            ],
        )
        .await;

        assert!(text_messages(&frames).is_empty());
        assert_eq!(frames.last().map(|(opcode, _)| *opcode), Some(OP_CLOSE));
        assert_eq!(state.get_metrics_snapshot().chunks_dropped, 2);

        // Once a worker frees up, the cancelled session closes without analyzing
        // the chunk still sitting in its queue
        state.workers.add_permits(1);
        let metrics = wait_for_metrics(&state, |m| m.sessions_completed == 1).await;
        assert_eq!(metrics.chunks_received, 0);
        assert_eq!(metrics.chunks_analyzed, 0);
        assert_eq!(metrics.active_sessions, 0);
    }
}
