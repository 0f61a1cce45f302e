// Per-connection posture streaming session
//
// Ingestion and inference run concurrently and meet only at the FrameSlot:
// ingestion always stores the newest frame, inference always works on the
// newest frame it can get and never has more than one request outstanding.
// All outgoing messages go through one channel to a single sink writer.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use hyper::upgrade::Upgraded;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::{Message as WsMessage, Role};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::WebSocketStream;

use textneck_types::{ClientCommand, WorkerReply};

use super::auth::Identity;
use super::config::SessionConfig;
use super::database::SharedDatabase;
use super::frame_slot::FrameSlot;
use super::posture::{measure, Measurement, MeasurementRecord, Posture, PostureTracker};
use super::worker::SharedWorkerPool;

// Import logging macros
use crate::{sys_debug, sys_error, sys_info, sys_warn};

pub static ACTIVE_WS_CONNECTIONS: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Inference running and measurements recorded.
    Streaming,
    /// Inference running, nothing recorded.
    Paused,
    Closed,
}

/// Everything a session needs from the server.
#[derive(Clone)]
pub struct SessionContext {
    pub pool: SharedWorkerPool,
    pub db: Option<SharedDatabase>,
    pub identity: Identity,
    pub config: SessionConfig,
}

struct Recorder {
    tracker: PostureTracker,
    buffer: Vec<MeasurementRecord>,
}

pub struct Session {
    ctx: SessionContext,
    slot: FrameSlot,
    state: Mutex<SessionState>,
    expect_gray: AtomicBool,
    in_flight: AtomicBool,
    recorder: Mutex<Recorder>,
    outbox: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
}

enum Flow {
    Continue,
    Stop,
}

// WebSocket handler for the posture stream
pub async fn handle_posture_websocket(upgraded: Upgraded, ctx: SessionContext) {
    let ws_stream = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
    run_session(ws_stream, ctx).await;
}

/// Drive one session over an established WebSocket until it closes.
pub async fn run_session<S>(ws_stream: WebSocketStream<S>, ctx: SessionContext)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (ws_sender, ws_receiver) = ws_stream.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<WsMessage>();
    let writer = tokio::spawn(sink_writer(ws_sender, out_rx));

    let identity = ctx.identity;
    let session = Arc::new(Session::new(ctx, out_tx));

    let conn_count = ACTIVE_WS_CONNECTIONS.fetch_add(1, Ordering::SeqCst) + 1;
    sys_info!("[WS_POSTURE] Session opened ({identity:?}, {conn_count} active)");

    let inference = {
        let session = session.clone();
        tokio::spawn(async move { session.inference_loop().await })
    };

    session.ingestion_loop(ws_receiver).await;

    session.close();
    if let Err(e) = inference.await {
        sys_error!("[WS_POSTURE] Inference task failed: {e}");
    }
    session.flush_remaining().await;
    session.close_outbox();
    let _ = writer.await;

    let conn_count = ACTIVE_WS_CONNECTIONS.fetch_sub(1, Ordering::SeqCst) - 1;
    sys_info!("[WS_POSTURE] Session closed ({conn_count} active)");
}

/// Sole writer of the socket. Closes it once every sender is gone.
async fn sink_writer<Si>(mut ws_sender: Si, mut rx: mpsc::UnboundedReceiver<WsMessage>)
where
    Si: Sink<WsMessage> + Unpin,
{
    while let Some(msg) = rx.recv().await {
        if ws_sender.send(msg).await.is_err() {
            sys_debug!("[WS_POSTURE] Client gone, dropping outgoing messages");
            return;
        }
    }
    let _ = ws_sender.close().await;
}

impl Session {
    pub fn new(ctx: SessionContext, outbox: mpsc::UnboundedSender<WsMessage>) -> Self {
        Self {
            ctx,
            slot: FrameSlot::new(),
            state: Mutex::new(SessionState::Streaming),
            expect_gray: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            recorder: Mutex::new(Recorder {
                tracker: PostureTracker::new(Default::default()),
                buffer: Vec::new(),
            }),
            outbox: Mutex::new(Some(outbox)),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_recorder(&self) -> MutexGuard<'_, Recorder> {
        self.recorder.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enter `Closed` and stop the inference activity. Returns `false` if the
    /// session was already closed.
    pub fn close(&self) -> bool {
        {
            let mut state = self.lock_state();
            if *state == SessionState::Closed {
                return false;
            }
            *state = SessionState::Closed;
        }
        self.slot.close();
        true
    }

    fn send(&self, msg: WsMessage) {
        let outbox = self.outbox.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = outbox.as_ref() {
            let _ = tx.send(msg);
        }
    }

    fn send_json(&self, value: &Value) {
        self.send(WsMessage::Text(value.to_string()));
    }

    fn close_outbox(&self) {
        self.outbox.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    async fn ingestion_loop<St>(&self, mut ws_receiver: St)
    where
        St: Stream<Item = Result<WsMessage, WsError>> + Unpin,
    {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(WsMessage::Binary(frame)) => {
                    if self.slot.push(frame) {
                        sys_debug!("[WS_POSTURE] Dropped stale frame");
                    }
                }
                Ok(WsMessage::Text(text)) => {
                    if let Flow::Stop = self.handle_text(&text) {
                        break;
                    }
                }
                Ok(WsMessage::Close(_)) => {
                    sys_debug!("[WS_POSTURE] Received Close message");
                    break;
                }
                Ok(_) => {
                    // Ping/pong frames are answered by tungstenite
                }
                Err(e) => {
                    sys_debug!("[WS_POSTURE] Read error: {e}");
                    break;
                }
            }
        }
    }

    fn handle_text(&self, text: &str) -> Flow {
        let command = match ClientCommand::parse(text) {
            Ok(command) => command,
            Err(e) => {
                sys_debug!("[WS_POSTURE] Ignoring control message: {e}");
                return Flow::Continue;
            }
        };

        match command {
            ClientCommand::Ping => self.send_json(&json!({"type": "pong"})),
            ClientCommand::Config { gray } => {
                self.expect_gray.store(gray, Ordering::SeqCst);
                sys_debug!("[WS_POSTURE] Gray frames: {gray}");
            }
            ClientCommand::Init(thresholds) => {
                self.lock_recorder().tracker = PostureTracker::new(thresholds);
                self.set_state(SessionState::Paused);
                self.send_json(&json!({"status": "initialized", "thresholds": thresholds}));
            }
            ClientCommand::Pause => {
                let status = if self.set_state(SessionState::Paused) {
                    "paused"
                } else {
                    "already_paused"
                };
                self.send_json(&json!({ "status": status }));
            }
            ClientCommand::Resume => {
                let status = if self.set_state(SessionState::Streaming) {
                    self.lock_recorder().tracker.reset();
                    "resumed"
                } else {
                    "already_running"
                };
                self.send_json(&json!({ "status": status }));
            }
            ClientCommand::Stop => {
                self.send_json(&json!({"status": "stopping"}));
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Move between `Streaming` and `Paused`. Returns whether the state
    /// changed.
    fn set_state(&self, next: SessionState) -> bool {
        let mut state = self.lock_state();
        if *state == next || *state == SessionState::Closed {
            return false;
        }
        *state = next;
        true
    }

    async fn inference_loop(&self) {
        while let Some(frame) = self.slot.take().await {
            if self.in_flight.swap(true, Ordering::SeqCst) {
                continue;
            }

            let worker = self.ctx.pool.pick();
            let gray = self.expect_gray.load(Ordering::SeqCst);
            let reply = worker.ask(&frame, gray, self.ctx.config.ask_timeout).await;
            if !reply.ok {
                sys_debug!(
                    "[WS_POSTURE] Worker {} failed frame: {}",
                    worker.index(),
                    reply.error.as_deref().unwrap_or("unknown")
                );
            }

            let (message, batch) = self.landmarks_message(&reply);
            self.send_json(&message);
            self.in_flight.store(false, Ordering::SeqCst);

            if let Some(batch) = batch {
                self.persist(batch).await;
            }
        }
    }

    /// Build the client message for a worker reply and record the
    /// measurement. Returns a batch to persist once the buffer is full.
    fn landmarks_message(&self, reply: &WorkerReply) -> (Value, Option<Vec<MeasurementRecord>>) {
        let mut body = match serde_json::to_value(reply) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        body.insert("type".into(), json!("landmarks"));

        let measurement = if reply.ok {
            measure(reply)
        } else {
            Measurement::default()
        };
        let (posture, alert, batch) = self.record(&measurement);

        body.insert("has_angle".into(), json!(measurement.has_angle()));
        body.insert("angle_value".into(), json!(measurement.neck_angle_deg));
        body.insert("neck_angle_deg".into(), json!(measurement.neck_angle_deg));
        body.insert(
            "shoulder_y_diff_px".into(),
            json!(measurement.shoulder_y_diff_px),
        );
        body.insert(
            "shoulder_y_avg_px".into(),
            json!(measurement.shoulder_y_avg_px),
        );
        body.insert("posture".into(), json!(posture));
        body.insert("alert".into(), json!(alert));
        if alert {
            sys_debug!("[WS_POSTURE] Poor posture alert");
        }

        (Value::Object(body), batch)
    }

    fn record(&self, m: &Measurement) -> (Posture, bool, Option<Vec<MeasurementRecord>>) {
        let streaming = self.state() == SessionState::Streaming;
        let mut recorder = self.lock_recorder();
        if !streaming {
            return (recorder.tracker.classify(m), false, None);
        }

        let (posture, alert) = recorder.tracker.observe(m);
        if self.persists() {
            if let Some(record) = m.record(chrono::Utc::now()) {
                recorder.buffer.push(record);
            }
        }
        let batch = (recorder.buffer.len() >= self.ctx.config.flush_threshold)
            .then(|| std::mem::take(&mut recorder.buffer));
        (posture, alert, batch)
    }

    fn persists(&self) -> bool {
        self.ctx.db.is_some() && self.ctx.identity.user_id().is_some()
    }

    async fn flush_remaining(&self) {
        let batch = std::mem::take(&mut self.lock_recorder().buffer);
        if !batch.is_empty() {
            self.persist(batch).await;
        }
    }

    async fn persist(&self, batch: Vec<MeasurementRecord>) {
        let (Some(db), Some(user_id)) = (self.ctx.db.clone(), self.ctx.identity.user_id()) else {
            return;
        };
        let count = batch.len();
        match tokio::task::spawn_blocking(move || db.push_logs(user_id, &batch)).await {
            Ok(Ok(written)) => {
                sys_debug!("[WS_POSTURE] Stored {written}/{count} measurements for user {user_id}")
            }
            Ok(Err(e)) => sys_error!("[WS_POSTURE] Failed to store measurements: {e}"),
            Err(e) => sys_warn!("[WS_POSTURE] Store task failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::database::Database;
    use crate::web::worker::{Worker, WorkerPool, WorkerSpec};
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio::time::{timeout, Instant};

    /// Answers every request with a nose 100px above two level shoulders
    /// 200px apart, in a 400x400 frame.
    const LANDMARK_REPLY: &str = r#"s/^{"id":"\([^"]*\)".*$/{"id":"\1","ok":true,"n":7,"points":[[0.5,0.25,0.9],[0,0,0],[0,0,0],[0,0,0],[0,0,0],[0.25,0.5,0.9],[0.75,0.5,0.9]],"width":400,"height":400}/"#;

    fn landmark_spec() -> WorkerSpec {
        WorkerSpec::new("sed").args(["-u", LANDMARK_REPLY])
    }

    fn context(worker: Arc<Worker>, ask_timeout_ms: u64) -> SessionContext {
        SessionContext {
            pool: Arc::new(WorkerPool::from_workers(vec![worker])),
            db: None,
            identity: Identity::Anonymous,
            config: SessionConfig {
                ask_timeout: Duration::from_millis(ask_timeout_ms),
                flush_threshold: 30,
            },
        }
    }

    async fn connect(ctx: SessionContext) -> (WebSocketStream<DuplexStream>, JoinHandle<()>) {
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let server = tokio::spawn(async move {
            let ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
            run_session(ws, ctx).await;
        });
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (client, server)
    }

    async fn next_json(client: &mut WebSocketStream<DuplexStream>) -> Value {
        loop {
            match timeout(Duration::from_secs(5), client.next()).await.unwrap() {
                Some(Ok(WsMessage::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {other:?}"),
            }
        }
    }

    async fn send_text(client: &mut WebSocketStream<DuplexStream>, text: &str) {
        client.send(WsMessage::Text(text.to_string())).await.unwrap();
    }

    async fn send_frame(client: &mut WebSocketStream<DuplexStream>, frame: &[u8]) {
        client.send(WsMessage::Binary(frame.to_vec())).await.unwrap();
    }

    async fn finish(mut client: WebSocketStream<DuplexStream>, server: JoinHandle<()>) {
        let _ = client.close(None).await;
        timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_init_then_frame_yields_landmarks() {
        let worker = Arc::new(Worker::spawn(0, landmark_spec()).unwrap());
        let (mut client, server) = connect(context(worker, 2000)).await;

        send_text(&mut client, "init:30:10:5").await;
        let ack = next_json(&mut client).await;
        assert_eq!(ack["status"], "initialized");
        assert_eq!(ack["thresholds"]["angle_deg"], 30.0);
        assert_eq!(ack["thresholds"]["alert_frames"], 5);

        send_frame(&mut client, b"\xff\xd8 frame bytes").await;
        let msg = next_json(&mut client).await;
        assert_eq!(msg["type"], "landmarks");
        assert_eq!(msg["ok"], true);
        assert_eq!(msg["n"], 7);
        assert_eq!(msg["has_angle"], true);
        let angle = msg["neck_angle_deg"].as_f64().unwrap();
        assert!((angle - 90.0).abs() < 1e-3, "{angle}");
        assert_eq!(msg["shoulder_y_diff_px"], 0.0);
        assert_eq!(msg["posture"], "poor");
        // Paused after init: classified but no alert streak.
        assert_eq!(msg["alert"], false);

        finish(client, server).await;
    }

    #[tokio::test]
    async fn test_control_commands() {
        let worker = Arc::new(Worker::spawn(0, landmark_spec()).unwrap());
        let (mut client, server) = connect(context(worker, 2000)).await;

        for (command, expected) in [
            ("pause", "paused"),
            ("PAUSE", "already_paused"),
            ("resume", "resumed"),
            ("resume", "already_running"),
        ] {
            send_text(&mut client, command).await;
            assert_eq!(next_json(&mut client).await["status"], expected, "{command}");
        }

        send_text(&mut client, "not a command").await;
        send_text(&mut client, r#"{"type":"init","angle":10}"#).await;
        send_text(&mut client, r#"{"type":"config","gray":true}"#).await;
        send_text(&mut client, r#"{"type":"ping"}"#).await;
        assert_eq!(next_json(&mut client).await, json!({"type": "pong"}));

        send_text(&mut client, "stop").await;
        assert_eq!(next_json(&mut client).await["status"], "stopping");

        let ended = timeout(Duration::from_secs(5), async {
            loop {
                match client.next().await {
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(ended.is_ok());
        timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_alert_after_poor_streak() {
        let worker = Arc::new(Worker::spawn(0, landmark_spec()).unwrap());
        let (mut client, server) = connect(context(worker, 2000)).await;

        send_text(&mut client, "init:30:10:2").await;
        next_json(&mut client).await;
        send_text(&mut client, "resume").await;
        assert_eq!(next_json(&mut client).await["status"], "resumed");

        send_frame(&mut client, b"one").await;
        assert_eq!(next_json(&mut client).await["alert"], false);
        send_frame(&mut client, b"two").await;
        assert_eq!(next_json(&mut client).await["alert"], true);

        finish(client, server).await;
    }

    #[tokio::test]
    async fn test_timeout_does_not_block_next_frame() {
        // Swallows the first request, answers the rest.
        let script = format!("read -r first; exec sed -u '{LANDMARK_REPLY}'");
        let worker = Arc::new(Worker::spawn(0, WorkerSpec::new("sh").args(["-c", &script])).unwrap());
        let (mut client, server) = connect(context(worker, 150)).await;

        send_frame(&mut client, b"first").await;
        let first = next_json(&mut client).await;
        assert_eq!(first["ok"], false);
        assert_eq!(first["error"], "timeout");
        assert_eq!(first["has_angle"], false);
        assert_eq!(first["posture"], "unknown");

        send_frame(&mut client, b"second").await;
        let second = next_json(&mut client).await;
        assert_eq!(second["ok"], true, "{second}");

        finish(client, server).await;
    }

    #[tokio::test]
    async fn test_stop_with_hung_worker_closes_session() {
        let hung = WorkerSpec::new("sh").args(["-c", "exec sleep 30"]);
        let worker = Arc::new(Worker::spawn(0, hung).unwrap());
        let (mut client, server) = connect(context(worker, 200)).await;

        // Large enough to fill the worker's stdin pipe.
        send_frame(&mut client, &vec![1u8; 200_000]).await;
        let first = next_json(&mut client).await;
        assert_eq!(first["error"], "timeout");

        send_frame(&mut client, b"next").await;
        send_text(&mut client, "stop").await;
        let start = Instant::now();
        timeout(Duration::from_secs(3), server).await.unwrap().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_one_request_in_flight_per_session() {
        let slow = WorkerSpec::new("sh").args([
            "-c",
            r#"while IFS= read -r line; do sleep 0.2; printf '%s\n' "$line" | sed 's/^{"id":"\([^"]*\)".*$/{"id":"\1","ok":true}/'; done"#,
        ]);
        let worker = Arc::new(Worker::spawn(0, slow).unwrap());
        let (mut client, server) = connect(context(worker.clone(), 2000)).await;

        let sampler = {
            let worker = worker.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                let mut max_pending = 0;
                while start.elapsed() < Duration::from_millis(900) {
                    max_pending = max_pending.max(worker.pending_count());
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                max_pending
            })
        };

        for i in 0..6u8 {
            send_frame(&mut client, &[i]).await;
        }

        let mut replies = 0;
        while let Ok(Some(Ok(msg))) = timeout(Duration::from_millis(700), client.next()).await {
            if let WsMessage::Text(_) = msg {
                replies += 1;
            }
        }

        assert_eq!(sampler.await.unwrap(), 1);
        // Stale frames were dropped rather than queued.
        assert!((1..=2).contains(&replies), "{replies}");

        finish(client, server).await;
    }

    #[tokio::test]
    async fn test_measurements_flushed_at_threshold_and_close() {
        let worker = Arc::new(Worker::spawn(0, landmark_spec()).unwrap());
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ctx = SessionContext {
            db: Some(db.clone()),
            identity: Identity::User(11),
            config: SessionConfig {
                ask_timeout: Duration::from_secs(2),
                flush_threshold: 2,
            },
            ..context(worker, 2000)
        };
        let (mut client, server) = connect(ctx).await;

        for frame in [&b"a"[..], b"b"] {
            send_frame(&mut client, frame).await;
            assert_eq!(next_json(&mut client).await["ok"], true);
        }

        let start = Instant::now();
        while db.recent_logs(11, 10).unwrap().len() < 2 && start.elapsed() < Duration::from_secs(3) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(db.recent_logs(11, 10).unwrap().len(), 2);

        send_frame(&mut client, b"c").await;
        next_json(&mut client).await;
        finish(client, server).await;

        let rows = db.recent_logs(11, 10).unwrap();
        assert_eq!(rows.len(), 3);
        assert!((rows[0].angle - 90.0).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_worker_exit_reported_to_client() {
        let worker = Arc::new(Worker::spawn(0, WorkerSpec::new("sh").args(["-c", "exit 0"])).unwrap());
        let (mut client, server) = connect(context(worker, 1000)).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        send_frame(&mut client, b"frame").await;
        let msg = next_json(&mut client).await;
        assert_eq!(msg["type"], "landmarks");
        assert_eq!(msg["ok"], false);

        // Session survives the failure.
        send_text(&mut client, "pause").await;
        assert_eq!(next_json(&mut client).await["status"], "paused");

        finish(client, server).await;
    }
}
