//! Connection worker: drives one named connection's transport according to
//! the pure state machine in [`crate::state`].
//!
//! Each worker owns exactly one transport at a time.  Opening a new attempt
//! always cancels the previous one first, so for a given name at most one
//! transport is connecting or open at any instant.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cm_protocol::{decode, ClientFrame, ServerFrame};

use crate::log::{dedup_key, MessageLog};
use crate::scheduler::{ReconnectPolicy, ReconnectScheduler};
use crate::state::{transition, Effect, ReconnectReason, WorkerEvent, WorkerState, ABNORMAL_CLOSURE};
use crate::types::{ClientError, ConnectionStatus, Endpoint, Message, MessageKind};

/// What the writer task accepts from the rest of the worker.
enum Outbound {
    Frame(ClientFrame),
    /// Send a close frame with the normal code, then stop writing.
    Close,
}

/// One named connection.  Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub(crate) struct Worker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    name: String,
    endpoint: Endpoint,
    room: String,
    log: Arc<MessageLog>,
    scheduler: ReconnectScheduler,
    policy: ReconnectPolicy,
    state: Mutex<WorkerState>,
    status: Mutex<ConnectionStatus>,
    retry_count: AtomicU32,
    /// Writer channel of the currently open transport, if any.
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    /// Cancellation token of the current connection attempt.  Replaced on
    /// every new attempt; cancelling it releases the old transport.
    attempt: Mutex<CancellationToken>,
}

impl Worker {
    pub(crate) fn new(
        name: String,
        endpoint: Endpoint,
        room: String,
        log: Arc<MessageLog>,
        scheduler: ReconnectScheduler,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                name,
                endpoint,
                room,
                log,
                scheduler,
                policy,
                state: Mutex::new(WorkerState::Idle),
                status: Mutex::new(ConnectionStatus::Idle),
                retry_count: AtomicU32::new(0),
                outbound: Mutex::new(None),
                attempt: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        *self.inner.status.lock()
    }

    /// Start (or restart) the connection.  Also the manual-reconnect entry
    /// point: restarting bypasses any pending backoff delay.
    pub(crate) fn connect(&self) {
        let effects = self.apply(WorkerEvent::Start);
        self.execute(effects, None);
    }

    /// Queue a chat frame if the connection is open.  Never suspends and
    /// never queues past the immediate state check.
    pub(crate) fn send(&self, text: &str) -> Result<(), ClientError> {
        let status = self.status();
        if status != ConnectionStatus::Open {
            return Err(ClientError::NotOpen {
                name: self.inner.name.clone(),
                status,
            });
        }
        let tx = self.inner.outbound.lock().clone().ok_or(ClientError::NotOpen {
            name: self.inner.name.clone(),
            status,
        })?;

        let client_id = format!("client-{}-{}", self.inner.name, Uuid::new_v4());
        let frame = ClientFrame::chat(&self.inner.room, &self.inner.name, text, client_id);
        tracing::debug!(name = %self.inner.name, "sending chat frame");
        tx.try_send(Outbound::Frame(frame))
            .map_err(|e| ClientError::Send(e.to_string()))
    }

    /// Graceful local teardown: leave the room and close with the normal
    /// code if open, otherwise just cancel whatever is pending.
    pub(crate) fn teardown(&self) {
        let effects = self.apply(WorkerEvent::Teardown);
        self.execute(effects, None);
    }

    // ── State machine plumbing ───────────────────────────────────────

    /// Run the event through the pure transition function, update the
    /// caller-facing status, and hand back the effects for execution.
    fn apply(&self, event: WorkerEvent) -> Vec<Effect> {
        let (next, effects) = {
            let mut state = self.inner.state.lock();
            let (next, effects) = transition(*state, event);
            if next != *state {
                tracing::debug!(
                    name = %self.inner.name,
                    from = ?*state,
                    to = ?next,
                    event = ?event,
                    "state transition"
                );
            }
            *state = next;
            (next, effects)
        };

        let status = match next {
            WorkerState::Idle => Some(ConnectionStatus::Idle),
            WorkerState::Connecting => Some(ConnectionStatus::Connecting),
            WorkerState::Open => Some(ConnectionStatus::Open),
            WorkerState::Closed => Some(ConnectionStatus::Closed),
            // Reconnecting reports as `reconnecting` or `error` depending
            // on what triggered it; the effect carries the answer.
            WorkerState::Reconnecting => effects.iter().find_map(|e| match e {
                Effect::ScheduleReconnect { status, .. } => Some(*status),
                _ => None,
            }),
        };
        if let Some(status) = status {
            *self.inner.status.lock() = status;
        }

        effects
    }

    /// Execute transition effects.  `tx` is the writer channel of the
    /// transport that produced the event, when one exists; `SendJoin` is
    /// the only effect that needs it.
    fn execute(&self, effects: Vec<Effect>, tx: Option<&mpsc::Sender<Outbound>>) {
        for effect in effects {
            match effect {
                Effect::OpenTransport => self.spawn_attempt(),
                Effect::SendJoin => {
                    if let Some(tx) = tx {
                        let _ = tx.try_send(Outbound::Frame(ClientFrame::join(&self.inner.room)));
                    }
                }
                Effect::CancelPendingReconnect => self.inner.scheduler.cancel(&self.inner.name),
                Effect::RecordConnected => self.record_connected(),
                Effect::RecordDisconnected { code } => self.record_disconnected(code),
                Effect::ScheduleReconnect { reason, .. } => self.schedule_reconnect(reason),
                Effect::SendLeave => {
                    if let Some(tx) = self.inner.outbound.lock().as_ref() {
                        let _ = tx.try_send(Outbound::Frame(ClientFrame::leave(&self.inner.room)));
                    }
                }
                Effect::CloseTransport => {
                    if let Some(tx) = self.inner.outbound.lock().take() {
                        let _ = tx.try_send(Outbound::Close);
                    }
                    // Stop the read loop; the writer drains the queued
                    // leave/close frames on its own.
                    self.inner.attempt.lock().cancel();
                }
                Effect::DiscardTransport => self.discard_transport(),
                // Handled inline by the read loop, which has the frame.
                Effect::HandleFrame => {}
            }
        }
    }

    // ── Transport lifecycle ──────────────────────────────────────────

    /// Release any prior transport for this name and open a new one.
    fn spawn_attempt(&self) {
        let token = {
            let mut attempt = self.inner.attempt.lock();
            let old = std::mem::replace(&mut *attempt, CancellationToken::new());
            old.cancel();
            attempt.clone()
        };
        *self.inner.outbound.lock() = None;

        let worker = self.clone();
        tokio::spawn(async move { worker.run_attempt(token).await });
    }

    fn discard_transport(&self) {
        let old = {
            let mut attempt = self.inner.attempt.lock();
            std::mem::replace(&mut *attempt, CancellationToken::new())
        };
        old.cancel();
        *self.inner.outbound.lock() = None;
    }

    /// One connection lifecycle: connect, join, read until the transport
    /// goes away or the attempt is cancelled.
    async fn run_attempt(self, token: CancellationToken) {
        let url = self.inner.endpoint.connection_url(&self.inner.name);
        tracing::info!(
            name = %self.inner.name,
            endpoint = %self.inner.endpoint.label,
            "connecting"
        );

        let ws = tokio::select! {
            result = tokio_tungstenite::connect_async(&url) => match result {
                Ok((ws, _response)) => ws,
                Err(e) => {
                    tracing::warn!(
                        name = %self.inner.name,
                        endpoint = %self.inner.endpoint.label,
                        error = %e,
                        "connect failed"
                    );
                    let effects = self.apply(WorkerEvent::ConnectFailed);
                    self.execute(effects, None);
                    return;
                }
            },
            _ = token.cancelled() => return,
        };

        let effects = self.apply(WorkerEvent::TransportOpened);
        if !effects.contains(&Effect::SendJoin) {
            // Teardown raced the handshake; drop the socket unused.
            return;
        }

        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::channel::<Outbound>(32);
        *self.inner.outbound.lock() = Some(tx.clone());
        self.inner.retry_count.store(0, Ordering::Relaxed);

        tracing::info!(
            name = %self.inner.name,
            endpoint = %self.inner.endpoint.label,
            "connected"
        );

        // Writer task: owns the sink, drains queued frames.  Exits after a
        // close frame or when every sender is gone.
        let writer_name = self.inner.name.clone();
        let writer = tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                match out {
                    Outbound::Frame(frame) => {
                        let json = match serde_json::to_string(&frame) {
                            Ok(json) => json,
                            Err(e) => {
                                tracing::error!(
                                    name = %writer_name,
                                    error = %e,
                                    "failed to serialize outbound frame"
                                );
                                continue;
                            }
                        };
                        if sink.send(WsMessage::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = sink
                            .send(WsMessage::Close(Some(CloseFrame {
                                code: CloseCode::Normal,
                                reason: "client shutdown".into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
        });

        self.execute(effects, Some(&tx));

        // Read loop: every transport event becomes a state-machine event.
        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let effects = self.apply(WorkerEvent::FrameReceived);
                        if effects.contains(&Effect::HandleFrame) {
                            self.handle_inbound(&text);
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let code = frame
                            .map(|f| u16::from(f.code))
                            .unwrap_or(ABNORMAL_CLOSURE);
                        tracing::info!(
                            name = %self.inner.name,
                            endpoint = %self.inner.endpoint.label,
                            code,
                            "transport closed"
                        );
                        let effects = self.apply(WorkerEvent::TransportClosed { code });
                        self.execute(effects, None);
                        break;
                    }
                    Some(Ok(_)) => {} // ping/pong/binary: nothing to do
                    Some(Err(e)) => {
                        tracing::warn!(
                            name = %self.inner.name,
                            endpoint = %self.inner.endpoint.label,
                            error = %e,
                            "transport error"
                        );
                        let effects = self.apply(WorkerEvent::TransportError);
                        self.execute(effects, None);
                        break;
                    }
                    None => {
                        // Stream ended without a close frame.
                        let effects = self.apply(WorkerEvent::TransportClosed {
                            code: ABNORMAL_CLOSURE,
                        });
                        self.execute(effects, None);
                        break;
                    }
                },
                _ = token.cancelled() => break,
            }
        }

        // Only clear the writer channel if it is still ours; a replacement
        // attempt may already have installed a new one.
        {
            let mut outbound = self.inner.outbound.lock();
            if outbound.as_ref().is_some_and(|cur| cur.same_channel(&tx)) {
                *outbound = None;
            }
        }
        drop(tx);
        let _ = writer.await;
    }

    fn schedule_reconnect(&self, reason: ReconnectReason) {
        let delay = self.inner.policy.delay_for(reason);
        let attempt = self.inner.retry_count.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(
            name = %self.inner.name,
            endpoint = %self.inner.endpoint.label,
            delay_ms = delay.as_millis() as u64,
            attempt,
            reason = ?reason,
            "scheduling reconnect"
        );

        let worker = self.clone();
        self.inner.scheduler.schedule(&self.inner.name, delay, async move {
            let effects = worker.apply(WorkerEvent::RetryFired);
            worker.execute(effects, None);
        });
    }

    // ── Inbound frames ───────────────────────────────────────────────

    fn handle_inbound(&self, raw: &str) {
        match decode(raw) {
            Ok(ServerFrame::Chat(frame)) => {
                let key = dedup_key(&frame);
                let appended = self.inner.log.append_if_new(&key, || Message {
                    id: key.clone(),
                    kind: MessageKind::Chat,
                    sender: Some(frame.sender.clone()),
                    text: frame.text.clone(),
                    created_at: frame
                        .created_at
                        .as_deref()
                        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(Utc::now),
                    source_connection: self.inner.name.clone(),
                    source_endpoint: self.inner.endpoint.label.clone(),
                });
                if !appended {
                    tracing::debug!(
                        name = %self.inner.name,
                        key = %key,
                        "duplicate message filtered"
                    );
                }
            }
            Ok(ServerFrame::Unrecognized(value)) => {
                // Forward-compatibility: surface unknown frames instead of
                // dropping them.
                let id = format!("{}-raw-{}", self.inner.name, Uuid::new_v4());
                self.append_system(id, value.to_string());
            }
            Err(e) => {
                tracing::warn!(
                    name = %self.inner.name,
                    endpoint = %self.inner.endpoint.label,
                    error = %e,
                    "failed to parse inbound frame"
                );
                let id = format!("{}-invalid-{}", self.inner.name, Uuid::new_v4());
                self.append_system(id, e.raw);
            }
        }
    }

    // ── System messages ──────────────────────────────────────────────

    fn record_connected(&self) {
        let now = Utc::now();
        let id = format!(
            "{}-connect-{}-{}",
            self.inner.name,
            self.inner.endpoint.label,
            now.timestamp_millis()
        );
        self.append_system(
            id,
            format!(
                "{} connected to server {}",
                self.inner.name, self.inner.endpoint.label
            ),
        );
    }

    fn record_disconnected(&self, code: u16) {
        let now = Utc::now();
        let id = format!(
            "{}-disconnect-{}-{}",
            self.inner.name,
            self.inner.endpoint.label,
            now.timestamp_millis()
        );
        self.append_system(
            id,
            format!(
                "{} disconnected from server {} ({})",
                self.inner.name, self.inner.endpoint.label, code
            ),
        );
    }

    fn append_system(&self, id: String, text: String) {
        let key = id.clone();
        self.inner.log.append_if_new(&key, || Message {
            id,
            kind: MessageKind::System,
            sender: None,
            text,
            created_at: Utc::now(),
            source_connection: self.inner.name.clone(),
            source_endpoint: self.inner.endpoint.label.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_worker(log: Arc<MessageLog>) -> Worker {
        Worker::new(
            "alice".into(),
            Endpoint::new("ws://localhost:8080/ws"),
            "general".into(),
            log,
            ReconnectScheduler::new(),
            ReconnectPolicy::default(),
        )
    }

    #[test]
    fn send_before_open_is_rejected_without_log_mutation() {
        let log = Arc::new(MessageLog::new());
        let worker = test_worker(Arc::clone(&log));
        let err = worker.send("hi").unwrap_err();
        assert!(matches!(err, ClientError::NotOpen { .. }));
        assert!(log.is_empty());
    }

    #[test]
    fn inbound_chat_is_deduplicated() {
        let log = Arc::new(MessageLog::new());
        let worker = test_worker(Arc::clone(&log));
        let raw = r#"{"type":"chat","payload":{"user":"bob","text":"hi"},"message_id":"m-1"}"#;
        worker.handle_inbound(raw);
        worker.handle_inbound(raw);
        assert_eq!(log.len(), 1);
        assert_eq!(log.duplicates_dropped(), 1);
        let snapshot = log.snapshot();
        assert_eq!(snapshot[0].sender.as_deref(), Some("bob"));
        assert_eq!(snapshot[0].source_connection, "alice");
        assert_eq!(snapshot[0].source_endpoint, ":8080");
    }

    #[test]
    fn echoed_outbound_frame_lands_once_in_the_log() {
        // Servers echo message frames back with their `type` intact; the
        // echo must classify as chat and append exactly once.
        let log = Arc::new(MessageLog::new());
        let worker = test_worker(Arc::clone(&log));
        let frame = ClientFrame::chat("general", "Alice", "hi", "client-alice-1");
        let raw = serde_json::to_string(&frame).unwrap();
        worker.handle_inbound(&raw);
        worker.handle_inbound(&raw);
        let snapshot = log.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].kind, MessageKind::Chat);
        assert_eq!(snapshot[0].sender.as_deref(), Some("Alice"));
        assert_eq!(snapshot[0].text, "hi");
    }

    #[test]
    fn unrecognized_frame_is_surfaced_as_system_message() {
        let log = Arc::new(MessageLog::new());
        let worker = test_worker(Arc::clone(&log));
        worker.handle_inbound(r#"{"type":"presence","users":3}"#);
        let snapshot = log.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].kind, MessageKind::System);
        assert!(snapshot[0].text.contains("presence"));
    }

    #[test]
    fn malformed_frame_is_surfaced_with_raw_text() {
        let log = Arc::new(MessageLog::new());
        let worker = test_worker(Arc::clone(&log));
        worker.handle_inbound("garbage {{{");
        let snapshot = log.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].kind, MessageKind::System);
        assert_eq!(snapshot[0].text, "garbage {{{");
    }
}
