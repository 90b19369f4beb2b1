// =============================================================================
// WS Session Manager — one broker connection per account
// =============================================================================
//
// Maintains exactly one upstream WebSocket per authorized account: a single
// reader task fans streaming updates out to registered listeners and
// correlates replies against the request table; a single writer task
// serializes outbound frames. Built on the same connect_async/split/read-loop
// idiom the source engine used for its market-data streams, generalized into
// a bidirectional request/reply router (design note: "a request table keyed
// by id, with a message router task and per-waiter channels").
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::ExecutionError;
use crate::types::AccountId;
use crate::ws::protocol::InboundEnvelope;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

pub type ListenerId = Uuid;

struct PendingWaiter {
    reply: oneshot::Sender<Result<InboundEnvelope, ExecutionError>>,
}

struct SessionInner {
    writer_tx: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<u64, PendingWaiter>>,
    next_req_id: AtomicU64,
    listeners: Mutex<HashMap<ListenerId, mpsc::UnboundedSender<InboundEnvelope>>>,
    closed: AtomicBool,
}

/// A ready, authorized connection for one account.
pub struct Session {
    account_id: AccountId,
    inner: Arc<SessionInner>,
}

impl Session {
    /// Assign a request id, write the envelope, and wait for the matching
    /// response (spec §4.1 `send`). Fails with `WS_TIMEOUT` on deadline,
    /// `WS_NETWORK` on socket loss; both are marked retryable.
    #[instrument(skip(self, payload), fields(account_id = %self.account_id))]
    pub async fn send<T: Serialize>(
        &self,
        mut payload: T,
        timeout_ms: u64,
    ) -> Result<InboundEnvelope, ExecutionError>
    where
        T: serde::Serialize,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ExecutionError::ws_network("session is closed"));
        }

        let req_id = self.inner.next_req_id.fetch_add(1, Ordering::SeqCst);
        let mut value = serde_json::to_value(&mut payload)
            .map_err(|e| ExecutionError::ws_network(format!("failed to encode request: {e}")))?;
        if let Value::Object(ref mut map) = value {
            map.insert("req_id".into(), Value::from(req_id));
        }

        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .insert(req_id, PendingWaiter { reply: tx });

        let text = value.to_string();
        if self.inner.writer_tx.send(Message::Text(text)).is_err() {
            self.inner.pending.lock().remove(&req_id);
            return Err(ExecutionError::ws_network("writer channel closed"));
        }

        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ExecutionError::ws_network("session closed while waiting")),
            Err(_) => {
                self.inner.pending.lock().remove(&req_id);
                Err(ExecutionError::ws_timeout(format!(
                    "no response within {timeout_ms}ms"
                )))
            }
        }
    }

    /// Register a non-blocking listener for streaming messages (updates that
    /// are not replies to an outstanding request). Callers filter by whatever
    /// key they care about (e.g. `contract_id`) on the receiving end; routing
    /// here is fan-out-to-all so a slow consumer can never block the reader.
    pub fn register_streaming_listener(&self) -> (ListenerId, mpsc::UnboundedReceiver<InboundEnvelope>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.listeners.lock().insert(id, tx);
        (id, rx)
    }

    pub fn unregister_streaming_listener(&self, id: ListenerId) {
        self.inner.listeners.lock().remove(&id);
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let mut pending = self.inner.pending.lock();
        for (_, waiter) in pending.drain() {
            let _ = waiter
                .reply
                .send(Err(ExecutionError::ws_network("connection lost")));
        }
    }
}

/// Owns one [`Session`] per account and drives its reader/writer/heartbeat
/// tasks. `getOrCreate` is idempotent per account; reconnection happens
/// transparently behind the same `Arc<Session>` handle callers already hold.
pub struct WsSessionManager {
    ws_url_base: String,
    app_id: String,
    sessions: Arc<RwLock<HashMap<AccountId, Arc<Session>>>>,
}

impl WsSessionManager {
    pub fn new(app_id: &str) -> Self {
        Self {
            ws_url_base: format!("wss://ws.derivws.com/websockets/v3?app_id={app_id}"),
            app_id: app_id.to_string(),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns a ready session for `account_id`; opens, authorizes, and
    /// starts the heartbeat on first call. Fails with `WS_NETWORK` if the
    /// socket cannot be opened.
    #[instrument(skip(self, token), fields(account_id = %account_id))]
    pub async fn get_or_create(
        &self,
        account_id: &str,
        token: &str,
    ) -> Result<Arc<Session>, ExecutionError> {
        if let Some(existing) = self.sessions.read().get(account_id) {
            if !existing.inner.closed.load(Ordering::SeqCst) {
                return Ok(existing.clone());
            }
        }

        let session = self.connect_and_authorize(account_id, token).await?;
        self.sessions
            .write()
            .insert(account_id.to_string(), session.clone());

        self.spawn_reconnect_guardian(account_id.to_string(), token.to_string());
        Ok(session)
    }

    async fn connect_and_authorize(
        &self,
        account_id: &str,
        token: &str,
    ) -> Result<Arc<Session>, ExecutionError> {
        let (ws_stream, _resp) = tokio_tungstenite::connect_async(&self.ws_url_base)
            .await
            .map_err(|e| ExecutionError::ws_network(format!("connect failed: {e}")))?;

        info!(account_id, "broker websocket connected");
        let (mut write, mut read) = ws_stream.split();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Message>();

        let inner = Arc::new(SessionInner {
            writer_tx: writer_tx.clone(),
            pending: Mutex::new(HashMap::new()),
            next_req_id: AtomicU64::new(1),
            listeners: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        // Writer task: serializes all outbound frames onto one socket half.
        tokio::spawn(async move {
            while let Some(msg) = writer_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let session = Arc::new(Session {
            account_id: account_id.to_string(),
            inner: inner.clone(),
        });

        // Reader task: routes replies to the pending table, fans out
        // everything else to streaming listeners.
        let reader_inner = inner.clone();
        let reader_account = account_id.to_string();
        tokio::spawn(async move {
            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        dispatch_inbound(&reader_inner, &reader_account, &text);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!(account_id = %reader_account, "broker websocket closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(account_id = %reader_account, error = %e, "broker websocket read error");
                        break;
                    }
                }
            }
            reader_inner.closed.store(true, Ordering::SeqCst);
            let mut pending = reader_inner.pending.lock();
            for (_, waiter) in pending.drain() {
                let _ = waiter
                    .reply
                    .send(Err(ExecutionError::ws_network("connection lost")));
            }
        });

        // Heartbeat task.
        let hb_tx = writer_tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                interval.tick().await;
                if hb_tx.send(Message::Text(r#"{"ping":1}"#.to_string())).is_err() {
                    break;
                }
            }
        });

        let authorize_body = serde_json::json!({ "authorize": token });
        match session.send(authorize_body, 10_000).await {
            Ok(env) if env.error.is_none() => Ok(session),
            Ok(env) => Err(ExecutionError::ws_network(format!(
                "authorize rejected: {}",
                env.error.map(|e| e.message).unwrap_or_default()
            ))),
            Err(e) => Err(e),
        }
    }

    /// Watches a session and, on unexpected close, reconnects with capped
    /// exponential backoff. Pending waiters are already failed by the reader
    /// task on disconnect; subscription state is the caller's responsibility
    /// to re-establish (spec §4.1: "callers must tolerate gaps").
    fn spawn_reconnect_guardian(&self, account_id: AccountId, token: String) {
        let sessions = self.sessions.clone();
        let app_id = self.app_id.clone();
        tokio::spawn(async move {
            let mut delay = RECONNECT_BASE_DELAY;
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let needs_reconnect = {
                    let map = sessions.read();
                    match map.get(&account_id) {
                        Some(s) => s.inner.closed.load(Ordering::SeqCst),
                        None => return,
                    }
                };
                if !needs_reconnect {
                    delay = RECONNECT_BASE_DELAY;
                    continue;
                }

                warn!(account_id = %account_id, delay_ms = delay.as_millis(), "reconnecting broker session");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RECONNECT_MAX_DELAY);

                match reconnect(&app_id, &account_id, &token).await {
                    Ok(new_session) => {
                        sessions.write().insert(account_id.clone(), new_session);
                        info!(account_id = %account_id, "broker session reconnected");
                        delay = RECONNECT_BASE_DELAY;
                    }
                    Err(e) => {
                        warn!(account_id = %account_id, error = %e, "reconnect attempt failed");
                    }
                }
            }
        });
    }

    /// Cooperative shutdown: closes sockets, cancels waiters with a terminal
    /// error (spec §4.1 `closeAll`).
    pub fn close_all(&self) {
        let sessions = self.sessions.read();
        for session in sessions.values() {
            session.close();
        }
    }
}

async fn reconnect(app_id: &str, account_id: &str, token: &str) -> Result<Arc<Session>, ExecutionError> {
    // A fresh manager-less connect: reuses the same handshake the initial
    // `get_or_create` path does, without re-registering with the outer map
    // (the caller does that).
    let url = format!("wss://ws.derivws.com/websockets/v3?app_id={app_id}");
    let (ws_stream, _resp) = tokio_tungstenite::connect_async(&url)
        .await
        .map_err(|e| ExecutionError::ws_network(format!("reconnect failed: {e}")))?;

    let (mut write, mut read) = ws_stream.split();
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Message>();
    let inner = Arc::new(SessionInner {
        writer_tx: writer_tx.clone(),
        pending: Mutex::new(HashMap::new()),
        next_req_id: AtomicU64::new(1),
        listeners: Mutex::new(HashMap::new()),
        closed: AtomicBool::new(false),
    });

    tokio::spawn(async move {
        while let Some(msg) = writer_rx.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }
    });

    let session = Arc::new(Session {
        account_id: account_id.to_string(),
        inner: inner.clone(),
    });

    let reader_inner = inner.clone();
    let reader_account = account_id.to_string();
    tokio::spawn(async move {
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    dispatch_inbound(&reader_inner, &reader_account, &text);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            }
        }
        reader_inner.closed.store(true, Ordering::SeqCst);
    });

    let authorize_body = serde_json::json!({ "authorize": token });
    match session.send(authorize_body, 10_000).await {
        Ok(env) if env.error.is_none() => Ok(session),
        Ok(env) => Err(ExecutionError::ws_network(format!(
            "authorize rejected on reconnect: {}",
            env.error.map(|e| e.message).unwrap_or_default()
        ))),
        Err(e) => Err(e),
    }
}

fn dispatch_inbound(inner: &Arc<SessionInner>, account_id: &str, text: &str) {
    let envelope = match InboundEnvelope::parse(text) {
        Ok(e) => e,
        Err(e) => {
            debug!(account_id, error = %e, "failed to parse inbound frame");
            return;
        }
    };

    if let Some(req_id) = envelope.req_id {
        if let Some(waiter) = inner.pending.lock().remove(&req_id) {
            let _ = waiter.reply.send(Ok(envelope));
            return;
        }
    }

    // Streaming push: fan out to every registered listener, never blocking.
    let listeners = inner.listeners.lock();
    for tx in listeners.values() {
        let _ = tx.send(envelope.clone());
    }
}
