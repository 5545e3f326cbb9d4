//! WebSocket gateway for real-time delivery
//!
//! The gateway never touches storage on the live path: it binds connections
//! to accounts, fans messages out to every live connection of the receiver
//! and forwards typing indicators. Delivery is best-effort and at-most-once.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use parley_shared::protocol::{self, ClientEvent, ServerEvent, TypingNotice};
use parley_shared::{AccountId, MessageEnvelope};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::TokenAuthority;
use crate::config::ServerConfig;
use crate::db::DatabaseBackend;
use crate::error::GatewayError;
use crate::presence::{ConnectionHandle, PresenceDirectory};

/// Outbound queue depth per connection
pub const OUTBOUND_QUEUE: usize = 50;

// ---------------------------------------------------------------------------
// Rate limiter
// ---------------------------------------------------------------------------

/// Token-bucket rate limiter owned by one connection
struct RateLimiter {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: std::time::Instant,
}

impl RateLimiter {
    fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate,
            last_refill: std::time::Instant::now(),
        }
    }

    /// Try to consume one token. Returns false if rate limit exceeded.
    fn try_consume(&mut self) -> bool {
        let now = std::time::Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection state
// ---------------------------------------------------------------------------

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Socket open, account unknown
    Connecting,
    /// Account bound and registered in presence
    Identified,
    /// Presence broadcast done, events flow
    Active,
    /// Removed from presence
    Closed,
}

/// Server-side view of one socket
pub struct Connection {
    id: Uuid,
    phase: ConnectionPhase,
    account: Option<AccountId>,
    tx: mpsc::Sender<Vec<u8>>,
    /// Message rate limiter (30 burst, 10/s refill)
    rate_limiter: RateLimiter,
}

impl Connection {
    /// New connection writing frames into `tx`
    pub fn new(tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            phase: ConnectionPhase::Connecting,
            account: None,
            tx,
            rate_limiter: RateLimiter::new(30.0, 10.0),
        }
    }

    /// Connection id, as reported in `identified`
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current phase
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Account bound by `identify`
    pub fn account(&self) -> Option<&AccountId> {
        self.account.as_ref()
    }

    fn handle(&self) -> ConnectionHandle {
        ConnectionHandle::new(self.id, self.tx.clone())
    }

    fn require_account(&self) -> Result<&AccountId, GatewayError> {
        match (self.phase, self.account.as_ref()) {
            (ConnectionPhase::Active, Some(account)) => Ok(account),
            _ => Err(GatewayError::NotIdentified),
        }
    }

    async fn reply(&self, event: &ServerEvent) {
        match protocol::encode(event) {
            Ok(frame) => {
                // The socket may already be closing; nothing to do then.
                let _ = self.tx.send(frame).await;
            }
            Err(e) => error!("Failed to encode reply: {}", e),
        }
    }
}

// ---------------------------------------------------------------------------
// Server state
// ---------------------------------------------------------------------------

/// Server state shared across connections and REST handlers
pub struct ServerState {
    pub db: Arc<dyn DatabaseBackend>,
    pub config: ServerConfig,
    pub presence: PresenceDirectory,
    pub auth: TokenAuthority,
    /// Current total connection count (for enforcing max_connections)
    connection_count: AtomicUsize,
    /// Per-IP connection counts (for enforcing max_connections_per_ip)
    ip_connections: dashmap::DashMap<IpAddr, AtomicUsize>,
}

impl ServerState {
    pub fn new(db: Arc<dyn DatabaseBackend>, config: ServerConfig) -> Self {
        let auth = TokenAuthority::new(config.auth_secret.as_deref());
        Self {
            db,
            config,
            presence: PresenceDirectory::new(),
            auth,
            connection_count: AtomicUsize::new(0),
            ip_connections: dashmap::DashMap::new(),
        }
    }

    /// Open sockets, identified or not
    pub fn socket_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// Try to acquire a connection slot. Returns false if limits are exceeded.
    pub fn try_acquire_connection(&self, ip: IpAddr) -> bool {
        let max_global = self.config.max_connections;
        let max_per_ip = self.config.max_connections_per_ip;

        // 0 = unlimited
        if max_global > 0 && self.connection_count.load(Ordering::Relaxed) >= max_global {
            return false;
        }

        if max_per_ip > 0 {
            let entry = self
                .ip_connections
                .entry(ip)
                .or_insert_with(|| AtomicUsize::new(0));
            if entry.value().load(Ordering::Relaxed) >= max_per_ip {
                return false;
            }
            entry.value().fetch_add(1, Ordering::Relaxed);
        }

        self.connection_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Release a connection slot.
    pub fn release_connection(&self, ip: IpAddr) {
        self.connection_count.fetch_sub(1, Ordering::Relaxed);
        if let Some(entry) = self.ip_connections.get(&ip) {
            let prev = entry.value().fetch_sub(1, Ordering::Relaxed);
            if prev <= 1 {
                drop(entry);
                self.ip_connections.remove(&ip);
            }
        }
    }

    /// Push `event` to every live connection of `account`
    ///
    /// Returns how many connections accepted the frame. An offline account
    /// yields zero, which is not an error.
    pub fn push_to_account(&self, account: &AccountId, event: &ServerEvent) -> usize {
        let handles = self.presence.lookup(account);
        if handles.is_empty() {
            return 0;
        }
        let frame = match protocol::encode(event) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode event: {}", e);
                return 0;
            }
        };
        let mut delivered = 0;
        for handle in handles {
            if handle.push(frame.clone()) {
                delivered += 1;
            } else {
                debug!("Outbound queue full or closed for {}", handle.id());
            }
        }
        delivered
    }

    /// Send the current presence snapshot to every connection
    pub fn broadcast_presence(&self) {
        let event = ServerEvent::PresenceSnapshot {
            online: self.presence.snapshot(),
        };
        let frame = match protocol::encode(&event) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode presence snapshot: {}", e);
                return;
            }
        };
        for handle in self.presence.all_handles() {
            let _ = handle.push(frame.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket upgrade handler
// ---------------------------------------------------------------------------

/// Handle WebSocket upgrade, enforcing connection limits before accepting
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let ip = addr.ip();

    if !state.try_acquire_connection(ip) {
        warn!("Connection rejected for {}: limit exceeded", ip);
        return axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
        .into_response()
}

// ---------------------------------------------------------------------------
// Socket lifecycle
// ---------------------------------------------------------------------------

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>, addr: SocketAddr) {
    let ip = addr.ip();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
    let mut conn = Connection::new(tx);

    info!("New WebSocket connection {} from {}", conn.id(), addr);

    // Forward outbound frames and send periodic pings
    let ping_interval_secs = state.config.ws_ping_interval;
    let forward_task = tokio::spawn(async move {
        let mut ping_ticker =
            tokio::time::interval(std::time::Duration::from_secs(ping_interval_secs));
        ping_ticker.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(data) => {
                            if ws_sender.send(Message::Binary(data)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_ticker.tick() => {
                    if ws_sender.send(Message::Ping(vec![])).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Unidentified connections are dropped after the auth timeout
    let auth_timeout = std::time::Duration::from_secs(state.config.auth_timeout_seconds);
    let auth_deadline = tokio::time::Instant::now() + auth_timeout;

    loop {
        let next_msg = if conn.phase() == ConnectionPhase::Connecting {
            match tokio::time::timeout_at(auth_deadline, ws_receiver.next()).await {
                Ok(msg) => msg,
                Err(_) => {
                    warn!("Identify timeout for {}, dropping connection", addr);
                    break;
                }
            }
        } else {
            ws_receiver.next().await
        };

        match next_msg {
            Some(Ok(msg)) => match msg {
                Message::Binary(data) => {
                    if let Err(e) = handle_frame(&data, &mut conn, &state).await {
                        // Details stay in the log; the client gets a generic error.
                        warn!("Error handling frame from {}: {}", addr, e);
                        send_error(&conn, &e).await;
                    }
                }
                Message::Text(_) => { /* ignore text frames */ }
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => { /* axum auto-responds to pings */ }
            },
            Some(Err(e)) => {
                debug!("WebSocket error from {}: {}", addr, e);
                break;
            }
            None => break,
        }
    }

    close_connection(&mut conn, &state);
    state.release_connection(ip);
    forward_task.abort();
}

async fn send_error(conn: &Connection, err: &GatewayError) {
    conn.reply(&ServerEvent::Error {
        code: err.code(),
        message: err.public_message().to_string(),
    })
    .await;
}

/// Mark `conn` closed, evict it from presence and tell everyone else
pub fn close_connection(conn: &mut Connection, state: &ServerState) {
    if conn.phase == ConnectionPhase::Closed {
        return;
    }
    conn.phase = ConnectionPhase::Closed;
    if let Some(account) = state.presence.leave(conn.id) {
        info!("Account {} disconnected ({})", account.short(), conn.id);
        state.broadcast_presence();
    }
}

// ---------------------------------------------------------------------------
// Protocol handler
// ---------------------------------------------------------------------------

/// Decode and dispatch one binary frame
pub async fn handle_frame(
    data: &[u8],
    conn: &mut Connection,
    state: &ServerState,
) -> Result<(), GatewayError> {
    if data.len() > state.config.max_message_size {
        return Err(GatewayError::TooLarge(data.len()));
    }
    let event: ClientEvent = protocol::decode(data)?;

    // Typing indicators, pings and identify are exempt
    let limited = matches!(event, ClientEvent::SendMessage { .. });
    if limited && !conn.rate_limiter.try_consume() {
        return Err(GatewayError::RateLimited);
    }

    handle_client_event(event, conn, state).await
}

/// Apply one decoded client event
pub async fn handle_client_event(
    event: ClientEvent,
    conn: &mut Connection,
    state: &ServerState,
) -> Result<(), GatewayError> {
    match event {
        ClientEvent::Identify { account_id, token } => {
            handle_identify(account_id, token.as_deref(), conn, state).await
        }
        ClientEvent::SendMessage { envelope } => handle_send_message(envelope, conn, state),
        ClientEvent::Typing(notice) => {
            let receiver = check_notice(&notice, conn)?;
            state.push_to_account(&receiver, &ServerEvent::Typing(notice));
            Ok(())
        }
        ClientEvent::StopTyping(notice) => {
            let receiver = check_notice(&notice, conn)?;
            state.push_to_account(&receiver, &ServerEvent::StopTyping(notice));
            Ok(())
        }
        ClientEvent::Ping => {
            conn.reply(&ServerEvent::Pong).await;
            Ok(())
        }
    }
}

async fn handle_identify(
    account: AccountId,
    token: Option<&str>,
    conn: &mut Connection,
    state: &ServerState,
) -> Result<(), GatewayError> {
    match (&conn.account, conn.phase) {
        (_, ConnectionPhase::Closed) => return Err(GatewayError::NotIdentified),
        (Some(current), _) if current != &account => {
            return Err(GatewayError::AlreadyIdentified)
        }
        _ => {}
    }

    if !state.auth.verify_identity(&account, token) {
        return Err(GatewayError::BadCredential(account.short().to_string()));
    }

    state.presence.join(&account, conn.handle());
    conn.account = Some(account.clone());
    conn.phase = ConnectionPhase::Identified;
    info!("Connection {} identified as {}", conn.id, account.short());

    conn.reply(&ServerEvent::Identified {
        account_id: account,
        connection_id: conn.id,
    })
    .await;
    state.broadcast_presence();
    conn.phase = ConnectionPhase::Active;
    Ok(())
}

fn handle_send_message(
    envelope: MessageEnvelope,
    conn: &Connection,
    state: &ServerState,
) -> Result<(), GatewayError> {
    let account = conn.require_account()?;
    if &envelope.sender_id != account {
        return Err(GatewayError::SenderMismatch {
            claimed: envelope.sender_id.short().to_string(),
            actual: account.short().to_string(),
        });
    }

    let receiver = envelope.receiver_id.clone();
    let message_id = envelope.id;
    let delivered = state.push_to_account(&receiver, &ServerEvent::MessageReceived { envelope });
    debug!(
        "Message {} from {} pushed to {} connection(s) of {}",
        message_id,
        account.short(),
        delivered,
        receiver.short()
    );
    Ok(())
}

/// Returns the account the indicator should be forwarded to
fn check_notice(notice: &TypingNotice, conn: &Connection) -> Result<AccountId, GatewayError> {
    let account = conn.require_account()?;
    if &notice.sender_id != account {
        return Err(GatewayError::SenderMismatch {
            claimed: notice.sender_id.short().to_string(),
            actual: account.short().to_string(),
        });
    }
    Ok(notice.receiver_id.clone())
}
