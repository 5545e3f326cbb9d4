//! Per-conversation session controller
//!
//! Owns everything about the open thread: the session key (if one could be
//! agreed), the decrypted transcript, typing state in both directions and
//! whether the peer is online. Persistence goes through the repository,
//! live delivery through the gateway link; the two are attempted
//! independently and neither waits for the other.
//!
//! Timers are driven by the caller: [`ChatSessionController::tick`] should
//! run a few times per second while a thread is open.

use chrono::{DateTime, Utc};
use parley_shared::protocol::{ClientEvent, ServerEvent, TypingNotice};
use parley_shared::{
    decrypt, derive_session_key, encrypt, fingerprint, import_public, AccountId, AccountKeyPair,
    ConversationRepository, MessageContent, MessageEnvelope, ProfileDirectory, SessionKey, Thread,
    UNDECRYPTABLE_PLACEHOLDER,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::websocket::GatewayLink;

/// Shown while a conversation has no session key
pub const UNENCRYPTED_WARNING: &str =
    "Messages in this conversation are not end-to-end encrypted";

/// Minimum spacing of `typing` events during one burst of keystrokes
pub const TYPING_REFRESH: Duration = Duration::from_millis(1000);

/// Persistence state of a transcript entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Sending,
    Sent,
    /// Not persisted; the entry can be retried
    Failed,
}

/// Why a thread has no session key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnkeyedReason {
    NoLocalKey,
    PeerKeyMissing,
    PeerKeyUnavailable,
    PeerKeyInvalid,
    AgreementFailed,
}

/// One rendered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub id: Uuid,
    pub sender_id: AccountId,
    /// Display text; the placeholder when the body could not be decrypted
    pub text: String,
    pub encrypted: bool,
    pub created_at: DateTime<Utc>,
    pub state: DeliveryState,
}

/// Outcome of a send or retry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub id: Uuid,
    pub encrypted: bool,
    pub persisted: bool,
    pub pushed: bool,
    /// Set when the message went out unencrypted
    pub warning: Option<&'static str>,
}

struct ThreadView {
    thread: Thread,
    peer: AccountId,
    session: Option<SessionKey>,
    unkeyed: Option<UnkeyedReason>,
    transcript: Vec<TranscriptEntry>,
    seen: HashSet<Uuid>,
    /// Composed envelopes not yet persisted, by id
    unsent: HashMap<Uuid, MessageEnvelope>,
    /// Our burst: when `typing` was last sent and when `stop-typing` is due
    typing_sent_at: Option<Instant>,
    typing_deadline: Option<Instant>,
    peer_typing_since: Option<Instant>,
}

impl ThreadView {
    fn render(&self, envelope: &MessageEnvelope, state: DeliveryState) -> TranscriptEntry {
        let text = match (&envelope.content, &self.session) {
            (MessageContent::Plaintext { text }, _) => text.clone(),
            (MessageContent::Encrypted { envelope }, Some(key)) => decrypt(key, envelope).into_display(),
            (MessageContent::Encrypted { .. }, None) => UNDECRYPTABLE_PLACEHOLDER.to_string(),
        };
        TranscriptEntry {
            id: envelope.id,
            sender_id: envelope.sender_id.clone(),
            text,
            encrypted: envelope.content.is_encrypted(),
            created_at: envelope.created_at,
            state,
        }
    }

    fn notice(&self, me: &AccountId) -> TypingNotice {
        TypingNotice {
            thread_id: self.thread.id,
            sender_id: me.clone(),
            receiver_id: self.peer.clone(),
        }
    }

    fn set_state(&mut self, id: Uuid, state: DeliveryState) {
        if let Some(entry) = self.transcript.iter_mut().find(|e| e.id == id) {
            entry.state = state;
        }
    }
}

/// State machine for one open conversation at a time
pub struct ChatSessionController<R, P, G> {
    repo: Arc<R>,
    profiles: Arc<P>,
    gateway: Arc<G>,
    me: AccountId,
    keys: Option<AccountKeyPair>,
    typing_timeout: Duration,
    peer_typing_expiry: Duration,
    online: BTreeSet<AccountId>,
    view: Option<ThreadView>,
}

impl<R, P, G> ChatSessionController<R, P, G>
where
    R: ConversationRepository,
    P: ProfileDirectory,
    G: GatewayLink,
{
    /// `keys` is `None` for accounts without a key pair; they can still
    /// chat unencrypted
    pub fn new(
        me: AccountId,
        keys: Option<AccountKeyPair>,
        repo: Arc<R>,
        profiles: Arc<P>,
        gateway: Arc<G>,
    ) -> Self {
        let defaults = ClientConfig::default();
        Self {
            repo,
            profiles,
            gateway,
            me,
            keys,
            typing_timeout: defaults.typing_timeout,
            peer_typing_expiry: defaults.peer_typing_expiry,
            online: BTreeSet::new(),
            view: None,
        }
    }

    /// Take typing timings from `config`
    pub fn with_config(mut self, config: &ClientConfig) -> Self {
        self.typing_timeout = config.typing_timeout;
        self.peer_typing_expiry = config.peer_typing_expiry;
        self
    }

    // ── Opening ─────────────────────────────────────────────────────────

    /// Find or create the thread with `peer`, open it and load its history
    pub async fn open_with(&mut self, peer: &AccountId) -> Result<()> {
        let thread = self.repo.find_or_create_thread(&self.me, peer).await?;
        self.open_thread(thread).await?;
        self.load_history().await
    }

    /// Make `thread` the active conversation
    ///
    /// Agrees a session key when both sides have usable keys; otherwise the
    /// thread is unkeyed and sends go out in plaintext with a warning.
    /// Transcript and typing state start empty.
    pub async fn open_thread(&mut self, thread: Thread) -> Result<()> {
        let peer = thread
            .counterparty(&self.me)
            .cloned()
            .ok_or(ClientError::NotAMember)?;
        self.close().await;

        let (session, unkeyed) = match self.agree_session_key(&peer).await {
            Ok(key) => (Some(key), None),
            Err(reason) => {
                warn!(
                    "Thread {} with {} is unencrypted: {:?}",
                    thread.id,
                    peer.short(),
                    reason
                );
                (None, Some(reason))
            }
        };

        info!("Opened thread {} with {}", thread.id, peer.short());
        self.view = Some(ThreadView {
            thread,
            peer,
            session,
            unkeyed,
            transcript: Vec::new(),
            seen: HashSet::new(),
            unsent: HashMap::new(),
            typing_sent_at: None,
            typing_deadline: None,
            peer_typing_since: None,
        });
        Ok(())
    }

    async fn agree_session_key(&self, peer: &AccountId) -> std::result::Result<SessionKey, UnkeyedReason> {
        let local = self.keys.as_ref().ok_or(UnkeyedReason::NoLocalKey)?;
        let document = match self.profiles.fetch_public_key(peer).await {
            Ok(Some(document)) => document,
            Ok(None) => return Err(UnkeyedReason::PeerKeyMissing),
            Err(e) => {
                warn!("Could not fetch key of {}: {}", peer.short(), e);
                return Err(UnkeyedReason::PeerKeyUnavailable);
            }
        };
        let peer_key = import_public(&document).map_err(|e| {
            warn!("Published key of {} is unusable: {}", peer.short(), e);
            UnkeyedReason::PeerKeyInvalid
        })?;
        let key = derive_session_key(local, &peer_key).map_err(|e| {
            warn!("Key agreement with {} failed: {}", peer.short(), e);
            UnkeyedReason::AgreementFailed
        })?;
        debug!("Session key agreed with {} ({})", peer.short(), fingerprint(&peer_key));
        Ok(key)
    }

    // ── History ─────────────────────────────────────────────────────────

    /// Replace the transcript with persisted history
    ///
    /// Entries not yet persisted (sending or failed) and live messages the
    /// history does not contain yet are kept.
    pub async fn load_history(&mut self) -> Result<()> {
        let thread_id = self.view.as_ref().ok_or(ClientError::NoActiveThread)?.thread.id;
        let history = self.repo.list_messages(thread_id).await?;

        let view = self.view.as_mut().ok_or(ClientError::NoActiveThread)?;
        if view.thread.id != thread_id {
            return Ok(());
        }
        let mut transcript: Vec<TranscriptEntry> = history
            .iter()
            .map(|envelope| view.render(envelope, DeliveryState::Sent))
            .collect();
        let stored: HashSet<Uuid> = transcript.iter().map(|e| e.id).collect();
        for entry in view.transcript.drain(..) {
            if !stored.contains(&entry.id) {
                transcript.push(entry);
            }
        }
        transcript.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        for id in &stored {
            view.unsent.remove(id);
        }
        view.seen = transcript.iter().map(|e| e.id).collect();
        view.transcript = transcript;
        debug!("Loaded {} stored message(s) for thread {}", stored.len(), thread_id);
        Ok(())
    }

    /// Reload history after a reconnect
    pub async fn resync(&mut self) -> Result<()> {
        if self.view.is_none() {
            return Ok(());
        }
        self.load_history().await
    }

    // ── Sending ─────────────────────────────────────────────────────────

    /// Compose, persist and push a message
    ///
    /// Persistence failure leaves the entry `Failed` for [`Self::retry`];
    /// push failure is only logged since the receiver will see the message
    /// on its next history load.
    pub async fn send(&mut self, text: &str) -> Result<SendReport> {
        if text.trim().is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        self.stop_typing().await;

        let me = self.me.clone();
        let view = self.view.as_mut().ok_or(ClientError::NoActiveThread)?;
        let content = match &view.session {
            Some(key) => MessageContent::Encrypted {
                envelope: encrypt(key, text)?,
            },
            None => MessageContent::Plaintext {
                text: text.to_string(),
            },
        };
        let envelope = MessageEnvelope::compose(view.thread.id, me, view.peer.clone(), content);

        view.transcript.push(TranscriptEntry {
            id: envelope.id,
            sender_id: envelope.sender_id.clone(),
            text: text.to_string(),
            encrypted: envelope.content.is_encrypted(),
            created_at: envelope.created_at,
            state: DeliveryState::Sending,
        });
        view.seen.insert(envelope.id);
        view.unsent.insert(envelope.id, envelope.clone());

        Ok(self.deliver(envelope).await)
    }

    /// Persist a failed message again
    pub async fn retry(&mut self, id: Uuid) -> Result<SendReport> {
        let view = self.view.as_mut().ok_or(ClientError::NoActiveThread)?;
        let envelope = view
            .unsent
            .get(&id)
            .cloned()
            .ok_or(ClientError::UnknownMessage(id))?;
        view.set_state(id, DeliveryState::Sending);
        Ok(self.deliver(envelope).await)
    }

    async fn deliver(&mut self, envelope: MessageEnvelope) -> SendReport {
        let id = envelope.id;
        let encrypted = envelope.content.is_encrypted();
        let repo = self.repo.clone();
        let gateway = self.gateway.clone();

        let (persisted, pushed) = tokio::join!(
            repo.append_message(envelope.clone()),
            gateway.send_event(ClientEvent::SendMessage { envelope }),
        );

        if let Err(e) = &pushed {
            debug!("Live push of {} failed: {}", id, e);
        }
        let persisted = match persisted {
            Ok(_) => true,
            Err(e) => {
                warn!("Message {} was not stored: {}", id, e);
                false
            }
        };

        if let Some(view) = self.view.as_mut() {
            if persisted {
                view.unsent.remove(&id);
                view.set_state(id, DeliveryState::Sent);
            } else {
                view.set_state(id, DeliveryState::Failed);
            }
        }

        SendReport {
            id,
            encrypted,
            persisted,
            pushed: pushed.is_ok(),
            warning: (!encrypted).then_some(UNENCRYPTED_WARNING),
        }
    }

    // ── Receiving ───────────────────────────────────────────────────────

    /// Apply one event from the gateway
    ///
    /// Returns true when visible state changed.
    pub fn handle_event(&mut self, event: ServerEvent) -> bool {
        match event {
            ServerEvent::MessageReceived { envelope } => self.receive(envelope),
            ServerEvent::Typing(notice) => self.peer_typing_changed(&notice, true),
            ServerEvent::StopTyping(notice) => self.peer_typing_changed(&notice, false),
            ServerEvent::PresenceSnapshot { online } => {
                let online: BTreeSet<AccountId> = online.into_iter().collect();
                let changed = online != self.online;
                self.online = online;
                changed
            }
            ServerEvent::Identified { connection_id, .. } => {
                debug!("Gateway identified connection {}", connection_id);
                false
            }
            ServerEvent::Error { code, message } => {
                warn!("Gateway error {}: {}", code, message);
                false
            }
            ServerEvent::Pong => false,
        }
    }

    fn receive(&mut self, envelope: MessageEnvelope) -> bool {
        let Some(view) = self.view.as_mut() else {
            return false;
        };
        if envelope.thread_id != view.thread.id || view.seen.contains(&envelope.id) {
            return false;
        }
        if envelope.sender_id == view.peer {
            view.peer_typing_since = None;
        }
        let entry = view.render(&envelope, DeliveryState::Sent);
        view.seen.insert(entry.id);
        view.transcript.push(entry);
        true
    }

    fn peer_typing_changed(&mut self, notice: &TypingNotice, typing: bool) -> bool {
        let me = &self.me;
        let Some(view) = self.view.as_mut() else {
            return false;
        };
        if notice.thread_id != view.thread.id
            || notice.sender_id != view.peer
            || &notice.receiver_id != me
        {
            return false;
        }
        let was_typing = view.peer_typing_since.is_some();
        view.peer_typing_since = typing.then(Instant::now);
        typing || was_typing
    }

    // ── Typing ──────────────────────────────────────────────────────────

    /// Record a local keystroke
    pub async fn on_keystroke(&mut self) {
        let now = Instant::now();
        let me = self.me.clone();
        let timeout = self.typing_timeout;
        let Some(view) = self.view.as_mut() else {
            return;
        };
        let announce = view
            .typing_sent_at
            .map_or(true, |sent| now.duration_since(sent) >= TYPING_REFRESH);
        view.typing_deadline = Some(now + timeout);
        if !announce {
            return;
        }
        view.typing_sent_at = Some(now);
        let notice = view.notice(&me);
        if let Err(e) = self.gateway.send_event(ClientEvent::Typing(notice)).await {
            debug!("Typing indicator not sent: {}", e);
        }
    }

    /// Advance timers: ends our typing burst and expires a stale peer flag
    pub async fn tick(&mut self) {
        let now = Instant::now();
        let expiry = self.peer_typing_expiry;
        let due = match self.view.as_mut() {
            Some(view) => {
                if view
                    .peer_typing_since
                    .is_some_and(|since| now.duration_since(since) >= expiry)
                {
                    debug!("Peer typing indicator expired");
                    view.peer_typing_since = None;
                }
                view.typing_deadline.is_some_and(|deadline| now >= deadline)
            }
            None => false,
        };
        if due {
            self.stop_typing().await;
        }
    }

    async fn stop_typing(&mut self) {
        let me = self.me.clone();
        let Some(view) = self.view.as_mut() else {
            return;
        };
        if view.typing_sent_at.take().is_none() {
            view.typing_deadline = None;
            return;
        }
        view.typing_deadline = None;
        let notice = view.notice(&me);
        if let Err(e) = self.gateway.send_event(ClientEvent::StopTyping(notice)).await {
            debug!("Stop-typing indicator not sent: {}", e);
        }
    }

    // ── Closing ─────────────────────────────────────────────────────────

    /// Leave the active thread, dropping its key and transcript
    pub async fn close(&mut self) {
        self.stop_typing().await;
        if let Some(view) = self.view.take() {
            if !view.unsent.is_empty() {
                warn!(
                    "Closing thread {} with {} unsent message(s)",
                    view.thread.id,
                    view.unsent.len()
                );
            }
            debug!("Closed thread {}", view.thread.id);
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn me(&self) -> &AccountId {
        &self.me
    }

    pub fn active_thread(&self) -> Option<&Thread> {
        self.view.as_ref().map(|v| &v.thread)
    }

    pub fn peer(&self) -> Option<&AccountId> {
        self.view.as_ref().map(|v| &v.peer)
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        self.view
            .as_ref()
            .map(|v| v.transcript.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_encrypted(&self) -> bool {
        self.view.as_ref().is_some_and(|v| v.session.is_some())
    }

    pub fn unkeyed_reason(&self) -> Option<&UnkeyedReason> {
        self.view.as_ref().and_then(|v| v.unkeyed.as_ref())
    }

    /// Warning to display for the open thread, if any
    pub fn warning(&self) -> Option<&'static str> {
        self.view
            .as_ref()
            .filter(|v| v.session.is_none())
            .map(|_| UNENCRYPTED_WARNING)
    }

    /// Whether the peer is typing; a flag older than the expiry reads false
    pub fn is_peer_typing(&self) -> bool {
        let expiry = self.peer_typing_expiry;
        self.view
            .as_ref()
            .and_then(|v| v.peer_typing_since)
            .is_some_and(|since| since.elapsed() < expiry)
    }

    pub fn is_typing(&self) -> bool {
        self.view.as_ref().is_some_and(|v| v.typing_sent_at.is_some())
    }

    pub fn is_peer_online(&self) -> bool {
        self.view
            .as_ref()
            .is_some_and(|v| self.online.contains(&v.peer))
    }

    pub fn online(&self) -> impl Iterator<Item = &AccountId> {
        self.online.iter()
    }
}
