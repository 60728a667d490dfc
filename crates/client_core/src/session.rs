use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{ConversationKey, DeliveryState, MessageId, ProjectId, UserId},
    error::ApiException,
    protocol::{ClientRequest, MessagePayload, SendMessageRequest},
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::SyncSettings,
    error::CommandError,
    poller::{FallbackPoller, SilentReload},
    reconcile::ReconciliationEngine,
    transport::LiveChannel,
    types::{ClientEvent, ConnectionState, LiveEvent, Message},
    ChatBackend,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadMode {
    /// First load after opening; also harvests profile images.
    Initial,
    /// User-requested; errors reach the caller.
    Refresh,
    /// Poller or recovery; errors are only logged.
    Silent,
    /// Next page before the oldest loaded message.
    Older,
}

struct ActiveConversation {
    engine: ReconciliationEngine,
    profile_images: HashMap<UserId, String>,
    live_task: JoinHandle<()>,
    poller_task: JoinHandle<()>,
    typing_debounce: Option<JoinHandle<()>>,
    typing_expiry: Option<JoinHandle<()>>,
}

impl Drop for ActiveConversation {
    fn drop(&mut self) {
        self.live_task.abort();
        self.poller_task.abort();
        if let Some(handle) = self.typing_debounce.take() {
            handle.abort();
        }
        if let Some(handle) = self.typing_expiry.take() {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct SessionState {
    /// Bumped on every open and close; async completions tagged with an older
    /// value belong to a conversation that is no longer shown.
    generation: u64,
    active: Option<ActiveConversation>,
}

impl SessionState {
    fn active_for(&mut self, generation: u64) -> Option<&mut ActiveConversation> {
        if self.generation != generation {
            return None;
        }
        self.active.as_mut()
    }
}

/// Synchronization core for the conversation currently on screen.
pub struct ChatSession {
    self_id: UserId,
    settings: SyncSettings,
    backend: Arc<dyn ChatBackend>,
    channel: Arc<dyn LiveChannel>,
    inner: Mutex<SessionState>,
    events: broadcast::Sender<ClientEvent>,
    next_local_id: AtomicU64,
}

impl ChatSession {
    pub fn new(
        self_id: UserId,
        settings: SyncSettings,
        backend: Arc<dyn ChatBackend>,
        channel: Arc<dyn LiveChannel>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            self_id,
            settings,
            backend,
            channel,
            inner: Mutex::new(SessionState::default()),
            events,
            next_local_id: AtomicU64::new(1),
        })
    }

    pub fn self_id(&self) -> UserId {
        self.self_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.channel.connection().borrow()
    }

    /// Switches to the conversation with `peer_id`, attaching to the live
    /// channel before the initial history load so nothing is missed. A
    /// failed load leaves the conversation open and attached.
    pub async fn open_conversation(
        self: &Arc<Self>,
        peer_id: UserId,
        project_id: Option<ProjectId>,
    ) -> Result<Vec<Message>> {
        if peer_id == self.self_id {
            return Err(anyhow!("cannot open a conversation with yourself"));
        }
        let conversation = ConversationKey::new(self.self_id, peer_id, project_id);
        let generation = {
            let mut guard = self.inner.lock().await;
            guard.active = None;
            guard.generation += 1;
            let generation = guard.generation;
            guard.active = Some(ActiveConversation {
                engine: ReconciliationEngine::new(
                    conversation,
                    self.self_id,
                    self.settings.typing_guard,
                ),
                profile_images: HashMap::new(),
                live_task: self.spawn_live_events(generation),
                poller_task: self.spawn_poller(generation),
                typing_debounce: None,
                typing_expiry: None,
            });
            generation
        };
        info!(conversation = %conversation, "sync: conversation opened");
        self.load_history(generation, LoadMode::Initial).await
    }

    /// Detaches from the live channel and cancels every timer of the open
    /// conversation.
    pub async fn close_conversation(&self) {
        let closed = {
            let mut guard = self.inner.lock().await;
            guard.generation += 1;
            guard.active.take()
        };
        let Some(mut closed) = closed else {
            return;
        };
        let conversation = closed.engine.conversation();
        if let Some(handle) = closed.typing_debounce.take() {
            handle.abort();
            self.emit_typing(conversation, false).await;
        }
        drop(closed);
        info!(conversation = %conversation, "sync: conversation closed");
    }

    pub async fn conversation(&self) -> Option<ConversationKey> {
        let guard = self.inner.lock().await;
        guard
            .active
            .as_ref()
            .map(|active| active.engine.conversation())
    }

    /// Time-ordered view of the open conversation.
    pub async fn messages(&self) -> Vec<Message> {
        let guard = self.inner.lock().await;
        guard
            .active
            .as_ref()
            .map(|active| active.engine.snapshot())
            .unwrap_or_default()
    }

    pub async fn is_peer_typing(&self) -> bool {
        let guard = self.inner.lock().await;
        guard.active.as_ref().is_some_and(|active| {
            active
                .engine
                .is_typing(active.engine.peer_id(), Instant::now())
        })
    }

    pub async fn unread_count(&self) -> usize {
        let guard = self.inner.lock().await;
        guard
            .active
            .as_ref()
            .map_or(0, |active| active.engine.unread_count())
    }

    pub async fn profile_image(&self, user_id: UserId) -> Option<String> {
        let guard = self.inner.lock().await;
        guard
            .active
            .as_ref()
            .and_then(|active| active.profile_images.get(&user_id).cloned())
    }

    /// Pull-to-refresh: a non-silent history load whose errors propagate.
    pub async fn refresh(&self) -> Result<Vec<Message>> {
        let generation = self.current_generation().await?;
        self.load_history(generation, LoadMode::Refresh).await
    }

    /// Fetches the page before the oldest confirmed message.
    pub async fn load_older(&self) -> Result<Vec<Message>> {
        let generation = self.current_generation().await?;
        self.load_history(generation, LoadMode::Older).await
    }

    pub async fn send(&self, text: &str) -> Result<Message, CommandError> {
        if text.trim().is_empty() {
            return Err(CommandError::EmptyBody);
        }
        let client_ref = Uuid::new_v4().to_string();
        let placeholder_id = MessageId::local(self.next_local_id.fetch_add(1, Ordering::Relaxed));
        let (generation, conversation, mut placeholder, typing_timer) = {
            let mut guard = self.inner.lock().await;
            let generation = guard.generation;
            let active = guard
                .active
                .as_mut()
                .ok_or(CommandError::NoConversation)?;
            let conversation = active.engine.conversation();
            let placeholder = Message::pending(
                placeholder_id.clone(),
                client_ref.clone(),
                conversation,
                self.self_id,
                text.to_string(),
                Utc::now(),
            );
            active.engine.insert_pending(placeholder.clone());
            active.engine.take_dirty();
            (
                generation,
                conversation,
                placeholder,
                active.typing_debounce.take(),
            )
        };
        self.emit_changed(conversation);
        if let Some(handle) = typing_timer {
            handle.abort();
            self.emit_typing(conversation, false).await;
        }

        let request = SendMessageRequest {
            sender_id: self.self_id,
            receiver_id: conversation.peer_of(self.self_id).unwrap_or(self.self_id),
            project_id: conversation.project_id(),
            body: text.to_string(),
            client_ref,
        };
        match self.backend.send_message(request).await {
            Ok(payload) => {
                let confirmed = Message::from_payload(payload);
                let changed = self
                    .with_active(generation, |active| {
                        active.engine.confirm_send(&placeholder_id, confirmed.clone());
                        active.engine.take_dirty()
                    })
                    .await
                    .unwrap_or(false);
                if changed {
                    self.emit_changed(conversation);
                }
                info!(
                    placeholder = %placeholder_id,
                    message_id = %confirmed.id,
                    "send: confirmed"
                );
                Ok(confirmed)
            }
            Err(source) => {
                let changed = self
                    .with_active(generation, |active| {
                        active.engine.rollback_send(&placeholder_id);
                        active.engine.take_dirty()
                    })
                    .await
                    .unwrap_or(false);
                if changed {
                    self.emit_changed(conversation);
                }
                warn!(placeholder = %placeholder_id, "send: failed, placeholder removed: {source:#}");
                placeholder.delivery_state = DeliveryState::Failed;
                Err(CommandError::Send {
                    message: Box::new(placeholder),
                    source,
                })
            }
        }
    }

    pub async fn edit(&self, id: &MessageId, text: &str) -> Result<Message, CommandError> {
        if text.trim().is_empty() {
            return Err(CommandError::EmptyBody);
        }
        let (generation, conversation, previous) = {
            let mut guard = self.inner.lock().await;
            let generation = guard.generation;
            let active = guard
                .active
                .as_mut()
                .ok_or(CommandError::NoConversation)?;
            let previous = active.engine.begin_edit(id, text, Utc::now())?;
            active.engine.take_dirty();
            (generation, active.engine.conversation(), previous)
        };
        self.emit_changed(conversation);

        let outcome = self.backend.edit_message(id, text).await;
        let (result, changed) = match outcome {
            Ok(payload) => {
                let confirmed = Message::from_payload(payload);
                let changed = self
                    .with_active(generation, |active| {
                        active.engine.confirm_edit(confirmed.clone());
                        active.engine.take_dirty()
                    })
                    .await;
                (Ok(confirmed), changed)
            }
            Err(source) => {
                warn!(message_id = %id, "edit: failed, reverting: {source:#}");
                let changed = self
                    .with_active(generation, |active| {
                        active.engine.revert_edit(&previous);
                        active.engine.take_dirty()
                    })
                    .await;
                (
                    Err(CommandError::Edit {
                        id: id.clone(),
                        source,
                    }),
                    changed,
                )
            }
        };
        if changed.unwrap_or(false) {
            self.emit_changed(conversation);
        }
        result
    }

    pub async fn delete(&self, id: &MessageId) -> Result<(), CommandError> {
        let (generation, conversation, removed) = {
            let mut guard = self.inner.lock().await;
            let generation = guard.generation;
            let active = guard
                .active
                .as_mut()
                .ok_or(CommandError::NoConversation)?;
            let removed = active.engine.begin_delete(id)?;
            active.engine.take_dirty();
            (generation, active.engine.conversation(), removed)
        };
        self.emit_changed(conversation);

        match self.backend.delete_message(id).await {
            Ok(()) => Ok(()),
            Err(source) => {
                warn!(message_id = %id, "delete: failed, restoring: {source:#}");
                let restored = self
                    .with_active(generation, |active| {
                        active.engine.restore_deleted(removed);
                        active.engine.take_dirty()
                    })
                    .await;
                if restored.unwrap_or(false) {
                    self.emit_changed(conversation);
                }
                Err(CommandError::Delete {
                    id: id.clone(),
                    source,
                })
            }
        }
    }

    /// Call on every change of the compose box. Sends `typing-started` for a
    /// non-empty draft and `typing-stopped` once input has been idle for the
    /// configured interval. Delivery failures are ignored.
    pub async fn notify_typing(self: &Arc<Self>, draft: &str) {
        let (generation, conversation, previous) = {
            let mut guard = self.inner.lock().await;
            let generation = guard.generation;
            let Some(active) = guard.active.as_mut() else {
                return;
            };
            (
                generation,
                active.engine.conversation(),
                active.typing_debounce.take(),
            )
        };
        let was_typing = previous.is_some();
        if let Some(handle) = previous {
            handle.abort();
        }
        if draft.trim().is_empty() {
            if was_typing {
                self.emit_typing(conversation, false).await;
            }
            return;
        }

        self.emit_typing(conversation, true).await;
        let session = Arc::downgrade(self);
        let idle = self.settings.typing_idle;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if let Some(session) = session.upgrade() {
                session.finish_typing(generation).await;
            }
        });
        let mut guard = self.inner.lock().await;
        match guard.active_for(generation) {
            Some(active) => {
                if let Some(stale) = active.typing_debounce.replace(timer) {
                    stale.abort();
                }
            }
            None => timer.abort(),
        }
    }

    /// Marks every unread peer message as read and reports them in one
    /// batch. Returns how many were marked. Failures are logged only.
    pub async fn mark_seen(&self) -> usize {
        let Ok(generation) = self.current_generation().await else {
            return 0;
        };
        self.mark_seen_for(generation).await
    }

    async fn current_generation(&self) -> Result<u64> {
        let guard = self.inner.lock().await;
        if guard.active.is_none() {
            return Err(anyhow!("no conversation is open"));
        }
        Ok(guard.generation)
    }

    async fn with_active<T>(
        &self,
        generation: u64,
        apply: impl FnOnce(&mut ActiveConversation) -> T,
    ) -> Option<T> {
        let mut guard = self.inner.lock().await;
        guard.active_for(generation).map(apply)
    }

    fn emit_changed(&self, conversation: ConversationKey) {
        let _ = self
            .events
            .send(ClientEvent::MessagesChanged { conversation });
    }

    async fn emit_typing(&self, conversation: ConversationKey, started: bool) {
        let sender_id = self.self_id;
        let receiver_id = conversation.peer_of(sender_id).unwrap_or(sender_id);
        let project_id = conversation.project_id();
        let request = if started {
            ClientRequest::TypingStarted {
                sender_id,
                receiver_id,
                project_id,
            }
        } else {
            ClientRequest::TypingStopped {
                sender_id,
                receiver_id,
                project_id,
            }
        };
        if let Err(err) = self.channel.emit(request).await {
            debug!("typing: signal not delivered: {err}");
        }
    }

    async fn finish_typing(&self, generation: u64) {
        let conversation = self
            .with_active(generation, |active| {
                active.typing_debounce.take();
                active.engine.conversation()
            })
            .await;
        if let Some(conversation) = conversation {
            self.emit_typing(conversation, false).await;
        }
    }

    async fn load_history(&self, generation: u64, mode: LoadMode) -> Result<Vec<Message>> {
        let request = self
            .with_active(generation, |active| {
                let before = if mode == LoadMode::Older {
                    oldest_confirmed(&active.engine)
                } else {
                    None
                };
                (active.engine.conversation(), before)
            })
            .await;
        let Some((conversation, before)) = request else {
            return Ok(Vec::new());
        };
        if mode == LoadMode::Older && before.is_none() {
            return Ok(Vec::new());
        }

        let payloads = self
            .backend
            .fetch_history(conversation, self.settings.history_limit, before)
            .await?;

        let applied = self
            .with_active(generation, |active| {
                if active.engine.conversation() != conversation {
                    return None;
                }
                let discovered = if mode == LoadMode::Initial {
                    harvest_profile_images(&mut active.profile_images, &conversation, &payloads)
                } else {
                    Vec::new()
                };
                let messages: Vec<Message> = payloads
                    .into_iter()
                    .map(Message::from_payload)
                    .filter(|message| {
                        conversation.admits(
                            message.sender_id,
                            message.receiver_id,
                            message.conversation.project_id(),
                        )
                    })
                    .collect();
                active.engine.apply_history(messages.clone());
                Some((messages, active.engine.take_dirty(), discovered))
            })
            .await
            .flatten();
        let Some((messages, changed, discovered)) = applied else {
            debug!(conversation = %conversation, "history: discarding stale response");
            return Ok(Vec::new());
        };

        debug!(
            conversation = %conversation,
            count = messages.len(),
            mode = ?mode,
            "history: page merged"
        );
        if changed {
            self.emit_changed(conversation);
        }
        for (user_id, url) in discovered {
            let _ = self
                .events
                .send(ClientEvent::ProfileImageDiscovered { user_id, url });
        }
        if self.settings.auto_mark_seen {
            self.mark_seen_for(generation).await;
        }
        Ok(messages)
    }

    async fn reload_silent(&self, generation: u64) {
        if let Err(err) = self.load_history(generation, LoadMode::Silent).await {
            let transient = err
                .downcast_ref::<ApiException>()
                .map_or(true, |api| api.code.is_transient());
            if transient {
                debug!("history: background reload failed, retrying later: {err:#}");
            } else {
                warn!("history: background reload rejected: {err:#}");
            }
        }
    }

    async fn mark_seen_for(&self, generation: u64) -> usize {
        let marked = self
            .with_active(generation, |active| {
                let ids = active.engine.take_unseen(Utc::now());
                active.engine.take_dirty();
                (ids, active.engine.conversation())
            })
            .await;
        let Some((ids, conversation)) = marked else {
            return 0;
        };
        if ids.is_empty() {
            return 0;
        }
        self.emit_changed(conversation);
        if let Err(err) = self.backend.mark_seen(&ids).await {
            warn!(count = ids.len(), "seen: failed to report read receipts: {err:#}");
        }
        ids.len()
    }

    async fn handle_live_event(self: &Arc<Self>, generation: u64, event: LiveEvent) {
        let kind = event.kind();
        let typing_start = matches!(event, LiveEvent::TypingStarted(_));
        let from_peer =
            matches!(&event, LiveEvent::Created(message) if message.sender_id != self.self_id);

        let mut guard = self.inner.lock().await;
        let Some(active) = guard.active_for(generation) else {
            return;
        };
        let applied = active.engine.apply(event, Instant::now());
        if applied.discarded {
            debug!(kind, "live: event for another conversation ignored");
            return;
        }
        let conversation = active.engine.conversation();
        let changed = active.engine.take_dirty();
        if typing_start {
            let guard_interval = active.engine.typing_guard();
            let session = Arc::downgrade(self);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(guard_interval).await;
                if let Some(session) = session.upgrade() {
                    session.expire_typing(generation).await;
                }
            });
            if let Some(stale) = active.typing_expiry.replace(timer) {
                stale.abort();
            }
        }
        drop(guard);

        if changed {
            self.emit_changed(conversation);
        }
        if let Some((user_id, typing)) = applied.typing_changed {
            let _ = self
                .events
                .send(ClientEvent::TypingChanged { user_id, typing });
        }
        if changed && from_peer && self.settings.auto_mark_seen {
            self.mark_seen_for(generation).await;
        }
    }

    async fn expire_typing(&self, generation: u64) {
        let expired = self
            .with_active(generation, |active| {
                active.typing_expiry.take();
                active.engine.expire_typing(Instant::now())
            })
            .await
            .unwrap_or_default();
        for user_id in expired {
            let _ = self.events.send(ClientEvent::TypingChanged {
                user_id,
                typing: false,
            });
        }
    }

    fn spawn_live_events(self: &Arc<Self>, generation: u64) -> JoinHandle<()> {
        let mut events = self.channel.subscribe();
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let received = events.recv().await;
                let Some(session) = session.upgrade() else {
                    break;
                };
                match received {
                    Ok(event) => session.handle_live_event(generation, event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "live: subscriber lagged, reloading history");
                        session.reload_silent(generation).await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_poller(self: &Arc<Self>, generation: u64) -> JoinHandle<()> {
        let poller = FallbackPoller::new(self.settings.poll_interval, self.channel.connection());
        let reloader = SessionReloader {
            session: Arc::downgrade(self),
            generation,
        };
        tokio::spawn(async move {
            poller.run(&reloader).await;
        })
    }
}

struct SessionReloader {
    session: Weak<ChatSession>,
    generation: u64,
}

#[async_trait]
impl SilentReload for SessionReloader {
    async fn reload_silent(&self) {
        if let Some(session) = self.session.upgrade() {
            session.reload_silent(self.generation).await;
        }
    }

    fn connection_changed(&self, state: ConnectionState) {
        if let Some(session) = self.session.upgrade() {
            let _ = session.events.send(ClientEvent::ConnectionChanged(state));
        }
    }
}

fn oldest_confirmed(engine: &ReconciliationEngine) -> Option<MessageId> {
    engine
        .snapshot()
        .into_iter()
        .find(|message| !message.is_pending())
        .map(|message| message.id)
}

/// Non-critical enrichment: remembers the first profile image seen for each
/// participant. Returns the newly discovered entries.
fn harvest_profile_images(
    known: &mut HashMap<UserId, String>,
    conversation: &ConversationKey,
    payloads: &[MessagePayload],
) -> Vec<(UserId, String)> {
    let mut discovered = Vec::new();
    for payload in payloads {
        let candidates = [
            (payload.sender_id, payload.sender_profile_image.as_ref()),
            (payload.receiver_id, payload.receiver_profile_image.as_ref()),
        ];
        for (user_id, image) in candidates {
            let Some(url) = image.filter(|url| !url.trim().is_empty()) else {
                continue;
            };
            if conversation.includes(user_id) && !known.contains_key(&user_id) {
                known.insert(user_id, url.clone());
                discovered.push((user_id, url.clone()));
            }
        }
    }
    discovered
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
