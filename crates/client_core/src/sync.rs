use std::{collections::BTreeSet, sync::Arc};

use shared::{
    domain::{
        sort_by_recent_activity, sort_chronologically, unix_now, Conversation, ConversationId,
        Message, User, UserId,
    },
    protocol::{EventKind, RealtimeEvent},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    api::{endpoints, ChatApi},
    connection::{ConnectionManager, ConnectionNotice, ConnectionState, ConnectionSubscription},
    error::{ClientError, ConnectionError},
    mirror::{MirrorKey, OfflineMirror},
};

/// What changed in the synchronized view. Carries ids only; read the data
/// through [`ConversationSync::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    ConversationsUpdated,
    ConversationOpened(ConversationId),
    MessagesUpdated(ConversationId),
    UnreadChanged,
    PresenceChanged,
    /// Someone started a conversation with the local user; the list has been
    /// re-fetched.
    NewConversation {
        conversation_id: ConversationId,
        from: UserId,
    },
    Connection(ConnectionState),
    ConnectionError(ConnectionError),
}

/// The local view of one user's conversations. Pure state: every mutation is
/// a method returning what changed, so merge rules can be exercised without
/// any I/O.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationState {
    pub local_user: Option<User>,
    pub conversations: Vec<Conversation>,
    pub open: Option<ConversationId>,
    /// History of the open conversation, oldest first.
    pub messages: Vec<Message>,
    pub unread: BTreeSet<ConversationId>,
    pub online: BTreeSet<UserId>,
    /// Conversation joined on the current channel, if any.
    joined: Option<ConversationId>,
    live_list_loaded: bool,
}

impl ConversationState {
    pub fn for_user(user: User) -> Self {
        Self {
            local_user: Some(user),
            ..Self::default()
        }
    }

    pub fn local_user_id(&self) -> Option<&UserId> {
        self.local_user.as_ref().map(|user| &user.id)
    }

    pub fn is_unread(&self, conversation_id: &ConversationId) -> bool {
        self.unread.contains(conversation_id)
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.online.contains(user_id)
    }

    pub fn conversation(&self, conversation_id: &ConversationId) -> Option<&Conversation> {
        self.conversations
            .iter()
            .find(|conversation| &conversation.id == conversation_id)
    }

    /// Replaces the list with a freshly fetched one.
    pub fn apply_conversation_list(&mut self, mut conversations: Vec<Conversation>) {
        sort_by_recent_activity(&mut conversations);
        self.conversations = conversations;
        self.live_list_loaded = true;
    }

    /// Uses a mirrored list, but only until live data has arrived.
    pub fn apply_cached_list(&mut self, mut conversations: Vec<Conversation>) -> bool {
        if self.live_list_loaded {
            return false;
        }
        sort_by_recent_activity(&mut conversations);
        self.conversations = conversations;
        true
    }

    pub fn insert_conversation_first(&mut self, conversation: Conversation) {
        self.conversations
            .retain(|existing| existing.id != conversation.id);
        self.conversations.insert(0, conversation);
    }

    /// Makes `conversation_id` the open conversation. Returns false when it
    /// already was.
    pub fn open(&mut self, conversation_id: &ConversationId) -> bool {
        self.unread.remove(conversation_id);
        if self.open.as_ref() == Some(conversation_id) {
            return false;
        }
        self.open = Some(conversation_id.clone());
        self.messages.clear();
        true
    }

    pub fn close(&mut self) -> Option<ConversationId> {
        self.messages.clear();
        self.open.take()
    }

    /// Installs fetched history for `conversation_id`, keeping realtime
    /// messages that arrived while the fetch was in flight.
    pub fn merge_history(&mut self, conversation_id: &ConversationId, fetched: Vec<Message>) -> bool {
        if self.open.as_ref() != Some(conversation_id) {
            return false;
        }
        let arrived = std::mem::replace(&mut self.messages, fetched);
        for message in arrived {
            self.push_message(message);
        }
        sort_chronologically(&mut self.messages);
        true
    }

    /// Appends to the open conversation unless it is another delivery of a
    /// message already there.
    pub fn push_message(&mut self, message: Message) -> bool {
        if self
            .messages
            .iter()
            .any(|existing| existing.is_same_delivery(&message))
        {
            debug!(sender_id = %message.sender_id, "dropping duplicate delivery");
            return false;
        }
        self.messages.push(message);
        sort_chronologically(&mut self.messages);
        true
    }

    /// Records `message` as the conversation's last message unless the
    /// current one is newer, then re-sorts the list.
    pub fn record_last_message(&mut self, conversation_id: &ConversationId, message: Message) -> bool {
        let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|conversation| &conversation.id == conversation_id)
        else {
            return false;
        };
        if conversation
            .last_activity()
            .is_some_and(|last| last > message.created_at)
        {
            return false;
        }
        conversation.last_message = Some(message);
        sort_by_recent_activity(&mut self.conversations);
        true
    }

    /// Applies one realtime event in channel order.
    pub fn apply_event(&mut self, event: &RealtimeEvent) -> Vec<SyncEvent> {
        let mut changes = Vec::new();
        let from_self = self.local_user_id() == Some(&event.sender_id);

        match event.kind {
            EventKind::NewMessage => {
                if event.conversation_id.is_empty() {
                    debug!("ignoring new_message without a conversation");
                    return changes;
                }
                let id = &event.conversation_id;
                let message = event.to_message();
                if self.record_last_message(id, message.clone()) {
                    changes.push(SyncEvent::ConversationsUpdated);
                }
                if self.open.as_ref() == Some(id) {
                    if self.push_message(message) {
                        changes.push(SyncEvent::MessagesUpdated(id.clone()));
                    }
                } else if !from_self && self.unread.insert(id.clone()) {
                    changes.push(SyncEvent::UnreadChanged);
                }
            }
            EventKind::UserOnline if !from_self => {
                if self.online.insert(event.sender_id.clone()) {
                    changes.push(SyncEvent::PresenceChanged);
                }
            }
            EventKind::UserOffline if !from_self => {
                if self.online.remove(&event.sender_id) {
                    changes.push(SyncEvent::PresenceChanged);
                }
            }
            EventKind::NewConversation => changes.push(SyncEvent::NewConversation {
                conversation_id: event.conversation_id.clone(),
                from: event.sender_id.clone(),
            }),
            EventKind::JoinSuccess => {
                debug!(conversation_id = %event.conversation_id, "joined conversation");
            }
            EventKind::UserOnline | EventKind::UserOffline => {}
            EventKind::MessageReceived | EventKind::JoinConversation => {
                debug!(kind = ?event.kind, "realtime event carries no state change");
            }
        }
        changes
    }
}

/// Background consumer feeding connection notices to a [`ConversationSync`]
/// one at a time. Dropping it stops the consumer.
pub struct SyncWorker {
    _subscription: ConnectionSubscription,
    task: JoinHandle<()>,
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Keeps a [`ConversationState`] in step with the REST surface, the realtime
/// channel and the offline mirror.
pub struct ConversationSync {
    api: Arc<ChatApi>,
    connection: ConnectionManager,
    mirror: Arc<dyn OfflineMirror>,
    state: Mutex<ConversationState>,
    events: broadcast::Sender<SyncEvent>,
}

impl ConversationSync {
    pub fn new(
        api: Arc<ChatApi>,
        connection: ConnectionManager,
        mirror: Arc<dyn OfflineMirror>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            api,
            connection,
            mirror,
            state: Mutex::new(ConversationState::default()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> ConversationState {
        self.state.lock().await.clone()
    }

    /// Starts consuming connection notices. Listener callbacks only enqueue;
    /// the worker applies notices in the order the channel produced them.
    pub fn attach(self: &Arc<Self>) -> SyncWorker {
        let (tx, mut rx) = mpsc::unbounded_channel::<ConnectionNotice>();
        let subscription = self.connection.subscribe(move |notice| {
            let _ = tx.send(notice.clone());
        });
        let sync = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(notice) = rx.recv().await {
                sync.handle_notice(notice).await;
            }
        });
        SyncWorker {
            _subscription: subscription,
            task,
        }
    }

    /// Resets the view for `user`, shows the mirrored list right away, then
    /// fetches the live one.
    pub async fn begin_session(&self, user: User) -> Result<(), ClientError> {
        let user_id = user.id.clone();
        *self.state.lock().await = ConversationState::for_user(user);
        self.load_cached_list(&user_id).await;
        self.refresh_conversations().await
    }

    /// Forgets the in-memory view. The mirror is left in place.
    pub async fn end_session(&self) {
        *self.state.lock().await = ConversationState::default();
        self.emit(SyncEvent::ConversationsUpdated);
    }

    /// Removes everything mirrored for `user_id`.
    pub async fn forget_mirror(&self, user_id: &UserId) {
        if let Err(err) = self.mirror.forget_user(user_id).await {
            warn!(%user_id, error = %err, "offline mirror cleanup failed");
        }
    }

    pub async fn refresh_conversations(&self) -> Result<(), ClientError> {
        let user_id = self.local_user_id().await?;
        let fetched = match self.api.list_conversations(&user_id).await {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(error = %err, "could not fetch conversations");
                self.load_cached_list(&user_id).await;
                return Err(err);
            }
        };

        let open = {
            let mut state = self.state.lock().await;
            if state.local_user_id() != Some(&user_id) {
                return Ok(());
            }
            state.apply_conversation_list(fetched);
            info!(count = state.conversations.len(), "conversation list refreshed");
            state.open.clone()
        };
        self.emit(SyncEvent::ConversationsUpdated);
        self.mirror_conversations(&user_id).await;

        if open.is_none() {
            self.restore_open_conversation(&user_id).await;
        }
        Ok(())
    }

    /// Opens `conversation_id`: clears its unread mark, remembers it in the
    /// mirror, joins it on the channel and loads its history. Opening the
    /// conversation that is already open changes nothing.
    pub async fn open_conversation(&self, conversation_id: &ConversationId) -> Result<(), ClientError> {
        let (user_id, newly_opened, unread_cleared) = {
            let mut state = self.state.lock().await;
            let user_id = state
                .local_user_id()
                .cloned()
                .ok_or(ClientError::NotAuthenticated)?;
            let was_unread = state.is_unread(conversation_id);
            let newly_opened = state.open(conversation_id);
            (user_id, newly_opened, was_unread)
        };
        if unread_cleared {
            self.emit(SyncEvent::UnreadChanged);
        }
        if !newly_opened {
            return Ok(());
        }

        info!(%conversation_id, "conversation opened");
        self.emit(SyncEvent::ConversationOpened(conversation_id.clone()));
        self.mirror_store(
            &MirrorKey::CurrentConversation(user_id.clone()),
            conversation_id.as_str(),
        )
        .await;
        self.join_open_conversation().await;
        self.load_history(conversation_id).await
    }

    pub async fn close_conversation(&self) {
        let (user_id, closed) = {
            let mut state = self.state.lock().await;
            state.joined = None;
            (state.local_user_id().cloned(), state.close())
        };
        if let (Some(user_id), Some(_)) = (user_id, closed) {
            self.mirror_remove(&MirrorKey::CurrentConversation(user_id))
                .await;
        }
    }

    /// Sends over the channel with an optimistic local append when connected;
    /// otherwise falls back to the REST endpoint and re-reads the history.
    pub async fn send_message(&self, conversation_id: &ConversationId, body: &str) -> Result<(), ClientError> {
        let user_id = self.local_user_id().await?;

        if self
            .connection
            .send_message(conversation_id, &user_id, body)
            .await
        {
            let message = Message::new(user_id, body, unix_now());
            self.apply_local_message(conversation_id, message).await;
            return Ok(());
        }

        info!(%conversation_id, "realtime channel unavailable; sending over HTTP");
        let sent = self.api.send_message(conversation_id, body).await?;
        let message = Message::new(user_id, sent.message, sent.created_at);
        self.apply_local_message(conversation_id, message).await;
        self.load_history(conversation_id).await
    }

    /// Starts a conversation with a user found by phone; it goes to the top of
    /// the list and is opened.
    pub async fn create_conversation(&self, friend: &User) -> Result<ConversationId, ClientError> {
        let local = self
            .state
            .lock()
            .await
            .local_user
            .clone()
            .ok_or(ClientError::NotAuthenticated)?;
        let Some(phone) = friend.phone.clone() else {
            return Err(ClientError::InvalidRequest {
                endpoint: endpoints::CONVERSATION.to_string(),
                reason: "the other user has no phone number".into(),
            });
        };
        if local.phone.as_deref() == Some(phone.as_str()) {
            return Err(ClientError::InvalidRequest {
                endpoint: endpoints::CONVERSATION.to_string(),
                reason: "cannot start a conversation with yourself".into(),
            });
        }

        let conversation_id = self.api.create_conversation(&phone).await?;
        let conversation = Conversation {
            id: conversation_id.clone(),
            display_name: friend.username.clone(),
            participants: vec![local.clone(), friend.clone()],
            last_message: None,
        };
        self.state
            .lock()
            .await
            .insert_conversation_first(conversation);
        self.emit(SyncEvent::ConversationsUpdated);
        self.mirror_conversations(&local.id).await;
        self.open_conversation(&conversation_id).await?;
        Ok(conversation_id)
    }

    pub async fn handle_notice(&self, notice: ConnectionNotice) {
        match notice {
            ConnectionNotice::Event(event) => self.handle_event(&event).await,
            ConnectionNotice::StateChanged(phase) => {
                // A fresh channel has joined nothing yet.
                self.state.lock().await.joined = None;
                if phase == ConnectionState::Connected {
                    self.join_open_conversation().await;
                }
                self.emit(SyncEvent::Connection(phase));
            }
            ConnectionNotice::Error(error) => self.emit(SyncEvent::ConnectionError(error)),
        }
    }

    async fn handle_event(&self, event: &RealtimeEvent) {
        let (changes, user_id) = {
            let mut state = self.state.lock().await;
            (state.apply_event(event), state.local_user_id().cloned())
        };

        let mut refetch = false;
        for change in &changes {
            match change {
                SyncEvent::ConversationsUpdated => {
                    if let Some(user_id) = &user_id {
                        self.mirror_conversations(user_id).await;
                    }
                }
                SyncEvent::NewConversation { conversation_id, from } => {
                    info!(%conversation_id, %from, "new conversation announced");
                    refetch = true;
                }
                _ => {}
            }
        }

        if refetch {
            if let Err(err) = self.refresh_conversations().await {
                warn!(error = %err, "could not refresh conversations after announcement");
            }
        }
        for change in changes {
            self.emit(change);
        }
    }

    async fn apply_local_message(&self, conversation_id: &ConversationId, message: Message) {
        let (list_changed, messages_changed, user_id) = {
            let mut state = self.state.lock().await;
            let list_changed = state.record_last_message(conversation_id, message.clone());
            let messages_changed =
                state.open.as_ref() == Some(conversation_id) && state.push_message(message);
            (list_changed, messages_changed, state.local_user_id().cloned())
        };
        if list_changed {
            self.emit(SyncEvent::ConversationsUpdated);
            if let Some(user_id) = user_id {
                self.mirror_conversations(&user_id).await;
            }
        }
        if messages_changed {
            self.emit(SyncEvent::MessagesUpdated(conversation_id.clone()));
        }
    }

    async fn load_history(&self, conversation_id: &ConversationId) -> Result<(), ClientError> {
        let fetched = self.api.get_messages(conversation_id).await?;
        let merged = self
            .state
            .lock()
            .await
            .merge_history(conversation_id, fetched);
        if merged {
            self.emit(SyncEvent::MessagesUpdated(conversation_id.clone()));
        }
        Ok(())
    }

    /// Joins the open conversation unless this channel already has.
    async fn join_open_conversation(&self) {
        let target = {
            let state = self.state.lock().await;
            match (&state.open, state.local_user_id()) {
                (Some(open), Some(user_id)) if state.joined.as_ref() != Some(open) => {
                    Some((open.clone(), user_id.clone()))
                }
                _ => None,
            }
        };
        let Some((conversation_id, user_id)) = target else {
            return;
        };
        if self.connection.state().await != ConnectionState::Connected {
            debug!(%conversation_id, "not connected; join deferred until the channel opens");
            return;
        }
        if self
            .connection
            .join_conversation(&conversation_id, &user_id)
            .await
        {
            self.state.lock().await.joined = Some(conversation_id);
        }
    }

    async fn restore_open_conversation(&self, user_id: &UserId) {
        let key = MirrorKey::CurrentConversation(user_id.clone());
        let Some(saved) = self.mirror_load(&key).await else {
            return;
        };
        let saved = ConversationId::new(saved);
        let known = self.state.lock().await.conversation(&saved).is_some();
        if !known {
            debug!(conversation_id = %saved, "mirrored conversation no longer listed");
            self.mirror_remove(&key).await;
            return;
        }
        if let Err(err) = self.open_conversation(&saved).await {
            warn!(conversation_id = %saved, error = %err, "could not restore open conversation");
        }
    }

    async fn load_cached_list(&self, user_id: &UserId) {
        let Some(raw) = self
            .mirror_load(&MirrorKey::Conversations(user_id.clone()))
            .await
        else {
            return;
        };
        let cached: Vec<Conversation> = match serde_json::from_str(&raw) {
            Ok(cached) => cached,
            Err(err) => {
                warn!(error = %err, "ignoring unreadable mirrored conversation list");
                return;
            }
        };
        let applied = {
            let mut state = self.state.lock().await;
            state.local_user_id() == Some(user_id) && state.apply_cached_list(cached)
        };
        if applied {
            debug!("showing mirrored conversation list");
            self.emit(SyncEvent::ConversationsUpdated);
        }
    }

    async fn mirror_conversations(&self, user_id: &UserId) {
        let encoded = {
            let state = self.state.lock().await;
            if state.conversations.is_empty() {
                return;
            }
            serde_json::to_string(&state.conversations)
        };
        match encoded {
            Ok(encoded) => {
                self.mirror_store(&MirrorKey::Conversations(user_id.clone()), &encoded)
                    .await
            }
            Err(err) => warn!(error = %err, "could not encode conversation list for the mirror"),
        }
    }

    async fn mirror_load(&self, key: &MirrorKey) -> Option<String> {
        match self.mirror.load(key).await {
            Ok(value) => value,
            Err(err) => {
                warn!(key = %key.storage_key(), error = %err, "offline mirror read failed");
                None
            }
        }
    }

    async fn mirror_store(&self, key: &MirrorKey, value: &str) {
        if let Err(err) = self.mirror.store(key, value).await {
            warn!(key = %key.storage_key(), error = %err, "offline mirror write failed");
        }
    }

    async fn mirror_remove(&self, key: &MirrorKey) {
        if let Err(err) = self.mirror.remove(key).await {
            warn!(key = %key.storage_key(), error = %err, "offline mirror delete failed");
        }
    }

    async fn local_user_id(&self) -> Result<UserId, ClientError> {
        self.state
            .lock()
            .await
            .local_user_id()
            .cloned()
            .ok_or(ClientError::NotAuthenticated)
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
