//! SyncOrchestrator: the single task that arbitrates races between user
//! actions, request/response results and pushed channel events.
//!
//! The actor owns the [`ConversationStore`] and [`TypingTracker`] and is the
//! only code that mutates them. Request/response calls run in spawned tasks
//! and post their results back as completions; nothing blocks the loop.
//! Readers observe state through [`SyncSnapshot`]s published on a `watch`
//! channel after every processed event.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::connection::{ConnectionManager, ConnectionState, EventSubscription, WsConnector};
use crate::error::{SyncError, SyncResult};
use crate::history::{ConversationApi, HistoryLoader};
use crate::models::{Conversation, Credential, Message, MessageStatus, Role};
use crate::protocol::{ClientEvent, EventKind, ServerEvent};
use crate::store::{AppendOutcome, ConversationStore};
use crate::typing::TypingTracker;

/// Everything the presentation layer renders.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncSnapshot {
    pub conversations: Vec<Conversation>,
    pub active_conversation_id: Option<String>,
    pub active_messages: Vec<Message>,
    /// Typing indicator of the active conversation.
    pub is_typing: bool,
    pub connection: ConnectionState,
    /// A history load for the active conversation is in flight.
    pub loading_messages: bool,
    pub last_error: Option<String>,
}

/// One-off events the presentation layer may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotice {
    /// The server rejected the credential; the auth owner must act.
    SessionInvalid,
    OperationFailed {
        operation: &'static str,
        error: String,
    },
    MessageNotSent {
        conversation_id: String,
        message_id: String,
    },
    /// `error` event pushed over the channel.
    ServerError { message: String },
}

enum Command {
    Login {
        credential: Credential,
        respond_to: oneshot::Sender<SyncResult<()>>,
    },
    Logout {
        respond_to: oneshot::Sender<()>,
    },
    RefreshConversations {
        respond_to: oneshot::Sender<SyncResult<()>>,
    },
    SelectConversation {
        conversation_id: String,
        respond_to: oneshot::Sender<SyncResult<()>>,
    },
    CreateConversation {
        title: Option<String>,
        respond_to: oneshot::Sender<SyncResult<Conversation>>,
    },
    DeleteConversation {
        conversation_id: String,
        respond_to: oneshot::Sender<SyncResult<()>>,
    },
    SendMessage {
        content: String,
        respond_to: oneshot::Sender<SyncResult<Message>>,
    },
    ResendMessage {
        message_id: String,
        respond_to: oneshot::Sender<SyncResult<Message>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

type MessageResponder = oneshot::Sender<SyncResult<Message>>;

/// What to do once a requested conversation exists.
enum AfterCreate {
    Select {
        respond_to: oneshot::Sender<SyncResult<Conversation>>,
    },
    /// Deliver the sends queued in `first_sends`.
    FirstSend,
}

/// Result of a request/response call, posted back into the actor.
enum Completion {
    ConversationsListed {
        stamp: u64,
        result: SyncResult<Vec<Conversation>>,
        select_first: bool,
        respond_to: Option<oneshot::Sender<SyncResult<()>>>,
    },
    MessagesLoaded {
        stamp: u64,
        conversation_id: String,
        /// Store sequence at the time the load was issued.
        issued_at: u64,
        result: SyncResult<Vec<Message>>,
    },
    ConversationCreated {
        result: SyncResult<Conversation>,
        then: AfterCreate,
    },
    ConversationDeleted {
        conversation_id: String,
        result: SyncResult<()>,
        respond_to: oneshot::Sender<SyncResult<()>>,
    },
}

impl Completion {
    /// Complete the caller of a result that arrived after its session ended.
    fn abandon(self) {
        match self {
            Completion::ConversationsListed {
                respond_to: Some(tx),
                ..
            } => {
                let _ = tx.send(Err(SyncError::NoCredential));
            }
            Completion::ConversationCreated {
                then: AfterCreate::Select { respond_to },
                ..
            } => {
                let _ = respond_to.send(Err(SyncError::NoCredential));
            }
            Completion::ConversationDeleted { respond_to, .. } => {
                let _ = respond_to.send(Err(SyncError::NoCredential));
            }
            _ => {}
        }
    }
}

struct Tagged {
    /// Login session the request belongs to.
    epoch: u64,
    completion: Completion,
}

/// Handle to the orchestrator actor. Cheap to clone.
#[derive(Clone)]
pub struct SyncHandle {
    sender: mpsc::Sender<Command>,
    snapshots: watch::Receiver<SyncSnapshot>,
    notices: broadcast::Sender<SyncNotice>,
}

impl SyncHandle {
    /// Build the production stack (HTTP loader and WebSocket channel) from
    /// configuration and start the actor.
    pub async fn start(config: &SyncConfig) -> SyncResult<Self> {
        let api = Arc::new(HistoryLoader::new(&config.api_url, config.request_timeout)?);
        let connection = Arc::new(ConnectionManager::new(
            Arc::new(WsConnector::new(config.ws_url.clone())),
            config.backoff.clone(),
        ));
        Ok(SyncOrchestrator::spawn(api, connection, config).await)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> SyncResult<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| SyncError::ActorGone)?;
        rx.await.map_err(|_| SyncError::ActorGone)
    }

    /// Adopt a credential: connect the channel and load the conversation
    /// list, selecting the first conversation if none is active.
    pub async fn login(&self, credential: Credential) -> SyncResult<()> {
        self.request(|respond_to| Command::Login {
            credential,
            respond_to,
        })
        .await?
    }

    /// Drop the credential, disconnect and forget all state.
    pub async fn logout(&self) -> SyncResult<()> {
        self.request(|respond_to| Command::Logout { respond_to }).await
    }

    pub async fn refresh_conversations(&self) -> SyncResult<()> {
        self.request(|respond_to| Command::RefreshConversations { respond_to })
            .await?
    }

    /// Switch the active conversation and issue its history load. Returns
    /// once the switch is visible; the load completes in the background.
    pub async fn select_conversation(&self, conversation_id: &str) -> SyncResult<()> {
        self.request(|respond_to| Command::SelectConversation {
            conversation_id: conversation_id.to_string(),
            respond_to,
        })
        .await?
    }

    /// Create a conversation and make it active.
    pub async fn create_conversation(&self, title: Option<&str>) -> SyncResult<Conversation> {
        self.request(|respond_to| Command::CreateConversation {
            title: title.map(str::to_string),
            respond_to,
        })
        .await?
    }

    pub async fn delete_conversation(&self, conversation_id: &str) -> SyncResult<()> {
        self.request(|respond_to| Command::DeleteConversation {
            conversation_id: conversation_id.to_string(),
            respond_to,
        })
        .await?
    }

    /// Send a user message to the active conversation (creating one first if
    /// none is active). Returns the local entry: `Pending` if it was handed
    /// to the channel, `NotSent` otherwise.
    pub async fn send_message(&self, content: &str) -> SyncResult<Message> {
        self.request(|respond_to| Command::SendMessage {
            content: content.to_string(),
            respond_to,
        })
        .await?
    }

    /// Retry a `NotSent` message.
    pub async fn resend_message(&self, message_id: &str) -> SyncResult<Message> {
        self.request(|respond_to| Command::ResendMessage {
            message_id: message_id.to_string(),
            respond_to,
        })
        .await?
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshots.clone()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    /// Stop the actor and tear down the channel.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.request(|respond_to| Command::Shutdown { respond_to })
            .await
    }
}

pub struct SyncOrchestrator {
    api: Arc<dyn ConversationApi>,
    connection: Arc<ConnectionManager>,
    store: ConversationStore,
    typing: TypingTracker,
    credential: Option<Credential>,
    /// Bumped on logout and on credential change; completions from older
    /// epochs are dropped.
    epoch: u64,
    /// Last issued history-load stamp.
    load_stamp: u64,
    /// The one history load whose result may still be applied.
    pending_load: Option<(u64, String)>,
    /// Sends waiting for the conversation created on their behalf.
    first_sends: Option<Vec<(String, MessageResponder)>>,
    /// Last issued conversation-list stamp.
    list_stamp: u64,
    /// Stamp of the newest list result applied; older results are dropped.
    applied_list: u64,
    /// Conversations learned locally, with the list stamp current when they
    /// were learned. A list issued at or before that stamp cannot know them.
    fresh_conversations: Vec<(String, u64)>,
    last_error: Option<String>,
    commands: mpsc::Receiver<Command>,
    completions_tx: mpsc::UnboundedSender<Tagged>,
    completions_rx: mpsc::UnboundedReceiver<Tagged>,
    snapshot_tx: watch::Sender<SyncSnapshot>,
    notice_tx: broadcast::Sender<SyncNotice>,
}

impl SyncOrchestrator {
    /// Start the actor on the given collaborators.
    pub async fn spawn(
        api: Arc<dyn ConversationApi>,
        connection: Arc<ConnectionManager>,
        config: &SyncConfig,
    ) -> SyncHandle {
        let events = connection.subscribe_many(&EventKind::ALL).await;
        let (sender, commands) = mpsc::channel(64);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshots) = watch::channel(SyncSnapshot::default());
        let (notice_tx, _) = broadcast::channel(64);

        let actor = Self {
            api,
            connection,
            store: ConversationStore::new(config.reconcile.clone()),
            typing: TypingTracker::new(config.typing_decay),
            credential: None,
            epoch: 0,
            load_stamp: 0,
            pending_load: None,
            list_stamp: 0,
            applied_list: 0,
            first_sends: None,
            fresh_conversations: Vec::new(),
            last_error: None,
            commands,
            completions_tx,
            completions_rx,
            snapshot_tx,
            notice_tx: notice_tx.clone(),
        };
        tokio::spawn(actor.run(events));

        SyncHandle {
            sender,
            snapshots,
            notices: notice_tx,
        }
    }

    async fn run(mut self, mut events: EventSubscription) {
        let mut state_rx = self.connection.watch_state();
        self.publish();

        loop {
            let typing_deadline = self.typing.next_deadline();
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown { respond_to }) => {
                        self.connection.disconnect().await;
                        self.fail_first_sends(SyncError::ActorGone);
                        let _ = respond_to.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.connection.disconnect().await;
                        break;
                    }
                },
                Some(tagged) = self.completions_rx.recv() => self.handle_completion(tagged).await,
                Some(event) = events.recv() => self.handle_event(event),
                Ok(()) = state_rx.changed() => {
                    debug!(state = ?*state_rx.borrow_and_update(), "connection state changed");
                }
                _ = sleep_until(typing_deadline) => {
                    let expired = self.typing.expire_due(tokio::time::Instant::now());
                    debug!(conversations = ?expired, "typing indicator decayed");
                }
            }
            self.publish();
        }
        info!("sync orchestrator stopped");
    }

    // ── commands ────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Login {
                credential,
                respond_to,
            } => {
                self.last_error = None;
                if self.credential.as_ref().is_some_and(|c| *c != credential) {
                    info!("credential changed, resetting session state");
                    self.reset_session();
                }
                self.credential = Some(credential.clone());
                self.connection.connect(credential).await;
                self.issue_list(true, Some(respond_to));
            }
            Command::Logout { respond_to } => {
                info!("logging out");
                self.connection.disconnect().await;
                self.credential = None;
                self.reset_session();
                self.last_error = None;
                let _ = respond_to.send(());
            }
            Command::RefreshConversations { respond_to } => {
                self.last_error = None;
                if self.credential.is_none() {
                    let _ = respond_to.send(Err(SyncError::NoCredential));
                    return;
                }
                self.issue_list(false, Some(respond_to));
            }
            Command::SelectConversation {
                conversation_id,
                respond_to,
            } => {
                self.last_error = None;
                let _ = respond_to.send(self.select(&conversation_id));
            }
            Command::CreateConversation { title, respond_to } => {
                self.last_error = None;
                if self.credential.is_none() {
                    let _ = respond_to.send(Err(SyncError::NoCredential));
                    return;
                }
                self.issue_create(title, AfterCreate::Select { respond_to });
            }
            Command::DeleteConversation {
                conversation_id,
                respond_to,
            } => {
                self.last_error = None;
                let Some(credential) = self.credential.clone() else {
                    let _ = respond_to.send(Err(SyncError::NoCredential));
                    return;
                };
                if !self.store.contains(&conversation_id) {
                    let _ = respond_to.send(Err(SyncError::ConversationNotFound(conversation_id)));
                    return;
                }
                let api = self.api.clone();
                self.spawn_request(async move {
                    let result = api.delete_conversation(&credential, &conversation_id).await;
                    Completion::ConversationDeleted {
                        conversation_id,
                        result,
                        respond_to,
                    }
                });
            }
            Command::SendMessage {
                content,
                respond_to,
            } => {
                self.last_error = None;
                if content.trim().is_empty() {
                    let _ = respond_to.send(Err(SyncError::EmptyMessage));
                    return;
                }
                if self.credential.is_none() {
                    let _ = respond_to.send(Err(SyncError::NoCredential));
                    return;
                }
                match self.store.active().map(str::to_string) {
                    Some(conversation_id) => {
                        let message = self.deliver_message(&conversation_id, content).await;
                        let _ = respond_to.send(Ok(message));
                    }
                    None => match self.first_sends.as_mut() {
                        // A conversation is already being created for an
                        // earlier send; queue behind it.
                        Some(queue) => queue.push((content, respond_to)),
                        None => {
                            debug!("no active conversation, creating one for first send");
                            self.first_sends = Some(vec![(content, respond_to)]);
                            self.issue_create(None, AfterCreate::FirstSend);
                        }
                    },
                }
            }
            Command::ResendMessage {
                message_id,
                respond_to,
            } => {
                self.last_error = None;
                let result = self.resend(&message_id).await;
                let _ = respond_to.send(result);
            }
            Command::Shutdown { .. } => {}
        }
    }

    fn select_first(&mut self) {
        let first = self.store.conversations().first().map(|c| c.id.clone());
        if let Some(id) = first {
            let _ = self.select(&id);
        }
    }

    fn select(&mut self, conversation_id: &str) -> SyncResult<()> {
        if !self.store.set_active(Some(conversation_id)) {
            return Err(SyncError::ConversationNotFound(conversation_id.to_string()));
        }
        debug!(conversation = %conversation_id, "selected conversation");
        self.issue_load(conversation_id.to_string());
        Ok(())
    }

    /// Hand a new user message to the channel and record it locally.
    async fn deliver_message(&mut self, conversation_id: &str, content: String) -> Message {
        let mut message = Message::optimistic(conversation_id, &content);
        let sent = self
            .connection
            .send(&ClientEvent::send_message(conversation_id, &content))
            .await;

        if sent {
            // The assistant is expected to answer; show it until a real
            // signal or reply supersedes it.
            self.typing.set_typing(conversation_id, true);
        } else {
            message.status = MessageStatus::NotSent;
            warn!(conversation = %conversation_id, message = %message.id, "channel down, message not sent");
            self.notify(SyncNotice::MessageNotSent {
                conversation_id: conversation_id.to_string(),
                message_id: message.id.clone(),
            });
        }
        self.store.append_message(conversation_id, message.clone());
        message
    }

    async fn resend(&mut self, message_id: &str) -> SyncResult<Message> {
        let Some(message) = self.store.find_message(message_id).cloned() else {
            return Err(SyncError::MessageNotFound(message_id.to_string()));
        };
        if message.status != MessageStatus::NotSent {
            return Ok(message);
        }

        let conversation_id = message.conversation_id.clone();
        let sent = self
            .connection
            .send(&ClientEvent::send_message(&conversation_id, &message.content))
            .await;
        if !sent {
            self.notify(SyncNotice::MessageNotSent {
                conversation_id,
                message_id: message.id.clone(),
            });
            return Ok(message);
        }

        self.store
            .set_status(&conversation_id, message_id, MessageStatus::Pending);
        self.typing.set_typing(&conversation_id, true);
        debug!(conversation = %conversation_id, message = %message_id, "re-sent message");
        Ok(Message {
            status: MessageStatus::Pending,
            ..message
        })
    }

    // ── outgoing requests ───────────────────────────────────────────────

    fn spawn_request<F>(&self, request: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let tx = self.completions_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let completion = request.await;
            let _ = tx.send(Tagged { epoch, completion });
        });
    }

    fn issue_list(
        &mut self,
        select_first: bool,
        respond_to: Option<oneshot::Sender<SyncResult<()>>>,
    ) {
        let Some(credential) = self.credential.clone() else {
            if let Some(tx) = respond_to {
                let _ = tx.send(Err(SyncError::NoCredential));
            }
            return;
        };
        self.list_stamp += 1;
        let stamp = self.list_stamp;
        debug!(stamp, "listing conversations");
        let api = self.api.clone();
        self.spawn_request(async move {
            let result = api.list_conversations(&credential).await;
            Completion::ConversationsListed {
                stamp,
                result,
                select_first,
                respond_to,
            }
        });
    }

    fn issue_load(&mut self, conversation_id: String) {
        let Some(credential) = self.credential.clone() else {
            self.pending_load = None;
            return;
        };
        self.load_stamp += 1;
        let stamp = self.load_stamp;
        let issued_at = self.store.current_seq();
        self.pending_load = Some((stamp, conversation_id.clone()));
        debug!(conversation = %conversation_id, stamp, "loading history");

        let api = self.api.clone();
        self.spawn_request(async move {
            let result = api.load_messages(&credential, &conversation_id).await;
            Completion::MessagesLoaded {
                stamp,
                conversation_id,
                issued_at,
                result,
            }
        });
    }

    fn issue_create(&mut self, title: Option<String>, then: AfterCreate) {
        let Some(credential) = self.credential.clone() else {
            return;
        };
        let api = self.api.clone();
        self.spawn_request(async move {
            let result = api.create_conversation(&credential, title.as_deref()).await;
            Completion::ConversationCreated { result, then }
        });
    }

    // ── completions ─────────────────────────────────────────────────────

    async fn handle_completion(&mut self, tagged: Tagged) {
        if tagged.epoch != self.epoch {
            debug!(epoch = tagged.epoch, current = self.epoch, "dropping result from ended session");
            tagged.completion.abandon();
            return;
        }

        match tagged.completion {
            Completion::ConversationsListed {
                stamp,
                result,
                select_first,
                respond_to,
            } => {
                let reply = match result {
                    Ok(_) if stamp < self.applied_list => {
                        debug!(stamp, applied = self.applied_list, "discarding stale conversation list");
                        if select_first && self.store.active().is_none() {
                            self.select_first();
                        }
                        Ok(())
                    }
                    Ok(mut conversations) => {
                        self.applied_list = stamp;
                        // Keep conversations the list request could not have seen.
                        self.fresh_conversations.retain(|(_, learned)| *learned >= stamp);
                        for (id, _) in &self.fresh_conversations {
                            if conversations.iter().any(|c| &c.id == id) {
                                continue;
                            }
                            if let Some(local) = self.store.conversation(id) {
                                conversations.insert(0, local.clone());
                            }
                        }
                        let had_active = self.store.active().is_some();
                        self.store.replace_conversations(conversations);
                        if had_active && self.store.active().is_none() {
                            // The active conversation vanished server-side.
                            self.pending_load = None;
                        }
                        if select_first && self.store.active().is_none() {
                            self.select_first();
                        }
                        Ok(())
                    }
                    Err(e) => {
                        self.report_failure("list_conversations", &e);
                        Err(e)
                    }
                };
                if let Some(tx) = respond_to {
                    let _ = tx.send(reply);
                }
            }
            Completion::MessagesLoaded {
                stamp,
                conversation_id,
                issued_at,
                result,
            } => {
                let current = self
                    .pending_load
                    .as_ref()
                    .is_some_and(|(s, id)| *s == stamp && *id == conversation_id)
                    && self.store.active() == Some(conversation_id.as_str());
                if !current {
                    debug!(conversation = %conversation_id, stamp, "discarding stale history load");
                    return;
                }
                self.pending_load = None;
                match result {
                    Ok(messages) => self.store.apply_history(&conversation_id, messages, issued_at),
                    Err(e) => self.report_failure("load_messages", &e),
                }
            }
            Completion::ConversationCreated { result, then } => match result {
                Ok(conversation) => {
                    let id = conversation.id.clone();
                    info!(conversation = %id, "conversation created");
                    self.store.upsert_conversation(conversation.clone());
                    self.fresh_conversations.push((id.clone(), self.list_stamp));
                    self.store.set_active(Some(&id));
                    // Nothing to load for a brand-new conversation.
                    self.pending_load = None;
                    match then {
                        AfterCreate::Select { respond_to } => {
                            let _ = respond_to.send(Ok(conversation));
                        }
                        AfterCreate::FirstSend => {
                            for (content, respond_to) in self.first_sends.take().unwrap_or_default() {
                                let message = self.deliver_message(&id, content).await;
                                let _ = respond_to.send(Ok(message));
                            }
                        }
                    }
                }
                Err(e) => {
                    self.report_failure("create_conversation", &e);
                    match then {
                        AfterCreate::Select { respond_to } => {
                            let _ = respond_to.send(Err(e));
                        }
                        AfterCreate::FirstSend => self.fail_first_sends(e),
                    }
                }
            },
            Completion::ConversationDeleted {
                conversation_id,
                result,
                respond_to,
            } => {
                if let Err(e) = result {
                    self.report_failure("delete_conversation", &e);
                    let _ = respond_to.send(Err(e));
                    return;
                }
                self.remove_conversation(&conversation_id);
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    /// Drop a deleted conversation. If it was active, the conversation now
    /// at its position (else the new last one) takes over in the same
    /// transition.
    fn remove_conversation(&mut self, conversation_id: &str) {
        let was_active = self.store.active() == Some(conversation_id);
        self.typing.clear(conversation_id);
        self.fresh_conversations.retain(|(id, _)| id != conversation_id);
        let Some(idx) = self.store.remove_conversation(conversation_id) else {
            return;
        };
        info!(conversation = %conversation_id, "conversation deleted");
        if !was_active {
            return;
        }

        let conversations = self.store.conversations();
        let next = conversations
            .get(idx)
            .or(conversations.last())
            .map(|c| c.id.clone());
        match next {
            Some(next) => {
                let _ = self.select(&next);
            }
            None => {
                self.store.set_active(None);
                self.pending_load = None;
            }
        }
    }

    fn fail_first_sends(&mut self, error: SyncError) {
        for (_, respond_to) in self.first_sends.take().unwrap_or_default() {
            let _ = respond_to.send(Err(error.clone()));
        }
    }

    // ── channel events ──────────────────────────────────────────────────

    fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::MessageReceived(message) => {
                let conversation_id = message.conversation_id.clone();
                let role = message.role;
                let synthesized = self
                    .store
                    .ensure_conversation(&conversation_id, message.timestamp);

                let outcome = self.store.append_message(&conversation_id, message);
                debug!(conversation = %conversation_id, outcome = ?outcome, "message received");
                if role == Role::Assistant && outcome != AppendOutcome::Duplicate {
                    self.typing.clear(&conversation_id);
                }
                if synthesized {
                    // Pick up the real title and metadata, keeping the
                    // placeholder should the list not include it yet.
                    self.issue_list(false, None);
                    self.fresh_conversations.push((conversation_id, self.list_stamp));
                }
            }
            ServerEvent::TypingIndicator {
                conversation_id,
                is_typing,
            } => {
                self.typing.set_typing(&conversation_id, is_typing);
            }
            ServerEvent::Error { message } => {
                warn!(error = %message, "server reported an error");
                self.last_error = Some(message.clone());
                self.notify(SyncNotice::ServerError { message });
            }
        }
    }

    // ── state ───────────────────────────────────────────────────────────

    fn reset_session(&mut self) {
        self.epoch += 1;
        self.store.clear();
        self.typing.clear_all();
        self.pending_load = None;
        self.fresh_conversations.clear();
        self.fail_first_sends(SyncError::NoCredential);
    }

    fn report_failure(&mut self, operation: &'static str, error: &SyncError) {
        warn!(operation, error = %error, "request failed");
        self.last_error = Some(error.to_string());
        if error.is_session_invalid() {
            self.notify(SyncNotice::SessionInvalid);
        } else {
            self.notify(SyncNotice::OperationFailed {
                operation,
                error: error.to_string(),
            });
        }
    }

    fn notify(&self, notice: SyncNotice) {
        // No receivers is fine.
        let _ = self.notice_tx.send(notice);
    }

    fn build_snapshot(&self) -> SyncSnapshot {
        let active = self.store.active().map(str::to_string);
        SyncSnapshot {
            conversations: self.store.conversations().to_vec(),
            active_messages: self.store.active_messages(),
            is_typing: active
                .as_deref()
                .is_some_and(|id| self.typing.is_typing(id)),
            active_conversation_id: active,
            connection: self.connection.state(),
            loading_messages: self.pending_load.is_some(),
            last_error: self.last_error.clone(),
        }
    }

    fn publish(&self) {
        let snapshot = self.build_snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
