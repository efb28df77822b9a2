//! In-memory collaborators for driving the orchestrator without a network.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::{mpsc, oneshot, watch};

use chat_sync::config::{BackoffConfig, SyncConfig};
use chat_sync::connection::ConnectionManager;
use chat_sync::connection::memory::{MemoryConnector, MemoryPeer};
use chat_sync::models::{Conversation, Credential, Message, Role};
use chat_sync::protocol::{ClientEvent, ServerEvent};
use chat_sync::{SyncError, SyncHandle, SyncOrchestrator, SyncResult, SyncSnapshot};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(300);

// ── channel ─────────────────────────────────────────────────────────────

/// Server end of one established channel, with test-friendly waits.
pub struct FakeServer(MemoryPeer);

impl FakeServer {
    pub fn push(&self, event: ServerEvent) {
        assert!(self.0.push(&event), "client closed channel");
    }

    pub fn push_message(&self, message: Message) {
        self.push(ServerEvent::MessageReceived(message));
    }

    /// Next frame the client sent, waiting for it.
    pub async fn recv(&mut self) -> ClientEvent {
        tokio::time::timeout(TEST_TIMEOUT, self.0.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("client closed channel")
    }

    /// Frames the client sent that have not been read yet.
    pub fn drain(&mut self) -> Vec<ClientEvent> {
        self.0.drain()
    }
}

// ── request/response ────────────────────────────────────────────────────

#[derive(Default)]
struct ApiState {
    conversations: Vec<Conversation>,
    messages: HashMap<String, Vec<Message>>,
    load_gates: HashMap<String, oneshot::Receiver<()>>,
    list_gates: VecDeque<oneshot::Receiver<()>>,
    reject_credential: bool,
    fail_create: bool,
    created: u32,
    loads: Vec<String>,
}

/// Scriptable server state behind [`chat_sync::ConversationApi`].
#[derive(Default)]
pub struct FakeApi {
    state: Mutex<ApiState>,
}

impl FakeApi {
    pub fn with_conversations(ids: &[&str]) -> Arc<Self> {
        let api = Self::default();
        {
            let mut state = api.state.lock().unwrap();
            // listed newest first
            for (i, id) in ids.iter().enumerate() {
                state.conversations.push(conversation(id, 100 - i as i64));
            }
        }
        Arc::new(api)
    }

    pub fn set_messages(&self, conversation_id: &str, messages: Vec<Message>) {
        self.state
            .lock()
            .unwrap()
            .messages
            .insert(conversation_id.to_string(), messages);
    }

    /// Hold the next history load of `conversation_id` until the returned
    /// sender fires (or is dropped).
    pub fn hold_load(&self, conversation_id: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.state
            .lock()
            .unwrap()
            .load_gates
            .insert(conversation_id.to_string(), rx);
        tx
    }

    /// Hold the next conversation list not yet gated. The list answers with
    /// the conversations that existed when it was requested.
    pub fn hold_list(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().unwrap().list_gates.push_back(rx);
        tx
    }

    /// Server-side conversation the client has not listed yet.
    pub fn add_conversation(&self, conversation: Conversation) {
        self.state.lock().unwrap().conversations.insert(0, conversation);
    }

    /// Remove a conversation behind the client's back.
    pub fn delete_conversation_directly(&self, conversation_id: &str) {
        self.state
            .lock()
            .unwrap()
            .conversations
            .retain(|c| c.id != conversation_id);
    }

    pub fn reject_credential(&self, reject: bool) {
        self.state.lock().unwrap().reject_credential = reject;
    }

    pub fn fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    /// Conversation ids whose history was requested, in request order.
    pub fn loads(&self) -> Vec<String> {
        self.state.lock().unwrap().loads.clone()
    }

    fn check(&self) -> SyncResult<()> {
        if self.state.lock().unwrap().reject_credential {
            Err(SyncError::SessionInvalid)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl chat_sync::ConversationApi for FakeApi {
    async fn list_conversations(&self, _credential: &Credential) -> SyncResult<Vec<Conversation>> {
        self.check()?;
        let (conversations, gate) = {
            let mut state = self.state.lock().unwrap();
            (state.conversations.clone(), state.list_gates.pop_front())
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Ok(conversations)
    }

    async fn create_conversation(
        &self,
        _credential: &Credential,
        title: Option<&str>,
    ) -> SyncResult<Conversation> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        if state.fail_create {
            return Err(SyncError::Network("connection reset".into()));
        }
        state.created += 1;
        let mut conv = conversation(&format!("new-{}", state.created), 1000);
        if let Some(title) = title {
            conv.title = title.to_string();
        }
        state.conversations.insert(0, conv.clone());
        Ok(conv)
    }

    async fn load_messages(
        &self,
        _credential: &Credential,
        conversation_id: &str,
    ) -> SyncResult<Vec<Message>> {
        self.check()?;
        let gate = {
            let mut state = self.state.lock().unwrap();
            state.loads.push(conversation_id.to_string());
            state.load_gates.remove(conversation_id)
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Ok(self
            .state
            .lock()
            .unwrap()
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_conversation(
        &self,
        _credential: &Credential,
        conversation_id: &str,
    ) -> SyncResult<()> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let before = state.conversations.len();
        state.conversations.retain(|c| c.id != conversation_id);
        if state.conversations.len() == before {
            return Err(SyncError::Status {
                status: 404,
                body: "Conversation not found".into(),
            });
        }
        Ok(())
    }
}

// ── fixtures ────────────────────────────────────────────────────────────

pub fn conversation(id: &str, minutes: i64) -> Conversation {
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(minutes);
    Conversation {
        id: id.to_string(),
        title: format!("Conversation {id}"),
        created_at: Some(at),
        updated_at: at,
        message_count: 0,
        context: None,
    }
}

pub fn server_message(id: &str, conversation_id: &str, role: Role, content: &str) -> Message {
    Message {
        id: id.to_string(),
        content: content.to_string(),
        role,
        timestamp: Utc::now(),
        conversation_id: conversation_id.to_string(),
        metadata: None,
        status: Default::default(),
    }
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        backoff: BackoffConfig {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(8),
            max_attempts: None,
        },
        ..SyncConfig::default()
    }
}

pub struct Harness {
    pub handle: SyncHandle,
    pub api: Arc<FakeApi>,
    pub connector: Arc<MemoryConnector>,
    pub connection: Arc<ConnectionManager>,
    pub peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl Harness {
    pub async fn new(api: Arc<FakeApi>) -> Self {
        let config = test_config();
        let (connector, peers) = MemoryConnector::new();
        let connection = Arc::new(ConnectionManager::new(
            connector.clone(),
            config.backoff.clone(),
        ));
        let handle = SyncOrchestrator::spawn(api.clone(), connection.clone(), &config).await;
        Self {
            handle,
            api,
            connector,
            connection,
            peers,
        }
    }

    /// Log in and wait until the channel is up.
    pub async fn login(&mut self) -> FakeServer {
        self.handle.login(Credential::new("token")).await.unwrap();
        self.wait_for(|s| s.connection == chat_sync::ConnectionState::Connected)
            .await;
        self.next_server().await
    }

    pub async fn next_server(&mut self) -> FakeServer {
        let peer = tokio::time::timeout(TEST_TIMEOUT, self.peers.recv())
            .await
            .expect("timed out waiting for channel")
            .expect("connector gone");
        FakeServer(peer)
    }

    pub async fn wait_for(&self, pred: impl FnMut(&SyncSnapshot) -> bool) -> SyncSnapshot {
        wait_snapshot(&mut self.handle.subscribe_snapshots(), pred).await
    }
}

pub async fn wait_snapshot(
    rx: &mut watch::Receiver<SyncSnapshot>,
    pred: impl FnMut(&SyncSnapshot) -> bool,
) -> SyncSnapshot {
    tokio::time::timeout(TEST_TIMEOUT, rx.wait_for(pred))
        .await
        .expect("timed out waiting for snapshot")
        .expect("orchestrator gone")
        .clone()
}

/// Let every runnable task finish its work. Relies on a paused clock: the
/// runtime only advances time once nothing else can make progress.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
