//! Conversation and message state.
//!
//! The store owns the ordered conversation list, each conversation's message
//! sequence and the active-conversation pointer. It is mutated only by the
//! orchestrator, one event at a time.
//!
//! Message order within a conversation is client insertion order. Server
//! echoes of optimistic sends are folded into the optimistic entry instead of
//! being inserted a second time (see [`ConversationStore::append_message`]).

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::time::Instant;
use tracing::debug;

use crate::config::ReconcileConfig;
use crate::models::{Conversation, Message, MessageStatus};

/// What `append_message` did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// A new entry was added at the end of the sequence.
    Inserted,
    /// An unconfirmed optimistic entry was rebound to the server id.
    Reconciled { local_id: String },
    /// The server id was already present (duplicate delivery).
    Duplicate,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message: Message,
    /// Monotonic insertion stamp, shared across conversations.
    seq: u64,
    /// Client clock at insertion; the reconciliation window is measured from here.
    inserted_at: Instant,
}

#[derive(Debug)]
pub struct ConversationStore {
    conversations: Vec<Conversation>,
    messages: HashMap<String, Vec<StoredMessage>>,
    active: Option<String>,
    next_seq: u64,
    reconcile: ReconcileConfig,
}

impl ConversationStore {
    pub fn new(reconcile: ReconcileConfig) -> Self {
        Self {
            conversations: Vec::new(),
            messages: HashMap::new(),
            active: None,
            next_seq: 0,
            reconcile,
        }
    }

    // ── conversations ───────────────────────────────────────────────────

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.conversations.iter().position(|c| c.id == id)
    }

    /// Update a known conversation in place, or add a new one at the front
    /// (newest first).
    pub fn upsert_conversation(&mut self, conversation: Conversation) {
        match self.position(&conversation.id) {
            Some(idx) => self.conversations[idx] = conversation,
            None => self.conversations.insert(0, conversation),
        }
    }

    /// Adopt the server's conversation list and its order. Messages of
    /// conversations that disappeared are dropped; the active pointer is
    /// cleared if its conversation is gone.
    pub fn replace_conversations(&mut self, conversations: Vec<Conversation>) {
        let keep: HashSet<&str> = conversations.iter().map(|c| c.id.as_str()).collect();
        self.messages.retain(|id, _| keep.contains(id.as_str()));
        if self
            .active
            .as_deref()
            .is_some_and(|id| !keep.contains(id))
        {
            self.active = None;
        }
        self.conversations = conversations;
    }

    /// Remove a conversation and its messages. Returns the list position it
    /// occupied.
    pub fn remove_conversation(&mut self, id: &str) -> Option<usize> {
        let idx = self.position(id)?;
        self.conversations.remove(idx);
        self.messages.remove(id);
        if self.active.as_deref() == Some(id) {
            self.active = None;
        }
        Some(idx)
    }

    /// Make sure a conversation exists before a pushed message lands in it.
    /// Returns true if a placeholder had to be synthesized.
    pub fn ensure_conversation(&mut self, id: &str, seen_at: DateTime<Utc>) -> bool {
        if self.contains(id) {
            return false;
        }
        debug!(conversation = %id, "synthesizing conversation for pushed message");
        self.conversations
            .insert(0, Conversation::placeholder(id, seen_at));
        true
    }

    /// Record activity: bump the timestamp, optionally the count, and move
    /// the conversation to the front of the list.
    fn touch(&mut self, id: &str, at: DateTime<Utc>, new_message: bool) {
        let Some(idx) = self.position(id) else {
            return;
        };
        let mut conversation = self.conversations.remove(idx);
        if at > conversation.updated_at {
            conversation.updated_at = at;
        }
        if new_message {
            conversation.message_count += 1;
        }
        self.conversations.insert(0, conversation);
    }

    // ── active selection ────────────────────────────────────────────────

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Point the selector at a known conversation, or at none. Returns false
    /// (and leaves the selector alone) for unknown ids.
    pub fn set_active(&mut self, id: Option<&str>) -> bool {
        match id {
            Some(id) if !self.contains(id) => false,
            Some(id) => {
                self.active = Some(id.to_string());
                true
            }
            None => {
                self.active = None;
                true
            }
        }
    }

    // ── messages ────────────────────────────────────────────────────────

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.messages
            .get(conversation_id)
            .map(|entries| entries.iter().map(|e| e.message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn active_messages(&self) -> Vec<Message> {
        self.active
            .as_deref()
            .map(|id| self.messages(id))
            .unwrap_or_default()
    }

    pub fn find_message(&self, message_id: &str) -> Option<&Message> {
        self.messages
            .values()
            .flatten()
            .map(|e| &e.message)
            .find(|m| m.id == message_id)
    }

    pub fn has_pending(&self, conversation_id: &str) -> bool {
        self.messages
            .get(conversation_id)
            .is_some_and(|entries| entries.iter().any(|e| e.message.is_unconfirmed()))
    }

    /// Stamp for a history load issued now; entries inserted from here on
    /// survive the load's result.
    pub fn current_seq(&self) -> u64 {
        self.next_seq
    }

    fn stamp(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn append_message(&mut self, conversation_id: &str, message: Message) -> AppendOutcome {
        self.append_message_at(conversation_id, message, Instant::now())
    }

    /// Append a message to a conversation's sequence.
    ///
    /// Local optimistic messages (`Pending`/`NotSent`) are always inserted.
    /// A server message is first matched by id (duplicate delivery), then
    /// against the oldest unconfirmed entry with the same role and content
    /// inserted within the reconciliation window; only if both fail is it
    /// inserted. Two identical sends inside the window can be claimed in
    /// either order; the resulting sequence is the same.
    pub fn append_message_at(
        &mut self,
        conversation_id: &str,
        mut message: Message,
        now: Instant,
    ) -> AppendOutcome {
        message.conversation_id = conversation_id.to_string();
        let timestamp = message.timestamp;

        if message.status == MessageStatus::Confirmed {
            let reconcile = self.reconcile.clone();
            let entries = self.messages.entry(conversation_id.to_string()).or_default();

            if let Some(existing) = entries.iter_mut().find(|e| e.message.id == message.id) {
                if message.metadata.is_some() {
                    existing.message.metadata = message.metadata;
                }
                existing.message.status = MessageStatus::Confirmed;
                return AppendOutcome::Duplicate;
            }

            if let Some(pending) = entries.iter_mut().find(|e| {
                e.message.is_unconfirmed()
                    && e.message.role == message.role
                    && content_matches(&reconcile, &e.message.content, &message.content)
                    && now.saturating_duration_since(e.inserted_at) <= reconcile.window
            }) {
                let local_id = std::mem::replace(&mut pending.message.id, message.id);
                pending.message.timestamp = message.timestamp;
                pending.message.metadata = message.metadata;
                pending.message.status = MessageStatus::Confirmed;
                // Confirmed now: a history load issued before this point may
                // not contain it yet.
                pending.seq = self.next_seq;
                self.next_seq += 1;
                debug!(
                    conversation = %conversation_id,
                    local_id = %local_id,
                    server_id = %pending.message.id,
                    "reconciled optimistic message"
                );
                self.touch(conversation_id, timestamp, false);
                return AppendOutcome::Reconciled { local_id };
            }
        }

        let seq = self.stamp();
        self.messages
            .entry(conversation_id.to_string())
            .or_default()
            .push(StoredMessage {
                message,
                seq,
                inserted_at: now,
            });
        self.touch(conversation_id, timestamp, true);
        AppendOutcome::Inserted
    }

    /// Overwrite a conversation's sequence with a full history load.
    pub fn replace_messages(&mut self, conversation_id: &str, sequence: Vec<Message>) {
        let now = Instant::now();
        let entries = sequence
            .into_iter()
            .map(|mut message| {
                message.conversation_id = conversation_id.to_string();
                StoredMessage {
                    message,
                    seq: self.stamp(),
                    inserted_at: now,
                }
            })
            .collect();
        self.messages.insert(conversation_id.to_string(), entries);
    }

    /// Apply a history load issued at stamp `issued_at` without losing local
    /// state the load could not have seen.
    ///
    /// The result is the loaded sequence in server order, followed by local
    /// entries absent from it that are still optimistic (pending or not sent)
    /// or were inserted after the load was issued. A pending entry whose
    /// role and content match a loaded message not already known locally is
    /// collapsed into it.
    pub fn apply_history(&mut self, conversation_id: &str, loaded: Vec<Message>, issued_at: u64) {
        let now = Instant::now();
        let previous = self.messages.remove(conversation_id).unwrap_or_default();
        let loaded_ids: HashSet<&str> = loaded.iter().map(|m| m.id.as_str()).collect();
        let known_ids: HashSet<&str> = previous.iter().map(|e| e.message.id.as_str()).collect();
        let window = chrono::Duration::from_std(self.reconcile.window)
            .unwrap_or(chrono::Duration::MAX);

        let mut claimed: HashSet<&str> = HashSet::new();
        let mut survivors = Vec::new();
        for entry in &previous {
            if loaded_ids.contains(entry.message.id.as_str()) {
                continue;
            }
            match entry.message.status {
                MessageStatus::Pending => {
                    let echo = loaded.iter().find(|m| {
                        !known_ids.contains(m.id.as_str())
                            && !claimed.contains(m.id.as_str())
                            && m.role == entry.message.role
                            && content_matches(&self.reconcile, &m.content, &entry.message.content)
                            && entry
                                .message
                                .timestamp
                                .checked_sub_signed(window)
                                .is_none_or(|floor| m.timestamp >= floor)
                    });
                    match echo {
                        Some(m) => {
                            claimed.insert(m.id.as_str());
                        }
                        None => survivors.push(entry.clone()),
                    }
                }
                MessageStatus::NotSent => survivors.push(entry.clone()),
                MessageStatus::Confirmed if entry.seq >= issued_at => {
                    survivors.push(entry.clone())
                }
                MessageStatus::Confirmed => {}
            }
        }

        let collapsed = claimed.len();
        let mut merged: Vec<StoredMessage> = Vec::with_capacity(loaded.len() + survivors.len());
        for mut message in loaded {
            message.conversation_id = conversation_id.to_string();
            let seq = self.stamp();
            merged.push(StoredMessage {
                message,
                seq,
                inserted_at: now,
            });
        }
        let kept = survivors.len();
        merged.extend(survivors);
        debug!(
            conversation = %conversation_id,
            total = merged.len(),
            kept_local = kept,
            collapsed = collapsed,
            "applied history load"
        );
        self.messages.insert(conversation_id.to_string(), merged);
    }

    pub fn set_status(
        &mut self,
        conversation_id: &str,
        message_id: &str,
        status: MessageStatus,
    ) -> bool {
        let Some(entry) = self
            .messages
            .get_mut(conversation_id)
            .and_then(|entries| entries.iter_mut().find(|e| e.message.id == message_id))
        else {
            return false;
        };
        entry.message.status = status;
        if status == MessageStatus::Pending {
            // A re-send opens a fresh reconciliation window.
            entry.inserted_at = Instant::now();
        }
        true
    }

    /// Forget everything (logout).
    pub fn clear(&mut self) {
        self.conversations.clear();
        self.messages.clear();
        self.active = None;
    }
}

fn content_matches(config: &ReconcileConfig, a: &str, b: &str) -> bool {
    if config.trim_whitespace {
        a.trim() == b.trim()
    } else {
        a == b
    }
}
