//! Session and message state for one local identity.
//!
//! [`ChatStore`] is the synchronous half of the delivery state machine. It
//! performs no I/O; the chat service drives it around network calls. Message
//! lists are shared as `Arc<Vec<Message>>` and replaced copy-on-write, so a
//! snapshot handed to a reader never changes underneath it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::models::{
    session_id_for, Message, MessageId, MessageStatus, OutgoingMessage, Session,
};
use crate::storage::Cid;
use crate::types::{ChatError, DeliveryError, MAX_RETRIES};

/// Default length of session-list previews, in characters.
pub const DEFAULT_PREVIEW_LEN: usize = 80;

/// In-memory read model: sessions, per-session message lists, unread totals.
#[derive(Debug, Clone)]
pub struct ChatStore {
    local: String,
    max_retries: u32,
    preview_len: usize,
    sessions: Vec<Session>,
    messages: HashMap<String, Arc<Vec<Message>>>,
    total_unread: u32,
    current_session: Option<String>,
    blocked: HashSet<String>,
}

impl ChatStore {
    /// Creates an empty store for `local`.
    pub fn new(local: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            max_retries: MAX_RETRIES,
            preview_len: DEFAULT_PREVIEW_LEN,
            sessions: Vec::new(),
            messages: HashMap::new(),
            total_unread: 0,
            current_session: None,
            blocked: HashSet::new(),
        }
    }

    /// Overrides the retry budget (never above [`MAX_RETRIES`]) and the
    /// preview length.
    pub fn with_limits(mut self, max_retries: u32, preview_len: usize) -> Self {
        self.max_retries = max_retries.min(MAX_RETRIES);
        self.preview_len = preview_len;
        self
    }

    /// The local identity.
    pub fn local_identity(&self) -> &str {
        &self.local
    }

    /// Effective retry budget.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// All sessions, most recently created first.
    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    /// A session by id.
    pub fn session(&self, session_id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == session_id)
    }

    /// The session held with `counterpart`, whichever id it carries.
    pub fn session_with(&self, counterpart: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.participant == counterpart)
    }

    /// Snapshot of a session's messages, oldest first.
    pub fn messages(&self, session_id: &str) -> Arc<Vec<Message>> {
        self.messages.get(session_id).cloned().unwrap_or_default()
    }

    /// Finds a message by its temporary id.
    pub fn message_by_temp_id(&self, temp_id: &str) -> Option<&Message> {
        self.locate_temp(temp_id)
            .and_then(|(sid, idx)| self.messages.get(&sid).map(|list| &list[idx]))
    }

    /// Finds a message by its chain id.
    pub fn message_by_id(&self, msg_id: u64) -> Option<&Message> {
        self.locate_confirmed(msg_id)
            .and_then(|(sid, idx)| self.messages.get(&sid).map(|list| &list[idx]))
    }

    /// Unread messages across every session.
    pub fn total_unread(&self) -> u32 {
        self.total_unread
    }

    /// The selected session, if any.
    pub fn current_session(&self) -> Option<&Session> {
        self.current_session
            .as_deref()
            .and_then(|id| self.session(id))
    }

    /// Whether messages from `identity` are dropped.
    pub fn is_blocked(&self, identity: &str) -> bool {
        self.blocked.contains(identity)
    }

    /// Blocked identities.
    pub fn blocked_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.blocked.iter().cloned().collect();
        users.sort();
        users
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Appends a provisional `Sending` message to the session with
    /// `receiver`, creating the session if needed, and returns it.
    ///
    /// An existing session with `receiver` is reused whatever its id; a new
    /// one gets the id from [`session_id_for`].
    pub fn insert_provisional(&mut self, receiver: &str, outgoing: OutgoingMessage) -> Message {
        let session_id = self.resolve_session_id(receiver);
        self.ensure_session(&session_id, receiver);

        let mut message = Message::provisional(
            session_id.as_str(),
            self.local.as_str(),
            receiver,
            outgoing.content,
            outgoing.msg_type,
            outgoing.reply_to,
        );
        message.attachment = outgoing.attachment;

        self.list_mut(&session_id).push(message.clone());
        self.refresh_last_message(&session_id);
        debug!(temp_id = %message.id, session_id = %session_id, "provisional message inserted");
        message
    }

    /// Moves a failed message back to `Sending` and spends one retry.
    pub fn begin_retry(&mut self, temp_id: &str) -> Result<Message, DeliveryError> {
        let (session_id, idx) = self
            .locate_temp(temp_id)
            .ok_or_else(|| DeliveryError::MessageNotFound(temp_id.to_string()))?;

        let current = &self.messages[&session_id][idx];
        if current.status != MessageStatus::Failed {
            return Err(DeliveryError::InvalidState {
                operation: "retry",
                id: temp_id.to_string(),
                status: current.status.to_string(),
            });
        }
        if current.retry_count >= self.max_retries {
            return Err(DeliveryError::RetryExhausted {
                retry_count: current.retry_count,
            });
        }

        let message = &mut self.list_mut(&session_id)[idx];
        message.status = MessageStatus::Sending;
        message.retry_count += 1;
        message.error = None;
        info!(temp_id, retry_count = message.retry_count, "retrying message");
        Ok(message.clone())
    }

    /// Replaces the provisional entry in place with its confirmed form.
    /// Returns None when the entry is gone.
    pub fn confirm(
        &mut self,
        temp_id: &str,
        msg_id: u64,
        block_number: u64,
        cid: Cid,
    ) -> Option<Message> {
        let Some((session_id, mut idx)) = self.locate_temp(temp_id) else {
            warn!(temp_id, "confirmed message no longer held");
            return None;
        };

        // The subscription may deliver our own message before the publish call returns.
        if let Some((echo_session, echo_idx)) = self.locate_confirmed(msg_id) {
            self.list_mut(&echo_session).remove(echo_idx);
            if echo_session == session_id && echo_idx < idx {
                idx -= 1;
            }
        }

        let message = &mut self.list_mut(&session_id)[idx];
        message.id = MessageId::Confirmed(msg_id);
        message.content_cid = cid;
        message.sent_at = block_number;
        message.status = MessageStatus::Sent;
        message.error = None;
        let confirmed = message.clone();

        self.refresh_last_message(&session_id);
        info!(temp_id, msg_id, block_number, "message sent");
        Some(confirmed)
    }

    /// Marks the provisional entry failed, keeping its content for retry.
    pub fn fail(&mut self, temp_id: &str, error: ChatError) -> Option<Message> {
        let Some((session_id, idx)) = self.locate_temp(temp_id) else {
            warn!(temp_id, "failed message no longer held");
            return None;
        };

        warn!(temp_id, error = %error, "message delivery failed");
        let message = &mut self.list_mut(&session_id)[idx];
        message.status = MessageStatus::Failed;
        message.error = Some(error);
        Some(message.clone())
    }

    /// Discards a failed message.
    pub fn remove_failed(&mut self, temp_id: &str) -> Result<Message, DeliveryError> {
        let (session_id, idx) = self
            .locate_temp(temp_id)
            .ok_or_else(|| DeliveryError::MessageNotFound(temp_id.to_string()))?;

        let status = self.messages[&session_id][idx].status;
        if status != MessageStatus::Failed {
            return Err(DeliveryError::InvalidState {
                operation: "remove",
                id: temp_id.to_string(),
                status: status.to_string(),
            });
        }

        let removed = self.list_mut(&session_id).remove(idx);
        self.refresh_last_message(&session_id);
        debug!(temp_id, "failed message discarded");
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Read state
    // ------------------------------------------------------------------

    /// Marks received messages read. Returns how many actually changed.
    pub fn mark_read(&mut self, msg_ids: &[u64]) -> u32 {
        let local = self.local.clone();
        let is_target = |m: &Message| {
            !m.is_read
                && !m.is_from(&local)
                && m.id.confirmed().is_some_and(|id| msg_ids.contains(&id))
        };

        let mut changed = Vec::new();
        for (session_id, list) in self.messages.iter_mut() {
            let hits = list.iter().filter(|&m| is_target(m)).count() as u32;
            if hits == 0 {
                continue;
            }
            for message in Arc::make_mut(list).iter_mut() {
                if is_target(message) {
                    message.is_read = true;
                }
            }
            changed.push((session_id.clone(), hits));
        }

        let mut total = 0;
        for (session_id, hits) in changed {
            self.decrement_unread(&session_id, hits);
            total += hits;
        }
        total
    }

    /// Marks every received message of a session read. Returns the unread
    /// count that was cleared.
    pub fn mark_session_read(&mut self, session_id: &str) -> Result<u32, DeliveryError> {
        let cleared = self
            .session(session_id)
            .map(|s| s.unread_count)
            .ok_or_else(|| DeliveryError::SessionNotFound(session_id.to_string()))?;

        let local = self.local.clone();
        if let Some(list) = self.messages.get_mut(session_id) {
            if list.iter().any(|m| !m.is_read && !m.is_from(&local)) {
                for message in Arc::make_mut(list).iter_mut() {
                    if !message.is_from(&local) {
                        message.is_read = true;
                    }
                }
            }
        }

        self.decrement_unread(session_id, cleared);
        Ok(cleared)
    }

    /// Applies a read receipt to one of our outbound messages.
    pub fn apply_read_receipt(&mut self, msg_id: u64, reader: &str) -> bool {
        let Some((session_id, idx)) = self.locate_confirmed(msg_id) else {
            return false;
        };
        let message = &self.messages[&session_id][idx];
        if message.is_read || !message.is_from(&self.local) || message.receiver != reader {
            return false;
        }

        self.list_mut(&session_id)[idx].is_read = true;
        true
    }

    // ------------------------------------------------------------------
    // Inbound and history
    // ------------------------------------------------------------------

    /// Appends a confirmed message, creating its session if needed. Returns
    /// false for duplicates.
    ///
    /// A message naming an unknown session joins the session already held
    /// with its counterpart, if there is one.
    pub fn append_inbound(&mut self, mut message: Message) -> bool {
        if let Some(msg_id) = message.id.confirmed() {
            if self.locate_confirmed(msg_id).is_some() {
                debug!(msg_id, "duplicate message ignored");
                return false;
            }
        }

        let counterpart = self.counterpart_of(&message);
        let known = !message.session_id.is_empty() && self.session(&message.session_id).is_some();
        if !known {
            if let Some(existing) = self.session_with(&counterpart) {
                message.session_id = existing.id.clone();
            } else if message.session_id.is_empty() {
                message.session_id = session_id_for(&self.local, &counterpart);
            }
        }
        let session_id = message.session_id.clone();
        let unread = self.is_unread(&message);

        self.ensure_session(&session_id, &counterpart);
        self.list_mut(&session_id).push(message);
        if unread {
            if let Some(session) = self.session_mut(&session_id) {
                session.unread_count += 1;
            }
            self.total_unread += 1;
        }
        self.refresh_last_message(&session_id);
        true
    }

    /// Removes a confirmed message. Returns the removed entry.
    pub fn delete_message(&mut self, msg_id: u64) -> Option<Message> {
        let (session_id, idx) = self.locate_confirmed(msg_id)?;
        let removed = self.list_mut(&session_id).remove(idx);

        if !removed.is_read && !removed.is_from(&self.local) {
            self.decrement_unread(&session_id, 1);
        }
        self.refresh_last_message(&session_id);
        debug!(msg_id, session_id = %session_id, "message removed");
        Some(removed)
    }

    /// Merges a page of history into a session.
    ///
    /// Offset 0 replaces the confirmed history but keeps local provisional
    /// and failed entries at the end; a later offset prepends older
    /// messages. Entries already held are skipped.
    ///
    /// The session is created from the page when not yet held. Its unread
    /// count never drops below the unread received messages it holds, and
    /// loses those that the page shows as read.
    pub fn merge_history(
        &mut self,
        session_id: &str,
        mut history: Vec<Message>,
        offset: u32,
    ) -> usize {
        if self.session(session_id).is_none() {
            if let Some(counterpart) = history.first().map(|m| self.counterpart_of(m)) {
                self.ensure_session(session_id, &counterpart);
            }
        }
        for message in history.iter_mut() {
            message.session_id = session_id.to_string();
        }

        let unread_before = self.unread_ids(session_id);
        let list = self.list_mut(session_id);
        let merged = if offset == 0 {
            let local_only: Vec<Message> = list.drain(..).filter(|m| m.is_provisional()).collect();
            let count = history.len();
            *list = history;
            list.extend(local_only);
            count
        } else {
            let older: Vec<Message> = history
                .into_iter()
                .filter(|m| {
                    !list
                        .iter()
                        .any(|held| held.id.confirmed().is_some() && held.id == m.id)
                })
                .collect();
            let count = older.len();
            list.splice(0..0, older);
            count
        };

        let unread_after = self.unread_ids(session_id);
        let settled = unread_before.difference(&unread_after).count() as u32;
        let held = unread_after.len() as u32;
        let adjusted = self.session_mut(session_id).map(|session| {
            let previous = session.unread_count;
            session.unread_count = previous.saturating_sub(settled).max(held);
            (previous, session.unread_count)
        });
        if let Some((previous, next)) = adjusted {
            self.total_unread = self.total_unread.saturating_sub(previous) + next;
        }

        self.refresh_last_message(session_id);
        merged
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Replaces session metadata with `records` and recomputes the unread
    /// total. Sessions only known locally are kept, unless a record covers
    /// the same counterpart: their messages then move to the record's id.
    pub fn replace_sessions(&mut self, records: Vec<Session>) {
        let mut sessions = Vec::with_capacity(records.len());
        for mut record in records {
            if record.last_message.is_none() {
                record.last_message = self.session(&record.id).and_then(|s| s.last_message.clone());
            }
            sessions.push(record);
        }

        let mut adopted = Vec::new();
        for local in &self.sessions {
            if sessions.iter().any(|s| s.id == local.id) {
                continue;
            }
            match sessions.iter().find(|s| s.participant == local.participant) {
                Some(remote) => adopted.push((local.id.clone(), remote.id.clone())),
                None => sessions.push(local.clone()),
            }
        }

        self.sessions = sessions;
        for (from, into) in adopted {
            self.adopt_messages(&from, &into);
        }
        self.total_unread = self.sessions.iter().map(|s| s.unread_count).sum();
        debug!(sessions = self.sessions.len(), total_unread = self.total_unread, "sessions loaded");
    }

    /// Inserts a session announced by the chain. Returns false if known.
    /// A session held locally with the same counterpart is folded into it.
    pub fn insert_session(&mut self, session: Session) -> bool {
        if self.session(&session.id).is_some() {
            return false;
        }

        let local_idx = self
            .sessions
            .iter()
            .position(|s| s.participant == session.participant);
        let replaced = local_idx.map(|idx| self.sessions.remove(idx));

        let session_id = session.id.clone();
        self.total_unread += session.unread_count;
        self.sessions.insert(0, session);

        if let Some(local) = replaced {
            self.total_unread = self.total_unread.saturating_sub(local.unread_count);
            self.adopt_messages(&local.id, &session_id);
        }
        true
    }

    /// Sets the archived flag of a session.
    pub fn set_archived(&mut self, session_id: &str, archived: bool) -> Result<(), DeliveryError> {
        let session = self
            .session_mut(session_id)
            .ok_or_else(|| DeliveryError::SessionNotFound(session_id.to_string()))?;
        session.is_archived = archived;
        Ok(())
    }

    /// Selects the current session.
    pub fn select_session(&mut self, session_id: &str) -> Result<Session, DeliveryError> {
        let session = self
            .session(session_id)
            .cloned()
            .ok_or_else(|| DeliveryError::SessionNotFound(session_id.to_string()))?;
        self.current_session = Some(session_id.to_string());
        Ok(session)
    }

    /// Adds `identity` to the block list.
    pub fn block(&mut self, identity: &str) -> bool {
        self.blocked.insert(identity.to_string())
    }

    /// Removes `identity` from the block list.
    pub fn unblock(&mut self, identity: &str) -> bool {
        self.blocked.remove(identity)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn session_mut(&mut self, session_id: &str) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == session_id)
    }

    fn ensure_session(&mut self, session_id: &str, participant: &str) {
        if self.session(session_id).is_none() {
            debug!(session_id, "session created");
            self.sessions.insert(0, Session::new(session_id, participant));
        }
    }

    fn resolve_session_id(&self, counterpart: &str) -> String {
        self.session_with(counterpart)
            .map(|s| s.id.clone())
            .unwrap_or_else(|| session_id_for(&self.local, counterpart))
    }

    fn counterpart_of(&self, message: &Message) -> String {
        if message.is_from(&self.local) {
            message.receiver.clone()
        } else {
            message.sender.clone()
        }
    }

    fn is_unread(&self, message: &Message) -> bool {
        !message.is_read && message.receiver == self.local && !message.is_from(&self.local)
    }

    fn unread_ids(&self, session_id: &str) -> HashSet<u64> {
        self.messages
            .get(session_id)
            .map(|list| {
                list.iter()
                    .filter(|m| self.is_unread(m))
                    .filter_map(|m| m.id.confirmed())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Moves every message of `from` to the end of `into`.
    fn adopt_messages(&mut self, from: &str, into: &str) {
        if let Some(list) = self.messages.remove(from) {
            let moved = Arc::try_unwrap(list).unwrap_or_else(|shared| (*shared).clone());
            let target = self.list_mut(into);
            for mut message in moved {
                message.session_id = into.to_string();
                target.push(message);
            }
        }
        if self.current_session.as_deref() == Some(from) {
            self.current_session = Some(into.to_string());
        }
        self.refresh_last_message(into);
        debug!(from, into, "local session merged");
    }

    fn list_mut(&mut self, session_id: &str) -> &mut Vec<Message> {
        Arc::make_mut(self.messages.entry(session_id.to_string()).or_default())
    }

    fn locate_temp(&self, temp_id: &str) -> Option<(String, usize)> {
        self.messages.iter().find_map(|(sid, list)| {
            list.iter()
                .position(|m| m.temp_id.as_deref() == Some(temp_id))
                .map(|idx| (sid.clone(), idx))
        })
    }

    fn locate_confirmed(&self, msg_id: u64) -> Option<(String, usize)> {
        self.messages.iter().find_map(|(sid, list)| {
            list.iter()
                .position(|m| m.id.confirmed() == Some(msg_id))
                .map(|idx| (sid.clone(), idx))
        })
    }

    fn decrement_unread(&mut self, session_id: &str, count: u32) {
        let removed = match self.session_mut(session_id) {
            Some(session) => {
                let removed = count.min(session.unread_count);
                session.unread_count -= removed;
                removed
            }
            None => 0,
        };
        self.total_unread = self.total_unread.saturating_sub(removed);
    }

    fn refresh_last_message(&mut self, session_id: &str) {
        let summary = self
            .messages
            .get(session_id)
            .and_then(|list| list.last())
            .map(|m| m.summary(self.preview_len));
        if let Some(session) = self.session_mut(session_id) {
            session.last_message = summary;
        }
    }
}
