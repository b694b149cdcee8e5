//! Mail client: the higher-level send/check/reply semantics on top of the
//! mail store.
//!
//! Group addresses (`@all`, `@builders`, ...) are resolved against the live
//! session list *before* insertion: one row per concrete recipient, sender
//! excluded. Delivery is at-least-once; `check` is the atomic
//! read-and-mark used by pane launchers on every turn.

use std::sync::Arc;

use serde::Serialize;

use crate::session::Capability;
use crate::store::{MailFilter, MailMessage, MailStore, MessageType, Priority, SessionStore};
use crate::{olog_debug, Error, Result};

/// Options for [`MailClient::send`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub msg_type: Option<MessageType>,
    pub priority: Option<Priority>,
    pub thread_id: Option<String>,
    pub payload: Option<String>,
}

pub struct MailClient {
    store: Arc<MailStore>,
    sessions: Arc<SessionStore>,
}

impl MailClient {
    pub fn new(store: Arc<MailStore>, sessions: Arc<SessionStore>) -> Self {
        Self { store, sessions }
    }

    pub fn store(&self) -> &MailStore {
        &self.store
    }

    /// Send a message. `to` may be a concrete agent name or a group address;
    /// groups fan out to one row per recipient at send time. Returns the ids
    /// of the created rows (empty when a group resolves to nobody).
    pub fn send(
        &self,
        from: &str,
        to: &str,
        subject: &str,
        body: &str,
        options: SendOptions,
    ) -> Result<Vec<String>> {
        let recipients = self.resolve_recipients(from, to)?;
        if recipients.is_empty() {
            olog_debug!("Mail from '{}' to '{}' resolved to nobody, dropping", from, to);
            return Ok(Vec::new());
        }

        let mut ids = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let mut message = MailMessage::new(from, recipient, subject, body);
            if let Some(t) = options.msg_type {
                message.msg_type = t;
            }
            if let Some(p) = options.priority {
                message.priority = p;
            }
            message.thread_id = options.thread_id.clone();
            message.payload = options.payload.clone();
            ids.push(self.store.insert(&message)?);
        }
        Ok(ids)
    }

    /// Serialize a typed payload into the payload column and stamp the
    /// matching protocol type.
    pub fn send_protocol<T: Serialize>(
        &self,
        from: &str,
        to: &str,
        subject: &str,
        msg_type: MessageType,
        payload: &T,
    ) -> Result<Vec<String>> {
        let encoded = serde_json::to_string(payload)?;
        self.send(
            from,
            to,
            subject,
            "",
            SendOptions {
                msg_type: Some(msg_type),
                payload: Some(encoded),
                ..Default::default()
            },
        )
    }

    /// Atomic read-and-mark: fetch unread mail and mark every returned row
    /// read in the same transaction.
    pub fn check(&self, agent: &str) -> Result<Vec<MailMessage>> {
        self.store.take_unread(agent)
    }

    /// Unread mail rendered as one injectable string, then marked read.
    /// Returns `None` when the mailbox is empty.
    pub fn check_inject(&self, agent: &str) -> Result<Option<String>> {
        let messages = self.check(agent)?;
        if messages.is_empty() {
            return Ok(None);
        }
        let mut out = format!("You have {} new message(s):\n", messages.len());
        for message in &messages {
            out.push_str(&format!(
                "\n[{} | {} | {}] from {}: {}\n{}\n",
                message.msg_type.as_str(),
                message.priority.as_str(),
                message.created_at.format("%H:%M:%S"),
                message.from,
                message.subject,
                message.body,
            ));
            if let Some(payload) = &message.payload {
                out.push_str(&format!("payload: {}\n", payload));
            }
        }
        Ok(Some(out))
    }

    /// Reply to a message. The recipient is the original sender; the thread
    /// id is the conversation root's id, found by walking the chain
    /// root-ward (so replies to replies stay in one thread).
    pub fn reply(&self, message_id: &str, body: &str, from: &str) -> Result<String> {
        let original = self.store.get_by_id(message_id)?.ok_or_else(|| Error::Mail {
            id: Some(message_id.to_string()),
            message: "cannot reply: message not found".to_string(),
        })?;

        let thread_id = self.thread_root(&original)?;
        let subject = if original.subject.starts_with("Re: ") {
            original.subject.clone()
        } else {
            format!("Re: {}", original.subject)
        };

        let mut message = MailMessage::new(from, original.from.clone(), subject, body)
            .with_thread(thread_id);
        message.msg_type = original.msg_type;
        let id = self.store.insert(&message)?;
        Ok(id)
    }

    /// Walk root-ward from a message to its conversation root id.
    fn thread_root(&self, message: &MailMessage) -> Result<String> {
        let mut current_id = match &message.thread_id {
            None => return Ok(message.id.clone()),
            Some(t) => t.clone(),
        };
        // Chains are short; the bound only guards against a corrupt cycle.
        for _ in 0..32 {
            match self.store.get_by_id(&current_id)? {
                Some(parent) => match parent.thread_id {
                    Some(next) if next != current_id => current_id = next,
                    _ => return Ok(current_id),
                },
                None => return Ok(current_id),
            }
        }
        Ok(current_id)
    }

    /// Resolve a recipient expression to concrete agent names.
    ///
    /// `@all` means every active agent except the sender; capability groups
    /// filter by tag. Anything not starting with `@` passes through as-is.
    fn resolve_recipients(&self, from: &str, to: &str) -> Result<Vec<String>> {
        if !to.starts_with('@') {
            return Ok(vec![to.to_string()]);
        }

        let active = self.sessions.get_active()?;
        let names = |filter: &dyn Fn(Capability) -> bool| -> Vec<String> {
            active
                .iter()
                .filter(|s| s.agent_name != from && filter(s.capability))
                .map(|s| s.agent_name.clone())
                .collect()
        };

        let recipients = match to {
            "@all" => names(&|_| true),
            "@builders" => names(&|c| c == Capability::Builder),
            "@scouts" => names(&|c| c == Capability::Scout),
            "@reviewers" => names(&|c| c == Capability::Reviewer),
            "@mergers" => names(&|c| c == Capability::Merger),
            "@leads" => names(&|c| c == Capability::Lead),
            other => {
                return Err(Error::mail(format!("unknown group address: {}", other)));
            }
        };
        Ok(recipients)
    }

    /// Recent traffic involving an agent, for status displays.
    pub fn history(&self, agent: &str, limit: usize) -> Result<Vec<MailMessage>> {
        let mut to_agent = self.store.get_all(&MailFilter {
            to: Some(agent.to_string()),
            limit: Some(limit),
            ..Default::default()
        })?;
        let from_agent = self.store.get_all(&MailFilter {
            from: Some(agent.to_string()),
            limit: Some(limit),
            ..Default::default()
        })?;
        to_agent.extend(from_agent);
        to_agent.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        to_agent.truncate(limit);
        Ok(to_agent)
    }
}
