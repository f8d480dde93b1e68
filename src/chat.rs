//! Per-duel chat: ordered message list fed by an initial load and live inserts.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{DuelError, Result};
use crate::models::{Message, NewMessage, Table};
use crate::realtime::{ChangeEvent, Record, Subscription};
use crate::store::DataService;

/// Insert one chat line. Blank content is rejected before any round-trip;
/// stored content is trimmed.
pub fn send_message(
    service: &dyn DataService,
    duel_id: &str,
    username: &str,
    content: &str,
) -> Result<Message> {
    let content = content.trim();
    if content.is_empty() {
        return Err(DuelError::EmptyMessage);
    }
    service
        .insert_message(NewMessage {
            duel_id: duel_id.to_string(),
            username: username.to_string(),
            content: content.to_string(),
        })
        .map_err(|e| {
            tracing::error!(duel_id, error = %e, "message insert failed");
            e
        })
}

/// The chat panel of one duel.
pub struct ChatStream {
    duel_id: String,
    username: String,
    messages: Vec<Message>,
    seen: HashSet<i64>,
    service: Arc<dyn DataService>,
    subscription: Subscription,
}

impl ChatStream {
    /// Subscribe to the duel's message inserts. The list is empty until
    /// `load_messages`.
    pub fn attach(service: Arc<dyn DataService>, duel_id: &str, username: &str) -> Self {
        let subscription = service.subscribe(Table::Messages, duel_id);
        ChatStream {
            duel_id: duel_id.to_string(),
            username: username.to_string(),
            messages: Vec::new(),
            seen: HashSet::new(),
            service,
            subscription,
        }
    }

    pub fn duel_id(&self) -> &str {
        &self.duel_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Replace the local list with the stored rows, oldest first. On failure
    /// the current list is kept.
    pub fn load_messages(&mut self) -> bool {
        match self.service.select_messages(&self.duel_id) {
            Ok(rows) => {
                self.seen = rows.iter().map(|m| m.id).collect();
                self.messages = rows;
                true
            }
            Err(e) => {
                tracing::error!(duel_id = %self.duel_id, error = %e, "message load failed");
                false
            }
        }
    }

    /// Send as this panel's user. The list itself only grows when the
    /// insert notification comes back.
    pub fn send(&self, content: &str) -> Result<Message> {
        send_message(self.service.as_ref(), &self.duel_id, &self.username, content)
    }

    /// Append a notified row. Rows already present are ignored.
    pub fn on_insert(&mut self, event: &ChangeEvent) -> Option<&Message> {
        let Record::Messages(message) = event.record() else {
            return None;
        };
        if message.duel_id != self.duel_id || !self.seen.insert(message.id) {
            return None;
        }
        self.messages.push(message.clone());
        self.messages.last()
    }

    /// Drain pending notifications and return the rows appended.
    pub fn sync(&mut self) -> Vec<Message> {
        let mut appended = Vec::new();
        while let Some(event) = self.subscription.try_next() {
            if let Some(m) = self.on_insert(&event) {
                appended.push(m.clone());
            }
        }
        appended
    }

    /// Wait for the next message insert on this duel.
    pub async fn next_change(&mut self) -> Option<ChangeEvent> {
        self.subscription.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::ChangeFeed;
    use crate::store::testing::FlakyService;
    use crate::store::SqliteService;

    fn service() -> Arc<dyn DataService> {
        Arc::new(SqliteService::in_memory(ChangeFeed::default()).unwrap())
    }

    #[test]
    fn test_send_message_rejects_empty() {
        let svc = service();
        assert!(matches!(send_message(svc.as_ref(), "a-b", "U1", ""), Err(DuelError::EmptyMessage)));
        assert!(matches!(send_message(svc.as_ref(), "a-b", "U1", " \t\n "), Err(DuelError::EmptyMessage)));
        assert!(svc.select_messages("a-b").unwrap().is_empty());
    }

    #[test]
    fn test_send_message_trims_content() {
        let svc = service();
        let m = send_message(svc.as_ref(), "a-b", "U1", "  hello  ").unwrap();
        assert_eq!(m.content, "hello");
    }

    #[test]
    fn test_load_messages_ascending_insertion_order() {
        let svc = service();
        send_message(svc.as_ref(), "a-b", "U1", "one").unwrap();
        send_message(svc.as_ref(), "a-b", "U2", "two").unwrap();
        send_message(svc.as_ref(), "c-d", "U3", "elsewhere").unwrap();
        let mut chat = ChatStream::attach(svc, "a-b", "Me");
        assert!(chat.load_messages());
        let users: Vec<&str> = chat.messages().iter().map(|m| m.username.as_str()).collect();
        assert_eq!(users, vec!["U1", "U2"]);
    }

    #[test]
    fn test_load_messages_replaces_wholesale() {
        let svc = service();
        let mut chat = ChatStream::attach(svc.clone(), "a-b", "Me");
        chat.send("first").unwrap();
        chat.sync();
        assert_eq!(chat.messages().len(), 1);
        send_message(svc.as_ref(), "a-b", "U2", "second").unwrap();
        chat.load_messages();
        assert_eq!(chat.messages().len(), 2);
        // The pending notification for "second" is a duplicate now.
        assert!(chat.sync().is_empty());
        assert_eq!(chat.messages().len(), 2);
    }

    #[test]
    fn test_blank_send_does_not_mutate_list() {
        let svc = service();
        let mut chat = ChatStream::attach(svc, "a-b", "Me");
        chat.load_messages();
        assert!(chat.send("   ").is_err());
        assert!(chat.sync().is_empty());
        assert!(chat.messages().is_empty());
    }

    #[test]
    fn test_sync_appends_notified_rows_in_order() {
        let svc = service();
        let mut chat = ChatStream::attach(svc.clone(), "a-b", "Me");
        chat.load_messages();
        send_message(svc.as_ref(), "a-b", "U1", "x").unwrap();
        send_message(svc.as_ref(), "a-b", "U2", "y").unwrap();
        let appended = chat.sync();
        assert_eq!(appended.len(), 2);
        assert_eq!(chat.messages()[0].content, "x");
        assert_eq!(chat.messages()[1].content, "y");
    }

    #[test]
    fn test_send_uses_panel_username() {
        let svc = service();
        let chat = ChatStream::attach(svc, "a-b", "User42");
        assert_eq!(chat.send("gg").unwrap().username, "User42");
    }

    #[test]
    fn test_failed_load_keeps_list() {
        let flaky = FlakyService::new();
        let svc: Arc<dyn DataService> = flaky.clone();
        send_message(svc.as_ref(), "a-b", "U1", "kept").unwrap();
        let mut chat = ChatStream::attach(svc, "a-b", "Me");
        chat.load_messages();
        flaky.set_failing(true);
        assert!(!chat.load_messages());
        assert_eq!(chat.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_next_change_yields_insert() {
        let svc = service();
        let mut chat = ChatStream::attach(svc.clone(), "a-b", "Me");
        send_message(svc.as_ref(), "a-b", "U1", "live").unwrap();
        let ev = tokio::time::timeout(std::time::Duration::from_millis(500), chat.next_change())
            .await
            .expect("timeout")
            .expect("event");
        assert_eq!(chat.on_insert(&ev).map(|m| m.content.clone()), Some("live".to_string()));
    }
}
