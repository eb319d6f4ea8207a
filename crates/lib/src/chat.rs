//! Per-document chat conversation over the realtime channel.
//!
//! One outstanding question at a time. Partial answers stream into a single
//! assistant message which the final `chat_response` completes. A question
//! whose socket went away before the answer came is dropped, so the user can
//! ask again once the channel is back.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ClientError;
use crate::realtime::{ClientEvent, EventSink, RagMode, ServerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub sources: Vec<serde_json::Value>,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            sources: Vec::new(),
        }
    }
}

/// The question awaiting its answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingQuery {
    pub message_id: Uuid,
    pub sent_at: DateTime<Utc>,
    /// Socket the question went out on.
    pub connection: u64,
}

pub struct ChatSession {
    sink: Arc<dyn EventSink>,
    document_id: String,
    rag_mode: RagMode,
    log: Vec<ChatMessage>,
    pending: Option<PendingQuery>,
    /// Index into `log` of the assistant message being streamed.
    streaming: Option<usize>,
}

impl ChatSession {
    pub fn new(sink: Arc<dyn EventSink>, document_id: impl Into<String>, rag_mode: RagMode) -> Self {
        Self {
            sink,
            document_id: document_id.into(),
            rag_mode,
            log: Vec::new(),
            pending: None,
            streaming: None,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.log
    }

    /// The question still awaiting its answer on the current socket.
    pub fn pending(&self) -> Option<&PendingQuery> {
        self.pending.as_ref().filter(|p| self.is_live(p))
    }

    fn is_live(&self, pending: &PendingQuery) -> bool {
        self.sink.is_open() && self.sink.connection() == pending.connection
    }

    /// Give up on the outstanding question. A partially streamed answer stays
    /// in the log as it is. Returns false if nothing was pending.
    pub fn abandon_pending(&mut self) -> bool {
        self.streaming = None;
        match self.pending.take() {
            Some(p) => {
                log::info!(
                    "abandoned question {} for document {}",
                    p.message_id,
                    self.document_id
                );
                true
            }
            None => false,
        }
    }

    pub fn rag_mode(&self) -> RagMode {
        self.rag_mode
    }

    /// Applies from the next question on.
    pub fn set_rag_mode(&mut self, mode: RagMode) {
        self.rag_mode = mode;
    }

    /// False while a question is pending or the channel is down.
    pub fn can_submit(&self) -> bool {
        self.pending().is_none() && self.sink.is_open()
    }

    /// Send a question. The log is only touched when the frame was handed to the channel.
    pub fn send(&mut self, text: &str) -> Result<&ChatMessage, ClientError> {
        if self.pending.is_some() {
            if self.pending().is_some() {
                return Err(ClientError::AlreadyInProgress);
            }
            self.abandon_pending();
        }
        if !self.sink.is_open() {
            return Err(ClientError::NotConnected);
        }
        let sent = self.sink.send(ClientEvent::Chat {
            content: text.to_string(),
            document_id: self.document_id.clone(),
            rag_mode: self.rag_mode,
        });
        if !sent {
            return Err(ClientError::NotConnected);
        }
        let msg = ChatMessage::new(Role::User, text);
        self.pending = Some(PendingQuery {
            message_id: msg.id,
            sent_at: msg.timestamp,
            connection: self.sink.connection(),
        });
        self.streaming = None;
        self.log.push(msg);
        Ok(&self.log[self.log.len() - 1])
    }

    /// Fold an inbound event into the log. Returns true if it belonged to this conversation.
    pub fn apply(&mut self, event: &ServerEvent) -> bool {
        if let Some(id) = event.document_id() {
            if id != self.document_id {
                return false;
            }
        }
        match event {
            ServerEvent::ChatResponse { content, .. } => {
                if self.pending.is_none() {
                    log::warn!(
                        "chat_response for document {} with no pending question",
                        self.document_id
                    );
                }
                match self.streaming.take() {
                    Some(i) => {
                        let msg = &mut self.log[i];
                        msg.content = content.answer().to_string();
                        msg.sources = content.sources().to_vec();
                    }
                    None => {
                        let mut msg = ChatMessage::new(Role::Assistant, content.answer());
                        msg.sources = content.sources().to_vec();
                        self.log.push(msg);
                    }
                }
                self.pending = None;
                true
            }
            ServerEvent::ChatPartial { content, .. } => {
                if self.pending.is_none() {
                    log::warn!(
                        "chat_partial for document {} with no pending question",
                        self.document_id
                    );
                }
                match self.streaming {
                    Some(i) => self.log[i].content.push_str(content),
                    None => {
                        self.log.push(ChatMessage::new(Role::Assistant, content.as_str()));
                        self.streaming = Some(self.log.len() - 1);
                    }
                }
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::ResponseContent;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSink {
        open: AtomicBool,
        connection: AtomicU64,
        sent: Mutex<Vec<ClientEvent>>,
    }

    impl FakeSink {
        fn open() -> Arc<Self> {
            let s = Self::default();
            s.open.store(true, Ordering::SeqCst);
            Arc::new(s)
        }
    }

    impl EventSink for FakeSink {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn send(&self, event: ClientEvent) -> bool {
            if !self.is_open() {
                return false;
            }
            self.sent.lock().unwrap().push(event);
            true
        }

        fn connection(&self) -> u64 {
            self.connection.load(Ordering::SeqCst)
        }
    }

    fn response(answer: &str, document_id: Option<&str>) -> ServerEvent {
        ServerEvent::ChatResponse {
            content: ResponseContent::Structured {
                answer: answer.into(),
                sources: vec![serde_json::json!({"page": 2})],
            },
            document_id: document_id.map(String::from),
        }
    }

    fn partial(text: &str) -> ServerEvent {
        ServerEvent::ChatPartial {
            content: text.into(),
            document_id: Some("d1".into()),
        }
    }

    #[test]
    fn send_tags_event_and_sets_pending() {
        let sink = FakeSink::open();
        let mut chat = ChatSession::new(sink.clone(), "d1", RagMode::Graph);
        chat.send("What is X?").unwrap();
        assert_eq!(chat.messages().len(), 1);
        assert_eq!(chat.messages()[0].role, Role::User);
        assert!(chat.pending().is_some());
        assert!(!chat.can_submit());
        assert_eq!(
            sink.sent.lock().unwrap()[0],
            ClientEvent::Chat {
                content: "What is X?".into(),
                document_id: "d1".into(),
                rag_mode: RagMode::Graph,
            }
        );
    }

    #[test]
    fn second_send_while_pending_is_rejected_and_log_unchanged() {
        let sink = FakeSink::open();
        let mut chat = ChatSession::new(sink.clone(), "d1", RagMode::default());
        chat.send("first").unwrap();
        let before = chat.messages().to_vec();
        assert_eq!(chat.send("What is X?").unwrap_err(), ClientError::AlreadyInProgress);
        assert_eq!(chat.messages(), &before[..]);
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn send_on_closed_channel_is_rejected() {
        let sink = Arc::new(FakeSink::default());
        let mut chat = ChatSession::new(sink.clone(), "d1", RagMode::default());
        assert!(!chat.can_submit());
        assert_eq!(chat.send("hi").unwrap_err(), ClientError::NotConnected);
        assert!(chat.messages().is_empty());
        assert!(chat.pending().is_none());
    }

    #[test]
    fn response_appends_one_message_and_clears_pending() {
        let mut chat = ChatSession::new(FakeSink::open(), "d1", RagMode::default());
        chat.send("q").unwrap();
        assert!(chat.apply(&response("a", Some("d1"))));
        assert_eq!(chat.messages().len(), 2);
        let answer = &chat.messages()[1];
        assert_eq!(answer.role, Role::Assistant);
        assert_eq!(answer.content, "a");
        assert_eq!(answer.sources.len(), 1);
        assert!(chat.pending().is_none());
        assert!(chat.can_submit());
    }

    #[test]
    fn partials_accumulate_then_response_finalizes_in_place() {
        let mut chat = ChatSession::new(FakeSink::open(), "d1", RagMode::default());
        chat.send("q").unwrap();
        chat.apply(&partial("Hel"));
        chat.apply(&partial("lo"));
        assert_eq!(chat.messages().len(), 2);
        assert_eq!(chat.messages()[1].content, "Hello");
        assert!(chat.pending().is_some());

        chat.apply(&response("Hello world", None));
        assert_eq!(chat.messages().len(), 2);
        assert_eq!(chat.messages()[1].content, "Hello world");
        assert!(chat.pending().is_none());
    }

    #[test]
    fn other_documents_are_ignored() {
        let mut chat = ChatSession::new(FakeSink::open(), "d1", RagMode::default());
        chat.send("q").unwrap();
        assert!(!chat.apply(&response("elsewhere", Some("d2"))));
        assert_eq!(chat.messages().len(), 1);
        assert!(chat.pending().is_some());
    }

    #[test]
    fn unsolicited_response_is_still_appended() {
        let mut chat = ChatSession::new(FakeSink::open(), "d1", RagMode::default());
        assert!(chat.apply(&response("surprise", Some("d1"))));
        assert_eq!(chat.messages().len(), 1);
        assert_eq!(chat.messages()[0].content, "surprise");
    }

    #[test]
    fn question_from_a_dropped_socket_no_longer_blocks() {
        let sink = FakeSink::open();
        let mut chat = ChatSession::new(sink.clone(), "d1", RagMode::default());
        chat.send("What is X?").unwrap();
        chat.apply(&partial("Hel"));

        sink.open.store(false, Ordering::SeqCst);
        assert!(chat.pending().is_none());
        assert!(!chat.can_submit());

        sink.connection.fetch_add(1, Ordering::SeqCst);
        sink.open.store(true, Ordering::SeqCst);
        assert!(chat.can_submit());
        chat.send("again?").unwrap();
        assert_eq!(chat.pending().unwrap().connection, 1);

        // the partial from the lost answer is kept; the new answer gets its own message
        chat.apply(&partial("Wor"));
        let log: Vec<_> = chat.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(log, vec!["What is X?", "Hel", "again?", "Wor"]);
    }

    #[test]
    fn abandon_pending_unlocks_send() {
        let sink = FakeSink::open();
        let mut chat = ChatSession::new(sink.clone(), "d1", RagMode::default());
        assert!(!chat.abandon_pending());
        chat.send("q").unwrap();
        assert!(chat.abandon_pending());
        assert!(chat.can_submit());
        chat.send("q2").unwrap();
        assert_eq!(sink.sent.lock().unwrap().len(), 2);
    }

    #[test]
    fn rag_mode_switch_applies_to_next_send() {
        let sink = FakeSink::open();
        let mut chat = ChatSession::new(sink.clone(), "d1", RagMode::Traditional);
        chat.set_rag_mode(RagMode::Graph);
        chat.send("q").unwrap();
        assert!(matches!(
            sink.sent.lock().unwrap()[0],
            ClientEvent::Chat { rag_mode: RagMode::Graph, .. }
        ));
    }
}
