use chrono::{ Local, Utc };
use futures::StreamExt;
use log::{ error, info, warn };
use std::sync::Arc;

use crate::client::{ ndjson, ChatError, StreamSource };
use crate::conversation::{ reduce, ChatEvent, ChatState };
use crate::export::{ export_file_name, transcript };
use crate::history::{ ConversationStore, StorageError };
use crate::models::chat::ChatMessage;
use crate::models::wire::ChatRequest;
use crate::notify::{ Notifier, Variant };

/// How a call to [`ChatSession::submit`] ended.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// Blank input; nothing happened.
    Ignored,
    Completed,
    /// The reply was replaced with the fixed apology.
    Failed(ChatError),
}

/// Settles the in-flight reply when a `submit` future is dropped before
/// its stream ends, so the session is never left busy.
struct InFlightGuard<'a> {
    session: &'a mut ChatSession,
    settled: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.settled && self.session.state.busy {
            warn!("Reply abandoned before its stream ended");
            self.session.apply(ChatEvent::StreamFailed { at: Utc::now().timestamp_millis() });
        }
    }
}

/// One conversation bound to its storage and completion stream source.
///
/// Every state change goes through [`reduce`], is persisted, and is then
/// published to the caller's update callback with the full message list.
pub struct ChatSession {
    state: ChatState,
    store: ConversationStore,
    source: Arc<dyn StreamSource>,
    instructions: String,
    notifier: Notifier,
}

impl ChatSession {
    pub fn load(
        store: ConversationStore,
        source: Arc<dyn StreamSource>,
        notifier: Notifier
    ) -> Result<Self, StorageError> {
        let messages = store.load_messages()?;
        let instructions = store.load_instructions()?;
        Ok(Self {
            state: ChatState::with_messages(messages),
            store,
            source,
            instructions,
            notifier,
        })
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.state.messages
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    pub fn is_busy(&self) -> bool {
        self.state.busy
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    fn apply(&mut self, event: ChatEvent) {
        let state = std::mem::take(&mut self.state);
        self.state = reduce(state, event);
        if let Err(e) = self.store.save_messages(&self.state.messages) {
            warn!("Failed to persist conversation: {}", e);
        }
    }

    /// Sends `input` with the full history and folds the streamed reply
    /// into the conversation, calling `on_update` after every change.
    pub async fn submit<F>(&mut self, input: &str, mut on_update: F) -> Result<SubmitOutcome, ChatError>
        where F: FnMut(&[ChatMessage])
    {
        if self.state.busy {
            return Err(ChatError::Busy);
        }
        if input.trim().is_empty() {
            return Ok(SubmitOutcome::Ignored);
        }

        self.apply(ChatEvent::Submitted {
            text: input.to_string(),
            at: Utc::now().timestamp_millis(),
        });
        on_update(&self.state.messages);

        let request = ChatRequest {
            instructions: self.instructions.clone(),
            input: self.state.history(),
        };

        let mut guard = InFlightGuard { session: &mut *self, settled: false };
        let result = guard.session.stream_reply(&request, &mut on_update).await;
        guard.settled = true;
        drop(guard);

        match result {
            Ok(()) => {
                self.apply(ChatEvent::StreamFinished);
                on_update(&self.state.messages);
                Ok(SubmitOutcome::Completed)
            }
            Err(e) => {
                error!("Error: {}", e);
                self.apply(ChatEvent::StreamFailed { at: Utc::now().timestamp_millis() });
                on_update(&self.state.messages);
                Ok(SubmitOutcome::Failed(e))
            }
        }
    }

    async fn stream_reply<F>(&mut self, request: &ChatRequest, on_update: &mut F) -> Result<(), ChatError>
        where F: FnMut(&[ChatMessage])
    {
        let body = self.source.open(request).await?;
        let mut deltas = Box::pin(ndjson::deltas(body));
        let mut received = 0usize;

        while let Some(delta) = deltas.next().await {
            self.apply(ChatEvent::DeltaReceived(delta?));
            on_update(&self.state.messages);
            received += 1;
        }

        info!("Stream finished after {} deltas", received);
        Ok(())
    }

    /// Removes a message by identity. Absent keys are a no-op.
    pub fn delete(&mut self, timestamp: i64) -> bool {
        let before = self.state.messages.len();
        self.apply(ChatEvent::Deleted(timestamp));
        self.state.messages.len() != before
    }

    /// Irreversible; callers confirm with the user first.
    pub fn clear(&mut self) {
        self.apply(ChatEvent::Cleared);
        info!("Conversation cleared");
    }

    pub fn set_instructions(&mut self, instructions: &str) -> Result<(), StorageError> {
        self.instructions = instructions.to_string();
        self.store.save_instructions(instructions)
    }

    pub fn transcript(&self) -> String {
        transcript(&self.state.messages)
    }

    /// Writes the transcript to `path`, or to a timestamped file in the
    /// working directory, and returns where it went.
    pub fn export_transcript(&self, path: Option<&str>) -> std::io::Result<String> {
        let target = match path {
            Some(p) => p.to_string(),
            None => export_file_name(&Local::now()),
        };
        match std::fs::write(&target, self.transcript()) {
            Ok(()) => {
                self.notifier.notify(
                    "Conversation exported",
                    Some("Your conversation has been exported as a text file.".to_string()),
                    Variant::Default
                );
                Ok(target)
            }
            Err(e) => {
                self.notifier.notify("Export failed", Some(e.to_string()), Variant::Destructive);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ByteStream;
    use crate::conversation::ERROR_REPLY;
    use crate::history::MemoryStorage;
    use crate::models::chat::Role;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::time::Duration;

    enum Reply {
        Chunks(Vec<&'static str>),
        Fail(fn() -> ChatError),
        FailMidway(Vec<&'static str>),
        /// Sends these chunks, then never ends.
        Stall(Vec<&'static str>),
    }

    struct FakeSource {
        reply: Reply,
        seen: Mutex<Vec<ChatRequest>>,
    }

    impl FakeSource {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self { reply, seen: Mutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl StreamSource for FakeSource {
        async fn open(&self, request: &ChatRequest) -> Result<ByteStream, ChatError> {
            self.seen.lock().unwrap().push(request.clone());
            if let Reply::Stall(parts) = &self.reply {
                let chunks: Vec<Result<Bytes, ChatError>> = parts
                    .iter()
                    .map(|p| Ok(Bytes::from(p.to_string())))
                    .collect();
                return Ok(Box::pin(futures::stream::iter(chunks).chain(futures::stream::pending())));
            }
            let chunks: Vec<Result<Bytes, ChatError>> = match &self.reply {
                Reply::Chunks(parts) => parts.iter().map(|p| Ok(Bytes::from(p.to_string()))).collect(),
                Reply::Fail(make) => return Err(make()),
                Reply::FailMidway(parts) => {
                    let mut out: Vec<_> = parts.iter().map(|p| Ok(Bytes::from(p.to_string()))).collect();
                    out.push(Err(ChatError::MissingStream));
                    out
                }
                Reply::Stall(_) => Vec::new(),
            };
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    fn session(source: Arc<FakeSource>) -> (ChatSession, ConversationStore) {
        let store = ConversationStore::new(Arc::new(MemoryStorage::new()));
        let session = ChatSession::load(store.clone(), source, Notifier::new()).unwrap();
        (session, store)
    }

    #[tokio::test]
    async fn streamed_reply_is_folded_and_finalized() {
        let source = FakeSource::new(Reply::Chunks(vec!["{\"delta\":\"Hel\"}\n", "{\"delta\":\"lo\"}\n"]));
        let (mut session, store) = session(source.clone());

        let mut snapshots: Vec<Vec<ChatMessage>> = Vec::new();
        let outcome = session.submit("Hi", |m| snapshots.push(m.to_vec())).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Completed));

        // user + placeholder first, before any delta
        assert_eq!(snapshots[0].len(), 2);
        assert_eq!(snapshots[0][0].content, "Hi");
        assert_eq!(snapshots[0][1].content, "");
        assert!(snapshots[0][1].is_streaming);
        // each update carries the full accumulated string
        assert_eq!(snapshots[1][1].content, "Hel");
        assert_eq!(snapshots[2][1].content, "Hello");

        let last = snapshots.last().unwrap();
        assert_eq!(last[1].content, "Hello");
        assert!(!last[1].is_streaming);
        assert!(!session.is_busy());

        let sent = source.seen.lock().unwrap();
        assert_eq!(sent[0].input.len(), 1);
        assert_eq!(sent[0].input[0].role, Role::User);
        assert_eq!(sent[0].instructions, crate::models::wire::DEFAULT_INSTRUCTIONS);

        assert_eq!(store.load_messages().unwrap(), session.messages().to_vec());
    }

    #[tokio::test]
    async fn upstream_status_collapses_to_apology() {
        let source = FakeSource::new(Reply::Fail(|| ChatError::Status(500)));
        let (mut session, _) = session(source);

        let outcome = session.submit("Hi", |_| {}).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Failed(ChatError::Status(500))));

        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, ERROR_REPLY);
        assert!(!messages[1].is_streaming);
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn midstream_failure_discards_partial_content() {
        let source = FakeSource::new(Reply::FailMidway(vec!["{\"delta\":\"partial\"}\n"]));
        let (mut session, _) = session(source);

        session.submit("Hi", |_| {}).await.unwrap();
        assert_eq!(session.messages()[1].content, ERROR_REPLY);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_submit_releases_the_session() {
        let source = FakeSource::new(Reply::Stall(vec!["{\"delta\":\"par\"}\n"]));
        let (mut session, store) = session(source);

        let waited = tokio::time::timeout(Duration::from_secs(5), session.submit("Hi", |_| {})).await;
        assert!(waited.is_err());

        assert!(!session.is_busy());
        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, ERROR_REPLY);
        assert!(!messages[1].is_streaming);
        assert_eq!(store.load_messages().unwrap()[1].content, ERROR_REPLY);

        // the next submission is accepted instead of bouncing off a stale busy flag
        let again = tokio::time::timeout(Duration::from_secs(5), session.submit("Again", |_| {})).await;
        assert!(again.is_err());
        assert_eq!(session.messages().len(), 4);
        assert_eq!(session.messages()[2].content, "Again");
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let source = FakeSource::new(Reply::Chunks(vec!["not json\n{\"delta\":\"ok\"}\n"]));
        let (mut session, _) = session(source);

        session.submit("Hi", |_| {}).await.unwrap();
        assert_eq!(session.messages()[1].content, "ok");
    }

    #[tokio::test]
    async fn blank_input_never_reaches_the_network() {
        let source = FakeSource::new(Reply::Chunks(vec![]));
        let (mut session, _) = session(source.clone());

        let outcome = session.submit("  ", |_| panic!("no update expected")).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Ignored));
        assert!(source.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn follow_up_sends_prior_history() {
        let source = FakeSource::new(Reply::Chunks(vec!["{\"delta\":\"A\"}\n"]));
        let (mut session, _) = session(source.clone());

        session.submit("one", |_| {}).await.unwrap();
        session.submit("two", |_| {}).await.unwrap();

        let sent = source.seen.lock().unwrap();
        let contents: Vec<&str> = sent[1].input.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "A", "two"]);
    }

    #[tokio::test]
    async fn delete_clear_and_instructions_persist() {
        let source = FakeSource::new(Reply::Chunks(vec!["{\"delta\":\"A\"}\n"]));
        let (mut session, store) = session(source);
        session.submit("one", |_| {}).await.unwrap();

        let first = session.messages()[0].timestamp;
        assert!(session.delete(first));
        assert!(!session.delete(first));
        assert_eq!(store.load_messages().unwrap().len(), 1);

        session.clear();
        assert!(store.load_messages().unwrap().is_empty());

        session.set_instructions("Talk like a pirate.").unwrap();
        assert_eq!(store.load_instructions().unwrap(), "Talk like a pirate.");
    }

    #[tokio::test]
    async fn export_writes_transcript_and_notifies() {
        let source = FakeSource::new(Reply::Chunks(vec!["{\"delta\":\"Hello\"}\n"]));
        let (mut session, _) = session(source);
        session.submit("Hi", |_| {}).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let written = session.export_transcript(path.to_str()).unwrap();

        let missing_dir = dir.path().join("no-such-dir").join("out.txt");
        let err = session.export_transcript(missing_dir.to_str()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);

        let text = std::fs::read_to_string(written).unwrap();
        assert!(text.starts_with("You ("));
        assert!(text.ends_with("):\nHello\n\n"));
        let toasts = session.notifier().toasts();
        assert_eq!(toasts[0].title, "Conversation exported");
        assert_eq!(toasts[1].title, "Export failed");
    }
}
