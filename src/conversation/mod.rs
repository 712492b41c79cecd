//! Conversation state and the pure reducer that drives it.
//!
//! Every transition is `reduce(state, event) -> state`; the session
//! feeds it events as they happen and republishes `messages` afterwards.

use crate::models::chat::ChatMessage;
use crate::models::wire::ChatTurn;

pub const ERROR_REPLY: &str = "Sorry, I encountered an error. Please try again.";

#[derive(Clone, Debug, PartialEq, Eq)]
struct InFlight {
    timestamp: i64,
    accumulated: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChatState {
    pub messages: Vec<ChatMessage>,
    pub busy: bool,
    in_flight: Option<InFlight>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatEvent {
    /// User submitted `text` at wall-clock `at` (ms).
    Submitted {
        text: String,
        at: i64,
    },
    DeltaReceived(String),
    StreamFinished,
    StreamFailed {
        at: i64,
    },
    Deleted(i64),
    Cleared,
}

impl ChatState {
    pub fn with_messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            busy: false,
            in_flight: None,
        }
    }

    /// Identity of the placeholder being filled, if any.
    pub fn streaming_timestamp(&self) -> Option<i64> {
        self.in_flight.as_ref().map(|f| f.timestamp)
    }

    /// History to send upstream: everything except the in-flight placeholder.
    pub fn history(&self) -> Vec<ChatTurn> {
        let streaming = self.streaming_timestamp();
        self.messages
            .iter()
            .filter(|m| Some(m.timestamp) != streaming)
            .map(ChatTurn::from)
            .collect()
    }

    /// Monotonic identity allocation: never reuses or goes below the last key.
    fn next_timestamp(&self, at: i64) -> i64 {
        match self.messages.iter().map(|m| m.timestamp).max() {
            Some(last) if last >= at => last + 1,
            _ => at,
        }
    }

    fn set_content(&mut self, timestamp: i64, content: &str, streaming: bool) -> bool {
        match self.messages.iter_mut().find(|m| m.timestamp == timestamp) {
            Some(msg) => {
                msg.content = content.to_string();
                msg.is_streaming = streaming;
                true
            }
            None => false,
        }
    }
}

pub fn reduce(mut state: ChatState, event: ChatEvent) -> ChatState {
    match event {
        ChatEvent::Submitted { text, at } => {
            if state.busy || text.trim().is_empty() {
                return state;
            }
            let user_ts = state.next_timestamp(at);
            state.messages.push(ChatMessage::user(text, user_ts));

            let reply_ts = state.next_timestamp(at);
            state.messages.push(ChatMessage::placeholder(reply_ts));
            state.in_flight = Some(InFlight {
                timestamp: reply_ts,
                accumulated: String::new(),
            });
            state.busy = true;
        }
        ChatEvent::DeltaReceived(delta) => {
            if let Some(mut flight) = state.in_flight.take() {
                flight.accumulated.push_str(&delta);
                state.set_content(flight.timestamp, &flight.accumulated, true);
                state.in_flight = Some(flight);
            }
        }
        ChatEvent::StreamFinished => {
            if let Some(flight) = state.in_flight.take() {
                state.set_content(flight.timestamp, &flight.accumulated, false);
            }
            state.busy = false;
        }
        ChatEvent::StreamFailed { at } => {
            let replaced = match state.in_flight.take() {
                Some(flight) => state.set_content(flight.timestamp, ERROR_REPLY, false),
                None => false,
            };
            if !replaced {
                let ts = state.next_timestamp(at);
                state.messages.push(ChatMessage::assistant(ERROR_REPLY, ts));
            }
            state.busy = false;
        }
        ChatEvent::Deleted(timestamp) => {
            state.messages.retain(|m| m.timestamp != timestamp);
        }
        ChatEvent::Cleared => {
            state.messages.clear();
        }
    }
    state
}
