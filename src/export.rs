use chrono::{ DateTime, Local, TimeZone };

use crate::models::chat::ChatMessage;

/// `HH:mm` in local time for a millisecond timestamp.
pub fn format_time(timestamp: i64) -> String {
    match Local.timestamp_millis_opt(timestamp).single() {
        Some(at) => at.format("%H:%M").to_string(),
        None => "--:--".to_string(),
    }
}

/// Plain-text transcript, one `{label} ({HH:mm}):\n{content}\n\n` block per message.
pub fn transcript(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|msg| format!("{} ({}):\n{}\n\n", msg.role.label(), format_time(msg.timestamp), msg.content))
        .collect()
}

pub fn export_file_name<Tz: TimeZone>(now: &DateTime<Tz>) -> String
    where Tz::Offset: std::fmt::Display
{
    format!("conversation-{}.txt", now.format("%Y-%m-%d-%H-%M"))
}
