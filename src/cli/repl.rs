use log::{ error, info };
use std::error::Error;
use std::io::Write;
use std::sync::{ Arc, Mutex };
use tokio::io::{ AsyncBufReadExt, BufReader };

use super::ChatArgs;
use crate::client::HttpStreamSource;
use crate::export::format_time;
use crate::history::{ create_storage, ConversationStore };
use crate::models::chat::{ ChatMessage, Role };
use crate::notify::{ Notifier, Toast, ToastId, Variant };
use crate::session::{ ChatSession, SubmitOutcome };

const HELP: &str = "\
Commands:
  /instructions [text]  show or replace the system instructions
  /history              list messages
  /delete <n>           delete message number n
  /clear                delete every message
  /export [path]        save the conversation as a text file
  /help                 show this help
  /quit                 leave
Anything else is sent as a message.";

#[derive(Debug, PartialEq, Eq)]
pub enum ReplCommand {
    Send(String),
    Instructions(Option<String>),
    History,
    Delete(usize),
    Clear,
    Export(Option<String>),
    Help,
    Quit,
    Invalid(String),
}

impl ReplCommand {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if !trimmed.starts_with('/') {
            return ReplCommand::Send(line.to_string());
        }
        let (name, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, Some(rest.trim()).filter(|r| !r.is_empty())),
            None => (trimmed, None),
        };
        match name {
            "/instructions" => ReplCommand::Instructions(rest.map(str::to_string)),
            "/history" => ReplCommand::History,
            "/delete" =>
                match rest.and_then(|r| r.parse::<usize>().ok()) {
                    Some(n) if n > 0 => ReplCommand::Delete(n),
                    _ => ReplCommand::Invalid("usage: /delete <n>".to_string()),
                }
            "/clear" => ReplCommand::Clear,
            "/export" => ReplCommand::Export(rest.map(str::to_string)),
            "/help" => ReplCommand::Help,
            "/quit" | "/exit" => ReplCommand::Quit,
            other => ReplCommand::Invalid(format!("unknown command {}", other)),
        }
    }
}

/// Incremental terminal view of the assistant's reply. Only the newly
/// appended suffix is printed; wholesale replacement reprints on a fresh line.
#[derive(Default)]
pub struct Renderer {
    current: Option<i64>,
    shown: String,
    finished: bool,
}

impl Renderer {
    pub fn render<W: Write>(&mut self, messages: &[ChatMessage], out: &mut W) -> std::io::Result<()> {
        let tail = match messages.iter().rev().find(|m| m.role == Role::Assistant) {
            Some(m) => m,
            None => return Ok(()),
        };

        if self.current != Some(tail.timestamp) {
            if self.current.is_some() && !self.finished {
                writeln!(out)?;
            }
            self.current = Some(tail.timestamp);
            self.shown.clear();
            self.finished = false;
            write!(out, "AI: ")?;
        } else if self.finished {
            return Ok(());
        }

        match tail.content.strip_prefix(self.shown.as_str()) {
            Some(suffix) => write!(out, "{}", suffix)?,
            None => write!(out, "\n{}", tail.content)?,
        }
        self.shown = tail.content.clone();

        if !tail.is_streaming {
            writeln!(out, "\n")?;
            self.finished = true;
        }
        out.flush()
    }
}

/// Only an explicit yes clears; EOF or anything else keeps the conversation.
pub fn confirmed(answer: Option<&str>) -> bool {
    matches!(answer.map(str::trim), Some("y" | "Y" | "yes"))
}

fn print_history(messages: &[ChatMessage]) {
    if messages.is_empty() {
        println!("(no messages)");
        return;
    }
    for (i, msg) in messages.iter().enumerate() {
        println!("{:>3}. {} ({}): {}", i + 1, msg.role.label(), format_time(msg.timestamp), msg.content);
    }
}

/// Lines for toasts newer than `floor` that are still visible, plus the new floor.
fn fresh_toast_lines(toasts: &[Toast], floor: Option<ToastId>) -> (Vec<String>, Option<ToastId>) {
    let mut last = floor;
    let mut lines = Vec::new();
    for toast in toasts.iter().filter(|t| t.visible && Some(t.id) > floor) {
        let marker = match toast.variant {
            Variant::Default => "*",
            Variant::Destructive => "!",
        };
        lines.push(match &toast.description {
            Some(d) => format!("[{}] {}: {}", marker, toast.title, d),
            None => format!("[{}] {}", marker, toast.title),
        });
        last = Some(toast.id);
    }
    (lines, last)
}

fn watch_toasts(notifier: &Notifier) {
    let last_shown: Mutex<Option<ToastId>> = Mutex::new(None);
    notifier.subscribe(move |toasts| {
        let mut last = last_shown.lock().unwrap_or_else(|p| p.into_inner());
        let (lines, floor) = fresh_toast_lines(toasts, *last);
        for line in lines {
            eprintln!("{}", line);
        }
        *last = floor;
    });
}

pub async fn run(args: ChatArgs) -> Result<(), Box<dyn Error + Send + Sync>> {
    let storage = create_storage(&args.data_dir)?;
    let store = ConversationStore::new(storage);
    let source = Arc::new(HttpStreamSource::new(&args.api_base, &args.api_secret)?);
    let notifier = Notifier::new();
    watch_toasts(&notifier);

    let mut session = ChatSession::load(store, source, notifier.clone())?;
    info!("Session ready with {} messages", session.messages().len());

    println!("Type a message, or /help for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = std::io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;
        let line = match lines.next_line().await? {
            Some(line) => line,
            None => break,
        };

        match ReplCommand::parse(&line) {
            ReplCommand::Send(text) => {
                let mut renderer = Renderer::default();
                let outcome = session.submit(&text, |messages| {
                    if let Err(e) = renderer.render(messages, &mut std::io::stdout()) {
                        error!("Failed to render reply: {}", e);
                    }
                }).await?;
                if let SubmitOutcome::Failed(e) = outcome {
                    info!("Request failed: {}", e);
                }
            }
            ReplCommand::Instructions(None) => println!("{}", session.instructions()),
            ReplCommand::Instructions(Some(text)) => {
                session.set_instructions(&text)?;
                println!("Instructions updated.");
            }
            ReplCommand::History => print_history(session.messages()),
            ReplCommand::Delete(n) => {
                match session.messages().get(n - 1).map(|m| m.timestamp) {
                    Some(ts) => {
                        session.delete(ts);
                        notifier.notify("Message deleted", None, Variant::Default);
                    }
                    None => println!("No message {}.", n),
                }
            }
            ReplCommand::Clear => {
                print!("Are you sure you want to clear all messages? [y/N] ");
                stdout.flush()?;
                let answer = lines.next_line().await?;
                if confirmed(answer.as_deref()) {
                    session.clear();
                    println!("Cleared.");
                }
            }
            ReplCommand::Export(path) => {
                match session.export_transcript(path.as_deref()) {
                    Ok(target) => println!("Saved {}", target),
                    Err(e) => error!("Export failed: {}", e),
                }
            }
            ReplCommand::Help => println!("{}", HELP),
            ReplCommand::Quit => break,
            ReplCommand::Invalid(msg) => println!("{}", msg),
        }
    }

    Ok(())
}
