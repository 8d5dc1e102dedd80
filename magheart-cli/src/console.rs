//! Line-oriented console for a joined meeting.
//!
//! ```text
//! /phase cocreation          update_phase
//! /context {"mood":"calm"}   update_shared_context
//! /send card_played {"c":1}  any event type
//! /leave [reason]            leave_meeting
//! /status                    print the current snapshot
//! /quit
//! ```

use magheart_session::{JsonObject, MeetingPhase, SessionSnapshot};
use serde_json::Value;
use thiserror::Error;

pub const HELP: &str = "commands: /phase <phase> | /context <json object> | /send <type> [json] | /leave [reason] | /status | /quit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Phase(MeetingPhase),
    Context(JsonObject),
    Send { kind: String, payload: Value },
    Leave(String),
    Status,
    Help,
    Quit,
}

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("unknown command `{0}`, try /help")]
    Unknown(String),
    #[error("`{0}` needs an argument")]
    MissingArgument(&'static str),
    #[error("{0}")]
    InvalidPhase(#[from] magheart_session::ProtocolError),
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("shared context must be a json object")]
    NotAnObject,
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>, ConsoleError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };

    let command = match head {
        "/phase" => {
            if rest.is_empty() {
                return Err(ConsoleError::MissingArgument("/phase"));
            }
            ConsoleCommand::Phase(rest.parse()?)
        }
        "/context" => {
            if rest.is_empty() {
                return Err(ConsoleError::MissingArgument("/context"));
            }
            match serde_json::from_str::<Value>(rest)? {
                Value::Object(ctx) => ConsoleCommand::Context(ctx),
                _ => return Err(ConsoleError::NotAnObject),
            }
        }
        "/send" => {
            let (kind, payload) = match rest.split_once(char::is_whitespace) {
                Some((kind, json)) => (kind, serde_json::from_str::<Value>(json.trim())?),
                None => (rest, Value::Object(JsonObject::new())),
            };
            if kind.is_empty() {
                return Err(ConsoleError::MissingArgument("/send"));
            }
            ConsoleCommand::Send {
                kind: kind.to_string(),
                payload,
            }
        }
        "/leave" => ConsoleCommand::Leave(if rest.is_empty() {
            "User left".to_string()
        } else {
            rest.to_string()
        }),
        "/status" => ConsoleCommand::Status,
        "/help" => ConsoleCommand::Help,
        "/quit" | "/exit" => ConsoleCommand::Quit,
        other => return Err(ConsoleError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

/// One-line summary of a snapshot.
pub fn render(snapshot: &SessionSnapshot) -> String {
    let people: Vec<String> = snapshot
        .participants
        .values()
        .map(|p| {
            let mut entry = p.user_id.clone();
            if let Some(role) = p.role {
                entry.push_str(&format!(" {role}"));
            }
            if let Some(hr) = snapshot.heart_rates.get(&p.user_id) {
                entry.push_str(&format!(" {}bpm", hr.bpm));
            }
            entry
        })
        .collect();

    let mut line = format!(
        "[#{}] {:?} | phase {} | {} participant(s)",
        snapshot.revision,
        snapshot.connection,
        snapshot.meeting_phase,
        people.len()
    );
    if !people.is_empty() {
        line.push_str(&format!(" ({})", people.join(", ")));
    }
    if !snapshot.shared_context.is_empty() {
        line.push_str(&format!(" | context {}", Value::Object(snapshot.shared_context.clone())));
    }
    if let Some(last) = snapshot.messages.last() {
        line.push_str(&format!(" | last {}", last.kind));
    }
    line
}
