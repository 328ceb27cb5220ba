//! Event definitions for the application event loop.
//!
//! `DatabaseEvent` is what the supervisor reports about the database process;
//! every frontend sees the same stream. `Event` wraps it together with terminal
//! input, bridge requests and OS signals so a single loop can drive the app.

use crossterm::event::{KeyEvent, MouseEvent};
use serde_json::{json, Value};

use crate::bridge::Request;
use crate::output::LineSource;

/// Signals the shell forwards to the database or receives itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigInt,
    SigTerm,
}

/// Lifecycle notifications about the supervised database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseEvent {
    /// The process was spawned (or was already running).
    Started { pid: u32 },
    /// The readiness probe succeeded.
    Ready,
    /// One line of console output.
    Output { line: String, stream: LineSource },
    /// Launching or running the database failed.
    Error { message: String },
    /// The process is gone; `code` is `None` when it was killed by a signal.
    Stopped { code: Option<i32> },
}

impl DatabaseEvent {
    /// Wire name used by frontends.
    pub fn name(&self) -> &'static str {
        match self {
            DatabaseEvent::Started { .. } => "database:start",
            DatabaseEvent::Ready => "database:ready",
            DatabaseEvent::Output { .. } => "database:output",
            DatabaseEvent::Error { .. } => "database:error",
            DatabaseEvent::Stopped { .. } => "database:stop",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            DatabaseEvent::Output { line, .. } => Value::from(line.as_str()),
            DatabaseEvent::Error { message } => Value::from(message.as_str()),
            DatabaseEvent::Started { .. } | DatabaseEvent::Ready | DatabaseEvent::Stopped { .. } => {
                Value::Bool(true)
            }
        }
    }

    /// `{ "event": name, "payload": value }` as sent over the bridge.
    pub fn envelope(&self) -> Value {
        envelope(self.name(), self.payload())
    }
}

/// Builds an event envelope for any event name.
pub fn envelope(name: &str, payload: Value) -> Value {
    json!({ "event": name, "payload": payload })
}

/// Represents an event in the application's main event loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// Something happened to the database process.
    Database(DatabaseEvent),
    /// A keyboard event received from the user.
    Key(KeyEvent),
    /// A mouse event received from the user.
    Mouse(MouseEvent),
    /// The terminal window was resized.
    Resize,
    /// A command arrived over the JSON bridge.
    Request(Request),
    /// The shell should exit.
    Shutdown { signal: Option<ProcessSignal> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_events_carry_true_payload() {
        let started = DatabaseEvent::Started { pid: 42 }.envelope();
        assert_eq!(started, json!({"event": "database:start", "payload": true}));
        assert_eq!(
            DatabaseEvent::Stopped { code: Some(1) }.envelope()["payload"],
            Value::Bool(true)
        );
        assert_eq!(DatabaseEvent::Ready.name(), "database:ready");
    }

    #[test]
    fn output_and_error_carry_text() {
        let output = DatabaseEvent::Output {
            line: "Started web server".into(),
            stream: LineSource::Stderr,
        };
        assert_eq!(
            output.envelope(),
            json!({"event": "database:output", "payload": "Started web server"})
        );
        let error = DatabaseEvent::Error {
            message: "boom".into(),
        };
        assert_eq!(error.name(), "database:error");
        assert_eq!(error.payload(), Value::from("boom"));
    }
}
