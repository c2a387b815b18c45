//! The coordinator's parsed view of one inbound state record.
//!
//! A snapshot is built once per inbound line and never mutated afterwards;
//! callers share it behind an `Arc` so a reader always sees a complete record.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Parsed state record. Required protocol fields are typed; everything under
/// `game_state` stays in `payload` and is read by key with explicit presence
/// checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub ready_for_command: bool,
    pub in_session: bool,
    pub error: Option<String>,
    pub message: Option<String>,
    pub screen: Option<String>,
    pub available_commands: Vec<String>,
    pub payload: Map<String, Value>,
}

/// Wire shape of an inbound record.
#[derive(Debug, Deserialize)]
struct WireState {
    #[serde(default)]
    ready_for_command: bool,
    #[serde(default)]
    in_game: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<Value>,
    #[serde(default)]
    game_state: Option<Map<String, Value>>,
    /// Sent as `null` by some screens.
    #[serde(default)]
    available_commands: Option<Vec<String>>,
}

impl StateSnapshot {
    /// Parse one inbound line. Malformed content yields a snapshot carrying
    /// only `error`; it is reported as data, never raised.
    pub fn parse(line: &str) -> Self {
        match serde_json::from_str::<WireState>(line) {
            Ok(wire) => Self::from_wire(wire),
            Err(err) => Self::parse_failure(format!("parse error: {err}")),
        }
    }

    /// Snapshot standing in for a line that could not be parsed.
    pub fn parse_failure(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::default()
        }
    }

    fn from_wire(wire: WireState) -> Self {
        let payload = wire.game_state.unwrap_or_default();
        let screen = payload
            .get("screen_type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let message = wire.message.map(|value| match value {
            Value::String(text) => text,
            other => other.to_string(),
        });
        Self {
            ready_for_command: wire.ready_for_command,
            in_session: wire.in_game,
            error: wire.error,
            message,
            screen,
            available_commands: wire.available_commands.unwrap_or_default(),
            payload,
        }
    }

    /// False when the driven system reported an error; payload fields of an
    /// untrusted snapshot must not be relied on.
    pub fn is_trusted(&self) -> bool {
        self.error.is_none()
    }

    pub fn screen_is(&self, name: &str) -> bool {
        self.screen.as_deref() == Some(name)
    }

    /// Look up a payload field by JSON pointer relative to `game_state`
    /// (e.g. `/combat_state/player/energy`).
    pub fn field(&self, pointer: &str) -> Option<&Value> {
        let rest = pointer.strip_prefix('/')?;
        let (head, tail) = match rest.split_once('/') {
            Some((head, tail)) => (head, Some(tail)),
            None => (rest, None),
        };
        let root = self.payload.get(&unescape_token(head))?;
        match tail {
            Some(tail) => root.pointer(&format!("/{tail}")),
            None => Some(root),
        }
    }

    pub fn has_field(&self, pointer: &str) -> bool {
        self.field(pointer).is_some_and(|value| !value.is_null())
    }

    pub fn int_field(&self, pointer: &str) -> Option<i64> {
        self.field(pointer).and_then(Value::as_i64)
    }

    pub fn str_field(&self, pointer: &str) -> Option<&str> {
        self.field(pointer).and_then(Value::as_str)
    }

    /// Length of an array field. `None` when absent or not an array.
    pub fn len_field(&self, pointer: &str) -> Option<usize> {
        self.field(pointer).and_then(Value::as_array).map(Vec::len)
    }
}

fn unescape_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}
